// TillPulse client library
//
// Keeps a dashboard connected to the gateway: an SSE push channel with
// automatic reconnection, backed by periodic REST polling so the UI stays
// correct even while the push channel is down.

pub mod http;
pub mod manager;

pub use http::{HttpPollSource, SseTransport};
pub use manager::{
    ConnectionState, DashboardSnapshot, PollSource, PushTransport, ReconnectConfig,
    ReconnectManager,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("poll error: {0}")]
    Poll(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, ClientError>;
