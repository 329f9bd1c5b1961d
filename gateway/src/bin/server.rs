use std::sync::Arc;

use tracing_subscriber::fmt;

use tillpulse_core::listener::{ChannelFeed, ListenerConfig};
use tillpulse_core::{Engine, MemoryStore};
use tillpulse_gateway::{serve, GatewayConfig, GatewayState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    fmt().compact().init();

    let config = GatewayConfig::from_env();

    let store = Arc::new(MemoryStore::new());
    let feed = Arc::new(ChannelFeed::new());
    let listener_config = ListenerConfig {
        rooms: vec![config.room.clone()],
        ..ListenerConfig::default()
    };

    let mut engine = Engine::new(store.clone(), feed.clone(), listener_config);
    engine.start();

    let state = GatewayState {
        hub: engine.hub.clone(),
        health: engine.health.clone(),
        store,
        feed,
        room: config.room.clone(),
    };

    let result = tokio::select! {
        served = serve(config, state) => served.map_err(Into::into),
        _ = tokio::signal::ctrl_c() => Ok(()),
    };

    engine.shutdown().await;
    result
}
