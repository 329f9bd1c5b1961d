// Gateway-backed transport and poll source
//
// `SseTransport` consumes the gateway's `/api/stream` endpoint and turns
// SSE frames back into dashboard events; `HttpPollSource` assembles a full
// snapshot from the REST surface.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use tillpulse_core::events::{DashboardEvent, RoomEvent};
use tillpulse_core::model::{Alert, KpiSnapshot, SystemStatus, Transaction};
use tillpulse_core::period;

use crate::manager::{DashboardSnapshot, PollSource, PushTransport};
use crate::Result;

const STREAM_QUEUE: usize = 64;

/// [`PushTransport`] over the gateway's SSE stream.
///
/// The last seen sequence number survives reconnects, so broadcasts
/// replayed across a resubscribe are dropped instead of re-applied.
pub struct SseTransport {
    http: reqwest::Client,
    base_url: String,
    last_seq: Arc<Mutex<Option<u64>>>,
}

impl SseTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            last_seq: Arc::new(Mutex::new(None)),
        }
    }
}

#[async_trait]
impl PushTransport for SseTransport {
    async fn connect(&self) -> Result<mpsc::Receiver<DashboardEvent>> {
        let response = self
            .http
            .get(format!("{}/api/stream", self.base_url))
            .send()
            .await?
            .error_for_status()?;

        let (tx, rx) = mpsc::channel(STREAM_QUEUE);
        let last_seq = self.last_seq.clone();
        tokio::spawn(async move {
            let mut stream = Box::pin(response.bytes_stream());
            let mut buffer = String::new();

            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        warn!(target: "client", error = %e, "event stream read failed");
                        break;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(end) = buffer.find("\n\n") {
                    let frame: String = buffer[..end]
                        .lines()
                        .filter_map(|line| line.strip_prefix("data:"))
                        .map(str::trim_start)
                        .collect::<Vec<_>>()
                        .join("\n");
                    buffer.drain(..end + 2);
                    if frame.is_empty() {
                        continue; // keep-alive comment
                    }

                    let room_event: RoomEvent = match serde_json::from_str(&frame) {
                        Ok(event) => event,
                        Err(e) => {
                            warn!(target: "client", error = %e, "undecodable stream frame");
                            continue;
                        }
                    };
                    if is_stale(&last_seq, &room_event) {
                        debug!(target: "client", seq = room_event.seq, "dropping replayed event");
                        continue;
                    }
                    if tx.send(room_event.event).await.is_err() {
                        return; // manager went away
                    }
                }
            }
        });

        Ok(rx)
    }
}

/// Broadcast frames at or below the last seen sequence are replays.
///
/// Sync frames always pass and re-anchor the watermark to their own
/// sequence: a restarted server starts the room's sequence over, and a
/// watermark that only ratchets upward would discard every live broadcast
/// until the new sequence overtook the old one.
fn is_stale(last_seq: &Mutex<Option<u64>>, event: &RoomEvent) -> bool {
    let mut seen = match last_seq.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    if matches!(event.event, DashboardEvent::Sync { .. }) {
        *seen = Some(event.seq);
        return false;
    }
    let stale = seen.is_some_and(|s| event.seq <= s);
    if !stale {
        *seen = Some(event.seq);
    }
    stale
}

/// [`PollSource`] over the gateway's REST endpoints.
pub struct HttpPollSource {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct HealthBody {
    status: SystemStatus,
}

impl HttpPollSource {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let body = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(body)
    }
}

#[async_trait]
impl PollSource for HttpPollSource {
    async fn snapshot(&self) -> Result<DashboardSnapshot> {
        let window = period::today_window(Utc::now());
        let kpi_path = format!(
            "/api/kpis?start={}&end={}",
            window.start.to_rfc3339_opts(SecondsFormat::Millis, true),
            window.end.to_rfc3339_opts(SecondsFormat::Millis, true),
        );

        let kpis: KpiSnapshot = self.get_json(&kpi_path).await?;
        let transactions: Vec<Transaction> =
            self.get_json("/api/transactions/recent").await?;
        let alerts: Vec<Alert> = self.get_json("/api/alerts/active").await?;
        let health: HealthBody = self.get_json("/api/health").await?;

        Ok(DashboardSnapshot {
            kpis: Some(kpis),
            transactions,
            alerts,
            status: health.status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room_event(seq: u64, event: DashboardEvent) -> RoomEvent {
        RoomEvent {
            room: "admin-dashboard".to_string(),
            seq,
            observed_at: Utc::now(),
            event,
        }
    }

    fn sync(seq: u64) -> RoomEvent {
        room_event(
            seq,
            DashboardEvent::Sync {
                snapshot: None,
                status: SystemStatus::default(),
            },
        )
    }

    fn status(seq: u64) -> RoomEvent {
        room_event(
            seq,
            DashboardEvent::SystemStatus {
                status: SystemStatus::default(),
            },
        )
    }

    #[test]
    fn replayed_broadcasts_are_stale() {
        let seen = Mutex::new(None);

        assert!(!is_stale(&seen, &status(1)));
        assert!(!is_stale(&seen, &status(2)));
        assert!(is_stale(&seen, &status(2)));
        assert!(is_stale(&seen, &status(1)));
        assert!(!is_stale(&seen, &status(3)));
    }

    #[test]
    fn sync_re_anchors_the_watermark_after_a_sequence_restart() {
        let seen = Mutex::new(None);

        // Long-lived session deep into the room's sequence.
        assert!(!is_stale(&seen, &status(500)));

        // The server restarts; the reconnect sync carries a fresh, low
        // sequence and the live events that follow must not be dropped.
        assert!(!is_stale(&seen, &sync(0)));
        assert!(!is_stale(&seen, &status(1)));
        assert!(!is_stale(&seen, &status(2)));
    }

    #[test]
    fn sync_on_the_same_server_still_suppresses_replays() {
        let seen = Mutex::new(None);

        assert!(!is_stale(&seen, &status(7)));
        // Reconnect against the same server: sync carries the room's
        // current sequence, so replayed broadcasts stay suppressed.
        assert!(!is_stale(&seen, &sync(7)));
        assert!(is_stale(&seen, &status(7)));
        assert!(!is_stale(&seen, &status(8)));
    }
}
