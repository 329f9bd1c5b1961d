// Broadcast hub: room/session registry and fan-out
//
// The session registry is the only mutable shared structure in the engine.
// All mutation funnels through the DashMap entry for a room, so per-room
// delivery order matches publish order; across rooms no order is implied.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::events::{DashboardEvent, RoomEvent};
use crate::model::{KpiSnapshot, SystemStatus};

const DEFAULT_SESSION_QUEUE: usize = 256;

/// Per-room delivery statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HubStats {
    pub total_published: u64,
    pub total_delivered: u64,
    pub dropped_deliveries: u64,
    pub active_sessions: usize,
}

#[derive(Default)]
struct Room {
    // session_id -> outbound queue
    sessions: HashMap<String, mpsc::Sender<RoomEvent>>,
    // Stamped on every delivered event; strictly increasing per room.
    seq: u64,
    // Ticket counter handed to recomputes at schedule time.
    recompute_seq: u64,
    // Highest recompute ticket that actually published; older ones are stale.
    kpi_watermark: u64,
    last_observed_at: Option<DateTime<Utc>>,
    latest_kpi: Option<KpiSnapshot>,
    latest_status: Option<SystemStatus>,
    total_published: u64,
    total_delivered: u64,
    dropped_deliveries: u64,
}

impl Room {
    /// Observed-at timestamps never go backwards within a room, even if the
    /// wall clock does.
    fn stamp(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
        let ts = match self.last_observed_at {
            Some(prev) if prev > now => prev,
            _ => now,
        };
        self.last_observed_at = Some(ts);
        ts
    }

    /// Fan one event out to every session, non-blocking. Returns the ids of
    /// sessions whose queue was full or closed; those are evicted by the
    /// caller, never retried, and never block siblings.
    fn deliver(&mut self, room_name: &str, event: DashboardEvent) -> (u64, Vec<String>) {
        self.seq += 1;
        let observed_at = self.stamp(Utc::now());

        match &event {
            DashboardEvent::KpiUpdate { snapshot } => self.latest_kpi = Some(snapshot.clone()),
            DashboardEvent::SystemStatus { status } => self.latest_status = Some(status.clone()),
            _ => {}
        }

        let room_event = RoomEvent {
            room: room_name.to_string(),
            seq: self.seq,
            observed_at,
            event,
        };

        let mut delivered = 0u64;
        let mut dead = Vec::new();
        for (session_id, tx) in &self.sessions {
            if tx.try_send(room_event.clone()).is_ok() {
                delivered += 1;
            } else {
                dead.push(session_id.clone());
            }
        }

        self.total_published += 1;
        self.total_delivered += delivered;
        self.dropped_deliveries += dead.len() as u64;
        for id in &dead {
            self.sessions.remove(id);
        }

        (delivered, dead)
    }
}

/// Registry of dashboard sessions grouped into rooms, with ordered
/// best-effort fan-out.
pub struct BroadcastHub {
    rooms: DashMap<String, Room>,
    // session_id -> room name; a session is in at most one room
    session_index: DashMap<String, String>,
    queue_capacity: usize,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::with_queue_capacity(DEFAULT_SESSION_QUEUE)
    }

    /// Capacity of each session's outbound queue. A session that falls this
    /// far behind is treated as broken and evicted on the next publish.
    pub fn with_queue_capacity(queue_capacity: usize) -> Self {
        Self {
            rooms: DashMap::new(),
            session_index: DashMap::new(),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Registers a session in a room and returns its event queue.
    ///
    /// The first delivery on the queue is always a `sync` event carrying the
    /// room's latest KPI snapshot and system status; live events follow from
    /// the join point forward. Re-joining replaces any previous membership.
    pub fn join(&self, room: &str, session_id: &str) -> mpsc::Receiver<RoomEvent> {
        // A session lives in at most one room; drop any prior registration.
        self.leave(session_id);

        let (tx, rx) = mpsc::channel(self.queue_capacity);
        {
            let mut entry = self.rooms.entry(room.to_string()).or_default();
            let sync = RoomEvent {
                room: room.to_string(),
                // The sync carries the seq of the last published event so the
                // first live event after it always compares newer.
                seq: entry.seq,
                observed_at: entry.stamp(Utc::now()),
                event: DashboardEvent::Sync {
                    snapshot: entry.latest_kpi.clone(),
                    status: entry.latest_status.clone().unwrap_or_default(),
                },
            };
            // Fresh channel with capacity >= 1; this cannot fail.
            if tx.try_send(sync).is_err() {
                warn!(target: "hub", room = %room, session = %session_id, "failed to enqueue sync event");
            }
            entry.sessions.insert(session_id.to_string(), tx);
        }
        self.session_index
            .insert(session_id.to_string(), room.to_string());

        info!(target: "hub", room = %room, session = %session_id, "session joined");
        rx
    }

    /// Removes a session wherever it is registered. Idempotent; unknown ids
    /// are a no-op. Pending deliveries to the session are dropped, nothing
    /// else is cancelled.
    ///
    /// A room left empty with no published history is dropped from the
    /// registry; a room that has published keeps its entry so its sequence
    /// numbers stay monotonic across re-joins.
    pub fn leave(&self, session_id: &str) {
        if let Some((_, room)) = self.session_index.remove(session_id) {
            if let Some(mut entry) = self.rooms.get_mut(&room) {
                entry.sessions.remove(session_id);
            }
            self.rooms
                .remove_if(&room, |_, r| r.sessions.is_empty() && r.seq == 0);
            info!(target: "hub", room = %room, session = %session_id, "session left");
        }
    }

    /// Delivers `event` to every session currently in `room`, in publish
    /// order. Returns the number of successful deliveries. A slow or
    /// disconnected session is evicted instead of blocking the broadcast.
    pub fn publish(&self, room: &str, event: DashboardEvent) -> u64 {
        let kind = event.kind();
        let (delivered, dead) = {
            let mut entry = self.rooms.entry(room.to_string()).or_default();
            entry.deliver(room, event)
        };
        self.evict(room, kind, dead);
        debug!(target: "hub", room = %room, kind = %kind, delivered, "published event");
        delivered
    }

    /// Publishes a KPI snapshot with last-write-wins coalescing.
    ///
    /// `recompute_seq` is the ticket obtained from [`begin_recompute`] when
    /// the recompute was scheduled. If a newer recompute already published,
    /// this snapshot is stale and silently dropped: snapshots are
    /// idempotent recomputations, not deltas, so only the latest matters.
    ///
    /// [`begin_recompute`]: BroadcastHub::begin_recompute
    pub fn publish_kpi(&self, room: &str, snapshot: KpiSnapshot, recompute_seq: u64) -> bool {
        let (delivered, dead) = {
            let mut entry = self.rooms.entry(room.to_string()).or_default();
            if recompute_seq < entry.kpi_watermark {
                debug!(
                    target: "hub",
                    room = %room,
                    recompute_seq,
                    watermark = entry.kpi_watermark,
                    "dropping stale kpi snapshot"
                );
                return false;
            }
            entry.kpi_watermark = recompute_seq;
            entry.deliver(room, DashboardEvent::KpiUpdate { snapshot })
        };
        self.evict(room, "kpi-update", dead);
        debug!(target: "hub", room = %room, delivered, "published kpi update");
        true
    }

    /// Hands out the next recompute ticket for a room. Tickets are compared
    /// at publish time to resolve out-of-order recompute completions.
    pub fn begin_recompute(&self, room: &str) -> u64 {
        let mut entry = self.rooms.entry(room.to_string()).or_default();
        entry.recompute_seq += 1;
        entry.recompute_seq
    }

    /// Delivery stats for a room, if it has ever been published to or joined.
    pub fn stats(&self, room: &str) -> Option<HubStats> {
        self.rooms.get(room).map(|r| HubStats {
            total_published: r.total_published,
            total_delivered: r.total_delivered,
            dropped_deliveries: r.dropped_deliveries,
            active_sessions: r.sessions.len(),
        })
    }

    /// Total active sessions across all rooms.
    pub fn session_count(&self) -> usize {
        self.session_index.len()
    }

    /// Drops all rooms and sessions. Used at engine shutdown.
    pub fn clear(&self) {
        self.rooms.clear();
        self.session_index.clear();
    }

    fn evict(&self, room: &str, kind: &str, dead: Vec<String>) {
        for session_id in dead {
            self.session_index.remove(&session_id);
            warn!(
                target: "hub",
                room = %room,
                session = %session_id,
                kind = %kind,
                "delivery failed, session evicted"
            );
        }
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}
