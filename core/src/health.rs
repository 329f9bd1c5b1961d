// System health monitor
//
// Pure state tracker: records the latest connectivity state per watched
// dependency and relays edge-triggered status events to the dashboard
// rooms. Retry logic lives in the components that feed it.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tracing::info;

use crate::events::DashboardEvent;
use crate::hub::BroadcastHub;
use crate::model::{DependencyHealth, DependencyState, SystemStatus};

/// Dependency name used by the change-stream listener.
pub const CHANGE_FEED: &str = "change-feed";

pub struct HealthMonitor {
    hub: Arc<BroadcastHub>,
    // Rooms that receive system-status events on every state change.
    rooms: Vec<String>,
    dependencies: DashMap<String, DependencyHealth>,
}

impl HealthMonitor {
    pub fn new(hub: Arc<BroadcastHub>, rooms: Vec<String>) -> Self {
        Self {
            hub,
            rooms,
            dependencies: DashMap::new(),
        }
    }

    /// Records the latest state for a dependency.
    ///
    /// Edge-triggered: only an actual state change stamps a new timestamp
    /// and pushes a `system-status` event to the rooms. Repeated reports of
    /// the same state are no-ops.
    pub fn report(&self, dependency: &str, state: DependencyState) {
        let changed = {
            use dashmap::mapref::entry::Entry;
            match self.dependencies.entry(dependency.to_string()) {
                Entry::Occupied(mut entry) => {
                    if entry.get().state == state {
                        false
                    } else {
                        entry.insert(DependencyHealth {
                            state,
                            changed_at: Utc::now(),
                        });
                        true
                    }
                }
                Entry::Vacant(entry) => {
                    entry.insert(DependencyHealth {
                        state,
                        changed_at: Utc::now(),
                    });
                    true
                }
            }
            // Entry guard dropped here, before snapshot() re-reads the map.
        };

        if changed {
            info!(target: "health", dependency = %dependency, state = ?state, "dependency state changed");
            let status = self.snapshot();
            for room in &self.rooms {
                self.hub.publish(
                    room,
                    DashboardEvent::SystemStatus {
                        status: status.clone(),
                    },
                );
            }
        }
    }

    /// Current state of every watched dependency, for the health surface and
    /// catch-up queries.
    pub fn snapshot(&self) -> SystemStatus {
        SystemStatus {
            dependencies: self
                .dependencies
                .iter()
                .map(|entry| (entry.key().clone(), *entry.value()))
                .collect(),
        }
    }
}
