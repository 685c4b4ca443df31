use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anketa_core::current_unix_timestamp_ms;
use serde_json::Value;

use crate::{AgentSignal, AgentSignalHub};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveAgent {
    pub session_id: String,
    pub dispatched_unix_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Dispatched,
    /// An agent already serves the room; nothing was sent.
    AlreadyLive,
}

/// Tracks which rooms have a live agent so each room is dispatched at most once.
#[derive(Debug, Clone)]
pub struct AgentDispatchRegistry {
    live: Arc<Mutex<HashMap<String, LiveAgent>>>,
    dispatches: Arc<AtomicU64>,
    signals: AgentSignalHub,
}

impl AgentDispatchRegistry {
    pub fn new(signals: AgentSignalHub) -> Self {
        Self {
            live: Arc::new(Mutex::new(HashMap::new())),
            dispatches: Arc::new(AtomicU64::new(0)),
            signals,
        }
    }

    fn live(&self) -> MutexGuard<'_, HashMap<String, LiveAgent>> {
        match self.live.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Claims `room` for `session_id` and signals the agent process when the
    /// slot was free.
    pub fn ensure_dispatched(
        &self,
        session_id: &str,
        room: &str,
        settings: BTreeMap<String, Value>,
    ) -> DispatchOutcome {
        {
            let mut live = self.live();
            if live.contains_key(room) {
                return DispatchOutcome::AlreadyLive;
            }
            live.insert(
                room.to_string(),
                LiveAgent {
                    session_id: session_id.to_string(),
                    dispatched_unix_ms: current_unix_timestamp_ms(),
                },
            );
        }
        self.dispatches.fetch_add(1, Ordering::SeqCst);
        tracing::info!(session_id, room, "agent dispatched");
        self.signals.publish(AgentSignal::Dispatch {
            session_id: session_id.to_string(),
            room: room.to_string(),
            settings,
        });
        DispatchOutcome::Dispatched
    }

    /// Frees the room's slot. Returns whether an agent was live.
    pub fn release(&self, session_id: &str, room: &str) -> bool {
        let released = self.live().remove(room).is_some();
        if released {
            tracing::info!(session_id, room, "agent released");
            self.signals.publish(AgentSignal::Release {
                session_id: session_id.to_string(),
                room: room.to_string(),
            });
        }
        released
    }

    pub fn live_agent(&self, room: &str) -> Option<LiveAgent> {
        self.live().get(room).cloned()
    }

    pub fn live_rooms(&self) -> usize {
        self.live().len()
    }

    /// Dispatches issued since start.
    pub fn total_dispatches(&self) -> u64 {
        self.dispatches.load(Ordering::SeqCst)
    }
}
