use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

const AGENT_SIGNAL_CAPACITY: usize = 256;

/// Instructions the gateway broadcasts to the voice agent process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentSignal {
    /// Start an agent for a live room.
    Dispatch {
        session_id: String,
        room: String,
        settings: BTreeMap<String, Value>,
    },
    VoiceConfigUpdated {
        session_id: String,
        settings: BTreeMap<String, Value>,
    },
    /// Stop the agent and give the room slot back.
    Release { session_id: String, room: String },
    FinalizeNow { session_id: String },
}

impl AgentSignal {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Dispatch { .. } => "dispatch",
            Self::VoiceConfigUpdated { .. } => "voice_config_updated",
            Self::Release { .. } => "release",
            Self::FinalizeNow { .. } => "finalize_now",
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            Self::Dispatch { session_id, .. }
            | Self::VoiceConfigUpdated { session_id, .. }
            | Self::Release { session_id, .. }
            | Self::FinalizeNow { session_id } => session_id,
        }
    }
}

/// Fan-out of agent signals to every connected agent stream.
#[derive(Debug, Clone)]
pub struct AgentSignalHub {
    sender: broadcast::Sender<AgentSignal>,
}

impl Default for AgentSignalHub {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentSignalHub {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(AGENT_SIGNAL_CAPACITY);
        Self { sender }
    }

    /// Broadcasts `signal`; returns the number of live subscribers that got it.
    pub fn publish(&self, signal: AgentSignal) -> usize {
        tracing::debug!(
            kind = signal.kind(),
            session_id = signal.session_id(),
            "agent signal published"
        );
        self.sender.send(signal).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentSignal> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;

    use super::{AgentSignal, AgentSignalHub};

    #[tokio::test]
    async fn unit_published_signals_reach_every_subscriber() {
        let hub = AgentSignalHub::new();
        assert_eq!(
            hub.publish(AgentSignal::FinalizeNow {
                session_id: "s-0".to_string()
            }),
            0
        );

        let mut first = hub.subscribe();
        let mut second = hub.subscribe();
        let signal = AgentSignal::VoiceConfigUpdated {
            session_id: "s-1".to_string(),
            settings: BTreeMap::from([("speed".to_string(), json!(1.1))]),
        };
        assert_eq!(hub.publish(signal.clone()), 2);
        assert_eq!(first.recv().await.expect("first"), signal);
        assert_eq!(second.recv().await.expect("second"), signal);
    }

    #[test]
    fn unit_signal_wire_shape_is_tagged_by_kind() {
        let encoded = serde_json::to_value(AgentSignal::Release {
            session_id: "s-1".to_string(),
            room: "room-s-1".to_string(),
        })
        .expect("encode");
        assert_eq!(
            encoded,
            json!({"kind": "release", "session_id": "s-1", "room": "room-s-1"})
        );
    }
}
