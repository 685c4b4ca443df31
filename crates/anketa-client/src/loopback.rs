use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anketa_types::JoinCredential;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    ClientError, ClientResult, MediaConnection, MediaEvent, MediaRoom, MediaTransport,
    PlaybackHandle,
};

struct LoopbackMember {
    room: String,
    identity: String,
    events: mpsc::UnboundedSender<MediaEvent>,
}

#[derive(Default)]
struct LoopbackState {
    next_connection: AtomicU64,
    total_connects: AtomicU64,
    members: Mutex<BTreeMap<u64, LoopbackMember>>,
    captures: Mutex<HashSet<u64>>,
    attached_playback: AtomicUsize,
    deny_microphone: AtomicBool,
}

impl LoopbackState {
    fn members(&self) -> MutexGuard<'_, BTreeMap<u64, LoopbackMember>> {
        match self.members.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn captures(&self) -> MutexGuard<'_, HashSet<u64>> {
        match self.captures.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn leave(&self, connection: u64) {
        self.members().remove(&connection);
        self.captures().remove(&connection);
    }
}

/// In-process media transport with deterministic behavior.
///
/// Models the room server's membership rule: a participant identity is a
/// member of a room at most once, and a second join with the same identity
/// replaces the first connection.
#[derive(Clone, Default)]
pub struct LoopbackMediaTransport {
    state: Arc<LoopbackState>,
}

impl LoopbackMediaTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny_microphone(&self, deny: bool) {
        self.state.deny_microphone.store(deny, Ordering::SeqCst);
    }

    pub fn live_connections(&self) -> usize {
        self.state.members().len()
    }

    /// Identities currently joined to `room`.
    pub fn members(&self, room: &str) -> Vec<String> {
        self.state
            .members()
            .values()
            .filter(|member| member.room == room)
            .map(|member| member.identity.clone())
            .collect()
    }

    /// Connections currently publishing microphone audio.
    pub fn active_captures(&self) -> usize {
        self.state.captures().len()
    }

    pub fn attached_playback(&self) -> usize {
        self.state.attached_playback.load(Ordering::SeqCst)
    }

    pub fn total_connects(&self) -> u64 {
        self.state.total_connects.load(Ordering::SeqCst)
    }

    /// Delivers `event` to every live connection.
    pub fn emit(&self, event: MediaEvent) {
        for member in self.state.members().values() {
            let _ = member.events.send(event.clone());
        }
    }
}

#[async_trait]
impl MediaTransport for LoopbackMediaTransport {
    async fn connect(&self, credential: &JoinCredential) -> ClientResult<MediaConnection> {
        if credential.token.trim().is_empty() {
            return Err(ClientError::Credential("empty join token".to_string()));
        }
        let connection = self.state.next_connection.fetch_add(1, Ordering::SeqCst);
        self.state.total_connects.fetch_add(1, Ordering::SeqCst);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let replaced = {
            let mut members = self.state.members();
            let replaced = members
                .iter()
                .find(|(_, member)| {
                    member.room == credential.room && member.identity == credential.identity
                })
                .map(|(id, _)| *id);
            if let Some(previous) = replaced {
                if let Some(member) = members.remove(&previous) {
                    let _ = member.events.send(MediaEvent::Disconnected);
                }
            }
            let _ = events_tx.send(MediaEvent::Connected);
            members.insert(
                connection,
                LoopbackMember {
                    room: credential.room.clone(),
                    identity: credential.identity.clone(),
                    events: events_tx,
                },
            );
            replaced
        };
        if let Some(previous) = replaced {
            self.state.captures().remove(&previous);
        }

        Ok(MediaConnection {
            room: Arc::new(LoopbackRoom {
                connection,
                room: credential.room.clone(),
                state: Arc::clone(&self.state),
            }),
            events: events_rx,
        })
    }
}

struct LoopbackRoom {
    connection: u64,
    room: String,
    state: Arc<LoopbackState>,
}

#[async_trait]
impl MediaRoom for LoopbackRoom {
    fn room_name(&self) -> &str {
        &self.room
    }

    async fn publish_local_audio(&self) -> ClientResult<()> {
        if self.state.deny_microphone.load(Ordering::SeqCst) {
            return Err(ClientError::MediaPermission(
                "microphone access was denied".to_string(),
            ));
        }
        self.state.captures().insert(self.connection);
        Ok(())
    }

    async fn unpublish_local_audio(&self) {
        self.state.captures().remove(&self.connection);
    }

    async fn attach_remote_audio(&self, track_id: &str) -> ClientResult<Box<dyn PlaybackHandle>> {
        self.state.attached_playback.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(LoopbackPlayback {
            track_id: track_id.to_string(),
            detached: AtomicBool::new(false),
            state: Arc::clone(&self.state),
        }))
    }

    async fn disconnect(&self) {
        self.state.leave(self.connection);
    }
}

struct LoopbackPlayback {
    track_id: String,
    detached: AtomicBool,
    state: Arc<LoopbackState>,
}

impl PlaybackHandle for LoopbackPlayback {
    fn track_id(&self) -> &str {
        &self.track_id
    }

    fn detach(&self) {
        if !self.detached.swap(true, Ordering::SeqCst) {
            self.state.attached_playback.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
