//! Leaving and rejoining the live media room of a session.
//!
//! Every reconnect runs under one flow lock: tear down the old binding,
//! push editable voice settings, fetch a fresh join credential, connect,
//! wait for `Connected`, then decide whether to start capture.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anketa_types::{JoinCredential, SessionStatus};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::{ClientError, ClientResult, SessionApi, SessionNotice};

/// Events a media connection reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    Connected,
    Disconnected,
    Reconnecting,
    Reconnected,
    TrackSubscribed { track_id: String },
    TrackUnsubscribed { track_id: String },
    DataReceived { payload: Vec<u8> },
    TranscriptionReceived {
        participant: String,
        text: String,
        is_final: bool,
    },
}

/// A remote audio track attached to local playback.
pub trait PlaybackHandle: Send + Sync {
    fn track_id(&self) -> &str;
    fn detach(&self);
}

#[async_trait]
pub trait MediaRoom: Send + Sync {
    fn room_name(&self) -> &str;
    /// Starts microphone capture and publishes it. Fails with
    /// `ClientError::MediaPermission` when the microphone is unavailable.
    async fn publish_local_audio(&self) -> ClientResult<()>;
    async fn unpublish_local_audio(&self);
    async fn attach_remote_audio(&self, track_id: &str) -> ClientResult<Box<dyn PlaybackHandle>>;
    async fn disconnect(&self);
}

pub struct MediaConnection {
    pub room: Arc<dyn MediaRoom>,
    pub events: mpsc::UnboundedReceiver<MediaEvent>,
}

#[async_trait]
pub trait MediaTransport: Send + Sync {
    async fn connect(&self, credential: &JoinCredential) -> ClientResult<MediaConnection>;
}

/// Why the view is connecting; each reason has its own capture policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectReason {
    /// First connection of a freshly created session.
    Created,
    /// Rejoining an existing session after pause, navigation or loss.
    Resumed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub auto_start_on_create: bool,
    pub auto_resume_on_reconnect: bool,
    pub connect_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            auto_start_on_create: true,
            auto_resume_on_reconnect: true,
            connect_timeout: Duration::from_secs(15),
        }
    }
}

impl ReconnectPolicy {
    fn allows_capture(&self, reason: ConnectReason) -> bool {
        match reason {
            ConnectReason::Created => self.auto_start_on_create,
            ConnectReason::Resumed => self.auto_resume_on_reconnect,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureDecision {
    Started,
    /// Authoritative status is `paused`; the paused affordance is shown instead.
    StatusPaused,
    PauseRequested,
    AlreadyActive,
    PolicyDisabled,
    PermissionDenied,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectReport {
    /// The status does not allow a live connection; only teardown ran.
    Skipped { status: SessionStatus },
    Connected {
        room: String,
        identity: String,
        capture: CaptureDecision,
    },
}

type PlaybackMap = Arc<Mutex<HashMap<String, Box<dyn PlaybackHandle>>>>;
type BindingSlot = Arc<Mutex<Option<VoiceRoomBinding>>>;

struct VoiceRoomBinding {
    /// Distinguishes this binding from later ones in the same slot.
    generation: u64,
    room: Arc<dyn MediaRoom>,
    playback: PlaybackMap,
    capture_active: bool,
    /// Capture was on when the transport started reconnecting.
    resume_capture: bool,
    pump: Option<JoinHandle<()>>,
}

impl VoiceRoomBinding {
    async fn teardown(mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
            let _ = pump.await;
        }
        self.release().await;
    }

    /// Detaches playback, stops capture and leaves the room. The pump, if
    /// still attached, is left to finish on its own.
    async fn release(self) {
        for (_, handle) in self.playback.lock().await.drain() {
            handle.detach();
        }
        if self.capture_active {
            self.room.unpublish_local_audio().await;
        }
        self.room.disconnect().await;
    }
}

fn current_binding(
    slot: &mut Option<VoiceRoomBinding>,
    generation: u64,
) -> Option<&mut VoiceRoomBinding> {
    slot.as_mut().filter(|binding| binding.generation == generation)
}

pub struct ReconnectCoordinator {
    api: Arc<dyn SessionApi>,
    transport: Arc<dyn MediaTransport>,
    policy: ReconnectPolicy,
    flow: Mutex<()>,
    binding: BindingSlot,
    next_generation: AtomicU64,
    pause_requested: Arc<AtomicBool>,
    notices: broadcast::Sender<SessionNotice>,
}

impl ReconnectCoordinator {
    pub fn new(
        api: Arc<dyn SessionApi>,
        transport: Arc<dyn MediaTransport>,
        policy: ReconnectPolicy,
        notices: broadcast::Sender<SessionNotice>,
    ) -> Self {
        Self {
            api,
            transport,
            policy,
            flow: Mutex::new(()),
            binding: Arc::new(Mutex::new(None)),
            next_generation: AtomicU64::new(1),
            pause_requested: Arc::new(AtomicBool::new(false)),
            notices,
        }
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Records a user pause so an in-flight reconnect does not start capture.
    pub fn request_pause(&self) {
        self.pause_requested.store(true, Ordering::SeqCst);
    }

    pub fn clear_pause_request(&self) {
        self.pause_requested.store(false, Ordering::SeqCst);
    }

    pub fn pause_requested(&self) -> bool {
        self.pause_requested.load(Ordering::SeqCst)
    }

    /// Whether a live binding exists. A lost connection drops its binding.
    pub async fn is_connected(&self) -> bool {
        self.binding.lock().await.is_some()
    }

    pub async fn capture_active(&self) -> bool {
        self.binding
            .lock()
            .await
            .as_ref()
            .is_some_and(|binding| binding.capture_active)
    }

    pub async fn playback_tracks(&self) -> Vec<String> {
        let playback = match self.binding.lock().await.as_ref() {
            Some(binding) => Arc::clone(&binding.playback),
            None => return Vec::new(),
        };
        let mut tracks = playback.lock().await.keys().cloned().collect::<Vec<_>>();
        tracks.sort();
        tracks
    }

    /// Stops capture while keeping the room connected. Returns whether capture was on.
    pub async fn stop_capture(&self) -> bool {
        let mut slot = self.binding.lock().await;
        let Some(binding) = slot.as_mut() else {
            return false;
        };
        binding.resume_capture = false;
        if !binding.capture_active {
            return false;
        }
        binding.room.unpublish_local_audio().await;
        binding.capture_active = false;
        true
    }

    /// Fully tears down the current binding. Idempotent and infallible.
    pub async fn teardown(&self) {
        let _flow = self.flow.lock().await;
        self.teardown_binding().await;
    }

    async fn teardown_binding(&self) {
        let binding = self.binding.lock().await.take();
        if let Some(binding) = binding {
            tracing::debug!(room = binding.room.room_name(), "tearing down voice room binding");
            binding.teardown().await;
        }
    }

    /// Leaves any previous room and rejoins with a fresh credential.
    ///
    /// `credential` skips the join request when the caller already holds a
    /// freshly minted one (for example from a resume response).
    pub async fn reconnect(
        &self,
        session_id: &str,
        status: SessionStatus,
        editable: &BTreeMap<String, Value>,
        reason: ConnectReason,
        credential: Option<JoinCredential>,
    ) -> ClientResult<ReconnectReport> {
        let _flow = self.flow.lock().await;
        self.teardown_binding().await;

        if !status.allows_live_connection() {
            return Ok(ReconnectReport::Skipped { status });
        }

        if !editable.is_empty() {
            match self.api.update_voice_config(session_id, editable).await {
                Ok(_) => {}
                Err(error) if error.is_not_found() => return Err(error),
                Err(error) => {
                    tracing::warn!(session_id, error = %error, "voice settings push failed");
                }
            }
        }

        let credential = match credential {
            Some(credential) => credential,
            None => self
                .api
                .request_join(session_id)
                .await
                .map_err(|error| match error {
                    ClientError::NotFound(_) | ClientError::Credential(_) => error,
                    other => ClientError::Credential(other.to_string()),
                })?,
        };

        let MediaConnection { room, mut events } = self.transport.connect(&credential).await?;
        let playback: PlaybackMap = Arc::new(Mutex::new(HashMap::new()));

        let connected = tokio::time::timeout(self.policy.connect_timeout, async {
            while let Some(event) = events.recv().await {
                if event == MediaEvent::Connected {
                    return true;
                }
                handle_media_event(&room, &playback, &self.notices, event).await;
            }
            false
        })
        .await;
        if !matches!(connected, Ok(true)) {
            for (_, handle) in playback.lock().await.drain() {
                handle.detach();
            }
            room.disconnect().await;
            return Err(ClientError::Media(format!(
                "room '{}' did not report connected",
                credential.room
            )));
        }

        // Capture is decided under the binding lock so a concurrent
        // `stop_capture` either sees the published stream or runs first.
        // The pump is spawned under the same lock and finds its binding.
        let mut slot = self.binding.lock().await;
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let pump = tokio::spawn(
            MediaEventPump {
                generation,
                slot: Arc::clone(&self.binding),
                room: Arc::clone(&room),
                playback: Arc::clone(&playback),
                pause_requested: Arc::clone(&self.pause_requested),
                notices: self.notices.clone(),
            }
            .run(events),
        );
        let mut binding = VoiceRoomBinding {
            generation,
            room: Arc::clone(&room),
            playback,
            capture_active: false,
            resume_capture: false,
            pump: Some(pump),
        };
        let mut capture = self.capture_decision(status, reason, binding.capture_active);
        if capture == CaptureDecision::Started {
            match room.publish_local_audio().await {
                Ok(()) => binding.capture_active = true,
                Err(ClientError::MediaPermission(message)) => {
                    tracing::warn!(session_id, "microphone permission denied");
                    let _ = self
                        .notices
                        .send(SessionNotice::MediaPermissionDenied(message));
                    capture = CaptureDecision::PermissionDenied;
                }
                Err(error) => {
                    drop(slot);
                    binding.teardown().await;
                    return Err(error);
                }
            }
        }
        *slot = Some(binding);
        drop(slot);

        tracing::info!(
            session_id,
            room = %credential.room,
            ?reason,
            ?capture,
            "voice room connected"
        );
        Ok(ReconnectReport::Connected {
            room: credential.room,
            identity: credential.identity,
            capture,
        })
    }

    fn capture_decision(
        &self,
        status: SessionStatus,
        reason: ConnectReason,
        capture_active: bool,
    ) -> CaptureDecision {
        if status == SessionStatus::Paused {
            return CaptureDecision::StatusPaused;
        }
        if self.pause_requested() {
            return CaptureDecision::PauseRequested;
        }
        if capture_active {
            return CaptureDecision::AlreadyActive;
        }
        if !self.policy.allows_capture(reason) {
            return CaptureDecision::PolicyDisabled;
        }
        CaptureDecision::Started
    }
}

/// Drains one connection's events for the lifetime of its binding.
struct MediaEventPump {
    generation: u64,
    slot: BindingSlot,
    room: Arc<dyn MediaRoom>,
    playback: PlaybackMap,
    pause_requested: Arc<AtomicBool>,
    notices: broadcast::Sender<SessionNotice>,
}

impl MediaEventPump {
    async fn run(self, mut events: mpsc::UnboundedReceiver<MediaEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                MediaEvent::Disconnected => break,
                MediaEvent::Reconnecting => self.on_reconnecting().await,
                MediaEvent::Reconnected => self.on_reconnected().await,
                other => {
                    handle_media_event(&self.room, &self.playback, &self.notices, other).await;
                }
            }
        }
        self.on_connection_lost().await;
    }

    /// Drops the dead binding so the next reconnect starts from scratch.
    async fn on_connection_lost(&self) {
        let lost = {
            let mut slot = self.slot.lock().await;
            if current_binding(&mut slot, self.generation).is_some() {
                slot.take()
            } else {
                None
            }
        };
        let Some(binding) = lost else {
            return;
        };
        tracing::warn!(room = self.room.room_name(), "voice room connection lost");
        binding.release().await;
        let _ = self.notices.send(SessionNotice::ConnectionLost);
    }

    async fn on_reconnecting(&self) {
        {
            let mut slot = self.slot.lock().await;
            if let Some(binding) = current_binding(&mut slot, self.generation) {
                if binding.capture_active {
                    binding.room.unpublish_local_audio().await;
                    binding.capture_active = false;
                    binding.resume_capture = true;
                }
            }
        }
        let _ = self.notices.send(SessionNotice::Reconnecting);
    }

    /// Republishes capture that was on before the interruption unless a
    /// pause was requested meanwhile.
    async fn on_reconnected(&self) {
        let capture = {
            let mut slot = self.slot.lock().await;
            match current_binding(&mut slot, self.generation) {
                Some(binding) => self.resume_capture(binding).await,
                None => None,
            }
        };
        tracing::info!(room = self.room.room_name(), ?capture, "voice room reconnected");
        let _ = self.notices.send(SessionNotice::Reconnected);
    }

    /// `None` when capture was off before the interruption or could not be
    /// republished.
    async fn resume_capture(&self, binding: &mut VoiceRoomBinding) -> Option<CaptureDecision> {
        let wanted = std::mem::take(&mut binding.resume_capture);
        if self.pause_requested.load(Ordering::SeqCst) {
            return Some(CaptureDecision::PauseRequested);
        }
        if binding.capture_active {
            return Some(CaptureDecision::AlreadyActive);
        }
        if !wanted {
            return None;
        }
        match binding.room.publish_local_audio().await {
            Ok(()) => {
                binding.capture_active = true;
                Some(CaptureDecision::Started)
            }
            Err(ClientError::MediaPermission(message)) => {
                let _ = self
                    .notices
                    .send(SessionNotice::MediaPermissionDenied(message));
                Some(CaptureDecision::PermissionDenied)
            }
            Err(error) => {
                tracing::warn!(error = %error, "capture republish failed after reconnect");
                let _ = self.notices.send(SessionNotice::MediaFailed(error.to_string()));
                None
            }
        }
    }
}

async fn handle_media_event(
    room: &Arc<dyn MediaRoom>,
    playback: &PlaybackMap,
    notices: &broadcast::Sender<SessionNotice>,
    event: MediaEvent,
) {
    match event {
        MediaEvent::Connected => {}
        MediaEvent::TrackSubscribed { track_id } => {
            match room.attach_remote_audio(&track_id).await {
                Ok(handle) => {
                    if let Some(previous) = playback.lock().await.insert(track_id, handle) {
                        previous.detach();
                    }
                }
                Err(error) => {
                    tracing::warn!(track_id = %track_id, error = %error, "remote audio attach failed");
                }
            }
        }
        MediaEvent::TrackUnsubscribed { track_id } => {
            if let Some(handle) = playback.lock().await.remove(&track_id) {
                handle.detach();
            }
        }
        MediaEvent::Disconnected => {
            let _ = notices.send(SessionNotice::ConnectionLost);
        }
        MediaEvent::Reconnecting => {
            let _ = notices.send(SessionNotice::Reconnecting);
        }
        MediaEvent::Reconnected => {
            let _ = notices.send(SessionNotice::Reconnected);
        }
        MediaEvent::DataReceived { payload } => {
            let _ = notices.send(SessionNotice::AgentData(payload));
        }
        MediaEvent::TranscriptionReceived {
            participant,
            text,
            is_final,
        } => {
            let _ = notices.send(SessionNotice::Transcription {
                participant,
                text,
                is_final,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use anketa_types::{
        AnketaRecord, DialogueEntry, DialogueRole, JoinCredential, NewSession, PollSnapshot,
        ResumeGrant, SessionRecord, SessionStatus, StatusChange, VoiceConfig,
    };
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tokio::sync::broadcast;

    use super::{
        CaptureDecision, ConnectReason, MediaEvent, ReconnectCoordinator, ReconnectPolicy,
        ReconnectReport,
    };
    use crate::{ClientError, ClientResult, LoopbackMediaTransport, SessionApi, SessionNotice};

    #[derive(Default)]
    struct JoinOnlyApi {
        joins: AtomicUsize,
        settings_pushes: AtomicUsize,
        fail_join: bool,
    }

    fn unused<T>() -> ClientResult<T> {
        Err(ClientError::InvalidResponse("unused in reconnect tests".to_string()))
    }

    #[async_trait]
    impl SessionApi for JoinOnlyApi {
        async fn create_session(&self, _input: &NewSession) -> ClientResult<SessionRecord> {
            unused()
        }
        async fn get_session(&self, _session_id: &str) -> ClientResult<SessionRecord> {
            unused()
        }
        async fn get_session_by_link(&self, _access_link: &str) -> ClientResult<SessionRecord> {
            unused()
        }
        async fn poll(&self, _session_id: &str) -> ClientResult<PollSnapshot> {
            unused()
        }
        async fn save_anketa(
            &self,
            _session_id: &str,
            _anketa: &AnketaRecord,
        ) -> ClientResult<AnketaRecord> {
            unused()
        }
        async fn update_voice_config(
            &self,
            _session_id: &str,
            editable: &BTreeMap<String, Value>,
        ) -> ClientResult<VoiceConfig> {
            self.settings_pushes.fetch_add(1, Ordering::SeqCst);
            Ok(VoiceConfig {
                locked: BTreeMap::new(),
                editable: editable.clone(),
            })
        }
        async fn append_dialogue(
            &self,
            _session_id: &str,
            _role: DialogueRole,
            _content: &str,
        ) -> ClientResult<DialogueEntry> {
            unused()
        }
        async fn request_join(&self, session_id: &str) -> ClientResult<JoinCredential> {
            if self.fail_join {
                return Err(ClientError::Transient("signer timeout".to_string()));
            }
            let n = self.joins.fetch_add(1, Ordering::SeqCst);
            Ok(JoinCredential {
                session_id: session_id.to_string(),
                room: format!("room-{session_id}"),
                identity: format!("client-{session_id}"),
                server_url: "loopback://media".to_string(),
                token: format!("token-{n}"),
                expires_unix: u64::MAX,
            })
        }
        async fn pause(&self, _session_id: &str) -> ClientResult<StatusChange> {
            unused()
        }
        async fn resume(&self, _session_id: &str) -> ClientResult<ResumeGrant> {
            unused()
        }
        async fn end(&self, _session_id: &str) -> ClientResult<StatusChange> {
            unused()
        }
        async fn confirm(&self, _session_id: &str) -> ClientResult<StatusChange> {
            unused()
        }
        async fn decline(&self, _session_id: &str) -> ClientResult<StatusChange> {
            unused()
        }
    }

    fn build_coordinator(
        api: Arc<JoinOnlyApi>,
        transport: &LoopbackMediaTransport,
        policy: ReconnectPolicy,
    ) -> (ReconnectCoordinator, broadcast::Receiver<SessionNotice>) {
        let (notices, receiver) = broadcast::channel(32);
        (
            ReconnectCoordinator::new(api, Arc::new(transport.clone()), policy, notices),
            receiver,
        )
    }

    fn settings() -> BTreeMap<String, Value> {
        BTreeMap::from([("voice_speed".to_string(), json!(1.1))])
    }

    #[tokio::test]
    async fn functional_active_session_connects_and_starts_capture() {
        let api = Arc::new(JoinOnlyApi::default());
        let transport = LoopbackMediaTransport::new();
        let (coordinator, _notices) =
            build_coordinator(Arc::clone(&api), &transport, ReconnectPolicy::default());

        let report = coordinator
            .reconnect("s-1", SessionStatus::Active, &settings(), ConnectReason::Resumed, None)
            .await
            .expect("reconnect");
        assert_eq!(
            report,
            ReconnectReport::Connected {
                room: "room-s-1".to_string(),
                identity: "client-s-1".to_string(),
                capture: CaptureDecision::Started
            }
        );
        assert!(coordinator.capture_active().await);
        assert_eq!(transport.active_captures(), 1);
        assert_eq!(api.settings_pushes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn regression_paused_status_connects_without_capture() {
        let api = Arc::new(JoinOnlyApi::default());
        let transport = LoopbackMediaTransport::new();
        let (coordinator, _notices) =
            build_coordinator(Arc::clone(&api), &transport, ReconnectPolicy::default());

        let report = coordinator
            .reconnect("s-1", SessionStatus::Paused, &BTreeMap::new(), ConnectReason::Resumed, None)
            .await
            .expect("reconnect");
        assert!(matches!(
            report,
            ReconnectReport::Connected {
                capture: CaptureDecision::StatusPaused,
                ..
            }
        ));
        assert!(coordinator.is_connected().await);
        assert_eq!(transport.active_captures(), 0);
        assert_eq!(api.settings_pushes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unit_capture_policy_is_separate_for_created_and_resumed() {
        let api = Arc::new(JoinOnlyApi::default());
        let transport = LoopbackMediaTransport::new();
        let policy = ReconnectPolicy {
            auto_start_on_create: true,
            auto_resume_on_reconnect: false,
            ..ReconnectPolicy::default()
        };
        let (coordinator, _notices) = build_coordinator(api, &transport, policy);

        let created = coordinator
            .reconnect("s-1", SessionStatus::Active, &BTreeMap::new(), ConnectReason::Created, None)
            .await
            .expect("created");
        let resumed = coordinator
            .reconnect("s-1", SessionStatus::Active, &BTreeMap::new(), ConnectReason::Resumed, None)
            .await
            .expect("resumed");
        assert!(matches!(
            created,
            ReconnectReport::Connected {
                capture: CaptureDecision::Started,
                ..
            }
        ));
        assert!(matches!(
            resumed,
            ReconnectReport::Connected {
                capture: CaptureDecision::PolicyDisabled,
                ..
            }
        ));
        assert_eq!(transport.active_captures(), 0);
    }

    #[tokio::test]
    async fn integration_two_quick_reconnects_leave_one_membership_and_one_capture() {
        let api = Arc::new(JoinOnlyApi::default());
        let transport = LoopbackMediaTransport::new();
        let (coordinator, _notices) =
            build_coordinator(Arc::clone(&api), &transport, ReconnectPolicy::default());
        let coordinator = Arc::new(coordinator);

        let first = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                coordinator
                    .reconnect("s-1", SessionStatus::Active, &BTreeMap::new(), ConnectReason::Resumed, None)
                    .await
            })
        };
        let second = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                coordinator
                    .reconnect("s-1", SessionStatus::Active, &BTreeMap::new(), ConnectReason::Resumed, None)
                    .await
            })
        };
        first.await.expect("join").expect("first");
        second.await.expect("join").expect("second");

        assert_eq!(api.joins.load(Ordering::SeqCst), 2);
        assert_eq!(transport.live_connections(), 1);
        assert_eq!(transport.members("room-s-1"), vec!["client-s-1".to_string()]);
        assert_eq!(transport.active_captures(), 1);
    }

    #[tokio::test]
    async fn functional_teardown_detaches_playback_and_disconnects() {
        let api = Arc::new(JoinOnlyApi::default());
        let transport = LoopbackMediaTransport::new();
        let (coordinator, _notices) = build_coordinator(api, &transport, ReconnectPolicy::default());
        coordinator
            .reconnect("s-1", SessionStatus::Active, &BTreeMap::new(), ConnectReason::Resumed, None)
            .await
            .expect("reconnect");

        transport.emit(MediaEvent::TrackSubscribed {
            track_id: "agent-audio".to_string(),
        });
        while coordinator.playback_tracks().await.is_empty() {
            tokio::task::yield_now().await;
        }
        assert_eq!(transport.attached_playback(), 1);

        coordinator.teardown().await;
        coordinator.teardown().await;
        assert!(!coordinator.is_connected().await);
        assert_eq!(transport.attached_playback(), 0);
        assert_eq!(transport.live_connections(), 0);
        assert_eq!(transport.active_captures(), 0);
    }

    #[tokio::test]
    async fn regression_pause_request_blocks_capture_and_join_failure_is_credential_error() {
        let api = Arc::new(JoinOnlyApi::default());
        let transport = LoopbackMediaTransport::new();
        let (coordinator, _notices) =
            build_coordinator(Arc::clone(&api), &transport, ReconnectPolicy::default());
        coordinator.request_pause();
        let report = coordinator
            .reconnect("s-1", SessionStatus::Active, &BTreeMap::new(), ConnectReason::Resumed, None)
            .await
            .expect("reconnect");
        assert!(matches!(
            report,
            ReconnectReport::Connected {
                capture: CaptureDecision::PauseRequested,
                ..
            }
        ));

        let failing = Arc::new(JoinOnlyApi {
            fail_join: true,
            ..JoinOnlyApi::default()
        });
        let (coordinator, _notices) = build_coordinator(failing, &transport, ReconnectPolicy::default());
        let error = coordinator
            .reconnect("s-2", SessionStatus::Active, &BTreeMap::new(), ConnectReason::Resumed, None)
            .await
            .expect_err("credential failure");
        assert!(matches!(error, ClientError::Credential(_)));
        assert!(!coordinator.is_connected().await);
    }

    #[tokio::test]
    async fn functional_microphone_denial_is_reported_distinctly() {
        let api = Arc::new(JoinOnlyApi::default());
        let transport = LoopbackMediaTransport::new();
        transport.deny_microphone(true);
        let (coordinator, mut notices) = build_coordinator(api, &transport, ReconnectPolicy::default());

        let report = coordinator
            .reconnect("s-1", SessionStatus::Active, &BTreeMap::new(), ConnectReason::Created, None)
            .await
            .expect("reconnect");
        assert!(matches!(
            report,
            ReconnectReport::Connected {
                capture: CaptureDecision::PermissionDenied,
                ..
            }
        ));
        assert!(matches!(
            notices.recv().await.expect("notice"),
            SessionNotice::MediaPermissionDenied(_)
        ));
        assert!(coordinator.is_connected().await);
    }

    #[tokio::test]
    async fn unit_terminal_status_skips_connection() {
        let api = Arc::new(JoinOnlyApi::default());
        let transport = LoopbackMediaTransport::new();
        let (coordinator, _notices) =
            build_coordinator(Arc::clone(&api), &transport, ReconnectPolicy::default());
        let report = coordinator
            .reconnect("s-1", SessionStatus::Reviewing, &settings(), ConnectReason::Resumed, None)
            .await
            .expect("reconnect");
        assert_eq!(
            report,
            ReconnectReport::Skipped {
                status: SessionStatus::Reviewing
            }
        );
        assert_eq!(api.joins.load(Ordering::SeqCst), 0);
        assert_eq!(transport.total_connects(), 0);
    }

    async fn wait_for_notice(
        notices: &mut broadcast::Receiver<SessionNotice>,
        expected: SessionNotice,
    ) {
        loop {
            let notice = tokio::time::timeout(std::time::Duration::from_secs(5), notices.recv())
                .await
                .expect("notice before deadline")
                .expect("notice channel open");
            if notice == expected {
                return;
            }
        }
    }

    #[tokio::test]
    async fn regression_lost_connection_drops_binding_until_rejoin() {
        let api = Arc::new(JoinOnlyApi::default());
        let transport = LoopbackMediaTransport::new();
        let (coordinator, mut notices) =
            build_coordinator(Arc::clone(&api), &transport, ReconnectPolicy::default());
        coordinator
            .reconnect("s-1", SessionStatus::Active, &BTreeMap::new(), ConnectReason::Resumed, None)
            .await
            .expect("reconnect");
        assert_eq!(transport.active_captures(), 1);

        transport.emit(MediaEvent::Disconnected);
        wait_for_notice(&mut notices, SessionNotice::ConnectionLost).await;
        assert!(!coordinator.is_connected().await);
        assert!(!coordinator.capture_active().await);
        assert_eq!(transport.live_connections(), 0);
        assert_eq!(transport.active_captures(), 0);

        let report = coordinator
            .reconnect("s-1", SessionStatus::Active, &BTreeMap::new(), ConnectReason::Resumed, None)
            .await
            .expect("rejoin");
        assert!(matches!(
            report,
            ReconnectReport::Connected {
                capture: CaptureDecision::Started,
                ..
            }
        ));
        assert_eq!(transport.total_connects(), 2);
        assert_eq!(transport.live_connections(), 1);
        assert_eq!(transport.active_captures(), 1);
    }

    #[tokio::test]
    async fn functional_transport_reconnect_restores_capture_unless_paused() {
        let api = Arc::new(JoinOnlyApi::default());
        let transport = LoopbackMediaTransport::new();
        let (coordinator, mut notices) =
            build_coordinator(Arc::clone(&api), &transport, ReconnectPolicy::default());
        coordinator
            .reconnect("s-1", SessionStatus::Active, &BTreeMap::new(), ConnectReason::Resumed, None)
            .await
            .expect("reconnect");

        transport.emit(MediaEvent::Reconnecting);
        wait_for_notice(&mut notices, SessionNotice::Reconnecting).await;
        assert_eq!(transport.active_captures(), 0);
        transport.emit(MediaEvent::Reconnected);
        wait_for_notice(&mut notices, SessionNotice::Reconnected).await;
        assert!(coordinator.capture_active().await);
        assert_eq!(transport.active_captures(), 1);

        transport.emit(MediaEvent::Reconnecting);
        wait_for_notice(&mut notices, SessionNotice::Reconnecting).await;
        coordinator.request_pause();
        transport.emit(MediaEvent::Reconnected);
        wait_for_notice(&mut notices, SessionNotice::Reconnected).await;
        assert!(coordinator.is_connected().await);
        assert!(!coordinator.capture_active().await);
        assert_eq!(transport.active_captures(), 0);
        assert_eq!(transport.total_connects(), 1);
    }

    #[tokio::test]
    async fn unit_reconnected_without_prior_capture_keeps_capture_off() {
        let api = Arc::new(JoinOnlyApi::default());
        let transport = LoopbackMediaTransport::new();
        let (coordinator, mut notices) =
            build_coordinator(Arc::clone(&api), &transport, ReconnectPolicy::default());
        coordinator
            .reconnect("s-1", SessionStatus::Paused, &BTreeMap::new(), ConnectReason::Resumed, None)
            .await
            .expect("reconnect");

        transport.emit(MediaEvent::Reconnecting);
        transport.emit(MediaEvent::Reconnected);
        wait_for_notice(&mut notices, SessionNotice::Reconnected).await;
        assert!(coordinator.is_connected().await);
        assert_eq!(transport.active_captures(), 0);
    }
}
