use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anketa_session::StatusAffordances;
use anketa_types::{FieldValue, PollSnapshot, SessionStatus, VoiceConfig};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::{
    start_session_poller, ClientError, ClientResult, ConnectReason, FlushOutcome, FormModel,
    MediaTransport, PollObserver, PollerConfig, PollerHandle, PollerSignals, ReconnectCoordinator,
    ReconnectPolicy, ReconnectReport, SaveDebounceConfig, SaveDebouncer, SessionApi,
};

const NOTICE_CAPACITY: usize = 64;

/// Things a session view surfaces to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionNotice {
    StatusChanged(SessionStatus),
    FieldsFilled {
        fields: Vec<String>,
        scroll_target: Option<String>,
    },
    /// Non-blocking; the view keeps showing stale data.
    PollWarning {
        consecutive_failures: u32,
        message: String,
    },
    NotFound,
    CredentialFailed(String),
    MediaPermissionDenied(String),
    MediaFailed(String),
    ConnectionLost,
    Reconnecting,
    Reconnected,
    AgentData(Vec<u8>),
    Transcription {
        participant: String,
        text: String,
        is_final: bool,
    },
    SaveFailed(String),
}

/// How a view addresses its session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionTarget {
    Id(String),
    AccessLink(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextConfig {
    pub poller: PollerConfig,
    pub debounce: SaveDebounceConfig,
    pub reconnect: ReconnectPolicy,
}

struct ContextShared {
    session_id: String,
    api: Arc<dyn SessionApi>,
    coordinator: ReconnectCoordinator,
    form: Mutex<FormModel>,
    locked_settings: BTreeMap<String, Value>,
    editable_settings: Mutex<BTreeMap<String, Value>>,
    notices: broadcast::Sender<SessionNotice>,
    alive: AtomicBool,
    not_found: AtomicBool,
    /// Bumped on every status returned by a local write.
    status_epoch: AtomicU64,
    /// `status_epoch` seen when the in-flight poll was issued.
    cycle_epoch: AtomicU64,
    save_failures: AtomicU32,
    save_failure_threshold: u32,
}

impl ContextShared {
    fn form(&self) -> MutexGuard<'_, FormModel> {
        match self.form.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn editable(&self) -> BTreeMap<String, Value> {
        match self.editable_settings.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn notify(&self, notice: SessionNotice) {
        let _ = self.notices.send(notice);
    }

    fn observe_status(&self, status: SessionStatus) {
        self.status_epoch.fetch_add(1, Ordering::SeqCst);
        if self.form().observe_status(status) {
            self.notify(SessionNotice::StatusChanged(status));
        }
    }

    /// Marks the session gone and tears down the media binding.
    async fn mark_not_found(&self) {
        if self.not_found.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(session_id = %self.session_id, "session not found; halting background activity");
        self.notify(SessionNotice::NotFound);
        self.coordinator.teardown().await;
    }

    async fn track<T>(&self, result: ClientResult<T>) -> ClientResult<T> {
        if let Err(ClientError::NotFound(_)) = &result {
            self.mark_not_found().await;
        }
        result
    }

    /// Writes the form once; returns the fields whose dirty flag was released.
    async fn flush_form(&self) -> ClientResult<Option<Vec<String>>> {
        if self.not_found.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let pending = self.form().prepare_save();
        let Some(pending) = pending else {
            tracing::debug!(session_id = %self.session_id, "skipping empty questionnaire write");
            return Ok(None);
        };
        let echoed = self
            .track(self.api.save_anketa(&self.session_id, &pending.payload).await)
            .await?;
        Ok(Some(self.form().confirm_save(&echoed)))
    }

    /// One debounced write. Transient failures are retried and only
    /// surfaced once the streak reaches the threshold; the dirty flag keeps
    /// protecting the edit meanwhile.
    async fn debounced_flush(&self) -> FlushOutcome {
        let error = match self.flush_form().await {
            Ok(_) => {
                self.save_failures.store(0, Ordering::SeqCst);
                return FlushOutcome::Settled;
            }
            Err(error) => error,
        };
        if error.is_not_found() {
            return FlushOutcome::Settled;
        }
        let failures = self
            .save_failures
            .fetch_add(1, Ordering::SeqCst)
            .saturating_add(1);
        let retry = matches!(error, ClientError::Transient(_));
        tracing::warn!(
            session_id = %self.session_id,
            failures,
            retry,
            error = %error,
            "questionnaire save failed"
        );
        if failures == self.save_failure_threshold || !retry {
            self.notify(SessionNotice::SaveFailed(error.to_string()));
        }
        if retry {
            FlushOutcome::Retry
        } else {
            FlushOutcome::Settled
        }
    }
}

#[async_trait]
impl PollObserver for ContextShared {
    fn on_cycle_start(&self) {
        self.cycle_epoch
            .store(self.status_epoch.load(Ordering::SeqCst), Ordering::SeqCst);
    }

    async fn on_snapshot(&self, mut snapshot: PollSnapshot) {
        if !self.alive.load(Ordering::SeqCst) {
            return;
        }
        let outcome = {
            let mut form = self.form();
            // A status write finished while this poll was in flight; its
            // status is fresher than the snapshot's.
            if self.cycle_epoch.load(Ordering::SeqCst) != self.status_epoch.load(Ordering::SeqCst)
            {
                if let Some(status) = form.status() {
                    snapshot.status = status;
                }
            }
            form.apply_snapshot(&snapshot)
        };
        if let Some(status) = outcome.status_change {
            self.notify(SessionNotice::StatusChanged(status));
            if status != SessionStatus::Active && self.coordinator.stop_capture().await {
                tracing::info!(session_id = %self.session_id, %status, "capture stopped after remote status change");
            }
        }
        if !outcome.freshly_filled.is_empty() {
            self.notify(SessionNotice::FieldsFilled {
                fields: outcome.freshly_filled,
                scroll_target: outcome.scroll_target,
            });
        }
    }

    async fn on_warning(&self, consecutive_failures: u32, error: &ClientError) {
        if self.alive.load(Ordering::SeqCst) {
            self.notify(SessionNotice::PollWarning {
                consecutive_failures,
                message: error.to_string(),
            });
        }
    }

    async fn on_not_found(&self) {
        self.mark_not_found().await;
    }
}

/// Everything one open session view owns.
pub struct SessionContext {
    shared: Arc<ContextShared>,
    access_link: String,
    config: ContextConfig,
    signals: Arc<PollerSignals>,
    poller: Option<PollerHandle>,
    debouncer: Option<SaveDebouncer>,
    last_reconnect: Option<ReconnectReport>,
}

impl SessionContext {
    /// Enters a session view: authoritative read, first snapshot, media
    /// reconnect when the status allows it, then polling and debounced saves.
    pub async fn enter(
        api: Arc<dyn SessionApi>,
        transport: Arc<dyn MediaTransport>,
        target: SessionTarget,
        reason: ConnectReason,
        config: ContextConfig,
    ) -> ClientResult<Self> {
        let record = match &target {
            SessionTarget::Id(session_id) => api.get_session(session_id).await?,
            SessionTarget::AccessLink(access_link) => api.get_session_by_link(access_link).await?,
        };
        let snapshot = api.poll(&record.session_id).await?;

        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        let coordinator = ReconnectCoordinator::new(
            Arc::clone(&api),
            transport,
            config.reconnect,
            notices.clone(),
        );
        let mut form = FormModel::new();
        form.apply_snapshot(&snapshot);

        let shared = Arc::new(ContextShared {
            session_id: record.session_id.clone(),
            api,
            coordinator,
            form: Mutex::new(form),
            locked_settings: record.voice_config.locked.clone(),
            editable_settings: Mutex::new(record.voice_config.editable.clone()),
            notices,
            alive: AtomicBool::new(true),
            not_found: AtomicBool::new(false),
            status_epoch: AtomicU64::new(0),
            cycle_epoch: AtomicU64::new(0),
            save_failures: AtomicU32::new(0),
            save_failure_threshold: config.poller.warning_threshold.max(1),
        });

        let mut context = Self {
            shared,
            access_link: record.access_link,
            config,
            signals: Arc::new(PollerSignals::new()),
            poller: None,
            debouncer: None,
            last_reconnect: None,
        };
        context.debouncer = Some(context.start_debouncer());

        if snapshot.status.allows_live_connection() {
            context.connect_media(snapshot.status, reason, None).await?;
        }
        if !snapshot.status.is_terminal() {
            context.ensure_polling();
        }
        tracing::info!(
            session_id = %context.shared.session_id,
            status = %snapshot.status,
            "session view entered"
        );
        Ok(context)
    }

    fn start_debouncer(&self) -> SaveDebouncer {
        let shared = Arc::clone(&self.shared);
        SaveDebouncer::start(self.config.debounce, move || {
            let shared = Arc::clone(&shared);
            async move { shared.debounced_flush().await }
        })
    }

    fn ensure_polling(&mut self) {
        if self.shared.not_found.load(Ordering::SeqCst) {
            return;
        }
        if self.poller.as_ref().is_some_and(PollerHandle::is_running) {
            return;
        }
        self.poller = Some(start_session_poller(
            Arc::clone(&self.shared.api),
            &self.shared.session_id,
            self.config.poller,
            Arc::clone(&self.signals),
            Arc::clone(&self.shared) as Arc<dyn PollObserver>,
        ));
    }

    /// Runs the reconnect flow; credential and media failures are surfaced
    /// as notices and leave the status untouched.
    async fn connect_media(
        &mut self,
        status: SessionStatus,
        reason: ConnectReason,
        credential: Option<anketa_types::JoinCredential>,
    ) -> ClientResult<()> {
        let editable = self.shared.editable();
        let result = self
            .shared
            .coordinator
            .reconnect(&self.shared.session_id, status, &editable, reason, credential)
            .await;
        match self.shared.track(result).await {
            Ok(report) => {
                self.last_reconnect = Some(report);
                Ok(())
            }
            Err(ClientError::NotFound(subject)) => Err(ClientError::NotFound(subject)),
            Err(ClientError::Credential(message)) => {
                tracing::warn!(session_id = %self.shared.session_id, "join credential unavailable");
                self.shared.notify(SessionNotice::CredentialFailed(message));
                Ok(())
            }
            Err(error) => {
                tracing::warn!(session_id = %self.shared.session_id, error = %error, "media reconnect failed");
                self.shared.notify(SessionNotice::MediaFailed(error.to_string()));
                Ok(())
            }
        }
    }

    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    pub fn access_link(&self) -> &str {
        &self.access_link
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionNotice> {
        self.shared.notices.subscribe()
    }

    /// Last authoritative status; `None` never happens after `enter`.
    pub fn status(&self) -> Option<SessionStatus> {
        self.shared.form().status()
    }

    pub fn affordances(&self) -> Option<StatusAffordances> {
        self.status().map(StatusAffordances::for_status)
    }

    pub fn is_not_found(&self) -> bool {
        self.shared.not_found.load(Ordering::SeqCst)
    }

    /// A copy of the form for rendering.
    pub fn form(&self) -> FormModel {
        self.shared.form().clone()
    }

    pub fn completion_percent(&self) -> u8 {
        self.shared.form().completion_percent()
    }

    pub fn last_reconnect(&self) -> Option<&ReconnectReport> {
        self.last_reconnect.as_ref()
    }

    pub fn coordinator(&self) -> &ReconnectCoordinator {
        &self.shared.coordinator
    }

    pub fn is_polling(&self) -> bool {
        self.poller.as_ref().is_some_and(PollerHandle::is_running)
    }

    pub fn set_hidden(&self, hidden: bool) {
        self.signals.set_hidden(hidden);
    }

    pub fn focus_field(&self, field: &str) -> bool {
        self.signals.record_activity();
        self.shared.form().focus(field)
    }

    pub fn blur_field(&self, field: &str) {
        self.shared.form().blur(field);
    }

    /// Applies a keystroke-level edit and restarts the save quiet period.
    pub fn edit_field(&self, field: &str, value: FieldValue) -> bool {
        self.signals.record_activity();
        let accepted = self.shared.form().edit(field, value);
        if accepted {
            if let Some(debouncer) = &self.debouncer {
                debouncer.touch();
            }
        }
        accepted
    }

    /// Writes the form immediately, bypassing the debounce delay.
    pub async fn save_now(&self) -> ClientResult<Option<Vec<String>>> {
        self.shared.flush_form().await
    }

    /// Changes one editable voice setting and signals the live agent.
    pub async fn update_voice_setting(&self, key: &str, value: Value) -> ClientResult<VoiceConfig> {
        if self.shared.locked_settings.contains_key(key) {
            return Err(ClientError::Rejected {
                status: 400,
                message: format!("voice setting '{key}' is locked"),
            });
        }
        let mut update = self.shared.editable();
        update.insert(key.to_string(), value);
        let stored = self
            .shared
            .track(
                self.shared
                    .api
                    .update_voice_config(&self.shared.session_id, &update)
                    .await,
            )
            .await?;
        match self.shared.editable_settings.lock() {
            Ok(mut editable) => *editable = stored.editable.clone(),
            Err(poisoned) => *poisoned.into_inner() = stored.editable.clone(),
        }
        Ok(stored)
    }

    pub async fn pause(&mut self) -> ClientResult<SessionStatus> {
        self.shared.coordinator.request_pause();
        self.shared.coordinator.stop_capture().await;
        let result = self.shared.api.pause(&self.shared.session_id).await;
        match self.shared.track(result).await {
            Ok(change) => {
                self.shared.observe_status(change.status);
                Ok(change.status)
            }
            Err(error) => {
                self.shared.coordinator.clear_pause_request();
                Err(error)
            }
        }
    }

    /// Resumes a paused session and rejoins the room with the granted credential.
    pub async fn resume(&mut self) -> ClientResult<SessionStatus> {
        let result = self.shared.api.resume(&self.shared.session_id).await;
        let grant = self.shared.track(result).await?;
        self.shared.coordinator.clear_pause_request();
        self.shared.observe_status(grant.status);
        self.connect_media(grant.status, ConnectReason::Resumed, Some(grant.credential))
            .await?;
        self.ensure_polling();
        Ok(grant.status)
    }

    /// Rejoins the room after the connection was lost, using the last
    /// authoritative status for the capture decision.
    pub async fn reconnect(&mut self) -> ClientResult<SessionStatus> {
        if self.is_not_found() {
            return Err(ClientError::NotFound(self.shared.session_id.clone()));
        }
        let status = self.status().ok_or_else(|| {
            ClientError::InvalidResponse("no authoritative status observed yet".to_string())
        })?;
        self.connect_media(status, ConnectReason::Resumed, None).await?;
        Ok(status)
    }

    /// Saves pending edits, ends the call and leaves the room.
    pub async fn end(&mut self) -> ClientResult<SessionStatus> {
        if let Err(error) = self.shared.flush_form().await {
            tracing::warn!(session_id = %self.shared.session_id, error = %error, "final save before end failed");
        }
        let result = self.shared.api.end(&self.shared.session_id).await;
        let change = self.shared.track(result).await?;
        self.shared.coordinator.teardown().await;
        self.shared.observe_status(change.status);
        Ok(change.status)
    }

    pub async fn confirm(&mut self) -> ClientResult<SessionStatus> {
        let result = self.shared.api.confirm(&self.shared.session_id).await;
        let change = self.shared.track(result).await?;
        self.shared.observe_status(change.status);
        Ok(change.status)
    }

    pub async fn decline(&mut self) -> ClientResult<SessionStatus> {
        let result = self.shared.api.decline(&self.shared.session_id).await;
        let change = self.shared.track(result).await?;
        self.shared.observe_status(change.status);
        Ok(change.status)
    }

    /// Leaves the view: flushes a pending save, stops polling, tears down media.
    pub async fn leave(mut self) {
        if let Some(mut debouncer) = self.debouncer.take() {
            debouncer.shutdown().await;
        }
        self.shared.alive.store(false, Ordering::SeqCst);
        if let Some(mut poller) = self.poller.take() {
            poller.shutdown().await;
        }
        self.shared.coordinator.teardown().await;
        tracing::info!(session_id = %self.shared.session_id, "session view left");
    }
}
