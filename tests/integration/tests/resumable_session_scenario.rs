use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anketa_client::{
    ConnectReason, ContextConfig, HttpSessionApi, HttpSessionApiConfig, LoopbackMediaTransport,
    PollerConfig, SaveDebounceConfig, SessionApi, SessionContext, SessionTarget,
};
use anketa_gateway::{serve_gateway, GatewayConfig, GatewayState};
use anketa_session::{ExtractionError, ExtractionService, FinalDocument, FinalizeReport};
use anketa_store::{InMemorySessionStore, SessionStore};
use anketa_types::{
    is_canonical_field, AnketaRecord, DialogueEntry, DialogueRole, FieldValue, NewSession,
    SessionStatus, VoiceConfig,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

/// Reads `field=value; field=value` pairs out of user turns.
struct TranscriptExtraction;

#[async_trait]
impl ExtractionService for TranscriptExtraction {
    async fn extract(
        &self,
        _session_id: &str,
        dialogue: &[DialogueEntry],
    ) -> Result<AnketaRecord, ExtractionError> {
        let mut update = AnketaRecord::new();
        for entry in dialogue.iter().filter(|entry| entry.role == DialogueRole::User) {
            for pair in entry.content.split(';') {
                let Some((field, value)) = pair.split_once('=') else {
                    continue;
                };
                let field = field.trim();
                if is_canonical_field(field) {
                    update.insert(field.to_string(), Value::String(value.trim().to_string()));
                }
            }
        }
        Ok(update)
    }

    async fn finalize(
        &self,
        session_id: &str,
        dialogue: &[DialogueEntry],
    ) -> Result<FinalDocument, ExtractionError> {
        Ok(FinalDocument {
            anketa: self.extract(session_id, dialogue).await?,
            blocks: Vec::new(),
        })
    }
}

const TRANSCRIPT: [(DialogueRole, &str); 12] = [
    (DialogueRole::Assistant, "Hello! What is your company called?"),
    (DialogueRole::User, "company_name=Acme Dental; city=Kazan"),
    (DialogueRole::Assistant, "What do you do?"),
    (DialogueRole::User, "industry=Healthcare; specialization=Implants"),
    (DialogueRole::Assistant, "Do you have a website?"),
    (DialogueRole::User, "website=acme.example"),
    (DialogueRole::Assistant, "Who should we contact?"),
    (DialogueRole::User, "contact_name=Irina; contact_email=irina@acme.example"),
    (DialogueRole::Assistant, "What budget do you have in mind?"),
    (DialogueRole::User, "budget=100k"),
    (DialogueRole::Assistant, "And the timeline?"),
    (DialogueRole::User, "timeline=Q3"),
];

struct TestGateway {
    addr: SocketAddr,
    state: Arc<GatewayState>,
    shutdown: Option<oneshot::Sender<()>>,
    server: tokio::task::JoinHandle<()>,
}

impl TestGateway {
    async fn start(extraction: Arc<dyn ExtractionService>) -> Self {
        let store: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::new());
        let config = GatewayConfig {
            bind: "127.0.0.1:0".to_string(),
            media_url: "loopback://media".to_string(),
            credential_secret: "integration-secret".to_string(),
            credential_ttl_seconds: 600,
        };
        let state = Arc::new(GatewayState::new(config, store, extraction).expect("gateway state"));
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server_state = Arc::clone(&state);
        let server = tokio::spawn(async move {
            let _ = serve_gateway(listener, server_state, async {
                let _ = shutdown_rx.await;
            })
            .await;
        });
        Self {
            addr,
            state,
            shutdown: Some(shutdown_tx),
            server,
        }
    }

    fn api(&self) -> Arc<dyn SessionApi> {
        Arc::new(
            HttpSessionApi::new(HttpSessionApiConfig {
                base_url: format!("http://{}", self.addr),
                timeout_ms: 5_000,
            })
            .expect("http api"),
        )
    }

    async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let _ = self.server.await;
    }
}

fn fast_context_config() -> ContextConfig {
    ContextConfig {
        poller: PollerConfig {
            active_interval: Duration::from_millis(20),
            idle_interval: Duration::from_millis(20),
            degraded_interval: Duration::from_millis(50),
            hidden_interval: Duration::from_millis(200),
            backoff_ceiling: Duration::from_millis(200),
            ..PollerConfig::default()
        },
        debounce: SaveDebounceConfig {
            delay: Duration::from_millis(50),
            ..SaveDebounceConfig::default()
        },
        ..ContextConfig::default()
    }
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..250 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn integration_resumable_session_scenario() {
    let gateway = TestGateway::start(Arc::new(TranscriptExtraction)).await;
    let transport = LoopbackMediaTransport::new();
    let api = gateway.api();

    let record = api
        .create_session(&NewSession {
            voice_config: VoiceConfig {
                locked: [("voice_id".to_string(), json!("alloy"))].into_iter().collect(),
                editable: [("speed".to_string(), json!(1.0))].into_iter().collect(),
            },
            anketa: AnketaRecord::new(),
        })
        .await
        .expect("create session");
    let session_id = record.session_id.clone();
    let room = format!("room-{session_id}");

    let mut first = SessionContext::enter(
        Arc::clone(&api),
        Arc::new(transport.clone()),
        SessionTarget::Id(session_id.clone()),
        ConnectReason::Created,
        fast_context_config(),
    )
    .await
    .expect("enter created session");
    assert_eq!(transport.active_captures(), 1);
    assert_eq!(gateway.state.dispatch().total_dispatches(), 1);

    for (role, content) in TRANSCRIPT {
        api.append_dialogue(&session_id, role, content)
            .await
            .expect("append dialogue");
    }
    wait_until("nine fields in the first view", || {
        first.form().filled_fields() == 9
    })
    .await;
    assert_eq!(first.completion_percent(), 33);
    assert_eq!(
        first.form().value("contact_name"),
        Some(&FieldValue::Text("Irina".to_string()))
    );

    assert_eq!(first.pause().await.expect("pause"), SessionStatus::Paused);
    assert_eq!(transport.active_captures(), 0);
    assert_eq!(gateway.state.dispatch().live_rooms(), 0);

    // Disconnect cleanup racing the pause must not overwrite it.
    let report = gateway
        .state
        .pipeline()
        .finalize(&session_id)
        .await
        .expect("finalize");
    assert_eq!(
        report,
        FinalizeReport::Skipped {
            persisted: SessionStatus::Paused
        }
    );
    assert_eq!(
        api.poll(&session_id).await.expect("poll").status,
        SessionStatus::Paused
    );

    first.leave().await;
    assert_eq!(transport.live_connections(), 0);

    let mut second = SessionContext::enter(
        gateway.api(),
        Arc::new(transport.clone()),
        SessionTarget::AccessLink(record.access_link.clone()),
        ConnectReason::Resumed,
        fast_context_config(),
    )
    .await
    .expect("enter via access link");
    assert_eq!(second.status(), Some(SessionStatus::Paused));
    assert!(second.affordances().expect("affordances").show_paused_indicator);
    assert!(second.form().filled_fields() >= 9);
    assert_eq!(transport.active_captures(), 0);
    assert_eq!(gateway.state.dispatch().total_dispatches(), 1);

    assert_eq!(second.resume().await.expect("resume"), SessionStatus::Active);
    assert_eq!(transport.active_captures(), 1);
    assert_eq!(transport.members(&room), vec![format!("client-{session_id}")]);
    assert_eq!(gateway.state.dispatch().live_rooms(), 1);
    assert_eq!(gateway.state.dispatch().total_dispatches(), 2);
    assert!(second.form().filled_fields() >= 9);

    second.leave().await;
    assert_eq!(transport.live_connections(), 0);
    gateway.stop().await;
}

#[tokio::test]
async fn integration_user_edit_and_agent_fill_both_survive() {
    let gateway = TestGateway::start(Arc::new(TranscriptExtraction)).await;
    let transport = LoopbackMediaTransport::new();
    let api = gateway.api();
    let record = api
        .create_session(&NewSession::default())
        .await
        .expect("create session");
    let session_id = record.session_id.clone();

    let context = SessionContext::enter(
        Arc::clone(&api),
        Arc::new(transport.clone()),
        SessionTarget::Id(session_id.clone()),
        ConnectReason::Created,
        fast_context_config(),
    )
    .await
    .expect("enter");

    context.focus_field("contact_phone");
    context.edit_field("contact_phone", FieldValue::Text("+7 900".to_string()));
    api.append_dialogue(&session_id, DialogueRole::User, "company_name=Acme")
        .await
        .expect("agent turn");
    context.edit_field("contact_phone", FieldValue::Text("+7 900 123".to_string()));
    context.blur_field("contact_phone");

    wait_until("agent field shown and edit saved", || {
        let form = context.form();
        form.value("company_name") == Some(&FieldValue::Text("Acme".to_string()))
            && !form.is_dirty("contact_phone")
    })
    .await;

    let stored = api.get_session(&session_id).await.expect("read").anketa;
    assert_eq!(stored.get("contact_phone"), Some(&json!("+7 900 123")));
    assert_eq!(stored.get("company_name"), Some(&json!("Acme")));
    assert_eq!(
        context.form().value("contact_phone"),
        Some(&FieldValue::Text("+7 900 123".to_string()))
    );

    context.leave().await;
    gateway.stop().await;
}
