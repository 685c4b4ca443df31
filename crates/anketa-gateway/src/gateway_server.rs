use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anketa_session::{
    ExtractionService, ProcessingRegistry, SessionPipeline, SessionStateController,
};
use anketa_store::SessionStore;
use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

use crate::{AgentDispatchRegistry, AgentSignalHub, CredentialError, JoinCredentialIssuer};

mod session_handlers;
mod types;

use session_handlers::{
    handle_append_dialogue, handle_confirm, handle_create_session, handle_decline, handle_end,
    handle_get_session, handle_get_session_by_link, handle_join, handle_pause, handle_poll,
    handle_resume, handle_update_anketa, handle_update_voice_config,
};
use types::{AgentSignalsQuery, GatewayApiError};

const SESSIONS_ENDPOINT: &str = "/api/sessions";
const SESSION_ENDPOINT: &str = "/api/sessions/{session_id}";
const SESSION_BY_LINK_ENDPOINT: &str = "/api/sessions/by-link/{access_link}";
const SESSION_ANKETA_ENDPOINT: &str = "/api/sessions/{session_id}/anketa";
const SESSION_VOICE_CONFIG_ENDPOINT: &str = "/api/sessions/{session_id}/voice-config";
const SESSION_DIALOGUE_ENDPOINT: &str = "/api/sessions/{session_id}/dialogue";
const SESSION_PAUSE_ENDPOINT: &str = "/api/sessions/{session_id}/pause";
const SESSION_RESUME_ENDPOINT: &str = "/api/sessions/{session_id}/resume";
const SESSION_JOIN_ENDPOINT: &str = "/api/sessions/{session_id}/join";
const SESSION_END_ENDPOINT: &str = "/api/sessions/{session_id}/end";
const SESSION_CONFIRM_ENDPOINT: &str = "/api/sessions/{session_id}/confirm";
const SESSION_DECLINE_ENDPOINT: &str = "/api/sessions/{session_id}/decline";
const SESSION_POLL_ENDPOINT: &str = "/api/sessions/{session_id}/poll";
const AGENT_SIGNALS_ENDPOINT: &str = "/api/agent/signals";
const GATEWAY_STATUS_ENDPOINT: &str = "/gateway/status";
const DEFAULT_CREDENTIAL_TTL_SECONDS: u64 = 3_600;

#[derive(Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    pub bind: String,
    /// Media server URL handed to clients inside join credentials.
    pub media_url: String,
    pub credential_secret: String,
    pub credential_ttl_seconds: u64,
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("GatewayConfig")
            .field("bind", &self.bind)
            .field("media_url", &self.media_url)
            .field("credential_ttl_seconds", &self.credential_ttl_seconds)
            .finish_non_exhaustive()
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8790".to_string(),
            media_url: "ws://127.0.0.1:7880".to_string(),
            credential_secret: String::new(),
            credential_ttl_seconds: DEFAULT_CREDENTIAL_TTL_SECONDS,
        }
    }
}

/// Shared state behind every gateway route.
pub struct GatewayState {
    config: GatewayConfig,
    pipeline: SessionPipeline,
    issuer: JoinCredentialIssuer,
    dispatch: AgentDispatchRegistry,
    signals: AgentSignalHub,
}

impl GatewayState {
    pub fn new(
        config: GatewayConfig,
        store: Arc<dyn SessionStore>,
        extraction: Arc<dyn ExtractionService>,
    ) -> Result<Self, CredentialError> {
        let issuer = JoinCredentialIssuer::new(
            config.credential_secret.as_bytes(),
            config.media_url.clone(),
            config.credential_ttl_seconds,
        )?;
        let signals = AgentSignalHub::new();
        let pipeline = SessionPipeline::new(
            SessionStateController::new(store),
            extraction,
            ProcessingRegistry::new(),
        );
        Ok(Self {
            config,
            pipeline,
            issuer,
            dispatch: AgentDispatchRegistry::new(signals.clone()),
            signals,
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn pipeline(&self) -> &SessionPipeline {
        &self.pipeline
    }

    pub fn issuer(&self) -> &JoinCredentialIssuer {
        &self.issuer
    }

    pub fn dispatch(&self) -> &AgentDispatchRegistry {
        &self.dispatch
    }

    pub fn signals(&self) -> &AgentSignalHub {
        &self.signals
    }

    fn controller(&self) -> &SessionStateController {
        self.pipeline.controller()
    }

    fn store(&self) -> &Arc<dyn SessionStore> {
        self.controller().store()
    }
}

/// Binds `config.bind` and serves until ctrl-c.
pub async fn run_gateway_server(
    config: GatewayConfig,
    store: Arc<dyn SessionStore>,
    extraction: Arc<dyn ExtractionService>,
) -> Result<()> {
    let bind_addr = config
        .bind
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid --bind '{}'", config.bind))?;
    let state = GatewayState::new(config, store, extraction)
        .context("failed to initialize join credential issuer")?;
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind gateway on {bind_addr}"))?;
    let local_addr = listener
        .local_addr()
        .context("failed to resolve bound gateway address")?;
    tracing::info!(
        addr = %local_addr,
        media_url = %state.config.media_url,
        "gateway listening"
    );

    serve_gateway(listener, Arc::new(state), async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;
    tracing::info!("gateway stopped");
    Ok(())
}

/// Serves the gateway on an already bound listener until `shutdown` resolves.
pub async fn serve_gateway<F>(
    listener: TcpListener,
    state: Arc<GatewayState>,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, build_gateway_router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("gateway server exited unexpectedly")
}

pub fn build_gateway_router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route(SESSIONS_ENDPOINT, post(handle_create_session))
        .route(SESSION_ENDPOINT, get(handle_get_session))
        .route(SESSION_BY_LINK_ENDPOINT, get(handle_get_session_by_link))
        .route(SESSION_ANKETA_ENDPOINT, put(handle_update_anketa))
        .route(SESSION_VOICE_CONFIG_ENDPOINT, put(handle_update_voice_config))
        .route(SESSION_DIALOGUE_ENDPOINT, post(handle_append_dialogue))
        .route(SESSION_PAUSE_ENDPOINT, post(handle_pause))
        .route(SESSION_RESUME_ENDPOINT, post(handle_resume))
        .route(SESSION_JOIN_ENDPOINT, post(handle_join))
        .route(SESSION_END_ENDPOINT, post(handle_end))
        .route(SESSION_CONFIRM_ENDPOINT, post(handle_confirm))
        .route(SESSION_DECLINE_ENDPOINT, post(handle_decline))
        .route(SESSION_POLL_ENDPOINT, get(handle_poll))
        .route(AGENT_SIGNALS_ENDPOINT, get(handle_agent_signals))
        .route(GATEWAY_STATUS_ENDPOINT, get(handle_gateway_status))
        .with_state(state)
}

fn parse_gateway_json_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, GatewayApiError> {
    serde_json::from_slice::<T>(body).map_err(|error| {
        GatewayApiError::bad_request(
            "malformed_json",
            format!("failed to parse request body: {error}"),
        )
    })
}

async fn handle_gateway_status(State(state): State<Arc<GatewayState>>) -> Response {
    Json(json!({
        "live_rooms": state.dispatch.live_rooms(),
        "total_dispatches": state.dispatch.total_dispatches(),
        "media_url": state.config.media_url,
    }))
    .into_response()
}

/// SSE stream of agent signals, optionally narrowed to one session.
async fn handle_agent_signals(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<AgentSignalsQuery>,
) -> Response {
    let session_filter = query.session_id;
    let stream = BroadcastStream::new(state.signals.subscribe()).filter_map(move |item| {
        let event = match item {
            Ok(signal)
                if session_filter
                    .as_deref()
                    .is_none_or(|session_id| session_id == signal.session_id()) =>
            {
                Event::default()
                    .event(signal.kind())
                    .json_data(&signal)
                    .ok()
            }
            Ok(_) => None,
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "agent signal stream lagged");
                None
            }
        };
        futures_util::future::ready(event.map(Ok::<Event, Infallible>))
    });
    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}
