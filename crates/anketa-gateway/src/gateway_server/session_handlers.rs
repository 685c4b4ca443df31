use std::sync::Arc;

use anketa_core::{generate_access_link, generate_session_id};
use anketa_normalizer::normalize;
use anketa_session::TransitionOutcome;
use anketa_types::{
    completion_percentage, DialogueRole, JoinCredential, NewSession, PollSnapshot, ResumeGrant,
    SessionRecord, SessionStatus, StatusChange,
};
use axum::body::Bytes;
use axum::extract::{Path as AxumPath, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use super::types::{AnketaUpdateRequest, DialogueAppendRequest, VoiceConfigUpdateRequest};
use super::{parse_gateway_json_body, GatewayApiError, GatewayState};
use crate::{AgentSignal, DispatchOutcome};

type ApiResult<T> = Result<T, GatewayApiError>;

fn room_for(session_id: &str) -> String {
    format!("room-{session_id}")
}

fn status_change(session_id: &str, outcome: TransitionOutcome) -> StatusChange {
    StatusChange {
        session_id: session_id.to_string(),
        status: outcome.status(),
        changed: matches!(outcome, TransitionOutcome::Applied { .. }),
    }
}

async fn load_session(state: &GatewayState, session_id: &str) -> ApiResult<SessionRecord> {
    state
        .store()
        .get_session(session_id)
        .await?
        .ok_or_else(|| GatewayApiError::not_found(session_id))
}

/// Assigns the room once, mints a credential and dispatches the agent for a live session.
async fn issue_join(state: &GatewayState, session_id: &str) -> ApiResult<JoinCredential> {
    let record = load_session(state, session_id).await?;
    if !record.status.allows_live_connection() {
        return Err(GatewayApiError::conflict(
            "session_not_live",
            format!("session '{session_id}' is {}", record.status),
        ));
    }
    let room = state
        .store()
        .ensure_room_reference(session_id, &room_for(session_id))
        .await?;
    let credential = state.issuer.issue(session_id, &room)?;
    dispatch_agent(state, &record, &room).await?;
    Ok(credential)
}

/// Dispatches the agent when `record` was read as active. The status is read
/// again after the claim; a pause that committed in between releases the room.
pub(super) async fn dispatch_agent(
    state: &GatewayState,
    record: &SessionRecord,
    room: &str,
) -> ApiResult<()> {
    if record.status != SessionStatus::Active {
        return Ok(());
    }
    let outcome = state.dispatch.ensure_dispatched(
        &record.session_id,
        room,
        record.voice_config.effective(),
    );
    if outcome != DispatchOutcome::Dispatched {
        return Ok(());
    }
    let current = load_session(state, &record.session_id).await?.status;
    if current != SessionStatus::Active {
        tracing::info!(
            session_id = %record.session_id,
            status = %current,
            "session left active during dispatch; releasing agent"
        );
        state.dispatch.release(&record.session_id, room);
    }
    Ok(())
}

async fn release_agent(state: &GatewayState, session_id: &str) -> ApiResult<()> {
    let record = load_session(state, session_id).await?;
    if let Some(room) = record.room_reference {
        state.dispatch.release(session_id, &room);
    }
    Ok(())
}

pub(super) async fn handle_create_session(
    State(state): State<Arc<GatewayState>>,
    body: Bytes,
) -> ApiResult<Response> {
    let input = if body.is_empty() {
        NewSession::default()
    } else {
        parse_gateway_json_body::<NewSession>(&body)?
    };
    let session_id = generate_session_id();
    let access_link =
        generate_access_link(&session_id, state.config.credential_secret.as_bytes());
    let record = state
        .store()
        .create_session(SessionRecord::new(session_id, access_link, input))
        .await?;
    tracing::info!(session_id = %record.session_id, "session created");
    Ok((StatusCode::CREATED, Json(record)).into_response())
}

pub(super) async fn handle_get_session(
    State(state): State<Arc<GatewayState>>,
    AxumPath(session_id): AxumPath<String>,
) -> ApiResult<Json<SessionRecord>> {
    Ok(Json(load_session(&state, &session_id).await?))
}

pub(super) async fn handle_get_session_by_link(
    State(state): State<Arc<GatewayState>>,
    AxumPath(access_link): AxumPath<String>,
) -> ApiResult<Json<SessionRecord>> {
    state
        .store()
        .get_session_by_access_link(&access_link)
        .await?
        .map(Json)
        .ok_or_else(|| {
            GatewayApiError::new(
                StatusCode::NOT_FOUND,
                "session_not_found",
                "no session for this access link",
            )
        })
}

pub(super) async fn handle_update_anketa(
    State(state): State<Arc<GatewayState>>,
    AxumPath(session_id): AxumPath<String>,
    body: Bytes,
) -> ApiResult<Response> {
    let request = parse_gateway_json_body::<AnketaUpdateRequest>(&body)?;
    let stored = if request.anketa.is_empty() {
        load_session(&state, &session_id).await?.anketa
    } else {
        let fields = request.anketa.len();
        let stored = state
            .store()
            .merge_anketa(&session_id, request.anketa)
            .await?;
        tracing::debug!(session_id = %session_id, fields, "questionnaire update merged");
        stored
    };
    Ok(Json(json!({ "anketa": stored })).into_response())
}

pub(super) async fn handle_update_voice_config(
    State(state): State<Arc<GatewayState>>,
    AxumPath(session_id): AxumPath<String>,
    body: Bytes,
) -> ApiResult<Response> {
    let request = parse_gateway_json_body::<VoiceConfigUpdateRequest>(&body)?;
    let config = state
        .store()
        .update_voice_config(&session_id, &request.editable)
        .await?;
    state.signals.publish(AgentSignal::VoiceConfigUpdated {
        session_id: session_id.clone(),
        settings: config.effective(),
    });
    Ok(Json(config).into_response())
}

pub(super) async fn handle_append_dialogue(
    State(state): State<Arc<GatewayState>>,
    AxumPath(session_id): AxumPath<String>,
    body: Bytes,
) -> ApiResult<Response> {
    let request = parse_gateway_json_body::<DialogueAppendRequest>(&body)?;
    let Some(role) = DialogueRole::parse(&request.role) else {
        return Err(GatewayApiError::bad_request(
            "invalid_role",
            format!("unsupported dialogue role '{}'", request.role),
        ));
    };
    if request.content.trim().is_empty() {
        return Err(GatewayApiError::bad_request(
            "empty_content",
            "dialogue content must not be empty",
        ));
    }
    let entry = state
        .pipeline
        .append_dialogue(&session_id, role, &request.content)
        .await?;
    Ok((StatusCode::CREATED, Json(entry)).into_response())
}

pub(super) async fn handle_join(
    State(state): State<Arc<GatewayState>>,
    AxumPath(session_id): AxumPath<String>,
) -> ApiResult<Json<JoinCredential>> {
    Ok(Json(issue_join(&state, &session_id).await?))
}

pub(super) async fn handle_pause(
    State(state): State<Arc<GatewayState>>,
    AxumPath(session_id): AxumPath<String>,
) -> ApiResult<Json<StatusChange>> {
    let outcome = state.controller().pause(&session_id).await?;
    release_agent(&state, &session_id).await?;
    Ok(Json(status_change(&session_id, outcome)))
}

pub(super) async fn handle_resume(
    State(state): State<Arc<GatewayState>>,
    AxumPath(session_id): AxumPath<String>,
) -> ApiResult<Json<ResumeGrant>> {
    let outcome = state.controller().resume(&session_id).await?;
    let credential = issue_join(&state, &session_id).await?;
    Ok(Json(ResumeGrant {
        session_id,
        status: outcome.status(),
        credential,
    }))
}

/// Ends the call: `active -> processing`, then finalizes in the background.
pub(super) async fn handle_end(
    State(state): State<Arc<GatewayState>>,
    AxumPath(session_id): AxumPath<String>,
) -> ApiResult<Json<StatusChange>> {
    state.pipeline.ensure_endable(&session_id).await?;
    let outcome = state.controller().begin_processing(&session_id).await?;
    release_agent(&state, &session_id).await?;
    if outcome.status() == SessionStatus::Processing {
        state.signals.publish(AgentSignal::FinalizeNow {
            session_id: session_id.clone(),
        });
        // The handle is dropped; the task keeps running detached.
        drop(state.pipeline.spawn_finalize(&session_id));
    }
    Ok(Json(status_change(&session_id, outcome)))
}

pub(super) async fn handle_confirm(
    State(state): State<Arc<GatewayState>>,
    AxumPath(session_id): AxumPath<String>,
) -> ApiResult<Json<StatusChange>> {
    let outcome = state.controller().confirm(&session_id).await?;
    Ok(Json(status_change(&session_id, outcome)))
}

pub(super) async fn handle_decline(
    State(state): State<Arc<GatewayState>>,
    AxumPath(session_id): AxumPath<String>,
) -> ApiResult<Json<StatusChange>> {
    let outcome = state.controller().decline(&session_id).await?;
    Ok(Json(status_change(&session_id, outcome)))
}

pub(super) async fn handle_poll(
    State(state): State<Arc<GatewayState>>,
    AxumPath(session_id): AxumPath<String>,
) -> ApiResult<Json<PollSnapshot>> {
    let record = load_session(&state, &session_id).await?;
    let ai_blocks = state.store().list_ai_blocks(&session_id).await?;
    let dialogue_turns = state.store().count_dialogue(&session_id).await?;
    let completion_percent = completion_percentage(&normalize(&record.anketa));
    Ok(Json(PollSnapshot {
        processing: state.pipeline.processing().is_processing(&session_id),
        session_id: record.session_id,
        status: record.status,
        anketa: record.anketa,
        completion_percent,
        ai_blocks,
        dialogue_turns,
        updated_at: record.updated_at,
    }))
}
