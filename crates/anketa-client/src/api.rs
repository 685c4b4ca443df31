use std::collections::BTreeMap;
use std::time::Duration;

use anketa_types::{
    AnketaRecord, DialogueEntry, DialogueRole, JoinCredential, NewSession, PollSnapshot,
    ResumeGrant, SessionRecord, StatusChange, VoiceConfig,
};
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{ClientError, ClientResult};

const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
const MAX_ERROR_BODY_CHARS: usize = 256;

/// Session operations a client view performs against the gateway.
#[async_trait]
pub trait SessionApi: Send + Sync {
    async fn create_session(&self, input: &NewSession) -> ClientResult<SessionRecord>;
    async fn get_session(&self, session_id: &str) -> ClientResult<SessionRecord>;
    async fn get_session_by_link(&self, access_link: &str) -> ClientResult<SessionRecord>;
    async fn poll(&self, session_id: &str) -> ClientResult<PollSnapshot>;
    /// Merges a storage-shaped update and returns the stored questionnaire.
    async fn save_anketa(
        &self,
        session_id: &str,
        anketa: &AnketaRecord,
    ) -> ClientResult<AnketaRecord>;
    async fn update_voice_config(
        &self,
        session_id: &str,
        editable: &BTreeMap<String, Value>,
    ) -> ClientResult<VoiceConfig>;
    async fn append_dialogue(
        &self,
        session_id: &str,
        role: DialogueRole,
        content: &str,
    ) -> ClientResult<DialogueEntry>;
    async fn request_join(&self, session_id: &str) -> ClientResult<JoinCredential>;
    async fn pause(&self, session_id: &str) -> ClientResult<StatusChange>;
    async fn resume(&self, session_id: &str) -> ClientResult<ResumeGrant>;
    async fn end(&self, session_id: &str) -> ClientResult<StatusChange>;
    async fn confirm(&self, session_id: &str) -> ClientResult<StatusChange>;
    async fn decline(&self, session_id: &str) -> ClientResult<StatusChange>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpSessionApiConfig {
    pub base_url: String,
    pub timeout_ms: u64,
}

impl Default for HttpSessionApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8790".to_string(),
            timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct AnketaEnvelope {
    anketa: AnketaRecord,
}

/// Classifies what a failed request means for the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Read,
    Write,
    Credential,
}

/// `SessionApi` over the gateway's JSON HTTP surface.
#[derive(Debug, Clone)]
pub struct HttpSessionApi {
    config: HttpSessionApiConfig,
    client: Client,
}

impl HttpSessionApi {
    pub fn new(config: HttpSessionApiConfig) -> ClientResult<Self> {
        if config.base_url.trim().is_empty() {
            return Err(ClientError::InvalidResponse(
                "base_url must not be empty".to_string(),
            ));
        }
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms.max(1)))
            .build()
            .map_err(|error| {
                ClientError::Transient(format!("failed to initialize http client: {error}"))
            })?;
        let mut normalized = config;
        normalized.base_url = normalized.base_url.trim().trim_end_matches('/').to_string();
        Ok(Self {
            config: normalized,
            client,
        })
    }

    fn endpoint_url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        subject: &str,
        operation: Operation,
        body: Option<Value>,
    ) -> ClientResult<T> {
        let mut request = self.client.request(method, self.endpoint_url(path));
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request
            .send()
            .await
            .map_err(|error| map_request_error(path, error))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(map_http_status_error(subject, operation, status, &body));
        }
        serde_json::from_str(&body).map_err(|error| {
            ClientError::InvalidResponse(format!("path={path} invalid json response: {error}"))
        })
    }
}

#[async_trait]
impl SessionApi for HttpSessionApi {
    async fn create_session(&self, input: &NewSession) -> ClientResult<SessionRecord> {
        let body = serde_json::to_value(input)
            .map_err(|error| ClientError::InvalidResponse(error.to_string()))?;
        self.send(Method::POST, "/api/sessions", "new", Operation::Write, Some(body))
            .await
    }

    async fn get_session(&self, session_id: &str) -> ClientResult<SessionRecord> {
        let path = format!("/api/sessions/{session_id}");
        self.send(Method::GET, &path, session_id, Operation::Read, None)
            .await
    }

    async fn get_session_by_link(&self, access_link: &str) -> ClientResult<SessionRecord> {
        let path = format!("/api/sessions/by-link/{access_link}");
        self.send(Method::GET, &path, access_link, Operation::Read, None)
            .await
    }

    async fn poll(&self, session_id: &str) -> ClientResult<PollSnapshot> {
        let path = format!("/api/sessions/{session_id}/poll");
        self.send(Method::GET, &path, session_id, Operation::Read, None)
            .await
    }

    async fn save_anketa(
        &self,
        session_id: &str,
        anketa: &AnketaRecord,
    ) -> ClientResult<AnketaRecord> {
        let path = format!("/api/sessions/{session_id}/anketa");
        let envelope: AnketaEnvelope = self
            .send(
                Method::PUT,
                &path,
                session_id,
                Operation::Write,
                Some(json!({ "anketa": anketa })),
            )
            .await?;
        Ok(envelope.anketa)
    }

    async fn update_voice_config(
        &self,
        session_id: &str,
        editable: &BTreeMap<String, Value>,
    ) -> ClientResult<VoiceConfig> {
        let path = format!("/api/sessions/{session_id}/voice-config");
        self.send(
            Method::PUT,
            &path,
            session_id,
            Operation::Write,
            Some(json!({ "editable": editable })),
        )
        .await
    }

    async fn append_dialogue(
        &self,
        session_id: &str,
        role: DialogueRole,
        content: &str,
    ) -> ClientResult<DialogueEntry> {
        let path = format!("/api/sessions/{session_id}/dialogue");
        self.send(
            Method::POST,
            &path,
            session_id,
            Operation::Write,
            Some(json!({ "role": role, "content": content })),
        )
        .await
    }

    async fn request_join(&self, session_id: &str) -> ClientResult<JoinCredential> {
        let path = format!("/api/sessions/{session_id}/join");
        self.send(Method::POST, &path, session_id, Operation::Credential, None)
            .await
    }

    async fn pause(&self, session_id: &str) -> ClientResult<StatusChange> {
        let path = format!("/api/sessions/{session_id}/pause");
        self.send(Method::POST, &path, session_id, Operation::Write, None)
            .await
    }

    async fn resume(&self, session_id: &str) -> ClientResult<ResumeGrant> {
        let path = format!("/api/sessions/{session_id}/resume");
        self.send(Method::POST, &path, session_id, Operation::Credential, None)
            .await
    }

    async fn end(&self, session_id: &str) -> ClientResult<StatusChange> {
        let path = format!("/api/sessions/{session_id}/end");
        self.send(Method::POST, &path, session_id, Operation::Write, None)
            .await
    }

    async fn confirm(&self, session_id: &str) -> ClientResult<StatusChange> {
        let path = format!("/api/sessions/{session_id}/confirm");
        self.send(Method::POST, &path, session_id, Operation::Write, None)
            .await
    }

    async fn decline(&self, session_id: &str) -> ClientResult<StatusChange> {
        let path = format!("/api/sessions/{session_id}/decline");
        self.send(Method::POST, &path, session_id, Operation::Write, None)
            .await
    }
}

fn map_request_error(path: &str, error: reqwest::Error) -> ClientError {
    if error.is_timeout() {
        return ClientError::Transient(format!("path={path} request timed out"));
    }
    ClientError::Transient(format!("path={path} request failed: {error}"))
}

fn map_http_status_error(
    subject: &str,
    operation: Operation,
    status: StatusCode,
    body: &str,
) -> ClientError {
    let message = error_message(body);
    if status == StatusCode::NOT_FOUND {
        return ClientError::NotFound(subject.to_string());
    }
    if operation == Operation::Credential && status == StatusCode::BAD_GATEWAY {
        return ClientError::Credential(message);
    }
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        return ClientError::Transient(format!("status={} {message}", status.as_u16()));
    }
    ClientError::Rejected {
        status: status.as_u16(),
        message,
    }
}

fn error_message(body: &str) -> String {
    let parsed = serde_json::from_str::<Value>(body).ok();
    let message = parsed
        .as_ref()
        .and_then(|value| value.pointer("/error/message"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| body.trim().to_string());
    message.chars().take(MAX_ERROR_BODY_CHARS).collect()
}
