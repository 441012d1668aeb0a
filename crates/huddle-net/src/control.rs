//! REST control plane: session CRUD, invites, recording, transcript and
//! chat history.
//!
//! [`HttpControlPlane`] talks to the real server; the in-memory variant in
//! [`crate::memory`] satisfies the same trait for tests and local runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use huddle_shared::constants::DEFAULT_API_URL;
use huddle_shared::models::{
    ChatMessage, Invite, Participant, Recording, Session, SessionSettings, SessionStatus,
    TranscriptSegment,
};
use huddle_shared::types::SessionId;

use crate::error::ApiError;

/// Uniform response envelope used by every endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEnvelope<T> {
    pub success: bool,
    pub data: Option<T>,
    #[serde(default)]
    pub error: Option<String>,
}

impl<T> ApiEnvelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }

    pub fn into_result(self) -> Result<T, ApiError> {
        if !self.success {
            return Err(ApiError::Rejected(
                self.error.unwrap_or_else(|| "unspecified error".to_string()),
            ));
        }
        self.data.ok_or(ApiError::EmptyResponse)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    #[serde(default)]
    pub settings: SessionSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl CreateSessionRequest {
    pub fn validate(&self) -> Result<(), ApiError> {
        if self.title.trim().is_empty() {
            return Err(ApiError::Invalid("title is empty".into()));
        }
        if self.ends_at <= self.starts_at {
            return Err(ApiError::Invalid("session ends before it starts".into()));
        }
        if self.settings.require_password && self.password.as_deref().unwrap_or("").is_empty() {
            return Err(ApiError::Invalid("password required by settings".into()));
        }
        Ok(())
    }
}

/// Partial update; absent fields are left unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starts_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ends_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SessionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<SessionSettings>,
}

impl SessionUpdate {
    pub fn apply(&self, session: &mut Session) {
        if let Some(title) = &self.title {
            session.title = title.clone();
        }
        if let Some(description) = &self.description {
            session.description = Some(description.clone());
        }
        if let Some(starts_at) = self.starts_at {
            session.starts_at = starts_at;
        }
        if let Some(ends_at) = self.ends_at {
            session.ends_at = ends_at;
        }
        if let Some(status) = self.status {
            session.status = status;
        }
        if let Some(settings) = &self.settings {
            session.settings = settings.clone();
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct InviteRequest<'a> {
    invites: &'a [Invite],
}

/// Request/response operations against the session server.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn create_session(&self, request: &CreateSessionRequest) -> Result<Session, ApiError>;
    async fn update_session(
        &self,
        id: &SessionId,
        update: &SessionUpdate,
    ) -> Result<Session, ApiError>;
    async fn delete_session(&self, id: &SessionId) -> Result<(), ApiError>;
    async fn get_session(&self, id: &SessionId) -> Result<Session, ApiError>;
    async fn list_participants(&self, id: &SessionId) -> Result<Vec<Participant>, ApiError>;
    async fn send_invites(&self, id: &SessionId, invites: &[Invite]) -> Result<usize, ApiError>;
    async fn start_recording(&self, id: &SessionId) -> Result<Recording, ApiError>;
    async fn stop_recording(&self, id: &SessionId) -> Result<Recording, ApiError>;
    async fn get_transcript(&self, id: &SessionId) -> Result<Vec<TranscriptSegment>, ApiError>;
    async fn get_chat_history(&self, id: &SessionId) -> Result<Vec<ChatMessage>, ApiError>;
}

/// HTTP implementation over `reqwest` with bearer-token auth.
#[derive(Debug, Clone)]
pub struct HttpControlPlane {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl HttpControlPlane {
    pub fn new(base_url: &str, token: Option<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            http: reqwest::Client::new(),
        }
    }

    /// Replace the bearer token (e.g. after a refresh).
    pub fn set_token(&mut self, token: String) {
        self.token = Some(token);
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        debug!(%method, path, "Control-plane request");
        let builder = self.http.request(method, self.url(path));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

impl Default for HttpControlPlane {
    fn default() -> Self {
        Self::new(DEFAULT_API_URL, None)
    }
}

fn session_path(id: &SessionId, suffix: &str) -> String {
    format!("/sessions/{}{}", id, suffix)
}

/// Map the HTTP status, then unwrap the `{success, data, error}` envelope.
async fn parse_envelope<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ApiError> {
    check_status(response)
        .await?
        .json::<ApiEnvelope<T>>()
        .await?
        .into_result()
}

/// Like [`parse_envelope`] for endpoints that return no data.
async fn parse_unit(response: reqwest::Response) -> Result<(), ApiError> {
    let envelope = check_status(response)
        .await?
        .json::<ApiEnvelope<serde_json::Value>>()
        .await?;
    if envelope.success {
        Ok(())
    } else {
        Err(ApiError::Rejected(
            envelope.error.unwrap_or_else(|| "unspecified error".to_string()),
        ))
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
    let status = response.status().as_u16();
    match status {
        200..=299 => Ok(response),
        401 => Err(ApiError::NotAuthenticated),
        403 => Err(ApiError::Forbidden(response.text().await.unwrap_or_default())),
        404 => Err(ApiError::NotFound(response.text().await.unwrap_or_default())),
        _ => Err(ApiError::Server {
            status,
            body: response.text().await.unwrap_or_default(),
        }),
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn create_session(&self, request: &CreateSessionRequest) -> Result<Session, ApiError> {
        request.validate()?;
        let response = self
            .request(reqwest::Method::POST, "/sessions")
            .json(request)
            .send()
            .await?;
        parse_envelope(response).await
    }

    async fn update_session(
        &self,
        id: &SessionId,
        update: &SessionUpdate,
    ) -> Result<Session, ApiError> {
        let response = self
            .request(reqwest::Method::PATCH, &session_path(id, ""))
            .json(update)
            .send()
            .await?;
        parse_envelope(response).await
    }

    async fn delete_session(&self, id: &SessionId) -> Result<(), ApiError> {
        let response = self
            .request(reqwest::Method::DELETE, &session_path(id, ""))
            .send()
            .await?;
        parse_unit(response).await
    }

    async fn get_session(&self, id: &SessionId) -> Result<Session, ApiError> {
        let response = self
            .request(reqwest::Method::GET, &session_path(id, ""))
            .send()
            .await?;
        parse_envelope(response).await
    }

    async fn list_participants(&self, id: &SessionId) -> Result<Vec<Participant>, ApiError> {
        let response = self
            .request(reqwest::Method::GET, &session_path(id, "/participants"))
            .send()
            .await?;
        parse_envelope(response).await
    }

    async fn send_invites(&self, id: &SessionId, invites: &[Invite]) -> Result<usize, ApiError> {
        if invites.is_empty() {
            return Ok(0);
        }
        let response = self
            .request(reqwest::Method::POST, &session_path(id, "/invites"))
            .json(&InviteRequest { invites })
            .send()
            .await?;
        parse_envelope(response).await
    }

    async fn start_recording(&self, id: &SessionId) -> Result<Recording, ApiError> {
        let response = self
            .request(reqwest::Method::POST, &session_path(id, "/recording/start"))
            .send()
            .await?;
        parse_envelope(response).await
    }

    async fn stop_recording(&self, id: &SessionId) -> Result<Recording, ApiError> {
        let response = self
            .request(reqwest::Method::POST, &session_path(id, "/recording/stop"))
            .send()
            .await?;
        parse_envelope(response).await
    }

    async fn get_transcript(&self, id: &SessionId) -> Result<Vec<TranscriptSegment>, ApiError> {
        let response = self
            .request(reqwest::Method::GET, &session_path(id, "/transcript"))
            .send()
            .await?;
        parse_envelope(response).await
    }

    async fn get_chat_history(&self, id: &SessionId) -> Result<Vec<ChatMessage>, ApiError> {
        let response = self
            .request(reqwest::Method::GET, &session_path(id, "/chat"))
            .send()
            .await?;
        parse_envelope(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_shared::models::ParticipantRole;

    #[test]
    fn test_envelope_failure_maps_to_rejected() {
        let raw = r#"{"success": false, "error": "session full"}"#;
        let envelope: ApiEnvelope<Session> = serde_json::from_str(raw).unwrap();
        match envelope.into_result() {
            Err(ApiError::Rejected(msg)) => assert_eq!(msg, "session full"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_envelope_success_without_data() {
        let raw = r#"{"success": true}"#;
        let envelope: ApiEnvelope<Vec<Participant>> = serde_json::from_str(raw).unwrap();
        assert!(matches!(envelope.into_result(), Err(ApiError::EmptyResponse)));
    }

    #[test]
    fn test_create_request_validation() {
        let now = Utc::now();
        let mut request = CreateSessionRequest {
            title: "Standup".into(),
            description: None,
            starts_at: now,
            ends_at: now + chrono::Duration::minutes(15),
            settings: SessionSettings::default(),
            password: None,
        };
        assert!(request.validate().is_ok());

        request.settings.require_password = true;
        assert!(matches!(request.validate(), Err(ApiError::Invalid(_))));

        request.password = Some("hunter2".into());
        request.ends_at = now;
        assert!(matches!(request.validate(), Err(ApiError::Invalid(_))));
    }

    #[test]
    fn test_invite_body_shape() {
        let invites = vec![Invite {
            email: "ana@example.test".into(),
            role: ParticipantRole::CoHost,
        }];
        let body = serde_json::to_value(InviteRequest { invites: &invites }).unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "invites": [{ "email": "ana@example.test", "role": "co_host" }]
            })
        );
    }

    #[test]
    fn test_base_url_is_trimmed() {
        let client = HttpControlPlane::new("https://api.example.test/v1/", None);
        assert_eq!(
            client.url(&session_path(&SessionId::new("m1"), "/chat")),
            "https://api.example.test/v1/sessions/m1/chat"
        );
    }
}
