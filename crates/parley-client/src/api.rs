//! REST client for the server's `/api` routes.
//!
//! Every route mirrors a relay command, so a client can work without a
//! live connection and reconcile from events once it reconnects.

use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use parley_shared::error::{CommandFailure, ErrorKind};
use parley_shared::models::{
    Call, CallLog, Chat, ChatSummary, ContactEntry, ContactMatch, Message, Presence, UnreadCount,
};
use parley_shared::protocol::{ContactDraft, ContactPatch, MessageDraft};
use parley_shared::types::{CallId, CallType, ChatId, ContactId, MessageId, UserId};

use crate::config::ClientConfig;
use crate::error::ClientError;

#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
    pub protocol: String,
    pub connections: usize,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    kind: ErrorKind,
    #[serde(default)]
    superseded: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InitiateCallBody {
    callee_id: UserId,
    call_type: CallType,
    #[serde(skip_serializing_if = "Option::is_none")]
    chat_id: Option<ChatId>,
}

#[derive(Serialize)]
struct CreateChatBody<'a> {
    participants: &'a [UserId],
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
}

#[derive(Deserialize)]
struct Updated {
    updated: bool,
}

#[derive(Deserialize)]
struct Deleted {
    deleted: bool,
}

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    config: ClientConfig,
}

impl ApiClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub async fn server_info(&self) -> Result<ServerInfo, ClientError> {
        let resp = self.http.get(self.config.api_url("/info")).send().await?;
        decode(resp).await
    }

    // ─── Calls ───

    pub async fn initiate_call(
        &self,
        callee_id: UserId,
        call_type: CallType,
        chat_id: Option<ChatId>,
    ) -> Result<Call, ClientError> {
        let body = InitiateCallBody {
            callee_id,
            call_type,
            chat_id,
        };
        self.send(self.request(Method::POST, "/api/calls/initiate").json(&body))
            .await
    }

    pub async fn accept_call(&self, call_id: CallId) -> Result<Call, ClientError> {
        self.call_action(call_id, "accept").await
    }

    pub async fn reject_call(&self, call_id: CallId) -> Result<Call, ClientError> {
        self.call_action(call_id, "reject").await
    }

    pub async fn cancel_call(&self, call_id: CallId) -> Result<Call, ClientError> {
        self.call_action(call_id, "cancel").await
    }

    pub async fn end_call(&self, call_id: CallId) -> Result<Call, ClientError> {
        self.call_action(call_id, "end").await
    }

    pub async fn get_call(&self, call_id: CallId) -> Result<Call, ClientError> {
        self.send(self.request(Method::GET, &format!("/api/calls/{call_id}")))
            .await
    }

    pub async fn call_history(&self) -> Result<Vec<Call>, ClientError> {
        self.send(self.request(Method::GET, "/api/calls/history")).await
    }

    pub async fn call_logs(&self) -> Result<Vec<CallLog>, ClientError> {
        self.send(self.request(Method::GET, "/api/calls/logs")).await
    }

    async fn call_action(&self, call_id: CallId, action: &str) -> Result<Call, ClientError> {
        self.send(self.request(Method::POST, &format!("/api/calls/{call_id}/{action}")))
            .await
    }

    // ─── Chats ───

    pub async fn create_chat(
        &self,
        participants: &[UserId],
        name: Option<&str>,
    ) -> Result<Chat, ClientError> {
        let body = CreateChatBody { participants, name };
        self.send(self.request(Method::POST, "/api/chats").json(&body))
            .await
    }

    pub async fn list_chats(&self) -> Result<Vec<ChatSummary>, ClientError> {
        self.send(self.request(Method::GET, "/api/chats")).await
    }

    pub async fn get_chat(&self, chat_id: ChatId) -> Result<Chat, ClientError> {
        self.send(self.request(Method::GET, &format!("/api/chats/{chat_id}")))
            .await
    }

    pub async fn unread_counts(&self) -> Result<Vec<UnreadCount>, ClientError> {
        self.send(self.request(Method::GET, "/api/chats/unread")).await
    }

    /// Fetch a chat's messages, marking them read.
    pub async fn open_chat(&self, chat_id: ChatId) -> Result<Vec<Message>, ClientError> {
        self.send(self.request(Method::GET, &format!("/api/chats/{chat_id}/messages")))
            .await
    }

    pub async fn send_message(&self, chat_id: ChatId, draft: &MessageDraft) -> Result<Message, ClientError> {
        let path = format!("/api/chats/{chat_id}/messages");
        self.send(self.request(Method::POST, &path).json(draft)).await
    }

    pub async fn mark_read(&self, message_id: MessageId) -> Result<bool, ClientError> {
        let path = format!("/api/chats/messages/{message_id}/read");
        let updated: Updated = self.send(self.request(Method::PUT, &path)).await?;
        Ok(updated.updated)
    }

    pub async fn react(&self, message_id: MessageId, emoji: &str) -> Result<Message, ClientError> {
        let path = format!("/api/chats/messages/{message_id}/reactions");
        self.send(self.request(Method::POST, &path).json(&json!({ "emoji": emoji })))
            .await
    }

    pub async fn edit_message(&self, message_id: MessageId, content: &str) -> Result<Message, ClientError> {
        let path = format!("/api/chats/messages/{message_id}");
        self.send(self.request(Method::PUT, &path).json(&json!({ "content": content })))
            .await
    }

    pub async fn delete_message(&self, message_id: MessageId) -> Result<Message, ClientError> {
        let path = format!("/api/chats/messages/{message_id}");
        self.send(self.request(Method::DELETE, &path)).await
    }

    pub async fn presence(&self, user_id: UserId) -> Result<Presence, ClientError> {
        self.send(self.request(Method::GET, &format!("/api/users/{user_id}/presence")))
            .await
    }

    // ─── Contacts ───

    pub async fn list_contacts(&self) -> Result<Vec<ContactEntry>, ClientError> {
        self.send(self.request(Method::GET, "/api/contacts")).await
    }

    /// Save a contact. The email must belong to a registered principal.
    pub async fn add_contact(&self, draft: &ContactDraft) -> Result<ContactEntry, ClientError> {
        self.send(self.request(Method::POST, "/api/contacts").json(draft))
            .await
    }

    pub async fn update_contact(
        &self,
        contact_id: ContactId,
        patch: &ContactPatch,
    ) -> Result<ContactEntry, ClientError> {
        let path = format!("/api/contacts/{contact_id}");
        self.send(self.request(Method::PUT, &path).json(patch)).await
    }

    pub async fn delete_contact(&self, contact_id: ContactId) -> Result<bool, ClientError> {
        let path = format!("/api/contacts/{contact_id}");
        let deleted: Deleted = self.send(self.request(Method::DELETE, &path)).await?;
        Ok(deleted.deleted)
    }

    pub async fn search_contacts(&self, email: &str) -> Result<Vec<ContactMatch>, ClientError> {
        let request = self
            .request(Method::GET, "/api/contacts/search")
            .query(&[("email", email)]);
        self.send(request).await
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, self.config.api_url(path))
            .bearer_auth(&self.config.token)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ClientError> {
        decode(request.send().await?).await
    }
}

async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T, ClientError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp.json().await?);
    }
    let text = resp.text().await.unwrap_or_default();
    debug!(%status, "Server refused request");
    Err(ClientError::Server(failure_from_body(status, &text)))
}

fn failure_from_body(status: StatusCode, text: &str) -> CommandFailure {
    match serde_json::from_str::<ErrorBody>(text) {
        Ok(body) => CommandFailure {
            kind: body.kind,
            message: body.error,
            superseded: body.superseded,
        },
        Err(_) => {
            let kind = match status {
                StatusCode::NOT_FOUND => ErrorKind::NotFound,
                StatusCode::FORBIDDEN => ErrorKind::Forbidden,
                StatusCode::UNAUTHORIZED => ErrorKind::Authentication,
                StatusCode::CONFLICT => ErrorKind::InvalidTransition,
                StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => ErrorKind::Validation,
                _ => ErrorKind::Internal,
            };
            CommandFailure::new(kind, format!("server responded {status}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_body_keeps_superseded() {
        let text = r#"{"error":"cannot accept call x in state 'ended' (superseded)","kind":"invalid_transition","superseded":true}"#;
        let failure = failure_from_body(StatusCode::CONFLICT, text);
        assert_eq!(failure.kind, ErrorKind::InvalidTransition);
        assert!(failure.superseded);
        assert!(failure.is_stale_state());
    }

    #[test]
    fn test_unparseable_error_falls_back_to_status() {
        let failure = failure_from_body(StatusCode::FORBIDDEN, "<html>nope</html>");
        assert_eq!(failure.kind, ErrorKind::Forbidden);
        assert!(!failure.superseded);
    }

    #[test]
    fn test_create_chat_body_shape() {
        let ada = UserId::new();
        let body = CreateChatBody {
            participants: &[ada],
            name: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["participants"][0], ada.to_string());
        assert!(json.get("name").is_none());
    }

    #[test]
    fn test_contact_patch_sends_only_changed_fields() {
        let patch = ContactPatch {
            phone: Some("+1 555 0199".into()),
            ..Default::default()
        };
        assert_eq!(
            serde_json::to_value(&patch).unwrap(),
            json!({ "phone": "+1 555 0199" })
        );
    }
}
