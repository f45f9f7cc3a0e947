use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, Method, StatusCode},
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use parley_shared::constants::PROTOCOL_VERSION;
use parley_shared::models::{
    Call, CallLog, Chat, ChatSummary, ContactEntry, ContactMatch, Message, Presence, UnreadCount,
    User,
};
use parley_shared::protocol::{ContactDraft, ContactPatch, MessageDraft};
use parley_shared::types::{CallId, CallType, ChatId, ContactId, MessageId, UserId};
use parley_store::Database;

use crate::auth::{verify_admin_token, CredentialVerifier, Principal, TokenAuthority};
use crate::calls::CallSessionManager;
use crate::config::ServerConfig;
use crate::contacts::ContactDirectory;
use crate::error::{OrNotFound, ServerError};
use crate::gateway;
use crate::messages::MessageDeliveryManager;
use crate::presence::PresenceTracker;
use crate::relay::EventRelay;
use crate::store::StoreHandle;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub store: StoreHandle,
    pub relay: EventRelay,
    pub calls: CallSessionManager,
    pub messages: MessageDeliveryManager,
    pub presence: PresenceTracker,
    pub contacts: ContactDirectory,
    pub verifier: Arc<dyn CredentialVerifier>,
    pub tokens: Arc<TokenAuthority>,
}

impl AppState {
    /// Wire every manager to one store and one relay.
    pub fn new(config: ServerConfig, db: Database) -> Result<Self, ServerError> {
        let tokens = Arc::new(TokenAuthority::from_config(&config)?);
        let store = StoreHandle::new(db);
        let relay = EventRelay::new(config.relay_buffer);

        Ok(Self {
            calls: CallSessionManager::new(store.clone(), relay.clone(), config.ring_timeout),
            messages: MessageDeliveryManager::new(store.clone(), relay.clone()),
            presence: PresenceTracker::new(store.clone(), relay.clone(), config.presence_scope),
            contacts: ContactDirectory::new(store.clone()),
            verifier: tokens.clone(),
            tokens,
            store,
            relay,
            config: Arc::new(config),
        })
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/info", get(server_info))
        .route("/ws", get(gateway::ws_handler))
        .route("/admin/users", post(admin_create_user))
        .route("/admin/tokens", post(admin_issue_token))
        // Calls
        .route("/api/calls/initiate", post(initiate_call))
        .route("/api/calls/history", get(call_history))
        .route("/api/calls/logs", get(call_logs))
        .route("/api/calls/:id", get(get_call))
        .route("/api/calls/:id/accept", post(accept_call))
        .route("/api/calls/:id/reject", post(reject_call))
        .route("/api/calls/:id/cancel", post(cancel_call))
        .route("/api/calls/:id/end", post(end_call))
        // Chats and messages
        .route("/api/chats", post(create_chat).get(list_chats))
        .route("/api/chats/unread", get(unread_counts))
        .route("/api/chats/:id", get(get_chat))
        .route("/api/chats/:id/messages", get(open_chat).post(send_message))
        .route("/api/chats/messages/:id/read", put(mark_read))
        .route("/api/chats/messages/:id/reactions", post(react))
        .route(
            "/api/chats/messages/:id",
            put(edit_message).delete(delete_message),
        )
        .route("/api/users/:id/presence", get(user_presence))
        .route("/api/contacts", get(list_contacts).post(add_contact))
        .route("/api/contacts/search", get(search_contacts))
        .route(
            "/api/contacts/:id",
            put(update_contact).delete(delete_contact),
        )
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ─── Server ───

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct ServerInfoResponse {
    name: String,
    version: &'static str,
    protocol: &'static str,
    connections: usize,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn server_info(State(state): State<AppState>) -> Json<ServerInfoResponse> {
    Json(ServerInfoResponse {
        name: state.config.instance_name.clone(),
        version: env!("CARGO_PKG_VERSION"),
        protocol: PROTOCOL_VERSION,
        connections: state.relay.connection_count().await,
    })
}

// ─── Admin ───

#[derive(Deserialize)]
struct CreateUserRequest {
    name: String,
    email: String,
}

#[derive(Serialize)]
struct CreateUserResponse {
    user: User,
    token: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IssueTokenRequest {
    user_id: UserId,
}

async fn admin_create_user(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<CreateUserResponse>), ServerError> {
    verify_admin_token(&headers, &state.config)?;

    let name = req.name.trim();
    let email = req.email.trim().to_lowercase();
    if name.is_empty() {
        return Err(ServerError::Validation("name is required".into()));
    }
    if !email.contains('@') {
        return Err(ServerError::Validation(format!("invalid email: {email}")));
    }

    let user = User {
        id: UserId::new(),
        name: name.to_string(),
        email,
        is_online: false,
        last_seen: None,
        created_at: Utc::now(),
    };
    state.store.with(|db| -> Result<(), ServerError> {
        if db.find_user_by_email(&user.email)?.is_some() {
            return Err(ServerError::Validation(format!(
                "email already registered: {}",
                user.email
            )));
        }
        db.insert_user(&user)?;
        Ok(())
    })?;

    info!(user = %user.id, "Admin created user");
    let token = state.tokens.issue(user.id);
    Ok((StatusCode::CREATED, Json(CreateUserResponse { user, token })))
}

async fn admin_issue_token(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<IssueTokenRequest>,
) -> Result<Json<Value>, ServerError> {
    verify_admin_token(&headers, &state.config)?;

    state
        .store
        .with(|db| db.get_user(req.user_id))
        .or_not_found("user", req.user_id)?;

    info!(user = %req.user_id, "Admin issued session token");
    Ok(Json(json!({ "token": state.tokens.issue(req.user_id) })))
}

// ─── Calls ───

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitiateCallRequest {
    callee_id: UserId,
    call_type: CallType,
    #[serde(default)]
    chat_id: Option<ChatId>,
}

async fn initiate_call(
    State(state): State<AppState>,
    Principal(user): Principal,
    Json(req): Json<InitiateCallRequest>,
) -> Result<(StatusCode, Json<Call>), ServerError> {
    let call = state
        .calls
        .initiate(user, req.callee_id, req.call_type, req.chat_id)
        .await?;
    Ok((StatusCode::CREATED, Json(call)))
}

async fn accept_call(
    State(state): State<AppState>,
    Principal(user): Principal,
    Path(id): Path<Uuid>,
) -> Result<Json<Call>, ServerError> {
    Ok(Json(state.calls.accept(CallId(id), user).await?))
}

async fn reject_call(
    State(state): State<AppState>,
    Principal(user): Principal,
    Path(id): Path<Uuid>,
) -> Result<Json<Call>, ServerError> {
    Ok(Json(state.calls.reject(CallId(id), user).await?))
}

async fn cancel_call(
    State(state): State<AppState>,
    Principal(user): Principal,
    Path(id): Path<Uuid>,
) -> Result<Json<Call>, ServerError> {
    Ok(Json(state.calls.cancel(CallId(id), user).await?))
}

async fn end_call(
    State(state): State<AppState>,
    Principal(user): Principal,
    Path(id): Path<Uuid>,
) -> Result<Json<Call>, ServerError> {
    Ok(Json(state.calls.end(CallId(id), user).await?))
}

async fn get_call(
    State(state): State<AppState>,
    Principal(user): Principal,
    Path(id): Path<Uuid>,
) -> Result<Json<Call>, ServerError> {
    Ok(Json(state.calls.get(CallId(id), user)?))
}

async fn call_history(
    State(state): State<AppState>,
    Principal(user): Principal,
) -> Result<Json<Vec<Call>>, ServerError> {
    Ok(Json(state.calls.history(user)?))
}

async fn call_logs(
    State(state): State<AppState>,
    Principal(user): Principal,
) -> Result<Json<Vec<CallLog>>, ServerError> {
    Ok(Json(state.calls.logs(user)?))
}

// ─── Chats ───

#[derive(Deserialize)]
struct CreateChatRequest {
    participants: Vec<UserId>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Deserialize)]
struct ReactRequest {
    emoji: String,
}

#[derive(Deserialize)]
struct EditRequest {
    content: String,
}

async fn create_chat(
    State(state): State<AppState>,
    Principal(user): Principal,
    Json(req): Json<CreateChatRequest>,
) -> Result<(StatusCode, Json<Chat>), ServerError> {
    let (chat, created) = state
        .messages
        .create_chat(user, req.participants, req.name)
        .await?;
    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(chat)))
}

async fn list_chats(
    State(state): State<AppState>,
    Principal(user): Principal,
) -> Result<Json<Vec<ChatSummary>>, ServerError> {
    Ok(Json(state.messages.list_chats(user)?))
}

async fn unread_counts(
    State(state): State<AppState>,
    Principal(user): Principal,
) -> Result<Json<Vec<UnreadCount>>, ServerError> {
    Ok(Json(state.messages.unread_counts(user)?))
}

async fn get_chat(
    State(state): State<AppState>,
    Principal(user): Principal,
    Path(id): Path<Uuid>,
) -> Result<Json<Chat>, ServerError> {
    Ok(Json(state.messages.get_chat(ChatId(id), user)?))
}

/// Returns the chat's messages and marks the caller's unread ones as read.
async fn open_chat(
    State(state): State<AppState>,
    Principal(user): Principal,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Message>>, ServerError> {
    Ok(Json(state.messages.open_chat(ChatId(id), user).await?))
}

async fn send_message(
    State(state): State<AppState>,
    Principal(user): Principal,
    Path(id): Path<Uuid>,
    Json(draft): Json<MessageDraft>,
) -> Result<(StatusCode, Json<Message>), ServerError> {
    let message = state.messages.send(ChatId(id), user, draft).await?;
    Ok((StatusCode::CREATED, Json(message)))
}

async fn mark_read(
    State(state): State<AppState>,
    Principal(user): Principal,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ServerError> {
    let updated = state.messages.mark_read(MessageId(id), user).await?;
    Ok(Json(json!({ "updated": updated })))
}

async fn react(
    State(state): State<AppState>,
    Principal(user): Principal,
    Path(id): Path<Uuid>,
    Json(req): Json<ReactRequest>,
) -> Result<Json<Message>, ServerError> {
    Ok(Json(state.messages.react(MessageId(id), user, &req.emoji).await?))
}

async fn edit_message(
    State(state): State<AppState>,
    Principal(user): Principal,
    Path(id): Path<Uuid>,
    Json(req): Json<EditRequest>,
) -> Result<Json<Message>, ServerError> {
    Ok(Json(state.messages.edit(MessageId(id), user, &req.content).await?))
}

async fn delete_message(
    State(state): State<AppState>,
    Principal(user): Principal,
    Path(id): Path<Uuid>,
) -> Result<Json<Message>, ServerError> {
    Ok(Json(state.messages.delete(MessageId(id), user).await?))
}

// ─── Users ───

async fn user_presence(
    State(state): State<AppState>,
    Principal(_): Principal,
    Path(id): Path<Uuid>,
) -> Result<Json<Presence>, ServerError> {
    Ok(Json(state.presence.status(UserId(id))?))
}

// ─── Contacts ───

#[derive(Deserialize)]
struct SearchParams {
    #[serde(default)]
    email: Option<String>,
}

async fn list_contacts(
    State(state): State<AppState>,
    Principal(user): Principal,
) -> Result<Json<Vec<ContactEntry>>, ServerError> {
    Ok(Json(state.contacts.list(user)?))
}

async fn add_contact(
    State(state): State<AppState>,
    Principal(user): Principal,
    Json(draft): Json<ContactDraft>,
) -> Result<(StatusCode, Json<ContactEntry>), ServerError> {
    let entry = state.contacts.add(user, draft)?;
    Ok((StatusCode::CREATED, Json(entry)))
}

async fn update_contact(
    State(state): State<AppState>,
    Principal(user): Principal,
    Path(id): Path<Uuid>,
    Json(patch): Json<ContactPatch>,
) -> Result<Json<ContactEntry>, ServerError> {
    Ok(Json(state.contacts.update(user, ContactId(id), patch)?))
}

async fn delete_contact(
    State(state): State<AppState>,
    Principal(user): Principal,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ServerError> {
    state.contacts.remove(user, ContactId(id))?;
    Ok(Json(json!({ "deleted": true })))
}

async fn search_contacts(
    State(state): State<AppState>,
    Principal(user): Principal,
    Query(params): Query<SearchParams>,
) -> Result<Json<Vec<ContactMatch>>, ServerError> {
    let email = params.email.unwrap_or_default();
    Ok(Json(state.contacts.search(user, &email)?))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::testing::{add_user, Harness};

    fn request(method: Method, uri: &str, token: Option<&str>, body: Option<Value>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn send(h: &Harness, req: Request<Body>) -> (StatusCode, Value) {
        let response = build_router(h.state.clone()).oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    #[tokio::test]
    async fn test_health() {
        let h = Harness::new();
        let (status, body) = send(&h, request(Method::GET, "/health", None, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_api_requires_bearer_token() {
        let h = Harness::new();
        let (status, body) = send(&h, request(Method::GET, "/api/chats", None, None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["kind"], "authentication");

        let (status, _) = send(&h, request(Method::GET, "/api/chats", Some("forged"), None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_admin_provisions_users() {
        let h = Harness::new();
        let body = json!({ "name": "Ada", "email": "Ada@Example.com" });

        let (status, _) = send(&h, request(Method::POST, "/admin/users", Some("wrong"), Some(body.clone()))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, created) =
            send(&h, request(Method::POST, "/admin/users", Some("admin-secret"), Some(body.clone()))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["user"]["email"], "ada@example.com");
        let token = created["token"].as_str().unwrap();
        let (status, _) = send(&h, request(Method::GET, "/api/chats", Some(token), None)).await;
        assert_eq!(status, StatusCode::OK);

        let (status, dup) =
            send(&h, request(Method::POST, "/admin/users", Some("admin-secret"), Some(body))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(dup["kind"], "validation");

        let (status, _) = send(
            &h,
            request(
                Method::POST,
                "/admin/tokens",
                Some("admin-secret"),
                Some(json!({ "userId": UserId::new() })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_chat_flow_over_rest() {
        let h = Harness::new();
        let ada = add_user(&h, "Ada");
        let bob = add_user(&h, "Bob");
        let ada_token = h.state.tokens.issue(ada.id);
        let bob_token = h.state.tokens.issue(bob.id);

        let (status, chat) = send(
            &h,
            request(Method::POST, "/api/chats", Some(&ada_token), Some(json!({ "participants": [bob.id] }))),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let chat_id = chat["id"].as_str().unwrap().to_string();

        let (status, _) = send(
            &h,
            request(Method::POST, "/api/chats", Some(&bob_token), Some(json!({ "participants": [ada.id] }))),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, message) = send(
            &h,
            request(
                Method::POST,
                &format!("/api/chats/{chat_id}/messages"),
                Some(&ada_token),
                Some(json!({ "content": "hi" })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(message["type"], "text");
        let message_id = message["id"].as_str().unwrap().to_string();

        let (_, unread) = send(&h, request(Method::GET, "/api/chats/unread", Some(&bob_token), None)).await;
        assert_eq!(unread[0]["count"], 1);

        let (status, _) = send(
            &h,
            request(
                Method::PUT,
                &format!("/api/chats/messages/{message_id}"),
                Some(&bob_token),
                Some(json!({ "content": "mine now" })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, messages) = send(
            &h,
            request(Method::GET, &format!("/api/chats/{chat_id}/messages"), Some(&bob_token), None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(messages.as_array().unwrap().len(), 1);

        let (_, unread) = send(&h, request(Method::GET, "/api/chats/unread", Some(&bob_token), None)).await;
        assert_eq!(unread[0]["count"], 0);

        let (status, read) = send(
            &h,
            request(Method::PUT, &format!("/api/chats/messages/{message_id}/read"), Some(&bob_token), None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(read["updated"], false);

        let (status, deleted) = send(
            &h,
            request(Method::DELETE, &format!("/api/chats/messages/{message_id}"), Some(&ada_token), None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(deleted["isDeleted"], true);
    }

    #[tokio::test]
    async fn test_call_conflict_maps_to_409() {
        let h = Harness::new();
        let ada = add_user(&h, "Ada");
        let bob = add_user(&h, "Bob");
        let ada_token = h.state.tokens.issue(ada.id);
        let bob_token = h.state.tokens.issue(bob.id);

        let (status, call) = send(
            &h,
            request(
                Method::POST,
                "/api/calls/initiate",
                Some(&ada_token),
                Some(json!({ "calleeId": bob.id, "callType": "video" })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let call_id = call["id"].as_str().unwrap().to_string();

        let (status, _) = send(
            &h,
            request(Method::POST, &format!("/api/calls/{call_id}/cancel"), Some(&ada_token), None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(
            &h,
            request(Method::POST, &format!("/api/calls/{call_id}/accept"), Some(&bob_token), None),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["kind"], "invalid_transition");
        assert_eq!(body["superseded"], true);

        let (status, history) = send(&h, request(Method::GET, "/api/calls/history", Some(&bob_token), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(history[0]["status"], "ended");

        let (_, logs) = send(&h, request(Method::GET, "/api/calls/logs", Some(&bob_token), None)).await;
        assert_eq!(logs[0]["outcome"], "missed");
    }

    #[tokio::test]
    async fn test_contact_directory_over_rest() {
        let h = Harness::new();
        let ada = add_user(&h, "Ada");
        let bob = add_user(&h, "Bob");
        let ada_token = h.state.tokens.issue(ada.id);
        let bob_token = h.state.tokens.issue(bob.id);

        let draft = json!({ "name": "Bob", "phone": "+1 555 0100", "email": "BOB@example.com" });
        let (status, saved) = send(
            &h,
            request(Method::POST, "/api/contacts", Some(&ada_token), Some(draft.clone())),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(saved["email"], "bob@example.com");
        assert_eq!(saved["user"]["id"], json!(bob.id));
        let contact_id = saved["id"].as_str().unwrap().to_string();

        let (status, body) = send(
            &h,
            request(Method::POST, "/api/contacts", Some(&ada_token), Some(draft)),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "validation");

        let (status, found) = send(
            &h,
            request(Method::GET, "/api/contacts/search?email=bob", Some(&ada_token), None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(found[0]["isSaved"], true);

        let (status, _) = send(&h, request(Method::GET, "/api/contacts/search", Some(&ada_token), None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            &h,
            request(
                Method::PUT,
                &format!("/api/contacts/{contact_id}"),
                Some(&bob_token),
                Some(json!({ "name": "Mine" })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, updated) = send(
            &h,
            request(
                Method::PUT,
                &format!("/api/contacts/{contact_id}"),
                Some(&ada_token),
                Some(json!({ "name": "Robert" })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["name"], "Robert");

        let (_, listed) = send(&h, request(Method::GET, "/api/contacts", Some(&ada_token), None)).await;
        assert_eq!(listed.as_array().unwrap().len(), 1);

        let (status, deleted) = send(
            &h,
            request(Method::DELETE, &format!("/api/contacts/{contact_id}"), Some(&ada_token), None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(deleted["deleted"], true);

        let (status, _) = send(
            &h,
            request(Method::DELETE, &format!("/api/contacts/{contact_id}"), Some(&ada_token), None),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
