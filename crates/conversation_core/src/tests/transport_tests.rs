use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::{
        ws::{Message as WsFrame, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, patch, post},
    Json, Router,
};
use chrono::TimeZone;
use futures::StreamExt;
use shared::{
    domain::{MessageKind, TypingSignal},
    error::{ApiError, ErrorCode},
    protocol::{EditMessageRequest, FetchPageQuery, RealtimeOp, ServerEvent},
};
use tokio::{
    net::TcpListener,
    sync::{oneshot, Mutex},
};

use super::*;
use crate::transport::HttpBackendService;

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

fn message(id: &str, conversation: &str, body: &str, secs: i64) -> Message {
    Message {
        id: MessageId::from(id),
        conversation_id: ConversationId::from(conversation),
        sender_id: UserId::from("alice"),
        sender_display_name: "Alice".into(),
        avatar_ref: None,
        body: body.into(),
        kind: MessageKind::Text,
        created_at: at(secs),
        edited_at: None,
        is_edited: false,
        reply_to_id: None,
        attachment: None,
        client_token: None,
    }
}

#[derive(Clone, Default)]
struct ServerState {
    edits: Arc<Mutex<Option<oneshot::Sender<(String, EditMessageRequest)>>>>,
    ws_query: Arc<Mutex<Option<HashMap<String, String>>>>,
}

async fn handle_send(
    Path(conversation_id): Path<String>,
    Json(request): Json<SendMessageRequest>,
) -> Json<Message> {
    let mut confirmed = message("srv-1", &conversation_id, &request.body, 0);
    confirmed.sender_id = request.sender_id;
    confirmed.client_token = request.client_token;
    Json(confirmed)
}

async fn handle_fetch(
    Path(conversation_id): Path<String>,
    Query(query): Query<FetchPageQuery>,
) -> Json<Vec<Message>> {
    let newest = query.before.map_or(100, |before| (before - at(0)).num_seconds());
    let page = (1..=i64::from(query.limit))
        .rev()
        .map(|n| message(&format!("m{}", newest - n), &conversation_id, "x", newest - n))
        .collect();
    Json(page)
}

async fn handle_edit(
    State(state): State<ServerState>,
    Path(message_id): Path<String>,
    Json(request): Json<EditMessageRequest>,
) -> StatusCode {
    if let Some(tx) = state.edits.lock().await.take() {
        let _ = tx.send((message_id, request));
    }
    StatusCode::NO_CONTENT
}

async fn handle_forbidden() -> impl IntoResponse {
    (
        StatusCode::FORBIDDEN,
        Json(ApiError::new(ErrorCode::Forbidden, "not your message")),
    )
}

async fn handle_plain_failure() -> impl IntoResponse {
    (StatusCode::BAD_GATEWAY, "upstream down")
}

async fn handle_ws(
    State(state): State<ServerState>,
    Query(query): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let conversation_id = ConversationId::new(query.get("conversation_id").cloned().unwrap_or_default());
    *state.ws_query.lock().await = Some(query);
    ws.on_upgrade(move |mut socket| async move {
        let frames = [
            ServerEvent::Error(ApiError::new(ErrorCode::RateLimited, "slow down")),
            ServerEvent::Typing {
                conversation_id: conversation_id.clone(),
                signal: TypingSignal {
                    user_id: UserId::from("bob"),
                    display_name: "Bob".into(),
                    expires_at: at(60),
                },
            },
            ServerEvent::Realtime(RealtimeEvent::message(
                RealtimeOp::Insert,
                message("srv-7", conversation_id.as_str(), "hello", 7),
            )),
            ServerEvent::TypingStopped {
                conversation_id: conversation_id.clone(),
                user_id: UserId::from("bob"),
            },
        ];
        let _ = socket.send(WsFrame::Text("not json".into())).await;
        for frame in frames {
            let Ok(text) = serde_json::to_string(&frame) else {
                continue;
            };
            if socket.send(WsFrame::Text(text)).await.is_err() {
                return;
            }
        }
    })
}

async fn spawn_backend_server() -> anyhow::Result<(String, ServerState)> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let state = ServerState::default();
    let app = Router::new()
        .route("/conversations/:id/messages", post(handle_send).get(handle_fetch))
        .route("/messages/:id", patch(handle_edit))
        .route("/messages/delete", post(handle_forbidden))
        .route("/messages/:id/reactions", post(handle_plain_failure))
        .route("/ws", get(handle_ws))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((format!("http://{addr}"), state))
}

#[tokio::test]
async fn send_message_posts_to_conversation_and_decodes_confirmation() {
    let (server_url, _) = spawn_backend_server().await.expect("spawn server");
    let backend = HttpBackendService::new(format!("{server_url}/"), UserId::from("alice"));

    let confirmed = backend
        .send_message(
            &ConversationId::from("conv-9"),
            SendMessageRequest {
                sender_id: UserId::from("alice"),
                body: "hi".into(),
                reply_to_id: None,
                attachment: None,
                client_token: Some("tok".into()),
            },
        )
        .await
        .expect("send");

    assert_eq!(confirmed.id, MessageId::from("srv-1"));
    assert_eq!(confirmed.conversation_id, ConversationId::from("conv-9"));
    assert_eq!(confirmed.client_token.as_deref(), Some("tok"));
}

#[tokio::test]
async fn fetch_page_sends_cursor_and_limit() {
    let (server_url, _) = spawn_backend_server().await.expect("spawn server");
    let backend = HttpBackendService::new(server_url, UserId::from("alice"));
    let conversation = ConversationId::from("conv");

    let newest = backend
        .fetch_page(&conversation, None, 3)
        .await
        .expect("newest page");
    let ids: Vec<&str> = newest.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["m97", "m98", "m99"]);

    let older = backend
        .fetch_page(&conversation, Some(at(97)), 2)
        .await
        .expect("older page");
    let ids: Vec<&str> = older.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["m95", "m96"]);
}

#[tokio::test]
async fn edit_message_patches_body() {
    let (server_url, state) = spawn_backend_server().await.expect("spawn server");
    let (tx, rx) = oneshot::channel();
    *state.edits.lock().await = Some(tx);
    let backend = HttpBackendService::new(server_url, UserId::from("alice"));

    backend
        .edit_message(&MessageId::from("srv-3"), "fixed typo")
        .await
        .expect("edit");

    let (message_id, request) = rx.await.expect("edit received");
    assert_eq!(message_id, "srv-3");
    assert_eq!(request.body, "fixed typo");
}

#[tokio::test]
async fn ids_are_percent_encoded_into_one_path_segment() {
    let (server_url, state) = spawn_backend_server().await.expect("spawn server");
    let (tx, rx) = oneshot::channel();
    *state.edits.lock().await = Some(tx);
    let backend = HttpBackendService::new(server_url, UserId::from("alice"));

    backend
        .edit_message(&MessageId::from("a/b?c#d"), "odd id")
        .await
        .expect("edit");

    let (message_id, request) = rx.await.expect("edit received");
    assert_eq!(message_id, "a/b?c#d");
    assert_eq!(request.body, "odd id");

    let confirmed = backend
        .send_message(
            &ConversationId::from("team/general"),
            SendMessageRequest {
                sender_id: UserId::from("alice"),
                body: "hi".into(),
                reply_to_id: None,
                attachment: None,
                client_token: None,
            },
        )
        .await
        .expect("send");
    assert_eq!(confirmed.conversation_id, ConversationId::from("team/general"));
}

#[tokio::test]
async fn api_error_bodies_are_decoded() {
    let (server_url, _) = spawn_backend_server().await.expect("spawn server");
    let backend = HttpBackendService::new(server_url, UserId::from("alice"));

    let err = backend
        .delete_messages(&[MessageId::from("srv-1")])
        .await
        .expect_err("forbidden");
    let api = err.downcast_ref::<ApiError>().expect("api error");
    assert_eq!(api.code, ErrorCode::Forbidden);
    assert_eq!(api.message, "not your message");
}

#[tokio::test]
async fn non_json_failures_keep_status() {
    let (server_url, _) = spawn_backend_server().await.expect("spawn server");
    let backend = HttpBackendService::new(server_url, UserId::from("alice"));

    let err = backend
        .add_reaction(&MessageId::from("srv-1"), "👍")
        .await
        .expect_err("bad gateway");
    assert!(err.to_string().contains("502"));
    assert!(err.downcast_ref::<ApiError>().is_none());
}

#[tokio::test]
async fn websocket_frames_are_split_into_feeds() {
    let (server_url, state) = spawn_backend_server().await.expect("spawn server");
    let backend = HttpBackendService::new(server_url, UserId::from("alice"));
    let conversation = ConversationId::from("conv-ws");

    let mut realtime = backend.subscribe(&conversation).await.expect("subscribe");
    let event = realtime.next().await.expect("realtime event");
    assert_eq!(event.op, RealtimeOp::Insert);
    assert_eq!(event.conversation_id, conversation);
    assert!(realtime.next().await.is_none());

    let query = state.ws_query.lock().await.clone().expect("ws query");
    assert_eq!(query.get("conversation_id").map(String::as_str), Some("conv-ws"));
    assert_eq!(query.get("user_id").map(String::as_str), Some("alice"));

    let typing: Vec<TypingUpdate> = backend
        .subscribe_typing(&conversation)
        .await
        .expect("subscribe typing")
        .collect()
        .await;
    assert_eq!(typing.len(), 2);
    assert!(matches!(&typing[0], TypingUpdate::Started(signal) if signal.display_name == "Bob"));
    assert_eq!(typing[1], TypingUpdate::Stopped(UserId::from("bob")));
}

#[tokio::test]
async fn websocket_requires_http_scheme() {
    let backend = HttpBackendService::new("ftp://example.invalid", UserId::from("alice"));
    assert!(backend.subscribe(&ConversationId::from("c")).await.is_err());
}
