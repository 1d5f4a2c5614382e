use super::*;
use axum::{
    extract::{Path, Query},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use shared::error::ErrorCode;

#[derive(Deserialize)]
struct EchoQuery {
    user_id: i64,
}

async fn echo_send(
    Path(conversation_id): Path<i64>,
    Query(q): Query<EchoQuery>,
    Json(req): Json<SendMessageRequest>,
) -> Json<MessagePayload> {
    Json(MessagePayload {
        message_id: MessageId(77),
        conversation_id: ConversationId(conversation_id),
        sender_id: UserId(q.user_id),
        receiver_id: req.receiver_id,
        content: req.message.content,
        reply_to: req.message.reply_to,
        client_ref: req.message.client_ref,
        attachments: Vec::new(),
        created_at: Utc::now(),
        delivered_at: None,
        seen_at: None,
        retracted: false,
    })
}

async fn reject_seen() -> (StatusCode, Json<ApiError>) {
    (
        StatusCode::FORBIDDEN,
        Json(ApiError::new(ErrorCode::NotReceiver, "not yours")),
    )
}

async fn broken() -> (StatusCode, &'static str) {
    (StatusCode::BAD_GATEWAY, "upstream down")
}

async fn spawn_server() -> String {
    let app = Router::new()
        .route("/api/conversations/:conversation_id/messages", post(echo_send))
        .route("/api/messages/:message_id/seen", post(reject_seen))
        .route("/api/conversations", get(broken));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}/api")
}

#[tokio::test]
async fn send_posts_body_and_user_query() {
    let base = spawn_server().await;
    let ledger = HttpLedger::new(&base, UserId(5), DEFAULT_REQUEST_TIMEOUT).expect("client");
    let message = OutgoingMessage {
        content: "hi".to_string(),
        client_ref: Some("local-9".to_string()),
        ..OutgoingMessage::default()
    };
    let sent = ledger
        .send_message(ConversationId(3), UserId(6), &message)
        .await
        .expect("sent");
    assert_eq!(sent.conversation_id, ConversationId(3));
    assert_eq!(sent.sender_id, UserId(5));
    assert_eq!(sent.receiver_id, UserId(6));
    assert_eq!(sent.client_ref.as_deref(), Some("local-9"));
}

#[tokio::test]
async fn api_error_bodies_become_rejections() {
    let base = spawn_server().await;
    let ledger = HttpLedger::new(&base, UserId(5), DEFAULT_REQUEST_TIMEOUT).expect("client");
    let err = ledger.mark_seen(MessageId(1)).await.expect_err("rejected");
    assert_eq!(err.code(), ErrorCode::NotReceiver);
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn non_api_failures_are_transport_errors() {
    let base = spawn_server().await;
    let ledger = HttpLedger::new(&base, UserId(5), DEFAULT_REQUEST_TIMEOUT).expect("client");
    let err = ledger.list_conversations().await.expect_err("failed");
    assert!(matches!(err, ClientError::TransportUnavailable(_)));
    assert!(err.is_retryable());
}

#[test]
fn rejects_non_http_urls() {
    assert!(HttpLedger::new("ftp://example.com", UserId(1), DEFAULT_REQUEST_TIMEOUT).is_err());
    assert!(HttpLedger::new("not a url", UserId(1), DEFAULT_REQUEST_TIMEOUT).is_err());
}
