use super::*;
use axum::{
    extract::{
        ws::{Message as AxumMessage, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
    routing::get,
    Router,
};
use serde::Deserialize;

const FAST: ReconnectPolicy = ReconnectPolicy {
    initial: Duration::from_millis(10),
    max: Duration::from_millis(50),
};

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

async fn within<T>(fut: impl std::future::Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("timed out")
}

async fn push_route(
    ws: WebSocketUpgrade,
    State(frames): State<mpsc::UnboundedSender<String>>,
) -> Response {
    ws.on_upgrade(move |socket| push_session(socket, frames))
}

/// Greets with a typing event, records the first client frame, then hangs up.
async fn push_session(mut socket: WebSocket, frames: mpsc::UnboundedSender<String>) {
    let greeting = ServerEvent::Typing {
        conversation_id: ConversationId(7),
        user_id: UserId(2),
        is_typing: true,
    };
    let text = serde_json::to_string(&greeting).expect("json");
    if socket.send(AxumMessage::Text(text)).await.is_err() {
        return;
    }
    if let Some(Ok(AxumMessage::Text(text))) = socket.recv().await {
        let _ = frames.send(text);
    }
}

#[derive(Deserialize)]
struct FeedParams {
    since: Option<i64>,
}

async fn feed_route(
    ws: WebSocketUpgrade,
    Query(params): Query<FeedParams>,
    State(resumes): State<mpsc::UnboundedSender<Option<i64>>>,
) -> Response {
    let _ = resumes.send(params.since);
    ws.on_upgrade(move |socket| feed_session(socket, params.since))
}

/// Sends one envelope past `since` and hangs up.
async fn feed_session(mut socket: WebSocket, since: Option<i64>) {
    let seq = since.unwrap_or(4) + 1;
    let envelope = FeedEnvelope {
        seq,
        event: ServerEvent::ConversationDeactivated {
            conversation_id: ConversationId(seq),
        },
    };
    let text = serde_json::to_string(&envelope).expect("json");
    let _ = socket.send(AxumMessage::Text(text)).await;
    let _ = socket.send(AxumMessage::Close(None)).await;
}

#[test]
fn socket_urls_follow_the_server_scheme() {
    let url = socket_url("http://localhost:8443", "ws", &[("user_id", "3".to_string())])
        .expect("url");
    assert_eq!(url.as_str(), "ws://localhost:8443/ws?user_id=3");

    let url = socket_url("https://chat.example.com/api/", "/feed", &[]).expect("url");
    assert_eq!(url.as_str(), "wss://chat.example.com/api/feed");
    assert!(socket_url("ftp://example.com", "ws", &[]).is_err());
}

#[test]
fn backoff_doubles_up_to_the_cap() {
    let policy = ReconnectPolicy {
        initial: Duration::from_millis(100),
        max: Duration::from_secs(1),
    };
    assert_eq!(policy.delay(0), Duration::from_millis(100));
    assert_eq!(policy.delay(2), Duration::from_millis(400));
    assert_eq!(policy.delay(30), Duration::from_secs(1));
}

#[tokio::test]
async fn push_channel_dispatches_events_and_rejoins_after_reconnect() {
    let (frames_tx, mut frames) = mpsc::unbounded_channel();
    let base = serve(
        Router::new()
            .route("/ws", get(push_route))
            .with_state(frames_tx),
    )
    .await;

    let channel = WsPushChannel::connect(&base, UserId(1), FAST).expect("channel");
    let mut typing = channel.on_typing();
    channel.join(ConversationId(7)).await.expect("join");

    let signal = within(typing.recv()).await.expect("typing");
    assert_eq!(signal.conversation_id, ConversationId(7));
    assert!(signal.is_typing);

    for _ in 0..2 {
        let raw = within(frames.recv()).await.expect("frame");
        let request: ClientRequest = serde_json::from_str(&raw).expect("request");
        assert!(matches!(
            request,
            ClientRequest::JoinConversation { conversation_id } if conversation_id == ConversationId(7)
        ));
    }
}

#[tokio::test]
async fn typing_fails_fast_while_disconnected() {
    let channel =
        WsPushChannel::connect("http://127.0.0.1:9", UserId(1), FAST).expect("channel");
    let err = channel
        .send_typing(ConversationId(1), UserId(2), true)
        .await
        .expect_err("offline");
    assert!(matches!(err, ClientError::TransportUnavailable(_)));
}

#[tokio::test]
async fn change_feed_resumes_from_last_sequence() {
    let (resumes_tx, mut resumes) = mpsc::unbounded_channel();
    let base = serve(
        Router::new()
            .route("/feed", get(feed_route))
            .with_state(resumes_tx),
    )
    .await;

    let channel = ChangeFeedChannel::connect(&base, UserId(1), None, FAST).expect("channel");
    let mut lifecycle = channel.on_lifecycle();

    assert_eq!(within(resumes.recv()).await.expect("first"), None);
    assert_eq!(
        within(lifecycle.recv()).await.expect("event"),
        LifecycleEvent::Deactivated {
            conversation_id: ConversationId(5)
        }
    );
    assert_eq!(within(resumes.recv()).await.expect("second"), Some(5));
    assert_eq!(
        within(lifecycle.recv()).await.expect("event"),
        LifecycleEvent::Deactivated {
            conversation_id: ConversationId(6)
        }
    );
}
