use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use server_api::{
    conversation_peer, deactivate_conversation, hide_message, list_conversations, list_messages,
    mark_delivered, mark_seen, message_received, retract_message, send_message, unread_count,
    ApiContext, StatusUpdate,
};
use shared::{
    domain::{ConversationId, MessageId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        ClientRequest, ConversationSummary, HideResponse, MessagePayload, RetractResponse,
        SendMessageRequest, ServerEvent, StatusChangePayload, UnreadCountResponse,
    },
};
use storage::Storage;
use tokio::sync::mpsc;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

mod app_state;
mod change_feed;
mod config;
mod gateway;

use app_state::AppState;
use config::{load_settings, prepare_database_url};
use gateway::SessionId;

type HttpError = (StatusCode, Json<ApiError>);

#[derive(Debug, Deserialize)]
struct UserQuery {
    user_id: i64,
}

#[derive(Debug, Deserialize)]
struct ListMessagesQuery {
    user_id: i64,
    limit: Option<u32>,
    before: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct FeedQuery {
    user_id: i64,
    since: Option<i64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let state = AppState::new(
        ApiContext { storage },
        settings.event_buffer,
        settings.change_feed_batch,
    );
    let _poller = change_feed::spawn_poller(
        state.api.clone(),
        state.feed.clone(),
        settings.change_feed_interval(),
        settings.change_feed_batch,
    );
    let app = build_router(Arc::new(state), settings.max_body_bytes);

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/conversations", get(http_list_conversations))
        .route(
            "/conversations/:conversation_id/messages",
            get(http_list_messages).post(http_send_message),
        )
        .route(
            "/conversations/:conversation_id/unread",
            get(http_unread_count),
        )
        .route(
            "/conversations/:conversation_id/deactivate",
            post(http_deactivate_conversation),
        )
        .route("/messages/:message_id/delivered", post(http_mark_delivered))
        .route("/messages/:message_id/seen", post(http_mark_seen))
        .route("/messages/:message_id/hide", post(http_hide_message))
        .route("/messages/:message_id/retract", post(http_retract_message))
        .route("/ws", get(ws_handler))
        .route("/feed", get(feed_handler))
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .with_state(state)
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Forbidden | ErrorCode::NotReceiver | ErrorCode::NotSender => {
            StatusCode::FORBIDDEN
        }
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::AlreadyRetracted => StatusCode::CONFLICT,
        ErrorCode::TransportUnavailable | ErrorCode::PersistenceFailure => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(err: ApiError) -> HttpError {
    (status_for(err.code), Json(err))
}

async fn healthz(State(state): State<Arc<AppState>>) -> Result<&'static str, HttpError> {
    state.api.storage.health_check().await.map_err(|e| {
        reject(ApiError::new(
            ErrorCode::PersistenceFailure,
            e.to_string(),
        ))
    })?;
    Ok("ok")
}

async fn http_list_conversations(
    State(state): State<Arc<AppState>>,
    Query(q): Query<UserQuery>,
) -> Result<Json<Vec<ConversationSummary>>, HttpError> {
    let conversations = list_conversations(&state.api, UserId(q.user_id))
        .await
        .map_err(reject)?;
    Ok(Json(conversations))
}

async fn http_list_messages(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<i64>,
    Query(q): Query<ListMessagesQuery>,
) -> Result<Json<Vec<MessagePayload>>, HttpError> {
    let messages = list_messages(
        &state.api,
        UserId(q.user_id),
        ConversationId(conversation_id),
        q.limit,
        q.before.map(MessageId),
    )
    .await
    .map_err(reject)?;
    Ok(Json(messages))
}

async fn http_send_message(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<i64>,
    Query(q): Query<UserQuery>,
    Json(req): Json<SendMessageRequest>,
) -> Result<Json<MessagePayload>, HttpError> {
    let conversation_id = ConversationId(conversation_id);
    let message = send_message(
        &state.api,
        UserId(q.user_id),
        conversation_id,
        req.receiver_id,
        &req.message,
    )
    .await
    .map_err(reject)?;
    state
        .gateway
        .publish(conversation_id, &message_received(message.clone()))
        .await;
    Ok(Json(message))
}

async fn http_unread_count(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<i64>,
    Query(q): Query<UserQuery>,
) -> Result<Json<UnreadCountResponse>, HttpError> {
    let unread = unread_count(&state.api, UserId(q.user_id), ConversationId(conversation_id))
        .await
        .map_err(reject)?;
    Ok(Json(unread))
}

async fn http_deactivate_conversation(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<i64>,
    Query(q): Query<UserQuery>,
) -> Result<StatusCode, HttpError> {
    let conversation_id = ConversationId(conversation_id);
    if let Some(event) = deactivate_conversation(&state.api, UserId(q.user_id), conversation_id)
        .await
        .map_err(reject)?
    {
        state.gateway.publish(conversation_id, &event).await;
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn http_mark_delivered(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<i64>,
    Query(q): Query<UserQuery>,
) -> Result<Json<StatusChangePayload>, HttpError> {
    let update = mark_delivered(&state.api, UserId(q.user_id), MessageId(message_id))
        .await
        .map_err(reject)?;
    Ok(Json(publish_status(&state, update).await))
}

async fn http_mark_seen(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<i64>,
    Query(q): Query<UserQuery>,
) -> Result<Json<StatusChangePayload>, HttpError> {
    let update = mark_seen(&state.api, UserId(q.user_id), MessageId(message_id))
        .await
        .map_err(reject)?;
    Ok(Json(publish_status(&state, update).await))
}

/// Status changes only interest the sender; the receiver made them.
async fn publish_status(state: &AppState, update: StatusUpdate) -> StatusChangePayload {
    if let Some(event) = update.event() {
        state
            .gateway
            .publish_to_user(update.change.conversation_id, update.change.sender_id, &event)
            .await;
    }
    update.change
}

async fn http_hide_message(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<i64>,
    Query(q): Query<UserQuery>,
) -> Result<Json<HideResponse>, HttpError> {
    let user_id = UserId(q.user_id);
    let message_id = MessageId(message_id);
    let event = hide_message(&state.api, user_id, message_id)
        .await
        .map_err(reject)?;
    if let ServerEvent::MessageHidden {
        conversation_id, ..
    } = &event
    {
        state
            .gateway
            .publish_to_user(*conversation_id, user_id, &event)
            .await;
    }
    Ok(Json(HideResponse {
        message_id,
        hidden: true,
    }))
}

async fn http_retract_message(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<i64>,
    Query(q): Query<UserQuery>,
) -> Result<Json<RetractResponse>, HttpError> {
    let message_id = MessageId(message_id);
    let event = retract_message(&state.api, UserId(q.user_id), message_id)
        .await
        .map_err(reject)?;
    if let ServerEvent::MessageRetracted {
        conversation_id, ..
    } = &event
    {
        state.gateway.publish(*conversation_id, &event).await;
    }
    Ok(Json(RetractResponse {
        message_id,
        retracted: true,
    }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<UserQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(state, socket, UserId(q.user_id)))
}

async fn ws_connection(state: Arc<AppState>, socket: WebSocket, user_id: UserId) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let session_id = state.gateway.register(user_id, tx).await;

    let send_task = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = receiver.next().await {
        let Message::Text(text) = msg else {
            continue;
        };
        match serde_json::from_str::<ClientRequest>(&text) {
            Ok(request) => handle_client_request(&state, session_id, user_id, request).await,
            Err(error) => {
                debug!(%error, "unparseable push request");
                state
                    .gateway
                    .send_to(
                        session_id,
                        &ServerEvent::Error(ApiError::new(
                            ErrorCode::Validation,
                            "unrecognized request",
                        )),
                    )
                    .await;
            }
        }
    }

    state.gateway.unregister(session_id).await;
    send_task.abort();
}

async fn handle_client_request(
    state: &AppState,
    session_id: SessionId,
    user_id: UserId,
    request: ClientRequest,
) {
    let outcome = match request {
        ClientRequest::JoinConversation { conversation_id } => {
            match conversation_peer(&state.api, user_id, conversation_id).await {
                Ok(_) => {
                    state.gateway.join(session_id, conversation_id).await;
                    Ok(())
                }
                Err(err) => Err(err),
            }
        }
        ClientRequest::LeaveConversation { conversation_id } => {
            state.gateway.leave(session_id, conversation_id).await;
            Ok(())
        }
        ClientRequest::SendMessage {
            conversation_id,
            receiver_id,
            message,
        } => match send_message(&state.api, user_id, conversation_id, receiver_id, &message).await
        {
            Ok(stored) => {
                state
                    .gateway
                    .publish(conversation_id, &message_received(stored))
                    .await;
                Ok(())
            }
            Err(err) => Err(err),
        },
        ClientRequest::Typing {
            conversation_id,
            receiver_id,
            is_typing,
        } => match conversation_peer(&state.api, user_id, conversation_id).await {
            Ok(peer) if peer == receiver_id => {
                let event = ServerEvent::Typing {
                    conversation_id,
                    user_id,
                    is_typing,
                };
                state
                    .gateway
                    .publish_to_user(conversation_id, receiver_id, &event)
                    .await;
                Ok(())
            }
            Ok(_) => Err(ApiError::new(
                ErrorCode::Forbidden,
                "typing target is not the conversation peer",
            )),
            Err(err) => Err(err),
        },
    };

    if let Err(err) = outcome {
        warn!(session_id, code = ?err.code, message = %err.message, "push request rejected");
        state
            .gateway
            .send_to(session_id, &ServerEvent::Error(err))
            .await;
    }
}

async fn feed_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<FeedQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        change_feed::serve_subscriber(
            state.api.clone(),
            state.feed.clone(),
            state.feed_batch,
            socket,
            UserId(q.user_id),
            q.since,
        )
    })
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
