use shared::{
    domain::{ConversationId, MessageId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        AttachmentPayload, ConversationSummary, FeedEnvelope, MessagePayload, OutgoingMessage,
        ServerEvent, StatusChangePayload, UnreadCountResponse,
    },
    status::StatusTransition,
};
use storage::{ChangeKind, ChangeRecord, LedgerError, NewMessage, Storage, StoredMessage};
use tracing::warn;

pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 200;

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
}

/// Result of a delivered/seen request.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub change: StatusChangePayload,
    /// `None` when the ledger already held this state.
    pub transition: Option<StatusTransition>,
}

impl StatusUpdate {
    /// Push event for the sender, only when the ledger actually moved.
    pub fn event(&self) -> Option<ServerEvent> {
        self.transition.map(|_| ServerEvent::MessageStatusChanged {
            change: self.change.clone(),
        })
    }
}

/// A journal row resolved into the event each audience member receives.
#[derive(Debug, Clone)]
pub struct FeedItem {
    pub seq: i64,
    pub audience: Vec<UserId>,
    pub event: ServerEvent,
}

impl FeedItem {
    pub fn is_for(&self, user_id: UserId) -> bool {
        self.audience.contains(&user_id)
    }

    pub fn envelope(&self) -> FeedEnvelope {
        FeedEnvelope {
            seq: self.seq,
            event: self.event.clone(),
        }
    }
}

pub async fn list_conversations(
    ctx: &ApiContext,
    user_id: UserId,
) -> Result<Vec<ConversationSummary>, ApiError> {
    let conversations = ctx
        .storage
        .list_conversations_for_user(user_id)
        .await
        .map_err(internal)?;
    Ok(conversations
        .into_iter()
        .filter_map(|activity| {
            let peer_id = activity.conversation.peer_of(user_id)?;
            Some(ConversationSummary {
                conversation_id: activity.conversation.conversation_id,
                peer_id,
                is_active: activity.conversation.is_active,
                last_activity: activity.last_activity,
                unread_count: activity.unread_count,
            })
        })
        .collect())
}

/// The other participant, after checking `user_id` belongs to the conversation.
pub async fn conversation_peer(
    ctx: &ApiContext,
    user_id: UserId,
    conversation_id: ConversationId,
) -> Result<UserId, ApiError> {
    let conversation = ctx
        .storage
        .load_conversation(conversation_id)
        .await
        .map_err(ledger)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "conversation not found"))?;
    conversation
        .peer_of(user_id)
        .ok_or_else(|| ApiError::new(ErrorCode::Forbidden, "user is not a participant"))
}

pub async fn send_message(
    ctx: &ApiContext,
    sender_id: UserId,
    conversation_id: ConversationId,
    receiver_id: UserId,
    message: &OutgoingMessage,
) -> Result<MessagePayload, ApiError> {
    let stored = ctx
        .storage
        .append_message(NewMessage {
            conversation_id,
            sender_id,
            receiver_id,
            content: &message.content,
            reply_to: message.reply_to,
            client_ref: message.client_ref.as_deref(),
            attachments: &message.attachments,
        })
        .await
        .map_err(ledger)?;
    Ok(message_payload(stored))
}

pub fn message_received(message: MessagePayload) -> ServerEvent {
    ServerEvent::MessageReceived {
        conversation_id: message.conversation_id,
        sender_id: message.sender_id,
        server_timestamp: message.created_at,
        message,
    }
}

pub async fn list_messages(
    ctx: &ApiContext,
    user_id: UserId,
    conversation_id: ConversationId,
    limit: Option<u32>,
    before: Option<MessageId>,
) -> Result<Vec<MessagePayload>, ApiError> {
    let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    let messages = ctx
        .storage
        .list_messages(conversation_id, user_id, limit, before)
        .await
        .map_err(ledger)?;
    Ok(messages.into_iter().map(message_payload).collect())
}

pub async fn mark_delivered(
    ctx: &ApiContext,
    user_id: UserId,
    message_id: MessageId,
) -> Result<StatusUpdate, ApiError> {
    let write = ctx
        .storage
        .mark_delivered(message_id, user_id)
        .await
        .map_err(ledger)?;
    Ok(StatusUpdate {
        change: status_change(&write.message),
        transition: write.transition,
    })
}

pub async fn mark_seen(
    ctx: &ApiContext,
    user_id: UserId,
    message_id: MessageId,
) -> Result<StatusUpdate, ApiError> {
    let write = ctx
        .storage
        .mark_seen(message_id, user_id)
        .await
        .map_err(ledger)?;
    Ok(StatusUpdate {
        change: status_change(&write.message),
        transition: write.transition,
    })
}

pub async fn hide_message(
    ctx: &ApiContext,
    user_id: UserId,
    message_id: MessageId,
) -> Result<ServerEvent, ApiError> {
    let message = ctx
        .storage
        .hide_for_user(message_id, user_id)
        .await
        .map_err(ledger)?;
    Ok(ServerEvent::MessageHidden {
        conversation_id: message.conversation_id,
        message_id,
        user_id,
    })
}

pub async fn retract_message(
    ctx: &ApiContext,
    user_id: UserId,
    message_id: MessageId,
) -> Result<ServerEvent, ApiError> {
    let message = ctx
        .storage
        .retract_for_everyone(message_id, user_id)
        .await
        .map_err(ledger)?;
    Ok(ServerEvent::MessageRetracted {
        conversation_id: message.conversation_id,
        message_id,
    })
}

pub async fn unread_count(
    ctx: &ApiContext,
    user_id: UserId,
    conversation_id: ConversationId,
) -> Result<UnreadCountResponse, ApiError> {
    let unread_count = ctx
        .storage
        .unread_count(conversation_id, user_id)
        .await
        .map_err(ledger)?;
    Ok(UnreadCountResponse {
        conversation_id,
        unread_count,
    })
}

/// Returns the event to fan out when the conversation was still active.
pub async fn deactivate_conversation(
    ctx: &ApiContext,
    user_id: UserId,
    conversation_id: ConversationId,
) -> Result<Option<ServerEvent>, ApiError> {
    let changed = ctx
        .storage
        .deactivate_conversation(conversation_id, user_id)
        .await
        .map_err(ledger)?;
    Ok(changed.then_some(ServerEvent::ConversationDeactivated { conversation_id }))
}

/// Resolves journal rows into routed change-feed events.
///
/// Each item carries the message state as of now, not as of the change;
/// clients merge monotonically so a newer snapshot is always safe.
pub async fn feed_items(
    ctx: &ApiContext,
    changes: &[ChangeRecord],
) -> Result<Vec<FeedItem>, ApiError> {
    let mut items = Vec::with_capacity(changes.len());
    for change in changes {
        if let Some(item) = feed_item(ctx, change).await? {
            items.push(item);
        }
    }
    Ok(items)
}

/// One back-fill page for a change-feed subscriber resuming after `since`.
#[derive(Debug, Clone)]
pub struct FeedPage {
    pub envelopes: Vec<FeedEnvelope>,
    /// Journal position the next page starts after.
    pub cursor: i64,
    /// `true` once the journal tail has been reached.
    pub complete: bool,
}

pub async fn feed_page(
    ctx: &ApiContext,
    user_id: UserId,
    since: i64,
    limit: u32,
) -> Result<FeedPage, ApiError> {
    let changes = ctx
        .storage
        .changes_since(since, limit)
        .await
        .map_err(internal)?;
    let cursor = changes.last().map(|c| c.seq).unwrap_or(since);
    let complete = changes.len() < limit as usize;
    let envelopes = feed_items(ctx, &changes)
        .await?
        .into_iter()
        .filter(|item| item.is_for(user_id))
        .map(|item| item.envelope())
        .collect();
    Ok(FeedPage {
        envelopes,
        cursor,
        complete,
    })
}

pub async fn feed_head(ctx: &ApiContext) -> Result<i64, ApiError> {
    ctx.storage.latest_change_seq().await.map_err(internal)
}

async fn feed_item(ctx: &ApiContext, change: &ChangeRecord) -> Result<Option<FeedItem>, ApiError> {
    if change.kind == ChangeKind::ConversationDeactivated {
        let Some(conversation) = ctx
            .storage
            .load_conversation(change.conversation_id)
            .await
            .map_err(ledger)?
        else {
            return Ok(None);
        };
        return Ok(Some(FeedItem {
            seq: change.seq,
            audience: vec![conversation.user_a, conversation.user_b],
            event: ServerEvent::ConversationDeactivated {
                conversation_id: change.conversation_id,
            },
        }));
    }

    let Some(message_id) = change.message_id else {
        warn!(seq = change.seq, "journal row without message id");
        return Ok(None);
    };
    let Some(message) = ctx.storage.load_message(message_id).await.map_err(ledger)? else {
        return Ok(None);
    };
    let participants = vec![message.sender_id, message.receiver_id];

    let (audience, event) = match change.kind {
        ChangeKind::MessageCreated => (participants, message_received(message_payload(message))),
        ChangeKind::MessageDelivered | ChangeKind::MessageSeen => (
            participants,
            ServerEvent::MessageStatusChanged {
                change: status_change(&message),
            },
        ),
        ChangeKind::MessageHidden => (
            vec![change.actor_id],
            ServerEvent::MessageHidden {
                conversation_id: message.conversation_id,
                message_id,
                user_id: change.actor_id,
            },
        ),
        ChangeKind::MessageRetracted => (
            participants,
            ServerEvent::MessageRetracted {
                conversation_id: message.conversation_id,
                message_id,
            },
        ),
        ChangeKind::ConversationDeactivated => return Ok(None),
    };

    Ok(Some(FeedItem {
        seq: change.seq,
        audience,
        event,
    }))
}

pub fn message_payload(message: StoredMessage) -> MessagePayload {
    let retracted = message.is_retracted();
    MessagePayload {
        message_id: message.message_id,
        conversation_id: message.conversation_id,
        sender_id: message.sender_id,
        receiver_id: message.receiver_id,
        content: message.content,
        reply_to: message.reply_to,
        client_ref: message.client_ref,
        attachments: message
            .attachments
            .into_iter()
            .map(|a| AttachmentPayload {
                attachment_id: a.attachment_id,
                media_kind: a.media_kind,
                storage_ref: a.storage_ref,
                display_order: a.display_order,
            })
            .collect(),
        created_at: message.created_at,
        delivered_at: message.delivered_at,
        seen_at: message.seen_at,
        retracted,
    }
}

fn status_change(message: &StoredMessage) -> StatusChangePayload {
    StatusChangePayload {
        message_id: message.message_id,
        conversation_id: message.conversation_id,
        sender_id: message.sender_id,
        receiver_id: message.receiver_id,
        delivered_at: message.delivered_at,
        seen_at: message.seen_at,
    }
}

/// Maps ledger failures onto wire error codes.
pub fn ledger(err: LedgerError) -> ApiError {
    match err {
        LedgerError::Validation(message) => ApiError::new(ErrorCode::Validation, message),
        LedgerError::ConversationNotFound(_) | LedgerError::MessageNotFound(_) => {
            ApiError::new(ErrorCode::NotFound, err.to_string())
        }
        LedgerError::NotParticipant { .. } => ApiError::new(ErrorCode::Forbidden, err.to_string()),
        LedgerError::NotReceiver { .. } => ApiError::new(ErrorCode::NotReceiver, err.to_string()),
        LedgerError::NotSender { .. } => ApiError::new(ErrorCode::NotSender, err.to_string()),
        LedgerError::AlreadyRetracted(_) => {
            ApiError::new(ErrorCode::AlreadyRetracted, err.to_string())
        }
        LedgerError::Persistence(source) => {
            warn!(error = %source, "ledger write failed");
            ApiError::new(ErrorCode::PersistenceFailure, "ledger unavailable")
        }
    }
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, err.to_string())
}
