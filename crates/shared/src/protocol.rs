use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{AttachmentId, ConversationId, MediaKind, MessageId, UserId},
    error::ApiError,
    status::{MessageStatus, StatusStamps},
};

pub const MAX_CONTENT_CHARS: usize = 4000;
pub const MAX_ATTACHMENTS: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientRequest {
    JoinConversation {
        conversation_id: ConversationId,
    },
    LeaveConversation {
        conversation_id: ConversationId,
    },
    SendMessage {
        conversation_id: ConversationId,
        receiver_id: UserId,
        message: OutgoingMessage,
    },
    Typing {
        conversation_id: ConversationId,
        receiver_id: UserId,
        is_typing: bool,
    },
}

/// Body of a send, over HTTP or over the push socket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<AttachmentRef>,
}

/// HTTP body of `POST /conversations/:id/messages`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub receiver_id: UserId,
    #[serde(flatten)]
    pub message: OutgoingMessage,
}

/// Opaque pointer to media stored elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub media_kind: MediaKind,
    pub storage_ref: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentPayload {
    pub attachment_id: AttachmentId,
    pub media_kind: MediaKind,
    pub storage_ref: String,
    pub display_order: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<AttachmentPayload>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seen_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retracted: bool,
}

impl MessagePayload {
    pub fn stamps(&self) -> StatusStamps {
        StatusStamps::new(self.delivered_at, self.seen_at)
    }

    pub fn status(&self) -> MessageStatus {
        self.stamps().status()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChangePayload {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seen_at: Option<DateTime<Utc>>,
}

impl StatusChangePayload {
    pub fn from_message(message: &MessagePayload) -> Self {
        Self {
            message_id: message.message_id,
            conversation_id: message.conversation_id,
            sender_id: message.sender_id,
            receiver_id: message.receiver_id,
            delivered_at: message.delivered_at,
            seen_at: message.seen_at,
        }
    }

    pub fn stamps(&self) -> StatusStamps {
        StatusStamps::new(self.delivered_at, self.seen_at)
    }

    pub fn status(&self) -> MessageStatus {
        self.stamps().status()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conversation_id: ConversationId,
    pub peer_id: UserId,
    pub is_active: bool,
    pub last_activity: DateTime<Utc>,
    pub unread_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadCountResponse {
    pub conversation_id: ConversationId,
    pub unread_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetractResponse {
    pub message_id: MessageId,
    pub retracted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HideResponse {
    pub message_id: MessageId,
    pub hidden: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    MessageReceived {
        conversation_id: ConversationId,
        sender_id: UserId,
        message: MessagePayload,
        server_timestamp: DateTime<Utc>,
    },
    MessageStatusChanged {
        change: StatusChangePayload,
    },
    MessageRetracted {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    MessageHidden {
        conversation_id: ConversationId,
        message_id: MessageId,
        user_id: UserId,
    },
    Typing {
        conversation_id: ConversationId,
        user_id: UserId,
        is_typing: bool,
    },
    ConversationDeactivated {
        conversation_id: ConversationId,
    },
    Error(ApiError),
}

/// One change-feed item; `seq` is the ledger journal position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedEnvelope {
    pub seq: i64,
    pub event: ServerEvent,
}
