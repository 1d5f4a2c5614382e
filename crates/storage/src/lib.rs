use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite, SqliteConnection,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use thiserror::Error;

use shared::{
    domain::{AttachmentId, ConversationId, ConversationKind, MediaKind, MessageId, UserId},
    protocol::AttachmentRef,
    status::{MessageStatus, StatusStamps, StatusTransition},
};

mod messages;

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

/// Failures of ledger operations that a caller can act on.
///
/// Infrastructure helpers (connect, health, journal reads) keep returning
/// `anyhow::Result`; only the message and conversation mutations use this.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("{0}")]
    Validation(String),
    #[error("conversation {0:?} not found")]
    ConversationNotFound(ConversationId),
    #[error("message {0:?} not found")]
    MessageNotFound(MessageId),
    #[error("user {user_id:?} is not a participant of conversation {conversation_id:?}")]
    NotParticipant {
        conversation_id: ConversationId,
        user_id: UserId,
    },
    #[error("user {user_id:?} is not the receiver of message {message_id:?}")]
    NotReceiver {
        message_id: MessageId,
        user_id: UserId,
    },
    #[error("user {user_id:?} is not the sender of message {message_id:?}")]
    NotSender {
        message_id: MessageId,
        user_id: UserId,
    },
    #[error("message {0:?} was retracted")]
    AlreadyRetracted(MessageId),
    #[error("ledger write failed: {0}")]
    Persistence(#[from] sqlx::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredConversation {
    pub conversation_id: ConversationId,
    pub user_a: UserId,
    pub user_b: UserId,
    pub kind: ConversationKind,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl StoredConversation {
    pub fn has_participant(&self, user_id: UserId) -> bool {
        self.user_a == user_id || self.user_b == user_id
    }

    pub fn peer_of(&self, user_id: UserId) -> Option<UserId> {
        if self.user_a == user_id {
            Some(self.user_b)
        } else if self.user_b == user_id {
            Some(self.user_a)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAttachment {
    pub attachment_id: AttachmentId,
    pub media_kind: MediaKind,
    pub storage_ref: String,
    pub display_order: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    pub reply_to: Option<MessageId>,
    pub client_ref: Option<String>,
    pub attachments: Vec<StoredAttachment>,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub seen_at: Option<DateTime<Utc>>,
    pub retracted_at: Option<DateTime<Utc>>,
    pub hidden_for: Vec<UserId>,
}

impl StoredMessage {
    pub fn stamps(&self) -> StatusStamps {
        StatusStamps::new(self.delivered_at, self.seen_at)
    }

    pub fn status(&self) -> MessageStatus {
        self.stamps().status()
    }

    pub fn is_retracted(&self) -> bool {
        self.retracted_at.is_some()
    }
}

/// Input of [`Storage::append_message`].
#[derive(Debug, Clone)]
pub struct NewMessage<'a> {
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: &'a str,
    pub reply_to: Option<MessageId>,
    pub client_ref: Option<&'a str>,
    pub attachments: &'a [AttachmentRef],
}

/// Outcome of a delivered/seen write.
///
/// `transition` is `None` when the write was a no-op: the event was a
/// duplicate, arrived late, or lost a race against a concurrent writer.
#[derive(Debug, Clone)]
pub struct StatusWrite {
    pub message: StoredMessage,
    pub transition: Option<StatusTransition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    MessageCreated,
    MessageDelivered,
    MessageSeen,
    MessageHidden,
    MessageRetracted,
    ConversationDeactivated,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::MessageCreated => "message_created",
            ChangeKind::MessageDelivered => "message_delivered",
            ChangeKind::MessageSeen => "message_seen",
            ChangeKind::MessageHidden => "message_hidden",
            ChangeKind::MessageRetracted => "message_retracted",
            ChangeKind::ConversationDeactivated => "conversation_deactivated",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "message_created" => Some(ChangeKind::MessageCreated),
            "message_delivered" => Some(ChangeKind::MessageDelivered),
            "message_seen" => Some(ChangeKind::MessageSeen),
            "message_hidden" => Some(ChangeKind::MessageHidden),
            "message_retracted" => Some(ChangeKind::MessageRetracted),
            "conversation_deactivated" => Some(ChangeKind::ConversationDeactivated),
            _ => None,
        }
    }
}

/// One row of the change journal backing the change-feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
    pub seq: i64,
    pub kind: ChangeKind,
    pub conversation_id: ConversationId,
    pub message_id: Option<MessageId>,
    pub actor_id: UserId,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ConversationActivity {
    pub conversation: StoredConversation,
    pub last_activity: DateTime<Utc>,
    pub unread_count: u32,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Creates the match conversation between two users, or returns the
    /// existing one. A pair maps to at most one conversation.
    pub async fn create_conversation(&self, first: UserId, second: UserId) -> Result<ConversationId> {
        if first == second {
            return Err(anyhow!("a conversation needs two distinct users"));
        }
        let (user_a, user_b) = if first < second {
            (first, second)
        } else {
            (second, first)
        };
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO conversations (user_a, user_b, kind, is_active, created_at)
             VALUES (?, ?, ?, 1, ?)
             ON CONFLICT(user_a, user_b) DO UPDATE SET user_a = excluded.user_a
             RETURNING id",
        )
        .bind(user_a.0)
        .bind(user_b.0)
        .bind(ConversationKind::Match.as_str())
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .context("failed to create conversation")?;
        Ok(ConversationId(id))
    }

    pub async fn load_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Option<StoredConversation>, LedgerError> {
        let row = sqlx::query(
            "SELECT id, user_a, user_b, kind, is_active, created_at
             FROM conversations WHERE id = ?",
        )
        .bind(conversation_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| conversation_from_row(&r)))
    }

    pub async fn conversation_between(
        &self,
        first: UserId,
        second: UserId,
    ) -> Result<Option<StoredConversation>> {
        let (user_a, user_b) = if first < second {
            (first, second)
        } else {
            (second, first)
        };
        let row = sqlx::query(
            "SELECT id, user_a, user_b, kind, is_active, created_at
             FROM conversations WHERE user_a = ? AND user_b = ?",
        )
        .bind(user_a.0)
        .bind(user_b.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| conversation_from_row(&r)))
    }

    /// The conversation the matching side hands out for a pair, if still active.
    pub async fn active_conversation_between(
        &self,
        first: UserId,
        second: UserId,
    ) -> Result<Option<ConversationId>> {
        Ok(self
            .conversation_between(first, second)
            .await?
            .filter(|conversation| conversation.is_active)
            .map(|conversation| conversation.conversation_id))
    }

    /// Conversations of `user_id`, most recent activity first.
    pub async fn list_conversations_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Vec<ConversationActivity>> {
        let rows = sqlx::query(
            "SELECT c.id, c.user_a, c.user_b, c.kind, c.is_active, c.created_at,
                    (SELECT MAX(m.created_at) FROM messages m WHERE m.conversation_id = c.id),
                    (SELECT COUNT(*) FROM messages m
                      WHERE m.conversation_id = c.id
                        AND m.receiver_id = ?1
                        AND m.seen_at IS NULL
                        AND m.retracted_at IS NULL
                        AND NOT EXISTS (
                            SELECT 1 FROM message_deletions d
                            WHERE d.message_id = m.id AND d.user_id = ?1))
             FROM conversations c
             WHERE c.user_a = ?1 OR c.user_b = ?1",
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;

        let mut activity: Vec<ConversationActivity> = rows
            .into_iter()
            .map(|r| {
                let conversation = conversation_from_row(&r);
                let last_activity = r
                    .get::<Option<DateTime<Utc>>, _>(6)
                    .unwrap_or(conversation.created_at);
                ConversationActivity {
                    conversation,
                    last_activity,
                    unread_count: r.get::<i64, _>(7).max(0) as u32,
                }
            })
            .collect();
        activity.sort_by(|a, b| {
            b.last_activity
                .cmp(&a.last_activity)
                .then(a.conversation.conversation_id.cmp(&b.conversation.conversation_id))
        });
        Ok(activity)
    }

    /// Marks a conversation inactive (unmatch). Returns `false` when it
    /// already was.
    pub async fn deactivate_conversation(
        &self,
        conversation_id: ConversationId,
        actor_id: UserId,
    ) -> Result<bool, LedgerError> {
        let conversation = self
            .load_conversation(conversation_id)
            .await?
            .ok_or(LedgerError::ConversationNotFound(conversation_id))?;
        if !conversation.has_participant(actor_id) {
            return Err(LedgerError::NotParticipant {
                conversation_id,
                user_id: actor_id,
            });
        }

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let changed = sqlx::query("UPDATE conversations SET is_active = 0 WHERE id = ? AND is_active = 1")
            .bind(conversation_id.0)
            .execute(&mut *tx)
            .await?
            .rows_affected()
            > 0;
        if changed {
            record_change(
                &mut tx,
                ChangeKind::ConversationDeactivated,
                conversation_id,
                None,
                actor_id,
                now,
            )
            .await?;
        }
        tx.commit().await?;
        Ok(changed)
    }

    /// Journal rows strictly after `after_seq`, oldest first.
    pub async fn changes_since(&self, after_seq: i64, limit: u32) -> Result<Vec<ChangeRecord>> {
        let rows = sqlx::query(
            "SELECT seq, kind, conversation_id, message_id, actor_id, recorded_at
             FROM message_changes
             WHERE seq > ?
             ORDER BY seq ASC
             LIMIT ?",
        )
        .bind(after_seq)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| {
                let raw_kind = r.get::<String, _>(1);
                let kind = ChangeKind::parse(&raw_kind)
                    .ok_or_else(|| anyhow!("unknown change kind '{raw_kind}'"))?;
                Ok(ChangeRecord {
                    seq: r.get::<i64, _>(0),
                    kind,
                    conversation_id: ConversationId(r.get::<i64, _>(2)),
                    message_id: r.get::<Option<i64>, _>(3).map(MessageId),
                    actor_id: UserId(r.get::<i64, _>(4)),
                    recorded_at: r.get::<DateTime<Utc>, _>(5),
                })
            })
            .collect()
    }

    pub async fn latest_change_seq(&self) -> Result<i64> {
        let seq: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(seq), 0) FROM message_changes")
            .fetch_one(&self.pool)
            .await?;
        Ok(seq)
    }
}

/// Appends a journal row inside the caller's transaction.
pub(crate) async fn record_change(
    conn: &mut SqliteConnection,
    kind: ChangeKind,
    conversation_id: ConversationId,
    message_id: Option<MessageId>,
    actor_id: UserId,
    at: DateTime<Utc>,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar(
        "INSERT INTO message_changes (kind, conversation_id, message_id, actor_id, recorded_at)
         VALUES (?, ?, ?, ?, ?)
         RETURNING seq",
    )
    .bind(kind.as_str())
    .bind(conversation_id.0)
    .bind(message_id.map(|id| id.0))
    .bind(actor_id.0)
    .bind(at)
    .fetch_one(conn)
    .await
}

fn conversation_from_row(r: &sqlx::sqlite::SqliteRow) -> StoredConversation {
    StoredConversation {
        conversation_id: ConversationId(r.get::<i64, _>(0)),
        user_a: UserId(r.get::<i64, _>(1)),
        user_b: UserId(r.get::<i64, _>(2)),
        kind: ConversationKind::Match,
        is_active: r.get::<bool, _>(4),
        created_at: r.get::<DateTime<Utc>, _>(5),
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
