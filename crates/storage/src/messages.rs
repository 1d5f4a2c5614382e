//! Message rows: append, status stamps, hide, retract and history reads.
//!
//! Every mutation opens its transaction with the conditional `UPDATE` (or
//! `INSERT`) so the write lock is taken before anything is read back, and
//! writes the journal row in the same transaction.

use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};
use tracing::debug;

use shared::{
    domain::{AttachmentId, ConversationId, MediaKind, MessageId, UserId},
    protocol::{MAX_ATTACHMENTS, MAX_CONTENT_CHARS},
    status::{plan_transition, StatusEvent, StatusTransition},
};

use crate::{
    record_change, ChangeKind, LedgerError, NewMessage, Storage, StatusWrite, StoredAttachment,
    StoredMessage,
};

const MESSAGE_SELECT: &str = "SELECT m.id, m.conversation_id, m.sender_id, m.receiver_id, m.content,
        m.reply_to_id, m.client_ref, m.created_at, m.delivered_at, m.seen_at, m.retracted_at,
        (SELECT GROUP_CONCAT(d.user_id) FROM message_deletions d WHERE d.message_id = m.id),
        (SELECT COUNT(*) FROM message_attachments a WHERE a.message_id = m.id)
    FROM messages m";

impl Storage {
    /// Validates and persists a message together with its attachments.
    pub async fn append_message(&self, new: NewMessage<'_>) -> Result<StoredMessage, LedgerError> {
        validate_body(new.content, new.attachments.len())?;
        for attachment in new.attachments {
            if attachment.storage_ref.trim().is_empty() {
                return Err(LedgerError::Validation(
                    "attachment storage reference must not be empty".into(),
                ));
            }
        }

        let conversation = self
            .load_conversation(new.conversation_id)
            .await?
            .ok_or(LedgerError::ConversationNotFound(new.conversation_id))?;
        if new.sender_id == new.receiver_id
            || !conversation.has_participant(new.sender_id)
            || !conversation.has_participant(new.receiver_id)
        {
            return Err(LedgerError::NotParticipant {
                conversation_id: new.conversation_id,
                user_id: new.sender_id,
            });
        }
        if !conversation.is_active {
            return Err(LedgerError::Validation(format!(
                "conversation {} is no longer active",
                new.conversation_id.0
            )));
        }
        if let Some(reply_to) = new.reply_to {
            let parent = self
                .load_message(reply_to)
                .await?
                .ok_or(LedgerError::MessageNotFound(reply_to))?;
            if parent.conversation_id != new.conversation_id {
                return Err(LedgerError::Validation(
                    "reply target belongs to another conversation".into(),
                ));
            }
        }

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let message_id: i64 = sqlx::query_scalar(
            "INSERT INTO messages (conversation_id, sender_id, receiver_id, content, reply_to_id, client_ref, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(new.conversation_id.0)
        .bind(new.sender_id.0)
        .bind(new.receiver_id.0)
        .bind(new.content)
        .bind(new.reply_to.map(|id| id.0))
        .bind(new.client_ref)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        for (order, attachment) in new.attachments.iter().enumerate() {
            sqlx::query(
                "INSERT INTO message_attachments (message_id, media_kind, storage_ref, display_order)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(message_id)
            .bind(attachment.media_kind.as_str())
            .bind(&attachment.storage_ref)
            .bind(order as i64)
            .execute(&mut *tx)
            .await?;
        }

        let message_id = MessageId(message_id);
        record_change(
            &mut tx,
            ChangeKind::MessageCreated,
            new.conversation_id,
            Some(message_id),
            new.sender_id,
            now,
        )
        .await?;
        tx.commit().await?;

        debug!(
            message_id = message_id.0,
            conversation_id = new.conversation_id.0,
            "message appended"
        );
        self.require_message(message_id).await
    }

    /// Records that the receiver's client received the message.
    pub async fn mark_delivered(
        &self,
        message_id: MessageId,
        actor_id: UserId,
    ) -> Result<StatusWrite, LedgerError> {
        self.apply_status_event(message_id, actor_id, StatusEvent::Delivered)
            .await
    }

    /// Records that the receiver viewed the message. Fills `delivered_at`
    /// in the same write when it was never set.
    pub async fn mark_seen(
        &self,
        message_id: MessageId,
        actor_id: UserId,
    ) -> Result<StatusWrite, LedgerError> {
        self.apply_status_event(message_id, actor_id, StatusEvent::Seen)
            .await
    }

    async fn apply_status_event(
        &self,
        message_id: MessageId,
        actor_id: UserId,
        event: StatusEvent,
    ) -> Result<StatusWrite, LedgerError> {
        let current = self.require_message(message_id).await?;
        if current.receiver_id != actor_id {
            return Err(LedgerError::NotReceiver {
                message_id,
                user_id: actor_id,
            });
        }
        if current.is_retracted() {
            return Err(LedgerError::AlreadyRetracted(message_id));
        }
        if plan_transition(&current.stamps(), event).is_none() {
            return Ok(StatusWrite {
                message: current,
                transition: None,
            });
        }

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let (sql, kind) = match event {
            StatusEvent::Delivered => (
                "UPDATE messages SET delivered_at = ?1
                 WHERE id = ?2 AND delivered_at IS NULL AND retracted_at IS NULL",
                ChangeKind::MessageDelivered,
            ),
            StatusEvent::Seen => (
                "UPDATE messages SET delivered_at = COALESCE(delivered_at, ?1), seen_at = ?1
                 WHERE id = ?2 AND seen_at IS NULL AND retracted_at IS NULL",
                ChangeKind::MessageSeen,
            ),
        };
        let updated = sqlx::query(sql)
            .bind(now)
            .bind(message_id.0)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        if updated == 0 {
            tx.rollback().await?;
            let latest = self.require_message(message_id).await?;
            if latest.is_retracted() {
                return Err(LedgerError::AlreadyRetracted(message_id));
            }
            return Ok(StatusWrite {
                message: latest,
                transition: None,
            });
        }

        record_change(
            &mut tx,
            kind,
            current.conversation_id,
            Some(message_id),
            actor_id,
            now,
        )
        .await?;
        tx.commit().await?;

        let message = self.require_message(message_id).await?;
        let transition = match event {
            StatusEvent::Delivered => StatusTransition::Delivered,
            StatusEvent::Seen if message.delivered_at == Some(now) => {
                StatusTransition::DeliveredAndSeen
            }
            StatusEvent::Seen => StatusTransition::Seen,
        };
        debug!(
            message_id = message_id.0,
            transition = transition.as_str(),
            "status advanced"
        );
        Ok(StatusWrite {
            message,
            transition: Some(transition),
        })
    }

    /// Hides the message from `actor_id`'s history only. Idempotent.
    pub async fn hide_for_user(
        &self,
        message_id: MessageId,
        actor_id: UserId,
    ) -> Result<StoredMessage, LedgerError> {
        let current = self.require_message(message_id).await?;
        if current.sender_id != actor_id && current.receiver_id != actor_id {
            return Err(LedgerError::NotParticipant {
                conversation_id: current.conversation_id,
                user_id: actor_id,
            });
        }
        if current.is_retracted() {
            return Err(LedgerError::AlreadyRetracted(message_id));
        }

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO message_deletions (message_id, user_id, hidden_at)
             VALUES (?, ?, ?)",
        )
        .bind(message_id.0)
        .bind(actor_id.0)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if inserted > 0 {
            record_change(
                &mut tx,
                ChangeKind::MessageHidden,
                current.conversation_id,
                Some(message_id),
                actor_id,
                now,
            )
            .await?;
        }
        tx.commit().await?;

        self.require_message(message_id).await
    }

    /// Replaces the content with a placeholder for both participants and
    /// drops the attachments. Only the sender may retract, once.
    pub async fn retract_for_everyone(
        &self,
        message_id: MessageId,
        actor_id: UserId,
    ) -> Result<StoredMessage, LedgerError> {
        let current = self.require_message(message_id).await?;
        if current.sender_id != actor_id {
            return Err(LedgerError::NotSender {
                message_id,
                user_id: actor_id,
            });
        }
        if current.is_retracted() {
            return Err(LedgerError::AlreadyRetracted(message_id));
        }

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            "UPDATE messages SET content = '', retracted_at = ?
             WHERE id = ? AND retracted_at IS NULL",
        )
        .bind(now)
        .bind(message_id.0)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if updated == 0 {
            tx.rollback().await?;
            return Err(LedgerError::AlreadyRetracted(message_id));
        }

        sqlx::query("DELETE FROM message_attachments WHERE message_id = ?")
            .bind(message_id.0)
            .execute(&mut *tx)
            .await?;
        record_change(
            &mut tx,
            ChangeKind::MessageRetracted,
            current.conversation_id,
            Some(message_id),
            actor_id,
            now,
        )
        .await?;
        tx.commit().await?;

        self.require_message(message_id).await
    }

    pub async fn load_message(
        &self,
        message_id: MessageId,
    ) -> Result<Option<StoredMessage>, LedgerError> {
        let sql = format!("{MESSAGE_SELECT} WHERE m.id = ?");
        let row = sqlx::query(&sql)
            .bind(message_id.0)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(r) => Ok(Some(self.hydrate(r).await?)),
            None => Ok(None),
        }
    }

    async fn require_message(&self, message_id: MessageId) -> Result<StoredMessage, LedgerError> {
        self.load_message(message_id)
            .await?
            .ok_or(LedgerError::MessageNotFound(message_id))
    }

    /// History visible to `viewer_id`, oldest first. `before` pages
    /// backwards from a known message.
    pub async fn list_messages(
        &self,
        conversation_id: ConversationId,
        viewer_id: UserId,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<Vec<StoredMessage>, LedgerError> {
        let conversation = self
            .load_conversation(conversation_id)
            .await?
            .ok_or(LedgerError::ConversationNotFound(conversation_id))?;
        if !conversation.has_participant(viewer_id) {
            return Err(LedgerError::NotParticipant {
                conversation_id,
                user_id: viewer_id,
            });
        }

        let visible = "m.conversation_id = ?1
            AND NOT EXISTS (SELECT 1 FROM message_deletions d
                            WHERE d.message_id = m.id AND d.user_id = ?2)";
        let mut rows = if let Some(before) = before {
            let sql = format!(
                "{MESSAGE_SELECT}
                 WHERE {visible}
                   AND (m.created_at, m.id) < (SELECT created_at, id FROM messages WHERE id = ?3)
                 ORDER BY m.created_at DESC, m.id DESC
                 LIMIT ?4"
            );
            sqlx::query(&sql)
                .bind(conversation_id.0)
                .bind(viewer_id.0)
                .bind(before.0)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
        } else {
            let sql = format!(
                "{MESSAGE_SELECT}
                 WHERE {visible}
                 ORDER BY m.created_at DESC, m.id DESC
                 LIMIT ?3"
            );
            sqlx::query(&sql)
                .bind(conversation_id.0)
                .bind(viewer_id.0)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
        };

        rows.reverse();
        let mut messages = Vec::with_capacity(rows.len());
        for r in rows {
            messages.push(self.hydrate(r).await?);
        }
        Ok(messages)
    }

    /// Messages addressed to `viewer_id` that are not yet seen, excluding
    /// retracted ones and ones the viewer hid.
    pub async fn unread_count(
        &self,
        conversation_id: ConversationId,
        viewer_id: UserId,
    ) -> Result<u32, LedgerError> {
        let conversation = self
            .load_conversation(conversation_id)
            .await?
            .ok_or(LedgerError::ConversationNotFound(conversation_id))?;
        if !conversation.has_participant(viewer_id) {
            return Err(LedgerError::NotParticipant {
                conversation_id,
                user_id: viewer_id,
            });
        }

        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM messages m
             WHERE m.conversation_id = ?1
               AND m.receiver_id = ?2
               AND m.seen_at IS NULL
               AND m.retracted_at IS NULL
               AND NOT EXISTS (SELECT 1 FROM message_deletions d
                               WHERE d.message_id = m.id AND d.user_id = ?2)",
        )
        .bind(conversation_id.0)
        .bind(viewer_id.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u32)
    }

    /// Unread messages for `viewer_id` across all of their conversations.
    pub async fn unread_total(&self, viewer_id: UserId) -> Result<u32, LedgerError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM messages m
             WHERE m.receiver_id = ?1
               AND m.seen_at IS NULL
               AND m.retracted_at IS NULL
               AND NOT EXISTS (SELECT 1 FROM message_deletions d
                               WHERE d.message_id = m.id AND d.user_id = ?1)",
        )
        .bind(viewer_id.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u32)
    }

    async fn hydrate(&self, r: SqliteRow) -> Result<StoredMessage, LedgerError> {
        let message_id = MessageId(r.get::<i64, _>(0));
        let attachments = if r.get::<i64, _>(12) > 0 {
            self.load_attachments(message_id).await?
        } else {
            Vec::new()
        };
        let hidden_for = r
            .get::<Option<String>, _>(11)
            .map(|raw| {
                raw.split(',')
                    .filter_map(|part| part.trim().parse::<i64>().ok())
                    .map(UserId)
                    .collect()
            })
            .unwrap_or_default();

        Ok(StoredMessage {
            message_id,
            conversation_id: ConversationId(r.get::<i64, _>(1)),
            sender_id: UserId(r.get::<i64, _>(2)),
            receiver_id: UserId(r.get::<i64, _>(3)),
            content: r.get::<String, _>(4),
            reply_to: r.get::<Option<i64>, _>(5).map(MessageId),
            client_ref: r.get::<Option<String>, _>(6),
            attachments,
            created_at: r.get::<DateTime<Utc>, _>(7),
            delivered_at: r.get::<Option<DateTime<Utc>>, _>(8),
            seen_at: r.get::<Option<DateTime<Utc>>, _>(9),
            retracted_at: r.get::<Option<DateTime<Utc>>, _>(10),
            hidden_for,
        })
    }

    async fn load_attachments(
        &self,
        message_id: MessageId,
    ) -> Result<Vec<StoredAttachment>, LedgerError> {
        let rows = sqlx::query(
            "SELECT id, media_kind, storage_ref, display_order
             FROM message_attachments
             WHERE message_id = ?
             ORDER BY display_order ASC",
        )
        .bind(message_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| StoredAttachment {
                attachment_id: AttachmentId(r.get::<i64, _>(0)),
                media_kind: MediaKind::parse(&r.get::<String, _>(1)),
                storage_ref: r.get::<String, _>(2),
                display_order: r.get::<i64, _>(3).max(0) as u32,
            })
            .collect())
    }
}

fn validate_body(content: &str, attachment_count: usize) -> Result<(), LedgerError> {
    if content.trim().is_empty() && attachment_count == 0 {
        return Err(LedgerError::Validation(
            "message needs content or at least one attachment".into(),
        ));
    }
    if content.chars().count() > MAX_CONTENT_CHARS {
        return Err(LedgerError::Validation(format!(
            "content exceeds {MAX_CONTENT_CHARS} characters"
        )));
    }
    if attachment_count > MAX_ATTACHMENTS {
        return Err(LedgerError::Validation(format!(
            "at most {MAX_ATTACHMENTS} attachments per message"
        )));
    }
    Ok(())
}
