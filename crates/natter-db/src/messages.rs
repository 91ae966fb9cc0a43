use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info};

use natter_types::api::MessageCursor;
use natter_types::models::{Message, MessageKind, MessageStatus, Provenance};

use crate::conversations::{query_conversation, require_participant};
use crate::error::{StoreError, StoreResult};
use crate::media::media_exists;
use crate::{Database, IdKind, now};

pub const MAX_TEXT_LEN: usize = 4096;
pub const MAX_PAGE_SIZE: u32 = 200;

const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, kind, content, content_type, \
     parent_id, status, forwarded_from, original_sent_at, created_at";

/// Fields of a message about to be inserted.
struct NewMessage<'a> {
    conversation_id: &'a str,
    sender_id: &'a str,
    kind: MessageKind,
    content: &'a str,
    content_type: &'a str,
    parent_id: Option<&'a str>,
    forwarded: Option<Provenance>,
}

impl Database {
    /// Append a message. A reply's parent must exist in the same conversation.
    /// Photo messages carry a media id as their content.
    pub fn add_message(
        &self,
        conversation_id: &str,
        sender_id: &str,
        kind: MessageKind,
        content: &str,
        content_type: &str,
        parent_id: Option<&str>,
    ) -> StoreResult<Message> {
        self.with_tx(|tx| {
            check_message_target(tx, conversation_id, sender_id, parent_id)?;
            match kind {
                MessageKind::Text => validate_text(content)?,
                MessageKind::Photo => {
                    if !media_exists(tx, content)? {
                        return Err(StoreError::Validation(format!(
                            "photo message references unknown media '{}'",
                            content
                        )));
                    }
                }
            }

            self.insert_message(
                tx,
                NewMessage {
                    conversation_id,
                    sender_id,
                    kind,
                    content,
                    content_type,
                    parent_id,
                    forwarded: None,
                },
            )
        })
    }

    /// Store a photo and the message that shows it in one transaction.
    pub fn add_photo_message(
        &self,
        conversation_id: &str,
        sender_id: &str,
        data: &[u8],
        media_type: &str,
        parent_id: Option<&str>,
    ) -> StoreResult<Message> {
        self.with_tx(|tx| {
            check_message_target(tx, conversation_id, sender_id, parent_id)?;
            let media_id = self.insert_media(tx, data, media_type)?;

            self.insert_message(
                tx,
                NewMessage {
                    conversation_id,
                    sender_id,
                    kind: MessageKind::Photo,
                    content: &media_id,
                    content_type: media_type.trim(),
                    parent_id,
                    forwarded: None,
                },
            )
        })
    }

    /// Copy a message into another conversation as a new message that records
    /// who originally sent it and when. Forwarding a forward keeps the first
    /// sender's provenance.
    pub fn forward_message(
        &self,
        original_id: &str,
        target_conversation_id: &str,
        forwarder_id: &str,
    ) -> StoreResult<Message> {
        self.with_tx(|tx| {
            let original = query_message(tx, original_id)?
                .ok_or_else(|| StoreError::not_found(format!("message {}", original_id)))?;
            if query_conversation(tx, target_conversation_id)?.is_none() {
                return Err(StoreError::not_found(format!(
                    "conversation {}",
                    target_conversation_id
                )));
            }
            require_participant(tx, &original.conversation_id, forwarder_id)?;
            require_participant(tx, target_conversation_id, forwarder_id)?;

            let provenance = original.forwarded.clone().unwrap_or(Provenance {
                original_sender_id: original.sender_id.clone(),
                original_sent_at: original.created_at,
            });

            let message = self.insert_message(
                tx,
                NewMessage {
                    conversation_id: target_conversation_id,
                    sender_id: forwarder_id,
                    kind: original.kind,
                    content: &original.content,
                    content_type: &original.content_type,
                    parent_id: None,
                    forwarded: Some(provenance),
                },
            )?;

            info!(
                "Forwarded message {} to {} as {}",
                original_id, target_conversation_id, message.id
            );
            Ok(message)
        })
    }

    pub fn get_message(&self, message_id: &str, user_id: &str) -> StoreResult<Message> {
        self.with_conn(|conn| {
            let message = query_message(conn, message_id)?
                .ok_or_else(|| StoreError::not_found(format!("message {}", message_id)))?;
            require_participant(conn, &message.conversation_id, user_id)?;
            Ok(message)
        })
    }

    /// Newest-first page of messages. Pass a cursor built from the oldest
    /// message of the previous page as `before` to continue.
    pub fn list_messages(
        &self,
        conversation_id: &str,
        user_id: &str,
        limit: u32,
        before: Option<&MessageCursor>,
    ) -> StoreResult<Vec<Message>> {
        let limit = limit.clamp(1, MAX_PAGE_SIZE);

        self.with_conn(|conn| {
            if query_conversation(conn, conversation_id)?.is_none() {
                return Err(StoreError::not_found(format!("conversation {}", conversation_id)));
            }
            require_participant(conn, conversation_id, user_id)?;

            let sql = format!(
                "SELECT {} FROM messages
                 WHERE conversation_id = ?1
                   AND (?2 IS NULL
                        OR created_at < ?2
                        OR (created_at = ?2
                            AND rowid < (SELECT rowid FROM messages WHERE id = ?3)))
                 ORDER BY created_at DESC, rowid DESC
                 LIMIT ?4",
                MESSAGE_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(
                    params![
                        conversation_id,
                        before.map(|c| c.created_at),
                        before.map(|c| c.message_id.as_str()),
                        limit
                    ],
                    map_message,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Delete a message together with its reactions, comments and read
    /// records. Only the sender may delete. Replies keep their dangling
    /// `parent_id`.
    pub fn delete_message(&self, message_id: &str, requester_id: &str) -> StoreResult<()> {
        self.with_tx(|tx| {
            let message = query_message(tx, message_id)?
                .ok_or_else(|| StoreError::not_found(format!("message {}", message_id)))?;
            if message.sender_id != requester_id {
                return Err(StoreError::Unauthorized(format!(
                    "only the sender may delete message {}",
                    message_id
                )));
            }

            let reactions = tx.execute("DELETE FROM reactions WHERE message_id = ?1", [message_id])?;
            let comments = tx.execute("DELETE FROM comments WHERE message_id = ?1", [message_id])?;
            tx.execute("DELETE FROM message_reads WHERE message_id = ?1", [message_id])?;
            tx.execute("DELETE FROM messages WHERE id = ?1", [message_id])?;

            info!(
                "Deleted message {} ({} reactions, {} comments)",
                message_id, reactions, comments
            );
            Ok(())
        })
    }

    fn insert_message(&self, conn: &Connection, new: NewMessage<'_>) -> StoreResult<Message> {
        let message = Message {
            id: self.next_id(conn, IdKind::Message)?,
            conversation_id: new.conversation_id.to_string(),
            sender_id: new.sender_id.to_string(),
            kind: new.kind,
            content: new.content.to_string(),
            content_type: new.content_type.to_string(),
            parent_id: new.parent_id.map(str::to_string),
            status: MessageStatus::Delivered,
            forwarded: new.forwarded,
            created_at: now(),
        };

        conn.execute(
            "INSERT INTO messages (id, conversation_id, sender_id, kind, content, content_type,
                                   parent_id, status, forwarded_from, original_sent_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                message.id,
                message.conversation_id,
                message.sender_id,
                message.kind.as_str(),
                message.content,
                message.content_type,
                message.parent_id,
                message.status.as_str(),
                message.forwarded.as_ref().map(|p| &p.original_sender_id),
                message.forwarded.as_ref().map(|p| p.original_sent_at),
                message.created_at,
            ],
        )?;

        debug!(
            "Inserted {} message {} in {}",
            message.kind, message.id, message.conversation_id
        );
        Ok(message)
    }
}

/// Conversation exists, sender participates, and any parent lives in the
/// same conversation.
fn check_message_target(
    conn: &Connection,
    conversation_id: &str,
    sender_id: &str,
    parent_id: Option<&str>,
) -> StoreResult<()> {
    if query_conversation(conn, conversation_id)?.is_none() {
        return Err(StoreError::not_found(format!("conversation {}", conversation_id)));
    }
    require_participant(conn, conversation_id, sender_id)?;

    if let Some(parent_id) = parent_id {
        let parent_conversation: Option<String> = conn
            .query_row(
                "SELECT conversation_id FROM messages WHERE id = ?1",
                [parent_id],
                |row| row.get(0),
            )
            .optional()?;
        if parent_conversation.as_deref() != Some(conversation_id) {
            return Err(StoreError::Validation(format!(
                "parent message {} is not in conversation {}",
                parent_id, conversation_id
            )));
        }
    }
    Ok(())
}

fn validate_text(content: &str) -> StoreResult<()> {
    if content.trim().is_empty() {
        return Err(StoreError::Validation("message is empty".into()));
    }
    if content.chars().count() > MAX_TEXT_LEN {
        return Err(StoreError::Validation(format!(
            "message exceeds {} characters",
            MAX_TEXT_LEN
        )));
    }
    Ok(())
}

pub(crate) fn query_message(conn: &Connection, message_id: &str) -> StoreResult<Option<Message>> {
    let sql = format!("SELECT {} FROM messages WHERE id = ?1", MESSAGE_COLUMNS);
    Ok(conn.query_row(&sql, [message_id], map_message).optional()?)
}

/// All messages of a conversation, oldest first.
pub(crate) fn query_conversation_messages(conn: &Connection, conversation_id: &str) -> StoreResult<Vec<Message>> {
    let sql = format!(
        "SELECT {} FROM messages WHERE conversation_id = ?1 ORDER BY created_at, rowid",
        MESSAGE_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([conversation_id], map_message)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn map_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let forwarded_from: Option<String> = row.get(8)?;
    let forwarded = match forwarded_from {
        Some(original_sender_id) => Some(Provenance {
            original_sender_id,
            original_sent_at: row.get(9)?,
        }),
        None => None,
    };

    Ok(Message {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sender_id: row.get(2)?,
        kind: column_kind(row, 3)?,
        content: row.get(4)?,
        content_type: row.get(5)?,
        parent_id: row.get(6)?,
        status: column_status(row, 7)?,
        forwarded,
        created_at: row.get(10)?,
    })
}

pub(crate) fn column_kind(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<MessageKind> {
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn column_status(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<MessageStatus> {
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
