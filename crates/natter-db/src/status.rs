//! Delivery/read state of messages.
//!
//! Status only ever moves `delivered -> read`. In a direct conversation the
//! recipient reading a message is enough. In groups each read is recorded per
//! (message, user) and `messages.read_count` is bumped in the same
//! transaction; the message flips to `read` once that count covers every
//! current participant other than the sender. A member leaving takes their
//! read records with them, so `read_count` only ever counts current members.

use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;

use natter_types::api::StatusUpdate;
use natter_types::models::MessageStatus;

use crate::conversations::{query_conversation, require_participant};
use crate::error::{StoreError, StoreResult};
use crate::messages::column_status;
use crate::{Database, now};

struct MessageState {
    id: String,
    conversation_id: String,
    sender_id: String,
    status: MessageStatus,
    read_count: u32,
}

impl Database {
    pub fn update_message_status(
        &self,
        message_id: &str,
        user_id: &str,
        status: MessageStatus,
    ) -> StoreResult<StatusUpdate> {
        self.with_tx(|tx| {
            let state = query_state(tx, message_id)?
                .ok_or_else(|| StoreError::not_found(format!("message {}", message_id)))?;
            require_participant(tx, &state.conversation_id, user_id)?;

            match status {
                // Never regresses; a delivered report on anything is a no-op.
                MessageStatus::Delivered => current(tx, state),
                MessageStatus::Read => apply_read(tx, state, user_id),
            }
        })
    }

    /// Apply a read event from `user_id` to every message in the conversation
    /// they did not send. Returns how many messages became `read`.
    pub fn mark_conversation_read(&self, conversation_id: &str, user_id: &str) -> StoreResult<usize> {
        self.with_tx(|tx| {
            if query_conversation(tx, conversation_id)?.is_none() {
                return Err(StoreError::not_found(format!("conversation {}", conversation_id)));
            }
            require_participant(tx, conversation_id, user_id)?;

            let pending = {
                let mut stmt = tx.prepare(
                    "SELECT id, conversation_id, sender_id, status, read_count FROM messages
                     WHERE conversation_id = ?1 AND sender_id != ?2 AND status = 'delivered'
                     ORDER BY created_at, rowid",
                )?;
                let rows = stmt
                    .query_map(params![conversation_id, user_id], map_state)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            };

            let mut newly_read = 0;
            for state in pending {
                if apply_read(tx, state, user_id)?.status == MessageStatus::Read {
                    newly_read += 1;
                }
            }

            debug!("{} read {} messages in {}", user_id, newly_read, conversation_id);
            Ok(newly_read)
        })
    }

    /// Users with an individual read record for a group message.
    pub fn read_receipts(&self, message_id: &str, user_id: &str) -> StoreResult<Vec<String>> {
        self.with_conn(|conn| {
            let state = query_state(conn, message_id)?
                .ok_or_else(|| StoreError::not_found(format!("message {}", message_id)))?;
            require_participant(conn, &state.conversation_id, user_id)?;

            let mut stmt = conn.prepare(
                "SELECT user_id FROM message_reads WHERE message_id = ?1 ORDER BY read_at, user_id",
            )?;
            let readers = stmt
                .query_map([message_id], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(readers)
        })
    }
}

fn apply_read(conn: &Connection, state: MessageState, reader_id: &str) -> StoreResult<StatusUpdate> {
    if state.status == MessageStatus::Read || reader_id == state.sender_id {
        return current(conn, state);
    }

    let required = required_reads(conn, &state)?;
    let is_group = query_conversation(conn, &state.conversation_id)?.is_some_and(|c| c.is_group);
    let read_count = if !is_group {
        // Direct conversations keep no per-user record.
        conn.execute(
            "UPDATE messages SET read_count = MAX(read_count, 1) WHERE id = ?1",
            [&state.id],
        )?;
        state.read_count.max(1)
    } else {
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO message_reads (message_id, user_id, read_at) VALUES (?1, ?2, ?3)",
            params![state.id, reader_id, now()],
        )?;
        if inserted == 0 {
            state.read_count
        } else {
            conn.execute(
                "UPDATE messages SET read_count = read_count + 1 WHERE id = ?1",
                [&state.id],
            )?;
            state.read_count + 1
        }
    };

    let status = if read_count >= required {
        conn.execute("UPDATE messages SET status = 'read' WHERE id = ?1", [&state.id])?;
        debug!("Message {} is now read ({}/{})", state.id, read_count, required);
        MessageStatus::Read
    } else {
        MessageStatus::Delivered
    };

    Ok(StatusUpdate {
        message_id: state.id,
        status,
        read_count,
        required_reads: required,
    })
}

/// Forget `user_id`'s reads in a group they just left and mark as read any
/// message that was only waiting on them. Returns how many messages that was.
pub(crate) fn forget_reads(conn: &Connection, conversation_id: &str, user_id: &str) -> StoreResult<usize> {
    conn.execute(
        "UPDATE messages SET read_count = read_count - 1
         WHERE conversation_id = ?1
           AND id IN (SELECT message_id FROM message_reads WHERE user_id = ?2)",
        params![conversation_id, user_id],
    )?;
    let forgotten = conn.execute(
        "DELETE FROM message_reads
         WHERE user_id = ?2
           AND message_id IN (SELECT id FROM messages WHERE conversation_id = ?1)",
        params![conversation_id, user_id],
    )?;

    let completed = conn.execute(
        "UPDATE messages SET status = 'read'
         WHERE conversation_id = ?1 AND status = 'delivered' AND read_count > 0
           AND read_count >= (SELECT COUNT(*) FROM participants p
                              WHERE p.conversation_id = ?1 AND p.user_id != messages.sender_id)",
        [conversation_id],
    )?;

    debug!(
        "Dropped {} reads of {} in {}; {} messages now read",
        forgotten, user_id, conversation_id, completed
    );
    Ok(completed)
}

fn current(conn: &Connection, state: MessageState) -> StoreResult<StatusUpdate> {
    let required = required_reads(conn, &state)?;
    Ok(StatusUpdate {
        message_id: state.id,
        status: state.status,
        read_count: state.read_count,
        required_reads: required,
    })
}

/// Current participants other than the sender.
fn required_reads(conn: &Connection, state: &MessageState) -> StoreResult<u32> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM participants WHERE conversation_id = ?1 AND user_id != ?2",
        params![state.conversation_id, state.sender_id],
        |row| row.get(0),
    )?;
    Ok(n as u32)
}

fn query_state(conn: &Connection, message_id: &str) -> StoreResult<Option<MessageState>> {
    Ok(conn
        .query_row(
            "SELECT id, conversation_id, sender_id, status, read_count FROM messages WHERE id = ?1",
            [message_id],
            map_state,
        )
        .optional()?)
}

fn map_state(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageState> {
    Ok(MessageState {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sender_id: row.get(2)?,
        status: column_status(row, 3)?,
        read_count: row.get(4)?,
    })
}
