//! Reactions and comments on messages.
//!
//! A reaction is single-slot: one per (message, user), replaced in place when
//! the user changes it. Comments are free-form and append-only.

use std::collections::HashMap;

use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info};
use unicode_segmentation::UnicodeSegmentation;

use natter_types::api::{Feedback, MessageFeedback};
use natter_types::models::{Comment, Reaction};

use crate::conversations::require_participant;
use crate::error::{StoreError, StoreResult};
use crate::messages::MAX_TEXT_LEN;
use crate::{Database, IdKind, now};

/// Content up to this many graphemes posted through `add_comment` is a reaction.
pub const MAX_REACTION_GRAPHEMES: usize = 2;

impl Database {
    /// Post short content as a reaction and longer content as a comment.
    pub fn add_comment(&self, message_id: &str, user_id: &str, content: &str) -> StoreResult<Feedback> {
        self.with_tx(|tx| {
            authorize(tx, message_id, user_id)?;

            let content = content.trim();
            if content.is_empty() {
                return Err(StoreError::Validation("comment is empty".into()));
            }
            if grapheme_count(content) <= MAX_REACTION_GRAPHEMES {
                self.upsert_reaction(tx, message_id, user_id, content)
            } else {
                self.insert_comment(tx, message_id, user_id, content)
            }
        })
    }

    /// Set the caller's reaction, replacing any previous one.
    pub fn react(&self, message_id: &str, user_id: &str, emoji: &str) -> StoreResult<Feedback> {
        let emoji = emoji.trim();
        let len = grapheme_count(emoji);
        if len == 0 || len > MAX_REACTION_GRAPHEMES {
            return Err(StoreError::Validation(format!(
                "a reaction is 1-{} emoji",
                MAX_REACTION_GRAPHEMES
            )));
        }

        self.with_tx(|tx| {
            authorize(tx, message_id, user_id)?;
            self.upsert_reaction(tx, message_id, user_id, emoji)
        })
    }

    /// Clear the caller's reaction. Returns false when there was none.
    pub fn remove_reaction(&self, message_id: &str, user_id: &str) -> StoreResult<bool> {
        self.with_tx(|tx| {
            authorize(tx, message_id, user_id)?;
            let removed = tx.execute(
                "DELETE FROM reactions WHERE message_id = ?1 AND user_id = ?2",
                params![message_id, user_id],
            )?;
            Ok(removed > 0)
        })
    }

    pub fn post_comment(&self, message_id: &str, user_id: &str, text: &str) -> StoreResult<Feedback> {
        let text = text.trim();
        if text.is_empty() {
            return Err(StoreError::Validation("comment is empty".into()));
        }

        self.with_tx(|tx| {
            authorize(tx, message_id, user_id)?;
            self.insert_comment(tx, message_id, user_id, text)
        })
    }

    /// Delete one comment or reaction. Only its owner, while still a
    /// participant, may do so.
    pub fn delete_comment(&self, message_id: &str, comment_id: &str, user_id: &str) -> StoreResult<()> {
        self.with_tx(|tx| {
            let conversation_id = message_conversation(tx, message_id)?;

            let (table, owner) = match feedback_owner(tx, "comments", message_id, comment_id)? {
                Some(owner) => ("comments", owner),
                None => match feedback_owner(tx, "reactions", message_id, comment_id)? {
                    Some(owner) => ("reactions", owner),
                    None => {
                        return Err(StoreError::not_found(format!(
                            "comment {} on message {}",
                            comment_id, message_id
                        )));
                    }
                },
            };

            require_participant(tx, &conversation_id, user_id)?;
            if owner != user_id {
                return Err(StoreError::Unauthorized(format!(
                    "comment {} belongs to another user",
                    comment_id
                )));
            }

            tx.execute(&format!("DELETE FROM {} WHERE id = ?1", table), [comment_id])?;
            info!("Deleted {} row {} on message {}", table, comment_id, message_id);
            Ok(())
        })
    }

    pub fn message_feedback(&self, message_id: &str, user_id: &str) -> StoreResult<MessageFeedback> {
        self.with_conn(|conn| {
            authorize(conn, message_id, user_id)?;
            Ok(MessageFeedback {
                comments: query_comments(conn, "WHERE message_id = ?1", message_id)?,
                reactions: query_reactions(conn, "WHERE message_id = ?1", message_id)?,
            })
        })
    }

    fn upsert_reaction(
        &self,
        conn: &Connection,
        message_id: &str,
        user_id: &str,
        emoji: &str,
    ) -> StoreResult<Feedback> {
        let existing: Option<String> = conn
            .query_row(
                "SELECT id FROM reactions WHERE message_id = ?1 AND user_id = ?2",
                params![message_id, user_id],
                |row| row.get(0),
            )
            .optional()?;

        let created_at = now();
        let (id, replaced) = match existing {
            Some(id) => {
                conn.execute(
                    "UPDATE reactions SET emoji = ?1, created_at = ?2 WHERE id = ?3",
                    params![emoji, created_at, id],
                )?;
                (id, true)
            }
            None => {
                let id = self.next_id(conn, IdKind::Reaction)?;
                conn.execute(
                    "INSERT INTO reactions (id, message_id, user_id, emoji, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![id, message_id, user_id, emoji, created_at],
                )?;
                (id, false)
            }
        };

        debug!("Reaction {} by {} on {} ({})", emoji, user_id, message_id, if replaced { "replaced" } else { "new" });
        Ok(Feedback::Reaction {
            reaction: Reaction {
                id,
                message_id: message_id.to_string(),
                user_id: user_id.to_string(),
                emoji: emoji.to_string(),
                created_at,
            },
            replaced,
        })
    }

    fn insert_comment(
        &self,
        conn: &Connection,
        message_id: &str,
        user_id: &str,
        content: &str,
    ) -> StoreResult<Feedback> {
        if content.chars().count() > MAX_TEXT_LEN {
            return Err(StoreError::Validation(format!(
                "comment exceeds {} characters",
                MAX_TEXT_LEN
            )));
        }

        let comment = Comment {
            id: self.next_id(conn, IdKind::Comment)?,
            message_id: message_id.to_string(),
            user_id: user_id.to_string(),
            content: content.to_string(),
            created_at: now(),
        };
        conn.execute(
            "INSERT INTO comments (id, message_id, user_id, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![comment.id, comment.message_id, comment.user_id, comment.content, comment.created_at],
        )?;

        debug!("Comment {} by {} on {}", comment.id, user_id, message_id);
        Ok(Feedback::Comment { comment })
    }
}

fn grapheme_count(s: &str) -> usize {
    s.graphemes(true).count()
}

/// The message exists and `user_id` participates in its conversation.
fn authorize(conn: &Connection, message_id: &str, user_id: &str) -> StoreResult<()> {
    let conversation_id = message_conversation(conn, message_id)?;
    require_participant(conn, &conversation_id, user_id)
}

fn message_conversation(conn: &Connection, message_id: &str) -> StoreResult<String> {
    conn.query_row(
        "SELECT conversation_id FROM messages WHERE id = ?1",
        [message_id],
        |row| row.get(0),
    )
    .optional()?
    .ok_or_else(|| StoreError::not_found(format!("message {}", message_id)))
}

fn feedback_owner(
    conn: &Connection,
    table: &str,
    message_id: &str,
    id: &str,
) -> StoreResult<Option<String>> {
    let sql = format!("SELECT user_id FROM {} WHERE id = ?1 AND message_id = ?2", table);
    Ok(conn
        .query_row(&sql, params![id, message_id], |row| row.get(0))
        .optional()?)
}

/// Comments and reactions of every message in a conversation, keyed by message id.
pub(crate) fn query_conversation_feedback(
    conn: &Connection,
    conversation_id: &str,
) -> StoreResult<HashMap<String, MessageFeedback>> {
    let filter = "WHERE message_id IN (SELECT id FROM messages WHERE conversation_id = ?1)";

    let mut map: HashMap<String, MessageFeedback> = HashMap::new();
    for comment in query_comments(conn, filter, conversation_id)? {
        map.entry(comment.message_id.clone()).or_default().comments.push(comment);
    }
    for reaction in query_reactions(conn, filter, conversation_id)? {
        map.entry(reaction.message_id.clone()).or_default().reactions.push(reaction);
    }
    Ok(map)
}

fn query_comments(conn: &Connection, filter: &str, key: &str) -> StoreResult<Vec<Comment>> {
    let sql = format!(
        "SELECT id, message_id, user_id, content, created_at FROM comments {} ORDER BY created_at, rowid",
        filter
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([key], |row| {
            Ok(Comment {
                id: row.get(0)?,
                message_id: row.get(1)?,
                user_id: row.get(2)?,
                content: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn query_reactions(conn: &Connection, filter: &str, key: &str) -> StoreResult<Vec<Reaction>> {
    let sql = format!(
        "SELECT id, message_id, user_id, emoji, created_at FROM reactions {} ORDER BY created_at, rowid",
        filter
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([key], |row| {
            Ok(Reaction {
                id: row.get(0)?,
                message_id: row.get(1)?,
                user_id: row.get(2)?,
                emoji: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
