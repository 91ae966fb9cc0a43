use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info, warn};

use natter_types::api::{
    ConversationDetails, ConversationSummary, LastMessage, MessageThread, StartConversationResult,
};
use natter_types::models::{Conversation, Participant};

use crate::error::{StoreError, StoreResult, is_unique_violation};
use crate::groups::{group_title_taken, validate_group_name};
use crate::messages::{column_kind, query_conversation_messages};
use crate::reactions::query_conversation_feedback;
use crate::users::user_exists;
use crate::{Database, IdKind, now};

impl Database {
    /// Create a conversation between `initiator_id` and `recipient_ids`.
    ///
    /// A direct (non-group) request returns the existing conversation for the
    /// pair when there is one, so repeated calls never create duplicates.
    /// Everything else happens in one transaction: an unknown participant
    /// leaves no conversation row and no membership behind.
    pub fn start_conversation(
        &self,
        initiator_id: &str,
        recipient_ids: &[String],
        title: &str,
        is_group: bool,
    ) -> StoreResult<StartConversationResult> {
        let members = member_union(initiator_id, recipient_ids);

        let direct_key = if is_group {
            None
        } else {
            if members.len() != 2 {
                return Err(StoreError::Validation(
                    "a direct conversation needs exactly one other participant".into(),
                ));
            }
            Some(direct_key(members[0], members[1]))
        };
        let title = match direct_key {
            None => validate_group_name(title)?,
            Some(_) => title.trim(),
        };

        if let Some(key) = &direct_key {
            if let Some(existing) = self.with_conn(|conn| find_direct(conn, key))? {
                debug!("Direct conversation {} already exists", existing);
                return Ok(StartConversationResult {
                    conversation_id: existing,
                    created: false,
                });
            }
        }

        let result = self.with_tx(|tx| {
            match &direct_key {
                // Re-check under the write lock.
                Some(key) => {
                    if let Some(existing) = find_direct(tx, key)? {
                        return Ok(StartConversationResult {
                            conversation_id: existing,
                            created: false,
                        });
                    }
                }
                None => {
                    if group_title_taken(tx, title, None)? {
                        return Err(StoreError::Conflict(format!("group name '{}' is taken", title)));
                    }
                }
            }

            let id = self.next_id(tx, IdKind::Conversation)?;
            let created_at = now();
            tx.execute(
                "INSERT INTO conversations (id, title, is_group, direct_key, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, title, is_group, direct_key, created_at],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StoreError::Conflict("conversation already exists".into())
                } else {
                    e.into()
                }
            })?;

            for member in &members {
                if !user_exists(tx, member)? {
                    return Err(StoreError::not_found(format!("user {}", member)));
                }
                tx.execute(
                    "INSERT INTO participants (conversation_id, user_id, joined_at) VALUES (?1, ?2, ?3)",
                    params![id, member, created_at],
                )?;
            }

            info!(
                "Created {} conversation {} with {} participants",
                if is_group { "group" } else { "direct" },
                id,
                members.len()
            );
            Ok(StartConversationResult {
                conversation_id: id,
                created: true,
            })
        });

        match (result, &direct_key) {
            (Err(StoreError::Conflict(_)), Some(key)) => {
                warn!("Direct conversation for {} created concurrently, re-reading", key);
                let existing = self
                    .with_conn(|conn| find_direct(conn, key))?
                    .ok_or_else(|| StoreError::not_found("direct conversation"))?;
                Ok(StartConversationResult {
                    conversation_id: existing,
                    created: false,
                })
            }
            (other, _) => other,
        }
    }

    /// Every conversation `user_id` belongs to, most recently active first.
    pub fn get_user_conversations(&self, user_id: &str) -> StoreResult<Vec<ConversationSummary>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id, c.title, c.is_group, c.photo_id, c.created_at,
                        (SELECT COUNT(*) FROM participants pc WHERE pc.conversation_id = c.id),
                        m.id, m.sender_id, m.kind, m.content, m.created_at,
                        o.name, o.photo_id
                 FROM participants p
                 JOIN conversations c ON c.id = p.conversation_id
                 LEFT JOIN messages m ON m.id = (
                     SELECT lm.id FROM messages lm
                     WHERE lm.conversation_id = c.id
                     ORDER BY lm.created_at DESC, lm.rowid DESC
                     LIMIT 1)
                 LEFT JOIN participants op
                     ON c.is_group = 0 AND op.conversation_id = c.id AND op.user_id != p.user_id
                 LEFT JOIN users o ON o.id = op.user_id
                 WHERE p.user_id = ?1
                 ORDER BY COALESCE(m.created_at, c.created_at) DESC, c.id",
            )?;

            let rows = stmt
                .query_map([user_id], |row| {
                    let is_group: bool = row.get(2)?;
                    let other_name: Option<String> = row.get(11)?;

                    let (title, photo_id) = match other_name {
                        Some(name) if !is_group => (name, row.get(12)?),
                        _ => (row.get(1)?, row.get(3)?),
                    };
                    let last_message = match row.get::<_, Option<String>>(6)? {
                        Some(message_id) => Some(LastMessage {
                            message_id,
                            sender_id: row.get(7)?,
                            kind: column_kind(row, 8)?,
                            content: row.get(9)?,
                            sent_at: row.get(10)?,
                        }),
                        None => None,
                    };

                    Ok(ConversationSummary {
                        id: row.get(0)?,
                        title,
                        is_group,
                        photo_id,
                        member_count: row.get::<_, i64>(5)? as usize,
                        last_message,
                        created_at: row.get(4)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    /// Metadata, members and full message history of a conversation. Callers
    /// who are not participants get `NotFound`, not a hint that it exists.
    pub fn get_conversation_details(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> StoreResult<ConversationDetails> {
        self.with_conn(|conn| {
            let not_found = || StoreError::not_found(format!("conversation {}", conversation_id));

            let mut conversation = query_conversation(conn, conversation_id)?.ok_or_else(not_found)?;
            if !is_participant(conn, conversation_id, user_id)? {
                return Err(not_found());
            }

            let participants = query_participants(conn, conversation_id)?;
            if !conversation.is_group {
                if let Some(other) = participants.iter().find(|p| p.user_id != user_id) {
                    conversation.title = other.name.clone();
                    conversation.photo_id = other.photo_id.clone();
                }
            }

            let mut feedback = query_conversation_feedback(conn, conversation_id)?;
            let messages = query_conversation_messages(conn, conversation_id)?
                .into_iter()
                .map(|message| {
                    let fb = feedback.remove(&message.id).unwrap_or_default();
                    MessageThread {
                        message,
                        comments: fb.comments,
                        reactions: fb.reactions,
                    }
                })
                .collect();

            Ok(ConversationDetails {
                conversation,
                participants,
                messages,
            })
        })
    }
}

/// Initiator first, then recipients in request order, without duplicates.
fn member_union<'a>(initiator_id: &'a str, recipient_ids: &'a [String]) -> Vec<&'a str> {
    let mut members = vec![initiator_id.trim()];
    for recipient in recipient_ids {
        let recipient = recipient.trim();
        if !recipient.is_empty() && !members.contains(&recipient) {
            members.push(recipient);
        }
    }
    members
}

fn direct_key(a: &str, b: &str) -> String {
    if a <= b {
        format!("{}|{}", a, b)
    } else {
        format!("{}|{}", b, a)
    }
}

fn find_direct(conn: &Connection, key: &str) -> StoreResult<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT id FROM conversations WHERE direct_key = ?1",
            [key],
            |row| row.get(0),
        )
        .optional()?)
}

pub(crate) fn query_conversation(conn: &Connection, id: &str) -> StoreResult<Option<Conversation>> {
    Ok(conn
        .query_row(
            "SELECT id, title, is_group, photo_id, created_at FROM conversations WHERE id = ?1",
            [id],
            |row| {
                Ok(Conversation {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    is_group: row.get(2)?,
                    photo_id: row.get(3)?,
                    created_at: row.get(4)?,
                })
            },
        )
        .optional()?)
}

pub(crate) fn is_participant(conn: &Connection, conversation_id: &str, user_id: &str) -> StoreResult<bool> {
    Ok(conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM participants WHERE conversation_id = ?1 AND user_id = ?2)",
        params![conversation_id, user_id],
        |row| row.get(0),
    )?)
}

pub(crate) fn require_participant(conn: &Connection, conversation_id: &str, user_id: &str) -> StoreResult<()> {
    if is_participant(conn, conversation_id, user_id)? {
        Ok(())
    } else {
        Err(StoreError::Unauthorized(format!(
            "user {} is not a participant of {}",
            user_id, conversation_id
        )))
    }
}

pub(crate) fn participant_count(conn: &Connection, conversation_id: &str) -> StoreResult<usize> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM participants WHERE conversation_id = ?1",
        [conversation_id],
        |row| row.get(0),
    )?;
    Ok(n as usize)
}

pub(crate) fn query_participants(conn: &Connection, conversation_id: &str) -> StoreResult<Vec<Participant>> {
    let mut stmt = conn.prepare(
        "SELECT p.user_id, u.name, u.photo_id, p.joined_at
         FROM participants p
         JOIN users u ON u.id = p.user_id
         WHERE p.conversation_id = ?1
         ORDER BY p.joined_at, u.name",
    )?;
    let rows = stmt
        .query_map([conversation_id], |row| {
            Ok(Participant {
                user_id: row.get(0)?,
                name: row.get(1)?,
                photo_id: row.get(2)?,
                joined_at: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{count, db, direct, group, text, user};

    #[test]
    fn direct_conversation_is_idempotent() {
        let db = db();
        let alice = user(&db, "alice");
        let bob = user(&db, "bob");

        let first = db.start_conversation(&alice.id, &[bob.id.clone()], "", false).unwrap();
        let second = db.start_conversation(&alice.id, &[bob.id.clone()], "", false).unwrap();
        let reversed = db.start_conversation(&bob.id, &[alice.id.clone()], "hey", false).unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.conversation_id, second.conversation_id);
        assert_eq!(first.conversation_id, reversed.conversation_id);
        assert_eq!(count(&db, "conversations"), 1);
        assert_eq!(count(&db, "participants"), 2);
    }

    #[test]
    fn direct_conversation_needs_exactly_one_other() {
        let db = db();
        let alice = user(&db, "alice");
        let bob = user(&db, "bob");
        let carol = user(&db, "carol");

        let to_self = db.start_conversation(&alice.id, &[alice.id.clone()], "", false);
        assert!(to_self.unwrap_err().is_validation());

        let to_two = db.start_conversation(&alice.id, &[bob.id.clone(), carol.id.clone()], "", false);
        assert!(to_two.unwrap_err().is_validation());
        assert_eq!(count(&db, "conversations"), 0);
    }

    #[test]
    fn unknown_participant_aborts_without_partial_writes() {
        let db = db();
        let alice = user(&db, "alice");
        let bob = user(&db, "bob");

        let err = db
            .start_conversation(&alice.id, &[bob.id.clone(), "ZZZZZZZZZZZZ".into()], "Crew", true)
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(count(&db, "conversations"), 0);
        assert_eq!(count(&db, "participants"), 0);
    }

    #[test]
    fn group_members_are_deduplicated() {
        let db = db();
        let alice = user(&db, "alice");
        let bob = user(&db, "bob");

        let result = db
            .start_conversation(&alice.id, &[bob.id.clone(), bob.id.clone(), alice.id.clone()], "Crew", true)
            .unwrap();
        db.with_conn(|conn| {
            assert_eq!(participant_count(conn, &result.conversation_id)?, 2);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn group_titles_are_unique_and_validated() {
        let db = db();
        let alice = user(&db, "alice");

        group(&db, "Crew", &alice, &[]);
        let dup = db.start_conversation(&alice.id, &[], "Crew", true);
        assert!(dup.unwrap_err().is_conflict());

        let bad = db.start_conversation(&alice.id, &[], "  ", true);
        assert!(bad.unwrap_err().is_validation());
    }

    #[test]
    fn listing_substitutes_other_participant_for_direct_title() {
        let db = db();
        let alice = user(&db, "alice");
        let bob = user(&db, "bob");
        let carol = user(&db, "carol");

        let dm = direct(&db, &alice, &bob);
        let crew = group(&db, "Crew", &alice, &[&bob, &carol]);
        text(&db, &dm, &bob, "first");
        text(&db, &crew, &carol, "latest");

        let list = db.get_user_conversations(&alice.id).unwrap();
        assert_eq!(list.len(), 2);

        assert_eq!(list[0].id, crew);
        assert_eq!(list[0].title, "Crew");
        assert_eq!(list[0].member_count, 3);
        assert_eq!(list[0].last_message.as_ref().unwrap().content, "latest");

        assert_eq!(list[1].id, dm);
        assert_eq!(list[1].title, "bob");
        assert_eq!(list[1].last_message.as_ref().unwrap().sender_id, bob.id);

        let bobs_view = db.get_user_conversations(&bob.id).unwrap();
        let dm_for_bob = bobs_view.iter().find(|c| c.id == dm).unwrap();
        assert_eq!(dm_for_bob.title, "alice");

        // Substitution is read-time only.
        db.with_conn(|conn| {
            assert_eq!(query_conversation(conn, &dm)?.unwrap().title, "");
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn conversation_without_messages_has_no_last_message() {
        let db = db();
        let alice = user(&db, "alice");
        group(&db, "Solo", &alice, &[]);

        let list = db.get_user_conversations(&alice.id).unwrap();
        assert_eq!(list.len(), 1);
        assert!(list[0].last_message.is_none());
    }

    #[test]
    fn details_require_membership() {
        let db = db();
        let alice = user(&db, "alice");
        let bob = user(&db, "bob");
        let eve = user(&db, "eve");
        let dm = direct(&db, &alice, &bob);

        assert!(db.get_conversation_details(&dm, &eve.id).unwrap_err().is_not_found());
        assert!(db.get_conversation_details("cv0000000000", &alice.id).unwrap_err().is_not_found());
    }

    #[test]
    fn details_include_messages_with_feedback() {
        let db = db();
        let alice = user(&db, "alice");
        let bob = user(&db, "bob");
        let dm = direct(&db, &alice, &bob);

        let m1 = text(&db, &dm, &alice, "hello");
        let m2 = text(&db, &dm, &bob, "hi back");
        db.add_comment(&m1, &bob.id, "👍").unwrap();
        db.add_comment(&m1, &bob.id, "nice to hear from you").unwrap();

        let details = db.get_conversation_details(&dm, &alice.id).unwrap();
        assert_eq!(details.conversation.title, "bob");
        assert_eq!(details.participants.len(), 2);

        let ids: Vec<&str> = details.messages.iter().map(|t| t.message.id.as_str()).collect();
        assert_eq!(ids, vec![m1.as_str(), m2.as_str()]);
        assert_eq!(details.messages[0].reactions.len(), 1);
        assert_eq!(details.messages[0].comments.len(), 1);
        assert!(details.messages[1].reactions.is_empty());
    }
}
