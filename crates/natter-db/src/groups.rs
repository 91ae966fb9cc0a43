//! Group membership: adding and removing members, renaming, photos, and the
//! membership audit. Membership lives in a single `participants` relation;
//! `conversations.is_group` is what makes a conversation a group.

use rusqlite::{Connection, params};
use tracing::{debug, info, warn};

use natter_types::api::{AddMembersResult, LeaveGroupResult, MembershipAudit};
use natter_types::models::{Conversation, Participant};

use crate::conversations::{
    is_participant, participant_count, query_conversation, query_participants, require_participant,
};
use crate::error::{StoreError, StoreResult, is_unique_violation};
use crate::status::forget_reads;
use crate::users::query_user_by_name;
use crate::{Database, now};

pub const MAX_GROUP_NAME_LEN: usize = 64;

impl Database {
    /// Add `usernames` to a group. Names that don't resolve or already belong
    /// to the group are reported as failed; the rest are added.
    pub fn add_members(
        &self,
        group_id: &str,
        adder_id: &str,
        usernames: &[String],
    ) -> StoreResult<AddMembersResult> {
        self.with_tx(|tx| {
            load_group(tx, group_id)?;
            require_participant(tx, group_id, adder_id)?;

            let mut result = AddMembersResult::default();
            let joined_at = now();
            for raw in usernames {
                let username = raw.trim();
                if result.added_users.iter().chain(&result.failed_users).any(|u| u == username) {
                    continue;
                }

                let Some(user) = query_user_by_name(tx, username)? else {
                    debug!("Cannot add '{}' to {}: no such user", username, group_id);
                    result.failed_users.push(username.to_string());
                    continue;
                };
                if is_participant(tx, group_id, &user.id)? {
                    debug!("Cannot add '{}' to {}: already a member", username, group_id);
                    result.failed_users.push(username.to_string());
                    continue;
                }

                tx.execute(
                    "INSERT INTO participants (conversation_id, user_id, joined_at) VALUES (?1, ?2, ?3)",
                    params![group_id, user.id, joined_at],
                )?;
                result.added_users.push(user.name);
            }

            result.member_count = participant_count(tx, group_id)?;
            info!(
                "Group {}: {} added, {} failed, {} members",
                group_id,
                result.added_count(),
                result.failed_count(),
                result.member_count
            );
            Ok(result)
        })
    }

    /// Remove `user_id` from a group. The last member leaving deletes the
    /// group, and with it every message, reaction, comment and read record.
    pub fn leave_group(&self, group_id: &str, user_id: &str) -> StoreResult<LeaveGroupResult> {
        self.with_tx(|tx| {
            load_group(tx, group_id)?;
            require_participant(tx, group_id, user_id)?;

            tx.execute(
                "DELETE FROM participants WHERE conversation_id = ?1 AND user_id = ?2",
                params![group_id, user_id],
            )?;

            let remaining = participant_count(tx, group_id)?;
            if remaining > 0 {
                forget_reads(tx, group_id, user_id)?;
                info!("User {} left group {} ({} remain)", user_id, group_id, remaining);
                return Ok(LeaveGroupResult {
                    remaining_member_count: remaining,
                    is_group_deleted: false,
                });
            }

            delete_conversation_rows(tx, group_id)?;
            info!("Group {} deleted after its last member left", group_id);
            Ok(LeaveGroupResult {
                remaining_member_count: 0,
                is_group_deleted: true,
            })
        })
    }

    pub fn set_group_name(&self, group_id: &str, user_id: &str, name: &str) -> StoreResult<Conversation> {
        let name = validate_group_name(name)?;

        self.with_tx(|tx| {
            let mut group = load_group(tx, group_id)?;
            require_participant(tx, group_id, user_id)?;

            if group_title_taken(tx, name, Some(group_id))? {
                return Err(StoreError::Conflict(format!("group name '{}' is taken", name)));
            }
            tx.execute(
                "UPDATE conversations SET title = ?1 WHERE id = ?2",
                params![name, group_id],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StoreError::Conflict(format!("group name '{}' is taken", name))
                } else {
                    e.into()
                }
            })?;

            info!("Group {} renamed to '{}' by {}", group_id, name, user_id);
            group.title = name.to_string();
            Ok(group)
        })
    }

    pub fn set_group_photo(
        &self,
        group_id: &str,
        user_id: &str,
        data: &[u8],
        media_type: &str,
    ) -> StoreResult<Conversation> {
        self.with_tx(|tx| {
            let mut group = load_group(tx, group_id)?;
            require_participant(tx, group_id, user_id)?;

            let media_id = self.insert_media(tx, data, media_type)?;
            tx.execute(
                "UPDATE conversations SET photo_id = ?1 WHERE id = ?2",
                params![media_id, group_id],
            )?;

            debug!("Group {} photo set to {}", group_id, media_id);
            group.photo_id = Some(media_id);
            Ok(group)
        })
    }

    pub fn group_members(&self, group_id: &str, user_id: &str) -> StoreResult<Vec<Participant>> {
        self.with_conn(|conn| {
            load_group(conn, group_id)?;
            require_participant(conn, group_id, user_id)?;
            query_participants(conn, group_id)
        })
    }

    /// Scan the membership relation for structural anomalies: conversations
    /// with no participants, and direct conversations without exactly two.
    /// Anomalies are logged and reported, never treated as failures.
    pub fn audit_memberships(&self) -> StoreResult<MembershipAudit> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id, c.is_group, COUNT(p.user_id)
                 FROM conversations c
                 LEFT JOIN participants p ON p.conversation_id = c.id
                 GROUP BY c.id
                 ORDER BY c.id",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, bool>(1)?, row.get::<_, i64>(2)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let mut audit = MembershipAudit {
                conversations_checked: rows.len(),
                ..Default::default()
            };
            for (id, is_group, members) in rows {
                if members == 0 {
                    warn!("Conversation {} has no participants", id);
                    audit.empty_conversations.push(id);
                } else if !is_group && members != 2 {
                    warn!("Direct conversation {} has {} participants", id, members);
                    audit.malformed_direct.push(id);
                }
            }

            if audit.is_clean() {
                debug!("Membership audit clean ({} conversations)", audit.conversations_checked);
            }
            Ok(audit)
        })
    }
}

/// Trim and check a group name. Returns the trimmed form.
pub fn validate_group_name(name: &str) -> StoreResult<&str> {
    let name = name.trim();
    if name.is_empty() || name.chars().count() > MAX_GROUP_NAME_LEN {
        return Err(StoreError::Validation(format!(
            "group name must be 1-{} characters",
            MAX_GROUP_NAME_LEN
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.'))
    {
        return Err(StoreError::Validation(format!(
            "group name '{}' may only contain letters, digits, spaces, '-', '_' and '.'",
            name
        )));
    }
    Ok(name)
}

pub(crate) fn group_title_taken(conn: &Connection, title: &str, except_id: Option<&str>) -> StoreResult<bool> {
    Ok(conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM conversations
                       WHERE is_group = 1 AND title = ?1 AND id IS NOT ?2)",
        params![title, except_id],
        |row| row.get(0),
    )?)
}

fn load_group(conn: &Connection, group_id: &str) -> StoreResult<Conversation> {
    match query_conversation(conn, group_id)? {
        Some(c) if c.is_group => Ok(c),
        _ => Err(StoreError::not_found(format!("group {}", group_id))),
    }
}

/// Delete a conversation and everything hanging off it. Child rows are removed
/// explicitly so the outcome does not depend on the foreign_keys pragma.
fn delete_conversation_rows(conn: &Connection, conversation_id: &str) -> StoreResult<()> {
    const CHILDREN: &[&str] = &[
        "DELETE FROM reactions WHERE message_id IN (SELECT id FROM messages WHERE conversation_id = ?1)",
        "DELETE FROM comments WHERE message_id IN (SELECT id FROM messages WHERE conversation_id = ?1)",
        "DELETE FROM message_reads WHERE message_id IN (SELECT id FROM messages WHERE conversation_id = ?1)",
        "DELETE FROM messages WHERE conversation_id = ?1",
        "DELETE FROM participants WHERE conversation_id = ?1",
        "DELETE FROM conversations WHERE id = ?1",
    ];
    for sql in CHILDREN {
        conn.execute(sql, [conversation_id])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{count, db, direct, group, text, user};

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn partial_add_reports_failures() {
        let db = db();
        let alice = user(&db, "alice");
        let bob = user(&db, "bob");
        let carol = user(&db, "carol");
        let crew = group(&db, "Crew", &alice, &[&bob]);

        let result = db
            .add_members(&crew, &alice.id, &names(&["carol", "nobody", "bob"]))
            .unwrap();

        assert_eq!(result.added_users, vec!["carol".to_string()]);
        assert_eq!(result.failed_users, names(&["nobody", "bob"]));
        assert_eq!(result.member_count, 3);

        let members = db.group_members(&crew, &carol.id).unwrap();
        assert_eq!(members.len(), 3);
        assert_eq!(count(&db, "participants"), 3);
    }

    #[test]
    fn repeated_usernames_count_once() {
        let db = db();
        let alice = user(&db, "alice");
        user(&db, "bob");
        let crew = group(&db, "Crew", &alice, &[]);

        let result = db.add_members(&crew, &alice.id, &names(&["bob", " bob "])).unwrap();
        assert_eq!(result.added_users, names(&["bob"]));
        assert!(result.failed_users.is_empty());
        assert_eq!(result.member_count, 2);
    }

    #[test]
    fn only_members_may_add() {
        let db = db();
        let alice = user(&db, "alice");
        let eve = user(&db, "eve");
        user(&db, "bob");
        let crew = group(&db, "Crew", &alice, &[]);

        let err = db.add_members(&crew, &eve.id, &names(&["bob"])).unwrap_err();
        assert!(err.is_unauthorized());
        assert_eq!(count(&db, "participants"), 1);
    }

    #[test]
    fn direct_conversations_are_not_groups() {
        let db = db();
        let alice = user(&db, "alice");
        let bob = user(&db, "bob");
        user(&db, "carol");
        let dm = direct(&db, &alice, &bob);

        assert!(db.add_members(&dm, &alice.id, &names(&["carol"])).unwrap_err().is_not_found());
        assert!(db.leave_group(&dm, &alice.id).unwrap_err().is_not_found());
    }

    #[test]
    fn last_member_leaving_deletes_group() {
        let db = db();
        let alice = user(&db, "alice");
        let bob = user(&db, "bob");
        let crew = group(&db, "Crew", &alice, &[&bob]);
        let msg = text(&db, &crew, &bob, "bye all");
        db.add_comment(&msg, &alice.id, "👋").unwrap();

        let first = db.leave_group(&crew, &bob.id).unwrap();
        assert_eq!(
            first,
            LeaveGroupResult {
                remaining_member_count: 1,
                is_group_deleted: false
            }
        );

        let last = db.leave_group(&crew, &alice.id).unwrap();
        assert_eq!(
            last,
            LeaveGroupResult {
                remaining_member_count: 0,
                is_group_deleted: true
            }
        );
        assert_eq!(count(&db, "conversations"), 0);
        assert_eq!(count(&db, "messages"), 0);
        assert_eq!(count(&db, "reactions"), 0);
        assert!(db.audit_memberships().unwrap().is_clean());
    }

    #[test]
    fn non_member_cannot_leave() {
        let db = db();
        let alice = user(&db, "alice");
        let eve = user(&db, "eve");
        let crew = group(&db, "Crew", &alice, &[]);

        assert!(db.leave_group(&crew, &eve.id).unwrap_err().is_unauthorized());
        assert!(db.leave_group("cv0000000000", &alice.id).unwrap_err().is_not_found());
    }

    #[test]
    fn rename_validates_and_checks_uniqueness() {
        let db = db();
        let alice = user(&db, "alice");
        let eve = user(&db, "eve");
        let crew = group(&db, "Crew", &alice, &[]);
        group(&db, "Other", &alice, &[]);

        assert!(db.set_group_name(&crew, &alice.id, "Other").unwrap_err().is_conflict());
        assert!(db.set_group_name(&crew, &alice.id, "bad/name").unwrap_err().is_validation());
        assert!(db.set_group_name(&crew, &eve.id, "Fine").unwrap_err().is_unauthorized());

        // Keeping the current name is not a conflict with itself.
        db.set_group_name(&crew, &alice.id, "Crew").unwrap();

        let renamed = db.set_group_name(&crew, &alice.id, " Night Crew ").unwrap();
        assert_eq!(renamed.title, "Night Crew");
        let list = db.get_user_conversations(&alice.id).unwrap();
        assert!(list.iter().any(|c| c.id == crew && c.title == "Night Crew"));
    }

    #[test]
    fn photo_update_requires_membership() {
        let db = db();
        let alice = user(&db, "alice");
        let eve = user(&db, "eve");
        let crew = group(&db, "Crew", &alice, &[]);

        let err = db.set_group_photo(&crew, &eve.id, b"img", "image/png").unwrap_err();
        assert!(err.is_unauthorized());
        assert_eq!(count(&db, "media"), 0);

        let updated = db.set_group_photo(&crew, &alice.id, b"img", "image/png").unwrap();
        let photo = updated.photo_id.unwrap();
        assert_eq!(db.get_media(&photo).unwrap().media_type, "image/png");
    }

    #[test]
    fn audit_reports_malformed_rows() {
        let db = db();
        let alice = user(&db, "alice");
        let bob = user(&db, "bob");
        let dm = direct(&db, &alice, &bob);
        let crew = group(&db, "Crew", &alice, &[]);

        db.with_conn(|conn| {
            conn.execute("DELETE FROM participants WHERE conversation_id = ?1 AND user_id = ?2", params![dm, bob.id])?;
            conn.execute("DELETE FROM participants WHERE conversation_id = ?1", [&crew])?;
            Ok(())
        })
        .unwrap();

        let audit = db.audit_memberships().unwrap();
        assert_eq!(audit.conversations_checked, 2);
        assert_eq!(audit.empty_conversations, vec![crew]);
        assert_eq!(audit.malformed_direct, vec![dm]);
    }

    #[test]
    fn group_name_rules() {
        assert!(validate_group_name("").is_err());
        assert!(validate_group_name(&"a".repeat(MAX_GROUP_NAME_LEN + 1)).is_err());
        assert!(validate_group_name("emoji 🎉").is_err());
        assert_eq!(validate_group_name("  Équipe_1.0 ").unwrap(), "Équipe_1.0");
    }
}
