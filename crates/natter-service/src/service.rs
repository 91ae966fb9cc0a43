use std::sync::Arc;

use anyhow::anyhow;
use tracing::{error, info, warn};

use natter_db::{Database, IdGenerator, StoreError, StoreResult};
use natter_types::api::{
    AddMembersResult, ConversationDetails, ConversationSummary, Feedback, LeaveGroupResult,
    MembershipAudit, MessageCursor, MessageFeedback, StartConversationResult, StatusUpdate,
};
use natter_types::models::{Conversation, MediaBlob, Message, MessageKind, MessageStatus, Participant, User};

use crate::config::ServiceConfig;

/// Async entry points for an HTTP layer. Each call runs the matching
/// synchronous store operation on the blocking pool.
#[derive(Clone)]
pub struct ChatService {
    db: Arc<Database>,
}

impl ChatService {
    /// Open the configured store and audit its memberships once.
    pub fn open(config: &ServiceConfig) -> anyhow::Result<Self> {
        let ids = IdGenerator::from_os_rng(config.id_scheme);
        let db = if config.is_in_memory() {
            Database::open_in_memory(ids)?
        } else {
            Database::open(&config.db_path, ids)?
        };

        let audit = db.audit_memberships()?;
        if audit.is_clean() {
            info!("Chat store ready ({} conversations)", audit.conversations_checked);
        } else {
            warn!(
                "Chat store ready with membership anomalies: {} empty, {} malformed direct",
                audit.empty_conversations.len(),
                audit.malformed_direct.len()
            );
        }

        Ok(Self::new(db))
    }

    pub fn new(db: Database) -> Self {
        Self { db: Arc::new(db) }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    async fn run<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Database) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| {
                error!("spawn_blocking join error: {}", e);
                StoreError::Internal(anyhow!("store task failed: {}", e))
            })?
    }

    // -- Users & media --

    pub async fn ensure_user(&self, name: String) -> StoreResult<User> {
        self.run(move |db| db.ensure_user(&name)).await
    }

    pub async fn get_user(&self, user_id: String) -> StoreResult<User> {
        self.run(move |db| db.get_user(&user_id)).await
    }

    pub async fn rename_user(&self, user_id: String, new_name: String) -> StoreResult<User> {
        self.run(move |db| db.rename_user(&user_id, &new_name)).await
    }

    pub async fn set_user_photo(&self, user_id: String, data: Vec<u8>, media_type: String) -> StoreResult<User> {
        self.run(move |db| db.set_user_photo(&user_id, &data, &media_type)).await
    }

    pub async fn store_media(&self, data: Vec<u8>, media_type: String) -> StoreResult<String> {
        self.run(move |db| db.store_media(&data, &media_type)).await
    }

    pub async fn get_media(&self, media_id: String) -> StoreResult<MediaBlob> {
        self.run(move |db| db.get_media(&media_id)).await
    }

    // -- Conversations --

    pub async fn start_conversation(
        &self,
        initiator_id: String,
        recipient_ids: Vec<String>,
        title: String,
        is_group: bool,
    ) -> StoreResult<StartConversationResult> {
        self.run(move |db| db.start_conversation(&initiator_id, &recipient_ids, &title, is_group))
            .await
    }

    pub async fn get_user_conversations(&self, user_id: String) -> StoreResult<Vec<ConversationSummary>> {
        self.run(move |db| db.get_user_conversations(&user_id)).await
    }

    pub async fn get_conversation_details(
        &self,
        conversation_id: String,
        user_id: String,
    ) -> StoreResult<ConversationDetails> {
        self.run(move |db| db.get_conversation_details(&conversation_id, &user_id))
            .await
    }

    // -- Groups --

    pub async fn add_members(
        &self,
        group_id: String,
        adder_id: String,
        usernames: Vec<String>,
    ) -> StoreResult<AddMembersResult> {
        self.run(move |db| db.add_members(&group_id, &adder_id, &usernames)).await
    }

    pub async fn leave_group(&self, group_id: String, user_id: String) -> StoreResult<LeaveGroupResult> {
        self.run(move |db| db.leave_group(&group_id, &user_id)).await
    }

    pub async fn set_group_name(&self, group_id: String, user_id: String, name: String) -> StoreResult<Conversation> {
        self.run(move |db| db.set_group_name(&group_id, &user_id, &name)).await
    }

    pub async fn set_group_photo(
        &self,
        group_id: String,
        user_id: String,
        data: Vec<u8>,
        media_type: String,
    ) -> StoreResult<Conversation> {
        self.run(move |db| db.set_group_photo(&group_id, &user_id, &data, &media_type))
            .await
    }

    pub async fn group_members(&self, group_id: String, user_id: String) -> StoreResult<Vec<Participant>> {
        self.run(move |db| db.group_members(&group_id, &user_id)).await
    }

    pub async fn audit_memberships(&self) -> StoreResult<MembershipAudit> {
        self.run(|db| db.audit_memberships()).await
    }

    // -- Messages --

    pub async fn add_message(
        &self,
        conversation_id: String,
        sender_id: String,
        kind: MessageKind,
        content: String,
        content_type: String,
        parent_id: Option<String>,
    ) -> StoreResult<Message> {
        self.run(move |db| {
            db.add_message(
                &conversation_id,
                &sender_id,
                kind,
                &content,
                &content_type,
                parent_id.as_deref(),
            )
        })
        .await
    }

    pub async fn add_photo_message(
        &self,
        conversation_id: String,
        sender_id: String,
        data: Vec<u8>,
        media_type: String,
        parent_id: Option<String>,
    ) -> StoreResult<Message> {
        self.run(move |db| {
            db.add_photo_message(&conversation_id, &sender_id, &data, &media_type, parent_id.as_deref())
        })
        .await
    }

    pub async fn forward_message(
        &self,
        original_id: String,
        target_conversation_id: String,
        forwarder_id: String,
    ) -> StoreResult<Message> {
        self.run(move |db| db.forward_message(&original_id, &target_conversation_id, &forwarder_id))
            .await
    }

    pub async fn get_message(&self, message_id: String, user_id: String) -> StoreResult<Message> {
        self.run(move |db| db.get_message(&message_id, &user_id)).await
    }

    pub async fn list_messages(
        &self,
        conversation_id: String,
        user_id: String,
        limit: u32,
        before: Option<MessageCursor>,
    ) -> StoreResult<Vec<Message>> {
        self.run(move |db| db.list_messages(&conversation_id, &user_id, limit, before.as_ref()))
            .await
    }

    pub async fn delete_message(&self, message_id: String, requester_id: String) -> StoreResult<()> {
        self.run(move |db| db.delete_message(&message_id, &requester_id)).await
    }

    // -- Status --

    pub async fn update_message_status(
        &self,
        message_id: String,
        user_id: String,
        status: MessageStatus,
    ) -> StoreResult<StatusUpdate> {
        self.run(move |db| db.update_message_status(&message_id, &user_id, status))
            .await
    }

    pub async fn mark_conversation_read(&self, conversation_id: String, user_id: String) -> StoreResult<usize> {
        self.run(move |db| db.mark_conversation_read(&conversation_id, &user_id))
            .await
    }

    pub async fn read_receipts(&self, message_id: String, user_id: String) -> StoreResult<Vec<String>> {
        self.run(move |db| db.read_receipts(&message_id, &user_id)).await
    }

    // -- Reactions & comments --

    pub async fn add_comment(&self, message_id: String, user_id: String, content: String) -> StoreResult<Feedback> {
        self.run(move |db| db.add_comment(&message_id, &user_id, &content)).await
    }

    pub async fn react(&self, message_id: String, user_id: String, emoji: String) -> StoreResult<Feedback> {
        self.run(move |db| db.react(&message_id, &user_id, &emoji)).await
    }

    pub async fn remove_reaction(&self, message_id: String, user_id: String) -> StoreResult<bool> {
        self.run(move |db| db.remove_reaction(&message_id, &user_id)).await
    }

    pub async fn post_comment(&self, message_id: String, user_id: String, text: String) -> StoreResult<Feedback> {
        self.run(move |db| db.post_comment(&message_id, &user_id, &text)).await
    }

    pub async fn delete_comment(&self, message_id: String, comment_id: String, user_id: String) -> StoreResult<()> {
        self.run(move |db| db.delete_comment(&message_id, &comment_id, &user_id))
            .await
    }

    pub async fn message_feedback(&self, message_id: String, user_id: String) -> StoreResult<MessageFeedback> {
        self.run(move |db| db.message_feedback(&message_id, &user_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::init_tracing;

    fn service() -> ChatService {
        init_tracing();
        ChatService::open(&ServiceConfig::in_memory()).unwrap()
    }

    #[tokio::test]
    async fn group_lifecycle_through_the_facade() {
        let svc = service();
        let alice = svc.ensure_user("alice".into()).await.unwrap();
        let bob = svc.ensure_user("bob".into()).await.unwrap();
        svc.ensure_user("carol".into()).await.unwrap();

        let crew = svc
            .start_conversation(alice.id.clone(), vec![bob.id.clone()], "Crew".into(), true)
            .await
            .unwrap()
            .conversation_id;

        let added = svc
            .add_members(crew.clone(), alice.id.clone(), vec!["carol".into(), "ghost".into(), "bob".into()])
            .await
            .unwrap();
        assert_eq!(added.added_users, vec!["carol".to_string()]);
        assert_eq!(added.failed_users, vec!["ghost".to_string(), "bob".to_string()]);
        assert_eq!(added.member_count, 3);

        let msg = svc
            .add_message(crew.clone(), alice.id.clone(), MessageKind::Text, "hi".into(), "text/plain".into(), None)
            .await
            .unwrap();
        let update = svc
            .update_message_status(msg.id.clone(), bob.id.clone(), MessageStatus::Read)
            .await
            .unwrap();
        assert_eq!(update.status, MessageStatus::Delivered);

        let members = svc.group_members(crew.clone(), bob.id.clone()).await.unwrap();
        for member in &members {
            svc.leave_group(crew.clone(), member.user_id.clone()).await.unwrap();
        }
        assert!(svc.get_message(msg.id, alice.id).await.unwrap_err().is_not_found());
        assert!(svc.audit_memberships().await.unwrap().is_clean());
    }

    #[tokio::test]
    async fn concurrent_direct_starts_converge_on_one_conversation() {
        let svc = service();
        let alice = svc.ensure_user("alice".into()).await.unwrap();
        let bob = svc.ensure_user("bob".into()).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let svc = svc.clone();
            let (from, to) = if i % 2 == 0 {
                (alice.id.clone(), bob.id.clone())
            } else {
                (bob.id.clone(), alice.id.clone())
            };
            handles.push(tokio::spawn(async move {
                svc.start_conversation(from, vec![to], String::new(), false).await
            }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().unwrap().conversation_id);
        }
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(svc.get_user_conversations(alice.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn file_backed_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServiceConfig {
            db_path: dir.path().join("natter.db"),
            id_scheme: natter_db::IdScheme::Random,
        };

        let alice_id = {
            let svc = ChatService::open(&config).unwrap();
            let alice = svc.ensure_user("alice".into()).await.unwrap();
            assert!(alice.id.starts_with('u'));
            alice.id
        };

        let reopened = ChatService::open(&config).unwrap();
        assert_eq!(reopened.get_user(alice_id).await.unwrap().name, "alice");
    }

    #[tokio::test]
    async fn reactions_and_forwarding_through_the_facade() {
        let svc = service();
        let alice = svc.ensure_user("alice".into()).await.unwrap();
        let bob = svc.ensure_user("bob".into()).await.unwrap();
        let carol = svc.ensure_user("carol".into()).await.unwrap();

        let dm = svc
            .start_conversation(alice.id.clone(), vec![bob.id.clone()], String::new(), false)
            .await
            .unwrap()
            .conversation_id;
        let other = svc
            .start_conversation(bob.id.clone(), vec![carol.id.clone()], String::new(), false)
            .await
            .unwrap()
            .conversation_id;

        let photo = svc
            .add_photo_message(dm.clone(), alice.id.clone(), b"img".to_vec(), "image/png".into(), None)
            .await
            .unwrap();
        svc.add_comment(photo.id.clone(), bob.id.clone(), "👍".into()).await.unwrap();
        svc.react(photo.id.clone(), bob.id.clone(), "❤️".into()).await.unwrap();

        let feedback = svc.message_feedback(photo.id.clone(), alice.id.clone()).await.unwrap();
        assert_eq!(feedback.reactions.len(), 1);
        assert_eq!(feedback.reactions[0].emoji, "❤️");

        let fwd = svc
            .forward_message(photo.id.clone(), other.clone(), bob.id.clone())
            .await
            .unwrap();
        assert_eq!(fwd.kind, MessageKind::Photo);
        assert_eq!(fwd.content, photo.content);
        assert_eq!(fwd.forwarded.unwrap().original_sender_id, alice.id);

        let blob = svc.get_media(photo.content.clone()).await.unwrap();
        assert_eq!(blob.data, b"img");
    }
}
