use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Comment, Conversation, Message, MessageKind, MessageStatus, Participant, Reaction};

// -- Conversations --

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartConversationResult {
    pub conversation_id: String,
    /// False when an existing direct conversation was returned.
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastMessage {
    pub message_id: String,
    pub sender_id: String,
    pub kind: MessageKind,
    pub content: String,
    pub sent_at: DateTime<Utc>,
}

/// One row of a user's conversation list. `title` and `photo_id` are the
/// other participant's name and avatar for direct conversations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: String,
    pub title: String,
    pub is_group: bool,
    pub photo_id: Option<String>,
    pub member_count: usize,
    pub last_message: Option<LastMessage>,
    pub created_at: DateTime<Utc>,
}

/// Position in a newest-first message listing: the oldest message already
/// returned. Messages sharing its timestamp are ordered by insertion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageCursor {
    pub created_at: DateTime<Utc>,
    pub message_id: String,
}

impl MessageCursor {
    pub fn after(message: &Message) -> Self {
        Self {
            created_at: message.created_at,
            message_id: message.id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageThread {
    pub message: Message,
    pub comments: Vec<Comment>,
    pub reactions: Vec<Reaction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationDetails {
    pub conversation: Conversation,
    pub participants: Vec<Participant>,
    pub messages: Vec<MessageThread>,
}

// -- Groups --

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddMembersResult {
    pub added_users: Vec<String>,
    pub failed_users: Vec<String>,
    pub member_count: usize,
}

impl AddMembersResult {
    pub fn added_count(&self) -> usize {
        self.added_users.len()
    }

    pub fn failed_count(&self) -> usize {
        self.failed_users.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaveGroupResult {
    pub remaining_member_count: usize,
    pub is_group_deleted: bool,
}

/// Outcome of a membership audit. Anomalies are reported, never repaired.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipAudit {
    pub conversations_checked: usize,
    pub empty_conversations: Vec<String>,
    pub malformed_direct: Vec<String>,
}

impl MembershipAudit {
    pub fn is_clean(&self) -> bool {
        self.empty_conversations.is_empty() && self.malformed_direct.is_empty()
    }
}

// -- Status --

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub message_id: String,
    pub status: MessageStatus,
    pub read_count: u32,
    /// Reads needed before the message counts as read (participants minus sender).
    pub required_reads: u32,
}

// -- Reactions / comments --

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Feedback {
    Reaction { reaction: Reaction, replaced: bool },
    Comment { comment: Comment },
}

impl Feedback {
    pub fn id(&self) -> &str {
        match self {
            Self::Reaction { reaction, .. } => &reaction.id,
            Self::Comment { comment } => &comment.id,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageFeedback {
    pub comments: Vec<Comment>,
    pub reactions: Vec<Reaction>,
}
