use std::collections::{HashMap, HashSet};
use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::conversation::{ConversationRef, ConversationType};
use crate::error::ChatError;

/// Answers "may this user see this conversation?". Consulted on every join,
/// send, edit, delete and history read.
#[async_trait]
pub trait MembershipDirectory: Send + Sync {
    async fn is_member(
        &self,
        user_id: &str,
        conversation: &ConversationRef,
    ) -> Result<bool, ChatError>;

    async fn ping(&self) -> Result<(), ChatError> {
        Ok(())
    }
}

/// Seed file layout: `{"groups": {"g1": ["u1"]}, "directs": {"d1": ["u1", "u2"]}}`.
#[derive(Debug, Default, Deserialize)]
pub struct DirectorySeed {
    #[serde(default)]
    pub groups: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub directs: HashMap<String, (String, String)>,
}

#[derive(Default)]
struct Rosters {
    groups: HashMap<String, HashSet<String>>,
    directs: HashMap<String, (String, String)>,
}

#[derive(Default)]
pub struct InMemoryDirectory {
    rosters: RwLock<Rosters>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seed(seed: DirectorySeed) -> Self {
        let groups = seed
            .groups
            .into_iter()
            .map(|(id, members)| (id, members.into_iter().collect()))
            .collect();
        InMemoryDirectory {
            rosters: RwLock::new(Rosters {
                groups,
                directs: seed.directs,
            }),
        }
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ChatError> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            ChatError::Config(format!("cannot read membership file {}: {e}", path.display()))
        })?;
        let seed: DirectorySeed = serde_json::from_str(&raw)?;
        log::info!(
            "Loaded {} groups and {} direct threads from {}",
            seed.groups.len(),
            seed.directs.len(),
            path.display()
        );
        Ok(Self::from_seed(seed))
    }

    pub async fn add_group_member(&self, group_id: &str, user_id: &str) {
        let mut rosters = self.rosters.write().await;
        rosters
            .groups
            .entry(group_id.to_string())
            .or_default()
            .insert(user_id.to_string());
    }

    pub async fn remove_group_member(&self, group_id: &str, user_id: &str) {
        let mut rosters = self.rosters.write().await;
        if let Some(members) = rosters.groups.get_mut(group_id) {
            members.remove(user_id);
        }
    }

    /// Returns the existing thread between the two users, or opens a new one.
    pub async fn open_direct(&self, user_a: &str, user_b: &str) -> ConversationRef {
        let mut rosters = self.rosters.write().await;
        let existing = rosters.directs.iter().find(|(_, (a, b))| {
            (a == user_a && b == user_b) || (a == user_b && b == user_a)
        });
        if let Some((id, _)) = existing {
            return ConversationRef::direct(id.clone());
        }

        let id = Uuid::new_v4().to_string();
        rosters
            .directs
            .insert(id.clone(), (user_a.to_string(), user_b.to_string()));
        ConversationRef::direct(id)
    }
}

#[async_trait]
impl MembershipDirectory for InMemoryDirectory {
    async fn is_member(
        &self,
        user_id: &str,
        conversation: &ConversationRef,
    ) -> Result<bool, ChatError> {
        let rosters = self.rosters.read().await;
        let id = conversation.conversation_id.as_str();
        let member = match conversation.conversation_type {
            ConversationType::Group => rosters
                .groups
                .get(id)
                .is_some_and(|members| members.contains(user_id)),
            ConversationType::Direct => rosters
                .directs
                .get(id)
                .is_some_and(|(a, b)| a == user_id || b == user_id),
        };
        Ok(member)
    }
}

/// Fails with a specific "not a member" error rather than a bare `false`.
pub async fn require_member(
    directory: &dyn MembershipDirectory,
    user_id: &str,
    conversation: &ConversationRef,
) -> Result<(), ChatError> {
    if directory.is_member(user_id, conversation).await? {
        Ok(())
    } else {
        Err(ChatError::NotAMember(conversation.room_name()))
    }
}
