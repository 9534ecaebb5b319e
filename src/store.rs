use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::conversation::ConversationRef;
use crate::error::ChatError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    #[serde(flatten)]
    pub conversation: ConversationRef,
    pub sender_id: String,
    pub body: String,
    pub seq: u64,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub edited: bool,
    pub deleted: bool,
}

impl Message {
    /// What other members get to see: deleted messages keep their slot in the
    /// history but lose their content.
    pub fn visible(&self) -> Message {
        let mut message = self.clone();
        if message.deleted {
            message.body.clear();
        }
        message
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    /// Return messages with `seq` strictly greater than this cursor.
    pub after: Option<u64>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    pub messages: Vec<Message>,
    pub next_cursor: Option<u64>,
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn create(
        &self,
        conversation: &ConversationRef,
        sender_id: &str,
        body: &str,
    ) -> Result<Message, ChatError>;

    async fn get(&self, message_id: Uuid) -> Result<Message, ChatError>;

    /// Oldest first.
    async fn list_by_conversation(
        &self,
        conversation: &ConversationRef,
        page: Page,
    ) -> Result<MessagePage, ChatError>;

    async fn update(
        &self,
        message_id: Uuid,
        editor_id: &str,
        new_body: &str,
    ) -> Result<Message, ChatError>;

    async fn soft_delete(&self, message_id: Uuid, actor_id: &str) -> Result<Message, ChatError>;

    async fn ping(&self) -> Result<(), ChatError> {
        Ok(())
    }
}

#[derive(Default)]
struct Shelves {
    conversations: HashMap<ConversationRef, Vec<Message>>,
    // message id -> (conversation, index into its Vec)
    index: HashMap<Uuid, (ConversationRef, usize)>,
}

impl Shelves {
    fn locate(&self, message_id: Uuid) -> Result<&Message, ChatError> {
        let (conversation, position) = self
            .index
            .get(&message_id)
            .ok_or_else(|| ChatError::NotFound(format!("message {message_id}")))?;
        self.conversations
            .get(conversation)
            .and_then(|messages| messages.get(*position))
            .ok_or_else(|| ChatError::NotFound(format!("message {message_id}")))
    }

    fn locate_mut(&mut self, message_id: Uuid) -> Result<&mut Message, ChatError> {
        let (conversation, position) = self
            .index
            .get(&message_id)
            .ok_or_else(|| ChatError::NotFound(format!("message {message_id}")))?;
        self.conversations
            .get_mut(conversation)
            .and_then(|messages| messages.get_mut(*position))
            .ok_or_else(|| ChatError::NotFound(format!("message {message_id}")))
    }
}

pub struct InMemoryMessageStore {
    shelves: RwLock<Shelves>,
    max_page_size: usize,
}

impl InMemoryMessageStore {
    pub fn new(max_page_size: usize) -> Self {
        InMemoryMessageStore {
            shelves: RwLock::new(Shelves::default()),
            max_page_size: max_page_size.max(1),
        }
    }
}

fn ensure_author(message: &Message, actor_id: &str, action: &str) -> Result<(), ChatError> {
    if message.sender_id != actor_id {
        return Err(ChatError::PermissionDenied(format!(
            "only the author can {action} this message"
        )));
    }
    Ok(())
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn create(
        &self,
        conversation: &ConversationRef,
        sender_id: &str,
        body: &str,
    ) -> Result<Message, ChatError> {
        let mut shelves = self.shelves.write().await;
        let messages = shelves
            .conversations
            .entry(conversation.clone())
            .or_default();

        let message = Message {
            id: Uuid::new_v4(),
            conversation: conversation.clone(),
            sender_id: sender_id.to_string(),
            body: body.to_string(),
            seq: messages.len() as u64 + 1,
            created_at: Utc::now(),
            edited_at: None,
            edited: false,
            deleted: false,
        };
        let position = messages.len();
        messages.push(message.clone());
        shelves
            .index
            .insert(message.id, (conversation.clone(), position));

        Ok(message)
    }

    async fn get(&self, message_id: Uuid) -> Result<Message, ChatError> {
        let shelves = self.shelves.read().await;
        shelves.locate(message_id).cloned()
    }

    async fn list_by_conversation(
        &self,
        conversation: &ConversationRef,
        page: Page,
    ) -> Result<MessagePage, ChatError> {
        let limit = page
            .limit
            .unwrap_or(self.max_page_size)
            .clamp(1, self.max_page_size);
        let shelves = self.shelves.read().await;
        let Some(messages) = shelves.conversations.get(conversation) else {
            return Ok(MessagePage {
                messages: Vec::new(),
                next_cursor: None,
            });
        };

        // seq is 1-based and dense, so it doubles as an offset.
        let start = usize::try_from(page.after.unwrap_or(0))
            .unwrap_or(usize::MAX)
            .min(messages.len());
        let end = start.saturating_add(limit).min(messages.len());
        let slice: Vec<Message> = messages[start..end].iter().map(Message::visible).collect();
        let next_cursor = if end < messages.len() {
            slice.last().map(|message| message.seq)
        } else {
            None
        };

        Ok(MessagePage {
            messages: slice,
            next_cursor,
        })
    }

    async fn update(
        &self,
        message_id: Uuid,
        editor_id: &str,
        new_body: &str,
    ) -> Result<Message, ChatError> {
        let mut shelves = self.shelves.write().await;
        let message = shelves.locate_mut(message_id)?;
        ensure_author(message, editor_id, "edit")?;
        if message.deleted {
            return Err(ChatError::InvalidRequest(
                "cannot edit a deleted message".to_string(),
            ));
        }
        message.body = new_body.to_string();
        message.edited = true;
        message.edited_at = Some(Utc::now());
        Ok(message.clone())
    }

    async fn soft_delete(&self, message_id: Uuid, actor_id: &str) -> Result<Message, ChatError> {
        let mut shelves = self.shelves.write().await;
        let message = shelves.locate_mut(message_id)?;
        ensure_author(message, actor_id, "delete")?;
        message.deleted = true;
        Ok(message.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn g1() -> ConversationRef {
        ConversationRef::group("g1")
    }

    #[tokio::test]
    async fn create_assigns_increasing_sequence() {
        let store = InMemoryMessageStore::new(50);
        let first = store.create(&g1(), "u1", "hello").await.unwrap();
        let second = store.create(&g1(), "u2", "hi").await.unwrap();
        let other = store
            .create(&ConversationRef::direct("d1"), "u1", "psst")
            .await
            .unwrap();

        assert_eq!((first.seq, second.seq, other.seq), (1, 2, 1));
        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn lists_oldest_first_with_cursor() {
        let store = InMemoryMessageStore::new(2);
        for body in ["a", "b", "c"] {
            store.create(&g1(), "u1", body).await.unwrap();
        }

        let first = store.list_by_conversation(&g1(), Page::default()).await.unwrap();
        let bodies: Vec<_> = first.messages.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["a", "b"]);
        assert_eq!(first.next_cursor, Some(2));

        let rest = store
            .list_by_conversation(
                &g1(),
                Page {
                    after: first.next_cursor,
                    limit: Some(10),
                },
            )
            .await
            .unwrap();
        assert_eq!(rest.messages.len(), 1);
        assert_eq!(rest.messages[0].body, "c");
        assert_eq!(rest.next_cursor, None);
    }

    #[tokio::test]
    async fn unknown_conversation_is_empty() {
        let store = InMemoryMessageStore::new(10);
        let page = store
            .list_by_conversation(&ConversationRef::group("nope"), Page::default())
            .await
            .unwrap();
        assert!(page.messages.is_empty());
    }

    #[tokio::test]
    async fn only_author_can_edit() {
        let store = InMemoryMessageStore::new(10);
        let message = store.create(&g1(), "u1", "draft").await.unwrap();

        let err = store.update(message.id, "u2", "hijack").await.unwrap_err();
        assert_eq!(err.code(), "permission_denied");

        let edited = store.update(message.id, "u1", "final").await.unwrap();
        assert!(edited.edited);
        assert!(edited.edited_at.is_some());
        assert_eq!(store.get(message.id).await.unwrap().body, "final");
    }

    #[tokio::test]
    async fn soft_delete_keeps_slot_and_hides_body() {
        let store = InMemoryMessageStore::new(10);
        let message = store.create(&g1(), "u1", "oops").await.unwrap();

        let err = store.soft_delete(message.id, "u2").await.unwrap_err();
        assert_eq!(err.code(), "permission_denied");

        store.soft_delete(message.id, "u1").await.unwrap();
        // deleting twice is harmless
        store.soft_delete(message.id, "u1").await.unwrap();

        let page = store.list_by_conversation(&g1(), Page::default()).await.unwrap();
        assert_eq!(page.messages.len(), 1);
        assert!(page.messages[0].deleted);
        assert_eq!(page.messages[0].body, "");

        let err = store.update(message.id, "u1", "revive").await.unwrap_err();
        assert_eq!(err.code(), "invalid_request");
    }

    #[tokio::test]
    async fn missing_message_is_not_found() {
        let store = InMemoryMessageStore::new(10);
        let err = store.get(Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.code(), "not_found");
    }
}
