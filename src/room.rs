use std::collections::HashMap;
use std::sync::{Arc, Weak};

use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::auth::Identity;
use crate::conversation::ConversationRef;

pub type ConnectionId = Uuid;

/// Live subscribers of one conversation. Exists only while someone is in it.
#[derive(Clone)]
pub struct Room {
    pub conversation: ConversationRef,
    participants: HashMap<ConnectionId, Identity>,
}

impl Room {
    fn new(conversation: ConversationRef) -> Self {
        Room {
            conversation,
            participants: HashMap::new(),
        }
    }

    pub fn participants(&self) -> impl Iterator<Item = (ConnectionId, &Identity)> {
        self.participants.iter().map(|(id, identity)| (*id, identity))
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.participants.keys().copied().collect()
    }

    /// Distinct users present, one entry even if a user has several tabs open.
    pub fn user_ids(&self) -> Vec<String> {
        let mut users: Vec<String> = self
            .participants
            .values()
            .map(|identity| identity.user_id.clone())
            .collect();
        users.sort();
        users.dedup();
        users
    }
}

#[derive(Default)]
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Room>>,
    // Per-conversation lock held across persist + fan-out so every member sees
    // room events in store order. Entries die with the last outstanding turn.
    sequencers: Mutex<HashMap<ConversationRef, Weak<Mutex<()>>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the connection was already in the room.
    pub async fn join(
        &self,
        conversation: &ConversationRef,
        connection_id: ConnectionId,
        identity: Identity,
    ) -> bool {
        let mut rooms = self.rooms.write().await;
        let room = rooms
            .entry(conversation.room_name())
            .or_insert_with(|| Room::new(conversation.clone()));
        room.participants.insert(connection_id, identity).is_none()
    }

    pub async fn leave(
        &self,
        conversation: &ConversationRef,
        connection_id: ConnectionId,
    ) -> Option<Identity> {
        let mut rooms = self.rooms.write().await;
        let name = conversation.room_name();
        let room = rooms.get_mut(&name)?;
        let identity = room.participants.remove(&connection_id);
        if room.participants.is_empty() {
            rooms.remove(&name);
        }
        identity
    }

    /// Drops the connection from every room it was in; used on disconnect.
    pub async fn leave_all(&self, connection_id: ConnectionId) -> Vec<(ConversationRef, Identity)> {
        let mut rooms = self.rooms.write().await;
        let mut left = Vec::new();
        rooms.retain(|_, room| {
            if let Some(identity) = room.participants.remove(&connection_id) {
                left.push((room.conversation.clone(), identity));
            }
            !room.participants.is_empty()
        });
        left
    }

    pub async fn contains(&self, conversation: &ConversationRef, connection_id: ConnectionId) -> bool {
        let rooms = self.rooms.read().await;
        rooms
            .get(&conversation.room_name())
            .is_some_and(|room| room.participants.contains_key(&connection_id))
    }

    pub async fn get(&self, conversation: &ConversationRef) -> Option<Room> {
        let rooms = self.rooms.read().await;
        rooms.get(&conversation.room_name()).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn sequencer(&self, conversation: &ConversationRef) -> Arc<Mutex<()>> {
        let mut sequencers = self.sequencers.lock().await;
        if let Some(live) = sequencers.get(conversation).and_then(Weak::upgrade) {
            return live;
        }
        sequencers.retain(|_, sequencer| sequencer.strong_count() > 0);
        let sequencer = Arc::new(Mutex::new(()));
        sequencers.insert(conversation.clone(), Arc::downgrade(&sequencer));
        sequencer
    }
}
