use std::collections::HashMap;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use uuid::Uuid;
use warp::ws::{Message as Frame, WebSocket};

use crate::auth::{Identity, TokenAuthority};
use crate::config::ServerConfig;
use crate::conversation::ConversationRef;
use crate::error::ChatError;
use crate::membership::{require_member, MembershipDirectory};
use crate::messages::{ClientEvent, ServerEvent};
use crate::room::{ConnectionId, RoomRegistry};
use crate::store::{MessagePage, MessageStore, Page};

struct Session {
    identity: Identity,
    tx: mpsc::UnboundedSender<Frame>,
}

type Connections = Arc<RwLock<HashMap<ConnectionId, Session>>>;

/// The room router: owns live sessions and room membership, and is the only
/// path by which messages reach the store and get fanned out.
#[derive(Clone)]
pub struct Server {
    rooms: Arc<RoomRegistry>,
    connections: Connections,
    store: Arc<dyn MessageStore>,
    directory: Arc<dyn MembershipDirectory>,
    tokens: Arc<TokenAuthority>,
    max_message_len: usize,
}

impl Server {
    pub fn new(
        config: &ServerConfig,
        store: Arc<dyn MessageStore>,
        directory: Arc<dyn MembershipDirectory>,
    ) -> Self {
        Server {
            rooms: Arc::new(RoomRegistry::new()),
            connections: Arc::new(RwLock::new(HashMap::new())),
            store,
            directory,
            tokens: Arc::new(TokenAuthority::new(config.token_secret.clone())),
            max_message_len: config.max_message_len,
        }
    }

    pub fn tokens(&self) -> &TokenAuthority {
        &self.tokens
    }

    pub fn store(&self) -> &dyn MessageStore {
        self.store.as_ref()
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Runs one authenticated socket until the peer goes away.
    pub async fn handle_connection(&self, ws: WebSocket, identity: Identity) {
        let (mut ws_tx, mut ws_rx) = ws.split();
        let (connection_id, mut rx) = self.register(identity.clone()).await;

        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = ws_tx.send(frame).await {
                    log::warn!("Failed to write to connection {connection_id}: {e}");
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        while let Some(result) = ws_rx.next().await {
            match result {
                Ok(frame) if frame.is_close() => break,
                Ok(frame) => {
                    if let Ok(text) = frame.to_str() {
                        self.handle_frame(connection_id, &identity, text).await;
                    }
                }
                Err(e) => {
                    log::warn!("WebSocket error on connection {connection_id}: {e}");
                    break;
                }
            }
        }

        self.disconnect(connection_id).await;
    }

    /// Creates the session for an already authenticated user and greets it.
    pub async fn register(
        &self,
        identity: Identity,
    ) -> (ConnectionId, mpsc::UnboundedReceiver<Frame>) {
        let connection_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        log::info!(
            "Connection {connection_id} authenticated as {} ({})",
            identity.user_id,
            identity.label
        );

        let greeting = ServerEvent::Connected {
            connection_id,
            user_id: identity.user_id.clone(),
        };
        if let Ok(text) = serde_json::to_string(&greeting) {
            let _ = tx.send(Frame::text(text));
        }

        self.connections
            .write()
            .await
            .insert(connection_id, Session { identity, tx });
        (connection_id, rx)
    }

    pub async fn handle_frame(&self, connection_id: ConnectionId, identity: &Identity, text: &str) {
        let event = match serde_json::from_str::<ClientEvent>(text) {
            Ok(event) => event,
            Err(e) => {
                log::debug!("Unparseable frame from {connection_id}: {e}");
                let err = ChatError::InvalidRequest(format!("unrecognised frame: {e}"));
                self.send_to_connection(connection_id, &ServerEvent::from_error(&err, None))
                    .await;
                return;
            }
        };

        let request_id = event.request_id().map(str::to_string);
        if let Err(err) = self.dispatch(connection_id, identity, event).await {
            log::info!(
                "Rejected request from {} on {connection_id}: {err}",
                identity.user_id
            );
            self.send_to_connection(
                connection_id,
                &ServerEvent::from_error(&err, request_id.as_deref()),
            )
            .await;
        }
    }

    async fn dispatch(
        &self,
        connection_id: ConnectionId,
        identity: &Identity,
        event: ClientEvent,
    ) -> Result<(), ChatError> {
        match event {
            ClientEvent::JoinConversation {
                conversation,
                request_id,
            } => {
                conversation.validate()?;
                // Never trust an earlier join: membership can change under us.
                self.check_member(connection_id, identity, &conversation).await?;

                let fresh = self
                    .rooms
                    .join(&conversation, connection_id, identity.clone())
                    .await;
                log::debug!("{} joined {conversation}", identity.user_id);

                self.send_to_connection(
                    connection_id,
                    &ServerEvent::ConversationJoined {
                        conversation: conversation.clone(),
                        request_id,
                    },
                )
                .await;
                if fresh {
                    self.broadcast_to_room_except(
                        &conversation,
                        &ServerEvent::UserJoined {
                            conversation: conversation.clone(),
                            user_id: identity.user_id.clone(),
                            label: identity.label.clone(),
                        },
                        Some(connection_id),
                    )
                    .await;
                }
            }

            ClientEvent::LeaveConversation {
                conversation,
                request_id,
            } => {
                if let Some(left) = self.rooms.leave(&conversation, connection_id).await {
                    log::debug!("{} left {conversation}", left.user_id);
                    self.broadcast_to_room(
                        &conversation,
                        &ServerEvent::UserLeft {
                            conversation: conversation.clone(),
                            user_id: left.user_id,
                        },
                    )
                    .await;
                }
                self.send_to_connection(
                    connection_id,
                    &ServerEvent::ConversationLeft {
                        conversation,
                        request_id,
                    },
                )
                .await;
            }

            ClientEvent::GetMembers {
                conversation,
                request_id,
            } => {
                conversation.validate()?;
                self.check_member(connection_id, identity, &conversation).await?;
                let user_ids = self
                    .rooms
                    .get(&conversation)
                    .await
                    .map(|room| room.user_ids())
                    .unwrap_or_default();
                self.send_to_connection(
                    connection_id,
                    &ServerEvent::MemberList {
                        conversation,
                        user_ids,
                        request_id,
                    },
                )
                .await;
            }

            ClientEvent::SendMessage {
                conversation,
                body,
                request_id,
            } => {
                conversation.validate()?;
                let body = self.validate_body(&body)?;
                self.check_member(connection_id, identity, &conversation).await?;

                let sequencer = self.rooms.sequencer(&conversation).await;
                let _turn = sequencer.lock().await;
                let message = self
                    .store
                    .create(&conversation, &identity.user_id, body)
                    .await?;
                log::debug!("Stored message {} in {conversation}", message.id);

                let event = ServerEvent::MessageNew {
                    message: message.visible(),
                    request_id,
                };
                self.broadcast_to_room(&conversation, &event).await;
                // The sender always gets the stored copy back, joined or not.
                if !self.rooms.contains(&conversation, connection_id).await {
                    self.send_to_connection(connection_id, &event).await;
                }
            }

            ClientEvent::EditMessage {
                message_id,
                body,
                request_id,
            } => {
                let body = self.validate_body(&body)?;
                let existing = self.store.get(message_id).await?;
                if existing.sender_id != identity.user_id {
                    return Err(ChatError::PermissionDenied(
                        "only the author can edit this message".to_string(),
                    ));
                }
                let conversation = existing.conversation;
                self.check_member(connection_id, identity, &conversation).await?;

                let sequencer = self.rooms.sequencer(&conversation).await;
                let _turn = sequencer.lock().await;
                let message = self
                    .store
                    .update(message_id, &identity.user_id, body)
                    .await?;

                let event = ServerEvent::MessageEdited {
                    message: message.visible(),
                    request_id,
                };
                self.broadcast_to_room(&conversation, &event).await;
                if !self.rooms.contains(&conversation, connection_id).await {
                    self.send_to_connection(connection_id, &event).await;
                }
            }

            ClientEvent::DeleteMessage {
                message_id,
                request_id,
            } => {
                let existing = self.store.get(message_id).await?;
                if existing.sender_id != identity.user_id {
                    return Err(ChatError::PermissionDenied(
                        "only the author can delete this message".to_string(),
                    ));
                }
                let conversation = existing.conversation;
                self.check_member(connection_id, identity, &conversation).await?;

                let sequencer = self.rooms.sequencer(&conversation).await;
                let _turn = sequencer.lock().await;
                let message = self
                    .store
                    .soft_delete(message_id, &identity.user_id)
                    .await?;

                let event = ServerEvent::MessageDeleted {
                    message: message.visible(),
                    request_id,
                };
                self.broadcast_to_room(&conversation, &event).await;
                if !self.rooms.contains(&conversation, connection_id).await {
                    self.send_to_connection(connection_id, &event).await;
                }
            }

            ClientEvent::StartTyping { conversation } => {
                self.check_member(connection_id, identity, &conversation).await?;
                self.require_joined(&conversation, connection_id).await?;
                self.broadcast_to_room_except(
                    &conversation,
                    &ServerEvent::TypingStarted {
                        conversation: conversation.clone(),
                        user_id: identity.user_id.clone(),
                    },
                    Some(connection_id),
                )
                .await;
            }

            ClientEvent::StopTyping { conversation } => {
                self.check_member(connection_id, identity, &conversation).await?;
                self.require_joined(&conversation, connection_id).await?;
                self.broadcast_to_room_except(
                    &conversation,
                    &ServerEvent::TypingStopped {
                        conversation: conversation.clone(),
                        user_id: identity.user_id.clone(),
                    },
                    Some(connection_id),
                )
                .await;
            }
        }

        Ok(())
    }

    fn validate_body<'a>(&self, body: &'a str) -> Result<&'a str, ChatError> {
        let trimmed = body.trim();
        if trimmed.is_empty() {
            return Err(ChatError::InvalidRequest(
                "message body must not be empty".to_string(),
            ));
        }
        if trimmed.chars().count() > self.max_message_len {
            return Err(ChatError::InvalidRequest(format!(
                "message body exceeds {} characters",
                self.max_message_len
            )));
        }
        Ok(trimmed)
    }

    /// Membership check that also drops the connection from the room when the
    /// user has been taken off the roster since joining.
    async fn check_member(
        &self,
        connection_id: ConnectionId,
        identity: &Identity,
        conversation: &ConversationRef,
    ) -> Result<(), ChatError> {
        let checked = require_member(self.directory.as_ref(), &identity.user_id, conversation).await;
        if matches!(checked, Err(ChatError::NotAMember(_))) {
            if let Some(evicted) = self.rooms.leave(conversation, connection_id).await {
                let remaining = self
                    .rooms
                    .get(conversation)
                    .await
                    .map(|room| room.connection_ids())
                    .unwrap_or_default();
                self.announce_eviction(conversation, connection_id, evicted, &remaining)
                    .await;
            }
        }
        checked
    }

    async fn announce_eviction(
        &self,
        conversation: &ConversationRef,
        connection_id: ConnectionId,
        evicted: Identity,
        remaining: &[ConnectionId],
    ) {
        log::info!(
            "Removed {} from {conversation}: no longer a member",
            evicted.user_id
        );
        self.send_to_connection(
            connection_id,
            &ServerEvent::ConversationLeft {
                conversation: conversation.clone(),
                request_id: None,
            },
        )
        .await;
        self.deliver(
            remaining,
            &ServerEvent::UserLeft {
                conversation: conversation.clone(),
                user_id: evicted.user_id,
            },
        )
        .await;
    }

    /// Connections in the room whose user is still on the roster. Anyone who
    /// was taken off since joining is evicted here, before the event goes out.
    async fn audience(&self, conversation: &ConversationRef) -> Vec<ConnectionId> {
        let Some(room) = self.rooms.get(conversation).await else {
            return Vec::new();
        };

        let mut verdicts: HashMap<String, bool> = HashMap::new();
        let mut audience = Vec::new();
        let mut stale = Vec::new();
        for (connection_id, identity) in room.participants() {
            let member = match verdicts.get(&identity.user_id) {
                Some(member) => *member,
                None => {
                    let member = match self
                        .directory
                        .is_member(&identity.user_id, conversation)
                        .await
                    {
                        Ok(member) => Some(member),
                        Err(e) => {
                            log::warn!("Membership lookup for {} failed: {e}", identity.user_id);
                            None
                        }
                    };
                    // A failed lookup withholds delivery without evicting.
                    let Some(member) = member else { continue };
                    verdicts.insert(identity.user_id.clone(), member);
                    member
                }
            };
            if member {
                audience.push(connection_id);
            } else {
                stale.push(connection_id);
            }
        }

        let mut evicted = Vec::new();
        for connection_id in stale {
            if let Some(identity) = self.rooms.leave(conversation, connection_id).await {
                evicted.push((connection_id, identity));
            }
        }
        for (connection_id, identity) in evicted {
            self.announce_eviction(conversation, connection_id, identity, &audience)
                .await;
        }
        audience
    }

    async fn require_joined(
        &self,
        conversation: &ConversationRef,
        connection_id: ConnectionId,
    ) -> Result<(), ChatError> {
        if self.rooms.contains(conversation, connection_id).await {
            Ok(())
        } else {
            Err(ChatError::InvalidRequest(format!(
                "join {conversation} before sending typing updates"
            )))
        }
    }

    /// Leaves every room and drops the session.
    pub async fn disconnect(&self, connection_id: ConnectionId) {
        for (conversation, identity) in self.rooms.leave_all(connection_id).await {
            self.broadcast_to_room(
                &conversation,
                &ServerEvent::UserLeft {
                    conversation: conversation.clone(),
                    user_id: identity.user_id,
                },
            )
            .await;
        }

        let removed = self.connections.write().await.remove(&connection_id);
        if let Some(session) = removed {
            log::info!(
                "Connection {connection_id} for {} closed",
                session.identity.user_id
            );
        }
    }

    /// Closes every live session of `user_id`, e.g. after the account signed
    /// out elsewhere. Returns how many sessions were closed.
    pub async fn sign_out(&self, user_id: &str) -> usize {
        let sessions: Vec<ConnectionId> = self
            .connections
            .read()
            .await
            .iter()
            .filter(|(_, session)| session.identity.user_id == user_id)
            .map(|(connection_id, _)| *connection_id)
            .collect();
        for connection_id in &sessions {
            self.disconnect(*connection_id).await;
        }
        sessions.len()
    }

    /// Conversation history, for members only.
    pub async fn history(
        &self,
        identity: &Identity,
        conversation: &ConversationRef,
        page: Page,
    ) -> Result<MessagePage, ChatError> {
        conversation.validate()?;
        require_member(self.directory.as_ref(), &identity.user_id, conversation).await?;
        self.store.list_by_conversation(conversation, page).await
    }

    /// Per-dependency readiness: (message store, membership directory).
    pub async fn readiness(&self) -> (bool, bool) {
        let store = self.store.ping().await.is_ok();
        let directory = self.directory.ping().await.is_ok();
        (store, directory)
    }

    async fn broadcast_to_room(&self, conversation: &ConversationRef, event: &ServerEvent) {
        self.broadcast_to_room_except(conversation, event, None).await;
    }

    async fn broadcast_to_room_except(
        &self,
        conversation: &ConversationRef,
        event: &ServerEvent,
        except_connection: Option<ConnectionId>,
    ) {
        let mut targets = self.audience(conversation).await;
        targets.retain(|connection_id| Some(*connection_id) != except_connection);
        self.deliver(&targets, event).await;
    }

    async fn deliver(&self, targets: &[ConnectionId], event: &ServerEvent) {
        if targets.is_empty() {
            return;
        }
        let text = match serde_json::to_string(event) {
            Ok(text) => text,
            Err(e) => {
                log::error!("Failed to serialize {} event: {e}", event.name());
                return;
            }
        };

        let connections = self.connections.read().await;
        for connection_id in targets {
            if let Some(session) = connections.get(connection_id) {
                let _ = session.tx.send(Frame::text(text.clone()));
            }
        }
    }

    async fn send_to_connection(&self, connection_id: ConnectionId, event: &ServerEvent) {
        match serde_json::to_string(event) {
            Ok(text) => {
                let connections = self.connections.read().await;
                if let Some(session) = connections.get(&connection_id) {
                    let _ = session.tx.send(Frame::text(text));
                }
            }
            Err(e) => log::error!("Failed to serialize {} event: {e}", event.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::InMemoryDirectory;
    use crate::store::InMemoryMessageStore;
    use serde_json::json;

    struct Harness {
        server: Server,
        directory: Arc<InMemoryDirectory>,
    }

    async fn harness() -> Harness {
        let directory = Arc::new(InMemoryDirectory::new());
        directory.add_group_member("g1", "alice").await;
        directory.add_group_member("g1", "bob").await;
        let server = Server::new(
            &ServerConfig::with_secret("test"),
            Arc::new(InMemoryMessageStore::new(50)),
            directory.clone(),
        );
        Harness { server, directory }
    }

    fn identity(user: &str) -> Identity {
        Identity {
            user_id: user.to_string(),
            label: format!("{user}@collabry.dev"),
        }
    }

    struct Peer {
        id: ConnectionId,
        identity: Identity,
        rx: mpsc::UnboundedReceiver<Frame>,
    }

    impl Peer {
        async fn connect(server: &Server, user: &str) -> Peer {
            let identity = identity(user);
            let (id, mut rx) = server.register(identity.clone()).await;
            let greeting = next_event(&mut rx);
            assert_eq!(greeting.name(), ServerEvent::CONNECTED);
            Peer { id, identity, rx }
        }

        async fn emit(&self, server: &Server, frame: serde_json::Value) {
            server
                .handle_frame(self.id, &self.identity, &frame.to_string())
                .await;
        }

        fn next(&mut self) -> ServerEvent {
            next_event(&mut self.rx)
        }

        fn assert_idle(&mut self) {
            assert!(self.rx.try_recv().is_err(), "unexpected frame queued");
        }
    }

    fn next_event(rx: &mut mpsc::UnboundedReceiver<Frame>) -> ServerEvent {
        let frame = rx.try_recv().expect("expected a queued frame");
        serde_json::from_str(frame.to_str().unwrap()).unwrap()
    }

    fn join(room: &str) -> serde_json::Value {
        json!({"event": "join:conversation", "data": {"conversationType": "group", "conversationId": room}})
    }

    #[tokio::test]
    async fn message_reaches_every_room_member_including_sender() {
        let h = harness().await;
        let mut alice = Peer::connect(&h.server, "alice").await;
        let mut bob = Peer::connect(&h.server, "bob").await;

        alice.emit(&h.server, join("g1")).await;
        assert_eq!(alice.next().name(), ServerEvent::CONVERSATION_JOINED);
        bob.emit(&h.server, join("g1")).await;
        assert_eq!(bob.next().name(), ServerEvent::CONVERSATION_JOINED);
        assert_eq!(alice.next().name(), ServerEvent::USER_JOINED);

        alice
            .emit(
                &h.server,
                json!({"event": "message:send", "data": {"conversationType": "group", "conversationId": "g1", "body": "hello", "requestId": "r1"}}),
            )
            .await;

        let ServerEvent::MessageNew { message, request_id } = alice.next() else {
            panic!("expected message:new for sender");
        };
        assert_eq!(request_id.as_deref(), Some("r1"));
        let ServerEvent::MessageNew { message: seen_by_bob, .. } = bob.next() else {
            panic!("expected message:new for bob");
        };
        assert_eq!(message.id, seen_by_bob.id);

        let history = h
            .server
            .history(&alice.identity, &ConversationRef::group("g1"), Page::default())
            .await
            .unwrap();
        assert_eq!(history.messages.len(), 1);
        assert_eq!(history.messages[0].id, message.id);
        assert_eq!(history.messages[0].body, "hello");
    }

    #[tokio::test]
    async fn non_member_join_is_rejected_and_gets_no_broadcasts() {
        let h = harness().await;
        let mut alice = Peer::connect(&h.server, "alice").await;
        let mut carol = Peer::connect(&h.server, "carol").await;

        alice.emit(&h.server, join("g1")).await;
        alice.next();

        carol.emit(&h.server, join("g1")).await;
        let ServerEvent::Error { code, .. } = carol.next() else {
            panic!("expected an error for carol");
        };
        assert_eq!(code, "not_a_member");

        alice
            .emit(
                &h.server,
                json!({"event": "message:send", "data": {"conversationType": "group", "conversationId": "g1", "body": "secret"}}),
            )
            .await;
        alice.next();
        carol.assert_idle();
    }

    #[tokio::test]
    async fn membership_is_rechecked_on_every_join() {
        let h = harness().await;
        let mut bob = Peer::connect(&h.server, "bob").await;

        bob.emit(&h.server, join("g1")).await;
        assert_eq!(bob.next().name(), ServerEvent::CONVERSATION_JOINED);

        h.directory.remove_group_member("g1", "bob").await;
        bob.emit(&h.server, join("g1")).await;
        assert_eq!(bob.next().name(), ServerEvent::CONVERSATION_LEFT);
        let ServerEvent::Error { code, .. } = bob.next() else {
            panic!("expected rejection after removal");
        };
        assert_eq!(code, "not_a_member");
        assert!(
            !h.server
                .rooms
                .contains(&ConversationRef::group("g1"), bob.id)
                .await
        );
    }

    #[tokio::test]
    async fn removed_member_stops_receiving_room_events() {
        let h = harness().await;
        let g1 = ConversationRef::group("g1");
        let mut alice = Peer::connect(&h.server, "alice").await;
        let mut bob = Peer::connect(&h.server, "bob").await;
        alice.emit(&h.server, join("g1")).await;
        alice.next();
        bob.emit(&h.server, join("g1")).await;
        bob.next();
        alice.next();

        h.directory.remove_group_member("g1", "bob").await;
        alice
            .emit(
                &h.server,
                json!({"event": "message:send", "data": {"conversationType": "group", "conversationId": "g1", "body": "after removal"}}),
            )
            .await;

        assert_eq!(bob.next().name(), ServerEvent::CONVERSATION_LEFT);
        bob.assert_idle();
        let ServerEvent::UserLeft { user_id, .. } = alice.next() else {
            panic!("expected user:left for bob");
        };
        assert_eq!(user_id, "bob");
        let ServerEvent::MessageNew { message, .. } = alice.next() else {
            panic!("expected message:new");
        };
        assert_eq!(message.body, "after removal");
        assert!(!h.server.rooms.contains(&g1, bob.id).await);

        bob.emit(
            &h.server,
            json!({"event": "typing:start", "data": {"conversationType": "group", "conversationId": "g1"}}),
        )
        .await;
        let ServerEvent::Error { code, .. } = bob.next() else {
            panic!("expected not_a_member");
        };
        assert_eq!(code, "not_a_member");
        alice.assert_idle();
    }

    #[tokio::test]
    async fn removed_member_cannot_type_into_room() {
        let h = harness().await;
        let mut alice = Peer::connect(&h.server, "alice").await;
        let mut bob = Peer::connect(&h.server, "bob").await;
        alice.emit(&h.server, join("g1")).await;
        alice.next();
        bob.emit(&h.server, join("g1")).await;
        bob.next();
        alice.next();

        h.directory.remove_group_member("g1", "bob").await;
        bob.emit(
            &h.server,
            json!({"event": "typing:start", "data": {"conversationType": "group", "conversationId": "g1"}}),
        )
        .await;

        assert_eq!(bob.next().name(), ServerEvent::CONVERSATION_LEFT);
        let ServerEvent::Error { code, .. } = bob.next() else {
            panic!("expected not_a_member");
        };
        assert_eq!(code, "not_a_member");
        assert_eq!(alice.next().name(), ServerEvent::USER_LEFT);
        alice.assert_idle();
    }

    #[tokio::test]
    async fn sign_out_closes_every_session_of_the_user() {
        let h = harness().await;
        let mut alice = Peer::connect(&h.server, "alice").await;
        let _alice_tab = Peer::connect(&h.server, "alice").await;
        let _bob = Peer::connect(&h.server, "bob").await;
        alice.emit(&h.server, join("g1")).await;
        alice.next();

        assert_eq!(h.server.sign_out("alice").await, 2);
        assert_eq!(h.server.connection_count().await, 1);
        assert!(h.server.rooms.get(&ConversationRef::group("g1")).await.is_none());
        // The session's sender is gone, so its writer sees the end of the queue.
        assert!(matches!(
            alice.rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn only_author_may_edit_or_delete() {
        let h = harness().await;
        let mut alice = Peer::connect(&h.server, "alice").await;
        let mut bob = Peer::connect(&h.server, "bob").await;
        alice.emit(&h.server, join("g1")).await;
        alice.next();
        bob.emit(&h.server, join("g1")).await;
        bob.next();
        alice.next();

        alice
            .emit(
                &h.server,
                json!({"event": "message:send", "data": {"conversationType": "group", "conversationId": "g1", "body": "v1"}}),
            )
            .await;
        let ServerEvent::MessageNew { message, .. } = alice.next() else {
            panic!("expected message:new");
        };
        bob.next();

        bob.emit(
            &h.server,
            json!({"event": "message:edit", "data": {"messageId": message.id, "body": "hacked", "requestId": "e1"}}),
        )
        .await;
        let ServerEvent::Error { code, request_id, .. } = bob.next() else {
            panic!("expected permission error");
        };
        assert_eq!(code, "permission_denied");
        assert_eq!(request_id.as_deref(), Some("e1"));
        alice.assert_idle();

        bob.emit(
            &h.server,
            json!({"event": "message:delete", "data": {"messageId": message.id}}),
        )
        .await;
        let ServerEvent::Error { code, .. } = bob.next() else {
            panic!("expected permission error");
        };
        assert_eq!(code, "permission_denied");

        alice
            .emit(
                &h.server,
                json!({"event": "message:edit", "data": {"messageId": message.id, "body": "v2"}}),
            )
            .await;
        let ServerEvent::MessageEdited { message: edited, .. } = bob.next() else {
            panic!("expected message:edited");
        };
        assert_eq!(edited.body, "v2");
        assert!(edited.edited);
        alice.next();

        alice
            .emit(
                &h.server,
                json!({"event": "message:delete", "data": {"messageId": message.id}}),
            )
            .await;
        let ServerEvent::MessageDeleted { message: deleted, .. } = bob.next() else {
            panic!("expected message:deleted");
        };
        assert!(deleted.deleted);
        assert_eq!(deleted.body, "");
    }

    #[tokio::test]
    async fn typing_goes_to_others_only() {
        let h = harness().await;
        let mut alice = Peer::connect(&h.server, "alice").await;
        let mut bob = Peer::connect(&h.server, "bob").await;
        alice.emit(&h.server, join("g1")).await;
        alice.next();
        bob.emit(&h.server, join("g1")).await;
        bob.next();
        alice.next();

        alice
            .emit(
                &h.server,
                json!({"event": "typing:start", "data": {"conversationType": "group", "conversationId": "g1"}}),
            )
            .await;
        let ServerEvent::TypingStarted { user_id, .. } = bob.next() else {
            panic!("expected typing:start");
        };
        assert_eq!(user_id, "alice");
        alice.assert_idle();
    }

    #[tokio::test]
    async fn leaving_stops_delivery_for_that_room_only() {
        let h = harness().await;
        h.directory.add_group_member("g2", "alice").await;
        h.directory.add_group_member("g2", "bob").await;
        let mut alice = Peer::connect(&h.server, "alice").await;
        let mut bob = Peer::connect(&h.server, "bob").await;

        for room in ["g1", "g2"] {
            alice.emit(&h.server, join(room)).await;
            alice.next();
            bob.emit(&h.server, join(room)).await;
            bob.next();
            alice.next();
        }

        bob.emit(
            &h.server,
            json!({"event": "leave:conversation", "data": {"conversationType": "group", "conversationId": "g1"}}),
        )
        .await;
        assert_eq!(bob.next().name(), ServerEvent::CONVERSATION_LEFT);
        assert_eq!(alice.next().name(), ServerEvent::USER_LEFT);

        for room in ["g1", "g2"] {
            alice
                .emit(
                    &h.server,
                    json!({"event": "message:send", "data": {"conversationType": "group", "conversationId": room, "body": room}}),
                )
                .await;
            alice.next();
        }

        let ServerEvent::MessageNew { message, .. } = bob.next() else {
            panic!("expected g2 message");
        };
        assert_eq!(message.body, "g2");
        bob.assert_idle();
    }

    #[tokio::test]
    async fn bad_input_is_reported_without_disconnecting() {
        let h = harness().await;
        let mut alice = Peer::connect(&h.server, "alice").await;

        alice
            .emit(
                &h.server,
                json!({"event": "message:send", "data": {"conversationType": "group", "conversationId": "g1", "body": "   "}}),
            )
            .await;
        let ServerEvent::Error { code, .. } = alice.next() else {
            panic!("expected invalid_request");
        };
        assert_eq!(code, "invalid_request");

        h.server
            .handle_frame(alice.id, &alice.identity, "not json")
            .await;
        assert_eq!(alice.next().name(), ServerEvent::ERROR);
        assert_eq!(h.server.connection_count().await, 1);
    }

    #[tokio::test]
    async fn disconnect_announces_departure() {
        let h = harness().await;
        let mut alice = Peer::connect(&h.server, "alice").await;
        let mut bob = Peer::connect(&h.server, "bob").await;
        alice.emit(&h.server, join("g1")).await;
        alice.next();
        bob.emit(&h.server, join("g1")).await;
        bob.next();
        alice.next();

        h.server.disconnect(bob.id).await;
        let ServerEvent::UserLeft { user_id, .. } = alice.next() else {
            panic!("expected user:left");
        };
        assert_eq!(user_id, "bob");
        assert_eq!(h.server.connection_count().await, 1);
    }

    #[tokio::test]
    async fn history_requires_membership() {
        let h = harness().await;
        let err = h
            .server
            .history(&identity("carol"), &ConversationRef::group("g1"), Page::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "not_a_member");
    }
}
