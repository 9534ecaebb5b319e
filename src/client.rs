//! Client-side connection manager.
//!
//! Every UI component that needs real-time chat calls
//! [`ConnectionManager::connect`] and gets its own [`ConnectionHandle`]. All
//! handles of a manager share one WebSocket: the first `connect` opens it, the
//! last handle to go away closes it. Listeners are registered per handle, so a
//! component dropping its handle never removes a sibling's listeners.
//!
//! The socket is kept alive by a background driver task that reconnects with
//! exponential backoff, re-joins every room that still has an interested
//! component, and then flushes whatever was emitted while offline.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as Frame};
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::conversation::{ConversationRef, ConversationType};
use crate::error::ChatError;
use crate::messages::{ClientEvent, ServerEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    /// Shut down, retries exhausted, or credentials rejected.
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ComponentId(Uuid);

impl ComponentId {
    pub fn new() -> Self {
        ComponentId(Uuid::new_v4())
    }
}

impl Default for ComponentId {
    fn default() -> Self {
        Self::new()
    }
}

pub type Listener = Arc<dyn Fn(&ServerEvent) + Send + Sync>;

/// Event name -> handlers, each tagged with the component that owns it.
#[derive(Default)]
pub struct ListenerRegistry {
    handlers: RwLock<HashMap<String, Vec<(ComponentId, Listener)>>>,
}

impl ListenerRegistry {
    pub fn add(&self, component: ComponentId, event: &str, listener: Listener) {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        handlers
            .entry(event.to_string())
            .or_default()
            .push((component, listener));
    }

    pub fn remove(&self, component: ComponentId, event: &str) {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(list) = handlers.get_mut(event) {
            list.retain(|(owner, _)| *owner != component);
            if list.is_empty() {
                handlers.remove(event);
            }
        }
    }

    pub fn remove_component(&self, component: ComponentId) {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        handlers.retain(|_, list| {
            list.retain(|(owner, _)| *owner != component);
            !list.is_empty()
        });
    }

    pub fn count(&self, event: &str) -> usize {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        handlers.get(event).map_or(0, Vec::len)
    }

    pub fn dispatch(&self, event: &ServerEvent) {
        // Snapshot first so handlers may register or remove listeners.
        let targets: Vec<Listener> = {
            let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
            handlers
                .get(event.name())
                .map(|list| list.iter().map(|(_, listener)| listener.clone()).collect())
                .unwrap_or_default()
        };
        for listener in targets {
            listener(event);
        }
    }
}

struct Transport {
    id: Uuid,
    user_id: String,
    label: String,
    outbound: mpsc::UnboundedSender<ClientEvent>,
    // Parked here whenever no driver task is running.
    parked_outbound: Mutex<Option<mpsc::UnboundedReceiver<ClientEvent>>>,
    state: watch::Sender<ConnectionState>,
    shutdown: watch::Sender<bool>,
    listeners: ListenerRegistry,
    // room -> number of handles that joined it
    rooms: Mutex<HashMap<ConversationRef, usize>>,
    // Rooms whose join already went out on some socket. Only these are
    // replayed after a reconnect; joins still queued go out on their own.
    announced: Mutex<HashSet<ConversationRef>>,
}

impl Transport {
    fn new(user_id: &str, label: &str) -> Arc<Self> {
        let (outbound, rx) = mpsc::unbounded_channel();
        Arc::new(Transport {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            label: label.to_string(),
            outbound,
            parked_outbound: Mutex::new(Some(rx)),
            state: watch::Sender::new(ConnectionState::Connecting),
            shutdown: watch::Sender::new(false),
            listeners: ListenerRegistry::default(),
            rooms: Mutex::new(HashMap::new()),
            announced: Mutex::new(HashSet::new()),
        })
    }

    fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Spawns the driver unless one is already running.
    fn start(self: &Arc<Self>, config: ClientConfig) {
        let mut parked = self
            .parked_outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(outbound) = parked.take() {
            self.state.send_replace(ConnectionState::Connecting);
            tokio::spawn(drive(self.clone(), config, outbound));
        }
    }

    /// Parks the queue and marks the transport disconnected in one step, so a
    /// concurrent `start` either sees the old driver running or a clean slate.
    fn park(&self, outbound: mpsc::UnboundedReceiver<ClientEvent>) {
        let mut parked = self
            .parked_outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *parked = Some(outbound);
        self.state.send_replace(ConnectionState::Disconnected);
    }

    fn emit(&self, event: ClientEvent) -> Result<(), ChatError> {
        if self.current_state() == ConnectionState::Disconnected {
            return Err(ChatError::ConnectionClosed);
        }
        self.outbound
            .send(event)
            .map_err(|_| ChatError::ConnectionClosed)
    }

    fn joined_rooms(&self) -> Vec<ConversationRef> {
        let rooms = self.rooms.lock().unwrap_or_else(PoisonError::into_inner);
        rooms.keys().cloned().collect()
    }

    /// Rooms the server knew about on the previous socket that some handle
    /// still wants.
    fn rooms_to_replay(&self) -> Vec<ConversationRef> {
        let rooms = self.rooms.lock().unwrap_or_else(PoisonError::into_inner);
        let mut announced = self.announced.lock().unwrap_or_else(PoisonError::into_inner);
        announced.retain(|conversation| rooms.contains_key(conversation));
        announced.iter().cloned().collect()
    }

    fn note_written(&self, event: &ClientEvent) {
        let mut announced = self.announced.lock().unwrap_or_else(PoisonError::into_inner);
        match event {
            ClientEvent::JoinConversation { conversation, .. } => {
                announced.insert(conversation.clone());
            }
            ClientEvent::LeaveConversation { conversation, .. } => {
                announced.remove(conversation);
            }
            _ => {}
        }
    }

    /// Returns true when this was the first interested handle.
    fn retain_room(&self, conversation: &ConversationRef) -> bool {
        let mut rooms = self.rooms.lock().unwrap_or_else(PoisonError::into_inner);
        let count = rooms.entry(conversation.clone()).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Returns true when the last interested handle let go.
    fn release_room(&self, conversation: &ConversationRef) -> bool {
        let mut rooms = self.rooms.lock().unwrap_or_else(PoisonError::into_inner);
        match rooms.get_mut(conversation) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                rooms.remove(conversation);
                true
            }
            None => false,
        }
    }

    fn fail(&self, code: &str, message: String) {
        self.listeners.dispatch(&ServerEvent::ConnectionFailed {
            code: code.to_string(),
            message,
        });
    }
}

enum Exit {
    Shutdown,
    Dropped,
}

fn endpoint(config: &ClientConfig) -> String {
    let separator = if config.url.contains('?') { '&' } else { '?' };
    format!("{}{separator}token={}", config.url, config.token)
}

async fn drive(
    transport: Arc<Transport>,
    config: ClientConfig,
    mut outbound: mpsc::UnboundedReceiver<ClientEvent>,
) {
    let mut shutdown = transport.shutdown.subscribe();
    let url = endpoint(&config);
    let mut attempt = 0u32;
    // An event whose write failed is retried after the next handshake.
    let mut pending: Option<ClientEvent> = None;

    loop {
        if *shutdown.borrow() {
            break;
        }

        log::debug!("Transport {} connecting to {}", transport.id, config.url);
        let connected = select! {
            resp = connect_async(url.as_str()) => resp,
            _ = shutdown.changed() => break,
        };

        match connected {
            Ok((ws, _)) => {
                if attempt > 0 {
                    log::info!("Transport {} reconnected after {attempt} attempts", transport.id);
                }
                attempt = 0;
                transport.state.send_replace(ConnectionState::Connected);

                let exit =
                    run_session(&transport, ws, &mut outbound, &mut shutdown, &mut pending).await;
                if matches!(exit, Exit::Shutdown) {
                    break;
                }
                log::info!("Transport {} lost its connection", transport.id);
            }
            Err(WsError::Http(response)) if response.status() == StatusCode::UNAUTHORIZED => {
                log::error!("Transport {} was refused: unauthorized", transport.id);
                transport.fail(
                    "authentication_failed",
                    "the server rejected the credentials; sign in again".to_string(),
                );
                break;
            }
            Err(e) => {
                log::warn!("Transport {} failed to connect: {e}", transport.id);
            }
        }

        attempt += 1;
        if attempt > config.backoff.max_attempts {
            log::error!(
                "Transport {} giving up after {} attempts",
                transport.id,
                config.backoff.max_attempts
            );
            transport.fail(
                "connectivity",
                format!(
                    "could not reach the chat server after {} attempts",
                    config.backoff.max_attempts
                ),
            );
            break;
        }

        transport
            .state
            .send_replace(ConnectionState::Reconnecting { attempt });
        select! {
            () = sleep(config.backoff.delay(attempt)) => {}
            _ = shutdown.changed() => break,
        }
    }

    transport.park(outbound);
    log::debug!("Transport {} driver stopped", transport.id);
}

/// Pumps one live socket: re-joins rooms, then relays queued emissions out and
/// server events to listeners until the socket drops or we are told to stop.
async fn run_session(
    transport: &Transport,
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    outbound: &mut mpsc::UnboundedReceiver<ClientEvent>,
    shutdown: &mut watch::Receiver<bool>,
    pending: &mut Option<ClientEvent>,
) -> Exit {
    let (mut write, mut read) = ws.split();

    let mut replay: Vec<ClientEvent> = transport
        .rooms_to_replay()
        .into_iter()
        .map(|conversation| ClientEvent::JoinConversation {
            conversation,
            request_id: None,
        })
        .collect();
    replay.extend(pending.take());
    for event in replay {
        if let Err(e) = write_event(&mut write, &event).await {
            log::warn!("Transport {} failed to replay: {e}", transport.id);
            *pending = Some(event);
            return Exit::Dropped;
        }
        transport.note_written(&event);
    }

    loop {
        select! {
            _ = shutdown.changed() => {
                let _ = write.close().await;
                return Exit::Shutdown;
            }
            event = outbound.recv() => {
                let Some(event) = event else {
                    return Exit::Shutdown;
                };
                if let Err(e) = write_event(&mut write, &event).await {
                    log::warn!("Transport {} write failed: {e}", transport.id);
                    *pending = Some(event);
                    return Exit::Dropped;
                }
                transport.note_written(&event);
            }
            frame = read.next() => match frame {
                Some(Ok(Frame::Text(text))) => {
                    match serde_json::from_str::<ServerEvent>(text.as_str()) {
                        Ok(event) => transport.listeners.dispatch(&event),
                        Err(e) => log::warn!("Transport {} got an unknown frame: {e}", transport.id),
                    }
                }
                Some(Ok(Frame::Close(_))) | None => return Exit::Dropped,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::warn!("Transport {} read failed: {e}", transport.id);
                    return Exit::Dropped;
                }
            }
        }
    }
}

async fn write_event<S>(write: &mut S, event: &ClientEvent) -> Result<(), ChatError>
where
    S: futures_util::Sink<Frame, Error = WsError> + Unpin,
{
    let text = serde_json::to_string(event)?;
    write
        .send(Frame::text(text))
        .await
        .map_err(|e| ChatError::Connectivity(e.to_string()))
}

struct Slot {
    transport: Arc<Transport>,
    leases: usize,
}

struct ManagerInner {
    config: ClientConfig,
    slot: Mutex<Option<Slot>>,
}

impl ManagerInner {
    fn release(&self, transport_id: Uuid) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(current) = slot.as_mut() else {
            return;
        };
        if current.transport.id != transport_id {
            return;
        }
        current.leases -= 1;
        if current.leases == 0 {
            log::debug!("Last handle released, closing transport {transport_id}");
            current.transport.shutdown.send_replace(true);
            *slot = None;
        }
    }
}

/// Hands out leases on the one shared connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    pub fn new(config: ClientConfig) -> Self {
        ConnectionManager {
            inner: Arc::new(ManagerInner {
                config,
                slot: Mutex::new(None),
            }),
        }
    }

    /// Opens the shared connection or reuses the live one. Safe to call from
    /// many components at once; only one socket is ever opened.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// * [`ChatError::InvalidRequest`] if the manager is already connected as
    ///   a different user
    pub fn connect(&self, user_id: &str, user_label: &str) -> Result<ConnectionHandle, ChatError> {
        let mut slot = self
            .inner
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let transport = match slot.as_mut() {
            Some(current) => {
                if current.transport.user_id != user_id {
                    return Err(ChatError::InvalidRequest(format!(
                        "already connected as {}",
                        current.transport.user_id
                    )));
                }
                current.leases += 1;
                current.transport.clone()
            }
            None => {
                let transport = Transport::new(user_id, user_label);
                log::info!(
                    "Opening transport {} for {} ({})",
                    transport.id,
                    transport.user_id,
                    transport.label
                );
                *slot = Some(Slot {
                    transport: transport.clone(),
                    leases: 1,
                });
                transport
            }
        };

        // No-op while a driver runs; revives a transport that gave up earlier.
        transport.start(self.inner.config.clone());

        Ok(ConnectionHandle {
            component: ComponentId::new(),
            transport,
            manager: self.inner.clone(),
            rooms: Mutex::new(HashSet::new()),
        })
    }

    pub fn state(&self) -> ConnectionState {
        let slot = self.inner.slot.lock().unwrap_or_else(PoisonError::into_inner);
        slot.as_ref()
            .map_or(ConnectionState::Disconnected, |current| {
                current.transport.current_state()
            })
    }

    pub fn lease_count(&self) -> usize {
        let slot = self.inner.slot.lock().unwrap_or_else(PoisonError::into_inner);
        slot.as_ref().map_or(0, |current| current.leases)
    }
}

/// One component's lease on the shared connection. Dropping it removes the
/// component's listeners, leaves rooms nobody else wants, and closes the socket
/// if it was the last lease.
pub struct ConnectionHandle {
    component: ComponentId,
    transport: Arc<Transport>,
    manager: Arc<ManagerInner>,
    rooms: Mutex<HashSet<ConversationRef>>,
}

impl ConnectionHandle {
    pub fn component_id(&self) -> ComponentId {
        self.component
    }

    pub fn transport_id(&self) -> Uuid {
        self.transport.id
    }

    pub fn user_id(&self) -> &str {
        &self.transport.user_id
    }

    pub fn state(&self) -> ConnectionState {
        self.transport.current_state()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.transport.state.subscribe()
    }

    /// Waits until the socket is up or the manager gave up.
    ///
    /// # Errors
    ///
    /// * [`ChatError::ConnectionClosed`] if the transport ended up disconnected
    /// * [`ChatError::Connectivity`] if `timeout` elapsed first
    pub async fn wait_connected(&self, timeout: Duration) -> Result<(), ChatError> {
        let mut changes = self.state_changes();
        let settled = tokio::time::timeout(
            timeout,
            changes.wait_for(|state| {
                matches!(
                    state,
                    ConnectionState::Connected | ConnectionState::Disconnected
                )
            }),
        )
        .await
        .map_err(|_| ChatError::Connectivity("timed out waiting for the connection".to_string()))?
        .map(|state| *state)
        .map_err(|_| ChatError::ConnectionClosed)?;

        match settled {
            ConnectionState::Connected => Ok(()),
            _ => Err(ChatError::ConnectionClosed),
        }
    }

    pub fn on<F>(&self, event: &str, listener: F)
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        self.transport
            .listeners
            .add(self.component, event, Arc::new(listener));
    }

    /// Removes this component's listeners for `event`; other components keep theirs.
    pub fn off(&self, event: &str) {
        self.transport.listeners.remove(self.component, event);
    }

    /// Listener that forwards matching events into a channel.
    pub fn subscribe(&self, event: &str) -> mpsc::UnboundedReceiver<ServerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.on(event, move |event| {
            let _ = tx.send(event.clone());
        });
        rx
    }

    /// # Errors
    ///
    /// * [`ChatError::ConnectionClosed`] if the transport is disconnected
    pub fn join_conversation(
        &self,
        conversation_type: ConversationType,
        conversation_id: &str,
    ) -> Result<String, ChatError> {
        let conversation = ConversationRef::new(conversation_type, conversation_id);
        conversation.validate()?;
        let request_id = new_request_id();
        self.transport.emit(ClientEvent::JoinConversation {
            conversation: conversation.clone(),
            request_id: Some(request_id.clone()),
        })?;

        let mut rooms = self.rooms.lock().unwrap_or_else(PoisonError::into_inner);
        if rooms.insert(conversation.clone()) {
            self.transport.retain_room(&conversation);
        }
        Ok(request_id)
    }

    /// Only tells the server once no other component still wants the room.
    ///
    /// # Errors
    ///
    /// * [`ChatError::ConnectionClosed`] if the transport is disconnected
    pub fn leave_conversation(
        &self,
        conversation_type: ConversationType,
        conversation_id: &str,
    ) -> Result<(), ChatError> {
        let conversation = ConversationRef::new(conversation_type, conversation_id);
        let removed = self
            .rooms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&conversation);
        if removed && self.transport.release_room(&conversation) {
            self.transport.emit(ClientEvent::LeaveConversation {
                conversation,
                request_id: None,
            })?;
        }
        Ok(())
    }

    /// Returns the request id echoed back on `conversation:members`.
    ///
    /// # Errors
    ///
    /// * [`ChatError::ConnectionClosed`] if the transport is disconnected
    pub fn request_members(&self, conversation: &ConversationRef) -> Result<String, ChatError> {
        let request_id = new_request_id();
        self.transport.emit(ClientEvent::GetMembers {
            conversation: conversation.clone(),
            request_id: Some(request_id.clone()),
        })?;
        Ok(request_id)
    }

    /// Fire-and-forget; the stored message arrives as `message:new` carrying
    /// the returned request id.
    ///
    /// # Errors
    ///
    /// * [`ChatError::ConnectionClosed`] if the transport is disconnected
    pub fn send_message(&self, conversation: &ConversationRef, body: &str) -> Result<String, ChatError> {
        let request_id = new_request_id();
        self.transport.emit(ClientEvent::SendMessage {
            conversation: conversation.clone(),
            body: body.to_string(),
            request_id: Some(request_id.clone()),
        })?;
        Ok(request_id)
    }

    /// # Errors
    ///
    /// * [`ChatError::ConnectionClosed`] if the transport is disconnected
    pub fn edit_message(&self, message_id: Uuid, body: &str) -> Result<String, ChatError> {
        let request_id = new_request_id();
        self.transport.emit(ClientEvent::EditMessage {
            message_id,
            body: body.to_string(),
            request_id: Some(request_id.clone()),
        })?;
        Ok(request_id)
    }

    /// # Errors
    ///
    /// * [`ChatError::ConnectionClosed`] if the transport is disconnected
    pub fn delete_message(&self, message_id: Uuid) -> Result<String, ChatError> {
        let request_id = new_request_id();
        self.transport.emit(ClientEvent::DeleteMessage {
            message_id,
            request_id: Some(request_id.clone()),
        })?;
        Ok(request_id)
    }

    /// # Errors
    ///
    /// * [`ChatError::ConnectionClosed`] if the transport is disconnected
    pub fn start_typing(&self, conversation: &ConversationRef) -> Result<(), ChatError> {
        self.transport.emit(ClientEvent::StartTyping {
            conversation: conversation.clone(),
        })
    }

    /// # Errors
    ///
    /// * [`ChatError::ConnectionClosed`] if the transport is disconnected
    pub fn stop_typing(&self, conversation: &ConversationRef) -> Result<(), ChatError> {
        self.transport.emit(ClientEvent::StopTyping {
            conversation: conversation.clone(),
        })
    }

    pub fn release(self) {
        drop(self);
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.transport.listeners.remove_component(self.component);

        let rooms: Vec<ConversationRef> = self
            .rooms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for conversation in rooms {
            if self.transport.release_room(&conversation) {
                let _ = self.transport.emit(ClientEvent::LeaveConversation {
                    conversation,
                    request_id: None,
                });
            }
        }

        self.manager.release(self.transport.id);
    }
}

fn new_request_id() -> String {
    Uuid::new_v4().to_string()
}
