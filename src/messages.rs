use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::conversation::ConversationRef;
use crate::error::ChatError;
use crate::store::Message;

/// Frames sent by a client: `{"event": "message:send", "data": {...}}`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "event", content = "data", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    #[serde(rename = "join:conversation")]
    JoinConversation {
        #[serde(flatten)]
        conversation: ConversationRef,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    #[serde(rename = "leave:conversation")]
    LeaveConversation {
        #[serde(flatten)]
        conversation: ConversationRef,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    #[serde(rename = "conversation:members")]
    GetMembers {
        #[serde(flatten)]
        conversation: ConversationRef,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    #[serde(rename = "message:send")]
    SendMessage {
        #[serde(flatten)]
        conversation: ConversationRef,
        body: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    #[serde(rename = "message:edit")]
    EditMessage {
        message_id: Uuid,
        body: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    #[serde(rename = "message:delete")]
    DeleteMessage {
        message_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    #[serde(rename = "typing:start")]
    StartTyping {
        #[serde(flatten)]
        conversation: ConversationRef,
    },
    #[serde(rename = "typing:stop")]
    StopTyping {
        #[serde(flatten)]
        conversation: ConversationRef,
    },
}

impl ClientEvent {
    pub fn request_id(&self) -> Option<&str> {
        match self {
            ClientEvent::JoinConversation { request_id, .. }
            | ClientEvent::LeaveConversation { request_id, .. }
            | ClientEvent::GetMembers { request_id, .. }
            | ClientEvent::SendMessage { request_id, .. }
            | ClientEvent::EditMessage { request_id, .. }
            | ClientEvent::DeleteMessage { request_id, .. } => request_id.as_deref(),
            ClientEvent::StartTyping { .. } | ClientEvent::StopTyping { .. } => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "event", content = "data", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    #[serde(rename = "connected")]
    Connected { connection_id: Uuid, user_id: String },
    #[serde(rename = "conversation:joined")]
    ConversationJoined {
        #[serde(flatten)]
        conversation: ConversationRef,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    #[serde(rename = "conversation:left")]
    ConversationLeft {
        #[serde(flatten)]
        conversation: ConversationRef,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    #[serde(rename = "conversation:members")]
    MemberList {
        #[serde(flatten)]
        conversation: ConversationRef,
        user_ids: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    #[serde(rename = "user:joined")]
    UserJoined {
        #[serde(flatten)]
        conversation: ConversationRef,
        user_id: String,
        label: String,
    },
    #[serde(rename = "user:left")]
    UserLeft {
        #[serde(flatten)]
        conversation: ConversationRef,
        user_id: String,
    },
    #[serde(rename = "message:new")]
    MessageNew {
        message: Message,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    #[serde(rename = "message:edited")]
    MessageEdited {
        message: Message,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    #[serde(rename = "message:deleted")]
    MessageDeleted {
        message: Message,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    #[serde(rename = "typing:start")]
    TypingStarted {
        #[serde(flatten)]
        conversation: ConversationRef,
        user_id: String,
    },
    #[serde(rename = "typing:stop")]
    TypingStopped {
        #[serde(flatten)]
        conversation: ConversationRef,
        user_id: String,
    },
    #[serde(rename = "error")]
    Error {
        code: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    /// Raised locally by the connection manager, never sent by the server.
    #[serde(rename = "connection:failed")]
    ConnectionFailed { code: String, message: String },
}

impl ServerEvent {
    pub const CONNECTED: &'static str = "connected";
    pub const CONVERSATION_JOINED: &'static str = "conversation:joined";
    pub const CONVERSATION_LEFT: &'static str = "conversation:left";
    pub const MEMBER_LIST: &'static str = "conversation:members";
    pub const USER_JOINED: &'static str = "user:joined";
    pub const USER_LEFT: &'static str = "user:left";
    pub const MESSAGE_NEW: &'static str = "message:new";
    pub const MESSAGE_EDITED: &'static str = "message:edited";
    pub const MESSAGE_DELETED: &'static str = "message:deleted";
    pub const TYPING_START: &'static str = "typing:start";
    pub const TYPING_STOP: &'static str = "typing:stop";
    pub const ERROR: &'static str = "error";
    pub const CONNECTION_FAILED: &'static str = "connection:failed";

    /// Event name as it appears on the wire; listeners are keyed by it.
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Connected { .. } => Self::CONNECTED,
            ServerEvent::ConversationJoined { .. } => Self::CONVERSATION_JOINED,
            ServerEvent::ConversationLeft { .. } => Self::CONVERSATION_LEFT,
            ServerEvent::MemberList { .. } => Self::MEMBER_LIST,
            ServerEvent::UserJoined { .. } => Self::USER_JOINED,
            ServerEvent::UserLeft { .. } => Self::USER_LEFT,
            ServerEvent::MessageNew { .. } => Self::MESSAGE_NEW,
            ServerEvent::MessageEdited { .. } => Self::MESSAGE_EDITED,
            ServerEvent::MessageDeleted { .. } => Self::MESSAGE_DELETED,
            ServerEvent::TypingStarted { .. } => Self::TYPING_START,
            ServerEvent::TypingStopped { .. } => Self::TYPING_STOP,
            ServerEvent::Error { .. } => Self::ERROR,
            ServerEvent::ConnectionFailed { .. } => Self::CONNECTION_FAILED,
        }
    }

    pub fn from_error(err: &ChatError, request_id: Option<&str>) -> Self {
        ServerEvent::Error {
            code: err.code().to_string(),
            message: err.to_string(),
            request_id: request_id.map(str::to_string),
        }
    }
}
