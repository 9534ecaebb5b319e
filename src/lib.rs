//! Real-time chat relay for Collabry: a room router that validates membership,
//! persists messages and fans them out over WebSockets, plus the client-side
//! connection manager that shares one socket between UI components.

pub mod auth;
pub mod client;
pub mod config;
pub mod conversation;
pub mod error;
pub mod membership;
pub mod messages;
pub mod room;
pub mod routes;
pub mod server;
pub mod store;

pub use auth::{Identity, TokenAuthority};
pub use client::{ConnectionHandle, ConnectionManager, ConnectionState};
pub use config::{Backoff, ClientConfig, ServerConfig};
pub use conversation::{ConversationRef, ConversationType};
pub use error::ChatError;
pub use messages::{ClientEvent, ServerEvent};
pub use server::Server;
pub use store::{InMemoryMessageStore, Message, MessagePage, MessageStore, Page};
