#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use collabry_chat::membership::InMemoryDirectory;
use collabry_chat::routes::routes;
use collabry_chat::{
    Backoff, ClientConfig, ConnectionManager, Identity, InMemoryMessageStore, Server,
    ServerConfig, ServerEvent,
};
use tokio::sync::mpsc::UnboundedReceiver;

pub const SECRET: &str = "integration-secret";

pub struct TestServer {
    pub addr: SocketAddr,
    pub server: Arc<Server>,
    pub directory: Arc<InMemoryDirectory>,
}

impl TestServer {
    pub async fn start() -> TestServer {
        let config = ServerConfig::with_secret(SECRET);
        let directory = Arc::new(InMemoryDirectory::new());
        for user in ["alice", "bob"] {
            directory.add_group_member("g1", user).await;
        }
        let server = Arc::new(Server::new(
            &config,
            Arc::new(InMemoryMessageStore::new(config.max_page_size)),
            directory.clone(),
        ));

        let (addr, serving) = warp::serve(routes(server.clone())).bind_ephemeral(config.socket_addr());
        tokio::spawn(serving);

        TestServer {
            addr,
            server,
            directory,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/chat", self.addr)
    }

    pub fn token(&self, user: &str) -> String {
        self.server
            .tokens()
            .issue(&identity(user), chrono::Duration::minutes(10))
            .unwrap()
    }

    pub fn manager(&self, user: &str) -> ConnectionManager {
        self.manager_with_backoff(
            user,
            Backoff {
                initial: Duration::from_millis(20),
                max: Duration::from_millis(100),
                max_attempts: 3,
            },
        )
    }

    pub fn manager_with_backoff(&self, user: &str, backoff: Backoff) -> ConnectionManager {
        let config = ClientConfig::new(self.url(), self.token(user)).with_backoff(backoff);
        ConnectionManager::new(config)
    }
}

pub fn identity(user: &str) -> Identity {
    Identity {
        user_id: user.to_string(),
        label: format!("{user}@collabry.dev"),
    }
}

pub async fn next_event(rx: &mut UnboundedReceiver<ServerEvent>) -> ServerEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("listener channel closed")
}

pub async fn assert_quiet(rx: &mut UnboundedReceiver<ServerEvent>) {
    let waited = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
    assert!(waited.is_err(), "unexpected event: {waited:?}");
}
