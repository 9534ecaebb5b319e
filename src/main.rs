use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use collabry_chat::config::ServerConfig;
use collabry_chat::error::ChatError;
use collabry_chat::membership::InMemoryDirectory;
use collabry_chat::routes::routes;
use collabry_chat::server::Server;
use collabry_chat::store::InMemoryMessageStore;

fn load_tls_config(cert_path: &Path, key_path: &Path) -> Result<rustls::ServerConfig, ChatError> {
    let cert_file = File::open(cert_path)
        .map_err(|e| ChatError::Tls(format!("cannot open {}: {e}", cert_path.display())))?;
    let key_file = File::open(key_path)
        .map_err(|e| ChatError::Tls(format!("cannot open {}: {e}", key_path.display())))?;

    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ChatError::Tls(format!("failed to parse certificate: {e}")))?;
    if certs.is_empty() {
        return Err(ChatError::Tls(format!(
            "no certificates in {}",
            cert_path.display()
        )));
    }

    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .map_err(|e| ChatError::Tls(format!("failed to parse private key: {e}")))?
        .ok_or_else(|| ChatError::Tls(format!("no private key in {}", key_path.display())))?;

    rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ChatError::Tls(e.to_string()))
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!("{e}");
            std::process::exit(1);
        }
    };

    let directory = match &config.membership_file {
        Some(path) => match InMemoryDirectory::load(path).await {
            Ok(directory) => directory,
            Err(e) => {
                log::error!("{e}");
                std::process::exit(1);
            }
        },
        None => {
            log::warn!("CHAT_MEMBERSHIP_FILE not set, starting with an empty membership directory");
            InMemoryDirectory::new()
        }
    };

    let server = Arc::new(Server::new(
        &config,
        Arc::new(InMemoryMessageStore::new(config.max_page_size)),
        Arc::new(directory),
    ));
    let routes = routes(server);
    let addr = config.socket_addr();

    let tls_paths = config.tls_cert.as_deref().zip(config.tls_key.as_deref());
    match tls_paths.map(|(cert, key)| (cert, key, load_tls_config(cert, key))) {
        Some((cert, key, Ok(_))) => {
            log::info!("Starting secure chat server (HTTPS/WSS) on {addr}");
            warp::serve(routes)
                .tls()
                .cert_path(cert)
                .key_path(key)
                .run(addr)
                .await;
        }
        Some((_, _, Err(e))) => {
            log::warn!("{e}; falling back to HTTP/WS on {addr}");
            warp::serve(routes).run(addr).await;
        }
        None => {
            log::info!("Starting chat server (HTTP/WS) on {addr}");
            warp::serve(routes).run(addr).await;
        }
    }
}
