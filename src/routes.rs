use std::convert::Infallible;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::auth::Identity;
use crate::conversation::{ConversationRef, ConversationType};
use crate::error::ChatError;
use crate::server::Server;
use crate::store::Page;

#[derive(Debug)]
struct ApiRejection(ChatError);

impl warp::reject::Reject for ApiRejection {}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryQuery {
    conversation_type: ConversationType,
    conversation_id: String,
    after: Option<u64>,
    limit: Option<usize>,
}

fn with_server(server: Arc<Server>) -> impl Filter<Extract = (Arc<Server>,), Error = Infallible> + Clone {
    warp::any().map(move || server.clone())
}

/// Resolves the caller from `Authorization: Bearer` or `?token=`; rejects with
/// 401 before any session exists.
fn with_identity(
    server: Arc<Server>,
) -> impl Filter<Extract = (Identity,), Error = Rejection> + Clone {
    warp::header::optional::<String>("authorization")
        .and(warp::query::<TokenQuery>())
        .and(with_server(server))
        .and_then(
            |header: Option<String>, query: TokenQuery, server: Arc<Server>| async move {
                server
                    .tokens()
                    .authenticate(header.as_deref(), query.token.as_deref())
                    .map_err(|e| {
                        log::info!("Rejected credentials: {e}");
                        warp::reject::custom(ApiRejection(e))
                    })
            },
        )
}

pub fn routes(server: Arc<Server>) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let chat = warp::path("chat")
        .and(warp::path::end())
        .and(warp::ws())
        .and(with_identity(server.clone()))
        .and(with_server(server.clone()))
        .map(|ws: warp::ws::Ws, identity: Identity, server: Arc<Server>| {
            ws.on_upgrade(move |socket| async move {
                server.handle_connection(socket, identity).await;
            })
        });

    let health = warp::path("health")
        .and(warp::path::end())
        .and(warp::get())
        .map(|| warp::reply::json(&json!({"status": "ok"})));

    let ready = warp::path("ready")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_server(server.clone()))
        .then(|server: Arc<Server>| async move {
            let (store, membership) = server.readiness().await;
            let ready = store && membership;
            let body = json!({
                "ready": ready,
                "checks": {"messageStore": store, "membership": membership},
            });
            let status = if ready {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            warp::reply::with_status(warp::reply::json(&body), status)
        });

    let history = warp::path!("api" / "chat" / "messages")
        .and(warp::get())
        .and(with_identity(server.clone()))
        .and(warp::query::<HistoryQuery>())
        .and(with_server(server))
        .and_then(
            |identity: Identity, query: HistoryQuery, server: Arc<Server>| async move {
                let conversation =
                    ConversationRef::new(query.conversation_type, query.conversation_id);
                let page = Page {
                    after: query.after,
                    limit: query.limit,
                };
                server
                    .history(&identity, &conversation, page)
                    .await
                    .map(|page| warp::reply::json(&page))
                    .map_err(|e| warp::reject::custom(ApiRejection(e)))
            },
        );

    chat.or(health)
        .or(ready)
        .or(history)
        .recover(handle_rejection)
        .with(warp::cors().allow_any_origin())
}

async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
    let (status, code, message) = if let Some(ApiRejection(e)) = err.find() {
        (e.status(), e.code(), e.to_string())
    } else if err.is_not_found() {
        (StatusCode::NOT_FOUND, "not_found", "Not found".to_string())
    } else if let Some(e) = err.find::<warp::reject::InvalidQuery>() {
        (StatusCode::BAD_REQUEST, "invalid_request", e.to_string())
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (
            StatusCode::METHOD_NOT_ALLOWED,
            "invalid_request",
            "Method not allowed".to_string(),
        )
    } else {
        log::warn!("Unhandled rejection: {err:?}");
        (
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "Bad request".to_string(),
        )
    };

    Ok(warp::reply::with_status(
        warp::reply::json(&json!({"code": code, "message": message})),
        status,
    ))
}
