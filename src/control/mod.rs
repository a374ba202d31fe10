//! HTTP control endpoint: login/logout notifications and a players dump.
//!
//! Only started when `use_rest_api` is enabled (correlation mode).

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;

use crate::error::AppError;
use crate::identity::{IdentityMap, IdentityPersistence, PendingBuffer};
use crate::notify::embeds;
use crate::notify::webhook;

pub struct AppState {
    pub identity_map: Arc<IdentityMap>,
    pub pending: Arc<PendingBuffer>,
    pub persistence: Arc<IdentityPersistence>,
    pub http_client: reqwest::Client,
    pub webhook_urls: Vec<String>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/login", post(login))
        .route("/api/logout", post(logout))
        .route("/api/players", get(players))
        .fallback(not_found)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = router(state);
    let bind_addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(bind = %bind_addr, "control: listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn not_found() -> AppError {
    AppError::NotFound("no such route".into())
}

fn parse_login_body(body: Result<Json<Value>, JsonRejection>) -> Result<(i64, String), AppError> {
    let Json(value) = body.map_err(|e| AppError::InvalidInput(e.to_string()))?;
    let timestamp = value
        .get("timestamp")
        .and_then(Value::as_i64)
        .ok_or_else(|| AppError::InvalidInput("timestamp must be a number".into()))?;
    let username = value
        .get("username")
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::InvalidInput("username must be a string".into()))?
        .to_string();
    Ok((timestamp, username))
}

async fn login(
    State(state): State<Arc<AppState>>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>, AppError> {
    let (timestamp, username) = parse_login_body(body)?;

    state.identity_map.register_login(timestamp, username.clone());
    let (matched, _unmatched) = state.pending.process_pending_for_player(&username, timestamp);

    if matched.is_empty() {
        for webhook_url in &state.webhook_urls {
            webhook::post_embed(
                &state.http_client,
                webhook_url,
                embeds::generic_login_embed(&username),
            )
            .await;
        }
    } else {
        let mut groups: HashMap<(String, String), Vec<u16>> = HashMap::new();
        for flow in &matched {
            groups
                .entry((flow.ip.clone(), flow.protocol.clone()))
                .or_default()
                .push(flow.port);
        }

        let now_ms = chrono::Utc::now().timestamp_millis();
        for ((ip, protocol), mut ports) in groups {
            ports.sort_unstable();
            state
                .persistence
                .register(&username, &ip, ports[0], &protocol, now_ms);

            for webhook_url in &state.webhook_urls {
                webhook::post_embed(
                    &state.http_client,
                    webhook_url,
                    embeds::join_embed(&username, &ip, &protocol, &ports),
                )
                .await;
            }
        }
    }

    Ok(Json(json!({ "status": "ok" })))
}

async fn logout(
    State(state): State<Arc<AppState>>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>, AppError> {
    let (timestamp, username) = parse_login_body(body)?;

    state.identity_map.register_logout(timestamp, &username);

    match state.persistence.lookup(&username) {
        Some((ip, protocol)) => {
            let protocol = protocol.unwrap_or_else(|| "unknown".into());
            for webhook_url in &state.webhook_urls {
                webhook::post_embed(
                    &state.http_client,
                    webhook_url,
                    embeds::leave_embed(&username, &ip, &protocol),
                )
                .await;
            }
        }
        None => {
            for webhook_url in &state.webhook_urls {
                webhook::post_embed(
                    &state.http_client,
                    webhook_url,
                    embeds::leave_embed_no_ip(&username),
                )
                .await;
            }
        }
    }

    Ok(Json(json!({ "status": "ok" })))
}

async fn players(State(state): State<Arc<AppState>>) -> Json<Value> {
    let snapshot = state.identity_map.snapshot();
    let list: Vec<Value> = snapshot
        .into_iter()
        .map(|(timestamp, username)| json!({ "timestamp": timestamp, "username": username }))
        .collect();
    Json(json!({ "players": list }))
}
