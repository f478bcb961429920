//! Axum-based HTTP gateway for the LINE webhook.
//!
//! - Request body size limit (64KB) and request timeout (30s)
//! - Signature verification before any parsing
//! - The webhook always answers quickly; the synchronous auth machine runs
//!   on the blocking pool, and outgoing messages are sent from the handler
//!   after it returns

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

use crate::auth::{AuthMachine, SuspensionLedger};
use crate::channels::{Channel, LineChannel, SendMessage};
use crate::config::Config;
use crate::store::{IdentityStore, SqliteIdentityStore};

/// Maximum request body size (64KB) — prevents memory exhaustion
pub const MAX_BODY_SIZE: usize = 65_536;
/// Request timeout — webhook processing is quick, anything longer is abuse
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Shared state for all axum handlers
#[derive(Clone)]
pub struct AppState {
    pub machine: Arc<AuthMachine>,
    pub line: Arc<LineChannel>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(handle_health))
        .route("/line", post(handle_line_webhook))
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(REQUEST_TIMEOUT_SECS),
        ))
}

/// Open the stores, assemble the machine, and serve until shutdown.
pub async fn run_gateway(host: &str, port: u16, config: Config) -> Result<()> {
    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let display_addr = listener.local_addr()?;

    std::fs::create_dir_all(&config.storage.data_dir)?;
    let store: Arc<dyn IdentityStore> = Arc::new(SqliteIdentityStore::open(
        &config.storage.data_dir.join("members.db"),
    )?);
    let ledger = Arc::new(SuspensionLedger::open(
        &config.storage.data_dir.join("suspensions.db"),
    )?);
    let machine = Arc::new(AuthMachine::new(store, ledger, config.auth.clone()));
    let line = Arc::new(LineChannel::new(
        config.line.channel_access_token.clone(),
        config.line.channel_secret.clone(),
    ));

    if !line.health_check().await {
        tracing::warn!("LINE API not reachable at startup — check the channel access token");
    }

    let app = build_router(AppState { machine, line });

    tracing::info!("Gateway listening on http://{display_addr}");
    tracing::info!("  POST /line    — LINE message webhook");
    tracing::info!("  GET  /healthz — health check");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}

// ── Handlers ────────────────────────────────────────────────────────

/// GET /healthz — always public (no secrets leaked)
async fn handle_health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// POST /line — incoming LINE webhook
async fn handle_line_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let signature = headers
        .get("X-Line-Signature")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if !state.line.verify_signature(&body, signature) {
        tracing::warn!(
            "LINE webhook signature verification failed (signature: {})",
            if signature.is_empty() { "missing" } else { "invalid" }
        );
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"error": "Invalid signature"})),
        );
    }

    let Ok(payload) = serde_json::from_slice::<serde_json::Value>(&body) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "Invalid JSON payload"})),
        );
    };

    let messages = state.line.parse_webhook_payload(&payload);

    for msg in messages {
        tracing::info!(sender = %msg.sender, id = %msg.id, "LINE message received");

        // rusqlite work stays off the async runtime.
        let machine = Arc::clone(&state.machine);
        let sender = msg.sender.clone();
        let content = msg.content.clone();
        let outcome =
            match tokio::task::spawn_blocking(move || machine.handle(&sender, &content)).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!("Auth machine task panicked: {e}");
                    continue;
                }
            };

        // Prefer the free reply token; fall back to a push if it is spent
        // or missing.
        let replied = match msg.reply_token.as_deref() {
            Some(token) => match state.line.reply(token, &outcome.reply).await {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!("LINE reply failed, falling back to push: {e}");
                    false
                }
            },
            None => false,
        };
        if !replied {
            if let Err(e) = state
                .line
                .send(&SendMessage {
                    recipient: msg.sender.clone(),
                    content: outcome.reply.clone(),
                })
                .await
            {
                tracing::error!("Failed to answer LINE message: {e}");
            }
        }

        // Pushes target other devices (codes, replacement notices, alerts).
        for push in outcome.pushes {
            if let Err(e) = state
                .line
                .send(&SendMessage {
                    recipient: push.session_id.clone(),
                    content: push.text,
                })
                .await
            {
                tracing::error!(recipient = %push.session_id, "Failed to push LINE message: {e}");
            }
        }
    }

    // LINE retries on non-2xx; per-message failures are logged, not surfaced.
    (StatusCode::OK, Json(serde_json::json!({"status": "ok"})))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthConfig;
    use axum::body::Body;
    use axum::http::Request;
    use base64::Engine;
    use hmac::{Hmac, Mac};
    use sha2::Sha256;
    use tower::ServiceExt;

    const CHANNEL_SECRET: &str = "test_channel_secret";

    fn test_state() -> AppState {
        let store: Arc<dyn IdentityStore> = Arc::new(SqliteIdentityStore::new());
        let ledger = Arc::new(SuspensionLedger::new());
        AppState {
            machine: Arc::new(AuthMachine::new(store, ledger, AuthConfig::default())),
            line: Arc::new(LineChannel::new("token".into(), CHANNEL_SECRET.into())),
        }
    }

    fn sign(body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(CHANNEL_SECRET.as_bytes()).unwrap();
        mac.update(body);
        base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
    }

    #[tokio::test]
    async fn healthz_is_ok() {
        let app = build_router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn line_webhook_rejects_missing_signature() {
        let app = build_router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/line")
                    .body(Body::from(r#"{"events":[]}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn line_webhook_rejects_bad_signature() {
        let app = build_router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/line")
                    .header("X-Line-Signature", "bogus")
                    .body(Body::from(r#"{"events":[]}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn line_webhook_rejects_invalid_json() {
        let app = build_router(test_state());
        let body = b"not json".to_vec();
        let signature = sign(&body);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/line")
                    .header("X-Line-Signature", signature)
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn line_webhook_accepts_signed_empty_events() {
        let app = build_router(test_state());
        let body = br#"{"events":[]}"#.to_vec();
        let signature = sign(&body);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/line")
                    .header("X-Line-Signature", signature)
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn line_webhook_skips_non_message_events() {
        let app = build_router(test_state());
        let body = serde_json::json!({
            "events": [{
                "type": "follow",
                "source": { "type": "user", "userId": "U1" },
                "timestamp": 1_700_000_000_000_u64
            }]
        })
        .to_string()
        .into_bytes();
        let signature = sign(&body);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/line")
                    .header("X-Line-Signature", signature)
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
