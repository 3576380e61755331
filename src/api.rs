//! REST API server for the custody bridge
//!
//! Exposes the saga orchestrator via HTTP endpoints
//! Integrates with front-end collaborators

use axum::{extract::State, http::StatusCode, routing::get, routing::post, Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::models::{FinancialIntent, IntentKind};
use crate::orchestrator::BridgeOrchestrator;

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct IntentRequest {
    pub action: String,
    pub user_id: Option<String>,
    #[serde(default)]
    pub amount: f64,
    pub login: Option<String>,
    pub password: Option<String>,
}

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<BridgeOrchestrator>,
}

/// =============================
/// Helpers — Identifier Parsing
/// =============================

fn stable_uuid_from_string(input: &str) -> uuid::Uuid {
    use sha2::{Digest, Sha256};

    let hash = Sha256::digest(input.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&hash[..16]);

    // Set UUID version (4) and variant (RFC4122) bits.
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;

    uuid::Uuid::from_bytes(bytes)
}

fn parse_or_stable_uuid(value: Option<&str>, fallback_seed: &str) -> uuid::Uuid {
    match value {
        Some(v) if !v.trim().is_empty() => {
            uuid::Uuid::parse_str(v).unwrap_or_else(|_| stable_uuid_from_string(v))
        }
        _ => stable_uuid_from_string(fallback_seed),
    }
}

fn parse_action(action: &str) -> Option<IntentKind> {
    match action.to_lowercase().as_str() {
        "deposit" => Some(IntentKind::Deposit),
        "withdraw" | "withdrawal" => Some(IntentKind::Withdraw),
        "create_account" | "create-account" | "register" => Some(IntentKind::CreateAccount),
        _ => None,
    }
}

/// =============================
/// Health Endpoint
/// =============================

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Intent Endpoint
/// =============================

async fn run_intent(
    State(state): State<ApiState>,
    Json(req): Json<IntentRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    info!("Received intent request: {}", req.action);

    let Some(kind) = parse_action(&req.action) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error(format!(
                "unknown action '{}'",
                req.action
            ))),
        );
    };

    let user_id = parse_or_stable_uuid(req.user_id.as_deref(), "anonymous-user");

    let intent = match kind {
        IntentKind::Deposit => FinancialIntent::deposit(user_id, req.amount),
        IntentKind::Withdraw => FinancialIntent::withdraw(user_id, req.amount),
        IntentKind::CreateAccount => FinancialIntent::create_account(
            user_id,
            req.login.unwrap_or_default(),
            req.password.unwrap_or_default(),
            req.amount,
        ),
    };

    let outcome = state.orchestrator.handle(intent).await;
    let status = if outcome.success {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    };
    let response = if outcome.success {
        ApiResponse::success(&outcome)
    } else {
        ApiResponse {
            success: false,
            data: serde_json::to_value(&outcome).ok(),
            error: Some(outcome.message.clone()),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    };
    (status, Json(response))
}

/// =============================
/// Reconciliation Review Endpoint
/// =============================

async fn pending_reviews(State(state): State<ApiState>) -> (StatusCode, Json<ApiResponse>) {
    let cases = state.orchestrator.archive().pending_reviews().await;
    (StatusCode::OK, Json(ApiResponse::success(cases)))
}

/// =============================
/// Router
/// =============================

pub fn create_router(orchestrator: Arc<BridgeOrchestrator>) -> Router {
    let state = ApiState { orchestrator };

    Router::new()
        .route("/health", get(health))
        .route("/api/intent", post(run_intent))
        .route("/api/reviews", get(pending_reviews))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    orchestrator: Arc<BridgeOrchestrator>,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(orchestrator);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_uuid_is_deterministic() {
        let a = stable_uuid_from_string("telegram:12345");
        let b = stable_uuid_from_string("telegram:12345");
        assert_eq!(a, b);
        assert_ne!(a, stable_uuid_from_string("telegram:12346"));
    }

    #[test]
    fn test_parse_or_stable_uuid_accepts_real_uuid() {
        let id = uuid::Uuid::new_v4();
        assert_eq!(parse_or_stable_uuid(Some(&id.to_string()), "seed"), id);
    }

    #[test]
    fn test_parse_action_aliases() {
        assert_eq!(parse_action("Deposit"), Some(IntentKind::Deposit));
        assert_eq!(parse_action("withdrawal"), Some(IntentKind::Withdraw));
        assert_eq!(
            parse_action("create-account"),
            Some(IntentKind::CreateAccount)
        );
        assert_eq!(parse_action("dance"), None);
    }
}
