use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{Method, StatusCode},
    middleware,
    routing::{get, post},
    Json, Router,
};
use chatline_shared::api::{CallTokenResponse, NotifyRequest, NotifyResponse, SignUploadRequest, SignUploadResponse};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::rate_limit::{rate_limit_middleware, RateLimiter};
use crate::signing::sign_params;
use crate::token::CallTokenIssuer;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub http: reqwest::Client,
    /// `None` when no call server secret is configured.
    pub tokens: Option<Arc<CallTokenIssuer>>,
    pub rate_limiter: RateLimiter,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let tokens = match &config.call_server_secret {
            Some(secret) => Some(Arc::new(
                CallTokenIssuer::new(config.call_app_id.clone(), secret, config.call_token_ttl_secs)
                    .map_err(|e| ServerError::Internal(e.to_string()))?,
            )),
            None => None,
        };
        Ok(Self {
            rate_limiter: RateLimiter::new(config.rate_per_sec, config.rate_burst),
            config: Arc::new(config),
            http: reqwest::Client::new(),
            tokens,
        })
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    let api = Router::new()
        .route("/sign-upload", post(sign_upload))
        .route("/notify", post(notify))
        .route("/call-token", get(call_token));

    Router::new()
        .route("/health", get(health_check))
        .nest("/api", api)
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn sign_upload(
    State(state): State<AppState>,
    Json(req): Json<SignUploadRequest>,
) -> Result<Json<SignUploadResponse>, ServerError> {
    let config = &state.config;
    let secret = config
        .storage_api_secret
        .as_deref()
        .ok_or(ServerError::NotConfigured("Object storage"))?;

    let timestamp = chrono::Utc::now().timestamp();
    let folder = req
        .folder
        .filter(|f| !f.is_empty())
        .unwrap_or_else(|| config.upload_folder.clone());
    let public_id = req.public_id.filter(|p| !p.is_empty());

    let mut params = BTreeMap::from([
        ("timestamp", timestamp.to_string()),
        ("folder", folder.clone()),
    ]);
    if let Some(public_id) = &public_id {
        params.insert("public_id", public_id.clone());
    }
    let signature = sign_params(&params, secret);
    debug!(folder = %folder, "Signed upload");

    Ok(Json(SignUploadResponse {
        signature,
        timestamp,
        api_key: config.storage_api_key.clone(),
        cloud_name: config.storage_cloud_name.clone(),
        upload_url: config.upload_url(),
        folder: Some(folder),
        public_id,
    }))
}

fn notify_failure(status: StatusCode, error: impl Into<String>) -> (StatusCode, Json<NotifyResponse>) {
    (
        status,
        Json(NotifyResponse {
            success: false,
            notification_id: None,
            error: Some(error.into()),
        }),
    )
}

#[derive(Deserialize)]
struct ProviderResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    errors: Option<serde_json::Value>,
}

async fn notify(
    State(state): State<AppState>,
    Json(req): Json<NotifyRequest>,
) -> (StatusCode, Json<NotifyResponse>) {
    if req.receiver_id.as_str().is_empty() || req.title.trim().is_empty() {
        return notify_failure(StatusCode::BAD_REQUEST, "receiverId and title are required");
    }
    let config = &state.config;
    let (Some(app_id), Some(api_key)) = (&config.push_app_id, &config.push_api_key) else {
        return notify_failure(StatusCode::SERVICE_UNAVAILABLE, "Push provider is not configured");
    };

    let payload = json!({
        "app_id": app_id,
        "include_external_user_ids": [req.receiver_id],
        "headings": { "en": req.title },
        "contents": { "en": req.body },
        "data": { "chatId": req.chat_id },
    });
    let sent = state
        .http
        .post(&config.push_url)
        .header("Authorization", format!("Basic {api_key}"))
        .json(&payload)
        .send()
        .await;
    let response = match sent {
        Ok(response) => response,
        Err(e) => {
            warn!(error = %e, "Push provider unreachable");
            return notify_failure(StatusCode::BAD_GATEWAY, "Push provider unreachable");
        }
    };
    let status = response.status();
    let body: ProviderResponse = match response.json().await {
        Ok(body) => body,
        Err(e) => {
            warn!(error = %e, "Unreadable push provider response");
            return notify_failure(StatusCode::BAD_GATEWAY, "Unreadable push provider response");
        }
    };
    match (status.is_success(), body.id) {
        (true, Some(id)) if body.errors.is_none() => {
            info!(receiver = %req.receiver_id.short(), notification = %id, "Push dispatched");
            (
                StatusCode::OK,
                Json(NotifyResponse {
                    success: true,
                    notification_id: Some(id),
                    error: None,
                }),
            )
        }
        _ => {
            warn!(status = %status, errors = ?body.errors, "Push provider refused dispatch");
            notify_failure(StatusCode::BAD_GATEWAY, "Push provider refused dispatch")
        }
    }
}

#[derive(Deserialize)]
struct CallTokenQuery {
    #[serde(rename = "userID")]
    user_id: Option<String>,
}

async fn call_token(
    State(state): State<AppState>,
    Query(query): Query<CallTokenQuery>,
) -> Result<Json<CallTokenResponse>, ServerError> {
    let user_id = query
        .user_id
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| ServerError::BadRequest("userID is required".to_string()))?;
    let issuer = state
        .tokens
        .as_ref()
        .ok_or(ServerError::NotConfigured("Call token issuer"))?;
    let token = issuer
        .issue(&user_id, chrono::Utc::now().timestamp())
        .map_err(|e| ServerError::Internal(e.to_string()))?;
    debug!(user = %user_id, "Issued call token");
    Ok(Json(CallTokenResponse { token }))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}
