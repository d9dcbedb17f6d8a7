//! HTTP + WebSocket surface of the canvas.
//!
//! ```text
//!  GET  /board ──────────► SnapshotService ──► BoardStore::snapshot
//!  POST /update_pixel ───► UpdateService ──┬─► CooldownTracker
//!                                          ├─► BoardStore::set
//!                                          └─► BroadcastHub::publish
//!                                                   │ per-subscriber queues
//!  GET  /ws ─────────────► ConnectionManager ◄──────┘
//!  POST /token ──────────► SessionRegistry (when the built-in auth is used)
//! ```

use axum::extract::rejection::JsonRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;

use pixelboard_core::{BoardDimensions, BoardStore, CooldownTracker};

use crate::auth::{AuthError, Authenticator, Credential, Identity, SessionRegistry};
use crate::broadcast::{BroadcastHub, BroadcastStats};
use crate::connection::{ConnectionManager, ConnectionStats};
use crate::protocol::{
    BoardResponse, ErrorBody, TokenRequest, TokenResponse, UpdatePixelRequest,
    UpdatePixelResponse,
};
use crate::service::{ServiceError, SnapshotService, UpdateRequest, UpdateService};

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    pub board_width: u32,
    pub board_height: u32,
    /// Minimum time between two accepted updates of one user
    pub cooldown_secs: u64,
    /// Push messages buffered per viewer before new ones are dropped
    pub subscriber_queue_capacity: usize,
    /// Heartbeat ping interval on the push channel
    pub heartbeat_interval_secs: u64,
    /// Bound on credential validation and snapshot retrieval
    pub request_timeout_ms: u64,
    /// How often expired cooldown entries are swept
    pub cooldown_prune_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8000".to_string(),
            board_width: 100,
            board_height: 100,
            cooldown_secs: 5,
            subscriber_queue_capacity: 256,
            heartbeat_interval_secs: 30,
            request_timeout_ms: 5_000,
            cooldown_prune_interval_secs: 60,
        }
    }
}

impl ServerConfig {
    pub fn dimensions(&self) -> BoardDimensions {
        BoardDimensions::new(self.board_width, self.board_height)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.cooldown_prune_interval_secs.max(1))
    }
}

/// Server statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerStats {
    pub broadcast: BroadcastStats,
    pub connections: ConnectionStats,
    pub tracked_cooldowns: usize,
}

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared state handed to every request handler.
#[derive(Clone)]
struct AppState {
    updates: Arc<UpdateService>,
    snapshots: Arc<SnapshotService>,
    connections: Arc<ConnectionManager>,
    auth: Arc<dyn Authenticator>,
    sessions: Option<Arc<SessionRegistry>>,
    request_timeout: Duration,
}

/// The canvas server.
pub struct CanvasServer {
    config: ServerConfig,
    store: Arc<BoardStore>,
    cooldown: Arc<CooldownTracker>,
    hub: Arc<BroadcastHub>,
    connections: Arc<ConnectionManager>,
    state: AppState,
}

impl CanvasServer {
    /// Server using the built-in in-memory session registry.
    pub fn new(config: ServerConfig) -> Self {
        let sessions = Arc::new(SessionRegistry::new());
        Self::build(config, sessions.clone(), Some(sessions))
    }

    /// Server delegating credential checks to an external authenticator.
    /// `POST /token` is not mounted in this mode.
    pub fn with_authenticator(config: ServerConfig, auth: Arc<dyn Authenticator>) -> Self {
        Self::build(config, auth, None)
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    fn build(
        config: ServerConfig,
        auth: Arc<dyn Authenticator>,
        sessions: Option<Arc<SessionRegistry>>,
    ) -> Self {
        let store = Arc::new(BoardStore::new(config.dimensions()));
        let cooldown = Arc::new(CooldownTracker::new(config.cooldown()));
        let hub = Arc::new(BroadcastHub::new(config.subscriber_queue_capacity));
        let connections = Arc::new(ConnectionManager::new(
            hub.clone(),
            config.subscriber_queue_capacity,
            config.heartbeat_interval(),
        ));
        let updates = Arc::new(UpdateService::new(
            store.clone(),
            cooldown.clone(),
            hub.clone(),
            auth.clone(),
            config.request_timeout(),
        ));
        let snapshots = Arc::new(SnapshotService::new(
            store.clone(),
            auth.clone(),
            config.request_timeout(),
        ));
        let state = AppState {
            updates,
            snapshots,
            connections: connections.clone(),
            auth,
            sessions,
            request_timeout: config.request_timeout(),
        };
        Self {
            config,
            store,
            cooldown,
            hub,
            connections,
            state,
        }
    }

    /// All routes, ready to be served or merged into a larger router.
    pub fn router(&self) -> Router {
        let mut router = Router::new()
            .route("/board", get(get_board))
            .route("/update_pixel", post(update_pixel))
            .route("/ws", get(ws_handler))
            .route("/health", get(|| async { "ok" }));
        if self.state.sessions.is_some() {
            router = router.route("/token", post(issue_token));
        }
        router
            .layer(CorsLayer::permissive())
            .with_state(self.state.clone())
    }

    /// Bind `bind_addr` and serve until the process ends.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let dims = self.config.dimensions();
        log::info!(
            "Canvas server listening on {} ({}x{} board, {}s cooldown)",
            listener.local_addr()?,
            dims.width,
            dims.height,
            self.config.cooldown_secs
        );

        let pruner = tokio::spawn(prune_cooldowns(
            self.cooldown.clone(),
            self.config.prune_interval(),
        ));
        let result = axum::serve(listener, self.router()).await;
        pruner.abort();
        result.map_err(ServerError::from)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn store(&self) -> &Arc<BoardStore> {
        &self.store
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    /// The built-in session registry, if this server uses it.
    pub fn sessions(&self) -> Option<&Arc<SessionRegistry>> {
        self.state.sessions.as_ref()
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            broadcast: self.hub.stats(),
            connections: self.connections.stats(),
            tracked_cooldowns: self.cooldown.tracked_users(),
        }
    }
}

async fn prune_cooldowns(cooldown: Arc<CooldownTracker>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    loop {
        ticker.tick().await;
        cooldown.prune(tokio::time::Instant::now().into_std());
    }
}

// ─── Handlers ─────────────────────────────────────────────────────

fn bearer(headers: &HeaderMap) -> Option<Credential> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(Credential::from_authorization)
}

async fn get_board(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<BoardResponse>, ApiError> {
    let credential = bearer(&headers).ok_or(ServiceError::Unauthorized(AuthError::Missing))?;
    let snapshot = state.snapshots.get_snapshot(&credential).await?;
    Ok(Json(BoardResponse::from_snapshot(&snapshot)))
}

async fn update_pixel(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<UpdatePixelRequest>, JsonRejection>,
) -> Result<Json<UpdatePixelResponse>, ApiError> {
    let Json(body) = body.map_err(|rejection| {
        log::debug!("Rejected update body: {rejection}");
        ServiceError::InvalidRequest(format!("Malformed request: {}", rejection.body_text()))
    })?;
    let request = UpdateRequest::from_wire(body, bearer(&headers));
    let applied = state.updates.apply(request).await?;
    Ok(Json(UpdatePixelResponse::applied(applied.change)))
}

async fn issue_token(
    State(state): State<AppState>,
    body: Result<Json<TokenRequest>, JsonRejection>,
) -> Result<Json<TokenResponse>, ApiError> {
    let Json(body) = body.map_err(|rejection| {
        log::debug!("Rejected token body: {rejection}");
        ServiceError::InvalidRequest(format!("Malformed request: {}", rejection.body_text()))
    })?;
    let username = body.username.trim();
    if username.is_empty() {
        return Err(ServiceError::InvalidRequest("Username required".to_string()).into());
    }
    let Some(sessions) = state.sessions.as_ref() else {
        return Err(ServiceError::Unauthorized(AuthError::Unavailable(
            "token issuance disabled".to_string(),
        ))
        .into());
    };
    let (credential, identity) = sessions.issue(username);
    log::info!("Session issued for {username}");
    Ok(Json(TokenResponse {
        access_token: credential.token().to_string(),
        token_type: "bearer".to_string(),
        user_id: identity.user_id,
    }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    let credential = query
        .get("token")
        .map(|t| Credential::bearer(t.as_str()))
        .or_else(|| bearer(&headers));

    // Anonymous viewers may watch; a presented credential must be valid.
    let viewer: Option<Identity> = match credential {
        Some(credential) => {
            let limit = state.request_timeout;
            match tokio::time::timeout(limit, state.auth.authenticate(&credential)).await {
                Ok(result) => Some(result.map_err(ServiceError::from)?),
                Err(_) => return Err(ServiceError::Timeout(limit).into()),
            }
        }
        None => None,
    };

    let connections = state.connections.clone();
    let subscription = connections.subscribe();
    Ok(ws.on_upgrade(move |socket| async move {
        connections.serve(socket, subscription, viewer).await;
    }))
}

// ─── Error mapping ────────────────────────────────────────────────

/// HTTP rendering of a [`ServiceError`].
#[derive(Debug)]
pub struct ApiError(pub ServiceError);

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let detail = self.0.to_string();
        match self.0 {
            ServiceError::InvalidRequest(_) => {
                (StatusCode::BAD_REQUEST, Json(ErrorBody::new(detail))).into_response()
            }
            ServiceError::Unauthorized(AuthError::Unavailable(_)) | ServiceError::Timeout(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, Json(ErrorBody::new(detail))).into_response()
            }
            ServiceError::Unauthorized(_) => (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"))],
                Json(ErrorBody::new(detail)),
            )
                .into_response(),
            ServiceError::Forbidden(_) => {
                (StatusCode::FORBIDDEN, Json(ErrorBody::new(detail))).into_response()
            }
            ServiceError::RateLimited { retry_after } => {
                let body = ErrorBody {
                    detail,
                    retry_after: Some(retry_after.as_secs_f64()),
                };
                let whole_secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    [(header::RETRY_AFTER, HeaderValue::from(whole_secs))],
                    Json(body),
                )
                    .into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:8000");
        assert_eq!(config.dimensions(), BoardDimensions::new(100, 100));
        assert_eq!(config.cooldown(), Duration::from_secs(5));
        assert_eq!(config.subscriber_queue_capacity, 256);
        assert_eq!(config.heartbeat_interval_secs, 30);
        assert_eq!(config.request_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_server_config_partial_deserialize() {
        let config: ServerConfig =
            serde_json::from_str(r#"{"board_width": 10, "cooldown_secs": 1}"#).unwrap();
        assert_eq!(config.board_width, 10);
        assert_eq!(config.board_height, 100);
        assert_eq!(config.cooldown_secs, 1);
    }

    #[test]
    fn test_server_creation() {
        let server = CanvasServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:8000");
        assert!(server.sessions().is_some());
        assert_eq!(server.store().dimensions(), BoardDimensions::new(100, 100));
    }

    #[test]
    fn test_external_authenticator_has_no_registry() {
        let auth: Arc<dyn Authenticator> = Arc::new(SessionRegistry::new());
        let server = CanvasServer::with_authenticator(ServerConfig::default(), auth);
        assert!(server.sessions().is_none());
    }

    #[test]
    fn test_server_stats_initial() {
        let server = CanvasServer::with_defaults();
        let stats = server.stats();
        assert_eq!(stats.broadcast, BroadcastStats::default());
        assert_eq!(stats.connections.active_connections, 0);
        assert_eq!(stats.tracked_cooldowns, 0);
    }

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (ServiceError::InvalidRequest("Invalid color".into()), StatusCode::BAD_REQUEST),
            (ServiceError::Unauthorized(AuthError::Missing), StatusCode::UNAUTHORIZED),
            (ServiceError::Forbidden("u".into()), StatusCode::FORBIDDEN),
            (
                ServiceError::RateLimited {
                    retry_after: Duration::from_millis(1500),
                },
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (ServiceError::Timeout(Duration::from_secs(1)), StatusCode::SERVICE_UNAVAILABLE),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError(err).into_response().status(), status);
        }
    }

    #[test]
    fn test_retry_after_header_rounds_up() {
        let response = ApiError(ServiceError::RateLimited {
            retry_after: Duration::from_millis(1500),
        })
        .into_response();
        assert_eq!(response.headers()[header::RETRY_AFTER], "2");
    }
}
