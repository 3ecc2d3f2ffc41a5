pub mod ws;

use crate::config::ServerConfig;
use crate::hub::SubscriptionHub;
use crate::mailbox::{MailboxError, MailboxService};
use crate::metrics::Metrics;
use crate::registry::{RegistryError, SessionRegistry};
use crate::rendezvous::{RendezvousError, RendezvousRegistry};
use crate::security::limiter::{RateLimiter, RateScope};
use crate::util::{generate_correlation_id, redact};
use axum::body::Bytes;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::URL_SAFE_NO_PAD as BASE64_URL;
use base64::Engine;
use paircast_crypto::PairingLink;
use paircast_proto::{
    ConnectionInitRequest, ConnectionInitResponse, ConnectionJoinRequest, ConnectionJoinResponse,
    ErrorBody, HealthResponse, HeartbeatRequest, HeartbeatResponse, MailboxRecvRequest,
    MailboxRecvResponse, MailboxSendRequest, RegisterRequest, RegisterResponse,
    SessionCloseRequest, MAX_CIPHERTEXT_LEN,
};
use paircast_storage::{MailboxLimits, MemoryStore, RedisStore, StorageError, Store};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

const MAX_DEVICE_LABEL_CHARS: usize = 64;
const MAX_ID_CHARS: usize = 128;

pub struct AppState {
    pub config: ServerConfig,
    pub store: Arc<dyn Store>,
    pub registry: SessionRegistry,
    pub rendezvous: RendezvousRegistry,
    pub mailboxes: MailboxService,
    pub hub: Arc<SubscriptionHub>,
    pub metrics: Arc<Metrics>,
    pub rate_limits: RateLimiter,
}

impl AppState {
    /// Builds the whole application context: store connection, fan-out
    /// hub, registries, limiter. The reaper is spawned separately so
    /// shutdown can abort it.
    pub async fn init(config: ServerConfig) -> Result<Arc<Self>, StorageError> {
        let limits = MailboxLimits {
            max_queue_len: config.max_queue_len,
            idle_extension: config.mailbox_idle_extension,
            max_lifetime: config.mailbox_max_lifetime,
        };
        let store: Arc<dyn Store> = match config.redis_url.as_deref() {
            Some(url) => {
                let connection = paircast_storage::connect_redis(url).await?;
                info!("connected to redis backing store");
                Arc::new(RedisStore::new(connection, &config.redis_key_prefix, limits))
            }
            None => {
                info!("no redis url configured, using in-memory store");
                Arc::new(MemoryStore::new(limits))
            }
        };
        store.ping().await?;

        let metrics = Arc::new(Metrics::new());
        let hub = Arc::new(SubscriptionHub::new(
            config.subscriber_channel_capacity,
            config.max_subscribers_per_mailbox,
            Arc::clone(&metrics),
        ));
        let registry = SessionRegistry::new(
            Arc::clone(&store),
            config.session_idle_ttl,
            config.heartbeat_interval,
            config.max_sessions,
        );
        let rendezvous = RendezvousRegistry::new(Arc::clone(&store), config.rendezvous_ttl);
        let mailboxes = MailboxService::new(
            Arc::clone(&store),
            Arc::clone(&hub),
            Arc::clone(&metrics),
            config.mailbox_ttl,
        );
        let rate_limits = RateLimiter::new(&config.rate_limits);

        Ok(Arc::new(Self {
            config,
            store,
            registry,
            rendezvous,
            mailboxes,
            hub,
            metrics,
            rate_limits,
        }))
    }
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized,
    NotFound,
    Conflict(&'static str),
    PayloadTooLarge,
    RateLimited(Duration),
    Timeout,
    Unavailable,
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::Timeout => StatusCode::REQUEST_TIMEOUT,
            Self::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn title(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "BadRequest",
            Self::Unauthorized => "Unauthorized",
            Self::NotFound => "NotFound",
            Self::Conflict(_) => "Conflict",
            Self::PayloadTooLarge => "PayloadTooLarge",
            Self::RateLimited(_) => "RateLimited",
            Self::Timeout => "RequestTimeout",
            Self::Unavailable => "ServiceUnavailable",
            Self::Internal(_) => "InternalError",
        }
    }

    fn internal(context: &str) -> Self {
        let correlation_id = generate_correlation_id(context);
        error!(%correlation_id, context, "internal error");
        Self::Internal(correlation_id)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            title: self.title().to_string(),
            status: status.as_u16(),
            detail: match &self {
                Self::BadRequest(detail) => Some(detail.clone()),
                Self::Conflict(detail) => Some((*detail).to_string()),
                _ => None,
            },
            correlation_id: match &self {
                Self::Internal(id) => Some(id.clone()),
                _ => None,
            },
        };
        let mut response = (status, Json(body)).into_response();
        if let Self::RateLimited(retry_after) = self {
            response.headers_mut().insert(
                "retry-after",
                HeaderValue::from(retry_after.as_secs().max(1)),
            );
        }
        response
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::AuthFailed => Self::Unauthorized,
            RegistryError::Capacity => Self::Unavailable,
            RegistryError::Store(err) => err.into(),
        }
    }
}

impl From<RendezvousError> for ApiError {
    fn from(err: RendezvousError) -> Self {
        match err {
            RendezvousError::TokenUnknown => Self::NotFound,
            RendezvousError::Duplicate => Self::Conflict("rendezvous token already registered"),
            RendezvousError::Store(err) => err.into(),
        }
    }
}

impl From<MailboxError> for ApiError {
    fn from(err: MailboxError) -> Self {
        match err {
            MailboxError::Gone => Self::NotFound,
            MailboxError::Full => Self::Conflict("mailbox queue full"),
            MailboxError::ParticipantLimit => Self::Conflict("participant limit exceeded"),
            MailboxError::Store(err) => err.into(),
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Unavailable => Self::Unavailable,
            StorageError::Missing => Self::NotFound,
            StorageError::QueueFull => Self::Conflict("mailbox queue full"),
            StorageError::ParticipantLimit => Self::Conflict("participant limit exceeded"),
            StorageError::AlreadyExists => Self::Conflict("record already exists"),
            StorageError::Serialization => Self::internal("storage serialization"),
        }
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/metrics", get(metrics_text))
        .route("/register", post(register))
        .route("/heartbeat", post(heartbeat))
        .route("/session/close", post(session_close))
        .route("/connection/init", post(connection_init))
        .route("/connection/join", post(connection_join))
        .route("/connection/send", post(connection_send))
        .route("/connection/recv", post(connection_recv))
        .route("/ws/:mailbox_id", get(ws::upgrade))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            deadline,
        ))
        .layer(middleware::from_fn(access_log))
        .with_state(state)
}

/// Every request gets a server-side deadline; WebSocket upgrades are
/// exempt because the subscribe loop is long-lived by design.
async fn deadline(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    if request.uri().path().starts_with("/ws/") {
        return next.run(request).await;
    }
    match tokio::time::timeout(state.config.request_deadline, next.run(request)).await {
        Ok(response) => response,
        Err(_) => ApiError::Timeout.into_response(),
    }
}

async fn access_log(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();
    let response = next.run(request).await;
    info!(
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = started.elapsed().as_millis() as u64,
        "request"
    );
    response
}

async fn root() -> impl IntoResponse {
    (StatusCode::OK, "paircast signaling server")
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let status = match state.store.ping().await {
        Ok(()) => "ok",
        Err(_) => "degraded",
    };
    Json(HealthResponse {
        status: status.to_string(),
    })
}

async fn metrics_text(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.encode_prometheus(),
    )
}

fn parse_json<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|_| ApiError::BadRequest("invalid JSON payload".to_string()))
}

async fn check_rate(state: &AppState, scope: RateScope, key: &str) -> Result<(), ApiError> {
    let decision = state.rate_limits.check(scope, key).await;
    if decision.allowed {
        return Ok(());
    }
    state.metrics.mark_rate_limited();
    Err(ApiError::RateLimited(
        decision.retry_after.unwrap_or(Duration::from_secs(1)),
    ))
}

/// Mailbox references and rendezvous tokens are base64url or hex on the
/// wire; anything outside that alphabet is a schema violation, and the
/// store relies on it never reaching a record.
fn validate_token_shape(raw: &str, field: &'static str) -> Result<(), ApiError> {
    if raw.is_empty() || raw.len() > MAX_ID_CHARS {
        return Err(ApiError::BadRequest(format!("{} length invalid", field)));
    }
    let valid = raw
        .bytes()
        .all(|byte| byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_');
    if !valid {
        return Err(ApiError::BadRequest(format!(
            "{} has invalid characters",
            field
        )));
    }
    Ok(())
}

/// The payload is opaque but its transport encoding is declared base64;
/// both the standard and url-safe alphabets are accepted, nothing else.
fn validate_ciphertext(raw: &str) -> Result<(), ApiError> {
    if raw.is_empty() {
        return Err(ApiError::BadRequest("ciphertext_b64 is empty".to_string()));
    }
    if raw.len() > MAX_CIPHERTEXT_LEN {
        return Err(ApiError::PayloadTooLarge);
    }
    let valid = raw.bytes().all(|byte| {
        byte.is_ascii_alphanumeric() || matches!(byte, b'+' | b'/' | b'=' | b'-' | b'_')
    });
    if !valid {
        return Err(ApiError::BadRequest(
            "ciphertext_b64 is not base64".to_string(),
        ));
    }
    Ok(())
}

async fn register(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    check_rate(&state, RateScope::Register, &addr.ip().to_string()).await?;
    let request: RegisterRequest = parse_json(&body)?;
    let device_label = request.device_label.trim();
    if device_label.chars().count() > MAX_DEVICE_LABEL_CHARS {
        return Err(ApiError::BadRequest("device_label too long".to_string()));
    }
    let session = state
        .registry
        .register(device_label, request.heartbeat_interval_secs)
        .await?;
    state.metrics.incr_sessions();
    Ok((
        StatusCode::OK,
        Json(RegisterResponse {
            client_id: session.client_id,
            session_token: session.session_token,
            heartbeat_interval_secs: session.heartbeat_interval_secs,
            display_name: session.display_name,
        }),
    ))
}

async fn heartbeat(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let request: HeartbeatRequest = parse_json(&body)?;
    check_rate(&state, RateScope::Connection, &request.client_id.to_string()).await?;
    let next_heartbeat_secs = state
        .registry
        .heartbeat(&request.client_id, &request.session_token)
        .await
        .map_err(|err| {
            if matches!(err, RegistryError::AuthFailed) {
                state.metrics.mark_auth_failure();
            }
            ApiError::from(err)
        })?;
    state.metrics.mark_heartbeat();
    Ok(Json(HeartbeatResponse { next_heartbeat_secs }))
}

async fn session_close(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let request: SessionCloseRequest = parse_json(&body)?;
    check_rate(&state, RateScope::Connection, &request.client_id.to_string()).await?;
    state
        .registry
        .close(&request.client_id, &request.session_token)
        .await?;
    state.metrics.decr_sessions(1);
    Ok((StatusCode::OK, Json(json!({}))))
}

async fn connection_init(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let request: ConnectionInitRequest = parse_json(&body)?;
    check_rate(&state, RateScope::Connection, &request.client_id.to_string()).await?;
    state
        .registry
        .authenticate(&request.client_id, &request.session_token)
        .await
        .map_err(|err| {
            if matches!(err, RegistryError::AuthFailed) {
                state.metrics.mark_auth_failure();
            }
            ApiError::from(err)
        })?;
    validate_token_shape(&request.rendezvous_id_b64, "rendezvous_id_b64")?;
    if BASE64_URL.decode(&request.rendezvous_id_b64).is_err() {
        return Err(ApiError::BadRequest(
            "rendezvous_id_b64 is not base64url".to_string(),
        ));
    }

    let header = state
        .mailboxes
        .create(Some(&request.client_id.to_string()))
        .await?;
    if let Err(err) = state
        .rendezvous
        .create(
            &request.rendezvous_id_b64,
            &header.mailbox_id,
            &request.client_id.to_string(),
        )
        .await
    {
        // The mailbox is unreachable without its token; take it back.
        let _ = state.mailboxes.delete(&header.mailbox_id).await;
        return Err(err.into());
    }

    let share_url = state
        .config
        .public_url
        .as_deref()
        .map(|base| PairingLink::compose_public(base, &request.rendezvous_id_b64));
    Ok((
        StatusCode::OK,
        Json(ConnectionInitResponse {
            mailbox_id: header.mailbox_id,
            expires_at_epoch_ms: header.expires_at_epoch_ms,
            share_url,
        }),
    ))
}

async fn connection_join(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let request: ConnectionJoinRequest = parse_json(&body)?;
    check_rate(&state, RateScope::Connection, &addr.ip().to_string()).await?;
    validate_token_shape(&request.token_b64, "token_b64")?;

    // An authenticated joiner is recorded under its client id; an
    // anonymous one under its own mailbox reference.
    let authenticated = match (&request.client_id, &request.session_token) {
        (Some(client_id), Some(token)) => {
            state
                .registry
                .authenticate(client_id, token)
                .await
                .map_err(|err| {
                    if matches!(err, RegistryError::AuthFailed) {
                        state.metrics.mark_auth_failure();
                    }
                    ApiError::from(err)
                })?;
            Some(client_id.to_string())
        }
        _ => None,
    };

    debug!(token = %redact(&request.token_b64), "rendezvous claim attempt");
    let claim = state.rendezvous.claim(&request.token_b64).await?;
    state.metrics.mark_token_claimed();
    let owner_header = state.mailboxes.verify(&claim.owner_mailbox_id).await?;
    if owner_header.participants.len() >= 2 {
        return Err(ApiError::Conflict("rendezvous token consumed"));
    }

    let joiner_header = state.mailboxes.create(authenticated.as_deref()).await?;
    let participant = authenticated.unwrap_or_else(|| joiner_header.mailbox_id.clone());
    state
        .mailboxes
        .add_participant(&claim.owner_mailbox_id, &participant)
        .await?;

    Ok((
        StatusCode::OK,
        Json(ConnectionJoinResponse {
            mailbox_id: claim.owner_mailbox_id,
            peer_mailbox_id: joiner_header.mailbox_id,
            expires_at_epoch_ms: owner_header.expires_at_epoch_ms,
        }),
    ))
}

async fn connection_send(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let request: MailboxSendRequest = parse_json(&body)?;
    check_rate(&state, RateScope::Connection, &addr.ip().to_string()).await?;
    validate_token_shape(&request.mailbox_id, "mailbox_id")?;
    validate_token_shape(&request.from_mailbox_id, "from_mailbox_id")?;
    validate_ciphertext(&request.ciphertext_b64)?;
    state
        .mailboxes
        .append(
            &request.mailbox_id,
            &request.from_mailbox_id,
            &request.ciphertext_b64,
        )
        .await?;
    Ok(StatusCode::ACCEPTED)
}

async fn connection_recv(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let request: MailboxRecvRequest = parse_json(&body)?;
    check_rate(&state, RateScope::Connection, &addr.ip().to_string()).await?;
    validate_token_shape(&request.mailbox_id, "mailbox_id")?;
    let messages = state.mailboxes.read_all(&request.mailbox_id).await?;
    Ok(Json(MailboxRecvResponse { messages }))
}
