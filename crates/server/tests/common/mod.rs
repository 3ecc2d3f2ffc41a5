use paircast_server::app::{build_router, AppState};
use paircast_server::config::{RateLimitConfig, RateLimitSettings, ServerConfig};
use paircast_server::reaper;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// Test instance on an ephemeral port backed by the in-memory store.
pub async fn spawn_server(config: ServerConfig) -> (SocketAddr, Arc<AppState>) {
    let state = AppState::init(config).await.expect("state");
    let router = build_router(Arc::clone(&state));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let _sweeper = reaper::spawn(Arc::clone(&state));
    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .expect("serve");
    });
    (addr, state)
}

/// Defaults with limits opened up so tests exercise behavior, not the
/// limiter.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        rate_limits: RateLimitConfig {
            register: RateLimitSettings {
                burst: 1_000,
                window: Duration::from_secs(60),
                penalty: Duration::ZERO,
            },
            connection: RateLimitSettings {
                burst: 10_000,
                window: Duration::from_secs(1),
                penalty: Duration::ZERO,
            },
        },
        ..ServerConfig::default()
    }
}

pub async fn register(
    client: &reqwest::Client,
    addr: SocketAddr,
    device_label: &str,
) -> paircast_proto::RegisterResponse {
    client
        .post(format!("http://{}/register", addr))
        .json(&serde_json::json!({ "device_label": device_label }))
        .send()
        .await
        .expect("register request")
        .json()
        .await
        .expect("register response")
}
