use paircast_server::hub::CloseReason;
use paircast_server::{app, config, reaper};
use std::env;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() {
    let log_filter = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .json()
        .init();

    let config = config::load_from_env().expect("configuration");
    let bind_addr = config.bind_addr;
    let state = app::AppState::init(config).await.expect("state");

    let sweeper = reaper::spawn(state.clone());
    let router = app::build_router(state.clone());

    let listener = TcpListener::bind(bind_addr).await.expect("bind");
    info!(address = %bind_addr, "paircast signaling server listening");
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .expect("serve");

    // Drain: nothing new is accepted past this point; tell the
    // subscribers they should reconnect elsewhere and stop the sweeper.
    state.hub.close_all(CloseReason::GoingAway).await;
    sweeper.abort();
    info!("shutdown complete");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("ctrl-c handler");
    };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("signal handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}
