use anyhow::Context;
use tracing_subscriber::EnvFilter;

use gw_domain::config::Config;
use gw_gateway::routes;
use gw_gateway::state::AppState;
use gw_sessions::spawn_sweeper;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.toml".to_string());
    let config = Config::load_or_default(&config_path);
    init_tracing(&config);

    tracing::info!(path = %config_path, "gateway starting");

    let state = AppState::new(config);

    tracing::info!(
        max_concurrent = state.config.pool.max_concurrent,
        "process pool ready"
    );
    tracing::info!(
        ttl_secs = state.config.session.ttl_secs,
        max_age_secs = state.config.session.max_age_secs,
        "session registry ready"
    );
    if state.config.proxy.enabled {
        tracing::info!(base_url = %state.config.proxy.base_url, "upstream passthrough enabled");
    } else {
        tracing::info!("upstream passthrough disabled");
    }

    let sweeper = spawn_sweeper(
        state.sessions.clone(),
        std::time::Duration::from_secs(state.config.session.sweep_interval_secs),
    );

    let app = routes::router(state.clone());
    let addr = format!("{}:{}", state.config.server.host, state.config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;

    tracing::info!(addr = %addr, "gateway listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("axum server error")?;

    sweeper.abort();

    let pool = state.pool.clone();
    let shutdown_timeout = std::time::Duration::from_secs(state.config.pool.shutdown_timeout_secs);
    match tokio::time::timeout(shutdown_timeout * 2, pool.drain_all()).await {
        Ok(()) => tracing::info!("process pool drained"),
        Err(_) => tracing::warn!("process pool drain timed out, exiting anyway"),
    }
    state.sessions.destroy();

    Ok(())
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.logging.filter.clone()));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if config.logging.json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("shutdown signal received");
}
