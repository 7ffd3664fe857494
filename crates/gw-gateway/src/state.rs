use std::sync::Arc;

use gw_admission::limiter::{ConcurrencyLimiter, SlidingWindowLimiter};
use gw_domain::Config;
use gw_pool::pool::ProcessPool;
use gw_providers::cla::ClaBackend;
use gw_providers::proxy::{ProxyBackend, ProxyConfig};
use gw_sessions::SessionRegistry;

/// Shared application state passed to every route handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub sessions: Arc<SessionRegistry>,
    pub pool: Arc<ProcessPool>,
    pub cla: Arc<ClaBackend>,
    pub proxy: Arc<ProxyBackend>,

    pub ip_limiter: Arc<SlidingWindowLimiter>,
    pub key_limiter: Arc<SlidingWindowLimiter>,
    pub session_limiter: Arc<SlidingWindowLimiter>,
    pub key_concurrency: Arc<ConcurrencyLimiter>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let config = Arc::new(config);

        let sessions = Arc::new(SessionRegistry::new(
            std::time::Duration::from_secs(config.session.ttl_secs),
            std::time::Duration::from_secs(config.session.max_age_secs),
        ));
        let pool = Arc::new(ProcessPool::new(
            config.pool.max_concurrent,
            std::time::Duration::from_secs(config.pool.queue_timeout_secs),
            std::time::Duration::from_secs(config.pool.shutdown_timeout_secs),
        ));
        let cla = Arc::new(ClaBackend::new(
            config.cla.binary_path.clone(),
            sessions.clone(),
            pool.clone(),
        ));
        let proxy = Arc::new(ProxyBackend::new(ProxyConfig {
            enabled: config.proxy.enabled,
            base_url: config.proxy.base_url.clone(),
            api_key: config.proxy.api_key.clone(),
            allow_client_key: config.proxy.allow_client_key,
        }));

        let window = std::time::Duration::from_secs(config.rate_limit.window_secs);
        let ip_limiter = Arc::new(SlidingWindowLimiter::new(config.rate_limit.per_ip_limit, window));
        let key_limiter = Arc::new(SlidingWindowLimiter::new(config.rate_limit.per_key_limit, window));
        let session_limiter = Arc::new(SlidingWindowLimiter::new(
            config.rate_limit.per_session_limit,
            window,
        ));
        let key_concurrency = Arc::new(ConcurrencyLimiter::new(
            config.rate_limit.max_concurrent_per_key,
        ));

        Self {
            config,
            sessions,
            pool,
            cla,
            proxy,
            ip_limiter,
            key_limiter,
            session_limiter,
            key_concurrency,
        }
    }
}
