use std::sync::Arc;

use cmma::{
    api_router, init_logging, log_app_bind, log_app_start, log_app_stop, log_cache_configured,
    log_store_opened, logging_config_from_env, shutdown_signal, ApiConfig, SnapshotCache,
    SqliteCandleStore,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start("api_server", &logging_cfg);

    let cfg = ApiConfig::from_env()?;
    let store = SqliteCandleStore::open_reader(&cfg.db_path)?;
    log_store_opened("api_server", &cfg.db_path, true);

    let cache = SnapshotCache::new(Arc::new(store), cfg.history_limit, cfg.refresh_every);
    log_cache_configured(cache.history_limit(), cache.refresh_every());

    let app = api_router(cache.clone());
    let listener = tokio::net::TcpListener::bind(cfg.addr).await?;
    let bound_addr = listener.local_addr()?;

    log_app_bind(bound_addr);
    let (reason_tx, reason_rx) = tokio::sync::oneshot::channel();
    let signal = shutdown_signal();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = reason_tx.send(signal.await);
        })
        .await?;

    cache.shutdown();
    log_app_stop("api_server", reason_rx.await.unwrap_or("shutdown_signal"));
    Ok(())
}
