use std::sync::Arc;

use cmma::{
    init_logging, log_app_start, log_app_stop, log_store_opened, logging_config_from_env,
    shutdown_signal, BybitClient, FetcherConfig, Ingestor, SqliteCandleStore,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start("fetcher", &logging_cfg);

    let cfg = FetcherConfig::from_env()?;
    let store = SqliteCandleStore::open(&cfg.db_path)?;
    store.ensure_schema(&cfg.timeframes)?;
    log_store_opened("fetcher", &cfg.db_path, false);

    let client = BybitClient::new(cfg.bybit.clone())?;
    let ingestor = Ingestor::new(Arc::new(client), Arc::new(store), cfg.ingest_settings());

    info!(
        component = "fetcher",
        event = "fetcher.configured",
        timeframes = ?cfg.timeframes.iter().map(|tf| tf.as_str()).collect::<Vec<_>>(),
        fetch_interval_seconds = cfg.fetch_interval_seconds,
        history_limit = cfg.history_limit,
        concurrency_limit = cfg.concurrency_limit,
        gap_fill = cfg.gap_fill.as_str(),
        base_url = %cfg.bybit.base_url
    );

    let cancel = CancellationToken::new();
    let signal = shutdown_signal();
    let signal_cancel = cancel.clone();
    let stop_reason = tokio::spawn(async move {
        let reason = signal.await;
        signal_cancel.cancel();
        reason
    });

    ingestor.run_scheduler(cfg.gap_fill, &cancel).await;
    log_app_stop("fetcher", stop_reason.await.unwrap_or("shutdown_signal"));
    Ok(())
}
