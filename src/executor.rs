use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug)]
pub struct BatchOutcome<C> {
    pub results: HashMap<String, Vec<C>>,
    pub failed: usize,
    pub empty: usize,
    pub not_started: usize,
}

impl<C> BatchOutcome<C> {
    fn new() -> Self {
        Self {
            results: HashMap::new(),
            failed: 0,
            empty: 0,
            not_started: 0,
        }
    }
}

enum TaskEnd<C, E> {
    Done(Result<Vec<C>, E>),
    NotStarted,
}

/// Runs `task` once per symbol with at most `limit` calls in flight and waits
/// for all of them. A `limit` of zero is treated as one.
pub async fn run_bounded<C, E, F, Fut>(
    label: &'static str,
    symbols: Vec<String>,
    limit: usize,
    cancel: &CancellationToken,
    task: F,
) -> BatchOutcome<C>
where
    C: Send + 'static,
    E: Display + Send + 'static,
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<C>, E>> + Send + 'static,
{
    let limit = limit.max(1);
    let semaphore = Arc::new(Semaphore::new(limit));
    let task = Arc::new(task);
    let submitted = symbols.len();
    let mut set = JoinSet::new();

    for symbol in symbols {
        let semaphore = Arc::clone(&semaphore);
        let task = Arc::clone(&task);
        let cancel = cancel.clone();
        set.spawn(async move {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = semaphore.acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                return (symbol, TaskEnd::NotStarted);
            };
            let result = task(symbol.clone()).await;
            drop(permit);
            (symbol, TaskEnd::Done(result))
        });
    }

    let mut outcome = BatchOutcome::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((symbol, TaskEnd::Done(Ok(rows)))) => {
                if rows.is_empty() {
                    outcome.empty += 1;
                } else {
                    outcome.results.insert(symbol, rows);
                }
            }
            Ok((symbol, TaskEnd::Done(Err(err)))) => {
                outcome.failed += 1;
                warn!(
                    component = "executor",
                    event = "executor.task.failed",
                    batch = label,
                    symbol = %symbol,
                    error = %err
                );
            }
            Ok((_, TaskEnd::NotStarted)) => outcome.not_started += 1,
            Err(err) => {
                outcome.failed += 1;
                warn!(
                    component = "executor",
                    event = "executor.task.panicked",
                    batch = label,
                    error = %err
                );
            }
        }
    }

    info!(
        component = "executor",
        event = "executor.batch.finish",
        batch = label,
        submitted,
        limit,
        succeeded = outcome.results.len(),
        empty = outcome.empty,
        failed = outcome.failed,
        not_started = outcome.not_started
    );
    outcome
}
