//! Bounded-concurrency fan-out for nodes that process many items.

use flowcore::NodeError;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;

pub const DEFAULT_CONCURRENCY: usize = 10;
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkOptions {
    pub concurrency: usize,
    pub operation_timeout: Option<Duration>,
    pub maintain_order: bool,
    pub fail_fast: bool,
}

impl Default for ChunkOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            operation_timeout: Some(DEFAULT_OPERATION_TIMEOUT),
            maintain_order: true,
            fail_fast: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ItemResult<R> {
    pub index: usize,
    pub outcome: Result<R, NodeError>,
}

impl<R> ItemResult<R> {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Process `items` with at most `concurrency` in flight. A new item starts as
/// soon as one finishes. With `fail_fast`, no new items start after the first
/// failure but in-flight items are drained. Unordered results arrive in
/// completion order; ordered results are sorted by item index.
pub async fn process_in_chunks<T, R, F, Fut>(
    items: Vec<T>,
    processor: F,
    options: ChunkOptions,
) -> Vec<ItemResult<R>>
where
    F: Fn(T, usize) -> Fut,
    Fut: Future<Output = Result<R, NodeError>>,
{
    let concurrency = options.concurrency.max(1);
    let mut queue = items.into_iter().enumerate();
    let mut in_flight = FuturesUnordered::new();
    let mut results = Vec::new();
    let mut stopped = false;

    loop {
        while !stopped && in_flight.len() < concurrency {
            let Some((index, item)) = queue.next() else {
                break;
            };
            in_flight.push(with_timeout(index, processor(item, index), options.operation_timeout));
        }

        let Some(result) = in_flight.next().await else {
            break;
        };
        if options.fail_fast && !result.is_ok() && !stopped {
            tracing::debug!("Item {} failed, no further items will start", result.index);
            stopped = true;
        }
        results.push(result);
    }

    if options.maintain_order {
        results.sort_by_key(|r| r.index);
    }
    results
}

async fn with_timeout<R, Fut>(index: usize, fut: Fut, limit: Option<Duration>) -> ItemResult<R>
where
    Fut: Future<Output = Result<R, NodeError>>,
{
    let outcome = match limit {
        Some(limit) => match timeout(limit, fut).await {
            Ok(outcome) => outcome,
            Err(_) => Err(NodeError::Timeout {
                ms: limit.as_millis() as u64,
            }),
        },
        None => fut.await,
    };
    ItemResult { index, outcome }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Strategy {
    /// Every item must succeed
    All,
    /// First item to settle wins
    Race,
    /// Run everything, report per-item status
    #[default]
    AllSettled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrategyConfig {
    pub strategy: Strategy,
    pub concurrency: usize,
    pub operation_timeout: Option<Duration>,
    /// Bounds the whole strategy run, independent of per-item timeouts
    pub global_timeout: Option<Duration>,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::default(),
            concurrency: DEFAULT_CONCURRENCY,
            operation_timeout: Some(DEFAULT_OPERATION_TIMEOUT),
            global_timeout: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StrategyOutcome<R> {
    All(Vec<R>),
    Race(ItemResult<R>),
    AllSettled(Vec<ItemResult<R>>),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StrategyError {
    #[error("{} of {total} items failed; first: {}", failures.len(), first_failure(failures))]
    AllFailed {
        failures: Vec<(usize, NodeError)>,
        total: usize,
    },

    #[error("Strategy timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("No items to race")]
    Empty,
}

fn first_failure(failures: &[(usize, NodeError)]) -> String {
    failures
        .first()
        .map(|(index, err)| format!("item {}: {}", index, err))
        .unwrap_or_default()
}

impl From<StrategyError> for NodeError {
    fn from(err: StrategyError) -> Self {
        match err {
            StrategyError::Timeout { ms } => NodeError::Timeout { ms },
            other => NodeError::ExecutionFailed(other.to_string()),
        }
    }
}

pub async fn execute_strategy<T, R, F, Fut>(
    items: Vec<T>,
    processor: F,
    config: StrategyConfig,
) -> Result<StrategyOutcome<R>, StrategyError>
where
    F: Fn(T, usize) -> Fut,
    Fut: Future<Output = Result<R, NodeError>>,
{
    let options = ChunkOptions {
        concurrency: config.concurrency,
        operation_timeout: config.operation_timeout,
        maintain_order: true,
        fail_fast: false,
    };

    let run = async move {
        match config.strategy {
            Strategy::All => {
                let total = items.len();
                let results = process_in_chunks(
                    items,
                    processor,
                    ChunkOptions {
                        fail_fast: true,
                        ..options
                    },
                )
                .await;

                let mut values = Vec::with_capacity(results.len());
                let mut failures = Vec::new();
                for result in results {
                    match result.outcome {
                        Ok(value) => values.push(value),
                        Err(err) => failures.push((result.index, err)),
                    }
                }
                if failures.is_empty() {
                    Ok(StrategyOutcome::All(values))
                } else {
                    Err(StrategyError::AllFailed { failures, total })
                }
            }
            Strategy::Race => race(items, processor, options).await.map(StrategyOutcome::Race),
            Strategy::AllSettled => Ok(StrategyOutcome::AllSettled(
                process_in_chunks(items, processor, options).await,
            )),
        }
    };

    match config.global_timeout {
        Some(limit) => timeout(limit, run).await.unwrap_or(Err(StrategyError::Timeout {
            ms: limit.as_millis() as u64,
        })),
        None => run.await,
    }
}

/// The first started item to settle, success or failure. The rest are dropped.
async fn race<T, R, F, Fut>(
    items: Vec<T>,
    processor: F,
    options: ChunkOptions,
) -> Result<ItemResult<R>, StrategyError>
where
    F: Fn(T, usize) -> Fut,
    Fut: Future<Output = Result<R, NodeError>>,
{
    let mut in_flight: FuturesUnordered<_> = items
        .into_iter()
        .enumerate()
        .take(options.concurrency.max(1))
        .map(|(index, item)| with_timeout(index, processor(item, index), options.operation_timeout))
        .collect();

    in_flight.next().await.ok_or(StrategyError::Empty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::time::sleep;

    fn delayed(ms: u64, value: u32) -> impl Future<Output = Result<u32, NodeError>> {
        async move {
            sleep(Duration::from_millis(ms)).await;
            Ok(value)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_is_bounded() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let results = process_in_chunks(
            (0..10).collect::<Vec<u32>>(),
            |item, _| {
                let active = active.clone();
                let peak = peak.clone();
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    sleep(Duration::from_millis(10)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(item * 2)
                }
            },
            ChunkOptions {
                concurrency: 3,
                ..ChunkOptions::default()
            },
        )
        .await;

        assert_eq!(results.len(), 10);
        assert!(peak.load(Ordering::SeqCst) <= 3);
        let values: Vec<u32> = results.into_iter().map(|r| r.outcome.unwrap()).collect();
        assert_eq!(values, (0..10).map(|i| i * 2).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unordered_results_follow_completion() {
        let results = process_in_chunks(
            vec![30u64, 10, 20],
            |ms, index| delayed(ms, index as u32),
            ChunkOptions {
                maintain_order: false,
                ..ChunkOptions::default()
            },
        )
        .await;
        let order: Vec<usize> = results.iter().map(|r| r.index).collect();
        assert_eq!(order, vec![1, 2, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_fast_stops_launching_but_drains() {
        let started = Arc::new(AtomicUsize::new(0));
        let results = process_in_chunks(
            (0..6).collect::<Vec<u32>>(),
            |item, _| {
                let started = started.clone();
                async move {
                    started.fetch_add(1, Ordering::SeqCst);
                    if item == 0 {
                        return Err(NodeError::ExecutionFailed("first".into()));
                    }
                    sleep(Duration::from_millis(50)).await;
                    Ok(item)
                }
            },
            ChunkOptions {
                concurrency: 2,
                fail_fast: true,
                ..ChunkOptions::default()
            },
        )
        .await;

        // Item 0 fails immediately; item 1 was already in flight and completes.
        assert_eq!(started.load(Ordering::SeqCst), 2);
        assert_eq!(results.len(), 2);
        assert!(results[1].is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_item_timeout() {
        let results = process_in_chunks(
            vec![10u64, 500],
            |ms, index| delayed(ms, index as u32),
            ChunkOptions {
                operation_timeout: Some(Duration::from_millis(100)),
                ..ChunkOptions::default()
            },
        )
        .await;
        assert!(results[0].is_ok());
        assert_eq!(results[1].outcome, Err(NodeError::Timeout { ms: 100 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_strategy_aggregates_failures() {
        let outcome = execute_strategy(
            vec![1u32, 2, 3],
            |item, _| async move {
                if item == 2 {
                    Err(NodeError::ExecutionFailed("two".into()))
                } else {
                    Ok(item)
                }
            },
            StrategyConfig {
                strategy: Strategy::All,
                ..StrategyConfig::default()
            },
        )
        .await;

        match outcome {
            Err(StrategyError::AllFailed { failures, total }) => {
                assert_eq!(total, 3);
                assert_eq!(failures, vec![(1, NodeError::ExecutionFailed("two".into()))]);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_strategy_success_keeps_order() {
        let outcome = execute_strategy(
            vec![30u64, 10, 20],
            |ms, _| delayed(ms, ms as u32),
            StrategyConfig {
                strategy: Strategy::All,
                ..StrategyConfig::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(outcome, StrategyOutcome::All(vec![30, 10, 20]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_race_returns_first_settled() {
        let outcome = execute_strategy(
            vec![300u64, 50, 100],
            |ms, _| delayed(ms, ms as u32),
            StrategyConfig {
                strategy: Strategy::Race,
                ..StrategyConfig::default()
            },
        )
        .await
        .unwrap();

        match outcome {
            StrategyOutcome::Race(first) => {
                assert_eq!(first.index, 1);
                assert_eq!(first.outcome, Ok(50));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_race_with_no_items() {
        let outcome = execute_strategy(
            Vec::<u64>::new(),
            |ms, _| delayed(ms, 0),
            StrategyConfig {
                strategy: Strategy::Race,
                ..StrategyConfig::default()
            },
        )
        .await;
        assert_eq!(outcome, Err(StrategyError::Empty));
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_settled_reports_each_item() {
        let outcome = execute_strategy(
            vec![1u32, 2, 3],
            |item, _| async move {
                if item % 2 == 0 {
                    Err(NodeError::ExecutionFailed("even".into()))
                } else {
                    Ok(item)
                }
            },
            StrategyConfig::default(),
        )
        .await
        .unwrap();

        let StrategyOutcome::AllSettled(results) = outcome else {
            panic!("expected all-settled outcome");
        };
        let statuses: Vec<bool> = results.iter().map(ItemResult::is_ok).collect();
        assert_eq!(statuses, vec![true, false, true]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_timeout_is_independent() {
        let outcome = execute_strategy(
            vec![100u64, 100, 100, 100],
            |ms, _| delayed(ms, 0),
            StrategyConfig {
                strategy: Strategy::AllSettled,
                concurrency: 1,
                operation_timeout: Some(Duration::from_millis(150)),
                global_timeout: Some(Duration::from_millis(250)),
            },
        )
        .await;
        assert_eq!(outcome, Err(StrategyError::Timeout { ms: 250 }));
    }
}
