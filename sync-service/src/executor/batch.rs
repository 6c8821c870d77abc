use std::{
    future::Future,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use futures::{stream, StreamExt};
use tokio::sync::mpsc;

use super::{BatchOutcome, ItemFailure};

#[derive(Debug, Clone, PartialEq)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub max_workers: usize,
    /// Pause between consecutive batches, to stay under the remote request rate.
    pub batch_delay: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 3,
            max_workers: 2,
            batch_delay: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    pub current: usize,
    pub total: usize,
    pub message: String,
}

/// A successfully applied item: its display label and the local record ids
/// whose change-log entries may now be settled.
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    pub label: String,
    pub settled_ids: Vec<String>,
}

pub type ItemResult = Result<Applied, ItemFailure>;

/// Run `op` over `items` in fixed-size batches.
///
/// Items inside a batch run with at most `max_workers` in flight; batches run
/// strictly one after another with `batch_delay` in between. The cancel flag
/// is polled during that pause and before every item; whatever has not started is
/// reported as skipped. An `Err` from `op` is fatal and aborts the run; item
/// failures are collected in the outcome.
pub(crate) async fn run_batches<T, E, F, Fut>(
    items: Vec<T>,
    config: &BatchConfig,
    cancel: &AtomicBool,
    progress: Option<&mpsc::Sender<Progress>>,
    op: F,
) -> Result<BatchOutcome, E>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<ItemResult, E>>,
{
    let total = items.len();
    let batch_size = config.batch_size.max(1);
    let workers = config.max_workers.max(1);

    let mut outcome = BatchOutcome::default();
    let mut remaining = items.into_iter();
    let mut current = 0usize;
    let mut batch_index = 0usize;

    while remaining.len() > 0 {
        if batch_index > 0 {
            pause(config.batch_delay, cancel).await;
        }
        if cancel.load(Ordering::SeqCst) {
            outcome.skipped_count += remaining.len();
            outcome.cancelled = true;
            break;
        }

        let batch: Vec<T> = remaining.by_ref().take(batch_size).collect();
        tracing::debug!(batch = batch_index, size = batch.len(), total, "processing batch");

        let op = &op;
        let results: Vec<Option<Result<ItemResult, E>>> = stream::iter(batch)
            .map(|item| async move {
                if cancel.load(Ordering::SeqCst) {
                    None
                } else {
                    Some(op(item).await)
                }
            })
            .buffered(workers)
            .collect()
            .await;

        for result in results {
            current += 1;
            let message = match result {
                None => {
                    outcome.skipped_count += 1;
                    outcome.cancelled = true;
                    "skipped (cancelled)".to_string()
                }
                Some(Err(fatal)) => return Err(fatal),
                Some(Ok(Ok(applied))) => {
                    outcome.success_count += 1;
                    outcome.settled_ids.extend(applied.settled_ids);
                    let message = applied.label.clone();
                    outcome.applied.push(applied.label);
                    message
                }
                Some(Ok(Err(failure))) => {
                    outcome.failed_count += 1;
                    let message = format!("failed: {}", failure.label);
                    outcome.failures.push(failure);
                    message
                }
            };

            if let Some(tx) = progress {
                let _ = tx.try_send(Progress { current, total, message });
            }
        }

        batch_index += 1;
    }

    Ok(outcome)
}

/// Longest stretch the inter-batch pause goes without looking at the cancel flag.
const CANCEL_POLL: Duration = Duration::from_millis(50);

/// Sleep for `delay`, returning early once `cancel` is set.
async fn pause(delay: Duration, cancel: &AtomicBool) {
    let deadline = tokio::time::Instant::now() + delay;
    while !cancel.load(Ordering::SeqCst) {
        let now = tokio::time::Instant::now();
        if now >= deadline {
            break;
        }
        tokio::time::sleep((deadline - now).min(CANCEL_POLL)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        convert::Infallible,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    };

    fn ok(label: &str) -> ItemResult {
        Ok(Applied {
            label: label.to_string(),
            settled_ids: vec![label.to_string()],
        })
    }

    fn quick() -> BatchConfig {
        BatchConfig {
            batch_size: 2,
            max_workers: 2,
            batch_delay: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn item_failures_do_not_abort_the_batch() {
        let cancel = AtomicBool::new(false);
        let outcome = run_batches::<_, Infallible, _, _>(vec![1, 2, 3, 4, 5], &quick(), &cancel, None, |n| async move {
            Ok(if n % 2 == 0 {
                Err(ItemFailure {
                    id: n.to_string(),
                    label: format!("item {n}"),
                    error: "boom".to_string(),
                })
            } else {
                ok(&n.to_string())
            })
        })
        .await
        .unwrap();

        assert_eq!(outcome.success_count, 3);
        assert_eq!(outcome.failed_count, 2);
        assert_eq!(outcome.applied, vec!["1", "3", "5"]);
        assert_eq!(outcome.settled_ids, vec!["1", "3", "5"]);
        assert_eq!(outcome.failures[0].label, "item 2");
        assert!(!outcome.cancelled);
    }

    #[tokio::test]
    async fn fatal_errors_abort() {
        let cancel = AtomicBool::new(false);
        let res = run_batches(vec![1, 2, 3], &quick(), &cancel, None, |n| async move {
            if n == 2 {
                Err("disk gone")
            } else {
                Ok(ok(&n.to_string()))
            }
        })
        .await;
        assert_eq!(res.unwrap_err(), "disk gone");
    }

    #[tokio::test]
    async fn cancellation_skips_items_not_yet_started() {
        let cancel = Arc::new(AtomicBool::new(false));
        let seen = Arc::new(AtomicUsize::new(0));
        let config = BatchConfig {
            batch_size: 1,
            max_workers: 1,
            batch_delay: Duration::ZERO,
        };

        let outcome = run_batches::<_, Infallible, _, _>(vec![1, 2, 3, 4], &config, &cancel, None, |n| {
            let cancel = cancel.clone();
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                if n == 2 {
                    cancel.store(true, Ordering::SeqCst);
                }
                Ok(ok(&n.to_string()))
            }
        })
        .await
        .unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(outcome.success_count, 2);
        assert_eq!(outcome.skipped_count, 2);
        assert!(outcome.cancelled);
    }

    #[tokio::test]
    async fn progress_reports_every_item() {
        let cancel = AtomicBool::new(false);
        let (tx, mut rx) = mpsc::channel(16);

        run_batches::<_, Infallible, _, _>(vec!["a", "b", "c"], &quick(), &cancel, Some(&tx), |s| async move { Ok(ok(s)) })
            .await
            .unwrap();
        drop(tx);

        let mut events = Vec::new();
        while let Some(p) = rx.recv().await {
            events.push(p);
        }
        assert_eq!(events.len(), 3);
        assert_eq!(events[2].current, 3);
        assert_eq!(events[2].total, 3);
        assert_eq!(events[0].message, "a");
    }

    #[tokio::test(start_paused = true)]
    async fn batches_are_separated_by_the_delay() {
        let cancel = AtomicBool::new(false);
        let config = BatchConfig {
            batch_size: 2,
            max_workers: 2,
            batch_delay: Duration::from_secs(3),
        };

        let started = tokio::time::Instant::now();
        let outcome = run_batches::<_, Infallible, _, _>(vec![1, 2, 3, 4, 5], &config, &cancel, None, |n| async move {
            Ok(ok(&n.to_string()))
        })
        .await
        .unwrap();

        assert_eq!(outcome.success_count, 5);
        // Three batches, two pauses between them.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(6), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_secs(7), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_cuts_the_pause_between_batches_short() {
        let cancel = Arc::new(AtomicBool::new(false));
        let config = BatchConfig {
            batch_size: 1,
            max_workers: 1,
            batch_delay: Duration::from_secs(60),
        };

        let flag = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            flag.store(true, Ordering::SeqCst);
        });

        let started = tokio::time::Instant::now();
        let outcome = run_batches::<_, Infallible, _, _>(vec![1, 2, 3], &config, &cancel, None, |n| async move {
            Ok(ok(&n.to_string()))
        })
        .await
        .unwrap();

        let elapsed = started.elapsed();
        assert!(elapsed < Duration::from_secs(2), "elapsed {elapsed:?}");
        assert_eq!(outcome.success_count, 1);
        assert_eq!(outcome.skipped_count, 2);
        assert!(outcome.cancelled);
    }
}
