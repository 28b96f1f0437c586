//! Bounded fan-out with ordered fan-in.
//!
//! [`fan_out`] runs one future per item with at most `limit` of them past
//! admission at any instant. Results land in a slot array sized up front, so
//! the returned vector is ordered by item index no matter which future
//! finished first. The first failure cancels every sibling and is returned
//! alone; no partial results escape.

use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Why a fan-out did not produce a full result set.
#[derive(Debug, Error)]
pub enum FanOutError<E> {
    /// Item `index` (0-based) of `total` failed.
    #[error("item {} of {total} failed: {error}", .index + 1)]
    Failed { index: usize, total: usize, error: E },

    /// The caller's token fired.
    #[error("fan-out cancelled")]
    Cancelled,

    /// A spawned item panicked or was aborted.
    #[error("fan-out task aborted: {0}")]
    Aborted(String),
}

enum Outcome<R, E> {
    Done(R),
    Failed(E),
    /// Never dispatched because the fan-out was cancelled first.
    Skipped,
}

/// Run `f` over `items` with bounded concurrency and fail-fast semantics.
///
/// `f` receives the item index, the item and a token that fires when the
/// fan-out is cancelled or a sibling fails.
pub async fn fan_out<T, R, E, F, Fut>(
    items: Vec<T>,
    limit: usize,
    cancel: &CancellationToken,
    mut f: F,
) -> Result<Vec<R>, FanOutError<E>>
where
    R: Send + 'static,
    E: std::fmt::Display + Send + 'static,
    F: FnMut(usize, T, CancellationToken) -> Fut,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
{
    let total = items.len();
    let semaphore = Arc::new(Semaphore::new(limit.max(1)));
    let siblings = cancel.child_token();
    let mut join_set = JoinSet::new();

    for (index, item) in items.into_iter().enumerate() {
        let token = siblings.clone();
        let semaphore = semaphore.clone();
        let fut = f(index, item, token.clone());
        join_set.spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return (index, Outcome::Skipped),
            };
            if token.is_cancelled() {
                return (index, Outcome::Skipped);
            }
            match fut.await {
                Ok(value) => (index, Outcome::Done(value)),
                Err(error) => (index, Outcome::Failed(error)),
            }
        });
    }

    let mut slots: Vec<Option<R>> = (0..total).map(|_| None).collect();
    while let Some(joined) = join_set.join_next().await {
        let (index, outcome) = match joined {
            Ok(pair) => pair,
            Err(e) => {
                siblings.cancel();
                join_set.abort_all();
                return Err(FanOutError::Aborted(e.to_string()));
            }
        };
        match outcome {
            Outcome::Done(value) => slots[index] = Some(value),
            Outcome::Failed(error) => {
                siblings.cancel();
                join_set.abort_all();
                if cancel.is_cancelled() {
                    return Err(FanOutError::Cancelled);
                }
                debug!(index, total, error = %error, "Fan-out item failed, siblings cancelled");
                return Err(FanOutError::Failed {
                    index,
                    total,
                    error,
                });
            }
            Outcome::Skipped => {
                join_set.abort_all();
                return Err(FanOutError::Cancelled);
            }
        }
    }

    slots
        .into_iter()
        .enumerate()
        .map(|(index, slot)| {
            slot.ok_or_else(|| FanOutError::Aborted(format!("item {} produced no result", index)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_results_follow_item_order() {
        let items: Vec<u64> = vec![30, 5, 20, 1, 10];
        let out = fan_out(items, 5, &CancellationToken::new(), |_, ms, _| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok::<_, String>(ms)
        })
        .await
        .unwrap();
        assert_eq!(out, vec![30, 5, 20, 1, 10]);
    }

    #[tokio::test]
    async fn test_admission_is_bounded() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let out = fan_out((0..12).collect::<Vec<_>>(), 3, &CancellationToken::new(), |_, i, _| {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, String>(i)
            }
        })
        .await
        .unwrap();

        assert_eq!(out.len(), 12);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_first_failure_wins_and_cancels_siblings() {
        let saw_cancel = Arc::new(AtomicUsize::new(0));
        let err = fan_out((0..5).collect::<Vec<_>>(), 5, &CancellationToken::new(), |_, i, token| {
            let saw_cancel = saw_cancel.clone();
            async move {
                if i == 2 {
                    return Err(format!("boom {i}"));
                }
                tokio::select! {
                    _ = token.cancelled() => {
                        saw_cancel.fetch_add(1, Ordering::SeqCst);
                        Err("cancelled".to_string())
                    }
                    _ = tokio::time::sleep(Duration::from_secs(30)) => Ok(i),
                }
            }
        })
        .await
        .unwrap_err();

        match err {
            FanOutError::Failed {
                index,
                total,
                error,
            } => {
                assert_eq!(index, 2);
                assert_eq!(total, 5);
                assert_eq!(error, "boom 2");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_cancelled_before_dispatch() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = Arc::new(AtomicUsize::new(0));
        let err = fan_out(vec![1, 2, 3], 1, &cancel, |_, i, _| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(i)
            }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, FanOutError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_input() {
        let out: Vec<u8> = fan_out(Vec::<u8>::new(), 2, &CancellationToken::new(), |_, i, _| async move {
            Ok::<_, String>(i)
        })
        .await
        .unwrap();
        assert!(out.is_empty());
    }
}
