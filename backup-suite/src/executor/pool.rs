//! Bounded worker pool.
//!
//! Tasks run on the tokio runtime behind a semaphore. Every outcome comes back
//! under the key it was submitted with, in submission order, including tasks
//! that panicked or never started because the run was cancelled.

use crate::utils::errors::{Result, SuiteError};
use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum TaskFailure {
    #[error(transparent)]
    Error(#[from] SuiteError),

    #[error("task panicked: {0}")]
    Panicked(String),

    #[error("cancelled")]
    Cancelled,
}

#[derive(Debug)]
pub struct TaskOutcome<K, T> {
    pub key: K,
    pub result: std::result::Result<T, TaskFailure>,
}

/// Run `task` over `inputs` with at most `limit` in flight.
///
/// Inputs that have not acquired a slot when `cancel` fires end as
/// [`TaskFailure::Cancelled`]; tasks already running are awaited.
pub async fn run_bounded<K, I, T, F, Fut>(
    inputs: Vec<(K, I)>,
    limit: usize,
    cancel: &CancellationToken,
    task: F,
) -> Vec<TaskOutcome<K, T>>
where
    T: Send + 'static,
    F: Fn(I) -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(limit.max(1)));
    let mut keys = Vec::with_capacity(inputs.len());
    let mut handles = Vec::with_capacity(inputs.len());

    for (key, input) in inputs {
        let sem = Arc::clone(&semaphore);
        let cancel = cancel.clone();
        let work = task(input);

        handles.push(tokio::spawn(async move {
            let permit = tokio::select! {
                permit = sem.acquire_owned() => permit,
                _ = cancel.cancelled() => return Err(TaskFailure::Cancelled),
            };
            let _permit = permit.map_err(|_| TaskFailure::Cancelled)?;
            if cancel.is_cancelled() {
                return Err(TaskFailure::Cancelled);
            }
            work.await.map_err(TaskFailure::from)
        }));
        keys.push(key);
    }

    let mut outcomes = Vec::with_capacity(keys.len());
    for (key, handle) in keys.into_iter().zip(handles) {
        let result = match handle.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(TaskFailure::Panicked(panic_message(e.into_panic()))),
            Err(_) => Err(TaskFailure::Cancelled),
        };
        outcomes.push(TaskOutcome { key, result });
    }
    outcomes
}

/// Run blocking work off the async threads. A panic is re-raised in the
/// caller so a surrounding pool task records it against its own key.
pub async fn blocking<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    match tokio::task::spawn_blocking(work).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(e) => Err(SuiteError::Failed {
            message: format!("blocking task did not complete: {}", e),
            paths: Vec::new(),
        }),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_respects_limit_and_order() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let inputs: Vec<(usize, u64)> = (0..12).map(|i| (i, (12 - i) as u64)).collect();

        let outcomes = run_bounded(inputs, 3, &CancellationToken::new(), |delay| {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(delay)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(delay * 2)
            }
        })
        .await;

        assert!(peak.load(Ordering::SeqCst) <= 3);
        let keys: Vec<usize> = outcomes.iter().map(|o| o.key).collect();
        assert_eq!(keys, (0..12).collect::<Vec<_>>());
        assert!(matches!(outcomes[0].result, Ok(24)));
    }

    #[tokio::test]
    async fn test_panic_is_attributed() {
        let inputs = vec![("ok", false), ("boom", true), ("also-ok", false)];
        let outcomes = run_bounded(inputs, 2, &CancellationToken::new(), |explode| async move {
            if explode {
                panic!("archive writer exploded");
            }
            Ok(())
        })
        .await;

        assert!(outcomes[0].result.is_ok());
        match &outcomes[1].result {
            Err(TaskFailure::Panicked(msg)) => assert!(msg.contains("exploded")),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(outcomes[1].key, "boom");
        assert!(outcomes[2].result.is_ok());
    }

    #[tokio::test]
    async fn test_blocking_panic_reaches_pool() {
        let outcomes = run_bounded(vec![("item", ())], 1, &CancellationToken::new(), |_| async {
            blocking(|| -> Result<()> { panic!("inside blocking") }).await
        })
        .await;
        assert!(matches!(outcomes[0].result, Err(TaskFailure::Panicked(_))));
    }

    #[tokio::test]
    async fn test_cancel_stops_pending_tasks() {
        let cancel = CancellationToken::new();
        let started = Arc::new(AtomicUsize::new(0));
        let inputs: Vec<(usize, ())> = (0..5).map(|i| (i, ())).collect();

        let outcomes = run_bounded(inputs, 1, &cancel, |_| {
            let cancel = cancel.clone();
            let started = Arc::clone(&started);
            async move {
                started.fetch_add(1, Ordering::SeqCst);
                cancel.cancel();
                Ok(())
            }
        })
        .await;

        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert_eq!(
            outcomes
                .iter()
                .filter(|o| matches!(o.result, Err(TaskFailure::Cancelled)))
                .count(),
            4
        );
    }

    #[tokio::test]
    async fn test_errors_keep_their_key() {
        let outcomes = run_bounded(vec![(1, 1), (2, 2)], 2, &CancellationToken::new(), |n| async move {
            if n == 2 {
                Err(SuiteError::NotFound(format!("item {}", n)))
            } else {
                Ok(n)
            }
        })
        .await;
        assert!(matches!(outcomes[1].result, Err(TaskFailure::Error(SuiteError::NotFound(_)))));
    }
}
