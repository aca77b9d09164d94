//! Structured groups of sibling sub-tasks
//!
//! A group owns every task it spawns. [`TaskGroup::join`] does not return
//! until all of them have finished, even when one fails early, so no sibling
//! can still be writing into an array after its parent has moved on.

use super::cancel::CancellationFlag;
use super::limiter::{panic_message, ParallelismLimiter};
use crate::error::{ForgeResult, GraphForgeError};
use tokio::task::JoinSet;

/// Keep the first real failure; a `Cancelled` only wins if nothing else failed
pub(crate) fn record_failure(slot: &mut Option<GraphForgeError>, err: GraphForgeError) {
    let replace = match slot.as_ref() {
        None => true,
        Some(existing) => existing.is_cancelled() && !err.is_cancelled(),
    };
    if replace {
        *slot = Some(err);
    }
}

pub struct TaskGroup<T> {
    limiter: ParallelismLimiter,
    flag: CancellationFlag,
    tasks: JoinSet<(usize, ForgeResult<T>)>,
    spawned: usize,
}

impl<T: Send + 'static> TaskGroup<T> {
    /// New group whose flag is a child of `parent`
    pub fn new(limiter: &ParallelismLimiter, parent: &CancellationFlag) -> Self {
        TaskGroup {
            limiter: limiter.clone(),
            flag: parent.child(),
            tasks: JoinSet::new(),
            spawned: 0,
        }
    }

    pub fn flag(&self) -> &CancellationFlag {
        &self.flag
    }

    pub fn len(&self) -> usize {
        self.spawned
    }

    pub fn is_empty(&self) -> bool {
        self.spawned == 0
    }

    /// Queue `work` behind a limiter permit.
    ///
    /// The closure receives the group's flag so long loops can bail out
    /// between blocks.
    pub fn spawn<F>(&mut self, work: F)
    where
        F: FnOnce(&CancellationFlag) -> ForgeResult<T> + Send + 'static,
    {
        let index = self.spawned;
        self.spawned += 1;
        let limiter = self.limiter.clone();
        let flag = self.flag.clone();
        self.tasks.spawn(async move {
            let inner = flag.clone();
            let result = limiter.run(&flag, move || work(&inner)).await;
            (index, result)
        });
    }

    /// Wait for every sibling and return their results in spawn order.
    ///
    /// On the first failure the group flag is raised so siblings that have
    /// not started yet skip their work. All siblings are still awaited before
    /// the failure is returned.
    pub async fn join(mut self) -> ForgeResult<Vec<T>> {
        let mut results: Vec<Option<T>> = (0..self.spawned).map(|_| None).collect();
        let mut failure: Option<GraphForgeError> = None;

        while let Some(joined) = self.tasks.join_next().await {
            let err = match joined {
                Ok((index, Ok(value))) => {
                    results[index] = Some(value);
                    continue;
                }
                Ok((_, Err(err))) => err,
                Err(join_err) if join_err.is_panic() => {
                    GraphForgeError::TaskPanicked(panic_message(join_err.into_panic()))
                }
                Err(_) => GraphForgeError::Cancelled,
            };
            if failure.is_none() {
                tracing::debug!(error = %err, "task group member failed, cancelling siblings");
                self.flag.cancel();
            }
            record_failure(&mut failure, err);
        }

        if let Some(err) = failure {
            return Err(err);
        }
        results
            .into_iter()
            .enumerate()
            .map(|(index, value)| {
                value.ok_or_else(|| {
                    GraphForgeError::InternalError(format!("task {} finished without a result", index))
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_results_in_spawn_order() {
        let limiter = ParallelismLimiter::new(3);
        let mut group = TaskGroup::new(&limiter, &CancellationFlag::new());
        for i in 0..10u64 {
            group.spawn(move |_| {
                std::thread::sleep(Duration::from_millis(10 - i));
                Ok(i * i)
            });
        }
        let results = group.join().await.unwrap();
        assert_eq!(results, (0..10u64).map(|i| i * i).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_first_error_returned_after_all_siblings_finish() {
        let limiter = ParallelismLimiter::new(2);
        let finished = Arc::new(AtomicUsize::new(0));
        let mut group = TaskGroup::new(&limiter, &CancellationFlag::new());

        for i in 0..6usize {
            let finished = Arc::clone(&finished);
            group.spawn(move |_| {
                if i == 0 {
                    return Err(GraphForgeError::ShapeMismatch("bad block".to_string()));
                }
                std::thread::sleep(Duration::from_millis(20));
                finished.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        let err = group.join().await.unwrap_err();
        assert!(matches!(err, GraphForgeError::ShapeMismatch(_)));
        // Nothing is still running once join returns
        assert_eq!(limiter.active(), 0);
        let done = finished.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(finished.load(Ordering::SeqCst), done);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_panic_reported_as_task_panicked() {
        let limiter = ParallelismLimiter::new(2);
        let mut group: TaskGroup<()> = TaskGroup::new(&limiter, &CancellationFlag::new());
        group.spawn(|_| panic!("sibling blew up"));
        group.spawn(|_| Ok(()));
        match group.join().await {
            Err(GraphForgeError::TaskPanicked(msg)) => assert!(msg.contains("sibling blew up")),
            other => panic!("expected TaskPanicked, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_parent_cancellation_skips_pending_work() {
        let limiter = ParallelismLimiter::new(1);
        let parent = CancellationFlag::new();
        let mut group = TaskGroup::new(&limiter, &parent);
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let ran = Arc::clone(&ran);
            group.spawn(move |_| {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        parent.cancel();
        assert!(matches!(group.join().await, Err(GraphForgeError::Cancelled)));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_real_failure_beats_cancellation() {
        let mut slot = None;
        record_failure(&mut slot, GraphForgeError::Cancelled);
        record_failure(&mut slot, GraphForgeError::TypeMismatch("u8".to_string()));
        record_failure(&mut slot, GraphForgeError::ShapeMismatch("late".to_string()));
        assert!(matches!(slot, Some(GraphForgeError::TypeMismatch(_))));
    }

    #[tokio::test]
    async fn test_empty_group() {
        let group: TaskGroup<u8> = TaskGroup::new(&ParallelismLimiter::new(1), &CancellationFlag::new());
        assert!(group.is_empty());
        assert!(group.join().await.unwrap().is_empty());
    }
}
