//! Background job queue and per-record write locks.

use log::debug;
use mnemos_rs_protocol::RecordId;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Notify, OwnedMutexGuard, Semaphore};

/// Bounded runner for fire-and-forget work.
///
/// At most `capacity` jobs run detached; once full, `submit` runs the job on
/// the caller's task instead of queueing more.
#[derive(Debug, Clone)]
pub struct BackgroundQueue {
    permits: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

/// Decrements the in-flight count even if the job panics.
struct InFlight {
    counter: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.counter.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

impl BackgroundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(capacity.max(1))),
            in_flight: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
        }
    }

    /// Run `job` detached, or inline when the queue is saturated.
    pub async fn submit<F>(&self, label: &'static str, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permit = match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                debug!("background queue saturated, running inline (job={label})");
                job.await;
                return;
            }
        };
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let guard = InFlight {
            counter: Arc::clone(&self.in_flight),
            idle: Arc::clone(&self.idle),
        };
        tokio::spawn(async move {
            let _guard = guard;
            let _permit = permit;
            job.await;
        });
    }

    /// Jobs currently running detached.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Wait until every detached job has finished.
    pub async fn flush(&self) {
        loop {
            let notified = self.idle.notified();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Per-record async locks; entries are dropped once nobody holds or awaits them.
#[derive(Debug, Default)]
pub struct RecordLocks {
    table: parking_lot::Mutex<HashMap<RecordId, Arc<tokio::sync::Mutex<()>>>>,
}

/// Held while a record is being written.
pub struct RecordGuard<'a> {
    locks: &'a RecordLocks,
    id: RecordId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl RecordLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive write access to `id`.
    pub async fn lock(&self, id: RecordId) -> RecordGuard<'_> {
        let mutex = Arc::clone(self.table.lock().entry(id).or_default());
        let guard = mutex.lock_owned().await;
        RecordGuard {
            locks: self,
            id,
            guard: Some(guard),
        }
    }

    /// Number of ids with a live lock entry.
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for RecordGuard<'_> {
    fn drop(&mut self) {
        let mut table = self.locks.table.lock();
        self.guard.take();
        let idle = table
            .get(&self.id)
            .is_some_and(|entry| Arc::strong_count(entry) == 1);
        if idle {
            table.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use uuid::Uuid;

    #[tokio::test]
    async fn flush_waits_for_detached_jobs() {
        let queue = BackgroundQueue::new(4);
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let done = Arc::clone(&done);
            queue
                .submit("test", async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    done.fetch_add(1, Ordering::SeqCst);
                })
                .await;
        }
        queue.flush().await;
        assert_eq!(done.load(Ordering::SeqCst), 3);
        assert_eq!(queue.in_flight(), 0);
    }

    #[tokio::test]
    async fn saturated_queue_runs_inline() {
        let queue = BackgroundQueue::new(1);
        let gate = Arc::new(Notify::new());
        let waiter = Arc::clone(&gate);
        queue
            .submit("blocker", async move { waiter.notified().await })
            .await;
        assert_eq!(queue.in_flight(), 1);

        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        queue
            .submit("inline", async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);

        gate.notify_one();
        queue.flush().await;
    }

    #[tokio::test]
    async fn record_locks_serialize_and_clean_up() {
        let locks = Arc::new(RecordLocks::new());
        let id = Uuid::new_v4();
        let first = locks.lock(id).await;
        assert_eq!(locks.len(), 1);

        let contender = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _guard = locks.lock(id).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!contender.is_finished());

        drop(first);
        contender.await.expect("join");
        assert!(locks.is_empty());
    }
}
