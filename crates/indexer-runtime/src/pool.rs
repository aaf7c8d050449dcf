//! Materializer Pool - Bounded queue and worker pool for materialization jobs
//!
//! Producers never block: when the queue is full the job is shed and the
//! row stays unmaterialized until the next sweep re-enqueues it.

use crate::error::StoreError;
use crate::materializer::Materializer;
use crate::shutdown::ShutdownSignal;
use crate::store::IndexerStore;
use ledger_types::Ordinal;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Semaphore;

/// Default queue capacity
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Default number of concurrent materializations
pub const DEFAULT_MAX_CONCURRENT: usize = 4;

/// Pool configuration
#[derive(Clone, Debug)]
pub struct MaterializerPoolConfig {
    /// Jobs buffered before new ones are shed
    pub queue_capacity: usize,
    /// Jobs running at once
    pub max_concurrent: usize,
}

impl Default for MaterializerPoolConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
        }
    }
}

/// One snapshot to materialize
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MaterializationJob {
    pub ordinal: Ordinal,
    pub hash: String,
}

/// Pool counters
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MaterializerStats {
    pub queued: u64,
    pub shed: u64,
    pub in_flight: u64,
    pub completed: u64,
    pub failed: u64,
}

struct Shared {
    stats: RwLock<MaterializerStats>,
    /// Jobs queued or running, so duplicates are not enqueued twice
    outstanding: Mutex<HashSet<MaterializationJob>>,
}

/// Handle for submitting jobs to the pool
#[derive(Clone)]
pub struct MaterializationQueue {
    sender: mpsc::Sender<MaterializationJob>,
    shared: Arc<Shared>,
}

impl MaterializationQueue {
    /// Enqueue a job without waiting
    ///
    /// Returns false when the job was shed or is already outstanding.
    pub fn enqueue(&self, ordinal: Ordinal, hash: &str) -> bool {
        let job = MaterializationJob {
            ordinal,
            hash: hash.to_string(),
        };

        if !self.shared.outstanding.lock().insert(job.clone()) {
            return false;
        }

        match self.sender.try_send(job.clone()) {
            Ok(()) => {
                self.shared.stats.write().queued += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                self.shared.outstanding.lock().remove(&job);
                self.shared.stats.write().shed += 1;
                tracing::warn!(
                    "Materializer queue full, shed snapshot {} (left for sweep)",
                    ordinal
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.shared.outstanding.lock().remove(&job);
                tracing::warn!("Materializer pool stopped, dropped snapshot {}", ordinal);
                false
            }
        }
    }

    /// Re-enqueue rows still owed a materialization pass
    ///
    /// Returns how many jobs were accepted.
    pub fn requeue_unmaterialized(
        &self,
        store: &IndexerStore,
        limit: usize,
    ) -> Result<usize, StoreError> {
        let mut accepted = 0;
        for row in store.unmaterialized(limit)? {
            if self.enqueue(row.ordinal, &row.hash) {
                accepted += 1;
            }
        }
        if accepted > 0 {
            tracing::info!("Sweep re-enqueued {} unmaterialized snapshots", accepted);
        }
        Ok(accepted)
    }

    pub fn stats(&self) -> MaterializerStats {
        *self.shared.stats.read()
    }
}

/// Worker pool draining the materialization queue
pub struct MaterializerPool {
    materializer: Arc<Materializer>,
    receiver: mpsc::Receiver<MaterializationJob>,
    shared: Arc<Shared>,
    config: MaterializerPoolConfig,
}

impl MaterializerPool {
    /// Create the pool and the queue handle feeding it
    pub fn new(
        materializer: Materializer,
        config: MaterializerPoolConfig,
    ) -> (Self, MaterializationQueue) {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let shared = Arc::new(Shared {
            stats: RwLock::new(MaterializerStats::default()),
            outstanding: Mutex::new(HashSet::new()),
        });

        let queue = MaterializationQueue {
            sender,
            shared: shared.clone(),
        };
        let pool = Self {
            materializer: Arc::new(materializer),
            receiver,
            shared,
            config,
        };
        (pool, queue)
    }

    /// Run until shutdown, then wait for in-flight jobs
    pub async fn run(mut self, mut shutdown: ShutdownSignal) {
        let max_concurrent = self.config.max_concurrent.max(1);
        let semaphore = Arc::new(Semaphore::new(max_concurrent));

        tracing::info!(
            "Materializer pool started ({} workers, queue {})",
            max_concurrent,
            self.config.queue_capacity
        );

        loop {
            let job = tokio::select! {
                job = self.receiver.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
                _ = shutdown.wait() => break,
            };

            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let materializer = self.materializer.clone();
            let shared = self.shared.clone();
            shared.stats.write().in_flight += 1;

            tokio::spawn(async move {
                let result = materializer.materialize(job.ordinal, &job.hash).await;
                shared.outstanding.lock().remove(&job);

                {
                    let mut stats = shared.stats.write();
                    stats.in_flight -= 1;
                    match &result {
                        Ok(_) => stats.completed += 1,
                        Err(_) => stats.failed += 1,
                    }
                }

                if let Err(e) = result {
                    tracing::error!("Materialization of snapshot {} failed: {}", job.ordinal, e);
                }
                drop(permit);
            });
        }

        let _ = semaphore.acquire_many(max_concurrent as u32).await;
        tracing::info!("Materializer pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::Shutdown;
    use crate::store::{IndexedSnapshot, IngestSource};
    use ledger_bridge::memory::InMemoryLedger;
    use ledger_types::{FiberState, PayloadMode, SnapshotPayload, SnapshotStats};
    use std::time::Duration;

    fn setup(capacity: usize) -> (IndexerStore, Arc<InMemoryLedger>, MaterializerPool, MaterializationQueue) {
        let store = IndexerStore::temporary().unwrap();
        let ledger = Arc::new(InMemoryLedger::new("node-0"));
        let (pool, queue) = MaterializerPool::new(
            Materializer::new(store.clone(), ledger.clone()),
            MaterializerPoolConfig {
                queue_capacity: capacity,
                max_concurrent: 2,
            },
        );
        (store, ledger, pool, queue)
    }

    fn publish(store: &IndexerStore, ledger: &InMemoryLedger, ordinal: Ordinal) {
        let hash = format!("h{}", ordinal);
        store
            .insert_pending(IndexedSnapshot::pending(
                ordinal,
                &hash,
                IngestSource::Webhook,
                None,
                SnapshotStats::default(),
            ))
            .unwrap();
        ledger.publish_snapshot(SnapshotPayload {
            ordinal,
            hash,
            mode: PayloadMode::Full,
            fibers: vec![FiberState {
                fiber_id: format!("fiber-{}", ordinal),
                sequence_number: 1,
                current_state: None,
                owners: None,
                state_data: None,
                kind: None,
            }],
        });
    }

    #[test]
    fn test_full_queue_sheds() {
        let (store, ledger, _pool, queue) = setup(1);
        publish(&store, &ledger, 1);
        publish(&store, &ledger, 2);

        assert!(queue.enqueue(1, "h1"));
        assert!(!queue.enqueue(1, "h1"));
        assert!(!queue.enqueue(2, "h2"));

        let stats = queue.stats();
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.shed, 1);
    }

    #[tokio::test]
    async fn test_pool_drains_queue_and_sweep_recovers_shed_jobs() {
        let (store, ledger, pool, queue) = setup(1);
        for ordinal in 1..=3 {
            publish(&store, &ledger, ordinal);
        }
        assert!(queue.enqueue(1, "h1"));
        assert!(!queue.enqueue(2, "h2"));

        let shutdown = Shutdown::new();
        let handle = tokio::spawn(pool.run(shutdown.signal()));

        for _ in 0..100 {
            if store.unmaterialized(10).unwrap().is_empty() {
                break;
            }
            queue.requeue_unmaterialized(&store, 10).unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(store.unmaterialized(10).unwrap().is_empty());
        assert_eq!(store.fiber_count(), 3);

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(queue.stats().in_flight, 0);
    }

    #[tokio::test]
    async fn test_failed_job_can_be_requeued() {
        let (store, ledger, pool, queue) = setup(8);
        publish(&store, &ledger, 1);
        ledger.set_unreachable(true);

        let shutdown = Shutdown::new();
        let handle = tokio::spawn(pool.run(shutdown.signal()));

        assert!(queue.enqueue(1, "h1"));
        for _ in 0..100 {
            if queue.stats().failed == 1 && queue.stats().in_flight == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(queue.stats().failed, 1);

        ledger.set_unreachable(false);
        assert_eq!(queue.requeue_unmaterialized(&store, 10).unwrap(), 1);
        for _ in 0..100 {
            if store.unmaterialized(10).unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(store.unmaterialized(10).unwrap().is_empty());

        shutdown.trigger();
        handle.await.unwrap();
    }
}
