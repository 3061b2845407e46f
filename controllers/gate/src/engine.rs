//! Engine wiring the work queue, worker tasks and the warm pool manager.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crds::pod::{has_marooned_finalizer, has_marooned_gate, is_deleting, pod_key};

use crate::metrics::Metrics;
use crate::queue::WorkQueue;
use crate::reconciler::{Disposition, Reconciler};
use crate::store::Stores;
use crate::warm_pool::WarmPoolManager;

pub struct GateEngine {
    reconciler: Reconciler,
    pool_manager: WarmPoolManager,
    queue: Arc<WorkQueue>,
    metrics: Arc<Metrics>,
    stores: Stores,
    pool_interval: Duration,
}

impl GateEngine {
    #[must_use]
    pub fn new(
        reconciler: Reconciler,
        pool_manager: WarmPoolManager,
        queue: Arc<WorkQueue>,
        metrics: Arc<Metrics>,
        stores: Stores,
        pool_interval: Duration,
    ) -> Self {
        Self {
            reconciler,
            pool_manager,
            queue,
            metrics,
            stores,
            pool_interval,
        }
    }

    #[must_use]
    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    /// Add/update notification for a pod: queue it when it is gated, or
    /// deleting with our finalizer still on.
    pub fn on_pod_applied(&self, pod: &Pod) {
        let needs_work = has_marooned_gate(pod) || (is_deleting(pod) && has_marooned_finalizer(pod));
        if !needs_work {
            return;
        }
        if let Some(key) = pod_key(pod) {
            self.queue.add(key);
            self.metrics.set_queue_depth(self.queue.len());
        }
    }

    /// Delete notification for a pod.
    pub async fn on_pod_deleted(&self, pod: &Pod) {
        self.reconciler.handle_pod_deleted(pod).await;
    }

    /// Queue every pod that still has work, e.g. after the config changed.
    pub fn enqueue_all(&self) {
        let pending = self.stores.pods.pending();
        debug!(count = pending.len(), "Re-queueing all pending pods");
        for pod in &pending {
            if let Some(key) = pod_key(pod) {
                self.queue.add(key);
            }
        }
        self.metrics.set_queue_depth(self.queue.len());
    }

    /// Start `threadiness` workers, the warm pool ticker and the enqueue-all
    /// listener; return once `token` is cancelled and in-flight keys finished.
    pub async fn run(self: Arc<Self>, token: CancellationToken, threadiness: usize, mut enqueue_all: mpsc::Receiver<()>) {
        info!(workers = threadiness, "Starting gate engine");
        let mut tasks = JoinSet::new();

        for worker in 0..threadiness {
            let engine = Arc::clone(&self);
            tasks.spawn(async move {
                while let Some(key) = engine.queue.get().await {
                    engine.process(&key).await;
                }
                debug!(worker, "Worker stopped");
            });
        }

        let engine = Arc::clone(&self);
        let pool_token = token.clone();
        tasks.spawn(async move {
            engine.pool_manager.run(engine.pool_interval, pool_token).await;
        });

        let engine = Arc::clone(&self);
        let pulse_token = token.clone();
        tasks.spawn(async move {
            loop {
                tokio::select! {
                    () = pulse_token.cancelled() => break,
                    pulse = enqueue_all.recv() => match pulse {
                        Some(()) => engine.enqueue_all(),
                        None => break,
                    },
                }
            }
        });

        token.cancelled().await;
        info!("Shutting down gate engine");
        self.queue.shutdown();

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                warn!("Engine task ended abnormally: {}", e);
            }
        }
        info!("Gate engine stopped");
    }

    /// Reconcile one key and requeue it according to the outcome.
    pub async fn process(&self, key: &str) -> Disposition {
        let disposition = self.reconciler.reconcile(key).await;
        match disposition {
            Disposition::Immediate => {
                self.queue.forget(key);
                self.queue.add(key);
            }
            Disposition::BackOff => self.queue.add_rate_limited(key),
            Disposition::Forget => self.queue.forget(key),
        }
        self.queue.done(key);
        self.metrics.record_disposition(disposition);
        self.metrics.set_queue_depth(self.queue.len());
        disposition
    }
}
