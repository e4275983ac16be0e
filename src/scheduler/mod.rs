//! Reconcile scheduling.
//!
//! Watch events, the periodic resync sweep and delayed retries all feed keys
//! into a [`WorkQueue`]. A fixed pool of workers drains it, runs the
//! [`Reconciler`] and turns each [`ReconcileOutcome`] into the next schedule.

pub mod backoff;
pub mod queue;

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::controller::error::{Error, ErrorKind};
use crate::gateway::ApiGateway;
use crate::health::HealthState;
use crate::resources::OwnerKind;

pub use backoff::Backoff;
pub use queue::WorkQueue;

/// Key of a managed resource.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    pub kind: OwnerKind,
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(kind: OwnerKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// What a reconcile pass asks of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Converged; wait for the next event or resync.
    Done,
    /// Run again after the delay.
    RetryAfter(Duration),
    /// Failed; the kind decides whether and when to retry.
    Error(ErrorKind),
}

impl From<&Error> for ReconcileOutcome {
    fn from(error: &Error) -> Self {
        ReconcileOutcome::Error(error.kind())
    }
}

/// A reconcile function over object keys.
pub trait Reconciler: Send + Sync + 'static {
    fn reconcile(&self, key: &ObjectKey) -> impl std::future::Future<Output = ReconcileOutcome> + Send;
}

/// Kinds swept by the resync loop.
pub const MANAGED_KINDS: [OwnerKind; 3] = [OwnerKind::RayCluster, OwnerKind::RayService, OwnerKind::RayJob];

/// Apply `outcome` of reconciling `key` to the queue and the backoff state.
pub fn schedule(queue: &Arc<WorkQueue>, backoff: &Backoff, key: &ObjectKey, outcome: ReconcileOutcome) {
    match outcome {
        ReconcileOutcome::Done => backoff.reset(key),
        ReconcileOutcome::RetryAfter(delay) => {
            backoff.reset(key);
            queue.add_after(key.clone(), delay);
        }
        ReconcileOutcome::Error(ErrorKind::Configuration) => {
            debug!(key = %key, "Configuration error, waiting for the next change");
        }
        ReconcileOutcome::Error(ErrorKind::NotFound) => {
            backoff.reset(key);
            debug!(key = %key, "Object gone, dropping key");
        }
        ReconcileOutcome::Error(kind) => {
            let delay = backoff.next_delay(key);
            debug!(key = %key, %kind, delay_ms = delay.as_millis(), "Backing off");
            queue.add_after(key.clone(), delay);
        }
    }
}

async fn worker<R: Reconciler>(
    id: usize,
    reconciler: Arc<R>,
    queue: Arc<WorkQueue>,
    backoff: Arc<Backoff>,
    health_state: Option<Arc<HealthState>>,
) {
    while let Some(key) = queue.next().await {
        let started = Instant::now();
        let outcome = reconciler.reconcile(&key).await;
        debug!(
            worker = id,
            key = %key,
            ?outcome,
            elapsed_ms = started.elapsed().as_millis(),
            "Reconcile finished"
        );
        schedule(&queue, &backoff, &key, outcome);
        queue.done(&key);
        if let Some(health) = &health_state {
            health
                .metrics
                .set_queue_depth(i64::try_from(queue.len()).unwrap_or(i64::MAX));
        }
    }
    debug!(worker = id, "Worker stopped");
}

/// Run `config.concurrency` workers until the queue shuts down.
pub async fn run_workers<R: Reconciler>(
    reconciler: Arc<R>,
    queue: Arc<WorkQueue>,
    config: &SchedulerConfig,
    health_state: Option<Arc<HealthState>>,
) {
    let backoff = Arc::new(Backoff::new(config.backoff_base, config.backoff_max));
    let workers = config.concurrency.max(1);
    info!(workers, "Starting reconcile workers");

    let handles: Vec<_> = (0..workers)
        .map(|id| {
            tokio::spawn(worker(
                id,
                reconciler.clone(),
                queue.clone(),
                backoff.clone(),
                health_state.clone(),
            ))
        })
        .collect();
    for handle in futures::future::join_all(handles).await {
        if let Err(e) = handle {
            warn!(error = %e, "Reconcile worker panicked");
        }
    }
}

/// Enqueue every managed object once.
pub async fn resync_once<G: ApiGateway>(gateway: &G, queue: &WorkQueue) -> usize {
    let mut total = 0;
    for kind in MANAGED_KINDS {
        match gateway.list_keys(kind).await {
            Ok(keys) => {
                total += keys.len();
                keys.into_iter().for_each(|key| queue.add(key));
            }
            Err(e) => warn!(%kind, error = %e, "Resync listing failed"),
        }
    }
    total
}

/// Periodically enqueue every managed object.
pub async fn resync_loop<G: ApiGateway>(gateway: Arc<G>, queue: Arc<WorkQueue>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let queued = resync_once(gateway.as_ref(), &queue).await;
        debug!(queued, "Resync sweep");
    }
}
