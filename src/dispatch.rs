//! Asynchronous query dispatch
//!
//! Queries run on a worker pool; their completions are posted to an
//! [`OwnerQueue`] that one designated thread pumps. Every callback, and
//! every manager cache mutation triggered from a completion, therefore
//! runs on that owner thread, while the caller's thread never blocks.
//!
//! Each submitted query is registered with the dispatcher on issue and
//! deregistered on completion; the task body holds a strong reference to
//! the manager, so supporting state cannot be torn down under an
//! in-flight query. Callbacks fire exactly once, including on error
//! paths (empty result, error logged). Cancellation and timeouts are not
//! supported. Callback targets can be bound weakly with
//! [`weak_callback`]; a callback whose target is gone is dropped
//! silently.

use crate::manager::SpatialHashManager;
use crate::query::QueryEngine;
use crate::types::{TrajectoryQueryResult, Vec3};
use crate::{GridError, Result};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{error, warn};

/// Work item executed on the owner thread
pub type OwnerTask = Box<dyn FnOnce() + Send>;

/// Callback receiving one result list
pub type QueryCallback = Box<dyn FnOnce(Vec<TrajectoryQueryResult>) + Send>;

/// Callback receiving (inner, outer) result lists
pub type DualQueryCallback =
    Box<dyn FnOnce(Vec<TrajectoryQueryResult>, Vec<TrajectoryQueryResult>) + Send>;

/// Single-consumer task queue pumped by the owner thread.
pub struct OwnerQueue {
    tx: Sender<OwnerTask>,
    rx: Receiver<OwnerTask>,
}

impl Default for OwnerQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl OwnerQueue {
    pub fn new() -> Self {
        let (tx, rx) = channel();
        Self { tx, rx }
    }

    /// Cloneable producer side for background threads.
    pub fn handle(&self) -> OwnerHandle {
        OwnerHandle { tx: self.tx.clone() }
    }

    /// Run every task currently queued; returns how many ran.
    pub fn poll(&self) -> usize {
        let mut ran = 0;
        while let Ok(task) = self.rx.try_recv() {
            task();
            ran += 1;
        }
        ran
    }

    /// Pump tasks until `done()` holds or `timeout` elapses.
    pub fn run_until(&self, timeout: Duration, done: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if done() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let wait = (deadline - now).min(Duration::from_millis(20));
            match self.rx.recv_timeout(wait) {
                Ok(task) => task(),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return done(),
            }
        }
    }
}

/// Producer handle for posting work to the owner thread.
#[derive(Clone)]
pub struct OwnerHandle {
    tx: Sender<OwnerTask>,
}

impl OwnerHandle {
    /// Post a task; false when the queue has been dropped.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) -> bool {
        self.tx.send(Box::new(task)).is_ok()
    }
}

/// Parameters of one async query
#[derive(Debug, Clone)]
pub enum QueryRequest {
    /// Mode A: point x single time step
    Radius {
        dataset_dir: PathBuf,
        position: Vec3,
        radius: f32,
        cell_size: f32,
        time_step: i32,
    },
    /// Mode B: point x time range
    RadiusOverTimeRange {
        dataset_dir: PathBuf,
        position: Vec3,
        radius: f32,
        cell_size: f32,
        start_time_step: i32,
        end_time_step: i32,
    },
    /// Mode C: moving trajectory x time range
    TrajectoryRadiusOverTimeRange {
        dataset_dir: PathBuf,
        trajectory_id: u32,
        radius: f32,
        cell_size: f32,
        start_time_step: i32,
        end_time_step: i32,
    },
}

/// Dual-radius request (delivers a pair of result lists)
#[derive(Debug, Clone)]
pub struct DualRadiusRequest {
    pub dataset_dir: PathBuf,
    pub position: Vec3,
    pub inner_radius: f32,
    pub outer_radius: f32,
    pub cell_size: f32,
    pub time_step: i32,
}

/// Fan-out/fan-in runner for the query engine.
pub struct AsyncQueryDispatcher {
    manager: Arc<SpatialHashManager>,
    pool: rayon::ThreadPool,
    owner: OwnerHandle,
    registry: Arc<Mutex<HashSet<u64>>>,
    next_task_id: AtomicU64,
}

impl AsyncQueryDispatcher {
    pub fn new(manager: Arc<SpatialHashManager>, queue: &OwnerQueue) -> Result<Self> {
        Self::with_threads(manager, queue, 0)
    }

    /// `num_threads == 0` lets rayon size the pool.
    pub fn with_threads(
        manager: Arc<SpatialHashManager>,
        queue: &OwnerQueue,
        num_threads: usize,
    ) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("trajgrid-query-{}", i))
            .build()
            .map_err(|e| GridError::Concurrency(format!("failed to build worker pool: {}", e)))?;

        Ok(Self {
            manager,
            pool,
            owner: queue.handle(),
            registry: Arc::new(Mutex::new(HashSet::new())),
            next_task_id: AtomicU64::new(1),
        })
    }

    /// Number of queries issued but not yet completed.
    pub fn pending(&self) -> usize {
        self.registry.lock().len()
    }

    /// Run a single-list query off the caller thread. The callback fires
    /// exactly once, on the owner thread, with an empty list on failure.
    pub fn submit(&self, request: QueryRequest, on_complete: QueryCallback) -> u64 {
        let task_id = self.register();
        let manager = self.manager.clone();
        let owner = self.owner.clone();
        let registry = self.registry.clone();

        self.pool.spawn(move || {
            let engine = QueryEngine::new(manager);
            let results = match run_query(&engine, &request) {
                Ok(results) => results,
                Err(err) => {
                    error!(%err, "async query failed");
                    Vec::new()
                }
            };

            let delivered = owner.post(move || {
                registry.lock().remove(&task_id);
                on_complete(results);
            });
            if !delivered {
                warn!(task_id, "owner queue gone, dropping query completion");
            }
        });

        task_id
    }

    /// Run a dual-radius query off the caller thread. The callback fires
    /// exactly once, on the owner thread, with empty lists on failure.
    pub fn submit_dual(&self, request: DualRadiusRequest, on_complete: DualQueryCallback) -> u64 {
        let task_id = self.register();
        let manager = self.manager.clone();
        let owner = self.owner.clone();
        let registry = self.registry.clone();

        self.pool.spawn(move || {
            let engine = QueryEngine::new(manager);
            let (inner, outer) = match engine.query_dual_radius(
                &request.dataset_dir,
                &request.position,
                request.inner_radius,
                request.outer_radius,
                request.cell_size,
                request.time_step,
            ) {
                Ok(pair) => pair,
                Err(err) => {
                    error!(%err, "async dual-radius query failed");
                    (Vec::new(), Vec::new())
                }
            };

            let delivered = owner.post(move || {
                registry.lock().remove(&task_id);
                on_complete(inner, outer);
            });
            if !delivered {
                warn!(task_id, "owner queue gone, dropping query completion");
            }
        });

        task_id
    }

    fn register(&self) -> u64 {
        let task_id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        self.registry.lock().insert(task_id);
        task_id
    }
}

fn run_query(engine: &QueryEngine, request: &QueryRequest) -> Result<Vec<TrajectoryQueryResult>> {
    match request {
        QueryRequest::Radius { dataset_dir, position, radius, cell_size, time_step } => {
            engine.query_radius(dataset_dir, position, *radius, *cell_size, *time_step)
        }
        QueryRequest::RadiusOverTimeRange {
            dataset_dir,
            position,
            radius,
            cell_size,
            start_time_step,
            end_time_step,
        } => engine.query_radius_over_time_range(
            dataset_dir,
            position,
            *radius,
            *cell_size,
            *start_time_step,
            *end_time_step,
        ),
        QueryRequest::TrajectoryRadiusOverTimeRange {
            dataset_dir,
            trajectory_id,
            radius,
            cell_size,
            start_time_step,
            end_time_step,
        } => engine.query_trajectory_radius_over_time_range(
            dataset_dir,
            *trajectory_id,
            *radius,
            *cell_size,
            *start_time_step,
            *end_time_step,
        ),
    }
}

/// Bind a callback to a weakly-held target. When the target has been
/// dropped by the time the callback fires, it is discarded silently.
pub fn weak_callback<T, F>(target: &Arc<T>, f: F) -> QueryCallback
where
    T: Send + Sync + 'static,
    F: FnOnce(&T, Vec<TrajectoryQueryResult>) + Send + 'static,
{
    let weak: Weak<T> = Arc::downgrade(target);
    Box::new(move |results| {
        if let Some(target) = weak.upgrade() {
            f(&target, results);
        }
    })
}
