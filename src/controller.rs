//! Distributed execution controllers.
//!
//! A controller maps independent per-gene tasks across workers and gathers
//! their outcomes. Two variants are provided: [`WorkerPoolController`]
//! feeds a pool of worker threads through bounded channels and returns
//! results in completion order, and [`GraphController`] broadcasts the
//! shared batch state once, schedules one deferred node per gene, and
//! gathers futures, releasing every broadcast handle and pending future on
//! every exit path before the batch ends.
//!
//! Controllers are plain values handed to the engine at construction time;
//! there is no process-wide "current backend" state.

use crossbeam_channel::{bounded, Receiver};
use std::any::Any;
use std::sync::Arc;
use std::thread;
use thiserror::Error;

use crate::task::{run_gene, BatchContext, GeneTask, TaskOutcome};

/// The maximum number of queued tasks awaiting a free worker. Provides
/// backpressure against the dispatching thread.
const TASK_CHANNEL_BOUND: usize = 1024;

/// Lifecycle of one distributed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Idle,
    Connected,
    Broadcasting,
    Dispatched,
    Gathered,
    Released,
}

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("controller is not connected; connect() must precede dispatch")]
    NotConnected,
    #[error("invalid batch transition from {from:?} to {to:?}")]
    InvalidTransition { from: BatchState, to: BatchState },
    #[error("backend lost workers mid-batch: gathered {returned} of {expected} results")]
    WorkerLost { expected: usize, returned: usize },
}

/// Capability set every execution backend must provide.
pub trait ExecutionController {
    /// Establishes the backend. A batch may only be dispatched while
    /// connected; connection failure is fatal to the batch.
    fn connect(&mut self) -> Result<(), ControllerError>;

    /// Distributes one task per gene and gathers all outcomes. The returned
    /// collection is not guaranteed to be in submission order; callers must
    /// reorder by each outcome's embedded gene index. On return (success or
    /// failure) the controller is idle again and any broadcast resources
    /// have been released.
    fn map(
        &mut self,
        ctx: Arc<BatchContext>,
        tasks: &[GeneTask],
    ) -> Result<Vec<TaskOutcome>, ControllerError>;

    /// Barrier across workers. The in-process variants have nothing to wait
    /// for, but still refuse to sync while unconnected.
    fn sync_processes(&mut self) -> Result<(), ControllerError>;
}

fn legal_transition(from: BatchState, to: BatchState) -> bool {
    use BatchState::*;
    matches!(
        (from, to),
        (Idle, Connected)
            | (Connected, Broadcasting)
            | (Connected, Dispatched)
            | (Broadcasting, Dispatched)
            | (Dispatched, Gathered)
            | (Gathered, Released)
            | (Released, Idle)
    )
}

// ---------------------------------------------------------------------------
// Worker-pool variant
// ---------------------------------------------------------------------------

/// A fixed or elastic pool of worker threads fed through bounded channels.
pub struct WorkerPoolController {
    workers: usize,
    state: BatchState,
}

impl WorkerPoolController {
    /// `workers = None` sizes the pool to the machine.
    pub fn new(workers: Option<usize>) -> Self {
        Self {
            workers: workers.unwrap_or_else(num_cpus::get).max(1),
            state: BatchState::Idle,
        }
    }

    fn advance(&mut self, to: BatchState) {
        debug_assert!(legal_transition(self.state, to));
        self.state = to;
    }
}

impl ExecutionController for WorkerPoolController {
    fn connect(&mut self) -> Result<(), ControllerError> {
        if !legal_transition(self.state, BatchState::Connected) {
            return Err(ControllerError::InvalidTransition {
                from: self.state,
                to: BatchState::Connected,
            });
        }
        self.state = BatchState::Connected;
        log::debug!("worker pool connected with {} workers", self.workers);
        Ok(())
    }

    fn map(
        &mut self,
        ctx: Arc<BatchContext>,
        tasks: &[GeneTask],
    ) -> Result<Vec<TaskOutcome>, ControllerError> {
        if self.state != BatchState::Connected {
            return Err(ControllerError::NotConnected);
        }
        self.advance(BatchState::Dispatched);

        let expected = tasks.len();
        let (task_tx, task_rx) = bounded::<GeneTask>(TASK_CHANNEL_BOUND);
        let (result_tx, result_rx) = bounded::<TaskOutcome>(expected.max(1));
        let outcomes = thread::scope(|scope| {
            for worker in 0..self.workers {
                let task_rx = task_rx.clone();
                let result_tx = result_tx.clone();
                let ctx = Arc::clone(&ctx);
                scope.spawn(move || {
                    log::trace!("worker {worker} online");
                    for task in task_rx.iter() {
                        if result_tx.send(run_gene(&ctx, task.index)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(task_rx);
            drop(result_tx);
            for task in tasks {
                if task_tx.send(*task).is_err() {
                    // Every worker has exited; the shortfall is detected
                    // from the result count below.
                    break;
                }
            }
            drop(task_tx);
            result_rx.iter().collect::<Vec<_>>()
        });

        self.advance(BatchState::Gathered);
        self.advance(BatchState::Released);
        self.advance(BatchState::Idle);

        if outcomes.len() != expected {
            return Err(ControllerError::WorkerLost {
                expected,
                returned: outcomes.len(),
            });
        }
        Ok(outcomes)
    }

    fn sync_processes(&mut self) -> Result<(), ControllerError> {
        if self.state != BatchState::Connected {
            return Err(ControllerError::NotConnected);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Broadcast graph variant
// ---------------------------------------------------------------------------

/// Reference to data broadcast once for the lifetime of a batch.
pub struct BroadcastHandle<T: ?Sized> {
    value: Arc<T>,
}

impl<T: ?Sized> Clone for BroadcastHandle<T> {
    fn clone(&self) -> Self {
        Self {
            value: Arc::clone(&self.value),
        }
    }
}

impl<T: ?Sized> BroadcastHandle<T> {
    pub fn get(&self) -> &T {
        &self.value
    }
}

/// One deferred node of the task graph: a gene index plus the broadcast
/// batch state it reads.
pub struct GeneNode {
    pub task: GeneTask,
    pub ctx: BroadcastHandle<BatchContext>,
}

/// A pending outcome produced by [`GraphController::compute`].
pub struct TaskFuture {
    index: usize,
    rx: Receiver<TaskOutcome>,
}

/// Owns every broadcast handle and pending future registered during a
/// batch. Dropping the scope releases them, so release happens even when
/// execution errors out partway through.
#[derive(Default)]
struct BroadcastScope {
    handles: Vec<Arc<dyn Any + Send + Sync>>,
    pending: Vec<Receiver<TaskOutcome>>,
    released: bool,
}

impl BroadcastScope {
    fn release(&mut self) {
        if self.released {
            return;
        }
        let n = self.handles.len() + self.pending.len();
        self.handles.clear();
        self.pending.clear();
        self.released = true;
        log::debug!("released {n} broadcast handles and pending futures");
    }
}

impl Drop for BroadcastScope {
    fn drop(&mut self) {
        self.release();
    }
}

/// Lazy-graph-with-broadcast execution on the rayon thread pool.
pub struct GraphController {
    state: BatchState,
    scope: Option<BroadcastScope>,
}

impl Default for GraphController {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphController {
    pub fn new() -> Self {
        Self {
            state: BatchState::Idle,
            scope: None,
        }
    }

    /// Broadcasts a shared value, registering the handle for end-of-batch
    /// release. Only legal during the broadcasting phase of a batch.
    pub fn scatter<T: Send + Sync + 'static>(
        &mut self,
        value: Arc<T>,
    ) -> Result<BroadcastHandle<T>, ControllerError> {
        if self.state != BatchState::Broadcasting {
            return Err(ControllerError::InvalidTransition {
                from: self.state,
                to: BatchState::Broadcasting,
            });
        }
        let scope = self.scope.as_mut().ok_or(ControllerError::NotConnected)?;
        scope.handles.push(Arc::clone(&value) as Arc<dyn Any + Send + Sync>);
        Ok(BroadcastHandle { value })
    }

    /// Schedules every node of the graph and returns one future per node.
    pub fn compute(&mut self, nodes: Vec<GeneNode>) -> Result<Vec<TaskFuture>, ControllerError> {
        if self.state != BatchState::Broadcasting {
            return Err(ControllerError::InvalidTransition {
                from: self.state,
                to: BatchState::Dispatched,
            });
        }
        self.state = BatchState::Dispatched;
        let scope = self.scope.as_mut().ok_or(ControllerError::NotConnected)?;
        let mut futures = Vec::with_capacity(nodes.len());
        for node in nodes {
            let (tx, rx) = bounded::<TaskOutcome>(1);
            scope.pending.push(rx.clone());
            let index = node.task.index;
            rayon::spawn(move || {
                let outcome = run_gene(node.ctx.get(), index);
                let _ = tx.send(outcome);
            });
            futures.push(TaskFuture { index, rx });
        }
        Ok(futures)
    }

    /// Blocks until every future resolves. A dropped sender means the
    /// backend lost the worker computing that node, which is fatal to the
    /// batch (broadcast resources are still released by the caller's scope).
    pub fn gather(&mut self, futures: Vec<TaskFuture>) -> Result<Vec<TaskOutcome>, ControllerError> {
        if self.state != BatchState::Dispatched {
            return Err(ControllerError::InvalidTransition {
                from: self.state,
                to: BatchState::Gathered,
            });
        }
        let expected = futures.len();
        let mut outcomes = Vec::with_capacity(expected);
        for future in futures {
            match future.rx.recv() {
                Ok(outcome) => outcomes.push(outcome),
                Err(_) => {
                    log::error!("node for gene row {} was dropped by the backend", future.index);
                    return Err(ControllerError::WorkerLost {
                        expected,
                        returned: outcomes.len(),
                    });
                }
            }
        }
        self.state = BatchState::Gathered;
        Ok(outcomes)
    }

    /// Drops a pending future without waiting for it.
    pub fn cancel(&mut self, future: TaskFuture) {
        log::debug!("cancelled pending node for gene row {}", future.index);
        drop(future);
    }

    fn dispatch(
        &mut self,
        ctx: Arc<BatchContext>,
        tasks: &[GeneTask],
    ) -> Result<Vec<TaskOutcome>, ControllerError> {
        let handle = self.scatter(ctx)?;
        let nodes: Vec<GeneNode> = tasks
            .iter()
            .map(|&task| GeneNode {
                task,
                ctx: handle.clone(),
            })
            .collect();
        let futures = self.compute(nodes)?;
        self.gather(futures)
    }
}

impl ExecutionController for GraphController {
    fn connect(&mut self) -> Result<(), ControllerError> {
        if !legal_transition(self.state, BatchState::Connected) {
            return Err(ControllerError::InvalidTransition {
                from: self.state,
                to: BatchState::Connected,
            });
        }
        self.state = BatchState::Connected;
        log::debug!(
            "graph backend connected over {} rayon threads",
            rayon::current_num_threads()
        );
        Ok(())
    }

    fn map(
        &mut self,
        ctx: Arc<BatchContext>,
        tasks: &[GeneTask],
    ) -> Result<Vec<TaskOutcome>, ControllerError> {
        if self.state != BatchState::Connected {
            return Err(ControllerError::NotConnected);
        }
        self.state = BatchState::Broadcasting;
        self.scope = Some(BroadcastScope::default());

        let result = self.dispatch(ctx, tasks);

        // Guaranteed release: the scope is torn down on success and on every
        // error path before the controller goes idle.
        if let Some(mut scope) = self.scope.take() {
            scope.release();
        }
        self.state = BatchState::Released;
        self.state = BatchState::Idle;
        result
    }

    fn sync_processes(&mut self) -> Result<(), ControllerError> {
        if self.state != BatchState::Connected {
            return Err(ControllerError::NotConnected);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::BestSubsetSolver;
    use ndarray::Array2;

    fn context(genes: usize) -> Arc<BatchContext> {
        let predictors = 3;
        let samples = 8;
        let design = Array2::from_shape_fn((predictors, samples), |(i, j)| {
            ((i * 7 + j * 3) % 5) as f64 - 2.0
        });
        let response = Array2::from_shape_fn((genes, samples), |(i, j)| {
            design[[i % predictors, j]] * (i as f64 + 1.0)
        });
        Arc::new(BatchContext {
            design,
            response,
            pool: Array2::from_elem((genes, predictors), true),
            weights: Array2::from_elem((genes, predictors), 1.0),
            genes: (0..genes).map(|i| format!("G{i}")).collect(),
            predictors: (0..predictors).map(|j| format!("TF{j}")).collect(),
            n_sub: 2,
            solver: Arc::new(BestSubsetSolver),
        })
    }

    fn tasks(n: usize) -> Vec<GeneTask> {
        (0..n).map(|index| GeneTask { index }).collect()
    }

    #[test]
    fn pool_map_requires_connect() {
        let ctx = context(2);
        let mut controller = WorkerPoolController::new(Some(2));
        let err = controller.map(ctx, &tasks(2));
        assert!(matches!(err, Err(ControllerError::NotConnected)));
    }

    #[test]
    fn pool_map_returns_every_gene_once() {
        let ctx = context(9);
        let mut controller = WorkerPoolController::new(Some(3));
        controller.connect().unwrap();
        controller.sync_processes().unwrap();
        let outcomes = controller.map(ctx, &tasks(9)).unwrap();
        let mut seen: Vec<usize> = outcomes
            .iter()
            .map(|o| o.as_ref().unwrap().index)
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..9).collect::<Vec<_>>());
    }

    #[test]
    fn pool_is_reusable_across_batches() {
        let mut controller = WorkerPoolController::new(Some(2));
        for _ in 0..2 {
            controller.connect().unwrap();
            let outcomes = controller.map(context(4), &tasks(4)).unwrap();
            assert_eq!(outcomes.len(), 4);
        }
    }

    #[test]
    fn double_connect_is_an_invalid_transition() {
        let mut controller = WorkerPoolController::new(Some(1));
        controller.connect().unwrap();
        assert!(matches!(
            controller.connect(),
            Err(ControllerError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn graph_map_returns_every_gene_once() {
        let ctx = context(7);
        let mut controller = GraphController::new();
        controller.connect().unwrap();
        let outcomes = controller.map(ctx, &tasks(7)).unwrap();
        let mut seen: Vec<usize> = outcomes
            .iter()
            .map(|o| o.as_ref().unwrap().index)
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..7).collect::<Vec<_>>());
    }

    #[test]
    fn graph_releases_broadcast_handles_after_map() {
        let ctx = context(5);
        let mut controller = GraphController::new();
        controller.connect().unwrap();
        controller.map(Arc::clone(&ctx), &tasks(5)).unwrap();
        // Only the caller's reference survives the batch. A worker may still
        // be dropping its handle clone when gather returns, so poll briefly.
        for _ in 0..200 {
            if Arc::strong_count(&ctx) == 1 {
                break;
            }
            thread::sleep(std::time::Duration::from_millis(1));
        }
        assert_eq!(Arc::strong_count(&ctx), 1);
        assert!(controller.scope.is_none());
    }

    #[test]
    fn graph_scatter_outside_a_batch_is_rejected() {
        let mut controller = GraphController::new();
        controller.connect().unwrap();
        let err = controller.scatter(Arc::new(1usize));
        assert!(matches!(
            err,
            Err(ControllerError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn sync_requires_connection() {
        let mut controller = GraphController::new();
        assert!(matches!(
            controller.sync_processes(),
            Err(ControllerError::NotConnected)
        ));
    }

    /// Puts a connected graph controller into its broadcasting phase, the
    /// way `map` does before dispatching.
    fn begin_broadcast(controller: &mut GraphController) {
        controller.state = BatchState::Broadcasting;
        controller.scope = Some(BroadcastScope::default());
    }

    #[test]
    fn cancelled_future_is_skipped_and_the_batch_still_releases() {
        let ctx = context(3);
        let mut controller = GraphController::new();
        controller.connect().unwrap();
        begin_broadcast(&mut controller);

        let handle = controller.scatter(Arc::clone(&ctx)).unwrap();
        let nodes: Vec<GeneNode> = (0..3)
            .map(|index| GeneNode {
                task: GeneTask { index },
                ctx: handle.clone(),
            })
            .collect();
        drop(handle);
        let mut futures = controller.compute(nodes).unwrap();
        let dropped = futures.pop().unwrap();
        controller.cancel(dropped);

        let outcomes = controller.gather(futures).unwrap();
        assert_eq!(outcomes.len(), 2);
        let mut seen: Vec<usize> = outcomes
            .iter()
            .map(|o| o.as_ref().unwrap().index)
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1]);

        if let Some(mut scope) = controller.scope.take() {
            scope.release();
        }
        // The cancelled node's worker may still be finishing; poll until its
        // handle clone is gone too.
        for _ in 0..200 {
            if Arc::strong_count(&ctx) == 1 {
                break;
            }
            thread::sleep(std::time::Duration::from_millis(1));
        }
        assert_eq!(Arc::strong_count(&ctx), 1);
    }

    #[test]
    fn gather_reports_a_lost_worker_and_releases_on_drop() {
        let ctx = context(2);
        let mut controller = GraphController::new();
        controller.connect().unwrap();
        begin_broadcast(&mut controller);

        let handle = controller.scatter(Arc::clone(&ctx)).unwrap();
        let mut futures = controller
            .compute(vec![GeneNode {
                task: GeneTask { index: 0 },
                ctx: handle.clone(),
            }])
            .unwrap();
        drop(handle);

        // A node whose worker vanished before ever sending its outcome.
        let (lost_tx, lost_rx) = bounded::<TaskOutcome>(1);
        drop(lost_tx);
        futures.push(TaskFuture {
            index: 1,
            rx: lost_rx,
        });

        match controller.gather(futures) {
            Err(ControllerError::WorkerLost { expected, returned }) => {
                assert_eq!(expected, 2);
                assert_eq!(returned, 1);
            }
            other => panic!("expected WorkerLost, got {other:?}"),
        }

        // The batch errored out mid-gather; dropping the controller must
        // still tear the broadcast scope down.
        drop(controller);
        for _ in 0..200 {
            if Arc::strong_count(&ctx) == 1 {
                break;
            }
            thread::sleep(std::time::Duration::from_millis(1));
        }
        assert_eq!(Arc::strong_count(&ctx), 1);
    }

    #[test]
    fn scope_drop_releases_on_error_paths() {
        let payload = Arc::new(42usize);
        {
            let mut scope = BroadcastScope::default();
            scope
                .handles
                .push(Arc::clone(&payload) as Arc<dyn Any + Send + Sync>);
            assert_eq!(Arc::strong_count(&payload), 2);
            // Scope dropped without an explicit release call.
        }
        assert_eq!(Arc::strong_count(&payload), 1);
    }
}
