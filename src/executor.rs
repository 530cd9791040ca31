use crate::error::Result;
use crate::map_task::{run_map_task, MapTask, PartialAccumulation};
use crate::point_store::PointMatrix;
use crate::worker_pool::WorkerPool;
use std::sync::Arc;

/// Runs one iteration's map tasks and hands back every partial, or the first error.
pub trait MapExecutor {
    fn execute(&mut self, tasks: Vec<MapTask>) -> Result<Vec<PartialAccumulation>>;

    /// Releases execution resources. Called once the run is over, on every path.
    fn shutdown(&mut self) {}
}

/// Dispatches map tasks to a [`WorkerPool`] whose handler reads the shared matrix.
pub struct PoolExecutor {
    pool: WorkerPool<MapTask, PartialAccumulation>,
}

impl PoolExecutor {
    pub fn new(points: Arc<PointMatrix>, worker_count: usize) -> Result<Self> {
        let pool = WorkerPool::new(worker_count, move |task: MapTask| {
            run_map_task(&points, &task)
        })?;
        Ok(PoolExecutor { pool })
    }

    pub fn pool(&self) -> &WorkerPool<MapTask, PartialAccumulation> {
        &self.pool
    }
}

impl MapExecutor for PoolExecutor {
    fn execute(&mut self, tasks: Vec<MapTask>) -> Result<Vec<PartialAccumulation>> {
        let handles: Vec<_> = tasks.into_iter().map(|task| self.pool.submit(task)).collect();
        handles.into_iter().map(|handle| handle.wait()).collect()
    }

    fn shutdown(&mut self) {
        self.pool.terminate();
    }
}

/// Runs map tasks one after another on the calling thread.
pub struct InlineExecutor {
    points: Arc<PointMatrix>,
}

impl InlineExecutor {
    pub fn new(points: Arc<PointMatrix>) -> Self {
        InlineExecutor { points }
    }
}

impl MapExecutor for InlineExecutor {
    fn execute(&mut self, tasks: Vec<MapTask>) -> Result<Vec<PartialAccumulation>> {
        tasks
            .iter()
            .map(|task| run_map_task(&self.points, task))
            .collect()
    }
}
