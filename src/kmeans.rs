//! Coordinator loop: dispatch map tasks, reduce their partials, move the
//! centroids, and stop on convergence, the iteration cap, cancellation or the
//! first task failure.
//!
//! Iterations are strictly sequential. Iteration `n + 1` is only dispatched
//! after every partial of iteration `n` has been reduced, and the reduction
//! only ever runs over a complete set of partials.

use crate::cancel::CancellationToken;
use crate::centroid_init::initialize;
use crate::config::ClusteringConfig;
use crate::error::{Error, Result};
use crate::executor::{InlineExecutor, MapExecutor, PoolExecutor};
use crate::ingest::{IdentityTable, IngestedPoints};
use crate::map_task::{MapTask, PartialAccumulation};
use crate::normalization::{normalization_sample, Normalization};
use crate::point_buffer::{PointVector, SharedPointBuffer, DIMS};
use crate::point_store::{Point, PointMatrix};
use crate::utils::{euclidean, partition_ranges};
use crossbeam_channel::Sender;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Emitted once per completed iteration.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub iteration: usize,
    pub avg_change: f64,
    pub cluster_sizes: Vec<u32>,
    pub converged: bool,
}

pub type ProgressCallback = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

/// Caller-side hooks into a run: progress reporting and cancellation.
#[derive(Clone, Default)]
pub struct RunHooks {
    progress: Option<ProgressCallback>,
    cancel: CancellationToken,
}

impl RunHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Called on the coordinator thread after each iteration; keep it short.
    pub fn with_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ProgressEvent) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(callback));
        self
    }

    /// Forwards events into `tx` without blocking; a full channel drops the event.
    pub fn with_progress_channel(self, tx: Sender<ProgressEvent>) -> Self {
        self.with_progress(move |event| {
            let _ = tx.try_send(event.clone());
        })
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    fn emit(&self, event: &ProgressEvent) {
        if let Some(progress) = &self.progress {
            progress(event);
        }
    }
}

/// Why a completed run stopped iterating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    Converged,
    CappedOut,
}

/// A centroid in original units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoCentroid {
    pub latitude: f64,
    pub longitude: f64,
    pub population: f64,
}

impl From<PointVector> for GeoCentroid {
    fn from(v: PointVector) -> Self {
        GeoCentroid {
            latitude: v[0],
            longitude: v[1],
            population: v[2],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterResult {
    pub index: usize,
    pub centroid: GeoCentroid,
    pub size: u32,
    pub cities: Vec<Point>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusteringReport {
    pub clusters: Vec<ClusterResult>,
    /// Cluster index per slot, from the last iteration.
    pub assignments: Vec<u32>,
    pub iterations: usize,
    pub termination: Termination,
    /// Mean centroid movement of the last iteration, in normalized units.
    pub avg_change: f64,
    pub normalization: Normalization,
}

impl ClusteringReport {
    pub fn converged(&self) -> bool {
        self.termination == Termination::Converged
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn write_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub enum ClusteringOutcome {
    Completed(ClusteringReport),
    /// Stopped on request. No partial result is produced.
    Cancelled { iterations_completed: usize },
}

impl ClusteringOutcome {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ClusteringOutcome::Cancelled { .. })
    }

    pub fn report(&self) -> Option<&ClusteringReport> {
        match self {
            ClusteringOutcome::Completed(report) => Some(report),
            ClusteringOutcome::Cancelled { .. } => None,
        }
    }

    pub fn into_report(self) -> Option<ClusteringReport> {
        match self {
            ClusteringOutcome::Completed(report) => Some(report),
            ClusteringOutcome::Cancelled { .. } => None,
        }
    }
}

/// Everything decided before the first iteration: validated `k`,
/// normalization bounds, the normalized points and the initial centroids.
pub struct PreparedRun {
    points: Arc<PointMatrix>,
    normalization: Normalization,
    centroids: Vec<PointVector>,
    rng: StdRng,
}

impl PreparedRun {
    /// Fails with [`Error::InvalidK`] unless the buffer is non-empty and `2 <= k <= n`.
    pub fn new(buffer: &SharedPointBuffer, k: usize, config: &ClusteringConfig) -> Result<Self> {
        config.validate()?;

        let n = buffer.committed_count();
        if n == 0 || k < 2 || k > n {
            return Err(Error::InvalidK {
                requested: k,
                n_points: n,
            });
        }

        let mut rng = StdRng::seed_from_u64(config.seed);

        // The only read of the buffer; fails on a claimed but unwritten slot.
        let raw = buffer.committed_vectors()?;
        let sample = normalization_sample(&raw, config.normalization_sample, &mut rng);
        let normalization = Normalization::compute(&sample);
        let points = Arc::new(PointMatrix::normalized(&raw, &normalization));

        let centroids = initialize(config.init, &points, k, &mut rng);

        info!(
            "prepared k-means run: n={}, k={}, init={:?}, workers={}, max_iter={}, epsilon={}",
            n, k, config.init, config.worker_count, config.max_iter, config.epsilon
        );
        debug!("normalization bounds: {:?}", normalization);

        Ok(PreparedRun {
            points,
            normalization,
            centroids,
            rng,
        })
    }

    pub fn points(&self) -> Arc<PointMatrix> {
        Arc::clone(&self.points)
    }

    pub fn normalization(&self) -> &Normalization {
        &self.normalization
    }

    pub fn initial_centroids(&self) -> &[PointVector] {
        &self.centroids
    }

    pub fn k(&self) -> usize {
        self.centroids.len()
    }
}

/// Clusters on a fresh worker pool of `config.worker_count` threads.
pub fn run_clustering(
    ingested: &IngestedPoints,
    k: usize,
    config: &ClusteringConfig,
    hooks: &RunHooks,
) -> Result<ClusteringOutcome> {
    run_clustering_on(ingested, k, config, hooks, PoolExecutor::new)
}

/// Same computation as [`run_clustering`], executed on the calling thread.
pub fn run_clustering_inline(
    ingested: &IngestedPoints,
    k: usize,
    config: &ClusteringConfig,
    hooks: &RunHooks,
) -> Result<ClusteringOutcome> {
    run_clustering_on(ingested, k, config, hooks, |points, _| {
        Ok(InlineExecutor::new(points))
    })
}

/// Prepares the run, then builds the executor with
/// `make_executor(points, config.worker_count)`.
///
/// `make_executor` is only called once `k` and `config` have been validated.
pub fn run_clustering_on<E, F>(
    ingested: &IngestedPoints,
    k: usize,
    config: &ClusteringConfig,
    hooks: &RunHooks,
    make_executor: F,
) -> Result<ClusteringOutcome>
where
    E: MapExecutor,
    F: FnOnce(Arc<PointMatrix>, usize) -> Result<E>,
{
    let prepared = PreparedRun::new(&ingested.buffer, k, config)?;
    let mut executor = make_executor(prepared.points(), config.worker_count)?;
    cluster_with_executor(prepared, &mut executor, &ingested.identities, config, hooks)
}

/// Runs the iteration loop on `executor` and shuts it down on every exit path.
pub fn cluster_with_executor<E: MapExecutor>(
    mut prepared: PreparedRun,
    executor: &mut E,
    identities: &IdentityTable,
    config: &ClusteringConfig,
    hooks: &RunHooks,
) -> Result<ClusteringOutcome> {
    let result = iterate(&mut prepared, executor, config, hooks);
    executor.shutdown();

    match result {
        Ok(LoopOutcome::Finished(state)) => Ok(ClusteringOutcome::Completed(assemble_report(
            &prepared, state, identities,
        ))),
        Ok(LoopOutcome::Cancelled {
            iterations_completed,
        }) => Ok(ClusteringOutcome::Cancelled {
            iterations_completed,
        }),
        Err(e) => {
            warn!("k-means run failed: {}", e);
            Err(e)
        }
    }
}

struct FinalState {
    centroids: Vec<PointVector>,
    counts: Vec<u32>,
    assignments: Vec<u32>,
    iterations: usize,
    termination: Termination,
    avg_change: f64,
}

enum LoopOutcome {
    Finished(FinalState),
    Cancelled { iterations_completed: usize },
}

/// Merged result of one iteration's map tasks.
struct Reduced {
    sums: Vec<PointVector>,
    counts: Vec<u32>,
    assignments: Vec<u32>,
}

fn iterate<E: MapExecutor>(
    prepared: &mut PreparedRun,
    executor: &mut E,
    config: &ClusteringConfig,
    hooks: &RunHooks,
) -> Result<LoopOutcome> {
    let n = prepared.points.len();
    let k = prepared.centroids.len();
    let ranges = partition_ranges(n, config.worker_count);

    let mut centroids = prepared.centroids.clone();
    let mut previous_assignments: Option<Vec<u32>> = None;
    let mut iteration = 0;

    loop {
        if hooks.cancel.is_cancelled() {
            info!("k-means cancelled after {} iterations", iteration);
            return Ok(LoopOutcome::Cancelled {
                iterations_completed: iteration,
            });
        }
        iteration += 1;

        let shared: Arc<[PointVector]> = Arc::from(centroids.as_slice());
        let tasks: Vec<MapTask> = ranges
            .iter()
            .map(|range| MapTask {
                range: range.clone(),
                centroids: Arc::clone(&shared),
            })
            .collect();

        let partials = executor.execute(tasks)?;
        let reduced = reduce(partials, k, n)?;

        let (next, reinitialized) = update_centroids(&reduced, &prepared.points, &mut prepared.rng);
        let avg_change = average_change(&centroids, &next, &reinitialized);
        let stable = previous_assignments
            .as_ref()
            .is_some_and(|previous| *previous == reduced.assignments);
        let reseeded = reinitialized.iter().filter(|&&r| r).count();
        // A reseeded centroid has not settled yet.
        let converged = (avg_change < config.epsilon || stable) && reseeded == 0;

        hooks.emit(&ProgressEvent {
            iteration,
            avg_change,
            cluster_sizes: reduced.counts.clone(),
            converged,
        });
        debug!(
            "iteration {}: avg change {:.6}, assignments stable: {}, reseeded: {}",
            iteration, avg_change, stable, reseeded
        );

        centroids = next;

        let termination = if converged {
            info!("k-means converged at iteration {}", iteration);
            Some(Termination::Converged)
        } else if iteration >= config.max_iter {
            info!("k-means reached the iteration cap ({})", config.max_iter);
            Some(Termination::CappedOut)
        } else {
            None
        };

        match termination {
            Some(termination) => {
                return Ok(LoopOutcome::Finished(FinalState {
                    centroids,
                    counts: reduced.counts,
                    assignments: reduced.assignments,
                    iterations: iteration,
                    termination,
                    avg_change,
                }))
            }
            None => previous_assignments = Some(reduced.assignments),
        }
    }
}

/// Sums partials elementwise and stitches the assignment vector back together.
///
/// Partials are folded in `range_start` order so the floating-point result
/// does not depend on which task finished first.
fn reduce(mut partials: Vec<PartialAccumulation>, k: usize, n: usize) -> Result<Reduced> {
    partials.sort_by_key(|p| p.range_start);

    let mut reduced = Reduced {
        sums: vec![[0.0; DIMS]; k],
        counts: vec![0; k],
        assignments: vec![0; n],
    };
    let mut covered = 0;

    for partial in &partials {
        let end = partial.range_start + partial.assignments.len();
        if partial.sums.len() != k || partial.counts.len() != k || end > n {
            return Err(Error::Task {
                start: partial.range_start,
                end,
                message: "malformed partial accumulation".into(),
            });
        }

        for c in 0..k {
            for d in 0..DIMS {
                reduced.sums[c][d] += partial.sums[c][d];
            }
            reduced.counts[c] += partial.counts[c];
        }
        reduced.assignments[partial.range_start..end].copy_from_slice(&partial.assignments);
        covered += partial.assignments.len();
    }

    if covered != n {
        return Err(Error::Task {
            start: 0,
            end: n,
            message: format!("partials cover {covered} of {n} points"),
        });
    }

    Ok(reduced)
}

/// New centroid per cluster; empty clusters are moved to a random point.
///
/// Returns the centroids and, per cluster, whether it was reseeded.
fn update_centroids(
    reduced: &Reduced,
    points: &PointMatrix,
    rng: &mut StdRng,
) -> (Vec<PointVector>, Vec<bool>) {
    let k = reduced.counts.len();
    let mut centroids = vec![[0.0; DIMS]; k];
    let mut reinitialized = vec![false; k];

    for c in 0..k {
        let count = reduced.counts[c];
        if count > 0 {
            for d in 0..DIMS {
                centroids[c][d] = reduced.sums[c][d] / count as f64;
            }
        } else {
            let ri = rng.gen_range(0..points.len());
            centroids[c] = points.row(ri);
            reinitialized[c] = true;
            warn!("cluster {} is empty, reseeding it at point {}", c, ri);
        }
    }

    (centroids, reinitialized)
}

/// Mean Euclidean movement over the clusters that were not reseeded.
fn average_change(old: &[PointVector], new: &[PointVector], reinitialized: &[bool]) -> f64 {
    let (total, moved) = old
        .iter()
        .zip(new)
        .zip(reinitialized)
        .filter(|(_, &reseeded)| !reseeded)
        .fold((0.0, 0usize), |(total, moved), ((a, b), _)| {
            (total + euclidean(a, b), moved + 1)
        });

    if moved == 0 {
        0.0
    } else {
        total / moved as f64
    }
}

fn assemble_report(
    prepared: &PreparedRun,
    state: FinalState,
    identities: &IdentityTable,
) -> ClusteringReport {
    let mut clusters: Vec<ClusterResult> = state
        .centroids
        .iter()
        .zip(&state.counts)
        .enumerate()
        .map(|(index, (centroid, &size))| ClusterResult {
            index,
            centroid: GeoCentroid::from(prepared.normalization.invert(centroid)),
            size,
            cities: Vec::with_capacity(size as usize),
        })
        .collect();

    let mut unresolved = 0;
    for (slot, &c) in state.assignments.iter().enumerate() {
        match identities.get(slot) {
            Some(point) => clusters[c as usize].cities.push(point.clone()),
            None => unresolved += 1,
        }
    }
    if unresolved > 0 {
        warn!("{} clustered slots have no identity on record", unresolved);
    }

    ClusteringReport {
        clusters,
        assignments: state.assignments,
        iterations: state.iterations,
        termination: state.termination,
        avg_change: state.avg_change,
        normalization: prepared.normalization,
    }
}
