use crate::cities::{City, CityFilter, CityImport};
use crate::config::ClusteringConfig;
use crate::error::{Error, Result};
use crate::ingest::{IngestStats, IngestedPoints, IngestionSession};
use crate::executor::{MapExecutor, PoolExecutor};
use crate::kmeans::{run_clustering_inline, run_clustering_on, ClusteringOutcome, RunHooks};
use crate::point_store::{Point, PointMatrix};
use crate::utils::suggest_num_clusters;
use rayon::prelude::*;
use std::sync::Arc;
use tracing::{info, warn};

/// End-to-end entry point: ingest cities in parallel, then cluster them.
pub struct CityClusterer {
    config: ClusteringConfig,
    hooks: RunHooks,
}

impl CityClusterer {
    pub fn new(config: ClusteringConfig) -> Self {
        Self {
            config,
            hooks: RunHooks::default(),
        }
    }

    pub fn with_hooks(mut self, hooks: RunHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn config(&self) -> &ClusteringConfig {
        &self.config
    }

    pub fn hooks(&self) -> &RunHooks {
        &self.hooks
    }

    /// Writes `points` into a buffer of `capacity` slots from rayon's threads.
    ///
    /// Points past capacity and points with non-finite values are counted in
    /// the returned stats, not reported as errors.
    pub fn ingest(&self, points: &[Point], capacity: usize) -> Result<(IngestedPoints, IngestStats)> {
        let session = IngestionSession::new(capacity)?;

        let stats = points
            .par_iter()
            .map_with(session.writer(), |writer, point| writer.write_point(point.clone()))
            .try_fold(IngestStats::default, |mut stats, outcome| {
                stats.record(outcome)?;
                Ok::<_, Error>(stats)
            })
            .try_reduce(IngestStats::default, |a, b| Ok(a.merge(b)))?;

        if stats.rejected > 0 {
            warn!(
                "buffer full at {} points, {} points rejected",
                capacity, stats.rejected
            );
        }
        info!(
            "ingested {} points ({} rejected, {} invalid)",
            stats.written, stats.rejected, stats.invalid
        );

        Ok((session.finish(), stats))
    }

    /// Clusters on the worker pool, rerunning inline if the pool fails and
    /// `fallback_to_inline` is set.
    pub fn cluster(&self, ingested: &IngestedPoints, k: usize) -> Result<ClusteringOutcome> {
        self.cluster_with(ingested, k, PoolExecutor::new)
    }

    /// [`cluster`](Self::cluster) with a caller-supplied parallel executor.
    ///
    /// Only executor failures (task errors, crashed workers, pool build
    /// errors) are retried inline; validation and termination errors are
    /// returned as they are.
    pub fn cluster_with<E, F>(
        &self,
        ingested: &IngestedPoints,
        k: usize,
        make_executor: F,
    ) -> Result<ClusteringOutcome>
    where
        E: MapExecutor,
        F: FnOnce(Arc<PointMatrix>, usize) -> Result<E>,
    {
        match run_clustering_on(ingested, k, &self.config, &self.hooks, make_executor) {
            Err(e) if self.config.fallback_to_inline && is_pool_failure(&e) => {
                warn!("parallel run failed ({}), retrying on the calling thread", e);
                run_clustering_inline(ingested, k, &self.config, &self.hooks)
            }
            result => result,
        }
    }

    /// Filters an import, ingests what is left and clusters it.
    ///
    /// Without an explicit `k`, `sqrt(n / 2)` clusters are used.
    pub fn cluster_cities(
        &self,
        import: &CityImport,
        filter: &CityFilter,
        k: Option<usize>,
    ) -> Result<ClusteringOutcome> {
        let selected: Vec<&City> = filter.apply(&import.cities);
        let points: Vec<Point> = selected.iter().map(|city| city.to_point()).collect();
        info!(
            "{} of {} cities selected for clustering",
            points.len(),
            import.cities.len()
        );

        let (ingested, _) = self.ingest(&points, points.len().max(1))?;
        let k = k.unwrap_or_else(|| suggest_num_clusters(ingested.len()));
        self.cluster(&ingested, k)
    }
}

fn is_pool_failure(e: &Error) -> bool {
    matches!(
        e,
        Error::Task { .. } | Error::WorkerCrashed(_) | Error::PoolBuild(_)
    )
}
