//! The per-range half of a K-means iteration.
//!
//! A map task reads the rows of one contiguous range, assigns each to its
//! nearest centroid and sums the vectors per cluster. It never writes to the
//! shared points, so any number of tasks over disjoint ranges can run at once
//! without synchronization. The same function backs both the worker pool and
//! the inline executor.

use crate::error::{Error, Result};
use crate::point_buffer::{PointVector, DIMS};
use crate::point_store::PointMatrix;
use crate::utils::squared_euclidean;
use std::ops::Range;
use std::sync::Arc;

/// One unit of work: a range of rows and the centroids of the current iteration.
#[derive(Clone, Debug)]
pub struct MapTask {
    pub range: Range<usize>,
    pub centroids: Arc<[PointVector]>,
}

/// What a map task hands back to the coordinator.
#[derive(Clone, Debug, PartialEq)]
pub struct PartialAccumulation {
    pub range_start: usize,
    /// Per-cluster vector sums.
    pub sums: Vec<PointVector>,
    /// Per-cluster point counts.
    pub counts: Vec<u32>,
    /// Cluster chosen for each row of the range, indexed from `range_start`.
    pub assignments: Vec<u32>,
}

impl PartialAccumulation {
    pub fn empty(k: usize, range_start: usize) -> Self {
        PartialAccumulation {
            range_start,
            sums: vec![[0.0; DIMS]; k],
            counts: vec![0; k],
            assignments: Vec::new(),
        }
    }
}

/// Index and squared distance of the closest centroid.
///
/// Strict `<` keeps the lowest index on ties.
#[inline]
pub fn nearest_centroid(point: &PointVector, centroids: &[PointVector]) -> (usize, f64) {
    let mut best_c = 0;
    let mut best_dist = f64::INFINITY;

    for (c, centroid) in centroids.iter().enumerate() {
        let dist = squared_euclidean(point, centroid);
        if dist < best_dist {
            best_dist = dist;
            best_c = c;
        }
    }

    (best_c, best_dist)
}

pub fn run_map_task(points: &PointMatrix, task: &MapTask) -> Result<PartialAccumulation> {
    let Range { start, end } = task.range.clone();
    let fail = |message: String| Error::Task {
        start,
        end,
        message,
    };

    if start > end || end > points.len() {
        return Err(fail(format!(
            "range outside the {} available points",
            points.len()
        )));
    }
    if task.centroids.is_empty() {
        return Err(fail("no centroids supplied".into()));
    }
    if let Some(c) = task
        .centroids
        .iter()
        .position(|centroid| centroid.iter().any(|v| !v.is_finite()))
    {
        return Err(fail(format!("centroid {c} is not finite")));
    }

    let k = task.centroids.len();
    let mut partial = PartialAccumulation::empty(k, start);
    partial.assignments.reserve(end - start);

    for i in start..end {
        let point = points.row(i);
        let (c, _) = nearest_centroid(&point, &task.centroids);
        for d in 0..DIMS {
            partial.sums[c][d] += point[d];
        }
        partial.counts[c] += 1;
        partial.assignments.push(c as u32);
    }

    Ok(partial)
}
