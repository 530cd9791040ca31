use crate::point_buffer::PointVector;
use crate::point_store::PointMatrix;
use crate::utils::squared_euclidean;
use rand::distributions::WeightedIndex;
use rand::prelude::*;
use rand::seq::index::sample;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Strategy used to seed initial centroids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum InitStrategy {
    /// `k` distinct points drawn uniformly.
    #[default]
    Random,
    /// K-means++: each next centroid drawn with probability proportional to
    /// its squared distance from the nearest centroid chosen so far.
    #[serde(alias = "kmeans++", alias = "k-means++")]
    KMeansPlusPlus,
}

pub fn initialize<R: Rng>(
    strategy: InitStrategy,
    points: &PointMatrix,
    k: usize,
    rng: &mut R,
) -> Vec<PointVector> {
    match strategy {
        InitStrategy::Random => random_init(points, k, rng),
        InitStrategy::KMeansPlusPlus => kmeans_plus_plus_init(points, k, rng),
    }
}

/// Copies `k` points chosen without replacement.
///
/// Returns every point, in slot order, when `k >= points.len()`, and nothing
/// when `k == 0` or the matrix is empty.
pub fn random_init<R: Rng>(points: &PointMatrix, k: usize, rng: &mut R) -> Vec<PointVector> {
    let n = points.len();
    if k == 0 || n == 0 {
        return Vec::new();
    }
    if k >= n {
        return points.rows();
    }

    let chosen = sample(rng, n, k);
    debug!("random init: selected points {:?}", chosen.clone().into_vec());
    chosen.into_iter().map(|i| points.row(i)).collect()
}

/// K-means++ seeding over distinct points.
pub fn kmeans_plus_plus_init<R: Rng>(
    points: &PointMatrix,
    k: usize,
    rng: &mut R,
) -> Vec<PointVector> {
    let n = points.len();
    if k == 0 || n == 0 {
        return Vec::new();
    }
    if k >= n {
        return points.rows();
    }

    let mut chosen = vec![false; n];
    let mut centroids = Vec::with_capacity(k);

    let first_idx = rng.gen_range(0..n);
    chosen[first_idx] = true;
    centroids.push(points.row(first_idx));
    debug!("k-means++: selected centroid 0 (point {})", first_idx);

    // Squared distance from each point to its nearest chosen centroid.
    let mut min_distances = vec![f64::INFINITY; n];

    for i in 1..k {
        update_min_distances_parallel(points, &centroids[i - 1], &mut min_distances);

        let weights: Vec<f64> = min_distances
            .iter()
            .zip(&chosen)
            .map(|(&d, &taken)| if taken { 0.0 } else { d })
            .collect();

        let next = match WeightedIndex::new(&weights) {
            Ok(dist) => dist.sample(rng),
            // Every remaining point coincides with a centroid.
            Err(_) => {
                let remaining: Vec<usize> = (0..n).filter(|&j| !chosen[j]).collect();
                remaining[rng.gen_range(0..remaining.len())]
            }
        };

        chosen[next] = true;
        centroids.push(points.row(next));
        debug!(
            "k-means++: selected centroid {} (point {}, dist²={:.6})",
            i, next, min_distances[next]
        );
    }

    centroids
}

fn update_min_distances_parallel(
    points: &PointMatrix,
    latest_centroid: &PointVector,
    min_distances: &mut [f64],
) {
    min_distances
        .par_iter_mut()
        .enumerate()
        .for_each(|(i, min_dist)| {
            let dist = squared_euclidean(&points.row(i), latest_centroid);
            if dist < *min_dist {
                *min_dist = dist;
            }
        });
}
