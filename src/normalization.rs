//! Min/max rescaling so that no dimension dominates the distance.
//!
//! Population spans several orders of magnitude more than latitude or
//! longitude degrees; left raw, it alone would decide every assignment.

use crate::point_buffer::{PointVector, DIMS};
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Per-dimension bounds computed once per run.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Normalization {
    pub min: PointVector,
    pub max: PointVector,
}

impl Default for Normalization {
    /// Full latitude/longitude range, population in `[0, 1]`.
    fn default() -> Self {
        Normalization {
            min: [-90.0, -180.0, 0.0],
            max: [90.0, 180.0, 1.0],
        }
    }
}

impl Normalization {
    /// Scans `sample` once for per-dimension min and max.
    ///
    /// An empty sample yields [`Normalization::default`]; rejecting empty
    /// datasets is the caller's job.
    pub fn compute(sample: &[PointVector]) -> Self {
        if sample.is_empty() {
            return Normalization::default();
        }

        let (min, max) = sample
            .par_iter()
            .fold(
                || ([f64::INFINITY; DIMS], [f64::NEG_INFINITY; DIMS]),
                |(mut min, mut max), v| {
                    for d in 0..DIMS {
                        min[d] = min[d].min(v[d]);
                        max[d] = max[d].max(v[d]);
                    }
                    (min, max)
                },
            )
            .reduce(
                || ([f64::INFINITY; DIMS], [f64::NEG_INFINITY; DIMS]),
                |(mut a_min, mut a_max), (b_min, b_max)| {
                    for d in 0..DIMS {
                        a_min[d] = a_min[d].min(b_min[d]);
                        a_max[d] = a_max[d].max(b_max[d]);
                    }
                    (a_min, a_max)
                },
            );

        Normalization { min, max }
    }

    /// Maps each dimension to `(v - min) / (max - min)`. A flat dimension maps to `0.5`.
    pub fn apply(&self, v: &PointVector) -> PointVector {
        let mut out = [0.0; DIMS];
        for d in 0..DIMS {
            let range = self.max[d] - self.min[d];
            out[d] = if range == 0.0 {
                0.5
            } else {
                (v[d] - self.min[d]) / range
            };
        }
        out
    }

    /// Inverse of [`apply`](Self::apply): `v * (max - min) + min`.
    pub fn invert(&self, v: &PointVector) -> PointVector {
        let mut out = [0.0; DIMS];
        for d in 0..DIMS {
            out[d] = v[d] * (self.max[d] - self.min[d]) + self.min[d];
        }
        out
    }
}

/// Picks the vectors the bounds are computed from.
///
/// `None`, or a size at least as large as the dataset, uses everything.
/// Otherwise draws `size` distinct vectors with `rng`.
pub fn normalization_sample(
    vectors: &[PointVector],
    size: Option<usize>,
    rng: &mut StdRng,
) -> Vec<PointVector> {
    match size {
        Some(size) if size < vectors.len() => sample(rng, vectors.len(), size)
            .into_iter()
            .map(|i| vectors[i])
            .collect(),
        _ => vectors.to_vec(),
    }
}
