use crate::point_buffer::PointVector;
use std::ops::Range;

pub const MIN_WORKERS: usize = 2;
pub const MAX_WORKERS: usize = 8;

/// Rule-of-thumb cluster count, `sqrt(n / 2)`, clamped to `[2, n]`.
pub fn suggest_num_clusters(num_points: usize) -> usize {
    let k = ((num_points as f64) / 2.0).sqrt().round() as usize;
    k.max(2).min(num_points)
}

/// Worker count derived from the host's reported parallelism, clamped to `[2, 8]`.
pub fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(MIN_WORKERS)
        .clamp(MIN_WORKERS, MAX_WORKERS)
}

/// Splits `0..total` into at most `parts` contiguous, disjoint ranges covering it.
///
/// Range sizes differ by at most one; the first `total % parts` ranges take the
/// extra element. Empty ranges are never returned, so `total < parts` yields
/// `total` single-element ranges.
pub fn partition_ranges(total: usize, parts: usize) -> Vec<Range<usize>> {
    if total == 0 || parts == 0 {
        return Vec::new();
    }

    let base = total / parts;
    let remainder = total % parts;
    let mut ranges = Vec::with_capacity(parts.min(total));
    let mut start = 0;

    for i in 0..parts {
        let len = base + usize::from(i < remainder);
        if len == 0 {
            break;
        }
        ranges.push(start..start + len);
        start += len;
    }

    ranges
}

#[inline]
pub fn squared_euclidean(a: &PointVector, b: &PointVector) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

#[inline]
pub fn euclidean(a: &PointVector, b: &PointVector) -> f64 {
    squared_euclidean(a, b).sqrt()
}
