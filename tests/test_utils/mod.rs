use city_kmeans::point_buffer::PointVector;
use city_kmeans::utils::squared_euclidean;
use city_kmeans::{IngestedPoints, Point};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::io::Write;
use tempfile::NamedTempFile;

/// Header row of the world-cities CSV layout.
#[allow(dead_code)]
pub const CITY_HEADER: &str =
    "city,city_ascii,lat,lng,country,iso2,iso3,admin_name,capital,population,id";

/// Points tightly grouped around each of `centers`, with deterministic noise.
/// Returns (points, true_labels).
#[allow(dead_code)]
pub fn create_gaussian_clusters(
    centers: &[PointVector],
    points_per_cluster: usize,
    spread: f64,
    seed: u64,
) -> (Vec<Point>, Vec<usize>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut points = Vec::with_capacity(centers.len() * points_per_cluster);
    let mut labels = Vec::with_capacity(centers.len() * points_per_cluster);

    for (cluster_id, center) in centers.iter().enumerate() {
        for j in 0..points_per_cluster {
            let mut noise = || rng.gen_range(-spread..spread);
            points.push(Point::new(
                format!("c{cluster_id}-p{j}"),
                center[0] + noise(),
                center[1] + noise(),
                center[2] + noise(),
            ));
            labels.push(cluster_id);
        }
    }

    (points, labels)
}

/// Points scattered over the full lat/lon range with populations up to 10M.
#[allow(dead_code)]
pub fn create_random_cities(n: usize, seed: u64) -> Vec<Point> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|i| {
            Point::new(
                i.to_string(),
                rng.gen_range(-90.0..90.0),
                rng.gen_range(-180.0..180.0),
                rng.gen_range(0.0..10_000_000.0f64).round(),
            )
            .with_name(format!("City {i}"))
        })
        .collect()
}

/// Ingests `points` on the calling thread; panics if any point is rejected.
#[allow(dead_code)]
pub fn ingest(points: Vec<Point>) -> IngestedPoints {
    let expected = points.len();
    let (ingested, stats) = IngestedPoints::from_points(points).expect("ingestion failed");
    assert_eq!(stats.written, expected, "not every point was ingested");
    ingested
}

/// Mean of the given points, in raw units.
#[allow(dead_code)]
pub fn mean_of(points: &[Point]) -> PointVector {
    let mut sum = [0.0; 3];
    for p in points {
        let v = p.vector();
        for d in 0..3 {
            sum[d] += v[d];
        }
    }
    let n = points.len().max(1) as f64;
    [sum[0] / n, sum[1] / n, sum[2] / n]
}

/// Distance from `target` to the closest vector in `candidates`.
#[allow(dead_code)]
pub fn nearest_distance(target: &PointVector, candidates: &[PointVector]) -> f64 {
    candidates
        .iter()
        .map(|c| squared_euclidean(target, c).sqrt())
        .fold(f64::INFINITY, f64::min)
}

#[allow(dead_code)]
pub fn assert_all_finite(values: &[f64], what: &str) {
    for (i, v) in values.iter().enumerate() {
        assert!(v.is_finite(), "{what}[{i}] is not finite: {v}");
    }
}

/// Writes a cities CSV with the standard header followed by `rows`.
#[allow(dead_code)]
pub fn write_city_csv(rows: &[&str]) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("failed to create temp file");
    writeln!(file, "{CITY_HEADER}").expect("failed to write header");
    for row in rows {
        writeln!(file, "{row}").expect("failed to write row");
    }
    file.flush().expect("failed to flush csv");
    file
}
