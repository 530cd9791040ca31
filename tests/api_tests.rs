mod test_utils;

use city_kmeans::cities::{import_cities, import_cities_file, MAX_ERROR_EXAMPLES};
use city_kmeans::executor::MapExecutor;
use city_kmeans::map_task::{MapTask, PartialAccumulation};
use city_kmeans::point_store::PointMatrix;
use city_kmeans::{
    run_clustering_inline, CityClusterer, CityFilter, ClusteringConfig, ClusteringOutcome, Error,
    IngestedPoints, InitStrategy, Result, RunHooks,
};
use crossbeam_channel::bounded;
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::tempdir;
use test_utils::*;

fn sample_rows() -> Vec<String> {
    let countries = ["Brazil", "Japan", "Brazil", "Germany", "Japan", "Brazil"];
    countries
        .iter()
        .enumerate()
        .map(|(i, country)| {
            let lat = -30.0 + i as f64 * 10.0;
            let lng = -60.0 + i as f64 * 25.0;
            format!(
                "\"City {i}\",\"City {i}\",\"{lat}\",\"{lng}\",\"{country}\",\"xx\",\"xxx\",\"Region\",\"\",\"{}\",\"{}\"",
                (i + 1) * 100_000,
                1000 + i
            )
        })
        .collect()
}

// ============================================================================
// CSV Import Tests
// ============================================================================

#[test]
fn test_import_parses_world_cities_layout() {
    let rows = sample_rows();
    let rows: Vec<&str> = rows.iter().map(String::as_str).collect();
    let file = write_city_csv(&rows);

    let import = import_cities_file(file.path()).expect("import failed");
    assert_eq!(import.total_processed, 6);
    assert_eq!(import.skipped, 0);
    assert_eq!(import.cities.len(), 6);

    let first = &import.cities[0];
    assert_eq!(first.id, 1000);
    assert_eq!(first.city, "City 0");
    assert_eq!(first.lat, -30.0);
    assert_eq!(first.lng, -60.0);
    assert_eq!(first.country, "Brazil");
    assert_eq!(first.iso2.as_deref(), Some("XX"));
    assert_eq!(first.capital, None);
    assert_eq!(first.population, Some(100_000));

    let point = first.to_point();
    assert_eq!(point.id, "1000");
    assert_eq!(point.name.as_deref(), Some("City 0"));
    assert_eq!(point.vector(), [-30.0, -60.0, 100_000.0]);
}

#[test]
fn test_bad_rows_are_skipped_and_reported() {
    let csv = format!(
        "{CITY_HEADER}\n\
         Ok,Ok,1.5,2.5,Peru,PE,PER,Lima,primary,1000,1\n\
         Short,Short,1.5\n\
         BadId,BadId,1.5,2.5,Peru,PE,PER,Lima,,1000,abc\n\
         BadLat,BadLat,north,2.5,Peru,PE,PER,Lima,,1000,3\n\
         BadLng,BadLng,1.5,,Peru,PE,PER,Lima,,1000,4\n\
         NoPop,NoPop,1.5,2.5,Peru,PE,PER,Lima,,,5\n"
    );

    let import = import_cities(csv.as_bytes()).unwrap();
    assert_eq!(import.total_processed, 6);
    assert_eq!(import.skipped, 4);
    assert_eq!(import.cities.len(), 2);
    assert_eq!(import.errors.len(), 4);
    assert!(import.errors[0].contains("line 2"));
    assert!(import.errors[1].contains("invalid id"));
    assert!(import.errors[2].contains("invalid latitude"));
    assert!(import.errors[3].contains("invalid longitude"));

    // Missing population is absent, and zero in the clustering vector
    let no_pop = &import.cities[1];
    assert_eq!(no_pop.population, None);
    assert_eq!(no_pop.to_point().population, 0.0);
}

#[test]
fn test_error_examples_are_capped() {
    let mut csv = format!("{CITY_HEADER}\n");
    for i in 0..25 {
        csv.push_str(&format!("X,X,not-a-number,0,Chile,CL,CHL,,,10,{i}\n"));
    }

    let import = import_cities(csv.as_bytes()).unwrap();
    assert_eq!(import.skipped, 25);
    assert_eq!(import.errors.len(), MAX_ERROR_EXAMPLES);
    assert!(import.cities.is_empty());
}

#[test]
fn test_repeated_id_replaces_earlier_row() {
    // The last row for an id wins, keeps the first row's position and is counted as an update
    let csv = format!(
        "{CITY_HEADER}\n\
         Old,Old,1.0,2.0,Peru,PE,PER,Lima,,1000,7\n\
         Other,Other,3.0,4.0,Chile,CL,CHL,,,2000,8\n\
         New,New,5.0,6.0,Peru,PE,PER,Cusco,,3000,7\n"
    );

    let import = import_cities(csv.as_bytes()).unwrap();
    assert_eq!(import.total_processed, 3);
    assert_eq!(import.updated, 1);
    assert_eq!(import.skipped, 0);
    assert_eq!(import.cities.len(), 2);

    let seven = &import.cities[0];
    assert_eq!(seven.id, 7);
    assert_eq!(seven.city, "New");
    assert_eq!(seven.lat, 5.0);
    assert_eq!(seven.admin_name.as_deref(), Some("Cusco"));
    assert_eq!(seven.population, Some(3000));
    assert_eq!(import.cities[1].id, 8);
}

// ============================================================================
// Filter Tests
// ============================================================================

#[test]
fn test_country_filter_is_case_insensitive_partial_match() {
    let rows = sample_rows();
    let csv = format!("{CITY_HEADER}\n{}\n", rows.join("\n"));
    let import = import_cities(csv.as_bytes()).unwrap();

    let brazil = CityFilter::new().with_country("bra");
    assert_eq!(brazil.apply(&import.cities).len(), 3);

    let paged = CityFilter::new().with_country("BRAZIL").with_offset(1).with_limit(1);
    let selected = paged.apply(&import.cities);
    assert_eq!(selected.len(), 1);
    assert_eq!(selected[0].id, 1002);

    assert_eq!(CityFilter::new().apply(&import.cities).len(), 6);
    assert!(CityFilter::new().with_country("Peru").apply(&import.cities).is_empty());
}

// ============================================================================
// Configuration Tests
// ============================================================================

#[test]
fn test_yaml_config_overrides_only_given_keys() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("clustering.yaml");
    fs::write(
        &path,
        "max_iter: 25\nepsilon: 0.001\nworker_count: 3\ninit: kmeans++\nnormalization_sample: 500\n",
    )
    .unwrap();

    let config = ClusteringConfig::from_file(&path).unwrap();
    assert_eq!(config.max_iter, 25);
    assert_eq!(config.epsilon, 0.001);
    assert_eq!(config.worker_count, 3);
    assert_eq!(config.init, InitStrategy::KMeansPlusPlus);
    assert_eq!(config.normalization_sample, Some(500));

    // Untouched keys keep their defaults
    assert_eq!(config.seed, 42);
    assert!(config.fallback_to_inline);
}

#[test]
fn test_defaults() {
    let config = ClusteringConfig::default();
    assert_eq!(config.max_iter, 100);
    assert_eq!(config.epsilon, 1e-4);
    assert!((2..=8).contains(&config.worker_count));
    assert_eq!(config.init, InitStrategy::Random);
    assert_eq!(config.normalization_sample, None);
}

#[test]
fn test_invalid_yaml_config_is_rejected() {
    for yaml in ["max_iter: 0\n", "worker_count: 0\n", "epsilon: -1.0\n", "normalization_sample: 0\n"] {
        assert!(
            matches!(ClusteringConfig::from_yaml_str(yaml), Err(Error::InvalidConfig(_))),
            "accepted {:?}",
            yaml
        );
    }
    assert!(matches!(
        ClusteringConfig::from_yaml_str("init: spectral\n"),
        Err(Error::Yaml(_))
    ));
}

// ============================================================================
// End-to-End Tests
// ============================================================================

#[test]
fn test_parallel_ingest_counts_overflow() {
    // Producers on rayon threads fill the buffer; the excess is counted, not fatal
    let points = create_random_cities(1_000, 17);
    let clusterer = CityClusterer::new(ClusteringConfig::default());

    let (ingested, stats) = clusterer.ingest(&points, 600).unwrap();
    assert_eq!(stats.written, 600);
    assert_eq!(stats.rejected, 400);
    assert_eq!(ingested.len(), 600);
    assert_eq!(ingested.identities.resolved_count(), 600);

    for slot in 0..ingested.len() {
        let identity = ingested.identities.get(slot).unwrap();
        assert_eq!(ingested.buffer.read(slot), Some(identity.vector()));
    }
}

#[test]
fn test_cluster_cities_and_export_json() {
    let mut csv = format!("{CITY_HEADER}\n");
    for i in 0..120 {
        let country = if i % 2 == 0 { "Brazil" } else { "Japan" };
        let lat = -40.0 + (i % 40) as f64 * 2.0;
        let lng = -70.0 + (i / 40) as f64 * 60.0;
        csv.push_str(&format!(
            "C{i},C{i},{lat},{lng},{country},,,,,{},{}\n",
            1_000 * (i + 1),
            i
        ));
    }
    let import = import_cities(csv.as_bytes()).unwrap();

    let clusterer = CityClusterer::new(ClusteringConfig::default().with_worker_count(2));
    let filter = CityFilter::new().with_country("japan");
    let outcome = clusterer.cluster_cities(&import, &filter, Some(3)).unwrap();

    let report = match outcome {
        ClusteringOutcome::Completed(report) => report,
        ClusteringOutcome::Cancelled { .. } => panic!("unexpected cancellation"),
    };
    assert_eq!(report.clusters.len(), 3);
    let clustered: usize = report.clusters.iter().map(|c| c.cities.len()).sum();
    assert_eq!(clustered, 60);

    let dir = tempdir().unwrap();
    let path = dir.path().join("clusters.json");
    report.write_json(&path).unwrap();

    let json: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    let clusters = json["clusters"].as_array().expect("clusters array");
    assert_eq!(clusters.len(), 3);
    for cluster in clusters {
        assert!(cluster["centroid"]["latitude"].is_f64());
        assert!(cluster["centroid"]["population"].is_f64());
        assert!(cluster["size"].is_u64());
        assert!(cluster["cities"].is_array());
    }
    assert!(report.to_json_pretty().unwrap().contains("\"termination\""));
}

#[test]
fn test_default_k_from_dataset_size() {
    // Without an explicit k, sqrt(n / 2) clusters are used
    let points = create_random_cities(200, 5);
    let csv_rows: Vec<String> = points
        .iter()
        .map(|p| {
            format!(
                "{id},{id},{},{},Nowhere,,,,,{},{id}",
                p.latitude,
                p.longitude,
                p.population as u64,
                id = p.id
            )
        })
        .collect();
    let csv = format!("{CITY_HEADER}\n{}\n", csv_rows.join("\n"));
    let import = import_cities(csv.as_bytes()).unwrap();
    assert_eq!(import.cities.len(), 200);

    let clusterer = CityClusterer::new(ClusteringConfig::default());
    let outcome = clusterer
        .cluster_cities(&import, &CityFilter::new(), None)
        .unwrap();
    let report = outcome.into_report().expect("run was cancelled");
    assert_eq!(report.clusters.len(), 10);
}

#[test]
fn test_too_few_cities_is_invalid_k() {
    let csv = format!("{CITY_HEADER}\nOnly,Only,1,2,Fiji,FJ,FJI,,,5,1\n");
    let import = import_cities(csv.as_bytes()).unwrap();

    let clusterer = CityClusterer::new(ClusteringConfig::default());
    let result = clusterer.cluster_cities(&import, &CityFilter::new(), None);
    assert!(matches!(result, Err(Error::InvalidK { n_points: 1, .. })));
}

// ============================================================================
// Fallback Tests
// ============================================================================

/// Parallel executor stand-in whose every batch fails with `error()`.
struct FailingExecutor {
    error: fn() -> Error,
}

impl MapExecutor for FailingExecutor {
    fn execute(&mut self, _tasks: Vec<MapTask>) -> Result<Vec<PartialAccumulation>> {
        Err((self.error)())
    }
}

fn failing(error: fn() -> Error) -> impl FnOnce(Arc<PointMatrix>, usize) -> Result<FailingExecutor> {
    move |_, _| Ok(FailingExecutor { error })
}

fn fallback_input() -> IngestedPoints {
    let (points, _) = create_gaussian_clusters(
        &[[10.0, 10.0, 1_000.0], [-40.0, 120.0, 50_000.0], [60.0, -80.0, 500_000.0]],
        40,
        1.0,
        11,
    );
    ingest(points)
}

#[test]
fn test_crashed_workers_fall_back_to_inline() {
    // A worker crash reruns the whole computation on the calling thread with the same result
    let ingested = fallback_input();
    let config = ClusteringConfig::default();
    let clusterer = CityClusterer::new(config.clone());

    let outcome = clusterer
        .cluster_with(&ingested, 3, failing(|| Error::WorkerCrashed("boom".into())))
        .unwrap();
    let report = outcome.into_report().expect("run was cancelled");

    let inline = run_clustering_inline(&ingested, 3, &config, &RunHooks::default())
        .unwrap()
        .into_report()
        .expect("run was cancelled");
    assert_eq!(report.assignments, inline.assignments);
    assert_eq!(report.iterations, inline.iterations);
    for (a, b) in report.clusters.iter().zip(&inline.clusters) {
        assert_eq!(a.centroid, b.centroid);
        assert_eq!(a.size, b.size);
    }
}

#[test]
fn test_task_and_factory_failures_fall_back_to_inline() {
    // A failing task or an executor that cannot be built is retried inline as well
    let ingested = fallback_input();
    let clusterer = CityClusterer::new(ClusteringConfig::default());

    let task_failure = || Error::Task {
        start: 0,
        end: 1,
        message: "bad range".into(),
    };
    let outcome = clusterer.cluster_with(&ingested, 3, failing(task_failure)).unwrap();
    assert!(outcome.report().is_some());

    let factory_failure = clusterer.cluster_with(&ingested, 3, |_, _| {
        Err::<FailingExecutor, _>(Error::WorkerCrashed("no threads".into()))
    });
    assert!(factory_failure.unwrap().report().is_some());
}

#[test]
fn test_fallback_disabled_returns_the_pool_error() {
    // Without fallback the executor failure reaches the caller unchanged
    let ingested = fallback_input();
    let config = ClusteringConfig::default().with_fallback_to_inline(false);
    let clusterer = CityClusterer::new(config);

    let result = clusterer.cluster_with(&ingested, 3, failing(|| Error::WorkerCrashed("boom".into())));
    assert!(matches!(result, Err(Error::WorkerCrashed(message)) if message == "boom"));
}

#[test]
fn test_terminated_pool_is_not_retried() {
    // Termination is not an executor fault, so no inline rerun happens
    let ingested = fallback_input();
    let clusterer = CityClusterer::new(ClusteringConfig::default());

    let result = clusterer.cluster_with(&ingested, 3, failing(|| Error::Terminated));
    assert!(matches!(result, Err(Error::Terminated)));
}

#[test]
fn test_invalid_k_never_builds_an_executor() {
    // Validation fails before the executor factory runs, and is not retried inline
    let ingested = fallback_input();
    let clusterer = CityClusterer::new(ClusteringConfig::default());
    let built = AtomicUsize::new(0);

    let result = clusterer.cluster_with(&ingested, 1, |_, _| {
        built.fetch_add(1, Ordering::SeqCst);
        Ok(FailingExecutor {
            error: || Error::WorkerCrashed("unreachable".into()),
        })
    });
    assert!(matches!(result, Err(Error::InvalidK { requested: 1, .. })));
    assert_eq!(built.load(Ordering::SeqCst), 0);
}

#[test]
fn test_full_progress_channel_does_not_change_the_result() {
    // Events that do not fit a bounded(1) channel are dropped; the run itself is unaffected
    let ingested = fallback_input();
    let config = ClusteringConfig::default().with_epsilon(0.0).with_max_iter(5);

    let (tx, rx) = bounded(1);
    let with_channel = CityClusterer::new(config.clone())
        .with_hooks(RunHooks::new().with_progress_channel(tx))
        .cluster(&ingested, 3)
        .unwrap()
        .into_report()
        .expect("run was cancelled");
    let without_hooks = CityClusterer::new(config)
        .cluster(&ingested, 3)
        .unwrap()
        .into_report()
        .expect("run was cancelled");

    assert_eq!(rx.try_iter().count(), 1);
    assert_eq!(with_channel.assignments, without_hooks.assignments);
    assert_eq!(with_channel.iterations, without_hooks.iterations);
    assert_eq!(with_channel.termination, without_hooks.termination);
    for (a, b) in with_channel.clusters.iter().zip(&without_hooks.clusters) {
        assert_eq!(a.centroid, b.centroid);
    }
}
