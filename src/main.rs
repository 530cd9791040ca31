use city_kmeans::cities::import_cities_file;
use city_kmeans::{CityClusterer, CityFilter, ClusteringConfig, ClusteringOutcome, InitStrategy};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Cluster world cities by latitude, longitude and population.
#[derive(Parser, Debug)]
#[command(name = "city-kmeans", version, about)]
struct Args {
    /// Cities CSV (city,city_ascii,lat,lng,country,iso2,iso3,admin_name,capital,population,id).
    #[arg(long)]
    input: PathBuf,

    /// Number of clusters. Defaults to sqrt(n / 2).
    #[arg(long)]
    k: Option<usize>,

    /// YAML file with clustering settings; flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    workers: Option<usize>,

    #[arg(long)]
    seed: Option<u64>,

    #[arg(long)]
    max_iter: Option<usize>,

    #[arg(long)]
    epsilon: Option<f64>,

    /// `random` or `kmeans++`.
    #[arg(long, value_parser = parse_init)]
    init: Option<InitStrategy>,

    /// Only cluster cities whose country contains this text (case-insensitive).
    #[arg(long)]
    country: Option<String>,

    /// Cluster at most this many cities after filtering.
    #[arg(long)]
    limit: Option<usize>,

    /// Write the report here as JSON instead of printing it.
    #[arg(long)]
    output: Option<PathBuf>,
}

fn parse_init(s: &str) -> Result<InitStrategy, String> {
    match s.to_ascii_lowercase().as_str() {
        "random" => Ok(InitStrategy::Random),
        "kmeans++" | "k-means++" | "k-means-plus-plus" => Ok(InitStrategy::KMeansPlusPlus),
        other => Err(format!("unknown init strategy `{other}`")),
    }
}

fn load_config(args: &Args) -> city_kmeans::Result<ClusteringConfig> {
    let mut config = match &args.config {
        Some(path) => ClusteringConfig::from_file(path)?,
        None => ClusteringConfig::default(),
    };
    if let Some(workers) = args.workers {
        config = config.with_worker_count(workers);
    }
    if let Some(seed) = args.seed {
        config = config.with_seed(seed);
    }
    if let Some(max_iter) = args.max_iter {
        config = config.with_max_iter(max_iter);
    }
    if let Some(epsilon) = args.epsilon {
        config = config.with_epsilon(epsilon);
    }
    if let Some(init) = args.init {
        config = config.with_init(init);
    }
    config.validate()?;
    Ok(config)
}

fn run(args: Args) -> city_kmeans::Result<()> {
    let config = load_config(&args)?;
    let import = import_cities_file(&args.input)?;
    for message in &import.errors {
        info!("skipped row: {}", message);
    }

    let mut filter = CityFilter::new();
    if let Some(country) = &args.country {
        filter = filter.with_country(country.clone());
    }
    if let Some(limit) = args.limit {
        filter = filter.with_limit(limit);
    }

    let clusterer = CityClusterer::new(config);
    match clusterer.cluster_cities(&import, &filter, args.k)? {
        ClusteringOutcome::Completed(report) => {
            info!(
                "{} clusters after {} iterations ({:?})",
                report.clusters.len(),
                report.iterations,
                report.termination
            );
            match &args.output {
                Some(path) => {
                    report.write_json(path)?;
                    info!("report written to {}", path.display());
                }
                None => println!("{}", report.to_json_pretty()?),
            }
        }
        ClusteringOutcome::Cancelled {
            iterations_completed,
        } => info!("run cancelled after {} iterations", iterations_completed),
    }
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
