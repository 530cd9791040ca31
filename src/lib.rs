pub mod api;
pub use api::CityClusterer;

pub mod cancel;
pub mod centroid_init;
pub mod cities;
pub mod config;
pub mod error;
pub mod executor;
pub mod ingest;
pub mod kmeans;
pub mod map_task;
pub mod normalization;
pub mod point_buffer;
pub mod point_store;
pub mod utils;
pub mod worker_pool;

pub use cancel::CancellationToken;
pub use centroid_init::InitStrategy;
pub use cities::{City, CityFilter, CityImport};
pub use config::ClusteringConfig;
pub use error::{Error, Result};
pub use ingest::{IngestStats, IngestedPoints, IngestionSession, IngestionWriter};
pub use kmeans::{
    run_clustering, run_clustering_inline, run_clustering_on, ClusterResult, ClusteringOutcome,
    ClusteringReport, ProgressEvent, RunHooks, Termination,
};
pub use point_store::Point;
