use thiserror::Error;

/// Errors returned by ingestion, the worker pool and the clustering loop.
#[derive(Debug, Error)]
pub enum Error {
    /// The shared point buffer could not be created.
    #[error("buffer allocation failed: {0}")]
    Allocation(String),

    /// A slot was requested past the end of the buffer. Recoverable: stop ingesting.
    #[error("capacity exceeded: buffer holds at most {capacity} points")]
    CapacityExceeded { capacity: usize },

    /// A slot was claimed but its vector was never written.
    #[error("slot {slot} was allocated but never written")]
    UncommittedSlot { slot: usize },

    /// A point carried a value that cannot take part in distance math.
    #[error("invalid point {id}: {reason}")]
    InvalidPoint { id: String, reason: &'static str },

    /// Requested cluster count is incompatible with the dataset.
    #[error("invalid cluster count: requested {requested}, but dataset has {n_points} points")]
    InvalidK { requested: usize, n_points: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A single map task failed.
    #[error("map task over {start}..{end} failed: {message}")]
    Task {
        start: usize,
        end: usize,
        message: String,
    },

    /// The worker pool was terminated while the task was queued or running.
    #[error("worker pool terminated")]
    Terminated,

    /// A worker died while running a task; the pool is no longer usable.
    #[error("worker crashed: {0}")]
    WorkerCrashed(String),

    #[error("failed to build worker threads: {0}")]
    PoolBuild(#[from] rayon::ThreadPoolBuildError),

    /// The ingestion session was finished while a writer was still sending.
    #[error("ingestion session already finished")]
    IngestionClosed,

    /// Writers were still alive when the session's finish deadline passed.
    #[error("ingestion writers still alive after {0:?}")]
    IngestionTimeout(std::time::Duration),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Result type used by this crate.
pub type Result<T> = std::result::Result<T, Error>;
