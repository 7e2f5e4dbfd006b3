//! Error types for layer builds and invocations

use pipeline_lambda_sdk::{InvocationError, IpcError};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Which ceiling a unit ran into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityLimit {
    /// The unit alone is larger than the uncompressed layer ceiling
    Uncompressed { max: u64 },
    /// The unit's compressed estimate alone exceeds the compressed ceiling
    Compressed { estimate: u64, max: u64 },
    /// Every allowed layer is already open and none accepts the unit
    LayerCount { max: usize },
    /// A built archive came out larger than the compressed ceiling
    ActualCompressed { actual: u64, max: u64 },
    /// A built archive unpacks to more than the uncompressed ceiling
    ActualUncompressed { actual: u64, max: u64 },
}

impl fmt::Display for CapacityLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapacityLimit::Uncompressed { max } => {
                write!(f, "exceeds the uncompressed layer ceiling of {} bytes", max)
            }
            CapacityLimit::Compressed { estimate, max } => write!(
                f,
                "estimated compressed size {} exceeds the compressed layer ceiling of {} bytes",
                estimate, max
            ),
            CapacityLimit::LayerCount { max } => {
                write!(f, "does not fit in any of the {} allowed layers", max)
            }
            CapacityLimit::ActualCompressed { actual, max } => write!(
                f,
                "archive is {} bytes, over the compressed layer ceiling of {} bytes",
                actual, max
            ),
            CapacityLimit::ActualUncompressed { actual, max } => write!(
                f,
                "archive unpacks to {} bytes, over the uncompressed layer ceiling of {} bytes",
                actual, max
            ),
        }
    }
}

/// Errors that abort a build. No artifacts are published after any of them.
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{unit} ({size} bytes) {limit}")]
    CapacityExceeded {
        unit: String,
        size: u64,
        limit: CapacityLimit,
    },

    #[error("Archive error in layer {layer}: {message}")]
    Archive { layer: usize, message: String },
}

impl BuildError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BuildError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn archive(layer: usize, message: impl Into<String>) -> Self {
        BuildError::Archive {
            layer,
            message: message.into(),
        }
    }
}

impl From<walkdir::Error> for BuildError {
    fn from(err: walkdir::Error) -> Self {
        let path = err.path().map(PathBuf::from).unwrap_or_default();
        let source = err
            .into_io_error()
            .unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "filesystem loop"));
        BuildError::Io { path, source }
    }
}

/// Failures of the Cold -> Warm transition. The state stays Cold and the
/// next invocation retries.
#[derive(Error, Debug)]
pub enum ColdStartError {
    #[error("Cannot read layers root {path:?}: {source}")]
    LayersRoot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No layer directories found under {0:?}")]
    NoLayers(PathBuf),

    #[error("Layer directories are not contiguous: expected layer-{expected}, found layer-{found}")]
    LayerGap { expected: usize, found: usize },

    #[error("Layer {id} is mounted twice: {first:?} and {second:?}")]
    DuplicateLayer {
        id: usize,
        first: PathBuf,
        second: PathBuf,
    },

    #[error("Layer directory {0:?} does not exist")]
    MissingLayer(PathBuf),

    #[error("Pipeline loader unavailable: {0}")]
    Loader(String),

    #[error("Cold start timed out after {0:?}")]
    Timeout(Duration),
}

/// A pipeline target that cannot be turned into an executable pipeline
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("Unknown pipeline '{0}'")]
    UnknownPipeline(String),

    #[error("Failed to read pipeline definition {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid pipeline definition: {0}")]
    Invalid(String),
}

/// A resolved pipeline that failed while running
#[derive(Error, Debug)]
pub enum ExecuteError {
    #[error("Engine failed: {0}")]
    Engine(String),

    #[error("Failed to start engine {path:?}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Engine protocol error: {0}")]
    Protocol(#[from] IpcError),

    #[error("Engine returned invalid output: {0}")]
    InvalidOutput(String),

    #[error("Pipeline execution timed out after {0:?}")]
    Timeout(Duration),

    #[error("Pipeline execution panicked: {0}")]
    Panicked(String),
}

impl From<ColdStartError> for InvocationError {
    fn from(err: ColdStartError) -> Self {
        InvocationError::cold_start(err.to_string())
    }
}

impl From<ResolveError> for InvocationError {
    fn from(err: ResolveError) -> Self {
        InvocationError::resolution(err.to_string())
    }
}

impl From<ExecuteError> for InvocationError {
    fn from(err: ExecuteError) -> Self {
        InvocationError::execution(err.to_string())
    }
}
