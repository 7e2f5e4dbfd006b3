//! Process-wide runtime state.
//!
//! The container starts Cold. The first invocation that finds it Cold
//! discovers the layers, builds the search path and acquires the pipeline
//! loader; only when all of that succeeded is the Warm state published.
//! Concurrent callers wait for the in-flight initializer. A failed or
//! cancelled initializer publishes nothing and the next call starts over.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

use super::pipeline::{LoaderProvider, PipelineLoader};
use super::search_path::SearchPath;
use crate::config::AppConfig;
use crate::error::ColdStartError;

/// Where the layer directories come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerSource {
    /// `layer-<id>` directories under a root
    Discover(std::path::PathBuf),
    /// Explicit directories, layer 0 first
    Explicit(Vec<std::path::PathBuf>),
}

impl LayerSource {
    pub fn from_config(config: &AppConfig) -> Self {
        match &config.layer_dirs {
            Some(dirs) => LayerSource::Explicit(dirs.clone()),
            None => LayerSource::Discover(config.layers_root.clone()),
        }
    }

    fn search_path(&self) -> Result<SearchPath, ColdStartError> {
        match self {
            LayerSource::Discover(root) => SearchPath::discover(root),
            LayerSource::Explicit(dirs) => SearchPath::from_dirs(dirs.clone()),
        }
    }
}

/// The Warm state
pub struct Warm {
    search_path: SearchPath,
    loader: Arc<dyn PipelineLoader>,
}

impl Warm {
    pub fn search_path(&self) -> &SearchPath {
        &self.search_path
    }

    pub fn loader(&self) -> &Arc<dyn PipelineLoader> {
        &self.loader
    }
}

/// Cold -> Warm state machine, one per process
pub struct Bootstrap {
    layers: LayerSource,
    provider: Arc<dyn LoaderProvider>,
    state: OnceCell<Warm>,
    attempts: AtomicU64,
    cold_start_timeout: Option<Duration>,
}

impl Bootstrap {
    pub fn new(layers: LayerSource, provider: Arc<dyn LoaderProvider>) -> Self {
        Self {
            layers,
            provider,
            state: OnceCell::new(),
            attempts: AtomicU64::new(0),
            cold_start_timeout: None,
        }
    }

    /// Bound the time one initialization attempt may take. A timed-out
    /// attempt publishes nothing; the next call starts a fresh one.
    pub fn with_cold_start_timeout(mut self, timeout: Duration) -> Self {
        self.cold_start_timeout = Some(timeout);
        self
    }

    pub fn cold_start_timeout(&self) -> Option<Duration> {
        self.cold_start_timeout
    }

    /// Make sure the process is Warm, initializing it if needed
    pub async fn ensure_warm(&self) -> Result<&Warm, ColdStartError> {
        if let Some(warm) = self.state.get() {
            return Ok(warm);
        }

        match self.cold_start_timeout {
            Some(limit) => tokio::time::timeout(limit, self.state.get_or_try_init(|| self.initialize()))
                .await
                .map_err(|_| {
                    tracing::warn!(timeout = ?limit, "Cold start timed out");
                    ColdStartError::Timeout(limit)
                })?,
            None => self.state.get_or_try_init(|| self.initialize()).await,
        }
    }

    pub fn is_warm(&self) -> bool {
        self.state.initialized()
    }

    /// The search path, once Warm
    pub fn search_path(&self) -> Option<&SearchPath> {
        self.state.get().map(Warm::search_path)
    }

    /// Number of initialization attempts started so far
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    async fn initialize(&self) -> Result<Warm, ColdStartError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(attempt, "Cold start");

        let result = self.build_warm().await;
        match &result {
            Ok(warm) => tracing::info!(
                attempt,
                layers = warm.search_path.len(),
                "Runtime warm"
            ),
            Err(e) => tracing::warn!(attempt, error = %e, "Cold start failed"),
        }
        result
    }

    async fn build_warm(&self) -> Result<Warm, ColdStartError> {
        let layers = self.layers.clone();
        let provider = self.provider.clone();

        // filesystem discovery and loader setup block
        tokio::task::spawn_blocking(move || {
            let search_path = layers.search_path()?;
            let loader = provider
                .acquire(&search_path)
                .map_err(|e| ColdStartError::Loader(format!("{:#}", e)))?;
            Ok::<_, ColdStartError>(Warm { search_path, loader })
        })
        .await
        .map_err(|e| ColdStartError::Loader(format!("initializer panicked: {}", e)))?
    }
}
