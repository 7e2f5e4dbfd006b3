//! Application configuration

use std::env;
use std::path::PathBuf;

/// 250 MiB, the platform's unzipped size limit for a deployment layer
pub const DEFAULT_MAX_UNCOMPRESSED_LAYER: u64 = 250 * 1024 * 1024;

/// 50 MiB, the platform's zipped upload limit
pub const DEFAULT_MAX_COMPRESSED_LAYER: u64 = 50 * 1024 * 1024;

/// Layers attachable to one function
pub const DEFAULT_MAX_LAYERS: usize = 5;

/// Platform ceilings every layer and assignment must respect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ceilings {
    pub max_uncompressed_layer: u64,
    pub max_compressed_layer: u64,
    pub max_layers: usize,
}

impl Default for Ceilings {
    fn default() -> Self {
        Self {
            max_uncompressed_layer: DEFAULT_MAX_UNCOMPRESSED_LAYER,
            max_compressed_layer: DEFAULT_MAX_COMPRESSED_LAYER,
            max_layers: DEFAULT_MAX_LAYERS,
        }
    }
}

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Size ceilings for build-time partitioning
    pub ceilings: Ceilings,

    /// Directory under which the platform mounts `layer-<id>` directories
    pub layers_root: PathBuf,

    /// Explicit layer directories in layer-id order (overrides discovery)
    pub layer_dirs: Option<Vec<PathBuf>>,

    /// Engine executable name (looked up as `bin/<name>` on the search path)
    /// or an absolute path
    pub engine: String,

    /// Pipeline execution timeout in seconds
    pub timeout_secs: u64,

    /// Bound on one cold-start attempt in seconds; unset or 0 means none
    pub cold_start_timeout_secs: Option<u64>,
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self {
            ceilings: Ceilings {
                max_uncompressed_layer: parse_var("PIPELINE_LAMBDA_MAX_UNCOMPRESSED_LAYER")
                    .unwrap_or(DEFAULT_MAX_UNCOMPRESSED_LAYER),
                max_compressed_layer: parse_var("PIPELINE_LAMBDA_MAX_COMPRESSED_LAYER")
                    .unwrap_or(DEFAULT_MAX_COMPRESSED_LAYER),
                max_layers: parse_var("PIPELINE_LAMBDA_MAX_LAYERS").unwrap_or(DEFAULT_MAX_LAYERS),
            },

            layers_root: env::var("PIPELINE_LAMBDA_LAYERS_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/opt/layers")),

            layer_dirs: env::var_os("PIPELINE_LAMBDA_LAYER_DIRS")
                .filter(|v| !v.is_empty())
                .map(|v| env::split_paths(&v).collect()),

            engine: env::var("PIPELINE_LAMBDA_ENGINE")
                .unwrap_or_else(|_| "pipeline-engine".to_string()),

            timeout_secs: parse_var("PIPELINE_LAMBDA_TIMEOUT_SECS").unwrap_or(30),

            cold_start_timeout_secs: parse_var("PIPELINE_LAMBDA_COLD_START_TIMEOUT_SECS")
                .filter(|secs| *secs > 0),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ceilings() {
        let ceilings = Ceilings::default();
        assert_eq!(ceilings.max_uncompressed_layer, 262_144_000);
        assert_eq!(ceilings.max_compressed_layer, 52_428_800);
        assert_eq!(ceilings.max_layers, 5);
    }

    #[test]
    fn test_env_overrides() {
        env::set_var("PIPELINE_LAMBDA_MAX_LAYERS", "3");
        env::set_var("PIPELINE_LAMBDA_LAYER_DIRS", "/mnt/a:/mnt/b");
        env::set_var("PIPELINE_LAMBDA_COLD_START_TIMEOUT_SECS", "12");

        let config = AppConfig::from_env();
        assert_eq!(config.ceilings.max_layers, 3);
        assert_eq!(
            config.layer_dirs,
            Some(vec![PathBuf::from("/mnt/a"), PathBuf::from("/mnt/b")])
        );

        assert_eq!(config.cold_start_timeout_secs, Some(12));

        env::set_var("PIPELINE_LAMBDA_COLD_START_TIMEOUT_SECS", "0");
        assert_eq!(AppConfig::from_env().cold_start_timeout_secs, None);

        env::remove_var("PIPELINE_LAMBDA_MAX_LAYERS");
        env::remove_var("PIPELINE_LAMBDA_LAYER_DIRS");
        env::remove_var("PIPELINE_LAMBDA_COLD_START_TIMEOUT_SECS");
    }
}
