//! Compressed-size estimators.
//!
//! The compressed size of a layer is only known after compressing it, so the
//! partitioner asks an estimator. Estimates are checked against the real
//! archives after the build.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use super::archive::{entry_name, entry_options};
use super::survey::{unit_files, PackageUnit, PruneRules, Survey};
use crate::error::BuildError;

/// Estimated compressed size of a unit once it is archived
pub trait CompressionEstimator: Send + Sync {
    fn estimate(&self, unit: &PackageUnit) -> u64;
}

/// A fixed compressed/uncompressed ratio
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RatioEstimator {
    ratio: f64,
}

impl RatioEstimator {
    /// Ratios outside `(0, 1]` are clamped; a unit never compresses to
    /// nothing and the estimate never undercuts storing it uncompressed.
    pub fn new(ratio: f64) -> Self {
        let ratio = if ratio.is_finite() { ratio.clamp(f64::EPSILON, 1.0) } else { 1.0 };
        Self { ratio }
    }

    /// Treat compressed size as equal to uncompressed size
    pub fn identity() -> Self {
        Self { ratio: 1.0 }
    }

    pub fn ratio(&self) -> f64 {
        self.ratio
    }
}

impl CompressionEstimator for RatioEstimator {
    fn estimate(&self, unit: &PackageUnit) -> u64 {
        (unit.uncompressed_bytes as f64 * self.ratio).ceil() as u64
    }
}

/// Precomputed per-unit estimates, with a ratio for units not in the table
#[derive(Debug, Clone)]
pub struct TableEstimator {
    table: HashMap<String, u64>,
    fallback: RatioEstimator,
}

impl TableEstimator {
    pub fn new(table: HashMap<String, u64>) -> Self {
        Self {
            table,
            fallback: RatioEstimator::identity(),
        }
    }

    pub fn with_fallback(mut self, fallback: RatioEstimator) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn get(&self, name: &str) -> Option<u64> {
        self.table.get(name).copied()
    }
}

impl CompressionEstimator for TableEstimator {
    fn estimate(&self, unit: &PackageUnit) -> u64 {
        self.get(&unit.name)
            .unwrap_or_else(|| self.fallback.estimate(unit))
    }
}

/// Compress every unit on its own into an in-memory zip and record the size.
///
/// Per-unit archives each carry their own central directory, so the sum over
/// a layer slightly overestimates the layer archive.
pub fn measure_deflate(survey: &Survey, rules: &PruneRules) -> Result<TableEstimator, BuildError> {
    let units = survey.units();

    #[cfg(feature = "parallel")]
    let measured: Result<Vec<(String, u64)>, BuildError> = units
        .par_iter()
        .map(|unit| Ok((unit.name.clone(), deflated_size(survey, unit, rules)?)))
        .collect();

    #[cfg(not(feature = "parallel"))]
    let measured: Result<Vec<(String, u64)>, BuildError> = units
        .iter()
        .map(|unit| Ok((unit.name.clone(), deflated_size(survey, unit, rules)?)))
        .collect();

    let table: HashMap<String, u64> = measured?.into_iter().collect();
    tracing::info!(
        units = table.len(),
        compressed_bytes = table.values().sum::<u64>(),
        "Measured deflate estimates"
    );
    Ok(TableEstimator::new(table))
}

fn deflated_size(survey: &Survey, unit: &PackageUnit, rules: &PruneRules) -> Result<u64, BuildError> {
    let files = unit_files(survey.root(), &unit.name, rules)?
        .into_iter()
        .map(|file| (file.archive_name, file.path, file.len));
    let size = deflate_in_memory(&survey.root().join(&unit.name), files)?;

    tracing::debug!(unit = %unit.name, uncompressed = unit.uncompressed_bytes, compressed = size, "Estimated unit");
    Ok(size)
}

/// Deflate the entry files the way layer 0 stores them
pub fn measure_entry_files(files: &[PathBuf]) -> Result<u64, BuildError> {
    let mut entries = Vec::with_capacity(files.len());
    for path in files {
        let name = entry_name(path)
            .ok_or_else(|| BuildError::archive(0, format!("invalid entry file path {:?}", path)))?;
        let len = fs::metadata(path).map_err(|e| BuildError::io(path, e))?.len();
        entries.push((name.to_string(), path.clone(), len));
    }

    let size = deflate_in_memory(Path::new("entry files"), entries)?;
    tracing::debug!(files = files.len(), compressed = size, "Estimated entry files");
    Ok(size)
}

/// Size of an in-memory zip holding `(archive name, source, length)` entries
fn deflate_in_memory(
    label: &Path,
    entries: impl IntoIterator<Item = (String, PathBuf, u64)>,
) -> Result<u64, BuildError> {
    let to_err = |e: zip::result::ZipError| BuildError::io(label, io::Error::other(e));

    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, path, len) in entries {
        let mut source = File::open(&path).map_err(|e| BuildError::io(&path, e))?;
        writer.start_file(name.as_str(), entry_options(len, None)).map_err(to_err)?;
        io::copy(&mut source, &mut writer).map_err(|e| BuildError::io(&path, e))?;
    }
    let cursor = writer.finish().map_err(to_err)?;
    Ok(cursor.into_inner().len() as u64)
}
