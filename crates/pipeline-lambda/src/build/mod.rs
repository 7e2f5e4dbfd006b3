//! Layer build pipeline.
//!
//! survey -> estimate -> partition -> archives + manifest, staged in a
//! temporary directory next to the output and renamed into place only when
//! every step succeeded. A failed build leaves any previous output untouched.

pub mod archive;
pub mod estimate;
pub mod manifest;
pub mod partition;
pub mod survey;

pub use archive::{ArchiveBuilder, BuiltArchive};
pub use estimate::{measure_deflate, measure_entry_files, CompressionEstimator, RatioEstimator, TableEstimator};
pub use manifest::Manifest;
pub use partition::{partition, partition_reserved, Assignment, Layer, Reservation, Strategy};
pub use survey::{survey, PackageUnit, PruneRules, Survey};

use anyhow::Context;
use std::fs;
use std::path::{Path, PathBuf};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::config::Ceilings;
use crate::error::{BuildError, CapacityLimit};

/// How compressed sizes are estimated before archiving
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum EstimatorChoice {
    /// Fixed compressed/uncompressed ratio
    Ratio(f64),
    /// Deflate each unit in memory and use the measured size
    #[default]
    Deflate,
}

/// Everything one build needs
#[derive(Debug, Clone)]
pub struct BuildPlan {
    /// Materialized dependency tree
    pub source: PathBuf,

    /// Directory the artifacts are published to
    pub output: PathBuf,

    pub ceilings: Ceilings,

    pub rules: PruneRules,

    pub estimator: EstimatorChoice,

    pub strategy: Strategy,

    /// Files merged into the root of layer 0. Their size counts against
    /// layer 0's ceilings.
    pub entry_files: Vec<PathBuf>,
}

impl BuildPlan {
    pub fn new(source: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            output: output.into(),
            ceilings: Ceilings::default(),
            rules: PruneRules::python_defaults(),
            estimator: EstimatorChoice::default(),
            strategy: Strategy::default(),
            entry_files: Vec::new(),
        }
    }
}

/// Outcome of a published build
#[derive(Debug, Clone)]
pub struct BuildReport {
    pub output: PathBuf,
    pub manifest: Manifest,
    pub archives: Vec<BuiltArchive>,
}

/// Run a build and publish its artifacts
pub fn run(plan: &BuildPlan) -> Result<BuildReport, BuildError> {
    tracing::info!(
        source = %plan.source.display(),
        output = %plan.output.display(),
        strategy = %plan.strategy,
        "Starting layer build"
    );

    let survey = survey::survey(&plan.source, &plan.rules)?;
    let reservation = entry_reservation(plan)?;

    let assignment = match plan.estimator {
        EstimatorChoice::Ratio(ratio) => partition_reserved(
            survey.units(),
            &plan.ceilings,
            &RatioEstimator::new(ratio),
            plan.strategy,
            reservation.as_ref(),
        )?,
        EstimatorChoice::Deflate => {
            let estimator = measure_deflate(&survey, &plan.rules)?;
            partition_reserved(survey.units(), &plan.ceilings, &estimator, plan.strategy, reservation.as_ref())?
        }
    };

    let parent = output_parent(&plan.output);
    fs::create_dir_all(parent).map_err(|e| BuildError::io(parent, e))?;
    let staging = tempfile::Builder::new()
        .prefix(".pipeline-lambda-build-")
        .tempdir_in(parent)
        .map_err(|e| BuildError::io(parent, e))?;

    let builder = ArchiveBuilder::new(&plan.source, staging.path())
        .with_rules(plan.rules.clone())
        .with_entry_files(plan.entry_files.clone());

    let archives = build_archives(&builder, &assignment)?;
    verify_archives(&archives, &plan.ceilings)?;

    let mut manifest = Manifest::new(&survey, &assignment);
    for archive in &archives {
        manifest.record_actual(archive.layer, archive.compressed_bytes);
    }
    manifest.write_to(staging.path())?;

    publish(staging.path(), &plan.output, parent)?;

    let archives = archives
        .into_iter()
        .map(|a| BuiltArchive {
            path: plan.output.join(layer_file_name(&a.path)),
            ..a
        })
        .collect();

    tracing::info!(
        output = %plan.output.display(),
        layers = assignment.len(),
        units = survey.len(),
        "Published layer build"
    );

    Ok(BuildReport {
        output: plan.output.clone(),
        manifest,
        archives,
    })
}

/// Check a published build: manifest invariants, archive presence and sizes
pub fn verify(output: &Path, ceilings: &Ceilings) -> anyhow::Result<Manifest> {
    let manifest = Manifest::load(output)?;
    manifest.validate(ceilings)?;

    for layer in &manifest.layers {
        let path = output.join(&layer.archive);
        let size = fs::metadata(&path)
            .with_context(|| format!("Missing layer archive {:?}", path))?
            .len();
        if let Some(recorded) = layer.compressed_actual {
            if recorded != size {
                anyhow::bail!("{} is {} bytes, manifest records {}", layer.archive, size, recorded);
            }
        }
        if size > ceilings.max_compressed_layer {
            anyhow::bail!("{} is {} bytes, over the compressed ceiling", layer.archive, size);
        }
    }

    Ok(manifest)
}

/// Room the entry files need in layer 0, estimated like the units are
fn entry_reservation(plan: &BuildPlan) -> Result<Option<Reservation>, BuildError> {
    if plan.entry_files.is_empty() {
        return Ok(None);
    }

    let mut bytes = 0u64;
    for file in &plan.entry_files {
        let metadata = fs::metadata(file)
            .map_err(|_| BuildError::archive(0, format!("entry file {:?} is missing", file)))?;
        bytes += metadata.len();
    }

    let label = "entry files".to_string();
    let estimate = match plan.estimator {
        EstimatorChoice::Ratio(ratio) => {
            RatioEstimator::new(ratio).estimate(&PackageUnit::new(label.as_str(), bytes, false))
        }
        EstimatorChoice::Deflate => measure_entry_files(&plan.entry_files)?,
    };

    Ok(Some(Reservation { label, bytes, estimate }))
}

fn build_archives(builder: &ArchiveBuilder, assignment: &Assignment) -> Result<Vec<BuiltArchive>, BuildError> {
    #[cfg(feature = "parallel")]
    let built = assignment
        .layers()
        .par_iter()
        .map(|layer| builder.build_layer(layer))
        .collect();

    #[cfg(not(feature = "parallel"))]
    let built = assignment
        .layers()
        .iter()
        .map(|layer| builder.build_layer(layer))
        .collect();

    built
}

/// Reject any built archive over either ceiling
fn verify_archives(archives: &[BuiltArchive], ceilings: &Ceilings) -> Result<(), BuildError> {
    for archive in archives {
        if archive.uncompressed_bytes > ceilings.max_uncompressed_layer {
            return Err(BuildError::CapacityExceeded {
                unit: layer_file_name(&archive.path),
                size: archive.uncompressed_bytes,
                limit: CapacityLimit::ActualUncompressed {
                    actual: archive.uncompressed_bytes,
                    max: ceilings.max_uncompressed_layer,
                },
            });
        }
        if archive.compressed_bytes > ceilings.max_compressed_layer {
            return Err(BuildError::CapacityExceeded {
                unit: layer_file_name(&archive.path),
                size: archive.compressed_bytes,
                limit: CapacityLimit::ActualCompressed {
                    actual: archive.compressed_bytes,
                    max: ceilings.max_compressed_layer,
                },
            });
        }
    }
    Ok(())
}

/// Swap the staged directory into place. A previous output is moved aside
/// first and removed once the new one is in place.
fn publish(staged: &Path, output: &Path, parent: &Path) -> Result<(), BuildError> {
    let retired = tempfile::Builder::new()
        .prefix(".pipeline-lambda-old-")
        .tempdir_in(parent)
        .map_err(|e| BuildError::io(parent, e))?;

    if output.exists() {
        fs::rename(output, retired.path().join("previous")).map_err(|e| BuildError::io(output, e))?;
    }

    if let Err(e) = fs::rename(staged, output) {
        // put the previous build back
        let _ = fs::rename(retired.path().join("previous"), output);
        return Err(BuildError::io(output, e));
    }

    Ok(())
}

fn output_parent(output: &Path) -> &Path {
    match output.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

fn layer_file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
