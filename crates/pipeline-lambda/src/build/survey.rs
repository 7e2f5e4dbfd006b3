//! Size survey of a materialized dependency tree.
//!
//! Every top-level entry of the tree becomes one [`PackageUnit`]. The walk
//! that measures a unit is the same walk the archive builder and the deflate
//! estimator use, so sizes, estimates and archive contents agree on exactly
//! which files belong to a unit.

use serde::Serialize;
use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::error::BuildError;

/// One top-level package unit of the dependency tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageUnit {
    pub name: String,
    pub uncompressed_bytes: u64,
    pub is_directory: bool,
}

impl PackageUnit {
    pub fn new(name: impl Into<String>, uncompressed_bytes: u64, is_directory: bool) -> Self {
        Self {
            name: name.into(),
            uncompressed_bytes,
            is_directory,
        }
    }
}

/// Names and suffixes dropped below the top level of every unit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneRules {
    names: Vec<String>,
    suffixes: Vec<String>,
}

impl PruneRules {
    /// Keep everything
    pub fn none() -> Self {
        Self::default()
    }

    /// Bytecode caches the interpreter regenerates on import
    pub fn python_defaults() -> Self {
        Self::none()
            .with_name("__pycache__")
            .with_suffix(".pyc")
            .with_suffix(".pyo")
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.names.push(name.into());
        self
    }

    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffixes.push(suffix.into());
        self
    }

    pub fn is_pruned(&self, file_name: &str) -> bool {
        self.names.iter().any(|n| n == file_name)
            || self.suffixes.iter().any(|s| file_name.ends_with(s.as_str()))
    }
}

/// A file that belongs to a unit, with its path inside the archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitFile {
    pub path: PathBuf,
    pub archive_name: String,
    pub len: u64,
}

/// Result of surveying a tree: units sorted by name
#[derive(Debug, Clone)]
pub struct Survey {
    root: PathBuf,
    units: Vec<PackageUnit>,
}

impl Survey {
    /// Build a survey from known units (synthetic size tables)
    pub fn from_units(root: impl Into<PathBuf>, mut units: Vec<PackageUnit>) -> Self {
        units.sort_by(|a, b| a.name.cmp(&b.name));
        Self {
            root: root.into(),
            units,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn units(&self) -> &[PackageUnit] {
        &self.units
    }

    pub fn get(&self, name: &str) -> Option<&PackageUnit> {
        self.units
            .binary_search_by(|u| u.name.as_str().cmp(name))
            .ok()
            .map(|i| &self.units[i])
    }

    pub fn total_bytes(&self) -> u64 {
        self.units.iter().map(|u| u.uncompressed_bytes).sum()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

/// Measure every top-level entry under `root`.
///
/// Fails as a whole if the root is missing or any entry cannot be read.
pub fn survey(root: &Path, rules: &PruneRules) -> Result<Survey, BuildError> {
    let entries = fs::read_dir(root).map_err(|e| BuildError::io(root, e))?;

    let mut units = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| BuildError::io(root, e))?;
        let name = utf8_name(&entry.path())?;
        let metadata = fs::metadata(entry.path()).map_err(|e| BuildError::io(entry.path(), e))?;

        let unit = if metadata.is_dir() {
            let bytes = unit_files(root, &name, rules)?.iter().map(|f| f.len).sum();
            PackageUnit::new(name, bytes, true)
        } else {
            PackageUnit::new(name, metadata.len(), false)
        };

        tracing::debug!(unit = %unit.name, bytes = unit.uncompressed_bytes, "Surveyed unit");
        units.push(unit);
    }

    let survey = Survey::from_units(root, units);
    tracing::info!(
        root = %root.display(),
        units = survey.len(),
        total_bytes = survey.total_bytes(),
        "Survey complete"
    );
    Ok(survey)
}

/// List the files of one unit in archive order.
///
/// A file unit yields itself. A directory unit yields every regular file
/// below it, sorted by path, skipping pruned names.
pub fn unit_files(root: &Path, unit: &str, rules: &PruneRules) -> Result<Vec<UnitFile>, BuildError> {
    let unit_path = root.join(unit);
    let metadata = fs::metadata(&unit_path).map_err(|e| BuildError::io(&unit_path, e))?;

    if !metadata.is_dir() {
        return Ok(vec![UnitFile {
            path: unit_path,
            archive_name: unit.to_string(),
            len: metadata.len(),
        }]);
    }

    let mut files = Vec::new();
    let walker = walkdir::WalkDir::new(&unit_path)
        .follow_links(true)
        .sort_by(|a, b| a.file_name().cmp(b.file_name()))
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0 || !e.file_name().to_str().is_some_and(|n| rules.is_pruned(n))
        });

    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let metadata = entry.metadata()?;
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(|_| BuildError::io(entry.path(), invalid_data("path escapes the tree root")))?;

        files.push(UnitFile {
            path: entry.path().to_path_buf(),
            archive_name: archive_name(rel)?,
            len: metadata.len(),
        });
    }

    Ok(files)
}

/// Forward-slash archive name for a path relative to the tree root
pub(crate) fn archive_name(rel: &Path) -> Result<String, BuildError> {
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => parts.push(
                part.to_str()
                    .ok_or_else(|| BuildError::io(rel, invalid_data("non UTF-8 path")))?,
            ),
            Component::CurDir => {}
            _ => return Err(BuildError::io(rel, invalid_data("unexpected path component"))),
        }
    }
    Ok(parts.join("/"))
}

fn utf8_name(path: &Path) -> Result<String, BuildError> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| BuildError::io(path, invalid_data("non UTF-8 entry name")))
}

fn invalid_data(message: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, message.to_string())
}
