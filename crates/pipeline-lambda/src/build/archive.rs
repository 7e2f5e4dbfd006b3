//! Layer archive writing.
//!
//! Each layer becomes one `layer-<id>.zip` holding its members at their paths
//! relative to the tree root. Entries carry a fixed timestamp, so rebuilding an
//! unchanged tree produces byte-identical archives.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

use super::partition::Layer;
use super::survey::{unit_files, PruneRules};
use crate::error::BuildError;

/// Options shared by every archive entry
pub(crate) fn entry_options(len: u64, mode: Option<u32>) -> SimpleFileOptions {
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(DateTime::default())
        .large_file(len >= u32::MAX as u64);

    match mode {
        Some(mode) => options.unix_permissions(mode),
        None => options,
    }
}

/// Name of an entry file at the root of layer 0
pub(crate) fn entry_name(path: &Path) -> Option<&str> {
    path.file_name().and_then(|n| n.to_str())
}

/// A written layer archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltArchive {
    pub layer: usize,
    pub path: PathBuf,
    pub compressed_bytes: u64,
    /// Bytes the archive unpacks to
    pub uncompressed_bytes: u64,
}

/// Writes layer archives into one output directory
#[derive(Debug, Clone)]
pub struct ArchiveBuilder {
    /// Root of the dependency tree
    root: PathBuf,

    /// Directory the archives are written into
    out_dir: PathBuf,

    rules: PruneRules,

    /// Files placed at the root of layer 0
    entry_files: Vec<PathBuf>,
}

impl ArchiveBuilder {
    pub fn new(root: impl Into<PathBuf>, out_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            out_dir: out_dir.into(),
            rules: PruneRules::none(),
            entry_files: Vec::new(),
        }
    }

    pub fn with_rules(mut self, rules: PruneRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_entry_files(mut self, files: Vec<PathBuf>) -> Self {
        self.entry_files = files;
        self
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    /// Write the archive for `layer`.
    ///
    /// A member that is no longer present under the root fails the layer;
    /// the tree changed after it was surveyed.
    pub fn build_layer(&self, layer: &Layer) -> Result<BuiltArchive, BuildError> {
        let path = self.out_dir.join(layer.archive_name());
        let file = File::create(&path)
            .map_err(|e| BuildError::archive(layer.id, format!("cannot create {}: {}", path.display(), e)))?;
        let mut writer = ZipWriter::new(file);
        let zip_err = |e: zip::result::ZipError| BuildError::archive(layer.id, e.to_string());

        let mut entries = 0usize;
        let mut uncompressed_bytes = 0u64;

        if layer.id == 0 {
            for entry in &self.entry_files {
                let name = entry_name(entry).ok_or_else(|| {
                    BuildError::archive(layer.id, format!("invalid entry file path {:?}", entry))
                })?;
                let metadata = fs::metadata(entry).map_err(|_| {
                    BuildError::archive(layer.id, format!("entry file {:?} is missing", entry))
                })?;

                writer
                    .start_file(name, entry_options(metadata.len(), file_mode(&metadata)))
                    .map_err(zip_err)?;
                uncompressed_bytes += copy_into(layer.id, entry, &mut writer)?;
                entries += 1;
            }
        }

        for member in &layer.members {
            let member_path = self.root.join(member);
            if fs::symlink_metadata(&member_path).is_err() {
                return Err(BuildError::archive(
                    layer.id,
                    format!("member '{}' is missing from {}", member, self.root.display()),
                ));
            }

            for unit_file in unit_files(&self.root, member, &self.rules)? {
                let metadata = fs::metadata(&unit_file.path)
                    .map_err(|e| BuildError::io(&unit_file.path, e))?;
                writer
                    .start_file(
                        unit_file.archive_name.as_str(),
                        entry_options(unit_file.len, file_mode(&metadata)),
                    )
                    .map_err(zip_err)?;
                uncompressed_bytes += copy_into(layer.id, &unit_file.path, &mut writer)?;
                entries += 1;
            }
        }

        writer.finish().map_err(zip_err)?;

        let compressed_bytes = fs::metadata(&path)
            .map_err(|e| BuildError::io(&path, e))?
            .len();

        tracing::info!(
            layer = layer.id,
            archive = %path.display(),
            entries,
            uncompressed_bytes,
            compressed_bytes,
            estimate = layer.compressed_estimate,
            "Built layer archive"
        );

        Ok(BuiltArchive {
            layer: layer.id,
            path,
            compressed_bytes,
            uncompressed_bytes,
        })
    }
}

/// Stream `path` into the current entry. Failing to read the source is an
/// I/O error; anything else happened while writing the archive.
fn copy_into(layer: usize, path: &Path, writer: &mut ZipWriter<File>) -> Result<u64, BuildError> {
    let mut source = File::open(path).map_err(|e| BuildError::io(path, e))?;
    io::copy(&mut source, writer)
        .map_err(|e| BuildError::archive(layer, format!("writing {}: {}", path.display(), e)))
}

#[cfg(unix)]
fn file_mode(metadata: &fs::Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(metadata.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn file_mode(_metadata: &fs::Metadata) -> Option<u32> {
    None
}
