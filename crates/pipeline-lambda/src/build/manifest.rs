//! Build manifest.
//!
//! Records per-unit sizes and the layer assignment next to the archives:
//! - `sizes.txt`: `<bytes>\t<unit>` per unit, largest first
//! - `layers.txt`: `<bytes>\t<archive>` per layer, largest first
//! - `manifest.json`: the full record, including members and estimates

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;

use super::partition::Assignment;
use super::survey::Survey;
use crate::config::Ceilings;
use crate::error::BuildError;

pub const SIZES_FILE: &str = "sizes.txt";
pub const LAYERS_FILE: &str = "layers.txt";
pub const MANIFEST_FILE: &str = "manifest.json";

/// Sizes and layer assignment of one build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Uncompressed bytes per unit
    pub unit_sizes: BTreeMap<String, u64>,

    /// Layers in id order
    pub layers: Vec<LayerRecord>,
}

/// One layer as recorded in the manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerRecord {
    pub id: usize,

    /// Archive file name
    pub archive: String,

    /// Bytes the archive unpacks to, entry files included
    pub uncompressed_total: u64,

    pub compressed_estimate: u64,

    /// Entry files placed at the archive root, outside any unit
    #[serde(default)]
    pub entry_bytes: u64,

    /// Size of the built archive, once known
    #[serde(default)]
    pub compressed_actual: Option<u64>,

    pub members: Vec<String>,
}

impl Manifest {
    pub fn new(survey: &Survey, assignment: &Assignment) -> Self {
        let unit_sizes = survey
            .units()
            .iter()
            .map(|u| (u.name.clone(), u.uncompressed_bytes))
            .collect();

        let layers = assignment
            .layers()
            .iter()
            .map(|layer| LayerRecord {
                id: layer.id,
                archive: layer.archive_name(),
                uncompressed_total: layer.uncompressed_total,
                compressed_estimate: layer.compressed_estimate,
                entry_bytes: layer.reserved_bytes,
                compressed_actual: None,
                members: layer.members.clone(),
            })
            .collect();

        Self { unit_sizes, layers }
    }

    /// Record the real size of a built archive
    pub fn record_actual(&mut self, layer: usize, bytes: u64) {
        if let Some(record) = self.layers.iter_mut().find(|l| l.id == layer) {
            record.compressed_actual = Some(bytes);
        }
    }

    /// `<bytes>\t<unit>` lines, largest first
    pub fn render_sizes(&self) -> String {
        render_listing(self.unit_sizes.iter().map(|(name, size)| (*size, name.as_str())))
    }

    /// `<bytes>\t<archive>` lines, largest first
    pub fn render_layers(&self) -> String {
        render_listing(
            self.layers
                .iter()
                .map(|l| (l.uncompressed_total, l.archive.as_str())),
        )
    }

    /// Parse a manifest from JSON content
    pub fn parse(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse build manifest")
    }

    /// Load a manifest from a build output directory
    pub fn load<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let path = dir.as_ref().join(MANIFEST_FILE);
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read manifest file: {:?}", path))?;
        Self::parse(&content)
    }

    /// Write all three projections into `dir`
    pub fn write_to(&self, dir: &Path) -> Result<(), BuildError> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| BuildError::io(dir.join(MANIFEST_FILE), e.into()))?;

        for (name, content) in [
            (SIZES_FILE, self.render_sizes()),
            (LAYERS_FILE, self.render_layers()),
            (MANIFEST_FILE, json),
        ] {
            let path = dir.join(name);
            fs::write(&path, content).map_err(|e| BuildError::io(&path, e))?;
        }

        tracing::info!(dir = %dir.display(), layers = self.layers.len(), "Wrote manifest");
        Ok(())
    }

    /// Check the partition and ceiling invariants of a recorded build
    pub fn validate(&self, ceilings: &Ceilings) -> Result<()> {
        if self.layers.len() > ceilings.max_layers {
            anyhow::bail!(
                "{} layers recorded, at most {} allowed",
                self.layers.len(),
                ceilings.max_layers
            );
        }

        let mut seen = HashSet::new();
        for (index, layer) in self.layers.iter().enumerate() {
            if layer.id != index {
                anyhow::bail!("Layer ids must be contiguous from 0, found {} at position {}", layer.id, index);
            }
            if layer.members.is_empty() && layer.entry_bytes == 0 {
                anyhow::bail!("Layer {} has no members", layer.id);
            }

            let mut total = layer.entry_bytes;
            for member in &layer.members {
                let size = self
                    .unit_sizes
                    .get(member)
                    .with_context(|| format!("Layer {} lists unknown unit '{}'", layer.id, member))?;
                if !seen.insert(member.as_str()) {
                    anyhow::bail!("Unit '{}' appears in more than one layer", member);
                }
                total += size;
            }

            if total != layer.uncompressed_total {
                anyhow::bail!(
                    "Layer {} records {} bytes but its contents sum to {}",
                    layer.id,
                    layer.uncompressed_total,
                    total
                );
            }
            if layer.uncompressed_total > ceilings.max_uncompressed_layer {
                anyhow::bail!("Layer {} exceeds the uncompressed ceiling", layer.id);
            }
            let compressed = layer.compressed_actual.unwrap_or(layer.compressed_estimate);
            if layer.compressed_estimate > ceilings.max_compressed_layer
                || compressed > ceilings.max_compressed_layer
            {
                anyhow::bail!("Layer {} exceeds the compressed ceiling", layer.id);
            }
        }

        if seen.len() != self.unit_sizes.len() {
            let missing: Vec<&str> = self
                .unit_sizes
                .keys()
                .map(String::as_str)
                .filter(|name| !seen.contains(name))
                .collect();
            anyhow::bail!("Units not assigned to any layer: {}", missing.join(", "));
        }

        Ok(())
    }
}

fn render_listing<'a>(rows: impl Iterator<Item = (u64, &'a str)>) -> String {
    let mut rows: Vec<(u64, &str)> = rows.collect();
    rows.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));

    rows.iter()
        .map(|(size, name)| format!("{}\t{}\n", size, name))
        .collect()
}
