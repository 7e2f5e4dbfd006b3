//! Layer partitioning.
//!
//! Units are packed decreasing by size (ties by name) into at most
//! `max_layers` layers, each under both the uncompressed and the compressed
//! ceiling. The packing is greedy and deterministic: the same units, ceilings
//! and estimates always produce the same assignment, and layer ids are stable
//! across rebuilds. Entry files placed at the root of layer 0 take their
//! room in that layer before any unit is placed.

use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use super::estimate::CompressionEstimator;
use super::survey::PackageUnit;
use crate::config::Ceilings;
use crate::error::{BuildError, CapacityLimit};

/// Which open layers a unit may be placed into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// A layer that rejects a unit is sealed. Only the newest layer ever
    /// accepts units, so layers fill in size order.
    #[default]
    Sealing,
    /// Every layer stays open; a unit goes to the first one with room.
    FirstFit,
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sealing" => Ok(Strategy::Sealing),
            "first-fit" => Ok(Strategy::FirstFit),
            other => Err(format!("unknown packing strategy '{}' (expected sealing or first-fit)", other)),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Strategy::Sealing => "sealing",
            Strategy::FirstFit => "first-fit",
        })
    }
}

/// One archive's worth of units
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Layer {
    pub id: usize,
    /// Unit names in placement order
    pub members: Vec<String>,
    /// Member sizes plus `reserved_bytes`
    pub uncompressed_total: u64,
    pub compressed_estimate: u64,
    /// Bytes taken by files outside any unit
    pub reserved_bytes: u64,
}

impl Layer {
    fn open(id: usize) -> Self {
        Self {
            id,
            members: Vec::new(),
            uncompressed_total: 0,
            compressed_estimate: 0,
            reserved_bytes: 0,
        }
    }

    /// File name of the archive built from this layer
    pub fn archive_name(&self) -> String {
        format!("layer-{}.zip", self.id)
    }

    fn accepts(&self, size: u64, estimate: u64, ceilings: &Ceilings) -> bool {
        self.uncompressed_total.saturating_add(size) <= ceilings.max_uncompressed_layer
            && self.compressed_estimate.saturating_add(estimate) <= ceilings.max_compressed_layer
    }
}

/// Room held in layer 0 for the entry files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    /// Name reported when the reservation alone breaks a ceiling
    pub label: String,
    pub bytes: u64,
    pub estimate: u64,
}

/// Ordered layers; every unit appears in exactly one of them
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Assignment {
    layers: Vec<Layer>,
}

impl Assignment {
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Id of the layer holding `unit`
    pub fn layer_of(&self, unit: &str) -> Option<usize> {
        self.layers
            .iter()
            .find(|l| l.members.iter().any(|m| m == unit))
            .map(|l| l.id)
    }
}

/// Pack `units` into layers. Unit names must be unique.
pub fn partition(
    units: &[PackageUnit],
    ceilings: &Ceilings,
    estimator: &dyn CompressionEstimator,
    strategy: Strategy,
) -> Result<Assignment, BuildError> {
    partition_reserved(units, ceilings, estimator, strategy, None)
}

/// Pack `units` into layers after setting aside `reservation` in layer 0.
/// With a reservation layer 0 always exists, even when no unit joins it.
pub fn partition_reserved(
    units: &[PackageUnit],
    ceilings: &Ceilings,
    estimator: &dyn CompressionEstimator,
    strategy: Strategy,
    reservation: Option<&Reservation>,
) -> Result<Assignment, BuildError> {
    let mut layers: Vec<Layer> = Vec::new();
    if let Some(reservation) = reservation {
        layers.push(reserved_layer(reservation, ceilings)?);
    }

    let mut order: Vec<&PackageUnit> = units.iter().collect();
    order.sort_by(|a, b| {
        b.uncompressed_bytes
            .cmp(&a.uncompressed_bytes)
            .then_with(|| a.name.cmp(&b.name))
    });

    // Layers before this index are sealed
    let mut first_open = 0usize;

    for unit in order {
        let size = unit.uncompressed_bytes;
        let estimate = estimator.estimate(unit);

        if size > ceilings.max_uncompressed_layer {
            return Err(capacity(unit, CapacityLimit::Uncompressed {
                max: ceilings.max_uncompressed_layer,
            }));
        }
        if estimate > ceilings.max_compressed_layer {
            return Err(capacity(unit, CapacityLimit::Compressed {
                estimate,
                max: ceilings.max_compressed_layer,
            }));
        }

        let slot = match strategy {
            Strategy::FirstFit => layers.iter().position(|l| l.accepts(size, estimate, ceilings)),
            Strategy::Sealing => {
                while first_open < layers.len() && !layers[first_open].accepts(size, estimate, ceilings) {
                    tracing::debug!(layer = first_open, unit = %unit.name, "Sealed layer");
                    first_open += 1;
                }
                (first_open < layers.len()).then_some(first_open)
            }
        };

        let index = match slot {
            Some(index) => index,
            None => {
                if layers.len() >= ceilings.max_layers {
                    return Err(capacity(unit, CapacityLimit::LayerCount {
                        max: ceilings.max_layers,
                    }));
                }
                layers.push(Layer::open(layers.len()));
                layers.len() - 1
            }
        };

        let layer = &mut layers[index];
        layer.members.push(unit.name.clone());
        layer.uncompressed_total += size;
        layer.compressed_estimate += estimate;
        tracing::debug!(unit = %unit.name, bytes = size, estimate, layer = index, "Placed unit");
    }

    tracing::info!(
        layers = layers.len(),
        units = units.len(),
        strategy = %strategy,
        "Partitioned units"
    );
    Ok(Assignment { layers })
}

fn reserved_layer(reservation: &Reservation, ceilings: &Ceilings) -> Result<Layer, BuildError> {
    let exceeded = |limit| BuildError::CapacityExceeded {
        unit: reservation.label.clone(),
        size: reservation.bytes,
        limit,
    };

    if ceilings.max_layers == 0 {
        return Err(exceeded(CapacityLimit::LayerCount { max: 0 }));
    }
    if reservation.bytes > ceilings.max_uncompressed_layer {
        return Err(exceeded(CapacityLimit::Uncompressed {
            max: ceilings.max_uncompressed_layer,
        }));
    }
    if reservation.estimate > ceilings.max_compressed_layer {
        return Err(exceeded(CapacityLimit::Compressed {
            estimate: reservation.estimate,
            max: ceilings.max_compressed_layer,
        }));
    }

    let mut layer = Layer::open(0);
    layer.reserved_bytes = reservation.bytes;
    layer.uncompressed_total = reservation.bytes;
    layer.compressed_estimate = reservation.estimate;
    tracing::debug!(bytes = reservation.bytes, estimate = reservation.estimate, "Reserved room in layer 0");
    Ok(layer)
}

fn capacity(unit: &PackageUnit, limit: CapacityLimit) -> BuildError {
    BuildError::CapacityExceeded {
        unit: unit.name.clone(),
        size: unit.uncompressed_bytes,
        limit,
    }
}
