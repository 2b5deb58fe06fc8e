//! Spatial indexing abstractions for agent neighborhood queries.
//!
//! The universe keeps agents in dense columns; this crate buckets their
//! positions into a fixed sector grid over the XZ plane so that radius
//! queries touch only nearby cells. Visitation order is deterministic:
//! cells ascend row-major, entries within a cell ascend by dense index.

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors emitted by spatial index implementations.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Indicates configuration values that cannot be used (e.g., non-positive sector size).
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Common behaviour exposed by neighborhood indices.
pub trait NeighborhoodIndex {
    /// Rebuild internal structures from agent positions.
    fn rebuild(&mut self, positions: &[[f32; 3]]) -> Result<(), IndexError>;

    /// Visit every agent within `radius` of `origin`, passing the dense
    /// index and the exact 3D distance.
    fn visit_within(
        &self,
        origin: [f32; 3],
        radius: f32,
        visitor: &mut dyn FnMut(usize, OrderedFloat<f32>),
    );
}

/// Uniform sector grid over the XZ plane, centered on the world origin.
///
/// Positions outside the grid extent are clamped into the border cells, so
/// every indexed agent remains reachable; the exact distance filter in
/// [`NeighborhoodIndex::visit_within`] keeps results correct regardless.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniformSectorGrid {
    /// Edge length of each sector in world units.
    pub sector_size: f32,
    /// Number of sectors along each axis.
    pub sectors_per_axis: usize,
    #[serde(skip)]
    buckets: Vec<Vec<usize>>,
    #[serde(skip)]
    positions: Vec<[f32; 3]>,
}

impl UniformSectorGrid {
    /// Create a grid of `sectors_per_axis²` cells with the given edge length.
    #[must_use]
    pub fn new(sector_size: f32, sectors_per_axis: usize) -> Self {
        Self {
            sector_size,
            sectors_per_axis,
            buckets: Vec::new(),
            positions: Vec::new(),
        }
    }

    /// Half of the total grid extent along one axis.
    #[must_use]
    pub fn half_extent(&self) -> f32 {
        self.sector_size * self.sectors_per_axis as f32 * 0.5
    }

    /// Number of positions currently indexed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Returns true when nothing is indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Clamp a world coordinate onto a sector axis index.
    #[inline]
    fn axis_cell(&self, coord: f32) -> usize {
        let shifted = coord + self.half_extent();
        let cell = (shifted / self.sector_size).floor();
        let max = (self.sectors_per_axis - 1) as f32;
        cell.clamp(0.0, max) as usize
    }

    #[inline]
    fn bucket_of(&self, pos: [f32; 3]) -> usize {
        let cx = self.axis_cell(pos[0]);
        let cz = self.axis_cell(pos[2]);
        cz * self.sectors_per_axis + cx
    }
}

impl Default for UniformSectorGrid {
    fn default() -> Self {
        Self::new(512.0, 16)
    }
}

impl NeighborhoodIndex for UniformSectorGrid {
    fn rebuild(&mut self, positions: &[[f32; 3]]) -> Result<(), IndexError> {
        if self.sector_size <= 0.0 {
            return Err(IndexError::InvalidConfig("sector_size must be positive"));
        }
        if self.sectors_per_axis == 0 {
            return Err(IndexError::InvalidConfig(
                "sectors_per_axis must be non-zero",
            ));
        }
        let cell_count = self.sectors_per_axis * self.sectors_per_axis;
        if self.buckets.len() != cell_count {
            self.buckets = vec![Vec::new(); cell_count];
        } else {
            for bucket in &mut self.buckets {
                bucket.clear();
            }
        }
        self.positions.clear();
        self.positions.extend_from_slice(positions);
        for (idx, pos) in positions.iter().enumerate() {
            let bucket = self.bucket_of(*pos);
            self.buckets[bucket].push(idx);
        }
        Ok(())
    }

    fn visit_within(
        &self,
        origin: [f32; 3],
        radius: f32,
        visitor: &mut dyn FnMut(usize, OrderedFloat<f32>),
    ) {
        if radius < 0.0 || self.buckets.is_empty() {
            return;
        }
        let min_cx = self.axis_cell(origin[0] - radius);
        let max_cx = self.axis_cell(origin[0] + radius);
        let min_cz = self.axis_cell(origin[2] - radius);
        let max_cz = self.axis_cell(origin[2] + radius);
        let radius_sq = radius * radius;
        for cz in min_cz..=max_cz {
            for cx in min_cx..=max_cx {
                let bucket = &self.buckets[cz * self.sectors_per_axis + cx];
                for &idx in bucket {
                    let pos = self.positions[idx];
                    let dx = pos[0] - origin[0];
                    let dy = pos[1] - origin[1];
                    let dz = pos[2] - origin[2];
                    let dist_sq = dx * dx + dy * dy + dz * dz;
                    if dist_sq <= radius_sq {
                        visitor(idx, OrderedFloat(dist_sq.sqrt()));
                    }
                }
            }
        }
    }
}
