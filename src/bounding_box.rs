// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Partition metadata exchanged between participants
//!
//! A [`BoundingBox`] summarizes the region owned by one rank. The maps are
//! keyed by rank and iterate in ascending key order, which is also the order
//! in which they travel over the wire.

use std::collections::BTreeMap;

/// Value used to fill boxes that are preallocated for a receive
pub const UNSET_BOUND: f64 = -1.0;

/// Axis-aligned bounding box, one `(min, max)` pair per spatial dimension
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BoundingBox {
    bounds: Vec<(f64, f64)>,
}

impl BoundingBox {
    /// Create a box from its per-dimension bounds
    pub fn new(bounds: Vec<(f64, f64)>) -> Self {
        Self { bounds }
    }

    /// Create a placeholder box of the given dimensionality
    ///
    /// Receivers preallocate boxes this way, the dimension is not sent.
    pub fn with_dimensions(dimensions: usize) -> Self {
        Self {
            bounds: vec![(UNSET_BOUND, UNSET_BOUND); dimensions],
        }
    }

    pub fn dimensions(&self) -> usize {
        self.bounds.len()
    }

    /// Bounds of one dimension
    pub fn bounds(&self, dimension: usize) -> Option<(f64, f64)> {
        self.bounds.get(dimension).copied()
    }

    pub fn pairs(&self) -> &[(f64, f64)] {
        &self.bounds
    }

    pub fn pairs_mut(&mut self) -> &mut [(f64, f64)] {
        &mut self.bounds
    }

    /// Whether two boxes overlap in every dimension (touching counts)
    ///
    /// Partitioning uses this to decide which remote ranks a local rank has
    /// to talk to. Boxes of different dimensionality never overlap.
    pub fn overlaps(&self, other: &BoundingBox) -> bool {
        self.dimensions() == other.dimensions()
            && self
                .bounds
                .iter()
                .zip(other.bounds.iter())
                .all(|(a, b)| a.0 <= b.1 && b.0 <= a.1)
    }
}

impl From<Vec<(f64, f64)>> for BoundingBox {
    fn from(bounds: Vec<(f64, f64)>) -> Self {
        Self::new(bounds)
    }
}

/// Bounding boxes of a whole participant, keyed by rank
pub type BoundingBoxMap = BTreeMap<i32, BoundingBox>;

/// For each rank, the remote ranks whose partitions it has to exchange data with
pub type ConnectionMap = BTreeMap<i32, Vec<i32>>;

/// Build a map of placeholder boxes for the expected ranks
pub fn bounding_box_map_with_keys(
    ranks: impl IntoIterator<Item = i32>,
    dimensions: usize,
) -> BoundingBoxMap {
    ranks
        .into_iter()
        .map(|rank| (rank, BoundingBox::with_dimensions(dimensions)))
        .collect()
}

/// Derive the connection map of the local ranks against the remote partition
///
/// Local rank `r` is connected to every remote rank whose box overlaps its own.
pub fn connection_map(local: &BoundingBoxMap, remote: &BoundingBoxMap) -> ConnectionMap {
    local
        .iter()
        .map(|(rank, own)| {
            let partners = remote
                .iter()
                .filter(|(_, other)| own.overlaps(other))
                .map(|(remote_rank, _)| *remote_rank)
                .collect();
            (*rank, partners)
        })
        .collect()
}
