//! Per-brick multigrid construction.
//!
//! The multigrid is the octree of labels an encoder walks: one array per
//! inverse level of detail, finest level first, each level row-major. The
//! finest level copies the brick's voxels; every coarser cell carries the
//! label of its first (Morton index 0) child as representative and a flag
//! telling whether its whole subtree is uniformly labeled. This is the only
//! place raw voxels are read during compression.

use glam::UVec3;
use segvox_core::volume::voxel_index;

/// One cell of the multigrid.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MultigridNode {
    /// Representative label of the subtree below this cell.
    pub label: u32,
    /// True iff every valid voxel below this cell carries `label`.
    pub uniform: bool,
}

/// Octree of labels for a single brick, finest level first.
#[derive(Clone, Debug)]
pub struct Multigrid {
    nodes: Vec<MultigridNode>,
    lod_offsets: Vec<usize>,
    brick_size: u32,
    valid_size: UVec3,
}

impl Multigrid {
    /// Build the multigrid for the brick starting at `brick_start`.
    ///
    /// `valid_brick_size` clamps border bricks; cells entirely outside of it
    /// are invalid and never contribute to coarser levels. With
    /// `need_stop = false` the uniformity flags are not computed (all cells
    /// report non-uniform), which skips work when stop bits are disabled.
    pub fn build(
        volume: &[u32],
        volume_dim: UVec3,
        brick_start: UVec3,
        brick_size: u32,
        need_stop: bool,
    ) -> Self {
        debug_assert!(brick_size.is_power_of_two());
        let lod_count = brick_size.trailing_zeros() + 1;
        let valid_size = UVec3::new(
            volume_dim.x.saturating_sub(brick_start.x).min(brick_size),
            volume_dim.y.saturating_sub(brick_start.y).min(brick_size),
            volume_dim.z.saturating_sub(brick_start.z).min(brick_size),
        );

        let mut node_count = 0usize;
        let mut lod_offsets = vec![0usize; lod_count as usize];
        for inv_lod in (0..lod_count).rev() {
            lod_offsets[inv_lod as usize] = node_count;
            let cells = 1usize << (3 * inv_lod);
            node_count += cells;
        }
        let mut nodes = vec![MultigridNode::default(); node_count];

        // finest level: copy voxels
        let finest = (lod_count - 1) as usize;
        {
            let base = lod_offsets[finest];
            let b = brick_size as usize;
            let mut i = 0usize;
            for z in 0..brick_size {
                for y in 0..brick_size {
                    for x in 0..brick_size {
                        let pos = brick_start + UVec3::new(x, y, z);
                        let label = if x < valid_size.x && y < valid_size.y && z < valid_size.z {
                            volume[voxel_index(pos, volume_dim)]
                        } else {
                            0
                        };
                        nodes[base + i] = MultigridNode {
                            label,
                            uniform: need_stop,
                        };
                        i += 1;
                    }
                }
            }
            debug_assert_eq!(i, b * b * b);
        }

        // coarser levels bottom-up
        for inv_lod in (0..lod_count - 1).rev() {
            let cells_per_axis = 1u32 << inv_lod;
            let child_axis = cells_per_axis * 2;
            let width = brick_size >> inv_lod;
            let child_width = width / 2;
            let base = lod_offsets[inv_lod as usize];
            let child_base = lod_offsets[inv_lod as usize + 1];
            for z in 0..cells_per_axis {
                for y in 0..cells_per_axis {
                    for x in 0..cells_per_axis {
                        let idx = (x + cells_per_axis * (y + cells_per_axis * z)) as usize;
                        let first_child = (2 * x + child_axis * (2 * y + child_axis * 2 * z)) as usize;
                        let mut label = 0u32;
                        let mut uniform = need_stop;
                        let mut first = true;
                        for dz in 0..2u32 {
                            for dy in 0..2u32 {
                                for dx in 0..2u32 {
                                    let cx = 2 * x + dx;
                                    let cy = 2 * y + dy;
                                    let cz = 2 * z + dz;
                                    if cx * child_width >= valid_size.x
                                        || cy * child_width >= valid_size.y
                                        || cz * child_width >= valid_size.z
                                    {
                                        continue;
                                    }
                                    let child = nodes[child_base
                                        + first_child
                                        + (dx + child_axis * (dy + child_axis * dz)) as usize];
                                    if first {
                                        label = child.label;
                                        first = false;
                                    }
                                    uniform &= child.uniform && child.label == label;
                                }
                            }
                        }
                        nodes[base + idx] = MultigridNode { label, uniform };
                    }
                }
            }
        }

        Self {
            nodes,
            lod_offsets,
            brick_size,
            valid_size,
        }
    }

    /// Number of levels, `log2(brick_size) + 1`.
    #[inline]
    pub fn lod_count(&self) -> u32 {
        self.lod_offsets.len() as u32
    }

    /// Offset of the given inverse LoD in the flat node array.
    #[inline]
    pub fn lod_offset(&self, inv_lod: u32) -> usize {
        self.lod_offsets[inv_lod as usize]
    }

    /// Cell of the given inverse LoD, `cell` row-major within the level.
    #[inline]
    pub fn node(&self, inv_lod: u32, cell: usize) -> MultigridNode {
        self.nodes[self.lod_offsets[inv_lod as usize] + cell]
    }

    /// The single root cell.
    #[inline]
    pub fn root(&self) -> MultigridNode {
        self.nodes[*self.lod_offsets.first().expect("at least one level")]
    }

    /// Voxels of the brick inside the volume, per axis.
    #[inline]
    pub fn valid_size(&self) -> UVec3 {
        self.valid_size
    }

    /// True iff the cell intersects the valid brick region.
    #[inline]
    pub fn cell_valid(&self, inv_lod: u32, pos: UVec3) -> bool {
        let width = self.brick_size >> inv_lod;
        pos.x * width < self.valid_size.x
            && pos.y * width < self.valid_size.y
            && pos.z * width < self.valid_size.z
    }

    /// All nodes, finest level first.
    #[inline]
    pub fn nodes(&self) -> &[MultigridNode] {
        &self.nodes
    }
}
