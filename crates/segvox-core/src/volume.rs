//! Volume and brick index arithmetic.
//!
//! Volumes are dense row-major arrays (x fastest) of `u32` labels. For
//! compression they are sharded into cubic bricks of a power-of-two side
//! length; bricks at the upper volume border may only be partially covered.

use glam::UVec3;

/// Linear index of a voxel position in a row-major volume.
#[inline]
pub fn voxel_index(pos: UVec3, dim: UVec3) -> usize {
    debug_assert!(pos.x < dim.x && pos.y < dim.y && pos.z < dim.z);
    pos.x as usize + dim.x as usize * (pos.y as usize + dim.y as usize * pos.z as usize)
}

/// Total number of voxels in a volume.
#[inline]
pub fn voxel_count(dim: UVec3) -> usize {
    dim.x as usize * dim.y as usize * dim.z as usize
}

/// Number of bricks per axis covering a volume.
#[inline]
pub fn brick_count(dim: UVec3, brick_size: u32) -> UVec3 {
    UVec3::new(
        dim.x.div_ceil(brick_size),
        dim.y.div_ceil(brick_size),
        dim.z.div_ceil(brick_size),
    )
}

/// Total number of bricks covering a volume.
#[inline]
pub fn brick_index_count(dim: UVec3, brick_size: u32) -> u32 {
    let count = brick_count(dim, brick_size);
    count.x * count.y * count.z
}

/// Linear brick index of a brick position, row-major over the brick grid.
#[inline]
pub fn brick_index(brick: UVec3, count: UVec3) -> u32 {
    debug_assert!(brick.x < count.x && brick.y < count.y && brick.z < count.z);
    brick.x + count.x * (brick.y + count.y * brick.z)
}

/// Brick position of a linear brick index.
#[inline]
pub fn brick_pos(index: u32, count: UVec3) -> UVec3 {
    UVec3::new(
        index % count.x,
        (index / count.x) % count.y,
        index / (count.x * count.y),
    )
}

/// Number of voxels of a brick that lie inside the volume, per axis.
///
/// Bricks in the volume interior return `brick_size` on every axis; border
/// bricks are clamped. Voxels beyond the valid size are unspecified.
#[inline]
pub fn valid_brick_size(brick: UVec3, brick_size: u32, dim: UVec3) -> UVec3 {
    let origin = brick * brick_size;
    UVec3::new(
        (dim.x - origin.x).min(brick_size),
        (dim.y - origin.y).min(brick_size),
        (dim.z - origin.z).min(brick_size),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn voxel_index_is_x_fastest() {
        let dim = UVec3::new(4, 3, 2);
        assert_eq!(voxel_index(UVec3::new(0, 0, 0), dim), 0);
        assert_eq!(voxel_index(UVec3::new(1, 0, 0), dim), 1);
        assert_eq!(voxel_index(UVec3::new(0, 1, 0), dim), 4);
        assert_eq!(voxel_index(UVec3::new(0, 0, 1), dim), 12);
        assert_eq!(voxel_index(UVec3::new(3, 2, 1), dim), 23);
    }

    #[test]
    fn brick_grid_covers_volume() {
        let dim = UVec3::new(65, 64, 1);
        assert_eq!(brick_count(dim, 32), UVec3::new(3, 2, 1));
        assert_eq!(brick_index_count(dim, 32), 6);
    }

    #[test]
    fn brick_index_roundtrip() {
        let count = UVec3::new(3, 2, 4);
        for i in 0..(3 * 2 * 4) {
            assert_eq!(brick_index(brick_pos(i, count), count), i);
        }
    }

    #[test]
    fn border_brick_is_clamped() {
        let dim = UVec3::new(33, 32, 5);
        assert_eq!(
            valid_brick_size(UVec3::new(0, 0, 0), 32, dim),
            UVec3::new(32, 32, 5)
        );
        assert_eq!(
            valid_brick_size(UVec3::new(1, 0, 0), 32, dim),
            UVec3::new(1, 32, 5)
        );
    }
}
