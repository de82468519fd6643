//! Plain 4 bit brick encoder.
//!
//! The reference encoding: operation nibbles are stored unpacked behind the
//! brick header, eight per word. In random-access mode every cell of every
//! level owns exactly one nibble (stop bits and palette deltas are rejected,
//! invalid border cells are padded with the filler op), so a single voxel can
//! be decoded by chasing operations along its Morton path without touching
//! the rest of the brick.

use glam::UVec3;
use segvox_core::morton::{morton_decode, morton_encode};
use segvox_core::{Error, Result};

use super::serial::{self, SerialCodec, SymbolReader};
use crate::ops::{self, OpCode, OpMask};

pub struct NibbleEncoder {
    codec: SerialCodec,
}

impl NibbleEncoder {
    pub(crate) fn new(brick_size: u32, op_mask: OpMask, random_access: bool) -> Self {
        Self {
            codec: SerialCodec {
                brick_size,
                op_mask,
                random_access,
                separate_detail: false,
            },
        }
    }

    #[inline]
    pub(crate) fn codec(&self) -> &SerialCodec {
        &self.codec
    }

    /// Encode one brick into `out` (cleared first): header, nibble stream,
    /// palette.
    pub fn encode_brick(&self, volume: &[u32], volume_dim: UVec3, brick_start: UVec3, out: &mut Vec<u32>) {
        let enc = serial::encode_brick_symbols(&self.codec, volume, volume_dim, brick_start);
        let header_size = self.codec.header_size();
        let lod_count = self.codec.lod_count();

        out.clear();
        for lod in 0..lod_count as usize {
            out.push(header_size * 8 + enc.level_starts[lod]);
        }
        out.push(enc.palette.len() as u32);
        debug_assert_eq!(out.len(), header_size as usize);
        out.extend_from_slice(&ops::pack_nibbles(&enc.symbols));
        out.extend_from_slice(&enc.palette);
    }

    /// Decode one brick into the Morton-ordered `cache`.
    pub fn decode_brick(
        &self,
        encoding: &[u32],
        cache: &mut [u32],
        valid: UVec3,
        target_inv_lod: u32,
    ) -> Result<()> {
        let palette = brick_palette(&self.codec, encoding)?;
        let reader = SymbolReader::nibble(encoding, self.codec.header_size() * 8);
        serial::decode_brick_cells(&self.codec, reader, None, palette, cache, valid, target_inv_lod)
    }

    /// Decode a single cell by chasing its operation chain. Requires the
    /// random-access encoding; `cell` is the Morton index within the
    /// `(2^inv_lod)³` cell grid.
    pub fn decode_cell(&self, encoding: &[u32], target_inv_lod: u32, cell: u32) -> Result<u32> {
        debug_assert!(self.codec.random_access);
        let palette = brick_palette(&self.codec, encoding)?;
        let stream_start = encoding[0];

        let mut inv_lod = target_inv_lod;
        let mut m = cell;
        loop {
            if inv_lod == 0 {
                return Ok(palette[0]);
            }
            let pos4bit = encoding[inv_lod as usize] + m;
            let sym = ops::nibble_at(encoding, pos4bit);
            match OpCode::from_nibble(sym) {
                OpCode::Parent => {
                    m >>= 3;
                    inv_lod -= 1;
                }
                op @ (OpCode::NeighborX | OpCode::NeighborY | OpCode::NeighborZ) => {
                    let (x, y, z) = morton_decode(m);
                    let step = match op {
                        OpCode::NeighborX => (1u32, 0u32, 0u32),
                        OpCode::NeighborY => (0, 1, 0),
                        _ => (0, 0, 1),
                    };
                    if x < step.0 || y < step.1 || z < step.2 {
                        // neighbor outside the brick: treat as parent
                        m >>= 3;
                        inv_lod -= 1;
                    } else {
                        m = morton_encode(x - step.0, y - step.1, z - step.2);
                    }
                }
                OpCode::PaletteAdv => {
                    let idx = count_palette_advances(encoding, stream_start, pos4bit);
                    return palette.get(idx).copied().ok_or_else(|| {
                        Error::VerificationFailed(
                            "corrupt brick encoding: palette advance past palette end".into(),
                        )
                    });
                }
                OpCode::PaletteLast => {
                    let idx = count_palette_advances(encoding, stream_start, pos4bit);
                    // the root advance guarantees at least one
                    return Ok(palette[idx - 1]);
                }
                OpCode::PaletteDelta | OpCode::Filler => {
                    return Err(Error::VerificationFailed(
                        "corrupt brick encoding: unexpected operation in random access stream"
                            .into(),
                    ));
                }
            }
        }
    }
}

/// Number of palette advances in nibble positions `[from, to)`; equals the
/// palette index revealed by an advance at position `to`.
fn count_palette_advances(encoding: &[u32], from: u32, to: u32) -> usize {
    let mut count = 0usize;
    for p in from..to {
        if ops::nibble_at(encoding, p) & 0x7 == OpCode::PaletteAdv as u32 {
            count += 1;
        }
    }
    count
}

/// The palette slice at the end of a brick encoding.
pub(crate) fn brick_palette<'a>(codec: &SerialCodec, encoding: &'a [u32]) -> Result<&'a [u32]> {
    let header_size = codec.header_size() as usize;
    if encoding.len() < header_size + 1 {
        return Err(Error::VerificationFailed(
            "corrupt brick encoding: shorter than its header".into(),
        ));
    }
    let palette_size = encoding[codec.palette_size_index() as usize] as usize;
    if palette_size == 0 || header_size + palette_size > encoding.len() {
        return Err(Error::VerificationFailed(
            "corrupt brick encoding: palette size out of range".into(),
        ));
    }
    Ok(&encoding[encoding.len() - palette_size..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use segvox_core::volume::voxel_index;

    fn dense(dim: UVec3, f: impl Fn(u32, u32, u32) -> u32) -> Vec<u32> {
        let mut v = vec![0u32; (dim.x * dim.y * dim.z) as usize];
        for z in 0..dim.z {
            for y in 0..dim.y {
                for x in 0..dim.x {
                    v[voxel_index(UVec3::new(x, y, z), dim)] = f(x, y, z);
                }
            }
        }
        v
    }

    #[test]
    fn brick_roundtrip() {
        let dim = UVec3::splat(8);
        let volume = dense(dim, |x, y, z| (x + 2 * y + 3 * z) % 4);
        let encoder = NibbleEncoder::new(8, OpMask::ALL, false);
        let mut enc = Vec::new();
        encoder.encode_brick(&volume, dim, UVec3::ZERO, &mut enc);

        let mut cache = vec![0u32; 512];
        encoder
            .decode_brick(&enc, &mut cache, UVec3::splat(8), 3)
            .unwrap();
        for z in 0..8 {
            for y in 0..8 {
                for x in 0..8 {
                    let m = morton_encode(x, y, z) as usize;
                    assert_eq!(cache[m], volume[voxel_index(UVec3::new(x, y, z), dim)]);
                }
            }
        }
    }

    #[test]
    fn uniform_brick_size() {
        // header (lod_count + 1 words) + one op nibble word + one palette word
        let dim = UVec3::splat(4);
        let volume = dense(dim, |_, _, _| 0x2a);
        let encoder = NibbleEncoder::new(4, OpMask::ALL, false);
        let mut enc = Vec::new();
        encoder.encode_brick(&volume, dim, UVec3::ZERO, &mut enc);
        assert_eq!(enc.len(), 4 + 1 + 1);
        assert_eq!(*enc.last().unwrap(), 0x2a);
    }

    #[test]
    fn random_access_matches_full_decode() {
        let dim = UVec3::new(7, 8, 5); // border brick
        let volume = dense(dim, |x, y, z| 1 + (x / 2 + y * 2 + z) % 6);
        let encoder = NibbleEncoder::new(8, OpMask::RANDOM_ACCESS, true);
        let mut enc = Vec::new();
        encoder.encode_brick(&volume, dim, UVec3::ZERO, &mut enc);

        let valid = UVec3::new(7, 8, 5);
        for inv_lod in 0..=3u32 {
            let mut cache = vec![0u32; 512];
            encoder.decode_brick(&enc, &mut cache, valid, inv_lod).unwrap();
            let width = 8 >> inv_lod;
            for m in 0..1u32 << (3 * inv_lod) {
                let (x, y, z) = morton_decode(m);
                if x * width >= valid.x || y * width >= valid.y || z * width >= valid.z {
                    continue;
                }
                let via_cell = encoder.decode_cell(&enc, inv_lod, m).unwrap();
                let slot = (m as usize) << (3 * (3 - inv_lod) as usize);
                assert_eq!(via_cell, cache[slot], "inv_lod {inv_lod} cell {m}");
            }
        }
    }
}
