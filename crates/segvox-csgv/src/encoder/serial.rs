//! Shared walk of the serial brick encoders.
//!
//! Encoding builds the brick's multigrid and walks it coarse to fine,
//! emitting one operation symbol per cell (Morton order within a level).
//! Decoding replays the stream into a Morton-ordered label cache. Because a
//! coarse cell's representative label is its first child's label, a cell and
//! its first descendant share a cache slot, so the cache needs no separate
//! storage per level.

use glam::UVec3;
use segvox_core::morton::{morton_decode, morton_encode};
use segvox_core::{Error, Result};

use crate::multigrid::Multigrid;
use crate::ops::{self, OpCode, OpMask, STOP_FLAG};
use crate::palette::BrickPalette;
use crate::rans::Rans;

/// Configuration shared by the serial (sequential-stream) encoders.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SerialCodec {
    pub brick_size: u32,
    pub op_mask: OpMask,
    pub random_access: bool,
    pub separate_detail: bool,
}

impl SerialCodec {
    /// Number of octree levels per brick, `log2(brick_size) + 1`.
    #[inline]
    pub fn lod_count(&self) -> u32 {
        self.brick_size.trailing_zeros() + 1
    }

    /// Inverse LoD of the voxel level.
    #[inline]
    pub fn finest_lod(&self) -> u32 {
        self.lod_count() - 1
    }

    /// Brick header size in words.
    #[inline]
    pub fn header_size(&self) -> u32 {
        self.lod_count() + u32::from(!self.separate_detail)
    }

    /// Header word holding the palette length.
    #[inline]
    pub fn palette_size_index(&self) -> u32 {
        self.header_size() - 1
    }

    #[inline]
    fn stop_bits(&self) -> bool {
        self.op_mask.contains(OpMask::STOP_BIT)
    }

    #[inline]
    fn legacy_delta(&self) -> bool {
        self.op_mask.contains(OpMask::USE_OLD_PAL_DELTA)
    }

    /// True iff the cell at `pos` (cell coordinates of `inv_lod`) intersects
    /// the valid brick region.
    #[inline]
    fn cell_valid(&self, inv_lod: u32, pos: (u32, u32, u32), valid: UVec3) -> bool {
        let width = self.brick_size >> inv_lod;
        pos.0 * width < valid.x && pos.1 * width < valid.y && pos.2 * width < valid.z
    }
}

/// Raw result of the encode walk before stream packing.
pub(crate) struct EncodedSymbols {
    /// One entry per emitted nibble.
    pub symbols: Vec<u8>,
    /// Symbol index where the ops of each inverse LoD begin.
    pub level_starts: Vec<u32>,
    /// Revealed labels, entry 0 is the root label.
    pub palette: Vec<u32>,
}

/// Encode one brick into operation symbols, palette, and level boundaries.
pub(crate) fn encode_brick_symbols(
    codec: &SerialCodec,
    volume: &[u32],
    volume_dim: UVec3,
    brick_start: UVec3,
) -> EncodedSymbols {
    let grid = Multigrid::build(
        volume,
        volume_dim,
        brick_start,
        codec.brick_size,
        codec.stop_bits(),
    );
    let valid = grid.valid_size();
    let lod_count = codec.lod_count();
    let finest = codec.finest_lod();

    let mut symbols: Vec<u8> = Vec::new();
    let mut level_starts = vec![0u32; lod_count as usize];
    let mut palette = BrickPalette::new(grid.root().label);

    // the root reveals its label as palette slot 0
    let root_stop = codec.stop_bits() && finest > 0 && grid.root().uniform;
    symbols.push((OpCode::PaletteAdv as u8) | if root_stop { STOP_FLAG as u8 } else { 0 });

    let mut prev_covered = vec![root_stop];
    for inv_lod in 1..=finest {
        level_starts[inv_lod as usize] = symbols.len() as u32;
        let cells_per_axis = 1u32 << inv_lod;
        let cell_count = 1usize << (3 * inv_lod);
        let mut covered = vec![false; cell_count];

        for m in 0..cell_count as u32 {
            if prev_covered[(m >> 3) as usize] {
                covered[m as usize] = true;
                continue;
            }
            let pos = morton_decode(m);
            if !codec.cell_valid(inv_lod, pos, valid) {
                if codec.random_access {
                    symbols.push(OpCode::Filler as u8);
                }
                continue;
            }

            let row = cell_row(pos, cells_per_axis);
            let node = grid.node(inv_lod, row);
            let stop = codec.stop_bits() && inv_lod < finest && node.uniform;
            if stop {
                covered[m as usize] = true;
            }
            let stop_flag = if stop { STOP_FLAG as u8 } else { 0 };

            let op = choose_op(codec, &grid, &mut palette, inv_lod, pos, cells_per_axis, node.label);
            match op {
                Emit::Op(code) => symbols.push((code as u8) | stop_flag),
                Emit::Delta(d) => {
                    symbols.push((OpCode::PaletteDelta as u8) | stop_flag);
                    ops::push_palette_delta(&mut symbols, d, codec.legacy_delta());
                }
            }
        }
        prev_covered = covered;
    }

    EncodedSymbols {
        symbols,
        level_starts,
        palette: palette.labels().to_vec(),
    }
}

enum Emit {
    Op(OpCode),
    Delta(u32),
}

#[inline]
fn cell_row(pos: (u32, u32, u32), cells_per_axis: u32) -> usize {
    (pos.0 + cells_per_axis * (pos.1 + cells_per_axis * pos.2)) as usize
}

/// Pick the cheapest enabled operation for a cell, in the fixed priority
/// order parent, neighbors, palette re-use, palette delta, palette advance.
fn choose_op(
    codec: &SerialCodec,
    grid: &Multigrid,
    palette: &mut BrickPalette,
    inv_lod: u32,
    pos: (u32, u32, u32),
    cells_per_axis: u32,
    label: u32,
) -> Emit {
    let mask = codec.op_mask;

    if mask.contains(OpMask::PARENT) {
        let parent_row = cell_row((pos.0 / 2, pos.1 / 2, pos.2 / 2), cells_per_axis / 2);
        if grid.node(inv_lod - 1, parent_row).label == label {
            return Emit::Op(OpCode::Parent);
        }
    }

    let neighbors = [
        (OpMask::NEIGHBOR_X, OpCode::NeighborX, (1u32, 0u32, 0u32)),
        (OpMask::NEIGHBOR_Y, OpCode::NeighborY, (0, 1, 0)),
        (OpMask::NEIGHBOR_Z, OpCode::NeighborZ, (0, 0, 1)),
    ];
    for (flag, code, step) in neighbors {
        if !mask.contains(flag) {
            continue;
        }
        if pos.0 < step.0 || pos.1 < step.1 || pos.2 < step.2 {
            continue;
        }
        let q = (pos.0 - step.0, pos.1 - step.1, pos.2 - step.2);
        if !grid.cell_valid(inv_lod, UVec3::new(q.0, q.1, q.2)) {
            continue;
        }
        if grid.node(inv_lod, cell_row(q, cells_per_axis)).label == label {
            return Emit::Op(code);
        }
    }

    if mask.contains(OpMask::PALETTE_LAST) && palette.last() == label {
        return Emit::Op(OpCode::PaletteLast);
    }

    if mask.contains(OpMask::PALETTE_DELTA) {
        if let Some(d) = palette.delta_of(label) {
            if !codec.legacy_delta() || d < 16 {
                return Emit::Delta(d);
            }
        }
    }

    palette.advance(label);
    Emit::Op(OpCode::PaletteAdv)
}

/// Sequential symbol source of a brick stream.
pub(crate) enum SymbolReader<'a> {
    Nibble {
        words: &'a [u32],
        idx: u32,
    },
    Rans {
        rans: &'a Rans,
        words: &'a [u32],
        state: u32,
        byte_index: u32,
    },
}

impl<'a> SymbolReader<'a> {
    pub fn nibble(words: &'a [u32], start_nibble: u32) -> Self {
        Self::Nibble {
            words,
            idx: start_nibble,
        }
    }

    pub fn rans(rans: &'a Rans, words: &'a [u32], start_byte: u32) -> Self {
        let mut byte_index = start_byte;
        let state = Rans::init_decode(words, &mut byte_index);
        Self::Rans {
            rans,
            words,
            state,
            byte_index,
        }
    }

    #[inline]
    fn next(&mut self) -> u32 {
        match self {
            Self::Nibble { words, idx } => {
                let s = ops::nibble_at(words, *idx);
                *idx += 1;
                s
            }
            Self::Rans {
                rans,
                words,
                state,
                byte_index,
            } => rans.next_symbol(state, byte_index, words),
        }
    }
}

/// Where the finest level's symbols come from when they are not part of the
/// base stream.
pub(crate) enum DetailSource<'a> {
    /// Second rANS table over a byte offset of the brick's own words.
    Inline {
        rans: &'a Rans,
        words: &'a [u32],
        start_byte: u32,
    },
    /// Second rANS table over a separated detail buffer.
    Separate { rans: &'a Rans, words: &'a [u32] },
}

impl<'a> DetailSource<'a> {
    fn into_reader(self) -> SymbolReader<'a> {
        match self {
            Self::Inline {
                rans,
                words,
                start_byte,
            } => SymbolReader::rans(rans, words, start_byte),
            Self::Separate { rans, words } => SymbolReader::rans(rans, words, 0),
        }
    }
}

fn corrupt(what: &str) -> Error {
    Error::VerificationFailed(format!("corrupt brick encoding: {what}"))
}

/// Replay a brick stream into `cache` (Morton order, `brick_size³` labels)
/// down to `target_inv_lod`. Cells of the target level are expanded to their
/// whole Morton range so callers can read any finest-level slot.
pub(crate) fn decode_brick_cells<'a>(
    codec: &SerialCodec,
    mut base: SymbolReader<'a>,
    detail_source: Option<DetailSource<'a>>,
    palette: &[u32],
    cache: &mut [u32],
    valid: UVec3,
    target_inv_lod: u32,
) -> Result<()> {
    let finest = codec.finest_lod();
    debug_assert!(target_inv_lod <= finest);
    debug_assert_eq!(cache.len(), 1usize << (3 * finest));
    let slot_shift = |inv_lod: u32| 3 * (finest - inv_lod) as usize;

    // the root op reveals palette slot 0
    let root_sym = base.next();
    if OpCode::from_nibble(root_sym) != OpCode::PaletteAdv {
        return Err(corrupt("root operation is not a palette advance"));
    }
    let root_label = *palette.first().ok_or_else(|| corrupt("empty palette"))?;
    let root_stop = codec.stop_bits() && finest > 0 && root_sym & STOP_FLAG != 0;
    if root_stop {
        cache.fill(root_label);
    } else {
        cache[0] = root_label;
    }
    let mut cursor = 1usize;

    let mut detail_source = detail_source;
    let mut detail_reader: Option<SymbolReader<'_>> = None;
    let mut prev_covered = vec![root_stop];

    for inv_lod in 1..=target_inv_lod {
        let cells_per_axis = 1u32 << inv_lod;
        let cell_count = 1usize << (3 * inv_lod);
        let mut covered = vec![false; cell_count];
        let in_detail = inv_lod == finest && detail_source.is_some();
        let shift = slot_shift(inv_lod);

        for m in 0..cell_count as u32 {
            if prev_covered[(m >> 3) as usize] {
                covered[m as usize] = true;
                continue;
            }

            // lazily switch to the detail stream on its first symbol
            let reader: &mut SymbolReader<'_> = if in_detail {
                if detail_reader.is_none() {
                    detail_reader = Some(
                        detail_source
                            .take()
                            .expect("detail source consumed once")
                            .into_reader(),
                    );
                }
                detail_reader.as_mut().expect("just initialized")
            } else {
                &mut base
            };

            let pos = morton_decode(m);
            if !codec.cell_valid(inv_lod, pos, valid) {
                if codec.random_access {
                    let _ = reader.next();
                }
                continue;
            }

            let sym = reader.next();
            let op = OpCode::from_nibble(sym);
            let parent_slot = ((m >> 3) as usize) << slot_shift(inv_lod - 1);
            let label = match op {
                OpCode::Parent => cache[parent_slot],
                OpCode::NeighborX | OpCode::NeighborY | OpCode::NeighborZ => {
                    let step = match op {
                        OpCode::NeighborX => (1u32, 0u32, 0u32),
                        OpCode::NeighborY => (0, 1, 0),
                        _ => (0, 0, 1),
                    };
                    if pos.0 < step.0 || pos.1 < step.1 || pos.2 < step.2 {
                        // neighbor outside the brick: treat as parent
                        cache[parent_slot]
                    } else {
                        let q = morton_encode(pos.0 - step.0, pos.1 - step.1, pos.2 - step.2);
                        cache[(q as usize) << shift]
                    }
                }
                OpCode::PaletteAdv => {
                    let label = *palette
                        .get(cursor)
                        .ok_or_else(|| corrupt("palette advance past palette end"))?;
                    cursor += 1;
                    label
                }
                OpCode::PaletteLast => palette[cursor - 1],
                OpCode::PaletteDelta => {
                    let d = ops::read_palette_delta(|| reader.next(), codec.legacy_delta());
                    if d == 0 || d as usize > cursor {
                        return Err(corrupt("palette delta out of range"));
                    }
                    palette[cursor - d as usize]
                }
                OpCode::Filler => return Err(corrupt("filler operation on a valid cell")),
            };

            let slot = (m as usize) << shift;
            if codec.stop_bits() && inv_lod < finest && sym & STOP_FLAG != 0 {
                covered[m as usize] = true;
                cache[slot..slot + (1 << shift)].fill(label);
            } else {
                cache[slot] = label;
            }
        }
        prev_covered = covered;
    }

    // expand target-level cells over their Morton ranges
    if target_inv_lod < finest {
        let shift = slot_shift(target_inv_lod);
        for m in 0..1usize << (3 * target_inv_lod) {
            let slot = m << shift;
            let label = cache[slot];
            cache[slot..slot + (1 << shift)].fill(label);
        }
    }

    Ok(())
}
