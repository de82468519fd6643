//! Brick encoders: encoding modes, dispatch, and decoder parameters.

pub mod nibble;
pub mod range_ans;
mod serial;

use glam::UVec3;
use segvox_core::{Error, Result};

use crate::ops::{OpCode, OpMask};
pub use nibble::NibbleEncoder;
pub use range_ans::RangeAnsEncoder;

/// How brick operation streams are stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum EncodingMode {
    /// Plain 4 bit nibbles.
    Nibble = 0,
    /// rANS entropy coding with one frequency table.
    RansSingle = 1,
    /// rANS entropy coding with a second table for the finest level.
    RansDouble = 2,
    /// Wavelet matrix backbone (format-compatible, not constructible here).
    WaveletMatrix = 3,
    /// Huffman-shaped wavelet matrix (format-compatible, not constructible here).
    HuffmanWm = 4,
}

impl EncodingMode {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Nibble),
            1 => Some(Self::RansSingle),
            2 => Some(Self::RansDouble),
            3 => Some(Self::WaveletMatrix),
            4 => Some(Self::HuffmanWm),
            _ => None,
        }
    }

    #[inline]
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    #[inline]
    pub fn is_rans(self) -> bool {
        matches!(self, Self::RansSingle | Self::RansDouble)
    }
}

/// A configured brick encoder/decoder pair.
pub enum BrickEncoder {
    Nibble(NibbleEncoder),
    RangeAns(RangeAnsEncoder),
}

impl BrickEncoder {
    /// Validate the option combination and build the encoder.
    pub fn new(
        brick_size: u32,
        mode: EncodingMode,
        op_mask: OpMask,
        random_access: bool,
        frequencies: Option<&[u32; 16]>,
        detail_frequencies: Option<&[u32; 16]>,
    ) -> Result<Self> {
        if !op_mask.contains(OpMask::PALETTE_ADV) {
            return Err(Error::ConfigInvalid(
                "the palette advance operation cannot be disabled".into(),
            ));
        }
        match mode {
            EncodingMode::Nibble => {
                if random_access && op_mask.contains(OpMask::PALETTE_DELTA) {
                    return Err(Error::ConfigInvalid(
                        "random access encoding does not support the palette delta operation".into(),
                    ));
                }
                if random_access && op_mask.contains(OpMask::STOP_BIT) {
                    return Err(Error::ConfigInvalid(
                        "random access encoding does not support stop bits".into(),
                    ));
                }
                Ok(Self::Nibble(NibbleEncoder::new(brick_size, op_mask, random_access)))
            }
            EncodingMode::RansSingle | EncodingMode::RansDouble => {
                if random_access {
                    return Err(Error::ConfigInvalid(
                        "random access encoding is not compatible with rANS".into(),
                    ));
                }
                let frequencies = frequencies.ok_or_else(|| {
                    Error::ConfigInvalid("operation frequencies must be given for rANS".into())
                })?;
                let detail = if mode == EncodingMode::RansDouble {
                    Some(detail_frequencies.ok_or_else(|| {
                        Error::ConfigInvalid(
                            "detail operation frequencies must be given for double table rANS"
                                .into(),
                        )
                    })?)
                } else {
                    None
                };
                Ok(Self::RangeAns(RangeAnsEncoder::new(
                    brick_size, op_mask, frequencies, detail,
                )))
            }
            EncodingMode::WaveletMatrix | EncodingMode::HuffmanWm => Err(Error::ConfigInvalid(
                "no brick encoder is available for wavelet matrix encoding modes".into(),
            )),
        }
    }

    /// The encoding mode this encoder realizes.
    pub fn mode(&self) -> EncodingMode {
        match self {
            Self::Nibble(_) => EncodingMode::Nibble,
            Self::RangeAns(e) if e.double_table() => EncodingMode::RansDouble,
            Self::RangeAns(_) => EncodingMode::RansSingle,
        }
    }

    fn codec(&self) -> &serial::SerialCodec {
        match self {
            Self::Nibble(e) => e.codec(),
            Self::RangeAns(e) => e.codec(),
        }
    }

    /// Number of octree levels per brick.
    #[inline]
    pub fn lod_count(&self) -> u32 {
        self.codec().lod_count()
    }

    /// Brick header size in words.
    #[inline]
    pub fn header_size(&self) -> u32 {
        self.codec().header_size()
    }

    /// Header word holding the palette length.
    #[inline]
    pub fn palette_size_index(&self) -> u32 {
        self.codec().palette_size_index()
    }

    /// Switch decoding to separated-detail brick layouts.
    pub fn set_separate_detail(&mut self, on: bool) {
        match self {
            Self::Nibble(_) => debug_assert!(!on, "nibble bricks are never separated"),
            Self::RangeAns(e) => e.set_separate_detail(on),
        }
    }

    /// Encode one brick into `out` (cleared first).
    pub fn encode_brick(&self, volume: &[u32], volume_dim: UVec3, brick_start: UVec3, out: &mut Vec<u32>) {
        match self {
            Self::Nibble(e) => e.encode_brick(volume, volume_dim, brick_start, out),
            Self::RangeAns(e) => e.encode_brick(volume, volume_dim, brick_start, out),
        }
    }

    /// Decode one brick into the Morton-ordered `cache` down to
    /// `target_inv_lod`.
    pub fn decode_brick(
        &self,
        encoding: &[u32],
        detail_encoding: Option<&[u32]>,
        cache: &mut [u32],
        valid: UVec3,
        target_inv_lod: u32,
    ) -> Result<()> {
        match self {
            Self::Nibble(e) => e.decode_brick(encoding, cache, valid, target_inv_lod),
            Self::RangeAns(e) => {
                e.decode_brick(encoding, detail_encoding, cache, valid, target_inv_lod)
            }
        }
    }

    /// Decode a single cell (random access encodings only).
    pub fn decode_cell(&self, encoding: &[u32], target_inv_lod: u32, cell: u32) -> Result<u32> {
        match self {
            Self::Nibble(e) if e.codec().random_access => {
                e.decode_cell(encoding, target_inv_lod, cell)
            }
            _ => Err(Error::ConfigInvalid(
                "single voxel decoding requires a random access encoding".into(),
            )),
        }
    }

    /// Count operation symbol frequencies of one brick into `acc`: base
    /// levels at 0..16, the finest level at 16..32 when `detail_freq` is set.
    pub fn freq_encode_brick(
        &self,
        volume: &[u32],
        volume_dim: UVec3,
        brick_start: UVec3,
        detail_freq: bool,
        acc: &mut [u64; 32],
    ) {
        let codec = self.codec();
        let enc = serial::encode_brick_symbols(codec, volume, volume_dim, brick_start);
        let detail_from = if detail_freq {
            enc.level_starts[codec.finest_lod() as usize] as usize
        } else {
            enc.symbols.len()
        };
        for (i, &s) in enc.symbols.iter().enumerate() {
            let offset = if i >= detail_from { 16 } else { 0 };
            acc[offset + s as usize] += 1;
        }
    }

    /// Words the brick's finest level will occupy after detail separation.
    pub fn detail_length_before_separation(&self, encoding: &[u32]) -> Result<u32> {
        match self {
            Self::RangeAns(e) if e.double_table() => Ok(e.detail_length_before_separation(encoding)),
            _ => Err(Error::ConfigInvalid(
                "detail separation requires double table rANS".into(),
            )),
        }
    }

    /// Structural check of one brick: header well-formedness plus a full
    /// decode with all palette references bounds-checked.
    pub fn verify_brick(
        &self,
        encoding: &[u32],
        detail_encoding: Option<&[u32]>,
        valid: UVec3,
    ) -> Result<()> {
        let codec = self.codec();
        let header_size = codec.header_size() as usize;
        if encoding.len() < header_size + 1 {
            return Err(Error::VerificationFailed(
                "brick encoding shorter than its header".into(),
            ));
        }
        let offsets = header_size - 1;
        for lod in 0..offsets {
            let end = encoding[lod];
            if lod > 0 && end < encoding[lod - 1] {
                return Err(Error::VerificationFailed(
                    "brick header level offsets are not monotone".into(),
                ));
            }
            if end < header_size as u32 * 8 || (end as usize).div_ceil(8) > encoding.len() {
                return Err(Error::VerificationFailed(
                    "brick header level offset out of range".into(),
                ));
            }
        }
        let palette_size = encoding[codec.palette_size_index() as usize] as usize;
        if palette_size == 0 || header_size + palette_size > encoding.len() {
            return Err(Error::VerificationFailed(
                "brick palette size out of range".into(),
            ));
        }
        let b = codec.brick_size;
        let mut cache = vec![0u32; (b * b * b) as usize];
        self.decode_brick(encoding, detail_encoding, &mut cache, valid, codec.finest_lod())
    }

    /// The normalized rANS frequency table, if this encoder uses one.
    pub fn frequency_table(&self) -> Option<[u32; 16]> {
        match self {
            Self::Nibble(_) => None,
            Self::RangeAns(e) => Some(e.frequency_table()),
        }
    }

    /// The normalized detail frequency table (double-table rANS).
    pub fn detail_frequency_table(&self) -> Option<[u32; 16]> {
        match self {
            Self::Nibble(_) => None,
            Self::RangeAns(e) => e.detail_frequency_table(),
        }
    }

    /// Constants a decoding backend (CPU or GPU) needs to interpret brick
    /// encodings produced by this encoder.
    pub fn decoder_params(&self) -> DecoderParams {
        let codec = self.codec();
        let (rans_symbols, detail_rans_symbols) = match self {
            Self::Nibble(_) => (None, None),
            Self::RangeAns(e) => (
                Some(e.rans().symbol_triples()),
                e.detail_rans().map(crate::rans::Rans::symbol_triples),
            ),
        };
        DecoderParams {
            brick_size: codec.brick_size,
            lod_count: codec.lod_count(),
            header_size: codec.header_size(),
            palette_size_index: codec.palette_size_index(),
            encoding_mode: self.mode(),
            op_mask: codec.op_mask.bits(),
            random_access: codec.random_access,
            separate_detail: codec.separate_detail,
            rans_symbols,
            detail_rans_symbols,
        }
    }

    /// True iff the mask makes the base-level symbol value possible, used to
    /// patch subsampled frequency tables.
    pub(crate) fn symbol_possible(op_mask: OpMask, symbol: u32) -> bool {
        let delta = op_mask.contains(OpMask::PALETTE_DELTA);
        let op_enabled = match OpCode::from_nibble(symbol) {
            OpCode::PaletteAdv => true,
            op @ (OpCode::Parent
            | OpCode::NeighborX
            | OpCode::NeighborY
            | OpCode::NeighborZ
            | OpCode::PaletteLast
            | OpCode::PaletteDelta) => op_mask.allows_op(op),
            OpCode::Filler => false,
        };
        if symbol < 8 {
            // plain op nibble, or any delta payload nibble
            op_enabled || delta
        } else {
            // op with stop bit, or a delta continuation nibble
            (op_enabled && op_mask.contains(OpMask::STOP_BIT)) || delta
        }
    }
}

/// Backend-agnostic constants for decoding bricks of one volume.
#[derive(Clone, Debug)]
pub struct DecoderParams {
    pub brick_size: u32,
    pub lod_count: u32,
    pub header_size: u32,
    pub palette_size_index: u32,
    pub encoding_mode: EncodingMode,
    pub op_mask: u32,
    pub random_access: bool,
    pub separate_detail: bool,
    /// `(start, freq, cum)` per symbol plus a scale sentinel.
    pub rans_symbols: Option<[[u32; 3]; 17]>,
    pub detail_rans_symbols: Option<[[u32; 3]; 17]>,
}
