//! Range-ANS backed brick encoder.
//!
//! The operation nibbles of a brick are entropy coded instead of stored
//! directly. Single-table mode packs all levels into one stream behind the
//! header. Double-table mode keeps the finest level in a second stream coded
//! with its own frequency table; the second stream's start is recorded in the
//! last level offset of the header, which is also what detail separation
//! later cuts at. Random access inside a brick is not possible.

use glam::UVec3;
use segvox_core::{Error, Result};

use super::nibble::brick_palette;
use super::serial::{self, DetailSource, SerialCodec, SymbolReader};
use crate::ops::OpMask;
use crate::rans::Rans;

pub struct RangeAnsEncoder {
    codec: SerialCodec,
    rans: Rans,
    detail_rans: Option<Rans>,
}

impl RangeAnsEncoder {
    pub(crate) fn new(
        brick_size: u32,
        op_mask: OpMask,
        frequencies: &[u32; 16],
        detail_frequencies: Option<&[u32; 16]>,
    ) -> Self {
        Self {
            codec: SerialCodec {
                brick_size,
                op_mask,
                random_access: false,
                separate_detail: false,
            },
            rans: Rans::from_frequencies(frequencies),
            detail_rans: detail_frequencies.map(Rans::from_frequencies),
        }
    }

    #[inline]
    pub(crate) fn codec(&self) -> &SerialCodec {
        &self.codec
    }

    #[inline]
    pub(crate) fn set_separate_detail(&mut self, on: bool) {
        self.codec.separate_detail = on;
    }

    #[inline]
    pub fn double_table(&self) -> bool {
        self.detail_rans.is_some()
    }

    /// The normalized base frequency table.
    pub fn frequency_table(&self) -> [u32; 16] {
        self.rans.frequencies()
    }

    /// The normalized detail frequency table (double-table mode).
    pub fn detail_frequency_table(&self) -> Option<[u32; 16]> {
        self.detail_rans.as_ref().map(Rans::frequencies)
    }

    pub(crate) fn rans(&self) -> &Rans {
        &self.rans
    }

    pub(crate) fn detail_rans(&self) -> Option<&Rans> {
        self.detail_rans.as_ref()
    }

    /// Encode one brick into `out` (cleared first): header, packed rANS
    /// stream(s), palette.
    pub fn encode_brick(&self, volume: &[u32], volume_dim: UVec3, brick_start: UVec3, out: &mut Vec<u32>) {
        debug_assert!(!self.codec.separate_detail, "encode happens before separation");
        let enc = serial::encode_brick_symbols(&self.codec, volume, volume_dim, brick_start);
        let header_size = self.codec.header_size();
        let lod_count = self.codec.lod_count() as usize;

        out.clear();
        if let Some(detail_rans) = &self.detail_rans {
            let split = enc.level_starts[lod_count - 1] as usize;
            let base = self.rans.encode_to_words(&enc.symbols[..split]);
            // the state-only stream of an empty detail level is omitted
            let detail = if split < enc.symbols.len() {
                detail_rans.encode_to_words(&enc.symbols[split..])
            } else {
                Vec::new()
            };
            for _ in 0..lod_count - 1 {
                out.push(header_size * 8);
            }
            out.push((header_size + base.len() as u32) * 8);
            out.push(enc.palette.len() as u32);
            out.extend_from_slice(&base);
            out.extend_from_slice(&detail);
        } else {
            let stream = self.rans.encode_to_words(&enc.symbols);
            for _ in 0..lod_count {
                out.push(header_size * 8);
            }
            out.push(enc.palette.len() as u32);
            out.extend_from_slice(&stream);
        }
        out.extend_from_slice(&enc.palette);
    }

    /// Decode one brick into the Morton-ordered `cache`.
    pub fn decode_brick(
        &self,
        encoding: &[u32],
        detail_encoding: Option<&[u32]>,
        cache: &mut [u32],
        valid: UVec3,
        target_inv_lod: u32,
    ) -> Result<()> {
        let palette = brick_palette(&self.codec, encoding)?;
        let base = SymbolReader::rans(&self.rans, encoding, self.codec.header_size() * 4);
        let detail = match (&self.detail_rans, self.codec.separate_detail) {
            (Some(rans), true) => Some(DetailSource::Separate {
                rans,
                words: detail_encoding.ok_or_else(|| {
                    Error::VerificationFailed("missing detail encoding for separated brick".into())
                })?,
            }),
            (Some(rans), false) => {
                let detail_word = encoding[self.codec.lod_count() as usize - 1] / 8;
                Some(DetailSource::Inline {
                    rans,
                    words: encoding,
                    start_byte: detail_word * 4,
                })
            }
            (None, _) => None,
        };
        serial::decode_brick_cells(&self.codec, base, detail, palette, cache, valid, target_inv_lod)
    }

    /// Words the brick's finest level will occupy in the detail buffer after
    /// separation. Only meaningful in double-table mode before separation.
    pub fn detail_length_before_separation(&self, encoding: &[u32]) -> u32 {
        debug_assert!(self.double_table() && !self.codec.separate_detail);
        let palette_size = encoding[self.codec.palette_size_index() as usize];
        let header_and_base = encoding[self.codec.lod_count() as usize - 1] / 8;
        encoding.len() as u32 - header_and_base - palette_size
    }
}
