//! Compressed segmentation volume driver.
//!
//! Shards a labeled volume into bricks, compresses them brick-parallel in
//! chunks of the configured thread count, and appends the encodings to split
//! vectors so every brick stays addressable with 32 bit offsets. Decoding
//! runs the inverse path, either fully or up to a chosen level of detail.

use std::fmt;
use std::time::Instant;

use glam::UVec3;
use rayon::prelude::*;
use tracing::{debug, error, info, warn};

use segvox_core::morton::{morton_decode, morton_encode};
use segvox_core::volume::{
    brick_count, brick_index_count, brick_pos, valid_brick_size, voxel_count, voxel_index,
};
use segvox_core::{Error, Result};

use crate::encoder::{BrickEncoder, DecoderParams, EncodingMode};
use crate::ops::OpMask;

/// Progress callback, called with the completed fraction at most every ~2 s.
pub type ProgressFn = Box<dyn Fn(f32) + Send + Sync>;

const PROGRESS_INTERVAL_SECS: f64 = 2.0;

/// A lossless, brick-structured compression of a dense `u32` label volume.
pub struct CompressedSegmentationVolume {
    label: String,
    brick_size: u32,
    encoding_mode: EncodingMode,
    op_mask: OpMask,
    random_access: bool,
    encoder: Option<BrickEncoder>,

    volume_dim: UVec3,
    encodings: Vec<Vec<u32>>,
    brick_starts: Vec<u32>,
    /// First brick index of the second split vector; later vectors start at
    /// exact multiples. `u32::MAX` while everything fits into one vector.
    brick_idx_to_enc_vector: u32,
    detail_encodings: Vec<Vec<u32>>,
    detail_starts: Vec<u32>,
    separate_detail: bool,
    max_brick_palette_count: u32,

    target_words_per_split: u32,
    cpu_threads: usize,
    progress: Option<ProgressFn>,
}

impl Default for CompressedSegmentationVolume {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CompressedSegmentationVolume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompressedSegmentationVolume")
            .field("label", &self.label)
            .field("brick_size", &self.brick_size)
            .field("encoding_mode", &self.encoding_mode)
            .field("volume_dim", &self.volume_dim)
            .field("bricks", &self.brick_starts.len().saturating_sub(1))
            .field("split_vectors", &self.encodings.len())
            .field("separate_detail", &self.separate_detail)
            .finish_non_exhaustive()
    }
}

impl CompressedSegmentationVolume {
    /// An unconfigured, empty volume.
    pub fn new() -> Self {
        Self {
            label: String::from("csgv"),
            brick_size: 0,
            encoding_mode: EncodingMode::Nibble,
            op_mask: OpMask::ALL,
            random_access: false,
            encoder: None,
            volume_dim: UVec3::ZERO,
            encodings: Vec::new(),
            brick_starts: Vec::new(),
            brick_idx_to_enc_vector: u32::MAX,
            detail_encodings: Vec::new(),
            detail_starts: Vec::new(),
            separate_detail: false,
            max_brick_palette_count: 0,
            target_words_per_split: u32::MAX,
            cpu_threads: rayon::current_num_threads(),
            progress: None,
        }
    }

    /// Configure brick size, encoding mode, operation mask, and (for rANS)
    /// the frequency tables. Fails on illegal combinations; a previously
    /// compressed volume is cleared.
    pub fn set_compression_options(
        &mut self,
        brick_size: u32,
        encoding_mode: EncodingMode,
        op_mask: OpMask,
        random_access: bool,
        frequencies: Option<&[u32; 16]>,
        detail_frequencies: Option<&[u32; 16]>,
    ) -> Result<()> {
        if brick_size == 0 || !brick_size.is_power_of_two() {
            return Err(Error::ConfigInvalid(
                "brick size must be a power of two greater than zero".into(),
            ));
        }
        if !self.encodings.is_empty() {
            warn!("volume was already compressed, clearing old data on new configuration");
            self.clear();
        }
        self.encoder = Some(BrickEncoder::new(
            brick_size,
            encoding_mode,
            op_mask,
            random_access,
            frequencies,
            detail_frequencies,
        )?);
        self.brick_size = brick_size;
        self.encoding_mode = encoding_mode;
        self.op_mask = op_mask;
        self.random_access = random_access;
        Ok(())
    }

    /// Target number of `u32` words per split encoding vector.
    pub fn set_target_split_size(&mut self, words: u32) {
        self.target_words_per_split = words;
    }

    /// Number of bricks compressed or decompressed concurrently.
    pub fn set_cpu_threads(&mut self, threads: usize) {
        self.cpu_threads = threads.max(1);
    }

    /// Install a rate-limited progress callback.
    pub fn set_progress_callback(&mut self, callback: Option<ProgressFn>) {
        self.progress = callback;
    }

    /// Name used in log output.
    pub fn set_label(&mut self, label: impl Into<String>) {
        self.label = label.into();
    }

    /// Drop all compressed data, keeping the configuration.
    pub fn clear(&mut self) {
        self.volume_dim = UVec3::ZERO;
        self.encodings.clear();
        self.brick_starts.clear();
        self.brick_idx_to_enc_vector = u32::MAX;
        self.detail_encodings.clear();
        self.detail_starts.clear();
        self.separate_detail = false;
        self.max_brick_palette_count = 0;
        if let Some(encoder) = &mut self.encoder {
            encoder.set_separate_detail(false);
        }
    }

    // accessors ----------------------------------------------------------

    #[inline]
    pub fn brick_size(&self) -> u32 {
        self.brick_size
    }

    #[inline]
    pub fn encoding_mode(&self) -> EncodingMode {
        self.encoding_mode
    }

    #[inline]
    pub fn op_mask(&self) -> OpMask {
        self.op_mask
    }

    #[inline]
    pub fn random_access(&self) -> bool {
        self.random_access
    }

    #[inline]
    pub fn volume_dim(&self) -> UVec3 {
        self.volume_dim
    }

    #[inline]
    pub fn is_compressed(&self) -> bool {
        !self.encodings.is_empty()
    }

    #[inline]
    pub fn is_using_separate_detail(&self) -> bool {
        self.separate_detail
    }

    /// Largest palette length over all bricks, a sizing hint for decoders.
    #[inline]
    pub fn max_brick_palette_count(&self) -> u32 {
        self.max_brick_palette_count
    }

    /// Bricks per axis.
    #[inline]
    pub fn brick_count(&self) -> UVec3 {
        brick_count(self.volume_dim, self.brick_size)
    }

    /// Total number of bricks.
    #[inline]
    pub fn brick_index_count(&self) -> u32 {
        brick_index_count(self.volume_dim, self.brick_size)
    }

    /// Octree levels per brick.
    #[inline]
    pub fn lod_count_per_brick(&self) -> u32 {
        self.brick_size.trailing_zeros() + 1
    }

    /// Compressed payload size in bytes over all buffers.
    pub fn compressed_bytes(&self) -> usize {
        let words: usize = self.encodings.iter().map(Vec::len).sum::<usize>()
            + self.detail_encodings.iter().map(Vec::len).sum::<usize>()
            + self.brick_starts.len()
            + self.detail_starts.len();
        words * std::mem::size_of::<u32>()
    }

    /// Decode constants for an external (CPU or GPU) brick decoder.
    pub fn decoder_params(&self) -> Option<DecoderParams> {
        self.encoder.as_ref().map(BrickEncoder::decoder_params)
    }

    /// The normalized rANS frequency table, if rANS is configured.
    pub fn frequency_table(&self) -> Option<[u32; 16]> {
        self.encoder.as_ref().and_then(BrickEncoder::frequency_table)
    }

    /// The normalized detail frequency table, if double-table rANS is
    /// configured.
    pub fn detail_frequency_table(&self) -> Option<[u32; 16]> {
        self.encoder
            .as_ref()
            .and_then(BrickEncoder::detail_frequency_table)
    }

    pub(crate) fn split_vectors(&self) -> &[Vec<u32>] {
        &self.encodings
    }

    pub(crate) fn detail_split_vectors(&self) -> &[Vec<u32>] {
        &self.detail_encodings
    }

    pub(crate) fn brick_starts(&self) -> &[u32] {
        &self.brick_starts
    }

    pub(crate) fn detail_starts(&self) -> &[u32] {
        &self.detail_starts
    }

    pub(crate) fn brick_idx_to_enc_vector(&self) -> u32 {
        self.brick_idx_to_enc_vector
    }

    /// Adopt deserialized buffers as the compressed state.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn restore_compressed_state(
        &mut self,
        volume_dim: UVec3,
        brick_idx_to_enc_vector: u32,
        brick_starts: Vec<u32>,
        encodings: Vec<Vec<u32>>,
        separate_detail: bool,
        detail_starts: Vec<u32>,
        detail_encodings: Vec<Vec<u32>>,
        max_brick_palette_count: u32,
    ) {
        self.volume_dim = volume_dim;
        self.brick_idx_to_enc_vector = brick_idx_to_enc_vector;
        self.brick_starts = brick_starts;
        self.encodings = encodings;
        self.separate_detail = separate_detail;
        self.detail_starts = detail_starts;
        self.detail_encodings = detail_encodings;
        self.max_brick_palette_count = max_brick_palette_count;
        if let Some(encoder) = &mut self.encoder {
            encoder.set_separate_detail(separate_detail);
        }
    }

    /// Start offset of a brick within its split vector. The stored entry of
    /// a brick that opens a new split vector holds the previous vector's
    /// size instead of zero.
    #[inline]
    fn start_in_vector(starts: &[u32], b2e: u32, idx: u32) -> usize {
        if idx > 0 && idx % b2e == 0 {
            0
        } else {
            starts[idx as usize] as usize
        }
    }

    fn slice_of<'a>(vectors: &'a [Vec<u32>], starts: &[u32], b2e: u32, idx: u32) -> &'a [u32] {
        let start = Self::start_in_vector(starts, b2e, idx);
        let end = starts[idx as usize + 1] as usize;
        &vectors[(idx / b2e) as usize][start..end]
    }

    /// The encoding of one brick.
    #[inline]
    pub fn brick_encoding(&self, brick_idx: u32) -> &[u32] {
        Self::slice_of(
            &self.encodings,
            &self.brick_starts,
            self.brick_idx_to_enc_vector,
            brick_idx,
        )
    }

    /// The separated detail encoding of one brick.
    #[inline]
    pub fn brick_detail_encoding(&self, brick_idx: u32) -> &[u32] {
        Self::slice_of(
            &self.detail_encodings,
            &self.detail_starts,
            self.brick_idx_to_enc_vector,
            brick_idx,
        )
    }

    fn brick_valid_size(&self, brick: UVec3) -> UVec3 {
        valid_brick_size(brick, self.brick_size, self.volume_dim)
    }

    fn configured_encoder(&self) -> Result<&BrickEncoder> {
        self.encoder.as_ref().ok_or_else(|| {
            Error::ConfigInvalid("compression parameters are not initialized".into())
        })
    }

    fn compressed_encoder(&self) -> Result<&BrickEncoder> {
        if self.encodings.is_empty() {
            return Err(Error::ConfigInvalid(
                "segmentation volume is not yet compressed".into(),
            ));
        }
        self.configured_encoder()
    }

    // compression --------------------------------------------------------

    /// Compress a dense row-major label volume.
    pub fn compress(&mut self, volume: &[u32], volume_dim: UVec3) -> Result<()> {
        let encoder = self.encoder.take().ok_or_else(|| {
            Error::ConfigInvalid("compression parameters are not initialized".into())
        })?;
        let result = self.compress_impl(&encoder, volume, volume_dim);
        self.encoder = Some(encoder);
        if result.is_err() {
            self.clear();
        } else {
            debug_assert!(self.verify_compression(), "compression produced invalid encodings");
        }
        result
    }

    fn compress_impl(
        &mut self,
        encoder: &BrickEncoder,
        volume: &[u32],
        volume_dim: UVec3,
    ) -> Result<()> {
        if volume_dim.x == 0 || volume_dim.y == 0 || volume_dim.z == 0 {
            return Err(Error::InputShape("volume dimensions must be positive".into()));
        }
        if volume.len() != voxel_count(volume_dim) {
            return Err(Error::InputShape(format!(
                "volume length {} does not match dimensions {volume_dim}",
                volume.len()
            )));
        }

        self.clear();
        self.volume_dim = volume_dim;
        let counts = brick_count(volume_dim, self.brick_size);
        let brick_index_count = brick_index_count(volume_dim, self.brick_size);
        let chunk = self.cpu_threads.max(1) as u32;
        debug!(
            "compressing {} bricks ({} per axis) with brick size {}^3 in chunks of {chunk}",
            brick_index_count, counts, self.brick_size
        );

        // assume a compression rate well below one; a split vector never
        // reserves more than its target size
        let reserved = (voxel_count(volume_dim) / 48)
            .min(self.target_words_per_split as usize)
            .min(u32::MAX as usize);

        self.encodings.push(Vec::with_capacity(reserved));
        self.brick_starts = vec![0u32; brick_index_count as usize + 1];

        let total_timer = Instant::now();
        let mut progress_timer = Instant::now();
        let mut bricks_since_update = 0u64;

        let mut chunk_start = 0u32;
        while chunk_start < brick_index_count {
            let chunk_end = (chunk_start + chunk).min(brick_index_count);
            let results: Vec<Vec<u32>> = (chunk_start..chunk_end)
                .into_par_iter()
                .map(|brick_idx| {
                    let brick = brick_pos(brick_idx, counts);
                    let mut out = Vec::new();
                    encoder.encode_brick(volume, volume_dim, brick * self.brick_size, &mut out);
                    out
                })
                .collect();

            let added: usize = results.iter().map(Vec::len).sum();
            let mut old_len = self.encodings.last().expect("one vector exists").len();

            // all bricks of a chunk land in the same split vector because
            // split boundaries are multiples of the chunk size
            let last_new_brick = chunk_end - 1;
            if (u64::from(last_new_brick) / u64::from(self.brick_idx_to_enc_vector)) as usize
                >= self.encodings.len()
            {
                self.encodings.last_mut().expect("one vector exists").shrink_to_fit();
                self.encodings.push(Vec::with_capacity(reserved));
                old_len = 0;
            } else if old_len + added > self.target_words_per_split as usize {
                if chunk_start == 0 {
                    warn!("requested split encoding size is too small, using minimal size");
                } else if self.encodings.len() == 1 {
                    self.brick_idx_to_enc_vector = chunk_start;
                    self.encodings.last_mut().expect("one vector exists").shrink_to_fit();
                    self.encodings.push(Vec::with_capacity(reserved));
                    old_len = 0;
                } else {
                    warn!("brick index to encoding vector mapping underestimates sizes");
                }
            }

            let palette_size_index = encoder.palette_size_index() as usize;
            let current = self.encodings.last_mut().expect("one vector exists");
            let mut offset = old_len;
            for (i, encoded) in results.iter().enumerate() {
                self.brick_starts[(chunk_start as usize) + i] = offset as u32;
                current.extend_from_slice(encoded);
                offset += encoded.len();
                let palette_len = encoded[palette_size_index];
                if palette_len > self.max_brick_palette_count {
                    self.max_brick_palette_count = palette_len;
                }
            }

            // a split vector's first brick entry stores the previous
            // vector's size so start deltas still yield brick lengths
            if self.encodings.len() > 1 && old_len == 0 {
                let prev = self.encodings[self.encodings.len() - 2].len();
                self.brick_starts[chunk_start as usize] = prev as u32;
            }

            if self.encodings.last().expect("one vector exists").len() > u32::MAX as usize {
                return Err(Error::CapacityExceeded(
                    "compressed segmentation volume exceeds the 32 bit address space".into(),
                ));
            }

            bricks_since_update += u64::from(chunk_end - chunk_start);
            if progress_timer.elapsed().as_secs_f64() >= PROGRESS_INTERVAL_SECS {
                let fraction = f64::from(chunk_end) / f64::from(brick_index_count);
                let voxels_per_second = bricks_since_update as f64
                    * f64::from(self.brick_size).powi(3)
                    / progress_timer.elapsed().as_secs_f64();
                info!(
                    "{} compression progress {:.1}% ({:.2} million voxels/second)",
                    self.label,
                    fraction * 100.0,
                    voxels_per_second / 1e6
                );
                if let Some(callback) = &self.progress {
                    callback(fraction as f32);
                }
                progress_timer = Instant::now();
                bricks_since_update = 0;
            }

            chunk_start = chunk_end;
        }

        self.brick_starts[brick_index_count as usize] =
            self.encodings.last().expect("one vector exists").len() as u32;

        let seconds = total_timer.elapsed().as_secs_f64();
        info!(
            "{} compression finished in {seconds:.3}s ({:.2} million voxels/second), {} bytes compressed",
            self.label,
            volume.len() as f64 / seconds / 1e6,
            self.compressed_bytes()
        );
        if let Some(callback) = &self.progress {
            callback(1.0);
        }
        Ok(())
    }

    // decompression ------------------------------------------------------

    /// Decompress the full volume into `out` (resized to fit).
    pub fn decompress(&self, out: &mut Vec<u32>) -> Result<()> {
        self.decompress_lod(0, out)
    }

    /// Decompress up to a level of detail; `target_lod` counts up from the
    /// finest level (0), coarser levels replicate each cell's representative
    /// label over its block.
    pub fn decompress_lod(&self, target_lod: u32, out: &mut Vec<u32>) -> Result<()> {
        let encoder = self.compressed_encoder()?;
        let lod_count = self.lod_count_per_brick();
        if target_lod >= lod_count {
            return Err(Error::ConfigInvalid(format!(
                "target LoD {target_lod} out of range for {lod_count} levels"
            )));
        }
        let inv_lod = lod_count - 1 - target_lod;
        let dim = self.volume_dim;
        out.clear();
        out.resize(voxel_count(dim), 0);

        let counts = self.brick_count();
        let n = self.brick_index_count();
        let chunk = self.cpu_threads.max(1) as u32;
        let brick_voxels = (self.brick_size * self.brick_size * self.brick_size) as usize;

        let mut chunk_start = 0u32;
        while chunk_start < n {
            let chunk_end = (chunk_start + chunk).min(n);
            let caches: Vec<(u32, Vec<u32>)> = (chunk_start..chunk_end)
                .into_par_iter()
                .map(|brick_idx| {
                    let brick = brick_pos(brick_idx, counts);
                    let mut cache = vec![0u32; brick_voxels];
                    let detail = self
                        .separate_detail
                        .then(|| self.brick_detail_encoding(brick_idx));
                    encoder.decode_brick(
                        self.brick_encoding(brick_idx),
                        detail,
                        &mut cache,
                        self.brick_valid_size(brick),
                        inv_lod,
                    )?;
                    Ok((brick_idx, cache))
                })
                .collect::<Result<_>>()?;

            for (brick_idx, cache) in &caches {
                let origin = brick_pos(*brick_idx, counts) * self.brick_size;
                for (i, &label) in cache.iter().enumerate() {
                    let (x, y, z) = morton_decode(i as u32);
                    let pos = origin + UVec3::new(x, y, z);
                    if pos.x < dim.x && pos.y < dim.y && pos.z < dim.z {
                        out[voxel_index(pos, dim)] = label;
                    }
                }
            }
            chunk_start = chunk_end;
        }
        Ok(())
    }

    /// Decode a single brick into `out_brick` (`brick_size³` labels,
    /// row-major brick-local order) down to `inverse_lod`.
    pub fn decompress_brick_to(
        &self,
        out_brick: &mut [u32],
        brick: UVec3,
        inverse_lod: u32,
    ) -> Result<()> {
        let encoder = self.compressed_encoder()?;
        let b = self.brick_size;
        let brick_voxels = (b * b * b) as usize;
        if out_brick.len() != brick_voxels {
            return Err(Error::InputShape(format!(
                "output brick must hold {brick_voxels} voxels"
            )));
        }
        let counts = self.brick_count();
        if brick.x >= counts.x || brick.y >= counts.y || brick.z >= counts.z {
            return Err(Error::InputShape(format!(
                "brick {brick} outside the {counts} brick grid"
            )));
        }
        let brick_idx = segvox_core::volume::brick_index(brick, counts);
        let mut cache = vec![0u32; brick_voxels];
        let detail = self
            .separate_detail
            .then(|| self.brick_detail_encoding(brick_idx));
        encoder.decode_brick(
            self.brick_encoding(brick_idx),
            detail,
            &mut cache,
            self.brick_valid_size(brick),
            inverse_lod,
        )?;
        for (i, &label) in cache.iter().enumerate() {
            let (x, y, z) = morton_decode(i as u32);
            out_brick[(x + b * (y + b * z)) as usize] = label;
        }
        Ok(())
    }

    /// Decode one cell of a brick without decoding the rest of it. Only
    /// available for random-access encodings; `cell_index` is row-major
    /// within the `(2^inverse_lod)³` cell grid of the brick.
    pub fn decode_voxel(&self, brick_idx: u32, inverse_lod: u32, cell_index: u32) -> Result<u32> {
        let encoder = self.compressed_encoder()?;
        if brick_idx >= self.brick_index_count() || inverse_lod >= self.lod_count_per_brick() {
            return Err(Error::ConfigInvalid(
                "brick index or level out of range".into(),
            ));
        }
        let cells_per_axis = 1u32 << inverse_lod;
        if cell_index >= cells_per_axis * cells_per_axis * cells_per_axis {
            return Err(Error::ConfigInvalid(
                "cell index out of range for the requested level".into(),
            ));
        }
        let x = cell_index % cells_per_axis;
        let y = (cell_index / cells_per_axis) % cells_per_axis;
        let z = cell_index / (cells_per_axis * cells_per_axis);
        encoder.decode_cell(
            self.brick_encoding(brick_idx),
            inverse_lod,
            morton_encode(x, y, z),
        )
    }

    // detail separation --------------------------------------------------

    /// Move every brick's finest-level stream into separate detail buffers.
    /// One-shot; returns the ratio of detail to total encoding size.
    pub fn separate_detail(&mut self) -> Result<f32> {
        if self.random_access {
            return Err(Error::ConfigInvalid(
                "detail separation and random access cannot be combined".into(),
            ));
        }
        if self.separate_detail || !self.detail_encodings.is_empty() {
            return Err(Error::ConfigInvalid(
                "detail separation was already performed".into(),
            ));
        }
        if self.encodings.is_empty() {
            return Err(Error::ConfigInvalid(
                "segmentation volume is not yet compressed".into(),
            ));
        }
        if self.encoding_mode != EncodingMode::RansDouble {
            return Err(Error::ConfigInvalid(
                "detail separation requires rANS in double table mode".into(),
            ));
        }

        let n = self.brick_index_count();
        let b2e = self.brick_idx_to_enc_vector;
        let lod_count = self.lod_count_per_brick() as usize;
        let old_header = lod_count + 1;

        // per-brick detail lengths and original spans before anything moves
        let encoder = self.configured_encoder()?;
        let mut detail_lens = vec![0u32; n as usize];
        for (i, len) in detail_lens.iter_mut().enumerate() {
            *len = encoder.detail_length_before_separation(self.brick_encoding(i as u32))?;
        }
        let old_spans: Vec<(usize, usize)> = (0..n)
            .map(|i| {
                let start = Self::start_in_vector(&self.brick_starts, b2e, i);
                (start, self.brick_encoding(i).len())
            })
            .collect();

        // detail starts follow the same split convention as brick starts
        let mut split_sizes = vec![0u32];
        let mut cursor = 0u32;
        let mut detail_starts = vec![0u32; n as usize + 1];
        for i in 0..n as usize {
            detail_starts[i] = cursor;
            if i / b2e as usize >= split_sizes.len() {
                *split_sizes.last_mut().expect("one size") = cursor;
                split_sizes.push(0);
                cursor = 0;
            }
            cursor += detail_lens[i];
        }
        *split_sizes.last_mut().expect("one size") = cursor;
        detail_starts[n as usize] = cursor;

        // cut every brick apart, compacting base encodings in place
        let mut detail_encodings: Vec<Vec<u32>> = vec![vec![0u32; split_sizes[0] as usize]];
        let mut scratch: Vec<u32> = Vec::new();
        let mut write_cursor = 0usize;
        let mut detail_cursor = 0usize;
        self.brick_starts[0] = 0;
        for i in 0..n as usize {
            let vec_idx = i / b2e as usize;
            if vec_idx >= detail_encodings.len() {
                detail_encodings.push(vec![0u32; split_sizes[vec_idx] as usize]);
                self.encodings[vec_idx - 1].truncate(write_cursor);
                self.brick_starts[i] = write_cursor as u32;
                write_cursor = 0;
                detail_cursor = 0;
            }

            let (old_start, old_len) = old_spans[i];
            let base_vec = &mut self.encodings[vec_idx];
            scratch.clear();
            scratch.extend_from_slice(&base_vec[old_start..old_start + old_len]);

            let palette_size = scratch[lod_count] as usize;
            let base_ops = (scratch[lod_count - 1] / 8) as usize - old_header;
            let detail_len = detail_lens[i] as usize;
            debug_assert_eq!(old_header + base_ops + detail_len + palette_size, old_len);

            detail_encodings[vec_idx][detail_cursor..detail_cursor + detail_len]
                .copy_from_slice(&scratch[old_header + base_ops..old_header + base_ops + detail_len]);
            detail_cursor += detail_len;

            // the header loses the detail start word, level offsets shift by
            // one word of nibbles
            let new_header = lod_count;
            let w = write_cursor;
            for lod in 0..lod_count - 1 {
                base_vec[w + lod] = scratch[lod] - 8;
            }
            base_vec[w + lod_count - 1] = palette_size as u32;
            base_vec[w + new_header..w + new_header + base_ops]
                .copy_from_slice(&scratch[old_header..old_header + base_ops]);
            base_vec[w + new_header + base_ops..w + new_header + base_ops + palette_size]
                .copy_from_slice(&scratch[old_header + base_ops + detail_len..old_len]);

            write_cursor += old_len - detail_len - 1;
            self.brick_starts[i + 1] = write_cursor as u32;
        }
        self.encodings
            .last_mut()
            .expect("one vector exists")
            .truncate(write_cursor);

        self.detail_starts = detail_starts;
        self.detail_encodings = detail_encodings;
        self.separate_detail = true;
        self.encoder
            .as_mut()
            .expect("encoder checked above")
            .set_separate_detail(true);

        if !self.verify_compression() {
            self.clear();
            return Err(Error::VerificationFailed(
                "corrupt compressed segmentation volume after detail separation".into(),
            ));
        }

        let detail_words: usize = self.detail_encodings.iter().map(Vec::len).sum();
        let base_words: usize = self.encodings.iter().map(Vec::len).sum();
        Ok(detail_words as f32 / (base_words + detail_words) as f32)
    }

    // verification -------------------------------------------------------

    /// Structural verification: split vector sizes, brick start conventions,
    /// per-brick headers, and a bounds-checked decode of every brick.
    pub fn verify_compression(&self) -> bool {
        let Ok(encoder) = self.compressed_encoder() else {
            error!("cannot verify: volume is not compressed or not configured");
            return false;
        };
        if voxel_count(self.volume_dim) == 0 {
            error!("volume size is zero with voxel dimension {}", self.volume_dim);
            return false;
        }

        let n = self.brick_index_count();
        let b2e = self.brick_idx_to_enc_vector;
        for (v, encoding) in self.encodings.iter().enumerate() {
            let last = (u64::from(n)).min((v as u64 + 1) * u64::from(b2e)) as usize;
            let expected = self.brick_starts[last] as usize;
            if encoding.len() != expected {
                error!(
                    "split encoding vector {v} size {} differs from brick starts ({expected})",
                    encoding.len()
                );
                return false;
            }
        }
        if self.separate_detail {
            if self.detail_starts.len() != self.brick_starts.len() {
                error!("brick starts and detail starts must have equal size");
                return false;
            }
            for (v, encoding) in self.detail_encodings.iter().enumerate() {
                let last = (u64::from(n)).min((v as u64 + 1) * u64::from(b2e)) as usize;
                let expected = self.detail_starts[last] as usize;
                if encoding.len() != expected {
                    error!(
                        "split detail vector {v} size {} differs from detail starts ({expected})",
                        encoding.len()
                    );
                    return false;
                }
            }
        }

        let counts = self.brick_count();
        (0..n).into_par_iter().all(|brick_idx| {
            let brick = brick_pos(brick_idx, counts);
            if brick_idx > 0 && self.brick_starts[brick_idx as usize + 1] == 0 {
                error!("brick start array contains an invalid zero after the first entry");
                return false;
            }
            let detail = self
                .separate_detail
                .then(|| self.brick_detail_encoding(brick_idx));
            match encoder.verify_brick(
                self.brick_encoding(brick_idx),
                detail,
                self.brick_valid_size(brick),
            ) {
                Ok(()) => true,
                Err(err) => {
                    error!("brick {brick} (#{brick_idx}) failed verification: {err}");
                    false
                }
            }
        })
    }

    /// Round-trip verification against the source volume: decodes the finest
    /// level and compares every voxel.
    pub fn verify_against(&self, volume: &[u32], volume_dim: UVec3) -> bool {
        if volume_dim != self.volume_dim || volume.len() != voxel_count(volume_dim) {
            error!("source volume shape does not match the compressed volume");
            return false;
        }
        let mut decoded = Vec::new();
        if let Err(err) = self.decompress(&mut decoded) {
            error!("decompression failed during verification: {err}");
            return false;
        }
        let mut errors = 0usize;
        for (i, (&a, &b)) in volume.iter().zip(&decoded).enumerate() {
            if a != b {
                errors += 1;
                if errors <= 8 {
                    error!("mismatch at voxel {i}: source {a} != decoded {b}");
                } else if errors == 9 {
                    error!("[...] skipping additional mismatches");
                }
            }
        }
        errors == 0
    }

    // frequency prepass --------------------------------------------------

    /// Count operation symbol frequencies over a subsampled brick grid, the
    /// training pass for the rANS tables. Returns base symbol counts in
    /// `0..16` and finest-level counts in `16..32` (when `detail_freq`).
    pub fn compress_for_frequency_table(
        &mut self,
        volume: &[u32],
        volume_dim: UVec3,
        subsampling: u32,
        detail_freq: bool,
    ) -> Result<[u64; 32]> {
        if self.brick_size == 0 {
            self.brick_size = 32;
        }
        if volume.len() != voxel_count(volume_dim) {
            return Err(Error::InputShape(format!(
                "volume length {} does not match dimensions {volume_dim}",
                volume.len()
            )));
        }
        let subsampling = subsampling.max(1);

        // the prepass always runs over the plain 4 bit walk
        let encoder = BrickEncoder::new(
            self.brick_size,
            EncodingMode::Nibble,
            self.op_mask,
            self.random_access,
            None,
            None,
        )?;

        let counts = brick_count(volume_dim, self.brick_size);
        let mut sampled = Vec::new();
        let mut z = 0;
        while z < counts.z {
            let mut y = 0;
            while y < counts.y {
                let mut x = 0;
                while x < counts.x {
                    sampled.push(UVec3::new(x, y, z));
                    x += subsampling;
                }
                y += subsampling;
            }
            z += subsampling;
        }

        let timer = Instant::now();
        let mut freq = [0u64; 32];
        let chunk = (self.cpu_threads.max(1) * 8).max(1);
        let mut progress_timer = Instant::now();
        for (chunk_idx, bricks) in sampled.chunks(chunk).enumerate() {
            let partial = bricks
                .par_iter()
                .fold(
                    || [0u64; 32],
                    |mut acc, &brick| {
                        encoder.freq_encode_brick(
                            volume,
                            volume_dim,
                            brick * self.brick_size,
                            detail_freq,
                            &mut acc,
                        );
                        acc
                    },
                )
                .reduce(
                    || [0u64; 32],
                    |mut a, b| {
                        for (x, y) in a.iter_mut().zip(b) {
                            *x += y;
                        }
                        a
                    },
                );
            for (x, y) in freq.iter_mut().zip(partial) {
                *x += y;
            }
            if progress_timer.elapsed().as_secs_f64() >= PROGRESS_INTERVAL_SECS {
                info!(
                    "{} frequency prepass progress {:.1}%",
                    self.label,
                    (chunk_idx + 1) as f64 * chunk as f64 / sampled.len() as f64 * 100.0
                );
                progress_timer = Instant::now();
            }
        }

        // scale up for the skipped bricks
        let scale = u64::from(subsampling).pow(3);
        for f in &mut freq {
            *f *= scale;
        }

        // symbols the mask makes possible must not drop to zero frequency
        // just because the subsampled scan missed them
        if subsampling > 1 {
            let mut patched = Vec::new();
            for op in 0..8u32 {
                for (slot, possible) in [
                    (op, BrickEncoder::symbol_possible(self.op_mask, op)),
                    (op + 8, BrickEncoder::symbol_possible(self.op_mask, op + 8)),
                    (
                        op + 16,
                        detail_freq && BrickEncoder::symbol_possible(self.op_mask, op),
                    ),
                    (
                        op + 24,
                        detail_freq && self.op_mask.contains(OpMask::PALETTE_DELTA),
                    ),
                ] {
                    if possible && freq[slot as usize] == 0 {
                        freq[slot as usize] = 1;
                        patched.push(slot);
                    }
                }
            }
            if !patched.is_empty() {
                debug!(
                    "raised symbol frequencies {patched:?} from 0 to 1 to cover prepass subsampling"
                );
            }
        }

        info!(
            "{} frequency prepass finished in {:.3}s over {} bricks",
            self.label,
            timer.elapsed().as_secs_f64(),
            sampled.len()
        );
        Ok(freq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multigrid::Multigrid;
    use crate::rans::counts_to_table;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn dense(dim: UVec3, f: impl Fn(u32, u32, u32) -> u32) -> Vec<u32> {
        let mut v = vec![0u32; voxel_count(dim)];
        for z in 0..dim.z {
            for y in 0..dim.y {
                for x in 0..dim.x {
                    v[voxel_index(UVec3::new(x, y, z), dim)] = f(x, y, z);
                }
            }
        }
        v
    }

    fn nibble_volume(brick_size: u32) -> CompressedSegmentationVolume {
        let mut csgv = CompressedSegmentationVolume::new();
        csgv.set_compression_options(
            brick_size,
            EncodingMode::Nibble,
            OpMask::ALL,
            false,
            None,
            None,
        )
        .unwrap();
        csgv
    }

    fn rans_tables(
        csgv: &mut CompressedSegmentationVolume,
        volume: &[u32],
        dim: UVec3,
        detail: bool,
    ) -> ([u32; 16], [u32; 16]) {
        let freq = csgv
            .compress_for_frequency_table(volume, dim, 1, detail)
            .unwrap();
        let base: [u64; 16] = freq[..16].try_into().unwrap();
        let fine: [u64; 16] = freq[16..].try_into().unwrap();
        (counts_to_table(&base), counts_to_table(&fine))
    }

    #[test]
    fn uniform_volume_single_brick() {
        let dim = UVec3::splat(4);
        let volume = dense(dim, |_, _, _| 0x2a);
        let mut csgv = nibble_volume(4);
        csgv.compress(&volume, dim).unwrap();

        assert_eq!(csgv.brick_index_count(), 1);
        // header (lod_count + 1), one word of ops, one palette word
        let encoding = csgv.brick_encoding(0);
        assert_eq!(encoding.len(), 4 + 1 + 1);
        assert_eq!(*encoding.last().unwrap(), 0x2a);
        assert_eq!(csgv.max_brick_palette_count(), 1);

        assert!(csgv.verify_compression());
        assert!(csgv.verify_against(&volume, dim));
    }

    #[test]
    fn two_label_plane() {
        let dim = UVec3::splat(2);
        let volume = vec![1, 1, 1, 1, 2, 2, 2, 2];
        let mut csgv = nibble_volume(2);
        csgv.compress(&volume, dim).unwrap();

        let encoding = csgv.brick_encoding(0);
        assert_eq!(&encoding[encoding.len() - 2..], &[1, 2]);

        let mut out = Vec::new();
        csgv.decompress(&mut out).unwrap();
        assert_eq!(out, volume);

        // the root representative is its first child's label
        csgv.decompress_lod(1, &mut out).unwrap();
        assert_eq!(out, vec![1; 8]);
    }

    #[test]
    fn x_stripes() {
        let dim = UVec3::new(4, 1, 1);
        let volume = vec![7, 7, 8, 8];
        let mut csgv = nibble_volume(4);
        csgv.compress(&volume, dim).unwrap();

        let encoding = csgv.brick_encoding(0);
        assert_eq!(&encoding[encoding.len() - 2..], &[7, 8]);
        assert!(csgv.verify_against(&volume, dim));
    }

    #[test]
    fn multi_brick_roundtrip_with_borders() {
        let dim = UVec3::new(9, 5, 3);
        let mut rng = StdRng::seed_from_u64(7);
        let volume: Vec<u32> = (0..voxel_count(dim)).map(|_| rng.gen_range(0..9)).collect();
        let mut csgv = nibble_volume(4);
        csgv.compress(&volume, dim).unwrap();

        assert_eq!(csgv.brick_count(), UVec3::new(3, 2, 1));
        assert!(csgv.verify_compression());
        assert!(csgv.verify_against(&volume, dim));
    }

    #[test]
    fn lod_decode_matches_multigrid() {
        let dim = UVec3::new(8, 4, 4);
        let volume = dense(dim, |x, y, z| (x / 2 + y * 3 + z) % 5);
        let mut csgv = nibble_volume(4);
        csgv.compress(&volume, dim).unwrap();

        let counts = csgv.brick_count();
        let mut out = Vec::new();
        for target_lod in 0..csgv.lod_count_per_brick() {
            csgv.decompress_lod(target_lod, &mut out).unwrap();
            let inv_lod = csgv.lod_count_per_brick() - 1 - target_lod;
            let width = csgv.brick_size() >> inv_lod;
            let cells_per_axis = 1u32 << inv_lod;
            for bz in 0..counts.z {
                for by in 0..counts.y {
                    for bx in 0..counts.x {
                        let brick = UVec3::new(bx, by, bz);
                        let grid =
                            Multigrid::build(&volume, dim, brick * csgv.brick_size(), 4, true);
                        for z in 0..4u32 {
                            for y in 0..4u32 {
                                for x in 0..4u32 {
                                    let pos = brick * 4 + UVec3::new(x, y, z);
                                    if pos.x >= dim.x || pos.y >= dim.y || pos.z >= dim.z {
                                        continue;
                                    }
                                    let cell = (x / width)
                                        + cells_per_axis * ((y / width) + cells_per_axis * (z / width));
                                    let expected = grid.node(inv_lod, cell as usize).label;
                                    assert_eq!(
                                        out[voxel_index(pos, dim)],
                                        expected,
                                        "lod {target_lod} voxel {pos}"
                                    );
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn rans_single_table_two_pass() {
        let dim = UVec3::splat(16);
        let volume = dense(dim, |x, y, z| (x / 3 + y / 2 + z) % 6);
        let mut csgv = nibble_volume(8);
        let (base, _) = rans_tables(&mut csgv, &volume, dim, false);
        csgv.set_compression_options(
            8,
            EncodingMode::RansSingle,
            OpMask::ALL,
            false,
            Some(&base),
            None,
        )
        .unwrap();
        csgv.compress(&volume, dim).unwrap();
        assert!(csgv.verify_compression());
        assert!(csgv.verify_against(&volume, dim));
    }

    #[test]
    fn rans_double_table_two_pass() {
        let dim = UVec3::splat(16);
        let volume = dense(dim, |x, y, z| (x + y / 2 + z / 3) % 7);
        let mut csgv = nibble_volume(8);
        let (base, detail) = rans_tables(&mut csgv, &volume, dim, true);
        csgv.set_compression_options(
            8,
            EncodingMode::RansDouble,
            OpMask::ALL,
            false,
            Some(&base),
            Some(&detail),
        )
        .unwrap();
        csgv.compress(&volume, dim).unwrap();
        assert!(csgv.verify_compression());
        assert!(csgv.verify_against(&volume, dim));
    }

    #[test]
    fn detail_separation_roundtrip() {
        let dim = UVec3::splat(20);
        let volume = dense(dim, |x, y, z| (x / 2 + y + z) % 5);
        let mut csgv = nibble_volume(16);
        let (base, detail) = rans_tables(&mut csgv, &volume, dim, true);
        csgv.set_compression_options(
            16,
            EncodingMode::RansDouble,
            OpMask::ALL,
            false,
            Some(&base),
            Some(&detail),
        )
        .unwrap();
        csgv.compress(&volume, dim).unwrap();

        let mut before = Vec::new();
        csgv.decompress(&mut before).unwrap();

        let ratio = csgv.separate_detail().unwrap();
        assert!(ratio > 0.0 && ratio < 1.0, "ratio {ratio}");
        assert!(csgv.is_using_separate_detail());
        assert!(csgv.verify_compression());

        let mut after = Vec::new();
        csgv.decompress(&mut after).unwrap();
        assert_eq!(before, after);
        assert!(csgv.verify_against(&volume, dim));

        // one-shot
        assert!(matches!(
            csgv.separate_detail(),
            Err(Error::ConfigInvalid(_))
        ));
    }

    #[test]
    fn split_boundary_invariants() {
        let dim = UVec3::new(16, 4, 4);
        let volume = dense(dim, |x, y, z| ((x * 7 + y * 3 + z * 5) % 11) + 100 * (x / 4));
        let mut csgv = nibble_volume(4);
        csgv.set_cpu_threads(2);
        csgv.set_target_split_size(64);
        csgv.compress(&volume, dim).unwrap();

        let b2e = csgv.brick_idx_to_enc_vector();
        assert_ne!(b2e, u32::MAX, "expected a split vector boundary");
        assert_eq!(b2e % 2, 0, "splits happen at chunk boundaries");

        let starts = csgv.brick_starts();
        let split = b2e as usize;
        // the boundary entry stores the previous vector's size
        assert_eq!(starts[split] as usize, csgv.split_vectors()[0].len());
        assert!(starts[split + 1] < starts[split]);
        assert_eq!(csgv.brick_encoding(b2e).len(), starts[split + 1] as usize);
        for i in 0..starts.len() - 1 {
            if i != split {
                assert!(starts[i + 1] >= starts[i], "monotone outside the boundary");
            }
        }

        assert!(csgv.verify_compression());
        assert!(csgv.verify_against(&volume, dim));
    }

    #[test]
    fn random_access_voxel_parity() {
        let dim = UVec3::new(13, 9, 17);
        let volume = dense(dim, |x, y, z| 1 + (x / 2 + y * 2 + z) % 6);
        let mut csgv = CompressedSegmentationVolume::new();
        csgv.set_compression_options(
            8,
            EncodingMode::Nibble,
            OpMask::RANDOM_ACCESS,
            true,
            None,
            None,
        )
        .unwrap();
        csgv.compress(&volume, dim).unwrap();
        assert!(csgv.verify_against(&volume, dim));

        let counts = csgv.brick_count();
        let n = csgv.brick_index_count();
        let b = csgv.brick_size();
        let mut rng = StdRng::seed_from_u64(99);
        let mut checked = 0;
        let mut out_brick = vec![0u32; (b * b * b) as usize];
        while checked < 100 {
            let brick_idx = rng.gen_range(0..n);
            let inv_lod = rng.gen_range(0..csgv.lod_count_per_brick());
            let cells_per_axis = 1u32 << inv_lod;
            let cell = rng.gen_range(0..cells_per_axis.pow(3));
            let width = b >> inv_lod;
            let cx = cell % cells_per_axis;
            let cy = (cell / cells_per_axis) % cells_per_axis;
            let cz = cell / (cells_per_axis * cells_per_axis);
            let brick = brick_pos(brick_idx, counts);
            let valid = valid_brick_size(brick, b, dim);
            if cx * width >= valid.x || cy * width >= valid.y || cz * width >= valid.z {
                continue;
            }

            let via_voxel = csgv.decode_voxel(brick_idx, inv_lod, cell).unwrap();
            csgv.decompress_brick_to(&mut out_brick, brick, inv_lod).unwrap();
            let corner = (cx * width) + b * ((cy * width) + b * (cz * width));
            assert_eq!(via_voxel, out_brick[corner as usize]);
            checked += 1;
        }
    }

    #[test]
    fn prepass_counts_cover_possible_symbols() {
        let dim = UVec3::splat(16);
        let volume = dense(dim, |x, y, z| (x + y + z) % 3);
        let mut csgv = nibble_volume(8);
        // subsampled scan with patching
        let freq = csgv
            .compress_for_frequency_table(&volume, dim, 2, true)
            .unwrap();
        for op in [0u32, 1, 2, 3, 4, 5, 6] {
            assert!(freq[op as usize] > 0, "base symbol {op} missing");
            assert!(freq[op as usize + 16] > 0, "detail symbol {op} missing");
        }
    }

    #[test]
    fn error_paths() {
        let dim = UVec3::splat(4);
        let volume = dense(dim, |_, _, _| 1);

        let mut unconfigured = CompressedSegmentationVolume::new();
        assert!(matches!(
            unconfigured.compress(&volume, dim),
            Err(Error::ConfigInvalid(_))
        ));

        let mut csgv = nibble_volume(4);
        assert!(matches!(
            csgv.compress(&volume[1..], dim),
            Err(Error::InputShape(_))
        ));
        assert!(!csgv.is_compressed());
        assert!(matches!(
            csgv.compress(&volume, UVec3::new(4, 4, 0)),
            Err(Error::InputShape(_))
        ));

        csgv.compress(&volume, dim).unwrap();
        let mut out = Vec::new();
        assert!(matches!(
            csgv.decompress_lod(3, &mut out),
            Err(Error::ConfigInvalid(_))
        ));
        assert!(matches!(
            csgv.separate_detail(),
            Err(Error::ConfigInvalid(_))
        ));
        assert!(matches!(
            csgv.decode_voxel(0, 2, 0),
            Err(Error::ConfigInvalid(_))
        ));
    }

    #[test]
    fn clear_resets_compressed_state() {
        let dim = UVec3::splat(4);
        let volume = dense(dim, |x, _, _| x);
        let mut csgv = nibble_volume(4);
        csgv.compress(&volume, dim).unwrap();
        assert!(csgv.is_compressed());

        csgv.clear();
        assert!(!csgv.is_compressed());
        assert_eq!(csgv.volume_dim(), UVec3::ZERO);

        csgv.compress(&volume, dim).unwrap();
        assert!(csgv.verify_against(&volume, dim));
    }

    #[test]
    fn reconfiguring_clears_old_data() {
        let dim = UVec3::splat(4);
        let volume = dense(dim, |x, y, _| x + y);
        let mut csgv = nibble_volume(4);
        csgv.compress(&volume, dim).unwrap();
        csgv.set_compression_options(4, EncodingMode::Nibble, OpMask::ALL, false, None, None)
            .unwrap();
        assert!(!csgv.is_compressed());
    }
}
