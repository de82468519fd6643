//! Versioned on-disk container for compressed segmentation volumes.
//!
//! Layout (all integers little-endian, sizes as u64):
//!
//! ```text
//! "CMPSGVOL"            8 byte magic
//! version               4 ASCII digits, currently "0016"
//! brick_size            u32
//! volume_dim            3 x u32
//! encoding_mode         u32
//! random_access         u8
//! max_brick_palette     u32
//! op_mask               u32
//! <encoder specific>    rANS: one or two 16 x u32 frequency tables
//! brick_idx_to_vector   u32
//! brick_starts          u64 length + u32 data
//! split vectors         u64 count, then per vector u64 length + u32 data
//! separate_detail       u8
//! <detail buffers>      same shape as brick starts + split vectors
//! ```
//!
//! Version "0015" files are accepted; they carry the legacy palette delta
//! payload, signalled to the decoder through the operation mask.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use glam::UVec3;
use tracing::{debug, warn};

use segvox_core::{Error, Result};

use crate::csgv::CompressedSegmentationVolume;
use crate::encoder::EncodingMode;
use crate::ops::OpMask;

const MAGIC: &[u8; 8] = b"CMPSGVOL";
const VERSION: &[u8; 4] = b"0016";
const VERSION_LEGACY_DELTA: &[u8; 4] = b"0015";

fn write_u32(out: &mut impl Write, value: u32) -> Result<()> {
    out.write_all(&value.to_le_bytes())?;
    Ok(())
}

fn write_u64(out: &mut impl Write, value: u64) -> Result<()> {
    out.write_all(&value.to_le_bytes())?;
    Ok(())
}

fn write_words(out: &mut impl Write, words: &[u32]) -> Result<()> {
    out.write_all(bytemuck::cast_slice(words))?;
    Ok(())
}

fn short_read(err: &std::io::Error, what: &str) -> Error {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::FormatMismatch(format!("unexpected end of file while reading {what}"))
    } else {
        Error::FormatMismatch(format!("read error while reading {what}: {err}"))
    }
}

fn read_u32(input: &mut impl Read, what: &str) -> Result<u32> {
    let mut buf = [0u8; 4];
    input.read_exact(&mut buf).map_err(|e| short_read(&e, what))?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(input: &mut impl Read, what: &str) -> Result<u64> {
    let mut buf = [0u8; 8];
    input.read_exact(&mut buf).map_err(|e| short_read(&e, what))?;
    Ok(u64::from_le_bytes(buf))
}

fn read_u8(input: &mut impl Read, what: &str) -> Result<u8> {
    let mut buf = [0u8; 1];
    input.read_exact(&mut buf).map_err(|e| short_read(&e, what))?;
    Ok(buf[0])
}

fn read_words(input: &mut impl Read, len: u64, what: &str) -> Result<Vec<u32>> {
    let len = usize::try_from(len)
        .map_err(|_| Error::FormatMismatch(format!("length prefix of {what} overflows")))?;
    let mut words = vec![0u32; len];
    input
        .read_exact(bytemuck::cast_slice_mut(&mut words))
        .map_err(|e| short_read(&e, what))?;
    Ok(words)
}

fn read_table(input: &mut impl Read, what: &str) -> Result<[u32; 16]> {
    let mut table = [0u32; 16];
    input
        .read_exact(bytemuck::cast_slice_mut(&mut table))
        .map_err(|e| short_read(&e, what))?;
    Ok(table)
}

fn read_starts(input: &mut impl Read, what: &str) -> Result<Vec<u32>> {
    let len = read_u64(input, what)?;
    read_words(input, len, what)
}

fn read_split_vectors(input: &mut impl Read, what: &str) -> Result<Vec<Vec<u32>>> {
    let count = read_u64(input, what)?;
    let count = usize::try_from(count)
        .map_err(|_| Error::FormatMismatch(format!("vector count of {what} overflows")))?;
    let mut vectors = Vec::with_capacity(count.min(1 << 16));
    for _ in 0..count {
        let len = read_u64(input, what)?;
        vectors.push(read_words(input, len, what)?);
    }
    Ok(vectors)
}

impl CompressedSegmentationVolume {
    /// Write the compressed volume to a new file, creating parent
    /// directories. An existing target path is refused so that no partial
    /// or mixed state ever replaces previous exports.
    pub fn export_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if !self.is_compressed() {
            return Err(Error::ConfigInvalid(
                "compression was not yet computed, call compress first".into(),
            ));
        }
        if path.exists() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("export target {} already exists", path.display()),
            )));
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut out = BufWriter::new(File::create(path)?);
        out.write_all(MAGIC)?;
        out.write_all(VERSION)?;

        write_u32(&mut out, self.brick_size())?;
        let dim = self.volume_dim();
        write_u32(&mut out, dim.x)?;
        write_u32(&mut out, dim.y)?;
        write_u32(&mut out, dim.z)?;
        write_u32(&mut out, self.encoding_mode().as_u32())?;
        out.write_all(&[u8::from(self.random_access())])?;
        write_u32(&mut out, self.max_brick_palette_count())?;
        write_u32(&mut out, self.op_mask().bits())?;

        if let Some(table) = self.frequency_table() {
            write_words(&mut out, &table)?;
        }
        if let Some(table) = self.detail_frequency_table() {
            write_words(&mut out, &table)?;
        }

        write_u32(&mut out, self.brick_idx_to_enc_vector())?;
        write_u64(&mut out, self.brick_starts().len() as u64)?;
        write_words(&mut out, self.brick_starts())?;
        write_u64(&mut out, self.split_vectors().len() as u64)?;
        for vector in self.split_vectors() {
            write_u64(&mut out, vector.len() as u64)?;
            write_words(&mut out, vector)?;
        }

        out.write_all(&[u8::from(self.is_using_separate_detail())])?;
        if self.is_using_separate_detail() {
            write_u64(&mut out, self.detail_starts().len() as u64)?;
            write_words(&mut out, self.detail_starts())?;
            write_u64(&mut out, self.detail_split_vectors().len() as u64)?;
            for vector in self.detail_split_vectors() {
                write_u64(&mut out, vector.len() as u64)?;
                write_words(&mut out, vector)?;
            }
        }
        out.flush()?;
        debug!("exported compressed segmentation volume to {}", path.display());
        Ok(())
    }

    /// Read a compressed volume from a file. With `verify` the structural
    /// verification pass runs after loading and failure is an error.
    pub fn import_from_file(path: impl AsRef<Path>, verify: bool) -> Result<Self> {
        let path = path.as_ref();
        let mut input = BufReader::new(File::open(path)?);

        let mut magic = [0u8; 8];
        input
            .read_exact(&mut magic)
            .map_err(|e| short_read(&e, "magic header"))?;
        if &magic != MAGIC {
            return Err(Error::FormatMismatch(format!(
                "{} is not a compressed segmentation volume export (bad magic)",
                path.display()
            )));
        }
        let mut version = [0u8; 4];
        input
            .read_exact(&mut version)
            .map_err(|e| short_read(&e, "version"))?;
        let legacy = &version == VERSION_LEGACY_DELTA;
        if &version != VERSION && !legacy {
            return Err(Error::FormatMismatch(format!(
                "unsupported compressed segmentation volume version {:?}",
                String::from_utf8_lossy(&version)
            )));
        }

        let brick_size = read_u32(&mut input, "brick size")?;
        if brick_size == 0 || !brick_size.is_power_of_two() {
            return Err(Error::FormatMismatch(format!(
                "brick size {brick_size} is not a power of two"
            )));
        }
        let volume_dim = UVec3::new(
            read_u32(&mut input, "volume dimension")?,
            read_u32(&mut input, "volume dimension")?,
            read_u32(&mut input, "volume dimension")?,
        );
        let mode_raw = read_u32(&mut input, "encoding mode")?;
        let encoding_mode = EncodingMode::from_u32(mode_raw)
            .ok_or_else(|| Error::FormatMismatch(format!("unknown encoding mode {mode_raw}")))?;
        let random_access = read_u8(&mut input, "random access flag")? != 0;
        let max_brick_palette_count = read_u32(&mut input, "max palette size")?;
        let mask_raw = read_u32(&mut input, "operation mask")?;
        let mut op_mask = OpMask::from_bits(mask_raw)
            .ok_or_else(|| Error::FormatMismatch(format!("unknown operation mask {mask_raw:#x}")))?;
        if legacy {
            // the palette delta payload changed after version "0015"
            op_mask |= OpMask::USE_OLD_PAL_DELTA;
        }

        let frequencies = if encoding_mode.is_rans() {
            Some(read_table(&mut input, "frequency table")?)
        } else {
            None
        };
        let detail_frequencies = if encoding_mode == EncodingMode::RansDouble {
            Some(read_table(&mut input, "detail frequency table")?)
        } else {
            None
        };

        let mut volume = Self::new();
        volume.set_compression_options(
            brick_size,
            encoding_mode,
            op_mask,
            random_access,
            frequencies.as_ref(),
            detail_frequencies.as_ref(),
        )?;
        if let Some(stem) = path.file_stem() {
            volume.set_label(stem.to_string_lossy());
        }

        let brick_idx_to_enc_vector = read_u32(&mut input, "brick to vector mapping")?;
        let brick_starts = read_starts(&mut input, "brick starts")?;
        let encodings = read_split_vectors(&mut input, "split encoding vectors")?;
        let separate_detail = read_u8(&mut input, "separate detail flag")? != 0;
        if separate_detail && encoding_mode != EncodingMode::RansDouble {
            return Err(Error::FormatMismatch(
                "separated detail buffers require double table rANS".into(),
            ));
        }
        let (detail_starts, detail_encodings) = if separate_detail {
            let starts = read_starts(&mut input, "detail starts")?;
            if starts.len() != brick_starts.len() {
                return Err(Error::FormatMismatch(
                    "brick starts and detail starts must have equal size".into(),
                ));
            }
            (starts, read_split_vectors(&mut input, "split detail vectors")?)
        } else {
            (Vec::new(), Vec::new())
        };

        let expected_bricks =
            segvox_core::volume::brick_index_count(volume_dim, brick_size) as usize + 1;
        if brick_starts.len() != expected_bricks {
            return Err(Error::FormatMismatch(format!(
                "brick starts length {} does not match {} bricks",
                brick_starts.len(),
                expected_bricks - 1
            )));
        }

        let mut trailing = [0u8; 1];
        if input.read(&mut trailing).unwrap_or(0) != 0 {
            warn!("ignoring trailing bytes after compressed segmentation volume import");
        }

        volume.restore_compressed_state(
            volume_dim,
            brick_idx_to_enc_vector,
            brick_starts,
            encodings,
            separate_detail,
            detail_starts,
            detail_encodings,
            max_brick_palette_count,
        );
        debug!(
            "imported compressed segmentation volume from {} with {} voxels in {} bricks",
            path.display(),
            segvox_core::volume::voxel_count(volume_dim),
            volume.brick_index_count()
        );

        if verify && !volume.verify_compression() {
            return Err(Error::VerificationFailed(format!(
                "verification of {} failed after import",
                path.display()
            )));
        }
        Ok(volume)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rans::counts_to_table;
    use segvox_core::volume::{voxel_count, voxel_index};

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

    fn compressed_nibble(volume: &[u32], dim: UVec3) -> CompressedSegmentationVolume {
        let mut csgv = CompressedSegmentationVolume::new();
        csgv.set_compression_options(4, EncodingMode::Nibble, OpMask::ALL, false, None, None)
            .unwrap();
        csgv.compress(volume, dim).unwrap();
        csgv
    }

    #[test]
    fn nibble_roundtrip_through_file() {
        let dim = UVec3::new(9, 6, 4);
        let volume = dense(dim, |x, y, z| (x + y * 2 + z) % 7);
        let csgv = compressed_nibble(&volume, dim);

        let dir = tempfile::tempdir().unwrap();
        // parent directories are created on demand
        let path = dir.path().join("exports/nested/volume.csgv");
        csgv.export_to_file(&path).unwrap();

        let imported = CompressedSegmentationVolume::import_from_file(&path, true).unwrap();
        assert_eq!(imported.brick_size(), csgv.brick_size());
        assert_eq!(imported.volume_dim(), csgv.volume_dim());
        assert_eq!(imported.encoding_mode(), csgv.encoding_mode());
        assert_eq!(imported.op_mask(), csgv.op_mask());
        assert_eq!(imported.random_access(), csgv.random_access());
        assert_eq!(imported.max_brick_palette_count(), csgv.max_brick_palette_count());
        assert_eq!(imported.brick_starts(), csgv.brick_starts());
        assert_eq!(imported.split_vectors(), csgv.split_vectors());
        assert!(imported.verify_against(&volume, dim));
    }

    #[test]
    fn separated_rans_roundtrip_through_file() {
        let dim = UVec3::splat(8);
        let volume = dense(dim, |x, y, z| (x / 2 + y + z) % 4);
        let mut csgv = CompressedSegmentationVolume::new();
        csgv.set_compression_options(8, EncodingMode::Nibble, OpMask::ALL, false, None, None)
            .unwrap();
        let freq = csgv
            .compress_for_frequency_table(&volume, dim, 1, true)
            .unwrap();
        let base = counts_to_table(&freq[..16].try_into().unwrap());
        let detail = counts_to_table(&freq[16..].try_into().unwrap());
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
        csgv.separate_detail().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("volume.csgv");
        csgv.export_to_file(&path).unwrap();

        let imported = CompressedSegmentationVolume::import_from_file(&path, true).unwrap();
        assert!(imported.is_using_separate_detail());
        assert_eq!(imported.frequency_table(), csgv.frequency_table());
        assert_eq!(imported.detail_frequency_table(), csgv.detail_frequency_table());
        assert_eq!(imported.detail_starts(), csgv.detail_starts());
        assert_eq!(imported.detail_split_vectors(), csgv.detail_split_vectors());
        assert!(imported.verify_against(&volume, dim));
    }

    #[test]
    fn existing_target_is_refused() {
        let dim = UVec3::splat(4);
        let volume = dense(dim, |_, _, _| 3);
        let csgv = compressed_nibble(&volume, dim);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("volume.csgv");
        csgv.export_to_file(&path).unwrap();
        assert!(matches!(csgv.export_to_file(&path), Err(Error::Io(_))));
    }

    #[test]
    fn exporting_uncompressed_fails() {
        let csgv = CompressedSegmentationVolume::new();
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            csgv.export_to_file(dir.path().join("volume.csgv")),
            Err(Error::ConfigInvalid(_))
        ));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not_a_volume.csgv");
        std::fs::write(&path, b"NOTAVOLUMEATALL!").unwrap();
        assert!(matches!(
            CompressedSegmentationVolume::import_from_file(&path, false),
            Err(Error::FormatMismatch(_))
        ));
    }

    #[test]
    fn unknown_version_is_rejected() {
        let dim = UVec3::splat(4);
        let volume = dense(dim, |_, _, _| 3);
        let csgv = compressed_nibble(&volume, dim);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("volume.csgv");
        csgv.export_to_file(&path).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[8..12].copy_from_slice(b"0099");
        std::fs::write(&path, &bytes).unwrap();
        assert!(matches!(
            CompressedSegmentationVolume::import_from_file(&path, false),
            Err(Error::FormatMismatch(_))
        ));
    }

    #[test]
    fn legacy_version_sets_the_delta_compat_bit() {
        // a uniform volume encodes without palette deltas, so the legacy
        // payload interpretation cannot change its decoding
        let dim = UVec3::splat(4);
        let volume = dense(dim, |_, _, _| 5);
        let csgv = compressed_nibble(&volume, dim);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("volume.csgv");
        csgv.export_to_file(&path).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[8..12].copy_from_slice(b"0015");
        std::fs::write(&path, &bytes).unwrap();

        let imported = CompressedSegmentationVolume::import_from_file(&path, true).unwrap();
        assert!(imported.op_mask().contains(OpMask::USE_OLD_PAL_DELTA));
        assert!(imported.verify_against(&volume, dim));
    }

    #[test]
    fn truncated_file_is_rejected() {
        let dim = UVec3::splat(4);
        let volume = dense(dim, |x, _, _| x);
        let csgv = compressed_nibble(&volume, dim);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("volume.csgv");
        csgv.export_to_file(&path).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();
        assert!(matches!(
            CompressedSegmentationVolume::import_from_file(&path, false),
            Err(Error::FormatMismatch(_))
        ));
    }

    #[test]
    fn trailing_bytes_still_load() {
        let dim = UVec3::splat(4);
        let volume = dense(dim, |x, y, _| x * y);
        let csgv = compressed_nibble(&volume, dim);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("volume.csgv");
        csgv.export_to_file(&path).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        bytes.push(0xab);
        std::fs::write(&path, &bytes).unwrap();
        let imported = CompressedSegmentationVolume::import_from_file(&path, true).unwrap();
        assert!(imported.verify_against(&volume, dim));
    }
}
