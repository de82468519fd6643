//! Compressed Segmentation Volume (CSGV) encoder/decoder.
//!
//! A CSGV losslessly compresses a dense volume of categorical `u32` labels by
//! sharding it into cubic bricks, building a per-brick octree of labels, and
//! describing that octree coarse-to-fine with a stream of 4 bit operation
//! codes plus a per-brick label palette. The operation stream can optionally
//! be entropy coded with a range-ANS coder, the finest level of detail can be
//! split into its own buffer, and bricks can be decoded independently either
//! fully or up to a chosen level of detail.

pub mod csgv;
pub mod encoder;
pub mod format;
pub mod multigrid;
pub mod ops;
pub mod palette;
pub mod rans;

pub use csgv::{CompressedSegmentationVolume, ProgressFn};
pub use encoder::{BrickEncoder, DecoderParams, EncodingMode};
pub use multigrid::{Multigrid, MultigridNode};
pub use ops::{OpCode, OpMask};
pub use rans::{counts_to_table, Rans};
pub use segvox_core::{Error, Result};
