//! Core types and index math for the segvox compression engine.
//!
//! This crate provides the foundation shared by the segvox crates:
//! - Error types
//! - Morton (z-order) curve math used for octree traversal
//! - Volume and brick index arithmetic

pub mod error;
pub mod morton;
pub mod volume;

pub use error::{Error, Result};
