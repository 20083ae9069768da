//! Per-file stage transforms.
//!
//! Every stage applies exactly one transform to each input file. The
//! processor never inspects file contents itself.

use anyhow::Result;

pub mod feedback;
#[cfg(test)]
pub mod fixtures;
pub mod workbook;

pub use feedback::{Depth, FeedbackFill, FeedbackSettings};

/// Bytes in, bytes out, for one file.
pub trait Transform {
    fn apply(&mut self, input: &[u8], filename: &str) -> Result<Vec<u8>>;
}

/// Identity copy.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThrough;

impl Transform for PassThrough {
    fn apply(&mut self, input: &[u8], _filename: &str) -> Result<Vec<u8>> {
        Ok(input.to_vec())
    }
}
