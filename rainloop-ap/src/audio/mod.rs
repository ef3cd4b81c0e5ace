//! Audio decoding, resampling and device output

pub mod decoder;
pub mod output;
pub mod resampler;
pub mod types;

pub use types::{AudioFrame, PcmBuffer};
