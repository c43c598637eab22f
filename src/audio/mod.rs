//! Frame-level audio primitives.
//!
//! Device buffers arrive in arbitrary sizes; everything downstream works on
//! fixed-size PCM frames. This module owns the re-slicing, the per-frame
//! feature computation and the WAV encoding of finished segments.

pub mod features;
pub mod frame;
pub mod wav;

pub use features::{analyze, FrameFeatures};
pub use frame::{FrameAssembler, PcmFrame};
