//! Signal-processing building blocks shared by the pipeline stages.

pub mod math;
pub mod vad_gain;

pub use vad_gain::{VadGainConfig, VadGainController, VadGainUpdate};
