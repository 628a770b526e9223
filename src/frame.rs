//! Audio frame descriptor exchanged with the media runtime.
//!
//! Frames are immutable inputs: the track processor copies plane-0 samples
//! into its own buffers and releases the frame. Only planar f32 mono is
//! accepted by the pipeline; everything else is rejected at the session
//! boundary.

use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    /// 32-bit float, planar layout.
    F32Planar,
}

/// A variable-length block of audio with a timestamp, as delivered by the
/// media runtime.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub format: SampleFormat,
    pub sample_rate_hz: u32,
    pub channels: u16,
    pub timestamp_us: i64,
    pub duration_us: i64,
    samples: Arc<[f32]>,
}

impl AudioFrame {
    /// Mono planar-f32 frame. Duration is derived from the sample count.
    pub fn new(sample_rate_hz: u32, timestamp_us: i64, samples: Vec<f32>) -> Self {
        Self::with_channels(sample_rate_hz, timestamp_us, 1, samples)
    }

    /// Frame with an explicit channel count. The sample slice holds plane 0
    /// regardless of channel count; per-frame sample count is per channel.
    pub fn with_channels(
        sample_rate_hz: u32,
        timestamp_us: i64,
        channels: u16,
        samples: Vec<f32>,
    ) -> Self {
        let duration_us = if sample_rate_hz == 0 {
            0
        } else {
            samples.len() as i64 * 1_000_000 / sample_rate_hz as i64
        };
        Self {
            format: SampleFormat::F32Planar,
            sample_rate_hz,
            channels,
            timestamp_us,
            duration_us,
            samples: samples.into(),
        }
    }

    /// Samples per channel.
    pub fn frame_count(&self) -> usize {
        self.samples.len()
    }

    /// Plane-0 samples.
    pub fn plane(&self) -> &[f32] {
        &self.samples
    }

    /// Copy plane-0 samples into a caller-owned buffer. Copies
    /// `min(dst.len(), frame_count)` samples and returns the count.
    pub fn copy_to(&self, dst: &mut [f32]) -> usize {
        let n = dst.len().min(self.samples.len());
        dst[..n].copy_from_slice(&self.samples[..n]);
        n
    }
}
