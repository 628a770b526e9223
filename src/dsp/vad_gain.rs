//! VAD-driven gain controller.
//!
//! Turns a stream of per-frame VAD probabilities into a smoothly varying
//! per-sample gain that is click-free at frame boundaries. The controller
//! combines:
//!
//! - asymmetric VAD smoothing (fast attack on speech onsets, slow release),
//! - a hangover window that holds the gate open after the last detected
//!   speech so word tails are not clipped,
//! - a cubic ease-out fade through the back of the hangover,
//! - asymmetric gain smoothing toward the target.
//!
//! The gain never falls below `min_gate_gain`: this is a gate that ducks
//! residual noise, not a mute.

use serde::{Deserialize, Serialize};

use crate::dsp::math::{lerp, soft_clip};

/// Default blend ratio for `apply_gain_with_blend`: how much of the
/// unprocessed signal is mixed back in during attenuation to preserve room
/// character.
pub const DEFAULT_BLEND_RATIO: f32 = 0.1;

/// Configuration scalars. Never mutated during processing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VadGainConfig {
    /// VAD release smoothing factor.
    pub vad_smoothing: f32,
    /// Smoothed-VAD level treated as confident speech.
    pub vad_threshold: f32,
    /// Hangover length in frames after speech drops below the threshold.
    pub hangover_frames: u32,
    /// Gate floor. The gain never goes below this.
    pub min_gate_gain: f32,
    /// Smoothing factor for rising values (VAD and gain).
    pub attack_smoothing: f32,
    /// Smoothing factor for falling gain.
    pub release_smoothing: f32,
    /// Fraction of the hangover to hold at unity before fading.
    pub hangover_fade_start: f32,
}

impl Default for VadGainConfig {
    fn default() -> Self {
        Self {
            vad_smoothing: 0.08,
            vad_threshold: 0.30,
            hangover_frames: 45,
            min_gate_gain: 0.15,
            attack_smoothing: 0.15,
            release_smoothing: 0.03,
            hangover_fade_start: 0.6,
        }
    }
}

/// Partial configuration update: named scalars replace, the rest stay.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct VadGainUpdate {
    pub vad_smoothing: Option<f32>,
    pub vad_threshold: Option<f32>,
    pub hangover_frames: Option<u32>,
    pub min_gate_gain: Option<f32>,
    pub attack_smoothing: Option<f32>,
    pub release_smoothing: Option<f32>,
    pub hangover_fade_start: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct VadGainController {
    config: VadGainConfig,
    smoothed_vad: f32,
    hangover_remaining: u32,
    previous_gain: f32,
    target_gain: f32,
}

impl VadGainController {
    pub fn new(config: VadGainConfig) -> Self {
        Self {
            config,
            smoothed_vad: 0.0,
            hangover_remaining: 0,
            previous_gain: 1.0,
            target_gain: 1.0,
        }
    }

    pub fn config(&self) -> &VadGainConfig {
        &self.config
    }

    /// Gain emitted by the most recent `compute_gain`, 1.0 initially. Used
    /// as the interpolation start for the next frame.
    pub fn current_gain(&self) -> f32 {
        self.previous_gain
    }

    /// Advance the controller by one frame and return the new gain.
    pub fn compute_gain(&mut self, vad: f32) -> f32 {
        let vad = vad.clamp(0.0, 1.0);
        let cfg = &self.config;

        // 1) Asymmetric VAD smoothing: react fast to onsets, ride out dips.
        let coef = if vad > self.smoothed_vad {
            cfg.attack_smoothing
        } else {
            cfg.vad_smoothing
        };
        self.smoothed_vad = lerp(self.smoothed_vad, vad, coef);

        // 2) Hangover bookkeeping.
        if self.smoothed_vad > cfg.vad_threshold {
            self.hangover_remaining = cfg.hangover_frames;
        } else {
            self.hangover_remaining = self.hangover_remaining.saturating_sub(1);
        }

        // 3) Target gain.
        self.target_gain = self.compute_target_gain();

        // 4) Asymmetric gain smoothing.
        let coef = if self.target_gain > self.previous_gain {
            cfg.attack_smoothing
        } else {
            cfg.release_smoothing
        };
        self.previous_gain = lerp(self.previous_gain, self.target_gain, coef);
        self.previous_gain
    }

    fn compute_target_gain(&self) -> f32 {
        let cfg = &self.config;

        if self.smoothed_vad > cfg.vad_threshold {
            return 1.0;
        }

        if self.hangover_remaining > 0 && cfg.hangover_frames > 0 {
            let progress =
                1.0 - self.hangover_remaining as f32 / cfg.hangover_frames as f32;
            if progress < cfg.hangover_fade_start {
                // Hold fully open through the front of the hangover.
                return 1.0;
            }
            let fade =
                (progress - cfg.hangover_fade_start) / (1.0 - cfg.hangover_fade_start).max(1e-6);
            let eased = 1.0 - (1.0 - fade).powi(3);
            return 1.0 - eased * (1.0 - 2.0 * cfg.min_gate_gain);
        }

        // Below threshold and out of hangover: cubic curve down to the floor.
        let v = (self.smoothed_vad / cfg.vad_threshold.max(1e-6)).clamp(0.0, 1.0);
        cfg.min_gate_gain + (1.0 - cfg.min_gate_gain) * v * v * v
    }

    pub fn reset(&mut self) {
        self.smoothed_vad = 0.0;
        self.hangover_remaining = 0;
        self.previous_gain = 1.0;
        self.target_gain = 1.0;
    }

    /// Replace named scalars; untouched fields keep their values.
    pub fn configure(&mut self, update: &VadGainUpdate) {
        let cfg = &mut self.config;
        if let Some(v) = update.vad_smoothing {
            cfg.vad_smoothing = v;
        }
        if let Some(v) = update.vad_threshold {
            cfg.vad_threshold = v;
        }
        if let Some(v) = update.hangover_frames {
            cfg.hangover_frames = v;
        }
        if let Some(v) = update.min_gate_gain {
            cfg.min_gate_gain = v;
        }
        if let Some(v) = update.attack_smoothing {
            cfg.attack_smoothing = v;
        }
        if let Some(v) = update.release_smoothing {
            cfg.release_smoothing = v;
        }
        if let Some(v) = update.hangover_fade_start {
            cfg.hangover_fade_start = v;
        }
    }
}

// =============================================================================
// Buffer operations
// =============================================================================

/// Scalar gain over a buffer.
pub fn apply_gain(buffer: &mut [f32], gain: f32) {
    for sample in buffer.iter_mut() {
        *sample *= gain;
    }
}

/// Per-sample linear interpolation from `start` to `end` across the buffer.
/// With `start == end` this is sample-exact equal to `apply_gain`.
pub fn apply_gain_interpolated(buffer: &mut [f32], start: f32, end: f32) {
    let n = buffer.len();
    if n == 0 {
        return;
    }
    let denom = (n - 1).max(1) as f32;
    let step = (end - start) / denom;
    for (i, sample) in buffer.iter_mut().enumerate() {
        *sample *= start + step * i as f32;
    }
}

/// Interpolated gain on `output`, plus a touch of the unprocessed signal
/// weighted by `max(0, 1 − g) · blend_ratio · g` so deep attenuation keeps
/// some room character instead of collapsing to processed silence.
pub fn apply_gain_with_blend(
    output: &mut [f32],
    original: &[f32],
    start: f32,
    end: f32,
    blend_ratio: f32,
) {
    let n = output.len().min(original.len());
    if n == 0 {
        return;
    }
    let denom = (n - 1).max(1) as f32;
    let step = (end - start) / denom;
    for i in 0..n {
        let g = start + step * i as f32;
        let blend = (1.0 - g).max(0.0) * blend_ratio * g;
        output[i] = output[i] * g + original[i] * blend;
    }
}

/// Per-sample soft clip at ±1.
pub fn apply_soft_clipping(buffer: &mut [f32]) {
    for sample in buffer.iter_mut() {
        *sample = soft_clip(*sample);
    }
}
