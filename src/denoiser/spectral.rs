//! Spectral denoiser (recurrent kernel with built-in VAD).
//!
//! Wraps the RNNoise-style kernel. The kernel exchanges samples at int16
//! magnitude, so every frame is scaled by 32767 on the way in and 1/32767
//! on the way out. On top of the kernel output the denoiser runs an
//! always-on adaptive post-gain driven by the kernel's VAD: a gentle gate
//! that rides residual noise down between words without touching speech.
//! This stage is separate from the track processor's optional VAD gain
//! controller; the two are tuned independently.

use std::sync::{Arc, OnceLock};

use crate::config::DenoiserOptions;
use crate::denoiser::{Denoiser, DenoiserCore, DenoiserType};
use crate::dsp::math::lerp;
use crate::error::{Artifact, PipelineResult};
use crate::kernel::spectral::{SpectralKernel, SpectralModule, SPECTRAL_FRAME_SIZE};
use crate::loader::ModuleLoader;
use crate::logging::{ContextLogger, LogLevel};

/// Kernel sample scale (int16 magnitude).
const I16_SCALE: f32 = 32767.0;
const INV_I16_SCALE: f32 = 1.0 / 32767.0;

// Internal post-gain shape. Smoothed VAD above FULL keeps unity gain, below
// FLOOR the gate closes to MIN, linear in between.
const POST_GAIN_VAD_FULL: f32 = 0.5;
const POST_GAIN_VAD_FLOOR: f32 = 0.2;
const POST_GAIN_ATTACK: f32 = 0.3;
const POST_GAIN_RELEASE: f32 = 0.05;
const POST_GAIN_MIN: f32 = 0.1;

/// VAD-driven post-gain internal to the spectral algorithm.
#[derive(Debug, Clone, Copy)]
struct AdaptivePostGain {
    smoothed_vad: f32,
    gain: f32,
}

impl AdaptivePostGain {
    fn new() -> Self {
        Self {
            smoothed_vad: 0.0,
            gain: 1.0,
        }
    }

    fn update(&mut self, vad: f32) -> f32 {
        let coef = if vad > self.smoothed_vad {
            POST_GAIN_ATTACK
        } else {
            POST_GAIN_RELEASE
        };
        self.smoothed_vad = lerp(self.smoothed_vad, vad, coef);

        let target = if self.smoothed_vad >= POST_GAIN_VAD_FULL {
            1.0
        } else if self.smoothed_vad <= POST_GAIN_VAD_FLOOR {
            POST_GAIN_MIN
        } else {
            let t = (self.smoothed_vad - POST_GAIN_VAD_FLOOR)
                / (POST_GAIN_VAD_FULL - POST_GAIN_VAD_FLOOR);
            lerp(POST_GAIN_MIN, 1.0, t)
        };

        let coef = if target > self.gain {
            POST_GAIN_ATTACK
        } else {
            POST_GAIN_RELEASE
        };
        self.gain = lerp(self.gain, target, coef).max(POST_GAIN_MIN);
        self.gain
    }
}

/// Process-wide kernel module loaders, one per flavor preference. The probe
/// and module materialization run once per process and are shared by every
/// instance with the same preference.
fn shared_loader(prefer_simd: bool) -> Arc<ModuleLoader<SpectralModule>> {
    static LOADERS: OnceLock<[Arc<ModuleLoader<SpectralModule>>; 2]> = OnceLock::new();
    let loaders = LOADERS.get_or_init(|| {
        let build = |prefer_simd: bool| {
            Arc::new(ModuleLoader::new(
                Artifact::Kernel,
                ContextLogger::new("spectral-loader"),
                move || async move { Ok(SpectralModule::materialize(prefer_simd)) },
            ))
        };
        [build(false), build(true)]
    });
    Arc::clone(&loaders[prefer_simd as usize])
}

pub struct SpectralDenoiser {
    core: DenoiserCore,
    loader: Arc<ModuleLoader<SpectralModule>>,
    kernel: Option<SpectralKernel>,
    post_gain: AdaptivePostGain,
}

impl SpectralDenoiser {
    pub fn new(options: &DenoiserOptions) -> Self {
        let mut log = ContextLogger::new("spectral-denoiser");
        if let Some(session) = options.session_id.as_deref() {
            log = log.child(&[("session", session)]);
        }
        if options.debug {
            log.set_level(LogLevel::Debug);
        }
        Self {
            core: DenoiserCore::new(SPECTRAL_FRAME_SIZE, log),
            loader: shared_loader(options.prefer_simd()),
            kernel: None,
            post_gain: AdaptivePostGain::new(),
        }
    }
}

#[async_trait::async_trait]
impl Denoiser for SpectralDenoiser {
    async fn initialize(&mut self) -> PipelineResult<()> {
        if !self.core.begin_initialize()? {
            return Ok(());
        }
        let module = self.loader.load().await?;
        let kernel = module.new_context();
        let frame_size = kernel.frame_size();
        self.core.log.info(&format!(
            "spectral kernel ready, flavor={:?} frame_size={frame_size}",
            kernel.flavor()
        ));
        self.kernel = Some(kernel);
        self.core.mark_ready(frame_size);
        Ok(())
    }

    fn process_frame(&mut self, frame: &mut [f32]) -> PipelineResult<f32> {
        self.core.ensure_frame(frame.len())?;
        let kernel = self
            .kernel
            .as_mut()
            .ok_or_else(|| crate::error::PipelineError::not_initialized("kernel"))?;

        for (scratch, &sample) in self.core.input_scratch.iter_mut().zip(frame.iter()) {
            *scratch = sample * I16_SCALE;
        }

        let vad = kernel
            .process(&mut self.core.output_scratch, &self.core.input_scratch)
            .clamp(0.0, 1.0);

        let gain = self.post_gain.update(vad);
        for (sample, &scratch) in frame.iter_mut().zip(self.core.output_scratch.iter()) {
            *sample = scratch * INV_I16_SCALE * gain;
        }

        Ok(self.core.finish_frame(vad))
    }

    fn destroy(&mut self) {
        // Kernel context first, then the scratch buffers.
        self.kernel = None;
        self.core.destroy();
    }

    fn frame_size(&self) -> usize {
        self.core.frame_size()
    }

    fn denoiser_type(&self) -> DenoiserType {
        DenoiserType::Spectral
    }

    fn is_initialized(&self) -> bool {
        self.core.is_ready()
    }

    fn last_vad_score(&self) -> f32 {
        self.core.last_vad()
    }

    fn set_vad_logging(&mut self, enabled: bool) {
        self.core.set_vad_logging(enabled);
    }
}
