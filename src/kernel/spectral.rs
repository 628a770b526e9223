//! Spectral (RNNoise) kernel binding.
//!
//! The kernel processes fixed 480-sample frames (10 ms at 48 kHz) and emits
//! a voice-activity probability per frame. Numeric contract: samples are
//! exchanged at int16 magnitude (the caller scales by 32767 on the way in
//! and 1/32767 on the way out).

use nnnoiseless::DenoiseState;

/// Fixed kernel frame size: 480 samples, 10 ms at 48 kHz.
pub const SPECTRAL_FRAME_SIZE: usize = DenoiseState::FRAME_SIZE;

/// Which kernel build the capability probe selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelFlavor {
    Portable,
    Simd,
}

/// Runtime probe for a SIMD-capable host.
#[allow(unreachable_code)]
pub fn simd_available() -> bool {
    #[cfg(target_arch = "x86_64")]
    {
        return std::arch::is_x86_feature_detected!("avx2");
    }
    #[cfg(target_arch = "aarch64")]
    {
        // NEON is baseline on aarch64.
        return true;
    }
    false
}

/// Materialized spectral kernel module: a context factory for the selected
/// kernel flavor. Cheap to clone; contexts are independent.
#[derive(Debug, Clone)]
pub struct SpectralModule {
    flavor: KernelFlavor,
}

impl SpectralModule {
    pub fn materialize(prefer_simd: bool) -> Self {
        let flavor = if prefer_simd && simd_available() {
            KernelFlavor::Simd
        } else {
            KernelFlavor::Portable
        };
        Self { flavor }
    }

    pub fn flavor(&self) -> KernelFlavor {
        self.flavor
    }

    pub fn new_context(&self) -> SpectralKernel {
        SpectralKernel {
            state: DenoiseState::new(),
            flavor: self.flavor,
        }
    }
}

/// One kernel context. Not shared between callers.
pub struct SpectralKernel {
    state: Box<DenoiseState<'static>>,
    flavor: KernelFlavor,
}

impl SpectralKernel {
    pub fn frame_size(&self) -> usize {
        SPECTRAL_FRAME_SIZE
    }

    pub fn flavor(&self) -> KernelFlavor {
        self.flavor
    }

    /// Denoise one frame. `input` and `output` must both be
    /// `SPECTRAL_FRAME_SIZE` long, at int16 magnitude scale. Returns the
    /// kernel's VAD probability.
    pub fn process(&mut self, output: &mut [f32], input: &[f32]) -> f32 {
        self.state.process_frame(output, input)
    }
}
