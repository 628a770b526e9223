//! Denoiser abstraction.
//!
//! Two algorithms sit behind one object-safe trait: the spectral recurrent
//! denoiser (built-in VAD) and the neural mask-model denoiser (no VAD). The
//! lifecycle state machine, the frame-length precondition, scratch-buffer
//! ownership, and VAD observability are shared through `DenoiserCore`, so
//! the implementations contain only algorithm.
//!
//! Lifecycle invariants:
//! - `process_frame` is illegal unless `initialize` completed;
//! - `initialize` twice logs a warning and is a no-op;
//! - `destroy` is idempotent and releases kernel state plus scratch buffers;
//! - an instance is never shared between concurrent callers.

pub mod neural;
pub mod registry;
pub mod spectral;

use serde::{Deserialize, Serialize};

use crate::config::DenoiserUpdate;
use crate::error::{PipelineError, PipelineResult};
use crate::logging::ContextLogger;

pub use neural::NeuralDenoiser;
pub use registry::{global_registry, DenoiserRegistry, RegistryEntry};
pub use spectral::SpectralDenoiser;

/// Closed tag set of available algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DenoiserType {
    Spectral,
    Neural,
}

/// A single-channel fixed-frame denoiser.
#[async_trait::async_trait]
pub trait Denoiser: Send {
    /// One-shot asynchronous setup. Must complete before `process_frame`.
    /// Calling again after success logs a warning and is a no-op; on failure
    /// the instance remains uninitialized and destroyable.
    async fn initialize(&mut self) -> PipelineResult<()>;

    /// Denoise one frame in place. Synchronous and deterministic with
    /// respect to internal state. The slice length must equal
    /// `frame_size()`. Returns the algorithm's VAD in [0, 1], or 0 when the
    /// algorithm has none.
    fn process_frame(&mut self, frame: &mut [f32]) -> PipelineResult<f32>;

    /// Idempotent teardown.
    fn destroy(&mut self);

    /// Fixed frame size. Before `initialize` this is the algorithm default.
    fn frame_size(&self) -> usize;

    fn denoiser_type(&self) -> DenoiserType;

    fn is_initialized(&self) -> bool;

    fn last_vad_score(&self) -> f32;

    fn set_vad_logging(&mut self, enabled: bool);

    /// Runtime reconfiguration. Implementations ignore fields they do not
    /// understand.
    fn configure(&mut self, update: &DenoiserUpdate) -> PipelineResult<()> {
        let _ = update;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Uninitialized,
    Ready,
    Destroyed,
}

/// VAD trace cadence when vad logging is on, in frames (1 s at 10 ms).
const VAD_LOG_INTERVAL: u64 = 100;

/// Shared lifecycle enforcement and scratch ownership for denoiser
/// implementations.
pub(crate) struct DenoiserCore {
    state: Lifecycle,
    frame_size: usize,
    pub input_scratch: Vec<f32>,
    pub output_scratch: Vec<f32>,
    last_vad: f32,
    vad_logging: bool,
    frames_processed: u64,
    pub log: ContextLogger,
}

impl DenoiserCore {
    pub fn new(default_frame_size: usize, log: ContextLogger) -> Self {
        Self {
            state: Lifecycle::Uninitialized,
            frame_size: default_frame_size,
            input_scratch: Vec::new(),
            output_scratch: Vec::new(),
            last_vad: 0.0,
            vad_logging: false,
            frames_processed: 0,
            log,
        }
    }

    /// Gate for `initialize`. `Ok(true)` means proceed; `Ok(false)` means
    /// the instance is already initialized (benign no-op).
    pub fn begin_initialize(&mut self) -> PipelineResult<bool> {
        match self.state {
            Lifecycle::Uninitialized => Ok(true),
            Lifecycle::Ready => {
                self.log.warn("initialize called twice, ignoring");
                Ok(false)
            }
            Lifecycle::Destroyed => Err(PipelineError::not_initialized(
                "instance has been destroyed",
            )),
        }
    }

    /// Allocate scratch and enter the ready state.
    pub fn mark_ready(&mut self, frame_size: usize) {
        self.frame_size = frame_size;
        self.input_scratch = vec![0.0; frame_size];
        self.output_scratch = vec![0.0; frame_size];
        self.state = Lifecycle::Ready;
    }

    /// Precondition check for `process_frame`. Rejects before touching any
    /// algorithm state.
    pub fn ensure_frame(&self, len: usize) -> PipelineResult<()> {
        if self.state != Lifecycle::Ready {
            return Err(PipelineError::not_initialized("process_frame"));
        }
        if len != self.frame_size {
            return Err(PipelineError::FrameSizeMismatch {
                expected: self.frame_size,
                got: len,
            });
        }
        Ok(())
    }

    /// Record the frame outcome. Returns the (clamped) VAD score.
    pub fn finish_frame(&mut self, vad: f32) -> f32 {
        let vad = vad.clamp(0.0, 1.0);
        self.last_vad = vad;
        self.frames_processed += 1;
        if self.vad_logging && self.frames_processed % VAD_LOG_INTERVAL == 0 {
            self.log.trace(&format!(
                "vad={vad:.3} frames={}",
                self.frames_processed
            ));
        }
        vad
    }

    pub fn destroy(&mut self) {
        if self.state == Lifecycle::Destroyed {
            return;
        }
        self.input_scratch = Vec::new();
        self.output_scratch = Vec::new();
        self.state = Lifecycle::Destroyed;
        self.log.debug(&format!(
            "destroyed after {} frames",
            self.frames_processed
        ));
    }

    pub fn is_ready(&self) -> bool {
        self.state == Lifecycle::Ready
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed
    }

    pub fn last_vad(&self) -> f32 {
        self.last_vad
    }

    pub fn set_vad_logging(&mut self, enabled: bool) {
        self.vad_logging = enabled;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core() -> DenoiserCore {
        DenoiserCore::new(480, ContextLogger::new("core-test"))
    }

    #[test]
    fn process_requires_initialize() {
        let core = core();
        assert!(matches!(
            core.ensure_frame(480),
            Err(PipelineError::NotInitialized(_))
        ));
    }

    #[test]
    fn frame_size_mismatch_is_rejected() {
        let mut core = core();
        core.mark_ready(480);
        assert!(core.ensure_frame(480).is_ok());
        assert_eq!(
            core.ensure_frame(479),
            Err(PipelineError::FrameSizeMismatch {
                expected: 480,
                got: 479
            })
        );
    }

    #[test]
    fn double_initialize_is_a_noop() {
        let mut core = core();
        assert!(core.begin_initialize().unwrap());
        core.mark_ready(480);
        assert!(!core.begin_initialize().unwrap());
    }

    #[test]
    fn destroy_is_idempotent_and_terminal() {
        let mut core = core();
        core.mark_ready(480);
        core.destroy();
        core.destroy();
        assert!(!core.is_ready());
        assert!(core.begin_initialize().is_err());
        assert!(core.input_scratch.is_empty());
    }

    #[test]
    fn finish_frame_clamps_vad() {
        let mut core = core();
        core.mark_ready(480);
        assert_eq!(core.finish_frame(1.5), 1.0);
        assert_eq!(core.finish_frame(-0.5), 0.0);
        assert_eq!(core.frames_processed(), 2);
    }
}
