//! clearstream: real-time single-channel noise suppression for media
//! clients.
//!
//! Raw microphone audio arrives as a stream of planar-f32 mono frames; the
//! pipeline emits same-format frames with non-speech energy attenuated,
//! plus a per-frame voice-activity score where the algorithm provides one.
//!
//! The moving parts:
//!
//! - [`denoiser`]: the algorithm abstraction. [`denoiser::SpectralDenoiser`]
//!   is a recurrent spectral kernel with built-in VAD;
//!   [`denoiser::NeuralDenoiser`] runs a mask model and reports no VAD.
//!   [`denoiser::global_registry`] picks and constructs one by tag.
//! - [`loader`]: lazy single-flight acquisition of kernels and model blobs,
//!   shared by every instance pointing at the same artifact.
//! - [`dsp::vad_gain`]: turns VAD scores into a click-free per-sample gain
//!   with attack/release asymmetry and hangover.
//! - [`track`]: the [`track::TrackProcessor`] glues an inbound frame stream
//!   to a denoiser, re-blocking input, fading the session in, clamping,
//!   and emitting frames with derived timestamps.
//!
//! ```no_run
//! use clearstream::track::{TrackProcessor, TrackProcessorConfig};
//! use clearstream::frame::AudioFrame;
//!
//! # async fn demo() -> clearstream::error::PipelineResult<()> {
//! let config = TrackProcessorConfig {
//!     apply_vad_gain: true,
//!     ..Default::default()
//! };
//! let mut processor = TrackProcessor::create(config).await?;
//!
//! let (tx, rx) = tokio::sync::mpsc::channel(32);
//! let mut processed = processor.start(rx).await?;
//!
//! tx.send(AudioFrame::new(48_000, 0, vec![0.0; 480])).await.ok();
//! while let Some(frame) = processed.recv().await {
//!     // hand the frame to the outbound track
//!     let _ = frame;
//! }
//! processor.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod denoiser;
pub mod dsp;
pub mod error;
pub mod frame;
pub mod kernel;
pub mod loader;
pub mod logging;
pub mod track;

pub use config::{DenoiserOptions, DenoiserUpdate};
pub use denoiser::{Denoiser, DenoiserType};
pub use error::{Artifact, PipelineError, PipelineResult};
pub use frame::{AudioFrame, SampleFormat};
pub use logging::{ContextLogger, LogLevel};
pub use track::{ProcessedTrack, TrackProcessor, TrackProcessorConfig};
