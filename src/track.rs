//! Track processor: glues an inbound frame stream to a denoiser.
//!
//! The processor re-blocks variable-sized inbound frames into the
//! denoiser's fixed frame size, denoises in place, optionally applies the
//! VAD gain controller, fades the first 20 ms of a session in, hard-clamps
//! every sample, and emits reconstructed frames with timestamps derived
//! from the inbound stream.
//!
//! A session is one tokio task that exclusively owns the denoiser, the gain
//! controller, and all three scratch buffers. Cancellation is cooperative:
//! `stop()` flips an abort flag that the task observes at the next frame
//! boundary; in-flight denoiser work is synchronous and short, so it simply
//! completes. Fatal errors end the session cleanly; downstream observes
//! end-of-stream, never a malformed frame.

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::DenoiserOptions;
use crate::denoiser::registry::{global_registry, DenoiserRegistry};
use crate::denoiser::{Denoiser, DenoiserType};
use crate::dsp::math::smoothstep01;
use crate::dsp::vad_gain::{
    apply_gain_with_blend, VadGainConfig, VadGainController, DEFAULT_BLEND_RATIO,
};
use crate::error::{PipelineError, PipelineResult};
use crate::frame::{AudioFrame, SampleFormat};
use crate::logging::{ContextLogger, LogLevel};

/// Session fade-in length: 20 ms at 48 kHz.
pub const FADE_IN_SAMPLES: usize = 960;

/// Output channel depth. Bounded so a stalled consumer applies backpressure
/// instead of growing a queue.
const OUTPUT_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackProcessorConfig {
    /// Explicit algorithm choice. `None` asks the registry for the best
    /// available.
    pub denoiser_type: Option<DenoiserType>,

    /// Options forwarded to the denoiser factory.
    pub denoiser: DenoiserOptions,

    /// VAD gain controller tuning.
    pub vad_gain: VadGainConfig,

    /// Layer the VAD gain controller over the denoiser output. Only takes
    /// effect for denoisers that actually emit VAD (the spectral one).
    pub apply_vad_gain: bool,

    pub debug: bool,
}

impl Default for TrackProcessorConfig {
    fn default() -> Self {
        Self {
            denoiser_type: None,
            denoiser: DenoiserOptions::default(),
            vad_gain: VadGainConfig::default(),
            apply_vad_gain: false,
            debug: false,
        }
    }
}

/// Consumer end of a processing session.
pub struct ProcessedTrack {
    receiver: mpsc::Receiver<AudioFrame>,
}

impl ProcessedTrack {
    /// Next processed frame, or `None` at end-of-stream.
    pub async fn recv(&mut self) -> Option<AudioFrame> {
        self.receiver.recv().await
    }

    pub fn into_receiver(self) -> mpsc::Receiver<AudioFrame> {
        self.receiver
    }
}

struct PipelineState {
    denoiser: Box<dyn Denoiser>,
    gain: VadGainController,
    apply_vad_gain: bool,
    frame_size: usize,

    input_buf: Vec<f32>,
    original_buf: Vec<f32>,
    output_buf: Vec<f32>,
    buffered: usize,

    sample_rate_hz: u32,
    next_timestamp_us: i64,
    fade_in_remaining: usize,
    abort: Option<watch::Receiver<bool>>,

    frames_in: u64,
    frames_processed: u64,
    frames_emitted: u64,
    error: Option<PipelineError>,

    log: ContextLogger,
}

impl PipelineState {
    fn reset_session(&mut self) {
        self.buffered = 0;
        self.sample_rate_hz = 48_000;
        self.next_timestamp_us = 0;
        self.fade_in_remaining = FADE_IN_SAMPLES;
        self.frames_in = 0;
        self.frames_processed = 0;
        self.frames_emitted = 0;
        self.error = None;
        self.abort = None;
        self.gain.reset();
    }

    async fn handle_frame(
        &mut self,
        frame: AudioFrame,
        output: &mpsc::Sender<AudioFrame>,
    ) -> PipelineResult<()> {
        if frame.channels != 1 {
            return Err(PipelineError::UnsupportedFormat(format!(
                "expected mono input, got {} channels",
                frame.channels
            )));
        }
        if frame.format != SampleFormat::F32Planar {
            return Err(PipelineError::UnsupportedFormat(
                "expected planar f32 input".to_string(),
            ));
        }

        self.frames_in += 1;
        self.sample_rate_hz = frame.sample_rate_hz;
        if self.buffered == 0 {
            self.next_timestamp_us = frame.timestamp_us;
        }

        let samples = frame.plane();
        let count = samples.len();
        let mut offset = 0;
        while offset < count {
            let take = (self.frame_size - self.buffered).min(count - offset);
            let dst = self.buffered..self.buffered + take;
            let src = offset..offset + take;
            self.input_buf[dst.clone()].copy_from_slice(&samples[src.clone()]);
            self.original_buf[dst].copy_from_slice(&samples[src]);
            self.buffered += take;
            offset += take;

            if self.buffered == self.frame_size {
                self.emit(output).await?;
                self.buffered = 0;
                self.next_timestamp_us =
                    frame.timestamp_us + frame.duration_us * offset as i64 / count as i64;
            }
        }
        Ok(())
    }

    async fn emit(&mut self, output: &mpsc::Sender<AudioFrame>) -> PipelineResult<()> {
        self.output_buf.copy_from_slice(&self.input_buf);
        let vad = self.denoiser.process_frame(&mut self.output_buf)?;
        self.frames_processed += 1;

        if self.fade_in_remaining > 0 {
            let count = self.fade_in_remaining.min(self.frame_size);
            for i in 0..count {
                let remaining = (self.fade_in_remaining - i) as f32;
                let p = 1.0 - remaining / FADE_IN_SAMPLES as f32;
                self.output_buf[i] *= smoothstep01(p);
            }
            self.fade_in_remaining -= count;
        }

        for sample in self.output_buf.iter_mut() {
            *sample = sample.clamp(-1.0, 1.0);
        }

        // The neural denoiser attenuates internally and reports no VAD;
        // gating on its constant-zero scores would silence the stream, so
        // the external controller only runs for the spectral algorithm.
        if self.apply_vad_gain
            && self.denoiser.denoiser_type() == DenoiserType::Spectral
            && vad > 0.0
        {
            let start = self.gain.current_gain();
            let end = self.gain.compute_gain(vad);
            apply_gain_with_blend(
                &mut self.output_buf,
                &self.original_buf,
                start,
                end,
                DEFAULT_BLEND_RATIO,
            );
        }

        let frame = AudioFrame::new(
            self.sample_rate_hz,
            self.next_timestamp_us,
            self.output_buf.clone(),
        );
        // The send can block on backpressure, so it races the abort flag;
        // otherwise a stalled consumer would pin `stop()` forever.
        match self.abort.as_mut() {
            Some(abort) => {
                tokio::select! {
                    sent = output.send(frame) => {
                        if sent.is_err() {
                            return Err(PipelineError::DownstreamClosed);
                        }
                    }
                    _ = abort.changed() => return Err(PipelineError::Aborted),
                }
            }
            None => {
                if output.send(frame).await.is_err() {
                    return Err(PipelineError::DownstreamClosed);
                }
            }
        }
        self.frames_emitted += 1;
        Ok(())
    }

    fn finish(&mut self) {
        self.log.info(&format!(
            "session ended: frames_in={} processed={} emitted={} residual={}",
            self.frames_in, self.frames_processed, self.frames_emitted, self.buffered
        ));
        self.gain.reset();
    }
}

struct SessionHandle {
    abort: watch::Sender<bool>,
    task: JoinHandle<PipelineState>,
}

/// Owns one denoiser and runs at most one processing session at a time.
pub struct TrackProcessor {
    state: Option<PipelineState>,
    session: Option<SessionHandle>,
    log: ContextLogger,
}

impl TrackProcessor {
    /// Wrap an already-initialized denoiser.
    pub fn new(denoiser: Box<dyn Denoiser>, config: TrackProcessorConfig) -> PipelineResult<Self> {
        if !denoiser.is_initialized() {
            return Err(PipelineError::not_initialized(
                "track processor requires an initialized denoiser",
            ));
        }
        let log = ContextLogger::new("track-processor");
        if config.debug {
            log.set_level(LogLevel::Debug);
        }
        let frame_size = denoiser.frame_size();
        let state = PipelineState {
            denoiser,
            gain: VadGainController::new(config.vad_gain),
            apply_vad_gain: config.apply_vad_gain,
            frame_size,
            input_buf: vec![0.0; frame_size],
            original_buf: vec![0.0; frame_size],
            output_buf: vec![0.0; frame_size],
            buffered: 0,
            sample_rate_hz: 48_000,
            next_timestamp_us: 0,
            fade_in_remaining: FADE_IN_SAMPLES,
            abort: None,
            frames_in: 0,
            frames_processed: 0,
            frames_emitted: 0,
            error: None,
            log: log.child(&[("component", "session")]),
        };
        Ok(Self {
            state: Some(state),
            session: None,
            log,
        })
    }

    /// Build, initialize, and wrap a denoiser chosen through the registry.
    pub async fn create(config: TrackProcessorConfig) -> PipelineResult<Self> {
        Self::create_with_registry(global_registry(), config).await
    }

    pub async fn create_with_registry(
        registry: &DenoiserRegistry,
        config: TrackProcessorConfig,
    ) -> PipelineResult<Self> {
        let ty = match config.denoiser_type {
            Some(ty) => ty,
            None => registry
                .best_available(None)
                .ok_or(PipelineError::NoDenoiserAvailable)?,
        };
        let mut denoiser = registry.create(ty, &config.denoiser)?;
        denoiser.initialize().await?;
        if config.debug {
            denoiser.set_vad_logging(true);
        }
        Self::new(denoiser, config)
    }

    /// Start a processing session over `source`. A running session is
    /// stopped first. Restarting begins with fresh state, including a fresh
    /// fade-in window.
    pub async fn start(
        &mut self,
        source: mpsc::Receiver<AudioFrame>,
    ) -> PipelineResult<ProcessedTrack> {
        if self.session.is_some() {
            self.stop().await;
        }
        let mut state = self
            .state
            .take()
            .ok_or_else(|| PipelineError::not_initialized("pipeline state unavailable"))?;
        state.reset_session();

        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let (abort_tx, abort_rx) = watch::channel(false);
        state.abort = Some(abort_rx.clone());
        let task = tokio::spawn(run_session(state, source, output_tx, abort_rx));
        self.session = Some(SessionHandle {
            abort: abort_tx,
            task,
        });
        self.log.debug("session started");
        Ok(ProcessedTrack {
            receiver: output_rx,
        })
    }

    /// Stop the running session, if any, and wait for it to wind down.
    pub async fn stop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let _ = session.abort.send(true);
        match session.task.await {
            Ok(state) => {
                self.state = Some(state);
            }
            Err(join_error) => {
                self.log.error(&format!("session task failed: {join_error}"));
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.session
            .as_ref()
            .map(|session| !session.task.is_finished())
            .unwrap_or(false)
    }

    /// Fatal error recorded by the last completed session, if any. Benign
    /// endings (abort, downstream close, input end) leave this empty.
    pub fn last_error(&self) -> Option<&PipelineError> {
        self.state.as_ref().and_then(|state| state.error.as_ref())
    }
}

async fn run_session(
    mut state: PipelineState,
    mut source: mpsc::Receiver<AudioFrame>,
    output: mpsc::Sender<AudioFrame>,
    mut abort: watch::Receiver<bool>,
) -> PipelineState {
    loop {
        tokio::select! {
            changed = abort.changed() => {
                // A flipped flag or a dropped processor both end the session.
                if changed.is_err() || *abort.borrow() {
                    state.log.debug("session aborted");
                    break;
                }
            }
            inbound = source.recv() => {
                let Some(frame) = inbound else {
                    state.log.debug("input stream ended");
                    break;
                };
                match state.handle_frame(frame, &output).await {
                    Ok(()) => {}
                    Err(err) if err.is_benign() => {
                        state.log.debug(&format!("session closing: {err}"));
                        break;
                    }
                    Err(err) => {
                        state.log.error(&format!("fatal session error: {err}"));
                        state.error = Some(err);
                        break;
                    }
                }
            }
        }
    }
    state.finish();
    state
}
