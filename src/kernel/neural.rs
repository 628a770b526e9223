//! Neural kernel binding (tract-driven magnitude-mask model).
//!
//! The model consumes one STFT magnitude frame plus a recurrent state tensor
//! and returns a per-bin speech mask plus the next state. Around that, this
//! binding runs the framing: a 960-sample sqrt-Hann window advanced by 480
//! samples, mask application with an attenuation-limit floor and optional
//! post-filter sharpening, then weighted overlap-add synthesis.
//!
//! The module is materialized from the gzip-framed model blob delivered by
//! the loader; the blob is cached in framed form because that is the wire
//! format of the artifact.

use std::io::Cursor;
use std::sync::Arc;

use rustfft::{num_complex::Complex, Fft, FftPlanner};
use tract_onnx::prelude::*;

use crate::dsp::math::db_to_gain;
use crate::error::{Artifact, PipelineError, PipelineResult};
use crate::loader::gunzip;

/// Samples consumed and produced per kernel call (10 ms at 48 kHz).
pub const NEURAL_FRAME_SIZE: usize = 480;

/// Analysis window length. 50% overlap against `NEURAL_FRAME_SIZE`.
pub const NEURAL_FFT_SIZE: usize = 960;

const NEURAL_BINS: usize = NEURAL_FFT_SIZE / 2 + 1;

/// Recurrent state width of the mask model.
const MODEL_STATE_DIM: usize = 128;

type ModelPlan = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

fn make_sqrt_hann_window(size: usize) -> Vec<f32> {
    (0..size)
        .map(|i| {
            let hann =
                0.5 * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / size as f32).cos());
            hann.sqrt()
        })
        .collect()
}

/// Materialized neural module: the shared inference plan plus the cached
/// gzip-framed model blob. Clones share both.
#[derive(Clone, Debug)]
pub struct NeuralModule {
    plan: Arc<ModelPlan>,
    model_gz: Arc<Vec<u8>>,
}

impl NeuralModule {
    /// Build the inference plan from the gzip-framed model blob.
    pub fn materialize(model_gz: Vec<u8>) -> PipelineResult<Self> {
        let raw = gunzip(&model_gz).map_err(|e| PipelineError::load(Artifact::Model, e))?;

        let model = tract_onnx::onnx()
            .model_for_read(&mut Cursor::new(&raw))
            .map_err(|e| PipelineError::load(Artifact::Kernel, e))?;
        let plan = model
            .into_optimized()
            .and_then(|m| m.into_runnable())
            .map_err(|e| PipelineError::load(Artifact::Kernel, e))?;

        Ok(Self {
            plan: Arc::new(plan),
            model_gz: Arc::new(model_gz),
        })
    }

    /// The cached model blob in its gzip-framed wire form.
    pub fn model_blob(&self) -> &[u8] {
        &self.model_gz
    }

    pub fn new_context(&self, atten_limit_db: f32) -> PipelineResult<NeuralKernel> {
        NeuralKernel::new(Arc::clone(&self.plan), atten_limit_db)
    }
}

/// One kernel context: recurrent model state plus framing buffers. Not
/// shared between callers.
pub struct NeuralKernel {
    plan: Arc<ModelPlan>,
    state: Tensor,

    window: Vec<f32>,
    frame: Vec<f32>,
    fft: Arc<dyn Fft<f32>>,
    ifft: Arc<dyn Fft<f32>>,
    spec: Vec<Complex<f32>>,
    mask: Vec<f32>,
    mag_buffer: tract_ndarray::ArrayD<f32>,
    overlap: Vec<f32>,
    out: Vec<f32>,

    atten_floor: f32,
    post_filter_beta: f32,
}

impl NeuralKernel {
    fn new(plan: Arc<ModelPlan>, atten_limit_db: f32) -> PipelineResult<Self> {
        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(NEURAL_FFT_SIZE);
        let ifft = planner.plan_fft_inverse(NEURAL_FFT_SIZE);

        let state = Tensor::zero::<f32>(&[1, 1, MODEL_STATE_DIM])
            .map_err(|e| PipelineError::KernelAllocation(e.to_string()))?;
        let mag_buffer = tract_ndarray::Array::zeros((1, 1, NEURAL_BINS)).into_dyn();

        Ok(Self {
            plan,
            state,
            window: make_sqrt_hann_window(NEURAL_FFT_SIZE),
            frame: vec![0.0; NEURAL_FFT_SIZE],
            fft,
            ifft,
            spec: vec![Complex::new(0.0, 0.0); NEURAL_FFT_SIZE],
            mask: vec![1.0; NEURAL_BINS],
            mag_buffer,
            overlap: vec![0.0; NEURAL_FRAME_SIZE],
            out: vec![0.0; NEURAL_FRAME_SIZE],
            atten_floor: atten_floor_for(atten_limit_db),
            post_filter_beta: 0.0,
        })
    }

    pub fn frame_length(&self) -> usize {
        NEURAL_FRAME_SIZE
    }

    /// Cap on how much the kernel may suppress any band, in dB.
    pub fn set_atten_limit(&mut self, db: f32) {
        self.atten_floor = atten_floor_for(db);
    }

    /// Post-filter strength. 0 disables; small positive values sharpen the
    /// suppression of low-confidence bins to help speech quality.
    pub fn set_post_filter_beta(&mut self, beta: f32) {
        self.post_filter_beta = beta.max(0.0);
    }

    /// Enhance one frame. `input` must be `NEURAL_FRAME_SIZE` long; the
    /// returned slice is kernel-owned and the same length.
    pub fn process_frame(&mut self, input: &[f32]) -> PipelineResult<&[f32]> {
        debug_assert_eq!(input.len(), NEURAL_FRAME_SIZE);

        // Slide the analysis window by one hop and append the new samples.
        self.frame
            .copy_within(NEURAL_FRAME_SIZE..NEURAL_FFT_SIZE, 0);
        self.frame[NEURAL_FFT_SIZE - NEURAL_FRAME_SIZE..].copy_from_slice(input);

        for i in 0..NEURAL_FFT_SIZE {
            self.spec[i] = Complex::new(self.frame[i] * self.window[i], 0.0);
        }
        self.fft.process(&mut self.spec);

        self.run_inference()?;

        let nyq = NEURAL_FFT_SIZE / 2;
        for i in 0..=nyq {
            self.spec[i] *= self.mask[i];
        }
        self.spec[0].im = 0.0;
        self.spec[nyq].im = 0.0;
        for k in 1..nyq {
            self.spec[NEURAL_FFT_SIZE - k] = self.spec[k].conj();
        }

        self.ifft.process(&mut self.spec);

        // WOLA: sqrt-Hann analysis + synthesis at 50% overlap reconstructs
        // with unit gain, so no extra normalization pass is needed.
        let norm = 1.0 / NEURAL_FFT_SIZE as f32;
        for i in 0..NEURAL_FRAME_SIZE {
            let y = self.spec[i].re * norm * self.window[i];
            self.out[i] = self.overlap[i] + y;
        }
        for i in 0..NEURAL_FRAME_SIZE {
            let j = NEURAL_FRAME_SIZE + i;
            self.overlap[i] = self.spec[j].re * norm * self.window[j];
        }

        Ok(&self.out)
    }

    fn run_inference(&mut self) -> PipelineResult<()> {
        let nyq = NEURAL_FFT_SIZE / 2;
        {
            let mut view = self.mag_buffer.view_mut();
            if let Some(flat) = view.as_slice_mut() {
                for i in 0..=nyq {
                    flat[i] = self.spec[i].norm();
                }
            } else {
                for i in 0..=nyq {
                    view[[0, 0, i]] = self.spec[i].norm();
                }
            }
        }

        let input_tensor: Tensor = self.mag_buffer.clone().into();
        let mut outputs = self
            .plan
            .run(tvec!(input_tensor.into(), self.state.clone().into()))
            .map_err(|e| PipelineError::Inference(e.to_string()))?;
        if outputs.len() < 2 {
            return Err(PipelineError::Inference(
                "model must produce a mask and a state tensor".to_string(),
            ));
        }

        let mask_tensor = outputs.remove(0).into_tensor();
        self.state = outputs.remove(0).into_tensor();

        let model_mask = mask_tensor
            .as_slice::<f32>()
            .map_err(|_| PipelineError::Inference("mask tensor is not f32".to_string()))?;
        if model_mask.is_empty() {
            return Err(PipelineError::Inference("mask tensor is empty".to_string()));
        }
        let model_bins = model_mask.len();

        let beta = self.post_filter_beta;
        for i in 0..NEURAL_BINS {
            let idx = (i * model_bins / NEURAL_BINS).min(model_bins - 1);
            let mut g = model_mask[idx].clamp(0.0, 1.0);
            if beta > 0.0 {
                g = g.powf(1.0 + beta * (1.0 - g));
            }
            self.mask[i] = g.max(self.atten_floor);
        }
        Ok(())
    }
}

fn atten_floor_for(db: f32) -> f32 {
    db_to_gain(-db.max(0.0))
}
