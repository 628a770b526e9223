//! Neural denoiser (mask-model kernel, no VAD).
//!
//! Initialization goes through the shared single-flight loader: the model
//! blob is fetched once per artifact location, gzip framing is verified (and
//! restored when middleware stripped it), and the inference plan is built.
//! `process_frame` copies the caller's frame through the kernel and back;
//! the VAD score is always 0 because the model does not produce one, which
//! is also why the track processor never layers external VAD gain on this
//! algorithm.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use crate::config::{DenoiserOptions, DenoiserUpdate};
use crate::denoiser::{Denoiser, DenoiserCore, DenoiserType};
use crate::dsp::math::{frame_rms, lin_to_db};
use crate::error::{Artifact, PipelineError, PipelineResult};
use crate::kernel::neural::{NeuralKernel, NeuralModule, NEURAL_FRAME_SIZE};
use crate::loader::{fetch_model_blob, transport_for, ModuleLoader, ModuleTransport};
use crate::logging::{ContextLogger, LogLevel};

type NeuralLoader = Arc<ModuleLoader<NeuralModule>>;

/// Process-wide loader cache keyed by artifact location, so every instance
/// pointing at the same model shares one fetch.
fn shared_loader(location: &str, transport: Option<Arc<dyn ModuleTransport>>) -> NeuralLoader {
    static LOADERS: OnceLock<Mutex<HashMap<String, NeuralLoader>>> = OnceLock::new();
    let cache = LOADERS.get_or_init(|| Mutex::new(HashMap::new()));
    let mut cache = cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

    if let Some(loader) = cache.get(location) {
        return Arc::clone(loader);
    }

    let transport = transport.unwrap_or_else(|| transport_for(location));
    let log = ContextLogger::new("neural-loader");
    let loader_log = log.clone();
    let loader_location = location.to_string();
    let loader = Arc::new(ModuleLoader::new(Artifact::Model, log, move || {
        let transport = Arc::clone(&transport);
        let location = loader_location.clone();
        let log = loader_log.clone();
        async move {
            let blob = fetch_model_blob(transport, &location, &log).await?;
            NeuralModule::materialize(blob)
        }
    }));
    cache.insert(location.to_string(), Arc::clone(&loader));
    loader
}

pub struct NeuralDenoiser {
    core: DenoiserCore,
    loader: NeuralLoader,
    kernel: Option<NeuralKernel>,
    atten_limit_db: f32,
    post_filter_beta: f32,
}

impl NeuralDenoiser {
    pub fn new(options: &DenoiserOptions) -> Self {
        Self::build(options, None)
    }

    /// Construct with an explicit transport. The transport only matters for
    /// the first instance to reference a given artifact location; later
    /// instances share the cached loader.
    pub fn with_transport(options: &DenoiserOptions, transport: Arc<dyn ModuleTransport>) -> Self {
        Self::build(options, Some(transport))
    }

    fn build(options: &DenoiserOptions, transport: Option<Arc<dyn ModuleTransport>>) -> Self {
        let mut log = ContextLogger::new("neural-denoiser");
        if let Some(session) = options.session_id.as_deref() {
            log = log.child(&[("session", session)]);
        }
        if options.debug {
            log.set_level(LogLevel::Debug);
        }
        let location = options.model_location();
        Self {
            core: DenoiserCore::new(NEURAL_FRAME_SIZE, log),
            loader: shared_loader(&location, transport),
            kernel: None,
            atten_limit_db: options.atten_limit_db(),
            post_filter_beta: options.post_filter_beta(),
        }
    }

    fn log_first_frame_stats(&self, input: &[f32], output: &[f32]) {
        let (in_min, in_max) = min_max(input);
        let (out_min, out_max) = min_max(output);
        self.core.log.debug(&format!(
            "first frame: in min={in_min:.4} max={in_max:.4} rms={:.1}dB, \
             out min={out_min:.4} max={out_max:.4} rms={:.1}dB",
            lin_to_db(frame_rms(input)),
            lin_to_db(frame_rms(output)),
        ));
    }
}

fn min_max(samples: &[f32]) -> (f32, f32) {
    let mut min = f32::INFINITY;
    let mut max = f32::NEG_INFINITY;
    for &s in samples {
        min = min.min(s);
        max = max.max(s);
    }
    (min, max)
}

#[async_trait::async_trait]
impl Denoiser for NeuralDenoiser {
    async fn initialize(&mut self) -> PipelineResult<()> {
        if !self.core.begin_initialize()? {
            return Ok(());
        }
        let module = self.loader.load().await?;
        let mut kernel = module.new_context(self.atten_limit_db)?;
        kernel.set_post_filter_beta(self.post_filter_beta);
        let frame_size = kernel.frame_length();
        self.core.log.info(&format!(
            "neural kernel ready, frame_size={frame_size} atten_limit={}dB beta={}",
            self.atten_limit_db, self.post_filter_beta
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
            .ok_or_else(|| PipelineError::not_initialized("kernel"))?;

        self.core.input_scratch.copy_from_slice(frame);
        let first_frame = self.core.frames_processed() == 0;

        let enhanced = kernel.process_frame(&self.core.input_scratch)?;
        self.core.output_scratch.copy_from_slice(enhanced);
        frame.copy_from_slice(&self.core.output_scratch);

        if first_frame {
            self.log_first_frame_stats(&self.core.input_scratch, frame);
        }

        // No VAD from this algorithm.
        Ok(self.core.finish_frame(0.0))
    }

    fn destroy(&mut self) {
        self.kernel = None;
        self.core.destroy();
    }

    fn frame_size(&self) -> usize {
        self.core.frame_size()
    }

    fn denoiser_type(&self) -> DenoiserType {
        DenoiserType::Neural
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

    fn configure(&mut self, update: &DenoiserUpdate) -> PipelineResult<()> {
        if let Some(db) = update.atten_limit_db {
            self.atten_limit_db = db;
            if let Some(kernel) = self.kernel.as_mut() {
                kernel.set_atten_limit(db);
            }
        }
        if let Some(beta) = update.post_filter_beta {
            self.post_filter_beta = beta;
            if let Some(kernel) = self.kernel.as_mut() {
                kernel.set_post_filter_beta(beta);
            }
        }
        self.core.log.debug(&format!(
            "configured atten_limit={}dB beta={}",
            self.atten_limit_db, self.post_filter_beta
        ));
        Ok(())
    }
}
