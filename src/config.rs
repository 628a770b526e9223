//! Configuration surface for denoisers and the track processor.
//!
//! Options are plain serde-friendly bags. Unset fields fall back to the
//! per-component defaults when the factory constructs an instance, which is
//! how supplied configuration merges over registry defaults.

use serde::{Deserialize, Serialize};

/// Default base location of the neural model artifact.
pub const DEFAULT_ASSETS_PATH: &str = "./models";

/// Default neural model artifact name at the assets location.
pub const DEFAULT_MODEL_FILE: &str = "denoiser_model.onnx.gz";

/// Default neural attenuation limit in dB. Tuned for natural speech; higher
/// is more aggressive.
pub const DEFAULT_ATTEN_LIMIT_DB: f32 = 18.0;

/// Default neural post-filter strength. 0 disables the post-filter.
pub const DEFAULT_POST_FILTER_BETA: f32 = 0.03;

/// Option bag accepted by the denoiser factory. Fields left `None` take the
/// defaults of the selected denoiser type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DenoiserOptions {
    /// Base location of the neural model artifact: a directory path or an
    /// http(s) URL prefix.
    pub assets_path: Option<String>,

    /// Override for the model artifact file name.
    pub model_file_name: Option<String>,

    /// Prefer the SIMD kernel flavor when the CPU supports it.
    pub prefer_simd: Option<bool>,

    /// Neural attenuation limit in dB.
    pub atten_limit_db: Option<f32>,

    /// Neural post-filter beta. 0 disables.
    pub post_filter_beta: Option<f32>,

    /// Verbose per-instance logging.
    pub debug: bool,

    /// Session identifier carried into log context.
    pub session_id: Option<String>,
}

impl DenoiserOptions {
    /// Resolved model artifact location (assets path + file name).
    pub fn model_location(&self) -> String {
        let base = self.assets_path.as_deref().unwrap_or(DEFAULT_ASSETS_PATH);
        let file = self.model_file_name.as_deref().unwrap_or(DEFAULT_MODEL_FILE);
        if base.is_empty() {
            return file.to_string();
        }
        format!("{}/{}", base.trim_end_matches('/'), file)
    }

    pub fn prefer_simd(&self) -> bool {
        self.prefer_simd.unwrap_or(true)
    }

    pub fn atten_limit_db(&self) -> f32 {
        self.atten_limit_db.unwrap_or(DEFAULT_ATTEN_LIMIT_DB)
    }

    pub fn post_filter_beta(&self) -> f32 {
        self.post_filter_beta.unwrap_or(DEFAULT_POST_FILTER_BETA)
    }
}

/// Runtime reconfiguration accepted after `initialize`. Only the neural
/// denoiser acts on these; others ignore them.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DenoiserUpdate {
    pub atten_limit_db: Option<f32>,
    pub post_filter_beta: Option<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_location_joins_and_defaults() {
        let mut opts = DenoiserOptions::default();
        assert_eq!(
            opts.model_location(),
            format!("{DEFAULT_ASSETS_PATH}/{DEFAULT_MODEL_FILE}")
        );

        opts.assets_path = Some("./assets/".to_string());
        assert_eq!(
            opts.model_location(),
            format!("./assets/{DEFAULT_MODEL_FILE}")
        );

        opts.model_file_name = Some("df3.onnx.gz".to_string());
        assert_eq!(opts.model_location(), "./assets/df3.onnx.gz");
    }

    #[test]
    fn defaults_merge_under_supplied_values() {
        let opts = DenoiserOptions {
            atten_limit_db: Some(24.0),
            ..Default::default()
        };
        assert_eq!(opts.atten_limit_db(), 24.0);
        assert_eq!(opts.post_filter_beta(), DEFAULT_POST_FILTER_BETA);
        assert!(opts.prefer_simd());
    }
}
