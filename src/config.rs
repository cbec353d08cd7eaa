//! Workflow configuration
//!
//! Values come from an optional TOML file and are overridden by CLI flags.
//! Defaults reproduce the walkthrough: SDXL base at fp16 with on-demand
//! offload, trained with `train_dreambooth_lora_sdxl.py`.
//!
//! ```toml
//! [model]
//! id = "stabilityai/stable-diffusion-xl-base-1.0"
//! precision = "f16"
//! placement = "offload"
//!
//! [setup]
//! checkout_dir = "diffusers"
//!
//! [training]
//! instance_data_dir = "dog"
//! output_dir = "lora-trained-xl"
//! instance_prompt = "a photo of sks dog"
//! max_train_steps = 500
//!
//! [generation]
//! prompt = "A picture of sks dog in a bucket"
//! steps = 25
//! ```

use anyhow::{Context, Result};
use candle_core::DType;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::setup::SetupConfig;
use crate::trainer::{TrainerConfig, TrainingJob};

/// Default base model repository
pub const DEFAULT_MODEL_ID: &str = "stabilityai/stable-diffusion-xl-base-1.0";

/// VAE that stays finite at fp16 for SDXL
pub const SDXL_FP16_VAE_ID: &str = "madebyollin/sdxl-vae-fp16-fix";

/// Numeric precision of the model weights
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    F32,
    #[default]
    F16,
    Bf16,
}

impl Precision {
    pub fn dtype(self) -> DType {
        match self {
            Self::F32 => DType::F32,
            Self::F16 => DType::F16,
            Self::Bf16 => DType::BF16,
        }
    }

    /// Weight file variant published for this precision, if any
    pub fn default_variant(self) -> Option<&'static str> {
        match self {
            Self::F16 => Some("fp16"),
            Self::F32 | Self::Bf16 => None,
        }
    }

    /// Value for the trainer's `--mixed_precision` flag
    pub fn mixed_precision_flag(self) -> &'static str {
        match self {
            Self::F32 => "no",
            Self::F16 => "fp16",
            Self::Bf16 => "bf16",
        }
    }
}

/// Where model components live between uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PlacementPolicy {
    /// Build each component on the accelerator only while it runs, then drop it
    #[default]
    Offload,
    /// Build every component once at load time and keep it resident
    Pinned,
}

/// Stable Diffusion family the weights belong to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum ModelVersion {
    #[serde(rename = "v1-5")]
    #[value(name = "v1-5")]
    V1_5,
    #[serde(rename = "v2-1")]
    #[value(name = "v2-1")]
    V2_1,
    #[serde(rename = "xl")]
    #[value(name = "xl")]
    Xl,
}

impl ModelVersion {
    /// Guess the version from a repository id or directory name
    pub fn infer(model_id: &str) -> Self {
        let id = model_id.to_ascii_lowercase();
        if id.contains("xl") {
            Self::Xl
        } else if id.contains("2-1") || id.contains("2.1") {
            Self::V2_1
        } else {
            Self::V1_5
        }
    }

    pub fn default_steps(self) -> usize {
        match self {
            Self::V1_5 | Self::V2_1 => 50,
            Self::Xl => 30,
        }
    }

    pub fn default_guidance_scale(self) -> f64 {
        match self {
            Self::V1_5 | Self::V2_1 => 7.5,
            Self::Xl => 5.0,
        }
    }

    /// Square resolution the UNet was trained at
    pub fn native_resolution(self) -> u32 {
        match self {
            Self::V1_5 => 512,
            Self::V2_1 => 768,
            Self::Xl => 1024,
        }
    }

    /// Latent scaling factor applied before VAE decoding
    pub fn vae_scale(self) -> f64 {
        match self {
            Self::V1_5 | Self::V2_1 => 0.18215,
            Self::Xl => 0.13025,
        }
    }

    pub fn has_second_text_encoder(self) -> bool {
        matches!(self, Self::Xl)
    }
}

/// `[model]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Hub repository id or local diffusers directory
    pub id: String,
    pub revision: Option<String>,
    /// Inferred from `id` when unset
    pub version: Option<ModelVersion>,
    pub precision: Precision,
    /// Weight file variant; the precision's default when unset
    pub variant: Option<String>,
    pub placement: PlacementPolicy,
    /// Replacement VAE repository or directory
    pub vae: Option<String>,
    /// Run on CPU even when an accelerator is present
    pub cpu: bool,
    pub use_flash_attn: bool,
    pub sliced_attention_size: Option<usize>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            id: DEFAULT_MODEL_ID.to_string(),
            revision: None,
            version: None,
            precision: Precision::default(),
            variant: None,
            placement: PlacementPolicy::default(),
            vae: None,
            cpu: false,
            use_flash_attn: false,
            sliced_attention_size: None,
        }
    }
}

impl ModelConfig {
    pub fn version(&self) -> ModelVersion {
        self.version.unwrap_or_else(|| ModelVersion::infer(&self.id))
    }

    pub fn variant(&self) -> Option<&str> {
        match self.variant.as_deref() {
            Some("") | Some("none") => None,
            Some(variant) => Some(variant),
            None => self.precision.default_variant(),
        }
    }

    /// VAE source: explicit override, or the fp16-safe SDXL VAE at f16
    ///
    /// A local model directory keeps its own VAE unless `vae` is set, so
    /// an offline model never reaches the hub.
    pub fn vae_source(&self) -> Option<&str> {
        match self.vae.as_deref() {
            Some(vae) => Some(vae),
            None if self.version() == ModelVersion::Xl
                && self.precision == Precision::F16
                && !Path::new(&self.id).is_dir() =>
            {
                Some(SDXL_FP16_VAE_ID)
            }
            None => None,
        }
    }
}

/// `[generation]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub prompt: Option<String>,
    pub negative_prompt: Option<String>,
    pub steps: Option<usize>,
    pub guidance_scale: Option<f64>,
    pub seed: Option<u64>,
    pub width: Option<usize>,
    pub height: Option<usize>,
    /// LoRA strength used when an adapter is attached
    pub lora_scale: f32,
    pub output: PathBuf,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            prompt: None,
            negative_prompt: None,
            steps: None,
            guidance_scale: None,
            seed: None,
            width: None,
            height: None,
            lora_scale: 1.0,
            output: PathBuf::from("generated.png"),
        }
    }
}

/// Whole workflow file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub model: ModelConfig,
    pub setup: SetupConfig,
    pub trainer: TrainerConfig,
    pub training: TrainingJob,
    pub generation: GenerationConfig,
}

impl WorkflowConfig {
    /// Parse a TOML workflow file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read workflow config: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse workflow config: {}", path.display()))?;

        info!(path = %path.display(), model = %config.model.id, "Loaded workflow config");
        Ok(config)
    }

    /// Load `path` when given, otherwise start from defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                debug!("No workflow config given, using defaults");
                Ok(Self::default())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_follow_walkthrough() {
        let config = WorkflowConfig::default();
        assert_eq!(config.model.id, DEFAULT_MODEL_ID);
        assert_eq!(config.model.version(), ModelVersion::Xl);
        assert_eq!(config.model.variant(), Some("fp16"));
        assert_eq!(config.model.placement, PlacementPolicy::Offload);
        assert_eq!(config.model.vae_source(), Some(SDXL_FP16_VAE_ID));
        assert_eq!(config.generation.lora_scale, 1.0);
    }

    #[test]
    fn test_infer_version() {
        assert_eq!(ModelVersion::infer("runwayml/stable-diffusion-v1-5"), ModelVersion::V1_5);
        assert_eq!(ModelVersion::infer("stabilityai/stable-diffusion-2-1"), ModelVersion::V2_1);
        assert_eq!(ModelVersion::infer("stabilityai/stable-diffusion-xl-base-1.0"), ModelVersion::Xl);
        assert_eq!(ModelVersion::infer("base-model-A"), ModelVersion::V1_5);
    }

    #[test]
    fn test_variant_override() {
        let mut model = ModelConfig::default();
        model.variant = Some("none".to_string());
        assert_eq!(model.variant(), None);

        model.variant = None;
        model.precision = Precision::F32;
        assert_eq!(model.variant(), None);
        assert_eq!(model.vae_source(), None);
    }

    #[test]
    fn test_local_model_keeps_its_vae() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut model = ModelConfig {
            id: dir.path().display().to_string(),
            version: Some(ModelVersion::Xl),
            precision: Precision::F16,
            ..Default::default()
        };
        assert_eq!(model.vae_source(), None);

        model.vae = Some("local-vae".to_string());
        assert_eq!(model.vae_source(), Some("local-vae"));

        model.id = dir.path().join("missing").display().to_string();
        model.vae = None;
        assert_eq!(model.vae_source(), Some(SDXL_FP16_VAE_ID));
    }

    #[test]
    fn test_parse_partial_toml() {
        let toml = r#"
            [model]
            id = "runwayml/stable-diffusion-v1-5"
            precision = "f32"
            placement = "pinned"

            [training]
            instance_data_dir = "cube"
            instance_prompt = "a photo of sks cube"
            resolution = 512
            max_train_steps = 100

            [generation]
            prompt = "a photo of a red cube"
            steps = 50
        "#;

        let config: WorkflowConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.model.version(), ModelVersion::V1_5);
        assert_eq!(config.model.precision, Precision::F32);
        assert_eq!(config.model.placement, PlacementPolicy::Pinned);
        assert_eq!(config.training.instance_data_dir, PathBuf::from("cube"));
        assert_eq!(config.training.max_train_steps, 100);
        // Untouched fields keep their defaults
        assert_eq!(config.training.gradient_accumulation_steps, 4);
        assert_eq!(config.generation.steps, Some(50));
        assert_eq!(config.generation.output, PathBuf::from("generated.png"));
    }

    #[test]
    fn test_load_missing_file_fails() {
        let result = WorkflowConfig::load("/nonexistent/workflow.toml");
        assert!(result.is_err());
    }
}
