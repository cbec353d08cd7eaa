//! The personalize-and-generate workflow
//!
//! Three stages, run strictly one after another:
//!
//! 1. [`load_base_pipeline`] and (optionally) a baseline [`generate`]
//! 2. [`fine_tune`] on the subject images
//! 3. [`load_base_pipeline`] again, [`attach_adapter`], [`generate`]
//!
//! The pipeline handle is moved from stage to stage and dropped as soon as
//! a stage is done with it, so at most one pipeline holds device memory.

use anyhow::Result;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::{ModelConfig, PlacementPolicy, Precision, WorkflowConfig};
use crate::lora::AdapterArtifact;
use crate::pipeline::{GenerateOptions, GeneratedImage, PipelineHandle};
use crate::trainer::TrainingJob;

pub use crate::trainer::fine_tune;

/// Prompt used when the workflow file names none
pub const DEFAULT_PROMPT: &str = "A picture of sks dog in a bucket";

/// Load `model_id` at `precision` with the given placement
pub async fn load_base_pipeline(
    model_id: &str,
    precision: Precision,
    placement: PlacementPolicy,
) -> Result<PipelineHandle> {
    let model = ModelConfig {
        id: model_id.to_string(),
        precision,
        placement,
        ..Default::default()
    };
    PipelineHandle::load(&model).await
}

/// Sample one image; `step_count` defaults to the model version's
///
/// Latents come from entropy, so repeated calls differ. Use
/// [`generate_seeded`] for a reproducible image.
pub fn generate(
    pipeline: &PipelineHandle,
    prompt: &str,
    step_count: Option<usize>,
) -> Result<GeneratedImage> {
    pipeline.generate(prompt, &sampling_options(step_count, None))
}

/// Like [`generate`], with latents drawn from `seed`
pub fn generate_seeded(
    pipeline: &PipelineHandle,
    prompt: &str,
    step_count: Option<usize>,
    seed: u64,
) -> Result<GeneratedImage> {
    pipeline.generate(prompt, &sampling_options(step_count, Some(seed)))
}

fn sampling_options(step_count: Option<usize>, seed: Option<u64>) -> GenerateOptions {
    let options = GenerateOptions::default().with_steps(step_count);
    match seed {
        Some(seed) => options.with_seed(seed),
        None => options,
    }
}

/// Fuse the adapter at `adapter_path` at full strength
pub fn attach_adapter(pipeline: PipelineHandle, adapter_path: &Path) -> Result<PipelineHandle> {
    let artifact = AdapterArtifact::locate(adapter_path)?;
    pipeline.attach_adapter(&artifact, 1.0)
}

/// Knobs of a full run
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Render the prompt with the base model before training
    pub baseline: bool,
    /// Reuse the adapter already in the training output directory
    pub skip_training: bool,
}

/// What a full run produced
#[derive(Debug, Clone)]
pub struct RunReport {
    pub baseline: Option<PathBuf>,
    pub adapter: AdapterArtifact,
    pub output: PathBuf,
}

/// `baseline.png` next to the main output
pub fn baseline_path(output: &Path) -> PathBuf {
    output.with_file_name("baseline.png")
}

/// The training job with model details filled in from `[model]`
///
/// When both stages use the same base model the job inherits its version
/// (for the resolution check) and its VAE override.
pub fn training_job(config: &WorkflowConfig) -> TrainingJob {
    let mut job = config.training.clone();
    if job.pretrained_model == config.model.id {
        job.model_version.get_or_insert(config.model.version());
        if job.pretrained_vae.is_none() {
            job.pretrained_vae = config.model.vae_source().map(str::to_string);
        }
    } else {
        warn!(
            trained = %job.pretrained_model,
            inference = %config.model.id,
            "Training and inference use different base models"
        );
    }
    job
}

/// Run every stage described by `config`
pub async fn personalize_and_generate(
    config: &WorkflowConfig,
    options: &RunOptions,
) -> Result<RunReport> {
    let prompt = config
        .generation
        .prompt
        .as_deref()
        .unwrap_or(DEFAULT_PROMPT);
    let generate_options = GenerateOptions::from(&config.generation);
    // Fail on a bad prompt before spending time on downloads or training
    generate_options.resolve(prompt, config.model.version())?;

    let job = training_job(config);

    let baseline = if options.baseline {
        info!("Stage 1/3: Baseline generation");
        let pipeline = PipelineHandle::load(&config.model).await?;
        let image = pipeline.generate(prompt, &generate_options)?;
        drop(pipeline);

        let path = baseline_path(&config.generation.output);
        image.save(&path)?;
        Some(path)
    } else {
        None
    };

    let adapter = if options.skip_training {
        info!(dir = %job.output_dir.display(), "Stage 2/3: Reusing trained adapter");
        AdapterArtifact::locate(&job.output_dir)?
    } else {
        info!("Stage 2/3: Fine-tuning");
        fine_tune(&config.trainer, &job).await?
    };

    info!("Stage 3/3: Generation with adapter");
    let pipeline = PipelineHandle::load(&config.model)
        .await?
        .attach_adapter(&adapter, config.generation.lora_scale)?;
    let image = pipeline.generate(prompt, &generate_options)?;
    drop(pipeline);

    image.save(&config.generation.output)?;

    Ok(RunReport {
        baseline,
        adapter,
        output: config.generation.output.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModelVersion, SDXL_FP16_VAE_ID};
    use crate::error::WorkflowError;
    use tempfile::TempDir;

    fn config_in(root: &Path) -> WorkflowConfig {
        let mut config = WorkflowConfig::default();
        config.training.instance_data_dir = root.join("dog");
        config.training.output_dir = root.join("lora-trained-xl");
        config.generation.output = root.join("out").join("generated.png");
        config
    }

    #[test]
    fn test_baseline_path() {
        assert_eq!(
            baseline_path(Path::new("out/generated.png")),
            PathBuf::from("out/baseline.png")
        );
    }

    #[test]
    fn test_training_job_inherits_model_details() {
        let config = WorkflowConfig::default();
        let job = training_job(&config);
        assert_eq!(job.model_version, Some(ModelVersion::Xl));
        assert_eq!(job.pretrained_vae.as_deref(), Some(SDXL_FP16_VAE_ID));

        let mut config = WorkflowConfig::default();
        config.training.pretrained_model = "runwayml/stable-diffusion-v1-5".to_string();
        let job = training_job(&config);
        assert_eq!(job.model_version, None);
        assert_eq!(job.pretrained_vae, None);
    }

    #[test]
    fn test_sampling_options_carry_seed() {
        let seeded = sampling_options(Some(12), Some(7));
        assert_eq!(seeded.seed, Some(7));
        assert_eq!(seeded.steps, Some(12));

        let sampling = seeded.resolve("a red cube", ModelVersion::V1_5).unwrap();
        assert_eq!((sampling.seed, sampling.steps), (Some(7), 12));

        let unseeded = sampling_options(None, None);
        assert_eq!(unseeded.seed, None);
        assert_eq!(unseeded.steps, None);
    }

    #[tokio::test]
    async fn test_run_rejects_empty_prompt_first() {
        let root = TempDir::new().unwrap();
        let mut config = config_in(root.path());
        config.generation.prompt = Some(String::new());

        let err = personalize_and_generate(&config, &RunOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<WorkflowError>(),
            Some(WorkflowError::EmptyPrompt)
        ));
    }

    #[tokio::test]
    async fn test_run_without_adapter_stops_before_inference() {
        let root = TempDir::new().unwrap();
        let config = config_in(root.path());
        std::fs::create_dir_all(&config.training.output_dir).unwrap();

        let options = RunOptions {
            baseline: false,
            skip_training: true,
        };
        let err = personalize_and_generate(&config, &options).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<WorkflowError>(),
            Some(WorkflowError::MissingAdapter(_))
        ));
        assert!(!config.generation.output.exists());
    }

    #[tokio::test]
    async fn test_run_stops_on_empty_instance_dir() {
        let root = TempDir::new().unwrap();
        let config = config_in(root.path());
        std::fs::create_dir_all(&config.training.instance_data_dir).unwrap();
        std::fs::write(config.training.instance_data_dir.join(".gitkeep"), "").unwrap();

        let err = personalize_and_generate(&config, &RunOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<WorkflowError>(),
            Some(WorkflowError::EmptyInstanceDir(_))
        ));
    }

    /// Base model only: two seeded runs render the same image
    #[tokio::test]
    #[ignore = "downloads several GB of model weights"]
    async fn test_base_generation_is_reproducible() {
        let model = ModelConfig {
            id: "runwayml/stable-diffusion-v1-5".to_string(),
            placement: PlacementPolicy::Offload,
            ..Default::default()
        };
        let pipeline = PipelineHandle::load(&model).await.unwrap();
        let options = GenerateOptions {
            steps: Some(10),
            seed: Some(7),
            width: Some(256),
            height: Some(256),
            ..Default::default()
        };

        let first = pipeline.generate("a photo of a red cube", &options).unwrap();
        let second = pipeline.generate("a photo of a red cube", &options).unwrap();
        assert_eq!((first.width, first.height), (256, 256));
        assert_eq!(first, second);
    }

    /// Adapter directory from a previous run, given by `LORA_ADAPTER_DIR`
    #[tokio::test]
    #[ignore = "needs model weights and a trained adapter"]
    async fn test_adapter_changes_output() {
        let dir = std::env::var("LORA_ADAPTER_DIR").unwrap();
        let pipeline = load_base_pipeline(
            crate::config::DEFAULT_MODEL_ID,
            Precision::F16,
            PlacementPolicy::Offload,
        )
        .await
        .unwrap();
        let baseline = generate_seeded(&pipeline, DEFAULT_PROMPT, Some(25), 0).unwrap();

        let pipeline = attach_adapter(pipeline, Path::new(&dir)).unwrap();
        let adapted = generate_seeded(&pipeline, DEFAULT_PROMPT, Some(25), 0).unwrap();
        assert_ne!(baseline, adapted);

        let err = attach_adapter(pipeline, Path::new(&dir)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<WorkflowError>(),
            Some(WorkflowError::AdapterAlreadyAttached(_))
        ));
    }
}
