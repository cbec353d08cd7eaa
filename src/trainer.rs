//! DreamBooth LoRA fine-tuning through an external trainer
//!
//! The training loop itself lives in the trainer program (by default
//! `accelerate launch train_dreambooth_lora_sdxl.py` from a diffusers
//! checkout). This module turns a [`TrainingJob`] into that program's
//! command line, runs it to completion, and checks that it actually left an
//! adapter behind.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::SystemTime;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::{ModelVersion, Precision, DEFAULT_MODEL_ID};
use crate::error::WorkflowError;
use crate::lora::AdapterArtifact;

/// Placeholder file a fresh checkout ships in empty data directories
pub const PLACEHOLDER_FILE: &str = ".gitkeep";

/// Job manifest written next to the adapter after a successful run
pub const JOB_MANIFEST_FILE: &str = "training_job.json";

/// Learning-rate schedules understood by the diffusers trainers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum LrSchedule {
    #[default]
    Constant,
    ConstantWithWarmup,
    Linear,
    Cosine,
    CosineWithRestarts,
    Polynomial,
}

impl LrSchedule {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Constant => "constant",
            Self::ConstantWithWarmup => "constant_with_warmup",
            Self::Linear => "linear",
            Self::Cosine => "cosine",
            Self::CosineWithRestarts => "cosine_with_restarts",
            Self::Polynomial => "polynomial",
        }
    }
}

/// Named parameters handed to the trainer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingJob {
    pub pretrained_model: String,
    pub pretrained_vae: Option<String>,
    /// Native resolution check is skipped when unknown
    pub model_version: Option<ModelVersion>,
    pub instance_data_dir: PathBuf,
    pub output_dir: PathBuf,
    pub mixed_precision: Precision,
    pub instance_prompt: String,
    pub resolution: u32,
    pub train_batch_size: u32,
    pub gradient_accumulation_steps: u32,
    pub learning_rate: f64,
    pub lr_scheduler: LrSchedule,
    pub lr_warmup_steps: u32,
    pub max_train_steps: u32,
    pub seed: Option<u64>,
    /// LoRA rank; the trainer's default when unset
    pub rank: Option<u32>,
    pub train_text_encoder: bool,
    pub gradient_checkpointing: bool,
    pub use_8bit_adam: bool,
    pub validation_prompt: Option<String>,
    pub validation_epochs: Option<u32>,
    pub checkpointing_steps: Option<u32>,
}

impl Default for TrainingJob {
    fn default() -> Self {
        Self {
            pretrained_model: DEFAULT_MODEL_ID.to_string(),
            pretrained_vae: None,
            model_version: None,
            instance_data_dir: PathBuf::from("dog"),
            output_dir: PathBuf::from("lora-trained-xl"),
            mixed_precision: Precision::F16,
            instance_prompt: "a photo of sks dog".to_string(),
            resolution: 1024,
            train_batch_size: 1,
            gradient_accumulation_steps: 4,
            learning_rate: 1e-4,
            lr_scheduler: LrSchedule::Constant,
            lr_warmup_steps: 0,
            max_train_steps: 500,
            seed: Some(0),
            rank: None,
            train_text_encoder: false,
            gradient_checkpointing: false,
            use_8bit_adam: false,
            validation_prompt: None,
            validation_epochs: None,
            checkpointing_steps: None,
        }
    }
}

impl TrainingJob {
    /// Samples contributing to one optimizer step
    pub fn effective_batch_size(&self) -> u32 {
        self.train_batch_size * self.gradient_accumulation_steps
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| -> Result<()> { Err(WorkflowError::InvalidJob(reason).into()) };

        if self.pretrained_model.trim().is_empty() {
            return invalid("pretrained_model is required".to_string());
        }
        if self.instance_prompt.trim().is_empty() {
            return invalid("instance_prompt is required".to_string());
        }
        if self.resolution == 0 || self.resolution % 8 != 0 {
            return invalid(format!(
                "resolution must be a positive multiple of 8, got {}",
                self.resolution
            ));
        }
        if let Some(version) = self.model_version {
            if self.resolution != version.native_resolution() {
                return invalid(format!(
                    "resolution {} does not match the base model's {}",
                    self.resolution,
                    version.native_resolution()
                ));
            }
        }
        if self.train_batch_size == 0 {
            return invalid("train_batch_size must be >= 1".to_string());
        }
        if self.gradient_accumulation_steps == 0 {
            return invalid("gradient_accumulation_steps must be >= 1".to_string());
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return invalid("learning_rate must be > 0".to_string());
        }
        if self.max_train_steps == 0 {
            return invalid("max_train_steps must be >= 1".to_string());
        }
        if self.rank == Some(0) {
            return invalid("rank must be >= 1".to_string());
        }
        Ok(())
    }

    /// Trainer flags, one `--name=value` per parameter
    pub fn trainer_args(&self) -> Vec<String> {
        let mut args = vec![
            flag("pretrained_model_name_or_path", &self.pretrained_model),
            flag("instance_data_dir", self.instance_data_dir.display()),
            flag("output_dir", self.output_dir.display()),
            flag("mixed_precision", self.mixed_precision.mixed_precision_flag()),
            flag("instance_prompt", &self.instance_prompt),
            flag("resolution", self.resolution),
            flag("train_batch_size", self.train_batch_size),
            flag("gradient_accumulation_steps", self.gradient_accumulation_steps),
            flag("learning_rate", self.learning_rate),
            flag("lr_scheduler", self.lr_scheduler.as_str()),
            flag("lr_warmup_steps", self.lr_warmup_steps),
            flag("max_train_steps", self.max_train_steps),
        ];

        if let Some(vae) = &self.pretrained_vae {
            args.push(flag("pretrained_vae_model_name_or_path", vae));
        }
        if let Some(seed) = self.seed {
            args.push(flag("seed", seed));
        }
        if let Some(rank) = self.rank {
            args.push(flag("rank", rank));
        }
        if let Some(prompt) = &self.validation_prompt {
            args.push(flag("validation_prompt", prompt));
        }
        if let Some(epochs) = self.validation_epochs {
            args.push(flag("validation_epochs", epochs));
        }
        if let Some(steps) = self.checkpointing_steps {
            args.push(flag("checkpointing_steps", steps));
        }
        if self.train_text_encoder {
            args.push("--train_text_encoder".to_string());
        }
        if self.gradient_checkpointing {
            args.push("--gradient_checkpointing".to_string());
        }
        if self.use_8bit_adam {
            args.push("--use_8bit_adam".to_string());
        }

        args
    }
}

fn flag(name: &str, value: impl std::fmt::Display) -> String {
    format!("--{name}={value}")
}

/// How the trainer program is launched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    /// Launcher executable
    pub program: String,
    /// Arguments placed between the launcher and the script
    pub launcher_args: Vec<String>,
    /// Training script
    pub script: PathBuf,
    pub working_dir: Option<PathBuf>,
    /// Extra flags appended after the job's own
    pub extra_args: Vec<String>,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            program: "accelerate".to_string(),
            launcher_args: vec!["launch".to_string()],
            script: PathBuf::from("diffusers/examples/dreambooth/train_dreambooth_lora_sdxl.py"),
            working_dir: None,
            extra_args: Vec::new(),
        }
    }
}

impl TrainerConfig {
    /// Full argument vector after the program name
    pub fn args(&self, job: &TrainingJob) -> Vec<String> {
        let mut args = self.launcher_args.clone();
        args.push(self.script.display().to_string());
        args.extend(job.trainer_args());
        args.extend(self.extra_args.iter().cloned());
        args
    }

    fn command(&self, job: &TrainingJob) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(self.args(job))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        command
    }
}

/// Make the instance directory usable and return the images it holds
///
/// Removes the checkout placeholder and confirms it is gone, then requires at
/// least one image file. Images smaller than `resolution` on either side are
/// reported, since the trainer upscales them.
pub fn prepare_instance_dir(dir: &Path, resolution: u32) -> Result<Vec<PathBuf>> {
    let placeholder = dir.join(PLACEHOLDER_FILE);
    if placeholder.exists() {
        std::fs::remove_file(&placeholder)
            .with_context(|| format!("Failed to remove placeholder: {}", placeholder.display()))?;
        if placeholder.exists() {
            return Err(WorkflowError::PlaceholderNotRemoved(placeholder).into());
        }
        debug!(path = %placeholder.display(), "Removed placeholder");
    }

    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read instance data dir: {}", dir.display()))?;

    let mut images = Vec::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let hidden = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with('.'));
        if hidden || !entry.file_type()?.is_file() {
            continue;
        }
        if image::ImageFormat::from_path(&path).is_ok() {
            images.push(path);
        }
    }
    images.sort();

    if images.is_empty() {
        return Err(WorkflowError::EmptyInstanceDir(dir.to_path_buf()).into());
    }

    for path in &images {
        match image::image_dimensions(path) {
            Ok((w, h)) if w.min(h) < resolution => {
                warn!(
                    path = %path.display(),
                    size = format!("{}x{}", w, h),
                    resolution = resolution,
                    "Instance image is smaller than the training resolution"
                );
            }
            Ok(_) => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Could not read instance image"),
        }
    }

    info!(dir = %dir.display(), images = images.len(), "Instance data ready");
    Ok(images)
}

/// Run the trainer for `job` and return the adapter it produced
///
/// Blocks until the trainer exits. There is no timeout and no cancellation;
/// a hung trainer hangs the caller. An adapter left in the output directory
/// by an earlier run is deleted first, and any other weights file that the
/// trainer did not touch is rejected, so old weights are never mistaken for
/// this run's result.
pub async fn fine_tune(trainer: &TrainerConfig, job: &TrainingJob) -> Result<AdapterArtifact> {
    job.validate()?;
    let images = prepare_instance_dir(&job.instance_data_dir, job.resolution)?;

    std::fs::create_dir_all(&job.output_dir)
        .with_context(|| format!("Failed to create output dir: {}", job.output_dir.display()))?;

    let stale = AdapterArtifact::default_weights_path(&job.output_dir);
    if stale.exists() {
        warn!(path = %stale.display(), "Removing adapter from a previous run");
        std::fs::remove_file(&stale)
            .with_context(|| format!("Failed to remove stale adapter: {}", stale.display()))?;
    }
    let previous = weight_files(&job.output_dir)?;

    info!(
        model = %job.pretrained_model,
        images = images.len(),
        prompt = %job.instance_prompt,
        resolution = job.resolution,
        effective_batch = job.effective_batch_size(),
        max_steps = job.max_train_steps,
        "Starting fine-tune"
    );
    debug!(program = %trainer.program, args = ?trainer.args(job), "Trainer command");

    let mut child = trainer
        .command(job)
        .spawn()
        .with_context(|| format!("Failed to launch trainer `{}`", trainer.program))?;

    let stdout = child.stdout.take().map(|s| tokio::spawn(forward_lines(s, "stdout")));
    let stderr = child.stderr.take().map(|s| tokio::spawn(forward_lines(s, "stderr")));

    let status = child.wait().await.context("Failed to wait for trainer")?;

    for task in [stdout, stderr].into_iter().flatten() {
        task.await.context("Trainer output task panicked")??;
    }

    if !status.success() {
        return Err(WorkflowError::TrainerFailed { status }.into());
    }

    let artifact = AdapterArtifact::locate(&job.output_dir)?;
    let untouched = match previous.get(&artifact.weights) {
        Some(before) => fingerprint(&artifact.weights)? == *before,
        None => false,
    };
    if untouched {
        warn!(path = %artifact.weights.display(), "Trainer left only weights from an earlier run");
        return Err(WorkflowError::MissingAdapter(job.output_dir.clone()).into());
    }

    let manifest = job.output_dir.join(JOB_MANIFEST_FILE);
    std::fs::write(&manifest, serde_json::to_string_pretty(job)?)
        .with_context(|| format!("Failed to write job manifest: {}", manifest.display()))?;

    info!(adapter = %artifact.weights.display(), "✓ Fine-tune complete");
    Ok(artifact)
}

/// Relay a child stream into the log, one event per line
///
/// Lines are decoded lossily and the stream is always read to EOF.
pub(crate) async fn forward_lines<R: AsyncRead + Unpin>(stream: R, name: &'static str) -> Result<()> {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            break;
        }
        let line = String::from_utf8_lossy(&buf);
        info!(target: "trainer", stream = name, "{}", line.trim_end_matches(['\n', '\r']));
    }
    Ok(())
}

type Fingerprint = (u64, Option<SystemTime>);

fn fingerprint(path: &Path) -> Result<Fingerprint> {
    let meta = std::fs::metadata(path)
        .with_context(|| format!("Failed to stat weights: {}", path.display()))?;
    Ok((meta.len(), meta.modified().ok()))
}

/// Fingerprints of the `.safetensors` files already in `dir`
fn weight_files(dir: &Path) -> Result<HashMap<PathBuf, Fingerprint>> {
    let mut files = HashMap::new();
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read output dir: {}", dir.display()))?
    {
        let path = entry?.path();
        if path.is_file() && path.extension().and_then(|e| e.to_str()) == Some("safetensors") {
            let print = fingerprint(&path)?;
            files.insert(path, print);
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_images(dir: &Path, count: usize) {
        std::fs::create_dir_all(dir).unwrap();
        for i in 0..count {
            image::RgbImage::new(8, 8)
                .save(dir.join(format!("{}.png", i)))
                .unwrap();
        }
    }

    fn job_in(root: &Path) -> TrainingJob {
        TrainingJob {
            pretrained_model: "base-model-A".to_string(),
            model_version: Some(ModelVersion::V1_5),
            instance_data_dir: root.join("instance"),
            output_dir: root.join("out"),
            resolution: 512,
            max_train_steps: 100,
            ..Default::default()
        }
    }

    /// Trainer stand-in: writes an adapter into `--output_dir`
    #[cfg(unix)]
    fn fake_trainer(root: &Path, body: &str) -> TrainerConfig {
        let script = root.join("train.sh");
        std::fs::write(
            &script,
            format!(
                "for arg in \"$@\"; do\n  case \"$arg\" in\n    --output_dir=*) out=\"${{arg#--output_dir=}}\" ;;\n  esac\ndone\necho \"training into $out\"\n{}\n",
                body
            ),
        )
        .unwrap();

        TrainerConfig {
            program: "sh".to_string(),
            launcher_args: Vec::new(),
            script,
            working_dir: None,
            extra_args: Vec::new(),
        }
    }

    #[test]
    fn test_default_job_matches_walkthrough() {
        let job = TrainingJob::default();
        assert_eq!(job.effective_batch_size(), 4);
        assert_eq!(job.resolution, 1024);
        assert!(job.validate().is_ok());
    }

    #[test]
    fn test_trainer_args() {
        let job = TrainingJob {
            rank: Some(8),
            train_text_encoder: true,
            ..Default::default()
        };
        let args = job.trainer_args();

        assert!(args.contains(&"--pretrained_model_name_or_path=stabilityai/stable-diffusion-xl-base-1.0".to_string()));
        assert!(args.contains(&"--instance_prompt=a photo of sks dog".to_string()));
        assert!(args.contains(&"--mixed_precision=fp16".to_string()));
        assert!(args.contains(&"--lr_scheduler=constant".to_string()));
        assert!(args.contains(&"--learning_rate=0.0001".to_string()));
        assert!(args.contains(&"--seed=0".to_string()));
        assert!(args.contains(&"--rank=8".to_string()));
        assert!(args.contains(&"--train_text_encoder".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("--pretrained_vae")));
    }

    #[test]
    fn test_launcher_args_order() {
        let trainer = TrainerConfig::default();
        let args = trainer.args(&TrainingJob::default());
        assert_eq!(args[0], "launch");
        assert!(args[1].ends_with("train_dreambooth_lora_sdxl.py"));
        assert!(args[2].starts_with("--"));
    }

    #[test]
    fn test_validate_rejects_bad_jobs() {
        let cases = [
            TrainingJob { instance_prompt: "  ".to_string(), ..Default::default() },
            TrainingJob { resolution: 1000, ..Default::default() },
            TrainingJob { train_batch_size: 0, ..Default::default() },
            TrainingJob { gradient_accumulation_steps: 0, ..Default::default() },
            TrainingJob { learning_rate: f64::NAN, ..Default::default() },
            TrainingJob { max_train_steps: 0, ..Default::default() },
            TrainingJob {
                model_version: Some(ModelVersion::Xl),
                resolution: 512,
                ..Default::default()
            },
        ];

        for job in cases {
            let err = job.validate().unwrap_err();
            assert!(matches!(
                err.downcast_ref::<WorkflowError>(),
                Some(WorkflowError::InvalidJob(_))
            ));
        }
    }

    #[test]
    fn test_prepare_removes_placeholder() {
        let dir = TempDir::new().unwrap();
        write_images(dir.path(), 3);
        std::fs::write(dir.path().join(PLACEHOLDER_FILE), "").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not an image").unwrap();

        let images = prepare_instance_dir(dir.path(), 512).unwrap();
        assert_eq!(images.len(), 3);
        assert!(!dir.path().join(PLACEHOLDER_FILE).exists());
    }

    #[test]
    fn test_prepare_rejects_placeholder_only_dir() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(PLACEHOLDER_FILE), "").unwrap();

        let err = prepare_instance_dir(dir.path(), 512).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<WorkflowError>(),
            Some(WorkflowError::EmptyInstanceDir(_))
        ));
    }

    #[tokio::test]
    async fn test_fine_tune_fails_on_empty_instance_dir() {
        let root = TempDir::new().unwrap();
        let job = job_in(root.path());
        std::fs::create_dir_all(&job.instance_data_dir).unwrap();

        let err = fine_tune(&TrainerConfig::default(), &job).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<WorkflowError>(),
            Some(WorkflowError::EmptyInstanceDir(_))
        ));
        assert!(!job.output_dir.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_fine_tune_returns_adapter_dir() {
        let root = TempDir::new().unwrap();
        let job = job_in(root.path());
        write_images(&job.instance_data_dir, 8);
        let trainer = fake_trainer(
            root.path(),
            "mkdir -p \"$out\" && printf 'weights' > \"$out/pytorch_lora_weights.safetensors\"",
        );

        let artifact = fine_tune(&trainer, &job).await.unwrap();
        assert_eq!(artifact.dir, job.output_dir);
        assert!(artifact.dir.starts_with(root.path()));
        assert!(std::fs::metadata(&artifact.weights).unwrap().len() > 0);

        let manifest = std::fs::read_to_string(job.output_dir.join(JOB_MANIFEST_FILE)).unwrap();
        let recorded: TrainingJob = serde_json::from_str(&manifest).unwrap();
        assert_eq!(recorded, job);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_fine_tune_reports_trainer_failure() {
        let root = TempDir::new().unwrap();
        let job = job_in(root.path());
        write_images(&job.instance_data_dir, 2);
        let trainer = fake_trainer(root.path(), "echo 'CUDA out of memory' >&2; exit 3");

        let err = fine_tune(&trainer, &job).await.unwrap_err();
        match err.downcast_ref::<WorkflowError>() {
            Some(WorkflowError::TrainerFailed { status }) => assert_eq!(status.code(), Some(3)),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_fine_tune_ignores_stale_adapter() {
        let root = TempDir::new().unwrap();
        let job = job_in(root.path());
        write_images(&job.instance_data_dir, 2);
        std::fs::create_dir_all(&job.output_dir).unwrap();
        std::fs::write(AdapterArtifact::default_weights_path(&job.output_dir), "old").unwrap();

        // Exits cleanly without writing anything
        let trainer = fake_trainer(root.path(), "true");

        let err = fine_tune(&trainer, &job).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<WorkflowError>(),
            Some(WorkflowError::MissingAdapter(_))
        ));

        // Weights under a custom name are not deleted, but must not pass either
        std::fs::write(job.output_dir.join("old_run.safetensors"), "old").unwrap();
        let err = fine_tune(&trainer, &job).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<WorkflowError>(),
            Some(WorkflowError::MissingAdapter(_))
        ));
        assert!(job.output_dir.join("old_run.safetensors").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_fine_tune_survives_non_utf8_output() {
        let root = TempDir::new().unwrap();
        let job = job_in(root.path());
        write_images(&job.instance_data_dir, 2);
        let trainer = fake_trainer(
            root.path(),
            "printf 'step 1 \\377\\n' >&2; printf 'loss \\376 0.1\\n'; \
             for i in 1 2 3 4 5; do echo \"step $i\" >&2; done; \
             mkdir -p \"$out\" && printf 'weights' > \"$out/pytorch_lora_weights.safetensors\"",
        );

        let artifact = fine_tune(&trainer, &job).await.unwrap();
        assert!(std::fs::metadata(&artifact.weights).unwrap().len() > 0);
    }

    #[tokio::test]
    async fn test_forward_lines_drains_invalid_utf8() {
        let input: &[u8] = b"ok\n\xff\xfe bad\nlast line without newline";
        forward_lines(input, "stdout").await.unwrap();
    }
}
