//! CLI entry point for DreamBooth-LoRA personalization

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use lora_personalize::compare::compare_with_without_lora;
use lora_personalize::config::{ModelVersion, PlacementPolicy, Precision, WorkflowConfig};
use lora_personalize::download::ModelDownloader;
use lora_personalize::lora::AdapterArtifact;
use lora_personalize::pipeline::{GenerateOptions, PipelineHandle};
use lora_personalize::setup::setup;
use lora_personalize::trainer::{fine_tune, LrSchedule};
use lora_personalize::workflow::{personalize_and_generate, training_job, RunOptions, DEFAULT_PROMPT};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lora-personalize")]
#[command(version)]
#[command(about = "Personalize Stable Diffusion with DreamBooth LoRA", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Workflow TOML file; flags override its values
    #[arg(long, global = true, env = "LORA_PERSONALIZE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Default)]
struct ModelArgs {
    /// Hub repository id or local diffusers directory
    #[arg(long, env = "MODEL_NAME")]
    model: Option<String>,

    /// Hub revision (branch, tag or commit)
    #[arg(long)]
    revision: Option<String>,

    /// Model family; guessed from the model id when omitted
    #[arg(long, value_enum)]
    model_version: Option<ModelVersion>,

    #[arg(long, value_enum)]
    precision: Option<Precision>,

    /// offload: build each component only while it runs; pinned: keep all resident
    #[arg(long, value_enum)]
    placement: Option<PlacementPolicy>,

    /// Weight file variant ("none" for plain weights)
    #[arg(long)]
    variant: Option<String>,

    /// Replacement VAE repository or directory
    #[arg(long)]
    vae: Option<String>,

    /// Run on CPU even if a GPU is available
    #[arg(long)]
    cpu: bool,

    #[arg(long)]
    use_flash_attn: bool,
}

impl ModelArgs {
    fn apply(&self, config: &mut WorkflowConfig) {
        let model = &mut config.model;
        if let Some(id) = &self.model {
            model.id = id.clone();
            config.training.pretrained_model = id.clone();
        }
        if let Some(revision) = &self.revision {
            model.revision = Some(revision.clone());
        }
        if let Some(version) = self.model_version {
            model.version = Some(version);
        }
        if let Some(precision) = self.precision {
            model.precision = precision;
            config.training.mixed_precision = precision;
        }
        if let Some(placement) = self.placement {
            model.placement = placement;
        }
        if let Some(variant) = &self.variant {
            model.variant = Some(variant.clone());
        }
        if let Some(vae) = &self.vae {
            model.vae = Some(vae.clone());
        }
        model.cpu |= self.cpu;
        model.use_flash_attn |= self.use_flash_attn;
    }
}

#[derive(Args, Debug, Default)]
struct GenerationArgs {
    /// Text prompt
    #[arg(short, long)]
    prompt: Option<String>,

    #[arg(long)]
    negative_prompt: Option<String>,

    /// Denoising steps (SD 1.5/2.1: 50, XL: 30 when omitted)
    #[arg(long)]
    steps: Option<usize>,

    #[arg(long)]
    guidance_scale: Option<f64>,

    /// Random seed for reproducibility
    #[arg(long)]
    seed: Option<u64>,

    #[arg(long)]
    width: Option<usize>,

    #[arg(long)]
    height: Option<usize>,

    /// LoRA strength (1.0 = full)
    #[arg(long)]
    lora_scale: Option<f32>,

    /// Output image path
    #[arg(short, long)]
    output: Option<PathBuf>,
}

impl GenerationArgs {
    fn apply(&self, config: &mut WorkflowConfig) {
        let generation = &mut config.generation;
        if let Some(prompt) = &self.prompt {
            generation.prompt = Some(prompt.clone());
        }
        if let Some(negative) = &self.negative_prompt {
            generation.negative_prompt = Some(negative.clone());
        }
        generation.steps = self.steps.or(generation.steps);
        generation.guidance_scale = self.guidance_scale.or(generation.guidance_scale);
        generation.seed = self.seed.or(generation.seed);
        generation.width = self.width.or(generation.width);
        generation.height = self.height.or(generation.height);
        if let Some(scale) = self.lora_scale {
            generation.lora_scale = scale;
        }
        if let Some(output) = &self.output {
            generation.output = output.clone();
        }
    }
}

#[derive(Args, Debug, Default)]
struct TrainArgs {
    /// Directory of subject images
    #[arg(long, env = "INSTANCE_DIR")]
    instance_data_dir: Option<PathBuf>,

    /// Where the trainer writes the adapter
    #[arg(long, env = "OUTPUT_DIR")]
    output_dir: Option<PathBuf>,

    /// Prompt binding the subject to a rare token, e.g. "a photo of sks dog"
    #[arg(long)]
    instance_prompt: Option<String>,

    #[arg(long)]
    resolution: Option<u32>,

    #[arg(long)]
    train_batch_size: Option<u32>,

    #[arg(long)]
    gradient_accumulation_steps: Option<u32>,

    #[arg(long)]
    learning_rate: Option<f64>,

    #[arg(long, value_enum)]
    lr_scheduler: Option<LrSchedule>,

    #[arg(long)]
    lr_warmup_steps: Option<u32>,

    #[arg(long)]
    max_train_steps: Option<u32>,

    /// Trainer seed
    #[arg(long)]
    train_seed: Option<u64>,

    /// LoRA rank
    #[arg(long)]
    rank: Option<u32>,

    #[arg(long)]
    train_text_encoder: bool,

    #[arg(long)]
    gradient_checkpointing: bool,

    #[arg(long)]
    use_8bit_adam: bool,

    /// Training script (default: the diffusers SDXL DreamBooth LoRA script)
    #[arg(long)]
    trainer_script: Option<PathBuf>,
}

impl TrainArgs {
    fn apply(&self, config: &mut WorkflowConfig) {
        let job = &mut config.training;
        if let Some(dir) = &self.instance_data_dir {
            job.instance_data_dir = dir.clone();
        }
        if let Some(dir) = &self.output_dir {
            job.output_dir = dir.clone();
        }
        if let Some(prompt) = &self.instance_prompt {
            job.instance_prompt = prompt.clone();
        }
        job.resolution = self.resolution.unwrap_or(job.resolution);
        job.train_batch_size = self.train_batch_size.unwrap_or(job.train_batch_size);
        job.gradient_accumulation_steps = self
            .gradient_accumulation_steps
            .unwrap_or(job.gradient_accumulation_steps);
        job.learning_rate = self.learning_rate.unwrap_or(job.learning_rate);
        job.lr_scheduler = self.lr_scheduler.unwrap_or(job.lr_scheduler);
        job.lr_warmup_steps = self.lr_warmup_steps.unwrap_or(job.lr_warmup_steps);
        job.max_train_steps = self.max_train_steps.unwrap_or(job.max_train_steps);
        job.seed = self.train_seed.or(job.seed);
        job.rank = self.rank.or(job.rank);
        job.train_text_encoder |= self.train_text_encoder;
        job.gradient_checkpointing |= self.gradient_checkpointing;
        job.use_8bit_adam |= self.use_8bit_adam;
        if let Some(script) = &self.trainer_script {
            config.trainer.script = script.clone();
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Clone and install the diffusers DreamBooth trainer
    ///
    /// Runs `git clone`, `pip install -e`, installs the SDXL DreamBooth
    /// requirements and writes a default accelerate config.
    Setup {
        /// Checkout directory
        #[arg(long)]
        checkout_dir: Option<PathBuf>,

        #[arg(long)]
        repo_url: Option<String>,
    },

    /// Download the base model files into the HuggingFace cache
    ///
    /// Uses the HF_TOKEN environment variable for gated repositories.
    Download {
        #[command(flatten)]
        model: ModelArgs,
    },

    /// Generate an image, optionally with a trained adapter
    Generate {
        #[command(flatten)]
        model: ModelArgs,

        #[command(flatten)]
        generation: GenerationArgs,

        /// Adapter directory or safetensors file
        #[arg(long)]
        lora: Option<PathBuf>,
    },

    /// Fine-tune a LoRA adapter on the instance images
    Train {
        #[command(flatten)]
        model: ModelArgs,

        #[command(flatten)]
        train: TrainArgs,
    },

    /// Full workflow: train, reload the base model, attach the adapter, generate
    Run {
        #[command(flatten)]
        model: ModelArgs,

        #[command(flatten)]
        train: TrainArgs,

        #[command(flatten)]
        generation: GenerationArgs,

        /// Also render the prompt with the base model before training
        #[arg(long)]
        baseline: bool,

        /// Reuse the adapter already in the output directory
        #[arg(long)]
        skip_training: bool,
    },

    /// Compare generation with/without the adapter (side-by-side)
    ///
    /// Both images use the same prompt and seed.
    Compare {
        #[command(flatten)]
        model: ModelArgs,

        /// Text prompt
        #[arg(short, long)]
        prompt: Option<String>,

        /// Adapter directory or safetensors file
        #[arg(short, long)]
        lora: PathBuf,

        /// LoRA strength (0.0-2.0)
        #[arg(short, long, default_value = "1.0")]
        strength: f32,

        #[arg(long)]
        steps: Option<usize>,

        /// Random seed for reproducibility
        #[arg(long, default_value = "42")]
        seed: u64,

        /// Output directory
        #[arg(short, long, default_value = "comparison")]
        output_dir: PathBuf,
    },
}

fn banner(title: &str) {
    println!();
    println!("════════════════════════════════════════════════════════");
    println!("{}", title);
    println!("════════════════════════════════════════════════════════");
    println!();
}

/// Print GPU memory so offload/pinned choices can be judged
#[cfg(feature = "cuda")]
fn print_gpu_info() {
    let gpu_info = std::process::Command::new("nvidia-smi")
        .args(["--query-gpu=index,name,memory.total,memory.free", "--format=csv,noheader,nounits"])
        .output();

    if let Ok(output) = gpu_info {
        if output.status.success() {
            println!("Available GPUs:");
            for line in String::from_utf8_lossy(&output.stdout).lines() {
                let parts: Vec<&str> = line.split(',').map(str::trim).collect();
                if parts.len() >= 4 {
                    println!(
                        "  GPU {}: {} - {}MB total, {}MB free",
                        parts[0], parts[1], parts[2], parts[3]
                    );
                }
            }
            println!();
        }
    }
}

#[cfg(not(feature = "cuda"))]
fn print_gpu_info() {}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = WorkflowConfig::load_or_default(cli.config.as_deref())?;

    match cli.command {
        Commands::Setup { checkout_dir, repo_url } => {
            if let Some(dir) = checkout_dir {
                config.setup.checkout_dir = dir;
            }
            if let Some(url) = repo_url {
                config.setup.repo_url = url;
            }

            banner("🔧 Installing the DreamBooth trainer");
            setup(&config.setup).await?;

            println!();
            println!("✓ Trainer installed in {}", config.setup.checkout_dir.display());
            println!();
        }

        Commands::Download { model } => {
            model.apply(&mut config);

            banner("📦 Model Downloader");
            println!("Model:     {}", config.model.id);
            println!("Precision: {:?}", config.model.precision);
            if let Some(vae) = config.model.vae_source() {
                println!("VAE:       {}", vae);
            }
            println!();

            let files = ModelDownloader::new()?.resolve(&config.model).await?;

            println!();
            println!("✓ All model files ready!");
            println!();
            println!("Model locations:");
            println!("  UNet:           {}", files.unet.display());
            println!("  VAE:            {}", files.vae.display());
            println!("  Text encoder:   {}", files.text_encoder.display());
            if let Some(path) = &files.text_encoder_2 {
                println!("  Text encoder 2: {}", path.display());
            }
            println!();
        }

        Commands::Generate { model, generation, lora } => {
            model.apply(&mut config);
            generation.apply(&mut config);
            let prompt = config
                .generation
                .prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_PROMPT.to_string());

            banner("🚀 Initializing pipeline");
            print_gpu_info();

            let adapter = lora.as_ref().map(AdapterArtifact::locate).transpose()?;
            let mut pipeline = PipelineHandle::load(&config.model).await?;
            if let Some(adapter) = &adapter {
                pipeline = pipeline.attach_adapter(adapter, config.generation.lora_scale)?;
            }

            let image = pipeline.generate(&prompt, &GenerateOptions::from(&config.generation))?;
            drop(pipeline);
            image.save(&config.generation.output)?;

            println!();
            println!("✨ Saved: {}", config.generation.output.display());
            println!();
        }

        Commands::Train { model, train } => {
            model.apply(&mut config);
            train.apply(&mut config);

            let job = training_job(&config);

            banner("🏋️  DreamBooth LoRA fine-tune");
            println!("Model:     {}", job.pretrained_model);
            println!("Images:    {}", job.instance_data_dir.display());
            println!("Prompt:    {}", job.instance_prompt);
            println!("Steps:     {}", job.max_train_steps);
            println!();

            let artifact = fine_tune(&config.trainer, &job).await?;

            println!();
            println!("✓ Adapter written: {}", artifact.weights.display());
            println!();
        }

        Commands::Run {
            model,
            train,
            generation,
            baseline,
            skip_training,
        } => {
            model.apply(&mut config);
            train.apply(&mut config);
            generation.apply(&mut config);

            banner("🚀 Personalize and generate");
            print_gpu_info();

            let report =
                personalize_and_generate(&config, &RunOptions { baseline, skip_training }).await?;

            println!();
            println!("════════════════════════════════════════════════════════");
            println!();
            println!("✨ Success!");
            if let Some(path) = &report.baseline {
                println!("  Baseline:  {}", path.display());
            }
            println!("  Adapter:   {}", report.adapter.weights.display());
            println!("  Image:     {}", report.output.display());
            println!();
        }

        Commands::Compare {
            model,
            prompt,
            lora,
            strength,
            steps,
            seed,
            output_dir,
        } => {
            model.apply(&mut config);

            if !(0.0..=2.0).contains(&strength) {
                eprintln!("⚠️  Warning: Strength {} is outside recommended range [0.0, 2.0]", strength);
            }

            let adapter = AdapterArtifact::locate(&lora)?;
            let prompt = prompt
                .or_else(|| config.generation.prompt.clone())
                .unwrap_or_else(|| DEFAULT_PROMPT.to_string());
            let options = GenerateOptions::from(&config.generation)
                .with_steps(steps.or(config.generation.steps))
                .with_seed(seed);

            banner("🚀 Base model vs. LoRA");
            print_gpu_info();

            let result =
                compare_with_without_lora(&config.model, &adapter, &prompt, &options, strength, &output_dir)
                    .await?;

            println!();
            println!("════════════════════════════════════════════════════════");
            println!();
            println!("✨ Success! Open these images side-by-side:");
            println!("  Baseline:  {}", result.baseline_path.display());
            println!("  With LoRA: {}", result.with_lora_path.display());
            println!();
        }
    }

    Ok(())
}
