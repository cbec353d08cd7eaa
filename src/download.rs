//! Model file resolution from the HuggingFace Hub or a local directory
//!
//! A diffusers repository stores each pipeline component in its own folder:
//!
//! ```text
//! model/
//! ├── unet/diffusion_pytorch_model[.fp16].safetensors
//! ├── vae/diffusion_pytorch_model[.fp16].safetensors
//! ├── text_encoder/model[.fp16].safetensors
//! └── text_encoder_2/model[.fp16].safetensors   (SDXL only)
//! ```
//!
//! Tokenizers come from the CLIP repositories the encoders were trained with.

use anyhow::{Context, Result};
use hf_hub::api::tokio::{Api, ApiBuilder, ApiRepo};
use hf_hub::{Repo, RepoType};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::{ModelConfig, ModelVersion};
use crate::error::WorkflowError;

const CLIP_TOKENIZER_REPO: &str = "openai/clip-vit-large-patch14";
const CLIP2_TOKENIZER_REPO: &str = "laion/CLIP-ViT-bigG-14-laion2B-39B-b160k";

/// File name of a component's weights, with the precision variant infix
pub fn weights_file_name(stem: &str, variant: Option<&str>) -> String {
    match variant {
        Some(variant) => format!("{}.{}.safetensors", stem, variant),
        None => format!("{}.safetensors", stem),
    }
}

/// Paths to every file a pipeline needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelFiles {
    pub unet: PathBuf,
    pub vae: PathBuf,
    pub text_encoder: PathBuf,
    pub text_encoder_2: Option<PathBuf>,
    pub tokenizer: PathBuf,
    pub tokenizer_2: Option<PathBuf>,
}

/// Resolves model files, downloading into the hub cache when needed
pub struct ModelDownloader {
    api: Api,
}

impl ModelDownloader {
    /// Create a new downloader
    ///
    /// Uses the HF_TOKEN environment variable if set for gated models
    pub fn new() -> Result<Self> {
        let token = std::env::var("HF_TOKEN").ok().filter(|t| !t.is_empty());
        let api = ApiBuilder::new()
            .with_token(token)
            .with_progress(true)
            .build()
            .context("Failed to create HuggingFace API client")?;
        Ok(Self { api })
    }

    /// Resolve every pipeline file for `model`
    pub async fn resolve(&self, model: &ModelConfig) -> Result<ModelFiles> {
        let version = model.version();
        let variant = model.variant();
        let local = Path::new(&model.id);

        let mut files = if local.is_dir() {
            info!(dir = %local.display(), "Using local model directory");
            resolve_local(local, version, variant)?
        } else {
            info!(model = %model.id, variant = ?variant, "Fetching model files from the Hub");
            self.resolve_hub(model, version, variant).await?
        };

        if let Some(vae) = model.vae_source() {
            files.vae = self.resolve_vae_override(vae).await?;
        }

        info!(
            unet = %files.unet.display(),
            vae = %files.vae.display(),
            "✓ Model files ready"
        );
        Ok(files)
    }

    async fn resolve_hub(
        &self,
        model: &ModelConfig,
        version: ModelVersion,
        variant: Option<&str>,
    ) -> Result<ModelFiles> {
        let repo = match &model.revision {
            Some(revision) => self.api.repo(Repo::with_revision(
                model.id.clone(),
                RepoType::Model,
                revision.clone(),
            )),
            None => self.api.repo(Repo::model(model.id.clone())),
        };

        let unet = fetch_component(&repo, "unet", "diffusion_pytorch_model", variant);
        let vae = fetch_component(&repo, "vae", "diffusion_pytorch_model", variant);
        let text_encoder = fetch_component(&repo, "text_encoder", "model", variant);
        let tokenizer = self.fetch_tokenizer(CLIP_TOKENIZER_REPO);

        let (unet, vae, text_encoder, tokenizer) =
            tokio::try_join!(unet, vae, text_encoder, tokenizer)?;

        let (text_encoder_2, tokenizer_2) = if version.has_second_text_encoder() {
            let (encoder, tokenizer) = tokio::try_join!(
                fetch_component(&repo, "text_encoder_2", "model", variant),
                self.fetch_tokenizer(CLIP2_TOKENIZER_REPO),
            )?;
            (Some(encoder), Some(tokenizer))
        } else {
            (None, None)
        };

        Ok(ModelFiles { unet, vae, text_encoder, text_encoder_2, tokenizer, tokenizer_2 })
    }

    async fn fetch_tokenizer(&self, repo_id: &str) -> Result<PathBuf> {
        let path = self
            .api
            .model(repo_id.to_string())
            .get("tokenizer.json")
            .await
            .with_context(|| format!("Failed to download tokenizer from {}", repo_id))?;
        debug!(repo = repo_id, path = %path.display(), "Tokenizer downloaded");
        Ok(path)
    }

    /// Standalone VAE: a local directory/file or a hub repository
    async fn resolve_vae_override(&self, source: &str) -> Result<PathBuf> {
        let local = Path::new(source);
        if local.is_file() {
            return Ok(local.to_path_buf());
        }
        if local.is_dir() {
            return first_existing(local, &["diffusion_pytorch_model.safetensors"]);
        }

        info!(vae = source, "Fetching replacement VAE");
        let path = self
            .api
            .model(source.to_string())
            .get("diffusion_pytorch_model.safetensors")
            .await
            .with_context(|| format!("Failed to download VAE from {}", source))?;
        Ok(path)
    }
}

/// Fetch `<folder>/<stem>[.variant].safetensors`, falling back to the plain
/// file when the repository publishes no variant
async fn fetch_component(
    repo: &ApiRepo,
    folder: &str,
    stem: &str,
    variant: Option<&str>,
) -> Result<PathBuf> {
    if variant.is_some() {
        let name = format!("{}/{}", folder, weights_file_name(stem, variant));
        match repo.get(&name).await {
            Ok(path) => {
                info!("  ✓ {} downloaded: {}", folder, path.display());
                return Ok(path);
            }
            Err(e) => debug!(file = %name, error = %e, "Variant not available, trying plain weights"),
        }
    }

    let name = format!("{}/{}", folder, weights_file_name(stem, None));
    let path = repo
        .get(&name)
        .await
        .with_context(|| format!("Failed to download {}", name))?;
    info!("  ✓ {} downloaded: {}", folder, path.display());
    Ok(path)
}

/// Resolve files inside a local diffusers directory
pub fn resolve_local(root: &Path, version: ModelVersion, variant: Option<&str>) -> Result<ModelFiles> {
    let component = |folder: &str, stem: &str| -> Result<PathBuf> {
        let dir = root.join(folder);
        let variant_name = weights_file_name(stem, variant);
        let plain_name = weights_file_name(stem, None);
        first_existing(&dir, &[variant_name.as_str(), plain_name.as_str()])
    };

    let tokenizer = |folder: &str| -> Result<PathBuf> {
        let dir = root.join(folder);
        if dir.join("tokenizer.json").is_file() {
            Ok(dir.join("tokenizer.json"))
        } else if dir.join("vocab.json").is_file() && dir.join("merges.txt").is_file() {
            Ok(dir)
        } else {
            Err(WorkflowError::MissingModelFile(format!(
                "{} (tokenizer.json or vocab.json + merges.txt)",
                dir.display()
            ))
            .into())
        }
    };

    let (text_encoder_2, tokenizer_2) = if version.has_second_text_encoder() {
        (Some(component("text_encoder_2", "model")?), Some(tokenizer("tokenizer_2")?))
    } else {
        (None, None)
    };

    Ok(ModelFiles {
        unet: component("unet", "diffusion_pytorch_model")?,
        vae: component("vae", "diffusion_pytorch_model")?,
        text_encoder: component("text_encoder", "model")?,
        text_encoder_2,
        tokenizer: tokenizer("tokenizer")?,
        tokenizer_2,
    })
}

fn first_existing(dir: &Path, names: &[&str]) -> Result<PathBuf> {
    names
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
        .ok_or_else(|| {
            WorkflowError::MissingModelFile(format!("{}/{}", dir.display(), names.join(" | "))).into()
        })
}
