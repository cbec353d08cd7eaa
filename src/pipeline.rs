//! Text-to-image pipeline for Stable Diffusion 1.5 / 2.1 / XL
//!
//! A generation runs three stages:
//! 1. Encode the prompt (one CLIP encoder, two for SDXL)
//! 2. Denoise latents with the UNet under classifier-free guidance
//! 3. Decode latents to RGB with the VAE
//!
//! With [`PlacementPolicy::Offload`] each stage builds its component on the
//! device, runs it and drops it before the next one starts. With
//! [`PlacementPolicy::Pinned`] everything is built once at load time.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor, D};
use candle_transformers::models::stable_diffusion::{
    clip, unet_2d::UNet2DConditionModel, vae::AutoEncoderKL, StableDiffusionConfig,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

use crate::config::{GenerationConfig, ModelConfig, ModelVersion, PlacementPolicy, Precision};
use crate::download::{ModelDownloader, ModelFiles};
use crate::error::WorkflowError;
use crate::lora::{AdapterArtifact, Component, LoraAdapter};
use crate::models::{self, TextEncoder, WeightSource};

/// Per-call sampling options; unset values use the model version's defaults
#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    pub steps: Option<usize>,
    pub guidance_scale: Option<f64>,
    pub seed: Option<u64>,
    pub negative_prompt: Option<String>,
    pub width: Option<usize>,
    pub height: Option<usize>,
}

impl From<&GenerationConfig> for GenerateOptions {
    fn from(config: &GenerationConfig) -> Self {
        Self {
            steps: config.steps,
            guidance_scale: config.guidance_scale,
            seed: config.seed,
            negative_prompt: config.negative_prompt.clone(),
            width: config.width,
            height: config.height,
        }
    }
}

/// Options with every default filled in
#[derive(Debug, Clone, PartialEq)]
pub struct Sampling {
    pub steps: usize,
    pub guidance_scale: f64,
    pub seed: Option<u64>,
    pub negative_prompt: String,
    pub width: usize,
    pub height: usize,
}

impl Sampling {
    /// Guidance at or below 1.0 skips the unconditional pass
    pub fn uses_guidance(&self) -> bool {
        self.guidance_scale > 1.0
    }
}

impl GenerateOptions {
    pub fn with_steps(mut self, steps: Option<usize>) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Validate `prompt` and the options, filling defaults for `version`
    pub fn resolve(&self, prompt: &str, version: ModelVersion) -> Result<Sampling> {
        if prompt.trim().is_empty() {
            return Err(WorkflowError::EmptyPrompt.into());
        }

        let steps = self.steps.unwrap_or_else(|| version.default_steps());
        if steps == 0 {
            return Err(WorkflowError::InvalidStepCount(steps).into());
        }

        let native = version.native_resolution() as usize;
        let width = self.width.unwrap_or(native);
        let height = self.height.unwrap_or(native);
        if width == 0 || height == 0 || width % 8 != 0 || height % 8 != 0 {
            anyhow::bail!(
                "Image size {}x{} must be positive and divisible by 8",
                width,
                height
            );
        }

        Ok(Sampling {
            steps,
            guidance_scale: self
                .guidance_scale
                .unwrap_or_else(|| version.default_guidance_scale()),
            seed: self.seed,
            negative_prompt: self.negative_prompt.clone().unwrap_or_default(),
            width,
            height,
        })
    }
}

/// Decoded RGB8 image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedImage {
    pub width: u32,
    pub height: u32,
    /// Row-major RGB bytes
    pub pixels: Vec<u8>,
}

impl GeneratedImage {
    fn to_rgb_image(&self) -> Result<image::RgbImage> {
        image::ImageBuffer::from_raw(self.width, self.height, self.pixels.clone())
            .ok_or_else(|| anyhow::anyhow!("Failed to create image buffer"))
    }

    /// Encode as PNG
    pub fn to_png(&self) -> Result<Vec<u8>> {
        use std::io::Cursor;

        let img = self.to_rgb_image()?;
        let mut png_data = Cursor::new(Vec::new());
        img.write_to(&mut png_data, image::ImageFormat::Png)?;

        Ok(png_data.into_inner())
    }

    /// Write to `path`; the format follows the extension
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        self.to_rgb_image()?
            .save(path)
            .with_context(|| format!("Failed to save image: {}", path.display()))?;
        info!(path = %path.display(), "✓ Image saved");
        Ok(())
    }
}

/// Standard normal latents of `shape`, reproducible when `seed` is set
pub fn initial_latents(
    seed: Option<u64>,
    shape: (usize, usize, usize, usize),
    device: &Device,
    dtype: DType,
) -> Result<Tensor> {
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let (b, c, h, w) = shape;
    let noise: Vec<f32> = (0..b * c * h * w)
        .map(|_| StandardNormal.sample(&mut rng))
        .collect();

    Ok(Tensor::from_vec(noise, shape, device)?.to_dtype(dtype)?)
}

/// Pick the accelerator, falling back to CPU
pub fn select_device(force_cpu: bool) -> Result<Device> {
    if force_cpu {
        return Ok(Device::Cpu);
    }
    if candle_core::utils::cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else if candle_core::utils::metal_is_available() {
        Ok(Device::new_metal(0)?)
    } else {
        info!("No accelerator found, running on CPU");
        Ok(Device::Cpu)
    }
}

/// Reduced precision is only used on accelerators
pub fn effective_dtype(precision: Precision, device: &Device) -> DType {
    let dtype = precision.dtype();
    if device.is_cpu() && dtype != DType::F32 {
        warn!(requested = ?dtype, "Reduced precision is not supported on CPU, using F32");
        DType::F32
    } else {
        dtype
    }
}

/// Weights each component is built from
#[derive(Debug, Clone)]
pub struct ComponentWeights {
    pub unet: WeightSource,
    /// One entry, or two for SDXL
    pub text_encoders: Vec<WeightSource>,
}

impl ComponentWeights {
    fn from_files(files: &ModelFiles) -> Self {
        let mut text_encoders = vec![WeightSource::File(files.text_encoder.clone())];
        if let Some(second) = &files.text_encoder_2 {
            text_encoders.push(WeightSource::File(second.clone()));
        }
        Self {
            unet: WeightSource::File(files.unet.clone()),
            text_encoders,
        }
    }

    fn source_mut(&mut self, component: Component) -> Option<&mut WeightSource> {
        match component {
            Component::Unet => Some(&mut self.unet),
            Component::TextEncoder => self.text_encoders.get_mut(0),
            Component::TextEncoder2 => self.text_encoders.get_mut(1),
        }
    }

    /// Merge `adapter` into every component it targets
    ///
    /// All components are checked before any is replaced, so on error the
    /// weights are left as they were. Returns the number of fused weights.
    pub fn fuse(&mut self, adapter: &LoraAdapter, scale: f32) -> Result<usize> {
        let mut merged = Vec::new();
        for component in adapter.components() {
            let Some(source) = self.source_mut(component) else {
                return Err(WorkflowError::IncompatibleAdapter {
                    module: component.name().to_string(),
                    reason: "the base model has no such component".to_string(),
                }
                .into());
            };
            let tensors = source
                .load_tensors()
                .with_context(|| format!("Failed to load {} weights", component.name()))?;
            adapter.check_compatible(component, &tensors)?;
            merged.push((component, tensors));
        }

        let mut fused = 0;
        for (component, mut tensors) in merged {
            fused += adapter.fuse_into(component, &mut tensors, scale)?;
            if let Some(source) = self.source_mut(component) {
                *source = WeightSource::Fused(Arc::new(tensors));
            }
        }
        Ok(fused)
    }
}

/// Components kept on the device under [`PlacementPolicy::Pinned`]
struct Resident {
    text_encoders: Vec<TextEncoder>,
    unet: UNet2DConditionModel,
    vae: AutoEncoderKL,
}

/// A loaded base model, optionally with one adapter fused in
///
/// The handle is moved into [`attach_adapter`](Self::attach_adapter) and
/// handed back combined. Dropping it frees every device buffer it owns.
pub struct PipelineHandle {
    model_id: String,
    version: ModelVersion,
    placement: PlacementPolicy,
    device: Device,
    dtype: DType,
    sd_config: StableDiffusionConfig,
    use_flash_attn: bool,
    sliced_attention_size: Option<usize>,
    tokenizers: Vec<Tokenizer>,
    weights: ComponentWeights,
    vae_path: PathBuf,
    resident: Option<Resident>,
    adapter: Option<PathBuf>,
}

impl std::fmt::Debug for PipelineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineHandle")
            .field("model_id", &self.model_id)
            .field("version", &self.version)
            .field("placement", &self.placement)
            .field("device", &self.device)
            .field("dtype", &self.dtype)
            .field("adapter", &self.adapter)
            .finish_non_exhaustive()
    }
}

impl PipelineHandle {
    /// Resolve, download and prepare the base model described by `model`
    pub async fn load(model: &ModelConfig) -> Result<Self> {
        let device = select_device(model.cpu)?;
        let dtype = effective_dtype(model.precision, &device);

        let downloader = ModelDownloader::new()?;
        let files = downloader.resolve(model).await?;

        Self::from_files(model, files, device, dtype)
    }

    /// Prepare a pipeline from files already on disk
    pub fn from_files(model: &ModelConfig, files: ModelFiles, device: Device, dtype: DType) -> Result<Self> {
        let start = Instant::now();
        let version = model.version();

        info!(
            model = %model.id,
            version = ?version,
            dtype = ?dtype,
            placement = ?model.placement,
            device = ?device,
            "Initializing pipeline"
        );

        let mut tokenizers = vec![models::load_clip_tokenizer(&files.tokenizer)?];
        if let Some(path) = &files.tokenizer_2 {
            tokenizers.push(models::load_clip_tokenizer(path)?);
        }

        let mut handle = Self {
            model_id: model.id.clone(),
            version,
            placement: model.placement,
            device,
            dtype,
            sd_config: models::sd_config(version, model.sliced_attention_size, None, None),
            use_flash_attn: model.use_flash_attn,
            sliced_attention_size: model.sliced_attention_size,
            tokenizers,
            weights: ComponentWeights::from_files(&files),
            vae_path: files.vae,
            resident: None,
            adapter: None,
        };

        if handle.placement == PlacementPolicy::Pinned {
            handle.resident = Some(handle.build_resident()?);
        }

        info!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            "✓ Pipeline initialized"
        );
        Ok(handle)
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn version(&self) -> ModelVersion {
        self.version
    }

    pub fn placement(&self) -> PlacementPolicy {
        self.placement
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Weights file of the attached adapter, if any
    pub fn adapter(&self) -> Option<&Path> {
        self.adapter.as_deref()
    }

    fn clip_config(&self, index: usize) -> Result<&clip::Config> {
        match index {
            0 => Ok(&self.sd_config.clip),
            1 => self
                .sd_config
                .clip2
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("{:?} has no second text encoder", self.version)),
            _ => anyhow::bail!("No text encoder #{}", index),
        }
    }

    fn build_text_encoders(&self) -> Result<Vec<TextEncoder>> {
        self.weights
            .text_encoders
            .iter()
            .zip(&self.tokenizers)
            .enumerate()
            .map(|(i, (source, tokenizer))| {
                TextEncoder::load(source, self.clip_config(i)?, tokenizer, &self.device)
                    .with_context(|| format!("Failed to build text encoder #{}", i + 1))
            })
            .collect()
    }

    fn build_unet(&self) -> Result<UNet2DConditionModel> {
        models::load_unet(
            &self.weights.unet,
            self.version,
            self.sliced_attention_size,
            self.use_flash_attn,
            self.dtype,
            &self.device,
        )
    }

    fn build_vae(&self) -> Result<AutoEncoderKL> {
        models::load_vae(&self.sd_config, &self.vae_path, self.dtype, &self.device)
    }

    fn build_resident(&self) -> Result<Resident> {
        info!("Building resident components");
        Ok(Resident {
            text_encoders: self.build_text_encoders()?,
            unet: self.build_unet()?,
            vae: self.build_vae()?,
        })
    }

    /// Fuse the adapter at `artifact` into this pipeline
    ///
    /// Fails with `AdapterAlreadyAttached` if one is already fused; reload
    /// the base pipeline to switch adapters.
    pub fn attach_adapter(mut self, artifact: &AdapterArtifact, scale: f32) -> Result<Self> {
        if let Some(attached) = &self.adapter {
            return Err(WorkflowError::AdapterAlreadyAttached(attached.clone()).into());
        }

        let adapter = LoraAdapter::load(artifact)?;
        info!(
            adapter = %adapter.name,
            pairs = adapter.weight_count(),
            rank = adapter.rank(),
            components = ?adapter.components().iter().map(|c| c.name()).collect::<Vec<_>>(),
            scale = scale,
            "Attaching LoRA adapter"
        );

        let fused = self.weights.fuse(&adapter, scale)?;

        if self.placement == PlacementPolicy::Pinned {
            // Free the base components before building the fused ones
            self.resident = None;
            self.resident = Some(self.build_resident()?);
        }

        self.adapter = Some(artifact.weights.clone());
        info!(fused = fused, "✓ Adapter attached");
        Ok(self)
    }

    /// Sample one image for `prompt`
    pub fn generate(&self, prompt: &str, options: &GenerateOptions) -> Result<GeneratedImage> {
        let sampling = options.resolve(prompt, self.version)?;
        let start = Instant::now();

        info!(
            prompt_preview = %prompt.chars().take(50).collect::<String>(),
            steps = sampling.steps,
            guidance = sampling.guidance_scale,
            size = format!("{}x{}", sampling.width, sampling.height),
            seed = ?sampling.seed,
            adapter = self.adapter.is_some(),
            "Starting generation"
        );

        info!("Step 1/3: Encoding prompt");
        let text_embeddings = match &self.resident {
            Some(resident) => encode_prompt(&resident.text_encoders, prompt, &sampling)?,
            None => {
                let encoders = self.build_text_encoders()?;
                let embeddings = encode_prompt(&encoders, prompt, &sampling)?;
                drop(encoders);
                debug!("Text encoders released");
                embeddings
            }
        };
        let text_embeddings = text_embeddings.to_dtype(self.dtype)?;
        debug!(shape = ?text_embeddings.dims(), "Text embeddings");

        info!("Step 2/3: Denoising ({} steps)", sampling.steps);
        let latents = match &self.resident {
            Some(resident) => self.denoise(&resident.unet, &text_embeddings, &sampling)?,
            None => {
                let unet = self.build_unet()?;
                let latents = self.denoise(&unet, &text_embeddings, &sampling)?;
                drop(unet);
                debug!("UNet released");
                latents
            }
        };

        info!("Step 3/3: Decoding latents");
        let scaled = (latents / self.version.vae_scale())?;
        let decoded = match &self.resident {
            Some(resident) => resident.vae.decode(&scaled)?,
            None => {
                let vae = self.build_vae()?;
                let decoded = vae.decode(&scaled)?;
                drop(vae);
                decoded
            }
        };

        let (width, height, pixels) = models::tensor_to_rgb(&decoded)?;

        info!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            "✓ Generation complete"
        );

        Ok(GeneratedImage {
            width: width as u32,
            height: height as u32,
            pixels,
        })
    }

    fn denoise(
        &self,
        unet: &UNet2DConditionModel,
        text_embeddings: &Tensor,
        sampling: &Sampling,
    ) -> Result<Tensor> {
        let mut scheduler = self.sd_config.build_scheduler(sampling.steps)?;
        let timesteps = scheduler.timesteps().to_vec();

        let latents = initial_latents(
            sampling.seed,
            (1, 4, sampling.height / 8, sampling.width / 8),
            &self.device,
            self.dtype,
        )?;
        let mut latents = (latents * scheduler.init_noise_sigma())?;

        let total = timesteps.len();
        for (i, &timestep) in timesteps.iter().enumerate() {
            let model_input = if sampling.uses_guidance() {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let model_input = scheduler.scale_model_input(model_input, timestep)?;

            let noise_pred = unet.forward(&model_input, timestep as f64, text_embeddings)?;
            let noise_pred = if sampling.uses_guidance() {
                let chunks = noise_pred.chunk(2, 0)?;
                let (uncond, cond) = (&chunks[0], &chunks[1]);
                (uncond + ((cond - uncond)? * sampling.guidance_scale)?)?
            } else {
                noise_pred
            };

            latents = scheduler.step(&noise_pred, timestep, &latents)?;

            if (i + 1) % 5 == 0 || i + 1 == total {
                debug!(step = i + 1, total = total, "Denoising progress");
            }
        }

        Ok(latents)
    }
}

/// Embeddings from every encoder, concatenated on the hidden axis
///
/// With guidance the batch holds the negative prompt first, then `prompt`.
fn encode_prompt(encoders: &[TextEncoder], prompt: &str, sampling: &Sampling) -> Result<Tensor> {
    let mut per_encoder = Vec::with_capacity(encoders.len());
    for encoder in encoders {
        let cond = encoder.encode(prompt)?;
        let embeddings = if sampling.uses_guidance() {
            let uncond = encoder.encode(&sampling.negative_prompt)?;
            Tensor::cat(&[uncond, cond], 0)?
        } else {
            cond
        };
        per_encoder.push(embeddings);
    }
    Ok(Tensor::cat(&per_encoder, D::Minus1)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lora::ADAPTER_WEIGHTS_FILE;
    use std::collections::HashMap;
    use tempfile::TempDir;

    const TO_K: &str = "mid_block.attentions.0.transformer_blocks.0.attn1.to_k";

    #[test]
    fn test_resolve_defaults_per_version() {
        let xl = GenerateOptions::default()
            .resolve("a photo of sks dog", ModelVersion::Xl)
            .unwrap();
        assert_eq!(xl.steps, 30);
        assert_eq!(xl.guidance_scale, 5.0);
        assert_eq!((xl.width, xl.height), (1024, 1024));
        assert_eq!(xl.negative_prompt, "");

        let v15 = GenerateOptions::default()
            .with_steps(Some(20))
            .resolve("a red cube", ModelVersion::V1_5)
            .unwrap();
        assert_eq!(v15.steps, 20);
        assert_eq!(v15.guidance_scale, 7.5);
        assert_eq!(v15.width, 512);
    }

    #[test]
    fn test_resolve_rejects_bad_input() {
        let options = GenerateOptions::default();
        let err = options.resolve("   ", ModelVersion::Xl).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<WorkflowError>(),
            Some(WorkflowError::EmptyPrompt)
        ));

        let err = options
            .clone()
            .with_steps(Some(0))
            .resolve("a dog", ModelVersion::Xl)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<WorkflowError>(),
            Some(WorkflowError::InvalidStepCount(0))
        ));

        let odd = GenerateOptions {
            width: Some(500),
            ..Default::default()
        };
        assert!(odd.resolve("a dog", ModelVersion::V1_5).is_err());
    }

    #[test]
    fn test_guidance_toggle() {
        let sampling = GenerateOptions {
            guidance_scale: Some(1.0),
            ..Default::default()
        }
        .resolve("a dog", ModelVersion::V1_5)
        .unwrap();
        assert!(!sampling.uses_guidance());
    }

    #[test]
    fn test_seeded_latents_are_reproducible() {
        let shape = (1, 4, 8, 8);
        let a = initial_latents(Some(42), shape, &Device::Cpu, DType::F32).unwrap();
        let b = initial_latents(Some(42), shape, &Device::Cpu, DType::F32).unwrap();
        let c = initial_latents(Some(43), shape, &Device::Cpu, DType::F32).unwrap();

        assert_eq!(a.dims(), &[1, 4, 8, 8]);
        let a = a.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let b = b.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let c = c.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);

        // Roughly standard normal
        let mean = a.iter().sum::<f32>() / a.len() as f32;
        assert!(mean.abs() < 0.5, "mean {}", mean);
    }

    #[test]
    fn test_unseeded_latents_differ() {
        let shape = (1, 4, 4, 4);
        let a = initial_latents(None, shape, &Device::Cpu, DType::F32).unwrap();
        let b = initial_latents(None, shape, &Device::Cpu, DType::F32).unwrap();
        let a = a.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let b = b.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_cpu_forces_f32() {
        assert_eq!(effective_dtype(Precision::F16, &Device::Cpu), DType::F32);
        assert_eq!(effective_dtype(Precision::F32, &Device::Cpu), DType::F32);
    }

    #[test]
    fn test_png_encoding_and_save() {
        let image = GeneratedImage {
            width: 2,
            height: 1,
            pixels: vec![255, 0, 0, 0, 0, 255],
        };
        let png = image.to_png().unwrap();
        assert_eq!(&png[..8], b"\x89PNG\r\n\x1a\n");

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("out.png");
        image.save(&path).unwrap();

        let loaded = image::open(&path).unwrap().to_rgb8();
        assert_eq!(loaded.dimensions(), (2, 1));
        assert_eq!(loaded.into_raw(), image.pixels);
    }

    #[test]
    fn test_truncated_pixels_rejected() {
        let image = GeneratedImage {
            width: 4,
            height: 4,
            pixels: vec![0; 3],
        };
        assert!(image.to_png().is_err());
    }

    fn fused_weights(with_second_encoder: bool) -> ComponentWeights {
        let mut unet = HashMap::new();
        unet.insert(
            format!("{}.weight", TO_K),
            Tensor::zeros((2, 2), DType::F32, &Device::Cpu).unwrap(),
        );
        let encoder = || WeightSource::Fused(Arc::new(HashMap::new()));
        let mut text_encoders = vec![encoder()];
        if with_second_encoder {
            text_encoders.push(encoder());
        }
        ComponentWeights {
            unet: WeightSource::Fused(Arc::new(unet)),
            text_encoders,
        }
    }

    fn write_adapter(dir: &Path, prefixes: &[&str]) -> AdapterArtifact {
        let mut tensors = HashMap::new();
        for prefix in prefixes {
            tensors.insert(
                format!("{}.{}.lora_A.weight", prefix, TO_K),
                Tensor::from_slice(&[1f32, 1.], (1, 2), &Device::Cpu).unwrap(),
            );
            tensors.insert(
                format!("{}.{}.lora_B.weight", prefix, TO_K),
                Tensor::from_slice(&[1f32, 2.], (2, 1), &Device::Cpu).unwrap(),
            );
        }
        candle_core::safetensors::save(&tensors, dir.join(ADAPTER_WEIGHTS_FILE)).unwrap();
        AdapterArtifact::locate(dir).unwrap()
    }

    #[test]
    fn test_component_weights_fuse_unet() {
        let dir = TempDir::new().unwrap();
        let adapter = LoraAdapter::load(&write_adapter(dir.path(), &["unet"])).unwrap();

        let mut weights = fused_weights(false);
        assert_eq!(weights.fuse(&adapter, 1.0).unwrap(), 1);

        let tensors = weights.unet.load_tensors().unwrap();
        let merged = tensors[&format!("{}.weight", TO_K)].to_vec2::<f32>().unwrap();
        assert_eq!(merged, vec![vec![1.0, 1.0], vec![2.0, 2.0]]);
    }

    #[test]
    fn test_component_weights_reject_missing_component() {
        let dir = TempDir::new().unwrap();
        let adapter = LoraAdapter::load(&write_adapter(dir.path(), &["text_encoder_2"])).unwrap();

        let mut weights = fused_weights(false);
        let err = weights.fuse(&adapter, 1.0).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<WorkflowError>(),
            Some(WorkflowError::IncompatibleAdapter { .. })
        ));
    }

    #[test]
    fn test_component_weights_untouched_on_mismatch() {
        let dir = TempDir::new().unwrap();
        // The UNet pair fits; the second encoder has no such module
        let adapter =
            LoraAdapter::load(&write_adapter(dir.path(), &["unet", "text_encoder_2"])).unwrap();

        let mut weights = fused_weights(true);
        assert!(weights.fuse(&adapter, 1.0).is_err());
        let unet = weights.unet.load_tensors().unwrap();
        let base = unet[&format!("{}.weight", TO_K)].to_vec2::<f32>().unwrap();
        assert_eq!(base, vec![vec![0.0, 0.0], vec![0.0, 0.0]]);
    }
}
