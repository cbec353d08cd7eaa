//! Stable Diffusion pipeline components
//!
//! - CLIP text encoders (one for SD 1.5/2.1, two for SDXL)
//! - UNet denoiser
//! - VAE decoder
//!
//! Components are built from a [`WeightSource`]: either a memory-mapped
//! safetensors file, or an in-memory tensor map holding weights with a LoRA
//! already fused in.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::stable_diffusion::{
    clip, unet_2d, vae, StableDiffusionConfig,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokenizers::models::bpe::BPE;
use tokenizers::normalizers::Lowercase;
use tokenizers::pre_tokenizers::byte_level::ByteLevel;
use tokenizers::pre_tokenizers::sequence::Sequence;
use tokenizers::pre_tokenizers::whitespace::Whitespace;
use tokenizers::pre_tokenizers::PreTokenizerWrapper;
use tokenizers::processors::template::TemplateProcessing;
use tokenizers::{AddedToken, Tokenizer};
use tracing::{debug, info, warn};

use crate::config::ModelVersion;

const START_OF_TEXT: &str = "<|startoftext|>";
const END_OF_TEXT: &str = "<|endoftext|>";

/// Where a component's weights come from
#[derive(Debug, Clone)]
pub enum WeightSource {
    /// Memory-mapped safetensors file
    File(PathBuf),
    /// Tensors with an adapter fused in
    Fused(Arc<HashMap<String, Tensor>>),
}

impl WeightSource {
    pub fn var_builder(&self, dtype: DType, device: &Device) -> Result<VarBuilder<'static>> {
        match self {
            Self::File(path) => {
                let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[path], dtype, device) }
                    .with_context(|| format!("Failed to map weights: {}", path.display()))?;
                Ok(vb)
            }
            Self::Fused(tensors) => Ok(VarBuilder::from_tensors((**tensors).clone(), dtype, device)),
        }
    }

    /// All tensors on the CPU, for fusing an adapter
    pub fn load_tensors(&self) -> Result<HashMap<String, Tensor>> {
        match self {
            Self::File(path) => candle_core::safetensors::load(path, &Device::Cpu)
                .with_context(|| format!("Failed to load weights: {}", path.display())),
            Self::Fused(tensors) => Ok((**tensors).clone()),
        }
    }
}

/// Base configuration for a version at the given output size
pub fn sd_config(
    version: ModelVersion,
    sliced_attention_size: Option<usize>,
    height: Option<usize>,
    width: Option<usize>,
) -> StableDiffusionConfig {
    match version {
        ModelVersion::V1_5 => StableDiffusionConfig::v1_5(sliced_attention_size, height, width),
        ModelVersion::V2_1 => StableDiffusionConfig::v2_1(sliced_attention_size, height, width),
        ModelVersion::Xl => StableDiffusionConfig::sdxl(sliced_attention_size, height, width),
    }
}

/// UNet layout per version, matching each repository's `unet/config.json`
pub fn unet_config(
    version: ModelVersion,
    sliced_attention_size: Option<usize>,
) -> unet_2d::UNet2DConditionModelConfig {
    let bc = |out_channels, use_cross_attn, attention_head_dim| unet_2d::BlockConfig {
        out_channels,
        use_cross_attn,
        attention_head_dim,
    };

    let (blocks, cross_attention_dim, use_linear_projection) = match version {
        ModelVersion::V1_5 => (
            vec![bc(320, Some(1), 8), bc(640, Some(1), 8), bc(1280, Some(1), 8), bc(1280, None, 8)],
            768,
            false,
        ),
        ModelVersion::V2_1 => (
            vec![bc(320, Some(1), 5), bc(640, Some(1), 10), bc(1280, Some(1), 20), bc(1280, None, 20)],
            1024,
            true,
        ),
        ModelVersion::Xl => (
            vec![bc(320, None, 5), bc(640, Some(2), 10), bc(1280, Some(10), 20)],
            2048,
            true,
        ),
    };

    unet_2d::UNet2DConditionModelConfig {
        blocks,
        center_input_sample: false,
        cross_attention_dim,
        downsample_padding: 1,
        flip_sin_to_cos: true,
        freq_shift: 0.,
        layers_per_block: 2,
        mid_block_scale_factor: 1.,
        norm_eps: 1e-5,
        norm_num_groups: 32,
        sliced_attention_size,
        use_linear_projection,
    }
}

/// Load a CLIP tokenizer from `tokenizer.json` or a `vocab.json` + `merges.txt` directory
pub fn load_clip_tokenizer(path: &Path) -> Result<Tokenizer> {
    if path.is_file() {
        return Tokenizer::from_file(path)
            .map_err(|e| anyhow::anyhow!("Failed to load tokenizer from {:?}: {}", path, e));
    }

    let tokenizer_json = path.join("tokenizer.json");
    if tokenizer_json.is_file() {
        return Tokenizer::from_file(&tokenizer_json)
            .map_err(|e| anyhow::anyhow!("Failed to load tokenizer from {:?}: {}", tokenizer_json, e));
    }

    load_bpe_tokenizer(path)
}

/// Build a CLIP BPE tokenizer from a directory with vocab.json and merges.txt
fn load_bpe_tokenizer(tokenizer_dir: &Path) -> Result<Tokenizer> {
    let vocab_path = tokenizer_dir.join("vocab.json");
    let merges_path = tokenizer_dir.join("merges.txt");

    if !vocab_path.exists() || !merges_path.exists() {
        anyhow::bail!(
            "BPE tokenizer requires vocab.json and merges.txt in {}",
            tokenizer_dir.display()
        );
    }

    let bpe = BPE::from_file(&vocab_path.to_string_lossy(), &merges_path.to_string_lossy())
        .unk_token(END_OF_TEXT.to_string())
        .end_of_word_suffix("</w>".to_string())
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to build BPE tokenizer: {}", e))?;

    let mut tokenizer = Tokenizer::new(bpe);

    tokenizer.with_normalizer(Some(Lowercase));
    tokenizer.with_pre_tokenizer(Some(Sequence::new(vec![
        PreTokenizerWrapper::Whitespace(Whitespace::default()),
        PreTokenizerWrapper::ByteLevel(ByteLevel::new(false, true, false)),
    ])));

    tokenizer.add_special_tokens(&[
        AddedToken::from(START_OF_TEXT, true),
        AddedToken::from(END_OF_TEXT, true),
    ]);

    let processor = TemplateProcessing::builder()
        .try_single("<|startoftext|> $A <|endoftext|>")
        .map_err(|e| anyhow::anyhow!("Template processing failed: {}", e))?
        .special_tokens(vec![(START_OF_TEXT, 49406), (END_OF_TEXT, 49407)])
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to build processor: {}", e))?;
    tokenizer.with_post_processor(Some(processor));

    debug!(dir = %tokenizer_dir.display(), "Built BPE tokenizer from vocab + merges");
    Ok(tokenizer)
}

/// Token ids padded (or truncated) to the encoder's context length
pub fn tokenize(tokenizer: &Tokenizer, prompt: &str, pad_id: u32, max_len: usize) -> Result<Vec<u32>> {
    let encoding = tokenizer
        .encode(prompt, true)
        .map_err(|e| anyhow::anyhow!("Tokenization failed: {}", e))?;
    let mut tokens = encoding.get_ids().to_vec();

    if tokens.len() > max_len {
        warn!(
            tokens = tokens.len(),
            max = max_len,
            "Prompt is longer than the text encoder context, truncating"
        );
        let end = tokens[tokens.len() - 1];
        tokens.truncate(max_len);
        tokens[max_len - 1] = end;
    }
    tokens.resize(max_len, pad_id);

    Ok(tokens)
}

/// CLIP text encoder with its tokenizer
pub struct TextEncoder {
    model: clip::ClipTextTransformer,
    tokenizer: Tokenizer,
    pad_id: u32,
    max_len: usize,
    device: Device,
}

impl TextEncoder {
    /// Build the encoder in F32; embeddings are cast to the pipeline dtype later
    pub fn load(
        source: &WeightSource,
        config: &clip::Config,
        tokenizer: &Tokenizer,
        device: &Device,
    ) -> Result<Self> {
        let pad_token = config.pad_with.as_deref().unwrap_or(END_OF_TEXT);
        let pad_id = tokenizer
            .token_to_id(pad_token)
            .or_else(|| tokenizer.token_to_id(END_OF_TEXT))
            .ok_or_else(|| anyhow::anyhow!("Tokenizer has no padding token {:?}", pad_token))?;

        let vb = source.var_builder(DType::F32, device)?;
        let model = clip::ClipTextTransformer::new(vb, config)?;

        debug!(pad_id = pad_id, max_len = config.max_position_embeddings, "CLIP encoder built");

        Ok(Self {
            model,
            tokenizer: tokenizer.clone(),
            pad_id,
            max_len: config.max_position_embeddings,
            device: device.clone(),
        })
    }

    /// Hidden states for `prompt`, shape [1, 77, hidden]
    pub fn encode(&self, prompt: &str) -> Result<Tensor> {
        let tokens = tokenize(&self.tokenizer, prompt, self.pad_id, self.max_len)?;
        let token_ids = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        Ok(self.model.forward(&token_ids)?)
    }
}

/// Build the UNet denoiser
pub fn load_unet(
    source: &WeightSource,
    version: ModelVersion,
    sliced_attention_size: Option<usize>,
    use_flash_attn: bool,
    dtype: DType,
    device: &Device,
) -> Result<unet_2d::UNet2DConditionModel> {
    info!(version = ?version, dtype = ?dtype, "Building UNet");
    let vb = source.var_builder(dtype, device)?;
    let unet = unet_2d::UNet2DConditionModel::new(
        vb,
        4,
        4,
        use_flash_attn,
        unet_config(version, sliced_attention_size),
    )?;
    Ok(unet)
}

/// Build the VAE decoder
pub fn load_vae(
    config: &StableDiffusionConfig,
    path: &Path,
    dtype: DType,
    device: &Device,
) -> Result<vae::AutoEncoderKL> {
    info!(path = %path.display(), "Building VAE");
    config
        .build_vae(path, device, dtype)
        .with_context(|| format!("Failed to load VAE: {}", path.display()))
}

/// Convert a decoded image tensor [1, 3, H, W] in [-1, 1] to RGB bytes
pub fn tensor_to_rgb(tensor: &Tensor) -> Result<(usize, usize, Vec<u8>)> {
    let image = tensor.to_dtype(DType::F32)?;
    let image = ((image / 2.)? + 0.5)?.clamp(0f32, 1f32)?;
    let image = (image * 255.)?.to_dtype(DType::U8)?;

    // Remove batch dimension and permute to HWC
    let image = image.squeeze(0)?;
    let (_, height, width) = image.dims3()?;
    let image = image.permute((1, 2, 0))?;

    Ok((width, height, image.flatten_all()?.to_vec1()?))
}
