//! LoRA (Low-Rank Adaptation) adapter loading and fusion
//!
//! A DreamBooth LoRA run leaves a directory holding
//! `pytorch_lora_weights.safetensors`. Each adapted module contributes a
//! down projection A `[rank, in]` and an up projection B `[out, rank]`,
//! fused into the base weight as:
//!
//! W' = W + (alpha / rank) * strength * (B @ A)
//!
//! Keys are accepted in the layouts diffusers has written over time:
//!
//! - peft: `unet.<module>.lora_A.weight` / `lora_B.weight`
//! - diffusers: `unet.<module>.lora.down.weight` / `lora.up.weight`
//! - attention processors: `unet.<block>.processor.to_q_lora.down.weight`
//! - text encoder layers: `text_encoder.<module>.lora_linear_layer.down.weight`
//! - dotted kohya: `<module>.lora_down.weight` / `lora_up.weight` + `<module>.alpha`

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use safetensors::SafeTensors;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::WorkflowError;

/// File name the diffusers trainers save adapters under
pub const ADAPTER_WEIGHTS_FILE: &str = "pytorch_lora_weights.safetensors";

/// Adapter weights on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterArtifact {
    /// Directory the trainer wrote to
    pub dir: PathBuf,
    /// The safetensors file inside it
    pub weights: PathBuf,
}

impl AdapterArtifact {
    /// Where a trainer writing into `dir` leaves its weights
    pub fn default_weights_path(dir: &Path) -> PathBuf {
        dir.join(ADAPTER_WEIGHTS_FILE)
    }

    /// Find the adapter weights at `path`
    ///
    /// `path` is either a `.safetensors` file or a directory containing
    /// [`ADAPTER_WEIGHTS_FILE`] or exactly one other `.safetensors` file. The
    /// file must be non-empty.
    pub fn locate<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let artifact = if path.is_file() {
            let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
            Self { dir, weights: path.to_path_buf() }
        } else if path.is_dir() {
            let preferred = Self::default_weights_path(path);
            let weights = if preferred.is_file() {
                preferred
            } else {
                let mut candidates = Vec::new();
                for entry in std::fs::read_dir(path)
                    .with_context(|| format!("Failed to read adapter dir: {}", path.display()))?
                {
                    let candidate = entry?.path();
                    if candidate.is_file()
                        && candidate.extension().and_then(|e| e.to_str()) == Some("safetensors")
                    {
                        candidates.push(candidate);
                    }
                }
                match candidates.len() {
                    0 => return Err(WorkflowError::MissingAdapter(path.to_path_buf()).into()),
                    1 => candidates.remove(0),
                    _ => {
                        return Err(WorkflowError::InvalidAdapter {
                            path: path.to_path_buf(),
                            reason: format!(
                                "{} safetensors files and none named {}",
                                candidates.len(),
                                ADAPTER_WEIGHTS_FILE
                            ),
                        }
                        .into())
                    }
                }
            };
            Self { dir: path.to_path_buf(), weights }
        } else {
            return Err(WorkflowError::MissingAdapter(path.to_path_buf()).into());
        };

        let len = std::fs::metadata(&artifact.weights)
            .with_context(|| format!("Failed to stat adapter: {}", artifact.weights.display()))?
            .len();
        if len == 0 {
            return Err(WorkflowError::MissingAdapter(artifact.weights).into());
        }

        debug!(weights = %artifact.weights.display(), bytes = len, "Located adapter");
        Ok(artifact)
    }
}

/// Model component an adapter layer targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Component {
    Unet,
    TextEncoder,
    TextEncoder2,
}

impl Component {
    pub fn name(self) -> &'static str {
        match self {
            Self::Unet => "unet",
            Self::TextEncoder => "text_encoder",
            Self::TextEncoder2 => "text_encoder_2",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Down,
    Up,
    Alpha,
}

/// Suffixes checked in order; `_lora.` forms must not be shadowed by `.lora.`
const KEY_SUFFIXES: [(&str, Role); 11] = [
    (".lora.down.weight", Role::Down),
    (".lora.up.weight", Role::Up),
    (".lora_A.weight", Role::Down),
    (".lora_B.weight", Role::Up),
    (".lora_linear_layer.down.weight", Role::Down),
    (".lora_linear_layer.up.weight", Role::Up),
    (".lora_down.weight", Role::Down),
    (".lora_up.weight", Role::Up),
    ("_lora.down.weight", Role::Down),
    ("_lora.up.weight", Role::Up),
    (".alpha", Role::Alpha),
];

/// Split an adapter key into component, base module path and role
fn parse_lora_key(key: &str) -> Option<(Component, String, Role)> {
    let (component, rest) = if let Some(rest) = key.strip_prefix("text_encoder_2.") {
        (Component::TextEncoder2, rest)
    } else if let Some(rest) = key.strip_prefix("text_encoder.") {
        (Component::TextEncoder, rest)
    } else if let Some(rest) = key.strip_prefix("unet.") {
        (Component::Unet, rest)
    } else {
        // Bare peft dumps of the UNet carry no prefix
        (Component::Unet, key)
    };

    KEY_SUFFIXES.iter().find_map(|(suffix, role)| {
        rest.strip_suffix(suffix)
            .map(|module| (component, normalize_module(module), *role))
    })
}

/// Rewrite attention-processor paths to the module they adapt
///
/// `down_blocks.1.attentions.0.transformer_blocks.0.attn1.processor.to_out`
/// becomes `down_blocks.1.attentions.0.transformer_blocks.0.attn1.to_out.0`.
pub fn normalize_module(module: &str) -> String {
    match module.split_once(".processor.") {
        Some((block, "to_out")) => format!("{}.to_out.0", block),
        Some((block, projection)) => format!("{}.{}", block, projection),
        None => module.to_string(),
    }
}

/// One adapted module: its low-rank pair and scaling
#[derive(Debug)]
pub struct LoraWeight {
    pub component: Component,
    /// Base module path, e.g. `down_blocks.1.attentions.0.transformer_blocks.0.attn1.to_k`
    pub module: String,
    /// Down projection A, flattened to `[rank, in]`
    pub lora_down: Tensor,
    /// Up projection B, flattened to `[out, rank]`
    pub lora_up: Tensor,
    /// Defaults to `rank` when the file stores none
    pub alpha: f32,
    pub rank: usize,
}

impl LoraWeight {
    /// Name of the base tensor this pair modifies
    pub fn target_key(&self) -> String {
        format!("{}.weight", self.module)
    }

    /// `(alpha / rank) * strength * (B @ A)` as an `[out, in]` F32 tensor
    pub fn delta(&self, strength: f32) -> Result<Tensor> {
        let scale = (self.alpha / self.rank as f32) * strength;
        let delta = self.lora_up.matmul(&self.lora_down)?;
        Ok((delta * scale as f64)?)
    }

    fn check_against(&self, base: &Tensor) -> std::result::Result<(), String> {
        let (out_features, up_rank) = self.lora_up.dims2().map_err(|e| e.to_string())?;
        let (down_rank, in_features) = self.lora_down.dims2().map_err(|e| e.to_string())?;
        if up_rank != down_rank {
            return Err(format!("up rank {} != down rank {}", up_rank, down_rank));
        }
        if out_features * in_features != base.elem_count() {
            return Err(format!(
                "delta [{}, {}] does not fit base weight {:?}",
                out_features,
                in_features,
                base.dims()
            ));
        }
        if base.dim(0).ok() != Some(out_features) {
            return Err(format!(
                "output features {} != base {:?}",
                out_features,
                base.dims()
            ));
        }
        Ok(())
    }
}

/// LoRA adapter containing all weight pairs of a fine-tune
#[derive(Debug)]
pub struct LoraAdapter {
    /// Display name
    pub name: String,
    pub path: PathBuf,
    /// Weight pairs keyed by (component, module)
    pub weights: HashMap<(Component, String), LoraWeight>,
}

impl LoraAdapter {
    /// Load every LoRA pair from an adapter artifact
    ///
    /// Tensors are kept on the CPU in F32; they only live until fusion.
    pub fn load(artifact: &AdapterArtifact) -> Result<Self> {
        let path = artifact.weights.as_path();
        info!(path = %path.display(), "Loading LoRA adapter");

        let invalid = |reason: String| WorkflowError::InvalidAdapter {
            path: path.to_path_buf(),
            reason,
        };

        let file_data = std::fs::read(path)
            .with_context(|| format!("Failed to read LoRA file: {}", path.display()))?;
        let tensors = SafeTensors::deserialize(&file_data)
            .map_err(|e| invalid(format!("not a safetensors file ({})", e)))?;

        let mut alphas: HashMap<(Component, String), f32> = HashMap::new();
        let mut downs: HashMap<(Component, String), Tensor> = HashMap::new();
        let mut ups: HashMap<(Component, String), Tensor> = HashMap::new();
        let mut skipped = 0usize;

        for (key, _) in tensors.tensors() {
            if key.starts_with("lora_unet_") || key.starts_with("lora_te") {
                return Err(invalid(format!(
                    "underscore-joined key `{}` cannot be mapped to module paths",
                    key
                ))
                .into());
            }

            let Some((component, module, role)) = parse_lora_key(&key) else {
                debug!(key = %key, "Skipping non-LoRA tensor");
                skipped += 1;
                continue;
            };

            let tensor = load_tensor_from_safetensors(&tensors, &key)?;
            let slot = (component, module);
            match role {
                Role::Alpha => {
                    let alpha = tensor.flatten_all()?.get(0)?.to_scalar::<f32>()?;
                    alphas.insert(slot, alpha);
                }
                Role::Down => {
                    downs.insert(slot, tensor.flatten_from(1)?);
                }
                Role::Up => {
                    ups.insert(slot, tensor.flatten_from(1)?);
                }
            }
        }

        let mut weights = HashMap::new();
        for (slot, lora_down) in downs {
            let Some(lora_up) = ups.remove(&slot) else {
                warn!(module = %slot.1, "LoRA down tensor without matching up tensor");
                continue;
            };
            let rank = lora_down.dim(0)?;
            let alpha = alphas.get(&slot).copied().unwrap_or(rank as f32);
            let (component, module) = slot.clone();

            debug!(
                component = component.name(),
                module = %module,
                rank = rank,
                alpha = alpha,
                "Loaded LoRA weight pair"
            );

            weights.insert(
                slot,
                LoraWeight { component, module, lora_down, lora_up, alpha, rank },
            );
        }

        for (_, module) in ups.keys() {
            warn!(module = %module, "LoRA up tensor without matching down tensor");
        }

        if weights.is_empty() {
            return Err(invalid("no LoRA weight pairs found".to_string()).into());
        }

        let name = path
            .parent()
            .and_then(|p| p.file_name())
            .or_else(|| path.file_stem())
            .and_then(|s| s.to_str())
            .unwrap_or("lora")
            .to_string();

        info!(
            name = %name,
            weight_pairs = weights.len(),
            skipped = skipped,
            "✓ LoRA adapter loaded"
        );

        Ok(Self { name, path: path.to_path_buf(), weights })
    }

    pub fn weight_count(&self) -> usize {
        self.weights.len()
    }

    /// Components touched by this adapter, in a stable order
    pub fn components(&self) -> Vec<Component> {
        let mut components: Vec<Component> = self.weights.keys().map(|(c, _)| *c).collect();
        components.sort();
        components.dedup();
        components
    }

    /// Rank of the first pair, for display
    pub fn rank(&self) -> usize {
        self.weights.values().map(|w| w.rank).max().unwrap_or(0)
    }

    fn pairs_for(&self, component: Component) -> impl Iterator<Item = &LoraWeight> {
        self.weights.values().filter(move |w| w.component == component)
    }

    /// Verify every pair for `component` lands on an existing base weight of
    /// matching shape
    pub fn check_compatible(
        &self,
        component: Component,
        base: &HashMap<String, Tensor>,
    ) -> Result<()> {
        for weight in self.pairs_for(component) {
            let key = weight.target_key();
            let Some(base_weight) = base.get(&key) else {
                return Err(WorkflowError::IncompatibleAdapter {
                    module: format!("{}.{}", component.name(), weight.module),
                    reason: "no such weight in the base model".to_string(),
                }
                .into());
            };
            weight.check_against(base_weight).map_err(|reason| {
                WorkflowError::IncompatibleAdapter {
                    module: format!("{}.{}", component.name(), weight.module),
                    reason,
                }
            })?;
        }
        Ok(())
    }

    /// Fuse the pairs for `component` into `base`, returning how many weights
    /// changed
    ///
    /// Run [`check_compatible`](Self::check_compatible) first; this only
    /// surfaces shape errors from the tensor ops.
    pub fn fuse_into(
        &self,
        component: Component,
        base: &mut HashMap<String, Tensor>,
        strength: f32,
    ) -> Result<usize> {
        let mut fused = 0;
        for weight in self.pairs_for(component) {
            let key = weight.target_key();
            let Some(base_weight) = base.remove(&key) else {
                continue;
            };
            let dtype = base_weight.dtype();
            let delta = weight
                .delta(strength)?
                .to_device(base_weight.device())?
                .reshape(base_weight.shape())?;
            let merged = (base_weight.to_dtype(DType::F32)? + delta)?.to_dtype(dtype)?;
            base.insert(key, merged);
            fused += 1;
        }

        info!(
            component = component.name(),
            fused = fused,
            strength = strength,
            "Fused LoRA weights"
        );
        Ok(fused)
    }
}

/// Load a tensor from safetensors onto the CPU as F32
fn load_tensor_from_safetensors(tensors: &SafeTensors, key: &str) -> Result<Tensor> {
    let view = tensors
        .tensor(key)
        .with_context(|| format!("Tensor not found: {}", key))?;

    let shape: Vec<usize> = view.shape().to_vec();
    let data = view.data();
    let device = &Device::Cpu;

    let tensor = match view.dtype() {
        safetensors::Dtype::F32 => {
            let floats: Vec<f32> = data
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();
            Tensor::from_vec(floats, shape.as_slice(), device)?
        }
        safetensors::Dtype::F16 => {
            let halfs: Vec<half::f16> = data
                .chunks_exact(2)
                .map(|b| half::f16::from_le_bytes([b[0], b[1]]))
                .collect();
            Tensor::from_vec(halfs, shape.as_slice(), device)?
        }
        safetensors::Dtype::BF16 => {
            let bhalfs: Vec<half::bf16> = data
                .chunks_exact(2)
                .map(|b| half::bf16::from_le_bytes([b[0], b[1]]))
                .collect();
            Tensor::from_vec(bhalfs, shape.as_slice(), device)?
        }
        other => anyhow::bail!("Unsupported tensor dtype for {}: {:?}", key, other),
    };

    Ok(tensor.to_dtype(DType::F32)?)
}
