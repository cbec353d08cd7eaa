//! Side-by-side adapter comparison
//!
//! Renders the same prompt and seed twice, once with the base model and once
//! with the adapter fused in, so the adapter's effect can be judged directly.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::ModelConfig;
use crate::lora::AdapterArtifact;
use crate::pipeline::{GenerateOptions, PipelineHandle};

/// Result of a side-by-side comparison
pub struct ComparisonResult {
    pub baseline_path: PathBuf,
    pub with_lora_path: PathBuf,
}

/// Generate `baseline.png` and `with_lora.png` into `output_dir`
///
/// The base pipeline is dropped before the adapter pipeline is built, so peak
/// device memory is that of a single pipeline. A missing seed is replaced by
/// a fixed one; both images must start from the same noise.
pub async fn compare_with_without_lora<P: AsRef<Path>>(
    model: &ModelConfig,
    adapter: &AdapterArtifact,
    prompt: &str,
    options: &GenerateOptions,
    strength: f32,
    output_dir: P,
) -> Result<ComparisonResult> {
    let output_dir = output_dir.as_ref();
    let seed = options.seed.unwrap_or(42);
    let options = options.clone().with_seed(seed);

    info!("╔════════════════════════════════════════════════════════╗");
    info!("║     Base model vs. LoRA side-by-side comparison        ║");
    info!("╚════════════════════════════════════════════════════════╝");
    info!("");
    info!("Prompt: \"{}\"", prompt);
    info!("LoRA: {}", adapter.weights.display());
    info!("Strength: {}", strength);
    info!("Seed: {}", seed);
    info!("");

    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create {}", output_dir.display()))?;

    info!("┌─ Baseline Generation (No LoRA) ──────────────────────┐");
    let baseline = {
        let pipeline = PipelineHandle::load(model).await?;
        let image = pipeline.generate(prompt, &options)?;
        drop(pipeline);
        info!("  ✓ Base pipeline unloaded");
        image
    };

    let baseline_path = output_dir.join("baseline.png");
    baseline.save(&baseline_path)?;
    info!("└─ ✓ Saved: {}", baseline_path.display());
    info!("");

    info!("┌─ LoRA Generation (Strength: {}) ─────────────────┐", strength);
    let with_lora = {
        let pipeline = PipelineHandle::load(model)
            .await?
            .attach_adapter(adapter, strength)?;
        let image = pipeline.generate(prompt, &options)?;
        drop(pipeline);
        info!("  ✓ Adapter pipeline unloaded");
        image
    };

    let with_lora_path = output_dir.join("with_lora.png");
    with_lora.save(&with_lora_path)?;
    info!("└─ ✓ Saved: {}", with_lora_path.display());
    info!("");

    info!("📊 Results:");
    info!("  • Baseline:   {}", baseline_path.display());
    info!("  • With LoRA:  {}", with_lora_path.display());

    Ok(ComparisonResult {
        baseline_path,
        with_lora_path,
    })
}
