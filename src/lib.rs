//! DreamBooth-LoRA personalization for Stable Diffusion
//!
//! Fine-tunes a text-to-image model on a handful of subject photos and then
//! samples images of that subject, using the Candle ML framework for
//! inference and the diffusers DreamBooth script for training.
//!
//! ## Features
//!
//! - **Model acquisition**: SD 1.5 / 2.1 / XL from the HuggingFace Hub or a local directory
//! - **Memory placement**: keep components resident, or build each one only while it runs
//! - **Fine-tuning**: launches `accelerate launch train_dreambooth_lora_sdxl.py` and waits for it
//! - **Adapter fusion**: merges the trained LoRA into the base weights after a shape check
//! - **Reproducible**: seeded latents give the same image for the same prompt
//!
//! ## Usage
//!
//! ```rust,ignore
//! use lora_personalize::config::{PlacementPolicy, Precision, WorkflowConfig};
//! use lora_personalize::workflow::{attach_adapter, fine_tune, generate, load_base_pipeline};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = WorkflowConfig::default();
//!
//!     // Train on ./dog, writing the adapter to ./lora-trained-xl
//!     let adapter = fine_tune(&config.trainer, &config.training).await?;
//!
//!     let pipeline = load_base_pipeline(
//!         "stabilityai/stable-diffusion-xl-base-1.0",
//!         Precision::F16,
//!         PlacementPolicy::Offload,
//!     )
//!     .await?;
//!     let pipeline = attach_adapter(pipeline, &adapter.dir)?;
//!
//!     generate(&pipeline, "A picture of sks dog in a bucket", Some(25))?
//!         .save("dog-bucket.png")?;
//!
//!     Ok(())
//! }
//! ```

pub mod compare;
pub mod config;
pub mod download;
pub mod error;
pub mod lora;
pub mod models;
pub mod pipeline;
pub mod setup;
pub mod trainer;
pub mod workflow;

pub use error::WorkflowError;
