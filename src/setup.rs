//! Installation of the external trainer
//!
//! Clones the diffusers repository, installs it with its DreamBooth
//! requirements, and writes a default `accelerate` config. Every step is a
//! subprocess whose output is relayed into the log.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::WorkflowError;
use crate::trainer::forward_lines;

/// Repository providing `train_dreambooth_lora_sdxl.py`
pub const DIFFUSERS_REPO_URL: &str = "https://github.com/huggingface/diffusers";

/// Requirements file of the DreamBooth SDXL script, relative to the checkout
pub const DREAMBOOTH_REQUIREMENTS: &str = "examples/dreambooth/requirements_sdxl.txt";

/// `[setup]` options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SetupConfig {
    pub repo_url: String,
    pub checkout_dir: PathBuf,
    pub pip: String,
    pub accelerate: String,
}

impl Default for SetupConfig {
    fn default() -> Self {
        Self {
            repo_url: DIFFUSERS_REPO_URL.to_string(),
            checkout_dir: PathBuf::from("diffusers"),
            pip: "pip".to_string(),
            accelerate: "accelerate".to_string(),
        }
    }
}

/// One subprocess of the installation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupStep {
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
}

impl SetupStep {
    fn new(name: &str, program: &str, args: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// Shell-like rendering for logs
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    async fn run(&self) -> Result<()> {
        info!(step = %self.name, command = %self.display(), "Running setup step");

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to launch `{}`", self.program))?;

        let stdout = child.stdout.take().map(|s| tokio::spawn(forward_lines(s, "stdout")));
        let stderr = child.stderr.take().map(|s| tokio::spawn(forward_lines(s, "stderr")));

        let status = child
            .wait()
            .await
            .with_context(|| format!("Failed to wait for `{}`", self.program))?;

        for task in [stdout, stderr].into_iter().flatten() {
            task.await.context("Setup output task panicked")??;
        }

        if !status.success() {
            return Err(WorkflowError::SetupStepFailed {
                step: self.name.clone(),
                status,
            }
            .into());
        }

        debug!(step = %self.name, "Setup step finished");
        Ok(())
    }
}

/// Ordered installation steps
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupPlan {
    pub steps: Vec<SetupStep>,
}

impl SetupPlan {
    /// Plan for `config`; the clone is skipped when the checkout already exists
    pub fn new(config: &SetupConfig) -> Self {
        let checkout = config.checkout_dir.display().to_string();
        let requirements = config
            .checkout_dir
            .join(DREAMBOOTH_REQUIREMENTS)
            .display()
            .to_string();

        let mut steps = Vec::new();
        if is_checkout(&config.checkout_dir) {
            info!(dir = %checkout, "Trainer repository already checked out, skipping clone");
        } else {
            steps.push(SetupStep::new(
                "clone",
                "git",
                &["clone", "--depth", "1", &config.repo_url, &checkout],
            ));
        }
        steps.push(SetupStep::new("install", &config.pip, &["install", "-e", &checkout]));
        steps.push(SetupStep::new(
            "requirements",
            &config.pip,
            &["install", "-r", &requirements],
        ));
        steps.push(SetupStep::new(
            "accelerate-config",
            &config.accelerate,
            &["config", "default"],
        ));

        Self { steps }
    }

    /// Run every step in order, stopping at the first failure
    pub async fn run(&self) -> Result<()> {
        let total = self.steps.len();
        for (i, step) in self.steps.iter().enumerate() {
            info!("Setup {}/{}: {}", i + 1, total, step.name);
            step.run().await?;
        }
        info!("✓ Trainer setup complete");
        Ok(())
    }
}

fn is_checkout(dir: &Path) -> bool {
    dir.join(".git").exists()
}

/// Install the trainer described by `config`
pub async fn setup(config: &SetupConfig) -> Result<()> {
    SetupPlan::new(config).run().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_plan_for_fresh_checkout() {
        let dir = TempDir::new().unwrap();
        let config = SetupConfig {
            checkout_dir: dir.path().join("diffusers"),
            ..Default::default()
        };

        let plan = SetupPlan::new(&config);
        let names: Vec<&str> = plan.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["clone", "install", "requirements", "accelerate-config"]);

        let clone = &plan.steps[0];
        assert_eq!(clone.program, "git");
        assert_eq!(&clone.args[..3], ["clone", "--depth", "1"]);
        assert_eq!(clone.args[3], DIFFUSERS_REPO_URL);
        assert!(plan.steps[2].args[2].ends_with("requirements_sdxl.txt"));
    }

    #[test]
    fn test_plan_skips_existing_checkout() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        let config = SetupConfig {
            checkout_dir: dir.path().to_path_buf(),
            ..Default::default()
        };

        let plan = SetupPlan::new(&config);
        assert_eq!(plan.steps.len(), 3);
        assert_eq!(plan.steps[0].display(), format!("pip install -e {}", dir.path().display()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_step_stops_the_plan() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("ran");
        let plan = SetupPlan {
            steps: vec![
                SetupStep::new("broken", "sh", &["-c", "echo boom >&2; exit 2"]),
                SetupStep::new("after", "touch", &[&marker.display().to_string()]),
            ],
        };

        let err = plan.run().await.unwrap_err();
        match err.downcast_ref::<WorkflowError>() {
            Some(WorkflowError::SetupStepFailed { step, status }) => {
                assert_eq!(step, "broken");
                assert_eq!(status.code(), Some(2));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(!marker.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_successful_steps_run_in_order() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("log");
        let append = |word: &str| {
            SetupStep::new(word, "sh", &["-c", &format!("echo {} >> {}", word, log.display())])
        };
        let plan = SetupPlan {
            steps: vec![append("first"), append("second")],
        };

        plan.run().await.unwrap();
        assert_eq!(std::fs::read_to_string(&log).unwrap(), "first\nsecond\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_step_with_binary_output_succeeds() {
        let step = SetupStep::new(
            "noisy",
            "sh",
            &["-c", "printf 'Collecting \\377\\n'; printf '\\376\\375' >&2; echo done"],
        );
        step.run().await.unwrap();
    }
}
