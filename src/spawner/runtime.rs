//! Container runtime seam.
//!
//! The orchestrator only ever talks to containers through this trait, so
//! tests can substitute a fake and the Docker CLI can be swapped for
//! another runtime without touching the core.

use crate::{LegatusError, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

/// Everything needed to launch one agent container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub image: String,
    pub name: String,
    pub network: String,
    pub env: Vec<(String, String)>,
    /// (host source, container destination) bind mounts.
    pub volumes: Vec<(String, String)>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Launch a detached container; returns its runtime handle (id).
    async fn run(&self, spec: &ContainerSpec) -> Result<String>;
    async fn stop(&self, container_id: &str) -> Result<()>;
    /// Current state string, or None when the container no longer exists.
    async fn status(&self, container_id: &str) -> Result<Option<String>>;
    /// Tail of the combined container output.
    async fn logs_tail(&self, container_id: &str, max_bytes: usize) -> Result<String>;
    async fn remove(&self, container_id: &str) -> Result<()>;
}

/// Shells out to the `docker` CLI with explicit argument arrays.
pub struct DockerRuntime;

impl DockerRuntime {
    async fn docker(args: &[String]) -> Result<std::process::Output> {
        let output = Command::new("docker")
            .args(args)
            .output()
            .await
            .map_err(|e| LegatusError::spawn(format!("failed to run docker: {e}")))?;
        Ok(output)
    }

    fn stderr_of(output: &std::process::Output) -> String {
        String::from_utf8_lossy(&output.stderr).trim().to_string()
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn run(&self, spec: &ContainerSpec) -> Result<String> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            spec.name.clone(),
            "--network".into(),
            spec.network.clone(),
        ];
        for (key, value) in &spec.env {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }
        for (src, dst) in &spec.volumes {
            args.push("-v".into());
            args.push(format!("{src}:{dst}:rw"));
        }
        args.push(spec.image.clone());

        let output = Self::docker(&args).await?;
        if !output.status.success() {
            return Err(LegatusError::spawn(format!(
                "docker run failed for {}: {}",
                spec.name,
                Self::stderr_of(&output)
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn stop(&self, container_id: &str) -> Result<()> {
        let output =
            Self::docker(&["stop".into(), "-t".into(), "10".into(), container_id.into()]).await?;
        if !output.status.success() {
            return Err(LegatusError::spawn(format!(
                "docker stop failed: {}",
                Self::stderr_of(&output)
            )));
        }
        Ok(())
    }

    async fn status(&self, container_id: &str) -> Result<Option<String>> {
        let output = Self::docker(&[
            "inspect".into(),
            "-f".into(),
            "{{.State.Status}}".into(),
            container_id.into(),
        ])
        .await?;
        if !output.status.success() {
            debug!("Container {} not found", container_id);
            return Ok(None);
        }
        Ok(Some(
            String::from_utf8_lossy(&output.stdout).trim().to_string(),
        ))
    }

    async fn logs_tail(&self, container_id: &str, max_bytes: usize) -> Result<String> {
        let output =
            Self::docker(&["logs".into(), "--tail".into(), "200".into(), container_id.into()])
                .await?;
        let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        if combined.len() > max_bytes {
            let cut = combined.len() - max_bytes;
            // Stay on a char boundary
            let cut = combined
                .char_indices()
                .map(|(i, _)| i)
                .find(|&i| i >= cut)
                .unwrap_or(0);
            combined = combined[cut..].to_string();
        }
        Ok(combined)
    }

    async fn remove(&self, container_id: &str) -> Result<()> {
        let output = Self::docker(&["rm".into(), "-f".into(), container_id.into()]).await?;
        if !output.status.success() {
            return Err(LegatusError::spawn(format!(
                "docker rm failed: {}",
                Self::stderr_of(&output)
            )));
        }
        Ok(())
    }
}
