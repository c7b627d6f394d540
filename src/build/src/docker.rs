//! Dockerfile builder.
//!
//! References of the form `docker://<path-to-Dockerfile>` build with the
//! docker CLI against the current directory as context, then load the
//! result back out of the daemon as an in-memory image.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use kolite_core::cancel::CancelToken;
use kolite_core::error::{KoError, Result};
use kolite_core::reference::Reference;
use kolite_oci::{archive, sha256_hex, BuildResult};
use tokio::process::Command;

use crate::Builder;

/// Scheme strict references use to select this builder.
pub const SCHEME: &str = "docker";

/// Builds Dockerfiles through the docker CLI.
pub struct DockerBuilder {
    context_dir: PathBuf,
}

impl DockerBuilder {
    pub fn new() -> Self {
        DockerBuilder {
            context_dir: PathBuf::from("."),
        }
    }

    pub fn with_context_dir(mut self, dir: PathBuf) -> Self {
        self.context_dir = dir;
        self
    }

    /// A daemon tag for the intermediate build, stable per Dockerfile.
    fn build_tag(dockerfile: &str) -> String {
        format!("ko.local/build-{}", &sha256_hex(dockerfile.as_bytes())[..16])
    }

    async fn run(
        &self,
        token: &CancelToken,
        mut command: Command,
        action: &str,
    ) -> Result<Vec<u8>> {
        let mut child = command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        // Drain both pipes while waiting; `docker save` output is large
        // enough to fill the pipe buffer otherwise.
        let mut stdout_pipe = child.stdout.take().ok_or_else(|| KoError::Toolchain {
            stderr: "stdout pipe unavailable".to_string(),
        })?;
        let mut stderr_pipe = child.stderr.take().ok_or_else(|| KoError::Toolchain {
            stderr: "stderr pipe unavailable".to_string(),
        })?;
        let stdout_task = tokio::spawn(async move {
            use tokio::io::AsyncReadExt;
            let mut buf = Vec::new();
            let _ = stdout_pipe.read_to_end(&mut buf).await;
            buf
        });
        let stderr_task = tokio::spawn(async move {
            use tokio::io::AsyncReadExt;
            let mut buf = Vec::new();
            let _ = stderr_pipe.read_to_end(&mut buf).await;
            buf
        });

        let status = tokio::select! {
            output = child.wait() => Some(output?),
            _ = token.cancelled() => None,
        };
        let status = match status {
            Some(status) => status,
            None => {
                let _ = child.kill().await;
                return Err(KoError::Cancelled);
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        if !status.success() {
            return Err(KoError::Toolchain {
                stderr: format!("{}: {}", action, String::from_utf8_lossy(&stderr).trim()),
            });
        }
        Ok(stdout)
    }
}

impl Default for DockerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Builder for DockerBuilder {
    async fn is_supported_reference(&self, reference: &str) -> Result<()> {
        let r = Reference::parse(reference);
        if r.scheme() != Some(SCHEME) {
            return Err(KoError::Reference(format!(
                "{:?} does not start with {}://",
                reference, SCHEME
            )));
        }
        Ok(())
    }

    async fn build(&self, token: &CancelToken, reference: &str) -> Result<BuildResult> {
        self.is_supported_reference(reference).await?;
        let r = Reference::parse(reference);
        let dockerfile = r.path();
        let tag = Self::build_tag(dockerfile);

        tracing::info!("Building {}", dockerfile);

        let mut build = Command::new("docker");
        build
            .arg("build")
            .arg("-f")
            .arg(dockerfile)
            .arg("-t")
            .arg(&tag)
            .arg(&self.context_dir);
        self.run(token, build, "docker build").await?;

        let mut save = Command::new("docker");
        save.arg("save").arg(&tag);
        let archive_bytes = self.run(token, save, "docker save").await?;

        let image = archive::read_docker_archive(&archive_bytes[..])?;
        Ok(BuildResult::Image(image))
    }
}
