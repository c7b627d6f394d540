//! Daemon side-load publisher.
//!
//! Streams the built image into the local container daemon as a docker
//! archive via `docker load`, tagged `ko.local/<name>:<hexdigest>`, and
//! aliases any user-specified tags onto the same image.

use std::process::Stdio;

use async_trait::async_trait;
use kolite_core::cancel::CancelToken;
use kolite_core::error::{KoError, Result};
use kolite_core::name::ImageName;
use kolite_oci::{archive, BuildResult, Image};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::{Namer, Publisher, LOCAL_DOMAIN};

/// Publishes images into the local container daemon.
pub struct Daemon {
    namer: Namer,
    tags: Vec<String>,
}

impl Daemon {
    pub fn new(namer: Namer, tags: Vec<String>) -> Self {
        Daemon { namer, tags }
    }

    /// Reduce a build result to the single image the daemon will hold.
    /// An index contributes its first manifest.
    fn to_image(result: &BuildResult) -> Result<Image> {
        match result {
            BuildResult::Image(image) => Ok(image.clone()),
            BuildResult::Index(index) => {
                tracing::warn!(
                    "daemon publish of an index uses its first manifest; other platforms are dropped"
                );
                index
                    .first_image()
                    .cloned()
                    .ok_or_else(|| KoError::Publish("index has no manifests".to_string()))
            }
        }
    }

    async fn docker(&self, token: &CancelToken, args: &[&str], stdin: Option<Vec<u8>>) -> Result<()> {
        let mut command = Command::new("docker");
        command
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let mut child = command.spawn()?;

        if let (Some(data), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(&data).await?;
            // Closing stdin lets the daemon finish reading the archive.
            drop(pipe);
        }

        let mut stderr_pipe = child.stderr.take().ok_or_else(|| {
            KoError::Publish("stderr pipe unavailable".to_string())
        })?;
        let stderr_task = tokio::spawn(async move {
            use tokio::io::AsyncReadExt;
            let mut buf = Vec::new();
            let _ = stderr_pipe.read_to_end(&mut buf).await;
            buf
        });

        let status = tokio::select! {
            status = child.wait() => Some(status?),
            _ = token.cancelled() => None,
        };
        let status = match status {
            Some(status) => status,
            None => {
                let _ = child.kill().await;
                return Err(KoError::Cancelled);
            }
        };
        let stderr = stderr_task.await.unwrap_or_default();

        if !status.success() {
            return Err(KoError::Publish(format!(
                "docker {}: {}",
                args.first().unwrap_or(&""),
                String::from_utf8_lossy(&stderr).trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Publisher for Daemon {
    async fn publish(
        &self,
        token: &CancelToken,
        result: &BuildResult,
        reference: &str,
    ) -> Result<ImageName> {
        let reference = reference.to_lowercase();
        let image = Self::to_image(result)?;

        let digest = image.digest()?;
        let hex = digest.strip_prefix("sha256:").unwrap_or(&digest);
        let repository = format!("{}/{}", LOCAL_DOMAIN, self.namer.name(&reference));
        let digest_tag = ImageName::new_tag(&repository, hex)?;

        let mut archive_bytes = Vec::new();
        archive::write_docker_archive(&image, &[digest_tag.qualified()], &mut archive_bytes)?;

        tracing::info!("Loading {}", digest_tag);
        self.docker(token, &["load"], Some(archive_bytes)).await?;
        tracing::info!("Loaded {}", digest_tag);

        for tag in &self.tags {
            let alias = ImageName::new_tag(&repository, tag)?;
            tracing::info!("Adding tag {}", alias);
            self.docker(
                token,
                &["tag", &digest_tag.qualified(), &alias.qualified()],
                None,
            )
            .await?;
            tracing::info!("Added tag {}", alias);
        }

        Ok(digest_tag)
    }
}
