//! Subprocess-delegate builder.
//!
//! A strict reference whose scheme names a builder executable, e.g.
//! `ko-go://github.com/foo/cmd/app`. Building runs `<scheme> build`,
//! writes a JSON request on its stdin, reads a JSON response naming the
//! published reference, and fetches that reference through the registry
//! client.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use kolite_core::cancel::CancelToken;
use kolite_core::error::{KoError, Result};
use kolite_core::reference::Reference;
use kolite_oci::{BuildResult, RegistryClient};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

use crate::Builder;

/// Delegate executables are namespaced under this prefix.
pub const SCHEME_PREFIX: &str = "ko-";

/// Request written to a delegate's stdin.
#[derive(Debug, Serialize, Deserialize)]
pub struct Request {
    pub uri: String,
}

/// Response read from a delegate's stdout.
#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub uri: String,
    pub reference: String,
}

/// Fetches the build result a delegate published.
#[async_trait]
pub trait ResultFetcher: Send + Sync {
    async fn fetch(&self, reference: &str) -> Result<BuildResult>;
}

#[async_trait]
impl ResultFetcher for RegistryClient {
    async fn fetch(&self, reference: &str) -> Result<BuildResult> {
        RegistryClient::fetch(self, reference).await
    }
}

/// Delegates builds to an external builder executable.
pub struct DelegateBuilder {
    fetcher: Arc<dyn ResultFetcher>,
    prefix: String,
}

impl DelegateBuilder {
    pub fn new(fetcher: Arc<dyn ResultFetcher>) -> Self {
        DelegateBuilder {
            fetcher,
            prefix: SCHEME_PREFIX.to_string(),
        }
    }

    /// Accept schemes under a different executable prefix.
    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.to_string();
        self
    }
}

#[async_trait]
impl Builder for DelegateBuilder {
    async fn is_supported_reference(&self, reference: &str) -> Result<()> {
        let r = Reference::parse(reference);
        match r.scheme() {
            Some(scheme) if scheme.starts_with(&self.prefix) => Ok(()),
            _ => Err(KoError::Reference(format!(
                "{:?} does not name a {}* builder",
                reference, self.prefix
            ))),
        }
    }

    async fn build(&self, token: &CancelToken, reference: &str) -> Result<BuildResult> {
        self.is_supported_reference(reference).await?;
        let r = Reference::parse(reference);
        let program = match r.scheme() {
            Some(scheme) => scheme.to_string(),
            None => return Err(KoError::Reference(format!("not a reference: {}", reference))),
        };

        let request = serde_json::to_vec(&Request {
            uri: r.path().to_string(),
        })?;

        let mut child = Command::new(&program)
            .arg("build")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                KoError::Reference(format!("cannot run builder {:?}: {}", program, e))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&request).await?;
            stdin.write_all(b"\n").await?;
        }

        let mut stdout_pipe = child.stdout.take().ok_or_else(|| KoError::Toolchain {
            stderr: "stdout pipe unavailable".to_string(),
        })?;
        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stdout_pipe.read_to_end(&mut buf).await;
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
        let stdout = stdout_task.await.unwrap_or_default();

        if !status.success() {
            return Err(KoError::Toolchain {
                stderr: format!("builder {:?} exited with {}", program, status),
            });
        }

        let response: Response = serde_json::from_slice(&stdout).map_err(|e| {
            KoError::Serialization(format!("builder {:?} response: {}", program, e))
        })?;
        self.fetcher.fetch(&response.reference).await
    }
}
