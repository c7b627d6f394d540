//! Registry publisher.
//!
//! Pushes built results under `<repo>/<name>` through the registry
//! client and returns a digest-qualified name.

use std::sync::Arc;

use async_trait::async_trait;
use kolite_core::cancel::CancelToken;
use kolite_core::error::{KoError, Result};
use kolite_core::name::ImageName;
use kolite_oci::{BuildResult, RegistryClient};

use crate::{Namer, Publisher};

const DEFAULT_TAG: &str = "latest";

/// Publishes build results to a remote registry.
pub struct Registry {
    repo: String,
    client: Arc<RegistryClient>,
    namer: Namer,
    tags: Vec<String>,
}

impl Registry {
    pub fn new(repo: &str, client: Arc<RegistryClient>) -> Self {
        Registry {
            repo: repo.trim_end_matches('/').to_string(),
            client,
            namer: Namer::new(),
            tags: Vec::new(),
        }
    }

    pub fn with_namer(mut self, namer: Namer) -> Self {
        self.namer = namer;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }
}

#[async_trait]
impl Publisher for Registry {
    async fn publish(
        &self,
        token: &CancelToken,
        result: &BuildResult,
        reference: &str,
    ) -> Result<ImageName> {
        let reference = reference.to_lowercase();
        let repository = format!("{}/{}", self.repo, self.namer.name(&reference));
        let digest = result.digest()?;

        let mut tags = Vec::with_capacity(self.tags.len() + 1);
        tags.push(DEFAULT_TAG.to_string());
        tags.extend(self.tags.iter().cloned());

        let mut published = None;
        for tag in &tags {
            let name = ImageName::new_tag(&repository, tag)?;
            tracing::info!("Publishing {}", name);
            tokio::select! {
                pushed = self.client.push(&name, result) => pushed?,
                _ = token.cancelled() => return Err(KoError::Cancelled),
            }
            tracing::info!("Published {}", name);
            published.get_or_insert(name);
        }

        let published = published
            .ok_or_else(|| KoError::Publish(format!("no tags to publish for {}", reference)))?;
        Ok(published.with_digest(&digest))
    }
}
