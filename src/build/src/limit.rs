//! Bounded build parallelism.

use std::sync::Arc;

use async_trait::async_trait;
use kolite_core::cancel::CancelToken;
use kolite_core::error::{KoError, Result};
use kolite_oci::BuildResult;
use tokio::sync::Semaphore;

use crate::Builder;

/// Wraps a builder so at most `n` builds run concurrently. Compose the
/// future cache outside this wrapper: awaiters of a shared future must
/// not each hold a token.
pub struct Limiter {
    inner: Arc<dyn Builder>,
    semaphore: Arc<Semaphore>,
}

impl Limiter {
    pub fn new(inner: Arc<dyn Builder>, concurrency: usize) -> Self {
        Limiter {
            inner,
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }
}

#[async_trait]
impl Builder for Limiter {
    async fn is_supported_reference(&self, reference: &str) -> Result<()> {
        self.inner.is_supported_reference(reference).await
    }

    async fn build(&self, token: &CancelToken, reference: &str) -> Result<BuildResult> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| KoError::Cancelled)?;
        self.inner.build(token, reference).await
    }
}
