//! Reference recording.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use kolite_core::cancel::CancelToken;
use kolite_core::error::Result;
use kolite_oci::BuildResult;

use crate::Builder;

/// A transparent wrapper that records every reference passed through
/// `build`. The driver threads one per document to associate outputs
/// with the references they depend on.
pub struct Recorder {
    inner: Arc<dyn Builder>,
    references: Mutex<Vec<String>>,
}

impl Recorder {
    pub fn new(inner: Arc<dyn Builder>) -> Self {
        Recorder {
            inner,
            references: Mutex::new(Vec::new()),
        }
    }

    /// The references recorded so far, in build-request order.
    pub fn references(&self) -> Vec<String> {
        self.references
            .lock()
            .map(|refs| refs.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Builder for Recorder {
    async fn is_supported_reference(&self, reference: &str) -> Result<()> {
        self.inner.is_supported_reference(reference).await
    }

    async fn build(&self, token: &CancelToken, reference: &str) -> Result<BuildResult> {
        if let Ok(mut references) = self.references.lock() {
            references.push(reference.to_string());
        }
        self.inner.build(token, reference).await
    }
}
