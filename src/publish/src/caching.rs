//! Publish memoization.
//!
//! Same cell construction as the build cache, but keyed by the built
//! result's content digest: two references producing byte-identical
//! results publish once and share the returned name.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use kolite_core::cancel::CancelToken;
use kolite_core::error::{KoError, Result};
use kolite_core::name::ImageName;
use kolite_oci::BuildResult;
use tokio::sync::{watch, Mutex};

use crate::Publisher;

type SharedPublish = std::result::Result<ImageName, Arc<KoError>>;
type Slot = watch::Receiver<Option<SharedPublish>>;

enum Entry {
    Existing(Slot),
    Created(watch::Sender<Option<SharedPublish>>),
}

/// Memoizing wrapper around a publisher.
pub struct Caching {
    inner: Arc<dyn Publisher>,
    results: Mutex<HashMap<String, Slot>>,
}

impl Caching {
    pub fn new(inner: Arc<dyn Publisher>) -> Self {
        Caching {
            inner,
            results: Mutex::new(HashMap::new()),
        }
    }

    async fn entry_for(&self, digest: &str) -> Entry {
        let mut results = self.results.lock().await;
        match results.get(digest) {
            Some(slot) => Entry::Existing(slot.clone()),
            None => {
                let (tx, rx) = watch::channel(None);
                results.insert(digest.to_string(), rx);
                Entry::Created(tx)
            }
        }
    }
}

#[async_trait]
impl Publisher for Caching {
    async fn publish(
        &self,
        token: &CancelToken,
        result: &BuildResult,
        reference: &str,
    ) -> Result<ImageName> {
        let digest = result.digest()?;

        match self.entry_for(&digest).await {
            Entry::Created(tx) => {
                let shared: SharedPublish = self
                    .inner
                    .publish(token, result, reference)
                    .await
                    .map_err(Arc::new);
                let _ = tx.send(Some(shared.clone()));
                shared.map_err(KoError::Shared)
            }
            Entry::Existing(mut slot) => {
                let value = slot
                    .wait_for(|v| v.is_some())
                    .await
                    .map_err(|_| {
                        KoError::Resolve(format!("publish of {:?} was abandoned", reference))
                    })?
                    .clone();
                match value {
                    Some(Ok(name)) => Ok(name),
                    Some(Err(err)) => Err(KoError::Shared(err)),
                    None => Err(KoError::Resolve(format!(
                        "publish of {:?} produced no result",
                        reference
                    ))),
                }
            }
        }
    }
}
