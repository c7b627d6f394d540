//! Build memoization.
//!
//! A process-wide map from reference to a write-once result cell. The
//! first requester creates the cell and runs the wrapped builder; every
//! concurrent or later requester awaits the same cell. The map lock is
//! held only around lookups and inserts, never across the build.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use kolite_core::cancel::CancelToken;
use kolite_core::error::{KoError, Result};
use kolite_oci::BuildResult;
use tokio::sync::{watch, Mutex};

use crate::Builder;

type SharedResult = std::result::Result<BuildResult, Arc<KoError>>;
type Slot = watch::Receiver<Option<SharedResult>>;

enum Entry {
    Existing(Slot),
    Created(watch::Sender<Option<SharedResult>>),
}

/// Memoizing wrapper around a builder.
pub struct Caching {
    inner: Arc<dyn Builder>,
    results: Mutex<HashMap<String, Slot>>,
}

impl Caching {
    pub fn new(inner: Arc<dyn Builder>) -> Self {
        Caching {
            inner,
            results: Mutex::new(HashMap::new()),
        }
    }

    /// Drop the cached future for a reference so the next request
    /// rebuilds it. In-flight awaiters still observe the old result.
    pub async fn invalidate(&self, reference: &str) {
        self.results.lock().await.remove(reference);
    }

    async fn entry_for(&self, reference: &str) -> Entry {
        let mut results = self.results.lock().await;
        match results.get(reference) {
            Some(slot) => Entry::Existing(slot.clone()),
            None => {
                let (tx, rx) = watch::channel(None);
                results.insert(reference.to_string(), rx);
                Entry::Created(tx)
            }
        }
    }
}

#[async_trait]
impl Builder for Caching {
    async fn is_supported_reference(&self, reference: &str) -> Result<()> {
        self.inner.is_supported_reference(reference).await
    }

    async fn build(&self, token: &CancelToken, reference: &str) -> Result<BuildResult> {
        match self.entry_for(reference).await {
            Entry::Created(tx) => {
                let shared: SharedResult =
                    self.inner.build(token, reference).await.map_err(Arc::new);
                let _ = tx.send(Some(shared.clone()));
                shared.map_err(KoError::Shared)
            }
            Entry::Existing(mut slot) => {
                let value = slot
                    .wait_for(|v| v.is_some())
                    .await
                    .map_err(|_| {
                        KoError::Resolve(format!("build of {:?} was abandoned", reference))
                    })?
                    .clone();
                match value {
                    Some(Ok(result)) => Ok(result),
                    Some(Err(err)) => Err(KoError::Shared(err)),
                    None => Err(KoError::Resolve(format!(
                        "build of {:?} produced no result",
                        reference
                    ))),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kolite_core::Platform;
    use kolite_oci::Image;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct SlowBuilder {
        builds: AtomicUsize,
        delay: Duration,
        fail: bool,
    }

    impl SlowBuilder {
        fn new(delay: Duration) -> Self {
            SlowBuilder {
                builds: AtomicUsize::new(0),
                delay,
                fail: false,
            }
        }

        fn failing() -> Self {
            SlowBuilder {
                builds: AtomicUsize::new(0),
                delay: Duration::from_millis(5),
                fail: true,
            }
        }
    }

    #[async_trait]
    impl Builder for SlowBuilder {
        async fn is_supported_reference(&self, _reference: &str) -> Result<()> {
            Ok(())
        }

        async fn build(&self, _token: &CancelToken, _reference: &str) -> Result<BuildResult> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(KoError::Import("broken".to_string()));
            }
            Ok(BuildResult::Image(Image::scratch(&Platform::new(
                "linux", "amd64",
            ))?))
        }
    }

    #[tokio::test]
    async fn test_concurrent_requests_build_once() {
        let inner = Arc::new(SlowBuilder::new(Duration::from_millis(50)));
        let caching = Arc::new(Caching::new(inner.clone()));
        let token = CancelToken::new();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let caching = caching.clone();
            let token = token.clone();
            handles.push(tokio::spawn(async move {
                caching.build(&token, "ko://./cmd/app").await
            }));
        }

        let mut digests = Vec::new();
        for handle in handles {
            let result = handle.await.unwrap().unwrap();
            digests.push(result.digest().unwrap());
        }
        digests.dedup();
        assert_eq!(digests.len(), 1);
        assert_eq!(inner.builds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_second_request_is_fast() {
        let inner = Arc::new(SlowBuilder::new(Duration::from_millis(50)));
        let caching = Caching::new(inner.clone());
        let token = CancelToken::new();

        caching.build(&token, "r").await.unwrap();
        let start = std::time::Instant::now();
        caching.build(&token, "r").await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(50));
        assert_eq!(inner.builds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_distinct_references_build_separately() {
        let inner = Arc::new(SlowBuilder::new(Duration::from_millis(1)));
        let caching = Caching::new(inner.clone());
        let token = CancelToken::new();

        caching.build(&token, "a").await.unwrap();
        caching.build(&token, "b").await.unwrap();
        assert_eq!(inner.builds.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failures_are_memoized_and_shared() {
        let inner = Arc::new(SlowBuilder::failing());
        let caching = Caching::new(inner.clone());
        let token = CancelToken::new();

        let first = caching.build(&token, "r").await.unwrap_err();
        assert!(matches!(first, KoError::Shared(_)));
        let second = caching.build(&token, "r").await.unwrap_err();
        assert!(second.to_string().contains("broken"));
        assert_eq!(inner.builds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidate_triggers_rebuild() {
        let inner = Arc::new(SlowBuilder::new(Duration::from_millis(1)));
        let caching = Caching::new(inner.clone());
        let token = CancelToken::new();

        caching.build(&token, "r").await.unwrap();
        caching.invalidate("r").await;
        caching.build(&token, "r").await.unwrap();
        assert_eq!(inner.builds.load(Ordering::SeqCst), 2);
    }
}
