//! Builders turn symbolic references into container images.
//!
//! The build pipeline is polymorphic over two capabilities: deciding
//! whether a reference is supported, and building it into an image or
//! index. Known variants are the native Go toolchain builder, the
//! dockerfile builder, and the subprocess delegate. Decorators (future
//! cache, limiter, recorder) wrap any builder; composition order is
//! cache → limiter → builder so awaiters of a shared future do not each
//! consume a limiter token.

use std::sync::Arc;

use async_trait::async_trait;
use kolite_core::cancel::CancelToken;
use kolite_core::error::{KoError, Result};
use kolite_oci::BuildResult;

pub mod caching;
pub mod delegate;
pub mod docker;
pub mod gobuild;
pub mod limit;
pub mod meta_cache;
pub mod recorder;
pub mod tar;
pub mod toolchain;

pub use caching::Caching;
pub use delegate::DelegateBuilder;
pub use docker::DockerBuilder;
pub use gobuild::GoBuilder;
pub use limit::Limiter;
pub use meta_cache::MetaCache;
pub use recorder::Recorder;

/// A builder of container images from symbolic references.
#[async_trait]
pub trait Builder: Send + Sync {
    /// Validate that this builder can turn the reference into an image.
    async fn is_supported_reference(&self, reference: &str) -> Result<()>;

    /// Build the reference into an image or index.
    async fn build(&self, token: &CancelToken, reference: &str) -> Result<BuildResult>;
}

/// Supplies the base image (or index) a reference is layered onto.
#[async_trait]
pub trait BaseProvider: Send + Sync {
    async fn base_for(&self, path: &str) -> Result<BuildResult>;
}

/// Dispatches across registered builders, first match wins.
pub struct MultiBuilder {
    builders: Vec<Arc<dyn Builder>>,
}

impl MultiBuilder {
    pub fn new(builders: Vec<Arc<dyn Builder>>) -> Self {
        Self { builders }
    }
}

#[async_trait]
impl Builder for MultiBuilder {
    async fn is_supported_reference(&self, reference: &str) -> Result<()> {
        let mut rejection = KoError::Reference(format!(
            "no registered builder supports {:?}",
            reference
        ));
        for builder in &self.builders {
            match builder.is_supported_reference(reference).await {
                Ok(()) => return Ok(()),
                // A non-Reference error means a builder claimed the scheme
                // but could not accept the reference; surface that one.
                Err(err) if !matches!(err, KoError::Reference(_)) => rejection = err,
                Err(_) => {}
            }
        }
        Err(rejection)
    }

    async fn build(&self, token: &CancelToken, reference: &str) -> Result<BuildResult> {
        for builder in &self.builders {
            if builder.is_supported_reference(reference).await.is_ok() {
                return builder.build(token, reference).await;
            }
        }
        Err(KoError::Reference(format!(
            "no registered builder supports {:?}",
            reference
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedBuilder {
        scheme: &'static str,
        import_error: bool,
    }

    #[async_trait]
    impl Builder for FixedBuilder {
        async fn is_supported_reference(&self, reference: &str) -> Result<()> {
            let r = kolite_core::Reference::parse(reference);
            if r.scheme() != Some(self.scheme) {
                return Err(KoError::Reference(format!("not {}://", self.scheme)));
            }
            if self.import_error {
                return Err(KoError::Import("not a command".to_string()));
            }
            Ok(())
        }

        async fn build(&self, _token: &CancelToken, _reference: &str) -> Result<BuildResult> {
            let image = kolite_oci::Image::scratch(&kolite_core::Platform::new("linux", "amd64"))?;
            Ok(BuildResult::Image(image))
        }
    }

    #[tokio::test]
    async fn test_multi_builder_dispatches_on_scheme() {
        let builders: Vec<Arc<dyn Builder>> = vec![
            Arc::new(FixedBuilder { scheme: "ko", import_error: false }),
            Arc::new(FixedBuilder { scheme: "docker", import_error: false }),
        ];
        let multi = MultiBuilder::new(builders);
        assert!(multi.is_supported_reference("ko://./cmd/app").await.is_ok());
        assert!(multi.is_supported_reference("docker://Dockerfile").await.is_ok());
        assert!(multi.is_supported_reference("other://x").await.is_err());
    }

    #[tokio::test]
    async fn test_multi_builder_surfaces_scheme_owner_error() {
        let builders: Vec<Arc<dyn Builder>> = vec![Arc::new(FixedBuilder {
            scheme: "ko",
            import_error: true,
        })];
        let multi = MultiBuilder::new(builders);
        let err = multi.is_supported_reference("ko://./not-main").await.unwrap_err();
        assert!(matches!(err, KoError::Import(_)));
    }

    #[tokio::test]
    async fn test_multi_builder_builds_through_match() {
        let builders: Vec<Arc<dyn Builder>> = vec![Arc::new(FixedBuilder {
            scheme: "ko",
            import_error: false,
        })];
        let multi = MultiBuilder::new(builders);
        let token = CancelToken::new();
        assert!(multi.build(&token, "ko://./cmd/app").await.is_ok());
        assert!(multi.build(&token, "nope://x").await.is_err());
    }
}
