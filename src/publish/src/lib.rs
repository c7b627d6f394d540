//! Publishers move built images to where a cluster can pull them: a
//! local container daemon or a remote registry. The publish future
//! cache wraps either so byte-identical results publish once.

use async_trait::async_trait;
use kolite_core::cancel::CancelToken;
use kolite_core::error::Result;
use kolite_core::name::ImageName;
use kolite_core::reference::Reference;
use kolite_oci::BuildResult;

pub mod caching;
pub mod daemon;
pub mod registry;

pub use caching::Caching;
pub use daemon::Daemon;
pub use registry::Registry;

/// A sentinel "registry" that selects side-loading into the daemon.
pub const LOCAL_DOMAIN: &str = "ko.local";

/// A publisher of build results.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish the result for the given reference, returning the
    /// fully-qualified name consumers should pull.
    async fn publish(
        &self,
        token: &CancelToken,
        result: &BuildResult,
        reference: &str,
    ) -> Result<ImageName>;
}

/// Derives the published repository name for a reference.
#[derive(Debug, Clone, Default)]
pub struct Namer {
    preserve_import_paths: bool,
}

impl Namer {
    pub fn new() -> Self {
        Namer {
            preserve_import_paths: false,
        }
    }

    /// Keep the whole reference path in the published name instead of
    /// its last segment.
    pub fn preserve_import_paths() -> Self {
        Namer {
            preserve_import_paths: true,
        }
    }

    /// The repository-safe name for a reference.
    pub fn name(&self, reference: &str) -> String {
        let r = Reference::parse(reference);
        let raw = if self.preserve_import_paths {
            r.path().to_string()
        } else {
            r.app_filename().to_string()
        };
        raw.to_lowercase()
            .chars()
            .map(|c| match c {
                'a'..='z' | '0'..='9' | '.' | '_' | '-' | '/' => c,
                _ => '-',
            })
            .collect()
    }
}
