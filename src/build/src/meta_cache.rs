//! Layer-metadata cache.
//!
//! Two JSON files live beside each artifact: `buildid-to-diffid` and
//! `diffid-to-descriptor`. Together they let a rebuild whose build id is
//! unchanged skip re-tarring the binary: the cached descriptor and
//! diff-id reconstruct the layer lazily. Files are read once per process
//! into an in-memory mirror. Lookup misses surface as `CacheMiss` and
//! callers fall through to a real build; writes are best-effort.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use kolite_core::error::{KoError, Result};
use kolite_oci::Layer;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

const BUILD_TO_DIFF_FILE: &str = "buildid-to-diffid";
const DIFF_TO_DESC_FILE: &str = "diffid-to-descriptor";

/// The descriptor fields cached for a binary layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedDescriptor {
    pub digest: String,
    pub size: u64,
    #[serde(rename = "mediaType")]
    pub media_type: String,
}

type BuildToDiff = HashMap<String, String>;
type DiffToDesc = HashMap<String, CachedDescriptor>;

/// On-disk layer metadata with an in-memory mirror, keyed by artifact
/// file path.
#[derive(Default)]
pub struct MetaCache {
    build_to_diff: Mutex<HashMap<PathBuf, BuildToDiff>>,
    diff_to_desc: Mutex<HashMap<PathBuf, DiffToDesc>>,
}

fn sidecar(artifact: &Path, name: &str) -> Result<PathBuf> {
    let dir = artifact
        .parent()
        .ok_or_else(|| KoError::CacheMiss(format!("{} has no parent", artifact.display())))?;
    Ok(dir.join(name))
}

fn read_map<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read(path)
        .map_err(|e| KoError::CacheMiss(format!("{}: {}", path.display(), e)))?;
    serde_json::from_slice(&content)
        .map_err(|e| KoError::CacheMiss(format!("{}: {}", path.display(), e)))
}

fn write_map<T: Serialize>(path: &Path, map: &T) -> Result<()> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o755);
    }
    let file = options.open(path)?;
    serde_json::to_writer_pretty(file, map)?;
    Ok(())
}

impl MetaCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached diff-id for an artifact's build id.
    pub async fn diff_id_for(&self, artifact: &Path, build_id: &str) -> Result<String> {
        let mut mirror = self.build_to_diff.lock().await;
        if !mirror.contains_key(artifact) {
            let map: BuildToDiff = read_map(&sidecar(artifact, BUILD_TO_DIFF_FILE)?)?;
            mirror.insert(artifact.to_path_buf(), map);
        }
        mirror
            .get(artifact)
            .and_then(|map| map.get(build_id).cloned())
            .ok_or_else(|| KoError::CacheMiss(format!("no diff-id for build id {:?}", build_id)))
    }

    /// The cached descriptor for a diff-id.
    pub async fn descriptor_for(&self, artifact: &Path, diff_id: &str) -> Result<CachedDescriptor> {
        let mut mirror = self.diff_to_desc.lock().await;
        if !mirror.contains_key(artifact) {
            let map: DiffToDesc = read_map(&sidecar(artifact, DIFF_TO_DESC_FILE)?)?;
            mirror.insert(artifact.to_path_buf(), map);
        }
        mirror
            .get(artifact)
            .and_then(|map| map.get(diff_id).cloned())
            .ok_or_else(|| KoError::CacheMiss(format!("no descriptor for diff-id {:?}", diff_id)))
    }

    /// Record a freshly built layer's metadata in memory and on disk.
    /// The on-disk files are only written while at most one builder is
    /// active for the artifact's reference.
    pub async fn record(&self, artifact: &Path, build_id: &str, layer: &Layer) -> Result<()> {
        let descriptor = CachedDescriptor {
            digest: layer.digest().to_string(),
            size: layer.size(),
            media_type: layer.media_type().to_string(),
        };

        let btod = {
            let mut mirror = self.build_to_diff.lock().await;
            let map = mirror.entry(artifact.to_path_buf()).or_default();
            map.insert(build_id.to_string(), layer.diff_id().to_string());
            map.clone()
        };
        let dtod = {
            let mut mirror = self.diff_to_desc.lock().await;
            let map = mirror.entry(artifact.to_path_buf()).or_default();
            map.insert(layer.diff_id().to_string(), descriptor);
            map.clone()
        };

        write_map(&sidecar(artifact, BUILD_TO_DIFF_FILE)?, &btod)?;
        write_map(&sidecar(artifact, DIFF_TO_DESC_FILE)?, &dtod)?;
        Ok(())
    }
}
