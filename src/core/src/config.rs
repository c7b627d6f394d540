//! Build configuration: the `.ko.yaml` file and the `KO_*` environment.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{KoError, Result};

/// Required for registry publishing; the literal `ko.local` selects
/// daemon side-load instead.
pub const ENV_DOCKER_REPO: &str = "KO_DOCKER_REPO";
/// Seconds since epoch; when set, stamps the image creation time.
pub const ENV_SOURCE_DATE_EPOCH: &str = "SOURCE_DATE_EPOCH";
/// When set, artifact output directories are kept and keyed by input hash.
pub const ENV_STABLE_OUTPUT: &str = "KO_STABLE_OUTPUT";
/// When set, enables the on-disk layer-metadata cache.
pub const ENV_CACHE_META: &str = "KO_CACHE_META";
/// Directory holding the `.ko.yaml` config file.
pub const ENV_CONFIG_PATH: &str = "KO_CONFIG_PATH";

const CONFIG_FILE: &str = ".ko.yaml";

fn default_base_image() -> String {
    "gcr.io/distroless/static:latest".to_string()
}

/// Contents of `.ko.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KoConfig {
    /// Base image used when no override matches the reference path.
    #[serde(default = "default_base_image")]
    pub default_base_image: String,

    /// Per-reference-path base image overrides.
    #[serde(default)]
    pub base_image_overrides: HashMap<String, String>,
}

impl Default for KoConfig {
    fn default() -> Self {
        Self {
            default_base_image: default_base_image(),
            base_image_overrides: HashMap::new(),
        }
    }
}

impl KoConfig {
    /// Load `.ko.yaml` from `KO_CONFIG_PATH` if set, else the working
    /// directory. A missing file yields the defaults.
    pub fn load() -> Result<Self> {
        let dir = match std::env::var(ENV_CONFIG_PATH) {
            Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => PathBuf::from("."),
        };
        Self::load_from(&dir)
    }

    /// Load `.ko.yaml` from a specific directory.
    pub fn load_from(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        if !path.is_file() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path).map_err(|e| {
            KoError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        serde_yaml::from_str(&content).map_err(|e| {
            KoError::Config(format!("failed to parse {}: {}", path.display(), e))
        })
    }

    /// Base image reference for the given reference path.
    pub fn base_image_for(&self, path: &str) -> &str {
        self.base_image_overrides
            .get(path)
            .map(|s| s.as_str())
            .unwrap_or(&self.default_base_image)
    }
}

/// `KO_DOCKER_REPO`, if set and non-empty.
pub fn docker_repo() -> Option<String> {
    std::env::var(ENV_DOCKER_REPO).ok().filter(|s| !s.is_empty())
}

pub fn stable_output() -> bool {
    std::env::var(ENV_STABLE_OUTPUT).map(|v| !v.is_empty()).unwrap_or(false)
}

pub fn cache_meta() -> bool {
    std::env::var(ENV_CACHE_META).map(|v| !v.is_empty()).unwrap_or(false)
}

/// Parse `SOURCE_DATE_EPOCH` into a creation timestamp.
pub fn creation_time() -> Result<Option<DateTime<Utc>>> {
    let epoch = match std::env::var(ENV_SOURCE_DATE_EPOCH) {
        Ok(v) if !v.is_empty() => v,
        _ => return Ok(None),
    };

    let seconds: i64 = epoch.parse().map_err(|e| {
        KoError::Config(format!(
            "{} should be the number of seconds since January 1st 1970, 00:00 UTC, got {:?}: {}",
            ENV_SOURCE_DATE_EPOCH, epoch, e
        ))
    })?;

    DateTime::<Utc>::from_timestamp(seconds, 0)
        .map(Some)
        .ok_or_else(|| {
            KoError::Config(format!("{} out of range: {}", ENV_SOURCE_DATE_EPOCH, seconds))
        })
}
