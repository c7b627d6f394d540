//! In-memory OCI images.
//!
//! An image is an ordered list of layers plus a config document. Images
//! are immutable values: mutation-shaped operations (appending layers,
//! replacing the config, stamping a creation time) return a new image.

use kolite_core::error::{KoError, Result};
use kolite_core::platform::Platform;
use oci_spec::image::{
    ConfigBuilder, DescriptorBuilder, Digest, ImageConfiguration, ImageConfigurationBuilder,
    ImageManifest, ImageManifestBuilder, MediaType, RootFsBuilder,
};
use serde::{Deserialize, Serialize};

use crate::layer::{sha256_digest, Layer};

/// A history record attached alongside an appended layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// A layer plus its history record, ready to append to an image.
#[derive(Clone)]
pub struct Addendum {
    pub layer: Layer,
    pub history: HistoryEntry,
}

/// An in-memory image: config plus ordered layers.
#[derive(Clone)]
pub struct Image {
    config: ImageConfiguration,
    layers: Vec<Layer>,
    media_type: MediaType,
}

/// Apply a JSON-level edit to a config document and re-parse it.
///
/// Config mutations go through the serialized form so that optional
/// fields can be added or removed uniformly.
pub fn edit_config(
    config: &ImageConfiguration,
    f: impl FnOnce(&mut serde_json::Value),
) -> Result<ImageConfiguration> {
    let mut value = serde_json::to_value(config)?;
    f(&mut value);
    serde_json::from_value(value)
        .map_err(|e| KoError::Image(format!("edited config no longer parses: {}", e)))
}

impl Image {
    pub fn new(config: ImageConfiguration, layers: Vec<Layer>, media_type: MediaType) -> Self {
        Image {
            config,
            layers,
            media_type,
        }
    }

    /// An empty image for the given platform, the starting point for
    /// synthesized bases.
    pub fn scratch(platform: &Platform) -> Result<Self> {
        let rootfs = RootFsBuilder::default()
            .typ("layers")
            .diff_ids(Vec::<String>::new())
            .build()
            .map_err(|e| KoError::Image(format!("rootfs: {}", e)))?;
        let config = ImageConfigurationBuilder::default()
            .architecture(platform.architecture.as_str())
            .os(platform.os.as_str())
            .rootfs(rootfs)
            .config(
                ConfigBuilder::default()
                    .build()
                    .map_err(|e| KoError::Image(format!("config: {}", e)))?,
            )
            .build()
            .map_err(|e| KoError::Image(format!("image configuration: {}", e)))?;

        let config = match &platform.variant {
            Some(variant) => edit_config(&config, |v| {
                v["variant"] = serde_json::json!(variant);
            })?,
            None => config,
        };

        Ok(Image::new(config, Vec::new(), MediaType::ImageManifest))
    }

    pub fn config(&self) -> &ImageConfiguration {
        &self.config
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn media_type(&self) -> &MediaType {
        &self.media_type
    }

    /// The platform recorded in the image config.
    pub fn platform(&self) -> Result<Platform> {
        let value = serde_json::to_value(&self.config)?;
        let field = |key: &str| {
            value
                .get(key)
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
        };
        Ok(Platform {
            os: field("os").unwrap_or_default(),
            architecture: field("architecture").unwrap_or_default(),
            variant: field("variant"),
            os_version: field("os.version"),
        })
    }

    /// Append layers, extending the config's diff-ids and history.
    pub fn append(&self, addenda: Vec<Addendum>) -> Result<Image> {
        let config = edit_config(&self.config, |v| {
            let diff_ids = v["rootfs"]["diff_ids"]
                .as_array()
                .cloned()
                .unwrap_or_default();
            let mut diff_ids = diff_ids;
            let history = v.get("history").and_then(|h| h.as_array()).cloned();
            let mut history = history.unwrap_or_default();
            for addendum in &addenda {
                diff_ids.push(serde_json::json!(addendum.layer.diff_id()));
                history.push(serde_json::to_value(&addendum.history).unwrap_or_default());
            }
            v["rootfs"]["diff_ids"] = serde_json::Value::Array(diff_ids);
            v["history"] = serde_json::Value::Array(history);
        })?;

        let mut layers = self.layers.clone();
        layers.extend(addenda.into_iter().map(|a| a.layer));

        Ok(Image {
            config,
            layers,
            media_type: self.media_type.clone(),
        })
    }

    /// The same image with a replacement config document. The config's
    /// diff-ids must still describe this image's layers.
    pub fn with_config(&self, config: ImageConfiguration) -> Result<Image> {
        let value = serde_json::to_value(&config)?;
        let diff_ids = value["rootfs"]["diff_ids"]
            .as_array()
            .map(|a| a.len())
            .unwrap_or(0);
        if diff_ids != self.layers.len() {
            return Err(KoError::Image(format!(
                "config lists {} diff-ids for {} layers",
                diff_ids,
                self.layers.len()
            )));
        }
        Ok(Image {
            config,
            layers: self.layers.clone(),
            media_type: self.media_type.clone(),
        })
    }

    /// Stamp the config's creation time (RFC 3339).
    pub fn created_at(&self, created: &str) -> Result<Image> {
        let config = edit_config(&self.config, |v| {
            v["created"] = serde_json::json!(created);
        })?;
        Ok(Image {
            config,
            layers: self.layers.clone(),
            media_type: self.media_type.clone(),
        })
    }

    /// Serialized config document.
    pub fn config_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.config)?)
    }

    /// The image manifest describing config and layers.
    pub fn manifest(&self) -> Result<ImageManifest> {
        let config_bytes = self.config_bytes()?;
        let config_digest: Digest = sha256_digest(&config_bytes)
            .parse()
            .map_err(|e| KoError::Image(format!("config digest: {}", e)))?;
        let config_descriptor = DescriptorBuilder::default()
            .media_type(MediaType::ImageConfig)
            .digest(config_digest)
            .size(config_bytes.len() as u64)
            .build()
            .map_err(|e| KoError::Image(format!("config descriptor: {}", e)))?;

        let mut layer_descriptors = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            layer_descriptors.push(layer.descriptor()?);
        }

        ImageManifestBuilder::default()
            .schema_version(2u32)
            .media_type(self.media_type.clone())
            .config(config_descriptor)
            .layers(layer_descriptors)
            .build()
            .map_err(|e| KoError::Image(format!("manifest: {}", e)))
    }

    pub fn manifest_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.manifest()?)?)
    }

    /// Digest of the serialized manifest.
    pub fn digest(&self) -> Result<String> {
        Ok(sha256_digest(&self.manifest_bytes()?))
    }

    /// Size of the serialized manifest.
    pub fn manifest_size(&self) -> Result<u64> {
        Ok(self.manifest_bytes()?.len() as u64)
    }
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("layers", &self.layers.len())
            .field("media_type", &self.media_type.to_string())
            .finish()
    }
}
