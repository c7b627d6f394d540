//! Multi-platform image indexes.

use std::collections::BTreeMap;

use kolite_core::error::{KoError, Result};
use kolite_core::platform::Platform;
use oci_spec::image::{ImageIndex, MediaType};

use crate::image::Image;
use crate::layer::sha256_digest;

/// One image inside an index, together with the descriptor fields carried
/// through unchanged from the base index entry that produced it.
#[derive(Clone)]
pub struct IndexEntry {
    pub image: Image,
    pub platform: Option<Platform>,
    /// Media type of the child manifest descriptor.
    pub media_type: MediaType,
    pub urls: Option<Vec<String>>,
    pub annotations: Option<BTreeMap<String, String>>,
}

/// A platform → image mapping with a preserved index media type.
#[derive(Clone)]
pub struct Index {
    media_type: MediaType,
    entries: Vec<IndexEntry>,
}

impl Index {
    pub fn new(media_type: MediaType, entries: Vec<IndexEntry>) -> Self {
        Index {
            media_type,
            entries,
        }
    }

    pub fn media_type(&self) -> &MediaType {
        &self.media_type
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// The first image in the index, if any.
    pub fn first_image(&self) -> Option<&Image> {
        self.entries.first().map(|e| &e.image)
    }

    /// The serialized index manifest. Entry descriptors are assembled at
    /// the JSON level so optional fields are omitted rather than null.
    pub fn manifest_bytes(&self) -> Result<Vec<u8>> {
        let mut manifests = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            let mut descriptor = serde_json::json!({
                "mediaType": entry.media_type.to_string(),
                "digest": entry.image.digest()?,
                "size": entry.image.manifest_size()?,
            });
            if let Some(urls) = &entry.urls {
                descriptor["urls"] = serde_json::json!(urls);
            }
            if let Some(annotations) = &entry.annotations {
                descriptor["annotations"] = serde_json::json!(annotations);
            }
            if let Some(platform) = &entry.platform {
                let mut p = serde_json::json!({
                    "architecture": platform.architecture,
                    "os": platform.os,
                });
                if let Some(variant) = &platform.variant {
                    p["variant"] = serde_json::json!(variant);
                }
                if let Some(os_version) = &platform.os_version {
                    p["os.version"] = serde_json::json!(os_version);
                }
                descriptor["platform"] = p;
            }
            manifests.push(descriptor);
        }

        let index = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": self.media_type.to_string(),
            "manifests": manifests,
        });
        Ok(serde_json::to_vec(&index)?)
    }

    /// The index manifest as a typed value.
    pub fn manifest(&self) -> Result<ImageIndex> {
        serde_json::from_slice(&self.manifest_bytes()?)
            .map_err(|e| KoError::Image(format!("index manifest: {}", e)))
    }

    /// Digest of the serialized index manifest.
    pub fn digest(&self) -> Result<String> {
        Ok(sha256_digest(&self.manifest_bytes()?))
    }
}

impl std::fmt::Debug for Index {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Index")
            .field("entries", &self.entries.len())
            .field("media_type", &self.media_type.to_string())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(platform: &str) -> IndexEntry {
        let platform = Platform::parse(platform).unwrap();
        let image = Image::scratch(&platform).unwrap();
        IndexEntry {
            image,
            platform: Some(platform),
            media_type: MediaType::ImageManifest,
            urls: None,
            annotations: None,
        }
    }

    #[test]
    fn test_manifest_preserves_entry_order_and_platforms() {
        let index = Index::new(
            MediaType::ImageIndex,
            vec![entry("linux/amd64"), entry("linux/arm64"), entry("linux/arm/v7")],
        );

        let value: serde_json::Value =
            serde_json::from_slice(&index.manifest_bytes().unwrap()).unwrap();
        let manifests = value["manifests"].as_array().unwrap();
        assert_eq!(manifests.len(), 3);
        assert_eq!(manifests[0]["platform"]["architecture"], "amd64");
        assert_eq!(manifests[1]["platform"]["architecture"], "arm64");
        assert_eq!(manifests[2]["platform"]["variant"], "v7");
        assert_eq!(
            value["mediaType"],
            "application/vnd.oci.image.index.v1+json"
        );
    }

    #[test]
    fn test_manifest_carries_annotations_and_urls() {
        let mut e = entry("linux/amd64");
        e.urls = Some(vec!["https://example.com/blob".to_string()]);
        e.annotations = Some(BTreeMap::from([(
            "org.opencontainers.image.ref.name".to_string(),
            "base".to_string(),
        )]));
        let index = Index::new(MediaType::ImageIndex, vec![e]);

        let manifest = index.manifest().unwrap();
        let descriptor = &manifest.manifests()[0];
        assert!(descriptor.urls().is_some());
        assert!(descriptor.annotations().is_some());
    }

    #[test]
    fn test_digest_is_deterministic() {
        let a = Index::new(MediaType::ImageIndex, vec![entry("linux/amd64")]);
        let b = Index::new(MediaType::ImageIndex, vec![entry("linux/amd64")]);
        assert_eq!(a.digest().unwrap(), b.digest().unwrap());
    }

    #[test]
    fn test_media_type_preserved() {
        let index = Index::new(
            MediaType::Other(crate::media::DOCKER_MANIFEST_LIST.to_string()),
            vec![entry("linux/amd64")],
        );
        let value: serde_json::Value =
            serde_json::from_slice(&index.manifest_bytes().unwrap()).unwrap();
        assert_eq!(value["mediaType"], crate::media::DOCKER_MANIFEST_LIST);
    }
}
