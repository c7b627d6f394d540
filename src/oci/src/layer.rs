//! Image layers.
//!
//! A layer is an opaque compressed tar blob identified by the digest of
//! its compressed bytes, the diff-id of its uncompressed bytes, a size,
//! and a media type. Regular layers carry their bytes; lazy layers carry
//! a cached descriptor plus a thunk that can reproduce the tar bytes on
//! demand.

use std::io::{Read, Write};
use std::sync::Arc;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use kolite_core::error::{KoError, Result};
use oci_spec::image::{Descriptor, DescriptorBuilder, Digest, MediaType};
use sha2::{Digest as _, Sha256};

use crate::media;

/// Hex-encoded SHA256 of the given bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// `sha256:`-prefixed digest of the given bytes.
pub fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", sha256_hex(data))
}

fn gzip(data: &[u8], level: Compression) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), level);
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// Thunk producing the uncompressed tar bytes of a lazy layer.
pub type TarThunk = Arc<dyn Fn() -> Result<Vec<u8>> + Send + Sync>;

#[derive(Clone)]
enum LayerSource {
    /// Both byte forms held in memory; the compressed form was produced
    /// once at construction and reused for every read.
    Tar {
        uncompressed: Arc<Vec<u8>>,
        compressed: Arc<Vec<u8>>,
    },
    /// Only the compressed bytes (layers fetched from a registry).
    Compressed { compressed: Arc<Vec<u8>> },
    /// Identifiers from a cached descriptor; bytes recomputed on demand.
    /// Callers must not depend on the thunk being invoked.
    Lazy { tar: TarThunk },
}

/// An image layer.
#[derive(Clone)]
pub struct Layer {
    digest: String,
    diff_id: String,
    size: u64,
    media_type: MediaType,
    source: LayerSource,
}

impl Layer {
    /// Build a gzip layer from uncompressed tar bytes. The compressed
    /// form is produced here (the descriptor needs its digest) and kept.
    pub fn from_tar(tar_bytes: Vec<u8>) -> Result<Self> {
        let diff_id = sha256_digest(&tar_bytes);
        let compressed = gzip(&tar_bytes, Compression::default())?;
        let digest = sha256_digest(&compressed);
        let size = compressed.len() as u64;
        Ok(Layer {
            digest,
            diff_id,
            size,
            media_type: MediaType::ImageLayerGzip,
            source: LayerSource::Tar {
                uncompressed: Arc::new(tar_bytes),
                compressed: Arc::new(compressed),
            },
        })
    }

    /// Wrap layer bytes as fetched from a registry. Gzip media types are
    /// decompressed once to recover the diff-id; for anything else the
    /// stored bytes are the uncompressed form and share one digest.
    pub fn from_compressed(bytes: Vec<u8>, media_type: MediaType) -> Result<Self> {
        if !media::is_gzip_layer(&media_type) {
            let digest = sha256_digest(&bytes);
            let size = bytes.len() as u64;
            return Ok(Layer {
                diff_id: digest.clone(),
                digest,
                size,
                media_type,
                source: LayerSource::Compressed {
                    compressed: Arc::new(bytes),
                },
            });
        }

        let diff_id = sha256_digest(&gunzip(&bytes)?);
        let digest = sha256_digest(&bytes);
        let size = bytes.len() as u64;
        Ok(Layer {
            digest,
            diff_id,
            size,
            media_type,
            source: LayerSource::Compressed {
                compressed: Arc::new(bytes),
            },
        })
    }

    /// A lazy layer built from cached metadata. All identifiers come from
    /// the cache; the thunk reproduces the tar bytes only if something
    /// actually reads them.
    pub fn lazy(digest: String, diff_id: String, size: u64, media_type: MediaType, tar: TarThunk) -> Self {
        Layer {
            digest,
            diff_id,
            size,
            media_type,
            source: LayerSource::Lazy { tar },
        }
    }

    /// Digest of the compressed bytes.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Digest of the uncompressed bytes.
    pub fn diff_id(&self) -> &str {
        &self.diff_id
    }

    /// Size of the compressed bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn media_type(&self) -> &MediaType {
        &self.media_type
    }

    pub fn is_lazy(&self) -> bool {
        matches!(self.source, LayerSource::Lazy { .. })
    }

    /// The compressed bytes. Lazy layers compress their tar bytes at the
    /// same level real layers use, so the result matches the cached
    /// descriptor's digest.
    pub fn compressed(&self) -> Result<Arc<Vec<u8>>> {
        match &self.source {
            LayerSource::Tar { compressed, .. } => Ok(compressed.clone()),
            LayerSource::Compressed { compressed } => Ok(compressed.clone()),
            LayerSource::Lazy { tar } => Ok(Arc::new(gzip(&tar()?, Compression::default())?)),
        }
    }

    /// The uncompressed tar bytes.
    pub fn uncompressed(&self) -> Result<Arc<Vec<u8>>> {
        match &self.source {
            LayerSource::Tar { uncompressed, .. } => Ok(uncompressed.clone()),
            LayerSource::Compressed { compressed } => {
                if media::is_gzip_layer(&self.media_type) {
                    Ok(Arc::new(gunzip(compressed)?))
                } else {
                    Ok(compressed.clone())
                }
            }
            LayerSource::Lazy { tar } => Ok(Arc::new(tar()?)),
        }
    }

    /// The OCI descriptor for this layer.
    pub fn descriptor(&self) -> Result<Descriptor> {
        let digest: Digest = self
            .digest
            .parse()
            .map_err(|e| KoError::Image(format!("invalid layer digest {:?}: {}", self.digest, e)))?;
        DescriptorBuilder::default()
            .media_type(self.media_type.clone())
            .digest(digest)
            .size(self.size)
            .build()
            .map_err(|e| KoError::Image(format!("layer descriptor: {}", e)))
    }
}

impl std::fmt::Debug for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Layer")
            .field("digest", &self.digest)
            .field("diff_id", &self.diff_id)
            .field("size", &self.size)
            .field("lazy", &self.is_lazy())
            .finish()
    }
}
