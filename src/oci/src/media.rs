//! Media type helpers covering both OCI and Docker manifests.

use oci_spec::image::MediaType;

pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
pub const DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
pub const DOCKER_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// Parse a media type string, mapping Docker types onto `Other`.
pub fn from_str(s: &str) -> MediaType {
    match s {
        "application/vnd.oci.image.manifest.v1+json" => MediaType::ImageManifest,
        "application/vnd.oci.image.index.v1+json" => MediaType::ImageIndex,
        "application/vnd.oci.image.config.v1+json" => MediaType::ImageConfig,
        "application/vnd.oci.image.layer.v1.tar" => MediaType::ImageLayer,
        "application/vnd.oci.image.layer.v1.tar+gzip" => MediaType::ImageLayerGzip,
        other => MediaType::Other(other.to_string()),
    }
}

pub fn to_string(media_type: &MediaType) -> String {
    media_type.to_string()
}

/// Multi-platform index media types (OCI index or Docker manifest list).
pub fn is_index(media_type: &MediaType) -> bool {
    match media_type {
        MediaType::ImageIndex => true,
        MediaType::Other(s) => s == DOCKER_MANIFEST_LIST,
        _ => false,
    }
}

/// Single-image manifest media types (OCI manifest or Docker manifest).
pub fn is_image(media_type: &MediaType) -> bool {
    match media_type {
        MediaType::ImageManifest => true,
        MediaType::Other(s) => s == DOCKER_MANIFEST,
        _ => false,
    }
}

/// Gzip-compressed layer media types.
pub fn is_gzip_layer(media_type: &MediaType) -> bool {
    match media_type {
        MediaType::ImageLayerGzip | MediaType::ImageLayerNonDistributableGzip => true,
        MediaType::Other(s) => s == DOCKER_LAYER_GZIP,
        _ => false,
    }
}
