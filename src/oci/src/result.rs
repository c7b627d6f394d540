//! Build results.

use kolite_core::error::Result;
use oci_spec::image::MediaType;

use crate::image::Image;
use crate::index::Index;

/// What a build produces: a single image or a multi-platform index.
/// Downstream consumers branch on the media type.
#[derive(Clone, Debug)]
pub enum BuildResult {
    Image(Image),
    Index(Index),
}

impl BuildResult {
    pub fn media_type(&self) -> MediaType {
        match self {
            BuildResult::Image(image) => image.media_type().clone(),
            BuildResult::Index(index) => index.media_type().clone(),
        }
    }

    /// Content digest of the result's manifest.
    pub fn digest(&self) -> Result<String> {
        match self {
            BuildResult::Image(image) => image.digest(),
            BuildResult::Index(index) => index.digest(),
        }
    }

    pub fn as_image(&self) -> Option<&Image> {
        match self {
            BuildResult::Image(image) => Some(image),
            BuildResult::Index(_) => None,
        }
    }

    pub fn as_index(&self) -> Option<&Index> {
        match self {
            BuildResult::Image(_) => None,
            BuildResult::Index(index) => Some(index),
        }
    }
}
