//! Docker archive (docker save/load format) support.
//!
//! The daemon publisher streams this format into `docker load`; the
//! dockerfile builder reads it back out of `docker save`.

use std::collections::HashMap;
use std::io::{Read, Write};

use kolite_core::error::{KoError, Result};
use oci_spec::image::MediaType;
use serde::{Deserialize, Serialize};

use crate::image::Image;
use crate::layer::{sha256_hex, Layer};

#[derive(Debug, Serialize, Deserialize)]
struct ManifestEntry {
    #[serde(rename = "Config")]
    config: String,
    #[serde(rename = "RepoTags")]
    repo_tags: Vec<String>,
    #[serde(rename = "Layers")]
    layers: Vec<String>,
}

fn append_file<W: Write>(builder: &mut tar::Builder<W>, path: &str, data: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, path, data)
        .map_err(|e| KoError::Tar(format!("failed to add {} to archive: {}", path, e)))
}

/// Write an image as a docker archive, tagged with `repo_tags`.
pub fn write_docker_archive<W: Write>(image: &Image, repo_tags: &[String], w: W) -> Result<()> {
    let mut builder = tar::Builder::new(w);

    let config_bytes = image.config_bytes()?;
    let config_name = format!("{}.json", sha256_hex(&config_bytes));
    append_file(&mut builder, &config_name, &config_bytes)?;

    let mut layer_paths = Vec::with_capacity(image.layers().len());
    for (i, layer) in image.layers().iter().enumerate() {
        let path = format!("{}/layer.tar", i);
        let bytes = layer.uncompressed()?;
        append_file(&mut builder, &path, &bytes)?;
        layer_paths.push(path);
    }

    let manifest = vec![ManifestEntry {
        config: config_name,
        repo_tags: repo_tags.to_vec(),
        layers: layer_paths,
    }];
    append_file(&mut builder, "manifest.json", &serde_json::to_vec(&manifest)?)?;

    builder
        .finish()
        .map_err(|e| KoError::Tar(format!("failed to finalize archive: {}", e)))
}

/// Read the first image out of a docker archive.
pub fn read_docker_archive<R: Read>(r: R) -> Result<Image> {
    let mut archive = tar::Archive::new(r);
    let mut files: HashMap<String, Vec<u8>> = HashMap::new();

    for entry in archive
        .entries()
        .map_err(|e| KoError::Tar(format!("failed to read archive: {}", e)))?
    {
        let mut entry = entry.map_err(|e| KoError::Tar(format!("failed to read entry: {}", e)))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry
            .path()
            .map_err(|e| KoError::Tar(format!("bad entry path: {}", e)))?
            .to_string_lossy()
            .trim_start_matches("./")
            .to_string();
        let mut data = Vec::new();
        entry
            .read_to_end(&mut data)
            .map_err(|e| KoError::Tar(format!("failed to read {}: {}", path, e)))?;
        files.insert(path, data);
    }

    let manifest_bytes = files
        .get("manifest.json")
        .ok_or_else(|| KoError::Image("archive has no manifest.json".to_string()))?;
    let manifest: Vec<ManifestEntry> = serde_json::from_slice(manifest_bytes)?;
    let entry = manifest
        .first()
        .ok_or_else(|| KoError::Image("archive manifest is empty".to_string()))?;

    let config_bytes = files.get(&entry.config).ok_or_else(|| {
        KoError::Image(format!("archive missing config {}", entry.config))
    })?;
    let config = serde_json::from_slice(config_bytes)
        .map_err(|e| KoError::Image(format!("archive config: {}", e)))?;

    let mut layers = Vec::with_capacity(entry.layers.len());
    for path in &entry.layers {
        let bytes = files
            .get(path)
            .ok_or_else(|| KoError::Image(format!("archive missing layer {}", path)))?;
        layers.push(Layer::from_tar(bytes.clone())?);
    }

    Ok(Image::new(config, layers, MediaType::ImageManifest))
}
