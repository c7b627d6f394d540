//! Registry client adapter.
//!
//! Wraps the `oci-distribution` client behind the handful of operations
//! kolite needs: pulling a base image (or index) into the in-memory
//! model, and pushing a built result. No registry wire protocol lives
//! here.

use kolite_core::error::{KoError, Result};
use kolite_core::name::ImageName;
use kolite_core::platform::Platform;
use oci_distribution::client::{ClientConfig, ClientProtocol, Config, ImageLayer};
use oci_distribution::manifest::{OciImageManifest, OciManifest};
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::{Client, Reference, RegistryOperation};

use crate::image::Image;
use crate::index::{Index, IndexEntry};
use crate::layer::Layer;
use crate::media;
use crate::result::BuildResult;

/// Authentication credentials for a container registry.
#[derive(Debug, Clone)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    /// Anonymous authentication (no credentials).
    pub fn anonymous() -> Self {
        Self {
            username: None,
            password: None,
        }
    }

    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// Read `REGISTRY_USERNAME` / `REGISTRY_PASSWORD`, falling back to
    /// anonymous.
    pub fn from_env() -> Self {
        let username = std::env::var("REGISTRY_USERNAME").ok();
        let password = std::env::var("REGISTRY_PASSWORD").ok();
        if username.is_some() && password.is_some() {
            Self { username, password }
        } else {
            Self::anonymous()
        }
    }

    fn to_oci_auth(&self) -> OciRegistryAuth {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => OciRegistryAuth::Basic(u.clone(), p.clone()),
            _ => OciRegistryAuth::Anonymous,
        }
    }
}

/// Pulls and pushes in-memory images against registries.
pub struct RegistryClient {
    client: Client,
    auth: RegistryAuth,
}

impl RegistryClient {
    pub fn new(auth: RegistryAuth, insecure: bool) -> Self {
        let protocol = if insecure {
            ClientProtocol::Http
        } else {
            ClientProtocol::Https
        };
        let client = Client::new(ClientConfig {
            protocol,
            ..Default::default()
        });
        Self { client, auth }
    }

    fn registry_error(&self, reference: &Reference, message: String) -> KoError {
        KoError::Registry {
            registry: reference.registry().to_string(),
            message,
        }
    }

    fn parse_reference(&self, name: &str) -> Result<Reference> {
        name.parse::<Reference>()
            .map_err(|e| KoError::Reference(format!("invalid registry reference {:?}: {}", name, e)))
    }

    /// Pull a reference into the in-memory model, resolving either shape.
    pub async fn fetch(&self, name: &str) -> Result<BuildResult> {
        let reference = self.parse_reference(name)?;
        let auth = self.auth.to_oci_auth();

        let (manifest, digest) = self
            .client
            .pull_manifest(&reference, &auth)
            .await
            .map_err(|e| self.registry_error(&reference, format!("failed to pull manifest: {}", e)))?;

        tracing::debug!(reference = %reference, digest = %digest, "Pulled manifest");

        match manifest {
            OciManifest::Image(manifest) => Ok(BuildResult::Image(
                self.fetch_image_content(&reference, manifest).await?,
            )),
            OciManifest::ImageIndex(index) => {
                let media_type = index
                    .media_type
                    .as_deref()
                    .map(media::from_str)
                    .unwrap_or(oci_spec::image::MediaType::ImageIndex);

                let mut entries = Vec::with_capacity(index.manifests.len());
                for descriptor in &index.manifests {
                    let child_media = media::from_str(&descriptor.media_type);
                    if !media::is_image(&child_media) {
                        return Err(KoError::UnsupportedBase(format!(
                            "{:?} has unexpected media type {:?} in base {}",
                            descriptor.digest, descriptor.media_type, name
                        )));
                    }

                    let child_ref = Reference::with_digest(
                        reference.registry().to_string(),
                        reference.repository().to_string(),
                        descriptor.digest.clone(),
                    );
                    let (child_manifest, _) = self
                        .client
                        .pull_manifest(&child_ref, &auth)
                        .await
                        .map_err(|e| {
                            self.registry_error(
                                &child_ref,
                                format!("failed to pull child manifest: {}", e),
                            )
                        })?;
                    let child_manifest = match child_manifest {
                        OciManifest::Image(m) => m,
                        OciManifest::ImageIndex(_) => {
                            return Err(KoError::UnsupportedBase(format!(
                                "nested index under {}",
                                name
                            )))
                        }
                    };
                    let image = self.fetch_image_content(&child_ref, child_manifest).await?;

                    entries.push(IndexEntry {
                        image,
                        platform: descriptor.platform.as_ref().map(|p| Platform {
                            os: p.os.clone(),
                            architecture: p.architecture.clone(),
                            variant: p.variant.clone(),
                            os_version: p.os_version.clone(),
                        }),
                        media_type: child_media,
                        urls: None,
                        annotations: descriptor
                            .annotations
                            .as_ref()
                            .map(|a| a.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
                    });
                }

                Ok(BuildResult::Index(Index::new(media_type, entries)))
            }
        }
    }

    /// Pull a reference that must resolve to a single image.
    pub async fn fetch_image(&self, name: &str) -> Result<Image> {
        match self.fetch(name).await? {
            BuildResult::Image(image) => Ok(image),
            BuildResult::Index(_) => Err(KoError::UnsupportedBase(format!(
                "{} is an index, expected an image",
                name
            ))),
        }
    }

    async fn fetch_image_content(
        &self,
        reference: &Reference,
        manifest: OciImageManifest,
    ) -> Result<Image> {
        let mut config_data = Vec::new();
        self.client
            .pull_blob(reference, &manifest.config, &mut config_data)
            .await
            .map_err(|e| {
                self.registry_error(reference, format!("failed to pull config blob: {}", e))
            })?;
        let config = serde_json::from_slice(&config_data)
            .map_err(|e| KoError::Image(format!("base config: {}", e)))?;

        let mut layers = Vec::with_capacity(manifest.layers.len());
        for descriptor in &manifest.layers {
            tracing::debug!(digest = %descriptor.digest, size = descriptor.size, "Pulling layer");
            let mut data = Vec::new();
            self.client
                .pull_blob(reference, descriptor, &mut data)
                .await
                .map_err(|e| {
                    self.registry_error(
                        reference,
                        format!("failed to pull layer {}: {}", descriptor.digest, e),
                    )
                })?;
            layers.push(Layer::from_compressed(
                data,
                media::from_str(&descriptor.media_type),
            )?);
        }

        let media_type = manifest
            .media_type
            .as_deref()
            .map(media::from_str)
            .unwrap_or(oci_spec::image::MediaType::ImageManifest);

        Ok(Image::new(config, layers, media_type))
    }

    /// Push a built result under the given name.
    pub async fn push(&self, name: &ImageName, result: &BuildResult) -> Result<()> {
        match result {
            BuildResult::Image(image) => {
                let reference = self.parse_reference(&name.qualified())?;
                self.push_image(&reference, image).await
            }
            BuildResult::Index(index) => self.push_index(name, index).await,
        }
    }

    async fn push_image(&self, reference: &Reference, image: &Image) -> Result<()> {
        let mut layers = Vec::with_capacity(image.layers().len());
        for layer in image.layers() {
            layers.push(ImageLayer::new(
                layer.compressed()?.to_vec(),
                media::to_string(layer.media_type()),
                None,
            ));
        }

        let config = Config::new(
            image.config_bytes()?,
            media::to_string(&oci_spec::image::MediaType::ImageConfig),
            None,
        );
        let manifest: OciImageManifest = serde_json::from_slice(&image.manifest_bytes()?)?;

        self.client
            .push(
                reference,
                &layers,
                config,
                &self.auth.to_oci_auth(),
                Some(manifest),
            )
            .await
            .map_err(|e| self.registry_error(reference, format!("failed to push image: {}", e)))?;
        Ok(())
    }

    async fn push_index(&self, name: &ImageName, index: &Index) -> Result<()> {
        // Children first, addressed by digest, then the index manifest.
        for entry in index.entries() {
            let child_ref = Reference::with_digest(
                name.registry.clone(),
                name.repository.clone(),
                entry.image.digest()?,
            );
            self.push_image(&child_ref, &entry.image).await?;
        }

        let reference = self.parse_reference(&name.qualified())?;
        self.client
            .auth(
                &reference,
                &self.auth.to_oci_auth(),
                RegistryOperation::Push,
            )
            .await
            .map_err(|e| self.registry_error(&reference, format!("failed to authenticate: {}", e)))?;

        let manifest: OciManifest = OciManifest::ImageIndex(
            serde_json::from_slice(&index.manifest_bytes()?)?,
        );
        self.client
            .push_manifest(&reference, &manifest)
            .await
            .map_err(|e| self.registry_error(&reference, format!("failed to push index: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_auth_from_parts() {
        let auth = RegistryAuth::basic("user", "pass");
        assert!(matches!(auth.to_oci_auth(), OciRegistryAuth::Basic(_, _)));
        assert!(matches!(
            RegistryAuth::anonymous().to_oci_auth(),
            OciRegistryAuth::Anonymous
        ));
    }

    #[test]
    fn test_parse_reference_rejects_garbage() {
        let client = RegistryClient::new(RegistryAuth::anonymous(), false);
        assert!(client.parse_reference("").is_err());
    }

    #[test]
    fn test_parse_reference_accepts_digest_refs() {
        let client = RegistryClient::new(RegistryAuth::anonymous(), false);
        let r = client
            .parse_reference("gcr.io/distroless/static@sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa")
            .unwrap();
        assert_eq!(r.registry(), "gcr.io");
        assert_eq!(r.repository(), "distroless/static");
    }
}
