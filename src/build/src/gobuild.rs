//! The native Go builder.
//!
//! Compiles a reference path with the external toolchain, then layers a
//! kodata data layer and the binary layer onto a platform-matched base
//! image. Multi-platform bases fan out across their manifests and
//! reassemble into an index.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use kolite_core::cancel::CancelToken;
use kolite_core::config;
use kolite_core::error::{KoError, Result};
use kolite_core::platform::Platform;
use kolite_core::reference::Reference;
use kolite_oci::image::edit_config;
use kolite_oci::{media, Addendum, BuildResult, HistoryEntry, Image, Index, IndexEntry, Layer};

use crate::meta_cache::MetaCache;
use crate::tar;
use crate::toolchain::{Compiler, GoToolchain, Modules};
use crate::{BaseProvider, Builder};

/// Scheme strict references use to select this builder.
pub const SCHEME: &str = "ko";

/// Builds Go commands into images.
pub struct GoBuilder {
    base: Arc<dyn BaseProvider>,
    compiler: Arc<dyn Compiler>,
    creation_time: Option<DateTime<Utc>>,
    disable_optimizations: bool,
    allow_unqualified: bool,
    meta_cache: Option<Arc<MetaCache>>,
    modules: Option<Modules>,
}

impl GoBuilder {
    pub fn new(base: Arc<dyn BaseProvider>) -> Self {
        GoBuilder {
            base,
            compiler: Arc::new(GoToolchain::new()),
            creation_time: None,
            disable_optimizations: false,
            allow_unqualified: false,
            meta_cache: None,
            modules: None,
        }
    }

    pub fn with_compiler(mut self, compiler: Arc<dyn Compiler>) -> Self {
        self.compiler = compiler;
        self
    }

    pub fn with_creation_time(mut self, time: DateTime<Utc>) -> Self {
        self.creation_time = Some(time);
        self
    }

    pub fn with_disabled_optimizations(mut self) -> Self {
        self.disable_optimizations = true;
        self
    }

    /// Accept scheme-less legacy references.
    pub fn with_unqualified_references(mut self) -> Self {
        self.allow_unqualified = true;
        self
    }

    pub fn with_meta_cache(mut self, cache: Arc<MetaCache>) -> Self {
        self.meta_cache = Some(cache);
        self
    }

    pub fn with_modules(mut self, modules: Option<Modules>) -> Self {
        self.modules = modules;
        self
    }

    /// Whether the path is resolvable inside the module graph.
    fn in_module_scope(&self, reference: &Reference) -> bool {
        let modules = match &self.modules {
            Some(modules) => modules,
            None => return true,
        };
        let path = reference.path();
        reference.is_strict()
            || path.starts_with(&modules.main.path)
            || path == "."
            || path.starts_with("./")
            || path.starts_with("../")
            || modules.deps.contains_key(path)
    }

    async fn binary_layer(
        &self,
        reference: &Reference,
        platform: &Platform,
        app_path: &str,
        artifact: &Path,
    ) -> Result<Layer> {
        if let Some(cache) = &self.meta_cache {
            match self.lazy_binary_layer(cache, app_path, artifact).await {
                Ok(layer) => {
                    tracing::info!("Cached: {} for {}", reference.path(), platform);
                    return Ok(layer);
                }
                Err(err) => {
                    tracing::info!(
                        "Cache miss: {} for {}: {}",
                        reference.path(),
                        platform,
                        err
                    );
                }
            }
        }

        let layer = Layer::from_tar(tar::tar_binary(app_path, artifact)?)?;

        if let Some(cache) = &self.meta_cache {
            if let Err(err) = self.record_layer_meta(cache, artifact, &layer).await {
                tracing::warn!("failed to cache metadata for {}: {}", reference, err);
            }
        }
        Ok(layer)
    }

    async fn lazy_binary_layer(
        &self,
        cache: &MetaCache,
        app_path: &str,
        artifact: &Path,
    ) -> Result<Layer> {
        let build_id = self.compiler.build_id(artifact).await?;
        if build_id.is_empty() {
            return Err(KoError::CacheMiss(format!(
                "no build id for {}",
                artifact.display()
            )));
        }

        let diff_id = cache.diff_id_for(artifact, &build_id).await?;
        let descriptor = cache.descriptor_for(artifact, &diff_id).await?;

        let app_path = app_path.to_string();
        let artifact = artifact.to_path_buf();
        Ok(Layer::lazy(
            descriptor.digest,
            diff_id,
            descriptor.size,
            media::from_str(&descriptor.media_type),
            Arc::new(move || tar::tar_binary(&app_path, &artifact)),
        ))
    }

    async fn record_layer_meta(
        &self,
        cache: &MetaCache,
        artifact: &Path,
        layer: &Layer,
    ) -> Result<()> {
        let build_id = self.compiler.build_id(artifact).await?;
        if build_id.is_empty() {
            return Err(KoError::CacheMiss(format!(
                "no build id for {}",
                artifact.display()
            )));
        }
        cache.record(artifact, &build_id, layer).await
    }

    async fn build_one(
        &self,
        token: &CancelToken,
        reference: &Reference,
        base: &Image,
        platform: Option<Platform>,
    ) -> Result<Image> {
        let platform = match platform {
            Some(platform) => platform,
            None => base.platform()?,
        };

        let artifact = self
            .compiler
            .build(token, reference.path(), &platform, self.disable_optimizations)
            .await?;

        let result = self
            .containerize(reference, base, &platform, &artifact)
            .await;

        if !config::stable_output() {
            if let Some(dir) = artifact.parent() {
                let _ = std::fs::remove_dir_all(dir);
            }
        }
        result
    }

    async fn containerize(
        &self,
        reference: &Reference,
        base: &Image,
        platform: &Platform,
        artifact: &Path,
    ) -> Result<Image> {
        let package = self.compiler.package_info(reference.path()).await?;
        let data_layer = Layer::from_tar(tar::tar_kodata(&package.dir.join("kodata"))?)?;

        let app_path = format!("{}/{}", tar::APP_DIR, reference.app_filename());
        let binary_layer = self
            .binary_layer(reference, platform, &app_path, artifact)
            .await?;

        // Data layer precedes binary layer.
        let with_app = base.append(vec![
            Addendum {
                layer: data_layer,
                history: HistoryEntry {
                    author: Some("ko".to_string()),
                    created_by: Some(format!("ko publish {}", reference)),
                    comment: Some("kodata contents, at $KO_DATA_PATH".to_string()),
                },
            },
            Addendum {
                layer: binary_layer,
                history: HistoryEntry {
                    author: Some("ko".to_string()),
                    created_by: Some(format!("ko publish {}", reference)),
                    comment: Some(format!("go build output, at {}", app_path)),
                },
            },
        ])?;

        let app_path_for_config = app_path.clone();
        let new_config = edit_config(with_app.config(), move |v| {
            if !v["config"].is_object() {
                v["config"] = serde_json::json!({});
            }
            v["config"]["Entrypoint"] = serde_json::json!([app_path_for_config]);
            update_path_env(v);
            v["author"] = serde_json::json!("ko");
        })?;

        let image = with_app.with_config(new_config)?;
        match self.creation_time {
            Some(time) => image.created_at(&time.to_rfc3339_opts(SecondsFormat::Secs, true)),
            None => Ok(image),
        }
    }

    async fn build_all(
        &self,
        token: &CancelToken,
        reference: &Reference,
        base: &Index,
    ) -> Result<Index> {
        let mut entries = Vec::with_capacity(base.entries().len());
        for entry in base.entries() {
            // Nested indexes are rare enough not to support.
            if !media::is_image(&entry.media_type) {
                return Err(KoError::UnsupportedBase(format!(
                    "unexpected media type {:?} in base for {}",
                    entry.media_type.to_string(),
                    reference
                )));
            }

            let image = self
                .build_one(token, reference, &entry.image, entry.platform.clone())
                .await?;
            entries.push(IndexEntry {
                image,
                platform: entry.platform.clone(),
                media_type: entry.media_type.clone(),
                urls: entry.urls.clone(),
                annotations: entry.annotations.clone(),
            });
        }
        Ok(Index::new(base.media_type().clone(), entries))
    }
}

/// Append the app directory to the config's `PATH`, or set it when no
/// `PATH` exists.
fn update_path_env(v: &mut serde_json::Value) {
    let mut env: Vec<String> = v["config"]["Env"]
        .as_array()
        .map(|array| {
            array
                .iter()
                .filter_map(|e| e.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default();

    let mut saw_path = false;
    for entry in env.iter_mut() {
        if let Some(value) = entry.strip_prefix("PATH=") {
            *entry = format!("PATH={}:{}", value, tar::APP_DIR);
            saw_path = true;
            break;
        }
    }
    if !saw_path {
        env.push(format!("PATH={}", tar::APP_DIR));
    }
    env.push(format!("KO_DATA_PATH={}", tar::KODATA_ROOT));

    v["config"]["Env"] = serde_json::json!(env);
}

#[async_trait]
impl Builder for GoBuilder {
    async fn is_supported_reference(&self, reference: &str) -> Result<()> {
        let r = Reference::parse(reference);
        match r.scheme() {
            Some(SCHEME) => {}
            Some(other) => {
                return Err(KoError::Reference(format!(
                    "scheme {:?} is not {}://",
                    other, SCHEME
                )))
            }
            None if self.allow_unqualified => {}
            None => {
                return Err(KoError::Reference(format!(
                    "{:?} does not start with {}://",
                    reference, SCHEME
                )))
            }
        }

        if !self.in_module_scope(&r) {
            return Err(KoError::Import(format!(
                "unmatched import path {:?} with go modules",
                r.path()
            )));
        }

        let package = self.compiler.package_info(r.path()).await?;
        if !package.is_command() {
            return Err(KoError::Import(format!(
                "{:?} is not `package main`",
                r.path()
            )));
        }
        Ok(())
    }

    async fn build(&self, token: &CancelToken, reference: &str) -> Result<BuildResult> {
        let r = Reference::parse(reference);
        let base = self.base.base_for(r.path()).await?;

        match base {
            BuildResult::Image(image) => Ok(BuildResult::Image(
                self.build_one(token, &r, &image, None).await?,
            )),
            BuildResult::Index(index) => Ok(BuildResult::Index(
                self.build_all(token, &r, &index).await?,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::toolchain::GoPackage;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct FakeCompiler {
        package_dir: PathBuf,
        package_name: String,
        artifact_dir: Option<PathBuf>,
        builds: AtomicUsize,
        platforms: Mutex<Vec<String>>,
    }

    impl FakeCompiler {
        fn new(package_dir: &Path) -> Self {
            FakeCompiler {
                package_dir: package_dir.to_path_buf(),
                package_name: "main".to_string(),
                artifact_dir: None,
                builds: AtomicUsize::new(0),
                platforms: Mutex::new(Vec::new()),
            }
        }

        fn with_fixed_artifact_dir(mut self, dir: &Path) -> Self {
            self.artifact_dir = Some(dir.to_path_buf());
            self
        }

        fn with_package_name(mut self, name: &str) -> Self {
            self.package_name = name.to_string();
            self
        }
    }

    #[async_trait]
    impl Compiler for FakeCompiler {
        async fn build(
            &self,
            _token: &CancelToken,
            path: &str,
            platform: &Platform,
            _disable_optimizations: bool,
        ) -> Result<PathBuf> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut platforms) = self.platforms.lock() {
                platforms.push(platform.to_string());
            }
            let dir = match &self.artifact_dir {
                Some(dir) => {
                    std::fs::create_dir_all(dir)?;
                    dir.clone()
                }
                None => tempfile::Builder::new().prefix("fake").tempdir()?.into_path(),
            };
            let file = dir.join("out");
            std::fs::write(&file, format!("binary:{}", path))?;
            Ok(file)
        }

        async fn build_id(&self, _file: &Path) -> Result<String> {
            Ok("fake-build-id".to_string())
        }

        async fn package_info(&self, _path: &str) -> Result<GoPackage> {
            Ok(GoPackage {
                dir: self.package_dir.clone(),
                name: self.package_name.clone(),
            })
        }
    }

    struct FixedBase(BuildResult);

    #[async_trait]
    impl BaseProvider for FixedBase {
        async fn base_for(&self, _path: &str) -> Result<BuildResult> {
            Ok(self.0.clone())
        }
    }

    fn package_fixture() -> TempDir {
        let tmp = TempDir::new().unwrap();
        let kodata = tmp.path().join("kodata");
        std::fs::create_dir(&kodata).unwrap();
        std::fs::write(kodata.join("index.html"), b"<html/>").unwrap();
        tmp
    }

    fn builder_with(base: BuildResult, package_dir: &Path) -> GoBuilder {
        GoBuilder::new(Arc::new(FixedBase(base)))
            .with_compiler(Arc::new(FakeCompiler::new(package_dir)))
    }

    fn config_value(image: &Image) -> serde_json::Value {
        serde_json::to_value(image.config()).unwrap()
    }

    #[tokio::test]
    async fn test_build_one_layers_and_config() {
        let package = package_fixture();
        let base = Image::scratch(&Platform::new("linux", "amd64")).unwrap();
        let builder = builder_with(BuildResult::Image(base), package.path());

        let result = builder
            .build(&CancelToken::new(), "ko://github.com/foo/cmd/app")
            .await
            .unwrap();
        let image = result.as_image().unwrap();

        // Two layers were added: data first, binary second.
        assert_eq!(image.layers().len(), 2);
        let config = config_value(image);
        assert_eq!(config["config"]["Entrypoint"], serde_json::json!(["/ko-app/app"]));
        let env: Vec<String> = config["config"]["Env"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e.as_str().unwrap().to_string())
            .collect();
        assert!(env.contains(&"KO_DATA_PATH=/var/run/ko".to_string()));
        assert!(env.contains(&"PATH=/ko-app".to_string()));
        assert_eq!(config["author"], "ko");

        // History entries were attached per added layer.
        let history = config["history"].as_array().unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0]["author"], "ko");
        assert!(history[1]["comment"]
            .as_str()
            .unwrap()
            .contains("/ko-app/app"));
    }

    #[tokio::test]
    async fn test_existing_path_is_appended() {
        let package = package_fixture();
        let base = Image::scratch(&Platform::new("linux", "amd64")).unwrap();
        let config = edit_config(base.config(), |v| {
            v["config"] = serde_json::json!({"Env": ["PATH=/usr/bin"]});
        })
        .unwrap();
        let base = base.with_config(config).unwrap();
        let builder = builder_with(BuildResult::Image(base), package.path());

        let result = builder
            .build(&CancelToken::new(), "ko://./cmd/app")
            .await
            .unwrap();
        let config = config_value(result.as_image().unwrap());
        let env: Vec<String> = config["config"]["Env"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e.as_str().unwrap().to_string())
            .collect();
        assert!(env.contains(&"PATH=/usr/bin:/ko-app".to_string()));
    }

    #[tokio::test]
    async fn test_two_builds_identical_diff_ids() {
        let package = package_fixture();
        let base = Image::scratch(&Platform::new("linux", "amd64")).unwrap();

        let diff_ids = |result: &BuildResult| -> Vec<String> {
            result
                .as_image()
                .unwrap()
                .layers()
                .iter()
                .map(|l| l.diff_id().to_string())
                .collect()
        };

        let builder = builder_with(BuildResult::Image(base.clone()), package.path());
        let first = builder
            .build(&CancelToken::new(), "ko://./cmd/app")
            .await
            .unwrap();
        let builder = builder_with(BuildResult::Image(base), package.path());
        let second = builder
            .build(&CancelToken::new(), "ko://./cmd/app")
            .await
            .unwrap();

        assert_eq!(diff_ids(&first), diff_ids(&second));
        assert_eq!(
            first.digest().unwrap(),
            second.digest().unwrap()
        );
    }

    #[tokio::test]
    async fn test_creation_time_stamped() {
        let package = package_fixture();
        let base = Image::scratch(&Platform::new("linux", "amd64")).unwrap();
        let time = DateTime::from_timestamp(1_600_000_000, 0).unwrap();
        let builder = GoBuilder::new(Arc::new(FixedBase(BuildResult::Image(base))))
            .with_compiler(Arc::new(FakeCompiler::new(package.path())))
            .with_creation_time(time);

        let result = builder
            .build(&CancelToken::new(), "ko://./cmd/app")
            .await
            .unwrap();
        let config = config_value(result.as_image().unwrap());
        assert_eq!(config["created"], "2020-09-13T12:26:40Z");
    }

    #[tokio::test]
    async fn test_index_fan_out_preserves_descriptors() {
        let package = package_fixture();

        let mut entries = Vec::new();
        for platform in ["linux/amd64", "linux/arm64", "linux/arm/v7"] {
            let platform = Platform::parse(platform).unwrap();
            entries.push(IndexEntry {
                image: Image::scratch(&platform).unwrap(),
                platform: Some(platform),
                media_type: oci_spec::image::MediaType::ImageManifest,
                urls: None,
                annotations: Some(BTreeMap::from([(
                    "base.note".to_string(),
                    "kept".to_string(),
                )])),
            });
        }
        let base = Index::new(oci_spec::image::MediaType::ImageIndex, entries);
        let builder = builder_with(BuildResult::Index(base), package.path());

        let result = builder
            .build(&CancelToken::new(), "ko://./cmd/app")
            .await
            .unwrap();
        let index = result.as_index().unwrap();

        assert_eq!(index.entries().len(), 3);
        let mut digests = Vec::new();
        for entry in index.entries() {
            // Each child was rebuilt for its own platform.
            let config = config_value(&entry.image);
            assert_eq!(
                config["config"]["Entrypoint"],
                serde_json::json!(["/ko-app/app"])
            );
            assert_eq!(
                entry.annotations.as_ref().unwrap().get("base.note"),
                Some(&"kept".to_string())
            );
            digests.push(entry.image.digest().unwrap());
        }
        digests.dedup();
        assert_eq!(digests.len(), 3, "per-platform digests must differ");

        let manifest: serde_json::Value =
            serde_json::from_slice(&index.manifest_bytes().unwrap()).unwrap();
        assert_eq!(manifest["manifests"][2]["platform"]["variant"], "v7");
    }

    #[tokio::test]
    async fn test_platforms_forwarded_to_compiler() {
        let package = package_fixture();
        let compiler = Arc::new(FakeCompiler::new(package.path()));
        let base = Image::scratch(&Platform::parse("linux/arm64").unwrap()).unwrap();
        let builder = GoBuilder::new(Arc::new(FixedBase(BuildResult::Image(base))))
            .with_compiler(compiler.clone());

        builder
            .build(&CancelToken::new(), "ko://./cmd/app")
            .await
            .unwrap();
        assert_eq!(
            compiler.platforms.lock().unwrap().as_slice(),
            &["linux/arm64".to_string()]
        );
    }

    #[tokio::test]
    async fn test_supports_requires_scheme_by_default() {
        let package = package_fixture();
        let base = Image::scratch(&Platform::new("linux", "amd64")).unwrap();
        let builder = builder_with(BuildResult::Image(base.clone()), package.path());

        assert!(builder.is_supported_reference("ko://./cmd/app").await.is_ok());
        assert!(builder.is_supported_reference("./cmd/app").await.is_err());
        assert!(builder
            .is_supported_reference("docker://Dockerfile")
            .await
            .is_err());

        let legacy = builder_with(BuildResult::Image(base), package.path())
            .with_unqualified_references();
        assert!(legacy.is_supported_reference("./cmd/app").await.is_ok());
    }

    #[tokio::test]
    async fn test_supports_rejects_non_command() {
        let package = package_fixture();
        let base = Image::scratch(&Platform::new("linux", "amd64")).unwrap();
        let builder = GoBuilder::new(Arc::new(FixedBase(BuildResult::Image(base))))
            .with_compiler(Arc::new(
                FakeCompiler::new(package.path()).with_package_name("lib"),
            ));

        let err = builder
            .is_supported_reference("ko://./pkg/lib")
            .await
            .unwrap_err();
        assert!(matches!(err, KoError::Import(_)));
    }

    #[tokio::test]
    async fn test_cache_hit_emits_lazy_layer() {
        let package = package_fixture();
        // A fixed artifact directory plays the role of stable output.
        std::env::set_var("KO_STABLE_OUTPUT", "1");
        let artifact_dir = package.path().join("stable-out");

        let base = Image::scratch(&Platform::new("linux", "amd64")).unwrap();
        let cache = Arc::new(MetaCache::new());

        let make_builder = || {
            GoBuilder::new(Arc::new(FixedBase(BuildResult::Image(base.clone()))))
                .with_compiler(Arc::new(
                    FakeCompiler::new(package.path()).with_fixed_artifact_dir(&artifact_dir),
                ))
                .with_meta_cache(cache.clone())
        };

        let first = make_builder()
            .build(&CancelToken::new(), "ko://./cmd/app")
            .await
            .unwrap();
        let first_binary = &first.as_image().unwrap().layers()[1];
        assert!(!first_binary.is_lazy());

        let second = make_builder()
            .build(&CancelToken::new(), "ko://./cmd/app")
            .await
            .unwrap();
        let second_binary = &second.as_image().unwrap().layers()[1];
        assert!(second_binary.is_lazy());
        assert_eq!(second_binary.digest(), first_binary.digest());
        assert_eq!(second_binary.diff_id(), first_binary.diff_id());

        // First access to the compressed bytes invokes the thunk and
        // reproduces the cached descriptor's digest.
        let bytes = second_binary.compressed().unwrap();
        assert_eq!(
            kolite_oci::sha256_digest(&bytes),
            second_binary.digest()
        );
        std::env::remove_var("KO_STABLE_OUTPUT");
    }
}
