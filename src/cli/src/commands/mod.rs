//! Command tree and shared wiring.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use kolite_build::{
    toolchain, Builder, Caching, DelegateBuilder, DockerBuilder, GoBuilder, Limiter, MetaCache,
    MultiBuilder,
};
use kolite_core::config::{self, KoConfig};
use kolite_core::error::{KoError, Result};
use kolite_oci::{BuildResult, RegistryClient};
use kolite_publish::{Daemon, Namer, Publisher, Registry, LOCAL_DOMAIN};

use crate::options::{BuildOptions, LocalOptions, NameOptions, TagsOptions};

pub mod build;
pub mod resolve;

#[derive(Debug, Parser)]
#[command(
    name = "kolite",
    version,
    about = "Build and publish container images from references in manifests"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Resolve manifests: build, publish, and rewrite references.
    Resolve(resolve::ResolveArgs),
    /// Serve the delegate build protocol on stdin/stdout.
    Build(build::BuildArgs),
}

pub async fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Resolve(args) => resolve::run(args).await,
        Command::Build(args) => build::run(args).await,
    }
}

/// Base images come from the config file through the registry client.
struct ConfigBase {
    config: KoConfig,
    client: Arc<RegistryClient>,
}

#[async_trait::async_trait]
impl kolite_build::BaseProvider for ConfigBase {
    async fn base_for(&self, path: &str) -> Result<BuildResult> {
        let name = self.config.base_image_for(path);
        tracing::info!("Using base {} for {}", name, path);
        self.client.fetch(name).await
    }
}

/// The builder stack: go + docker + delegates behind a multi-dispatch,
/// wrapped cache → limiter → builder.
pub async fn make_builder(
    options: &BuildOptions,
    client: Arc<RegistryClient>,
    ko_config: KoConfig,
) -> Result<Arc<dyn Builder>> {
    let base = Arc::new(ConfigBase {
        config: ko_config,
        client: client.clone(),
    });

    let mut go = GoBuilder::new(base);
    if let Some(time) = config::creation_time()? {
        go = go.with_creation_time(time);
    }
    if options.disable_optimizations {
        go = go.with_disabled_optimizations();
    }
    if options.legacy_import_paths {
        go = go.with_unqualified_references();
    }
    if config::cache_meta() {
        go = go.with_meta_cache(Arc::new(MetaCache::new()));
    }
    let modules = match toolchain::module_info().await {
        Ok(modules) => modules,
        Err(err) => {
            tracing::warn!("could not read module graph: {}", err);
            None
        }
    };
    go = go.with_modules(modules);

    let builders: Vec<Arc<dyn Builder>> = vec![
        Arc::new(go),
        Arc::new(DockerBuilder::new()),
        Arc::new(DelegateBuilder::new(client)),
    ];
    let multi = MultiBuilder::new(builders);
    let limited = Limiter::new(Arc::new(multi), options.concurrent_builds);
    Ok(Arc::new(Caching::new(Arc::new(limited))))
}

/// The publisher: daemon side-load when `--local` or `KO_DOCKER_REPO`
/// is the local sentinel, registry push otherwise; memoized either way.
pub fn make_publisher(
    name: &NameOptions,
    local: &LocalOptions,
    tags: &TagsOptions,
    client: Arc<RegistryClient>,
) -> Result<Arc<dyn Publisher>> {
    let namer = if name.preserve_import_paths {
        Namer::preserve_import_paths()
    } else {
        Namer::new()
    };

    let repo = config::docker_repo();
    let inner: Arc<dyn Publisher> = if local.local || repo.as_deref() == Some(LOCAL_DOMAIN) {
        Arc::new(Daemon::new(namer, tags.tags.clone()))
    } else {
        let repo = repo.ok_or_else(|| {
            KoError::Config(format!(
                "{} environment variable is unset",
                config::ENV_DOCKER_REPO
            ))
        })?;
        Arc::new(
            Registry::new(&repo, client)
                .with_namer(namer)
                .with_tags(tags.tags.clone()),
        )
    };
    Ok(Arc::new(kolite_publish::Caching::new(inner)))
}
