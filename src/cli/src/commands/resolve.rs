//! `kolite resolve`

use std::sync::Arc;

use clap::Args;
use kolite_core::cancel::CancelToken;
use kolite_core::config::KoConfig;
use kolite_core::error::Result;
use kolite_oci::{RegistryAuth, RegistryClient};

use crate::commands::{make_builder, make_publisher};
use crate::options::{
    BuildOptions, FilenameOptions, LocalOptions, NameOptions, TagsOptions,
};
use crate::{driver, options};

#[derive(Debug, Args)]
pub struct ResolveArgs {
    #[command(flatten)]
    pub filename: FilenameOptions,

    #[command(flatten)]
    pub name: NameOptions,

    #[command(flatten)]
    pub local: LocalOptions,

    #[command(flatten)]
    pub tags: TagsOptions,

    #[command(flatten)]
    pub build: BuildOptions,

    /// Fail when a scheme-qualified reference cannot be resolved.
    #[arg(long = "strict")]
    pub strict: bool,
}

pub async fn run(args: ResolveArgs) -> Result<()> {
    let config = KoConfig::load()?;
    let client = Arc::new(RegistryClient::new(
        RegistryAuth::from_env(),
        args.local.insecure_registry,
    ));

    let builder = make_builder(&args.build, client.clone(), config).await?;
    let publisher = make_publisher(&args.name, &args.local, &args.tags, client)?;

    let files = options::enumerate_files(&args.filename);
    let token = CancelToken::new();
    let mut stdout = tokio::io::stdout();

    driver::resolve_files_to_writer(builder, publisher, &token, files, args.strict, &mut stdout)
        .await
}
