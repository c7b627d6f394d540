//! `kolite build`, the delegate build protocol server.
//!
//! Reads newline-delimited JSON requests on stdin, builds and publishes
//! each URI, and answers with JSON responses on stdout, so this binary
//! can serve as a builder executable for delegate references.

use std::sync::Arc;

use clap::Args;
use kolite_build::delegate::{Request, Response};
use kolite_core::cancel::CancelToken;
use kolite_core::config::KoConfig;
use kolite_core::error::Result;
use kolite_oci::{RegistryAuth, RegistryClient};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::commands::{make_builder, make_publisher};
use crate::options::{BuildOptions, LocalOptions, NameOptions, TagsOptions};

#[derive(Debug, Args)]
pub struct BuildArgs {
    #[command(flatten)]
    pub name: NameOptions,

    #[command(flatten)]
    pub local: LocalOptions,

    #[command(flatten)]
    pub tags: TagsOptions,

    #[command(flatten)]
    pub build: BuildOptions,
}

pub async fn run(args: BuildArgs) -> Result<()> {
    let config = KoConfig::load()?;
    let client = Arc::new(RegistryClient::new(
        RegistryAuth::from_env(),
        args.local.insecure_registry,
    ));

    let builder = make_builder(&args.build, client.clone(), config).await?;
    let publisher = make_publisher(&args.name, &args.local, &args.tags, client)?;
    let token = CancelToken::new();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let request: Request = serde_json::from_str(line)?;
        let reference = request.uri;

        builder.is_supported_reference(&reference).await?;
        let result = builder.build(&token, &reference).await?;
        let name = publisher.publish(&token, &result, &reference).await?;

        let response = serde_json::to_vec(&Response {
            uri: reference,
            reference: name.qualified(),
        })?;
        stdout.write_all(&response).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }
    Ok(())
}
