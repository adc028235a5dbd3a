// Copyright 2025 Recall Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use stderrlog::Timestamp;

use stagehand_provider::{StageCredentials, StageLocation};
use stagehand_sdk::{EncryptionMaterial, TransferClient, TransferConfig, TransferContext};

use crate::transfer::{
    handle_get, handle_list, handle_put, handle_stat, GetArgs, ListArgs, PutArgs, StatArgs,
};

mod progress;
mod transfer;

#[derive(Clone, Debug, Parser)]
#[command(name = "stagehand", author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    #[command(flatten)]
    stage: StageArgs,
    /// Path to a TOML transfer config.
    #[arg(short, long, env = "STAGEHAND_CONFIG")]
    config: Option<String>,
    /// Maximum number of retries per transfer. Overrides the config file.
    #[arg(long, env = "STAGEHAND_MAX_RETRIES")]
    max_retries: Option<u32>,
    /// Logging verbosity (repeat for more verbose logging).
    #[arg(short, long, env = "STAGEHAND_LOG_VERBOSITY", action = clap::ArgAction::Count)]
    verbosity: u8,
    /// Silence logging.
    #[arg(short, long, env = "STAGEHAND_LOG_QUIET", default_value_t = false)]
    quiet: bool,
}

#[derive(Clone, Debug, Subcommand)]
enum Commands {
    /// Upload a file, or stdin, to the stage.
    Put(PutArgs),
    /// Download an object from the stage.
    Get(GetArgs),
    /// List objects under a prefix.
    #[clap(alias = "list")]
    Ls(ListArgs),
    /// Show an object's metadata.
    Stat(StatArgs),
}

#[derive(Clone, Debug, Args)]
struct StageArgs {
    /// Stage location as `bucket/path/`.
    #[arg(short, long, visible_alias = "bucket", env = "STAGEHAND_LOCATION")]
    location: String,
    /// Storage endpoint override.
    #[arg(long, env = "STAGEHAND_ENDPOINT")]
    endpoint: Option<String>,
    /// Stage region.
    #[arg(long, env = "STAGEHAND_REGION")]
    region: Option<String>,
    /// Address the bucket as a virtual host.
    #[arg(long, default_value_t = false)]
    virtual_host: bool,
    /// Encrypt uploads and decrypt downloads on the client.
    #[arg(long, default_value_t = false)]
    encrypted: bool,
    /// OAuth access token for the stage.
    #[arg(long, env = "STAGEHAND_ACCESS_TOKEN", hide_env_values = true)]
    access_token: Option<String>,
    /// Base64 query stage master key (128, 192 or 256 bits).
    #[arg(long, env = "STAGEHAND_MASTER_KEY", hide_env_values = true)]
    master_key: Option<String>,
    /// Stage master key id.
    #[arg(long, env = "STAGEHAND_SMK_ID", default_value_t = 0)]
    smk_id: i64,
    /// Query id reported in errors and the encryption descriptor.
    #[arg(long, env = "STAGEHAND_QUERY_ID", default_value = "")]
    query_id: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    stderrlog::new()
        .module(module_path!())
        .module("stagehand_sdk")
        .module("stagehand_provider")
        .quiet(cli.quiet)
        .verbosity(cli.verbosity as usize)
        .timestamp(Timestamp::Millisecond)
        .init()?;

    let client = new_client(&cli)?;
    let location = cli.stage.location.as_str();
    let result = match &cli.command {
        Commands::Put(args) => handle_put(&client, location, args).await,
        Commands::Get(args) => handle_get(&client, location, args).await,
        Commands::Ls(args) => handle_list(&client, location, args).await,
        Commands::Stat(args) => handle_stat(&client, location, args).await,
    };
    client.shutdown().await;
    result
}

/// Loads the transfer config from `--config` or the defaults, then applies env and flag overrides.
fn load_config(cli: &Cli) -> anyhow::Result<TransferConfig> {
    let config = match &cli.config {
        Some(path) => {
            let path = PathBuf::from(shellexpand::full(path)?.as_ref());
            TransferConfig::from_file(path)?
        }
        None => TransferConfig::default(),
    };
    let mut config = config.with_env_overrides();
    if let Some(max_retries) = cli.max_retries {
        config.max_retries = max_retries;
    }
    Ok(config)
}

fn new_client(cli: &Cli) -> anyhow::Result<TransferClient> {
    let args = &cli.stage;
    let mut stage = StageLocation::new(args.location.clone());
    stage.endpoint = args.endpoint.clone();
    stage.region = args.region.clone();
    stage.use_virtual_url = args.virtual_host;
    stage.client_side_encrypted = args.encrypted;
    if let Some(token) = &args.access_token {
        stage.credentials = StageCredentials::with_access_token(token.clone());
    }

    let material = args
        .master_key
        .as_ref()
        .map(|key| EncryptionMaterial::new(key.clone(), args.query_id.clone(), args.smk_id));
    let context = TransferContext::new(load_config(cli)?)?;
    Ok(TransferClient::new(stage, material, context)?)
}

/// Print serializable to stdout as pretty formatted JSON.
fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(&value)?;
    println!("{}", json);
    Ok(())
}
