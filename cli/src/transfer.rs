// Copyright 2025 Recall Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::Args;
use humantime::format_duration;
use indicatif::HumanDuration;
use serde_json::json;
use tokio::io::AsyncWriteExt;

use stagehand_provider::util::parse_metadata;
use stagehand_sdk::metadata::{
    add_digest_metadata, add_streaming_ingest_metadata, compute_digest, digest_metadata,
    streaming_ingest_client_key, streaming_ingest_client_name,
};
use stagehand_sdk::spill::SpillReader;
use stagehand_sdk::{
    ByteSource, DownloadOptions, ObjectMetadata, SpillBuffer, TransferClient, UploadOptions,
};

use crate::print_json;
use crate::progress::{new_message_bar, new_multi_bar, SPARKLE};

#[derive(Clone, Debug, Args)]
pub struct PutArgs {
    /// Object key under the stage location.
    key: String,
    /// File to upload. Reads stdin when omitted.
    #[arg(short, long)]
    input: Option<PathBuf>,
    /// Content encoding to record, e.g. `gzip`.
    #[arg(long)]
    content_encoding: Option<String>,
    /// Presigned URL to PUT to instead of using the access token.
    #[arg(long, env = "STAGEHAND_PRESIGNED_URL")]
    presigned_url: Option<String>,
    /// User metadata to attach as `key=value`.
    #[arg(short, long, value_parser = parse_metadata)]
    metadata: Vec<(String, String)>,
    /// Streaming ingest client name and key, recorded for per-client billing.
    #[arg(long, num_args = 2, value_names = ["NAME", "KEY"])]
    ingest_client: Option<Vec<String>>,
    /// Upload with a single attempt bounded by this timeout, e.g. `30s`.
    #[arg(long, value_parser = humantime::parse_duration)]
    single_attempt: Option<std::time::Duration>,
    #[command(flatten)]
    progress: ProgressArgs,
}

#[derive(Clone, Debug, Args)]
pub struct GetArgs {
    /// Object key under the stage location.
    key: String,
    /// File to write. Writes to stdout when omitted.
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Presigned URL to GET from instead of using the access token.
    #[arg(long, env = "STAGEHAND_PRESIGNED_URL")]
    presigned_url: Option<String>,
    #[command(flatten)]
    progress: ProgressArgs,
}

#[derive(Clone, Debug, Args)]
pub struct ListArgs {
    /// Key prefix to list.
    #[arg(default_value = "")]
    prefix: String,
}

#[derive(Clone, Debug, Args)]
pub struct StatArgs {
    /// Object key under the stage location.
    key: String,
}

#[derive(Clone, Debug, Args)]
struct ProgressArgs {
    /// Do not show progress.
    #[arg(long, default_value_t = false)]
    no_progress: bool,
}

/// Uploads a file or stdin and prints the transfer summary.
pub async fn handle_put(
    client: &TransferClient,
    location: &str,
    args: &PutArgs,
) -> anyhow::Result<()> {
    let started = Instant::now();
    let bars = new_multi_bar(args.progress.no_progress);
    let msg_bar = bars.add(new_message_bar());

    msg_bar.set_prefix("[1/2]");
    msg_bar.set_message("Preparing source...");
    let threshold = client.context().config.spill_threshold_bytes;
    let (source, digest, len) = put_source(args.input.as_deref(), threshold).await?;

    let mut meta = ObjectMetadata::new(len);
    if let Some(encoding) = &args.content_encoding {
        meta = meta.with_content_encoding(encoding.clone());
    }
    for (key, value) in &args.metadata {
        meta.add_user_metadata(key.clone(), value.clone());
    }
    if let Some([name, key]) = args.ingest_client.as_deref() {
        add_streaming_ingest_metadata(&mut meta, name, key);
    }
    add_digest_metadata(&mut meta, &digest);

    msg_bar.set_prefix("[2/2]");
    msg_bar.set_message(format!("Uploading {} (size={})", args.key, len));
    let options = UploadOptions {
        presigned_url: args.presigned_url.clone(),
        ..Default::default()
    };
    let summary = match args.single_attempt {
        Some(timeout) => {
            client
                .upload_without_session(source, location, &args.key, &meta, &options, timeout)
                .await?
        }
        None => {
            client
                .upload(source, location, &args.key, &meta, &options)
                .await?
        }
    };

    msg_bar.println(format!(
        "{} Uploaded {} in {} (size={}; attempts={})",
        SPARKLE,
        args.key,
        HumanDuration(started.elapsed()),
        len,
        summary.attempts
    ));
    msg_bar.finish_and_clear();
    print_json(&json!({
        "key": args.key,
        "size": len,
        "digest": digest,
        "summary": summary,
        "stats": client.stats(),
    }))
}

/// The upload source with its digest and length. Files are reopened for each attempt; stdin
/// is buffered so it can be replayed.
async fn put_source(
    input: Option<&Path>,
    spill_threshold: usize,
) -> anyhow::Result<(ByteSource, String, u64)> {
    if let Some(path) = input {
        let file = tokio::fs::File::open(path).await?;
        let (digest, len) = compute_digest(file).await?;
        return Ok((ByteSource::File(path.to_path_buf()), digest, len));
    }
    let mut buffer = SpillBuffer::from_reader(tokio::io::stdin(), spill_threshold).await?;
    let (digest, len) = match buffer.open().await? {
        SpillReader::Memory(reader) => compute_digest(reader).await?,
        SpillReader::File(reader) => compute_digest(reader).await?,
    };
    Ok((ByteSource::Spill(buffer), digest, len))
}

/// Downloads an object to a file or stdout.
pub async fn handle_get(
    client: &TransferClient,
    location: &str,
    args: &GetArgs,
) -> anyhow::Result<()> {
    let started = Instant::now();
    let bars = new_multi_bar(args.progress.no_progress);
    let msg_bar = bars.add(new_message_bar());
    msg_bar.set_prefix("[1/1]");
    msg_bar.set_message(format!("Downloading {}", args.key));

    let options = DownloadOptions {
        presigned_url: args.presigned_url.clone(),
        ..Default::default()
    };
    match &args.output {
        Some(path) => {
            let summary = client
                .download(location, &args.key, path, &options)
                .await?;
            msg_bar.println(format!(
                "{} Downloaded {} in {} (network={}; decryption={})",
                SPARKLE,
                args.key,
                HumanDuration(started.elapsed()),
                format_duration(summary.network_elapsed),
                format_duration(summary.decrypt_elapsed)
            ));
        }
        None => {
            let mut stream = client
                .download_to_stream(location, &args.key, &options)
                .await?;
            let mut stdout = tokio::io::stdout();
            let copied = tokio::io::copy(&mut stream, &mut stdout).await?;
            stdout.flush().await?;
            msg_bar.println(format!(
                "{} Downloaded {} in {} (size={})",
                SPARKLE,
                args.key,
                HumanDuration(started.elapsed()),
                copied
            ));
        }
    }
    msg_bar.finish_and_clear();
    Ok(())
}

/// Lists objects under a prefix.
pub async fn handle_list(
    client: &TransferClient,
    location: &str,
    args: &ListArgs,
) -> anyhow::Result<()> {
    let objects = client.list_objects(location, &args.prefix).await?;
    print_json(&objects)
}

/// Prints an object's size, encoding and user metadata.
pub async fn handle_stat(
    client: &TransferClient,
    location: &str,
    args: &StatArgs,
) -> anyhow::Result<()> {
    let meta = client.object_metadata(location, &args.key).await?;
    print_json(&json!({
        "key": args.key,
        "size": meta.content_length(),
        "content_encoding": meta.content_encoding(),
        "digest": digest_metadata(&meta),
        "ingest_client_name": streaming_ingest_client_name(&meta),
        "ingest_client_key": streaming_ingest_client_key(&meta),
        "user_metadata": meta.user_metadata(),
    }))
}
