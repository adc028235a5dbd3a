// Copyright 2025 Recall Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use std::env;
use std::io::Cursor;

use anyhow::anyhow;
use tokio::io::AsyncReadExt;

use stagehand_provider::{StageCredentials, StageLocation};
use stagehand_sdk::{
    ByteSource, DownloadOptions, EncryptionMaterial, ObjectMetadata, TransferClient,
    TransferConfig, TransferContext, UploadOptions,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        return Err(anyhow!("usage: stage_round_trip <bucket/path/> <access-token> [master-key]"));
    }

    // Setup the stage, encrypting when a master key is given
    let mut stage = StageLocation::new(args[1].clone());
    stage.credentials = StageCredentials::with_access_token(args[2].clone());
    let material = args
        .get(3)
        .map(|key| EncryptionMaterial::new(key.clone(), "example-query", 1));
    stage.client_side_encrypted = material.is_some();

    let context = TransferContext::new(TransferConfig::default().with_env_overrides())?;
    let client = TransferClient::new(stage, material, context)?;

    // Upload a small object
    let location = args[1].as_str();
    let data = b"hello from stagehand\n".to_vec();
    let meta = ObjectMetadata::new(data.len() as u64);
    let summary = client
        .upload(
            ByteSource::from_stream(Cursor::new(data.clone())),
            location,
            "hello.txt",
            &meta,
            &UploadOptions::default(),
        )
        .await?;
    println!("Uploaded hello.txt in {} attempt(s)", summary.attempts);

    // Read it back
    let mut stream = client
        .download_to_stream(location, "hello.txt", &DownloadOptions::default())
        .await?;
    let mut downloaded = Vec::new();
    stream.read_to_end(&mut downloaded).await?;
    assert_eq!(downloaded, data);
    println!("Downloaded: {}", String::from_utf8_lossy(&downloaded));
    println!("Stats: {:?}", client.stats());

    client.shutdown().await;
    Ok(())
}
