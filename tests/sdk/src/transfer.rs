// Copyright 2025 Recall Contributors
// SPDX-License-Identifier: Apache-2.0, MIT
#[cfg(test)]
mod tests {
    use more_asserts::assert_ge;
    use rand::{thread_rng, Rng};
    use std::io::Cursor;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use stagehand_sdk::metadata::{add_digest_metadata, compute_digest, digest_metadata};
    use stagehand_sdk::{
        ByteSource, DownloadOptions, ObjectMetadata, TransferClient, TransferContext,
        TransferErrorKind, UploadOptions,
    };

    use crate::test_utils;

    fn new_client(encrypted: bool) -> TransferClient {
        let stage = test_utils::get_test_stage();
        let config = test_utils::get_transfer_config(&stage);
        let material = encrypted.then(test_utils::get_runner_material);
        let location = test_utils::get_stage_location(&stage, encrypted);
        TransferClient::new(location, material, TransferContext::new(config).unwrap()).unwrap()
    }

    fn test_key(name: &str) -> String {
        format!("stagehand-tests/{}-{}", name, thread_rng().gen::<u32>())
    }

    #[tokio::test]
    #[ignore]
    async fn can_upload_and_download_encrypted_file() {
        let client = new_client(true);
        let location = client.stage().location.clone();
        let key = test_key("encrypted");

        // Create a temp file to upload
        let mut file = async_tempfile::TempFile::new().await.unwrap();
        let mut random_data = vec![0; 1024 * 1024]; // 1 MiB
        thread_rng().fill(&mut random_data[..]);
        file.write_all(&random_data).await.unwrap();
        file.flush().await.unwrap();

        let (digest, len) = compute_digest(Cursor::new(random_data.clone()))
            .await
            .unwrap();
        let mut meta = ObjectMetadata::new(len);
        add_digest_metadata(&mut meta, &digest);
        let summary = client
            .upload(
                ByteSource::File(file.file_path().clone()),
                &location,
                &key,
                &meta,
                &UploadOptions::default(),
            )
            .await
            .unwrap();
        assert_ge!(summary.attempts, 1);

        // Check the stored object carries the digest and is larger than the plaintext
        let remote = client.object_metadata(&location, &key).await.unwrap();
        assert_eq!(digest_metadata(&remote), Some(digest.as_str()));
        assert_ge!(remote.content_length(), len);

        // Download it back to a file
        let dest = async_tempfile::TempFile::new().await.unwrap();
        client
            .download(&location, &key, dest.file_path(), &DownloadOptions::default())
            .await
            .unwrap();
        let downloaded = tokio::fs::read(dest.file_path()).await.unwrap();
        assert_eq!(downloaded, random_data);

        // And as a stream
        let mut stream = client
            .download_to_stream(&location, &key, &DownloadOptions::default())
            .await
            .unwrap();
        let mut streamed = Vec::new();
        stream.read_to_end(&mut streamed).await.unwrap();
        assert_eq!(streamed, random_data);

        client.shutdown().await;
    }

    #[tokio::test]
    #[ignore]
    async fn can_list_uploaded_objects() {
        let client = new_client(false);
        let location = client.stage().location.clone();
        let prefix = test_key("listing");

        for name in ["a.csv", "b.csv"] {
            let data = format!("id,name\n1,{}\n", name).into_bytes();
            client
                .upload(
                    ByteSource::from_stream(Cursor::new(data.clone())),
                    &location,
                    &format!("{}/{}", prefix, name),
                    &ObjectMetadata::new(data.len() as u64).with_content_encoding("text/plain"),
                    &UploadOptions::default(),
                )
                .await
                .unwrap();
        }

        let objects = client
            .list_objects(&location, &format!("{}/", prefix))
            .await
            .unwrap();
        assert_eq!(objects.len(), 2);
        assert!(objects.iter().all(|o| o.key.starts_with(&prefix)));
    }

    #[tokio::test]
    #[ignore]
    async fn missing_object_is_rejected() {
        let client = new_client(false);
        let location = client.stage().location.clone();
        let dest = async_tempfile::TempFile::new().await.unwrap();

        let err = client
            .download(
                &location,
                &test_key("missing"),
                dest.file_path(),
                &DownloadOptions::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), TransferErrorKind::RemoteRejected);
    }
}
