// Copyright 2025 Recall Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

#![allow(dead_code)]

pub mod server;

use std::collections::{BTreeMap, VecDeque};
use std::io::{self, Cursor};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rand::RngCore;
use stagehand_provider::reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use stagehand_provider::reqwest::{Method, StatusCode};
use stagehand_provider::util::metadata_from_headers;
use stagehand_provider::{
    AccessStrategy, DownloadStream, ExecuteOptions, HttpExecutor, HttpRequest, HttpResponse,
    ObjectSummary, Operation, RemoteObjectMetadata, StageLocation, StatusError,
    TokenUploadRequest, UploadStream, UserMetadata, ACCESS_TOKEN_KEY, METADATA_PREFIX,
};
use stagehand_sdk::encryption::key::CipherUnavailable;
use stagehand_sdk::{
    EncryptionMaterial, StrategyFactory, StrategyKind, TransferConfig, TransferContext,
};
use tokio::io::AsyncReadExt;

pub const LOCATION: &str = "stage-bucket/results/";
pub const PRESIGNED_HOST: &str = "https://storage.example.com";
pub const MASTER_KEY_256: &str = "AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8=";
/// Token the mock strategy installs when it recovers from a 401.
pub const REFRESHED_TOKEN: &str = "refreshed-token";

/// Failures the mocks can be told to raise.
#[derive(Clone, Copy, Debug)]
pub enum MockFailure {
    Timeout,
    DiskFull,
    Crypto,
    Status(u16),
}

impl MockFailure {
    pub fn into_error(self) -> anyhow::Error {
        match self {
            MockFailure::Timeout => {
                anyhow::Error::new(io::Error::new(io::ErrorKind::TimedOut, "read timed out"))
            }
            MockFailure::DiskFull => anyhow::Error::new(io::Error::from_raw_os_error(28))
                .context("failed to write object"),
            MockFailure::Crypto => {
                anyhow::Error::new(CipherUnavailable("AES provider missing".to_string()))
                    .context("failed to initialize cipher")
            }
            MockFailure::Status(code) => anyhow::Error::new(StatusError {
                status: StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                body: "scripted failure".to_string(),
            }),
        }
    }
}

/// Failures handed out one per call, first from the queue, then `always` if set.
#[derive(Debug, Default)]
pub struct FailureScript {
    queue: Mutex<VecDeque<MockFailure>>,
    always: Mutex<Option<MockFailure>>,
}

impl FailureScript {
    pub fn push(&self, failure: MockFailure) {
        self.queue.lock().unwrap().push_back(failure);
    }

    pub fn always(&self, failure: MockFailure) {
        *self.always.lock().unwrap() = Some(failure);
    }

    pub fn next(&self) -> Option<MockFailure> {
        if let Some(failure) = self.queue.lock().unwrap().pop_front() {
            return Some(failure);
        }
        *self.always.lock().unwrap()
    }
}

/// How many failures the mock strategy reports as recovered.
#[derive(Debug, Default)]
pub struct RecoveryScript {
    remaining: AtomicU32,
    consulted: AtomicU32,
    recovered: AtomicU32,
}

impl RecoveryScript {
    /// Recover from the next `n` failures.
    pub fn recover_next(&self, n: u32) {
        self.remaining.store(n, Ordering::SeqCst);
    }

    /// Recover from every failure.
    pub fn recover_always(&self) {
        self.remaining.store(u32::MAX, Ordering::SeqCst);
    }

    /// Times the strategy was asked to handle a failure.
    pub fn consulted(&self) -> u32 {
        self.consulted.load(Ordering::SeqCst)
    }

    pub fn recovered(&self) -> u32 {
        self.recovered.load(Ordering::SeqCst)
    }

    fn take(&self) -> bool {
        self.consulted.fetch_add(1, Ordering::SeqCst);
        let recovered = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                0 => None,
                u32::MAX => Some(n),
                n => Some(n - 1),
            })
            .is_ok();
        if recovered {
            self.recovered.fetch_add(1, Ordering::SeqCst);
        }
        recovered
    }
}

#[derive(Clone, Debug, Default)]
pub struct StoredObject {
    pub data: Vec<u8>,
    pub content_encoding: Option<String>,
    pub user_metadata: UserMetadata,
}

/// Object store shared by the mock strategy and the mock executor, keyed by `bucket/path`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<String, StoredObject>>,
}

impl MemoryStore {
    pub fn put(&self, path: impl Into<String>, object: StoredObject) {
        self.objects.lock().unwrap().insert(path.into(), object);
    }

    pub fn get(&self, path: &str) -> Option<StoredObject> {
        self.objects.lock().unwrap().get(path).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }
}

pub fn object_path(location: &str, key: &str) -> String {
    format!("{}{}", location, key)
}

fn not_found(path: &str) -> anyhow::Error {
    anyhow::Error::new(StatusError {
        status: StatusCode::NOT_FOUND,
        body: format!("no such object: {}", path),
    })
}

/// In-memory [`AccessStrategy`] that requires an access token.
/// Recovering from a 401 installs [`REFRESHED_TOKEN`].
pub struct MockStrategy {
    token: Mutex<Option<String>>,
    store: Arc<MemoryStore>,
    script: Arc<FailureScript>,
    recovery: Arc<RecoveryScript>,
    attempts: Arc<AtomicU32>,
    closed: AtomicBool,
}

impl MockStrategy {
    fn begin(&self) -> anyhow::Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.closed.load(Ordering::SeqCst) {
            anyhow::bail!("strategy has been shut down");
        }
        if self.token.lock().unwrap().is_none() {
            return Err(anyhow::Error::new(StatusError {
                status: StatusCode::UNAUTHORIZED,
                body: "missing access token".to_string(),
            }));
        }
        Ok(())
    }
}

#[async_trait]
impl AccessStrategy for MockStrategy {
    async fn list_objects(
        &self,
        location: &str,
        prefix: &str,
    ) -> anyhow::Result<Vec<ObjectSummary>> {
        let start = object_path(location, prefix);
        Ok(self
            .store
            .keys()
            .into_iter()
            .filter(|k| k.starts_with(&start))
            .filter_map(|k| {
                let object = self.store.get(&k)?;
                Some(ObjectSummary {
                    location: location.to_string(),
                    key: k[location.len()..].to_string(),
                    size: object.data.len() as u64,
                    md5: None,
                })
            })
            .collect())
    }

    async fn object_metadata(
        &self,
        location: &str,
        key: &str,
    ) -> anyhow::Result<RemoteObjectMetadata> {
        let path = object_path(location, key);
        let object = self.store.get(&path).ok_or_else(|| not_found(&path))?;
        Ok(RemoteObjectMetadata {
            content_length: object.data.len() as u64,
            content_encoding: object.content_encoding,
            user_metadata: object.user_metadata,
        })
    }

    async fn upload_with_token(
        &self,
        request: TokenUploadRequest<'_>,
        mut body: UploadStream,
    ) -> anyhow::Result<()> {
        self.begin()?;
        let mut data = Vec::new();
        body.read_to_end(&mut data).await?;
        if let Some(failure) = self.script.next() {
            return Err(failure.into_error());
        }
        self.store.put(
            object_path(request.location, request.key),
            StoredObject {
                data,
                content_encoding: request.content_encoding.map(str::to_string),
                user_metadata: request.user_metadata.clone(),
            },
        );
        Ok(())
    }

    async fn download(
        &self,
        _parallelism: usize,
        location: &str,
        key: &str,
        dest: &Path,
    ) -> anyhow::Result<UserMetadata> {
        self.begin()?;
        if let Some(failure) = self.script.next() {
            return Err(failure.into_error());
        }
        let path = object_path(location, key);
        let object = self.store.get(&path).ok_or_else(|| not_found(&path))?;
        tokio::fs::write(dest, &object.data).await?;
        Ok(object.user_metadata)
    }

    async fn download_to_stream(
        &self,
        location: &str,
        key: &str,
        _decrypting: bool,
    ) -> anyhow::Result<(DownloadStream, UserMetadata)> {
        self.begin()?;
        if let Some(failure) = self.script.next() {
            return Err(failure.into_error());
        }
        let path = object_path(location, key);
        let object = self.store.get(&path).ok_or_else(|| not_found(&path))?;
        Ok((Box::new(Cursor::new(object.data)), object.user_metadata))
    }

    async fn handle_storage_error(
        &self,
        err: &anyhow::Error,
        _retry_count: u32,
        _operation: Operation,
    ) -> bool {
        if !self.recovery.take() {
            return false;
        }
        let unauthorized = err
            .chain()
            .filter_map(|cause| cause.downcast_ref::<StatusError>())
            .any(|e| e.status == StatusCode::UNAUTHORIZED);
        if unauthorized {
            *self.token.lock().unwrap() = Some(REFRESHED_TOKEN.to_string());
        }
        true
    }

    async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Creates [`MockStrategy`] instances and records which kinds were asked for.
#[derive(Default)]
pub struct MockFactory {
    pub store: Arc<MemoryStore>,
    pub script: Arc<FailureScript>,
    pub recovery: Arc<RecoveryScript>,
    pub attempts: Arc<AtomicU32>,
    pub created: Mutex<Vec<StrategyKind>>,
}

impl StrategyFactory for MockFactory {
    fn create(
        &self,
        kind: StrategyKind,
        stage: &StageLocation,
        _context: &TransferContext,
    ) -> anyhow::Result<Arc<dyn AccessStrategy>> {
        self.created.lock().unwrap().push(kind);
        Ok(Arc::new(MockStrategy {
            token: Mutex::new(stage.credentials.access_token().map(str::to_string)),
            store: self.store.clone(),
            script: self.script.clone(),
            recovery: self.recovery.clone(),
            attempts: self.attempts.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

/// A request as the mock executor saw it.
#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub no_retry: bool,
    pub retry_on_forbidden: bool,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// [`HttpExecutor`] that serves presigned GET/PUT from the shared store.
#[derive(Default)]
pub struct MockExecutor {
    pub store: Arc<MemoryStore>,
    pub script: FailureScript,
    pub requests: Mutex<Vec<RecordedRequest>>,
}

impl MockExecutor {
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpExecutor for MockExecutor {
    async fn execute(
        &self,
        mut request: HttpRequest,
        options: &ExecuteOptions,
    ) -> anyhow::Result<HttpResponse> {
        for customizer in &options.header_customizers {
            customizer.customize(&mut request);
        }
        let mut body = Vec::new();
        if let Some(mut stream) = request.take_body() {
            stream.read_to_end(&mut body).await?;
        }
        let path = request.url.path().trim_start_matches('/').to_string();
        self.requests.lock().unwrap().push(RecordedRequest {
            method: request.method.clone(),
            url: request.url.to_string(),
            headers: request.headers.clone(),
            body: body.clone(),
            no_retry: options.no_retry,
            retry_on_forbidden: options.retry_on_forbidden,
        });

        match self.script.next() {
            Some(MockFailure::Status(code)) => {
                let status = StatusCode::from_u16(code)?;
                return Ok(HttpResponse::from_bytes(status, HeaderMap::new(), "scripted"));
            }
            Some(failure) => return Err(failure.into_error()),
            None => {}
        }

        if request.method == Method::PUT {
            self.store.put(
                path,
                StoredObject {
                    data: body,
                    content_encoding: request.headers.get("content-encoding").and_then(|v| {
                        v.to_str().ok().map(str::to_string)
                    }),
                    user_metadata: metadata_from_headers(&request.headers),
                },
            );
            return Ok(HttpResponse::from_bytes(
                StatusCode::OK,
                HeaderMap::new(),
                Vec::new(),
            ));
        }

        match self.store.get(&path) {
            Some(object) => {
                let mut headers = HeaderMap::new();
                for (key, value) in &object.user_metadata {
                    headers.insert(
                        HeaderName::from_bytes(format!("{METADATA_PREFIX}{key}").as_bytes())?,
                        HeaderValue::from_str(value)?,
                    );
                }
                Ok(HttpResponse::from_bytes(StatusCode::OK, headers, object.data))
            }
            None => Ok(HttpResponse::from_bytes(
                StatusCode::NOT_FOUND,
                HeaderMap::new(),
                "NoSuchKey",
            )),
        }
    }
}

/// Mock collaborators wired to one store.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub factory: Arc<MockFactory>,
    pub executor: Arc<MockExecutor>,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::default());
        let factory = Arc::new(MockFactory {
            store: store.clone(),
            ..Default::default()
        });
        let executor = Arc::new(MockExecutor {
            store: store.clone(),
            ..Default::default()
        });
        Self {
            store,
            factory,
            executor,
        }
    }

    pub fn context(&self, config: TransferConfig) -> TransferContext {
        TransferContext::new(config)
            .unwrap()
            .with_strategy_factory(self.factory.clone())
            .with_executor(self.executor.clone())
    }

    /// Calls made into any strategy created by this harness.
    pub fn strategy_attempts(&self) -> u32 {
        self.factory.attempts.load(Ordering::SeqCst)
    }

    pub fn strategy_script(&self) -> &FailureScript {
        &self.factory.script
    }

    pub fn recovery(&self) -> &RecoveryScript {
        &self.factory.recovery
    }

    pub fn created_kinds(&self) -> Vec<StrategyKind> {
        self.factory.created.lock().unwrap().clone()
    }
}

/// Config with no sleeps between retries.
pub fn fast_config(max_retries: u32) -> TransferConfig {
    TransferConfig {
        max_retries,
        retry_backoff_min_ms: 0,
        ..Default::default()
    }
}

pub fn stage(encrypted: bool, token: Option<&str>) -> StageLocation {
    let mut stage = StageLocation::new(LOCATION);
    stage.client_side_encrypted = encrypted;
    if let Some(token) = token {
        stage.credentials.insert(ACCESS_TOKEN_KEY, token);
    }
    stage
}

pub fn material() -> EncryptionMaterial {
    EncryptionMaterial::new(MASTER_KEY_256, "01b2c3-query", 4242)
}

pub fn presigned_url(key: &str) -> String {
    format!(
        "{}/{}?X-Goog-Algorithm=GOOG4-RSA-SHA256&X-Goog-Signature=deadbeef",
        PRESIGNED_HOST,
        object_path(LOCATION, key)
    )
}

pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    data
}

pub async fn read_all(mut stream: DownloadStream) -> Vec<u8> {
    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.unwrap();
    out
}
