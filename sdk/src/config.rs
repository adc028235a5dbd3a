// Copyright 2025 Recall Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use stagehand_provider::{
    AccessStrategy, CredentialRefresher, DefaultAccessStrategy, ExecuteOptions, HeaderCustomizer,
    HttpExecutor, ReqwestExecutor, StageLocation, VirtualHostAccessStrategy,
};

use crate::encryption::{AesCbcEngine, EncryptionEngine};
use crate::spill::DEFAULT_SPILL_THRESHOLD;

/// Environment variable forcing virtual-host style addressing.
pub const FORCE_VIRTUAL_STYLE_ENV: &str = "STAGEHAND_FORCE_VIRTUAL_STYLE_DOMAINS";

/// Transfer tuning. Every field has a default, so partial TOML files are fine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Total time budget of one HTTP call, including executor retries.
    pub network_timeout_ms: u64,
    /// Longest a transfer may go without bytes moving before the attempt times out.
    /// Zero disables it.
    pub socket_timeout_ms: u64,
    /// Base sleep between orchestrator retries.
    pub retry_backoff_min_ms: u64,
    /// Cap on the doubling of the base sleep.
    pub retry_backoff_max_exponent: u32,
    /// Use virtual-host addressing even when the stage does not ask for it.
    pub force_virtual_host: bool,
    /// Restrict downloaded files to the owner (Unix only).
    pub owner_only_permissions: bool,
    /// Parallelism hint passed to the access strategy.
    pub parallelism: usize,
    /// In-memory limit of a spill buffer before it moves to disk.
    pub spill_threshold_bytes: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_retries: 25,
            network_timeout_ms: 300_000,
            socket_timeout_ms: 300_000,
            retry_backoff_min_ms: 1000,
            retry_backoff_max_exponent: 4,
            force_virtual_host: false,
            owner_only_permissions: true,
            parallelism: 1,
            spill_threshold_bytes: DEFAULT_SPILL_THRESHOLD,
        }
    }
}

impl TransferConfig {
    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        toml::from_str(s).context("failed to parse transfer config")
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml(&s)
    }

    /// Applies overrides from the process environment.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|name| std::env::var(name).ok())
    }

    /// Applies overrides from `lookup`, which maps variable names to values.
    pub fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(value) = lookup(FORCE_VIRTUAL_STYLE_ENV) {
            match value.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => self.force_virtual_host = true,
                "false" | "0" | "no" => self.force_virtual_host = false,
                other => tracing::warn!("ignoring {}={}", FORCE_VIRTUAL_STYLE_ENV, other),
            }
        }
        self
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_millis(self.network_timeout_ms)
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_timeout_ms)
    }

    pub fn retry_backoff_min(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_min_ms)
    }
}

/// Which access strategy a client talks through.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StrategyKind {
    /// Path-style REST addressing.
    Default,
    /// Bucket-in-hostname addressing.
    VirtualHost,
}

impl StrategyKind {
    pub fn select(stage: &StageLocation, config: &TransferConfig) -> Self {
        if stage.use_virtual_url || config.force_virtual_host {
            StrategyKind::VirtualHost
        } else {
            StrategyKind::Default
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyKind::Default => f.write_str("default"),
            StrategyKind::VirtualHost => f.write_str("virtual-host"),
        }
    }
}

/// Builds the access strategy for a stage.
pub trait StrategyFactory: Send + Sync {
    fn create(
        &self,
        kind: StrategyKind,
        stage: &StageLocation,
        context: &TransferContext,
    ) -> anyhow::Result<Arc<dyn AccessStrategy>>;
}

/// Creates the GCS strategies over the context's pooled HTTP client.
#[derive(Clone, Copy, Debug, Default)]
pub struct GcsStrategyFactory;

impl StrategyFactory for GcsStrategyFactory {
    fn create(
        &self,
        kind: StrategyKind,
        stage: &StageLocation,
        context: &TransferContext,
    ) -> anyhow::Result<Arc<dyn AccessStrategy>> {
        let client = context.http_client.clone();
        let refresher = context.credential_refresher.clone();
        let max_retries = context.config.max_retries;
        let socket_timeout = context.config.socket_timeout();
        Ok(match kind {
            StrategyKind::Default => Arc::new(DefaultAccessStrategy::new(
                stage,
                client,
                refresher,
                max_retries,
                socket_timeout,
            )),
            StrategyKind::VirtualHost => Arc::new(VirtualHostAccessStrategy::new(
                stage,
                client,
                refresher,
                max_retries,
                socket_timeout,
            )),
        })
    }
}

/// Session context shared by every call of a client: tuning, hooks and collaborators.
#[derive(Clone)]
pub struct TransferContext {
    pub config: TransferConfig,
    pub header_customizers: Vec<Arc<dyn HeaderCustomizer>>,
    pub credential_refresher: Option<Arc<dyn CredentialRefresher>>,
    pub http_client: Client,
    pub executor: Arc<dyn HttpExecutor>,
    pub strategy_factory: Arc<dyn StrategyFactory>,
    pub engine: Arc<dyn EncryptionEngine>,
}

impl TransferContext {
    pub fn new(config: TransferConfig) -> anyhow::Result<Self> {
        // Socket timeouts bound idle time per transfer, so the client gets no total deadline.
        let http_client = Client::builder()
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            executor: Arc::new(ReqwestExecutor::new(http_client.clone())),
            http_client,
            config,
            header_customizers: Vec::new(),
            credential_refresher: None,
            strategy_factory: Arc::new(GcsStrategyFactory),
            engine: Arc::new(AesCbcEngine),
        })
    }

    pub fn with_header_customizer(mut self, customizer: Arc<dyn HeaderCustomizer>) -> Self {
        self.header_customizers.push(customizer);
        self
    }

    pub fn with_credential_refresher(mut self, refresher: Arc<dyn CredentialRefresher>) -> Self {
        self.credential_refresher = Some(refresher);
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn HttpExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_strategy_factory(mut self, factory: Arc<dyn StrategyFactory>) -> Self {
        self.strategy_factory = factory;
        self
    }

    pub fn with_engine(mut self, engine: Arc<dyn EncryptionEngine>) -> Self {
        self.engine = engine;
        self
    }

    /// Executor options for one presigned URL call.
    pub fn execute_options(&self, retry_on_forbidden: bool, no_retry: bool) -> ExecuteOptions {
        ExecuteOptions {
            network_timeout: self.config.network_timeout(),
            socket_timeout: self.config.socket_timeout(),
            max_retries: self.config.max_retries,
            retry_on_forbidden,
            no_retry,
            header_customizers: self.header_customizers.clone(),
        }
    }
}

impl fmt::Debug for TransferContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferContext")
            .field("config", &self.config)
            .field("header_customizers", &self.header_customizers)
            .field("credential_refresher", &self.credential_refresher.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TransferConfig::default();
        assert_eq!(config.max_retries, 25);
        assert_eq!(config.network_timeout(), Duration::from_secs(300));
        assert_eq!(config.retry_backoff_min(), Duration::from_secs(1));
        assert_eq!(config.retry_backoff_max_exponent, 4);
        assert!(!config.force_virtual_host);
        assert!(config.owner_only_permissions);
    }

    #[test]
    fn test_partial_toml() {
        let config = TransferConfig::from_toml("max_retries = 3\nforce_virtual_host = true\n").unwrap();
        assert_eq!(config.max_retries, 3);
        assert!(config.force_virtual_host);
        assert_eq!(config.socket_timeout_ms, 300_000);
        assert!(TransferConfig::from_toml("max_retries = \"many\"").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let lookup = |value: &'static str| {
            move |name: &str| (name == FORCE_VIRTUAL_STYLE_ENV).then(|| value.to_string())
        };
        let config = TransferConfig::default().with_overrides_from(lookup("TRUE"));
        assert!(config.force_virtual_host);
        let config = config.with_overrides_from(lookup("false"));
        assert!(!config.force_virtual_host);
        let config = config.with_overrides_from(lookup("maybe"));
        assert!(!config.force_virtual_host);
    }

    #[test]
    fn test_strategy_selection() {
        let mut stage = StageLocation::new("bucket/prefix");
        let mut config = TransferConfig::default();
        assert_eq!(StrategyKind::select(&stage, &config), StrategyKind::Default);
        config.force_virtual_host = true;
        assert_eq!(StrategyKind::select(&stage, &config), StrategyKind::VirtualHost);
        config.force_virtual_host = false;
        stage.use_virtual_url = true;
        assert_eq!(StrategyKind::select(&stage, &config), StrategyKind::VirtualHost);
    }

    #[test]
    fn test_execute_options() {
        let context = TransferContext::new(TransferConfig {
            max_retries: 4,
            ..Default::default()
        })
        .unwrap();
        let options = context.execute_options(true, false);
        assert_eq!(options.max_retries, 4);
        assert!(options.retry_on_forbidden);
        assert!(!options.no_retry);
    }
}
