// Copyright 2025 Recall Contributors
// SPDX-License-Identifier: Apache-2.0, MIT
mod transfer;

#[cfg(test)]
pub mod test_utils {
    use serde::Deserialize;
    use stagehand_provider::{StageCredentials, StageLocation};
    use stagehand_sdk::{EncryptionMaterial, TransferConfig};
    use std::{env, fs, path::Path};

    const DEFAULT_TEST_STAGE_CONFIG_PATH: &str = "~/.config/stagehand/test-stage.toml";

    /// Live stage the ignored tests run against.
    #[derive(Debug, Default, Deserialize)]
    #[serde(default)]
    pub struct TestStage {
        pub location: String,
        pub endpoint: Option<String>,
        pub region: Option<String>,
        pub use_virtual_url: bool,
        pub transfer: TransferConfig,
    }

    pub fn get_test_stage() -> TestStage {
        let config_path = env::var("STAGEHAND_TEST_STAGE_CONFIG")
            .unwrap_or_else(|_| DEFAULT_TEST_STAGE_CONFIG_PATH.to_string());
        let config_path = shellexpand::full(config_path.as_str()).unwrap();
        let config_path = Path::new(config_path.as_ref());
        let mut stage: TestStage = if !config_path.exists() {
            TestStage::default()
        } else {
            let file_content = fs::read_to_string(config_path).unwrap();
            toml::from_str(&file_content).unwrap()
        };
        if let Ok(location) = env::var("STAGEHAND_TEST_LOCATION") {
            stage.location = location;
        }
        assert!(
            !stage.location.is_empty(),
            "set STAGEHAND_TEST_LOCATION or a location in the test stage config"
        );
        stage
    }

    pub fn get_stage_location(stage: &TestStage, encrypted: bool) -> StageLocation {
        let mut location = StageLocation::new(stage.location.clone());
        location.endpoint = stage.endpoint.clone();
        location.region = stage.region.clone();
        location.use_virtual_url = stage.use_virtual_url;
        location.client_side_encrypted = encrypted;
        location.credentials = StageCredentials::with_access_token(get_runner_access_token());
        location
    }

    pub fn get_transfer_config(stage: &TestStage) -> TransferConfig {
        stage.transfer.clone().with_env_overrides()
    }

    pub fn get_runner_access_token() -> String {
        env::var("STAGEHAND_TEST_ACCESS_TOKEN").unwrap_or_default()
    }

    /// Material with the master key from the environment, or a fixed 256-bit test key.
    pub fn get_runner_material() -> EncryptionMaterial {
        let key = env::var("STAGEHAND_TEST_MASTER_KEY")
            .ok()
            .filter(|k| !k.is_empty())
            .unwrap_or_else(|| "AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8=".to_string());
        EncryptionMaterial::new(key, "live-test-query", 1)
    }
}
