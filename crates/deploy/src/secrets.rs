//! Secret retrieval from Google Secret Manager.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use tokio::process::Command;

use crate::config::SecretsConfig;

/// Explorer API key, used for verification.
pub const ETHERSCAN_API_SECRET: &str = "etherscan_api";
/// Alchemy API key, used to derive RPC endpoints.
pub const ALCHEMY_API_SECRET: &str = "alchemy_api";
/// Deployer key shared by all testnets.
pub const TESTNET_PRIVATE_KEY_SECRET: &str = "testnet-private-key";

/// Reads secrets through the `gcloud` CLI.
#[derive(Debug, Clone)]
pub struct SecretManager {
    project: String,
    overrides: BTreeMap<String, String>,
}

impl SecretManager {
    pub fn new(config: &SecretsConfig) -> Self {
        Self {
            project: config.project.clone(),
            overrides: config.overrides.clone(),
        }
    }

    /// Latest version of secret `name`.
    pub async fn get(&self, name: &str) -> Result<String> {
        if let Some(value) = self.overrides.get(name) {
            tracing::debug!(secret = name, "Using secret from configuration");
            return Ok(clean(value));
        }

        tracing::debug!(secret = name, project = %self.project, "Fetching secret");
        let output = Command::new("gcloud")
            .args([
                "secrets",
                "versions",
                "access",
                "latest",
                "--project",
                &self.project,
                "--secret",
                name,
            ])
            .output()
            .await
            .context("Failed to run gcloud. Is the Google Cloud SDK installed?")?;

        if !output.status.success() {
            anyhow::bail!(
                "Failed to fetch secret {} from project {}: {}",
                name,
                self.project,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let value = clean(&String::from_utf8_lossy(&output.stdout));
        if value.is_empty() {
            anyhow::bail!("Secret {} is empty", name);
        }
        Ok(value)
    }
}

/// Secrets are stored with trailing newlines and are sometimes pasted with
/// line breaks in the middle.
fn clean(value: &str) -> String {
    value.trim().replace(['\n', '\r'], "")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean() {
        assert_eq!(clean("  abc\n"), "abc");
        assert_eq!(clean("ab\r\ncd\n"), "abcd");
    }

    #[tokio::test]
    async fn test_override_takes_precedence() {
        let mut config = SecretsConfig::default();
        config
            .overrides
            .insert(ETHERSCAN_API_SECRET.to_string(), "KEY123\n".to_string());

        let secrets = SecretManager::new(&config);
        assert_eq!(secrets.get(ETHERSCAN_API_SECRET).await.unwrap(), "KEY123");
    }
}
