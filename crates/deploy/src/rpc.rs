//! The two JSON-RPC reads the release engine needs: code presence and
//! transaction receipts.

use std::time::Duration;

use alloy_core::primitives::{Address, B256};
use anyhow::Context;
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::Value;

/// Default timeout for RPC and explorer requests.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Literal returned by some providers instead of `0x` for empty accounts.
const NULL_CODE: &str = "null";

/// Create an HTTP client configured for JSON-RPC and explorer requests.
pub fn create_client() -> Result<reqwest::Client, anyhow::Error> {
    reqwest::Client::builder()
        .timeout(DEFAULT_TIMEOUT)
        .build()
        .context("Failed to create HTTP client")
}

/// JSON-RPC response envelope.
#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

/// Send `method` to `url` and deserialize its result. A `null` result
/// deserializes into `None` for optional targets.
pub async fn json_rpc_call<T: DeserializeOwned>(
    client: &reqwest::Client,
    url: &str,
    method: &str,
    params: Vec<Value>,
) -> Result<T, anyhow::Error> {
    let response: RpcResponse = client
        .post(url)
        .json(&serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        }))
        .send()
        .await
        .with_context(|| format!("{} request failed", method))?
        .error_for_status()
        .with_context(|| format!("{} request rejected", method))?
        .json()
        .await
        .with_context(|| format!("Invalid {} response", method))?;

    if let Some(error) = response.error {
        anyhow::bail!("{} failed with RPC error {}: {}", method, error.code, error.message);
    }

    serde_json::from_value(response.result.unwrap_or(Value::Null))
        .with_context(|| format!("Unexpected {} result", method))
}

/// Whether `eth_getCode` returned actual bytecode.
pub fn has_code(code: &str) -> bool {
    let code = code.trim();
    !code.is_empty() && code != "0x" && code != NULL_CODE
}

/// Query `eth_getCode` at the latest block.
pub async fn get_code(
    client: &reqwest::Client,
    url: &str,
    address: Address,
) -> Result<String, anyhow::Error> {
    let code: Option<String> = json_rpc_call(
        client,
        url,
        "eth_getCode",
        vec![serde_json::json!(address), serde_json::json!("latest")],
    )
    .await?;
    Ok(code.unwrap_or_default())
}

/// Receipt fields used to recover deployment metadata.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceiptInfo {
    #[serde(default)]
    block_number: Option<String>,
}

/// Block number of a mined transaction, or `None` if it has no receipt yet.
pub async fn transaction_block(
    client: &reqwest::Client,
    url: &str,
    tx_hash: B256,
) -> Result<Option<u64>, anyhow::Error> {
    let receipt: Option<ReceiptInfo> = json_rpc_call(
        client,
        url,
        "eth_getTransactionReceipt",
        vec![serde_json::json!(tx_hash)],
    )
    .await?;

    receipt
        .and_then(|r| r.block_number)
        .map(|n| parse_quantity(&n))
        .transpose()
}

/// Query `eth_blockNumber`, used to probe an endpoint.
pub async fn block_number(client: &reqwest::Client, url: &str) -> Result<u64, anyhow::Error> {
    let result: String = json_rpc_call(client, url, "eth_blockNumber", vec![]).await?;
    parse_quantity(&result)
}

/// Parse a hex encoded JSON-RPC quantity (`0x1a`).
pub fn parse_quantity(value: &str) -> Result<u64, anyhow::Error> {
    u64::from_str_radix(value.trim_start_matches("0x"), 16)
        .with_context(|| format!("Invalid hex quantity: {}", value))
}
