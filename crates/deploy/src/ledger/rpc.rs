//! Ethereum JSON-RPC ledger.
//!
//! Transactions are sent with `eth_sendTransaction` from an account unlocked on
//! the node (Anvil, Hardhat or a signing proxy), so no key material is handled here.

use std::path::{Path, PathBuf};
use std::time::Duration;

use alloy_core::primitives::{Address, B256, U256};
use anyhow::Context;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::{
    AbiValue, GET_ADDRESS, Ledger, LedgerCall, OWNER, QUERY_MASK, Receipt, TxRequest, encode_call,
};
use crate::capability::{Capability, CapabilityMask};
use crate::error::RemoteError;
use crate::registry::ComponentKind;

/// Default timeout for RPC requests.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// JSON-RPC error code used by geth-compatible nodes for execution reverts.
const EXECUTION_REVERTED_CODE: i64 = 3;

/// Create an HTTP client configured for JSON-RPC requests.
pub fn create_client() -> Result<reqwest::Client, anyhow::Error> {
    reqwest::Client::builder()
        .timeout(DEFAULT_TIMEOUT)
        .build()
        .context("Failed to create HTTP client")
}

/// Make a JSON-RPC call and deserialize the result.
///
/// Connection and decoding failures are transport errors. Error responses are
/// reverts when the node reports an execution revert, rejections otherwise.
async fn json_rpc_call<T: DeserializeOwned>(
    client: &reqwest::Client,
    url: &str,
    method: &str,
    params: Vec<Value>,
) -> Result<T, RemoteError> {
    let response = client
        .post(url)
        .json(&serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        }))
        .send()
        .await
        .map_err(|e| RemoteError::Transport(format!("Failed to send {method} request: {e}")))?;

    let result: Value = response
        .json()
        .await
        .map_err(|e| RemoteError::Transport(format!("Failed to parse {method} response: {e}")))?;

    if let Some(error) = result.get("error") {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("unknown")
            .to_string();
        let code = error.get("code").and_then(|c| c.as_i64());
        if code == Some(EXECUTION_REVERTED_CODE) || message.contains("revert") {
            return Err(RemoteError::Reverted { reason: message });
        }
        return Err(RemoteError::Rejected(message));
    }

    let result_value = result.get("result").cloned().unwrap_or(Value::Null);

    serde_json::from_value(result_value)
        .map_err(|e| RemoteError::Transport(format!("Failed to deserialize {method} result: {e}")))
}

fn parse_quantity(value: &str) -> Result<u64, RemoteError> {
    u64::from_str_radix(value.trim_start_matches("0x"), 16)
        .map_err(|e| RemoteError::Transport(format!("invalid quantity `{value}`: {e}")))
}

fn parse_data(value: &str) -> Result<Vec<u8>, RemoteError> {
    hex::decode(value.trim_start_matches("0x"))
        .map_err(|e| RemoteError::Transport(format!("invalid hex data: {e}")))
}

/// Return the last 32-byte word of an `eth_call` result.
fn last_word(data: &[u8]) -> Result<[u8; 32], RemoteError> {
    if data.len() < 32 {
        return Err(RemoteError::Transport(format!(
            "eth_call returned {} bytes, expected a 32-byte word",
            data.len()
        )));
    }
    let mut word = [0u8; 32];
    word.copy_from_slice(&data[data.len() - 32..]);
    Ok(word)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawReceipt {
    transaction_hash: B256,
    block_number: Option<String>,
    status: Option<String>,
    contract_address: Option<Address>,
}

/// Hardhat-style compilation artifacts, one `<Kind>.json` per component kind.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

#[derive(Debug, Deserialize)]
struct Artifact {
    bytecode: String,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Creation bytecode for `kind`.
    pub fn bytecode(&self, kind: ComponentKind) -> anyhow::Result<Vec<u8>> {
        let path = self.dir.join(format!("{kind}.json"));
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read artifact {}", path.display()))?;
        let artifact: Artifact = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse artifact {}", path.display()))?;
        let bytecode = hex::decode(artifact.bytecode.trim_start_matches("0x"))
            .with_context(|| format!("Artifact {} has invalid bytecode", path.display()))?;
        if bytecode.is_empty() {
            anyhow::bail!("Artifact {} has empty bytecode (abstract contract?)", path.display());
        }
        Ok(bytecode)
    }
}

/// Ledger backed by an Ethereum JSON-RPC endpoint.
#[derive(Debug, Clone)]
pub struct RpcLedger {
    client: reqwest::Client,
    url: String,
    artifacts: ArtifactStore,
}

impl RpcLedger {
    pub fn new(url: &url::Url, artifacts: ArtifactStore) -> anyhow::Result<Self> {
        Ok(Self {
            client: create_client()?,
            url: url.to_string(),
            artifacts,
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T, RemoteError> {
        json_rpc_call(&self.client, &self.url, method, params).await
    }

    async fn eth_call(&self, to: Address, data: Vec<u8>) -> Result<Vec<u8>, RemoteError> {
        let result: String = self
            .call(
                "eth_call",
                vec![
                    serde_json::json!({ "to": to, "data": format!("0x{}", hex::encode(data)) }),
                    serde_json::json!("latest"),
                ],
            )
            .await?;
        parse_data(&result)
    }
}

impl Ledger for RpcLedger {
    async fn submit(&self, tx: &TxRequest) -> Result<B256, RemoteError> {
        let data = match &tx.call {
            LedgerCall::Create { kind, .. } => {
                let mut code = self
                    .artifacts
                    .bytecode(*kind)
                    .map_err(|e| RemoteError::Rejected(format!("{e:#}")))?;
                code.extend(tx.call.calldata());
                code
            }
            call => call.calldata(),
        };

        let mut request = serde_json::json!({
            "from": tx.from,
            "nonce": format!("0x{:x}", tx.nonce),
            "data": format!("0x{}", hex::encode(data)),
        });
        if let Some(to) = tx.call.target() {
            request["to"] = serde_json::json!(to);
        }

        self.call("eth_sendTransaction", vec![request]).await
    }

    async fn receipt(&self, tx_hash: B256) -> Result<Option<Receipt>, RemoteError> {
        let raw: Option<RawReceipt> = self
            .call("eth_getTransactionReceipt", vec![serde_json::json!(tx_hash)])
            .await?;

        let Some(raw) = raw else {
            return Ok(None);
        };
        // Some nodes return pending receipts without a block number.
        let Some(block_number) = raw.block_number.as_deref() else {
            return Ok(None);
        };

        Ok(Some(Receipt {
            tx_hash: raw.transaction_hash,
            block_number: parse_quantity(block_number)?,
            success: raw.status.as_deref().map(parse_quantity).transpose()? != Some(0),
            contract_address: raw.contract_address,
        }))
    }

    async fn nonce(&self, account: Address) -> Result<u64, RemoteError> {
        let count: String = self
            .call(
                "eth_getTransactionCount",
                vec![serde_json::json!(account), serde_json::json!("pending")],
            )
            .await?;
        parse_quantity(&count)
    }

    async fn balance(&self, account: Address) -> Result<U256, RemoteError> {
        let balance: String = self
            .call(
                "eth_getBalance",
                vec![serde_json::json!(account), serde_json::json!("latest")],
            )
            .await?;
        U256::from_str_radix(balance.trim_start_matches("0x"), 16)
            .map_err(|e| RemoteError::Transport(format!("invalid balance `{balance}`: {e}")))
    }

    async fn has_code(&self, address: Address) -> Result<bool, RemoteError> {
        let code: String = self
            .call(
                "eth_getCode",
                vec![serde_json::json!(address), serde_json::json!("latest")],
            )
            .await?;
        Ok(!parse_data(&code)?.is_empty())
    }

    async fn role_mask(
        &self,
        controller: Address,
        holder: Address,
    ) -> Result<CapabilityMask, RemoteError> {
        let data = encode_call(
            QUERY_MASK,
            &[AbiValue::Address(holder), AbiValue::Uint(U256::MAX)],
        );
        let word = last_word(&self.eth_call(controller, data).await?)?;
        Ok(CapabilityMask::from_u256(U256::from_be_bytes(word)))
    }

    async fn owner(&self, controller: Address) -> Result<Address, RemoteError> {
        let word = last_word(&self.eth_call(controller, encode_call(OWNER, &[])).await?)?;
        Ok(Address::from_slice(&word[12..]))
    }

    async fn address_of(
        &self,
        controller: Address,
        flag: Capability,
    ) -> Result<Address, RemoteError> {
        let data = encode_call(GET_ADDRESS, &[AbiValue::Uint(flag.id())]);
        let word = last_word(&self.eth_call(controller, data).await?)?;
        Ok(Address::from_slice(&word[12..]))
    }
}
