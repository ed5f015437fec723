use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::SourceError;

/// Read-only view of the remote chain the engine walks
#[async_trait]
pub trait ChainSource: Send + Sync {
    async fn block_by_hash(&self, hash: &str) -> Result<BlockPayload, SourceError>;

    async fn transaction_by_id(&self, txid: &str) -> Result<TransactionPayload, SourceError>;

    async fn block_hash_at_height(&self, height: i64) -> Result<String, SourceError>;

    /// Height of the best block the source knows about
    async fn chain_tip(&self) -> Result<i64, SourceError>;
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BlockPayload {
    pub hash: String,
    #[serde(default)]
    pub confirmations: i64,
    pub size: i64,
    #[serde(default)]
    pub weight: i64,
    pub height: i64,
    pub version: i32,
    #[serde(rename = "merkleroot")]
    pub merkle_root: String,
    #[serde(rename = "tx")]
    pub transactions: Vec<String>,
    pub time: i64,
    #[serde(rename = "mediantime", default)]
    pub median_time: i64,
    pub nonce: i64,
    pub difficulty: f64,
    #[serde(rename = "nTx", default)]
    pub n_tx: Option<i32>,
    #[serde(rename = "previousblockhash", default)]
    pub previous_block_hash: Option<String>,
    #[serde(rename = "nextblockhash", default)]
    pub next_block_hash: Option<String>,
}

impl BlockPayload {
    /// Successor hash, if the source already knows one
    pub fn successor(&self) -> Option<&str> {
        self.next_block_hash
            .as_deref()
            .map(str::trim)
            .filter(|h| !h.is_empty())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransactionPayload {
    pub txid: String,
    pub hash: String,
    pub version: i64,
    #[serde(default)]
    pub weight: i64,
    pub locktime: i64,
    pub hex: String,
    #[serde(rename = "blocktime", default)]
    pub block_time: Option<i64>,
    pub vin: Vec<VinPayload>,
    pub vout: Vec<VoutPayload>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VinPayload {
    #[serde(default)]
    pub txid: Option<String>,
    #[serde(default)]
    pub vout: Option<i32>,
    #[serde(default)]
    pub coinbase: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VoutPayload {
    pub value: f64,
    pub n: i32,
    #[serde(rename = "scriptPubKey")]
    pub script_pub_key: ScriptPubKeyPayload,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScriptPubKeyPayload {
    #[serde(default)]
    pub asm: String,
    #[serde(default)]
    pub hex: String,
    #[serde(rename = "reqSigs", default)]
    pub req_sigs: Option<i32>,
    #[serde(rename = "type", default)]
    pub kind: String,
    // Older nodes report a list, newer ones a single address
    #[serde(default)]
    pub addresses: Option<Vec<String>>,
    #[serde(default)]
    pub address: Option<String>,
}

impl ScriptPubKeyPayload {
    pub fn all_addresses(&self) -> Vec<String> {
        match (&self.addresses, &self.address) {
            (Some(list), _) if !list.is_empty() => list.clone(),
            (_, Some(single)) => vec![single.clone()],
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

// Node error codes that mean "no such object" rather than a broken request
const RPC_INVALID_ADDRESS_OR_KEY: i64 = -5;
const RPC_INVALID_PARAMETER: i64 = -8;
const RPC_IN_WARMUP: i64 = -28;

/// JSON-RPC client for a bitcoind-compatible node, authenticated with HTTP basic auth
#[derive(Clone)]
pub struct NodeClient {
    pub url: String,
    client: Client,
    username: String,
    password: String,
    request_id: Arc<AtomicU64>,
}

impl NodeClient {
    pub fn new(
        url: String,
        username: String,
        password: String,
        timeout: Duration,
    ) -> Result<Self, SourceError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SourceError::Transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
            client,
            username,
            password,
            request_id: Arc::new(AtomicU64::new(0)),
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, SourceError> {
        let id = self.request_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "1.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let resp = self
            .client
            .post(&self.url)
            .basic_auth(&self.username, Some(&self.password))
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(SourceError::Transport(format!(
                "{} rejected credentials: {}",
                self.url, status
            )));
        }

        let text = resp.text().await?;

        // The node answers RPC-level errors with non-200 statuses and a JSON
        // envelope, so only give up on the body when it is not an envelope.
        match decode_envelope::<T>(&text) {
            Err(SourceError::Malformed(_)) if !status.is_success() && !looks_like_envelope(&text) => {
                Err(SourceError::Transport(format!(
                    "{} returned status {} for {}",
                    self.url, status, method
                )))
            }
            other => other.map_err(|e| annotate(e, method)),
        }
    }
}

#[async_trait]
impl ChainSource for NodeClient {
    async fn block_by_hash(&self, hash: &str) -> Result<BlockPayload, SourceError> {
        self.call("getblock", json!([hash])).await
    }

    async fn transaction_by_id(&self, txid: &str) -> Result<TransactionPayload, SourceError> {
        self.call("getrawtransaction", json!([txid, true])).await
    }

    async fn block_hash_at_height(&self, height: i64) -> Result<String, SourceError> {
        self.call("getblockhash", json!([height])).await
    }

    async fn chain_tip(&self) -> Result<i64, SourceError> {
        self.call("getblockcount", json!([])).await
    }
}

fn looks_like_envelope(text: &str) -> bool {
    serde_json::from_str::<Envelope>(text).is_ok()
}

fn annotate(e: SourceError, method: &str) -> SourceError {
    match e {
        SourceError::NotFound(msg) => SourceError::NotFound(format!("{}: {}", method, msg)),
        SourceError::Transport(msg) => SourceError::Transport(format!("{}: {}", method, msg)),
        SourceError::Malformed(msg) => SourceError::Malformed(format!("{}: {}", method, msg)),
    }
}

/// Unwraps `{"result": ..., "error": ...}` into the typed result, classifying
/// the error field when it is set.
pub(crate) fn decode_envelope<T: DeserializeOwned>(text: &str) -> Result<T, SourceError> {
    let envelope: Envelope = serde_json::from_str(text).map_err(|e| {
        let preview: String = text.chars().take(200).collect();
        SourceError::Malformed(format!("{}. Response: {}", e, preview))
    })?;

    if let Some(err) = envelope.error {
        return Err(match err.code {
            RPC_INVALID_ADDRESS_OR_KEY | RPC_INVALID_PARAMETER => {
                SourceError::NotFound(format!("{} (code {})", err.message, err.code))
            }
            RPC_IN_WARMUP => SourceError::Transport(format!("node warming up: {}", err.message)),
            code => SourceError::Malformed(format!("{} (code {})", err.message, code)),
        });
    }

    let result = envelope
        .result
        .ok_or_else(|| SourceError::Malformed("envelope has neither result nor error".to_string()))?;

    Ok(serde_json::from_value(result)?)
}
