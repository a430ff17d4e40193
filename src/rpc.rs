//! JSON-RPC ledger clients: bitcoind for balances/confirmations and
//! monero-wallet-rpc for subaddress minting plus balances.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::wallet::{ChainClient, Currency, CurrencyWallet, DerivedAddress, WalletError};

/// Atomic units per XMR.
const PICONERO_PER_XMR: f64 = 1e12;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("rpc transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("malformed rpc response: {0}")]
    Decode(String),
}

#[derive(Clone)]
pub struct RpcEndpoint {
    pub url: String,
    pub user: String,
    pub password: String,
    pub timeout: Duration,
}

impl std::fmt::Debug for RpcEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcEndpoint")
            .field("url", &self.url)
            .field("user", &self.user)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct RpcFault {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    result: Option<T>,
    error: Option<RpcFault>,
}

fn decode_envelope<T: DeserializeOwned>(body: Value) -> Result<T, RpcError> {
    let envelope: Envelope<Value> =
        serde_json::from_value(body).map_err(|e| RpcError::Decode(e.to_string()))?;
    if let Some(fault) = envelope.error {
        return Err(RpcError::Rpc { code: fault.code, message: fault.message });
    }
    let result = envelope.result.unwrap_or(Value::Null);
    serde_json::from_value(result).map_err(|e| RpcError::Decode(e.to_string()))
}

/// Minimal JSON-RPC client with basic auth. The request timeout applies to
/// every call.
#[derive(Debug, Clone)]
pub struct JsonRpc {
    http: reqwest::Client,
    endpoint: RpcEndpoint,
    version: &'static str,
}

impl JsonRpc {
    pub fn new(endpoint: RpcEndpoint, version: &'static str) -> Result<Self, RpcError> {
        let http = reqwest::Client::builder().timeout(endpoint.timeout).build()?;
        Ok(Self { http, endpoint, version })
    }

    pub async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, RpcError> {
        let request = json!({
            "jsonrpc": self.version,
            "id": "paywall",
            "method": method,
            "params": params,
        });
        debug!(method, url = %self.endpoint.url, "rpc call");
        let body: Value = self
            .http
            .post(&self.endpoint.url)
            .basic_auth(&self.endpoint.user, Some(&self.endpoint.password))
            .json(&request)
            .send()
            .await?
            .json()
            .await?;
        decode_envelope(body)
    }
}

/// Bitcoin Core RPC client used as the chain view for [`crate::wallet::BitcoinWallet`].
#[derive(Debug, Clone)]
pub struct BitcoindClient {
    rpc: JsonRpc,
}

impl BitcoindClient {
    pub fn new(endpoint: RpcEndpoint) -> Result<Self, RpcError> {
        Ok(Self { rpc: JsonRpc::new(endpoint, "1.0")? })
    }

    fn client_err(source: RpcError) -> WalletError {
        WalletError::Client { currency: Currency::Bitcoin, source }
    }
}

#[derive(Debug, Deserialize)]
struct BitcoindTransaction {
    confirmations: i64,
}

#[async_trait]
impl ChainClient for BitcoindClient {
    async fn address_balance(&self, address: &str) -> Result<f64, WalletError> {
        // minconf 0: funds count as soon as they are seen in the mempool.
        self.rpc
            .call("getreceivedbyaddress", json!([address, 0]))
            .await
            .map_err(Self::client_err)
    }

    async fn transaction_confirmations(&self, txid: &str) -> Result<u32, WalletError> {
        let tx: BitcoindTransaction = self
            .rpc
            .call("gettransaction", json!([txid]))
            .await
            .map_err(Self::client_err)?;
        // Conflicted transactions report negative confirmations.
        Ok(u32::try_from(tx.confirmations.max(0)).unwrap_or(u32::MAX))
    }
}

/// monero-wallet-rpc backed wallet. Subaddresses are minted remotely in
/// account 0, so derivation is an RPC round trip serialized by a lock.
#[derive(Debug)]
pub struct MoneroWallet {
    rpc: JsonRpc,
    derive_lock: Mutex<u32>,
}

#[derive(Debug, Deserialize)]
struct CreatedAddress {
    address: String,
    address_index: u32,
}

#[derive(Debug, Deserialize)]
struct SubaddressIndex {
    minor: u32,
}

#[derive(Debug, Deserialize)]
struct AddressIndexResult {
    index: SubaddressIndex,
}

#[derive(Debug, Deserialize)]
struct SubaddressBalance {
    address_index: u32,
    balance: u64,
}

#[derive(Debug, Deserialize)]
struct BalanceResult {
    #[serde(default)]
    per_subaddress: Vec<SubaddressBalance>,
}

#[derive(Debug, Deserialize)]
struct TransferEntry {
    #[serde(default)]
    confirmations: u64,
}

#[derive(Debug, Deserialize)]
struct TransferResult {
    transfer: TransferEntry,
}

impl MoneroWallet {
    /// Connects and probes the wallet with `get_version`; an unreachable
    /// wallet is an error so callers can leave XMR disabled.
    pub async fn connect(endpoint: RpcEndpoint) -> Result<Self, RpcError> {
        let rpc = JsonRpc::new(endpoint, "2.0")?;
        let version: Value = rpc.call("get_version", Value::Null).await?;
        info!(version = %version, "connected to monero-wallet-rpc");
        Ok(Self { rpc, derive_lock: Mutex::new(0) })
    }

    fn client_err(source: RpcError) -> WalletError {
        WalletError::Client { currency: Currency::Monero, source }
    }
}

#[async_trait]
impl ChainClient for MoneroWallet {
    async fn address_balance(&self, address: &str) -> Result<f64, WalletError> {
        let located: AddressIndexResult = self
            .rpc
            .call("get_address_index", json!({ "address": address }))
            .await
            .map_err(Self::client_err)?;
        let minor = located.index.minor;
        let balances: BalanceResult = self
            .rpc
            .call("get_balance", json!({ "account_index": 0, "address_indices": [minor] }))
            .await
            .map_err(Self::client_err)?;
        let atomic = balances
            .per_subaddress
            .iter()
            .find(|entry| entry.address_index == minor)
            .map_or(0, |entry| entry.balance);
        Ok(atomic as f64 / PICONERO_PER_XMR)
    }

    async fn transaction_confirmations(&self, txid: &str) -> Result<u32, WalletError> {
        let result: TransferResult = self
            .rpc
            .call("get_transfer_by_txid", json!({ "txid": txid }))
            .await
            .map_err(Self::client_err)?;
        Ok(u32::try_from(result.transfer.confirmations).unwrap_or(u32::MAX))
    }
}

#[async_trait]
impl CurrencyWallet for MoneroWallet {
    fn currency(&self) -> Currency {
        Currency::Monero
    }

    async fn derive_next_address(&self) -> Result<DerivedAddress, WalletError> {
        let mut issued = self.derive_lock.lock().await;
        let created: CreatedAddress = self
            .rpc
            .call(
                "create_address",
                json!({ "account_index": 0, "label": format!("payment-{}", *issued) }),
            )
            .await
            .map_err(Self::client_err)?;
        *issued += 1;
        debug!(index = created.address_index, "created monero subaddress");
        Ok(DerivedAddress {
            index: created.address_index,
            address: created.address,
            currency: Currency::Monero,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_result_is_decoded() {
        let value: f64 = decode_envelope(json!({ "result": 0.25, "error": null, "id": "x" })).unwrap();
        assert_eq!(value, 0.25);
    }

    #[test]
    fn envelope_error_is_surfaced() {
        let err = decode_envelope::<f64>(json!({
            "result": null,
            "error": { "code": -5, "message": "Invalid or non-wallet transaction id" }
        }))
        .unwrap_err();
        assert!(matches!(err, RpcError::Rpc { code: -5, .. }));
    }

    #[test]
    fn mistyped_result_is_a_decode_error() {
        let err = decode_envelope::<BitcoindTransaction>(json!({ "result": "nope" })).unwrap_err();
        assert!(matches!(err, RpcError::Decode(_)));
    }
}
