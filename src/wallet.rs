use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::{self, JoinError};

use crate::address;
use crate::hd::{HdError, HdWallet};
use crate::rpc::RpcError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Currency {
    #[serde(rename = "BTC")]
    Bitcoin,
    #[serde(rename = "XMR")]
    Monero,
}

impl Currency {
    pub const ALL: [Currency; 2] = [Currency::Bitcoin, Currency::Monero];

    pub fn code(self) -> &'static str {
        match self {
            Currency::Bitcoin => "BTC",
            Currency::Monero => "XMR",
        }
    }

    /// Smallest price worth charging; anything at or below it is unspendable.
    pub fn dust_limit(self) -> f64 {
        match self {
            Currency::Bitcoin => 0.000_01,
            Currency::Monero => 0.000_1,
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Currency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "btc" | "bitcoin" => Ok(Currency::Bitcoin),
            "xmr" | "monero" => Ok(Currency::Monero),
            other => Err(format!("unknown currency '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedAddress {
    pub index: u32,
    pub address: String,
    pub currency: Currency,
}

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("{currency} address derivation failed")]
    Derivation {
        currency: Currency,
        #[source]
        source: HdError,
    },
    #[error("{currency} ledger client error")]
    Client {
        currency: Currency,
        #[source]
        source: RpcError,
    },
    #[error("{address} is not a valid {currency} address")]
    InvalidAddress { currency: Currency, address: String },
    #[error("{currency} derivation task did not complete")]
    Task {
        currency: Currency,
        #[source]
        source: JoinError,
    },
}

/// Read-only view of a chain: balances received by an address and
/// confirmation counts of transactions.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn address_balance(&self, address: &str) -> Result<f64, WalletError>;
    async fn transaction_confirmations(&self, txid: &str) -> Result<u32, WalletError>;
}

/// A per-currency wallet that can mint receiving addresses on top of its
/// chain view.
#[async_trait]
pub trait CurrencyWallet: ChainClient {
    fn currency(&self) -> Currency;

    async fn derive_next_address(&self) -> Result<DerivedAddress, WalletError>;

    /// Fresh address for a new payment; every call consumes an index.
    async fn get_address(&self) -> Result<DerivedAddress, WalletError> {
        self.derive_next_address().await
    }
}

/// Bitcoin wallet: local HD derivation plus a remote ledger client for
/// balances and confirmations.
pub struct BitcoinWallet {
    hd: Arc<HdWallet>,
    client: Arc<dyn ChainClient>,
}

impl BitcoinWallet {
    pub fn new(hd: HdWallet, client: Arc<dyn ChainClient>) -> Self {
        Self { hd: Arc::new(hd), client }
    }

    pub fn hd(&self) -> &HdWallet {
        &self.hd
    }
}

#[async_trait]
impl ChainClient for BitcoinWallet {
    async fn address_balance(&self, address: &str) -> Result<f64, WalletError> {
        if !address::is_valid(address) {
            return Err(WalletError::InvalidAddress {
                currency: Currency::Bitcoin,
                address: address.to_string(),
            });
        }
        self.client.address_balance(address).await
    }

    async fn transaction_confirmations(&self, txid: &str) -> Result<u32, WalletError> {
        self.client.transaction_confirmations(txid).await
    }
}

#[async_trait]
impl CurrencyWallet for BitcoinWallet {
    fn currency(&self) -> Currency {
        Currency::Bitcoin
    }

    /// Runs on the blocking pool: a persistent wallet fsyncs its file while
    /// holding the derivation lock.
    async fn derive_next_address(&self) -> Result<DerivedAddress, WalletError> {
        let hd = Arc::clone(&self.hd);
        let derived = task::spawn_blocking(move || hd.derive_next_address())
            .await
            .map_err(|source| WalletError::Task { currency: Currency::Bitcoin, source })?
            .map_err(|source| WalletError::Derivation { currency: Currency::Bitcoin, source })?;
        Ok(DerivedAddress { index: derived.index, address: derived.address, currency: Currency::Bitcoin })
    }
}

/// Currency-keyed set of enabled wallets. Currencies without a configured
/// backend are simply absent.
#[derive(Clone, Default)]
pub struct WalletRegistry {
    wallets: BTreeMap<Currency, Arc<dyn CurrencyWallet>>,
}

impl fmt::Debug for WalletRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.wallets.keys()).finish()
    }
}

impl WalletRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `wallet` under its own currency, returning any wallet it replaced.
    pub fn insert(&mut self, wallet: Arc<dyn CurrencyWallet>) -> Option<Arc<dyn CurrencyWallet>> {
        self.wallets.insert(wallet.currency(), wallet)
    }

    pub fn get(&self, currency: Currency) -> Option<&Arc<dyn CurrencyWallet>> {
        self.wallets.get(&currency)
    }

    pub fn contains(&self, currency: Currency) -> bool {
        self.wallets.contains_key(&currency)
    }

    pub fn currencies(&self) -> impl Iterator<Item = Currency> + '_ {
        self.wallets.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Currency, &Arc<dyn CurrencyWallet>)> {
        self.wallets.iter().map(|(currency, wallet)| (*currency, wallet))
    }

    pub fn len(&self) -> usize {
        self.wallets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wallets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn currency_codes_parse_and_serialize() {
        assert_eq!("btc".parse::<Currency>().unwrap(), Currency::Bitcoin);
        assert_eq!("Monero".parse::<Currency>().unwrap(), Currency::Monero);
        assert!("doge".parse::<Currency>().is_err());
        assert_eq!(serde_json::to_string(&Currency::Monero).unwrap(), "\"XMR\"");
        assert_eq!(Currency::Bitcoin.to_string(), "BTC");
    }
}
