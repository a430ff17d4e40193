use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::address::Network;
use crate::paywall::PaywallConfig;
use crate::rpc::RpcEndpoint;
use crate::wallet::Currency;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub paywall: Paywall,
    #[serde(default)]
    pub storage: Storage,
    #[serde(default)]
    pub wallet: Wallet,
    pub bitcoin: Chain,
    pub monero: Option<Chain>,
    pub metrics: Option<Metrics>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Paywall {
    #[serde(default = "default_timeout_secs")]
    pub payment_timeout_secs: u64,
    #[serde(default = "default_min_confirmations")]
    pub min_confirmations: u32,
    #[serde(default)]
    pub testnet: bool,
    #[serde(default = "default_poll_secs")]
    pub poll_interval_secs: u64,
}

impl Default for Paywall {
    fn default() -> Self {
        Self {
            payment_timeout_secs: default_timeout_secs(),
            min_confirmations: default_min_confirmations(),
            testnet: false,
            poll_interval_secs: default_poll_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Memory,
    File,
    #[default]
    Encrypted,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Storage {
    #[serde(default)]
    pub backend: Backend,
    #[serde(default = "default_payments_path")]
    pub path: PathBuf,
    #[serde(default = "default_payments_key")]
    pub key_path: PathBuf,
}

impl Default for Storage {
    fn default() -> Self {
        Self { backend: Backend::default(), path: default_payments_path(), key_path: default_payments_key() }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Wallet {
    #[serde(default = "default_wallet_path")]
    pub path: PathBuf,
    #[serde(default = "default_wallet_key")]
    pub key_path: PathBuf,
}

impl Default for Wallet {
    fn default() -> Self {
        Self { path: default_wallet_path(), key_path: default_wallet_key() }
    }
}

/// Price and RPC endpoint for one currency.
#[derive(Debug, Deserialize, Clone)]
pub struct Chain {
    pub price: f64,
    pub rpc_url: String,
    #[serde(default)]
    pub rpc_user: Option<String>,
    #[serde(default)]
    pub rpc_password: Option<String>,
    #[serde(default = "default_rpc_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Metrics {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_timeout_secs() -> u64 { 2 * 60 * 60 }
fn default_min_confirmations() -> u32 { 1 }
fn default_poll_secs() -> u64 { 10 }
fn default_rpc_timeout_secs() -> u64 { 30 }
fn default_payments_path() -> PathBuf { "./paywallet/payments".into() }
fn default_payments_key() -> PathBuf { "./paywallet/payments.key".into() }
fn default_wallet_path() -> PathBuf { "./paywallet".into() }
fn default_wallet_key() -> PathBuf { "./paywallet/wallet.key".into() }
fn default_bind() -> String { "127.0.0.1:9100".into() }

impl Config {
    pub fn network(&self) -> Network {
        if self.paywall.testnet { Network::Test } else { Network::Main }
    }

    pub fn paywall_config(&self) -> PaywallConfig {
        let mut prices = BTreeMap::new();
        prices.insert(Currency::Bitcoin, self.bitcoin.price);
        if let Some(monero) = &self.monero {
            prices.insert(Currency::Monero, monero.price);
        }
        PaywallConfig {
            prices,
            payment_timeout: Duration::from_secs(self.paywall.payment_timeout_secs),
            min_confirmations: self.paywall.min_confirmations,
            poll_interval: Duration::from_secs(self.paywall.poll_interval_secs),
        }
    }

    pub fn bitcoin_endpoint(&self) -> RpcEndpoint {
        self.bitcoin.endpoint("BTC_RPC_USER", "BTC_RPC_PASS")
    }

    pub fn monero_endpoint(&self) -> Option<RpcEndpoint> {
        self.monero.as_ref().map(|m| m.endpoint("XMR_WALLET_USER", "XMR_WALLET_PASS"))
    }
}

impl Chain {
    /// Credentials from the file win; the environment fills in the gaps.
    fn endpoint(&self, user_var: &str, pass_var: &str) -> RpcEndpoint {
        RpcEndpoint {
            url: self.rpc_url.clone(),
            user: self.rpc_user.clone().or_else(|| env::var(user_var).ok()).unwrap_or_default(),
            password: self.rpc_password.clone().or_else(|| env::var(pass_var).ok()).unwrap_or_default(),
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

/// Read the TOML file at `p` and deserialize into `Config`.
///
/// # Errors
/// * Returns an anyhow::Error if the file cannot be read or parsed.
pub fn load<P: AsRef<Path>>(p: P) -> Result<Config> {
    let text = fs::read_to_string(&p)
        .with_context(|| format!("couldn't read config file {}", p.as_ref().display()))?;
    load_from_str(&text)
}

pub fn load_from_str(text: &str) -> Result<Config> {
    toml::from_str(text).context("invalid TOML in config file")
}
