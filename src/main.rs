use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cryptopaywall::config::{self, Backend, Config};
use cryptopaywall::rpc::{BitcoindClient, MoneroWallet};
use cryptopaywall::storage::{EncryptedFileLedger, FileLedger, MemoryLedger, PaymentLedger};
use cryptopaywall::wallet::{BitcoinWallet, WalletRegistry};
use cryptopaywall::{address, keystore, metrics, migration, HdWallet, KeyStore, Paywall};

const EMBEDDED_CONFIG: &str = include_str!("../config.toml");

#[derive(Parser)]
#[command(author, version, about = "paywalld: on-chain payment gate")]
struct Cli {
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    cmd: Option<Cmd>,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run the paywall and its chain monitor until Ctrl+C (default)
    Serve,
    /// Mint one payment request and print it as JSON
    CreatePayment,
    /// Check an address and report which network it belongs to
    ValidateAddress { address: String },
    /// Encrypt every plaintext payment record in the storage directory
    EncryptStore,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    if let Some(Cmd::ValidateAddress { address }) = &cli.cmd {
        match address::validate(address) {
            Some(network) => println!("{address}: valid {network} address"),
            None => anyhow::bail!("{address} is not a valid address"),
        }
        return Ok(());
    }

    let cfg = load_config(&cli.config)?;

    match cli.cmd.unwrap_or(Cmd::Serve) {
        Cmd::Serve => serve(&cfg).await,
        Cmd::CreatePayment => {
            let paywall = build_paywall(&cfg).await?;
            let payment = paywall.create_payment().await.context("payment creation failed")?;
            println!("{}", serde_json::to_string_pretty(&payment)?);
            paywall.shutdown().await;
            Ok(())
        }
        Cmd::EncryptStore => {
            let key = keystore::load_or_generate_key(&cfg.storage.key_path)?;
            let report = migration::encrypt_existing(&cfg.storage.path, &key[..])
                .with_context(|| format!("migrating {}", cfg.storage.path.display()))?;
            println!(
                "processed: {}, skipped: {}, failed: {}",
                report.processed, report.skipped, report.failed
            );
            Ok(())
        }
        Cmd::ValidateAddress { .. } => Ok(()),
    }
}

/// The CLI path first, then the copy compiled into the binary.
fn load_config(path: &str) -> Result<Config> {
    match config::load(path) {
        Ok(cfg) => Ok(cfg),
        Err(err) => {
            warn!(path, error = %err, "falling back to embedded default configuration");
            config::load_from_str(EMBEDDED_CONFIG)
        }
    }
}

fn build_ledger(cfg: &Config) -> Result<Arc<dyn PaymentLedger>> {
    let min_confirmations = cfg.paywall.min_confirmations.max(1);
    let ledger: Arc<dyn PaymentLedger> = match cfg.storage.backend {
        Backend::Memory => Arc::new(MemoryLedger::new(min_confirmations)),
        Backend::File => Arc::new(FileLedger::open(&cfg.storage.path, min_confirmations)?),
        Backend::Encrypted => {
            let key = keystore::load_or_generate_key(&cfg.storage.key_path)?;
            Arc::new(EncryptedFileLedger::open(&cfg.storage.path, &key[..], min_confirmations)?)
        }
    };
    info!(backend = ?cfg.storage.backend, path = %cfg.storage.path.display(), "payment ledger ready");
    Ok(ledger)
}

async fn build_registry(cfg: &Config) -> Result<WalletRegistry> {
    let mut registry = WalletRegistry::new();

    let key = keystore::load_or_generate_key(&cfg.wallet.key_path)?;
    let store = KeyStore::new(&cfg.wallet.path, cfg.network());
    let hd = HdWallet::open_or_create(store, &key[..]).context("opening bitcoin wallet")?;
    let client = BitcoindClient::new(cfg.bitcoin_endpoint())?;
    registry.insert(Arc::new(BitcoinWallet::new(hd, Arc::new(client))));

    if let Some(endpoint) = cfg.monero_endpoint() {
        match MoneroWallet::connect(endpoint).await {
            Ok(wallet) => {
                registry.insert(Arc::new(wallet));
            }
            Err(err) => warn!(error = %err, "monero wallet unreachable, XMR payments disabled"),
        }
    }
    Ok(registry)
}

async fn build_paywall(cfg: &Config) -> Result<Paywall> {
    let ledger = build_ledger(cfg)?;
    let registry = build_registry(cfg).await?;
    Ok(Paywall::new(cfg.paywall_config(), registry, ledger)?)
}

async fn serve(cfg: &Config) -> Result<()> {
    if let Some(m) = &cfg.metrics {
        metrics::serve(&m.bind)?;
    }
    let paywall = build_paywall(cfg).await?;
    info!(network = %cfg.network(), "paywalld running, press Ctrl+C to stop");

    signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("shutdown signal received");
    paywall.shutdown().await;
    info!("paywalld stopped");
    Ok(())
}
