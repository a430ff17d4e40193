// Library interface for the crypto paywall core.
// The `paywalld` binary and the integration tests both build on it.

pub mod address;
pub mod config;
pub mod crypto;
pub mod hd;
pub mod keystore;
pub mod metrics;
pub mod migration;
pub mod monitor;
pub mod payment;
pub mod paywall;
pub mod rpc;
pub mod storage;
pub mod wallet;

pub use address::Network;
pub use hd::{HdWallet, WalletKeyMaterial};
pub use keystore::KeyStore;
pub use monitor::{ChainMonitor, CycleReport};
pub use payment::{Payment, PaymentStatus};
pub use paywall::{Access, Paywall, PaywallConfig, PaywallError};
pub use storage::{EncryptedFileLedger, FileLedger, MemoryLedger, PaymentLedger};
pub use wallet::{BitcoinWallet, ChainClient, Currency, CurrencyWallet, DerivedAddress, WalletRegistry};
