// Shared fixtures for the integration tests: scripted chain clients,
// in-memory wallets and a ledger that refuses writes.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};

use cryptopaywall::rpc::RpcError;
use cryptopaywall::storage::{MemoryLedger, PaymentLedger, StorageError};
use cryptopaywall::wallet::{ChainClient, Currency, CurrencyWallet, DerivedAddress, WalletError};
use cryptopaywall::{BitcoinWallet, HdWallet, Network, Payment};

/// Chain client whose answers are set by the test.
pub struct MockChain {
    currency: Currency,
    balances: Mutex<HashMap<String, f64>>,
    confirmations: Mutex<HashMap<String, u32>>,
    failing: AtomicBool,
    pub balance_calls: AtomicUsize,
    pub confirmation_calls: AtomicUsize,
}

impl MockChain {
    pub fn new(currency: Currency) -> Arc<Self> {
        Arc::new(Self {
            currency,
            balances: Mutex::new(HashMap::new()),
            confirmations: Mutex::new(HashMap::new()),
            failing: AtomicBool::new(false),
            balance_calls: AtomicUsize::new(0),
            confirmation_calls: AtomicUsize::new(0),
        })
    }

    pub fn set_balance(&self, address: &str, amount: f64) {
        self.balances.lock().unwrap().insert(address.to_string(), amount);
    }

    pub fn set_confirmations(&self, txid: &str, confirmations: u32) {
        self.confirmations.lock().unwrap().insert(txid.to_string(), confirmations);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn outage(&self) -> WalletError {
        WalletError::Client {
            currency: self.currency,
            source: RpcError::Rpc { code: -1, message: "mock outage".into() },
        }
    }
}

#[async_trait]
impl ChainClient for MockChain {
    async fn address_balance(&self, address: &str) -> Result<f64, WalletError> {
        self.balance_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(self.outage());
        }
        Ok(self.balances.lock().unwrap().get(address).copied().unwrap_or(0.0))
    }

    async fn transaction_confirmations(&self, txid: &str) -> Result<u32, WalletError> {
        self.confirmation_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(self.outage());
        }
        Ok(self.confirmations.lock().unwrap().get(txid).copied().unwrap_or(0))
    }
}

/// Wallet that hands out synthetic addresses from a counter, optionally
/// failing derivation.
pub struct MockWallet {
    currency: Currency,
    chain: Arc<MockChain>,
    next: AtomicU32,
    fail_derive: AtomicBool,
}

impl MockWallet {
    pub fn new(currency: Currency, chain: Arc<MockChain>) -> Arc<Self> {
        Arc::new(Self { currency, chain, next: AtomicU32::new(0), fail_derive: AtomicBool::new(false) })
    }

    pub fn set_fail_derive(&self, fail: bool) {
        self.fail_derive.store(fail, Ordering::SeqCst);
    }

    pub fn issued(&self) -> u32 {
        self.next.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChainClient for MockWallet {
    async fn address_balance(&self, address: &str) -> Result<f64, WalletError> {
        self.chain.address_balance(address).await
    }

    async fn transaction_confirmations(&self, txid: &str) -> Result<u32, WalletError> {
        self.chain.transaction_confirmations(txid).await
    }
}

#[async_trait]
impl CurrencyWallet for MockWallet {
    fn currency(&self) -> Currency {
        self.currency
    }

    async fn derive_next_address(&self) -> Result<DerivedAddress, WalletError> {
        if self.fail_derive.load(Ordering::SeqCst) {
            return Err(self.chain.outage());
        }
        let index = self.next.fetch_add(1, Ordering::SeqCst);
        Ok(DerivedAddress {
            index,
            address: format!("{}-subaddress-{index}", self.currency.code().to_lowercase()),
            currency: self.currency,
        })
    }
}

pub fn bitcoin_wallet(seed: &[u8], chain: Arc<MockChain>) -> Arc<BitcoinWallet> {
    let hd = HdWallet::from_seed(seed, Network::Main).expect("valid seed");
    Arc::new(BitcoinWallet::new(hd, chain))
}

/// Pending BTC payment created `age` ago with the given timeout.
pub fn pending_payment(address: &str, amount: f64, age: Duration, timeout: Duration) -> Payment {
    let mut addresses = BTreeMap::new();
    let mut amounts = BTreeMap::new();
    addresses.insert(Currency::Bitcoin, address.to_string());
    amounts.insert(Currency::Bitcoin, amount);
    Payment::new_pending(Payment::generate_id(), addresses, amounts, Utc::now() - age, timeout)
}

/// Ledger that accepts reads but fails every create.
pub struct RefusingLedger {
    pub inner: MemoryLedger,
    pub create_attempts: AtomicUsize,
}

impl RefusingLedger {
    pub fn new() -> Self {
        Self { inner: MemoryLedger::new(1), create_attempts: AtomicUsize::new(0) }
    }
}

impl PaymentLedger for RefusingLedger {
    fn create_payment(&self, _payment: &Payment) -> Result<(), StorageError> {
        self.create_attempts.fetch_add(1, Ordering::SeqCst);
        Err(StorageError::Io {
            path: "/refused".into(),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "disk is read-only"),
        })
    }

    fn get_payment(&self, id: &str) -> Result<Option<Payment>, StorageError> {
        self.inner.get_payment(id)
    }

    fn update_payment(&self, payment: &Payment) -> Result<(), StorageError> {
        self.inner.update_payment(payment)
    }

    fn min_confirmations(&self) -> u32 {
        self.inner.min_confirmations()
    }

    fn list_pending_payments(&self) -> Result<Vec<Payment>, StorageError> {
        self.inner.list_pending_payments()
    }

    fn get_payment_by_address(&self, address: &str) -> Result<Option<Payment>, StorageError> {
        self.inner.get_payment_by_address(address)
    }
}
