//! Payment orchestration: minting payment requests across every enabled
//! wallet, deciding access, and owning the chain monitor task.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::metrics;
use crate::monitor::{ChainMonitor, DEFAULT_POLL_INTERVAL};
use crate::payment::{Payment, PaymentStatus, TransitionError};
use crate::storage::{PaymentLedger, StorageError};
use crate::wallet::{Currency, WalletError, WalletRegistry};

pub const DEFAULT_PAYMENT_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);

#[derive(Debug, Error)]
pub enum PaywallError {
    #[error("no wallets enabled for payment")]
    NoWalletsEnabled,
    #[error("invalid paywall configuration: {0}")]
    Config(String),
    #[error("could not derive a {currency} address")]
    Derivation {
        currency: Currency,
        #[source]
        source: WalletError,
    },
    #[error("could not persist payment {id}")]
    Persistence {
        id: String,
        #[source]
        source: StorageError,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("payment {0} not found")]
    NotFound(String),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("transaction id must not be empty")]
    EmptyTransactionId,
}

#[derive(Debug, Clone)]
pub struct PaywallConfig {
    pub prices: BTreeMap<Currency, f64>,
    pub payment_timeout: Duration,
    pub min_confirmations: u32,
    pub poll_interval: Duration,
}

impl Default for PaywallConfig {
    fn default() -> Self {
        Self {
            prices: BTreeMap::new(),
            payment_timeout: DEFAULT_PAYMENT_TIMEOUT,
            min_confirmations: 1,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl PaywallConfig {
    pub fn with_price(mut self, currency: Currency, price: f64) -> Self {
        self.prices.insert(currency, price);
        self
    }

    /// Checks the configuration against the currencies that will actually be
    /// offered and raises `min_confirmations` to at least one.
    pub fn validate<I>(&mut self, currencies: I) -> Result<(), PaywallError>
    where
        I: IntoIterator<Item = Currency>,
    {
        if self.payment_timeout.is_zero() {
            return Err(PaywallError::Config("payment timeout must be positive".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(PaywallError::Config("poll interval must be positive".into()));
        }
        if self.min_confirmations < 1 {
            self.min_confirmations = 1;
        }
        for currency in currencies {
            let Some(&price) = self.prices.get(&currency) else {
                return Err(PaywallError::Config(format!("no price configured for {currency}")));
            };
            if !price.is_finite() || price < 0.0 {
                return Err(PaywallError::Config(format!("{currency} price {price} is not a valid amount")));
            }
            if price > 0.0 && price <= currency.dust_limit() {
                return Err(PaywallError::Config(format!(
                    "{currency} price {price} is at or below the dust limit {}",
                    currency.dust_limit()
                )));
            }
        }
        Ok(())
    }
}

/// Outcome of looking up a payment for an access decision.
#[derive(Debug, Clone, PartialEq)]
pub enum Access {
    Granted,
    AwaitingPayment(Payment),
    Expired,
    Unknown,
}

pub struct Paywall {
    config: PaywallConfig,
    registry: WalletRegistry,
    ledger: Arc<dyn PaymentLedger>,
    monitor: Arc<ChainMonitor>,
    shutdown_tx: broadcast::Sender<()>,
    monitor_task: Mutex<Option<JoinHandle<()>>>,
}

impl Paywall {
    /// Validates `config`, builds the monitor over `registry` and starts it.
    /// The ledger's confirmation threshold must equal
    /// `config.min_confirmations`. Must be called from within a tokio runtime.
    pub fn new(
        mut config: PaywallConfig,
        registry: WalletRegistry,
        ledger: Arc<dyn PaymentLedger>,
    ) -> Result<Self, PaywallError> {
        config.validate(registry.currencies())?;
        if ledger.min_confirmations() != config.min_confirmations {
            return Err(PaywallError::Config(format!(
                "ledger confirms at {} confirmations but the paywall is configured for {}",
                ledger.min_confirmations(),
                config.min_confirmations
            )));
        }

        let monitor = Arc::new(ChainMonitor::from_registry(Arc::clone(&ledger), &registry, config.poll_interval));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = Arc::clone(&monitor).spawn(shutdown_rx);

        info!(
            currencies = ?registry.currencies().collect::<Vec<_>>(),
            min_confirmations = config.min_confirmations,
            "paywall started"
        );
        Ok(Self {
            config,
            registry,
            ledger,
            monitor,
            shutdown_tx,
            monitor_task: Mutex::new(Some(handle)),
        })
    }

    pub fn config(&self) -> &PaywallConfig {
        &self.config
    }

    pub fn registry(&self) -> &WalletRegistry {
        &self.registry
    }

    pub fn ledger(&self) -> &Arc<dyn PaymentLedger> {
        &self.ledger
    }

    pub fn monitor(&self) -> &Arc<ChainMonitor> {
        &self.monitor
    }

    /// Mints a pending payment with one fresh address per enabled currency.
    ///
    /// Addresses are derived first and the record persisted last. Indices
    /// consumed before a failure are not handed out again.
    pub async fn create_payment(&self) -> Result<Payment, PaywallError> {
        if self.registry.is_empty() {
            return Err(PaywallError::NoWalletsEnabled);
        }

        let id = Payment::generate_id();
        let mut addresses = BTreeMap::new();
        let mut amounts = BTreeMap::new();
        let mut consumed = Vec::new();

        for (currency, wallet) in self.registry.iter() {
            let price = *self
                .config
                .prices
                .get(&currency)
                .ok_or_else(|| PaywallError::Config(format!("no price configured for {currency}")))?;
            let derived = match wallet.get_address().await {
                Ok(derived) => derived,
                Err(source) => {
                    if !consumed.is_empty() {
                        warn!(payment_id = %id, consumed = ?consumed, "address indices consumed by failed payment");
                    }
                    return Err(PaywallError::Derivation { currency, source });
                }
            };
            metrics::ADDRESSES_DERIVED.with_label_values(&[currency.code()]).inc();
            consumed.push((currency, derived.index));
            addresses.insert(currency, derived.address);
            amounts.insert(currency, price);
        }

        let timeout = chrono::Duration::from_std(self.config.payment_timeout)
            .map_err(|_| PaywallError::Config("payment timeout out of range".into()))?;
        let payment = Payment::new_pending(id, addresses, amounts, Utc::now(), timeout);

        if let Err(source) = self.ledger.create_payment(&payment) {
            warn!(payment_id = %payment.id, consumed = ?consumed, "address indices consumed by failed payment");
            error!(payment_id = %payment.id, error = %source, "failed to persist payment");
            return Err(PaywallError::Persistence { id: payment.id, source });
        }

        metrics::PAYMENTS_CREATED.inc();
        info!(payment_id = %payment.id, currencies = payment.addresses.len(), "payment created");
        Ok(payment)
    }

    pub fn get_payment(&self, id: &str) -> Result<Option<Payment>, PaywallError> {
        Ok(self.ledger.get_payment(id)?)
    }

    /// Access decision for a payment id. A payment found past its expiry is
    /// swept to `Expired` in the ledger.
    pub fn check_access(&self, id: &str) -> Result<Access, PaywallError> {
        let Some(mut payment) = self.ledger.get_payment(id)? else {
            return Ok(Access::Unknown);
        };

        if payment.is_expired_at(Utc::now()) {
            if payment.status != PaymentStatus::Expired {
                payment.expire()?;
                self.ledger.update_payment(&payment)?;
                metrics::PAYMENTS_EXPIRED.inc();
                info!(payment_id = %id, "payment expired on access");
            }
            return Ok(Access::Expired);
        }

        Ok(match payment.status {
            PaymentStatus::Confirmed => Access::Granted,
            PaymentStatus::Pending => Access::AwaitingPayment(payment),
            PaymentStatus::Expired => Access::Expired,
        })
    }

    /// Links an on-chain transaction to a pending payment so the monitor can
    /// count its confirmations.
    pub fn attach_transaction(&self, id: &str, txid: &str) -> Result<Payment, PaywallError> {
        let txid = txid.trim();
        if txid.is_empty() {
            return Err(PaywallError::EmptyTransactionId);
        }
        let mut payment = self
            .ledger
            .get_payment(id)?
            .ok_or_else(|| PaywallError::NotFound(id.to_string()))?;
        payment.attach_transaction(txid)?;
        self.ledger.update_payment(&payment)?;
        info!(payment_id = %id, %txid, "transaction attached");
        Ok(payment)
    }

    /// Stops the monitor and waits for its task. Safe to call twice.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        let handle = self.monitor_task.lock().ok().and_then(|mut task| task.take());
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                error!(error = %err, "chain monitor task failed");
            }
        }
    }
}

impl Drop for Paywall {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_rules() {
        let mut config = PaywallConfig { min_confirmations: 0, ..PaywallConfig::default() }
            .with_price(Currency::Bitcoin, 0.001);
        config.validate([Currency::Bitcoin]).unwrap();
        assert_eq!(config.min_confirmations, 1);

        let err = config.clone().validate([Currency::Monero]).unwrap_err();
        assert!(matches!(err, PaywallError::Config(_)));

        let mut dusty = PaywallConfig::default().with_price(Currency::Bitcoin, 0.000_01);
        assert!(dusty.validate([Currency::Bitcoin]).is_err());

        let mut free = PaywallConfig::default().with_price(Currency::Bitcoin, 0.0);
        assert!(free.validate([Currency::Bitcoin]).is_ok());

        let mut no_timeout = PaywallConfig { payment_timeout: Duration::ZERO, ..PaywallConfig::default() };
        assert!(no_timeout.validate(std::iter::empty()).is_err());
    }
}
