//! Background confirmation monitor.
//!
//! Each cycle lists the pending payments once and checks every currency on
//! every payment independently. Client errors are logged and counted, never
//! propagated: the next cycle simply tries again.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast::Receiver, Mutex};
use tokio::task::{self, JoinHandle};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::metrics;
use crate::payment::{Payment, PaymentStatus, TransitionError};
use crate::storage::PaymentLedger;
use crate::wallet::{ChainClient, Currency, CurrencyWallet, WalletError, WalletRegistry};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Counters for one poll cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub examined: usize,
    pub confirmed: usize,
    pub expired: usize,
    /// Funded payments with no transaction id attached yet.
    pub awaiting_transaction: usize,
    pub errors: usize,
    pub listing_failed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CheckOutcome {
    Unfunded,
    AwaitingTransaction,
    AwaitingConfirmations(u32),
    Confirmed(u32),
}

struct ClientSlot {
    client: Arc<dyn ChainClient>,
    // One in-flight request per currency; other currencies are not blocked.
    gate: Mutex<()>,
}

/// Exposes a registered wallet as a plain chain client.
struct WalletClient(Arc<dyn CurrencyWallet>);

#[async_trait]
impl ChainClient for WalletClient {
    async fn address_balance(&self, address: &str) -> Result<f64, WalletError> {
        self.0.address_balance(address).await
    }

    async fn transaction_confirmations(&self, txid: &str) -> Result<u32, WalletError> {
        self.0.transaction_confirmations(txid).await
    }
}

pub struct ChainMonitor {
    ledger: Arc<dyn PaymentLedger>,
    clients: BTreeMap<Currency, ClientSlot>,
    min_confirmations: u32,
    interval: Duration,
}

impl ChainMonitor {
    /// The confirmation threshold is taken from `ledger`, so a payment leaves
    /// the pending listing exactly when the monitor confirms it.
    pub fn with_clients<I>(ledger: Arc<dyn PaymentLedger>, clients: I, interval: Duration) -> Self
    where
        I: IntoIterator<Item = (Currency, Arc<dyn ChainClient>)>,
    {
        let clients = clients
            .into_iter()
            .map(|(currency, client)| (currency, ClientSlot { client, gate: Mutex::new(()) }))
            .collect();
        let min_confirmations = ledger.min_confirmations().max(1);
        Self { ledger, clients, min_confirmations, interval }
    }

    pub fn from_registry(
        ledger: Arc<dyn PaymentLedger>,
        registry: &WalletRegistry,
        interval: Duration,
    ) -> Self {
        let clients = registry.iter().map(|(currency, wallet)| {
            let client: Arc<dyn ChainClient> = Arc::new(WalletClient(Arc::clone(wallet)));
            (currency, client)
        });
        Self::with_clients(ledger, clients, interval)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn min_confirmations(&self) -> u32 {
        self.min_confirmations
    }

    /// Runs one full cycle over the currently pending payments.
    pub async fn poll_once(&self) -> CycleReport {
        metrics::MONITOR_CYCLES.inc();
        let mut report = CycleReport::default();

        let pending = match self.ledger.list_pending_payments() {
            Ok(pending) => pending,
            Err(err) => {
                error!(error = %err, "failed to list pending payments");
                report.listing_failed = true;
                return report;
            }
        };

        let now = Utc::now();
        for payment in &pending {
            report.examined += 1;
            if payment.is_expired_at(now) {
                if self.transition(&payment.id, &mut report, |p| p.expire()) {
                    report.expired += 1;
                    metrics::PAYMENTS_EXPIRED.inc();
                    info!(payment_id = %payment.id, "payment expired");
                }
                continue;
            }
            self.check_payment(payment, &mut report).await;
        }

        debug!(
            examined = report.examined,
            confirmed = report.confirmed,
            expired = report.expired,
            awaiting_transaction = report.awaiting_transaction,
            errors = report.errors,
            "monitor cycle finished"
        );
        report
    }

    async fn check_payment(&self, payment: &Payment, report: &mut CycleReport) {
        for (&currency, address) in &payment.addresses {
            let Some(slot) = self.clients.get(&currency) else {
                debug!(payment_id = %payment.id, %currency, "no client for currency, skipping");
                continue;
            };
            let Some(&required) = payment.amounts.get(&currency) else {
                warn!(payment_id = %payment.id, %currency, "payment has an address but no amount");
                report.errors += 1;
                continue;
            };

            match self.check_currency(slot, payment, address, required).await {
                Ok(CheckOutcome::Unfunded) => {}
                Ok(CheckOutcome::AwaitingTransaction) => {
                    report.awaiting_transaction += 1;
                    warn!(
                        payment_id = %payment.id,
                        %currency,
                        "payment funded but no transaction id is attached"
                    );
                }
                Ok(CheckOutcome::AwaitingConfirmations(confirmations)) => {
                    if confirmations != payment.confirmations {
                        self.transition(&payment.id, report, |p| {
                            p.confirmations = confirmations;
                            Ok(())
                        });
                    }
                }
                Ok(CheckOutcome::Confirmed(confirmations)) => {
                    if self.transition(&payment.id, report, |p| p.confirm(confirmations)) {
                        report.confirmed += 1;
                        metrics::PAYMENTS_CONFIRMED.inc();
                        info!(payment_id = %payment.id, %currency, confirmations, "payment confirmed");
                    }
                    return;
                }
                Err(err) => {
                    report.errors += 1;
                    metrics::MONITOR_ERRORS.with_label_values(&[currency.code()]).inc();
                    warn!(payment_id = %payment.id, %currency, error = %err, "payment check failed");
                }
            }
        }
    }

    async fn check_currency(
        &self,
        slot: &ClientSlot,
        payment: &Payment,
        address: &str,
        required: f64,
    ) -> Result<CheckOutcome, WalletError> {
        let _gate = slot.gate.lock().await;

        let balance = slot.client.address_balance(address).await?;
        if balance < required {
            return Ok(CheckOutcome::Unfunded);
        }
        let Some(txid) = payment.transaction_id() else {
            return Ok(CheckOutcome::AwaitingTransaction);
        };
        let confirmations = slot.client.transaction_confirmations(txid).await?;
        if confirmations >= self.min_confirmations {
            Ok(CheckOutcome::Confirmed(confirmations))
        } else {
            Ok(CheckOutcome::AwaitingConfirmations(confirmations))
        }
    }

    /// Re-reads the payment, applies `change` if it is still pending and
    /// writes it back. Returns whether the update landed.
    fn transition<F>(&self, id: &str, report: &mut CycleReport, change: F) -> bool
    where
        F: FnOnce(&mut Payment) -> Result<(), TransitionError>,
    {
        let mut latest = match self.ledger.get_payment(id) {
            Ok(Some(payment)) if payment.status == PaymentStatus::Pending => payment,
            Ok(_) => return false,
            Err(err) => {
                report.errors += 1;
                warn!(payment_id = %id, error = %err, "failed to reload payment");
                return false;
            }
        };
        if let Err(err) = change(&mut latest) {
            warn!(payment_id = %id, error = %err, "rejected payment transition");
            return false;
        }
        match self.ledger.update_payment(&latest) {
            Ok(()) => true,
            Err(err) => {
                report.errors += 1;
                error!(payment_id = %id, error = %err, "failed to persist payment update");
                false
            }
        }
    }

    /// Runs the monitor on its own task until a shutdown signal arrives.
    /// A cycle that has started always completes before the signal is seen.
    pub fn spawn(self: Arc<Self>, mut shutdown_rx: Receiver<()>) -> JoinHandle<()> {
        task::spawn(async move {
            let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval = ?self.interval, currencies = self.clients.len(), "chain monitor started");

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.recv() => {
                        info!("chain monitor stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.poll_once().await;
                    }
                }
            }
        })
    }
}
