use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::wallet::Currency;

/// Bytes of randomness behind a payment id (rendered as 32 hex chars).
pub const PAYMENT_ID_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Confirmed,
    Expired,
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Confirmed => "confirmed",
            PaymentStatus::Expired => "expired",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("payment cannot move from {from} to {to}")]
pub struct TransitionError {
    pub from: PaymentStatus,
    pub to: PaymentStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: String,
    pub addresses: BTreeMap<Currency, String>,
    pub amounts: BTreeMap<Currency, f64>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: PaymentStatus,
    pub confirmations: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
}

impl Payment {
    /// New pending payment expiring `timeout` after `now`.
    pub fn new_pending(
        id: String,
        addresses: BTreeMap<Currency, String>,
        amounts: BTreeMap<Currency, f64>,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> Self {
        Self {
            id,
            addresses,
            amounts,
            created_at: now,
            expires_at: now + timeout,
            status: PaymentStatus::Pending,
            confirmations: 0,
            transaction_id: None,
        }
    }

    pub fn generate_id() -> String {
        let mut bytes = [0u8; PAYMENT_ID_LEN];
        OsRng.fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    /// Still waiting on the chain: pending with fewer than `min_confirmations`.
    pub fn is_pending(&self, min_confirmations: u32) -> bool {
        self.status == PaymentStatus::Pending && self.confirmations < min_confirmations
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn has_address(&self, address: &str) -> bool {
        self.addresses.values().any(|a| a == address)
    }

    /// Attached transaction id, ignoring an empty string.
    pub fn transaction_id(&self) -> Option<&str> {
        self.transaction_id.as_deref().filter(|txid| !txid.is_empty())
    }

    pub fn confirm(&mut self, confirmations: u32) -> Result<(), TransitionError> {
        if self.status != PaymentStatus::Pending {
            return Err(TransitionError { from: self.status, to: PaymentStatus::Confirmed });
        }
        self.status = PaymentStatus::Confirmed;
        self.confirmations = confirmations;
        Ok(())
    }

    pub fn expire(&mut self) -> Result<(), TransitionError> {
        match self.status {
            PaymentStatus::Pending | PaymentStatus::Confirmed => {
                self.status = PaymentStatus::Expired;
                Ok(())
            }
            PaymentStatus::Expired => Ok(()),
        }
    }

    pub fn attach_transaction(&mut self, txid: impl Into<String>) -> Result<(), TransitionError> {
        if self.status != PaymentStatus::Pending {
            return Err(TransitionError { from: self.status, to: PaymentStatus::Pending });
        }
        self.transaction_id = Some(txid.into());
        Ok(())
    }
}
