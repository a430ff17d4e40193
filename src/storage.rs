//! Payment ledger backends.
//!
//! [`PaymentLedger`] is the single shared piece of mutable state between
//! payment creation and the chain monitor. Three backends implement it with
//! identical semantics: [`MemoryLedger`], [`FileLedger`] (one `<id>.json`
//! document per payment) and [`EncryptedFileLedger`] (the same document
//! sealed with AES-256-GCM into `<id>.enc`).

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use thiserror::Error;
use tracing::{debug, warn};

use crate::crypto::{self, CryptoError, Sealer};
use crate::payment::Payment;

pub const DEFAULT_MIN_CONFIRMATIONS: u32 = 1;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid payment id {0:?}")]
    InvalidId(String),
    #[error("payment {0} already exists")]
    AlreadyExists(String),
    #[error("payment {0} not found")]
    NotFound(String),
    #[error("ledger io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode payment {id}")]
    Encode {
        id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to decode payment {id}")]
    Decode {
        id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to unseal payment {id}")]
    Crypto {
        id: String,
        #[source]
        source: CryptoError,
    },
    #[error("invalid ledger key")]
    InvalidKey(#[source] CryptoError),
    #[error("ledger lock poisoned")]
    LockPoisoned,
}

/// Persistence capability for payment records. Implementations synchronize
/// internally and may be shared freely between tasks.
pub trait PaymentLedger: Send + Sync {
    /// Stores a new record; fails if a record with the same id exists.
    fn create_payment(&self, payment: &Payment) -> Result<(), StorageError>;
    fn get_payment(&self, id: &str) -> Result<Option<Payment>, StorageError>;
    /// Replaces an existing record; fails with [`StorageError::NotFound`] otherwise.
    fn update_payment(&self, payment: &Payment) -> Result<(), StorageError>;
    /// Confirmation threshold behind [`Self::list_pending_payments`]. Always at
    /// least one; the monitor confirms against this same value.
    fn min_confirmations(&self) -> u32;
    /// Payments that are still pending under the ledger's confirmation threshold.
    fn list_pending_payments(&self) -> Result<Vec<Payment>, StorageError>;
    fn get_payment_by_address(&self, address: &str) -> Result<Option<Payment>, StorageError>;
}

/// Ids double as file names, so only `[A-Za-z0-9_-]` is accepted.
pub fn validate_id(id: &str) -> Result<(), StorageError> {
    let ok = !id.is_empty()
        && id.len() <= 128
        && id.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if ok {
        Ok(())
    } else {
        Err(StorageError::InvalidId(id.to_string()))
    }
}

fn sort_by_creation(payments: &mut [Payment]) {
    payments.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
}

pub struct MemoryLedger {
    payments: RwLock<HashMap<String, Payment>>,
    min_confirmations: u32,
}

impl MemoryLedger {
    /// A threshold below one is raised to one.
    pub fn new(min_confirmations: u32) -> Self {
        Self { payments: RwLock::new(HashMap::new()), min_confirmations: min_confirmations.max(1) }
    }

    pub fn len(&self) -> Result<usize, StorageError> {
        Ok(self.payments.read().map_err(|_| StorageError::LockPoisoned)?.len())
    }

    pub fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_CONFIRMATIONS)
    }
}

impl PaymentLedger for MemoryLedger {
    fn create_payment(&self, payment: &Payment) -> Result<(), StorageError> {
        validate_id(&payment.id)?;
        let mut payments = self.payments.write().map_err(|_| StorageError::LockPoisoned)?;
        if payments.contains_key(&payment.id) {
            return Err(StorageError::AlreadyExists(payment.id.clone()));
        }
        payments.insert(payment.id.clone(), payment.clone());
        Ok(())
    }

    fn get_payment(&self, id: &str) -> Result<Option<Payment>, StorageError> {
        validate_id(id)?;
        let payments = self.payments.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(payments.get(id).cloned())
    }

    fn update_payment(&self, payment: &Payment) -> Result<(), StorageError> {
        validate_id(&payment.id)?;
        let mut payments = self.payments.write().map_err(|_| StorageError::LockPoisoned)?;
        match payments.get_mut(&payment.id) {
            Some(existing) => {
                *existing = payment.clone();
                Ok(())
            }
            None => Err(StorageError::NotFound(payment.id.clone())),
        }
    }

    fn min_confirmations(&self) -> u32 {
        self.min_confirmations
    }

    fn list_pending_payments(&self) -> Result<Vec<Payment>, StorageError> {
        let payments = self.payments.read().map_err(|_| StorageError::LockPoisoned)?;
        let mut pending: Vec<Payment> = payments
            .values()
            .filter(|p| p.is_pending(self.min_confirmations))
            .cloned()
            .collect();
        sort_by_creation(&mut pending);
        Ok(pending)
    }

    fn get_payment_by_address(&self, address: &str) -> Result<Option<Payment>, StorageError> {
        let payments = self.payments.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(payments.values().find(|p| p.has_address(address)).cloned())
    }
}

/// On-disk representation of one record.
pub trait RecordCodec: Send + Sync {
    /// File extension, without the dot.
    const EXTENSION: &'static str;

    fn encode(&self, payment: &Payment) -> Result<Vec<u8>, StorageError>;
    fn decode(&self, id: &str, bytes: &[u8]) -> Result<Payment, StorageError>;
}

/// Pretty-printed JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl RecordCodec for JsonCodec {
    const EXTENSION: &'static str = "json";

    fn encode(&self, payment: &Payment) -> Result<Vec<u8>, StorageError> {
        serde_json::to_vec_pretty(payment)
            .map_err(|source| StorageError::Encode { id: payment.id.clone(), source })
    }

    fn decode(&self, id: &str, bytes: &[u8]) -> Result<Payment, StorageError> {
        serde_json::from_slice(bytes).map_err(|source| StorageError::Decode { id: id.to_string(), source })
    }
}

/// JSON sealed as `nonce || ciphertext`.
#[derive(Debug, Clone)]
pub struct SealedCodec {
    sealer: Sealer,
}

impl SealedCodec {
    pub fn new(key: &[u8]) -> Result<Self, StorageError> {
        Ok(Self { sealer: Sealer::new(key).map_err(StorageError::InvalidKey)? })
    }
}

impl RecordCodec for SealedCodec {
    const EXTENSION: &'static str = "enc";

    fn encode(&self, payment: &Payment) -> Result<Vec<u8>, StorageError> {
        let plain = JsonCodec.encode(payment)?;
        self.sealer
            .seal(&plain)
            .map_err(|source| StorageError::Crypto { id: payment.id.clone(), source })
    }

    fn decode(&self, id: &str, bytes: &[u8]) -> Result<Payment, StorageError> {
        let plain = self
            .sealer
            .open(bytes)
            .map_err(|source| StorageError::Crypto { id: id.to_string(), source })?;
        JsonCodec.decode(id, &plain)
    }
}

/// One file per payment under a single directory, guarded by a store-wide
/// read-write lock.
pub struct FileStore<C: RecordCodec> {
    dir: PathBuf,
    codec: C,
    min_confirmations: u32,
    lock: RwLock<()>,
}

pub type FileLedger = FileStore<JsonCodec>;
pub type EncryptedFileLedger = FileStore<SealedCodec>;

impl FileLedger {
    pub fn open(dir: impl AsRef<Path>, min_confirmations: u32) -> Result<Self, StorageError> {
        FileStore::with_codec(dir, JsonCodec, min_confirmations)
    }
}

impl EncryptedFileLedger {
    /// `key` must be exactly 32 bytes.
    pub fn open(dir: impl AsRef<Path>, key: &[u8], min_confirmations: u32) -> Result<Self, StorageError> {
        let codec = SealedCodec::new(key)?;
        FileStore::with_codec(dir, codec, min_confirmations)
    }
}

impl<C: RecordCodec> FileStore<C> {
    pub fn with_codec(dir: impl AsRef<Path>, codec: C, min_confirmations: u32) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        crypto::create_private_dir(&dir).map_err(|source| StorageError::Io { path: dir.clone(), source })?;
        Ok(Self { dir, codec, min_confirmations: min_confirmations.max(1), lock: RwLock::new(()) })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.{}", C::EXTENSION))
    }

    pub fn contains(&self, id: &str) -> Result<bool, StorageError> {
        validate_id(id)?;
        let _guard = self.lock.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(self.record_path(id).exists())
    }

    /// Ids of every record file in the directory, sorted.
    pub fn record_ids(&self) -> Result<Vec<String>, StorageError> {
        let _guard = self.lock.read().map_err(|_| StorageError::LockPoisoned)?;
        self.scan_ids()
    }

    fn scan_ids(&self) -> Result<Vec<String>, StorageError> {
        let io_err = |source| StorageError::Io { path: self.dir.clone(), source };
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(io_err)? {
            let path = entry.map_err(io_err)?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(C::EXTENSION) {
                continue;
            }
            if let Some(id) = path.file_stem().and_then(|s| s.to_str()) {
                if validate_id(id).is_ok() {
                    ids.push(id.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn read_record(&self, id: &str) -> Result<Option<Payment>, StorageError> {
        let path = self.record_path(id);
        match fs::read(&path) {
            Ok(bytes) => self.codec.decode(id, &bytes).map(Some),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StorageError::Io { path, source }),
        }
    }

    fn write_record(&self, payment: &Payment) -> Result<(), StorageError> {
        let bytes = self.codec.encode(payment)?;
        let path = self.record_path(&payment.id);
        crypto::write_private(&path, &bytes).map_err(|source| StorageError::Io { path, source })
    }

    /// Every readable record. Unreadable ones are logged and skipped so one
    /// corrupt file cannot hide the rest of the ledger.
    fn scan_records(&self) -> Result<Vec<Payment>, StorageError> {
        let mut records = Vec::new();
        for id in self.scan_ids()? {
            match self.read_record(&id) {
                Ok(Some(payment)) => records.push(payment),
                Ok(None) => {}
                Err(err) => warn!(payment_id = %id, error = %err, "skipping unreadable payment record"),
            }
        }
        Ok(records)
    }
}

impl<C: RecordCodec> PaymentLedger for FileStore<C> {
    fn create_payment(&self, payment: &Payment) -> Result<(), StorageError> {
        validate_id(&payment.id)?;
        let _guard = self.lock.write().map_err(|_| StorageError::LockPoisoned)?;
        if self.record_path(&payment.id).exists() {
            return Err(StorageError::AlreadyExists(payment.id.clone()));
        }
        self.write_record(payment)?;
        debug!(payment_id = %payment.id, "payment record created");
        Ok(())
    }

    fn get_payment(&self, id: &str) -> Result<Option<Payment>, StorageError> {
        validate_id(id)?;
        let _guard = self.lock.read().map_err(|_| StorageError::LockPoisoned)?;
        self.read_record(id)
    }

    fn update_payment(&self, payment: &Payment) -> Result<(), StorageError> {
        validate_id(&payment.id)?;
        let _guard = self.lock.write().map_err(|_| StorageError::LockPoisoned)?;
        if !self.record_path(&payment.id).exists() {
            return Err(StorageError::NotFound(payment.id.clone()));
        }
        self.write_record(payment)
    }

    fn min_confirmations(&self) -> u32 {
        self.min_confirmations
    }

    fn list_pending_payments(&self) -> Result<Vec<Payment>, StorageError> {
        let _guard = self.lock.read().map_err(|_| StorageError::LockPoisoned)?;
        let mut pending: Vec<Payment> = self
            .scan_records()?
            .into_iter()
            .filter(|p| p.is_pending(self.min_confirmations))
            .collect();
        sort_by_creation(&mut pending);
        Ok(pending)
    }

    fn get_payment_by_address(&self, address: &str) -> Result<Option<Payment>, StorageError> {
        let _guard = self.lock.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(self.scan_records()?.into_iter().find(|p| p.has_address(address)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_must_be_file_name_safe() {
        assert!(validate_id("0123abcdef").is_ok());
        assert!(validate_id("with-dash_and_underscore").is_ok());
        for bad in ["", "../etc/passwd", "a/b", "a.b", "space id"] {
            assert!(matches!(validate_id(bad), Err(StorageError::InvalidId(_))), "{bad}");
        }
    }

    #[test]
    fn sealed_codec_rejects_bad_key_length() {
        assert!(matches!(SealedCodec::new(&[0u8; 31]), Err(StorageError::InvalidKey(_))));
        assert!(matches!(SealedCodec::new(&[0u8; 33]), Err(StorageError::InvalidKey(_))));
        assert!(SealedCodec::new(&[0u8; 32]).is_ok());
    }
}
