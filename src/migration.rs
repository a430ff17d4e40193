use std::path::Path;

use tracing::{info, warn};

use crate::storage::{EncryptedFileLedger, FileLedger, PaymentLedger, StorageError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Copies every plaintext `<id>.json` record under `dir` into an encrypted
/// `<id>.enc` sibling sealed with `key`. Originals are left in place and ids
/// that already have an encrypted copy are skipped.
pub fn encrypt_existing(dir: &Path, key: &[u8]) -> Result<MigrationReport, StorageError> {
    let encrypted = EncryptedFileLedger::open(dir, key, 1)?;
    let plain = FileLedger::open(dir, 1)?;
    let mut report = MigrationReport::default();

    for id in plain.record_ids()? {
        if encrypted.contains(&id)? {
            info!(payment_id = %id, "already encrypted, skipping");
            report.skipped += 1;
            continue;
        }

        let payment = match plain.get_payment(&id) {
            Ok(Some(payment)) => payment,
            Ok(None) => continue,
            Err(err) => {
                warn!(payment_id = %id, error = %err, "could not read plaintext payment");
                report.failed += 1;
                continue;
            }
        };

        match encrypted.create_payment(&payment) {
            Ok(()) => {
                report.processed += 1;
                info!(payment_id = %id, "encrypted payment");
            }
            Err(err) => {
                warn!(payment_id = %id, error = %err, "could not encrypt payment");
                report.failed += 1;
            }
        }
    }

    info!(
        processed = report.processed,
        skipped = report.skipped,
        failed = report.failed,
        "migration complete"
    );
    Ok(report)
}
