// Payment ledger tests: every backend must honour the same contract.

mod common;

use std::fs;
use std::sync::Arc;
use std::thread;

use chrono::Duration;
use tempfile::TempDir;

use common::pending_payment;
use cryptopaywall::migration;
use cryptopaywall::storage::{
    EncryptedFileLedger, FileLedger, MemoryLedger, PaymentLedger, StorageError,
};
use cryptopaywall::{Payment, PaymentStatus};

const ADDR_A: &str = "1BgGZ9tcN4rm9KBzDn7KprQz87SZ26SAMH";
const ADDR_B: &str = "1111111111111111111114oLvT2";

fn fresh(address: &str) -> Payment {
    pending_payment(address, 0.001, Duration::zero(), Duration::hours(2))
}

/// Runs the shared ledger contract; the ledger must use min_confirmations = 2.
fn exercise_contract(ledger: &dyn PaymentLedger) {
    let mut a = fresh(ADDR_A);
    let b = fresh(ADDR_B);

    ledger.create_payment(&a).expect("create a");
    ledger.create_payment(&b).expect("create b");
    assert!(matches!(ledger.create_payment(&a), Err(StorageError::AlreadyExists(_))));

    assert_eq!(ledger.get_payment(&a.id).unwrap(), Some(a.clone()));
    assert_eq!(ledger.get_payment("0000").unwrap(), None);
    assert!(matches!(ledger.get_payment("../escape"), Err(StorageError::InvalidId(_))));

    assert_eq!(ledger.get_payment_by_address(ADDR_B).unwrap().map(|p| p.id), Some(b.id.clone()));
    assert_eq!(ledger.get_payment_by_address("1NoSuchAddress").unwrap(), None);

    let pending: Vec<String> = ledger.list_pending_payments().unwrap().into_iter().map(|p| p.id).collect();
    assert_eq!(pending.len(), 2);
    assert!(pending.contains(&a.id) && pending.contains(&b.id));

    // Partial confirmations below the threshold keep the payment pending.
    a.confirmations = 1;
    ledger.update_payment(&a).unwrap();
    assert!(ledger.list_pending_payments().unwrap().iter().any(|p| p.id == a.id));

    a.confirm(2).unwrap();
    ledger.update_payment(&a).unwrap();
    let pending = ledger.list_pending_payments().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, b.id);
    assert_eq!(ledger.get_payment(&a.id).unwrap().unwrap().status, PaymentStatus::Confirmed);

    let ghost = fresh(ADDR_A);
    assert!(matches!(ledger.update_payment(&ghost), Err(StorageError::NotFound(_))));
    assert_eq!(ledger.get_payment(&ghost.id).unwrap(), None, "failed update must not create");
}

#[test]
fn test_memory_ledger_contract() {
    println!("🧪 Testing memory ledger contract...");
    exercise_contract(&MemoryLedger::new(2));
    println!("✅ Memory ledger contract");
}

#[test]
fn test_file_ledger_contract() {
    println!("🧪 Testing file ledger contract...");
    let dir = TempDir::new().unwrap();
    let ledger = FileLedger::open(dir.path().join("payments"), 2).unwrap();
    exercise_contract(&ledger);
    println!("✅ File ledger contract");
}

#[test]
fn test_encrypted_file_ledger_contract() {
    println!("🧪 Testing encrypted file ledger contract...");
    let dir = TempDir::new().unwrap();
    let ledger = EncryptedFileLedger::open(dir.path(), &[0x5A; 32], 2).unwrap();
    exercise_contract(&ledger);
    println!("✅ Encrypted file ledger contract");
}

#[test]
fn test_file_records_are_json_named_by_id() {
    let dir = TempDir::new().unwrap();
    let ledger = FileLedger::open(dir.path(), 1).unwrap();
    let payment = fresh(ADDR_A);
    ledger.create_payment(&payment).unwrap();

    let path = dir.path().join(format!("{}.json", payment.id));
    let doc: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
    assert_eq!(doc["id"], payment.id.as_str());
    assert_eq!(doc["addresses"]["BTC"], ADDR_A);
    assert_eq!(doc["status"], "pending");
    assert_eq!(doc["confirmations"], 0);
    assert!(doc.get("created_at").is_some() && doc.get("expires_at").is_some());

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        assert_eq!(fs::metadata(&path).unwrap().permissions().mode() & 0o777, 0o600);
    }
}

#[test]
fn test_encrypted_records_hide_contents() {
    let dir = TempDir::new().unwrap();
    let key = [0x33u8; 32];
    let ledger = EncryptedFileLedger::open(dir.path(), &key, 1).unwrap();
    let payment = fresh(ADDR_A);
    ledger.create_payment(&payment).unwrap();

    let raw = fs::read(dir.path().join(format!("{}.enc", payment.id))).unwrap();
    let text = String::from_utf8_lossy(&raw);
    assert!(!text.contains(ADDR_A), "address must not appear in clear");
    assert!(!text.contains("pending"));

    // Same directory, wrong key: reads fail, listings skip the record.
    let wrong = EncryptedFileLedger::open(dir.path(), &[0x34u8; 32], 1).unwrap();
    assert!(matches!(wrong.get_payment(&payment.id), Err(StorageError::Crypto { .. })));
    assert!(wrong.list_pending_payments().unwrap().is_empty());

    let reopened = EncryptedFileLedger::open(dir.path(), &key, 1).unwrap();
    assert_eq!(reopened.get_payment(&payment.id).unwrap(), Some(payment));
}

#[test]
fn test_encrypted_ledger_rejects_bad_key_lengths() {
    let dir = TempDir::new().unwrap();
    for len in [0usize, 16, 31, 33, 64] {
        assert!(
            matches!(EncryptedFileLedger::open(dir.path(), &vec![1u8; len], 1), Err(StorageError::InvalidKey(_))),
            "key of {len} bytes accepted"
        );
    }
}

#[test]
fn test_corrupt_record_is_skipped_in_listing() {
    let dir = TempDir::new().unwrap();
    let ledger = FileLedger::open(dir.path(), 1).unwrap();
    let good = fresh(ADDR_A);
    ledger.create_payment(&good).unwrap();
    fs::write(dir.path().join("deadbeef.json"), b"{ not json").unwrap();
    fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

    let pending = ledger.list_pending_payments().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, good.id);
    assert!(matches!(ledger.get_payment("deadbeef"), Err(StorageError::Decode { .. })));
}

#[test]
fn test_concurrent_creates_and_updates() {
    println!("🧪 Testing concurrent ledger writes...");

    let dir = TempDir::new().unwrap();
    let ledger = Arc::new(FileLedger::open(dir.path(), 1).unwrap());

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let ledger = Arc::clone(&ledger);
            thread::spawn(move || {
                let mut payment = fresh(ADDR_A);
                ledger.create_payment(&payment).unwrap();
                payment.confirmations = 0;
                payment.transaction_id = Some("ab".repeat(32));
                ledger.update_payment(&payment).unwrap();
                payment.id
            })
        })
        .collect();
    let ids: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(ledger.record_ids().unwrap().len(), 16);
    for id in ids {
        let stored = ledger.get_payment(&id).unwrap().expect("stored");
        assert_eq!(stored.transaction_id().map(str::len), Some(64));
    }

    println!("✅ Concurrent writes kept every record intact");
}

#[test]
fn test_migration_encrypts_and_is_idempotent() {
    println!("🧪 Testing plaintext to encrypted migration...");

    let dir = TempDir::new().unwrap();
    let key = [0x77u8; 32];
    let plain = FileLedger::open(dir.path(), 1).unwrap();
    let payments: Vec<Payment> = (0..3).map(|_| fresh(ADDR_A)).collect();
    for p in &payments {
        plain.create_payment(p).unwrap();
    }
    fs::write(dir.path().join("broken.json"), b"[]").unwrap();

    let report = migration::encrypt_existing(dir.path(), &key).unwrap();
    assert_eq!((report.processed, report.skipped, report.failed), (3, 0, 1));

    let encrypted = EncryptedFileLedger::open(dir.path(), &key, 1).unwrap();
    for p in &payments {
        assert_eq!(encrypted.get_payment(&p.id).unwrap().as_ref(), Some(p));
        assert!(dir.path().join(format!("{}.json", p.id)).exists(), "original preserved");
    }

    let again = migration::encrypt_existing(dir.path(), &key).unwrap();
    assert_eq!((again.processed, again.skipped, again.failed), (0, 3, 1));

    assert!(migration::encrypt_existing(dir.path(), &key[..16]).is_err());

    println!("✅ Migration encrypted 3 records and skipped them on rerun");
}

#[test]
fn test_zero_threshold_is_raised_to_one() {
    let dir = TempDir::new().unwrap();
    let memory = MemoryLedger::new(0);
    let file = FileLedger::open(dir.path(), 0).unwrap();

    for ledger in [&memory as &dyn PaymentLedger, &file] {
        assert_eq!(ledger.min_confirmations(), 1);
        let payment = fresh(ADDR_A);
        ledger.create_payment(&payment).unwrap();
        let pending = ledger.list_pending_payments().unwrap();
        assert_eq!(pending.len(), 1, "a fresh payment is pending");
        assert_eq!(pending[0].id, payment.id);
    }
}

#[test]
fn test_memory_ledger_size_is_reported() {
    let ledger = MemoryLedger::default();
    assert!(ledger.is_empty().unwrap());
    ledger.create_payment(&fresh(ADDR_A)).unwrap();
    ledger.create_payment(&fresh(ADDR_B)).unwrap();
    assert_eq!(ledger.len().unwrap(), 2);
    assert!(!ledger.is_empty().unwrap());
}
