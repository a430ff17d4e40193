//! Encrypted wallet file: `nonce || AES-256-GCM(master_key || chain_code || next_index_be)`.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use zeroize::Zeroizing;

use crate::address::Network;
use crate::crypto::{self, CryptoError, Sealer};
use crate::hd::WalletKeyMaterial;

pub use crate::crypto::{generate_key, load_or_generate_key};

pub const WALLET_FILE: &str = "wallet.dat";
/// master key (32) + chain code (32) + next index (4)
pub const PLAINTEXT_LEN: usize = 68;

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("wallet file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("wallet plaintext is {0} bytes, expected {PLAINTEXT_LEN}")]
    InvalidPlaintext(usize),
}

/// Location of one wallet secret file plus the network its addresses use.
#[derive(Debug, Clone)]
pub struct KeyStore {
    path: PathBuf,
    network: Network,
}

impl KeyStore {
    /// Store whose wallet file lives at `<dir>/wallet.dat`.
    pub fn new(dir: impl AsRef<Path>, network: Network) -> Self {
        Self { path: dir.as_ref().join(WALLET_FILE), network }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn save(&self, material: &WalletKeyMaterial, key: &[u8]) -> Result<(), KeyStoreError> {
        let sealer = Sealer::new(key)?;

        let mut plaintext = Zeroizing::new(Vec::with_capacity(PLAINTEXT_LEN));
        plaintext.extend_from_slice(material.master_key());
        plaintext.extend_from_slice(material.chain_code());
        plaintext.extend_from_slice(&material.next_index().to_be_bytes());

        let sealed = sealer.seal(&plaintext)?;
        crypto::write_private(&self.path, &sealed).map_err(|source| KeyStoreError::Io {
            path: self.path.clone(),
            source,
        })
    }

    pub fn load(&self, key: &[u8]) -> Result<WalletKeyMaterial, KeyStoreError> {
        let sealer = Sealer::new(key)?;
        let sealed = fs::read(&self.path).map_err(|source| KeyStoreError::Io {
            path: self.path.clone(),
            source,
        })?;
        let plaintext = sealer.open(&sealed)?;
        if plaintext.len() != PLAINTEXT_LEN {
            return Err(KeyStoreError::InvalidPlaintext(plaintext.len()));
        }

        let mut master_key = [0u8; 32];
        let mut chain_code = [0u8; 32];
        let mut index = [0u8; 4];
        master_key.copy_from_slice(&plaintext[..32]);
        chain_code.copy_from_slice(&plaintext[32..64]);
        index.copy_from_slice(&plaintext[64..]);

        let material = WalletKeyMaterial::from_parts(
            master_key,
            chain_code,
            u32::from_be_bytes(index),
            self.network,
        );
        zeroize::Zeroize::zeroize(&mut master_key);
        zeroize::Zeroize::zeroize(&mut chain_code);
        Ok(material)
    }
}
