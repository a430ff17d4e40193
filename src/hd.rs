//! Hierarchical deterministic key derivation for per-payment receiving
//! addresses.
//!
//! Every wallet walks the fixed BIP44 path `m/44'/0'/0'/0/i`; each call to
//! [`HdWallet::derive_next_address`] consumes exactly one index `i` under the
//! wallet's lock, optionally persisting the advanced counter through a
//! [`KeyStore`] before the address leaves the critical section.

use std::fmt;
use std::sync::Mutex;

use bitcoin_hashes::{sha512, Hash, HashEngine, Hmac, HmacEngine};
use rand::rngs::OsRng;
use rand::RngCore;
use secp256k1::{All, PublicKey, Scalar, Secp256k1, SecretKey};
use thiserror::Error;
use tracing::{debug, info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::address::{self, Network};
use crate::crypto::{self, KEY_LEN};
use crate::keystore::{KeyStore, KeyStoreError};

pub const HARDENED_INDEX_BOUNDARY: u32 = 1 << 31;

/// purpose / coin type / account (all hardened), then the external chain.
const ACCOUNT_PATH: [u32; 4] = [
    44 | HARDENED_INDEX_BOUNDARY,
    HARDENED_INDEX_BOUNDARY,
    HARDENED_INDEX_BOUNDARY,
    0,
];

const MASTER_KEY_DOMAIN: &[u8] = b"Bitcoin seed";

pub const MIN_SEED_LEN: usize = 16;
pub const MAX_SEED_LEN: usize = 64;
/// Seed length used when a fresh wallet is generated.
pub const GENERATED_SEED_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum HdError {
    #[error("seed must be between 16 and 64 bytes, got {0}")]
    InvalidSeedLength(usize),
    #[error("invalid child key at path segment {segment:#x}")]
    InvalidChildKey { segment: u32 },
    #[error("seed produced an invalid master key")]
    InvalidMasterKey,
    #[error("address index space exhausted")]
    IndexExhausted,
    #[error("wallet lock poisoned")]
    LockPoisoned,
    #[error("failed to persist wallet state for index {index}")]
    Persist {
        index: u32,
        #[source]
        source: KeyStoreError,
    },
    #[error(transparent)]
    KeyStore(#[from] KeyStoreError),
}

/// Secret state of one HD wallet: master key, chain code and the next unused
/// address index.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct WalletKeyMaterial {
    master_key: [u8; 32],
    chain_code: [u8; 32],
    next_index: u32,
    #[zeroize(skip)]
    network: Network,
}

impl fmt::Debug for WalletKeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalletKeyMaterial")
            .field("next_index", &self.next_index)
            .field("network", &self.network)
            .finish_non_exhaustive()
    }
}

impl WalletKeyMaterial {
    /// Runs the BIP32 master key generation over `seed`.
    pub fn from_seed(seed: &[u8], network: Network) -> Result<Self, HdError> {
        if !(MIN_SEED_LEN..=MAX_SEED_LEN).contains(&seed.len()) {
            return Err(HdError::InvalidSeedLength(seed.len()));
        }

        let mut engine: HmacEngine<sha512::Hash> = HmacEngine::new(MASTER_KEY_DOMAIN);
        engine.input(seed);
        let hmac: Hmac<sha512::Hash> = Hmac::from_engine(engine);

        let mut master_key = [0u8; 32];
        master_key.copy_from_slice(&hmac[..32]);
        SecretKey::from_slice(&master_key).map_err(|_| HdError::InvalidMasterKey)?;

        let mut chain_code = [0u8; 32];
        chain_code.copy_from_slice(&hmac[32..]);

        Ok(Self { master_key, chain_code, next_index: 0, network })
    }

    pub fn from_parts(
        master_key: [u8; 32],
        chain_code: [u8; 32],
        next_index: u32,
        network: Network,
    ) -> Self {
        Self { master_key, chain_code, next_index, network }
    }

    pub fn master_key(&self) -> &[u8; 32] {
        &self.master_key
    }

    pub fn chain_code(&self) -> &[u8; 32] {
        &self.chain_code
    }

    pub fn next_index(&self) -> u32 {
        self.next_index
    }

    pub fn network(&self) -> Network {
        self.network
    }
}

/// An address handed out by [`HdWallet`] together with the index it consumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HdAddress {
    pub index: u32,
    pub address: String,
}

struct Persistence {
    store: KeyStore,
    key: Zeroizing<[u8; KEY_LEN]>,
}

pub struct HdWallet {
    secp: Secp256k1<All>,
    state: Mutex<WalletKeyMaterial>,
    persistence: Option<Persistence>,
}

impl fmt::Debug for HdWallet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HdWallet")
            .field("persistent", &self.persistence.is_some())
            .finish_non_exhaustive()
    }
}

impl HdWallet {
    pub fn from_seed(seed: &[u8], network: Network) -> Result<Self, HdError> {
        Ok(Self::from_material(WalletKeyMaterial::from_seed(seed, network)?))
    }

    pub fn from_material(material: WalletKeyMaterial) -> Self {
        Self { secp: Secp256k1::new(), state: Mutex::new(material), persistence: None }
    }

    /// Binds the wallet to `store`: every derivation saves the advanced index
    /// before returning. The current state is not written here.
    pub fn with_keystore(mut self, store: KeyStore, key: &[u8]) -> Result<Self, HdError> {
        if key.len() != KEY_LEN {
            return Err(KeyStoreError::from(crypto::CryptoError::InvalidKeyLength(key.len())).into());
        }
        let mut owned = Zeroizing::new([0u8; KEY_LEN]);
        owned.copy_from_slice(key);
        self.persistence = Some(Persistence { store, key: owned });
        Ok(self)
    }

    /// Loads the wallet file behind `store`, or creates a wallet from a fresh
    /// random seed and saves it. The returned wallet persists on every derive.
    pub fn open_or_create(store: KeyStore, key: &[u8]) -> Result<Self, HdError> {
        let material = if store.exists() {
            let material = store.load(key)?;
            info!(
                path = %store.path().display(),
                next_index = material.next_index(),
                "loaded HD wallet"
            );
            material
        } else {
            let mut seed = Zeroizing::new([0u8; GENERATED_SEED_LEN]);
            OsRng.fill_bytes(&mut seed[..]);
            let material = WalletKeyMaterial::from_seed(&seed[..], store.network())?;
            store.save(&material, key)?;
            info!(path = %store.path().display(), network = %store.network(), "created new HD wallet");
            material
        };
        Self::from_material(material).with_keystore(store, key)
    }

    pub fn network(&self) -> Result<Network, HdError> {
        Ok(self.state.lock().map_err(|_| HdError::LockPoisoned)?.network)
    }

    pub fn next_index(&self) -> Result<u32, HdError> {
        Ok(self.state.lock().map_err(|_| HdError::LockPoisoned)?.next_index)
    }

    /// Derives the address at the current index and advances the counter.
    ///
    /// The lock is held across key derivation, persistence and the counter
    /// update, so concurrent callers always receive distinct indices. An
    /// index whose child key is invalid is skipped with a warning.
    pub fn derive_next_address(&self) -> Result<HdAddress, HdError> {
        let mut state = self.state.lock().map_err(|_| HdError::LockPoisoned)?;
        let (account_key, account_chain) = self.account_node(&state)?;

        let mut index = state.next_index;
        let address = loop {
            if index >= HARDENED_INDEX_BOUNDARY {
                return Err(HdError::IndexExhausted);
            }
            match self.leaf_address(&account_key, &account_chain, index, state.network) {
                Ok(address) => break address,
                Err(HdError::InvalidChildKey { .. }) => {
                    warn!(index, "invalid child key, skipping address index");
                    index += 1;
                }
                Err(err) => return Err(err),
            }
        };
        let next_index = index + 1;

        if let Some(persistence) = &self.persistence {
            let mut updated = state.clone();
            updated.next_index = next_index;
            persistence
                .store
                .save(&updated, &persistence.key[..])
                .map_err(|source| HdError::Persist { index, source })?;
        }
        state.next_index = next_index;

        debug!(index, network = %state.network, "derived receiving address");
        Ok(HdAddress { index, address })
    }

    /// Re-derives the address for an already issued `index` without touching
    /// the counter.
    pub fn address_at(&self, index: u32) -> Result<String, HdError> {
        if index >= HARDENED_INDEX_BOUNDARY {
            return Err(HdError::IndexExhausted);
        }
        let state = self.state.lock().map_err(|_| HdError::LockPoisoned)?;
        let (account_key, account_chain) = self.account_node(&state)?;
        self.leaf_address(&account_key, &account_chain, index, state.network)
    }

    fn account_node(&self, state: &WalletKeyMaterial) -> Result<(SecretKey, Zeroizing<[u8; 32]>), HdError> {
        let mut key = SecretKey::from_slice(&state.master_key).map_err(|_| HdError::InvalidMasterKey)?;
        let mut chain = Zeroizing::new(state.chain_code);
        for segment in ACCOUNT_PATH {
            let (child, child_chain) = derive_child(&self.secp, &key, &chain, segment)?;
            key = child;
            *chain = child_chain;
        }
        Ok((key, chain))
    }

    fn leaf_address(
        &self,
        account_key: &SecretKey,
        account_chain: &[u8; 32],
        index: u32,
        network: Network,
    ) -> Result<String, HdError> {
        let (leaf, _) = derive_child(&self.secp, account_key, account_chain, index)?;
        let public = PublicKey::from_secret_key(&self.secp, &leaf);
        Ok(address::p2pkh_address(&public.serialize(), network))
    }
}

/// One private-to-private child derivation step.
pub(crate) fn derive_child(
    secp: &Secp256k1<All>,
    parent: &SecretKey,
    chain_code: &[u8; 32],
    segment: u32,
) -> Result<(SecretKey, [u8; 32]), HdError> {
    let mut engine: HmacEngine<sha512::Hash> = HmacEngine::new(chain_code);
    if segment >= HARDENED_INDEX_BOUNDARY {
        engine.input(&[0u8]);
        engine.input(&parent.secret_bytes());
    } else {
        engine.input(&PublicKey::from_secret_key(secp, parent).serialize());
    }
    engine.input(&segment.to_be_bytes());
    let hmac: Hmac<sha512::Hash> = Hmac::from_engine(engine);

    let mut tweak = [0u8; 32];
    tweak.copy_from_slice(&hmac[..32]);
    let tweak = Scalar::from_be_bytes(tweak).map_err(|_| HdError::InvalidChildKey { segment })?;
    let child = parent
        .add_tweak(&tweak)
        .map_err(|_| HdError::InvalidChildKey { segment })?;

    let mut chain = [0u8; 32];
    chain.copy_from_slice(&hmac[32..]);
    Ok((child, chain))
}
