//! Base58Check address codec and network detection for receiving addresses.

use std::fmt;

use bitcoin_hashes::{hash160, sha256d, Hash};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of double-SHA256 bytes appended to every encoded payload.
pub const CHECKSUM_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Main,
    Test,
}

impl Network {
    /// Version byte prefixed to a pay-to-pubkey-hash payload.
    pub fn p2pkh_version(self) -> u8 {
        match self {
            Network::Main => 0x00,
            Network::Test => 0x6f,
        }
    }

    pub fn is_testnet(self) -> bool {
        matches!(self, Network::Test)
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Main => f.write_str("mainnet"),
            Network::Test => f.write_str("testnet"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("invalid base58 character {character:?} at position {index}")]
    InvalidCharacter { character: char, index: usize },
    #[error("decoded address is {0} bytes, shorter than its checksum")]
    TooShort(usize),
    #[error("address checksum mismatch")]
    ChecksumMismatch,
    #[error("base58 decoding failed: {0}")]
    Base58(String),
}

/// Plain base58 (Bitcoin alphabet). Leading zero bytes become leading `1`s,
/// and an empty input encodes to an empty string.
pub fn base58_encode(input: &[u8]) -> String {
    bs58::encode(input).into_string()
}

pub fn base58_decode(input: &str) -> Result<Vec<u8>, AddressError> {
    bs58::decode(input).into_vec().map_err(|err| match err {
        bs58::decode::Error::InvalidCharacter { character, index } => {
            AddressError::InvalidCharacter { character, index }
        }
        bs58::decode::Error::NonAsciiCharacter { index } => AddressError::InvalidCharacter {
            character: input
                .get(index..)
                .and_then(|rest| rest.chars().next())
                .unwrap_or(char::REPLACEMENT_CHARACTER),
            index,
        },
        other => AddressError::Base58(other.to_string()),
    })
}

fn checksum(payload: &[u8]) -> [u8; CHECKSUM_LEN] {
    let digest = sha256d::Hash::hash(payload).to_byte_array();
    let mut out = [0u8; CHECKSUM_LEN];
    out.copy_from_slice(&digest[..CHECKSUM_LEN]);
    out
}

/// Appends the 4-byte checksum to `payload` and base58-encodes the result.
pub fn encode(payload: &[u8]) -> String {
    if payload.is_empty() {
        return String::new();
    }
    let mut data = Vec::with_capacity(payload.len() + CHECKSUM_LEN);
    data.extend_from_slice(payload);
    data.extend_from_slice(&checksum(payload));
    base58_encode(&data)
}

/// Reverses [`encode`], verifying the checksum before returning the payload.
pub fn decode(address: &str) -> Result<Vec<u8>, AddressError> {
    let mut data = base58_decode(address)?;
    if data.is_empty() {
        return Ok(data);
    }
    if data.len() <= CHECKSUM_LEN {
        return Err(AddressError::TooShort(data.len()));
    }
    let split = data.len() - CHECKSUM_LEN;
    if checksum(&data[..split]) != data[split..] {
        return Err(AddressError::ChecksumMismatch);
    }
    data.truncate(split);
    Ok(data)
}

/// Pay-to-pubkey-hash address for a serialized (compressed) public key.
pub fn p2pkh_address(public_key: &[u8], network: Network) -> String {
    let hash = hash160::Hash::hash(public_key);
    let mut payload = Vec::with_capacity(1 + 20);
    payload.push(network.p2pkh_version());
    payload.extend_from_slice(hash.as_byte_array());
    encode(&payload)
}

fn is_base58_char(c: char) -> bool {
    c.is_ascii_alphanumeric() && !matches!(c, '0' | 'O' | 'I' | 'l')
}

fn is_bech32_body(rest: &str) -> bool {
    (25..=90).contains(&rest.len())
        && rest.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
}

/// Classifies an address by its prefix pattern without decoding it.
///
/// Legacy addresses start with `1`/`3` on mainnet and `m`/`n`/`2` on testnet;
/// segwit addresses use the `bc1`/`tb1` human readable parts. Returns `None`
/// when the string matches neither shape.
pub fn validate(address: &str) -> Option<Network> {
    if let Some(rest) = address.strip_prefix("bc1") {
        return is_bech32_body(rest).then_some(Network::Main);
    }
    if let Some(rest) = address.strip_prefix("tb1") {
        return is_bech32_body(rest).then_some(Network::Test);
    }

    let mut chars = address.chars();
    let first = chars.next()?;
    let rest = chars.as_str();
    if !rest.chars().all(is_base58_char) || !(25..=34).contains(&rest.len()) {
        return None;
    }
    match first {
        '1' | '3' => Some(Network::Main),
        'm' | 'n' | '2' => Some(Network::Test),
        _ => None,
    }
}

pub fn is_valid(address: &str) -> bool {
    validate(address).is_some()
}
