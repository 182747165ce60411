use bip39::{Language, Mnemonic};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use tiny_hderive::bip32::ExtendedPrivKey;

use crate::encoding::hex_bytes;
use crate::error::{BinderError, Result};

/// BIP-44 path used for every identity (Ethereum coin type, first account).
pub const DERIVATION_PATH: &str = "m/44'/60'/0'/0/0";

/// 256 bits of entropy = 24 words
pub const ENTROPY_BYTES: usize = 32;

/// Keys and address derived from one recovery phrase.
///
/// This is what gets sealed into the vault; field names match the stored JSON.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    #[serde(rename = "privateKey", with = "hex_bytes")]
    pub private_key: [u8; 32],
    /// Uncompressed SEC1 point without the leading 0x04 byte.
    #[serde(rename = "publicKey", with = "hex_bytes")]
    pub public_key: Vec<u8>,
    pub address: String,
    #[serde(rename = "mnemonic")]
    pub phrase: String,
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("private_key", &"<redacted>")
            .field("public_key", &hex::encode(&self.public_key))
            .field("address", &self.address)
            .field("phrase", &"<redacted>")
            .finish()
    }
}

/// Generate a brand new identity from fresh OS entropy.
pub fn generate_identity() -> Result<KeyMaterial> {
    let mut entropy = [0u8; ENTROPY_BYTES];
    OsRng
        .try_fill_bytes(&mut entropy)
        .map_err(|e| BinderError::EntropySource(e.to_string()))?;

    let mnemonic = Mnemonic::from_entropy_in(Language::English, &entropy)
        .map_err(|e| BinderError::EntropySource(e.to_string()))?;

    key_material_from(&mnemonic)
}

/// Re-derive the identity for an existing phrase.
///
/// The phrase is validated (word count, wordlist, checksum) before any key
/// derivation happens.
pub fn derive_identity(phrase: &str) -> Result<KeyMaterial> {
    let mnemonic = parse_phrase(phrase)?;
    key_material_from(&mnemonic)
}

/// Trim, collapse whitespace and lowercase a user-entered phrase.
pub fn normalize_phrase(phrase: &str) -> String {
    phrase
        .split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

fn parse_phrase(phrase: &str) -> Result<Mnemonic> {
    let normalized = normalize_phrase(phrase);
    if normalized.is_empty() {
        return Err(BinderError::InvalidPhrase("phrase is empty".to_string()));
    }
    Mnemonic::parse_in_normalized(Language::English, &normalized)
        .map_err(|e| BinderError::InvalidPhrase(e.to_string()))
}

fn key_material_from(mnemonic: &Mnemonic) -> Result<KeyMaterial> {
    let seed = mnemonic.to_seed("");

    let ext_key = ExtendedPrivKey::derive(&seed, DERIVATION_PATH)
        .map_err(|e| BinderError::InvalidPhrase(format!("key derivation failed: {:?}", e)))?;
    let private_key = ext_key.secret();

    let public_key = public_key_from(&private_key)?;
    let address = address_from_public_key(&public_key);

    Ok(KeyMaterial {
        private_key,
        public_key,
        address,
        phrase: mnemonic.to_string(),
    })
}

fn public_key_from(private_key: &[u8; 32]) -> Result<Vec<u8>> {
    let secret = k256::SecretKey::from_slice(private_key)
        .map_err(|e| BinderError::InvalidPhrase(format!("derived key out of range: {}", e)))?;
    let point = secret.public_key().to_encoded_point(false);
    // Drop the 0x04 uncompressed marker
    Ok(point.as_bytes()[1..].to_vec())
}

/// `0x` + hex of the last 20 bytes of Keccak-256(public key).
pub fn address_from_public_key(public_key: &[u8]) -> String {
    let hash = Keccak256::digest(public_key);
    format!("0x{}", hex::encode(&hash[12..]))
}

/// Check the `0x` + 40 lowercase hex shape of an address.
pub fn is_valid_address(address: &str) -> bool {
    match address.strip_prefix("0x") {
        Some(body) => body.len() == 40 && body.chars().all(|c| c.is_ascii_hexdigit()),
        None => false,
    }
}
