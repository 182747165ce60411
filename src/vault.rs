//! Password-sealed secret container.
//!
//! Key = PBKDF2-HMAC-SHA256(password, salt), cipher = AES-256-GCM with a
//! 16-byte IV. Salt, IV and round count are stored alongside the ciphertext so
//! a vault can be opened with nothing but the password.

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, Nonce};
use hmac::Hmac;
use pbkdf2::pbkdf2;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;

use crate::encoding::hex_bytes;
use crate::error::{BinderError, Result};

pub const SALT_LEN: usize = 16;
pub const IV_LEN: usize = 16;
pub const DEFAULT_KDF_ROUNDS: u32 = 100_000;

type VaultCipher = AesGcm<Aes256, U16>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct EncryptedVault {
    #[serde(with = "hex_bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub salt: [u8; SALT_LEN],
    #[serde(with = "hex_bytes")]
    pub iv: [u8; IV_LEN],
    #[serde(default = "default_kdf_rounds")]
    pub kdf_rounds: u32,
}

fn default_kdf_rounds() -> u32 {
    DEFAULT_KDF_ROUNDS
}

fn derive_key(password: &str, salt: &[u8], rounds: u32) -> [u8; 32] {
    let mut key = [0u8; 32]; // AES-256
    pbkdf2::<Hmac<Sha256>>(password.as_bytes(), salt, rounds, &mut key);
    key
}

fn fill_random(buf: &mut [u8]) -> Result<()> {
    OsRng
        .try_fill_bytes(buf)
        .map_err(|e| BinderError::EntropySource(e.to_string()))
}

/// Encrypt `secret` under `password`. Every call uses a fresh salt and IV.
pub fn seal<T: Serialize + ?Sized>(secret: &T, password: &str, kdf_rounds: u32) -> Result<EncryptedVault> {
    if kdf_rounds == 0 {
        return Err(BinderError::Serialization("kdf rounds must be non-zero".to_string()));
    }
    let plaintext = serde_json::to_vec(secret)?;

    let mut salt = [0u8; SALT_LEN];
    fill_random(&mut salt)?;
    let mut iv = [0u8; IV_LEN];
    fill_random(&mut iv)?;

    let key = derive_key(password, &salt, kdf_rounds);
    let cipher = VaultCipher::new(&key.into());
    let ciphertext = cipher
        .encrypt(Nonce::<U16>::from_slice(&iv), plaintext.as_slice())
        .map_err(|e| BinderError::Serialization(format!("Encryption failure: {:?}", e)))?;

    Ok(EncryptedVault {
        ciphertext,
        salt,
        iv,
        kdf_rounds,
    })
}

/// Decrypt a vault. Wrong password, tampering and garbage all surface as
/// [`BinderError::Decryption`].
pub fn open<T: DeserializeOwned>(vault: &EncryptedVault, password: &str) -> Result<T> {
    if vault.kdf_rounds == 0 {
        return Err(BinderError::Decryption);
    }
    let key = derive_key(password, &vault.salt, vault.kdf_rounds);
    let cipher = VaultCipher::new(&key.into());

    let plaintext = cipher
        .decrypt(Nonce::<U16>::from_slice(&vault.iv), vault.ciphertext.as_slice())
        .map_err(|_| BinderError::Decryption)?;

    serde_json::from_slice(&plaintext).map_err(|_| BinderError::Decryption)
}

/// High-entropy vault password (32 random bytes, hex encoded).
pub fn generate_password() -> Result<String> {
    let mut raw = [0u8; 32];
    fill_random(&mut raw)?;
    Ok(hex::encode(raw))
}

/// [`seal`] on the blocking pool, bounded by `limit`.
pub async fn seal_in_background<T>(secret: T, password: String, kdf_rounds: u32, limit: Duration) -> Result<EncryptedVault>
where
    T: Serialize + Send + 'static,
{
    let task = tokio::task::spawn_blocking(move || seal(&secret, &password, kdf_rounds));
    match tokio::time::timeout(limit, task).await {
        Ok(Ok(sealed)) => sealed,
        Ok(Err(e)) => Err(BinderError::Serialization(format!("vault task failed: {}", e))),
        Err(_) => Err(BinderError::Timeout("vault key derivation".to_string())),
    }
}

/// [`open`] on the blocking pool, bounded by `limit`.
pub async fn open_in_background<T>(vault: EncryptedVault, password: String, limit: Duration) -> Result<T>
where
    T: DeserializeOwned + Send + 'static,
{
    let task = tokio::task::spawn_blocking(move || open::<T>(&vault, &password));
    match tokio::time::timeout(limit, task).await {
        Ok(Ok(opened)) => opened,
        Ok(Err(e)) => Err(BinderError::Persistence(format!("vault task failed: {}", e))),
        Err(_) => Err(BinderError::Timeout("vault key derivation".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ROUNDS: u32 = 1_000;

    #[test]
    fn test_round_trip() {
        let secret = json!({"address": "0xabc", "mnemonic": "one two three"});
        let vault = seal(&secret, "pw", ROUNDS).unwrap();
        let back: serde_json::Value = open(&vault, "pw").unwrap();
        assert_eq!(back, secret);
    }

    #[test]
    fn test_wrong_password() {
        let vault = seal(&"top secret", "right", ROUNDS).unwrap();
        let res: Result<String> = open(&vault, "wrong");
        assert!(matches!(res, Err(BinderError::Decryption)));
    }

    #[test]
    fn test_bit_flip_detected() {
        let vault = seal(&"top secret", "pw", ROUNDS).unwrap();
        for i in [0, vault.ciphertext.len() / 2, vault.ciphertext.len() - 1] {
            let mut tampered = vault.clone();
            tampered.ciphertext[i] ^= 0x01;
            let res: Result<String> = open(&tampered, "pw");
            assert!(matches!(res, Err(BinderError::Decryption)), "flip at {} not detected", i);
        }

        let mut bad_iv = vault.clone();
        bad_iv.iv[0] ^= 0x80;
        assert!(matches!(open::<String>(&bad_iv, "pw"), Err(BinderError::Decryption)));
    }

    #[test]
    fn test_truncated_ciphertext() {
        let mut vault = seal(&"top secret", "pw", ROUNDS).unwrap();
        vault.ciphertext.truncate(4);
        assert!(matches!(open::<String>(&vault, "pw"), Err(BinderError::Decryption)));
    }

    #[test]
    fn test_fresh_salt_and_iv_per_seal() {
        let a = seal(&"same", "pw", ROUNDS).unwrap();
        let b = seal(&"same", "pw", ROUNDS).unwrap();
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_vault_survives_json() {
        let vault = seal(&vec![1u8, 2, 3], "pw", ROUNDS).unwrap();
        let stored = serde_json::to_string(&vault).unwrap();
        let loaded: EncryptedVault = serde_json::from_str(&stored).unwrap();
        let back: Vec<u8> = open(&loaded, "pw").unwrap();
        assert_eq!(back, vec![1, 2, 3]);
    }

    #[test]
    fn test_zero_rounds_rejected() {
        assert!(seal(&"x", "pw", 0).is_err());
    }

    #[test]
    fn test_generated_passwords_differ() {
        let a = generate_password().unwrap();
        let b = generate_password().unwrap();
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_background_round_trip() {
        let limit = Duration::from_secs(30);
        let vault = seal_in_background("hello".to_string(), "pw".to_string(), ROUNDS, limit)
            .await
            .unwrap();
        let back: String = open_in_background(vault, "pw".to_string(), limit).await.unwrap();
        assert_eq!(back, "hello");
    }
}
