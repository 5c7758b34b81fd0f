//! Dynamic keys and user identifier encryption
//!
//! A dynamic key is `ssconf://{domain}/conf/{encrypted_id}#{label}`. VPN
//! clients resolve it through the lookup endpoint, so connection parameters
//! can change without handing the user a new key.
//!
//! # Ciphers
//!
//! - **AES-ECB** (default): the decimal user id, space padded to the block
//!   size, encrypted block by block with AES-128/192/256 depending on key
//!   length, then URL-safe base64. Matches keys that are already issued.
//!   ECB is deterministic and leaks equal plaintexts; it obfuscates, it does
//!   not authenticate.
//! - **ChaCha20-Poly1305**: random 12-byte nonce prepended to the
//!   authenticated ciphertext, URL-safe base64 without padding.

use aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use aes::{Aes128, Aes192, Aes256};
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, PAD, URL_SAFE_NO_PAD};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use chacha20poly1305::{aead::Aead, ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

use crate::config::IdCipherKind;
use crate::types::{KeygateError, Result};

/// AES block size
const BLOCK_LEN: usize = 16;

/// ChaCha20-Poly1305 nonce length
const NONCE_LEN: usize = 12;

/// URL-safe alphabet, padded on encode, padding optional on decode
const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    PAD.with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// AES block cipher sized by key length
pub enum AesKey {
    Aes128(Aes128),
    Aes192(Aes192),
    Aes256(Aes256),
}

impl AesKey {
    fn new(key: &[u8]) -> Result<Self> {
        let invalid = |_| KeygateError::Config(format!("Invalid AES key length {}", key.len()));
        match key.len() {
            16 => Aes128::new_from_slice(key).map(Self::Aes128).map_err(invalid),
            24 => Aes192::new_from_slice(key).map(Self::Aes192).map_err(invalid),
            32 => Aes256::new_from_slice(key).map(Self::Aes256).map_err(invalid),
            n => Err(KeygateError::Config(format!(
                "AES key must be 16, 24 or 32 bytes, got {}",
                n
            ))),
        }
    }

    fn encrypt_blocks(&self, data: &mut [u8]) {
        for chunk in data.chunks_exact_mut(BLOCK_LEN) {
            let block = GenericArray::from_mut_slice(chunk);
            match self {
                Self::Aes128(c) => c.encrypt_block(block),
                Self::Aes192(c) => c.encrypt_block(block),
                Self::Aes256(c) => c.encrypt_block(block),
            }
        }
    }

    fn decrypt_blocks(&self, data: &mut [u8]) {
        for chunk in data.chunks_exact_mut(BLOCK_LEN) {
            let block = GenericArray::from_mut_slice(chunk);
            match self {
                Self::Aes128(c) => c.decrypt_block(block),
                Self::Aes192(c) => c.decrypt_block(block),
                Self::Aes256(c) => c.decrypt_block(block),
            }
        }
    }
}

/// Symmetric cipher for user identifiers embedded in dynamic keys
pub enum IdCipher {
    AesEcb(AesKey),
    ChaCha20Poly1305(Zeroizing<[u8; 32]>),
}

impl std::fmt::Debug for IdCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AesEcb(_) => f.write_str("IdCipher::AesEcb"),
            Self::ChaCha20Poly1305(_) => f.write_str("IdCipher::ChaCha20Poly1305"),
        }
    }
}

impl IdCipher {
    /// Build the cipher selected in configuration
    pub fn new(kind: IdCipherKind, key: &[u8]) -> Result<Self> {
        match kind {
            IdCipherKind::AesEcb => Self::aes_ecb(key),
            IdCipherKind::ChaCha20Poly1305 => Self::chacha20_poly1305(key),
        }
    }

    pub fn aes_ecb(key: &[u8]) -> Result<Self> {
        Ok(Self::AesEcb(AesKey::new(key)?))
    }

    pub fn chacha20_poly1305(key: &[u8]) -> Result<Self> {
        let bytes: [u8; 32] = key.try_into().map_err(|_| {
            KeygateError::Config(format!(
                "ChaCha20-Poly1305 key must be 32 bytes, got {}",
                key.len()
            ))
        })?;
        Ok(Self::ChaCha20Poly1305(Zeroizing::new(bytes)))
    }

    /// Encrypt a user id into a URL-safe token
    pub fn encrypt_user_id(&self, user_id: i64) -> Result<String> {
        let plain = user_id.to_string();
        match self {
            Self::AesEcb(key) => {
                let mut data = space_pad(&plain);
                key.encrypt_blocks(&mut data);
                Ok(URL_SAFE_LENIENT.encode(data))
            }
            Self::ChaCha20Poly1305(key) => {
                let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_slice()));
                let mut nonce = [0u8; NONCE_LEN];
                OsRng.fill_bytes(&mut nonce);
                let sealed = cipher
                    .encrypt(Nonce::from_slice(&nonce), plain.as_bytes())
                    .map_err(|e| KeygateError::Crypto(format!("Encryption failed: {e}")))?;

                let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
                out.extend_from_slice(&nonce);
                out.extend_from_slice(&sealed);
                Ok(URL_SAFE_NO_PAD.encode(out))
            }
        }
    }

    /// Recover the user id from a token produced by `encrypt_user_id`
    pub fn decrypt_user_id(&self, token: &str) -> Result<i64> {
        let plain = match self {
            Self::AesEcb(key) => {
                let mut data = URL_SAFE_LENIENT
                    .decode(token)
                    .map_err(|e| KeygateError::Crypto(format!("Invalid identifier encoding: {e}")))?;
                if data.is_empty() || data.len() % BLOCK_LEN != 0 {
                    return Err(KeygateError::Crypto(format!(
                        "Identifier length {} is not a whole number of blocks",
                        data.len()
                    )));
                }
                key.decrypt_blocks(&mut data);
                data
            }
            Self::ChaCha20Poly1305(key) => {
                let data = URL_SAFE_NO_PAD
                    .decode(token.trim_end_matches('='))
                    .map_err(|e| KeygateError::Crypto(format!("Invalid identifier encoding: {e}")))?;
                if data.len() <= NONCE_LEN {
                    return Err(KeygateError::Crypto("Identifier too short".into()));
                }
                let (nonce, sealed) = data.split_at(NONCE_LEN);
                let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_slice()));
                cipher
                    .decrypt(Nonce::from_slice(nonce), sealed)
                    .map_err(|_| KeygateError::Crypto("Identifier failed authentication".into()))?
            }
        };

        let text = std::str::from_utf8(&plain)
            .map_err(|_| KeygateError::Crypto("Identifier is not valid UTF-8".into()))?;
        text.trim()
            .parse::<i64>()
            .map_err(|_| KeygateError::Crypto("Identifier is not a user id".into()))
    }
}

/// Pad with spaces to the next block boundary; a full block of padding is
/// added when the input is already aligned.
fn space_pad(text: &str) -> Vec<u8> {
    let mut data = text.as_bytes().to_vec();
    let pad = BLOCK_LEN - data.len() % BLOCK_LEN;
    data.resize(data.len() + pad, b' ');
    data
}

/// Builds dynamic keys for users
#[derive(Debug)]
pub struct DynamicKeyBuilder {
    domain: String,
    label: String,
    cipher: IdCipher,
}

impl DynamicKeyBuilder {
    pub fn new(domain: impl Into<String>, label: impl Into<String>, cipher: IdCipher) -> Self {
        Self {
            domain: domain.into(),
            label: label.into(),
            cipher,
        }
    }

    /// `ssconf://{domain}/conf/{encrypted_id}#{label}`
    pub fn build(&self, user_id: i64) -> Result<String> {
        let encrypted = self.cipher.encrypt_user_id(user_id)?;
        Ok(format!(
            "ssconf://{}/conf/{}#{}",
            self.domain, encrypted, self.label
        ))
    }

    pub fn cipher(&self) -> &IdCipher {
        &self.cipher
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_16: &[u8] = b"0123456789abcdef";
    const KEY_32: &[u8] = b"0123456789abcdef0123456789abcdef";

    #[test]
    fn test_space_pad() {
        assert_eq!(space_pad("123456789").len(), 16);
        assert_eq!(&space_pad("123456789")[9..], b"       ");
        // Aligned input gets a whole extra block
        assert_eq!(space_pad("1234567890123456").len(), 32);
    }

    #[test]
    fn test_aes_ecb_known_answers() {
        let cipher = IdCipher::aes_ecb(KEY_16).unwrap();
        assert_eq!(
            cipher.encrypt_user_id(123456789).unwrap(),
            "Bpz_J8xGf_0jfh1SpvzpuA=="
        );
        assert_eq!(
            cipher.encrypt_user_id(1234567890123456).unwrap(),
            "vTtMjDmTF7r_VhNYUsEobJLz4mCjkntgQ_Phfw21QTI="
        );

        let cipher = IdCipher::aes_ecb(KEY_32).unwrap();
        assert_eq!(
            cipher.encrypt_user_id(802171486).unwrap(),
            "KYK0iXMDoOUAzriZhi__1A=="
        );
    }

    #[test]
    fn test_aes_ecb_decrypts_issued_tokens() {
        let cipher = IdCipher::aes_ecb(KEY_16).unwrap();
        assert_eq!(cipher.decrypt_user_id("Bpz_J8xGf_0jfh1SpvzpuA==").unwrap(), 123456789);
        // Padding stripped by a client is tolerated
        assert_eq!(cipher.decrypt_user_id("Bpz_J8xGf_0jfh1SpvzpuA").unwrap(), 123456789);
    }

    #[test]
    fn test_aes_192_round_trip() {
        let cipher = IdCipher::aes_ecb(b"0123456789abcdef01234567").unwrap();
        let token = cipher.encrypt_user_id(42).unwrap();
        assert_eq!(cipher.decrypt_user_id(&token).unwrap(), 42);
    }

    #[test]
    fn test_aes_rejects_garbage() {
        let cipher = IdCipher::aes_ecb(KEY_16).unwrap();
        assert!(matches!(
            cipher.decrypt_user_id("not base64 !!"),
            Err(KeygateError::Crypto(_))
        ));
        // Valid base64, wrong length
        assert!(cipher.decrypt_user_id("AAAA").is_err());
        // Right length, wrong key
        let other = IdCipher::aes_ecb(b"fedcba9876543210").unwrap();
        let token = other.encrypt_user_id(123456789).unwrap();
        assert!(cipher.decrypt_user_id(&token).is_err());
    }

    #[test]
    fn test_invalid_key_lengths() {
        assert!(matches!(IdCipher::aes_ecb(b"short"), Err(KeygateError::Config(_))));
        assert!(IdCipher::chacha20_poly1305(KEY_16).is_err());
    }

    #[test]
    fn test_chacha_is_randomized_and_authenticated() {
        let cipher = IdCipher::chacha20_poly1305(KEY_32).unwrap();
        let a = cipher.encrypt_user_id(802171486).unwrap();
        let b = cipher.encrypt_user_id(802171486).unwrap();
        assert_ne!(a, b);
        assert_eq!(cipher.decrypt_user_id(&a).unwrap(), 802171486);
        assert_eq!(cipher.decrypt_user_id(&b).unwrap(), 802171486);

        let mut raw = URL_SAFE_NO_PAD.decode(&a).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let tampered = URL_SAFE_NO_PAD.encode(raw);
        assert!(cipher.decrypt_user_id(&tampered).is_err());
    }

    #[test]
    fn test_dynamic_key_format() {
        let builder = DynamicKeyBuilder::new(
            "vpn.example.com",
            "MyVPN",
            IdCipher::aes_ecb(KEY_16).unwrap(),
        );
        assert_eq!(
            builder.build(123456789).unwrap(),
            "ssconf://vpn.example.com/conf/Bpz_J8xGf_0jfh1SpvzpuA==#MyVPN"
        );
    }
}
