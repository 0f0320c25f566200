//! Read-only support for Fernet-format envelopes
//!
//! Layout: `0x80 | timestamp(8, BE) | iv(16) | ciphertext | hmac(32)`, URL-safe
//! base64. The 32-byte key is split into an HMAC signing half and an
//! AES-128-CBC half. Token age is not enforced.

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretBox, SecretString};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{CipherError, ConfigError, Result};

type HmacSha256 = Hmac<Sha256>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

const HALF_LEN: usize = 16;
const TIMESTAMP_LEN: usize = 8;
const IV_LEN: usize = 16;
const MAC_LEN: usize = 32;
const HEADER_LEN: usize = 1 + TIMESTAMP_LEN + IV_LEN;
const MIN_LEN: usize = HEADER_LEN + 16 + MAC_LEN;

pub(crate) struct LegacyKey {
    signing: SecretBox<[u8; HALF_LEN]>,
    encryption: SecretBox<[u8; HALF_LEN]>,
}

impl LegacyKey {
    pub(crate) fn new(key: &[u8]) -> Result<Self> {
        if key.len() != HALF_LEN * 2 {
            return Err(ConfigError::InvalidKey(format!(
                "legacy key must be {} bytes, got {}",
                HALF_LEN * 2,
                key.len()
            ))
            .into());
        }

        let mut signing = Box::new([0u8; HALF_LEN]);
        let mut encryption = Box::new([0u8; HALF_LEN]);
        signing.copy_from_slice(&key[..HALF_LEN]);
        encryption.copy_from_slice(&key[HALF_LEN..]);

        Ok(Self {
            signing: SecretBox::new(signing),
            encryption: SecretBox::new(encryption),
        })
    }

    /// Verify and decrypt a decoded legacy envelope
    pub(crate) fn open(&self, raw: &[u8]) -> Result<SecretString> {
        if raw.len() < MIN_LEN {
            return Err(CipherError::Format(format!(
                "legacy envelope truncated ({} bytes, need at least {})",
                raw.len(),
                MIN_LEN
            ))
            .into());
        }

        let (signed, mac) = raw.split_at(raw.len() - MAC_LEN);
        let iv = &signed[1 + TIMESTAMP_LEN..HEADER_LEN];
        let ciphertext = &signed[HEADER_LEN..];

        if ciphertext.len() % 16 != 0 {
            return Err(CipherError::Format(
                "legacy ciphertext is not block aligned".to_string(),
            )
            .into());
        }

        let expected = self.sign(signed)?;
        if !bool::from(expected.as_slice().ct_eq(mac)) {
            tracing::error!("Legacy envelope MAC verification failed: record tampered with or corrupted");
            return Err(CipherError::Integrity("legacy MAC mismatch".to_string()).into());
        }

        let plaintext = Aes128CbcDec::new(
            GenericArray::from_slice(self.encryption.expose_secret()),
            GenericArray::from_slice(iv),
        )
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CipherError::Integrity("invalid legacy padding".to_string()))?;

        let plaintext = String::from_utf8(plaintext)
            .map_err(|_| CipherError::Format("legacy secret is not valid UTF-8".to_string()))?;

        Ok(SecretString::from(plaintext))
    }

    fn sign(&self, data: &[u8]) -> Result<[u8; MAC_LEN]> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(self.signing.expose_secret())
            .map_err(|e| CipherError::Integrity(format!("HMAC initialization failed: {}", e)))?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().into())
    }

    /// Produce a legacy token; only tests may write this format
    #[cfg(test)]
    pub(crate) fn seal(&self, plaintext: &str, timestamp: u64, iv: &[u8; IV_LEN]) -> String {
        use aes::cipher::BlockEncryptMut;
        use base64::Engine;

        type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;

        let ciphertext = Aes128CbcEnc::new(
            GenericArray::from_slice(self.encryption.expose_secret()),
            GenericArray::from_slice(iv),
        )
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

        let mut raw = vec![0x80];
        raw.extend_from_slice(&timestamp.to_be_bytes());
        raw.extend_from_slice(iv);
        raw.extend_from_slice(&ciphertext);
        let mac = self.sign(&raw).unwrap();
        raw.extend_from_slice(&mac);

        base64::engine::general_purpose::URL_SAFE.encode(raw)
    }
}
