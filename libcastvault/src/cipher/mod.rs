//! Envelope encryption for OAuth tokens at rest
//!
//! Every token written to the credential store goes through [`EnvelopeCipher`].
//! An envelope is self-describing: its first byte names the format, so a
//! reader can dispatch without parsing the rest.
//!
//! # Version 1 layout
//!
//! ```text
//! base64( version(1) | salt(16) | iv(16) | ciphertext(n * 16) | mac(32) )
//! ```
//!
//! - key  = PBKDF2-HMAC-SHA256(master_key | context label, salt, 100_000 rounds)
//! - ciphertext = AES-256-CBC(key, iv, PKCS#7(plaintext))
//! - mac  = HMAC-SHA256(key, iv | ciphertext)
//!
//! The MAC is checked in constant time before any decryption happens.
//!
//! # Legacy layout
//!
//! Envelopes written before the current scheme use the Fernet token format
//! (marker `0x80`, no PBKDF2 salt). They can be read and migrated, never
//! written.
//!
//! # Example
//!
//! ```no_run
//! use libcastvault::cipher::EnvelopeCipher;
//! use secrecy::ExposeSecret;
//!
//! # fn example() -> libcastvault::Result<()> {
//! let cipher = EnvelopeCipher::new(&[7u8; 32], None)?;
//! let envelope = cipher.encrypt("ya29.a0AfH6SM...")?;
//! let token = cipher.decrypt(&envelope)?;
//! assert_eq!(token.expose_secret(), "ya29.a0AfH6SM...");
//! # Ok(())
//! # }
//! ```

mod legacy;

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretBox, SecretString};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::config::CryptoConfig;
use crate::error::{CipherError, ConfigError, Result};

pub(crate) use legacy::LegacyKey;

type HmacSha256 = Hmac<Sha256>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Master key length in bytes (AES-256)
pub const MASTER_KEY_LEN: usize = 32;
pub const SALT_LEN: usize = 16;
pub const IV_LEN: usize = 16;
pub const MAC_LEN: usize = 32;
const BLOCK_LEN: usize = 16;

/// PBKDF2 rounds for version 1 envelopes.
///
/// The envelope does not record the round count, so it is fixed per version
/// byte. Raising it means introducing a new version.
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// Appended to the master key before derivation so keys derived here never
/// collide with other uses of the same master key.
const KEY_CONTEXT: &[u8] = b"castvault/oauth-token/v1";

const V1_HEADER_LEN: usize = 1 + SALT_LEN + IV_LEN;
const V1_MIN_LEN: usize = V1_HEADER_LEN + BLOCK_LEN + MAC_LEN;

/// Envelope formats this crate knows how to read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeVersion {
    /// PBKDF2 + AES-256-CBC + HMAC-SHA256, the only format ever written
    V1,
    /// Fernet tokens from before key derivation was introduced
    Legacy,
}

impl EnvelopeVersion {
    pub const V1_MARKER: u8 = 0x01;
    pub const LEGACY_MARKER: u8 = 0x80;

    /// Dispatch on the first byte of a decoded envelope
    pub fn from_marker(marker: u8) -> std::result::Result<Self, CipherError> {
        match marker {
            Self::V1_MARKER => Ok(Self::V1),
            Self::LEGACY_MARKER => Ok(Self::Legacy),
            other => Err(CipherError::Format(format!(
                "unrecognized envelope version 0x{:02x}",
                other
            ))),
        }
    }

    pub fn marker(self) -> u8 {
        match self {
            Self::V1 => Self::V1_MARKER,
            Self::Legacy => Self::LEGACY_MARKER,
        }
    }
}

/// Authenticated encryption of token strings under a process-wide master key
///
/// Built once at startup and shared read-only (`Arc<EnvelopeCipher>`).
/// Key material is zeroized on drop and never printed.
pub struct EnvelopeCipher {
    master: SecretBox<[u8; MASTER_KEY_LEN]>,
    legacy: Option<LegacyKey>,
}

impl std::fmt::Debug for EnvelopeCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeCipher")
            .field("master", &"[REDACTED]")
            .field("legacy", &self.legacy.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl EnvelopeCipher {
    /// Create a cipher from raw key bytes
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidKey` if the master key is not exactly
    /// 32 bytes, or if a legacy key is given that is not a 32-byte Fernet key.
    pub fn new(master_key: &[u8], legacy_key: Option<&[u8]>) -> Result<Self> {
        if master_key.len() != MASTER_KEY_LEN {
            return Err(ConfigError::InvalidKey(format!(
                "master key must be {} bytes, got {}",
                MASTER_KEY_LEN,
                master_key.len()
            ))
            .into());
        }

        let mut master = Box::new([0u8; MASTER_KEY_LEN]);
        master.copy_from_slice(master_key);

        let legacy = legacy_key.map(LegacyKey::new).transpose()?;

        Ok(Self {
            master: SecretBox::new(master),
            legacy,
        })
    }

    /// Build the cipher from the environment variables named in config
    ///
    /// The master key is required; the legacy key is optional and only
    /// needed while legacy envelopes remain in the store.
    pub fn from_env(crypto: &CryptoConfig) -> Result<Self> {
        let encoded = std::env::var(&crypto.master_key_env)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingField(crypto.master_key_env.clone()))?;
        let master = Zeroizing::new(encoded);
        let master = parse_master_key(&master)?;

        let legacy = match std::env::var(&crypto.legacy_key_env) {
            Ok(value) if !value.trim().is_empty() => {
                let value = Zeroizing::new(value);
                Some(parse_legacy_key(&value)?)
            }
            _ => None,
        };

        tracing::debug!(
            legacy_key = legacy.is_some(),
            "Loaded envelope keys from {}",
            crypto.master_key_env
        );

        Self::new(&master, legacy.as_deref().map(|k| k.as_slice()))
    }

    /// Whether legacy envelopes can be read
    pub fn has_legacy_key(&self) -> bool {
        self.legacy.is_some()
    }

    /// Encrypt a secret into a version 1 envelope
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut salt = [0u8; SALT_LEN];
        let mut iv = [0u8; IV_LEN];
        let mut rng = rand::thread_rng();
        rng.fill_bytes(&mut salt);
        rng.fill_bytes(&mut iv);

        let raw = self.seal_v1(plaintext.as_bytes(), &salt, &iv)?;
        Ok(STANDARD.encode(raw))
    }

    /// Decrypt an envelope of any known version
    ///
    /// # Errors
    ///
    /// - `CipherError::Format` for undecodable input or an unknown version byte
    /// - `CipherError::Integrity` when the MAC does not verify
    /// - `ConfigError::LegacyKeyMissing` for a legacy envelope with no legacy key
    pub fn decrypt(&self, envelope: &str) -> Result<SecretString> {
        let raw = Zeroizing::new(decode_outer(envelope)?);

        match EnvelopeVersion::from_marker(raw[0])? {
            EnvelopeVersion::V1 => self.open_v1(&raw),
            EnvelopeVersion::Legacy => {
                let legacy = self.legacy.as_ref().ok_or(ConfigError::LegacyKeyMissing)?;
                legacy.open(&raw)
            }
        }
    }

    /// Re-encrypt a legacy envelope under the current scheme
    ///
    /// A version 1 envelope is returned unchanged, so running a migration
    /// twice never double-encrypts.
    pub fn migrate_legacy(&self, envelope: &str) -> Result<String> {
        let raw = Zeroizing::new(decode_outer(envelope)?);

        match EnvelopeVersion::from_marker(raw[0])? {
            EnvelopeVersion::V1 => Ok(envelope.to_string()),
            EnvelopeVersion::Legacy => {
                let legacy = self.legacy.as_ref().ok_or(ConfigError::LegacyKeyMissing)?;
                let plaintext = legacy.open(&raw)?;
                self.encrypt(plaintext.expose_secret())
            }
        }
    }

    fn seal_v1(&self, plaintext: &[u8], salt: &[u8; SALT_LEN], iv: &[u8; IV_LEN]) -> Result<Vec<u8>> {
        let key = derive_key(self.master.expose_secret(), salt);

        let ciphertext = Aes256CbcEnc::new(
            GenericArray::from_slice(&key[..]),
            GenericArray::from_slice(iv),
        )
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let mac = compute_mac(&key[..], iv, &ciphertext)?;

        let mut raw = Vec::with_capacity(V1_HEADER_LEN + ciphertext.len() + MAC_LEN);
        raw.push(EnvelopeVersion::V1_MARKER);
        raw.extend_from_slice(salt);
        raw.extend_from_slice(iv);
        raw.extend_from_slice(&ciphertext);
        raw.extend_from_slice(&mac);
        Ok(raw)
    }

    fn open_v1(&self, raw: &[u8]) -> Result<SecretString> {
        if raw.len() < V1_MIN_LEN {
            return Err(CipherError::Format(format!(
                "version 1 envelope truncated ({} bytes, need at least {})",
                raw.len(),
                V1_MIN_LEN
            ))
            .into());
        }

        let salt = &raw[1..1 + SALT_LEN];
        let iv = &raw[1 + SALT_LEN..V1_HEADER_LEN];
        let (ciphertext, mac) = raw[V1_HEADER_LEN..].split_at(raw.len() - V1_HEADER_LEN - MAC_LEN);

        if ciphertext.len() % BLOCK_LEN != 0 {
            return Err(CipherError::Format(format!(
                "ciphertext length {} is not a multiple of the block size",
                ciphertext.len()
            ))
            .into());
        }

        let key = derive_key(self.master.expose_secret(), salt);
        open_with_key(&key, iv, ciphertext, mac)
    }
}

/// Verify the MAC, then decrypt
///
/// Never touches the ciphertext unless the MAC matched.
fn open_with_key(key: &[u8; MASTER_KEY_LEN], iv: &[u8], ciphertext: &[u8], mac: &[u8]) -> Result<SecretString> {
    let expected = compute_mac(key, iv, ciphertext)?;
    if !bool::from(expected.as_slice().ct_eq(mac)) {
        tracing::error!("Envelope MAC verification failed: record tampered with or corrupted");
        return Err(CipherError::Integrity("MAC mismatch".to_string()).into());
    }

    let plaintext = Aes256CbcDec::new(GenericArray::from_slice(key), GenericArray::from_slice(iv))
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CipherError::Integrity("invalid padding".to_string()))?;

    let plaintext = String::from_utf8(plaintext)
        .map_err(|_| CipherError::Format("decrypted secret is not valid UTF-8".to_string()))?;

    Ok(SecretString::from(plaintext))
}

fn derive_key(master: &[u8; MASTER_KEY_LEN], salt: &[u8]) -> Zeroizing<[u8; MASTER_KEY_LEN]> {
    let mut password = Zeroizing::new(Vec::with_capacity(MASTER_KEY_LEN + KEY_CONTEXT.len()));
    password.extend_from_slice(master);
    password.extend_from_slice(KEY_CONTEXT);

    let mut key = Zeroizing::new([0u8; MASTER_KEY_LEN]);
    pbkdf2::pbkdf2_hmac::<Sha256>(&password, salt, PBKDF2_ITERATIONS, &mut key[..]);
    key
}

fn compute_mac(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<[u8; MAC_LEN]> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| CipherError::Integrity(format!("HMAC initialization failed: {}", e)))?;
    mac.update(iv);
    mac.update(ciphertext);
    Ok(mac.finalize().into_bytes().into())
}

/// Base64-decode an envelope; standard alphabet first, URL-safe for Fernet tokens
fn decode_outer(envelope: &str) -> std::result::Result<Vec<u8>, CipherError> {
    let trimmed = envelope.trim();
    if trimmed.is_empty() {
        return Err(CipherError::Format("empty envelope".to_string()));
    }

    let raw = STANDARD
        .decode(trimmed)
        .or_else(|_| URL_SAFE.decode(trimmed))
        .map_err(|e| CipherError::Format(format!("envelope is not base64: {}", e)))?;

    if raw.is_empty() {
        return Err(CipherError::Format("empty envelope".to_string()));
    }
    Ok(raw)
}

/// Report an envelope's version without decrypting it
pub fn envelope_version(envelope: &str) -> Result<EnvelopeVersion> {
    let raw = decode_outer(envelope)?;
    Ok(EnvelopeVersion::from_marker(raw[0])?)
}

/// One-shot encrypt with a raw master key
pub fn encrypt(plaintext: &str, master_key: &[u8]) -> Result<String> {
    EnvelopeCipher::new(master_key, None)?.encrypt(plaintext)
}

/// One-shot decrypt of a version 1 envelope with a raw master key
pub fn decrypt(envelope: &str, master_key: &[u8]) -> Result<SecretString> {
    EnvelopeCipher::new(master_key, None)?.decrypt(envelope)
}

/// Parse a master key given as 64 hex characters or standard base64
pub fn parse_master_key(encoded: &str) -> Result<Zeroizing<Vec<u8>>> {
    let trimmed = encoded.trim();

    let bytes = if trimmed.len() == MASTER_KEY_LEN * 2 && trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
        hex::decode(trimmed).map_err(|e| ConfigError::InvalidKey(format!("invalid hex key: {}", e)))?
    } else {
        STANDARD
            .decode(trimmed)
            .map_err(|_| ConfigError::InvalidKey("master key is neither hex nor base64".to_string()))?
    };

    if bytes.len() != MASTER_KEY_LEN {
        return Err(ConfigError::InvalidKey(format!(
            "master key must be {} bytes, got {}",
            MASTER_KEY_LEN,
            bytes.len()
        ))
        .into());
    }

    Ok(Zeroizing::new(bytes))
}

/// Parse a Fernet key (URL-safe base64 of 32 bytes)
pub fn parse_legacy_key(encoded: &str) -> Result<Zeroizing<Vec<u8>>> {
    let trimmed = encoded.trim();
    let bytes = URL_SAFE
        .decode(trimmed)
        .or_else(|_| STANDARD.decode(trimmed))
        .map_err(|_| ConfigError::InvalidKey("legacy key is not base64".to_string()))?;
    Ok(Zeroizing::new(bytes))
}

/// Generate a fresh random master key, base64 encoded
pub fn generate_master_key() -> String {
    let mut key = Zeroizing::new([0u8; MASTER_KEY_LEN]);
    rand::thread_rng().fill_bytes(&mut key[..]);
    STANDARD.encode(&key[..])
}

#[cfg(test)]
mod tests;
