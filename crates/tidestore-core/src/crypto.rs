//! Crypto Envelope
//!
//! Log messages may be authenticated, encrypted, or both. Producers encrypt
//! first and then authenticate the ciphertext:
//!
//! ```text
//! [ nonce (12) | AES-GCM ciphertext + tag ]  [ SipHash-2-4 tag (8, BE) ]
//! └──────────── present with a cipher key ─┘  └── present with a MAC key ┘
//! ```
//!
//! Consumers reverse that in [`CryptoEnvelope::open`]. Failures are returned
//! as [`EnvelopeError`]; the message path counts and drops them, it never
//! treats them as fatal.
//!
//! Datapoints written to the store can be encrypted separately with the
//! storage key, see [`StorageSealer`].

use std::fmt;
use std::hash::Hasher;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Aes256Gcm, Nonce};
use bytes::{BufMut, Bytes, BytesMut};
use rand::RngCore;
use siphasher::sip::SipHasher24;
use siphasher::sip128::{Hasher128, SipHasher24 as SipHasher128};
use thiserror::Error;

use crate::datapoint::{Datapoint, DatapointCodec};
use crate::error::{CoreError, Result};
use crate::keys::{KeyKind, KeyProvider};
use crate::rowkey::RowKey;

pub const MAC_LEN: usize = 8;
pub const NONCE_LEN: usize = 12;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("message authentication failed")]
    AuthFailure,

    #[error("message decryption failed")]
    DecryptFailure,

    #[error("message encryption failed")]
    EncryptFailure,
}

/// AES-GCM with a 128 or 256 bit key.
#[derive(Clone)]
enum PayloadCipher {
    Aes128(Box<Aes128Gcm>),
    Aes256(Box<Aes256Gcm>),
}

impl PayloadCipher {
    fn new(kind: KeyKind, key: &[u8]) -> Result<Self> {
        kind.validate(key)?;
        let invalid = |_| CoreError::InvalidKey {
            name: kind.name().to_string(),
            reason: "rejected by cipher".to_string(),
        };
        match key.len() {
            16 => Ok(Self::Aes128(Box::new(
                Aes128Gcm::new_from_slice(key).map_err(invalid)?,
            ))),
            _ => Ok(Self::Aes256(Box::new(
                Aes256Gcm::new_from_slice(key).map_err(invalid)?,
            ))),
        }
    }

    fn encrypt(&self, plaintext: &[u8]) -> Option<Bytes> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        self.encrypt_with_nonce(nonce, plaintext)
    }

    fn encrypt_with_nonce(&self, nonce: [u8; NONCE_LEN], plaintext: &[u8]) -> Option<Bytes> {
        let nonce_ref = Nonce::from_slice(&nonce);
        let ciphertext = match self {
            Self::Aes128(c) => c.encrypt(nonce_ref, plaintext),
            Self::Aes256(c) => c.encrypt(nonce_ref, plaintext),
        }
        .ok()?;

        let mut out = BytesMut::with_capacity(NONCE_LEN + ciphertext.len());
        out.put_slice(&nonce);
        out.put_slice(&ciphertext);
        Some(out.freeze())
    }

    fn decrypt(&self, data: &[u8]) -> Option<Bytes> {
        if data.len() < NONCE_LEN {
            return None;
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        let nonce_ref = Nonce::from_slice(nonce);

        let plaintext = match self {
            Self::Aes128(c) => c.decrypt(nonce_ref, ciphertext),
            Self::Aes256(c) => c.decrypt(nonce_ref, ciphertext),
        }
        .ok()?;
        Some(Bytes::from(plaintext))
    }
}

/// Verifies and decrypts log messages.
#[derive(Clone, Default)]
pub struct CryptoEnvelope {
    mac_key: Option<[u8; 16]>,
    cipher: Option<PayloadCipher>,
}

impl CryptoEnvelope {
    /// Envelope with neither MAC nor cipher: every operation is the identity.
    pub fn plain() -> Self {
        Self::default()
    }

    pub fn from_keys(keys: &dyn KeyProvider) -> Result<Self> {
        let mac_key = match keys.key(KeyKind::LogMac) {
            Some(key) => {
                KeyKind::LogMac.validate(&key)?;
                let mut fixed = [0u8; 16];
                fixed.copy_from_slice(&key);
                Some(fixed)
            }
            None => None,
        };
        let cipher = keys
            .key(KeyKind::LogCipher)
            .map(|key| PayloadCipher::new(KeyKind::LogCipher, &key))
            .transpose()?;

        Ok(Self { mac_key, cipher })
    }

    pub fn has_mac(&self) -> bool {
        self.mac_key.is_some()
    }

    pub fn has_cipher(&self) -> bool {
        self.cipher.is_some()
    }

    /// Strip and check the trailing MAC.
    pub fn verify(&self, data: Bytes) -> std::result::Result<Bytes, EnvelopeError> {
        let Some(key) = &self.mac_key else {
            return Ok(data);
        };
        if data.len() < MAC_LEN {
            return Err(EnvelopeError::AuthFailure);
        }

        let split = data.len() - MAC_LEN;
        let expected = sip_tag(key, &data[..split]);
        if data[split..] != expected {
            return Err(EnvelopeError::AuthFailure);
        }
        Ok(data.slice(..split))
    }

    /// Decrypt the payload.
    pub fn unwrap(&self, data: Bytes) -> std::result::Result<Bytes, EnvelopeError> {
        match &self.cipher {
            Some(cipher) => cipher.decrypt(&data).ok_or(EnvelopeError::DecryptFailure),
            None => Ok(data),
        }
    }

    /// Verify then decrypt a message as read from the log.
    pub fn open(&self, data: Bytes) -> std::result::Result<Bytes, EnvelopeError> {
        let verified = self.verify(data)?;
        self.unwrap(verified)
    }

    /// Encrypt a payload.
    pub fn wrap(&self, payload: Bytes) -> std::result::Result<Bytes, EnvelopeError> {
        match &self.cipher {
            Some(cipher) => cipher.encrypt(&payload).ok_or(EnvelopeError::EncryptFailure),
            None => Ok(payload),
        }
    }

    /// Append the MAC of `data`.
    pub fn append_mac(&self, data: Bytes) -> Bytes {
        let Some(key) = &self.mac_key else {
            return data;
        };
        let mut out = BytesMut::with_capacity(data.len() + MAC_LEN);
        out.put_slice(&data);
        out.put_slice(&sip_tag(key, &data));
        out.freeze()
    }

    /// Encrypt then authenticate, producing a message [`open`](Self::open) accepts.
    pub fn close(&self, payload: Bytes) -> std::result::Result<Bytes, EnvelopeError> {
        Ok(self.append_mac(self.wrap(payload)?))
    }
}

impl fmt::Debug for CryptoEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoEnvelope")
            .field("mac", &self.has_mac())
            .field("cipher", &self.has_cipher())
            .finish()
    }
}

fn sip_tag(key: &[u8; 16], data: &[u8]) -> [u8; MAC_LEN] {
    let mut hasher = SipHasher24::new_with_key(key);
    hasher.write(data);
    hasher.finish().to_be_bytes()
}

/// Encodes single datapoints into store cell values, encrypting them when a
/// storage key is configured.
///
/// Sealing is deterministic: the AES-GCM nonce is a keyed SipHash-128 of the
/// row key, qualifier and encoded datapoint, so a replayed datapoint
/// overwrites its cell with identical bytes. A nonce only repeats for
/// identical input, which yields identical ciphertext.
#[derive(Clone, Default)]
pub struct StorageSealer {
    cipher: Option<SealingCipher>,
}

#[derive(Clone)]
struct SealingCipher {
    cipher: PayloadCipher,
    nonce_key: [u8; 16],
}

impl SealingCipher {
    fn new(key: &[u8]) -> Result<Self> {
        let cipher = PayloadCipher::new(KeyKind::StorageCipher, key)?;
        // Nonce key: keystream of the all-zero nonce, never produced by `nonce`
        // except with negligible probability
        let derived = cipher
            .encrypt_with_nonce([0u8; NONCE_LEN], &[0u8; 16])
            .ok_or_else(|| CoreError::Seal("nonce key derivation failed".to_string()))?;
        let mut nonce_key = [0u8; 16];
        nonce_key.copy_from_slice(&derived[NONCE_LEN..NONCE_LEN + 16]);
        Ok(Self { cipher, nonce_key })
    }

    fn nonce(&self, row: &RowKey, plaintext: &[u8]) -> [u8; NONCE_LEN] {
        let qualifier = row.qualifier.as_deref().unwrap_or_default();
        let mut hasher = SipHasher128::new_with_key(&self.nonce_key);
        hasher.write(&(row.key.len() as u64).to_be_bytes());
        hasher.write(&row.key);
        hasher.write(&(qualifier.len() as u64).to_be_bytes());
        hasher.write(qualifier);
        hasher.write(plaintext);

        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&hasher.finish128().as_bytes()[..NONCE_LEN]);
        nonce
    }
}

impl StorageSealer {
    pub fn plain() -> Self {
        Self::default()
    }

    pub fn from_keys(keys: &dyn KeyProvider) -> Result<Self> {
        let cipher = keys
            .key(KeyKind::StorageCipher)
            .map(|key| SealingCipher::new(&key))
            .transpose()?;
        Ok(Self { cipher })
    }

    pub fn is_encrypting(&self) -> bool {
        self.cipher.is_some()
    }

    /// Cell value for `point` stored under `row`.
    pub fn seal(&self, row: &RowKey, point: &Datapoint, codec: &dyn DatapointCodec) -> Result<Bytes> {
        let encoded = codec.encode_block(std::slice::from_ref(point));
        match &self.cipher {
            Some(sealing) => sealing
                .cipher
                .encrypt_with_nonce(sealing.nonce(row, &encoded), &encoded)
                .ok_or_else(|| CoreError::Seal("encryption failed".to_string())),
            None => Ok(encoded),
        }
    }

    pub fn open(&self, value: &[u8], codec: &dyn DatapointCodec) -> Result<Datapoint> {
        let plain = match &self.cipher {
            Some(sealing) => sealing
                .cipher
                .decrypt(value)
                .ok_or_else(|| CoreError::Seal("decryption failed".to_string()))?,
            None => Bytes::copy_from_slice(value),
        };
        let mut points = codec.decode_block(&plain)?;
        if points.len() != 1 {
            return Err(CoreError::Seal(format!(
                "expected one datapoint, found {}",
                points.len()
            )));
        }
        Ok(points.remove(0))
    }
}

impl fmt::Debug for StorageSealer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageSealer")
            .field("encrypting", &self.is_encrypting())
            .finish()
    }
}
