//! Key material for the log envelope and storage encryption.

use std::collections::HashMap;
use std::fmt;

use crate::error::{CoreError, Result};

/// The three keys the ingest path may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyKind {
    /// 128-bit SipHash key authenticating log messages
    LogMac,
    /// AES key encrypting log message payloads
    LogCipher,
    /// AES key encrypting stored datapoints
    StorageCipher,
}

impl KeyKind {
    pub fn name(&self) -> &'static str {
        match self {
            KeyKind::LogMac => "log_mac",
            KeyKind::LogCipher => "log_cipher",
            KeyKind::StorageCipher => "storage_cipher",
        }
    }

    /// Check that `key` has a length this kind accepts.
    pub fn validate(&self, key: &[u8]) -> Result<()> {
        let ok = match self {
            KeyKind::LogMac => key.len() == 16,
            KeyKind::LogCipher | KeyKind::StorageCipher => matches!(key.len(), 16 | 32),
        };
        if ok {
            Ok(())
        } else {
            let expected = match self {
                KeyKind::LogMac => "16 bytes",
                _ => "16 or 32 bytes",
            };
            Err(CoreError::InvalidKey {
                name: self.name().to_string(),
                reason: format!("expected {}, got {}", expected, key.len()),
            })
        }
    }
}

/// Source of key material. `None` means the feature is disabled.
pub trait KeyProvider: Send + Sync {
    fn key(&self, kind: KeyKind) -> Option<Vec<u8>>;
}

/// Keys fixed at startup, usually decoded from configuration.
#[derive(Default, Clone)]
pub struct StaticKeyProvider {
    keys: HashMap<KeyKind, Vec<u8>>,
}

impl StaticKeyProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a raw key, validating its length.
    pub fn with_key(mut self, kind: KeyKind, key: Vec<u8>) -> Result<Self> {
        kind.validate(&key)?;
        self.keys.insert(kind, key);
        Ok(self)
    }

    /// Add a hex encoded key. Empty strings leave the key unset.
    pub fn with_hex(self, kind: KeyKind, hex_key: &str) -> Result<Self> {
        let trimmed = hex_key.trim();
        if trimmed.is_empty() {
            return Ok(self);
        }
        let key = hex::decode(trimmed).map_err(|e| CoreError::InvalidKey {
            name: kind.name().to_string(),
            reason: format!("invalid hex: {}", e),
        })?;
        self.with_key(kind, key)
    }
}

impl KeyProvider for StaticKeyProvider {
    fn key(&self, kind: KeyKind) -> Option<Vec<u8>> {
        self.keys.get(&kind).cloned()
    }
}

// Never print key bytes.
impl fmt::Debug for StaticKeyProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut configured: Vec<&str> = self.keys.keys().map(|k| k.name()).collect();
        configured.sort_unstable();
        f.debug_struct("StaticKeyProvider")
            .field("configured", &configured)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_key_must_be_128_bits() {
        assert!(KeyKind::LogMac.validate(&[0u8; 16]).is_ok());
        assert!(KeyKind::LogMac.validate(&[0u8; 32]).is_err());
    }

    #[test]
    fn test_cipher_key_lengths() {
        assert!(KeyKind::LogCipher.validate(&[0u8; 16]).is_ok());
        assert!(KeyKind::StorageCipher.validate(&[0u8; 32]).is_ok());
        assert!(KeyKind::LogCipher.validate(&[0u8; 24]).is_err());
        assert!(KeyKind::StorageCipher.validate(&[]).is_err());
    }

    #[test]
    fn test_hex_keys() {
        let provider = StaticKeyProvider::new()
            .with_hex(KeyKind::LogMac, "000102030405060708090a0b0c0d0e0f")
            .unwrap()
            .with_hex(KeyKind::LogCipher, "")
            .unwrap();

        assert_eq!(provider.key(KeyKind::LogMac).unwrap().len(), 16);
        assert!(provider.key(KeyKind::LogCipher).is_none());
    }

    #[test]
    fn test_bad_hex_is_rejected() {
        let err = StaticKeyProvider::new()
            .with_hex(KeyKind::StorageCipher, "zz")
            .unwrap_err();
        assert!(err.to_string().contains("storage_cipher"));
    }

    #[test]
    fn test_debug_hides_key_bytes() {
        let provider = StaticKeyProvider::new()
            .with_key(KeyKind::LogMac, vec![0xAB; 16])
            .unwrap();
        let printed = format!("{:?}", provider);
        assert!(printed.contains("log_mac"));
        assert!(!printed.contains("171"));
    }
}
