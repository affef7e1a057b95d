use crate::error::{KeeperError, KeeperResult};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;

pub const MASTER_KEY_LEN: usize = 32;

/// Source of master keys. Every sealed record carries the version of the key
/// that sealed it, so a provider holding several versions can open old
/// records while sealing new ones with the current key.
pub trait KeyProvider: Send + Sync {
    /// Version stamped into newly sealed records.
    fn current_version(&self) -> u8;

    fn master_key(&self, version: u8) -> KeeperResult<[u8; MASTER_KEY_LEN]>;
}

/// A single process-wide key, version 1.
#[derive(Clone)]
pub struct StaticKeyProvider {
    key: [u8; MASTER_KEY_LEN],
}

impl StaticKeyProvider {
    pub const VERSION: u8 = 1;

    pub fn new(key: [u8; MASTER_KEY_LEN]) -> Self {
        Self { key }
    }

    pub fn from_base64(encoded: &str) -> KeeperResult<Self> {
        let raw = STANDARD
            .decode(encoded.trim())
            .map_err(|e| KeeperError::config(format!("master_key is not valid base64: {e}")))?;
        let key: [u8; MASTER_KEY_LEN] = raw.try_into().map_err(|raw: Vec<u8>| {
            KeeperError::config(format!(
                "master_key must decode to {MASTER_KEY_LEN} bytes, got {}",
                raw.len()
            ))
        })?;
        Ok(Self::new(key))
    }
}

impl KeyProvider for StaticKeyProvider {
    fn current_version(&self) -> u8 {
        Self::VERSION
    }

    fn master_key(&self, version: u8) -> KeeperResult<[u8; MASTER_KEY_LEN]> {
        if version != Self::VERSION {
            return Err(KeeperError::CredentialDecryption(format!(
                "unknown key version {version}"
            )));
        }
        Ok(self.key)
    }
}

impl std::fmt::Debug for StaticKeyProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticKeyProvider")
            .field("key", &"<redacted>")
            .finish()
    }
}
