//! Credential vault: AES-256-CBC with an HMAC-SHA256 tag (encrypt-then-MAC).
//!
//! Sealed format, base64 encoded:
//! `version (1) || salt (16) || iv (16) || ciphertext || tag (32)`.
//! Per-record keys are derived from the master key, the secret kind and the
//! salt, so identical plaintexts never share a key or ciphertext.

pub mod key_provider;

pub use key_provider::{KeyProvider, MASTER_KEY_LEN, StaticKeyProvider};

use crate::error::{KeeperError, KeeperResult};
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;
use std::fmt;
use std::sync::Arc;
use subtle::ConstantTimeEq;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

const SALT_LEN: usize = 16;
const IV_LEN: usize = 16;
const TAG_LEN: usize = 32;
const HEADER_LEN: usize = 1 + SALT_LEN + IV_LEN;

/// Largest secret the vault accepts (1 MiB).
pub const MAX_PLAINTEXT_LEN: usize = 1 << 20;

/// Domain separation for derived keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretKind {
    CipherPassphrase,
    StorageSecret,
    DatabasePassword,
    SshPrivateKey,
}

impl SecretKind {
    fn label(&self) -> &'static [u8] {
        match self {
            SecretKind::CipherPassphrase => b"cipher-passphrase",
            SecretKind::StorageSecret => b"storage-secret",
            SecretKind::DatabasePassword => b"database-password",
            SecretKind::SshPrivateKey => b"ssh-private-key",
        }
    }
}

/// Decrypted secret. Never printed by `Debug` or `Display`.
#[derive(Clone, PartialEq, Eq)]
pub struct Plaintext(String);

impl Plaintext {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Plaintext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Plaintext(<redacted>)")
    }
}

impl fmt::Display for Plaintext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

#[derive(Clone)]
pub struct Vault {
    provider: Arc<dyn KeyProvider>,
}

impl Vault {
    pub fn new(provider: Arc<dyn KeyProvider>) -> Self {
        Self { provider }
    }

    pub fn from_master_key(encoded: &str) -> KeeperResult<Self> {
        Ok(Self::new(Arc::new(StaticKeyProvider::from_base64(encoded)?)))
    }

    pub fn seal(&self, kind: SecretKind, plaintext: &[u8]) -> KeeperResult<String> {
        if plaintext.len() > MAX_PLAINTEXT_LEN {
            return Err(KeeperError::config(format!(
                "secret exceeds {MAX_PLAINTEXT_LEN} bytes"
            )));
        }
        let version = self.provider.current_version();
        let master = self.provider.master_key(version)?;

        let mut salt = [0u8; SALT_LEN];
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut iv);

        let (enc_key, mac_key) = derive_keys(&master, kind, &salt)?;
        let ciphertext =
            Aes256CbcEnc::new(&enc_key.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let mut out = Vec::with_capacity(HEADER_LEN + ciphertext.len() + TAG_LEN);
        out.push(version);
        out.extend_from_slice(&salt);
        out.extend_from_slice(&iv);
        out.extend_from_slice(&ciphertext);
        let tag = compute_tag(&mac_key, &out)?;
        out.extend_from_slice(&tag);
        Ok(STANDARD.encode(out))
    }

    pub fn seal_str(&self, kind: SecretKind, plaintext: &str) -> KeeperResult<String> {
        self.seal(kind, plaintext.as_bytes())
    }

    pub fn open_bytes(&self, kind: SecretKind, sealed: &str) -> KeeperResult<Vec<u8>> {
        let raw = STANDARD
            .decode(sealed.trim())
            .map_err(|_| decryption_error("sealed value is not base64"))?;
        if raw.len() < HEADER_LEN + TAG_LEN {
            return Err(decryption_error("sealed value too short"));
        }
        let (body, tag) = raw.split_at(raw.len() - TAG_LEN);
        let version = body[0];
        let salt = &body[1..1 + SALT_LEN];
        let iv: [u8; IV_LEN] = body[1 + SALT_LEN..HEADER_LEN]
            .try_into()
            .map_err(|_| decryption_error("malformed iv"))?;
        let ciphertext = &body[HEADER_LEN..];

        let master = self.provider.master_key(version)?;
        let (enc_key, mac_key) = derive_keys(&master, kind, salt)?;
        let expected = compute_tag(&mac_key, body)?;
        if !bool::from(expected.as_slice().ct_eq(tag)) {
            return Err(decryption_error("authentication tag mismatch"));
        }

        Aes256CbcDec::new(&enc_key.into(), &iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| decryption_error("invalid padding"))
    }

    pub fn open(&self, kind: SecretKind, sealed: &str) -> KeeperResult<Plaintext> {
        let bytes = self.open_bytes(kind, sealed)?;
        String::from_utf8(bytes)
            .map(Plaintext)
            .map_err(|_| decryption_error("secret is not valid UTF-8"))
    }

    /// Decrypt only to produce a masked rendering for display.
    pub fn masked(&self, kind: SecretKind, sealed: &str) -> KeeperResult<String> {
        Ok(mask(self.open(kind, sealed)?.expose()))
    }
}

impl fmt::Debug for Vault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vault")
            .field("key_version", &self.provider.current_version())
            .finish()
    }
}

/// 256 random bits, base64. Used for stanza cipher passphrases.
pub fn generate_passphrase() -> Plaintext {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    Plaintext(STANDARD.encode(bytes))
}

/// Database password drawn from the URL-safe base64 alphabet, so it can be
/// embedded in single-quoted SQL without escaping.
pub fn generate_password() -> Plaintext {
    let mut bytes = [0u8; 18];
    OsRng.fill_bytes(&mut bytes);
    Plaintext(URL_SAFE_NO_PAD.encode(bytes))
}

/// Keep the first and last two characters, star the rest.
pub fn mask(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len().max(4));
    }
    let head: String = chars[..2].iter().collect();
    let tail: String = chars[chars.len() - 2..].iter().collect();
    format!("{head}{}{tail}", "*".repeat(chars.len() - 4))
}

fn derive_keys(
    master: &[u8; MASTER_KEY_LEN],
    kind: SecretKind,
    salt: &[u8],
) -> KeeperResult<([u8; 32], [u8; 32])> {
    let derive = |purpose: &[u8]| -> KeeperResult<[u8; 32]> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(master)
            .map_err(|e| decryption_error(&e.to_string()))?;
        mac.update(purpose);
        mac.update(kind.label());
        mac.update(salt);
        let mut key = [0u8; 32];
        key.copy_from_slice(&mac.finalize().into_bytes());
        Ok(key)
    };
    Ok((derive(b"enc:")?, derive(b"mac:")?))
}

fn compute_tag(mac_key: &[u8; 32], data: &[u8]) -> KeeperResult<[u8; TAG_LEN]> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(mac_key)
        .map_err(|e| decryption_error(&e.to_string()))?;
    mac.update(data);
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&mac.finalize().into_bytes());
    Ok(tag)
}

fn decryption_error(msg: &str) -> KeeperError {
    KeeperError::CredentialDecryption(msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault() -> Vault {
        Vault::new(Arc::new(StaticKeyProvider::new([7u8; MASTER_KEY_LEN])))
    }

    #[test]
    fn encrypt_and_decrypt_roundtrip() {
        let vault = vault();
        let kinds = [
            SecretKind::CipherPassphrase,
            SecretKind::StorageSecret,
            SecretKind::DatabasePassword,
            SecretKind::SshPrivateKey,
        ];
        let inputs: Vec<Vec<u8>> = vec![
            Vec::new(),
            b"x".to_vec(),
            vec![0u8; 16],
            (0..=255u8).collect(),
            vec![0xA5; MAX_PLAINTEXT_LEN],
        ];
        for kind in kinds {
            for input in &inputs {
                let sealed = vault.seal(kind, input).expect("seal");
                assert_eq!(&vault.open_bytes(kind, &sealed).expect("open"), input);
            }
        }
    }

    #[test]
    fn same_plaintext_seals_differently() {
        let vault = vault();
        let a = vault.seal_str(SecretKind::StorageSecret, "s3cret").unwrap();
        let b = vault.seal_str(SecretKind::StorageSecret, "s3cret").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn oversized_secret_is_rejected() {
        let err = vault()
            .seal(SecretKind::SshPrivateKey, &vec![1u8; MAX_PLAINTEXT_LEN + 1])
            .unwrap_err();
        assert!(matches!(err, KeeperError::Configuration(_)));
    }

    #[test]
    fn decrypt_rejects_wrong_key() {
        let sealed = vault().seal_str(SecretKind::DatabasePassword, "hello").unwrap();
        let other = Vault::new(Arc::new(StaticKeyProvider::new([8u8; MASTER_KEY_LEN])));
        let err = other.open(SecretKind::DatabasePassword, &sealed).unwrap_err();
        assert!(matches!(err, KeeperError::CredentialDecryption(_)));
    }

    #[test]
    fn decrypt_rejects_kind_mismatch_and_tampering() {
        let vault = vault();
        let sealed = vault.seal_str(SecretKind::CipherPassphrase, "pass").unwrap();
        assert!(vault.open(SecretKind::StorageSecret, &sealed).is_err());

        let mut raw = STANDARD.decode(&sealed).unwrap();
        let mid = raw.len() / 2;
        raw[mid] ^= 0x01;
        let tampered = STANDARD.encode(raw);
        assert!(vault.open(SecretKind::CipherPassphrase, &tampered).is_err());
        assert!(vault.open(SecretKind::CipherPassphrase, "AAAA").is_err());
    }

    #[test]
    fn plaintext_is_redacted_in_debug() {
        let p = Plaintext::new("hunter2");
        assert_eq!(format!("{p:?}"), "Plaintext(<redacted>)");
        assert_eq!(format!("{p}"), "<redacted>");
    }

    #[test]
    fn masking_keeps_only_edges() {
        assert_eq!(mask("AKIAABCDEFGH"), "AK********GH");
        assert_eq!(mask("short"), "*****");
        assert_eq!(mask(""), "****");
    }

    #[test]
    fn generated_passphrase_is_256_bits() {
        let p = generate_passphrase();
        assert_eq!(STANDARD.decode(p.expose()).unwrap().len(), 32);
        assert!(
            generate_password()
                .expose()
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        );
    }
}
