use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

use age::x25519;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chacha20poly1305::{
    aead::{Aead, KeyInit, OsRng},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::RngCore;
use tracing::trace;
use zeroize::{ZeroizeOnDrop, Zeroizing};

use super::model::Seal;
use crate::error::{Result, VaultError};

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// 32-byte server key for the symmetric mode.
#[derive(ZeroizeOnDrop)]
pub struct EncryptionKey([u8; KEY_LEN]);

impl EncryptionKey {
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

/// Generate a fresh random server key.
pub fn generate_key() -> EncryptionKey {
    let mut key = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut key);
    EncryptionKey(key)
}

/// Wrap raw key bytes. Anything but exactly 32 bytes is rejected.
pub fn load_key(bytes: &[u8]) -> Result<EncryptionKey> {
    let key: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
        VaultError::Config(format!(
            "encryption key must be {KEY_LEN} bytes, got {}",
            bytes.len()
        ))
    })?;
    Ok(EncryptionKey(key))
}

/// Base64 text form written to key files.
pub fn encode_key(key: &EncryptionKey) -> String {
    BASE64.encode(key.as_bytes())
}

/// Read a base64 key file, trimming surrounding whitespace.
/// Missing, empty or malformed files are configuration errors.
pub fn read_key_file(path: &Path) -> Result<EncryptionKey> {
    let content = Zeroizing::new(std::fs::read_to_string(path).map_err(|e| {
        VaultError::Config(format!("read key file {}: {e}", path.display()))
    })?);
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(VaultError::Config(format!(
            "key file is empty: {}",
            path.display()
        )));
    }
    let raw = Zeroizing::new(BASE64.decode(trimmed).map_err(|e| {
        VaultError::Config(format!("key file {} is not base64: {e}", path.display()))
    })?);
    load_key(&raw)
}

/// How `Vault::create` should seal a payload.
#[derive(Clone)]
pub enum CipherMode {
    /// Authenticated encryption under the server key.
    Symmetric,
    /// age encryption to the caller's public key. The server keeps no way
    /// to open the result.
    Recipient(x25519::Recipient),
    /// The payload is already ciphertext produced by the client.
    Presealed,
}

impl CipherMode {
    pub fn seal_kind(&self) -> Seal {
        match self {
            CipherMode::Symmetric => Seal::Symmetric,
            CipherMode::Recipient(_) => Seal::Recipient,
            CipherMode::Presealed => Seal::Client,
        }
    }
}

impl std::fmt::Debug for CipherMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CipherMode::Symmetric => f.write_str("Symmetric"),
            CipherMode::Recipient(r) => write!(f, "Recipient({r})"),
            CipherMode::Presealed => f.write_str("Presealed"),
        }
    }
}

/// Parse an `age1...` public key.
pub fn parse_recipient(key: &str) -> Result<x25519::Recipient> {
    key.trim()
        .parse::<x25519::Recipient>()
        .map_err(|_| VaultError::InvalidPayload("public key is not a valid age recipient".into()))
}

/// Seals and unseals payloads. Cheap to clone; the key is shared.
#[derive(Clone)]
pub struct CipherProvider {
    key: Arc<EncryptionKey>,
}

impl CipherProvider {
    pub fn new(key: EncryptionKey) -> Self {
        Self { key: Arc::new(key) }
    }

    /// Seal `plaintext` according to `mode`.
    pub fn seal(&self, plaintext: &[u8], mode: &CipherMode) -> Result<(Seal, Vec<u8>)> {
        let ciphertext = match mode {
            CipherMode::Symmetric => encrypt(&self.key, plaintext)?,
            CipherMode::Recipient(recipient) => encrypt_to(recipient, plaintext)?,
            CipherMode::Presealed => plaintext.to_vec(),
        };
        trace!(
            mode = ?mode.seal_kind(),
            ciphertext_len = ciphertext.len(),
            "sealed payload"
        );
        Ok((mode.seal_kind(), ciphertext))
    }

    /// Open a symmetric ciphertext. Any failure is an integrity error.
    pub fn unseal(&self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        decrypt(&self.key, ciphertext)
    }
}

/// Encrypt with ChaCha20-Poly1305, returning `nonce || ciphertext+tag`.
fn encrypt(key: &EncryptionKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from(nonce_bytes);

    let sealed = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| VaultError::StorageFailure(format!("encrypt: {e}")))?;

    let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&sealed);
    Ok(out)
}

fn decrypt(key: &EncryptionKey, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    if ciphertext.len() < NONCE_LEN {
        return Err(VaultError::IntegrityError);
    }
    let (nonce_bytes, sealed) = ciphertext.split_at(NONCE_LEN);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));

    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), sealed)
        .map(Zeroizing::new)
        .map_err(|_| VaultError::IntegrityError)
}

/// age-encrypt to a single recipient with ASCII armor. Also used by
/// clients sealing locally before upload.
pub fn encrypt_to(recipient: &x25519::Recipient, plaintext: &[u8]) -> Result<Vec<u8>> {
    let encryptor =
        age::Encryptor::with_recipients(std::iter::once(recipient as &dyn age::Recipient))
            .map_err(seal_err)?;

    let mut out = Vec::new();
    let armor = age::armor::ArmoredWriter::wrap_output(&mut out, age::armor::Format::AsciiArmor)
        .map_err(seal_err)?;
    let mut writer = encryptor.wrap_output(armor).map_err(seal_err)?;
    writer.write_all(plaintext).map_err(seal_err)?;
    writer
        .finish()
        .and_then(|armor| armor.finish())
        .map_err(seal_err)?;
    Ok(out)
}

fn seal_err(e: impl std::fmt::Display) -> VaultError {
    VaultError::StorageFailure(format!("age seal: {e}"))
}

/// Client-side counterpart of the recipient mode: open an age ciphertext
/// (armored or binary) with the matching identity.
pub fn open_with_identity(
    ciphertext: &[u8],
    identity: &x25519::Identity,
) -> Result<Zeroizing<Vec<u8>>> {
    let reader = age::armor::ArmoredReader::new(ciphertext);
    let decryptor = age::Decryptor::new(reader).map_err(|_| VaultError::IntegrityError)?;
    let mut stream = decryptor
        .decrypt(std::iter::once(identity as &dyn age::Identity))
        .map_err(|_| VaultError::IntegrityError)?;

    let mut plaintext = Zeroizing::new(Vec::new());
    stream
        .read_to_end(&mut plaintext)
        .map_err(|_| VaultError::IntegrityError)?;
    Ok(plaintext)
}
