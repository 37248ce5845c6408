use std::fmt;
use std::str::FromStr;

use rand::RngCore;

use crate::error::VaultError;

const HANDLE_BYTES: usize = 16;

/// Opaque 128-bit identifier addressing one secret record.
///
/// Rendered as 32 lowercase hex characters. Parsing is strict so a handle
/// can be used directly as a file name or table key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle([u8; HANDLE_BYTES]);

impl Handle {
    /// Draw a fresh handle from the OS random source.
    pub fn generate() -> Self {
        let mut bytes = [0u8; HANDLE_BYTES];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Handle(bytes)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for Handle {
    type Err = VaultError;

    /// Anything that is not exactly 32 lowercase hex chars is `NotFound`:
    /// a garbage handle is indistinguishable from one that never existed.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != HANDLE_BYTES * 2 || s.bytes().any(|b| b.is_ascii_uppercase()) {
            return Err(VaultError::NotFound);
        }
        let mut bytes = [0u8; HANDLE_BYTES];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| VaultError::NotFound)?;
        Ok(Handle(bytes))
    }
}
