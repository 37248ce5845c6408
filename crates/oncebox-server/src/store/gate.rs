//! Password gate applied before a reveal.
//!
//! Passwords are hashed with Argon2id under a fresh random salt and stored
//! as PHC strings, so the cost parameters travel with each hash. Verification
//! re-derives the hash with the stored salt and parameters and compares the
//! outputs in constant time.

use argon2::{
    password_hash::{PasswordHash, PasswordHasher, SaltString},
    Algorithm, Argon2, Params, Version,
};
use chacha20poly1305::aead::OsRng;
use constant_time_eq::constant_time_eq;
use tracing::warn;
use zeroize::Zeroizing;

use crate::error::{Result, VaultError};

/// Minimum accepted memory cost in KiB.
const MIN_MEMORY_KIB: u32 = 8_192;

/// Argon2id cost parameters for newly created hashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for GateParams {
    fn default() -> Self {
        Self {
            memory_kib: 19_456,
            iterations: 2,
            parallelism: 1,
        }
    }
}

#[derive(Clone)]
pub struct AccessGate {
    params: Params,
}

impl AccessGate {
    pub fn new(gate: GateParams) -> Result<Self> {
        if gate.memory_kib < MIN_MEMORY_KIB {
            return Err(VaultError::Config(format!(
                "argon2 memory cost must be at least {MIN_MEMORY_KIB} KiB (got {})",
                gate.memory_kib
            )));
        }
        let params = Params::new(gate.memory_kib, gate.iterations, gate.parallelism, None)
            .map_err(|e| VaultError::Config(format!("argon2 params: {e}")))?;
        Ok(Self { params })
    }

    /// Hash `password` into a PHC string.
    pub fn hash(&self, password: &str) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone());
        argon2
            .hash_password(password.as_bytes(), &salt)
            .map(|h| h.to_string())
            .map_err(|e| VaultError::StorageFailure(format!("argon2 hash: {e}")))
    }

    /// Check `password` against a stored PHC string. A hash that can't be
    /// parsed never verifies.
    pub fn verify(&self, password: &str, stored: &str) -> bool {
        match rederive(password, stored) {
            Ok((candidate, expected)) => constant_time_eq(&candidate, &expected),
            Err(reason) => {
                warn!(%reason, "unusable password hash on record");
                false
            }
        }
    }
}

/// Recompute the hash of `password` using the salt and parameters embedded
/// in `stored`. Returns `(candidate, expected)` output bytes.
fn rederive(
    password: &str,
    stored: &str,
) -> std::result::Result<(Zeroizing<Vec<u8>>, Vec<u8>), String> {
    let parsed = PasswordHash::new(stored).map_err(|e| e.to_string())?;
    let algorithm = Algorithm::try_from(parsed.algorithm).map_err(|e| e.to_string())?;
    let version = parsed
        .version
        .map(Version::try_from)
        .transpose()
        .map_err(|e| e.to_string())?
        .unwrap_or_default();
    let expected = parsed
        .hash
        .ok_or("hash output missing")?
        .as_bytes()
        .to_vec();
    let salt = parsed.salt.ok_or("salt missing")?;

    // Output length comes from the stored hash.
    let params = Params::try_from(&parsed).map_err(|e| e.to_string())?;
    let argon2 = Argon2::new(algorithm, version, params);

    let mut salt_buf = [0u8; 64];
    let salt_bytes = salt.decode_b64(&mut salt_buf).map_err(|e| e.to_string())?;

    let mut candidate = Zeroizing::new(vec![0u8; expected.len()]);
    argon2
        .hash_password_into(password.as_bytes(), salt_bytes, &mut candidate)
        .map_err(|e| e.to_string())?;
    Ok((candidate, expected))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cheap_gate() -> AccessGate {
        AccessGate::new(GateParams {
            memory_kib: MIN_MEMORY_KIB,
            iterations: 1,
            parallelism: 1,
        })
        .unwrap()
    }

    #[test]
    fn correct_password_verifies() {
        let gate = cheap_gate();
        let hash = gate.hash("pw1").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(gate.verify("pw1", &hash));
    }

    #[test]
    fn wrong_password_fails() {
        let gate = cheap_gate();
        let hash = gate.hash("pw1").unwrap();
        assert!(!gate.verify("wrong", &hash));
        assert!(!gate.verify("", &hash));
    }

    #[test]
    fn hashes_are_salted() {
        let gate = cheap_gate();
        let a = gate.hash("same").unwrap();
        let b = gate.hash("same").unwrap();
        assert_ne!(a, b);
        assert!(gate.verify("same", &a));
        assert!(gate.verify("same", &b));
    }

    #[test]
    fn hash_verifies_under_different_gate_params() {
        let hash = cheap_gate().hash("pw").unwrap();
        let other = AccessGate::new(GateParams::default()).unwrap();
        assert!(other.verify("pw", &hash));
    }

    #[test]
    fn malformed_hash_never_verifies() {
        let gate = cheap_gate();
        assert!(!gate.verify("pw", "not-a-phc-string"));
        assert!(!gate.verify("pw", "$argon2id$v=19$m=8192,t=1,p=1$c2FsdHNhbHQ"));
    }

    #[test]
    fn rejects_weak_params() {
        let weak = GateParams {
            memory_kib: 1024,
            ..GateParams::default()
        };
        assert!(matches!(AccessGate::new(weak), Err(VaultError::Config(_))));
    }
}
