use std::cell::Cell;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use tracing::debug;
use zeroize::Zeroizing;

use super::backend::Backend;
use super::codec;
use super::crypto::{CipherMode, CipherProvider};
use super::gate::AccessGate;
use super::model::{
    Payload, PayloadKind, Revealed, Seal, SecretRecord, SecretStatus, DEFAULT_MEDIA_TYPE,
};
use crate::error::{Result, VaultError};
use crate::handle::Handle;

/// Source of "now". Swappable so expiry can be tested without sleeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
pub struct ManualClock(Mutex<DateTime<Utc>>);

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self(Mutex::new(start))
    }

    pub fn advance(&self, by: chrono::Duration) {
        if let Ok(mut now) = self.0.lock() {
            *now += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.0.lock().map(|now| *now).unwrap_or_else(|p| *p.into_inner())
    }
}

/// Input to [`Vault::create`].
#[derive(Debug, Clone)]
pub struct NewSecret {
    pub payload: Option<Payload>,
    pub password: Option<String>,
    pub mode: CipherMode,
}

impl NewSecret {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            payload: Some(Payload::Text(text.into())),
            password: None,
            mode: CipherMode::Symmetric,
        }
    }

    pub fn file(bytes: Vec<u8>, filename: impl Into<String>, media_type: Option<String>) -> Self {
        Self {
            payload: Some(Payload::File {
                bytes,
                filename: filename.into(),
                media_type,
            }),
            password: None,
            mode: CipherMode::Symmetric,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_mode(mut self, mode: CipherMode) -> Self {
        self.mode = mode;
        self
    }
}

/// What the caller gets back from a create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub handle: Handle,
    pub expires_at: DateTime<Utc>,
}

/// The vault state machine. Cheap to clone; all state lives in the backend.
#[derive(Clone)]
pub struct Vault {
    pub(crate) backend: Arc<dyn Backend>,
    cipher: CipherProvider,
    gate: AccessGate,
    ttl: chrono::Duration,
    clock: Arc<dyn Clock>,
}

impl Vault {
    pub fn new(
        backend: Arc<dyn Backend>,
        cipher: CipherProvider,
        gate: AccessGate,
        ttl: std::time::Duration,
    ) -> Result<Self> {
        let ttl = chrono::Duration::from_std(ttl)
            .ok()
            .filter(|d| *d > chrono::Duration::zero())
            .ok_or_else(|| VaultError::Config("TTL must be a positive duration".into()))?;
        Ok(Self {
            backend,
            cipher,
            gate,
            ttl,
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Seal and persist a new secret, returning its fresh handle.
    pub fn create(&self, secret: NewSecret) -> Result<Receipt> {
        let presealed = matches!(secret.mode, CipherMode::Presealed);
        let payload = secret.payload.ok_or_else(|| {
            VaultError::InvalidPayload("neither text nor file was provided".into())
        })?;

        let (kind, body) = match payload {
            Payload::Text(text) => {
                if text.is_empty() {
                    return Err(VaultError::InvalidPayload("secret text is empty".into()));
                }
                (PayloadKind::Text, Zeroizing::new(text.into_bytes()))
            }
            Payload::File {
                bytes,
                filename,
                media_type,
            } => {
                let filename = base_name(&filename);
                if filename.is_empty() {
                    return Err(VaultError::InvalidPayload("file has no name".into()));
                }
                let media_type = media_type
                    .map(|m| m.trim().to_owned())
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| DEFAULT_MEDIA_TYPE.to_owned());
                // Server-sealed files travel as base64 text so every payload is
                // a plain byte string; client-sealed files are already opaque.
                let bytes = Zeroizing::new(bytes);
                let body = if presealed {
                    bytes
                } else {
                    Zeroizing::new(BASE64.encode(bytes.as_slice()).into_bytes())
                };
                (
                    PayloadKind::File {
                        filename,
                        media_type,
                    },
                    body,
                )
            }
        };

        let password_hash = match secret.password.as_deref() {
            Some(pw) if !pw.is_empty() => Some(self.gate.hash(pw)?),
            _ => None,
        };

        let (seal, ciphertext) = self.cipher.seal(&body, &secret.mode)?;

        let created_at = self.now();
        let record = SecretRecord {
            ciphertext,
            seal,
            kind,
            created_at,
            expires_at: created_at + self.ttl,
            password_hash,
        };

        let handle = Handle::generate();
        self.backend
            .put(&handle.to_string(), &codec::encode(&record)?)?;

        debug!(
            handle = %handle,
            kind = record.kind.as_str(),
            seal = ?record.seal,
            gated = record.password_hash.is_some(),
            "stored secret"
        );
        Ok(Receipt {
            handle,
            expires_at: record.expires_at,
        })
    }

    /// Status of a live record without consuming it. Stale records are
    /// evicted and reported as absent.
    pub fn peek(&self, handle: &Handle) -> Result<Option<SecretStatus>> {
        let key = handle.to_string();
        let Some(raw) = self.backend.get(&key)? else {
            return Ok(None);
        };
        let record = codec::decode(&raw)?;
        let now = self.now();
        if record.is_expired(now) {
            self.evict_stale(&key, now)?;
            return Ok(None);
        }
        Ok(Some(record.status()))
    }

    /// Consume the secret behind `handle`.
    ///
    /// A wrong or missing password returns `Forbidden` and leaves the record
    /// in place. Of any number of concurrent callers, at most one succeeds;
    /// the rest see `NotFound`.
    pub fn reveal(&self, handle: &Handle, password: Option<&str>) -> Result<Revealed> {
        self.reveal_by(handle, password, None)
    }

    /// `reveal`, but refuse to consume the record once `deadline` has passed.
    ///
    /// Past the deadline the call fails with `StorageFailure` and the record
    /// stays stored. Once the take has happened the payload is always
    /// returned, however late.
    pub fn reveal_within(
        &self,
        handle: &Handle,
        password: Option<&str>,
        deadline: Instant,
    ) -> Result<Revealed> {
        self.reveal_by(handle, password, Some(deadline))
    }

    fn reveal_by(
        &self,
        handle: &Handle,
        password: Option<&str>,
        deadline: Option<Instant>,
    ) -> Result<Revealed> {
        let key = handle.to_string();
        let raw = self.backend.get(&key)?.ok_or(VaultError::NotFound)?;
        let record = codec::decode(&raw)?;

        let now = self.now();
        if record.is_expired(now) {
            self.evict_stale(&key, now)?;
            return Err(VaultError::NotFound);
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(deadline_exceeded());
        }

        if let Some(hash) = record.password_hash.as_deref() {
            let accepted = password.is_some_and(|pw| self.gate.verify(pw, hash));
            if !accepted {
                debug!(handle = %handle, "password rejected");
                return Err(VaultError::Forbidden);
            }
        }

        // Consumption point. Only the exact bytes verified above may be
        // taken, only while still inside the TTL, and only before the
        // caller's deadline.
        let expires_at = record.expires_at;
        let late = Cell::new(false);
        let taken = self.backend.take_if(&key, &|current| {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                late.set(true);
                return false;
            }
            current == raw.as_slice() && self.now() < expires_at
        })?;
        if late.get() {
            return Err(deadline_exceeded());
        }
        if taken.is_none() {
            self.evict_stale(&key, self.now())?;
            return Err(VaultError::NotFound);
        }
        debug!(handle = %handle, "consumed secret");

        self.open(record)
    }

    fn open(&self, record: SecretRecord) -> Result<Revealed> {
        if record.seal != Seal::Symmetric {
            return Ok(Revealed::Sealed {
                ciphertext: record.ciphertext,
                kind: record.kind,
            });
        }

        let plaintext = self.cipher.unseal(&record.ciphertext)?;
        match record.kind {
            PayloadKind::Text => String::from_utf8(plaintext.to_vec())
                .map(Revealed::Text)
                .map_err(|_| VaultError::IntegrityError),
            PayloadKind::File {
                filename,
                media_type,
            } => {
                let bytes = BASE64
                    .decode(plaintext.as_slice())
                    .map_err(|_| VaultError::IntegrityError)?;
                Ok(Revealed::File {
                    bytes,
                    filename,
                    media_type,
                })
            }
        }
    }
}

fn deadline_exceeded() -> VaultError {
    VaultError::StorageFailure("operation deadline exceeded before the secret was taken".into())
}

/// Strip any directory components a client may have sent with a filename.
fn base_name(filename: &str) -> String {
    filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim()
        .to_owned()
}


#[cfg(test)]
mod tests {
    use super::testing::{vault, vault_on};
    use super::*;
    use crate::store::backend::{FsBackend, RedbBackend};
    use crate::store::crypto::open_with_identity;
    use age::x25519;
    use chrono::Duration;

    fn stored_bytes(v: &Vault, handle: &Handle) -> Vec<u8> {
        v.backend.get(&handle.to_string()).unwrap().unwrap()
    }

    #[test]
    fn reveal_once_then_not_found() {
        let (v, _clock) = vault();
        let receipt = v.create(NewSecret::text("hi")).unwrap();
        assert_eq!(
            v.reveal(&receipt.handle, None).unwrap(),
            Revealed::Text("hi".into())
        );
        assert!(matches!(
            v.reveal(&receipt.handle, None),
            Err(VaultError::NotFound)
        ));
    }

    #[test]
    fn wrong_password_does_not_consume() {
        let (v, _clock) = vault();
        let h = v
            .create(NewSecret::text("secret").with_password("pw1"))
            .unwrap()
            .handle;

        assert!(matches!(v.reveal(&h, Some("wrong")), Err(VaultError::Forbidden)));
        assert!(matches!(v.reveal(&h, None), Err(VaultError::Forbidden)));
        assert_eq!(
            v.reveal(&h, Some("pw1")).unwrap(),
            Revealed::Text("secret".into())
        );
        assert!(matches!(v.reveal(&h, Some("pw1")), Err(VaultError::NotFound)));
    }

    #[test]
    fn empty_password_means_no_gate() {
        let (v, _clock) = vault();
        let h = v.create(NewSecret::text("open").with_password("")).unwrap().handle;
        assert!(!v.peek(&h).unwrap().unwrap().password_required);
        assert!(v.reveal(&h, None).is_ok());
    }

    #[test]
    fn expired_secret_is_not_found_even_with_password() {
        let (v, clock) = vault();
        let h = v
            .create(NewSecret::text("late").with_password("pw"))
            .unwrap()
            .handle;
        clock.advance(Duration::seconds(121));
        assert!(matches!(v.reveal(&h, Some("pw")), Err(VaultError::NotFound)));
        assert!(v.backend.get(&h.to_string()).unwrap().is_none());
    }

    #[test]
    fn expiry_is_exact_at_ttl_boundary() {
        let (v, clock) = vault();
        let h = v.create(NewSecret::text("edge")).unwrap().handle;
        clock.advance(Duration::seconds(119));
        assert!(v.peek(&h).unwrap().is_some());
        clock.advance(Duration::seconds(1));
        assert!(matches!(v.reveal(&h, None), Err(VaultError::NotFound)));
    }

    #[test]
    fn binary_file_round_trips_byte_exact() {
        let (v, _clock) = vault();
        let bytes: Vec<u8> = (0..=255u8).chain([0xff, 0xfe, 0x00, 0xc3]).collect();
        let h = v
            .create(NewSecret::file(bytes.clone(), "a.bin", None))
            .unwrap()
            .handle;
        assert_eq!(
            v.reveal(&h, None).unwrap(),
            Revealed::File {
                bytes,
                filename: "a.bin".into(),
                media_type: DEFAULT_MEDIA_TYPE.into(),
            }
        );
    }

    #[test]
    fn file_past_ttl_is_gone() {
        let (v, clock) = vault();
        let bytes: Vec<u8> = (1..=1000u32).map(|i| (i % 251) as u8).collect();
        let h = v
            .create(NewSecret::file(bytes, "a.bin", Some("application/x-a".into())))
            .unwrap()
            .handle;
        clock.advance(Duration::minutes(3));
        assert!(matches!(v.reveal(&h, None), Err(VaultError::NotFound)));
    }

    #[test]
    fn filename_is_reduced_to_base_name() {
        let (v, _clock) = vault();
        let h = v
            .create(NewSecret::file(vec![1], "../../etc/passwd", None))
            .unwrap()
            .handle;
        let status = v.peek(&h).unwrap().unwrap();
        assert_eq!(status.kind.filename(), Some("passwd"));
    }

    #[test]
    fn invalid_payloads_are_rejected() {
        let (v, _clock) = vault();
        let none = NewSecret {
            payload: None,
            password: None,
            mode: CipherMode::Symmetric,
        };
        assert!(matches!(v.create(none), Err(VaultError::InvalidPayload(_))));
        assert!(matches!(
            v.create(NewSecret::text("")),
            Err(VaultError::InvalidPayload(_))
        ));
        assert!(matches!(
            v.create(NewSecret::file(vec![1, 2], "  ", None)),
            Err(VaultError::InvalidPayload(_))
        ));
        assert!(v.backend.scan().unwrap().is_empty());
    }

    #[test]
    fn peek_does_not_consume_and_evicts_stale() {
        let (v, clock) = vault();
        let h = v
            .create(NewSecret::file(vec![9; 4], "k.pem", None).with_password("x"))
            .unwrap()
            .handle;

        let status = v.peek(&h).unwrap().unwrap();
        assert!(status.password_required);
        assert_eq!(status.kind.filename(), Some("k.pem"));
        assert!(v.peek(&h).unwrap().is_some());

        clock.advance(Duration::minutes(5));
        assert!(v.peek(&h).unwrap().is_none());
        assert!(v.backend.get(&h.to_string()).unwrap().is_none());
    }

    #[test]
    fn unknown_handle_is_not_found() {
        let (v, _clock) = vault();
        let h = Handle::generate();
        assert!(v.peek(&h).unwrap().is_none());
        assert!(matches!(v.reveal(&h, None), Err(VaultError::NotFound)));
    }

    #[test]
    fn stored_record_never_contains_plaintext() {
        let (v, _clock) = vault();
        let h = v
            .create(NewSecret::text("correct horse battery staple"))
            .unwrap()
            .handle;
        let stored = String::from_utf8_lossy(&stored_bytes(&v, &h)).into_owned();
        assert!(!stored.contains("correct horse"));
        assert!(!stored.contains(&BASE64.encode("correct horse battery staple")));
    }

    #[test]
    fn recipient_mode_is_zero_knowledge() {
        let (v, _clock) = vault();
        let identity = x25519::Identity::generate();
        let plaintext = "only the client can read this";
        let h = v
            .create(NewSecret::text(plaintext).with_mode(CipherMode::Recipient(identity.to_public())))
            .unwrap()
            .handle;

        let stored = stored_bytes(&v, &h);
        assert!(!String::from_utf8_lossy(&stored).contains(plaintext));

        let Revealed::Sealed { ciphertext, kind } = v.reveal(&h, None).unwrap() else {
            panic!("expected sealed payload");
        };
        assert_eq!(kind, PayloadKind::Text);
        assert_ne!(ciphertext, plaintext.as_bytes());
        let opened = open_with_identity(&ciphertext, &identity).unwrap();
        assert_eq!(opened.as_slice(), plaintext.as_bytes());
    }

    #[test]
    fn recipient_file_opens_to_base64_of_bytes() {
        let (v, _clock) = vault();
        let identity = x25519::Identity::generate();
        let bytes = vec![0u8, 1, 2, 250, 251, 252];
        let h = v
            .create(
                NewSecret::file(bytes.clone(), "blob.bin", None)
                    .with_mode(CipherMode::Recipient(identity.to_public())),
            )
            .unwrap()
            .handle;
        let Revealed::Sealed { ciphertext, .. } = v.reveal(&h, None).unwrap() else {
            panic!("expected sealed payload");
        };
        let opened = open_with_identity(&ciphertext, &identity).unwrap();
        assert_eq!(BASE64.decode(opened.as_slice()).unwrap(), bytes);
    }

    #[test]
    fn presealed_payload_is_returned_verbatim() {
        let (v, _clock) = vault();
        let blob = vec![0xde, 0xad, 0xbe, 0xef];
        let h = v
            .create(NewSecret::file(blob.clone(), "x.age", None).with_mode(CipherMode::Presealed))
            .unwrap()
            .handle;
        assert!(v.peek(&h).unwrap().unwrap().seal.is_zero_knowledge());
        assert_eq!(
            v.reveal(&h, None).unwrap(),
            Revealed::Sealed {
                ciphertext: blob,
                kind: PayloadKind::File {
                    filename: "x.age".into(),
                    media_type: DEFAULT_MEDIA_TYPE.into(),
                },
            }
        );
    }

    #[test]
    fn tampered_record_is_integrity_error_and_consumed() {
        let (v, _clock) = vault();
        let h = v.create(NewSecret::text("fragile")).unwrap().handle;
        let key = h.to_string();

        let mut record = codec::decode(&stored_bytes(&v, &h)).unwrap();
        let last = record.ciphertext.len() - 1;
        record.ciphertext[last] ^= 0x80;
        v.backend.take(&key).unwrap();
        v.backend.put(&key, &codec::encode(&record).unwrap()).unwrap();

        assert!(matches!(v.reveal(&h, None), Err(VaultError::IntegrityError)));
        assert!(matches!(v.reveal(&h, None), Err(VaultError::NotFound)));
    }

    #[test]
    fn concurrent_reveals_yield_exactly_one_success() {
        let dir = tempfile::tempdir().unwrap();
        let backends: Vec<Arc<dyn Backend>> = vec![
            Arc::new(crate::store::backend::MemoryBackend::default()),
            Arc::new(FsBackend::open(dir.path().join("fs")).unwrap()),
            Arc::new(RedbBackend::open(&dir.path().join("race.db")).unwrap()),
        ];
        for backend in backends {
            let (v, _clock) = vault_on(backend);
            let h = v
                .create(NewSecret::text("one winner").with_password("pw"))
                .unwrap()
                .handle;

            let results: Vec<Result<Revealed>> = std::thread::scope(|s| {
                let workers: Vec<_> = (0..8)
                    .map(|_| s.spawn(|| v.reveal(&h, Some("pw"))))
                    .collect();
                workers.into_iter().map(|w| w.join().unwrap()).collect()
            });

            let wins = results.iter().filter(|r| r.is_ok()).count();
            let misses = results
                .iter()
                .filter(|r| matches!(r, Err(VaultError::NotFound)))
                .count();
            assert_eq!((wins, misses), (1, 7), "{}", v.backend_name());
        }
    }

    /// Stalls inside `take_if` before looking at the entry.
    struct StallingTake {
        inner: crate::store::backend::MemoryBackend,
        stall: std::time::Duration,
    }

    impl Backend for StallingTake {
        fn name(&self) -> &'static str {
            "stalling"
        }
        fn put(&self, key: &str, value: &[u8]) -> Result<()> {
            self.inner.put(key, value)
        }
        fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            self.inner.get(key)
        }
        fn take_if(
            &self,
            key: &str,
            predicate: &dyn Fn(&[u8]) -> bool,
        ) -> Result<Option<Vec<u8>>> {
            std::thread::sleep(self.stall);
            self.inner.take_if(key, predicate)
        }
        fn scan(&self) -> Result<Vec<(String, Vec<u8>)>> {
            self.inner.scan()
        }
    }

    #[test]
    fn reveal_past_deadline_leaves_record_stored() {
        let (v, _clock) = vault();
        let h = v.create(NewSecret::text("not yet")).unwrap().handle;

        let result = v.reveal_within(&h, None, Instant::now());
        assert!(matches!(result, Err(VaultError::StorageFailure(_))));
        assert!(v.peek(&h).unwrap().is_some());

        let later = Instant::now() + std::time::Duration::from_secs(5);
        assert_eq!(
            v.reveal_within(&h, None, later).unwrap(),
            Revealed::Text("not yet".into())
        );
    }

    #[test]
    fn deadline_passing_inside_take_refuses_consumption() {
        let backend = Arc::new(StallingTake {
            inner: crate::store::backend::MemoryBackend::default(),
            stall: std::time::Duration::from_millis(100),
        });
        let (v, _clock) = vault_on(backend.clone());
        let h = v.create(NewSecret::text("slow lane")).unwrap().handle;

        let deadline = Instant::now() + std::time::Duration::from_millis(20);
        let result = v.reveal_within(&h, None, deadline);
        assert!(matches!(result, Err(VaultError::StorageFailure(_))));
        assert!(backend.inner.get(&h.to_string()).unwrap().is_some());
    }

    #[test]
    fn zero_ttl_is_a_config_error() {
        let result = Vault::new(
            Arc::new(crate::store::backend::MemoryBackend::default()),
            CipherProvider::new(crate::store::crypto::generate_key()),
            super::testing::cheap_gate(),
            std::time::Duration::ZERO,
        );
        assert!(matches!(result, Err(VaultError::Config(_))));
    }
}
