//! Pluggable key-value persistence for encoded records.
//!
//! Every mutation that decides a record's fate goes through [`Backend::take_if`]:
//! lookup, test and delete happen in one critical section, so a reveal and a
//! sweep racing on the same handle have exactly one winner.

use std::collections::HashMap;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use tracing::debug;

use super::codec;
use crate::error::{Result, VaultError};

/// Key-value contract consumed by the vault.
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Store a new entry. Fails if `key` is already present.
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Atomically remove and return the entry if `predicate` accepts its
    /// current bytes. `None` if absent or rejected.
    fn take_if(&self, key: &str, predicate: &dyn Fn(&[u8]) -> bool) -> Result<Option<Vec<u8>>>;

    /// All entries, in no particular order.
    fn scan(&self) -> Result<Vec<(String, Vec<u8>)>>;

    /// Get-and-delete in one step.
    fn take(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.take_if(key, &|_| true)
    }

    /// Delete the entry only if it decodes to a record expired at `now`.
    /// Undecodable entries are left alone.
    fn delete_if_expired(&self, key: &str, now: DateTime<Utc>) -> Result<bool> {
        let taken = self.take_if(key, &|raw| {
            codec::decode(raw)
                .map(|record| record.is_expired(now))
                .unwrap_or(false)
        })?;
        Ok(taken.is_some())
    }
}

/// Which backend to open at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Memory,
    Fs,
    Redb,
}

impl FromStr for BackendKind {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" | "mem" => Ok(BackendKind::Memory),
            "fs" | "files" | "dir" => Ok(BackendKind::Fs),
            "redb" | "db" => Ok(BackendKind::Redb),
            other => Err(VaultError::Config(format!(
                "unknown backend '{other}' (expected redb, fs or memory)"
            ))),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendKind::Memory => "memory",
            BackendKind::Fs => "fs",
            BackendKind::Redb => "redb",
        })
    }
}

/// Open the configured backend under `data_dir`.
pub fn open_backend(kind: BackendKind, data_dir: &Path) -> Result<Arc<dyn Backend>> {
    Ok(match kind {
        BackendKind::Memory => Arc::new(MemoryBackend::default()),
        BackendKind::Fs => Arc::new(FsBackend::open(data_dir.join("secrets"))?),
        BackendKind::Redb => Arc::new(RedbBackend::open(&data_dir.join("oncebox.db"))?),
    })
}

fn duplicate(key: &str) -> VaultError {
    VaultError::StorageFailure(format!("entry already exists: {key}"))
}

// ── Memory ───────────────────────────────────────────────────────────────────

/// Process-local map behind a mutex. Contents vanish on restart.
#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    fn entries(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>>> {
        self.entries
            .lock()
            .map_err(|_| VaultError::StorageFailure("memory backend lock poisoned".into()))
    }
}

impl Backend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut entries = self.entries()?;
        if entries.contains_key(key) {
            return Err(duplicate(key));
        }
        entries.insert(key.to_owned(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries()?.get(key).cloned())
    }

    fn take_if(&self, key: &str, predicate: &dyn Fn(&[u8]) -> bool) -> Result<Option<Vec<u8>>> {
        let mut entries = self.entries()?;
        match entries.get(key) {
            Some(value) if predicate(value) => Ok(entries.remove(key)),
            _ => Ok(None),
        }
    }

    fn scan(&self) -> Result<Vec<(String, Vec<u8>)>> {
        Ok(self
            .entries()?
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

// ── Directory of files ───────────────────────────────────────────────────────

const RECORD_EXT: &str = "json";

/// One `<key>.json` file per record. Writes land via temp file + rename;
/// mutations are serialized by a lock, so a single process must own the
/// directory.
pub struct FsBackend {
    dir: PathBuf,
    mutation: Mutex<()>,
}

impl FsBackend {
    pub fn open(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir)
            .map_err(|e| VaultError::StorageFailure(format!("create {}: {e}", dir.display())))?;
        Ok(Self {
            dir,
            mutation: Mutex::new(()),
        })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || !key.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(VaultError::StorageFailure(format!("invalid key: {key:?}")));
        }
        Ok(self.dir.join(format!("{key}.{RECORD_EXT}")))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.mutation
            .lock()
            .map_err(|_| VaultError::StorageFailure("fs backend lock poisoned".into()))
    }
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(VaultError::StorageFailure(format!(
            "read {}: {e}",
            path.display()
        ))),
    }
}

/// Write `value` to `tmp`, then rename it over `path`. On failure the temp
/// file is removed.
fn write_via_temp(tmp: &Path, path: &Path, value: &[u8]) -> Result<()> {
    let written = std::fs::write(tmp, value).and_then(|()| std::fs::rename(tmp, path));
    if let Err(e) = written {
        let _ = std::fs::remove_file(tmp);
        return Err(VaultError::StorageFailure(format!(
            "write {}: {e}",
            path.display()
        )));
    }
    Ok(())
}

impl Backend for FsBackend {
    fn name(&self) -> &'static str {
        "fs"
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        let tmp = self.dir.join(format!(".{key}.tmp"));
        let _guard = self.lock()?;
        if path.exists() {
            return Err(duplicate(key));
        }
        write_via_temp(&tmp, &path, value)?;
        debug!(path = %path.display(), "wrote record file");
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        read_optional(&self.path_for(key)?)
    }

    fn take_if(&self, key: &str, predicate: &dyn Fn(&[u8]) -> bool) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        let _guard = self.lock()?;
        let Some(bytes) = read_optional(&path)? else {
            return Ok(None);
        };
        if !predicate(&bytes) {
            return Ok(None);
        }
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(VaultError::storage(e)),
        }
    }

    fn scan(&self) -> Result<Vec<(String, Vec<u8>)>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.dir).map_err(VaultError::storage)? {
            let path = entry.map_err(VaultError::storage)?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
                continue;
            }
            let Some(key) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            // A concurrent take may remove the file between listing and reading.
            if let Some(bytes) = read_optional(&path)? {
                out.push((key.to_owned(), bytes));
            }
        }
        Ok(out)
    }
}

// ── redb ─────────────────────────────────────────────────────────────────────

const SECRETS: TableDefinition<&str, &[u8]> = TableDefinition::new("secrets");

/// Single-file embedded database. Each mutation is one write transaction.
pub struct RedbBackend {
    db: Database,
}

impl RedbBackend {
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path)
            .map_err(|e| VaultError::StorageFailure(format!("open {}: {e}", path.display())))?;

        // Ensure the table exists so read transactions never see it missing.
        let init = || -> std::result::Result<(), redb::Error> {
            let write_txn = db.begin_write()?;
            write_txn.open_table(SECRETS)?;
            write_txn.commit()?;
            Ok(())
        };
        init().map_err(VaultError::storage)?;

        Ok(Self { db })
    }
}

impl Backend for RedbBackend {
    fn name(&self) -> &'static str {
        "redb"
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let write_txn = self.db.begin_write().map_err(VaultError::storage)?;
        {
            let mut table = write_txn.open_table(SECRETS).map_err(VaultError::storage)?;
            let exists = table.get(key).map_err(VaultError::storage)?.is_some();
            if exists {
                return Err(duplicate(key));
            }
            table.insert(key, value).map_err(VaultError::storage)?;
        }
        write_txn.commit().map_err(VaultError::storage)
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read().map_err(VaultError::storage)?;
        let table = read_txn.open_table(SECRETS).map_err(VaultError::storage)?;
        let value = table
            .get(key)
            .map_err(VaultError::storage)?
            .map(|guard| guard.value().to_vec());
        Ok(value)
    }

    fn take_if(&self, key: &str, predicate: &dyn Fn(&[u8]) -> bool) -> Result<Option<Vec<u8>>> {
        // redb allows one writer at a time; the whole check-and-remove sits
        // inside that transaction.
        let write_txn = self.db.begin_write().map_err(VaultError::storage)?;
        let taken = {
            let mut table = write_txn.open_table(SECRETS).map_err(VaultError::storage)?;

            // Copy out so the AccessGuard borrow on `table` ends before remove.
            let raw: Option<Vec<u8>> = table
                .get(key)
                .map_err(VaultError::storage)?
                .map(|guard| guard.value().to_vec());

            match raw {
                Some(bytes) if predicate(&bytes) => {
                    table.remove(key).map_err(VaultError::storage)?;
                    Some(bytes)
                }
                _ => None,
            }
        };
        write_txn.commit().map_err(VaultError::storage)?;
        Ok(taken)
    }

    fn scan(&self) -> Result<Vec<(String, Vec<u8>)>> {
        let read_txn = self.db.begin_read().map_err(VaultError::storage)?;
        let table = read_txn.open_table(SECRETS).map_err(VaultError::storage)?;
        let mut out = Vec::new();
        for item in table.iter().map_err(VaultError::storage)? {
            let (k, v) = item.map_err(VaultError::storage)?;
            out.push((k.value().to_owned(), v.value().to_vec()));
        }
        Ok(out)
    }
}
