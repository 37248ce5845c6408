use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Media type assumed for uploads that don't declare one.
pub const DEFAULT_MEDIA_TYPE: &str = "application/octet-stream";

/// How a record's ciphertext was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Seal {
    /// Sealed with the server key; the server can unseal it.
    #[default]
    Symmetric,
    /// Sealed by the server to a caller-supplied age public key.
    Recipient,
    /// Sealed by the client before submission and stored verbatim.
    Client,
}

impl Seal {
    /// True when the server holds no key able to open the ciphertext.
    pub fn is_zero_knowledge(self) -> bool {
        !matches!(self, Seal::Symmetric)
    }
}

/// What the sealed payload represents. File metadata is not secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadKind {
    Text,
    File { filename: String, media_type: String },
}

impl PayloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadKind::Text => "text",
            PayloadKind::File { .. } => "file",
        }
    }

    pub fn filename(&self) -> Option<&str> {
        match self {
            PayloadKind::Text => None,
            PayloadKind::File { filename, .. } => Some(filename),
        }
    }

    pub fn media_type(&self) -> Option<&str> {
        match self {
            PayloadKind::Text => None,
            PayloadKind::File { media_type, .. } => Some(media_type),
        }
    }
}

/// The sole persisted entity. Its presence in the backend means it has
/// not been consumed yet; the handle is the backend key, not a field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretRecord {
    pub ciphertext: Vec<u8>,
    pub seal: Seal,
    pub kind: PayloadKind,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Argon2id PHC string. `None` means no password gate.
    pub password_hash: Option<String>,
}

impl SecretRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn status(&self) -> SecretStatus {
        SecretStatus {
            created_at: self.created_at,
            expires_at: self.expires_at,
            password_required: self.password_hash.is_some(),
            kind: self.kind.clone(),
            seal: self.seal,
        }
    }
}

/// Non-consuming view of a live record, used for the confirmation step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretStatus {
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub password_required: bool,
    pub kind: PayloadKind,
    pub seal: Seal,
}

impl SecretStatus {
    /// Whole seconds left before expiry, floored at zero.
    pub fn expires_in(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_seconds().max(0)
    }
}

/// Payload handed to `Vault::create`.
#[derive(Debug, Clone)]
pub enum Payload {
    Text(String),
    File {
        bytes: Vec<u8>,
        filename: String,
        media_type: Option<String>,
    },
}

/// Result of a successful reveal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Revealed {
    Text(String),
    File {
        bytes: Vec<u8>,
        filename: String,
        media_type: String,
    },
    /// Zero-knowledge record: ciphertext for the client to open.
    Sealed {
        ciphertext: Vec<u8>,
        kind: PayloadKind,
    },
}
