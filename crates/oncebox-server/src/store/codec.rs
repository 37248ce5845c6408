//! On-disk representation of a [`SecretRecord`].
//!
//! Records are JSON documents tagged with a format version `v`. Fields this
//! build doesn't know about are ignored, so a newer writer's records can
//! still be served while their TTL runs out. A record written by a newer
//! *format version* is refused outright.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::model::{PayloadKind, Seal, SecretRecord, DEFAULT_MEDIA_TYPE};
use crate::error::{Result, VaultError};

/// Current record format version.
pub const RECORD_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum KindTag {
    Text,
    File,
}

#[derive(Serialize, Deserialize)]
struct RecordDoc {
    #[serde(default = "legacy_version")]
    v: u32,
    ciphertext: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    #[serde(default)]
    password_hash: Option<String>,
    payload_kind: KindTag,
    #[serde(default)]
    filename: Option<String>,
    #[serde(default)]
    media_type: Option<String>,
    #[serde(default)]
    seal: Seal,
}

fn legacy_version() -> u32 {
    1
}

/// Serialize a record for the backend.
pub fn encode(record: &SecretRecord) -> Result<Vec<u8>> {
    let doc = RecordDoc {
        v: RECORD_VERSION,
        ciphertext: BASE64.encode(&record.ciphertext),
        created_at: record.created_at,
        expires_at: record.expires_at,
        password_hash: record.password_hash.clone(),
        payload_kind: match record.kind {
            PayloadKind::Text => KindTag::Text,
            PayloadKind::File { .. } => KindTag::File,
        },
        filename: record.kind.filename().map(str::to_owned),
        media_type: record.kind.media_type().map(str::to_owned),
        seal: record.seal,
    };
    serde_json::to_vec(&doc).map_err(|e| VaultError::StorageFailure(format!("encode record: {e}")))
}

/// Parse and validate backend bytes.
pub fn decode(bytes: &[u8]) -> Result<SecretRecord> {
    let doc: RecordDoc = serde_json::from_slice(bytes)
        .map_err(|e| VaultError::StorageFailure(format!("decode record: {e}")))?;

    if doc.v > RECORD_VERSION {
        return Err(VaultError::StorageFailure(format!(
            "record format v{} is newer than supported v{RECORD_VERSION}",
            doc.v
        )));
    }
    if doc.expires_at < doc.created_at {
        return Err(VaultError::StorageFailure(
            "record expires before it was created".into(),
        ));
    }

    let ciphertext = BASE64
        .decode(doc.ciphertext.as_bytes())
        .map_err(|e| VaultError::StorageFailure(format!("record ciphertext: {e}")))?;

    let kind = match doc.payload_kind {
        KindTag::Text => PayloadKind::Text,
        KindTag::File => PayloadKind::File {
            filename: doc
                .filename
                .filter(|f| !f.is_empty())
                .ok_or_else(|| VaultError::StorageFailure("file record without filename".into()))?,
            media_type: doc
                .media_type
                .unwrap_or_else(|| DEFAULT_MEDIA_TYPE.to_owned()),
        },
    };

    Ok(SecretRecord {
        ciphertext,
        seal: doc.seal,
        kind,
        created_at: doc.created_at,
        expires_at: doc.expires_at,
        password_hash: doc.password_hash,
    })
}
