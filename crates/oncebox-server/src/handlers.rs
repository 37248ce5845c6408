use std::time::Instant;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};

use crate::{
    error::VaultError,
    handle::Handle,
    store::{
        crypto::{parse_recipient, CipherMode},
        NewSecret, Payload, Revealed, Vault,
    },
    AppState,
};

/// Largest accepted payload, before base64.
pub const MAX_PAYLOAD_BYTES: usize = 1_048_576;

// ── Health ────────────────────────────────────────────────────────────────────

pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

// ── Create ────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct FileUpload {
    /// Base64 file content.
    pub data: String,
    pub filename: String,
    pub media_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateRequest {
    pub text: Option<String>,
    pub file: Option<FileUpload>,
    pub password: Option<String>,
    /// age public key; the server seals to it and can't read the result.
    pub public_key: Option<String>,
    /// Base64 ciphertext the client sealed itself.
    pub ciphertext: Option<String>,
    /// Metadata for client-sealed files.
    pub filename: Option<String>,
    pub media_type: Option<String>,
}

impl CreateRequest {
    fn into_new_secret(self) -> Result<NewSecret, VaultError> {
        let invalid = |msg: &str| VaultError::InvalidPayload(msg.to_owned());

        if let Some(ciphertext) = self.ciphertext {
            if self.text.is_some() || self.file.is_some() || self.public_key.is_some() {
                return Err(invalid(
                    "ciphertext cannot be combined with text, file or public_key",
                ));
            }
            let bytes = decode_b64(&ciphertext)?;
            let payload = match self.filename {
                Some(filename) => Payload::File {
                    bytes,
                    filename,
                    media_type: self.media_type,
                },
                None => Payload::Text(String::from_utf8(bytes).map_err(|_| {
                    invalid("client-sealed text must be ASCII-armored; send a filename for binary")
                })?),
            };
            return Ok(NewSecret {
                payload: Some(payload),
                password: self.password,
                mode: CipherMode::Presealed,
            });
        }

        let payload = match (self.text, self.file) {
            (Some(_), Some(_)) => return Err(invalid("provide either text or file, not both")),
            (Some(text), None) => Some(Payload::Text(text)),
            (None, Some(file)) => Some(Payload::File {
                bytes: decode_b64(&file.data)?,
                filename: file.filename,
                media_type: file.media_type,
            }),
            (None, None) => None,
        };

        let mode = match self.public_key.as_deref() {
            Some(key) => CipherMode::Recipient(parse_recipient(key)?),
            None => CipherMode::Symmetric,
        };

        Ok(NewSecret {
            payload,
            password: self.password,
            mode,
        })
    }
}

fn decode_b64(data: &str) -> Result<Vec<u8>, VaultError> {
    let bytes = BASE64
        .decode(data.trim())
        .map_err(|_| VaultError::InvalidPayload("payload is not valid base64".into()))?;
    if bytes.len() > MAX_PAYLOAD_BYTES {
        return Err(VaultError::InvalidPayload("payload exceeds 1 MiB limit".into()));
    }
    Ok(bytes)
}

#[derive(Debug, Serialize)]
pub struct CreateResponse {
    pub handle: String,
    pub expires_at: DateTime<Utc>,
    pub expires_in: i64,
}

pub async fn create_secret(State(state): State<AppState>, body: Bytes) -> Response {
    let request: CreateRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => return bad_request(&format!("invalid request body: {e}")),
    };
    if request.text.as_ref().is_some_and(|t| t.len() > MAX_PAYLOAD_BYTES) {
        return error_response(VaultError::InvalidPayload(
            "payload exceeds 1 MiB limit".into(),
        ));
    }
    let secret = match request.into_new_secret() {
        Ok(s) => s,
        Err(e) => return error_response(e),
    };

    match run_blocking(&state, move |vault| vault.create(secret)).await {
        Ok(receipt) => {
            info!(handle = %receipt.handle, "secret created");
            let expires_in = (receipt.expires_at - state.vault.now()).num_seconds().max(0);
            (
                StatusCode::CREATED,
                Json(CreateResponse {
                    handle: receipt.handle.to_string(),
                    expires_at: receipt.expires_at,
                    expires_in,
                }),
            )
                .into_response()
        }
        Err(e) => error_response(e),
    }
}

// ── Peek ──────────────────────────────────────────────────────────────────────

pub async fn peek_secret(State(state): State<AppState>, Path(handle): Path<String>) -> Response {
    let Ok(handle) = handle.parse::<Handle>() else {
        return not_found_status();
    };

    match run_blocking(&state, move |vault| vault.peek(&handle)).await {
        Ok(Some(status)) => {
            let now = state.vault.now();
            Json(json!({
                "exists": true,
                "expires_at": status.expires_at,
                "expires_in": status.expires_in(now),
                "password_required": status.password_required,
                "payload_kind": status.kind.as_str(),
                "filename": status.kind.filename(),
                "media_type": status.kind.media_type(),
                "zero_knowledge": status.seal.is_zero_knowledge(),
            }))
            .into_response()
        }
        Ok(None) => not_found_status(),
        Err(e) => error_response(e),
    }
}

fn not_found_status() -> Response {
    (StatusCode::NOT_FOUND, Json(json!({"exists": false}))).into_response()
}

// ── Reveal ────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct RevealRequest {
    pub password: Option<String>,
}

pub async fn reveal_secret(
    State(state): State<AppState>,
    Path(handle): Path<String>,
    body: Bytes,
) -> Response {
    let Ok(handle) = handle.parse::<Handle>() else {
        return error_response(VaultError::NotFound);
    };
    let request: RevealRequest = if body.is_empty() {
        RevealRequest::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(r) => r,
            Err(e) => return bad_request(&format!("invalid request body: {e}")),
        }
    };

    // The deadline is enforced at the consumption point inside the vault, so
    // the task is awaited to the end: a payload that was taken is never lost
    // to a timeout.
    let deadline = Instant::now() + state.op_timeout;
    let vault = state.vault.clone();
    let task = tokio::task::spawn_blocking(move || {
        vault.reveal_within(&handle, request.password.as_deref(), deadline)
    });
    let result = task
        .await
        .unwrap_or_else(|join| Err(VaultError::StorageFailure(format!("vault task failed: {join}"))));

    match result {
        Ok(revealed) => {
            info!(handle = %handle, "secret revealed");
            Json(revealed_json(revealed)).into_response()
        }
        Err(e) => error_response(e),
    }
}

fn revealed_json(revealed: Revealed) -> serde_json::Value {
    match revealed {
        Revealed::Text(text) => json!({"kind": "text", "text": text}),
        Revealed::File {
            bytes,
            filename,
            media_type,
        } => json!({
            "kind": "file",
            "data": BASE64.encode(bytes),
            "filename": filename,
            "media_type": media_type,
        }),
        Revealed::Sealed { ciphertext, kind } => json!({
            "kind": "sealed",
            "ciphertext": BASE64.encode(ciphertext),
            "payload_kind": kind.as_str(),
            "filename": kind.filename(),
            "media_type": kind.media_type(),
        }),
    }
}

// ── Prune ─────────────────────────────────────────────────────────────────────

pub async fn prune_secrets(State(state): State<AppState>) -> Response {
    match run_blocking(&state, |vault| vault.prune()).await {
        Ok(pruned) => {
            info!(pruned = pruned.len(), "manual prune");
            Json(json!({"pruned": pruned.len()})).into_response()
        }
        Err(e) => error_response(e),
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Run a non-consuming vault operation on the blocking pool, bounded by the
/// configured operation timeout. Overrunning it is a storage failure.
async fn run_blocking<T, F>(state: &AppState, op: F) -> Result<T, VaultError>
where
    T: Send + 'static,
    F: FnOnce(Vault) -> Result<T, VaultError> + Send + 'static,
{
    let vault = state.vault.clone();
    let task = tokio::task::spawn_blocking(move || op(vault));
    match tokio::time::timeout(state.op_timeout, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => Err(VaultError::StorageFailure(format!("vault task failed: {join}"))),
        Err(_) => Err(VaultError::StorageFailure(format!(
            "operation exceeded {:?}",
            state.op_timeout
        ))),
    }
}

fn bad_request(msg: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({"error": msg}))).into_response()
}

fn error_response(e: VaultError) -> Response {
    match e {
        VaultError::InvalidPayload(msg) => bad_request(&msg),
        VaultError::NotFound | VaultError::IntegrityError => {
            if matches!(e, VaultError::IntegrityError) {
                warn!("secret failed integrity check on reveal");
            }
            (
                StatusCode::NOT_FOUND,
                Json(json!({"error": "secret not found or expired"})),
            )
                .into_response()
        }
        VaultError::Forbidden => (
            StatusCode::FORBIDDEN,
            Json(json!({"error": "password required or incorrect"})),
        )
            .into_response(),
        VaultError::StorageFailure(_) => {
            error!(error = %e, "storage failure");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"error": "storage unavailable, try again"})),
            )
                .into_response()
        }
        VaultError::Config(_) => {
            error!(error = %e, "internal error");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "internal server error"})),
            )
                .into_response()
        }
    }
}
