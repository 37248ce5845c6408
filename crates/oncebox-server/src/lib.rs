pub mod auth;
pub mod dirs;
pub mod error;
pub mod handle;
pub mod handlers;
pub mod server;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

/// Shared application state threaded through axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub vault: store::Vault,
    /// Bearer token for admin routes (`/prune`). `None` leaves them open.
    pub admin_token: Option<Arc<str>>,
    /// Upper bound on a single vault operation.
    pub op_timeout: Duration,
}

pub use error::{Result, VaultError};
pub use handle::Handle;
pub use server::{build_vault, router, run, ServerConfig};
