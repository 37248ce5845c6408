use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    auth::require_admin,
    dirs,
    handlers::{create_secret, health, peek_secret, prune_secrets, reveal_secret, MAX_PAYLOAD_BYTES},
    store::{crypto, open_backend, AccessGate, BackendKind, CipherProvider, GateParams, Vault},
    AppState,
};

const MIN_TTL: Duration = Duration::from_secs(1);
const MAX_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Base64 inflates by 4/3; leave headroom for the JSON envelope.
const MAX_BODY_BYTES: usize = MAX_PAYLOAD_BYTES * 2;

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: Option<PathBuf>,
    /// Base64 key file; defaults to `<data_dir>/oncebox.key`.
    pub key_file: Option<PathBuf>,
    pub backend: BackendKind,
    /// Lifetime of every secret.
    pub ttl: Duration,
    pub sweep_interval: Duration,
    pub admin_token: Option<String>,
    pub cors_origins: Option<String>,
    pub op_timeout: Duration,
    pub gate: GateParams,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            data_dir: None,
            key_file: None,
            backend: BackendKind::Redb,
            ttl: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(60),
            admin_token: None,
            cors_origins: None,
            op_timeout: Duration::from_secs(5),
            gate: GateParams::default(),
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `ONCEBOX_*` environment variables. A variable
    /// that is set but malformed is an error, never a silent default.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut cfg = Self::default();
        let duration = |var: &str| -> Result<Option<Duration>> {
            lookup(var)
                .map(|v| {
                    humantime::parse_duration(v.trim())
                        .with_context(|| format!("{var}: invalid duration {v:?}"))
                })
                .transpose()
        };

        if let Some(host) = lookup("ONCEBOX_HOST") {
            cfg.host = host;
        }
        if let Some(port) = lookup("ONCEBOX_PORT") {
            cfg.port = port
                .trim()
                .parse()
                .with_context(|| format!("ONCEBOX_PORT: invalid port {port:?}"))?;
        }
        cfg.data_dir = lookup("ONCEBOX_DATA_DIR").map(PathBuf::from);
        cfg.key_file = lookup("ONCEBOX_KEY_FILE").map(PathBuf::from);
        if let Some(backend) = lookup("ONCEBOX_BACKEND") {
            cfg.backend = backend.parse().context("ONCEBOX_BACKEND")?;
        }
        if let Some(ttl) = duration("ONCEBOX_TTL")? {
            cfg.ttl = ttl;
        }
        if let Some(interval) = duration("ONCEBOX_SWEEP_INTERVAL")? {
            cfg.sweep_interval = interval;
        }
        if let Some(timeout) = duration("ONCEBOX_OP_TIMEOUT")? {
            cfg.op_timeout = timeout;
        }
        cfg.admin_token = lookup("ONCEBOX_ADMIN_TOKEN").filter(|t| !t.is_empty());
        cfg.cors_origins = lookup("ONCEBOX_CORS_ORIGINS");
        Ok(cfg)
    }

    /// Reject settings the vault can't honour.
    pub fn validate(&self) -> Result<()> {
        if self.ttl < MIN_TTL || self.ttl > MAX_TTL {
            anyhow::bail!(
                "ttl must be between {} and {}, got {}",
                humantime::format_duration(MIN_TTL),
                humantime::format_duration(MAX_TTL),
                humantime::format_duration(self.ttl)
            );
        }
        if self.sweep_interval.is_zero() {
            anyhow::bail!("sweep interval must be non-zero");
        }
        if self.op_timeout.is_zero() {
            anyhow::bail!("operation timeout must be non-zero");
        }
        Ok(())
    }
}

/// Open the configured backend and wire up the vault.
/// The server key must already exist: see `oncebox keygen`.
pub fn build_vault(cfg: &ServerConfig, data_dir: &Path) -> Result<Vault> {
    let key_path = dirs::key_file(cfg.key_file.as_deref(), data_dir);
    let key = crypto::read_key_file(&key_path).with_context(|| {
        format!(
            "load server key from {} (generate one with `oncebox keygen`)",
            key_path.display()
        )
    })?;

    let backend = open_backend(cfg.backend, data_dir)
        .with_context(|| format!("open {} backend", cfg.backend))?;
    let gate = AccessGate::new(cfg.gate).context("access gate parameters")?;

    Vault::new(backend, CipherProvider::new(key), gate, cfg.ttl).context("build vault")
}

/// Assemble the HTTP router over `state`.
pub fn router(state: AppState, cors_origins: Option<&str>) -> Router {
    let public = Router::new()
        .route("/health", get(health))
        .route("/secrets", post(create_secret))
        .route("/secrets/{handle}", get(peek_secret))
        .route("/secrets/{handle}/reveal", post(reveal_secret));

    let admin = Router::new()
        .route("/prune", post(prune_secrets))
        .layer(middleware::from_fn_with_state(state.clone(), require_admin));

    Router::new()
        .merge(public)
        .merge(admin)
        .with_state(state)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(build_cors(cors_origins))
        .layer(TraceLayer::new_for_http())
}

pub async fn run(cfg: ServerConfig) -> Result<()> {
    cfg.validate()?;

    let data_dir = dirs::data_dir(cfg.data_dir.as_deref())?;
    info!(data_dir = %data_dir.display(), backend = %cfg.backend, "using data directory");

    let vault = build_vault(&cfg, &data_dir)?;
    info!(
        ttl = %humantime::format_duration(cfg.ttl),
        sweep = %humantime::format_duration(cfg.sweep_interval),
        "vault ready"
    );

    vault.clone().spawn_sweep(cfg.sweep_interval);

    let state = AppState {
        vault,
        admin_token: cfg.admin_token.map(Arc::from),
        op_timeout: cfg.op_timeout,
    };
    let app = router(state, cfg.cors_origins.as_deref());

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid host/port")?;

    info!(%addr, "oncebox server listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind listener")?;

    axum::serve(listener, app).await.context("server error")
}

fn build_cors(origins: Option<&str>) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([http::Method::GET, http::Method::POST, http::Method::OPTIONS])
        .allow_headers(Any);

    match origins {
        Some(o) => {
            let origins: Vec<_> = o.split(',').filter_map(|s| s.trim().parse().ok()).collect();
            cors.allow_origin(origins)
        }
        None => cors.allow_origin(Any),
    }
}
