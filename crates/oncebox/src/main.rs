use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use age::secrecy::ExposeSecret;
use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use clap::{Parser, Subcommand};
use oncebox_server::store::{crypto, BackendKind};
use reqwest::{Client, Response, StatusCode};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

// ── CLI definition ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "oncebox", about = "Oncebox: secrets that can be read once", version)]
struct Cli {
    /// Oncebox server URL
    #[arg(long, env = "ONCEBOX_SERVER", default_value = "http://localhost:8080")]
    server: String,

    /// Admin bearer token, only needed for `prune`
    #[arg(long, env = "ONCEBOX_ADMIN_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the Oncebox HTTP server
    Serve {
        #[arg(long, env = "ONCEBOX_PORT", default_value = "8080")]
        port: u16,
        #[arg(long, env = "ONCEBOX_HOST", default_value = "0.0.0.0")]
        host: String,
        #[arg(long, env = "ONCEBOX_DATA_DIR")]
        data_dir: Option<PathBuf>,
        #[arg(long, env = "ONCEBOX_KEY_FILE")]
        key_file: Option<PathBuf>,
        /// redb, fs or memory
        #[arg(long, env = "ONCEBOX_BACKEND")]
        backend: Option<String>,
        /// Secret lifetime, e.g. 15m, 1h, 2d
        #[arg(long, env = "ONCEBOX_TTL")]
        ttl: Option<String>,
        #[arg(long, env = "ONCEBOX_SWEEP_INTERVAL")]
        sweep_interval: Option<String>,
    },
    /// Write a fresh server key
    Keygen {
        /// Destination (default: <data dir>/oncebox.key)
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long, env = "ONCEBOX_DATA_DIR")]
        data_dir: Option<PathBuf>,
        /// Replace an existing key. Secrets sealed with the old key become unreadable.
        #[arg(long)]
        force: bool,
    },
    /// Generate an age identity for zero-knowledge sharing
    Identity {
        /// Where to write the identity (printed to stdout if omitted)
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Store a secret and print its one-time link
    Share {
        /// Secret text; `-` reads stdin
        #[arg(conflicts_with = "file")]
        text: Option<String>,
        /// Share a file instead of text
        #[arg(long)]
        file: Option<PathBuf>,
        #[arg(long)]
        media_type: Option<String>,
        /// Require this password to reveal
        #[arg(long, env = "ONCEBOX_PASSWORD")]
        password: Option<String>,
        /// age public key; only its holder can read the secret
        #[arg(long)]
        recipient: Option<String>,
        /// With --recipient, encrypt here instead of on the server
        #[arg(long, requires = "recipient")]
        local: bool,
    },
    /// Show whether a secret is still available, without consuming it
    Peek {
        /// Handle or full link
        handle: String,
    },
    /// Reveal (and destroy) a secret
    Reveal {
        /// Handle or full link
        handle: String,
        #[arg(long, env = "ONCEBOX_PASSWORD")]
        password: Option<String>,
        /// age identity file for zero-knowledge secrets
        #[arg(long)]
        identity: Option<PathBuf>,
        /// Write a revealed file here instead of its original name
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Delete all expired secrets immediately
    Prune,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if matches!(cli.command, Commands::Serve { .. }) {
        "info"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("ONCEBOX_LOG_LEVEL")
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Commands::Serve {
            port,
            host,
            data_dir,
            key_file,
            backend,
            ttl,
            sweep_interval,
        } => {
            let mut cfg = oncebox_server::ServerConfig::from_env()?;
            cfg.host = host;
            cfg.port = port;
            if data_dir.is_some() {
                cfg.data_dir = data_dir;
            }
            if key_file.is_some() {
                cfg.key_file = key_file;
            }
            if let Some(token) = cli.token.filter(|t| !t.is_empty()) {
                cfg.admin_token = Some(token);
            }
            if let Some(b) = backend {
                cfg.backend = b.parse::<BackendKind>()?;
            }
            if let Some(t) = ttl {
                cfg.ttl = parse_duration(&t)?;
            }
            if let Some(s) = sweep_interval {
                cfg.sweep_interval = parse_duration(&s)?;
            }
            oncebox_server::run(cfg).await
        }

        Commands::Keygen {
            out,
            data_dir,
            force,
        } => cmd_keygen(out, data_dir, force),

        Commands::Identity { out } => cmd_identity(out.as_deref()),

        Commands::Share {
            text,
            file,
            media_type,
            password,
            recipient,
            local,
        } => {
            let share = ShareArgs {
                text,
                file,
                media_type,
                password,
                recipient,
                local,
            };
            cmd_share(&cli.server, share).await
        }

        Commands::Peek { handle } => cmd_peek(&cli.server, &handle).await,

        Commands::Reveal {
            handle,
            password,
            identity,
            out,
        } => {
            cmd_reveal(
                &cli.server,
                &handle,
                password.as_deref(),
                identity.as_deref(),
                out.as_deref(),
            )
            .await
        }

        Commands::Prune => cmd_prune(&cli.server, cli.token.as_deref()).await,
    }
}

// ── Command implementations ───────────────────────────────────────────────────

fn cmd_keygen(out: Option<PathBuf>, data_dir: Option<PathBuf>, force: bool) -> Result<()> {
    let path = match out {
        Some(p) => p,
        None => {
            let dir = oncebox_server::dirs::data_dir(data_dir.as_deref())?;
            oncebox_server::dirs::key_file(None, &dir)
        }
    };
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists; pass --force to replace it",
            path.display()
        );
    }
    let key = crypto::generate_key();
    write_private(&path, &crypto::encode_key(&key))?;
    println!("wrote server key to {}", path.display());
    Ok(())
}

fn cmd_identity(out: Option<&Path>) -> Result<()> {
    let identity = age::x25519::Identity::generate();
    let recipient = identity.to_public();
    let secret = identity.to_string();
    let body = format!("# public key: {recipient}\n{}\n", secret.expose_secret());

    match out {
        Some(path) => {
            if path.exists() {
                anyhow::bail!("{} already exists", path.display());
            }
            write_private(path, &body)?;
            eprintln!("wrote identity to {}", path.display());
            println!("{recipient}");
        }
        None => print!("{body}"),
    }
    Ok(())
}

struct ShareArgs {
    text: Option<String>,
    file: Option<PathBuf>,
    media_type: Option<String>,
    password: Option<String>,
    recipient: Option<String>,
    local: bool,
}

async fn cmd_share(server: &str, args: ShareArgs) -> Result<()> {
    let body = share_body(args)?;

    let resp = Client::new()
        .post(format!("{}/secrets", server.trim_end_matches('/')))
        .json(&body)
        .send()
        .await
        .context("HTTP request failed")?;
    let json = expect_success(resp).await?;

    let handle = json["handle"].as_str().context("response has no handle")?;
    println!("{}/secrets/{handle}", server.trim_end_matches('/'));
    if let Some(secs) = json["expires_in"].as_u64() {
        eprintln!(
            "expires in {}",
            humantime::format_duration(Duration::from_secs(secs))
        );
    }
    Ok(())
}

/// Build the create request. Files are sent base64-encoded; with `--local`
/// the content is age-sealed here and the server only sees ciphertext.
fn share_body(args: ShareArgs) -> Result<Value> {
    let (content, filename) = match (args.text, args.file) {
        (_, Some(path)) => {
            let bytes =
                std::fs::read(&path).with_context(|| format!("read {}", path.display()))?;
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .context("file has no usable name")?
                .to_owned();
            (bytes, Some(name))
        }
        (Some(text), None) if text == "-" => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("read stdin")?;
            (buf.trim_end_matches('\n').as_bytes().to_vec(), None)
        }
        (Some(text), None) => (text.into_bytes(), None),
        (None, None) => anyhow::bail!("nothing to share: pass text, `-` or --file"),
    };

    let mut body = json!({ "password": args.password });

    if args.local {
        let key = args.recipient.as_deref().context("--local needs --recipient")?;
        let recipient = crypto::parse_recipient(key)?;
        // Sealed files carry base64 plaintext so every reveal decodes alike.
        let plaintext = match filename {
            Some(_) => BASE64.encode(&content).into_bytes(),
            None => content,
        };
        let sealed = crypto::encrypt_to(&recipient, &plaintext)?;
        body["ciphertext"] = json!(BASE64.encode(sealed));
        body["filename"] = json!(filename);
        body["media_type"] = json!(args.media_type);
        return Ok(body);
    }

    match filename {
        Some(name) => {
            body["file"] = json!({
                "data": BASE64.encode(&content),
                "filename": name,
                "media_type": args.media_type,
            });
        }
        None => {
            let text = String::from_utf8(content).context("secret text is not UTF-8")?;
            body["text"] = json!(text);
        }
    }
    if let Some(key) = args.recipient {
        body["public_key"] = json!(key);
    }
    Ok(body)
}

async fn cmd_peek(server: &str, handle: &str) -> Result<()> {
    let handle = handle_from(handle);
    let Some(json) = fetch_status(&Client::new(), server, handle).await? else {
        println!("not available (already revealed or expired)");
        return Ok(());
    };

    let kind = json["payload_kind"].as_str().unwrap_or("text");
    let secs = json["expires_in"].as_u64().unwrap_or(0);
    print!(
        "available: {kind}, expires in {}",
        humantime::format_duration(Duration::from_secs(secs))
    );
    if let Some(name) = json["filename"].as_str() {
        print!(", file {name}");
    }
    if json["password_required"].as_bool().unwrap_or(false) {
        print!(", password required");
    }
    if json["zero_knowledge"].as_bool().unwrap_or(false) {
        print!(", needs identity");
    }
    println!();
    Ok(())
}

/// Non-consuming status lookup. `None` when the server reports 404.
async fn fetch_status(client: &Client, server: &str, handle: &str) -> Result<Option<Value>> {
    let resp = client
        .get(format!("{}/secrets/{handle}", server.trim_end_matches('/')))
        .send()
        .await
        .context("HTTP request failed")?;
    if resp.status() == StatusCode::NOT_FOUND {
        return Ok(None);
    }
    expect_success(resp).await.map(Some)
}

async fn cmd_reveal(
    server: &str,
    handle: &str,
    password: Option<&str>,
    identity: Option<&Path>,
    out: Option<&Path>,
) -> Result<()> {
    let handle = handle_from(handle);
    let client = Client::new();

    // Everything that could make us throw the payload away is settled
    // before the reveal request consumes it.
    let status = fetch_status(&client, server, handle)
        .await?
        .context("secret not found (already revealed or expired)")?;
    let identity = match identity {
        Some(path) => Some(load_identity(path)?),
        None if status["zero_knowledge"].as_bool().unwrap_or(false) => {
            anyhow::bail!("secret is sealed to an age key; pass --identity")
        }
        None => None,
    };
    let target = if status["payload_kind"].as_str() == Some("file") {
        let path = output_path(status["filename"].as_str(), out);
        ensure_absent(&path)?;
        Some(path)
    } else {
        None
    };

    let resp = client
        .post(format!(
            "{}/secrets/{handle}/reveal",
            server.trim_end_matches('/')
        ))
        .json(&json!({ "password": password }))
        .send()
        .await
        .context("HTTP request failed")?;

    match resp.status() {
        StatusCode::FORBIDDEN => anyhow::bail!("password required or incorrect"),
        StatusCode::NOT_FOUND => anyhow::bail!("secret not found (already revealed or expired)"),
        _ => {}
    }
    let json = expect_success(resp).await?;

    if let Err(e) = deliver(&json, identity.as_ref(), target.as_deref()) {
        // The server copy is gone; hand over what we received.
        if let Some(raw) = rescue_payload(&json) {
            eprintln!("could not finish reveal: {e:#}");
            eprintln!("raw payload follows on stdout (base64 for files and ciphertext):");
            println!("{raw}");
        }
        return Err(e);
    }
    Ok(())
}

/// Print or save a revealed payload.
fn deliver(
    json: &Value,
    identity: Option<&age::x25519::Identity>,
    target: Option<&Path>,
) -> Result<()> {
    let dest = || {
        target
            .map(Path::to_owned)
            .unwrap_or_else(|| output_path(json["filename"].as_str(), None))
    };

    match json["kind"].as_str() {
        Some("text") => {
            println!("{}", json["text"].as_str().unwrap_or_default());
            Ok(())
        }
        Some("file") => {
            let data = BASE64
                .decode(json["data"].as_str().unwrap_or_default())
                .context("decode file data")?;
            save_file(&data, &dest())
        }
        Some("sealed") => {
            let identity = identity.context("secret is sealed to an age key; pass --identity")?;
            let ciphertext = BASE64
                .decode(json["ciphertext"].as_str().unwrap_or_default())
                .context("decode ciphertext")?;
            let plaintext = crypto::open_with_identity(&ciphertext, identity)
                .context("identity does not open this secret")?;

            if json["payload_kind"].as_str() == Some("file") {
                let data = BASE64
                    .decode(plaintext.as_slice())
                    .context("decode sealed file")?;
                save_file(&data, &dest())
            } else {
                let text = String::from_utf8(plaintext.to_vec()).context("secret is not UTF-8")?;
                println!("{text}");
                Ok(())
            }
        }
        other => anyhow::bail!("unexpected reveal kind: {other:?}"),
    }
}

/// The payload as received, for when it can't be delivered normally.
fn rescue_payload(json: &Value) -> Option<String> {
    let field = match json["kind"].as_str()? {
        "text" => "text",
        "file" => "data",
        _ => "ciphertext",
    };
    json[field].as_str().map(str::to_owned)
}

async fn cmd_prune(server: &str, token: Option<&str>) -> Result<()> {
    let mut req = Client::new().post(format!("{}/prune", server.trim_end_matches('/')));
    if let Some(token) = token {
        req = req.bearer_auth(token);
    }
    let resp = req.send().await.context("HTTP request failed")?;
    let json = expect_success(resp).await?;
    let n = json["pruned"].as_u64().unwrap_or(0);
    println!("pruned {n} expired secret(s)");
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

async fn expect_success(resp: Response) -> Result<Value> {
    let status = resp.status();
    let json: Value = resp.json().await.unwrap_or_default();
    if !status.is_success() {
        anyhow::bail!(
            "server returned {status}: {}",
            json["error"].as_str().unwrap_or("")
        );
    }
    Ok(json)
}

/// Accept either a bare handle or a link such as
/// `https://host/secrets/<handle>` (optionally ending in `/reveal`).
fn handle_from(arg: &str) -> &str {
    let trimmed = arg.trim().trim_end_matches('/');
    let trimmed = trimmed.strip_suffix("/reveal").unwrap_or(trimmed);
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

/// Parse human duration strings like "1h", "30m", "7d", "5s".
fn parse_duration(s: &str) -> Result<Duration> {
    humantime::parse_duration(s.trim()).with_context(|| format!("invalid duration: {s}"))
}

fn load_identity(path: &Path) -> Result<age::x25519::Identity> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("read identity {}", path.display()))?;
    content
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with('#'))
        .context("identity file is empty")?
        .parse::<age::x25519::Identity>()
        .map_err(|e| anyhow::anyhow!("invalid identity in {}: {e}", path.display()))
}

/// Where a revealed file goes: `--out`, else the server-supplied name reduced
/// to its last component in the current directory.
fn output_path(filename: Option<&str>, out: Option<&Path>) -> PathBuf {
    if let Some(p) = out {
        return p.to_owned();
    }
    filename
        .and_then(|n| Path::new(n).file_name())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("oncebox.bin"))
}

fn ensure_absent(path: &Path) -> Result<()> {
    if path.exists() {
        anyhow::bail!(
            "{} already exists; pass --out to choose another path",
            path.display()
        );
    }
    Ok(())
}

/// Write a revealed file without clobbering anything already on disk.
fn save_file(data: &[u8], path: &Path) -> Result<()> {
    ensure_absent(path)?;
    std::fs::write(path, data).with_context(|| format!("write {}", path.display()))?;
    eprintln!("wrote {} bytes to {}", data.len(), path.display());
    Ok(())
}

fn write_private(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create {}", parent.display()))?;
    }
    std::fs::write(path, contents).with_context(|| format!("write {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("chmod {}", path.display()))?;
    }
    Ok(())
}
