//! Open Learn Grid Federation Service
//!
//! Runs the federation API and the background delivery and sync engines.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing::info;

use olg_core::config::{self, Config};
use olg_core::tracing_init::{default_filter, init_tracing};
use olg_crypto::SigningIdentity;
use olg_federation::FederationService;
use olg_federation::auth::{Capability, JwtManager, Principal};
use olg_federation::server;
use olg_federation::storage::FederationDatabase;
use olg_federation::transport::HttpTransport;

#[derive(Parser, Debug)]
#[command(name = "olg-federation")]
#[command(
    version,
    about = "Open Learn Grid federation service - registry, message queue, sync, audit"
)]
struct Cli {
    /// Explicit config file, layered over the global one.
    #[arg(long, global = true, env = "OLG_CONFIG")]
    config: Option<PathBuf>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the federation service.
    Serve(ServeArgs),

    /// Generate a new instance signing key.
    Keygen {
        /// Where to write the key. Defaults to the configured signing key path.
        #[arg(long)]
        out: Option<PathBuf>,

        /// Overwrite an existing key.
        #[arg(long)]
        force: bool,
    },

    /// Issue an admin bearer token.
    IssueToken {
        #[arg(long)]
        subject: String,

        #[arg(long)]
        username: String,

        /// Comma-separated capabilities.
        #[arg(long, value_delimiter = ',', default_value = "federation:admin")]
        capabilities: Vec<String>,

        #[command(flatten)]
        jwt: JwtArgs,
    },

    /// Walk the audit hash chain and report the first broken link.
    VerifyAudit {
        /// Path to SQLite database file.
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Address to listen on.
    #[arg(long)]
    addr: Option<SocketAddr>,

    /// Public domain of this instance.
    #[arg(long)]
    domain: Option<String>,

    /// Path to SQLite database file.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Path to the Ed25519 signing seed; generated on first start.
    #[arg(long)]
    signing_key: Option<PathBuf>,

    #[command(flatten)]
    jwt: JwtArgs,
}

#[derive(Args, Debug)]
struct JwtArgs {
    /// JWT secret key.
    #[arg(long, env = "OLG_JWT_SECRET", default_value = "dev-secret-change-me")]
    jwt_secret: String,

    /// Access token TTL in seconds.
    #[arg(long, default_value_t = 3600)]
    access_ttl: i64,
}

impl JwtArgs {
    fn manager(&self) -> JwtManager {
        JwtManager::new(self.jwt_secret.as_bytes(), self.access_ttl)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = config::load_config(cli.config.as_deref())?;

    init_tracing(
        &default_filter("olg-federation", &config.instance.log_level),
        cli.log_json,
    );

    match cli.command {
        Command::Serve(args) => {
            if let Some(addr) = args.addr {
                config.instance.listen_addr = addr;
            }
            if let Some(domain) = args.domain.clone() {
                config.instance.domain = domain;
            }
            if let Some(path) = args.db_path.clone() {
                config.instance.database_path = Some(path);
            }
            if let Some(path) = args.signing_key.clone() {
                config.instance.signing_key_path = Some(path);
            }
            serve(config, &args.jwt).await
        }
        Command::Keygen { out, force } => {
            let path = match out {
                Some(path) => path,
                None => signing_key_path(&config)?,
            };
            keygen(&path, force)
        }
        Command::IssueToken {
            subject,
            username,
            capabilities,
            jwt,
        } => issue_token(&subject, &username, &capabilities, &jwt),
        Command::VerifyAudit { db_path } => {
            let path = match db_path {
                Some(path) => path,
                None => database_path(&config)?,
            };
            verify_audit(&path).await
        }
    }
}

async fn serve(config: Config, jwt: &JwtArgs) -> anyhow::Result<()> {
    // reqwest is built with `rustls-no-provider`.
    let _ = rustls::crypto::ring::default_provider().install_default();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        domain = %config.instance.domain,
        addr = %config.instance.listen_addr,
        "Starting olg-federation"
    );

    let key_path = signing_key_path(&config)?;
    let identity = SigningIdentity::load_or_generate(&key_path)?;
    info!(
        path = %key_path.display(),
        fingerprint = %identity.fingerprint(),
        "Signing identity loaded"
    );

    let db_path = database_path(&config)?;
    info!(path = %db_path.display(), "Opening federation database");
    let db = FederationDatabase::open(&db_path).await?;

    let transport = Arc::new(HttpTransport::new(Duration::from_secs(
        config.delivery.send_timeout_secs,
    ))?);
    let addr = config.instance.listen_addr;
    let service = FederationService::new(config, db, identity, transport, jwt.manager());

    service.recover().await?;
    let background = service.spawn_background();

    server::serve(service, addr, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received shutdown signal");
    })
    .await?;

    background.shutdown().await;
    info!("Federation service stopped");
    Ok(())
}

#[allow(clippy::print_stdout)]
fn keygen(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists; pass --force to replace it",
            path.display()
        );
    }
    let identity = SigningIdentity::generate();
    identity.save_to_file(path)?;
    println!("Signing key written to {}", path.display());
    println!("Public key:  {}", identity.public_key_base64());
    println!("Fingerprint: {}", identity.fingerprint());
    Ok(())
}

#[allow(clippy::print_stdout)]
fn issue_token(
    subject: &str,
    username: &str,
    capabilities: &[String],
    jwt: &JwtArgs,
) -> anyhow::Result<()> {
    let capabilities = capabilities
        .iter()
        .map(|c| c.trim().parse::<Capability>())
        .collect::<Result<Vec<_>, _>>()?;
    let principal = Principal::new(subject, username, capabilities);
    let (token, ttl) = jwt.manager().issue_access_token(&principal)?;
    info!(subject, ttl, "Issued access token");
    println!("{token}");
    Ok(())
}

#[allow(clippy::print_stdout)]
async fn verify_audit(db_path: &Path) -> anyhow::Result<()> {
    let db = FederationDatabase::open(db_path).await?;
    let report = olg_federation::audit::AuditLog::new(db).verify_chain().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.is_intact() {
        anyhow::bail!("audit chain is broken");
    }
    Ok(())
}

fn signing_key_path(config: &Config) -> anyhow::Result<PathBuf> {
    match &config.instance.signing_key_path {
        Some(path) => Ok(path.clone()),
        None => default_path("signing.key"),
    }
}

fn database_path(config: &Config) -> anyhow::Result<PathBuf> {
    if let Some(path) = &config.instance.database_path {
        return Ok(path.clone());
    }
    match config::database_path() {
        Some(path) => Ok(path),
        None => default_path("federation.db"),
    }
}

fn default_path(file: &str) -> anyhow::Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Cannot determine home directory"))?;
    Ok(home.join(".olg-federation").join(file))
}
