use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use wallet::{LoggingConfig, ReqwestHttpClient, RootError, Wallet, WalletConfig};
use wallet_core::{CredentialId, InMemoryCredentialStore, StorableCredential};
use wallet_keystore::UnlockMethodInfo;
use wallet_openid4vp::ResponseOutcome;

/// Credential wallet trust core: key custody and credential presentation.
#[derive(Parser, Debug)]
#[command(name = "wallet", version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a new key container protected by a password
    Init {
        #[arg(long)]
        password: String,
    },

    /// Unlock the container and show its unlock methods
    Unlock {
        #[arg(long)]
        password: String,
    },

    /// List credential keys
    Keys {
        #[arg(long)]
        password: String,
    },

    /// Generate credential keys
    NewKey {
        #[arg(long)]
        password: String,

        #[arg(long, default_value = "1")]
        count: usize,
    },

    /// Re-key the container under a fresh main key
    Rotate {
        #[arg(long)]
        password: String,
    },

    /// Generate a key and an OpenID4VCI proof of possession for it
    VciProof {
        #[arg(long)]
        password: String,

        #[arg(long)]
        nonce: String,

        #[arg(long)]
        audience: String,

        #[arg(long)]
        issuer: String,
    },

    /// Answer an OpenID4VP authorization request
    Present {
        #[arg(long)]
        password: String,

        /// The authorization request URL
        #[arg(long)]
        url: String,

        /// JSON file with an array of stored credentials
        #[arg(long)]
        credentials: PathBuf,

        /// Credential to present; defaults to the first conformant one
        #[arg(long)]
        credential: Option<String>,
    },

    /// Write a default configuration file
    ConfigInit,
}

fn init_tracing(logging: &LoggingConfig, verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("wallet=debug,wallet_keystore=debug,wallet_openid4vp=debug,wallet_mdoc=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.filter))
    };

    if logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

fn config_path(path: Option<&PathBuf>) -> PathBuf {
    path.cloned().unwrap_or_else(WalletConfig::default_config_path)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let path = config_path(cli.config.as_ref());
    let config = match WalletConfig::load(&path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };
    init_tracing(&config.logging, cli.verbose);

    if let Err(e) = run(cli.command, config, &path).await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(command: Commands, config: WalletConfig, path: &Path) -> Result<(), RootError> {
    match command {
        Commands::ConfigInit => cmd_config_init(&config, path),
        Commands::Init { password } => cmd_init(config, &password).await,
        Commands::Unlock { password } => cmd_unlock(config, &password).await,
        Commands::Keys { password } => cmd_keys(config, &password).await,
        Commands::NewKey { password, count } => cmd_new_key(config, &password, count).await,
        Commands::Rotate { password } => cmd_rotate(config, &password).await,
        Commands::VciProof {
            password,
            nonce,
            audience,
            issuer,
        } => cmd_vci_proof(config, &password, &nonce, &audience, &issuer).await,
        Commands::Present {
            password,
            url,
            credentials,
            credential,
        } => cmd_present(config, &password, &url, &credentials, credential).await,
    }
}

fn cmd_config_init(config: &WalletConfig, path: &Path) -> Result<(), RootError> {
    config.save(path)?;
    println!("Configuration written to {}", path.display());
    Ok(())
}

async fn cmd_init(config: WalletConfig, password: &str) -> Result<(), RootError> {
    let wallet = Wallet::open(config)?;
    wallet.init_password(password).await?;
    println!("Key container created.");
    println!(
        "  Container: {}",
        wallet.config().keystore.container_path.display()
    );
    Ok(())
}

async fn cmd_unlock(config: WalletConfig, password: &str) -> Result<(), RootError> {
    let wallet = Wallet::open(config)?;
    let unlocked = wallet.unlock(password).await?;
    println!("Unlocked (container version {}).", unlocked.version());
    for method in unlocked.unlock_methods() {
        match method {
            UnlockMethodInfo::Password => println!("  password"),
            UnlockMethodInfo::Prf {
                credential_id,
                transports,
            } => println!(
                "  passkey {} [{}]",
                hex::encode(credential_id),
                transports.join(", ")
            ),
        }
    }
    println!("  {} credential key(s)", unlocked.kids().len());
    Ok(())
}

async fn cmd_keys(config: WalletConfig, password: &str) -> Result<(), RootError> {
    let wallet = Wallet::open(config)?;
    let unlocked = wallet.unlock(password).await?;
    for kid in unlocked.kids() {
        let keypair = unlocked.keypair(&kid)?;
        println!("{}  {}", kid, keypair.did);
    }
    Ok(())
}

async fn cmd_new_key(config: WalletConfig, password: &str, count: usize) -> Result<(), RootError> {
    let wallet = Wallet::open(config)?;
    for kid in wallet.new_keys(password, count).await? {
        println!("{}", kid);
    }
    Ok(())
}

async fn cmd_rotate(config: WalletConfig, password: &str) -> Result<(), RootError> {
    let wallet = Wallet::open(config)?;
    let keys = wallet.rotate(password).await?;
    println!("Container rotated; {} credential key(s) carried over.", keys);
    Ok(())
}

async fn cmd_vci_proof(
    config: WalletConfig,
    password: &str,
    nonce: &str,
    audience: &str,
    issuer: &str,
) -> Result<(), RootError> {
    let wallet = Wallet::open(config)?;
    for proof in wallet
        .openid4vci_proofs(password, nonce, audience, issuer, 1)
        .await?
    {
        println!("{}", proof);
    }
    Ok(())
}

async fn cmd_present(
    config: WalletConfig,
    password: &str,
    url: &str,
    credentials_path: &Path,
    credential: Option<String>,
) -> Result<(), RootError> {
    let timeout = Duration::from_secs(config.openid4vp.http_timeout_secs);
    let wallet = Wallet::open(config)?;
    let stored: Vec<StorableCredential> =
        serde_json::from_slice(&std::fs::read(credentials_path).map_err(RootError::Io)?)?;
    info!(count = stored.len(), "credentials loaded");

    let http = Arc::new(ReqwestHttpClient::new(timeout)?);
    let credentials = Arc::new(InMemoryCredentialStore::with_credentials(stored));
    let (matched, outcome) = wallet
        .present(
            password,
            url,
            credential.map(CredentialId::new),
            http,
            credentials,
        )
        .await?;

    println!("Verifier: {}", matched.verifier_domain);
    println!("Requested: {}", matched.descriptor.requested_fields.join(", "));
    match outcome {
        ResponseOutcome::Sent { redirect_uri } => {
            println!("Presentation sent.");
            if let Some(uri) = redirect_uri {
                println!("  Continue at: {}", uri);
            }
        }
        ResponseOutcome::AlreadySent => println!("Presentation was already sent for this request."),
    }
    Ok(())
}
