//! syncwire-cli - Command-line interface for syncwire
//!
//! Provides both a REPL and one-shot command execution.

mod commands;
mod repl;

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::time::Duration;
use syncwire_broker::ClientTlsConfig;
use syncwire_client::{Client, ClientConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "syncwire-cli")]
#[command(about = "Command-line interface for the syncwire real-time CRUD engine")]
#[command(version)]
struct Cli {
    /// Broker address
    #[arg(short, long, default_value = "127.0.0.1:7411", env = "SYNCWIRE_SERVER")]
    server: String,

    /// Connection id (generated when omitted)
    #[arg(long, env = "SYNCWIRE_CONNECTION_ID")]
    id: Option<String>,

    /// Authentication token
    #[arg(short = 't', long, env = "SYNCWIRE_TOKEN")]
    token: Option<String>,

    /// Topic prefix the engine listens under
    #[arg(long, default_value = "syncwire")]
    prefix: String,

    /// Request timeout in seconds
    #[arg(long, default_value = "30")]
    timeout: u64,

    // ===== TLS Options =====
    /// Enable TLS connection
    #[arg(long, env = "SYNCWIRE_TLS")]
    tls: bool,

    /// Path to CA certificate for broker verification
    #[arg(long, env = "SYNCWIRE_CA_CERT")]
    ca_cert: Option<PathBuf>,

    /// Path to client certificate (for mTLS)
    #[arg(long, env = "SYNCWIRE_CLIENT_CERT")]
    client_cert: Option<PathBuf>,

    /// Path to client private key (for mTLS)
    #[arg(long, env = "SYNCWIRE_CLIENT_KEY")]
    client_key: Option<PathBuf>,

    /// Server name for TLS SNI (defaults to the broker hostname)
    #[arg(long)]
    server_name: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Start interactive REPL
    Repl,

    /// Ping the engine
    Ping,

    /// Read records (`schema.entity`)
    Read {
        target: String,

        /// Read a single record by primary key
        #[arg(long)]
        id: Option<String>,

        /// Filter as column:operator:value (repeatable)
        #[arg(short, long = "filter")]
        filters: Vec<String>,

        /// Sort as column[:asc|desc] (repeatable)
        #[arg(long = "sort")]
        sort: Vec<String>,

        #[arg(short, long)]
        limit: Option<u64>,

        #[arg(short, long)]
        offset: Option<u64>,

        /// Columns to return
        #[arg(short, long, value_delimiter = ',')]
        columns: Vec<String>,
    },

    /// Create a record
    Create {
        target: String,

        /// Record JSON (or @file.json to read from file)
        data: String,
    },

    /// Update a record
    Update {
        target: String,

        /// Primary key
        id: String,

        /// Changed fields JSON (or @file.json)
        data: String,
    },

    /// Delete a record
    Delete {
        target: String,

        /// Primary key
        id: String,
    },

    /// Show the entity descriptor and row count
    Meta { target: String },

    /// Subscribe to changes and print notifications until Ctrl+C
    Subscribe {
        target: String,

        /// Filter as column:operator:value (repeatable)
        #[arg(short, long = "filter")]
        filters: Vec<String>,
    },

    /// Generate SHA-256 hash of a token for config files
    HashToken {
        /// The token to hash
        token: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    // No broker connection needed
    if let Some(Commands::HashToken { token }) = &cli.command {
        println!("{}", commands::hash_token(token));
        return Ok(());
    }

    let tls = if cli.tls || cli.ca_cert.is_some() || cli.client_cert.is_some() {
        let mut tls = ClientTlsConfig {
            enabled: true,
            ca_cert_path: cli.ca_cert.clone(),
            server_name: cli.server_name.clone(),
            ..Default::default()
        };
        match (&cli.client_cert, &cli.client_key) {
            (Some(cert), Some(key)) => {
                tls.client_cert_path = Some(cert.clone());
                tls.client_key_path = Some(key.clone());
            }
            (None, None) => {}
            _ => {
                eprintln!(
                    "{}: --client-cert and --client-key must be used together",
                    "Error".red()
                );
                std::process::exit(1);
            }
        }
        Some(tls)
    } else {
        None
    };

    let mut config = match cli.id {
        Some(ref id) => ClientConfig::with_connection_id(cli.server.clone(), id.clone()),
        None => ClientConfig::new(cli.server.clone()),
    }
    .with_prefix(cli.prefix.clone())
    .with_request_timeout(Duration::from_secs(cli.timeout));
    if let Some(ref token) = cli.token {
        config = config.with_auth_token(token);
    }
    if let Some(tls) = tls {
        config = config.with_tls(tls);
    }
    let client = Client::new(config);

    match cli.command {
        Some(Commands::Repl) | None => {
            repl::run(client, &cli.server).await?;
        }
        Some(Commands::HashToken { .. }) => unreachable!(), // Already handled above
        Some(Commands::Subscribe { target, filters }) => {
            connect(&client).await?;
            let result = commands::watch(&client, &target, &filters).await;
            let _ = client.close().await;
            if let Err(e) = result {
                eprintln!("{}: {}", "Error".red(), e);
                std::process::exit(1);
            }
        }
        Some(cmd) => {
            connect(&client).await?;
            let result = commands::execute(&client, cmd).await;
            let _ = client.close().await;

            match result {
                Ok(output) => println!("{}", output),
                Err(e) => {
                    eprintln!("{}: {}", "Error".red(), e);
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}

async fn connect(client: &Client) -> Result<(), Box<dyn std::error::Error>> {
    tracing::debug!("Connecting as {}", client.connection_id());
    client.connect().await.map_err(|e| {
        eprintln!("{}: {}", "Connection failed".red(), e);
        e.into()
    })
}
