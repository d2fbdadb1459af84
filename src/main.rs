//! muxis - Command-line client for RESP servers
//!
//! Provides both a REPL and one-shot command execution.

mod commands;
mod repl;

use clap::{Parser, Subcommand};
use colored::Colorize;
use commands::Output;
use muxis_client::{ClientSettings, Command, ConnectionConfig, ProtocolSetting};
use std::io::BufRead;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "muxis")]
#[command(about = "Command-line client for RESP key/value servers")]
#[command(version)]
struct Cli {
    /// Server address (host:port, unix:/path or redis://host:port/db)
    #[arg(short, long, env = "MUXIS_ADDR")]
    server: Option<String>,

    /// Settings file (YAML)
    #[arg(short, long, env = "MUXIS_CONFIG")]
    config: Option<PathBuf>,

    /// ACL username
    #[arg(short, long, env = "MUXIS_USERNAME")]
    user: Option<String>,

    /// Password
    #[arg(short = 'a', long, env = "MUXIS_PASSWORD")]
    password: Option<String>,

    /// Logical database
    #[arg(short = 'n', long, env = "MUXIS_DB")]
    db: Option<u32>,

    /// Negotiate RESP3 with HELLO
    #[arg(short = '3', long)]
    resp3: bool,

    /// Print replies as JSON
    #[arg(long)]
    json: bool,

    // ===== TLS Options =====
    /// Enable TLS connection
    #[arg(long)]
    tls: bool,

    /// Path to CA certificate for server verification
    #[arg(long, env = "MUXIS_TLS_CA_CERT")]
    ca_cert: Option<PathBuf>,

    /// Path to client certificate (for mTLS)
    #[arg(long)]
    client_cert: Option<PathBuf>,

    /// Path to client private key (for mTLS)
    #[arg(long)]
    client_key: Option<PathBuf>,

    /// Skip server certificate verification (INSECURE)
    #[arg(long, short = 'k')]
    insecure: bool,

    /// Server name for TLS SNI (defaults to server hostname)
    #[arg(long)]
    server_name: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start interactive REPL
    Repl,

    /// Run one command
    Exec {
        /// Command name followed by its arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Run commands read from stdin (one per line) as a single pipeline
    Pipe,

    /// Run commands read from stdin (one per line) as a MULTI/EXEC transaction
    Tx {
        /// Keys to WATCH before queueing
        #[arg(long, value_delimiter = ',')]
        watch: Vec<String>,
    },

    /// Subscribe to channels and print messages until Ctrl+C
    Subscribe {
        #[arg(required = true)]
        channels: Vec<String>,
    },

    /// Subscribe to glob patterns and print messages until Ctrl+C
    Psubscribe {
        #[arg(required = true)]
        patterns: Vec<String>,
    },

    /// Publish a message
    Publish { channel: String, message: String },
}

impl Cli {
    /// Layers command line flags over file and environment settings.
    fn connection_config(&self) -> Result<ConnectionConfig, Box<dyn std::error::Error>> {
        let mut settings = match &self.config {
            Some(path) => ClientSettings::from_file(path)?,
            None => ClientSettings::load()?,
        };

        if let Some(ref server) = self.server {
            settings.address = server.clone();
        }
        if self.user.is_some() {
            settings.username = self.user.clone();
        }
        if self.password.is_some() {
            settings.password = self.password.clone();
        }
        if self.db.is_some() {
            settings.database = self.db;
        }
        if self.resp3 {
            settings.protocol = ProtocolSetting::Resp3;
        }
        if settings.client_name.is_none() {
            settings.client_name = Some("muxis-cli".to_string());
        }

        if self.tls || self.ca_cert.is_some() || self.client_cert.is_some() || self.insecure {
            settings.tls.enabled = true;
        }
        if self.ca_cert.is_some() {
            settings.tls.ca_cert = self.ca_cert.clone();
        }
        if self.client_cert.is_some() || self.client_key.is_some() {
            settings.tls.client_cert = self.client_cert.clone();
            settings.tls.client_key = self.client_key.clone();
        }
        if self.insecure {
            settings.tls.insecure = true;
        }
        if self.server_name.is_some() {
            settings.tls.server_name = self.server_name.clone();
        }

        // the CLI never needs more than one pooled connection
        settings.pool_size = 1;

        Ok(settings.into_connection_config()?)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let output = Output { json: cli.json };

    let config = match cli.connection_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            std::process::exit(1);
        }
    };

    tracing::debug!(
        endpoint = %config.endpoint,
        protocol = ?config.protocol,
        "resolved connection settings"
    );

    let result = match cli.command {
        Some(Commands::Repl) | None => repl::run(config, output).await,
        Some(command) => run_command(config, output, command).await,
    };

    if let Err(e) = result {
        eprintln!("{}: {}", "Error".red(), e);
        std::process::exit(1);
    }

    Ok(())
}

async fn run_command(
    config: ConnectionConfig,
    output: Output,
    command: Commands,
) -> Result<(), Box<dyn std::error::Error>> {
    let client = muxis_client::Client::connect(config).await?;

    match command {
        Commands::Repl => unreachable!(),

        Commands::Exec { args } => {
            let cmd = commands::to_command(&args).ok_or("missing command name")?;
            println!("{}", output.result(client.command(cmd).await)?);
        }

        Commands::Pipe => {
            let pipeline = read_stdin_commands()?.into_iter().collect();
            let replies = client.execute(pipeline).await?;
            println!("{}", output.replies(&replies));
        }

        Commands::Tx { watch } => {
            let queued = read_stdin_commands()?;
            let mut tx = client.transaction().await?;
            if !watch.is_empty() {
                tx.watch(watch).await?;
            }
            for cmd in queued {
                tx.queue(cmd);
            }
            println!("{}", output.transaction(&tx.commit().await?));
        }

        Commands::Subscribe { channels } => {
            let sub = client.subscribe(channels).await?;
            repl::follow(sub, output).await?;
        }

        Commands::Psubscribe { patterns } => {
            let sub = client.psubscribe(patterns).await?;
            repl::follow(sub, output).await?;
        }

        Commands::Publish { channel, message } => {
            let receivers = client.publish(&channel, message).await?;
            println!("{}", output.reply(&Ok(receivers.into())));
        }
    }

    client.close().await?;
    Ok(())
}

/// Reads one command per non-empty stdin line.
fn read_stdin_commands() -> Result<Vec<Command>, Box<dyn std::error::Error>> {
    let mut commands = Vec::new();
    for (n, line) in std::io::stdin().lock().lines().enumerate() {
        let words = commands::split_line(&line?).map_err(|e| format!("line {}: {}", n + 1, e))?;
        if let Some(cmd) = commands::to_command(&words) {
            commands.push(cmd);
        }
    }
    Ok(commands)
}
