//! blogd-cli - Command-line interface for blogd
//!
//! Runs one blog operation per invocation, or the full `demo` walkthrough.

mod commands;

use blogd_client::{Client, ConnectionConfig};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::net::SocketAddr;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "blogd-cli")]
#[command(about = "Command-line interface for the blogd blog server")]
#[command(version)]
struct Cli {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:50051", env = "BLOGD_SERVER")]
    server: SocketAddr,

    /// Request timeout in seconds
    #[arg(long, default_value = "30")]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Ping the server
    Ping,

    /// Create a blog post
    Create {
        /// Author ID
        #[arg(short, long)]
        author: String,

        /// Title
        #[arg(short, long)]
        title: String,

        /// Content
        #[arg(short, long, default_value = "")]
        content: String,
    },

    /// Read a blog post
    Read {
        /// Blog ID (24 hex digits)
        id: String,
    },

    /// Replace author, title and content of a blog post
    Update {
        /// Blog ID (24 hex digits)
        id: String,

        /// Author ID
        #[arg(short, long)]
        author: String,

        /// Title
        #[arg(short, long)]
        title: String,

        /// Content
        #[arg(short, long, default_value = "")]
        content: String,
    },

    /// Delete a blog post
    Delete {
        /// Blog ID (24 hex digits)
        id: String,
    },

    /// List every blog post
    List {
        /// Print one JSON object per line
        #[arg(long)]
        json: bool,
    },

    /// Create, read, update, delete and list a sample post
    Demo,
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

    let config = ConnectionConfig::new(cli.server)
        .with_client_name("blogd-cli")
        .with_request_timeout(Duration::from_secs(cli.timeout));
    let client = Client::new(config);

    client.connect().await.map_err(|e| {
        eprintln!("{}: {}", "Connection failed".red(), e);
        e
    })?;
    tracing::debug!("Connected to {}", cli.server);

    let result = commands::execute(&client, cli.command).await;
    client.close().await?;

    match result {
        Ok(output) => {
            println!("{}", output);
            Ok(())
        }
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            std::process::exit(1);
        }
    }
}
