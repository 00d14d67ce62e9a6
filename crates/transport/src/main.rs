//! nsq-cli
//!
//! Publish to and tail topics on a single nsqd.

use std::path::PathBuf;

use anyhow::Context;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use transport::{Config, Connection};

/// nsq-cli - publish to and tail topics on a single nsqd.
#[derive(Parser, Debug)]
#[command(name = "nsq-cli")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// nsqd host (overrides config)
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// nsqd TCP port (overrides config)
    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Publish one or more messages to a topic
    Publish {
        /// Topic to publish to
        topic: String,

        /// Message bodies; more than one is sent as a single MPUB
        #[arg(required = true)]
        messages: Vec<String>,
    },

    /// Subscribe to a channel and print message bodies
    Tail {
        /// Topic to subscribe to
        topic: String,

        /// Channel to subscribe to
        channel: String,

        /// Exit after this many messages
        #[arg(long, short = 'n')]
        count: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = match &cli.config {
        Some(config_path) => Config::load(config_path)?,
        None => Config::load_default()?,
    };
    config.apply_env_overrides();
    if let Some(host) = &cli.host {
        config.nsqd.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.nsqd.port = port;
    }
    config.validate()?;

    // Initialize tracing
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.client.log_level))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Publish { topic, messages } => publish(&config, topic, messages).await,
        Commands::Tail {
            topic,
            channel,
            count,
        } => tail(&config, topic, channel, count).await,
    }
}

async fn publish(config: &Config, topic: String, messages: Vec<String>) -> anyhow::Result<()> {
    let connection = Connection::open(
        config.nsqd.host.clone(),
        config.nsqd.port,
        config.connection_options(),
    )
    .await
    .with_context(|| format!("Failed to connect to {}:{}", config.nsqd.host, config.nsqd.port))?;

    let count = messages.len();
    if count == 1 {
        connection.publish(topic.clone(), messages.concat())?;
    } else {
        let bodies = messages.into_iter().map(Bytes::from).collect();
        connection.publish_batch(topic.clone(), bodies)?;
    }

    connection.close().await?;
    tracing::info!("Published {} message(s) to {}", count, topic);
    Ok(())
}

async fn tail(
    config: &Config,
    topic: String,
    channel: String,
    count: Option<u64>,
) -> anyhow::Result<()> {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let connection = Connection::subscribe(
        config.nsqd.host.clone(),
        config.nsqd.port,
        topic,
        channel,
        tx,
        config.connection_options(),
    )
    .await
    .with_context(|| format!("Failed to connect to {}:{}", config.nsqd.host, config.nsqd.port))?;

    let mut seen = 0u64;
    loop {
        let message = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, closing");
                break;
            }
            message = rx.recv() => match message {
                Some(message) => message,
                None => {
                    tracing::warn!("Connection gave up, no more messages");
                    break;
                }
            },
        };

        println!("{}", String::from_utf8_lossy(message.body()));
        if let Err(e) = message.finish() {
            tracing::warn!("Failed to finish message {}: {}", message.id(), e);
        }

        seen += 1;
        if count.is_some_and(|limit| seen >= limit) {
            break;
        }
    }

    connection.close().await?;
    Ok(())
}
