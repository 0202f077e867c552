use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use beatpool::config::Config;
use beatpool::heartbeat::HeartbeatDispatcher;
use beatpool::pool::ConnectionPool;
use beatpool::transport::{LoopbackTransport, TcpTransport, Transport};
use beatpool::utils::logging::init_logging;
use beatpool::utils::telemetry::{render, TelemetryFormat, TelemetrySnapshot};
use beatpool::HeartbeatMessage;

#[derive(Parser)]
#[command(name = "beatpool")]
#[command(about = "Pooled heartbeat publisher and message dispatcher", long_about = None)]
struct Cli {
    /// Config file (defaults to ~/.beatpool/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a publisher and a consumer in-process over the loopback transport
    Demo {
        /// Seconds between heartbeats
        #[arg(long, default_value_t = 1)]
        interval_secs: u64,
        /// Stop after this many seconds
        #[arg(long, default_value_t = 5)]
        duration_secs: u64,
        /// Telemetry output format (prometheus or json)
        #[arg(long, default_value = "prometheus")]
        format: TelemetryFormat,
    },
    /// Publish heartbeats to a TCP endpoint until Ctrl-C
    Publish {
        /// Endpoint address, e.g. 127.0.0.1:7070
        #[arg(long)]
        addr: String,
        /// Seconds between heartbeats (overrides config)
        #[arg(long)]
        interval_secs: Option<u64>,
    },
    /// Consume messages from a TCP endpoint until Ctrl-C
    Listen {
        /// Endpoint address, e.g. 127.0.0.1:7070
        #[arg(long)]
        addr: String,
    },
    /// Print the effective configuration
    Config,
    /// Show version information
    Version,
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    };
    config.context("Failed to load configuration")
}

fn log_heartbeat(msg: &HeartbeatMessage) -> beatpool::Result<()> {
    info!(
        id = msg.id(),
        created_at = %msg.created_at(),
        source = ?msg.get("source"),
        sequence = ?msg.get("sequence"),
        "Heartbeat received"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) | None => {
            println!("beatpool {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Config) => {
            let config = load_config(cli.config.as_ref())?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Some(Commands::Demo {
            interval_secs,
            duration_secs,
            format,
        }) => {
            let config = load_config(cli.config.as_ref())?;
            init_logging(&config.logging);
            run_demo(
                config,
                Duration::from_secs(interval_secs),
                Duration::from_secs(duration_secs),
                format,
            )
            .await?;
        }
        Some(Commands::Publish {
            addr,
            interval_secs,
        }) => {
            let mut config = load_config(cli.config.as_ref())?;
            init_logging(&config.logging);
            if let Some(secs) = interval_secs {
                config.heartbeat.publish_interval_secs = secs;
            }
            run_publish(config, &addr).await?;
        }
        Some(Commands::Listen { addr }) => {
            let config = load_config(cli.config.as_ref())?;
            init_logging(&config.logging);
            run_listen(config, &addr).await?;
        }
    }

    Ok(())
}

async fn run_demo(
    config: Config,
    interval: Duration,
    duration: Duration,
    format: TelemetryFormat,
) -> Result<()> {
    let pool = ConnectionPool::new(LoopbackTransport::new(), config.pool.clone());

    let consumer = Arc::new(HeartbeatDispatcher::consumer(
        pool.clone(),
        config.heartbeat.clone(),
    ));
    consumer.register_handler("heartbeat", log_heartbeat)?;
    let listener = {
        let consumer = Arc::clone(&consumer);
        tokio::spawn(async move { consumer.listen().await })
    };

    let publisher = HeartbeatDispatcher::publisher(pool.clone(), config.heartbeat.clone());
    publisher.start(interval).await?;

    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }

    publisher.stop();
    publisher.wait_stopped().await;
    // Let the consumer drain what is already queued.
    tokio::time::sleep(Duration::from_millis(100)).await;
    consumer.stop();
    listener.await.context("Consumer task panicked")??;

    let snapshot = TelemetrySnapshot::new(pool.stats(), pool.status().await)
        .with_dispatcher("publisher", publisher.stats())
        .with_dispatcher("consumer", consumer.stats());
    pool.shutdown().await;

    println!("{}", render(&snapshot, format));
    Ok(())
}

async fn run_publish(config: Config, addr: &str) -> Result<()> {
    let transport = TcpTransport::new(addr);
    info!(transport = transport.name(), addr, "Publishing heartbeats");
    let pool = ConnectionPool::new(transport, config.pool.clone());

    let publisher = HeartbeatDispatcher::publisher(pool.clone(), config.heartbeat.clone());
    publisher
        .start(config.heartbeat.publish_interval())
        .await
        .with_context(|| format!("Failed to start publisher for {}", addr))?;

    tokio::signal::ctrl_c().await?;
    publisher.stop();
    publisher.wait_stopped().await;
    pool.shutdown().await;

    let stats = publisher.stats();
    info!(
        published = stats.published,
        failures = stats.publish_failures,
        "Publisher finished"
    );
    Ok(())
}

async fn run_listen(config: Config, addr: &str) -> Result<()> {
    let pool = ConnectionPool::new(TcpTransport::new(addr), config.pool.clone());

    let consumer = HeartbeatDispatcher::consumer(pool.clone(), config.heartbeat.clone());
    consumer.register_handler("heartbeat", log_heartbeat)?;

    let listen = consumer.listen();
    tokio::pin!(listen);
    let result = tokio::select! {
        result = &mut listen => result,
        _ = tokio::signal::ctrl_c() => {
            consumer.stop();
            listen.await
        }
    };
    pool.shutdown().await;
    result.with_context(|| format!("Consumer on {} failed", addr))?;

    let stats = consumer.stats();
    info!(
        received = stats.received,
        dispatched = stats.dispatched,
        dropped = stats.dropped,
        "Consumer finished"
    );
    Ok(())
}
