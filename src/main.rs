//! Multicom - Talk to small devices over UDP and BLE
//!
//! Discovers devices on the configured subnets and issues PING, GET, POST and
//! SEND requests from the command line.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use multicom::config::{self, Config};
use multicom::{Client, Device, RequestError, Session, UdpChannel};

/// Multicom - Device discovery and request/reply messaging
#[derive(Parser)]
#[command(name = "multicom")]
#[command(author = "Multicom Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Discover and talk to devices over UDP and BLE", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Subnet to broadcast into (CIDR), may be repeated. Overrides the config file.
    #[arg(short, long, global = true)]
    subnet: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover devices on all channels
    Discover {
        /// How long to wait for replies (seconds)
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Measure round trip time to a device
    Ping {
        /// Device id
        device: String,

        /// Number of pings
        #[arg(short = 'n', long, default_value_t = 4)]
        count: u32,
    },

    /// Read an endpoint
    Get {
        /// Device id
        device: String,

        /// Endpoint name
        endpoint: String,

        /// Request data
        #[arg(short, long, default_value = "")]
        data: String,
    },

    /// Write an endpoint and wait for the acknowledgement
    Post {
        /// Device id
        device: String,

        /// Endpoint name
        endpoint: String,

        /// Request data
        #[arg(short, long, default_value = "")]
        data: String,
    },

    /// Write an endpoint without waiting for an answer
    Send {
        /// Device id
        device: String,

        /// Endpoint name
        endpoint: String,

        /// Request data
        #[arg(short, long, default_value = "")]
        data: String,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };
    if !cli.subnet.is_empty() {
        config.udp.subnets = cli.subnet.clone();
    }

    // Initialize logging
    let filter = if cli.verbose || config.general.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match cli.command {
        Commands::Discover { timeout, json } => {
            let window = timeout.map(Duration::from_secs).unwrap_or(config.discovery.window());
            run_discovery(&config, window, json).await?;
        }
        Commands::Ping { device, count } => {
            let (_client, session) = open_session(&config, &device).await?;
            run_ping(&session, count).await;
        }
        Commands::Get { device, endpoint, data } => {
            let (_client, session) = open_session(&config, &device).await?;
            let value = session.get(&endpoint, &data).await?;
            println!("{}", value);
        }
        Commands::Post { device, endpoint, data } => {
            let (_client, session) = open_session(&config, &device).await?;
            session.post(&endpoint, &data).await?;
            println!("OK");
        }
        Commands::Send { device, endpoint, data } => {
            let (_client, session) = open_session(&config, &device).await?;
            session.send(&endpoint, &data).await?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
    }

    Ok(())
}

/// Create a client with one UDP channel per configured subnet
async fn build_client(config: &Config) -> anyhow::Result<Client> {
    let client = Client::with_session_config(config.session.clone());

    if config.udp.subnets.is_empty() {
        client.add_channel(UdpChannel::bind(&config.udp, None).await?);
    }
    for subnet in &config.udp.subnets {
        let channel = UdpChannel::bind(&config.udp, Some(subnet))
            .await
            .with_context(|| format!("Failed to open channel for {}", subnet))?;
        client.add_channel(channel);
    }

    if config.ble.enabled {
        tracing::warn!("BLE is enabled but this build has no BLE adapter, skipping");
    }

    Ok(client)
}

async fn discover(config: &Config, window: Duration) -> anyhow::Result<Client> {
    let client = build_client(config).await?;
    client.discover_wait(window).await;

    if let Some(ttl) = config.discovery.device_ttl() {
        client.evict_stale_devices(ttl);
    }
    Ok(client)
}

/// Discover, then open a session with `dev_id`.
///
/// The client is returned alongside the session since it owns the dispatch
/// task that delivers replies.
async fn open_session(config: &Config, dev_id: &str) -> anyhow::Result<(Client, Session)> {
    let client = discover(config, config.discovery.window()).await?;
    let session = client.open_session(dev_id)?;
    Ok((client, session))
}

/// Run device discovery and print what was found
async fn run_discovery(config: &Config, window: Duration, json: bool) -> anyhow::Result<()> {
    if !json {
        println!("Scanning for devices ({} seconds)...\n", window.as_secs());
    }

    let client = discover(config, window).await?;

    let mut ids: Vec<String> = client.device_ids().into_iter().collect();
    ids.sort();
    let devices: Vec<_> = ids.iter().filter_map(|id| client.device(id)).collect();

    if json {
        let list: Vec<serde_json::Value> = devices
            .iter()
            .map(|d| {
                let info = d.info();
                serde_json::json!({
                    "dev_id": info.dev_id,
                    "fw_id": info.fw_id,
                    "api_ver": info.api_ver,
                    "address": d.address(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&list)?);
        return Ok(());
    }

    if devices.is_empty() {
        println!("No devices found.");
        return Ok(());
    }

    println!("{:<24} {:<24} {:>4}  ADDRESS", "DEVICE", "FIRMWARE", "API");
    for device in &devices {
        let info = device.info();
        println!(
            "{:<24} {:<24} {:>4}  {}",
            info.dev_id,
            info.fw_id,
            info.api_ver,
            device.address()
        );
    }
    println!("\n{} device(s) found.", devices.len());

    Ok(())
}

/// Ping a device `count` times and print loss and average round trip time
async fn run_ping(session: &Session, count: u32) {
    let mut rtts = Vec::new();

    for seq in 1..=count {
        match session.ping().await {
            Ok(rtt) => {
                println!("Reply from {}: seq={} time={:.1} ms", session.dev_id(), seq, millis(rtt));
                rtts.push(rtt);
            }
            Err(RequestError::TimedOut) => println!("Request timed out: seq={}", seq),
            Err(e) => println!("Ping failed: seq={} ({})", seq, e),
        }
    }

    let received = rtts.len() as u32;
    let loss = if count == 0 {
        0.0
    } else {
        100.0 * f64::from(count - received) / f64::from(count)
    };

    println!("\n--- {} ping statistics ---", session.dev_id());
    println!("{} sent, {} received, {:.0}% loss", count, received, loss);
    if received > 0 {
        let total: Duration = rtts.iter().sum();
        println!("average round trip {:.1} ms", millis(total / received));
    }
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}
