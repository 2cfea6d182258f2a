//! Veil Tunnel Client
//!
//! Registers a disguised tunnel with the server and relays the local
//! tunnel engine's datagrams through it:
//! - Tries disguises in learned best-first order
//! - Relays datagrams on a loopback UDP endpoint
//! - Reconnects on stream loss or stall

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use veil_tunnel::{
    config::{generate_example_config, ClientConfig, Config},
    controller::{ConnectionController, ConnectionState, TunnelEvent},
    ledger::SelectionLedger,
    probe::probe,
    transport::{CertificateVerification, TlsDialer},
    tunnel::{Establisher, TlsEstablisher},
};

/// How often counters are logged while connected
const STATS_INTERVAL: Duration = Duration::from_secs(30);

/// Veil Tunnel Client - disguised tunnel registration and relay
#[derive(Parser, Debug)]
#[command(name = "veil-client")]
#[command(about = "Veil Tunnel Client - disguised VPN tunnel registration")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Server endpoint (overrides config)
    #[arg(short, long, global = true)]
    endpoint: Option<String>,

    /// Auth token (overrides config)
    #[arg(short, long, global = true)]
    token: Option<String>,

    /// Only try the canonical disguise
    #[arg(long, global = true)]
    no_mimicry: bool,

    /// Skip server certificate verification (development only)
    #[arg(long, global = true)]
    insecure: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect and relay until interrupted (default)
    Connect,

    /// Try every disguise once and report which ones work
    Probe {
        /// Write the JSON report here
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show learned disguise statistics
    Stats {
        /// Only this host
        host: Option<String>,
    },

    /// Forget learned preferences for a host
    Reset {
        /// Host to reset (defaults to the configured endpoint's host)
        host: Option<String>,
    },

    /// Write an example configuration file
    GenerateConfig {
        #[arg(short, long, default_value = "config.toml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(Command::GenerateConfig { output }) = &args.command {
        return write_example_config(output);
    }

    let config = load_config(&args)?;
    veil_tunnel::logging::init(&config.logging).context("Failed to initialize logging")?;

    info!("Veil Tunnel Client v{}", veil_tunnel::VERSION);

    match args.command.unwrap_or(Command::Connect) {
        Command::Connect => run_connect(&config).await,
        Command::Probe { output } => run_probe(&config, output.as_deref()).await,
        Command::Stats { host } => show_stats(&config, host),
        Command::Reset { host } => reset_host(&config, host),
        Command::GenerateConfig { .. } => Ok(()),
    }
}

/// Load the config file (if any) and apply command-line overrides
fn load_config(args: &Args) -> Result<Config> {
    let mut config = if Path::new(&args.config).exists() {
        Config::load(&args.config).context("Failed to load configuration")?
    } else {
        Config::default()
    };

    let client = config.client.get_or_insert_with(ClientConfig::default);
    if let Some(endpoint) = &args.endpoint {
        client.endpoint = endpoint.clone();
    }
    if let Some(token) = &args.token {
        client.auth_token = token.clone();
    }
    if args.no_mimicry {
        client.mimicry_enabled = false;
    }
    if args.insecure {
        client.insecure_skip_verify = true;
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }

    Ok(config)
}

fn build_establisher(config: &Config, client: &ClientConfig) -> Arc<dyn Establisher> {
    let mut dialer = TlsDialer::new(config.timing.transport_config(), client.verification());
    if let Some(sni) = &client.sni {
        dialer = dialer.with_sni(sni.clone());
    }

    if client.verification() == CertificateVerification::Disabled {
        warn!("Certificate verification is DISABLED; use only for development");
    }

    Arc::new(TlsEstablisher::new(
        dialer,
        client.tunnel_type.clone(),
        config.timing.read_timeout(),
    ))
}

fn open_ledger(client: &ClientConfig) -> Result<Arc<SelectionLedger>> {
    let path = client.ledger_path();
    let ledger = SelectionLedger::open_file(client.catalog()?, &path)
        .with_context(|| format!("Failed to open selection ledger {}", path.display()))?;
    Ok(Arc::new(ledger))
}

async fn run_connect(config: &Config) -> Result<()> {
    let client = config.client()?;
    client.validate()?;

    let destination = client.destination()?;
    let ledger = open_ledger(client)?;
    let establisher = build_establisher(config, client);

    info!("Server: {} (data port {})", destination, destination.data_port);
    info!(
        "Mimicry: {}, {} disguise(s) enabled",
        if client.mimicry_enabled { "on" } else { "off" },
        ledger.catalog().len()
    );

    let controller = Arc::new(ConnectionController::new(
        config.controller_settings()?,
        establisher,
        ledger,
    ));

    let events = controller.subscribe();
    let reporter = tokio::spawn(report_events(events, controller.clone()));

    controller.connect(destination, client.auth_token.clone())?;

    let final_state = tokio::select! {
        state = controller.wait() => state,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
            controller.disconnect().await;
            ConnectionState::Disconnected
        }
    };

    reporter.abort();

    match final_state {
        ConnectionState::Failed => Err(anyhow!("Could not establish a tunnel")),
        _ => Ok(()),
    }
}

/// Log controller events and periodic counters
async fn report_events(
    mut events: broadcast::Receiver<TunnelEvent>,
    controller: Arc<ConnectionController>,
) {
    let mut stats = tokio::time::interval(STATS_INTERVAL);
    stats.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(TunnelEvent::Connecting) => info!("Connecting..."),
                Ok(TunnelEvent::Connected { disguise, local_addr }) => {
                    info!("Connected via '{}'; point the tunnel engine at {}", disguise, local_addr);
                }
                Ok(TunnelEvent::Reconnecting { reason }) => warn!("Reconnecting: {}", reason),
                Ok(TunnelEvent::Disconnected) => info!("Disconnected"),
                Ok(TunnelEvent::Error { reason }) => error!("Connection failed: {}", reason),
                Err(broadcast::error::RecvError::Lagged(n)) => warn!("Missed {} event(s)", n),
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = stats.tick() => {
                if controller.state() == ConnectionState::Connected {
                    let c = controller.counters();
                    info!(
                        "Relay: up {} pkts / {} bytes, down {} pkts / {} bytes, dropped {}",
                        c.datagrams_up, c.bytes_up, c.datagrams_down, c.bytes_down, c.datagrams_dropped
                    );
                }
            }
        }
    }
}

async fn run_probe(config: &Config, output: Option<&Path>) -> Result<()> {
    let client = config.client()?;
    client.validate()?;

    let destination = client.destination()?;
    let catalog = client.catalog()?;
    let establisher = build_establisher(config, client);

    info!("Probing {} disguise(s) against {}", catalog.len(), destination);

    let report = probe(
        &destination,
        &client.auth_token,
        &catalog,
        establisher.as_ref(),
        config.timing.attempt_cooldown(),
    )
    .await;

    println!();
    println!("{:<10} {:<20} {:>6} {:>8}  {}", "ID", "NAME", "STATUS", "MS", "RESULT");
    for r in &report.results {
        let status = r.status.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string());
        let result = if r.ok {
            "ok".to_string()
        } else {
            r.error.clone().unwrap_or_default()
        };
        println!(
            "{:<10} {:<20} {:>6} {:>8}  {}",
            r.id, r.display_name, status, r.latency_ms, result
        );
    }
    println!();
    println!(
        "{}/{} disguises working",
        report.metadata.working, report.metadata.total
    );

    if let Some(path) = output {
        report.save(path)?;
    }

    Ok(())
}

fn show_stats(config: &Config, host: Option<String>) -> Result<()> {
    let client = config.client()?;
    let ledger = open_ledger(client)?;

    let hosts = match host {
        Some(host) => vec![host],
        None => ledger.hosts(),
    };

    if hosts.is_empty() {
        println!("No disguise history recorded yet");
        return Ok(());
    }

    for host in hosts {
        let Some(record) = ledger.snapshot(&host) else {
            println!("{}: no history", host);
            continue;
        };

        println!("{}", host);
        println!(
            "  last successful: {}",
            record.last_successful.as_deref().unwrap_or("-")
        );
        for (id, stats) in &record.disguises {
            let last_success = stats
                .last_success_time
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "  {:<10} ok {:>5}  failed {:>5}  last ok {}",
                id, stats.success_count, stats.failure_count, last_success
            );
        }
    }

    Ok(())
}

fn reset_host(config: &Config, host: Option<String>) -> Result<()> {
    let client = config.client()?;
    let host = match host {
        Some(host) => host,
        None => client
            .destination()
            .context("No host given and no endpoint configured")?
            .host,
    };

    let ledger = open_ledger(client)?;
    ledger.reset(&host)?;
    println!("Forgot disguise history for {}", host);
    Ok(())
}

fn write_example_config(output: &Path) -> Result<()> {
    if output.exists() {
        return Err(anyhow!("{} already exists", output.display()));
    }

    generate_example_config()
        .save(output)
        .with_context(|| format!("Failed to write {}", output.display()))?;

    println!("Example configuration written to {}", output.display());
    println!("Set [client] endpoint and auth_token before connecting.");
    Ok(())
}
