use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use console::{style, Emoji};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use dicom_autocontour::common::sop_classes::SopClassRegistry;
use dicom_autocontour::common::transfer_syntaxes::TransferSyntaxCatalog;
use dicom_autocontour::destinations::Endpoint;
use dicom_autocontour::sender::{DicomPeer, DicomScu};
use dicom_autocontour::{AutocontourNode, ConfigHandle, NodeConfig};

static SATELLITE: Emoji<'_, '_> = Emoji("📡 ", "");
static INBOX: Emoji<'_, '_> = Emoji("📥 ", "");
static CLIPBOARD: Emoji<'_, '_> = Emoji("📋 ", "");
static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "");

const DEFAULT_CONFIG: &str = "autocontour.toml";

#[derive(Parser)]
#[command(name = "autocontour-node")]
#[command(about = "A DICOM node that autocontours received series and forwards RT structure sets")]
#[command(version)]
struct Args {
    /// Configuration file (defaults to ./autocontour.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the node until interrupted
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// AE Title for this node
        #[arg(short = 'a', long)]
        ae_title: Option<String>,
    },
    /// Print the last status snapshot written by a running node
    Status,
    /// Send a C-ECHO to a remote node
    Echo {
        #[arg(short = 'a', long)]
        ae_title: String,

        #[arg(short = 'H', long)]
        host: String,

        #[arg(short, long, default_value = "104")]
        port: u16,
    },
    /// Manage forwarding destinations
    Destinations {
        #[command(subcommand)]
        action: DestinationAction,
    },
    /// Try to deliver every pending report again
    Resend,
    /// List the accepted SOP classes and transfer syntaxes
    Capabilities,
}

#[derive(Subcommand)]
enum DestinationAction {
    List,
    /// Verify a destination with C-ECHO and add it
    Add {
        #[arg(short = 'a', long)]
        ae_title: String,

        #[arg(short = 'H', long)]
        host: String,

        #[arg(short, long, default_value = "104")]
        port: u16,

        #[arg(short, long, default_value = "")]
        description: String,

        /// Make it the active destination right away
        #[arg(long)]
        activate: bool,
    },
    /// Make a destination (id or AE title) the active one
    Activate { destination: String },
    Deactivate,
    Remove { destination: String },
    /// C-ECHO a destination and record the result
    Verify { destination: String },
}

fn load_config(path: Option<&Path>) -> Result<ConfigHandle> {
    match path {
        Some(path) => ConfigHandle::load(path).with_context(|| format!("cannot load {}", path.display())),
        None if Path::new(DEFAULT_CONFIG).exists() => {
            ConfigHandle::load(DEFAULT_CONFIG).with_context(|| format!("cannot load {}", DEFAULT_CONFIG))
        }
        None => Ok(ConfigHandle::new(NodeConfig::default())),
    }
}

fn init_logging(verbose: bool) -> Result<(String, String)> {
    let session_id = Uuid::new_v4().to_string();
    std::fs::create_dir_all("logs")?;
    let log_file = format!("logs/autocontour_{}.log", session_id);

    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(std::fs::File::create(&log_file)?)
        .init();
    Ok((session_id, log_file))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;

    match args.command {
        Command::Serve { port, ae_title } => {
            let (session_id, log_file) = init_logging(args.verbose)?;
            let mut overridden = (*config.snapshot()).clone();
            if let Some(port) = port {
                overridden.port = port;
            }
            if let Some(ae_title) = ae_title {
                overridden.ae_title = ae_title;
            }
            config.replace(overridden).context("invalid configuration")?;
            serve(config, &session_id, &log_file).await
        }
        Command::Status => status(&config.snapshot()),
        Command::Echo { ae_title, host, port } => {
            let endpoint = Endpoint::new(ae_title, host, port, "");
            endpoint.validate()?;
            let scu = DicomScu::new(Arc::new(config));
            let status = scu.echo(&endpoint).await.with_context(|| format!("C-ECHO to {} failed", endpoint))?;
            println!("{} C-ECHO {}: {}", SATELLITE, endpoint, style(status).green());
            Ok(())
        }
        Command::Destinations { action } => destinations(config, action).await,
        Command::Resend => {
            let node = AutocontourNode::from_config(config)?;
            let summary = node.resend_pending().await;
            println!(
                "{} {} sent, {} still pending",
                INBOX,
                style(summary.sent).green(),
                style(summary.still_pending).yellow()
            );
            Ok(())
        }
        Command::Capabilities => {
            capabilities();
            Ok(())
        }
    }
}

async fn serve(config: ConfigHandle, session_id: &str, log_file: &str) -> Result<()> {
    let node = AutocontourNode::from_config(config).context("cannot set up node")?;
    let addr = node.start().await.context("cannot start node")?;
    let snapshot = node.config().snapshot();

    println!("{} DICOM Autocontour Node v{}", SATELLITE, env!("CARGO_PKG_VERSION"));
    println!("Session ID: {}", style(session_id).cyan());
    println!("Log file: {}", style(log_file).yellow());
    println!("AE Title: {}", style(&snapshot.ae_title).green());
    println!("Listening: {}", style(addr).green());
    println!("Structures: {}", style(snapshot.structure_names().join(", ")).green());
    match node.registry().active() {
        Some(endpoint) => println!("Forwarding to: {}", style(endpoint).green()),
        None => println!("Forwarding to: {}", style("no active destination").yellow()),
    }
    println!();
    println!("{} Waiting for images, press Ctrl+C to stop", INBOX);

    let status_path = snapshot.storage.status_path();
    let mut ticker = tokio::time::interval(Duration::from_secs(5));
    let reload = reload_signal();
    tokio::pin!(reload);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                if let Some(path) = &status_path {
                    if let Err(e) = write_status(&node, path).await {
                        warn!("Cannot write status to {}: {}", path.display(), e);
                    }
                }
            }
            _ = &mut reload => {
                match node.config().reload() {
                    Ok(_) => info!("Configuration reloaded"),
                    Err(e) => error!("❌  Reload failed, keeping current configuration: {}", e),
                }
                reload.set(reload_signal());
            }
        }
    }

    println!("Stopping...");
    node.stop().await;
    if let Some(path) = &status_path {
        write_status(&node, path).await?;
    }
    println!("{} Stopped", SPARKLE);
    Ok(())
}

/// Resolves on SIGHUP; never on platforms without it
async fn reload_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        if let Ok(mut hangup) = signal(SignalKind::hangup()) {
            hangup.recv().await;
            return;
        }
    }
    std::future::pending::<()>().await
}

async fn write_status(node: &AutocontourNode, path: &Path) -> Result<()> {
    let status = node.status().await;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(&status)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn status(config: &NodeConfig) -> Result<()> {
    let Some(path) = config.storage.status_path() else {
        bail!("no data directory configured, a running node does not publish its status");
    };
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("no status at {}, is the node running?", path.display()))?;
    let status: serde_json::Value = serde_json::from_str(&text)?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn destinations(config: ConfigHandle, action: DestinationAction) -> Result<()> {
    let node = AutocontourNode::from_config(config)?;
    let registry = node.registry();
    let lookup = |key: &str| registry.find(key).with_context(|| format!("no destination '{}'", key));

    match action {
        DestinationAction::List => {
            let endpoints = registry.list();
            if endpoints.is_empty() {
                println!("No destinations configured");
            }
            println!("{} {} destinations", CLIPBOARD, endpoints.len());
            for endpoint in endpoints {
                let marker = if endpoint.active { style("*").green() } else { style(" ").dim() };
                println!(
                    "{} {} {} verified={} {}",
                    marker,
                    style(endpoint.id).dim(),
                    endpoint,
                    endpoint.verified,
                    endpoint.description
                );
            }
        }
        DestinationAction::Add {
            ae_title,
            host,
            port,
            description,
            activate,
        } => {
            let endpoint = node
                .add_destination(Endpoint::new(ae_title, host, port, description))
                .await?;
            println!("✅ Added {} ({})", endpoint, style(endpoint.id).dim());
            if activate {
                registry.activate(endpoint.id)?;
                println!("✅ {} is now active", endpoint);
            }
        }
        DestinationAction::Activate { destination } => {
            let endpoint = registry.activate(lookup(&destination)?.id)?;
            println!("✅ {} is now active", endpoint);
        }
        DestinationAction::Deactivate => match registry.deactivate()? {
            Some(id) => println!("✅ Deactivated {}", id),
            None => println!("No destination was active"),
        },
        DestinationAction::Remove { destination } => {
            let endpoint = registry.remove(lookup(&destination)?.id)?;
            println!("✅ Removed {}", endpoint);
        }
        DestinationAction::Verify { destination } => {
            let endpoint = lookup(&destination)?;
            if node.verify_destination(endpoint.id).await? {
                println!("✅ {} answered", endpoint);
            } else {
                println!("❌ {} did not answer", endpoint);
            }
        }
    }
    Ok(())
}

fn capabilities() {
    let sop_classes = SopClassRegistry::new();
    let mut uids = sop_classes.get_all_uids();
    uids.sort_unstable();
    println!("{} Accepted SOP classes: {}", CLIPBOARD, uids.len());
    for uid in uids {
        println!("• {} {}", style(uid).dim(), sop_classes.get_name(uid).unwrap_or("unknown"));
    }

    let transfer_syntaxes = TransferSyntaxCatalog::new();
    println!();
    println!("{} Accepted transfer syntaxes", CLIPBOARD);
    for uid in transfer_syntaxes.get_all_uids() {
        println!(
            "• {} {}",
            style(uid).dim(),
            transfer_syntaxes.get_name(uid).unwrap_or("unknown")
        );
    }
}
