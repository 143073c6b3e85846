//! wirelink CLI
//!
//! Command-line front end for the shared broker connection:
//! - Inspect and edit the persisted connection config
//! - Publish test events
//! - Monitor live topic patterns

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use wirelink::*;

#[derive(Parser)]
#[command(name = "wirelink")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Shared connection to a publish/subscribe broker")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Settings file (default: searched in standard locations)
    #[arg(long, global = true)]
    pub settings: Option<PathBuf>,

    /// Profile directory (overrides settings)
    #[arg(long, global = true)]
    pub profile: Option<PathBuf>,

    /// Use the in-process loopback broker instead of the network
    #[arg(long, global = true)]
    pub loopback: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Inspect or edit the connection config
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Publish one message
    Publish {
        /// Subject (no wildcards)
        subject: String,
        /// Payload; parsed as JSON, sent as a string otherwise
        payload: String,
    },

    /// Print deliveries until Ctrl-C
    Monitor {
        /// Patterns to subscribe (default: configured subjects)
        patterns: Vec<String>,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the stored config and its validation result
    Show,

    /// Exit non-zero when the stored config is invalid
    Validate,

    /// Update fields of the stored config
    Set(SetArgs),

    /// Remove the stored config
    Reset,

    /// Print a default settings file
    InitSettings {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Args)]
pub struct SetArgs {
    #[arg(long)]
    pub url: Option<String>,
    #[arg(long)]
    pub user: Option<String>,
    #[arg(long)]
    pub pass: Option<String>,
    #[arg(long)]
    pub token: Option<String>,
    #[arg(long)]
    pub auto_connect: Option<bool>,
    /// Default subject patterns (replaces the list)
    #[arg(long = "subject")]
    pub subjects: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings = match &cli.settings {
        Some(path) => Settings::load_with_env(path)?,
        None => Settings::load_default(),
    };
    if let Some(profile) = &cli.profile {
        settings.profile.dir = profile.to_string_lossy().to_string();
    }

    init_logging(&settings);

    let storage = FileStorage::open(settings.profile.path())
        .with_context(|| format!("opening profile {:?}", settings.profile.path()))?;
    let store = ConfigStore::new(Arc::new(storage.clone()));

    match cli.command {
        Commands::Config { action } => run_config(action, &store),
        Commands::Publish { subject, payload } => {
            let manager = build_manager(cli.loopback, store, &settings);
            connect(&manager).await?;

            let data = serde_json::from_str::<serde_json::Value>(&payload)
                .unwrap_or(serde_json::Value::String(payload));
            let published = manager.publish(&subject, &data).await;
            manager.disconnect().await;

            if !published {
                bail!("publish to '{}' failed", subject);
            }
            println!("Published to {}", subject);
            Ok(())
        }
        Commands::Monitor { patterns } => {
            let manager = build_manager(cli.loopback, store, &settings);
            let watcher = storage.spawn_watcher(settings.profile.watch_interval());
            manager.initialize();
            manager.on_status_change(|snapshot| match &snapshot.message {
                Some(message) => eprintln!("status: {} ({})", snapshot.status, message),
                None => eprintln!("status: {}", snapshot.status),
            });
            connect(&manager).await?;

            // Resubscribes every time auto-reconnect brings the link back
            let monitor = manager.monitor(patterns, print_delivery);
            let topics = manager.connection().subscribed_topics();
            if topics.is_empty() {
                manager.remove_status_listener(monitor);
                manager.disconnect().await;
                watcher.abort();
                bail!("nothing to monitor: pass patterns or configure default subjects");
            }
            for topic in &topics {
                eprintln!("monitoring {}", topic);
            }

            tokio::signal::ctrl_c().await?;

            manager.remove_status_listener(monitor);
            manager.shutdown();
            manager.disconnect().await;
            watcher.abort();
            Ok(())
        }
    }
}

fn init_logging(settings: &Settings) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("wirelink={}", settings.logging.level))
    });
    let json = settings.logging.is_json();

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr)))
        .with((!json).then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr)))
        .init();
}

fn build_manager(loopback: bool, store: ConfigStore, settings: &Settings) -> ConnectionManager {
    let transport: Arc<dyn Transport> = if loopback {
        tracing::info!("Using loopback broker");
        Arc::new(MemoryBroker::new())
    } else {
        Arc::new(WsTransport::new())
    };

    ConnectionManager::with_policy(
        Connection::new(transport),
        store,
        settings.reconnect.to_policy(),
    )
}

async fn connect(manager: &ConnectionManager) -> anyhow::Result<()> {
    let config = manager.config_store().get_config();
    if manager.connect(&config).await {
        return Ok(());
    }

    let snapshot = manager.status_snapshot();
    bail!(
        "could not connect to {}: {}",
        config.url,
        snapshot.message.unwrap_or_else(|| snapshot.status.to_string())
    )
}

fn print_delivery(payload: Payload, subject: &str, id: u64) {
    let body = if let Some(value) = payload.as_structured() {
        value.to_string()
    } else if let Some(text) = payload.as_text() {
        text
    } else {
        format!("<{} bytes>", payload.into_bytes().len())
    };
    println!("[{}] {} {}", id, subject, body);
}

fn run_config(action: ConfigAction, store: &ConfigStore) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            let config = store.get_config();
            println!("{}", serde_json::to_string_pretty(&config)?);
            print_report(&ConfigStore::validate_config(&config));
        }
        ConfigAction::Validate => {
            let report = ConfigStore::validate_config(&store.get_config());
            print_report(&report);
            if !report.valid {
                bail!("{} validation error(s)", report.errors.len());
            }
        }
        ConfigAction::Set(args) => {
            let mut config = store.get_config();
            if let Some(url) = args.url {
                config.url = url;
            }
            if let Some(user) = args.user {
                config.user = user;
            }
            if let Some(pass) = args.pass {
                config.pass = pass;
            }
            if let Some(token) = args.token {
                config.token = token;
            }
            if let Some(enabled) = args.auto_connect {
                config.auto_connect = enabled;
            }
            if !args.subjects.is_empty() {
                config.subjects = args.subjects;
            }

            let report = store.save_if_valid(&config)?;
            print_report(&report);
            if !report.valid {
                bail!("not saved: {} validation error(s)", report.errors.len());
            }
            println!("Saved");
        }
        ConfigAction::Reset => {
            store.reset()?;
            println!("Connection config removed");
        }
        ConfigAction::InitSettings { output } => {
            let content = generate_default_settings();
            match output {
                Some(path) => {
                    std::fs::write(&path, content)
                        .with_context(|| format!("writing {:?}", path))?;
                    println!("Settings written to {:?}", path);
                }
                None => print!("{}", content),
            }
        }
    }
    Ok(())
}

fn print_report(report: &ValidationReport) {
    if report.valid {
        println!("Config is valid");
        return;
    }
    for message in report.messages() {
        println!("  - {}", message);
    }
}
