//! Binary entrypoint for the meshmon CLI.
//!
//! Commands:
//! - `start` - run the monitoring coordinator against the configured radio
//! - `init` - create a starter `config.toml`
//! - `status` - print metrics counters and the persisted contact store
//! - `cmd <command>` - run one operator command, e.g. `meshmon cmd "send_advert(True)"`
//!
//! See the library crate docs for module-level details: `meshmon::`.
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn};

use meshmon::config::Config;
use meshmon::coordinator::UpdateCoordinator;
use meshmon::meshcore::api::{MeshApi, MeshConnection};
use meshmon::metrics;
use meshmon::storage::JsonFileBackend;

/// Reconnect attempts before giving up on a lost link.
const RECONNECT_ATTEMPTS: u32 = 3;
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "meshmon")]
#[command(about = "A monitoring coordinator for MeshCore mesh networks")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the monitoring coordinator
    Start,
    /// Initialize a new configuration file
    Init,
    /// Show counters and the persisted contact store
    Status,
    /// Execute one operator command against the radio
    Cmd {
        /// Command string, e.g. "send_advert(True)"
        command: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let pre_config = match cli.command {
        Commands::Init => None,
        _ => Config::load(&cli.config).await.ok(),
    };
    if !matches!(cli.command, Commands::Init) {
        init_logging(&pre_config, cli.verbose);
    }

    match cli.command {
        Commands::Start => {
            let config = pre_config.ok_or_else(|| {
                anyhow!(
                    "could not load {} (run `meshmon init` to create one)",
                    cli.config
                )
            })?;
            info!("Starting meshmon v{}", env!("CARGO_PKG_VERSION"));
            run(config).await
        }
        Commands::Init => {
            Config::create_default(&cli.config).await?;
            println!("Wrote starter configuration to {}", cli.config);
            println!("Edit the radio address and tracked nodes, then run `meshmon start`.");
            Ok(())
        }
        Commands::Status => {
            let config = pre_config
                .ok_or_else(|| anyhow!("could not load {}", cli.config))?;
            print_status(&config);
            Ok(())
        }
        Commands::Cmd { command } => {
            let config = pre_config
                .ok_or_else(|| anyhow!("could not load {}", cli.config))?;
            run_one_command(&config, &command).await
        }
    }
}

/// Connect with a few retries; a mesh gateway rebooting is routine.
async fn connect_with_retry(config: &Config) -> Result<Arc<MeshConnection>> {
    let mut last_err = None;
    for attempt in 1..=RECONNECT_ATTEMPTS {
        match MeshConnection::open(&config.radio.host, config.radio.port).await {
            Ok(conn) => return Ok(conn),
            Err(e) => {
                warn!(
                    "connect attempt {attempt}/{RECONNECT_ATTEMPTS} failed: {e:#}"
                );
                last_err = Some(e);
                if attempt < RECONNECT_ATTEMPTS {
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow!("no connection attempts made")))
}

async fn run(config: Config) -> Result<()> {
    let backend = Arc::new(JsonFileBackend::new(config.contacts_store_path()));
    let snapshot = backend.load()?;

    let conn = connect_with_retry(&config).await?;
    let api: Arc<dyn MeshApi> = conn;
    let mut coordinator = UpdateCoordinator::new(api.clone(), &config, backend.clone())?;
    coordinator.load_discovered(snapshot);
    coordinator.attach(api);

    let tick = Duration::from_secs(config.coordinator.tick_interval_seconds);
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                coordinator.shared().api().disconnect().await;
                return Ok(());
            }
        }
        if let Err(e) = coordinator.tick().await {
            error!("tick failed: {e:#}");
            coordinator.shared().api().disconnect().await;
            match connect_with_retry(&config).await {
                Ok(conn) => {
                    let api: Arc<dyn MeshApi> = conn;
                    coordinator.attach(api);
                }
                Err(e) => {
                    // Keep the loop alive; the next tick retries again.
                    error!("reconnect failed: {e:#}");
                }
            }
        }
    }
}

fn print_status(config: &Config) {
    let snap = metrics::snapshot();
    println!("meshmon v{}", env!("CARGO_PKG_VERSION"));
    println!("radio: {}:{}", config.radio.host, config.radio.port);
    println!(
        "tracked nodes: {} repeaters, {} clients",
        config.repeaters.len(),
        config.clients.len()
    );
    println!(
        "counters: {} requests, {} token denials, {} ticks ({} failed)",
        snap.requests_sent, snap.tokens_denied, snap.ticks_completed, snap.ticks_failed
    );
    let nodes = metrics::node_counters_snapshot();
    if !nodes.is_empty() {
        let mut entries: Vec<_> = nodes.into_iter().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        for (prefix, counter) in entries {
            println!(
                "  {prefix}: {} ok, {} failed",
                counter.successes, counter.failures
            );
        }
    }

    let backend = JsonFileBackend::new(config.contacts_store_path());
    match backend.load() {
        Ok(contacts) => {
            println!("discovered contacts: {}", contacts.len());
            for contact in contacts {
                println!(
                    "  {} {:12} {} (last advert {})",
                    contact.key_prefix(),
                    contact.node_type.as_str(),
                    meshmon::logutil::escape_log(&contact.adv_name),
                    contact.last_advert
                );
            }
        }
        Err(e) => println!("discovered contacts: unavailable ({e:#})"),
    }
}

async fn run_one_command(config: &Config, command: &str) -> Result<()> {
    let backend = Arc::new(JsonFileBackend::new(config.contacts_store_path()));
    let snapshot = backend.load()?;

    let conn = connect_with_retry(config).await?;
    let api: Arc<dyn MeshApi> = conn;

    // Contact-bearing commands need the registry populated.
    let mut registry = meshmon::coordinator::registry::ContactRegistry::new(
        backend,
        config.coordinator.max_discovered_contacts,
    );
    registry.load_discovered(snapshot);
    api.app_start(&config.radio.app_name).await?;
    registry.set_added_contacts(api.sync_contacts(0).await?);
    let registry = std::sync::Mutex::new(registry);

    let outcome = meshmon::commands::execute(command, api.as_ref(), &registry).await;
    api.disconnect().await;
    match outcome {
        Ok(message) => {
            println!("{message}");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    let base_level = match verbosity {
        0 => config
            .as_ref()
            .map(|c| c.logging.level.parse().unwrap_or(log::LevelFilter::Info))
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);
    if let Some(cfg) = config {
        if let Some(ref file) = cfg.logging.file {
            if let Ok(f) = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(file)
            {
                let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
                // Foreground runs log to both file and console; under a
                // service manager stdout is not a TTY and the file is enough.
                let is_tty = atty::is(atty::Stream::Stdout);
                builder.format(move |fmt, record| {
                    let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                    let line = format!("{} [{}] {}", ts, record.level(), record.args());
                    if let Ok(mut guard) = write_mutex.lock() {
                        let _ = writeln!(guard, "{}", line);
                    }
                    if is_tty {
                        writeln!(fmt, "{}", line)
                    } else {
                        Ok(())
                    }
                });
            }
        }
    }
    let _ = builder.try_init();
}
