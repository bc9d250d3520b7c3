//! psu_bridge daemon entry point.
//!
//! Discovers the instruments named in the config file, then either prints a
//! single round of readings (`--single-shot`), surveys the visible resources
//! (`--list-devices`), or runs the polling loop, publishing readings to MQTT
//! and accepting control commands when `--mqtt` is given.

use anyhow::Result;
use clap::Parser;
use log::{error, info};
use psu_bridge::bus;
use psu_bridge::config::{self, BusConfig, InstrumentsFile};
use psu_bridge::daemon::{self, InstrumentMap};
use psu_bridge::instrument::InstrumentRegistry;
use psu_bridge::resolver;
use psu_bridge::schedule::ScheduleState;
use psu_bridge::transport::ResourceManager;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

#[derive(Parser, Debug)]
#[command(name = "psu_bridge", about = "Instrument polling and control daemon")]
struct Cli {
    /// Path to the instrument JSON config
    #[arg(long, required_unless_present = "list_devices")]
    config: Option<PathBuf>,

    /// Path to the MQTT config JSON; without it readings go to the log
    #[arg(long)]
    mqtt: Option<PathBuf>,

    /// Polling interval in seconds
    #[arg(long, default_value_t = 10)]
    interval: u64,

    /// Read every instrument once, print, and exit
    #[arg(long)]
    single_shot: bool,

    /// Reset the instruments on connect
    #[arg(long)]
    do_reset: bool,

    /// Configure the instruments on connect
    #[arg(long)]
    do_config: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Probe every visible resource, print what identifies, and exit
    #[arg(long)]
    list_devices: bool,
}

#[cfg(feature = "instrument_serial")]
fn resource_manager() -> Result<Box<dyn ResourceManager>> {
    Ok(Box::new(
        psu_bridge::transport::serial::SerialResourceManager::default(),
    ))
}

#[cfg(not(feature = "instrument_serial"))]
fn resource_manager() -> Result<Box<dyn ResourceManager>> {
    Err(psu_bridge::error::BridgeError::SerialFeatureDisabled.into())
}

async fn load_instruments(
    manager: &dyn ResourceManager,
    file: &InstrumentsFile,
    do_reset: bool,
    do_config: bool,
) -> Result<InstrumentMap> {
    let registry = InstrumentRegistry::with_builtins();
    let mut instruments = InstrumentMap::new();
    for item in &file.instruments {
        let instrument = registry
            .connect(manager, item, &file.skip_resources)
            .await?;
        if do_reset {
            instrument.reset().await?;
        }
        if do_config {
            instrument.configure(None).await?;
        }
        instruments.insert(item.name.clone(), instrument);
    }
    Ok(instruments)
}

fn spawn_signal_handler(shutdown: watch::Sender<bool>) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            {
                Ok(term) => term,
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {}", e);
                    let _ = ctrl_c.await;
                    info!("Signal received; shutting down");
                    let _ = shutdown.send(true);
                    return;
                }
            };
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        info!("Signal received; shutting down");
        let _ = shutdown.send(true);
    });
}

async fn run(cli: Cli) -> Result<()> {
    let manager = resource_manager()?;

    if cli.list_devices {
        let skip = match &cli.config {
            Some(path) => InstrumentsFile::load(path)?.skip_resources,
            None => config::default_skip_resources(),
        };
        for (address, description) in resolver::survey(manager.as_ref(), &skip).await? {
            println!("{}\n\t{}", address, description);
        }
        return Ok(());
    }

    // clap guarantees --config is present past this point.
    let config_path = cli
        .config
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("--config is required"))?;
    let file = InstrumentsFile::load(config_path)?;
    let instruments = load_instruments(manager.as_ref(), &file, cli.do_reset, cli.do_config).await?;
    info!("Connected {} instrument(s)", instruments.len());

    if cli.single_shot {
        return daemon::single_shot(&instruments).await;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_handler(shutdown_tx);

    let schedule = ScheduleState::shared(Duration::from_secs(cli.interval), Instant::now());

    let bus = match &cli.mqtt {
        Some(path) => {
            let bus_config = BusConfig::load(path)?;
            let (handle, inbound) = bus::connect(&bus_config, "psu_bridge");
            for name in instruments.keys() {
                handle
                    .subscribe(&format!("{}/{}/#", handle.control_topic, name))
                    .await?;
            }

            let (intent_tx, intent_rx) = mpsc::channel(daemon::CONTROL_QUEUE);
            tokio::spawn(daemon::control_router(
                inbound,
                Arc::new(instruments.clone()),
                handle.control_topic.clone(),
                Arc::clone(&schedule),
                intent_tx,
            ));
            tokio::spawn(daemon::control_consumer(intent_rx));
            Some(handle)
        }
        None => None,
    };

    info!("Starting the measurement loop");
    daemon::polling_loop(&instruments, schedule, bus.as_ref(), shutdown_rx).await;
    info!("Shutdown complete");
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
