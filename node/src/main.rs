//! LogiChain core daemon.
//!
//! Wires the persistence layer, chain, mempool, and consensus actor
//! together, runs the event log, and optionally mines. Exit codes:
//! 0 normal shutdown, 1 configuration error, 2 unrecoverable persistence
//! corruption, 3 incompatible genesis.

use clap::{Arg, ArgAction, Command};
use logichain_types::CoreEvent;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod core;
mod settings;
mod version;

use crate::core::{build, StartupError};
use settings::NodeConfig;
use version::LOGICHAIN_VERSION;

fn cli() -> Command {
    Command::new("logichain-node")
        .version(LOGICHAIN_VERSION)
        .about("LogiChain core daemon")
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .value_name("FILE")
                .help("Path to a TOML configuration file"),
        )
        .arg(
            Arg::new("data-dir")
                .long("data-dir")
                .value_name("DIR")
                .help("Override the data directory"),
        )
        .arg(
            Arg::new("mode")
                .long("mode")
                .value_name("MODE")
                .help("on_grid or off_grid"),
        )
        .arg(
            Arg::new("mine")
                .long("mine")
                .value_name("ADDRESS")
                .help("Mine blocks to this address"),
        )
        .arg(
            Arg::new("log")
                .long("log")
                .value_name("FILTER")
                .help("Log filter, e.g. info or logichain=debug"),
        )
        .arg(
            Arg::new("quiet")
                .long("quiet")
                .short('q')
                .action(ArgAction::SetTrue)
                .help("Only log warnings and errors"),
        )
}

fn load_config(matches: &clap::ArgMatches) -> Result<NodeConfig, String> {
    let config_path = matches.get_one::<String>("config").map(PathBuf::from);
    let mut config = NodeConfig::load(config_path.as_deref())?;

    if let Some(dir) = matches.get_one::<String>("data-dir") {
        config.data_dir = PathBuf::from(dir);
    }
    if let Some(mode) = matches.get_one::<String>("mode") {
        config.mode = mode.clone();
    }
    if let Some(miner) = matches.get_one::<String>("mine") {
        config.miner_address = Some(miner.clone());
    }
    if let Some(filter) = matches.get_one::<String>("log") {
        config.log_filter = filter.clone();
    }
    if matches.get_flag("quiet") {
        config.log_filter = "warn".into();
    }
    Ok(config)
}

fn init_tracing(filter: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter.to_string()));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn main() -> ExitCode {
    let matches = cli().get_matches();

    let node_config = match load_config(&matches) {
        Ok(config) => config,
        Err(message) => {
            eprintln!("configuration error: {message}");
            return ExitCode::from(1);
        }
    };
    init_tracing(&node_config.log_filter);
    info!(version = LOGICHAIN_VERSION, "logichain-node starting");

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(error) => {
            error!(%error, "failed to start runtime");
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(run(node_config)) {
        Ok(()) => {
            info!("shutdown complete");
            ExitCode::SUCCESS
        }
        Err(StartupError::Config(message)) => {
            error!(%message, "configuration error");
            ExitCode::from(1)
        }
        Err(StartupError::Persistence(message)) => {
            error!(%message, "persistence corruption; operator action required");
            ExitCode::from(2)
        }
        Err(StartupError::Genesis(message)) => {
            error!(%message, "incompatible genesis");
            ExitCode::from(3)
        }
    }
}

async fn run(node_config: NodeConfig) -> Result<(), StartupError> {
    let core = build(&node_config)?;
    let handle = core.handle.clone();
    let miner = core.miner;
    let mine_interval = Duration::from_secs(core.mine_interval_secs.max(1));

    // Event log: every appended block, reorg, and contract transition is
    // an append-only line for external observers.
    let mut events = handle.subscribe_events();
    let event_task = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "event subscriber lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // The consensus actor owns the chain; everything goes through it.
    let engine_task = tokio::spawn(core.engine.run(core.commands));

    // Optional miner loop.
    let miner_handle = handle.clone();
    let miner_task = miner.map(|address| {
        tokio::spawn(async move {
            info!(miner = %address, "mining enabled");
            loop {
                match miner_handle.mine_block(address).await {
                    Ok(hash) => info!(hash = %hex::encode(hash), "mined block"),
                    Err(error) => {
                        warn!(%error, "mining attempt failed");
                        tokio::time::sleep(mine_interval).await;
                    }
                }
                tokio::time::sleep(mine_interval).await;
            }
        })
    });

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("interrupt received; shutting down"),
        Err(error) => warn!(%error, "signal handler failed; shutting down"),
    }

    if let Some(task) = miner_task {
        task.abort();
    }
    handle.shutdown().await;
    let _ = engine_task.await;
    event_task.abort();
    Ok(())
}

fn log_event(event: &CoreEvent) {
    match event {
        CoreEvent::BlockAppended { hash, height } => {
            info!(height, hash = %hex::encode(hash), "event: block appended");
        }
        CoreEvent::Reorg {
            old_tip,
            new_tip,
            depth,
        } => {
            warn!(
                depth,
                old = %hex::encode(old_tip),
                new = %hex::encode(new_tip),
                "event: reorg"
            );
        }
        CoreEvent::ContractStateChanged { contract_id, state } => {
            info!(contract = %hex::encode(contract_id), %state, "event: contract state changed");
        }
        CoreEvent::SuspiciousFork { tip, depth } => {
            warn!(tip = %hex::encode(tip), depth, "event: suspicious fork recorded");
        }
        CoreEvent::FatalPersistence { detail } => {
            error!(%detail, "event: persistence failure; block application halted");
        }
    }
}
