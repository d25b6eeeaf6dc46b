//! Headless transfer demo.
//!
//! Builds two in-memory simulation processes, fills a platform on the
//! first, and moves it to the second through loopback control channels,
//! ticking both processes and polling the controller until the transfer
//! settles. Prints the transaction log at the end.
//!
//! ```text
//! starlift-demo --chests 400 --items 10000
//! starlift-demo --mixed --config starlift.toml
//! RUST_LOG=starlift=debug starlift-demo
//! ```

use std::cell::RefCell;
use std::path::PathBuf;
use std::process::ExitCode;
use std::rc::Rc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use starlift_controller::channel::LoopbackChannel;
use starlift_controller::config::ControllerConfig;
use starlift_controller::transfer::TransferState;
use starlift_controller::{ControllerError, TransferController};
use starlift_core::config::{ConfigError, TransferConfig, load_file};
use starlift_core::id::InstanceId;
use starlift_core::instance::Instance;
use starlift_core::test_utils::{MemoryWorld, build_mixed_platform, build_storage_platform};
use starlift_core::world::World;

/// Simulated milliseconds per tick (60 UPS).
const TICK_MS: u64 = 16;

#[derive(Parser)]
#[command(
    name = "starlift-demo",
    version,
    about = "Move a platform between two in-memory processes"
)]
struct Cli {
    /// Per-process transfer config (.ron, .toml or .json).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Controller config (.ron, .toml or .json).
    #[arg(long)]
    controller_config: Option<PathBuf>,

    /// Append the transaction log to this file as JSON lines.
    #[arg(long)]
    log_path: Option<PathBuf>,

    /// Name of the platform to move.
    #[arg(long, default_value = "starlift-demo")]
    platform: String,

    /// Chests on the generated storage platform.
    #[arg(long, default_value = "500")]
    chests: usize,

    /// Items spread across the chests.
    #[arg(long, default_value = "10000")]
    items: u64,

    /// Use the small mixed platform (belts, fluids, circuits) instead.
    #[arg(long)]
    mixed: bool,

    /// Give up after this many ticks.
    #[arg(long, default_value = "100000")]
    max_ticks: u64,
}

#[derive(Debug, thiserror::Error)]
enum DemoError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Controller(#[from] ControllerError),

    #[error("transfer did not settle within {0} ticks")]
    Stalled(u64),
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).compact().init();
}

fn tick(instance: &Rc<RefCell<Instance<MemoryWorld>>>) {
    let mut instance = instance.borrow_mut();
    instance.world_mut().advance(1);
    instance.on_tick();
}

fn run(cli: Cli) -> Result<TransferState, DemoError> {
    let transfer_config: TransferConfig = match &cli.config {
        Some(path) => load_file(path)?,
        None => TransferConfig::default(),
    };
    let mut controller_config = match &cli.controller_config {
        Some(path) => ControllerConfig::load(path)?,
        None => ControllerConfig::default(),
    };
    if cli.log_path.is_some() {
        controller_config.transaction_log_path = cli.log_path.clone();
    }

    let mut world = MemoryWorld::new();
    if cli.mixed {
        build_mixed_platform(&mut world, &cli.platform);
    } else {
        build_storage_platform(&mut world, &cli.platform, cli.chests, cli.items);
    }
    tracing::info!(platform = %cli.platform, entities = world.entity_count(), "platform_built");

    let source =
        Rc::new(RefCell::new(Instance::new(InstanceId(1), world, transfer_config.clone())));
    let destination = Rc::new(RefCell::new(Instance::new(
        InstanceId(2),
        MemoryWorld::new(),
        transfer_config,
    )));

    let mut controller = TransferController::new(controller_config)?;
    let from = controller.register(Box::new(LoopbackChannel::new(source.clone())));
    let to = controller.register(Box::new(LoopbackChannel::new(destination.clone())));

    let id = controller.start_transfer(&cli.platform, from, to, 0)?;
    let mut now = 0;
    let mut ticks = 0;
    let state = loop {
        if let Some(record) = controller.transfer(id)
            && record.state.is_terminal()
        {
            break record.state;
        }
        if ticks >= cli.max_ticks {
            return Err(DemoError::Stalled(ticks));
        }
        tick(&source);
        tick(&destination);
        ticks += 1;
        now += TICK_MS;
        controller.poll(now);
    };

    println!("{} after {ticks} ticks ({now} ms simulated)", state.as_str());
    for event in controller.log().for_transfer(id) {
        println!(
            "  {:>8} ms  +{:>6} ms  {:<12} {}",
            event.elapsed_ms,
            event.delta_ms,
            event.state.as_str(),
            event.detail
        );
    }
    if let Some(record) = controller.transfer(id)
        && let Some(losses) = &record.losses
    {
        println!("losses: {}", losses.summary());
    }
    Ok(state)
}

fn main() -> ExitCode {
    init_logging();
    match run(Cli::parse()) {
        Ok(TransferState::Completed) => ExitCode::SUCCESS,
        Ok(_) => ExitCode::from(2),
        Err(err) => {
            tracing::error!(error = %err, "demo_failed");
            ExitCode::FAILURE
        }
    }
}
