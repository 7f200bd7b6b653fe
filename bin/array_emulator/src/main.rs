use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, ValueEnum};
use tokio::runtime::Runtime;
use tracing::info;

use common::emulator::ArrayEmulator;
use common::logging::init_tracing;
use common::telemetry::PA_FAULT_THRESHOLD;
use common::{load_config, TestbedConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ServerMode {
    Threaded,
    Async,
}

/// Stands in for the array controller on the network.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Testbed configuration file
    #[arg(short, long, value_name = "FILE", default_value = "configs/testbed.toml")]
    config: PathBuf,

    /// Address to answer on; defaults to `emulator.bind`
    #[arg(short, long, value_name = "ADDR")]
    bind: Option<SocketAddr>,

    #[arg(short, long, value_enum, default_value_t = ServerMode::Threaded)]
    mode: ServerMode,

    /// Report a failing power amplifier on this element (repeatable)
    #[arg(long, value_name = "ELEMENT")]
    pa_fault: Vec<usize>,

    /// Display more information on the console. Can be used multiple times.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = if cli.config.exists() {
        load_config(&cli.config)
            .with_context(|| format!("loading config {}", cli.config.display()))?
    } else {
        TestbedConfig::default()
    };
    config.log.level = config.log.level.raised_by(cli.verbose);
    init_tracing(&config.log);

    let mut emulator = ArrayEmulator::from_config(&config)?;
    for &element in &cli.pa_fault {
        emulator.set_pa_power(element, PA_FAULT_THRESHOLD - 45);
    }

    let bind = cli.bind.unwrap_or(config.emulator.bind);
    let shutdown = Arc::new(AtomicBool::new(false));
    let runtime = Runtime::new().context("building tokio runtime")?;

    println!("========================================");
    println!("Array Controller Emulator");
    println!("========================================");
    println!("Listening on: {bind}");
    println!(
        "Peripherals: {}",
        config.emulator.peripherals.len().min(config.protocol.peripherals)
    );
    println!("Busy cycles per command: {}", config.emulator.busy_cycles);
    println!("Press Ctrl-C to stop");
    println!("========================================\n");

    match cli.mode {
        ServerMode::Threaded => {
            let socket = std::net::UdpSocket::bind(bind)
                .with_context(|| format!("binding {bind}"))?;
            let stop = Arc::clone(&shutdown);
            let server = thread::Builder::new()
                .name("wpt-emulator".into())
                .spawn(move || threaded_impl::run_emulator_thread(socket, emulator, stop))?;

            runtime.block_on(tokio::signal::ctrl_c())?;
            info!("stopping emulator");
            shutdown.store(true, Ordering::Relaxed);
            server
                .join()
                .map_err(|_| anyhow!("emulator thread panicked"))??;
        }
        ServerMode::Async => runtime.block_on(async {
            let socket = tokio::net::UdpSocket::bind(bind)
                .await
                .with_context(|| format!("binding {bind}"))?;
            let server = tokio::spawn(async_impl::run_emulator_task(
                socket,
                emulator,
                Arc::clone(&shutdown),
            ));

            tokio::signal::ctrl_c().await?;
            info!("stopping emulator");
            shutdown.store(true, Ordering::Relaxed);
            server.await??;
            Ok::<_, anyhow::Error>(())
        })?,
    }

    println!("Emulator stopped.");
    Ok(())
}
