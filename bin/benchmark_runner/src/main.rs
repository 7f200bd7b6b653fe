use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, ValueEnum};
use criterion::{black_box, Criterion};

use common::emulator::ArrayEmulator;
use common::protocol::encode_command;
use common::{
    load_config, CommandFrame, CommandTag, LoopEvent, ScanMethod, TestbedConfig, TestbedController,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Threaded,
    Async,
    Both,
}

#[derive(Parser, Debug)]
#[command(version, about = "Beamforming and link benchmarks", long_about = None)]
struct Cli {
    /// Testbed configuration file
    #[arg(value_name = "FILE", default_value = "configs/testbed.toml")]
    config: PathBuf,

    /// Which link loops to time
    #[arg(value_enum, default_value_t = Mode::Both)]
    mode: Mode,

    /// Run the criterion statistical benchmarks of the engine and codec
    #[arg(long)]
    criterion: bool,

    /// SCAN commands per link run
    #[arg(long, default_value_t = 20)]
    scans: usize,
}

fn analyze_round_trips(samples: &[Duration], name: &str) {
    if samples.is_empty() {
        println!("{}: No results to analyze", name);
        return;
    }

    let millis: Vec<f64> = samples.iter().map(|d| d.as_secs_f64() * 1000.0).collect();
    let avg = millis.iter().sum::<f64>() / millis.len() as f64;
    let min = millis.iter().fold(f64::INFINITY, |a, &b| a.min(b));
    let max = millis.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));

    let mut sorted = millis.clone();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let p95 = sorted[((sorted.len() as f64 * 0.95).ceil() as usize).saturating_sub(1)];

    println!("\n=== {} Round-Trip Analysis ===", name);
    println!("Completed scans: {}", samples.len());
    println!(
        "SCAN issue-to-finish (ms): avg={:.2}, min={:.2}, max={:.2}, p95={:.2}",
        avg, min, max, p95
    );
}

fn benchmark_engine(c: &mut Criterion, config: &TestbedConfig) -> Result<()> {
    let engine = config.engine()?;
    let quantizer = config.quantizer()?;
    let layout = config.layout()?;

    c.bench_function("desired_phase", |b| {
        b.iter(|| engine.desired_phase(black_box(30.0), black_box(45.0)));
    });

    let profile = engine.desired_phase(30.0, 45.0);
    c.bench_function("estimate_direction", |b| {
        b.iter(|| engine.estimate_direction(black_box(&profile)));
    });

    let codes = profile.quantize(&quantizer);
    let frame = CommandFrame::SetPhase(codes);
    c.bench_function("encode_command", |b| {
        b.iter(|| encode_command(black_box(&frame)));
    });

    let telemetry = ArrayEmulator::from_config(config)?.telemetry();
    let datagram = layout.encode(&telemetry);
    c.bench_function("decode_telemetry", |b| {
        b.iter(|| layout.decode(black_box(&datagram)));
    });
    Ok(())
}

/// Loopback config: both ends on 127.0.0.1 with tight polling.
fn loopback_config(base: &TestbedConfig, peer: SocketAddr) -> Result<TestbedConfig> {
    let mut config = base.clone();
    config.network.bind = "127.0.0.1:0".parse()?;
    config.network.peer = peer;
    config.network.poll_interval_ms = 1;
    config.log.enable_csv = false;
    Ok(config)
}

fn wait_finished(next: &mut dyn FnMut(Duration) -> Option<LoopEvent>) -> Result<()> {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        match next(left) {
            Some(LoopEvent::Finished { tag: CommandTag::Scan, .. }) => return Ok(()),
            Some(LoopEvent::Disconnected) => bail!("emulator stopped answering"),
            Some(_) => {}
            None => bail!("SCAN did not finish in time"),
        }
    }
}

fn scan_rounds(
    controller: &dyn TestbedController,
    scans: usize,
    mut next: impl FnMut(Duration) -> Option<LoopEvent>,
) -> Result<Vec<Duration>> {
    let mut samples = Vec::with_capacity(scans);
    for _ in 0..scans {
        let start = Instant::now();
        while !controller.issue_command(CommandFrame::Scan(ScanMethod::Steering)) {
            thread::sleep(Duration::from_millis(1));
            if start.elapsed() > Duration::from_secs(10) {
                bail!("controller never accepted a SCAN");
            }
        }
        wait_finished(&mut next)?;
        samples.push(start.elapsed());
    }
    Ok(samples)
}

fn run_threaded(base: &TestbedConfig, scans: usize) -> Result<Vec<Duration>> {
    let server_socket = std::net::UdpSocket::bind("127.0.0.1:0")?;
    let server_addr = server_socket.local_addr()?;
    let emulator = ArrayEmulator::from_config(base)?;
    let stop = Arc::new(AtomicBool::new(false));
    let server_stop = Arc::clone(&stop);
    let server = thread::spawn(move || {
        threaded_impl::run_emulator_thread(server_socket, emulator, server_stop)
    });

    let controller = threaded_impl::spawn(&loopback_config(base, server_addr)?)?;
    let samples = scan_rounds(&controller, scans, |wait| {
        controller.events().recv_timeout(wait).ok()
    });
    controller.stop();

    stop.store(true, Ordering::Relaxed);
    server
        .join()
        .map_err(|_| anyhow!("emulator thread panicked"))??;
    samples
}

fn run_async(base: &TestbedConfig, scans: usize) -> Result<Vec<Duration>> {
    let rt = tokio::runtime::Runtime::new().context("building tokio runtime")?;
    let stop = Arc::new(AtomicBool::new(false));

    let (server, mut controller) = rt.block_on(async {
        let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await?;
        let server_addr = socket.local_addr()?;
        let emulator = ArrayEmulator::from_config(base)?;
        let server = tokio::spawn(async_impl::run_emulator_task(
            socket,
            emulator,
            Arc::clone(&stop),
        ));
        let controller = async_impl::spawn(&loopback_config(base, server_addr)?).await?;
        Ok::<_, anyhow::Error>((server, controller))
    })?;

    let mut samples = Vec::with_capacity(scans);
    let mut outcome = Ok(());
    for _ in 0..scans {
        let start = Instant::now();
        while !controller.issue_command(CommandFrame::Scan(ScanMethod::Steering)) {
            rt.block_on(tokio::time::sleep(Duration::from_millis(1)));
        }
        let events = controller.events();
        let mut next = |wait: Duration| {
            rt.block_on(tokio::time::timeout(wait, events.recv()))
                .ok()
                .flatten()
        };
        if let Err(e) = wait_finished(&mut next) {
            outcome = Err(e);
            break;
        }
        samples.push(start.elapsed());
    }

    rt.block_on(controller.stop());
    stop.store(true, Ordering::Relaxed);
    rt.block_on(server)??;
    outcome.map(|_| samples)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = if cli.config.exists() {
        load_config(&cli.config)
            .with_context(|| format!("loading config {}", cli.config.display()))?
    } else {
        TestbedConfig::default()
    };

    println!("========================================");
    println!("WPT Testbed Benchmark");
    println!("========================================");
    println!("Config: {}", cli.config.display());
    println!(
        "Array: {}x{}, {} bit shifters, {}° grid",
        config.array.cols, config.array.rows, config.array.phase_bits, config.beam.grid_step_deg
    );
    println!("Mode: {:?}", cli.mode);
    if cli.criterion {
        println!("Using Criterion for statistical analysis");
    }
    println!("========================================\n");

    if cli.criterion {
        let mut criterion = Criterion::default()
            .sample_size(20)
            .measurement_time(Duration::from_secs(10));
        benchmark_engine(&mut criterion, &config)?;

        println!("\n========================================");
        println!("Criterion statistical analysis complete!");
        println!("Check the target/criterion directory for detailed HTML reports.");
        println!("========================================");
        return Ok(());
    }

    if matches!(cli.mode, Mode::Threaded | Mode::Both) {
        println!("Running THREADED link...");
        let start = Instant::now();
        let samples = run_threaded(&config, cli.scans)?;
        println!("Threaded run completed in {:.2} seconds", start.elapsed().as_secs_f64());
        analyze_round_trips(&samples, "THREADED");
    }

    if matches!(cli.mode, Mode::Async | Mode::Both) {
        println!("\nRunning ASYNC link...");
        let start = Instant::now();
        let samples = run_async(&config, cli.scans)?;
        println!("Async run completed in {:.2} seconds", start.elapsed().as_secs_f64());
        analyze_round_trips(&samples, "ASYNC");
    }

    println!("\n========================================");
    println!("Benchmark complete!");
    println!("========================================");
    Ok(())
}
