mod menu;
mod session;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use common::beamforming::PhaseProfile;
use common::dataset::write_dataset;
use common::logging::init_tracing;
use common::survey::SurveyPlan;
use common::{
    load_config, CommandFrame, CommandTag, LinkStatus, LoopEvent, ScanMethod, TelemetrySnapshot,
    TestbedConfig,
};
use session::{LoopMode, Session};

/// How long the console waits for a command to finish before giving up on it.
const COMMAND_WAIT: Duration = Duration::from_secs(30);
/// A survey is abandoned when the loop stays silent this long.
const SURVEY_STALL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(version, about = "Phased-array wireless power testbed controller", long_about = None)]
struct Cli {
    /// Testbed configuration file
    #[arg(short, long, value_name = "FILE", default_value = "configs/testbed.toml")]
    config: PathBuf,

    /// Control loop implementation
    #[arg(short, long, value_enum, default_value_t = LoopMode::Threaded)]
    mode: LoopMode,

    /// Display more information on the console. Can be used multiple times.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Interactive operator menu (default)
    Console,
    /// Run the configured survey to completion, logging every position
    Survey,
    /// Write the synthetic steering dataset for the configured survey plan
    Dataset {
        /// Output directory; defaults to the configured CSV directory
        #[arg(short, long, value_name = "DIR")]
        out: Option<PathBuf>,
    },
    /// Estimate the pointing direction of a set of phase codes
    Locate {
        /// One signed code per element, row-major
        #[arg(required = true, allow_negative_numbers = true)]
        codes: Vec<i8>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = if cli.config.exists() {
        load_config(&cli.config)
            .with_context(|| format!("loading config {}", cli.config.display()))?
    } else {
        eprintln!(
            "Config {} not found, using built-in defaults",
            cli.config.display()
        );
        TestbedConfig::default()
    };
    config.log.level = config.log.level.raised_by(cli.verbose);
    init_tracing(&config.log);

    match cli.command.unwrap_or(Commands::Console) {
        Commands::Console => run_console(&config, cli.mode),
        Commands::Survey => run_survey(&config, cli.mode),
        Commands::Dataset { out } => run_dataset(&config, out),
        Commands::Locate { codes } => run_locate(&config, &codes),
    }
}

fn run_console(config: &TestbedConfig, mode: LoopMode) -> Result<()> {
    println!("===========================================");
    println!("Welcome to the WPT Testbed");
    println!("===========================================");
    println!(
        "Array {}x{} at {:.2} GHz, peer {}, {:?} loop",
        config.array.cols,
        config.array.rows,
        config.array.frequency_hz / 1e9,
        config.network.peer,
        mode
    );

    let mut session = Session::start(config, mode)?;
    let outcome = console_loop(&mut session, config);
    session.stop();
    outcome
}

fn console_loop(session: &mut Session, config: &TestbedConfig) -> Result<()> {
    loop {
        menu::show_menu()?;

        let frame = match menu::get_user_choice()? {
            Some(1) => CommandFrame::Scan(ScanMethod::Steering),
            Some(2) => CommandFrame::Scan(ScanMethod::FullSweep),
            Some(3) => match ask_peripheral(config)? {
                Some(index) => CommandFrame::Steer(index),
                None => continue,
            },
            Some(4) => CommandFrame::Reset,
            Some(5) => match ask_attenuation()? {
                Some(code) => CommandFrame::SetLoss(code),
                None => continue,
            },
            Some(6) => match ask_phase_codes(config)? {
                Some(codes) => CommandFrame::SetPhase(codes),
                None => continue,
            },
            Some(7) => {
                print_telemetry(&session.controller().current_telemetry());
                print_diagnostics(session);
                menu::wait_for_enter()?;
                continue;
            }
            Some(8) => {
                run_survey_session(session, SurveyPlan::from_config(&config.survey))?;
                menu::wait_for_enter()?;
                continue;
            }
            Some(9) => {
                println!("Goodbye!");
                return Ok(());
            }
            _ => {
                println!("Invalid choice. Please select 1-9.");
                continue;
            }
        };

        run_command(session, frame);
        menu::wait_for_enter()?;
    }
}

fn ask_peripheral(config: &TestbedConfig) -> Result<Option<u32>> {
    let count = config.protocol.peripherals;
    let Some(answer) = menu::prompt(&format!("Rx# (1-{count})"))? else {
        return Ok(None);
    };
    match answer.parse::<u32>() {
        Ok(n) if n >= 1 && n as usize <= count => Ok(Some(n - 1)),
        _ => {
            println!("Rx# must be between 1 and {count}");
            Ok(None)
        }
    }
}

fn ask_attenuation() -> Result<Option<u8>> {
    let Some(answer) = menu::prompt("Attenuation code (0-127, 0.25 dB/step)")? else {
        return Ok(None);
    };
    match answer.parse::<u8>() {
        Ok(code) if code <= 127 => Ok(Some(code)),
        _ => {
            println!("Attenuation code must be between 0 and 127");
            Ok(None)
        }
    }
}

fn ask_phase_codes(config: &TestbedConfig) -> Result<Option<Vec<u8>>> {
    let elements = config.array.cols * config.array.rows;
    let levels = 1u32 << config.array.phase_bits;
    let Some(answer) = menu::prompt(&format!("{elements} phase codes (0-{})", levels - 1))? else {
        return Ok(None);
    };
    let parsed: Result<Vec<u8>, _> = answer
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|s| !s.is_empty())
        .map(str::parse::<u8>)
        .collect();
    match parsed {
        Ok(codes) if codes.len() == elements && codes.iter().all(|&c| u32::from(c) < levels) => {
            Ok(Some(codes))
        }
        _ => {
            println!("Expected {elements} codes between 0 and {}", levels - 1);
            Ok(None)
        }
    }
}

fn run_command(session: &mut Session, frame: CommandFrame) {
    let tag = frame.tag();
    if !session.controller().issue_command(frame) {
        println!("Array is busy, {tag} not accepted");
        return;
    }
    println!("{tag} issued, waiting for completion...");

    let finished = session.wait_until(COMMAND_WAIT, report_event, |e| match e {
        LoopEvent::Finished { tag: t, .. } | LoopEvent::Dropped(t) => *t == tag,
        _ => false,
    });
    match finished {
        Some(LoopEvent::Finished { snapshot, .. }) => {
            println!("{tag} finished");
            if matches!(tag, CommandTag::Scan | CommandTag::Steer) {
                print_telemetry(&snapshot);
            }
        }
        Some(_) => println!("{tag} was dropped by the controller"),
        None => println!("{tag} did not finish within {}s", COMMAND_WAIT.as_secs()),
    }
}

fn run_survey(config: &TestbedConfig, mode: LoopMode) -> Result<()> {
    println!("\n=== Running Survey ===");
    let mut session = Session::start(config, mode)?;
    let outcome = run_survey_session(&mut session, SurveyPlan::from_config(&config.survey));
    session.stop();
    outcome
}

fn run_survey_session(session: &mut Session, plan: SurveyPlan) -> Result<()> {
    let total = plan.len();
    if !session.controller().start_survey(plan) {
        bail!("controller busy, survey not started");
    }
    println!("Survey of {total} positions started");

    let mut done = 0usize;
    loop {
        let Some(event) = session.next_event(SURVEY_STALL) else {
            bail!(
                "survey stalled after {done}/{total} positions (no loop activity for {}s)",
                SURVEY_STALL.as_secs()
            );
        };
        report_event(&event);
        match event {
            LoopEvent::SurveyMoved(position) => {
                done += 1;
                println!("[{done}/{total}] moving to {position}");
            }
            LoopEvent::SurveyComplete => {
                info!(positions = total, "survey complete");
                println!("Survey complete");
                return Ok(());
            }
            _ => {}
        }
    }
}

fn run_dataset(config: &TestbedConfig, out: Option<PathBuf>) -> Result<()> {
    let dir = out.unwrap_or_else(|| config.log.csv_dir.clone());
    let engine = config.engine()?;
    let quantizer = config.quantizer()?;
    let plan = SurveyPlan::from_config(&config.survey);
    let path = write_dataset(&dir, &engine, &quantizer, &plan)
        .with_context(|| format!("writing dataset to {}", dir.display()))?;
    println!("Wrote {} rows to {}", plan.len(), path.display());
    Ok(())
}

fn run_locate(config: &TestbedConfig, codes: &[i8]) -> Result<()> {
    let engine = config.engine()?;
    let quantizer = config.quantizer()?;
    let elements = engine.geometry().element_count();
    if codes.len() != elements {
        bail!("expected {elements} phase codes, got {}", codes.len());
    }
    let profile = PhaseProfile::from_codes(engine.geometry(), &quantizer, codes);
    let direction = engine.estimate_direction(&profile);
    println!(
        "θ = {:.1}°, φ = {:.1}°",
        direction.theta_deg, direction.phi_deg
    );
    Ok(())
}

fn report_event(event: &LoopEvent) {
    match event {
        LoopEvent::Started(tag) => println!("  {tag} started"),
        LoopEvent::Disconnected => warn!("controller link lost"),
        LoopEvent::Reconnected => info!("controller link restored"),
        LoopEvent::PaFault(elements) => println!("  PA fault on elements {elements:?}"),
        _ => {}
    }
}

fn print_telemetry(snapshot: &TelemetrySnapshot) {
    println!("\n=== Telemetry (frame {}) ===", snapshot.frames);
    println!(
        "Link: {}  Controller: {:?}  Echo: {}",
        snapshot.link, snapshot.controller, snapshot.echoed
    );
    if snapshot.link == LinkStatus::Disconnected {
        println!("(no response from the controller)");
    }
    println!(
        "Attenuation: {} ({:.2} dB)",
        snapshot.attenuation,
        common::beamforming::attenuation_db(snapshot.attenuation)
    );
    println!("Phases: {:?}", snapshot.current_phases);
    if !snapshot.pa_faults.is_empty() {
        println!("PA faults: {:?}", snapshot.pa_faults);
    }

    let mut any = false;
    for view in snapshot.present() {
        any = true;
        println!(
            "  Rx#{}: θ={:.1}° φ={:.1}°  battery {}%  signal {}/5{}",
            view.index + 1,
            view.direction.theta_deg,
            view.direction.phi_deg,
            view.battery_percent,
            view.signal_level,
            if view.targeted { "  [targeted]" } else { "" }
        );
    }
    if !any {
        println!("  No peripherals present");
    }
}

fn print_diagnostics(session: &Session) {
    let d = session.controller().diagnostics();
    println!(
        "Frames sent/received: {}/{}  timeouts: {}  malformed: {}  send errors: {}",
        d.frames_sent, d.frames_received, d.timeouts, d.malformed_frames, d.send_errors
    );
    println!(
        "Busy rejections: {}  dropped events: {}  dropped commands: {}",
        d.busy_rejections, d.dropped_events, d.dropped_commands
    );
}
