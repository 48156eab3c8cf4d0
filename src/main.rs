use std::{
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver},
    },
    thread,
    time::Duration,
};

use clap::{Parser, Subcommand};
use log::{error, info, warn};
use serde::Serialize;

use lapcoach::{
    CoachConfig, CoachError, FileBasedStore, LapSessionTracker, LiveEvent, analysis,
    store::{LapId, SessionId},
    telemetry::{self, MockSampleSource},
    writer,
};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Config file to use instead of the one in the user config directory
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Where sessions, laps and records are stored
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Feed a recorded snapshot stream (JSON Lines) through the tracker
    Replay {
        #[arg(short, long)]
        input: PathBuf,

        /// Also write every live event to this JSON Lines file
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Replay at the configured sampling interval instead of as fast as possible
        #[arg(long)]
        realtime: bool,
    },
    AnalyzeSession {
        #[arg(short, long)]
        session: u64,
    },
    AnalyzeLap {
        #[arg(short, long)]
        lap: u64,
    },
    /// Recent races on a track
    History {
        #[arg(short, long)]
        track: String,

        #[arg(short, long)]
        vehicle: Option<String>,

        #[arg(short = 'n', long, default_value_t = 5)]
        count: usize,
    },
    /// Last complete laps of a session and how consistent they were
    Recent {
        #[arg(short, long)]
        session: u64,

        #[arg(short = 'n', long, default_value_t = 5)]
        count: usize,
    },
}

fn load_config(path: Option<&Path>, data_dir: Option<PathBuf>) -> Result<CoachConfig, CoachError> {
    let mut config = match path {
        Some(path) => CoachConfig::from_path(path)?,
        None => CoachConfig::from_local_file()?.unwrap_or_default(),
    };
    if data_dir.is_some() {
        config.data_dir = data_dir;
    }
    config.validate()?;
    Ok(config)
}

fn print_json<T: Serialize>(value: &T) -> Result<(), CoachError> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| CoachError::WriterError { source: e.into() })?;
    println!("{}", json);
    Ok(())
}

fn report_events(event_receiver: Receiver<LiveEvent>) {
    for event in &event_receiver {
        match event {
            LiveEvent::SessionStarted {
                session_id,
                track,
                vehicle,
                kind,
            } => info!("Session {}: {} at {} in {}", session_id, kind, track, vehicle),
            LiveEvent::LapCompleted {
                lap_number,
                lap_time,
                is_valid,
                best_lap_time,
            } => info!(
                "Lap {}: {:.3}s{} (best {})",
                lap_number,
                lap_time,
                if is_valid { "" } else { " invalid" },
                best_lap_time.map_or("-".to_string(), |t| format!("{:.3}s", t))
            ),
            LiveEvent::SessionEnded { analysis, .. } => {
                if let Err(e) = print_json(&analysis) {
                    warn!("Could not print session analysis: {}", e);
                }
            }
            LiveEvent::StorageError { lap_id, reason } => {
                warn!("Storage error (lap {:?}): {}", lap_id, reason)
            }
            LiveEvent::SourceConnected
            | LiveEvent::SourceDisconnected
            | LiveEvent::Sample(_) => {}
        }
    }
}

fn replay(
    input: &Path,
    output: Option<PathBuf>,
    realtime: bool,
    config: CoachConfig,
    running: Arc<AtomicBool>,
) -> Result<(), CoachError> {
    let source = MockSampleSource::from_file(input)?;
    info!(
        "Replaying {} snapshots from {}",
        source.remaining(),
        input.display()
    );
    let store = FileBasedStore::new(config.resolved_data_dir()?)?;
    let interval = if realtime {
        Duration::from_millis(config.sample_interval_ms)
    } else {
        Duration::ZERO
    };

    let (event_tx, event_rx) = mpsc::channel::<LiveEvent>();
    let reporter = thread::spawn(move || report_events(event_rx));

    // with an output file every event also goes to the writer thread
    let (event_writer_tx, writer) = match output {
        Some(output_file) => {
            let (event_writer_tx, event_writer_rx) = mpsc::channel::<LiveEvent>();
            let writer =
                thread::spawn(move || writer::write_events(&output_file, event_writer_rx));
            (Some(event_writer_tx), Some(writer))
        }
        None => (None, None),
    };

    let mut tracker = LapSessionTracker::new(store, config);
    let collected = telemetry::collect_telemetry(
        source,
        &mut tracker,
        event_tx,
        event_writer_tx,
        running,
        interval,
    );

    if reporter.join().is_err() {
        warn!("Event reporter stopped unexpectedly");
    }
    if let Some(writer) = writer {
        match writer.join() {
            Ok(written) => written?,
            Err(_) => warn!("Event writer stopped unexpectedly"),
        }
    }
    collected
}

fn run(cli: &Args, running: Arc<AtomicBool>) -> Result<(), CoachError> {
    let config = load_config(cli.config.as_deref(), cli.data_dir.clone())?;
    match &cli.command {
        Commands::Replay {
            input,
            output,
            realtime,
        } => replay(input, output.clone(), *realtime, config, running),
        Commands::AnalyzeSession { session } => {
            let mut store = FileBasedStore::new(config.resolved_data_dir()?)?;
            let analysis = analysis::analyze_session(&mut store, SessionId(*session), &config)?;
            print_json(&analysis)
        }
        Commands::AnalyzeLap { lap } => {
            let store = FileBasedStore::new(config.resolved_data_dir()?)?;
            print_json(&analysis::analyze_lap(&store, LapId(*lap), &config)?)
        }
        Commands::History {
            track,
            vehicle,
            count,
        } => {
            let store = FileBasedStore::new(config.resolved_data_dir()?)?;
            print_json(&analysis::track_history(
                &store,
                track,
                vehicle.as_deref(),
                *count,
            )?)
        }
        Commands::Recent { session, count } => {
            let store = FileBasedStore::new(config.resolved_data_dir()?)?;
            print_json(&analysis::recent_laps(&store, SessionId(*session), *count)?)
        }
    }
}

fn main() {
    colog::init();

    let cli = Args::parse();
    let running = Arc::new(AtomicBool::new(true));
    let handler_flag = running.clone();
    ctrlc::set_handler(move || {
        println!("Exiting...");
        handler_flag.store(false, Ordering::SeqCst);
    })
    .expect("Could not set Ctrl-C handler");

    if let Err(e) = run(&cli, running) {
        error!("{}", e);
        std::process::exit(1);
    }
}
