use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::RecvTimeoutError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use laptrack::{Backend, LapDetector, Settings};

#[derive(Parser, Debug)]
#[command(version, about = "Lap timing over fiducial markers crossing a finish line")]
struct Opts {
    /// Settings file, created from the environment when missing. Without it
    /// settings come from the environment only.
    #[arg(short, long)]
    settings: Option<PathBuf>,

    /// Stop after this many seconds.
    #[arg(short, long)]
    duration: Option<f64>,

    /// Sweep the manual focus once the camera is up.
    #[arg(long)]
    autofocus: bool,

    /// Write the last annotated frame here on exit.
    #[arg(long)]
    snapshot: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("laptrack=info")),
        )
        .init();

    let opts = Opts::parse();

    let settings = match &opts.settings {
        Some(path) => Settings::load_or_create(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => Settings::from_env().context("reading settings from environment")?,
    };

    let detector = LapDetector::new(settings, Backend::opencv())?;
    let report = detector.start().context("starting detector")?;

    for (property, value, reason) in &report.failed {
        warn!(%property, value, %reason, "camera property ignored");
    }

    if opts.autofocus {
        match detector.auto_tune_focus() {
            Ok(tuning) => info!(value = tuning.value, score = tuning.score, "focus set"),
            Err(err) => error!(error = %err, "focus tuning failed"),
        }
    }

    let deadline = opts
        .duration
        .map(|secs| Instant::now() + Duration::from_secs_f64(secs.max(0.0)));
    let laps = detector.laps();

    loop {
        if deadline.map_or(false, |d| Instant::now() >= d) {
            break;
        }

        match laps.recv_timeout(Duration::from_millis(200)) {
            Ok(lap) => println!("{}", serde_json::to_string(&lap)?),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    if let Some(path) = &opts.snapshot {
        match detector.latest_frame() {
            Some(jpeg) => std::fs::write(path, &jpeg[..])
                .with_context(|| format!("writing snapshot to {}", path.display()))?,
            None => warn!("no frame captured, snapshot skipped"),
        }
    }

    detector.stop();

    Ok(())
}
