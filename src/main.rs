//! Imager process over simulated hardware.
//!
//! Reads `{"topic": ..., "payload": ...}` command lines on stdin and writes
//! status lines for `status/imager` on stdout. Logs go to stderr.

use anyhow::{Context, Result};
use clap::Parser;
use planktoscope_imager::acquisition::{self, Coordinator, ImagerHandle};
use planktoscope_imager::channel::{JsonLinesStatus, Message, StatusReport, StatusSink};
use planktoscope_imager::config::{ImagerConfig, DEFAULT_CONFIG_PATH};
use planktoscope_imager::hardware::mock::{MockCamera, MockLight, MockSegmenter, MockStepper};
use planktoscope_imager::hardware::{CameraCapture, Hardware, SteppedPump};
use planktoscope_imager::logging::{self, OutputFormat, TracingConfig};
use planktoscope_imager::{ImagerState, Profile};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(name = "planktoscope-imager", version, about = "PlanktoScope stop-flow imager")]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override the configured log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Override the configured log format
    #[arg(long, value_parser = parse_format)]
    log_format: Option<OutputFormat>,

    /// Override the configured profile (baseline or segmentation)
    #[arg(long)]
    profile: Option<Profile>,

    /// On end of input, let a running acquisition finish instead of stopping it
    #[arg(long)]
    wait: bool,
}

fn parse_format(s: &str) -> std::result::Result<OutputFormat, String> {
    match s {
        "pretty" => Ok(OutputFormat::Pretty),
        "compact" => Ok(OutputFormat::Compact),
        "json" => Ok(OutputFormat::Json),
        other => Err(format!("unknown log format '{other}'")),
    }
}

fn build_hardware(config: &ImagerConfig) -> Hardware {
    let mut camera = MockCamera::new(config.simulation.camera_readout);
    if config.simulation.write_files {
        camera = camera.writing_files();
    }

    Hardware::new(
        Arc::new(SteppedPump::new(Arc::new(MockStepper::new()))),
        Arc::new(CameraCapture::new(Arc::new(camera))),
    )
    .with_segmenter(Arc::new(MockSegmenter::new(
        config.simulation.segmentation_time,
    )))
    .with_light(Arc::new(MockLight::new()))
}

/// Copy status reports to stdout as JSON lines until the channel closes.
async fn forward_status(mut reports: broadcast::Receiver<StatusReport>) {
    let out = JsonLinesStatus::new(std::io::stdout());
    loop {
        match reports.recv().await {
            Ok(report) => out.publish(&report),
            Err(RecvError::Lagged(missed)) => warn!(missed, "Status output fell behind"),
            Err(RecvError::Closed) => return,
        }
    }
}

async fn wait_until_stopped(
    handle: &ImagerHandle,
    mut reports: broadcast::Receiver<StatusReport>,
) -> Result<()> {
    if handle.snapshot().await?.state == ImagerState::Stop {
        return Ok(());
    }
    loop {
        match reports.recv().await {
            Ok(report) if report.state == ImagerState::Stop => return Ok(()),
            Ok(_) => {}
            // Missed reports may include the Stop, so ask directly
            Err(RecvError::Lagged(_)) => {
                if handle.snapshot().await?.state == ImagerState::Stop {
                    return Ok(());
                }
            }
            Err(RecvError::Closed) => return Ok(()),
        }
    }
}

async fn pump_commands(handle: &ImagerHandle) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await.context("reading stdin")? {
        if line.trim().is_empty() {
            continue;
        }
        let message: Message = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Ignoring line that is not a message");
                continue;
            }
        };
        debug!(topic = %message.topic, "Received message");
        if let Err(e) = handle.dispatch(&message).await {
            warn!(error = %e, topic = %message.topic, "Command rejected");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = ImagerConfig::load_from(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if let Some(format) = args.log_format {
        config.logging.format = format;
    }
    if let Some(profile) = args.profile {
        config.profile = profile;
    }
    config.validate()?;

    logging::init(TracingConfig::from_config(&config.logging)?)?;
    info!(profile = ?config.profile, "Starting imager");

    let status = Arc::new(config.status_channel());
    let forwarder = tokio::spawn(forward_status(status.subscribe()));
    let stop_watch = status.subscribe();
    let sink: Arc<dyn StatusSink> = status;
    let (coordinator, completions) = Coordinator::new(
        config.coordinator_settings(),
        build_hardware(&config),
        Some(sink),
    );
    let (handle, task) =
        acquisition::spawn(coordinator, completions, config.acquisition.queue_capacity);

    tokio::select! {
        result = pump_commands(&handle) => {
            result?;
            if args.wait {
                info!("End of input, waiting for the acquisition to finish");
                tokio::select! {
                    result = wait_until_stopped(&handle, stop_watch) => result?,
                    _ = tokio::signal::ctrl_c() => info!("Interrupted"),
                }
            }
        }
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }

    handle.shutdown().await?;
    let coordinator = task.await.context("imager task panicked")?;
    info!(runs = coordinator.archive().len(), "Imager stopped");

    // Dropping the coordinator closes the status channel and ends the forwarder
    drop(coordinator);
    forwarder.await.context("status forwarder panicked")?;
    Ok(())
}
