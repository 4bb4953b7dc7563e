//! Stop-Flow Simulation
//!
//! Runs a short acquisition against simulated hardware and prints every
//! status report the imager publishes.
//!
//! Key concepts:
//! - Hardware context built once and handed to the coordinator
//! - Actor handle for start/stop requests
//! - Status reports on a broadcast channel
//! - Archived run record with the visited states
//!
//! Run with: cargo run --example stopflow_simulation

use planktoscope_imager::acquisition::{self, Coordinator, CoordinatorSettings};
use planktoscope_imager::channel::{BroadcastStatus, StatusSink};
use planktoscope_imager::hardware::mock::{MockCamera, MockLight, MockStepper};
use planktoscope_imager::hardware::{CameraCapture, Hardware, SteppedPump};
use planktoscope_imager::logging::{self, TracingConfig};
use planktoscope_imager::{AcquisitionJob, ImagerState, PumpDirection};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init(TracingConfig::new(tracing::Level::INFO))?;

    println!("=== Stop-Flow Simulation ===\n");

    let stepper = Arc::new(MockStepper::new());
    let hardware = Hardware::new(
        Arc::new(SteppedPump::new(Arc::clone(&stepper))),
        Arc::new(CameraCapture::new(Arc::new(MockCamera::new(
            Duration::from_millis(50),
        )))),
    )
    .with_light(Arc::new(MockLight::new()));

    let status = Arc::new(BroadcastStatus::new(64));
    let mut reports = status.subscribe();
    let sink: Arc<dyn StatusSink> = status.clone();

    let (coordinator, completions) =
        Coordinator::new(CoordinatorSettings::default(), hardware, Some(sink));
    let (handle, task) = acquisition::spawn(coordinator, completions, 16);

    // 0.05 mL per frame at the maximum flow rate keeps the demo short
    let job = AcquisitionJob::new(0.05, 50.0, 3)
        .with_direction(PumpDirection::Forward)
        .with_stabilization(Duration::from_millis(100))
        .with_output_dir("/tmp/planktoscope-demo");
    handle.start(job).await?;

    while let Ok(report) = reports.recv().await {
        println!(
            "status: {:<8} frames={} fault={:?}",
            report.state.to_string(),
            report.frames_captured,
            report.fault
        );
        if report.state == ImagerState::Stop {
            break;
        }
    }

    handle.shutdown().await?;
    let coordinator = task.await?;

    if let Some(run) = coordinator.archive().latest() {
        println!("\nRun {} finished: {:?}", run.job.id, run.outcome);
        println!("Path: {:?}", run.path());
    }
    println!("Motor steps taken: {}", stepper.steps_taken());

    println!("\n=== Example Complete ===");
    Ok(())
}
