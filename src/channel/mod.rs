//! Command and status channel.
//!
//! Messages are `{topic, payload}` pairs shaped like the PlanktoScope's MQTT
//! traffic. The broker itself is out of scope: anything that can hand over a
//! [`Message`] and accept a [`StatusReport`] can drive the imager.

use crate::core::ImagerState;
use crate::job::{AcquisitionJob, PumpDirection};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Prefix of every topic the imager listens on.
pub const COMMAND_TOPIC_PREFIX: &str = "imager/";

/// Topic status reports are published on.
pub const STATUS_TOPIC: &str = "status/imager";

/// Flow rate used when a start command does not give one (mL/min).
pub const DEFAULT_FLOW_RATE: f64 = 2.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub topic: String,
    #[serde(default)]
    pub payload: Value,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ImagerCommand {
    Start(AcquisitionJob),
    Stop,
    UpdateConfig(Map<String, Value>),
}

/// Outcome of decoding one message.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Command(ImagerCommand),
    /// Not for us, or an action we do not handle
    Ignored(String),
    /// Addressed to us but unusable
    Malformed(String),
}

fn default_flow_rate() -> f64 {
    DEFAULT_FLOW_RATE
}

fn default_frames() -> u32 {
    1
}

/// Payload of a `start` (legacy: `image`) action.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StartParams {
    /// Volume pumped before each frame (mL)
    pub volume: f64,
    #[serde(default = "default_flow_rate", alias = "pump_flowrate")]
    pub flowrate: f64,
    #[serde(default = "default_frames")]
    pub nb_frame: u32,
    /// Stabilization delay in seconds
    #[serde(default)]
    pub sleep: f64,
    #[serde(default)]
    pub pump_direction: PumpDirection,
    #[serde(default)]
    pub output_path: Option<PathBuf>,
    #[serde(default, alias = "live_segmentation")]
    pub segmentation: bool,
}

impl StartParams {
    /// Build the job. Range checks on volume and flow rate are left to job
    /// validation so all of them are reported together.
    pub fn into_job(self) -> Result<AcquisitionJob, String> {
        let stabilization = Duration::try_from_secs_f64(self.sleep).map_err(|_| {
            format!(
                "sleep must be a non-negative number of seconds, got {}",
                self.sleep
            )
        })?;

        let mut job = AcquisitionJob::new(self.volume, self.flowrate, self.nb_frame)
            .with_direction(self.pump_direction)
            .with_stabilization(stabilization)
            .with_segmentation(self.segmentation);
        if let Some(dir) = self.output_path {
            job = job.with_output_dir(dir);
        }
        Ok(job)
    }
}

/// Turn a raw message into a command.
pub fn decode(message: &Message) -> Decoded {
    if !message.topic.starts_with(COMMAND_TOPIC_PREFIX) {
        return Decoded::Ignored(format!("topic '{}' is not for the imager", message.topic));
    }

    let Some(action) = message.payload.get("action").and_then(Value::as_str) else {
        return Decoded::Ignored("message has no action".to_string());
    };

    match action {
        "start" | "image" => match StartParams::deserialize(&message.payload) {
            Ok(params) => match params.into_job() {
                Ok(job) => Decoded::Command(ImagerCommand::Start(job)),
                Err(reason) => Decoded::Malformed(reason),
            },
            Err(e) => Decoded::Malformed(format!("invalid start payload: {e}")),
        },
        "stop" => Decoded::Command(ImagerCommand::Stop),
        "update_config" => match message.payload.get("config") {
            Some(Value::Object(config)) => {
                Decoded::Command(ImagerCommand::UpdateConfig(config.clone()))
            }
            _ => Decoded::Malformed("update_config needs a 'config' object".to_string()),
        },
        other => Decoded::Ignored(format!("unknown action '{other}'")),
    }
}

/// Published after every applied transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub state: ImagerState,
    pub frames_captured: u32,
    pub fault: Option<String>,
}

impl StatusReport {
    pub fn to_message(&self) -> Message {
        // A struct of plain fields always serializes
        let payload = serde_json::to_value(self).unwrap_or(Value::Null);
        Message::new(STATUS_TOPIC, payload)
    }
}

/// Where status reports go.
pub trait StatusSink: Send + Sync {
    fn publish(&self, report: &StatusReport);
}

/// Fans status reports out to any number of in-process subscribers.
#[derive(Debug, Clone)]
pub struct BroadcastStatus {
    tx: broadcast::Sender<StatusReport>,
}

impl BroadcastStatus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusReport> {
        self.tx.subscribe()
    }
}

impl StatusSink for BroadcastStatus {
    fn publish(&self, report: &StatusReport) {
        // No subscribers is fine
        if self.tx.send(report.clone()).is_err() {
            debug!(state = %report.state, "No status subscribers");
        }
    }
}

/// Writes each report as one JSON [`Message`] line.
pub struct JsonLinesStatus<W: Write + Send> {
    out: Mutex<W>,
}

impl<W: Write + Send> JsonLinesStatus<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out
            .into_inner()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl<W: Write + Send> StatusSink for JsonLinesStatus<W> {
    fn publish(&self, report: &StatusReport) {
        let mut out = self
            .out
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Err(e) = write_line(&mut *out, &report.to_message()) {
            warn!(error = %e, "Failed to write status");
        }
    }
}

fn write_line<W: Write>(out: &mut W, message: &Message) -> std::io::Result<()> {
    serde_json::to_writer(&mut *out, message)?;
    writeln!(out)?;
    out.flush()
}
