//! Layered configuration using Figment.
//!
//! Sources, later ones winning:
//! 1. built-in defaults
//! 2. `config/imager.toml` (or the file given on the command line)
//! 3. environment variables prefixed with `PLANKTOSCOPE_`, with `__` between
//!    nesting levels, e.g. `PLANKTOSCOPE_PUMP__STEPS_PER_ML=480`
//!
//! # Example
//! ```no_run
//! use planktoscope_imager::config::ImagerConfig;
//!
//! let config = ImagerConfig::load()?;
//! println!("profile: {:?}", config.profile);
//! # Ok::<(), planktoscope_imager::ImagerError>(())
//! ```

use crate::acquisition::CoordinatorSettings;
use crate::channel::BroadcastStatus;
use crate::core::Profile;
use crate::error::{ImagerError, Result};
use crate::job::PumpCalibration;
use crate::logging::{parse_log_level, OutputFormat};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "config/imager.toml";
pub const ENV_PREFIX: &str = "PLANKTOSCOPE_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ImagerConfig {
    /// Which state table is active
    pub profile: Profile,
    pub pump: PumpCalibration,
    pub acquisition: AcquisitionConfig,
    pub simulation: SimulationConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Root of the image tree for jobs that do not name an output directory
    pub output_root: PathBuf,
    /// Finished runs kept in memory
    pub archive_capacity: usize,
    /// Pending requests the imager actor buffers
    pub queue_capacity: usize,
    /// Status reports buffered per subscriber
    pub status_capacity: usize,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            output_root: PathBuf::from("data/img"),
            archive_capacity: 32,
            queue_capacity: 64,
            status_capacity: 128,
        }
    }
}

/// Timings of the simulated hardware used by the binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    #[serde(with = "humantime_serde")]
    pub camera_readout: Duration,
    #[serde(with = "humantime_serde")]
    pub segmentation_time: Duration,
    /// Write empty frame files so the output tree can be inspected
    pub write_files: bool,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            camera_readout: Duration::from_millis(250),
            segmentation_time: Duration::from_secs(2),
            write_files: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace, debug, info, warn or error
    pub level: String,
    pub format: OutputFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: OutputFormat::default(),
        }
    }
}

impl ImagerConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> Result<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from `path` and the environment, then validate.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = Self::figment(path).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// The provider stack without extraction, for callers that add layers.
    pub fn figment(path: impl AsRef<Path>) -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn validate(&self) -> Result<()> {
        let pump = &self.pump;
        if !(pump.steps_per_ml.is_finite() && pump.steps_per_ml > 0.0) {
            return Err(ImagerError::Configuration(format!(
                "pump.steps_per_ml must be positive, got {}",
                pump.steps_per_ml
            )));
        }
        if !(pump.max_flow_rate.is_finite() && pump.max_flow_rate > 0.0) {
            return Err(ImagerError::Configuration(format!(
                "pump.max_flow_rate must be positive, got {}",
                pump.max_flow_rate
            )));
        }
        if self.acquisition.queue_capacity == 0 {
            return Err(ImagerError::Configuration(
                "acquisition.queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.acquisition.status_capacity == 0 {
            return Err(ImagerError::Configuration(
                "acquisition.status_capacity must be at least 1".to_string(),
            ));
        }
        parse_log_level(&self.logging.level)?;
        Ok(())
    }

    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            profile: self.profile,
            calibration: self.pump.clone(),
            output_root: self.acquisition.output_root.clone(),
            archive_capacity: self.acquisition.archive_capacity,
        }
    }

    /// Status fan-out sized by `acquisition.status_capacity`.
    pub fn status_channel(&self) -> BroadcastStatus {
        BroadcastStatus::new(self.acquisition.status_capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn toml_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn defaults_are_valid() {
        let config = ImagerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.profile, Profile::Baseline);
        assert_eq!(config.pump.steps_per_ml, 507.0);
    }

    #[test]
    fn file_overrides_defaults() {
        let file = toml_file(
            r#"
profile = "segmentation"

[pump]
steps_per_ml = 480.0
step_overhead = "2ms"

[simulation]
camera_readout = "100ms"
"#,
        );

        let config = ImagerConfig::load_from(file.path()).unwrap();

        assert_eq!(config.profile, Profile::Segmentation);
        assert_eq!(config.pump.steps_per_ml, 480.0);
        assert_eq!(config.pump.step_overhead, Duration::from_millis(2));
        // Untouched keys keep their defaults
        assert_eq!(config.pump.max_flow_rate, 50.0);
        assert_eq!(config.simulation.camera_readout, Duration::from_millis(100));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = ImagerConfig::load_from("/nonexistent/imager.toml").unwrap();
        assert_eq!(config.pump, PumpCalibration::default());
    }

    #[test]
    fn environment_overrides_file() {
        let file = toml_file("[acquisition]\narchive_capacity = 4\n");
        std::env::set_var("PLANKTOSCOPE_ACQUISITION__ARCHIVE_CAPACITY", "9");

        let config = ImagerConfig::load_from(file.path());
        std::env::remove_var("PLANKTOSCOPE_ACQUISITION__ARCHIVE_CAPACITY");

        assert_eq!(config.unwrap().acquisition.archive_capacity, 9);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let file = toml_file("[pump]\nsteps_per_ml = 0.0\n");
        assert!(matches!(
            ImagerConfig::load_from(file.path()),
            Err(ImagerError::Configuration(_))
        ));

        let file = toml_file("[logging]\nlevel = \"loud\"\n");
        assert!(ImagerConfig::load_from(file.path()).is_err());

        let file = toml_file("[acquisition]\nqueue_capacity = 0\n");
        assert!(ImagerConfig::load_from(file.path()).is_err());
    }

    #[tokio::test]
    async fn status_channel_uses_configured_capacity() {
        use crate::channel::{StatusReport, StatusSink};
        use crate::core::ImagerState;
        use tokio::sync::broadcast::error::RecvError;

        let file = toml_file("[acquisition]\nstatus_capacity = 2\n");
        let config = ImagerConfig::load_from(file.path()).unwrap();
        let status = config.status_channel();
        let mut rx = status.subscribe();

        for frames in 0..3 {
            status.publish(&StatusReport {
                state: ImagerState::Capture,
                frames_captured: frames,
                fault: None,
            });
        }

        assert!(matches!(rx.recv().await, Err(RecvError::Lagged(1))));
        assert_eq!(rx.recv().await.unwrap().frames_captured, 1);

        let file = toml_file("[acquisition]\nstatus_capacity = 0\n");
        assert!(ImagerConfig::load_from(file.path()).is_err());
    }

    #[test]
    fn type_errors_surface_as_config_errors() {
        let file = toml_file("[pump]\nsteps_per_ml = \"many\"\n");
        assert!(matches!(
            ImagerConfig::load_from(file.path()),
            Err(ImagerError::Config(_))
        ));
    }
}
