//! Configuration System using Figment
//!
//! This module provides strongly-typed configuration loading for one acquisition.
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. Environment variables (prefixed with `XSPRESS3_`, nested keys separated by `__`)
//!
//! # Example
//! ```no_run
//! use xspress3_daq::config::AcquisitionConfig;
//!
//! let config = AcquisitionConfig::load_from("config/default.toml")?;
//! config.validate()?;
//! println!("Frames: {}", config.acquisition.frame_count);
//! # Ok::<(), xspress3_daq::error::DaqError>(())
//! ```
//!
//! Override a nested key from the environment:
//! `XSPRESS3_SESSION__POLL_INTERVAL_MS=100`.

use crate::acquisition::{PollerSettings, ReadoutFailurePolicy, TriggerMode};
use crate::error::{AppResult, DaqError};
use crate::hardware::xspress3::{DataSource, ItfgGapMode, ItfgTriggerMode};
use crate::hardware::AttrValue;
use crate::validation;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level acquisition configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Remote device names
    #[serde(default)]
    pub devices: DeviceConfig,
    /// Poll loop and call timing
    #[serde(default)]
    pub session: SessionConfig,
    pub acquisition: AcquisitionSettings,
    /// Saving pipeline attributes, written in the order given
    #[serde(default)]
    pub saving: Vec<SavingAttribute>,
    #[serde(default)]
    pub detector: DetectorSettings,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Xspress3 detector device
    #[serde(default = "default_detector_device")]
    pub detector: String,
    /// LimaCCDs acquisition server device
    #[serde(default = "default_coordinator_device")]
    pub coordinator: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            detector: default_detector_device(),
            coordinator: default_coordinator_device(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Sleep between polls that found no new frame
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Timeout applied to every request against either device
    #[serde(default = "default_call_timeout")]
    pub call_timeout_ms: u64,
    /// Issue the detector `clear` command before configuring
    #[serde(default = "default_clear_detector")]
    pub clear_detector: bool,
    /// Consecutive failed polls tolerated before the session is abandoned
    #[serde(default = "default_max_poll_failures")]
    pub max_poll_failures: u32,
    #[serde(default)]
    pub readout_failure_policy: ReadoutFailurePolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            call_timeout_ms: default_call_timeout(),
            clear_detector: default_clear_detector(),
            max_poll_failures: default_max_poll_failures(),
            readout_failure_policy: ReadoutFailurePolicy::default(),
        }
    }
}

impl SessionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Settings handed to the frame poller
    pub fn poller_settings(&self) -> PollerSettings {
        PollerSettings {
            poll_interval: self.poll_interval(),
            max_poll_failures: self.max_poll_failures,
            readout_policy: self.readout_failure_policy,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionSettings {
    /// Number of frames to acquire
    pub frame_count: u32,
    /// Exposure per frame in seconds; ignored under external gating
    pub exposure_time: f64,
    #[serde(default = "default_trigger_mode")]
    pub trigger_mode: TriggerMode,
}

/// One saving pipeline attribute of the acquisition server.
///
/// Values are forwarded verbatim. Written as single-key tables:
/// `saving = [{ directory = "/data" }, { format = "HDF5" }]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SavingAttribute {
    Directory(String),
    Format(String),
    OverwritePolicy(String),
    Suffix(String),
    Prefix(String),
    Mode(String),
    ManagedMode(String),
    FramesPerFile(i64),
}

impl SavingAttribute {
    /// Attribute name on the acquisition server
    pub fn attribute_name(&self) -> &'static str {
        match self {
            SavingAttribute::Directory(_) => "saving_directory",
            SavingAttribute::Format(_) => "saving_format",
            SavingAttribute::OverwritePolicy(_) => "saving_overwrite_policy",
            SavingAttribute::Suffix(_) => "saving_suffix",
            SavingAttribute::Prefix(_) => "saving_prefix",
            SavingAttribute::Mode(_) => "saving_mode",
            SavingAttribute::ManagedMode(_) => "saving_managed_mode",
            SavingAttribute::FramesPerFile(_) => "saving_frames_per_file",
        }
    }

    pub fn value(&self) -> AttrValue {
        match self {
            SavingAttribute::Directory(v)
            | SavingAttribute::Format(v)
            | SavingAttribute::OverwritePolicy(v)
            | SavingAttribute::Suffix(v)
            | SavingAttribute::Prefix(v)
            | SavingAttribute::Mode(v)
            | SavingAttribute::ManagedMode(v) => AttrValue::String(v.clone()),
            SavingAttribute::FramesPerFile(n) => AttrValue::Long(*n),
        }
    }
}

/// Detector-side session configuration. Every field is optional; unset fields
/// are not written.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectorSettings {
    /// Card to address, -1 for all
    pub card: Option<i64>,
    /// Channel to address, -1 for all
    pub channel: Option<i64>,
    pub data_source: Option<DataSource>,
    pub playback: Option<PlaybackSettings>,
    /// Run mode flags, first entry selects playback
    pub run_mode: Option<Vec<bool>>,
    /// Dead-time correction
    pub use_dtc: Option<bool>,
    pub timing: Option<TimingSettings>,
    pub itfg: Option<ItfgSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackSettings {
    /// Recorded data file on the detector host
    pub filename: String,
    #[serde(default)]
    pub src0: i64,
    #[serde(default)]
    pub src1: i64,
    pub streams: Option<i64>,
}

/// `setTiming [time_source, first_frame, alt_ttl_mode, debounce]`
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TimingSettings {
    #[serde(default)]
    pub time_source: i64,
    #[serde(default)]
    pub first_frame: i64,
    #[serde(default)]
    pub alt_ttl_mode: i64,
    /// Glitch filter length in clock cycles
    #[serde(default)]
    pub debounce: i64,
}

impl TimingSettings {
    pub fn to_args(self) -> Vec<i64> {
        vec![
            self.time_source,
            self.first_frame,
            self.alt_ttl_mode,
            self.debounce,
        ]
    }
}

/// `setItfgTiming [frame_count, trigger_mode, gap_mode]`; frame count comes
/// from the acquisition section.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ItfgSettings {
    pub trigger_mode: ItfgTriggerMode,
    pub gap_mode: ItfgGapMode,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Write drained scaler statistics here
    pub csv_path: Option<PathBuf>,
    /// Log a histogram summary for every readout
    #[serde(default)]
    pub print_histograms: bool,
}

/// Geometry of the simulated detector
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SimulationConfig {
    #[serde(default = "default_num_cards")]
    pub num_cards: u32,
    #[serde(default = "default_sim_channels")]
    pub channels: u32,
    #[serde(default = "default_bins")]
    pub bins: u32,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            num_cards: default_num_cards(),
            channels: default_sim_channels(),
            bins: default_bins(),
        }
    }
}

// Default value functions
fn default_app_name() -> String {
    "xspress3-daq".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_detector_device() -> String {
    "lima/xspress3/1".to_string()
}

fn default_coordinator_device() -> String {
    "lima/limaccd/1".to_string()
}

fn default_poll_interval() -> u64 {
    500
}

fn default_call_timeout() -> u64 {
    30_000
}

fn default_clear_detector() -> bool {
    true
}

fn default_max_poll_failures() -> u32 {
    3
}

fn default_trigger_mode() -> TriggerMode {
    TriggerMode::Internal
}

fn default_num_cards() -> u32 {
    1
}

fn default_sim_channels() -> u32 {
    4
}

fn default_bins() -> u32 {
    4096
}

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl AcquisitionConfig {
    /// Load configuration from a TOML file and `XSPRESS3_` environment variables
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("XSPRESS3_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Parse configuration from TOML text only
    pub fn from_toml_str(toml: &str) -> AppResult<Self> {
        Ok(Figment::from(Toml::string(toml)).extract()?)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let invalid = |msg: String| Err(DaqError::Configuration(msg));

        if !VALID_LOG_LEVELS.contains(&self.application.log_level.to_lowercase().as_str()) {
            return invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                VALID_LOG_LEVELS.join(", ")
            ));
        }

        for (role, name) in [
            ("detector", &self.devices.detector),
            ("coordinator", &self.devices.coordinator),
        ] {
            if let Err(e) = validation::is_valid_device_name(name) {
                return invalid(format!("Invalid {role} device '{name}': {e}"));
            }
        }

        if self.session.poll_interval_ms == 0 {
            return invalid("poll_interval_ms must be greater than 0".into());
        }
        if self.session.call_timeout_ms == 0 {
            return invalid("call_timeout_ms must be greater than 0".into());
        }

        let acq = &self.acquisition;
        if acq.frame_count == 0 {
            return invalid("frame_count must be greater than 0".into());
        }
        let exposure_ok = match acq.trigger_mode {
            TriggerMode::Internal => acq.exposure_time > 0.0,
            TriggerMode::ExternalGate => acq.exposure_time >= 0.0,
        };
        if !exposure_ok || !acq.exposure_time.is_finite() {
            return invalid(format!(
                "Invalid exposure_time {} for {:?} triggering",
                acq.exposure_time, acq.trigger_mode
            ));
        }

        let mut seen = HashSet::new();
        for attr in &self.saving {
            if !seen.insert(attr.attribute_name()) {
                return invalid(format!(
                    "Saving attribute {} given more than once",
                    attr.attribute_name()
                ));
            }
        }

        if let Some(timing) = &self.detector.timing {
            if validation::is_in_range(timing.debounce, 0..=255).is_err() {
                return invalid(format!(
                    "Invalid debounce {}. Must be 0-255",
                    timing.debounce
                ));
            }
            if validation::is_in_range(timing.time_source, 0..=6).is_err() {
                return invalid(format!(
                    "Invalid time_source {}. Must be 0-6",
                    timing.time_source
                ));
            }
        }

        if let Some(playback) = &self.detector.playback {
            if let Err(e) = validation::is_valid_path(&playback.filename) {
                return invalid(format!("Invalid playback filename: {e}"));
            }
        }

        if self.simulation.channels == 0 || self.simulation.num_cards == 0 {
            return invalid("simulation needs at least one card and one channel".into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [acquisition]
        frame_count = 10
        exposure_time = 2.0
    "#;

    fn minimal() -> AcquisitionConfig {
        AcquisitionConfig::from_toml_str(MINIMAL).unwrap()
    }

    #[test]
    fn test_defaults_fill_missing_sections() {
        let config = minimal();
        assert_eq!(config.devices.detector, "lima/xspress3/1");
        assert_eq!(config.session.poll_interval_ms, 500);
        assert_eq!(config.session.call_timeout_ms, 30_000);
        assert_eq!(config.session.max_poll_failures, 3);
        assert_eq!(
            config.session.readout_failure_policy,
            ReadoutFailurePolicy::Continue
        );
        assert_eq!(config.acquisition.trigger_mode, TriggerMode::Internal);
        assert!(config.saving.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_saving_order_is_preserved() {
        let config = AcquisitionConfig::from_toml_str(
            r#"
            saving = [
                { directory = "/home/xspress3/data" },
                { format = "HDF5" },
                { overwrite_policy = "Abort" },
                { frames_per_file = 10 },
            ]

            [acquisition]
            frame_count = 10
            exposure_time = 2.0
            "#,
        )
        .unwrap();

        let names: Vec<_> = config.saving.iter().map(|s| s.attribute_name()).collect();
        assert_eq!(
            names,
            vec![
                "saving_directory",
                "saving_format",
                "saving_overwrite_policy",
                "saving_frames_per_file"
            ]
        );
        assert_eq!(config.saving[3].value(), AttrValue::Long(10));
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = minimal();
        config.application.log_level = "loud".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_exposure_only_allowed_for_external_gate() {
        let mut config = minimal();
        config.acquisition.exposure_time = 0.0;
        assert!(config.validate().is_err());

        config.acquisition.trigger_mode = TriggerMode::ExternalGate;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_duplicate_saving_attribute() {
        let mut config = minimal();
        config.saving = vec![
            SavingAttribute::Prefix("a_".into()),
            SavingAttribute::Prefix("b_".into()),
        ];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("saving_prefix"));
    }

    #[test]
    fn test_debounce_range() {
        let mut config = minimal();
        config.detector.timing = Some(TimingSettings {
            debounce: 300,
            ..Default::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_poller_settings_from_session() {
        let settings = minimal().session.poller_settings();
        assert_eq!(settings.poll_interval, Duration::from_millis(500));
        assert_eq!(settings.max_poll_failures, 3);
    }
}
