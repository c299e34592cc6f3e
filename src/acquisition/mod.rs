//! Acquisition domain types and the components that drive one acquisition.
//!
//! - [`sequencer`]: ordered configuration writes, then prepare and start
//! - [`poller`]: the frame polling state machine that drains completed frames
//! - [`sink`]: destinations for drained readouts

pub mod poller;
pub mod sequencer;
pub mod sink;

pub use poller::{
    stop_channel, FramePoller, PollCursor, PollerSettings, ReadoutFailure, ReadoutFailurePolicy,
    SessionReport, StopHandle, StopReason, StopSignal,
};
pub use sequencer::{
    ConfigSequence, ConfigStep, DeviceRole, SequenceOutcome, StepAction, StepGroup,
};
pub use sink::{ChannelSink, FanOut, LogSink, ReadoutSink};

#[cfg(feature = "storage_csv")]
pub use sink::CsvSink;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Detector processing clock. Time scalers are raw ticks of this clock.
pub const DETECTOR_CLOCK_HZ: f64 = 80.0e6;

/// Number of values returned by `ReadScalers`: nine hardware scalers plus
/// dead-time percent and dead-time factor.
pub const SCALER_WIDTH: usize = 11;

/// Trigger source for the acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    /// Frames are timed by the detector's internal frame generator
    Internal,
    /// Frames are gated by an external TTL veto; exposure time is ignored
    ExternalGate,
}

impl TriggerMode {
    /// Value written to the acquisition server's `acq_trigger_mode`
    pub fn lima_name(self) -> &'static str {
        match self {
            TriggerMode::Internal => "INTERNAL_TRIGGER",
            TriggerMode::ExternalGate => "EXTERNAL_GATE",
        }
    }
}

/// Scaler statistics of one frame on one channel.
///
/// Values are passed through untouched. Time fields are clock ticks; see
/// [`ScalerRecord::live_time_seconds`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScalerRecord {
    pub time_ticks: f64,
    pub reset_ticks: f64,
    pub reset_count: f64,
    pub all_event: f64,
    pub all_good: f64,
    pub in_window0: f64,
    pub in_window1: f64,
    pub pileup: f64,
    pub total_ticks: f64,
    pub dead_time_percent: f64,
    pub dead_time_factor: f64,
}

impl ScalerRecord {
    /// Column names in wire order.
    pub const FIELDS: [&'static str; SCALER_WIDTH] = [
        "time_ticks",
        "reset_ticks",
        "reset_count",
        "all_event",
        "all_good",
        "in_window0",
        "in_window1",
        "pileup",
        "total_ticks",
        "dead_time_percent",
        "dead_time_factor",
    ];

    /// Build from the raw `ReadScalers` tuple.
    pub fn from_values(values: &[f64]) -> Result<Self> {
        if values.len() != SCALER_WIDTH {
            bail!(
                "expected {} scaler values, got {}",
                SCALER_WIDTH,
                values.len()
            );
        }
        Ok(Self {
            time_ticks: values[0],
            reset_ticks: values[1],
            reset_count: values[2],
            all_event: values[3],
            all_good: values[4],
            in_window0: values[5],
            in_window1: values[6],
            pileup: values[7],
            total_ticks: values[8],
            dead_time_percent: values[9],
            dead_time_factor: values[10],
        })
    }

    /// Values in wire order.
    pub fn to_values(&self) -> [f64; SCALER_WIDTH] {
        [
            self.time_ticks,
            self.reset_ticks,
            self.reset_count,
            self.all_event,
            self.all_good,
            self.in_window0,
            self.in_window1,
            self.pileup,
            self.total_ticks,
            self.dead_time_percent,
            self.dead_time_factor,
        ]
    }

    /// Frame live time in seconds for a detector clocked at `clock_hz`.
    pub fn live_time_seconds(&self, clock_hz: f64) -> f64 {
        self.time_ticks / clock_hz
    }
}

/// Histogram of one frame on one channel, one count per energy bin.
///
/// Bins are `f64` because dead-time corrected histograms are not integral.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Histogram {
    bins: Vec<f64>,
}

impl Histogram {
    pub fn new(bins: Vec<f64>) -> Self {
        Self { bins }
    }

    pub fn bins(&self) -> &[f64] {
        &self.bins
    }

    pub fn len(&self) -> usize {
        self.bins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    /// Sum over all bins.
    pub fn total(&self) -> f64 {
        self.bins.iter().sum()
    }
}

/// Address of one readout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReadoutKey {
    pub frame: i64,
    pub channel: u32,
}

impl fmt::Display for ReadoutKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.frame, self.channel)
    }
}

/// Which of the two per-pair readout requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReadoutKind {
    Scalers,
    Histogram,
}

impl fmt::Display for ReadoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadoutKind::Scalers => write!(f, "scalers"),
            ReadoutKind::Histogram => write!(f, "histogram"),
        }
    }
}

/// Everything read for one `(frame, channel)` pair.
///
/// A failed request leaves its half as `None`; the pair is never re-read.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameReadout {
    pub key: ReadoutKey,
    pub scalers: Option<ScalerRecord>,
    pub histogram: Option<Histogram>,
}

impl FrameReadout {
    /// Both requests succeeded.
    pub fn is_complete(&self) -> bool {
        self.scalers.is_some() && self.histogram.is_some()
    }
}

/// Frame poller lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    /// No session exists
    Idle,
    /// Configuration applied and acquisition started
    Armed,
    /// Watching the running flag and frame counter
    Polling,
    /// Reading out a range of newly completed frames
    Draining,
    /// Terminal
    Stopped,
}
