//! Simulated Device Servers
//!
//! An in-process stand-in for the LimaCCDs acquisition server and the Xspress3 detector.
//! Both device handles share one acquisition timeline, so `acqRunning` on the detector
//! and `last_image_ready` on the coordinator always agree.
//! All waiting is async-safe (`tokio::time`, never `std::thread::sleep`).
//!
//! # Behaviour
//!
//! - Attribute names are case-insensitive, as on the real control system
//! - `startAcq` requires a preceding `prepareAcq`
//! - Frames complete one per exposure period after `startAcq` (10ms when the
//!   exposure is zero, as under external gating)
//! - `ReadScalers`/`ReadHistogram` fail with "Frame not available yet" for frames
//!   that have not completed
//! - Every write, command and timeout change is recorded in a journal
//!
//! # Failure Injection
//!
//! ```rust,ignore
//! let sim = SimulatedSystem::new(1, 4, 4096);
//! sim.fail_call("saving_format", "DevFailed: unknown format").await;
//! sim.fail_readout(3, 1, ReadoutKind::Histogram).await;
//! sim.fail_next_polls(2).await;
//! ```

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{Duration, Instant};
use tracing::debug;

use crate::acquisition::{DeviceRole, ReadoutKind, DETECTOR_CLOCK_HZ, SCALER_WIDTH};
use crate::hardware::capabilities::{
    AttributeRead, AttributeWrite, CallTimeout, CommandInvoke, DeviceProxy,
};
use crate::hardware::AttrValue;

/// Frame period used when the configured exposure is zero.
const GATED_FRAME_PERIOD: Duration = Duration::from_millis(10);

/// Event processing width reported by the simulated trigger-B settings.
const EVENT_WIDTH: f64 = 6.0;

/// Kind of journaled call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Write,
    Command,
    Timeout,
}

/// One journaled write, command or timeout change
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub device: DeviceRole,
    pub kind: CallKind,
    /// Attribute or command name as sent by the caller
    pub name: String,
    pub value: AttrValue,
}

#[derive(Debug, Clone, Copy)]
struct Run {
    started: Instant,
    frames: i64,
    period: Duration,
    /// Completed frame count frozen by `stopAcq`
    stopped_at: Option<i64>,
}

impl Run {
    fn completed(&self) -> i64 {
        if let Some(n) = self.stopped_at {
            return n;
        }
        let elapsed = self.started.elapsed().as_secs_f64();
        let done = (elapsed / self.period.as_secs_f64()).floor() as i64;
        done.min(self.frames)
    }

    fn running(&self) -> bool {
        self.stopped_at.is_none() && self.completed() < self.frames
    }
}

struct SimState {
    num_cards: u32,
    channels: u32,
    bins: u32,
    coordinator_attrs: HashMap<String, AttrValue>,
    detector_attrs: HashMap<String, AttrValue>,
    prepared: bool,
    run: Option<Run>,
    timeout: Option<Duration>,
    journal: Vec<RecordedCall>,
    failing_calls: HashMap<String, String>,
    failing_readouts: HashSet<(i64, u32, ReadoutKind)>,
    failing_polls: u32,
}

impl SimState {
    fn completed(&self) -> i64 {
        self.run.map_or(0, |r| r.completed())
    }

    fn running(&self) -> bool {
        self.run.is_some_and(|r| r.running())
    }

    fn take_poll_failure(&mut self) -> Result<()> {
        if self.failing_polls > 0 {
            self.failing_polls -= 1;
            bail!("API_DeviceTimedOut: simulated transport failure");
        }
        Ok(())
    }

    fn injected_failure(&self, name: &str) -> Result<()> {
        match self.failing_calls.get(&name.to_lowercase()) {
            Some(message) => Err(anyhow!("{message}")),
            None => Ok(()),
        }
    }
}

/// Simulated acquisition server and detector pair
///
/// # Example
///
/// ```rust,ignore
/// let sim = SimulatedSystem::new(1, 4, 4096);
/// let lima = LimaCcd::new(sim.coordinator());
/// let x3 = Xspress3::new(sim.detector());
/// ```
#[derive(Clone)]
pub struct SimulatedSystem {
    state: Arc<RwLock<SimState>>,
    coordinator_name: String,
    detector_name: String,
}

impl SimulatedSystem {
    /// Create a system with the given detector geometry
    pub fn new(num_cards: u32, channels: u32, bins: u32) -> Self {
        let mut detector_attrs = HashMap::new();
        detector_attrs.insert("card".to_string(), AttrValue::Long(-1));
        Self {
            state: Arc::new(RwLock::new(SimState {
                num_cards,
                channels,
                bins,
                coordinator_attrs: HashMap::new(),
                detector_attrs,
                prepared: false,
                run: None,
                timeout: None,
                journal: Vec::new(),
                failing_calls: HashMap::new(),
                failing_readouts: HashSet::new(),
                failing_polls: 0,
            })),
            coordinator_name: "lima/limaccd/1".to_string(),
            detector_name: "lima/xspress3/1".to_string(),
        }
    }

    /// Use different device names for the two handles
    pub fn with_device_names(
        mut self,
        coordinator: impl Into<String>,
        detector: impl Into<String>,
    ) -> Self {
        self.coordinator_name = coordinator.into();
        self.detector_name = detector.into();
        self
    }

    /// Handle on the acquisition server
    pub fn coordinator(&self) -> Arc<dyn DeviceProxy> {
        Arc::new(SimulatedDevice {
            role: DeviceRole::Coordinator,
            name: self.coordinator_name.clone(),
            state: self.state.clone(),
        })
    }

    /// Handle on the detector
    pub fn detector(&self) -> Arc<dyn DeviceProxy> {
        Arc::new(SimulatedDevice {
            role: DeviceRole::Detector,
            name: self.detector_name.clone(),
            state: self.state.clone(),
        })
    }

    /// All recorded writes, commands and timeout changes, oldest first
    pub async fn journal(&self) -> Vec<RecordedCall> {
        self.state.read().await.journal.clone()
    }

    /// Make every write or command with this name fail
    pub async fn fail_call(&self, name: &str, message: &str) {
        self.state
            .write()
            .await
            .failing_calls
            .insert(name.to_lowercase(), message.to_string());
    }

    /// Make one readout request fail
    pub async fn fail_readout(&self, frame: i64, channel: u32, kind: ReadoutKind) {
        self.state
            .write()
            .await
            .failing_readouts
            .insert((frame, channel, kind));
    }

    /// Make the next `count` reads of `acqRunning` or `last_image_ready` fail
    pub async fn fail_next_polls(&self, count: u32) {
        self.state.write().await.failing_polls = count;
    }

    /// Frames completed so far in the current run
    pub async fn frames_completed(&self) -> i64 {
        self.state.read().await.completed()
    }

    /// Last value written to an attribute, by either device
    pub async fn written(&self, role: DeviceRole, name: &str) -> Option<AttrValue> {
        let state = self.state.read().await;
        let attrs = match role {
            DeviceRole::Coordinator => &state.coordinator_attrs,
            DeviceRole::Detector => &state.detector_attrs,
        };
        attrs.get(&name.to_lowercase()).cloned()
    }

    /// Detector call timeout, if one was set
    pub async fn timeout(&self) -> Option<Duration> {
        self.state.read().await.timeout
    }
}

// =============================================================================
// SimulatedDevice - one handle on the shared state
// =============================================================================

struct SimulatedDevice {
    role: DeviceRole,
    name: String,
    state: Arc<RwLock<SimState>>,
}

const COORDINATOR_READ_ONLY: [&str; 1] = ["last_image_ready"];
const DETECTOR_READ_ONLY: [&str; 6] = [
    "acqrunning",
    "numchan",
    "numcards",
    "maxnumchan",
    "chanspercard",
    "binspermca",
];

fn frame_channel(arg: &AttrValue) -> Result<(i64, u32)> {
    match arg {
        AttrValue::LongArray(v) if v.len() == 2 => {
            let channel = u32::try_from(v[1]).map_err(|_| anyhow!("Invalid channel {}", v[1]))?;
            Ok((v[0], channel))
        }
        other => bail!("expected [frame, channel], got {other}"),
    }
}

fn attr_f64(attrs: &HashMap<String, AttrValue>, name: &str) -> Option<f64> {
    attrs.get(name).and_then(|v| v.as_f64().ok())
}

fn attr_i64(attrs: &HashMap<String, AttrValue>, name: &str) -> Option<i64> {
    attrs.get(name).and_then(|v| v.as_i64().ok())
}

/// Deterministic scaler values for one frame/channel, dead time computed
/// like the detector plugin does
fn synthetic_scalers(frame: i64, channel: u32, period: Duration) -> Vec<f64> {
    let ctime = (period.as_secs_f64() * DETECTOR_CLOCK_HZ).max(1.0e6);
    let resets = 1000.0 + f64::from(channel) * 10.0;
    let reset_count = 10.0;
    let allevt = 1000.0 * (frame as f64 + 1.0) + 100.0 * f64::from(channel);
    let allgood = (allevt * 0.9).floor();
    let busy = allevt * (EVENT_WIDTH + 1.0) + resets;

    let mut values = vec![
        ctime,
        resets,
        reset_count,
        allevt,
        allgood,
        (allgood / 2.0).floor(),
        (allgood / 4.0).floor(),
        allevt - allgood,
        ctime,
    ];
    values.push(100.0 * busy / ctime);
    values.push(ctime / (ctime - busy));
    debug_assert_eq!(values.len(), SCALER_WIDTH);
    values
}

fn synthetic_histogram(frame: i64, channel: u32, bins: u32) -> Vec<i64> {
    (0..i64::from(bins))
        .map(|bin| (frame + 1) * ((bin % 7) + i64::from(channel) + 1))
        .collect()
}

impl SimulatedDevice {
    fn journal(&self, state: &mut SimState, kind: CallKind, name: &str, value: AttrValue) {
        state.journal.push(RecordedCall {
            device: self.role,
            kind,
            name: name.to_string(),
            value,
        });
    }

    fn coordinator_command(&self, state: &mut SimState, name: &str) -> Result<AttrValue> {
        match name.to_lowercase().as_str() {
            "prepareacq" => {
                if state.running() {
                    bail!("Acquisition already running");
                }
                state.prepared = true;
                state.run = None;
            }
            "startacq" => {
                if !state.prepared {
                    bail!("Acquisition not prepared");
                }
                let frames = attr_i64(&state.coordinator_attrs, "acq_nb_frames").unwrap_or(1);
                let expo = attr_f64(&state.coordinator_attrs, "acq_expo_time").unwrap_or(0.0);
                let period = if expo > 0.0 {
                    Duration::from_secs_f64(expo)
                } else {
                    GATED_FRAME_PERIOD
                };
                state.prepared = false;
                state.run = Some(Run {
                    started: Instant::now(),
                    frames,
                    period,
                    stopped_at: None,
                });
                debug!(device = %self.name, frames, ?period, "simulated acquisition started");
            }
            "stopacq" => {
                if let Some(run) = state.run.as_mut() {
                    if run.stopped_at.is_none() {
                        run.stopped_at = Some(run.completed());
                    }
                }
            }
            other => bail!("Command {other} not found on {}", self.name),
        }
        Ok(AttrValue::Void)
    }

    fn detector_command(
        &self,
        state: &mut SimState,
        name: &str,
        arg: &AttrValue,
    ) -> Result<AttrValue> {
        match name.to_lowercase().as_str() {
            "readscalers" | "readhistogram" => {
                let kind = if name.eq_ignore_ascii_case("readscalers") {
                    ReadoutKind::Scalers
                } else {
                    ReadoutKind::Histogram
                };
                let (frame, channel) = frame_channel(arg)?;
                if channel >= state.channels {
                    bail!("Channel {channel} out of range");
                }
                if frame < 0 || frame >= state.completed() {
                    bail!("Frame not available yet");
                }
                if state.failing_readouts.contains(&(frame, channel, kind)) {
                    bail!("API_DeviceTimedOut: simulated {kind} failure");
                }
                let period = state.run.map_or(GATED_FRAME_PERIOD, |r| r.period);
                Ok(match kind {
                    ReadoutKind::Scalers => {
                        AttrValue::DoubleArray(synthetic_scalers(frame, channel, period))
                    }
                    ReadoutKind::Histogram => {
                        AttrValue::LongArray(synthetic_histogram(frame, channel, state.bins))
                    }
                })
            }
            "loadplayback" => {
                if !state.detector_attrs.contains_key("playbackfilename") {
                    bail!("No playback file selected");
                }
                match arg {
                    AttrValue::LongArray(v) if (2..=3).contains(&v.len()) => Ok(AttrValue::Void),
                    other => bail!("loadPlayback expects [src0, src1(, streams)], got {other}"),
                }
            }
            "clear" => {
                state.run = None;
                Ok(AttrValue::Void)
            }
            other => bail!("Command {other} not found on {}", self.name),
        }
    }
}

#[async_trait]
impl AttributeRead for SimulatedDevice {
    async fn read_attribute(&self, name: &str) -> Result<AttrValue> {
        let mut state = self.state.write().await;
        let key = name.to_lowercase();
        let value = match (self.role, key.as_str()) {
            (DeviceRole::Coordinator, "last_image_ready") => {
                state.take_poll_failure()?;
                AttrValue::Long(state.completed() - 1)
            }
            (DeviceRole::Detector, "acqrunning") => {
                state.take_poll_failure()?;
                AttrValue::Boolean(state.running())
            }
            (DeviceRole::Detector, "numchan" | "maxnumchan") => {
                AttrValue::Long(i64::from(state.channels))
            }
            (DeviceRole::Detector, "numcards") => AttrValue::Long(i64::from(state.num_cards)),
            (DeviceRole::Detector, "chanspercard") => {
                AttrValue::Long(i64::from(state.channels.div_ceil(state.num_cards.max(1))))
            }
            (DeviceRole::Detector, "binspermca") => AttrValue::Long(i64::from(state.bins)),
            (DeviceRole::Coordinator, _) => state
                .coordinator_attrs
                .get(&key)
                .cloned()
                .ok_or_else(|| anyhow!("Attribute {name} not found on {}", self.name))?,
            (DeviceRole::Detector, _) => state
                .detector_attrs
                .get(&key)
                .cloned()
                .ok_or_else(|| anyhow!("Attribute {name} not found on {}", self.name))?,
        };
        Ok(value)
    }
}

#[async_trait]
impl AttributeWrite for SimulatedDevice {
    async fn write_attribute(&self, name: &str, value: AttrValue) -> Result<()> {
        let mut state = self.state.write().await;
        self.journal(&mut state, CallKind::Write, name, value.clone());
        state.injected_failure(name)?;

        let key = name.to_lowercase();
        let read_only = match self.role {
            DeviceRole::Coordinator => COORDINATOR_READ_ONLY.contains(&key.as_str()),
            DeviceRole::Detector => DETECTOR_READ_ONLY.contains(&key.as_str()),
        };
        if read_only {
            bail!("Attribute {name} is not writable");
        }
        if state.running() {
            bail!("Cannot write {name} while acquisition is running");
        }

        match self.role {
            DeviceRole::Coordinator => state.coordinator_attrs.insert(key, value),
            DeviceRole::Detector => state.detector_attrs.insert(key, value),
        };
        Ok(())
    }
}

#[async_trait]
impl CommandInvoke for SimulatedDevice {
    async fn command_inout(&self, name: &str, arg: AttrValue) -> Result<AttrValue> {
        let mut state = self.state.write().await;
        let readout = name.eq_ignore_ascii_case("readscalers")
            || name.eq_ignore_ascii_case("readhistogram");
        if !readout {
            self.journal(&mut state, CallKind::Command, name, arg.clone());
        }
        state.injected_failure(name)?;

        match self.role {
            DeviceRole::Coordinator => self.coordinator_command(&mut state, name),
            DeviceRole::Detector => self.detector_command(&mut state, name, &arg),
        }
    }
}

#[async_trait]
impl CallTimeout for SimulatedDevice {
    async fn set_timeout(&self, timeout: Duration) -> Result<()> {
        let mut state = self.state.write().await;
        let millis = i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX);
        self.journal(&mut state, CallKind::Timeout, "timeout", AttrValue::Long(millis));
        state.timeout = Some(timeout);
        Ok(())
    }

    fn device_name(&self) -> &str {
        &self.name
    }
}
