//! Configuration sequencing.
//!
//! Turns an [`AcquisitionConfig`] into the ordered list of remote writes and commands
//! that arm one acquisition, and applies that list fail-fast. The order is:
//!
//! 1. call timeout, detector then coordinator
//! 2. detector `clear`, unless disabled
//! 3. saving pipeline attributes, in the order the caller gave them
//! 4. detector session settings (card, channel, data source, playback, run mode, DTC)
//! 5. frame count and exposure
//! 6. detector timing
//! 7. trigger mode
//! 8. `prepareAcq`, `startAcq`
//!
//! Some saving backends misbehave when their attributes arrive out of order, so the
//! saving group is never reordered. A stop request is honoured between steps, so
//! `startAcq` is never sent once a stop has been asked for.

use crate::acquisition::StopSignal;
use crate::config::AcquisitionConfig;
use crate::error::{AppResult, DaqError};
use crate::hardware::xspress3::playback_args;
use crate::hardware::{AttrValue, DeviceProxy};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info};

/// Which remote service a step targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceRole {
    /// LimaCCDs acquisition server
    Coordinator,
    /// Xspress3 detector
    Detector,
}

impl fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceRole::Coordinator => write!(f, "coordinator"),
            DeviceRole::Detector => write!(f, "detector"),
        }
    }
}

/// Ordering group of a step. Groups appear in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepGroup {
    Timeout,
    Reset,
    Saving,
    Detector,
    Acquisition,
    Timing,
    Trigger,
    Lifecycle,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum StepAction {
    SetTimeout(Duration),
    Write { attribute: String, value: AttrValue },
    Command { name: String, arg: AttrValue },
}

/// One remote call of the arming sequence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigStep {
    pub role: DeviceRole,
    pub group: StepGroup,
    pub action: StepAction,
}

impl ConfigStep {
    fn write(role: DeviceRole, group: StepGroup, attribute: &str, value: AttrValue) -> Self {
        Self {
            role,
            group,
            action: StepAction::Write {
                attribute: attribute.to_string(),
                value,
            },
        }
    }

    fn command(role: DeviceRole, group: StepGroup, name: &str, arg: AttrValue) -> Self {
        Self {
            role,
            group,
            action: StepAction::Command {
                name: name.to_string(),
                arg,
            },
        }
    }

    /// Short description used in errors, e.g. `write saving_format`
    pub fn describe(&self) -> String {
        match &self.action {
            StepAction::SetTimeout(_) => "set timeout".to_string(),
            StepAction::Write { attribute, .. } => format!("write {attribute}"),
            StepAction::Command { name, .. } => format!("command {name}"),
        }
    }
}

impl fmt::Display for ConfigStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.action {
            StepAction::SetTimeout(t) => write!(f, "[{}] timeout {}ms", self.role, t.as_millis()),
            StepAction::Write { attribute, value } => {
                write!(f, "[{}] {attribute} = {value}", self.role)
            }
            StepAction::Command { name, arg } => match arg {
                AttrValue::Void => write!(f, "[{}] {name}()", self.role),
                arg => write!(f, "[{}] {name}({arg})", self.role),
            },
        }
    }
}

/// The ordered arming sequence for one acquisition.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConfigSequence {
    steps: Vec<ConfigStep>,
}

impl ConfigSequence {
    /// Build the sequence for a configuration
    pub fn from_config(config: &AcquisitionConfig) -> Self {
        use DeviceRole::{Coordinator, Detector};

        let mut steps: Vec<ConfigStep> = [Detector, Coordinator]
            .into_iter()
            .map(|role| ConfigStep {
                role,
                group: StepGroup::Timeout,
                action: StepAction::SetTimeout(config.session.call_timeout()),
            })
            .collect();

        if config.session.clear_detector {
            steps.push(ConfigStep::command(
                Detector,
                StepGroup::Reset,
                "clear",
                AttrValue::Void,
            ));
        }

        steps.extend(config.saving.iter().map(|attr| {
            ConfigStep::write(
                Coordinator,
                StepGroup::Saving,
                attr.attribute_name(),
                attr.value(),
            )
        }));

        let det = &config.detector;
        let group = StepGroup::Detector;
        if let Some(card) = det.card {
            steps.push(ConfigStep::write(Detector, group, "card", card.into()));
        }
        if let Some(channel) = det.channel {
            steps.push(ConfigStep::write(Detector, group, "channel", channel.into()));
        }
        if let Some(source) = det.data_source {
            steps.push(ConfigStep::write(
                Detector,
                group,
                "dataSource",
                AttrValue::StringArray(vec![source.as_str().to_string()]),
            ));
        }
        if let Some(playback) = &det.playback {
            steps.push(ConfigStep::write(
                Detector,
                group,
                "playbackFilename",
                playback.filename.as_str().into(),
            ));
            steps.push(ConfigStep::command(
                Detector,
                group,
                "loadPlayback",
                playback_args(playback.src0, playback.src1, playback.streams),
            ));
        }
        if let Some(run_mode) = &det.run_mode {
            steps.push(ConfigStep::write(
                Detector,
                group,
                "runMode",
                AttrValue::BooleanArray(run_mode.clone()),
            ));
        }
        if let Some(use_dtc) = det.use_dtc {
            steps.push(ConfigStep::write(Detector, group, "useDtc", use_dtc.into()));
        }

        let acq = &config.acquisition;
        steps.push(ConfigStep::write(
            Coordinator,
            StepGroup::Acquisition,
            "acq_nb_frames",
            i64::from(acq.frame_count).into(),
        ));
        steps.push(ConfigStep::write(
            Coordinator,
            StepGroup::Acquisition,
            "acq_expo_time",
            acq.exposure_time.into(),
        ));

        if let Some(timing) = det.timing {
            steps.push(ConfigStep::write(
                Detector,
                StepGroup::Timing,
                "setTiming",
                timing.to_args().into(),
            ));
        }
        if let Some(itfg) = det.itfg {
            steps.push(ConfigStep::write(
                Detector,
                StepGroup::Timing,
                "setItfgTiming",
                vec![
                    i64::from(acq.frame_count),
                    itfg.trigger_mode.code(),
                    itfg.gap_mode.code(),
                ]
                .into(),
            ));
        }

        steps.push(ConfigStep::write(
            Coordinator,
            StepGroup::Trigger,
            "acq_trigger_mode",
            acq.trigger_mode.lima_name().into(),
        ));
        steps.push(ConfigStep::command(
            Coordinator,
            StepGroup::Lifecycle,
            "prepareAcq",
            AttrValue::Void,
        ));
        steps.push(ConfigStep::command(
            Coordinator,
            StepGroup::Lifecycle,
            "startAcq",
            AttrValue::Void,
        ));

        Self { steps }
    }

    pub fn steps(&self) -> &[ConfigStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Apply every step in order, stopping at the first failure.
    ///
    /// A failure leaves both services partially configured with acquisition not
    /// started. The stop signal is checked before each step; once it fires no
    /// further step is sent.
    pub async fn apply(
        &self,
        coordinator: &dyn DeviceProxy,
        detector: &dyn DeviceProxy,
        stop: &StopSignal,
    ) -> AppResult<SequenceOutcome> {
        info!(
            steps = self.steps.len(),
            coordinator = coordinator.device_name(),
            detector = detector.device_name(),
            "Applying acquisition configuration"
        );

        for (applied, step) in self.steps.iter().enumerate() {
            if stop.is_triggered() {
                info!(applied, "Stop requested while configuring, acquisition not started");
                return Ok(SequenceOutcome::Interrupted { applied });
            }

            let device = match step.role {
                DeviceRole::Coordinator => coordinator,
                DeviceRole::Detector => detector,
            };
            debug!(step = %step, "configure");

            let result = match &step.action {
                StepAction::SetTimeout(timeout) => device.set_timeout(*timeout).await,
                StepAction::Write { attribute, value } => {
                    device.write_attribute(attribute, value.clone()).await
                }
                StepAction::Command { name, arg } => {
                    device.command_inout(name, arg.clone()).await.map(|_| ())
                }
            };

            result.map_err(|source| DaqError::Sequence {
                device: device.device_name().to_string(),
                step: step.describe(),
                source,
            })?;
        }

        Ok(SequenceOutcome::Applied(self.steps.len()))
    }
}

/// How far [`ConfigSequence::apply`] got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceOutcome {
    /// Every step was sent; the acquisition is running
    Applied(usize),
    /// A stop request arrived after `applied` steps
    Interrupted { applied: usize },
}
