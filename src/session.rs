//! One armed-and-run acquisition.
//!
//! [`AcquisitionSession`] owns a validated configuration and handles on the two remote
//! services. [`AcquisitionSession::run`] applies the configuration sequence, starts
//! the acquisition and polls it to completion (or until the stop signal fires),
//! handing every readout to the given sink.
//!
//! ```rust,ignore
//! let (session, _sim) = AcquisitionSession::simulated(config)?;
//! let (stop, signal) = stop_channel();
//! stop.trigger_on_ctrl_c();
//! let mut sink = session.default_sink()?;
//! let report = session.run(signal, &mut sink).await?;
//! ```

use crate::acquisition::{
    ConfigSequence, FanOut, FramePoller, LogSink, ReadoutSink, SequenceOutcome, SessionReport,
    StopSignal,
};
use crate::config::AcquisitionConfig;
use crate::error::{AppResult, DaqError};
use crate::hardware::mock::SimulatedSystem;
use crate::hardware::{DetectorInfo, DeviceProxy, LimaCcd, Xspress3};
use std::sync::Arc;
use tracing::info;

pub struct AcquisitionSession {
    config: AcquisitionConfig,
    coordinator: Arc<dyn DeviceProxy>,
    detector: Arc<dyn DeviceProxy>,
}

impl AcquisitionSession {
    /// Validate the configuration and bind it to the two devices.
    ///
    /// Any [`DeviceProxy`] implementation works here; this is where a client for
    /// the real control system plugs in. The CLI only ships the simulated backend
    /// (see [`AcquisitionSession::simulated`]).
    pub fn new(
        config: AcquisitionConfig,
        coordinator: Arc<dyn DeviceProxy>,
        detector: Arc<dyn DeviceProxy>,
    ) -> AppResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            coordinator,
            detector,
        })
    }

    /// Bind the configuration to a simulated system shaped by its `simulation` section.
    pub fn simulated(config: AcquisitionConfig) -> AppResult<(Self, SimulatedSystem)> {
        let sim = &config.simulation;
        let system = SimulatedSystem::new(sim.num_cards, sim.channels, sim.bins)
            .with_device_names(&config.devices.coordinator, &config.devices.detector);
        let session = Self::new(config, system.coordinator(), system.detector())?;
        Ok((session, system))
    }

    pub fn config(&self) -> &AcquisitionConfig {
        &self.config
    }

    /// The writes and commands `run` will issue before polling.
    pub fn sequence(&self) -> ConfigSequence {
        ConfigSequence::from_config(&self.config)
    }

    pub async fn detector_info(&self) -> AppResult<DetectorInfo> {
        Xspress3::new(self.detector.clone())
            .detector_info()
            .await
            .map_err(|e| DaqError::Device(format!("{e:#}")))
    }

    /// Log sink plus, when `output.csv_path` is set, a CSV sink.
    pub fn default_sink(&self) -> AppResult<FanOut> {
        let mut sinks = FanOut::new().with(LogSink::new(self.config.output.print_histograms));
        if let Some(path) = &self.config.output.csv_path {
            #[cfg(feature = "storage_csv")]
            sinks.push(Box::new(crate::acquisition::CsvSink::create(path)?));

            #[cfg(not(feature = "storage_csv"))]
            {
                let _ = path;
                return Err(DaqError::FeatureNotEnabled("storage_csv".to_string()));
            }
        }
        Ok(sinks)
    }

    /// Configure, start and poll one acquisition.
    ///
    /// A stop requested before `startAcq` has gone out cancels the remaining
    /// configuration and ends the session as interrupted without starting.
    pub async fn run<S>(&self, stop: StopSignal, sink: &mut S) -> AppResult<SessionReport>
    where
        S: ReadoutSink + ?Sized,
    {
        let lima = LimaCcd::new(self.coordinator.clone());
        let x3 = Xspress3::new(self.detector.clone());
        let sequence = self.sequence();

        let settings = self.config.session.poller_settings();
        let mut poller = FramePoller::new(&lima, &x3, settings, stop.clone());
        let outcome = poller
            .arm(sequence.apply(self.coordinator.as_ref(), self.detector.as_ref(), &stop))
            .await?;
        let steps = match outcome {
            SequenceOutcome::Applied(steps) => steps,
            SequenceOutcome::Interrupted { .. } => return poller.cancel(sink).await,
        };
        info!(
            steps,
            frames = self.config.acquisition.frame_count,
            exposure = self.config.acquisition.exposure_time,
            trigger = self.config.acquisition.trigger_mode.lima_name(),
            "Acquisition started"
        );

        poller.run(sink).await
    }
}
