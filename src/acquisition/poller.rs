//! Frame polling state machine.
//!
//! The acquisition server only exposes a running flag and the index of the last
//! completed frame. [`FramePoller`] turns those two coarse signals into a gap-free,
//! duplicate-free stream of `(frame, channel)` readouts:
//!
//! ```text
//! IDLE --arm--> ARMED --run--> POLLING <--> DRAINING
//!                  |              |            |
//!                  +--cancel------+--> STOPPED <+
//! ```
//!
//! Every tick reads `running`, then `last_image_ready`. All frames between the
//! cursor and the observed index are drained, not just the newest, because several
//! frames can complete between two polls. The cursor only moves once a whole range
//! has been read out. A tick that saw `running == false` ends the session after
//! draining its range. A stop request ends the session without draining anything
//! further; frames completed but not yet drained at that point are dropped.

use crate::acquisition::sink::ReadoutSink;
use crate::acquisition::{FrameReadout, PollerState, ReadoutKey, ReadoutKind};
use crate::error::{AppResult, DaqError};
use crate::hardware::{AcquisitionControl, ChannelReadout};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Consumer-owned position in the frame stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollCursor {
    last_seen: i64,
}

impl Default for PollCursor {
    fn default() -> Self {
        Self::new()
    }
}

impl PollCursor {
    /// A cursor that has seen nothing (`-1`).
    pub fn new() -> Self {
        Self { last_seen: -1 }
    }

    pub fn last_seen(&self) -> i64 {
        self.last_seen
    }

    /// Frames revealed by an observed `last_image_ready`, if any.
    pub fn pending(&self, last_completed: i64) -> Option<RangeInclusive<i64>> {
        (last_completed > self.last_seen).then(|| self.last_seen + 1..=last_completed)
    }

    /// Mark everything up to and including `frame` as consumed. Never moves back.
    pub fn advance_to(&mut self, frame: i64) {
        self.last_seen = self.last_seen.max(frame);
    }
}

/// What to do when a single `ReadScalers`/`ReadHistogram` call fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadoutFailurePolicy {
    /// Record the failure, leave that half of the readout empty, keep draining
    #[default]
    Continue,
    /// Stop the acquisition and fail the session
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollerSettings {
    /// Sleep after a tick that found nothing new
    pub poll_interval: Duration,
    /// Consecutive failed polls tolerated; one more is fatal
    pub max_poll_failures: u32,
    pub readout_policy: ReadoutFailurePolicy,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            max_poll_failures: 3,
            readout_policy: ReadoutFailurePolicy::Continue,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The detector reported `running == false` and every frame was drained
    Completed,
    /// A stop was requested
    Interrupted,
}

/// A readout request that failed under the `Continue` policy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReadoutFailure {
    pub key: ReadoutKey,
    pub kind: ReadoutKind,
    pub message: String,
}

/// Summary of one polling session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub stop_reason: StopReason,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Poll ticks, including failed ones
    pub polls: u64,
    pub poll_failures: u64,
    pub frames_drained: u64,
    /// Last frame of the last fully drained range
    pub last_drained: Option<i64>,
    /// `(frame, channel)` pairs handed to the sink
    pub readouts: u64,
    pub readout_failures: Vec<ReadoutFailure>,
    /// A stop command was sent to the acquisition server
    pub stop_issued: bool,
}

impl SessionReport {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            stop_reason: StopReason::Completed,
            started_at: now,
            finished_at: now,
            polls: 0,
            poll_failures: 0,
            frames_drained: 0,
            last_drained: None,
            readouts: 0,
            readout_failures: Vec::new(),
            stop_issued: false,
        }
    }
}

/// Create a connected stop handle and signal.
pub fn stop_channel() -> (StopHandle, StopSignal) {
    let (tx, rx) = watch::channel(false);
    (StopHandle { tx: Arc::new(tx) }, StopSignal { rx })
}

/// Requests a running session to stop. Cheap to clone.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Trigger on the first Ctrl-C. A second Ctrl-C exits the process with
    /// status 130 without waiting for the stop command to return.
    pub fn trigger_on_ctrl_c(&self) -> JoinHandle<()> {
        let handle = self.clone();
        tokio::spawn(async move {
            if watch_interrupts(handle, tokio::signal::ctrl_c).await == Interrupts::Repeated {
                error!("Second interrupt received, exiting without waiting for the stop command");
                std::process::exit(130);
            }
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Interrupts {
    Repeated,
    Unavailable,
}

/// Trigger the handle on the first interrupt, then wait for another one.
async fn watch_interrupts<F, Fut>(handle: StopHandle, mut next: F) -> Interrupts
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<()>>,
{
    if let Err(e) = next().await {
        error!("Failed to listen for Ctrl-C: {}", e);
        return Interrupts::Unavailable;
    }
    warn!("Interrupt received, stopping acquisition (interrupt again to exit)");
    handle.trigger();

    match next().await {
        Ok(()) => Interrupts::Repeated,
        Err(e) => {
            error!("Failed to listen for Ctrl-C: {}", e);
            Interrupts::Unavailable
        }
    }
}

/// Observes stop requests.
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once a stop is requested. Never resolves if every handle is gone.
    pub async fn triggered(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

enum DrainOutcome {
    Drained,
    Interrupted,
}

/// Polls one armed acquisition and drains every completed frame into a sink.
pub struct FramePoller<'a, C: ?Sized, D: ?Sized> {
    coordinator: &'a C,
    detector: &'a D,
    settings: PollerSettings,
    stop: StopSignal,
    cursor: PollCursor,
    state: PollerState,
}

impl<'a, C, D> FramePoller<'a, C, D>
where
    C: AcquisitionControl + ?Sized,
    D: ChannelReadout + ?Sized,
{
    pub fn new(
        coordinator: &'a C,
        detector: &'a D,
        settings: PollerSettings,
        stop: StopSignal,
    ) -> Self {
        Self {
            coordinator,
            detector,
            settings,
            stop,
            cursor: PollCursor::new(),
            state: PollerState::Idle,
        }
    }

    pub fn state(&self) -> PollerState {
        self.state
    }

    pub fn cursor(&self) -> PollCursor {
        self.cursor
    }

    fn expect_state(&self, expected: PollerState) -> AppResult<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(DaqError::InvalidState {
                expected,
                found: self.state,
            })
        }
    }

    /// Run the setup (configuration and start) and move to ARMED on success.
    ///
    /// On failure the poller stays IDLE and the error is returned as is. A setup
    /// that returns early because of a stop request still arms; end it with
    /// [`FramePoller::cancel`].
    pub async fn arm<T, F>(&mut self, setup: F) -> AppResult<T>
    where
        F: Future<Output = AppResult<T>>,
    {
        self.expect_state(PollerState::Idle)?;
        let out = setup.await?;
        self.state = PollerState::Armed;
        debug!("frame poller armed");
        Ok(out)
    }

    /// Poll until the acquisition completes or a stop is requested.
    ///
    /// The sink is finished on every way out, including errors.
    pub async fn run<S>(&mut self, sink: &mut S) -> AppResult<SessionReport>
    where
        S: ReadoutSink + ?Sized,
    {
        self.expect_state(PollerState::Armed)?;
        let mut report = SessionReport::new();
        let outcome = self.poll(sink, &mut report).await;
        close_sink(outcome, report, sink)
    }

    /// End an armed session whose setup was cut short by a stop request.
    ///
    /// Issues the best-effort stop and finishes the sink without polling.
    pub async fn cancel<S>(&mut self, sink: &mut S) -> AppResult<SessionReport>
    where
        S: ReadoutSink + ?Sized,
    {
        self.expect_state(PollerState::Armed)?;
        let mut report = SessionReport::new();
        let reason = self.interrupt(&mut report).await;
        close_sink(Ok(reason), report, sink)
    }

    async fn poll<S>(&mut self, sink: &mut S, report: &mut SessionReport) -> AppResult<StopReason>
    where
        S: ReadoutSink + ?Sized,
    {
        let channels = match self.detector.num_channels().await {
            Ok(n) => n,
            Err(e) => {
                self.stop_acquisition(report).await;
                return Err(DaqError::Device(format!(
                    "Failed to read channel count: {e:#}"
                )));
            }
        };
        info!(channels, "Polling for completed frames");
        self.state = PollerState::Polling;

        let mut consecutive_failures = 0u32;
        loop {
            if self.stop.is_triggered() {
                return Ok(self.interrupt(report).await);
            }

            report.polls += 1;
            let (running, last) = match self.observe().await {
                Ok(observed) => {
                    consecutive_failures = 0;
                    observed
                }
                Err(e) => {
                    consecutive_failures += 1;
                    report.poll_failures += 1;
                    if consecutive_failures > self.settings.max_poll_failures {
                        error!(attempts = consecutive_failures, "Giving up on polling: {e:#}");
                        self.stop_acquisition(report).await;
                        return Err(DaqError::PollTransport {
                            attempts: consecutive_failures,
                            source: e,
                        });
                    }
                    warn!(attempt = consecutive_failures, "Poll failed, retrying: {e:#}");
                    if self.sleep_or_stop().await {
                        return Ok(self.interrupt(report).await);
                    }
                    continue;
                }
            };

            if self.stop.is_triggered() {
                return Ok(self.interrupt(report).await);
            }
            debug!(running, last, cursor = self.cursor.last_seen(), "poll");

            if last < self.cursor.last_seen() {
                warn!(
                    last,
                    cursor = self.cursor.last_seen(),
                    "last_image_ready went backwards, ignoring"
                );
            }

            match self.cursor.pending(last) {
                Some(range) => {
                    self.state = PollerState::Draining;
                    match self.drain(range, channels, sink, report).await? {
                        DrainOutcome::Drained => {
                            self.cursor.advance_to(last);
                            report.last_drained = Some(last);
                            self.state = PollerState::Polling;
                        }
                        DrainOutcome::Interrupted => {
                            return Ok(self.interrupt(report).await);
                        }
                    }
                    if !running {
                        return Ok(self.complete(report));
                    }
                }
                None => {
                    if !running {
                        return Ok(self.complete(report));
                    }
                    if self.sleep_or_stop().await {
                        return Ok(self.interrupt(report).await);
                    }
                }
            }
        }
    }

    async fn observe(&self) -> anyhow::Result<(bool, i64)> {
        let running = self.detector.is_running().await?;
        let last = self.coordinator.last_image_ready().await?;
        Ok((running, last))
    }

    /// Sleep one poll interval. Returns true if a stop arrived meanwhile.
    async fn sleep_or_stop(&self) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.settings.poll_interval) => false,
            _ = self.stop.triggered() => true,
        }
    }

    async fn drain<S>(
        &mut self,
        range: RangeInclusive<i64>,
        channels: u32,
        sink: &mut S,
        report: &mut SessionReport,
    ) -> AppResult<DrainOutcome>
    where
        S: ReadoutSink + ?Sized,
    {
        debug!(first = range.start(), last = range.end(), "draining");
        for frame in range {
            for channel in 0..channels {
                if self.stop.is_triggered() {
                    return Ok(DrainOutcome::Interrupted);
                }
                let key = ReadoutKey { frame, channel };

                let scalers = match self.detector.read_scalers(frame, channel).await {
                    Ok(s) => Some(s),
                    Err(e) => {
                        self.readout_failed(key, ReadoutKind::Scalers, e, report)
                            .await?;
                        None
                    }
                };
                let histogram = match self.detector.read_histogram(frame, channel).await {
                    Ok(h) => Some(h),
                    Err(e) => {
                        self.readout_failed(key, ReadoutKind::Histogram, e, report)
                            .await?;
                        None
                    }
                };

                let readout = FrameReadout {
                    key,
                    scalers,
                    histogram,
                };
                if let Err(e) = sink.record(&readout) {
                    error!(%key, "Readout sink failed: {e}");
                    self.stop_acquisition(report).await;
                    return Err(e);
                }
                report.readouts += 1;
            }
            report.frames_drained += 1;
        }
        Ok(DrainOutcome::Drained)
    }

    async fn readout_failed(
        &mut self,
        key: ReadoutKey,
        kind: ReadoutKind,
        source: anyhow::Error,
        report: &mut SessionReport,
    ) -> AppResult<()> {
        match self.settings.readout_policy {
            ReadoutFailurePolicy::Continue => {
                warn!(frame = key.frame, channel = key.channel, %kind, "Readout failed: {source:#}");
                report.readout_failures.push(ReadoutFailure {
                    key,
                    kind,
                    message: format!("{source:#}"),
                });
                Ok(())
            }
            ReadoutFailurePolicy::Abort => {
                error!(frame = key.frame, channel = key.channel, %kind, "Readout failed, aborting: {source:#}");
                self.stop_acquisition(report).await;
                Err(DaqError::Readout { key, kind, source })
            }
        }
    }

    /// Best-effort stop; a failed stop command still ends in STOPPED.
    async fn stop_acquisition(&mut self, report: &mut SessionReport) {
        report.stop_issued = true;
        if let Err(e) = self.coordinator.stop().await {
            warn!("Stop command failed: {e:#}");
        }
        self.state = PollerState::Stopped;
        report.finished_at = Utc::now();
    }

    async fn interrupt(&mut self, report: &mut SessionReport) -> StopReason {
        info!(
            cursor = self.cursor.last_seen(),
            "Stop requested, undrained frames are dropped"
        );
        self.stop_acquisition(report).await;
        StopReason::Interrupted
    }

    fn complete(&mut self, report: &mut SessionReport) -> StopReason {
        self.state = PollerState::Stopped;
        report.finished_at = Utc::now();
        info!(
            frames = report.frames_drained,
            readouts = report.readouts,
            failures = report.readout_failures.len(),
            "Acquisition complete"
        );
        StopReason::Completed
    }
}

/// Finish the sink and settle the result. A finish error is reported only when
/// the session itself succeeded; otherwise the session error wins.
fn close_sink<S>(
    outcome: AppResult<StopReason>,
    mut report: SessionReport,
    sink: &mut S,
) -> AppResult<SessionReport>
where
    S: ReadoutSink + ?Sized,
{
    let finished = sink.finish();
    match outcome {
        Ok(reason) => {
            finished?;
            report.stop_reason = reason;
            Ok(report)
        }
        Err(e) => {
            if let Err(finish_err) = finished {
                warn!("Readout sink failed to finish: {finish_err}");
            }
            Err(e)
        }
    }
}
