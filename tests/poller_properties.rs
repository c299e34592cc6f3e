//! Frame poller behaviour against a scripted acquisition.
//!
//! The fake replays a fixed list of `(running, last_image_ready)` observations, one
//! per poll tick, and records every readout and stop request it receives.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use xspress3_daq::acquisition::{
    stop_channel, FramePoller, FrameReadout, PollerSettings, ReadoutFailurePolicy, ReadoutKind,
    StopHandle, StopReason, StopSignal, SCALER_WIDTH,
};
use xspress3_daq::acquisition::{Histogram, PollerState, ReadoutSink, ScalerRecord};
use xspress3_daq::hardware::{AcquisitionControl, ChannelReadout};
use xspress3_daq::{AppResult, DaqError};

// =============================================================================
// ScriptedAcquisition - replays poll observations
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
enum Tick {
    Observe(bool, i64),
    /// Both reads of this tick fail
    Fail,
}

#[derive(Debug, Clone, PartialEq)]
enum Call {
    Scalers(i64, u32),
    Histogram(i64, u32),
    Stop,
}

struct ScriptedAcquisition {
    channels: u32,
    ticks: Mutex<VecDeque<Tick>>,
    current: Mutex<Tick>,
    calls: Mutex<Vec<Call>>,
    failing: HashSet<(i64, u32, ReadoutKind)>,
    /// Trigger this stop handle once the given number of readout pairs is done
    stop_after: Option<(usize, StopHandle)>,
    stop_fails: bool,
    channels_fail: bool,
}

impl ScriptedAcquisition {
    fn new(channels: u32, ticks: &[Tick]) -> Self {
        Self {
            channels,
            ticks: Mutex::new(ticks.iter().copied().collect()),
            current: Mutex::new(Tick::Observe(true, -1)),
            calls: Mutex::new(Vec::new()),
            failing: HashSet::new(),
            stop_after: None,
            stop_fails: false,
            channels_fail: false,
        }
    }

    fn observe(running: bool, lasts: &[i64]) -> Vec<Tick> {
        lasts.iter().map(|&l| Tick::Observe(running, l)).collect()
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Frames with a scaler readout, in call order
    fn scaler_pairs(&self) -> Vec<(i64, u32)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Scalers(f, ch) => Some((f, ch)),
                _ => None,
            })
            .collect()
    }

    fn stops(&self) -> usize {
        self.calls().iter().filter(|c| **c == Call::Stop).count()
    }

    fn record(&self, call: Call) {
        let mut calls = self.calls.lock().unwrap();
        calls.push(call);
        if let Some((pairs, handle)) = &self.stop_after {
            let done = calls
                .iter()
                .filter(|c| matches!(c, Call::Histogram(..)))
                .count();
            if done >= *pairs {
                handle.trigger();
            }
        }
    }
}

#[async_trait]
impl AcquisitionControl for ScriptedAcquisition {
    async fn prepare(&self) -> Result<()> {
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.record(Call::Stop);
        if self.stop_fails {
            bail!("stopAcq timed out");
        }
        Ok(())
    }

    async fn last_image_ready(&self) -> Result<i64> {
        match *self.current.lock().unwrap() {
            Tick::Observe(_, last) => Ok(last),
            Tick::Fail => bail!("last_image_ready: transport failure"),
        }
    }
}

#[async_trait]
impl ChannelReadout for ScriptedAcquisition {
    async fn is_running(&self) -> Result<bool> {
        // Each tick starts with the running read; the script holds on its last entry
        let mut ticks = self.ticks.lock().unwrap();
        let tick = if ticks.len() > 1 {
            ticks.pop_front().unwrap()
        } else {
            *ticks.front().unwrap()
        };
        *self.current.lock().unwrap() = tick;
        match tick {
            Tick::Observe(running, _) => Ok(running),
            Tick::Fail => bail!("acqRunning: transport failure"),
        }
    }

    async fn num_channels(&self) -> Result<u32> {
        if self.channels_fail {
            bail!("numChan: transport failure");
        }
        Ok(self.channels)
    }

    async fn read_scalers(&self, frame: i64, channel: u32) -> Result<ScalerRecord> {
        self.record(Call::Scalers(frame, channel));
        if self.failing.contains(&(frame, channel, ReadoutKind::Scalers)) {
            bail!("ReadScalers failed");
        }
        ScalerRecord::from_values(&[frame as f64; SCALER_WIDTH])
    }

    async fn read_histogram(&self, frame: i64, channel: u32) -> Result<Histogram> {
        self.record(Call::Histogram(frame, channel));
        if self.failing.contains(&(frame, channel, ReadoutKind::Histogram)) {
            bail!("ReadHistogram failed");
        }
        Ok(Histogram::new(vec![1.0; 8]))
    }
}

fn fast() -> PollerSettings {
    PollerSettings {
        poll_interval: Duration::from_millis(1),
        ..Default::default()
    }
}

async fn run_script(
    acq: &ScriptedAcquisition,
    settings: PollerSettings,
    signal: StopSignal,
) -> (Result<xspress3_daq::acquisition::SessionReport, DaqError>, Vec<FrameReadout>) {
    let mut poller = FramePoller::new(acq, acq, settings, signal);
    poller.arm(async { Ok(()) }).await.unwrap();
    let mut sink: Vec<FrameReadout> = Vec::new();
    let result = poller.run(&mut sink).await;
    assert_eq!(poller.state(), PollerState::Stopped);
    (result, sink)
}

// =============================================================================
// Properties
// =============================================================================

#[tokio::test]
async fn example_scenario_drains_in_order_then_stops() {
    let mut ticks = ScriptedAcquisition::observe(true, &[-1, 0, 0, 3]);
    ticks.push(Tick::Observe(false, 3));
    let acq = ScriptedAcquisition::new(2, &ticks);
    let (_stop, signal) = stop_channel();

    let (result, sink) = run_script(&acq, fast(), signal).await;
    let report = result.unwrap();

    let drained: Vec<(i64, u32)> = sink.iter().map(|r| (r.key.frame, r.key.channel)).collect();
    assert_eq!(
        drained,
        vec![(0, 0), (0, 1), (1, 0), (1, 1), (2, 0), (2, 1), (3, 0), (3, 1)]
    );
    assert_eq!(report.stop_reason, StopReason::Completed);
    assert_eq!(report.polls, 5);
    assert_eq!(report.last_drained, Some(3));
    assert_eq!(acq.stops(), 0);

    // Scalers before histogram for every pair
    let calls = acq.calls();
    assert_eq!(calls[0], Call::Scalers(0, 0));
    assert_eq!(calls[1], Call::Histogram(0, 0));
}

#[tokio::test]
async fn no_frame_is_skipped_or_repeated() {
    let mut ticks = ScriptedAcquisition::observe(true, &[-1, 2, 2, 5]);
    ticks.push(Tick::Observe(false, 5));
    let acq = ScriptedAcquisition::new(3, &ticks);
    let (_stop, signal) = stop_channel();

    let (result, _sink) = run_script(&acq, fast(), signal).await;
    result.unwrap();

    let pairs = acq.scaler_pairs();
    let unique: HashSet<(i64, u32)> = pairs.iter().copied().collect();
    assert_eq!(unique.len(), pairs.len(), "a pair was read twice");

    let frames: Vec<i64> = pairs
        .iter()
        .filter(|(_, ch)| *ch == 0)
        .map(|(f, _)| *f)
        .collect();
    assert_eq!(frames, vec![0, 1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn completion_drains_up_to_final_frame() {
    // The tick that reports running == false also reveals new frames
    let acq = ScriptedAcquisition::new(
        1,
        &[Tick::Observe(true, 1), Tick::Observe(false, 4)],
    );
    let (_stop, signal) = stop_channel();

    let (result, sink) = run_script(&acq, fast(), signal).await;
    let report = result.unwrap();

    assert_eq!(sink.last().map(|r| r.key.frame), Some(4));
    assert_eq!(report.frames_drained, 5);
    assert_eq!(report.polls, 2);
}

#[tokio::test]
async fn interrupt_stops_without_draining_pending_frames() {
    let (stop, signal) = stop_channel();
    let mut acq = ScriptedAcquisition::new(
        2,
        &[Tick::Observe(true, 0), Tick::Observe(true, 6)],
    );
    // Stop arrives once frame 0 is fully read out
    acq.stop_after = Some((2, stop.clone()));

    let (result, sink) = run_script(&acq, fast(), signal).await;
    let report = result.unwrap();

    assert_eq!(report.stop_reason, StopReason::Interrupted);
    assert!(report.stop_issued);
    assert_eq!(acq.stops(), 1);
    assert_eq!(sink.len(), 2);
    assert!(acq.scaler_pairs().iter().all(|(f, _)| *f == 0));
}

#[tokio::test]
async fn interrupt_mid_range_drops_rest_of_range() {
    let (stop, signal) = stop_channel();
    let mut acq = ScriptedAcquisition::new(2, &[Tick::Observe(true, 3)]);
    acq.stop_after = Some((3, stop.clone()));

    let (result, sink) = run_script(&acq, fast(), signal).await;
    let report = result.unwrap();

    assert_eq!(report.stop_reason, StopReason::Interrupted);
    assert_eq!(sink.len(), 3);
    assert_eq!(report.last_drained, None);
    assert_eq!(report.frames_drained, 1);
}

#[tokio::test]
async fn stop_before_first_poll_issues_stop_only() {
    let (stop, signal) = stop_channel();
    stop.trigger();
    let acq = ScriptedAcquisition::new(1, &[Tick::Observe(true, 5)]);

    let (result, sink) = run_script(&acq, fast(), signal).await;
    let report = result.unwrap();

    assert_eq!(report.stop_reason, StopReason::Interrupted);
    assert_eq!(report.polls, 0);
    assert!(sink.is_empty());
    assert_eq!(acq.calls(), vec![Call::Stop]);
}

#[tokio::test]
async fn failed_stop_still_ends_stopped() {
    let (stop, signal) = stop_channel();
    stop.trigger();
    let mut acq = ScriptedAcquisition::new(1, &[Tick::Observe(true, -1)]);
    acq.stop_fails = true;

    let (result, _sink) = run_script(&acq, fast(), signal).await;
    assert_eq!(result.unwrap().stop_reason, StopReason::Interrupted);
}

#[tokio::test]
async fn idle_ticks_issue_no_readouts() {
    let mut ticks = ScriptedAcquisition::observe(true, &[-1, -1, -1, -1]);
    ticks.push(Tick::Observe(false, -1));
    let acq = ScriptedAcquisition::new(4, &ticks);
    let (_stop, signal) = stop_channel();

    let (result, sink) = run_script(&acq, fast(), signal).await;
    let report = result.unwrap();

    assert!(sink.is_empty());
    assert!(acq.calls().is_empty());
    assert_eq!(report.polls, 5);
    assert_eq!(report.last_drained, None);
}

#[tokio::test]
async fn idle_wait_sleeps_between_polls() {
    let mut ticks = ScriptedAcquisition::observe(true, &[-1, -1, -1]);
    ticks.push(Tick::Observe(false, -1));
    let acq = ScriptedAcquisition::new(1, &ticks);
    let (_stop, signal) = stop_channel();
    let settings = PollerSettings {
        poll_interval: Duration::from_millis(20),
        ..Default::default()
    };

    let started = std::time::Instant::now();
    let (result, _sink) = run_script(&acq, settings, signal).await;
    result.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(60));
}

#[tokio::test]
async fn stop_interrupts_idle_sleep() {
    let (stop, signal) = stop_channel();
    let acq = ScriptedAcquisition::new(1, &[Tick::Observe(true, -1)]);
    let settings = PollerSettings {
        poll_interval: Duration::from_secs(3600),
        ..Default::default()
    };

    let trigger = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        stop.trigger();
    });
    let (result, _sink) = tokio::time::timeout(
        Duration::from_secs(5),
        run_script(&acq, settings, signal),
    )
    .await
    .expect("stop did not wake the poller");
    trigger.await.unwrap();

    assert_eq!(result.unwrap().stop_reason, StopReason::Interrupted);
    assert_eq!(acq.stops(), 1);
}

#[tokio::test]
async fn regression_of_frame_counter_is_ignored() {
    let acq = ScriptedAcquisition::new(
        1,
        &[
            Tick::Observe(true, 2),
            Tick::Observe(true, 1),
            Tick::Observe(true, 3),
            Tick::Observe(false, 3),
        ],
    );
    let (_stop, signal) = stop_channel();

    let (result, _sink) = run_script(&acq, fast(), signal).await;
    result.unwrap();
    let frames: Vec<i64> = acq.scaler_pairs().into_iter().map(|(f, _)| f).collect();
    assert_eq!(frames, vec![0, 1, 2, 3]);
}

// =============================================================================
// Failure policies
// =============================================================================

#[tokio::test]
async fn readout_failure_is_recorded_and_draining_continues() {
    let mut acq = ScriptedAcquisition::new(
        2,
        &[Tick::Observe(true, 1), Tick::Observe(false, 1)],
    );
    acq.failing.insert((0, 1, ReadoutKind::Histogram));
    let (_stop, signal) = stop_channel();

    let (result, sink) = run_script(&acq, fast(), signal).await;
    let report = result.unwrap();

    assert_eq!(sink.len(), 4);
    assert_eq!(report.readout_failures.len(), 1);
    let failure = &report.readout_failures[0];
    assert_eq!((failure.key.frame, failure.key.channel), (0, 1));
    assert_eq!(failure.kind, ReadoutKind::Histogram);

    let partial = &sink[1];
    assert!(partial.scalers.is_some());
    assert!(partial.histogram.is_none());
    assert!(!partial.is_complete());
    // Never retried
    assert_eq!(
        acq.calls()
            .iter()
            .filter(|c| **c == Call::Histogram(0, 1))
            .count(),
        1
    );
}

#[tokio::test]
async fn abort_policy_stops_on_first_readout_failure() {
    let mut acq = ScriptedAcquisition::new(
        2,
        &[Tick::Observe(true, 3), Tick::Observe(false, 3)],
    );
    acq.failing.insert((1, 0, ReadoutKind::Scalers));
    let (_stop, signal) = stop_channel();
    let settings = PollerSettings {
        readout_policy: ReadoutFailurePolicy::Abort,
        ..fast()
    };

    let (result, sink) = run_script(&acq, settings, signal).await;
    match result {
        Err(DaqError::Readout { key, kind, .. }) => {
            assert_eq!((key.frame, key.channel), (1, 0));
            assert_eq!(kind, ReadoutKind::Scalers);
        }
        other => panic!("expected readout error, got {other:?}"),
    }
    assert_eq!(sink.len(), 2);
    assert_eq!(acq.stops(), 1);
}

#[tokio::test]
async fn transient_poll_failures_are_retried() {
    let acq = ScriptedAcquisition::new(
        1,
        &[
            Tick::Fail,
            Tick::Fail,
            Tick::Observe(true, 0),
            Tick::Fail,
            Tick::Observe(false, 1),
        ],
    );
    let (_stop, signal) = stop_channel();

    let (result, sink) = run_script(&acq, fast(), signal).await;
    let report = result.unwrap();

    assert_eq!(report.stop_reason, StopReason::Completed);
    assert_eq!(report.poll_failures, 3);
    assert_eq!(sink.len(), 2);
}

#[tokio::test]
async fn persistent_poll_failure_is_fatal_after_ceiling() {
    let acq = ScriptedAcquisition::new(1, &[Tick::Observe(true, 0), Tick::Fail]);
    let (_stop, signal) = stop_channel();
    let settings = PollerSettings {
        max_poll_failures: 2,
        ..fast()
    };

    let (result, sink) = run_script(&acq, settings, signal).await;
    match result {
        Err(DaqError::PollTransport { attempts, .. }) => assert_eq!(attempts, 3),
        other => panic!("expected poll transport error, got {other:?}"),
    }
    assert_eq!(sink.len(), 1);
    assert_eq!(acq.stops(), 1);
}

// =============================================================================
// Sink lifecycle
// =============================================================================

/// Counts `finish` calls; optionally fails them.
#[derive(Default)]
struct TrackingSink {
    readouts: Vec<FrameReadout>,
    finished: usize,
    finish_fails: bool,
}

impl ReadoutSink for TrackingSink {
    fn record(&mut self, readout: &FrameReadout) -> AppResult<()> {
        self.readouts.push(readout.clone());
        Ok(())
    }

    fn finish(&mut self) -> AppResult<()> {
        self.finished += 1;
        if self.finish_fails {
            return Err(DaqError::Storage("disk full".into()));
        }
        Ok(())
    }
}

async fn run_tracked(
    acq: &ScriptedAcquisition,
    settings: PollerSettings,
    sink: &mut TrackingSink,
) -> Result<xspress3_daq::acquisition::SessionReport, DaqError> {
    let (_stop, signal) = stop_channel();
    let mut poller = FramePoller::new(acq, acq, settings, signal);
    poller.arm(async { Ok(()) }).await.unwrap();
    let result = poller.run(sink).await;
    assert_eq!(poller.state(), PollerState::Stopped);
    result
}

#[tokio::test]
async fn sink_is_finished_after_completion() {
    let acq = ScriptedAcquisition::new(1, &[Tick::Observe(false, 0)]);
    let mut sink = TrackingSink::default();

    assert!(run_tracked(&acq, fast(), &mut sink).await.is_ok());
    assert_eq!(sink.finished, 1);
}

#[tokio::test]
async fn sink_is_finished_when_readout_aborts() {
    let mut acq = ScriptedAcquisition::new(1, &[Tick::Observe(false, 2)]);
    acq.failing.insert((1, 0, ReadoutKind::Histogram));
    let settings = PollerSettings {
        readout_policy: ReadoutFailurePolicy::Abort,
        ..fast()
    };
    let mut sink = TrackingSink::default();

    let result = run_tracked(&acq, settings, &mut sink).await;
    assert!(matches!(result, Err(DaqError::Readout { .. })));
    assert_eq!(sink.readouts.len(), 1);
    assert_eq!(sink.finished, 1);
}

#[tokio::test]
async fn sink_is_finished_when_polling_gives_up() {
    let acq = ScriptedAcquisition::new(1, &[Tick::Fail]);
    let settings = PollerSettings {
        max_poll_failures: 1,
        ..fast()
    };
    let mut sink = TrackingSink::default();

    let result = run_tracked(&acq, settings, &mut sink).await;
    assert!(matches!(result, Err(DaqError::PollTransport { attempts: 2, .. })));
    assert_eq!(sink.finished, 1);
    assert_eq!(acq.stops(), 1);
}

#[tokio::test]
async fn sink_is_finished_when_channel_count_is_unreadable() {
    let mut acq = ScriptedAcquisition::new(1, &[Tick::Observe(true, 0)]);
    acq.channels_fail = true;
    let mut sink = TrackingSink::default();

    let result = run_tracked(&acq, fast(), &mut sink).await;
    assert!(matches!(result, Err(DaqError::Device(_))));
    assert!(sink.readouts.is_empty());
    assert_eq!(sink.finished, 1);
    assert_eq!(acq.stops(), 1);
}

#[tokio::test]
async fn session_error_wins_over_finish_error() {
    let acq = ScriptedAcquisition::new(1, &[Tick::Fail]);
    let settings = PollerSettings {
        max_poll_failures: 0,
        ..fast()
    };
    let mut sink = TrackingSink {
        finish_fails: true,
        ..Default::default()
    };

    let result = run_tracked(&acq, settings, &mut sink).await;
    assert!(matches!(result, Err(DaqError::PollTransport { .. })));
    assert_eq!(sink.finished, 1);
}

#[tokio::test]
async fn finish_error_fails_a_completed_session() {
    let acq = ScriptedAcquisition::new(1, &[Tick::Observe(false, 0)]);
    let mut sink = TrackingSink {
        finish_fails: true,
        ..Default::default()
    };

    let result = run_tracked(&acq, fast(), &mut sink).await;
    assert!(matches!(result, Err(DaqError::Storage(_))));
}
