//! Destinations for drained readouts.
//!
//! The poller hands every `(frame, channel)` readout to a [`ReadoutSink`] in drain
//! order. Sinks are synchronous; a sink error stops the acquisition.

use crate::acquisition::{FrameReadout, DETECTOR_CLOCK_HZ};
use crate::error::{AppResult, DaqError};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[cfg(feature = "storage_csv")]
use crate::acquisition::ScalerRecord;
#[cfg(feature = "storage_csv")]
use std::{fs::File, io::Write, path::Path};

/// Receives readouts in drain order.
pub trait ReadoutSink: Send {
    fn record(&mut self, readout: &FrameReadout) -> AppResult<()>;

    /// Called once when the session ends, completed, interrupted or failed.
    fn finish(&mut self) -> AppResult<()> {
        Ok(())
    }
}

/// Collects everything in memory.
impl ReadoutSink for Vec<FrameReadout> {
    fn record(&mut self, readout: &FrameReadout) -> AppResult<()> {
        self.push(readout.clone());
        Ok(())
    }
}

/// Logs each readout the way the operator scripts print them.
#[derive(Debug, Clone)]
pub struct LogSink {
    clock_hz: f64,
    print_histograms: bool,
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new(false)
    }
}

impl LogSink {
    pub fn new(print_histograms: bool) -> Self {
        Self {
            clock_hz: DETECTOR_CLOCK_HZ,
            print_histograms,
        }
    }

    pub fn with_clock(mut self, clock_hz: f64) -> Self {
        self.clock_hz = clock_hz;
        self
    }
}

impl ReadoutSink for LogSink {
    fn record(&mut self, readout: &FrameReadout) -> AppResult<()> {
        let key = readout.key;
        match &readout.scalers {
            Some(s) => info!(
                frame = key.frame,
                channel = key.channel,
                time_s = s.live_time_seconds(self.clock_hz),
                all_event = s.all_event,
                all_good = s.all_good,
                dead_time_pct = s.dead_time_percent,
                dead_time_factor = s.dead_time_factor,
                "scalers"
            ),
            None => warn!(frame = key.frame, channel = key.channel, "no scalers"),
        }
        if self.print_histograms {
            match &readout.histogram {
                Some(h) => info!(
                    frame = key.frame,
                    channel = key.channel,
                    bins = h.len(),
                    total = h.total(),
                    "histogram"
                ),
                None => warn!(frame = key.frame, channel = key.channel, "no histogram"),
            }
        }
        Ok(())
    }
}

/// Forwards readouts to an async consumer.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<FrameReadout>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<FrameReadout>) -> Self {
        Self { tx }
    }

    /// A sink and the receiving end.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<FrameReadout>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ReadoutSink for ChannelSink {
    fn record(&mut self, readout: &FrameReadout) -> AppResult<()> {
        self.tx
            .send(readout.clone())
            .map_err(|_| DaqError::Storage("readout receiver dropped".to_string()))
    }
}

/// Hands each readout to several sinks in order.
#[derive(Default)]
pub struct FanOut {
    sinks: Vec<Box<dyn ReadoutSink>>,
}

impl FanOut {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl ReadoutSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn push(&mut self, sink: Box<dyn ReadoutSink>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl ReadoutSink for FanOut {
    fn record(&mut self, readout: &FrameReadout) -> AppResult<()> {
        for sink in &mut self.sinks {
            sink.record(readout)?;
        }
        Ok(())
    }

    fn finish(&mut self) -> AppResult<()> {
        for sink in &mut self.sinks {
            sink.finish()?;
        }
        Ok(())
    }
}

/// Writes one CSV row per readout: frame, channel, the eleven scaler values,
/// live time in seconds and the histogram total. Failed halves are left empty.
#[cfg(feature = "storage_csv")]
pub struct CsvSink {
    writer: csv::Writer<File>,
    clock_hz: f64,
}

#[cfg(feature = "storage_csv")]
impl CsvSink {
    pub fn create<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = File::create(path)
            .map_err(|e| DaqError::Storage(format!("Failed to create CSV file: {e}")))?;
        writeln!(
            file,
            "# xspress3 readout, created {}",
            chrono::Utc::now().to_rfc3339()
        )?;

        let mut writer = csv::Writer::from_writer(file);
        let mut header = vec!["frame", "channel"];
        header.extend(ScalerRecord::FIELDS);
        header.extend(["live_time_s", "histogram_total"]);
        writer
            .write_record(&header)
            .map_err(|e| DaqError::Storage(e.to_string()))?;

        info!("CSV output at '{}'", path.display());
        Ok(Self {
            writer,
            clock_hz: DETECTOR_CLOCK_HZ,
        })
    }
}

#[cfg(feature = "storage_csv")]
impl ReadoutSink for CsvSink {
    fn record(&mut self, readout: &FrameReadout) -> AppResult<()> {
        let mut row = vec![readout.key.frame.to_string(), readout.key.channel.to_string()];
        match &readout.scalers {
            Some(s) => {
                row.extend(s.to_values().iter().map(f64::to_string));
                row.push(s.live_time_seconds(self.clock_hz).to_string());
            }
            None => row.extend(std::iter::repeat(String::new()).take(ScalerRecord::FIELDS.len() + 1)),
        }
        row.push(
            readout
                .histogram
                .as_ref()
                .map_or(String::new(), |h| h.total().to_string()),
        );
        self.writer
            .write_record(&row)
            .map_err(|e| DaqError::Storage(e.to_string()))
    }

    fn finish(&mut self) -> AppResult<()> {
        self.writer.flush()?;
        Ok(())
    }
}
