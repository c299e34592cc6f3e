//! Xspress3 Detector Driver
//!
//! Typed access to the Xspress3 device server: static detector geometry, the
//! running flag, and the per-frame `ReadScalers`/`ReadHistogram` commands.
//!
//! # Example Usage
//!
//! ```rust,ignore
//! let x3 = Xspress3::new(proxy);
//! let info = x3.detector_info().await?;
//! for channel in 0..info.num_channels {
//!     let scalers = x3.read_scalers(0, channel).await?;
//!     println!("ch {channel}: {} events", scalers.all_event);
//! }
//! ```

use crate::acquisition::{Histogram, ScalerRecord};
use crate::hardware::capabilities::{ChannelReadout, DeviceProxy};
use crate::hardware::AttrValue;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Input data routed into the channel processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataSource {
    /// This channel's own ADC
    Normal,
    /// The alternate channel's ADC
    Alternate,
    /// All-channel multiplexer
    Multiplexer,
    PlaybackStream0,
    PlaybackStream1,
}

impl DataSource {
    /// Name written to the `dataSource` attribute
    pub fn as_str(self) -> &'static str {
        match self {
            DataSource::Normal => "Normal",
            DataSource::Alternate => "Alternate",
            DataSource::Multiplexer => "Multiplexer",
            DataSource::PlaybackStream0 => "PlaybackStream0",
            DataSource::PlaybackStream1 => "PlaybackStream1",
        }
    }
}

/// Internal frame generator trigger mode (`setItfgTiming`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItfgTriggerMode {
    /// Back-to-back frames
    Burst,
    /// Pause before every frame until the software count-enable edge
    SoftwarePause,
    /// Pause before every frame until a rising edge on TTL in 1
    HardwarePause,
    SoftwareOnlyFirst,
    HardwareOnlyFirst,
}

impl ItfgTriggerMode {
    pub fn code(self) -> i64 {
        match self {
            ItfgTriggerMode::Burst => 0,
            ItfgTriggerMode::SoftwarePause => 1,
            ItfgTriggerMode::HardwarePause => 2,
            ItfgTriggerMode::SoftwareOnlyFirst => 3,
            ItfgTriggerMode::HardwareOnlyFirst => 4,
        }
    }
}

/// Gap inserted between internally generated frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItfgGapMode {
    #[serde(rename = "25ns")]
    Gap25ns,
    #[serde(rename = "200ns")]
    Gap200ns,
    #[serde(rename = "500ns")]
    Gap500ns,
    #[serde(rename = "1us")]
    Gap1us,
}

impl ItfgGapMode {
    pub fn code(self) -> i64 {
        match self {
            ItfgGapMode::Gap25ns => 0,
            ItfgGapMode::Gap200ns => 1,
            ItfgGapMode::Gap500ns => 2,
            ItfgGapMode::Gap1us => 3,
        }
    }
}

/// Static detector geometry, read once per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectorInfo {
    pub num_cards: u32,
    pub num_channels: u32,
    pub max_num_channels: u32,
    pub channels_per_card: u32,
    pub bins_per_mca: u32,
    /// Currently selected card, -1 for all
    pub card: i64,
}

/// Driver for the Xspress3 device server
///
/// Implements the `ChannelReadout` capability used by the frame poller.
pub struct Xspress3 {
    proxy: Arc<dyn DeviceProxy>,
}

impl Xspress3 {
    pub fn new(proxy: Arc<dyn DeviceProxy>) -> Self {
        Self { proxy }
    }

    /// Underlying device handle
    pub fn proxy(&self) -> &Arc<dyn DeviceProxy> {
        &self.proxy
    }

    pub fn name(&self) -> &str {
        self.proxy.device_name()
    }

    async fn read_count(&self, attribute: &str) -> Result<u32> {
        let value = self
            .proxy
            .read_attribute(attribute)
            .await
            .with_context(|| format!("{}: read {attribute}", self.name()))?
            .as_i64()?;
        u32::try_from(value).map_err(|_| anyhow!("{attribute} out of range: {value}"))
    }

    /// Read the static detector geometry
    pub async fn detector_info(&self) -> Result<DetectorInfo> {
        let card = self
            .proxy
            .read_attribute("card")
            .await
            .with_context(|| format!("{}: read card", self.name()))?
            .as_i64()?;
        Ok(DetectorInfo {
            num_cards: self.read_count("numcards").await?,
            num_channels: self.read_count("numChan").await?,
            max_num_channels: self.read_count("maxnumchan").await?,
            channels_per_card: self.read_count("chanspercard").await?,
            bins_per_mca: self.read_count("binspermca").await?,
            card,
        })
    }
}

/// Argument array for `loadPlayback`
pub(crate) fn playback_args(src0: i64, src1: i64, streams: Option<i64>) -> AttrValue {
    let mut args = vec![src0, src1];
    if let Some(streams) = streams {
        args.push(streams);
    }
    AttrValue::LongArray(args)
}

#[async_trait]
impl ChannelReadout for Xspress3 {
    async fn is_running(&self) -> Result<bool> {
        self.proxy.read_attribute("acqRunning").await?.as_bool()
    }

    async fn num_channels(&self) -> Result<u32> {
        self.read_count("numChan").await
    }

    async fn read_scalers(&self, frame: i64, channel: u32) -> Result<ScalerRecord> {
        let raw = self
            .proxy
            .command_inout(
                "ReadScalers",
                AttrValue::LongArray(vec![frame, i64::from(channel)]),
            )
            .await?;
        debug!(frame, channel, "scalers read");
        ScalerRecord::from_values(&raw.to_f64_vec()?)
    }

    async fn read_histogram(&self, frame: i64, channel: u32) -> Result<Histogram> {
        let raw = self
            .proxy
            .command_inout(
                "ReadHistogram",
                AttrValue::LongArray(vec![frame, i64::from(channel)]),
            )
            .await?;
        Ok(Histogram::new(raw.to_f64_vec()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::SimulatedSystem;

    #[test]
    fn playback_args_include_streams_only_when_set() {
        assert_eq!(playback_args(0, 0, None), AttrValue::LongArray(vec![0, 0]));
        assert_eq!(
            playback_args(0, 0, Some(1)),
            AttrValue::LongArray(vec![0, 0, 1])
        );
    }

    #[test]
    fn itfg_codes_follow_hardware_order() {
        assert_eq!(ItfgTriggerMode::Burst.code(), 0);
        assert_eq!(ItfgTriggerMode::HardwareOnlyFirst.code(), 4);
        assert_eq!(ItfgGapMode::Gap1us.code(), 3);
    }

    #[tokio::test]
    async fn test_detector_info_from_simulation() {
        let sim = SimulatedSystem::new(2, 8, 4096);
        let x3 = Xspress3::new(sim.detector());

        let info = x3.detector_info().await.unwrap();
        assert_eq!(info.num_cards, 2);
        assert_eq!(info.num_channels, 8);
        assert_eq!(info.channels_per_card, 4);
        assert_eq!(info.bins_per_mca, 4096);
        assert_eq!(x3.num_channels().await.unwrap(), 8);
        assert!(!x3.is_running().await.unwrap());
    }

    #[tokio::test]
    async fn test_readout_before_any_frame_fails() {
        let sim = SimulatedSystem::new(1, 1, 16);
        let x3 = Xspress3::new(sim.detector());
        let err = x3.read_scalers(0, 0).await.unwrap_err();
        assert!(err.to_string().contains("not available"));
    }
}
