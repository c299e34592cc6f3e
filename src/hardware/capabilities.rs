//! Atomic Device Capabilities
//!
//! This module defines fine-grained capability traits for the two remote device servers.
//! There are two layers:
//!
//! - **Transport capabilities**: `AttributeRead`, `AttributeWrite`, `CommandInvoke` and
//!   `CallTimeout`. These are the only operations a device server offers. Anything that
//!   implements all four is a [`DeviceProxy`] (blanket impl).
//! - **Acquisition capabilities**: `AcquisitionControl` (the acquisition server's
//!   lifecycle and frame counter) and `ChannelReadout` (the detector's running flag,
//!   channel count and per-frame readouts). The frame poller is generic over these, so
//!   its state machine can be exercised against scripted fakes.
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors (remote failures are opaque to us)
//! - Focuses on ONE thing
//!
//! # Example
//!
//! ```rust,ignore
//! async fn frames_ready<C: AcquisitionControl>(lima: &C) -> Result<i64> {
//!     Ok(lima.last_image_ready().await? + 1)
//! }
//! ```

use crate::acquisition::{Histogram, ScalerRecord};
use crate::hardware::AttrValue;
use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Capability: Attribute Read
///
/// # Contract
/// - `name` is the attribute name exactly as exported by the device server
/// - Reads have no side effects on the device
#[async_trait]
pub trait AttributeRead: Send + Sync {
    /// Read the current value of an attribute
    async fn read_attribute(&self, name: &str) -> Result<AttrValue>;
}

/// Capability: Attribute Write
///
/// # Contract
/// - Writes are applied in call order; the caller owns ordering
/// - A write either succeeds completely or returns Err
#[async_trait]
pub trait AttributeWrite: Send + Sync {
    /// Write a value to an attribute
    async fn write_attribute(&self, name: &str, value: AttrValue) -> Result<()>;
}

/// Capability: Command Invocation
#[async_trait]
pub trait CommandInvoke: Send + Sync {
    /// Invoke a command with one argument, returning its result
    ///
    /// Commands without argument take `AttrValue::Void`; commands without result
    /// return `AttrValue::Void`.
    async fn command_inout(&self, name: &str, arg: AttrValue) -> Result<AttrValue>;
}

/// Capability: Per-call Timeout
///
/// The timeout applies uniformly to every subsequent request on this device.
#[async_trait]
pub trait CallTimeout: Send + Sync {
    /// Set the timeout applied to each request
    ///
    /// # Default Implementation
    /// Returns an error indicating the timeout cannot be changed.
    async fn set_timeout(&self, timeout: Duration) -> Result<()> {
        let _ = timeout;
        anyhow::bail!("Call timeout not supported by this device")
    }

    /// Device name used in logs and error messages
    fn device_name(&self) -> &str;
}

/// Combined trait for remote device handles
///
/// This trait exists solely to enable trait objects (`Arc<dyn DeviceProxy>`).
/// Implement the individual capabilities and get this automatically via blanket impl.
pub trait DeviceProxy: AttributeRead + AttributeWrite + CommandInvoke + CallTimeout {}

/// Blanket implementation - any type implementing all transport capabilities is a proxy
impl<T: AttributeRead + AttributeWrite + CommandInvoke + CallTimeout> DeviceProxy for T {}

/// Capability: Acquisition Lifecycle
///
/// Owned by the acquisition server. `last_image_ready` is -1 until the first frame
/// completes and never decreases while acquisition runs.
#[async_trait]
pub trait AcquisitionControl: Send + Sync {
    /// Prepare the acquisition (buffers, saving pipeline)
    async fn prepare(&self) -> Result<()>;

    /// Start the acquisition
    async fn start(&self) -> Result<()>;

    /// Stop the acquisition
    async fn stop(&self) -> Result<()>;

    /// Index of the last completed frame, -1 when none
    async fn last_image_ready(&self) -> Result<i64>;
}

/// Capability: Per-channel Frame Readout
///
/// Owned by the detector. Readouts are addressed by `(frame, channel)` and only valid
/// for frames that have completed.
#[async_trait]
pub trait ChannelReadout: Send + Sync {
    /// Whether the detector is still acquiring
    async fn is_running(&self) -> Result<bool>;

    /// Number of readout channels; static for a session
    async fn num_channels(&self) -> Result<u32>;

    /// Read the scaler statistics of one frame/channel
    async fn read_scalers(&self, frame: i64, channel: u32) -> Result<ScalerRecord>;

    /// Read the histogram of one frame/channel
    async fn read_histogram(&self, frame: i64, channel: u32) -> Result<Histogram>;
}
