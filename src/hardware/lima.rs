//! LimaCCDs Acquisition Server Driver
//!
//! The acquisition server owns the acquisition lifecycle and the saving pipeline.
//! This driver covers the lifecycle half as the `AcquisitionControl` capability;
//! saving and acquisition attributes are written by the configuration sequencer.

use crate::hardware::capabilities::{AcquisitionControl, DeviceProxy};
use crate::hardware::AttrValue;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

/// Driver for a LimaCCDs device
pub struct LimaCcd {
    proxy: Arc<dyn DeviceProxy>,
}

impl LimaCcd {
    pub fn new(proxy: Arc<dyn DeviceProxy>) -> Self {
        Self { proxy }
    }

    pub fn proxy(&self) -> &Arc<dyn DeviceProxy> {
        &self.proxy
    }

    pub fn name(&self) -> &str {
        self.proxy.device_name()
    }

    async fn command(&self, name: &str) -> Result<()> {
        self.proxy
            .command_inout(name, AttrValue::Void)
            .await
            .with_context(|| format!("{}: {name}", self.name()))?;
        Ok(())
    }
}

#[async_trait]
impl AcquisitionControl for LimaCcd {
    async fn prepare(&self) -> Result<()> {
        self.command("prepareAcq").await?;
        debug!(device = self.name(), "acquisition prepared");
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        self.command("startAcq").await?;
        info!(device = self.name(), "acquisition started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.command("stopAcq").await?;
        info!(device = self.name(), "acquisition stopped");
        Ok(())
    }

    async fn last_image_ready(&self) -> Result<i64> {
        self.proxy.read_attribute("last_image_ready").await?.as_i64()
    }
}
