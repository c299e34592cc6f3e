//! One-time device registration.
//!
//! Registers a LimaCCDs acquisition server and an Xspress3 detector under one server
//! instance (`LimaCCDs/<instance>`) and writes their default properties. This runs
//! once per installation, never during an acquisition.
//!
//! # Example
//! ```rust,ignore
//! let request = ProvisioningRequest::new("xspress3").with_channels(4);
//! let db = JsonFileDatabase::new("devices.json");
//! provisioning::apply(&request, &db).await?;
//! ```

use crate::error::{AppResult, DaqError};
use crate::validation;
use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::info;

pub const COORDINATOR_CLASS: &str = "LimaCCDs";
pub const DETECTOR_CLASS: &str = "Xspress3";

pub type Properties = BTreeMap<String, String>;

/// Everything needed to register one detector installation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisioningRequest {
    /// Server instance name, usually `xspress3`
    pub instance: String,
    pub detector_device: String,
    pub coordinator_device: String,
    pub channels: u32,
    pub base_ip: String,
    pub base_mac: String,
    pub base_port: u16,
    /// Frame buffer depth on the detector
    pub max_frames: u32,
    pub directory_name: String,
    pub card_index: u32,
}

impl ProvisioningRequest {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
            detector_device: "lima/xspress3/1".to_string(),
            coordinator_device: "lima/limaccd/1".to_string(),
            channels: 1,
            base_ip: "192.168.0.1".to_string(),
            base_mac: "02.00.00.00.00.00".to_string(),
            base_port: 30123,
            max_frames: 16384,
            directory_name: String::new(),
            card_index: 0,
        }
    }

    pub fn with_channels(mut self, channels: u32) -> Self {
        self.channels = channels;
        self
    }

    pub fn with_devices(
        mut self,
        coordinator: impl Into<String>,
        detector: impl Into<String>,
    ) -> Self {
        self.coordinator_device = coordinator.into();
        self.detector_device = detector.into();
        self
    }

    pub fn server(&self) -> String {
        format!("{COORDINATOR_CLASS}/{}", self.instance)
    }

    pub fn validate(&self) -> AppResult<()> {
        let invalid = |msg: String| Err(DaqError::Provisioning(msg));

        if validation::is_not_empty(&self.instance).is_err() || self.instance.contains('/') {
            return invalid(format!("Invalid instance name '{}'", self.instance));
        }
        for name in [&self.coordinator_device, &self.detector_device] {
            if let Err(e) = validation::is_valid_device_name(name) {
                return invalid(format!("Invalid device '{name}': {e}"));
            }
        }
        if self.coordinator_device == self.detector_device {
            return invalid("Coordinator and detector need distinct device names".into());
        }
        if self.channels == 0 {
            return invalid("channels must be greater than 0".into());
        }
        if let Err(e) = validation::is_valid_ip(&self.base_ip) {
            return invalid(format!("{e}: {}", self.base_ip));
        }
        if let Err(e) = validation::is_valid_mac(&self.base_mac) {
            return invalid(format!("{e}: {}", self.base_mac));
        }
        if let Err(e) = validation::is_valid_port(self.base_port) {
            return invalid(e.to_string());
        }
        Ok(())
    }

    /// The registrations and property writes, in order.
    pub fn plan(&self) -> Vec<ProvisioningAction> {
        let server = self.server();

        let mut coordinator_props = Properties::new();
        coordinator_props.insert("LimaCameraType".into(), DETECTOR_CLASS.into());

        let detector_props: Properties = [
            ("baseIPaddress", self.base_ip.clone()),
            ("baseMacAddress", self.base_mac.clone()),
            ("basePort", self.base_port.to_string()),
            ("maxFrames", self.max_frames.to_string()),
            ("nbChans", self.channels.to_string()),
            ("directoryName", self.directory_name.clone()),
            ("cardIndex", self.card_index.to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        vec![
            ProvisioningAction::AddDevice(DeviceRecord {
                class: COORDINATOR_CLASS.into(),
                server: server.clone(),
                name: self.coordinator_device.clone(),
            }),
            ProvisioningAction::AddDevice(DeviceRecord {
                class: DETECTOR_CLASS.into(),
                server,
                name: self.detector_device.clone(),
            }),
            ProvisioningAction::PutProperties {
                device: self.coordinator_device.clone(),
                properties: coordinator_props,
            },
            ProvisioningAction::PutProperties {
                device: self.detector_device.clone(),
                properties: detector_props,
            },
        ]
    }
}

/// A device registered with the naming service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub class: String,
    pub server: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ProvisioningAction {
    AddDevice(DeviceRecord),
    PutProperties { device: String, properties: Properties },
}

impl fmt::Display for ProvisioningAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProvisioningAction::AddDevice(r) => {
                write!(f, "add {} device {} to server {}", r.class, r.name, r.server)
            }
            ProvisioningAction::PutProperties { device, properties } => {
                write!(f, "put {} properties on {device}", properties.len())
            }
        }
    }
}

/// Device naming service.
#[async_trait]
pub trait DeviceDatabase: Send + Sync {
    /// Register a device. Re-registering an identical record is a no-op.
    async fn add_device(&self, record: &DeviceRecord) -> Result<()>;

    /// Merge properties into a registered device.
    async fn put_properties(&self, device: &str, properties: &Properties) -> Result<()>;

    async fn device(&self, name: &str) -> Result<Option<DeviceRecord>>;

    async fn properties(&self, device: &str) -> Result<Properties>;
}

/// Registry contents, also the on-disk format of [`JsonFileDatabase`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseContents {
    pub devices: BTreeMap<String, DeviceRecord>,
    pub properties: BTreeMap<String, Properties>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl DatabaseContents {
    fn add_device(&mut self, record: &DeviceRecord) -> Result<()> {
        match self.devices.get(&record.name) {
            Some(existing) if existing == record => return Ok(()),
            Some(existing) => bail!(
                "Device {} already registered as {} in {}",
                record.name,
                existing.class,
                existing.server
            ),
            None => {}
        }
        self.devices.insert(record.name.clone(), record.clone());
        self.updated_at = Some(Utc::now());
        Ok(())
    }

    fn put_properties(&mut self, device: &str, properties: &Properties) -> Result<()> {
        if !self.devices.contains_key(device) {
            bail!("Device {device} is not registered");
        }
        self.properties
            .entry(device.to_string())
            .or_default()
            .extend(properties.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.updated_at = Some(Utc::now());
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryDatabase {
    contents: Mutex<DatabaseContents>,
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> DatabaseContents {
        self.contents.lock().await.clone()
    }
}

#[async_trait]
impl DeviceDatabase for InMemoryDatabase {
    async fn add_device(&self, record: &DeviceRecord) -> Result<()> {
        self.contents.lock().await.add_device(record)
    }

    async fn put_properties(&self, device: &str, properties: &Properties) -> Result<()> {
        self.contents.lock().await.put_properties(device, properties)
    }

    async fn device(&self, name: &str) -> Result<Option<DeviceRecord>> {
        Ok(self.contents.lock().await.devices.get(name).cloned())
    }

    async fn properties(&self, device: &str) -> Result<Properties> {
        Ok(self
            .contents
            .lock()
            .await
            .properties
            .get(device)
            .cloned()
            .unwrap_or_default())
    }
}

/// Registry persisted as pretty JSON; every change rewrites the file.
#[derive(Debug)]
pub struct JsonFileDatabase {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileDatabase {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<DatabaseContents> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(DatabaseContents::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, contents: &DatabaseContents) -> Result<()> {
        let text = serde_json::to_string_pretty(contents)?;
        tokio::fs::write(&self.path, text).await?;
        Ok(())
    }
}

#[async_trait]
impl DeviceDatabase for JsonFileDatabase {
    async fn add_device(&self, record: &DeviceRecord) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut contents = self.load().await?;
        contents.add_device(record)?;
        self.save(&contents).await
    }

    async fn put_properties(&self, device: &str, properties: &Properties) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut contents = self.load().await?;
        contents.put_properties(device, properties)?;
        self.save(&contents).await
    }

    async fn device(&self, name: &str) -> Result<Option<DeviceRecord>> {
        Ok(self.load().await?.devices.get(name).cloned())
    }

    async fn properties(&self, device: &str) -> Result<Properties> {
        Ok(self
            .load()
            .await?
            .properties
            .get(device)
            .cloned()
            .unwrap_or_default())
    }
}

/// Validate the request and apply its plan. Returns the number of actions applied.
pub async fn apply(request: &ProvisioningRequest, db: &dyn DeviceDatabase) -> AppResult<usize> {
    request.validate()?;
    let plan = request.plan();
    for action in &plan {
        info!("{action}");
        let result = match action {
            ProvisioningAction::AddDevice(record) => db.add_device(record).await,
            ProvisioningAction::PutProperties { device, properties } => {
                db.put_properties(device, properties).await
            }
        };
        result.map_err(|e| DaqError::Provisioning(format!("{action}: {e:#}")))?;
    }
    Ok(plan.len())
}
