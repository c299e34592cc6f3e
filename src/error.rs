//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the entire crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the kinds of failure that can occur while configuring and polling the detector.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment`, typically file parsing or type mismatches
//!   in the configuration file or environment overrides.
//! - **`Configuration`**: Semantic errors in a configuration that parsed fine but is
//!   logically invalid (zero frames, malformed device name, repeated saving attribute).
//! - **`Sequence`**: A remote attribute write or command failed while arming the
//!   acquisition. The sequence is aborted at the failing step; nothing is retried.
//! - **`PollTransport`**: Reading the running flag or the last completed frame index
//!   kept failing past the configured retry ceiling.
//! - **`Readout`**: A single `ReadScalers`/`ReadHistogram` call failed and the session
//!   runs with the abort policy. Under the default policy these are only recorded.
//! - **`InvalidState`**: The frame poller was driven out of order.
//!
//! By using `#[from]`, `DaqError` can be created from the underlying error types,
//! simplifying error handling with the `?` operator.

use crate::acquisition::{PollerState, ReadoutKey, ReadoutKind};
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Failed to configure {device} at step '{step}': {source}")]
    Sequence {
        device: String,
        step: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Polling acquisition state failed {attempts} times in a row: {source}")]
    PollTransport {
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("{kind} readout failed for frame {} channel {}: {source}", key.frame, key.channel)]
    Readout {
        key: ReadoutKey,
        kind: ReadoutKind,
        #[source]
        source: anyhow::Error,
    },

    #[error("Frame poller is {found:?}, expected {expected:?}")]
    InvalidState {
        expected: PollerState,
        found: PollerState,
    },

    #[error("Device error: {0}")]
    Device(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Provisioning error: {0}")]
    Provisioning(String),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl DaqError {
    /// Whether the error left the remote services in a state that needs an operator reset.
    ///
    /// A failed configuration sequence leaves the services partially configured with
    /// acquisition not started; a fatal poll failure has already attempted a stop.
    pub fn requires_reset(&self) -> bool {
        matches!(self, DaqError::Sequence { .. } | DaqError::PollTransport { .. })
    }
}
