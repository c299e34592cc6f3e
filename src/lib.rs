//! # Xspress3 DAQ Core Library
//!
//! Acquisition control for an Xspress3 X-ray detector driven through a LimaCCDs
//! acquisition server. Both are remote device servers reached by name; this crate
//! arms them in a fixed order, starts the acquisition, and drains the per-frame,
//! per-channel scaler statistics and histograms as frames complete.
//!
//! ## Crate Structure
//!
//! - **`acquisition`**: Domain types (`ScalerRecord`, `Histogram`, `FrameReadout`), the
//!   configuration sequencer, the frame poller state machine and readout sinks.
//! - **`config`**: Figment-based configuration loading and validation. See
//!   `config::AcquisitionConfig`.
//! - **`error`**: The `DaqError` enum for centralized error handling.
//! - **`hardware`**: Capability traits for the two device servers, typed drivers
//!   (`LimaCcd`, `Xspress3`) and a simulated system for tests and dry runs.
//! - **`logging`**: `tracing-subscriber` initialisation.
//! - **`provisioning`**: One-time device registration and default properties.
//! - **`session`**: `AcquisitionSession`, which wires the pieces into one run.
//! - **`validation`**: Small validators shared by config and provisioning.

pub mod acquisition;
pub mod config;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod provisioning;
pub mod session;
pub mod validation;

pub use error::{AppResult, DaqError};
