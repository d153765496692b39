//! # Timepix3 Acquisition Library
//!
//! This crate drives a Timepix3 sensor behind a network readout: it connects to
//! the readout, pushes acquisition parameters and the per-pixel configuration,
//! streams pixel hits from a producer thread into per-pixel counters and an
//! appendable store, and sweeps the discrimination threshold or the sensor bias
//! across a range for calibration runs.
//!
//! ## Crate Structure
//!
//! - **`hardware`**: transport traits (`Connector`, `ReadoutLink`,
//!   `TransportSession`), the `DeviceSession` lifecycle and a simulated readout.
//! - **`acquisition`**: `AcquisitionDriver`, which runs one bounded session and
//!   finalizes it on every path.
//! - **`aggregator`**: `HitAggregator`, the frame handler that maintains running
//!   pixel counters and writes hit rows.
//! - **`storage`**: the `HitStore` trait with in-memory and HDF5 backends.
//! - **`sweep`**: closed-form sweep ranges, threshold quantization and the
//!   `SweepController`.
//! - **`pixel_config`**: `.bmc`/`.bpc` pixel configuration loading and packing.
//! - **`config`**: layered configuration (defaults, TOML, environment).
//! - **`error`** and **`error_recovery`**: the `DaqError` taxonomy with process
//!   exit codes, and bounded retry of transient device failures.
//! - **`logging`**: `tracing-subscriber` initialization.

pub mod acquisition;
pub mod aggregator;
pub mod config;
pub mod error;
pub mod error_recovery;
pub mod hardware;
pub mod logging;
pub mod pixel_config;
pub mod storage;
pub mod sweep;

pub use error::{DaqError, DaqResult};
