//! Error types for the acquisition pipeline.
//!
//! `DaqError` is the single error type returned by the library. Variants are
//! grouped by how the caller is expected to react:
//!
//! - **`Connection`** / **`BiasSet`**: a device operation kept failing. Transport
//!   errors are classified by [`LinkError::is_transient`], retried locally by
//!   [`crate::error_recovery`] and land here once the attempt budget is spent.
//! - **`Config`** / **`PixelConfig`** / **`Figment`**: the run cannot start. Missing or
//!   malformed calibration files and out-of-range enumerated parameters land here.
//! - **`Session`**: init, begin or read failure on the transport. A sweep treats this as
//!   a step failure, a single acquisition treats it as fatal.
//! - **`Telemetry`**: one diagnostic query failed. Fatal for diagnostic commands,
//!   logged and ignored inside sweeps.
//! - **`Indexing`**: a sweep-result slot fell outside the preallocated table.
//! - **`Storage`** / **`Io`**: the output store could not be written.
//!
//! Out-of-range pixel coordinates are not errors at all: the aggregator logs them
//! and drops the event.
//!
//! Every variant maps to a distinct process exit code through [`DaqError::exit_code`],
//! so an operator can tell the failure class apart without reading logs.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias for results using the library error type.
pub type DaqResult<T> = std::result::Result<T, DaqError>;

/// Stage of an acquisition session at which the transport failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStage {
    /// Resource allocation before the session is armed.
    Init,
    /// Arming the session with a configuration.
    Begin,
    /// Blocking drain of the event stream.
    Read,
}

impl fmt::Display for SessionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStage::Init => write!(f, "init"),
            SessionStage::Begin => write!(f, "begin"),
            SessionStage::Read => write!(f, "read"),
        }
    }
}

/// Individual telemetry query, used to report which diagnostic failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryQuery {
    /// Chip identifier string.
    ChipId,
    /// Communication link status.
    CommStatus,
    /// Readout board temperature.
    ReadoutTemperature,
    /// Sensor temperature.
    SensorTemperature,
    /// Digital self-test.
    DigitalTest,
    /// ADC voltage sample.
    AdcVoltage,
}

impl fmt::Display for TelemetryQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TelemetryQuery::ChipId => "chip id",
            TelemetryQuery::CommStatus => "comm status",
            TelemetryQuery::ReadoutTemperature => "readout temperature",
            TelemetryQuery::SensorTemperature => "sensor temperature",
            TelemetryQuery::DigitalTest => "digital test",
            TelemetryQuery::AdcVoltage => "adc voltage",
        };
        f.write_str(name)
    }
}

/// Errors reported by a device transport.
///
/// Transports only classify failures; [`crate::hardware::DeviceSession`] attaches the
/// operation context and converts them into [`DaqError`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// The device did not answer within the transport timeout.
    #[error("device did not respond within {timeout_ms} ms")]
    Timeout {
        /// Timeout that elapsed.
        timeout_ms: u64,
    },

    /// The device is reachable but not ready to accept the command yet.
    #[error("device not ready: {0}")]
    NotReady(String),

    /// The device rejected the command or its parameters.
    #[error("device rejected command: {0}")]
    Rejected(String),

    /// The link itself is gone.
    #[error("link closed: {0}")]
    Closed(String),
}

impl LinkError {
    /// Whether repeating the same command may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, LinkError::Timeout { .. } | LinkError::NotReady(_))
    }
}

/// Library error type.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Semantically invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration sources could not be merged or parsed.
    #[error("Failed to load configuration: {0}")]
    Figment(#[from] Box<figment::Error>),

    /// Per-pixel configuration file missing or malformed.
    #[error("Pixel configuration '{path}' could not be loaded: {message}")]
    PixelConfig {
        /// File that was requested.
        path: PathBuf,
        /// Reason.
        message: String,
    },

    /// Connection attempts exhausted.
    #[error("Failed to connect to {address} after {attempts} attempts: {source}")]
    Connection {
        /// Device address.
        address: String,
        /// Attempts made.
        attempts: u32,
        /// Last transport failure.
        #[source]
        source: LinkError,
    },

    /// Acquisition session failure.
    #[error("Acquisition session {stage} failed: {message}")]
    Session {
        /// Stage at which the session failed.
        stage: SessionStage,
        /// Reason.
        message: String,
    },

    /// Telemetry query failure.
    #[error("Telemetry query '{query}' failed: {source}")]
    Telemetry {
        /// Query that failed.
        query: TelemetryQuery,
        /// Transport failure.
        #[source]
        source: LinkError,
    },

    /// Bias could not be applied within the retry budget.
    #[error("Failed to set bias to {volts} V on channel {channel} after {attempts} attempts: {source}")]
    BiasSet {
        /// Bias channel.
        channel: u8,
        /// Requested voltage.
        volts: f64,
        /// Attempts made.
        attempts: u32,
        /// Last transport failure.
        #[source]
        source: LinkError,
    },

    /// Sweep-result slot outside the preallocated table.
    #[error("Sweep index {index} exceeds preallocated table of {capacity} rows")]
    Indexing {
        /// Offending slot.
        index: usize,
        /// Preallocated row count.
        capacity: usize,
    },

    /// Output store failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Device operation called in the wrong lifecycle state.
    #[error("Operation '{operation}' not allowed while device is {state}")]
    InvalidState {
        /// Operation attempted.
        operation: &'static str,
        /// Current state.
        state: String,
    },

    /// Operator requested abort.
    #[error("Acquisition aborted by operator")]
    Aborted,

    /// Standard I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Figment(Box::new(err))
    }
}

#[cfg(feature = "storage_hdf5")]
impl From<hdf5::Error> for DaqError {
    fn from(err: hdf5::Error) -> Self {
        DaqError::Storage(err.to_string())
    }
}

impl DaqError {
    /// Whether a sweep may continue with the next step after this error.
    ///
    /// Only session-level failures are step-local. Everything else either
    /// invalidates the remaining data or indicates the output is unusable.
    pub fn is_step_local(&self) -> bool {
        matches!(self, DaqError::Session { .. })
    }

    /// Process exit code for this error.
    ///
    /// | Code | Condition |
    /// |------|-----------|
    /// | 1 | configuration or pixel configuration load |
    /// | 2 | chip id query |
    /// | 3 | session init |
    /// | 4 | session begin |
    /// | 5 | session read |
    /// | 6 | connection exhausted |
    /// | 7 | output store |
    /// | 8 | comm status query |
    /// | 9 | sensor temperature query |
    /// | 10 | digital self-test |
    /// | 11 | ADC voltage query |
    /// | 12 | bias set exhausted |
    /// | 13 | readout temperature query |
    /// | 14 | sweep indexing |
    /// | 15 | operator abort |
    /// | 70 | device used in the wrong state |
    pub fn exit_code(&self) -> i32 {
        match self {
            DaqError::Config(_) | DaqError::Figment(_) | DaqError::PixelConfig { .. } => 1,
            DaqError::Telemetry { query, .. } => match query {
                TelemetryQuery::ChipId => 2,
                TelemetryQuery::CommStatus => 8,
                TelemetryQuery::SensorTemperature => 9,
                TelemetryQuery::DigitalTest => 10,
                TelemetryQuery::AdcVoltage => 11,
                TelemetryQuery::ReadoutTemperature => 13,
            },
            DaqError::Session { stage, .. } => match stage {
                SessionStage::Init => 3,
                SessionStage::Begin => 4,
                SessionStage::Read => 5,
            },
            DaqError::Connection { .. } => 6,
            DaqError::Storage(_) | DaqError::Io(_) => 7,
            DaqError::BiasSet { .. } => 12,
            DaqError::Indexing { .. } => 14,
            DaqError::Aborted => 15,
            DaqError::InvalidState { .. } => 70,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct_per_failure_class() {
        let errors = vec![
            DaqError::Config("bad".into()),
            DaqError::Telemetry {
                query: TelemetryQuery::ChipId,
                source: LinkError::NotReady("x".into()),
            },
            DaqError::Session {
                stage: SessionStage::Init,
                message: String::new(),
            },
            DaqError::Session {
                stage: SessionStage::Begin,
                message: String::new(),
            },
            DaqError::Session {
                stage: SessionStage::Read,
                message: String::new(),
            },
            DaqError::Connection {
                address: "192.168.1.218".into(),
                attempts: 3,
                source: LinkError::Timeout { timeout_ms: 1000 },
            },
            DaqError::Storage("disk full".into()),
            DaqError::Telemetry {
                query: TelemetryQuery::CommStatus,
                source: LinkError::Closed("x".into()),
            },
            DaqError::Telemetry {
                query: TelemetryQuery::SensorTemperature,
                source: LinkError::Closed("x".into()),
            },
            DaqError::Telemetry {
                query: TelemetryQuery::DigitalTest,
                source: LinkError::Closed("x".into()),
            },
            DaqError::Telemetry {
                query: TelemetryQuery::AdcVoltage,
                source: LinkError::Closed("x".into()),
            },
            DaqError::BiasSet {
                channel: 0,
                volts: 155.0,
                attempts: 3,
                source: LinkError::NotReady("settling".into()),
            },
            DaqError::Telemetry {
                query: TelemetryQuery::ReadoutTemperature,
                source: LinkError::Closed("x".into()),
            },
            DaqError::Indexing {
                index: 3,
                capacity: 3,
            },
            DaqError::Aborted,
        ];

        let codes: Vec<i32> = errors.iter().map(DaqError::exit_code).collect();
        assert_eq!(codes, (1..=15).collect::<Vec<_>>());
    }

    #[test]
    fn transient_classification() {
        assert!(LinkError::Timeout { timeout_ms: 10 }.is_transient());
        assert!(LinkError::NotReady("busy".into()).is_transient());
        assert!(!LinkError::Rejected("bad dac".into()).is_transient());
        assert!(!LinkError::Closed("gone".into()).is_transient());
    }

    #[test]
    fn only_session_errors_are_step_local() {
        let session = DaqError::Session {
            stage: SessionStage::Read,
            message: "timeout".into(),
        };
        assert!(session.is_step_local());
        assert!(!DaqError::Indexing {
            index: 0,
            capacity: 0
        }
        .is_step_local());
    }

    #[test]
    fn error_display() {
        let err = DaqError::Session {
            stage: SessionStage::Begin,
            message: "device refused".into(),
        };
        assert_eq!(
            err.to_string(),
            "Acquisition session begin failed: device refused"
        );
    }
}
