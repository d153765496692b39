//! Device lifecycle: connect, configure, telemetry, bias and acquisition sessions.
//!
//! ```text
//! Disconnected -> Connected -> Configured -> Acquiring -> Configured ... -> Disconnected
//! ```
//!
//! Every operation checks the current state and returns
//! [`DaqError::InvalidState`] when called out of order. The link is closed when
//! the session is dropped, so an early return anywhere in a caller still
//! releases the device.

use super::{decode_chip_id, CommStatus, Connector, ReadoutLink, TransportSession};
use crate::acquisition::SessionBuffers;
use crate::config::AcquisitionConfig;
use crate::error::{DaqError, DaqResult, LinkError, SessionStage, TelemetryQuery};
use crate::error_recovery::{retry, RetryPolicy};
use crate::pixel_config::PixelConfig;
use serde_json::json;
use std::fmt;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// ADC channel sampled by [`DeviceSession::telemetry`].
const TELEMETRY_ADC_CHANNEL: u8 = 0;

/// Lifecycle state of a [`DeviceSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// No link open
    Disconnected,
    /// Link open, no acquisition parameters pushed yet
    Connected,
    /// Parameters pushed, ready to acquire
    Configured,
    /// An acquisition session is open
    Acquiring,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceState::Disconnected => "disconnected",
            DeviceState::Connected => "connected",
            DeviceState::Configured => "configured",
            DeviceState::Acquiring => "acquiring",
        };
        f.write_str(name)
    }
}

/// Results of the diagnostic queries. Each query fails independently.
#[derive(Debug, Clone)]
pub struct Telemetry {
    /// Chip identifier, e.g. `D4-W0005`
    pub chip_id: Result<String, LinkError>,
    /// Link status
    pub comm_status: Result<CommStatus, LinkError>,
    /// Readout board temperature in °C
    pub readout_temp_c: Result<f32, LinkError>,
    /// Sensor temperature in °C
    pub sensor_temp_c: Result<f32, LinkError>,
    /// Digital self-test
    pub digital_test: Result<(), LinkError>,
    /// ADC channel 0 in volts
    pub adc_volts: Result<f32, LinkError>,
}

impl Telemetry {
    /// First failed query, in the order the queries are issued.
    pub fn first_failure(&self) -> Option<DaqError> {
        let failures = [
            (TelemetryQuery::ChipId, self.chip_id.as_ref().err()),
            (TelemetryQuery::CommStatus, self.comm_status.as_ref().err()),
            (
                TelemetryQuery::ReadoutTemperature,
                self.readout_temp_c.as_ref().err(),
            ),
            (
                TelemetryQuery::SensorTemperature,
                self.sensor_temp_c.as_ref().err(),
            ),
            (TelemetryQuery::DigitalTest, self.digital_test.as_ref().err()),
            (TelemetryQuery::AdcVoltage, self.adc_volts.as_ref().err()),
        ];
        failures.into_iter().find_map(|(query, err)| {
            err.map(|source| DaqError::Telemetry {
                query,
                source: source.clone(),
            })
        })
    }

    /// JSON view, failed queries rendered as `{"error": ...}`.
    pub fn to_json(&self) -> serde_json::Value {
        fn field<T: serde::Serialize>(value: &Result<T, LinkError>) -> serde_json::Value {
            match value {
                Ok(v) => json!(v),
                Err(e) => json!({ "error": e.to_string() }),
            }
        }
        json!({
            "chip_id": field(&self.chip_id),
            "comm_status": field(&self.comm_status),
            "readout_temp_c": field(&self.readout_temp_c),
            "sensor_temp_c": field(&self.sensor_temp_c),
            "digital_test_passed": self.digital_test.is_ok(),
            "adc_volts": field(&self.adc_volts),
        })
    }
}

/// Owns one device link and enforces its lifecycle.
pub struct DeviceSession<C: Connector> {
    connector: C,
    link: Option<C::Link>,
    state: DeviceState,
    address: Option<String>,
    connect_policy: RetryPolicy,
    bias_policy: RetryPolicy,
    config: Option<AcquisitionConfig>,
    pixel_config: Option<(Option<PathBuf>, PixelConfig)>,
}

impl<C: Connector> DeviceSession<C> {
    /// New disconnected session with the default retry policies.
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            link: None,
            state: DeviceState::Disconnected,
            address: None,
            connect_policy: RetryPolicy::connect(),
            bias_policy: RetryPolicy::bias(),
            config: None,
            pixel_config: None,
        }
    }

    /// Override the connect and bias retry policies.
    pub fn with_retry_policies(mut self, connect: RetryPolicy, bias: RetryPolicy) -> Self {
        self.connect_policy = connect;
        self.bias_policy = bias;
        self
    }

    /// Current lifecycle state.
    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// Address of the open link.
    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    /// Parameters pushed by the last successful [`configure`](Self::configure).
    pub fn config(&self) -> Option<&AcquisitionConfig> {
        self.config.as_ref()
    }

    fn require(&self, operation: &'static str, allowed: &[DeviceState]) -> DaqResult<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(DaqError::InvalidState {
                operation,
                state: self.state.to_string(),
            })
        }
    }

    fn link_mut(&mut self, operation: &'static str) -> DaqResult<&mut C::Link> {
        let state = self.state;
        self.link.as_mut().ok_or_else(|| DaqError::InvalidState {
            operation,
            state: state.to_string(),
        })
    }

    /// Open the link, retrying transient failures.
    pub fn connect(&mut self, address: &str) -> DaqResult<()> {
        self.require("connect", &[DeviceState::Disconnected])?;
        info!(address, attempts = self.connect_policy.attempts(), "Connecting to readout");

        let connector = &self.connector;
        let link = retry(&self.connect_policy, "connect", |attempt| {
            debug!(address, attempt, "Connection attempt");
            connector.connect(address)
        })
        .map_err(|failure| DaqError::Connection {
            address: address.to_string(),
            attempts: failure.attempts,
            source: failure.last_error,
        })?;

        self.link = Some(link);
        self.address = Some(address.to_string());
        self.state = DeviceState::Connected;
        info!(address, "Connected to readout");
        Ok(())
    }

    /// Validate parameters, load the pixel configuration and push both to the device.
    ///
    /// The pixel configuration file is only re-read when its path changes, so
    /// sweeps can reconfigure thresholds every step cheaply.
    pub fn configure(&mut self, config: &AcquisitionConfig) -> DaqResult<()> {
        self.require("configure", &[DeviceState::Connected, DeviceState::Configured])?;
        config.validate()?;

        let cached = matches!(&self.pixel_config, Some((path, _)) if *path == config.pixel_config);
        if !cached {
            let pixels = match &config.pixel_config {
                Some(path) => PixelConfig::load(path)?,
                None => {
                    warn!("No pixel configuration file set, sending all-zero configuration");
                    PixelConfig::uniform(0)
                }
            };
            self.pixel_config = Some((config.pixel_config.clone(), pixels));
        }

        let link = self.link.as_mut().ok_or_else(|| DaqError::InvalidState {
            operation: "configure",
            state: DeviceState::Disconnected.to_string(),
        })?;
        let pixels = match &self.pixel_config {
            Some((_, pixels)) => pixels,
            None => return Err(DaqError::Config("pixel configuration missing".into())),
        };
        link.configure(config, pixels)
            .map_err(|e| DaqError::Session {
                stage: SessionStage::Begin,
                message: format!("configuration rejected: {e}"),
            })?;

        debug!(
            vth_coarse = config.dacs.vthreshold_coarse,
            vth_fine = config.dacs.vthreshold_fine,
            frames = config.frames,
            frame_time_ns = config.frame_time_ns,
            "Device configured"
        );
        self.config = Some(config.clone());
        self.state = DeviceState::Configured;
        Ok(())
    }

    /// Run every diagnostic query. Individual failures are kept in the result.
    pub fn telemetry(&mut self) -> DaqResult<Telemetry> {
        self.require("telemetry", &[DeviceState::Connected, DeviceState::Configured])?;
        let link = self.link_mut("telemetry")?;

        let chip_id = link.chip_id_word().and_then(|word| {
            decode_chip_id(word)
                .ok_or_else(|| LinkError::Rejected(format!("invalid chip id word {word:#x}")))
        });
        let telemetry = Telemetry {
            chip_id,
            comm_status: link.comm_status(),
            readout_temp_c: link.readout_temperature(),
            sensor_temp_c: link.sensor_temperature(),
            digital_test: link.digital_test(),
            adc_volts: link.adc_voltage(TELEMETRY_ADC_CHANNEL),
        };

        if let Some(err) = telemetry.first_failure() {
            warn!(error = %err, "Telemetry incomplete");
        }
        Ok(telemetry)
    }

    /// Like [`telemetry`](Self::telemetry) but the first failed query is an error.
    pub fn telemetry_strict(&mut self) -> DaqResult<Telemetry> {
        let telemetry = self.telemetry()?;
        match telemetry.first_failure() {
            Some(err) => Err(err),
            None => Ok(telemetry),
        }
    }

    /// Apply a bias voltage, retrying while the supply settles.
    pub fn set_bias(&mut self, channel: u8, volts: f64) -> DaqResult<()> {
        self.require("set_bias", &[DeviceState::Connected, DeviceState::Configured])?;
        let policy = self.bias_policy.clone();
        let link = self.link_mut("set_bias")?;

        retry(&policy, "set_bias", |_| link.set_bias(channel, volts as f32)).map_err(
            |failure| DaqError::BiasSet {
                channel,
                volts,
                attempts: failure.attempts,
                source: failure.last_error,
            },
        )?;

        info!(channel, volts, "Bias applied");
        Ok(())
    }

    /// Open an acquisition session, hand it to `f`, and return to `Configured`
    /// afterwards whatever `f` returns.
    ///
    /// Finalizing the transport session is the responsibility of `f`.
    pub fn with_session<R>(
        &mut self,
        buffers: &SessionBuffers,
        f: impl FnOnce(&AcquisitionConfig, &mut dyn TransportSession) -> DaqResult<R>,
    ) -> DaqResult<R> {
        self.require("acquire", &[DeviceState::Configured])?;
        let config = self
            .config
            .clone()
            .ok_or_else(|| DaqError::Config("device has no configuration".into()))?;

        self.state = DeviceState::Acquiring;
        let result = match self.link.as_mut() {
            Some(link) => match link.open_session(buffers) {
                Ok(mut session) => f(&config, session.as_mut()),
                Err(e) => Err(DaqError::Session {
                    stage: SessionStage::Init,
                    message: e.to_string(),
                }),
            },
            None => Err(DaqError::InvalidState {
                operation: "acquire",
                state: DeviceState::Disconnected.to_string(),
            }),
        };
        self.state = DeviceState::Configured;
        result
    }

    /// Close the link. Safe to call in any state.
    pub fn disconnect(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.close();
            info!(address = self.address.as_deref().unwrap_or(""), "Disconnected from readout");
        }
        self.state = DeviceState::Disconnected;
        self.config = None;
    }
}

impl<C: Connector> Drop for DeviceSession<C> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{SimulatedReadout, SimulatorConfig};
    use std::time::Duration;

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            backoff_delay: Duration::ZERO,
        }
    }

    fn unconfigured_pixels() -> AcquisitionConfig {
        AcquisitionConfig {
            pixel_config: None,
            ..Default::default()
        }
    }

    #[test]
    fn connect_retries_transient_failures() {
        let readout = SimulatedReadout::new(SimulatorConfig {
            connect_failures: 2,
            ..Default::default()
        });
        let log = readout.log();
        let mut device = DeviceSession::new(readout).with_retry_policies(fast(), fast());

        device.connect("192.168.1.218").unwrap();
        assert_eq!(device.state(), DeviceState::Connected);
        assert_eq!(log.lock().connect_attempts, 3);
    }

    #[test]
    fn connect_exhaustion_is_connection_error() {
        let readout = SimulatedReadout::new(SimulatorConfig {
            connect_failures: 5,
            ..Default::default()
        });
        let mut device = DeviceSession::new(readout).with_retry_policies(fast(), fast());

        let err = device.connect("192.168.1.218").unwrap_err();
        assert!(matches!(err, DaqError::Connection { attempts: 3, .. }));
        assert_eq!(err.exit_code(), 6);
        assert_eq!(device.state(), DeviceState::Disconnected);
    }

    #[test]
    fn operations_enforce_lifecycle() {
        let mut device = DeviceSession::new(SimulatedReadout::default());
        assert!(matches!(
            device.configure(&unconfigured_pixels()),
            Err(DaqError::InvalidState { .. })
        ));

        device.connect("sim").unwrap();
        let err = device
            .with_session(&SessionBuffers::default(), |_, _| Ok(()))
            .unwrap_err();
        assert_eq!(err.exit_code(), 70);

        device.configure(&unconfigured_pixels()).unwrap();
        assert_eq!(device.state(), DeviceState::Configured);

        device.disconnect();
        assert_eq!(device.state(), DeviceState::Disconnected);
        assert!(device.telemetry().is_err());
    }

    #[test]
    fn missing_pixel_config_is_fatal() {
        let mut device = DeviceSession::new(SimulatedReadout::default());
        device.connect("sim").unwrap();
        let config = AcquisitionConfig {
            pixel_config: Some(PathBuf::from("/nonexistent/chipconfig.bmc")),
            ..Default::default()
        };
        let err = device.configure(&config).unwrap_err();
        assert_eq!(err.exit_code(), 1);
        assert_eq!(device.state(), DeviceState::Connected);
    }

    #[test]
    fn bias_exhaustion_is_fatal() {
        let readout = SimulatedReadout::new(SimulatorConfig {
            bias_failures: 10,
            ..Default::default()
        });
        let mut device = DeviceSession::new(readout).with_retry_policies(fast(), fast());
        device.connect("sim").unwrap();

        let err = device.set_bias(0, 155.0).unwrap_err();
        assert!(matches!(err, DaqError::BiasSet { attempts: 3, .. }));
        assert_eq!(err.exit_code(), 12);
    }

    #[test]
    fn bias_succeeds_after_settling() {
        let readout = SimulatedReadout::new(SimulatorConfig {
            bias_failures: 2,
            ..Default::default()
        });
        let log = readout.log();
        let mut device = DeviceSession::new(readout).with_retry_policies(fast(), fast());
        device.connect("sim").unwrap();

        device.set_bias(0, 90.0).unwrap();
        assert_eq!(log.lock().bias_history, vec![(0, 90.0)]);
    }

    #[test]
    fn telemetry_failures_are_reported_per_query() {
        let readout = SimulatedReadout::new(SimulatorConfig {
            failing_queries: vec![TelemetryQuery::SensorTemperature],
            ..Default::default()
        });
        let mut device = DeviceSession::new(readout);
        device.connect("sim").unwrap();

        let telemetry = device.telemetry().unwrap();
        assert_eq!(telemetry.chip_id.as_deref(), Ok("D4-W0005"));
        assert!(telemetry.readout_temp_c.is_ok());
        assert!(telemetry.sensor_temp_c.is_err());

        let err = device.telemetry_strict().unwrap_err();
        assert_eq!(err.exit_code(), 9);
    }

    #[test]
    fn drop_closes_link() {
        let readout = SimulatedReadout::default();
        let log = readout.log();
        {
            let mut device = DeviceSession::new(readout);
            device.connect("sim").unwrap();
        }
        assert_eq!(log.lock().links_closed, 1);
    }
}
