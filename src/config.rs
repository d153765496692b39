//! Configuration system using Figment.
//!
//! Configuration is layered, later sources overriding earlier ones:
//! 1. Built-in defaults (the values the bench setup has been running with)
//! 2. `config/tpx_daq.toml` or the file passed with `--config`
//! 3. Environment variables prefixed with `TPX_DAQ_`, nested keys separated by `__`
//!    (e.g. `TPX_DAQ_ACQUISITION__BIAS_VOLTS=120`)
//! 4. Command-line overrides applied by the binary
//!
//! # Example
//! ```no_run
//! use tpx_daq::config::AppConfig;
//!
//! let config = AppConfig::load_from(None)?;
//! config.validate()?;
//! println!("Device at {}", config.device.address);
//! # Ok::<(), tpx_daq::error::DaqError>(())
//! ```

use crate::acquisition::SessionBuffers;
use crate::error::{DaqError, DaqResult};
use crate::error_recovery::RetryPolicy;
use crate::logging::LoggingConfig;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/tpx_daq.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Readout network settings
    pub device: DeviceSettings,
    /// Acquisition parameters pushed to the device on configure
    pub acquisition: AcquisitionConfig,
    /// Session resource sizing
    pub session: SessionBuffers,
    /// Threshold and bias sweep settings
    pub sweep: SweepSettings,
    /// Output store settings
    pub storage: StorageConfig,
    /// Logging settings
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load defaults, then the given TOML file (or [`DEFAULT_CONFIG_PATH`] when it
    /// exists), then `TPX_DAQ_` environment variables.
    pub fn load_from(path: Option<&Path>) -> DaqResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));
        match path {
            Some(path) => {
                if !path.exists() {
                    return Err(DaqError::Config(format!(
                        "configuration file '{}' not found",
                        path.display()
                    )));
                }
                figment = figment.merge(Toml::file(path));
            }
            None => figment = figment.merge(Toml::file(DEFAULT_CONFIG_PATH)),
        }
        let config: AppConfig = figment
            .merge(Env::prefixed("TPX_DAQ_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> DaqResult<()> {
        self.device.validate()?;
        self.acquisition.validate()?;
        self.session.validate()?;
        self.sweep.validate()?;
        self.logging.validate()?;
        Ok(())
    }
}

/// Readout network settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    /// Readout IP address
    pub address: String,
    /// UDP control port
    pub control_port: u16,
    /// UDP data port
    pub data_port: u16,
    /// Connection retry policy
    pub connect_retry: RetryPolicy,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            address: "192.168.1.218".to_string(),
            control_port: 1555,
            data_port: 1556,
            connect_retry: RetryPolicy::connect(),
        }
    }
}

impl DeviceSettings {
    fn validate(&self) -> DaqResult<()> {
        if self.address.trim().is_empty() {
            return Err(DaqError::Config("device address must not be empty".into()));
        }
        if self.control_port == self.data_port {
            return Err(DaqError::Config(format!(
                "control and data port must differ (both {})",
                self.control_port
            )));
        }
        Ok(())
    }
}

/// Readout ordering of pixel data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ReadoutMode {
    /// Whole frame read after the shutter closes.
    Sequential,
    /// Hits streamed as they occur.
    DataDriven,
}

/// Per-hit measurement mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionMode {
    /// Time of arrival and time over threshold.
    ToaTot,
    /// Time of arrival only.
    OnlyToa,
    /// Event count and integrated time over threshold.
    EventItot,
}

impl AcquisitionMode {
    /// Numeric mode code used by the device (0, 1, 2).
    pub fn code(self) -> u8 {
        match self {
            AcquisitionMode::ToaTot => 0,
            AcquisitionMode::OnlyToa => 1,
            AcquisitionMode::EventItot => 2,
        }
    }
}

/// Readout clock frequency. Serialized as the integer MHz value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum ClockFrequency {
    /// 40 MHz
    Mhz40,
    /// 80 MHz
    Mhz80,
    /// 160 MHz
    Mhz160,
}

impl ClockFrequency {
    /// Frequency in MHz.
    pub fn mhz(self) -> u32 {
        match self {
            ClockFrequency::Mhz40 => 40,
            ClockFrequency::Mhz80 => 80,
            ClockFrequency::Mhz160 => 160,
        }
    }
}

impl TryFrom<u32> for ClockFrequency {
    type Error = String;

    fn try_from(mhz: u32) -> Result<Self, Self::Error> {
        match mhz {
            40 => Ok(ClockFrequency::Mhz40),
            80 => Ok(ClockFrequency::Mhz80),
            160 => Ok(ClockFrequency::Mhz160),
            other => Err(format!(
                "invalid clock frequency {other} MHz, expected 40, 80 or 160"
            )),
        }
    }
}

impl From<ClockFrequency> for u32 {
    fn from(freq: ClockFrequency) -> Self {
        freq.mhz()
    }
}

/// Collected charge carrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    /// Hole collection (positive bias).
    Holes,
    /// Electron collection.
    Electrons,
}

/// Readout clock phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// 1 phase
    Phase1,
    /// 2 phases
    Phase2,
    /// 4 phases
    Phase4,
    /// 8 phases
    Phase8,
    /// 16 phases
    Phase16,
}

/// External trigger input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Trigger {
    /// Trigger enabled
    pub enabled: bool,
    /// Input channel
    pub channel: u8,
    /// Trigger on the falling edge instead of the rising edge
    pub use_falling_edge: bool,
}

/// Timepix3 DAC table.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Dacs {
    pub ibias_preamp_on: u16,
    pub ibias_preamp_off: u16,
    pub vpreamp_ncas: u16,
    pub ibias_ikrum: u16,
    pub vfbk: u16,
    pub vthreshold_fine: u16,
    pub vthreshold_coarse: u16,
    pub ibias_discs1_on: u16,
    pub ibias_discs1_off: u16,
    pub ibias_discs2_on: u16,
    pub ibias_discs2_off: u16,
    pub ibias_pixeldac: u16,
    pub ibias_tpbufferin: u16,
    pub ibias_tpbufferout: u16,
    pub vtp_coarse: u16,
    pub vtp_fine: u16,
    pub ibias_cp_pll: u16,
    pub pll_vcntrl: u16,
}

impl Default for Dacs {
    fn default() -> Self {
        Self {
            ibias_preamp_on: 128,
            ibias_preamp_off: 8,
            vpreamp_ncas: 128,
            ibias_ikrum: 15,
            vfbk: 164,
            vthreshold_fine: 442,
            vthreshold_coarse: 7,
            ibias_discs1_on: 100,
            ibias_discs1_off: 8,
            ibias_discs2_on: 128,
            ibias_discs2_off: 8,
            ibias_pixeldac: 100,
            ibias_tpbufferin: 128,
            ibias_tpbufferout: 128,
            vtp_coarse: 128,
            vtp_fine: 256,
            ibias_cp_pll: 128,
            pll_vcntrl: 128,
        }
    }
}

impl Dacs {
    /// Largest fine threshold code.
    pub const MAX_THRESHOLD_FINE: u16 = 511;
    /// Largest coarse threshold code.
    pub const MAX_THRESHOLD_COARSE: u16 = 15;

    /// DAC values in device order.
    pub fn to_array(&self) -> [u16; 18] {
        [
            self.ibias_preamp_on,
            self.ibias_preamp_off,
            self.vpreamp_ncas,
            self.ibias_ikrum,
            self.vfbk,
            self.vthreshold_fine,
            self.vthreshold_coarse,
            self.ibias_discs1_on,
            self.ibias_discs1_off,
            self.ibias_discs2_on,
            self.ibias_discs2_off,
            self.ibias_pixeldac,
            self.ibias_tpbufferin,
            self.ibias_tpbufferout,
            self.vtp_coarse,
            self.vtp_fine,
            self.ibias_cp_pll,
            self.pll_vcntrl,
        ]
    }

    /// Check every DAC against its bit width.
    pub fn validate(&self) -> DaqResult<()> {
        let limits: [(&str, u16, u16); 18] = [
            ("ibias_preamp_on", self.ibias_preamp_on, 255),
            ("ibias_preamp_off", self.ibias_preamp_off, 15),
            ("vpreamp_ncas", self.vpreamp_ncas, 255),
            ("ibias_ikrum", self.ibias_ikrum, 255),
            ("vfbk", self.vfbk, 255),
            ("vthreshold_fine", self.vthreshold_fine, Self::MAX_THRESHOLD_FINE),
            ("vthreshold_coarse", self.vthreshold_coarse, Self::MAX_THRESHOLD_COARSE),
            ("ibias_discs1_on", self.ibias_discs1_on, 255),
            ("ibias_discs1_off", self.ibias_discs1_off, 15),
            ("ibias_discs2_on", self.ibias_discs2_on, 255),
            ("ibias_discs2_off", self.ibias_discs2_off, 15),
            ("ibias_pixeldac", self.ibias_pixeldac, 255),
            ("ibias_tpbufferin", self.ibias_tpbufferin, 255),
            ("ibias_tpbufferout", self.ibias_tpbufferout, 255),
            ("vtp_coarse", self.vtp_coarse, 255),
            ("vtp_fine", self.vtp_fine, 511),
            ("ibias_cp_pll", self.ibias_cp_pll, 255),
            ("pll_vcntrl", self.pll_vcntrl, 255),
        ];
        for (name, value, max) in limits {
            if value > max {
                return Err(DaqError::Config(format!(
                    "DAC {name} = {value} exceeds maximum {max}"
                )));
            }
        }
        Ok(())
    }
}

/// Parameters pushed to the device by `configure`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Bias supply channel
    pub bias_channel: u8,
    /// Sensor bias in volts
    pub bias_volts: f64,
    /// Frames per acquisition session
    pub frames: u32,
    /// Frame duration in nanoseconds
    pub frame_time_ns: f64,
    /// Collected charge carrier
    pub polarity: Polarity,
    /// Readout clock
    pub clock: ClockFrequency,
    /// Readout clock phase
    pub phase: Phase,
    /// Disable gray-coded ToA
    pub gray_disable: bool,
    /// Delay the shutter until the start trigger
    pub delayed_start: bool,
    /// Start trigger
    pub start_trigger: Trigger,
    /// Stop trigger
    pub stop_trigger: Trigger,
    /// Per-hit measurement mode
    pub mode: AcquisitionMode,
    /// Readout ordering
    pub readout: ReadoutMode,
    /// Fast VCO for the ToA clock
    pub fast_vco: bool,
    /// Decode raw measurement data into pixel events on the readout host
    pub decode_data: bool,
    /// Pixel configuration file (.bmc or .bpc). `None` sends an all-zero configuration.
    pub pixel_config: Option<PathBuf>,
    /// DAC table, including the threshold codes
    pub dacs: Dacs,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            bias_channel: 0,
            bias_volts: 155.0,
            frames: 1,
            frame_time_ns: 1e10,
            polarity: Polarity::Holes,
            clock: ClockFrequency::Mhz40,
            phase: Phase::Phase1,
            gray_disable: true,
            delayed_start: false,
            start_trigger: Trigger::default(),
            stop_trigger: Trigger::default(),
            mode: AcquisitionMode::ToaTot,
            readout: ReadoutMode::DataDriven,
            fast_vco: true,
            decode_data: true,
            pixel_config: Some(PathBuf::from("chipconfig_D4-W0005.bmc")),
            dacs: Dacs::default(),
        }
    }
}

impl AcquisitionConfig {
    /// Frame duration as a `Duration`.
    pub fn frame_time(&self) -> Duration {
        Duration::from_nanos(self.frame_time_ns.max(0.0) as u64)
    }

    /// Validate numeric ranges.
    pub fn validate(&self) -> DaqResult<()> {
        if self.frames == 0 {
            return Err(DaqError::Config("frames must be at least 1".into()));
        }
        if !self.frame_time_ns.is_finite() || self.frame_time_ns <= 0.0 {
            return Err(DaqError::Config(format!(
                "frame_time_ns must be positive, got {}",
                self.frame_time_ns
            )));
        }
        if !self.bias_volts.is_finite() {
            return Err(DaqError::Config("bias_volts must be finite".into()));
        }
        self.dacs.validate()
    }
}

/// How a threshold sweep is expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdUnit {
    /// Engineering units, quantized into coarse and fine codes per step.
    Millivolts,
    /// Raw fine DAC code with a fixed coarse code.
    FineCode,
}

/// Inclusive band of sweep targets that is skipped.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SkipBand {
    /// Lower edge, inclusive
    pub from: f64,
    /// Upper edge, inclusive
    pub to: f64,
}

impl SkipBand {
    /// Whether `value` falls inside the band.
    pub fn contains(&self, value: f64) -> bool {
        value >= self.from && value <= self.to
    }
}

/// Threshold sweep settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdSweepSettings {
    /// Sweep unit
    pub unit: ThresholdUnit,
    /// First target
    pub start: f64,
    /// Last target (inclusive when reached by whole steps)
    pub end: f64,
    /// Step size
    pub step: f64,
    /// Coarse code held fixed in `fine_code` mode
    pub coarse: u16,
    /// Threshold bands to skip, always in mV. In `fine_code` mode each code is
    /// converted with the fixed coarse code before the comparison.
    pub skip: Vec<SkipBand>,
}

impl Default for ThresholdSweepSettings {
    fn default() -> Self {
        Self {
            unit: ThresholdUnit::Millivolts,
            start: 0.0,
            end: 500.0,
            step: 5.0,
            coarse: 10,
            skip: vec![SkipBand {
                from: 800.0,
                to: 840.0,
            }],
        }
    }
}

/// Bias sweep settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BiasSweepSettings {
    /// First bias in volts
    pub start: f64,
    /// Last bias in volts
    pub end: f64,
    /// Step in volts
    pub step: f64,
    /// Bias supply channel
    pub channel: u8,
    /// Voltage bands to skip
    pub skip: Vec<SkipBand>,
}

impl Default for BiasSweepSettings {
    fn default() -> Self {
        Self {
            start: 80.0,
            end: 100.0,
            step: 5.0,
            channel: 0,
            skip: Vec::new(),
        }
    }
}

/// When the running per-pixel counters return to zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterScope {
    /// At the start of every acquisition session.
    Session,
    /// At the start of every sweep step, spanning all frames of the step.
    SweepStep,
}

/// Sweep controller settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepSettings {
    /// Acquisition sessions per sweep step
    pub frames_per_step: u32,
    /// Frame duration used during sweeps, in nanoseconds
    pub frame_time_ns: f64,
    /// Delay after applying a threshold and between frames
    #[serde(with = "humantime_serde")]
    pub settle_delay: Duration,
    /// Delay after applying a bias voltage
    #[serde(with = "humantime_serde")]
    pub bias_settle_delay: Duration,
    /// Counter reset boundary
    pub counter_scope: CounterScope,
    /// Consecutive failed steps tolerated before the sweep aborts
    pub max_consecutive_failures: u32,
    /// Record temperatures on every step group
    pub telemetry_per_step: bool,
    /// Bias retry policy
    pub bias_retry: RetryPolicy,
    /// Threshold sweep range
    pub threshold: ThresholdSweepSettings,
    /// Bias sweep range
    pub bias: BiasSweepSettings,
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            frames_per_step: 1,
            frame_time_ns: 1e8,
            settle_delay: Duration::from_millis(100),
            bias_settle_delay: Duration::from_secs(1),
            counter_scope: CounterScope::Session,
            max_consecutive_failures: 3,
            telemetry_per_step: true,
            bias_retry: RetryPolicy::bias(),
            threshold: ThresholdSweepSettings::default(),
            bias: BiasSweepSettings::default(),
        }
    }
}

impl SweepSettings {
    fn validate(&self) -> DaqResult<()> {
        if self.frames_per_step == 0 {
            return Err(DaqError::Config("frames_per_step must be at least 1".into()));
        }
        if !self.frame_time_ns.is_finite() || self.frame_time_ns <= 0.0 {
            return Err(DaqError::Config("sweep frame_time_ns must be positive".into()));
        }
        if self.threshold.coarse > Dacs::MAX_THRESHOLD_COARSE {
            return Err(DaqError::Config(format!(
                "threshold coarse code {} exceeds {}",
                self.threshold.coarse,
                Dacs::MAX_THRESHOLD_COARSE
            )));
        }
        for band in self.threshold.skip.iter().chain(&self.bias.skip) {
            if band.from > band.to {
                return Err(DaqError::Config(format!(
                    "skip band [{}, {}] is inverted",
                    band.from, band.to
                )));
            }
        }
        Ok(())
    }
}

/// Output store backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// HDF5 file (requires the `storage_hdf5` feature)
    Hdf5,
    /// Keep rows in memory and report counts only
    Memory,
}

/// Storage backend configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend
    pub backend: StorageBackend,
    /// Output directory for data files
    pub output_dir: PathBuf,
    /// Explicit file name; a timestamped name is generated when unset
    pub file_name: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Hdf5,
            output_dir: PathBuf::from("."),
            file_name: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.acquisition.dacs.to_array()[5], 442);
        assert_eq!(config.acquisition.dacs.to_array()[6], 7);
        assert_eq!(config.device.connect_retry.max_attempts, 3);
    }

    #[test]
    fn test_invalid_clock_is_config_error() {
        assert!(ClockFrequency::try_from(20).is_err());
        assert_eq!(ClockFrequency::try_from(160), Ok(ClockFrequency::Mhz160));

        let parsed: Result<AcquisitionConfig, _> = toml::from_str("clock = 20");
        assert!(parsed.is_err());
    }

    #[test]
    fn test_acquisition_mode_codes() {
        let codes: Vec<u8> = [
            AcquisitionMode::ToaTot,
            AcquisitionMode::OnlyToa,
            AcquisitionMode::EventItot,
        ]
        .into_iter()
        .map(AcquisitionMode::code)
        .collect();
        assert_eq!(codes, vec![0, 1, 2]);
    }

    #[test]
    fn test_dac_limits() {
        let mut dacs = Dacs::default();
        assert!(dacs.validate().is_ok());
        dacs.vthreshold_coarse = 16;
        assert!(dacs.validate().is_err());
        dacs.vthreshold_coarse = 15;
        dacs.vthreshold_fine = 512;
        assert!(dacs.validate().is_err());
    }

    #[test]
    fn test_zero_frames_rejected() {
        let mut config = AppConfig::default();
        config.acquisition.frames = 0;
        assert!(matches!(config.validate(), Err(DaqError::Config(_))));
    }

    #[test]
    #[serial]
    fn test_file_and_env_layering() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tpx_daq.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
[device]
address = "10.0.0.5"

[acquisition]
bias_volts = 120.0
clock = 80
mode = "event_itot"

[sweep]
settle_delay = "250ms"

[sweep.threshold]
unit = "fine_code"
start = 0
end = 500
step = 5
skip = []
"#
        )
        .unwrap();

        std::env::set_var("TPX_DAQ_ACQUISITION__FRAMES", "4");
        let config = AppConfig::load_from(Some(&path));
        std::env::remove_var("TPX_DAQ_ACQUISITION__FRAMES");
        let config = config.unwrap();

        assert_eq!(config.device.address, "10.0.0.5");
        assert_eq!(config.device.control_port, 1555);
        assert_eq!(config.acquisition.bias_volts, 120.0);
        assert_eq!(config.acquisition.clock, ClockFrequency::Mhz80);
        assert_eq!(config.acquisition.mode, AcquisitionMode::EventItot);
        assert_eq!(config.acquisition.frames, 4);
        assert_eq!(config.sweep.settle_delay, Duration::from_millis(250));
        assert_eq!(config.sweep.threshold.unit, ThresholdUnit::FineCode);
        assert!(config.sweep.threshold.skip.is_empty());
        assert_eq!(config.acquisition.dacs.vfbk, 164);
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let err = AppConfig::load_from(Some(Path::new("/nonexistent/tpx.toml"))).unwrap_err();
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_skip_band_contains_edges() {
        let band = SkipBand {
            from: 800.0,
            to: 840.0,
        };
        assert!(band.contains(800.0));
        assert!(band.contains(840.0));
        assert!(!band.contains(845.0));
    }
}
