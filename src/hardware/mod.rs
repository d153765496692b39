//! Readout hardware abstractions.
//!
//! The readout is reached through three traits:
//!
//! - [`Connector`] opens a link to a device address. Connecting may fail
//!   transiently while the board boots.
//! - [`ReadoutLink`] is one open device: telemetry, bias, configuration, and
//!   acquisition sessions.
//! - [`TransportSession`] runs one bounded acquisition and delivers its
//!   notifications to a [`FrameHandler`] from a producer thread.
//!
//! [`DeviceSession`] wraps a connector and enforces the device lifecycle.
//! [`mock`] provides a simulated readout for tests and dry runs.

pub mod mock;
pub mod session;

pub use session::{DeviceSession, DeviceState, Telemetry};

use crate::acquisition::{FrameHandler, SessionBuffers};
use crate::config::{AcquisitionConfig, AcquisitionMode, ReadoutMode};
use crate::error::LinkError;
use crate::pixel_config::PixelConfig;
use serde::Serialize;
use std::fmt;

/// Sensor width in pixels.
pub const SENSOR_WIDTH: u16 = 256;

/// Sensor height in pixels.
pub const SENSOR_HEIGHT: u16 = 256;

/// Pixel coordinate as reported by the transport.
///
/// Transports may hand over values outside the sensor; see [`Coordinate::in_bounds`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Coordinate {
    /// Column
    pub x: u16,
    /// Row
    pub y: u16,
}

impl Coordinate {
    /// Create a coordinate.
    pub fn new(x: u16, y: u16) -> Self {
        Self { x, y }
    }

    /// Whether the coordinate lies on the sensor.
    pub fn in_bounds(&self) -> bool {
        self.x < SENSOR_WIDTH && self.y < SENSOR_HEIGHT
    }

    /// Row-major index into a sensor-sized table, `None` when out of bounds.
    pub fn index(&self) -> Option<usize> {
        self.in_bounds()
            .then(|| usize::from(self.y) * usize::from(SENSOR_WIDTH) + usize::from(self.x))
    }
}

/// One decoded pixel hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelEvent {
    /// Pixel position
    pub coord: Coordinate,
    /// Coarse time of arrival
    pub toa: u64,
    /// Fine time of arrival
    pub ftoa: u8,
    /// Time over threshold, or integrated ToT in event+iToT mode
    pub tot: u16,
    /// Event count reported alongside iToT
    pub event_count: Option<u16>,
}

impl PixelEvent {
    /// Event in ToA+ToT mode.
    pub fn new(x: u16, y: u16, toa: u64, ftoa: u8, tot: u16) -> Self {
        Self {
            coord: Coordinate::new(x, y),
            toa,
            ftoa,
            tot,
            event_count: None,
        }
    }
}

/// Summary of one acquisition frame, supplied by the transport at frame end.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FrameInfo {
    /// Pixels the sensor sent
    pub sent_pixels: u64,
    /// Pixels the host received
    pub received_pixels: u64,
    /// Pixels lost in transit
    pub lost_pixels: u64,
    /// Frame start timestamp (readout clock)
    pub start_time: u64,
    /// Frame end timestamp (readout clock)
    pub end_time: u64,
    /// Whether the frame ran to completion
    pub completed: bool,
}

/// Terminal state of an acquisition session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionState {
    /// All requested frames delivered
    Succeeded,
    /// Fail timeout elapsed before the stream ended
    TimedOut,
    /// The frame handler asked the stream to stop
    Aborted,
}

impl fmt::Display for AcquisitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AcquisitionState::Succeeded => "succeeded",
            AcquisitionState::TimedOut => "timed out",
            AcquisitionState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// What a drain call observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainSummary {
    /// Terminal state
    pub state: AcquisitionState,
    /// Frames that reached their frame-end notification
    pub completed_frames: u32,
    /// Raw measurement words the transport discarded
    pub dropped_measurement_data: u64,
}

/// Communication link status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CommStatus {
    /// Bit mask of active data lines
    pub comm_lines_mask: u8,
    /// Data rate in Mbps
    pub data_rate: u32,
    /// Whether the chip answered on the link
    pub chip_detected: bool,
}

/// Opens links to readout devices.
pub trait Connector {
    /// Link type produced by this connector.
    type Link: ReadoutLink;

    /// Open a link. Boot-time failures should be reported as transient.
    fn connect(&self, address: &str) -> Result<Self::Link, LinkError>;
}

/// One open readout device.
pub trait ReadoutLink: Send {
    /// Raw 32-bit chip identifier word.
    fn chip_id_word(&mut self) -> Result<u32, LinkError>;
    /// Link status.
    fn comm_status(&mut self) -> Result<CommStatus, LinkError>;
    /// Readout board temperature in °C.
    fn readout_temperature(&mut self) -> Result<f32, LinkError>;
    /// Sensor temperature in °C.
    fn sensor_temperature(&mut self) -> Result<f32, LinkError>;
    /// Run the digital self-test; an error means the test failed.
    fn digital_test(&mut self) -> Result<(), LinkError>;
    /// Sample an ADC channel, in volts.
    fn adc_voltage(&mut self, channel: u8) -> Result<f32, LinkError>;
    /// Apply a bias voltage.
    fn set_bias(&mut self, channel: u8, volts: f32) -> Result<(), LinkError>;
    /// Push acquisition parameters and pixel configuration.
    fn configure(&mut self, config: &AcquisitionConfig, pixels: &PixelConfig) -> Result<(), LinkError>;
    /// Allocate resources for one acquisition session.
    fn open_session(
        &mut self,
        buffers: &SessionBuffers,
    ) -> Result<Box<dyn TransportSession + '_>, LinkError>;
    /// Release the device. Called once when the owning session is dropped.
    fn close(&mut self);
}

/// One bounded acquisition session on a link.
pub trait TransportSession {
    /// Arm the session.
    fn begin(
        &mut self,
        config: &AcquisitionConfig,
        readout: ReadoutMode,
        mode: AcquisitionMode,
    ) -> Result<(), LinkError>;

    /// Block until the event stream is exhausted or the fail timeout elapses.
    ///
    /// Notifications are delivered to `handler` from a producer thread in the
    /// order start, batches, end per frame. A timed-out drain is reported
    /// through [`DrainSummary::state`], not as an error.
    fn drain(&mut self, handler: &mut (dyn FrameHandler + Send)) -> Result<DrainSummary, LinkError>;

    /// Release session resources. Must be safe to call more than once.
    fn finalize(&mut self);
}

/// Render a raw chip identifier word as the wafer/position string, e.g. `D4-W0005`.
///
/// Returns `None` when the column nibble is zero, which no valid chip reports.
pub fn decode_chip_id(word: u32) -> Option<String> {
    let column = word & 0xF;
    if column == 0 {
        return None;
    }
    let x = column - 1;
    let y = (word >> 4) & 0xF;
    let wafer = (word >> 8) & 0xFFF;
    let letter = char::from(b'A' + x as u8);
    Some(format!("{letter}{y}-W000{wafer}"))
}

/// Inverse of [`decode_chip_id`] for identifiers of the form `D4-W0005`.
pub fn encode_chip_id(id: &str) -> Option<u32> {
    let (position, wafer) = id.split_once("-W")?;
    let mut chars = position.chars();
    let letter = chars.next()?;
    if !letter.is_ascii_uppercase() || letter > 'O' {
        return None;
    }
    let y: u32 = chars.as_str().parse().ok().filter(|y| *y < 16)?;
    let wafer: u32 = wafer.parse().ok().filter(|w| *w < 0x1000)?;
    let x = u32::from(letter as u8 - b'A') + 1;
    Some(x | (y << 4) | (wafer << 8))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chip_id_decodes_known_chip() {
        // Column D (4), row 4, wafer 5
        assert_eq!(decode_chip_id(0x0544).as_deref(), Some("D4-W0005"));
        assert_eq!(decode_chip_id(0), None);
    }

    #[test]
    fn chip_id_encode_inverts_decode() {
        let word = encode_chip_id("D4-W0005").unwrap();
        assert_eq!(word, 0x0544);
        assert_eq!(decode_chip_id(word).as_deref(), Some("D4-W0005"));
        assert_eq!(encode_chip_id("nonsense"), None);
    }

    #[test]
    fn coordinate_bounds() {
        assert_eq!(Coordinate::new(0, 0).index(), Some(0));
        assert_eq!(Coordinate::new(255, 255).index(), Some(65_535));
        assert_eq!(Coordinate::new(1, 2).index(), Some(513));
        assert!(!Coordinate::new(256, 0).in_bounds());
        assert_eq!(Coordinate::new(0, 300).index(), None);
    }
}
