//! Per-pixel configuration (mask and threshold trim) loading.
//!
//! The sensor needs one configuration byte per pixel before it can acquire. Two
//! file formats are in use, both exactly 65 536 bytes in row-major order with the
//! first file row mapped to sensor row 255:
//!
//! - `.bmc`: bytes are used as-is.
//! - `.bpc`: the four threshold-trim bits (1..=4) are stored bit-reversed and are
//!   flipped back before packing.
//!
//! The loaded bytes are packed into the 16 384 32-bit words the readout expects:
//! column-major, four pixels per word, most significant byte first.

use crate::error::{DaqError, DaqResult};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Sensor side length in pixels.
const SIDE: usize = 256;

/// Size of a pixel configuration file in bytes.
pub const PIXEL_CONFIG_BYTES: usize = SIDE * SIDE;

/// Number of packed configuration words.
pub const PIXEL_CONFIG_WORDS: usize = PIXEL_CONFIG_BYTES / 4;

const TRIM_REVERSE: [u8; 16] = [0, 8, 4, 12, 2, 10, 6, 14, 1, 9, 5, 13, 3, 11, 7, 15];

/// On-disk pixel configuration format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelConfigFormat {
    /// Trim bits stored as-is.
    Bmc,
    /// Trim bits stored bit-reversed.
    Bpc,
}

impl PixelConfigFormat {
    /// Detect the format from a file extension (case-insensitive).
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "bmc" => Some(Self::Bmc),
            "bpc" => Some(Self::Bpc),
            _ => None,
        }
    }
}

/// Packed per-pixel configuration ready to send to the readout.
#[derive(Clone, PartialEq, Eq)]
pub struct PixelConfig {
    words: Vec<u32>,
    source: Option<PathBuf>,
}

impl std::fmt::Debug for PixelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PixelConfig")
            .field("source", &self.source)
            .field("words", &self.words.len())
            .finish()
    }
}

impl PixelConfig {
    /// Load and pack a configuration file. The format follows the extension.
    pub fn load(path: impl AsRef<Path>) -> DaqResult<Self> {
        let path = path.as_ref();
        let format = PixelConfigFormat::from_path(path).ok_or_else(|| DaqError::PixelConfig {
            path: path.to_path_buf(),
            message: "unknown extension, expected .bmc or .bpc".to_string(),
        })?;

        let data = std::fs::read(path).map_err(|e| DaqError::PixelConfig {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        let mut config = Self::from_bytes(&data, format).map_err(|message| DaqError::PixelConfig {
            path: path.to_path_buf(),
            message,
        })?;
        config.source = Some(path.to_path_buf());

        info!(path = %path.display(), ?format, "Loaded pixel configuration");
        Ok(config)
    }

    /// Pack raw file contents.
    pub fn from_bytes(data: &[u8], format: PixelConfigFormat) -> Result<Self, String> {
        if data.len() != PIXEL_CONFIG_BYTES {
            return Err(format!(
                "invalid file size: expected {PIXEL_CONFIG_BYTES} bytes, got {}",
                data.len()
            ));
        }

        let mut words = vec![0u32; PIXEL_CONFIG_WORDS];
        for (i, &raw) in data.iter().enumerate() {
            let byte = match format {
                PixelConfigFormat::Bmc => raw,
                PixelConfigFormat::Bpc => unreverse_trim(raw),
            };
            let x = i % SIDE;
            let y = SIDE - 1 - i / SIDE;
            words[64 * x + (y >> 2)] |= u32::from(byte) << (8 * (3 - (y % 4)));
        }

        debug!(?format, "Packed pixel configuration");
        Ok(Self {
            words,
            source: None,
        })
    }

    /// Configuration with the same byte for every pixel.
    pub fn uniform(byte: u8) -> Self {
        let word = u32::from_be_bytes([byte; 4]);
        Self {
            words: vec![word; PIXEL_CONFIG_WORDS],
            source: None,
        }
    }

    /// Packed words in transmission order.
    pub fn words(&self) -> &[u32] {
        &self.words
    }

    /// File the configuration was loaded from, if any.
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Configuration byte of one pixel in sensor coordinates.
    pub fn pixel(&self, x: usize, y: usize) -> Option<u8> {
        if x >= SIDE || y >= SIDE {
            return None;
        }
        let word = self.words[64 * x + (y >> 2)];
        Some((word >> (8 * (3 - (y % 4)))) as u8)
    }
}

fn unreverse_trim(d: u8) -> u8 {
    (d & 0x21) | (TRIM_REVERSE[usize::from((d & 0x1E) >> 1)] << 1)
}
