//! Output stores for pixel hits and sweep results.
//!
//! A store holds two tables and a tree of attribute-carrying groups:
//!
//! - `pixel_hits`: append-only, one [`PixelHitRow`] per accepted event
//! - `sweep_results`: fixed size, preallocated once per sweep, written by index
//! - groups such as `/step_0003/frame_0`, each with scalar attributes
//!
//! [`HitStore`] is the seam between the pipeline and a backend.
//! [`MemoryStore`] keeps everything in memory and is always available. The HDF5
//! backend lives behind the `storage_hdf5` feature.

#[cfg(feature = "storage_hdf5")]
pub mod hdf5_store;

#[cfg(feature = "storage_hdf5")]
pub use hdf5_store::Hdf5Store;

use crate::config::{StorageBackend, StorageConfig};
use crate::error::{DaqError, DaqResult};
use chrono::{DateTime, TimeZone};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use tracing::info;

/// Name of the append-only hit table.
pub const PIXEL_HITS: &str = "pixel_hits";

/// Name of the fixed-size sweep table.
pub const SWEEP_RESULTS: &str = "sweep_results";

/// One stored pixel hit.
#[cfg_attr(feature = "storage_hdf5", derive(hdf5::H5Type))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[repr(C)]
pub struct PixelHitRow {
    /// Column
    pub x: u16,
    /// Row
    pub y: u16,
    /// Coarse time of arrival
    pub toa: u64,
    /// Fine time of arrival
    pub ftoa: u8,
    /// Time over threshold
    pub tot: u16,
    /// Event count (event+iToT mode only, otherwise 0)
    pub event_count: u16,
    /// Running hit count of this pixel, including this hit
    pub hit_count: u32,
    /// Sweep parameter in effect (threshold mV, fine code or bias V); NaN outside sweeps
    pub parameter: f64,
}

/// One sweep measurement.
#[cfg_attr(feature = "storage_hdf5", derive(hdf5::H5Type))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[repr(C)]
pub struct SweepResultRow {
    /// Requested parameter value
    pub target: f64,
    /// Value actually applied after quantization
    pub applied: f64,
    /// Frame index within the step
    pub frame_index: u32,
    /// Hits accepted in the acquisition session
    pub hits: u64,
    /// Whether the session completed every requested frame
    pub completed: bool,
}

/// Scalar attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    /// Signed integer
    Int(i64),
    /// Unsigned integer
    UInt(u64),
    /// Floating point
    Float(f64),
    /// UTF-8 text
    Text(String),
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Int(v) => write!(f, "{v}"),
            AttrValue::UInt(v) => write!(f, "{v}"),
            AttrValue::Float(v) => write!(f, "{v}"),
            AttrValue::Text(v) => f.write_str(v),
        }
    }
}

macro_rules! attr_from {
    ($variant:ident, $target:ty, $($source:ty),+) => {
        $(impl From<$source> for AttrValue {
            fn from(value: $source) -> Self {
                AttrValue::$variant(<$target>::from(value))
            }
        })+
    };
}

attr_from!(Int, i64, i32, i64);
attr_from!(UInt, u64, u8, u16, u32, u64);
attr_from!(Float, f64, f32, f64);

impl From<usize> for AttrValue {
    fn from(value: usize) -> Self {
        AttrValue::UInt(value as u64)
    }
}

impl From<bool> for AttrValue {
    fn from(value: bool) -> Self {
        AttrValue::UInt(u64::from(value))
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::Text(value.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        AttrValue::Text(value)
    }
}

/// Backend for hit and sweep output.
///
/// Group paths use `/` separators; `"/"` or `""` names the root. Every method
/// after [`close`](HitStore::close) fails, except `close` itself.
pub trait HitStore {
    /// Append rows to the hit table in one write.
    fn append_hits(&mut self, rows: &[PixelHitRow]) -> DaqResult<()>;

    /// Rows in the hit table.
    fn hit_count(&self) -> u64;

    /// Create the sweep table with `len` zeroed rows. Called once per store.
    fn create_sweep_table(&mut self, len: usize) -> DaqResult<()>;

    /// Rows allocated by [`create_sweep_table`](HitStore::create_sweep_table), 0 before.
    fn sweep_capacity(&self) -> usize;

    /// Write one sweep row. Never grows the table.
    fn write_sweep_at(&mut self, index: usize, row: &SweepResultRow) -> DaqResult<()>;

    /// Create a group and its missing parents, or open it when it exists.
    fn create_or_open_group(&mut self, path: &str) -> DaqResult<()>;

    /// Set a scalar attribute on an existing group, replacing any previous value.
    fn set_attribute(&mut self, target: &str, key: &str, value: AttrValue) -> DaqResult<()>;

    /// Flush and release the backend. Idempotent.
    fn close(&mut self) -> DaqResult<()>;
}

impl<S: HitStore + ?Sized> HitStore for &mut S {
    fn append_hits(&mut self, rows: &[PixelHitRow]) -> DaqResult<()> {
        (**self).append_hits(rows)
    }
    fn hit_count(&self) -> u64 {
        (**self).hit_count()
    }
    fn create_sweep_table(&mut self, len: usize) -> DaqResult<()> {
        (**self).create_sweep_table(len)
    }
    fn sweep_capacity(&self) -> usize {
        (**self).sweep_capacity()
    }
    fn write_sweep_at(&mut self, index: usize, row: &SweepResultRow) -> DaqResult<()> {
        (**self).write_sweep_at(index, row)
    }
    fn create_or_open_group(&mut self, path: &str) -> DaqResult<()> {
        (**self).create_or_open_group(path)
    }
    fn set_attribute(&mut self, target: &str, key: &str, value: AttrValue) -> DaqResult<()> {
        (**self).set_attribute(target, key, value)
    }
    fn close(&mut self) -> DaqResult<()> {
        (**self).close()
    }
}

impl<S: HitStore + ?Sized> HitStore for Box<S> {
    fn append_hits(&mut self, rows: &[PixelHitRow]) -> DaqResult<()> {
        (**self).append_hits(rows)
    }
    fn hit_count(&self) -> u64 {
        (**self).hit_count()
    }
    fn create_sweep_table(&mut self, len: usize) -> DaqResult<()> {
        (**self).create_sweep_table(len)
    }
    fn sweep_capacity(&self) -> usize {
        (**self).sweep_capacity()
    }
    fn write_sweep_at(&mut self, index: usize, row: &SweepResultRow) -> DaqResult<()> {
        (**self).write_sweep_at(index, row)
    }
    fn create_or_open_group(&mut self, path: &str) -> DaqResult<()> {
        (**self).create_or_open_group(path)
    }
    fn set_attribute(&mut self, target: &str, key: &str, value: AttrValue) -> DaqResult<()> {
        (**self).set_attribute(target, key, value)
    }
    fn close(&mut self) -> DaqResult<()> {
        (**self).close()
    }
}

/// Normalize a group path to `a/b/c` form; the root becomes `""`.
pub(crate) fn normalize_group(path: &str) -> String {
    path.split('/')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// In-memory store.
#[derive(Debug)]
pub struct MemoryStore {
    hits: Vec<PixelHitRow>,
    sweep: Option<Vec<SweepResultRow>>,
    groups: BTreeMap<String, BTreeMap<String, AttrValue>>,
    closed: bool,
}

impl MemoryStore {
    /// Empty store with only the root group.
    pub fn new() -> Self {
        let mut groups = BTreeMap::new();
        groups.insert(String::new(), BTreeMap::new());
        Self {
            hits: Vec::new(),
            sweep: None,
            groups,
            closed: false,
        }
    }

    /// Stored hit rows.
    pub fn hits(&self) -> &[PixelHitRow] {
        &self.hits
    }

    /// Sweep table, `None` before it is created.
    pub fn sweep_rows(&self) -> Option<&[SweepResultRow]> {
        self.sweep.as_deref()
    }

    /// Whether a group exists.
    pub fn has_group(&self, path: &str) -> bool {
        self.groups.contains_key(&normalize_group(path))
    }

    /// Group paths in sorted order, root excluded.
    pub fn group_paths(&self) -> impl Iterator<Item = &str> + '_ {
        self.groups.keys().filter(|k| !k.is_empty()).map(String::as_str)
    }

    /// Attribute lookup.
    pub fn attribute(&self, target: &str, key: &str) -> Option<&AttrValue> {
        self.groups.get(&normalize_group(target))?.get(key)
    }

    /// Whether [`HitStore::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn ensure_open(&self) -> DaqResult<()> {
        if self.closed {
            Err(DaqError::Storage("store is closed".into()))
        } else {
            Ok(())
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl HitStore for MemoryStore {
    fn append_hits(&mut self, rows: &[PixelHitRow]) -> DaqResult<()> {
        self.ensure_open()?;
        self.hits.extend_from_slice(rows);
        Ok(())
    }

    fn hit_count(&self) -> u64 {
        self.hits.len() as u64
    }

    fn create_sweep_table(&mut self, len: usize) -> DaqResult<()> {
        self.ensure_open()?;
        if self.sweep.is_some() {
            return Err(DaqError::Storage(format!("{SWEEP_RESULTS} already exists")));
        }
        self.sweep = Some(vec![SweepResultRow::default(); len]);
        Ok(())
    }

    fn sweep_capacity(&self) -> usize {
        self.sweep.as_ref().map_or(0, Vec::len)
    }

    fn write_sweep_at(&mut self, index: usize, row: &SweepResultRow) -> DaqResult<()> {
        self.ensure_open()?;
        let capacity = self.sweep_capacity();
        let slot = self
            .sweep
            .as_mut()
            .and_then(|rows| rows.get_mut(index))
            .ok_or(DaqError::Indexing { index, capacity })?;
        *slot = *row;
        Ok(())
    }

    fn create_or_open_group(&mut self, path: &str) -> DaqResult<()> {
        self.ensure_open()?;
        let normalized = normalize_group(path);
        let mut current = String::new();
        for part in normalized.split('/').filter(|p| !p.is_empty()) {
            if !current.is_empty() {
                current.push('/');
            }
            current.push_str(part);
            self.groups.entry(current.clone()).or_default();
        }
        Ok(())
    }

    fn set_attribute(&mut self, target: &str, key: &str, value: AttrValue) -> DaqResult<()> {
        self.ensure_open()?;
        let group = self
            .groups
            .get_mut(&normalize_group(target))
            .ok_or_else(|| DaqError::Storage(format!("group '{target}' does not exist")))?;
        group.insert(key.to_string(), value);
        Ok(())
    }

    fn close(&mut self) -> DaqResult<()> {
        self.closed = true;
        Ok(())
    }
}

/// Kind of run, used for generated file names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    /// Plain acquisition
    Acquisition,
    /// Threshold sweep
    ThresholdScan,
    /// Bias sweep
    BiasScan,
}

impl RunKind {
    fn prefix(self) -> &'static str {
        match self {
            RunKind::Acquisition => "pixel_data",
            RunKind::ThresholdScan => "thl_calibration",
            RunKind::BiasScan => "bias_scan",
        }
    }
}

/// Timestamped file name, e.g. `thl_calibration_20240131_235959.h5`.
pub fn default_file_name<Tz: TimeZone>(kind: RunKind, now: DateTime<Tz>) -> String
where
    Tz::Offset: fmt::Display,
{
    format!("{}_{}.h5", kind.prefix(), now.format("%Y%m%d_%H%M%S"))
}

/// Open the configured backend for a run.
///
/// Returns the store and the file it writes to, if any.
pub fn open_store(
    config: &StorageConfig,
    kind: RunKind,
) -> DaqResult<(Box<dyn HitStore + Send>, Option<PathBuf>)> {
    match config.backend {
        StorageBackend::Memory => {
            info!("Using in-memory store, no data file is written");
            Ok((Box::new(MemoryStore::new()), None))
        }
        StorageBackend::Hdf5 => open_hdf5(config, kind),
    }
}

#[cfg(feature = "storage_hdf5")]
fn open_hdf5(
    config: &StorageConfig,
    kind: RunKind,
) -> DaqResult<(Box<dyn HitStore + Send>, Option<PathBuf>)> {
    std::fs::create_dir_all(&config.output_dir)?;
    let name = config
        .file_name
        .clone()
        .unwrap_or_else(|| default_file_name(kind, chrono::Local::now()));
    let path = config.output_dir.join(name);
    let store = Hdf5Store::create(&path)?;
    Ok((Box::new(store), Some(path)))
}

#[cfg(not(feature = "storage_hdf5"))]
fn open_hdf5(
    _config: &StorageConfig,
    _kind: RunKind,
) -> DaqResult<(Box<dyn HitStore + Send>, Option<PathBuf>)> {
    Err(DaqError::Config(
        "HDF5 storage requires the 'storage_hdf5' feature; rebuild with --features storage_hdf5 \
         or set storage.backend = \"memory\""
            .into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn sweep_writes_are_bounds_checked() {
        let mut store = MemoryStore::new();
        store.create_sweep_table(2).unwrap();
        let row = SweepResultRow {
            target: 5.0,
            applied: 5.0,
            frame_index: 0,
            hits: 7,
            completed: true,
        };
        store.write_sweep_at(1, &row).unwrap();

        let err = store.write_sweep_at(2, &row).unwrap_err();
        assert!(matches!(err, DaqError::Indexing { index: 2, capacity: 2 }));
        assert_eq!(err.exit_code(), 14);
        assert_eq!(store.sweep_rows().unwrap()[1], row);
        assert_eq!(store.sweep_capacity(), 2);
    }

    #[test]
    fn groups_create_parents_and_reopen() {
        let mut store = MemoryStore::new();
        store.create_or_open_group("/step_0001/frame_0").unwrap();
        store.create_or_open_group("step_0001/").unwrap();
        assert!(store.has_group("/step_0001"));
        assert_eq!(
            store.group_paths().collect::<Vec<_>>(),
            vec!["step_0001", "step_0001/frame_0"]
        );

        store
            .set_attribute("/step_0001", "target", AttrValue::from(5.0))
            .unwrap();
        store
            .set_attribute("/step_0001", "target", AttrValue::from(10.0))
            .unwrap();
        assert_eq!(
            store.attribute("step_0001", "target"),
            Some(&AttrValue::Float(10.0))
        );
        assert!(store.set_attribute("/missing", "x", 1u32.into()).is_err());
        store.set_attribute("/", "chip_id", "D4-W0005".into()).unwrap();
    }

    #[test]
    fn closed_store_rejects_writes() {
        let mut store = MemoryStore::new();
        store.close().unwrap();
        store.close().unwrap();
        assert!(store.append_hits(&[PixelHitRow::default()]).is_err());
        assert!(store.is_closed());
    }

    #[test]
    fn file_names_carry_kind_and_timestamp() {
        let now = Utc.with_ymd_and_hms(2024, 1, 31, 23, 59, 58).unwrap();
        assert_eq!(
            default_file_name(RunKind::ThresholdScan, now),
            "thl_calibration_20240131_235958.h5"
        );
        assert_eq!(
            default_file_name(RunKind::Acquisition, now),
            "pixel_data_20240131_235958.h5"
        );
    }

    #[cfg(not(feature = "storage_hdf5"))]
    #[test]
    fn hdf5_backend_without_feature_is_config_error() {
        let err = open_store(&StorageConfig::default(), RunKind::BiasScan).err().unwrap();
        assert_eq!(err.exit_code(), 1);
    }
}
