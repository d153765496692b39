//! HDF5 backend.
//!
//! File layout:
//!
//! ```text
//! /                      root attributes (sweep metadata, chip id, rows_written)
//! /pixel_hits            compound PixelHitRow, chunked, unlimited
//! /sweep_results         compound SweepResultRow, fixed size
//! /step_NNNN/frame_N     per-frame attributes
//! ```

use super::{normalize_group, AttrValue, HitStore, PixelHitRow, SweepResultRow, PIXEL_HITS, SWEEP_RESULTS};
use crate::error::{DaqError, DaqResult};
use hdf5::types::VarLenUnicode;
use hdf5::{Dataset, File, Group, H5Type};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Chunk size of the extendable hit table, in rows.
const HIT_CHUNK: usize = 1000;

/// HDF5 output file.
pub struct Hdf5Store {
    path: PathBuf,
    file: Option<File>,
    hits: Option<Dataset>,
    sweep: Option<Dataset>,
    hit_rows: usize,
    sweep_len: usize,
}

impl std::fmt::Debug for Hdf5Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hdf5Store")
            .field("path", &self.path)
            .field("open", &self.file.is_some())
            .field("hit_rows", &self.hit_rows)
            .field("sweep_len", &self.sweep_len)
            .finish()
    }
}

impl Hdf5Store {
    /// Create (truncate) a file and its hit table.
    pub fn create(path: impl AsRef<Path>) -> DaqResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        let hits = file
            .new_dataset::<PixelHitRow>()
            .chunk(HIT_CHUNK)
            .shape(0..)
            .create(PIXEL_HITS)?;

        info!(path = %path.display(), "Created HDF5 output file");
        Ok(Self {
            path,
            file: Some(file),
            hits: Some(hits),
            sweep: None,
            hit_rows: 0,
            sweep_len: 0,
        })
    }

    /// Output file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file(&self) -> DaqResult<&File> {
        self.file
            .as_ref()
            .ok_or_else(|| DaqError::Storage(format!("{} is closed", self.path.display())))
    }

    fn group(&self, target: &str) -> DaqResult<Group> {
        let file = self.file()?;
        let normalized = normalize_group(target);
        if normalized.is_empty() {
            Ok(file.group("/")?)
        } else {
            file.group(&normalized)
                .map_err(|e| DaqError::Storage(format!("group '{target}' does not exist: {e}")))
        }
    }
}

fn write_attr<T: H5Type>(group: &Group, key: &str, value: &T) -> DaqResult<()> {
    match group.attr(key) {
        Ok(attr) => attr.write_scalar(value)?,
        Err(_) => group.new_attr::<T>().create(key)?.write_scalar(value)?,
    }
    Ok(())
}

/// Resize a dataset to `end` rows and fill `start..end`. A failed write
/// shrinks the dataset back to `start` rows before the error is returned.
fn grow_and_write(
    start: usize,
    end: usize,
    mut resize: impl FnMut(usize) -> DaqResult<()>,
    write: impl FnOnce() -> DaqResult<()>,
) -> DaqResult<()> {
    resize(end)?;
    if let Err(e) = write() {
        if let Err(rollback) = resize(start) {
            warn!(rows = start, error = %rollback, "Failed to shrink hit table after write error");
        }
        return Err(e);
    }
    Ok(())
}

impl HitStore for Hdf5Store {
    fn append_hits(&mut self, rows: &[PixelHitRow]) -> DaqResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        self.file()?;
        let ds = self
            .hits
            .as_ref()
            .ok_or_else(|| DaqError::Storage(format!("{PIXEL_HITS} is closed")))?;
        let start = self.hit_rows;
        let end = start + rows.len();
        grow_and_write(
            start,
            end,
            |len| ds.resize((len,)).map_err(DaqError::from),
            || ds.write_slice(rows, start..end).map_err(DaqError::from),
        )?;
        self.hit_rows = end;
        Ok(())
    }

    fn hit_count(&self) -> u64 {
        self.hit_rows as u64
    }

    fn create_sweep_table(&mut self, len: usize) -> DaqResult<()> {
        if self.sweep.is_some() {
            return Err(DaqError::Storage(format!("{SWEEP_RESULTS} already exists")));
        }
        let ds = self
            .file()?
            .new_dataset::<SweepResultRow>()
            .shape(len)
            .create(SWEEP_RESULTS)?;
        debug!(rows = len, "Preallocated sweep table");
        self.sweep = Some(ds);
        self.sweep_len = len;
        Ok(())
    }

    fn sweep_capacity(&self) -> usize {
        self.sweep_len
    }

    fn write_sweep_at(&mut self, index: usize, row: &SweepResultRow) -> DaqResult<()> {
        if index >= self.sweep_len {
            return Err(DaqError::Indexing {
                index,
                capacity: self.sweep_len,
            });
        }
        self.file()?;
        let ds = self
            .sweep
            .as_ref()
            .ok_or_else(|| DaqError::Storage(format!("{SWEEP_RESULTS} was not created")))?;
        ds.write_slice(std::slice::from_ref(row), index..index + 1)?;
        Ok(())
    }

    fn create_or_open_group(&mut self, path: &str) -> DaqResult<()> {
        let file = self.file()?;
        let mut current = String::new();
        for part in normalize_group(path).split('/').filter(|p| !p.is_empty()) {
            if !current.is_empty() {
                current.push('/');
            }
            current.push_str(part);
            if !file.link_exists(&current) {
                file.create_group(&current)?;
            }
        }
        Ok(())
    }

    fn set_attribute(&mut self, target: &str, key: &str, value: AttrValue) -> DaqResult<()> {
        let group = self.group(target)?;
        match value {
            AttrValue::Int(v) => write_attr(&group, key, &v),
            AttrValue::UInt(v) => write_attr(&group, key, &v),
            AttrValue::Float(v) => write_attr(&group, key, &v),
            AttrValue::Text(v) => {
                let text = v
                    .parse::<VarLenUnicode>()
                    .map_err(|e| DaqError::Storage(format!("attribute '{key}': {e}")))?;
                write_attr(&group, key, &text)
            }
        }
    }

    fn close(&mut self) -> DaqResult<()> {
        self.hits = None;
        self.sweep = None;
        if let Some(file) = self.file.take() {
            file.flush()?;
            info!(
                path = %self.path.display(),
                hit_rows = self.hit_rows,
                sweep_rows = self.sweep_len,
                "Closed HDF5 output file"
            );
        }
        Ok(())
    }
}

impl Drop for Hdf5Store {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(path = %self.path.display(), error = %e, "Failed to close HDF5 file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_hit_write_shrinks_table_back() {
        let mut sizes = Vec::new();
        let err = grow_and_write(
            10,
            15,
            |len| {
                sizes.push(len);
                Ok(())
            },
            || Err(DaqError::Storage("disk full".into())),
        )
        .unwrap_err();
        assert_eq!(err.exit_code(), 7);
        assert_eq!(sizes, vec![15, 10]);

        let mut sizes = Vec::new();
        grow_and_write(
            10,
            15,
            |len| {
                sizes.push(len);
                Ok(())
            },
            || Ok(()),
        )
        .unwrap();
        assert_eq!(sizes, vec![15]);
    }

    #[test]
    fn closed_store_rejects_appends_without_growing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("closed.h5");
        let mut store = Hdf5Store::create(&path).unwrap();
        let row = PixelHitRow::default();
        store.append_hits(&[row; 4]).unwrap();
        store.close().unwrap();

        assert!(store.append_hits(&[row]).is_err());
        assert_eq!(store.hit_count(), 4);
        let file = File::open(&path).unwrap();
        assert_eq!(file.dataset(PIXEL_HITS).unwrap().shape(), vec![4]);
    }

    #[test]
    fn hits_append_and_sweep_is_fixed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.h5");
        let mut store = Hdf5Store::create(&path).unwrap();

        let row = PixelHitRow {
            x: 3,
            y: 4,
            toa: 100,
            hit_count: 1,
            parameter: 5.0,
            ..Default::default()
        };
        store.append_hits(&[row, row]).unwrap();
        store.append_hits(&[row]).unwrap();
        assert_eq!(store.hit_count(), 3);

        store.create_sweep_table(2).unwrap();
        store.write_sweep_at(0, &SweepResultRow::default()).unwrap();
        assert!(matches!(
            store.write_sweep_at(2, &SweepResultRow::default()),
            Err(DaqError::Indexing { .. })
        ));

        store.create_or_open_group("/step_0000/frame_0").unwrap();
        store.create_or_open_group("/step_0000").unwrap();
        store.set_attribute("/step_0000", "target", 5.0.into()).unwrap();
        store.set_attribute("/step_0000", "target", 10.0.into()).unwrap();
        store.set_attribute("/", "chip_id", "D4-W0005".into()).unwrap();
        store.close().unwrap();
        store.close().unwrap();

        let file = File::open(&path).unwrap();
        assert_eq!(file.dataset(PIXEL_HITS).unwrap().shape(), vec![3]);
        assert_eq!(file.dataset(SWEEP_RESULTS).unwrap().shape(), vec![2]);
        let target: f64 = file
            .group("step_0000")
            .unwrap()
            .attr("target")
            .unwrap()
            .read_scalar()
            .unwrap();
        assert_eq!(target, 10.0);
        assert!(file.link_exists("step_0000/frame_0"));
    }
}
