//! Per-pixel hit aggregation.
//!
//! [`HitAggregator`] is the [`FrameHandler`] the acquisition driver hands to
//! the transport. It keeps a running hit counter for every pixel, rejects
//! events outside the sensor, and writes one [`PixelHitRow`] per accepted
//! event to its store. Frame summaries become attributes of a per-frame group.
//!
//! Counters are reset at the start of every session, or only when the owner
//! calls [`HitAggregator::reset_counters`] when the scope is
//! [`CounterScope::SweepStep`].

use crate::acquisition::FrameHandler;
use crate::config::CounterScope;
use crate::error::DaqError;
use crate::hardware::{FrameInfo, PixelEvent, SENSOR_HEIGHT, SENSOR_WIDTH};
use crate::storage::{AttrValue, HitStore, PixelHitRow};
use serde::Serialize;
use tracing::{debug, error, warn};

/// Summary of the most recent finished frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FrameSnapshot {
    /// Frame index within the session
    pub index: u32,
    /// Whether the transport reported the frame as completed
    pub completed: bool,
    /// Hits accepted in the frame
    pub hits: u64,
    /// Transport frame summary
    pub info: FrameInfo,
}

/// Running per-pixel counters feeding a [`HitStore`].
pub struct HitAggregator<S> {
    store: S,
    counters: Vec<u32>,
    scope: CounterScope,
    parameter: f64,
    group_prefix: String,
    frame_base: u32,
    rows: Vec<PixelHitRow>,
    frame_hits: u64,
    session_hits: u64,
    dropped_events: u64,
    last_frame: Option<FrameSnapshot>,
    store_error: Option<DaqError>,
}

impl<S: HitStore> HitAggregator<S> {
    /// Aggregator with session-scoped counters and no sweep parameter.
    pub fn new(store: S) -> Self {
        Self {
            store,
            counters: vec![0; usize::from(SENSOR_WIDTH) * usize::from(SENSOR_HEIGHT)],
            scope: CounterScope::Session,
            parameter: f64::NAN,
            group_prefix: String::new(),
            frame_base: 0,
            rows: Vec::new(),
            frame_hits: 0,
            session_hits: 0,
            dropped_events: 0,
            last_frame: None,
            store_error: None,
        }
    }

    /// Set the counter reset boundary.
    pub fn with_scope(mut self, scope: CounterScope) -> Self {
        self.scope = scope;
        self
    }

    /// Sweep parameter stamped on every following row.
    pub fn set_parameter(&mut self, value: f64) {
        self.parameter = value;
    }

    /// Group under which frame groups are created, e.g. `/step_0003`.
    pub fn set_group(&mut self, prefix: impl Into<String>) {
        self.group_prefix = prefix.into();
    }

    /// Offset added to transport frame indices when naming frame groups, so
    /// several single-frame sessions under one prefix get distinct groups.
    pub fn set_frame_base(&mut self, base: u32) {
        self.frame_base = base;
    }

    /// Prepare for a new acquisition session.
    pub fn begin_session(&mut self) {
        if self.scope == CounterScope::Session {
            self.reset_counters();
        }
        self.frame_hits = 0;
        self.session_hits = 0;
        self.dropped_events = 0;
        self.last_frame = None;
    }

    /// Zero every pixel counter.
    pub fn reset_counters(&mut self) {
        self.counters.fill(0);
    }

    /// Running count of one pixel, `None` outside the sensor.
    pub fn counter(&self, x: u16, y: u16) -> Option<u32> {
        let index = crate::hardware::Coordinate::new(x, y).index()?;
        Some(self.counters[index])
    }

    /// Hits accepted in the current (or last) frame.
    pub fn frame_hits(&self) -> u64 {
        self.frame_hits
    }

    /// Hits accepted since [`begin_session`](Self::begin_session).
    pub fn session_hits(&self) -> u64 {
        self.session_hits
    }

    /// Out-of-range events rejected since [`begin_session`](Self::begin_session).
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events
    }

    /// Last finished frame of the session.
    pub fn last_frame(&self) -> Option<&FrameSnapshot> {
        self.last_frame.as_ref()
    }

    /// Underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Underlying store, mutably.
    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Consume the aggregator and return its store.
    pub fn into_store(self) -> S {
        self.store
    }

    /// First store failure since the last call, if any.
    pub fn take_store_error(&mut self) -> Option<DaqError> {
        self.store_error.take()
    }

    fn frame_group(&self, frame_index: u32) -> String {
        let frame_index = self.frame_base.saturating_add(frame_index);
        let prefix = self.group_prefix.trim_end_matches('/');
        if prefix.is_empty() {
            format!("frame_{frame_index}")
        } else {
            format!("{prefix}/frame_{frame_index}")
        }
    }

    fn record(&mut self, result: Result<(), DaqError>) {
        if let Err(e) = result {
            if self.store_error.is_none() {
                error!(error = %e, "Store write failed, further writes in this session are skipped");
                self.store_error = Some(e);
            }
        }
    }

    fn write_frame_end(
        &mut self,
        group: &str,
        completed: bool,
        info: &FrameInfo,
    ) -> Result<(), DaqError> {
        let state = if completed { "completed" } else { "not completed" };
        let attributes: [(&str, AttrValue); 7] = [
            ("received_pixels", info.received_pixels.into()),
            ("sent_pixels", info.sent_pixels.into()),
            ("lost_pixels", info.lost_pixels.into()),
            ("start_time", info.start_time.into()),
            ("end_time", info.end_time.into()),
            ("state", state.into()),
            ("hits", self.frame_hits.into()),
        ];
        for (key, value) in attributes {
            self.store.set_attribute(group, key, value)?;
        }
        Ok(())
    }
}

impl<S: HitStore> FrameHandler for HitAggregator<S> {
    fn on_frame_start(&mut self, frame_index: u32) {
        self.frame_hits = 0;
        if self.store_error.is_none() {
            let group = self.frame_group(frame_index);
            let result = self.store.create_or_open_group(&group);
            self.record(result);
        }
        debug!(frame = frame_index, "Frame started");
    }

    fn on_batch(&mut self, events: &[PixelEvent]) {
        self.rows.clear();
        for event in events {
            let Some(index) = event.coord.index() else {
                warn!(
                    x = event.coord.x,
                    y = event.coord.y,
                    "Pixel event out of sensor range, dropped"
                );
                self.dropped_events += 1;
                continue;
            };
            let count = self.counters[index].saturating_add(1);
            self.counters[index] = count;
            self.rows.push(PixelHitRow {
                x: event.coord.x,
                y: event.coord.y,
                toa: event.toa,
                ftoa: event.ftoa,
                tot: event.tot,
                event_count: event.event_count.unwrap_or(0),
                hit_count: count,
                parameter: self.parameter,
            });
        }

        let accepted = self.rows.len() as u64;
        self.frame_hits += accepted;
        self.session_hits += accepted;
        if accepted > 0 && self.store_error.is_none() {
            let result = self.store.append_hits(&self.rows);
            self.record(result);
        }
    }

    fn on_frame_end(&mut self, frame_index: u32, completed: bool, info: &FrameInfo) {
        if self.store_error.is_none() {
            let group = self.frame_group(frame_index);
            let result = self.write_frame_end(&group, completed, info);
            self.record(result);
        }
        debug!(
            frame = frame_index,
            hits = self.frame_hits,
            received = info.received_pixels,
            completed,
            "Frame finished"
        );
        self.last_frame = Some(FrameSnapshot {
            index: frame_index,
            completed,
            hits: self.frame_hits,
            info: *info,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DaqResult;
    use crate::storage::{MemoryStore, SweepResultRow};
    use tracing_test::traced_test;

    fn event(x: u16, y: u16) -> PixelEvent {
        PixelEvent::new(x, y, 10, 1, 20)
    }

    #[test]
    fn counter_equals_number_of_hits() {
        let mut agg = HitAggregator::new(MemoryStore::new());
        agg.begin_session();
        agg.on_frame_start(0);
        agg.on_batch(&[event(5, 6); 4]);
        agg.on_batch(&[event(5, 6), event(7, 8)]);

        assert_eq!(agg.counter(5, 6), Some(5));
        assert_eq!(agg.counter(7, 8), Some(1));
        assert_eq!(agg.counter(0, 0), Some(0));
        let counts: Vec<u32> = agg
            .store()
            .hits()
            .iter()
            .filter(|r| r.x == 5)
            .map(|r| r.hit_count)
            .collect();
        assert_eq!(counts, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    #[traced_test]
    fn out_of_range_events_are_never_stored() {
        let mut agg = HitAggregator::new(MemoryStore::new());
        agg.begin_session();
        agg.on_frame_start(0);
        agg.on_batch(&[event(256, 0), event(1, 1), event(0, 300)]);

        assert_eq!(agg.store().hits().len(), 1);
        assert_eq!(agg.dropped_events(), 2);
        assert_eq!(agg.frame_hits(), 1);
        assert!(logs_contain("out of sensor range"));
    }

    #[test]
    fn counters_reset_per_session_unless_step_scoped() {
        let mut agg = HitAggregator::new(MemoryStore::new());
        agg.begin_session();
        agg.on_batch(&[event(1, 1)]);
        agg.begin_session();
        assert_eq!(agg.counter(1, 1), Some(0));

        let mut agg = HitAggregator::new(MemoryStore::new()).with_scope(CounterScope::SweepStep);
        agg.begin_session();
        agg.on_batch(&[event(1, 1)]);
        agg.begin_session();
        agg.on_batch(&[event(1, 1)]);
        assert_eq!(agg.counter(1, 1), Some(2));
        agg.reset_counters();
        assert_eq!(agg.counter(1, 1), Some(0));
    }

    #[test]
    fn frame_end_writes_group_attributes() {
        let mut agg = HitAggregator::new(MemoryStore::new());
        agg.set_group("/step_0002");
        agg.set_frame_base(1);
        agg.set_parameter(10.0);
        agg.begin_session();
        agg.on_frame_start(0);
        agg.on_batch(&[event(1, 2), event(3, 4)]);
        let info = FrameInfo {
            sent_pixels: 2,
            received_pixels: 2,
            lost_pixels: 0,
            start_time: 0,
            end_time: 1000,
            completed: true,
        };
        agg.on_frame_end(0, true, &info);

        let store = agg.store();
        assert!(store.has_group("step_0002/frame_1"));
        assert_eq!(
            store.attribute("/step_0002/frame_1", "state"),
            Some(&AttrValue::Text("completed".into()))
        );
        assert_eq!(
            store.attribute("/step_0002/frame_1", "hits"),
            Some(&AttrValue::UInt(2))
        );
        assert!(store.hits().iter().all(|r| r.parameter == 10.0));
        assert_eq!(agg.last_frame().map(|f| f.hits), Some(2));
    }

    struct FailingStore;

    impl HitStore for FailingStore {
        fn append_hits(&mut self, _rows: &[PixelHitRow]) -> DaqResult<()> {
            Err(DaqError::Storage("disk full".into()))
        }
        fn hit_count(&self) -> u64 {
            0
        }
        fn create_sweep_table(&mut self, _len: usize) -> DaqResult<()> {
            Ok(())
        }
        fn sweep_capacity(&self) -> usize {
            0
        }
        fn write_sweep_at(&mut self, _index: usize, _row: &SweepResultRow) -> DaqResult<()> {
            Ok(())
        }
        fn create_or_open_group(&mut self, _path: &str) -> DaqResult<()> {
            Ok(())
        }
        fn set_attribute(&mut self, _target: &str, _key: &str, _value: AttrValue) -> DaqResult<()> {
            Ok(())
        }
        fn close(&mut self) -> DaqResult<()> {
            Ok(())
        }
    }

    #[test]
    fn first_store_error_is_kept() {
        let mut agg = HitAggregator::new(FailingStore);
        agg.begin_session();
        agg.on_frame_start(0);
        agg.on_batch(&[event(1, 1)]);
        agg.on_batch(&[event(2, 2)]);

        assert_eq!(agg.session_hits(), 2);
        let err = agg.take_store_error().unwrap();
        assert_eq!(err.exit_code(), 7);
        assert!(agg.take_store_error().is_none());
    }
}
