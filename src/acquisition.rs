//! Single-session acquisition.
//!
//! [`AcquisitionDriver::run`] executes exactly one bounded acquisition on a
//! configured [`DeviceSession`]:
//!
//! 1. open the transport session with the configured [`SessionBuffers`]
//! 2. arm it with the configured readout and acquisition modes
//! 3. block in `drain` while the producer thread feeds the [`HitAggregator`]
//! 4. finalize the session on every path
//!
//! The outcome is summarized in a [`SessionReport`].

use crate::aggregator::{FrameSnapshot, HitAggregator};
use crate::error::{DaqError, DaqResult, SessionStage};
use crate::hardware::{
    AcquisitionState, Connector, DeviceSession, DrainSummary, FrameInfo, PixelEvent,
    TransportSession,
};
use crate::storage::HitStore;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Receives acquisition notifications.
///
/// Per frame the transport calls `on_frame_start` once, `on_batch` zero or
/// more times, then `on_frame_end` once. Calls arrive from the producer thread
/// but never concurrently.
pub trait FrameHandler {
    /// A frame opened.
    fn on_frame_start(&mut self, frame_index: u32);
    /// Decoded events of the current frame.
    fn on_batch(&mut self, events: &[PixelEvent]);
    /// A frame closed.
    fn on_frame_end(&mut self, frame_index: u32, completed: bool, info: &FrameInfo);
    /// Polled by the transport between frames; `true` ends the drain as
    /// [`AcquisitionState::Aborted`].
    fn should_stop(&self) -> bool {
        false
    }
}

/// Forwards notifications and stops the stream once the abort flag is set.
struct AbortableHandler<'a, H> {
    inner: &'a mut H,
    abort: Option<&'a AtomicBool>,
}

impl<H: FrameHandler> FrameHandler for AbortableHandler<'_, H> {
    fn on_frame_start(&mut self, frame_index: u32) {
        self.inner.on_frame_start(frame_index);
    }

    fn on_batch(&mut self, events: &[PixelEvent]) {
        self.inner.on_batch(events);
    }

    fn on_frame_end(&mut self, frame_index: u32, completed: bool, info: &FrameInfo) {
        self.inner.on_frame_end(frame_index, completed, info);
    }

    fn should_stop(&self) -> bool {
        self.abort.is_some_and(|flag| flag.load(Ordering::SeqCst)) || self.inner.should_stop()
    }
}

/// Resources requested from the transport for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionBuffers {
    /// Raw measurement data buffer in bytes
    pub md_buffer_bytes: usize,
    /// Decoded pixel buffer in events
    pub pixel_buffer_len: usize,
    /// Interval between transport progress reports, zero reports every frame
    #[serde(with = "humantime_serde")]
    pub report_timeout: Duration,
    /// Drain gives up when no frame completes within this time
    #[serde(with = "humantime_serde")]
    pub fail_timeout: Duration,
}

impl Default for SessionBuffers {
    fn default() -> Self {
        Self {
            md_buffer_bytes: 6 * 34_952_533,
            pixel_buffer_len: 65_536,
            report_timeout: Duration::from_millis(500),
            fail_timeout: Duration::from_secs(30),
        }
    }
}

impl SessionBuffers {
    /// Reject empty buffers and a zero fail timeout.
    pub fn validate(&self) -> DaqResult<()> {
        if self.md_buffer_bytes == 0 || self.pixel_buffer_len == 0 {
            return Err(DaqError::Config("session buffers must not be empty".into()));
        }
        if self.fail_timeout.is_zero() {
            return Err(DaqError::Config("session fail_timeout must be positive".into()));
        }
        Ok(())
    }
}

/// Outcome of one acquisition session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionReport {
    /// Frames the configuration asked for
    pub requested_frames: u32,
    /// Frames that reached frame end
    pub completed_frames: u32,
    /// Raw measurement words the transport discarded
    pub dropped_measurement_data: u64,
    /// Terminal state
    pub state: AcquisitionState,
    /// Wall-clock duration from session open to finalize
    pub duration: Duration,
    /// Hits accepted during the session
    pub total_hits: u64,
    /// Events rejected as out of range
    pub dropped_events: u64,
    /// Last completed frame
    pub last_frame: Option<FrameSnapshot>,
}

impl SessionReport {
    /// Accepted hits per second, NaN for a zero duration.
    pub fn throughput(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs > 0.0 {
            self.total_hits as f64 / secs
        } else {
            f64::NAN
        }
    }

    /// Every requested frame completed and the stream ended normally.
    pub fn is_complete(&self) -> bool {
        self.state == AcquisitionState::Succeeded && self.completed_frames == self.requested_frames
    }
}

/// Finalizes the transport session when dropped.
struct FinalizeGuard<'a> {
    session: &'a mut dyn TransportSession,
}

impl Drop for FinalizeGuard<'_> {
    fn drop(&mut self) {
        self.session.finalize();
        debug!("Transport session finalized");
    }
}

/// Runs bounded acquisition sessions.
#[derive(Debug, Clone)]
pub struct AcquisitionDriver {
    buffers: SessionBuffers,
    abort: Option<Arc<AtomicBool>>,
}

impl AcquisitionDriver {
    /// Driver using the given session resources.
    pub fn new(buffers: SessionBuffers) -> Self {
        Self {
            buffers,
            abort: None,
        }
    }

    /// Refuse to open a session once `flag` is set, and stop a running
    /// session at the next frame boundary.
    pub fn with_abort(mut self, flag: Arc<AtomicBool>) -> Self {
        self.abort = Some(flag);
        self
    }

    /// Session resources.
    pub fn buffers(&self) -> &SessionBuffers {
        &self.buffers
    }

    fn aborted(&self) -> bool {
        self.abort
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    /// Run one session on a configured device, feeding `aggregator`.
    ///
    /// A session that ends without completing its frames, including one
    /// stopped through the abort flag, is reported through
    /// [`SessionReport::state`], not as an error. Errors are returned for
    /// transport stage failures and for the first store failure seen by the
    /// aggregator.
    pub fn run<C, S>(
        &self,
        device: &mut DeviceSession<C>,
        aggregator: &mut HitAggregator<S>,
    ) -> DaqResult<SessionReport>
    where
        C: Connector,
        S: HitStore + Send,
    {
        if self.aborted() {
            return Err(DaqError::Aborted);
        }

        let started = Instant::now();
        aggregator.begin_session();
        let (requested_frames, summary) = device.with_session(&self.buffers, |config, session| {
            let mut guard = FinalizeGuard { session };
            guard
                .session
                .begin(config, config.readout, config.mode)
                .map_err(|e| DaqError::Session {
                    stage: SessionStage::Begin,
                    message: e.to_string(),
                })?;
            debug!(frames = config.frames, mode = ?config.mode, "Acquisition armed");

            let mut handler = AbortableHandler {
                inner: &mut *aggregator,
                abort: self.abort.as_deref(),
            };
            let summary: DrainSummary =
                guard
                    .session
                    .drain(&mut handler)
                    .map_err(|e| DaqError::Session {
                        stage: SessionStage::Read,
                        message: e.to_string(),
                    })?;
            Ok((config.frames, summary))
        })?;

        if let Some(err) = aggregator.take_store_error() {
            return Err(err);
        }

        let report = SessionReport {
            requested_frames,
            completed_frames: summary.completed_frames,
            dropped_measurement_data: summary.dropped_measurement_data,
            state: summary.state,
            duration: started.elapsed(),
            total_hits: aggregator.session_hits(),
            dropped_events: aggregator.dropped_events(),
            last_frame: aggregator.last_frame().cloned(),
        };

        info!(
            state = %report.state,
            requested_frames = report.requested_frames,
            completed_frames = report.completed_frames,
            hits = report.total_hits,
            dropped_events = report.dropped_events,
            dropped_measurement_data = report.dropped_measurement_data,
            duration_s = report.duration.as_secs_f64(),
            hits_per_s = report.throughput(),
            "Acquisition session finished"
        );
        if let Some(frame) = &report.last_frame {
            debug!(
                frame = frame.index,
                sent = frame.info.sent_pixels,
                received = frame.info.received_pixels,
                lost = frame.info.lost_pixels,
                "Last frame"
            );
        }
        if !report.is_complete() {
            warn!(
                state = %report.state,
                completed_frames = report.completed_frames,
                requested_frames = report.requested_frames,
                "Acquisition did not complete"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AcquisitionConfig;
    use crate::hardware::mock::{HitModel, SimulatedReadout, SimulatorConfig};
    use crate::storage::MemoryStore;

    fn configured(sim: SimulatorConfig, frames: u32) -> DeviceSession<SimulatedReadout> {
        let mut device = DeviceSession::new(SimulatedReadout::new(sim));
        device.connect("sim").unwrap();
        device
            .configure(&AcquisitionConfig {
                frames,
                pixel_config: None,
                ..Default::default()
            })
            .unwrap();
        device
    }

    #[test]
    fn completed_session_reports_all_frames() {
        let sim = SimulatorConfig {
            hits: HitModel::Constant(7),
            ..Default::default()
        };
        let mut device = configured(sim, 3);
        let mut aggregator = HitAggregator::new(MemoryStore::new());

        let report = AcquisitionDriver::new(SessionBuffers::default())
            .run(&mut device, &mut aggregator)
            .unwrap();

        assert!(report.is_complete());
        assert_eq!(report.completed_frames, 3);
        assert_eq!(report.total_hits, 21);
        assert_eq!(aggregator.store().hits().len(), 21);
        assert_eq!(report.last_frame.as_ref().map(|f| f.index), Some(2));
    }

    #[test]
    fn sessions_are_finalized_on_failure() {
        let sim = SimulatorConfig {
            session_faults: vec![(0, SessionStage::Begin), (1, SessionStage::Read)],
            ..Default::default()
        };
        let readout = SimulatedReadout::new(sim);
        let log = readout.log();
        let mut device = DeviceSession::new(readout);
        device.connect("sim").unwrap();
        device
            .configure(&AcquisitionConfig {
                pixel_config: None,
                ..Default::default()
            })
            .unwrap();

        let driver = AcquisitionDriver::new(SessionBuffers::default());
        let mut aggregator = HitAggregator::new(MemoryStore::new());

        let err = driver.run(&mut device, &mut aggregator).unwrap_err();
        assert_eq!(err.exit_code(), 4);
        let err = driver.run(&mut device, &mut aggregator).unwrap_err();
        assert_eq!(err.exit_code(), 5);
        assert!(driver.run(&mut device, &mut aggregator).is_ok());

        let log = log.lock();
        assert_eq!(log.sessions_opened, 3);
        assert_eq!(log.sessions_finalized, 3);
    }

    #[test]
    fn abort_flag_prevents_new_sessions() {
        let mut device = configured(SimulatorConfig::default(), 1);
        let flag = Arc::new(AtomicBool::new(true));
        let driver = AcquisitionDriver::new(SessionBuffers::default()).with_abort(flag);
        let mut aggregator = HitAggregator::new(MemoryStore::new());

        let err = driver.run(&mut device, &mut aggregator).unwrap_err();
        assert_eq!(err.exit_code(), 15);
    }

    #[test]
    fn abort_flag_stops_running_session() {
        let readout = SimulatedReadout::new(SimulatorConfig {
            hits: HitModel::Constant(2),
            stall_after_frames: Some(2),
            ..Default::default()
        });
        let log = readout.log();
        let mut device = DeviceSession::new(readout);
        device.connect("sim").unwrap();
        device
            .configure(&AcquisitionConfig {
                frames: 5,
                pixel_config: None,
                ..Default::default()
            })
            .unwrap();
        let flag = Arc::new(AtomicBool::new(false));
        let driver = AcquisitionDriver::new(SessionBuffers::default()).with_abort(Arc::clone(&flag));
        let mut aggregator = HitAggregator::new(MemoryStore::new());

        // Raise the flag only once the session is open and stalled
        let setter = std::thread::spawn(move || {
            while log.lock().sessions_opened == 0 {
                std::thread::sleep(Duration::from_millis(5));
            }
            std::thread::sleep(Duration::from_millis(50));
            flag.store(true, Ordering::SeqCst);
        });
        let report = driver.run(&mut device, &mut aggregator).unwrap();
        setter.join().unwrap();

        assert_eq!(report.state, AcquisitionState::Aborted);
        assert_eq!(report.completed_frames, 2);
        assert_eq!(report.total_hits, 4);
        assert!(!report.is_complete());
        // Well inside the 30 s fail timeout
        assert!(report.duration < Duration::from_secs(10));
    }

    #[test]
    fn zero_duration_throughput_is_nan() {
        let report = SessionReport {
            requested_frames: 1,
            completed_frames: 1,
            dropped_measurement_data: 0,
            state: AcquisitionState::Succeeded,
            duration: Duration::ZERO,
            total_hits: 10,
            dropped_events: 0,
            last_frame: None,
        };
        assert!(report.throughput().is_nan());
        assert!(report.is_complete());
    }

    #[test]
    fn buffer_defaults() {
        let buffers = SessionBuffers::default();
        assert_eq!(buffers.md_buffer_bytes, 209_715_198);
        assert!(buffers.validate().is_ok());
        let empty = SessionBuffers {
            pixel_buffer_len: 0,
            ..Default::default()
        };
        assert_eq!(empty.validate().unwrap_err().exit_code(), 1);
    }
}
