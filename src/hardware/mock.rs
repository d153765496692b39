//! Simulated readout.
//!
//! Stands in for the network readout in tests and `--simulate` runs. It
//! implements the full transport contract: connection and bias failures that
//! clear after a configurable number of attempts, per-query telemetry failures,
//! and acquisition sessions whose notifications arrive on a dedicated producer
//! thread.
//!
//! Every interaction is recorded in a shared [`SimulatorLog`] so tests can check
//! what the pipeline actually asked of the device (for instance that every
//! opened session was finalized).
//!
//! # Example
//!
//! ```rust
//! use tpx_daq::hardware::mock::{HitModel, SimulatedReadout, SimulatorConfig};
//! use tpx_daq::hardware::DeviceSession;
//!
//! let readout = SimulatedReadout::new(SimulatorConfig {
//!     hits: HitModel::Constant(7),
//!     ..Default::default()
//! });
//! let log = readout.log();
//! let mut device = DeviceSession::new(readout);
//! device.connect("192.168.1.218").unwrap();
//! assert_eq!(log.lock().connect_attempts, 1);
//! ```

use super::{
    encode_chip_id, AcquisitionState, CommStatus, Connector, DrainSummary, FrameInfo,
    PixelEvent, ReadoutLink, TransportSession, SENSOR_HEIGHT, SENSOR_WIDTH,
};
use crate::acquisition::{FrameHandler, SessionBuffers};
use crate::config::{AcquisitionConfig, AcquisitionMode, ReadoutMode};
use crate::error::{LinkError, SessionStage, TelemetryQuery};
use crate::pixel_config::PixelConfig;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Readout clock ticks per simulated frame.
const FRAME_TICKS: u64 = 1 << 20;

/// How often a stalled stream checks whether its handler wants to stop.
const STALL_POLL: Duration = Duration::from_millis(10);

/// How many hits a simulated frame contains.
#[derive(Debug, Clone, PartialEq)]
pub enum HitModel {
    /// Same count every frame.
    Constant(usize),
    /// Noise-dominated count that falls off as the threshold rises above
    /// `noise_edge_mv` (logistic edge of width `width_mv`).
    ThresholdEdge {
        /// Hits per frame far below the edge
        max_hits: usize,
        /// Threshold at which half of `max_hits` remain
        noise_edge_mv: f64,
        /// Edge width
        width_mv: f64,
    },
}

impl HitModel {
    fn hits_for(&self, threshold_mv: f64) -> usize {
        match self {
            HitModel::Constant(n) => *n,
            HitModel::ThresholdEdge {
                max_hits,
                noise_edge_mv,
                width_mv,
            } => {
                let width = width_mv.abs().max(f64::EPSILON);
                let fraction = 1.0 / (1.0 + ((threshold_mv - noise_edge_mv) / width).exp());
                (*max_hits as f64 * fraction).round() as usize
            }
        }
    }
}

/// Behaviour of the simulated readout.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Chip identifier reported by telemetry
    pub chip_id: String,
    /// Connection attempts that fail before one succeeds
    pub connect_failures: u32,
    /// Bias attempts that fail before one succeeds
    pub bias_failures: u32,
    /// Telemetry queries that always fail
    pub failing_queries: Vec<TelemetryQuery>,
    /// Reported readout temperature
    pub readout_temp_c: f32,
    /// Reported sensor temperature
    pub sensor_temp_c: f32,
    /// Reported ADC voltage
    pub adc_volts: f32,
    /// Hits per frame
    pub hits: HitModel,
    /// Events per batch notification
    pub batch_size: usize,
    /// Out-of-range events added to every frame
    pub out_of_range_per_frame: usize,
    /// Stop ending frames once this many have completed; the drain then runs into
    /// its fail timeout
    pub stall_after_frames: Option<u32>,
    /// Sleep for the configured frame time in every frame
    pub realtime: bool,
    /// Sessions (0-based, counted per simulator) that fail at the given stage
    pub session_faults: Vec<(u32, SessionStage)>,
    /// Raw measurement words reported as dropped per session
    pub dropped_measurement_data: u64,
    /// Random seed
    pub seed: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            chip_id: "D4-W0005".to_string(),
            connect_failures: 0,
            bias_failures: 0,
            failing_queries: Vec::new(),
            readout_temp_c: 41.5,
            sensor_temp_c: 28.0,
            adc_volts: 1.2,
            hits: HitModel::Constant(1000),
            batch_size: 500,
            out_of_range_per_frame: 0,
            stall_after_frames: None,
            realtime: false,
            session_faults: Vec::new(),
            dropped_measurement_data: 0,
            seed: 0x7470_7833,
        }
    }
}

/// Everything the simulator was asked to do.
#[derive(Debug, Clone, Default)]
pub struct SimulatorLog {
    /// Connection attempts, successful or not
    pub connect_attempts: u32,
    /// Bias attempts, successful or not
    pub bias_attempts: u32,
    /// Successfully applied biases
    pub bias_history: Vec<(u8, f32)>,
    /// DAC tables, in device order, of every accepted configuration
    pub dac_tables: Vec<[u16; 18]>,
    /// Mode codes of every armed session
    pub mode_codes: Vec<u8>,
    /// Progress reports emitted while draining
    pub progress_reports: u32,
    /// Sessions opened
    pub sessions_opened: u32,
    /// Sessions finalized
    pub sessions_finalized: u32,
    /// Links closed
    pub links_closed: u32,
}

/// Simulated readout connector.
#[derive(Debug, Clone)]
pub struct SimulatedReadout {
    config: SimulatorConfig,
    log: Arc<Mutex<SimulatorLog>>,
}

impl Default for SimulatedReadout {
    fn default() -> Self {
        Self::new(SimulatorConfig::default())
    }
}

impl SimulatedReadout {
    /// Create a simulator.
    pub fn new(config: SimulatorConfig) -> Self {
        Self {
            config,
            log: Arc::new(Mutex::new(SimulatorLog::default())),
        }
    }

    /// Shared interaction log.
    pub fn log(&self) -> Arc<Mutex<SimulatorLog>> {
        Arc::clone(&self.log)
    }
}

impl Connector for SimulatedReadout {
    type Link = SimulatedLink;

    fn connect(&self, address: &str) -> Result<SimulatedLink, LinkError> {
        let mut log = self.log.lock();
        log.connect_attempts += 1;
        if log.connect_attempts <= self.config.connect_failures {
            return Err(LinkError::NotReady(format!("readout at {address} still booting")));
        }
        debug!(address, "Simulated readout connected");
        Ok(SimulatedLink {
            config: self.config.clone(),
            log: Arc::clone(&self.log),
            acquisition: None,
        })
    }
}

/// Open link to the simulated readout.
#[derive(Debug)]
pub struct SimulatedLink {
    config: SimulatorConfig,
    log: Arc<Mutex<SimulatorLog>>,
    acquisition: Option<AcquisitionConfig>,
}

impl SimulatedLink {
    fn query<T>(&self, query: TelemetryQuery, value: T) -> Result<T, LinkError> {
        if self.config.failing_queries.contains(&query) {
            Err(LinkError::Timeout { timeout_ms: 1000 })
        } else {
            Ok(value)
        }
    }

    fn fault(&self, session: u32, stage: SessionStage) -> bool {
        self.config
            .session_faults
            .iter()
            .any(|(index, faulty)| *index == session && *faulty == stage)
    }
}

impl ReadoutLink for SimulatedLink {
    fn chip_id_word(&mut self) -> Result<u32, LinkError> {
        let word = encode_chip_id(&self.config.chip_id)
            .ok_or_else(|| LinkError::Rejected(format!("bad chip id {}", self.config.chip_id)))?;
        self.query(TelemetryQuery::ChipId, word)
    }

    fn comm_status(&mut self) -> Result<CommStatus, LinkError> {
        self.query(
            TelemetryQuery::CommStatus,
            CommStatus {
                comm_lines_mask: 0xFF,
                data_rate: 640,
                chip_detected: true,
            },
        )
    }

    fn readout_temperature(&mut self) -> Result<f32, LinkError> {
        self.query(TelemetryQuery::ReadoutTemperature, self.config.readout_temp_c)
    }

    fn sensor_temperature(&mut self) -> Result<f32, LinkError> {
        self.query(TelemetryQuery::SensorTemperature, self.config.sensor_temp_c)
    }

    fn digital_test(&mut self) -> Result<(), LinkError> {
        self.query(TelemetryQuery::DigitalTest, ())
    }

    fn adc_voltage(&mut self, _channel: u8) -> Result<f32, LinkError> {
        self.query(TelemetryQuery::AdcVoltage, self.config.adc_volts)
    }

    fn set_bias(&mut self, channel: u8, volts: f32) -> Result<(), LinkError> {
        let mut log = self.log.lock();
        log.bias_attempts += 1;
        if log.bias_attempts <= self.config.bias_failures {
            return Err(LinkError::NotReady("bias supply settling".into()));
        }
        log.bias_history.push((channel, volts));
        Ok(())
    }

    fn configure(&mut self, config: &AcquisitionConfig, pixels: &PixelConfig) -> Result<(), LinkError> {
        if pixels.words().is_empty() {
            return Err(LinkError::Rejected("empty pixel configuration".into()));
        }
        self.log.lock().dac_tables.push(config.dacs.to_array());
        self.acquisition = Some(config.clone());
        Ok(())
    }

    fn open_session(
        &mut self,
        buffers: &SessionBuffers,
    ) -> Result<Box<dyn TransportSession + '_>, LinkError> {
        let index = {
            let mut log = self.log.lock();
            log.sessions_opened += 1;
            log.sessions_opened - 1
        };
        if self.fault(index, SessionStage::Init) || buffers.pixel_buffer_len == 0 {
            self.log.lock().sessions_finalized += 1;
            return Err(LinkError::Rejected("session buffer allocation failed".into()));
        }
        Ok(Box::new(SimulatedSession {
            link: self,
            index,
            fail_timeout: buffers.fail_timeout,
            report_interval: buffers.report_timeout,
            armed: None,
            finalized: false,
        }))
    }

    fn close(&mut self) {
        self.log.lock().links_closed += 1;
        debug!("Simulated readout link closed");
    }
}

/// One simulated acquisition session.
pub struct SimulatedSession<'a> {
    link: &'a mut SimulatedLink,
    index: u32,
    fail_timeout: Duration,
    report_interval: Duration,
    armed: Option<(AcquisitionConfig, AcquisitionMode)>,
    finalized: bool,
}

impl TransportSession for SimulatedSession<'_> {
    fn begin(
        &mut self,
        config: &AcquisitionConfig,
        readout: ReadoutMode,
        mode: AcquisitionMode,
    ) -> Result<(), LinkError> {
        if self.link.fault(self.index, SessionStage::Begin) {
            return Err(LinkError::Rejected("acquisition start refused".into()));
        }
        self.link.log.lock().mode_codes.push(mode.code());
        debug!(session = self.index, ?readout, mode_code = mode.code(), "Simulated session armed");
        self.armed = Some((config.clone(), mode));
        Ok(())
    }

    fn drain(&mut self, handler: &mut (dyn FrameHandler + Send)) -> Result<DrainSummary, LinkError> {
        let (config, mode) = self
            .armed
            .clone()
            .ok_or_else(|| LinkError::Rejected("session not armed".into()))?;
        if self.link.fault(self.index, SessionStage::Read) {
            return Err(LinkError::Closed("data socket closed".into()));
        }

        let sim = &self.link.config;
        let threshold_mv = f64::from(config.dacs.vthreshold_coarse) * 80.0
            + f64::from(config.dacs.vthreshold_fine) * 0.5;
        let producer = Producer {
            frames: config.frames,
            hits_per_frame: sim.hits.hits_for(threshold_mv),
            out_of_range: sim.out_of_range_per_frame,
            batch_size: sim.batch_size.max(1),
            stall_after: sim.stall_after_frames,
            frame_delay: if sim.realtime {
                config.frame_time()
            } else {
                Duration::ZERO
            },
            mode,
            seed: sim.seed.wrapping_add(u64::from(self.index)),
            dropped: sim.dropped_measurement_data,
            deadline: Instant::now() + self.fail_timeout,
            report_interval: self.report_interval,
            log: Arc::clone(&self.link.log),
        };

        std::thread::scope(|scope| {
            let worker = std::thread::Builder::new()
                .name("tpx-producer".into())
                .spawn_scoped(scope, move || producer.run(handler))
                .map_err(|e| LinkError::Closed(format!("producer thread: {e}")))?;
            worker
                .join()
                .map_err(|_| LinkError::Closed("producer thread panicked".into()))
        })
    }

    fn finalize(&mut self) {
        if !self.finalized {
            self.finalized = true;
            self.link.log.lock().sessions_finalized += 1;
            trace!(session = self.index, "Simulated session finalized");
        }
    }
}

struct Producer {
    frames: u32,
    hits_per_frame: usize,
    out_of_range: usize,
    batch_size: usize,
    stall_after: Option<u32>,
    frame_delay: Duration,
    mode: AcquisitionMode,
    seed: u64,
    dropped: u64,
    deadline: Instant,
    report_interval: Duration,
    log: Arc<Mutex<SimulatorLog>>,
}

impl Producer {
    fn run(self, handler: &mut (dyn FrameHandler + Send)) -> DrainSummary {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut completed = 0;
        let mut last_report = Instant::now();

        for frame in 0..self.frames {
            if handler.should_stop() {
                debug!(frame, "Simulated stream stopped by handler");
                return self.summary(AcquisitionState::Aborted, completed);
            }
            if Instant::now() >= self.deadline {
                return self.summary(AcquisitionState::TimedOut, completed);
            }
            handler.on_frame_start(frame);

            if self.stall_after.is_some_and(|n| frame >= n) {
                return self.stall(handler, completed);
            }

            let start_time = u64::from(frame) * FRAME_TICKS;
            let events = self.frame_events(&mut rng, start_time);
            for batch in events.chunks(self.batch_size) {
                handler.on_batch(batch);
            }

            if !self.frame_delay.is_zero() {
                let remaining = self.deadline.saturating_duration_since(Instant::now());
                std::thread::sleep(self.frame_delay.min(remaining));
            }

            let info = FrameInfo {
                sent_pixels: events.len() as u64,
                received_pixels: events.len() as u64,
                lost_pixels: 0,
                start_time,
                end_time: start_time + FRAME_TICKS,
                completed: true,
            };
            handler.on_frame_end(frame, true, &info);
            completed += 1;

            if last_report.elapsed() >= self.report_interval {
                self.log.lock().progress_reports += 1;
                debug!(completed, frames = self.frames, "Acquisition progress");
                last_report = Instant::now();
            }
        }

        self.summary(AcquisitionState::Succeeded, completed)
    }

    /// Hold the open frame until the deadline passes or the handler gives up.
    fn stall(&self, handler: &mut (dyn FrameHandler + Send), completed: u32) -> DrainSummary {
        loop {
            if handler.should_stop() {
                debug!(completed, "Stalled stream stopped by handler");
                return self.summary(AcquisitionState::Aborted, completed);
            }
            let remaining = self.deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return self.summary(AcquisitionState::TimedOut, completed);
            }
            std::thread::sleep(remaining.min(STALL_POLL));
        }
    }

    fn summary(&self, state: AcquisitionState, completed_frames: u32) -> DrainSummary {
        DrainSummary {
            state,
            completed_frames,
            dropped_measurement_data: self.dropped,
        }
    }

    fn frame_events(&self, rng: &mut StdRng, start_time: u64) -> Vec<PixelEvent> {
        let mut events = Vec::with_capacity(self.hits_per_frame + self.out_of_range);
        for i in 0..self.hits_per_frame + self.out_of_range {
            let (x, y) = if i < self.hits_per_frame {
                (rng.gen_range(0..SENSOR_WIDTH), rng.gen_range(0..SENSOR_HEIGHT))
            } else {
                (SENSOR_WIDTH + (i as u16 % 16), rng.gen_range(0..SENSOR_HEIGHT))
            };
            let toa = start_time + rng.gen_range(0..FRAME_TICKS);
            let ftoa = rng.gen_range(0..16);
            let mut event = match self.mode {
                AcquisitionMode::ToaTot => PixelEvent::new(x, y, toa, ftoa, rng.gen_range(1..1024)),
                AcquisitionMode::OnlyToa => PixelEvent::new(x, y, toa, ftoa, 0),
                AcquisitionMode::EventItot => PixelEvent::new(x, y, 0, 0, rng.gen_range(1..16_384)),
            };
            if self.mode == AcquisitionMode::EventItot {
                event.event_count = Some(rng.gen_range(1..=5));
            }
            events.push(event);
        }
        events.sort_by_key(|e| e.toa);
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_edge_falls_with_threshold() {
        let model = HitModel::ThresholdEdge {
            max_hits: 1000,
            noise_edge_mv: 400.0,
            width_mv: 20.0,
        };
        assert!(model.hits_for(0.0) > 990);
        assert_eq!(model.hits_for(400.0), 500);
        assert!(model.hits_for(800.0) < 10);
    }

    #[test]
    fn connect_failures_clear_after_budget() {
        let readout = SimulatedReadout::new(SimulatorConfig {
            connect_failures: 1,
            ..Default::default()
        });
        assert!(readout.connect("sim").is_err());
        assert!(readout.connect("sim").is_ok());
    }

    #[test]
    fn session_init_fault_counts_as_finalized() {
        let readout = SimulatedReadout::new(SimulatorConfig {
            session_faults: vec![(0, SessionStage::Init)],
            ..Default::default()
        });
        let log = readout.log();
        let mut link = readout.connect("sim").unwrap();
        assert!(link.open_session(&SessionBuffers::default()).is_err());
        assert!(link.open_session(&SessionBuffers::default()).is_ok());
        let log = log.lock();
        assert_eq!(log.sessions_opened, 2);
        assert_eq!(log.sessions_finalized, 1);
    }

    #[test]
    fn event_itot_frames_carry_event_counts() {
        let producer = Producer {
            frames: 1,
            hits_per_frame: 20,
            out_of_range: 2,
            batch_size: 8,
            stall_after: None,
            frame_delay: Duration::ZERO,
            mode: AcquisitionMode::EventItot,
            seed: 1,
            dropped: 0,
            deadline: Instant::now() + Duration::from_secs(5),
            report_interval: Duration::from_millis(500),
            log: Arc::default(),
        };
        let events = producer.frame_events(&mut StdRng::seed_from_u64(1), 0);
        assert_eq!(events.len(), 22);
        assert!(events.iter().all(|e| e.event_count.is_some()));
        assert_eq!(events.iter().filter(|e| !e.coord.in_bounds()).count(), 2);
    }

    /// Counts frames and asks to stop after `stop_after` of them.
    struct StopAfter {
        frames_ended: u32,
        stop_after: u32,
    }

    impl FrameHandler for StopAfter {
        fn on_frame_start(&mut self, _frame_index: u32) {}
        fn on_batch(&mut self, _events: &[PixelEvent]) {}
        fn on_frame_end(&mut self, _frame_index: u32, _completed: bool, _info: &FrameInfo) {
            self.frames_ended += 1;
        }
        fn should_stop(&self) -> bool {
            self.frames_ended >= self.stop_after
        }
    }

    fn armed_session<'a>(
        link: &'a mut SimulatedLink,
        buffers: &SessionBuffers,
        frames: u32,
    ) -> Box<dyn TransportSession + 'a> {
        let config = AcquisitionConfig {
            frames,
            mode: AcquisitionMode::OnlyToa,
            pixel_config: None,
            ..Default::default()
        };
        let mut session = link.open_session(buffers).unwrap();
        session.begin(&config, config.readout, config.mode).unwrap();
        session
    }

    #[test]
    fn handler_stop_ends_drain_as_aborted() {
        let readout = SimulatedReadout::new(SimulatorConfig {
            hits: HitModel::Constant(3),
            ..Default::default()
        });
        let log = readout.log();
        let mut link = readout.connect("sim").unwrap();
        let mut session = armed_session(&mut link, &SessionBuffers::default(), 10);

        let mut handler = StopAfter {
            frames_ended: 0,
            stop_after: 2,
        };
        let summary = session.drain(&mut handler).unwrap();
        session.finalize();
        drop(session);

        assert_eq!(summary.state, AcquisitionState::Aborted);
        assert_eq!(summary.completed_frames, 2);
        assert_eq!(log.lock().mode_codes, vec![AcquisitionMode::OnlyToa.code()]);
    }

    #[test]
    fn progress_is_reported_per_interval() {
        let readout = SimulatedReadout::new(SimulatorConfig {
            hits: HitModel::Constant(1),
            ..Default::default()
        });
        let log = readout.log();
        let mut link = readout.connect("sim").unwrap();

        // A zero interval reports after every frame
        let every_frame = SessionBuffers {
            report_timeout: Duration::ZERO,
            ..Default::default()
        };
        let mut session = armed_session(&mut link, &every_frame, 4);
        let mut handler = StopAfter {
            frames_ended: 0,
            stop_after: u32::MAX,
        };
        let summary = session.drain(&mut handler).unwrap();
        session.finalize();
        drop(session);
        assert_eq!(summary.state, AcquisitionState::Succeeded);
        assert_eq!(log.lock().progress_reports, 4);

        let hourly = SessionBuffers {
            report_timeout: Duration::from_secs(3600),
            ..Default::default()
        };
        let mut session = armed_session(&mut link, &hourly, 4);
        session.drain(&mut handler).unwrap();
        session.finalize();
        drop(session);
        assert_eq!(log.lock().progress_reports, 4);
    }

    #[test]
    fn configure_records_dac_table() {
        let readout = SimulatedReadout::default();
        let log = readout.log();
        let mut link = readout.connect("sim").unwrap();
        let mut config = AcquisitionConfig::default();
        config.dacs.vthreshold_fine = 300;
        config.dacs.vthreshold_coarse = 9;
        let pixels = PixelConfig::uniform(0);
        link.configure(&config, &pixels).unwrap();

        let log = log.lock();
        assert_eq!(log.dac_tables.len(), 1);
        assert_eq!(log.dac_tables[0], config.dacs.to_array());
        assert_eq!(log.dac_tables[0][5], 300);
        assert_eq!(log.dac_tables[0][6], 9);
    }
}
