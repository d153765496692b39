//! Threshold and bias sweeps.
//!
//! A sweep steps one hardware parameter across a closed range and runs one or
//! more acquisition sessions per step:
//!
//! ```text
//! Idle -> (ApplyParameter -> RunFrames -> RecordResult)* -> Idle
//! ```
//!
//! The number of steps is computed once from the closed form
//! `floor((end - start) / step) + 1` and step values are derived from the
//! integer step index, so table sizing and iteration can never disagree.
//! Results go to a preallocated table at an explicit, monotonically
//! incremented measurement index; skipped targets consume no slot.
//!
//! # Example
//!
//! ```rust
//! use tpx_daq::sweep::{SweepRange, ThresholdQuantizer};
//!
//! let range = SweepRange::new(0.0, 10.0, 3.0).unwrap();
//! assert_eq!(range.total_steps(), 4);
//!
//! let q = ThresholdQuantizer::default().quantize(125.3);
//! assert_eq!((q.coarse, q.fine), (1, 91));
//! assert_eq!(q.applied, 125.5);
//! ```

use crate::acquisition::{AcquisitionDriver, SessionBuffers};
use crate::aggregator::HitAggregator;
use crate::config::{
    AcquisitionConfig, CounterScope, Dacs, SkipBand, SweepSettings, ThresholdUnit,
};
use crate::error::{DaqError, DaqResult};
use crate::hardware::{AcquisitionState, Connector, DeviceSession};
use crate::storage::{AttrValue, HitStore, SweepResultRow};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Slack added before flooring the step count so that ranges such as
/// `0..1 step 0.1` include their end point.
const STEP_EPSILON: f64 = 1e-9;

/// Largest number of steps a single range may have.
pub const MAX_SWEEP_STEPS: usize = 1_000_000;

/// Largest sweep table, in rows (steps times frames per step).
pub const MAX_SWEEP_ROWS: usize = 10_000_000;

/// Closed parameter range iterated by integer step index.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SweepRange {
    start: f64,
    end: f64,
    step: f64,
    steps: usize,
}

impl SweepRange {
    /// Validate and build a range. `step` must be positive, `end >= start`,
    /// and the range may hold at most [`MAX_SWEEP_STEPS`] steps.
    pub fn new(start: f64, end: f64, step: f64) -> DaqResult<Self> {
        if !(start.is_finite() && end.is_finite() && step.is_finite()) {
            return Err(DaqError::Config("sweep bounds must be finite".into()));
        }
        if step <= 0.0 {
            return Err(DaqError::Config(format!("sweep step must be positive, got {step}")));
        }
        if end < start {
            return Err(DaqError::Config(format!(
                "sweep end {end} is below start {start}"
            )));
        }
        let intervals = ((end - start) / step + STEP_EPSILON).floor();
        if !intervals.is_finite() || intervals >= MAX_SWEEP_STEPS as f64 {
            return Err(DaqError::Config(format!(
                "sweep {start}..{end} step {step} exceeds {MAX_SWEEP_STEPS} steps"
            )));
        }
        Ok(Self {
            start,
            end,
            step,
            steps: intervals as usize + 1,
        })
    }

    /// First value.
    pub fn start(&self) -> f64 {
        self.start
    }

    /// Last requested value.
    pub fn end(&self) -> f64 {
        self.end
    }

    /// Step size.
    pub fn step(&self) -> f64 {
        self.step
    }

    /// Number of steps, computed once in closed form by [`SweepRange::new`].
    pub fn total_steps(&self) -> usize {
        self.steps
    }

    /// Value of step `index`.
    pub fn value_at(&self, index: usize) -> f64 {
        self.start + index as f64 * self.step
    }

    /// All step values in order.
    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        (0..self.total_steps()).map(|i| self.value_at(i))
    }
}

/// Coarse and fine threshold codes with the voltage they produce.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QuantizedThreshold {
    /// Coarse DAC code
    pub coarse: u16,
    /// Fine DAC code
    pub fine: u16,
    /// Threshold actually applied, in mV
    pub applied: f64,
}

/// Maps a threshold in mV to the two-stage threshold DAC.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ThresholdQuantizer {
    /// Millivolts per coarse code
    pub coarse_step_mv: f64,
    /// Largest coarse code
    pub max_coarse: u16,
    /// Millivolts per fine code
    pub fine_step_mv: f64,
    /// Largest fine code
    pub max_fine: u16,
}

impl Default for ThresholdQuantizer {
    fn default() -> Self {
        Self {
            coarse_step_mv: 80.0,
            max_coarse: Dacs::MAX_THRESHOLD_COARSE,
            fine_step_mv: 0.5,
            max_fine: Dacs::MAX_THRESHOLD_FINE,
        }
    }
}

impl ThresholdQuantizer {
    /// Largest representable threshold.
    pub fn max_mv(&self) -> f64 {
        f64::from(self.max_coarse) * self.coarse_step_mv + f64::from(self.max_fine) * self.fine_step_mv
    }

    /// Threshold produced by a coarse code and a (possibly fractional) fine code.
    pub fn millivolts(&self, coarse: u16, fine: f64) -> f64 {
        f64::from(coarse) * self.coarse_step_mv + fine * self.fine_step_mv
    }

    /// Quantize `target_mv`, clamping both codes to the hardware limits.
    pub fn quantize(&self, target_mv: f64) -> QuantizedThreshold {
        let coarse = (target_mv / self.coarse_step_mv)
            .floor()
            .clamp(0.0, f64::from(self.max_coarse));
        let fine = ((target_mv - coarse * self.coarse_step_mv) / self.fine_step_mv)
            .round()
            .clamp(0.0, f64::from(self.max_fine));
        QuantizedThreshold {
            coarse: coarse as u16,
            fine: fine as u16,
            applied: coarse * self.coarse_step_mv + fine * self.fine_step_mv,
        }
    }
}

/// The hardware parameter a sweep varies.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SweepParameter {
    /// Threshold in mV, quantized into coarse and fine codes.
    ThresholdMillivolts {
        /// Quantizer
        quantizer: ThresholdQuantizer,
    },
    /// Raw fine threshold code with a fixed coarse code.
    ThresholdFineCode {
        /// Coarse code held for the whole sweep
        coarse: u16,
    },
    /// Sensor bias in volts.
    BiasVolts {
        /// Bias supply channel
        channel: u8,
    },
}

impl SweepParameter {
    /// Name recorded in the store.
    pub fn name(&self) -> &'static str {
        match self {
            SweepParameter::ThresholdMillivolts { .. } => "threshold_mv",
            SweepParameter::ThresholdFineCode { .. } => "threshold_fine_code",
            SweepParameter::BiasVolts { .. } => "bias_v",
        }
    }

    /// Value of `target` in the unit skip bands are given in: mV for both
    /// threshold parameters, V for bias.
    pub fn skip_value(&self, target: f64) -> f64 {
        match *self {
            SweepParameter::ThresholdFineCode { coarse } => {
                ThresholdQuantizer::default().millivolts(coarse, target)
            }
            SweepParameter::ThresholdMillivolts { .. } | SweepParameter::BiasVolts { .. } => target,
        }
    }

    /// Resolve one step target into what will be applied.
    pub fn coordinate(&self, step_index: usize, target: f64) -> SweepCoordinate {
        match *self {
            SweepParameter::ThresholdMillivolts { quantizer } => {
                let q = quantizer.quantize(target);
                SweepCoordinate {
                    step_index,
                    target,
                    applied: q.applied,
                    coarse: Some(q.coarse),
                    fine: Some(q.fine),
                }
            }
            SweepParameter::ThresholdFineCode { coarse } => {
                let fine = target
                    .round()
                    .clamp(0.0, f64::from(Dacs::MAX_THRESHOLD_FINE));
                SweepCoordinate {
                    step_index,
                    target,
                    applied: fine,
                    coarse: Some(coarse),
                    fine: Some(fine as u16),
                }
            }
            SweepParameter::BiasVolts { .. } => SweepCoordinate {
                step_index,
                target,
                applied: target,
                coarse: None,
                fine: None,
            },
        }
    }
}

/// One resolved sweep step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SweepCoordinate {
    /// Index of the step in the unskipped range
    pub step_index: usize,
    /// Requested value
    pub target: f64,
    /// Value applied after quantization
    pub applied: f64,
    /// Coarse threshold code, threshold sweeps only
    pub coarse: Option<u16>,
    /// Fine threshold code, threshold sweeps only
    pub fine: Option<u16>,
}

/// What to sweep and over which values.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepPlan {
    /// Swept parameter
    pub parameter: SweepParameter,
    /// Target range
    pub range: SweepRange,
    /// Target bands that are skipped
    pub skip: Vec<SkipBand>,
    /// Acquisition sessions per step
    pub frames_per_step: u32,
}

impl SweepPlan {
    /// Threshold sweep from the configured settings.
    pub fn threshold(settings: &SweepSettings) -> DaqResult<Self> {
        let t = &settings.threshold;
        let parameter = match t.unit {
            ThresholdUnit::Millivolts => SweepParameter::ThresholdMillivolts {
                quantizer: ThresholdQuantizer::default(),
            },
            ThresholdUnit::FineCode => SweepParameter::ThresholdFineCode { coarse: t.coarse },
        };
        let plan = Self {
            parameter,
            range: SweepRange::new(t.start, t.end, t.step)?,
            skip: t.skip.clone(),
            frames_per_step: settings.frames_per_step,
        };
        plan.capacity()?;
        Ok(plan)
    }

    /// Bias sweep from the configured settings.
    pub fn bias(settings: &SweepSettings) -> DaqResult<Self> {
        let b = &settings.bias;
        let plan = Self {
            parameter: SweepParameter::BiasVolts { channel: b.channel },
            range: SweepRange::new(b.start, b.end, b.step)?,
            skip: b.skip.clone(),
            frames_per_step: settings.frames_per_step,
        };
        plan.capacity()?;
        Ok(plan)
    }

    /// Whether `target` falls in a skip band.
    pub fn is_skipped(&self, target: f64) -> bool {
        let value = self.parameter.skip_value(target);
        self.skip.iter().any(|band| band.contains(value))
    }

    /// Rows preallocated for the sweep table: every step times frames per step.
    pub fn capacity(&self) -> DaqResult<usize> {
        self.range
            .total_steps()
            .checked_mul(self.frames_per_step as usize)
            .filter(|rows| *rows <= MAX_SWEEP_ROWS)
            .ok_or_else(|| {
                DaqError::Config(format!(
                    "sweep table of {} steps x {} frames exceeds {MAX_SWEEP_ROWS} rows",
                    self.range.total_steps(),
                    self.frames_per_step
                ))
            })
    }

    /// Steps that will run, in order, skipped targets removed.
    pub fn schedule(&self) -> Vec<SweepCoordinate> {
        (0..self.range.total_steps())
            .filter_map(|i| {
                let target = self.range.value_at(i);
                if self.is_skipped(target) {
                    debug!(step = i, target, "Target inside skip band");
                    None
                } else {
                    Some(self.parameter.coordinate(i, target))
                }
            })
            .collect()
    }
}

/// Outcome of a sweep.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepReport {
    /// Swept parameter name
    pub parameter: &'static str,
    /// Steps in the full range
    pub total_steps: usize,
    /// Steps removed by skip bands
    pub skipped_steps: usize,
    /// Steps that failed with a session error
    pub failed_steps: usize,
    /// Preallocated sweep table rows
    pub capacity: usize,
    /// Sweep table rows written
    pub rows_written: usize,
    /// Rows whose session did not complete all frames
    pub incomplete_frames: usize,
    /// Hits accepted over the whole sweep
    pub total_hits: u64,
    /// Wall-clock duration
    pub duration: Duration,
}

#[derive(Debug, Default)]
struct Progress {
    rows_written: usize,
    failed_steps: usize,
    incomplete_frames: usize,
    total_hits: u64,
}

/// Runs a [`SweepPlan`] against a device and a store.
#[derive(Debug, Clone)]
pub struct SweepController {
    plan: SweepPlan,
    settings: SweepSettings,
    driver: AcquisitionDriver,
    abort: Arc<AtomicBool>,
}

impl SweepController {
    /// Controller for `plan`, timing and failure policy from `settings`.
    pub fn new(plan: SweepPlan, settings: &SweepSettings, buffers: SessionBuffers) -> Self {
        let abort = Arc::new(AtomicBool::new(false));
        Self {
            plan,
            settings: settings.clone(),
            driver: AcquisitionDriver::new(buffers).with_abort(Arc::clone(&abort)),
            abort,
        }
    }

    /// Use an externally owned abort flag.
    pub fn with_abort(mut self, flag: Arc<AtomicBool>) -> Self {
        self.driver = self.driver.with_abort(Arc::clone(&flag));
        self.abort = flag;
        self
    }

    /// Flag that stops the sweep when set, at the latest on the next frame
    /// boundary of a running session.
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }

    /// The plan being run.
    pub fn plan(&self) -> &SweepPlan {
        &self.plan
    }

    /// Run the sweep. The store is closed on every path, after the number of
    /// rows written has been recorded as the `rows_written` root attribute.
    pub fn run<C, S>(
        &self,
        device: &mut DeviceSession<C>,
        base: &AcquisitionConfig,
        store: S,
    ) -> DaqResult<SweepReport>
    where
        C: Connector,
        S: HitStore + Send,
    {
        let started = Instant::now();
        let mut aggregator = HitAggregator::new(store).with_scope(self.settings.counter_scope);
        let mut progress = Progress::default();

        let outcome = self.execute(device, base, &mut aggregator, &mut progress);
        let closed = finish(aggregator.store_mut(), &progress);

        let outcome = match (outcome, closed) {
            (Ok(report), Ok(())) => Ok(report),
            (Ok(_), Err(close_err)) => Err(close_err),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(close_err)) => {
                error!(error = %close_err, "Failed to close store after sweep failure");
                Err(e)
            }
        };

        match outcome {
            Ok(mut report) => {
                report.duration = started.elapsed();
                info!(
                    parameter = report.parameter,
                    rows = report.rows_written,
                    failed_steps = report.failed_steps,
                    hits = report.total_hits,
                    duration_s = report.duration.as_secs_f64(),
                    "Sweep finished"
                );
                Ok(report)
            }
            Err(e) => {
                error!(error = %e, rows = progress.rows_written, "Sweep stopped");
                Err(e)
            }
        }
    }

    fn execute<C, S>(
        &self,
        device: &mut DeviceSession<C>,
        base: &AcquisitionConfig,
        aggregator: &mut HitAggregator<S>,
        progress: &mut Progress,
    ) -> DaqResult<SweepReport>
    where
        C: Connector,
        S: HitStore + Send,
    {
        let total_steps = self.plan.range.total_steps();
        let capacity = self.plan.capacity()?;
        let schedule = self.plan.schedule();
        let skipped_steps = total_steps - schedule.len();

        let store = aggregator.store_mut();
        store.create_sweep_table(capacity)?;
        let range = &self.plan.range;
        let root: [(&str, AttrValue); 7] = [
            ("sweep_start", range.start().into()),
            ("sweep_end", range.end().into()),
            ("sweep_step", range.step().into()),
            ("frames_per_step", self.plan.frames_per_step.into()),
            ("total_steps", total_steps.into()),
            ("skipped_steps", skipped_steps.into()),
            ("parameter", self.plan.parameter.name().into()),
        ];
        for (key, value) in root {
            store.set_attribute("/", key, value)?;
        }
        match device.telemetry() {
            Ok(telemetry) => {
                if let Ok(chip_id) = &telemetry.chip_id {
                    store.set_attribute("/", "chip_id", chip_id.as_str().into())?;
                }
            }
            Err(e) => warn!(error = %e, "Chip id unavailable"),
        }

        info!(
            parameter = self.plan.parameter.name(),
            start = range.start(),
            end = range.end(),
            step = range.step(),
            total_steps,
            skipped_steps,
            capacity,
            "Sweep started"
        );

        let sweep_config = AcquisitionConfig {
            frames: 1,
            frame_time_ns: self.settings.frame_time_ns,
            ..base.clone()
        };
        if let SweepParameter::BiasVolts { .. } = self.plan.parameter {
            device.configure(&sweep_config)?;
        }

        let mut consecutive_failures = 0u32;
        for coord in &schedule {
            match self.run_step(device, &sweep_config, aggregator, coord, capacity, progress) {
                Ok(()) => consecutive_failures = 0,
                Err(e) if e.is_step_local() => {
                    consecutive_failures += 1;
                    progress.failed_steps += 1;
                    warn!(
                        step = coord.step_index,
                        target = coord.target,
                        error = %e,
                        consecutive_failures,
                        "Sweep step failed"
                    );
                    if consecutive_failures >= self.settings.max_consecutive_failures.max(1) {
                        error!(
                            consecutive_failures,
                            "Too many consecutive failed steps, aborting sweep"
                        );
                        return Err(e);
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Ok(SweepReport {
            parameter: self.plan.parameter.name(),
            total_steps,
            skipped_steps,
            failed_steps: progress.failed_steps,
            capacity,
            rows_written: progress.rows_written,
            incomplete_frames: progress.incomplete_frames,
            total_hits: progress.total_hits,
            duration: Duration::ZERO,
        })
    }

    fn run_step<C, S>(
        &self,
        device: &mut DeviceSession<C>,
        sweep_config: &AcquisitionConfig,
        aggregator: &mut HitAggregator<S>,
        coord: &SweepCoordinate,
        capacity: usize,
        progress: &mut Progress,
    ) -> DaqResult<()>
    where
        C: Connector,
        S: HitStore + Send,
    {
        if self.abort.load(Ordering::SeqCst) {
            warn!(step = coord.step_index, "Sweep aborted by operator");
            return Err(DaqError::Aborted);
        }

        let group = format!("/step_{:04}", coord.step_index);
        let store = aggregator.store_mut();
        store.create_or_open_group(&group)?;
        store.set_attribute(&group, "target", coord.target.into())?;
        store.set_attribute(&group, "applied", coord.applied.into())?;
        if let (Some(coarse), Some(fine)) = (coord.coarse, coord.fine) {
            store.set_attribute(&group, "coarse", coarse.into())?;
            store.set_attribute(&group, "fine", fine.into())?;
        }

        match self.plan.parameter {
            SweepParameter::BiasVolts { channel } => {
                device.set_bias(channel, coord.applied)?;
                std::thread::sleep(self.settings.bias_settle_delay);
            }
            SweepParameter::ThresholdMillivolts { .. } | SweepParameter::ThresholdFineCode { .. } => {
                let mut config = sweep_config.clone();
                config.dacs.vthreshold_coarse = coord.coarse.unwrap_or(config.dacs.vthreshold_coarse);
                config.dacs.vthreshold_fine = coord.fine.unwrap_or(config.dacs.vthreshold_fine);
                device.configure(&config)?;
                std::thread::sleep(self.settings.settle_delay);
            }
        }
        info!(
            step = coord.step_index,
            target = coord.target,
            applied = coord.applied,
            coarse = coord.coarse,
            fine = coord.fine,
            "Sweep parameter applied"
        );

        if self.settings.telemetry_per_step {
            self.record_temperatures(device, aggregator.store_mut(), &group);
        }

        if self.settings.counter_scope == CounterScope::SweepStep {
            aggregator.reset_counters();
        }
        aggregator.set_parameter(coord.applied);
        aggregator.set_group(group.as_str());

        for frame in 0..self.plan.frames_per_step {
            if self.abort.load(Ordering::SeqCst) {
                warn!(step = coord.step_index, frame, "Sweep aborted by operator");
                return Err(DaqError::Aborted);
            }
            if frame > 0 {
                std::thread::sleep(self.settings.settle_delay);
            }

            aggregator.set_frame_base(frame);
            let report = self.driver.run(device, aggregator)?;
            if report.state == AcquisitionState::Aborted {
                warn!(step = coord.step_index, frame, "Sweep aborted during acquisition");
                return Err(DaqError::Aborted);
            }
            let completed = report.is_complete();
            if !completed {
                progress.incomplete_frames += 1;
            }
            progress.total_hits += report.total_hits;

            let index = progress.rows_written;
            if index >= capacity {
                return Err(DaqError::Indexing { index, capacity });
            }
            let row = SweepResultRow {
                target: coord.target,
                applied: coord.applied,
                frame_index: frame,
                hits: report.total_hits,
                completed,
            };
            aggregator.store_mut().write_sweep_at(index, &row)?;
            progress.rows_written += 1;

            info!(
                index,
                step = coord.step_index,
                frame,
                applied = coord.applied,
                hits = report.total_hits,
                completed,
                "Sweep measurement recorded"
            );
        }
        Ok(())
    }

    fn record_temperatures<C: Connector, S: HitStore>(
        &self,
        device: &mut DeviceSession<C>,
        store: &mut S,
        group: &str,
    ) {
        let telemetry = match device.telemetry() {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "Telemetry unavailable for step");
                return;
            }
        };
        let readings = [
            ("readout_temp_c", &telemetry.readout_temp_c),
            ("sensor_temp_c", &telemetry.sensor_temp_c),
        ];
        for (key, reading) in readings {
            match reading {
                Ok(celsius) => {
                    if let Err(e) = store.set_attribute(group, key, (*celsius).into()) {
                        warn!(key, error = %e, "Failed to record temperature");
                    }
                }
                Err(e) => warn!(key, error = %e, "Temperature query failed"),
            }
        }
    }
}

fn finish<S: HitStore>(store: &mut S, progress: &Progress) -> DaqResult<()> {
    let recorded = store
        .set_attribute("/", "rows_written", progress.rows_written.into())
        .and_then(|()| store.set_attribute("/", "failed_steps", progress.failed_steps.into()));
    let closed = store.close();
    recorded.and(closed)
}
