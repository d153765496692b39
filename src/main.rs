//! CLI entry point for tpx_daq.
//!
//! Subcommands:
//! - `acquire`: one acquisition session into a `pixel_data_*.h5` file
//! - `threshold-scan`: threshold sweep into a `thl_calibration_*.h5` file
//! - `bias-scan`: bias sweep into a `bias_scan_*.h5` file
//! - `telemetry`: print chip id, link status, temperatures and self-test
//! - `show-config`: print the merged configuration as TOML
//!
//! The process exit code follows [`DaqError::exit_code`]; invalid command
//! lines exit with 64.
//!
//! # Usage
//!
//! ```bash
//! tpx_daq --simulate --storage memory threshold-scan --start 0 --end 500 --step 5
//! tpx_daq --config config/tpx_daq.toml acquire --frames 10
//! ```

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tpx_daq::acquisition::AcquisitionDriver;
use tpx_daq::aggregator::HitAggregator;
use tpx_daq::config::{AcquisitionMode, AppConfig, ReadoutMode, StorageBackend, ThresholdUnit};
use tpx_daq::error::{DaqError, SessionStage};
use tpx_daq::hardware::mock::{HitModel, SimulatedReadout, SimulatorConfig};
use tpx_daq::hardware::{AcquisitionState, DeviceSession};
use tpx_daq::logging::{self, OutputFormat};
use tpx_daq::storage::{open_store, AttrValue, HitStore, RunKind};
use tpx_daq::sweep::{SweepController, SweepPlan, SweepReport};
use tracing::{error, info, warn};

/// Exit code for an unusable command line.
const EXIT_USAGE: i32 = 64;

#[derive(Parser)]
#[command(name = "tpx_daq", version)]
#[command(about = "Timepix3 acquisition and threshold/bias sweeps", long_about = None)]
struct Cli {
    /// Configuration file (defaults to config/tpx_daq.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log output format
    #[arg(long, global = true, value_enum)]
    log_format: Option<OutputFormat>,

    /// Use the simulated readout instead of hardware
    #[arg(long, global = true)]
    simulate: bool,

    /// Output backend
    #[arg(long, global = true, value_enum)]
    storage: Option<StorageBackend>,

    /// Output directory
    #[arg(long, global = true)]
    output_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one acquisition session
    Acquire {
        /// Frames to acquire
        #[arg(long)]
        frames: Option<u32>,
        /// Frame time in nanoseconds
        #[arg(long)]
        frame_time_ns: Option<f64>,
        /// Sensor bias in volts
        #[arg(long)]
        bias: Option<f64>,
        /// Acquisition mode
        #[arg(long, value_enum)]
        mode: Option<AcquisitionMode>,
        /// Readout mode
        #[arg(long, value_enum)]
        readout: Option<ReadoutMode>,
        /// Pixel configuration file (.bmc or .bpc)
        #[arg(long)]
        pixel_config: Option<PathBuf>,
    },

    /// Sweep the discrimination threshold
    ThresholdScan {
        /// First threshold
        #[arg(long)]
        start: Option<f64>,
        /// Last threshold
        #[arg(long)]
        end: Option<f64>,
        /// Threshold step
        #[arg(long)]
        step: Option<f64>,
        /// Sessions per step
        #[arg(long)]
        frames_per_step: Option<u32>,
        /// Interpret the range as raw fine DAC codes instead of millivolts
        #[arg(long)]
        fine_code: bool,
    },

    /// Sweep the sensor bias voltage
    BiasScan {
        /// First bias in volts
        #[arg(long)]
        start: Option<f64>,
        /// Last bias in volts
        #[arg(long)]
        end: Option<f64>,
        /// Bias step in volts
        #[arg(long)]
        step: Option<f64>,
        /// Bias supply channel
        #[arg(long)]
        channel: Option<u8>,
        /// Sessions per step
        #[arg(long)]
        frames_per_step: Option<u32>,
    },

    /// Query device telemetry
    Telemetry {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
        /// Exit with the query's error code when any query fails
        #[arg(long)]
        strict: bool,
    },

    /// Print the merged configuration
    ShowConfig,
}

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() { EXIT_USAGE } else { 0 };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %format!("{e:#}"), "tpx_daq failed");
            eprintln!("Error: {e:#}");
            e.downcast_ref::<DaqError>().map_or(1, DaqError::exit_code)
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = AppConfig::load_from(cli.config.as_deref())?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    if let Some(backend) = cli.storage {
        config.storage.backend = backend;
    }
    if let Some(dir) = cli.output_dir {
        config.storage.output_dir = dir;
    }
    apply_command_overrides(&mut config, &cli.command);
    config.validate()?;
    logging::init(&config.logging)?;

    if let Commands::ShowConfig = cli.command {
        let text = toml::to_string_pretty(&config).context("Failed to render configuration")?;
        println!("{text}");
        return Ok(());
    }

    let abort = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&abort);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current session");
            flag.store(true, Ordering::SeqCst);
        }
    });

    let simulate = cli.simulate;
    let command = cli.command;
    tokio::task::spawn_blocking(move || run_blocking(command, &config, simulate, abort))
        .await
        .map_err(|e| anyhow!("Acquisition task failed: {e}"))?
}

fn apply_command_overrides(config: &mut AppConfig, command: &Commands) {
    match command {
        Commands::Acquire {
            frames,
            frame_time_ns,
            bias,
            mode,
            readout,
            pixel_config,
        } => {
            let acq = &mut config.acquisition;
            acq.frames = frames.unwrap_or(acq.frames);
            acq.frame_time_ns = frame_time_ns.unwrap_or(acq.frame_time_ns);
            acq.bias_volts = bias.unwrap_or(acq.bias_volts);
            acq.mode = mode.unwrap_or(acq.mode);
            acq.readout = readout.unwrap_or(acq.readout);
            if let Some(path) = pixel_config {
                acq.pixel_config = Some(path.clone());
            }
        }
        Commands::ThresholdScan {
            start,
            end,
            step,
            frames_per_step,
            fine_code,
        } => {
            let t = &mut config.sweep.threshold;
            t.start = start.unwrap_or(t.start);
            t.end = end.unwrap_or(t.end);
            t.step = step.unwrap_or(t.step);
            if *fine_code {
                t.unit = ThresholdUnit::FineCode;
            }
            config.sweep.frames_per_step = frames_per_step.unwrap_or(config.sweep.frames_per_step);
        }
        Commands::BiasScan {
            start,
            end,
            step,
            channel,
            frames_per_step,
        } => {
            let b = &mut config.sweep.bias;
            b.start = start.unwrap_or(b.start);
            b.end = end.unwrap_or(b.end);
            b.step = step.unwrap_or(b.step);
            b.channel = channel.unwrap_or(b.channel);
            config.sweep.frames_per_step = frames_per_step.unwrap_or(config.sweep.frames_per_step);
        }
        Commands::Telemetry { .. } | Commands::ShowConfig => {}
    }
}

fn connector(simulate: bool) -> Result<SimulatedReadout, DaqError> {
    if !simulate {
        return Err(DaqError::Config(
            "no hardware transport is compiled into this build; pass --simulate".into(),
        ));
    }
    info!("Using simulated readout");
    Ok(SimulatedReadout::new(SimulatorConfig {
        hits: HitModel::ThresholdEdge {
            max_hits: 2000,
            noise_edge_mv: 400.0,
            width_mv: 25.0,
        },
        ..Default::default()
    }))
}

fn run_blocking(
    command: Commands,
    config: &AppConfig,
    simulate: bool,
    abort: Arc<AtomicBool>,
) -> Result<()> {
    let mut device = DeviceSession::new(connector(simulate)?).with_retry_policies(
        config.device.connect_retry.clone(),
        config.sweep.bias_retry.clone(),
    );
    device.connect(&config.device.address)?;

    match command {
        Commands::Acquire { .. } => acquire(&mut device, config, abort),
        Commands::ThresholdScan { .. } => {
            let telemetry = device.telemetry()?;
            if let Ok(chip) = &telemetry.chip_id {
                info!(chip_id = %chip, "Starting threshold scan");
            }
            let acq = &config.acquisition;
            device.set_bias(acq.bias_channel, acq.bias_volts)?;
            let plan = SweepPlan::threshold(&config.sweep)?;
            sweep(&mut device, config, plan, RunKind::ThresholdScan, abort)
        }
        Commands::BiasScan { .. } => {
            let plan = SweepPlan::bias(&config.sweep)?;
            sweep(&mut device, config, plan, RunKind::BiasScan, abort)
        }
        Commands::Telemetry { json, strict } => {
            let telemetry = if strict {
                device.telemetry_strict()?
            } else {
                device.telemetry()?
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&telemetry.to_json())?);
            } else {
                print_telemetry(&telemetry);
            }
            Ok(())
        }
        Commands::ShowConfig => Ok(()),
    }
}

fn acquire(
    device: &mut DeviceSession<SimulatedReadout>,
    config: &AppConfig,
    abort: Arc<AtomicBool>,
) -> Result<()> {
    let telemetry = device.telemetry_strict()?;
    print_telemetry(&telemetry);

    let acq = &config.acquisition;
    device.configure(acq)?;
    device.set_bias(acq.bias_channel, acq.bias_volts)?;

    let (mut store, path) = open_store(&config.storage, RunKind::Acquisition)?;
    let root: [(&str, AttrValue); 5] = [
        ("frames", acq.frames.into()),
        ("frame_time_ns", acq.frame_time_ns.into()),
        ("bias_v", acq.bias_volts.into()),
        ("mode", format!("{:?}", acq.mode).into()),
        ("readout", format!("{:?}", acq.readout).into()),
    ];
    for (key, value) in root {
        store.set_attribute("/", key, value)?;
    }
    if let Ok(chip_id) = &telemetry.chip_id {
        store.set_attribute("/", "chip_id", chip_id.as_str().into())?;
    }
    let mut aggregator = HitAggregator::new(store);
    let driver = AcquisitionDriver::new(config.session.clone()).with_abort(abort);
    let outcome = driver.run(device, &mut aggregator);

    let store = aggregator.store_mut();
    let closed = store.close();
    let report = outcome?;
    closed?;

    println!("Frames:     {} of {} completed", report.completed_frames, report.requested_frames);
    println!("State:      {}", report.state);
    println!("Hits:       {}", report.total_hits);
    println!("Dropped:    {} events, {} raw words", report.dropped_events, report.dropped_measurement_data);
    println!("Duration:   {:.3} s", report.duration.as_secs_f64());
    println!("Throughput: {:.1} hits/s", report.throughput());
    if let Some(path) = path {
        println!("Output:     {}", path.display());
    }

    if report.state == AcquisitionState::Aborted {
        return Err(DaqError::Aborted.into());
    }
    if !report.is_complete() {
        return Err(DaqError::Session {
            stage: SessionStage::Read,
            message: format!(
                "acquisition {} after {} of {} frames",
                report.state, report.completed_frames, report.requested_frames
            ),
        }
        .into());
    }
    Ok(())
}

fn sweep(
    device: &mut DeviceSession<SimulatedReadout>,
    config: &AppConfig,
    plan: SweepPlan,
    kind: RunKind,
    abort: Arc<AtomicBool>,
) -> Result<()> {
    let (store, path) = open_store(&config.storage, kind)?;
    let controller =
        SweepController::new(plan, &config.sweep, config.session.clone()).with_abort(abort);
    let report = controller.run(device, &config.acquisition, store)?;
    print_sweep(&report);
    if let Some(path) = path {
        println!("Output:     {}", path.display());
    }
    Ok(())
}

fn print_sweep(report: &SweepReport) {
    println!("Parameter:  {}", report.parameter);
    println!(
        "Steps:      {} ({} skipped, {} failed)",
        report.total_steps, report.skipped_steps, report.failed_steps
    );
    println!("Rows:       {} of {}", report.rows_written, report.capacity);
    println!("Incomplete: {}", report.incomplete_frames);
    println!("Hits:       {}", report.total_hits);
    println!("Duration:   {:.1} s", report.duration.as_secs_f64());
}

fn print_telemetry(telemetry: &tpx_daq::hardware::Telemetry) {
    fn show<T: std::fmt::Display>(value: &Result<T, tpx_daq::error::LinkError>) -> String {
        match value {
            Ok(v) => v.to_string(),
            Err(e) => format!("error: {e}"),
        }
    }
    println!("Chip ID:            {}", show(&telemetry.chip_id));
    match &telemetry.comm_status {
        Ok(status) => println!(
            "Comm status:        lines 0x{:02X}, {} Mbps, chip {}",
            status.comm_lines_mask,
            status.data_rate,
            if status.chip_detected { "detected" } else { "absent" }
        ),
        Err(e) => println!("Comm status:        error: {e}"),
    }
    println!("Readout temp (°C):  {}", show(&telemetry.readout_temp_c));
    println!("Sensor temp (°C):   {}", show(&telemetry.sensor_temp_c));
    println!(
        "Digital test:       {}",
        if telemetry.digital_test.is_ok() { "passed" } else { "failed" }
    );
    println!("ADC channel 0 (V):  {}", show(&telemetry.adc_volts));
}
