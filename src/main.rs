//! motorscope - Command line front end
//!
//! Plans and runs telemetry captures against a motor-control target over its
//! serial debug link, or against the built-in simulator.
//!
//! # Usage
//!
//! Check whether a capture fits the link:
//! ```bash
//! motorscope feasibility idqCmd_q Idq_q -f 20 --duration 2
//! ```
//!
//! Capture from the simulator and dump the dataset:
//! ```bash
//! motorscope --synthetic capture Idq_q OmegaElectrical --hz 1000 --output run.json
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use motorscope::analysis::{estimate, FeasibilityInput};
use motorscope::config::{self, AppConfig, TransportKind};
use motorscope::session::BufferEstimate;
use motorscope::types::{effective_rate_hz, sample_factor_for_hz, sample_period_ms};
use motorscope::{CaptureEngine, ScaledDataset, SessionState};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// How often the capture command refreshes its progress line
const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Parser)]
#[command(name = "motorscope")]
#[command(about = "Capture planning and acquisition for motor-control telemetry", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Also write logs to daily rolling files in this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Use the simulated target instead of the serial link
    #[arg(long, global = true, conflicts_with = "port")]
    synthetic: bool,

    /// Serial port of the debug link
    #[arg(long, global = true)]
    port: Option<String>,

    /// Debug link baud rate
    #[arg(long, global = true)]
    baud: Option<u32>,

    /// Firmware ELF to resolve variable addresses from
    #[arg(long, global = true)]
    elf: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Rate and duration shared by planning and capture
#[derive(clap::Args)]
struct RateArgs {
    /// Control ticks between samples
    #[arg(short = 'f', long = "factor", conflicts_with = "hz")]
    sample_factor: Option<u32>,

    /// Desired sample rate, rounded to the nearest factor
    #[arg(long)]
    hz: Option<f64>,

    /// Capture length in seconds
    #[arg(short, long)]
    duration: Option<f64>,

    /// Allow sample factors below the guard limit
    #[arg(long)]
    allow_fast: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Estimate link load and buffer headroom for a capture
    Feasibility {
        /// Variables by identifier or label (defaults to the configured set)
        variables: Vec<String>,

        #[command(flatten)]
        rate: RateArgs,

        /// Device buffer size in bytes, if known
        #[arg(long)]
        buffer: Option<usize>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Estimate the device's sample buffer size
    ProbeBuffer {
        /// Print the estimate as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run a capture and print or save the scaled dataset
    Capture {
        /// Variables by identifier or label (defaults to the configured set)
        variables: Vec<String>,

        #[command(flatten)]
        rate: RateArgs,

        /// Write the dataset as JSON to this file
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Print the dataset as JSON
        #[arg(long)]
        json: bool,

        /// Probe the buffer size first so the plan includes it
        #[arg(long)]
        probe: bool,
    },

    /// List the variables the target exposes
    Variables,

    /// Convert between sample factor and sample rate
    Rate {
        /// Sample factor to convert
        #[arg(short = 'f', long = "factor", conflicts_with = "hz")]
        sample_factor: Option<u32>,

        /// Sample rate to convert
        #[arg(long)]
        hz: Option<f64>,
    },

    /// Write a config file with the default settings
    InitConfig {
        /// Destination (defaults to the platform config directory)
        path: Option<PathBuf>,

        /// Replace an existing file
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logging(cli.log_dir.as_deref())?;

    match &cli.command {
        Commands::Rate { sample_factor, hz } => return rate(*sample_factor, *hz),
        Commands::InitConfig { path, force } => return init_config(path.as_deref(), *force),
        _ => {}
    }

    let config = load_config(&cli)?;
    match cli.command {
        Commands::Feasibility {
            variables,
            rate,
            buffer,
            json,
        } => feasibility(&config, &variables, &rate, buffer, json),
        Commands::ProbeBuffer { json } => probe_buffer(&config, json),
        Commands::Capture {
            variables,
            rate,
            output,
            json,
            probe,
        } => capture(&config, &variables, &rate, output.as_deref(), json, probe),
        Commands::Variables => list_variables(&config),
        Commands::Rate { .. } | Commands::InitConfig { .. } => Ok(()),
    }
}

/// Console logging to stderr, plus a rolling file when a directory is given
///
/// The returned guard flushes the file writer and must outlive all logging.
fn init_logging(log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "motorscope.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,motorscope=debug")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    Ok(guard)
}

fn load_config(cli: &Cli) -> Result<AppConfig> {
    let mut config = match &cli.config {
        Some(path) => AppConfig::load_from(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => AppConfig::load_or_default(),
    };

    if cli.synthetic {
        config.link.transport = TransportKind::Synthetic;
    }
    if let Some(port) = &cli.port {
        config.link.transport = TransportKind::Serial;
        config.link.port = Some(port.clone());
    }
    if let Some(baud) = cli.baud {
        config.link.baud_rate = baud;
    }
    if let Some(elf) = &cli.elf {
        config.link.elf_path = Some(elf.clone());
    }
    config.validate()?;
    Ok(config)
}

fn resolve_plan(config: &AppConfig, variables: &[String], rate: &RateArgs) -> (Vec<String>, u32, f64) {
    let names = if variables.is_empty() {
        config.capture.variables.clone()
    } else {
        variables.to_vec()
    };
    let sample_factor = match (rate.sample_factor, rate.hz) {
        (Some(f), _) => f,
        (None, Some(hz)) => sample_factor_for_hz(hz),
        (None, None) => config.capture.sample_factor,
    };
    let duration = rate.duration.unwrap_or(config.capture.duration_seconds);
    (names, sample_factor, duration)
}

fn feasibility(
    config: &AppConfig,
    variables: &[String],
    rate: &RateArgs,
    buffer: Option<usize>,
    json: bool,
) -> Result<()> {
    let (names, sample_factor, duration) = resolve_plan(config, variables, rate);

    // Planning only needs byte widths, so the link is never opened
    let mut bytes_per_sample = 0;
    for name in &names {
        let def = config
            .find_variable(name)
            .with_context(|| format!("Unknown variable {}", name))?;
        bytes_per_sample += def.width.bytes();
    }

    let input = FeasibilityInput::new(bytes_per_sample, sample_factor, config.link.baud_rate, duration)
        .with_buffer(buffer)
        .with_guard_override(rate.allow_fast || config.capture.guard_override);
    let report = estimate(&input);

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!(
        "{} channel(s), f = {}, {:.3} s at {} baud",
        names.len(),
        sample_factor,
        duration,
        config.link.baud_rate
    );
    for note in &report.notes {
        println!("  {}", note);
    }
    println!(
        "Risk: {}, total ≈ {}",
        report.risk,
        config::format_file_size(report.total_bytes.round() as u64)
    );
    Ok(())
}

fn probe_buffer(config: &AppConfig, json: bool) -> Result<()> {
    let engine = CaptureEngine::from_config(config)?;
    engine.prepare_target()?;
    let estimate = engine.probe_buffer().context("Buffer probe failed")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&estimate)?);
    } else {
        print_estimate(&estimate);
    }
    Ok(())
}

fn print_estimate(estimate: &BufferEstimate) {
    println!("Device buffer: {}", estimate);
    if let Some(upper) = estimate.upper() {
        println!("  range {} to {} bytes", estimate.lower(), upper);
    }
}

fn capture(
    config: &AppConfig,
    variables: &[String],
    rate: &RateArgs,
    output: Option<&Path>,
    json: bool,
    probe: bool,
) -> Result<()> {
    let (names, sample_factor, duration) = resolve_plan(config, variables, rate);
    let engine = CaptureEngine::from_config(config)?;
    engine.prepare_target()?;

    if probe {
        match engine.probe_buffer() {
            Ok(estimate) => print_estimate(&estimate),
            Err(e) => eprintln!("Buffer size unknown: {}", e),
        }
    }

    let request = engine
        .build_request(&names, sample_factor, duration)?
        .with_guard_override(rate.allow_fast || config.capture.guard_override);
    let report = engine.get_feasibility(&request);
    eprintln!(
        "{} at {:.0} Hz: {:.1}% of link capacity ({})",
        names.join(", "),
        report.sample_rate_hz,
        report.utilization * 100.0,
        report.risk
    );

    let handle = engine.start_capture(request)?;
    let stop = engine.stop_signal(&handle)?;
    ctrlc::set_handler(move || stop.request()).context("Failed to install Ctrl-C handler")?;

    loop {
        let status = engine.poll_status(&handle)?;
        if status.state.is_terminal() {
            break;
        }
        eprint!(
            "\r{:<9} {:>8} samples  {:>6.2} s",
            status.state,
            status.samples_collected,
            status.elapsed.as_secs_f64()
        );
        std::thread::sleep(PROGRESS_INTERVAL);
    }
    let status = engine.wait(&handle)?;
    eprintln!(
        "\r{:<9} {:>8} samples  {:>6.2} s",
        status.state,
        status.samples_collected,
        status.elapsed.as_secs_f64()
    );

    if status.state == SessionState::Failed {
        let raw = engine.raw_outcome(&handle)?;
        eprintln!(
            "Partial data: {} raw samples, {} complete rows",
            raw.samples.len(),
            raw.series.len()
        );
        let err = engine
            .get_result(&handle)
            .err()
            .map(anyhow::Error::from)
            .unwrap_or_else(|| anyhow::anyhow!("capture failed"));
        engine.discard(&handle)?;
        return Err(err.context("Capture failed"));
    }

    let result = engine.get_result(&handle)?;
    engine.discard(&handle)?;

    eprintln!("Stopped: {}", result.stop_reason);
    if let Some(shortfall) = result.under_delivery {
        eprintln!("Warning: {}", shortfall);
    }
    if result.discarded_samples > 0 {
        eprintln!("Dropped {} samples for unknown channels", result.discarded_samples);
    }

    if let Some(path) = output {
        write_dataset(&result.dataset, path)?;
        eprintln!("Wrote {}", path.display());
    }
    if json {
        println!("{}", serde_json::to_string_pretty(&result.dataset)?);
    } else if output.is_none() {
        print_summary(&result.dataset);
    }
    Ok(())
}

fn write_dataset(dataset: &ScaledDataset, path: &Path) -> Result<()> {
    let file = std::fs::File::create(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    serde_json::to_writer_pretty(std::io::BufWriter::new(file), dataset)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

fn print_summary(dataset: &ScaledDataset) {
    println!(
        "{} samples per channel at {:.1} Hz over {:.3} s (captured {})",
        dataset.len(),
        dataset.sample_rate_hz,
        dataset.span_seconds(),
        dataset.captured_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!(
        "{:<20} {:>12} {:>12} {:>12}  unit",
        "channel", "min", "max", "mean"
    );
    for channel in &dataset.channels {
        println!(
            "{:<20} {:>12.4} {:>12.4} {:>12.4}  {}",
            channel.label,
            channel.min().unwrap_or(f64::NAN),
            channel.max().unwrap_or(f64::NAN),
            channel.mean().unwrap_or(f64::NAN),
            channel.unit
        );
    }
}

fn list_variables(config: &AppConfig) -> Result<()> {
    let engine = CaptureEngine::from_config(config)?;
    println!(
        "{:<36} {:<18} {:>5} {:>10} {:>12}  unit",
        "identifier", "label", "width", "address", "scale"
    );
    for var in engine.registry().iter() {
        println!(
            "{:<36} {:<18} {:>5} {:>10} {:>12}  {}",
            var.identifier, var.label, var.byte_width, var.handle, var.scale_factor, var.unit
        );
    }
    Ok(())
}

fn rate(sample_factor: Option<u32>, hz: Option<f64>) -> Result<()> {
    let sample_factor = match (sample_factor, hz) {
        (Some(0), _) => bail!("sample factor must be at least 1"),
        (Some(f), _) => f,
        (None, Some(hz)) => sample_factor_for_hz(hz),
        (None, None) => bail!("give either --factor or --hz"),
    };
    println!(
        "f = {}: {} Hz, {} ms between samples",
        sample_factor,
        effective_rate_hz(sample_factor),
        sample_period_ms(sample_factor)
    );
    if !motorscope::types::within_rate_guard(sample_factor) {
        println!("Above the guard limit; captures need --allow-fast");
    }
    Ok(())
}

fn init_config(path: Option<&Path>, force: bool) -> Result<()> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => config::config_path().context("Could not determine config path")?,
    };
    if path.exists() && !force {
        bail!("{} already exists (use --force to replace it)", path.display());
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    AppConfig::default().save_to(&path)?;
    println!("Wrote {}", path.display());
    Ok(())
}
