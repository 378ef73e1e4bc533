//! `gpiod` - inspect GPIO chips, drive lines and watch edge events.
//!
//! ```bash
//! gpiod detect
//! gpiod info --chip /dev/gpiochip0 --json
//! gpiod get 4 7
//! gpiod set 4=1 7=0
//! gpiod monitor --bias pull-down --edge rising 2
//! gpiod run --config doorbell.toml
//! gpiod --log-format json monitor 2
//! gpiod check-fallback /dev/gpiochip0 17
//! ```
//!
//! Settings come from `gpiod.toml` and `GPIOD_*` variables, see
//! [`rust_gpiod::config`]. Everything runs on a single-threaded runtime;
//! edge callbacks are delivered on it.

use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use rust_gpiod::logging::{self, OutputFormat, TracingConfig};
use rust_gpiod::{
    build_and_acquire, chips, check_fallback, request_lines, AttributeDescriptor, Bias,
    ChipInterface, GpioChip, GpiodConfig, LineEvent, LineGroup, Pin,
};
use tracing::{debug, info};

#[derive(Parser)]
#[command(name = "gpiod")]
#[command(about = "Linux GPIO character device tool", long_about = None)]
struct Cli {
    /// Configuration file (default: ./gpiod.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Consumer label for requested lines
    #[arg(long, global = true)]
    consumer: Option<String>,

    /// Log line format, overrides the configured one
    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormatArg>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List GPIO chips
    Detect,

    /// Show chip and line information
    Info {
        #[arg(long)]
        chip: Option<PathBuf>,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Read line values
    Get {
        #[arg(long)]
        chip: Option<PathBuf>,
        #[arg(long, value_enum, default_value_t = BiasArg::Disabled)]
        bias: BiasArg,
        #[arg(required = true)]
        offsets: Vec<u32>,
    },

    /// Drive lines until interrupted
    Set {
        #[arg(long)]
        chip: Option<PathBuf>,
        /// OFFSET=VALUE pairs, e.g. 4=1
        #[arg(required = true, value_parser = parse_assignment)]
        values: Vec<(u32, bool)>,
    },

    /// Print edge events until interrupted
    Monitor {
        #[arg(long)]
        chip: Option<PathBuf>,
        #[arg(long, value_enum, default_value_t = BiasArg::Disabled)]
        bias: BiasArg,
        #[arg(long, value_enum, default_value_t = EdgeArg::Both)]
        edge: EdgeArg,
        /// Print events as JSON lines
        #[arg(long)]
        json: bool,
        #[arg(required = true)]
        offsets: Vec<u32>,
    },

    /// Request the lines defined in the configuration and print changes
    Run,

    /// Check that a line falls back to input after release
    CheckFallback {
        chip: PathBuf,
        /// Line offset or name
        pin: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum BiasArg {
    Disabled,
    PullUp,
    PullDown,
}

impl From<BiasArg> for Bias {
    fn from(arg: BiasArg) -> Self {
        match arg {
            BiasArg::Disabled => Bias::Disabled,
            BiasArg::PullUp => Bias::PullUp,
            BiasArg::PullDown => Bias::PullDown,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormatArg {
    Pretty,
    Compact,
    Json,
}

impl From<LogFormatArg> for OutputFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Pretty => OutputFormat::Pretty,
            LogFormatArg::Compact => OutputFormat::Compact,
            LogFormatArg::Json => OutputFormat::Json,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum EdgeArg {
    Rising,
    Falling,
    Both,
}

fn parse_assignment(s: &str) -> std::result::Result<(u32, bool), String> {
    let (offset, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected OFFSET=VALUE, got '{s}'"))?;
    let offset = offset
        .trim()
        .parse()
        .map_err(|e| format!("invalid offset '{offset}': {e}"))?;
    let value = match value.trim() {
        "1" | "high" | "on" | "true" => true,
        "0" | "low" | "off" | "false" => false,
        other => return Err(format!("invalid value '{other}', expected 0 or 1")),
    };
    Ok((offset, value))
}

/// Mask selecting the first `n` request positions.
fn all_positions(n: usize) -> u32 {
    if n >= 32 {
        u32::MAX
    } else {
        (1u32 << n) - 1
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => GpiodConfig::load_from(path),
        None => GpiodConfig::load(),
    }
    .context("Failed to load configuration")?;
    if let Some(consumer) = cli.consumer {
        config.consumer = consumer;
    }
    config.validate().context("Invalid configuration")?;
    let mut tracing_config =
        TracingConfig::from_config(&config)?.with_ansi(std::io::stderr().is_terminal());
    if let Some(format) = cli.log_format {
        tracing_config = tracing_config.with_format(format.into());
    }
    logging::init(tracing_config)?;
    debug!(?config, "Configuration loaded");

    match cli.command {
        Commands::Detect => detect(),
        Commands::Info { chip, json } => show_info(&chip.unwrap_or(config.chip), json),
        Commands::Get { chip, bias, offsets } => {
            get_values(&chip.unwrap_or(config.chip), &config.consumer, bias, &offsets)
        }
        Commands::Set { chip, values } => {
            set_values(&chip.unwrap_or(config.chip), &config.consumer, &values).await
        }
        Commands::Monitor {
            chip,
            bias,
            edge,
            json,
            offsets,
        } => {
            monitor(
                &chip.unwrap_or(config.chip.clone()),
                &config.consumer,
                bias,
                edge,
                json,
                &offsets,
            )
            .await
        }
        Commands::Run => run_group(&config).await,
        Commands::CheckFallback { chip, pin } => {
            let pin = pin.parse().map(Pin::Offset).unwrap_or(Pin::Name(pin));
            check_fallback(&chip, pin).await?;
            println!("Lines fall back into input mode after close");
            Ok(())
        }
    }
}

fn detect() -> Result<()> {
    for path in chips().context("Failed to list GPIO chips")? {
        let chip = GpioChip::open(&path)?;
        let info = chip.chip_info()?;
        println!("{} [{}] ({} lines)", info.name, info.label, info.line_cnt);
    }
    Ok(())
}

fn show_info(path: &Path, json: bool) -> Result<()> {
    let chip = GpioChip::open(path)?;
    let info = chip.chip_info()?;
    let lines = chip.lines()?;

    if json {
        let doc = serde_json::json!({ "chip": info, "lines": lines });
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    println!("{} - {} lines ({})", info.name, info.line_cnt, info.label);
    for line in lines {
        let f = line.flags;
        let mut attrs = vec![if f.output { "output" } else { "input" }];
        if f.active_low {
            attrs.push("active-low");
        }
        if f.pull_up {
            attrs.push("pull-up");
        }
        if f.pull_down {
            attrs.push("pull-down");
        }
        if f.open_drain {
            attrs.push("open-drain");
        }
        if f.open_source {
            attrs.push("open-source");
        }
        let name = if line.name.is_empty() { "unnamed" } else { &line.name };
        let consumer = if f.used {
            format!("\"{}\"", line.consumer)
        } else {
            "unused".to_string()
        };
        println!(
            "\tline {:>3}: {:<16} {:<16} {}",
            line.offset,
            name,
            consumer,
            attrs.join(" ")
        );
    }
    Ok(())
}

fn get_values(path: &Path, consumer: &str, bias: BiasArg, offsets: &[u32]) -> Result<()> {
    let chip = GpioChip::open(path)?;
    let mask = all_positions(offsets.len());
    let attrs = [AttributeDescriptor::flags(mask).with_bias(bias.into())];
    let handle = build_and_acquire(&chip, consumer, offsets, &attrs)?;

    let bits = handle.get_values(mask)?;
    let values: Vec<String> = offsets
        .iter()
        .enumerate()
        .map(|(n, offset)| format!("{offset}={}", (bits >> n) & 1))
        .collect();
    println!("{}", values.join(" "));
    Ok(())
}

async fn set_values(path: &Path, consumer: &str, values: &[(u32, bool)]) -> Result<()> {
    let chip = GpioChip::open(path)?;
    let offsets: Vec<u32> = values.iter().map(|(offset, _)| *offset).collect();
    let mask = all_positions(offsets.len());
    let bits = values
        .iter()
        .enumerate()
        .filter(|(_, (_, value))| *value)
        .fold(0u32, |bits, (n, _)| bits | (1 << n));

    let attrs = [
        AttributeDescriptor::flags(mask).output(),
        AttributeDescriptor::output_values(mask, bits),
    ];
    let handle = build_and_acquire(&chip, consumer, &offsets, &attrs)?;

    info!(offsets = ?offsets, bits, "Holding lines, press Ctrl-C to release");
    tokio::signal::ctrl_c().await?;
    handle.close();
    Ok(())
}

fn print_event(event: &LineEvent, json: bool) {
    if json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{line}"),
            Err(e) => eprintln!("Failed to encode event: {e}"),
        }
    } else {
        println!(
            "{}.{:09} line {:>3} {:<7} seqno {} (line {})",
            event.timestamp_ns / 1_000_000_000,
            event.timestamp_ns % 1_000_000_000,
            event.offset,
            if event.rising_edge() { "rising" } else { "falling" },
            event.seqno,
            event.line_seqno
        );
    }
}

async fn monitor(
    path: &Path,
    consumer: &str,
    bias: BiasArg,
    edge: EdgeArg,
    json: bool,
    offsets: &[u32],
) -> Result<()> {
    let chip = GpioChip::open(path)?;
    let mut flags = AttributeDescriptor::flags(all_positions(offsets.len())).with_bias(bias.into());
    if matches!(edge, EdgeArg::Rising | EdgeArg::Both) {
        flags = flags.rising_edge();
    }
    if matches!(edge, EdgeArg::Falling | EdgeArg::Both) {
        flags = flags.falling_edge();
    }

    let request = request_lines(&chip, consumer, offsets, &[flags], move |event| {
        print_event(&event, json)
    })?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        reason = request.wait() => bail!("Event stream ended: {reason:?}"),
    }

    request.release();
    let reason = request.wait().await;
    debug!(?reason, "Monitor stopped");
    Ok(())
}

async fn run_group(config: &GpiodConfig) -> Result<()> {
    if config.lines.is_empty() {
        bail!("No lines configured, add a [lines.<name>] table to the configuration");
    }

    let chip = GpioChip::open(&config.chip)?;
    let lines = config
        .lines
        .iter()
        .map(|(name, line)| (name.clone(), line.clone()));
    let group = LineGroup::request(&chip, &config.consumer, lines, |change| {
        println!(
            "{} {}",
            change.name,
            if change.rising_edge { "rising" } else { "falling" }
        );
    })?;

    for name in group.names() {
        println!("{name} = {}", u8::from(group.value(name)?));
    }

    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        reason = group.wait() => bail!("Event stream ended: {reason:?}"),
    }

    group.shutdown().await?;
    Ok(())
}
