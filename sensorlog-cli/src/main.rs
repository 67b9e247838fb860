//! CLI for the sensorlog storage engine.
//!
//! Provides commands for inspecting, querying, feeding and benchmarking
//! sensorlog stores.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use clap::{Parser, Subcommand, ValueEnum};
use sensorlog::slow::{LIGHT_CHANNELS, SlowReading};
use sensorlog::{Channel, QueryService, RecordStore, Recorder, SensorLogError, StoreConfig, StreamId};
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// sensorlog: Bit-packed storage engine for home sensor readings.
#[derive(Parser)]
#[command(name = "sensorlog", version, about)]
struct Cli {
    /// JSON store configuration; the store path argument overrides its `dir`.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Display stream sizes, record counts and time extents.
    Info {
        /// Path to the store directory.
        store_path: PathBuf,

        /// Print the summaries as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Print the values of one channel.
    Query {
        /// Path to the store directory.
        store_path: PathBuf,

        /// Channel name (e.g. "motion0", "temperature_bed", "co2", "light_door").
        channel: String,

        /// Start of the range, unix seconds.
        #[arg(long, default_value_t = 0)]
        from: u32,

        /// End of the range, unix seconds.
        #[arg(long, default_value_t = u32::MAX)]
        to: u32,

        /// Only the trailing window ending now (e.g. "1h", "30m", "7d"); overrides --from/--to.
        #[arg(long)]
        last: Option<String>,

        /// Maximum number of points to print.
        #[arg(long, default_value_t = 1000)]
        resolution: usize,

        /// Output format.
        #[arg(long, default_value = "csv")]
        format: OutputFormat,
    },

    /// Feed a transcript of transport samples through the recorder.
    ///
    /// One sample per line: `fast <ts> <pir hex> <l,l,l>`, `slow <ts> <hex>`
    /// or `plants <ts> <hex>`. Blank lines and lines starting with `#` are
    /// skipped.
    Replay {
        /// Path to the store directory.
        store_path: PathBuf,

        /// Transcript file.
        file: PathBuf,
    },

    /// Run a write-path microbenchmark.
    Bench {
        /// Number of fast-cycle samples to write.
        #[arg(long, default_value = "1000000")]
        samples: u32,
    },
}

/// Output format for query results.
#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Comma-separated values.
    Csv,
    /// JSON object with parallel arrays.
    Json,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.config.as_deref();

    let result = match cli.command {
        Commands::Info { store_path, json } => cmd_info(config, &store_path, json),
        Commands::Query {
            store_path,
            channel,
            from,
            to,
            last,
            resolution,
            format,
        } => cmd_query(config, &store_path, &channel, (from, to), last.as_deref(), resolution, &format),
        Commands::Replay { store_path, file } => cmd_replay(config, &store_path, &file),
        Commands::Bench { samples } => cmd_bench(samples),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// Builds the store configuration for `store_path`.
fn store_config(config: Option<&Path>, store_path: &Path) -> Result<StoreConfig, SensorLogError> {
    let base = match config {
        Some(path) => StoreConfig::load(path)?,
        None => StoreConfig::default(),
    };
    Ok(StoreConfig {
        dir: store_path.to_path_buf(),
        ..base
    })
}

/// Opens an existing store. Refuses to create one.
fn open_existing(config: Option<&Path>, store_path: &Path) -> Result<RecordStore, Box<dyn std::error::Error>> {
    if !store_path.join("layout.json").exists() {
        return Err(format!("No store found at '{}'", store_path.display()).into());
    }
    Ok(RecordStore::open(store_config(config, store_path)?)?)
}

/// Implements `sensorlog info <store_path>`.
fn cmd_info(config: Option<&Path>, store_path: &Path, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_existing(config, store_path)?;
    let service = QueryService::new(&store);

    if json {
        let summaries = StreamId::ALL
            .into_iter()
            .map(|stream| service.summary(stream))
            .collect::<sensorlog::Result<Vec<_>>>()?;
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(());
    }

    println!("Store: {}", store_path.display());
    println!();

    for stream in StreamId::ALL {
        let summary = service.summary(stream)?;
        println!("  Stream \"{stream}\"");
        println!("    File: {}", store.path(stream).display());
        println!("    Size: {} ({} bytes)", format_bytes(summary.bytes), summary.bytes);
        println!("    Records: {}", summary.records);
        if let (Some(first), Some(last)) = (summary.first, summary.last) {
            println!("    Span: {first} .. {last} ({})", format_duration_secs(u64::from(last.saturating_sub(first))));
        }
        for warning in &summary.warnings {
            println!("    Warning: {warning}");
        }
        println!();
    }

    let total_size = dir_size(store_path)?;
    println!("Total disk usage: {} ({total_size} bytes)", format_bytes(total_size));

    Ok(())
}

/// Implements `sensorlog query <store_path> <channel>`.
fn cmd_query(
    config: Option<&Path>,
    store_path: &Path,
    channel_name: &str,
    range: (u32, u32),
    last: Option<&str>,
    resolution: usize,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let channel: Channel = channel_name.parse()?;
    let store = open_existing(config, store_path)?;

    let (start, stop) = match last {
        Some(window) => {
            let now = u32::try_from(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs())?;
            (now.saturating_sub(parse_duration(window)?), now)
        }
        None => range,
    };

    let result = QueryService::new(&store).fetch(channel, start, stop, resolution)?;
    if result.may_be_truncated() {
        warn!(warnings = result.warnings().len(), "stream could not be fully decoded, result may be incomplete");
    }

    match format {
        OutputFormat::Csv => {
            println!("# channel={channel}, points={}, matched={}", result.len(), result.matched());
            println!("timestamp,value");
            for (ts, val) in result.points() {
                println!("{ts},{val}");
            }
        }
        OutputFormat::Json => {
            let warnings: Vec<String> = result.warnings().iter().map(ToString::to_string).collect();
            let output = serde_json::json!({
                "channel": channel,
                "start": start,
                "stop": stop,
                "matched": result.matched(),
                "x": result.x(),
                "y": result.y(),
                "warnings": warnings,
            });

            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

/// One parsed transcript line.
enum Sample {
    Fast {
        timestamp: u32,
        pir: Vec<u8>,
        light: [u16; LIGHT_CHANNELS],
    },
    Slow {
        timestamp: u32,
        raw: Vec<u8>,
    },
    Plants {
        timestamp: u32,
        raw: Vec<u8>,
    },
}

/// Parses a transcript line. `Ok(None)` for blank lines and comments.
fn parse_sample(line: &str) -> Result<Option<Sample>, String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let fields: Vec<&str> = line.split_whitespace().collect();
    let timestamp = |s: &str| s.parse::<u32>().map_err(|e| format!("bad timestamp '{s}': {e}"));

    match fields.as_slice() {
        ["fast", ts, pir, light] => {
            let values: Vec<u16> = light
                .split(',')
                .map(|v| v.parse::<u16>().map_err(|e| format!("bad light value '{v}': {e}")))
                .collect::<Result<_, _>>()?;
            let light: [u16; LIGHT_CHANNELS] = values
                .try_into()
                .map_err(|v: Vec<u16>| format!("expected {LIGHT_CHANNELS} light values, got {}", v.len()))?;
            Ok(Some(Sample::Fast {
                timestamp: timestamp(*ts)?,
                pir: parse_hex(pir)?,
                light,
            }))
        }
        ["slow", ts, raw] => Ok(Some(Sample::Slow {
            timestamp: timestamp(*ts)?,
            raw: parse_hex(raw)?,
        })),
        ["plants", ts, raw] => Ok(Some(Sample::Plants {
            timestamp: timestamp(*ts)?,
            raw: parse_hex(raw)?,
        })),
        _ => Err(format!("unrecognized sample '{line}'")),
    }
}

/// Parses a hex string such as `"01ff"` into bytes.
fn parse_hex(s: &str) -> Result<Vec<u8>, String> {
    if !s.len().is_multiple_of(2) {
        return Err(format!("odd-length hex '{s}'"));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            s.get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| format!("bad hex '{s}'"))
        })
        .collect()
}

/// Implements `sensorlog replay <store_path> <file>`.
fn cmd_replay(config: Option<&Path>, store_path: &Path, file: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let transcript = fs::read_to_string(file)?;
    let store = RecordStore::open(store_config(config, store_path)?)?;
    let mut recorder = Recorder::new(&store);

    let (mut samples, mut stored, mut dropped) = (0u64, 0u64, 0u64);
    for (index, line) in transcript.lines().enumerate() {
        let sample = parse_sample(line).map_err(|e| format!("{}:{}: {e}", file.display(), index + 1))?;
        let Some(sample) = sample else {
            continue;
        };
        samples += 1;

        let outcome = match sample {
            Sample::Fast { timestamp, pir, light } => recorder.on_fast(&pir, &light, timestamp),
            Sample::Slow { timestamp, raw } => recorder.on_slow(&raw, timestamp),
            Sample::Plants { timestamp, raw } => recorder.on_plants(&raw, timestamp),
        };
        match outcome {
            Ok(true) => stored += 1,
            Ok(false) => {}
            // already logged by the recorder; the sample is skipped
            Err(SensorLogError::Input(_)) => dropped += 1,
            Err(e) => return Err(e.into()),
        }
    }
    recorder.flush()?;

    println!("Replayed {samples} samples: {stored} stored, {dropped} rejected");
    Ok(())
}

/// Implements `sensorlog bench`.
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)] // stats are display-only; sample patterns are reduced below u8/u16
fn cmd_bench(samples: u32) -> Result<(), Box<dyn std::error::Error>> {
    println!("sensorlog write-path benchmark");
    println!("  Samples: {samples}");
    println!();

    let temp_dir = std::env::temp_dir().join("sensorlog_bench");
    let _ = fs::remove_dir_all(&temp_dir);

    let store = RecordStore::open(StoreConfig::new(&temp_dir))?;
    let mut recorder = Recorder::new(&store);
    let slow = SlowReading {
        temperature: [315, 290, 305],
        humidity: [455, 610, 480],
        co2: 650,
    };

    println!("Writing {samples} fast samples, one slow sample per 60...");

    let base_time = 1_700_000_000u32;
    let start = Instant::now();

    let mut stored = 0u64;
    for i in 0..samples {
        let ts = base_time.saturating_add(i);
        let raw = [(i % 7) as u8, 0];
        if recorder.on_fast(&raw, &[120, 80, 300], ts)? {
            stored += 1;
        }
        if i % 60 == 0 {
            let reading = SlowReading {
                co2: 400 + (i / 60 % 2000) as u16,
                ..slow
            };
            recorder.on_slow(&reading.encode()?, ts)?;
        }
    }
    recorder.flush()?;

    let elapsed = start.elapsed();
    let ns_per_sample = elapsed.as_nanos() as f64 / f64::from(samples.max(1));
    let samples_per_sec = f64::from(samples) / elapsed.as_secs_f64();

    println!();
    println!("Results:");
    println!("  PIR records stored: {stored}");
    println!("  PIR stream: {}", format_bytes(store.len(StreamId::Pir)));
    println!("  Atmospheric stream: {}", format_bytes(store.len(StreamId::Atmospheric)));
    println!("  Elapsed: {elapsed:.3?}");
    println!("  Avg latency: {ns_per_sample:.1} ns/sample");
    println!("  Throughput: {samples_per_sec:.0} samples/sec");
    println!();

    drop(recorder);
    drop(store);
    let _ = fs::remove_dir_all(&temp_dir);

    Ok(())
}

/// Parses a human-readable duration string (e.g., "1h", "30m", "7d") to seconds.
fn parse_duration(s: &str) -> Result<u32, Box<dyn std::error::Error>> {
    let s = s.trim();
    if s.is_empty() {
        return Err("Empty duration string".into());
    }

    let unit_at = s.char_indices().last().map_or(0, |(at, _)| at);
    let (num_str, unit) = s.split_at(unit_at);
    let num: u32 = num_str.parse()?;

    let secs = match unit {
        "s" => Some(num),
        "m" => num.checked_mul(60),
        "h" => num.checked_mul(3600),
        "d" => num.checked_mul(86400),
        _ => return Err(format!("Unknown duration unit: '{unit}'. Use s, m, h, or d.").into()),
    };

    secs.ok_or_else(|| format!("Duration '{s}' is too long").into())
}

/// Formats seconds as a human-readable duration.
fn format_duration_secs(secs: u64) -> String {
    if secs >= 86400 && secs.is_multiple_of(86400) {
        format!("{}d", secs / 86400)
    } else if secs >= 3600 && secs.is_multiple_of(3600) {
        format!("{}h", secs / 3600)
    } else if secs >= 60 && secs.is_multiple_of(60) {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

/// Formats a byte count as a human-readable string.
#[allow(clippy::cast_precision_loss)] // Byte counts are display-only
fn format_bytes(bytes: u64) -> String {
    if bytes >= 1_048_576 {
        format!("{:.1} MB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{bytes} B")
    }
}

/// Recursively calculates directory size.
fn dir_size(path: &Path) -> Result<u64, Box<dyn std::error::Error>> {
    let mut total = 0;
    if path.is_dir() {
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                total += dir_size(&path)?;
            } else {
                total += entry.metadata()?.len();
            }
        }
    }
    Ok(total)
}
