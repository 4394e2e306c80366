//! midiclock - command line front end
//!
//! Lists ports, prints incoming MIDI, sends hex messages now or later, and
//! drives a MIDI clock from scheduled callbacks.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use colored::*;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use midiclock::{
    parse_hex_message, Clock, DecodedMessage, Engine, EngineConfig, InputFilter, MidirDriver,
    OutputStream, SystemClock, Timestamp,
};

const CLOCK_START: u8 = 0xFA;
const CLOCK_STOP: u8 = 0xFC;
const CLOCK_PULSE: u8 = 0xF8;
const PULSES_PER_BEAT: u64 = 24;

/// midiclock - timed MIDI input and output
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "MIDICLOCK_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    /// List available MIDI ports
    #[arg(long)]
    list_ports: bool,

    /// Input port name (defaults to config, then MIDI_INPUT, then the first port)
    #[arg(short, long)]
    input: Option<String>,

    /// Output port name (defaults to config, then MIDI_OUTPUT, then the first port)
    #[arg(short, long)]
    output: Option<String>,

    /// Print incoming messages until interrupted
    #[arg(long)]
    listen: bool,

    /// Also show clock, transport and active sensing while listening
    #[arg(long)]
    all: bool,

    /// Print messages as JSON arrays
    #[arg(long)]
    json: bool,

    /// Send a message given as hex bytes, e.g. "F0 7E 7F 06 01 F7"
    #[arg(long, value_name = "HEX")]
    send: Option<String>,

    /// Delay the message given with --send by this many milliseconds
    #[arg(long, default_value = "0")]
    delay: Timestamp,

    /// Output latency in milliseconds (required for delayed sends)
    #[arg(long)]
    latency: Option<Timestamp>,

    /// Send MIDI clock at this tempo
    #[arg(long, value_name = "BPM")]
    clock: Option<f64>,

    /// Number of beats to run the clock for
    #[arg(long, default_value = "8")]
    beats: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let args = Args::parse();
    init_logging(&args.log_level, args.log_json)?;

    let config = load_config(args.config.as_ref()).await?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let driver = Arc::new(MidirDriver::new(config.client_name.clone(), Arc::clone(&clock)));
    let engine = Engine::new(driver, clock, config).context("Failed to create MIDI engine")?;

    if args.list_ports {
        list_ports(&engine)?;
        return Ok(());
    }

    if args.send.is_none() && args.clock.is_none() && !args.listen {
        bail!("nothing to do: use --list-ports, --listen, --send or --clock");
    }

    let ticker = engine.start_ticker()?;
    let mut failures = engine
        .fatal_errors()
        .context("Callback failure channel already taken")?;

    if let Some(hex) = &args.send {
        send_message(&engine, &args, hex).await?;
    }

    if let Some(bpm) = args.clock {
        run_clock(&engine, &args, bpm).await?;
        if let Ok(failure) = failures.try_recv() {
            bail!("clock callback at {}ms failed: {}", failure.due, failure.message);
        }
    }

    if args.listen {
        listen(&engine, &args).await?;
    }

    ticker.stop();
    engine.shutdown();
    Ok(())
}

fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_thread_names(false),
            )
            .init();
    }

    Ok(())
}

async fn load_config(path: Option<&PathBuf>) -> Result<EngineConfig> {
    let config = match path {
        Some(path) => EngineConfig::load(path)
            .await
            .with_context(|| format!("Failed to load config: {}", path.display()))?,
        None => EngineConfig::default(),
    };
    Ok(config.with_env())
}

fn list_ports(engine: &Engine) -> Result<()> {
    println!("\n{}", "=== Available MIDI Ports ===".bold().cyan());

    let sections = [
        ("Input Ports:", engine.input_ports()?),
        ("Output Ports:", engine.output_ports()?),
    ];
    for (title, names) in sections {
        println!("\n{}", title.bold());
        if names.is_empty() {
            println!("  {}", "No ports found".dimmed());
        }
        for name in names {
            println!("  {}", name);
        }
    }
    println!();
    Ok(())
}

async fn send_message(engine: &Engine, args: &Args, hex: &str) -> Result<()> {
    let bytes = parse_hex_message(hex)?;
    if args.latency.is_some() && args.delay == 0 {
        warn!("--latency has no effect without --delay");
    }
    let output = engine.open_output(args.output.as_deref(), args.latency)?;

    let when = if args.delay > 0 {
        engine.current_time() + args.delay
    } else {
        0
    };
    output
        .send(&bytes, when)
        .with_context(|| format!("Failed to send to '{}'", output.port().name))?;
    info!(
        "Sent {} bytes to '{}'{}",
        bytes.len(),
        output.port().name,
        if when > 0 { format!(" for {}ms", when) } else { String::new() }
    );

    // Returns once the delayed send has gone out
    engine.run().await?;
    Ok(())
}

/// Clock pulses as chained callbacks, each scheduling the next
fn schedule_pulse(engine: &Engine, output: Arc<OutputStream>, start: Timestamp, interval: f64, pulse: u64, total: u64) {
    let due = start + (pulse as f64 * interval).round() as Timestamp;
    let next = engine.clone();
    engine.at(due, move |_| {
        if pulse == total {
            output.send(&[CLOCK_STOP], 0)?;
            info!("Clock stopped after {} pulses", total);
            return Ok(());
        }
        if pulse == 0 {
            output.send(&[CLOCK_START], 0)?;
        }
        output.send(&[CLOCK_PULSE], 0)?;
        schedule_pulse(&next, output, start, interval, pulse + 1, total);
        Ok(())
    });
}

async fn run_clock(engine: &Engine, args: &Args, bpm: f64) -> Result<()> {
    if !(bpm > 0.0 && bpm <= 1000.0) {
        bail!("tempo must be between 0 and 1000 BPM, got {}", bpm);
    }
    let output = Arc::new(engine.open_output(args.output.as_deref(), Some(0))?);
    let interval = 60_000.0 / (bpm * PULSES_PER_BEAT as f64);
    let start = engine.current_time() + 10;
    info!(
        "Clock at {} BPM on '{}' ({:.2}ms per pulse)",
        bpm,
        output.port().name,
        interval
    );

    schedule_pulse(engine, output, start, interval, 0, args.beats * PULSES_PER_BEAT);
    engine.run().await?;
    Ok(())
}

async fn listen(engine: &Engine, args: &Args) -> Result<()> {
    let input = engine.open_input(args.input.as_deref())?;
    let filter = if args.all {
        InputFilter::none()
    } else {
        InputFilter::default()
    };
    input.set_filter(filter)?;
    info!("Listening on '{}' (Ctrl+C to stop)", input.port().name);

    loop {
        tokio::select! {
            result = input.receive() => {
                for message in result? {
                    print_message(&message, args.json)?;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    input.close();
    Ok(())
}

fn print_message(message: &DecodedMessage, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(message)?);
        return Ok(());
    }
    let line = message.to_string();
    match message {
        DecodedMessage::Sysex(_) => println!("{}", line.yellow()),
        DecodedMessage::Short(short) if short.is_realtime() => println!("{}", line.dimmed()),
        DecodedMessage::Short(_) => println!("{}", line),
    }
    Ok(())
}

