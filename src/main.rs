mod config;
mod mesh;
mod output;
mod pklg;

use std::fs::File;
use std::io::{self, BufReader, Write};
use std::path::PathBuf;

use anyhow::Context;
use chrono::TimeDelta;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use mesh::MeshDecoder;
use output::OutputFormat;
use pklg::protocol::PklgReader;

#[derive(Parser)]
#[command(name = "mesh-decode")]
#[command(about = "Decode Bluetooth Mesh traffic from a PacketLogger HCI trace")]
#[command(version)]
struct Cli {
    /// PacketLogger trace (.pklg)
    trace: PathBuf,

    /// Path to configuration file
    #[arg(short, long, default_value = "mesh-decode.toml")]
    config: PathBuf,

    /// Print decoded events as JSON lines
    #[arg(long)]
    json: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = config::Config::load(&cli.config).unwrap_or_else(|e| {
        eprintln!("Warning: Failed to load config from {:?}: {}", cli.config, e);
        eprintln!("Using default configuration");
        config::Config::default()
    });

    // Logs go to stderr, decoded events to stdout
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .with_writer(io::stderr)
        .init();

    info!("mesh-decode v{}", env!("CARGO_PKG_VERSION"));

    let idle_timeout = i64::try_from(config.reassembly.idle_timeout_secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .context("reassembly.idle_timeout_secs is out of range")?;
    let mut decoder = MeshDecoder::new(config.reassembly.max_sessions, idle_timeout);

    if let Some(keys) = &config.keys {
        for event in keys.provisioning_events() {
            if let Err(e) = event.apply(decoder.keys_mut()) {
                warn!("Skipping configured key: {:#}", e);
            }
        }
        info!("IV Index {:08x} from config", decoder.keys().iv_index());
    }

    let format = if cli.json {
        OutputFormat::Json
    } else {
        config.output.format
    };

    let file = File::open(&cli.trace)
        .with_context(|| format!("Failed to open trace {:?}", cli.trace))?;
    info!("Decoding {:?}", cli.trace);
    let reader = PklgReader::new(BufReader::new(file), config.trace.max_record_len);

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut write_failed: Option<anyhow::Error> = None;

    let result = pklg::run_trace(reader, &mut decoder, |at, event| {
        if write_failed.is_some() {
            return;
        }
        let line = output::render(format, at, event)
            .and_then(|line| writeln!(out, "{}", line).map_err(anyhow::Error::from));
        if let Err(e) = line {
            write_failed = Some(e);
        }
    });

    if let Some(e) = write_failed {
        return Err(e.context("Failed to write decoded output"));
    }

    match result {
        Ok(_) => Ok(()),
        Err(e) => {
            error!("Stopped decoding {:?}: {}", cli.trace, e);
            Err(e.into())
        }
    }
}
