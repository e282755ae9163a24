use std::path::PathBuf;
use std::time::Duration;

use abx_client::capture::{write_capture, CaptureHeader};
use abx_client::client::{DEFAULT_HOST, DEFAULT_PORT};
use abx_client::output::{write_json, DEFAULT_OUTPUT};
use abx_client::reconcile::gap_count;
use abx_client::{AbxClient, ClientConfig};
use anyhow::{Context, Result};
use clap::Parser;
use dotenvy::dotenv;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(version, about = "ABX exchange client: stream all packets, recover gaps, write JSON")]
struct Args {
    /// Exchange server host
    #[arg(long, env = "ABX_HOST", default_value = DEFAULT_HOST)]
    host: String,

    /// Exchange server port
    #[arg(long, env = "ABX_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Output JSON file
    #[arg(long, short = 'o', env = "ABX_OUT_FILE", default_value = DEFAULT_OUTPUT)]
    out: PathBuf,

    /// Also write a CRC-framed binary capture (readable with abx-replay)
    #[arg(long, env = "ABX_CAPTURE_FILE")]
    capture: Option<PathBuf>,

    /// Connect timeout in milliseconds
    #[arg(long, env = "ABX_CONNECT_TIMEOUT_MS")]
    connect_timeout_ms: Option<u64>,

    /// Per-read timeout in milliseconds; an expired read aborts the run
    #[arg(long, env = "ABX_READ_TIMEOUT_MS")]
    read_timeout_ms: Option<u64>,

    /// Open a fresh connection for every resend request
    #[arg(long, env = "ABX_RECONNECT_EACH", default_value_t = false)]
    reconnect_each: bool,
}

impl Args {
    fn client_config(&self) -> ClientConfig {
        ClientConfig {
            host: self.host.clone(),
            port: self.port,
            connect_timeout: self.connect_timeout_ms.map(Duration::from_millis),
            read_timeout: self.read_timeout_ms.map(Duration::from_millis),
            reconnect_each: self.reconnect_each,
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

fn main() -> Result<()> {
    // Load environment variables from .env if present
    let _ = dotenv();
    init_tracing();
    let args = Args::parse();
    let client = AbxClient::new(args.client_config());

    // Ctrl+C tears down live sockets so blocked reads fail instead of hanging
    let shutdown = client.shutdown_handle();
    ctrlc::set_handler(move || shutdown.shutdown()).context("installing Ctrl+C handler")?;

    let run = client
        .run()
        .with_context(|| format!("fetching packets from {}", client.config().endpoint()))?;

    if !run.reconcile.unresolved.is_empty() {
        let runs: Vec<String> = run.reconcile.unresolved.iter().map(ToString::to_string).collect();
        warn!(
            missing = gap_count(&run.reconcile.unresolved),
            runs = %runs.join(","),
            "some sequences could not be recovered"
        );
    }
    write_json(&args.out, &run.records).with_context(|| format!("writing {:?}", args.out))?;
    info!(records = run.records.len(), out = ?args.out, "output saved");

    if let Some(path) = &args.capture {
        let header = CaptureHeader::new(client.config().endpoint(), &run.records)
            .with_unresolved(run.reconcile.unresolved.clone());
        write_capture(path, header, &run.records).with_context(|| format!("writing {path:?}"))?;
        info!(capture = ?path, "capture saved");
    }
    Ok(())
}
