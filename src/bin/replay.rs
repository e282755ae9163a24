use abx_client::capture::CaptureReader;
use abx_client::output::write_json;
use abx_client::reconcile::{gap_count, Gap};
use abx_client::{Record, RecordSet};
use anyhow::{Context, Result};
use clap::Parser;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

#[derive(Debug, Parser)]
#[command(about = "Replay an ABX capture, verify it and optionally export JSON")]
struct Args {
    /// Input capture path (written by abx_client --capture)
    #[arg(long, short = 'i')]
    input: PathBuf,

    /// Print every record as it is read
    #[arg(long, default_value_t = false)]
    dump: bool,

    /// Re-export the records as JSON to this path
    #[arg(long)]
    json: Option<PathBuf>,

    /// Exit with an error if the capture has sequence gaps
    #[arg(long, default_value_t = false)]
    strict: bool,
}

fn format_created(created_unix_ns: u128) -> String {
    i128::try_from(created_unix_ns)
        .ok()
        .and_then(|ns| OffsetDateTime::from_unix_timestamp_nanos(ns).ok())
        .and_then(|t| t.format(&Rfc3339).ok())
        .unwrap_or_else(|| format!("{created_unix_ns}ns"))
}

fn print_record(r: &Record) {
    println!(
        "seq={:>5} {:<4} {} qty={:>8} price={:>10}",
        r.sequence, r.symbol, r.side, r.quantity, r.price
    );
}

fn main() -> Result<()> {
    let args = Args::parse();
    let file = File::open(&args.input).with_context(|| format!("open {:?}", args.input))?;
    let reader = CaptureReader::new(BufReader::new(file)).context("read capture header")?;
    let h = reader.header().clone();
    eprintln!(
        "Header: v{} endpoint={} created={} max_seq={:?} unresolved_at_capture={}",
        h.version,
        h.endpoint,
        format_created(h.created_unix_ns),
        h.max_sequence,
        gap_count(&h.unresolved)
    );

    let mut records = RecordSet::new();
    for (i, record) in reader.enumerate() {
        let record = record.with_context(|| format!("record frame {}", i + 1))?;
        if args.dump {
            print_record(&record);
        }
        if !records.insert(record) {
            eprintln!("duplicate sequence at frame {}", i + 1);
        }
    }

    let missing: Vec<Gap> = records.gaps().collect();
    eprintln!(
        "Read {} records. max_seq={:?} missing={}",
        records.len(),
        records.max_sequence(),
        gap_count(&missing)
    );
    if !missing.is_empty() {
        let runs: Vec<String> = missing.iter().map(ToString::to_string).collect();
        eprintln!("Missing sequences: {}", runs.join(", "));
    }
    if let Some(path) = &args.json {
        write_json(path, &records).with_context(|| format!("writing {path:?}"))?;
        eprintln!("Exported JSON to {path:?}");
    }
    if args.strict && !missing.is_empty() {
        anyhow::bail!("capture is missing {} sequences", gap_count(&missing));
    }
    Ok(())
}
