//! `veriface` — export the audit log and compute offline evaluation metrics.
//!
//! The `export` subcommand reads the daemon's SQLite database directly so it
//! can run against a copied database file with the daemon stopped. `metrics`
//! consumes the exported JSON and prints EER and PAD error rates.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use veriface_core::metrics::{
    equal_error_rate, pad_error_rates, LabeledRecord, LogProjection, MetricsExport,
    DEFAULT_PAD_THRESHOLD,
};

#[derive(Parser)]
#[command(name = "veriface", about = "Audit log export and offline evaluation")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Export audit log rows as evaluation JSON.
    Export {
        /// Path to the verifaced SQLite database.
        #[arg(long)]
        db: PathBuf,
        /// Inclusive lower bound on the record epoch timestamp.
        #[arg(long)]
        t0: Option<i64>,
        /// Inclusive upper bound on the record epoch timestamp.
        #[arg(long)]
        t1: Option<i64>,
        /// Output file; stdout when omitted.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Compute EER and PAD error rates from an exported JSON file.
    Metrics {
        /// Metrics export JSON file.
        #[arg(long)]
        json: PathBuf,
        /// PAD threshold used only for rows without a logged pad_ok flag.
        #[arg(long, default_value_t = DEFAULT_PAD_THRESHOLD)]
        pad_thr: f64,
    },
}

fn main() -> Result<()> {
    match Cli::parse().command {
        Command::Export { db, t0, t1, out } => export(&db, t0, t1, out.as_deref()),
        Command::Metrics { json, pad_thr } => metrics(&json, pad_thr),
    }
}

fn export(db: &std::path::Path, t0: Option<i64>, t1: Option<i64>, out: Option<&std::path::Path>) -> Result<()> {
    let conn = rusqlite::Connection::open_with_flags(
        db,
        rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
    )
    .with_context(|| format!("opening database at {}", db.display()))?;

    let mut stmt = conn.prepare(
        "SELECT Similarity, IsBonaFide, PadProbMin, PadPassed, Decision, Purpose, AttackType, DurationMs, At
         FROM AuthLogs
         WHERE (?1 IS NULL OR At >= ?1) AND (?2 IS NULL OR At <= ?2)
         ORDER BY At",
    )?;
    let items = stmt
        .query_map(rusqlite::params![t0, t1], |row| {
            Ok(LogProjection {
                sim: row.get(0)?,
                bona: row.get(1)?,
                pad_prob: row.get(2)?,
                pad_ok: row.get(3)?,
                decision: row.get(4)?,
                purpose: row.get(5)?,
                atk: row.get(6)?,
                dur_ms: row.get(7)?,
                at: row.get(8)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let export = MetricsExport {
        count: items.len(),
        items,
    };
    let payload = serde_json::to_string_pretty(&export)?;

    match out {
        Some(path) => {
            fs::write(path, payload).with_context(|| format!("writing {}", path.display()))?;
            eprintln!("{} records -> {}", export.count, path.display());
        }
        None => println!("{payload}"),
    }
    Ok(())
}

fn metrics(json: &std::path::Path, pad_thr: f64) -> Result<()> {
    let raw = fs::read_to_string(json).with_context(|| format!("reading {}", json.display()))?;
    // Accept both the {count, items} envelope and a bare record array.
    let items: Vec<LogProjection> = match serde_json::from_str::<MetricsExport>(&raw) {
        Ok(export) => export.items,
        Err(_) => serde_json::from_str(&raw).context("not a metrics export")?,
    };
    let records: Vec<LabeledRecord> = items.iter().map(LogProjection::labeled).collect();

    println!("=== Verification (matching) ===");
    match equal_error_rate(&records) {
        Some(report) => println!("EER: {:.4} @ thr={:.4}", report.eer, report.threshold),
        None => println!("No data"),
    }

    println!("\n=== PAD (anti-spoof) ===");
    let pad = pad_error_rates(&records, pad_thr);
    match (pad.apcer, pad.bpcer) {
        (None, None) => println!("No data for PAD metrics"),
        (apcer, bpcer) => {
            if let Some(v) = apcer {
                println!("APCER: {v:.4}");
            }
            if let Some(v) = bpcer {
                println!("BPCER: {v:.4}");
            }
            if let Some(v) = pad.acer {
                println!("ACER : {v:.4}");
            }
        }
    }
    Ok(())
}
