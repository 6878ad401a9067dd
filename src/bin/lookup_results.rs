//! lookup_results - Print the products seen near a timestamp in a saved report.

use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;

use reel_match::results::{load_report, lookup, unique_products};

#[derive(Parser, Debug)]
#[command(
    name = "lookup_results",
    about = "Look up matched products in a Reel Match report"
)]
struct Args {
    /// Report written by process_video
    #[arg(long, default_value = "results.json", value_name = "PATH")]
    report: PathBuf,

    /// Time in seconds to look up
    #[arg(long, value_name = "SECONDS", conflicts_with = "all")]
    time: Option<f64>,

    /// List every distinct product in the report instead
    #[arg(long)]
    all: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let report = load_report(&args.report)?;

    if args.all {
        let products = unique_products(&report);
        println!("{} distinct products in {}", products.len(), report.video);
        for p in products {
            println!(
                "  {:>8.2}s  {:<24} {:<12} score={:.3} ({}, conf {:.2})",
                p.timestamp, p.product_id, p.category, p.score, p.label, p.confidence
            );
        }
        return Ok(());
    }

    let Some(time) = args.time else {
        bail!("pass --time SECONDS or --all");
    };
    let Some(interval) = lookup(&report, time) else {
        println!("no processed interval near {:.2}s", time);
        return Ok(());
    };
    println!(
        "interval @{:.2}s (frame {:.2}s)",
        interval.timestamp,
        interval.frame_timestamp.unwrap_or(interval.timestamp)
    );
    if interval.items.is_empty() {
        println!("  person found, no items detected");
    }
    for item in &interval.items {
        println!(
            "  {} [{}] conf={:.2} box={:?}",
            item.item.label,
            item.item.category,
            item.item.confidence,
            <[f32; 4]>::from(item.item.bbox)
        );
        if item.matches.is_empty() {
            println!("    (no catalog matches)");
        }
        for m in &item.matches {
            println!("    {:<24} {:.3}", m.product_id, m.score);
        }
    }
    Ok(())
}
