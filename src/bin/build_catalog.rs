//! build_catalog - Embed a directory of product images into the catalog DB.
//!
//! Every image under `--images` becomes one product of `--category`, keyed by
//! its file stem. Re-running a category replaces nothing: duplicate product
//! ids are rejected by the store.

use anyhow::{bail, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;

use reel_match::catalog::catalog_digest;
use reel_match::embed::open_embedder;
use reel_match::{build_catalog, CatalogStore, SqliteCatalogStore};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(
    name = "build_catalog",
    about = "Embed product images into the Reel Match catalog"
)]
struct Args {
    /// Path to the catalog SQLite DB (created if missing)
    #[arg(long, default_value = "catalog.db", value_name = "PATH")]
    db: PathBuf,

    /// Directory of product images (searched recursively)
    #[arg(long, value_name = "DIR")]
    images: PathBuf,

    /// Catalog category the products belong to
    #[arg(long)]
    category: String,

    /// ONNX embedding model. The colour-histogram embedder is used when omitted
    #[arg(long, value_name = "PATH", requires = "embed_dim")]
    embed_model: Option<PathBuf>,

    /// Output length of --embed-model
    #[arg(long, value_name = "N")]
    embed_dim: Option<usize>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let is_tty = std::io::stderr().is_terminal();
    let stdout_is_tty = std::io::stdout().is_terminal();
    let ui = ui::Ui::from_args(Some(&args.ui), is_tty, !stdout_is_tty);

    let embedder = {
        let _stage = ui.stage("Load embedder");
        open_embedder(args.embed_model.as_deref(), args.embed_dim)?
    };

    let entries = {
        let _stage = ui.stage("Embed images");
        build_catalog(&args.images, &args.category, embedder.as_ref())?
    };
    if entries.is_empty() {
        bail!("no usable images under {}", args.images.display());
    }
    if args.verbose {
        for entry in &entries {
            println!("  {} <- {}", entry.product_id, entry.image_path);
        }
    }

    let mut store = {
        let _stage = ui.stage("Open catalog");
        SqliteCatalogStore::open(&args.db)?
    };
    let saved = {
        let _stage = ui.stage("Save entries");
        store.save_entries(embedder.model_id(), &entries)?
    };

    let meta = store.meta()?;
    println!("build_catalog: {}", args.db.display());
    println!(
        "  saved {} products to '{}' (model {})",
        saved,
        args.category,
        embedder.model_id()
    );
    if let Some(meta) = meta {
        println!("  dimension={} digest={}", meta.dimension, &meta.digest[..16.min(meta.digest.len())]);
    }
    if args.verbose {
        println!("  batch digest {}", catalog_digest(&entries));
    }
    Ok(())
}
