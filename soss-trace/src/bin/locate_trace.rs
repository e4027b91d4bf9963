//! Command line front end for SOSS trace location.
//!
//! Subcommands:
//! - `masks`: fit every column of a frame and build the order 1 / order 2 masks
//! - `bins`: index the pixels of each wavelength bin for orders 1 to 3
//! - `clear-cache`: delete the cached masks and wavelength bins
//!
//! Frames are read from JSON files holding a list of rows. Results are cached
//! under `--cache-dir` (or `$SOSS_TRACE_CACHE`, or `~/.soss_trace`).

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ndarray::Array2;
use soss_trace::{
    build_order_masks, build_wavelength_bins, ArtifactCache, FileCalibration, Filter,
    FitFailurePolicy, MaskBuildConfig, Subarray,
};

#[derive(Parser, Debug)]
#[command(name = "locate_trace")]
#[command(about = "Locate SOSS spectral traces and build order masks")]
#[command(version)]
struct Cli {
    /// Cache directory for computed masks and wavelength bins
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Ignore cached artifacts and recompute
    #[arg(long, global = true)]
    recompute: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build order masks for a frame
    Masks {
        /// Frame as a JSON list of rows
        #[arg(long)]
        frame: PathBuf,

        /// Per-pixel uncertainties, same layout as the frame
        #[arg(long)]
        err: Option<PathBuf>,

        /// Subarray the frame was read out with (SUBSTRIP96, SUBSTRIP256, FULL)
        #[arg(long, default_value = "SUBSTRIP256")]
        subarray: Subarray,

        /// Filter in the pupil wheel (CLEAR or F277W)
        #[arg(long, default_value = "CLEAR")]
        filter: Filter,

        /// JSON mask build config; flags below override its values
        #[arg(long)]
        config: Option<PathBuf>,

        /// Worker threads (0 = all CPUs)
        #[arg(short, long)]
        jobs: Option<usize>,

        /// Exclude columns whose fit fails instead of aborting
        #[arg(long)]
        exclude_failed: bool,

        /// Show a progress bar while fitting
        #[arg(long)]
        progress: bool,

        /// Write the masks to this JSON file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Build the wavelength-bin pixel index
    Bins {
        /// Wavelength calibration JSON (one list of rows per order)
        #[arg(long)]
        wavecal: PathBuf,

        /// Directory holding GR700XD_{order}.txt throughput tables
        #[arg(long)]
        throughput_dir: PathBuf,

        #[arg(long, default_value = "SUBSTRIP256")]
        subarray: Subarray,
    },

    /// Delete cached artifacts
    ClearCache,
}

fn read_array(path: &Path) -> Result<Array2<f64>> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let rows: Vec<Vec<f64>> =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;

    let height = rows.len();
    let width = rows.first().map_or(0, Vec::len);
    if let Some(idx) = rows.iter().position(|r| r.len() != width) {
        bail!(
            "{}: row {idx} has {} values, expected {width}",
            path.display(),
            rows[idx].len()
        );
    }
    let data: Vec<f64> = rows.into_iter().flatten().collect();
    Ok(Array2::from_shape_vec((height, width), data)?)
}

fn open_cache(dir: Option<PathBuf>) -> Result<ArtifactCache> {
    match dir {
        Some(dir) => Ok(ArtifactCache::with_path(dir)),
        None => ArtifactCache::new().context("locating the cache directory"),
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let cache = open_cache(cli.cache_dir)?;
    log::info!("using cache directory {}", cache.root_path().display());

    match cli.command {
        Command::Masks {
            frame,
            err,
            subarray,
            filter,
            config,
            jobs,
            exclude_failed,
            progress,
            output,
        } => {
            let mut build_config = match &config {
                Some(path) => MaskBuildConfig::load_from_file(path)?,
                None => MaskBuildConfig::default(),
            };
            if let Some(jobs) = jobs {
                build_config.n_jobs = jobs;
            }
            if exclude_failed {
                build_config.failure_policy = FitFailurePolicy::ExcludeColumn;
            }
            build_config.show_progress |= progress;

            let frame = read_array(&frame)?;
            let err = err.as_deref().map(read_array).transpose()?;

            let masks = build_order_masks(
                frame.view(),
                err.as_ref().map(|e| e.view()),
                subarray,
                filter,
                &build_config,
                &cache,
                cli.recompute,
            )?;

            let (order1, order2) = masks.included_counts();
            let (rows, cols) = masks.shape();
            println!("{subarray} {filter} masks ({rows}x{cols}, {:?})", masks.origin);
            println!("  order 1: {order1} signal pixels");
            println!("  order 2: {order2} signal pixels");
            for failed in &masks.failed_columns {
                println!("  column {} excluded: {}", failed.column, failed.reason);
            }

            if let Some(path) = output {
                let json = serde_json::to_string(&masks)?;
                std::fs::write(&path, json)
                    .with_context(|| format!("writing {}", path.display()))?;
                println!("Masks written to {}", path.display());
            }
        }

        Command::Bins {
            wavecal,
            throughput_dir,
            subarray,
        } => {
            let source = FileCalibration::new(wavecal, throughput_dir);
            let bins = build_wavelength_bins(subarray, &source, &cache, cli.recompute)?;

            println!("{subarray} wavelength bins ({:?})", bins.origin);
            for order in &bins.orders {
                println!(
                    "  order {}: {} bins, {} pixels",
                    order.order,
                    order.bins.len(),
                    order.pixel_count()
                );
            }
        }

        Command::ClearCache => {
            for path in [cache.order_masks_path(), cache.wavelength_bins_path()] {
                let removed = cache
                    .remove(&path)
                    .with_context(|| format!("removing {}", path.display()))?;
                if removed {
                    println!("Removed {}", path.display());
                }
            }
        }
    }

    Ok(())
}
