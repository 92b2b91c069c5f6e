//! xrmmap CLI - Command-line interface for X-ray microprobe map files.
//!
//! Inspects containers, extracts summed spectra and manages stored areas.
#![allow(clippy::uninlined_format_args)]

use clap::{Parser, Subcommand};
use log::info;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use xrmmap_core::{Rect, Spectrum};
use xrmmap_io::{
    AggregationEngine, AreaStore, ClaimMode, ContainerHandle, Detector, MapShape, WorkStore,
};

/// Result type for CLI operations.
type Result<T> = std::result::Result<T, CliError>;

/// CLI error types.
#[derive(Error, Debug)]
enum CliError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("map file error: {0}")]
    MapFile(#[from] xrmmap_io::Error),

    #[error("core error: {0}")]
    Core(#[from] xrmmap_core::Error),
}

/// Inspect and query X-ray microprobe map files.
#[derive(Parser)]
#[command(name = "xrmmap")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show container attributes, geometry, areas and work arrays
    Info {
        /// Map file
        file: PathBuf,
    },

    /// Sum a spectrum over a rectangle of rows and pixels
    Spectrum {
        /// Map file
        file: PathBuf,

        /// Row range `start:stop` (half-open, either end may be omitted)
        #[arg(long, value_parser = parse_range, default_value = ":")]
        rows: (usize, usize),

        /// Pixel range `start:stop` (half-open, either end may be omitted)
        #[arg(long, value_parser = parse_range, default_value = ":")]
        cols: (usize, usize),

        /// Detector: `sum`, `mcaN` or N
        #[arg(long, default_value = "sum")]
        det: String,

        /// Skip dead-time correction
        #[arg(long)]
        no_dtc: bool,

        /// Write CSV here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Sum a spectrum over a stored area
    AreaSpectrum {
        /// Map file
        file: PathBuf,

        /// Area name or description
        area: String,

        /// Detector: `sum`, `mcaN` or N
        #[arg(long, default_value = "sum")]
        det: String,

        /// Skip dead-time correction
        #[arg(long)]
        no_dtc: bool,

        /// Write CSV here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List stored areas
    Areas {
        /// Map file
        file: PathBuf,

        /// Also print ROI count-rate statistics per area
        #[arg(long)]
        stats: bool,
    },

    /// Export all areas to an HDF5 bundle
    ExportAreas {
        /// Map file
        file: PathBuf,

        /// Bundle to create
        bundle: PathBuf,
    },

    /// Import areas from an HDF5 bundle
    ImportAreas {
        /// Map file
        file: PathBuf,

        /// Bundle written by `export-areas`
        bundle: PathBuf,

        /// Replace areas with the same name instead of renaming imports
        #[arg(long)]
        overwrite: bool,
    },

    /// List work arrays
    Work {
        /// Map file
        file: PathBuf,
    },
}

/// Parse `a:b`, `a:`, `:b` or `:` into a half-open range.
fn parse_range(s: &str) -> std::result::Result<(usize, usize), String> {
    let (start, stop) = s
        .split_once(':')
        .ok_or_else(|| format!("expected start:stop, got '{s}'"))?;
    let parse = |v: &str, default: usize| -> std::result::Result<usize, String> {
        let v = v.trim();
        if v.is_empty() {
            Ok(default)
        } else {
            v.parse().map_err(|e| format!("invalid bound '{v}': {e}"))
        }
    };
    let range = (parse(start, 0)?, parse(stop, usize::MAX)?);
    if range.0 > range.1 {
        return Err(format!("start {} is past stop {}", range.0, range.1));
    }
    Ok(range)
}

fn output_writer(path: Option<&Path>) -> Result<Box<dyn Write>> {
    Ok(match path {
        Some(p) => Box::new(BufWriter::new(File::create(p)?)),
        None => Box::new(BufWriter::new(io::stdout().lock())),
    })
}

/// Write a spectrum as CSV with `#` metadata lines.
fn write_spectrum_csv(spectrum: &Spectrum, out: &mut dyn Write) -> io::Result<()> {
    let p = &spectrum.provenance;
    writeln!(out, "# file: {}", p.filename)?;
    writeln!(out, "# detector: {}", p.detector)?;
    writeln!(out, "# region: {}", p.region)?;
    writeln!(out, "# pixels: {}", spectrum.npixels)?;
    writeln!(out, "# real_time: {}", spectrum.real_time)?;
    writeln!(out, "# live_time: {}", spectrum.live_time)?;
    writeln!(
        out,
        "# dead_time_corrected: {}",
        spectrum.dead_time_corrected
    )?;
    let c = &spectrum.calibration;
    writeln!(
        out,
        "# calibration: offset={} slope={} quad={}",
        c.offset, c.slope, c.quad
    )?;
    for roi in &spectrum.rois {
        writeln!(out, "# roi: {} [{}, {})", roi.name, roi.left, roi.right)?;
    }
    writeln!(out, "energy,counts")?;
    for (energy, counts) in spectrum.energy.iter().zip(spectrum.counts.iter()) {
        writeln!(out, "{energy},{counts}")?;
    }
    out.flush()
}

fn print_info(path: &Path) -> Result<()> {
    let handle = ContainerHandle::open_read_only(path)?;
    let (start, stop) = handle.times()?;
    println!("File:            {}", path.display());
    println!("Folder:          {}", handle.folder()?);
    println!("Format version:  {}", handle.format_version()?);
    println!("Dimension:       {}", handle.dimension()?);
    println!("Rows ingested:   {}", handle.rows()?);
    println!("Started:         {start}");
    println!("Stopped:         {}", if stop.is_empty() { "-" } else { &stop });
    match handle.owner()? {
        Some(owner) => println!("Owner:           {owner}"),
        None => println!("Owner:           none"),
    }
    if handle.schema_built() {
        let shape = MapShape::from_container(&handle)?;
        println!("Detectors:       {}", handle.detector_names()?.join(", "));
        println!("Pixels per row:  {}", shape.pixels);
        println!("Channels:        {}", shape.channels);
        println!("Scalers:         {}", shape.scaler_names.join(", "));
        println!("ROIs:            {}", shape.n_rois);
        if let Some((h, w)) = shape.frame_shape {
            println!("XRD frames:      {h} x {w}");
        }
    } else {
        println!("Schema:          not built");
    }
    println!("Areas:           {}", AreaStore::new(&handle).area_names()?.len());
    println!(
        "Work arrays:     {}",
        WorkStore::new(&handle).work_array_names()?.len()
    );
    println!("Environment:     {} entries", handle.environ()?.len());
    Ok(())
}

fn list_areas(path: &Path, stats: bool) -> Result<()> {
    // Statistics are cached only when we own the file.
    let mut handle = if stats {
        ContainerHandle::open(path, None)?
    } else {
        ContainerHandle::open_read_only(path)?
    };
    if stats {
        handle.claim_ownership(ClaimMode::Defensive)?;
    }
    let rows = handle.rows()?;
    {
        let store = AreaStore::new(&handle);
        for name in store.area_names()? {
            let area = store.get_area(&name)?;
            println!(
                "{:<24} {:>8} pixels  {}",
                area.name,
                area.npixels(rows),
                area.description
            );
            if stats {
                for s in store.area_stats(&name)? {
                    println!(
                        "    {:<28} n={} mean={:.4} std={:.4} median={:.4} min={:.4} max={:.4}",
                        s.name, s.count, s.mean, s.std, s.median, s.min, s.max
                    );
                }
            }
        }
    }
    handle.close()?;
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Info { file } => print_info(&file)?,

        Commands::Spectrum {
            file,
            rows,
            cols,
            det,
            no_dtc,
            output,
        } => {
            let handle = ContainerHandle::open_read_only(&file)?;
            let detector: Detector = det.parse()?;
            let rect = Rect::new(rows.0, rows.1, cols.0, cols.1);
            let spectrum =
                AggregationEngine::new(&handle).spectrum_for_rect(rect, detector, !no_dtc)?;
            write_spectrum_csv(&spectrum, &mut *output_writer(output.as_deref())?)?;
            info!("summed {} pixels", spectrum.npixels);
        }

        Commands::AreaSpectrum {
            file,
            area,
            det,
            no_dtc,
            output,
        } => {
            let handle = ContainerHandle::open_read_only(&file)?;
            let detector: Detector = det.parse()?;
            let spectrum =
                AggregationEngine::new(&handle).spectrum_for_area(&area, detector, !no_dtc)?;
            write_spectrum_csv(&spectrum, &mut *output_writer(output.as_deref())?)?;
            info!("summed {} pixels", spectrum.npixels);
        }

        Commands::Areas { file, stats } => list_areas(&file, stats)?,

        Commands::ExportAreas { file, bundle } => {
            let handle = ContainerHandle::open_read_only(&file)?;
            let n = AreaStore::new(&handle).export_areas(&bundle)?;
            println!("Exported {} areas to {}", n, bundle.display());
        }

        Commands::ImportAreas {
            file,
            bundle,
            overwrite,
        } => {
            let mut handle = ContainerHandle::open(&file, None)?;
            handle.claim_ownership(ClaimMode::Defensive)?;
            let names = AreaStore::new(&handle).import_areas(&bundle, overwrite)?;
            handle.close()?;
            println!("Imported {} areas: {}", names.len(), names.join(", "));
        }

        Commands::Work { file } => {
            let handle = ContainerHandle::open_read_only(&file)?;
            let store = WorkStore::new(&handle);
            for name in store.work_array_names()? {
                let array = store.get_work_array(&name)?;
                println!("{:<24} {:?}", name, array.data.shape());
            }
        }
    }

    Ok(())
}
