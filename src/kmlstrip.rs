use anyhow::{Context, Result, bail};
use clap::Parser;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use crate::config::AppContext;
use crate::declutter::{MapView, Marker, MarkerId, MarkerLayer};
use crate::loader::{LoadedTrack, TrackLoader};

mod config;
mod declutter;
mod gui;
mod kmz;
mod loader;
mod position;
mod strip;
mod track;

const VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("APP_GIT_HASH"), ")");

// --- CLI Definition ---

#[derive(Parser, Debug)]
#[command(author, version = VERSION, about = "Strips timestamps from KML/KMZ tracks and declutters their markers.", long_about = None)]
struct Cli {
    /// KML or KMZ file to open
    file: Option<PathBuf>,

    /// Write the cleaned KML without opening a window
    #[arg(long)]
    strip: bool,

    /// Print which markers the declutter pass keeps, without opening a window
    #[arg(long)]
    report: bool,

    /// Output file for --strip (default: loader.output_name next to the input)
    #[arg(long, short, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Map zoom level used by --report
    #[arg(long, default_value_t = 3.0)]
    zoom: f64,

    /// Sensitivity used by --report (default: from config)
    #[arg(long)]
    sensitivity: Option<f64>,

    /// Let the declutter pass hide the last marker too
    #[arg(long)]
    hide_last: bool,

    /// Ignore the config file and use built-in defaults
    #[arg(long)]
    no_config: bool,

    /// Debug logging (RUST_LOG overrides)
    #[arg(long, short)]
    verbose: bool,
}

impl Cli {
    fn validate(&self) -> Result<(), String> {
        let headless = self.strip || self.report;
        if headless && self.file.is_none() {
            return Err("--strip and --report need an input file".to_string());
        }
        if self.output.is_some() && !self.strip {
            return Err("--output only makes sense with --strip".to_string());
        }
        if !self.zoom.is_finite() {
            return Err(format!("Invalid zoom {}", self.zoom));
        }
        if let Some(s) = self.sensitivity {
            if !s.is_finite() {
                return Err(format!("Invalid sensitivity {}", s));
            }
            if !self.report {
                return Err("--sensitivity only makes sense with --report".to_string());
            }
        }
        if let Some(ref file) = self.file
            && !file.is_file()
        {
            return Err(format!("Input file does not exist: {:?}", file));
        }
        Ok(())
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

/// Fixed-zoom view for headless runs; remembers what the layer told it.
struct ReportView {
    zoom: f64,
    rows: Vec<(MarkerId, f64, f64, String, bool)>,
}

impl MapView for ReportView {
    fn zoom(&self) -> f64 {
        self.zoom
    }

    fn clear_markers(&mut self) {
        self.rows.clear();
    }

    fn add_marker(&mut self, marker: &Marker) {
        self.rows.push((marker.id, marker.point.lat, marker.point.lon, marker.point.label.clone(), !marker.visible));
    }

    fn set_marker_hidden(&mut self, id: MarkerId, hidden: bool) {
        if let Some(row) = self.rows.iter_mut().find(|r| r.0 == id) {
            row.4 = hidden;
        }
    }
}

fn default_output(input: &Path, output_name: &str) -> PathBuf {
    input.with_file_name(output_name)
}

// Both paths resolve to the same existing file
fn is_same_file(a: &Path, b: &Path) -> bool {
    matches!((a.canonicalize(), b.canonicalize()), (Ok(x), Ok(y)) if x == y)
}

fn run_strip(track: &LoadedTrack, input: &Path, output: Option<PathBuf>, ctx: &AppContext) -> Result<()> {
    let out = output.unwrap_or_else(|| default_output(input, &ctx.loader.output_name));
    if out == input || is_same_file(&out, input) {
        bail!("Refusing to overwrite the input file {:?}", input);
    }
    loader::write_cleaned(&out, track)?;
    println!("{} timestamps removed, {} points, written to {}", track.removed, track.points.len(), out.display());
    Ok(())
}

fn run_report(track: &LoadedTrack, layer: &mut MarkerLayer, zoom: f64) {
    let mut view = ReportView { zoom, rows: Vec::new() };
    layer.load(track.points.iter().cloned(), &mut view);
    let distance = layer.overlap_distance().unwrap_or_default();

    println!(
        "{}: zoom {:.2}, sensitivity {:.2}, overlap distance {:.6}°",
        track.source_name,
        zoom,
        layer.sensitivity(),
        distance
    );
    for (id, lat, lon, label, hidden) in &view.rows {
        let state = if *hidden { "hidden" } else { "shown" };
        println!("{:>6} {:>11.6} {:>11.6}  {:<6}  {}", id.0, lat, lon, state, label);
    }
    println!(
        "{} markers, {} shown, {} hidden, track length {}",
        layer.markers().len(),
        layer.visible_count(),
        layer.hidden_count(),
        position::format_distance(position::track_length(&track.points))
    );
}

fn main() -> Result<()> {
    let args = Cli::parse();
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
    init_logging(args.verbose);

    let mut ctx = if args.no_config { AppContext::defaults() } else { AppContext::new()? };
    if args.hide_last {
        ctx.declutter.keep_last_visible = false;
    }
    debug!("Config: {:?}", ctx.config_path);

    let range = ctx.sensitivity_range().context("Invalid [declutter] sensitivity range")?;
    let track_loader = TrackLoader::new(&ctx.loader);

    if args.strip || args.report {
        let Some(input) = args.file.as_deref() else {
            bail!("No input file");
        };
        let track = track_loader.load_path(input)?;

        if args.strip {
            run_strip(&track, input, args.output.clone(), &ctx)?;
        }
        if args.report {
            let sensitivity = args.sensitivity.unwrap_or(ctx.declutter.sensitivity);
            let mut layer = MarkerLayer::new(range, sensitivity, ctx.policy());
            run_report(&track, &mut layer, args.zoom);
        }
        return Ok(());
    }

    info!("Launching GUI...");
    let handle = loader::spawn_track_loader(track_loader);
    let app = gui::GuiApp::new(ctx, range, handle, args.file.clone());
    if let Err(e) = app.run() {
        error!("GUI Error: {}", e);
    }
    Ok(())
}
