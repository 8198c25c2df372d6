use eframe::egui;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

use crate::config::AppContext;
use crate::declutter::{LastMarkerPolicy, MapView, MarkerLayer, SensitivityRange, ZoomSettle};
use crate::gui::APP_TITLE;
use crate::loader::{self, LoadSource, LoadedTrack, LoaderHandle};
use crate::position;

use super::track_map::{TrackMapState, render_track_map};

const STATUS_TIMEOUT: Duration = Duration::from_secs(8);

pub struct GuiApp {
    ctx: AppContext,
    layer: MarkerLayer,
    map: TrackMapState,
    zoom_settle: ZoomSettle,
    loader: LoaderHandle,

    // Current track, kept for saving and the info panel
    track: Option<LoadedTrack>,
    track_length: f64,

    // Controls bound to the side panel
    sensitivity: f64,
    keep_last: bool,

    status_message: Option<(String, bool)>,
    status_set_time: Option<Instant>,

    initial_scale_applied: bool,
    // Track window size and panel width for saving on exit
    last_window_size: Option<(u32, u32)>,
    panel_width: f32,
    session_saved: bool,
}

impl GuiApp {
    pub fn new(
        ctx: AppContext,
        range: SensitivityRange,
        loader: LoaderHandle,
        initial_file: Option<PathBuf>,
    ) -> Self {
        let sensitivity = ctx.declutter.sensitivity;
        let policy = ctx.policy();
        let map = TrackMapState::new(
            ctx.gui_config.initial_lat,
            ctx.gui_config.initial_lon,
            ctx.gui_config.initial_zoom,
        );
        let panel_width = ctx.gui_config.panel_width.unwrap_or(300.0);
        // Initialize with configured size so we have a fallback if window size isn't captured
        let last_window_size =
            Some((ctx.gui_config.width.unwrap_or(1280), ctx.gui_config.height.unwrap_or(720)));

        let mut app = Self {
            ctx,
            layer: MarkerLayer::new(range, sensitivity, policy),
            map,
            zoom_settle: ZoomSettle::default(),
            loader,
            track: None,
            track_length: 0.0,
            sensitivity,
            keep_last: policy.keeps_last(),
            status_message: None,
            status_set_time: None,
            initial_scale_applied: false,
            last_window_size,
            panel_width,
            session_saved: false,
        };

        if let Some(path) = initial_file {
            app.start_load(LoadSource::Path(path));
        }
        app
    }

    pub fn run(self) -> Result<(), eframe::Error> {
        let width = self.ctx.gui_config.width.unwrap_or(1280) as f32;
        let height = self.ctx.gui_config.height.unwrap_or(720) as f32;
        debug!("Opening window {}x{}", width, height);

        let options = eframe::NativeOptions {
            viewport: egui::ViewportBuilder::default()
                .with_inner_size([width, height])
                .with_title(APP_TITLE)
                .with_drag_and_drop(true),
            ..Default::default()
        };

        eframe::run_native("kmlstrip", options, Box::new(move |_cc| Ok(Box::new(self))))
    }

    fn set_status(&mut self, msg: String, is_error: bool) {
        if is_error {
            error!("{}", msg);
        } else {
            info!("{}", msg);
        }
        self.status_message = Some((msg, is_error));
        self.status_set_time = Some(Instant::now());
    }

    fn start_load(&mut self, source: LoadSource) {
        let name = source.display_name();
        self.loader.submit(source);
        self.set_status(format!("Loading {}...", name), false);
    }

    fn open_file(&mut self) {
        let picked = rfd::FileDialog::new()
            .add_filter("Tracks", &["kml", "kmz"])
            .add_filter("All files", &["*"])
            .pick_file();
        if let Some(path) = picked {
            self.start_load(LoadSource::Path(path));
        }
    }

    fn save_cleaned(&mut self) {
        let Some(track) = self.track.as_ref() else {
            return;
        };
        let picked = rfd::FileDialog::new()
            .set_file_name(self.ctx.loader.output_name.as_str())
            .add_filter("KML", &["kml"])
            .save_file();
        let Some(path) = picked else {
            return;
        };

        match loader::write_cleaned(&path, track) {
            Ok(()) => self.set_status(format!("Saved {}", path.display()), false),
            Err(e) => self.set_status(format!("Save failed: {}", e), true),
        }
    }

    fn handle_dropped_files(&mut self, ctx: &egui::Context) {
        let dropped = ctx.input(|i| i.raw.dropped_files.clone());
        // Several files at once: the first one is loaded
        let Some(file) = dropped.into_iter().next() else {
            return;
        };
        if let Some(path) = file.path {
            self.start_load(LoadSource::Path(path));
        } else if let Some(bytes) = file.bytes {
            self.start_load(LoadSource::Bytes { name: file.name, bytes });
        }
    }

    fn poll_loader(&mut self, ctx: &egui::Context) {
        if let Some(res) = self.loader.poll() {
            match res.result {
                Ok(track) => self.apply_track(track),
                // The previous track stays on the map
                Err(e) => self.set_status(format!("Failed to load {}: {}", res.name, e), true),
            }
            ctx.request_repaint();
        }
        if self.loader.is_busy() {
            ctx.request_repaint_after(Duration::from_millis(100));
        }
    }

    fn apply_track(&mut self, track: LoadedTrack) {
        self.layer.load(track.points.iter().cloned(), &mut self.map);
        if let Some((lat, lon)) = position::track_center(&track.points) {
            self.map.center_on_position(lat, lon);
        }
        // The load already decluttered at this zoom
        self.zoom_settle.mark_applied(self.map.zoom());
        self.track_length = position::track_length(&track.points);

        let msg = format!(
            "Loaded {}: {} points, {} timestamps removed",
            track.source_name,
            track.points.len(),
            track.removed
        );
        self.track = Some(track);
        self.set_status(msg, false);
    }

    fn save_session(&mut self) {
        if self.session_saved {
            return;
        }
        self.session_saved = true;

        let mut gui_config = self.ctx.gui_config.clone();
        if let Some((w, h)) = self.last_window_size {
            gui_config.width = Some(w);
            gui_config.height = Some(h);
        }
        gui_config.panel_width = Some(self.panel_width);
        if let Err(e) = self.ctx.save_session(&gui_config, self.sensitivity, self.keep_last) {
            error!("Error saving config: {:#}", e);
        }
    }

    fn get_title_string(&self) -> String {
        let base = format!("{} ({})", APP_TITLE, env!("APP_GIT_HASH"));
        match &self.track {
            Some(track) => format!("{} | {}", base, track.source_name),
            None => base,
        }
    }

    fn handle_hotkeys(&mut self, ctx: &egui::Context) {
        let (open, save) = ctx.input(|i| {
            (
                i.modifiers.command && i.key_pressed(egui::Key::O),
                i.modifiers.command && i.key_pressed(egui::Key::S),
            )
        });
        if open {
            self.open_file();
        }
        if save {
            self.save_cleaned();
        }
    }

    fn render_controls(&mut self, ui: &mut egui::Ui) {
        ui.heading(APP_TITLE);
        ui.label(egui::RichText::new("Drop a .kml or .kmz file on the window").weak());
        ui.separator();

        ui.horizontal(|ui| {
            if ui.button("Open…").clicked() {
                self.open_file();
            }
            let can_save = self.track.is_some();
            if ui.add_enabled(can_save, egui::Button::new("Save cleaned…")).clicked() {
                self.save_cleaned();
            }
        });

        ui.add_space(8.0);
        ui.strong("Declutter");
        let range = self.layer.range();
        let slider =
            egui::Slider::new(&mut self.sensitivity, range.min()..=range.max()).text("Sensitivity");
        if ui.add(slider).changed() {
            self.layer.set_sensitivity(self.sensitivity, &mut self.map);
        }
        if ui.checkbox(&mut self.keep_last, "Keep last marker visible").changed() {
            self.layer.set_policy(LastMarkerPolicy::from_keep_last(self.keep_last), &mut self.map);
        }
        ui.checkbox(&mut self.map.show_labels, "Show names");

        ui.add_space(8.0);
        ui.separator();
        egui::Grid::new("track_stats").num_columns(2).striped(true).show(ui, |ui| {
            ui.label("Zoom");
            ui.label(format!("{:.2}", self.map.zoom()));
            ui.end_row();

            ui.label("Overlap");
            let overlap = self.layer.overlap_distance().map(|d| format!("{:.6}°", d));
            ui.label(overlap.unwrap_or_else(|| "-".to_string()));
            ui.end_row();

            if let Some(track) = &self.track {
                ui.label("File");
                ui.label(track.source_name.as_str());
                ui.end_row();

                if let Some(entry) = &track.entry {
                    ui.label("Entry");
                    ui.label(entry.as_str());
                    ui.end_row();
                }

                ui.label("Markers");
                ui.label(format!(
                    "{} ({} shown, {} hidden)",
                    self.layer.markers().len(),
                    self.layer.visible_count(),
                    self.layer.hidden_count()
                ));
                ui.end_row();

                ui.label("Timestamps removed");
                ui.label(track.removed.to_string());
                ui.end_row();

                ui.label("Length");
                ui.label(position::format_distance(self.track_length));
                ui.end_row();
            }
        });
    }

    fn render_status_bar(&mut self, ctx: &egui::Context) {
        if let Some(t) = self.status_set_time
            && t.elapsed() > STATUS_TIMEOUT
            && !self.status_message.as_ref().is_some_and(|(_, is_error)| *is_error)
        {
            self.status_message = None;
            self.status_set_time = None;
        }

        egui::TopBottomPanel::bottom("status_bar").show(ctx, |ui| {
            ui.horizontal(|ui| {
                if self.loader.is_busy() {
                    ui.spinner();
                }
                match &self.status_message {
                    Some((msg, true)) => {
                        ui.colored_label(egui::Color32::from_rgb(220, 60, 60), msg);
                    }
                    Some((msg, false)) => {
                        ui.label(msg);
                    }
                    None => {
                        ui.label(egui::RichText::new("Ready").weak());
                    }
                }
            });
        });
    }
}

impl eframe::App for GuiApp {
    // eframe 0.34 requires `ui`; the frame is still driven by `update`, which eframe calls first
    fn ui(&mut self, _ui: &mut egui::Ui, _frame: &mut eframe::Frame) {}

    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        if !self.initial_scale_applied {
            if let Some(scale) = self.ctx.gui_config.font_scale {
                ctx.set_zoom_factor(scale);
            }
            self.initial_scale_applied = true;
        }

        ctx.send_viewport_cmd(egui::ViewportCommand::Title(self.get_title_string()));

        self.poll_loader(ctx);
        self.handle_dropped_files(ctx);
        self.handle_hotkeys(ctx);

        if let Some(rect) = ctx.input(|i| i.viewport().inner_rect) {
            self.last_window_size = Some((rect.width() as u32, rect.height() as u32));
        }

        let panel = egui::SidePanel::left("control_panel")
            .resizable(true)
            .default_width(self.panel_width)
            .show(ctx, |ui| self.render_controls(ui));
        self.panel_width = panel.response.rect.width();

        self.render_status_bar(ctx);

        egui::CentralPanel::default().show(ctx, |ui| {
            render_track_map(&mut self.map, ui);
        });
        self.map.clamp_zoom();

        // Panning never gets here, only a zoom change that has come to rest
        if let Some(zoom) = self.zoom_settle.observe(self.map.zoom()) {
            debug!("Zoom settled at {:.2}", zoom);
            self.layer.on_zoom_end(&mut self.map);
            ctx.request_repaint();
        } else if self.zoom_settle.is_pending() {
            ctx.request_repaint();
        }

        if ctx.input(|i| i.viewport().close_requested()) {
            self.save_session();
        }
    }
}
