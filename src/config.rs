use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::declutter::{DeclutterError, LastMarkerPolicy, SensitivityRange};

const CONFIG_FILE_NAME: &str = "kmlstrip.conf";

// --- Declutter Config ---
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct DeclutterConfig {
    pub sensitivity_min: f64,
    pub sensitivity_max: f64,
    /// Slider position at startup, saved on exit
    pub sensitivity: f64,
    /// Never hide the last marker of a track (off: only the first is kept)
    pub keep_last_visible: bool,
}

impl Default for DeclutterConfig {
    fn default() -> Self {
        Self { sensitivity_min: 0.0, sensitivity_max: 100.0, sensitivity: 50.0, keep_last_visible: true }
    }
}

// --- Loader Config ---
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct LoaderConfig {
    /// Entry names tried in order when opening a KMZ
    pub kmz_entries: Vec<String>,
    /// Suggested file name for the cleaned output
    pub output_name: String,
}

fn default_kmz_entries() -> Vec<String> {
    vec!["view.kml".to_string(), "doc.kml".to_string()]
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self { kmz_entries: default_kmz_entries(), output_name: "view.kml".to_string() }
    }
}

// --- GUI Config ---
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct GuiConfig {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub panel_width: Option<f32>,
    pub font_scale: Option<f32>,
    /// Map centre and zoom before any track is loaded
    pub initial_lat: f64,
    pub initial_lon: f64,
    pub initial_zoom: f64,
}

impl Default for GuiConfig {
    fn default() -> Self {
        Self {
            width: Some(1280),
            height: Some(720),
            panel_width: Some(300.0),
            font_scale: Some(1.0),
            initial_lat: 50.0,
            initial_lon: -30.0,
            initial_zoom: 3.0,
        }
    }
}

#[derive(Serialize, Deserialize, Default, Clone, Debug, PartialEq)]
struct Config {
    #[serde(default)]
    declutter: DeclutterConfig,
    #[serde(default)]
    loader: LoaderConfig,
    #[serde(default)]
    gui: GuiConfig,
}

/// Settings shared by the CLI and the GUI.
#[derive(Debug, Clone)]
pub struct AppContext {
    /// None when running without a config file
    pub config_path: Option<PathBuf>,
    pub declutter: DeclutterConfig,
    pub loader: LoaderConfig,
    pub gui_config: GuiConfig,
}

impl AppContext {
    /// Load (or create) the config file in the user's config directory.
    pub fn new() -> Result<Self> {
        let config_dir = dirs::config_dir().context("No config dir found")?;
        fs::create_dir_all(&config_dir)
            .with_context(|| format!("Cannot create config dir {:?}", config_dir))?;
        Self::load_from(&config_dir.join(CONFIG_FILE_NAME))
    }

    /// Built-in defaults, nothing read or written.
    pub fn defaults() -> Self {
        Self::from_config(None, Config::default())
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config = if config_path.exists() {
            let content = fs::read_to_string(config_path)
                .with_context(|| format!("Cannot read config {:?}", config_path))?;
            debug!("Loading config from {:?}", config_path);
            let cfg: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config {:?}", config_path))?;

            // Write back defaults if new sections missing
            let raw_value: toml::Table = toml::from_str(&content).unwrap_or_default();
            let missing: Vec<&str> =
                ["declutter", "loader", "gui"].into_iter().filter(|s| !raw_value.contains_key(*s)).collect();
            if !missing.is_empty() {
                debug!("Writing back defaults for missing sections {:?}", missing);
                write_config(config_path, &cfg)?;
            }
            cfg
        } else {
            let cfg = Config::default();
            write_config(config_path, &cfg)?;
            info!("Created default config at {:?}", config_path);
            cfg
        };

        Ok(Self::from_config(Some(config_path.to_path_buf()), config))
    }

    fn from_config(config_path: Option<PathBuf>, config: Config) -> Self {
        Self { config_path, declutter: config.declutter, loader: config.loader, gui_config: config.gui }
    }

    pub fn sensitivity_range(&self) -> Result<SensitivityRange, DeclutterError> {
        SensitivityRange::new(self.declutter.sensitivity_min, self.declutter.sensitivity_max)
    }

    pub fn policy(&self) -> LastMarkerPolicy {
        LastMarkerPolicy::from_keep_last(self.declutter.keep_last_visible)
    }

    /// Persist window geometry and the declutter controls. Other settings in
    /// the file are left as they are on disk.
    pub fn save_session(&self, gui_config: &GuiConfig, sensitivity: f64, keep_last_visible: bool) -> Result<()> {
        let Some(config_path) = &self.config_path else {
            return Ok(());
        };

        let mut cfg: Config = if config_path.exists() {
            let content = fs::read_to_string(config_path)?;
            toml::from_str(&content).with_context(|| format!("Failed to parse config {:?}", config_path))?
        } else {
            Config::default()
        };
        cfg.gui = gui_config.clone();
        cfg.declutter.sensitivity = sensitivity;
        cfg.declutter.keep_last_visible = keep_last_visible;

        debug!("Saving session to {:?}: {:?}", config_path, cfg.gui);
        write_config(config_path, &cfg)
    }
}

fn write_config(path: &Path, cfg: &Config) -> Result<()> {
    let toml_str = toml::to_string_pretty(cfg)?;
    fs::write(path, toml_str).with_context(|| format!("Cannot write config {:?}", path))
}
