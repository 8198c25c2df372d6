mod app;
mod track_map;

pub use app::GuiApp;

pub const APP_TITLE: &str = "KML Strip";
