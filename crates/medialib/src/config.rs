//! Configuration loading and parsing.
//!
//! Defines the library config schema and resolves defaults.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use medialib_types::EqualizerSettings;
use serde::Deserialize;

use crate::equalizer;
use crate::library::ScanOptions;

/// Directory under the media root holding the database and state files.
pub const DATA_DIR_NAME: &str = ".medialib";
pub const DEFAULT_DEBOUNCE_MS: u64 = 750;

/// Top-level configuration loaded from TOML.
#[derive(Debug, Default, Deserialize)]
pub struct LibraryConfig {
    /// Media library root directory.
    pub media_dir: Option<String>,
    /// Optional full path to the SQLite library file.
    pub db_path: Option<String>,
    /// Directory for now-playing state and cover art.
    pub data_dir: Option<String>,
    pub scan: Option<ScanConfig>,
    pub watch: Option<WatchConfig>,
    pub equalizer: Option<EqualizerConfig>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ScanConfig {
    /// Supported file extensions (defaults to the built-in list).
    pub extensions: Option<Vec<String>>,
    /// Skip files shorter than this many milliseconds.
    pub min_duration_ms: Option<u64>,
    pub follow_symlinks: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct WatchConfig {
    /// Quiet period before collected changes are applied.
    pub debounce_ms: Option<u64>,
}

/// Equalizer state persisted in config.
#[derive(Debug, Default, Deserialize)]
pub struct EqualizerConfig {
    pub enabled: Option<bool>,
    pub preset: Option<u16>,
    pub band_levels: Option<Vec<i16>>,
    pub bass_boost: Option<u16>,
    pub virtualizer: Option<u16>,
}

impl LibraryConfig {
    /// Load configuration from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            std::fs::read_to_string(path).with_context(|| format!("read config {:?}", path))?;
        let cfg = toml::from_str::<LibraryConfig>(&raw)
            .with_context(|| format!("parse config {:?}", path))?;
        Ok(cfg)
    }
}

/// Load the config named by `--config`, else `config.toml` next to the
/// executable, else defaults. Returns the path the config came from.
pub fn load_config(path: Option<&PathBuf>) -> Result<(LibraryConfig, Option<PathBuf>)> {
    if let Some(path) = path {
        return Ok((LibraryConfig::load(path)?, Some(path.clone())));
    }
    let exe_config = std::env::current_exe()
        .ok()
        .and_then(|path| path.parent().map(|dir| dir.join("config.toml")));
    match exe_config {
        Some(path) if path.exists() => Ok((LibraryConfig::load(&path)?, Some(path))),
        _ => Ok((LibraryConfig::default(), None)),
    }
}

/// Extract the media directory from config.
pub fn media_dir_from_config(cfg: &LibraryConfig) -> Result<PathBuf> {
    let dir = cfg
        .media_dir
        .as_deref()
        .map(str::trim)
        .filter(|dir| !dir.is_empty())
        .ok_or_else(|| anyhow::anyhow!("media_dir is required; set it in config or pass --media-dir"))?;
    Ok(PathBuf::from(dir))
}

fn optional_path(raw: Option<&str>) -> Option<PathBuf> {
    raw.and_then(|path| {
        let trimmed = path.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(PathBuf::from(trimmed))
        }
    })
}

/// Data directory from config, defaulting to `<media_dir>/.medialib`.
pub fn data_dir_from_config(cfg: &LibraryConfig, media_dir: &Path) -> PathBuf {
    optional_path(cfg.data_dir.as_deref()).unwrap_or_else(|| media_dir.join(DATA_DIR_NAME))
}

/// Database path from config, defaulting to `library.sqlite` in the data dir.
pub fn db_path_from_config(cfg: &LibraryConfig, media_dir: &Path) -> PathBuf {
    optional_path(cfg.db_path.as_deref())
        .unwrap_or_else(|| data_dir_from_config(cfg, media_dir).join("library.sqlite"))
}

pub fn scan_options_from_config(cfg: &LibraryConfig) -> ScanOptions {
    let mut options = ScanOptions::default();
    let Some(scan) = cfg.scan.as_ref() else {
        return options;
    };
    if let Some(extensions) = scan.extensions.as_ref().filter(|v| !v.is_empty()) {
        options.extensions = extensions
            .iter()
            .map(|ext| ext.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|ext| !ext.is_empty())
            .collect();
    }
    if let Some(min) = scan.min_duration_ms {
        options.min_duration_ms = min;
    }
    if let Some(follow) = scan.follow_symlinks {
        options.follow_symlinks = follow;
    }
    options
}

pub fn debounce_from_config(cfg: &LibraryConfig) -> std::time::Duration {
    let ms = cfg
        .watch
        .as_ref()
        .and_then(|watch| watch.debounce_ms)
        .unwrap_or(DEFAULT_DEBOUNCE_MS);
    std::time::Duration::from_millis(ms)
}

/// Equalizer settings from config over the defaults, clamped into range.
pub fn equalizer_from_config(cfg: &LibraryConfig) -> EqualizerSettings {
    let mut settings = equalizer::default_settings();
    if let Some(eq) = cfg.equalizer.as_ref() {
        if let Some(enabled) = eq.enabled {
            settings.enabled = enabled;
        }
        settings.preset = eq.preset;
        if let Some(levels) = eq.band_levels.as_ref().filter(|v| !v.is_empty()) {
            settings.band_levels = levels.clone();
        }
        if let Some(strength) = eq.bass_boost {
            settings.bass_boost = strength;
        }
        if let Some(strength) = eq.virtualizer {
            settings.virtualizer = strength;
        }
    }
    equalizer::normalize(&mut settings);
    settings
}

/// Rewrite the `[equalizer]` table in place, keeping the rest of the file
/// (comments included) as it was. A missing file is created.
pub fn update_equalizer_settings(path: &Path, settings: &EqualizerSettings) -> Result<()> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(err) => return Err(err).with_context(|| format!("read config {:?}", path)),
    };
    let mut doc = raw
        .parse::<toml_edit::DocumentMut>()
        .with_context(|| format!("parse config {:?}", path))?;

    let mut table = toml_edit::Table::new();
    table["enabled"] = toml_edit::value(settings.enabled);
    if let Some(preset) = settings.preset {
        table["preset"] = toml_edit::value(i64::from(preset));
    }
    let mut levels = toml_edit::Array::new();
    for level in &settings.band_levels {
        levels.push(i64::from(*level));
    }
    table["band_levels"] = toml_edit::value(levels);
    table["bass_boost"] = toml_edit::value(i64::from(settings.bass_boost));
    table["virtualizer"] = toml_edit::value(i64::from(settings.virtualizer));
    doc["equalizer"] = toml_edit::Item::Table(table);

    std::fs::write(path, doc.to_string()).with_context(|| format!("write config {:?}", path))?;
    tracing::debug!(path = %path.display(), "saved equalizer settings");
    Ok(())
}
