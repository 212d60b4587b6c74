//! Settings files for torsopt.
//!
//! Defaults for the optimizer, the constraint projection, the energy engine
//! and logging can be changed through INI-format settings files. Files are
//! layered; each one overrides only the keys it sets, with this precedence
//! (highest first):
//!
//! 1. File given with `--settings`
//! 2. Local settings (`./torsopt.cfg`)
//! 3. User settings (`~/.config/torsopt/torsopt.cfg`)
//! 4. System settings (`/etc/torsopt/torsopt.cfg`)
//! 5. Built-in defaults
//!
//! Command-line flags are applied on top of the result by the binary.
//!
//! # Settings File Format
//!
//! ```ini
//! [optimizer]
//! fmax = 0.05
//! max_steps = 1000
//! max_step = 0.2
//! initial_curvature = 70.0
//! max_wall_time = none
//!
//! [constraint]
//! tolerance = 1e-4
//! max_iterations = 50
//!
//! [engine]
//! kind = lennard-jones
//! command =
//! device = cpu
//! precision = float32-high
//!
//! [logging]
//! level = info
//! ```

use crate::config::{Config, EngineKind};
use configparser::ini::Ini;
use log::{debug, info, warn, LevelFilter};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Name of settings files at every level.
pub const SETTINGS_FILE_NAME: &str = "torsopt.cfg";

/// Errors that can occur while loading settings.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// I/O error when reading settings files
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// INI parsing error
    #[error("INI parsing error: {0}")]
    IniParse(String),
    /// Invalid settings value
    #[error("Invalid settings value: {0}")]
    InvalidValue(String),
}

/// Everything a settings file can change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Run configuration
    pub config: Config,
    /// Logging configuration
    pub logging: LoggingSettings,
}

/// Logging configuration settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level: off, error, warn, info, debug or trace (default: "info")
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl LoggingSettings {
    /// The configured level as a filter for the logger.
    pub fn level_filter(&self) -> LevelFilter {
        LevelFilter::from_str(&self.level).unwrap_or(LevelFilter::Info)
    }
}

/// Loads and layers settings files.
#[derive(Debug, Clone)]
pub struct SettingsManager {
    settings: Settings,
    config_source: String,
    skipped: Vec<(PathBuf, String)>,
}

impl SettingsManager {
    /// Loads settings from the standard locations.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with(None)
    }

    /// Loads settings from the standard locations plus an optional explicit
    /// file, which takes precedence over all of them.
    ///
    /// Unreadable files in the standard locations are skipped with a warning;
    /// an explicit file that cannot be read or parsed is an error.
    pub fn load_with(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let standard: Vec<PathBuf> = [
            Self::system_settings_path(),
            Self::user_settings_path(),
            Some(PathBuf::from(SETTINGS_FILE_NAME)),
        ]
        .into_iter()
        .flatten()
        .collect();
        Self::load_layers(&standard, explicit)
    }

    /// Applies `layers` in order (lowest precedence first), then `explicit`.
    fn load_layers(layers: &[PathBuf], explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut settings = Settings::default();
        let mut config_source = "built-in defaults".to_string();
        let mut skipped = Vec::new();

        for path in layers.iter().filter(|p| p.exists()) {
            // A bad file is dropped whole, never half-applied
            let mut layered = settings.clone();
            match Self::read_ini(path).and_then(|ini| apply_ini(&mut layered, &ini)) {
                Ok(()) => {
                    settings = layered;
                    config_source = path.display().to_string();
                    debug!("Loaded settings from: {}", path.display());
                }
                Err(e) => {
                    warn!("Failed to load settings from {}: {}", path.display(), e);
                    skipped.push((path.clone(), e.to_string()));
                }
            }
        }

        if let Some(path) = explicit {
            let ini = Self::read_ini(path)?;
            apply_ini(&mut settings, &ini)?;
            config_source = path.display().to_string();
            debug!("Loaded settings from: {}", path.display());
        }

        Ok(Self {
            settings,
            config_source,
            skipped,
        })
    }

    fn read_ini(path: &Path) -> Result<Ini, ConfigError> {
        let content = fs::read_to_string(path)?;
        parse_ini(content)
    }

    /// Description of the highest-precedence source that was applied.
    pub fn config_source(&self) -> &str {
        &self.config_source
    }

    /// Standard-location files that exist but could not be used, with the
    /// reason.
    pub fn skipped_files(&self) -> &[(PathBuf, String)] {
        &self.skipped
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn into_settings(self) -> Settings {
        self.settings
    }

    fn system_settings_path() -> Option<PathBuf> {
        #[cfg(unix)]
        {
            Some(PathBuf::from("/etc/torsopt").join(SETTINGS_FILE_NAME))
        }
        #[cfg(windows)]
        {
            std::env::var("PROGRAMDATA")
                .ok()
                .map(|pd| PathBuf::from(pd).join("torsopt").join(SETTINGS_FILE_NAME))
        }
    }

    fn user_settings_path() -> Option<PathBuf> {
        #[cfg(unix)]
        {
            std::env::var("HOME").ok().map(|home| {
                PathBuf::from(home)
                    .join(".config")
                    .join("torsopt")
                    .join(SETTINGS_FILE_NAME)
            })
        }
        #[cfg(windows)]
        {
            std::env::var("APPDATA")
                .ok()
                .map(|appdata| PathBuf::from(appdata).join("torsopt").join(SETTINGS_FILE_NAME))
        }
    }

    /// Writes a commented settings file holding every key at its default.
    pub fn create_template(path: &Path) -> Result<(), ConfigError> {
        fs::write(path, Self::generate_template_content())?;
        info!("Created settings template at: {}", path.display());
        Ok(())
    }

    fn generate_template_content() -> String {
        let defaults = Settings::default();
        let optimizer = &defaults.config.optimizer;
        let constraint = &defaults.config.constraint;
        let engine = &defaults.config.engine;
        format!(
            r#"# torsopt settings file
#
# Files are read in this order, later ones overriding individual keys:
#
# 1. /etc/torsopt/torsopt.cfg
# 2. ~/.config/torsopt/torsopt.cfg
# 3. ./torsopt.cfg
# 4. the file passed with --settings
#
# Command-line flags override everything. Missing keys keep their defaults.

[optimizer]
# Converged when no atom feels a force above this (eV/A)
fmax = {}

# Give up after this many steps
max_steps = {}

# Largest distance any atom may move in one step (A)
max_step = {}

# Diagonal of the starting Hessian (eV/A^2)
initial_curvature = {}

# Wall-clock limit in seconds, or none
max_wall_time = none

[constraint]
# Allowed deviation of the fixed dihedral from its target (degrees)
tolerance = {:e}

# Correction iterations per step before giving up with a warning
max_iterations = {}

[engine]
# lennard-jones or command
kind = lennard-jones

# Program and arguments for kind = command; the structure file is appended
command =

# Passed to external engines as TORSOPT_DEVICE and TORSOPT_PRECISION
device = {}
precision = {}

# Where engine input files are written (defaults to the system temp dir)
# workdir = /tmp

# Lennard-Jones parameters (eV, A)
lj_epsilon = {}
lj_sigma = {}

[logging]
# off, error, warn, info, debug, trace
level = {}
"#,
            optimizer.fmax,
            optimizer.max_steps,
            optimizer.max_step,
            optimizer.initial_curvature,
            constraint.tolerance,
            constraint.max_iterations,
            engine.device,
            engine.precision,
            engine.lj_epsilon,
            engine.lj_sigma,
            defaults.logging.level,
        )
    }
}

fn parse_ini(content: String) -> Result<Ini, ConfigError> {
    let mut ini = Ini::new();
    ini.read(content)
        .map_err(|e| ConfigError::IniParse(format!("Failed to parse INI: {}", e)))?;
    Ok(ini)
}

/// Parses settings text on top of the built-in defaults.
///
/// # Examples
///
/// ```
/// use torsopt::settings::parse_settings;
///
/// let settings = parse_settings("[optimizer]\nfmax = 0.01\n[logging]\nlevel = debug\n").unwrap();
/// assert_eq!(settings.config.optimizer.fmax, 0.01);
/// assert_eq!(settings.config.optimizer.max_steps, 1000);
/// assert_eq!(settings.logging.level, "debug");
/// ```
pub fn parse_settings(content: &str) -> Result<Settings, ConfigError> {
    let mut settings = Settings::default();
    apply_ini(&mut settings, &parse_ini(content.to_string())?)?;
    Ok(settings)
}

type Section = HashMap<String, Option<String>>;

/// Overrides the keys present in `ini`; everything else is left alone.
fn apply_ini(settings: &mut Settings, ini: &Ini) -> Result<(), ConfigError> {
    let map = ini.get_map_ref();

    if let Some(section) = map.get("optimizer") {
        apply_optimizer(settings, section)?;
    }
    if let Some(section) = map.get("constraint") {
        apply_constraint(settings, section)?;
    }
    if let Some(section) = map.get("engine") {
        apply_engine(settings, section)?;
    }
    if let Some(section) = map.get("logging") {
        if let Some(level) = value(section, "level") {
            LevelFilter::from_str(level)
                .map_err(|_| ConfigError::InvalidValue(format!("Invalid logging.level: {}", level)))?;
            settings.logging.level = level.to_lowercase();
        }
    }

    Ok(())
}

fn apply_optimizer(settings: &mut Settings, section: &Section) -> Result<(), ConfigError> {
    let optimizer = &mut settings.config.optimizer;

    if let Some(v) = value(section, "fmax") {
        optimizer.fmax = positive("optimizer.fmax", v)?;
    }
    if let Some(v) = value(section, "max_steps") {
        optimizer.max_steps = parsed("optimizer.max_steps", v)?;
    }
    if let Some(v) = value(section, "max_step") {
        optimizer.max_step = positive("optimizer.max_step", v)?;
    }
    if let Some(v) = value(section, "initial_curvature") {
        optimizer.initial_curvature = positive("optimizer.initial_curvature", v)?;
    }
    if let Some(v) = value(section, "max_wall_time") {
        optimizer.max_wall_time = match v.to_lowercase().as_str() {
            "none" | "off" => None,
            _ => Some(positive("optimizer.max_wall_time", v)?),
        };
    }

    Ok(())
}

fn apply_constraint(settings: &mut Settings, section: &Section) -> Result<(), ConfigError> {
    let constraint = &mut settings.config.constraint;

    if let Some(v) = value(section, "tolerance") {
        constraint.tolerance = positive("constraint.tolerance", v)?;
    }
    if let Some(v) = value(section, "max_iterations") {
        constraint.max_iterations = parsed("constraint.max_iterations", v)?;
    }

    Ok(())
}

fn apply_engine(settings: &mut Settings, section: &Section) -> Result<(), ConfigError> {
    let engine = &mut settings.config.engine;

    if let Some(v) = value(section, "kind") {
        engine.kind = EngineKind::parse(v)
            .ok_or_else(|| ConfigError::InvalidValue(format!("Invalid engine.kind: {}", v)))?;
    }
    if let Some(v) = value(section, "command") {
        engine.command = v.to_string();
    }
    if let Some(v) = value(section, "device") {
        engine.device = v.to_string();
    }
    if let Some(v) = value(section, "precision") {
        engine.precision = v.to_string();
    }
    if let Some(v) = value(section, "workdir") {
        engine.workdir = PathBuf::from(v);
    }
    if let Some(v) = value(section, "lj_epsilon") {
        engine.lj_epsilon = positive("engine.lj_epsilon", v)?;
    }
    if let Some(v) = value(section, "lj_sigma") {
        engine.lj_sigma = positive("engine.lj_sigma", v)?;
    }

    Ok(())
}

/// Non-empty value of `key`, trimmed.
fn value<'a>(section: &'a Section, key: &str) -> Option<&'a str> {
    match section.get(key) {
        Some(Some(v)) if !v.trim().is_empty() => Some(v.trim()),
        _ => None,
    }
}

fn parsed<T: FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.parse()
        .map_err(|_| ConfigError::InvalidValue(format!("Invalid {}: {}", key, raw)))
}

fn positive(key: &str, raw: &str) -> Result<f64, ConfigError> {
    let v: f64 = parsed(key, raw)?;
    if v.is_finite() && v > 0.0 {
        Ok(v)
    } else {
        Err(ConfigError::InvalidValue(format!(
            "{} must be a positive number, got {}",
            key, raw
        )))
    }
}
