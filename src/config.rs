//! Run configuration.
//!
//! - [`Config`]: everything one optimization run needs besides the structure
//! - [`OptimizerConfig`]: convergence threshold, step budget, trust radius
//! - [`ConstraintConfig`]: tolerances for the dihedral projection
//! - [`EngineConfig`]: which energy engine to use and how to run it
//!
//! Values come from built-in defaults, optionally overridden by settings
//! files (see [`settings`](crate::settings)) and then by command-line flags.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Complete configuration for one run.
///
/// # Examples
///
/// ```
/// use torsopt::config::Config;
///
/// let mut config = Config::default();
/// config.optimizer.fmax = 0.01;
/// config.optimizer.max_steps = 500;
/// assert_eq!(config.constraint.max_iterations, 50);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Minimizer settings
    pub optimizer: OptimizerConfig,
    /// Dihedral constraint settings
    pub constraint: ConstraintConfig,
    /// Energy engine settings
    pub engine: EngineConfig,
}

/// Settings for the BFGS minimizer.
///
/// # Default Values
///
/// - `fmax`: 0.05 eV/Å
/// - `max_steps`: 1000
/// - `max_step`: 0.2 Å per atom
/// - `initial_curvature`: 70 eV/Å²
/// - `max_wall_time`: none
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Converged when the largest per-atom force norm is at or below this (eV/Å)
    pub fmax: f64,
    /// Maximum number of optimizer steps before giving up
    pub max_steps: usize,
    /// Maximum displacement of any single atom in one step (Å)
    pub max_step: f64,
    /// Diagonal of the initial Hessian guess (eV/Å²)
    pub initial_curvature: f64,
    /// Optional wall-clock budget in seconds; exceeding it ends the run like
    /// running out of steps
    pub max_wall_time: Option<f64>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            fmax: 0.05,
            max_steps: 1000,
            max_step: 0.2,
            initial_curvature: 70.0,
            max_wall_time: None,
        }
    }
}

/// Settings for the dihedral constraint projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintConfig {
    /// Allowed deviation from the target angle (degrees)
    pub tolerance: f64,
    /// Maximum correction iterations per projected step
    pub max_iterations: usize,
}

impl Default for ConstraintConfig {
    fn default() -> Self {
        Self {
            tolerance: 1e-4,
            max_iterations: 50,
        }
    }
}

/// Energy engine kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineKind {
    /// Built-in Lennard-Jones pair potential
    #[default]
    LennardJones,
    /// External program run once per evaluation
    Command,
}

impl EngineKind {
    /// Parses the names used in settings files and on the command line.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "lennard-jones" | "lennard_jones" | "lj" => Some(EngineKind::LennardJones),
            "command" | "external" => Some(EngineKind::Command),
            _ => None,
        }
    }
}

/// How the energy engine is constructed.
///
/// The device and precision are handed to the engine explicitly at
/// construction time; no engine reads them from global state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Which engine to use
    pub kind: EngineKind,
    /// Command line for [`EngineKind::Command`] (program followed by arguments)
    pub command: String,
    /// Compute device requested from the engine (e.g. "cpu", "cuda")
    pub device: String,
    /// Numerical precision requested from the engine (e.g. "float32-high")
    pub precision: String,
    /// Directory for engine input files
    pub workdir: PathBuf,
    /// Lennard-Jones well depth (eV)
    pub lj_epsilon: f64,
    /// Lennard-Jones zero-crossing distance (Å)
    pub lj_sigma: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kind: EngineKind::LennardJones,
            command: String::new(),
            device: "cpu".to_string(),
            precision: "float32-high".to_string(),
            workdir: std::env::temp_dir(),
            lj_epsilon: 0.0103,
            lj_sigma: 3.4,
        }
    }
}
