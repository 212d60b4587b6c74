//! Energy and force engines.
//!
//! The optimizer treats the force field as an opaque oracle: hand it a
//! [`Structure`], get back an [`Evaluation`] with the potential energy (eV) and
//! one force vector per atom (eV/Å). The [`EnergyOracle`] trait is that
//! contract. Implementations must be deterministic for identical positions.
//!
//! # Engines
//!
//! - [`ExternalCommand`]: runs an external program per evaluation. The program
//!   receives an extended XYZ file path as its last argument and prints
//!   `energy = <E>` followed by a `forces` block on stdout.
//! - [`LennardJones`]: built-in single-species pair potential.
//! - [`HarmonicWell`]: springs tying every atom to a reference position. A
//!   synthetic force field with a known minimum, for tests and demos.
//! - [`SpringNetwork`]: springs between atom pairs with reference rest
//!   lengths. Invariant under rigid motions, so it behaves like a bonded
//!   force field under a dihedral constraint.
//!
//! # External Program Protocol
//!
//! ```text
//! energy = -1234.567890
//! forces
//!   0.0123  -0.0456  0.0000
//!   ...one line per atom...
//! ```
//!
//! The environment carries `TORSOPT_DEVICE`, `TORSOPT_PRECISION`,
//! `TORSOPT_CHARGE` and `TORSOPT_SPIN`.

use crate::config::{EngineConfig, EngineKind};
use crate::geometry::Structure;
use crate::io;
use lazy_static::lazy_static;
use log::{debug, info};
use nalgebra::DVector;
use regex::Regex;
use std::fs;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use thiserror::Error;

/// Error type for engine evaluations.
///
/// Any of these is fatal for the run; the optimizer does not retry.
#[derive(Error, Debug)]
pub enum OracleError {
    /// File system or process spawning failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// The engine ran but reported failure
    #[error("energy calculation failed: {0}")]
    Calculation(String),
    /// Engine output could not be interpreted
    #[error("parse error: {0}")]
    Parse(String),
    /// Engine output was read but is unusable (wrong size, NaN, ...)
    #[error("invalid engine output: {0}")]
    InvalidOutput(String),
}

/// Type alias for engine results
pub type Result<T> = std::result::Result<T, OracleError>;

/// Energy and forces at one geometry.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    /// Potential energy in eV
    pub energy: f64,
    /// Forces (negative gradient) in eV/Å, flat like `Structure::coords`
    pub forces: DVector<f64>,
}

impl Evaluation {
    /// Checks that the evaluation matches the structure and is finite.
    ///
    /// # Examples
    ///
    /// ```
    /// use nalgebra::DVector;
    /// use torsopt::oracle::Evaluation;
    ///
    /// let ok = Evaluation { energy: -1.0, forces: DVector::zeros(6) };
    /// assert!(ok.validate(2).is_ok());
    ///
    /// let short = Evaluation { energy: -1.0, forces: DVector::zeros(3) };
    /// assert!(short.validate(2).is_err());
    /// ```
    pub fn validate(&self, num_atoms: usize) -> Result<()> {
        if !self.energy.is_finite() {
            return Err(OracleError::InvalidOutput(format!(
                "energy is not finite ({})",
                self.energy
            )));
        }

        let expected = num_atoms * 3;
        if self.forces.len() != expected {
            return Err(OracleError::InvalidOutput(format!(
                "force/geometry mismatch: expected {} force components for {} atoms, got {}",
                expected,
                num_atoms,
                self.forces.len()
            )));
        }

        if let Some(pos) = self.forces.iter().position(|f| !f.is_finite()) {
            return Err(OracleError::InvalidOutput(format!(
                "force component {} on atom {} is not finite",
                pos % 3,
                pos / 3 + 1
            )));
        }

        Ok(())
    }
}

/// Contract every energy engine implements.
pub trait EnergyOracle {
    /// Computes energy and forces for the current positions of `structure`.
    ///
    /// # Errors
    ///
    /// Any [`OracleError`]; the caller treats it as fatal.
    fn evaluate(&mut self, structure: &Structure) -> Result<Evaluation>;

    /// Short name used in log messages.
    fn name(&self) -> &str {
        "engine"
    }
}

/// Builds the engine selected in `config`.
pub fn build_oracle(config: &EngineConfig) -> Result<Box<dyn EnergyOracle>> {
    match config.kind {
        EngineKind::LennardJones => Ok(Box::new(LennardJones::from_config(config))),
        EngineKind::Command => Ok(Box::new(ExternalCommand::new(config)?)),
    }
}

/// Engine that shells out to an external program for every evaluation.
#[derive(Debug, Clone)]
pub struct ExternalCommand {
    program: String,
    args: Vec<String>,
    device: String,
    precision: String,
    workdir: PathBuf,
    calls: usize,
}

impl ExternalCommand {
    /// Creates the engine from its configuration.
    ///
    /// # Errors
    ///
    /// [`OracleError::Calculation`] if no command is configured.
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let mut parts = config.command.split_whitespace().map(str::to_string);
        let program = parts.next().ok_or_else(|| {
            OracleError::Calculation(
                "engine kind is 'command' but no engine command was configured".into(),
            )
        })?;
        info!(
            "External engine: {} (device={}, precision={})",
            config.command, config.device, config.precision
        );
        Ok(Self {
            program,
            args: parts.collect(),
            device: config.device.clone(),
            precision: config.precision.clone(),
            workdir: config.workdir.clone(),
            calls: 0,
        })
    }

    /// Number of completed evaluations.
    pub fn calls(&self) -> usize {
        self.calls
    }

    fn input_path(&self) -> PathBuf {
        self.workdir
            .join(format!("torsopt_engine_{}.xyz", std::process::id()))
    }
}

impl EnergyOracle for ExternalCommand {
    fn evaluate(&mut self, structure: &Structure) -> Result<Evaluation> {
        let input_path = self.input_path();
        fs::write(
            &input_path,
            io::format_xyz(structure, &io::extxyz_comment(structure)),
        )?;

        debug!(
            "Running engine call {}: {} {:?} {}",
            self.calls + 1,
            self.program,
            self.args,
            input_path.display()
        );
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(&input_path)
            .env("TORSOPT_DEVICE", &self.device)
            .env("TORSOPT_PRECISION", &self.precision)
            .env("TORSOPT_CHARGE", io::format_float(structure.charge))
            .env("TORSOPT_SPIN", io::format_float(structure.spin))
            .stdin(Stdio::null())
            .output()?;

        if !output.status.success() {
            return Err(OracleError::Calculation(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let evaluation = parse_engine_output(&stdout, structure.num_atoms)?;
        self.calls += 1;
        Ok(evaluation)
    }

    fn name(&self) -> &str {
        &self.program
    }
}

lazy_static! {
    static ref FLOAT_RE: String = r"[-+]?(?:\d+\.\d*|\.\d+|\d+)(?:[eEdD][-+]?\d+)?".to_string();

    // "energy = -1.23", "Energy: -1.23", "ENERGY -1.23"
    static ref ENERGY_RE: Regex = Regex::new(&format!(
        r"(?i)^\s*energy\s*[:=]?\s*({0})\s*(?:ev)?\s*$",
        *FLOAT_RE
    )).unwrap();

    static ref FORCES_RE: Regex = Regex::new(r"(?i)^\s*forces\s*:?\s*$").unwrap();

    static ref VECTOR_RE: Regex = Regex::new(&format!(
        r"^\s*({0})\s+({0})\s+({0})\s*$",
        *FLOAT_RE
    )).unwrap();
}

fn parse_float(token: &str) -> Result<f64> {
    token
        .replace(['d', 'D'], "e")
        .parse()
        .map_err(|_| OracleError::Parse(format!("invalid number '{}'", token)))
}

/// Parses the stdout of an external engine.
///
/// # Errors
///
/// [`OracleError::Parse`] if the energy line or the forces block is missing
/// or malformed; [`OracleError::InvalidOutput`] if the values fail
/// [`Evaluation::validate`].
pub fn parse_engine_output(text: &str, num_atoms: usize) -> Result<Evaluation> {
    let mut energy = None;
    let mut forces = Vec::with_capacity(num_atoms * 3);
    let mut lines = text.lines();

    while let Some(line) = lines.next() {
        if let Some(caps) = ENERGY_RE.captures(line) {
            energy = Some(parse_float(&caps[1])?);
        } else if FORCES_RE.is_match(line) {
            for atom in 0..num_atoms {
                let row = lines.next().ok_or_else(|| {
                    OracleError::Parse(format!(
                        "forces block ended after {} of {} atoms",
                        atom, num_atoms
                    ))
                })?;
                let caps = VECTOR_RE.captures(row).ok_or_else(|| {
                    OracleError::Parse(format!("malformed force line for atom {}: '{}'", atom + 1, row))
                })?;
                for k in 1..=3 {
                    forces.push(parse_float(&caps[k])?);
                }
            }
        }
    }

    let energy = energy.ok_or_else(|| OracleError::Parse("no energy line in engine output".into()))?;
    if forces.is_empty() && num_atoms > 0 {
        return Err(OracleError::Parse("no forces block in engine output".into()));
    }

    let evaluation = Evaluation {
        energy,
        forces: DVector::from_vec(forces),
    };
    evaluation.validate(num_atoms)?;
    Ok(evaluation)
}

/// Single-species 12-6 Lennard-Jones pair potential without cutoff.
///
/// ```text
/// E = Σ_{i<j} 4ε [(σ/r)^12 - (σ/r)^6]
/// ```
///
/// The cell is ignored (no periodic images).
#[derive(Debug, Clone)]
pub struct LennardJones {
    /// Well depth in eV
    pub epsilon: f64,
    /// Zero-crossing distance in Å
    pub sigma: f64,
}

impl LennardJones {
    /// Creates a potential with explicit parameters.
    pub fn new(epsilon: f64, sigma: f64) -> Self {
        Self { epsilon, sigma }
    }

    /// Creates the potential from engine settings.
    pub fn from_config(config: &EngineConfig) -> Self {
        debug!(
            "Lennard-Jones engine (epsilon={} eV, sigma={} Å) runs in double precision on the cpu; requested device={}, precision={}",
            config.lj_epsilon, config.lj_sigma, config.device, config.precision
        );
        Self::new(config.lj_epsilon, config.lj_sigma)
    }
}

impl EnergyOracle for LennardJones {
    fn evaluate(&mut self, structure: &Structure) -> Result<Evaluation> {
        let n = structure.num_atoms;
        let mut energy = 0.0;
        let mut forces = DVector::zeros(n * 3);

        for i in 0..n {
            let pi = structure.position(i);
            for j in (i + 1)..n {
                let rij = structure.position(j) - pi;
                let r2 = rij.norm_squared();
                if r2 == 0.0 {
                    return Err(OracleError::Calculation(format!(
                        "atoms {} and {} overlap",
                        i + 1,
                        j + 1
                    )));
                }
                let sr6 = (self.sigma * self.sigma / r2).powi(3);
                let sr12 = sr6 * sr6;
                energy += 4.0 * self.epsilon * (sr12 - sr6);

                // F_j = 24ε (2 sr12 - sr6) / r² · r_ij, F_i = -F_j
                let scale = 24.0 * self.epsilon * (2.0 * sr12 - sr6) / r2;
                for k in 0..3 {
                    forces[j * 3 + k] += scale * rij[k];
                    forces[i * 3 + k] -= scale * rij[k];
                }
            }
        }

        let evaluation = Evaluation { energy, forces };
        evaluation.validate(n)?;
        Ok(evaluation)
    }

    fn name(&self) -> &str {
        "lennard-jones"
    }
}

/// Independent isotropic springs from each atom to a reference position.
///
/// ```text
/// E = ½ k Σ |x - x0|²,   F = -k (x - x0)
/// ```
///
/// The minimum is the reference geometry with zero energy, which makes it a
/// convenient well-posed force field for checking the optimizer.
///
/// The well is not invariant under rotations. With a dihedral held far from
/// its reference value, the cheapest way to satisfy the constraint is to make
/// three of the four atoms collinear, so the constrained energy keeps falling
/// towards that degenerate geometry and has no regular minimum. Use
/// [`SpringNetwork`] for constrained runs away from the reference dihedral.
#[derive(Debug, Clone)]
pub struct HarmonicWell {
    reference: DVector<f64>,
    k: f64,
    calls: usize,
}

impl HarmonicWell {
    /// Creates a well around `reference` (flat coordinates) with stiffness `k`
    /// in eV/Å².
    pub fn new(reference: DVector<f64>, k: f64) -> Self {
        Self {
            reference,
            k,
            calls: 0,
        }
    }

    /// Creates a well around the current positions of `structure`.
    pub fn around(structure: &Structure, k: f64) -> Self {
        Self::new(structure.coords.clone(), k)
    }

    /// Number of evaluations performed so far.
    pub fn calls(&self) -> usize {
        self.calls
    }
}

impl EnergyOracle for HarmonicWell {
    fn evaluate(&mut self, structure: &Structure) -> Result<Evaluation> {
        if structure.coords.len() != self.reference.len() {
            return Err(OracleError::InvalidOutput(format!(
                "reference has {} coordinates, structure has {}",
                self.reference.len(),
                structure.coords.len()
            )));
        }
        let displacement = &structure.coords - &self.reference;
        self.calls += 1;
        Ok(Evaluation {
            energy: 0.5 * self.k * displacement.norm_squared(),
            forces: displacement * -self.k,
        })
    }

    fn name(&self) -> &str {
        "harmonic-well"
    }
}

/// Harmonic springs between atom pairs, at rest in a reference geometry.
///
/// ```text
/// E = ½ Σ k_ij (|x_i - x_j| - r_ij)²
/// ```
///
/// Only interatomic distances enter the energy, so translations and rotations
/// cost nothing and forces sum to zero.
#[derive(Debug, Clone)]
pub struct SpringNetwork {
    /// (i, j, stiffness in eV/Å², rest length in Å)
    springs: Vec<(usize, usize, f64, f64)>,
    num_atoms: usize,
    calls: usize,
}

impl SpringNetwork {
    /// Creates springs `(i, j, k)` (0-based atoms, stiffness in eV/Å²) whose
    /// rest lengths are the distances in `reference`.
    ///
    /// # Errors
    ///
    /// [`OracleError::InvalidOutput`] if a spring names an atom outside
    /// `reference` or joins an atom to itself.
    pub fn new(reference: &Structure, springs: &[(usize, usize, f64)]) -> Result<Self> {
        let n = reference.num_atoms;
        let springs = springs
            .iter()
            .map(|&(i, j, k)| {
                if i >= n || j >= n || i == j {
                    return Err(OracleError::InvalidOutput(format!(
                        "spring {}-{} is invalid for {} atoms",
                        i, j, n
                    )));
                }
                let rest = (reference.position(j) - reference.position(i)).norm();
                Ok((i, j, k, rest))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            springs,
            num_atoms: n,
            calls: 0,
        })
    }

    /// Number of evaluations performed so far.
    pub fn calls(&self) -> usize {
        self.calls
    }
}

impl EnergyOracle for SpringNetwork {
    fn evaluate(&mut self, structure: &Structure) -> Result<Evaluation> {
        if structure.num_atoms != self.num_atoms {
            return Err(OracleError::InvalidOutput(format!(
                "network has {} atoms, structure has {}",
                self.num_atoms, structure.num_atoms
            )));
        }
        self.calls += 1;

        let mut energy = 0.0;
        let mut forces = DVector::zeros(self.num_atoms * 3);
        for &(i, j, k, rest) in &self.springs {
            let rij = structure.position(j) - structure.position(i);
            let r = rij.norm();
            if r == 0.0 {
                return Err(OracleError::Calculation(format!(
                    "atoms {} and {} overlap",
                    i + 1,
                    j + 1
                )));
            }
            let stretch = r - rest;
            energy += 0.5 * k * stretch * stretch;

            // F_j = -k (r - r0) r_ij / r, F_i = -F_j
            let pull = rij * (k * stretch / r);
            for c in 0..3 {
                forces[i * 3 + c] += pull[c];
                forces[j * 3 + c] -= pull[c];
            }
        }

        Ok(Evaluation { energy, forces })
    }

    fn name(&self) -> &str {
        "spring-network"
    }
}
