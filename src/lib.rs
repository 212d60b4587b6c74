//! torsopt - Geometry Optimization with a Fixed Dihedral
//!
//! torsopt minimizes the energy of a molecular structure in Cartesian
//! coordinates while, optionally, holding one torsion angle i-j-k-l at a
//! target value. Energies and forces come from a pluggable engine: a built-in
//! Lennard-Jones potential, an external program, or any type implementing
//! [`oracle::EnergyOracle`].
//!
//! # Algorithm
//!
//! The minimizer is a BFGS quasi-Newton method over all 3N Cartesian
//! coordinates. A fixed dihedral φ is coupled in by projection:
//!
//! 1. **Forces**: the component along ∇φ is removed, so convergence is judged
//!    on the forces that can actually do work
//!    ```text
//!    f_c = f - (f·∇φ / |∇φ|²) ∇φ
//!    ```
//!
//! 2. **Steps**: the BFGS displacement loses its component along ∇φ, then
//!    minimal-norm Newton corrections along ∇φ return the dihedral to target
//!    ```text
//!    Δx += -(φ - φ₀) / |∇φ|² · ∇φ
//!    ```
//!
//! Every step must lower the energy enough (Armijo condition) to be kept;
//! otherwise the run returns to the previous geometry with a smaller trust
//! radius. A run is converged when no atom feels a constrained force above
//! `fmax` and the dihedral is on target.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::path::Path;
//! use torsopt::config::Config;
//! use torsopt::driver::{self, DihedralRequest};
//! use torsopt::io;
//! use torsopt::oracle::build_oracle;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let structure = io::read_xyz(Path::new("butane.xyz"))?;
//!     let mut engine = build_oracle(&config.engine)?;
//!
//!     let request = DihedralRequest { indices: [1, 2, 3, 4], angle: Some(60.0) };
//!     let report = driver::run(structure, engine.as_mut(), Some(&request), &config)?;
//!
//!     io::write_xyz(&report.result.structure, &report.annotation(), Path::new("out.xyz"))?;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`angles`] - Dihedral angle and its gradient
//! - [`geometry`] - Structure data model
//! - [`constraints`] - Fixed-dihedral projection
//! - [`hessian_update`] - BFGS curvature update
//! - [`oracle`] - Energy and force engines
//! - [`optimizer`] - Constrained BFGS minimizer
//! - [`driver`] - One run from request to report
//! - [`io`] - XYZ reading and writing
//! - [`config`] - Run configuration
//! - [`settings`] - Layered settings files

pub mod angles;
pub mod config;
pub mod constraints;
pub mod driver;
pub mod geometry;
pub mod hessian_update;
pub mod io;
pub mod optimizer;
pub mod oracle;
/// Settings file management
pub mod settings;

pub use config::Config;
pub use geometry::Structure;
