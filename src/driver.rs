//! One constrained optimization run, from request to report.
//!
//! [`run`] turns the user's 1-based dihedral request into a validated
//! constraint, derives the target from the input geometry when no angle was
//! given, drives the optimizer and measures the dihedral that was actually
//! achieved. The resulting [`RunReport`] knows how to render the output
//! comment line and a serializable [`RunSummary`].

use crate::angles::{normalize_to_0_360, GeometryError};
use crate::config::Config;
use crate::constraints::{ConstraintError, DihedralConstraint, DihedralSpec};
use crate::geometry::Structure;
use crate::io::format_float;
use crate::optimizer::{self, OptimizationResult, OptimizeError, StepRecord, Termination};
use crate::oracle::EnergyOracle;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that abort a run. No output should be written for any of them.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Constraint(#[from] ConstraintError),
    #[error(transparent)]
    Geometry(#[from] GeometryError),
    #[error(transparent)]
    Optimize(#[from] OptimizeError),
}

/// Dihedral to hold fixed, as the user states it.
#[derive(Debug, Clone, PartialEq)]
pub struct DihedralRequest {
    /// Four 1-based atom indices i, j, k, l
    pub indices: [usize; 4],
    /// Target in degrees; `None` keeps the angle of the input geometry
    pub angle: Option<f64>,
}

impl DihedralRequest {
    /// Builds a request from command-line values.
    ///
    /// An angle without indices is ignored with a warning and the run is
    /// unconstrained. A present but valueless angle (`Some(None)`) keeps the
    /// current dihedral.
    ///
    /// # Errors
    ///
    /// [`ConstraintError::InvalidIndex`] unless exactly four indices are given.
    pub fn from_args(
        indices: Option<&[usize]>,
        angle: Option<Option<f64>>,
    ) -> Result<Option<Self>, ConstraintError> {
        let Some(indices) = indices else {
            if let Some(angle) = angle {
                warn!(
                    "Dihedral angle {:?} given without dihedral indices; ignoring it",
                    angle
                );
            }
            return Ok(None);
        };
        let indices: [usize; 4] = indices.try_into().map_err(|_| {
            ConstraintError::InvalidIndex(format!(
                "expected four dihedral indices, got {}",
                indices.len()
            ))
        })?;
        Ok(Some(Self {
            indices,
            angle: angle.flatten(),
        }))
    }
}

/// Where the constraint target came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintSource {
    /// Measured on the input structure
    FixedCurrent,
    /// Given explicitly
    UserSpecified,
}

impl ConstraintSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ConstraintSource::FixedCurrent => "fixed_current",
            ConstraintSource::UserSpecified => "user_specified",
        }
    }
}

/// Constraint details of a finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DihedralOutcome {
    /// 1-based atom indices as requested
    pub indices: [usize; 4],
    /// Target used during optimization (degrees, not normalized)
    pub target: f64,
    /// Dihedral of the final structure in [0, 360)
    pub achieved_angle: f64,
    pub source: ConstraintSource,
}

/// Everything a caller needs after a run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub result: OptimizationResult,
    pub dihedral: Option<DihedralOutcome>,
}

/// Serializable digest of a [`RunReport`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub converged: bool,
    pub termination: Termination,
    pub energy: f64,
    pub max_force: f64,
    pub steps: usize,
    pub evaluations: usize,
    pub num_atoms: usize,
    pub charge: f64,
    pub spin: f64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub dihedral: Option<DihedralOutcome>,
}

impl RunReport {
    /// Comment line for the output XYZ file.
    ///
    /// # Examples
    ///
    /// Unconstrained runs give `energy=-1.234567 eV charge=0.0 spin=1.0`;
    /// constrained ones prepend the dihedral and append its source:
    ///
    /// ```text
    /// dihedral=1-2-3-4 actual_angle=60.00 energy=-1.234567 eV charge=0.0 spin=1.0 constraint_source=user_specified
    /// ```
    pub fn annotation(&self) -> String {
        let structure = &self.result.structure;
        let energy_part = format!(
            "energy={:.6} eV charge={} spin={}",
            self.result.energy,
            format_float(structure.charge),
            format_float(structure.spin)
        );

        match &self.dihedral {
            None => energy_part,
            Some(d) => format!(
                "dihedral={}-{}-{}-{} actual_angle={:.2} {} constraint_source={}",
                d.indices[0],
                d.indices[1],
                d.indices[2],
                d.indices[3],
                d.achieved_angle,
                energy_part,
                d.source.as_str()
            ),
        }
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            converged: self.result.converged(),
            termination: self.result.termination,
            energy: self.result.energy,
            max_force: self.result.max_force,
            steps: self.result.steps,
            evaluations: self.result.evaluations,
            num_atoms: self.result.structure.num_atoms,
            charge: self.result.structure.charge,
            spin: self.result.structure.spin,
            dihedral: self.dihedral.clone(),
        }
    }
}

/// Optimizes `structure`, optionally holding one dihedral fixed.
///
/// # Errors
///
/// - [`RunError::Constraint`] for an index of 0, out of range or repeated,
///   or a target that is not a finite number; raised before the oracle is
///   ever called
/// - [`RunError::Geometry`] if the requested atoms are collinear
/// - [`RunError::Optimize`] for engine failures during the run
pub fn run(
    structure: Structure,
    oracle: &mut dyn EnergyOracle,
    request: Option<&DihedralRequest>,
    config: &Config,
) -> Result<RunReport, RunError> {
    run_with_observer(structure, oracle, request, config, |_| {})
}

/// Like [`run`], forwarding every optimizer iteration to `observer`.
pub fn run_with_observer<F>(
    mut structure: Structure,
    oracle: &mut dyn EnergyOracle,
    request: Option<&DihedralRequest>,
    config: &Config,
    observer: F,
) -> Result<RunReport, RunError>
where
    F: FnMut(&StepRecord),
{
    let constraint = match request {
        Some(req) => Some(build_constraint(req, &structure, config)?),
        None => None,
    };

    info!(
        "Optimizing {} atoms with {} (fmax {} eV/A, max {} steps)",
        structure.num_atoms,
        oracle.name(),
        config.optimizer.fmax,
        config.optimizer.max_steps
    );

    let result = optimizer::optimize_with_observer(
        &mut structure,
        oracle,
        constraint.as_ref().map(|(c, _)| c),
        &config.optimizer,
        observer,
    )?;

    let dihedral = match (request, constraint) {
        (Some(req), Some((c, source))) => {
            let achieved = normalize_to_0_360(c.spec().measure(&result.structure.coords)?);
            info!(
                "Dihedral {}-{}-{}-{} ended at {:.2} deg (target {})",
                req.indices[0], req.indices[1], req.indices[2], req.indices[3], achieved,
                c.spec().target()
            );
            Some(DihedralOutcome {
                indices: req.indices,
                target: c.spec().target(),
                achieved_angle: achieved,
                source,
            })
        }
        _ => None,
    };

    Ok(RunReport { result, dihedral })
}

fn build_constraint(
    request: &DihedralRequest,
    structure: &Structure,
    config: &Config,
) -> Result<(DihedralConstraint, ConstraintSource), RunError> {
    let mut atoms = [0usize; 4];
    for (slot, &index) in atoms.iter_mut().zip(request.indices.iter()) {
        if index == 0 {
            return Err(ConstraintError::InvalidIndex(format!(
                "dihedral indices are 1-based, got {:?}",
                request.indices
            ))
            .into());
        }
        *slot = index - 1;
    }

    let (target, source) = match request.angle {
        Some(angle) => (angle, ConstraintSource::UserSpecified),
        None => {
            // Validate before measuring so bad indices never reach the geometry
            let checked = DihedralSpec::new(atoms, 0.0, structure.num_atoms)?;
            (checked.measure(&structure.coords)?, ConstraintSource::FixedCurrent)
        }
    };

    let spec = DihedralSpec::new(atoms, target, structure.num_atoms)?;
    info!(
        "Holding dihedral {:?} at {:.4} deg ({})",
        request.indices,
        target,
        source.as_str()
    );
    Ok((DihedralConstraint::new(spec, &config.constraint), source))
}
