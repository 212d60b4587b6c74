//! Quasi-Newton geometry optimization with an optional fixed dihedral.
//!
//! The minimizer is a Cartesian BFGS in the style of the ASE `BFGS` optimizer,
//! with an energy check on every step:
//!
//! 1. Start from `H = α·I` with α = [`OptimizerConfig::initial_curvature`].
//! 2. Each iteration evaluates the engine, projects the forces orthogonal to
//!    the constraint gradient and checks convergence (largest per-atom force
//!    norm ≤ `fmax`, constraint satisfied).
//! 3. The step `Δx = V·(Vᵀf / |ω|)` is taken in the eigenbasis of `H`, scaled so
//!    no atom moves more than the current trust radius, and then corrected by
//!    the constraint projection. If it is not a descent direction, `H` is reset
//!    and the step follows the forces.
//! 4. The new geometry is accepted when its energy satisfies the Armijo
//!    condition `E_new ≤ E - c₁·f·Δx`. Accepted steps refine `H` with the BFGS
//!    update and let the trust radius grow back towards `max_step`; rejected
//!    steps return to the previous geometry and halve the trust radius.
//!
//! With a constraint, the gradient difference in the BFGS update carries the
//! constraint force of the new geometry at both ends, so the curvature of the
//! constraint surface ends up in `H`.
//!
//! The run moves through [`OptimizerState`]s: `Initialized` → `Stepping` →
//! `Converged` or `MaxStepsExceeded`. Running out of steps (or out of wall
//! time) is a normal outcome reported in [`OptimizationResult`], not an error.

use crate::angles::GeometryError;
use crate::config::OptimizerConfig;
use crate::constraints::{project_step, remove_component, DihedralConstraint};
use crate::geometry::{max_atom_norm, Structure};
use crate::hessian_update::{initial_hessian, update_hessian_bfgs};
use crate::oracle::{EnergyOracle, OracleError};
use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use thiserror::Error;

/// Smallest curvature magnitude used when inverting the Hessian (eV/Å²).
const MIN_CURVATURE: f64 = 1e-6;

/// Sufficient-decrease parameter c₁ of the Armijo condition.
const ARMIJO_C1: f64 = 1e-4;

/// Trust radius, as a fraction of `max_step`, below which the curvature
/// estimate is discarded and the trust radius starts over.
const MIN_TRUST_FRACTION: f64 = 1e-4;

/// Exit status of the command-line tool for a run that stopped on its budget.
pub const EXIT_NOT_CONVERGED: i32 = 2;

/// Fatal optimizer failures.
#[derive(Error, Debug)]
pub enum OptimizeError {
    /// The energy engine failed or returned unusable data
    #[error("energy engine error: {0}")]
    Oracle(#[from] OracleError),
    /// The constrained atoms became collinear
    #[error("geometry error: {0}")]
    Geometry(#[from] GeometryError),
}

/// Where a run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerState {
    /// Constructed, no evaluation yet
    Initialized,
    /// At least one step taken
    Stepping,
    /// Force threshold met with the constraint satisfied
    Converged,
    /// Step or wall-time budget used up
    MaxStepsExceeded,
}

/// How a finished run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    Converged,
    MaxStepsExceeded,
}

impl Termination {
    pub fn is_converged(self) -> bool {
        matches!(self, Termination::Converged)
    }

    /// Process exit status: 0 when converged, [`EXIT_NOT_CONVERGED`] otherwise.
    pub fn exit_code(self) -> i32 {
        match self {
            Termination::Converged => 0,
            Termination::MaxStepsExceeded => EXIT_NOT_CONVERGED,
        }
    }
}

/// Snapshot handed to observers after every evaluation.
#[derive(Debug, Clone, Copy)]
pub struct StepRecord<'a> {
    /// Iteration number, 0 for the initial evaluation
    pub step: usize,
    /// Energy at `structure` (eV)
    pub energy: f64,
    /// Largest projected per-atom force norm (eV/Å)
    pub max_force: f64,
    /// `false` if the step was rejected and the run returned to the previous
    /// geometry
    pub accepted: bool,
    /// Geometry that was evaluated
    pub structure: &'a Structure,
}

/// Outcome of [`optimize`].
#[derive(Debug, Clone)]
pub struct OptimizationResult {
    /// Final geometry; metadata identical to the input structure
    pub structure: Structure,
    /// Energy of `structure` (eV)
    pub energy: f64,
    /// Largest projected per-atom force norm at `structure` (eV/Å)
    pub max_force: f64,
    /// Converged or ran out of budget
    pub termination: Termination,
    /// Number of steps taken, rejected ones included
    pub steps: usize,
    /// Number of engine evaluations
    pub evaluations: usize,
}

impl OptimizationResult {
    pub fn converged(&self) -> bool {
        self.termination.is_converged()
    }
}

/// One evaluated geometry.
struct Point {
    coords: DVector<f64>,
    energy: f64,
    /// Engine forces
    raw_forces: DVector<f64>,
    /// Forces with the constraint component removed
    forces: DVector<f64>,
    max_force: f64,
    /// ∇φ and the constraint force multiplier, with a constraint
    constraint_force: Option<(DVector<f64>, f64)>,
    satisfied: bool,
}

impl Point {
    fn evaluate(
        structure: &Structure,
        oracle: &mut dyn EnergyOracle,
        constraint: Option<&DihedralConstraint>,
    ) -> Result<Self, OptimizeError> {
        let evaluation = oracle.evaluate(structure)?;
        evaluation.validate(structure.num_atoms)?;

        let coords = structure.coords.clone();
        let (forces, constraint_force, satisfied) = match constraint {
            Some(c) => {
                let split = c.split_forces(&coords, &evaluation.forces)?;
                let satisfied = c.is_satisfied(&coords)?;
                (split.forces, Some((split.normal, split.multiplier)), satisfied)
            }
            None => (evaluation.forces.clone(), None, true),
        };

        Ok(Self {
            max_force: max_atom_norm(&forces),
            coords,
            energy: evaluation.energy,
            raw_forces: evaluation.forces,
            forces,
            constraint_force,
            satisfied,
        })
    }
}

/// Step that led from the current point to the geometry being evaluated.
struct PendingStep {
    delta: DVector<f64>,
    /// `f·Δx` at the starting point
    descent: f64,
    /// The step was cut back to the trust radius
    at_trust_limit: bool,
}

/// Minimizes `structure` in place.
///
/// See [`optimize_with_observer`].
pub fn optimize(
    structure: &mut Structure,
    oracle: &mut dyn EnergyOracle,
    constraint: Option<&DihedralConstraint>,
    config: &OptimizerConfig,
) -> Result<OptimizationResult, OptimizeError> {
    optimize_with_observer(structure, oracle, constraint, config, |_| {})
}

/// Minimizes `structure` in place, calling `observer` after every evaluation.
///
/// With a constraint, the starting geometry is first moved onto the target
/// dihedral and every later step keeps it there within the constraint
/// tolerance.
///
/// On `MaxStepsExceeded` the structure is reset to the lowest-energy geometry
/// seen that satisfied the constraint (the last geometry if none did).
///
/// # Errors
///
/// [`OptimizeError::Oracle`] if the engine fails or returns forces of the wrong
/// shape; [`OptimizeError::Geometry`] if the constrained atoms become
/// collinear. The structure is left at the last attempted geometry.
pub fn optimize_with_observer<F>(
    structure: &mut Structure,
    oracle: &mut dyn EnergyOracle,
    constraint: Option<&DihedralConstraint>,
    config: &OptimizerConfig,
    mut observer: F,
) -> Result<OptimizationResult, OptimizeError>
where
    F: FnMut(&StepRecord),
{
    let n = structure.coords.len();
    let started = Instant::now();
    let mut state = OptimizerState::Initialized;
    debug!("Optimizer state: {:?}", state);

    if let Some(c) = constraint {
        if !c.is_satisfied(&structure.coords)? {
            let current = c.spec().measure(&structure.coords)?;
            info!(
                "Moving dihedral from {:.4} to target {:.4} deg",
                current,
                c.spec().target()
            );
            let shift = c.project(&structure.coords, &DVector::zeros(n))?;
            let moved = &structure.coords + shift;
            structure.set_coords(&moved);
        }
    }

    let min_trust = config.max_step * MIN_TRUST_FRACTION;
    let mut trust = config.max_step;
    let mut hessian = initial_hessian(n, config.initial_curvature);
    let mut current: Option<Point> = None;
    let mut pending: Option<PendingStep> = None;
    let mut best: Option<(DVector<f64>, f64, f64)> = None;
    let mut evaluations = 0;
    let mut step = 0;

    let point = loop {
        let trial = Point::evaluate(structure, oracle, constraint)?;
        evaluations += 1;

        if trial.satisfied && best.as_ref().map_or(true, |(_, e, _)| trial.energy < *e) {
            best = Some((trial.coords.clone(), trial.energy, trial.max_force));
        }

        let (point, accepted) = match (current.take(), pending.take()) {
            (Some(previous), Some(taken)) => {
                let threshold = previous.energy - ARMIJO_C1 * taken.descent.max(0.0);
                if trial.energy <= threshold {
                    let delta_g = gradient_change(&previous, &trial);
                    hessian = update_hessian_bfgs(&hessian, &taken.delta, &delta_g);
                    if taken.at_trust_limit {
                        trust = (trust * 2.0).min(config.max_step);
                    }
                    (trial, true)
                } else {
                    trust *= 0.5;
                    if trust < min_trust {
                        warn!(
                            "Trust radius fell below {:.1e} A; resetting the Hessian",
                            min_trust
                        );
                        hessian = initial_hessian(n, config.initial_curvature);
                        trust = config.max_step;
                    }
                    debug!(
                        "Step {} rejected: energy {:.6} vs {:.6} eV, trust radius now {:.4} A",
                        step, trial.energy, previous.energy, trust
                    );
                    observer(&StepRecord {
                        step,
                        energy: trial.energy,
                        max_force: trial.max_force,
                        accepted: false,
                        structure: &*structure,
                    });
                    structure.set_coords(&previous.coords);
                    (previous, false)
                }
            }
            _ => (trial, true),
        };

        if accepted {
            info!("BFGS: {:4} {:15.6} {:10.4}", step, point.energy, point.max_force);
            observer(&StepRecord {
                step,
                energy: point.energy,
                max_force: point.max_force,
                accepted: true,
                structure: &*structure,
            });
        }

        if point.satisfied && point.max_force <= config.fmax {
            state = OptimizerState::Converged;
            break point;
        }
        if step >= config.max_steps {
            warn!("Optimization stopped after {} steps without converging", step);
            state = OptimizerState::MaxStepsExceeded;
            break point;
        }
        if let Some(limit) = config.max_wall_time {
            if started.elapsed().as_secs_f64() >= limit {
                warn!(
                    "Optimization stopped at step {} after exceeding {:.1} s wall time",
                    step, limit
                );
                state = OptimizerState::MaxStepsExceeded;
                break point;
            }
        }

        let mut direction = bfgs_step(&hessian, &point.forces);
        if let Some((normal, _)) = &point.constraint_force {
            direction = remove_component(&direction, normal);
        }
        if direction.dot(&point.forces) <= 0.0 {
            debug!("BFGS direction is not downhill; resetting the Hessian");
            hessian = initial_hessian(n, config.initial_curvature);
            direction = &point.forces / config.initial_curvature;
        }

        let at_trust_limit = max_atom_norm(&direction) >= trust;
        let proposed = determine_step(direction, trust);
        let delta = project_step(constraint, &point.coords, proposed)?;
        debug!("Step {} displacement {:.6} A", step + 1, max_atom_norm(&delta));

        let next = &point.coords + &delta;
        structure.set_coords(&next);
        pending = Some(PendingStep {
            descent: point.forces.dot(&delta),
            delta,
            at_trust_limit,
        });
        current = Some(point);

        step += 1;
        if state == OptimizerState::Initialized {
            state = OptimizerState::Stepping;
            debug!("Optimizer state: {:?}", state);
        }
    };
    debug!("Optimizer state: {:?}", state);

    let termination = match state {
        OptimizerState::Converged => Termination::Converged,
        _ => Termination::MaxStepsExceeded,
    };

    let (energy, max_force) = match (termination, best) {
        (Termination::MaxStepsExceeded, Some((coords, best_energy, best_force))) => {
            if best_energy < point.energy {
                info!("Restoring lowest-energy geometry ({:.6} eV)", best_energy);
            }
            structure.set_coords(&coords);
            (best_energy, best_force)
        }
        (Termination::MaxStepsExceeded, None) => {
            warn!("No geometry satisfied the dihedral constraint; keeping the last one");
            (point.energy, point.max_force)
        }
        _ => (point.energy, point.max_force),
    };

    Ok(OptimizationResult {
        structure: structure.clone(),
        energy,
        max_force,
        termination,
        steps: step,
        evaluations,
    })
}

/// Gradient change `g_new - g_old` for the BFGS update.
///
/// With a constraint both gradients include the constraint force of the new
/// point, `g = -(f_raw - λ·∇φ)`, which is the gradient of the Lagrangian at a
/// fixed multiplier λ.
fn gradient_change(previous: &Point, next: &Point) -> DVector<f64> {
    match (&previous.constraint_force, &next.constraint_force) {
        (Some((old_normal, _)), Some((_, multiplier))) => {
            let old = &previous.raw_forces - old_normal * *multiplier;
            old - &next.forces
        }
        _ => &previous.forces - &next.forces,
    }
}

/// Quasi-Newton step `V·(Vᵀf / |ω|)` from the eigendecomposition of `hessian`.
///
/// Taking the absolute eigenvalue keeps the step downhill even if the Hessian
/// has picked up negative curvature.
pub fn bfgs_step(hessian: &DMatrix<f64>, forces: &DVector<f64>) -> DVector<f64> {
    let eigen = hessian.clone().symmetric_eigen();
    let mut projected = eigen.eigenvectors.transpose() * forces;
    for (p, omega) in projected.iter_mut().zip(eigen.eigenvalues.iter()) {
        *p /= omega.abs().max(MIN_CURVATURE);
    }
    &eigen.eigenvectors * projected
}

/// Scales `step` down so no atom moves farther than `max_step`.
pub fn determine_step(step: DVector<f64>, max_step: f64) -> DVector<f64> {
    let longest = max_atom_norm(&step);
    if longest > max_step {
        step * (max_step / longest)
    } else {
        step
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::HarmonicWell;

    fn approx_eq(a: f64, b: f64, epsilon: f64) -> bool {
        (a - b).abs() < epsilon
    }

    fn dimer(separation: f64) -> Structure {
        Structure::new(
            vec!["Ar".to_string(), "Ar".to_string()],
            vec![0.0, 0.0, 0.0, separation, 0.0, 0.0],
        )
    }

    #[test]
    fn test_bfgs_step_identity_hessian() {
        let h = initial_hessian(3, 70.0);
        let f = DVector::from_vec(vec![7.0, -14.0, 0.0]);
        let step = bfgs_step(&h, &f);
        assert!((step - DVector::from_vec(vec![0.1, -0.2, 0.0])).norm() < 1e-12);
    }

    #[test]
    fn test_bfgs_step_uses_absolute_curvature() {
        let h = DMatrix::from_diagonal(&DVector::from_vec(vec![-2.0, 4.0]));
        let f = DVector::from_vec(vec![1.0, 1.0]);
        let step = bfgs_step(&h, &f);
        assert!((step[0] - 0.5).abs() < 1e-12);
        assert!((step[1] - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_determine_step_caps_longest_atom() {
        let step = DVector::from_vec(vec![0.6, 0.0, 0.0, 0.1, 0.0, 0.0]);
        let scaled = determine_step(step, 0.2);
        assert!((max_atom_norm(&scaled) - 0.2).abs() < 1e-12);
        assert!((scaled[3] - 0.1 / 3.0).abs() < 1e-12);

        let small = DVector::from_vec(vec![0.05, 0.0, 0.0]);
        assert_eq!(determine_step(small.clone(), 0.2), small);
    }

    #[test]
    fn test_unconstrained_harmonic_converges() {
        let reference = dimer(1.0);
        let mut oracle = HarmonicWell::around(&reference, 3.0);
        let mut structure = dimer(1.6);
        structure.coords[1] = 0.3;

        let result = optimize(
            &mut structure,
            &mut oracle,
            None,
            &OptimizerConfig::default(),
        )
        .unwrap();

        assert!(result.converged());
        assert!(result.max_force <= 0.05);
        assert!((result.structure.coords - reference.coords).norm() < 0.05);
        assert_eq!(result.evaluations, result.steps + 1);
    }

    #[test]
    fn test_already_converged_takes_no_steps() {
        let reference = dimer(1.0);
        let mut oracle = HarmonicWell::around(&reference, 3.0);
        let mut structure = reference.clone();
        let result = optimize(
            &mut structure,
            &mut oracle,
            None,
            &OptimizerConfig::default(),
        )
        .unwrap();
        assert!(result.converged());
        assert_eq!(result.steps, 0);
        assert_eq!(result.evaluations, 1);
        assert_eq!(result.structure, reference);
    }

    #[test]
    fn test_step_budget_exhausted() {
        let reference = dimer(1.0);
        let mut oracle = HarmonicWell::around(&reference, 3.0);
        let mut structure = dimer(3.0);
        let config = OptimizerConfig {
            max_steps: 2,
            ..OptimizerConfig::default()
        };

        let mut seen = Vec::new();
        let result = optimize_with_observer(&mut structure, &mut oracle, None, &config, |r| {
            seen.push((r.step, r.energy))
        })
        .unwrap();

        assert_eq!(result.termination, Termination::MaxStepsExceeded);
        assert_eq!(result.steps, 2);
        assert_eq!(result.evaluations, 3);
        assert_eq!(seen.len(), 3);
        let lowest = seen.iter().map(|(_, e)| *e).fold(f64::INFINITY, f64::min);
        assert_eq!(result.energy, lowest);
    }

    #[test]
    fn test_max_step_respected() {
        let reference = dimer(1.0);
        let mut oracle = HarmonicWell::around(&reference, 3.0);
        let mut structure = dimer(5.0);
        let config = OptimizerConfig {
            max_step: 0.1,
            max_steps: 5,
            ..OptimizerConfig::default()
        };

        let mut positions = Vec::new();
        optimize_with_observer(&mut structure, &mut oracle, None, &config, |r| {
            positions.push(r.structure.coords.clone())
        })
        .unwrap();

        for pair in positions.windows(2) {
            assert!(max_atom_norm(&(&pair[1] - &pair[0])) <= 0.1 + 1e-12);
        }
    }

    #[test]
    fn test_overshooting_step_is_rejected() {
        // Springs much stiffer than the initial curvature make the first
        // quasi-Newton steps overshoot
        let reference = dimer(1.0);
        let mut oracle = HarmonicWell::around(&reference, 500.0);
        let mut structure = dimer(1.05);

        let mut records = Vec::new();
        let result = optimize_with_observer(
            &mut structure,
            &mut oracle,
            None,
            &OptimizerConfig::default(),
            |r| records.push((r.step, r.energy, r.accepted)),
        )
        .unwrap();

        assert!(result.converged());
        assert_eq!(result.steps, 3);
        assert_eq!(result.evaluations, 4);
        let accepted: Vec<bool> = records.iter().map(|r| r.2).collect();
        assert_eq!(accepted, vec![true, false, false, true]);
        // Too far, then back to the same distance on the other side
        assert!(records[1].1 > records[0].1);
        assert!(approx_eq(records[2].1, records[0].1, 1e-9));
        assert!(result.energy < 1e-20);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(Termination::Converged.exit_code(), 0);
        assert_eq!(Termination::MaxStepsExceeded.exit_code(), EXIT_NOT_CONVERGED);
        assert_ne!(EXIT_NOT_CONVERGED, 1);
    }

    #[test]
    fn test_zero_wall_time_stops_after_first_evaluation() {
        let reference = dimer(1.0);
        let mut oracle = HarmonicWell::around(&reference, 3.0);
        let mut structure = dimer(2.0);
        let config = OptimizerConfig {
            max_wall_time: Some(0.0),
            ..OptimizerConfig::default()
        };
        let result = optimize(&mut structure, &mut oracle, None, &config).unwrap();
        assert_eq!(result.termination, Termination::MaxStepsExceeded);
        assert_eq!(result.evaluations, 1);
    }
}
