//! Fixed-dihedral constraint for Cartesian optimization.
//!
//! A [`DihedralConstraint`] keeps the torsion angle i-j-k-l at a target value
//! while the optimizer moves atoms in Cartesian space. It acts in two places:
//!
//! - on **steps**, via [`DihedralConstraint::project`]: the proposed
//!   displacement loses its component along ∇φ, then a few minimal-norm
//!   corrections along ∇φ put the dihedral back on target (SHAKE-style);
//! - on **forces**, via [`DihedralConstraint::project_forces`]: the component
//!   along ∇φ is removed so convergence is judged on the constrained forces.
//!
//! The free functions [`project_step`] and [`project_forces`] take an
//! `Option<&DihedralConstraint>` and are the identity for `None`, which is the
//! unconstrained mode.

use crate::angles::{self, dihedral_angle, dihedral_gradient, wrap_degrees, GeometryError};
use crate::config::ConstraintConfig;
use crate::geometry::position_in;
use log::{debug, warn};
use nalgebra::DVector;
use thiserror::Error;

/// Errors raised while building a constraint.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConstraintError {
    /// Atom indices out of range or repeated
    #[error("invalid dihedral indices: {0}")]
    InvalidIndex(String),
    /// Target angle is NaN or infinite
    #[error("invalid dihedral target: {0}")]
    InvalidTarget(String),
}

/// Four atoms and the angle their dihedral should take.
///
/// Indices are 0-based. The target is in degrees and kept exactly as given:
/// `-90.0` and `270.0` describe the same torsion but are stored differently.
#[derive(Debug, Clone, PartialEq)]
pub struct DihedralSpec {
    atoms: [usize; 4],
    target: f64,
}

impl DihedralSpec {
    /// Validates the indices against the number of atoms.
    ///
    /// # Errors
    ///
    /// [`ConstraintError::InvalidIndex`] if an index is `>= num_atoms` or two
    /// indices coincide; [`ConstraintError::InvalidTarget`] if `target` is not
    /// finite.
    ///
    /// # Examples
    ///
    /// ```
    /// use torsopt::constraints::DihedralSpec;
    ///
    /// let spec = DihedralSpec::new([0, 1, 2, 3], -90.0, 4).unwrap();
    /// assert_eq!(spec.target(), -90.0);
    ///
    /// assert!(DihedralSpec::new([0, 1, 1, 3], 0.0, 4).is_err());
    /// assert!(DihedralSpec::new([0, 1, 2, 4], 0.0, 4).is_err());
    /// ```
    pub fn new(atoms: [usize; 4], target: f64, num_atoms: usize) -> Result<Self, ConstraintError> {
        if let Some(&bad) = atoms.iter().find(|&&a| a >= num_atoms) {
            return Err(ConstraintError::InvalidIndex(format!(
                "atom index {} out of range for {} atoms",
                bad, num_atoms
            )));
        }
        for a in 0..4 {
            for b in (a + 1)..4 {
                if atoms[a] == atoms[b] {
                    return Err(ConstraintError::InvalidIndex(format!(
                        "atom {} appears twice in {:?}",
                        atoms[a], atoms
                    )));
                }
            }
        }
        if !target.is_finite() {
            return Err(ConstraintError::InvalidTarget(format!(
                "angle {} is not a finite number",
                target
            )));
        }
        Ok(Self { atoms, target })
    }

    /// The four 0-based atom indices.
    pub fn atoms(&self) -> [usize; 4] {
        self.atoms
    }

    /// Target angle in degrees, as supplied.
    pub fn target(&self) -> f64 {
        self.target
    }

    /// Current dihedral of these four atoms in `coords`, in (-180°, 180°].
    pub fn measure(&self, coords: &DVector<f64>) -> angles::Result<f64> {
        let [i, j, k, l] = self.atoms;
        dihedral_angle(
            &position_in(coords, i),
            &position_in(coords, j),
            &position_in(coords, k),
            &position_in(coords, l),
        )
    }
}

/// A dihedral held fixed during optimization.
#[derive(Debug, Clone)]
pub struct DihedralConstraint {
    spec: DihedralSpec,
    tolerance: f64,
    max_iterations: usize,
}

impl DihedralConstraint {
    /// Wraps a validated `DihedralSpec` with the projection tolerances.
    pub fn new(spec: DihedralSpec, config: &ConstraintConfig) -> Self {
        Self {
            spec,
            tolerance: config.tolerance,
            max_iterations: config.max_iterations,
        }
    }

    /// The wrapped `DihedralSpec`.
    pub fn spec(&self) -> &DihedralSpec {
        &self.spec
    }

    /// Allowed deviation from the target in degrees.
    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    /// Signed deviation of the current dihedral from the target, in degrees
    /// within (-180°, 180°].
    pub fn violation(&self, coords: &DVector<f64>) -> angles::Result<f64> {
        Ok(wrap_degrees(self.spec.measure(coords)? - self.spec.target))
    }

    /// `true` if the dihedral is within tolerance of the target.
    pub fn is_satisfied(&self, coords: &DVector<f64>) -> angles::Result<bool> {
        Ok(self.violation(coords)?.abs() <= self.tolerance)
    }

    /// Full-length gradient ∂φ/∂x (radians per Å), zero outside the four atoms.
    pub fn gradient(&self, coords: &DVector<f64>) -> angles::Result<DVector<f64>> {
        let [i, j, k, l] = self.spec.atoms;
        let parts = dihedral_gradient(
            &position_in(coords, i),
            &position_in(coords, j),
            &position_in(coords, k),
            &position_in(coords, l),
        )?;

        let mut grad = DVector::zeros(coords.len());
        for (atom, g) in self.spec.atoms.iter().zip(parts.iter()) {
            grad[atom * 3] = g.x;
            grad[atom * 3 + 1] = g.y;
            grad[atom * 3 + 2] = g.z;
        }
        Ok(grad)
    }

    /// Corrects a proposed displacement so the dihedral stays on target.
    ///
    /// # Arguments
    ///
    /// * `coords` - Current positions
    /// * `proposed` - Unconstrained displacement from the optimizer
    ///
    /// # Returns
    ///
    /// The corrected displacement. When the constraint already holds and
    /// `proposed` has no component along ∇φ and leaves the dihedral within
    /// tolerance, `proposed` comes back unchanged.
    ///
    /// # Errors
    ///
    /// [`GeometryError::Degenerate`] if the constrained atoms are (or become)
    /// collinear.
    pub fn project(
        &self,
        coords: &DVector<f64>,
        proposed: &DVector<f64>,
    ) -> Result<DVector<f64>, GeometryError> {
        let grad = self.gradient(coords)?;
        let mut step = remove_component(proposed, &grad);

        let mut trial = coords + &step;
        for iteration in 0..=self.max_iterations {
            let error = self.violation(&trial)?;
            if error.abs() <= self.tolerance {
                if iteration > 0 {
                    debug!(
                        "Dihedral restored to target after {} correction(s)",
                        iteration
                    );
                }
                return Ok(step);
            }
            if iteration == self.max_iterations {
                warn!(
                    "Dihedral projection stopped after {} iterations with error {:.3e} deg",
                    self.max_iterations, error
                );
                break;
            }

            // Minimal-norm move along ∇φ that removes the error to first order
            let g = self.gradient(&trial)?;
            let g_sq = g.norm_squared();
            let correction = &g * (-error.to_radians() / g_sq);
            step += &correction;
            trial += &correction;
        }

        Ok(step)
    }

    /// Removes the force component that would change the dihedral.
    pub fn project_forces(
        &self,
        coords: &DVector<f64>,
        forces: &DVector<f64>,
    ) -> Result<DVector<f64>, GeometryError> {
        Ok(self.split_forces(coords, forces)?.forces)
    }

    /// Splits `forces` into the part tangent to the constraint surface and a
    /// multiple of ∇φ, so that `forces = split.forces + split.multiplier · split.normal`.
    pub fn split_forces(
        &self,
        coords: &DVector<f64>,
        forces: &DVector<f64>,
    ) -> Result<SplitForces, GeometryError> {
        let normal = self.gradient(coords)?;
        let n_sq = normal.norm_squared();
        let multiplier = if n_sq <= f64::EPSILON {
            0.0
        } else {
            forces.dot(&normal) / n_sq
        };
        Ok(SplitForces {
            forces: remove_component(forces, &normal),
            multiplier,
            normal,
        })
    }
}

/// Forces decomposed against a dihedral constraint.
#[derive(Debug, Clone)]
pub struct SplitForces {
    /// Forces with the component along ∇φ removed (eV/Å)
    pub forces: DVector<f64>,
    /// Force along ∇φ per unit of ∇φ, i.e. the constraint force magnitude (eV/rad)
    pub multiplier: f64,
    /// ∇φ at the geometry the forces belong to (rad/Å)
    pub normal: DVector<f64>,
}

pub(crate) fn remove_component(v: &DVector<f64>, direction: &DVector<f64>) -> DVector<f64> {
    let d_sq = direction.norm_squared();
    if d_sq <= f64::EPSILON {
        return v.clone();
    }
    let overlap = v.dot(direction);
    if overlap == 0.0 {
        return v.clone();
    }
    v - direction * (overlap / d_sq)
}

/// Applies an optional constraint to a proposed step; identity for `None`.
pub fn project_step(
    constraint: Option<&DihedralConstraint>,
    coords: &DVector<f64>,
    proposed: DVector<f64>,
) -> Result<DVector<f64>, GeometryError> {
    match constraint {
        Some(c) => c.project(coords, &proposed),
        None => Ok(proposed),
    }
}

/// Applies an optional constraint to a force vector; identity for `None`.
pub fn project_forces(
    constraint: Option<&DihedralConstraint>,
    coords: &DVector<f64>,
    forces: DVector<f64>,
) -> Result<DVector<f64>, GeometryError> {
    match constraint {
        Some(c) => c.project_forces(coords, &forces),
        None => Ok(forces),
    }
}
