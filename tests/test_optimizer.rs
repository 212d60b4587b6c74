// Integration tests for the constrained BFGS optimizer
use nalgebra::{DVector, Matrix3};
use torsopt::config::{ConstraintConfig, OptimizerConfig};
use torsopt::constraints::{DihedralConstraint, DihedralSpec};
use torsopt::geometry::Structure;
use torsopt::optimizer::{optimize, optimize_with_observer, Termination};
use torsopt::oracle::{EnergyOracle, Evaluation, HarmonicWell, OracleError, SpringNetwork};

fn approx_eq(a: f64, b: f64, epsilon: f64) -> bool {
    (a - b).abs() < epsilon
}

/// Four-atom chain with the 0-1-2-3 dihedral at `phi` degrees.
fn chain(phi: f64) -> Structure {
    let r = phi.to_radians();
    Structure::new(
        vec!["C".into(), "C".into(), "C".into(), "C".into()],
        vec![0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.5, 0.0, 0.0, 1.5, r.cos(), r.sin()],
    )
}

/// Chain at `phi` degrees, slightly distorted so no coordinate starts exactly
/// at its reference value, with non-default metadata.
fn distorted(phi: f64) -> Structure {
    let mut start = chain(phi)
        .with_charge_and_spin(-1.0, 2.0)
        .with_cell(Matrix3::identity() * 12.0, [true, true, false]);
    start.coords[0] += 0.1;
    start.coords[4] -= 0.05;
    start
}

/// Starting point 45 degrees away from the 60-degree reference.
fn distorted_start() -> Structure {
    distorted(105.0)
}

/// Stiff bonds and 1-3 springs with a soft 1-4 spring that prefers the
/// reference dihedral.
fn bonded_chain(reference: &Structure) -> SpringNetwork {
    let springs = [
        (0, 1, 20.0),
        (1, 2, 20.0),
        (2, 3, 20.0),
        (0, 2, 20.0),
        (1, 3, 20.0),
        (0, 3, 1.0),
    ];
    SpringNetwork::new(reference, &springs).unwrap()
}

fn bond_angle(s: &Structure, i: usize, j: usize, k: usize) -> f64 {
    let a = s.position(i) - s.position(j);
    let b = s.position(k) - s.position(j);
    a.angle(&b).to_degrees()
}

fn constraint(target: f64) -> DihedralConstraint {
    let spec = DihedralSpec::new([0, 1, 2, 3], target, 4).unwrap();
    DihedralConstraint::new(spec, &ConstraintConfig::default())
}

#[test]
fn test_constrained_run_reaches_target() {
    let reference = chain(60.0);
    let mut oracle = HarmonicWell::around(&reference, 5.0);
    let mut structure = distorted_start();
    let c = constraint(60.0);

    let result = optimize(&mut structure, &mut oracle, Some(&c), &OptimizerConfig::default())
        .unwrap();

    assert_eq!(result.termination, Termination::Converged);
    assert!(result.max_force <= 0.05);
    assert!(c.violation(&result.structure.coords).unwrap().abs() <= 1e-4);

    let out = &result.structure;
    let start = distorted_start();
    assert_eq!(out.num_atoms, start.num_atoms);
    assert_eq!(out.elements, start.elements);
    assert_eq!(out.charge, -1.0);
    assert_eq!(out.spin, 2.0);
    assert_eq!(out.cell, start.cell);
    assert_eq!(out.pbc, start.pbc);
}

#[test]
fn test_constrained_run_away_from_minimum() {
    let reference = chain(60.0);
    for (start_angle, target) in [(105.0, 150.0), (135.0, 180.0), (-75.0, -90.0), (60.0, -120.0)] {
        let mut oracle = bonded_chain(&reference);
        let start = distorted(start_angle);
        let mut structure = start.clone();
        let c = constraint(target);

        let result = optimize(&mut structure, &mut oracle, Some(&c), &OptimizerConfig::default())
            .unwrap();

        assert_eq!(result.termination, Termination::Converged, "target {}", target);
        assert!(result.max_force <= 0.05);
        assert!(c.violation(&result.structure.coords).unwrap().abs() <= 1e-4);
        // Holding the dihedral away from 60 degrees stretches the 1-4 spring
        assert!(result.energy > 0.01, "target {}", target);

        let out = &result.structure;
        assert_eq!(out.elements, start.elements);
        assert_eq!(out.charge, start.charge);
        assert_eq!(out.spin, start.spin);
        assert_eq!(out.cell, start.cell);
        assert_eq!(out.pbc, start.pbc);
    }
}

#[test]
fn test_isotropic_well_far_target_collapses_toward_collinear() {
    // Holding 150 degrees in a well centred on 60 degrees is cheapest with
    // atoms 1-2-3 collinear, so the run descends towards that geometry
    let reference = chain(60.0);
    let mut oracle = HarmonicWell::around(&reference, 5.0);
    let mut structure = distorted_start();
    let c = constraint(150.0);
    let config = OptimizerConfig {
        max_steps: 100,
        ..OptimizerConfig::default()
    };

    let mut accepted = Vec::new();
    let result = optimize_with_observer(&mut structure, &mut oracle, Some(&c), &config, |r| {
        if r.accepted {
            accepted.push(r.energy);
        }
    })
    .unwrap();

    assert_eq!(result.termination, Termination::MaxStepsExceeded);
    assert!(c.is_satisfied(&result.structure.coords).unwrap());
    for pair in accepted.windows(2) {
        assert!(pair[1] <= pair[0]);
    }
    assert!(result.energy < accepted[0]);
    assert!(result.energy < 1.1, "energy {}", result.energy);
    assert!(bond_angle(&result.structure, 1, 2, 3) > 170.0);
}

#[test]
fn test_constraint_holds_at_every_step() {
    let reference = chain(60.0);
    let mut oracle = HarmonicWell::around(&reference, 5.0);
    let mut structure = distorted_start();
    let c = constraint(90.0);

    let mut violations = Vec::new();
    let result = optimize_with_observer(
        &mut structure,
        &mut oracle,
        Some(&c),
        &OptimizerConfig::default(),
        |record| violations.push(c.violation(&record.structure.coords).unwrap()),
    )
    .unwrap();

    assert!(result.converged());
    assert_eq!(violations.len(), result.evaluations);
    for v in violations {
        assert!(v.abs() <= 1e-4, "dihedral drifted by {} deg", v);
    }
    // The unconstrained minimum sits at 60 degrees, so holding 90 costs energy
    assert!(result.energy > 0.0);
}

#[test]
fn test_rerun_of_converged_output_is_stable() {
    let reference = chain(60.0);
    let c = constraint(60.0);

    let mut oracle = HarmonicWell::around(&reference, 5.0);
    let mut structure = distorted_start();
    let first = optimize(&mut structure, &mut oracle, Some(&c), &OptimizerConfig::default())
        .unwrap();

    let mut oracle = HarmonicWell::around(&reference, 5.0);
    let mut again = first.structure.clone();
    let second = optimize(&mut again, &mut oracle, Some(&c), &OptimizerConfig::default()).unwrap();

    assert!(second.converged());
    assert_eq!(second.steps, 0);
    assert!(approx_eq(second.energy, first.energy, 1e-12));
    assert!((second.structure.coords - first.structure.coords).norm() < 1e-12);
}

#[test]
fn test_unconstrained_start_at_minimum() {
    let reference = chain(60.0);
    let mut oracle = HarmonicWell::around(&reference, 5.0);
    let mut structure = reference.clone();

    let result = optimize(&mut structure, &mut oracle, None, &OptimizerConfig::default()).unwrap();

    assert!(result.converged());
    assert_eq!(result.evaluations, 1);
    assert_eq!(oracle.calls(), 1);
    assert!(approx_eq(result.energy, 0.0, 1e-15));
}

#[test]
fn test_max_steps_keeps_best_constrained_geometry() {
    let reference = chain(60.0);
    let mut oracle = HarmonicWell::around(&reference, 5.0);
    let mut structure = distorted_start();
    let c = constraint(60.0);
    let config = OptimizerConfig {
        max_steps: 3,
        ..OptimizerConfig::default()
    };

    let mut energies = Vec::new();
    let result = optimize_with_observer(&mut structure, &mut oracle, Some(&c), &config, |r| {
        energies.push(r.energy)
    })
    .unwrap();

    assert_eq!(result.termination, Termination::MaxStepsExceeded);
    assert!(!result.converged());
    assert_eq!(result.steps, 3);
    let lowest = energies.iter().cloned().fold(f64::INFINITY, f64::min);
    assert_eq!(result.energy, lowest);
    assert_eq!(structure.coords, result.structure.coords);
    assert!(c.is_satisfied(&result.structure.coords).unwrap());
}

/// Engine that fails on its n-th call.
struct FailingEngine {
    inner: HarmonicWell,
    fail_on: usize,
    calls: usize,
}

impl EnergyOracle for FailingEngine {
    fn evaluate(&mut self, structure: &Structure) -> Result<Evaluation, OracleError> {
        self.calls += 1;
        if self.calls == self.fail_on {
            return Err(OracleError::Calculation("engine crashed".into()));
        }
        self.inner.evaluate(structure)
    }
}

#[test]
fn test_engine_failure_aborts() {
    let reference = chain(60.0);
    let mut oracle = FailingEngine {
        inner: HarmonicWell::around(&reference, 5.0),
        fail_on: 2,
        calls: 0,
    };
    let mut structure = distorted_start();
    let result = optimize(&mut structure, &mut oracle, None, &OptimizerConfig::default());
    assert!(result.is_err());
    assert_eq!(oracle.calls, 2);
}

/// Engine that returns forces for the wrong number of atoms.
struct ShortForces;

impl EnergyOracle for ShortForces {
    fn evaluate(&mut self, _structure: &Structure) -> Result<Evaluation, OracleError> {
        Ok(Evaluation {
            energy: 0.0,
            forces: DVector::zeros(3),
        })
    }
}

#[test]
fn test_force_shape_mismatch_is_fatal() {
    let mut structure = chain(60.0);
    let err = optimize(
        &mut structure,
        &mut ShortForces,
        None,
        &OptimizerConfig::default(),
    )
    .unwrap_err();
    assert!(err.to_string().contains("mismatch"));
}
