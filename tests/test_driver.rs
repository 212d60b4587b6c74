// End-to-end tests for constrained runs through the driver
use torsopt::angles::normalize_to_0_360;
use torsopt::config::{Config, EngineConfig, EngineKind};
use torsopt::driver::{run, ConstraintSource, DihedralRequest, RunError};
use torsopt::geometry::Structure;
use torsopt::oracle::{build_oracle, HarmonicWell, LennardJones, SpringNetwork};

fn chain(phi: f64) -> Structure {
    let r = phi.to_radians();
    Structure::new(
        vec!["C".into(), "C".into(), "C".into(), "C".into()],
        vec![0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.5, 0.0, 0.0, 1.5, r.cos(), r.sin()],
    )
}

fn angle_diff(a: f64, b: f64) -> f64 {
    let d = normalize_to_0_360(a - b);
    d.min(360.0 - d)
}

#[test]
fn test_missing_angle_keeps_current_dihedral() {
    let reference = chain(-90.0);
    let mut start = chain(-100.0);
    start.coords[0] += 0.2;
    let mut oracle = HarmonicWell::around(&reference, 5.0);
    let current = normalize_to_0_360(-100.0);

    let request = DihedralRequest {
        indices: [1, 2, 3, 4],
        angle: None,
    };
    let report = run(start, &mut oracle, Some(&request), &Config::default()).unwrap();
    let dihedral = report.dihedral.as_ref().unwrap();

    assert!(report.result.converged());
    assert_eq!(dihedral.source, ConstraintSource::FixedCurrent);
    assert!(angle_diff(dihedral.achieved_angle, current) < 1.0);
    assert!(report.annotation().ends_with("constraint_source=fixed_current"));
}

#[test]
fn test_explicit_angle_is_user_specified() {
    let reference = chain(60.0);
    let mut start = chain(105.0);
    start.coords[0] += 0.1;
    start.coords[4] -= 0.05;
    let mut oracle = HarmonicWell::around(&reference, 5.0);

    let request = DihedralRequest {
        indices: [1, 2, 3, 4],
        angle: Some(60.0),
    };
    let report = run(start, &mut oracle, Some(&request), &Config::default()).unwrap();
    let dihedral = report.dihedral.as_ref().unwrap();

    assert!(report.result.converged());
    assert_eq!(dihedral.source, ConstraintSource::UserSpecified);
    assert_eq!(dihedral.target, 60.0);
    assert!(angle_diff(dihedral.achieved_angle, 60.0) < 1.0);
    assert!((0.0..360.0).contains(&dihedral.achieved_angle));
    assert!(report
        .annotation()
        .starts_with("dihedral=1-2-3-4 actual_angle=60.00 energy="));
}

#[test]
fn test_target_away_from_minimum_is_reached() {
    // Bonds and 1-3 distances are stiff; the soft 1-4 spring prefers 60 degrees
    let reference = chain(60.0);
    let springs = [
        (0, 1, 20.0),
        (1, 2, 20.0),
        (2, 3, 20.0),
        (0, 2, 20.0),
        (1, 3, 20.0),
        (0, 3, 1.0),
    ];
    let mut oracle = SpringNetwork::new(&reference, &springs).unwrap();
    let mut start = chain(105.0).with_charge_and_spin(1.0, 2.0);
    start.coords[0] += 0.1;
    start.coords[4] -= 0.05;

    let request = DihedralRequest {
        indices: [1, 2, 3, 4],
        angle: Some(150.0),
    };
    let report = run(start, &mut oracle, Some(&request), &Config::default()).unwrap();
    let dihedral = report.dihedral.as_ref().unwrap();

    assert!(report.result.converged());
    assert!(angle_diff(dihedral.achieved_angle, 150.0) < 1.0);
    assert!(report.result.energy > 0.01);
    assert_eq!(report.result.structure.charge, 1.0);
    assert_eq!(report.result.structure.spin, 2.0);
    assert!(report
        .annotation()
        .starts_with("dihedral=1-2-3-4 actual_angle=150.00 energy="));
    assert!(report
        .annotation()
        .ends_with("charge=1.0 spin=2.0 constraint_source=user_specified"));
}

#[test]
fn test_negative_target_reported_in_0_360() {
    let reference = chain(-80.0);
    let mut oracle = HarmonicWell::around(&reference, 5.0);
    let request = DihedralRequest {
        indices: [1, 2, 3, 4],
        angle: Some(-90.0),
    };
    let report = run(chain(-75.0), &mut oracle, Some(&request), &Config::default()).unwrap();
    let dihedral = report.dihedral.unwrap();
    assert_eq!(dihedral.target, -90.0);
    assert!(angle_diff(dihedral.achieved_angle, 270.0) < 1.0);
    assert!(dihedral.achieved_angle > 180.0);
}

#[test]
fn test_invalid_indices_fail_before_any_evaluation() {
    for indices in [[1, 2, 3, 9], [1, 2, 2, 4], [0, 1, 2, 3]] {
        let mut oracle = HarmonicWell::around(&chain(60.0), 5.0);
        let request = DihedralRequest {
            indices,
            angle: Some(10.0),
        };
        let err = run(chain(60.0), &mut oracle, Some(&request), &Config::default()).unwrap_err();
        assert!(matches!(err, RunError::Constraint(_)), "{:?}", indices);
        assert_eq!(oracle.calls(), 0);
    }
}

#[test]
fn test_collinear_dihedral_atoms_are_rejected() {
    let line = Structure::new(
        vec!["C".into(), "C".into(), "C".into(), "C".into()],
        vec![0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 2.0, 0.0, 0.0, 3.0, 1.0, 0.0],
    );
    let mut oracle = HarmonicWell::around(&line, 5.0);
    let request = DihedralRequest {
        indices: [1, 2, 3, 4],
        angle: None,
    };
    let err = run(line, &mut oracle, Some(&request), &Config::default()).unwrap_err();
    assert!(matches!(err, RunError::Geometry(_)));
    assert_eq!(oracle.calls(), 0);
}

#[test]
fn test_summary_serializes() {
    let reference = chain(60.0);
    let mut oracle = HarmonicWell::around(&reference, 5.0);
    let request = DihedralRequest {
        indices: [1, 2, 3, 4],
        angle: Some(60.0),
    };
    let report = run(chain(75.0), &mut oracle, Some(&request), &Config::default()).unwrap();
    let json = serde_json::to_value(report.summary()).unwrap();
    assert_eq!(json["converged"], true);
    assert_eq!(json["termination"], "converged");
    assert_eq!(json["dihedral"]["source"], "user_specified");
    assert_eq!(json["dihedral"]["indices"][3], 4);

    let mut oracle = HarmonicWell::around(&reference, 5.0);
    let plain = run(chain(75.0), &mut oracle, None, &Config::default()).unwrap();
    let json = serde_json::to_value(plain.summary()).unwrap();
    assert!(json.get("dihedral").is_none());
}

#[test]
fn test_lennard_jones_dimer_bond_length() {
    let dimer = Structure::new(
        vec!["Ar".into(), "Ar".into()],
        vec![0.0, 0.0, 0.0, 3.6, 0.0, 0.0],
    );
    let mut config = Config::default();
    config.optimizer.fmax = 1e-4;
    config.optimizer.initial_curvature = 0.5;
    let mut engine = LennardJones::from_config(&config.engine);

    let report = run(dimer, &mut engine, None, &config).unwrap();
    assert!(report.result.converged());

    let r_min = 2f64.powf(1.0 / 6.0) * config.engine.lj_sigma;
    let s = &report.result.structure;
    let r = (s.position(1) - s.position(0)).norm();
    assert!((r - r_min).abs() < 0.01, "r = {}, expected {}", r, r_min);
}

#[cfg(unix)]
#[test]
fn test_external_command_engine() {
    let dir = std::env::temp_dir().join(format!("torsopt_driver_{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let script = dir.join("engine.sh");
    std::fs::write(
        &script,
        "n=$(head -n 1 \"$1\")\n\
         echo \"banner line\"\n\
         echo \"energy = -2.5\"\n\
         echo \"forces\"\n\
         i=0\n\
         while [ $i -lt $n ]; do echo \"0.0 0.0 0.0\"; i=$((i+1)); done\n",
    )
    .unwrap();

    let engine_config = EngineConfig {
        kind: EngineKind::Command,
        command: format!("sh {}", script.display()),
        workdir: dir.clone(),
        ..EngineConfig::default()
    };
    let mut engine = build_oracle(&engine_config).unwrap();
    let report = run(chain(60.0), engine.as_mut(), None, &Config::default()).unwrap();

    assert!(report.result.converged());
    assert_eq!(report.result.energy, -2.5);
    assert_eq!(
        report.annotation(),
        "energy=-2.500000 eV charge=0.0 spin=1.0"
    );

    std::fs::remove_dir_all(&dir).unwrap();
}

#[cfg(unix)]
#[test]
fn test_failing_external_command_is_fatal() {
    let engine_config = EngineConfig {
        kind: EngineKind::Command,
        command: "false".to_string(),
        ..EngineConfig::default()
    };
    let mut engine = build_oracle(&engine_config).unwrap();
    let err = run(chain(60.0), engine.as_mut(), None, &Config::default()).unwrap_err();
    assert!(matches!(err, RunError::Optimize(_)));
}
