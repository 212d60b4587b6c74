//! torsopt command-line entry point.
//!
//! ```text
//! # Unconstrained optimization
//! torsopt --input_file in.xyz --output_file out.xyz
//!
//! # Keep the current 2-3-4-12 dihedral
//! torsopt --input_file in.xyz --output_file out.xyz --dihedral_indices 2 3 4 12
//!
//! # Drive it to -90 degrees
//! torsopt --input_file in.xyz --output_file out.xyz --dihedral_indices 2 3 4 12 --dihedral_angle -90
//! ```
//!
//! The output file is only written after the run finishes; fatal errors exit
//! with status 1 and leave no output behind. A run that stops on its step or
//! time budget still writes the best geometry and exits with status 2.

use clap::{Parser, ValueEnum};
use log::{error, info, warn, LevelFilter};
use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::str::FromStr;
use torsopt::config::EngineKind;
use torsopt::driver::{self, DihedralRequest};
use torsopt::optimizer::Termination;
use torsopt::geometry::Structure;
use torsopt::io;
use torsopt::oracle::build_oracle;
use torsopt::settings::{Settings, SettingsManager};

#[derive(Parser, Debug)]
#[command(
    name = "torsopt",
    about = "Geometry optimization with an optional fixed dihedral angle",
    version
)]
struct Cli {
    /// Input XYZ file
    #[arg(
        long = "input_file",
        value_name = "FILE",
        required_unless_present = "write_settings_template"
    )]
    input_file: Option<PathBuf>,

    /// Output XYZ file
    #[arg(
        long = "output_file",
        value_name = "FILE",
        required_unless_present = "write_settings_template"
    )]
    output_file: Option<PathBuf>,

    /// Total charge
    #[arg(long, default_value = "0.0", allow_hyphen_values = true)]
    charge: f64,

    /// Spin multiplicity (2S+1)
    #[arg(long, default_value = "1.0")]
    spin: f64,

    /// Four 1-based atom indices defining the dihedral to hold fixed
    #[arg(
        long = "dihedral_indices",
        num_args = 4,
        value_names = ["I", "J", "K", "L"]
    )]
    dihedral_indices: Option<Vec<usize>>,

    /// Target dihedral in degrees; the current angle is kept when omitted.
    /// Ignored without --dihedral_indices
    #[arg(
        long = "dihedral_angle",
        value_name = "DEG",
        num_args = 0..=1,
        allow_hyphen_values = true
    )]
    dihedral_angle: Option<Option<f64>>,

    /// Energy engine
    #[arg(long, value_enum)]
    engine: Option<EngineArg>,

    /// Program (with arguments) run by the command engine
    #[arg(long = "engine_command", value_name = "CMD")]
    engine_command: Option<String>,

    /// Force convergence threshold (eV/A)
    #[arg(long)]
    fmax: Option<f64>,

    /// Maximum number of optimizer steps
    #[arg(long = "max_steps")]
    max_steps: Option<usize>,

    /// Settings file, overriding all standard locations
    #[arg(long, value_name = "FILE")]
    settings: Option<PathBuf>,

    /// Write every optimizer step to this multi-frame XYZ file
    #[arg(long, value_name = "FILE")]
    trajectory: Option<PathBuf>,

    /// Write a JSON run summary to this file
    #[arg(long, value_name = "FILE")]
    summary: Option<PathBuf>,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long = "log_level", value_name = "LEVEL")]
    log_level: Option<String>,

    /// Write a settings template to FILE and exit
    #[arg(long = "write_settings_template", value_name = "FILE")]
    write_settings_template: Option<PathBuf>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum EngineArg {
    LennardJones,
    Command,
}

impl From<EngineArg> for EngineKind {
    fn from(arg: EngineArg) -> Self {
        match arg {
            EngineArg::LennardJones => EngineKind::LennardJones,
            EngineArg::Command => EngineKind::Command,
        }
    }
}

fn main() {
    let cli = Cli::parse();

    if let Some(path) = &cli.write_settings_template {
        match SettingsManager::create_template(path) {
            Ok(()) => {
                println!("Settings template created: {}", path.display());
                process::exit(0);
            }
            Err(e) => {
                eprintln!("Error creating settings template: {}", e);
                process::exit(1);
            }
        }
    }

    let cli_level = match cli.log_level.as_deref().map(LevelFilter::from_str) {
        Some(Ok(level)) => Some(level),
        Some(Err(_)) => {
            eprintln!("Error: invalid --log_level (use off, error, warn, info, debug or trace)");
            process::exit(1);
        }
        None => None,
    };

    // The logger comes up before the settings files are read so problems with
    // them are reported; the level from settings is applied afterwards
    env_logger::Builder::from_default_env()
        .filter_level(LevelFilter::Trace)
        .target(env_logger::Target::Stdout)
        .format_timestamp_millis()
        .init();
    log::set_max_level(cli_level.unwrap_or(LevelFilter::Info));

    let manager = match SettingsManager::load_with(cli.settings.as_deref()) {
        Ok(manager) => manager,
        Err(e) => {
            error!("Error loading settings: {}", e);
            eprintln!("Error loading settings: {}", e);
            process::exit(1);
        }
    };
    for (path, reason) in manager.skipped_files() {
        eprintln!(
            "Warning: ignoring settings file {}: {}",
            path.display(),
            reason
        );
    }
    let source = manager.config_source().to_string();
    let settings = manager.into_settings();
    log::set_max_level(cli_level.unwrap_or_else(|| settings.logging.level_filter()));

    info!("torsopt {}", env!("CARGO_PKG_VERSION"));
    info!("Settings from: {}", source);

    match run(&cli, settings) {
        Ok(Termination::Converged) => {}
        Ok(termination) => process::exit(termination.exit_code()),
        Err(e) => {
            error!("{}", e);
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}

fn run(cli: &Cli, settings: Settings) -> Result<Termination, Box<dyn std::error::Error>> {
    let (Some(input_file), Some(output_file)) = (&cli.input_file, &cli.output_file) else {
        return Err("--input_file and --output_file are required".into());
    };

    let mut config = settings.config;
    if let Some(engine) = cli.engine {
        config.engine.kind = engine.into();
    }
    if let Some(command) = &cli.engine_command {
        config.engine.command = command.clone();
    }
    if let Some(fmax) = cli.fmax {
        config.optimizer.fmax = fmax;
    }
    if let Some(max_steps) = cli.max_steps {
        config.optimizer.max_steps = max_steps;
    }

    let structure = io::read_xyz(input_file)?.with_charge_and_spin(cli.charge, cli.spin);
    info!(
        "Read {} atoms from {}",
        structure.num_atoms,
        input_file.display()
    );

    let request =
        DihedralRequest::from_args(cli.dihedral_indices.as_deref(), cli.dihedral_angle)?;
    if request.is_none() {
        info!("No dihedral constraint applied. Performing unconstrained optimization.");
    }

    let mut engine = build_oracle(&config.engine)?;

    let record_frames = cli.trajectory.is_some();
    let mut frames: Vec<(Structure, String)> = Vec::new();
    let report = driver::run_with_observer(
        structure,
        engine.as_mut(),
        request.as_ref(),
        &config,
        |record| {
            if record_frames && record.accepted {
                frames.push((
                    record.structure.clone(),
                    format!(
                        "step={} energy={:.6} eV fmax={:.6}",
                        record.step, record.energy, record.max_force
                    ),
                ));
            }
        },
    )?;

    if report.result.converged() {
        info!(
            "Optimization converged after {} steps",
            report.result.steps
        );
    } else {
        warn!(
            "Optimization did not converge in {} steps (max force {:.4} eV/A); writing best geometry",
            report.result.steps, report.result.max_force
        );
        eprintln!(
            "Warning: not converged after {} steps (max force {:.4} eV/A > fmax {}); \
             {} holds the best geometry found",
            report.result.steps,
            report.result.max_force,
            config.optimizer.fmax,
            output_file.display()
        );
    }
    info!("Final energy: {:.6} eV", report.result.energy);

    let comment = report.annotation();
    io::write_xyz(&report.result.structure, &comment, output_file)?;
    info!(
        "Optimized structure saved to {} with comment: {}",
        output_file.display(),
        comment
    );

    if let Some(path) = &cli.trajectory {
        io::write_trajectory(&frames, path)?;
        info!("Trajectory with {} frames saved to {}", frames.len(), path.display());
    }
    if let Some(path) = &cli.summary {
        write_summary(&report.summary(), path)?;
    }

    Ok(report.result.termination)
}

fn write_summary(
    summary: &driver::RunSummary,
    path: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let json = serde_json::to_string_pretty(summary)?;
    fs::write(path, json)?;
    info!("Run summary saved to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("torsopt").chain(args.iter().copied()))
    }

    #[test]
    fn test_angle_without_indices_is_accepted() {
        let cli = parse(&[
            "--input_file", "in.xyz", "--output_file", "out.xyz", "--dihedral_angle", "-90",
        ])
        .unwrap();
        assert_eq!(cli.dihedral_angle, Some(Some(-90.0)));
        assert!(cli.dihedral_indices.is_none());
        let request =
            DihedralRequest::from_args(cli.dihedral_indices.as_deref(), cli.dihedral_angle)
                .unwrap();
        assert!(request.is_none());
    }

    #[test]
    fn test_angle_flag_without_value_keeps_current() {
        let cli = parse(&[
            "--input_file", "in.xyz", "--output_file", "out.xyz",
            "--dihedral_indices", "2", "3", "4", "12", "--dihedral_angle",
        ])
        .unwrap();
        assert_eq!(cli.dihedral_indices, Some(vec![2, 3, 4, 12]));
        assert_eq!(cli.dihedral_angle, Some(None));
    }

    #[test]
    fn test_template_needs_no_input() {
        let cli = parse(&["--write_settings_template", "torsopt.cfg"]).unwrap();
        assert!(cli.input_file.is_none());
        assert!(parse(&["--output_file", "out.xyz"]).is_err());
    }
}
