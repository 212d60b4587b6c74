//! XYZ structure files.
//!
//! Reading accepts plain and extended XYZ: the comment line may carry
//! `Lattice="ax ay az bx by bz cx cy cz"` and `pbc="T T F"` which populate the
//! cell and periodicity flags of the [`Structure`]. Extra per-atom columns
//! after the coordinates are ignored. A file with several frames yields the
//! last one from [`read_xyz`].
//!
//! Writing produces the atom count, one comment line, then
//! `symbol x y z` with 8-decimal fixed-width coordinates.

use crate::geometry::Structure;
use lazy_static::lazy_static;
use nalgebra::Matrix3;
use regex::Regex;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Error type for reading structure files.
#[derive(Error, Debug)]
pub enum ParseError {
    /// File could not be read
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// File content is malformed
    #[error("Parse error: {0}")]
    Parse(String),
}

type Result<T> = std::result::Result<T, ParseError>;

lazy_static! {
    static ref LATTICE_RE: Regex = Regex::new(r#"(?i)\bLattice\s*=\s*"([^"]*)""#).unwrap();
    static ref PBC_RE: Regex = Regex::new(r#"(?i)\bpbc\s*=\s*"([^"]*)""#).unwrap();
}

/// Reads the last frame of an XYZ file.
///
/// # Errors
///
/// [`ParseError::Io`] if the file cannot be read, [`ParseError::Parse`] if it
/// holds no frame or a malformed one.
pub fn read_xyz(path: &Path) -> Result<Structure> {
    let content = fs::read_to_string(path)?;
    parse_xyz_frames(&content)?
        .pop()
        .ok_or_else(|| ParseError::Parse(format!("no structure found in {}", path.display())))
}

/// Parses every frame of an XYZ document.
///
/// # Examples
///
/// ```
/// use torsopt::io::parse_xyz_frames;
///
/// let text = "2\nLattice=\"10 0 0 0 10 0 0 0 10\" pbc=\"T T F\"\nH 0 0 0\nH 0.74 0 0\n";
/// let frames = parse_xyz_frames(text).unwrap();
/// assert_eq!(frames.len(), 1);
/// assert_eq!(frames[0].pbc, [true, true, false]);
/// assert_eq!(frames[0].cell[(0, 0)], 10.0);
/// ```
pub fn parse_xyz_frames(content: &str) -> Result<Vec<Structure>> {
    let mut frames = Vec::new();
    let mut lines = content.lines().enumerate().peekable();

    loop {
        // Skip blank separator lines between frames
        while let Some((_, line)) = lines.peek() {
            if line.trim().is_empty() {
                lines.next();
            } else {
                break;
            }
        }
        let Some((line_no, count_line)) = lines.next() else {
            break;
        };

        let num_atoms: usize = count_line.trim().parse().map_err(|_| {
            ParseError::Parse(format!(
                "line {}: expected atom count, found '{}'",
                line_no + 1,
                count_line.trim()
            ))
        })?;
        let comment = lines.next().map(|(_, l)| l).unwrap_or("");

        let mut elements = Vec::with_capacity(num_atoms);
        let mut coords = Vec::with_capacity(num_atoms * 3);
        for atom in 0..num_atoms {
            let (line_no, line) = lines.next().ok_or_else(|| {
                ParseError::Parse(format!(
                    "frame {}: expected {} atoms, found {}",
                    frames.len() + 1,
                    num_atoms,
                    atom
                ))
            })?;
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 4 {
                return Err(ParseError::Parse(format!(
                    "line {}: expected 'symbol x y z', found '{}'",
                    line_no + 1,
                    line.trim()
                )));
            }
            elements.push(parts[0].to_string());
            for coord_str in &parts[1..4] {
                coords.push(coord_str.parse().map_err(|_| {
                    ParseError::Parse(format!(
                        "line {}: invalid coordinate '{}'",
                        line_no + 1,
                        coord_str
                    ))
                })?);
            }
        }

        let (cell, pbc) = parse_cell(comment)?;
        frames.push(Structure::new(elements, coords).with_cell(cell, pbc));
    }

    Ok(frames)
}

/// Extracts the cell and periodicity flags from an extended XYZ comment.
///
/// A lattice without explicit `pbc` is periodic in all directions; no lattice
/// gives a zero cell.
fn parse_cell(comment: &str) -> Result<(Matrix3<f64>, [bool; 3])> {
    let mut cell = Matrix3::zeros();
    let mut pbc = [false; 3];

    if let Some(caps) = LATTICE_RE.captures(comment) {
        let values: Vec<f64> = caps[1]
            .split_whitespace()
            .map(|v| v.parse::<f64>())
            .collect::<std::result::Result<_, _>>()
            .map_err(|_| ParseError::Parse(format!("invalid Lattice \"{}\"", &caps[1])))?;
        if values.len() != 9 {
            return Err(ParseError::Parse(format!(
                "Lattice needs 9 numbers, found {}",
                values.len()
            )));
        }
        cell = Matrix3::from_row_slice(&values);
        pbc = [true; 3];
    }

    if let Some(caps) = PBC_RE.captures(comment) {
        let flags: Vec<&str> = caps[1].split_whitespace().collect();
        if flags.len() != 3 {
            return Err(ParseError::Parse(format!("pbc needs 3 flags, found \"{}\"", &caps[1])));
        }
        for (slot, flag) in pbc.iter_mut().zip(flags) {
            *slot = match flag.to_lowercase().as_str() {
                "t" | "true" | "1" => true,
                "f" | "false" | "0" => false,
                other => {
                    return Err(ParseError::Parse(format!("invalid pbc flag '{}'", other)));
                }
            };
        }
    }

    Ok((cell, pbc))
}

/// Formats one XYZ frame with the given comment line.
pub fn format_xyz(structure: &Structure, comment: &str) -> String {
    let mut content = format!("{}\n{}\n", structure.num_atoms, comment);
    for i in 0..structure.num_atoms {
        let [x, y, z] = structure.atom_coords(i);
        let _ = writeln!(
            content,
            "{:<2} {:15.8} {:15.8} {:15.8}",
            structure.elements[i], x, y, z
        );
    }
    content
}

/// Writes a structure to an XYZ file with the given comment line.
///
/// # Examples
///
/// ```
/// use torsopt::geometry::Structure;
/// use torsopt::io;
///
/// fn main() -> std::io::Result<()> {
///     let structure = Structure::new(
///         vec!["C".to_string(), "H".to_string()],
///         vec![0.0, 0.0, 0.0, 1.09, 0.0, 0.0],
///     );
///     let path = std::env::temp_dir().join("torsopt_doc_write.xyz");
///     io::write_xyz(&structure, "energy=0.000000 eV charge=0.0 spin=1.0", &path)?;
///     std::fs::remove_file(&path)?;
///     Ok(())
/// }
/// ```
pub fn write_xyz(structure: &Structure, comment: &str, path: &Path) -> std::io::Result<()> {
    fs::write(path, format_xyz(structure, comment))
}

/// Writes several frames into one multi-frame XYZ file.
pub fn write_trajectory(frames: &[(Structure, String)], path: &Path) -> std::io::Result<()> {
    let content: String = frames
        .iter()
        .map(|(structure, comment)| format_xyz(structure, comment))
        .collect();
    fs::write(path, content)
}

/// Formats a scalar like Python's `repr(float)`: `0.0`, `-1.5`, `1e-05`,
/// `1e+16`, `nan`.
///
/// Charge and spin are echoed this way in comment lines.
pub fn format_float(value: f64) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    // Debug switches to exponent form at the same magnitudes as Python
    let debug = format!("{:?}", value);
    match debug.split_once('e') {
        Some((mantissa, exponent)) => {
            let (sign, digits) = match exponent.strip_prefix('-') {
                Some(digits) => ('-', digits),
                None => ('+', exponent),
            };
            format!("{}e{}{:0>2}", mantissa, sign, digits)
        }
        None => debug,
    }
}

/// Extended XYZ comment describing the cell, periodicity, charge and spin.
///
/// Used for engine input files so external programs see the full structure
/// metadata.
pub fn extxyz_comment(structure: &Structure) -> String {
    let mut comment = String::new();
    if structure.has_cell() {
        let lattice: Vec<String> = (0..3)
            .flat_map(|r| (0..3).map(move |c| (r, c)))
            .map(|(r, c)| format!("{:.8}", structure.cell[(r, c)]))
            .collect();
        let _ = write!(comment, "Lattice=\"{}\" ", lattice.join(" "));
    }
    let flag = |p: bool| if p { "T" } else { "F" };
    let _ = write!(
        comment,
        "Properties=species:S:1:pos:R:3 charge={} spin={} pbc=\"{} {} {}\"",
        format_float(structure.charge),
        format_float(structure.spin),
        flag(structure.pbc[0]),
        flag(structure.pbc[1]),
        flag(structure.pbc[2])
    );
    comment
}
