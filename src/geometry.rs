//! Molecular structure representation.
//!
//! [`Structure`] holds everything that flows through one optimization run:
//! element symbols, flat Cartesian coordinates, the cell descriptor, and the
//! scalar metadata (charge, spin multiplicity). Only the coordinates are ever
//! modified by the optimizer.
//!
//! All coordinates are in Angstroms.

use nalgebra::{DVector, Matrix3, Vector3};

/// A molecular structure with element symbols and Cartesian coordinates.
///
/// Coordinates are stored flat in the order `[x1, y1, z1, x2, y2, z2, ...]` so
/// they can be used directly in nalgebra vector and matrix operations.
///
/// The cell matrix (rows are lattice vectors) and periodicity flags are carried
/// as pass-through metadata; nothing in the optimizer interprets them. An
/// all-zero cell means "no cell".
///
/// # Examples
///
/// ```
/// use torsopt::geometry::Structure;
///
/// let structure = Structure::new(
///     vec!["O".to_string(), "H".to_string(), "H".to_string()],
///     vec![0.0, 0.0, 0.0, 0.757, 0.586, 0.0, -0.757, 0.586, 0.0],
/// );
/// assert_eq!(structure.num_atoms, 3);
/// assert_eq!(structure.atom_coords(1), [0.757, 0.586, 0.0]);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Structure {
    /// Chemical element symbols for each atom in order
    pub elements: Vec<String>,
    /// Flattened Cartesian coordinates [x1, y1, z1, x2, y2, z2, ...] in Angstroms
    pub coords: DVector<f64>,
    /// Number of atoms in the structure
    pub num_atoms: usize,
    /// Cell matrix, one lattice vector per row (zero when absent)
    pub cell: Matrix3<f64>,
    /// Periodicity flags along the three lattice vectors
    pub pbc: [bool; 3],
    /// Total charge
    pub charge: f64,
    /// Spin multiplicity (2S+1)
    pub spin: f64,
}

impl Structure {
    /// Creates a new `Structure` with no cell, neutral charge and singlet spin.
    ///
    /// # Panics
    ///
    /// Panics if `coords.len() != elements.len() * 3`.
    pub fn new(elements: Vec<String>, coords: Vec<f64>) -> Self {
        let num_atoms = elements.len();
        assert_eq!(coords.len(), num_atoms * 3);
        Self {
            elements,
            coords: DVector::from_vec(coords),
            num_atoms,
            cell: Matrix3::zeros(),
            pbc: [false; 3],
            charge: 0.0,
            spin: 1.0,
        }
    }

    /// Attaches charge and spin multiplicity, consuming and returning `self`.
    pub fn with_charge_and_spin(mut self, charge: f64, spin: f64) -> Self {
        self.charge = charge;
        self.spin = spin;
        self
    }

    /// Attaches a cell matrix and periodicity flags.
    pub fn with_cell(mut self, cell: Matrix3<f64>, pbc: [bool; 3]) -> Self {
        self.cell = cell;
        self.pbc = pbc;
        self
    }

    /// Returns `true` when a non-zero cell matrix is attached.
    pub fn has_cell(&self) -> bool {
        self.cell.iter().any(|&v| v != 0.0)
    }

    /// Gets the coordinates of one atom as an array.
    pub fn atom_coords(&self, atom_idx: usize) -> [f64; 3] {
        let i = atom_idx * 3;
        [self.coords[i], self.coords[i + 1], self.coords[i + 2]]
    }

    /// Gets the position of one atom as a vector.
    pub fn position(&self, atom_idx: usize) -> Vector3<f64> {
        position_in(&self.coords, atom_idx)
    }

    /// Replaces all coordinates.
    ///
    /// # Panics
    ///
    /// Panics if the length differs from `3 * num_atoms`.
    pub fn set_coords(&mut self, coords: &DVector<f64>) {
        assert_eq!(coords.len(), self.num_atoms * 3);
        self.coords.copy_from(coords);
    }
}

/// Reads the position of atom `atom_idx` from a flat coordinate vector.
pub fn position_in(coords: &DVector<f64>, atom_idx: usize) -> Vector3<f64> {
    let i = atom_idx * 3;
    Vector3::new(coords[i], coords[i + 1], coords[i + 2])
}

/// Largest per-atom vector norm in a flat `[x1, y1, z1, ...]` vector.
///
/// Applied to forces this is the usual `fmax` convergence measure; applied to
/// a displacement it is the longest single-atom move.
pub fn max_atom_norm(flat: &DVector<f64>) -> f64 {
    flat.as_slice()
        .chunks_exact(3)
        .map(|v| (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt())
        .fold(0.0, f64::max)
}
