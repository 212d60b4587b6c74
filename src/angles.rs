//! Dihedral angle geometry.
//!
//! Pure functions over Cartesian points used by the constraint model and the
//! driver:
//!
//! - [`dihedral_angle`]: signed torsion angle p1-p2-p3-p4 in degrees
//! - [`dihedral_gradient`]: analytic derivative of the torsion with respect to
//!   the four positions
//! - [`normalize_to_0_360`] and [`wrap_degrees`]: periodic angle helpers
//!
//! The sign follows the usual chemical (right-hand rule) convention: looking
//! down the p2→p3 bond, a clockwise rotation of p4 relative to p1 is positive.

use nalgebra::Vector3;
use thiserror::Error;

/// Plane normals shorter than this are treated as zero (collinear triplet).
const DEGENERATE_NORM: f64 = 1e-10;

/// Errors raised by the dihedral geometry routines.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GeometryError {
    /// Three consecutive points are collinear, so one of the two planes that
    /// define the dihedral does not exist.
    #[error("degenerate dihedral geometry: {0}")]
    Degenerate(String),
}

/// Type alias for geometry results
pub type Result<T> = std::result::Result<T, GeometryError>;

/// Computes the dihedral angle defined by four points, in degrees.
///
/// Forms the bond vectors `b1 = p2 - p1`, `b2 = p3 - p2`, `b3 = p4 - p3` and the
/// plane normals `n1 = b1 × b2`, `n2 = b2 × b3`. The unsigned angle between the
/// normalized normals is `acos(n1·n2)`, and the sign is taken from
/// `b2 · (n1 × n2)`.
///
/// # Returns
///
/// The angle in the range (-180°, 180°].
///
/// # Errors
///
/// Returns [`GeometryError::Degenerate`] when either plane normal has
/// (near) zero length, i.e. when p1, p2, p3 or p2, p3, p4 are collinear.
///
/// # Examples
///
/// ```
/// use nalgebra::Vector3;
/// use torsopt::angles::dihedral_angle;
///
/// let angle = dihedral_angle(
///     &Vector3::new(0.0, 1.0, 0.0),
///     &Vector3::new(0.0, 0.0, 0.0),
///     &Vector3::new(1.0, 0.0, 0.0),
///     &Vector3::new(1.0, -1.0, 0.0),
/// )
/// .unwrap();
/// assert!((angle - 180.0).abs() < 1e-9);
/// ```
pub fn dihedral_angle(
    p1: &Vector3<f64>,
    p2: &Vector3<f64>,
    p3: &Vector3<f64>,
    p4: &Vector3<f64>,
) -> Result<f64> {
    let b1 = p2 - p1;
    let b2 = p3 - p2;
    let b3 = p4 - p3;

    let n1 = unit_normal(&b1, &b2, "first")?;
    let n2 = unit_normal(&b2, &b3, "second")?;

    let cos_phi = n1.dot(&n2).clamp(-1.0, 1.0);
    let mut phi = cos_phi.acos();

    if b2.dot(&n1.cross(&n2)) < 0.0 {
        phi = -phi;
    }

    let degrees = phi.to_degrees();
    // acos(-1) = π exactly, but -π must fold onto the open end of the range
    if degrees <= -180.0 {
        Ok(degrees + 360.0)
    } else {
        Ok(degrees)
    }
}

fn unit_normal(a: &Vector3<f64>, b: &Vector3<f64>, which: &str) -> Result<Vector3<f64>> {
    let n = a.cross(b);
    let norm = n.norm();
    if !norm.is_finite() || norm < DEGENERATE_NORM {
        return Err(GeometryError::Degenerate(format!(
            "{} plane normal has length {:.3e} (collinear atoms)",
            which, norm
        )));
    }
    Ok(n / norm)
}

/// Analytic gradient of the dihedral angle with respect to the four positions.
///
/// Uses the Blondel-Karplus expressions, which stay finite for any
/// non-degenerate geometry (no division by sin φ):
///
/// ```text
/// m = b1 × b2,  n = b2 × b3
/// ∂φ/∂p1 = -|b2| / |m|² · m
/// ∂φ/∂p4 =  |b2| / |n|² · n
/// ∂φ/∂p2 = -(1 + b1·b2/|b2|²) ∂φ/∂p1 + (b3·b2/|b2|²) ∂φ/∂p4
/// ∂φ/∂p3 = -(∂φ/∂p1 + ∂φ/∂p2 + ∂φ/∂p4)
/// ```
///
/// # Returns
///
/// Derivatives in radians per unit length, one vector per atom. They sum to
/// zero (translational invariance).
pub fn dihedral_gradient(
    p1: &Vector3<f64>,
    p2: &Vector3<f64>,
    p3: &Vector3<f64>,
    p4: &Vector3<f64>,
) -> Result<[Vector3<f64>; 4]> {
    let b1 = p2 - p1;
    let b2 = p3 - p2;
    let b3 = p4 - p3;

    let m = b1.cross(&b2);
    let n = b2.cross(&b3);
    let m_sq = m.norm_squared();
    let n_sq = n.norm_squared();

    if m_sq.sqrt() < DEGENERATE_NORM || n_sq.sqrt() < DEGENERATE_NORM {
        return Err(GeometryError::Degenerate(
            "cannot differentiate a dihedral with collinear atoms".to_string(),
        ));
    }

    let b2_norm = b2.norm();
    let b2_sq = b2_norm * b2_norm;

    let g1 = m * (-b2_norm / m_sq);
    let g4 = n * (b2_norm / n_sq);

    let a = b1.dot(&b2) / b2_sq;
    let c = b3.dot(&b2) / b2_sq;

    let g2 = g1 * (-a - 1.0) + g4 * c;
    let g3 = -(g1 + g2 + g4);

    Ok([g1, g2, g3, g4])
}

/// Maps any angle in degrees onto [0°, 360°).
///
/// Only used when reporting an achieved angle. A user-supplied target is
/// never passed through this function.
///
/// # Examples
///
/// ```
/// use torsopt::angles::normalize_to_0_360;
///
/// assert_eq!(normalize_to_0_360(-90.0), 270.0);
/// assert_eq!(normalize_to_0_360(720.0), 0.0);
/// ```
pub fn normalize_to_0_360(angle: f64) -> f64 {
    let wrapped = angle.rem_euclid(360.0);
    // rem_euclid of a tiny negative number rounds up to exactly 360.0
    if wrapped >= 360.0 {
        0.0
    } else {
        wrapped
    }
}

/// Maps an angle difference in degrees onto (-180°, 180°].
pub fn wrap_degrees(delta: f64) -> f64 {
    let wrapped = normalize_to_0_360(delta);
    if wrapped > 180.0 {
        wrapped - 360.0
    } else {
        wrapped
    }
}
