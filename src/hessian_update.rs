//! Curvature estimate for the quasi-Newton minimizer.
//!
//! The Cartesian Hessian starts as a scaled identity and is refined after every
//! step with the BFGS rank-two update. Units are eV/Å².
//!
//! # References
//!
//! - Fletcher, R. *Practical Methods of Optimization*, 2nd ed.; Wiley, 1987.

use nalgebra::{DMatrix, DVector};

/// Numerical threshold below which an update denominator counts as zero.
const SMALL: f64 = 1e-14;

/// Initial Hessian guess `alpha · I` for `n` Cartesian coordinates.
pub fn initial_hessian(n: usize, alpha: f64) -> DMatrix<f64> {
    DMatrix::identity(n, n) * alpha
}

/// BFGS Hessian update.
///
/// ```text
/// H_new = H + (Δg·Δg^T)/(Δx·Δg) - (H·Δx·Δx^T·H)/(Δx^T·H·Δx)
/// ```
///
/// # Arguments
///
/// * `hessian` - Current Hessian (eV/Å²)
/// * `delta_x` - Step actually taken, x_new - x_old (Å)
/// * `delta_g` - Gradient change g_new - g_old (eV/Å); with forces this is
///   `-(f_new - f_old)`
///
/// # Curvature Condition
///
/// The update is skipped when Δx·Δg ≤ 0, which keeps the Hessian positive
/// definite. Non-finite inputs also leave it unchanged.
pub fn update_hessian_bfgs(
    hessian: &DMatrix<f64>,
    delta_x: &DVector<f64>,
    delta_g: &DVector<f64>,
) -> DMatrix<f64> {
    let mut h_new = hessian.clone();

    if !delta_x.iter().all(|v| v.is_finite()) || !delta_g.iter().all(|v| v.is_finite()) {
        return h_new;
    }

    let dx_dg = delta_x.dot(delta_g);
    if dx_dg <= SMALL {
        return h_new;
    }

    let h_dx = hessian * delta_x;
    let dx_h_dx = delta_x.dot(&h_dx);
    if dx_h_dx.abs() <= SMALL {
        return h_new;
    }

    let n = hessian.nrows();
    for i in 0..n {
        for j in 0..=i {
            let update = delta_g[i] * delta_g[j] / dx_dg - h_dx[i] * h_dx[j] / dx_h_dx;
            h_new[(i, j)] += update;
            if i != j {
                h_new[(j, i)] += update;
            }
        }
    }

    h_new
}
