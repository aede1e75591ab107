//! Utility functions for continuation analysis.
//!
//! This module contains helper functions for tangent computation,
//! eigenvalue analysis, and test functions for bifurcation detection.

use anyhow::{bail, Result};
use nalgebra::{DMatrix, DVector, SymmetricEigen};
use num_complex::Complex;

use super::types::ContinuationPoint;

const IMAG_EPS: f64 = 1e-8;

/// Computes the null space tangent from an extended Jacobian matrix.
///
/// Uses Gram matrix eigenvalue decomposition first, falling back to
/// bordered linear solve if that fails. The result has unit norm.
pub fn compute_nullspace_tangent(j_ext: &DMatrix<f64>) -> Result<DVector<f64>> {
    let dim = j_ext.nrows();
    if dim == 0 {
        bail!("Failed to compute tangent: zero-dimensional system");
    }
    if j_ext.ncols() != dim + 1 {
        bail!(
            "Failed to compute tangent: expected {} columns, got {}",
            dim + 1,
            j_ext.ncols()
        );
    }
    let mut tangent = match try_gram_eigen(j_ext) {
        Some(vec) => vec,
        None => compute_tangent_linear_solve(j_ext)?,
    };
    tangent.normalize_mut();
    Ok(tangent)
}

/// Attempts to compute the tangent via Gram matrix eigendecomposition.
fn try_gram_eigen(j_ext: &DMatrix<f64>) -> Option<DVector<f64>> {
    let gram = j_ext.transpose() * j_ext;
    if gram.iter().any(|v| !v.is_finite()) {
        return None;
    }

    let eig = SymmetricEigen::new(gram);
    let (min_idx, _) = eig
        .eigenvalues
        .iter()
        .enumerate()
        .filter(|(_, v)| v.is_finite())
        .min_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))?;

    let vec = eig.eigenvectors.column(min_idx).into_owned();
    if vec.norm_squared() == 0.0 || vec.iter().any(|v| !v.is_finite()) {
        return None;
    }
    Some(vec)
}

/// Computes the tangent via bordered linear system solve.
fn compute_tangent_linear_solve(j_ext: &DMatrix<f64>) -> Result<DVector<f64>> {
    let dim = j_ext.nrows();
    let mut a = DMatrix::zeros(dim + 1, dim + 1);
    a.view_mut((0, 0), (dim, dim + 1)).copy_from(j_ext);
    let mut rhs = DVector::zeros(dim + 1);
    rhs[dim] = 1.0;

    for col in 0..=dim {
        a.row_mut(dim).fill(0.0);
        a[(dim, col)] = 1.0;

        if let Some(solution) = a.clone().lu().solve(&rhs) {
            if solution.iter().all(|v| v.is_finite()) && solution.norm_squared() != 0.0 {
                return Ok(solution);
            }
        }
    }

    bail!("Failed to compute tangent: all bordered solves singular")
}

/// Converts a ContinuationPoint to an augmented state vector [p, x...].
pub fn continuation_point_to_aug(point: &ContinuationPoint) -> DVector<f64> {
    let mut aug = DVector::zeros(point.state.len() + 1);
    aug[0] = point.param_value;
    aug.rows_mut(1, point.state.len()).copy_from_slice(&point.state);
    aug
}

/// Computes eigenvalues from a matrix.
pub fn compute_eigenvalues(mat: &DMatrix<f64>) -> Vec<Complex<f64>> {
    if mat.nrows() == 0 {
        return Vec::new();
    }
    mat.clone().complex_eigenvalues().iter().cloned().collect()
}

/// Hopf test function `Re ∏_{i<j} (λ_i + λ_j)` over all eigenvalue pairs.
/// Changes sign when a complex pair crosses the imaginary axis; real pairs
/// summing to zero also cross, which the neutral-saddle test distinguishes.
pub fn hopf_test_function(eigenvalues: &[Complex<f64>]) -> f64 {
    let mut product = Complex::new(1.0, 0.0);
    for i in 0..eigenvalues.len() {
        for j in (i + 1)..eigenvalues.len() {
            product *= eigenvalues[i] + eigenvalues[j];
        }
    }
    product.re
}

/// Neutral saddle test function: product of pairwise real eigenvalue sums.
/// Zero crossing indicates a neutral saddle (heteroclinic connection).
pub fn neutral_saddle_test_function(eigenvalues: &[Complex<f64>]) -> f64 {
    let mut product = 1.0;
    for i in 0..eigenvalues.len() {
        if eigenvalues[i].im.abs() >= IMAG_EPS {
            continue;
        }
        for j in (i + 1)..eigenvalues.len() {
            if eigenvalues[j].im.abs() >= IMAG_EPS {
                continue;
            }
            product *= eigenvalues[i].re + eigenvalues[j].re;
        }
    }
    product
}

/// Number of eigenvalues treated as real by the neutral-saddle test.
pub fn real_eigenvalue_count(eigenvalues: &[Complex<f64>]) -> usize {
    eigenvalues.iter().filter(|l| l.im.abs() < IMAG_EPS).count()
}

/// Floquet multiplier test functions and stability of one orbit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CycleTests {
    pub cycle_fold: f64,
    pub period_doubling: f64,
    pub neimark_sacker: f64,
    pub complex_pairs: usize,
    pub stable: bool,
}

/// Cycle test functions from Floquet multipliers, skipping the trivial
/// multiplier (the one closest to 1).
pub fn cycle_tests(multipliers: &[Complex<f64>]) -> CycleTests {
    const MULTIPLIER_IMAG_EPS: f64 = 1e-5;
    let trivial_idx = multipliers
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| {
            let da = (*a - Complex::new(1.0, 0.0)).norm_sqr();
            let db = (*b - Complex::new(1.0, 0.0)).norm_sqr();
            da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(idx, _)| idx);

    let mut cycle_fold = 1.0;
    let mut period_doubling = 1.0;
    let mut neimark = 1.0;
    let mut complex_pairs = 0;
    let mut stable = true;

    for (idx, mu) in multipliers.iter().enumerate() {
        if Some(idx) == trivial_idx {
            continue;
        }
        if mu.norm() >= 1.0 {
            stable = false;
        }
        if mu.im.abs() < MULTIPLIER_IMAG_EPS {
            cycle_fold *= mu.re - 1.0;
            period_doubling *= mu.re + 1.0;
        } else if mu.im > 0.0 {
            neimark *= mu.norm_sqr() - 1.0;
            complex_pairs += 1;
        }
    }

    CycleTests {
        cycle_fold,
        period_doubling,
        neimark_sacker: neimark,
        complex_pairs,
        stable,
    }
}
