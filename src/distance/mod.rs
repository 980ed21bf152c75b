use anyhow::bail;
use ndarray::{Array2, ArrayView2, Axis};
use rayon::prelude::*;

use crate::utils::FloatOps;

/// Computes the full n×n matrix of squared Euclidean distances between the
/// rows of `x`. The result is symmetric with a zero diagonal.
pub fn pairwise_sq_distances<T: FloatOps>(x: ArrayView2<T>) -> Array2<T> {
    let n = x.nrows();
    let dims = x.ncols();
    let mut out = Array2::zeros((n, n));

    out.axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(i, mut row)| {
            let xi = x.row(i);
            for j in 0..n {
                if j == i {
                    continue;
                }
                let xj = x.row(j);
                let mut acc = T::zero();
                for k in 0..dims {
                    let diff = xi[k] - xj[k];
                    acc = acc + diff * diff;
                }
                row[j] = acc;
            }
        });

    out
}

/// Checks the invariants every distance matrix consumed by the calibrator
/// must satisfy: square with at least two rows, finite, non-negative, and
/// zero on the diagonal.
pub fn validate_distance_matrix<T: FloatOps>(distances: ArrayView2<T>) -> anyhow::Result<()> {
    let (rows, cols) = distances.dim();
    if rows != cols {
        bail!(
            "distance matrix must be square, got {} rows and {} columns",
            rows,
            cols
        );
    }
    if rows < 2 {
        bail!("need at least two observations, got {}", rows);
    }
    for ((i, j), &value) in distances.indexed_iter() {
        if !value.is_finite() {
            bail!("distance matrix entry ({}, {}) is not finite", i, j);
        }
        if value < T::zero() {
            bail!("distance matrix entry ({}, {}) is negative", i, j);
        }
        if i == j && value != T::zero() {
            bail!("distance matrix diagonal entry {} must be zero", i);
        }
    }
    Ok(())
}
