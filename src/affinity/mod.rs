//! # Perplexity-calibrated affinities
//!
//! Turns a matrix of pairwise squared distances into a row-stochastic
//! conditional similarity matrix by searching, per point, for the Gaussian
//! kernel precision whose neighbor distribution has a target Shannon
//! entropy of `log2(perplexity)`.
//!
//! Each row is calibrated independently, so the search is a parallel map
//! over points followed by a gather into the shared output matrix.

use anyhow::bail;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rayon::prelude::*;

use crate::distance::validate_distance_matrix;
use crate::utils::FloatOps;

/// Behavior when a point's bandwidth search exhausts its step budget
/// without meeting the entropy tolerance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchPolicy {
    /// Keep the last candidate precision and report the row as a
    /// diagnostic. This matches the permissive reference behavior.
    #[default]
    AcceptLast,
    /// Treat any unconverged row as an error.
    Strict,
}

/// Result of a calibration run.
pub struct Calibration<T> {
    /// Row-stochastic conditional similarity matrix; `conditional[[i, i]]`
    /// is zero and every row sums to one within numerical tolerance.
    pub conditional: Array2<T>,
    /// Per-point bandwidth diagnostic, `1 / beta_i`.
    pub bandwidths: Array1<T>,
    /// Indices of rows whose search ran out of steps before meeting the
    /// tolerance. Empty on a fully converged run.
    pub unconverged: Vec<usize>,
}

/// Calibrates per-point Gaussian kernel precisions against a target
/// perplexity via binary search.
///
/// # Example
/// ```
/// use ndarray::array;
/// use neighbor_embed::AffinityCalibrator;
/// use neighbor_embed::distance::pairwise_sq_distances;
///
/// let data = array![[0.0, 0.0], [0.0, 1.0], [5.0, 0.0], [5.0, 1.0]];
/// let distances = pairwise_sq_distances(data.view());
/// let calibration = AffinityCalibrator::new(2.0)
///     .calibrate(distances.view())
///     .unwrap();
/// assert_eq!(calibration.conditional.dim(), (4, 4));
/// ```
pub struct AffinityCalibrator<T> {
    perplexity: T,
    tolerance: T,
    max_search_steps: usize,
    search_policy: SearchPolicy,
    beta_ceiling: T,
}

struct RowCalibration<T> {
    probabilities: Vec<T>,
    beta: T,
    converged: bool,
}

impl<T: FloatOps> AffinityCalibrator<T> {
    pub fn new(perplexity: T) -> Self {
        Self {
            perplexity,
            tolerance: T::from_f64(1e-5).unwrap(),
            max_search_steps: 50,
            search_policy: SearchPolicy::default(),
            beta_ceiling: T::from_f64(1e12).unwrap(),
        }
    }

    pub fn tolerance(mut self, tolerance: T) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn max_search_steps(mut self, max_search_steps: usize) -> Self {
        self.max_search_steps = max_search_steps;
        self
    }

    pub fn search_policy(mut self, search_policy: SearchPolicy) -> Self {
        self.search_policy = search_policy;
        self
    }

    /// Upper bound on the kernel precision. Coincident observations make
    /// the row entropy insensitive to `beta`, so the search caps out here
    /// instead of growing without bound.
    pub fn beta_ceiling(mut self, beta_ceiling: T) -> Self {
        self.beta_ceiling = beta_ceiling;
        self
    }

    /// Calibrates every row of the given squared-distance matrix.
    ///
    /// # Returns
    /// - `Ok(Calibration)` with the conditional similarity matrix, the
    ///   per-point bandwidths, and any unconverged row indices
    /// - `Err` if the input violates the distance-matrix invariants, the
    ///   parameters are out of range, or `SearchPolicy::Strict` is set and
    ///   a row fails to converge
    pub fn calibrate(&self, distances: ArrayView2<T>) -> anyhow::Result<Calibration<T>> {
        validate_distance_matrix(distances)?;
        if self.perplexity <= T::zero() {
            bail!("perplexity must be positive, got {:?}", self.perplexity);
        }
        if self.tolerance <= T::zero() {
            bail!("tolerance must be positive, got {:?}", self.tolerance);
        }
        if self.max_search_steps == 0 {
            bail!("max_search_steps must be at least 1");
        }

        let n = distances.nrows();
        let target_entropy = self.perplexity.log2();

        let rows: Vec<RowCalibration<T>> = (0..n)
            .into_par_iter()
            .map(|i| self.calibrate_row(distances.row(i), i, target_entropy))
            .collect();

        let mut conditional = Array2::zeros((n, n));
        let mut bandwidths = Array1::zeros(n);
        let mut unconverged = Vec::new();
        for (i, row) in rows.into_iter().enumerate() {
            for (j, p) in row.probabilities.into_iter().enumerate() {
                conditional[[i, j]] = p;
            }
            bandwidths[i] = row.beta.recip();
            if !row.converged {
                unconverged.push(i);
            }
        }

        if self.search_policy == SearchPolicy::Strict && !unconverged.is_empty() {
            bail!(
                "bandwidth search failed to reach tolerance for {} of {} points (first: {})",
                unconverged.len(),
                n,
                unconverged[0]
            );
        }

        log::debug!(
            "calibrated {} points, {} did not reach tolerance",
            n,
            unconverged.len()
        );

        Ok(Calibration {
            conditional,
            bandwidths,
            unconverged,
        })
    }

    /// Binary search on the kernel precision for a single point. Starts at
    /// `beta = 1`, doubles or halves until the target entropy is
    /// bracketed, then bisects.
    fn calibrate_row(
        &self,
        distances: ArrayView1<T>,
        point: usize,
        target_entropy: T,
    ) -> RowCalibration<T> {
        let half = T::from_f64(0.5).unwrap();
        let two = T::from_f64(2.0).unwrap();

        let mut beta = T::one();
        let mut beta_min = T::neg_infinity();
        let mut beta_max = T::infinity();
        let mut probabilities = vec![T::zero(); distances.len()];
        // Tracks the precision the current probabilities were computed
        // with, so an unconverged row still returns a consistent pair.
        let mut accepted_beta = beta;
        let mut converged = false;

        for _ in 0..self.max_search_steps {
            let entropy = kernel_row(distances, point, beta, &mut probabilities);
            accepted_beta = beta;

            let diff = entropy - target_entropy;
            if diff.abs() < self.tolerance {
                converged = true;
                break;
            }

            if diff > T::zero() {
                // Entropy too high: sharpen the kernel.
                beta_min = beta;
                beta = if beta_max.is_finite() {
                    (beta + beta_max) * half
                } else {
                    beta * two
                };
            } else {
                // Entropy too low: widen the kernel.
                beta_max = beta;
                beta = if beta_min.is_finite() {
                    (beta + beta_min) * half
                } else {
                    beta * half
                };
            }

            if beta > self.beta_ceiling {
                beta = self.beta_ceiling;
            }
        }

        RowCalibration {
            probabilities,
            beta: accepted_beta,
            converged,
        }
    }
}

/// Fills `probabilities` with the normalized Gaussian kernel row for the
/// given precision and returns its Shannon entropy in bits. The weights
/// are shifted by the smallest off-diagonal distance so the row never
/// underflows to all zeros, which leaves the normalized values unchanged.
fn kernel_row<T: FloatOps>(
    distances: ArrayView1<T>,
    point: usize,
    beta: T,
    probabilities: &mut [T],
) -> T {
    let mut min_distance = T::infinity();
    for (j, &d) in distances.iter().enumerate() {
        if j != point && d < min_distance {
            min_distance = d;
        }
    }

    let mut sum = T::zero();
    for (j, &d) in distances.iter().enumerate() {
        if j == point {
            probabilities[j] = T::zero();
            continue;
        }
        let w = (-(d - min_distance) * beta).exp();
        probabilities[j] = w;
        sum = sum + w;
    }

    let mut entropy = T::zero();
    for (j, p) in probabilities.iter_mut().enumerate() {
        if j == point {
            continue;
        }
        *p = *p / sum;
        if *p > T::zero() {
            entropy = entropy - *p * p.log2();
        }
    }
    entropy
}
