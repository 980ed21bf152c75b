//! # Neighbor-embedding optimizer
//!
//! Refines low-dimensional coordinates by momentum gradient descent on a
//! KL-divergence cost between the calibrated input affinities and the
//! affinities induced by the embedding. Two cost variants exist: the
//! classic asymmetric form working on conditional distributions and the
//! symmetric form working on a single joint distribution.
//!
//! The optimizer runs for a fixed iteration budget with geometrically
//! decayed Gaussian jitter for early exploration. A non-finite coordinate
//! at any step aborts the run; no partial embedding is returned.

use anyhow::bail;
use ndarray::{Array2, ArrayView2, Axis};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};
use rayon::prelude::*;

use crate::distance::pairwise_sq_distances;
use crate::utils::FloatOps;

/// Cost/gradient variant, fixed once at optimizer construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CostVariant {
    /// KL divergence between per-point conditional neighbor distributions.
    #[default]
    Asymmetric,
    /// KL divergence between symmetrized joint distributions.
    Symmetric,
}

/// Symmetrizes a conditional similarity matrix into the joint form:
/// entries are averaged with their transpose and the whole matrix is
/// renormalized to sum to one. The result is symmetric by construction.
pub fn joint_affinities<T: FloatOps>(conditional: ArrayView2<T>) -> Array2<T> {
    let sym = &conditional + &conditional.t();
    let total = sym.sum();
    sym / total
}

pub struct SneOptimizerBuilder<T> {
    target_dim: usize,
    learning_rate: T,
    iterations: usize,
    jitter_scale: T,
    jitter_decay: T,
    momentum: T,
    variant: CostVariant,
    seed: u64,
}

impl<T: FloatOps> SneOptimizerBuilder<T> {
    pub fn new(target_dim: usize) -> Self {
        Self {
            target_dim,
            learning_rate: T::from_f64(0.05).unwrap(),
            iterations: 500,
            jitter_scale: T::from_f64(0.3).unwrap(),
            jitter_decay: T::from_f64(0.9).unwrap(),
            momentum: T::from_f64(0.9).unwrap(),
            variant: CostVariant::default(),
            seed: 42,
        }
    }

    pub fn learning_rate(mut self, learning_rate: T) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    pub fn iterations(mut self, iterations: usize) -> Self {
        self.iterations = iterations;
        self
    }

    pub fn jitter_scale(mut self, jitter_scale: T) -> Self {
        self.jitter_scale = jitter_scale;
        self
    }

    pub fn jitter_decay(mut self, jitter_decay: T) -> Self {
        self.jitter_decay = jitter_decay;
        self
    }

    pub fn momentum(mut self, momentum: T) -> Self {
        self.momentum = momentum;
        self
    }

    pub fn variant(mut self, variant: CostVariant) -> Self {
        self.variant = variant;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn build(self) -> SneOptimizer<T> {
        SneOptimizer {
            target_dim: self.target_dim,
            learning_rate: self.learning_rate,
            iterations: self.iterations,
            jitter_scale: self.jitter_scale,
            jitter_decay: self.jitter_decay,
            momentum: self.momentum,
            variant: self.variant,
            seed: self.seed,
        }
    }
}

/// Fixed-budget momentum optimizer for neighbor embeddings.
///
/// Every step recomputes the low-dimensional affinities from scratch,
/// accumulates the gradient over all point pairs, injects decayed Gaussian
/// jitter, and applies a momentum update. There is no early-stopping
/// criterion; the budget set at construction is always exhausted unless
/// the embedding diverges.
pub struct SneOptimizer<T> {
    target_dim: usize,
    learning_rate: T,
    iterations: usize,
    jitter_scale: T,
    jitter_decay: T,
    momentum: T,
    variant: CostVariant,
    seed: u64,
}

/// Coordinates, velocity, and step counter for one optimization run.
/// Owned exclusively by the optimizer for the run's duration.
struct EmbeddingState<T> {
    y: Array2<T>,
    velocity: Array2<T>,
    iteration: usize,
}

impl<T: FloatOps> EmbeddingState<T> {
    fn new(y: Array2<T>) -> Self {
        let shape = y.dim();
        Self {
            y,
            velocity: Array2::zeros(shape),
            iteration: 0,
        }
    }
}

impl<T: FloatOps> SneOptimizer<T> {
    /// Runs the optimizer from a random small-variance Gaussian start.
    pub fn optimize(&self, affinities: ArrayView2<T>) -> anyhow::Result<Array2<T>> {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let sigma = T::from_f64(1e-4).unwrap();
        let initial = Array2::from_shape_fn((affinities.nrows(), self.target_dim), |_| {
            let z: f64 = StandardNormal.sample(&mut rng);
            sigma * T::from_f64(z).unwrap()
        });
        self.run(affinities, EmbeddingState::new(initial), rng)
    }

    /// Runs the optimizer from caller-supplied coordinates, e.g. the
    /// output of a linear pre-reduction.
    pub fn optimize_from(
        &self,
        affinities: ArrayView2<T>,
        initial: Array2<T>,
    ) -> anyhow::Result<Array2<T>> {
        if initial.dim() != (affinities.nrows(), self.target_dim) {
            bail!(
                "initial embedding has shape {:?}, expected ({}, {})",
                initial.dim(),
                affinities.nrows(),
                self.target_dim
            );
        }
        let rng = ChaCha8Rng::seed_from_u64(self.seed);
        self.run(affinities, EmbeddingState::new(initial), rng)
    }

    fn run(
        &self,
        affinities: ArrayView2<T>,
        mut state: EmbeddingState<T>,
        mut rng: ChaCha8Rng,
    ) -> anyhow::Result<Array2<T>> {
        let (rows, cols) = affinities.dim();
        if rows != cols {
            bail!("affinity matrix must be square, got {}x{}", rows, cols);
        }
        if rows < 2 {
            bail!("need at least two observations, got {}", rows);
        }
        if self.target_dim == 0 {
            bail!("target_dim must be at least 1");
        }
        if self.iterations < 2 {
            bail!("iterations must be at least 2, got {}", self.iterations);
        }
        if self.learning_rate <= T::zero() {
            bail!("learning_rate must be positive, got {:?}", self.learning_rate);
        }
        if self.momentum <= T::zero() {
            bail!("momentum must be positive, got {:?}", self.momentum);
        }
        if self.jitter_scale < T::zero() {
            bail!("jitter_scale must be non-negative, got {:?}", self.jitter_scale);
        }
        if self.jitter_decay <= T::zero() || self.jitter_decay >= T::one() {
            bail!(
                "jitter_decay must be in (0, 1) exclusive, got {:?}",
                self.jitter_decay
            );
        }
        if !state.y.iter().all(|v| v.is_finite()) {
            bail!("initial embedding contains a non-finite value");
        }

        let target = match self.variant {
            CostVariant::Asymmetric => affinities.to_owned(),
            CostVariant::Symmetric => joint_affinities(affinities),
        };

        for _ in 0..self.iterations {
            self.step(&target, &mut state, &mut rng)?;
        }

        log::debug!(
            "embedding optimization finished after {} iterations ({:?} variant)",
            state.iteration,
            self.variant
        );
        Ok(state.y)
    }

    /// One optimization step: recompute Q, accumulate the gradient against
    /// the previous-iteration coordinate snapshot, inject decayed jitter,
    /// then apply the momentum update.
    fn step(
        &self,
        target: &Array2<T>,
        state: &mut EmbeddingState<T>,
        rng: &mut ChaCha8Rng,
    ) -> anyhow::Result<()> {
        let q = match self.variant {
            CostVariant::Asymmetric => conditional_q(&state.y),
            CostVariant::Symmetric => joint_q(&state.y),
        };
        let grad = gradient(self.variant, target, &q, &state.y);

        state.iteration += 1;

        let scale = self.jitter_scale * self.jitter_decay.powi(state.iteration as i32);
        if scale > T::zero() {
            for v in state.y.iter_mut() {
                let z: f64 = StandardNormal.sample(rng);
                *v = *v + scale * T::from_f64(z).unwrap();
            }
        }

        state.velocity *= self.momentum;
        state.velocity.scaled_add(-self.learning_rate, &grad);
        state.y += &state.velocity;

        if let Some(((i, j), _)) = state.y.indexed_iter().find(|(_, v)| !v.is_finite()) {
            bail!(
                "embedding diverged: non-finite coordinate at ({}, {}) after iteration {}",
                i,
                j,
                state.iteration
            );
        }
        Ok(())
    }
}

/// Row-stochastic low-dimensional affinities: per row, a softmax over
/// negative squared distances with the diagonal zeroed. Each row is
/// shifted by its smallest off-diagonal distance so the normalizer stays
/// away from zero.
fn conditional_q<T: FloatOps>(y: &Array2<T>) -> Array2<T> {
    let d = pairwise_sq_distances(y.view());
    let n = d.nrows();
    let mut q = Array2::zeros((n, n));

    q.axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(i, mut row)| {
            let mut min_distance = T::infinity();
            for j in 0..n {
                if j != i && d[[i, j]] < min_distance {
                    min_distance = d[[i, j]];
                }
            }
            let mut sum = T::zero();
            for j in 0..n {
                if j == i {
                    continue;
                }
                let w = (-(d[[i, j]] - min_distance)).exp();
                row[j] = w;
                sum = sum + w;
            }
            for j in 0..n {
                if j != i {
                    row[j] = row[j] / sum;
                }
            }
        });

    q
}

/// Globally normalized low-dimensional affinities for the symmetric
/// variant: one softmax over all off-diagonal pairs, shifted by the
/// smallest off-diagonal distance.
fn joint_q<T: FloatOps>(y: &Array2<T>) -> Array2<T> {
    let d = pairwise_sq_distances(y.view());
    let n = d.nrows();

    let mut min_distance = T::infinity();
    for ((i, j), &v) in d.indexed_iter() {
        if i != j && v < min_distance {
            min_distance = v;
        }
    }

    let mut q = Array2::zeros((n, n));
    let mut total = T::zero();
    for ((i, j), &v) in d.indexed_iter() {
        if i != j {
            let w = (-(v - min_distance)).exp();
            q[[i, j]] = w;
            total = total + w;
        }
    }
    q.mapv_inplace(|w| w / total);
    q
}

/// Gradient of the divergence cost with respect to each embedding row,
/// accumulated over all pairs against a stable snapshot of Y. The
/// asymmetric variant sums the conditional difference and its cross-term;
/// the symmetric variant uses the single joint difference.
fn gradient<T: FloatOps>(
    variant: CostVariant,
    target: &Array2<T>,
    q: &Array2<T>,
    y: &Array2<T>,
) -> Array2<T> {
    let (n, dims) = y.dim();
    let mut grad = Array2::zeros((n, dims));

    grad.axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(i, mut gi)| {
            for j in 0..n {
                if j == i {
                    continue;
                }
                let w = match variant {
                    CostVariant::Asymmetric => {
                        target[[i, j]] - q[[i, j]] + target[[j, i]] - q[[j, i]]
                    }
                    CostVariant::Symmetric => target[[i, j]] - q[[i, j]],
                };
                for k in 0..dims {
                    gi[k] += w * (y[[i, k]] - y[[j, k]]);
                }
            }
        });

    grad
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::affinity::AffinityCalibrator;
    use crate::distance::pairwise_sq_distances;
    use approx::assert_relative_eq;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn asymmetric_affinities() -> Array2<f64> {
        // Row-stochastic but deliberately not symmetric.
        array![
            [0.0, 0.7, 0.2, 0.1],
            [0.3, 0.0, 0.5, 0.2],
            [0.1, 0.2, 0.0, 0.7],
            [0.4, 0.4, 0.2, 0.0]
        ]
    }

    #[test]
    fn test_joint_affinities_symmetric_and_normalized() {
        let p = asymmetric_affinities();
        let joint = joint_affinities(p.view());

        let total: f64 = joint.sum();
        assert_relative_eq!(total, 1.0, epsilon = 1e-12);
        for i in 0..4 {
            assert_eq!(joint[[i, i]], 0.0);
            for j in 0..4 {
                assert_eq!(
                    joint[[i, j]],
                    joint[[j, i]],
                    "joint matrix must be exactly symmetric"
                );
            }
        }
    }

    #[test]
    fn test_minimal_run_returns_finite_embedding() {
        let p = asymmetric_affinities();
        let y = SneOptimizerBuilder::new(2)
            .iterations(2)
            .build()
            .optimize(p.view())
            .unwrap();

        assert_eq!(y.dim(), (4, 2));
        assert!(y.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_variants_produce_different_trajectories() {
        let p = asymmetric_affinities();
        let asymmetric = SneOptimizerBuilder::new(2)
            .iterations(25)
            .seed(11)
            .variant(CostVariant::Asymmetric)
            .build()
            .optimize(p.view())
            .unwrap();
        let symmetric = SneOptimizerBuilder::new(2)
            .iterations(25)
            .seed(11)
            .variant(CostVariant::Symmetric)
            .build()
            .optimize(p.view())
            .unwrap();

        assert!(asymmetric.iter().all(|v| v.is_finite()));
        assert!(symmetric.iter().all(|v| v.is_finite()));
        let max_diff = asymmetric
            .iter()
            .zip(symmetric.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0f64, f64::max);
        assert!(
            max_diff > 1e-12,
            "asymmetric and symmetric gradients should differ on an asymmetric input"
        );
    }

    #[test]
    fn test_non_finite_state_is_a_hard_failure() {
        let p = asymmetric_affinities();
        let optimizer = SneOptimizerBuilder::new(2).build();
        let mut rng = ChaCha8Rng::seed_from_u64(0);

        let mut state = EmbeddingState::new(Array2::from_elem((4, 2), 0.01));
        // Simulated fault: poison one coordinate mid-run.
        state.y[[1, 0]] = f64::NAN;

        let result = optimizer.step(&p, &mut state, &mut rng);
        assert!(result.is_err());
    }

    #[test]
    fn test_non_finite_initial_embedding_is_rejected() {
        let p = asymmetric_affinities();
        let mut initial = Array2::from_elem((4, 2), 0.01);
        initial[[0, 1]] = f64::INFINITY;

        let result = SneOptimizerBuilder::new(2)
            .build()
            .optimize_from(p.view(), initial);
        assert!(result.is_err());
    }

    #[test]
    fn test_warm_start_shape_mismatch() {
        let p = asymmetric_affinities();
        let initial = Array2::<f64>::zeros((3, 2));
        let result = SneOptimizerBuilder::new(2)
            .build()
            .optimize_from(p.view(), initial);
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_jitter_run() {
        let p = asymmetric_affinities();
        let y = SneOptimizerBuilder::new(2)
            .iterations(10)
            .jitter_scale(0.0)
            .build()
            .optimize(p.view())
            .unwrap();
        assert!(y.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_parameter_rejections() {
        let p = asymmetric_affinities();

        assert!(SneOptimizerBuilder::new(2)
            .iterations(1)
            .build()
            .optimize(p.view())
            .is_err());
        assert!(SneOptimizerBuilder::new(0)
            .build()
            .optimize(p.view())
            .is_err());
        assert!(SneOptimizerBuilder::new(2)
            .learning_rate(0.0)
            .build()
            .optimize(p.view())
            .is_err());
        assert!(SneOptimizerBuilder::new(2)
            .momentum(0.0)
            .build()
            .optimize(p.view())
            .is_err());
        assert!(SneOptimizerBuilder::new(2)
            .jitter_decay(1.0)
            .build()
            .optimize(p.view())
            .is_err());
        assert!(SneOptimizerBuilder::new(2)
            .jitter_scale(-0.1)
            .build()
            .optimize(p.view())
            .is_err());
    }

    #[test]
    fn test_same_seed_is_deterministic() {
        let mut rng = StdRng::seed_from_u64(42);
        let data = Array2::from_shape_fn((10, 3), |_| rng.random::<f64>());
        let d = pairwise_sq_distances(data.view());
        let calibration = AffinityCalibrator::new(5.0).calibrate(d.view()).unwrap();

        let run = || {
            SneOptimizerBuilder::new(2)
                .iterations(30)
                .seed(9)
                .build()
                .optimize(calibration.conditional.view())
                .unwrap()
        };
        let first = run();
        let second = run();
        assert_eq!(first, second);
    }
}
