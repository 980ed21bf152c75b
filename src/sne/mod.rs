//! # Embedding pipeline
//!
//! Thin driver over the affinity calibrator and the embedding optimizer:
//! validates the parameter ranges, computes pairwise squared distances,
//! calibrates the conditional affinities, and runs the optimizer. Returns
//! the embedding together with the per-point bandwidth diagnostic and an
//! algorithm identifier tag.

use anyhow::bail;
use ndarray::{Array1, Array2, ArrayView2};

use crate::affinity::{AffinityCalibrator, SearchPolicy};
use crate::distance::pairwise_sq_distances;
use crate::embedding::{CostVariant, SneOptimizerBuilder};
use crate::utils::FloatOps;

/// Parameters for one embedding run. All ranges are checked by
/// [`SneParams::validate`] before any computation starts; a perplexity
/// outside the recommended `[5, 50]` band is a warning, not an error.
#[derive(Debug, Clone)]
pub struct SneParams<T> {
    pub target_dim: usize,
    pub perplexity: T,
    pub learning_rate: T,
    pub iterations: usize,
    pub jitter_scale: T,
    pub jitter_decay: T,
    pub momentum: T,
    /// Selects the symmetric joint-cost variant instead of the classic
    /// asymmetric conditional cost.
    pub symmetric: bool,
    pub tolerance: T,
    pub max_search_steps: usize,
    pub search_policy: SearchPolicy,
    pub seed: u64,
}

impl<T: FloatOps> Default for SneParams<T> {
    fn default() -> Self {
        Self {
            target_dim: 2,
            perplexity: T::from_f64(30.0).unwrap(),
            learning_rate: T::from_f64(0.05).unwrap(),
            iterations: 500,
            jitter_scale: T::from_f64(0.3).unwrap(),
            jitter_decay: T::from_f64(0.9).unwrap(),
            momentum: T::from_f64(0.9).unwrap(),
            symmetric: false,
            tolerance: T::from_f64(1e-5).unwrap(),
            max_search_steps: 50,
            search_policy: SearchPolicy::default(),
            seed: 42,
        }
    }
}

impl<T: FloatOps> SneParams<T> {
    /// Checks every parameter against its documented range.
    pub fn validate(&self, n_features: usize) -> anyhow::Result<()> {
        if self.target_dim < 1 || self.target_dim > n_features {
            bail!(
                "target_dim must be between 1 and the feature count ({}), got {}",
                n_features,
                self.target_dim
            );
        }
        if self.perplexity <= T::zero() {
            bail!("perplexity must be positive, got {:?}", self.perplexity);
        }
        let low = T::from_f64(5.0).unwrap();
        let high = T::from_f64(50.0).unwrap();
        if self.perplexity < low || self.perplexity > high {
            log::warn!(
                "perplexity {:?} is outside the recommended [5, 50] band",
                self.perplexity
            );
        }
        if self.learning_rate <= T::zero() {
            bail!("learning_rate must be positive, got {:?}", self.learning_rate);
        }
        if self.iterations < 2 {
            bail!("iterations must be at least 2, got {}", self.iterations);
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
        if self.momentum <= T::zero() {
            bail!("momentum must be positive, got {:?}", self.momentum);
        }
        if self.tolerance <= T::zero() {
            bail!("tolerance must be positive, got {:?}", self.tolerance);
        }
        if self.max_search_steps == 0 {
            bail!("max_search_steps must be at least 1");
        }
        Ok(())
    }

    fn method(&self) -> &'static str {
        if self.symmetric {
            "ssne"
        } else {
            "sne"
        }
    }
}

/// Output of one embedding run.
pub struct SneResult<T> {
    /// n × target_dim embedding coordinates.
    pub embedding: Array2<T>,
    /// Per-point calibrated bandwidth, `1 / beta_i`.
    pub bandwidths: Array1<T>,
    /// Algorithm identifier tag: `"sne"` or `"ssne"`.
    pub method: &'static str,
}

/// Embeds the rows of `data` into `params.target_dim` dimensions.
pub fn embed<T: FloatOps>(data: ArrayView2<T>, params: &SneParams<T>) -> anyhow::Result<SneResult<T>> {
    run(data, params, None)
}

/// Like [`embed`], but seeds the optimizer with caller-supplied initial
/// coordinates, e.g. the output of a linear pre-reduction.
pub fn embed_with_init<T: FloatOps>(
    data: ArrayView2<T>,
    params: &SneParams<T>,
    initial: Array2<T>,
) -> anyhow::Result<SneResult<T>> {
    run(data, params, Some(initial))
}

fn run<T: FloatOps>(
    data: ArrayView2<T>,
    params: &SneParams<T>,
    initial: Option<Array2<T>>,
) -> anyhow::Result<SneResult<T>> {
    params.validate(data.ncols())?;

    let distances = pairwise_sq_distances(data);
    let calibration = AffinityCalibrator::new(params.perplexity)
        .tolerance(params.tolerance)
        .max_search_steps(params.max_search_steps)
        .search_policy(params.search_policy)
        .calibrate(distances.view())?;
    if !calibration.unconverged.is_empty() {
        log::warn!(
            "bandwidth search did not reach tolerance for {} of {} points",
            calibration.unconverged.len(),
            data.nrows()
        );
    }

    let optimizer = SneOptimizerBuilder::new(params.target_dim)
        .learning_rate(params.learning_rate)
        .iterations(params.iterations)
        .jitter_scale(params.jitter_scale)
        .jitter_decay(params.jitter_decay)
        .momentum(params.momentum)
        .variant(if params.symmetric {
            CostVariant::Symmetric
        } else {
            CostVariant::Asymmetric
        })
        .seed(params.seed)
        .build();

    let embedding = match initial {
        Some(y0) => optimizer.optimize_from(calibration.conditional.view(), y0)?,
        None => optimizer.optimize(calibration.conditional.view())?,
    };

    Ok(SneResult {
        embedding,
        bandwidths: calibration.bandwidths,
        method: params.method(),
    })
}
