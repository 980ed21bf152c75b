pub mod affinity;
pub mod distance;
pub mod embedding;
pub mod sne;
mod utils;

pub use affinity::{AffinityCalibrator, Calibration, SearchPolicy};
pub use embedding::{joint_affinities, CostVariant, SneOptimizer, SneOptimizerBuilder};
pub use sne::{embed, embed_with_init, SneParams, SneResult};
pub use utils::FloatOps;
