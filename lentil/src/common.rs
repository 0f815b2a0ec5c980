pub use log::{debug, info, warn};

pub type Mat = nalgebra::DMatrix<f64>;
pub type DVec = nalgebra::DVector<f64>;

pub const DEFAULT_EPSILON: f64 = 0.01;
pub const DEFAULT_MAX_ITER: usize = 100;
pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_SEED: u64 = 42;

/// lower bound of every variance component
pub const VAR_FLOOR: f64 = 1e-6;

/// minimum gap between the two state means at initialization
pub const MIN_STATE_GAP: f64 = 0.05;

pub use crate::error::{DeconvError, DeconvResult};
