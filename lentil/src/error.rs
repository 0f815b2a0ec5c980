use thiserror::Error;

/// Failures surfaced by the estimation core.
///
/// `InvalidConfig` and `ShapeMismatch` are raised before any estimation
/// work starts. `InsufficientSignal` and `RankDeficient` abort the whole
/// run; no partial table is returned.
#[derive(Error, Debug)]
pub enum DeconvError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error(
        "insufficient signal: {0}. \
         Try broadening the region-inclusion criteria (more DMRs or anchor regions)"
    )]
    InsufficientSignal(String),

    #[error("signature matrix has only {rank} independent columns for {ncols} cell types")]
    RankDeficient { rank: usize, ncols: usize },

    #[error("proportion solver failed: {0}")]
    Solver(String),
}

pub type DeconvResult<T> = std::result::Result<T, DeconvError>;
