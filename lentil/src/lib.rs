//! Cell-type proportions of bulk methylation samples.
//!
//! Each region's methylation level in a sample is modelled as a mixture
//! of an unmethylated and a methylated state signal, weighted by the
//! fraction of the sample's cells that carry the methylated state at that
//! region according to a reference signature. The proportions and the
//! state parameters are fitted by expectation-maximization, with the
//! proportions kept on the probability simplex.

pub mod common;
pub mod data;
pub mod em;
pub mod error;
pub mod estimate;
pub mod init;
pub mod param;
pub mod simplex_qp;
pub mod simulate;

pub use data::{AnchorRegions, MethylationMatrix, MethylationSource, SignatureMatrix};
pub use error::{DeconvError, DeconvResult};
pub use estimate::{estimate_cell_counts, CellCounts, EstimateConfig, ProgressEvent};
pub use init::InitMethod;
pub use param::{StateOverrides, StateParams};
