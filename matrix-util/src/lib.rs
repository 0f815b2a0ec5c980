pub mod common_io; // gzip-aware line readers and writers
pub mod dmatrix_io; // named matrix text I/O for `nalgebra::DMatrix`
pub mod dmatrix_util; // missing-value bookkeeping
pub mod traits;
pub mod utils; // minibatch intervals
