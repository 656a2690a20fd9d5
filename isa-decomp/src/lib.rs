//! Reconstructs per-port µop decomposition from performance-counter
//! measurements against a microarchitecture description (C5).

pub mod error;
pub mod model;
pub mod ordering;
pub mod solver;

pub use error::{Error, Result};
pub use model::{Measurement, MicroOp, PortDecomposition};
pub use ordering::order_micro_operations;
pub use solver::{solve_port_decomposition, MipModel, SolverConfig, SolverStatus};
