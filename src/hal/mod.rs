//! Reference operations built on the dispatch layer.

pub mod copy;
pub mod frontend;
pub mod matmul;
pub mod ops;
