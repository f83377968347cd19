pub mod hal;
pub mod loom;

pub use mosaic_derive::{ProgramFactories, TensorArgs};
