use derive_more::Display;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::tensor::TILE_HW;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DataType {
    Float32,
    BFloat16,
    /// Block floating point: 8-bit mantissas sharing one exponent per 16 elements.
    BFloat8B,
    UInt32,
    UInt16,
}

impl DataType {
    /// Size in bytes of one element laid out row-major.
    ///
    /// Block float types have no row-major form. One byte (the mantissa) is reported for them.
    pub const fn element_size(self) -> usize {
        match self {
            DataType::Float32 => 4,
            DataType::BFloat16 => 2,
            DataType::BFloat8B => 1,
            DataType::UInt32 => 4,
            DataType::UInt16 => 2,
        }
    }

    /// Size in bytes of one 32x32 tile, including shared exponents.
    pub const fn tile_size(self) -> usize {
        match self {
            DataType::BFloat8B => TILE_HW + TILE_HW / 16,
            x => TILE_HW * x.element_size(),
        }
    }

    /// Returns `true` if the type can only be stored in tiles.
    pub const fn is_block_float(self) -> bool {
        matches!(self, DataType::BFloat8B)
    }
}
