use std::hash::{Hash, Hasher};

use derive_more::{Display, From, Into};
use rustc_hash::FxHasher;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Structural hash of an operation invocation: the operation's type, its attributes and the
/// descriptors of its tensor arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, From, Into)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display("{_0:#018x}")]
pub struct ProgramHash(u64);

/// Hashes the operation type `Op` together with `attributes` and `args`.
///
/// The type is identified by its name so the hash stays stable between runs of the same build.
pub fn hash_operation<Op: ?Sized, A: Hash + ?Sized, T: Hash + ?Sized>(
    attributes: &A,
    args: &T,
) -> ProgramHash {
    let mut hasher = FxHasher::default();
    std::any::type_name::<Op>().hash(&mut hasher);
    attributes.hash(&mut hasher);
    args.hash(&mut hasher);
    ProgramHash(hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::{ProgramHash, hash_operation};

    struct Scale;
    struct Shift;

    #[test]
    fn test_hash_operation() {
        let x = hash_operation::<Scale, _, _>(&2.0f32.to_bits(), &[4, 4]);
        let y = hash_operation::<Scale, _, _>(&2.0f32.to_bits(), &[4, 4]);
        let z = hash_operation::<Shift, _, _>(&2.0f32.to_bits(), &[4, 4]);
        let w = hash_operation::<Scale, _, _>(&2.0f32.to_bits(), &[4, 8]);
        assert_eq!(x, y);
        assert_ne!(x, z);
        assert_ne!(x, w);
    }

    #[test]
    fn test_hash_display() {
        assert_eq!(ProgramHash::from(0xabu64).to_string(), "0x00000000000000ab");
    }
}
