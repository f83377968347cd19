use std::{borrow::Cow, fmt::Debug, hash::Hash};

use thiserror::Error;

use super::{
    cache::{CacheEntry, CacheError, CachedProgram, CachedProgramMut},
    device::{Device, DeviceError, DeviceId},
    grid::{CoreCoord, GridError},
    hash::{ProgramHash, hash_operation},
    program::ProgramError,
    tensor::{Tensor, TensorError, TensorSpec},
};

#[derive(Debug, Error)]
pub enum OpError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("cached program {hash} is stale: {source}")]
    StaleProgram {
        hash: ProgramHash,
        source: Box<OpError>,
    },
    #[error(transparent)]
    Grid(#[from] GridError),
    #[error(transparent)]
    Program(#[from] ProgramError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error("operation has no tensor arguments")]
    NoTensors,
    #[error("no dispatcher for device {0}")]
    UnknownDevice(DeviceId),
}

/// Returns a validation error from the enclosing function unless the condition holds.
macro_rules! ensure {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::loom::ops::OpError::Validation(format!($($arg)+)));
        }
    };
}
pub(crate) use ensure;

/// Narrows a count or size to a 32-bit kernel argument.
pub fn kernel_arg(name: &str, value: usize) -> Result<u32, OpError> {
    u32::try_from(value).map_err(|_| {
        OpError::Validation(format!("{name} of {value} does not fit in a kernel argument"))
    })
}

/// A field of an operation's tensor arguments that may hold tensors.
pub trait TensorField: Sized {
    fn visit<'a>(&'a self, tensors: &mut Vec<&'a Tensor>);
    fn transform(
        &self,
        f: &mut dyn FnMut(&Tensor) -> Result<Tensor, TensorError>,
    ) -> Result<Self, TensorError>;
}

impl TensorField for Tensor {
    #[inline]
    fn visit<'a>(&'a self, tensors: &mut Vec<&'a Tensor>) {
        tensors.push(self);
    }

    #[inline]
    fn transform(
        &self,
        f: &mut dyn FnMut(&Tensor) -> Result<Tensor, TensorError>,
    ) -> Result<Self, TensorError> {
        f(self)
    }
}

impl TensorField for Option<Tensor> {
    #[inline]
    fn visit<'a>(&'a self, tensors: &mut Vec<&'a Tensor>) {
        tensors.extend(self.iter());
    }

    #[inline]
    fn transform(
        &self,
        f: &mut dyn FnMut(&Tensor) -> Result<Tensor, TensorError>,
    ) -> Result<Self, TensorError> {
        self.as_ref().map(f).transpose()
    }
}

impl TensorField for Vec<Tensor> {
    #[inline]
    fn visit<'a>(&'a self, tensors: &mut Vec<&'a Tensor>) {
        tensors.extend(self.iter());
    }

    #[inline]
    fn transform(
        &self,
        f: &mut dyn FnMut(&Tensor) -> Result<Tensor, TensorError>,
    ) -> Result<Self, TensorError> {
        self.iter().map(f).collect()
    }
}

/// The tensor arguments of an operation. Derive it with `#[derive(TensorArgs)]`.
///
/// Hashing the arguments must only see tensor descriptors, never buffer addresses.
pub trait TensorArgs: Debug + Hash + Clone + Send + Sync + 'static {
    /// All tensors in field order.
    fn tensors(&self) -> Vec<&Tensor>;
    /// Rebuilds the arguments with every tensor replaced by `f`'s result.
    fn map_tensors(
        &self,
        f: &mut dyn FnMut(&Tensor) -> Result<Tensor, TensorError>,
    ) -> Result<Self, TensorError>;
}

/// The result of an operation: one or more device tensors.
pub trait OpOutput: Debug + Clone + Send + Sync + 'static {
    type Spec: Debug + Clone;

    fn allocate<D: Device>(spec: &Self::Spec, device: &D) -> Result<Self, DeviceError>;
    fn tensors(&self) -> Vec<&Tensor>;
    /// Combines the outputs of one operation launched on several devices.
    fn from_shards(shards: Vec<Self>) -> Result<Self, TensorError>;
}

impl OpOutput for Tensor {
    type Spec = TensorSpec;

    #[inline]
    fn allocate<D: Device>(spec: &Self::Spec, device: &D) -> Result<Self, DeviceError> {
        device.allocate(spec)
    }

    #[inline]
    fn tensors(&self) -> Vec<&Tensor> {
        vec![self]
    }

    #[inline]
    fn from_shards(shards: Vec<Self>) -> Result<Self, TensorError> {
        Tensor::from_shards(shards)
    }
}

impl OpOutput for Vec<Tensor> {
    type Spec = Vec<TensorSpec>;

    fn allocate<D: Device>(spec: &Self::Spec, device: &D) -> Result<Self, DeviceError> {
        spec.iter().map(|spec| device.allocate(spec)).collect()
    }

    fn tensors(&self) -> Vec<&Tensor> {
        self.iter().collect()
    }

    fn from_shards(shards: Vec<Self>) -> Result<Self, TensorError> {
        let len = shards.first().map_or(0, Vec::len);
        let mut shards = shards.into_iter().map(Vec::into_iter).collect::<Vec<_>>();
        (0..len)
            .map(|_| Tensor::from_shards(shards.iter_mut().filter_map(Iterator::next)))
            .collect()
    }
}

/// What a program factory knows about the device it builds for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FactoryContext {
    pub device: DeviceId,
    pub grid_size: CoreCoord,
}

/// Builds the program of an operation, and patches a cached one for new buffers.
pub trait ProgramFactory<Op: DeviceOperation> {
    /// State kept next to the cached program, typically kernel handles and the cores to patch.
    type Shared: Send + Sync + 'static;

    fn create(
        context: &FactoryContext,
        attributes: &Op::Attributes,
        args: &Op::TensorArgs,
        output: &Op::Output,
    ) -> Result<CachedProgram<Self::Shared>, OpError>;

    /// Updates the runtime arguments of a cached program so that launching it is equivalent to
    /// launching a freshly created one for these arguments.
    fn override_runtime_arguments(
        cached: CachedProgramMut<'_, Self::Shared>,
        attributes: &Op::Attributes,
        args: &Op::TensorArgs,
        output: &Op::Output,
    ) -> Result<(), OpError>;
}

/// The set of program factories of an operation, as an enum with one variant per factory.
/// Derive it with `#[derive(ProgramFactories)]`.
pub trait ProgramFactories<Op: DeviceOperation>: Sized {
    /// Index of the variant, stored next to cached programs.
    fn index(&self) -> usize;
    fn from_index(index: usize) -> Option<Self>;

    fn create(
        &self,
        context: &FactoryContext,
        attributes: &Op::Attributes,
        args: &Op::TensorArgs,
        output: &Op::Output,
    ) -> Result<CacheEntry, OpError>;

    fn override_runtime_arguments(
        &self,
        entry: &mut CacheEntry,
        attributes: &Op::Attributes,
        args: &Op::TensorArgs,
        output: &Op::Output,
    ) -> Result<(), OpError>;
}

/// An operation that runs as a program on a device.
pub trait DeviceOperation: Sized + 'static {
    type Attributes: Debug + Hash + Clone + Send + Sync + 'static;
    type TensorArgs: TensorArgs;
    type Output: OpOutput;
    type Factory: ProgramFactories<Self> + Debug;

    fn name() -> Cow<'static, str> {
        let name = std::any::type_name::<Self>();
        name.rsplit("::").next().unwrap_or(name).into()
    }

    /// Full validation, run whenever the program has to be built.
    fn validate_on_program_cache_miss(
        attributes: &Self::Attributes,
        args: &Self::TensorArgs,
    ) -> Result<(), OpError>;

    /// Cheap validation, run before patching a cached program.
    fn validate_on_program_cache_hit(
        attributes: &Self::Attributes,
        args: &Self::TensorArgs,
    ) -> Result<(), OpError>;

    fn compute_output_specs(
        attributes: &Self::Attributes,
        args: &Self::TensorArgs,
    ) -> Result<<Self::Output as OpOutput>::Spec, OpError>;

    fn create_output_tensors<D: Device>(
        attributes: &Self::Attributes,
        args: &Self::TensorArgs,
        device: &D,
    ) -> Result<Self::Output, OpError> {
        let spec = Self::compute_output_specs(attributes, args)?;
        Ok(<Self::Output as OpOutput>::allocate(&spec, device)?)
    }

    fn select_program_factory(
        attributes: &Self::Attributes,
        args: &Self::TensorArgs,
    ) -> Self::Factory;

    fn compute_program_hash(attributes: &Self::Attributes, args: &Self::TensorArgs) -> ProgramHash {
        hash_operation::<Self, _, _>(attributes, args)
    }
}
