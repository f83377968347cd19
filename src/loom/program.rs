use std::{
    borrow::Cow,
    collections::{BTreeMap, BTreeSet},
};

use derive_more::{Display, From, Into};
use rustc_hash::FxHashMap as HashMap;
use thiserror::Error;

use super::{
    grid::{CoreCoord, CoreRange, CoreRangeSet},
    num::DataType,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProgramError {
    #[error("kernel {0} does not exist")]
    Kernel(KernelHandle),
    #[error("circular buffer {0} does not exist")]
    CircularBuffer(CbHandle),
    #[error("kernel {0} is not placed on core {1}")]
    Core(KernelHandle, CoreCoord),
    #[error("circular buffer index {0} is already used on cores {1}")]
    CbIndex(u8, CoreRangeSet),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum KernelKind {
    /// Moves data from memory into circular buffers.
    Reader,
    /// Moves data from circular buffers back to memory.
    Writer,
    Compute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, From, Into)]
#[display("#{_0}")]
pub struct KernelHandle(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, From, Into)]
#[display("#{_0}")]
pub struct CbHandle(usize);

/// A kernel placed on a set of cores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Kernel {
    pub source: Cow<'static, str>,
    pub kind: KernelKind,
    pub cores: CoreRangeSet,
    pub compile_args: Vec<u32>,
    pub defines: BTreeMap<String, String>,
    pub runtime_args: HashMap<CoreCoord, Vec<u32>>,
}

impl Kernel {
    pub fn new(
        source: impl Into<Cow<'static, str>>,
        kind: KernelKind,
        cores: CoreRangeSet,
    ) -> Self {
        Self {
            source: source.into(),
            kind,
            cores,
            compile_args: vec![],
            defines: BTreeMap::new(),
            runtime_args: HashMap::default(),
        }
    }

    pub fn with_compile_args(mut self, args: impl IntoIterator<Item = u32>) -> Self {
        self.compile_args = args.into_iter().collect();
        self
    }

    pub fn with_define(mut self, key: impl ToString, value: impl ToString) -> Self {
        self.defines.insert(key.to_string(), value.to_string());
        self
    }
}

/// Staging memory shared between the kernels of a core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircularBuffer {
    pub cores: CoreRangeSet,
    pub index: u8,
    pub data_type: DataType,
    pub page_size: usize,
    pub total_size: usize,
    /// Set if the buffer is bound to a globally allocated buffer instead of local memory.
    pub address: Option<u32>,
}

impl CircularBuffer {
    pub fn new(
        cores: CoreRangeSet,
        index: u8,
        data_type: DataType,
        page_size: usize,
        num_pages: usize,
    ) -> Self {
        Self {
            cores,
            index,
            data_type,
            page_size,
            total_size: page_size * num_pages,
            address: None,
        }
    }

    pub fn with_address(mut self, address: u32) -> Self {
        self.address = Some(address);
        self
    }
}

/// An execution plan: kernels and circular buffers placed on cores of one device.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Program {
    kernels: Vec<Kernel>,
    circular_buffers: Vec<CircularBuffer>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_kernel(&mut self, kernel: Kernel) -> KernelHandle {
        let handle = KernelHandle(self.kernels.len());
        self.kernels.push(kernel);
        handle
    }

    pub fn create_circular_buffer(&mut self, cb: CircularBuffer) -> Result<CbHandle, ProgramError> {
        if let Some(other) = self
            .circular_buffers
            .iter()
            .find(|other| other.index == cb.index && other.cores.intersects(&cb.cores))
        {
            return Err(ProgramError::CbIndex(cb.index, other.cores.clone()));
        }
        let handle = CbHandle(self.circular_buffers.len());
        self.circular_buffers.push(cb);
        Ok(handle)
    }

    #[inline]
    pub fn kernels(&self) -> &[Kernel] {
        &self.kernels
    }

    #[inline]
    pub fn circular_buffers(&self) -> &[CircularBuffer] {
        &self.circular_buffers
    }

    pub fn kernel(&self, handle: KernelHandle) -> Result<&Kernel, ProgramError> {
        self.kernels
            .get(handle.0)
            .ok_or(ProgramError::Kernel(handle))
    }

    fn kernel_mut(&mut self, handle: KernelHandle) -> Result<&mut Kernel, ProgramError> {
        self.kernels
            .get_mut(handle.0)
            .ok_or(ProgramError::Kernel(handle))
    }

    /// Sets the runtime arguments of a kernel on one of its cores.
    pub fn set_runtime_args(
        &mut self,
        handle: KernelHandle,
        core: CoreCoord,
        args: impl IntoIterator<Item = u32>,
    ) -> Result<(), ProgramError> {
        let kernel = self.kernel_mut(handle)?;
        if !kernel.cores.contains(core) {
            return Err(ProgramError::Core(handle, core));
        }
        kernel.runtime_args.insert(core, args.into_iter().collect());
        Ok(())
    }

    pub fn runtime_args(
        &self,
        handle: KernelHandle,
        core: CoreCoord,
    ) -> Result<&[u32], ProgramError> {
        let kernel = self.kernel(handle)?;
        kernel
            .runtime_args
            .get(&core)
            .map(Vec::as_slice)
            .ok_or(ProgramError::Core(handle, core))
    }

    /// Runtime arguments of a kernel on a core, for patching in place.
    pub fn runtime_args_mut(
        &mut self,
        handle: KernelHandle,
        core: CoreCoord,
    ) -> Result<&mut Vec<u32>, ProgramError> {
        let kernel = self.kernel_mut(handle)?;
        kernel
            .runtime_args
            .get_mut(&core)
            .ok_or(ProgramError::Core(handle, core))
    }

    pub fn update_circular_buffer_address(
        &mut self,
        handle: CbHandle,
        address: u32,
    ) -> Result<(), ProgramError> {
        let cb = self
            .circular_buffers
            .get_mut(handle.0)
            .ok_or(ProgramError::CircularBuffer(handle))?;
        cb.address = Some(address);
        Ok(())
    }

    /// Cores any kernel of the program runs on.
    pub fn cores(&self) -> CoreRangeSet {
        let cores: BTreeSet<_> = self
            .kernels
            .iter()
            .flat_map(|kernel| kernel.cores.cores(true))
            .collect();
        CoreRangeSet::new(cores.into_iter().map(CoreRange::single))
            .map(|set| set.merge())
            .unwrap_or_default()
    }
}
