use derive_more::{Display, From, Into};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{
    grid::CoreCoord,
    program::{KernelHandle, Program},
    tensor::{Buffer, BufferType, Tensor, TensorSpec},
};

pub use sim::{LaunchRecord, SimDevice, SimDeviceBuilder};

pub mod allocator;
pub mod sim;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, From, Into)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display("{_0}")]
pub struct DeviceId(pub usize);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("out of {0} memory: failed to allocate {1} bytes")]
    OutOfMemory(BufferType, usize),
    #[error("buffer at {1:#x} in {0} is not allocated")]
    NotAllocated(BufferType, u32),
    #[error("buffer belongs to device {found}, not device {expected}")]
    WrongDevice { expected: DeviceId, found: DeviceId },
    #[error("kernel {0} ({1}) has no runtime arguments on core {2}")]
    RuntimeArgs(KernelHandle, String, CoreCoord),
    #[error("device backend is disconnected")]
    Disconnected,
}

/// How programs reach the device.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DispatchMode {
    /// Programs are queued to the device's backend and launched asynchronously.
    #[default]
    Fast,
    /// Programs are launched on the calling thread before `enqueue` returns.
    Slow,
}

impl DispatchMode {
    pub const ENV: &'static str = "MOSAIC_SLOW_DISPATCH_MODE";

    /// Slow dispatch if `MOSAIC_SLOW_DISPATCH_MODE` is set to anything but `0` or an empty string.
    pub fn from_env() -> Self {
        match std::env::var(Self::ENV) {
            Ok(value) if !value.is_empty() && value != "0" => Self::Slow,
            _ => Self::Fast,
        }
    }
}

/// A many-core device as seen by the dispatcher.
pub trait Device: Send + Sync {
    fn id(&self) -> DeviceId;
    /// Size of the grid of cores available to programs.
    fn grid_size(&self) -> CoreCoord;

    /// Allocates a device buffer for a tensor of `spec`.
    fn allocate(&self, spec: &TensorSpec) -> Result<Tensor, DeviceError>;
    fn deallocate(&self, tensor: &Tensor) -> Result<(), DeviceError>;
    fn is_allocated(&self, buffer: &Buffer) -> bool;

    /// Launches a program on the device.
    fn enqueue(&self, program: &Program, mode: DispatchMode) -> Result<(), DeviceError>;
}

#[derive(Debug)]
pub enum DeviceEvent {
    Launch {
        program: Box<Program>,
    },
    /// Sent after the launch log once every queued launch is done.
    Finish {
        sender: flume::Sender<Vec<LaunchRecord>>,
    },
}
