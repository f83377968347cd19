use std::sync::{Arc, Mutex};

use super::{
    Device, DeviceError, DeviceEvent, DeviceId, DispatchMode,
    allocator::{ALIGNMENT, Allocator},
};
use crate::loom::{
    grid::CoreCoord,
    platform,
    program::{KernelKind, Program},
    tensor::{Buffer, BufferType, Storage, Tensor, TensorSpec},
};

/// A program launched on a [`SimDevice`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRecord {
    pub program: Program,
    pub mode: DispatchMode,
}

#[derive(Debug, Default)]
pub struct Backend {
    /// Programs launched so far, in launch order.
    launches: Vec<LaunchRecord>,
}

impl Backend {
    /// Checks that the program can be launched and records it.
    fn execute(&mut self, program: Program, mode: DispatchMode) -> Result<(), DeviceError> {
        for (index, kernel) in program.kernels().iter().enumerate() {
            if kernel.kind == KernelKind::Compute {
                continue;
            }
            if let Some(core) = kernel
                .cores
                .cores(true)
                .find(|core| !kernel.runtime_args.contains_key(core))
            {
                let source = kernel.source.to_string();
                return Err(DeviceError::RuntimeArgs(index.into(), source, core));
            }
        }
        self.launches.push(LaunchRecord { program, mode });
        Ok(())
    }
}

/// A simulated device: it allocates buffers and checks and records the programs it is given,
/// without running any kernel.
#[derive(Debug, Clone)]
pub struct SimDevice {
    /// The unique identifier of the device.
    id: DeviceId,
    grid_size: CoreCoord,
    allocator: Arc<Mutex<Allocator>>,
    backend: Arc<Mutex<Backend>>,
    /// Sends programs to launch to the backend.
    sender: flume::Sender<DeviceEvent>,
}

impl SimDevice {
    /// Waits for every program queued so far and returns the launch log.
    pub async fn finish(&self) -> Result<Vec<LaunchRecord>, DeviceError> {
        let (sender, receiver) = flume::bounded(1);
        self.sender
            .send_async(DeviceEvent::Finish { sender })
            .await
            .map_err(|_| DeviceError::Disconnected)?;
        receiver
            .recv_async()
            .await
            .map_err(|_| DeviceError::Disconnected)
    }

    /// Number of bytes allocated in each buffer type.
    pub fn memory_used(&self) -> (usize, usize) {
        let allocator = self.allocator.lock().expect("failed to lock");
        let dram = allocator.region(BufferType::Dram).used();
        let l1 = allocator.region(BufferType::L1).used();
        (dram, l1)
    }

    fn check_device(&self, buffer: &Buffer) -> Result<(), DeviceError> {
        match buffer.device == self.id {
            true => Ok(()),
            false => Err(DeviceError::WrongDevice {
                expected: self.id,
                found: buffer.device,
            }),
        }
    }
}

impl Device for SimDevice {
    #[inline]
    fn id(&self) -> DeviceId {
        self.id
    }

    #[inline]
    fn grid_size(&self) -> CoreCoord {
        self.grid_size
    }

    fn allocate(&self, spec: &TensorSpec) -> Result<Tensor, DeviceError> {
        let buffer_type = spec.memory.buffer;
        let size = spec.size();
        let address = self
            .allocator
            .lock()
            .expect("failed to lock")
            .alloc(buffer_type, size)?;
        let buffer = Buffer {
            device: self.id,
            address,
            size,
            buffer_type,
        };
        log::trace!(
            "allocated {size} bytes at {address:#x} in {buffer_type} on device {}",
            self.id
        );
        Ok(Tensor::new(spec.clone(), Storage::Device(buffer)))
    }

    fn deallocate(&self, tensor: &Tensor) -> Result<(), DeviceError> {
        let buffer = match tensor.storage() {
            Storage::Device(buffer) => buffer,
            Storage::Host | Storage::MultiDevice(_) => return Ok(()),
        };
        self.check_device(buffer)?;
        self.allocator
            .lock()
            .expect("failed to lock")
            .free(buffer.buffer_type, buffer.address)
    }

    fn is_allocated(&self, buffer: &Buffer) -> bool {
        buffer.device == self.id
            && self
                .allocator
                .lock()
                .expect("failed to lock")
                .is_allocated(buffer.buffer_type, buffer.address)
    }

    fn enqueue(&self, program: &Program, mode: DispatchMode) -> Result<(), DeviceError> {
        let program = program.clone();
        match mode {
            DispatchMode::Fast => {
                let program = Box::new(program);
                self.sender
                    .send(DeviceEvent::Launch { program })
                    .map_err(|_| DeviceError::Disconnected)
            }
            DispatchMode::Slow => self
                .backend
                .lock()
                .expect("failed to lock")
                .execute(program, mode),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SimDeviceBuilder {
    pub id: DeviceId,
    pub grid_size: CoreCoord,
    /// Base address and size of DRAM.
    pub dram: (u32, u32),
    /// Base address and size of the L1 space available to buffers.
    pub l1: (u32, u32),
}

impl SimDeviceBuilder {
    pub const DEFAULT_DRAM: (u32, u32) = (ALIGNMENT, 1 << 30);
    pub const DEFAULT_L1: (u32, u32) = (0x1_0000, 1 << 20);

    pub fn new(grid_size: impl Into<CoreCoord>) -> Self {
        Self {
            id: Default::default(),
            grid_size: grid_size.into(),
            dram: Self::DEFAULT_DRAM,
            l1: Self::DEFAULT_L1,
        }
    }

    pub fn id(mut self, id: impl Into<DeviceId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn dram(mut self, base: u32, size: u32) -> Self {
        self.dram = (base, size);
        self
    }

    pub fn l1(mut self, base: u32, size: u32) -> Self {
        self.l1 = (base, size);
        self
    }

    pub async fn build(self) -> SimDevice {
        let allocator = Arc::new(Mutex::new(Allocator::new(self.dram, self.l1)));
        let backend = Arc::new(Mutex::new(Backend::default()));

        let (sender, receiver) = flume::unbounded();
        platform::spawn(serve(self.id, backend.clone(), receiver));

        SimDevice {
            id: self.id,
            grid_size: self.grid_size,
            allocator,
            backend,
            sender,
        }
    }
}

async fn serve(id: DeviceId, backend: Arc<Mutex<Backend>>, receiver: flume::Receiver<DeviceEvent>) {
    while let Ok(event) = receiver.recv_async().await {
        match event {
            DeviceEvent::Launch { program } => {
                let result = backend
                    .lock()
                    .expect("failed to lock")
                    .execute(*program, DispatchMode::Fast);
                if let Err(err) = result {
                    log::error!("failed to launch program on device {id}: {err}");
                }
            }
            DeviceEvent::Finish { sender } => {
                let launches = backend.lock().expect("failed to lock").launches.clone();
                _ = sender.send_async(launches).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::SimDeviceBuilder;
    use crate::loom::{
        device::{Device, DeviceError, DeviceId, DispatchMode},
        grid::{CoreCoord, CoreRange},
        num::DataType,
        program::{Kernel, KernelKind, Program},
        tensor::{BufferType, Layout, MemoryConfig, TensorSpec},
    };

    fn program(with_args: bool) -> Result<Program, Box<dyn Error>> {
        let mut program = Program::new();
        let cores = CoreRange::new((0, 0), (1, 0))?.into();
        let reader = program.create_kernel(Kernel::new("reader", KernelKind::Reader, cores));
        program.set_runtime_args(reader, CoreCoord::new(0, 0), [0, 1, 0])?;
        if with_args {
            program.set_runtime_args(reader, CoreCoord::new(1, 0), [0, 1, 1])?;
        }
        Ok(program)
    }

    #[tokio::test]
    async fn test_allocate() -> Result<(), Box<dyn Error>> {
        let device = SimDeviceBuilder::new((8, 8)).id(DeviceId(3)).build().await;
        assert_eq!(device.id(), DeviceId(3));
        assert_eq!(device.grid_size(), CoreCoord::new(8, 8));

        let spec = TensorSpec::new([64, 64], DataType::BFloat16, Layout::Tile);
        let x = device.allocate(&spec)?;
        let l1 = MemoryConfig::interleaved(BufferType::L1);
        let y = device.allocate(&spec.clone().with_memory(l1))?;
        assert_eq!(x.buffer()?.size, 4 * 2048);
        assert_eq!(y.buffer()?.buffer_type, BufferType::L1);
        assert_eq!(device.memory_used(), (4 * 2048, 4 * 2048));

        let address = x.address()?;
        device.deallocate(&x)?;
        assert!(!device.is_allocated(x.buffer()?));
        assert_eq!(
            device.deallocate(&x),
            Err(DeviceError::NotAllocated(BufferType::Dram, address))
        );

        let z = device.allocate(&spec)?;
        assert_eq!(z.address()?, address);
        Ok(())
    }

    #[tokio::test]
    async fn test_enqueue() -> Result<(), Box<dyn Error>> {
        let device = SimDeviceBuilder::new((2, 2)).build().await;
        device.enqueue(&program(true)?, DispatchMode::Fast)?;
        device.enqueue(&program(true)?, DispatchMode::Slow)?;

        let err = device.enqueue(&program(false)?, DispatchMode::Slow);
        assert!(matches!(
            err,
            Err(DeviceError::RuntimeArgs(_, _, core)) if core == CoreCoord::new(1, 0)
        ));

        // a failed fast launch is logged by the backend and not recorded
        device.enqueue(&program(false)?, DispatchMode::Fast)?;

        let launches = device.finish().await?;
        assert_eq!(launches.len(), 2);
        assert!(launches.iter().any(|launch| launch.mode == DispatchMode::Fast));
        assert!(launches.iter().any(|launch| launch.mode == DispatchMode::Slow));
        Ok(())
    }
}
