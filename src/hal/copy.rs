//! Program factories of [`CopyOperation`].
//!
//! Interleaved copies stream pages through a pair of reader and writer kernels, spreading the pages
//! over the grid with [`split_work_to_cores`]. Sharded copies run on the cores owning the shards,
//! with circular buffers bound directly to the input and output buffers.

use super::ops::{CopyArgs, CopyAttributes, CopyOperation};
use crate::loom::{
    cache::{CachedProgram, CachedProgramMut},
    grid::{CoreCoord, CoreRangeSet},
    ops::{FactoryContext, OpError, ProgramFactory, kernel_arg},
    program::{CbHandle, CircularBuffer, Kernel, KernelHandle, KernelKind, Program},
    split::split_work_to_cores,
    tensor::{BufferType, Layout, TILE_HEIGHT, TILE_WIDTH, Tensor},
};

/// Index of the circular buffer feeding compute kernels.
pub const CB_INPUT: u8 = 0;
/// Index of the circular buffer compute kernels write to.
pub const CB_OUTPUT: u8 = 16;

/// Number of pages double-buffered by streaming kernels.
const NUM_BUFFERED_PAGES: usize = 2;

#[inline]
fn is_dram(tensor: &Tensor) -> u32 {
    (tensor.memory().buffer == BufferType::Dram) as u32
}

fn typecast_define(input: &Tensor, output: &Tensor) -> String {
    format!("typecast_tile<{}, {}>", input.data_type(), output.data_type())
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InterleavedCopy;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterleavedCopyShared {
    pub reader: KernelHandle,
    pub writer: KernelHandle,
    /// Cores with runtime arguments, in raster order.
    pub cores: Vec<CoreCoord>,
}

impl ProgramFactory<CopyOperation> for InterleavedCopy {
    type Shared = InterleavedCopyShared;

    fn create(
        context: &FactoryContext,
        attributes: &CopyAttributes,
        args: &CopyArgs,
        output: &Tensor,
    ) -> Result<CachedProgram<Self::Shared>, OpError> {
        let input = &args.input;
        let (src, dst) = (input.address()?, output.address()?);

        let num_units = kernel_arg("number of pages", input.spec().num_pages())?;
        // row-major copies move one stick per unit and need its size at runtime
        let stick_size = match input.layout() {
            Layout::Tile => None,
            Layout::RowMajor => Some(kernel_arg("stick size", input.spec().page_size())?),
        };
        let split = split_work_to_cores(context.grid_size, num_units, false)?;
        let convert = input.data_type() != output.data_type();

        let mut program = Program::new();
        let cores = split.all_cores.clone();

        let page_size = input.spec().page_size();
        program.create_circular_buffer(CircularBuffer::new(
            cores.clone(),
            CB_INPUT,
            input.data_type(),
            page_size,
            NUM_BUFFERED_PAGES,
        ))?;
        let cb_output = match convert {
            true => {
                let page_size = output.spec().page_size();
                program.create_circular_buffer(CircularBuffer::new(
                    cores.clone(),
                    CB_OUTPUT,
                    output.data_type(),
                    page_size,
                    NUM_BUFFERED_PAGES,
                ))?;
                CB_OUTPUT
            }
            false => CB_INPUT,
        };

        let (reader, writer) = match input.layout() {
            Layout::Tile => (
                "kernels/dataflow/reader_unary_interleaved_start_id.cpp",
                "kernels/dataflow/writer_unary_interleaved_start_id.cpp",
            ),
            Layout::RowMajor => (
                "kernels/dataflow/reader_unary_stick_layout_interleaved_start_id.cpp",
                "kernels/dataflow/writer_unary_stick_layout_interleaved_start_id.cpp",
            ),
        };
        let mut reader = Kernel::new(reader, KernelKind::Reader, cores.clone())
            .with_compile_args([CB_INPUT as u32, is_dram(input)]);
        let mut writer = Kernel::new(writer, KernelKind::Writer, cores.clone())
            .with_compile_args([cb_output as u32, is_dram(output)]);
        if attributes.backwards {
            reader = reader.with_define("BACKWARDS", 1);
            writer = writer.with_define("BACKWARDS", 1);
        }
        let reader = program.create_kernel(reader);
        let writer = program.create_kernel(writer);

        if convert {
            let groups = [
                (&split.group_1, split.units_per_core_group_1),
                (&split.group_2, split.units_per_core_group_2),
            ];
            for (group, units) in groups.into_iter().filter(|(group, _)| !group.is_empty()) {
                let source = "kernels/compute/eltwise_copy.cpp";
                let kernel = Kernel::new(source, KernelKind::Compute, group.clone())
                    .with_compile_args([units, CB_INPUT as u32, CB_OUTPUT as u32])
                    .with_define("TYPECAST_LLK", typecast_define(input, output));
                program.create_kernel(kernel);
            }
        }

        let mut start_id = match attributes.backwards {
            true => num_units.saturating_sub(1),
            false => 0,
        };
        let mut shared_cores = Vec::with_capacity(split.target_num_cores as usize);
        for (core, units) in split.cores() {
            let reader_args = std::iter::once(src)
                .chain(stick_size)
                .chain([units, start_id]);
            let writer_args = std::iter::once(dst)
                .chain(stick_size)
                .chain([units, start_id]);
            program.set_runtime_args(reader, core, reader_args)?;
            program.set_runtime_args(writer, core, writer_args)?;

            // going backwards, the id wraps below zero after the last core
            start_id = match attributes.backwards {
                true => start_id.wrapping_sub(units),
                false => start_id + units,
            };
            shared_cores.push(core);
        }

        let shared = InterleavedCopyShared {
            reader,
            writer,
            cores: shared_cores,
        };
        Ok(CachedProgram::new(program, shared))
    }

    fn override_runtime_arguments(
        cached: CachedProgramMut<'_, Self::Shared>,
        _attributes: &CopyAttributes,
        args: &CopyArgs,
        output: &Tensor,
    ) -> Result<(), OpError> {
        let CachedProgramMut { program, shared } = cached;
        let (src, dst) = (args.input.address()?, output.address()?);
        for &core in &shared.cores {
            program.runtime_args_mut(shared.reader, core)?[0] = src;
            program.runtime_args_mut(shared.writer, core)?[0] = dst;
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ShardedCopy;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardedCopyShared {
    pub input: CbHandle,
    pub output: CbHandle,
}

impl ProgramFactory<CopyOperation> for ShardedCopy {
    type Shared = ShardedCopyShared;

    fn create(
        _context: &FactoryContext,
        _attributes: &CopyAttributes,
        args: &CopyArgs,
        output: &Tensor,
    ) -> Result<CachedProgram<Self::Shared>, OpError> {
        let input = &args.input;
        let Some(shard) = &input.memory().shard else {
            return Err(OpError::Validation("sharded copy needs a shard spec".into()));
        };
        let cores: CoreRangeSet = shard.grid.clone();

        let [height, width] = shard.shape;
        let num_pages = match input.layout() {
            Layout::Tile => (height / TILE_HEIGHT) * (width / TILE_WIDTH),
            Layout::RowMajor => height,
        };
        let num_pages_arg = kernel_arg("pages per shard", num_pages)?;
        let shard_page_size = |tensor: &Tensor| match tensor.layout() {
            Layout::Tile => tensor.data_type().tile_size(),
            Layout::RowMajor => width * tensor.data_type().element_size(),
        };

        let mut program = Program::new();
        let input_cb = program.create_circular_buffer(
            CircularBuffer::new(
                cores.clone(),
                CB_INPUT,
                input.data_type(),
                shard_page_size(input),
                num_pages,
            )
            .with_address(input.address()?),
        )?;
        let output_cb = program.create_circular_buffer(
            CircularBuffer::new(
                cores.clone(),
                CB_OUTPUT,
                output.data_type(),
                shard_page_size(output),
                num_pages,
            )
            .with_address(output.address()?),
        )?;

        let reader = program.create_kernel(
            Kernel::new(
                "kernels/dataflow/reader_unary_sharded.cpp",
                KernelKind::Reader,
                cores.clone(),
            )
            .with_compile_args([CB_INPUT as u32]),
        );
        let writer = program.create_kernel(
            Kernel::new(
                "kernels/dataflow/writer_unary_sharded.cpp",
                KernelKind::Writer,
                cores.clone(),
            )
            .with_compile_args([CB_OUTPUT as u32]),
        );
        let source = "kernels/compute/eltwise_copy.cpp";
        let mut compute = Kernel::new(source, KernelKind::Compute, cores.clone())
            .with_compile_args([num_pages_arg, CB_INPUT as u32, CB_OUTPUT as u32]);
        if input.data_type() != output.data_type() {
            compute = compute.with_define("TYPECAST_LLK", typecast_define(input, output));
        }
        program.create_kernel(compute);

        for core in cores.cores(true) {
            program.set_runtime_args(reader, core, [num_pages_arg])?;
            program.set_runtime_args(writer, core, [num_pages_arg])?;
        }

        let shared = ShardedCopyShared {
            input: input_cb,
            output: output_cb,
        };
        Ok(CachedProgram::new(program, shared))
    }

    fn override_runtime_arguments(
        cached: CachedProgramMut<'_, Self::Shared>,
        _attributes: &CopyAttributes,
        args: &CopyArgs,
        output: &Tensor,
    ) -> Result<(), OpError> {
        let CachedProgramMut { program, shared } = cached;
        program.update_circular_buffer_address(shared.input, args.input.address()?)?;
        program.update_circular_buffer_address(shared.output, output.address()?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::{CB_INPUT, CB_OUTPUT, InterleavedCopy, ShardedCopy};
    use crate::{
        hal::{
            frontend::TensorOps,
            ops::{CopyArgs, CopyAttributes, CopyOperation},
        },
        loom::{
            device::{Device, DeviceId, SimDeviceBuilder},
            dispatch::DispatcherBuilder,
            grid::{CoreCoord, CoreRange},
            num::DataType,
            ops::{FactoryContext, OpError, ProgramFactory},
            program::KernelKind,
            tensor::{
                Buffer, BufferType, Layout, MemoryConfig, ShardOrientation, ShardSpec, Storage,
                Tensor, TensorMemoryLayout, TensorSpec,
            },
        },
    };

    fn context(grid: (u32, u32)) -> FactoryContext {
        FactoryContext {
            device: Default::default(),
            grid_size: grid.into(),
        }
    }

    #[tokio::test]
    async fn test_interleaved_runtime_args() -> Result<(), Box<dyn Error>> {
        let device = SimDeviceBuilder::new((2, 2)).build().await;
        // 9 tiles on 4 cores: 3, 2, 2, 2
        let spec = TensorSpec::new([96, 96], DataType::BFloat16, Layout::Tile);
        let input = device.allocate(&spec)?;
        let output = device.allocate(&spec)?;

        let attributes = CopyAttributes {
            output_type: DataType::BFloat16,
            output_memory: Default::default(),
            backwards: false,
        };
        let args = CopyArgs { input: input.clone() };
        let cached = <InterleavedCopy as ProgramFactory<CopyOperation>>::create(
            &context((2, 2)),
            &attributes,
            &args,
            &output,
        )?;
        let (program, shared) = (&cached.program, &cached.shared);

        let cores = [(0, 0), (0, 1), (1, 0), (1, 1)].map(CoreCoord::from);
        assert_eq!(shared.cores, cores);
        let src = input.address()?;
        let expected = [[src, 3, 0], [src, 2, 3], [src, 2, 5], [src, 2, 7]];
        for (core, args) in cores.into_iter().zip(expected) {
            assert_eq!(program.runtime_args(shared.reader, core)?, &args);
        }
        assert_eq!(program.runtime_args(shared.writer, cores[3])?[0], output.address()?);

        // no conversion: no compute kernel, writer drains the input buffer
        assert_eq!(program.circular_buffers().len(), 1);
        assert!(program.kernels().iter().all(|kernel| kernel.kind != KernelKind::Compute));
        assert_eq!(program.kernel(shared.writer)?.compile_args[0], CB_INPUT as u32);
        Ok(())
    }

    #[tokio::test]
    async fn test_interleaved_backwards_sticks() -> Result<(), Box<dyn Error>> {
        let device = SimDeviceBuilder::new((1, 2)).build().await;
        let spec = TensorSpec::new([5, 16], DataType::Float32, Layout::RowMajor);
        let input = device.allocate(&spec)?;
        let output = device.allocate(&spec)?;

        let attributes = CopyAttributes {
            output_type: DataType::Float32,
            output_memory: Default::default(),
            backwards: true,
        };
        let args = CopyArgs { input: input.clone() };
        let cached = <InterleavedCopy as ProgramFactory<CopyOperation>>::create(
            &context((1, 2)),
            &attributes,
            &args,
            &output,
        )?;
        let (program, shared) = (&cached.program, &cached.shared);

        let src = input.address()?;
        assert_eq!(program.runtime_args(shared.reader, shared.cores[0])?, &[src, 64, 3, 4]);
        assert_eq!(program.runtime_args(shared.reader, shared.cores[1])?, &[src, 64, 2, 1]);
        assert_eq!(program.kernel(shared.reader)?.defines["BACKWARDS"], "1");
        Ok(())
    }

    #[tokio::test]
    async fn test_copy_backwards() -> Result<(), Box<dyn Error>> {
        let device = SimDeviceBuilder::new((2, 2)).build().await;
        let mut dispatcher = DispatcherBuilder::new(device.clone()).build();

        // 9 tiles on 4 cores, walked from the last tile down
        let spec = TensorSpec::new([96, 96], DataType::BFloat16, Layout::Tile);
        let input = device.allocate(&spec)?;
        let output = dispatcher.copy_backwards(&input)?;
        assert_eq!(output.spec(), input.spec());
        assert_ne!(output.address()?, input.address()?);

        let launches = device.finish().await?;
        let program = &launches[0].program;
        let (reader, writer) = (&program.kernels()[0], &program.kernels()[1]);
        assert_eq!(reader.kind, KernelKind::Reader);
        assert_eq!(writer.kind, KernelKind::Writer);
        assert_eq!(reader.defines["BACKWARDS"], "1");
        assert_eq!(writer.defines["BACKWARDS"], "1");

        let (src, dst) = (input.address()?, output.address()?);
        let expected = [((0, 0), 3, 8), ((0, 1), 2, 5), ((1, 0), 2, 3), ((1, 1), 2, 1)];
        for (core, units, start) in expected {
            let core = CoreCoord::from(core);
            assert_eq!(reader.runtime_args[&core], [src, units, start]);
            assert_eq!(writer.runtime_args[&core], [dst, units, start]);
        }
        Ok(())
    }

    #[test]
    fn test_too_many_pages() {
        // described but never allocated: one stick more than a kernel argument can count
        let spec = TensorSpec::new([1usize << 32, 16], DataType::Float32, Layout::RowMajor);
        let tensor = |address| {
            let buffer = Buffer {
                device: DeviceId(0),
                address,
                size: spec.size(),
                buffer_type: BufferType::Dram,
            };
            Tensor::new(spec.clone(), Storage::Device(buffer))
        };
        let attributes = CopyAttributes {
            output_type: DataType::Float32,
            output_memory: Default::default(),
            backwards: false,
        };
        let args = CopyArgs { input: tensor(0x1000) };
        let result = <InterleavedCopy as ProgramFactory<CopyOperation>>::create(
            &context((8, 8)),
            &attributes,
            &args,
            &tensor(0x2000),
        );
        assert!(matches!(
            result,
            Err(OpError::Validation(message)) if message.contains("4294967296")
        ));
    }

    #[tokio::test]
    async fn test_typecast_program() -> Result<(), Box<dyn Error>> {
        let device = SimDeviceBuilder::new((4, 4)).build().await;
        let mut dispatcher = DispatcherBuilder::new(device.clone()).build();

        // 20 tiles on 16 cores: 4 cores take 2, 12 take 1
        let spec = TensorSpec::new([2, 64, 160], DataType::Float32, Layout::Tile);
        let input = device.allocate(&spec)?;
        let output = dispatcher.typecast(&input, DataType::BFloat8B)?;
        assert_eq!(output.data_type(), DataType::BFloat8B);
        assert_eq!(output.buffer()?.size, 20 * 1088);

        let launches = device.finish().await?;
        let program = &launches[0].program;
        let computes = program
            .kernels()
            .iter()
            .filter(|kernel| kernel.kind == KernelKind::Compute)
            .map(|kernel| (kernel.cores.num_cores(), kernel.compile_args[0]))
            .collect::<Vec<_>>();
        assert_eq!(computes, vec![(4, 2), (12, 1)]);
        assert_eq!(program.circular_buffers()[1].index, CB_OUTPUT);
        assert_eq!(program.circular_buffers()[1].page_size, 1088);
        Ok(())
    }

    #[tokio::test]
    async fn test_sharded_copy() -> Result<(), Box<dyn Error>> {
        let device = SimDeviceBuilder::new((4, 4)).build().await;
        let shard = ShardSpec {
            grid: CoreRange::new((0, 0), (1, 1))?.into(),
            shape: [64, 64],
            orientation: ShardOrientation::RowMajor,
        };
        let memory = MemoryConfig::sharded(TensorMemoryLayout::HeightSharded, shard);
        let spec = TensorSpec::new([256, 64], DataType::BFloat16, Layout::Tile);
        let spec = spec.with_memory(memory.clone());
        let input = device.allocate(&spec)?;
        let output = device.allocate(&spec)?;
        assert_eq!(input.buffer()?.buffer_type, BufferType::L1);

        let attributes = CopyAttributes {
            output_type: DataType::BFloat16,
            output_memory: memory,
            backwards: false,
        };
        let args = CopyArgs { input: input.clone() };
        let mut cached = <ShardedCopy as ProgramFactory<CopyOperation>>::create(
            &context((4, 4)),
            &attributes,
            &args,
            &output,
        )?;
        let cbs = cached.program.circular_buffers();
        assert_eq!(cbs[0].address, Some(input.address()?));
        assert_eq!(cbs[1].address, Some(output.address()?));
        assert_eq!(cbs[0].total_size, 4 * 2048);
        assert_eq!(cached.program.cores().num_cores(), 4);

        let moved = device.allocate(&spec)?;
        let args = CopyArgs { input: moved.clone() };
        <ShardedCopy as ProgramFactory<CopyOperation>>::override_runtime_arguments(
            crate::loom::cache::CachedProgramMut {
                program: &mut cached.program,
                shared: &mut cached.shared,
            },
            &attributes,
            &args,
            &output,
        )?;
        assert_eq!(cached.program.circular_buffers()[0].address, Some(moved.address()?));
        Ok(())
    }
}
