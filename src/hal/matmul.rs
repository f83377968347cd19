//! Program factories of [`MatmulOperation`].

use super::ops::{MatmulArgs, MatmulAttributes, MatmulOperation};
use crate::loom::{
    cache::{CachedProgram, CachedProgramMut},
    grid::{CoreCoord, CoreRangeSet},
    num::DataType,
    ops::{FactoryContext, OpError, ProgramFactory},
    program::{CircularBuffer, Kernel, KernelHandle, KernelKind, Program},
    split::{find_max_block_size, find_max_divisor, split_work_to_cores},
    tensor::{BufferType, TILE_HEIGHT, TILE_WIDTH, Tensor},
};

pub const CB_IN0: u8 = 0;
pub const CB_IN1: u8 = 1;
pub const CB_BIAS: u8 = 3;
pub const CB_OUT: u8 = 16;
/// Partial sums kept in 32-bit precision between inner blocks.
pub const CB_INTERM: u8 = 24;

/// Output subblock shapes `(h, w)` in order of preference, largest area first.
pub const SUBBLOCK_HW_CHOICES: [(u32, u32); 20] = [
    (4, 2),
    (2, 4),
    (8, 1),
    (1, 8),
    (7, 1),
    (1, 7),
    (3, 2),
    (2, 3),
    (6, 1),
    (1, 6),
    (5, 1),
    (1, 5),
    (2, 2),
    (4, 1),
    (1, 4),
    (3, 1),
    (1, 3),
    (2, 1),
    (1, 2),
    (1, 1),
];

/// Destination registers available to one subblock.
const MAX_SUBBLOCK_TILES: u32 = 8;
const MAX_SUBBLOCK_TILES_FP32: u32 = 4;

/// Largest block of output tiles computed at once per core, along each axis.
const MAX_BLOCK_SIZE: u32 = 4;
/// Largest inner dimension block, in tiles.
const MAX_IN0_BLOCK_W: u32 = 8;

#[inline]
fn is_dram(tensor: &Tensor) -> u32 {
    (tensor.memory().buffer == BufferType::Dram) as u32
}

/// Tile counts and block sizes of a matmul.
///
/// The counts fit in `u32` once the operation passed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatmulBlocking {
    pub batch: u32,
    pub mt: u32,
    pub kt: u32,
    pub nt: u32,
    /// The right operand is shared by every batch of the left one.
    pub bcast_b: bool,
    pub in0_block_w: u32,
    pub per_core_m: u32,
    pub per_core_n: u32,
    pub out_subblock_h: u32,
    pub out_subblock_w: u32,
}

impl MatmulBlocking {
    pub fn new(attributes: &MatmulAttributes, args: &MatmulArgs) -> Self {
        let (a, b) = (args.a.shape(), args.b.shape());
        let batch = a.batch() as u32;
        let mt = (a.rows() / TILE_HEIGHT) as u32;
        let kt = (a.width() / TILE_WIDTH) as u32;
        let nt = (b.width() / TILE_WIDTH) as u32;

        let in0_block_w = find_max_divisor(kt, MAX_IN0_BLOCK_W);
        let per_core_m = find_max_block_size(mt, MAX_BLOCK_SIZE);
        let per_core_n = find_max_block_size(nt, MAX_BLOCK_SIZE);

        let max_tiles = match attributes.fp32_dest_acc {
            true => MAX_SUBBLOCK_TILES_FP32,
            false => MAX_SUBBLOCK_TILES,
        };
        let (out_subblock_h, out_subblock_w) = SUBBLOCK_HW_CHOICES
            .into_iter()
            .find(|&(h, w)| h * w <= max_tiles && per_core_m % h == 0 && per_core_n % w == 0)
            .unwrap_or((1, 1));

        Self {
            batch,
            mt,
            kt,
            nt,
            bcast_b: b.batch() == 1,
            in0_block_w,
            per_core_m,
            per_core_n,
            out_subblock_h,
            out_subblock_w,
        }
    }

    /// Number of `per_core_m x per_core_n` output blocks.
    #[inline]
    pub fn num_blocks(&self) -> u32 {
        self.batch * (self.mt / self.per_core_m) * (self.nt / self.per_core_n)
    }
}

/// State shared by both matmul factories: the reader takes `[a, b, bias?, ..]`,
/// the writer takes `[output, ..]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatmulShared {
    pub reader: KernelHandle,
    pub writer: KernelHandle,
    pub cores: Vec<CoreCoord>,
}

/// Leading reader arguments: operand addresses.
fn reader_addresses(args: &MatmulArgs) -> Result<Vec<u32>, OpError> {
    let mut addresses = vec![args.a.address()?, args.b.address()?];
    if let Some(bias) = &args.bias {
        addresses.push(bias.address()?);
    }
    Ok(addresses)
}

fn patch_addresses(
    cached: CachedProgramMut<'_, MatmulShared>,
    args: &MatmulArgs,
    output: &Tensor,
) -> Result<(), OpError> {
    let CachedProgramMut { program, shared } = cached;
    let addresses = reader_addresses(args)?;
    let dst = output.address()?;
    for &core in &shared.cores {
        let reader_args = program.runtime_args_mut(shared.reader, core)?;
        reader_args[..addresses.len()].copy_from_slice(&addresses);
        program.runtime_args_mut(shared.writer, core)?[0] = dst;
    }
    Ok(())
}

fn create_bias_buffer(
    program: &mut Program,
    cores: &CoreRangeSet,
    bias: &Tensor,
    num_tiles: usize,
) -> Result<(), OpError> {
    let data_type = bias.data_type();
    program.create_circular_buffer(CircularBuffer::new(
        cores.clone(),
        CB_BIAS,
        data_type,
        data_type.tile_size(),
        num_tiles,
    ))?;
    Ok(())
}

/// One output tile per unit of work, spread column by column over the grid.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MultiCoreMatmul;

impl ProgramFactory<MatmulOperation> for MultiCoreMatmul {
    type Shared = MatmulShared;

    fn create(
        context: &FactoryContext,
        attributes: &MatmulAttributes,
        args: &MatmulArgs,
        output: &Tensor,
    ) -> Result<CachedProgram<Self::Shared>, OpError> {
        let MatmulArgs { a, b, bias } = args;
        let blocking = MatmulBlocking::new(attributes, args);
        let MatmulBlocking {
            batch, mt, kt, nt, ..
        } = blocking;

        let num_output_tiles = batch * mt * nt;
        let split = split_work_to_cores(context.grid_size, num_output_tiles, false)?;
        let cores = split.all_cores.clone();

        let mut program = Program::new();
        for (index, tensor) in [(CB_IN0, a), (CB_IN1, b), (CB_OUT, output)] {
            let data_type = tensor.data_type();
            program.create_circular_buffer(CircularBuffer::new(
                cores.clone(),
                index,
                data_type,
                data_type.tile_size(),
                2,
            ))?;
        }
        if let Some(bias) = bias {
            create_bias_buffer(&mut program, &cores, bias, 2)?;
        }

        let reader = program.create_kernel(
            Kernel::new(
                "kernels/dataflow/reader_bmm_tile_layout.cpp",
                KernelKind::Reader,
                cores.clone(),
            )
            .with_compile_args([is_dram(a), is_dram(b)]),
        );
        let writer = program.create_kernel(
            Kernel::new(
                "kernels/dataflow/writer_unary_interleaved_start_id.cpp",
                KernelKind::Writer,
                cores.clone(),
            )
            .with_compile_args([CB_OUT as u32, is_dram(output)]),
        );

        let groups = [
            (&split.group_1, split.units_per_core_group_1),
            (&split.group_2, split.units_per_core_group_2),
        ];
        for (group, units) in groups.into_iter().filter(|(group, _)| !group.is_empty()) {
            let mut kernel =
                Kernel::new("kernels/compute/bmm.cpp", KernelKind::Compute, group.clone())
                    .with_compile_args([1, 1, kt, units]);
            if bias.is_some() {
                kernel = kernel.with_define("FUSE_BIAS", 1);
            }
            if attributes.fp32_dest_acc {
                kernel = kernel.with_define("FP32_DEST_ACC_EN", 1);
            }
            program.create_kernel(kernel);
        }

        let addresses = reader_addresses(args)?;
        let dst = output.address()?;
        let mut start_id = 0;
        let mut shared_cores = Vec::with_capacity(split.target_num_cores as usize);
        for (core, units) in split.cores() {
            let reader_args = addresses.iter().copied().chain([
                mt,
                kt,
                nt,
                mt * kt,
                kt * nt,
                blocking.bcast_b as u32,
                start_id,
                units,
                mt * nt,
            ]);
            program.set_runtime_args(reader, core, reader_args)?;
            program.set_runtime_args(writer, core, [dst, units, start_id])?;
            start_id += units;
            shared_cores.push(core);
        }

        let shared = MatmulShared {
            reader,
            writer,
            cores: shared_cores,
        };
        Ok(CachedProgram::new(program, shared))
    }

    fn override_runtime_arguments(
        cached: CachedProgramMut<'_, Self::Shared>,
        _attributes: &MatmulAttributes,
        args: &MatmulArgs,
        output: &Tensor,
    ) -> Result<(), OpError> {
        patch_addresses(cached, args, output)
    }
}

/// Output blocks of `per_core_m x per_core_n` tiles, reusing each input block across a whole
/// output block. Blocks are spread row by row over the grid.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MultiCoreReuseMatmul;

impl ProgramFactory<MatmulOperation> for MultiCoreReuseMatmul {
    type Shared = MatmulShared;

    fn create(
        context: &FactoryContext,
        attributes: &MatmulAttributes,
        args: &MatmulArgs,
        output: &Tensor,
    ) -> Result<CachedProgram<Self::Shared>, OpError> {
        let MatmulArgs { a, b, bias } = args;
        let blocking = MatmulBlocking::new(attributes, args);
        let MatmulBlocking {
            mt,
            kt,
            nt,
            in0_block_w,
            per_core_m,
            per_core_n,
            out_subblock_h,
            out_subblock_w,
            ..
        } = blocking;

        let split = split_work_to_cores(context.grid_size, blocking.num_blocks(), true)?;
        let cores = split.all_cores.clone();

        let in0_block_tiles = per_core_m * in0_block_w;
        let in1_block_tiles = per_core_n * in0_block_w;
        let out_block_tiles = per_core_m * per_core_n;

        let mut program = Program::new();
        let buffers = [
            (CB_IN0, a.data_type(), 2 * in0_block_tiles),
            (CB_IN1, b.data_type(), 2 * in1_block_tiles),
            (CB_OUT, output.data_type(), out_block_tiles),
        ];
        for (index, data_type, num_tiles) in buffers {
            program.create_circular_buffer(CircularBuffer::new(
                cores.clone(),
                index,
                data_type,
                data_type.tile_size(),
                num_tiles as usize,
            ))?;
        }
        let interm = attributes.fp32_dest_acc && output.data_type() != DataType::Float32;
        if interm {
            program.create_circular_buffer(CircularBuffer::new(
                cores.clone(),
                CB_INTERM,
                DataType::Float32,
                DataType::Float32.tile_size(),
                out_block_tiles as usize,
            ))?;
        }
        if let Some(bias) = bias {
            create_bias_buffer(&mut program, &cores, bias, per_core_n as usize)?;
        }

        let reader = program.create_kernel(
            Kernel::new(
                "kernels/dataflow/reader_bmm_tile_layout_blocked.cpp",
                KernelKind::Reader,
                cores.clone(),
            )
            .with_compile_args([is_dram(a), is_dram(b)]),
        );
        let writer = program.create_kernel(
            Kernel::new(
                "kernels/dataflow/writer_bmm_tile_layout_blocked.cpp",
                KernelKind::Writer,
                cores.clone(),
            )
            .with_compile_args([CB_OUT as u32, is_dram(output)]),
        );

        let groups = [
            (&split.group_1, split.units_per_core_group_1),
            (&split.group_2, split.units_per_core_group_2),
        ];
        for (group, num_blocks) in groups.into_iter().filter(|(group, _)| !group.is_empty()) {
            let source = "kernels/compute/bmm_large_block.cpp";
            let mut kernel = Kernel::new(source, KernelKind::Compute, group.clone())
                .with_compile_args([
                    in0_block_w,
                    per_core_m / out_subblock_h,
                    in0_block_tiles,
                    out_subblock_h * in0_block_w,
                    per_core_n / out_subblock_w,
                    in1_block_tiles,
                    per_core_n,
                    kt / in0_block_w,
                    out_subblock_h,
                    out_subblock_w,
                    out_subblock_h * out_subblock_w,
                    num_blocks,
                ]);
            if bias.is_some() {
                kernel = kernel.with_define("FUSE_BIAS", 1);
            }
            if attributes.fp32_dest_acc {
                kernel = kernel.with_define("FP32_DEST_ACC_EN", 1);
            }
            if interm {
                kernel = kernel.with_define("PACKER_L1_ACC", 1);
            }
            program.create_kernel(kernel);
        }

        let addresses = reader_addresses(args)?;
        let dst = output.address()?;
        let mut start_block = 0;
        let mut shared_cores = Vec::with_capacity(split.target_num_cores as usize);
        for (core, num_blocks) in split.cores() {
            let reader_args = addresses.iter().copied().chain([
                start_block,
                num_blocks,
                in0_block_w,
                per_core_m,
                per_core_n,
                kt / in0_block_w,
                mt,
                kt,
                nt,
                blocking.bcast_b as u32,
            ]);
            let writer_args = [
                dst,
                start_block,
                num_blocks,
                per_core_m,
                per_core_n,
                out_subblock_h,
                out_subblock_w,
                mt,
                nt,
            ];
            program.set_runtime_args(reader, core, reader_args)?;
            program.set_runtime_args(writer, core, writer_args)?;
            start_block += num_blocks;
            shared_cores.push(core);
        }

        let shared = MatmulShared {
            reader,
            writer,
            cores: shared_cores,
        };
        Ok(CachedProgram::new(program, shared))
    }

    fn override_runtime_arguments(
        cached: CachedProgramMut<'_, Self::Shared>,
        _attributes: &MatmulAttributes,
        args: &MatmulArgs,
        output: &Tensor,
    ) -> Result<(), OpError> {
        patch_addresses(cached, args, output)
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::{CB_BIAS, CB_INTERM, MatmulBlocking};
    use crate::{
        hal::{
            frontend::TensorOps,
            ops::{MatmulArgs, MatmulAttributes, MatmulFactory, MatmulOperation},
        },
        loom::{
            device::{Device, SimDevice, SimDeviceBuilder},
            dispatch::DispatcherBuilder,
            grid::CoreCoord,
            num::DataType,
            ops::{DeviceOperation, OpError},
            program::KernelKind,
            tensor::{Layout, Tensor, TensorSpec},
        },
    };

    fn attributes(fp32_dest_acc: bool) -> MatmulAttributes {
        MatmulAttributes {
            output_type: DataType::BFloat16,
            output_memory: Default::default(),
            fp32_dest_acc,
        }
    }

    fn tiled(device: &SimDevice, shape: &[usize]) -> Result<Tensor, Box<dyn Error>> {
        let spec = TensorSpec::new(shape.to_vec(), DataType::BFloat16, Layout::Tile);
        Ok(device.allocate(&spec)?)
    }

    #[tokio::test]
    async fn test_blocking() -> Result<(), Box<dyn Error>> {
        let device = SimDeviceBuilder::new((2, 2)).build().await;
        let args = MatmulArgs {
            a: tiled(&device, &[1, 64, 256])?,
            b: tiled(&device, &[256, 128])?,
            bias: None,
        };

        let blocking = MatmulBlocking::new(&attributes(false), &args);
        assert_eq!((blocking.mt, blocking.kt, blocking.nt), (2, 8, 4));
        assert_eq!(blocking.in0_block_w, 8);
        assert_eq!((blocking.per_core_m, blocking.per_core_n), (2, 4));
        assert_eq!((blocking.out_subblock_h, blocking.out_subblock_w), (2, 4));
        assert!(blocking.bcast_b);

        // fp32 accumulation halves the destination registers
        let blocking = MatmulBlocking::new(&attributes(true), &args);
        assert_eq!((blocking.out_subblock_h, blocking.out_subblock_w), (2, 2));

        // 5 and 7 are never picked for the inner block
        let args = MatmulArgs {
            a: tiled(&device, &[32, 320])?,
            b: tiled(&device, &[320, 32])?,
            bias: None,
        };
        let blocking = MatmulBlocking::new(&attributes(false), &args);
        assert_eq!(blocking.in0_block_w, 2);
        assert_eq!(blocking.num_blocks(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_select_factory() -> Result<(), Box<dyn Error>> {
        let device = SimDeviceBuilder::new((2, 2)).build().await;
        let single = MatmulArgs {
            a: tiled(&device, &[3, 32, 64])?,
            b: tiled(&device, &[64, 32])?,
            bias: None,
        };
        let blocked = MatmulArgs {
            a: tiled(&device, &[64, 64])?,
            b: tiled(&device, &[64, 64])?,
            bias: None,
        };
        assert!(matches!(
            MatmulOperation::select_program_factory(&attributes(false), &single),
            MatmulFactory::MultiCore(_)
        ));
        assert!(matches!(
            MatmulOperation::select_program_factory(&attributes(false), &blocked),
            MatmulFactory::MultiCoreReuse(_)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_validation() -> Result<(), Box<dyn Error>> {
        let device = SimDeviceBuilder::new((2, 2)).build().await;
        let mut dispatcher = DispatcherBuilder::new(device.clone()).build();

        let a = tiled(&device, &[64, 64])?;
        let b = tiled(&device, &[96, 64])?;
        assert!(dispatcher.matmul(&a, &b).is_err());

        let spec = TensorSpec::new([64, 64], DataType::BFloat16, Layout::RowMajor);
        let b = device.allocate(&spec)?;
        assert!(dispatcher.matmul(&a, &b).is_err());

        let b = Tensor::host(TensorSpec::new([64, 64], DataType::BFloat16, Layout::Tile));
        assert!(dispatcher.matmul(&a, &b).is_err());

        // the batch of b is either one or the batch of a
        let a = tiled(&device, &[2, 64, 64])?;
        let b = tiled(&device, &[3, 64, 64])?;
        assert!(dispatcher.matmul(&a, &b).is_err());

        let b = tiled(&device, &[2, 64, 64])?;
        let bias = tiled(&device, &[32, 96])?;
        assert!(dispatcher.linear(&a, &b, Some(&bias)).is_err());

        // 2^17 x 2^16 output tiles cannot be counted by a kernel
        let a = tiled(&device, &[32 << 17, 32])?;
        let b = tiled(&device, &[32, 32 << 16])?;
        assert!(matches!(
            dispatcher.matmul(&a, &b),
            Err(OpError::Validation(message)) if message.starts_with("output tiles")
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_multi_core_program() -> Result<(), Box<dyn Error>> {
        let device = SimDeviceBuilder::new((2, 2)).build().await;
        let mut dispatcher = DispatcherBuilder::new(device.clone()).build();

        // 3 batches of a single output tile: one tile on each of 3 cores
        let a = tiled(&device, &[3, 32, 64])?;
        let b = tiled(&device, &[64, 32])?;
        let output = dispatcher.matmul(&a, &b)?;
        assert_eq!(output.shape().to_vec(), vec![3, 32, 32]);

        let launches = device.finish().await?;
        let program = &launches[0].program;
        let reader = &program.kernels()[0];
        assert_eq!(reader.kind, KernelKind::Reader);
        assert_eq!(reader.cores.num_cores(), 3);

        let (a, b) = (a.address()?, b.address()?);
        let args = &reader.runtime_args[&CoreCoord::new(1, 0)];
        assert_eq!(args, &[a, b, 1, 2, 1, 2, 2, 1, 2, 1, 1]);

        let compute = &program.kernels()[2];
        assert_eq!(compute.compile_args, vec![1, 1, 2, 1]);
        Ok(())
    }

    #[tokio::test]
    async fn test_reuse_program() -> Result<(), Box<dyn Error>> {
        let device = SimDeviceBuilder::new((2, 2)).build().await;
        let mut dispatcher = DispatcherBuilder::new(device.clone()).build();

        let a = tiled(&device, &[2, 128, 64])?;
        let b = tiled(&device, &[64, 256])?;
        let bias = tiled(&device, &[32, 256])?;
        let output = dispatcher.linear(&a, &b, Some(&bias))?;
        assert_eq!(output.shape().to_vec(), vec![2, 128, 256]);

        let launches = device.finish().await?;
        let program = &launches[0].program;
        assert!(program.circular_buffers().iter().any(|cb| cb.index == CB_BIAS));
        assert!(program.circular_buffers().iter().all(|cb| cb.index != CB_INTERM));

        // 4 blocks of 4x4 tiles, one per core in row-major order
        let reader = &program.kernels()[0];
        let args = &reader.runtime_args[&CoreCoord::new(1, 0)];
        let addresses = [a.address()?, b.address()?, bias.address()?];
        assert_eq!(&args[..3], &addresses);
        assert_eq!(&args[3..5], &[1, 1]);

        let compute = &program.kernels()[2];
        assert_eq!(compute.kind, KernelKind::Compute);
        assert_eq!(compute.compile_args, vec![2, 1, 8, 8, 2, 8, 4, 1, 4, 2, 8, 1]);
        assert_eq!(compute.defines["FUSE_BIAS"], "1");
        Ok(())
    }
}
