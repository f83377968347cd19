use mosaic_derive::{ProgramFactories, TensorArgs};

use super::{
    copy::{InterleavedCopy, ShardedCopy},
    matmul::{MatmulBlocking, MultiCoreMatmul, MultiCoreReuseMatmul},
};
use crate::loom::{
    num::DataType,
    ops::{DeviceOperation, OpError, ensure, kernel_arg},
    tensor::{Layout, MemoryConfig, StorageKind, TILE_HEIGHT, TILE_WIDTH, Tensor, TensorSpec},
};

/// Checks that a tensor lives on a single device.
fn ensure_on_device(name: &str, tensor: &Tensor) -> Result<(), OpError> {
    ensure!(
        tensor.storage().kind() == StorageKind::Device,
        "{name} must be on a device, found {} storage",
        tensor.storage().kind()
    );
    Ok(())
}

/// Checks that a tiled tensor covers whole tiles.
fn ensure_tile_aligned(name: &str, tensor: &Tensor) -> Result<(), OpError> {
    let shape = tensor.shape();
    ensure!(
        shape.rows() % TILE_HEIGHT == 0 && shape.width() % TILE_WIDTH == 0,
        "{name} of shape {shape} must be a multiple of {TILE_HEIGHT}x{TILE_WIDTH} tiles"
    );
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CopyAttributes {
    pub output_type: DataType,
    pub output_memory: MemoryConfig,
    /// Walks the units from last to first.
    pub backwards: bool,
}

#[derive(Debug, Clone, Hash, TensorArgs)]
#[tensor_args(crate = "crate")]
pub struct CopyArgs {
    pub input: Tensor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ProgramFactories)]
#[program_factories(op = "CopyOperation", crate = "crate")]
pub enum CopyFactory {
    Interleaved(InterleavedCopy),
    Sharded(ShardedCopy),
}

/// Copies a tensor into new memory, optionally converting its data type.
#[derive(Debug, Clone, Copy)]
pub struct CopyOperation;

impl DeviceOperation for CopyOperation {
    type Attributes = CopyAttributes;
    type TensorArgs = CopyArgs;
    type Output = Tensor;
    type Factory = CopyFactory;

    fn validate_on_program_cache_miss(
        attributes: &Self::Attributes,
        args: &Self::TensorArgs,
    ) -> Result<(), OpError> {
        let input = &args.input;
        ensure_on_device("input", input)?;

        let convert = input.data_type() != attributes.output_type;
        let tiled = input.layout() == Layout::Tile;
        if tiled {
            ensure_tile_aligned("input", input)?;
        }
        ensure!(
            tiled || !convert,
            "converting {} to {} needs tile layout",
            input.data_type(),
            attributes.output_type
        );
        ensure!(
            tiled
                || !input.data_type().is_block_float() && !attributes.output_type.is_block_float(),
            "block float data must be in tile layout"
        );

        let input_sharded = input.memory().is_sharded();
        let output_sharded = attributes.output_memory.is_sharded();
        ensure!(
            input_sharded == output_sharded,
            "copying between interleaved and sharded memory is not supported"
        );
        if input_sharded {
            let (Some(input_shard), Some(output_shard)) =
                (&input.memory().shard, &attributes.output_memory.shard)
            else {
                return Err(OpError::Validation("sharded memory needs a shard spec".into()));
            };
            ensure!(
                input_shard == output_shard,
                "input and output shards must match: {input_shard:?} and {output_shard:?}"
            );
            ensure!(!attributes.backwards, "backwards copy needs interleaved memory");

            let [height, width] = input_shard.shape;
            ensure!(
                !tiled || height % TILE_HEIGHT == 0 && width % TILE_WIDTH == 0,
                "shard shape {height}x{width} must be a multiple of tiles"
            );
            let capacity = input_shard.grid.num_cores() as usize * height * width;
            ensure!(
                capacity >= input.shape().volume(),
                "shards of {height}x{width} on {} cores cannot hold shape {}",
                input_shard.grid.num_cores(),
                input.shape()
            );
        }
        Ok(())
    }

    fn validate_on_program_cache_hit(
        _attributes: &Self::Attributes,
        args: &Self::TensorArgs,
    ) -> Result<(), OpError> {
        ensure_on_device("input", &args.input)
    }

    fn compute_output_specs(
        attributes: &Self::Attributes,
        args: &Self::TensorArgs,
    ) -> Result<TensorSpec, OpError> {
        let input = args.input.spec();
        Ok(TensorSpec {
            shape: input.shape.clone(),
            data_type: attributes.output_type,
            layout: input.layout,
            memory: attributes.output_memory.clone(),
        })
    }

    fn select_program_factory(
        _attributes: &Self::Attributes,
        args: &Self::TensorArgs,
    ) -> CopyFactory {
        match args.input.memory().is_sharded() {
            true => CopyFactory::Sharded(ShardedCopy),
            false => CopyFactory::Interleaved(InterleavedCopy),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MatmulAttributes {
    pub output_type: DataType,
    pub output_memory: MemoryConfig,
    /// Accumulates in 32-bit destination registers, halving the usable subblock size.
    pub fp32_dest_acc: bool,
}

#[derive(Debug, Clone, Hash, TensorArgs)]
#[tensor_args(crate = "crate")]
pub struct MatmulArgs {
    /// Left operand of shape `[.., M, K]`.
    pub a: Tensor,
    /// Right operand of shape `[.., K, N]`, either with the batch of `a` or a batch of one.
    pub b: Tensor,
    /// Row vector of width `N`, padded to one tile row.
    pub bias: Option<Tensor>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ProgramFactories)]
#[program_factories(op = "MatmulOperation", crate = "crate")]
pub enum MatmulFactory {
    MultiCore(MultiCoreMatmul),
    MultiCoreReuse(MultiCoreReuseMatmul),
}

/// Batched matrix multiplication of tiled tensors, with an optional bias.
#[derive(Debug, Clone, Copy)]
pub struct MatmulOperation;

impl DeviceOperation for MatmulOperation {
    type Attributes = MatmulAttributes;
    type TensorArgs = MatmulArgs;
    type Output = Tensor;
    type Factory = MatmulFactory;

    fn validate_on_program_cache_miss(
        attributes: &Self::Attributes,
        args: &Self::TensorArgs,
    ) -> Result<(), OpError> {
        let MatmulArgs { a, b, bias } = args;
        Self::validate_on_program_cache_hit(attributes, args)?;

        let tensors = [("a", a), ("b", b)]
            .into_iter()
            .chain(bias.iter().map(|x| ("bias", x)));
        for (name, tensor) in tensors {
            ensure!(
                tensor.layout() == Layout::Tile,
                "{name} must be in tile layout"
            );
            ensure!(
                !tensor.memory().is_sharded(),
                "{name} must be in interleaved memory"
            );
            ensure_tile_aligned(name, tensor)?;
        }

        let (ka, kb) = (a.shape().width(), b.shape().rows());
        ensure!(ka == kb, "inner dimensions of {} and {} do not match", a.shape(), b.shape());

        let (batch_a, batch_b) = (a.shape().batch(), b.shape().batch());
        ensure!(
            batch_b == 1 || batch_b == batch_a,
            "batch of b ({batch_b}) must be 1 or match the batch of a ({batch_a})"
        );

        // tile counts and their products are passed to kernels
        kernel_arg("tiles of a", a.spec().num_tiles())?;
        kernel_arg("tiles of b", b.spec().num_tiles())?;
        let output_tiles =
            batch_a * (a.shape().rows() / TILE_HEIGHT) * (b.shape().width() / TILE_WIDTH);
        kernel_arg("output tiles", output_tiles)?;

        if let Some(bias) = bias {
            let n = b.shape().width();
            ensure!(
                bias.shape().width() == n && bias.shape().height() == TILE_HEIGHT,
                "bias of shape {} must be one tile row of width {n}",
                bias.shape()
            );
        }
        Ok(())
    }

    fn validate_on_program_cache_hit(
        _attributes: &Self::Attributes,
        args: &Self::TensorArgs,
    ) -> Result<(), OpError> {
        let MatmulArgs { a, b, bias } = args;
        ensure_on_device("a", a)?;
        ensure_on_device("b", b)?;
        if let Some(bias) = bias {
            ensure_on_device("bias", bias)?;
        }
        ensure!(
            a.devices() == b.devices(),
            "a and b must be on the same device"
        );
        Ok(())
    }

    fn compute_output_specs(
        attributes: &Self::Attributes,
        args: &Self::TensorArgs,
    ) -> Result<TensorSpec, OpError> {
        let shape = args.a.shape().with_width(args.b.shape().width());
        Ok(TensorSpec {
            shape,
            data_type: attributes.output_type,
            layout: Layout::Tile,
            memory: attributes.output_memory.clone(),
        })
    }

    fn select_program_factory(
        attributes: &Self::Attributes,
        args: &Self::TensorArgs,
    ) -> MatmulFactory {
        let blocking = MatmulBlocking::new(attributes, args);
        match blocking.per_core_m * blocking.per_core_n > 1 {
            true => MatmulFactory::MultiCoreReuse(MultiCoreReuseMatmul),
            false => MatmulFactory::MultiCore(MultiCoreMatmul),
        }
    }
}
