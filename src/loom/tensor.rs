use std::{
    hash::{Hash, Hasher},
    sync::Arc,
};

use derive_more::{Deref, Display};
use itertools::Itertools;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{device::DeviceId, grid::CoreRangeSet, num::DataType};

pub const TILE_HEIGHT: usize = 32;
pub const TILE_WIDTH: usize = 32;
pub const TILE_HW: usize = TILE_HEIGHT * TILE_WIDTH;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TensorError {
    #[error("tensor has no shard on device {0}")]
    Shard(DeviceId),
    #[error("tensor shards mismatch: {0:?} and {1:?}")]
    Mismatch(Box<TensorSpec>, Box<TensorSpec>),
    #[error("no tensor shards to combine")]
    Empty,
    #[error("unexpected tensor storage: {0}")]
    Storage(StorageKind),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Deref, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display("[{}]", _0.iter().format(", "))]
pub struct Shape(Arc<[usize]>);

impl Shape {
    #[inline]
    pub fn new(dims: impl IntoIterator<Item = usize>) -> Self {
        Self(dims.into_iter().collect())
    }

    /// Total number of elements.
    #[inline]
    pub fn volume(&self) -> usize {
        self.0.iter().product()
    }

    /// Size of the innermost dimension.
    #[inline]
    pub fn width(&self) -> usize {
        self.0.last().copied().unwrap_or(1)
    }

    /// Product of all dimensions but the innermost one.
    #[inline]
    pub fn height(&self) -> usize {
        match self.0.split_last() {
            Some((_, outer)) => outer.iter().product(),
            None => 1,
        }
    }

    /// Size of the second innermost dimension.
    #[inline]
    pub fn rows(&self) -> usize {
        match self.0.len() {
            0 | 1 => 1,
            len => self.0[len - 2],
        }
    }

    /// Product of all dimensions but the two innermost ones.
    #[inline]
    pub fn batch(&self) -> usize {
        self.height() / self.rows().max(1)
    }

    /// Returns the same shape with the innermost dimension replaced.
    pub fn with_width(&self, width: usize) -> Self {
        let mut dims = self.0.to_vec();
        match dims.last_mut() {
            Some(last) => *last = width,
            None => dims.push(width),
        }
        Self::new(dims)
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    #[inline]
    fn from(value: [usize; N]) -> Self {
        Self::new(value)
    }
}

impl From<Vec<usize>> for Shape {
    #[inline]
    fn from(value: Vec<usize>) -> Self {
        Self(value.into())
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Layout {
    #[default]
    RowMajor,
    /// Elements grouped into 32x32 tiles.
    Tile,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum BufferType {
    #[default]
    Dram,
    L1,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum TensorMemoryLayout {
    #[default]
    Interleaved,
    HeightSharded,
    WidthSharded,
    BlockSharded,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ShardOrientation {
    #[default]
    RowMajor,
    ColMajor,
}

/// How a sharded tensor is laid out over cores: one shard of `shape` elements per core of `grid`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ShardSpec {
    pub grid: CoreRangeSet,
    /// Height and width of one shard.
    pub shape: [usize; 2],
    pub orientation: ShardOrientation,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MemoryConfig {
    pub layout: TensorMemoryLayout,
    pub buffer: BufferType,
    pub shard: Option<ShardSpec>,
}

impl MemoryConfig {
    #[inline]
    pub fn interleaved(buffer: BufferType) -> Self {
        Self {
            layout: TensorMemoryLayout::Interleaved,
            buffer,
            shard: None,
        }
    }

    /// Sharded memory always lives in L1.
    #[inline]
    pub fn sharded(layout: TensorMemoryLayout, shard: ShardSpec) -> Self {
        Self {
            layout,
            buffer: BufferType::L1,
            shard: Some(shard),
        }
    }

    #[inline]
    pub fn is_sharded(&self) -> bool {
        self.layout != TensorMemoryLayout::Interleaved
    }
}

/// Everything about a tensor but where it lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TensorSpec {
    pub shape: Shape,
    pub data_type: DataType,
    pub layout: Layout,
    pub memory: MemoryConfig,
}

impl TensorSpec {
    #[inline]
    pub fn new(shape: impl Into<Shape>, data_type: DataType, layout: Layout) -> Self {
        Self {
            shape: shape.into(),
            data_type,
            layout,
            memory: Default::default(),
        }
    }

    #[inline]
    pub fn with_memory(mut self, memory: MemoryConfig) -> Self {
        self.memory = memory;
        self
    }

    /// Number of 32x32 tiles, counting partial tiles at the edges.
    #[inline]
    pub fn num_tiles(&self) -> usize {
        let shape = &self.shape;
        shape.batch() * shape.rows().div_ceil(TILE_HEIGHT) * shape.width().div_ceil(TILE_WIDTH)
    }

    /// Size in bytes of one page: a tile, or a row in row-major layout.
    #[inline]
    pub fn page_size(&self) -> usize {
        match self.layout {
            Layout::Tile => self.data_type.tile_size(),
            Layout::RowMajor => self.shape.width() * self.data_type.element_size(),
        }
    }

    #[inline]
    pub fn num_pages(&self) -> usize {
        match self.layout {
            Layout::Tile => self.num_tiles(),
            Layout::RowMajor => self.shape.height(),
        }
    }

    /// Size in bytes of the tensor's buffer.
    #[inline]
    pub fn size(&self) -> usize {
        self.num_pages() * self.page_size()
    }
}

/// A device allocation backing a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Buffer {
    pub device: DeviceId,
    pub address: u32,
    pub size: usize,
    pub buffer_type: BufferType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum StorageKind {
    Host,
    Device,
    MultiDevice,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub enum Storage {
    #[default]
    Host,
    Device(Buffer),
    /// One buffer per device, in device order.
    MultiDevice(Arc<[Buffer]>),
}

impl Storage {
    #[inline]
    pub fn kind(&self) -> StorageKind {
        match self {
            Storage::Host => StorageKind::Host,
            Storage::Device(_) => StorageKind::Device,
            Storage::MultiDevice(_) => StorageKind::MultiDevice,
        }
    }

    #[inline]
    pub fn buffers(&self) -> &[Buffer] {
        match self {
            Storage::Host => &[],
            Storage::Device(buffer) => std::slice::from_ref(buffer),
            Storage::MultiDevice(buffers) => buffers,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tensor {
    spec: TensorSpec,
    storage: Storage,
}

/// Tensors hash by their spec and storage kind only, never by buffer addresses.
impl Hash for Tensor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.spec.hash(state);
        self.storage.kind().hash(state);
    }
}

impl Tensor {
    #[inline]
    pub fn new(spec: TensorSpec, storage: Storage) -> Self {
        Self { spec, storage }
    }

    #[inline]
    pub fn host(spec: TensorSpec) -> Self {
        Self::new(spec, Storage::Host)
    }

    #[inline]
    pub fn spec(&self) -> &TensorSpec {
        &self.spec
    }

    #[inline]
    pub fn shape(&self) -> &Shape {
        &self.spec.shape
    }

    #[inline]
    pub fn data_type(&self) -> DataType {
        self.spec.data_type
    }

    #[inline]
    pub fn layout(&self) -> Layout {
        self.spec.layout
    }

    #[inline]
    pub fn memory(&self) -> &MemoryConfig {
        &self.spec.memory
    }

    #[inline]
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// The buffer of a single-device tensor.
    #[inline]
    pub fn buffer(&self) -> Result<&Buffer, TensorError> {
        match &self.storage {
            Storage::Device(buffer) => Ok(buffer),
            storage => Err(TensorError::Storage(storage.kind())),
        }
    }

    #[inline]
    pub fn address(&self) -> Result<u32, TensorError> {
        self.buffer().map(|buffer| buffer.address)
    }

    /// Devices holding this tensor, in shard order.
    pub fn devices(&self) -> Vec<DeviceId> {
        self.storage
            .buffers()
            .iter()
            .map(|buffer| buffer.device)
            .collect()
    }

    /// The part of the tensor living on `device`, as a single-device tensor.
    pub fn shard(&self, device: DeviceId) -> Result<Tensor, TensorError> {
        match &self.storage {
            Storage::Host => Err(TensorError::Storage(StorageKind::Host)),
            storage => storage
                .buffers()
                .iter()
                .find(|buffer| buffer.device == device)
                .map(|&buffer| Tensor::new(self.spec.clone(), Storage::Device(buffer)))
                .ok_or(TensorError::Shard(device)),
        }
    }

    /// Combines single-device shards of identical spec into one multi-device tensor.
    pub fn from_shards(shards: impl IntoIterator<Item = Tensor>) -> Result<Tensor, TensorError> {
        let mut shards = shards.into_iter();
        let first = shards.next().ok_or(TensorError::Empty)?;
        let mut buffers = vec![*first.buffer()?];
        for shard in shards {
            if shard.spec != first.spec {
                let (x, y) = (Box::new(first.spec), Box::new(shard.spec));
                return Err(TensorError::Mismatch(x, y));
            }
            buffers.push(*shard.buffer()?);
        }
        let storage = Storage::MultiDevice(buffers.into());
        Ok(Tensor::new(first.spec, storage))
    }
}

#[cfg(test)]
mod tests {
    use std::{error::Error, hash::BuildHasher};

    use rustc_hash::FxBuildHasher;

    use super::{
        Buffer, BufferType, Layout, Shape, Storage, StorageKind, Tensor, TensorError, TensorSpec,
    };
    use crate::loom::{device::DeviceId, num::DataType};

    fn buffer(device: usize, address: u32) -> Buffer {
        Buffer {
            device: DeviceId(device),
            address,
            size: 4096,
            buffer_type: BufferType::Dram,
        }
    }

    #[test]
    fn test_shape() {
        let shape = Shape::from([2, 3, 64, 96]);
        assert_eq!(shape.volume(), 2 * 3 * 64 * 96);
        assert_eq!(shape.width(), 96);
        assert_eq!(shape.rows(), 64);
        assert_eq!(shape.height(), 2 * 3 * 64);
        assert_eq!(shape.batch(), 6);
        assert_eq!(shape.with_width(32), Shape::from([2, 3, 64, 32]));
        assert_eq!(shape.to_string(), "[2, 3, 64, 96]");
    }

    #[test]
    fn test_spec_size() {
        let spec = TensorSpec::new([2, 64, 96], DataType::BFloat16, Layout::Tile);
        assert_eq!(spec.num_tiles(), 2 * 2 * 3);
        assert_eq!(spec.page_size(), 2048);
        assert_eq!(spec.size(), 12 * 2048);

        let spec = TensorSpec::new([4, 10], DataType::Float32, Layout::RowMajor);
        assert_eq!(spec.num_pages(), 4);
        assert_eq!(spec.page_size(), 40);
        assert_eq!(spec.num_tiles(), 1);
    }

    #[test]
    fn test_hash_ignores_address() {
        let spec = TensorSpec::new([32, 32], DataType::Float32, Layout::Tile);
        let x = Tensor::new(spec.clone(), Storage::Device(buffer(0, 0)));
        let y = Tensor::new(spec.clone(), Storage::Device(buffer(0, 8192)));
        let z = Tensor::host(spec);
        assert_ne!(x, y);
        assert_eq!(FxBuildHasher.hash_one(&x), FxBuildHasher.hash_one(&y));
        assert_ne!(FxBuildHasher.hash_one(&x), FxBuildHasher.hash_one(&z));
    }

    #[test]
    fn test_shards() -> Result<(), Box<dyn Error>> {
        let spec = TensorSpec::new([32, 64], DataType::BFloat16, Layout::Tile);
        let shards = [
            Tensor::new(spec.clone(), Storage::Device(buffer(0, 64))),
            Tensor::new(spec.clone(), Storage::Device(buffer(1, 128))),
        ];
        let tensor = Tensor::from_shards(shards.clone())?;
        assert_eq!(tensor.storage().kind(), StorageKind::MultiDevice);
        assert_eq!(tensor.devices(), vec![DeviceId(0), DeviceId(1)]);
        assert_eq!(tensor.shard(DeviceId(1))?, shards[1]);
        assert_eq!(
            tensor.shard(DeviceId(2)),
            Err(TensorError::Shard(DeviceId(2)))
        );
        assert_eq!(
            Tensor::host(spec.clone()).address(),
            Err(TensorError::Storage(StorageKind::Host))
        );
        assert_eq!(Tensor::from_shards([]), Err(TensorError::Empty));

        let other = TensorSpec::new([32, 32], DataType::BFloat16, Layout::Tile);
        let mismatched = [
            Tensor::new(spec, Storage::Device(buffer(0, 64))),
            Tensor::new(other, Storage::Device(buffer(1, 64))),
        ];
        assert!(matches!(
            Tensor::from_shards(mismatched),
            Err(TensorError::Mismatch(_, _))
        ));
        Ok(())
    }
}
