//! The `loom` module is the host-side backbone for programming a many-core tensor accelerator.
//! It decides how work is spread over the device's grid of cores, builds execution plans for
//! operations, and caches those plans so that repeated launches only patch what changed.
//!
//! ## Key Components
//! 1. **Core Geometry**:
//!    - Coordinates (`CoreCoord`), inclusive rectangles (`CoreRange`) and sets of disjoint
//!      rectangles (`CoreRangeSet`) on the core grid.
//!
//! 2. **Work Distribution**:
//!    - `split_work_to_cores` spreads work units over the grid in raster order, as two groups
//!      of cores whose per-core work differs by one unit.
//!
//! 3. **Execution Plans**:
//!    - A `Program` places kernels and circular buffers on cores with per-core runtime arguments.
//!    - Programs are built by the program factories of a `DeviceOperation`.
//!
//! 4. **Program Cache & Dispatch**:
//!    - Programs are keyed by a structural hash of the operation, its attributes and its tensor
//!      descriptors (`ProgramHash`), never by buffer addresses.
//!    - A `Dispatcher` owns one device's `ProgramCache`. On a hit it patches the cached program's
//!      runtime arguments, on a miss it builds and inserts a new one.
//!    - A `Mesh` launches operations on tensors sharded over several devices.
//!
//! 5. **Devices**:
//!    - Hardware-agnostic interface via the `Device` trait.
//!    - `SimDevice` allocates buffers and records launched programs, with fast (queued) and
//!      slow (inline) dispatch.

pub mod cache;
pub mod device;
pub mod dispatch;
pub mod grid;
pub mod hash;
pub mod num;
pub mod ops;
pub mod platform;
pub mod program;
pub mod split;
pub mod tensor;
