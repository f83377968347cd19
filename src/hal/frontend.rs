use super::ops::{
    CopyArgs, CopyAttributes, CopyOperation, MatmulArgs, MatmulAttributes, MatmulOperation,
};
use crate::loom::{
    dispatch::Launch,
    num::DataType,
    ops::OpError,
    tensor::{MemoryConfig, Tensor},
};

/// Tensor operations on anything that launches device operations.
///
/// Outputs live on the same devices as the inputs: launching through a
/// [`Mesh`](crate::loom::dispatch::Mesh) with multi-device tensors runs the operation once per
/// device.
pub trait TensorOps: Launch {
    /// Copies `input` into new memory of the given configuration.
    fn copy(&mut self, input: &Tensor, memory: MemoryConfig) -> Result<Tensor, OpError> {
        let attributes = CopyAttributes {
            output_type: input.data_type(),
            output_memory: memory,
            backwards: false,
        };
        let args = CopyArgs {
            input: input.clone(),
        };
        self.launch::<CopyOperation>(&attributes, &args)
    }

    /// Copies `input` walking its pages from last to first.
    fn copy_backwards(&mut self, input: &Tensor) -> Result<Tensor, OpError> {
        let attributes = CopyAttributes {
            output_type: input.data_type(),
            output_memory: input.memory().clone(),
            backwards: true,
        };
        let args = CopyArgs {
            input: input.clone(),
        };
        self.launch::<CopyOperation>(&attributes, &args)
    }

    /// Converts `input` to another data type, keeping its memory configuration.
    fn typecast(&mut self, input: &Tensor, data_type: DataType) -> Result<Tensor, OpError> {
        let attributes = CopyAttributes {
            output_type: data_type,
            output_memory: input.memory().clone(),
            backwards: false,
        };
        let args = CopyArgs {
            input: input.clone(),
        };
        self.launch::<CopyOperation>(&attributes, &args)
    }

    #[inline]
    fn matmul(&mut self, a: &Tensor, b: &Tensor) -> Result<Tensor, OpError> {
        self.linear(a, b, None)
    }

    /// Computes `a @ b + bias`. The output takes the data type and memory configuration of `a`.
    fn linear(&mut self, a: &Tensor, b: &Tensor, bias: Option<&Tensor>) -> Result<Tensor, OpError> {
        let attributes = MatmulAttributes {
            output_type: a.data_type(),
            output_memory: a.memory().clone(),
            fp32_dest_acc: false,
        };
        let args = MatmulArgs {
            a: a.clone(),
            b: b.clone(),
            bias: bias.cloned(),
        };
        self.launch::<MatmulOperation>(&attributes, &args)
    }
}

impl<L: Launch> TensorOps for L {}
