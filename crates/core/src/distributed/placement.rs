//! Device placement and activation checkpointing hooks for stage execution.

use candle_core::{Device, Result, Tensor};

/// Selects the active compute device before a block runs.
///
/// Stages of one pipeline may live on different accelerators, so the binder is
/// invoked immediately before every block with the device holding the block's
/// input activation.
pub trait DeviceBinder {
    fn bind(&self, device: &Device) -> Result<()>;
}

/// Binder for backends where the device travels with each tensor.
///
/// candle has no process-wide "current device", so binding only records the
/// placement.
#[derive(Debug, Default, Clone, Copy)]
pub struct CurrentDeviceBinder;

impl DeviceBinder for CurrentDeviceBinder {
    fn bind(&self, device: &Device) -> Result<()> {
        tracing::trace!(device = ?device.location(), "bind stage device");
        Ok(())
    }
}

/// Runs a block under activation checkpointing.
///
/// The block closure takes the restricted positional inputs only; caching is
/// never part of a checkpointed call.
pub trait GradientCheckpointing {
    fn checkpoint(
        &self,
        block: &mut dyn FnMut() -> Result<Vec<Tensor>>,
    ) -> Result<Vec<Tensor>>;
}

/// Checkpointing without an autograd engine: the block is executed directly.
/// Recomputation during a backward pass is the engine's responsibility.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecomputeCheckpoint;

impl GradientCheckpointing for RecomputeCheckpoint {
    fn checkpoint(
        &self,
        block: &mut dyn FnMut() -> Result<Vec<Tensor>>,
    ) -> Result<Vec<Tensor>> {
        block()
    }
}
