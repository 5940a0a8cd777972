use std::cell::RefCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use candle_core::{Device, DeviceLocation, Result, Tensor};

use crate::distributed::{DeviceBinder, GradientCheckpointing};

/// Device binder that remembers every device it was asked to bind.
#[derive(Debug, Default)]
pub struct RecordingBinder {
    bound: RefCell<Vec<DeviceLocation>>,
}

impl RecordingBinder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bound(&self) -> Vec<DeviceLocation> {
        self.bound.borrow().clone()
    }

    pub fn calls(&self) -> usize {
        self.bound.borrow().len()
    }
}

impl DeviceBinder for RecordingBinder {
    fn bind(&self, device: &Device) -> Result<()> {
        self.bound.borrow_mut().push(device.location());
        Ok(())
    }
}

/// Checkpointer that runs the block and counts invocations. Clones share the
/// counter, so keep one clone to inspect after boxing the other into a stack.
#[derive(Debug, Default, Clone)]
pub struct CountingCheckpointer {
    calls: Arc<AtomicUsize>,
}

impl CountingCheckpointer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl GradientCheckpointing for CountingCheckpointer {
    fn checkpoint(
        &self,
        block: &mut dyn FnMut() -> Result<Vec<Tensor>>,
    ) -> Result<Vec<Tensor>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        block()
    }
}
