//! Pipeline-parallel stage execution support.
//!
//! This module provides the collaborators a staged forward call needs:
//! - [`StageManager`] - which stage this process runs and how many exist
//! - [`T5StagePlan`] - encoder/decoder split of the block stacks
//! - [`DeviceBinder`] - device selection before each block
//! - [`GradientCheckpointing`] - activation checkpointing hook
//! - [`Diagnostics`] - advisories for features pipeline mode switches off
//!
//! # Usage
//!
//! ```ignore
//! use stagesim_core::distributed::{StageManager, T5StagePlan};
//!
//! let plan = T5StagePlan::new(6, 6, 4)?;
//! assert_eq!(plan.decoder_starting_stage(), 2);
//! let stage = plan.stage_config(3)?;
//! assert!(stage.is_last_stage());
//! ```

mod diagnostics;
mod error;
mod pipeline;
mod placement;

pub use diagnostics::{Advisory, Diagnostics};
pub use error::{ConfigurationError, PipelineError, Result};
pub use pipeline::{distribute_layers, PipelineStageConfig, StageManager, T5StagePlan};
pub use placement::{
    CurrentDeviceBinder, DeviceBinder, GradientCheckpointing, RecomputeCheckpoint,
};
