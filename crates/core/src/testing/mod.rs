//! Shared test utilities for stagesim-core.
//!
//! This module provides tiny T5 configurations and mock pipeline
//! collaborators for unit and integration tests.

mod mocks;
mod tiny_config;

pub use mocks::{CountingCheckpointer, RecordingBinder};
pub use tiny_config::{tiny_t5_config, tiny_t5_single_block_config, tiny_t5_standard_config};
