//! Pipeline stage assignment.
//!
//! Pipeline parallelism splits the model into stages, each on a different GPU.
//! Activations flow through the pipeline: GPU0 -> GPU1 -> ... -> GPUn.
//!
//! For encoder-decoder models the stages are further split into an encoder
//! part and a decoder part:
//!
//! ```text
//!         encoder stages              decoder stages
//! ┌───────────┐   ┌───────────┐   ┌───────────┐   ┌───────────┐
//! │ enc 0..3  │-->│ enc 3..6  │-->│ dec 0..3  │-->│ dec 3..6  │
//! └───────────┘   └───────────┘   └───────────┘   └───────────┘
//!    stage 0         stage 1         stage 2         stage 3
//!                                    ^ decoder_starting_stage
//! ```
//!
//! Block indices in a stage range are relative to the sub-model (encoder or
//! decoder) the stage belongs to.

use std::ops::Range;

use super::error::ConfigurationError;

/// Where the current process sits in the pipeline.
pub trait StageManager {
    /// Index of this stage (0..num_stages).
    fn stage(&self) -> usize;

    fn num_stages(&self) -> usize;

    fn is_first_stage(&self) -> bool {
        self.stage() == 0
    }

    fn is_last_stage(&self) -> bool {
        self.stage() + 1 == self.num_stages()
    }
}

/// Pipeline stage configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineStageConfig {
    /// Index of this stage (0..num_stages)
    pub stage_id: usize,
    /// Total number of pipeline stages
    pub num_stages: usize,
    /// First layer index for this stage
    pub first_layer: usize,
    /// Number of layers in this stage
    pub num_layers: usize,
    /// Whether this is the first stage (receives input)
    pub is_first: bool,
    /// Whether this is the last stage (produces output)
    pub is_last: bool,
}

impl PipelineStageConfig {
    /// Create configuration for a pipeline stage over a single layer stack.
    pub fn new(
        stage_id: usize,
        num_stages: usize,
        total_layers: usize,
    ) -> Result<Self, ConfigurationError> {
        check_stage(stage_id, num_stages)?;
        if total_layers < num_stages {
            return Err(ConfigurationError::InvalidStagePlan {
                num_encoder_layers: total_layers,
                num_decoder_layers: 0,
                num_stages,
            });
        }

        let layers = distribute_layers(total_layers, num_stages);
        let range = stage_range(&layers, stage_id);
        Self::with_layers(stage_id, num_stages, range)
    }

    /// Configuration with an explicit block range.
    pub fn with_layers(
        stage_id: usize,
        num_stages: usize,
        layers: Range<usize>,
    ) -> Result<Self, ConfigurationError> {
        check_stage(stage_id, num_stages)?;
        Ok(Self {
            stage_id,
            num_stages,
            first_layer: layers.start,
            num_layers: layers.len(),
            is_first: stage_id == 0,
            is_last: stage_id == num_stages - 1,
        })
    }

    /// Get layer indices for this stage.
    pub fn layer_range(&self) -> Range<usize> {
        self.first_layer..self.first_layer + self.num_layers
    }
}

impl StageManager for PipelineStageConfig {
    fn stage(&self) -> usize {
        self.stage_id
    }

    fn num_stages(&self) -> usize {
        self.num_stages
    }

    fn is_first_stage(&self) -> bool {
        self.is_first
    }

    fn is_last_stage(&self) -> bool {
        self.is_last
    }
}

/// Distribute layers evenly; earlier stages get the remainder.
pub fn distribute_layers(total_layers: usize, num_stages: usize) -> Vec<usize> {
    if num_stages == 0 {
        return Vec::new();
    }
    let base_layers = total_layers / num_stages;
    let extra = total_layers % num_stages;
    (0..num_stages)
        .map(|stage| base_layers + usize::from(stage < extra))
        .collect()
}

fn check_stage(stage: usize, num_stages: usize) -> Result<(), ConfigurationError> {
    if stage >= num_stages {
        return Err(ConfigurationError::StageOutOfRange { stage, num_stages });
    }
    Ok(())
}

fn stage_range(layers_per_stage: &[usize], stage: usize) -> Range<usize> {
    let start: usize = layers_per_stage[..stage].iter().sum();
    start..start + layers_per_stage[stage]
}

/// Stage layout for an encoder-decoder block stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct T5StagePlan {
    layers_per_stage: Vec<usize>,
    decoder_starting_stage: usize,
}

impl T5StagePlan {
    /// Split the encoder and decoder stacks over `num_stages` stages.
    ///
    /// The number of encoder stages is chosen so that encoder and decoder
    /// stages carry as close to the same number of blocks as possible. With no
    /// decoder layers every stage belongs to the encoder.
    pub fn new(
        num_encoder_layers: usize,
        num_decoder_layers: usize,
        num_stages: usize,
    ) -> Result<Self, ConfigurationError> {
        let invalid = ConfigurationError::InvalidStagePlan {
            num_encoder_layers,
            num_decoder_layers,
            num_stages,
        };

        if num_decoder_layers == 0 {
            if num_stages == 0 || num_encoder_layers < num_stages {
                return Err(invalid);
            }
            return Ok(Self {
                layers_per_stage: distribute_layers(num_encoder_layers, num_stages),
                decoder_starting_stage: num_stages,
            });
        }

        if num_stages < 2 {
            return Err(invalid);
        }

        let imbalance = |encoder_stages: usize| {
            let enc = num_encoder_layers as f64 / encoder_stages as f64;
            let dec = num_decoder_layers as f64 / (num_stages - encoder_stages) as f64;
            (enc - dec).abs()
        };
        let mut encoder_stages = 1;
        for candidate in 2..num_stages {
            if imbalance(candidate) < imbalance(encoder_stages) {
                encoder_stages = candidate;
            }
        }
        let decoder_stages = num_stages - encoder_stages;

        if num_encoder_layers < encoder_stages || num_decoder_layers < decoder_stages {
            return Err(invalid);
        }

        let mut layers_per_stage = distribute_layers(num_encoder_layers, encoder_stages);
        layers_per_stage.extend(distribute_layers(num_decoder_layers, decoder_stages));

        Ok(Self {
            layers_per_stage,
            decoder_starting_stage: encoder_stages,
        })
    }

    pub fn num_stages(&self) -> usize {
        self.layers_per_stage.len()
    }

    /// First stage that runs decoder blocks. Equals `num_stages` for
    /// encoder-only plans.
    pub fn decoder_starting_stage(&self) -> usize {
        self.decoder_starting_stage
    }

    pub fn layers_per_stage(&self) -> &[usize] {
        &self.layers_per_stage
    }

    pub fn is_decoder_stage(&self, stage: usize) -> bool {
        stage >= self.decoder_starting_stage
    }

    /// Block range of `stage`, relative to its sub-model.
    pub fn stage_index(&self, stage: usize) -> Result<Range<usize>, ConfigurationError> {
        check_stage(stage, self.num_stages())?;
        let range = if stage < self.decoder_starting_stage {
            stage_range(&self.layers_per_stage[..self.decoder_starting_stage], stage)
        } else {
            stage_range(
                &self.layers_per_stage[self.decoder_starting_stage..],
                stage - self.decoder_starting_stage,
            )
        };
        Ok(range)
    }

    /// Stage manager for `stage`, carrying its block range.
    pub fn stage_config(&self, stage: usize) -> Result<PipelineStageConfig, ConfigurationError> {
        PipelineStageConfig::with_layers(stage, self.num_stages(), self.stage_index(stage)?)
    }
}
