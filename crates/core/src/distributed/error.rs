//! Error types for pipeline-staged execution.

use thiserror::Error;

/// Invalid or missing inputs for a pipeline stage. Always fatal to the call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    /// Both token ids and embeddings were given to the first stage of a stack.
    #[error("you cannot specify both {prefix}input_ids and {prefix}inputs_embeds at the same time")]
    ConflictingInputs { prefix: &'static str },

    /// Neither token ids nor embeddings were given to the first stage of a stack.
    #[error("you have to specify either {prefix}input_ids or {prefix}inputs_embeds")]
    MissingInputs { prefix: &'static str },

    #[error("you have to initialize the model with valid token embeddings")]
    MissingEmbeddings,

    #[error("hidden_states must be provided at stage {stage}: only the first stage of the encoder or decoder builds them from inputs")]
    MissingHiddenStates { stage: usize },

    #[error("non-empty encoder_outputs must be passed in at decoder stage {stage}")]
    MissingEncoderOutputs { stage: usize },

    /// The stack is an encoder but the stage belongs to the decoder, or vice versa.
    #[error("stack (is_decoder = {is_decoder}) is not aligned with stage {stage}, decoder starts at stage {decoder_starting_stage}")]
    StageMismatch {
        is_decoder: bool,
        stage: usize,
        decoder_starting_stage: usize,
    },

    #[error("stage {stage} does not exist in a pipeline of {num_stages} stages")]
    StageOutOfRange { stage: usize, num_stages: usize },

    #[error("stage index {start}..{end} is out of range for a stack of {num_blocks} blocks")]
    InvalidStageIndex {
        start: usize,
        end: usize,
        num_blocks: usize,
    },

    #[error("cannot split {num_encoder_layers} encoder and {num_decoder_layers} decoder layers into {num_stages} stages")]
    InvalidStagePlan {
        num_encoder_layers: usize,
        num_decoder_layers: usize,
        num_stages: usize,
    },
}

/// Errors surfaced by a staged forward call.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// Underlying tensor operation failed; passed through unchanged.
    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
}

impl PipelineError {
    pub fn is_configuration(&self) -> bool {
        matches!(self, PipelineError::Configuration(_))
    }

    pub fn as_configuration(&self) -> Option<&ConfigurationError> {
        match self {
            PipelineError::Configuration(e) => Some(e),
            PipelineError::Tensor(_) => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
