pub mod t5;
pub mod t5_pipeline;

pub use t5::{T5EncoderModel, T5ForConditionalGeneration, T5Model, T5Stack};
pub use t5_pipeline::{
    cross_entropy_ignore_index, BaseModelOutput, EncoderInputs, FeatureRequest, Seq2SeqInputs,
    Seq2SeqLMOutput, Seq2SeqModelOutput, StackInputs, StageBundle, StageContext, StageOutput,
    IGNORE_INDEX,
};
