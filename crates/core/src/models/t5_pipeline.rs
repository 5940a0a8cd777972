//! Pipeline-parallel stage forwards for T5.
//!
//! Every process runs one contiguous block range of either the encoder or the
//! decoder. Stages hand a [`StageBundle`] to their successor:
//!
//! ```text
//! stage 0 (enc first)   ids -> embed -> blocks            -> {hidden, biases}
//! stage k (enc last)    {hidden, biases} -> blocks -> norm -> {encoder_outputs}
//! stage d (dec first)   dec ids + encoder_outputs -> blocks -> {hidden, biases, encoder_outputs}
//! stage n-1 (dec last)  {hidden, biases, encoder_outputs} -> blocks -> norm -> output
//! ```
//!
//! Incremental decoding, attention collection and hidden-state collection are
//! not available in pipeline mode; requests for them are switched off and
//! recorded in [`Diagnostics`].

use std::collections::HashMap;
use std::ops::Range;
use std::path::Path;

use candle_core::{DType, Device, Module, Tensor, D};

use super::t5::{
    extended_attention_mask, invert_attention_mask, layer_head_mask, BlockInputs, BlockOutputs,
    T5EncoderModel, T5ForConditionalGeneration, T5Model, T5Stack,
};
use crate::config::T5Config;
use crate::distributed::{
    Advisory, ConfigurationError, CurrentDeviceBinder, DeviceBinder, Diagnostics,
    PipelineStageConfig, Result, StageManager, T5StagePlan,
};

/// Label value excluded from the loss.
pub const IGNORE_INDEX: i64 = -100;

// ─── Stage context ─────────────────────────────────────────────────────────

/// Per-call stage assignment.
pub struct StageContext<'a> {
    pub stage_manager: &'a dyn StageManager,
    /// Block range to run, relative to the sub-model of this stage.
    pub stage_index: Range<usize>,
    pub decoder_starting_stage: usize,
    pub device_binder: &'a dyn DeviceBinder,
}

impl<'a> StageContext<'a> {
    pub fn new(
        stage_manager: &'a dyn StageManager,
        stage_index: Range<usize>,
        decoder_starting_stage: usize,
    ) -> Self {
        Self {
            stage_manager,
            stage_index,
            decoder_starting_stage,
            device_binder: &CurrentDeviceBinder,
        }
    }

    /// Context for `stage_config` under `plan`.
    pub fn from_plan(stage_config: &'a PipelineStageConfig, plan: &T5StagePlan) -> Self {
        Self::new(
            stage_config,
            stage_config.layer_range(),
            plan.decoder_starting_stage(),
        )
    }

    pub fn with_device_binder(mut self, device_binder: &'a dyn DeviceBinder) -> Self {
        self.device_binder = device_binder;
        self
    }

    pub fn stage(&self) -> usize {
        self.stage_manager.stage()
    }

    pub fn in_decoder(&self) -> bool {
        self.stage() >= self.decoder_starting_stage
    }

    /// First stage of the encoder or of the decoder.
    pub fn is_first_of_submodel(&self) -> bool {
        let stage = self.stage();
        stage == 0 || stage == self.decoder_starting_stage
    }

    /// Last stage of the encoder or of the decoder.
    pub fn is_last_of_submodel(&self) -> bool {
        self.stage() + 1 == self.decoder_starting_stage || self.stage_manager.is_last_stage()
    }
}

// ─── Feature policy ────────────────────────────────────────────────────────

/// Optional outputs a caller asked for.
#[derive(Debug, Clone, Default)]
pub struct FeatureRequest {
    /// `None` falls back to the model config.
    pub use_cache: Option<bool>,
    pub output_attentions: bool,
    pub output_hidden_states: bool,
    pub past_key_values: Vec<Vec<Tensor>>,
}

impl FeatureRequest {
    /// Switch off everything pipeline mode cannot honour.
    pub fn enforce(&mut self, default_use_cache: bool, diagnostics: &mut Diagnostics) {
        if !self.past_key_values.is_empty() {
            diagnostics.warn_once(Advisory::PastKeyValuesIgnored);
            self.past_key_values.clear();
        }
        if self.output_attentions {
            diagnostics.warn_once(Advisory::OutputAttentionsDisabled);
            self.output_attentions = false;
        }
        if self.output_hidden_states {
            diagnostics.warn_once(Advisory::OutputHiddenStatesDisabled);
            self.output_hidden_states = false;
        }
        if self.use_cache.unwrap_or(default_use_cache) {
            diagnostics.warn_once(Advisory::UseCacheDisabled);
        }
        self.use_cache = Some(false);
    }
}

// ─── Outputs ───────────────────────────────────────────────────────────────

/// Output of a stack's last stage. Collections stay `None` in pipeline mode.
#[derive(Debug, Clone)]
pub struct BaseModelOutput {
    pub last_hidden_state: Tensor,
    pub past_key_values: Option<Vec<Vec<Tensor>>>,
    pub hidden_states: Option<Vec<Tensor>>,
    pub attentions: Option<Vec<Tensor>>,
    pub cross_attentions: Option<Vec<Tensor>>,
}

impl BaseModelOutput {
    pub fn new(last_hidden_state: Tensor) -> Self {
        Self {
            last_hidden_state,
            past_key_values: None,
            hidden_states: None,
            attentions: None,
            cross_attentions: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Seq2SeqModelOutput {
    pub last_hidden_state: Tensor,
    pub past_key_values: Option<Vec<Vec<Tensor>>>,
    pub decoder_hidden_states: Option<Vec<Tensor>>,
    pub decoder_attentions: Option<Vec<Tensor>>,
    pub cross_attentions: Option<Vec<Tensor>>,
    pub encoder_last_hidden_state: Tensor,
    pub encoder_hidden_states: Option<Vec<Tensor>>,
    pub encoder_attentions: Option<Vec<Tensor>>,
}

impl Seq2SeqModelOutput {
    fn new(decoder: BaseModelOutput, encoder: BaseModelOutput) -> Self {
        Self {
            last_hidden_state: decoder.last_hidden_state,
            past_key_values: decoder.past_key_values,
            decoder_hidden_states: decoder.hidden_states,
            decoder_attentions: decoder.attentions,
            cross_attentions: decoder.cross_attentions,
            encoder_last_hidden_state: encoder.last_hidden_state,
            encoder_hidden_states: encoder.hidden_states,
            encoder_attentions: encoder.attentions,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Seq2SeqLMOutput {
    /// Scalar cross entropy, present when labels were given.
    pub loss: Option<Tensor>,
    /// `[batch, decoder_seq_len, vocab_size]`
    pub logits: Tensor,
    pub past_key_values: Option<Vec<Vec<Tensor>>>,
    pub decoder_hidden_states: Option<Vec<Tensor>>,
    pub decoder_attentions: Option<Vec<Tensor>>,
    pub cross_attentions: Option<Vec<Tensor>>,
    pub encoder_last_hidden_state: Tensor,
    pub encoder_hidden_states: Option<Vec<Tensor>>,
    pub encoder_attentions: Option<Vec<Tensor>>,
}

/// State handed from one stage to the next.
#[derive(Debug, Clone, Default)]
pub struct StageBundle {
    pub hidden_states: Option<Tensor>,
    pub position_bias: Option<Tensor>,
    pub encoder_decoder_position_bias: Option<Tensor>,
    pub encoder_outputs: Option<BaseModelOutput>,
}

const HIDDEN_STATES_KEY: &str = "hidden_states";
const POSITION_BIAS_KEY: &str = "position_bias";
const ENCODER_DECODER_POSITION_BIAS_KEY: &str = "encoder_decoder_position_bias";
const ENCODER_OUTPUTS_KEY: &str = "encoder_outputs";

impl StageBundle {
    pub fn from_encoder_outputs(encoder_outputs: BaseModelOutput) -> Self {
        Self {
            encoder_outputs: Some(encoder_outputs),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.hidden_states.is_none()
            && self.position_bias.is_none()
            && self.encoder_decoder_position_bias.is_none()
            && self.encoder_outputs.is_none()
    }

    /// Flat name -> tensor map; absent entries are omitted.
    pub fn to_tensors(&self) -> HashMap<String, Tensor> {
        let entries = [
            (HIDDEN_STATES_KEY, self.hidden_states.as_ref()),
            (POSITION_BIAS_KEY, self.position_bias.as_ref()),
            (
                ENCODER_DECODER_POSITION_BIAS_KEY,
                self.encoder_decoder_position_bias.as_ref(),
            ),
            (
                ENCODER_OUTPUTS_KEY,
                self.encoder_outputs.as_ref().map(|o| &o.last_hidden_state),
            ),
        ];
        entries
            .into_iter()
            .filter_map(|(k, t)| t.map(|t| (k.to_string(), t.clone())))
            .collect()
    }

    /// Inverse of [`Self::to_tensors`]. Unknown keys are ignored.
    pub fn from_tensors(mut tensors: HashMap<String, Tensor>) -> Self {
        Self {
            hidden_states: tensors.remove(HIDDEN_STATES_KEY),
            position_bias: tensors.remove(POSITION_BIAS_KEY),
            encoder_decoder_position_bias: tensors.remove(ENCODER_DECODER_POSITION_BIAS_KEY),
            encoder_outputs: tensors.remove(ENCODER_OUTPUTS_KEY).map(BaseModelOutput::new),
        }
    }

    /// Write the bundle as safetensors so it can cross a process boundary.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> candle_core::Result<()> {
        candle_core::safetensors::save(&self.to_tensors(), path)
    }

    pub fn load<P: AsRef<Path>>(path: P, device: &Device) -> candle_core::Result<Self> {
        Ok(Self::from_tensors(candle_core::safetensors::load(path, device)?))
    }
}

/// Result of a stage: either state for the next stage or the model output.
#[derive(Debug, Clone)]
pub enum StageOutput<T> {
    Handoff(StageBundle),
    Final(T),
}

impl<T> StageOutput<T> {
    pub fn is_handoff(&self) -> bool {
        matches!(self, StageOutput::Handoff(_))
    }

    pub fn as_handoff(&self) -> Option<&StageBundle> {
        match self {
            StageOutput::Handoff(bundle) => Some(bundle),
            StageOutput::Final(_) => None,
        }
    }

    pub fn into_handoff(self) -> Option<StageBundle> {
        match self {
            StageOutput::Handoff(bundle) => Some(bundle),
            StageOutput::Final(_) => None,
        }
    }

    pub fn into_final(self) -> Option<T> {
        match self {
            StageOutput::Handoff(_) => None,
            StageOutput::Final(out) => Some(out),
        }
    }
}

// ─── Inputs ────────────────────────────────────────────────────────────────

/// Inputs of a single stack stage.
#[derive(Debug, Clone, Default)]
pub struct StackInputs {
    pub input_ids: Option<Tensor>,
    pub inputs_embeds: Option<Tensor>,
    pub attention_mask: Option<Tensor>,
    pub encoder_hidden_states: Option<Tensor>,
    pub encoder_attention_mask: Option<Tensor>,
    pub head_mask: Option<Tensor>,
    pub cross_attn_head_mask: Option<Tensor>,
    pub hidden_states: Option<Tensor>,
    pub position_bias: Option<Tensor>,
    pub encoder_decoder_position_bias: Option<Tensor>,
    pub features: FeatureRequest,
}

impl StackInputs {
    /// Take hidden states and position biases from a previous stage.
    pub fn with_bundle(mut self, bundle: StageBundle) -> Self {
        self.hidden_states = bundle.hidden_states;
        self.position_bias = bundle.position_bias;
        self.encoder_decoder_position_bias = bundle.encoder_decoder_position_bias;
        self
    }
}

/// Inputs of an encoder-decoder stage.
#[derive(Debug, Clone, Default)]
pub struct Seq2SeqInputs {
    pub input_ids: Option<Tensor>,
    pub attention_mask: Option<Tensor>,
    pub decoder_input_ids: Option<Tensor>,
    pub decoder_attention_mask: Option<Tensor>,
    pub head_mask: Option<Tensor>,
    pub decoder_head_mask: Option<Tensor>,
    pub cross_attn_head_mask: Option<Tensor>,
    pub inputs_embeds: Option<Tensor>,
    pub decoder_inputs_embeds: Option<Tensor>,
    /// `[batch, decoder_seq_len]`; only used by the LM head.
    pub labels: Option<Tensor>,
    pub features: FeatureRequest,
    pub bundle: StageBundle,
}

/// Inputs of an encoder-only stage.
#[derive(Debug, Clone, Default)]
pub struct EncoderInputs {
    pub input_ids: Option<Tensor>,
    pub attention_mask: Option<Tensor>,
    pub head_mask: Option<Tensor>,
    pub inputs_embeds: Option<Tensor>,
    pub features: FeatureRequest,
    pub bundle: StageBundle,
}

// ─── Stack stage forward ───────────────────────────────────────────────────

impl T5Stack {
    /// Run the blocks of `ctx.stage_index` for this stage.
    ///
    /// The first stage of a stack embeds `input_ids` (or takes
    /// `inputs_embeds`); every other stage continues from `hidden_states`.
    /// The last stage of a stack applies the final norm and returns
    /// [`StageOutput::Final`].
    pub fn stage_forward(
        &self,
        inputs: StackInputs,
        ctx: &StageContext<'_>,
        diagnostics: &mut Diagnostics,
    ) -> Result<StageOutput<BaseModelOutput>> {
        let mut features = inputs.features;
        features.enforce(false, diagnostics);

        let stage = ctx.stage();
        if self.is_decoder != ctx.in_decoder() {
            return Err(ConfigurationError::StageMismatch {
                is_decoder: self.is_decoder,
                stage,
                decoder_starting_stage: ctx.decoder_starting_stage,
            }
            .into());
        }

        let range = ctx.stage_index.clone();
        if range.start > range.end || range.end > self.blocks.len() {
            return Err(ConfigurationError::InvalidStageIndex {
                start: range.start,
                end: range.end,
                num_blocks: self.blocks.len(),
            }
            .into());
        }

        let hidden_states = if ctx.is_first_of_submodel() {
            let prefix = if self.is_decoder { "decoder_" } else { "" };
            let inputs_embeds = match (inputs.input_ids.as_ref(), inputs.inputs_embeds) {
                (Some(_), Some(_)) => {
                    return Err(ConfigurationError::ConflictingInputs { prefix }.into())
                }
                (None, None) => return Err(ConfigurationError::MissingInputs { prefix }.into()),
                (None, Some(embeds)) => embeds,
                (Some(ids), None) => {
                    let embed_tokens = self
                        .embed_tokens
                        .as_ref()
                        .ok_or(ConfigurationError::MissingEmbeddings)?;
                    let seq_len = ids.dim(D::Minus1)?;
                    embed_tokens.forward(&ids.reshape(((), seq_len))?)?
                }
            };
            self.dropout.forward(&inputs_embeds, self.training)?
        } else {
            inputs
                .hidden_states
                .ok_or(ConfigurationError::MissingHiddenStates { stage })?
        };

        let (batch_size, seq_len, _) = hidden_states.dims3()?;
        let device = hidden_states.device().clone();
        let dtype = hidden_states.dtype();

        let attention_mask = match inputs.attention_mask {
            Some(mask) => mask,
            None => Tensor::ones((batch_size, seq_len), DType::F32, &device)?,
        };
        let extended_mask = extended_attention_mask(&attention_mask, self.is_decoder, dtype)?;

        let encoder_hidden_states = inputs.encoder_hidden_states.filter(|_| self.is_decoder);
        let encoder_extended_mask = match &encoder_hidden_states {
            Some(encoder_hidden) => {
                let mask = match inputs.encoder_attention_mask {
                    Some(mask) => mask,
                    None => {
                        let encoder_seq_len = encoder_hidden.dim(1)?;
                        Tensor::ones((batch_size, encoder_seq_len), DType::F32, &device)?
                    }
                };
                Some(invert_attention_mask(&mask, dtype)?)
            }
            None => None,
        };

        let checkpointer = self.checkpointer.as_deref().filter(|_| self.training);
        let mut hidden_states = hidden_states;
        let mut position_bias = inputs.position_bias;
        let mut encoder_decoder_position_bias = inputs.encoder_decoder_position_bias;

        tracing::debug!(
            stage,
            is_decoder = self.is_decoder,
            start = range.start,
            end = range.end,
            checkpointing = checkpointer.is_some(),
            "running stage blocks"
        );

        for i in range {
            let block = &self.blocks[i];
            let head_mask = layer_head_mask(inputs.head_mask.as_ref(), i)?;
            let cross_head_mask = layer_head_mask(inputs.cross_attn_head_mask.as_ref(), i)?;

            ctx.device_binder.bind(hidden_states.device())?;

            let block_inputs = BlockInputs {
                hidden_states: &hidden_states,
                attention_mask: Some(&extended_mask),
                position_bias: position_bias.as_ref(),
                encoder_hidden_states: encoder_hidden_states.as_ref(),
                encoder_attention_mask: encoder_extended_mask.as_ref(),
                encoder_decoder_position_bias: encoder_decoder_position_bias.as_ref(),
                layer_head_mask: head_mask.as_ref(),
                cross_attn_layer_head_mask: cross_head_mask.as_ref(),
            };

            let outputs = match checkpointer {
                Some(checkpointer) => {
                    let tensors = checkpointer.checkpoint(&mut || {
                        Ok(block.forward(&block_inputs, self.training)?.into_tensors())
                    })?;
                    BlockOutputs::from_tensors(tensors)?
                }
                None => block.forward(&block_inputs, self.training)?,
            };

            hidden_states = outputs.hidden_states;
            position_bias = Some(outputs.position_bias);
            if encoder_hidden_states.is_some() {
                encoder_decoder_position_bias = outputs.encoder_decoder_position_bias;
            }
        }

        if ctx.is_last_of_submodel() {
            let hidden_states = self.final_layer_norm.forward(&hidden_states)?;
            let hidden_states = self.dropout.forward(&hidden_states, self.training)?;
            return Ok(StageOutput::Final(BaseModelOutput::new(hidden_states)));
        }

        Ok(StageOutput::Handoff(StageBundle {
            hidden_states: Some(hidden_states),
            position_bias,
            encoder_decoder_position_bias,
            encoder_outputs: None,
        }))
    }
}

// ─── Model stage forwards ──────────────────────────────────────────────────

/// Shared routing for the encoder-decoder models. The final value carries the
/// decoder output and the encoder output, in that order.
fn seq2seq_stage_forward(
    encoder: &T5Stack,
    decoder: &T5Stack,
    config: &T5Config,
    mut inputs: Seq2SeqInputs,
    ctx: &StageContext<'_>,
    diagnostics: &mut Diagnostics,
) -> Result<StageOutput<(BaseModelOutput, BaseModelOutput)>> {
    inputs.features.enforce(config.use_cache, diagnostics);

    if inputs.head_mask.is_some()
        && inputs.decoder_head_mask.is_none()
        && config.num_layers == config.num_decoder_layers()
    {
        diagnostics.warn_once(Advisory::DecoderHeadMaskCopied);
        inputs.decoder_head_mask = inputs.head_mask.clone();
    }

    let StageBundle {
        hidden_states,
        position_bias,
        encoder_decoder_position_bias,
        encoder_outputs,
    } = inputs.bundle;

    if !ctx.in_decoder() {
        let stack_inputs = StackInputs {
            input_ids: inputs.input_ids,
            inputs_embeds: inputs.inputs_embeds,
            attention_mask: inputs.attention_mask,
            head_mask: inputs.head_mask,
            hidden_states,
            position_bias,
            encoder_decoder_position_bias,
            features: inputs.features,
            ..StackInputs::default()
        };
        return Ok(match encoder.stage_forward(stack_inputs, ctx, diagnostics)? {
            // Last encoder stage: hand the encoder output to the decoder.
            StageOutput::Final(encoder_outputs) => {
                StageOutput::Handoff(StageBundle::from_encoder_outputs(encoder_outputs))
            }
            StageOutput::Handoff(bundle) => StageOutput::Handoff(bundle),
        });
    }

    let stage = ctx.stage();
    let encoder_outputs =
        encoder_outputs.ok_or(ConfigurationError::MissingEncoderOutputs { stage })?;
    if !ctx.is_first_of_submodel() && hidden_states.is_none() {
        return Err(ConfigurationError::MissingHiddenStates { stage }.into());
    }

    let stack_inputs = StackInputs {
        input_ids: inputs.decoder_input_ids,
        inputs_embeds: inputs.decoder_inputs_embeds,
        attention_mask: inputs.decoder_attention_mask,
        encoder_hidden_states: Some(encoder_outputs.last_hidden_state.clone()),
        encoder_attention_mask: inputs.attention_mask,
        head_mask: inputs.decoder_head_mask,
        cross_attn_head_mask: inputs.cross_attn_head_mask,
        hidden_states,
        position_bias,
        encoder_decoder_position_bias,
        features: inputs.features,
    };

    Ok(match decoder.stage_forward(stack_inputs, ctx, diagnostics)? {
        StageOutput::Handoff(mut bundle) => {
            bundle.encoder_outputs = Some(encoder_outputs);
            StageOutput::Handoff(bundle)
        }
        StageOutput::Final(decoder_outputs) => StageOutput::Final((decoder_outputs, encoder_outputs)),
    })
}

impl T5Model {
    pub fn stage_forward(
        &self,
        inputs: Seq2SeqInputs,
        ctx: &StageContext<'_>,
        diagnostics: &mut Diagnostics,
    ) -> Result<StageOutput<Seq2SeqModelOutput>> {
        Ok(
            match seq2seq_stage_forward(
                &self.encoder,
                &self.decoder,
                &self.config,
                inputs,
                ctx,
                diagnostics,
            )? {
                StageOutput::Handoff(bundle) => StageOutput::Handoff(bundle),
                StageOutput::Final((decoder, encoder)) => {
                    StageOutput::Final(Seq2SeqModelOutput::new(decoder, encoder))
                }
            },
        )
    }
}

impl T5ForConditionalGeneration {
    /// Stage forward; the last decoder stage projects to vocabulary logits and
    /// computes the loss when `labels` are given.
    pub fn stage_forward(
        &self,
        mut inputs: Seq2SeqInputs,
        ctx: &StageContext<'_>,
        diagnostics: &mut Diagnostics,
    ) -> Result<StageOutput<Seq2SeqLMOutput>> {
        let labels = inputs.labels.take();
        let (decoder_outputs, encoder_outputs) = match seq2seq_stage_forward(
            &self.encoder,
            &self.decoder,
            &self.config,
            inputs,
            ctx,
            diagnostics,
        )? {
            StageOutput::Handoff(bundle) => return Ok(StageOutput::Handoff(bundle)),
            StageOutput::Final(outputs) => outputs,
        };

        let mut sequence_output = decoder_outputs.last_hidden_state;
        if self.config.tie_word_embeddings {
            // Rescale before projecting onto the tied vocabulary embedding.
            sequence_output = sequence_output.affine((self.config.d_model as f64).powf(-0.5), 0.)?;
        }
        let logits = self.lm_head.forward(&sequence_output)?;

        let loss = labels
            .map(|labels| cross_entropy_ignore_index(&logits, &labels))
            .transpose()?;

        Ok(StageOutput::Final(Seq2SeqLMOutput {
            loss,
            logits,
            past_key_values: decoder_outputs.past_key_values,
            decoder_hidden_states: decoder_outputs.hidden_states,
            decoder_attentions: decoder_outputs.attentions,
            cross_attentions: decoder_outputs.cross_attentions,
            encoder_last_hidden_state: encoder_outputs.last_hidden_state,
            encoder_hidden_states: encoder_outputs.hidden_states,
            encoder_attentions: encoder_outputs.attentions,
        }))
    }
}

impl T5EncoderModel {
    pub fn stage_forward(
        &self,
        inputs: EncoderInputs,
        ctx: &StageContext<'_>,
        diagnostics: &mut Diagnostics,
    ) -> Result<StageOutput<BaseModelOutput>> {
        let stack_inputs = StackInputs {
            input_ids: inputs.input_ids,
            inputs_embeds: inputs.inputs_embeds,
            attention_mask: inputs.attention_mask,
            head_mask: inputs.head_mask,
            features: inputs.features,
            ..StackInputs::default()
        }
        .with_bundle(inputs.bundle);
        self.encoder.stage_forward(stack_inputs, ctx, diagnostics)
    }
}

// ─── Loss ──────────────────────────────────────────────────────────────────

/// Mean token cross entropy over `[.., vocab]` logits, skipping
/// [`IGNORE_INDEX`] labels. Returns NaN when every label is ignored.
pub fn cross_entropy_ignore_index(logits: &Tensor, labels: &Tensor) -> candle_core::Result<Tensor> {
    let vocab_size = logits.dim(D::Minus1)?;
    let logits = logits.reshape(((), vocab_size))?.to_dtype(DType::F32)?;
    let labels = labels
        .to_device(logits.device())?
        .to_dtype(DType::I64)?
        .flatten_all()?;

    let ignore = Tensor::full(IGNORE_INDEX, labels.shape(), labels.device())?;
    let keep = labels.ne(&ignore)?;
    let safe_labels = keep.where_cond(&labels, &labels.zeros_like()?)?;

    let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?;
    let picked = log_probs.gather(&safe_labels.unsqueeze(1)?, 1)?.squeeze(1)?;

    let keep = keep.to_dtype(DType::F32)?;
    let total = (picked * &keep)?.sum_all()?.neg()?;
    total.broadcast_div(&keep.sum_all()?)
}
