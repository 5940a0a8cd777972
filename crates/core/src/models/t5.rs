//! T5 encoder-decoder building blocks.
//!
//! Key architectural features:
//! - Relative position bias (not RoPE or absolute embeddings), computed by the
//!   first block of a stack and shared by every later block
//! - Pre-norm (RMS LayerNorm before attention and FFN)
//! - Bidirectional encoder, causal decoder with cross-attention
//! - Gated FFN (T5 v1.1+) or standard FFN (T5 v1.0)
//! - Shared input embeddings between encoder and decoder
//! - No bias in any linear projections
//!
//! The stacks expose their blocks individually so a pipeline stage can run an
//! arbitrary contiguous block range (see [`super::t5_pipeline`]).

use candle_core::{DType, Device, Module, Result, Tensor, D};
use candle_nn::{embedding, linear_no_bias, Activation, Dropout, Embedding, Linear, VarBuilder};

use crate::config::T5Config;
use crate::distributed::GradientCheckpointing;

// ─── T5 RMS LayerNorm ──────────────────────────────────────────────────────

/// T5-style RMS LayerNorm (scale only, no bias, no mean subtraction).
pub(crate) struct T5LayerNorm {
    weight: Tensor,
    eps: f64,
}

impl T5LayerNorm {
    fn new(hidden_size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get(hidden_size, "weight")?;
        Ok(Self { weight, eps })
    }

    pub(crate) fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let dtype = xs.dtype();
        let xs_f32 = xs.to_dtype(DType::F32)?;
        let variance = xs_f32.sqr()?.mean_keepdim(D::Minus1)?;
        let xs_normed = xs_f32.broadcast_div(&(variance + self.eps)?.sqrt()?)?;
        let weight = self.weight.to_dtype(DType::F32)?;
        (xs_normed.broadcast_mul(&weight))?.to_dtype(dtype)
    }
}

// ─── Relative Position Bias ────────────────────────────────────────────────

/// Learned relative position bias for T5 attention.
///
/// Maps relative distances between query and key positions to bias values
/// using logarithmic bucketing to handle long distances efficiently.
struct RelativePositionBias {
    embeddings: Embedding,
    num_buckets: usize,
    max_distance: usize,
    bidirectional: bool,
}

impl RelativePositionBias {
    fn new(
        num_heads: usize,
        num_buckets: usize,
        max_distance: usize,
        bidirectional: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let embeddings = embedding(num_buckets, num_heads, vb.pp("relative_attention_bias"))?;
        Ok(Self {
            embeddings,
            num_buckets,
            max_distance,
            bidirectional,
        })
    }

    /// Bucket index for `key_position - query_position`.
    ///
    /// Bidirectional buckets are split in half by sign; within each half small
    /// distances get exact buckets and large distances logarithmic ones.
    fn relative_position_bucket(&self, relative_position: i64) -> usize {
        let (mut bucket, num_buckets, distance) = if self.bidirectional {
            let half = self.num_buckets / 2;
            let offset = if relative_position > 0 { half } else { 0 };
            (offset, half, relative_position.unsigned_abs() as usize)
        } else {
            (0, self.num_buckets, (-relative_position).max(0) as usize)
        };

        let max_exact = num_buckets / 2;
        if distance < max_exact {
            return bucket + distance;
        }

        let large = ((distance as f64 / max_exact as f64).ln()
            / (self.max_distance as f64 / max_exact as f64).ln()
            * (num_buckets - max_exact) as f64) as usize;
        bucket += max_exact + large.min(num_buckets - max_exact - 1);
        bucket
    }

    /// Compute the relative position bias tensor.
    ///
    /// Returns `[1, num_heads, query_len, key_len]`.
    fn compute_bias(&self, query_len: usize, key_len: usize, device: &Device) -> Result<Tensor> {
        let mut bucket_indices = Vec::with_capacity(query_len * key_len);
        for qi in 0..query_len {
            for ki in 0..key_len {
                let rel_pos = ki as i64 - qi as i64;
                bucket_indices.push(self.relative_position_bucket(rel_pos) as u32);
            }
        }

        let indices = Tensor::from_vec(bucket_indices, (query_len, key_len), device)?;

        // [query_len, key_len, num_heads] -> [1, num_heads, query_len, key_len]
        let bias = self.embeddings.forward(&indices)?;
        bias.permute((2, 0, 1))?.unsqueeze(0)
    }
}

// ─── Attention ─────────────────────────────────────────────────────────────

/// T5 multi-head attention, used for both self- and cross-attention.
///
/// T5 does not scale scores by 1/sqrt(d_k). The additive position bias is
/// returned so later blocks can reuse it; it already contains the mask.
struct T5Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    head_dim: usize,
    relative_bias: Option<RelativePositionBias>,
    dropout: Dropout,
}

impl T5Attention {
    fn new(
        cfg: &T5Config,
        has_relative_bias: bool,
        bidirectional: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let inner_dim = cfg.inner_dim();

        let q_proj = linear_no_bias(cfg.d_model, inner_dim, vb.pp("q"))?;
        let k_proj = linear_no_bias(cfg.d_model, inner_dim, vb.pp("k"))?;
        let v_proj = linear_no_bias(cfg.d_model, inner_dim, vb.pp("v"))?;
        let o_proj = linear_no_bias(inner_dim, cfg.d_model, vb.pp("o"))?;

        let relative_bias = if has_relative_bias {
            Some(RelativePositionBias::new(
                cfg.num_heads,
                cfg.relative_attention_num_buckets,
                cfg.relative_attention_max_distance,
                bidirectional,
                vb,
            )?)
        } else {
            None
        };

        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            num_heads: cfg.num_heads,
            head_dim: cfg.d_kv,
            relative_bias,
            dropout: Dropout::new(cfg.dropout_rate),
        })
    }

    fn split_heads(&self, xs: &Tensor) -> Result<Tensor> {
        let (b_sz, seq_len, _) = xs.dims3()?;
        xs.reshape((b_sz, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    /// `key_value_states` is `None` for self-attention.
    fn forward(
        &self,
        xs: &Tensor,
        key_value_states: Option<&Tensor>,
        mask: Option<&Tensor>,
        position_bias: Option<&Tensor>,
        layer_head_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let (b_sz, q_len, _) = xs.dims3()?;
        let kv_input = key_value_states.unwrap_or(xs);
        let k_len = kv_input.dim(1)?;

        let q = self.split_heads(&self.q_proj.forward(xs)?)?;
        let k = self.split_heads(&self.k_proj.forward(kv_input)?)?;
        let v = self.split_heads(&self.v_proj.forward(kv_input)?)?;

        let scores = q.matmul(&k.transpose(2, 3)?.contiguous()?)?;

        let position_bias = match position_bias {
            Some(bias) => bias.clone(),
            None => {
                let bias = match &self.relative_bias {
                    Some(rel_bias) => rel_bias
                        .compute_bias(q_len, k_len, xs.device())?
                        .to_dtype(scores.dtype())?,
                    None => Tensor::zeros(
                        (1, self.num_heads, q_len, k_len),
                        scores.dtype(),
                        xs.device(),
                    )?,
                };
                match mask {
                    Some(mask) => bias.broadcast_add(&mask.to_dtype(scores.dtype())?)?,
                    None => bias,
                }
            }
        };

        let scores = scores.broadcast_add(&position_bias)?;
        let attn_weights = candle_nn::ops::softmax_last_dim(&scores.to_dtype(DType::F32)?)?
            .to_dtype(scores.dtype())?;
        let attn_weights = self.dropout.forward(&attn_weights, train)?;
        let attn_weights = match layer_head_mask {
            Some(head_mask) => attn_weights.broadcast_mul(&head_mask.to_dtype(scores.dtype())?)?,
            None => attn_weights,
        };

        let attn_output = attn_weights.matmul(&v)?;
        let attn_output = attn_output.transpose(1, 2)?.contiguous()?.reshape((
            b_sz,
            q_len,
            self.num_heads * self.head_dim,
        ))?;

        Ok((self.o_proj.forward(&attn_output)?, position_bias))
    }
}

// ─── T5 FFN ────────────────────────────────────────────────────────────────

/// T5 feed-forward network.
///
/// Two variants:
/// - Standard: wi -> act -> wo
/// - Gated (T5 v1.1+): act(wi_0) * wi_1 -> wo
enum FfnKind {
    Standard { wi: Linear },
    Gated { wi_0: Linear, wi_1: Linear },
}

struct T5Ffn {
    kind: FfnKind,
    wo: Linear,
    act: Activation,
    dropout: Dropout,
}

impl T5Ffn {
    fn new(cfg: &T5Config, vb: VarBuilder) -> Result<Self> {
        let kind = if cfg.is_gated_act {
            FfnKind::Gated {
                wi_0: linear_no_bias(cfg.d_model, cfg.d_ff, vb.pp("wi_0"))?,
                wi_1: linear_no_bias(cfg.d_model, cfg.d_ff, vb.pp("wi_1"))?,
            }
        } else {
            FfnKind::Standard {
                wi: linear_no_bias(cfg.d_model, cfg.d_ff, vb.pp("wi"))?,
            }
        };
        let wo = linear_no_bias(cfg.d_ff, cfg.d_model, vb.pp("wo"))?;

        Ok(Self {
            kind,
            wo,
            act: cfg.dense_act_fn,
            dropout: Dropout::new(cfg.dropout_rate),
        })
    }

    fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let hidden = match &self.kind {
            FfnKind::Standard { wi } => self.act.forward(&wi.forward(xs)?)?,
            FfnKind::Gated { wi_0, wi_1 } => {
                let gate = self.act.forward(&wi_0.forward(xs)?)?;
                (gate * wi_1.forward(xs)?)?
            }
        };
        let hidden = self.dropout.forward(&hidden, train)?;
        self.wo.forward(&hidden)
    }
}

// ─── Block sub-layers ──────────────────────────────────────────────────────

struct T5LayerSelfAttention {
    attention: T5Attention,
    layer_norm: T5LayerNorm,
    dropout: Dropout,
}

impl T5LayerSelfAttention {
    fn new(cfg: &T5Config, has_relative_bias: bool, is_decoder: bool, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            attention: T5Attention::new(cfg, has_relative_bias, !is_decoder, vb.pp("SelfAttention"))?,
            layer_norm: T5LayerNorm::new(cfg.d_model, cfg.layer_norm_epsilon, vb.pp("layer_norm"))?,
            dropout: Dropout::new(cfg.dropout_rate),
        })
    }

    fn forward(
        &self,
        xs: &Tensor,
        mask: Option<&Tensor>,
        position_bias: Option<&Tensor>,
        layer_head_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let normed = self.layer_norm.forward(xs)?;
        let (attn_output, bias) =
            self.attention
                .forward(&normed, None, mask, position_bias, layer_head_mask, train)?;
        let xs = (xs + self.dropout.forward(&attn_output, train)?)?;
        Ok((xs, bias))
    }
}

struct T5LayerCrossAttention {
    attention: T5Attention,
    layer_norm: T5LayerNorm,
    dropout: Dropout,
}

impl T5LayerCrossAttention {
    fn new(cfg: &T5Config, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            attention: T5Attention::new(cfg, false, true, vb.pp("EncDecAttention"))?,
            layer_norm: T5LayerNorm::new(cfg.d_model, cfg.layer_norm_epsilon, vb.pp("layer_norm"))?,
            dropout: Dropout::new(cfg.dropout_rate),
        })
    }

    fn forward(
        &self,
        xs: &Tensor,
        encoder_hidden_states: &Tensor,
        mask: Option<&Tensor>,
        position_bias: Option<&Tensor>,
        layer_head_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let normed = self.layer_norm.forward(xs)?;
        let (attn_output, bias) = self.attention.forward(
            &normed,
            Some(encoder_hidden_states),
            mask,
            position_bias,
            layer_head_mask,
            train,
        )?;
        let xs = (xs + self.dropout.forward(&attn_output, train)?)?;
        Ok((xs, bias))
    }
}

struct T5LayerFF {
    ffn: T5Ffn,
    layer_norm: T5LayerNorm,
    dropout: Dropout,
}

impl T5LayerFF {
    fn new(cfg: &T5Config, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            ffn: T5Ffn::new(cfg, vb.pp("DenseReluDense"))?,
            layer_norm: T5LayerNorm::new(cfg.d_model, cfg.layer_norm_epsilon, vb.pp("layer_norm"))?,
            dropout: Dropout::new(cfg.dropout_rate),
        })
    }

    fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let normed = self.layer_norm.forward(xs)?;
        let ffn_output = self.ffn.forward(&normed, train)?;
        xs + self.dropout.forward(&ffn_output, train)?
    }
}

/// Keep f16 activations finite.
fn clamp_f16(xs: Tensor) -> Result<Tensor> {
    if xs.dtype() != DType::F16 {
        return Ok(xs);
    }
    let limit = half::f16::MAX.to_f64() - 1000.0;
    xs.clamp(-limit, limit)
}

// ─── T5 Block ──────────────────────────────────────────────────────────────

/// Inputs of a single block. Masks are already in extended additive form.
#[derive(Clone, Copy)]
pub(crate) struct BlockInputs<'a> {
    pub hidden_states: &'a Tensor,
    pub attention_mask: Option<&'a Tensor>,
    pub position_bias: Option<&'a Tensor>,
    pub encoder_hidden_states: Option<&'a Tensor>,
    pub encoder_attention_mask: Option<&'a Tensor>,
    pub encoder_decoder_position_bias: Option<&'a Tensor>,
    pub layer_head_mask: Option<&'a Tensor>,
    pub cross_attn_layer_head_mask: Option<&'a Tensor>,
}

pub(crate) struct BlockOutputs {
    pub hidden_states: Tensor,
    pub position_bias: Tensor,
    /// Only produced by decoder blocks given encoder states.
    pub encoder_decoder_position_bias: Option<Tensor>,
}

impl BlockOutputs {
    pub(crate) fn into_tensors(self) -> Vec<Tensor> {
        let mut out = vec![self.hidden_states, self.position_bias];
        out.extend(self.encoder_decoder_position_bias);
        out
    }

    pub(crate) fn from_tensors(tensors: Vec<Tensor>) -> Result<Self> {
        let mut it = tensors.into_iter();
        match (it.next(), it.next()) {
            (Some(hidden_states), Some(position_bias)) => Ok(Self {
                hidden_states,
                position_bias,
                encoder_decoder_position_bias: it.next(),
            }),
            _ => candle_core::bail!("checkpointed block must return hidden states and position bias"),
        }
    }
}

pub(crate) struct T5Block {
    self_attention: T5LayerSelfAttention,
    cross_attention: Option<T5LayerCrossAttention>,
    ff: T5LayerFF,
}

impl T5Block {
    fn new(cfg: &T5Config, has_relative_bias: bool, is_decoder: bool, vb: VarBuilder) -> Result<Self> {
        let vb = vb.pp("layer");
        let self_attention =
            T5LayerSelfAttention::new(cfg, has_relative_bias, is_decoder, vb.pp("0"))?;
        let (cross_attention, ff_idx) = if is_decoder {
            (Some(T5LayerCrossAttention::new(cfg, vb.pp("1"))?), "2")
        } else {
            (None, "1")
        };
        let ff = T5LayerFF::new(cfg, vb.pp(ff_idx))?;
        Ok(Self {
            self_attention,
            cross_attention,
            ff,
        })
    }

    pub(crate) fn forward(&self, inputs: &BlockInputs<'_>, train: bool) -> Result<BlockOutputs> {
        let (xs, position_bias) = self.self_attention.forward(
            inputs.hidden_states,
            inputs.attention_mask,
            inputs.position_bias,
            inputs.layer_head_mask,
            train,
        )?;
        let mut xs = clamp_f16(xs)?;

        let mut encoder_decoder_position_bias = None;
        if let (Some(cross), Some(encoder_hidden)) =
            (&self.cross_attention, inputs.encoder_hidden_states)
        {
            let (h, bias) = cross.forward(
                &xs,
                encoder_hidden,
                inputs.encoder_attention_mask,
                inputs.encoder_decoder_position_bias,
                inputs.cross_attn_layer_head_mask,
                train,
            )?;
            xs = clamp_f16(h)?;
            encoder_decoder_position_bias = Some(bias);
        }

        let xs = clamp_f16(self.ff.forward(&xs, train)?)?;
        Ok(BlockOutputs {
            hidden_states: xs,
            position_bias,
            encoder_decoder_position_bias,
        })
    }
}

// ─── Masks ─────────────────────────────────────────────────────────────────

/// Most negative finite value of `dtype`, used as the additive "masked" bias.
pub(crate) fn mask_min_value(dtype: DType) -> f64 {
    match dtype {
        DType::F16 => half::f16::MIN.to_f64(),
        DType::BF16 => half::bf16::MIN.to_f64(),
        DType::F64 => f64::MIN,
        _ => f32::MIN as f64,
    }
}

/// `[seq_len, seq_len]` keep-mask with ones on and below the diagonal.
fn causal_keep_mask(seq_len: usize, device: &Device) -> Result<Tensor> {
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j <= i { 1.0 } else { 0.0 }))
        .collect();
    Tensor::from_vec(mask, (seq_len, seq_len), device)
}

/// Expand a `[B, S]` or `[B, Q, S]` keep-mask to `[B, 1, Q|1, S]` and turn it
/// into an additive bias. Decoder stacks also apply a causal mask.
pub(crate) fn extended_attention_mask(
    mask: &Tensor,
    is_decoder: bool,
    dtype: DType,
) -> Result<Tensor> {
    let mask = mask.to_dtype(DType::F32)?;
    let expanded = match mask.rank() {
        3 => mask.unsqueeze(1)?,
        2 if is_decoder => {
            let seq_len = mask.dim(1)?;
            let causal = causal_keep_mask(seq_len, mask.device())?
                .unsqueeze(0)?
                .unsqueeze(0)?;
            causal.broadcast_mul(&mask.unsqueeze(1)?.unsqueeze(1)?)?
        }
        2 => mask.unsqueeze(1)?.unsqueeze(1)?,
        _ => candle_core::bail!(
            "attention mask must have rank 2 or 3, got shape {:?}",
            mask.shape()
        ),
    };
    invert(&expanded, dtype)
}

/// Encoder keep-mask `[B, S_enc]` (or `[B, Q, S_enc]`) as an additive bias.
pub(crate) fn invert_attention_mask(mask: &Tensor, dtype: DType) -> Result<Tensor> {
    let mask = mask.to_dtype(DType::F32)?;
    let expanded = match mask.rank() {
        3 => mask.unsqueeze(1)?,
        2 => mask.unsqueeze(1)?.unsqueeze(1)?,
        _ => candle_core::bail!(
            "encoder attention mask must have rank 2 or 3, got shape {:?}",
            mask.shape()
        ),
    };
    invert(&expanded, dtype)
}

// (1 - m) * min
fn invert(keep: &Tensor, dtype: DType) -> Result<Tensor> {
    let min = mask_min_value(dtype);
    keep.to_dtype(dtype)?.affine(-min, min)
}

/// Per-block head mask `[1, H, 1, 1]` from a `[H]` or `[L, H]` mask.
pub(crate) fn layer_head_mask(head_mask: Option<&Tensor>, layer: usize) -> Result<Option<Tensor>> {
    let Some(head_mask) = head_mask else {
        return Ok(None);
    };
    let heads = match head_mask.rank() {
        1 => head_mask.clone(),
        2 => head_mask.get(layer)?,
        _ => candle_core::bail!(
            "head mask must have rank 1 or 2, got shape {:?}",
            head_mask.shape()
        ),
    };
    let num_heads = heads.dim(0)?;
    Ok(Some(heads.reshape((1, num_heads, 1, 1))?))
}

// ─── T5 Stack ──────────────────────────────────────────────────────────────

/// Encoder or decoder block stack.
pub struct T5Stack {
    pub(crate) embed_tokens: Option<Embedding>,
    pub(crate) blocks: Vec<T5Block>,
    pub(crate) final_layer_norm: T5LayerNorm,
    pub(crate) dropout: Dropout,
    pub(crate) is_decoder: bool,
    pub(crate) training: bool,
    pub(crate) checkpointer: Option<Box<dyn GradientCheckpointing>>,
}

impl T5Stack {
    pub fn new(
        cfg: &T5Config,
        is_decoder: bool,
        embed_tokens: Option<Embedding>,
        vb: VarBuilder,
    ) -> Result<Self> {
        let num_blocks = if is_decoder {
            cfg.num_decoder_layers()
        } else {
            cfg.num_layers
        };

        let mut blocks = Vec::with_capacity(num_blocks);
        for i in 0..num_blocks {
            // Only the first block owns the relative attention bias table.
            blocks.push(T5Block::new(cfg, i == 0, is_decoder, vb.pp(format!("block.{i}")))?);
        }
        let final_layer_norm =
            T5LayerNorm::new(cfg.d_model, cfg.layer_norm_epsilon, vb.pp("final_layer_norm"))?;

        Ok(Self {
            embed_tokens,
            blocks,
            final_layer_norm,
            dropout: Dropout::new(cfg.dropout_rate),
            is_decoder,
            training: false,
            checkpointer: None,
        })
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_decoder(&self) -> bool {
        self.is_decoder
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Dropout is active only in training mode.
    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    /// Route blocks through `checkpointer` while training.
    pub fn enable_gradient_checkpointing(&mut self, checkpointer: Box<dyn GradientCheckpointing>) {
        self.checkpointer = Some(checkpointer);
    }

    pub fn disable_gradient_checkpointing(&mut self) {
        self.checkpointer = None;
    }

    pub fn gradient_checkpointing(&self) -> bool {
        self.checkpointer.is_some()
    }

    pub fn embed_tokens(&self) -> Option<&Embedding> {
        self.embed_tokens.as_ref()
    }

    pub fn set_embed_tokens(&mut self, embed_tokens: Option<Embedding>) {
        self.embed_tokens = embed_tokens;
    }
}

// ─── Full T5 Models ────────────────────────────────────────────────────────

fn shared_embeddings(cfg: &T5Config, vb: &VarBuilder) -> Result<Embedding> {
    embedding(cfg.vocab_size, cfg.d_model, vb.pp("shared"))
}

/// Encoder-only T5.
pub struct T5EncoderModel {
    pub(crate) shared: Embedding,
    pub(crate) encoder: T5Stack,
    pub(crate) config: T5Config,
}

impl T5EncoderModel {
    pub fn new(cfg: &T5Config, vb: VarBuilder) -> Result<Self> {
        let shared = shared_embeddings(cfg, &vb)?;
        let encoder = T5Stack::new(cfg, false, Some(shared.clone()), vb.pp("encoder"))?;
        Ok(Self {
            shared,
            encoder,
            config: cfg.clone(),
        })
    }

    pub fn config(&self) -> &T5Config {
        &self.config
    }

    pub fn shared(&self) -> &Embedding {
        &self.shared
    }

    pub fn encoder(&self) -> &T5Stack {
        &self.encoder
    }

    pub fn encoder_mut(&mut self) -> &mut T5Stack {
        &mut self.encoder
    }

    pub fn set_training(&mut self, training: bool) {
        self.encoder.set_training(training);
    }
}

/// Bare T5 encoder-decoder without a language modelling head.
pub struct T5Model {
    pub(crate) shared: Embedding,
    pub(crate) encoder: T5Stack,
    pub(crate) decoder: T5Stack,
    pub(crate) config: T5Config,
}

impl T5Model {
    pub fn new(cfg: &T5Config, vb: VarBuilder) -> Result<Self> {
        let shared = shared_embeddings(cfg, &vb)?;
        let encoder = T5Stack::new(cfg, false, Some(shared.clone()), vb.pp("encoder"))?;
        let decoder = T5Stack::new(cfg, true, Some(shared.clone()), vb.pp("decoder"))?;
        Ok(Self {
            shared,
            encoder,
            decoder,
            config: cfg.clone(),
        })
    }

    pub fn config(&self) -> &T5Config {
        &self.config
    }

    pub fn shared(&self) -> &Embedding {
        &self.shared
    }

    pub fn encoder(&self) -> &T5Stack {
        &self.encoder
    }

    pub fn encoder_mut(&mut self) -> &mut T5Stack {
        &mut self.encoder
    }

    pub fn decoder(&self) -> &T5Stack {
        &self.decoder
    }

    pub fn decoder_mut(&mut self) -> &mut T5Stack {
        &mut self.decoder
    }

    pub fn set_training(&mut self, training: bool) {
        self.encoder.set_training(training);
        self.decoder.set_training(training);
    }
}

/// T5 encoder-decoder model for conditional generation.
pub struct T5ForConditionalGeneration {
    pub(crate) shared: Embedding,
    pub(crate) encoder: T5Stack,
    pub(crate) decoder: T5Stack,
    pub(crate) lm_head: Linear,
    pub(crate) config: T5Config,
}

impl T5ForConditionalGeneration {
    pub fn new(cfg: &T5Config, vb: VarBuilder) -> Result<Self> {
        let shared = shared_embeddings(cfg, &vb)?;
        let encoder = T5Stack::new(cfg, false, Some(shared.clone()), vb.pp("encoder"))?;
        let decoder = T5Stack::new(cfg, true, Some(shared.clone()), vb.pp("decoder"))?;

        // LM head (often tied to shared embeddings)
        let lm_head = if cfg.tie_word_embeddings {
            Linear::new(shared.embeddings().clone(), None)
        } else {
            linear_no_bias(cfg.d_model, cfg.vocab_size, vb.pp("lm_head"))?
        };

        Ok(Self {
            shared,
            encoder,
            decoder,
            lm_head,
            config: cfg.clone(),
        })
    }

    pub fn config(&self) -> &T5Config {
        &self.config
    }

    pub fn shared(&self) -> &Embedding {
        &self.shared
    }

    pub fn encoder(&self) -> &T5Stack {
        &self.encoder
    }

    pub fn encoder_mut(&mut self) -> &mut T5Stack {
        &mut self.encoder
    }

    pub fn decoder(&self) -> &T5Stack {
        &self.decoder
    }

    pub fn decoder_mut(&mut self) -> &mut T5Stack {
        &mut self.decoder
    }

    pub fn lm_head(&self) -> &Linear {
        &self.lm_head
    }

    pub fn set_training(&mut self, training: bool) {
        self.encoder.set_training(training);
        self.decoder.set_training(training);
    }
}

// ─── Tests ─────────────────────────────────────────────────────────────────
