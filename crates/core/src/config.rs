use candle_nn::Activation;
use serde::Deserialize;

/// Generic HF-style `config.json`. Architecture-specific keys land in `extra`.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub architectures: Vec<String>,
    pub hidden_size: usize,
    pub num_attention_heads: usize,
    pub num_hidden_layers: usize,
    pub intermediate_size: usize,
    pub vocab_size: usize,
    #[serde(default)]
    pub tie_word_embeddings: bool,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ModelConfig {
    fn extra_usize(&self, key: &str) -> Option<usize> {
        self.extra.get(key).and_then(|v| v.as_u64()).map(|v| v as usize)
    }

    fn extra_f64(&self, key: &str) -> Option<f64> {
        self.extra.get(key).and_then(|v| v.as_f64())
    }

    fn extra_bool(&self, key: &str) -> Option<bool> {
        self.extra.get(key).and_then(|v| v.as_bool())
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            architectures: vec!["T5ForConditionalGeneration".to_string()],
            hidden_size: 512,
            num_attention_heads: 8,
            num_hidden_layers: 6,
            intermediate_size: 2048,
            vocab_size: 32128,
            tie_word_embeddings: true,
            extra: serde_json::Map::new(),
        }
    }
}

/// T5 configuration as found in a HF T5 `config.json`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct T5Config {
    pub vocab_size: usize,
    pub d_model: usize,
    pub d_kv: usize,
    pub d_ff: usize,
    pub num_layers: usize,
    /// Defaults to `num_layers` when absent.
    #[serde(default)]
    pub num_decoder_layers: Option<usize>,
    pub num_heads: usize,
    #[serde(default = "default_num_buckets")]
    pub relative_attention_num_buckets: usize,
    #[serde(default = "default_max_distance")]
    pub relative_attention_max_distance: usize,
    #[serde(default = "default_dropout_rate")]
    pub dropout_rate: f32,
    #[serde(default = "default_layer_norm_epsilon")]
    pub layer_norm_epsilon: f64,
    #[serde(default)]
    pub is_gated_act: bool,
    #[serde(default = "default_dense_act_fn")]
    pub dense_act_fn: Activation,
    #[serde(default = "default_true")]
    pub tie_word_embeddings: bool,
    #[serde(default = "default_true")]
    pub use_cache: bool,
    #[serde(default)]
    pub decoder_start_token_id: u32,
    #[serde(default)]
    pub pad_token_id: u32,
}

fn default_num_buckets() -> usize {
    32
}

fn default_max_distance() -> usize {
    128
}

fn default_dropout_rate() -> f32 {
    0.1
}

fn default_layer_norm_epsilon() -> f64 {
    1e-6
}

fn default_dense_act_fn() -> Activation {
    Activation::Relu
}

fn default_true() -> bool {
    true
}

impl T5Config {
    pub fn num_decoder_layers(&self) -> usize {
        self.num_decoder_layers.unwrap_or(self.num_layers)
    }

    pub fn inner_dim(&self) -> usize {
        self.num_heads * self.d_kv
    }

    /// Build from a generic config, reading T5-specific keys from `extra`.
    pub fn from_model_config(cfg: &ModelConfig) -> Self {
        Self {
            vocab_size: cfg.vocab_size,
            d_model: cfg.hidden_size,
            d_kv: cfg
                .extra_usize("d_kv")
                .unwrap_or(cfg.hidden_size / cfg.num_attention_heads.max(1)),
            d_ff: cfg.extra_usize("d_ff").unwrap_or(cfg.intermediate_size),
            num_layers: cfg.num_hidden_layers,
            num_decoder_layers: cfg.extra_usize("num_decoder_layers"),
            num_heads: cfg.num_attention_heads,
            relative_attention_num_buckets: cfg
                .extra_usize("relative_attention_num_buckets")
                .unwrap_or_else(default_num_buckets),
            relative_attention_max_distance: cfg
                .extra_usize("relative_attention_max_distance")
                .unwrap_or_else(default_max_distance),
            dropout_rate: cfg
                .extra_f64("dropout_rate")
                .map(|v| v as f32)
                .unwrap_or_else(default_dropout_rate),
            layer_norm_epsilon: cfg
                .extra_f64("layer_norm_epsilon")
                .unwrap_or_else(default_layer_norm_epsilon),
            is_gated_act: cfg.extra_bool("is_gated_act").unwrap_or(false),
            dense_act_fn: cfg
                .extra
                .get("dense_act_fn")
                .and_then(|v| serde_json::from_value(v.clone()).ok())
                .unwrap_or_else(default_dense_act_fn),
            tie_word_embeddings: cfg.tie_word_embeddings,
            use_cache: cfg.extra_bool("use_cache").unwrap_or(true),
            decoder_start_token_id: cfg.extra_usize("decoder_start_token_id").unwrap_or(0) as u32,
            pad_token_id: cfg.extra_usize("pad_token_id").unwrap_or(0) as u32,
        }
    }
}
