use candle_nn::Activation;

use crate::config::T5Config;

/// Tiny gated T5 config for testing (2+2 blocks, 64 hidden, 2 heads).
/// Uses < 1MB of parameters. Dropout is zero so outputs are deterministic
/// even in training mode.
pub fn tiny_t5_config() -> T5Config {
    T5Config {
        vocab_size: 256,
        d_model: 64,
        d_kv: 32,
        d_ff: 128,
        num_layers: 2,
        num_decoder_layers: Some(2),
        num_heads: 2,
        relative_attention_num_buckets: 32,
        relative_attention_max_distance: 128,
        dropout_rate: 0.0,
        layer_norm_epsilon: 1e-6,
        is_gated_act: true,
        dense_act_fn: Activation::NewGelu,
        tie_word_embeddings: true,
        use_cache: false,
        decoder_start_token_id: 0,
        pad_token_id: 0,
    }
}

/// Tiny T5 v1.0 config (standard ReLU FFN).
pub fn tiny_t5_standard_config() -> T5Config {
    T5Config {
        is_gated_act: false,
        dense_act_fn: Activation::Relu,
        ..tiny_t5_config()
    }
}

/// Tiny config with one encoder and one decoder block, the smallest model a
/// two-stage pipeline can split.
pub fn tiny_t5_single_block_config() -> T5Config {
    T5Config {
        num_layers: 1,
        num_decoder_layers: Some(1),
        ..tiny_t5_config()
    }
}
