//! Model architecture hyperparameters.

use serde::{Deserialize, Serialize};

/// Architecture hyperparameters, keyed by the `model_type` family tag.
///
/// Immutable once constructed; owned by the model wrapper. Loaded from a
/// `config.json` next to the weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArgs {
    /// Model family tag (`llama`, `mistral`, or `mixtral`).
    #[serde(default = "default_model_type")]
    pub model_type: String,
    /// Vocabulary size.
    pub vocab_size: i32,
    /// Hidden dimension.
    pub hidden_size: i32,
    /// MLP intermediate size.
    pub intermediate_size: i32,
    /// Number of decoder layers.
    pub num_hidden_layers: i32,
    /// Number of attention heads.
    pub num_attention_heads: i32,
    /// Number of key-value heads (GQA); defaults to `num_attention_heads`.
    #[serde(default)]
    pub num_key_value_heads: Option<i32>,
    /// Head dimension; computed from the hidden size if absent.
    #[serde(default)]
    pub head_dim: Option<i32>,
    /// RMS normalization epsilon.
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f32,
    /// RoPE base frequency.
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f32,
    /// Number of experts (mixtral family).
    #[serde(default)]
    pub num_experts: Option<i32>,
    /// Experts activated per token (mixtral family).
    #[serde(default)]
    pub num_experts_per_tok: Option<i32>,
}

fn default_model_type() -> String {
    "llama".to_string()
}
fn default_rms_norm_eps() -> f32 {
    1e-5
}
fn default_rope_theta() -> f32 {
    10000.0
}

impl ModelArgs {
    /// Number of KV heads, defaulting to the attention head count.
    pub fn num_kv_heads(&self) -> i32 {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    /// Head dimension, computed from the hidden size if not set explicitly.
    pub fn get_head_dim(&self) -> i32 {
        self.head_dim
            .unwrap_or(self.hidden_size / self.num_attention_heads)
    }
}
