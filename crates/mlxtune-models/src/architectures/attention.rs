//! Grouped-query attention shared by both model families.

use mlx_rs::{
    builder::Builder,
    error::Exception,
    fast::{scaled_dot_product_attention, ScaledDotProductAttentionMask},
    macros::ModuleParameters,
    nn, Array,
};
use mlxtune_nn::{KvCache, Projection};

use crate::ModelArgs;

/// Multi-head attention with rotary position embeddings and optional KV
/// caching. All four projections are rewritable [`Projection`] slots.
#[derive(Debug, ModuleParameters)]
pub struct Attention {
    /// Number of attention heads.
    pub n_heads: i32,
    /// Number of key-value heads.
    pub n_kv_heads: i32,
    /// Head dimension.
    pub head_dim: i32,
    /// Attention scale factor.
    pub scale: f32,
    /// RoPE base frequency.
    pub rope_theta: f32,

    /// Query projection.
    #[param]
    pub q_proj: Projection,
    /// Key projection.
    #[param]
    pub k_proj: Projection,
    /// Value projection.
    #[param]
    pub v_proj: Projection,
    /// Output projection.
    #[param]
    pub o_proj: Projection,
}

impl Attention {
    /// Create a new attention layer.
    pub fn new(args: &ModelArgs) -> Result<Self, Exception> {
        let n_heads = args.num_attention_heads;
        let n_kv_heads = args.num_kv_heads();
        let head_dim = args.get_head_dim();
        let scale = (head_dim as f32).sqrt().recip();

        let linear = |input_dims: i32, output_dims: i32| -> Result<Projection, Exception> {
            Ok(Projection::Linear(
                nn::LinearBuilder::new(input_dims, output_dims)
                    .bias(false)
                    .build()?,
            ))
        };

        Ok(Self {
            n_heads,
            n_kv_heads,
            head_dim,
            scale,
            rope_theta: args.rope_theta,
            q_proj: linear(args.hidden_size, n_heads * head_dim)?,
            k_proj: linear(args.hidden_size, n_kv_heads * head_dim)?,
            v_proj: linear(args.hidden_size, n_kv_heads * head_dim)?,
            o_proj: linear(n_heads * head_dim, args.hidden_size)?,
        })
    }

    /// Forward pass with an optional KV cache.
    ///
    /// With a cache, RoPE positions are offset by the number of tokens the
    /// layer has already cached and new key/value tensors are appended, so
    /// only the incoming tokens need processing.
    pub fn forward_with_cache(
        &mut self,
        x: &Array,
        mask: Option<&Array>,
        cache: Option<(&mut KvCache, usize)>,
    ) -> Result<Array, Exception> {
        let shape = x.shape();
        let batch = shape[0];
        let seq_len = shape[1];

        let queries = self.q_proj.forward(x)?;
        let keys = self.k_proj.forward(x)?;
        let values = self.v_proj.forward(x)?;

        // [B, L, heads * head_dim] -> [B, heads, L, head_dim]
        let queries = queries
            .reshape(&[batch, seq_len, self.n_heads, self.head_dim])?
            .transpose_axes(&[0, 2, 1, 3])?;
        let keys = keys
            .reshape(&[batch, seq_len, self.n_kv_heads, self.head_dim])?
            .transpose_axes(&[0, 2, 1, 3])?;
        let values = values
            .reshape(&[batch, seq_len, self.n_kv_heads, self.head_dim])?
            .transpose_axes(&[0, 2, 1, 3])?;

        let offset = match &cache {
            Some((cache, layer_idx)) => cache.layer_offset(*layer_idx),
            None => 0,
        };
        let queries = mlx_rs::fast::rope(
            &queries,
            self.head_dim,
            false,
            self.rope_theta,
            1.0,
            offset,
            None,
        )?;
        let keys = mlx_rs::fast::rope(
            &keys,
            self.head_dim,
            false,
            self.rope_theta,
            1.0,
            offset,
            None,
        )?;

        let (keys, values) = match cache {
            Some((cache, layer_idx)) => cache.update_and_fetch(layer_idx, &keys, &values)?,
            None => (keys, values),
        };

        // The fused kernel handles GQA natively; no KV head expansion.
        let output = match mask {
            Some(mask) => scaled_dot_product_attention(&queries, &keys, &values, self.scale, mask)?,
            None if seq_len > 1 => scaled_dot_product_attention(
                &queries,
                &keys,
                &values,
                self.scale,
                ScaledDotProductAttentionMask::Causal,
            )?,
            None => scaled_dot_product_attention(
                &queries,
                &keys,
                &values,
                self.scale,
                Option::<ScaledDotProductAttentionMask>::None,
            )?,
        };

        // [B, heads, L, head_dim] -> [B, L, hidden]
        let output = output
            .transpose_axes(&[0, 2, 1, 3])?
            .reshape(&[batch, seq_len, -1])?;

        self.o_proj.forward(&output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn small_args() -> ModelArgs {
        serde_json::from_str(
            r#"{
                "vocab_size": 100,
                "hidden_size": 64,
                "intermediate_size": 128,
                "num_hidden_layers": 2,
                "num_attention_heads": 4,
                "num_key_value_heads": 2
            }"#,
        )
        .unwrap()
    }

    #[test]
    #[serial]
    fn test_attention_shapes() {
        let args = small_args();
        let mut attn = Attention::new(&args).unwrap();

        let x = mlx_rs::random::normal::<f32>(&[1, 4, 64], None, None, None).unwrap();
        let output = attn.forward_with_cache(&x, None, None).unwrap();

        assert_eq!(output.shape(), &[1, 4, 64]);
    }

    #[test]
    #[serial]
    fn test_attention_with_cache() {
        let args = small_args();
        let mut attn = Attention::new(&args).unwrap();
        let mut cache = KvCache::new(1);

        let x = mlx_rs::random::normal::<f32>(&[1, 3, 64], None, None, None).unwrap();
        attn.forward_with_cache(&x, None, Some((&mut cache, 0))).unwrap();
        assert_eq!(cache.layer_offset(0), 3);

        let x1 = mlx_rs::random::normal::<f32>(&[1, 1, 64], None, None, None).unwrap();
        let out = attn
            .forward_with_cache(&x1, None, Some((&mut cache, 0)))
            .unwrap();
        assert_eq!(out.shape(), &[1, 1, 64]);
        assert_eq!(cache.layer_offset(0), 4);
    }
}
