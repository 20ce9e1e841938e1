//! Llama-family dense decoder.
//!
//! Serves the `llama` and `mistral` model tags; the two share the same
//! module tree.

use mlx_rs::{
    builder::Builder,
    error::Exception,
    macros::ModuleParameters,
    module::Module,
    nn, Array,
};
use mlxtune_nn::{KvCache, Projection};

use super::{Attention, ProjectionVisitor};
use crate::ModelArgs;

/// SwiGLU feed-forward block.
#[derive(Debug, ModuleParameters)]
pub struct Mlp {
    /// Gate projection.
    #[param]
    pub gate_proj: Projection,
    /// Up projection.
    #[param]
    pub up_proj: Projection,
    /// Down projection.
    #[param]
    pub down_proj: Projection,
}

impl Mlp {
    /// Create a new feed-forward block.
    pub fn new(hidden_size: i32, intermediate_size: i32) -> Result<Self, Exception> {
        let linear = |input_dims: i32, output_dims: i32| -> Result<Projection, Exception> {
            Ok(Projection::Linear(
                nn::LinearBuilder::new(input_dims, output_dims)
                    .bias(false)
                    .build()?,
            ))
        };

        Ok(Self {
            gate_proj: linear(hidden_size, intermediate_size)?,
            up_proj: linear(hidden_size, intermediate_size)?,
            down_proj: linear(intermediate_size, hidden_size)?,
        })
    }

    /// Forward pass: `down(silu(gate(x)) * up(x))`.
    pub fn forward(&mut self, x: &Array) -> Result<Array, Exception> {
        let gate = self.gate_proj.forward(x)?;
        let gate = nn::silu(gate)?;
        let up = self.up_proj.forward(x)?;
        let hidden = gate.multiply(&up)?;
        self.down_proj.forward(&hidden)
    }
}

/// One decoder layer: pre-norm attention and pre-norm MLP with residuals.
#[derive(Debug, ModuleParameters)]
pub struct DecoderLayer {
    /// Self-attention.
    #[param]
    pub self_attn: Attention,
    /// Feed-forward block.
    #[param]
    pub mlp: Mlp,
    /// Input layer norm.
    #[param]
    pub input_layernorm: nn::RmsNorm,
    /// Post-attention layer norm.
    #[param]
    pub post_attention_layernorm: nn::RmsNorm,
}

impl DecoderLayer {
    /// Create a new decoder layer.
    pub fn new(args: &ModelArgs) -> Result<Self, Exception> {
        Ok(Self {
            self_attn: Attention::new(args)?,
            mlp: Mlp::new(args.hidden_size, args.intermediate_size)?,
            input_layernorm: nn::RmsNormBuilder::new(args.hidden_size)
                .eps(args.rms_norm_eps)
                .build()?,
            post_attention_layernorm: nn::RmsNormBuilder::new(args.hidden_size)
                .eps(args.rms_norm_eps)
                .build()?,
        })
    }

    /// Forward pass with an optional KV cache.
    pub fn forward_with_cache(
        &mut self,
        x: &Array,
        mask: Option<&Array>,
        cache: Option<(&mut KvCache, usize)>,
    ) -> Result<Array, Exception> {
        let normed = Module::forward(&mut self.input_layernorm, x)?;
        let attn_out = self.self_attn.forward_with_cache(&normed, mask, cache)?;
        let h = x.add(&attn_out)?;

        let normed = Module::forward(&mut self.post_attention_layernorm, &h)?;
        let mlp_out = self.mlp.forward(&normed)?;
        h.add(&mlp_out)
    }
}

/// Llama-family decoder with LM head.
#[derive(Debug, ModuleParameters)]
pub struct Llama {
    /// Token embeddings.
    #[param]
    pub embed_tokens: nn::Embedding,
    /// Decoder layers.
    #[param]
    pub layers: Vec<DecoderLayer>,
    /// Final layer norm.
    #[param]
    pub norm: nn::RmsNorm,
    /// Output projection to the vocabulary.
    #[param]
    pub lm_head: Projection,
}

impl Llama {
    /// Create a new model from its hyperparameters.
    pub fn new(args: &ModelArgs) -> Result<Self, Exception> {
        let embed_tokens = nn::Embedding::new(args.vocab_size, args.hidden_size)?;

        let layers = (0..args.num_hidden_layers)
            .map(|_| DecoderLayer::new(args))
            .collect::<Result<Vec<_>, _>>()?;

        let norm = nn::RmsNormBuilder::new(args.hidden_size)
            .eps(args.rms_norm_eps)
            .build()?;

        let lm_head = Projection::Linear(
            nn::LinearBuilder::new(args.hidden_size, args.vocab_size)
                .bias(false)
                .build()?,
        );

        Ok(Self {
            embed_tokens,
            layers,
            norm,
            lm_head,
        })
    }

    /// Number of decoder layers.
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Forward pass producing logits `[batch, seq, vocab]`.
    pub fn forward_with_cache(
        &mut self,
        input_ids: &Array,
        mask: Option<&Array>,
        mut cache: Option<&mut KvCache>,
    ) -> Result<Array, Exception> {
        let mut hidden = Module::forward(&mut self.embed_tokens, input_ids)?;

        for (layer_idx, layer) in self.layers.iter_mut().enumerate() {
            let layer_cache = cache.as_deref_mut().map(|c| (c, layer_idx));
            hidden = layer.forward_with_cache(&hidden, mask, layer_cache)?;
        }

        let hidden = Module::forward(&mut self.norm, &hidden)?;
        self.lm_head.forward(&hidden)
    }

    /// Walk every projection slot with its dotted path name.
    pub fn visit_projections(&mut self, visit: &mut ProjectionVisitor<'_>) -> Result<(), Exception> {
        for (i, layer) in self.layers.iter_mut().enumerate() {
            visit(
                &format!("layers.{i}.self_attn.q_proj"),
                &mut layer.self_attn.q_proj,
            )?;
            visit(
                &format!("layers.{i}.self_attn.k_proj"),
                &mut layer.self_attn.k_proj,
            )?;
            visit(
                &format!("layers.{i}.self_attn.v_proj"),
                &mut layer.self_attn.v_proj,
            )?;
            visit(
                &format!("layers.{i}.self_attn.o_proj"),
                &mut layer.self_attn.o_proj,
            )?;
            visit(&format!("layers.{i}.mlp.gate_proj"), &mut layer.mlp.gate_proj)?;
            visit(&format!("layers.{i}.mlp.up_proj"), &mut layer.mlp.up_proj)?;
            visit(&format!("layers.{i}.mlp.down_proj"), &mut layer.mlp.down_proj)?;
        }
        visit("lm_head", &mut self.lm_head)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn small_args() -> ModelArgs {
        serde_json::from_str(
            r#"{
                "model_type": "llama",
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
    fn test_llama_forward_shape() {
        let args = small_args();
        let mut model = Llama::new(&args).unwrap();

        let input_ids = Array::from_slice(&[1_i32, 2, 3, 4], &[1, 4]);
        let logits = model.forward_with_cache(&input_ids, None, None).unwrap();

        assert_eq!(logits.shape(), &[1, 4, 100]);
    }

    #[test]
    #[serial]
    fn test_llama_projection_walk() {
        let args = small_args();
        let mut model = Llama::new(&args).unwrap();

        let mut paths = Vec::new();
        model
            .visit_projections(&mut |path, slot| {
                assert!(slot.is_linear());
                paths.push(path.to_string());
                Ok(())
            })
            .unwrap();

        // 7 projections per layer, 2 layers, plus the LM head
        assert_eq!(paths.len(), 15);
        assert!(paths.contains(&"layers.0.self_attn.q_proj".to_string()));
        assert!(paths.contains(&"layers.1.mlp.down_proj".to_string()));
        assert!(paths.contains(&"lm_head".to_string()));
    }

    #[test]
    #[serial]
    fn test_llama_cached_decode() {
        let args = small_args();
        let mut model = Llama::new(&args).unwrap();
        let mut cache = KvCache::new(model.num_layers());

        let prompt = Array::from_slice(&[1_i32, 2, 3], &[1, 3]);
        let logits = model
            .forward_with_cache(&prompt, None, Some(&mut cache))
            .unwrap();
        assert_eq!(logits.shape(), &[1, 3, 100]);

        let step = Array::from_slice(&[4_i32], &[1, 1]);
        let logits = model
            .forward_with_cache(&step, None, Some(&mut cache))
            .unwrap();
        assert_eq!(logits.shape(), &[1, 1, 100]);
    }
}
