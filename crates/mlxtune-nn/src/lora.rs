//! Linear layer with a trainable low-rank correction.
//!
//! A [`LoraLinear`] wraps one pretrained projection (plain or quantized)
//! with two low-rank factor matrices:
//!
//! `y = base(x) + scale * (dropout(x) @ A) @ B`
//!
//! `A` is initialized uniformly in `[-1/sqrt(input_dims), 1/sqrt(input_dims)]`
//! and `B` to zeros, so a freshly wrapped layer computes exactly the base
//! projection until training updates `B`. Dropout regularizes only the
//! low-rank path.

use mlx_rs::{
    error::Exception,
    macros::ModuleParameters,
    module::{Module, Param},
    nn, Array, Dtype,
};

use crate::{projection::linear_from_parts, Projection, QuantizedLinear};

/// Linear projection augmented with trainable LoRA factors.
#[derive(Debug, ModuleParameters)]
pub struct LoraLinear {
    /// Input dimension of the wrapped projection.
    pub input_dims: i32,
    /// Output dimension of the wrapped projection.
    pub output_dims: i32,
    /// LoRA rank.
    pub rank: i32,
    /// Effective scaling factor (`scale * alpha / rank`).
    pub scale: f32,

    /// Frozen base projection.
    #[param]
    pub linear: Projection,
    /// Low-rank factor `[input_dims, rank]` - trainable.
    #[param]
    pub lora_a: Param<Array>,
    /// Low-rank factor `[rank, output_dims]` - trainable.
    #[param]
    pub lora_b: Param<Array>,

    /// Dropout on the low-rank path.
    dropout: nn::Dropout,
}

impl LoraLinear {
    /// Wrap an existing projection with a fresh adapter.
    ///
    /// The base layer is copied into the adapter and frozen; the adapter
    /// factors are the only trainable parameters of the resulting layer.
    pub fn from_projection(
        base: &Projection,
        rank: i32,
        alpha: f32,
        dropout: f32,
        scale: f32,
    ) -> Result<Self, Exception> {
        use mlx_rs::module::ModuleParameters;

        if base.is_adapted() {
            return Err(Exception::custom("projection is already LoRA-adapted"));
        }

        let (input_dims, output_dims) = base.shape();

        let mut linear = base.clone_base()?;
        linear.freeze_parameters(true);

        let bound = 1.0 / (input_dims as f32).sqrt();
        let lora_a =
            mlx_rs::random::uniform::<_, f32>(-bound, bound, &[input_dims, rank], None)?;
        let lora_b = mlx_rs::ops::zeros::<f32>(&[rank, output_dims])?;

        let dropout = nn::DropoutBuilder::new().p(dropout).build()?;

        Ok(Self {
            input_dims,
            output_dims,
            rank,
            scale: scale * alpha / rank as f32,
            linear,
            lora_a: Param::new(lora_a),
            lora_b: Param::new(lora_b),
            dropout,
        })
    }

    /// Number of trainable adapter parameters.
    pub fn lora_size(&self) -> usize {
        self.lora_a.as_ref().size() + self.lora_b.as_ref().size()
    }

    /// Toggle training mode for the dropout on the low-rank path.
    pub fn set_training(&mut self, mode: bool) {
        self.dropout.training_mode(mode);
    }

    /// Forward pass: base projection plus scaled low-rank correction.
    pub fn forward(&mut self, x: &Array) -> Result<Array, Exception> {
        // The base path runs in the wrapped layer's working precision.
        let dtype = self.linear.working_dtype();
        let y = self.linear.forward(&x.as_dtype(dtype)?)?;

        let dropped = Module::forward(&mut self.dropout, x)?;
        let z = dropped
            .matmul(self.lora_a.as_ref())?
            .matmul(self.lora_b.as_ref())?;

        y.add(&z.multiply(&Array::from_f32(self.scale))?)
    }

    /// Fold the low-rank correction permanently into the base weight and
    /// return the resulting plain or quantized layer.
    ///
    /// A quantized base is first dequantized, the correction added in full
    /// precision, and the result re-quantized with the original group size
    /// and bit width.
    pub fn merge(&self) -> Result<Projection, Exception> {
        let update = self
            .lora_a
            .as_ref()
            .matmul(self.lora_b.as_ref())?
            .t()
            .multiply(&Array::from_f32(self.scale))?;

        match &self.linear {
            Projection::Linear(linear) => {
                let weight = linear.weight.as_ref();
                let dtype = weight.dtype();
                let merged = weight.add(&update)?.as_dtype(dtype)?;
                let bias = linear.bias.value.clone();

                Ok(Projection::Linear(linear_from_parts(merged, bias)?))
            }
            Projection::Quantized(quantized) => {
                let weight = quantized.dequantized_weight()?;
                let merged = weight.add(&update)?.as_dtype(Dtype::Float16)?;
                let bias = quantized.bias.value.clone();

                Ok(Projection::Quantized(QuantizedLinear::from_weight(
                    &merged,
                    bias.as_ref(),
                    quantized.group_size,
                    quantized.bits,
                )?))
            }
            Projection::Lora(_) => Err(Exception::custom("cannot merge a nested adapter")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlx_rs::builder::Builder;
    use mlx_rs::module::ModuleParameters;
    use serial_test::serial;

    fn test_projection(input_dims: i32, output_dims: i32) -> Projection {
        Projection::Linear(
            nn::LinearBuilder::new(input_dims, output_dims)
                .bias(false)
                .build()
                .unwrap(),
        )
    }

    #[test]
    #[serial]
    fn test_zero_init_is_noop() {
        // With B initialized to zeros the adapter must reproduce the base
        // projection exactly.
        let mut base = test_projection(32, 64);
        let mut lora = LoraLinear::from_projection(&base, 8, 16.0, 0.0, 10.0).unwrap();

        let x = mlx_rs::random::normal::<f32>(&[2, 4, 32], None, None, None).unwrap();
        let wrapped = lora.forward(&x).unwrap();
        let plain = base.forward(&x).unwrap();

        let diff = wrapped.subtract(&plain).unwrap();
        let max_diff = diff.abs().unwrap().max(None).unwrap();
        max_diff.eval().unwrap();
        assert!(max_diff.item::<f32>() < 1e-6);
    }

    #[test]
    #[serial]
    fn test_scale_and_lora_size() {
        let base = test_projection(32, 64);
        let lora = LoraLinear::from_projection(&base, 8, 16.0, 0.05, 10.0).unwrap();

        // scale * alpha / rank = 10 * 16 / 8 = 20
        assert!((lora.scale - 20.0).abs() < 1e-6);
        // A (32 * 8) + B (8 * 64) = 256 + 512
        assert_eq!(lora.lora_size(), 768);
    }

    #[test]
    #[serial]
    fn test_only_factors_trainable() {
        let base = test_projection(32, 64);
        let lora = LoraLinear::from_projection(&base, 4, 8.0, 0.0, 1.0).unwrap();

        let trainable = lora.trainable_parameters().flatten();
        let mut names: Vec<String> = trainable.keys().map(|k| k.to_string()).collect();
        names.sort();
        assert_eq!(names, vec!["lora_a", "lora_b"]);
    }

    #[test]
    #[serial]
    fn test_merge_matches_manual_update() {
        let base = test_projection(16, 24);
        let mut lora = LoraLinear::from_projection(&base, 4, 8.0, 0.0, 2.0).unwrap();

        // Give B a non-zero value so the merge has an effect.
        let b = mlx_rs::random::normal::<f32>(&[4, 24], None, None, None).unwrap();
        lora.lora_b = Param::new(b);

        let merged = lora.merge().unwrap();
        let merged_weight = match &merged {
            Projection::Linear(linear) => linear.weight.as_ref().clone(),
            _ => panic!("expected plain linear after merging a plain base"),
        };

        let expected = match &lora.linear {
            Projection::Linear(linear) => {
                let update = lora
                    .lora_a
                    .as_ref()
                    .matmul(lora.lora_b.as_ref())
                    .unwrap()
                    .t()
                    .multiply(&Array::from_f32(lora.scale))
                    .unwrap();
                linear.weight.as_ref().add(&update).unwrap()
            }
            _ => unreachable!(),
        };

        let diff = merged_weight.subtract(&expected).unwrap();
        let max_diff = diff.abs().unwrap().max(None).unwrap();
        max_diff.eval().unwrap();
        assert!(max_diff.item::<f32>() < 1e-5);
    }

    #[test]
    #[serial]
    fn test_quantized_base_dims() {
        let linear = nn::LinearBuilder::new(64, 32)
            .bias(false)
            .build()
            .unwrap();
        let quantized = QuantizedLinear::from_linear(&linear, 64, 4).unwrap();
        let base = Projection::Quantized(quantized);

        let lora = LoraLinear::from_projection(&base, 8, 16.0, 0.0, 10.0).unwrap();

        // Packed input dimension corrected by 32 / bits
        assert_eq!(lora.input_dims, 64);
        assert_eq!(lora.output_dims, 32);
    }

    #[test]
    #[serial]
    fn test_wrap_adapted_fails() {
        let base = test_projection(8, 8);
        let lora = LoraLinear::from_projection(&base, 2, 4.0, 0.0, 1.0).unwrap();
        let adapted = Projection::Lora(Box::new(lora));

        assert!(LoraLinear::from_projection(&adapted, 2, 4.0, 0.0, 1.0).is_err());
    }
}
