//! Group-quantized linear layer.
//!
//! Stores a packed low-bit weight matrix together with per-group scales and
//! biases, and computes the projection with MLX's quantized matmul. The
//! quantization kernels themselves live in the MLX runtime; this module only
//! wires them into a layer.

use mlx_rs::{error::Exception, macros::ModuleParameters, module::Param, nn, Array};

/// Linear layer with group-quantized weights.
///
/// All parameters are frozen at construction: a quantized layer is never
/// trained directly, only wrapped by a LoRA adapter.
#[derive(Debug, ModuleParameters)]
pub struct QuantizedLinear {
    /// Group size used for quantization.
    pub group_size: i32,
    /// Bits per weight.
    pub bits: i32,

    /// Packed quantized weight `[output_dims, input_dims * bits / 32]`.
    #[param]
    pub weight: Param<Array>,
    /// Per-group scales.
    #[param]
    pub scales: Param<Array>,
    /// Per-group zero-point biases.
    #[param]
    pub biases: Param<Array>,
    /// Optional bias `[output_dims]`, kept in full precision.
    #[param]
    pub bias: Param<Option<Array>>,
}

impl QuantizedLinear {
    /// Quantize an existing linear layer.
    pub fn from_linear(linear: &nn::Linear, group_size: i32, bits: i32) -> Result<Self, Exception> {
        Self::from_weight(
            linear.weight.as_ref(),
            linear.bias.value.as_ref(),
            group_size,
            bits,
        )
    }

    /// Quantize a full-precision weight matrix `[output_dims, input_dims]`.
    pub fn from_weight(
        weight: &Array,
        bias: Option<&Array>,
        group_size: i32,
        bits: i32,
    ) -> Result<Self, Exception> {
        use mlx_rs::module::ModuleParameters;

        let (quantized, scales, biases) = mlx_rs::ops::quantize(weight, group_size, bits)?;

        let mut layer = Self {
            group_size,
            bits,
            weight: Param::new(quantized),
            scales: Param::new(scales),
            biases: Param::new(biases),
            bias: Param::new(bias.cloned()),
        };
        layer.freeze_parameters(true);

        Ok(layer)
    }

    /// Input dimension, corrected for the `32 / bits` packing factor.
    pub fn input_dims(&self) -> i32 {
        self.weight.as_ref().dim(-1) * (32 / self.bits)
    }

    /// Output dimension.
    pub fn output_dims(&self) -> i32 {
        self.weight.as_ref().dim(-2)
    }

    /// Whether the layer carries a bias.
    pub fn has_bias(&self) -> bool {
        self.bias.value.is_some()
    }

    /// Reconstruct the full-precision weight via the inverse quantization
    /// transform.
    pub fn dequantized_weight(&self) -> Result<Array, Exception> {
        mlx_rs::ops::dequantize(
            self.weight.as_ref(),
            self.scales.as_ref(),
            self.biases.as_ref(),
            self.group_size,
            self.bits,
        )
    }

    /// Forward pass through the quantized projection.
    pub fn forward(&self, x: &Array) -> Result<Array, Exception> {
        let y = mlx_rs::ops::quantized_matmul(
            x,
            self.weight.as_ref(),
            self.scales.as_ref(),
            self.biases.as_ref(),
            true,
            self.group_size,
            self.bits,
        )?;

        if let Some(ref bias) = self.bias.value {
            y.add(bias)
        } else {
            Ok(y)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlx_rs::builder::Builder;
    use mlx_rs::module::ModuleParameters;
    use serial_test::serial;

    fn test_linear(input_dims: i32, output_dims: i32) -> nn::Linear {
        nn::LinearBuilder::new(input_dims, output_dims)
            .bias(false)
            .build()
            .unwrap()
    }

    #[test]
    #[serial]
    fn test_quantized_dims() {
        let linear = test_linear(64, 128);
        let quantized = QuantizedLinear::from_linear(&linear, 64, 4).unwrap();

        assert_eq!(quantized.input_dims(), 64);
        assert_eq!(quantized.output_dims(), 128);
        assert!(!quantized.has_bias());
        // 4-bit packing: 8 weights per u32
        assert_eq!(quantized.weight.as_ref().dim(-1), 64 / 8);
    }

    #[test]
    #[serial]
    fn test_quantized_forward_shape() {
        let linear = test_linear(64, 128);
        let quantized = QuantizedLinear::from_linear(&linear, 64, 4).unwrap();

        let x = mlx_rs::random::normal::<f32>(&[2, 4, 64], None, None, None).unwrap();
        let y = quantized.forward(&x).unwrap();

        assert_eq!(y.shape(), &[2, 4, 128]);
    }

    #[test]
    #[serial]
    fn test_quantize_dequantize_round_trip() {
        // Lossy round trip, bounded by the group size / bit width
        let linear = test_linear(128, 64);
        let weight = linear.weight.as_ref().clone();

        let quantized = QuantizedLinear::from_linear(&linear, 64, 8).unwrap();
        let restored = quantized.dequantized_weight().unwrap();

        assert_eq!(restored.shape(), weight.shape());

        let diff = weight.subtract(&restored).unwrap();
        let max_err = diff.abs().unwrap().max(None).unwrap();
        max_err.eval().unwrap();
        assert!(max_err.item::<f32>() < 0.05, "max error {}", max_err.item::<f32>());
    }

    #[test]
    #[serial]
    fn test_quantized_params_frozen() {
        let linear = test_linear(64, 32);
        let quantized = QuantizedLinear::from_linear(&linear, 64, 4).unwrap();

        assert!(quantized.trainable_parameters().flatten().is_empty());
    }
}
