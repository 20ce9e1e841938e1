//! Tagged-union projection slot.
//!
//! Every linear projection in a model tree is held as a [`Projection`], so
//! the quantize / dequantize / adapt / merge passes are explicit in-place
//! substitutions of one variant for another, with ownership of the replaced
//! layer always unambiguous.

use mlx_rs::{
    builder::Builder,
    error::Exception,
    module::{Module, ModuleParamMut, ModuleParamRef, ModuleParameters, Param},
    nn, Array, Dtype,
};

use crate::{LoraLinear, QuantizedLinear};

/// Build a plain linear layer from an explicit weight and optional bias.
pub(crate) fn linear_from_parts(
    weight: Array,
    bias: Option<Array>,
) -> Result<nn::Linear, Exception> {
    let output_dims = weight.dim(-2);
    let input_dims = weight.dim(-1);

    let mut linear = nn::LinearBuilder::new(input_dims, output_dims)
        .bias(bias.is_some())
        .build()?;
    linear.weight = Param::new(weight);
    linear.bias = Param::new(bias);

    Ok(linear)
}

/// One linear projection slot in the module tree.
#[derive(Debug)]
pub enum Projection {
    /// Full-precision linear layer.
    Linear(nn::Linear),
    /// Group-quantized linear layer.
    Quantized(QuantizedLinear),
    /// Linear layer wrapped with a trainable low-rank adapter.
    Lora(Box<LoraLinear>),
}

impl Projection {
    /// Whether this slot holds a plain linear layer.
    pub fn is_linear(&self) -> bool {
        matches!(self, Self::Linear(_))
    }

    /// Whether this slot holds a quantized linear layer.
    pub fn is_quantized(&self) -> bool {
        matches!(self, Self::Quantized(_))
    }

    /// Whether this slot holds a LoRA-wrapped layer.
    pub fn is_adapted(&self) -> bool {
        matches!(self, Self::Lora(_))
    }

    /// `(input_dims, output_dims)` of the projection, with the quantized
    /// packing factor already corrected for.
    pub fn shape(&self) -> (i32, i32) {
        match self {
            Self::Linear(linear) => {
                let weight = linear.weight.as_ref();
                (weight.dim(-1), weight.dim(-2))
            }
            Self::Quantized(quantized) => (quantized.input_dims(), quantized.output_dims()),
            Self::Lora(lora) => (lora.input_dims, lora.output_dims),
        }
    }

    /// The dtype the projection computes in: its weight dtype, or the
    /// quantization scale dtype when quantized.
    pub fn working_dtype(&self) -> Dtype {
        match self {
            Self::Linear(linear) => linear.weight.as_ref().dtype(),
            Self::Quantized(quantized) => quantized.scales.as_ref().dtype(),
            Self::Lora(lora) => lora.linear.working_dtype(),
        }
    }

    /// Forward pass through whichever layer currently occupies the slot.
    pub fn forward(&mut self, x: &Array) -> Result<Array, Exception> {
        match self {
            Self::Linear(linear) => Module::forward(linear, x),
            Self::Quantized(quantized) => quantized.forward(x),
            Self::Lora(lora) => lora.forward(x),
        }
    }

    /// Rebuild an owned copy of the base layer. Array handles are cheap to
    /// clone; the copy shares the underlying buffers.
    pub(crate) fn clone_base(&self) -> Result<Projection, Exception> {
        match self {
            Self::Linear(linear) => {
                let weight = linear.weight.as_ref().clone();
                let bias = linear.bias.value.clone();
                Ok(Self::Linear(linear_from_parts(weight, bias)?))
            }
            Self::Quantized(quantized) => {
                let mut copy = QuantizedLinear {
                    group_size: quantized.group_size,
                    bits: quantized.bits,
                    weight: Param::new(quantized.weight.as_ref().clone()),
                    scales: Param::new(quantized.scales.as_ref().clone()),
                    biases: Param::new(quantized.biases.as_ref().clone()),
                    bias: Param::new(quantized.bias.value.clone()),
                };
                copy.freeze_parameters(true);
                Ok(Self::Quantized(copy))
            }
            Self::Lora(_) => Err(Exception::custom("cannot copy an adapted projection")),
        }
    }

    /// Replace a plain linear layer with its quantized equivalent.
    /// No-op for slots that are not plain linear.
    pub fn quantize_in_place(&mut self, group_size: i32, bits: i32) -> Result<(), Exception> {
        if let Self::Linear(linear) = self {
            let quantized = QuantizedLinear::from_linear(linear, group_size, bits)?;
            *self = Self::Quantized(quantized);
        }
        Ok(())
    }

    /// Replace a quantized layer with a plain float16 linear rebuilt via
    /// the inverse quantization transform. No-op for other variants.
    pub fn dequantize_in_place(&mut self) -> Result<(), Exception> {
        if let Self::Quantized(quantized) = self {
            let weight = quantized
                .dequantized_weight()?
                .as_dtype(Dtype::Float16)?;
            let bias = quantized.bias.value.clone();
            *self = Self::Linear(linear_from_parts(weight, bias)?);
        }
        Ok(())
    }

    /// Wrap the current base layer with a fresh LoRA adapter.
    pub fn wrap_lora(
        &mut self,
        rank: i32,
        alpha: f32,
        dropout: f32,
        scale: f32,
    ) -> Result<(), Exception> {
        let lora = LoraLinear::from_projection(self, rank, alpha, dropout, scale)?;
        *self = Self::Lora(Box::new(lora));
        Ok(())
    }

    /// Merge an active adapter back into a plain or quantized layer.
    /// No-op for slots that are not adapted.
    pub fn merge_lora(&mut self) -> Result<(), Exception> {
        if let Self::Lora(lora) = self {
            *self = lora.merge()?;
        }
        Ok(())
    }

    /// The adapter occupying this slot, if any.
    pub fn lora(&self) -> Option<&LoraLinear> {
        match self {
            Self::Lora(lora) => Some(lora),
            _ => None,
        }
    }

    /// Propagate the training-mode flag into an adapter's dropout.
    pub fn set_training(&mut self, mode: bool) {
        if let Self::Lora(lora) = self {
            lora.set_training(mode);
        }
    }
}

impl ModuleParameters for Projection {
    fn num_parameters(&self) -> usize {
        match self {
            Self::Linear(m) => m.num_parameters(),
            Self::Quantized(m) => m.num_parameters(),
            Self::Lora(m) => m.num_parameters(),
        }
    }

    fn parameters(&self) -> ModuleParamRef<'_> {
        match self {
            Self::Linear(m) => m.parameters(),
            Self::Quantized(m) => m.parameters(),
            Self::Lora(m) => m.parameters(),
        }
    }

    fn parameters_mut(&mut self) -> ModuleParamMut<'_> {
        match self {
            Self::Linear(m) => m.parameters_mut(),
            Self::Quantized(m) => m.parameters_mut(),
            Self::Lora(m) => m.parameters_mut(),
        }
    }

    fn trainable_parameters(&self) -> ModuleParamRef<'_> {
        match self {
            Self::Linear(m) => m.trainable_parameters(),
            Self::Quantized(m) => m.trainable_parameters(),
            Self::Lora(m) => m.trainable_parameters(),
        }
    }

    fn freeze_parameters(&mut self, recursive: bool) {
        match self {
            Self::Linear(m) => m.freeze_parameters(recursive),
            Self::Quantized(m) => m.freeze_parameters(recursive),
            Self::Lora(m) => m.freeze_parameters(recursive),
        }
    }

    fn unfreeze_parameters(&mut self, recursive: bool) {
        match self {
            Self::Linear(m) => m.unfreeze_parameters(recursive),
            Self::Quantized(m) => m.unfreeze_parameters(recursive),
            Self::Lora(m) => m.unfreeze_parameters(recursive),
        }
    }

    fn all_frozen(&self) -> Option<bool> {
        match self {
            Self::Linear(m) => m.all_frozen(),
            Self::Quantized(m) => m.all_frozen(),
            Self::Lora(m) => m.all_frozen(),
        }
    }

    fn any_frozen(&self) -> Option<bool> {
        match self {
            Self::Linear(m) => m.any_frozen(),
            Self::Quantized(m) => m.any_frozen(),
            Self::Lora(m) => m.any_frozen(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn linear_projection(input_dims: i32, output_dims: i32) -> Projection {
        Projection::Linear(
            nn::LinearBuilder::new(input_dims, output_dims)
                .bias(false)
                .build()
                .unwrap(),
        )
    }

    #[test]
    #[serial]
    fn test_quantize_dequantize_cycle() {
        let mut slot = linear_projection(64, 32);
        assert!(slot.is_linear());

        slot.quantize_in_place(64, 4).unwrap();
        assert!(slot.is_quantized());
        assert_eq!(slot.shape(), (64, 32));

        slot.dequantize_in_place().unwrap();
        assert!(slot.is_linear());
        assert_eq!(slot.shape(), (64, 32));
        assert_eq!(slot.working_dtype(), Dtype::Float16);
    }

    #[test]
    #[serial]
    fn test_wrap_and_merge_restores_structure() {
        let mut slot = linear_projection(32, 48);

        slot.wrap_lora(8, 16.0, 0.0, 10.0).unwrap();
        assert!(slot.is_adapted());
        assert_eq!(slot.shape(), (32, 48));

        slot.merge_lora().unwrap();
        assert!(slot.is_linear());
        assert_eq!(slot.shape(), (32, 48));
    }

    #[test]
    #[serial]
    fn test_quantize_skips_adapted_slot() {
        let mut slot = linear_projection(16, 16);
        slot.wrap_lora(2, 4.0, 0.0, 1.0).unwrap();

        slot.quantize_in_place(64, 4).unwrap();
        assert!(slot.is_adapted());
    }
}
