//! Architecture dispatch over the supported model families.

use mlx_rs::{
    error::Exception,
    losses::CrossEntropy,
    module::{ModuleParamMut, ModuleParamRef, ModuleParameters},
    Array, Dtype,
};
use mlxtune_core::{MlxTuneError, Result};
use mlxtune_data::IGNORE_INDEX;
use mlxtune_nn::KvCache;

use crate::architectures::{llama::Llama, mixtral::Mixtral, ProjectionVisitor};
use crate::ModelArgs;

/// A decoder-only transformer of one of the supported families.
#[derive(Debug)]
pub enum Model {
    /// Llama-family dense decoder (`llama`, `mistral` tags).
    Llama(Llama),
    /// Mixtral-family MoE decoder (`mixtral` tag).
    Mixtral(Mixtral),
}

impl Model {
    /// Construct the architecture selected by the model family tag.
    ///
    /// Unknown tags are a fatal construction error; there is no fallback.
    pub fn new(args: &ModelArgs) -> Result<Self> {
        match args.model_type.as_str() {
            "llama" | "mistral" => Ok(Self::Llama(Llama::new(args)?)),
            "mixtral" => Ok(Self::Mixtral(Mixtral::new(args)?)),
            other => Err(MlxTuneError::UnsupportedArchitecture(other.to_string())),
        }
    }

    /// Number of decoder layers.
    pub fn num_layers(&self) -> usize {
        match self {
            Self::Llama(m) => m.num_layers(),
            Self::Mixtral(m) => m.num_layers(),
        }
    }

    /// Create an empty KV cache sized for this model.
    pub fn new_cache(&self) -> KvCache {
        KvCache::new(self.num_layers())
    }

    /// Forward pass producing logits `[batch, seq, vocab]`.
    pub fn forward(&mut self, input_ids: &Array, mask: Option<&Array>) -> Result<Array> {
        Ok(self.forward_with_cache(input_ids, mask, None)?)
    }

    /// Forward pass with an optional KV cache.
    pub fn forward_with_cache(
        &mut self,
        input_ids: &Array,
        mask: Option<&Array>,
        cache: Option<&mut KvCache>,
    ) -> std::result::Result<Array, Exception> {
        match self {
            Self::Llama(m) => m.forward_with_cache(input_ids, mask, cache),
            Self::Mixtral(m) => m.forward_with_cache(input_ids, mask, cache),
        }
    }

    /// Masked cross-entropy loss over pre-shifted next-token targets.
    ///
    /// Target positions carrying the ignore index contribute nothing; the
    /// result is the mean over real target tokens, computed in float32.
    pub fn loss(
        &mut self,
        inputs: &Array,
        targets: &Array,
    ) -> std::result::Result<Array, Exception> {
        let logits = self.forward_with_cache(inputs, None, None)?;
        let vocab_size = logits.dim(2);

        let flat_logits = logits.reshape(&[-1, vocab_size])?.as_dtype(Dtype::Float32)?;
        let flat_targets = targets.reshape(&[-1])?;

        let ce = CrossEntropy::new().map_err(|e| Exception::custom(e.to_string()))?;
        let per_token = ce.apply(&flat_logits, &flat_targets)?;

        let mask = flat_targets
            .ne(&Array::from_int(IGNORE_INDEX))?
            .as_dtype(Dtype::Float32)?;
        let masked = per_token.multiply(&mask)?;
        let valid = mask.sum(None)?;

        masked.sum(None)?.divide(&valid)
    }

    /// Walk every projection slot with its dotted path name.
    pub fn visit_projections(
        &mut self,
        visit: &mut ProjectionVisitor<'_>,
    ) -> std::result::Result<(), Exception> {
        match self {
            Self::Llama(m) => m.visit_projections(visit),
            Self::Mixtral(m) => m.visit_projections(visit),
        }
    }

    /// Toggle training mode across the module tree (adapter dropouts).
    pub fn set_training(&mut self, mode: bool) {
        // Dropout only exists inside LoRA adapters; the walk cannot fail.
        let _ = self.visit_projections(&mut |_, slot| {
            slot.set_training(mode);
            Ok(())
        });
    }
}

impl ModuleParameters for Model {
    fn num_parameters(&self) -> usize {
        match self {
            Self::Llama(m) => m.num_parameters(),
            Self::Mixtral(m) => m.num_parameters(),
        }
    }

    fn parameters(&self) -> ModuleParamRef<'_> {
        match self {
            Self::Llama(m) => m.parameters(),
            Self::Mixtral(m) => m.parameters(),
        }
    }

    fn parameters_mut(&mut self) -> ModuleParamMut<'_> {
        match self {
            Self::Llama(m) => m.parameters_mut(),
            Self::Mixtral(m) => m.parameters_mut(),
        }
    }

    fn trainable_parameters(&self) -> ModuleParamRef<'_> {
        match self {
            Self::Llama(m) => m.trainable_parameters(),
            Self::Mixtral(m) => m.trainable_parameters(),
        }
    }

    fn freeze_parameters(&mut self, recursive: bool) {
        match self {
            Self::Llama(m) => m.freeze_parameters(recursive),
            Self::Mixtral(m) => m.freeze_parameters(recursive),
        }
    }

    fn unfreeze_parameters(&mut self, recursive: bool) {
        match self {
            Self::Llama(m) => m.unfreeze_parameters(recursive),
            Self::Mixtral(m) => m.unfreeze_parameters(recursive),
        }
    }

    fn all_frozen(&self) -> Option<bool> {
        match self {
            Self::Llama(m) => m.all_frozen(),
            Self::Mixtral(m) => m.all_frozen(),
        }
    }

    fn any_frozen(&self) -> Option<bool> {
        match self {
            Self::Llama(m) => m.any_frozen(),
            Self::Mixtral(m) => m.any_frozen(),
        }
    }
}
