//! LLM model wrapper: weight lifecycle, quantization, and generation.

use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;

use mlx_rs::{module::ModuleParameters, transforms::eval_params, Array};
use mlxtune_core::{MlxTuneError, QuantizationConfig, Result};
use mlxtune_data::{Tokenize, Tokenizer};

use crate::{generation::TokenChunks, Model, ModelArgs};

/// Model wrapper owning the model tree and its tokenizer.
pub struct Llm {
    /// The decoder model.
    pub model: Model,
    /// Tokenizer collaborator.
    pub tokenizer: Box<dyn Tokenize>,
    /// Architecture hyperparameters.
    pub args: ModelArgs,

    quantization: Option<QuantizationConfig>,
}

impl Llm {
    /// Construct the model selected by `args.model_type`.
    ///
    /// Fails with [`MlxTuneError::UnsupportedArchitecture`] for unknown
    /// family tags.
    pub fn new(tokenizer: Box<dyn Tokenize>, args: ModelArgs) -> Result<Self> {
        let model = Model::new(&args)?;

        Ok(Self {
            model,
            tokenizer,
            args,
            quantization: None,
        })
    }

    /// The active quantization descriptor, if the model is quantized.
    pub fn quantization(&self) -> Option<QuantizationConfig> {
        self.quantization
    }

    pub(crate) fn set_quantization(&mut self, quantization: Option<QuantizationConfig>) {
        self.quantization = quantization;
    }

    /// Replace model parameters from a flat name-to-tensor mapping and
    /// force materialization.
    ///
    /// Parameters whose name is absent from `weights` are left unchanged
    /// and logged; verification is the separate, non-blocking
    /// [`verify_weights`](Self::verify_weights).
    pub fn update_weights(&mut self, weights: &HashMap<String, Array>) -> Result<()> {
        let mut params = self.model.parameters_mut().flatten();
        for (name, param) in params.iter_mut() {
            match weights.get(name.as_ref()) {
                Some(value) => **param = value.clone(),
                None => tracing::debug!("No weight provided for parameter {}", name),
            }
        }
        drop(params);

        eval_params(self.model.parameters())?;
        Ok(())
    }

    /// Check that a weight is present for every parameter in the tree.
    ///
    /// Logs each missing key and returns `false` if any is absent; never
    /// raises.
    pub fn verify_weights(&self, weights: &HashMap<String, Array>) -> bool {
        let mut result = true;
        for (name, _) in self.model.parameters().flatten() {
            if !weights.contains_key(name.as_ref()) {
                tracing::warn!("Key {} not found in weights", name);
                result = false;
            }
        }
        result
    }

    /// Save all model parameters as a safetensors archive.
    pub fn save_weights<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let params: HashMap<Rc<str>, Array> = self
            .model
            .parameters()
            .flatten()
            .into_iter()
            .map(|(name, value)| (name, value.clone()))
            .collect();

        Array::save_safetensors(params, None, path.as_ref())?;
        tracing::info!("Saved model weights to {}", path.as_ref().display());

        Ok(())
    }

    /// Quantize every eligible linear projection.
    ///
    /// Idempotent: a warning and no-op when already quantized. Projections
    /// with output width 8 (MoE router gates) and paths listed in
    /// `excluded` keep full precision.
    pub fn quantize(&mut self, group_size: i32, bits: i32, excluded: &[String]) -> Result<()> {
        if self.quantization.is_some() {
            tracing::warn!("Model is already quantized");
            return Ok(());
        }

        self.model.visit_projections(&mut |path, slot| {
            if slot.is_linear()
                && slot.shape().1 != 8
                && !excluded.iter().any(|name| name == path)
            {
                slot.quantize_in_place(group_size, bits)?;
            }
            Ok(())
        })?;

        self.quantization = Some(QuantizationConfig { group_size, bits });
        tracing::info!(
            "Quantized model with group size {} and {} bits",
            group_size,
            bits
        );

        Ok(())
    }

    /// Rebuild full-precision linears from every quantized projection.
    ///
    /// Idempotent no-op when the model is not quantized.
    pub fn dequantize(&mut self) -> Result<()> {
        if self.quantization.is_none() {
            return Ok(());
        }

        self.model
            .visit_projections(&mut |_, slot| slot.dequantize_in_place())?;

        self.quantization = None;
        tracing::info!("Dequantized model");

        Ok(())
    }

    /// Produce a lazy sequence of `(decoded_chunk, stats)` pairs.
    ///
    /// Bounded by `max_tokens` and the end-of-sequence token; text is
    /// decoded and yielded every `flush_every` tokens and once more for the
    /// remainder. Synchronous: each item suspends the caller until the next
    /// chunk of tokens is ready.
    pub fn generate(
        &mut self,
        prompt: &str,
        temperature: f32,
        max_tokens: usize,
        flush_every: usize,
    ) -> Result<TokenChunks<'_>> {
        tracing::debug!(
            "Generating {} tokens with temperature {} and flushing every {} tokens",
            max_tokens,
            temperature,
            flush_every
        );

        let prompt_ids = self.tokenizer.encode(prompt)?;

        Ok(TokenChunks::new(
            &mut self.model,
            self.tokenizer.as_ref(),
            &prompt_ids,
            temperature,
            max_tokens,
            flush_every,
        ))
    }
}

/// Load a model directory: `config.json`, `tokenizer.json`, and
/// `model.safetensors`.
pub fn load_llm<P: AsRef<Path>>(model_dir: P) -> Result<Llm> {
    let model_dir = model_dir.as_ref();

    let config = std::fs::read_to_string(model_dir.join("config.json"))?;
    let args: ModelArgs = serde_json::from_str(&config)
        .map_err(|e| MlxTuneError::Config(format!("invalid config.json: {e}")))?;

    let tokenizer = Tokenizer::from_file(model_dir.join("tokenizer.json"))?;

    let mut llm = Llm::new(Box::new(tokenizer), args)?;

    let weights_path = model_dir.join("model.safetensors");
    if !weights_path.exists() {
        return Err(MlxTuneError::ModelLoad(format!(
            "no model.safetensors under {}",
            model_dir.display()
        )));
    }
    let weights = Array::load_safetensors(&weights_path)?;
    llm.update_weights(&weights)?;
    llm.verify_weights(&weights);

    Ok(llm)
}
