//! Trainable model wrapper: LoRA adapter lifecycle and persistence.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use mlx_rs::{module::ModuleParameters, transforms::eval_params, Array};
use mlxtune_core::{LoraConfig, MlxTuneError, Result, TargetModules};
use mlxtune_models::Llm;

use crate::checkpoint::{self, CheckpointFormat};

/// Active LoRA adaptation state; exists only while adapters are injected.
#[derive(Debug, Clone)]
pub struct LoraState {
    /// Number of decoder layers adapted, counted from the top.
    pub num_layers: usize,
    /// Selection policy the adapters were injected with.
    pub target_modules: TargetModules,
    /// Adapter rank.
    pub rank: i32,
}

/// Model wrapper specialized for LoRA fine-tuning.
///
/// Takes exclusive ownership of the wrapped model; the LoRA lifecycle is
/// Unadapted -> [`init_lora`](Self::init_lora) -> Adapted ->
/// [`merge_and_unload_lora`](Self::merge_and_unload_lora) -> Unadapted.
pub struct TrainableLlm {
    /// The wrapped model.
    pub llm: Llm,
    pub(crate) lora: Option<LoraState>,
}

/// Decoder layer index encoded in a projection path, if any.
fn layer_index(path: &str) -> Option<usize> {
    path.strip_prefix("layers.")?
        .split('.')
        .next()?
        .parse()
        .ok()
}

fn selected(policy: TargetModules, path: &str, first_layer: usize) -> bool {
    if let Some(layer) = layer_index(path) {
        if layer < first_layer {
            return false;
        }
    }

    match policy {
        TargetModules::QueryValue => {
            path.ends_with(".self_attn.q_proj") || path.ends_with(".self_attn.v_proj")
        }
        TargetModules::AllLinear => true,
    }
}

impl TrainableLlm {
    /// Convert a model wrapper into a trainable one, taking ownership.
    pub fn from_model(llm: Llm) -> Self {
        Self { llm, lora: None }
    }

    /// The active LoRA state, if adapters are injected.
    pub fn lora(&self) -> Option<&LoraState> {
        self.lora.as_ref()
    }

    /// Give the wrapped model back, in whatever adaptation state it is in.
    pub fn into_inner(self) -> Llm {
        self.llm
    }

    /// Freeze the base model and inject LoRA adapters into the selected
    /// projections.
    ///
    /// Re-entrant: a no-op with a warning when adapters are already active.
    /// Matching zero sub-modules is logged as an error but is not fatal;
    /// training then proceeds with zero trainable parameters.
    pub fn init_lora(&mut self, config: &LoraConfig) -> Result<()> {
        if self.lora.is_some() {
            tracing::warn!("LoRA adapters are already initialized");
            return Ok(());
        }

        self.llm.model.freeze_parameters(true);

        let total_layers = self.llm.model.num_layers();
        let num_layers = if config.num_layers < 0 {
            total_layers
        } else {
            (config.num_layers as usize).min(total_layers)
        };
        let first_layer = total_layers - num_layers;

        let mut wrapped = 0usize;
        let mut trainable_params = 0usize;
        self.llm.model.visit_projections(&mut |path, slot| {
            if slot.is_adapted() || !selected(config.target_modules, path, first_layer) {
                return Ok(());
            }

            slot.wrap_lora(config.rank, config.alpha, config.dropout, config.scale)?;
            wrapped += 1;
            if let Some(lora) = slot.lora() {
                trainable_params += lora.lora_size();
            }
            Ok(())
        })?;

        if wrapped == 0 {
            tracing::error!(
                "No target modules found for LoRA: {}",
                config.target_modules
            );
        }

        self.llm.model.set_training(true);
        self.lora = Some(LoraState {
            num_layers,
            target_modules: config.target_modules,
            rank: config.rank,
        });

        tracing::info!(
            "Initialized LoRA with rank {} for {} layers",
            config.rank,
            num_layers
        );
        tracing::debug!("LoRA target modules: {}", config.target_modules);
        tracing::debug!(
            "LoRA parameters: Alpha {}, Dropout {}, Scale {}",
            config.alpha,
            config.dropout,
            config.scale
        );
        tracing::debug!(
            "LoRA trainable parameters: {:.2}M",
            trainable_params as f64 / 1e6
        );

        Ok(())
    }

    /// Merge every adapter back into its base layer and clear LoRA state.
    ///
    /// Always resets to the unadapted state and leaves training mode, even
    /// when no adapters exist.
    pub fn merge_and_unload_lora(&mut self) -> Result<()> {
        if self.lora.is_some() {
            self.llm
                .model
                .visit_projections(&mut |_, slot| slot.merge_lora())?;

            tracing::info!("Merged LoRA layers back into model");
        }

        self.lora = None;
        self.llm.model.set_training(false);

        Ok(())
    }

    /// Snapshot of the trainable (adapter) parameters.
    pub fn trainable_parameters(&self) -> HashMap<Rc<str>, Array> {
        self.llm
            .model
            .trainable_parameters()
            .flatten()
            .into_iter()
            .map(|(name, value)| (name, value.clone()))
            .collect()
    }

    /// Total trainable parameter count.
    pub fn num_trainable_params(&self) -> usize {
        self.trainable_parameters()
            .values()
            .map(|value| value.size())
            .sum()
    }

    /// Serialize the trainable-parameter subtree.
    ///
    /// Requires active LoRA state; the file extension selects the format.
    pub fn save_adapters<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        if self.lora.is_none() {
            return Err(MlxTuneError::LoraNotActive);
        }

        checkpoint::save_arrays(path.as_ref(), self.trainable_parameters())
    }

    /// Save an adapter checkpoint named `ckpt-<steps>.<ext>`, or
    /// `ckpt-final.<ext>` when `steps` is `None`. Returns the written path.
    pub fn save_checkpoint<P: AsRef<Path>>(
        &self,
        checkpoint_dir: P,
        steps: Option<usize>,
        format: CheckpointFormat,
    ) -> Result<PathBuf> {
        let checkpoint_dir = checkpoint_dir.as_ref();
        std::fs::create_dir_all(checkpoint_dir)?;

        let name = match steps {
            Some(steps) => format!("ckpt-{}.{}", steps, format.extension()),
            None => format!("ckpt-final.{}", format.extension()),
        };
        let path = checkpoint_dir.join(name);

        self.save_adapters(&path)?;
        Ok(path)
    }

    /// Load adapter weights non-strictly: names absent from the current
    /// tree are ignored, so a partial adapter set is accepted.
    ///
    /// The path must exist.
    pub fn load_adapters<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(MlxTuneError::AdapterNotFound(path.to_path_buf()));
        }

        let weights = checkpoint::load_arrays(path)?;

        let mut params = self.llm.model.parameters_mut().flatten();
        for (name, value) in &weights {
            if let Some(param) = params.get_mut(name.as_str()) {
                **param = value.clone();
            }
        }
        drop(params);

        eval_params(self.llm.model.parameters())?;
        tracing::info!("Loaded adapter weights from {}", path.display());

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlxtune_data::Tokenize;
    use mlxtune_models::{Llm, ModelArgs};
    use serial_test::serial;

    struct StubTokenizer;

    impl Tokenize for StubTokenizer {
        fn encode(&self, text: &str) -> Result<Vec<u32>> {
            Ok(text.bytes().map(|b| b as u32 % 90).collect())
        }

        fn decode(&self, ids: &[u32]) -> Result<String> {
            Ok(ids.iter().map(|_| 'x').collect())
        }

        fn eos_id(&self) -> u32 {
            89
        }
    }

    fn small_trainable() -> TrainableLlm {
        let args: ModelArgs = serde_json::from_str(
            r#"{
                "model_type": "llama",
                "vocab_size": 90,
                "hidden_size": 32,
                "intermediate_size": 64,
                "num_hidden_layers": 2,
                "num_attention_heads": 4,
                "num_key_value_heads": 2
            }"#,
        )
        .unwrap();

        TrainableLlm::from_model(Llm::new(Box::new(StubTokenizer), args).unwrap())
    }

    #[test]
    #[serial]
    fn test_init_lora_query_value() {
        let mut model = small_trainable();
        model.init_lora(&LoraConfig::default()).unwrap();

        let mut adapted = Vec::new();
        model
            .llm
            .model
            .visit_projections(&mut |path, slot| {
                if slot.is_adapted() {
                    adapted.push(path.to_string());
                }
                Ok(())
            })
            .unwrap();

        // q and v projections in both layers
        assert_eq!(adapted.len(), 4);
        assert!(adapted.iter().all(|p| p.ends_with(".q_proj") || p.ends_with(".v_proj")));

        // Only adapter factors are trainable.
        let trainable = model.trainable_parameters();
        assert_eq!(trainable.len(), 8);
        assert!(trainable.keys().all(|k| k.ends_with("lora_a") || k.ends_with("lora_b")));
    }

    #[test]
    #[serial]
    fn test_init_lora_is_reentrant() {
        let mut model = small_trainable();
        model.init_lora(&LoraConfig::default()).unwrap();
        let before = model.num_trainable_params();

        // Second call is a logged no-op.
        model
            .init_lora(&LoraConfig {
                target_modules: TargetModules::AllLinear,
                ..Default::default()
            })
            .unwrap();

        assert_eq!(model.num_trainable_params(), before);
        assert_eq!(model.lora().unwrap().target_modules, TargetModules::QueryValue);
    }

    #[test]
    #[serial]
    fn test_init_lora_last_layers_only() {
        let mut model = small_trainable();
        model
            .init_lora(&LoraConfig {
                num_layers: 1,
                ..Default::default()
            })
            .unwrap();

        let mut adapted = Vec::new();
        model
            .llm
            .model
            .visit_projections(&mut |path, slot| {
                if slot.is_adapted() {
                    adapted.push(path.to_string());
                }
                Ok(())
            })
            .unwrap();

        assert_eq!(adapted.len(), 2);
        assert!(adapted.iter().all(|p| p.starts_with("layers.1.")));
    }

    #[test]
    #[serial]
    fn test_merge_and_unload_restores_structure() {
        let mut model = small_trainable();

        let mut shapes_before = Vec::new();
        model
            .llm
            .model
            .visit_projections(&mut |path, slot| {
                shapes_before.push((path.to_string(), slot.shape()));
                Ok(())
            })
            .unwrap();

        model
            .init_lora(&LoraConfig {
                target_modules: TargetModules::AllLinear,
                ..Default::default()
            })
            .unwrap();
        model.merge_and_unload_lora().unwrap();

        assert!(model.lora().is_none());

        let mut shapes_after = Vec::new();
        model
            .llm
            .model
            .visit_projections(&mut |path, slot| {
                assert!(slot.is_linear());
                shapes_after.push((path.to_string(), slot.shape()));
                Ok(())
            })
            .unwrap();

        assert_eq!(shapes_before, shapes_after);
    }

    #[test]
    #[serial]
    fn test_merge_on_quantized_model_restores_quantized_layers() {
        let mut model = small_trainable();
        model.llm.quantize(32, 4, &[]).unwrap();

        model
            .init_lora(&LoraConfig {
                dropout: 0.0,
                ..Default::default()
            })
            .unwrap();
        model.merge_and_unload_lora().unwrap();

        // Adapters over quantized bases merge back into quantized layers
        // with the original group size and bit width.
        model
            .llm
            .model
            .visit_projections(&mut |_, slot| {
                assert!(slot.is_quantized());
                Ok(())
            })
            .unwrap();
        assert_eq!(
            model.llm.quantization(),
            Some(mlxtune_core::QuantizationConfig {
                group_size: 32,
                bits: 4
            })
        );
    }

    #[test]
    #[serial]
    fn test_merge_without_adapters_resets_state() {
        let mut model = small_trainable();
        model.merge_and_unload_lora().unwrap();
        assert!(model.lora().is_none());
    }

    #[test]
    #[serial]
    fn test_save_requires_active_lora() {
        let model = small_trainable();
        let err = model.save_adapters("adapters.safetensors").unwrap_err();
        assert!(matches!(err, MlxTuneError::LoraNotActive));
    }

    #[test]
    #[serial]
    fn test_load_requires_existing_path() {
        let mut model = small_trainable();
        let err = model.load_adapters("/nonexistent/adapters.safetensors").unwrap_err();
        assert!(matches!(err, MlxTuneError::AdapterNotFound(_)));
    }

    #[test]
    #[serial]
    fn test_checkpoint_naming_and_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut model = small_trainable();
        model.init_lora(&LoraConfig::default()).unwrap();

        let stepped = model
            .save_checkpoint(dir.path(), Some(42), CheckpointFormat::Safetensors)
            .unwrap();
        assert!(stepped.ends_with("ckpt-42.safetensors"));

        let final_path = model
            .save_checkpoint(dir.path(), None, CheckpointFormat::Gguf)
            .unwrap();
        assert!(final_path.ends_with("ckpt-final.gguf"));

        // Perturb one factor, then restore it from the checkpoint.
        let before = model.trainable_parameters();
        let mut sorted: Vec<&Rc<str>> = before.keys().collect();
        sorted.sort();
        let name = sorted[0].clone();

        {
            let mut params = model.llm.model.parameters_mut().flatten();
            let param = params.get_mut(name.as_ref()).unwrap();
            **param = mlx_rs::ops::ones::<f32>(param.shape()).unwrap();
        }

        model.load_adapters(&final_path).unwrap();

        let after = model.trainable_parameters();
        let diff = after[&name]
            .subtract(&before[&name])
            .unwrap()
            .abs()
            .unwrap()
            .max(None)
            .unwrap();
        diff.eval().unwrap();
        assert_eq!(diff.item::<f32>(), 0.0);
    }

    #[test]
    #[serial]
    fn test_unsupported_checkpoint_extension() {
        let dir = tempfile::tempdir().unwrap();
        let mut model = small_trainable();
        model.init_lora(&LoraConfig::default()).unwrap();

        let err = model
            .save_adapters(dir.path().join("adapters.npz"))
            .unwrap_err();
        assert!(matches!(err, MlxTuneError::UnsupportedCheckpointFormat(_)));
    }
}
