//! Configuration types for mlxtune.

use serde::{Deserialize, Serialize};

/// Group quantization descriptor.
///
/// A model carries `Some(QuantizationConfig)` exactly when every eligible
/// linear sub-module has been rewritten to its quantized equivalent; `None`
/// means full precision throughout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantizationConfig {
    /// Group size for quantization.
    #[serde(default = "default_group_size")]
    pub group_size: i32,

    /// Number of bits per weight.
    #[serde(default = "default_bits")]
    pub bits: i32,
}

impl Default for QuantizationConfig {
    fn default() -> Self {
        Self {
            group_size: default_group_size(),
            bits: default_bits(),
        }
    }
}

/// Selection policy for the sub-modules LoRA adapters are injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TargetModules {
    /// Attention query and value projections only.
    #[default]
    QueryValue,
    /// Every plain or quantized linear projection.
    AllLinear,
}

impl std::fmt::Display for TargetModules {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::QueryValue => write!(f, "query_value"),
            Self::AllLinear => write!(f, "all_linear"),
        }
    }
}

/// LoRA configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoraConfig {
    /// Number of decoder layers to adapt, counted from the top of the stack.
    /// Negative means all layers.
    #[serde(default = "default_num_layers")]
    pub num_layers: i32,

    /// Target module selection policy.
    #[serde(default)]
    pub target_modules: TargetModules,

    /// LoRA rank.
    #[serde(default = "default_rank")]
    pub rank: i32,

    /// LoRA alpha.
    #[serde(default = "default_alpha")]
    pub alpha: f32,

    /// Dropout probability on the low-rank path.
    #[serde(default = "default_dropout")]
    pub dropout: f32,

    /// Base scale multiplier.
    #[serde(default = "default_scale")]
    pub scale: f32,
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            num_layers: default_num_layers(),
            target_modules: TargetModules::default(),
            rank: default_rank(),
            alpha: default_alpha(),
            dropout: default_dropout(),
            scale: default_scale(),
        }
    }
}

impl LoraConfig {
    /// Compute the effective scaling factor applied to the low-rank
    /// correction: `scale * alpha / rank`.
    #[must_use]
    pub fn scaling(&self) -> f32 {
        self.scale * self.alpha / self.rank as f32
    }
}

/// Training hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Batch size.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Learning rate.
    #[serde(default = "default_lr")]
    pub learning_rate: f32,

    /// Number of epochs.
    #[serde(default = "default_epochs")]
    pub epochs: usize,

    /// Iterations per epoch; zero means one pass over the training set
    /// (`len / batch_size`).
    #[serde(default)]
    pub iterations: usize,

    /// Report training loss every `report_steps` iterations.
    #[serde(default = "default_report_steps")]
    pub report_steps: usize,

    /// Evaluate on the validation set every `eval_steps` iterations.
    #[serde(default = "default_eval_steps")]
    pub eval_steps: usize,

    /// Number of validation samples per evaluation, divided by the batch
    /// size to get the number of validation batches.
    #[serde(default = "default_validation_samples")]
    pub validation_samples: usize,

    /// Enable zero-gradient diagnostics.
    #[serde(default)]
    pub debug: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            learning_rate: default_lr(),
            epochs: default_epochs(),
            iterations: 0,
            report_steps: default_report_steps(),
            eval_steps: default_eval_steps(),
            validation_samples: default_validation_samples(),
            debug: false,
        }
    }
}

// Default value functions
fn default_group_size() -> i32 {
    64
}
fn default_bits() -> i32 {
    4
}
fn default_num_layers() -> i32 {
    -1
}
fn default_rank() -> i32 {
    8
}
fn default_alpha() -> f32 {
    16.0
}
fn default_dropout() -> f32 {
    0.05
}
fn default_scale() -> f32 {
    10.0
}
fn default_batch_size() -> usize {
    4
}
fn default_lr() -> f32 {
    1e-5
}
fn default_epochs() -> usize {
    1
}
fn default_report_steps() -> usize {
    10
}
fn default_eval_steps() -> usize {
    100
}
fn default_validation_samples() -> usize {
    40
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lora_scaling() {
        let config = LoraConfig::default();
        // scale * alpha / rank = 10 * 16 / 8 = 20
        assert!((config.scaling() - 20.0).abs() < 1e-6);

        let config = LoraConfig {
            rank: 16,
            alpha: 32.0,
            scale: 1.0,
            ..Default::default()
        };
        assert!((config.scaling() - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_target_modules_serde() {
        let qv: TargetModules = serde_json::from_str("\"query_value\"").unwrap();
        assert_eq!(qv, TargetModules::QueryValue);
        let all: TargetModules = serde_json::from_str("\"all_linear\"").unwrap();
        assert_eq!(all, TargetModules::AllLinear);
    }

    #[test]
    fn test_training_config_defaults() {
        let config: TrainingConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.batch_size, 4);
        assert_eq!(config.iterations, 0);
        assert_eq!(config.eval_steps, 100);
        assert!(!config.debug);
    }
}
