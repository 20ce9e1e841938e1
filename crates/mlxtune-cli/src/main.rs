//! mlxtune CLI - LLM inference and LoRA fine-tuning on MLX.

use std::io::Write;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use mlxtune_core::{LoraConfig, TargetModules, TrainingConfig};
use mlxtune_data::TokenDataset;
use mlxtune_models::load_llm;
use mlxtune_train::{CheckpointFormat, EvalOutcome, TrainableLlm};

#[derive(Parser)]
#[command(name = "mlxtune")]
#[command(version, about = "LLM inference and LoRA fine-tuning on MLX", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// LoRA target selection policy.
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum TargetModulesArg {
    /// Attention query and value projections.
    #[default]
    QueryValue,
    /// Every linear projection.
    AllLinear,
}

impl From<TargetModulesArg> for TargetModules {
    fn from(value: TargetModulesArg) -> Self {
        match value {
            TargetModulesArg::QueryValue => TargetModules::QueryValue,
            TargetModulesArg::AllLinear => TargetModules::AllLinear,
        }
    }
}

/// Adapter checkpoint format.
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum FormatArg {
    /// Safetensors archive.
    #[default]
    Safetensors,
    /// GGUF archive.
    Gguf,
}

impl From<FormatArg> for CheckpointFormat {
    fn from(value: FormatArg) -> Self {
        match value {
            FormatArg::Safetensors => CheckpointFormat::Safetensors,
            FormatArg::Gguf => CheckpointFormat::Gguf,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Generate text from a prompt.
    Generate {
        /// Model directory (config.json, tokenizer.json, model.safetensors).
        #[arg(long)]
        model: PathBuf,
        /// Prompt text.
        #[arg(long)]
        prompt: String,
        /// Sampling temperature; zero means greedy decoding.
        #[arg(long, default_value_t = 0.7)]
        temperature: f32,
        /// Maximum number of tokens to generate.
        #[arg(long, default_value_t = 256)]
        max_tokens: usize,
        /// Flush decoded text every N tokens.
        #[arg(long, default_value_t = 5)]
        flush: usize,
    },

    /// Fine-tune LoRA adapters on a JSONL dataset.
    Train {
        /// Model directory.
        #[arg(long)]
        model: PathBuf,
        /// JSONL dataset of {"text": ...} records.
        #[arg(long)]
        dataset: PathBuf,
        /// Fraction of samples held out for validation.
        #[arg(long, default_value_t = 0.1)]
        validation_split: f32,
        /// Maximum sequence length in tokens.
        #[arg(long, default_value_t = 1024)]
        max_length: usize,

        /// LoRA rank.
        #[arg(long, default_value_t = 8)]
        rank: i32,
        /// LoRA alpha.
        #[arg(long, default_value_t = 16.0)]
        alpha: f32,
        /// Dropout on the low-rank path.
        #[arg(long, default_value_t = 0.05)]
        dropout: f32,
        /// Target module selection policy.
        #[arg(long, value_enum, default_value_t = TargetModulesArg::QueryValue)]
        target_modules: TargetModulesArg,
        /// Number of layers to adapt, counted from the top (-1 for all).
        #[arg(long, default_value_t = -1)]
        num_layers: i32,

        /// Batch size.
        #[arg(long, default_value_t = 4)]
        batch_size: usize,
        /// Learning rate.
        #[arg(long, default_value_t = 1e-5)]
        learning_rate: f32,
        /// Number of epochs.
        #[arg(long, default_value_t = 1)]
        epochs: usize,
        /// Iterations per epoch (0 for one pass over the dataset).
        #[arg(long, default_value_t = 0)]
        iterations: usize,
        /// Report training loss every N steps.
        #[arg(long, default_value_t = 10)]
        report_steps: usize,
        /// Evaluate every N steps.
        #[arg(long, default_value_t = 100)]
        eval_steps: usize,
        /// Validation samples per evaluation.
        #[arg(long, default_value_t = 40)]
        validation_samples: usize,
        /// Enable zero-gradient diagnostics.
        #[arg(long)]
        debug: bool,

        /// Where to write the trained adapters.
        #[arg(long, default_value = "adapters.safetensors")]
        adapter_out: PathBuf,
        /// Directory for periodic checkpoints; disabled when absent.
        #[arg(long)]
        checkpoint_dir: Option<PathBuf>,
        /// Checkpoint format.
        #[arg(long, value_enum, default_value_t = FormatArg::Safetensors)]
        format: FormatArg,
        /// Merge the adapters into the base weights and save the result.
        #[arg(long)]
        merged_out: Option<PathBuf>,
    },

    /// Quantize a model's linear layers and save the result.
    Quantize {
        /// Model directory.
        #[arg(long)]
        model: PathBuf,
        /// Output weights file.
        #[arg(long)]
        output: PathBuf,
        /// Quantization group size.
        #[arg(long, default_value_t = 64)]
        group_size: i32,
        /// Bits per weight.
        #[arg(long, default_value_t = 4)]
        bits: i32,
        /// Projection paths excluded from quantization.
        #[arg(long)]
        exclude: Vec<String>,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Generate {
            model,
            prompt,
            temperature,
            max_tokens,
            flush,
        } => {
            let mut llm = load_llm(&model)?;

            let mut stdout = std::io::stdout();
            let mut last_stats = None;
            for chunk in llm.generate(&prompt, temperature, max_tokens, flush)? {
                let (text, stats) = chunk?;
                write!(stdout, "{text}")?;
                stdout.flush()?;
                last_stats = Some(stats);
            }
            writeln!(stdout)?;

            if let Some(stats) = last_stats {
                tracing::info!(
                    "Generated {} tokens in {:.2}s ({:.1} tok/sec)",
                    stats.num_tokens,
                    stats.runtime,
                    stats.num_tokens as f64 / stats.runtime.max(f64::EPSILON)
                );
            }
        }

        Commands::Train {
            model,
            dataset,
            validation_split,
            max_length,
            rank,
            alpha,
            dropout,
            target_modules,
            num_layers,
            batch_size,
            learning_rate,
            epochs,
            iterations,
            report_steps,
            eval_steps,
            validation_samples,
            debug,
            adapter_out,
            checkpoint_dir,
            format,
            merged_out,
        } => {
            let llm = load_llm(&model)?;
            let mut trainable = TrainableLlm::from_model(llm);

            let full = TokenDataset::from_jsonl(
                &dataset,
                trainable.llm.tokenizer.as_ref(),
                max_length,
            )?;
            let (train_set, val_set) = full.train_val_split(validation_split, 42);
            tracing::info!(
                "Dataset: {} training / {} validation samples",
                train_set.len(),
                val_set.len()
            );

            trainable.init_lora(&LoraConfig {
                num_layers,
                target_modules: target_modules.into(),
                rank,
                alpha,
                dropout,
                ..Default::default()
            })?;

            let checkpoint_format = CheckpointFormat::from(format);
            let mut best_loss = f32::MAX;
            let mut on_eval = |_step: usize, loss: f32| -> EvalOutcome {
                let message = if loss < best_loss {
                    best_loss = loss;
                    Some(format!("New best validation loss {loss:.3}"))
                } else {
                    None
                };
                EvalOutcome { message }
            };

            let report = trainable.train(
                &train_set,
                &val_set,
                &TrainingConfig {
                    batch_size,
                    learning_rate,
                    epochs,
                    iterations,
                    report_steps,
                    eval_steps,
                    validation_samples,
                    debug,
                },
                Some(&mut on_eval),
            )?;
            tracing::info!("Training finished after {} steps", report.steps);

            if let Some(dir) = checkpoint_dir.as_ref() {
                let path = trainable.save_checkpoint(dir, None, checkpoint_format)?;
                tracing::info!("Saved final checkpoint to {}", path.display());
            }

            trainable.save_adapters(&adapter_out)?;
            tracing::info!("Saved adapters to {}", adapter_out.display());

            if let Some(merged_out) = merged_out {
                trainable.merge_and_unload_lora()?;
                trainable.llm.save_weights(&merged_out)?;
            }
        }

        Commands::Quantize {
            model,
            output,
            group_size,
            bits,
            exclude,
        } => {
            let mut llm = load_llm(&model)?;
            llm.quantize(group_size, bits, &exclude)?;
            llm.save_weights(&output)?;
        }
    }

    Ok(())
}
