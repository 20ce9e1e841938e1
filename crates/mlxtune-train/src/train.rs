//! Evaluation and the training loop.

use std::time::Instant;

use mlx_rs::{
    error::Exception,
    module::ModuleParameters,
    nn,
    optimizers::{AdamWBuilder, Optimizer},
    transforms::eval_params,
    utils::Updatable,
    Array,
};
use mlxtune_core::{Result, TrainingConfig};
use mlxtune_data::TokenDataset;
use mlxtune_models::Model;

use crate::TrainableLlm;

/// Result of the per-evaluation callback.
///
/// A message, when present, is surfaced alongside the validation report.
#[derive(Debug, Default)]
pub struct EvalOutcome {
    /// Optional message to surface in the training log.
    pub message: Option<String>,
}

/// Summary of a completed training run.
#[derive(Debug, Clone)]
pub struct TrainReport {
    /// Total optimizer steps executed.
    pub steps: usize,
}

/// Token-weighted mean of `(loss, token_count)` pairs:
/// `sum(loss_i * tokens_i) / sum(tokens_i)`.
pub fn token_weighted_mean(losses: &[(f32, usize)]) -> f32 {
    let total_tokens: usize = losses.iter().map(|(_, tokens)| tokens).sum();
    if total_tokens == 0 {
        return 0.0;
    }

    let weighted: f32 = losses
        .iter()
        .map(|(loss, tokens)| loss * *tokens as f32)
        .sum();
    weighted / total_tokens as f32
}

impl TrainableLlm {
    /// Token-weighted average loss over up to `num_batches` validation
    /// batches. No model updates occur.
    pub fn evaluate(
        &mut self,
        dataset: &TokenDataset,
        batch_size: usize,
        num_batches: usize,
    ) -> Result<f32> {
        let mut losses = Vec::with_capacity(num_batches);
        for batch in dataset.iterate_batches(batch_size, false).take(num_batches) {
            let loss = self.llm.model.loss(&batch.inputs, &batch.targets)?;
            loss.eval()?;
            losses.push((loss.item::<f32>(), batch.num_tokens));
        }

        Ok(token_weighted_mean(&losses))
    }

    /// Run the training loop.
    ///
    /// Outer loop over epochs, inner loop over iterations (`iterations == 0`
    /// means one pass: `len / batch_size`). Every `report_steps` steps the
    /// mean training loss and throughput since the last report are logged;
    /// at step 0 and every `eval_steps` steps the validation set is
    /// evaluated and `eval_callback` invoked. Termination is purely
    /// iteration-count driven.
    pub fn train(
        &mut self,
        dataset_training: &TokenDataset,
        dataset_validation: &TokenDataset,
        options: &TrainingConfig,
        mut eval_callback: Option<&mut dyn FnMut(usize, f32) -> EvalOutcome>,
    ) -> Result<TrainReport> {
        let mut iterations = options.iterations;
        if iterations == 0 {
            iterations = dataset_training.len() / options.batch_size;
        }
        let validation_batches = options.validation_samples / options.batch_size;
        let report_steps = options.report_steps.max(1);
        let eval_steps = options.eval_steps.max(1);

        tracing::info!(
            "Training the model for {} epochs of {} batch iterations with batch size {}",
            options.epochs,
            iterations,
            options.batch_size
        );
        tracing::debug!("Training learning rate: {}", options.learning_rate);

        // Weight decay zero keeps this a plain Adam update.
        // AdamWBuilder::build returns Result<AdamW, Infallible>, so unwrap is safe.
        let mut optimizer = AdamWBuilder::new(options.learning_rate)
            .weight_decay(0.0)
            .build()
            .unwrap();

        let loss_fn = |model: &mut Model,
                       (inputs, targets): (&Array, &Array)|
         -> std::result::Result<Array, Exception> { model.loss(inputs, targets) };
        let mut loss_and_grad = nn::value_and_grad(loss_fn);

        let mut losses: Vec<f32> = Vec::new();
        let mut num_tokens = 0usize;
        let mut steps = 0usize;

        let base_seed = dataset_training.seed();
        let mut start = Instant::now();

        for epoch in 0..options.epochs {
            let mut pass = 0u64;
            let epoch_seed = base_seed.wrapping_add(epoch as u64);
            let mut batches =
                dataset_training.iterate_batches_seeded(options.batch_size, true, epoch_seed);

            for iteration in 0..iterations {
                let n = epoch * iterations + iteration;

                let batch = match batches.next() {
                    Some(batch) => batch,
                    None => {
                        // The epoch asks for more steps than one pass holds;
                        // start another shuffled pass.
                        pass += 1;
                        batches = dataset_training.iterate_batches_seeded(
                            options.batch_size,
                            true,
                            epoch_seed.wrapping_add(pass << 32),
                        );
                        match batches.next() {
                            Some(batch) => batch,
                            None => break,
                        }
                    }
                };

                // Forward and backward pass via the autograd collaborator.
                let (loss, grads) =
                    loss_and_grad(&mut self.llm.model, (&batch.inputs, &batch.targets))?;

                if options.debug && n > 0 {
                    for (name, grad) in grads.iter() {
                        let magnitude = grad.abs()?.sum(None)?;
                        magnitude.eval()?;
                        if magnitude.item::<f32>() == 0.0 {
                            tracing::warn!(
                                "Gradient for module {} is zero in iteration {}",
                                name,
                                n
                            );
                        }
                    }
                }

                // Model update, then a materialization barrier over the
                // updated parameters and optimizer state.
                optimizer.update(&mut self.llm.model, grads)?;
                eval_params(self.llm.model.parameters())?;
                let optimizer_state: Vec<&Array> =
                    optimizer.updatable_states().into_iter().collect();
                if !optimizer_state.is_empty() {
                    mlx_rs::transforms::eval(optimizer_state)?;
                }
                loss.eval()?;

                losses.push(loss.item::<f32>());
                num_tokens += batch.num_tokens;
                steps += 1;

                if (n + 1) % report_steps == 0 {
                    let mean = losses.iter().sum::<f32>() / losses.len() as f32;
                    let elapsed = start.elapsed().as_secs_f64();

                    tracing::info!(
                        "#{}: Training loss {:.3}\t{:.3} tok/sec",
                        n + 1,
                        mean,
                        num_tokens as f64 / elapsed
                    );

                    losses.clear();
                    num_tokens = 0;
                    start = Instant::now();
                }

                if n == 0 || (n + 1) % eval_steps == 0 {
                    let eval_start = Instant::now();
                    let validation_loss =
                        self.evaluate(dataset_validation, options.batch_size, validation_batches)?;

                    tracing::info!(
                        "#{}: Validation loss {:.3}\t{:.3} sec",
                        n + 1,
                        validation_loss,
                        eval_start.elapsed().as_secs_f64()
                    );

                    if let Some(callback) = eval_callback.as_mut() {
                        let outcome = callback(n + 1, validation_loss);
                        if let Some(message) = outcome.message {
                            tracing::info!("#{}: {}", n + 1, message);
                        }
                    }

                    // Evaluation time is excluded from throughput reporting.
                    start = Instant::now();
                }
            }
        }

        Ok(TrainReport { steps })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlxtune_core::LoraConfig;
    use mlxtune_data::Tokenize;
    use mlxtune_models::{Llm, ModelArgs};
    use serial_test::serial;

    struct StubTokenizer;

    impl Tokenize for StubTokenizer {
        fn encode(&self, text: &str) -> Result<Vec<u32>> {
            Ok(text.bytes().map(|b| b as u32 % 30).collect())
        }

        fn decode(&self, ids: &[u32]) -> Result<String> {
            Ok(ids.iter().map(|_| 'x').collect())
        }

        fn eos_id(&self) -> u32 {
            29
        }
    }

    fn tiny_trainable() -> TrainableLlm {
        let args: ModelArgs = serde_json::from_str(
            r#"{
                "model_type": "llama",
                "vocab_size": 30,
                "hidden_size": 16,
                "intermediate_size": 32,
                "num_hidden_layers": 1,
                "num_attention_heads": 2,
                "num_key_value_heads": 2
            }"#,
        )
        .unwrap();

        TrainableLlm::from_model(Llm::new(Box::new(StubTokenizer), args).unwrap())
    }

    fn tiny_dataset(n: usize) -> TokenDataset {
        let sequences = (0..n)
            .map(|i| vec![1u32, (i % 20 + 2) as u32, 3, 4, 5])
            .collect();
        TokenDataset::from_samples(sequences, 16)
    }

    #[test]
    fn test_token_weighted_mean() {
        // (2.0 * 10 + 3.0 * 20) / 30
        let mean = token_weighted_mean(&[(2.0, 10), (3.0, 20)]);
        assert!((mean - 2.6667).abs() < 1e-3);

        assert_eq!(token_weighted_mean(&[]), 0.0);
    }

    #[test]
    #[serial]
    fn test_evaluate_is_finite() {
        let mut model = tiny_trainable();
        let dataset = tiny_dataset(8);

        let loss = model.evaluate(&dataset, 4, 2).unwrap();
        assert!(loss.is_finite());
        assert!(loss > 0.0);
    }

    #[test]
    #[serial]
    fn test_default_iterations_covers_one_pass() {
        let mut model = tiny_trainable();
        model
            .init_lora(&LoraConfig {
                rank: 2,
                dropout: 0.0,
                ..Default::default()
            })
            .unwrap();

        // 20 samples at batch size 4 means exactly 5 steps per epoch.
        let train_set = tiny_dataset(20);
        let val_set = tiny_dataset(4);

        let mut eval_steps_seen = Vec::new();
        let mut callback = |step: usize, _loss: f32| {
            eval_steps_seen.push(step);
            EvalOutcome::default()
        };

        let report = model
            .train(
                &train_set,
                &val_set,
                &TrainingConfig {
                    batch_size: 4,
                    iterations: 0,
                    epochs: 1,
                    eval_steps: 1,
                    report_steps: 2,
                    validation_samples: 4,
                    ..Default::default()
                },
                Some(&mut callback),
            )
            .unwrap();

        assert_eq!(report.steps, 5);
        // Evaluated at every step (eval_steps = 1).
        assert_eq!(eval_steps_seen, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    #[serial]
    fn test_training_moves_adapter_weights() {
        let mut model = tiny_trainable();
        model
            .init_lora(&LoraConfig {
                rank: 2,
                dropout: 0.0,
                ..Default::default()
            })
            .unwrap();

        let before = model.trainable_parameters();

        let train_set = tiny_dataset(8);
        let val_set = tiny_dataset(4);
        model
            .train(
                &train_set,
                &val_set,
                &TrainingConfig {
                    batch_size: 4,
                    iterations: 2,
                    epochs: 1,
                    eval_steps: 100,
                    report_steps: 100,
                    validation_samples: 4,
                    learning_rate: 1e-2,
                    ..Default::default()
                },
                None,
            )
            .unwrap();

        let after = model.trainable_parameters();

        // At least one lora_b factor must have moved off zero.
        let moved = before.keys().any(|name| {
            let diff = after[name]
                .subtract(&before[name])
                .unwrap()
                .abs()
                .unwrap()
                .max(None)
                .unwrap();
            diff.eval().unwrap();
            diff.item::<f32>() > 0.0
        });
        assert!(moved);
    }
}
