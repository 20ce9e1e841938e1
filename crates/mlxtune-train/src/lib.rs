//! LoRA fine-tuning for mlxtune.
//!
//! [`TrainableLlm`] specializes the model wrapper with the LoRA lifecycle:
//! adapter injection into selected projections, merge-back, adapter
//! serialization (safetensors or GGUF, selected by file extension),
//! evaluation, and the training loop.

mod checkpoint;
pub mod gguf;
mod trainable;
mod train;

pub use checkpoint::CheckpointFormat;
pub use trainable::{LoraState, TrainableLlm};
pub use train::{token_weighted_mean, EvalOutcome, TrainReport};
