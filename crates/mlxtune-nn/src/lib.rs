//! Layer-level building blocks for mlxtune.
//!
//! This crate provides the pieces the model architectures are assembled
//! from:
//!
//! - [`QuantizedLinear`] - group-quantized linear layer
//! - [`Projection`] - tagged-union projection slot (plain, quantized, or
//!   LoRA-wrapped), rewritten in place by the quantize/dequantize/adapt
//!   passes
//! - [`LoraLinear`] - linear layer augmented with a trainable low-rank
//!   correction
//! - [`KvCache`] - per-layer key/value cache for autoregressive decoding

#![allow(clippy::too_many_arguments)]

mod kv_cache;
mod lora;
mod projection;
mod quantized;

pub use kv_cache::KvCache;
pub use lora::LoraLinear;
pub use projection::Projection;
pub use quantized::QuantizedLinear;
