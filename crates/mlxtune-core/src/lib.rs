//! Core types and configuration for mlxtune LLM fine-tuning.
//!
//! This crate provides the foundational pieces shared across the mlxtune
//! workspace:
//!
//! - Error handling infrastructure
//! - Configuration types for quantization, LoRA, and training

#![warn(missing_docs)]

mod config;
mod error;

pub use config::*;
pub use error::*;
