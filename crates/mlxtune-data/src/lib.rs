//! Tokenizer integration and token-id datasets for mlxtune.
//!
//! Tokenization internals and dataset loading policy are external
//! collaborators; this crate only defines the seams the rest of the
//! workspace consumes: the [`Tokenize`] trait and a dataset of pre-tokenized
//! sequences with LM-style batch iteration.

mod dataset;
mod tokenizer;

pub use dataset::{Batch, BatchIterator, TokenDataset, IGNORE_INDEX};
pub use tokenizer::{Tokenize, Tokenizer};
