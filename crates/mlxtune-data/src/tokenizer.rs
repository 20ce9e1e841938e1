//! Tokenizer integration.

use std::path::Path;

use mlxtune_core::{MlxTuneError, Result};

/// The tokenizer interface the model wrapper and generation loop consume.
///
/// Tokenization itself is an external collaborator; anything that can map
/// text to token ids and back, and name its end-of-sequence token, works.
pub trait Tokenize {
    /// Encode text to token ids.
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Decode token ids to text.
    fn decode(&self, ids: &[u32]) -> Result<String>;

    /// The end-of-sequence token id.
    fn eos_id(&self) -> u32;
}

/// Wrapper around the `tokenizers` library.
pub struct Tokenizer {
    inner: tokenizers::Tokenizer,
    eos_id: u32,
}

impl Tokenizer {
    /// Load a tokenizer from a local `tokenizer.json` file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let inner = tokenizers::Tokenizer::from_file(path)
            .map_err(|e| MlxTuneError::Tokenizer(e.to_string()))?;
        Ok(Self::from_inner(inner))
    }

    /// Load a tokenizer from serialized bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let inner = tokenizers::Tokenizer::from_bytes(bytes)
            .map_err(|e| MlxTuneError::Tokenizer(e.to_string()))?;
        Ok(Self::from_inner(inner))
    }

    fn from_inner(inner: tokenizers::Tokenizer) -> Self {
        let eos_id = inner
            .token_to_id("</s>")
            .or_else(|| inner.token_to_id("<|endoftext|>"))
            .or_else(|| inner.token_to_id("<|end_of_text|>"))
            .or_else(|| inner.token_to_id("<eos>"))
            .unwrap_or_else(|| {
                tracing::warn!("No end-of-sequence token found in vocabulary, using id 0");
                0
            });

        Self { inner, eos_id }
    }

    /// Vocabulary size.
    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}

impl Tokenize for Tokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| MlxTuneError::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        self.inner
            .decode(ids, true)
            .map_err(|e| MlxTuneError::Tokenizer(e.to_string()))
    }

    fn eos_id(&self) -> u32 {
        self.eos_id
    }
}
