//! Token-id dataset with language-model batch iteration.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use mlx_rs::Array;
use mlxtune_core::{MlxTuneError, Result};

use crate::Tokenize;

/// Target positions carrying this value are excluded from the loss.
pub const IGNORE_INDEX: i32 = -100;

/// One training batch: next-token inputs and targets plus the number of
/// real (unpadded) target tokens.
#[derive(Debug)]
pub struct Batch {
    /// Input token ids `[batch, seq]`, int32.
    pub inputs: Array,
    /// Shifted target token ids `[batch, seq]`, int32, padded with
    /// [`IGNORE_INDEX`].
    pub targets: Array,
    /// Number of real target tokens in this batch.
    pub num_tokens: usize,
}

/// Dataset of pre-tokenized sequences.
#[derive(Debug, Clone)]
pub struct TokenDataset {
    sequences: Vec<Vec<u32>>,
    max_length: usize,
    seed: u64,
}

impl TokenDataset {
    /// Create a dataset from token-id sequences.
    ///
    /// Sequences shorter than two tokens cannot produce a next-token pair
    /// and are dropped.
    pub fn from_samples(sequences: Vec<Vec<u32>>, max_length: usize) -> Self {
        let sequences = sequences
            .into_iter()
            .filter(|s| s.len() >= 2)
            .map(|mut s| {
                s.truncate(max_length);
                s
            })
            .collect();

        Self {
            sequences,
            max_length,
            seed: 42,
        }
    }

    /// Load a JSONL file of `{"text": ...}` records, tokenizing each line
    /// and appending the end-of-sequence token.
    pub fn from_jsonl<P: AsRef<Path>>(
        path: P,
        tokenizer: &dyn Tokenize,
        max_length: usize,
    ) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let reader = BufReader::new(file);

        let mut sequences = Vec::new();
        for (line_num, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }

            let record: serde_json::Value = serde_json::from_str(&line).map_err(|e| {
                MlxTuneError::Config(format!("invalid JSON on line {}: {}", line_num + 1, e))
            })?;
            let text = record.get("text").and_then(|t| t.as_str()).ok_or_else(|| {
                MlxTuneError::Config(format!("missing \"text\" field on line {}", line_num + 1))
            })?;

            let mut ids = tokenizer.encode(text)?;
            ids.push(tokenizer.eos_id());
            sequences.push(ids);
        }

        Ok(Self::from_samples(sequences, max_length))
    }

    /// Set the shuffling seed.
    pub fn set_seed(&mut self, seed: u64) {
        self.seed = seed;
    }

    /// Number of sequences.
    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    /// Whether the dataset is empty.
    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    /// Split off a validation set of `val_ratio` of the samples.
    pub fn train_val_split(mut self, val_ratio: f32, seed: u64) -> (Self, Self) {
        use rand::seq::SliceRandom;
        use rand::SeedableRng;
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        self.sequences.shuffle(&mut rng);

        let val_size = (self.sequences.len() as f32 * val_ratio).round() as usize;
        let val_sequences = self.sequences.split_off(self.sequences.len() - val_size);

        let validation = Self {
            sequences: val_sequences,
            max_length: self.max_length,
            seed: self.seed,
        };
        (self, validation)
    }

    /// Iterate over batches of `batch_size` sequences.
    ///
    /// With `train` the pass order is shuffled (deterministically from the
    /// dataset seed); otherwise sequences are visited in order. The ragged
    /// tail that does not fill a whole batch is dropped.
    pub fn iterate_batches(&self, batch_size: usize, train: bool) -> BatchIterator<'_> {
        self.iterate_batches_seeded(batch_size, train, self.seed)
    }

    /// Like [`iterate_batches`](Self::iterate_batches) with an explicit
    /// shuffle seed, so successive training passes can reorder differently.
    pub fn iterate_batches_seeded(
        &self,
        batch_size: usize,
        train: bool,
        seed: u64,
    ) -> BatchIterator<'_> {
        let mut order: Vec<usize> = (0..self.sequences.len()).collect();
        if train {
            use rand::seq::SliceRandom;
            use rand::SeedableRng;
            let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
            order.shuffle(&mut rng);
        }

        BatchIterator {
            dataset: self,
            order,
            position: 0,
            batch_size,
        }
    }

    /// The configured shuffle seed.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    fn make_batch(&self, indices: &[usize]) -> Batch {
        // Pad to the longest sequence in the batch.
        let seq_len = indices
            .iter()
            .map(|&i| self.sequences[i].len() - 1)
            .max()
            .unwrap_or(0);

        let batch = indices.len();
        let mut inputs = vec![0i32; batch * seq_len];
        let mut targets = vec![IGNORE_INDEX; batch * seq_len];
        let mut num_tokens = 0usize;

        for (row, &i) in indices.iter().enumerate() {
            let seq = &self.sequences[i];
            let len = seq.len() - 1;
            for j in 0..len {
                inputs[row * seq_len + j] = seq[j] as i32;
                targets[row * seq_len + j] = seq[j + 1] as i32;
            }
            num_tokens += len;
        }

        Batch {
            inputs: Array::from_slice(&inputs, &[batch as i32, seq_len as i32]),
            targets: Array::from_slice(&targets, &[batch as i32, seq_len as i32]),
            num_tokens,
        }
    }
}

/// Iterator over the batches of one dataset pass.
pub struct BatchIterator<'a> {
    dataset: &'a TokenDataset,
    order: Vec<usize>,
    position: usize,
    batch_size: usize,
}

impl Iterator for BatchIterator<'_> {
    type Item = Batch;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position + self.batch_size > self.order.len() {
            return None;
        }

        let indices = &self.order[self.position..self.position + self.batch_size];
        self.position += self.batch_size;

        Some(self.dataset.make_batch(indices))
    }
}
