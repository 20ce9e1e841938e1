//! Token generation loop.
//!
//! [`TokenChunks`] is a lazy, synchronous iterator over decoded text chunks:
//! each call runs the model forward for one token at a time (KV-cached),
//! samples, and yields accumulated text every `flush_every` tokens, plus one
//! final remainder chunk. Generation is bounded by `max_tokens` and stops
//! early - without emitting it - on the end-of-sequence token.

use std::time::Instant;

use mlx_rs::{
    ops::indexing::{argmax, IndexOp},
    random::categorical,
    Array, Dtype,
};
use mlxtune_core::Result;
use mlxtune_data::Tokenize;
use mlxtune_nn::KvCache;

use crate::Model;

/// Cumulative generation statistics, measured from generation start.
#[derive(Debug, Clone, Default)]
pub struct GenerationStats {
    /// Seconds elapsed since generation started.
    pub runtime: f64,
    /// Tokens emitted so far (across all flushed chunks).
    pub num_tokens: usize,
}

/// Lazy iterator over `(decoded_chunk, stats)` pairs.
pub struct TokenChunks<'a> {
    model: &'a mut Model,
    tokenizer: &'a dyn Tokenize,
    temperature: f32,
    max_tokens: usize,
    flush_every: usize,
    eos_id: u32,

    cache: KvCache,
    next_input: Array,
    pending: Vec<u32>,
    generated: usize,
    start: Instant,
    stats: GenerationStats,
    finished: bool,
    final_flush_done: bool,
}

impl<'a> TokenChunks<'a> {
    pub(crate) fn new(
        model: &'a mut Model,
        tokenizer: &'a dyn Tokenize,
        prompt_ids: &[u32],
        temperature: f32,
        max_tokens: usize,
        flush_every: usize,
    ) -> Self {
        let cache = model.new_cache();
        let prompt: Vec<i32> = prompt_ids.iter().map(|&t| t as i32).collect();
        let next_input = Array::from_slice(&prompt, &[1, prompt.len() as i32]);

        Self {
            model,
            eos_id: tokenizer.eos_id(),
            tokenizer,
            temperature,
            max_tokens,
            flush_every: flush_every.max(1),
            cache,
            next_input,
            pending: Vec::new(),
            generated: 0,
            start: Instant::now(),
            stats: GenerationStats::default(),
            finished: false,
            final_flush_done: false,
        }
    }

    /// Run one forward pass over the pending input and sample a token.
    fn step(&mut self) -> Result<u32> {
        let logits =
            self.model
                .forward_with_cache(&self.next_input, None, Some(&mut self.cache))?;

        let last = logits.dim(1) - 1;
        let last_logits = logits.index((.., last, ..)).squeeze()?;

        // Greedy argmax at temperature zero, else categorical sampling from
        // logits scaled by the inverse temperature.
        let sampled = if self.temperature == 0.0 {
            argmax(&last_logits, None)?
        } else {
            let scaled = last_logits
                .as_dtype(Dtype::Float32)?
                .multiply(&Array::from_f32(1.0 / self.temperature))?;
            categorical(&scaled, None, None, None)?
        };
        sampled.eval()?;

        Ok(sampled.item::<u32>())
    }

    /// Decode and emit everything accumulated since the last flush.
    fn flush(&mut self) -> Result<(String, GenerationStats)> {
        let text = self.tokenizer.decode(&self.pending)?;

        self.stats.num_tokens += self.pending.len();
        self.stats.runtime = self.start.elapsed().as_secs_f64();
        self.pending.clear();

        Ok((text, self.stats.clone()))
    }
}

impl Iterator for TokenChunks<'_> {
    type Item = Result<(String, GenerationStats)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.final_flush_done {
            return None;
        }

        loop {
            if self.finished || self.generated >= self.max_tokens {
                self.final_flush_done = true;
                return Some(self.flush());
            }

            let token = match self.step() {
                Ok(token) => token,
                Err(e) => {
                    self.final_flush_done = true;
                    return Some(Err(e));
                }
            };

            // Stop immediately on end-of-sequence, without emitting it.
            if token == self.eos_id {
                self.finished = true;
                continue;
            }

            self.pending.push(token);
            self.generated += 1;
            self.next_input = Array::from_slice(&[token as i32], &[1, 1]);

            if self.pending.len() == self.flush_every {
                return Some(self.flush());
            }
        }
    }
}
