//! Per-layer key/value cache for autoregressive decoding.
//!
//! The cache is an opaque collaborator of the generation loop: each decode
//! step appends the new key/value tensors for every layer and reads back the
//! full history, so only the newest token needs a forward pass.

use mlx_rs::{error::Exception, ops::concatenate_axis, Array};

#[derive(Debug, Default)]
struct LayerCache {
    keys: Option<Array>,
    values: Option<Array>,
}

/// Key/value cache over all decoder layers.
///
/// Tensors are stored in attention layout `[batch, heads, seq, head_dim]`;
/// the sequence axis grows by concatenation.
#[derive(Debug)]
pub struct KvCache {
    layers: Vec<LayerCache>,
    offset: i32,
}

impl KvCache {
    /// Create an empty cache for `num_layers` decoder layers.
    pub fn new(num_layers: usize) -> Self {
        Self {
            layers: (0..num_layers).map(|_| LayerCache::default()).collect(),
            offset: 0,
        }
    }

    /// Position offset of the next token (number of cached positions).
    pub fn offset(&self) -> i32 {
        self.offset
    }

    /// Number of positions cached for one layer, before its next update.
    /// This is the RoPE position offset for that layer's incoming tokens.
    pub fn layer_offset(&self, layer_idx: usize) -> i32 {
        self.layers
            .get(layer_idx)
            .and_then(|layer| layer.keys.as_ref())
            .map(|keys| keys.dim(2))
            .unwrap_or(0)
    }

    /// Whether the cache holds no tokens yet.
    pub fn is_empty(&self) -> bool {
        self.offset == 0
    }

    /// Drop all cached history.
    pub fn reset(&mut self) {
        for layer in &mut self.layers {
            layer.keys = None;
            layer.values = None;
        }
        self.offset = 0;
    }

    /// Append `new_keys`/`new_values` for one layer and return the full
    /// cached history including them.
    pub fn update_and_fetch(
        &mut self,
        layer_idx: usize,
        new_keys: &Array,
        new_values: &Array,
    ) -> Result<(Array, Array), Exception> {
        if layer_idx >= self.layers.len() {
            return Err(Exception::custom(format!(
                "layer index {} out of range (num_layers={})",
                layer_idx,
                self.layers.len()
            )));
        }

        // The position offset advances once per forward pass, counted at
        // the first layer.
        if layer_idx == 0 {
            self.offset += new_keys.dim(2);
        }

        let layer = &mut self.layers[layer_idx];
        let (keys, values) = match (&layer.keys, &layer.values) {
            (Some(keys), Some(values)) => (
                concatenate_axis(&[keys, new_keys], 2)?,
                concatenate_axis(&[values, new_values], 2)?,
            ),
            _ => (new_keys.clone(), new_values.clone()),
        };

        layer.keys = Some(keys.clone());
        layer.values = Some(values.clone());

        Ok((keys, values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_cache_grows_along_sequence_axis() {
        let mut cache = KvCache::new(2);
        assert!(cache.is_empty());

        let k = mlx_rs::random::normal::<f32>(&[1, 4, 3, 8], None, None, None).unwrap();
        let v = mlx_rs::random::normal::<f32>(&[1, 4, 3, 8], None, None, None).unwrap();

        let (keys, values) = cache.update_and_fetch(0, &k, &v).unwrap();
        assert_eq!(keys.shape(), &[1, 4, 3, 8]);
        assert_eq!(values.shape(), &[1, 4, 3, 8]);
        cache.update_and_fetch(1, &k, &v).unwrap();
        assert_eq!(cache.offset(), 3);

        let k1 = mlx_rs::random::normal::<f32>(&[1, 4, 1, 8], None, None, None).unwrap();
        let v1 = mlx_rs::random::normal::<f32>(&[1, 4, 1, 8], None, None, None).unwrap();

        let (keys, _) = cache.update_and_fetch(0, &k1, &v1).unwrap();
        assert_eq!(keys.shape(), &[1, 4, 4, 8]);
        assert_eq!(cache.offset(), 4);
    }

    #[test]
    #[serial]
    fn test_cache_reset() {
        let mut cache = KvCache::new(1);
        let k = mlx_rs::random::normal::<f32>(&[1, 2, 2, 4], None, None, None).unwrap();
        cache.update_and_fetch(0, &k, &k).unwrap();
        assert_eq!(cache.offset(), 2);

        cache.reset();
        assert!(cache.is_empty());
    }

    #[test]
    #[serial]
    fn test_cache_layer_out_of_range() {
        let mut cache = KvCache::new(1);
        let k = mlx_rs::random::normal::<f32>(&[1, 2, 1, 4], None, None, None).unwrap();
        assert!(cache.update_and_fetch(3, &k, &k).is_err());
    }
}
