//! Key/value cache for autoregressive decoding
//!
//! Keys and values are stored per decoder layer as
//! `[batch, num_kv_heads, positions, head_dim]`, before grouped-query
//! expansion. A decoding step runs only the newest token and attends over
//! everything appended so far.

use candle_core::{Result, Tensor};

/// Keys and values one attention layer has seen
#[derive(Debug, Clone, Default)]
pub struct LayerKv {
    keys: Option<Tensor>,
    values: Option<Tensor>,
}

impl LayerKv {
    /// Append the new positions and return the full key/value history
    pub fn append(&mut self, k: &Tensor, v: &Tensor) -> Result<(Tensor, Tensor)> {
        let keys = match &self.keys {
            Some(prev) => Tensor::cat(&[prev, k], 2)?,
            None => k.clone(),
        };
        let values = match &self.values {
            Some(prev) => Tensor::cat(&[prev, v], 2)?,
            None => v.clone(),
        };
        self.keys = Some(keys.clone());
        self.values = Some(values.clone());
        Ok((keys, values))
    }

    /// Positions stored so far
    pub fn positions(&self) -> usize {
        self.keys.as_ref().map_or(0, |k| k.dims().get(2).copied().unwrap_or(0))
    }
}

/// One [`LayerKv`] per decoder layer
#[derive(Debug, Clone, Default)]
pub struct KVCache {
    layers: Vec<LayerKv>,
}

impl KVCache {
    pub fn new(n_layers: usize) -> Self {
        Self {
            layers: vec![LayerKv::default(); n_layers],
        }
    }

    /// Positions already processed; the next token's rotary offset
    pub fn seq_len(&self) -> usize {
        self.layers.first().map_or(0, LayerKv::positions)
    }

    pub fn layer_mut(&mut self, layer: usize) -> Option<&mut LayerKv> {
        self.layers.get_mut(layer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn kv(positions: usize) -> Tensor {
        Tensor::zeros((1, 2, positions, 8), DType::F32, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_append_grows_history() {
        let mut cache = KVCache::new(2);
        assert_eq!(cache.seq_len(), 0);

        let layer = cache.layer_mut(0).unwrap();
        let (k, v) = layer.append(&kv(5), &kv(5)).unwrap();
        assert_eq!(k.dims(), &[1, 2, 5, 8]);
        assert_eq!(v.dims(), &[1, 2, 5, 8]);

        let (k, _) = layer.append(&kv(1), &kv(1)).unwrap();
        assert_eq!(k.dim(2).unwrap(), 6);
        assert_eq!(cache.seq_len(), 6);
    }

    #[test]
    fn test_layer_bounds() {
        let mut cache = KVCache::new(1);
        cache.layer_mut(0).unwrap().append(&kv(3), &kv(3)).unwrap();
        assert_eq!(cache.seq_len(), 3);
        assert!(cache.layer_mut(1).is_none());
    }
}
