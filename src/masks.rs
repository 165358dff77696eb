//! Causal attention masks
//!
//! The same mask serves full-sequence passes (`start_pos == 0`, square) and
//! cached decoding steps where `new_len` queries attend to `total_len` keys.

use anyhow::Result;
use candle_core::{DType, Device, Tensor};

/// Additive mask of shape `[1, 1, new_len, total_len]`
///
/// Query `i` sits at absolute position `start_pos + i` and may attend to
/// every key at or before it. Returns `None` for a single query, which can
/// see the entire cache.
///
/// ```text
/// new_len=3, total_len=3, start_pos=0
/// [[0, -inf, -inf],
///  [0,    0, -inf],
///  [0,    0,    0]]
/// ```
pub fn causal_mask(
    new_len: usize,
    total_len: usize,
    start_pos: usize,
    device: &Device,
    dtype: DType,
) -> Result<Option<Tensor>> {
    if new_len <= 1 {
        return Ok(None);
    }
    let mask: Vec<f32> = (0..new_len)
        .flat_map(|i| {
            let visible_up_to = start_pos + i;
            (0..total_len).map(move |j| if j <= visible_up_to { 0.0 } else { f32::NEG_INFINITY })
        })
        .collect();
    let mask = Tensor::from_vec(mask, (1, 1, new_len, total_len), device)?.to_dtype(dtype)?;
    Ok(Some(mask))
}
