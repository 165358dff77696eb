//! Parameter inspection and in-place bias edits
//!
//! - [`input_stats`]: per-output-unit mean / std of a layer's `weight`
//! - [`bias_extremes`]: min / max of the first bias found under a layer
//! - [`set_bias`]: overwrite one element of `{layer}.bias` in place

use candle_core::{DType, Tensor, D};
use serde::Serialize;
use tracing::info;

use crate::directory::LayerDirectory;
use crate::error::{InspectError, Result};

/// Per-output-unit statistics of a weight matrix
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InputStats {
    pub avgs: Vec<f32>,
    pub stds: Vec<f32>,
}

/// Bias vector with its extreme values
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BiasExtremes {
    /// Full name of the parameter that was inspected
    pub param: String,
    pub bias: Vec<f32>,
    pub min_value: f32,
    pub min_index: usize,
    pub max_value: f32,
    pub max_index: usize,
}

/// Mean and unbiased standard deviation of each row of `weight` viewed as
/// `[output_units, -1]`
pub fn row_stats(weight: &Tensor) -> Result<InputStats> {
    let out_units = weight.dims().first().copied().unwrap_or(1);
    let w = weight
        .to_dtype(DType::F32)?
        .reshape((out_units, ()))?;
    let n = w.dim(1)?;

    let mean = w.mean_keepdim(D::Minus1)?;
    let stds = if n > 1 {
        let sq_dev = w.broadcast_sub(&mean)?.sqr()?.sum(D::Minus1)?;
        (sq_dev / (n - 1) as f64)?.sqrt()?.to_vec1::<f32>()?
    } else {
        vec![0.0; out_units]
    };

    Ok(InputStats {
        avgs: mean.squeeze(D::Minus1)?.to_vec1::<f32>()?,
        stds,
    })
}

/// Values and flat indices of the minimum and maximum (first occurrence)
pub fn extremes(values: &[f32]) -> Option<(f32, usize, f32, usize)> {
    let (&first, _) = values.split_first()?;
    let mut min = (first, 0);
    let mut max = (first, 0);
    for (idx, &v) in values.iter().enumerate().skip(1) {
        if v < min.0 {
            min = (v, idx);
        }
        if v > max.0 {
            max = (v, idx);
        }
    }
    Some((min.0, min.1, max.0, max.1))
}

/// Statistics of the `weight` owned directly by `layer`
pub fn input_stats(directory: &LayerDirectory, layer: &str) -> Result<InputStats> {
    let weight = directory
        .direct_param(layer, "weight")?
        .ok_or_else(|| InspectError::missing_parameter(layer, "weight"))?;
    row_stats(weight.as_tensor())
}

/// Extremes of the first parameter under `layer` whose name mentions "bias"
pub fn bias_extremes(directory: &LayerDirectory, layer: &str) -> Result<BiasExtremes> {
    let (param, var) = directory
        .params_under(layer)?
        .into_iter()
        .find(|(name, _)| {
            let local = name.strip_prefix(layer).unwrap_or(name);
            local.to_lowercase().contains("bias")
        })
        .ok_or_else(|| InspectError::missing_parameter(layer, "bias"))?;

    let bias: Vec<f32> = var
        .as_tensor()
        .to_dtype(DType::F32)?
        .flatten_all()?
        .to_vec1()?;
    let (min_value, min_index, max_value, max_index) = extremes(&bias)
        .ok_or_else(|| InspectError::missing_parameter(layer, "bias"))?;

    Ok(BiasExtremes {
        param,
        bias,
        min_value,
        min_index,
        max_value,
        max_index,
    })
}

/// Overwrite `{layer}.bias[unit_index]` in place
///
/// The edit is permanent for the loaded weights; only a reload undoes it.
pub fn set_bias(directory: &LayerDirectory, layer: &str, unit_index: usize, value: f32) -> Result<()> {
    let name = format!("{layer}.bias");
    let var = directory
        .param(&name)
        .ok_or_else(|| InspectError::NotFound(format!("parameter '{name}'")))?;

    let tensor = var.as_tensor();
    let size = tensor.dims().first().copied().unwrap_or(0);
    if unit_index >= size {
        return Err(InspectError::out_of_range("bias unit", unit_index, size));
    }

    // one row per unit along the first dimension
    let row = tensor.elem_count() / size;
    let mut data: Vec<f32> = tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
    data[unit_index * row..(unit_index + 1) * row].fill(value);

    let updated = Tensor::from_vec(data, tensor.shape(), tensor.device())?.to_dtype(tensor.dtype())?;
    var.set(&updated)?;

    info!("Set {}[{}] = {}", name, unit_index, value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Var};
    use candle_nn::VarMap;

    fn directory() -> LayerDirectory {
        let vars = VarMap::new();
        let weight = Tensor::new(&[[1f32, 2., 3.], [4., 4., 4.]], &Device::Cpu).unwrap();
        let bias = Tensor::new(&[0.5f32, -2.0, 3.0, -2.0], &Device::Cpu).unwrap();
        let norm = Tensor::new(&[1f32, 1.], &Device::Cpu).unwrap();
        {
            let mut data = vars.data().lock().unwrap();
            data.insert("fc.weight".into(), Var::from_tensor(&weight).unwrap());
            data.insert("fc.bias".into(), Var::from_tensor(&bias).unwrap());
            data.insert("block.norm.weight".into(), Var::from_tensor(&norm).unwrap());
        }
        let mut dir = LayerDirectory::new(vars);
        dir.register("fc", "Linear");
        dir.register("block", "DecoderLayer");
        dir.register("block.norm", "RmsNorm");
        dir.finalize();
        dir
    }

    #[test]
    fn test_input_stats_rows() {
        let stats = input_stats(&directory(), "fc").unwrap();
        assert_eq!(stats.avgs, vec![2.0, 4.0]);
        assert!((stats.stds[0] - 1.0).abs() < 1e-6);
        assert_eq!(stats.stds[1], 0.0);
    }

    #[test]
    fn test_input_stats_requires_direct_weight() {
        let dir = directory();
        // block owns nothing directly; its child's weight does not count
        assert!(matches!(
            input_stats(&dir, "block"),
            Err(InspectError::MissingParameter { .. })
        ));
        assert!(matches!(input_stats(&dir, "nope"), Err(InspectError::NotFound(_))));
    }

    #[test]
    fn test_bias_extremes_first_occurrence() {
        let ext = bias_extremes(&directory(), "fc").unwrap();
        assert_eq!(ext.param, "fc.bias");
        assert_eq!((ext.min_value, ext.min_index), (-2.0, 1));
        assert_eq!((ext.max_value, ext.max_index), (3.0, 2));
        assert_eq!(ext.bias[ext.min_index], ext.min_value);
        assert_eq!(ext.bias[ext.max_index], ext.max_value);
    }

    #[test]
    fn test_bias_extremes_missing() {
        assert!(matches!(
            bias_extremes(&directory(), "block"),
            Err(InspectError::MissingParameter { .. })
        ));
    }

    #[test]
    fn test_set_bias_in_place() {
        let dir = directory();
        set_bias(&dir, "fc", 3, 9.0).unwrap();
        let ext = bias_extremes(&dir, "fc").unwrap();
        assert_eq!(ext.bias, vec![0.5, -2.0, 3.0, 9.0]);
        assert_eq!(ext.max_index, 3);

        assert!(matches!(
            set_bias(&dir, "fc", 4, 0.0),
            Err(InspectError::OutOfRange { index: 4, size: 4, .. })
        ));
        assert!(matches!(set_bias(&dir, "block.norm", 0, 0.0), Err(InspectError::NotFound(_))));
    }
}
