//! The inspector: one loaded model plus its session
//!
//! Every exposed operation lives here. Capture and override follow the same
//! protocol: resolve the layer, resolve the token span, attach a hook,
//! run one forward pass, detach. The hook is held as a [`HookHandle`], so
//! detachment happens on every exit path.
//!
//! An `Inspector` is not reentrant; share it behind a lock (see
//! [`ModelRegistry`](crate::ModelRegistry)).
//!
//! [`HookHandle`]: crate::hooks::HookHandle

use std::sync::{Arc, Mutex, PoisonError};

use candle_core::{DType, IndexOp, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tracing::{debug, info};

use crate::architecture::ArchitectureSummary;
use crate::directory::LayerEntry;
use crate::error::{InspectError, Result};
use crate::model::{InspectBackend, LoadOptions, ModelHandle};
use crate::session::{GenerationSettings, SessionState};
use crate::stats::{self, BiasExtremes, InputStats};
use crate::timestep::{prompt_span, resolve_span, TokenSpan};

/// Number of next-token predictions reported after an override
pub const OVERRIDE_TOP_K: usize = 5;

/// A module's output captured over a token span
#[derive(Debug, Clone, Serialize)]
pub struct Activation {
    pub layer: String,
    /// Words covered by the span (after clamping)
    pub words: usize,
    pub token_ids: Vec<u32>,
    /// `[1, tokens, units]`
    pub shape: Vec<usize>,
    pub values: Vec<Vec<Vec<f32>>>,
}

/// A single token prediction
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenPrediction {
    pub token_id: u32,
    pub token: String,
    pub probability: f32,
}

/// Downstream view of an override pass
#[derive(Debug, Clone, Serialize)]
pub struct OverrideReport {
    pub layer: String,
    pub unit_index: usize,
    pub value: f32,
    pub token_ids: Vec<u32>,
    /// Next-token distribution after the overridden span
    pub predictions: Vec<TokenPrediction>,
}

pub struct Inspector {
    model_name: String,
    options: LoadOptions,
    /// `None` only after a failed reset
    handle: Option<ModelHandle>,
    session: SessionState,
    rng: StdRng,
    decode_calls: u64,
}

impl std::fmt::Debug for Inspector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inspector")
            .field("model_name", &self.model_name)
            .field("loaded", &self.handle.is_some())
            .field("session", &self.session)
            .finish()
    }
}

fn loaded<'a>(handle: &'a Option<ModelHandle>, name: &str) -> Result<&'a ModelHandle> {
    handle
        .as_ref()
        .ok_or_else(|| InspectError::NotFound(format!("model '{name}' is not loaded")))
}

impl Inspector {
    /// Load `model_name` (see [`ModelHandle::load`] for name resolution)
    pub fn load(model_name: &str, options: LoadOptions) -> Result<Self> {
        let handle = ModelHandle::load(model_name, &options)?;
        Ok(Self {
            model_name: model_name.to_string(),
            rng: StdRng::seed_from_u64(options.seed),
            options,
            handle: Some(handle),
            session: SessionState::new(),
            decode_calls: 0,
        })
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn options(&self) -> &LoadOptions {
        &self.options
    }

    /// Read-only snapshot of the session
    pub fn session(&self) -> &SessionState {
        &self.session
    }

    pub fn handle(&self) -> Result<&ModelHandle> {
        loaded(&self.handle, &self.model_name)
    }

    pub fn backend(&self) -> Result<&dyn InspectBackend> {
        Ok(self.handle()?.backend())
    }

    /// How many times the model's decoder has been invoked
    pub fn decode_calls(&self) -> u64 {
        self.decode_calls
    }

    /// Generate a continuation of `prompt`, including the prompt
    ///
    /// Returns the cached output without decoding when `prompt` matches the
    /// current prompt.
    pub fn generate(&mut self, prompt: &str) -> Result<String> {
        if let Some(cached) = self.session.cached_output(prompt) {
            debug!("Prompt unchanged, returning cached output");
            return Ok(cached.to_string());
        }
        let handle = loaded(&self.handle, &self.model_name)?;

        self.session.begin_prompt(prompt);
        let settings = self.session.settings();
        self.decode_calls += 1;

        let text = (|| -> anyhow::Result<String> {
            let ids = handle.codec().encode(prompt)?;
            let out = handle.generate_ids(&ids, settings.max_new_tokens, settings, &mut self.rng)?;
            info!("{}: generated {} new tokens", handle.name(), out.len().saturating_sub(ids.len()));
            handle.codec().decode(&out)
        })()
        .map_err(|e| InspectError::GenerationFailure(format!("{e:#}")))?;

        self.session.record_output(text.clone());
        Ok(text)
    }

    /// Module names in pre-order, root excluded
    pub fn list_layers(&self) -> Result<Vec<String>> {
        Ok(self.backend()?.modules().names())
    }

    /// Module names with declared type and coarse kind
    pub fn describe_layers(&self) -> Result<Vec<LayerEntry>> {
        Ok(self.backend()?.modules().entries())
    }

    pub fn architecture(&self) -> Result<ArchitectureSummary> {
        Ok(ArchitectureSummary::build(self.backend()?.modules()))
    }

    /// Capture `layer`'s output over the span selected by the current
    /// timestep, extending the text by generation when needed
    ///
    /// An extension is kept in the session, so with the prompt unchanged a
    /// larger timestep always covers the span of a smaller one.
    pub fn capture_activations(&mut self, layer: &str) -> Result<Activation> {
        let handle = loaded(&self.handle, &self.model_name)?;
        let backend = handle.backend();
        backend.modules().resolve(layer)?;

        let settings = self.session.settings();
        let rng = &mut self.rng;
        let decode_calls = &mut self.decode_calls;
        let span = resolve_span(
            handle.codec(),
            self.session.base_text(),
            self.session.timestep(),
            |ids, max_new_tokens| {
                *decode_calls += 1;
                handle.generate_ids(ids, max_new_tokens, settings, rng)
            },
        )?;
        if let Some(text) = &span.extension {
            self.session.record_extension(text.clone());
        }
        debug!("Capturing '{}' over {} tokens", layer, span.token_ids.len());

        let slot: Arc<Mutex<Option<Tensor>>> = Arc::default();
        let sink = Arc::clone(&slot);
        let hook = backend.hooks().attach(layer, move |output| {
            let mut captured = sink.lock().unwrap_or_else(PoisonError::into_inner);
            if captured.is_none() {
                *captured = Some(output.clone());
            }
            Ok(None)
        });
        let input = handle.input_tensor(&span.token_ids)?;
        backend.forward(&input)?;
        drop(hook);

        let captured = slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| InspectError::CaptureFailed(layer.to_string()))?;
        activation(layer, &span, &captured)
    }

    /// Run the current prompt (truncated to the timestep) with `layer`'s
    /// output at `unit_index` of the last position forced to `value`
    ///
    /// Nothing persists after the call; the report shows the downstream
    /// next-token distribution.
    pub fn override_unit(&mut self, layer: &str, unit_index: usize, value: f32) -> Result<OverrideReport> {
        let handle = self.handle()?;
        let backend = handle.backend();
        backend.modules().resolve(layer)?;

        let prompt = self
            .session
            .established_prompt()
            .ok_or(InspectError::EmptyContext)?;
        let span = prompt_span(handle.codec(), prompt, self.session.timestep())?;
        debug!(
            "Overriding '{}'[{}] = {} over {} tokens",
            layer,
            unit_index,
            value,
            span.token_ids.len()
        );

        let hook = backend.hooks().attach(layer, move |output| {
            overwrite_last_position(output, unit_index, value).map(Some)
        });
        let input = handle.input_tensor(&span.token_ids)?;
        let logits = backend.forward(&input)?;
        let fired = hook.fired();
        drop(hook);

        if !fired {
            return Err(InspectError::CaptureFailed(layer.to_string()));
        }

        let last = logits.i((0, span.token_ids.len() - 1))?;
        let predictions = top_predictions(&last, OVERRIDE_TOP_K)?
            .into_iter()
            .map(|(token_id, probability)| -> anyhow::Result<TokenPrediction> {
                Ok(TokenPrediction {
                    token_id,
                    token: handle.codec().decode(&[token_id])?,
                    probability,
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(OverrideReport {
            layer: layer.to_string(),
            unit_index,
            value,
            token_ids: span.token_ids,
            predictions,
        })
    }

    pub fn input_stats(&self, layer: &str) -> Result<InputStats> {
        stats::input_stats(self.backend()?.modules(), layer)
    }

    pub fn bias_extremes(&self, layer: &str) -> Result<BiasExtremes> {
        stats::bias_extremes(self.backend()?.modules(), layer)
    }

    /// Permanently overwrite `{layer}.bias[unit_index]`
    pub fn set_bias(&mut self, layer: &str, unit_index: usize, value: f32) -> Result<()> {
        stats::set_bias(self.backend()?.modules(), layer, unit_index, value)?;
        self.session.invalidate_output();
        Ok(())
    }

    /// Any integer is accepted; non-positive values fail when a span is
    /// resolved
    pub fn set_timestep(&mut self, timestep: i64) {
        debug!("Timestep set to {}", timestep);
        self.session.set_timestep(timestep);
    }

    pub fn set_generation_settings(&mut self, settings: GenerationSettings) {
        debug!("Generation settings set to {:?}", settings);
        self.session.set_settings(settings);
    }

    /// Drop the model and load a fresh copy, undoing weight edits
    ///
    /// Prompt, timestep and settings are kept; the cached output is not.
    pub fn reset(&mut self) -> Result<()> {
        info!("Resetting model '{}'", self.model_name);
        self.session.invalidate_output();
        // release the old weights before allocating new ones
        self.handle = None;
        self.handle = Some(ModelHandle::load(&self.model_name, &self.options)?);
        self.rng = StdRng::seed_from_u64(self.options.seed);
        Ok(())
    }
}

fn activation(layer: &str, span: &TokenSpan, captured: &Tensor) -> Result<Activation> {
    let tensor = match captured.rank() {
        3 => captured.clone(),
        _ => captured.flatten_all()?.unsqueeze(0)?.unsqueeze(0)?,
    };
    Ok(Activation {
        layer: layer.to_string(),
        words: span.words,
        token_ids: span.token_ids.clone(),
        shape: tensor.dims().to_vec(),
        values: tensor.to_dtype(DType::F32)?.to_vec3()?,
    })
}

/// Copy of `output` (`[batch, seq, units]`) with the last position's
/// `unit_index` set to `value`
fn overwrite_last_position(output: &Tensor, unit_index: usize, value: f32) -> anyhow::Result<Tensor> {
    let (batch, positions, width) = output.dims3()?;
    if unit_index >= width {
        return Err(InspectError::out_of_range("unit", unit_index, width).into());
    }

    let mut mask = vec![0f32; batch * positions * width];
    for b in 0..batch {
        mask[(b * positions + positions - 1) * width + unit_index] = 1.0;
    }
    let mask = Tensor::from_vec(mask, (batch, positions, width), output.device())?
        .to_dtype(output.dtype())?;
    let keep = mask.affine(-1.0, 1.0)?;
    Ok(((output * &keep)? + (mask * f64::from(value))?)?)
}

/// Top-k `(token_id, probability)` pairs of a logit vector
fn top_predictions(logits: &Tensor, k: usize) -> anyhow::Result<Vec<(u32, f32)>> {
    let probs = candle_nn::ops::softmax_last_dim(&logits.to_dtype(DType::F32)?)?;
    let probs_vec: Vec<f32> = probs.flatten_all()?.to_vec1()?;

    let mut indexed: Vec<(usize, f32)> = probs_vec.iter().copied().enumerate().collect();
    indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    Ok(indexed
        .into_iter()
        .take(k)
        .map(|(idx, prob)| (idx as u32, prob))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use candle_core::Device;

    const DOWN_PROJ: &str = "model.layers.0.mlp.down_proj";

    fn demo() -> Inspector {
        let options = LoadOptions {
            force_cpu: true,
            ..LoadOptions::default()
        };
        let mut inspector = Inspector::load("demo", options).unwrap();
        inspector.set_generation_settings(GenerationSettings {
            max_new_tokens: 6,
            temperature: 0.0,
        });
        inspector
    }

    fn hooks_left(inspector: &Inspector) -> usize {
        inspector.backend().unwrap().hooks().attached()
    }

    #[test]
    fn test_generate_is_cached() {
        let mut inspector = demo();
        let first = inspector.generate("the cat").unwrap();
        assert!(first.starts_with("the cat"));
        assert_eq!(inspector.decode_calls(), 1);

        let second = inspector.generate("the cat").unwrap();
        assert_eq!(first, second);
        assert_eq!(inspector.decode_calls(), 1);

        inspector.generate("a dog").unwrap();
        assert_eq!(inspector.decode_calls(), 2);
    }

    #[test]
    fn test_settings_change_forces_decode() {
        let mut inspector = demo();
        inspector.generate("hello").unwrap();
        inspector.set_generation_settings(GenerationSettings {
            max_new_tokens: 2,
            temperature: 0.0,
        });
        inspector.generate("hello").unwrap();
        assert_eq!(inspector.decode_calls(), 2);
    }

    #[test]
    fn test_empty_prompt_is_generation_failure() {
        let mut inspector = demo();
        let err = inspector.generate("").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::GenerationFailure);
        assert!(inspector.session().output().is_none());
    }

    #[test]
    fn test_capture_shape_follows_timestep() {
        let mut inspector = demo();
        inspector.generate("ab cd ef").unwrap();
        inspector.set_timestep(2);
        let act = inspector.capture_activations("model.layers.1.mlp.up_proj").unwrap();
        // "ab cd" is 5 bytes
        assert_eq!(act.shape, vec![1, 5, 64]);
        assert_eq!(act.values[0].len(), 5);
        assert_eq!(act.values[0][0].len(), 64);
        assert_eq!(hooks_left(&inspector), 0);
    }

    #[test]
    fn test_capture_without_prompt_is_empty_context() {
        let mut inspector = demo();
        let err = inspector.capture_activations(DOWN_PROJ).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EmptyContext);
    }

    #[test]
    fn test_capture_container_fails_and_detaches() {
        let mut inspector = demo();
        inspector.generate("one two").unwrap();
        let err = inspector.capture_activations("model.layers").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CaptureFailed);
        assert_eq!(hooks_left(&inspector), 0);
        let (attached, detached) = inspector.backend().unwrap().hooks().counters();
        assert_eq!(attached, detached);
    }

    #[test]
    fn test_override_requires_prompt() {
        let mut inspector = demo();
        let err = inspector.override_unit(DOWN_PROJ, 0, 1.0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EmptyContext);
    }

    #[test]
    fn test_override_bounds() {
        let mut inspector = demo();
        inspector.generate("x y").unwrap();

        inspector.set_timestep(3);
        let err = inspector.override_unit(DOWN_PROJ, 0, 1.0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfRange);

        inspector.set_timestep(0);
        let err = inspector.override_unit(DOWN_PROJ, 0, 1.0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTimestep);

        inspector.set_timestep(2);
        // down_proj outputs the 32-wide hidden state
        let err = inspector.override_unit(DOWN_PROJ, 32, 1.0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfRange);
        assert_eq!(hooks_left(&inspector), 0);
    }

    #[test]
    fn test_override_changes_downstream() {
        let mut inspector = demo();
        inspector.generate("so it goes").unwrap();
        inspector.set_timestep(3);
        let low = inspector.override_unit(DOWN_PROJ, 3, -8.0).unwrap();
        let high = inspector.override_unit(DOWN_PROJ, 3, 8.0).unwrap();
        assert_eq!(low.token_ids, high.token_ids);
        assert_ne!(low.predictions, high.predictions);
        assert_eq!(hooks_left(&inspector), 0);
    }

    /// Capture at timesteps 3..=7 past a two-token output
    fn assert_spans_nest(temperature: f32) {
        let mut inspector = demo();
        inspector.set_generation_settings(GenerationSettings {
            max_new_tokens: 2,
            temperature,
        });
        let output = inspector.generate("ab cd").unwrap();

        let mut prev: Vec<u32> = Vec::new();
        for t in 3..=7 {
            inspector.set_timestep(t);
            let act = inspector.capture_activations(DOWN_PROJ).unwrap();
            assert!(
                act.token_ids.starts_with(&prev),
                "timestep {t} span does not extend timestep {}",
                t - 1
            );
            prev = act.token_ids;
        }
        assert!(inspector.session().extension().is_some());
        assert_eq!(inspector.session().output(), Some(output.as_str()));
        assert_eq!(hooks_left(&inspector), 0);
    }

    #[test]
    fn test_extension_spans_nest_greedy() {
        assert_spans_nest(0.0);
    }

    #[test]
    fn test_extension_spans_nest_sampled() {
        assert_spans_nest(1.0);
    }

    #[test]
    fn test_extension_dropped_with_new_prompt() {
        let mut inspector = demo();
        inspector.generate("ab").unwrap();
        inspector.set_timestep(9);
        inspector.capture_activations(DOWN_PROJ).unwrap();
        assert!(inspector.session().extension().is_some());

        inspector.generate("cd").unwrap();
        assert!(inspector.session().extension().is_none());
    }

    #[test]
    fn test_set_bias_then_reset() {
        let mut inspector = demo();
        let before = inspector.bias_extremes(DOWN_PROJ).unwrap();

        inspector.set_bias(DOWN_PROJ, 0, 50.0).unwrap();
        let edited = inspector.bias_extremes(DOWN_PROJ).unwrap();
        assert_eq!((edited.max_value, edited.max_index), (50.0, 0));

        inspector.set_timestep(4);
        inspector.reset().unwrap();
        let after = inspector.bias_extremes(DOWN_PROJ).unwrap();
        assert_eq!(after.bias, before.bias);
        assert_eq!(inspector.session().timestep(), 4);
    }

    #[test]
    fn test_unknown_layer() {
        let mut inspector = demo();
        inspector.generate("hi there").unwrap();
        for err in [
            inspector.capture_activations("nonexistent.layer").unwrap_err(),
            inspector.input_stats("nonexistent.layer").unwrap_err(),
            inspector.set_bias("nonexistent.layer", 0, 0.0).unwrap_err(),
        ] {
            assert_eq!(err.kind(), ErrorKind::NotFound);
        }
    }

    #[test]
    fn test_overwrite_last_position() {
        let t = Tensor::zeros((1, 2, 3), DType::F32, &Device::Cpu).unwrap();
        let out = overwrite_last_position(&t, 1, 7.0).unwrap();
        assert_eq!(
            out.to_vec3::<f32>().unwrap(),
            vec![vec![vec![0.0, 0.0, 0.0], vec![0.0, 7.0, 0.0]]]
        );
        // input untouched
        assert_eq!(t.sum_all().unwrap().to_scalar::<f32>().unwrap(), 0.0);
    }
}
