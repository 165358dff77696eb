//! LLaMA-family decoder with named, hookable modules
//!
//! One implementation covers LLaMA, Mistral and Qwen2 checkpoints (they
//! differ only in biases, tying and defaults) plus the built-in demo
//! configuration. Every module is registered in a [`LayerDirectory`] under
//! its HuggingFace name while the model is built, and every module's
//! forward passes its output through the [`HookRegistry`]:
//!
//! ```text
//! model                                  DecoderStack  (fires after final norm)
//! model.embed_tokens                     Embedding
//! model.layers                           ModuleList    (container, never fires)
//! model.layers.{i}                       DecoderLayer
//! model.layers.{i}.self_attn             Attention
//! model.layers.{i}.self_attn.{q,k,v,o}_proj  Linear
//! model.layers.{i}.mlp                   Mlp
//! model.layers.{i}.mlp.{gate,up,down}_proj   Linear
//! model.layers.{i}.input_layernorm       RmsNorm
//! model.layers.{i}.post_attention_layernorm  RmsNorm
//! model.norm                             RmsNorm
//! lm_head                                Linear
//! ```

use anyhow::{bail, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::rotary_emb::rope;
use candle_nn::{embedding, linear_b, rms_norm, Embedding, Linear, RmsNorm, VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::Rng;
use serde::Deserialize;
use tracing::info;

use crate::directory::LayerDirectory;
use crate::hooks::{HookRegistry, Hooked};
use crate::kv_cache::{KVCache, LayerKv};
use crate::masks::causal_mask;

/// Name of the backbone module
pub const BACKBONE: &str = "model";
/// Name of the decoder layer container
pub const LAYER_LIST: &str = "model.layers";

/// Decoder hyperparameters (field names match HuggingFace `config.json`)
#[derive(Debug, Clone, Deserialize)]
pub struct DecoderConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_attention_heads: usize,
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    #[serde(default)]
    pub head_dim: Option<usize>,
    pub num_hidden_layers: usize,
    pub vocab_size: usize,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default)]
    pub tie_word_embeddings: bool,
    /// Bias on all four attention projections (LLaMA-style flag)
    #[serde(default)]
    pub attention_bias: bool,
    #[serde(default)]
    pub mlp_bias: bool,
    /// Bias on q/k/v only; set by the loader for Qwen2
    #[serde(skip)]
    pub qkv_bias: bool,
}

fn default_rope_theta() -> f64 {
    10_000.0
}

fn default_rms_norm_eps() -> f64 {
    1e-5
}

fn default_max_position_embeddings() -> usize {
    4096
}

impl DecoderConfig {
    /// Two-layer byte-vocabulary model with biases everywhere
    pub fn demo() -> Self {
        Self {
            hidden_size: 32,
            intermediate_size: 64,
            num_attention_heads: 4,
            num_key_value_heads: Some(2),
            head_dim: None,
            num_hidden_layers: 2,
            vocab_size: 256,
            rope_theta: default_rope_theta(),
            rms_norm_eps: default_rms_norm_eps(),
            max_position_embeddings: 512,
            tie_word_embeddings: false,
            attention_bias: true,
            mlp_bias: true,
            qkv_bias: true,
        }
    }

    pub fn kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
            .unwrap_or(self.hidden_size / self.num_attention_heads)
    }

    fn validate(&self) -> Result<()> {
        let kv = self.kv_heads();
        if self.num_attention_heads == 0 || kv == 0 || self.num_attention_heads % kv != 0 {
            bail!(
                "{} attention heads cannot be grouped over {} key/value heads",
                self.num_attention_heads,
                kv
            );
        }
        if self.head_dim() % 2 != 0 {
            bail!("rotary embeddings need an even head_dim, got {}", self.head_dim());
        }
        Ok(())
    }
}

/// Rotary position embeddings (rotate-half layout)
struct RotaryEmbedding {
    cos: Tensor,
    sin: Tensor,
}

impl RotaryEmbedding {
    fn new(head_dim: usize, max_seq_len: usize, theta: f64, device: &Device, dtype: DType) -> Result<Self> {
        let inv_freq: Vec<f32> = (0..head_dim)
            .step_by(2)
            .map(|i| (1.0 / theta.powf(i as f64 / head_dim as f64)) as f32)
            .collect();
        let half = inv_freq.len();
        let inv_freq = Tensor::from_vec(inv_freq, (1, half), device)?;
        let positions = Tensor::arange(0u32, max_seq_len as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((max_seq_len, 1))?;

        // [max_seq_len, head_dim / 2]
        let freqs = positions.matmul(&inv_freq)?;
        Ok(Self {
            cos: freqs.cos()?.to_dtype(dtype)?,
            sin: freqs.sin()?.to_dtype(dtype)?,
        })
    }

    fn apply(&self, q: &Tensor, k: &Tensor, start_pos: usize) -> Result<(Tensor, Tensor)> {
        let seq_len = q.dim(2)?;
        let cos = self.cos.narrow(0, start_pos, seq_len)?;
        let sin = self.sin.narrow(0, start_pos, seq_len)?;
        Ok((rope(q, &cos, &sin)?, rope(k, &cos, &sin)?))
    }
}

fn hooked_linear(
    in_dim: usize,
    out_dim: usize,
    bias: bool,
    vb: VarBuilder,
    directory: &mut LayerDirectory,
) -> Result<Hooked<Linear>> {
    let name = vb.prefix();
    directory.register(&name, "Linear");
    Ok(Hooked::new(linear_b(in_dim, out_dim, bias, vb)?, name))
}

fn hooked_rms_norm(
    size: usize,
    eps: f64,
    vb: VarBuilder,
    directory: &mut LayerDirectory,
) -> Result<Hooked<RmsNorm>> {
    let name = vb.prefix();
    directory.register(&name, "RmsNorm");
    Ok(Hooked::new(rms_norm(size, eps, vb)?, name))
}

/// Grouped-query self-attention
struct Attention {
    name: String,
    q_proj: Hooked<Linear>,
    k_proj: Hooked<Linear>,
    v_proj: Hooked<Linear>,
    o_proj: Hooked<Linear>,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn load(vb: VarBuilder, config: &DecoderConfig, directory: &mut LayerDirectory) -> Result<Self> {
        let name = vb.prefix();
        directory.register(&name, "Attention");

        let head_dim = config.head_dim();
        let q_dim = config.num_attention_heads * head_dim;
        let kv_dim = config.kv_heads() * head_dim;
        let qkv_bias = config.qkv_bias || config.attention_bias;

        let q_proj = hooked_linear(config.hidden_size, q_dim, qkv_bias, vb.pp("q_proj"), directory)?;
        let k_proj = hooked_linear(config.hidden_size, kv_dim, qkv_bias, vb.pp("k_proj"), directory)?;
        let v_proj = hooked_linear(config.hidden_size, kv_dim, qkv_bias, vb.pp("v_proj"), directory)?;
        let o_proj = hooked_linear(
            q_dim,
            config.hidden_size,
            config.attention_bias,
            vb.pp("o_proj"),
            directory,
        )?;

        Ok(Self {
            name,
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            num_heads: config.num_attention_heads,
            num_kv_heads: config.kv_heads(),
            head_dim,
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        rotary: &RotaryEmbedding,
        start_pos: usize,
        cache: Option<&mut LayerKv>,
        hooks: &HookRegistry,
    ) -> Result<Tensor> {
        let (b, seq_len, _) = x.dims3()?;

        let q = self.q_proj.forward(x, hooks)?;
        let k = self.k_proj.forward(x, hooks)?;
        let v = self.v_proj.forward(x, hooks)?;

        let q = q
            .reshape((b, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = k
            .reshape((b, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = v
            .reshape((b, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let (q, k) = rotary.apply(&q, &k, start_pos)?;

        let (k, v) = match cache {
            Some(layer_kv) => layer_kv.append(&k, &v)?,
            None => (k, v),
        };
        let total_len = k.dim(2)?;

        let n_rep = self.num_heads / self.num_kv_heads;
        let k = repeat_kv(k, n_rep)?.contiguous()?;
        let v = repeat_kv(v, n_rep)?.contiguous()?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let attn_weights = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * scale)?;
        let attn_weights = match causal_mask(seq_len, total_len, start_pos, x.device(), attn_weights.dtype())? {
            Some(mask) => attn_weights.broadcast_add(&mask)?,
            None => attn_weights,
        };
        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;

        let attn_output = attn_weights
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b, seq_len, ()))?;
        let out = self.o_proj.forward(&attn_output, hooks)?;
        hooks.dispatch(&self.name, out)
    }
}

fn repeat_kv(x: Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(x);
    }
    let (b, num_kv_heads, seq_len, head_dim) = x.dims4()?;
    let x = x.unsqueeze(2)?;
    let x = x.expand((b, num_kv_heads, n_rep, seq_len, head_dim))?;
    Ok(x.reshape((b, num_kv_heads * n_rep, seq_len, head_dim))?)
}

/// SwiGLU feed-forward block
struct Mlp {
    name: String,
    gate_proj: Hooked<Linear>,
    up_proj: Hooked<Linear>,
    down_proj: Hooked<Linear>,
}

impl Mlp {
    fn load(vb: VarBuilder, config: &DecoderConfig, directory: &mut LayerDirectory) -> Result<Self> {
        let name = vb.prefix();
        directory.register(&name, "Mlp");
        let (h, i, bias) = (config.hidden_size, config.intermediate_size, config.mlp_bias);
        Ok(Self {
            gate_proj: hooked_linear(h, i, bias, vb.pp("gate_proj"), directory)?,
            up_proj: hooked_linear(h, i, bias, vb.pp("up_proj"), directory)?,
            down_proj: hooked_linear(i, h, bias, vb.pp("down_proj"), directory)?,
            name,
        })
    }

    fn forward(&self, x: &Tensor, hooks: &HookRegistry) -> Result<Tensor> {
        // down(silu(gate(x)) * up(x))
        let gate = candle_nn::ops::silu(&self.gate_proj.forward(x, hooks)?)?;
        let up = self.up_proj.forward(x, hooks)?;
        let out = self.down_proj.forward(&(gate * up)?, hooks)?;
        hooks.dispatch(&self.name, out)
    }
}

struct DecoderLayer {
    name: String,
    self_attn: Attention,
    mlp: Mlp,
    input_layernorm: Hooked<RmsNorm>,
    post_attention_layernorm: Hooked<RmsNorm>,
}

impl DecoderLayer {
    fn load(vb: VarBuilder, config: &DecoderConfig, directory: &mut LayerDirectory) -> Result<Self> {
        let name = vb.prefix();
        directory.register(&name, "DecoderLayer");
        let self_attn = Attention::load(vb.pp("self_attn"), config, directory)?;
        let mlp = Mlp::load(vb.pp("mlp"), config, directory)?;
        let input_layernorm = hooked_rms_norm(
            config.hidden_size,
            config.rms_norm_eps,
            vb.pp("input_layernorm"),
            directory,
        )?;
        let post_attention_layernorm = hooked_rms_norm(
            config.hidden_size,
            config.rms_norm_eps,
            vb.pp("post_attention_layernorm"),
            directory,
        )?;
        Ok(Self {
            name,
            self_attn,
            mlp,
            input_layernorm,
            post_attention_layernorm,
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        rotary: &RotaryEmbedding,
        start_pos: usize,
        cache: Option<&mut LayerKv>,
        hooks: &HookRegistry,
    ) -> Result<Tensor> {
        let residual = x;
        let h = self.input_layernorm.forward(x, hooks)?;
        let h = self.self_attn.forward(&h, rotary, start_pos, cache, hooks)?;
        let x = (residual + h)?;

        let residual = &x;
        let h = self.post_attention_layernorm.forward(&x, hooks)?;
        let h = self.mlp.forward(&h, hooks)?;
        let out = (residual + h)?;
        hooks.dispatch(&self.name, out)
    }
}

/// Decoder-only transformer with a module directory and hook registry
pub struct DecoderModel {
    embed_tokens: Hooked<Embedding>,
    layers: Vec<DecoderLayer>,
    norm: Hooked<RmsNorm>,
    lm_head: Hooked<Linear>,
    rotary: RotaryEmbedding,
    config: DecoderConfig,
    directory: LayerDirectory,
    hooks: HookRegistry,
    device: Device,
}

impl DecoderModel {
    /// Build the module tree over `vars`
    ///
    /// Parameters already present in `vars` are used as-is (shapes must
    /// match); missing ones are created with candle's default init.
    pub fn build(config: &DecoderConfig, vars: VarMap, dtype: DType, device: &Device) -> Result<Self> {
        config.validate()?;
        let mut directory = LayerDirectory::new(vars.clone());
        let vb = VarBuilder::from_varmap(&vars, dtype, device);

        let vb_model = vb.pp(BACKBONE);
        directory.register(BACKBONE, "DecoderStack");

        let embed_vb = vb_model.pp("embed_tokens");
        directory.register(&embed_vb.prefix(), "Embedding");
        let embed = embedding(config.vocab_size, config.hidden_size, embed_vb.clone())?;
        let embed_tokens = Hooked::new(embed.clone(), embed_vb.prefix());

        let vb_layers = vb_model.pp("layers");
        directory.register(LAYER_LIST, "ModuleList");
        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            layers.push(DecoderLayer::load(vb_layers.pp(i), config, &mut directory)?);
        }

        let norm = hooked_rms_norm(config.hidden_size, config.rms_norm_eps, vb_model.pp("norm"), &mut directory)?;

        let has_own_head = vars
            .data()
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains_key("lm_head.weight");
        let lm_head = if config.tie_word_embeddings && !has_own_head {
            directory.register("lm_head", "Linear");
            Hooked::new(Linear::new(embed.embeddings().clone(), None), "lm_head")
        } else {
            hooked_linear(config.hidden_size, config.vocab_size, false, vb.pp("lm_head"), &mut directory)?
        };

        let rotary = RotaryEmbedding::new(
            config.head_dim(),
            config.max_position_embeddings,
            config.rope_theta,
            device,
            dtype,
        )?;

        info!(
            "Built decoder: {} layers, {} hidden, {} vocab, {} modules",
            config.num_hidden_layers,
            config.hidden_size,
            config.vocab_size,
            directory.len()
        );

        Ok(Self {
            embed_tokens,
            layers,
            norm,
            lm_head,
            rotary,
            config: config.clone(),
            directory,
            hooks: HookRegistry::new(),
            device: device.clone(),
        })
    }

    pub fn directory(&self) -> &LayerDirectory {
        &self.directory
    }

    pub fn directory_mut(&mut self) -> &mut LayerDirectory {
        &mut self.directory
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }

    /// Full-sequence forward, logits for every position: `[batch, seq, vocab]`
    pub fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        self.run(input_ids, None)
    }

    /// Forward the new tokens against `cache`, logits of the last position
    pub fn forward_step(&self, input_ids: &Tensor, cache: &mut KVCache) -> Result<Tensor> {
        let logits = self.run(input_ids, Some(cache))?;
        let seq_len = logits.dim(1)?;
        Ok(logits.i((.., seq_len - 1, ..))?)
    }

    fn run(&self, input_ids: &Tensor, mut cache: Option<&mut KVCache>) -> Result<Tensor> {
        let start_pos = cache.as_ref().map_or(0, |c| c.seq_len());
        let seq_len = input_ids.dim(1)?;
        if seq_len == 0 {
            bail!("forward pass over an empty sequence");
        }
        if start_pos + seq_len > self.config.max_position_embeddings {
            bail!(
                "sequence of {} tokens exceeds max_position_embeddings ({})",
                start_pos + seq_len,
                self.config.max_position_embeddings
            );
        }

        let mut hidden = self.embed_tokens.forward(input_ids, &self.hooks)?;
        for (i, layer) in self.layers.iter().enumerate() {
            let slot = cache.as_mut().and_then(|c| c.layer_mut(i));
            hidden = layer.forward(&hidden, &self.rotary, start_pos, slot, &self.hooks)?;
        }
        let hidden = self.norm.forward(&hidden, &self.hooks)?;
        let hidden = self.hooks.dispatch(BACKBONE, hidden)?;
        self.lm_head.forward(&hidden, &self.hooks)
    }

    /// Autoregressive generation with a KV cache
    ///
    /// Returns the prompt followed by at most `max_new_tokens` new tokens;
    /// stops early on a stop token (not included) or the position limit.
    pub fn generate(
        &self,
        prompt_ids: &[u32],
        max_new_tokens: usize,
        temperature: f32,
        stop_tokens: &[u32],
        rng: &mut StdRng,
    ) -> Result<Vec<u32>> {
        if prompt_ids.is_empty() {
            bail!("cannot generate from an empty prompt");
        }
        let mut cache = KVCache::new(self.n_layers());
        let mut tokens = prompt_ids.to_vec();
        let mut input = Tensor::new(prompt_ids, &self.device)?.unsqueeze(0)?;

        for _ in 0..max_new_tokens {
            if tokens.len() >= self.config.max_position_embeddings {
                break;
            }
            let logits = self.forward_step(&input, &mut cache)?;
            let next_token = sample_from_logits(&logits, temperature, rng)?;
            if stop_tokens.contains(&next_token) {
                break;
            }
            tokens.push(next_token);
            input = Tensor::new(&[next_token], &self.device)?.unsqueeze(0)?;
        }

        Ok(tokens)
    }
}

/// Sample a token from logits with temperature (greedy when `<= 0`)
pub fn sample_from_logits(logits: &Tensor, temperature: f32, rng: &mut StdRng) -> Result<u32> {
    let logits_vec: Vec<f32> = logits.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;

    let argmax = || {
        logits_vec
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(idx, _)| idx as u32)
            .ok_or_else(|| anyhow::anyhow!("Empty logits"))
    };

    if temperature <= 0.0 {
        return argmax();
    }

    let scaled: Vec<f32> = logits_vec.iter().map(|x| x / temperature).collect();
    let max_val = scaled.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exp_vals: Vec<f32> = scaled.iter().map(|x| (x - max_val).exp()).collect();
    let sum: f32 = exp_vals.iter().sum();
    if !sum.is_finite() || sum <= 0.0 {
        return argmax();
    }

    let r: f32 = rng.gen();
    let mut cumsum = 0.0;
    for (idx, &e) in exp_vals.iter().enumerate() {
        cumsum += e / sum;
        if r < cumsum {
            return Ok(idx as u32);
        }
    }
    Ok((exp_vals.len() - 1) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use std::sync::{Arc, Mutex};

    fn demo_model() -> DecoderModel {
        DecoderModel::build(&DecoderConfig::demo(), VarMap::new(), DType::F32, &Device::Cpu).unwrap()
    }

    fn ids(model: &DecoderModel, tokens: &[u32]) -> Tensor {
        Tensor::new(tokens, model.device()).unwrap().unsqueeze(0).unwrap()
    }

    #[test]
    fn test_module_names_preorder() {
        let model = demo_model();
        let names = model.directory().names();
        assert_eq!(&names[..4], &["model", "model.embed_tokens", "model.layers", "model.layers.0"]);
        assert_eq!(names.last().map(String::as_str), Some("lm_head"));

        let attn = names.iter().position(|n| n == "model.layers.0.self_attn").unwrap();
        assert_eq!(names[attn + 1], "model.layers.0.self_attn.q_proj");
        // backbone, embeddings, list; 12 per layer; final norm, lm_head
        assert_eq!(names.len(), 3 + 12 * 2 + 2);
    }

    #[test]
    fn test_demo_params_have_owners() {
        let mut model = demo_model();
        assert!(model.directory_mut().finalize().is_empty());
        let down = model
            .directory()
            .resolve("model.layers.1.mlp.down_proj")
            .unwrap();
        assert_eq!(down.param_names(), &["bias", "weight"]);
        assert!(!model.directory().resolve(LAYER_LIST).unwrap().has_direct_params());
    }

    #[test]
    fn test_forward_shape_and_hooks() {
        let model = demo_model();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let tap = model.hooks().attach("model.layers.1.mlp.up_proj", move |t| {
            sink.lock().unwrap().push(t.dims().to_vec());
            Ok(None)
        });
        let container = model.hooks().attach(LAYER_LIST, |_| Ok(None));

        let logits = model.forward(&ids(&model, &[72, 105, 33])).unwrap();
        assert_eq!(logits.dims(), &[1, 3, 256]);
        assert!(tap.fired());
        assert!(!container.fired());
        assert_eq!(seen.lock().unwrap().as_slice(), &[vec![1, 3, 64]]);
    }

    #[test]
    fn test_rewrite_hook_changes_logits() {
        let model = demo_model();
        let input = ids(&model, &[10, 20, 30]);
        let before = model.forward(&input).unwrap();
        let after = {
            let _h = model
                .hooks()
                .attach("model.layers.0.mlp", |t| Ok(Some((t.ones_like()? * 5.0)?)));
            model.forward(&input).unwrap()
        };
        let diff: f32 = (before - after).unwrap().abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert!(diff > 0.0);
        assert_eq!(model.hooks().attached(), 0);
    }

    #[test]
    fn test_cached_step_matches_full_forward() {
        let model = demo_model();
        let tokens = [5u32, 17, 99, 200];

        let full = model.forward(&ids(&model, &tokens)).unwrap();
        let full_last: Vec<f32> = full.i((0, 3)).unwrap().to_vec1().unwrap();

        let mut cache = KVCache::new(model.n_layers());
        model.forward_step(&ids(&model, &tokens[..3]), &mut cache).unwrap();
        assert_eq!(cache.seq_len(), 3);
        let step: Vec<f32> = model
            .forward_step(&ids(&model, &tokens[3..]), &mut cache)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();

        for (a, b) in full_last.iter().zip(&step) {
            assert!((a - b).abs() < 1e-4, "{a} vs {b}");
        }
    }

    #[test]
    fn test_generate_greedy_is_deterministic() {
        let model = demo_model();
        let mut rng = StdRng::seed_from_u64(1);
        let a = model.generate(&[1, 2, 3], 5, 0.0, &[], &mut rng).unwrap();
        let b = model.generate(&[1, 2, 3], 5, 0.0, &[], &mut rng).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 8);
        assert_eq!(&a[..3], &[1, 2, 3]);
    }

    #[test]
    fn test_generate_stop_token_and_empty_prompt() {
        let model = demo_model();
        let mut rng = StdRng::seed_from_u64(1);
        let first = model.generate(&[7, 8], 1, 0.0, &[], &mut rng).unwrap()[2];
        let stopped = model.generate(&[7, 8], 4, 0.0, &[first], &mut rng).unwrap();
        assert_eq!(stopped, vec![7, 8]);
        assert!(model.generate(&[], 4, 0.0, &[], &mut rng).is_err());
    }

    #[test]
    fn test_sample_greedy_and_seeded() {
        let logits = Tensor::new(&[0.1f32, 3.0, -1.0], &Device::Cpu).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(sample_from_logits(&logits, 0.0, &mut rng).unwrap(), 1);

        let draw = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            (0..8)
                .map(|_| sample_from_logits(&logits, 1.0, &mut rng).unwrap())
                .collect::<Vec<_>>()
        };
        assert_eq!(draw(42), draw(42));
    }

    #[test]
    fn test_config_from_json_defaults() {
        let config: DecoderConfig = serde_json::from_str(
            r#"{"hidden_size": 64, "intermediate_size": 128, "num_attention_heads": 8,
                "num_hidden_layers": 2, "vocab_size": 100}"#,
        )
        .unwrap();
        assert_eq!(config.kv_heads(), 8);
        assert_eq!(config.head_dim(), 8);
        assert!(!config.qkv_bias);
        assert_eq!(config.rope_theta, 10_000.0);
    }
}
