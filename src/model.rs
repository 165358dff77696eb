//! Model handles: architecture selection, backend trait and weight loading
//!
//! A model name resolves to a constructor:
//! - `"demo"`: tiny seeded decoder over a byte vocabulary, no download
//! - an existing directory: `config.json` + `tokenizer.json` + safetensors
//! - anything else: a HuggingFace Hub model id

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::VarMap;
use hf_hub::{api::sync::Api, Repo, RepoType};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use safetensors::SafeTensors;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::directory::LayerDirectory;
use crate::error::InspectError;
use crate::forward_llama::{DecoderConfig, DecoderModel};
use crate::hooks::HookRegistry;
use crate::session::GenerationSettings;
use crate::tokenizer::{load_tokenizer, ByteTokenizer, TextCodec};

/// Name that selects the built-in demo model
pub const DEMO_MODEL: &str = "demo";

/// Supported model architectures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelArchitecture {
    /// LLaMA / Code-LLaMA / TinyLlama (Meta)
    Llama,
    /// Mistral (same decoder layout as LLaMA)
    Mistral,
    /// Qwen2 / Qwen2.5 (Alibaba), biases on q/k/v
    Qwen2,
    /// Built-in seeded test model
    Demo,
}

impl ModelArchitecture {
    /// Map a `config.json` `model_type`
    pub fn from_model_type(model_type: &str) -> Option<Self> {
        match model_type {
            "llama" => Some(ModelArchitecture::Llama),
            "mistral" => Some(ModelArchitecture::Mistral),
            "qwen2" => Some(ModelArchitecture::Qwen2),
            _ => None,
        }
    }

    /// Guess from a model id or path
    pub fn from_model_id(model_id: &str) -> Option<Self> {
        let model_lower = model_id.to_lowercase();
        if model_lower == DEMO_MODEL {
            Some(ModelArchitecture::Demo)
        } else if model_lower.contains("qwen") {
            Some(ModelArchitecture::Qwen2)
        } else if model_lower.contains("mistral") {
            Some(ModelArchitecture::Mistral)
        } else if model_lower.contains("llama") {
            Some(ModelArchitecture::Llama)
        } else {
            None
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ModelArchitecture::Llama => "llama",
            ModelArchitecture::Mistral => "mistral",
            ModelArchitecture::Qwen2 => "qwen2",
            ModelArchitecture::Demo => DEMO_MODEL,
        }
    }
}

/// How a model is loaded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadOptions {
    /// Stay on CPU even when CUDA is available
    pub force_cpu: bool,
    /// Seeds the sampler and the demo model's weights
    pub seed: u64,
    /// Hub revision (branch, tag or commit); `main` when unset
    pub revision: Option<String>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            force_cpu: false,
            seed: 42,
            revision: None,
        }
    }
}

/// What the inspector needs from a loaded network
///
/// One implementation per model family; selected by
/// [`ModelArchitecture`] in [`ModelHandle::load`].
pub trait InspectBackend: Send + Sync {
    fn architecture(&self) -> ModelArchitecture;

    /// Named module tree and parameters
    fn modules(&self) -> &LayerDirectory;

    /// Hook attachment point for every module in [`modules`](Self::modules)
    fn hooks(&self) -> &HookRegistry;

    fn device(&self) -> &Device;

    /// Full-sequence forward, logits `[batch, seq, vocab]`
    fn forward(&self, input_ids: &Tensor) -> Result<Tensor>;

    /// Prompt ids followed by up to `max_new_tokens` sampled ids
    fn generate(
        &self,
        prompt_ids: &[u32],
        max_new_tokens: usize,
        temperature: f32,
        stop_tokens: &[u32],
        rng: &mut StdRng,
    ) -> Result<Vec<u32>>;
}

/// LLaMA-family backend (also serves Mistral, Qwen2 and the demo)
pub struct DecoderBackend {
    architecture: ModelArchitecture,
    model: DecoderModel,
}

impl DecoderBackend {
    pub fn new(architecture: ModelArchitecture, model: DecoderModel) -> Self {
        Self { architecture, model }
    }

    pub fn model(&self) -> &DecoderModel {
        &self.model
    }
}

impl InspectBackend for DecoderBackend {
    fn architecture(&self) -> ModelArchitecture {
        self.architecture
    }

    fn modules(&self) -> &LayerDirectory {
        self.model.directory()
    }

    fn hooks(&self) -> &HookRegistry {
        self.model.hooks()
    }

    fn device(&self) -> &Device {
        self.model.device()
    }

    fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        self.model.forward(input_ids)
    }

    fn generate(
        &self,
        prompt_ids: &[u32],
        max_new_tokens: usize,
        temperature: f32,
        stop_tokens: &[u32],
        rng: &mut StdRng,
    ) -> Result<Vec<u32>> {
        self.model
            .generate(prompt_ids, max_new_tokens, temperature, stop_tokens, rng)
    }
}

/// A loaded network plus its text codec
pub struct ModelHandle {
    name: String,
    backend: Box<dyn InspectBackend>,
    codec: Box<dyn TextCodec>,
    stop_tokens: Vec<u32>,
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("name", &self.name)
            .field("architecture", &self.backend.architecture())
            .field("modules", &self.backend.modules().len())
            .finish()
    }
}

impl ModelHandle {
    pub fn new(
        name: impl Into<String>,
        backend: Box<dyn InspectBackend>,
        codec: Box<dyn TextCodec>,
    ) -> Self {
        let stop_tokens = codec.stop_tokens();
        Self {
            name: name.into(),
            backend,
            codec,
            stop_tokens,
        }
    }

    /// Resolve `name` to a constructor and load it
    pub fn load(name: &str, options: &LoadOptions) -> crate::error::Result<Self> {
        let (device, dtype) = select_device(options.force_cpu);
        if name == DEMO_MODEL {
            return Ok(load_demo(options.seed, &device)?);
        }
        load_pretrained(name, options, &device, dtype)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backend(&self) -> &dyn InspectBackend {
        self.backend.as_ref()
    }

    pub fn codec(&self) -> &dyn TextCodec {
        self.codec.as_ref()
    }

    pub fn stop_tokens(&self) -> &[u32] {
        &self.stop_tokens
    }

    /// Prompt ids as a `[1, seq]` tensor on the model's device
    pub fn input_tensor(&self, ids: &[u32]) -> Result<Tensor> {
        Ok(Tensor::new(ids, self.backend.device())?.unsqueeze(0)?)
    }

    /// Decode `prompt_ids` forward under `settings`
    pub fn generate_ids(
        &self,
        prompt_ids: &[u32],
        max_new_tokens: usize,
        settings: GenerationSettings,
        rng: &mut StdRng,
    ) -> Result<Vec<u32>> {
        self.backend.generate(
            prompt_ids,
            max_new_tokens,
            settings.temperature,
            &self.stop_tokens,
            rng,
        )
    }
}

/// CUDA with BF16 when available (and compiled in), otherwise CPU with F32
fn select_device(force_cpu: bool) -> (Device, DType) {
    if force_cpu {
        info!("Forcing CPU mode");
        return (Device::Cpu, DType::F32);
    }
    match Device::cuda_if_available(0) {
        Ok(dev) if dev.is_cuda() => {
            info!("Using CUDA device");
            (dev, DType::BF16)
        }
        _ => {
            info!("CUDA not available, using CPU");
            (Device::Cpu, DType::F32)
        }
    }
}

fn load_demo(seed: u64, device: &Device) -> Result<ModelHandle> {
    info!("Building demo model (seed {})", seed);
    let config = DecoderConfig::demo();
    let mut model = DecoderModel::build(&config, VarMap::new(), DType::F32, device)?;
    model.directory_mut().finalize();
    seed_parameters(model.directory().vars(), seed)?;

    let backend = DecoderBackend::new(ModelArchitecture::Demo, model);
    Ok(ModelHandle::new(DEMO_MODEL, Box::new(backend), Box::new(ByteTokenizer)))
}

/// Deterministic weights: norms at one, biases in ±0.1, other weights in
/// ±1/sqrt(fan_in), drawn in sorted name order
pub fn seed_parameters(vars: &VarMap, seed: u64) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(seed);
    let data = vars
        .data()
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    let mut names: Vec<&String> = data.keys().collect();
    names.sort();

    for name in names {
        let var = &data[name];
        let tensor = var.as_tensor();
        let count = tensor.elem_count();
        let values: Vec<f32> = if name.ends_with("norm.weight") {
            vec![1.0; count]
        } else {
            let bound = if name.ends_with(".bias") {
                0.1
            } else {
                let fan_in = tensor.dims().last().copied().unwrap_or(1).max(1);
                1.0 / (fan_in as f32).sqrt()
            };
            (0..count).map(|_| rng.gen_range(-bound..bound)).collect()
        };
        let seeded = Tensor::from_vec(values, tensor.shape(), tensor.device())?.to_dtype(tensor.dtype())?;
        var.set(&seeded)?;
    }
    Ok(())
}

/// Leading fields of `config.json` used to pick an architecture
#[derive(Debug, Deserialize)]
struct ConfigHeader {
    #[serde(default)]
    model_type: Option<String>,
}

/// Safetensors index for sharded models
#[derive(Debug, Deserialize)]
struct SafetensorsIndex {
    weight_map: std::collections::HashMap<String, String>,
}

struct ModelFiles {
    config: PathBuf,
    tokenizer: PathBuf,
    weights: Vec<PathBuf>,
}

/// Shard file names listed in an index, deduplicated and sorted
fn shard_names(index_path: &Path) -> Result<Vec<String>> {
    let index_str = std::fs::read_to_string(index_path).context("Failed to read index")?;
    let index: SafetensorsIndex = serde_json::from_str(&index_str)?;
    let mut names: Vec<String> = index.weight_map.into_values().collect();
    names.sort();
    names.dedup();
    Ok(names)
}

fn local_files(dir: &Path) -> crate::error::Result<ModelFiles> {
    let config = dir.join("config.json");
    if !config.is_file() {
        return Err(InspectError::NotFound(format!(
            "model directory '{}' has no config.json",
            dir.display()
        )));
    }
    let index = dir.join("model.safetensors.index.json");
    let weights = if index.is_file() {
        shard_names(&index)?
            .into_iter()
            .map(|shard| dir.join(shard))
            .collect()
    } else {
        vec![dir.join("model.safetensors")]
    };
    Ok(ModelFiles {
        config,
        tokenizer: dir.join("tokenizer.json"),
        weights,
    })
}

fn hub_files(model_id: &str, revision: Option<&str>) -> crate::error::Result<ModelFiles> {
    let api = Api::new().context("Failed to initialise HuggingFace Hub client")?;
    let repo = api.repo(Repo::with_revision(
        model_id.to_string(),
        RepoType::Model,
        revision.unwrap_or("main").to_string(),
    ));

    let config = repo
        .get("config.json")
        .map_err(|e| InspectError::NotFound(format!("model '{model_id}': {e}")))?;
    let tokenizer = repo
        .get("tokenizer.json")
        .context("Failed to download tokenizer.json")?;

    let weights = if let Ok(index_path) = repo.get("model.safetensors.index.json") {
        info!("Model is sharded, loading index...");
        let shards = shard_names(&index_path)?;
        info!("Downloading {} shard files...", shards.len());
        let mut paths = Vec::with_capacity(shards.len());
        for shard in &shards {
            let path = repo
                .get(shard)
                .with_context(|| format!("Failed to download {shard}"))?;
            paths.push(path);
        }
        paths
    } else {
        vec![repo
            .get("model.safetensors")
            .context("Failed to download model.safetensors")?]
    };

    Ok(ModelFiles {
        config,
        tokenizer,
        weights,
    })
}

fn load_pretrained(
    name: &str,
    options: &LoadOptions,
    device: &Device,
    dtype: DType,
) -> crate::error::Result<ModelHandle> {
    info!("Loading model: {}", name);
    let dir = Path::new(name);
    let files = if dir.is_dir() {
        local_files(dir)?
    } else {
        hub_files(name, options.revision.as_deref())?
    };

    let config_str = std::fs::read_to_string(&files.config).context("Failed to read config")?;
    let header: ConfigHeader = serde_json::from_str(&config_str).context("Failed to parse config.json")?;
    let architecture = header
        .model_type
        .as_deref()
        .and_then(ModelArchitecture::from_model_type)
        .or_else(|| ModelArchitecture::from_model_id(name))
        .filter(|arch| *arch != ModelArchitecture::Demo)
        .ok_or_else(|| {
            InspectError::NotFound(format!(
                "no constructor for model '{name}' (model_type {:?})",
                header.model_type
            ))
        })?;

    let mut config: DecoderConfig =
        serde_json::from_str(&config_str).context("Failed to parse decoder config")?;
    config.qkv_bias = architecture == ModelArchitecture::Qwen2;

    info!("Architecture: {}", architecture.name());
    info!("Device: {:?}, dtype: {:?}", device, dtype);
    info!(
        "Model config: {} layers, {} hidden, {} vocab",
        config.num_hidden_layers, config.hidden_size, config.vocab_size
    );

    let tokenizer = load_tokenizer(&files.tokenizer)?;

    info!("Loading weights from {} file(s)...", files.weights.len());
    let vars = VarMap::new();
    let loaded = load_weights(&files.weights, dtype, device, &vars)?;

    let mut model = DecoderModel::build(&config, vars, dtype, device)?;
    let missing = model.directory().missing_from(&loaded);
    if !missing.is_empty() {
        return Err(anyhow::anyhow!(
            "checkpoint is missing {} expected tensors (first: {})",
            missing.len(),
            missing[0]
        )
        .into());
    }
    model.directory_mut().finalize();

    info!(
        "Model loaded successfully: {} modules, {} parameters",
        model.directory().len(),
        model.directory().param_count()
    );

    let backend = DecoderBackend::new(architecture, model);
    Ok(ModelHandle::new(name, Box::new(backend), Box::new(tokenizer)))
}

/// Read every tensor in `paths` into `vars`, returning the names loaded
fn load_weights(
    paths: &[PathBuf],
    dtype: DType,
    device: &Device,
    vars: &VarMap,
) -> Result<HashSet<String>> {
    let mut loaded = HashSet::new();
    let mut data = vars
        .data()
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    for path in paths {
        let bytes =
            std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        let st = SafeTensors::deserialize(&bytes)
            .with_context(|| format!("Failed to deserialize {}", path.display()))?;
        for (name, view) in st.tensors() {
            let tensor = tensor_from_view(&view, device)?.to_dtype(dtype)?;
            data.insert(name.clone(), Var::from_tensor(&tensor)?);
            loaded.insert(name);
        }
    }
    Ok(loaded)
}

fn tensor_from_view(view: &safetensors::tensor::TensorView<'_>, device: &Device) -> Result<Tensor> {
    let shape: Vec<usize> = view.shape().to_vec();
    let dtype = match view.dtype() {
        safetensors::Dtype::BF16 => DType::BF16,
        safetensors::Dtype::F16 => DType::F16,
        safetensors::Dtype::F32 => DType::F32,
        other => bail!("Unsupported tensor dtype: {other:?}"),
    };
    Ok(Tensor::from_raw_buffer(view.data(), dtype, &shape, device)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn demo() -> ModelHandle {
        let options = LoadOptions {
            force_cpu: true,
            ..LoadOptions::default()
        };
        ModelHandle::load(DEMO_MODEL, &options).unwrap()
    }

    fn bias(handle: &ModelHandle, name: &str) -> Vec<f32> {
        handle
            .backend()
            .modules()
            .param(name)
            .unwrap()
            .as_tensor()
            .to_vec1()
            .unwrap()
    }

    #[test]
    fn test_architecture_detection() {
        assert_eq!(ModelArchitecture::from_model_type("qwen2"), Some(ModelArchitecture::Qwen2));
        assert_eq!(ModelArchitecture::from_model_type("gpt2"), None);
        assert_eq!(
            ModelArchitecture::from_model_id("TinyLlama/TinyLlama-1.1B-Chat-v1.0"),
            Some(ModelArchitecture::Llama)
        );
        assert_eq!(ModelArchitecture::from_model_id("demo"), Some(ModelArchitecture::Demo));
        assert_eq!(ModelArchitecture::from_model_id("openai-community/gpt2"), None);
    }

    #[test]
    fn test_demo_is_seeded() {
        let a = demo();
        let b = demo();
        let name = "model.layers.0.mlp.down_proj.bias";
        assert_eq!(bias(&a, name), bias(&b, name));
        assert!(bias(&a, name).iter().all(|v| v.abs() <= 0.1));

        let norm = bias(&a, "model.norm.weight");
        assert!(norm.iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_demo_handle() {
        let handle = demo();
        assert_eq!(handle.backend().architecture(), ModelArchitecture::Demo);
        assert!(handle.stop_tokens().is_empty());
        assert_eq!(handle.codec().encode("hi").unwrap(), vec![104, 105]);
    }

    #[test]
    fn test_missing_local_dir_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = ModelHandle::load(dir.path().to_str().unwrap(), &LoadOptions::default()).unwrap_err();
        assert!(matches!(err, InspectError::NotFound(_)));
    }

    #[test]
    fn test_unsupported_model_type() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), r#"{"model_type": "gpt2"}"#).unwrap();
        let options = LoadOptions {
            force_cpu: true,
            ..LoadOptions::default()
        };
        let err = ModelHandle::load(dir.path().to_str().unwrap(), &options).unwrap_err();
        assert!(matches!(err, InspectError::NotFound(_)));
    }
}
