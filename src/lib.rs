// Pedantic clippy configuration for ML/math codebase
// These are acceptable in numerical/ML code:
#![allow(clippy::cast_precision_loss)] // usize→f64/f32 intentional in ML
#![allow(clippy::cast_possible_truncation)] // usize→u32 in tensor indexing
#![allow(clippy::cast_possible_wrap)] // usize→i64 in tensor ops
#![allow(clippy::many_single_char_names)] // x, y, i, j standard in math
#![allow(clippy::similar_names)] // related variables like `head`/`heads`
#![allow(clippy::module_name_repetitions)] // ModelHandle in model.rs is fine
// Documentation pedantic:
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
// Method style pedantic:
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::return_self_not_must_use)] // #[must_use] on Self returns
#![allow(clippy::needless_pass_by_value)] // value params for API flexibility
#![allow(clippy::cast_sign_loss)] // f64→usize when value is known positive

//! llm-inspect: look inside a running transformer language model
//!
//! Load a decoder, generate text, then inspect and perturb its internals:
//! list the named modules, summarise parameters, capture the output of any
//! module over a word-aligned span of the generated text, overwrite a
//! single unit and watch the next-token distribution move, or edit a bias
//! in place.
//!
//! ## Architecture
//!
//! - `inspector`: Per-instance state machine exposing every operation
//! - `registry`: `(user, model)` keyed instances, each behind its own lock
//! - `session`: Prompt, timestep, cached output and generation settings
//! - `timestep`: Word-count timestep to token span, with over-generation
//! - `model`: Architecture selection, backend trait, weight loading
//! - `forward_llama`: LLaMA-family decoder (LLaMA, Mistral, Qwen2) built on named, hookable modules
//! - `hooks`: Forward-output hooks with scoped (RAII) detachment
//! - `directory`: Named module tree and parameter ownership
//! - `architecture`: Per-module parameter name/shape summary
//! - `stats`: Input-weight statistics and bias extremes, bias editing
//! - `kv_cache`: KV-cache for autoregressive generation
//! - `masks`: Causal attention masks
//! - `tokenizer`: Text codec trait over HF tokenizers and a byte codec
//! - `error`: Typed error kinds surfaced by every operation

pub mod architecture;
pub mod directory;
pub mod error;
pub mod forward_llama;
pub mod hooks;
pub mod inspector;
pub mod kv_cache;
pub mod masks;
pub mod model;
pub mod registry;
pub mod session;
pub mod stats;
pub mod timestep;
pub mod tokenizer;

pub use architecture::{ArchitectureSummary, LayerSummary, ParamSummary};
pub use directory::{LayerDirectory, LayerEntry, LayerKind, ModuleNode};
pub use error::{ErrorKind, InspectError, Result};
pub use forward_llama::{DecoderConfig, DecoderModel};
pub use hooks::{HookHandle, HookId, HookRegistry, Hooked};
pub use inspector::{Activation, Inspector, OverrideReport, TokenPrediction, OVERRIDE_TOP_K};
pub use kv_cache::KVCache;
pub use masks::causal_mask;
pub use model::{
    DecoderBackend, InspectBackend, LoadOptions, ModelArchitecture, ModelHandle, DEMO_MODEL,
};
pub use registry::{lock_inspector, ModelRegistry, SharedInspector, UserId};
pub use session::{GenerationSettings, SessionState, DEFAULT_TIMESTEP};
pub use stats::{BiasExtremes, InputStats};
pub use timestep::{TokenSpan, TOKENS_PER_WORD};
pub use tokenizer::{ByteTokenizer, TextCodec};
