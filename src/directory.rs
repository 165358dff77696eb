//! Layer directory: the model's named module tree
//!
//! Modules are registered in construction order (parents before children),
//! which mirrors a pre-order walk of the tree. Parameters live in a
//! [`VarMap`] keyed by their full dotted name (`model.layers.0.mlp.up_proj.weight`);
//! a parameter is owned *directly* by the module whose name is everything
//! before the last dot.

use std::collections::{HashMap, HashSet};

use candle_core::Var;
use candle_nn::VarMap;
use serde::Serialize;
use tracing::warn;

use crate::error::{InspectError, Result};

/// Coarse role of a module inside a decoder-only transformer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    Embedding,
    Attention,
    AttentionProjection,
    FeedForward,
    FeedForwardProjection,
    Normalization,
    Block,
    Backbone,
    OutputHead,
    Container,
    Other,
}

impl LayerKind {
    /// Classify a module from its declared type and name
    pub fn classify(name: &str, type_name: &str) -> Self {
        let leaf = name.rsplit('.').next().unwrap_or(name);
        match type_name {
            "Embedding" => LayerKind::Embedding,
            "Attention" => LayerKind::Attention,
            "Mlp" => LayerKind::FeedForward,
            "RmsNorm" | "LayerNorm" => LayerKind::Normalization,
            "DecoderLayer" => LayerKind::Block,
            "DecoderStack" => LayerKind::Backbone,
            "ModuleList" => LayerKind::Container,
            "Linear" if leaf == "lm_head" => LayerKind::OutputHead,
            "Linear" if name.contains(".self_attn.") => LayerKind::AttentionProjection,
            "Linear" if name.contains(".mlp.") => LayerKind::FeedForwardProjection,
            _ => LayerKind::Other,
        }
    }
}

/// One named module
#[derive(Debug, Clone)]
pub struct ModuleNode {
    name: String,
    type_name: String,
    /// Local names of directly-owned parameters, sorted
    params: Vec<String>,
}

impl ModuleNode {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn kind(&self) -> LayerKind {
        LayerKind::classify(&self.name, &self.type_name)
    }

    /// Local names of parameters this module owns directly
    pub fn param_names(&self) -> &[String] {
        &self.params
    }

    pub fn has_direct_params(&self) -> bool {
        !self.params.is_empty()
    }
}

/// Directory entry as returned to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayerEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub kind: LayerKind,
}

/// Named module tree plus the parameters it owns
pub struct LayerDirectory {
    nodes: Vec<ModuleNode>,
    index: HashMap<String, usize>,
    vars: VarMap,
}

impl LayerDirectory {
    pub fn new(vars: VarMap) -> Self {
        Self {
            nodes: Vec::new(),
            index: HashMap::new(),
            vars,
        }
    }

    /// Register a module; the root (empty name) is never registered
    pub fn register(&mut self, name: &str, type_name: &str) {
        if name.is_empty() || self.index.contains_key(name) {
            return;
        }
        self.index.insert(name.to_string(), self.nodes.len());
        self.nodes.push(ModuleNode {
            name: name.to_string(),
            type_name: type_name.to_string(),
            params: Vec::new(),
        });
    }

    /// Assign parameters to their owning modules
    ///
    /// Variables whose owner is not a registered module are dropped from
    /// the store, and their names returned.
    pub fn finalize(&mut self) -> Vec<String> {
        let mut data = self.vars.data().lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        let mut dropped = Vec::new();
        data.retain(|full_name, _| {
            let keep = owner_of(full_name).is_some_and(|(owner, _)| self.index.contains_key(owner));
            if !keep {
                dropped.push(full_name.clone());
            }
            keep
        });

        for node in &mut self.nodes {
            node.params.clear();
        }
        for full_name in data.keys() {
            if let Some((owner, local)) = owner_of(full_name) {
                if let Some(&idx) = self.index.get(owner) {
                    self.nodes[idx].params.push(local.to_string());
                }
            }
        }
        for node in &mut self.nodes {
            node.params.sort();
        }

        dropped.sort();
        for name in &dropped {
            warn!("Dropping parameter '{}': no registered module owns it", name);
        }
        dropped
    }

    /// Module names in registration order (root excluded)
    pub fn names(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.name.clone()).collect()
    }

    pub fn nodes(&self) -> &[ModuleNode] {
        &self.nodes
    }

    pub fn entries(&self) -> Vec<LayerEntry> {
        self.nodes
            .iter()
            .map(|n| LayerEntry {
                name: n.name.clone(),
                type_name: n.type_name.clone(),
                kind: n.kind(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Look up a module by name
    pub fn resolve(&self, name: &str) -> Result<&ModuleNode> {
        self.index
            .get(name)
            .map(|&idx| &self.nodes[idx])
            .ok_or_else(|| InspectError::NotFound(format!("layer '{name}'")))
    }

    /// Parameter by full dotted name
    pub fn param(&self, full_name: &str) -> Option<Var> {
        self.vars
            .data()
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(full_name)
            .cloned()
    }

    /// Parameter owned directly by `layer` under its local name
    pub fn direct_param(&self, layer: &str, local: &str) -> Result<Option<Var>> {
        let node = self.resolve(layer)?;
        if !node.params.iter().any(|p| p == local) {
            return Ok(None);
        }
        Ok(self.param(&format!("{layer}.{local}")))
    }

    /// All parameters at or below `layer`, the module's own first, then
    /// descendants in registration order
    pub fn params_under(&self, layer: &str) -> Result<Vec<(String, Var)>> {
        self.resolve(layer)?;
        let prefix = format!("{layer}.");
        let data = self.vars.data().lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        let mut out = Vec::new();
        for node in self
            .nodes
            .iter()
            .filter(|n| n.name == layer || n.name.starts_with(&prefix))
        {
            for local in &node.params {
                let full = format!("{}.{local}", node.name);
                if let Some(var) = data.get(&full) {
                    out.push((full, var.clone()));
                }
            }
        }
        Ok(out)
    }

    /// Total number of parameter elements
    pub fn param_count(&self) -> usize {
        self.vars
            .all_vars()
            .iter()
            .map(|v| v.as_tensor().elem_count())
            .sum()
    }

    pub fn vars(&self) -> &VarMap {
        &self.vars
    }

    /// Full parameter names currently in the store, sorted
    pub fn param_names(&self) -> Vec<String> {
        let data = self.vars.data().lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut names: Vec<String> = data.keys().cloned().collect();
        names.sort();
        names
    }

    /// Names that were expected (present now) but not in `loaded`
    pub(crate) fn missing_from(&self, loaded: &HashSet<String>) -> Vec<String> {
        self.param_names()
            .into_iter()
            .filter(|n| !loaded.contains(n))
            .collect()
    }
}

/// Split `a.b.c.weight` into (`a.b.c`, `weight`)
fn owner_of(full_name: &str) -> Option<(&str, &str)> {
    full_name.rsplit_once('.')
}
