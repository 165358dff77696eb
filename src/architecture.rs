//! Architecture summary: nested view of the module tree with parameter
//! shapes and counts
//!
//! Built fresh from the [`LayerDirectory`] on every call.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::directory::LayerDirectory;

/// Shape and element count of one parameter tensor
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParamSummary {
    pub shape: Vec<usize>,
    pub num_params: usize,
}

/// One module in the nested summary
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LayerSummary {
    #[serde(rename = "type")]
    pub layer_type: String,
    /// Parameters owned directly by this module (empty for containers)
    pub parameters: BTreeMap<String, ParamSummary>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub children: BTreeMap<String, LayerSummary>,
}

impl LayerSummary {
    /// Sum of `num_params` over this node and all descendants
    pub fn param_total(&self) -> usize {
        let own: usize = self.parameters.values().map(|p| p.num_params).sum();
        own + self.children.values().map(LayerSummary::param_total).sum::<usize>()
    }
}

/// Root of the summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchitectureSummary {
    pub total_params: usize,
    pub unique_layer_types: Vec<String>,
    pub layers: BTreeMap<String, LayerSummary>,
}

impl ArchitectureSummary {
    /// Walk every registered module and rebuild the dotted hierarchy
    pub fn build(directory: &LayerDirectory) -> Self {
        let mut total_params = 0;
        let mut types = BTreeSet::new();
        let mut layers: BTreeMap<String, LayerSummary> = BTreeMap::new();

        for node in directory.nodes() {
            types.insert(node.type_name().to_string());

            let mut parameters = BTreeMap::new();
            for local in node.param_names() {
                let full = format!("{}.{local}", node.name());
                if let Some(var) = directory.param(&full) {
                    let shape = var.as_tensor().dims().to_vec();
                    let num_params: usize = shape.iter().product();
                    total_params += num_params;
                    parameters.insert(local.clone(), ParamSummary { shape, num_params });
                }
            }

            let slot = slot_for(&mut layers, node.name());
            slot.layer_type = node.type_name().to_string();
            slot.parameters = parameters;
        }

        Self {
            total_params,
            unique_layer_types: types.into_iter().collect(),
            layers,
        }
    }

    /// Sum of `num_params` across the nested tree
    pub fn leaf_param_total(&self) -> usize {
        self.layers.values().map(LayerSummary::param_total).sum()
    }

    /// Find a nested entry by dotted name
    pub fn get(&self, name: &str) -> Option<&LayerSummary> {
        let mut parts = name.split('.');
        let mut node = self.layers.get(parts.next()?)?;
        for part in parts {
            node = node.children.get(part)?;
        }
        Some(node)
    }
}

/// Walk (creating as needed) to the entry for a dotted name
fn slot_for<'a>(
    layers: &'a mut BTreeMap<String, LayerSummary>,
    name: &str,
) -> &'a mut LayerSummary {
    let mut parts = name.split('.');
    let first = parts.next().unwrap_or(name);
    let mut node = layers.entry(first.to_string()).or_default();
    for part in parts {
        node = node.children.entry(part.to_string()).or_default();
    }
    node
}
