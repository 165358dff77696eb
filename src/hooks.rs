//! Forward hooks on named modules
//!
//! A hook is attached to one module name and fires every time that module
//! finishes its forward. It can observe the output (return `Ok(None)`) or
//! rewrite it (return `Ok(Some(replacement))`), in which case the
//! replacement is what downstream modules see.
//!
//! [`HookRegistry::attach`] returns a [`HookHandle`]; dropping the handle
//! detaches the hook. Holding the handle in a local binding for the
//! duration of a forward pass therefore guarantees detachment on every exit
//! path, including `?` early returns and unwinding.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use candle_core::{Module, Tensor};
use tracing::debug;

/// Hook callback: receives the module's primary output tensor
///
/// Hooks run with the registry locked and must not attach or detach.
pub type HookFn = Box<dyn Fn(&Tensor) -> Result<Option<Tensor>> + Send + Sync>;

/// Identifier returned by [`HookRegistry::attach`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

struct Entry {
    id: HookId,
    module: String,
    hook: HookFn,
}

#[derive(Default)]
struct HookTable {
    next_id: u64,
    entries: Vec<Entry>,
    attached_total: u64,
    detached_total: u64,
    fired: HashMap<HookId, usize>,
}

/// Hooks attached to a model's modules, keyed by module name
#[derive(Default)]
pub struct HookRegistry {
    table: Mutex<HookTable>,
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.lock();
        f.debug_struct("HookRegistry")
            .field("attached", &table.entries.len())
            .field("attached_total", &table.attached_total)
            .field("detached_total", &table.detached_total)
            .finish()
    }
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HookTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach a hook to `module`; it stays attached until the handle drops
    pub fn attach<F>(&self, module: &str, hook: F) -> HookHandle<'_>
    where
        F: Fn(&Tensor) -> Result<Option<Tensor>> + Send + Sync + 'static,
    {
        let mut table = self.lock();
        let id = HookId(table.next_id);
        table.next_id += 1;
        table.attached_total += 1;
        table.entries.push(Entry {
            id,
            module: module.to_string(),
            hook: Box::new(hook),
        });
        debug!("Attached hook {:?} to '{}'", id, module);
        HookHandle { registry: self, id }
    }

    fn detach(&self, id: HookId) {
        let mut table = self.lock();
        let before = table.entries.len();
        table.entries.retain(|e| e.id != id);
        if table.entries.len() < before {
            table.detached_total += 1;
            table.fired.remove(&id);
            debug!("Detached hook {:?}", id);
        }
    }

    /// Run every hook attached to `module` over its output, in attach order
    ///
    /// Returns the (possibly rewritten) tensor that continues downstream.
    pub fn dispatch(&self, module: &str, output: Tensor) -> Result<Tensor> {
        let mut table = self.lock();
        if table.entries.is_empty() {
            return Ok(output);
        }

        let mut current = output;
        let mut fired = Vec::new();
        for entry in table.entries.iter().filter(|e| e.module == module) {
            if let Some(replacement) = (entry.hook)(&current)? {
                current = replacement;
            }
            fired.push(entry.id);
        }
        for id in fired {
            *table.fired.entry(id).or_insert(0) += 1;
        }
        Ok(current)
    }

    /// Number of hooks currently attached to `module`
    pub fn attached_to(&self, module: &str) -> usize {
        self.lock()
            .entries
            .iter()
            .filter(|e| e.module == module)
            .count()
    }

    /// Number of hooks currently attached anywhere
    pub fn attached(&self) -> usize {
        self.lock().entries.len()
    }

    /// Lifetime (attach, detach) counters
    pub fn counters(&self) -> (u64, u64) {
        let table = self.lock();
        (table.attached_total, table.detached_total)
    }

    /// How many times the hook has fired since it was attached
    pub fn fire_count(&self, id: HookId) -> usize {
        self.lock().fired.get(&id).copied().unwrap_or(0)
    }
}

/// Scoped attachment: the hook is detached when this value drops
#[must_use = "the hook is detached as soon as the handle is dropped"]
pub struct HookHandle<'a> {
    registry: &'a HookRegistry,
    id: HookId,
}

impl HookHandle<'_> {
    /// Whether the hook fired at least once while attached
    pub fn fired(&self) -> bool {
        self.registry.fire_count(self.id) > 0
    }
}

impl Drop for HookHandle<'_> {
    fn drop(&mut self) {
        self.registry.detach(self.id);
    }
}

/// A leaf module paired with its directory name
///
/// `forward` runs the inner module and passes the output through the
/// registry, so leaves like `Linear` or `RmsNorm` become hookable without
/// wrapping each call site by hand.
#[derive(Debug, Clone)]
pub struct Hooked<M> {
    inner: M,
    name: String,
}

impl<M: Module> Hooked<M> {
    pub fn new(inner: M, name: impl Into<String>) -> Self {
        Self {
            inner,
            name: name.into(),
        }
    }

    pub fn forward(&self, x: &Tensor, hooks: &HookRegistry) -> Result<Tensor> {
        let out = self.inner.forward(x)?;
        hooks.dispatch(&self.name, out)
    }
}
