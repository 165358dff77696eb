//! Per-user model registry
//!
//! Maps `(user, model name)` to a shared [`Inspector`]. Each entry sits
//! behind its own mutex, which is the exclusive lock serializing
//! generate/capture/override/reset on that instance; different entries run
//! independently.
//!
//! Lifecycle: create on first load, reuse on match, explicit evict.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};

use crate::error::{InspectError, Result};
use crate::inspector::Inspector;
use crate::model::LoadOptions;

/// Identifier of the caller owning an instance
pub type UserId = u64;

/// Shared, individually locked inspector
pub type SharedInspector = Arc<Mutex<Inspector>>;

type Key = (UserId, String);

#[derive(Default)]
pub struct ModelRegistry {
    entries: Mutex<HashMap<Key, SharedInspector>>,
    options: LoadOptions,
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("entries", &self.len())
            .field("options", &self.options)
            .finish()
    }
}

impl ModelRegistry {
    /// Registry whose loads use `options`
    pub fn new(options: LoadOptions) -> Self {
        Self {
            entries: Mutex::default(),
            options,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Key, SharedInspector>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the user's instance of `model_name`, loading it on first use
    ///
    /// Loading runs without holding the registry lock. If two callers race
    /// on the same key, the first instance inserted is kept and returned to
    /// both.
    pub fn load(&self, user: UserId, model_name: &str) -> Result<SharedInspector> {
        let key = (user, model_name.to_string());
        if let Some(existing) = self.lock().get(&key) {
            debug!("Reusing '{}' for user {}", model_name, user);
            return Ok(Arc::clone(existing));
        }

        info!("Loading '{}' for user {}", model_name, user);
        let fresh = Arc::new(Mutex::new(Inspector::load(model_name, self.options.clone())?));
        let entry = self.lock().entry(key).or_insert(fresh).clone();
        Ok(entry)
    }

    pub fn get(&self, user: UserId, model_name: &str) -> Result<SharedInspector> {
        self.lock()
            .get(&(user, model_name.to_string()))
            .cloned()
            .ok_or_else(|| {
                InspectError::NotFound(format!("model '{model_name}' not loaded for user {user}"))
            })
    }

    /// Remove an instance; it is freed once no caller holds it
    pub fn evict(&self, user: UserId, model_name: &str) -> bool {
        let removed = self.lock().remove(&(user, model_name.to_string())).is_some();
        if removed {
            info!("Evicted '{}' for user {}", model_name, user);
        }
        removed
    }

    /// Model names loaded for `user`, sorted
    pub fn models_for(&self, user: UserId) -> Vec<String> {
        let mut names: Vec<String> = self
            .lock()
            .keys()
            .filter(|(owner, _)| *owner == user)
            .map(|(_, name)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Lock one instance for the duration of an operation
pub fn lock_inspector(shared: &SharedInspector) -> MutexGuard<'_, Inspector> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn registry() -> ModelRegistry {
        ModelRegistry::new(LoadOptions {
            force_cpu: true,
            ..LoadOptions::default()
        })
    }

    #[test]
    fn test_create_then_reuse() {
        let registry = registry();
        let a = registry.load(1, "demo").unwrap();
        let b = registry.load(1, "demo").unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let other_user = registry.load(2, "demo").unwrap();
        assert!(!Arc::ptr_eq(&a, &other_user));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_instances_do_not_share_state() {
        let registry = registry();
        let a = registry.load(1, "demo").unwrap();
        let b = registry.load(2, "demo").unwrap();
        lock_inspector(&a).set_timestep(7);
        assert_eq!(lock_inspector(&b).session().timestep(), 1);
    }

    #[test]
    fn test_get_and_evict() {
        let registry = registry();
        assert_eq!(registry.get(1, "demo").unwrap_err().kind(), ErrorKind::NotFound);

        registry.load(1, "demo").unwrap();
        assert_eq!(registry.models_for(1), vec!["demo"]);
        assert!(registry.get(1, "demo").is_ok());

        assert!(registry.evict(1, "demo"));
        assert!(!registry.evict(1, "demo"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unknown_model_not_cached() {
        let registry = registry();
        let empty = tempfile::tempdir().unwrap();
        let err = registry.load(1, empty.path().to_str().unwrap()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(registry.is_empty());
    }
}
