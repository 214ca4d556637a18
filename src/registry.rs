//! Name-keyed pool of jail managers
//!
//! The registry lock only guards the map; lifecycle calls on a jail always
//! run outside it, so a slow stop never blocks operations on other jails.

use crate::jail::manager::{Backend, JailManager};
use crate::jail::types::JailRuntimeInfo;
use crate::logging::LogSink;
use crate::manifest::{EnvironmentConfig, JailSettings};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

const LOG: &str = "registry";

/// Concurrency-safe collection of jails, ordered by name
pub struct JailRegistry {
    settings: Arc<JailSettings>,
    backend: Backend,
    sink: Arc<dyn LogSink>,
    jails: Mutex<BTreeMap<String, Arc<JailManager>>>,
}

impl JailRegistry {
    pub fn new(settings: JailSettings, backend: Backend, sink: Arc<dyn LogSink>) -> Self {
        Self {
            settings: Arc::new(settings),
            backend,
            sink,
            jails: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn settings(&self) -> &JailSettings {
        &self.settings
    }

    /// Register a jail; false if the name is taken
    ///
    /// The manager is built and its runtime state restored before the map is
    /// locked; the name is checked again once the lock is held.
    pub fn add(&self, config: EnvironmentConfig) -> bool {
        let name = config.name.clone();
        if self.lock().contains_key(&name) {
            return self.duplicate(&name);
        }

        let manager = JailManager::new(
            config,
            self.settings.clone(),
            &self.backend,
            self.sink.clone(),
        );
        if let Err(e) = manager.restore() {
            self.sink.warning(
                LOG,
                &format!("Ignoring runtime state for '{}': {}", name, e),
            );
        }

        let mut jails = self.lock();
        if jails.contains_key(&name) {
            drop(jails);
            return self.duplicate(&name);
        }
        jails.insert(name.clone(), Arc::new(manager));
        drop(jails);

        self.sink.debug(LOG, &format!("Registered jail '{}'", name));
        true
    }

    fn duplicate(&self, name: &str) -> bool {
        self.sink
            .warning(LOG, &format!("Jail '{}' is already registered", name));
        false
    }

    /// Stop a jail and drop it from the registry; false if unknown
    ///
    /// The jail's tree is left on disk; call `destroy` first to delete it.
    pub fn remove(&self, name: &str) -> bool {
        let Some(manager) = self.get(name) else {
            return false;
        };

        if let Err(e) = manager.stop() {
            self.sink
                .error(LOG, &format!("Failed to stop '{}' during removal: {}", name, e));
        }

        let mut jails = self.lock();
        match jails.get(name) {
            Some(current) if Arc::ptr_eq(current, &manager) => {
                jails.remove(name);
                self.sink.debug(LOG, &format!("Removed jail '{}'", name));
                true
            }
            // Someone else removed (or replaced) it meanwhile
            _ => false,
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<JailManager>> {
        self.lock().get(name).cloned()
    }

    /// Registered names in order
    pub fn list(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Snapshot of every jail, in name order
    pub fn runtime_info_all(&self) -> Vec<JailRuntimeInfo> {
        let managers: Vec<Arc<JailManager>> = self.lock().values().cloned().collect();
        managers.iter().map(|m| m.runtime_info()).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Arc<JailManager>>> {
        self.jails.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
