use std::collections::HashMap;
use std::sync::Mutex;

use super::ModuleSource;
use crate::types::ModuleInfo;

/// Host-managed module set. Modules appear and disappear only through
/// [`load`](Self::load) and [`unload`](Self::unload).
#[derive(Default)]
pub struct StaticModules {
    modules: Mutex<Vec<ModuleInfo>>,
    exports: Mutex<HashMap<String, usize>>,
}

impl StaticModules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self, module: ModuleInfo) {
        self.modules.lock().unwrap_or_else(|e| e.into_inner()).push(module);
    }

    /// Remove a module by path or basename. Returns whether one was removed.
    pub fn unload(&self, name: &str) -> bool {
        let mut modules = self.modules.lock().unwrap_or_else(|e| e.into_inner());
        let before = modules.len();
        modules.retain(|m| !m.matches_name(name));
        modules.len() != before
    }

    /// Register the real implementation of `symbol`.
    pub fn export(&self, symbol: &str, address: usize) {
        self.exports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(symbol.to_string(), address);
    }
}

impl ModuleSource for StaticModules {
    fn modules(&self) -> Vec<ModuleInfo> {
        self.modules.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn resolve_export(&self, symbol: &str) -> Option<usize> {
        self.exports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(symbol)
            .copied()
    }
}
