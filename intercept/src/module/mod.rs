//! Module Registry: the live list of loaded shared modules.
//!
//! Nothing here is cached across calls except the generation counters that
//! let a [`ModuleHandle`] detect that its module was unloaded (and possibly
//! reloaded at the same address) since it was issued.

#[cfg(target_os = "linux")]
mod linux;
mod synthetic;

#[cfg(target_os = "linux")]
pub use linux::*;
pub use synthetic::StaticModules;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::debug;

use crate::types::{ModuleHandle, ModuleInfo};

/// Where modules come from: the dynamic loader, or a host-managed set.
pub trait ModuleSource: Send + Sync {
    /// Modules loaded right now, in a stable order for this call.
    fn modules(&self) -> Vec<ModuleInfo>;

    /// Address of the real implementation of `symbol`, used as the chain terminal.
    fn resolve_export(&self, symbol: &str) -> Option<usize>;

    /// Keep `module` mapped until the returned pin is dropped.
    /// `None` means the module is already gone.
    fn pin(&self, module: &ModuleInfo) -> Option<ModulePin> {
        let _ = module;
        Some(ModulePin::unpinned())
    }
}

/// Scoped reference on a loaded module, released exactly once on drop.
pub struct ModulePin {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl ModulePin {
    pub fn unpinned() -> Self {
        Self { release: None }
    }

    pub fn with_release(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }
}

impl Drop for ModulePin {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// A module from one enumeration together with its generation handle.
#[derive(Debug, Clone)]
pub struct LoadedModule {
    pub info: ModuleInfo,
    pub handle: ModuleHandle,
}

/// A live module that cannot be unloaded while this value exists.
pub struct PinnedModule {
    pub info: ModuleInfo,
    pub handle: ModuleHandle,
    _pin: ModulePin,
}

struct RegistryState {
    next_generation: u64,
    live: HashMap<(String, usize), u64>,
}

pub struct ModuleRegistry {
    source: Arc<dyn ModuleSource>,
    state: Mutex<RegistryState>,
}

impl ModuleRegistry {
    pub fn new(source: Arc<dyn ModuleSource>) -> Self {
        Self {
            source,
            state: Mutex::new(RegistryState {
                next_generation: 0,
                live: HashMap::new(),
            }),
        }
    }

    pub fn source(&self) -> &Arc<dyn ModuleSource> {
        &self.source
    }

    pub fn resolve_export(&self, symbol: &str) -> Option<usize> {
        self.source.resolve_export(symbol)
    }

    /// Query the source and assign generations. A module that disappeared
    /// from one listing gets a fresh generation if it ever shows up again.
    pub fn list_modules(&self) -> Vec<LoadedModule> {
        let modules = self.source.modules();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        let mut live = HashMap::with_capacity(modules.len());
        let mut out = Vec::with_capacity(modules.len());
        for info in modules {
            let key = (info.path.clone(), info.base_address);
            if live.contains_key(&key) {
                continue;
            }
            let generation = match state.live.get(&key) {
                Some(g) => *g,
                None => {
                    state.next_generation += 1;
                    state.next_generation
                }
            };
            live.insert(key, generation);
            out.push(LoadedModule {
                handle: ModuleHandle {
                    path: info.path.clone(),
                    base_address: info.base_address,
                    generation,
                },
                info,
            });
        }
        state.live = live;
        out
    }

    /// Pin every live module, then drop the ones that vanished before the pin took hold.
    pub fn pin_live(&self) -> Vec<PinnedModule> {
        let mut pinned = Vec::new();
        for module in self.list_modules() {
            match self.source.pin(&module.info) {
                Some(pin) => pinned.push(PinnedModule {
                    info: module.info,
                    handle: module.handle,
                    _pin: pin,
                }),
                None => debug!("module {} vanished before it could be pinned", module.info.path),
            }
        }

        let current: Vec<ModuleHandle> = self.list_modules().into_iter().map(|m| m.handle).collect();
        pinned.retain(|m| current.contains(&m.handle));
        pinned
    }

    /// The module behind `handle`, if it is still the same load.
    pub fn revalidate(&self, handle: &ModuleHandle) -> Option<ModuleInfo> {
        self.list_modules()
            .into_iter()
            .find(|m| m.handle == *handle)
            .map(|m| m.info)
    }
}

#[cfg(not(target_os = "linux"))]
pub struct LoaderModules;

#[cfg(not(target_os = "linux"))]
impl ModuleSource for LoaderModules {
    fn modules(&self) -> Vec<ModuleInfo> {
        Vec::new()
    }

    fn resolve_export(&self, _symbol: &str) -> Option<usize> {
        None
    }
}
