//! threadhook-intercept: import-table hooking for dynamically linked symbols.
//!
//! Calls to a symbol are redirected by rewriting the resolved-address slots
//! that other modules call through (GOT/PLT entries on ELF, or host-managed
//! import tables). Several proxies may be stacked on one symbol; each can
//! forward to the previous one through a [`StackScope`].

pub mod chain;
pub mod filter;
pub mod interceptor;
pub mod module;
pub mod patcher;
pub mod resolver;
pub mod scope;
pub mod types;

#[cfg(test)]
pub(crate) mod test_utils;

// Re-exports for convenience (flattened imports)
pub use filter::CallerFilter;
pub use interceptor::{
    HookBinding, HookOp, HookRecord, InstallReport, Interceptor, ModuleFailure, Stub, StubState, UnhookReport,
};
pub use module::{LoaderModules, ModuleRegistry, ModuleSource, StaticModules};
pub use resolver::{ImportTable, SymbolResolver, TableEntry, TableFormat, TableKind};
pub use scope::StackScope;
pub use types::{HookError, ModuleHandle, ModuleInfo};

/// Process-global lock for tests that rewrite slots or install proxies.
///
/// Proxies in the shared fixtures forward through a process-wide stub
/// registry, so tests using them must not run concurrently.
#[cfg(test)]
pub(crate) fn lock_hook_tests() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(())).lock().unwrap_or_else(|e| e.into_inner())
}
