use core::sync::atomic::{AtomicU8, Ordering};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::chain::ChainPosition;
use crate::filter::CallerFilter;
use crate::scope::StackScope;
use crate::types::{HookError, ModuleHandle, ModuleInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StubState {
    Installing = 0,
    Installed = 1,
    Uninstalling = 2,
    Uninstalled = 3,
}

impl StubState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => StubState::Installing,
            1 => StubState::Installed,
            2 => StubState::Uninstalling,
            _ => StubState::Uninstalled,
        }
    }
}

/// One rewritten table slot owned by a stub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookBinding {
    pub module: ModuleHandle,
    pub slot: usize,
    /// Slot value read just before this stub claimed it.
    pub original: usize,
    /// Value the slot held after the claim.
    pub installed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleFailure {
    pub module: String,
    pub error: HookError,
}

/// Outcome of applying a hook across the module list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
    /// Modules looked at.
    pub scanned: usize,
    /// Modules rejected by the filter or the exclusion set.
    pub skipped: usize,
    /// Slots claimed.
    pub bound: usize,
    pub failures: Vec<ModuleFailure>,
}

impl InstallReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn merge(&mut self, other: InstallReport) {
        self.scanned += other.scanned;
        self.skipped += other.skipped;
        self.bound += other.bound;
        self.failures.extend(other.failures);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnhookReport {
    /// Slots written back to an older proxy or their pristine value.
    pub restored: usize,
    /// Slots still routed through a newer proxy, left untouched.
    pub deferred: usize,
    /// Slots holding a value nobody in the chain wrote, left untouched.
    pub foreign: usize,
    /// Bindings discarded because their module was unloaded.
    pub vanished: usize,
    pub failures: Vec<ModuleFailure>,
}

pub(crate) struct StubInner {
    pub symbol: String,
    pub position: ChainPosition,
    pub filter: CallerFilter,
    pub excluded: HashSet<String>,
    state: AtomicU8,
    pub bindings: Mutex<Vec<HookBinding>>,
    pub report: Mutex<InstallReport>,
}

/// Handle for one installed hook.
#[derive(Clone)]
pub struct Stub {
    pub(crate) inner: Arc<StubInner>,
}

impl fmt::Debug for Stub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stub")
            .field("symbol", &self.inner.symbol)
            .field("proxy", &format_args!("{:#x}", self.proxy()))
            .field("position", &self.position())
            .field("state", &self.state())
            .finish()
    }
}

impl Stub {
    pub(crate) fn new(
        symbol: &str,
        position: ChainPosition,
        filter: CallerFilter,
        excluded: HashSet<String>,
    ) -> Self {
        Self {
            inner: Arc::new(StubInner {
                symbol: symbol.to_string(),
                position,
                filter,
                excluded,
                state: AtomicU8::new(StubState::Installing as u8),
                bindings: Mutex::new(Vec::new()),
                report: Mutex::new(InstallReport::default()),
            }),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.inner.symbol
    }

    pub fn proxy(&self) -> usize {
        self.inner.position.proxy()
    }

    pub fn position(&self) -> u64 {
        self.inner.position.position()
    }

    pub fn chain_position(&self) -> &ChainPosition {
        &self.inner.position
    }

    pub fn state(&self) -> StubState {
        StubState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn is_installed(&self) -> bool {
        self.state() == StubState::Installed
    }

    pub fn bindings(&self) -> Vec<HookBinding> {
        self.inner.bindings.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Result of the install plus every later refresh.
    pub fn report(&self) -> InstallReport {
        self.inner.report.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Open the call scope for this hook's proxy. Works after unhook too, so
    /// calls already routed into the proxy can still forward.
    pub fn enter(&self) -> StackScope {
        StackScope::enter(&self.inner.position)
    }

    pub fn same_as(&self, other: &Stub) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn admits(&self, module: &ModuleInfo) -> bool {
        self.inner.filter.accepts(&module.path)
            && !self.inner.excluded.iter().any(|e| module.matches_name(e))
    }

    pub(crate) fn set_state(&self, state: StubState) {
        self.inner.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn transition(&self, from: StubState, to: StubState) -> bool {
        self.inner
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn add_bindings(&self, bindings: Vec<HookBinding>) {
        self.inner
            .bindings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(bindings);
    }

    pub(crate) fn take_bindings(&self) -> Vec<HookBinding> {
        core::mem::take(&mut *self.inner.bindings.lock().unwrap_or_else(|e| e.into_inner()))
    }

    pub(crate) fn merge_report(&self, report: InstallReport) {
        self.inner
            .report
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .merge(report);
    }
}
