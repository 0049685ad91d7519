//! Installer: rewrites table slots across the module list and reverses it.
//!
//! Each slot is owned by the chain of its symbol. Every stub that claimed the
//! slot is recorded as an owner, and the slot always holds the newest owner's
//! proxy (or its pristine value once no owner remains). Install and unhook
//! hold the chain lock for the whole walk, so a slot is never observed with a
//! value that does not belong to a published chain state.

mod records;
mod stub;

pub use records::{HookOp, HookRecord, MAX_RECORDS};
pub use stub::{HookBinding, InstallReport, ModuleFailure, Stub, StubState, UnhookReport};

use core::ffi::c_void;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, OnceLock};

use log::{debug, info, warn};

use crate::chain::{ChainState, HookTable, SlotRecord};
use crate::filter::CallerFilter;
use crate::module::{LoaderModules, ModuleRegistry, ModuleSource, PinnedModule};
use crate::patcher::{ProtectingWriter, SlotWriter};
use crate::resolver::{read_slot, TableEntry};
use crate::scope::StackScope;
use crate::types::{basename, HookError, ModuleHandle};
use records::RecordLog;

pub struct Interceptor {
    registry: ModuleRegistry,
    table: HookTable,
    writer: Arc<dyn SlotWriter>,
    stubs: Mutex<Vec<Stub>>,
    records: RecordLog,
}

impl Interceptor {
    /// The process-wide interceptor over the live dynamic loader.
    pub fn obtain() -> &'static Interceptor {
        static INSTANCE: OnceLock<Interceptor> = OnceLock::new();
        INSTANCE.get_or_init(|| Interceptor::new(Arc::new(LoaderModules), Arc::new(ProtectingWriter::new())))
    }

    pub fn new(source: Arc<dyn ModuleSource>, writer: Arc<dyn SlotWriter>) -> Self {
        Self {
            registry: ModuleRegistry::new(source),
            table: HookTable::new(),
            writer,
            stubs: Mutex::new(Vec::new()),
            records: RecordLog::default(),
        }
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub fn table(&self) -> &HookTable {
        &self.table
    }

    /// Route calls to `symbol` from every admitted module through `proxy`.
    ///
    /// Per-module failures end up in [`Stub::report`]; the hook itself only
    /// fails when the chain entry cannot be created.
    pub fn hook(
        &self,
        symbol: &str,
        proxy: *const c_void,
        filter: CallerFilter,
        excluded: &HashSet<String>,
    ) -> Result<Stub, HookError> {
        let result = self.install(symbol, proxy as usize, filter, excluded);
        if let Err(error) = &result {
            warn!("hook `{symbol}` failed: {error}");
            self.records
                .push(HookOp::Hook, symbol, None, proxy as usize, Some(error.clone()));
        }
        result
    }

    pub fn hook_all(&self, symbol: &str, proxy: *const c_void) -> Result<Stub, HookError> {
        self.hook(symbol, proxy, CallerFilter::allow_all(), &HashSet::new())
    }

    fn install(
        &self,
        symbol: &str,
        proxy: usize,
        filter: CallerFilter,
        excluded: &HashSet<String>,
    ) -> Result<Stub, HookError> {
        validate_symbol(symbol)?;
        if proxy == 0 {
            return Err(HookError::NullProxy);
        }
        let original = self
            .registry
            .resolve_export(symbol)
            .ok_or_else(|| HookError::SymbolNotFound(symbol.to_string()))?;

        let chain = self.table.chain_for(symbol, original);
        if chain.original() != original {
            debug!(
                "`{symbol}` now resolves to {original:#x}, chain keeps {:#x}",
                chain.original()
            );
        }

        let modules = self.registry.pin_live();
        let mut state = chain.lock();
        let position = chain.push_locked(&mut state, proxy)?;
        let stub = Stub::new(symbol, position, filter, excluded.clone());
        let report = self.apply(&stub, &mut state, &modules, HookOp::Hook);
        stub.set_state(StubState::Installed);
        drop(state);
        drop(modules);

        info!(
            "hooked `{symbol}` with {proxy:#x}: {} slot(s) bound, {} module(s) skipped, {} failure(s)",
            report.bound,
            report.skipped,
            report.failures.len()
        );
        stub.merge_report(report);
        self.stubs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(stub.clone());
        Ok(stub)
    }

    /// Claim every slot for `stub`'s symbol in `modules` that the stub admits and
    /// does not own yet.
    fn apply(
        &self,
        stub: &Stub,
        state: &mut ChainState,
        modules: &[PinnedModule],
        op: HookOp,
    ) -> InstallReport {
        let symbol = stub.symbol();
        let mut report = InstallReport::default();
        let mut bindings = Vec::new();

        for module in modules {
            report.scanned += 1;
            let path = module.info.path.as_str();
            if !stub.admits(&module.info) {
                debug!("`{symbol}`: skipping {path}");
                report.skipped += 1;
                continue;
            }

            let entries = match module.info.tables.find_entries(symbol) {
                Ok(entries) => entries,
                Err(error) => {
                    warn!("`{symbol}`: cannot search {path}: {error}");
                    self.records.push(op, symbol, Some(path), 0, Some(error.clone()));
                    report.failures.push(ModuleFailure {
                        module: path.to_string(),
                        error,
                    });
                    continue;
                }
            };

            for entry in entries {
                match self.claim(state, &module.handle, entry, stub.position(), stub.proxy()) {
                    Ok(Some(binding)) => {
                        self.records.push(op, symbol, Some(path), binding.installed, None);
                        report.bound += 1;
                        bindings.push(binding);
                    }
                    Ok(None) => {}
                    Err(error) => {
                        warn!("`{symbol}`: slot {:#x} in {path}: {error}", entry.slot);
                        self.records
                            .push(op, symbol, Some(path), stub.proxy(), Some(error.clone()));
                        report.failures.push(ModuleFailure {
                            module: path.to_string(),
                            error,
                        });
                    }
                }
            }
        }

        stub.add_bindings(bindings);
        report
    }

    fn claim(
        &self,
        state: &mut ChainState,
        module: &ModuleHandle,
        entry: TableEntry,
        position: u64,
        proxy: usize,
    ) -> Result<Option<HookBinding>, HookError> {
        let current = entry.value;
        let fresh = || SlotRecord {
            pristine: current,
            owners: Vec::new(),
            module: module.clone(),
        };

        let record = state.slots.entry(entry.slot).or_insert_with(fresh);
        if record.module != *module {
            // Same address, different load: earlier owners refer to a module that is gone.
            *record = fresh();
        }
        if record.is_owned_by(position) {
            return Ok(None);
        }

        record.add_owner(position, proxy);
        let desired = record.desired();
        if desired != current {
            if let Err(error) = unsafe { self.writer.write(entry.slot, desired) } {
                record.remove_owner(position);
                if record.owners.is_empty() {
                    state.slots.remove(&entry.slot);
                }
                return Err(error);
            }
        }

        Ok(Some(HookBinding {
            module: module.clone(),
            slot: entry.slot,
            original: current,
            installed: desired,
        }))
    }

    /// Reverse `stub`: hand each slot back to the next older owner (or its
    /// pristine value), then remove the stub's chain entry.
    pub fn unhook(&self, stub: &Stub) -> Result<UnhookReport, HookError> {
        if !stub.transition(StubState::Installed, StubState::Uninstalling) {
            self.records
                .push(HookOp::Unhook, stub.symbol(), None, stub.proxy(), Some(HookError::DoubleUnhook));
            return Err(HookError::DoubleUnhook);
        }

        let pinned = self.registry.pin_live();
        let live: HashSet<&ModuleHandle> = pinned.iter().map(|m| &m.handle).collect();

        let chain = stub.chain_position().chain().clone();
        let mut state = chain.lock();
        let mut report = UnhookReport::default();
        for binding in stub.take_bindings() {
            let alive = live.contains(&binding.module);
            self.release(&mut state, stub, &binding, alive, &mut report);
        }
        let popped = chain.pop_locked(&mut state, stub.chain_position());
        drop(state);
        drop(pinned);

        stub.set_state(StubState::Uninstalled);
        self.stubs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|s| !s.same_as(stub));

        if let Err(error) = popped {
            warn!("unhook `{}`: {error}", stub.symbol());
            self.records
                .push(HookOp::Unhook, stub.symbol(), None, stub.proxy(), Some(error.clone()));
            return Err(error);
        }

        info!(
            "unhooked `{}` ({:#x}): {} restored, {} deferred, {} vanished, {} failure(s)",
            stub.symbol(),
            stub.proxy(),
            report.restored,
            report.deferred,
            report.vanished,
            report.failures.len()
        );
        Ok(report)
    }

    fn release(
        &self,
        state: &mut ChainState,
        stub: &Stub,
        binding: &HookBinding,
        alive: bool,
        report: &mut UnhookReport,
    ) {
        let symbol = stub.symbol();
        let position = stub.position();
        let path = binding.module.path.as_str();

        let owned = matches!(
            state.slots.get(&binding.slot),
            Some(r) if r.module == binding.module && r.is_owned_by(position)
        );

        if !alive {
            if owned {
                drop_owner(state, binding.slot, position);
            }
            debug!("`{symbol}`: {path} was unloaded, discarding slot {:#x}", binding.slot);
            let error = HookError::ModuleVanished(path.to_string());
            self.records
                .push(HookOp::Unhook, symbol, Some(path), 0, Some(error.clone()));
            report.vanished += 1;
            report.failures.push(ModuleFailure {
                module: path.to_string(),
                error,
            });
            return;
        }

        if !owned {
            let error = HookError::ChainCorruption {
                symbol: symbol.to_string(),
                reason: format!("slot {:#x} in {path} has no record for position {position}", binding.slot),
            };
            warn!("{error}");
            self.records
                .push(HookOp::Unhook, symbol, Some(path), 0, Some(error.clone()));
            report.failures.push(ModuleFailure {
                module: path.to_string(),
                error,
            });
            return;
        }

        let Some(record) = state.slots.get_mut(&binding.slot) else {
            return;
        };
        let before = record.desired();
        record.remove_owner(position);
        let after = record.desired();
        if record.owners.is_empty() {
            state.slots.remove(&binding.slot);
        }

        if before == after {
            report.deferred += 1;
            return;
        }

        let current = unsafe { read_slot(binding.slot) };
        if current != before && current != stub.proxy() {
            warn!(
                "`{symbol}`: slot {:#x} in {path} holds {current:#x}, written outside the chain; leaving it",
                binding.slot
            );
            report.foreign += 1;
            return;
        }

        match unsafe { self.writer.write(binding.slot, after) } {
            Ok(()) => {
                self.records.push(HookOp::Unhook, symbol, Some(path), after, None);
                report.restored += 1;
            }
            Err(error) => {
                warn!("`{symbol}`: cannot restore slot {:#x} in {path}: {error}", binding.slot);
                self.records
                    .push(HookOp::Unhook, symbol, Some(path), after, Some(error.clone()));
                report.failures.push(ModuleFailure {
                    module: path.to_string(),
                    error,
                });
            }
        }
    }

    /// Apply every installed stub to slots it does not own yet, e.g. in
    /// modules loaded since it was installed.
    pub fn refresh(&self) -> InstallReport {
        let stubs = self.stubs();
        let mut total = InstallReport::default();
        if stubs.is_empty() {
            return total;
        }

        let modules = self.registry.pin_live();
        for stub in stubs {
            let chain = stub.chain_position().chain().clone();
            let mut state = chain.lock();
            if !stub.is_installed() {
                continue;
            }
            let report = self.apply(&stub, &mut state, &modules, HookOp::Refresh);
            drop(state);

            if report.bound > 0 {
                info!("refresh: `{}` bound {} new slot(s)", stub.symbol(), report.bound);
            }
            stub.merge_report(report.clone());
            total.merge(report);
        }
        total
    }

    /// Unhook every installed stub, newest first. Returns how many were removed.
    pub fn unhook_all(&self) -> usize {
        let mut removed = 0;
        for stub in self.stubs().into_iter().rev() {
            match self.unhook(&stub) {
                Ok(_) => removed += 1,
                Err(e) => warn!("unhook `{}` during teardown: {e}", stub.symbol()),
            }
        }
        removed
    }

    /// Installed stubs in install order.
    pub fn stubs(&self) -> Vec<Stub> {
        self.stubs.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn stub_for(&self, symbol: &str, proxy: usize) -> Option<Stub> {
        self.stubs()
            .into_iter()
            .find(|s| s.symbol() == symbol && s.proxy() == proxy)
    }

    /// Open a call scope for `proxy` by address, for proxies without a stub at hand.
    pub fn enter(&self, symbol: &str, proxy: usize) -> Option<StackScope> {
        let chain = self.table.get(symbol)?;
        let position = chain.snapshot().position_of(proxy)?;
        Some(StackScope::enter_at(&chain, position))
    }

    /// Slot ownerships currently held in `module` (path or basename).
    pub fn binding_count(&self, module: &str) -> usize {
        self.count_bindings(|path| path == module || basename(path) == module)
    }

    pub fn total_bindings(&self) -> usize {
        self.count_bindings(|_| true)
    }

    fn count_bindings(&self, matches: impl Fn(&str) -> bool) -> usize {
        self.table
            .chains()
            .iter()
            .map(|chain| {
                chain
                    .lock()
                    .slots
                    .values()
                    .filter(|r| matches(&r.module.path))
                    .map(|r| r.owners.len())
                    .sum::<usize>()
            })
            .sum()
    }

    /// Most recent hook, unhook and refresh operations, oldest first.
    pub fn records(&self) -> Vec<HookRecord> {
        self.records.snapshot()
    }
}

fn drop_owner(state: &mut ChainState, slot: usize, position: u64) {
    if let Some(record) = state.slots.get_mut(&slot) {
        record.remove_owner(position);
        if record.owners.is_empty() {
            state.slots.remove(&slot);
        }
    }
}

fn validate_symbol(symbol: &str) -> Result<(), HookError> {
    if symbol.is_empty() || symbol.contains('\0') {
        return Err(HookError::InvalidSymbol(symbol.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        proxy_add100, proxy_double, register, start_trace, take_trace, target, Fixture, FailingWriter, SYMBOL,
    };
    use std::sync::atomic::{AtomicBool, Ordering};

    fn excluded(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn hook_then_unhook_restores_every_slot() {
        let _g = crate::lock_hook_tests();
        let fx = Fixture::new(&["liba.so", "libb.so"]);
        let before: Vec<usize> = ["liba.so", "libb.so"].iter().map(|m| fx.slot(m)).collect();

        let stub = fx.interceptor.hook_all(SYMBOL, proxy_double as *const c_void).unwrap();
        register(&stub);
        assert!(stub.is_installed());
        assert_eq!(stub.report().bound, 2);
        assert_eq!(fx.slot("liba.so"), proxy_double as usize);
        assert_eq!(fx.call("liba.so", 1), 4);

        let report = fx.interceptor.unhook(&stub).unwrap();
        assert_eq!(report.restored, 2);
        assert!(report.failures.is_empty());
        let after: Vec<usize> = ["liba.so", "libb.so"].iter().map(|m| fx.slot(m)).collect();
        assert_eq!(before, after);
        assert_eq!(fx.call("liba.so", 1), 2);
        assert_eq!(stub.state(), StubState::Uninstalled);
    }

    #[test]
    fn second_unhook_reports_double_unhook() {
        let _g = crate::lock_hook_tests();
        let fx = Fixture::new(&["liba.so"]);
        let s1 = fx.interceptor.hook_all(SYMBOL, proxy_add100 as *const c_void).unwrap();
        let s2 = fx.interceptor.hook_all(SYMBOL, proxy_double as *const c_void).unwrap();
        register(&s1);
        register(&s2);

        fx.interceptor.unhook(&s2).unwrap();
        assert_eq!(fx.interceptor.unhook(&s2).unwrap_err(), HookError::DoubleUnhook);

        // The other stub is untouched.
        assert!(s1.is_installed());
        assert_eq!(fx.slot("liba.so"), proxy_add100 as usize);
        assert_eq!(fx.interceptor.binding_count("liba.so"), 1);
        let last = fx.interceptor.records().pop().unwrap();
        assert_eq!(last.error, Some(HookError::DoubleUnhook));
    }

    #[test]
    fn newest_proxy_runs_first_and_reaches_older_one() {
        let _g = crate::lock_hook_tests();
        let fx = Fixture::new(&["liba.so"]);
        let p1 = fx.interceptor.hook_all(SYMBOL, proxy_add100 as *const c_void).unwrap();
        register(&p1);
        let p2 = fx.interceptor.hook_all(SYMBOL, proxy_double as *const c_void).unwrap();
        register(&p2);

        start_trace();
        assert_eq!(fx.call("liba.so", 1), (1 + 1 + 100) * 2);
        assert_eq!(take_trace(), ["double", "add100", "target"]);

        fx.interceptor.unhook(&p2).unwrap();
        start_trace();
        assert_eq!(fx.call("liba.so", 1), 1 + 1 + 100);
        assert_eq!(take_trace(), ["add100", "target"]);
    }

    #[test]
    fn unhooking_the_older_proxy_keeps_the_newer_in_place() {
        let _g = crate::lock_hook_tests();
        let fx = Fixture::new(&["liba.so"]);
        let p1 = fx.interceptor.hook_all(SYMBOL, proxy_add100 as *const c_void).unwrap();
        register(&p1);
        let p2 = fx.interceptor.hook_all(SYMBOL, proxy_double as *const c_void).unwrap();
        register(&p2);

        let report = fx.interceptor.unhook(&p1).unwrap();
        assert_eq!(report.deferred, 1);
        assert_eq!(fx.slot("liba.so"), proxy_double as usize);
        start_trace();
        assert_eq!(fx.call("liba.so", 1), 4);
        assert_eq!(take_trace(), ["double", "target"]);

        fx.interceptor.unhook(&p2).unwrap();
        assert_eq!(fx.slot("liba.so"), target as usize);
    }

    #[test]
    fn excluded_modules_keep_their_slots() {
        let _g = crate::lock_hook_tests();
        let fx = Fixture::new(&["liba.so", "libb.so", "libc.so"]);
        let stub = fx
            .interceptor
            .hook(
                SYMBOL,
                proxy_double as *const c_void,
                CallerFilter::allow_all(),
                &excluded(&["libc.so"]),
            )
            .unwrap();
        register(&stub);

        assert_eq!(fx.slot("liba.so"), proxy_double as usize);
        assert_eq!(fx.slot("libb.so"), proxy_double as usize);
        assert_eq!(fx.slot("libc.so"), target as usize);
        assert_eq!(stub.report().skipped, 1);
        assert_eq!(fx.interceptor.binding_count("libc.so"), 0);
    }

    #[test]
    fn caller_filter_rejects_modules() {
        let _g = crate::lock_hook_tests();
        let fx = Fixture::new(&["liba.so", "libb.so"]);
        let stub = fx
            .interceptor
            .hook(
                SYMBOL,
                proxy_double as *const c_void,
                CallerFilter::deny_globs(["*libb*"]),
                &HashSet::new(),
            )
            .unwrap();
        register(&stub);
        assert_eq!(fx.slot("liba.so"), proxy_double as usize);
        assert_eq!(fx.slot("libb.so"), target as usize);
    }

    #[test]
    fn binding_count_tracks_installs_minus_uninstalls() {
        let _g = crate::lock_hook_tests();
        let fx = Fixture::new(&["liba.so", "libb.so"]);
        let s1 = fx.interceptor.hook_all(SYMBOL, proxy_add100 as *const c_void).unwrap();
        let s2 = fx
            .interceptor
            .hook(
                SYMBOL,
                proxy_double as *const c_void,
                CallerFilter::allow_all(),
                &excluded(&["libb.so"]),
            )
            .unwrap();
        register(&s1);
        register(&s2);
        assert_eq!(fx.interceptor.binding_count("liba.so"), 2);
        assert_eq!(fx.interceptor.binding_count("libb.so"), 1);

        fx.interceptor.unhook(&s1).unwrap();
        assert_eq!(fx.interceptor.binding_count("liba.so"), 1);
        assert_eq!(fx.interceptor.binding_count("libb.so"), 0);
        assert_eq!(fx.slot("libb.so"), target as usize);

        fx.interceptor.unhook(&s2).unwrap();
        assert_eq!(fx.interceptor.total_bindings(), 0);
    }

    #[test]
    fn same_proxy_twice_is_already_hooked() {
        let _g = crate::lock_hook_tests();
        let fx = Fixture::new(&["liba.so"]);
        let stub = fx.interceptor.hook_all(SYMBOL, proxy_double as *const c_void).unwrap();
        register(&stub);
        let err = fx
            .interceptor
            .hook_all(SYMBOL, proxy_double as *const c_void)
            .unwrap_err();
        assert!(matches!(err, HookError::AlreadyHooked { .. }));
        assert_eq!(fx.interceptor.stubs().len(), 1);
        assert_eq!(fx.interceptor.binding_count("liba.so"), 1);
    }

    #[test]
    fn invalid_requests_are_rejected() {
        let _g = crate::lock_hook_tests();
        let fx = Fixture::new(&["liba.so"]);
        assert_eq!(
            fx.interceptor.hook_all("no_such_symbol", proxy_double as *const c_void).unwrap_err(),
            HookError::SymbolNotFound("no_such_symbol".to_string())
        );
        assert!(matches!(
            fx.interceptor.hook_all("", proxy_double as *const c_void),
            Err(HookError::InvalidSymbol(_))
        ));
        assert_eq!(
            fx.interceptor.hook_all(SYMBOL, core::ptr::null()).unwrap_err(),
            HookError::NullProxy
        );
        assert!(fx.interceptor.table().get(SYMBOL).is_none());
    }

    #[test]
    fn unloaded_module_is_reported_as_vanished() {
        let _g = crate::lock_hook_tests();
        let fx = Fixture::new(&["liba.so", "libb.so"]);
        let stub = fx.interceptor.hook_all(SYMBOL, proxy_double as *const c_void).unwrap();
        register(&stub);

        assert!(fx.modules.unload("libb.so"));
        let report = fx.interceptor.unhook(&stub).unwrap();
        assert_eq!(report.restored, 1);
        assert_eq!(report.vanished, 1);
        assert_eq!(
            report.failures,
            vec![ModuleFailure {
                module: "/system/lib/libb.so".to_string(),
                error: HookError::ModuleVanished("/system/lib/libb.so".to_string()),
            }]
        );
        // The unloaded module's table was not written.
        assert_eq!(fx.slot("libb.so"), proxy_double as usize);
        assert_eq!(fx.interceptor.total_bindings(), 0);
    }

    #[test]
    fn reloaded_module_is_bound_again_by_refresh() {
        let _g = crate::lock_hook_tests();
        let mut fx = Fixture::new(&["liba.so"]);
        let stub = fx.interceptor.hook_all(SYMBOL, proxy_double as *const c_void).unwrap();
        register(&stub);

        fx.modules.unload("liba.so");
        fx.interceptor.registry().list_modules();
        fx.reload("liba.so");
        assert_eq!(fx.slot("liba.so"), target as usize);

        // Refresh binds the new load; unhook discards the stale binding only.
        assert_eq!(fx.interceptor.refresh().bound, 1);
        let report = fx.interceptor.unhook(&stub).unwrap();
        assert_eq!(report.vanished, 1);
        assert_eq!(report.restored, 1);
        assert_eq!(fx.slot("liba.so"), target as usize);
    }

    #[test]
    fn write_failure_in_one_module_does_not_stop_the_rest() {
        let _g = crate::lock_hook_tests();
        let writer = Arc::new(FailingWriter::default());
        let fx = Fixture::with_writer(&["liba.so", "libb.so", "libc.so"], writer.clone());
        writer.fail_at(fx.slot_address("libb.so"));

        let stub = fx.interceptor.hook_all(SYMBOL, proxy_double as *const c_void).unwrap();
        register(&stub);
        let report = stub.report();
        assert_eq!(report.bound, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].module, "/system/lib/libb.so");
        assert!(matches!(report.failures[0].error, HookError::RemapFailed { .. }));
        assert_eq!(fx.slot("libb.so"), target as usize);
        assert_eq!(fx.slot("libc.so"), proxy_double as usize);
        assert_eq!(fx.interceptor.binding_count("libb.so"), 0);

        fx.interceptor.unhook(&stub).unwrap();
        assert_eq!(fx.interceptor.total_bindings(), 0);
    }

    #[test]
    fn foreign_writes_are_left_alone() {
        let _g = crate::lock_hook_tests();
        let fx = Fixture::new(&["liba.so"]);
        let stub = fx.interceptor.hook_all(SYMBOL, proxy_double as *const c_void).unwrap();
        register(&stub);

        let slot = fx.slot_address("liba.so");
        unsafe { crate::patcher::AtomicWriter.write(slot, proxy_add100 as usize).unwrap() };
        let report = fx.interceptor.unhook(&stub).unwrap();
        assert_eq!(report.foreign, 1);
        assert_eq!(fx.slot("liba.so"), proxy_add100 as usize);
    }

    #[test]
    fn refresh_binds_modules_loaded_later() {
        let _g = crate::lock_hook_tests();
        let mut fx = Fixture::new(&["liba.so"]);
        let stub = fx
            .interceptor
            .hook(
                SYMBOL,
                proxy_double as *const c_void,
                CallerFilter::allow_all(),
                &excluded(&["libz.so"]),
            )
            .unwrap();
        register(&stub);

        fx.load("libd.so");
        fx.load("libz.so");
        let report = fx.interceptor.refresh();
        assert_eq!(report.bound, 1);
        assert_eq!(fx.slot("libd.so"), proxy_double as usize);
        assert_eq!(fx.slot("libz.so"), target as usize);
        assert_eq!(stub.bindings().len(), 2);

        // Nothing new the second time.
        assert_eq!(fx.interceptor.refresh().bound, 0);
        assert_eq!(fx.interceptor.records().iter().filter(|r| r.op == HookOp::Refresh).count(), 1);
    }

    #[test]
    fn enter_finds_the_position_by_proxy_address() {
        let _g = crate::lock_hook_tests();
        let fx = Fixture::new(&["liba.so"]);
        let p1 = fx.interceptor.hook_all(SYMBOL, proxy_add100 as *const c_void).unwrap();
        let p2 = fx.interceptor.hook_all(SYMBOL, proxy_double as *const c_void).unwrap();
        register(&p1);
        register(&p2);

        let scope = fx.interceptor.enter(SYMBOL, proxy_double as usize).unwrap();
        assert_eq!(scope.previous_address(), proxy_add100 as usize);
        drop(scope);
        assert!(fx.interceptor.enter(SYMBOL, 0x1234).is_none());
        assert_eq!(
            fx.interceptor.stub_for(SYMBOL, proxy_add100 as usize).map(|s| s.position()),
            Some(p1.position())
        );
    }

    #[test]
    fn unhook_all_clears_every_binding() {
        let _g = crate::lock_hook_tests();
        let fx = Fixture::new(&["liba.so", "libb.so"]);
        register(&fx.interceptor.hook_all(SYMBOL, proxy_add100 as *const c_void).unwrap());
        register(&fx.interceptor.hook_all(SYMBOL, proxy_double as *const c_void).unwrap());
        assert_eq!(fx.interceptor.unhook_all(), 2);
        assert_eq!(fx.interceptor.total_bindings(), 0);
        assert!(fx.interceptor.stubs().is_empty());
        assert_eq!(fx.slot("liba.so"), target as usize);
    }

    #[test]
    fn concurrent_callers_survive_hook_unhook_loop() {
        let _g = crate::lock_hook_tests();
        let fx = Fixture::new(&["liba.so", "libb.so"]);
        let stop = AtomicBool::new(false);

        std::thread::scope(|s| {
            for module in ["liba.so", "libb.so", "liba.so", "libb.so"] {
                let fx = &fx;
                let stop = &stop;
                s.spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        let value = fx.call(module, 1);
                        assert!(value == 2 || value == 4, "unexpected result {value}");
                    }
                });
            }

            for _ in 0..200 {
                let stub = fx.interceptor.hook_all(SYMBOL, proxy_double as *const c_void).unwrap();
                register(&stub);
                fx.interceptor.unhook(&stub).unwrap();
            }
            stop.store(true, Ordering::Relaxed);
        });

        assert_eq!(fx.interceptor.total_bindings(), 0);
        assert_eq!(fx.slot("liba.so"), target as usize);
        assert_eq!(fx.slot("libb.so"), target as usize);
    }

    #[cfg(target_os = "linux")]
    mod loader {
        use super::*;
        use crate::module::LoaderModules;
        use crate::patcher::ProtectingWriter;
        use std::sync::atomic::AtomicUsize;

        static HITS: AtomicUsize = AtomicUsize::new(0);
        static GETPPID_STUB: Mutex<Option<Stub>> = Mutex::new(None);

        type GetppidFn = extern "C" fn() -> libc::pid_t;

        extern "C" fn getppid_proxy() -> libc::pid_t {
            HITS.fetch_add(1, Ordering::SeqCst);
            let stub = GETPPID_STUB.lock().unwrap_or_else(|e| e.into_inner()).clone();
            match stub {
                Some(stub) => {
                    let scope = stub.enter();
                    crate::call_previous!(scope, GetppidFn)
                }
                None => -1,
            }
        }

        #[inline(never)]
        fn call_getppid() -> libc::pid_t {
            unsafe { libc::getppid() }
        }

        #[test]
        fn hooks_getppid_in_the_test_executable() {
            let _g = crate::lock_hook_tests();
            let expected = call_getppid();
            let exe = std::fs::read_link("/proc/self/exe")
                .unwrap()
                .to_string_lossy()
                .into_owned();

            let interceptor = Interceptor::new(Arc::new(LoaderModules), Arc::new(ProtectingWriter::new()));
            let stub = interceptor
                .hook(
                    "getppid",
                    getppid_proxy as *const c_void,
                    CallerFilter::new(move |path| path == exe),
                    &HashSet::new(),
                )
                .unwrap();
            *GETPPID_STUB.lock().unwrap() = Some(stub.clone());

            let bindings = stub.bindings();
            assert!(!bindings.is_empty(), "report: {:?}", stub.report());

            let hits = HITS.load(Ordering::SeqCst);
            assert_eq!(call_getppid(), expected);
            assert!(HITS.load(Ordering::SeqCst) > hits);

            let report = interceptor.unhook(&stub).unwrap();
            assert_eq!(report.restored, bindings.len());
            for binding in &bindings {
                assert_eq!(unsafe { read_slot(binding.slot) }, binding.original);
            }

            let hits = HITS.load(Ordering::SeqCst);
            assert_eq!(call_getppid(), expected);
            assert_eq!(HITS.load(Ordering::SeqCst), hits);
        }
    }
}
