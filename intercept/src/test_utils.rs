//! Fixtures shared by the interceptor tests: synthetic modules whose import
//! tables reference one target function, and proxies that forward through
//! their stubs.

use core::sync::atomic::{AtomicUsize, Ordering};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::interceptor::{Interceptor, Stub};
use crate::module::StaticModules;
use crate::patcher::{AtomicWriter, SlotWriter};
use crate::resolver::ImportTable;
use crate::scope::StackScope;
use crate::types::{HookError, ModuleInfo};

pub(crate) type IntFn = extern "C" fn(i32) -> i32;

pub(crate) const SYMBOL: &str = "threadhook_test_target";

thread_local! {
    static TRACING: Cell<bool> = const { Cell::new(false) };
    static TRACE: RefCell<Vec<&'static str>> = const { RefCell::new(Vec::new()) };
}

/// Record calls made on this thread until [`take_trace`].
pub(crate) fn start_trace() {
    TRACE.with(|t| t.borrow_mut().clear());
    TRACING.with(|t| t.set(true));
}

pub(crate) fn take_trace() -> Vec<&'static str> {
    TRACING.with(|t| t.set(false));
    TRACE.with(|t| core::mem::take(&mut *t.borrow_mut()))
}

fn trace(name: &'static str) {
    if TRACING.with(|t| t.get()) {
        TRACE.with(|t| t.borrow_mut().push(name));
    }
}

static STUBS: Mutex<Option<HashMap<usize, Stub>>> = Mutex::new(None);

/// Make `stub` the one its proxy forwards through.
pub(crate) fn register(stub: &Stub) {
    STUBS
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .get_or_insert_with(HashMap::new)
        .insert(stub.proxy(), stub.clone());
}

fn scope_for(proxy: usize) -> Option<StackScope> {
    let stub = STUBS
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .as_ref()
        .and_then(|m| m.get(&proxy).cloned())?;
    Some(stub.enter())
}

pub(crate) extern "C" fn target(x: i32) -> i32 {
    trace("target");
    x + 1
}

pub(crate) extern "C" fn proxy_double(x: i32) -> i32 {
    trace("double");
    match scope_for(proxy_double as usize) {
        Some(scope) => 2 * crate::call_previous!(scope, IntFn, x),
        None => 2 * target(x),
    }
}

pub(crate) extern "C" fn proxy_add100(x: i32) -> i32 {
    trace("add100");
    match scope_for(proxy_add100 as usize) {
        Some(scope) => crate::call_previous!(scope, IntFn, x) + 100,
        None => target(x) + 100,
    }
}

/// Slot writer that refuses chosen slots.
#[derive(Default)]
pub(crate) struct FailingWriter {
    failing: Mutex<HashSet<usize>>,
}

impl FailingWriter {
    pub fn fail_at(&self, slot: usize) {
        self.failing.lock().unwrap_or_else(|e| e.into_inner()).insert(slot);
    }
}

impl SlotWriter for FailingWriter {
    unsafe fn write(&self, slot: usize, value: usize) -> Result<(), HookError> {
        if self.failing.lock().unwrap_or_else(|e| e.into_inner()).contains(&slot) {
            return Err(HookError::RemapFailed {
                addr: slot,
                reason: "EACCES".to_string(),
            });
        }
        AtomicWriter.write(slot, value)
    }
}

/// An interceptor over synthetic modules under `/system/lib`, each importing
/// [`SYMBOL`] next to an unrelated entry.
pub(crate) struct Fixture {
    pub interceptor: Interceptor,
    pub modules: Arc<StaticModules>,
    tables: HashMap<String, (usize, Arc<ImportTable>)>,
    // Tables of reloaded modules stay allocated so stale slots never dangle.
    retired: Vec<Arc<ImportTable>>,
}

static NEXT_BASE: AtomicUsize = AtomicUsize::new(0x10_0000);

impl Fixture {
    pub fn new(names: &[&str]) -> Self {
        Self::with_writer(names, Arc::new(AtomicWriter))
    }

    pub fn with_writer(names: &[&str], writer: Arc<dyn SlotWriter>) -> Self {
        let modules = Arc::new(StaticModules::new());
        modules.export(SYMBOL, target as usize);
        let mut fixture = Self {
            interceptor: Interceptor::new(modules.clone(), writer),
            modules,
            tables: HashMap::new(),
            retired: Vec::new(),
        };
        for name in names {
            fixture.load(name);
        }
        fixture
    }

    pub fn load(&mut self, name: &str) {
        let base = NEXT_BASE.fetch_add(0x1_0000, Ordering::Relaxed);
        self.load_at(name, base);
    }

    /// Load `name` again at the address it had before.
    pub fn reload(&mut self, name: &str) {
        let base = self.tables.get(name).map_or(0x10_0000, |(base, _)| *base);
        self.load_at(name, base);
    }

    fn load_at(&mut self, name: &str, base: usize) {
        let table = Arc::new(ImportTable::new([("unrelated", 0x1234usize), (SYMBOL, target as usize)]));
        self.modules.load(ModuleInfo::new(
            format!("/system/lib/{name}"),
            base,
            base + 0x1_0000,
            table.clone(),
        ));
        if let Some((_, old)) = self.tables.insert(name.to_string(), (base, table)) {
            self.retired.push(old);
        }
    }

    fn table(&self, name: &str) -> &ImportTable {
        &self.tables[name].1
    }

    pub fn slot_address(&self, name: &str) -> usize {
        self.table(name).slot_address(SYMBOL).unwrap_or(0)
    }

    /// Current value of `name`'s slot for [`SYMBOL`].
    pub fn slot(&self, name: &str) -> usize {
        self.table(name).load(SYMBOL).unwrap_or(0)
    }

    /// Call [`SYMBOL`] the way code in `name` would: through its slot.
    pub fn call(&self, name: &str, x: i32) -> i32 {
        let f: IntFn = unsafe { core::mem::transmute::<usize, IntFn>(self.slot(name)) };
        f(x)
    }
}
