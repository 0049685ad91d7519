//! The `pthread_create` and `dlopen` proxies and their installation.

use core::ffi::{c_char, c_int, c_void};
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::RwLock;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use threadhook_intercept::{call_previous, CallerFilter, Interceptor, StackScope, Stub};

use crate::config::AgentConfig;
use crate::stack;

pub const PTHREAD_CREATE: &str = "pthread_create";
pub const DLOPEN: &str = "dlopen";

type StartRoutine = extern "C" fn(*mut c_void) -> *mut c_void;
type PthreadCreateFn = unsafe extern "C" fn(
    *mut libc::pthread_t,
    *const libc::pthread_attr_t,
    Option<StartRoutine>,
    *mut c_void,
) -> c_int;
type DlopenFn = unsafe extern "C" fn(*const c_char, c_int) -> *mut c_void;

static ALREADY_HOOKED: AtomicBool = AtomicBool::new(false);
static MAX_FRAMES: AtomicUsize = AtomicUsize::new(crate::config::DEFAULT_MAX_FRAMES);
static THREADS_SEEN: AtomicUsize = AtomicUsize::new(0);

// Stubs stay here after unhook so calls already inside a proxy can still forward.
static PTHREAD_CREATE_STUB: RwLock<Option<Stub>> = RwLock::new(None);
static DLOPEN_STUB: RwLock<Option<Stub>> = RwLock::new(None);

// Thread-local re-entrancy guard. Work done inside a proxy (stack capture,
// logging, refresh) must not be reported again.
thread_local! {
    static IN_HOOK: Cell<bool> = const { Cell::new(false) };
}

/// Check if we are currently inside a hook callback on this thread.
pub fn is_in_hook() -> bool {
    IN_HOOK.try_with(|h| h.get()).unwrap_or(true)
}

/// RAII guard that suppresses hook callbacks for its lifetime.
/// Nesting-safe: inner guards restore the previous (already-true) state.
pub struct HookSuppressGuard(bool);

impl HookSuppressGuard {
    pub fn new() -> Self {
        let was = is_in_hook();
        let _ = IN_HOOK.try_with(|h| h.set(true));
        Self(was)
    }
}

impl Default for HookSuppressGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for HookSuppressGuard {
    fn drop(&mut self) {
        let was = self.0;
        let _ = IN_HOOK.try_with(|h| h.set(was));
    }
}

pub fn is_hooked() -> bool {
    ALREADY_HOOKED.load(Ordering::Acquire)
}

/// Thread creations reported by the proxy since the process started.
pub fn threads_observed() -> usize {
    THREADS_SEEN.load(Ordering::Relaxed)
}

fn stub_in(slot: &RwLock<Option<Stub>>) -> Option<Stub> {
    slot.read().unwrap_or_else(|e| e.into_inner()).clone()
}

fn store_stub(slot: &RwLock<Option<Stub>>, stub: Stub) {
    *slot.write().unwrap_or_else(|e| e.into_inner()) = Some(stub);
}

/// Scope for a proxy call. Slots are written before the stub is stored, so a
/// call racing the install finds its chain position by address instead.
fn enter(slot: &RwLock<Option<Stub>>, symbol: &str, proxy: usize) -> Option<StackScope> {
    match stub_in(slot) {
        Some(stub) if stub.proxy() == proxy => Some(stub.enter()),
        _ => Interceptor::obtain().enter(symbol, proxy),
    }
}

/// Real implementation of `symbol`, for a proxy reached without a chain.
fn original(symbol: &str) -> usize {
    Interceptor::obtain()
        .registry()
        .resolve_export(symbol)
        .unwrap_or(0)
}

fn routine_address(start: Option<StartRoutine>) -> usize {
    start.map_or(0, |f| f as usize)
}

unsafe extern "C" fn pthread_create_proxy(
    thread: *mut libc::pthread_t,
    attr: *const libc::pthread_attr_t,
    start: Option<StartRoutine>,
    arg: *mut c_void,
) -> c_int {
    let Some(scope) = enter(&PTHREAD_CREATE_STUB, PTHREAD_CREATE, pthread_create_proxy as usize) else {
        let real = original(PTHREAD_CREATE);
        if real == 0 {
            return libc::ENOSYS;
        }
        let real: PthreadCreateFn = core::mem::transmute::<usize, PthreadCreateFn>(real);
        return real(thread, attr, start, arg);
    };

    if scope.is_reentrant() || is_in_hook() {
        return call_previous!(scope, PthreadCreateFn, thread, attr, start, arg);
    }

    let _guard = HookSuppressGuard::new();
    THREADS_SEEN.fetch_add(1, Ordering::Relaxed);

    let frames = stack::capture(MAX_FRAMES.load(Ordering::Relaxed));
    let mut message = format!(
        "pthread_create (start routine {:#x}) called from:",
        routine_address(start)
    );
    for frame in &frames {
        message.push_str("\n    ");
        message.push_str(&frame.display());
    }
    info!("{message}");

    let rc = call_previous!(scope, PthreadCreateFn, thread, attr, start, arg);
    if rc == 0 && !thread.is_null() {
        info!("pthread_create -> {rc}, thread {:#x}", *thread as usize);
    } else {
        info!("pthread_create -> {rc}");
    }
    rc
}

unsafe extern "C" fn dlopen_proxy(filename: *const c_char, flags: c_int) -> *mut c_void {
    let Some(scope) = enter(&DLOPEN_STUB, DLOPEN, dlopen_proxy as usize) else {
        let real = original(DLOPEN);
        if real == 0 {
            return core::ptr::null_mut();
        }
        let real: DlopenFn = core::mem::transmute::<usize, DlopenFn>(real);
        return real(filename, flags);
    };

    let handle = call_previous!(scope, DlopenFn, filename, flags);
    if handle.is_null() || flags & libc::RTLD_NOLOAD != 0 || scope.is_reentrant() || is_in_hook() {
        return handle;
    }

    let _guard = HookSuppressGuard::new();
    let report = Interceptor::obtain().refresh();
    debug!(
        "dlopen: refresh scanned {} module(s), bound {} slot(s)",
        report.scanned, report.bound
    );
    handle
}

/// Install the `pthread_create` proxy (and the `dlopen` follower when
/// configured). Returns `false` when already installed.
pub fn hook(config: &AgentConfig) -> Result<bool> {
    if ALREADY_HOOKED.swap(true, Ordering::AcqRel) {
        info!("{PTHREAD_CREATE} is already hooked");
        return Ok(false);
    }
    let _guard = HookSuppressGuard::new();
    match install(config) {
        Ok(()) => Ok(true),
        Err(e) => {
            ALREADY_HOOKED.store(false, Ordering::Release);
            Err(e)
        }
    }
}

fn install(config: &AgentConfig) -> Result<()> {
    let interceptor = Interceptor::obtain();
    MAX_FRAMES.store(config.max_frames, Ordering::Relaxed);

    let filter = CallerFilter::deny_globs(config.exclude.clone());
    let excluded = config.excluded_modules();
    debug!("excluding {:?} and {:?}", config.exclude, excluded);

    let stub = interceptor
        .hook(PTHREAD_CREATE, pthread_create_proxy as *const c_void, filter.clone(), &excluded)
        .with_context(|| format!("failed to hook {PTHREAD_CREATE}"))?;
    let report = stub.report();
    for failure in &report.failures {
        warn!("{PTHREAD_CREATE}: {}: {}", failure.module, failure.error);
    }
    store_stub(&PTHREAD_CREATE_STUB, stub);

    if config.follow_dlopen {
        match interceptor.hook(DLOPEN, dlopen_proxy as *const c_void, filter, &excluded) {
            Ok(stub) => store_stub(&DLOPEN_STUB, stub),
            Err(e) => warn!("not following dlopen: {e}"),
        }
    }
    Ok(())
}

/// Reverse [`hook`]. Returns `false` when nothing was installed.
pub fn unhook() -> Result<bool> {
    if !ALREADY_HOOKED.load(Ordering::Acquire) {
        return Ok(false);
    }
    let _guard = HookSuppressGuard::new();
    let interceptor = Interceptor::obtain();

    for (symbol, slot) in [(DLOPEN, &DLOPEN_STUB), (PTHREAD_CREATE, &PTHREAD_CREATE_STUB)] {
        let Some(stub) = stub_in(slot) else { continue };
        if !stub.is_installed() {
            continue;
        }
        let report = interceptor
            .unhook(&stub)
            .with_context(|| format!("failed to unhook {symbol}"))?;
        for failure in &report.failures {
            warn!("{symbol}: {}: {}", failure.module, failure.error);
        }
    }

    ALREADY_HOOKED.store(false, Ordering::Release);
    Ok(true)
}

/// Bring modules loaded since install under interception.
pub fn refresh() -> usize {
    let _guard = HookSuppressGuard::new();
    Interceptor::obtain().refresh().bound
}
