//! threadhook agent: logs who creates threads.
//!
//! This library is compiled as a cdylib and loaded into the target process
//! via LD_PRELOAD, or with `dlopen` by a host that calls the exported
//! functions below. When `THREADHOOK_AUTO` is set the `pthread_create` proxy
//! is installed from the library constructor, before `main` runs.

pub mod config;
pub mod hooks;
pub mod stack;

#[cfg(test)]
mod test_utils;

pub use config::AgentConfig;
pub use stack::StackFrame;

use log::{error, info};
use threadhook_intercept::Interceptor;

/// The caller-stack log is the agent's output, so `info` is on unless
/// `RUST_LOG` says otherwise. A logger the host installed first wins.
fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).try_init();
}

/// Agent entry point called when the library is loaded.
#[unsafe(no_mangle)]
pub extern "C" fn threadhook_agent_init() -> i32 {
    init_logging();

    let config = AgentConfig::from_env();
    if !config.auto {
        return 0;
    }
    match hooks::hook(&config) {
        Ok(_) => 0,
        Err(e) => {
            error!("threadhook: {e:#}");
            -1
        }
    }
}

/// Install the `pthread_create` proxy with settings from the environment.
/// Returns `false` when it was already installed or installing failed.
#[unsafe(no_mangle)]
pub extern "C" fn threadhook_hook() -> bool {
    init_logging();
    match hooks::hook(&AgentConfig::from_env()) {
        Ok(installed) => installed,
        Err(e) => {
            error!("threadhook: {e:#}");
            false
        }
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn threadhook_unhook() -> bool {
    match hooks::unhook() {
        Ok(removed) => removed,
        Err(e) => {
            error!("threadhook: {e:#}");
            false
        }
    }
}

/// Hook modules loaded since install. Returns the number of slots bound.
#[unsafe(no_mangle)]
pub extern "C" fn threadhook_refresh() -> usize {
    hooks::refresh()
}

#[unsafe(no_mangle)]
pub extern "C" fn threadhook_is_hooked() -> bool {
    hooks::is_hooked()
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
extern "C" fn agent_fini() {
    let _guard = hooks::HookSuppressGuard::new();
    if let Err(e) = hooks::unhook() {
        error!("threadhook: {e:#}");
    }
    let removed = Interceptor::obtain().unhook_all();
    if removed > 0 {
        info!("threadhook: removed {removed} hook(s) on unload");
    }
}

/// Constructor attribute for automatic initialization on library load.
#[cfg(all(target_os = "linux", not(test)))]
#[unsafe(link_section = ".init_array")]
#[used]
static INIT: extern "C" fn() = {
    extern "C" fn init() {
        threadhook_agent_init();
    }
    init
};

/// Destructor: put every slot back before the proxies' code is unmapped.
#[cfg(all(target_os = "linux", not(test)))]
#[unsafe(link_section = ".fini_array")]
#[used]
static FINI: extern "C" fn() = agent_fini;
