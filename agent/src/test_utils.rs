//! Shared test utilities for the agent crate.

use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::{Mutex, MutexGuard, OnceLock};

/// Serialise tests that install proxies through the process-wide interceptor.
pub fn lock_hook_tests() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(())).lock().unwrap_or_else(|e| e.into_inner())
}

/// Build the native fixtures under `tests/fixtures` (runs `make` at most once
/// per test binary). `None` when no C toolchain is available.
pub fn build_fixtures() -> Option<PathBuf> {
    static BUILT: OnceLock<Option<PathBuf>> = OnceLock::new();
    BUILT
        .get_or_init(|| {
            let source = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
                .parent()?
                .join("tests/fixtures");
            let out = std::env::temp_dir().join(format!("threadhook-agent-fixtures-{}", std::process::id()));
            let status = Command::new("make")
                .arg("-C")
                .arg(&source)
                .arg(format!("OUT={}", out.display()))
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
            match status {
                Ok(s) if s.success() => Some(out),
                _ => {
                    eprintln!("skipping: cannot build native fixtures (make/cc unavailable)");
                    None
                }
            }
        })
        .clone()
}
