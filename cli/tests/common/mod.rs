//! Common test utilities for integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::sync::OnceLock;

/// Path to the built `threadhook` binary.
pub fn threadhook_bin() -> &'static str {
    env!("CARGO_BIN_EXE_threadhook")
}

/// Run `threadhook` with `args`, without inheriting a preloaded agent.
pub fn run_threadhook(args: &[&str]) -> Output {
    Command::new(threadhook_bin())
        .args(args)
        .env_remove("LD_PRELOAD")
        .env_remove("THREADHOOK_AGENT_LIB")
        .output()
        .expect("failed to run threadhook")
}

pub fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

pub fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

fn target_dir() -> PathBuf {
    let tmp = PathBuf::from(env!("CARGO_TARGET_TMPDIR"));
    tmp.parent().map(Path::to_path_buf).unwrap_or(tmp)
}

/// The agent library from this build, if one has been built.
pub fn agent_library() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os("THREADHOOK_AGENT_LIB") {
        return Some(path.into());
    }
    let target = target_dir();
    ["debug", "release"]
        .iter()
        .map(|profile| target.join(profile).join("libthreadhook_agent.so"))
        .find(|lib| lib.exists())
}

/// Build the native fixtures (runs `make` at most once per test binary).
/// `None` when no C toolchain is available.
pub fn build_fixtures() -> Option<PathBuf> {
    static BUILT: OnceLock<Option<PathBuf>> = OnceLock::new();
    BUILT
        .get_or_init(|| {
            let source = Path::new(env!("CARGO_MANIFEST_DIR")).join("../tests/fixtures");
            let out = Path::new(env!("CARGO_TARGET_TMPDIR")).join("fixtures");
            let status = Command::new("make")
                .arg("-C")
                .arg(&source)
                .arg(format!("OUT={}", out.display()))
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
            match status {
                Ok(s) if s.success() => Some(out),
                _ => None,
            }
        })
        .clone()
}

/// Fixture directory and agent library, or `None` (with a note) when either
/// is missing and the test should be skipped.
pub fn setup() -> Option<(PathBuf, PathBuf)> {
    let Some(fixtures) = build_fixtures() else {
        eprintln!("skipping: cannot build native fixtures (make/cc unavailable)");
        return None;
    };
    let Some(agent) = agent_library() else {
        eprintln!("skipping: libthreadhook_agent.so has not been built");
        return None;
    };
    Some((fixtures, agent))
}

/// `threadhook run --agent <agent> <flags> -- <program>` with a clean
/// logging and agent environment.
pub fn run_under_agent(agent: &Path, flags: &[&str], program: &Path) -> Output {
    let mut cmd = Command::new(threadhook_bin());
    cmd.arg("run").arg("--agent").arg(agent).args(flags).arg("--").arg(program);
    for var in [
        "LD_PRELOAD",
        "RUST_LOG",
        "THREADHOOK_AGENT_LIB",
        "THREADHOOK_AUTO",
        "THREADHOOK_EXCLUDE",
        "THREADHOOK_MAX_FRAMES",
        "THREADHOOK_FOLLOW_DLOPEN",
    ] {
        cmd.env_remove(var);
    }
    cmd.output().expect("failed to run threadhook")
}
