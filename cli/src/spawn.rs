//! Spawn a process with the agent library preloaded.

use std::ffi::{OsStr, OsString};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use log::debug;

pub const AGENT_LIB_NAME: &str = "libthreadhook_agent.so";
pub const ENV_AGENT_LIB: &str = "THREADHOOK_AGENT_LIB";

pub struct RunOptions {
    pub agent: PathBuf,
    pub exclude: Vec<String>,
    pub max_frames: Option<usize>,
    pub follow_dlopen: bool,
    pub verbose: bool,
}

/// Locate the agent library: an explicit path, `THREADHOOK_AGENT_LIB`, next
/// to this executable, then the development build directories.
pub fn find_agent_library(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return path
            .canonicalize()
            .with_context(|| format!("Agent library not found: {}", path.display()));
    }

    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Some(path) = std::env::var_os(ENV_AGENT_LIB) {
        candidates.push(path.into());
    }
    if let Ok(exe_path) = std::env::current_exe() {
        if let Some(exe_dir) = exe_path.parent() {
            candidates.push(exe_dir.join(AGENT_LIB_NAME));
            // {prefix}/bin/../lib/
            candidates.push(exe_dir.join("..").join("lib").join(AGENT_LIB_NAME));
        }
    }
    candidates.push(format!("./target/release/{AGENT_LIB_NAME}").into());
    candidates.push(format!("./target/debug/{AGENT_LIB_NAME}").into());

    for candidate in &candidates {
        if candidate.exists() {
            // Absolute path, so the loader finds it whatever the child's cwd.
            return candidate
                .canonicalize()
                .with_context(|| format!("Failed to canonicalize path: {}", candidate.display()));
        }
    }

    anyhow::bail!(
        "Agent library not found. Build with 'cargo build --release' or set {ENV_AGENT_LIB}"
    )
}

/// `LD_PRELOAD` with `agent` in front of whatever was there.
pub fn preload_value(agent: &Path, existing: Option<&OsStr>) -> OsString {
    let mut value = OsString::from(agent.as_os_str());
    if let Some(existing) = existing.filter(|e| !e.is_empty()) {
        value.push(":");
        value.push(existing);
    }
    value
}

pub fn build_command(options: &RunOptions, program: &[String]) -> Result<Command> {
    let (name, args) = program.split_first().context("No program given")?;

    let mut cmd = Command::new(name);
    cmd.args(args);
    cmd.env(
        "LD_PRELOAD",
        preload_value(&options.agent, std::env::var_os("LD_PRELOAD").as_deref()),
    );
    cmd.env("THREADHOOK_AUTO", "1");
    if !options.exclude.is_empty() {
        cmd.env("THREADHOOK_EXCLUDE", options.exclude.join(","));
    }
    if let Some(frames) = options.max_frames {
        cmd.env("THREADHOOK_MAX_FRAMES", frames.to_string());
    }
    if options.follow_dlopen {
        cmd.env("THREADHOOK_FOLLOW_DLOPEN", "1");
    } else {
        // An inherited setting must not turn it back on.
        cmd.env_remove("THREADHOOK_FOLLOW_DLOPEN");
    }
    if options.verbose && std::env::var_os("RUST_LOG").is_none() {
        cmd.env("RUST_LOG", "debug");
    }
    Ok(cmd)
}

/// Run `program` to completion and return the exit code to forward.
/// A child killed by a signal maps to 128 + the signal number.
pub fn run(options: &RunOptions, program: &[String]) -> Result<i32> {
    let mut cmd = build_command(options, program)?;
    debug!("spawning {:?} with {}", program, options.agent.display());

    let status = cmd
        .status()
        .with_context(|| format!("Failed to spawn {}", program[0]))?;
    Ok(match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => 1,
    })
}
