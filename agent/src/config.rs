//! Agent settings, read once from the environment at load time.

use std::collections::HashSet;

pub const ENV_AUTO: &str = "THREADHOOK_AUTO";
pub const ENV_EXCLUDE: &str = "THREADHOOK_EXCLUDE";
pub const ENV_MAX_FRAMES: &str = "THREADHOOK_MAX_FRAMES";
pub const ENV_FOLLOW_DLOPEN: &str = "THREADHOOK_FOLLOW_DLOPEN";

pub const DEFAULT_MAX_FRAMES: usize = 32;

/// Caller modules left alone unless `THREADHOOK_EXCLUDE` says otherwise.
/// Thread creation inside these is loader or runtime plumbing.
pub const DEFAULT_EXCLUDE: &[&str] = &[
    "*libc.so*",
    "*libbase.so*",
    "*liblog.so*",
    "*libunwindstack.so*",
    "*libutils.so*",
    "*ld-linux*",
    "*ld-musl*",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    /// Install from the library constructor.
    pub auto: bool,
    /// Glob patterns of caller modules to leave unhooked.
    pub exclude: Vec<String>,
    pub max_frames: usize,
    /// Also hook `dlopen` so later-loaded modules get the proxy. Off by
    /// default: the loader resolves `$ORIGIN` and RUNPATH from the direct
    /// caller of `dlopen`, which then is the agent.
    pub follow_dlopen: bool,
    /// Never rewrite the agent library's own imports.
    pub exclude_self: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            auto: false,
            exclude: DEFAULT_EXCLUDE.iter().map(|s| s.to_string()).collect(),
            max_frames: DEFAULT_MAX_FRAMES,
            follow_dlopen: false,
            exclude_self: true,
        }
    }
}

impl AgentConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(v) = lookup(ENV_AUTO) {
            config.auto = is_truthy(&v);
        }
        if let Some(v) = lookup(ENV_EXCLUDE) {
            config.exclude = v
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = lookup(ENV_MAX_FRAMES) {
            match v.trim().parse::<usize>() {
                Ok(n) => config.max_frames = n,
                Err(_) => log::warn!("ignoring {ENV_MAX_FRAMES}={v:?}: not a number"),
            }
        }
        if let Some(v) = lookup(ENV_FOLLOW_DLOPEN) {
            config.follow_dlopen = is_truthy(&v);
        }
        config
    }

    /// Module names excluded by exact name rather than by pattern.
    pub fn excluded_modules(&self) -> HashSet<String> {
        let mut excluded = HashSet::new();
        if self.exclude_self {
            if let Some(own) = own_module() {
                excluded.insert(own);
            }
        }
        excluded
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(target_os = "linux")]
fn own_module() -> Option<String> {
    threadhook_intercept::module::resolve_address_module(own_module as usize)
}

#[cfg(not(target_os = "linux"))]
fn own_module() -> Option<String> {
    None
}
