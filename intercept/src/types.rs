use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::resolver::SymbolResolver;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HookError {
    /// The module does not reference the symbol. Installers treat this as a skip.
    #[error("symbol `{0}` is not referenced")]
    SymbolNotFound(String),

    #[error("module {0} was unloaded")]
    ModuleVanished(String),

    #[error("cannot make slot {addr:#x} writable: {reason}")]
    RemapFailed { addr: usize, reason: String },

    #[error("`{symbol}` is already hooked with proxy {proxy:#x}")]
    AlreadyHooked { symbol: String, proxy: usize },

    #[error("stub was already unhooked")]
    DoubleUnhook,

    #[error("hook chain for `{symbol}` is corrupted: {reason}")]
    ChainCorruption { symbol: String, reason: String },

    #[error("invalid symbol name {0:?}")]
    InvalidSymbol(String),

    #[error("proxy address is null")]
    NullProxy,

    #[error("malformed resolution table in {module}: {reason}")]
    MalformedTable { module: String, reason: String },

    #[error("import-table hooking is not supported on this platform")]
    Unsupported,
}

/// A module as seen by one enumeration of the loader's live list.
#[derive(Clone)]
pub struct ModuleInfo {
    pub name: String,
    pub path: String,
    pub base_address: usize,
    pub end_address: usize,
    /// Resolution tables of the module, with the resolver variant chosen at registration.
    pub tables: Arc<dyn SymbolResolver>,
}

impl ModuleInfo {
    pub fn new(path: impl Into<String>, base_address: usize, end_address: usize, tables: Arc<dyn SymbolResolver>) -> Self {
        let path = path.into();
        let name = if path.is_empty() {
            String::from("[unknown]")
        } else {
            basename(&path).to_string()
        };
        Self {
            name,
            path,
            base_address,
            end_address,
            tables,
        }
    }

    pub fn size(&self) -> usize {
        self.end_address.saturating_sub(self.base_address)
    }

    pub fn contains(&self, address: usize) -> bool {
        address >= self.base_address && address < self.end_address
    }

    /// Exact path or basename match, used for exclusion lists.
    pub fn matches_name(&self, name: &str) -> bool {
        self.path == name || self.name == name
    }
}

impl fmt::Debug for ModuleInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleInfo")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("base_address", &format_args!("{:#x}", self.base_address))
            .field("end_address", &format_args!("{:#x}", self.end_address))
            .field("format", &self.tables.format())
            .finish()
    }
}

/// Weak reference to a module: valid only while the registry still reports
/// the same generation for `(path, base_address)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModuleHandle {
    pub path: String,
    pub base_address: usize,
    pub generation: u64,
}

pub(crate) fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
