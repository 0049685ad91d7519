//! Per-module symbol resolution over import-style tables.
//!
//! A module may carry several tables that reference external symbols (PLT
//! jump slots, GLOB_DAT words, absolute-word relocations). A resolver walks
//! all of them and reports every slot bound to the requested name. An empty
//! result is the common case and not an error.

mod elf;
mod import;

pub use elf::{Dyn, ElfResolver, ElfTables, Rel, Rela, RelocEntry};
pub use import::ImportTable;

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::types::HookError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableFormat {
    /// ELF relocations with explicit addend.
    ElfRela,
    /// ELF relocations with implicit addend.
    ElfRel,
    /// Pre-resolved pointer table registered by the host.
    ImportTable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    JumpSlot,
    GlobalData,
    Absolute,
    Import,
}

/// One storage slot holding a resolved function pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableEntry {
    pub slot: usize,
    pub value: usize,
    pub kind: TableKind,
}

pub trait SymbolResolver: Send + Sync {
    fn format(&self) -> TableFormat;

    /// All slots in this module's tables that refer to `symbol`.
    fn find_entries(&self, symbol: &str) -> Result<Vec<TableEntry>, HookError>;

    fn find_entry(&self, symbol: &str) -> Result<Option<TableEntry>, HookError> {
        Ok(self.find_entries(symbol)?.into_iter().next())
    }
}

/// Atomically read a pointer-sized slot.
///
/// # Safety
/// `slot` must be a readable, pointer-aligned address.
#[inline]
pub unsafe fn read_slot(slot: usize) -> usize {
    (*(slot as *const AtomicUsize)).load(Ordering::Acquire)
}
