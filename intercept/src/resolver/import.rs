use core::sync::atomic::{AtomicUsize, Ordering};

use super::{SymbolResolver, TableEntry, TableFormat, TableKind};
use crate::types::HookError;

/// Fixed array of named pointer slots.
///
/// Slot storage never moves after construction, so slot addresses handed to
/// the installer stay valid for the lifetime of the table.
pub struct ImportTable {
    names: Vec<String>,
    slots: Box<[AtomicUsize]>,
}

impl ImportTable {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, usize)>,
        S: Into<String>,
    {
        let (names, values): (Vec<String>, Vec<usize>) =
            entries.into_iter().map(|(name, value)| (name.into(), value)).unzip();
        let slots = values.into_iter().map(AtomicUsize::new).collect();
        Self { names, slots }
    }

    pub fn empty() -> Self {
        Self::new(core::iter::empty::<(String, usize)>())
    }

    /// Current value of the first slot bound to `symbol`, as a call site would read it.
    pub fn load(&self, symbol: &str) -> Option<usize> {
        self.index_of(symbol).map(|i| self.slots[i].load(Ordering::Acquire))
    }

    pub fn slot_address(&self, symbol: &str) -> Option<usize> {
        self.index_of(symbol).map(|i| &self.slots[i] as *const AtomicUsize as usize)
    }

    fn index_of(&self, symbol: &str) -> Option<usize> {
        self.names.iter().position(|n| n == symbol)
    }
}

impl SymbolResolver for ImportTable {
    fn format(&self) -> TableFormat {
        TableFormat::ImportTable
    }

    fn find_entries(&self, symbol: &str) -> Result<Vec<TableEntry>, HookError> {
        Ok(self
            .names
            .iter()
            .zip(self.slots.iter())
            .filter(|(name, _)| name.as_str() == symbol)
            .map(|(_, slot)| TableEntry {
                slot: slot as *const AtomicUsize as usize,
                value: slot.load(Ordering::Acquire),
                kind: TableKind::Import,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_every_slot_for_a_name() {
        let table = ImportTable::new([("open", 1usize), ("close", 2), ("open", 3)]);
        let entries = table.find_entries("open").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].value, 1);
        assert_eq!(entries[1].value, 3);
        assert_ne!(entries[0].slot, entries[1].slot);
    }

    #[test]
    fn missing_symbol_is_empty_not_error() {
        let table = ImportTable::new([("open", 1usize)]);
        assert!(table.find_entries("read").unwrap().is_empty());
        assert_eq!(table.find_entry("read").unwrap(), None);
        assert_eq!(table.load("read"), None);
    }

    #[test]
    fn slot_address_points_at_live_value() {
        let table = ImportTable::new([("write", 0x1234usize)]);
        let addr = table.slot_address("write").unwrap();
        assert_eq!(unsafe { super::super::read_slot(addr) }, 0x1234);
    }
}
