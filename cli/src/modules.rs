//! `threadhook modules`: what the interceptor would see in this process.

use anyhow::Result;
use threadhook_intercept::{HookError, Interceptor, ModuleRegistry, TableFormat};

pub struct ModuleRow {
    pub path: String,
    pub base: usize,
    pub end: usize,
    pub format: TableFormat,
    /// Slots referencing the queried symbol.
    pub slots: Option<usize>,
    /// Why this module's tables could not be searched.
    pub error: Option<HookError>,
}

pub fn collect(symbol: Option<&str>) -> Vec<ModuleRow> {
    collect_from(Interceptor::obtain().registry(), symbol)
}

/// One row per module. A module whose tables cannot be read keeps its row
/// with the error instead of ending the listing.
pub fn collect_from(registry: &ModuleRegistry, symbol: Option<&str>) -> Vec<ModuleRow> {
    registry
        .list_modules()
        .into_iter()
        .map(|module| {
            let info = module.info;
            let (slots, error) = match symbol.map(|s| info.tables.find_entries(s)) {
                Some(Ok(entries)) => (Some(entries.len()), None),
                Some(Err(e)) => (None, Some(e)),
                None => (None, None),
            };
            ModuleRow {
                format: info.tables.format(),
                base: info.base_address,
                end: info.end_address,
                path: info.path,
                slots,
                error,
            }
        })
        .collect()
}

fn format_label(format: TableFormat) -> &'static str {
    match format {
        TableFormat::ElfRela => "rela",
        TableFormat::ElfRel => "rel",
        TableFormat::ImportTable => "import",
    }
}

pub fn print(symbol: Option<&str>) -> Result<()> {
    let rows = collect(symbol);
    for row in &rows {
        let format = format_label(row.format);
        match (row.slots, &row.error) {
            (_, Some(error)) => println!(
                "{:#014x}-{:#014x} {:<6} err  {} ({error})",
                row.base, row.end, format, row.path
            ),
            (Some(slots), None) => println!(
                "{:#014x}-{:#014x} {:<6} {:>3}  {}",
                row.base, row.end, format, slots, row.path
            ),
            (None, None) => println!("{:#014x}-{:#014x} {:<6} {}", row.base, row.end, format, row.path),
        }
    }

    if let Some(symbol) = symbol {
        let total: usize = rows.iter().filter_map(|r| r.slots).sum();
        let referencing = rows.iter().filter(|r| r.slots.is_some_and(|n| n > 0)).count();
        let unreadable = rows.iter().filter(|r| r.error.is_some()).count();
        match Interceptor::obtain().registry().resolve_export(symbol) {
            Some(addr) => println!("{symbol} = {addr:#x}: {total} slot(s) in {referencing} module(s)"),
            None => println!("{symbol}: no global definition, {total} slot(s) in {referencing} module(s)"),
        }
        if unreadable > 0 {
            println!("{unreadable} module(s) could not be searched");
        }
    }
    Ok(())
}
