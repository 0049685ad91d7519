use core::ffi::c_char;
use core::marker::PhantomData;
use std::ffi::CStr;
use std::sync::Arc;

use super::{read_slot, SymbolResolver, TableEntry, TableFormat, TableKind};
use crate::types::HookError;

// ELF layouts for the running process' word size.
#[cfg(target_pointer_width = "64")]
mod raw {
    pub type Word = u64;
    pub type Sword = i64;

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct Sym {
        pub st_name: u32,
        pub st_info: u8,
        pub st_other: u8,
        pub st_shndx: u16,
        pub st_value: u64,
        pub st_size: u64,
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct Dyn {
        pub d_tag: i64,
        pub d_val: u64,
    }

    #[inline]
    pub fn r_sym(info: Word) -> u32 {
        (info >> 32) as u32
    }

    #[inline]
    pub fn r_type(info: Word) -> u32 {
        (info & 0xffff_ffff) as u32
    }
}

#[cfg(target_pointer_width = "32")]
mod raw {
    pub type Word = u32;
    pub type Sword = i32;

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct Sym {
        pub st_name: u32,
        pub st_value: u32,
        pub st_size: u32,
        pub st_info: u8,
        pub st_other: u8,
        pub st_shndx: u16,
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct Dyn {
        pub d_tag: i32,
        pub d_val: u32,
    }

    #[inline]
    pub fn r_sym(info: Word) -> u32 {
        info >> 8
    }

    #[inline]
    pub fn r_type(info: Word) -> u32 {
        info & 0xff
    }
}

pub use raw::Dyn;

const DT_NULL: i64 = 0;
const DT_PLTRELSZ: i64 = 2;
const DT_STRTAB: i64 = 5;
const DT_SYMTAB: i64 = 6;
const DT_RELA: i64 = 7;
const DT_RELASZ: i64 = 8;
const DT_STRSZ: i64 = 10;
const DT_REL: i64 = 17;
const DT_RELSZ: i64 = 18;
const DT_PLTREL: i64 = 20;
const DT_JMPREL: i64 = 23;

// A corrupt dynamic section must not send us walking off into unmapped memory.
const MAX_DYNAMIC_ENTRIES: usize = 4096;

fn classify(r_type: u32) -> Option<TableKind> {
    #[cfg(target_arch = "x86_64")]
    let kind = match r_type {
        7 => Some(TableKind::JumpSlot),
        6 => Some(TableKind::GlobalData),
        1 => Some(TableKind::Absolute),
        _ => None,
    };
    #[cfg(target_arch = "aarch64")]
    let kind = match r_type {
        1026 => Some(TableKind::JumpSlot),
        1025 => Some(TableKind::GlobalData),
        257 => Some(TableKind::Absolute),
        _ => None,
    };
    #[cfg(target_arch = "x86")]
    let kind = match r_type {
        7 => Some(TableKind::JumpSlot),
        6 => Some(TableKind::GlobalData),
        1 => Some(TableKind::Absolute),
        _ => None,
    };
    #[cfg(target_arch = "arm")]
    let kind = match r_type {
        22 => Some(TableKind::JumpSlot),
        21 => Some(TableKind::GlobalData),
        2 => Some(TableKind::Absolute),
        _ => None,
    };
    #[cfg(target_arch = "riscv64")]
    let kind = match r_type {
        5 => Some(TableKind::JumpSlot),
        2 => Some(TableKind::Absolute),
        _ => None,
    };
    #[cfg(not(any(
        target_arch = "x86_64",
        target_arch = "aarch64",
        target_arch = "x86",
        target_arch = "arm",
        target_arch = "riscv64"
    )))]
    let kind = {
        let _ = r_type;
        None
    };
    kind
}

/// A relocation record layout. Implemented by [`Rela`] and [`Rel`].
pub trait RelocEntry: Copy + Send + Sync + 'static {
    const FORMAT: TableFormat;

    fn offset(&self) -> usize;
    fn info(&self) -> raw::Word;

    /// Explicit addend, zero for formats that keep it in the slot.
    fn addend(&self) -> isize {
        0
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Rela {
    pub r_offset: raw::Word,
    pub r_info: raw::Word,
    pub r_addend: raw::Sword,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Rel {
    pub r_offset: raw::Word,
    pub r_info: raw::Word,
}

impl RelocEntry for Rela {
    const FORMAT: TableFormat = TableFormat::ElfRela;

    fn offset(&self) -> usize {
        self.r_offset as usize
    }

    fn info(&self) -> raw::Word {
        self.r_info
    }

    fn addend(&self) -> isize {
        self.r_addend as isize
    }
}

impl RelocEntry for Rel {
    const FORMAT: TableFormat = TableFormat::ElfRel;

    fn offset(&self) -> usize {
        self.r_offset as usize
    }

    fn info(&self) -> raw::Word {
        self.r_info
    }
}

/// Absolute addresses of the tables found in a module's `PT_DYNAMIC`.
#[derive(Debug, Clone, Default)]
pub struct ElfTables {
    pub module: String,
    pub bias: usize,
    pub start: usize,
    pub end: usize,
    pub symtab: usize,
    pub strtab: usize,
    pub strsz: usize,
    pub jmprel: usize,
    pub jmprel_size: usize,
    pub reldyn: usize,
    pub reldyn_size: usize,
}

impl ElfTables {
    /// Walk a loaded module's dynamic section and pick the resolver variant
    /// matching its relocation format.
    ///
    /// # Safety
    /// `dynamic` must point at the module's mapped `PT_DYNAMIC` segment.
    pub unsafe fn resolver_from_dynamic(
        module: &str,
        bias: usize,
        start: usize,
        end: usize,
        dynamic: *const Dyn,
    ) -> Arc<dyn SymbolResolver> {
        let mut symtab = 0u64;
        let mut strtab = 0u64;
        let mut strsz = 0u64;
        let mut jmprel = 0u64;
        let mut pltrelsz = 0u64;
        let mut pltrel = 0i64;
        let mut rela = 0u64;
        let mut relasz = 0u64;
        let mut rel = 0u64;
        let mut relsz = 0u64;

        for i in 0..MAX_DYNAMIC_ENTRIES {
            let entry = &*dynamic.add(i);
            let tag = entry.d_tag as i64;
            let val = entry.d_val as u64;
            match tag {
                DT_NULL => break,
                DT_SYMTAB => symtab = val,
                DT_STRTAB => strtab = val,
                DT_STRSZ => strsz = val,
                DT_JMPREL => jmprel = val,
                DT_PLTRELSZ => pltrelsz = val,
                DT_PLTREL => pltrel = val as i64,
                DT_RELA => rela = val,
                DT_RELASZ => relasz = val,
                DT_REL => rel = val,
                DT_RELSZ => relsz = val,
                _ => {}
            }
        }

        // glibc rewrites d_ptr entries to absolute addresses; other loaders
        // leave them as link-time offsets.
        let bias_u64 = bias as u64;
        let adjusted = symtab > bias_u64 || strtab > bias_u64;
        let resolve = |val: u64| -> usize {
            if val == 0 {
                0
            } else if adjusted {
                val as usize
            } else {
                (bias_u64 + val) as usize
            }
        };

        let use_rela = match pltrel {
            DT_RELA => true,
            DT_REL => false,
            _ => rela != 0 || rel == 0,
        };
        let (reldyn, reldyn_size) = if use_rela { (rela, relasz) } else { (rel, relsz) };

        let tables = ElfTables {
            module: module.to_string(),
            bias,
            start,
            end,
            symtab: resolve(symtab),
            strtab: resolve(strtab),
            strsz: strsz as usize,
            jmprel: resolve(jmprel),
            jmprel_size: pltrelsz as usize,
            reldyn: resolve(reldyn),
            reldyn_size: reldyn_size as usize,
        };

        if use_rela {
            Arc::new(ElfResolver::<Rela>::new(tables))
        } else {
            Arc::new(ElfResolver::<Rel>::new(tables))
        }
    }
}

/// Resolver over the PLT and dynamic relocation tables of one ELF module.
pub struct ElfResolver<R> {
    tables: ElfTables,
    _entry: PhantomData<R>,
}

impl<R: RelocEntry> ElfResolver<R> {
    pub fn new(tables: ElfTables) -> Self {
        Self {
            tables,
            _entry: PhantomData,
        }
    }

    unsafe fn name_matches(&self, index: u32, wanted: &str) -> bool {
        let sym = &*(self.tables.symtab as *const raw::Sym).add(index as usize);
        let off = sym.st_name as usize;
        if self.tables.strsz != 0 && off >= self.tables.strsz {
            return false;
        }
        let name = CStr::from_ptr((self.tables.strtab + off) as *const c_char);
        name.to_bytes() == wanted.as_bytes()
    }

    fn malformed(&self, reason: String) -> HookError {
        HookError::MalformedTable {
            module: self.tables.module.clone(),
            reason,
        }
    }
}

impl<R: RelocEntry> SymbolResolver for ElfResolver<R> {
    fn format(&self) -> TableFormat {
        R::FORMAT
    }

    fn find_entries(&self, symbol: &str) -> Result<Vec<TableEntry>, HookError> {
        let t = &self.tables;
        if t.symtab == 0 || t.strtab == 0 {
            return Ok(Vec::new());
        }

        let mut entries: Vec<TableEntry> = Vec::new();
        for (table, size) in [(t.jmprel, t.jmprel_size), (t.reldyn, t.reldyn_size)] {
            if table == 0 || size == 0 {
                continue;
            }
            if table % core::mem::align_of::<R>() != 0 {
                return Err(self.malformed(format!("misaligned relocation table at {table:#x}")));
            }
            let count = size / core::mem::size_of::<R>();
            let relocs = unsafe { core::slice::from_raw_parts(table as *const R, count) };

            for reloc in relocs {
                let info = reloc.info();
                let Some(kind) = classify(raw::r_type(info)) else {
                    continue;
                };
                // A word pointing into the middle of the symbol is not a call target.
                if kind == TableKind::Absolute && reloc.addend() != 0 {
                    continue;
                }
                let index = raw::r_sym(info);
                if index == 0 || !unsafe { self.name_matches(index, symbol) } {
                    continue;
                }

                let slot = t.bias.wrapping_add(reloc.offset());
                if slot < t.start || slot >= t.end {
                    return Err(self.malformed(format!("slot {slot:#x} outside module")));
                }
                if slot % core::mem::align_of::<usize>() != 0 {
                    return Err(self.malformed(format!("misaligned slot {slot:#x}")));
                }
                if entries.iter().any(|e| e.slot == slot) {
                    continue;
                }
                let value = unsafe { read_slot(slot) };
                entries.push(TableEntry { slot, value, kind });
            }
        }
        Ok(entries)
    }
}
