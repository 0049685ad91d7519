use core::ffi::c_void;
use std::ffi::{CStr, CString};
use std::sync::{Arc, OnceLock};

use log::trace;

use super::{ModulePin, ModuleSource};
use crate::resolver::{Dyn, ElfTables, ImportTable, SymbolResolver};
use crate::types::{basename, HookError, ModuleInfo};

/// Modules as reported by the dynamic loader.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoaderModules;

impl ModuleSource for LoaderModules {
    fn modules(&self) -> Vec<ModuleInfo> {
        enumerate_modules()
    }

    fn resolve_export(&self, symbol: &str) -> Option<usize> {
        find_global_export_by_name(symbol).ok()
    }

    fn pin(&self, module: &ModuleInfo) -> Option<ModulePin> {
        pin_module(module)
    }
}

fn main_executable_path() -> &'static str {
    static PATH: OnceLock<String> = OnceLock::new();
    PATH.get_or_init(|| match std::fs::read_link("/proc/self/exe") {
        Ok(p) => p.to_string_lossy().into_owned(),
        Err(_) => String::new(),
    })
}

fn is_vdso(path: &str) -> bool {
    let name = basename(path);
    name.starts_with("linux-vdso") || name.starts_with("linux-gate")
}

/// Enumerate all loaded shared objects via `dl_iterate_phdr`.
pub fn enumerate_modules() -> Vec<ModuleInfo> {
    struct Ctx {
        modules: Vec<ModuleInfo>,
    }

    unsafe extern "C" fn callback(
        info: *mut libc::dl_phdr_info,
        _size: libc::size_t,
        data: *mut c_void,
    ) -> libc::c_int {
        let ctx = &mut *(data as *mut Ctx);
        let info = &*info;

        let path = if info.dlpi_name.is_null() || *info.dlpi_name == 0 {
            // Empty name means the main executable.
            main_executable_path().to_string()
        } else {
            CStr::from_ptr(info.dlpi_name)
                .to_string_lossy()
                .into_owned()
        };

        let bias = info.dlpi_addr as usize;
        let mut min_addr: Option<usize> = None;
        let mut max_addr: usize = 0;
        let mut dynamic: *const Dyn = core::ptr::null();
        let phdrs = core::slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize);
        for phdr in phdrs {
            if phdr.p_type == libc::PT_LOAD && phdr.p_memsz > 0 {
                let start = phdr.p_vaddr as usize;
                let end = start + phdr.p_memsz as usize;
                min_addr = Some(min_addr.map_or(start, |m| m.min(start)));
                max_addr = max_addr.max(end);
            } else if phdr.p_type == libc::PT_DYNAMIC {
                dynamic = (bias + phdr.p_vaddr as usize) as *const Dyn;
            }
        }

        let start = bias + min_addr.unwrap_or(0);
        let end = match min_addr {
            Some(_) => bias + max_addr,
            None => start,
        };

        let tables: Arc<dyn SymbolResolver> = if dynamic.is_null() {
            Arc::new(ImportTable::empty())
        } else {
            ElfTables::resolver_from_dynamic(&path, bias, start, end, dynamic)
        };

        ctx.modules.push(ModuleInfo::new(path, start, end, tables));

        0 // continue iteration
    }

    let mut ctx = Ctx {
        modules: Vec::new(),
    };

    unsafe {
        libc::dl_iterate_phdr(Some(callback), &mut ctx as *mut Ctx as *mut c_void);
    }

    ctx.modules
}

pub fn find_module_by_name(name: &str) -> Option<ModuleInfo> {
    enumerate_modules()
        .into_iter()
        .find(|m| m.name == name || m.path.ends_with(name))
}

/// Resolve a symbol globally (across all loaded modules) using `dlsym(RTLD_DEFAULT, ...)`.
pub fn find_global_export_by_name(symbol: &str) -> Result<usize, HookError> {
    let cstr = CString::new(symbol).map_err(|_| HookError::InvalidSymbol(symbol.to_string()))?;
    unsafe {
        let p = libc::dlsym(libc::RTLD_DEFAULT, cstr.as_ptr());
        if p.is_null() {
            Err(HookError::SymbolNotFound(symbol.to_string()))
        } else {
            Ok(p as usize)
        }
    }
}

/// Basename of the module containing `address`.
pub fn resolve_address_module(address: usize) -> Option<String> {
    resolve_address(address).map(|(module, _)| module)
}

/// Module basename and module base for `address`, via `dladdr`.
pub fn resolve_address(address: usize) -> Option<(String, usize)> {
    unsafe {
        let mut info: libc::Dl_info = core::mem::zeroed();
        if libc::dladdr(address as *const c_void, &mut info) == 0 {
            return None;
        }
        if info.dli_fname.is_null() {
            return None;
        }
        let path = CStr::from_ptr(info.dli_fname).to_string_lossy();
        Some((basename(&path).to_string(), info.dli_fbase as usize))
    }
}

/// Take a loader reference on `module` so it cannot be unmapped while
/// its slots are being written.
fn pin_module(module: &ModuleInfo) -> Option<ModulePin> {
    // Neither the executable nor the vDSO can be unloaded.
    if module.path == main_executable_path() || is_vdso(&module.path) {
        return Some(ModulePin::unpinned());
    }
    let path = CString::new(module.path.as_str()).ok()?;
    let handle = unsafe { libc::dlopen(path.as_ptr(), libc::RTLD_NOLOAD | libc::RTLD_LAZY) };
    if handle.is_null() {
        trace!("dlopen(RTLD_NOLOAD) failed for {}", module.path);
        return None;
    }
    let handle = handle as usize;
    Some(ModulePin::with_release(move || unsafe {
        libc::dlclose(handle as *mut c_void);
    }))
}
