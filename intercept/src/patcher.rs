//! Atomic slot writes, with temporary write access for read-only pages.

use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use log::{trace, warn};

use crate::types::HookError;

const PAGE_LOCK_STRIPES: usize = 64;

pub trait SlotWriter: Send + Sync {
    /// Replace the pointer stored at `slot` with `value` as one atomic store.
    ///
    /// # Safety
    /// `slot` must be a pointer slot inside a loaded module's resolution tables
    /// that stays mapped for the duration of the call.
    unsafe fn write(&self, slot: usize, value: usize) -> Result<(), HookError>;
}

/// Stores directly into slots the caller knows to be writable.
#[derive(Debug, Default, Clone, Copy)]
pub struct AtomicWriter;

impl SlotWriter for AtomicWriter {
    unsafe fn write(&self, slot: usize, value: usize) -> Result<(), HookError> {
        check_alignment(slot)?;
        store(slot, value);
        Ok(())
    }
}

/// Grants write access around each store and restores the page's previous
/// protection afterwards. Writers to the same page are serialized so one
/// writer never restores a protection another is still relying on.
pub struct ProtectingWriter {
    page_size: usize,
    page_locks: [Mutex<()>; PAGE_LOCK_STRIPES],
}

impl Default for ProtectingWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtectingWriter {
    pub fn new() -> Self {
        Self {
            page_size: page_size(),
            page_locks: std::array::from_fn(|_| Mutex::new(())),
        }
    }

    fn lock_page(&self, page: usize) -> MutexGuard<'_, ()> {
        let stripe = (page / self.page_size) % PAGE_LOCK_STRIPES;
        self.page_locks[stripe].lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SlotWriter for ProtectingWriter {
    unsafe fn write(&self, slot: usize, value: usize) -> Result<(), HookError> {
        check_alignment(slot)?;
        let page = slot & !(self.page_size - 1);
        let _guard = self.lock_page(page);

        let prot = page_protection(slot).ok_or_else(|| HookError::RemapFailed {
            addr: slot,
            reason: "address is not mapped".to_string(),
        })?;

        if prot & libc::PROT_WRITE != 0 {
            store(slot, value);
            return Ok(());
        }

        if libc::mprotect(page as *mut libc::c_void, self.page_size, prot | libc::PROT_WRITE) != 0 {
            return Err(HookError::RemapFailed {
                addr: slot,
                reason: std::io::Error::last_os_error().to_string(),
            });
        }
        trace!("slot {slot:#x}: page {page:#x} temporarily writable");

        store(slot, value);

        if libc::mprotect(page as *mut libc::c_void, self.page_size, prot) != 0 {
            warn!(
                "could not restore protection of page {page:#x}: {}",
                std::io::Error::last_os_error()
            );
        }
        Ok(())
    }
}

fn check_alignment(slot: usize) -> Result<(), HookError> {
    if slot == 0 || slot % core::mem::align_of::<usize>() != 0 {
        return Err(HookError::RemapFailed {
            addr: slot,
            reason: "slot is null or misaligned".to_string(),
        });
    }
    Ok(())
}

#[inline]
unsafe fn store(slot: usize, value: usize) {
    (*(slot as *const AtomicUsize)).store(value, Ordering::Release);
}

fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

/// Current `PROT_*` bits of the mapping containing `addr`.
#[cfg(target_os = "linux")]
pub fn page_protection(addr: usize) -> Option<libc::c_int> {
    let maps = std::fs::read_to_string("/proc/self/maps").ok()?;
    for line in maps.lines() {
        let mut fields = line.split_whitespace();
        let Some(range) = fields.next() else { continue };
        let Some(perms) = fields.next() else { continue };
        let Some((start_s, end_s)) = range.split_once('-') else { continue };
        let Ok(start) = usize::from_str_radix(start_s, 16) else { continue };
        let Ok(end) = usize::from_str_radix(end_s, 16) else { continue };
        if addr < start || addr >= end {
            continue;
        }
        let mut prot = libc::PROT_NONE;
        for (flag, bit) in perms.chars().zip([libc::PROT_READ, libc::PROT_WRITE, libc::PROT_EXEC]) {
            if flag != '-' {
                prot |= bit;
            }
        }
        return Some(prot);
    }
    None
}

#[cfg(not(target_os = "linux"))]
pub fn page_protection(_addr: usize) -> Option<libc::c_int> {
    None
}
