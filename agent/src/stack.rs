//! Caller stack capture for the thread-creation log.

#[cfg(target_os = "linux")]
use threadhook_intercept::module::resolve_address;

#[cfg(not(target_os = "linux"))]
fn resolve_address(_address: usize) -> Option<(String, usize)> {
    None
}

/// Symbol prefixes of frames that belong to the capture itself or to the
/// hook machinery; leading frames matching these are dropped.
const MACHINERY: &[&str] = &[
    "backtrace::",
    "_Unwind_",
    "threadhook_agent::stack::capture",
    "threadhook_agent::hooks::",
    "threadhook_intercept::",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    pub address: usize,
    pub symbol: Option<String>,
    /// Basename of the module containing `address`.
    pub module: Option<String>,
    /// Offset of `address` from the module base.
    pub offset: usize,
}

impl StackFrame {
    pub fn new(address: usize, symbol: Option<String>) -> Self {
        let (module, offset) = match resolve_address(address) {
            Some((module, base)) => (Some(module), address.wrapping_sub(base)),
            None => (None, 0),
        };
        Self {
            address,
            symbol,
            module,
            offset,
        }
    }

    /// Format frame for display: "symbol (module+0xoffset)"
    pub fn display(&self) -> String {
        let sym = self.symbol.as_deref().unwrap_or("<unknown>");
        match &self.module {
            Some(module) => format!("{} ({}+{:#x})", sym, module, self.offset),
            None => format!("{} ({:#x})", sym, self.address),
        }
    }
}

fn is_machinery(symbol: &str) -> bool {
    MACHINERY.iter().any(|prefix| symbol.starts_with(prefix))
}

/// Capture up to `max_frames` frames of the current thread's stack, starting
/// at the first frame outside the hook machinery.
pub fn capture(max_frames: usize) -> Vec<StackFrame> {
    let mut frames = Vec::new();
    if max_frames == 0 {
        return frames;
    }

    let mut leading = true;
    backtrace::trace(|frame| {
        let address = frame.ip() as usize;
        // The unwinder reports the end of the stack as a zero return address.
        if address == 0 {
            return true;
        }
        let mut symbol = None;
        backtrace::resolve_frame(frame, |s| {
            if symbol.is_none() {
                symbol = s.name().map(|name| format!("{name:#}"));
            }
        });

        if leading && symbol.as_deref().is_some_and(is_machinery) {
            return true;
        }
        leading = false;

        frames.push(StackFrame::new(address, symbol));
        frames.len() < max_frames
    });
    frames
}
