//! Stack-Scope Guard: per-thread record of proxies currently executing.
//!
//! A proxy opens a [`StackScope`] on entry. The scope pushes a frame onto
//! this thread's call stack and decides which implementation "previous"
//! means for this call: the newest chain entry older than every entry of the
//! same chain already active on this thread. That keeps nested and recursive
//! calls moving toward the original instead of looping.

use core::marker::PhantomData;
use std::cell::{Cell, RefCell};
use std::sync::Arc;

use log::warn;

use crate::chain::{ChainPosition, ChainSnapshot, HookChain};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Frame {
    chain: u64,
    position: u64,
    serial: u64,
}

thread_local! {
    static CALL_STACK: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
    static NEXT_SERIAL: Cell<u64> = const { Cell::new(0) };
}

/// Guard for one proxy invocation. Not `Send`: it must be dropped on the
/// thread that opened it.
pub struct StackScope {
    snapshot: Arc<ChainSnapshot>,
    floor: u64,
    reentrant: bool,
    depth: usize,
    serial: Option<u64>,
    _not_send: PhantomData<*const ()>,
}

impl StackScope {
    pub fn enter(position: &ChainPosition) -> Self {
        Self::enter_at(position.chain(), position.position())
    }

    /// Open a scope for the entry at `position` in `chain`.
    pub fn enter_at(chain: &HookChain, position: u64) -> Self {
        let snapshot = chain.snapshot();
        let chain_id = chain.id();

        let entered = CALL_STACK.try_with(|stack| {
            let mut stack = stack.borrow_mut();
            let mut floor = position;
            let mut reentrant = false;
            for frame in stack.iter().filter(|f| f.chain == chain_id) {
                reentrant |= frame.position == position;
                floor = floor.min(frame.position);
            }
            let serial = NEXT_SERIAL
                .try_with(|s| {
                    let next = s.get().wrapping_add(1);
                    s.set(next);
                    next
                })
                .unwrap_or(0);
            stack.push(Frame {
                chain: chain_id,
                position,
                serial,
            });
            (floor, reentrant, stack.len(), serial)
        });

        match entered {
            Ok((floor, reentrant, depth, serial)) => Self {
                snapshot,
                floor,
                reentrant,
                depth,
                serial: Some(serial),
                _not_send: PhantomData,
            },
            // Thread-local storage is being torn down: forward without tracking.
            Err(_) => Self {
                snapshot,
                floor: position,
                reentrant: true,
                depth: 0,
                serial: None,
                _not_send: PhantomData,
            },
        }
    }

    /// Address of the implementation this call should forward to.
    pub fn previous_address(&self) -> usize {
        self.snapshot.previous_of(self.floor)
    }

    /// The previous implementation as a callable function pointer.
    ///
    /// # Safety
    /// `F` must be a function pointer type matching the hooked symbol's signature.
    pub unsafe fn previous<F: Copy>(&self) -> F {
        const { assert!(core::mem::size_of::<F>() == core::mem::size_of::<usize>()) };
        let address = self.previous_address();
        core::mem::transmute_copy::<usize, F>(&address)
    }

    /// Whether this proxy is already executing further up this thread's stack.
    pub fn is_reentrant(&self) -> bool {
        self.reentrant
    }

    /// Number of intercepted calls in flight on this thread, this one included.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn original(&self) -> usize {
        self.snapshot.original
    }
}

impl Drop for StackScope {
    fn drop(&mut self) {
        let Some(serial) = self.serial.take() else {
            return;
        };
        let _ = CALL_STACK.try_with(|stack| {
            let mut stack = stack.borrow_mut();
            if stack.last().map(|f| f.serial) == Some(serial) {
                stack.pop();
            } else if let Some(index) = stack.iter().rposition(|f| f.serial == serial) {
                warn!("call scope {serial} closed out of order");
                stack.remove(index);
            }
        });
    }
}

/// Number of frames on the current thread's call stack.
pub fn current_depth() -> usize {
    CALL_STACK.try_with(|s| s.borrow().len()).unwrap_or(0)
}

/// Invoke the previous implementation through a [`StackScope`].
///
/// ```ignore
/// let scope = stub.enter();
/// let rc = call_previous!(scope, PthreadCreateFn, thread, attr, start, arg);
/// ```
#[macro_export]
macro_rules! call_previous {
    ($scope:expr, $fn_ty:ty $(, $arg:expr)* $(,)?) => {{
        #[allow(unused_unsafe)]
        let previous: $fn_ty = unsafe { $scope.previous::<$fn_ty>() };
        #[allow(unused_unsafe)]
        let result = unsafe { previous($($arg),*) };
        result
    }};
}
