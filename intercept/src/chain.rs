//! Hook Table: per-symbol chains of installed proxies.
//!
//! Each chain keeps its mutable state behind a mutex and publishes an
//! immutable [`ChainSnapshot`] for the call path. Proxies read the snapshot
//! that was current when they were entered, so a concurrent pop never changes
//! the notion of "previous" for a call already in flight.

use core::sync::atomic::{AtomicU64, Ordering};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use crate::types::{HookError, ModuleHandle};

/// One installed proxy. Positions are issued in push order and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainEntry {
    pub position: u64,
    pub proxy: usize,
}

/// Immutable view of a chain, newest entry first.
#[derive(Debug, Clone)]
pub struct ChainSnapshot {
    pub entries: Vec<ChainEntry>,
    pub original: usize,
}

impl ChainSnapshot {
    /// Target a proxy at `floor` forwards to: the newest entry pushed before
    /// it, or the original once the chain is exhausted.
    pub fn previous_of(&self, floor: u64) -> usize {
        self.entries
            .iter()
            .find(|e| e.position < floor)
            .map_or(self.original, |e| e.proxy)
    }

    pub fn newest(&self) -> Option<&ChainEntry> {
        self.entries.first()
    }

    pub fn position_of(&self, proxy: usize) -> Option<u64> {
        self.entries.iter().find(|e| e.proxy == proxy).map(|e| e.position)
    }
}

/// Ownership of one table slot by the chain's entries.
#[derive(Debug, Clone)]
pub(crate) struct SlotRecord {
    /// Value found in the slot before the first proxy claimed it.
    pub pristine: usize,
    /// `(position, proxy)` of every owner, oldest first.
    pub owners: Vec<(u64, usize)>,
    pub module: ModuleHandle,
}

impl SlotRecord {
    /// What the slot should hold: the newest owner's proxy, else the pristine value.
    pub fn desired(&self) -> usize {
        self.owners.last().map_or(self.pristine, |&(_, proxy)| proxy)
    }

    pub fn add_owner(&mut self, position: u64, proxy: usize) {
        let at = self.owners.partition_point(|&(p, _)| p < position);
        self.owners.insert(at, (position, proxy));
    }

    pub fn remove_owner(&mut self, position: u64) -> bool {
        let before = self.owners.len();
        self.owners.retain(|&(p, _)| p != position);
        self.owners.len() != before
    }

    pub fn is_owned_by(&self, position: u64) -> bool {
        self.owners.iter().any(|&(p, _)| p == position)
    }
}

pub(crate) struct ChainState {
    entries: Vec<ChainEntry>,
    next_position: u64,
    pub slots: HashMap<usize, SlotRecord>,
}

pub struct HookChain {
    id: u64,
    symbol: String,
    original: usize,
    state: Mutex<ChainState>,
    snapshot: RwLock<Arc<ChainSnapshot>>,
}

impl fmt::Debug for HookChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookChain")
            .field("id", &self.id)
            .field("symbol", &self.symbol)
            .field("original", &format_args!("{:#x}", self.original))
            .finish_non_exhaustive()
    }
}

impl HookChain {
    fn new(id: u64, symbol: &str, original: usize) -> Self {
        Self {
            id,
            symbol: symbol.to_string(),
            original,
            state: Mutex::new(ChainState {
                entries: Vec::new(),
                next_position: 1,
                slots: HashMap::new(),
            }),
            snapshot: RwLock::new(Arc::new(ChainSnapshot {
                entries: Vec::new(),
                original,
            })),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn original(&self) -> usize {
        self.original
    }

    /// The chain as the call path currently sees it.
    pub fn snapshot(&self) -> Arc<ChainSnapshot> {
        self.snapshot.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.snapshot().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ChainState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Install `proxy` as the newest entry.
    pub fn push(self: &Arc<Self>, proxy: usize) -> Result<ChainPosition, HookError> {
        let mut state = self.lock();
        self.push_locked(&mut state, proxy)
    }

    /// Remove the entry at `position`.
    pub fn pop(&self, position: &ChainPosition) -> Result<(), HookError> {
        let mut state = self.lock();
        self.pop_locked(&mut state, position)
    }

    pub(crate) fn push_locked(
        self: &Arc<Self>,
        state: &mut ChainState,
        proxy: usize,
    ) -> Result<ChainPosition, HookError> {
        if proxy == 0 {
            return Err(HookError::NullProxy);
        }
        if state.entries.iter().any(|e| e.proxy == proxy) {
            return Err(HookError::AlreadyHooked {
                symbol: self.symbol.clone(),
                proxy,
            });
        }
        let position = state.next_position;
        state.next_position += 1;
        state.entries.insert(0, ChainEntry { position, proxy });
        self.publish(state);
        Ok(ChainPosition {
            chain: Arc::clone(self),
            position,
            proxy,
        })
    }

    pub(crate) fn pop_locked(&self, state: &mut ChainState, position: &ChainPosition) -> Result<(), HookError> {
        if position.chain.id != self.id {
            return Err(HookError::ChainCorruption {
                symbol: self.symbol.clone(),
                reason: format!("position belongs to chain for `{}`", position.chain.symbol),
            });
        }
        match state.entries.iter().position(|e| e.position == position.position) {
            Some(index) => {
                let entry = state.entries[index];
                if entry.proxy != position.proxy {
                    return Err(HookError::ChainCorruption {
                        symbol: self.symbol.clone(),
                        reason: format!(
                            "position {} holds proxy {:#x}, expected {:#x}",
                            position.position, entry.proxy, position.proxy
                        ),
                    });
                }
                state.entries.remove(index);
                self.publish(state);
                Ok(())
            }
            None if position.position < state.next_position => Err(HookError::DoubleUnhook),
            None => Err(HookError::ChainCorruption {
                symbol: self.symbol.clone(),
                reason: format!("position {} was never pushed", position.position),
            }),
        }
    }

    fn publish(&self, state: &ChainState) {
        let snapshot = Arc::new(ChainSnapshot {
            entries: state.entries.clone(),
            original: self.original,
        });
        *self.snapshot.write().unwrap_or_else(|e| e.into_inner()) = snapshot;
    }
}

/// A chain entry handed to the installer that pushed it.
#[derive(Debug, Clone)]
pub struct ChainPosition {
    chain: Arc<HookChain>,
    position: u64,
    proxy: usize,
}

impl ChainPosition {
    pub fn chain(&self) -> &Arc<HookChain> {
        &self.chain
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn proxy(&self) -> usize {
        self.proxy
    }
}

/// Process-wide map from symbol name to its chain.
#[derive(Default)]
pub struct HookTable {
    chains: Mutex<HashMap<String, Arc<HookChain>>>,
    next_chain_id: AtomicU64,
}

impl HookTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the chain for `symbol`. `original` is only used when
    /// the chain is created.
    pub fn chain_for(&self, symbol: &str, original: usize) -> Arc<HookChain> {
        let mut chains = self.chains.lock().unwrap_or_else(|e| e.into_inner());
        chains
            .entry(symbol.to_string())
            .or_insert_with(|| {
                let id = self.next_chain_id.fetch_add(1, Ordering::Relaxed) + 1;
                Arc::new(HookChain::new(id, symbol, original))
            })
            .clone()
    }

    pub fn get(&self, symbol: &str) -> Option<Arc<HookChain>> {
        self.chains
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(symbol)
            .cloned()
    }

    pub fn chains(&self) -> Vec<Arc<HookChain>> {
        self.chains
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }
}
