use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::SystemTime;

use crate::types::HookError;

pub const MAX_RECORDS: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookOp {
    Hook,
    Unhook,
    Refresh,
}

/// One slot write or one rejected operation.
#[derive(Debug, Clone)]
pub struct HookRecord {
    pub timestamp: SystemTime,
    pub op: HookOp,
    pub symbol: String,
    pub module: Option<String>,
    pub new_value: usize,
    pub error: Option<HookError>,
}

/// Ring of the most recent records; the oldest is dropped when full.
#[derive(Default)]
pub(crate) struct RecordLog {
    records: Mutex<VecDeque<HookRecord>>,
}

impl RecordLog {
    pub fn push(
        &self,
        op: HookOp,
        symbol: &str,
        module: Option<&str>,
        new_value: usize,
        error: Option<HookError>,
    ) {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        if records.len() == MAX_RECORDS {
            records.pop_front();
        }
        records.push_back(HookRecord {
            timestamp: SystemTime::now(),
            op,
            symbol: symbol.to_string(),
            module: module.map(str::to_string),
            new_value,
            error,
        });
    }

    pub fn snapshot(&self) -> Vec<HookRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}
