// src/poller/cursor.rs
//! Per-rule watermarks.
//!
//! Built once at start-up. Each rule's cell has a single writer (its poller);
//! diagnostics read a snapshot without taking a lock.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::rules::RoutingTable;

#[derive(Debug, Clone, Default)]
pub struct CursorBoard {
    cells: BTreeMap<String, Arc<AtomicU64>>,
}

impl CursorBoard {
    /// One cell per id-sequence rule, seeded from its configured `start_id`.
    pub fn from_table(table: &RoutingTable) -> Self {
        let cells = table
            .id_sequence_rules()
            .map(|(rule, src)| (rule.name.clone(), Arc::new(AtomicU64::new(src.start_id))))
            .collect();
        Self { cells }
    }

    /// Writer handle for `rule`'s poller.
    pub fn cell(&self, rule: &str) -> Option<Arc<AtomicU64>> {
        self.cells.get(rule).cloned()
    }

    pub fn get(&self, rule: &str) -> Option<u64> {
        self.cells.get(rule).map(|c| c.load(Ordering::Acquire))
    }

    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.cells
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Acquire)))
            .collect()
    }
}

/// Move `cell` forward to `id`; never backwards. Returns the resulting value.
pub fn advance(cell: &AtomicU64, id: u64) -> u64 {
    cell.fetch_max(id, Ordering::AcqRel).max(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_is_monotonic() {
        let c = AtomicU64::new(10);
        assert_eq!(advance(&c, 15), 15);
        assert_eq!(advance(&c, 12), 15);
        assert_eq!(c.load(Ordering::Relaxed), 15);
    }
}
