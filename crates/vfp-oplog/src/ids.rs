use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

/// The logical device every system-originated op id is minted against, as
/// opposed to a real client device id.
pub const SYSTEM_DEVICE_ID: &str = "system";

/// Mints sortable operation ids: `<device_id>:<counter padded to 20 digits>`.
/// Zero-padding keeps lexicographic string order equal to numeric counter
/// order within a device, and ids across devices sort by device id first,
/// matching the "device then counter" ordering the scheduler relies on.
#[derive(Default)]
pub struct OpIdAllocator {
    counters: DashMap<String, AtomicU64>,
}

impl OpIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&self, device_id: &str) -> String {
        let counter = self
            .counters
            .entry(device_id.to_string())
            .or_insert_with(|| AtomicU64::new(0));
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{device_id}:{n:020}")
    }

    pub fn allocate_system(&self) -> String {
        self.allocate(SYSTEM_DEVICE_ID)
    }
}

/// Wraps `op_id` as a nested child id. Parentheses sort before any
/// alphanumeric device id, so a nested op's id always sorts strictly
/// before its parent's, and wrapping recursively nests correctly for a
/// grandchild created from within a nested op.
pub fn nested_id(parent_op_id: &str) -> String {
    format!("({parent_op_id})")
}

/// A device may only mint ids under its own namespace; this rejects a
/// client-supplied id claiming to belong to a different device.
pub fn validate_device_owns_id(op_id: &str, device_id: &str) -> bool {
    op_id
        .split_once(':')
        .map(|(owner, _)| owner == device_id)
        .unwrap_or(false)
}
