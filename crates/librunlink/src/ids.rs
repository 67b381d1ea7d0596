use std::collections::BTreeSet;
use std::sync::Mutex;

use crate::error::RunError;

/// Hands out small numeric ids from a bounded range.
///
/// Ids namespace per-process temp files, so one allocator is shared by every
/// run manager in a daemon. The bound doubles as the concurrent process limit.
#[derive(Debug)]
pub struct IdAllocator {
    max: u32,
    used: Mutex<BTreeSet<u32>>,
}

impl IdAllocator {
    pub fn new(max: u32) -> Self {
        Self {
            max: max.max(1),
            used: Mutex::new(BTreeSet::new()),
        }
    }

    /// Reserve the lowest free id.
    pub fn create(&self) -> Result<u32, RunError> {
        let mut used = self.used.lock().unwrap_or_else(|e| e.into_inner());
        let id = (1..=self.max)
            .find(|id| !used.contains(id))
            .ok_or(RunError::TooManyProcesses(self.max))?;
        used.insert(id);
        Ok(id)
    }

    pub fn free(&self, id: u32) {
        self.used
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }

    pub fn in_use(&self) -> usize {
        self.used.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
