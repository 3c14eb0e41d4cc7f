use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use simfleet_core::{InstanceId, ResourceKey};

#[derive(Debug, Default)]
struct QueueState {
    global: VecDeque<InstanceId>,
    private: HashMap<ResourceKey, VecDeque<InstanceId>>,
}

/// Pending instances: one shared FIFO plus one FIFO per resource.
///
/// Entries are instance ids; the instance record itself lives in the catalog.
/// Every operation is a short critical section and never waits.
#[derive(Debug, Default)]
pub(crate) struct DispatchQueues {
    state: Mutex<QueueState>,
}

impl DispatchQueues {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push_global(&self, id: InstanceId) {
        self.state.lock().global.push_back(id);
    }

    pub(crate) fn push_private(&self, key: ResourceKey, id: InstanceId) {
        self.state.lock().private.entry(key).or_default().push_back(id);
    }

    /// Takes the next instance for `key`: its own queue first, then the shared one.
    pub(crate) fn pull(&self, key: ResourceKey) -> Option<InstanceId> {
        let mut state = self.state.lock();
        if let Some(id) = state.private.get_mut(&key).and_then(VecDeque::pop_front) {
            return Some(id);
        }
        state.global.pop_front()
    }

    /// Drops queued entries for removed instances.
    pub(crate) fn forget(&self, ids: &[InstanceId]) {
        let mut state = self.state.lock();
        state.global.retain(|id| !ids.contains(id));
        for queue in state.private.values_mut() {
            queue.retain(|id| !ids.contains(id));
        }
    }

    pub(crate) fn global_len(&self) -> usize {
        self.state.lock().global.len()
    }

    pub(crate) fn private_len(&self, key: ResourceKey) -> usize {
        self.state
            .lock()
            .private
            .get(&key)
            .map(VecDeque::len)
            .unwrap_or(0)
    }
}
