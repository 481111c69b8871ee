use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use kurodb_tx::TxError;

/// Lock modes for a table. Read and write are both shared with each
/// other (row conflicts are the transaction layer's job); exclusive is
/// incompatible with everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Write,
    Exclusive,
}

struct LockState {
    holders: HashMap<u64, LockMode>,
    /// FIFO of waiting sessions; only the head may acquire, which keeps
    /// the queue starvation-free.
    queue: VecDeque<u64>,
}

/// A fair, per-table lock with a FIFO waiter queue.
///
/// Upgrading to exclusive is allowed when the upgrading session is the
/// only holder. Waiters time out with `LockTimeout`.
pub struct TableLock {
    state: Mutex<LockState>,
    available: Condvar,
}

impl TableLock {
    pub fn new() -> TableLock {
        TableLock {
            state: Mutex::new(LockState {
                holders: HashMap::new(),
                queue: VecDeque::new(),
            }),
            available: Condvar::new(),
        }
    }

    pub fn lock(&self, session: u64, mode: LockMode, timeout_ms: u64) -> Result<(), TxError> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let mut state = self.state.lock();

        if Self::grantable(&state, session, mode) && state.queue.is_empty() {
            state.holders.insert(session, mode);
            return Ok(());
        }

        state.queue.push_back(session);
        loop {
            let at_head = state.queue.front() == Some(&session);
            if at_head && Self::grantable(&state, session, mode) {
                state.queue.pop_front();
                state.holders.insert(session, mode);
                // The next waiter may be compatible too.
                self.available.notify_all();
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                state.queue.retain(|&s| s != session);
                self.available.notify_all();
                return Err(TxError::LockTimeout);
            }
            self.available.wait_for(&mut state, deadline - now);
        }
    }

    pub fn unlock(&self, session: u64) {
        let mut state = self.state.lock();
        state.holders.remove(&session);
        self.available.notify_all();
    }

    pub fn holds(&self, session: u64) -> Option<LockMode> {
        self.state.lock().holders.get(&session).copied()
    }

    fn grantable(state: &LockState, session: u64, mode: LockMode) -> bool {
        let others = state
            .holders
            .iter()
            .filter(|&(&s, _)| s != session)
            .map(|(_, &m)| m);
        match mode {
            // Shared modes only conflict with a foreign exclusive.
            LockMode::Read | LockMode::Write => {
                !state
                    .holders
                    .iter()
                    .any(|(&s, &m)| s != session && m == LockMode::Exclusive)
            }
            // Exclusive needs the table to itself; holding a shared lock
            // already (sole holder) upgrades in place.
            LockMode::Exclusive => others.count() == 0,
        }
    }
}

impl Default for TableLock {
    fn default() -> Self {
        TableLock::new()
    }
}
