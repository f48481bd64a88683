//! In-flight signal accounting.
//!
//! The strategy host may not release the replay barrier until every order
//! spawned by a signal has a published outcome. The tracker carries that
//! book-keeping: the host opens an entry per signal id, the order manager
//! registers how many orders the signal produced (possibly zero), and the
//! portfolio server records one outcome per terminal order update.

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use tl_bus::MessageBus;
use tl_types::{TlError, TlResult};

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Default)]
struct SignalProgress {
    expected: Option<usize>,
    outcomes: usize,
}

impl SignalProgress {
    fn settled(&self) -> bool {
        matches!(self.expected, Some(n) if self.outcomes >= n)
    }
}

/// Shared counter keyed on signal id.
#[derive(Default)]
pub struct SignalTracker {
    inner: Mutex<HashMap<u32, SignalProgress>>,
    signal: Condvar,
}

impl SignalTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a signal id before its SIGNAL event is published.
    pub fn open(&self, signal_id: u32) {
        self.inner.lock().entry(signal_id).or_default();
    }

    /// Record how many orders the order manager produced for a signal.
    /// Zero is meaningful: the risk model rejected everything.
    pub fn set_expected(&self, signal_id: u32, count: usize) {
        let mut inner = self.inner.lock();
        inner.entry(signal_id).or_default().expected = Some(count);
        self.signal.notify_all();
    }

    /// Record one broker outcome for a signal's order.
    pub fn record_outcome(&self, signal_id: u32) {
        let mut inner = self.inner.lock();
        inner.entry(signal_id).or_default().outcomes += 1;
        self.signal.notify_all();
    }

    /// Block until every listed signal is settled (expected count known and
    /// all outcomes in), then forget them. Returns early on shutdown.
    pub fn wait_settled(&self, signal_ids: &[u32], bus: &MessageBus) -> TlResult<()> {
        let mut inner = self.inner.lock();
        loop {
            if bus.is_shutdown() {
                return Err(TlError::Shutdown);
            }
            let all_settled = signal_ids
                .iter()
                .all(|id| inner.get(id).map(SignalProgress::settled).unwrap_or(false));
            if all_settled {
                for id in signal_ids {
                    inner.remove(id);
                }
                return Ok(());
            }
            self.signal
                .wait_until(&mut inner, Instant::now() + WAIT_POLL_INTERVAL);
        }
    }
}
