//! Delivery and membership counters.
//!
//! Producers push deltas onto bounded channels with `try_send`; a single
//! collector task folds them into atomic counters. Overflow drops the delta
//! so metering never blocks the data path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

const STAT_CHANNEL_CAPACITY: usize = 8192;

/// Point-in-time view of the cumulative counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub member_enters: u64,
    pub member_leaves: u64,
    pub in_messages: u64,
    pub in_bytes: u64,
    pub out_messages: u64,
    pub out_bytes: u64,
}

#[derive(Default)]
struct Counters {
    member_enters: AtomicU64,
    member_leaves: AtomicU64,
    in_messages: AtomicU64,
    in_bytes: AtomicU64,
    out_messages: AtomicU64,
    out_bytes: AtomicU64,
}

#[derive(Clone)]
pub(crate) struct Statistic {
    enter_tx: mpsc::Sender<u64>,
    leave_tx: mpsc::Sender<u64>,
    in_tx: mpsc::Sender<u64>,
    out_tx: mpsc::Sender<u64>,
    counters: Arc<Counters>,
}

impl Statistic {
    /// Create the sink and start its collector task.
    pub(crate) fn spawn() -> Self {
        let (enter_tx, enter_rx) = mpsc::channel(STAT_CHANNEL_CAPACITY);
        let (leave_tx, leave_rx) = mpsc::channel(STAT_CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel(STAT_CHANNEL_CAPACITY);
        let (out_tx, out_rx) = mpsc::channel(STAT_CHANNEL_CAPACITY);
        let counters = Arc::new(Counters::default());
        tokio::spawn(collect(
            enter_rx,
            leave_rx,
            in_rx,
            out_rx,
            counters.clone(),
        ));
        Self {
            enter_tx,
            leave_tx,
            in_tx,
            out_tx,
            counters,
        }
    }

    pub(crate) fn add_member_enter(&self) {
        let _ = self.enter_tx.try_send(1);
    }

    pub(crate) fn add_member_leave(&self) {
        let _ = self.leave_tx.try_send(1);
    }

    pub(crate) fn add_in_msg(&self, bytes: usize) {
        let _ = self.in_tx.try_send(bytes as u64);
    }

    pub(crate) fn add_out_msg(&self, bytes: usize) {
        let _ = self.out_tx.try_send(bytes as u64);
    }

    pub(crate) fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            member_enters: self.counters.member_enters.load(Ordering::Relaxed),
            member_leaves: self.counters.member_leaves.load(Ordering::Relaxed),
            in_messages: self.counters.in_messages.load(Ordering::Relaxed),
            in_bytes: self.counters.in_bytes.load(Ordering::Relaxed),
            out_messages: self.counters.out_messages.load(Ordering::Relaxed),
            out_bytes: self.counters.out_bytes.load(Ordering::Relaxed),
        }
    }
}

async fn collect(
    mut enter_rx: mpsc::Receiver<u64>,
    mut leave_rx: mpsc::Receiver<u64>,
    mut in_rx: mpsc::Receiver<u64>,
    mut out_rx: mpsc::Receiver<u64>,
    counters: Arc<Counters>,
) {
    loop {
        tokio::select! {
            Some(n) = enter_rx.recv() => {
                counters.member_enters.fetch_add(n, Ordering::Relaxed);
            }
            Some(n) = leave_rx.recv() => {
                counters.member_leaves.fetch_add(n, Ordering::Relaxed);
            }
            Some(bytes) = in_rx.recv() => {
                counters.in_messages.fetch_add(1, Ordering::Relaxed);
                counters.in_bytes.fetch_add(bytes, Ordering::Relaxed);
            }
            Some(bytes) = out_rx.recv() => {
                counters.out_messages.fetch_add(1, Ordering::Relaxed);
                counters.out_bytes.fetch_add(bytes, Ordering::Relaxed);
            }
            else => break,
        }
    }
}
