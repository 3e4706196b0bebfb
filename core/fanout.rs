// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2025 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The fan-out hub: broadcasts every ingested frame to N dynamically
//! registered subscribers, never blocking the producer (spec §4.E).
//!
//! Grounded on `db/writer.rs`'s `SyncerChannel<F>` (a cloneable handle
//! wrapping a bounded `tokio::sync::mpsc::Sender`), generalized from one
//! fixed consumer to a dynamically-registered set, each with its own
//! bounded queue and independent drop-on-full policy.

use crate::frame::{Frame, FrameBatch};
use base::{FastHashMap, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Opaque subscriber identity, used to unregister.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

struct Inner {
    next_id: AtomicU64,
    subs: Mutex<FastHashMap<u64, mpsc::Sender<FrameBatch>>>,
}

/// The broadcast publisher. Cheap to clone (an `Arc` internally); every
/// clone shares the same subscriber set.
#[derive(Clone)]
pub struct FanOut(Arc<Inner>);

impl FanOut {
    pub fn new() -> Self {
        FanOut(Arc::new(Inner {
            next_id: AtomicU64::new(0),
            subs: Mutex::new(FastHashMap::default()),
        }))
    }

    /// Registers a new subscriber with the given bounded queue depth,
    /// returning its id and the receiving end.
    ///
    /// Per spec §4.E: capacity 1 suits HLS-style listeners that want the
    /// latest frame with minimal latency; capacity 5 suits listeners that
    /// consume in bursts. Callers choose via `Configuration::subscriber_queue_capacity`.
    pub fn register(&self, capacity: usize) -> (SubscriberId, mpsc::Receiver<FrameBatch>) {
        let id = self.0.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.0.subs.lock().insert(id, tx);
        (SubscriberId(id), rx)
    }

    /// Removes a subscriber; its receiver observes EOF on its next poll.
    pub fn unregister(&self, id: SubscriberId) {
        self.0.subs.lock().remove(&id.0);
    }

    /// Attempts to enqueue `batch` to every current subscriber. A full
    /// queue drops the batch for that subscriber only; the publisher never
    /// blocks or waits. Closed subscriber channels are left for the next
    /// `unregister` call (or just accumulate harmlessly; `try_send` on a
    /// closed channel is a cheap no-op error).
    pub fn publish(&self, batch: FrameBatch) {
        let subs = self.0.subs.lock();
        for (&id, tx) in subs.iter() {
            match tx.try_send(batch.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(subscriber = id, "fanout: dropping frame, subscriber queue full");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.0.subs.lock().len()
    }
}

impl Default for FanOut {
    fn default() -> Self {
        Self::new()
    }
}

/// The background dispatch task: reads every frame off `rx` and publishes
/// it to `hub`, until `rx` closes or `shutdown_rx` fires.
pub async fn run(
    mut rx: mpsc::Receiver<Frame>,
    hub: FanOut,
    shutdown_rx: base::shutdown::Receiver,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.as_future() => return,
            frame = rx.recv() => match frame {
                Some(frame) => hub.publish(frame.into()),
                None => return,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(n: u8) -> FrameBatch {
        Frame::new(vec![n], 1, 1, -1).into()
    }

    #[test]
    fn full_queue_drops_without_blocking_other_subscribers() {
        let hub = FanOut::new();
        let (_slow_id, mut slow_rx) = hub.register(1);
        let (_fast_id, mut fast_rx) = hub.register(5);

        hub.publish(batch(1));
        hub.publish(batch(2)); // slow subscriber's queue (depth 1) is now full.

        // fast subscriber got both.
        assert_eq!(fast_rx.try_recv().unwrap().frame.payload[0], 1);
        assert_eq!(fast_rx.try_recv().unwrap().frame.payload[0], 2);

        // slow subscriber only has the first; the second was dropped for it.
        assert_eq!(slow_rx.try_recv().unwrap().frame.payload[0], 1);
        assert!(slow_rx.try_recv().is_err());
    }

    #[test]
    fn unregister_stops_future_delivery() {
        let hub = FanOut::new();
        let (id, mut rx) = hub.register(5);
        hub.publish(batch(1));
        hub.unregister(id);
        hub.publish(batch(2));
        assert_eq!(rx.try_recv().unwrap().frame.payload[0], 1);
        // channel closed: no more sends possible, recv eventually returns None.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn run_task_forwards_until_input_closes() {
        let hub = FanOut::new();
        let (_id, mut rx) = hub.register(5);
        let (tx, input_rx) = mpsc::channel(10);
        let (_shut_tx, shut_rx) = base::shutdown::channel();
        let hub2 = hub.clone();
        let handle = tokio::spawn(run(input_rx, hub2, shut_rx));

        tx.send(Frame::new(vec![1], 1, 1, -1)).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(rx.recv().await.unwrap().frame.payload[0], 1);
        assert!(rx.recv().await.is_none());
    }
}
