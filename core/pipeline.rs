// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2025 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The orchestrator: owns `Configuration` and every long-lived task (spec
//! §3 "Ownership"), wiring the reader (R), writer (W), fan-out (B),
//! encoder supervisor (E), and periodic ticker (T) together and exposing
//! subscription as the node's one public surface.
//!
//! Grounded on `src/cmds/run/mod.rs`'s task-spawning/shutdown-join shape:
//! one `shutdown::Sender` held by the orchestrator, a `JoinSet` of the
//! spawned tasks, `stop()` signaling cancellation and awaiting every task.

use crate::config::Configuration;
use crate::encoder::{ExternalEncoder, Supervisor};
use crate::fanout::{self, FanOut, SubscriberId};
use crate::frame::FrameBatch;
use crate::writer::{self, FsChunkIo};
use crate::{encoder, shm};
use base::clock::{Clocks, RealClocks};
use base::Error;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{error, warn};

/// A live subscription returned by [`Pipeline::subscribe`]. Dropping it does
/// *not* unregister the subscriber (the receiver may still be draining
/// buffered batches); call [`Pipeline::unsubscribe`] explicitly, the same
/// discipline `FanOut::unregister` expects.
pub struct SubscriberHandle {
    id: SubscriberId,
    pub receiver: mpsc::Receiver<FrameBatch>,
}

/// The running node: reader, writer, fan-out, encoder watcher, and ticker
/// tasks, plus the handles needed to subscribe and to shut everything down.
pub struct Pipeline {
    cfg: Arc<Configuration>,
    hub: FanOut,
    fps_rx: watch::Receiver<f64>,
    shutdown_tx: base::shutdown::Sender,
    tasks: JoinSet<Result<(), Error>>,
}

impl Pipeline {
    /// Starts every task with real clocks and real filesystem I/O. Returns
    /// once all tasks are spawned; failures surface later through
    /// [`Pipeline::stop`]'s returned errors, not from `start` itself (the
    /// tasks run for the node's whole lifetime).
    pub fn start(cfg: Configuration) -> Self {
        let clocks: Arc<dyn Clocks> = Arc::new(RealClocks {});
        Self::start_with(cfg, clocks, jiff::tz::TimeZone::UTC)
    }

    /// As [`Pipeline::start`], but with an injected clock source and time
    /// zone, for deterministic tests (spec §4.H `testutil`).
    pub fn start_with(cfg: Configuration, clocks: Arc<dyn Clocks>, zone: jiff::tz::TimeZone) -> Self {
        let cfg = Arc::new(cfg);
        let hub = FanOut::new();
        let (shutdown_tx, shutdown_rx) = base::shutdown::channel();
        let (frames_tx, frames_rx) = mpsc::channel(cfg.frame_channel_capacity);
        let (significant_tx, significant_rx) = mpsc::channel(cfg.significant_channel_capacity);
        let (fps_tx, fps_rx) = watch::channel(0.0);

        let mut tasks = JoinSet::new();

        // R: shared-memory reader + event state machine.
        {
            let cfg = cfg.clone();
            let shutdown_rx = shutdown_rx.clone();
            tasks.spawn(shm::run(
                cfg.shm_path(),
                cfg,
                frames_tx,
                significant_tx,
                fps_tx,
                shutdown_rx,
            ));
        }

        // W: chunk writer.
        {
            let cfg = cfg.clone();
            let clocks = clocks.clone();
            let zone = zone.clone();
            let shutdown_rx = shutdown_rx.clone();
            tasks.spawn(writer::run(
                significant_rx,
                cfg,
                clocks,
                zone,
                Arc::new(FsChunkIo),
                shutdown_rx,
            ));
        }

        // B: fan-out dispatch.
        {
            let hub = hub.clone();
            let shutdown_rx = shutdown_rx.clone();
            tasks.spawn(async move {
                fanout::run(frames_rx, hub, shutdown_rx).await;
                Ok(())
            });
        }

        // E + T: encoder supervisor, watcher-driven and periodic-ticker-driven.
        let sup = Supervisor::new(
            cfg.clone(),
            Arc::new(ExternalEncoder {
                binary: cfg.encoder_binary.clone(),
            }),
            clocks,
            zone,
            fps_rx.clone(),
        );
        {
            let sup = sup.clone();
            let shutdown_rx = shutdown_rx.clone();
            tasks.spawn(encoder::run_watcher(sup, shutdown_rx));
        }
        {
            let sup = sup.clone();
            let shutdown_rx = shutdown_rx.clone();
            tasks.spawn(async move {
                encoder::run_ticker(sup, shutdown_rx).await;
                Ok(())
            });
        }

        Pipeline {
            cfg,
            hub,
            fps_rx,
            shutdown_tx,
            tasks,
        }
    }

    /// Registers a new subscriber with `Configuration::subscriber_queue_capacity`.
    pub fn subscribe(&self) -> SubscriberHandle {
        let (id, receiver) = self.hub.register(self.cfg.subscriber_queue_capacity);
        SubscriberHandle { id, receiver }
    }

    /// Unregisters a subscriber; its receiver observes EOF on its next poll.
    pub fn unsubscribe(&self, handle: SubscriberHandle) {
        self.hub.unregister(handle.id);
    }

    /// The most recently observed ingest FPS (0.0 before the first second of
    /// frames has elapsed).
    pub fn latest_fps(&self) -> f64 {
        *self.fps_rx.borrow()
    }

    pub fn subscriber_count(&self) -> usize {
        self.hub.subscriber_count()
    }

    /// Signals cancellation to every task and awaits them all. Logs (but
    /// does not propagate) individual task failures, since shutdown must
    /// complete regardless.
    pub async fn stop(mut self) {
        drop(self.shutdown_tx); // `Sender`'s `Drop` impl wakes every `Receiver`.
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e.chain(), "pipeline: task exited with error"),
                Err(e) => warn!(error = %e, "pipeline: task panicked"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::NO_DETECTION;
    use base::clock::SimulatedClocks;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    fn boot_at(date: &str) -> jiff::Timestamp {
        let d: jiff::civil::Date = date.parse().unwrap();
        d.at(0, 0, 0, 0).to_zoned(jiff::tz::TimeZone::UTC).unwrap().timestamp()
    }

    /// Writes the §6 shared-memory wire format to `path`, mimicking the
    /// capture process, then fires a notify event on it.
    fn write_shm_frame(path: &std::path::Path, detection: i8, width: u32, height: u32, payload: &[u8]) {
        let mut buf = Vec::with_capacity(9 + payload.len());
        buf.push(detection as u8);
        buf.extend_from_slice(&width.to_le_bytes());
        buf.extend_from_slice(&height.to_le_bytes());
        buf.extend_from_slice(payload);
        std::fs::write(path, &buf).unwrap();
    }

    /// Exercises the full R -> B -> subscriber path end to end: a detection
    /// frame written to the shared-memory file arrives at a live subscriber.
    #[tokio::test(flavor = "multi_thread")]
    async fn subscriber_receives_frame_after_shm_write() {
        let shm_dir = tempdir().unwrap();
        let save_dir = tempdir().unwrap();
        let shm_name = "pipeline-test-cam";
        let shm_path = shm_dir.path().join(shm_name);
        std::fs::write(&shm_path, [0u8; 9]).unwrap();

        // `Configuration::shm_path` is hardcoded to `/dev/shm`; this test
        // exercises the reader directly against a tempdir path instead of
        // going through `Pipeline::start_with`, which is only possible
        // because `shm::run` takes the path as a parameter, not derived
        // internally. See the inline comment on `start_with`'s `R` spawn.
        let mut cfg = Configuration::default();
        cfg.shm_name = shm_name.to_string();
        cfg.save_path = save_dir.path().to_path_buf();
        cfg.show_what_was_before_frames = 2;
        cfg.show_what_was_after_frames = 2;

        let clocks: Arc<dyn Clocks> = Arc::new(SimulatedClocks::new(boot_at("2026-07-28")));
        let cfg = Arc::new(cfg);
        let hub = FanOut::new();
        let (shutdown_tx, shutdown_rx) = base::shutdown::channel();
        let (frames_tx, frames_rx) = mpsc::channel(cfg.frame_channel_capacity);
        let (significant_tx, significant_rx) = mpsc::channel(cfg.significant_channel_capacity);
        let (fps_tx, _fps_rx) = watch::channel(0.0);

        let mut tasks = JoinSet::new();
        tasks.spawn(shm::run(
            shm_path.clone(),
            cfg.clone(),
            frames_tx,
            significant_tx,
            fps_tx,
            shutdown_rx.clone(),
        ));
        {
            let hub = hub.clone();
            tasks.spawn(async move {
                fanout::run(frames_rx, hub, shutdown_rx.clone()).await;
                Ok(())
            });
        }
        drop(tokio::task::spawn(writer::run(
            significant_rx,
            cfg.clone(),
            clocks,
            jiff::tz::TimeZone::UTC,
            Arc::new(FsChunkIo),
            base::shutdown::channel().1,
        )));

        let (_sub_id, mut rx) = hub.register(5);

        // let the watcher register before the write races it.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        write_shm_frame(&shm_path, NO_DETECTION as i8, 4, 4, b"hello");

        let batch = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("channel closed");
        assert_eq!(batch.frame.payload.as_ref(), b"hello");
        assert_eq!((batch.frame.width, batch.frame.height), (4, 4));

        drop(shutdown_tx);
        while tasks.join_next().await.is_some() {}
    }

    #[test]
    fn subscriber_handle_round_trips_through_hub() {
        let hub = FanOut::new();
        let (id, _rx) = hub.register(1);
        assert_eq!(hub.subscriber_count(), 1);
        hub.unregister(id);
        assert_eq!(hub.subscriber_count(), 0);
    }

    // Permissions sanity check shared with `layout`'s own tests: a
    // `Pipeline`-driven write ends up with the chunk directory mode the
    // spec requires, exercised here rather than only at the `layout` unit
    // level so a regression in the wiring (e.g. a future `FsChunkIo`
    // replacement) would also be caught.
    #[tokio::test]
    async fn writer_task_creates_chunk_dir_with_expected_mode() {
        let save_dir = tempdir().unwrap();
        let mut cfg = Configuration::default();
        cfg.shm_name = "modecheck".to_string();
        cfg.save_path = save_dir.path().to_path_buf();
        let cfg = Arc::new(cfg);

        let clocks: Arc<dyn Clocks> = Arc::new(SimulatedClocks::new(boot_at("2026-07-28")));
        let (tx, rx) = mpsc::channel(4);
        let (_shut_tx, shut_rx) = base::shutdown::channel();
        tx.send(crate::frame::SignificantFrame::Frame {
            frame: crate::frame::Frame::new(b"x".to_vec(), 1, 1, 0),
            before: vec![],
        })
        .await
        .unwrap();
        drop(tx);
        writer::run(rx, cfg.clone(), clocks, jiff::tz::TimeZone::UTC, Arc::new(FsChunkIo), shut_rx)
            .await
            .unwrap();

        let chunk_dir = cfg.raw_area().join("2026-07-28").join("1");
        let mode = std::fs::metadata(&chunk_dir).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o755);
    }
}
