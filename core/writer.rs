// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2025 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The chunk writer: the single consumer of the `significant` channel,
//! responsible for persisting [`SignificantFrame`]s to the active
//! `ChunkDir` (spec §4.D).
//!
//! Grounded on `db/writer.rs`'s `DirWriter`/`FileWriter` trait split, which
//! exists there so the syncer's tests can swap in an in-memory mock rather
//! than touching a real filesystem; [`ChunkIo`] plays the same role here.
//! The default [`FsChunkIo`] delegates to [`crate::layout`] and runs its
//! blocking `std::fs` calls via `spawn_blocking`, the way `db/writer.rs`
//! awaits its own (genuinely async) directory/file trait methods.

use crate::config::Configuration;
use crate::frame::{Frame, SignificantFrame};
use crate::layout::{self, ChunkDir};
use base::clock::Clocks;
use base::Error;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Filesystem operations the writer needs, factored out for testability.
/// Every method is synchronous; callers run it inside `spawn_blocking`.
pub trait ChunkIo: Send + Sync + 'static {
    fn active_chunk_dir(&self, date_dir: &Path, max_chunk_size_bytes: u64) -> Result<ChunkDir, Error>;
    fn force_new_chunk_dir(&self, date_dir: &Path) -> Result<ChunkDir, Error>;
    fn next_frame_index(&self, chunk_dir: &Path) -> Result<u64, Error>;
    fn write_frame_file(&self, chunk_dir: &Path, index: u64, payload: &[u8]) -> Result<(), Error>;
    fn write_meta_if_absent(&self, chunk_dir: &Path, width: u32, height: u32) -> Result<(), Error>;
}

/// Real filesystem-backed [`ChunkIo`], delegating to [`crate::layout`].
#[derive(Default)]
pub struct FsChunkIo;

impl ChunkIo for FsChunkIo {
    fn active_chunk_dir(&self, date_dir: &Path, max_chunk_size_bytes: u64) -> Result<ChunkDir, Error> {
        layout::active_chunk_dir(date_dir, max_chunk_size_bytes)
    }
    fn force_new_chunk_dir(&self, date_dir: &Path) -> Result<ChunkDir, Error> {
        layout::force_new_chunk_dir(date_dir)
    }
    fn next_frame_index(&self, chunk_dir: &Path) -> Result<u64, Error> {
        layout::next_frame_index(chunk_dir).map_err(|e| {
            base::err!(Internal, msg("listing {}", chunk_dir.display()), source(e))
        })
    }
    fn write_frame_file(&self, chunk_dir: &Path, index: u64, payload: &[u8]) -> Result<(), Error> {
        layout::write_frame_file(chunk_dir, index, payload).map(drop)
    }
    fn write_meta_if_absent(&self, chunk_dir: &Path, width: u32, height: u32) -> Result<(), Error> {
        layout::write_meta_if_absent(chunk_dir, width, height)
    }
}

fn date_dir(cfg: &Configuration, clocks: &dyn Clocks, zone: &jiff::tz::TimeZone) -> std::path::PathBuf {
    cfg.raw_area()
        .join(layout::date_dir_name(clocks.realtime(), zone))
}

async fn write_significant_frame<IO: ChunkIo>(
    io: Arc<IO>,
    cfg: Arc<Configuration>,
    date_dir: std::path::PathBuf,
    frame: Frame,
    before: Vec<Frame>,
) -> Result<(), Error> {
    tokio::task::spawn_blocking(move || -> Result<(), Error> {
        let chunk = io.active_chunk_dir(&date_dir, cfg.save_chunk_size_bytes)?;
        let mut index = io.next_frame_index(&chunk.path)?;
        let to_write: Vec<Frame> = before.into_iter().chain(std::iter::once(frame)).collect();
        for f in &to_write {
            io.write_frame_file(&chunk.path, index, &f.payload)?;
            index += 1;
        }
        if let Some(first) = to_write.first() {
            io.write_meta_if_absent(&chunk.path, first.width, first.height)?;
        }
        Ok(())
    })
    .await
    .map_err(|e| base::err!(Internal, msg("writer blocking task panicked"), source(e)))?
}

/// Drains `rx` until it closes or `shutdown_rx` fires, writing each
/// [`SignificantFrame`] to the active chunk. A write failure aborts the
/// task (spec §7 `WriterError`: "the writer task aborts; supervisor should
/// restart it").
pub async fn run<IO: ChunkIo>(
    mut rx: mpsc::Receiver<SignificantFrame>,
    cfg: Arc<Configuration>,
    clocks: Arc<dyn Clocks>,
    zone: jiff::tz::TimeZone,
    io: Arc<IO>,
    shutdown_rx: base::shutdown::Receiver,
) -> Result<(), Error> {
    loop {
        let msg = tokio::select! {
            biased;
            _ = shutdown_rx.as_future() => return Ok(()),
            m = rx.recv() => match m {
                Some(m) => m,
                None => return Ok(()),
            },
        };

        match msg {
            SignificantFrame::Frame { frame, before } => {
                let dir = date_dir(&cfg, clocks.as_ref(), &zone);
                if let Err(e) =
                    write_significant_frame(io.clone(), cfg.clone(), dir, frame, before).await
                {
                    error!(error = %e.chain(), "writer: aborting after write failure");
                    return Err(e);
                }
            }
            SignificantFrame::EventEnd => {
                let dir = date_dir(&cfg, clocks.as_ref(), &zone);
                let io2 = io.clone();
                match tokio::task::spawn_blocking(move || io2.force_new_chunk_dir(&dir)).await {
                    Ok(Ok(_)) => debug!("writer: sealed chunk at event end"),
                    Ok(Err(e)) => warn!(error = %e.chain(), "writer: failed to seal chunk at event end"),
                    Err(e) => warn!(error = %e, "writer: seal task panicked"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use base::clock::SimulatedClocks;
    use tempfile::tempdir;

    fn cfg(save_path: &Path) -> Arc<Configuration> {
        let mut c = Configuration::default();
        c.shm_name = "cam0".to_string();
        c.save_path = save_path.to_path_buf();
        c.save_chunk_size_bytes = 1 << 20;
        Arc::new(c)
    }

    /// Midnight UTC on `date`, for deterministic date-dir naming in tests.
    fn boot_at(date: &str) -> jiff::Timestamp {
        let d: jiff::civil::Date = date.parse().unwrap();
        d.at(0, 0, 0, 0).to_zoned(jiff::tz::TimeZone::UTC).unwrap().timestamp()
    }

    #[tokio::test]
    async fn writes_pre_and_tail_in_order_with_meta() {
        let tmp = tempdir().unwrap();
        let cfg = cfg(tmp.path());
        let clocks: Arc<dyn Clocks> = Arc::new(SimulatedClocks::new(
            boot_at("2026-07-28"),
        ));
        let (tx, rx) = mpsc::channel(8);
        let (_shut_tx, shut_rx) = base::shutdown::channel();
        let io = Arc::new(FsChunkIo);

        let before = vec![Frame::new(b"n1".to_vec(), 2, 2, -1), Frame::new(b"n2".to_vec(), 2, 2, -1)];
        let frame = Frame::new(b"D".to_vec(), 2, 2, 0);
        tx.send(SignificantFrame::Frame { frame, before }).await.unwrap();
        drop(tx);

        run(rx, cfg.clone(), clocks, jiff::tz::TimeZone::UTC, io, shut_rx)
            .await
            .unwrap();

        let date_dir = cfg.raw_area().join("2026-07-28");
        let chunk_dir = date_dir.join("1");
        assert_eq!(std::fs::read(chunk_dir.join("frame0.jpg")).unwrap(), b"n1");
        assert_eq!(std::fs::read(chunk_dir.join("frame1.jpg")).unwrap(), b"n2");
        assert_eq!(std::fs::read(chunk_dir.join("frame2.jpg")).unwrap(), b"D");
        assert_eq!(std::fs::read_to_string(chunk_dir.join("meta.txt")).unwrap(), "2 2");
    }

    #[tokio::test]
    async fn event_end_seals_chunk_for_next_event() {
        let tmp = tempdir().unwrap();
        let cfg = cfg(tmp.path());
        let clocks: Arc<dyn Clocks> = Arc::new(SimulatedClocks::new(
            boot_at("2026-07-28"),
        ));
        let (tx, rx) = mpsc::channel(8);
        let (_shut_tx, shut_rx) = base::shutdown::channel();
        let io = Arc::new(FsChunkIo);

        let frame = Frame::new(b"D".to_vec(), 2, 2, 0);
        tx.send(SignificantFrame::Frame { frame, before: vec![] }).await.unwrap();
        tx.send(SignificantFrame::EventEnd).await.unwrap();
        drop(tx);

        run(rx, cfg.clone(), clocks, jiff::tz::TimeZone::UTC, io, shut_rx)
            .await
            .unwrap();

        let date_dir = cfg.raw_area().join("2026-07-28");
        assert!(date_dir.join("1").join("frame0.jpg").exists());
        // EventEnd eagerly rolled to a fresh, empty 2.
        assert!(date_dir.join("2").exists());
        assert_eq!(std::fs::read_dir(date_dir.join("2")).unwrap().count(), 0);
    }
}
