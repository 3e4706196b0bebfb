// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2025 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The shared-memory frame reader: notify -> read -> decode -> publish,
//! plus the "significant frame" event state machine that decides which
//! frames are worth persisting (spec §4.C).
//!
//! Grounded on `src/streamer.rs`'s single long-lived task-loop shape and on
//! `original_source/rtsp/broadcaster/watcher/shared_memory.go` for the wire
//! header layout and the dedup-on-repeat-notify behavior. The `notify`
//! crate only exposes a synchronous callback, so a forwarding thread
//! bridges it into the async `run` loop below -- the same shape the crate's
//! own docs recommend for runtimes that can't poll a std `mpsc::Receiver`
//! directly.

use crate::config::Configuration;
use crate::frame::{Frame, FpsEstimator, SignificantFrame};
use crate::ring::RingBuffer;
use base::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Decodes the shared-memory wire format (spec §6): byte 0 is a signed
/// detection tag, bytes 1..5 and 5..9 are little-endian `u32` width/height,
/// and the remainder is the opaque frame payload.
pub fn decode_frame(data: &[u8]) -> Result<(i32, u32, u32, &[u8]), Error> {
    if data.len() < 9 {
        return Err(base::err!(
            InvalidArgument,
            msg("shared-memory file too short: {} bytes", data.len())
        ));
    }
    let detection = data[0] as i8 as i32;
    let width = u32::from_le_bytes(data[1..5].try_into().unwrap());
    let height = u32::from_le_bytes(data[5..9].try_into().unwrap());
    Ok((detection, width, height, &data[9..]))
}

/// The event state machine's two states (spec §4.C). Kept as an explicit
/// tagged union per SPEC_FULL.md's "Sum types and state" design note,
/// rather than a pair of nullable buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventState {
    Idle,
    /// `remaining` counts frames left in the post-event tail. Reaching 0
    /// on a non-detection frame closes the event.
    InEvent { remaining: u32 },
}

/// The pre-event ring plus the detection/countdown state machine, in
/// isolation from I/O so it can be driven deterministically in tests
/// (spec §8 properties 4-6).
///
/// The source hands every significant message a pointer to the same
/// pre-event ring (spec §9 "Shared ownership of the pre-event ring"); this
/// redesign instead snapshots (clones) the ring's contents into an owned
/// `Vec<Frame>` at the moment an event opens or resets, and clears the ring
/// then and there. That sidesteps needing the writer to reach back into a
/// shared ring at an unspecified later point.
pub struct EventMachine {
    state: EventState,
    pre: RingBuffer<Frame>,
    after_len: u32,
}

impl EventMachine {
    pub fn new(before_capacity: usize, after_len: u32) -> Self {
        EventMachine {
            state: EventState::Idle,
            pre: RingBuffer::new(before_capacity),
            after_len,
        }
    }

    /// Feeds one decoded frame through the state machine, returning the
    /// significant messages it produces, in emission order (zero, one, or
    /// two: a tail frame can also close the event).
    pub fn on_frame(&mut self, frame: Frame) -> Vec<SignificantFrame> {
        let mut out = Vec::with_capacity(1);
        match self.state {
            EventState::Idle => {
                if frame.is_detection() {
                    let before: Vec<Frame> = self.pre.drain_all().collect();
                    self.state = EventState::InEvent {
                        remaining: self.after_len,
                    };
                    out.push(SignificantFrame::Frame { frame, before });
                } else {
                    self.pre.add(frame);
                }
            }
            EventState::InEvent { remaining } => {
                if frame.is_detection() {
                    let before: Vec<Frame> = self.pre.drain_all().collect();
                    self.state = EventState::InEvent {
                        remaining: self.after_len,
                    };
                    out.push(SignificantFrame::Frame { frame, before });
                } else {
                    out.push(SignificantFrame::Frame {
                        frame,
                        before: Vec::new(),
                    });
                    if remaining <= 1 {
                        self.state = EventState::Idle;
                        out.push(SignificantFrame::EventEnd);
                    } else {
                        self.state = EventState::InEvent {
                            remaining: remaining - 1,
                        };
                    }
                }
            }
        }
        out
    }

    #[cfg(test)]
    fn is_idle(&self) -> bool {
        matches!(self.state, EventState::Idle)
    }
}

/// True if `event` is a qualifying notification for `target`: a `Create` or
/// `Modify` event whose path set includes the exact target path (spec
/// §4.C step 1).
fn qualifying(event: &notify::Event, target: &Path) -> bool {
    matches!(
        event.kind,
        notify::EventKind::Create(_) | notify::EventKind::Modify(_)
    ) && event.paths.iter().any(|p| p == target)
}

/// Spawns a `notify` watcher on `target`'s parent directory and bridges its
/// synchronous callback into an async-friendly channel via a forwarding
/// thread. The returned watcher must be kept alive for as long as events
/// are wanted; dropping it (and letting the forwarding thread's channel
/// close) stops the watch.
fn spawn_watch(
    target: &Path,
) -> Result<(notify::RecommendedWatcher, mpsc::UnboundedReceiver<notify::Event>), Error> {
    use notify::Watcher;

    let parent = target.parent().ok_or_else(|| {
        base::err!(InvalidArgument, msg("{} has no parent directory", target.display()))
    })?;
    let (std_tx, std_rx) = std::sync::mpsc::channel::<notify::Event>();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        if let Ok(event) = res {
            let _ = std_tx.send(event);
        }
    })
    .map_err(|e| base::err!(Internal, msg("creating filesystem watcher"), source(e)))?;
    watcher
        .watch(parent, notify::RecursiveMode::NonRecursive)
        .map_err(|e| base::err!(Internal, msg("watching {}", parent.display()), source(e)))?;

    let (async_tx, async_rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        while let Ok(event) = std_rx.recv() {
            if async_tx.send(event).is_err() {
                break;
            }
        }
    });
    Ok((watcher, async_rx))
}

/// Runs the ingest loop until `shutdown_rx` fires or a downstream channel
/// closes. Reads `<shm_root>/<shm_name>` on every qualifying notification,
/// decodes it, deduplicates repeat notifications, updates `fps_tx`,
/// publishes to `frames_tx`, and routes through an [`EventMachine`] to
/// `significant_tx`.
pub async fn run(
    shm_path: PathBuf,
    cfg: Arc<Configuration>,
    frames_tx: mpsc::Sender<Frame>,
    significant_tx: mpsc::Sender<SignificantFrame>,
    fps_tx: watch::Sender<f64>,
    shutdown_rx: base::shutdown::Receiver,
) -> Result<(), Error> {
    let (_watcher, mut events) = spawn_watch(&shm_path)?;
    let mut machine = EventMachine::new(
        cfg.show_what_was_before_frames,
        cfg.show_what_was_after_frames as u32,
    );
    let mut fps = FpsEstimator::with_default_window();
    let mut last_payload: Option<Arc<[u8]>> = None;
    let significant_timeout = std::time::Duration::from_millis(cfg.significant_send_timeout_ms);

    loop {
        let event = tokio::select! {
            biased;
            _ = shutdown_rx.as_future() => return Ok(()),
            ev = events.recv() => match ev {
                Some(ev) => ev,
                None => return Ok(()), // watcher thread exited.
            },
        };
        if !qualifying(&event, &shm_path) {
            continue;
        }

        let data = match tokio::fs::read(&shm_path).await {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, path = %shm_path.display(), "ingest: reading shared-memory file");
                continue;
            }
        };
        let (detection, width, height, payload) = match decode_frame(&data) {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e.chain(), "ingest: decoding shared-memory file");
                continue;
            }
        };
        if last_payload.as_deref() == Some(payload) {
            continue; // duplicate notification of the same commit.
        }
        let payload: Arc<[u8]> = Arc::from(payload);
        last_payload = Some(payload.clone());

        let observed_fps = fps.record(Instant::now());
        let _ = fps_tx.send(observed_fps);

        let frame = Frame {
            payload,
            width,
            height,
            detection,
            observed_fps,
        };

        if frames_tx.send(frame.clone()).await.is_err() {
            return Ok(());
        }

        for sig in machine.on_frame(frame) {
            match tokio::time::timeout(significant_timeout, significant_tx.send(sig)).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return Ok(()),
                Err(_) => debug!("ingest: dropping significant frame, writer did not keep up"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(detection: i32, data: &[u8]) -> Frame {
        Frame::new(data.to_vec(), 2, 2, detection)
    }

    #[test]
    fn decode_frame_splits_header_and_payload() {
        let mut buf = vec![0u8; 9];
        buf[0] = 0; // detection
        buf[1..5].copy_from_slice(&2u32.to_le_bytes());
        buf[5..9].copy_from_slice(&2u32.to_le_bytes());
        buf.extend_from_slice(b"AB");
        let (detection, w, h, payload) = decode_frame(&buf).unwrap();
        assert_eq!(detection, 0);
        assert_eq!((w, h), (2, 2));
        assert_eq!(payload, b"AB");
    }

    #[test]
    fn decode_frame_rejects_short_input() {
        assert!(decode_frame(&[0u8; 8]).is_err());
    }

    #[test]
    fn decode_frame_reads_negative_detection_as_sentinel() {
        let mut buf = vec![0u8; 9];
        buf[0] = 0xFF; // -1 as i8
        let (detection, ..) = decode_frame(&buf).unwrap();
        assert_eq!(detection, -1);
    }

    /// Property 5 / scenario S2 (spec §8): detection preceded by M
    /// non-detection frames yields one significant message carrying the
    /// whole pre-buffer, in order.
    #[test]
    fn pre_event_capture() {
        let mut m = EventMachine::new(3, 3);
        assert!(m.on_frame(frame(-1, b"n1")).is_empty());
        assert!(m.on_frame(frame(-1, b"n2")).is_empty());
        assert!(m.on_frame(frame(-1, b"n3")).is_empty());
        let out = m.on_frame(frame(0, b"D"));
        assert_eq!(out.len(), 1);
        match &out[0] {
            SignificantFrame::Frame { frame, before } => {
                assert_eq!(frame.payload.as_ref(), b"D");
                let got: Vec<&[u8]> = before.iter().map(|f| f.payload.as_ref()).collect();
                assert_eq!(got, vec![b"n1" as &[u8], b"n2", b"n3"]);
            }
            other => panic!("expected Frame, got {other:?}"),
        }
    }

    /// Scenario S3 (spec §8): detection, then exactly `after_len` tail
    /// frames, then a further non-detection frame with no significant
    /// message (it only updates the now-idle pre-buffer).
    #[test]
    fn post_event_tail_then_idle() {
        let mut m = EventMachine::new(3, 3);
        let out = m.on_frame(frame(0, b"D1"));
        assert_eq!(out.len(), 1);

        let out = m.on_frame(frame(-1, b"t1"));
        assert_eq!(out.len(), 1);
        assert!(m.on_frame(frame(-1, b"t2")).len() == 1);
        let out = m.on_frame(frame(-1, b"t3"));
        // the third tail frame also closes the event.
        assert_eq!(out.len(), 2);
        assert!(matches!(out[1], SignificantFrame::EventEnd));
        assert!(m.is_idle());

        // trailing non-detection frame: idle again, no significant message,
        // but it is now buffered in the pre-event ring.
        assert!(m.on_frame(frame(-1, b"n")).is_empty());
    }

    /// Scenario S4 (spec §8): a second detection before the countdown
    /// elapses resets the countdown and emits a fresh `pre = Some(..)`.
    #[test]
    fn back_to_back_events_reset_countdown() {
        let mut m = EventMachine::new(3, 3);
        m.on_frame(frame(0, b"D1"));
        let out = m.on_frame(frame(1, b"D2"));
        assert_eq!(out.len(), 1);
        match &out[0] {
            SignificantFrame::Frame { frame, before } => {
                assert_eq!(frame.payload.as_ref(), b"D2");
                assert!(before.is_empty()); // nothing buffered between D1 and D2.
            }
            other => panic!("expected Frame, got {other:?}"),
        }
        // the countdown was reset: three more tail frames needed to close.
        assert!(m.on_frame(frame(-1, b"t1")).len() == 1);
        assert!(m.on_frame(frame(-1, b"t2")).len() == 1);
        let out = m.on_frame(frame(-1, b"t3"));
        assert_eq!(out.len(), 2);
        assert!(m.is_idle());
    }

    #[test]
    fn pre_event_ring_never_grows_while_in_event() {
        let mut m = EventMachine::new(2, 5);
        m.on_frame(frame(0, b"D"));
        for _ in 0..4 {
            m.on_frame(frame(-1, b"t"));
        }
        // still in event (5 after-frames configured, only 4 consumed); the
        // ring must still be empty since InEvent never appends to it.
        assert_eq!(m.pre.size(), 0);
    }
}
