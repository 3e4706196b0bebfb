// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2025 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Core domain types shared across the pipeline: a single decoded [`Frame`],
//! a batch of them as fanned out to subscribers, the [`SignificantFrame`]
//! unit the writer persists, and the [`FpsEstimator`] sliding window used to
//! report observed capture rate.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// One frame read off the shared-memory ring, with its wire-format
/// metadata. `payload` is the raw encoded image (JPEG) bytes.
///
/// `Arc`-wrapped payload so a single read can be cheaply cloned into the
/// fan-out hub, the ring buffer, and the significant-frame channel without
/// copying image bytes three times.
#[derive(Clone, Debug)]
pub struct Frame {
    pub payload: Arc<[u8]>,
    pub width: u32,
    pub height: u32,
    /// Detection tag carried by the capture process: `-1` means "no
    /// detection", any other value is an event class (spec §3/§6).
    pub detection: i32,
    /// Instantaneous FPS estimate as of this frame, per [`FpsEstimator`].
    pub observed_fps: f64,
}

/// Sentinel `detection` value meaning "no detection" (spec §3/§6).
pub const NO_DETECTION: i32 = -1;

impl Frame {
    pub fn new(payload: Vec<u8>, width: u32, height: u32, detection: i32) -> Self {
        Frame {
            payload: Arc::from(payload),
            width,
            height,
            detection,
            observed_fps: 0.0,
        }
    }

    /// Whether the capture process's detector flagged this frame.
    pub fn is_detection(&self) -> bool {
        self.detection != NO_DETECTION
    }
}

/// A single frame as broadcast to fan-out subscribers. Currently a thin
/// wrapper around [`Frame`]; kept distinct because subscribers only ever see
/// fanned-out batches, never ring-buffer or significant-frame internals.
#[derive(Clone, Debug)]
pub struct FrameBatch {
    pub frame: Frame,
}

impl From<Frame> for FrameBatch {
    fn from(frame: Frame) -> Self {
        FrameBatch { frame }
    }
}

/// A frame (or lack of one) worth persisting to disk, as produced by the
/// shared-memory reader's event state machine and consumed by the chunk
/// writer.
///
/// Mirrors `original_source/rtsp/broadcaster/watcher/shared_memory.go`'s
/// `SignificantFrame{Data, Detected, Before, After}`, generalized: `before`
/// carries the pre-event window only on the frame that opens an event, and
/// a final marker with `frame: None` closes an event once its post-event
/// countdown has fully elapsed (the source's `Data: nil, After: after`
/// terminal send).
#[derive(Clone, Debug)]
pub enum SignificantFrame {
    /// Opens (or continues) an event: the triggering/continuing frame,
    /// optionally preceded by the buffered pre-event frames (present only
    /// on the frame that transitions Idle -> InEvent).
    Frame {
        frame: Frame,
        before: Vec<Frame>,
    },
    /// Closes an event: the post-event countdown has reached zero.
    EventEnd,
}

/// Sliding-window frames-per-second estimator over the trailing 1 second of
/// arrivals, per spec §3/§4.C.
///
/// Grounded on the same "drop timestamps older than the window" idiom as
/// `db/writer.rs`'s flush-scheduling `BinaryHeap`, simplified to a
/// `VecDeque` since entries here are always popped from the front in
/// arrival (monotonic) order.
#[derive(Debug)]
pub struct FpsEstimator {
    window: Duration,
    arrivals: VecDeque<std::time::Instant>,
}

impl FpsEstimator {
    pub fn new(window: Duration) -> Self {
        FpsEstimator {
            window,
            arrivals: VecDeque::new(),
        }
    }

    /// One-second sliding window, the default per spec §4.C.
    pub fn with_default_window() -> Self {
        Self::new(Duration::from_secs(1))
    }

    /// Records an arrival at `now` and returns the updated FPS estimate:
    /// the count of arrivals within the trailing window, divided by the
    /// window length in seconds.
    pub fn record(&mut self, now: std::time::Instant) -> f64 {
        self.arrivals.push_back(now);
        while let Some(&front) = self.arrivals.front() {
            if now.duration_since(front) > self.window {
                self.arrivals.pop_front();
            } else {
                break;
            }
        }
        self.arrivals.len() as f64 / self.window.as_secs_f64()
    }

    /// Current estimate without recording a new arrival (e.g. for a
    /// `latest_fps()` query between frames).
    pub fn current(&self, now: std::time::Instant) -> f64 {
        let count = self
            .arrivals
            .iter()
            .rev()
            .take_while(|&&t| now.duration_since(t) <= self.window)
            .count();
        count as f64 / self.window.as_secs_f64()
    }
}
