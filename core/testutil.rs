// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2025 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Test harness (spec §4.H): a reusable fixture bundling a tempdir-backed
//! raw/encoded area pair, a deterministic shared-memory writer matching the
//! §6 wire format, a `SimulatedClocks`-backed `Configuration`, and layout
//! assertion helpers.
//!
//! Grounded on `db/testutil.rs`'s `TestDb` fixture struct, which bundles a
//! tempdir, simulated clocks, and a `shutdown::Receiver` for reuse across
//! that crate's test modules; `TestNode` plays the same role here.
//!
//! Compiled unconditionally (not `#[cfg(test)]`-gated) so the dependent
//! `camnode` binary crate's own tests can use it too: `cfg(test)` is
//! per-crate and doesn't propagate to dependencies, the same reason
//! `tempfile` is a regular dependency here rather than a dev-dependency
//! (see `db/testutil.rs` and `db/Cargo.toml` for the precedent).

use crate::config::Configuration;
use base::clock::SimulatedClocks;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Midnight UTC on `date`. Shared by every module's tests that need a
/// deterministic boot time for date-dir naming.
pub fn boot_at(date: &str) -> jiff::Timestamp {
    let d: jiff::civil::Date = date.parse().expect("valid YYYY-MM-DD");
    d.at(0, 0, 0, 0)
        .to_zoned(jiff::tz::TimeZone::UTC)
        .unwrap()
        .timestamp()
}

/// A tempdir-backed node fixture: a `Configuration` pointed at fresh raw and
/// encoded areas, plus `SimulatedClocks` booted at a fixed date.
pub struct TestNode {
    _dir: TempDir,
    pub cfg: Arc<Configuration>,
    pub clocks: Arc<SimulatedClocks>,
}

impl TestNode {
    /// Boots at midnight UTC on `date` with `shm_name` "testcam" and default
    /// size/window settings, all under a fresh tempdir.
    pub fn new(date: &str) -> Self {
        let dir = TempDir::new().expect("tempdir");
        let mut cfg = Configuration::default();
        cfg.shm_name = "testcam".to_string();
        cfg.save_path = dir.path().join("save");
        TestNode {
            _dir: dir,
            cfg: Arc::new(cfg),
            clocks: Arc::new(SimulatedClocks::new(boot_at(date))),
        }
    }

    /// Mutates the held `Configuration` before it is read elsewhere; must be
    /// called before any task or layout call captures a clone of `cfg`.
    pub fn with_cfg(mut self, f: impl FnOnce(&mut Configuration)) -> Self {
        let mut cfg = (*self.cfg).clone();
        f(&mut cfg);
        self.cfg = Arc::new(cfg);
        self
    }

    pub fn today(&self) -> jiff::civil::Date {
        self.clocks
            .realtime()
            .to_zoned(jiff::tz::TimeZone::UTC)
            .date()
    }

    pub fn raw_area(&self) -> PathBuf {
        self.cfg.raw_area()
    }

    pub fn encoded_area(&self) -> &Path {
        self.cfg.encoded_area()
    }
}

/// Encodes `(detection, width, height, payload)` into the exact §6
/// shared-memory wire format and writes it to `path` (truncating, matching
/// the capture process's "truncate + mmap + msync" commit described in
/// spec §6).
pub fn write_shm_frame(path: &Path, detection: i8, width: u32, height: u32, payload: &[u8]) {
    let mut buf = Vec::with_capacity(9 + payload.len());
    buf.push(detection as u8);
    buf.extend_from_slice(&width.to_le_bytes());
    buf.extend_from_slice(&height.to_le_bytes());
    buf.extend_from_slice(payload);
    std::fs::write(path, &buf).expect("writing shared-memory test file");
}

/// Asserts that `chunk_dir` contains exactly `frame0.jpg` .. `frame{n-1}.jpg`
/// with the given contents, in order, and nothing else numbered beyond `n`.
pub fn assert_chunk_contents(chunk_dir: &Path, expected: &[&[u8]]) {
    for (i, want) in expected.iter().enumerate() {
        let path = chunk_dir.join(crate::layout::frame_file_name(i as u64));
        let got = std::fs::read(&path)
            .unwrap_or_else(|e| panic!("reading {}: {e}", path.display()));
        assert_eq!(got, *want, "frame {i} contents mismatch in {}", chunk_dir.display());
    }
    let extra = chunk_dir.join(crate::layout::frame_file_name(expected.len() as u64));
    assert!(!extra.exists(), "unexpected extra frame file {}", extra.display());
}

/// Asserts `chunk_dir` holds exactly `n` frame files (ignoring `meta.txt`).
pub fn assert_frame_count(chunk_dir: &Path, n: u64) {
    for i in 0..n {
        let path = chunk_dir.join(crate::layout::frame_file_name(i));
        assert!(path.exists(), "missing {}", path.display());
    }
    assert!(
        !chunk_dir.join(crate::layout::frame_file_name(n)).exists(),
        "chunk {} has more than {n} frames",
        chunk_dir.display()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_derives_raw_and_encoded_areas() {
        let node = TestNode::new("2026-07-28");
        assert_eq!(node.today().to_string(), "2026-07-28");
        assert!(node.raw_area().to_string_lossy().ends_with("save_testcam"));
        assert!(node.encoded_area().to_string_lossy().ends_with("save"));
    }

    #[test]
    fn write_shm_frame_round_trips_through_decode() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("shm");
        write_shm_frame(&path, -1, 3, 4, b"abc");
        let data = std::fs::read(&path).unwrap();
        let (detection, w, h, payload) = crate::shm::decode_frame(&data).unwrap();
        assert_eq!(detection, -1);
        assert_eq!((w, h), (3, 4));
        assert_eq!(payload, b"abc");
    }

    #[test]
    fn chunk_assertion_helpers_catch_mismatches() {
        let tmp = TempDir::new().unwrap();
        let chunk = tmp.path().join("0");
        std::fs::create_dir_all(&chunk).unwrap();
        crate::layout::write_frame_file(&chunk, 0, b"a").unwrap();
        crate::layout::write_frame_file(&chunk, 1, b"bb").unwrap();
        assert_frame_count(&chunk, 2);
        assert_chunk_contents(&chunk, &[b"a", b"bb"]);
    }
}
