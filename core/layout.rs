// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2025 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! On-disk layout of the raw and encoded areas, and the retention
//! primitives (sizing, eviction, skip-set) the encoder supervisor drives.
//!
//! Raw area (`Configuration::raw_area`): `<date>/<n>/frame<i>.jpg`.
//! Encoded area (`Configuration::encoded_area`): `<date>-<n>.mp4`.
//!
//! Grounded on `original_source/rtsp/broadcaster/watcher/disc_utils.go`'s
//! `DirSize`/`GetNewFileIndex`/`TouchDirAndGetIterator`, and on
//! `db/dir/mod.rs`'s `Fd` RAII wrapper and `parse_id` numeric-filename idiom
//! for the id parsing (generalized here to plain `std::fs`, since this
//! layout has no need for raw directory file descriptors).

use base::{bail, Error};
use std::collections::BTreeSet;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

const CHUNK_DIR_PREFIX: &str = "";
const FRAME_FILE_PREFIX: &str = "frame";
const FRAME_FILE_SUFFIX: &str = ".jpg";
const ENCODED_FILE_SUFFIX: &str = ".mp4";
const META_FILE_NAME: &str = "meta.txt";

/// Directory mode for newly-created date/chunk directories (spec §4.B).
const CHUNK_DIR_MODE: u32 = 0o755;
/// File mode for newly-written frame and metadata files (spec §4.D).
const FRAME_FILE_MODE: u32 = 0o644;

fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

/// Parses a `<prefix>NNN<suffix>` filename into `NNN`, as in
/// `db/dir/mod.rs::parse_id`. Returns `None` if it doesn't match exactly
/// (no extra characters, no leading zeros beyond a bare `0`).
fn parse_id(name: &str, prefix: &str, suffix: &str) -> Option<u64> {
    let rest = name.strip_prefix(prefix)?;
    let digits = rest.strip_suffix(suffix)?;
    if digits.is_empty() || (digits.len() > 1 && digits.starts_with('0')) {
        return None;
    }
    digits.parse().ok()
}

/// A chunk directory: `<date-dir>/<index>/`, holding a capped-size run
/// of per-frame JPEGs plus their significant-frame context.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkDir {
    pub path: PathBuf,
    pub index: u64,
}

impl ChunkDir {
    fn dir_name(index: u64) -> String {
        format!("{CHUNK_DIR_PREFIX}{index}")
    }

    /// The date directory's name this chunk lives under, e.g. `2026-07-28`.
    pub fn date_name(&self) -> Option<&str> {
        self.path.parent().and_then(|p| p.file_name())?.to_str()
    }
}

/// Name for a date directory, `YYYY-MM-DD` in the given zone.
pub fn date_dir_name(ts: jiff::Timestamp, zone: &jiff::tz::TimeZone) -> String {
    ts.to_zoned(zone.clone()).date().to_string()
}

/// Recursive on-disk size of `path`, in bytes, following
/// `disc_utils.go::DirSize`'s `stat.Blocks * 512` convention (falls back to
/// the file's logical length for filesystems that don't populate `st_blocks`,
/// e.g. some overlay/tmpfs configurations).
pub fn dir_size(path: &Path) -> std::io::Result<u64> {
    let mut total = 0u64;
    let mut stack = vec![path.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        for entry in entries {
            let entry = entry?;
            let meta = entry.metadata()?;
            if meta.is_dir() {
                stack.push(entry.path());
            } else {
                let blocks_bytes = meta.blocks().saturating_mul(512);
                total += if blocks_bytes > 0 { blocks_bytes } else { meta.len() };
            }
        }
    }
    Ok(total)
}

/// Lists the date directories under `area`, sorted oldest-first
/// (`YYYY-MM-DD` sorts lexically, so a plain string sort suffices).
pub fn list_date_dirs(area: &Path) -> std::io::Result<Vec<String>> {
    let mut names = BTreeSet::new();
    match std::fs::read_dir(area) {
        Ok(entries) => {
            for entry in entries {
                let entry = entry?;
                if entry.file_type()?.is_dir() {
                    if let Some(name) = entry.file_name().to_str() {
                        if jiff::civil::Date::strptime("%Y-%m-%d", name).is_ok() {
                            names.insert(name.to_string());
                        }
                    }
                }
            }
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }?;
    Ok(names.into_iter().collect())
}

/// Lists the chunk directories under `date_dir`, sorted oldest-first by
/// index.
pub fn list_chunk_dirs(date_dir: &Path) -> std::io::Result<Vec<ChunkDir>> {
    let mut chunks = Vec::new();
    match std::fs::read_dir(date_dir) {
        Ok(entries) => {
            for entry in entries {
                let entry = entry?;
                if !entry.file_type()?.is_dir() {
                    continue;
                }
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if let Some(index) = parse_id(name, CHUNK_DIR_PREFIX, "") {
                    chunks.push(ChunkDir { path: entry.path(), index });
                }
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    chunks.sort_by_key(|c| c.index);
    Ok(chunks)
}

/// Returns the next unused frame index in `chunk_dir`, per
/// `disc_utils.go::GetNewFileIndex` (`max existing index + 1`, or `0` if
/// empty).
pub fn next_frame_index(chunk_dir: &Path) -> std::io::Result<u64> {
    let mut max = None;
    match std::fs::read_dir(chunk_dir) {
        Ok(entries) => {
            for entry in entries {
                let entry = entry?;
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if let Some(i) = parse_id(name, FRAME_FILE_PREFIX, FRAME_FILE_SUFFIX) {
                    max = Some(max.map_or(i, |m: u64| m.max(i)));
                }
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    Ok(max.map_or(0, |m| m + 1))
}

pub fn frame_file_name(index: u64) -> String {
    format!("{FRAME_FILE_PREFIX}{index}{FRAME_FILE_SUFFIX}")
}

/// Encoded output filename: `<YYYY-MM-DD>-<N>.mp4`, a flat file directly
/// under the encoded area (spec §6 "Encoded directory layout").
pub fn encoded_file_name(date: &str, chunk_index: u64) -> String {
    format!("{date}-{chunk_index}{ENCODED_FILE_SUFFIX}")
}

/// Parses an encoded filename's date prefix and chunk index: "the first
/// three dash-separated tokens" per spec §4.B, e.g. `2026-07-28-3.mp4` ->
/// (`"2026-07-28"`, `3`).
fn parse_encoded_file_name(name: &str) -> Option<(String, u64)> {
    let stem = name.strip_suffix(ENCODED_FILE_SUFFIX)?;
    let mut parts = stem.splitn(4, '-');
    let y = parts.next()?;
    let m = parts.next()?;
    let d = parts.next()?;
    let idx = parts.next()?;
    let idx: u64 = idx.parse().ok()?;
    Some((format!("{y}-{m}-{d}"), idx))
}

/// Selects the active chunk directory under `date_dir` to keep appending
/// frames to: the newest chunk if it's under `max_chunk_size_bytes`,
/// otherwise a freshly created one with the next index. Creates `date_dir`
/// and the chosen chunk directory if missing. ChunkDir indices start at 1
/// (spec §3: "a directory whose name is a positive integer").
///
/// Mirrors `disc_utils.go::TouchDirAndGetIterator`'s size-threshold loop.
pub fn active_chunk_dir(date_dir: &Path, max_chunk_size_bytes: u64) -> Result<ChunkDir, Error> {
    std::fs::create_dir_all(date_dir)
        .map_err(|e| base::err!(Internal, msg("creating {}", date_dir.display()), source(e)))?;
    let _ = set_mode(date_dir, CHUNK_DIR_MODE);
    let existing = list_chunk_dirs(date_dir)
        .map_err(|e| base::err!(Internal, msg("listing {}", date_dir.display()), source(e)))?;
    if let Some(newest) = existing.last() {
        let size = dir_size(&newest.path)
            .map_err(|e| base::err!(Internal, msg("sizing {}", newest.path.display()), source(e)))?;
        if size < max_chunk_size_bytes {
            return Ok(newest.clone());
        }
    }
    let index = existing.last().map_or(1, |c| c.index + 1);
    create_chunk_dir(date_dir, index)
}

/// Unconditionally creates the next ChunkDir under `date_dir`, ignoring the
/// current active chunk's size. Used to seal a chunk early once an event's
/// post-event countdown elapses, so the next event starts in a fresh chunk
/// (spec §4.C "When n reaches 0...").
pub fn force_new_chunk_dir(date_dir: &Path) -> Result<ChunkDir, Error> {
    std::fs::create_dir_all(date_dir)
        .map_err(|e| base::err!(Internal, msg("creating {}", date_dir.display()), source(e)))?;
    let _ = set_mode(date_dir, CHUNK_DIR_MODE);
    let existing = list_chunk_dirs(date_dir)
        .map_err(|e| base::err!(Internal, msg("listing {}", date_dir.display()), source(e)))?;
    let index = existing.last().map_or(1, |c| c.index + 1);
    create_chunk_dir(date_dir, index)
}

fn create_chunk_dir(date_dir: &Path, index: u64) -> Result<ChunkDir, Error> {
    let path = date_dir.join(ChunkDir::dir_name(index));
    std::fs::create_dir(&path)
        .map_err(|e| base::err!(Internal, msg("creating {}", path.display()), source(e)))?;
    let _ = set_mode(&path, CHUNK_DIR_MODE);
    Ok(ChunkDir { path, index })
}

/// Writes `payload` as `frame<index>.jpg` under `chunk_dir`, with `0644`
/// permissions (spec §4.D).
pub fn write_frame_file(chunk_dir: &Path, index: u64, payload: &[u8]) -> Result<PathBuf, Error> {
    let path = chunk_dir.join(frame_file_name(index));
    std::fs::write(&path, payload)
        .map_err(|e| base::err!(Internal, msg("writing {}", path.display()), source(e)))?;
    let _ = set_mode(&path, FRAME_FILE_MODE);
    Ok(path)
}

/// Writes `meta.txt` (`"<width> <height>"`) under `chunk_dir` unless one
/// already exists (spec §4.D step 5).
pub fn write_meta_if_absent(chunk_dir: &Path, width: u32, height: u32) -> Result<(), Error> {
    let path = chunk_dir.join(META_FILE_NAME);
    if path.exists() {
        return Ok(());
    }
    std::fs::write(&path, format!("{width} {height}"))
        .map_err(|e| base::err!(Internal, msg("writing {}", path.display()), source(e)))?;
    let _ = set_mode(&path, FRAME_FILE_MODE);
    Ok(())
}

/// True once `current_total_bytes` has reached `limit - 2*chunk_size`
/// (falling back to `limit` if that would underflow); the shared shape of
/// the raw-area and encoded-area "close to limit" tests (spec §4.B).
pub fn close_to_limit(current_total_bytes: u64, limit: u64, chunk_size: u64) -> bool {
    let threshold = limit.checked_sub(2 * chunk_size).unwrap_or(limit);
    current_total_bytes >= threshold
}

/// The set of date-directory names exempt from both encoding and deletion:
/// today, plus the `convert_frames_before_days` preceding dates.
///
/// Named distinctly from `Configuration::convert_frames_before_days`'s
/// environment variable (see `core::config`'s doc comment) to avoid the
/// upstream source's variable-name collision between "days before encoding"
/// and "frames before event" (Open Question, resolved as distinct knobs).
pub fn skip_set(today: jiff::civil::Date, convert_frames_before_days: u32) -> BTreeSet<String> {
    let mut set = BTreeSet::new();
    set.insert(today.to_string());
    let mut d = today;
    for _ in 0..convert_frames_before_days {
        d = match d.yesterday() {
            Ok(d) => d,
            Err(_) => break,
        };
        set.insert(d.to_string());
    }
    set
}

/// Removes and returns the oldest chunk directory not in `skip`, scanning
/// date directories oldest-first. Returns `Ok(None)` if nothing eligible
/// exists.
pub fn evict_oldest_chunk_dir(
    raw_area: &Path,
    skip: &BTreeSet<String>,
) -> Result<Option<ChunkDir>, Error> {
    for date in list_date_dirs(raw_area)
        .map_err(|e| base::err!(Internal, msg("listing {}", raw_area.display()), source(e)))?
    {
        if skip.contains(&date) {
            continue;
        }
        let date_dir = raw_area.join(&date);
        let mut chunks = list_chunk_dirs(&date_dir)
            .map_err(|e| base::err!(Internal, msg("listing {}", date_dir.display()), source(e)))?;
        if chunks.is_empty() {
            let _ = std::fs::remove_dir(&date_dir);
            continue;
        }
        let victim = chunks.remove(0);
        std::fs::remove_dir_all(&victim.path).map_err(|e| {
            base::err!(Internal, msg("removing {}", victim.path.display()), source(e))
        })?;
        return Ok(Some(victim));
    }
    Ok(None)
}

/// Removes and returns the path of the oldest encoded video file not under
/// a skipped date.
///
/// Encoded files are flat siblings directly under `encoded_area` (spec §6),
/// so this lists that single directory rather than walking per-date
/// subdirectories as [`evict_oldest_chunk_dir`] does for the raw area.
/// Sorting by filename ascending is chronological because the date prefix
/// sorts lexically (spec §4.B).
pub fn evict_oldest_encoded_file(
    encoded_area: &Path,
    skip: &BTreeSet<String>,
) -> Result<Option<PathBuf>, Error> {
    let mut files: Vec<(String, PathBuf)> = Vec::new();
    match std::fs::read_dir(encoded_area) {
        Ok(entries) => {
            for entry in entries {
                let entry =
                    entry.map_err(|e| base::err!(Internal, msg("reading dir entry"), source(e)))?;
                if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                    continue;
                }
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                let Some((date, _idx)) = parse_encoded_file_name(name) else { continue };
                if skip.contains(&date) {
                    continue;
                }
                files.push((name.to_string(), entry.path()));
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            bail!(Internal, msg("listing {}", encoded_area.display()), source(e))
        }
    }
    files.sort_by(|a, b| a.0.cmp(&b.0));
    let Some((_, victim)) = files.into_iter().next() else {
        return Ok(None);
    };
    std::fs::remove_file(&victim)
        .map_err(|e| base::err!(Internal, msg("removing {}", victim.display()), source(e)))?;
    Ok(Some(victim))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn encoded_file_name_roundtrips_through_parse() {
        let name = encoded_file_name("2026-07-28", 3);
        assert_eq!(name, "2026-07-28-3.mp4");
        assert_eq!(
            parse_encoded_file_name(&name),
            Some(("2026-07-28".to_string(), 3))
        );
    }

    #[test]
    fn evict_oldest_encoded_file_is_flat_and_chronological() {
        let tmp = tempdir().unwrap();
        let area = tmp.path();
        for name in ["2026-07-26-0.mp4", "2026-07-27-0.mp4", "2026-07-28-0.mp4"] {
            std::fs::write(area.join(name), b"x").unwrap();
        }
        let skip = skip_set("2026-07-28".parse().unwrap(), 1);
        let victim = evict_oldest_encoded_file(area, &skip).unwrap().unwrap();
        assert_eq!(victim.file_name().unwrap().to_str().unwrap(), "2026-07-26-0.mp4");
        assert!(area.join("2026-07-27-0.mp4").exists());
        assert!(area.join("2026-07-28-0.mp4").exists());
    }

    #[test]
    fn parse_id_rejects_leading_zero_and_junk() {
        assert_eq!(parse_id("0", "chunk_", ""), Some(0));
        assert_eq!(parse_id("12", "chunk_", ""), Some(12));
        assert_eq!(parse_id("012", "chunk_", ""), None);
        assert_eq!(parse_id("chunkX12", "chunk_", ""), None);
        assert_eq!(parse_id("frame7.jpg", "frame_", ".jpg"), Some(7));
    }

    #[test]
    fn active_chunk_dir_reuses_small_then_rolls_over() {
        let tmp = tempdir().unwrap();
        let date_dir = tmp.path().join("2026-07-28");
        let c0 = active_chunk_dir(&date_dir, 1024).unwrap();
        assert_eq!(c0.index, 1);
        // still small: reused.
        let c0b = active_chunk_dir(&date_dir, 1024).unwrap();
        assert_eq!(c0b.index, 1);
        // write enough to exceed the cap.
        std::fs::write(c0.path.join("frame0.jpg"), vec![0u8; 2048]).unwrap();
        let c1 = active_chunk_dir(&date_dir, 1024).unwrap();
        assert_eq!(c1.index, 2);
    }

    #[test]
    fn next_frame_index_increments() {
        let tmp = tempdir().unwrap();
        std::fs::create_dir_all(tmp.path()).unwrap();
        assert_eq!(next_frame_index(tmp.path()).unwrap(), 0);
        std::fs::write(tmp.path().join(frame_file_name(0)), b"x").unwrap();
        std::fs::write(tmp.path().join(frame_file_name(5)), b"x").unwrap();
        assert_eq!(next_frame_index(tmp.path()).unwrap(), 6);
    }

    #[test]
    fn skip_set_covers_today_and_preceding_days() {
        let today: jiff::civil::Date = "2026-07-28".parse().unwrap();
        let set = skip_set(today, 2);
        assert!(set.contains("2026-07-28"));
        assert!(set.contains("2026-07-27"));
        assert!(set.contains("2026-07-26"));
        assert!(!set.contains("2026-07-25"));
    }

    #[test]
    fn close_to_limit_uses_two_chunk_margin() {
        assert!(!close_to_limit(0, 100, 10));
        assert!(!close_to_limit(79, 100, 10));
        assert!(close_to_limit(80, 100, 10));
        // underflowing margin falls back to the bare limit.
        assert!(!close_to_limit(50, 10, 10));
        assert!(close_to_limit(10, 10, 10));
    }

    #[test]
    fn force_new_chunk_dir_ignores_size() {
        let tmp = tempdir().unwrap();
        let date_dir = tmp.path().join("2026-07-28");
        let c0 = active_chunk_dir(&date_dir, 1 << 30).unwrap();
        assert_eq!(c0.index, 1);
        // nowhere near the size cap, but force_new_chunk_dir rolls anyway.
        let c1 = force_new_chunk_dir(&date_dir).unwrap();
        assert_eq!(c1.index, 2);
        assert!(std::fs::read_dir(&c1.path).unwrap().next().is_none());
    }

    #[test]
    fn write_frame_file_and_meta_roundtrip() {
        let tmp = tempdir().unwrap();
        std::fs::create_dir_all(tmp.path()).unwrap();
        write_frame_file(tmp.path(), 0, b"jpegbytes").unwrap();
        write_meta_if_absent(tmp.path(), 640, 480).unwrap();
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("meta.txt")).unwrap(),
            "640 480"
        );
        // a second call with different dimensions must not overwrite.
        write_meta_if_absent(tmp.path(), 1, 1).unwrap();
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("meta.txt")).unwrap(),
            "640 480"
        );
    }

    #[test]
    fn evict_oldest_chunk_dir_skips_recent_dates() {
        let tmp = tempdir().unwrap();
        let raw = tmp.path();
        for (date, chunk) in [("2026-07-26", 0), ("2026-07-27", 0), ("2026-07-28", 0)] {
            let d = raw.join(date).join(format!("{chunk}"));
            std::fs::create_dir_all(&d).unwrap();
        }
        let skip = skip_set("2026-07-28".parse().unwrap(), 1);
        let victim = evict_oldest_chunk_dir(raw, &skip).unwrap().unwrap();
        assert_eq!(victim.date_name(), Some("2026-07-26"));
        assert!(!victim.path.exists());
        // both skipped dates remain untouched.
        assert!(raw.join("2026-07-27").join("0").exists());
        assert!(raw.join("2026-07-28").join("0").exists());
    }
}
