// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2018-2020 The Moonfire NVR Authors
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Subcommand to sanity-check a node's configuration and on-disk layout
//! without starting the pipeline.

use base::Error;
use bpaf::Bpaf;
use camnode_core::Configuration;
use std::path::PathBuf;
use tracing::{info, warn};

/// Checks configuration and on-disk layout for errors, without starting the pipeline.
#[derive(Bpaf, Debug)]
#[bpaf(command("check"))]
pub struct Args {
    #[bpaf(external(super::config_path))]
    config: PathBuf,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let cfg = Configuration::load(Some(&args.config))?;
    let mut problems = 0u32;

    let shm_path = cfg.shm_path();
    if !shm_path.exists() {
        warn!(
            path = %shm_path.display(),
            "shared-memory file does not exist yet; the capture process may not have started"
        );
    }

    let raw_area = cfg.raw_area();
    match walk_raw_area(&raw_area) {
        Ok(summary) => {
            info!(
                dates = summary.dates,
                chunks = summary.chunks,
                bytes = summary.bytes,
                "raw area scanned"
            );
            if summary.bytes >= cfg.save_dir_max_size_bytes {
                warn!(
                    bytes = summary.bytes,
                    budget = cfg.save_dir_max_size_bytes,
                    "raw area already over its size budget"
                );
                problems += 1;
            }
            for bad in summary.malformed {
                warn!(entry = %bad, "unrecognized entry under raw area");
                problems += 1;
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %raw_area.display(), "raw area does not exist yet");
        }
        Err(e) => {
            warn!(path = %raw_area.display(), error = %e, "unable to scan raw area");
            problems += 1;
        }
    }

    let encoded_area = cfg.encoded_area();
    match camnode_core::layout::dir_size(encoded_area) {
        Ok(bytes) => {
            info!(bytes, "encoded area scanned");
            if bytes >= cfg.converted_video_space_bytes {
                warn!(
                    bytes,
                    budget = cfg.converted_video_space_bytes,
                    "encoded area already over its size budget"
                );
                problems += 1;
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %encoded_area.display(), "encoded area does not exist yet");
        }
        Err(e) => {
            warn!(path = %encoded_area.display(), error = %e, "unable to scan encoded area");
            problems += 1;
        }
    }

    if !encoder_on_path(&cfg.encoder_binary) {
        warn!(
            binary = %cfg.encoder_binary.display(),
            "encoder binary not found on $PATH (and not an absolute/relative path to an existing file)"
        );
        problems += 1;
    }

    if problems == 0 {
        info!("no problems found");
        Ok(0)
    } else {
        warn!(problems, "problems found");
        Ok(1)
    }
}

struct RawAreaSummary {
    dates: usize,
    chunks: usize,
    bytes: u64,
    malformed: Vec<String>,
}

/// Walks the raw area, confirming every top-level entry is a `YYYY-MM-DD`
/// date directory, without otherwise duplicating `camnode_core::layout`'s
/// own parsing (this is a read-only report, not a repair tool).
fn walk_raw_area(raw_area: &std::path::Path) -> std::io::Result<RawAreaSummary> {
    let mut summary = RawAreaSummary {
        dates: 0,
        chunks: 0,
        bytes: 0,
        malformed: Vec::new(),
    };
    for entry in std::fs::read_dir(raw_area)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !entry.file_type()?.is_dir() || jiff::civil::Date::strptime("%Y-%m-%d", &*name).is_err()
        {
            summary.malformed.push(name.into_owned());
            continue;
        }
        summary.dates += 1;
        for chunk in std::fs::read_dir(entry.path())? {
            let chunk = chunk?;
            summary.chunks += 1;
            summary.bytes += camnode_core::layout::dir_size(&chunk.path())?;
        }
    }
    Ok(summary)
}

fn encoder_on_path(binary: &std::path::Path) -> bool {
    if binary.components().count() > 1 {
        return binary.is_file();
    }
    let Some(path_var) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path_var).any(|dir| dir.join(binary).is_file())
}
