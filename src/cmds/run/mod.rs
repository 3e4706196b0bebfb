// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2022 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use base::{bail, Error};
use bpaf::Bpaf;
use camnode_core::{Configuration, Pipeline};
use std::path::PathBuf;
use tracing::info;
use tracing::warn;
use tokio::signal::unix::{signal, SignalKind};

/// Starts the ingest/retention pipeline and runs until a shutdown signal.
#[derive(Bpaf, Debug)]
#[bpaf(command("run"))]
pub struct Args {
    #[bpaf(external(super::config_path))]
    config: PathBuf,

    /// The number of worker threads used by the asynchronous runtime.
    /// Defaults to the number of cores on the system.
    #[bpaf(long, argument("N"), optional)]
    worker_threads: Option<usize>,
}

// These are used to get the name of the current time zone (e.g. America/Los_Angeles),
// since date-dir naming (spec SPEC_FULL.md §3 `DateDir`) is wall-clock-local.
// They seem to be correct for Linux and macOS at least.
const LOCALTIME_PATH: &str = "/etc/localtime";
const TIMEZONE_PATH: &str = "/etc/timezone";
const ZONEINFO_PATHS: [&str; 2] = [
    "/usr/share/zoneinfo/",       // Linux, macOS < High Sierra
    "/var/db/timezone/zoneinfo/", // macOS High Sierra
];

fn trim_zoneinfo(path: &str) -> &str {
    for zp in &ZONEINFO_PATHS {
        if let Some(p) = path.strip_prefix(zp) {
            return p;
        }
    }
    path
}

/// Attempts to resolve the local timezone's name, e.g. for logging.
fn resolve_zone() -> Result<String, Error> {
    if let Ok(tz) = ::std::env::var("TZ") {
        let mut p: &str = &tz;

        // Strip an initial `:` if present. Having `TZ` set in this way is a trick to avoid
        // repeated `tzset` calls:
        // https://blog.packagecloud.io/eng/2017/02/21/set-environment-variable-save-thousands-of-system-calls/
        if let Some(rest) = p.strip_prefix(':') {
            p = rest;
        }

        p = trim_zoneinfo(p);

        if !p.starts_with('/') {
            return Ok(p.to_owned());
        }
        if p != LOCALTIME_PATH {
            bail!(InvalidArgument, msg("unable to resolve env TZ={tz} to a timezone"));
        }
    }

    // If `LOCALTIME_PATH` is a symlink, use that. On some systems, it's instead a copy of the
    // desired timezone, which unfortunately doesn't contain its own name.
    match ::std::fs::read_link(LOCALTIME_PATH) {
        Ok(localtime_dest) => {
            let localtime_dest = match localtime_dest.to_str() {
                Some(d) => d,
                None => bail!(
                    InvalidArgument,
                    msg("{LOCALTIME_PATH} symlink destination is invalid UTF-8")
                ),
            };
            let p = trim_zoneinfo(localtime_dest);
            if p.starts_with('/') {
                bail!(
                    InvalidArgument,
                    msg("unable to resolve {LOCALTIME_PATH} symlink destination {localtime_dest} to a timezone")
                );
            }
            return Ok(p.to_owned());
        }
        Err(e) => {
            use ::std::io::ErrorKind;
            if e.kind() != ErrorKind::NotFound && e.kind() != ErrorKind::InvalidInput {
                bail!(
                    InvalidArgument,
                    msg("unable to read {LOCALTIME_PATH} symlink"),
                    source(e)
                );
            }
        }
    };

    // If `TIMEZONE_PATH` is a file, use its contents as the zone name, trimming whitespace.
    match ::std::fs::read_to_string(TIMEZONE_PATH) {
        Ok(z) => Ok(z.trim().to_owned()),
        Err(e) => bail!(
            InvalidArgument,
            msg("unable to resolve timezone from TZ env, {LOCALTIME_PATH}, or {TIMEZONE_PATH}"),
            source(e)
        ),
    }
}

pub fn run(args: Args) -> Result<i32, Error> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(worker_threads) = args.worker_threads {
        builder.worker_threads(worker_threads);
    }
    let rt = builder
        .build()
        .map_err(|e| base::err!(Internal, msg("building tokio runtime"), source(e)))?;
    let r = rt.block_on(async_run(&args.config));

    // tokio normally waits for all spawned tasks to complete, but the
    // pipeline's own `stop()` already joins every task with logging; an
    // immediate (second-signal) shutdown shouldn't block on stragglers.
    rt.shutdown_background();

    r
}

async fn async_run(config_path: &std::path::Path) -> Result<i32, Error> {
    let (shutdown_tx, shutdown_rx) = base::shutdown::channel();
    let mut shutdown_tx = Some(shutdown_tx);

    let mut int =
        signal(SignalKind::interrupt()).map_err(|e| base::err!(Internal, source(e)))?;
    let mut term =
        signal(SignalKind::terminate()).map_err(|e| base::err!(Internal, source(e)))?;

    tokio::pin! {
        let inner = inner(config_path, shutdown_rx);
    }

    tokio::select! {
        _ = int.recv() => {
            info!("received SIGINT; shutting down gracefully. \
                   Send another SIGINT or SIGTERM to shut down immediately.");
            shutdown_tx.take();
        },
        _ = term.recv() => {
            info!("received SIGTERM; shutting down gracefully. \
                   Send another SIGINT or SIGTERM to shut down immediately.");
            shutdown_tx.take();
        },
        result = &mut inner => return result,
    }

    tokio::select! {
        _ = int.recv() => bail!(Cancelled, msg("immediate shutdown due to second signal (SIGINT)")),
        _ = term.recv() => bail!(Cancelled, msg("immediate shutdown due to second signal (SIGTERM)")),
        result = &mut inner => result,
    }
}

async fn inner(config_path: &std::path::Path, shutdown_rx: base::shutdown::Receiver) -> Result<i32, Error> {
    let cfg = Configuration::load(Some(config_path))?;
    info!(shm_name = %cfg.shm_name, save_path = %cfg.save_path.display(), "configuration loaded");

    for dir in [cfg.raw_area(), cfg.encoded_area().to_path_buf()] {
        std::fs::create_dir_all(&dir)
            .map_err(|e| base::err!(Internal, msg("creating {}", dir.display()), source(e)))?;
    }

    let zone = match resolve_zone() {
        Ok(name) => match jiff::tz::TimeZone::get(&name) {
            Ok(z) => {
                info!(zone = %name, "resolved timezone");
                z
            }
            Err(e) => {
                warn!(zone = %name, error = %e, "unrecognized timezone name; falling back to UTC");
                jiff::tz::TimeZone::UTC
            }
        },
        Err(e) => {
            warn!(error = %e.chain(), "unable to resolve local timezone; falling back to UTC");
            jiff::tz::TimeZone::UTC
        }
    };

    let pipeline = Pipeline::start_with(cfg, std::sync::Arc::new(base::clock::RealClocks {}), zone);

    info!("ready: ingesting frames and serving subscribers");
    let _ = shutdown_rx.as_future().await;

    info!("shutting down pipeline");
    pipeline.stop().await;

    info!("exiting");
    Ok(0)
}
