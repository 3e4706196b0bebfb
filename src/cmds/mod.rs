// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2016 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use bpaf::Parser;
use std::path::PathBuf;

pub mod check;
pub mod init;
pub mod run;

const DEFAULT_CONFIG_PATH: &str = "/etc/camnode.toml";

/// Shared `--config` argument: every subcommand loads the same
/// [`camnode_core::Configuration`] layering (defaults, TOML file, env vars).
fn config_path() -> impl Parser<PathBuf> {
    bpaf::long("config")
        .help("Path to the TOML configuration file.")
        .argument::<PathBuf>("PATH")
        .fallback(DEFAULT_CONFIG_PATH.into())
        .debug_fallback()
}
