// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2020 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Subcommand to lay down a fresh node's configuration file and directories.

use base::{bail, Error};
use bpaf::Bpaf;
use camnode_core::Configuration;
use std::path::PathBuf;
use tracing::info;

/// Writes a starter configuration file and creates the raw/encoded area directories.
#[derive(Bpaf, Debug)]
#[bpaf(command("init"))]
pub struct Args {
    #[bpaf(external(super::config_path))]
    config: PathBuf,

    /// Name of the shared-memory rendezvous file under `/dev/shm`.
    #[bpaf(long, argument("NAME"))]
    shm_name: String,

    /// Base path under which the raw and encoded areas are created.
    #[bpaf(long, argument("PATH"))]
    save_path: PathBuf,
}

const TEMPLATE: &str = "\
# camnode configuration. See `camnode check --config <this file>` to validate.
shm_name = \"{shm_name}\"
save_path = \"{save_path}\"
";

pub fn run(args: Args) -> Result<i32, Error> {
    if args.config.exists() {
        bail!(
            AlreadyExists,
            msg("configuration file {} already exists", args.config.display())
        );
    }

    let contents = TEMPLATE
        .replace("{shm_name}", &args.shm_name)
        .replace("{save_path}", &args.save_path.display().to_string());
    std::fs::write(&args.config, contents).map_err(|e| {
        base::err!(
            Internal,
            msg("writing {}", args.config.display()),
            source(e)
        )
    })?;
    info!(path = %args.config.display(), "wrote configuration file");

    let cfg = Configuration::load(Some(&args.config))?;
    for dir in [cfg.raw_area(), cfg.encoded_area().to_path_buf()] {
        std::fs::create_dir_all(&dir).map_err(|e| {
            base::err!(Internal, msg("creating {}", dir.display()), source(e))
        })?;
        info!(path = %dir.display(), "created directory");
    }

    info!("node initialized");
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn writes_config_and_creates_areas() {
        let dir = tempdir().unwrap();
        let config = dir.path().join("camnode.toml");
        let save_path = dir.path().join("save");
        let args = Args {
            config: config.clone(),
            shm_name: "cam0".to_string(),
            save_path: save_path.clone(),
        };
        assert_eq!(run(args).unwrap(), 0);

        let written = std::fs::read_to_string(&config).unwrap();
        assert!(written.contains("shm_name = \"cam0\""));
        assert!(written.contains(&save_path.display().to_string()));

        let cfg = Configuration::load(Some(&config)).unwrap();
        assert!(cfg.raw_area().is_dir());
        assert!(cfg.encoded_area().is_dir());
    }

    #[test]
    fn refuses_to_overwrite_existing_config() {
        let dir = tempdir().unwrap();
        let config = dir.path().join("camnode.toml");
        std::fs::write(&config, "shm_name = \"old\"\nsave_path = \"/tmp/old\"\n").unwrap();
        let args = Args {
            config: config.clone(),
            shm_name: "cam0".to_string(),
            save_path: dir.path().join("save"),
        };
        let err = run(args).unwrap_err();
        assert_eq!(err.kind(), base::ErrorKind::AlreadyExists);
    }
}
