// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2025 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Small helpers shared by config loaders: environment variable overlays and
//! human-readable size parsing via [`crate::strutil`].

use crate::{bail, err, Error, ErrorKind};
use std::str::FromStr;

/// Reads `key` from the environment and parses it with `FromStr`, returning
/// `Ok(None)` if the variable is unset.
pub fn env_override<T: FromStr>(key: &str) -> Result<Option<T>, Error> {
    match std::env::var(key) {
        Ok(s) => s
            .parse()
            .map(Some)
            .map_err(|_| err!(InvalidArgument, msg("env var {key} has invalid value {s:?}"))),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => {
            bail!(InvalidArgument, msg("env var {key} is not valid UTF-8"))
        }
    }
}

/// Like [`env_override`], but parses a human-readable byte count via
/// [`crate::strutil::decode_size`] (e.g. `"1G"`, `"512M"`).
pub fn env_override_size(key: &str) -> Result<Option<u64>, Error> {
    match std::env::var(key) {
        Ok(s) => {
            let n = crate::strutil::decode_size(&s)
                .map_err(|_| err!(InvalidArgument, msg("env var {key} has invalid size {s:?}")))?;
            Ok(Some(n as u64))
        }
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => {
            bail!(InvalidArgument, msg("env var {key} is not valid UTF-8"))
        }
    }
}

/// Reads and parses a TOML config file, returning `Ok(None)` if the given
/// path doesn't exist so callers can treat "no file" as "use defaults".
pub fn read_toml_file<T: serde::de::DeserializeOwned>(
    path: &std::path::Path,
) -> Result<Option<T>, Error> {
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let parsed: T = toml::from_str(&text)
        .map_err(|e| err!(InvalidArgument, msg("parsing {}", path.display()), source(e)))?;
    Ok(Some(parsed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_override_roundtrip() {
        assert_eq!(env_override::<u32>("CAMNODE_TEST_NONEXISTENT_VAR").unwrap(), None);
    }
}
