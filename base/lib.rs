// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2018 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

pub mod clock;
pub mod config;
mod error;
pub mod shutdown;
mod sync;
pub mod strutil;
pub mod tracing_setup;

pub use crate::error::{Error, ErrorKind, ResultExt};
pub use crate::sync::{Condvar, Mutex};

use std::hash::BuildHasherDefault;

/// A `HashMap` using a faster (non-DoS-resistant) hash, for internal maps
/// keyed by small trusted ids rather than attacker-controlled strings.
pub type FastHashMap<K, V> = std::collections::HashMap<K, V, BuildHasherDefault<ahash::AHasher>>;
pub type FastHashSet<K> = std::collections::HashSet<K, BuildHasherDefault<ahash::AHasher>>;

/// No-op on platforms without a custom allocator hook; present so call sites
/// (production and test init) don't need to special-case builds without the
/// `mimalloc` feature.
pub fn ensure_malloc_used() {}
