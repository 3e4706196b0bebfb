// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2025 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Edge-camera ingest and retention core.
//!
//! This crate replaces `moonfire-db`'s SQLite-backed recording database with
//! a flat-file shared-memory ingest pipeline: a single-writer shared-memory
//! rendezvous is turned into a sequence of [`frame::Frame`]s, an event state
//! machine decides which frames are worth keeping, [`writer`] persists them
//! as size-bounded chunk directories, and [`encoder`] batch-encodes sealed
//! chunks into dated video files under a retention budget. [`fanout`] gives
//! live frames to any number of local subscribers (the HTTP/MJPEG/HLS/p2p
//! planes are out of scope here; see [`pipeline`] for the subscriber seam).

pub mod config;
pub mod encoder;
pub mod fanout;
pub mod frame;
pub mod layout;
pub mod pipeline;
pub mod ring;
pub mod shm;
// This is only for #[cfg(test)], but it's also used by the dependent `camnode`
// binary crate's own tests, and #[cfg(test)] isn't passed on to dependencies.
pub mod testutil;
pub mod writer;

pub use config::Configuration;
pub use frame::{Frame, FrameBatch, SignificantFrame};
pub use pipeline::{Pipeline, SubscriberHandle};
