// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2021 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Thin poison-ignoring wrappers around `std::sync::{Mutex, Condvar}`.
//!
//! A poisoned lock here means some other thread already panicked; there's
//! nothing a caller can usefully do differently than if it hadn't, so these
//! wrappers just recover the guard rather than propagating the poison.

use std::sync::{self, MutexGuard};
use std::time::Duration;

pub struct Mutex<T>(sync::Mutex<T>);

impl<T> Mutex<T> {
    pub fn new(t: T) -> Self {
        Mutex(sync::Mutex::new(t))
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        match self.0.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

pub struct Condvar(sync::Condvar);

pub struct WaitTimeoutResult(bool);

impl WaitTimeoutResult {
    pub fn timed_out(&self) -> bool {
        self.0
    }
}

impl Condvar {
    pub fn new() -> Self {
        Condvar(sync::Condvar::new())
    }

    pub fn notify_all(&self) {
        self.0.notify_all();
    }

    /// Waits on `guard` until `timeout` elapses or `cond(&*guard)` becomes false.
    pub fn wait_timeout_while<'a, T, F>(
        &self,
        guard: MutexGuard<'a, T>,
        timeout: Duration,
        cond: F,
    ) -> (MutexGuard<'a, T>, WaitTimeoutResult)
    where
        F: FnMut(&mut T) -> bool,
    {
        match self.0.wait_timeout_while(guard, timeout, cond) {
            Ok((g, r)) => (g, WaitTimeoutResult(r.timed_out())),
            Err(poisoned) => {
                let (g, r) = poisoned.into_inner();
                (g, WaitTimeoutResult(r.timed_out()))
            }
        }
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}
