// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Worker-thread slot: a cooperative stop flag plus the joinable handle,
//! shared by the proxy's four workers and the host's convenience worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

/// One worker thread's control block. The stop flag is an atomic so worker
/// loops check it without taking any lock; the handle mutex is only touched
/// at spawn and join time and never nests with other locks.
pub(crate) struct ThreadSlot {
    name: &'static str,
    stop: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadSlot {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            stop: AtomicBool::new(false),
            handle: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Re-arm the slot for a fresh spawn after a stop/join cycle.
    pub fn reset(&self) {
        self.stop.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        lock_recovered(&self.handle, self.name).is_some()
    }

    /// Record the spawned handle for a later join.
    pub fn install(&self, handle: JoinHandle<()>) {
        *lock_recovered(&self.handle, self.name) = Some(handle);
    }

    /// Join the worker if one was spawned. A second call is a no-op.
    pub fn join(&self) {
        let handle = lock_recovered(&self.handle, self.name).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("{} thread panicked; continuing teardown", self.name);
            }
        }
    }
}

/// Lock a mutex, recovering from poisoning. Teardown has to proceed even if
/// a worker panicked while holding the lock.
pub(crate) fn lock_recovered<'a, T>(mutex: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poisoned: PoisonError<_>| {
        log::warn!("{} lock poisoned; recovering", what);
        poisoned.into_inner()
    })
}
