// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Inter-process mutex stored inside a shared memory segment.

use std::io;

use crate::platform::posix;

/// A `pthread_mutex_t` with `PTHREAD_PROCESS_SHARED` and
/// `PTHREAD_MUTEX_ROBUST` attributes, living in mapped shared memory.
///
/// Robustness matters here: the driver process may be `SIGKILL`ed while it
/// holds the pool lock. The next locker gets `EOWNERDEAD`, marks the mutex
/// consistent and carries on, with [`IpcMutexGuard::recovered`] set.
pub struct IpcMutex {
    raw: *mut libc::pthread_mutex_t,
}

// Safety: the pthread object is process-shared and designed for concurrent use.
unsafe impl Send for IpcMutex {}
unsafe impl Sync for IpcMutex {}

impl IpcMutex {
    /// Initialise a fresh mutex at `raw`.
    ///
    /// # Safety
    /// `raw` must point into a live mapping that outlives the returned value,
    /// and no other process may be using that memory yet.
    pub unsafe fn init(raw: *mut libc::pthread_mutex_t) -> io::Result<Self> {
        posix::mutex_init(raw)?;
        Ok(Self { raw })
    }

    /// Attach to a mutex another process already initialised.
    ///
    /// # Safety
    /// `raw` must point to a mutex created by [`IpcMutex::init`] inside a
    /// mapping that outlives the returned value.
    pub unsafe fn attach(raw: *mut libc::pthread_mutex_t) -> Self {
        Self { raw }
    }

    /// Lock, blocking indefinitely.
    pub fn lock(&self) -> io::Result<IpcMutexGuard<'_>> {
        let recovered = unsafe { posix::mutex_lock(self.raw)? };
        if recovered {
            tracing::warn!("recovered shared lock abandoned by a dead process");
        }
        Ok(IpcMutexGuard {
            mtx: self,
            recovered,
        })
    }

    pub(crate) fn native_ptr(&self) -> *mut libc::pthread_mutex_t {
        self.raw
    }
}

/// RAII guard: unlocks on drop.
pub struct IpcMutexGuard<'a> {
    mtx: &'a IpcMutex,
    recovered: bool,
}

impl IpcMutexGuard<'_> {
    /// The previous owner died while holding the lock; protected state may be
    /// half-updated.
    pub fn recovered(&self) -> bool {
        self.recovered
    }

    pub(crate) fn mutex(&self) -> &IpcMutex {
        self.mtx
    }
}

impl Drop for IpcMutexGuard<'_> {
    fn drop(&mut self) {
        let _ = unsafe { posix::mutex_unlock(self.mtx.raw) };
    }
}
