// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Inter-process condition variable stored inside a shared memory segment.

use std::io;
use std::time::Duration;

use crate::mutex::IpcMutexGuard;
use crate::platform::posix;

/// A `pthread_cond_t` with `PTHREAD_PROCESS_SHARED`, paired with an
/// [`crate::IpcMutex`] from the same segment.
pub struct IpcCondition {
    raw: *mut libc::pthread_cond_t,
}

// Safety: the pthread object is process-shared and designed for concurrent use.
unsafe impl Send for IpcCondition {}
unsafe impl Sync for IpcCondition {}

impl IpcCondition {
    /// # Safety
    /// Same contract as [`crate::IpcMutex::init`].
    pub unsafe fn init(raw: *mut libc::pthread_cond_t) -> io::Result<Self> {
        posix::cond_init(raw)?;
        Ok(Self { raw })
    }

    /// # Safety
    /// Same contract as [`crate::IpcMutex::attach`].
    pub unsafe fn attach(raw: *mut libc::pthread_cond_t) -> Self {
        Self { raw }
    }

    /// Atomically release the guard's mutex and wait. `None` waits forever.
    /// Returns `Ok(true)` if woken, `Ok(false)` on timeout; spurious wakeups
    /// are possible, so callers re-check their predicate.
    pub fn wait(&self, guard: &mut IpcMutexGuard<'_>, timeout: Option<Duration>) -> io::Result<bool> {
        let mtx = guard.mutex().native_ptr();
        unsafe { posix::cond_wait(self.raw, mtx, timeout) }
    }

    pub fn notify_one(&self) -> io::Result<()> {
        unsafe { posix::cond_signal(self.raw) }
    }

    pub fn notify_all(&self) -> io::Result<()> {
        unsafe { posix::cond_broadcast(self.raw) }
    }
}
