// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Named shared memory segment backing the frame pool.

use std::io;

use crate::platform::posix::ShmMode;
use crate::platform::PlatformShm;

/// Open mode for shared memory segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmOpenMode {
    /// Create exclusively, fail if the name exists.
    Create,
    /// Open an existing segment, fail if missing.
    Open,
    CreateOrOpen,
}

/// A named, inter-process shared memory region.
///
/// A trailing reference counter shared by every mapping decides who unlinks
/// the name: the last handle to drop removes it.
pub struct ShmHandle {
    inner: PlatformShm,
}

impl ShmHandle {
    /// Map a named region of `size` usable bytes.
    pub fn acquire(name: &str, size: usize, mode: ShmOpenMode) -> io::Result<Self> {
        let platform_mode = match mode {
            ShmOpenMode::Create => ShmMode::Create,
            ShmOpenMode::Open => ShmMode::Open,
            ShmOpenMode::CreateOrOpen => ShmMode::CreateOrOpen,
        };
        let inner = PlatformShm::acquire(name, size, platform_mode)?;
        Ok(Self { inner })
    }

    /// Map an existing region, discovering its size from the kernel object.
    pub fn open_existing(name: &str) -> io::Result<Self> {
        let size = PlatformShm::probe_size(name)?;
        Self::acquire(name, size, ShmOpenMode::Open)
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.inner.as_mut_ptr()
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.inner.as_mut_ptr()
    }

    /// Usable size requested at creation.
    pub fn user_size(&self) -> usize {
        self.inner.user_size()
    }

    /// Total mapped size, including the reference counter.
    pub fn mapped_size(&self) -> usize {
        self.inner.mapped_size()
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Whether this handle created the segment.
    pub fn is_creator(&self) -> bool {
        self.inner.prev_ref_count() == 0
    }

    /// Number of handles currently mapping the segment, across processes.
    pub fn ref_count(&self) -> i32 {
        self.inner.ref_count()
    }

    pub fn unlink(&self) {
        self.inner.unlink();
    }

    /// Remove a stale segment left behind by a crashed daemon.
    pub fn unlink_by_name(name: &str) {
        PlatformShm::unlink_by_name(name);
    }
}
