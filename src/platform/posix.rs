// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// POSIX shared memory plus process-shared pthread objects placed inside a
// mapped segment. The frame pool keeps its lock and both queue conditions in
// the segment header so every process that maps the pool shares them.

use std::ffi::CString;
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::shm_name;

// ---------------------------------------------------------------------------
// Robust mutex symbols. Not exported by `libc` on every target; macOS has no
// robust mutexes at all.
// ---------------------------------------------------------------------------

#[cfg(not(target_os = "macos"))]
const EOWNERDEAD: i32 = libc::EOWNERDEAD;

#[cfg(not(target_os = "macos"))]
extern "C" {
    fn pthread_mutexattr_setrobust(
        attr: *mut libc::pthread_mutexattr_t,
        robustness: libc::c_int,
    ) -> libc::c_int;
    fn pthread_mutex_consistent(mutex: *mut libc::pthread_mutex_t) -> libc::c_int;
}

#[cfg(not(target_os = "macos"))]
const PTHREAD_MUTEX_ROBUST: libc::c_int = 1;

// ---------------------------------------------------------------------------
// Layout helpers
// ---------------------------------------------------------------------------

/// The mapped size is the user size rounded up to 4 bytes plus a trailing
/// `AtomicI32` counting how many handles currently map the segment.
const ALIGN: usize = std::mem::align_of::<AtomicI32>();

pub(crate) fn calc_size(user_size: usize) -> usize {
    let aligned = ((user_size.wrapping_sub(1) / ALIGN) + 1) * ALIGN;
    aligned + std::mem::size_of::<AtomicI32>()
}

/// # Safety
/// `mem` must point to a valid mapped region of at least `total_size` bytes.
unsafe fn acc_of<'a>(mem: *mut u8, total_size: usize) -> &'a AtomicI32 {
    let offset = total_size - std::mem::size_of::<AtomicI32>();
    &*(mem.add(offset) as *const AtomicI32)
}

// ---------------------------------------------------------------------------
// PlatformShm
// ---------------------------------------------------------------------------

pub struct PlatformShm {
    mem: *mut u8,
    size: usize,
    user_size: usize,
    name: String,
    prev_ref: i32,
}

// Safety: the mapping is process-shared; all access to its contents goes
// through atomics or the in-segment mutex.
unsafe impl Send for PlatformShm {}
unsafe impl Sync for PlatformShm {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmMode {
    Create,
    Open,
    CreateOrOpen,
}

/// Map a pthread return code to `io::Result`.
fn check(eno: libc::c_int) -> io::Result<()> {
    if eno == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(eno))
    }
}

fn c_name(posix_name: &str) -> io::Result<CString> {
    CString::new(posix_name.as_bytes()).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

fn shm_open(name: &CString, flags: libc::c_int) -> io::Result<libc::c_int> {
    let fd = unsafe { libc::shm_open(name.as_ptr(), flags, 0o660 as libc::c_uint) };
    if fd == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(fd)
    }
}

fn segment_len(fd: libc::c_int) -> io::Result<usize> {
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut st) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(st.st_size as usize)
}

impl PlatformShm {
    pub fn acquire(name: &str, user_size: usize, mode: ShmMode) -> io::Result<Self> {
        if name.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "name is empty"));
        }
        if user_size == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "size is 0"));
        }

        let posix_name = shm_name::make_shm_name(name);
        let cname = c_name(&posix_name)?;
        let total_size = calc_size(user_size);
        let exclusive = libc::O_RDWR | libc::O_CREAT | libc::O_EXCL;

        let (fd, created) = match mode {
            ShmMode::Create => (shm_open(&cname, exclusive)?, true),
            ShmMode::Open => (shm_open(&cname, libc::O_RDWR)?, false),
            ShmMode::CreateOrOpen => match shm_open(&cname, exclusive) {
                Ok(fd) => (fd, true),
                Err(e) if e.raw_os_error() == Some(libc::EEXIST) => {
                    (shm_open(&cname, libc::O_RDWR)?, false)
                }
                Err(e) => return Err(e),
            },
        };

        // Only the creator sizes the object; openers must fit inside it.
        let sized = if created {
            if unsafe { libc::ftruncate(fd, total_size as libc::off_t) } == 0 {
                Ok(())
            } else {
                Err(io::Error::last_os_error())
            }
        } else {
            segment_len(fd).and_then(|len| {
                if len < total_size {
                    Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("segment {posix_name} is {len} bytes, expected {total_size}"),
                    ))
                } else {
                    Ok(())
                }
            })
        };
        if let Err(e) = sized {
            unsafe { libc::close(fd) };
            return Err(e);
        }

        Self::map(fd, total_size, user_size, posix_name)
    }

    fn map(fd: libc::c_int, total_size: usize, user_size: usize, posix_name: String) -> io::Result<Self> {
        let mem = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };
        if mem == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        let mem = mem as *mut u8;
        let prev_ref = unsafe { acc_of(mem, total_size).fetch_add(1, Ordering::AcqRel) };
        Ok(Self {
            mem,
            size: total_size,
            user_size,
            name: posix_name,
            prev_ref,
        })
    }

    /// Size of an existing named segment as reported by `fstat`, minus the
    /// trailing reference counter. Lets an opener discover the geometry.
    pub fn probe_size(name: &str) -> io::Result<usize> {
        let fd = shm_open(&c_name(&shm_name::make_shm_name(name))?, libc::O_RDONLY)?;
        let len = segment_len(fd);
        unsafe { libc::close(fd) };
        Ok(len?.saturating_sub(std::mem::size_of::<AtomicI32>()))
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.mem
    }

    pub fn mapped_size(&self) -> usize {
        self.size
    }

    pub fn user_size(&self) -> usize {
        self.user_size
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reference count before this handle mapped the segment (0 = creator).
    pub fn prev_ref_count(&self) -> i32 {
        self.prev_ref
    }

    pub fn ref_count(&self) -> i32 {
        unsafe { acc_of(self.mem, self.size).load(Ordering::Acquire) }
    }

    pub fn unlink(&self) {
        if let Ok(cname) = c_name(&self.name) {
            unsafe { libc::shm_unlink(cname.as_ptr()) };
        }
    }

    pub fn unlink_by_name(name: &str) {
        if let Ok(cname) = c_name(&shm_name::make_shm_name(name)) {
            unsafe { libc::shm_unlink(cname.as_ptr()) };
        }
    }
}

impl Drop for PlatformShm {
    fn drop(&mut self) {
        if self.mem.is_null() {
            return;
        }
        // The last handle to unmap also removes the name.
        let prev = unsafe { acc_of(self.mem, self.size).fetch_sub(1, Ordering::AcqRel) };
        unsafe { libc::munmap(self.mem as *mut libc::c_void, self.size) };
        if prev <= 1 {
            self.unlink();
        }
    }
}

// ---------------------------------------------------------------------------
// Process-shared pthread mutex / condition living at a caller-owned address
// ---------------------------------------------------------------------------

/// Initialise a robust, process-shared mutex in place.
///
/// # Safety
/// `mtx` must point to writable, suitably aligned memory that no other thread
/// or process is using yet.
pub unsafe fn mutex_init(mtx: *mut libc::pthread_mutex_t) -> io::Result<()> {
    ptr::write_bytes(mtx, 0, 1);
    let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
    check(libc::pthread_mutexattr_init(&mut attr))?;

    let configured = check(libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED));
    #[cfg(not(target_os = "macos"))]
    let configured = configured.and_then(|()| check(pthread_mutexattr_setrobust(&mut attr, PTHREAD_MUTEX_ROBUST)));
    let result = configured.and_then(|()| check(libc::pthread_mutex_init(mtx, &attr)));

    libc::pthread_mutexattr_destroy(&mut attr);
    result
}

/// Mark a mutex whose owner died as consistent again. The caller owns it.
#[cfg(not(target_os = "macos"))]
unsafe fn recover(mtx: *mut libc::pthread_mutex_t) -> io::Result<bool> {
    check(pthread_mutex_consistent(mtx)).map(|()| true)
}

/// Returns `true` when the previous owner died holding the lock. The mutex has
/// already been marked consistent and is owned by the caller in that case.
///
/// # Safety
/// `mtx` must have been initialised with [`mutex_init`].
pub unsafe fn mutex_lock(mtx: *mut libc::pthread_mutex_t) -> io::Result<bool> {
    match libc::pthread_mutex_lock(mtx) {
        0 => Ok(false),
        #[cfg(not(target_os = "macos"))]
        EOWNERDEAD => recover(mtx),
        eno => Err(io::Error::from_raw_os_error(eno)),
    }
}

/// # Safety
/// The calling thread must own `mtx`.
pub unsafe fn mutex_unlock(mtx: *mut libc::pthread_mutex_t) -> io::Result<()> {
    check(libc::pthread_mutex_unlock(mtx))
}

/// # Safety
/// `cond` must point to writable memory not yet in use.
pub unsafe fn cond_init(cond: *mut libc::pthread_cond_t) -> io::Result<()> {
    ptr::write_bytes(cond, 0, 1);
    let mut attr: libc::pthread_condattr_t = std::mem::zeroed();
    check(libc::pthread_condattr_init(&mut attr))?;
    let result = check(libc::pthread_condattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED))
        .and_then(|()| check(libc::pthread_cond_init(cond, &attr)));
    libc::pthread_condattr_destroy(&mut attr);
    result
}

/// Wait on `cond` with `mtx` held. Returns `Ok(false)` on timeout.
///
/// Timed waits use an absolute `CLOCK_REALTIME` deadline, the pthread default.
///
/// # Safety
/// The calling thread must own `mtx`; both objects must be initialised.
pub unsafe fn cond_wait(
    cond: *mut libc::pthread_cond_t,
    mtx: *mut libc::pthread_mutex_t,
    timeout: Option<Duration>,
) -> io::Result<bool> {
    let eno = match timeout {
        None => libc::pthread_cond_wait(cond, mtx),
        Some(t) => {
            let deadline = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default() + t;
            let ts = libc::timespec {
                tv_sec: deadline.as_secs() as libc::time_t,
                tv_nsec: deadline.subsec_nanos() as libc::c_long,
            };
            libc::pthread_cond_timedwait(cond, mtx, &ts)
        }
    };
    match eno {
        0 => Ok(true),
        libc::ETIMEDOUT => Ok(false),
        #[cfg(not(target_os = "macos"))]
        EOWNERDEAD => recover(mtx),
        eno => Err(io::Error::from_raw_os_error(eno)),
    }
}

/// # Safety
/// `cond` must be initialised.
pub unsafe fn cond_broadcast(cond: *mut libc::pthread_cond_t) -> io::Result<()> {
    check(libc::pthread_cond_broadcast(cond))
}

/// # Safety
/// `cond` must be initialised.
pub unsafe fn cond_signal(cond: *mut libc::pthread_cond_t) -> io::Result<()> {
    check(libc::pthread_cond_signal(cond))
}
