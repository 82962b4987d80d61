// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Process-shared robust mutex and condition variable living in a segment.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use camd::{IpcCondition, IpcMutex, ShmHandle, ShmOpenMode};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_name(prefix: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}_mtx_{n}_{}", std::process::id())
}

#[repr(C)]
struct Shared {
    mtx: libc::pthread_mutex_t,
    cond: libc::pthread_cond_t,
    value: u64,
}

struct Fixture {
    shm: ShmHandle,
    mtx: IpcMutex,
    cond: IpcCondition,
}

// Safety: the fixture only exposes process-shared primitives.
unsafe impl Send for Fixture {}
unsafe impl Sync for Fixture {}

impl Fixture {
    fn new(prefix: &str) -> Self {
        let name = unique_name(prefix);
        ShmHandle::unlink_by_name(&name);
        let shm = ShmHandle::acquire(&name, std::mem::size_of::<Shared>(), ShmOpenMode::Create).expect("shm");
        let s = shm.as_mut_ptr() as *mut Shared;
        let (mtx, cond) = unsafe {
            (
                IpcMutex::init(std::ptr::addr_of_mut!((*s).mtx)).expect("mutex"),
                IpcCondition::init(std::ptr::addr_of_mut!((*s).cond)).expect("cond"),
            )
        };
        Self { shm, mtx, cond }
    }

    fn value(&self) -> *mut u64 {
        unsafe { std::ptr::addr_of_mut!((*(self.shm.as_mut_ptr() as *mut Shared)).value) }
    }
}

#[test]
fn lock_excludes_other_threads() {
    let f = Arc::new(Fixture::new("exclusion"));
    let threads: Vec<_> = (0..4)
        .map(|_| {
            let f = Arc::clone(&f);
            thread::spawn(move || {
                for _ in 0..1000 {
                    let _g = f.mtx.lock().unwrap();
                    unsafe { *f.value() += 1 };
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }
    assert_eq!(unsafe { *f.value() }, 4000);
}

#[test]
fn abandoned_lock_is_recovered() {
    let f = Arc::new(Fixture::new("owner_dead"));
    {
        let f = Arc::clone(&f);
        thread::spawn(move || {
            let g = f.mtx.lock().unwrap();
            // Exit while still owning the lock.
            std::mem::forget(g);
        })
        .join()
        .unwrap();
    }
    let g = f.mtx.lock().unwrap();
    assert!(g.recovered());
    drop(g);
    assert!(!f.mtx.lock().unwrap().recovered());
}

#[test]
fn condition_wait_times_out() {
    let f = Fixture::new("cond_timeout");
    let mut g = f.mtx.lock().unwrap();
    let t0 = Instant::now();
    let woken = f.cond.wait(&mut g, Some(Duration::from_millis(50))).unwrap();
    assert!(!woken);
    assert!(t0.elapsed() >= Duration::from_millis(40));
}

#[test]
fn condition_notify_wakes_waiter() {
    let f = Arc::new(Fixture::new("cond_notify"));
    let waiter = {
        let f = Arc::clone(&f);
        thread::spawn(move || {
            let mut g = f.mtx.lock().unwrap();
            while unsafe { *f.value() } == 0 {
                f.cond.wait(&mut g, Some(Duration::from_secs(5))).unwrap();
            }
            unsafe { *f.value() }
        })
    };
    thread::sleep(Duration::from_millis(50));
    {
        let _g = f.mtx.lock().unwrap();
        unsafe { *f.value() = 9 };
        f.cond.notify_all().unwrap();
    }
    assert_eq!(waiter.join().unwrap(), 9);
}
