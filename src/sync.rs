//! Blocking primitives placed inside the buffer control block.
//!
//! These are thin wrappers over `pthread_mutex_t` and POSIX `sem_t`. Unlike
//! the std primitives they can be initialized with the process-shared
//! attribute, which is what allows the control block to live inside a shared
//! memory segment and synchronize independent processes.

use crate::error::{PacketBufError, Result};
use nix::errno::Errno;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;

/// Spurious wakeups from `sem_wait` are retried this many times before the
/// wait is reported as failed.
const MAX_SEM_WAIT_TRIES: u32 = 6;

#[repr(C)]
pub(crate) struct RawMutex {
    inner: UnsafeCell<libc::pthread_mutex_t>,
}

unsafe impl Send for RawMutex {}
unsafe impl Sync for RawMutex {}

impl RawMutex {
    /// Initialize the mutex in place.
    ///
    /// # Safety
    ///
    /// Must be called exactly once before any other method, and the mutex
    /// must not move afterwards (it lives inside the mapped control block).
    pub(crate) unsafe fn init(&self, pshared: bool) -> Result<()> {
        let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
        let rc = libc::pthread_mutexattr_init(attr.as_mut_ptr());
        if rc != 0 {
            return Err(Errno::from_raw(rc).into());
        }
        if pshared {
            let rc =
                libc::pthread_mutexattr_setpshared(attr.as_mut_ptr(), libc::PTHREAD_PROCESS_SHARED);
            if rc != 0 {
                libc::pthread_mutexattr_destroy(attr.as_mut_ptr());
                return Err(Errno::from_raw(rc).into());
            }
        }
        let rc = libc::pthread_mutex_init(self.inner.get(), attr.as_ptr());
        libc::pthread_mutexattr_destroy(attr.as_mut_ptr());
        if rc != 0 {
            return Err(Errno::from_raw(rc).into());
        }
        Ok(())
    }

    pub(crate) fn lock(&self) -> Result<()> {
        let rc = unsafe { libc::pthread_mutex_lock(self.inner.get()) };
        if rc != 0 {
            return Err(PacketBufError::InvalidArgument);
        }
        Ok(())
    }

    pub(crate) fn try_lock(&self) -> Result<()> {
        let rc = unsafe { libc::pthread_mutex_trylock(self.inner.get()) };
        match rc {
            0 => Ok(()),
            libc::EBUSY => Err(PacketBufError::Busy),
            rc => Err(Errno::from_raw(rc).into()),
        }
    }

    /// Unlock, which must happen on the thread that locked.
    pub(crate) fn unlock(&self) {
        unsafe {
            libc::pthread_mutex_unlock(self.inner.get());
        }
    }

    /// # Safety
    ///
    /// No thread may hold or wait on the mutex.
    pub(crate) unsafe fn destroy(&self) {
        libc::pthread_mutex_destroy(self.inner.get());
    }
}

#[repr(C)]
pub(crate) struct RawSemaphore {
    inner: UnsafeCell<libc::sem_t>,
}

unsafe impl Send for RawSemaphore {}
unsafe impl Sync for RawSemaphore {}

impl RawSemaphore {
    /// Initialize the semaphore in place with a zero count.
    ///
    /// # Safety
    ///
    /// Same contract as [`RawMutex::init`].
    pub(crate) unsafe fn init(&self, pshared: bool) -> Result<()> {
        if libc::sem_init(self.inner.get(), pshared as libc::c_int, 0) == -1 {
            return Err(Errno::last().into());
        }
        Ok(())
    }

    pub(crate) fn post(&self) -> Result<()> {
        if unsafe { libc::sem_post(self.inner.get()) } == -1 {
            return Err(Errno::last().into());
        }
        Ok(())
    }

    /// Block until the count is positive, then decrement it.
    pub(crate) fn wait(&self) -> Result<()> {
        for _ in 0..MAX_SEM_WAIT_TRIES {
            if unsafe { libc::sem_wait(self.inner.get()) } == 0 {
                return Ok(());
            }
        }
        Err(PacketBufError::InvalidArgument)
    }

    /// Decrement the count if positive, without blocking.
    pub(crate) fn try_wait(&self) -> bool {
        unsafe { libc::sem_trywait(self.inner.get()) == 0 }
    }

    pub(crate) fn value(&self) -> i32 {
        let mut value = 0;
        unsafe {
            libc::sem_getvalue(self.inner.get(), &mut value);
        }
        value
    }

    /// # Safety
    ///
    /// No thread may be blocked on the semaphore.
    pub(crate) unsafe fn destroy(&self) {
        libc::sem_destroy(self.inner.get());
    }
}
