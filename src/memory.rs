//! Segment backing for the control block and the arena.
//!
//! A buffer lives in one contiguous mapping laid out as
//! `[ State | StatsBlock (optional) | arena ]`. Process-local buffers are
//! backed by an anonymous mapping; process-shared buffers by a SysV shared
//! memory segment so that other participants can attach by id.

use crate::error::Result;
use core::ptr::NonNull;
use nix::errno::Errno;
use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};
use std::num::NonZero;

enum Backing {
    Anon { len: usize },
    #[cfg(feature = "shm")]
    Shm { shmid: i32 },
}

pub(crate) struct Segment {
    ptr: NonNull<u8>,
    backing: Backing,
}

unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// Map `len` zeroed private bytes.
    pub(crate) fn anonymous(len: usize) -> Result<Segment> {
        let ptr = unsafe {
            mmap_anonymous(
                None,
                NonZero::new(len).ok_or(crate::error::PacketBufError::InvalidArgument)?,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
            )?
        };
        Ok(Segment {
            ptr: ptr.cast(),
            backing: Backing::Anon { len },
        })
    }

    /// Create a fresh SysV segment of `len` zeroed bytes and attach it.
    #[cfg(feature = "shm")]
    pub(crate) fn shm_create(len: usize, mode: u32) -> Result<Segment> {
        let shmid = unsafe {
            libc::shmget(
                libc::IPC_PRIVATE,
                len,
                libc::IPC_CREAT | libc::IPC_EXCL | mode as libc::c_int,
            )
        };
        if shmid == -1 {
            return Err(Errno::last().into());
        }
        Self::attach(shmid)
    }

    /// Attach an existing segment without reinitializing its contents.
    #[cfg(feature = "shm")]
    pub(crate) fn shm_attach(shmid: i32) -> Result<Segment> {
        Self::attach(shmid)
    }

    #[cfg(feature = "shm")]
    fn attach(shmid: i32) -> Result<Segment> {
        let addr = unsafe { libc::shmat(shmid, std::ptr::null(), 0) };
        if addr as isize == -1 {
            return Err(Errno::last().into());
        }
        let ptr = NonNull::new(addr as *mut u8).ok_or(Errno::EINVAL)?;
        Ok(Segment {
            ptr,
            backing: Backing::Shm { shmid },
        })
    }

    pub(crate) fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    pub(crate) fn shmid(&self) -> Option<i32> {
        match self.backing {
            Backing::Anon { .. } => None,
            #[cfg(feature = "shm")]
            Backing::Shm { shmid } => Some(shmid),
        }
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        match self.backing {
            Backing::Anon { len } => unsafe {
                let _ = munmap(self.ptr.cast(), len);
            },
            #[cfg(feature = "shm")]
            Backing::Shm { shmid } => unsafe {
                libc::shmdt(self.ptr.as_ptr() as *const libc::c_void);
                libc::shmctl(shmid, libc::IPC_RMID, std::ptr::null_mut());
            },
        }
    }
}
