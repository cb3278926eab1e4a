use std::io::{self, Error};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_vendor = "apple",
    target_os = "netbsd",
    target_os = "solaris",
    target_os = "illumos",
))]
const MAP_NORESERVE: libc::c_int = libc::MAP_NORESERVE;

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_vendor = "apple",
    target_os = "netbsd",
    target_os = "solaris",
    target_os = "illumos",
)))]
const MAP_NORESERVE: libc::c_int = 0;

/// Returns the system page size, cached atomically.
pub fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
            PAGE_SIZE.store(page_size, Ordering::Relaxed);
            page_size
        }
        page_size => page_size,
    }
}

pub struct ReservationInner {
    ptr: *mut libc::c_void,
    len: usize,
    populate: bool,
}

impl ReservationInner {
    /// Reserves `len` bytes of inaccessible address space.
    ///
    /// # Safety
    ///
    /// This function is unsafe because it calls `mmap`.
    pub unsafe fn reserve(hint_addr: usize, len: usize, populate: bool) -> io::Result<Self> {
        let addr = if hint_addr == 0 {
            ptr::null_mut()
        } else {
            hint_addr as *mut libc::c_void
        };

        let flags = libc::MAP_PRIVATE | libc::MAP_ANON | MAP_NORESERVE;
        let ptr = unsafe { libc::mmap(addr, len, libc::PROT_NONE, flags, -1, 0) };

        if ptr == libc::MAP_FAILED {
            return Err(Error::last_os_error());
        }

        Ok(Self { ptr, len, populate })
    }

    pub unsafe fn commit(&self, offset: usize, len: usize) -> io::Result<()> {
        let addr = unsafe { self.ptr.cast::<u8>().add(offset).cast::<libc::c_void>() };
        let rc = unsafe { libc::mprotect(addr, len, libc::PROT_READ | libc::PROT_WRITE) };
        if rc != 0 {
            return Err(Error::last_os_error());
        }
        if self.populate {
            // Advisory only; a failure here leaves the commit valid.
            unsafe { libc::madvise(addr, len, libc::MADV_WILLNEED) };
        }
        Ok(())
    }

    pub unsafe fn uncommit(&self, offset: usize, len: usize) -> io::Result<()> {
        let addr = unsafe { self.ptr.cast::<u8>().add(offset).cast::<libc::c_void>() };
        // DONTNEED on a private anonymous mapping drops the pages, so the
        // next commit observes zero-filled memory.
        if unsafe { libc::madvise(addr, len, libc::MADV_DONTNEED) } != 0 {
            return Err(Error::last_os_error());
        }
        if unsafe { libc::mprotect(addr, len, libc::PROT_NONE) } != 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    pub const fn ptr(&self) -> *mut u8 {
        self.ptr.cast::<u8>()
    }

    pub const fn len(&self) -> usize {
        self.len
    }
}

impl Drop for ReservationInner {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe {
                libc::munmap(self.ptr, self.len);
            }
        }
    }
}

unsafe impl Send for ReservationInner {}
unsafe impl Sync for ReservationInner {}
