use std::io::{self, Error};
use std::mem;
use std::ptr;

use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_NOACCESS,
    PAGE_READWRITE,
};
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

/// Returns the system allocation granularity.
///
/// On Windows, `VirtualAlloc` reservations are aligned to this value
/// (typically 64KB), which is often larger than the page size.
pub fn allocation_granularity() -> usize {
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        let gran = info.dwAllocationGranularity as usize;
        if gran == 0 {
            65536
        } else {
            gran
        }
    }
}

pub fn page_size() -> usize {
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        let size = info.dwPageSize as usize;
        if size == 0 {
            4096
        } else {
            size
        }
    }
}

pub struct ReservationInner {
    ptr: *mut std::ffi::c_void,
    len: usize,
}

impl ReservationInner {
    /// Reserves `len` bytes of address space without committing it.
    pub unsafe fn reserve(hint_addr: usize, len: usize, _populate: bool) -> io::Result<Self> {
        let addr = if hint_addr == 0 {
            ptr::null()
        } else {
            hint_addr as *const std::ffi::c_void
        };

        let mut ptr = unsafe { VirtualAlloc(addr, len, MEM_RESERVE, PAGE_NOACCESS) };

        // A hint is only a request; retry anywhere.
        if ptr.is_null() && !addr.is_null() {
            ptr = unsafe { VirtualAlloc(ptr::null(), len, MEM_RESERVE, PAGE_NOACCESS) };
        }

        if ptr.is_null() {
            return Err(Error::last_os_error());
        }

        Ok(Self { ptr, len })
    }

    pub unsafe fn commit(&self, offset: usize, len: usize) -> io::Result<()> {
        let addr = unsafe { self.ptr.cast::<u8>().add(offset) };
        let p = unsafe { VirtualAlloc(addr.cast(), len, MEM_COMMIT, PAGE_READWRITE) };
        if p.is_null() {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    pub unsafe fn uncommit(&self, offset: usize, len: usize) -> io::Result<()> {
        let addr = unsafe { self.ptr.cast::<u8>().add(offset) };
        if unsafe { VirtualFree(addr.cast(), len, MEM_DECOMMIT) } == 0 {
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
                // MEM_RELEASE requires dwSize to be 0
                VirtualFree(self.ptr, 0, MEM_RELEASE);
            }
        }
    }
}

unsafe impl Send for ReservationInner {}
unsafe impl Sync for ReservationInner {}
