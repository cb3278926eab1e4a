//! Low-level virtual memory primitives for region-based heaps.
//!
//! A heap reserves its whole address range once with [`ReserveOptions`] and
//! then commits or uncommits page-aligned sub-ranges of the resulting
//! [`Reservation`] as it grows and shrinks. Reserved but uncommitted memory
//! is inaccessible; committed memory reads as zero the first time it is
//! touched after a commit.

use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// Returns the system allocation granularity.
///
/// On Windows, this is typically 64KB. On Unix, this is typically the system page size.
/// Reservation hints should be aligned to this granularity.
pub fn allocation_granularity() -> usize {
    #[cfg(windows)]
    {
        os::allocation_granularity()
    }
    #[cfg(unix)]
    {
        os::page_size()
    }
}

/// A reserved range of virtual address space.
///
/// The whole range is released when this handle is dropped.
pub struct Reservation {
    inner: os::ReservationInner,
}

impl Reservation {
    /// Returns a pointer to the start of the reserved range.
    pub fn base(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// Returns the length of the reserved range in bytes.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if the reservation covers no bytes.
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    /// Makes `[offset, offset + len)` readable and writable.
    ///
    /// # Safety
    ///
    /// `offset` and `len` must be multiples of [`page_size`]. Committing an
    /// already committed range is allowed and leaves its contents intact.
    pub unsafe fn commit(&self, offset: usize, len: usize) -> io::Result<()> {
        self.check_range(offset, len)?;
        unsafe { self.inner.commit(offset, len) }
    }

    /// Returns the backing memory of `[offset, offset + len)` to the OS and
    /// makes the range inaccessible again.
    ///
    /// # Safety
    ///
    /// `offset` and `len` must be multiples of [`page_size`], and nothing may
    /// read or write the range until it is committed again.
    pub unsafe fn uncommit(&self, offset: usize, len: usize) -> io::Result<()> {
        self.check_range(offset, len)?;
        unsafe { self.inner.uncommit(offset, len) }
    }

    fn check_range(&self, offset: usize, len: usize) -> io::Result<()> {
        let page = page_size();
        let end = offset.checked_add(len);
        if offset % page != 0 || len % page != 0 || end.is_none_or(|end| end > self.len()) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "range is not page aligned or lies outside the reservation",
            ));
        }
        Ok(())
    }
}

unsafe impl Send for Reservation {}
unsafe impl Sync for Reservation {}

/// Configuration for reserving address space.
#[derive(Debug, Clone)]
pub struct ReserveOptions {
    len: usize,
    hint_addr: usize,
    populate: bool,
}

impl ReserveOptions {
    /// Creates a new `ReserveOptions` with default settings (length 0).
    /// You must set a length before reserving.
    pub const fn new() -> Self {
        Self {
            len: 0,
            hint_addr: 0,
            populate: false,
        }
    }

    /// Sets the length of the reservation in bytes.
    pub const fn len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    /// Sets a hint address for the reservation.
    ///
    /// The OS is not required to honor it.
    pub const fn with_hint(mut self, addr: usize) -> Self {
        self.hint_addr = addr;
        self
    }

    /// Prefault pages when they are committed.
    ///
    /// On Linux, commits are followed by `MADV_WILLNEED`.
    pub const fn populate(mut self, populate: bool) -> Self {
        self.populate = populate;
        self
    }

    /// Reserves the address range without committing any of it.
    ///
    /// # Safety
    ///
    /// The returned range must not be accessed outside committed sub-ranges.
    pub unsafe fn reserve(&self) -> io::Result<Reservation> {
        if self.len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "length must be greater than 0",
            ));
        }
        let inner =
            unsafe { os::ReservationInner::reserve(self.hint_addr, self.len, self.populate)? };
        Ok(Reservation { inner })
    }
}

impl Default for ReserveOptions {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    #[test]
    fn test_page_size() {
        let ps = page_size();
        assert!(ps > 0);
        assert_eq!(ps & (ps - 1), 0, "Page size should be power of 2");
    }

    #[test]
    fn test_allocation_granularity() {
        let ag = allocation_granularity();
        assert!(ag > 0);
        assert_eq!(ag & (ag - 1), 0, "Allocation granularity should be power of 2");
        assert!(ag >= page_size());
    }

    #[test]
    fn test_reserve_commit_write() {
        let page = page_size();
        let res = unsafe { ReserveOptions::new().len(page * 4).reserve().expect("reserve") };
        assert!(!res.base().is_null());
        assert_eq!(res.base() as usize % page, 0);

        unsafe {
            res.commit(page, page).expect("commit");
            let p = res.base().add(page);
            assert_eq!(ptr::read_volatile(p), 0);
            ptr::write_volatile(p, 42);
            assert_eq!(ptr::read_volatile(p), 42);
        }
    }

    #[test]
    fn test_recommit_reads_zero() {
        let page = page_size();
        let res = unsafe { ReserveOptions::new().len(page * 2).reserve().expect("reserve") };
        unsafe {
            res.commit(0, page).expect("commit");
            ptr::write_volatile(res.base(), 7);
            res.uncommit(0, page).expect("uncommit");
            res.commit(0, page).expect("recommit");
            assert_eq!(ptr::read_volatile(res.base()), 0);
        }
    }

    #[test]
    fn test_commit_rejects_bad_range() {
        let page = page_size();
        let res = unsafe { ReserveOptions::new().len(page * 2).reserve().expect("reserve") };
        unsafe {
            assert!(res.commit(1, page).is_err());
            assert!(res.commit(page, page * 2).is_err());
        }
    }

    #[test]
    fn test_zero_length_rejected() {
        let err = unsafe { ReserveOptions::new().reserve() };
        assert!(err.is_err());
    }
}
