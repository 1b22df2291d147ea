//! Collaborator interfaces: the guest page-table walker, the physical memory backend and the
//! data-breakpoint checker.

use bitflags::bitflags;
use thiserror::Error;

use crate::Access;

/// Guest page size reported by the page walker for a successful translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSize {
    Size4K,
    Size2M,
    Size4M,
    Size1G,
}

impl PageSize {
    #[inline]
    pub const fn bytes(self) -> u64 {
        match self {
            PageSize::Size4K => 4 * 1024,
            PageSize::Size2M => 2 * 1024 * 1024,
            PageSize::Size4M => 4 * 1024 * 1024,
            PageSize::Size1G => 1024 * 1024 * 1024,
        }
    }

    #[inline]
    pub const fn is_large(self) -> bool {
        !matches!(self, PageSize::Size4K)
    }
}

bitflags! {
    /// Effective permissions of a translation, combined over all paging levels.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PteFlags: u8 {
        const WRITE = 1 << 0;
        const USER = 1 << 1;
        const ACCESSED = 1 << 2;
        const DIRTY = 1 << 3;
        const GLOBAL = 1 << 4;
        const NO_EXEC = 1 << 5;
    }
}

/// Parameters of a single page walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkQuery {
    pub access: Access,
    /// Check against user-mode permissions (CPL 3, not a system access).
    pub user: bool,
    /// CR0.WP.
    pub write_protect: bool,
    /// Width of the access in bytes; only used for fault reporting.
    pub size: usize,
}

/// Successful page walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageWalk {
    /// Physical address corresponding to the walked virtual address (page offset included).
    pub paddr: u64,
    pub effective: PteFlags,
    pub page_size: PageSize,
}

/// Why a page walk failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkFault {
    NotPresent,
    ReservedBit,
    AccessDenied,
    /// A paging structure or the final page lies outside guest-physical space.
    BadPhysAddr,
}

/// Guest page-table walker, including permission checks and accessed/dirty updates.
pub trait PageWalker {
    fn walk(&mut self, vaddr: u64, query: WalkQuery) -> Result<PageWalk, WalkFault>;
}

impl<T: PageWalker + ?Sized> PageWalker for &mut T {
    #[inline]
    fn walk(&mut self, vaddr: u64, query: WalkQuery) -> Result<PageWalk, WalkFault> {
        <T as PageWalker>::walk(&mut **self, vaddr, query)
    }
}

/// Opaque handle of a host-mapped guest RAM page.
///
/// Issued by a [`PhysMemory`] backend and handed back to it to obtain the page bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostPage(pub u64);

bitflags! {
    /// Physical-page level restrictions on direct access.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PhysPageFlags: u8 {
        /// Writes are intercepted (MMIO, write-monitored RAM, ROM).
        const NO_WRITE = 1 << 0;
        /// Reads are intercepted too.
        const NO_READ = 1 << 1;
        /// Nothing is mapped at this address.
        const UNASSIGNED = 1 << 2;
    }
}

/// Result of querying how a physical page can be accessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PhysPageInfo {
    /// Direct host mapping that may be cached until the next physical invalidation.
    pub host: Option<HostPage>,
    pub flags: PhysPageFlags,
}

/// Why a physical page could not be mapped directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageMapFailure {
    /// Reads are fine but writes must go through the access handlers.
    CatchWrite,
    /// Every access must go through the access handlers.
    CatchAll,
    Unassigned,
    Error(PhysError),
}

/// Lower-priority informational status from a physical access.
///
/// These mean "the access was performed, but the outer execution loop has something to do"
/// (e.g. service a device). Numerically lower codes take priority when merging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InfoStatus(pub u16);

impl InfoStatus {
    /// Keeps the higher-priority status of the two.
    #[inline]
    pub fn merge(current: Option<InfoStatus>, new: InfoStatus) -> InfoStatus {
        match current {
            Some(cur) if cur <= new => cur,
            _ => new,
        }
    }
}

/// Hard failure of a physical access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PhysError {
    #[error("physical access at {addr:#x} must be completed by the device context")]
    DeviceContextRequired { addr: u64 },
    #[error("physical access at {addr:#x} targets an invalid address")]
    InvalidAddress { addr: u64 },
    #[error("device backend failed physical access at {addr:#x}")]
    DeviceFailure { addr: u64 },
}

/// Tri-state status of a handler-aware physical access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhysStatus {
    Ok,
    /// Performed; the status must be passed up to the execution loop.
    Info(InfoStatus),
    Failed(PhysError),
}

/// Page lock guard for a direct mapping without a cached host page.
///
/// The lock is released when the guard is dropped.
pub trait PageLock {
    fn host_page(&self) -> HostPage;
}

/// Guest physical memory as seen by the mapping layer.
pub trait PhysMemory {
    type Lock: PageLock;

    /// Query direct-access restrictions and the host mapping of the page at `page`
    /// (page aligned).
    fn query_page(&mut self, page: u64) -> PhysPageInfo;

    /// Map the page containing `paddr` for direct access, holding a lock until the guard drops.
    fn lock_page(&mut self, paddr: u64, write: bool) -> Result<Self::Lock, PageMapFailure>;

    /// Bytes of a host-mapped page. Must be at least one guest page long.
    fn host_page(&self, page: HostPage) -> &[u8];

    fn host_page_mut(&mut self, page: HostPage) -> &mut [u8];

    /// Handler-aware read.
    fn read(&mut self, paddr: u64, dst: &mut [u8]) -> PhysStatus;

    /// Handler-aware write.
    fn write(&mut self, paddr: u64, src: &[u8]) -> PhysStatus;

    /// Read that bypasses access handlers.
    ///
    /// The default implementation uses [`PhysMemory::read`] and drops informational statuses.
    #[inline]
    fn read_simple(&mut self, paddr: u64, dst: &mut [u8]) -> Result<(), PhysError> {
        match self.read(paddr, dst) {
            PhysStatus::Ok | PhysStatus::Info(_) => Ok(()),
            PhysStatus::Failed(err) => Err(err),
        }
    }

    /// Write that bypasses access handlers.
    #[inline]
    fn write_simple(&mut self, paddr: u64, src: &[u8]) -> Result<(), PhysError> {
        match self.write(paddr, src) {
            PhysStatus::Ok | PhysStatus::Info(_) => Ok(()),
            PhysStatus::Failed(err) => Err(err),
        }
    }
}

impl<T: PhysMemory + ?Sized> PhysMemory for &mut T {
    type Lock = T::Lock;

    #[inline]
    fn query_page(&mut self, page: u64) -> PhysPageInfo {
        <T as PhysMemory>::query_page(&mut **self, page)
    }

    #[inline]
    fn lock_page(&mut self, paddr: u64, write: bool) -> Result<Self::Lock, PageMapFailure> {
        <T as PhysMemory>::lock_page(&mut **self, paddr, write)
    }

    #[inline]
    fn host_page(&self, page: HostPage) -> &[u8] {
        <T as PhysMemory>::host_page(&**self, page)
    }

    #[inline]
    fn host_page_mut(&mut self, page: HostPage) -> &mut [u8] {
        <T as PhysMemory>::host_page_mut(&mut **self, page)
    }

    #[inline]
    fn read(&mut self, paddr: u64, dst: &mut [u8]) -> PhysStatus {
        <T as PhysMemory>::read(&mut **self, paddr, dst)
    }

    #[inline]
    fn write(&mut self, paddr: u64, src: &[u8]) -> PhysStatus {
        <T as PhysMemory>::write(&mut **self, paddr, src)
    }

    #[inline]
    fn read_simple(&mut self, paddr: u64, dst: &mut [u8]) -> Result<(), PhysError> {
        <T as PhysMemory>::read_simple(&mut **self, paddr, dst)
    }

    #[inline]
    fn write_simple(&mut self, paddr: u64, src: &[u8]) -> Result<(), PhysError> {
        <T as PhysMemory>::write_simple(&mut **self, paddr, src)
    }
}

bitflags! {
    /// Data breakpoints that matched an access.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DbgHits: u8 {
        const DR0 = 1 << 0;
        const DR1 = 1 << 1;
        const DR2 = 1 << 2;
        const DR3 = 1 << 3;
        /// Hit on a breakpoint owned by the host debugger rather than the guest.
        const DEBUGGER = 1 << 4;
    }
}

/// Evaluates guest (DR0-DR3) and debugger data breakpoints.
pub trait DataBreakpoints {
    fn check(&mut self, vaddr: u64, size: usize, access: Access) -> DbgHits;
}

impl<T: DataBreakpoints + ?Sized> DataBreakpoints for &mut T {
    #[inline]
    fn check(&mut self, vaddr: u64, size: usize, access: Access) -> DbgHits {
        <T as DataBreakpoints>::check(&mut **self, vaddr, size, access)
    }
}

/// No data breakpoints are ever armed.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBreakpoints;

impl DataBreakpoints for NoBreakpoints {
    #[inline]
    fn check(&mut self, _vaddr: u64, _size: usize, _access: Access) -> DbgHits {
        DbgHits::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_status_merge_keeps_lowest_code() {
        assert_eq!(InfoStatus::merge(None, InfoStatus(7)), InfoStatus(7));
        assert_eq!(InfoStatus::merge(Some(InfoStatus(3)), InfoStatus(7)), InfoStatus(3));
        assert_eq!(InfoStatus::merge(Some(InfoStatus(9)), InfoStatus(7)), InfoStatus(7));
    }

    #[test]
    fn page_size_bytes() {
        assert_eq!(PageSize::Size4K.bytes(), 4096);
        assert!(!PageSize::Size4K.is_large());
        assert!(PageSize::Size2M.is_large());
        assert_eq!(PageSize::Size4M.bytes() >> 12, 1024);
    }
}
