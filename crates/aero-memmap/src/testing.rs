//! In-memory page table, physical memory and breakpoint fakes for tests and benches.

use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::ops::Range;
use std::rc::Rc;

use crate::backend::{
    DataBreakpoints, DbgHits, HostPage, PageLock, PageMapFailure, PageSize, PageWalk, PageWalker,
    PhysError, PhysMemory, PhysPageFlags, PhysPageInfo, PhysStatus, PteFlags, WalkFault,
    WalkQuery,
};
use crate::{Access, PAGE_OFFSET_MASK, PAGE_SHIFT, PAGE_SIZE};

/// Writable user page with accessed/dirty still clear.
pub const PTE_RW: PteFlags = PteFlags::WRITE.union(PteFlags::USER);

#[derive(Debug, Clone, Copy)]
struct Mapping {
    paddr: u64,
    flags: PteFlags,
    size: PageSize,
}

/// Flat virtual-to-physical map with x86 permission semantics.
///
/// Sets the accessed bit on every walk and the dirty bit on write walks, like a hardware walker.
#[derive(Debug, Default)]
pub struct FakePageTable {
    pages: HashMap<u64, Mapping>,
    large: HashMap<u64, Mapping>,
    walks: usize,
}

impl FakePageTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps the 4K page containing `vaddr` to the page containing `paddr`.
    pub fn map(&mut self, vaddr: u64, paddr: u64, flags: PteFlags) {
        self.pages.insert(
            vaddr >> PAGE_SHIFT,
            Mapping {
                paddr: paddr & !PAGE_OFFSET_MASK,
                flags,
                size: PageSize::Size4K,
            },
        );
    }

    /// Maps `count` consecutive pages starting at `vaddr`/`paddr`.
    pub fn map_range(&mut self, vaddr: u64, paddr: u64, count: usize, flags: PteFlags) {
        for i in 0..count as u64 {
            self.map(vaddr + (i << PAGE_SHIFT), paddr + (i << PAGE_SHIFT), flags);
        }
    }

    pub fn map_large(&mut self, vaddr: u64, paddr: u64, size: PageSize, flags: PteFlags) {
        assert!(size.is_large());
        assert_eq!(vaddr & (size.bytes() - 1), 0);
        self.large.insert(vaddr, Mapping { paddr, flags, size });
    }

    pub fn unmap(&mut self, vaddr: u64) {
        self.pages.remove(&(vaddr >> PAGE_SHIFT));
    }

    /// Replaces the flags of the 4K page containing `vaddr`.
    pub fn set_flags(&mut self, vaddr: u64, flags: PteFlags) {
        if let Some(mapping) = self.pages.get_mut(&(vaddr >> PAGE_SHIFT)) {
            mapping.flags = flags;
        }
    }

    pub fn flags(&self, vaddr: u64) -> Option<PteFlags> {
        self.pages.get(&(vaddr >> PAGE_SHIFT)).map(|m| m.flags)
    }

    /// Number of walks performed so far.
    pub fn walks(&self) -> usize {
        self.walks
    }

    fn lookup(&mut self, vaddr: u64) -> Option<(&mut Mapping, u64)> {
        if let Some(mapping) = self.pages.get_mut(&(vaddr >> PAGE_SHIFT)) {
            let paddr = mapping.paddr | (vaddr & PAGE_OFFSET_MASK);
            return Some((mapping, paddr));
        }
        self.large.iter_mut().find_map(|(base, mapping)| {
            let offset = vaddr.wrapping_sub(*base);
            (offset < mapping.size.bytes()).then(|| {
                let paddr = mapping.paddr + offset;
                (mapping, paddr)
            })
        })
    }
}

impl PageWalker for FakePageTable {
    fn walk(&mut self, vaddr: u64, query: WalkQuery) -> Result<PageWalk, WalkFault> {
        self.walks += 1;
        let (mapping, paddr) = self.lookup(vaddr).ok_or(WalkFault::NotPresent)?;

        let flags = mapping.flags;
        if query.user && !flags.contains(PteFlags::USER) {
            return Err(WalkFault::AccessDenied);
        }
        if query.access.is_write()
            && !flags.contains(PteFlags::WRITE)
            && (query.user || query.write_protect)
        {
            return Err(WalkFault::AccessDenied);
        }
        if query.access.is_exec() && flags.contains(PteFlags::NO_EXEC) {
            return Err(WalkFault::AccessDenied);
        }

        mapping.flags |= PteFlags::ACCESSED;
        if query.access.is_write() {
            mapping.flags |= PteFlags::DIRTY;
        }
        Ok(PageWalk {
            paddr,
            effective: mapping.flags,
            page_size: mapping.size,
        })
    }
}

/// How a physical range behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    /// Plain RAM with a cacheable host mapping.
    Ram,
    /// RAM that has to be locked for every direct access.
    RamLocked,
    /// Reads are direct, writes go through the handlers.
    WriteIntercept,
    /// Every access goes through the handlers.
    Mmio,
    Unassigned,
}

/// A handler-aware write that reached guest memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysWrite {
    pub paddr: u64,
    pub data: Vec<u8>,
}

/// Guest RAM in a `Vec`, with scriptable handler results.
///
/// Handler-aware accesses (`read`/`write`) are logged and consume scripted statuses; a scripted
/// failure leaves memory untouched. The handler-free path always succeeds within RAM.
pub struct FakePhys {
    ram: Vec<u8>,
    regions: Vec<(Range<u64>, Region)>,
    read_status: VecDeque<PhysStatus>,
    write_status: VecDeque<PhysStatus>,
    lock_error: Option<PhysError>,
    reads: Vec<(u64, usize)>,
    writes: Vec<PhysWrite>,
    simple_accesses: usize,
    queries: usize,
    locks: Rc<Cell<usize>>,
}

impl FakePhys {
    pub fn new(size: usize) -> Self {
        assert_eq!(size % PAGE_SIZE, 0);
        Self {
            ram: vec![0; size],
            regions: Vec::new(),
            read_status: VecDeque::new(),
            write_status: VecDeque::new(),
            lock_error: None,
            reads: Vec::new(),
            writes: Vec::new(),
            simple_accesses: 0,
            queries: 0,
            locks: Rc::new(Cell::new(0)),
        }
    }

    /// Overrides the behaviour of `range`. Later calls take priority.
    pub fn set_region(&mut self, range: Range<u64>, region: Region) {
        self.regions.insert(0, (range, region));
    }

    pub fn region(&self, paddr: u64) -> Region {
        self.regions
            .iter()
            .find(|(range, _)| range.contains(&paddr))
            .map(|(_, region)| *region)
            .unwrap_or(if paddr < self.ram.len() as u64 {
                Region::Ram
            } else {
                Region::Unassigned
            })
    }

    pub fn push_read_status(&mut self, status: PhysStatus) {
        self.read_status.push_back(status);
    }

    pub fn push_write_status(&mut self, status: PhysStatus) {
        self.write_status.push_back(status);
    }

    /// Makes the next `lock_page` fail with `err`.
    pub fn fail_next_lock(&mut self, err: PhysError) {
        self.lock_error = Some(err);
    }

    pub fn peek(&self, paddr: u64, len: usize) -> &[u8] {
        &self.ram[paddr as usize..paddr as usize + len]
    }

    pub fn poke(&mut self, paddr: u64, data: &[u8]) {
        self.ram[paddr as usize..paddr as usize + data.len()].copy_from_slice(data);
    }

    /// Handler-aware reads as `(paddr, len)`.
    pub fn reads(&self) -> &[(u64, usize)] {
        &self.reads
    }

    /// Handler-aware writes that were applied.
    pub fn writes(&self) -> &[PhysWrite] {
        &self.writes
    }

    pub fn clear_logs(&mut self) {
        self.reads.clear();
        self.writes.clear();
        self.simple_accesses = 0;
    }

    /// Accesses made through the handler-free path.
    pub fn simple_accesses(&self) -> usize {
        self.simple_accesses
    }

    /// `query_page` calls so far.
    pub fn queries(&self) -> usize {
        self.queries
    }

    /// Page locks currently held.
    pub fn locks_held(&self) -> usize {
        self.locks.get()
    }

    fn copy_out(&self, paddr: u64, dst: &mut [u8]) {
        for (i, byte) in dst.iter_mut().enumerate() {
            *byte = self.ram.get(paddr as usize + i).copied().unwrap_or(0xff);
        }
    }

    fn copy_in(&mut self, paddr: u64, src: &[u8]) {
        for (i, byte) in src.iter().enumerate() {
            if let Some(slot) = self.ram.get_mut(paddr as usize + i) {
                *slot = *byte;
            }
        }
    }
}

/// Lock guard handed out by [`FakePhys`].
#[derive(Debug)]
pub struct FakeLock {
    host: HostPage,
    held: Rc<Cell<usize>>,
}

impl PageLock for FakeLock {
    fn host_page(&self) -> HostPage {
        self.host
    }
}

impl Drop for FakeLock {
    fn drop(&mut self) {
        self.held.set(self.held.get() - 1);
    }
}

impl PhysMemory for FakePhys {
    type Lock = FakeLock;

    fn query_page(&mut self, page: u64) -> PhysPageInfo {
        self.queries += 1;
        let host = Some(HostPage(page >> PAGE_SHIFT));
        match self.region(page) {
            Region::Ram => PhysPageInfo {
                host,
                flags: PhysPageFlags::empty(),
            },
            Region::RamLocked => PhysPageInfo::default(),
            Region::WriteIntercept => PhysPageInfo {
                host,
                flags: PhysPageFlags::NO_WRITE,
            },
            Region::Mmio => PhysPageInfo {
                host: None,
                flags: PhysPageFlags::NO_WRITE | PhysPageFlags::NO_READ,
            },
            Region::Unassigned => PhysPageInfo {
                host: None,
                flags: PhysPageFlags::NO_WRITE
                    | PhysPageFlags::NO_READ
                    | PhysPageFlags::UNASSIGNED,
            },
        }
    }

    fn lock_page(&mut self, paddr: u64, write: bool) -> Result<FakeLock, PageMapFailure> {
        if let Some(err) = self.lock_error.take() {
            return Err(PageMapFailure::Error(err));
        }
        match self.region(paddr) {
            Region::Ram | Region::RamLocked => {}
            Region::WriteIntercept if !write => {}
            Region::WriteIntercept => return Err(PageMapFailure::CatchWrite),
            Region::Mmio => return Err(PageMapFailure::CatchAll),
            Region::Unassigned => return Err(PageMapFailure::Unassigned),
        }
        self.locks.set(self.locks.get() + 1);
        Ok(FakeLock {
            host: HostPage(paddr >> PAGE_SHIFT),
            held: Rc::clone(&self.locks),
        })
    }

    fn host_page(&self, page: HostPage) -> &[u8] {
        let start = (page.0 as usize) << PAGE_SHIFT;
        self.ram.get(start..start + PAGE_SIZE).unwrap_or(&[])
    }

    fn host_page_mut(&mut self, page: HostPage) -> &mut [u8] {
        let start = (page.0 as usize) << PAGE_SHIFT;
        self.ram.get_mut(start..start + PAGE_SIZE).unwrap_or(&mut [])
    }

    fn read(&mut self, paddr: u64, dst: &mut [u8]) -> PhysStatus {
        self.reads.push((paddr, dst.len()));
        let status = self.read_status.pop_front().unwrap_or(PhysStatus::Ok);
        if !matches!(status, PhysStatus::Failed(_)) {
            self.copy_out(paddr, dst);
        }
        status
    }

    fn write(&mut self, paddr: u64, src: &[u8]) -> PhysStatus {
        let status = self.write_status.pop_front().unwrap_or(PhysStatus::Ok);
        if !matches!(status, PhysStatus::Failed(_)) {
            self.copy_in(paddr, src);
            self.writes.push(PhysWrite {
                paddr,
                data: src.to_vec(),
            });
        }
        status
    }

    fn read_simple(&mut self, paddr: u64, dst: &mut [u8]) -> Result<(), PhysError> {
        self.simple_accesses += 1;
        self.copy_out(paddr, dst);
        Ok(())
    }

    fn write_simple(&mut self, paddr: u64, src: &[u8]) -> Result<(), PhysError> {
        self.simple_accesses += 1;
        self.copy_in(paddr, src);
        Ok(())
    }
}

/// Data breakpoints on fixed linear ranges.
#[derive(Debug, Default)]
pub struct FakeBreakpoints {
    ranges: Vec<(Range<u64>, DbgHits)>,
    checks: usize,
}

impl FakeBreakpoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn watch(&mut self, range: Range<u64>, hit: DbgHits) {
        self.ranges.push((range, hit));
    }

    pub fn checks(&self) -> usize {
        self.checks
    }
}

impl DataBreakpoints for FakeBreakpoints {
    fn check(&mut self, vaddr: u64, size: usize, _access: Access) -> DbgHits {
        self.checks += 1;
        let end = vaddr + size as u64;
        self.ranges
            .iter()
            .filter(|(range, _)| range.start < end && vaddr < range.end)
            .fold(DbgHits::empty(), |hits, (_, hit)| hits | *hit)
    }
}
