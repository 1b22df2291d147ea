use bitflags::bitflags;

use crate::backend::{HostPage, PageSize, PhysPageFlags, PhysPageInfo, PteFlags};
use crate::PAGE_SHIFT;

/// Virtual page-number bits kept in a tag. Covers 48-bit linear addresses.
const TAG_ADDR_BITS: u32 = 36;
/// Revision counters live above the page number, so bumping one retires every tag at once.
pub(crate) const REVISION_INCR: u64 = 1 << TAG_ADDR_BITS;
const TAG_NO_REV_MASK: u64 = REVISION_INCR - 1;
pub(crate) const PHYS_REV_INCR: u64 = 1 << 11;

bitflags! {
    /// Denial flags of a cached translation. All clear means "anything goes".
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct EntryFlags: u16 {
        const NO_EXEC = 1 << 0;
        const NO_WRITE = 1 << 1;
        const NO_USER = 1 << 2;
        const PG_NO_WRITE = 1 << 3;
        const PG_NO_READ = 1 << 4;
        const NO_ACCESSED = 1 << 5;
        const NO_DIRTY = 1 << 6;
        const LARGE_PAGE = 1 << 7;
        const PG_UNASSIGNED = 1 << 8;
        /// A data breakpoint covers this page; every access must take the slow path.
        const WATCHED = 1 << 9;

        const PHYS_INFO = Self::PG_NO_WRITE.bits()
            | Self::PG_NO_READ.bits()
            | Self::PG_UNASSIGNED.bits();
    }
}

impl EntryFlags {
    pub(crate) fn from_walk(effective: PteFlags, page_size: PageSize) -> Self {
        let mut flags = EntryFlags::empty();
        if !effective.contains(PteFlags::WRITE) {
            flags |= EntryFlags::NO_WRITE;
        }
        if !effective.contains(PteFlags::USER) {
            flags |= EntryFlags::NO_USER;
        }
        if !effective.contains(PteFlags::ACCESSED) {
            flags |= EntryFlags::NO_ACCESSED;
        }
        if !effective.contains(PteFlags::DIRTY) {
            flags |= EntryFlags::NO_DIRTY;
        }
        if effective.contains(PteFlags::NO_EXEC) {
            flags |= EntryFlags::NO_EXEC;
        }
        if page_size.is_large() {
            flags |= EntryFlags::LARGE_PAGE;
        }
        flags
    }

    fn from_phys(phys: PhysPageFlags) -> Self {
        let mut flags = EntryFlags::empty();
        if phys.contains(PhysPageFlags::NO_WRITE) {
            flags |= EntryFlags::PG_NO_WRITE;
        }
        if phys.contains(PhysPageFlags::NO_READ) {
            flags |= EntryFlags::PG_NO_READ;
        }
        if phys.contains(PhysPageFlags::UNASSIGNED) {
            flags |= EntryFlags::PG_UNASSIGNED;
        }
        flags
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct TlbEntry {
    /// Virtual page number ORed with the revision it was loaded under. Zero is never valid.
    pub(crate) tag: u64,
    pub(crate) phys_page: u64,
    pub(crate) host: Option<HostPage>,
    pub(crate) flags: EntryFlags,
    /// Physical revision the `host`/`PG_*` info was resolved under.
    pub(crate) phys_rev: u64,
    page_size: PageSize,
}

impl Default for TlbEntry {
    fn default() -> Self {
        Self {
            tag: 0,
            phys_page: 0,
            host: None,
            flags: EntryFlags::empty(),
            phys_rev: 0,
            page_size: PageSize::Size4K,
        }
    }
}

/// Range of tags covered by large pages loaded since the last full flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LargePageRange {
    first_tag: u64,
    last_tag: u64,
}

impl LargePageRange {
    const EMPTY: LargePageRange = LargePageRange {
        first_tag: u64::MAX,
        last_tag: 0,
    };

    #[inline]
    fn contains(&self, tag: u64) -> bool {
        self.first_tag <= tag && tag <= self.last_tag
    }
}

/// Two-way translation cache: every bucket has an even (local) and an odd (global) entry.
///
/// Global entries are only retired by a global flush; local ones by any flush.
pub(crate) struct Tlb {
    entries: Box<[TlbEntry]>,
    index_mask: u64,
    revision: u64,
    revision_global: u64,
    phys_rev: u64,
    large_local: LargePageRange,
    large_global: LargePageRange,
}

impl Tlb {
    pub(crate) fn new(buckets: usize) -> Self {
        debug_assert!(buckets.is_power_of_two());
        Self {
            entries: vec![TlbEntry::default(); buckets * 2].into_boxed_slice(),
            index_mask: buckets as u64 - 1,
            revision: REVISION_INCR,
            revision_global: REVISION_INCR,
            phys_rev: PHYS_REV_INCR * 2,
            large_local: LargePageRange::EMPTY,
            large_global: LargePageRange::EMPTY,
        }
    }

    #[inline]
    pub(crate) fn tag_of(vaddr: u64) -> u64 {
        (vaddr << 16) >> (PAGE_SHIFT + 16)
    }

    #[inline]
    fn even_index(&self, tag: u64) -> usize {
        ((tag & self.index_mask) as usize) * 2
    }

    /// Index of a usable entry for `tag`, local half first.
    ///
    /// Entries that would need the accessed bit (or the dirty bit, for writes) set by the walker
    /// are not usable, and neither are watched pages.
    #[inline]
    pub(crate) fn lookup(&self, tag: u64, write: bool) -> Option<usize> {
        let mut unusable = EntryFlags::NO_ACCESSED | EntryFlags::WATCHED;
        if write {
            unusable |= EntryFlags::NO_DIRTY;
        }

        let even = self.even_index(tag);
        let local = &self.entries[even];
        if local.tag == tag | self.revision && !local.flags.intersects(unusable) {
            return Some(even);
        }
        let global = &self.entries[even + 1];
        if global.tag == tag | self.revision_global && !global.flags.intersects(unusable) {
            return Some(even + 1);
        }
        None
    }

    #[inline]
    pub(crate) fn entry(&self, index: usize) -> &TlbEntry {
        &self.entries[index]
    }

    /// Caches a walk result and returns the index of the new entry.
    pub(crate) fn load(
        &mut self,
        tag: u64,
        global: bool,
        phys_page: u64,
        flags: EntryFlags,
        page_size: PageSize,
    ) -> usize {
        let index = self.even_index(tag) + usize::from(global);
        let revision = if global {
            self.revision_global
        } else {
            self.revision
        };
        if page_size.is_large() {
            self.track_large_page(tag, global, page_size);
        }
        self.entries[index] = TlbEntry {
            tag: tag | revision,
            phys_page,
            host: None,
            flags,
            phys_rev: 0,
            page_size,
        };
        index
    }

    fn track_large_page(&mut self, tag: u64, global: bool, page_size: PageSize) {
        let pages = page_size.bytes() >> PAGE_SHIFT;
        let first = tag & !(pages - 1);
        let last = first + pages - 1;
        let range = if global {
            &mut self.large_global
        } else {
            &mut self.large_local
        };
        range.first_tag = range.first_tag.min(first);
        range.last_tag = range.last_tag.max(last);
    }

    #[inline]
    pub(crate) fn phys_info_current(&self, index: usize) -> bool {
        self.entries[index].phys_rev == self.phys_rev
    }

    /// Records the physical page info for an entry under the current physical revision.
    pub(crate) fn set_phys_info(&mut self, index: usize, info: PhysPageInfo) {
        let phys_rev = self.phys_rev;
        let entry = &mut self.entries[index];
        entry.flags = entry.flags.difference(EntryFlags::PHYS_INFO) | EntryFlags::from_phys(info.flags);
        entry.host = info.host;
        entry.phys_rev = phys_rev;
    }

    /// Retires every local entry (and global ones too if `include_global`).
    ///
    /// Returns `true` if a revision counter wrapped and tags had to be scrubbed explicitly.
    pub(crate) fn invalidate_all(&mut self, include_global: bool) -> bool {
        let mut rolled_over = false;

        self.revision = self.revision.wrapping_add(REVISION_INCR);
        if self.revision == 0 {
            self.revision = REVISION_INCR;
            for entry in self.entries.iter_mut().step_by(2) {
                entry.tag = 0;
            }
            rolled_over = true;
        }
        self.large_local = LargePageRange::EMPTY;

        if include_global {
            self.revision_global = self.revision_global.wrapping_add(REVISION_INCR);
            if self.revision_global == 0 {
                self.revision_global = REVISION_INCR;
                for entry in self.entries.iter_mut().skip(1).step_by(2) {
                    entry.tag = 0;
                }
                rolled_over = true;
            }
            self.large_global = LargePageRange::EMPTY;
        }

        rolled_over
    }

    /// Drops any translation of the page containing `vaddr`, including large-page entries that
    /// cover it.
    pub(crate) fn invalidate_page(&mut self, vaddr: u64) {
        let tag = Self::tag_of(vaddr);
        let even = self.even_index(tag);
        if self.entries[even].tag == tag | self.revision {
            self.entries[even].tag = 0;
        }
        if self.entries[even + 1].tag == tag | self.revision_global {
            self.entries[even + 1].tag = 0;
        }

        if self.large_local.contains(tag) {
            self.invalidate_large_page(tag, false);
        }
        if self.large_global.contains(tag) {
            self.invalidate_large_page(tag, true);
        }
    }

    fn invalidate_large_page(&mut self, tag: u64, global: bool) {
        let revision = if global {
            self.revision_global
        } else {
            self.revision
        };
        for entry in self.entries.iter_mut().skip(usize::from(global)).step_by(2) {
            if !entry.flags.contains(EntryFlags::LARGE_PAGE)
                || entry.tag & !TAG_NO_REV_MASK != revision
            {
                continue;
            }
            let pages = entry.page_size.bytes() >> PAGE_SHIFT;
            if (entry.tag & TAG_NO_REV_MASK) & !(pages - 1) == tag & !(pages - 1) {
                entry.tag = 0;
            }
        }
    }

    /// Forgets every cached host mapping and physical-page restriction.
    ///
    /// Returns `true` if the counter wrapped and every entry had to be scrubbed explicitly.
    pub(crate) fn invalidate_all_physical(&mut self) -> bool {
        let next = self.phys_rev.wrapping_add(PHYS_REV_INCR);
        if next > PHYS_REV_INCR * 2 {
            self.phys_rev = next;
            return false;
        }

        self.phys_rev = PHYS_REV_INCR * 2;
        for entry in self.entries.iter_mut() {
            entry.phys_rev = 0;
            entry.host = None;
            entry.flags = entry.flags.difference(EntryFlags::PHYS_INFO);
        }
        true
    }

    #[cfg(test)]
    pub(crate) fn force_revisions(&mut self, local: u64, global: u64) {
        self.revision = local;
        self.revision_global = global;
    }

    #[cfg(test)]
    pub(crate) fn force_phys_revision(&mut self, phys_rev: u64) {
        self.phys_rev = phys_rev;
    }
}
