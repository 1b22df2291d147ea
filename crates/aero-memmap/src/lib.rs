//! Guest memory mapping for an instruction emulator.
//!
//! Every guest memory access made by an emulated instruction goes through [`MemMapper::map`],
//! which turns a linear address into bytes the instruction can use directly:
//! - a window into host-mapped guest RAM when the access stays within one page of plain RAM, or
//! - a per-slot scratch ("bounce") buffer when the access crosses a page boundary or hits
//!   intercepted/unassigned physical memory.
//!
//! Up to three mappings can be open at once. Each one ends with
//! [`MemMapper::commit_and_unmap`] (scratch buffers are written back) or
//! [`MemMapper::rollback_and_unmap`] (nothing is written); [`MemMapper::rollback_all`] abandons a
//! whole instruction.
//!
//! Translations are cached in a two-way software TLB with O(1) invalidation.

#![forbid(unsafe_code)]

mod access;
pub mod backend;
mod bounce;
mod commit;
mod config;
mod error;
mod ops;
mod slots;
mod tlb;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;


use tracing::{debug, trace};

pub use access::{Access, AlignCtl, AlignFlags, CpuMode};
pub use backend::{
    DataBreakpoints, DbgHits, HostPage, InfoStatus, NoBreakpoints, PageLock, PageMapFailure,
    PageSize, PageWalk, PageWalker, PhysError, PhysMemory, PhysPageFlags, PhysPageInfo,
    PhysStatus, PteFlags, WalkFault, WalkQuery,
};
pub use commit::CommitOutcome;
pub use config::{ConfigError, HostAtomicPolicy, MemMapConfig};
pub use error::{GuestFault, MapError, PageFault, Result};
pub use slots::UnmapToken;

use slots::{Backing, MapSlots, SlotFlags};
use tlb::{EntryFlags, Tlb};

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
pub const PAGE_OFFSET_MASK: u64 = PAGE_SIZE as u64 - 1;

/// Mappings a single instruction may hold open at once.
pub const MAX_MAPPINGS: usize = 3;

/// Capacity of each slot's scratch buffer, and so the widest single mapping.
pub const BOUNCE_BUFFER_SIZE: usize = 512;

/// Optional mapping/TLB statistics.
///
/// When the `stats` feature is disabled, this type contains no fields and
/// [`MemMapper::stats`] will always return `None`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MemMapStats {
    #[cfg(feature = "stats")]
    pub tlb_hits: u64,
    #[cfg(feature = "stats")]
    pub tlb_misses: u64,
    /// Misses loaded into the global half.
    #[cfg(feature = "stats")]
    pub tlb_global_loads: u64,

    /// Non-global flushes.
    #[cfg(feature = "stats")]
    pub tlb_flushes: u64,
    #[cfg(feature = "stats")]
    pub tlb_global_flushes: u64,
    /// Flushes that wrapped a revision counter and had to scrub tags.
    #[cfg(feature = "stats")]
    pub tlb_revision_rollovers: u64,
    #[cfg(feature = "stats")]
    pub tlb_phys_flushes: u64,
    #[cfg(feature = "stats")]
    pub tlb_phys_rollovers: u64,
    #[cfg(feature = "stats")]
    pub tlb_invlpg: u64,

    #[cfg(feature = "stats")]
    pub bounce_cross_page: u64,
    #[cfg(feature = "stats")]
    pub bounce_phys: u64,
    /// Atomic accesses handed back as [`MapError::EmulateSplitLock`].
    #[cfg(feature = "stats")]
    pub misaligned_atomics: u64,
    /// Accesses to intercepted or unassigned memory, each of which may need device work.
    #[cfg(feature = "stats")]
    pub potential_exits: u64,
}

/// Guest memory mapper for one vCPU.
///
/// Owns the translation cache and the open-mapping table; talks to the rest of the machine
/// through the page walker `W`, physical memory `P` and data-breakpoint checker `D`.
pub struct MemMapper<W, P: PhysMemory, D = NoBreakpoints> {
    walker: W,
    phys: P,
    breakpoints: D,
    config: MemMapConfig,
    mode: CpuMode,
    tlb: Tlb,
    slots: MapSlots<P::Lock>,
    breakpoints_armed: bool,
    pending_breakpoints: DbgHits,
    pass_up: Option<InfoStatus>,
    pending_commit: bool,
    #[cfg(feature = "stats")]
    stats: MemMapStats,
}

impl<W: PageWalker, P: PhysMemory> MemMapper<W, P, NoBreakpoints> {
    pub fn new(walker: W, phys: P) -> Self {
        Self::build(walker, phys, NoBreakpoints, MemMapConfig::default())
    }

    pub fn with_config(walker: W, phys: P, config: MemMapConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(walker, phys, NoBreakpoints, config))
    }
}

impl<W: PageWalker, P: PhysMemory, D: DataBreakpoints> MemMapper<W, P, D> {
    fn build(walker: W, phys: P, breakpoints: D, config: MemMapConfig) -> Self {
        Self {
            walker,
            phys,
            breakpoints,
            config,
            mode: CpuMode::default(),
            tlb: Tlb::new(config.tlb_entries),
            slots: MapSlots::new(),
            breakpoints_armed: false,
            pending_breakpoints: DbgHits::empty(),
            pass_up: None,
            pending_commit: false,
            #[cfg(feature = "stats")]
            stats: MemMapStats::default(),
        }
    }

    /// Replaces the data-breakpoint checker. Breakpoints start out disarmed.
    pub fn with_breakpoints<D2: DataBreakpoints>(self, breakpoints: D2) -> MemMapper<W, P, D2> {
        MemMapper {
            walker: self.walker,
            phys: self.phys,
            breakpoints,
            config: self.config,
            mode: self.mode,
            tlb: self.tlb,
            slots: self.slots,
            breakpoints_armed: false,
            pending_breakpoints: self.pending_breakpoints,
            pass_up: self.pass_up,
            pending_commit: self.pending_commit,
            #[cfg(feature = "stats")]
            stats: self.stats,
        }
    }

    #[inline]
    pub fn walker(&self) -> &W {
        &self.walker
    }

    #[inline]
    pub fn walker_mut(&mut self) -> &mut W {
        &mut self.walker
    }

    #[inline]
    pub fn phys(&self) -> &P {
        &self.phys
    }

    #[inline]
    pub fn phys_mut(&mut self) -> &mut P {
        &mut self.phys
    }

    #[inline]
    pub fn breakpoints_mut(&mut self) -> &mut D {
        &mut self.breakpoints
    }

    #[inline]
    pub fn config(&self) -> &MemMapConfig {
        &self.config
    }

    #[inline]
    pub fn cpu_mode(&self) -> CpuMode {
        self.mode
    }

    /// Updates CPL/CR0.WP/alignment-check state. Cached translations stay valid; callers flush
    /// the TLB themselves where the architecture requires it.
    #[inline]
    pub fn set_cpu_mode(&mut self, mode: CpuMode) {
        self.mode = mode;
    }

    /// Arms or disarms data-breakpoint checks.
    ///
    /// Arming flushes the TLB so every page goes through the slow path (and the breakpoint
    /// check) again.
    pub fn set_data_breakpoints_armed(&mut self, armed: bool) {
        if armed && !self.breakpoints_armed {
            self.invalidate_all_global();
        }
        self.breakpoints_armed = armed;
    }

    /// Breakpoint hits accumulated since the last call.
    #[inline]
    pub fn take_pending_breakpoints(&mut self) -> DbgHits {
        core::mem::take(&mut self.pending_breakpoints)
    }

    /// Highest-priority informational status collected from physical accesses since the last
    /// call.
    #[inline]
    pub fn take_pass_up_status(&mut self) -> Option<InfoStatus> {
        self.pass_up.take()
    }

    /// Number of open mappings, including ones with a deferred write pending.
    #[inline]
    pub fn active_mappings(&self) -> usize {
        self.slots.active()
    }

    /// Whether [`MemMapper::process_pending_commits`] has work to do.
    #[inline]
    pub fn has_pending_commits(&self) -> bool {
        self.pending_commit
    }

    /// Returns current statistics when the `stats` feature is enabled.
    #[inline]
    pub fn stats(&self) -> Option<MemMapStats> {
        #[cfg(feature = "stats")]
        {
            Some(self.stats)
        }

        #[cfg(not(feature = "stats"))]
        {
            None
        }
    }

    /// Resets statistics counters back to 0 when the `stats` feature is enabled.
    #[inline]
    pub fn reset_stats(&mut self) {
        #[cfg(feature = "stats")]
        {
            self.stats = MemMapStats::default();
        }
    }

    /// Flushes all non-global translations (MOV CR3 without PCID semantics).
    pub fn invalidate_all(&mut self) {
        let rolled_over = self.tlb.invalidate_all(false);
        trace!(rolled_over, "tlb flush");
        #[cfg(feature = "stats")]
        {
            self.stats.tlb_flushes = self.stats.tlb_flushes.wrapping_add(1);
            if rolled_over {
                self.stats.tlb_revision_rollovers =
                    self.stats.tlb_revision_rollovers.wrapping_add(1);
            }
        }
    }

    /// Flushes every translation, global ones included (CR4.PGE toggles, paging mode changes).
    pub fn invalidate_all_global(&mut self) {
        let rolled_over = self.tlb.invalidate_all(true);
        trace!(rolled_over, "global tlb flush");
        #[cfg(feature = "stats")]
        {
            self.stats.tlb_global_flushes = self.stats.tlb_global_flushes.wrapping_add(1);
            if rolled_over {
                self.stats.tlb_revision_rollovers =
                    self.stats.tlb_revision_rollovers.wrapping_add(1);
            }
        }
    }

    /// INVLPG.
    pub fn invalidate_page(&mut self, vaddr: u64) {
        self.tlb.invalidate_page(vaddr);
        #[cfg(feature = "stats")]
        {
            self.stats.tlb_invlpg = self.stats.tlb_invlpg.wrapping_add(1);
        }
    }

    /// Forgets cached host pages and physical access restrictions.
    ///
    /// Call whenever the guest-physical memory layout or page backing changes (RAM remapping,
    /// MMIO registration, write monitoring).
    pub fn invalidate_all_physical(&mut self) {
        let rolled_over = self.tlb.invalidate_all_physical();
        if rolled_over {
            debug!("physical tlb revision wrapped; scrubbed all entries");
        }
        #[cfg(feature = "stats")]
        {
            self.stats.tlb_phys_flushes = self.stats.tlb_phys_flushes.wrapping_add(1);
            if rolled_over {
                self.stats.tlb_phys_rollovers = self.stats.tlb_phys_rollovers.wrapping_add(1);
            }
        }
    }

    /// Maps `len` bytes at linear address `vaddr` for `access`.
    ///
    /// On success the bytes are available through [`MemMapper::mapped`] /
    /// [`MemMapper::mapped_mut`] until the returned token is committed or rolled back. On
    /// failure no slot is left open.
    pub fn map(
        &mut self,
        vaddr: u64,
        len: usize,
        access: Access,
        align: AlignCtl,
    ) -> Result<UnmapToken> {
        if len == 0 || len > BOUNCE_BUFFER_SIZE {
            return Err(MapError::InvalidSize { size: len });
        }
        let crosses_page = (vaddr & PAGE_OFFSET_MASK) as usize + len > PAGE_SIZE;

        let misaligned = align.is_misaligned(vaddr);
        if misaligned && !access.is_sys() {
            self.check_guest_alignment(vaddr, align)?;
        }
        // A bounce buffer cannot be updated atomically.
        if access.is_atomic()
            && (crosses_page
                || (misaligned && !self.config.host_atomic.allows_misaligned(vaddr, len)))
        {
            debug!(
                vaddr = format_args!("{vaddr:#x}"),
                len,
                crosses_page,
                "misaligned atomic needs split-lock emulation"
            );
            #[cfg(feature = "stats")]
            {
                self.stats.misaligned_atomics = self.stats.misaligned_atomics.wrapping_add(1);
            }
            return Err(MapError::EmulateSplitLock {
                addr: vaddr,
                size: len,
            });
        }

        let slot = self.slots.find_free()?;
        if crosses_page {
            return self.map_cross_page(slot, vaddr, len, access);
        }

        let user = self.mode.is_user_access(access);
        let tag = Tlb::tag_of(vaddr);
        let index = match self.tlb.lookup(tag, access.is_write()) {
            Some(index) => {
                #[cfg(feature = "stats")]
                {
                    self.stats.tlb_hits = self.stats.tlb_hits.wrapping_add(1);
                }
                self.check_cached_permissions(index, vaddr, access, user)?;
                if !self.tlb.phys_info_current(index) {
                    let info = self.phys.query_page(self.tlb.entry(index).phys_page);
                    self.tlb.set_phys_info(index, info);
                }
                index
            }
            None => {
                #[cfg(feature = "stats")]
                {
                    self.stats.tlb_misses = self.stats.tlb_misses.wrapping_add(1);
                }
                self.load_translation(vaddr, tag, len, access, user)?
            }
        };

        let entry = *self.tlb.entry(index);
        let paddr = entry.phys_page | (vaddr & PAGE_OFFSET_MASK);

        let mut denied = EntryFlags::empty();
        if access.is_write() {
            denied |= EntryFlags::PG_NO_WRITE;
        }
        if access.is_read() || access.is_exec() {
            denied |= EntryFlags::PG_NO_READ;
        }
        if entry.flags.intersects(denied) {
            let failure = if entry.flags.contains(EntryFlags::PG_UNASSIGNED) {
                PageMapFailure::Unassigned
            } else if entry.flags.contains(EntryFlags::PG_NO_READ) {
                PageMapFailure::CatchAll
            } else {
                PageMapFailure::CatchWrite
            };
            return self.map_phys(slot, vaddr, paddr, len, access, failure);
        }

        let offset = (vaddr & PAGE_OFFSET_MASK) as u16;
        let (backing, flags) = match entry.host {
            Some(host) => (
                Backing::Direct {
                    host,
                    offset,
                    lock: None,
                },
                SlotFlags::NOT_LOCKED,
            ),
            None => match self.phys.lock_page(paddr, access.is_write()) {
                Ok(lock) => (
                    Backing::Direct {
                        host: lock.host_page(),
                        offset,
                        lock: Some(lock),
                    },
                    SlotFlags::empty(),
                ),
                Err(failure) => return self.map_phys(slot, vaddr, paddr, len, access, failure),
            },
        };

        trace!(
            vaddr = format_args!("{vaddr:#x}"),
            paddr = format_args!("{paddr:#x}"),
            len,
            ?access,
            "direct mapping"
        );
        Ok(self.slots.occupy(slot, access, flags, len as u16, backing))
    }

    /// Bytes of an open mapping.
    pub fn mapped(&self, token: UnmapToken) -> Result<&[u8]> {
        let index = self.slots.resolve(token)?;
        let slot = self.slots.slot(index);
        let len = usize::from(slot.len);
        match &slot.backing {
            Some(Backing::Direct { host, offset, .. }) => {
                let start = usize::from(*offset);
                self.phys
                    .host_page(*host)
                    .get(start..start + len)
                    .ok_or(MapError::HostPageTooSmall { page: host.0 })
            }
            Some(Backing::Bounce) => Ok(&slot.bounce.data[..len]),
            None => Err(MapError::BadUnmapToken(token.raw())),
        }
    }

    /// Mutable bytes of an open mapping.
    ///
    /// Writing through a mapping that was opened without [`Access::WRITE`] is harmless for
    /// scratch buffers (they are never written back) but modifies guest RAM for direct ones.
    pub fn mapped_mut(&mut self, token: UnmapToken) -> Result<&mut [u8]> {
        let index = self.slots.resolve(token)?;
        let slot = self.slots.slot_mut(index);
        let len = usize::from(slot.len);
        match &slot.backing {
            Some(Backing::Direct { host, offset, .. }) => {
                let (host, start) = (*host, usize::from(*offset));
                self.phys
                    .host_page_mut(host)
                    .get_mut(start..start + len)
                    .ok_or(MapError::HostPageTooSmall { page: host.0 })
            }
            Some(Backing::Bounce) => Ok(&mut slot.bounce.data[..len]),
            None => Err(MapError::BadUnmapToken(token.raw())),
        }
    }

    fn check_guest_alignment(&self, vaddr: u64, align: AlignCtl) -> Result<(), GuestFault> {
        let flags = align.flags;
        if !flags.contains(AlignFlags::GP) || (flags.contains(AlignFlags::SSE) && self.mode.mxcsr_mm)
        {
            if self.mode.alignment_checks {
                return Err(GuestFault::AlignmentCheck);
            }
            Ok(())
        } else if flags.contains(AlignFlags::GP_OR_AC)
            && vaddr & 3 != 0
            && self.mode.alignment_checks
        {
            Err(GuestFault::AlignmentCheck)
        } else {
            Err(GuestFault::GeneralProtection)
        }
    }

    /// Permission checks for a TLB hit. Misses get these from the walker instead.
    fn check_cached_permissions(
        &self,
        index: usize,
        vaddr: u64,
        access: Access,
        user: bool,
    ) -> Result<()> {
        let flags = self.tlb.entry(index).flags;
        if !flags.intersects(EntryFlags::NO_WRITE | EntryFlags::NO_USER | EntryFlags::NO_EXEC) {
            return Ok(());
        }

        if flags.contains(EntryFlags::NO_WRITE)
            && access.is_write()
            && (user || self.mode.write_protect)
        {
            debug!(vaddr = format_args!("{vaddr:#x}"), "write to read-only page");
            return Err(page_fault(
                vaddr,
                access.difference(Access::READ),
                user,
                WalkFault::AccessDenied,
            ));
        }
        if flags.contains(EntryFlags::NO_USER) && user {
            debug!(vaddr = format_args!("{vaddr:#x}"), "user access to supervisor page");
            return Err(page_fault(vaddr, access, user, WalkFault::AccessDenied));
        }
        if flags.contains(EntryFlags::NO_EXEC) && access.is_exec() {
            debug!(vaddr = format_args!("{vaddr:#x}"), "execute from no-execute page");
            return Err(page_fault(vaddr, access, user, WalkFault::AccessDenied));
        }
        Ok(())
    }

    /// Slow path: walk, check data breakpoints and cache the result.
    fn load_translation(
        &mut self,
        vaddr: u64,
        tag: u64,
        len: usize,
        access: Access,
        user: bool,
    ) -> Result<usize> {
        let walk = self.walk(vaddr, len, access, user)?;

        let mut flags = EntryFlags::from_walk(walk.effective, walk.page_size);
        if self.breakpoints_armed {
            let hit = !self.check_breakpoints(vaddr, len, access).is_empty();
            // Accesses elsewhere on a watched page must not be served from the cache either.
            if hit || self.page_watched(vaddr) {
                flags |= EntryFlags::WATCHED;
            }
        }

        // Global entries are only worth it for code running at CPL 0.
        let global = walk.effective.contains(PteFlags::GLOBAL) && self.mode.cpl == 0;
        #[cfg(feature = "stats")]
        {
            if global {
                self.stats.tlb_global_loads = self.stats.tlb_global_loads.wrapping_add(1);
            }
        }

        let phys_page = walk.paddr & !PAGE_OFFSET_MASK;
        let index = self.tlb.load(tag, global, phys_page, flags, walk.page_size);
        let info = self.phys.query_page(phys_page);
        self.tlb.set_phys_info(index, info);
        trace!(
            vaddr = format_args!("{vaddr:#x}"),
            phys_page = format_args!("{phys_page:#x}"),
            global,
            ?flags,
            "tlb load"
        );
        Ok(index)
    }

    fn walk(&mut self, vaddr: u64, len: usize, access: Access, user: bool) -> Result<PageWalk> {
        let query = WalkQuery {
            access,
            user,
            write_protect: self.mode.write_protect,
            size: len,
        };
        self.walker.walk(vaddr, query).map_err(|reason| {
            debug!(vaddr = format_args!("{vaddr:#x}"), ?reason, ?access, "page walk failed");
            page_fault(vaddr, access, user, reason)
        })
    }

    fn check_breakpoints(&mut self, vaddr: u64, len: usize, access: Access) -> DbgHits {
        if !self.breakpoints_armed {
            return DbgHits::empty();
        }
        let hits = self.breakpoints.check(vaddr, len, access);
        if !hits.is_empty() {
            debug!(vaddr = format_args!("{vaddr:#x}"), len, ?hits, "data breakpoint hit");
            self.pending_breakpoints |= hits;
        }
        hits
    }

    /// Whether any breakpoint, read or write, overlaps the page containing `vaddr`. Does not
    /// record hits.
    fn page_watched(&mut self, vaddr: u64) -> bool {
        !self
            .breakpoints
            .check(vaddr & !PAGE_OFFSET_MASK, PAGE_SIZE, Access::DATA_RW)
            .is_empty()
    }
}

fn page_fault(vaddr: u64, access: Access, user: bool, reason: WalkFault) -> MapError {
    MapError::Fault(GuestFault::PageFault(PageFault::new(
        vaddr, access, user, reason,
    )))
}
