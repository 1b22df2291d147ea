//! Scratch-buffer fallback: page-crossing accesses and memory that cannot be mapped directly.

use tracing::debug;

use crate::backend::{
    DataBreakpoints, InfoStatus, PageMapFailure, PageWalker, PhysError, PhysMemory, PhysStatus,
};
use crate::error::Result;
use crate::slots::{Backing, SlotFlags};
use crate::{Access, MemMapper, UnmapToken, PAGE_OFFSET_MASK, PAGE_SIZE};

/// Reads one chunk into a scratch buffer, folding informational statuses into `pass_up`.
pub(crate) fn read_chunk<P: PhysMemory>(
    phys: &mut P,
    bypass_handlers: bool,
    pass_up: &mut Option<InfoStatus>,
    paddr: u64,
    dst: &mut [u8],
) -> Result<(), PhysError> {
    if bypass_handlers {
        return phys.read_simple(paddr, dst);
    }
    match phys.read(paddr, dst) {
        PhysStatus::Ok => Ok(()),
        PhysStatus::Info(status) => {
            *pass_up = Some(InfoStatus::merge(*pass_up, status));
            Ok(())
        }
        PhysStatus::Failed(err) => Err(err),
    }
}

/// Writes one chunk of a scratch buffer back to guest memory.
pub(crate) fn write_chunk<P: PhysMemory>(
    phys: &mut P,
    bypass_handlers: bool,
    paddr: u64,
    src: &[u8],
) -> PhysStatus {
    if bypass_handlers {
        return match phys.write_simple(paddr, src) {
            Ok(()) => PhysStatus::Ok,
            Err(err) => PhysStatus::Failed(err),
        };
    }
    phys.write(paddr, src)
}

impl<W: PageWalker, P: PhysMemory, D: DataBreakpoints> MemMapper<W, P, D> {
    /// Maps an access that straddles two pages through the slot's scratch buffer.
    ///
    /// Both pages are translated (and permission checked) before anything is read, so a fault
    /// on the second page leaves no side effects.
    pub(crate) fn map_cross_page(
        &mut self,
        slot: usize,
        vaddr: u64,
        len: usize,
        access: Access,
    ) -> Result<UnmapToken> {
        let user = self.mode.is_user_access(access);
        let first_len = PAGE_SIZE - (vaddr & PAGE_OFFSET_MASK) as usize;
        let second_len = len - first_len;
        let second_vaddr = (vaddr & !PAGE_OFFSET_MASK).wrapping_add(PAGE_SIZE as u64);

        let first = self.walk(vaddr, len, access, user)?.paddr;
        let second = self.walk(second_vaddr, len, access, user)?.paddr & !PAGE_OFFSET_MASK;

        self.check_breakpoints(vaddr, first_len, access);
        self.check_breakpoints(second_vaddr, second_len, access);

        let bypass = self.config.bypass_access_handlers;
        let bounce = &mut self.slots.slot_mut(slot).bounce;
        if access.needs_preload() {
            let (head, tail) = bounce.data[..len].split_at_mut(first_len);
            read_chunk(&mut self.phys, bypass, &mut self.pass_up, first, head)?;
            read_chunk(&mut self.phys, bypass, &mut self.pass_up, second, tail)?;
        }
        bounce.first = first;
        bounce.first_len = first_len as u16;
        bounce.second = second;
        bounce.second_len = second_len as u16;
        bounce.unassigned = false;

        debug!(
            vaddr = format_args!("{vaddr:#x}"),
            first = format_args!("{first:#x}"),
            first_len,
            second = format_args!("{second:#x}"),
            second_len,
            ?access,
            "page-crossing access bounce buffered"
        );
        #[cfg(feature = "stats")]
        {
            self.stats.bounce_cross_page = self.stats.bounce_cross_page.wrapping_add(1);
        }

        Ok(self.slots.occupy(
            slot,
            access,
            SlotFlags::BOUNCE_BUFFERED,
            len as u16,
            Backing::Bounce,
        ))
    }

    /// Maps a single-page access to memory the physical backend refused to map directly.
    pub(crate) fn map_phys(
        &mut self,
        slot: usize,
        vaddr: u64,
        paddr: u64,
        len: usize,
        access: Access,
        failure: PageMapFailure,
    ) -> Result<UnmapToken> {
        let unassigned = match failure {
            PageMapFailure::Unassigned => true,
            PageMapFailure::CatchAll | PageMapFailure::CatchWrite => false,
            PageMapFailure::Error(err) => {
                debug!(paddr = format_args!("{paddr:#x}"), %err, "physical page mapping failed");
                return Err(err.into());
            }
        };
        #[cfg(feature = "stats")]
        {
            self.stats.potential_exits = self.stats.potential_exits.wrapping_add(1);
            self.stats.bounce_phys = self.stats.bounce_phys.wrapping_add(1);
        }

        let bypass = self.config.bypass_access_handlers;
        let fill = self.config.unassigned_fill;
        let bounce = &mut self.slots.slot_mut(slot).bounce;
        if access.needs_preload() {
            let dst = &mut bounce.data[..len];
            if unassigned {
                dst.fill(fill);
            } else if let Err(err) = read_chunk(&mut self.phys, bypass, &mut self.pass_up, paddr, dst)
            {
                debug!(paddr = format_args!("{paddr:#x}"), %err, "intercepted read failed");
                return Err(err.into());
            }
        }
        bounce.first = paddr;
        bounce.first_len = len as u16;
        bounce.second = 0;
        bounce.second_len = 0;
        bounce.unassigned = unassigned;

        debug!(
            vaddr = format_args!("{vaddr:#x}"),
            paddr = format_args!("{paddr:#x}"),
            len,
            ?failure,
            ?access,
            "physical access bounce buffered"
        );

        Ok(self.slots.occupy(
            slot,
            access,
            SlotFlags::BOUNCE_BUFFERED,
            len as u16,
            Backing::Bounce,
        ))
    }
}
