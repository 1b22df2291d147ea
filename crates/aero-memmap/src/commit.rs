use tracing::{debug, trace, warn};

use crate::backend::{DataBreakpoints, InfoStatus, PageWalker, PhysError, PhysMemory, PhysStatus};
use crate::bounce::write_chunk;
use crate::error::{MapError, Result};
use crate::slots::SlotFlags;
use crate::{MemMapper, UnmapToken, MAX_MAPPINGS};

/// How a deferrable commit finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Everything was written and the slot is free.
    Done,
    /// Part of the write-back failed and was queued for
    /// [`MemMapper::process_pending_commits`]; the slot stays occupied until then.
    Deferred,
}

enum WriteBack {
    Done,
    Failed { pending: SlotFlags, err: PhysError },
}

impl<W: PageWalker, P: PhysMemory, D: DataBreakpoints> MemMapper<W, P, D> {
    /// Writes back a scratch-buffered write mapping (if any) and frees the slot.
    ///
    /// If the write-back fails the slot stays open; the instruction is expected to be abandoned
    /// with [`MemMapper::rollback_all`].
    pub fn commit_and_unmap(&mut self, token: UnmapToken) -> Result<()> {
        let index = self.slots.resolve(token)?;
        self.commit_slot(index, false).map(|_| ())
    }

    /// Like [`MemMapper::commit_and_unmap`], but a failed write-back is postponed rather than
    /// reported when [`MemMapConfig::deferred_commit`] allows it.
    ///
    /// [`MemMapConfig::deferred_commit`]: crate::MemMapConfig::deferred_commit
    pub fn commit_and_unmap_deferrable(&mut self, token: UnmapToken) -> Result<CommitOutcome> {
        let index = self.slots.resolve(token)?;
        self.commit_slot(index, self.config.deferred_commit)
    }

    /// Frees the slot without writing anything back.
    pub fn rollback_and_unmap(&mut self, token: UnmapToken) -> Result<()> {
        let index = self.slots.resolve(token)?;
        trace!(slot = index, "rollback");
        self.slots.release(index);
        Ok(())
    }

    /// Abandons every open mapping of the current instruction.
    ///
    /// Slots with a deferred write pending are left for
    /// [`MemMapper::process_pending_commits`].
    pub fn rollback_all(&mut self) {
        for index in (0..MAX_MAPPINGS).rev() {
            let slot = self.slots.slot(index);
            if !slot.is_open() {
                continue;
            }
            if slot.is_pending() {
                debug!(slot = index, "keeping mapping with deferred write");
                continue;
            }
            trace!(slot = index, "rollback");
            self.slots.release(index);
        }
    }

    /// Replays deferred write-backs, each pending chunk exactly once, and frees their slots.
    ///
    /// Returns the highest-priority informational status of the replayed writes, or the first
    /// hard failure. Slots are freed either way.
    pub fn process_pending_commits(&mut self) -> Result<Option<InfoStatus>> {
        self.pending_commit = false;

        let bypass = self.config.bypass_access_handlers;
        let mut status = None;
        let mut failure = None;
        for index in (0..MAX_MAPPINGS).rev() {
            let slot = self.slots.slot(index);
            if !slot.is_open() || !slot.is_pending() {
                continue;
            }
            debug_assert!(slot.flags.contains(SlotFlags::BOUNCE_BUFFERED));

            let bounce = &slot.bounce;
            let mut chunks = [None, None];
            if slot.flags.contains(SlotFlags::PENDING_WRITE_FIRST) {
                chunks[0] = Some((bounce.first, bounce.first_chunk()));
            }
            if slot.flags.contains(SlotFlags::PENDING_WRITE_SECOND) {
                chunks[1] = Some((bounce.second, bounce.second_chunk()));
            }
            for (paddr, src) in chunks.into_iter().flatten() {
                match write_chunk(&mut self.phys, bypass, paddr, src) {
                    PhysStatus::Ok => {}
                    PhysStatus::Info(info) => status = Some(InfoStatus::merge(status, info)),
                    PhysStatus::Failed(err) => {
                        warn!(
                            slot = index,
                            paddr = format_args!("{paddr:#x}"),
                            %err,
                            "deferred write-back failed"
                        );
                        if failure.is_none() {
                            failure = Some(err);
                        }
                    }
                }
            }
            trace!(slot = index, "deferred write-back replayed");
            self.slots.release(index);
        }

        match failure {
            Some(err) => Err(MapError::Phys(err)),
            None => Ok(status),
        }
    }

    fn commit_slot(&mut self, index: usize, may_defer: bool) -> Result<CommitOutcome> {
        let slot = self.slots.slot(index);
        if slot.flags.contains(SlotFlags::BOUNCE_BUFFERED) && slot.access.is_write() {
            if let WriteBack::Failed { pending, err } = self.write_back(index) {
                if may_defer {
                    debug!(slot = index, ?pending, %err, "write-back postponed");
                    self.slots.slot_mut(index).flags |= pending;
                    self.pending_commit = true;
                    return Ok(CommitOutcome::Deferred);
                }
                warn!(slot = index, %err, "write-back failed");
                return Err(err.into());
            }
        }

        trace!(slot = index, "commit");
        self.slots.release(index);
        Ok(CommitOutcome::Done)
    }

    /// Writes the first chunk, then the second only if the first went through.
    fn write_back(&mut self, index: usize) -> WriteBack {
        let bypass = self.config.bypass_access_handlers;
        let bounce = &self.slots.slot(index).bounce;
        if bounce.unassigned {
            trace!(slot = index, "dropping write to unassigned memory");
            return WriteBack::Done;
        }

        match write_chunk(&mut self.phys, bypass, bounce.first, bounce.first_chunk()) {
            PhysStatus::Ok => {}
            PhysStatus::Info(info) => self.pass_up = Some(InfoStatus::merge(self.pass_up, info)),
            PhysStatus::Failed(err) => {
                let mut pending = SlotFlags::PENDING_WRITE_FIRST;
                if bounce.second_len != 0 {
                    pending |= SlotFlags::PENDING_WRITE_SECOND;
                }
                return WriteBack::Failed { pending, err };
            }
        }

        if bounce.second_len != 0 {
            match write_chunk(&mut self.phys, bypass, bounce.second, bounce.second_chunk()) {
                PhysStatus::Ok => {}
                PhysStatus::Info(info) => {
                    self.pass_up = Some(InfoStatus::merge(self.pass_up, info))
                }
                PhysStatus::Failed(err) => {
                    return WriteBack::Failed {
                        pending: SlotFlags::PENDING_WRITE_SECOND,
                        err,
                    }
                }
            }
        }
        WriteBack::Done
    }
}
