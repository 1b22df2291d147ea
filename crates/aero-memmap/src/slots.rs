use bitflags::bitflags;
use tracing::warn;

use crate::backend::HostPage;
use crate::error::{MapError, Result};
use crate::{Access, BOUNCE_BUFFER_SIZE, MAX_MAPPINGS};

/// Proof of an open mapping, handed back on commit or rollback.
///
/// Encodes the slot index, a validity bit and the access type the slot was opened with, so a
/// token from a different mapping (or a stale one) is caught instead of unmapping the wrong
/// slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UnmapToken(u8);

impl UnmapToken {
    const VALID: u8 = 0x08;

    #[inline]
    fn new(slot: usize, access: Access) -> Self {
        debug_assert!(slot < MAX_MAPPINGS);
        Self(slot as u8 | Self::VALID | (access.type_bits() << 4))
    }

    /// Rebuilds a token from [`UnmapToken::raw`].
    #[inline]
    pub const fn from_raw(raw: u8) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u8 {
        self.0
    }

    #[inline]
    pub const fn slot(self) -> usize {
        (self.0 & 0x07) as usize
    }

    #[inline]
    fn type_bits(self) -> u8 {
        self.0 >> 4
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct SlotFlags: u8 {
        const BOUNCE_BUFFERED = 1 << 0;
        /// Direct mapping through a cached host page; there is no lock to release.
        const NOT_LOCKED = 1 << 1;
        const PENDING_WRITE_FIRST = 1 << 2;
        const PENDING_WRITE_SECOND = 1 << 3;

        const PENDING = Self::PENDING_WRITE_FIRST.bits() | Self::PENDING_WRITE_SECOND.bits();
    }
}

/// Scratch copy of a mapping that could not be served from a single host page.
pub(crate) struct BounceBuffer {
    pub(crate) data: [u8; BOUNCE_BUFFER_SIZE],
    pub(crate) first: u64,
    pub(crate) first_len: u16,
    /// Only meaningful when `second_len != 0`.
    pub(crate) second: u64,
    pub(crate) second_len: u16,
    /// The page was unassigned at map time; writes are dropped.
    pub(crate) unassigned: bool,
}

impl BounceBuffer {
    fn new() -> Self {
        Self {
            data: [0; BOUNCE_BUFFER_SIZE],
            first: 0,
            first_len: 0,
            second: 0,
            second_len: 0,
            unassigned: false,
        }
    }

    #[inline]
    pub(crate) fn first_chunk(&self) -> &[u8] {
        &self.data[..usize::from(self.first_len)]
    }

    #[inline]
    pub(crate) fn second_chunk(&self) -> &[u8] {
        let start = usize::from(self.first_len);
        &self.data[start..start + usize::from(self.second_len)]
    }
}

pub(crate) enum Backing<L> {
    Direct {
        host: HostPage,
        offset: u16,
        /// Released by dropping.
        lock: Option<L>,
    },
    Bounce,
}

pub(crate) struct MapSlot<L> {
    pub(crate) access: Access,
    pub(crate) flags: SlotFlags,
    pub(crate) len: u16,
    /// `None` while the slot is free.
    pub(crate) backing: Option<Backing<L>>,
    pub(crate) bounce: BounceBuffer,
}

impl<L> MapSlot<L> {
    fn free() -> Self {
        Self {
            access: Access::empty(),
            flags: SlotFlags::empty(),
            len: 0,
            backing: None,
            bounce: BounceBuffer::new(),
        }
    }

    #[inline]
    pub(crate) fn is_open(&self) -> bool {
        self.backing.is_some()
    }

    #[inline]
    pub(crate) fn is_pending(&self) -> bool {
        self.flags.intersects(SlotFlags::PENDING)
    }
}

/// The per-instruction table of open mappings.
pub(crate) struct MapSlots<L> {
    slots: [MapSlot<L>; MAX_MAPPINGS],
    next: usize,
    active: usize,
}

impl<L> MapSlots<L> {
    pub(crate) fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| MapSlot::free()),
            next: 0,
            active: 0,
        }
    }

    /// Free slot to use for the next mapping: the hint if it is free, else the first free one.
    pub(crate) fn find_free(&self) -> Result<usize> {
        if self.next < MAX_MAPPINGS && !self.slots[self.next].is_open() {
            return Ok(self.next);
        }
        match self.slots.iter().position(|slot| !slot.is_open()) {
            Some(index) => Ok(index),
            None => {
                warn!(active = self.active, "all mapping slots in use");
                Err(MapError::SlotsExhausted)
            }
        }
    }

    pub(crate) fn occupy(
        &mut self,
        index: usize,
        access: Access,
        flags: SlotFlags,
        len: u16,
        backing: Backing<L>,
    ) -> UnmapToken {
        let slot = &mut self.slots[index];
        debug_assert!(!slot.is_open());
        slot.access = access;
        slot.flags = flags;
        slot.len = len;
        slot.backing = Some(backing);
        self.next = index + 1;
        self.active += 1;
        UnmapToken::new(index, access)
    }

    /// Slot index named by `token`, if the token matches an open, non-pending mapping.
    pub(crate) fn resolve(&self, token: UnmapToken) -> Result<usize> {
        let index = token.slot();
        if token.raw() & UnmapToken::VALID == 0 || index >= MAX_MAPPINGS {
            return Err(MapError::BadUnmapToken(token.raw()));
        }
        let slot = &self.slots[index];
        if !slot.is_open() || slot.access.type_bits() != token.type_bits() {
            return Err(MapError::BadUnmapToken(token.raw()));
        }
        if slot.is_pending() {
            return Err(MapError::SlotPending { slot: index });
        }
        Ok(index)
    }

    /// Frees a slot, dropping (and so releasing) any page lock it holds.
    pub(crate) fn release(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        if slot.backing.take().is_some() {
            slot.flags = SlotFlags::empty();
            debug_assert!(self.active > 0);
            self.active -= 1;
        }
    }

    #[inline]
    pub(crate) fn slot(&self, index: usize) -> &MapSlot<L> {
        &self.slots[index]
    }

    #[inline]
    pub(crate) fn slot_mut(&mut self, index: usize) -> &mut MapSlot<L> {
        &mut self.slots[index]
    }

    #[inline]
    pub(crate) fn active(&self) -> usize {
        self.active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Lock;

    #[test]
    fn token_encoding() {
        let token = UnmapToken::new(2, Access::DATA_ATOMIC);
        assert_eq!(token.raw(), 0x02 | 0x08 | (0b011 << 4));
        assert_eq!(token.slot(), 2);
        assert_eq!(UnmapToken::from_raw(token.raw()), token);
    }

    #[test]
    fn round_robin_hint_then_linear_scan() {
        let mut slots = MapSlots::<Lock>::new();
        assert_eq!(slots.find_free().unwrap(), 0);
        slots.occupy(0, Access::DATA_R, SlotFlags::NOT_LOCKED, 4, Backing::Bounce);
        assert_eq!(slots.find_free().unwrap(), 1);
        slots.occupy(1, Access::DATA_R, SlotFlags::NOT_LOCKED, 4, Backing::Bounce);
        slots.release(0);
        // Hint points at 2, which is free.
        assert_eq!(slots.find_free().unwrap(), 2);
        slots.occupy(2, Access::DATA_R, SlotFlags::NOT_LOCKED, 4, Backing::Bounce);
        // Hint is past the end; scan finds 0.
        assert_eq!(slots.find_free().unwrap(), 0);
        slots.occupy(0, Access::DATA_W, SlotFlags::empty(), 4, Backing::Bounce);
        assert_eq!(slots.find_free(), Err(MapError::SlotsExhausted));
        assert_eq!(slots.active(), 3);
    }

    #[test]
    fn resolve_checks_validity_and_type() {
        let mut slots = MapSlots::<Lock>::new();
        let token = slots.occupy(0, Access::DATA_RW, SlotFlags::empty(), 2, Backing::Bounce);
        assert_eq!(slots.resolve(token), Ok(0));

        let wrong_type = UnmapToken::from_raw(token.raw() & 0x0f | (0b001 << 4));
        assert_eq!(
            slots.resolve(wrong_type),
            Err(MapError::BadUnmapToken(wrong_type.raw()))
        );
        let untagged = UnmapToken::from_raw(token.raw() & !UnmapToken::VALID);
        assert!(slots.resolve(untagged).is_err());

        slots.slot_mut(0).flags |= SlotFlags::PENDING_WRITE_SECOND;
        assert_eq!(slots.resolve(token), Err(MapError::SlotPending { slot: 0 }));

        slots.release(0);
        assert_eq!(slots.active(), 0);
        assert!(slots.resolve(token).is_err());
    }
}
