use thiserror::Error;

use crate::backend::{PhysError, WalkFault};
use crate::Access;

const PF_ERR_PRESENT: u32 = 1 << 0;
const PF_ERR_WRITE: u32 = 1 << 1;
const PF_ERR_USER: u32 = 1 << 2;
const PF_ERR_RSVD: u32 = 1 << 3;
const PF_ERR_INSTR_FETCH: u32 = 1 << 4;

/// #PF details.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFault {
    /// Faulting linear address (CR2).
    pub addr: u64,
    /// Error code as per Intel SDM.
    pub error_code: u32,
    pub reason: WalkFault,
}

impl PageFault {
    pub fn new(addr: u64, access: Access, user: bool, reason: WalkFault) -> Self {
        let mut error_code = 0u32;
        if access.is_write() {
            error_code |= PF_ERR_WRITE;
        }
        if user {
            error_code |= PF_ERR_USER;
        }
        if access.is_exec() {
            error_code |= PF_ERR_INSTR_FETCH;
        }
        match reason {
            WalkFault::NotPresent => {}
            WalkFault::ReservedBit => error_code |= PF_ERR_PRESENT | PF_ERR_RSVD,
            WalkFault::AccessDenied | WalkFault::BadPhysAddr => error_code |= PF_ERR_PRESENT,
        }
        Self {
            addr,
            error_code,
            reason,
        }
    }
}

/// Architectural exception the caller must deliver to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GuestFault {
    #[error("#PF at {:#x} (error code {:#x})", .0.addr, .0.error_code)]
    PageFault(PageFault),
    #[error("#GP(0)")]
    GeneralProtection,
    #[error("#AC(0)")]
    AlignmentCheck,
}

/// Failure of a mapping operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MapError {
    #[error(transparent)]
    Fault(#[from] GuestFault),

    /// The access is atomic but the host cannot perform it atomically at this address; the
    /// instruction must be re-run through the split-lock emulation path.
    #[error("atomic access of {size} bytes at {addr:#x} must be emulated as a split lock")]
    EmulateSplitLock { addr: u64, size: usize },

    #[error(transparent)]
    Phys(#[from] PhysError),

    #[error("mapping size {size} is out of range")]
    InvalidSize { size: usize },

    #[error("no free mapping slot")]
    SlotsExhausted,

    #[error("invalid unmap token {0:#04x}")]
    BadUnmapToken(u8),

    #[error("mapping slot {slot} has a deferred write pending")]
    SlotPending { slot: usize },

    #[error("host page {page:#x} is shorter than a guest page")]
    HostPageTooSmall { page: u64 },
}

impl MapError {
    /// Internal-consistency errors: the caller used the mapping API incorrectly or a backend
    /// broke its contract. Never guest visible.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            MapError::InvalidSize { .. }
                | MapError::SlotsExhausted
                | MapError::BadUnmapToken(_)
                | MapError::SlotPending { .. }
                | MapError::HostPageTooSmall { .. }
        )
    }

    /// The guest fault, if this error is one.
    pub fn guest_fault(&self) -> Option<GuestFault> {
        match self {
            MapError::Fault(fault) => Some(*fault),
            _ => None,
        }
    }
}

pub type Result<T, E = MapError> = core::result::Result<T, E>;
