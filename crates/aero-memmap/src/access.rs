use bitflags::bitflags;

bitflags! {
    /// What a mapping is going to be used for.
    ///
    /// The low three bits form the access type proper (read/write/execute); the remaining bits
    /// qualify it. The access type is encoded into the [`UnmapToken`](crate::UnmapToken) and
    /// must match when the mapping is committed or rolled back.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Access: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        /// Stack push/pop.
        const STACK = 1 << 4;
        /// Implicit supervisor access (descriptor tables, TSS, ...). Never subject to user-mode
        /// page checks or guest alignment checks.
        const SYS = 1 << 6;
        /// A write that does not overwrite every mapped byte; scratch buffers are preloaded.
        const PARTIAL_WRITE = 1 << 8;
        /// Locked read-modify-write.
        const ATOMIC = 1 << 13;
    }
}

impl Access {
    pub const TYPE_MASK: Access = Access::READ.union(Access::WRITE).union(Access::EXEC);

    pub const DATA_R: Access = Access::READ;
    pub const DATA_W: Access = Access::WRITE;
    pub const DATA_RW: Access = Access::READ.union(Access::WRITE);
    pub const DATA_ATOMIC: Access = Access::DATA_RW.union(Access::ATOMIC);
    pub const STACK_R: Access = Access::READ.union(Access::STACK);
    pub const STACK_W: Access = Access::WRITE.union(Access::STACK);
    pub const STACK_RW: Access = Access::DATA_RW.union(Access::STACK);
    pub const SYS_R: Access = Access::READ.union(Access::SYS);
    pub const SYS_RW: Access = Access::DATA_RW.union(Access::SYS);
    pub const INSTRUCTION: Access = Access::EXEC;

    #[inline]
    pub fn is_read(self) -> bool {
        self.contains(Access::READ)
    }

    #[inline]
    pub fn is_write(self) -> bool {
        self.contains(Access::WRITE)
    }

    #[inline]
    pub fn is_exec(self) -> bool {
        self.contains(Access::EXEC)
    }

    #[inline]
    pub fn is_sys(self) -> bool {
        self.contains(Access::SYS)
    }

    #[inline]
    pub fn is_atomic(self) -> bool {
        self.contains(Access::ATOMIC)
    }

    /// Whether a scratch buffer for this access must hold the current guest bytes before the
    /// instruction sees it.
    #[inline]
    pub fn needs_preload(self) -> bool {
        self.intersects(Access::READ | Access::EXEC | Access::PARTIAL_WRITE)
    }

    /// Access type bits as stored in an unmap token.
    #[inline]
    pub(crate) fn type_bits(self) -> u8 {
        (self & Access::TYPE_MASK).bits() as u8
    }
}

bitflags! {
    /// How a misaligned access is reported to the guest.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AlignFlags: u8 {
        /// Misalignment raises #GP(0) rather than #AC(0).
        const GP = 1 << 0;
        /// SSE-style check: MXCSR.MM turns the #GP back into an #AC check.
        const SSE = 1 << 1;
        /// Raise #AC(0) instead of #GP(0) when the address is not 4-byte aligned and alignment
        /// checking is enabled (FXSAVE-style).
        const GP_OR_AC = 1 << 2;
    }
}

/// Alignment requirement of a single mapping request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AlignCtl {
    /// Address bits that must be clear for the access to count as aligned.
    pub mask: u16,
    pub flags: AlignFlags,
}

impl AlignCtl {
    /// Byte-granular access; never misaligned.
    pub const NONE: AlignCtl = AlignCtl {
        mask: 0,
        flags: AlignFlags::empty(),
    };

    /// Natural alignment for a power-of-two access size.
    #[inline]
    pub const fn natural(size: usize) -> Self {
        Self {
            mask: size.saturating_sub(1) as u16,
            flags: AlignFlags::empty(),
        }
    }

    #[inline]
    pub const fn with_flags(mask: u16, flags: AlignFlags) -> Self {
        Self { mask, flags }
    }

    #[inline]
    pub(crate) fn is_misaligned(self, vaddr: u64) -> bool {
        vaddr & u64::from(self.mask) != 0
    }
}

/// Per-vCPU execution state consulted by the mapping fast path.
///
/// The owning CPU model refreshes this whenever CPL, CR0 or the relevant flags change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuMode {
    /// Current privilege level (0-3).
    pub cpl: u8,
    /// CR0.WP: supervisor writes honour read-only pages.
    pub write_protect: bool,
    /// CR0.AM && EFLAGS.AC && CPL == 3.
    pub alignment_checks: bool,
    /// MXCSR.MM (misaligned SSE access mode).
    pub mxcsr_mm: bool,
}

impl Default for CpuMode {
    fn default() -> Self {
        Self {
            cpl: 0,
            write_protect: true,
            alignment_checks: false,
            mxcsr_mm: false,
        }
    }
}

impl CpuMode {
    /// Whether `access` is checked against user-mode page permissions.
    #[inline]
    pub fn is_user_access(&self, access: Access) -> bool {
        self.cpl == 3 && !access.is_sys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_bits_ignore_qualifiers() {
        assert_eq!(Access::DATA_ATOMIC.type_bits(), 0b011);
        assert_eq!(Access::STACK_W.type_bits(), 0b010);
        assert_eq!(Access::INSTRUCTION.type_bits(), 0b100);
        assert_eq!((Access::WRITE | Access::PARTIAL_WRITE).type_bits(), 0b010);
    }

    #[test]
    fn preload_rules() {
        assert!(Access::DATA_R.needs_preload());
        assert!(Access::INSTRUCTION.needs_preload());
        assert!((Access::WRITE | Access::PARTIAL_WRITE).needs_preload());
        assert!(!Access::DATA_W.needs_preload());
    }

    #[test]
    fn sys_accesses_are_never_user_accesses() {
        let mode = CpuMode {
            cpl: 3,
            ..CpuMode::default()
        };
        assert!(mode.is_user_access(Access::DATA_R));
        assert!(!mode.is_user_access(Access::SYS_R));
        assert!(!CpuMode::default().is_user_access(Access::DATA_R));
    }

    #[test]
    fn natural_alignment_mask() {
        assert_eq!(AlignCtl::natural(8).mask, 7);
        assert_eq!(AlignCtl::natural(1).mask, 0);
        assert!(AlignCtl::natural(8).is_misaligned(0x1004));
        assert!(!AlignCtl::natural(4).is_misaligned(0x1004));
    }
}
