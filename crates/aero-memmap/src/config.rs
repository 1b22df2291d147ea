use thiserror::Error;

/// Where the host can perform a locked read-modify-write without tearing or trapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostAtomicPolicy {
    /// Any address works.
    Unrestricted,
    /// Only naturally aligned atomics (every misaligned atomic is split).
    NaturalAlignment,
    /// Misaligned atomics work as long as they stay within one aligned block of this many bytes
    /// (64 for x86 split-lock detection, 16 for LSE2).
    Block(u16),
}

impl HostAtomicPolicy {
    /// Policy matching the architecture this crate is compiled for.
    pub const fn for_host() -> Self {
        if cfg!(target_arch = "x86_64") {
            HostAtomicPolicy::Block(64)
        } else if cfg!(target_arch = "aarch64") {
            HostAtomicPolicy::Block(16)
        } else {
            HostAtomicPolicy::NaturalAlignment
        }
    }

    /// Whether a misaligned atomic access of `size` bytes at `vaddr` can be done directly.
    #[inline]
    pub(crate) fn allows_misaligned(self, vaddr: u64, size: usize) -> bool {
        match self {
            HostAtomicPolicy::Unrestricted => true,
            HostAtomicPolicy::NaturalAlignment => false,
            HostAtomicPolicy::Block(block) => {
                let block = u64::from(block);
                block - (vaddr & (block - 1)) >= size as u64
            }
        }
    }
}

/// Tunables for a [`MemMapper`](crate::MemMapper).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemMapConfig {
    /// Number of TLB buckets. Each bucket holds a local and a global entry.
    pub tlb_entries: usize,
    pub host_atomic: HostAtomicPolicy,
    /// Use the handler-free physical read/write path for scratch buffers.
    pub bypass_access_handlers: bool,
    /// Whether failed write-backs may be postponed to [`MemMapper::process_pending_commits`].
    ///
    /// [`MemMapper::process_pending_commits`]: crate::MemMapper::process_pending_commits
    pub deferred_commit: bool,
    /// Byte value read from unassigned physical memory.
    pub unassigned_fill: u8,
}

impl Default for MemMapConfig {
    fn default() -> Self {
        Self {
            tlb_entries: 256,
            host_atomic: HostAtomicPolicy::for_host(),
            bypass_access_handlers: false,
            deferred_commit: true,
            unassigned_fill: 0x00,
        }
    }
}

impl MemMapConfig {
    pub const MIN_TLB_ENTRIES: usize = 32;
    pub const MAX_TLB_ENTRIES: usize = 8192;

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.tlb_entries.is_power_of_two()
            || !(Self::MIN_TLB_ENTRIES..=Self::MAX_TLB_ENTRIES).contains(&self.tlb_entries)
        {
            return Err(ConfigError::TlbEntries {
                entries: self.tlb_entries,
            });
        }
        if let HostAtomicPolicy::Block(block) = self.host_atomic {
            if !block.is_power_of_two() || block < 2 {
                return Err(ConfigError::AtomicBlock { block });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("tlb entry count {entries} must be a power of two between 32 and 8192")]
    TlbEntries { entries: usize },
    #[error("host atomic block size {block} must be a power of two of at least 2")]
    AtomicBlock { block: u16 },
}
