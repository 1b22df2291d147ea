//! Convenience accessors built on [`MemMapper::map`] for callers that do not need to hold a
//! mapping open across several steps.

use crate::backend::{DataBreakpoints, PageWalker, PhysMemory};
use crate::error::{MapError, Result};
use crate::{
    Access, AlignCtl, MemMapper, UnmapToken, BOUNCE_BUFFER_SIZE, PAGE_OFFSET_MASK, PAGE_SIZE,
};

impl<W: PageWalker, P: PhysMemory, D: DataBreakpoints> MemMapper<W, P, D> {
    fn fetch<const N: usize>(&mut self, vaddr: u64, access: Access) -> Result<[u8; N]> {
        let token = self.map(vaddr, N, access, AlignCtl::natural(N))?;
        let mut out = [0u8; N];
        match self.mapped(token) {
            Ok(bytes) => out.copy_from_slice(bytes),
            Err(err) => return Err(self.abandon(token, err)),
        }
        self.finish(token)?;
        Ok(out)
    }

    fn store<const N: usize>(&mut self, vaddr: u64, access: Access, bytes: [u8; N]) -> Result<()> {
        let token = self.map(vaddr, N, access, AlignCtl::natural(N))?;
        match self.mapped_mut(token) {
            Ok(dst) => dst.copy_from_slice(&bytes),
            Err(err) => return Err(self.abandon(token, err)),
        }
        self.finish(token)
    }

    /// Commits, and rolls the mapping back if that fails so no slot stays open.
    fn finish(&mut self, token: UnmapToken) -> Result<()> {
        self.commit_and_unmap(token).map_err(|err| self.abandon(token, err))
    }

    fn abandon(&mut self, token: UnmapToken, err: MapError) -> MapError {
        // The token is known good here; a second failure would only repeat `err`.
        let _ = self.rollback_and_unmap(token);
        err
    }

    pub fn fetch_u8(&mut self, vaddr: u64) -> Result<u8> {
        self.fetch::<1>(vaddr, Access::DATA_R).map(u8::from_le_bytes)
    }

    pub fn fetch_u16(&mut self, vaddr: u64) -> Result<u16> {
        self.fetch::<2>(vaddr, Access::DATA_R).map(u16::from_le_bytes)
    }

    pub fn fetch_u32(&mut self, vaddr: u64) -> Result<u32> {
        self.fetch::<4>(vaddr, Access::DATA_R).map(u32::from_le_bytes)
    }

    pub fn fetch_u64(&mut self, vaddr: u64) -> Result<u64> {
        self.fetch::<8>(vaddr, Access::DATA_R).map(u64::from_le_bytes)
    }

    pub fn store_u8(&mut self, vaddr: u64, value: u8) -> Result<()> {
        self.store(vaddr, Access::DATA_W, value.to_le_bytes())
    }

    pub fn store_u16(&mut self, vaddr: u64, value: u16) -> Result<()> {
        self.store(vaddr, Access::DATA_W, value.to_le_bytes())
    }

    pub fn store_u32(&mut self, vaddr: u64, value: u32) -> Result<()> {
        self.store(vaddr, Access::DATA_W, value.to_le_bytes())
    }

    pub fn store_u64(&mut self, vaddr: u64, value: u64) -> Result<()> {
        self.store(vaddr, Access::DATA_W, value.to_le_bytes())
    }

    /// Copies `dst.len()` guest bytes starting at `vaddr`, one page-sized piece at a time.
    ///
    /// Pieces before a faulting one have already been read; `dst` is left partially filled.
    pub fn read_bytes(&mut self, vaddr: u64, dst: &mut [u8], access: Access) -> Result<()> {
        let mut addr = vaddr;
        let mut done = 0;
        while done < dst.len() {
            let len = piece_len(addr, dst.len() - done);
            let token = self.map(addr, len, access, AlignCtl::NONE)?;
            match self.mapped(token) {
                Ok(bytes) => dst[done..done + len].copy_from_slice(bytes),
                Err(err) => return Err(self.abandon(token, err)),
            }
            self.finish(token)?;
            done += len;
            addr = addr.wrapping_add(len as u64);
        }
        Ok(())
    }

    /// Writes `src` to guest memory starting at `vaddr`, one page-sized piece at a time.
    ///
    /// Not atomic: pieces before a faulting one stay written.
    pub fn write_bytes(&mut self, vaddr: u64, src: &[u8], access: Access) -> Result<()> {
        let mut addr = vaddr;
        let mut done = 0;
        while done < src.len() {
            let len = piece_len(addr, src.len() - done);
            let token = self.map(addr, len, access, AlignCtl::NONE)?;
            match self.mapped_mut(token) {
                Ok(bytes) => bytes.copy_from_slice(&src[done..done + len]),
                Err(err) => return Err(self.abandon(token, err)),
            }
            self.finish(token)?;
            done += len;
            addr = addr.wrapping_add(len as u64);
        }
        Ok(())
    }

    /// Locked read-modify-write of a dword. Returns the previous value.
    pub fn atomic_update_u32(&mut self, vaddr: u64, f: impl FnOnce(u32) -> u32) -> Result<u32> {
        let token = self.map(vaddr, 4, Access::DATA_ATOMIC, AlignCtl::natural(4))?;
        let old = match self.mapped_mut(token) {
            Ok(bytes) => {
                let mut buf = [0u8; 4];
                buf.copy_from_slice(bytes);
                let old = u32::from_le_bytes(buf);
                bytes.copy_from_slice(&f(old).to_le_bytes());
                old
            }
            Err(err) => return Err(self.abandon(token, err)),
        };
        self.finish(token)?;
        Ok(old)
    }

    /// Locked read-modify-write of a qword. Returns the previous value.
    pub fn atomic_update_u64(&mut self, vaddr: u64, f: impl FnOnce(u64) -> u64) -> Result<u64> {
        let token = self.map(vaddr, 8, Access::DATA_ATOMIC, AlignCtl::natural(8))?;
        let old = match self.mapped_mut(token) {
            Ok(bytes) => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(bytes);
                let old = u64::from_le_bytes(buf);
                bytes.copy_from_slice(&f(old).to_le_bytes());
                old
            }
            Err(err) => return Err(self.abandon(token, err)),
        };
        self.finish(token)?;
        Ok(old)
    }
}

#[inline]
fn piece_len(addr: u64, remaining: usize) -> usize {
    let to_page_end = PAGE_SIZE - (addr & PAGE_OFFSET_MASK) as usize;
    remaining.min(to_page_end).min(BOUNCE_BUFFER_SIZE)
}
