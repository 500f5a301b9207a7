//! Guest RAM window and byte-level GPA accessors
//!
//! All loader and device code reaches guest memory through [`GuestRam`]: a
//! cheaply clonable handle onto one contiguous guest-physical window
//! `[base, base + size)` backed by a host mmap.

use std::sync::Arc;

use vm_memory::{Bytes, GuestAddress, GuestMemory, GuestMemoryMmap};

use crate::{Error, Result};

/// A contiguous guest-physical RAM window mapped into the host.
#[derive(Clone)]
pub struct GuestRam {
    mem: Arc<GuestMemoryMmap>,
    base: u64,
    size: u64,
}

impl GuestRam {
    /// Map `size` bytes of guest RAM starting at guest-physical `base`.
    pub fn new(base: u64, size: u64) -> Result<Self> {
        let mem = GuestMemoryMmap::from_ranges(&[(GuestAddress(base), size as usize)])
            .map_err(|e| Error::Host(format!("failed to map guest RAM: {e}")))?;
        Ok(Self {
            mem: Arc::new(mem),
            base,
            size,
        })
    }

    /// Guest-physical base of the RAM window.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Size of the RAM window in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// One past the last guest-physical address of the window.
    pub fn end(&self) -> u64 {
        self.base + self.size
    }

    /// The host virtual address backing `gpa`, for handing to the accelerator.
    pub fn host_addr(&self, gpa: u64) -> Result<*mut u8> {
        self.mem
            .get_host_address(GuestAddress(gpa))
            .map_err(Error::Memory)
    }

    /// Read exactly `buf.len()` bytes at `gpa`.
    pub fn read_at(&self, gpa: u64, buf: &mut [u8]) -> Result<()> {
        self.mem
            .read_slice(buf, GuestAddress(gpa))
            .map_err(Error::Memory)
    }

    /// Write all of `buf` at `gpa`.
    pub fn write_at(&self, gpa: u64, buf: &[u8]) -> Result<()> {
        self.mem
            .write_slice(buf, GuestAddress(gpa))
            .map_err(Error::Memory)
    }

    /// Read a little-endian integer at `gpa`.
    pub fn read_u16(&self, gpa: u64) -> Result<u16> {
        let mut b = [0u8; 2];
        self.read_at(gpa, &mut b)?;
        Ok(u16::from_le_bytes(b))
    }

    pub fn read_u32(&self, gpa: u64) -> Result<u32> {
        let mut b = [0u8; 4];
        self.read_at(gpa, &mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    pub fn read_u64(&self, gpa: u64) -> Result<u64> {
        let mut b = [0u8; 8];
        self.read_at(gpa, &mut b)?;
        Ok(u64::from_le_bytes(b))
    }

    /// Write a little-endian integer at `gpa`.
    pub fn write_u16(&self, gpa: u64, v: u16) -> Result<()> {
        self.write_at(gpa, &v.to_le_bytes())
    }

    pub fn write_u32(&self, gpa: u64, v: u32) -> Result<()> {
        self.write_at(gpa, &v.to_le_bytes())
    }

    pub fn write_u64(&self, gpa: u64, v: u64) -> Result<()> {
        self.write_at(gpa, &v.to_le_bytes())
    }

    /// Zero `len` bytes starting at `gpa`.
    pub fn zero(&self, gpa: u64, len: u64) -> Result<()> {
        // 4 KiB chunks keep the scratch buffer small for large clears.
        let chunk = vec![0u8; 4096];
        let mut off = 0u64;
        while off < len {
            let n = std::cmp::min(chunk.len() as u64, len - off) as usize;
            self.write_at(gpa + off, &chunk[..n])?;
            off += n as u64;
        }
        Ok(())
    }

    /// Access to the underlying mmap for crates that want the vm-memory view.
    pub fn inner(&self) -> &GuestMemoryMmap {
        &self.mem
    }
}

impl std::fmt::Debug for GuestRam {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestRam")
            .field("base", &format_args!("{:#x}", self.base))
            .field("size", &format_args!("{:#x}", self.size))
            .finish()
    }
}
