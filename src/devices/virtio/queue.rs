//! Split virtqueue descriptor walk
//!
//! The driver posts descriptor chain heads on the available ring; the device
//! walks the chain into device-readable (`out`) and device-writable (`in`)
//! GPA slices, hands them to a backend, and posts `(head, written)` on the
//! used ring. The used-ring element is written before the used index is
//! advanced.

use virtio_bindings::virtio_ring::{
    VRING_AVAIL_F_NO_INTERRUPT, VRING_DESC_F_NEXT, VRING_DESC_F_WRITE,
};

use crate::memory::GuestRam;
use crate::{Error, Result};

/// One descriptor chain popped from the available ring.
#[derive(Debug, Default)]
pub struct DescChain {
    /// Head index, posted back on the used ring.
    pub head: u16,
    /// Device-readable buffers as `(gpa, len)`.
    pub out: Vec<(u64, u32)>,
    /// Device-writable buffers as `(gpa, len)`.
    pub in_: Vec<(u64, u32)>,
}

impl DescChain {
    /// Total device-readable length.
    pub fn out_len(&self) -> usize {
        self.out.iter().map(|&(_, l)| l as usize).sum()
    }

    /// Total device-writable length.
    pub fn in_len(&self) -> usize {
        self.in_.iter().map(|&(_, l)| l as usize).sum()
    }

    /// Gather every device-readable byte into one buffer.
    pub fn read_out(&self, ram: &GuestRam) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.out_len()];
        let mut off = 0;
        for &(gpa, len) in &self.out {
            ram.read_at(gpa, &mut buf[off..off + len as usize])?;
            off += len as usize;
        }
        Ok(buf)
    }

    /// Scatter `data` across the device-writable buffers. Fails if the chain
    /// cannot hold it.
    pub fn write_in(&self, ram: &GuestRam, data: &[u8]) -> Result<u32> {
        if data.len() > self.in_len() {
            return Err(Error::Guest(format!(
                "response of {} bytes overflows {}-byte buffer",
                data.len(),
                self.in_len()
            )));
        }
        let mut off = 0;
        for &(gpa, len) in &self.in_ {
            if off == data.len() {
                break;
            }
            let n = std::cmp::min(len as usize, data.len() - off);
            ram.write_at(gpa, &data[off..off + n])?;
            off += n;
        }
        Ok(data.len() as u32)
    }
}

/// Driver-configured state of one virtqueue.
#[derive(Debug, Default, Clone)]
pub struct Virtqueue {
    pub size: u16,
    pub ready: bool,
    /// Descriptor table GPA.
    pub desc_addr: u64,
    /// Driver (available) ring GPA.
    pub driver_addr: u64,
    /// Device (used) ring GPA.
    pub device_addr: u64,
    pub last_avail_idx: u16,
    pub used_idx: u16,
}

impl Virtqueue {
    /// Pop the next available chain, if any.
    pub fn pop(&mut self, ram: &GuestRam) -> Result<Option<DescChain>> {
        if !self.ready || self.size == 0 {
            return Ok(None);
        }
        let avail_idx = ram.read_u16(self.driver_addr + 2)?;
        if avail_idx == self.last_avail_idx {
            return Ok(None);
        }
        let slot = self.last_avail_idx % self.size;
        let head = ram.read_u16(self.driver_addr + 4 + 2 * slot as u64)?;
        self.last_avail_idx = self.last_avail_idx.wrapping_add(1);

        let mut chain = DescChain {
            head,
            ..Default::default()
        };
        let mut index = head;
        let mut seen = 0u16;
        loop {
            if index >= self.size {
                return Err(Error::Guest(format!(
                    "descriptor index {index} out of range for queue of {}",
                    self.size
                )));
            }
            if seen >= self.size {
                return Err(Error::Guest("descriptor chain loops".into()));
            }
            seen += 1;

            let desc_gpa = self.desc_addr + 16 * index as u64;
            let addr = ram.read_u64(desc_gpa)?;
            let len = ram.read_u32(desc_gpa + 8)?;
            let flags = ram.read_u16(desc_gpa + 12)?;
            if flags & VRING_DESC_F_WRITE as u16 != 0 {
                chain.in_.push((addr, len));
            } else {
                if !chain.in_.is_empty() {
                    return Err(Error::Guest(
                        "device-readable descriptor after writable one".into(),
                    ));
                }
                chain.out.push((addr, len));
            }
            if flags & VRING_DESC_F_NEXT as u16 == 0 {
                break;
            }
            index = ram.read_u16(desc_gpa + 14)?;
        }
        Ok(Some(chain))
    }

    /// Post a completion: the used element lands before the index advances.
    pub fn push_used(&mut self, ram: &GuestRam, head: u16, written: u32) -> Result<()> {
        let slot = self.used_idx % self.size;
        let elem_gpa = self.device_addr + 4 + 8 * slot as u64;
        ram.write_u32(elem_gpa, head as u32)?;
        ram.write_u32(elem_gpa + 4, written)?;
        std::sync::atomic::fence(std::sync::atomic::Ordering::Release);
        self.used_idx = self.used_idx.wrapping_add(1);
        ram.write_u16(self.device_addr + 2, self.used_idx)?;
        Ok(())
    }

    /// True unless the driver set the no-interrupt flag on the avail ring.
    pub fn interrupt_wanted(&self, ram: &GuestRam) -> bool {
        match ram.read_u16(self.driver_addr) {
            Ok(flags) => flags & VRING_AVAIL_F_NO_INTERRUPT as u16 == 0,
            Err(_) => true,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_ring {
    //! Minimal driver-side ring builder shared by the virtio tests.

    use super::*;

    pub struct TestRing {
        pub q: Virtqueue,
        pub ram: GuestRam,
        next_desc: u16,
        avail_count: u16,
    }

    impl TestRing {
        pub fn new(size: u16) -> Self {
            let ram = GuestRam::new(0, 0x100000).unwrap();
            let q = Virtqueue {
                size,
                ready: true,
                desc_addr: 0x1000,
                driver_addr: 0x2000,
                device_addr: 0x3000,
                ..Default::default()
            };
            Self {
                q,
                ram,
                next_desc: 0,
                avail_count: 0,
            }
        }

        fn write_desc(&mut self, idx: u16, addr: u64, len: u32, flags: u16, next: u16) {
            let gpa = self.q.desc_addr + 16 * idx as u64;
            self.ram.write_u64(gpa, addr).unwrap();
            self.ram.write_u32(gpa + 8, len).unwrap();
            self.ram.write_u16(gpa + 12, flags).unwrap();
            self.ram.write_u16(gpa + 14, next).unwrap();
        }

        /// Post a chain of `(gpa, len, writable)` buffers.
        pub fn post(&mut self, bufs: &[(u64, u32, bool)]) -> u16 {
            let head = self.next_desc;
            for (i, &(addr, len, writable)) in bufs.iter().enumerate() {
                let idx = self.next_desc;
                self.next_desc += 1;
                let mut flags = 0u16;
                if writable {
                    flags |= VRING_DESC_F_WRITE as u16;
                }
                if i + 1 < bufs.len() {
                    flags |= VRING_DESC_F_NEXT as u16;
                }
                self.write_desc(idx, addr, len, flags, idx + 1);
            }
            let slot = self.avail_count % self.q.size;
            self.ram
                .write_u16(self.q.driver_addr + 4 + 2 * slot as u64, head)
                .unwrap();
            self.avail_count += 1;
            self.ram
                .write_u16(self.q.driver_addr + 2, self.avail_count)
                .unwrap();
            head
        }

        pub fn used_entry(&self, slot: u16) -> (u32, u32) {
            let gpa = self.q.device_addr + 4 + 8 * slot as u64;
            (
                self.ram.read_u32(gpa).unwrap(),
                self.ram.read_u32(gpa + 4).unwrap(),
            )
        }

        pub fn used_idx(&self) -> u16 {
            self.ram.read_u16(self.q.device_addr + 2).unwrap()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_ring::TestRing;
    use super::*;

    #[test]
    fn pop_walks_out_then_in() {
        let mut r = TestRing::new(8);
        r.ram.write_at(0x5000, b"request").unwrap();
        let head = r.post(&[(0x5000, 7, false), (0x6000, 64, true)]);
        let chain = r.q.pop(&r.ram).unwrap().unwrap();
        assert_eq!(chain.head, head);
        assert_eq!(chain.out, vec![(0x5000, 7)]);
        assert_eq!(chain.in_, vec![(0x6000, 64)]);
        assert_eq!(chain.read_out(&r.ram).unwrap(), b"request");
        assert!(r.q.pop(&r.ram).unwrap().is_none());
    }

    #[test]
    fn used_written_before_index_advance() {
        let mut r = TestRing::new(8);
        let head = r.post(&[(0x5000, 4, true)]);
        let chain = r.q.pop(&r.ram).unwrap().unwrap();
        assert_eq!(r.used_idx(), 0);
        r.q.push_used(&r.ram, chain.head, 4).unwrap();
        assert_eq!(r.used_idx(), 1);
        assert_eq!(r.used_entry(0), (head as u32, 4));
    }

    #[test]
    fn used_idx_advances_once_per_chain() {
        let mut r = TestRing::new(8);
        r.post(&[(0x5000, 4, true)]);
        r.post(&[(0x5100, 4, true)]);
        while let Some(chain) = r.q.pop(&r.ram).unwrap() {
            let before = r.q.used_idx;
            r.q.push_used(&r.ram, chain.head, 0).unwrap();
            assert_eq!(r.q.used_idx, before.wrapping_add(1));
        }
        assert_eq!(r.used_idx(), 2);
    }

    #[test]
    fn write_in_scatters_and_overflow_fails() {
        let mut r = TestRing::new(8);
        r.post(&[(0x5000, 4, true), (0x5100, 4, true)]);
        let chain = r.q.pop(&r.ram).unwrap().unwrap();
        assert_eq!(chain.write_in(&r.ram, b"abcdef").unwrap(), 6);
        let mut buf = [0u8; 4];
        r.ram.read_at(0x5000, &mut buf).unwrap();
        assert_eq!(&buf, b"abcd");
        let mut buf2 = [0u8; 2];
        r.ram.read_at(0x5100, &mut buf2).unwrap();
        assert_eq!(&buf2, b"ef");
        assert!(chain.write_in(&r.ram, &[0u8; 16]).is_err());
    }

    #[test]
    fn looping_chain_is_rejected() {
        let mut r = TestRing::new(4);
        // Descriptor 0 points to itself forever.
        let gpa = r.q.desc_addr;
        r.ram.write_u64(gpa, 0x5000).unwrap();
        r.ram.write_u32(gpa + 8, 4).unwrap();
        r.ram
            .write_u16(gpa + 12, VRING_DESC_F_NEXT as u16)
            .unwrap();
        r.ram.write_u16(gpa + 14, 0).unwrap();
        r.ram.write_u16(r.q.driver_addr + 4, 0).unwrap();
        r.ram.write_u16(r.q.driver_addr + 2, 1).unwrap();
        assert!(r.q.pop(&r.ram).is_err());
    }

    #[test]
    fn interrupt_suppression_flag() {
        let mut r = TestRing::new(4);
        assert!(r.q.interrupt_wanted(&r.ram));
        r.ram
            .write_u16(r.q.driver_addr, VRING_AVAIL_F_NO_INTERRUPT as u16)
            .unwrap();
        assert!(!r.q.interrupt_wanted(&r.ram));
    }
}
