//! VirtIO-MMIO transport (version 2)
//!
//! Each device owns a 512-byte register window. The transport handles
//! feature negotiation and queue setup; `QueueNotify` writes and the poll
//! hook drive descriptor chains through a [`VirtioBackend`].

pub mod console;
pub mod fs;
pub mod fuse;
pub mod net;
pub mod queue;

use std::sync::Arc;

use tracing::{debug, trace};

use self::queue::{DescChain, Virtqueue};
use super::{Device, InterruptLine, MmioRange};
use crate::memory::GuestRam;
use crate::Result;

/// Size of one virtio-mmio register window.
pub const MMIO_WINDOW: u64 = 0x200;

/// Register offsets (virtio spec 4.2.2).
mod reg {
    pub const MAGIC_VALUE: u64 = 0x000;
    pub const VERSION: u64 = 0x004;
    pub const DEVICE_ID: u64 = 0x008;
    pub const VENDOR_ID: u64 = 0x00c;
    pub const DEVICE_FEATURES: u64 = 0x010;
    pub const DEVICE_FEATURES_SEL: u64 = 0x014;
    pub const DRIVER_FEATURES: u64 = 0x020;
    pub const DRIVER_FEATURES_SEL: u64 = 0x024;
    pub const QUEUE_SEL: u64 = 0x030;
    pub const QUEUE_NUM_MAX: u64 = 0x034;
    pub const QUEUE_NUM: u64 = 0x038;
    pub const QUEUE_READY: u64 = 0x044;
    pub const QUEUE_NOTIFY: u64 = 0x050;
    pub const INTERRUPT_STATUS: u64 = 0x060;
    pub const INTERRUPT_ACK: u64 = 0x064;
    pub const STATUS: u64 = 0x070;
    pub const QUEUE_DESC_LOW: u64 = 0x080;
    pub const QUEUE_DESC_HIGH: u64 = 0x084;
    pub const QUEUE_DRIVER_LOW: u64 = 0x090;
    pub const QUEUE_DRIVER_HIGH: u64 = 0x094;
    pub const QUEUE_DEVICE_LOW: u64 = 0x0a0;
    pub const QUEUE_DEVICE_HIGH: u64 = 0x0a4;
    pub const CONFIG_GENERATION: u64 = 0x0fc;
    pub const CONFIG: u64 = 0x100;

    /// "virt"
    pub const MAGIC: u32 = 0x7472_6976;
    pub const VERSION_2: u32 = 2;
    /// Used-ring interrupt bit in INTERRUPT_STATUS.
    pub const INT_USED_RING: u32 = 1 << 0;
}

/// Required by every virtio-mmio version 2 device.
pub const VIRTIO_F_VERSION_1: u64 = 1 << 32;

/// A device backend served over the MMIO transport.
///
/// Backends must not retain descriptor pointers past a `handle_queue` call.
pub trait VirtioBackend: Send {
    fn device_id(&self) -> u32;

    /// Feature bits offered to the driver (VIRTIO_F_VERSION_1 is implied).
    fn device_features(&self) -> u64 {
        0
    }

    /// Features the driver acknowledged, after negotiation completes.
    fn set_negotiated_features(&mut self, _features: u64) {}

    fn config_space(&self) -> Vec<u8> {
        Vec::new()
    }

    fn num_queues(&self) -> usize;

    fn queue_max_size(&self) -> u16 {
        256
    }

    /// Service one descriptor chain; returns the number of bytes written
    /// into the chain's device-writable buffers.
    fn handle_queue(&mut self, queue: u16, chain: &mut DescChain, ram: &GuestRam) -> Result<u32>;

    /// True when the backend has host-side data ready for `queue` and wants
    /// the transport to feed it available buffers from the poll hook.
    fn wants_queue(&mut self, _queue: u16) -> bool {
        false
    }

    /// False for receive-style queues whose buffers sit posted until host
    /// data arrives; `QueueNotify` on those queues only replenishes buffers.
    fn notify_driven(&self, _queue: u16) -> bool {
        true
    }
}

/// One virtio-mmio device instance.
pub struct VirtioMmio {
    base: u64,
    line: Arc<dyn InterruptLine>,
    ram: GuestRam,
    backend: Box<dyn VirtioBackend>,

    device_features_sel: u32,
    driver_features_sel: u32,
    driver_features: u64,
    queue_sel: u32,
    status: u32,
    interrupt_status: u32,
    queues: Vec<Virtqueue>,
}

impl VirtioMmio {
    pub fn new(
        base: u64,
        line: Arc<dyn InterruptLine>,
        ram: GuestRam,
        backend: Box<dyn VirtioBackend>,
    ) -> Self {
        let queues = vec![Virtqueue::default(); backend.num_queues()];
        Self {
            base,
            line,
            ram,
            backend,
            device_features_sel: 0,
            driver_features_sel: 0,
            driver_features: 0,
            queue_sel: 0,
            status: 0,
            interrupt_status: 0,
            queues,
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    fn device_features(&self) -> u64 {
        self.backend.device_features() | VIRTIO_F_VERSION_1
    }

    fn queue(&mut self) -> Option<&mut Virtqueue> {
        self.queues.get_mut(self.queue_sel as usize)
    }

    /// Drain every available chain on `q` through the backend.
    fn process_queue(&mut self, q: u16) -> Result<()> {
        let mut completions = 0;
        loop {
            let Some(queue) = self.queues.get_mut(q as usize) else {
                return Ok(());
            };
            let mut chain = match queue.pop(&self.ram) {
                Ok(Some(chain)) => chain,
                Ok(None) => break,
                Err(e) => {
                    // Malformed chain: local recovery. `pop` already advanced
                    // the available index; complete the head with zero length
                    // so the driver's bookkeeping stays consistent.
                    trace!(queue = q, error = %e, "malformed descriptor chain");
                    let slot = queue.last_avail_idx.wrapping_sub(1) % queue.size;
                    if let Ok(head) = self.ram.read_u16(queue.driver_addr + 4 + 2 * slot as u64) {
                        queue.push_used(&self.ram, head, 0)?;
                        completions += 1;
                    }
                    continue;
                }
            };
            let written = self.backend.handle_queue(q, &mut chain, &self.ram)?;
            let queue = self.queues.get_mut(q as usize).expect("queue exists");
            queue.push_used(&self.ram, chain.head, written)?;
            completions += 1;
        }
        if completions > 0 {
            let wanted = self.queues[q as usize].interrupt_wanted(&self.ram);
            self.interrupt_status |= reg::INT_USED_RING;
            if wanted {
                self.line.set_level(true);
            }
        }
        Ok(())
    }

    /// Feed available buffers to a backend with pending host-side data.
    fn pump_backend(&mut self, q: u16) -> Result<()> {
        let mut completions = 0;
        while self.backend.wants_queue(q) {
            let Some(queue) = self.queues.get_mut(q as usize) else {
                break;
            };
            let Some(mut chain) = queue.pop(&self.ram)? else {
                break;
            };
            let written = self.backend.handle_queue(q, &mut chain, &self.ram)?;
            let queue = self.queues.get_mut(q as usize).expect("queue exists");
            queue.push_used(&self.ram, chain.head, written)?;
            completions += 1;
        }
        if completions > 0 {
            let wanted = self.queues[q as usize].interrupt_wanted(&self.ram);
            self.interrupt_status |= reg::INT_USED_RING;
            if wanted {
                self.line.set_level(true);
            }
        }
        Ok(())
    }

    fn read_reg(&mut self, offset: u64) -> u32 {
        match offset {
            reg::MAGIC_VALUE => reg::MAGIC,
            reg::VERSION => reg::VERSION_2,
            reg::DEVICE_ID => self.backend.device_id(),
            reg::VENDOR_ID => 0x0063_0063, // "cc"
            reg::DEVICE_FEATURES => {
                if self.device_features_sel == 0 {
                    self.device_features() as u32
                } else {
                    (self.device_features() >> 32) as u32
                }
            }
            reg::QUEUE_NUM_MAX => self.backend.queue_max_size() as u32,
            reg::QUEUE_READY => self.queue().map(|q| q.ready as u32).unwrap_or(0),
            reg::INTERRUPT_STATUS => self.interrupt_status,
            reg::STATUS => self.status,
            reg::CONFIG_GENERATION => 0,
            o if o >= reg::CONFIG => {
                let config = self.backend.config_space();
                let idx = (o - reg::CONFIG) as usize;
                let mut v = [0u8; 4];
                for (i, b) in v.iter_mut().enumerate() {
                    *b = config.get(idx + i).copied().unwrap_or(0);
                }
                u32::from_le_bytes(v)
            }
            _ => 0,
        }
    }

    fn write_reg(&mut self, offset: u64, value: u32) -> Result<()> {
        match offset {
            reg::DEVICE_FEATURES_SEL => self.device_features_sel = value,
            reg::DRIVER_FEATURES_SEL => self.driver_features_sel = value,
            reg::DRIVER_FEATURES => {
                if self.driver_features_sel == 0 {
                    self.driver_features = (self.driver_features & !0xffff_ffff) | value as u64;
                } else {
                    self.driver_features =
                        (self.driver_features & 0xffff_ffff) | ((value as u64) << 32);
                }
                self.backend.set_negotiated_features(self.driver_features);
            }
            reg::QUEUE_SEL => self.queue_sel = value,
            reg::QUEUE_NUM => {
                let max = self.backend.queue_max_size();
                if let Some(q) = self.queue() {
                    q.size = (value as u16).min(max);
                }
            }
            reg::QUEUE_READY => {
                if let Some(q) = self.queue() {
                    q.ready = value & 1 != 0;
                }
            }
            reg::QUEUE_NOTIFY => {
                let q = value as u16;
                if self.backend.notify_driven(q) {
                    self.process_queue(q)?;
                } else if self.backend.wants_queue(q) {
                    self.pump_backend(q)?;
                }
            }
            reg::INTERRUPT_ACK => {
                self.interrupt_status &= !value;
                if self.interrupt_status == 0 {
                    self.line.set_level(false);
                }
            }
            reg::STATUS => {
                if value == 0 {
                    debug!(device = self.backend.device_id(), "virtio device reset");
                    self.device_reset();
                } else {
                    self.status = value;
                }
            }
            reg::QUEUE_DESC_LOW => self.set_addr(|q| &mut q.desc_addr, value, false),
            reg::QUEUE_DESC_HIGH => self.set_addr(|q| &mut q.desc_addr, value, true),
            reg::QUEUE_DRIVER_LOW => self.set_addr(|q| &mut q.driver_addr, value, false),
            reg::QUEUE_DRIVER_HIGH => self.set_addr(|q| &mut q.driver_addr, value, true),
            reg::QUEUE_DEVICE_LOW => self.set_addr(|q| &mut q.device_addr, value, false),
            reg::QUEUE_DEVICE_HIGH => self.set_addr(|q| &mut q.device_addr, value, true),
            _ => {}
        }
        Ok(())
    }

    fn set_addr(&mut self, field: impl Fn(&mut Virtqueue) -> &mut u64, value: u32, high: bool) {
        if let Some(q) = self.queue() {
            let slot = field(q);
            if high {
                *slot = (*slot & 0xffff_ffff) | ((value as u64) << 32);
            } else {
                *slot = (*slot & !0xffff_ffff) | value as u64;
            }
        }
    }

    fn device_reset(&mut self) {
        self.status = 0;
        self.interrupt_status = 0;
        self.driver_features = 0;
        for q in self.queues.iter_mut() {
            *q = Virtqueue::default();
        }
        self.line.set_level(false);
    }
}

impl Device for VirtioMmio {
    fn name(&self) -> &'static str {
        "virtio-mmio"
    }

    fn mmio_ranges(&self) -> Vec<MmioRange> {
        vec![MmioRange::new(self.base, MMIO_WINDOW)]
    }

    fn mmio(&mut self, gpa: u64, data: &mut [u8], is_write: bool) -> Result<()> {
        let offset = gpa - self.base;
        if is_write {
            let mut v = [0u8; 4];
            let n = data.len().min(4);
            v[..n].copy_from_slice(&data[..n]);
            self.write_reg(offset, u32::from_le_bytes(v))?;
        } else {
            let v = self.read_reg(offset).to_le_bytes();
            let n = data.len().min(4);
            data[..n].copy_from_slice(&v[..n]);
        }
        Ok(())
    }

    fn poll(&mut self) -> Result<()> {
        for q in 0..self.queues.len() as u16 {
            if self.backend.wants_queue(q) {
                self.pump_backend(q)?;
            }
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.device_reset();
    }
}
