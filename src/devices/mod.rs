//! Emulated device model
//!
//! Devices register port-I/O ranges (x86), MMIO ranges, and interrupt lines
//! on the [`bus::DeviceBus`]; the per-vCPU run loop dispatches guest exits to
//! the owning device. Devices never pick IRQ numbers themselves: they operate
//! only on the [`InterruptLine`] handle given to them at construction.

pub mod bus;
pub mod cmos;
pub mod gic;
pub mod hpet;
pub mod ioapic;
pub mod kbc;
pub mod pic;
pub mod pit;
pub mod serial;
pub mod virtio;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::Result;

/// An inclusive range of I/O ports owned by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub base: u16,
    pub len: u16,
}

impl PortRange {
    pub fn new(base: u16, len: u16) -> Self {
        Self { base, len }
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.base && (port as u32) < self.base as u32 + self.len as u32
    }

    pub fn overlaps(&self, other: &PortRange) -> bool {
        (self.base as u32) < other.base as u32 + other.len as u32
            && (other.base as u32) < self.base as u32 + self.len as u32
    }
}

/// A guest-physical MMIO window owned by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmioRange {
    pub base: u64,
    pub len: u64,
}

impl MmioRange {
    pub fn new(base: u64, len: u64) -> Self {
        Self { base, len }
    }

    pub fn contains(&self, gpa: u64) -> bool {
        gpa >= self.base && gpa < self.base + self.len
    }

    pub fn overlaps(&self, other: &MmioRange) -> bool {
        self.base < other.base + other.len && other.base < self.base + self.len
    }
}

/// An interrupt line handed to a device by the interrupt controller.
///
/// The two operations mirror what real devices can do with a wire: drive it
/// to a level, or pulse it for edge-triggered delivery.
pub trait InterruptLine: Send + Sync {
    fn set_level(&self, high: bool);

    fn pulse(&self) {
        self.set_level(true);
        self.set_level(false);
    }
}

/// A line that goes nowhere. Placeholder for controllers that are probed but
/// never routed (e.g. the PIC output while the kernel runs in IOAPIC mode).
pub struct SinkLine;

impl InterruptLine for SinkLine {
    fn set_level(&self, _high: bool) {}
}

/// Drives several downstream lines from one device pin (a legacy IRQ feeds
/// both the PIC input and its IOAPIC pin).
pub struct FanoutLine {
    downstream: Vec<Arc<dyn InterruptLine>>,
}

impl FanoutLine {
    pub fn new(downstream: Vec<Arc<dyn InterruptLine>>) -> Arc<Self> {
        Arc::new(Self { downstream })
    }
}

impl InterruptLine for FanoutLine {
    fn set_level(&self, high: bool) {
        for line in &self.downstream {
            line.set_level(high);
        }
    }
}

/// A line that records assertions, for unit-testing device IRQ behavior.
#[derive(Default)]
pub struct MockLine {
    events: std::sync::Mutex<Vec<bool>>,
}

impl MockLine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every `set_level` value observed, in order.
    pub fn events(&self) -> Vec<bool> {
        self.events.lock().unwrap().clone()
    }

    /// Number of rising edges observed.
    pub fn rising_edges(&self) -> usize {
        let ev = self.events.lock().unwrap();
        let mut prev = false;
        let mut n = 0;
        for &e in ev.iter() {
            if e && !prev {
                n += 1;
            }
            prev = e;
        }
        n
    }

    pub fn level(&self) -> bool {
        *self.events.lock().unwrap().last().unwrap_or(&false)
    }
}

impl InterruptLine for MockLine {
    fn set_level(&self, high: bool) {
        self.events.lock().unwrap().push(high);
    }
}

/// Guest-visible system requests raised by devices (reset port, PSCI).
/// The run loop checks this after every dispatched exit.
#[derive(Default)]
pub struct SystemSignals {
    reboot: AtomicBool,
}

impl SystemSignals {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn request_reboot(&self) {
        self.reboot.store(true, Ordering::SeqCst);
    }

    pub fn reboot_requested(&self) -> bool {
        self.reboot.load(Ordering::SeqCst)
    }
}

/// An emulated device.
///
/// All default implementations declare nothing, so a device overrides only
/// the surfaces it actually exposes.
pub trait Device: Send {
    fn name(&self) -> &'static str;

    /// Port-I/O ranges this device owns (x86 only).
    fn port_ranges(&self) -> Vec<PortRange> {
        Vec::new()
    }

    /// MMIO ranges this device owns.
    fn mmio_ranges(&self) -> Vec<MmioRange> {
        Vec::new()
    }

    /// Handle a port-I/O access. `data` is the value written, or the buffer
    /// to fill for a read.
    fn port_io(&mut self, _port: u16, _data: &mut [u8], _is_write: bool) -> Result<()> {
        Ok(())
    }

    /// Handle an MMIO access at an absolute guest-physical address.
    fn mmio(&mut self, _gpa: u64, _data: &mut [u8], _is_write: bool) -> Result<()> {
        Ok(())
    }

    /// Move host-side data between vCPU exits. Must stay bounded
    /// (microsecond scale): blocking I/O belongs on dedicated threads.
    fn poll(&mut self) -> Result<()> {
        Ok(())
    }

    /// Return the device to power-on state.
    fn reset(&mut self) {}
}
