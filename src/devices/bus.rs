//! Device bus: registration and exit dispatch
//!
//! The bus owns every emulated device and maintains three disjoint maps:
//! port → device, sorted MMIO range → device, and interrupt line → emitter.
//! Disjointness is checked at registration time; dispatch is a binary search
//! over the sorted range table.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use tracing::trace;

use super::{Device, MmioRange, PortRange};
use crate::{Error, Result};

type SharedDevice = Arc<Mutex<dyn Device>>;

/// How many recent accesses the trace ring keeps for fatal reports.
const TRACE_DEPTH: usize = 64;

/// One recorded guest access, for the post-mortem trail.
#[derive(Debug, Clone, Copy)]
pub struct TraceEvent {
    /// Port number or guest-physical address.
    pub addr: u64,
    /// First bytes of the access, little-endian packed.
    pub value: u64,
    pub len: u8,
    pub is_write: bool,
    pub is_port: bool,
}

/// Registry of devices keyed by the guest-visible addresses they own.
#[derive(Default)]
pub struct DeviceBus {
    devices: Vec<SharedDevice>,
    /// port → index into `devices`; one entry per owned port.
    ports: BTreeMap<u16, usize>,
    /// MMIO ranges sorted by base, each carrying its owner index.
    mmio: Vec<(MmioRange, usize)>,
    /// Interrupt lines handed out so far, by GSI, for the disjointness check.
    lines: BTreeMap<u32, &'static str>,
    /// Bounded ring of recent dispatches, surfaced on fatal exits.
    trace: Mutex<VecDeque<TraceEvent>>,
}

impl DeviceBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device, claiming every port and MMIO range it declares.
    ///
    /// Fails with `Error::Config` if any claimed range intersects a
    /// previously registered device's.
    pub fn add(&mut self, dev: Arc<Mutex<dyn Device>>) -> Result<()> {
        let (name, port_ranges, mmio_ranges) = {
            let d = dev.lock().unwrap();
            (d.name(), d.port_ranges(), d.mmio_ranges())
        };

        for pr in &port_ranges {
            for (port, &owner) in &self.ports {
                if pr.contains(*port) {
                    return Err(Error::Config(format!(
                        "{name}: port {port:#x} already owned by {}",
                        self.devices[owner].lock().unwrap().name()
                    )));
                }
            }
        }
        for mr in &mmio_ranges {
            for (existing, owner) in &self.mmio {
                if mr.overlaps(existing) {
                    return Err(Error::Config(format!(
                        "{name}: MMIO {:#x}+{:#x} overlaps {} at {:#x}+{:#x}",
                        mr.base,
                        mr.len,
                        self.devices[*owner].lock().unwrap().name(),
                        existing.base,
                        existing.len
                    )));
                }
            }
        }

        let idx = self.devices.len();
        self.devices.push(dev);
        for pr in &port_ranges {
            for off in 0..pr.len {
                self.ports.insert(pr.base + off, idx);
            }
        }
        for mr in mmio_ranges {
            let pos = self
                .mmio
                .binary_search_by(|(r, _)| r.base.cmp(&mr.base))
                .unwrap_err();
            self.mmio.insert(pos, (mr, idx));
        }
        trace!(device = name, ports = port_ranges.len(), "registered");
        Ok(())
    }

    /// Record an interrupt line assignment. Lines are handed to devices by
    /// the controller; the bus only enforces that no GSI is claimed twice.
    pub fn claim_line(&mut self, gsi: u32, owner: &'static str) -> Result<()> {
        if let Some(prev) = self.lines.insert(gsi, owner) {
            return Err(Error::Config(format!(
                "{owner}: interrupt line {gsi} already owned by {prev}"
            )));
        }
        Ok(())
    }

    fn record(&self, addr: u64, data: &[u8], is_write: bool, is_port: bool) {
        let mut value = [0u8; 8];
        let n = data.len().min(8);
        value[..n].copy_from_slice(&data[..n]);
        let mut ring = self.trace.lock().unwrap();
        if ring.len() == TRACE_DEPTH {
            ring.pop_front();
        }
        ring.push_back(TraceEvent {
            addr,
            value: u64::from_le_bytes(value),
            len: data.len() as u8,
            is_write,
            is_port,
        });
    }

    /// The recent-access ring, oldest first.
    pub fn recent_trace(&self) -> Vec<TraceEvent> {
        self.trace.lock().unwrap().iter().copied().collect()
    }

    /// Dispatch a port-I/O exit to the owning device.
    pub fn port_io(&self, port: u16, data: &mut [u8], is_write: bool) -> Result<()> {
        self.record(port as u64, data, is_write, true);
        match self.ports.get(&port) {
            Some(&idx) => self.devices[idx].lock().unwrap().port_io(port, data, is_write),
            None if is_write => {
                trace!(port = format_args!("{port:#x}"), "write to unowned port");
                Ok(())
            }
            None => {
                // Reads from unowned ports float high, like an empty ISA bus.
                data.fill(0xff);
                Ok(())
            }
        }
    }

    /// Dispatch an MMIO exit to the owning device.
    pub fn mmio(&self, gpa: u64, data: &mut [u8], is_write: bool) -> Result<()> {
        self.record(gpa, data, is_write, false);
        match self.find_mmio(gpa) {
            Some(idx) => self.devices[idx].lock().unwrap().mmio(gpa, data, is_write),
            None => Err(Error::Guest(format!(
                "unhandled MMIO {} at {gpa:#x} ({} bytes)",
                if is_write { "write" } else { "read" },
                data.len()
            ))),
        }
    }

    /// True if some device owns `gpa`.
    pub fn owns_mmio(&self, gpa: u64) -> bool {
        self.find_mmio(gpa).is_some()
    }

    fn find_mmio(&self, gpa: u64) -> Option<usize> {
        // Last range with base <= gpa; candidate must still contain gpa.
        let pos = self.mmio.partition_point(|(r, _)| r.base <= gpa);
        if pos == 0 {
            return None;
        }
        let (range, idx) = &self.mmio[pos - 1];
        range.contains(gpa).then_some(*idx)
    }

    /// Run every device's poll hook once.
    pub fn poll_all(&self) -> Result<()> {
        for dev in &self.devices {
            dev.lock().unwrap().poll()?;
        }
        Ok(())
    }

    /// Reset every device to power-on state.
    pub fn reset_all(&self) {
        for dev in &self.devices {
            dev.lock().unwrap().reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Stub {
        name: &'static str,
        ports: Vec<PortRange>,
        mmio: Vec<MmioRange>,
        hits: usize,
    }

    impl Stub {
        fn shared(
            name: &'static str,
            ports: Vec<PortRange>,
            mmio: Vec<MmioRange>,
        ) -> Arc<Mutex<Stub>> {
            Arc::new(Mutex::new(Stub {
                name,
                ports,
                mmio,
                hits: 0,
            }))
        }
    }

    impl Device for Stub {
        fn name(&self) -> &'static str {
            self.name
        }
        fn port_ranges(&self) -> Vec<PortRange> {
            self.ports.clone()
        }
        fn mmio_ranges(&self) -> Vec<MmioRange> {
            self.mmio.clone()
        }
        fn port_io(&mut self, _port: u16, data: &mut [u8], is_write: bool) -> Result<()> {
            self.hits += 1;
            if !is_write {
                data.fill(0x42);
            }
            Ok(())
        }
        fn mmio(&mut self, _gpa: u64, _data: &mut [u8], _is_write: bool) -> Result<()> {
            self.hits += 1;
            Ok(())
        }
    }

    #[test]
    fn rejects_port_overlap() {
        let mut bus = DeviceBus::new();
        bus.add(Stub::shared("a", vec![PortRange::new(0x60, 5)], vec![]))
            .unwrap();
        let err = bus
            .add(Stub::shared("b", vec![PortRange::new(0x64, 1)], vec![]))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn rejects_mmio_overlap() {
        let mut bus = DeviceBus::new();
        bus.add(Stub::shared("a", vec![], vec![MmioRange::new(0x1000, 0x100)]))
            .unwrap();
        assert!(bus
            .add(Stub::shared("b", vec![], vec![MmioRange::new(0x10ff, 0x10)]))
            .is_err());
    }

    #[test]
    fn rejects_duplicate_line() {
        let mut bus = DeviceBus::new();
        bus.claim_line(5, "serial").unwrap();
        assert!(bus.claim_line(5, "net").is_err());
        bus.claim_line(6, "net").unwrap();
    }

    #[test]
    fn dispatches_by_binary_search() {
        let mut bus = DeviceBus::new();
        let lo = Stub::shared("lo", vec![], vec![MmioRange::new(0x1000, 0x100)]);
        let hi = Stub::shared("hi", vec![], vec![MmioRange::new(0x3000, 0x100)]);
        bus.add(hi.clone()).unwrap();
        bus.add(lo.clone()).unwrap();

        let mut buf = [0u8; 4];
        bus.mmio(0x1080, &mut buf, false).unwrap();
        bus.mmio(0x30ff, &mut buf, true).unwrap();
        assert_eq!(lo.lock().unwrap().hits, 1);
        assert_eq!(hi.lock().unwrap().hits, 1);

        // Gap between the two ranges is unowned.
        assert!(bus.mmio(0x2000, &mut buf, false).is_err());
        assert!(!bus.owns_mmio(0x1100));
    }

    #[test]
    fn unowned_port_reads_float_high() {
        let bus = DeviceBus::new();
        let mut buf = [0u8; 2];
        bus.port_io(0x80, &mut buf, false).unwrap();
        assert_eq!(buf, [0xff, 0xff]);
    }

    #[test]
    fn trace_ring_is_bounded_and_ordered() {
        let bus = DeviceBus::new();
        for i in 0..100u64 {
            let mut buf = (i as u32).to_le_bytes();
            let _ = bus.mmio(0x1000 + i, &mut buf, true);
        }
        let trace = bus.recent_trace();
        assert_eq!(trace.len(), 64);
        assert_eq!(trace.first().unwrap().addr, 0x1000 + 36);
        assert_eq!(trace.last().unwrap().addr, 0x1000 + 99);
        assert!(trace.last().unwrap().is_write);
        assert_eq!(trace.last().unwrap().value, 99);
    }
}
