//! Dual 8259A programmable interrupt controller
//!
//! Master/slave cascade with the ICW1-4 initialization sequence and the OCW
//! commands the Linux legacy probe path exercises. The pair drives a single
//! aggregated output line; the run loop (or the LAPIC, in APIC mode) decides
//! what to do with it.

use std::sync::Arc;

use tracing::trace;

use super::{Device, InterruptLine, PortRange};
use crate::Result;

/// Initialization state machine for one 8259A.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InitState {
    Ready,
    ExpectIcw2,
    ExpectIcw3,
    ExpectIcw4,
}

struct Chip {
    irr: u8,
    isr: u8,
    imr: u8,
    /// Interrupt vector base from ICW2.
    base: u8,
    init: InitState,
    icw4_needed: bool,
    auto_eoi: bool,
    /// OCW3 register select: false → IRR, true → ISR.
    read_isr: bool,
    /// Last observed level per input, for edge detection.
    levels: u8,
}

impl Chip {
    fn new() -> Self {
        Self {
            irr: 0,
            isr: 0,
            imr: 0xff,
            base: 0,
            init: InitState::Ready,
            icw4_needed: false,
            auto_eoi: false,
            read_isr: false,
            levels: 0,
        }
    }

    fn set_input(&mut self, pin: u8, high: bool) {
        let bit = 1u8 << pin;
        let was = self.levels & bit != 0;
        if high {
            self.levels |= bit;
            if !was {
                self.irr |= bit;
            }
        } else {
            self.levels &= !bit;
        }
    }

    /// Highest-priority pending pin: lowest number wins, blocked by any
    /// in-service interrupt of equal or higher priority.
    fn pending_pin(&self) -> Option<u8> {
        let candidates = self.irr & !self.imr;
        for pin in 0..8 {
            let bit = 1u8 << pin;
            if self.isr & bit != 0 {
                return None; // higher-priority interrupt still in service
            }
            if candidates & bit != 0 {
                return Some(pin);
            }
        }
        None
    }

    fn command(&mut self, value: u8) {
        if value & 0x10 != 0 {
            // ICW1: restart initialization.
            self.init = InitState::ExpectIcw2;
            self.icw4_needed = value & 0x01 != 0;
            self.imr = 0;
            self.isr = 0;
            self.irr = 0;
            self.read_isr = false;
            return;
        }
        if value & 0x08 != 0 {
            // OCW3
            match value & 0x03 {
                0x02 => self.read_isr = false,
                0x03 => self.read_isr = true,
                _ => {}
            }
            return;
        }
        // OCW2: EOI and rotation commands.
        match value & 0xe0 {
            0x20 => {
                // Non-specific EOI: drop the highest-priority in-service bit.
                for pin in 0..8 {
                    let bit = 1u8 << pin;
                    if self.isr & bit != 0 {
                        self.isr &= !bit;
                        break;
                    }
                }
            }
            0x60 => {
                // Specific EOI.
                self.isr &= !(1u8 << (value & 0x07));
            }
            _ => trace!(value, "ignored OCW2 command"),
        }
    }

    fn data_write(&mut self, value: u8) {
        match self.init {
            InitState::ExpectIcw2 => {
                self.base = value & 0xf8;
                self.init = InitState::ExpectIcw3;
            }
            InitState::ExpectIcw3 => {
                self.init = if self.icw4_needed {
                    InitState::ExpectIcw4
                } else {
                    InitState::Ready
                };
            }
            InitState::ExpectIcw4 => {
                self.auto_eoi = value & 0x02 != 0;
                self.init = InitState::Ready;
            }
            InitState::Ready => self.imr = value, // OCW1
        }
    }

    fn data_read(&self) -> u8 {
        self.imr
    }

    fn command_read(&self) -> u8 {
        if self.read_isr {
            self.isr
        } else {
            self.irr
        }
    }

    /// Deliver the pending pin: IRR → ISR (unless auto-EOI) and return it.
    fn acknowledge(&mut self) -> Option<u8> {
        let pin = self.pending_pin()?;
        let bit = 1u8 << pin;
        self.irr &= !bit;
        if !self.auto_eoi {
            self.isr |= bit;
        }
        Some(pin)
    }
}

/// The cascaded pair. Inputs 0-7 land on the master, 8-15 on the slave whose
/// output feeds master pin 2.
pub struct DualPic {
    master: Chip,
    slave: Chip,
    output: Arc<dyn InterruptLine>,
}

impl DualPic {
    pub fn new(output: Arc<dyn InterruptLine>) -> Self {
        Self {
            master: Chip::new(),
            slave: Chip::new(),
            output,
        }
    }

    /// Drive one of the 16 legacy inputs.
    pub fn set_irq(&mut self, irq: u8, high: bool) {
        if irq < 8 {
            self.master.set_input(irq, high);
        } else {
            self.slave.set_input(irq - 8, high);
        }
        self.cascade();
        self.update_output();
    }

    /// Slave output feeds master input 2.
    fn cascade(&mut self) {
        let slave_pending = self.slave.pending_pin().is_some();
        self.master.set_input(2, slave_pending);
        if !slave_pending {
            // Level input: a deasserted cascade also clears the latched edge
            // so a stale IRQ2 does not fire.
            self.master.irr &= !(1 << 2);
        }
    }

    /// INTA cycle: returns the vector to inject, if any.
    pub fn acknowledge(&mut self) -> Option<u8> {
        let pin = self.master.acknowledge()?;
        let vector = if pin == 2 {
            let spin = self.slave.acknowledge()?;
            self.slave.base + spin
        } else {
            self.master.base + pin
        };
        self.cascade();
        self.update_output();
        Some(vector)
    }

    /// True while an unmasked interrupt is pending.
    pub fn has_pending(&self) -> bool {
        self.master.pending_pin().is_some()
    }

    fn update_output(&self) {
        self.output.set_level(self.has_pending());
    }
}

/// An interrupt line bound to one of the 16 legacy PIC inputs.
pub struct PicLine {
    pic: Arc<std::sync::Mutex<DualPic>>,
    irq: u8,
}

impl PicLine {
    pub fn new(pic: Arc<std::sync::Mutex<DualPic>>, irq: u8) -> Arc<Self> {
        Arc::new(Self { pic, irq })
    }
}

impl InterruptLine for PicLine {
    fn set_level(&self, high: bool) {
        self.pic.lock().unwrap().set_irq(self.irq, high);
    }
}

impl Device for DualPic {
    fn name(&self) -> &'static str {
        "pic8259"
    }

    fn port_ranges(&self) -> Vec<PortRange> {
        // Command/data pairs, plus the ELCR trigger-mode registers.
        vec![
            PortRange::new(0x20, 2),
            PortRange::new(0xa0, 2),
            PortRange::new(0x4d0, 2),
        ]
    }

    fn port_io(&mut self, port: u16, data: &mut [u8], is_write: bool) -> Result<()> {
        let value = data[0];
        match (port, is_write) {
            (0x20, true) => self.master.command(value),
            (0x20, false) => data[0] = self.master.command_read(),
            (0x21, true) => self.master.data_write(value),
            (0x21, false) => data[0] = self.master.data_read(),
            (0xa0, true) => self.slave.command(value),
            (0xa0, false) => data[0] = self.slave.command_read(),
            (0xa1, true) => self.slave.data_write(value),
            (0xa1, false) => data[0] = self.slave.data_read(),
            (0x4d0..=0x4d1, true) => {} // ELCR accepted, trigger mode implicit
            (0x4d0..=0x4d1, false) => data[0] = 0,
            _ => {}
        }
        self.cascade();
        self.update_output();
        Ok(())
    }

    fn reset(&mut self) {
        self.master = Chip::new();
        self.slave = Chip::new();
        self.update_output();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::MockLine;

    fn init(pic: &mut DualPic) {
        // Standard Linux setup: ICW1, vector bases 0x20/0x28, cascade, 8086.
        pic.port_io(0x20, &mut [0x11], true).unwrap();
        pic.port_io(0x21, &mut [0x20], true).unwrap();
        pic.port_io(0x21, &mut [0x04], true).unwrap();
        pic.port_io(0x21, &mut [0x01], true).unwrap();
        pic.port_io(0xa0, &mut [0x11], true).unwrap();
        pic.port_io(0xa1, &mut [0x28], true).unwrap();
        pic.port_io(0xa1, &mut [0x02], true).unwrap();
        pic.port_io(0xa1, &mut [0x01], true).unwrap();
        // Unmask everything.
        pic.port_io(0x21, &mut [0x00], true).unwrap();
        pic.port_io(0xa1, &mut [0x00], true).unwrap();
    }

    #[test]
    fn master_irq_delivers_vector() {
        let line = MockLine::new();
        let mut pic = DualPic::new(line.clone());
        init(&mut pic);
        pic.set_irq(0, true);
        assert!(line.level());
        assert_eq!(pic.acknowledge(), Some(0x20));
        assert!(!line.level());
        // Still in service: a second edge must wait for EOI.
        pic.set_irq(0, false);
        pic.set_irq(0, true);
        assert_eq!(pic.acknowledge(), None);
        pic.port_io(0x20, &mut [0x20], true).unwrap(); // non-specific EOI
        assert_eq!(pic.acknowledge(), Some(0x20));
    }

    #[test]
    fn slave_cascades_through_pin2() {
        let mut pic = DualPic::new(MockLine::new());
        init(&mut pic);
        pic.set_irq(8, true);
        assert_eq!(pic.acknowledge(), Some(0x28));
    }

    #[test]
    fn masked_irq_stays_pending() {
        let line = MockLine::new();
        let mut pic = DualPic::new(line.clone());
        init(&mut pic);
        pic.port_io(0x21, &mut [0x02], true).unwrap(); // mask IRQ1
        pic.set_irq(1, true);
        assert!(!line.level());
        pic.port_io(0x21, &mut [0x00], true).unwrap();
        assert!(line.level());
    }

    #[test]
    fn ocw3_selects_isr_read() {
        let mut pic = DualPic::new(MockLine::new());
        init(&mut pic);
        pic.set_irq(3, true);
        let mut v = [0u8];
        pic.port_io(0x20, &mut v, false).unwrap();
        assert_eq!(v[0], 1 << 3, "IRR by default");
        pic.acknowledge();
        pic.port_io(0x20, &mut [0x0b], true).unwrap();
        pic.port_io(0x20, &mut v, false).unwrap();
        assert_eq!(v[0], 1 << 3, "ISR after OCW3 select");
    }
}
