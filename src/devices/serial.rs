//! 16550 UART emulation
//!
//! Full register model: divisor latches, IER/IIR/FCR/LCR/MCR/LSR/MSR/SCR,
//! 16-byte RX/TX FIFOs with programmable trigger level, OUT2 interrupt
//! gating, and loopback mode. Host output goes to a byte sink; host input
//! arrives through a shared queue drained by the poll hook.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::{Arc, Mutex};

use tracing::trace;

use super::{Device, InterruptLine, PortRange};
use crate::Result;

const FIFO_SIZE: usize = 16;

/// Line Status Register bits
mod lsr {
    /// Data Ready (RX FIFO non-empty)
    pub const DR: u8 = 1 << 0;
    /// Overrun Error
    pub const OE: u8 = 1 << 1;
    /// Transmitter Holding Register Empty (TX FIFO has room)
    pub const THRE: u8 = 1 << 5;
    /// Transmitter Empty (TX FIFO drained)
    pub const TEMT: u8 = 1 << 6;
}

/// Modem Control Register bits
mod mcr {
    pub const DTR: u8 = 1 << 0;
    pub const RTS: u8 = 1 << 1;
    pub const OUT1: u8 = 1 << 2;
    /// Gates interrupt delivery: the IRQ line stays low while OUT2 is clear.
    pub const OUT2: u8 = 1 << 3;
    /// Loopback: TX bytes route into RX, MCR outputs reflect into MSR.
    pub const LOOP: u8 = 1 << 4;
}

/// Interrupt Enable Register bits
mod ier {
    pub const RX_AVAIL: u8 = 1 << 0;
    pub const THR_EMPTY: u8 = 1 << 1;
    pub const LINE_STATUS: u8 = 1 << 2;
    pub const MODEM_STATUS: u8 = 1 << 3;
}

/// IIR interrupt identification values (bits 3:1), highest priority first.
mod iir {
    pub const NONE: u8 = 0x01;
    pub const LINE_STATUS: u8 = 0x06;
    pub const RX_AVAIL: u8 = 0x04;
    pub const THR_EMPTY: u8 = 0x02;
    pub const MODEM_STATUS: u8 = 0x00;
    /// Bits 7:6 read back set while the FIFOs are enabled.
    pub const FIFO_ENABLED: u8 = 0xc0;
}

/// Fixed-capacity byte FIFO, head/tail indexed.
struct Fifo {
    buf: [u8; FIFO_SIZE],
    head: usize,
    count: usize,
}

impl Fifo {
    fn new() -> Self {
        Self {
            buf: [0; FIFO_SIZE],
            head: 0,
            count: 0,
        }
    }

    fn push(&mut self, byte: u8) -> bool {
        if self.count == FIFO_SIZE {
            return false;
        }
        self.buf[(self.head + self.count) % FIFO_SIZE] = byte;
        self.count += 1;
        true
    }

    fn pop(&mut self) -> Option<u8> {
        if self.count == 0 {
            return None;
        }
        let b = self.buf[self.head];
        self.head = (self.head + 1) % FIFO_SIZE;
        self.count -= 1;
        Some(b)
    }

    fn clear(&mut self) {
        self.head = 0;
        self.count = 0;
    }

    fn len(&self) -> usize {
        self.count
    }

    fn is_full(&self) -> bool {
        self.count == FIFO_SIZE
    }
}

/// 16550 UART device owning 8 consecutive ports.
pub struct Uart16550 {
    base: u16,
    /// MMIO window base for platforms that map the block (ARM64).
    mmio_base: Option<u64>,
    line: Arc<dyn InterruptLine>,
    out: Box<dyn Write + Send>,
    /// Host input queue; the stdin drain thread feeds this, `poll` empties it.
    input: Arc<Mutex<VecDeque<u8>>>,

    dll: u8,
    dlm: u8,
    ier: u8,
    fcr: u8,
    lcr: u8,
    mcr: u8,
    scr: u8,
    /// Overrun flag, surfaced through LSR bit 1 until LSR is read.
    overrun: bool,
    /// MSR delta bits (3:0), set on modem input changes, cleared on MSR read.
    msr_delta: u8,
    /// THR-empty interrupt latch; set on the TX→empty transition, cleared by
    /// an IIR read reporting it or a THR write.
    thre_latch: bool,
    /// CR was transmitted: the next LF from the guest is dropped.
    suppress_lf: bool,

    rx: Fifo,
    tx: Fifo,
}

impl Uart16550 {
    pub fn new(
        base: u16,
        line: Arc<dyn InterruptLine>,
        out: Box<dyn Write + Send>,
        input: Arc<Mutex<VecDeque<u8>>>,
    ) -> Self {
        Self {
            base,
            mmio_base: None,
            line,
            out,
            input,
            dll: 0,
            dlm: 0,
            ier: 0,
            fcr: 0,
            lcr: 0,
            mcr: 0,
            scr: 0,
            overrun: false,
            msr_delta: 0,
            thre_latch: false,
            suppress_lf: false,
            rx: Fifo::new(),
            tx: Fifo::new(),
        }
    }

    /// Expose the register block as a 32-bit-stride MMIO window instead of
    /// ports.
    pub fn with_mmio(mut self, base: u64) -> Self {
        self.mmio_base = Some(base);
        self
    }

    fn dlab(&self) -> bool {
        self.lcr & 0x80 != 0
    }

    fn fifo_enabled(&self) -> bool {
        self.fcr & 0x01 != 0
    }

    /// RX trigger level from FCR bits 7:6.
    fn trigger_level(&self) -> usize {
        if !self.fifo_enabled() {
            return 1;
        }
        match self.fcr >> 6 {
            0 => 1,
            1 => 4,
            2 => 8,
            _ => 14,
        }
    }

    fn lsr_value(&self) -> u8 {
        let mut v = 0;
        if self.rx.len() > 0 {
            v |= lsr::DR;
        }
        if self.overrun {
            v |= lsr::OE;
        }
        if !self.tx.is_full() {
            v |= lsr::THRE;
        }
        if self.tx.len() == 0 {
            v |= lsr::TEMT;
        }
        v
    }

    fn msr_value(&self) -> u8 {
        let mut v = self.msr_delta & 0x0f;
        if self.mcr & mcr::LOOP != 0 {
            // Loopback reflects the modem outputs back as inputs:
            // DTR→DSR, RTS→CTS, OUT1→RI, OUT2→DCD.
            if self.mcr & mcr::DTR != 0 {
                v |= 1 << 5;
            }
            if self.mcr & mcr::RTS != 0 {
                v |= 1 << 4;
            }
            if self.mcr & mcr::OUT1 != 0 {
                v |= 1 << 6;
            }
            if self.mcr & mcr::OUT2 != 0 {
                v |= 1 << 7;
            }
        } else {
            // Host side always ready.
            v |= (1 << 4) | (1 << 5) | (1 << 7);
        }
        v
    }

    /// Highest-priority pending interrupt id, or `iir::NONE`.
    fn pending_iir(&self) -> u8 {
        if self.ier & ier::LINE_STATUS != 0 && self.overrun {
            return iir::LINE_STATUS;
        }
        if self.ier & ier::RX_AVAIL != 0 && self.rx.len() >= self.trigger_level() {
            return iir::RX_AVAIL;
        }
        if self.ier & ier::THR_EMPTY != 0 && self.thre_latch {
            return iir::THR_EMPTY;
        }
        if self.ier & ier::MODEM_STATUS != 0 && self.msr_delta & 0x0f != 0 {
            return iir::MODEM_STATUS;
        }
        iir::NONE
    }

    /// Recompute the IRQ line level. OUT2 gates delivery unconditionally.
    fn update_irq(&self) {
        let pending = self.pending_iir() != iir::NONE;
        let gated = self.mcr & mcr::OUT2 != 0;
        self.line.set_level(pending && gated);
    }

    fn receive_byte(&mut self, byte: u8) {
        if !self.rx.push(byte) {
            // FIFO full: the new byte is dropped and overrun is flagged.
            self.overrun = true;
        }
    }

    fn write_thr(&mut self, byte: u8) {
        self.thre_latch = false;
        if self.mcr & mcr::LOOP != 0 {
            self.receive_byte(byte);
            self.update_irq();
            return;
        }
        // CR/LF collapsing: CR goes out as LF and eats the LF that usually
        // follows it.
        let emitted = match byte {
            b'\r' => {
                self.suppress_lf = true;
                Some(b'\n')
            }
            b'\n' if self.suppress_lf => {
                self.suppress_lf = false;
                None
            }
            b => {
                self.suppress_lf = false;
                Some(b)
            }
        };
        if let Some(b) = emitted {
            self.tx.push(b);
        }
        self.drain_tx();
    }

    fn drain_tx(&mut self) {
        let was_empty = self.tx.len() == 0;
        while let Some(b) = self.tx.pop() {
            let _ = self.out.write_all(&[b]);
        }
        let _ = self.out.flush();
        if !was_empty && self.tx.len() == 0 {
            self.thre_latch = true;
        }
    }

    fn read_reg(&mut self, offset: u16) -> u8 {
        match offset {
            0 if self.dlab() => self.dll,
            0 => {
                let b = self.rx.pop().unwrap_or(0);
                self.update_irq();
                b
            }
            1 if self.dlab() => self.dlm,
            1 => self.ier,
            2 => {
                let id = self.pending_iir();
                if id == iir::THR_EMPTY {
                    self.thre_latch = false;
                    self.update_irq();
                }
                let mut v = id;
                if self.fifo_enabled() {
                    v |= iir::FIFO_ENABLED;
                }
                v
            }
            3 => self.lcr,
            4 => self.mcr,
            5 => {
                let v = self.lsr_value();
                self.overrun = false;
                self.update_irq();
                v
            }
            6 => {
                let v = self.msr_value();
                self.msr_delta = 0;
                self.update_irq();
                v
            }
            7 => self.scr,
            _ => 0xff,
        }
    }

    fn write_reg(&mut self, offset: u16, value: u8) {
        match offset {
            0 if self.dlab() => self.dll = value,
            0 => self.write_thr(value),
            1 if self.dlab() => self.dlm = value,
            1 => {
                let newly_enabled = value & !self.ier;
                self.ier = value & 0x0f;
                // Enabling the THRE interrupt while the transmitter is
                // already empty raises it immediately.
                if newly_enabled & ier::THR_EMPTY != 0 && self.tx.len() == 0 {
                    self.thre_latch = true;
                }
            }
            2 => {
                self.fcr = value;
                if value & 0x02 != 0 {
                    self.rx.clear();
                }
                if value & 0x04 != 0 {
                    self.tx.clear();
                }
            }
            3 => self.lcr = value,
            4 => {
                let old = self.mcr;
                self.mcr = value & 0x1f;
                if (old ^ self.mcr) & 0x0f != 0 && self.mcr & mcr::LOOP != 0 {
                    // Loopback reflects output changes as modem input deltas.
                    self.msr_delta |= (old ^ self.mcr) & 0x0f;
                }
            }
            5 => {} // LSR is read-only
            6 => {} // MSR is read-only
            7 => self.scr = value,
            _ => trace!(offset, value, "write to unknown UART register"),
        }
        self.update_irq();
    }
}

impl Device for Uart16550 {
    fn name(&self) -> &'static str {
        "uart16550"
    }

    fn port_ranges(&self) -> Vec<PortRange> {
        if self.mmio_base.is_some() {
            return Vec::new();
        }
        vec![PortRange::new(self.base, 8)]
    }

    fn mmio_ranges(&self) -> Vec<crate::devices::MmioRange> {
        match self.mmio_base {
            Some(base) => vec![crate::devices::MmioRange::new(base, 0x1000)],
            None => Vec::new(),
        }
    }

    fn port_io(&mut self, port: u16, data: &mut [u8], is_write: bool) -> Result<()> {
        let offset = port - self.base;
        if is_write {
            for &b in data.iter() {
                self.write_reg(offset, b);
            }
        } else {
            for b in data.iter_mut() {
                *b = self.read_reg(offset);
            }
        }
        Ok(())
    }

    // ARM64 places the same register block in MMIO space (one register per
    // 32-bit slot, ns16550a compatible).
    fn mmio(&mut self, gpa: u64, data: &mut [u8], is_write: bool) -> Result<()> {
        let offset = ((gpa & 0xfff) / 4) as u16;
        if is_write {
            self.write_reg(offset, data[0]);
        } else {
            let v = self.read_reg(offset);
            data.fill(0);
            data[0] = v;
        }
        Ok(())
    }

    fn poll(&mut self) -> Result<()> {
        let input = self.input.clone();
        let mut pending = input.lock().unwrap();
        while let Some(b) = pending.pop_front() {
            self.receive_byte(b);
            if self.rx.is_full() {
                break;
            }
        }
        drop(pending);
        self.update_irq();
        Ok(())
    }

    fn reset(&mut self) {
        self.dll = 0;
        self.dlm = 0;
        self.ier = 0;
        self.fcr = 0;
        self.lcr = 0;
        self.mcr = 0;
        self.scr = 0;
        self.overrun = false;
        self.msr_delta = 0;
        self.thre_latch = false;
        self.suppress_lf = false;
        self.rx.clear();
        self.tx.clear();
        self.update_irq();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::MockLine;

    fn uart(line: Arc<MockLine>) -> (Uart16550, Arc<Mutex<VecDeque<u8>>>) {
        let input = Arc::new(Mutex::new(VecDeque::new()));
        let u = Uart16550::new(0x3f8, line, Box::new(std::io::sink()), input.clone());
        (u, input)
    }

    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn uart_with_sink() -> (Uart16550, Arc<Mutex<Vec<u8>>>) {
        let out = Arc::new(Mutex::new(Vec::new()));
        let input = Arc::new(Mutex::new(VecDeque::new()));
        let u = Uart16550::new(
            0x3f8,
            MockLine::new(),
            Box::new(SharedSink(out.clone())),
            input,
        );
        (u, out)
    }

    #[test]
    fn loopback_preserves_fifo_order() {
        let (mut u, _) = uart(MockLine::new());
        u.write_reg(4, mcr::LOOP);
        for &b in b"abc" {
            u.write_reg(0, b);
        }
        assert_eq!(u.read_reg(5) & lsr::DR, lsr::DR);
        assert_eq!(u.read_reg(0), b'a');
        assert_eq!(u.read_reg(0), b'b');
        assert_eq!(u.read_reg(0), b'c');
        // DR clears once the FIFO empties.
        assert_eq!(u.read_reg(5) & lsr::DR, 0);
    }

    #[test]
    fn out2_gates_irq() {
        let line = MockLine::new();
        let (mut u, input) = uart(line.clone());
        u.write_reg(1, ier::RX_AVAIL);
        input.lock().unwrap().extend(b"x");
        u.poll().unwrap();
        // Interrupt condition holds, but OUT2 is low.
        assert!(!line.level());
        u.write_reg(4, mcr::OUT2);
        assert!(line.level());
        u.write_reg(4, 0);
        assert!(!line.level());
    }

    #[test]
    fn rx_trigger_level() {
        let line = MockLine::new();
        let (mut u, input) = uart(line.clone());
        u.write_reg(4, mcr::OUT2);
        u.write_reg(1, ier::RX_AVAIL);
        u.write_reg(2, 0x01 | (1 << 6)); // FIFO on, trigger at 4
        input.lock().unwrap().extend(b"abc");
        u.poll().unwrap();
        assert!(!line.level());
        input.lock().unwrap().extend(b"d");
        u.poll().unwrap();
        assert!(line.level());
    }

    #[test]
    fn overrun_drops_byte_and_sets_oe() {
        let (mut u, input) = uart(MockLine::new());
        input.lock().unwrap().extend(vec![b'a'; FIFO_SIZE + 3]);
        u.poll().unwrap();
        u.poll().unwrap();
        assert_eq!(u.rx.len(), FIFO_SIZE);
        assert_ne!(u.read_reg(5) & lsr::OE, 0);
        // LSR read cleared the overrun flag.
        assert_eq!(u.read_reg(5) & lsr::OE, 0);
    }

    #[test]
    fn crlf_collapsing() {
        let (mut u, out) = uart_with_sink();
        for &b in b"hi\r\nthere\n" {
            u.write_reg(0, b);
        }
        assert_eq!(out.lock().unwrap().as_slice(), b"hi\nthere\n");
    }

    #[test]
    fn thre_interrupt_on_enable_and_iir_priority() {
        let line = MockLine::new();
        let (mut u, input) = uart(line.clone());
        u.write_reg(4, mcr::OUT2);
        u.write_reg(1, ier::RX_AVAIL | ier::THR_EMPTY);
        assert!(line.level());
        assert_eq!(u.read_reg(2) & 0x0f, iir::THR_EMPTY);
        // IIR read acknowledged THRE; nothing else pending.
        assert_eq!(u.read_reg(2) & 0x0f, iir::NONE);
        // RX data outranks THRE.
        input.lock().unwrap().extend(b"z");
        u.poll().unwrap();
        u.write_reg(0, b'q');
        assert_eq!(u.read_reg(2) & 0x0f, iir::RX_AVAIL);
    }

    #[test]
    fn loopback_reflects_mcr_into_msr() {
        let (mut u, _) = uart(MockLine::new());
        u.write_reg(4, mcr::LOOP | mcr::DTR | mcr::RTS);
        let msr = u.read_reg(6);
        assert_ne!(msr & (1 << 5), 0, "DTR -> DSR");
        assert_ne!(msr & (1 << 4), 0, "RTS -> CTS");
        assert_eq!(msr & (1 << 7), 0, "OUT2 low -> DCD low");
    }

    #[test]
    fn lsr_invariants_hold() {
        let (mut u, input) = uart(MockLine::new());
        assert_eq!(u.lsr_value() & lsr::DR, 0);
        assert_ne!(u.lsr_value() & lsr::THRE, 0);
        input.lock().unwrap().extend(b"k");
        u.poll().unwrap();
        assert_ne!(u.lsr_value() & lsr::DR, 0);
    }
}
