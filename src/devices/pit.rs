//! i8254 programmable interval timer
//!
//! Channel 0 drives IRQ0 at the programmed rate; channel 2 exists only far
//! enough for the speaker-gate timing loop the kernel's calibration path
//! uses. The counter advances against host monotonic time in `poll`.

use std::sync::Arc;
use std::time::Instant;

use tracing::trace;

use super::{Device, InterruptLine, PortRange};
use crate::Result;

/// Input clock of the 8254, in Hz.
const PIT_HZ: f64 = 1_193_182.0;

struct Channel {
    reload: u16,
    mode: u8,
    /// Access mode from the control word (1=lo, 2=hi, 3=lo/hi).
    access: u8,
    /// Pending low byte during a lo/hi write sequence.
    write_lo: Option<u8>,
    /// Latched value for a lo/hi read sequence.
    read_latch: Option<u16>,
    read_hi: bool,
    armed: bool,
}

impl Channel {
    fn new() -> Self {
        Self {
            reload: 0,
            mode: 0,
            access: 3,
            write_lo: None,
            read_latch: None,
            read_hi: false,
            armed: false,
        }
    }

    fn period_ns(&self) -> u64 {
        let reload = if self.reload == 0 { 0x10000 } else { self.reload as u32 };
        (reload as f64 / PIT_HZ * 1e9) as u64
    }
}

/// i8254 PIT at ports 0x40-0x43, plus the port 0x61 timer/speaker status the
/// legacy calibration loop polls.
pub struct Pit {
    channels: [Channel; 3],
    irq0: Arc<dyn InterruptLine>,
    start: Instant,
    /// Nanosecond timestamp of the last channel-0 fire.
    last_fire_ns: u64,
    port61: u8,
}

impl Pit {
    pub fn new(irq0: Arc<dyn InterruptLine>) -> Self {
        Self {
            channels: [Channel::new(), Channel::new(), Channel::new()],
            irq0,
            start: Instant::now(),
            last_fire_ns: 0,
            port61: 0,
        }
    }

    fn now_ns(&self) -> u64 {
        self.start.elapsed().as_nanos() as u64
    }

    /// Current down-counter value for a channel, derived from elapsed time.
    fn current_count(&self, ch: usize) -> u16 {
        let reload = if self.channels[ch].reload == 0 {
            0x10000u64
        } else {
            self.channels[ch].reload as u64
        };
        let ticks = (self.now_ns() as f64 / 1e9 * PIT_HZ) as u64;
        (reload - (ticks % reload)) as u16
    }

    fn write_control(&mut self, value: u8) {
        let ch = (value >> 6) as usize;
        if ch == 3 {
            // Read-back command: latch the selected channels.
            for i in 0..3 {
                if value & (1 << (i + 1)) != 0 {
                    let count = self.current_count(i);
                    self.channels[i].read_latch = Some(count);
                }
            }
            return;
        }
        let access = (value >> 4) & 0x3;
        if access == 0 {
            // Counter latch command.
            let count = self.current_count(ch);
            self.channels[ch].read_latch = Some(count);
            self.channels[ch].read_hi = false;
            return;
        }
        let c = &mut self.channels[ch];
        c.access = access;
        c.mode = (value >> 1) & 0x7;
        c.write_lo = None;
        c.read_latch = None;
        c.read_hi = false;
        trace!(channel = ch, mode = c.mode, "PIT control word");
    }

    fn write_counter(&mut self, ch: usize, value: u8) {
        let now = self.now_ns();
        let c = &mut self.channels[ch];
        let reload = match c.access {
            1 => Some(value as u16),
            2 => Some((value as u16) << 8),
            _ => match c.write_lo.take() {
                None => {
                    c.write_lo = Some(value);
                    None
                }
                Some(lo) => Some(((value as u16) << 8) | lo as u16),
            },
        };
        if let Some(r) = reload {
            c.reload = r;
            c.armed = true;
            if ch == 0 {
                self.last_fire_ns = now;
            }
        }
    }

    fn read_counter(&mut self, ch: usize) -> u8 {
        let latched = self.channels[ch].read_latch;
        let value = latched.unwrap_or_else(|| self.current_count(ch));
        let c = &mut self.channels[ch];
        match c.access {
            1 => {
                c.read_latch = None;
                value as u8
            }
            2 => {
                c.read_latch = None;
                (value >> 8) as u8
            }
            _ => {
                if c.read_hi {
                    c.read_hi = false;
                    c.read_latch = None;
                    (value >> 8) as u8
                } else {
                    c.read_hi = true;
                    value as u8
                }
            }
        }
    }
}

impl Device for Pit {
    fn name(&self) -> &'static str {
        "i8254"
    }

    fn port_ranges(&self) -> Vec<PortRange> {
        vec![PortRange::new(0x40, 4), PortRange::new(0x61, 1)]
    }

    fn port_io(&mut self, port: u16, data: &mut [u8], is_write: bool) -> Result<()> {
        match (port, is_write) {
            (0x40..=0x42, true) => self.write_counter((port - 0x40) as usize, data[0]),
            (0x40..=0x42, false) => data[0] = self.read_counter((port - 0x40) as usize),
            (0x43, true) => self.write_control(data[0]),
            (0x43, false) => data[0] = 0,
            (0x61, true) => self.port61 = data[0] & 0x0f,
            (0x61, false) => {
                // Toggle the refresh bit so timing loops observe progress;
                // bit 5 mirrors the channel-2 output.
                self.port61 ^= 0x10;
                data[0] = self.port61;
            }
            _ => {}
        }
        Ok(())
    }

    fn poll(&mut self) -> Result<()> {
        let c = &self.channels[0];
        if !c.armed {
            return Ok(());
        }
        let period = c.period_ns();
        if period == 0 {
            return Ok(());
        }
        let now = self.now_ns();
        if now.saturating_sub(self.last_fire_ns) >= period {
            self.last_fire_ns = now;
            self.irq0.pulse();
        }
        Ok(())
    }

    fn reset(&mut self) {
        for c in self.channels.iter_mut() {
            *c = Channel::new();
        }
        self.port61 = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::MockLine;

    #[test]
    fn lo_hi_write_programs_reload() {
        let mut pit = Pit::new(MockLine::new());
        let mut b = [0x34u8]; // channel 0, lo/hi, mode 2
        pit.port_io(0x43, &mut b, true).unwrap();
        pit.port_io(0x40, &mut [0x9c], true).unwrap();
        pit.port_io(0x40, &mut [0x2e], true).unwrap();
        assert_eq!(pit.channels[0].reload, 0x2e9c);
        assert!(pit.channels[0].armed);
    }

    #[test]
    fn latch_then_read_is_stable() {
        let mut pit = Pit::new(MockLine::new());
        pit.port_io(0x43, &mut [0x34], true).unwrap();
        pit.port_io(0x40, &mut [0x00], true).unwrap();
        pit.port_io(0x40, &mut [0x10], true).unwrap();
        // Latch channel 0.
        pit.port_io(0x43, &mut [0x00], true).unwrap();
        let mut lo = [0u8];
        let mut hi = [0u8];
        pit.port_io(0x40, &mut lo, false).unwrap();
        pit.port_io(0x40, &mut hi, false).unwrap();
        let v = u16::from_le_bytes([lo[0], hi[0]]);
        assert!(v <= 0x1000);
    }

    #[test]
    fn port61_refresh_toggles() {
        let mut pit = Pit::new(MockLine::new());
        let mut a = [0u8];
        let mut b = [0u8];
        pit.port_io(0x61, &mut a, false).unwrap();
        pit.port_io(0x61, &mut b, false).unwrap();
        assert_ne!(a[0] & 0x10, b[0] & 0x10);
    }

    #[test]
    fn periodic_fire_pulses_irq0() {
        let line = MockLine::new();
        let mut pit = Pit::new(line.clone());
        pit.port_io(0x43, &mut [0x34], true).unwrap();
        // Tiny reload so the period elapses immediately.
        pit.port_io(0x40, &mut [0x02], true).unwrap();
        pit.port_io(0x40, &mut [0x00], true).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(1));
        pit.poll().unwrap();
        assert!(line.rising_edges() >= 1);
    }
}
