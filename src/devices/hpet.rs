//! HPET emulation
//!
//! 64-bit main counter at a 10 MHz effective rate plus a small bank of
//! comparators. The guest kernel mostly wants the counter as a stable
//! clocksource; comparators assert their routed GSI on match from `poll`.

use std::sync::Arc;
use std::time::Instant;

use tracing::trace;

use super::{Device, InterruptLine, MmioRange};
use crate::Result;

/// HPET base address.
pub const HPET_BASE: u64 = 0xfed0_0000;
/// Femtoseconds per counter tick (10 MHz).
pub const PERIOD_FS: u32 = 100_000_000;
/// Number of comparators.
pub const NUM_TIMERS: usize = 3;
/// First GSI a comparator can route to; `NUM_TIMERS` consecutive lines.
pub const ROUTE_BASE: u32 = 20;

mod timer_cfg {
    /// Level-triggered interrupt.
    pub const INT_TYPE_LEVEL: u64 = 1 << 1;
    /// Interrupt enable.
    pub const INT_ENABLE: u64 = 1 << 2;
    /// Periodic mode.
    pub const PERIODIC: u64 = 1 << 3;
    pub const ROUTE_SHIFT: u64 = 9;
}

struct Timer {
    config: u64,
    comparator: u64,
    period: u64,
    line: Arc<dyn InterruptLine>,
    fired: bool,
}

pub struct Hpet {
    /// General configuration: bit 0 enables the counter.
    config: u64,
    int_status: u64,
    /// Counter value when the counter was last stopped or written.
    counter_base: u64,
    started: Instant,
    timers: Vec<Timer>,
}

impl Hpet {
    /// `lines[i]` is the interrupt line for GSI `ROUTE_BASE + i`.
    pub fn new(lines: Vec<Arc<dyn InterruptLine>>) -> Self {
        assert_eq!(lines.len(), NUM_TIMERS);
        let timers = lines
            .into_iter()
            .enumerate()
            .map(|(i, line)| Timer {
                config: ((ROUTE_BASE as u64 + i as u64) << timer_cfg::ROUTE_SHIFT)
                    | ((1u64 << (ROUTE_BASE as u64 + i as u64)) << 32),
                comparator: u64::MAX,
                period: 0,
                line,
                fired: false,
            })
            .collect();
        Self {
            config: 0,
            int_status: 0,
            counter_base: 0,
            started: Instant::now(),
            timers,
        }
    }

    fn enabled(&self) -> bool {
        self.config & 1 != 0
    }

    /// Current main counter value in ticks.
    pub fn counter(&self) -> u64 {
        if !self.enabled() {
            return self.counter_base;
        }
        let elapsed_fs = self.started.elapsed().as_nanos() as u64 * 1_000_000;
        self.counter_base + elapsed_fs / PERIOD_FS as u64
    }

    fn capabilities() -> u64 {
        // rev 1, NUM_TIMERS-1, 64-bit counter, vendor 0x8086, period.
        0x01 | ((NUM_TIMERS as u64 - 1) << 8) | (1 << 13) | (0x8086 << 16)
            | ((PERIOD_FS as u64) << 32)
    }

    fn read_reg(&mut self, offset: u64) -> u64 {
        match offset {
            0x000 => Self::capabilities(),
            0x010 => self.config,
            0x020 => self.int_status,
            0x0f0 => self.counter(),
            0x100..=0x1ff => {
                let n = ((offset - 0x100) / 0x20) as usize;
                if n >= NUM_TIMERS {
                    return 0;
                }
                match (offset - 0x100) % 0x20 {
                    0x00 => self.timers[n].config,
                    0x08 => self.timers[n].comparator,
                    _ => 0,
                }
            }
            _ => 0,
        }
    }

    fn write_reg(&mut self, offset: u64, value: u64) {
        match offset {
            0x010 => {
                let was_enabled = self.enabled();
                self.config = value & 0x3;
                if !was_enabled && self.enabled() {
                    self.started = Instant::now();
                } else if was_enabled && !self.enabled() {
                    self.counter_base = self.counter();
                }
            }
            0x020 => {
                // Write-one-to-clear; dropping a level bit deasserts its line.
                for n in 0..NUM_TIMERS {
                    let bit = 1u64 << n;
                    if value & bit != 0 && self.int_status & bit != 0 {
                        self.int_status &= !bit;
                        self.timers[n].line.set_level(false);
                    }
                }
            }
            0x0f0 => {
                self.counter_base = value;
                self.started = Instant::now();
            }
            0x100..=0x1ff => {
                let n = ((offset - 0x100) / 0x20) as usize;
                if n >= NUM_TIMERS {
                    return;
                }
                match (offset - 0x100) % 0x20 {
                    0x00 => {
                        let keep = self.timers[n].config & 0xffff_ffff_0000_0000;
                        self.timers[n].config = keep | (value & 0xffff_ffff);
                    }
                    0x08 => {
                        let counter = self.counter();
                        let t = &mut self.timers[n];
                        t.comparator = value;
                        if t.config & timer_cfg::PERIODIC != 0 {
                            t.period = value.wrapping_sub(counter).max(1);
                        }
                        t.fired = false;
                        trace!(timer = n, comparator = value, "HPET comparator armed");
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }
}

impl Device for Hpet {
    fn name(&self) -> &'static str {
        "hpet"
    }

    fn mmio_ranges(&self) -> Vec<MmioRange> {
        vec![MmioRange::new(HPET_BASE, 0x400)]
    }

    fn mmio(&mut self, gpa: u64, data: &mut [u8], is_write: bool) -> Result<()> {
        let aligned = (gpa - HPET_BASE) & !7;
        let shift = ((gpa - HPET_BASE) & 7) * 8;
        if is_write {
            let mut v = [0u8; 8];
            let n = data.len().min(8);
            v[..n].copy_from_slice(&data[..n]);
            let value = u64::from_le_bytes(v) << shift;
            if shift == 0 && n == 8 {
                self.write_reg(aligned, value);
            } else {
                // Partial write: merge into the existing register value.
                let old = self.read_reg(aligned);
                let mask = (!0u64 >> (64 - n as u64 * 8)) << shift;
                self.write_reg(aligned, (old & !mask) | (value & mask));
            }
        } else {
            let v = (self.read_reg(aligned) >> shift).to_le_bytes();
            let n = data.len().min(8);
            data[..n].copy_from_slice(&v[..n]);
        }
        Ok(())
    }

    fn poll(&mut self) -> Result<()> {
        if !self.enabled() {
            return Ok(());
        }
        let now = self.counter();
        for n in 0..NUM_TIMERS {
            let t = &mut self.timers[n];
            if t.config & timer_cfg::INT_ENABLE == 0 {
                continue;
            }
            if now < t.comparator || t.fired {
                continue;
            }
            if t.config & timer_cfg::PERIODIC != 0 && t.period > 0 {
                while t.comparator <= now {
                    t.comparator = t.comparator.wrapping_add(t.period);
                }
            } else {
                t.fired = true;
            }
            self.int_status |= 1 << n;
            if t.config & timer_cfg::INT_TYPE_LEVEL != 0 {
                t.line.set_level(true);
            } else {
                t.line.pulse();
            }
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.config = 0;
        self.int_status = 0;
        self.counter_base = 0;
        for t in self.timers.iter_mut() {
            t.comparator = u64::MAX;
            t.period = 0;
            t.fired = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::MockLine;

    fn hpet_with_lines() -> (Hpet, Vec<Arc<MockLine>>) {
        let lines: Vec<Arc<MockLine>> = (0..NUM_TIMERS).map(|_| MockLine::new()).collect();
        let h = Hpet::new(
            lines
                .iter()
                .map(|l| l.clone() as Arc<dyn InterruptLine>)
                .collect(),
        );
        (h, lines)
    }

    #[test]
    fn capabilities_report_period_and_timers() {
        let caps = Hpet::capabilities();
        assert_eq!((caps >> 32) as u32, PERIOD_FS);
        assert_eq!((caps >> 8) & 0x1f, NUM_TIMERS as u64 - 1);
        assert_ne!(caps & (1 << 13), 0, "64-bit counter");
    }

    #[test]
    fn counter_only_runs_while_enabled() {
        let (mut h, _) = hpet_with_lines();
        assert_eq!(h.counter(), 0);
        h.write_reg(0x010, 1);
        std::thread::sleep(std::time::Duration::from_millis(2));
        let a = h.counter();
        assert!(a > 0);
        h.write_reg(0x010, 0);
        let frozen = h.counter();
        std::thread::sleep(std::time::Duration::from_millis(1));
        assert_eq!(h.counter(), frozen);
    }

    #[test]
    fn comparator_fires_and_status_clears() {
        let (mut h, lines) = hpet_with_lines();
        h.write_reg(0x010, 1);
        // Timer 0: level-triggered, enabled, comparator in the near future.
        h.write_reg(
            0x100,
            timer_cfg::INT_TYPE_LEVEL | timer_cfg::INT_ENABLE,
        );
        h.write_reg(0x108, h.counter() + 10);
        std::thread::sleep(std::time::Duration::from_millis(1));
        h.poll().unwrap();
        assert!(lines[0].level());
        // Write-one-to-clear drops the line.
        h.write_reg(0x020, 1);
        assert!(!lines[0].level());
        // One-shot: no refire.
        h.poll().unwrap();
        assert!(!lines[0].level());
    }

    #[test]
    fn byte_granular_mmio_reads() {
        let (mut h, _) = hpet_with_lines();
        let mut lo = [0u8; 4];
        h.mmio(HPET_BASE, &mut lo, false).unwrap();
        let mut hi = [0u8; 4];
        h.mmio(HPET_BASE + 4, &mut hi, false).unwrap();
        let caps = (u32::from_le_bytes(lo) as u64) | ((u32::from_le_bytes(hi) as u64) << 32);
        assert_eq!(caps, Hpet::capabilities());
    }
}
