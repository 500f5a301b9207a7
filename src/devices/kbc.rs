//! i8042 keyboard controller and reset ports
//!
//! Just enough of the controller to satisfy the kernel's probe path and to
//! catch the two ways a guest asks for a reset: the i8042 pulse-output
//! command (0xFE) and the fast reset port 0xCF9.

use std::sync::Arc;

use tracing::debug;

use super::{Device, PortRange, SystemSignals};
use crate::Result;

/// Status register bits
mod status {
    /// Output buffer full (data for the CPU to read).
    pub const OBF: u8 = 1 << 0;
    /// System flag, set after self-test.
    pub const SYSTEM: u8 = 1 << 2;
    /// Last write was a command (port 0x64).
    pub const CMD: u8 = 1 << 3;
}

pub struct I8042 {
    signals: Arc<SystemSignals>,
    /// Byte waiting in the output buffer, if any.
    output: Option<u8>,
    /// Command awaiting its data byte on port 0x60.
    pending_cmd: Option<u8>,
    command_byte: u8,
    last_was_cmd: bool,
}

impl I8042 {
    pub fn new(signals: Arc<SystemSignals>) -> Self {
        Self {
            signals,
            output: None,
            pending_cmd: None,
            command_byte: 0x01, // keyboard interrupt enabled
            last_was_cmd: false,
        }
    }

    fn status(&self) -> u8 {
        let mut v = status::SYSTEM;
        if self.output.is_some() {
            v |= status::OBF;
        }
        if self.last_was_cmd {
            v |= status::CMD;
        }
        v
    }

    fn command(&mut self, cmd: u8) {
        self.last_was_cmd = true;
        match cmd {
            0x20 => self.output = Some(self.command_byte),
            0x60 => self.pending_cmd = Some(cmd),
            0xa7 | 0xa8 => {} // aux disable/enable
            0xaa => self.output = Some(0x55), // self-test pass
            0xab => self.output = Some(0x00), // interface test pass
            0xad | 0xae => {} // keyboard disable/enable
            0xd1 => self.pending_cmd = Some(cmd),
            0xfe => {
                debug!("i8042 reset pulse");
                self.signals.request_reboot();
            }
            _ => debug!(cmd = format_args!("{cmd:#x}"), "ignored i8042 command"),
        }
    }

    fn data_write(&mut self, value: u8) {
        self.last_was_cmd = false;
        match self.pending_cmd.take() {
            Some(0x60) => self.command_byte = value,
            Some(0xd1) => {
                // Output port write: bit 0 low pulses system reset.
                if value & 0x01 == 0 {
                    self.signals.request_reboot();
                }
            }
            _ => {
                // Keyboard command; everything acks.
                self.output = Some(0xfa);
            }
        }
    }
}

impl Device for I8042 {
    fn name(&self) -> &'static str {
        "i8042"
    }

    fn port_ranges(&self) -> Vec<PortRange> {
        vec![PortRange::new(0x60, 1), PortRange::new(0x64, 1)]
    }

    fn port_io(&mut self, port: u16, data: &mut [u8], is_write: bool) -> Result<()> {
        match (port, is_write) {
            (0x64, false) => data[0] = self.status(),
            (0x64, true) => self.command(data[0]),
            (0x60, false) => data[0] = self.output.take().unwrap_or(0),
            (0x60, true) => self.data_write(data[0]),
            _ => {}
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.output = None;
        self.pending_cmd = None;
        self.command_byte = 0x01;
        self.last_was_cmd = false;
    }
}

/// Reset control register at 0xCF9. A write with bit 2 set (0x06 being the
/// usual value) requests a full reset.
pub struct ResetPort {
    signals: Arc<SystemSignals>,
}

impl ResetPort {
    pub fn new(signals: Arc<SystemSignals>) -> Self {
        Self { signals }
    }
}

impl Device for ResetPort {
    fn name(&self) -> &'static str {
        "reset-port"
    }

    fn port_ranges(&self) -> Vec<PortRange> {
        vec![PortRange::new(0xcf9, 1)]
    }

    fn port_io(&mut self, _port: u16, data: &mut [u8], is_write: bool) -> Result<()> {
        if is_write {
            if data[0] & 0x04 != 0 {
                debug!("reset requested via port 0xcf9");
                self.signals.request_reboot();
            }
        } else {
            data[0] = 0;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_test_responds() {
        let mut kbc = I8042::new(SystemSignals::new());
        kbc.port_io(0x64, &mut [0xaa], true).unwrap();
        let mut st = [0u8];
        kbc.port_io(0x64, &mut st, false).unwrap();
        assert_ne!(st[0] & status::OBF, 0);
        let mut data = [0u8];
        kbc.port_io(0x60, &mut data, false).unwrap();
        assert_eq!(data[0], 0x55);
        kbc.port_io(0x64, &mut st, false).unwrap();
        assert_eq!(st[0] & status::OBF, 0);
    }

    #[test]
    fn pulse_command_requests_reboot() {
        let signals = SystemSignals::new();
        let mut kbc = I8042::new(signals.clone());
        kbc.port_io(0x64, &mut [0xfe], true).unwrap();
        assert!(signals.reboot_requested());
    }

    #[test]
    fn output_port_bit0_low_requests_reboot() {
        let signals = SystemSignals::new();
        let mut kbc = I8042::new(signals.clone());
        kbc.port_io(0x64, &mut [0xd1], true).unwrap();
        kbc.port_io(0x60, &mut [0x12], true).unwrap();
        assert!(signals.reboot_requested());
    }

    #[test]
    fn cf9_requests_reboot() {
        let signals = SystemSignals::new();
        let mut rp = ResetPort::new(signals.clone());
        rp.port_io(0xcf9, &mut [0x06], true).unwrap();
        assert!(signals.reboot_requested());
    }
}
