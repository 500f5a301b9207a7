//! virtio-console device backend
//!
//! Single-port console: the TX queue drains guest bytes into a host sink,
//! the RX queue is fed from a shared input queue (the stdin drain thread on
//! the host side).

use std::collections::VecDeque;
use std::io::Write;
use std::sync::{Arc, Mutex};

use super::queue::DescChain;
use super::VirtioBackend;
use crate::memory::GuestRam;
use crate::Result;

/// Virtio device type for a console.
pub const VIRTIO_ID_CONSOLE: u32 = 3;

const RX_QUEUE: u16 = 0;
const TX_QUEUE: u16 = 1;

pub struct VirtioConsole {
    out: Box<dyn Write + Send>,
    input: Arc<Mutex<VecDeque<u8>>>,
}

impl VirtioConsole {
    pub fn new(out: Box<dyn Write + Send>, input: Arc<Mutex<VecDeque<u8>>>) -> Self {
        Self { out, input }
    }
}

impl VirtioBackend for VirtioConsole {
    fn device_id(&self) -> u32 {
        VIRTIO_ID_CONSOLE
    }

    fn config_space(&self) -> Vec<u8> {
        let mut cfg = Vec::with_capacity(8);
        cfg.extend_from_slice(&80u16.to_le_bytes()); // cols
        cfg.extend_from_slice(&25u16.to_le_bytes()); // rows
        cfg.extend_from_slice(&1u32.to_le_bytes()); // max_nr_ports
        cfg
    }

    fn num_queues(&self) -> usize {
        2
    }

    fn handle_queue(&mut self, queue: u16, chain: &mut DescChain, ram: &GuestRam) -> Result<u32> {
        match queue {
            TX_QUEUE => {
                let data = chain.read_out(ram)?;
                self.out.write_all(&data)?;
                self.out.flush()?;
                Ok(0)
            }
            RX_QUEUE => {
                let mut input = self.input.lock().unwrap();
                if input.is_empty() {
                    return Ok(0);
                }
                let n = chain.in_len().min(input.len());
                let data: Vec<u8> = input.drain(..n).collect();
                drop(input);
                chain.write_in(ram, &data)
            }
            other => Err(crate::Error::Guest(format!(
                "virtio-console queue {other} out of range"
            ))),
        }
    }

    fn wants_queue(&mut self, queue: u16) -> bool {
        queue == RX_QUEUE && !self.input.lock().unwrap().is_empty()
    }

    fn notify_driven(&self, queue: u16) -> bool {
        queue != RX_QUEUE
    }
}
