//! virtio-net device backend
//!
//! RX/TX queue pair with the 12-byte `virtio_net_hdr_v1` framing. Frames
//! move through the out-of-core [`NetBackend`]; the static guest address
//! plan lives in the init program, not here.

use virtio_bindings::virtio_net::{VIRTIO_NET_F_MAC, VIRTIO_NET_F_STATUS};

use super::queue::DescChain;
use super::VirtioBackend;
use crate::memory::GuestRam;
use crate::net::NetBackend;
use crate::{Error, Result};

/// Virtio device type for a network card.
pub const VIRTIO_ID_NET: u32 = 1;

/// Header prepended to every frame (virtio_net_hdr_v1).
pub const NET_HDR_LEN: usize = 12;

const RX_QUEUE: u16 = 0;
const TX_QUEUE: u16 = 1;

/// Locally administered MAC for the guest NIC.
pub const GUEST_MAC: [u8; 6] = [0x52, 0x54, 0x00, 0xcc, 0x00, 0x02];

pub struct VirtioNet {
    mac: [u8; 6],
    backend: Box<dyn NetBackend>,
}

impl VirtioNet {
    pub fn new(backend: Box<dyn NetBackend>) -> Self {
        Self {
            mac: GUEST_MAC,
            backend,
        }
    }

    pub fn mac(&self) -> [u8; 6] {
        self.mac
    }
}

impl VirtioBackend for VirtioNet {
    fn device_id(&self) -> u32 {
        VIRTIO_ID_NET
    }

    fn device_features(&self) -> u64 {
        (1u64 << VIRTIO_NET_F_MAC) | (1u64 << VIRTIO_NET_F_STATUS)
    }

    fn config_space(&self) -> Vec<u8> {
        let mut cfg = Vec::with_capacity(12);
        cfg.extend_from_slice(&self.mac);
        cfg.extend_from_slice(&1u16.to_le_bytes()); // status: VIRTIO_NET_S_LINK_UP
        cfg.extend_from_slice(&1u16.to_le_bytes()); // max_virtqueue_pairs
        cfg.extend_from_slice(&1500u16.to_le_bytes()); // mtu
        cfg
    }

    fn num_queues(&self) -> usize {
        2
    }

    fn handle_queue(&mut self, queue: u16, chain: &mut DescChain, ram: &GuestRam) -> Result<u32> {
        match queue {
            TX_QUEUE => {
                let buf = chain.read_out(ram)?;
                if buf.len() < NET_HDR_LEN {
                    return Err(Error::Guest(format!(
                        "TX buffer of {} bytes is shorter than the net header",
                        buf.len()
                    )));
                }
                self.backend.transmit(&buf[NET_HDR_LEN..]);
                Ok(0)
            }
            RX_QUEUE => {
                let Some(frame) = self.backend.receive() else {
                    return Ok(0);
                };
                let mut buf = vec![0u8; NET_HDR_LEN + frame.len()];
                // num_buffers = 1 at offset 10.
                buf[10..12].copy_from_slice(&1u16.to_le_bytes());
                buf[NET_HDR_LEN..].copy_from_slice(&frame);
                chain.write_in(ram, &buf)
            }
            other => Err(Error::Guest(format!("virtio-net queue {other} out of range"))),
        }
    }

    fn wants_queue(&mut self, queue: u16) -> bool {
        queue == RX_QUEUE && self.backend.has_frames()
    }

    fn notify_driven(&self, queue: u16) -> bool {
        queue != RX_QUEUE
    }
}

#[cfg(test)]
mod tests {
    use super::super::queue::test_ring::TestRing;
    use super::*;
    use crate::net::LoopbackNet;

    fn tx_frame(net: &mut VirtioNet, ring: &mut TestRing, payload: &[u8]) {
        let mut buf = vec![0u8; NET_HDR_LEN];
        buf.extend_from_slice(payload);
        ring.ram.write_at(0x8000, &buf).unwrap();
        ring.post(&[(0x8000, buf.len() as u32, false)]);
        let mut chain = ring.q.pop(&ring.ram).unwrap().unwrap();
        net.handle_queue(TX_QUEUE, &mut chain, &ring.ram).unwrap();
    }

    #[test]
    fn tx_strips_header_rx_prepends_it() {
        let mut net = VirtioNet::new(Box::new(LoopbackNet::new()));
        let mut ring = TestRing::new(8);
        tx_frame(&mut net, &mut ring, b"ethernet-frame");

        assert!(net.wants_queue(RX_QUEUE));
        ring.post(&[(0xa000, 256, true)]);
        let mut chain = ring.q.pop(&ring.ram).unwrap().unwrap();
        let written = net.handle_queue(RX_QUEUE, &mut chain, &ring.ram).unwrap();
        assert_eq!(written as usize, NET_HDR_LEN + 14);
        let mut got = vec![0u8; written as usize];
        ring.ram.read_at(0xa000, &mut got).unwrap();
        assert_eq!(&got[NET_HDR_LEN..], b"ethernet-frame");
        assert_eq!(u16::from_le_bytes([got[10], got[11]]), 1);
        assert!(!net.wants_queue(RX_QUEUE));
    }

    #[test]
    fn short_tx_buffer_is_guest_error() {
        let mut net = VirtioNet::new(Box::new(LoopbackNet::new()));
        let mut ring = TestRing::new(8);
        ring.post(&[(0x8000, 4, false)]);
        let mut chain = ring.q.pop(&ring.ram).unwrap().unwrap();
        assert!(net.handle_queue(TX_QUEUE, &mut chain, &ring.ram).is_err());
    }

    #[test]
    fn config_space_layout() {
        let net = VirtioNet::new(Box::new(LoopbackNet::new()));
        let cfg = net.config_space();
        assert_eq!(&cfg[..6], &GUEST_MAC);
        assert_eq!(u16::from_le_bytes([cfg[6], cfg[7]]), 1, "link up");
        assert_eq!(u16::from_le_bytes([cfg[10], cfg[11]]), 1500, "mtu");
    }

    #[test]
    fn rx_queue_is_not_notify_driven() {
        let net = VirtioNet::new(Box::new(LoopbackNet::new()));
        assert!(!net.notify_driven(RX_QUEUE));
        assert!(net.notify_driven(TX_QUEUE));
    }
}
