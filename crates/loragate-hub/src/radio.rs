//! Radio abstraction
//!
//! The physical LoRa driver is out of scope; what the engine needs from
//! it is (a) a transmit entry point and (b) received frames with their
//! RSSI/SNR, delivered through a bounded ring the loop drains. Overflow
//! drops are counted and reported, never blocking the receive path.
//!
//! [`UdpRadio`] is the development stand-in for the SPI driver: raw
//! frames as UDP datagrams, transmitted to a fixed peer or to whoever
//! was heard last.

use anyhow::{bail, Context, Result};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use loragate_common::protocol::MAX_FRAME_LEN;

/// A frame delivered by the radio, with its link quality.
#[derive(Debug, Clone)]
pub struct ReceivedFrame {
    pub data: Vec<u8>,
    pub rssi: i16,
    pub snr: f32,
}

/// Transmit seam between the protocol engine and the radio driver.
pub trait Radio {
    fn transmit(&mut self, frame: &[u8]) -> Result<()>;
}

/// Bounded ring of received frames. The driver side pushes, the loop
/// drains; when full, the newest frame is dropped and counted.
pub struct FrameQueue {
    queue: VecDeque<ReceivedFrame>,
    capacity: usize,
    dropped: u64,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity),
            capacity,
            dropped: 0,
        }
    }

    /// Enqueue a frame; `false` when the ring was full and the frame was
    /// dropped.
    pub fn push(&mut self, frame: ReceivedFrame) -> bool {
        if self.queue.len() >= self.capacity {
            self.dropped += 1;
            warn!(dropped = self.dropped, "packet queue full, dropping frame");
            return false;
        }
        self.queue.push_back(frame);
        true
    }

    pub fn pop(&mut self) -> Option<ReceivedFrame> {
        self.queue.pop_front()
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }
}

/// UDP-datagram frame bridge standing in for the SPI radio driver.
pub struct UdpRadio {
    socket: Arc<UdpSocket>,
    peer: Option<SocketAddr>,
}

impl UdpRadio {
    pub fn new(socket: Arc<UdpSocket>, peer: Option<SocketAddr>) -> Self {
        Self { socket, peer }
    }

    /// Remember the last sender as the transmit peer when none is
    /// configured.
    pub fn note_peer(&mut self, addr: SocketAddr) {
        if self.peer != Some(addr) {
            debug!(%addr, "radio peer learned");
            self.peer = Some(addr);
        }
    }
}

impl Radio for UdpRadio {
    fn transmit(&mut self, frame: &[u8]) -> Result<()> {
        if frame.is_empty() || frame.len() > MAX_FRAME_LEN {
            bail!("invalid frame size: {}", frame.len());
        }
        let peer = match self.peer {
            Some(peer) => peer,
            None => bail!("no radio peer known yet"),
        };
        let sent = self
            .socket
            .try_send_to(frame, peer)
            .context("radio transmit failed")?;
        if sent != frame.len() {
            bail!("short radio transmit: {} of {} bytes", sent, frame.len());
        }
        Ok(())
    }
}
