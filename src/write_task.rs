use log::{debug, trace, warn};

use crate::config::{TcpConfig, UdpConfig};
use crate::connection::ConnectionTask;
use crate::endpoint::EndPoint;
use crate::error::{BrokerError, Result};
use crate::frame::ServerPacket;
use crate::packet::{Packet, PacketError};

//====================================================================================
//            WriteTask
//====================================================================================

/// `WriteTask` moves frames from the connection's outbound queue to a stream endpoint.
///
/// When its buffer is empty it packs queued frames into it, up to `coalesce_size` per cycle. A frame that
/// overflows the buffer goes back to the head of the queue and `coalesce_size` shrinks to the number already
/// packed. The buffer is then written; only when it has been written completely are the packed frames
/// completed, in queue order, and write interest dropped if nothing else is queued.
pub struct WriteTask {
    packet: Packet,
    packed: Vec<Box<dyn ServerPacket>>,
    coalesce_size: usize,
    flushing: bool,
}

impl WriteTask {
    pub fn new(buffer_size: usize, coalesce_size: usize) -> Self {
        Self {
            packet: Packet::new(buffer_size),
            packed: Vec::new(),
            coalesce_size: coalesce_size.max(1),
            flushing: false,
        }
    }

    pub fn from_config(config: &TcpConfig) -> Self {
        Self::new(config.server_write_buffer_size, config.coalesce_size)
    }

    pub fn coalesce_size(&self) -> usize {
        self.coalesce_size
    }

    /// Bytes packed but not yet written.
    pub fn pending_bytes(&self) -> usize {
        if self.flushing {
            self.packet.remaining()
        } else {
            0
        }
    }

    /// Called on write readiness.
    /// * return Err when the endpoint fails or a single frame cannot fit the buffer; the caller closes.
    pub fn process_selection(
        &mut self,
        endpoint: &mut dyn EndPoint,
        task: &ConnectionTask,
    ) -> Result<()> {
        if !self.flushing {
            self.pack(task)?;
        }
        if self.packet.has_remaining() {
            let written = endpoint.send_packet(&mut self.packet)?;
            trace!(
                "{} wrote {} bytes, {} left",
                endpoint.name(),
                written,
                self.packet.remaining()
            );
        }
        if !self.packet.has_remaining() {
            self.flushing = false;
            self.packet.clear();
            for frame in self.packed.drain(..) {
                frame.complete();
            }
            task.cancel_write_if_idle();
        }
        Ok(())
    }

    fn pack(&mut self, task: &ConnectionTask) -> Result<()> {
        self.packet.clear();
        let mut count = 0;
        while count < self.coalesce_size {
            let frame = match task.pop_frame() {
                Some(frame) => frame,
                None => break,
            };
            let start = self.packet.position();
            match frame.pack_frame(&mut self.packet) {
                Ok(_) => {
                    self.packed.push(frame);
                    count += 1;
                }
                Err(PacketError::Overflow) => {
                    self.packet.set_position(start);
                    if count == 0 {
                        return Err(BrokerError::FrameTooLarge(self.packet.capacity()));
                    }
                    task.requeue_front(frame);
                    debug!(
                        "{} write buffer full, coalescing {} frames per write",
                        task.name(),
                        count
                    );
                    self.coalesce_size = count;
                    break;
                }
                Err(err) => return Err(err.into()),
            }
        }
        self.packet.flip();
        self.flushing = true;
        Ok(())
    }
}

//====================================================================================
//            UdpWriteTask
//====================================================================================

/// `UdpWriteTask` sends one frame per datagram to the frame's from-address. Send failures are logged and the
/// frame dropped; the endpoint itself is never closed because of one peer.
pub struct UdpWriteTask {
    packet: Packet,
    max_datagrams: usize,
}

impl UdpWriteTask {
    pub fn new(buffer_size: usize, max_datagrams: usize) -> Self {
        Self {
            packet: Packet::new(buffer_size),
            max_datagrams: max_datagrams.max(1),
        }
    }

    pub fn from_config(config: &UdpConfig) -> Self {
        Self::new(config.buffer_size, config.max_datagrams_per_cycle)
    }

    pub fn process_selection(&mut self, endpoint: &mut dyn EndPoint, task: &ConnectionTask) {
        for _ in 0..self.max_datagrams {
            let frame = match task.pop_frame() {
                Some(frame) => frame,
                None => break,
            };
            let to = match frame.from_address() {
                Some(to) => to,
                None => {
                    warn!("{} dropping datagram without destination", endpoint.name());
                    continue;
                }
            };
            self.packet.clear();
            self.packet.set_from_address(Some(to));
            if let Err(err) = frame.pack_frame(&mut self.packet) {
                warn!("{} dropping datagram to {}: {}", endpoint.name(), to, err);
                continue;
            }
            self.packet.flip();
            match endpoint.send_packet(&mut self.packet) {
                Ok(0) if self.packet.has_remaining() => {
                    task.requeue_front(frame);
                    return;
                }
                Ok(_) => frame.complete(),
                Err(err) => warn!("{} send to {} failed: {}", endpoint.name(), to, err),
            }
        }
        task.cancel_write_if_idle();
    }
}
