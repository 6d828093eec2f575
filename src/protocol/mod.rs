//! The contract between the reactor and a wire protocol.
//!
//! A protocol decodes frames out of the read pipeline's packet, dispatches them through its opcode table and
//! pushes replies onto the connection. Session work completes through callbacks on other threads; those callbacks
//! never touch protocol state directly, they post a [`ProtocolEvent`] which the owning selector loop hands back to
//! [`Protocol::on_event`].
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use thiserror::Error;

use crate::connection::ConnectionTask;
use crate::packet::Packet;
use crate::session::{Delivery, MessageListener, Session, SessionError};

pub mod mqtt;
pub mod mqtt_sn;

/// A frame that cannot be parsed or violates the protocol state machine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("malformed packet: {0}")]
pub struct MalformedPacket(pub String);

impl MalformedPacket {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

pub trait Protocol: Send {
    fn name(&self) -> &'static str;

    /// Decode and handle every whole frame between the packet's position and limit.
    /// The position is left at the first byte not consumed.
    /// * return `Ok(true)` when everything was consumed, `Ok(false)` when a partial frame remains.
    /// * return `Err` for a malformed frame; stream transports close the connection.
    fn process_packet(
        &mut self,
        packet: &mut Packet,
        task: &Arc<ConnectionTask>,
    ) -> Result<bool, MalformedPacket>;

    /// Called on the owning loop for events posted through `ConnectionTask::post`.
    fn on_event(&mut self, _event: ProtocolEvent, _task: &Arc<ConnectionTask>) {}

    /// Called once when the connection is removed from its loop.
    fn on_close(&mut self, _task: &Arc<ConnectionTask>) {}
}

/// Creates one protocol instance per accepted connection.
pub trait ProtocolFactory: Send + Sync {
    fn name(&self) -> &'static str;
    fn create(&self) -> Box<dyn Protocol>;
}

/// Results of asynchronous work, delivered back into the connection's loop.
/// `peer` identifies the client on datagram transports, where one protocol instance serves many peers.
pub enum ProtocolEvent {
    SessionCreated {
        peer: Option<SocketAddr>,
        result: Result<Arc<dyn Session>, SessionError>,
    },
    Deliver {
        peer: Option<SocketAddr>,
        delivery: Delivery,
    },
    KeepAliveCheck {
        peer: Option<SocketAddr>,
    },
}

impl std::fmt::Debug for ProtocolEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolEvent::SessionCreated { peer, result } => f
                .debug_struct("SessionCreated")
                .field("peer", peer)
                .field("ok", &result.is_ok())
                .finish(),
            ProtocolEvent::Deliver { peer, delivery } => f
                .debug_struct("Deliver")
                .field("peer", peer)
                .field("destination", &delivery.destination)
                .finish(),
            ProtocolEvent::KeepAliveCheck { peer } => {
                f.debug_struct("KeepAliveCheck").field("peer", peer).finish()
            }
        }
    }
}

/// Routes session deliveries into a connection as `ProtocolEvent::Deliver`.
/// Holds the connection weakly so a session outliving its connection does not keep it alive.
pub struct ConnectionSink {
    task: Weak<ConnectionTask>,
    peer: Option<SocketAddr>,
}

impl ConnectionSink {
    pub fn new(task: &Arc<ConnectionTask>, peer: Option<SocketAddr>) -> Arc<Self> {
        Arc::new(Self {
            task: Arc::downgrade(task),
            peer,
        })
    }
}

impl MessageListener for ConnectionSink {
    fn deliver(&self, delivery: Delivery) -> bool {
        match self.task.upgrade() {
            Some(task) if !task.is_closed() => {
                task.post(ProtocolEvent::Deliver {
                    peer: self.peer,
                    delivery,
                });
                true
            }
            _ => false,
        }
    }
}
