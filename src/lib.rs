//! # Event-driven connection reactor for a multi-protocol messaging broker.
//!
//! Supported platforms: Linux, macOS, Windows (socket buffer options are applied on unix only).
//!
//! brokerio moves bytes between non-blocking sockets and wire protocols. A [`SelectorPool`] runs N selector loops,
//! each on its own thread; every connection is owned by exactly one loop for its lifetime.
//! - Reads: the loop wakes the connection on readiness, its [`ReadTask`] drains the socket into a [`Packet`] and the
//!   [`Protocol`] decodes every whole frame. A partial frame stays in the buffer until more bytes arrive.
//! - Writes: protocols push [`ServerPacket`] frames onto the [`ConnectionTask`]; the [`WriteTask`] packs as many as
//!   fit into one write and fires each frame's completion once its bytes have been handed to the socket.
//! - Session work completes on other threads. Continuations post a [`ProtocolEvent`] which the owning loop feeds
//!   back into the protocol, so protocol state is never shared.
//!
//! MQTT 3.1 / 3.1.1 runs over TCP and MQTT-SN 1.2 over UDP; both sit on the [`session::SessionManager`] boundary,
//! with [`session::memory::MemorySessionManager`] as an in-process implementation.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use brokerio::config::BrokerConfig;
//! use brokerio::protocol::mqtt::MqttProtocolFactory;
//! use brokerio::session::memory::MemorySessionManager;
//! use brokerio::{SelectorPool, TcpEndPointServer};
//!
//! fn main() -> brokerio::Result<()> {
//!     let config = BrokerConfig::default();
//!     let pool = SelectorPool::new(&config.selector)?;
//!     let sessions = Arc::new(MemorySessionManager::new());
//!     let factory = Arc::new(MqttProtocolFactory::new(config.mqtt.clone(), sessions));
//!     let server = TcpEndPointServer::start(&pool, "127.0.0.1:1883", factory, &config.tcp)?;
//!     println!("listening on {}", server.local_addr());
//!     std::thread::park();
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod flat_storage;
pub mod frame;
pub mod packet;
pub mod protocol;
pub mod read_task;
pub mod selector;
pub mod selector_pool;
pub mod server;
pub mod session;
pub mod utils;
pub mod write_task;

pub use connection::{ConnectionId, ConnectionTask, Interest};
pub use endpoint::{EndPoint, ReadStatus, TcpEndPoint, UdpEndPoint};
pub use error::{BrokerError, Result};
pub use frame::{RawFrame, ServerPacket};
pub use packet::{Packet, PacketError};
pub use protocol::{MalformedPacket, Protocol, ProtocolEvent, ProtocolFactory};
pub use read_task::{ReadTask, UdpReadTask};
pub use selector::{Attached, SelectorHandle};
pub use selector_pool::{SelectorAllocator, SelectorPool};
pub use server::{Acceptor, TcpEndPointServer, UdpEndPointServer};
pub use write_task::{UdpWriteTask, WriteTask};
