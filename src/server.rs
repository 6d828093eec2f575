//! Listening endpoints. A `TcpEndPointServer` accepts on one selector loop and spreads the accepted
//! connections over the pool; a `UdpEndPointServer` registers one datagram endpoint that serves every peer.
use crossbeam_channel::RecvTimeoutError;
use log::{debug, error, info, warn};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{TcpConfig, UdpConfig};
use crate::connection::{ConnectionId, ConnectionTask};
use crate::endpoint::{TcpEndPoint, UdpEndPoint};
use crate::error::{BrokerError, Result};
use crate::protocol::ProtocolFactory;
use crate::read_task::{ReadTask, UdpReadTask};
use crate::selector::{Attached, SelectorHandle};
use crate::selector_pool::{SelectorAllocator, SelectorPool};
use crate::utils;
use crate::write_task::{UdpWriteTask, WriteTask};

/// Bound of the start-up wait for a server's registration.
const ATTACH_WAIT: Duration = Duration::from_secs(5);

/// Receives streams accepted by a listener registered with `SelectorHandle::attach_listener`.
/// Runs on the listener's loop thread, so it must not block.
pub trait Acceptor: Send {
    fn on_accept(&mut self, stream: TcpStream, addr: SocketAddr);

    /// Called once when the listener is removed from its loop.
    fn on_close(&mut self) {}
}

/// Hands each accepted stream to the next loop of the pool with a fresh protocol instance.
struct ConnectionAcceptor {
    allocator: SelectorAllocator,
    factory: Arc<dyn ProtocolFactory>,
    config: TcpConfig,
    accepted: usize,
}

impl ConnectionAcceptor {
    fn configure(&self, stream: &TcpStream) -> std::io::Result<()> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        utils::set_socket_buffer_sizes(
            stream,
            self.config.receive_buffer_size,
            self.config.send_buffer_size,
        )
    }
}

impl Acceptor for ConnectionAcceptor {
    fn on_accept(&mut self, stream: TcpStream, addr: SocketAddr) {
        if let Err(err) = self.configure(&stream) {
            warn!("dropping {} connection from {}: {}", self.factory.name(), addr, err);
            return;
        }
        self.accepted += 1;
        let protocol = self.factory.name();
        let handle = self.allocator.allocate();
        let res = handle.attach_stream(
            TcpEndPoint::new(stream),
            self.factory.create(),
            ReadTask::from_config(&self.config),
            WriteTask::from_config(&self.config),
            move |attached| match attached {
                Attached::Connection(task) => {
                    debug!("{} connection {} from {}", protocol, task.id(), addr)
                }
                Attached::Listener(_) => {}
                Attached::Error(err) => warn!("{} connection from {} failed: {}", protocol, addr, err),
            },
        );
        if let Err(err) = res {
            warn!(
                "selector-{} refused {} connection from {}: {}",
                handle.index(),
                protocol,
                addr,
                err
            );
        }
    }

    fn on_close(&mut self) {
        info!(
            "{} acceptor closed after {} connections",
            self.factory.name(),
            self.accepted
        );
    }
}

fn wait_attached(rx: crossbeam_channel::Receiver<Attached>, what: &str) -> Result<Attached> {
    match rx.recv_timeout(ATTACH_WAIT) {
        Ok(Attached::Error(err)) => {
            error!("{} failed to start: {}", what, err);
            Err(BrokerError::Io(std::io::Error::new(std::io::ErrorKind::Other, err)))
        }
        Ok(attached) => Ok(attached),
        Err(RecvTimeoutError::Timeout) => Err(BrokerError::RegistrationTimeout(what.to_owned())),
        Err(RecvTimeoutError::Disconnected) => Err(BrokerError::SelectorStopped),
    }
}

//====================================================================================
//            TcpEndPointServer
//====================================================================================

pub struct TcpEndPointServer {
    local: SocketAddr,
    id: ConnectionId,
    handle: SelectorHandle,
    protocol: &'static str,
}

impl TcpEndPointServer {
    /// Bind `addr` and start accepting on one loop of `pool`.
    /// The kernel default backlog applies; `config.backlog` is only reported.
    /// * return after the listener is registered.
    pub fn start(
        pool: &SelectorPool,
        addr: impl ToSocketAddrs,
        factory: Arc<dyn ProtocolFactory>,
        config: &TcpConfig,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local = listener.local_addr()?;
        let protocol = factory.name();
        let acceptor = ConnectionAcceptor {
            allocator: pool.allocator(),
            factory,
            config: config.clone(),
            accepted: 0,
        };

        let handle = pool.allocate();
        let (tx, rx) = crossbeam_channel::bounded(1);
        handle.attach_listener(listener, Box::new(acceptor), move |attached| {
            let _ = tx.send(attached);
        })?;
        let what = format!("{} server on {}", protocol, local);
        match wait_attached(rx, &what)? {
            Attached::Listener(id) => {
                info!("{} started (backlog {})", what, config.backlog);
                Ok(Self {
                    local,
                    id,
                    handle,
                    protocol,
                })
            }
            _ => Err(BrokerError::Closed),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }
    pub fn protocol(&self) -> &'static str {
        self.protocol
    }

    /// Stop accepting. Connections already accepted stay open.
    pub fn close(&self) -> Result<()> {
        info!("closing {} server on {}", self.protocol, self.local);
        self.handle.close_registrant(self.id)
    }
}

//====================================================================================
//            UdpEndPointServer
//====================================================================================

pub struct UdpEndPointServer {
    local: SocketAddr,
    task: Arc<ConnectionTask>,
    protocol: &'static str,
}

impl UdpEndPointServer {
    /// Bind `addr` and register the socket with one loop of `pool`. A single protocol instance serves every peer.
    pub fn start(
        pool: &SelectorPool,
        addr: impl ToSocketAddrs,
        factory: Arc<dyn ProtocolFactory>,
        config: &UdpConfig,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        let local = socket.local_addr()?;
        let protocol = factory.name();

        let (tx, rx) = crossbeam_channel::bounded(1);
        pool.allocate().attach_datagram(
            UdpEndPoint::new(socket),
            factory.create(),
            UdpReadTask::from_config(config),
            UdpWriteTask::from_config(config),
            move |attached| {
                let _ = tx.send(attached);
            },
        )?;
        let what = format!("{} server on udp://{}", protocol, local);
        match wait_attached(rx, &what)? {
            Attached::Connection(task) => {
                info!("{} started", what);
                Ok(Self {
                    local,
                    task,
                    protocol,
                })
            }
            _ => Err(BrokerError::Closed),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }
    pub fn protocol(&self) -> &'static str {
        self.protocol
    }
    pub fn task(&self) -> &Arc<ConnectionTask> {
        &self.task
    }

    pub fn close(&self) {
        info!("closing {} server on udp://{}", self.protocol, self.local);
        self.task.close();
    }
}
