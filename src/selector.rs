use crossbeam_channel::{Receiver, Sender, TryRecvError};
use log::{debug, error, info, trace, warn};
use polling::{Event, Events, PollMode, Poller};
use std::any::Any;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fmt::Display;
use std::io::ErrorKind;
use std::net::TcpListener;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use crate::config::SelectorConfig;
use crate::connection::{ConnectionId, ConnectionTask, HalfUsize, Interest};
use crate::endpoint::{EndPoint, TcpEndPoint, UdpEndPoint};
use crate::error::{BrokerError, Result};
use crate::flat_storage::FlatStorage;
use crate::protocol::{Protocol, ProtocolEvent};
use crate::read_task::{ReadOutcome, ReadTask, UdpReadTask};
use crate::server::Acceptor;
use crate::write_task::{UdpWriteTask, WriteTask};

//====================================================================================
//            SelectorHandle
//====================================================================================

/// Result passed to an attach completion callback.
pub enum Attached {
    /// A stream or datagram endpoint is registered and reading.
    Connection(Arc<ConnectionTask>),
    /// A listening socket is registered and accepting.
    Listener(ConnectionId),
    /// Registration failed; the socket has been dropped.
    Error(String),
}

pub type AttachCompletion = Box<dyn FnOnce(Attached) + Send>;

/// `SelectorHandle` is the thread-safe way to talk to one selector loop. Every change to the loop's poller
/// is funneled through its request queue and applied on the loop thread after the current ready set is processed.
#[derive(Clone)]
pub struct SelectorHandle {
    shared: Arc<SelectorShared>,
}

struct SelectorShared {
    index: usize,
    poller: Option<Arc<Poller>>,
    requests: Sender<SelectorRequest>,
    loop_thread: OnceLock<ThreadId>,
    running: AtomicBool,
    registrants: AtomicUsize,
    registration_timeout: Duration,
}

impl SelectorHandle {
    pub fn index(&self) -> usize {
        self.shared.index
    }
    /// false once the loop exited, either by `SelectorPool::close` or a fatal poller error.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }
    /// Listeners and connections currently registered with the loop.
    pub fn count_registrants(&self) -> usize {
        self.shared.registrants.load(Ordering::Relaxed)
    }
    pub fn registration_timeout(&self) -> Duration {
        self.shared.registration_timeout
    }

    /// Register a connected, non-blocking TCP endpoint. It starts with read interest.
    pub fn attach_stream(
        &self,
        endpoint: TcpEndPoint,
        protocol: Box<dyn Protocol>,
        reader: ReadTask,
        writer: WriteTask,
        completion: impl FnOnce(Attached) + Send + 'static,
    ) -> Result<()> {
        self.submit(SelectorRequest::Attach {
            source: AttachSource::Stream {
                endpoint,
                protocol,
                reader,
                writer,
            },
            completion: Some(Box::new(completion)),
        })
    }

    /// Register a bound, non-blocking UDP endpoint. One protocol instance serves every peer of the socket.
    pub fn attach_datagram(
        &self,
        endpoint: UdpEndPoint,
        protocol: Box<dyn Protocol>,
        reader: UdpReadTask,
        writer: UdpWriteTask,
        completion: impl FnOnce(Attached) + Send + 'static,
    ) -> Result<()> {
        self.submit(SelectorRequest::Attach {
            source: AttachSource::Datagram {
                endpoint,
                protocol,
                reader,
                writer,
            },
            completion: Some(Box::new(completion)),
        })
    }

    /// Register a non-blocking listening socket; accepted streams are handed to `acceptor`.
    pub fn attach_listener(
        &self,
        listener: TcpListener,
        acceptor: Box<dyn Acceptor>,
        completion: impl FnOnce(Attached) + Send + 'static,
    ) -> Result<()> {
        self.submit(SelectorRequest::Attach {
            source: AttachSource::Listener { listener, acceptor },
            completion: Some(Box::new(completion)),
        })
    }

    /// Remove a listener or connection from the loop.
    pub fn close_registrant(&self, id: ConnectionId) -> Result<()> {
        self.submit(SelectorRequest::Close { id, ack: None })
    }

    /// Interrupt the loop's poller wait.
    pub(crate) fn wake(&self) {
        if let Some(poller) = &self.shared.poller {
            if let Err(err) = poller.notify() {
                warn!("selector-{} notify failed: {}", self.index(), err);
            }
        }
    }

    pub(crate) fn submit(&self, request: SelectorRequest) -> Result<()> {
        self.shared
            .requests
            .send(request)
            .map_err(|_| BrokerError::SelectorStopped)?;
        if let Some(poller) = &self.shared.poller {
            poller.notify()?;
        }
        Ok(())
    }

    /// true when called off the loop thread of a running loop; such callers wait for acknowledgements.
    pub(crate) fn must_wait(&self) -> bool {
        match self.shared.loop_thread.get() {
            Some(thread) => *thread != std::thread::current().id() && self.is_running(),
            None => false,
        }
    }

    /// A handle whose loop never runs. Requests accumulate in the returned receiver.
    #[cfg(test)]
    pub(crate) fn detached(registration_timeout: Duration) -> (SelectorHandle, Receiver<SelectorRequest>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let handle = SelectorHandle {
            shared: Arc::new(SelectorShared {
                index: usize::MAX,
                poller: None,
                requests: tx,
                loop_thread: OnceLock::new(),
                running: AtomicBool::new(false),
                registrants: AtomicUsize::new(0),
                registration_timeout,
            }),
        };
        (handle, rx)
    }
}

impl std::fmt::Debug for SelectorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SelectorHandle({})", self.shared.index)
    }
}

//====================================================================================
//            Requests
//====================================================================================

pub(crate) enum SelectorRequest {
    Attach {
        source: AttachSource,
        completion: Option<AttachCompletion>,
    },
    /// Apply the connection's current interest mask to the poller.
    Reconcile {
        id: ConnectionId,
        ack: Option<Sender<()>>,
    },
    Close {
        id: ConnectionId,
        ack: Option<Sender<()>>,
    },
    CloseAfter {
        id: ConnectionId,
        delay: Duration,
    },
    Event {
        id: ConnectionId,
        event: ProtocolEvent,
        delay: Option<Duration>,
    },
}

pub(crate) enum AttachSource {
    Stream {
        endpoint: TcpEndPoint,
        protocol: Box<dyn Protocol>,
        reader: ReadTask,
        writer: WriteTask,
    },
    Datagram {
        endpoint: UdpEndPoint,
        protocol: Box<dyn Protocol>,
        reader: UdpReadTask,
        writer: UdpWriteTask,
    },
    Listener {
        listener: TcpListener,
        acceptor: Box<dyn Acceptor>,
    },
}

//====================================================================================
//            Deferred tasks
//====================================================================================

enum DeferredTask {
    /// Re-register read interest after a fragmentation back-off.
    Rearm(ConnectionId),
    Close(ConnectionId),
    Event(ConnectionId, ProtocolEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DeferredRef {
    slot: usize,
    seq: u64,
}

/// Min-heap of due times over a slab of tasks. Cancelling removes the task from the slab;
/// the stale heap entry is skipped when it surfaces.
struct DeferredQueue {
    heap: BinaryHeap<Reverse<(Instant, u64, usize)>>,
    tasks: FlatStorage<(u64, DeferredTask)>,
    next_seq: u64,
}

impl DeferredQueue {
    fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            tasks: FlatStorage::new(),
            next_seq: 0,
        }
    }

    fn schedule(&mut self, due: Instant, task: DeferredTask) -> DeferredRef {
        self.next_seq += 1;
        let seq = self.next_seq;
        let slot = self.tasks.add((seq, task));
        self.heap.push(Reverse((due, seq, slot)));
        DeferredRef { slot, seq }
    }

    fn cancel(&mut self, r: DeferredRef) -> bool {
        match self.tasks.get(r.slot) {
            Some((seq, _)) if *seq == r.seq => self.tasks.remove(r.slot).is_some(),
            _ => false,
        }
    }

    fn is_live(&self, seq: u64, slot: usize) -> bool {
        matches!(self.tasks.get(slot), Some((s, _)) if *s == seq)
    }

    fn is_pending(&self, r: DeferredRef) -> bool {
        self.is_live(r.seq, r.slot)
    }

    fn next_due(&mut self) -> Option<Instant> {
        while let Some(Reverse((due, seq, slot))) = self.heap.peek().copied() {
            if self.is_live(seq, slot) {
                return Some(due);
            }
            self.heap.pop();
        }
        None
    }

    fn pop_due(&mut self, now: Instant) -> Option<DeferredTask> {
        while let Some(due) = self.next_due() {
            if due > now {
                return None;
            }
            if let Some(Reverse((_, _, slot))) = self.heap.pop() {
                if let Some((_, task)) = self.tasks.remove(slot) {
                    return Some(task);
                }
            }
        }
        None
    }

    fn len(&self) -> usize {
        self.tasks.len()
    }
}

//====================================================================================
//            Registrants
//====================================================================================

enum Registrant {
    Listener {
        id: ConnectionId,
        listener: TcpListener,
        acceptor: Box<dyn Acceptor>,
    },
    Connection(Connection),
}

impl Registrant {
    fn id(&self) -> ConnectionId {
        match self {
            Registrant::Listener { id, .. } => *id,
            Registrant::Connection(conn) => conn.task.id(),
        }
    }
}

struct Connection {
    task: Arc<ConnectionTask>,
    protocol: Box<dyn Protocol>,
    transport: Transport,
    applied: Interest,
    pending_rearm: Option<DeferredRef>,
    /// Delayed closes and events aimed at this connection.
    scheduled: Vec<DeferredRef>,
}

enum Transport {
    Stream {
        endpoint: TcpEndPoint,
        reader: ReadTask,
        writer: WriteTask,
    },
    Datagram {
        endpoint: UdpEndPoint,
        reader: UdpReadTask,
        writer: UdpWriteTask,
    },
}

impl Transport {
    fn modify(&self, poller: &Poller, key: usize, interest: Interest) -> std::io::Result<()> {
        let event = Event::new(key, interest.read, interest.write);
        match self {
            Transport::Stream { endpoint, .. } => {
                poller.modify_with_mode(endpoint.socket(), event, PollMode::Level)
            }
            Transport::Datagram { endpoint, .. } => {
                poller.modify_with_mode(endpoint.socket(), event, PollMode::Level)
            }
        }
    }

    fn delete(&self, poller: &Poller) -> std::io::Result<()> {
        match self {
            Transport::Stream { endpoint, .. } => poller.delete(endpoint.socket()),
            Transport::Datagram { endpoint, .. } => poller.delete(endpoint.socket()),
        }
    }
}

impl Connection {
    fn on_readable(&mut self, now: Instant) -> ReadOutcome {
        let Connection {
            task,
            protocol,
            transport,
            ..
        } = self;
        match transport {
            Transport::Stream {
                endpoint, reader, ..
            } => reader.read(endpoint, protocol.as_mut(), task),
            Transport::Datagram {
                endpoint, reader, ..
            } => reader.read_available(endpoint, protocol.as_mut(), task, now),
        }
    }

    fn on_writable(&mut self) -> Result<()> {
        let Connection {
            task, transport, ..
        } = self;
        match transport {
            Transport::Stream {
                endpoint, writer, ..
            } => writer.process_selection(endpoint, task),
            Transport::Datagram {
                endpoint, writer, ..
            } => {
                writer.process_selection(endpoint, task);
                Ok(())
            }
        }
    }

    fn endpoint_name(&self) -> &str {
        match &self.transport {
            Transport::Stream { endpoint, .. } => endpoint.name(),
            Transport::Datagram { endpoint, .. } => endpoint.name(),
        }
    }
}

//====================================================================================
//            SelectorLoop
//====================================================================================

/// `SelectorLoop` owns one poller, the registrants attached to it, a deferred task queue and the receiving end
/// of its request queue. `run` is called on a dedicated thread; each cycle:
/// 1. waits for readiness (bounded by the poll interval and the next deferred due time),
/// 2. dispatches every ready key; a failing registrant is closed without affecting the others,
/// 3. runs due deferred tasks,
/// 4. drains a bounded number of queued requests.
pub(crate) struct SelectorLoop {
    events: Events, // kept apart from core so dispatch can borrow core mutably while iterating.
    core: LoopCore,
}

struct LoopCore {
    handle: SelectorHandle,
    poller: Arc<Poller>,
    requests: Receiver<SelectorRequest>,
    registrants: FlatStorage<Registrant>,
    deferred: DeferredQueue,
    next_version: HalfUsize,
    config: SelectorConfig,
}

impl SelectorLoop {
    pub(crate) fn new(index: usize, config: &SelectorConfig) -> Result<(Self, SelectorHandle)> {
        let poller = Arc::new(Poller::new()?);
        let (tx, rx) = crossbeam_channel::unbounded();
        let handle = SelectorHandle {
            shared: Arc::new(SelectorShared {
                index,
                poller: Some(Arc::clone(&poller)),
                requests: tx,
                loop_thread: OnceLock::new(),
                running: AtomicBool::new(true),
                registrants: AtomicUsize::new(0),
                registration_timeout: config.registration_timeout(),
            }),
        };
        let me = Self {
            events: Events::new(),
            core: LoopCore {
                handle: handle.clone(),
                poller,
                requests: rx,
                registrants: FlatStorage::new(),
                deferred: DeferredQueue::new(),
                next_version: 0,
                config: config.clone(),
            },
        };
        Ok((me, handle))
    }

    /// Run until `stop` is set or the poller fails, then close every registrant.
    pub(crate) fn run(mut self, stop: Arc<AtomicBool>) {
        let index = self.core.handle.index();
        let _running = RunningFlag(Arc::clone(&self.core.handle.shared));
        let _ = self
            .core
            .handle
            .shared
            .loop_thread
            .set(std::thread::current().id());
        info!("selector-{} started", index);
        while !stop.load(Ordering::Acquire) {
            if let Err(err) = self.run_once() {
                error!("selector-{} poller failed, stopping loop: {}", index, err);
                break;
            }
        }
        self.core.shutdown();
        info!("selector-{} exited", index);
    }

    /// return number of readiness events processed.
    fn run_once(&mut self) -> Result<usize> {
        let timeout = self.core.next_timeout(Instant::now());
        self.events.clear();
        if let Err(err) = self.core.poller.wait(&mut self.events, Some(timeout)) {
            if err.kind() != ErrorKind::Interrupted {
                return Err(err.into());
            }
        }
        let mut count = 0;
        for ev in self.events.iter() {
            count += 1;
            self.core.dispatch(
                ev.key,
                ev.readable,
                ev.writable,
                ev.is_err().unwrap_or(false),
            );
        }
        self.core.run_deferred(Instant::now());
        self.core.drain_requests();
        Ok(count)
    }
}

/// Clears `SelectorHandle::is_running` however the loop thread exits.
struct RunningFlag(Arc<SelectorShared>);

impl Drop for RunningFlag {
    fn drop(&mut self) {
        self.0.running.store(false, Ordering::Release);
    }
}

/// Run a callback into protocol or acceptor code, catching a panic so it only costs the registrant.
/// * return `None` if `f` panicked.
fn isolate<R>(index: usize, who: &dyn Display, f: impl FnOnce() -> R) -> Option<R> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(r) => Some(r),
        Err(payload) => {
            error!("selector-{} {} panicked: {}", index, who, panic_message(payload.as_ref()));
            None
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        *msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "unknown panic payload"
    }
}

/// What `service` decided for a ready registrant.
enum Serviced {
    Keep,
    Backoff(Duration),
    Close,
}

impl LoopCore {
    fn index(&self) -> usize {
        self.handle.index()
    }

    fn next_timeout(&mut self, now: Instant) -> Duration {
        let poll = self.config.poll_interval();
        match self.deferred.next_due() {
            Some(due) => poll.min(due.saturating_duration_since(now)),
            None => poll,
        }
    }

    fn update_count(&self) {
        self.handle
            .shared
            .registrants
            .store(self.registrants.len(), Ordering::Relaxed);
    }

    fn connection_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        match self.registrants.get_mut(id.slot()) {
            Some(Registrant::Connection(conn)) if conn.task.id() == id => Some(conn),
            _ => None,
        }
    }

    //------------------------------ readiness ------------------------------

    fn dispatch(&mut self, key: usize, readable: bool, writable: bool, failed: bool) {
        let id = ConnectionId::from_usize(key);
        let index = self.index();
        let serviced = match isolate(index, &id, || self.service(id, readable, writable, failed)) {
            Some(Some(serviced)) => serviced,
            Some(None) => {
                trace!("selector-{} stale key {}", index, id);
                return;
            }
            None => Serviced::Close,
        };
        match serviced {
            Serviced::Keep => {}
            Serviced::Backoff(delay) => self.pause_reading(id, delay),
            Serviced::Close => {
                self.close_registrant(id);
            }
        }
    }

    /// Run the registrant's readiness work.
    /// * return `None` if `id` no longer names a registrant.
    fn service(
        &mut self,
        id: ConnectionId,
        readable: bool,
        writable: bool,
        failed: bool,
    ) -> Option<Serviced> {
        let mut close = false;
        let mut backoff = None;
        match self.registrants.get_mut(id.slot()) {
            Some(Registrant::Listener {
                id: listener_id,
                listener,
                acceptor,
            }) if *listener_id == id => {
                if readable {
                    accept_pending(listener, acceptor.as_mut());
                }
                if failed {
                    error!("selector-{} listener {} reported an error", self.handle.index(), id);
                    close = true;
                }
            }
            Some(Registrant::Connection(conn)) if conn.task.id() == id => {
                if failed {
                    debug!("{} socket error", conn.endpoint_name());
                    close = true;
                }
                if writable && !close {
                    if let Err(err) = conn.on_writable() {
                        debug!("{} write failed: {}", conn.endpoint_name(), err);
                        close = true;
                    }
                }
                if readable && !close {
                    match conn.on_readable(Instant::now()) {
                        ReadOutcome::Continue | ReadOutcome::Drained => {}
                        ReadOutcome::Backoff(delay) => backoff = Some(delay),
                        ReadOutcome::Close => close = true,
                    }
                }
                if conn.task.is_closed() {
                    close = true;
                }
            }
            _ => return None,
        }
        Some(match (close, backoff) {
            (true, _) => Serviced::Close,
            (false, Some(delay)) => Serviced::Backoff(delay),
            (false, None) => Serviced::Keep,
        })
    }

    fn pause_reading(&mut self, id: ConnectionId, delay: Duration) {
        let previous = match self.connection_mut(id) {
            Some(conn) => {
                debug!("{} fragmented input, pausing reads for {:?}", conn.endpoint_name(), delay);
                conn.task.cancel(Interest::READ);
                conn.pending_rearm.take()
            }
            None => return,
        };
        if let Some(r) = previous {
            self.deferred.cancel(r);
        }
        let rearm = self
            .deferred
            .schedule(Instant::now() + delay, DeferredTask::Rearm(id));
        if let Some(conn) = self.connection_mut(id) {
            conn.pending_rearm = Some(rearm);
        }
    }

    fn reconcile(&mut self, id: ConnectionId) {
        let poller = Arc::clone(&self.poller);
        let failed = match self.connection_mut(id) {
            Some(conn) => {
                let desired = conn.task.interest();
                if desired == conn.applied {
                    false
                } else {
                    match conn.transport.modify(&poller, id.to_usize(), desired) {
                        Ok(()) => {
                            trace!("{} applied {:?}", conn.endpoint_name(), desired);
                            conn.applied = desired;
                            false
                        }
                        Err(err) => {
                            warn!("{} failed to apply {:?}: {}", conn.endpoint_name(), desired, err);
                            true
                        }
                    }
                }
            }
            None => false,
        };
        if failed {
            self.close_registrant(id);
        }
    }

    fn close_registrant(&mut self, id: ConnectionId) -> bool {
        let index = self.index();
        match self.registrants.get(id.slot()) {
            Some(r) if r.id() == id => {}
            _ => return false,
        }
        let registrant = match self.registrants.remove(id.slot()) {
            Some(r) => r,
            None => return false,
        };
        match registrant {
            Registrant::Listener {
                listener,
                mut acceptor,
                ..
            } => {
                if let Err(err) = self.poller.delete(&listener) {
                    warn!("selector-{} failed to deregister listener: {}", self.index(), err);
                }
                info!("selector-{} closed listener {:?}", index, listener.local_addr().ok());
                isolate(index, &id, || acceptor.on_close());
            }
            Registrant::Connection(mut conn) => {
                if let Err(err) = conn.transport.delete(&self.poller) {
                    debug!("{} failed to deregister: {}", conn.endpoint_name(), err);
                }
                for r in conn.pending_rearm.take().into_iter().chain(conn.scheduled.drain(..)) {
                    self.deferred.cancel(r);
                }
                conn.task.mark_closed();
                let Connection {
                    ref task,
                    ref mut protocol,
                    ..
                } = conn;
                isolate(index, &id, || protocol.on_close(task));
                debug!("{} closed ({})", conn.endpoint_name(), id);
            }
        }
        self.update_count();
        true
    }

    //------------------------------ deferred ------------------------------

    fn run_deferred(&mut self, now: Instant) -> usize {
        let mut count = 0;
        while let Some(task) = self.deferred.pop_due(now) {
            count += 1;
            match task {
                DeferredTask::Rearm(id) => {
                    if let Some(conn) = self.connection_mut(id) {
                        conn.pending_rearm = None;
                        if !conn.task.is_closed() {
                            conn.task.register(Interest::READ);
                        }
                    }
                }
                DeferredTask::Close(id) => {
                    self.close_registrant(id);
                }
                DeferredTask::Event(id, event) => self.deliver_event(id, event),
            }
        }
        count
    }

    fn deliver_event(&mut self, id: ConnectionId, event: ProtocolEvent) {
        let index = self.index();
        let closed = match self.connection_mut(id) {
            Some(conn) if !conn.task.is_closed() => {
                let Connection {
                    ref task,
                    ref mut protocol,
                    ..
                } = *conn;
                isolate(index, &id, || protocol.on_event(event, task)).is_none() || task.is_closed()
            }
            Some(_) => true,
            None => {
                trace!("event for unknown connection {}", id);
                false
            }
        };
        if closed {
            self.close_registrant(id);
        }
    }

    //------------------------------ requests ------------------------------

    /// return number of requests processed.
    fn drain_requests(&mut self) -> usize {
        let mut count = 0;
        while count < self.config.max_requests_per_cycle {
            let request = match self.requests.try_recv() {
                Ok(request) => request,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            };
            count += 1;
            self.execute(request);
        }
        count
    }

    fn execute(&mut self, request: SelectorRequest) {
        match request {
            SelectorRequest::Attach { source, completion } => {
                let attached = self.attach(source);
                let id = match &attached {
                    Attached::Connection(task) => Some(task.id()),
                    Attached::Listener(id) => Some(*id),
                    Attached::Error(_) => None,
                };
                if let Some(completion) = completion {
                    let completed =
                        isolate(self.index(), &"attach completion", || completion(attached));
                    // nobody learned about the registrant, so it cannot be kept.
                    if let (None, Some(id)) = (completed, id) {
                        self.close_registrant(id);
                    }
                }
            }
            SelectorRequest::Reconcile { id, ack } => {
                self.reconcile(id);
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
            }
            SelectorRequest::Close { id, ack } => {
                self.close_registrant(id);
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
            }
            SelectorRequest::CloseAfter { id, delay } => {
                if delay.is_zero() {
                    self.close_registrant(id);
                } else {
                    self.schedule_for(id, delay, DeferredTask::Close(id));
                }
            }
            SelectorRequest::Event { id, event, delay } => match delay {
                Some(delay) if !delay.is_zero() => {
                    self.schedule_for(id, delay, DeferredTask::Event(id, event));
                }
                _ => self.deliver_event(id, event),
            },
        }
    }

    /// Queue `task` for a live connection; it is cancelled if the connection closes first.
    fn schedule_for(&mut self, id: ConnectionId, delay: Duration, task: DeferredTask) {
        let due = Instant::now() + delay;
        match self.registrants.get_mut(id.slot()) {
            Some(Registrant::Connection(conn)) if conn.task.id() == id => {
                let deferred = &mut self.deferred;
                conn.scheduled.retain(|r| deferred.is_pending(*r));
                conn.scheduled.push(deferred.schedule(due, task));
            }
            _ => trace!("selector-{} dropped deferred task for unknown {}", self.handle.index(), id),
        }
    }

    fn attach(&mut self, source: AttachSource) -> Attached {
        let slot = self.registrants.next_slot();
        self.next_version = self.next_version.wrapping_add(1);
        let id = ConnectionId::new(slot, self.next_version);
        let key = id.to_usize();
        let attached = match source {
            AttachSource::Listener { listener, acceptor } => {
                // the listener must stay registered until close_registrant deletes it.
                match unsafe {
                    self.poller
                        .add_with_mode(&listener, Event::readable(key), PollMode::Level)
                } {
                    Ok(()) => {
                        info!(
                            "selector-{} listening on {:?} as {}",
                            self.index(),
                            listener.local_addr().ok(),
                            id
                        );
                        self.registrants.add(Registrant::Listener {
                            id,
                            listener,
                            acceptor,
                        });
                        Attached::Listener(id)
                    }
                    Err(err) => Attached::Error(format!("failed to register listener: {err}")),
                }
            }
            AttachSource::Stream {
                endpoint,
                protocol,
                reader,
                writer,
            } => {
                let task = self.new_task(id, &endpoint);
                match unsafe {
                    self.poller
                        .add_with_mode(endpoint.socket(), Event::readable(key), PollMode::Level)
                } {
                    Ok(()) => {
                        debug!("selector-{} attached {} as {}", self.index(), endpoint.name(), id);
                        self.registrants.add(Registrant::Connection(Connection {
                            task: Arc::clone(&task),
                            protocol,
                            transport: Transport::Stream {
                                endpoint,
                                reader,
                                writer,
                            },
                            applied: Interest::READ,
                            pending_rearm: None,
                            scheduled: Vec::new(),
                        }));
                        Attached::Connection(task)
                    }
                    Err(err) => Attached::Error(format!(
                        "failed to register {}: {err}",
                        endpoint.name()
                    )),
                }
            }
            AttachSource::Datagram {
                endpoint,
                protocol,
                reader,
                writer,
            } => {
                let task = self.new_task(id, &endpoint);
                match unsafe {
                    self.poller
                        .add_with_mode(endpoint.socket(), Event::readable(key), PollMode::Level)
                } {
                    Ok(()) => {
                        debug!("selector-{} attached {} as {}", self.index(), endpoint.name(), id);
                        self.registrants.add(Registrant::Connection(Connection {
                            task: Arc::clone(&task),
                            protocol,
                            transport: Transport::Datagram {
                                endpoint,
                                reader,
                                writer,
                            },
                            applied: Interest::READ,
                            pending_rearm: None,
                            scheduled: Vec::new(),
                        }));
                        Attached::Connection(task)
                    }
                    Err(err) => Attached::Error(format!(
                        "failed to register {}: {err}",
                        endpoint.name()
                    )),
                }
            }
        };
        self.update_count();
        attached
    }

    fn new_task(&self, id: ConnectionId, endpoint: &dyn EndPoint) -> Arc<ConnectionTask> {
        Arc::new(ConnectionTask::new(
            id,
            self.handle.clone(),
            endpoint.remote_address(),
            endpoint.name().to_owned(),
            Interest::READ,
        ))
    }

    fn shutdown(&mut self) {
        self.handle.shared.running.store(false, Ordering::Release);
        let ids: Vec<ConnectionId> = self
            .registrants
            .slots()
            .filter_map(|slot| self.registrants.get(slot).map(|r| r.id()))
            .collect();
        for id in ids {
            self.close_registrant(id);
        }
        // fail pending attaches so their callers do not wait forever.
        for request in self.requests.try_iter() {
            if let SelectorRequest::Attach {
                completion: Some(completion),
                ..
            } = request
            {
                isolate(self.index(), &"attach completion", || {
                    completion(Attached::Error("selector stopped".to_owned()))
                });
            }
        }
        if self.deferred.len() > 0 {
            debug!("selector-{} dropped {} deferred tasks", self.index(), self.deferred.len());
        }
    }
}

const MAX_ACCEPTS_PER_EVENT: usize = 64;

fn accept_pending(listener: &TcpListener, acceptor: &mut dyn Acceptor) {
    for _ in 0..MAX_ACCEPTS_PER_EVENT {
        match listener.accept() {
            Ok((stream, addr)) => acceptor.on_accept(stream, addr),
            Err(err) if err.kind() == ErrorKind::WouldBlock => break,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                warn!("accept failed on {:?}: {}", listener.local_addr().ok(), err);
                break;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::TcpConfig;
    use crate::packet::Packet;
    use crate::protocol::MalformedPacket;
    use std::net::TcpStream;

    /// Swallows input; panics on any posted event when `fragile`.
    struct Sink {
        fragile: bool,
    }
    impl Protocol for Sink {
        fn name(&self) -> &'static str {
            "sink"
        }
        fn process_packet(
            &mut self,
            packet: &mut Packet,
            _task: &Arc<ConnectionTask>,
        ) -> std::result::Result<bool, MalformedPacket> {
            packet.set_position(packet.limit());
            Ok(true)
        }
        fn on_event(&mut self, _event: ProtocolEvent, _task: &Arc<ConnectionTask>) {
            if self.fragile {
                panic!("event handler failed");
            }
        }
    }

    fn attach_sink(core: &mut LoopCore, fragile: bool) -> (Arc<ConnectionTask>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, _) = listener.accept().unwrap();
        stream.set_nonblocking(true).unwrap();
        let (tx, rx) = crossbeam_channel::bounded(1);
        core.execute(SelectorRequest::Attach {
            source: AttachSource::Stream {
                endpoint: TcpEndPoint::new(stream),
                protocol: Box::new(Sink { fragile }),
                reader: ReadTask::from_config(&TcpConfig::default()),
                writer: WriteTask::from_config(&TcpConfig::default()),
            },
            completion: Some(Box::new(move |attached| {
                let _ = tx.send(attached);
            })),
        });
        match rx.recv().unwrap() {
            Attached::Connection(task) => (task, client),
            _ => panic!("attach failed"),
        }
    }

    #[test]
    fn test_close_cancels_scheduled_tasks() {
        let _ = env_logger::builder().is_test(true).try_init();
        let (mut selector, _handle) = SelectorLoop::new(0, &SelectorConfig::default()).unwrap();
        let core = &mut selector.core;
        let (task, _client) = attach_sink(core, false);
        let id = task.id();
        core.execute(SelectorRequest::CloseAfter {
            id,
            delay: Duration::from_secs(60),
        });
        core.execute(SelectorRequest::Event {
            id,
            event: ProtocolEvent::KeepAliveCheck { peer: None },
            delay: Some(Duration::from_secs(60)),
        });
        assert_eq!(core.deferred.len(), 2);

        core.execute(SelectorRequest::Close { id, ack: None });
        assert!(task.is_closed());
        assert_eq!(core.deferred.len(), 0);

        // nothing is queued for a connection that is already gone.
        core.execute(SelectorRequest::CloseAfter {
            id,
            delay: Duration::from_secs(60),
        });
        assert_eq!(core.deferred.len(), 0);
    }

    #[test]
    fn test_panicking_event_handler_closes_only_its_connection() {
        let _ = env_logger::builder().is_test(true).try_init();
        let (mut selector, handle) = SelectorLoop::new(0, &SelectorConfig::default()).unwrap();
        let core = &mut selector.core;
        let (fragile, _c1) = attach_sink(core, true);
        let (sturdy, _c2) = attach_sink(core, false);
        assert_eq!(handle.count_registrants(), 2);

        for task in [&fragile, &sturdy] {
            core.execute(SelectorRequest::Event {
                id: task.id(),
                event: ProtocolEvent::KeepAliveCheck { peer: None },
                delay: None,
            });
        }
        assert!(fragile.is_closed());
        assert!(!sturdy.is_closed());
        assert_eq!(handle.count_registrants(), 1);
    }

    #[test]
    fn test_panic_message() {
        let payload = panic::catch_unwind(|| panic!("boom {}", 7)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "boom 7");
        let payload = panic::catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "static");
    }

    #[test]
    fn test_deferred_queue_order_and_cancel() {
        let mut queue = DeferredQueue::new();
        let now = Instant::now();
        let id = ConnectionId::new(0, 1);
        let late = queue.schedule(now + Duration::from_millis(20), DeferredTask::Close(id));
        let early = queue.schedule(now + Duration::from_millis(10), DeferredTask::Rearm(id));
        assert_eq!(queue.next_due(), Some(now + Duration::from_millis(10)));

        assert!(queue.cancel(early));
        assert!(!queue.cancel(early));
        assert_eq!(queue.next_due(), Some(now + Duration::from_millis(20)));
        assert!(queue.pop_due(now).is_none());
        assert!(matches!(
            queue.pop_due(now + Duration::from_millis(25)),
            Some(DeferredTask::Close(_))
        ));
        assert!(!queue.cancel(late));
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_cancel_does_not_hit_reused_slot() {
        let mut queue = DeferredQueue::new();
        let now = Instant::now();
        let id = ConnectionId::new(0, 1);
        let first = queue.schedule(now, DeferredTask::Rearm(id));
        assert!(queue.pop_due(now).is_some());
        let second = queue.schedule(now, DeferredTask::Close(id));
        assert_eq!(first.slot, second.slot);
        assert!(!queue.cancel(first));
        assert!(matches!(queue.pop_due(now), Some(DeferredTask::Close(_))));
    }
}
