use log::{debug, trace, warn};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::frame::ServerPacket;
use crate::protocol::ProtocolEvent;
use crate::selector::{SelectorHandle, SelectorRequest};

#[cfg(target_pointer_width = "64")]
pub(crate) type HalfUsize = u32;
#[cfg(target_pointer_width = "32")]
pub(crate) type HalfUsize = u16;

/// `ConnectionId` identifies a registrant inside one selector loop: the storage slot plus a generation,
/// so that a request addressed to a closed connection never reaches a newer one reusing the slot.
/// It doubles as the poller key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    pub(crate) slot: HalfUsize,
    pub(crate) ver: HalfUsize,
}

impl ConnectionId {
    pub(crate) fn new(slot: usize, ver: HalfUsize) -> Self {
        Self {
            slot: slot as HalfUsize,
            ver,
        }
    }
    pub fn slot(&self) -> usize {
        self.slot as usize
    }
    /// convert to poller event key
    pub fn to_usize(&self) -> usize {
        let halfbits = std::mem::size_of::<usize>() * 8 / 2;
        ((self.ver as usize) << halfbits) | (self.slot as usize)
    }
    /// convert from poller event key
    pub fn from_usize(val: usize) -> Self {
        let halfbits = std::mem::size_of::<usize>() * 8 / 2;
        Self {
            slot: val as HalfUsize,
            ver: (val >> halfbits) as HalfUsize,
        }
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.slot, self.ver)
    }
}

/// Readiness bits a connection wants to be woken for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest {
    pub read: bool,
    pub write: bool,
}

impl Interest {
    pub const NONE: Interest = Interest {
        read: false,
        write: false,
    };
    pub const READ: Interest = Interest {
        read: true,
        write: false,
    };
    pub const WRITE: Interest = Interest {
        read: false,
        write: true,
    };
    pub const ALL: Interest = Interest {
        read: true,
        write: true,
    };

    pub fn union(self, other: Interest) -> Interest {
        Interest {
            read: self.read || other.read,
            write: self.write || other.write,
        }
    }
    pub fn difference(self, other: Interest) -> Interest {
        Interest {
            read: self.read && !other.read,
            write: self.write && !other.write,
        }
    }
    pub fn is_empty(&self) -> bool {
        !self.read && !self.write
    }
}

struct RegistrationState {
    interest: Interest,
    closed: bool,
}

/// `ConnectionTask` is the shared per-connection coordinator.
///
/// The owning selector loop keeps the endpoint, the protocol and both pipelines; everything that other threads
/// may touch lives here:
/// * the registration state (interest mask + closed flag), serialized by one lock,
/// * the outbound frame queue,
/// * the handle used to post requests to the owning loop.
///
/// Interest changes are computed under the lock and applied by the owning loop. Off the loop thread the caller
/// waits for the loop's acknowledgement, bounded by the selector's registration timeout; on timeout the change is
/// left for the next cycle to reconcile.
pub struct ConnectionTask {
    id: ConnectionId,
    selector: SelectorHandle,
    remote: Option<SocketAddr>,
    name: String,
    state: Mutex<RegistrationState>,
    outbound: Mutex<VecDeque<Box<dyn ServerPacket>>>,
    last_read: Mutex<Instant>,
}

impl ConnectionTask {
    pub(crate) fn new(
        id: ConnectionId,
        selector: SelectorHandle,
        remote: Option<SocketAddr>,
        name: String,
        interest: Interest,
    ) -> Self {
        Self {
            id,
            selector,
            remote,
            name,
            state: Mutex::new(RegistrationState {
                interest,
                closed: false,
            }),
            outbound: Mutex::new(VecDeque::new()),
            last_read: Mutex::new(Instant::now()),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn remote_address(&self) -> Option<SocketAddr> {
        self.remote
    }
    pub fn interest(&self) -> Interest {
        self.state.lock().interest
    }
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Add `interest` to the registration.
    pub fn register(&self, interest: Interest) {
        self.update_interest(|current| current.union(interest));
    }

    /// Remove `interest` from the registration.
    pub fn cancel(&self, interest: Interest) {
        self.update_interest(|current| current.difference(interest));
    }

    fn update_interest(&self, change: impl FnOnce(Interest) -> Interest) {
        let ack = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            let next = change(state.interest);
            if next == state.interest {
                return;
            }
            trace!("{} interest {:?} -> {:?}", self.name, state.interest, next);
            state.interest = next;
            self.submit_awaitable(|ack| SelectorRequest::Reconcile { id: self.id, ack })
        };
        self.await_ack(ack, "interest change");
    }

    /// Mark the connection closed and ask the owning loop to release it. Idempotent.
    /// Queued frames are dropped without completion.
    pub fn close(&self) {
        let ack = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.interest = Interest::NONE;
            self.submit_awaitable(|ack| SelectorRequest::Close { id: self.id, ack })
        };
        self.outbound.lock().clear();
        debug!("{} closing connection {}", self.name, self.id);
        self.await_ack(ack, "close");
    }

    /// Loop-side close after the registrant was already removed.
    pub(crate) fn mark_closed(&self) {
        {
            let mut state = self.state.lock();
            state.closed = true;
            state.interest = Interest::NONE;
        }
        self.outbound.lock().clear();
    }

    /// Close after `delay`, giving queued frames a chance to flush first.
    pub fn schedule_close(&self, delay: Duration) {
        if self.is_closed() {
            return;
        }
        self.submit(SelectorRequest::CloseAfter { id: self.id, delay });
    }

    /// Deliver `event` to the connection's protocol on the owning loop.
    pub fn post(&self, event: ProtocolEvent) {
        self.submit(SelectorRequest::Event {
            id: self.id,
            event,
            delay: None,
        });
    }

    /// Deliver `event` to the connection's protocol after `delay`.
    pub fn post_after(&self, event: ProtocolEvent, delay: Duration) {
        self.submit(SelectorRequest::Event {
            id: self.id,
            event,
            delay: Some(delay),
        });
    }

    //------------------------------ outbound queue ------------------------------

    /// Queue a frame for transmission and make sure write interest is registered.
    pub fn push(&self, frame: Box<dyn ServerPacket>) {
        if self.is_closed() {
            trace!("{} dropping frame for closed connection", self.name);
            return;
        }
        self.outbound.lock().push_back(frame);
        self.register_write();
    }

    /// Register write interest unless it is already registered.
    pub fn register_write(&self) {
        self.register(Interest::WRITE);
    }

    /// Cancel write interest when nothing is queued. The emptiness check runs under the registration lock,
    /// so a concurrent `push` either sees the cancellation and registers again, or is seen here.
    pub fn cancel_write_if_idle(&self) {
        let ack = {
            let mut state = self.state.lock();
            if state.closed || !state.interest.write || !self.outbound.lock().is_empty() {
                return;
            }
            state.interest.write = false;
            self.submit_awaitable(|ack| SelectorRequest::Reconcile { id: self.id, ack })
        };
        self.await_ack(ack, "write cancel");
    }

    pub fn outbound_len(&self) -> usize {
        self.outbound.lock().len()
    }
    pub(crate) fn pop_frame(&self) -> Option<Box<dyn ServerPacket>> {
        self.outbound.lock().pop_front()
    }
    pub(crate) fn requeue_front(&self, frame: Box<dyn ServerPacket>) {
        self.outbound.lock().push_front(frame);
    }

    //------------------------------ activity ------------------------------

    pub(crate) fn touch(&self) {
        *self.last_read.lock() = Instant::now();
    }
    /// Time since bytes were last read from this connection.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_read.lock())
    }

    //------------------------------ private ------------------------------

    fn submit(&self, request: SelectorRequest) {
        if let Err(err) = self.selector.submit(request) {
            warn!("{} request dropped: {}", self.name, err);
        }
    }

    // Submits while the caller holds the registration lock, so requests reach the loop in lock order.
    fn submit_awaitable(
        &self,
        make: impl FnOnce(Option<crossbeam_channel::Sender<()>>) -> SelectorRequest,
    ) -> Option<crossbeam_channel::Receiver<()>> {
        let (ack_tx, ack_rx) = if self.selector.must_wait() {
            let (tx, rx) = crossbeam_channel::bounded(1);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        match self.selector.submit(make(ack_tx)) {
            Ok(()) => ack_rx,
            Err(err) => {
                warn!("{} request dropped: {}", self.name, err);
                None
            }
        }
    }

    fn await_ack(&self, ack: Option<crossbeam_channel::Receiver<()>>, what: &str) {
        if let Some(rx) = ack {
            if rx.recv_timeout(self.selector.registration_timeout()).is_err() {
                warn!(
                    "{} timed out waiting for {} on {}; next cycle reconciles",
                    self.name, what, self.id
                );
            }
        }
    }
}

impl std::fmt::Debug for ConnectionTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionTask")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("interest", &self.interest())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::frame::RawFrame;
    use crate::selector::SelectorHandle;
    use crossbeam_channel::Receiver;
    use std::sync::Arc;

    /// A task bound to a selector that is never run; requests pile up in the returned receiver.
    pub(crate) fn detached_task() -> (Arc<ConnectionTask>, Receiver<SelectorRequest>) {
        let (handle, rx) = SelectorHandle::detached(Duration::from_millis(10));
        let task = ConnectionTask::new(
            ConnectionId::new(3, 1),
            handle,
            None,
            "test".to_owned(),
            Interest::READ,
        );
        (Arc::new(task), rx)
    }

    fn count_reconciles(rx: &Receiver<SelectorRequest>) -> usize {
        rx.try_iter()
            .filter(|r| matches!(r, SelectorRequest::Reconcile { .. }))
            .count()
    }

    #[test]
    fn test_connection_id_key() {
        let id = ConnectionId::new(7, 42);
        assert_eq!(ConnectionId::from_usize(id.to_usize()), id);
        assert_eq!(id.to_string(), "7:42");
    }

    #[test]
    fn test_write_interest_registered_once() {
        let (task, rx) = detached_task();
        task.push(Box::new(RawFrame::new(vec![1])));
        task.push(Box::new(RawFrame::new(vec![2])));
        assert_eq!(task.interest(), Interest::ALL);
        assert_eq!(count_reconciles(&rx), 1);
    }

    #[test]
    fn test_write_interest_cancelled_when_idle() {
        let (task, rx) = detached_task();
        task.push(Box::new(RawFrame::new(vec![1])));
        // not idle yet
        task.cancel_write_if_idle();
        assert!(task.interest().write);
        assert!(task.pop_frame().is_some());
        task.cancel_write_if_idle();
        assert_eq!(task.interest(), Interest::READ);
        assert_eq!(count_reconciles(&rx), 2);

        task.push(Box::new(RawFrame::new(vec![3])));
        task.push(Box::new(RawFrame::new(vec![4])));
        assert!(task.interest().write);
        assert_eq!(count_reconciles(&rx), 1);
    }

    #[test]
    fn test_close_is_idempotent() {
        let (task, rx) = detached_task();
        task.push(Box::new(RawFrame::new(vec![1])));
        task.close();
        task.close();
        assert!(task.is_closed());
        assert_eq!(task.outbound_len(), 0);
        assert_eq!(task.interest(), Interest::NONE);
        let closes = rx
            .try_iter()
            .filter(|r| matches!(r, SelectorRequest::Close { .. }))
            .count();
        assert_eq!(closes, 1);
        task.push(Box::new(RawFrame::new(vec![2])));
        assert_eq!(task.outbound_len(), 0);
        task.register(Interest::READ);
        assert_eq!(task.interest(), Interest::NONE);
    }
}
