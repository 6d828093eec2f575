//! Boundary to the publish/subscribe session layer.
//!
//! Protocols only call these traits; they never own session or destination state. Every potentially slow
//! operation completes through a callback, which may run on any thread. Callbacks must not touch protocol
//! state: they either push frames onto a connection or post a `ProtocolEvent` back to it.
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub mod memory;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("authentication failed for {0:?}")]
    AuthenticationFailed(Option<String>),
    #[error("destination not found: {0}")]
    NotFound(String),
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("session closed")]
    Closed,
}

pub type Completion<T> = Box<dyn FnOnce(Result<T, SessionError>) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DestinationKind {
    Topic,
    Queue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
}

impl Message {
    pub fn new(payload: impl Into<Vec<u8>>, qos: u8) -> Self {
        Self {
            payload: payload.into(),
            qos,
            retain: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub message: Message,
}

/// A message routed to one subscriber.
pub struct Delivery {
    pub destination: String,
    pub message: Message,
    /// Effective QoS: the lower of the message's and the subscription's.
    pub qos: u8,
    /// Runs once the message is on the wire to the subscriber.
    pub completion: Option<Box<dyn FnOnce() + Send>>,
}

impl Delivery {
    pub fn new(destination: impl Into<String>, message: Message, qos: u8) -> Self {
        Self {
            destination: destination.into(),
            message,
            qos,
            completion: None,
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("destination", &self.destination)
            .field("message", &self.message)
            .field("qos", &self.qos)
            .finish()
    }
}

/// Receives messages matched by a session's subscriptions.
pub trait MessageListener: Send + Sync {
    /// return false when the receiver is gone.
    fn deliver(&self, delivery: Delivery) -> bool;
}

/// Everything the session layer learns about a connecting client.
pub struct SessionContext {
    pub client_id: String,
    pub protocol: &'static str,
    pub remote: Option<SocketAddr>,
    pub clean_session: bool,
    pub keep_alive: Duration,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
    pub will: Option<Will>,
    pub listener: Arc<dyn MessageListener>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionContext {
    pub filter: String,
    pub qos: u8,
}

pub trait SessionManager: Send + Sync {
    fn create_session(&self, context: SessionContext, completion: Completion<Arc<dyn Session>>);

    /// Release a session whose connection went away. `publish_will` is false after an orderly disconnect.
    fn close_session(&self, session: &Arc<dyn Session>, publish_will: bool);
}

pub trait Session: Send + Sync {
    fn id(&self) -> &str;

    /// true when state from an earlier connection was resumed.
    fn is_restored(&self) -> bool;

    fn find_destination(
        &self,
        name: &str,
        kind: DestinationKind,
        completion: Completion<Arc<dyn Destination>>,
    );

    /// return the granted QoS.
    fn add_subscription(&self, subscription: SubscriptionContext) -> Result<u8, SessionError>;

    /// return false when no such subscription existed.
    fn remove_subscription(&self, filter: &str) -> bool;

    fn start_transaction(&self) -> Box<dyn Transaction>;
}

pub trait Destination: Send + Sync {
    fn name(&self) -> &str;
    fn kind(&self) -> DestinationKind;
    fn store_message(&self, message: Message) -> Result<(), SessionError>;
}

/// Messages staged for several destinations, stored together on commit.
pub trait Transaction: Send {
    fn add(&mut self, destination: Arc<dyn Destination>, message: Message);
    /// return number of messages stored.
    fn commit(self: Box<Self>) -> Result<usize, SessionError>;
    fn abort(self: Box<Self>);
}

/// MQTT style filter match: `+` matches one level, a trailing `#` matches any number of levels,
/// including none. Wildcards never match a first level starting with `$`.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// A filter is valid when `#` only appears as the whole last level and `+` only as a whole level.
pub fn is_valid_filter(filter: &str) -> bool {
    if filter.is_empty() {
        return false;
    }
    let levels: Vec<&str> = filter.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || i != levels.len() - 1) {
            return false;
        }
        if level.contains('+') && *level != "+" {
            return false;
        }
    }
    true
}
