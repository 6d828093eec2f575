//! In-memory session layer: sessions, subscriptions and destinations live in process maps, and stored messages
//! are routed straight to matching subscribers. Nothing survives a restart.
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use super::{
    is_valid_filter, topic_matches, Completion, Delivery, Destination, DestinationKind, Message,
    MessageListener, Session, SessionContext, SessionError, SessionManager, SubscriptionContext,
    Transaction, Will,
};

#[derive(Default)]
struct Registry {
    sessions: Mutex<HashMap<String, Arc<MemorySession>>>,
    destinations: Mutex<HashMap<String, Arc<MemoryDestination>>>,
}

impl Registry {
    fn destination(self: &Arc<Self>, name: &str, kind: DestinationKind) -> Arc<MemoryDestination> {
        let mut destinations = self.destinations.lock();
        Arc::clone(destinations.entry(name.to_owned()).or_insert_with(|| {
            debug!("created destination {}", name);
            Arc::new(MemoryDestination {
                name: name.to_owned(),
                kind,
                messages: Mutex::new(VecDeque::new()),
                registry: Arc::downgrade(self),
            })
        }))
    }

    fn route(&self, destination: &str, message: &Message) -> usize {
        let sessions: Vec<Arc<MemorySession>> = self.sessions.lock().values().cloned().collect();
        let mut delivered = 0;
        for session in sessions {
            if let Some(qos) = session.matching_qos(destination) {
                let delivery = Delivery::new(destination, message.clone(), qos.min(message.qos));
                if session.deliver(delivery) {
                    delivered += 1;
                }
            }
        }
        delivered
    }
}

pub struct MemorySessionManager {
    registry: Arc<Registry>,
    credentials: Option<HashMap<String, String>>,
}

impl Default for MemorySessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySessionManager {
    /// Accepts any client.
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry::default()),
            credentials: None,
        }
    }

    /// Accepts only clients presenting one of the username/password pairs.
    pub fn with_credentials(credentials: HashMap<String, String>) -> Self {
        Self {
            registry: Arc::new(Registry::default()),
            credentials: Some(credentials),
        }
    }

    pub fn session_count(&self) -> usize {
        self.registry.sessions.lock().len()
    }

    pub fn destination(&self, name: &str) -> Option<Arc<MemoryDestination>> {
        self.registry.destinations.lock().get(name).cloned()
    }

    fn authenticate(&self, context: &SessionContext) -> Result<(), SessionError> {
        let credentials = match &self.credentials {
            Some(credentials) => credentials,
            None => return Ok(()),
        };
        let username = context.username.as_deref();
        let expected = username.and_then(|u| credentials.get(u));
        let presented = context
            .password
            .as_deref()
            .and_then(|p| std::str::from_utf8(p).ok());
        match (expected, presented) {
            (Some(expected), Some(presented)) if expected == presented => Ok(()),
            _ => Err(SessionError::AuthenticationFailed(username.map(str::to_owned))),
        }
    }
}

impl SessionManager for MemorySessionManager {
    fn create_session(&self, context: SessionContext, completion: Completion<Arc<dyn Session>>) {
        if let Err(err) = self.authenticate(&context) {
            completion(Err(err));
            return;
        }
        let mut sessions = self.registry.sessions.lock();
        let session = match sessions.get(&context.client_id) {
            Some(existing) if !context.clean_session && existing.persistent => {
                existing.resume(context.listener, context.will);
                Arc::clone(existing)
            }
            _ => {
                let session = Arc::new(MemorySession {
                    id: context.client_id.clone(),
                    persistent: !context.clean_session,
                    restored: AtomicBool::new(false),
                    listener: Mutex::new(Some(context.listener)),
                    will: Mutex::new(context.will),
                    subscriptions: Mutex::new(BTreeMap::new()),
                    registry: Arc::downgrade(&self.registry),
                });
                sessions.insert(context.client_id.clone(), Arc::clone(&session));
                session
            }
        };
        drop(sessions);
        info!(
            "session {} opened for {} ({:?}), restored: {}",
            session.id,
            context.protocol,
            context.remote,
            session.is_restored()
        );
        completion(Ok(session as Arc<dyn Session>));
    }

    fn close_session(&self, session: &Arc<dyn Session>, publish_will: bool) {
        let found = self.registry.sessions.lock().get(session.id()).cloned();
        let session = match found {
            // a newer clean session may have replaced this one under the same client id
            Some(s) if std::ptr::eq(Arc::as_ptr(&s) as *const (), Arc::as_ptr(session) as *const ()) => s,
            _ => return,
        };
        let will = session.will.lock().take();
        session.listener.lock().take();
        if !session.persistent {
            self.registry.sessions.lock().remove(&session.id);
        }
        debug!("session {} closed, will: {}", session.id, publish_will && will.is_some());
        if let (true, Some(will)) = (publish_will, will) {
            let destination = self.registry.destination(&will.topic, DestinationKind::Topic);
            if let Err(err) = destination.store_message(will.message) {
                warn!("session {} will on {} not stored: {}", session.id, will.topic, err);
            }
        }
    }
}

pub struct MemorySession {
    id: String,
    persistent: bool,
    restored: AtomicBool,
    listener: Mutex<Option<Arc<dyn MessageListener>>>,
    will: Mutex<Option<Will>>,
    subscriptions: Mutex<BTreeMap<String, u8>>,
    registry: Weak<Registry>,
}

impl MemorySession {
    fn resume(&self, listener: Arc<dyn MessageListener>, will: Option<Will>) {
        *self.listener.lock() = Some(listener);
        *self.will.lock() = will;
        self.restored.store(true, Ordering::Release);
    }

    fn matching_qos(&self, topic: &str) -> Option<u8> {
        self.subscriptions
            .lock()
            .iter()
            .filter(|(filter, _)| topic_matches(filter, topic))
            .map(|(_, qos)| *qos)
            .max()
    }

    fn deliver(&self, delivery: Delivery) -> bool {
        let listener = self.listener.lock().clone();
        match listener {
            Some(listener) => listener.deliver(delivery),
            None => false,
        }
    }

    pub fn subscriptions(&self) -> Vec<(String, u8)> {
        self.subscriptions
            .lock()
            .iter()
            .map(|(f, q)| (f.clone(), *q))
            .collect()
    }
}

impl Session for MemorySession {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_restored(&self) -> bool {
        self.restored.load(Ordering::Acquire)
    }

    fn find_destination(
        &self,
        name: &str,
        kind: DestinationKind,
        completion: Completion<Arc<dyn Destination>>,
    ) {
        match self.registry.upgrade() {
            Some(registry) => completion(Ok(registry.destination(name, kind) as Arc<dyn Destination>)),
            None => completion(Err(SessionError::Closed)),
        }
    }

    fn add_subscription(&self, subscription: SubscriptionContext) -> Result<u8, SessionError> {
        if !is_valid_filter(&subscription.filter) {
            return Err(SessionError::Rejected(format!(
                "invalid filter {:?}",
                subscription.filter
            )));
        }
        let granted = subscription.qos.min(2);
        self.subscriptions
            .lock()
            .insert(subscription.filter, granted);
        Ok(granted)
    }

    fn remove_subscription(&self, filter: &str) -> bool {
        self.subscriptions.lock().remove(filter).is_some()
    }

    fn start_transaction(&self) -> Box<dyn Transaction> {
        Box::new(MemoryTransaction { staged: Vec::new() })
    }
}

/// Messages a destination keeps for inspection; older ones are dropped.
pub const HISTORY_LIMIT: usize = 64;

pub struct MemoryDestination {
    name: String,
    kind: DestinationKind,
    messages: Mutex<VecDeque<Message>>,
    registry: Weak<Registry>,
}

impl MemoryDestination {
    /// The last `HISTORY_LIMIT` stored messages, oldest first.
    pub fn messages(&self) -> Vec<Message> {
        self.messages.lock().iter().cloned().collect()
    }
}

impl Destination for MemoryDestination {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DestinationKind {
        self.kind
    }

    fn store_message(&self, message: Message) -> Result<(), SessionError> {
        {
            let mut messages = self.messages.lock();
            if messages.len() == HISTORY_LIMIT {
                messages.pop_front();
            }
            messages.push_back(message.clone());
        }
        let registry = self.registry.upgrade().ok_or(SessionError::Closed)?;
        let delivered = registry.route(&self.name, &message);
        debug!("{} stored message, {} subscribers", self.name, delivered);
        Ok(())
    }
}

struct MemoryTransaction {
    staged: Vec<(Arc<dyn Destination>, Message)>,
}

impl Transaction for MemoryTransaction {
    fn add(&mut self, destination: Arc<dyn Destination>, message: Message) {
        self.staged.push((destination, message));
    }

    fn commit(self: Box<Self>) -> Result<usize, SessionError> {
        let count = self.staged.len();
        for (destination, message) in self.staged {
            destination.store_message(message)?;
        }
        Ok(count)
    }

    fn abort(self: Box<Self>) {
        debug!("transaction aborted, {} messages discarded", self.staged.len());
    }
}
