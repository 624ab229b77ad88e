//! Multiplexing of logical subscriptions over one relay connection.
//!
//! The subscription table lives inside a single dispatch task per connection.
//! Callers never touch it directly: [`SubscriptionManager::subscribe`] and
//! [`SubscriptionManager::unsubscribe`] post commands, and inbound frames are
//! processed one at a time in arrival order.
//!
//! Before an `EVENT` is handed to a subscriber it must:
//! 1. carry a subscription id that is still open here,
//! 2. match one of the filters the subscription was opened with,
//! 3. carry a valid id and signature (unless verification is disabled),
//! 4. not have been delivered to that subscription already.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::{
    error::{Error, Result},
    event::Event,
    filter::Filter,
    message::{ClientMessage, RelayMessage},
    relay::{RelayConnection, RelayNotification},
    signer,
};

/// Delivered to the owner of a [`Subscription`].
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    Event(Event),
    /// Replayed history is done; later events are live.
    EndOfStoredEvents,
    /// The relay ended the subscription with this reason.
    Closed(String),
    /// The connection failed; the subscription is gone.
    Failed(Error),
}

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Check id and signature of every delivered event.
    pub verify_signatures: bool,
    /// Prefix for generated subscription ids.
    pub id_prefix: String,
    /// Event ids remembered per subscription for deduplication. Once full the
    /// oldest id is forgotten, so a relay replaying a very old event to a
    /// long-lived subscription can get it delivered twice.
    pub dedup_capacity: usize,
}

pub const DEFAULT_DEDUP_CAPACITY: usize = 10_000;

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            verify_signatures: true,
            id_prefix: "sub".into(),
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
        }
    }
}

enum Command {
    Subscribe {
        id: String,
        filters: Vec<Filter>,
        sink: mpsc::UnboundedSender<SubscriptionEvent>,
    },
    Unsubscribe(String),
}

/// Cloneable handle to the dispatch task of one connection.
#[derive(Clone)]
pub struct SubscriptionManager {
    connection: RelayConnection,
    commands: mpsc::UnboundedSender<Command>,
    next_id: Arc<AtomicU64>,
    prefix: Arc<str>,
}

impl SubscriptionManager {
    /// Start the dispatch task for `connection`.
    pub fn new(connection: RelayConnection, options: ManagerOptions) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let notifications = connection.listen();
        let dispatcher = Dispatcher {
            connection: connection.clone(),
            verify_signatures: options.verify_signatures,
            dedup_capacity: options.dedup_capacity.max(1),
            table: HashMap::new(),
            terminal: None,
        };
        tokio::spawn(dispatcher.run(rx, notifications));
        Self {
            connection,
            commands,
            next_id: Arc::new(AtomicU64::new(1)),
            prefix: options.id_prefix.into(),
        }
    }

    pub fn connection(&self) -> &RelayConnection {
        &self.connection
    }

    pub fn subscribe(&self, filter: Filter) -> Result<Subscription> {
        self.subscribe_filters(vec![filter])
    }

    /// Open one subscription whose events may match any of `filters`.
    pub fn subscribe_filters(&self, filters: Vec<Filter>) -> Result<Subscription> {
        if filters.is_empty() {
            return Err(Error::validation("subscription needs at least one filter"));
        }
        for filter in &filters {
            filter.validate()?;
        }
        if !self.connection.state().accepts_sends() {
            return Err(Error::NotConnected);
        }
        let id = format!(
            "{}-{}",
            self.prefix,
            self.next_id.fetch_add(1, Ordering::Relaxed)
        );
        let (sink, events) = mpsc::unbounded_channel();
        self.commands
            .send(Command::Subscribe {
                id: id.clone(),
                filters,
                sink,
            })
            .map_err(|_| Error::NotConnected)?;
        Ok(Subscription {
            id,
            events,
            commands: self.commands.clone(),
            active: true,
        })
    }

    /// Close a subscription by id. Unknown or already closed ids are ignored.
    pub fn unsubscribe(&self, id: &str) {
        let _ = self.commands.send(Command::Unsubscribe(id.to_string()));
    }
}

/// Receiving side of one subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: String,
    events: mpsc::UnboundedReceiver<SubscriptionEvent>,
    commands: mpsc::UnboundedSender<Command>,
    active: bool,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next delivery, or `None` once the subscription has ended.
    pub async fn next(&mut self) -> Option<SubscriptionEvent> {
        self.events.recv().await
    }

    /// Send `CLOSE` and stop receiving. Safe to call more than once.
    pub fn unsubscribe(&mut self) {
        if self.active {
            self.active = false;
            let _ = self.commands.send(Command::Unsubscribe(self.id.clone()));
            self.events.close();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.active)
            .finish()
    }
}

struct Entry {
    filters: Vec<Filter>,
    sink: mpsc::UnboundedSender<SubscriptionEvent>,
    delivered: Seen,
    eose: bool,
}

/// Bounded set of delivered event ids, evicting the oldest first.
struct Seen {
    ids: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl Seen {
    fn new(capacity: usize) -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    fn insert(&mut self, id: String) {
        if !self.ids.insert(id.clone()) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
    }
}

struct Dispatcher {
    connection: RelayConnection,
    verify_signatures: bool,
    dedup_capacity: usize,
    table: HashMap<String, Entry>,
    /// Set once the connection has ended; new subscriptions fail with it.
    terminal: Option<Error>,
}

impl Dispatcher {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut notifications: mpsc::UnboundedReceiver<RelayNotification>,
    ) {
        let mut listening = true;
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                n = notifications.recv(), if listening => match n {
                    Some(n) => self.handle_notification(n),
                    None => listening = false,
                },
            }
        }
        debug!(relay = %self.connection.url(), "subscription dispatcher stopped");
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Subscribe { id, filters, sink } => {
                if let Some(err) = &self.terminal {
                    let _ = sink.send(SubscriptionEvent::Failed(err.clone()));
                    return;
                }
                let req = ClientMessage::Req {
                    subscription_id: id.clone(),
                    filters: filters.clone(),
                };
                self.table.insert(
                    id.clone(),
                    Entry {
                        filters,
                        sink,
                        delivered: Seen::new(self.dedup_capacity),
                        eose: false,
                    },
                );
                if let Err(e) = self.connection.send(req) {
                    if let Some(entry) = self.table.remove(&id) {
                        let _ = entry.sink.send(SubscriptionEvent::Failed(e));
                    }
                    return;
                }
                debug!(subscription = %id, "subscription opened");
            }
            Command::Unsubscribe(id) => {
                if self.table.remove(&id).is_some() {
                    let _ = self.connection.send(ClientMessage::Close(id.clone()));
                    debug!(subscription = %id, "subscription closed");
                }
            }
        }
    }

    fn handle_notification(&mut self, notification: RelayNotification) {
        match notification {
            RelayNotification::Frame(frame) => self.handle_frame(frame),
            RelayNotification::Error(err) => self.fail_all(err),
            RelayNotification::Closed => self.fail_all(Error::NotConnected),
        }
    }

    fn handle_frame(&mut self, frame: RelayMessage) {
        match frame {
            RelayMessage::Event {
                subscription_id,
                event,
            } => self.dispatch_event(subscription_id, event),
            RelayMessage::EndOfStoredEvents(sub) => {
                if let Some(entry) = self.table.get_mut(&sub) {
                    if !entry.eose {
                        entry.eose = true;
                        let _ = entry.sink.send(SubscriptionEvent::EndOfStoredEvents);
                    }
                }
            }
            RelayMessage::Closed {
                subscription_id,
                message,
            } => {
                if let Some(entry) = self.table.remove(&subscription_id) {
                    info!(
                        subscription = %subscription_id,
                        reason = %message,
                        "relay closed subscription"
                    );
                    let _ = entry.sink.send(SubscriptionEvent::Closed(message));
                }
            }
            RelayMessage::Notice(message) => {
                info!(relay = %self.connection.url(), notice = %message, "relay notice");
            }
            RelayMessage::Ok { .. } => {}
        }
    }

    fn dispatch_event(&mut self, sub: String, event: Event) {
        let Some(entry) = self.table.get_mut(&sub) else {
            trace!(subscription = %sub, "event for unknown subscription");
            return;
        };
        if entry.delivered.contains(&event.id) {
            trace!(subscription = %sub, event = %event.id, "duplicate event");
            return;
        }
        if !entry.filters.iter().any(|f| f.matches(&event)) {
            warn!(
                subscription = %sub,
                event = %event.id,
                "event does not match subscription filter; dropping"
            );
            return;
        }
        if self.verify_signatures {
            if let Err(e) = signer::verify_event(&event) {
                warn!(
                    subscription = %sub,
                    event = %event.id,
                    error = %e,
                    "event failed verification; dropping"
                );
                return;
            }
        }
        // Only record ids of events that passed the checks, so a forged copy
        // cannot shadow the genuine event.
        entry.delivered.insert(event.id.clone());
        if entry.sink.send(SubscriptionEvent::Event(event)).is_err() {
            self.table.remove(&sub);
            let _ = self.connection.send(ClientMessage::Close(sub));
        }
    }

    fn fail_all(&mut self, err: Error) {
        for (id, entry) in self.table.drain() {
            debug!(subscription = %id, error = %err, "failing subscription");
            let _ = entry.sink.send(SubscriptionEvent::Failed(err.clone()));
        }
        self.terminal = Some(err);
    }
}
