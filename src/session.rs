//! Order correlation state machine.
//!
//! ```text
//! Draft -> Signed -> Published -> AwaitingConfirmation -> Confirmed
//!                                                      -> TimedOut
//!      (any non-terminal state)                        -> Failed
//! ```
//!
//! Every transition goes through one mutex-guarded step that refuses to leave
//! a terminal state, so a confirmation racing a cancellation or a timeout
//! yields exactly one outcome.

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::{
    sync::{mpsc, watch, Notify},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{Error, Result},
    event::{unix_now, Event, EventBuilder, Tag},
    filter::Filter,
    keys::KeyMaterialProvider,
    message::{ClientMessage, RelayMessage},
    order::{Confirmation, Kinds, NewOrder},
    relay::RelayNotification,
    signer,
    subscription::{Subscription, SubscriptionEvent, SubscriptionManager},
};

pub const DEFAULT_CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Draft,
    Signed,
    Published,
    AwaitingConfirmation,
    Confirmed,
    Failed,
    TimedOut,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Confirmed | SessionState::Failed | SessionState::TimedOut
        )
    }
}

/// State-change notification for observers.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionUpdate {
    pub state: SessionState,
    /// Set when `state` is `Confirmed`.
    pub confirmation: Option<Confirmation>,
    /// Set when `state` is `Failed` or `TimedOut`.
    pub error: Option<Error>,
}

impl SessionUpdate {
    fn plain(state: SessionState) -> Self {
        Self {
            state,
            confirmation: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub kinds: Kinds,
    pub confirmation_timeout: Duration,
    /// Only accept confirmations signed by this pubkey.
    pub confirmation_author: Option<String>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            kinds: Kinds::default(),
            confirmation_timeout: DEFAULT_CONFIRMATION_TIMEOUT,
            confirmation_author: None,
        }
    }
}

struct Status {
    current: SessionUpdate,
    history: Vec<SessionState>,
}

struct Shared {
    local_id: String,
    status: Mutex<Status>,
    updates: watch::Sender<SessionUpdate>,
    cancel: Notify,
}

impl Shared {
    /// Apply `next` unless a terminal state was already reached.
    fn transition(&self, next: SessionUpdate) -> bool {
        let mut status = self.status.lock();
        if status.current.state.is_terminal() {
            debug!(order = %self.local_id, ignored = ?next.state, "session already finished");
            return false;
        }
        if next.state.is_terminal() {
            info!(
                order = %self.local_id,
                state = ?next.state,
                error = ?next.error,
                "order session finished"
            );
        } else {
            debug!(order = %self.local_id, state = ?next.state, "order session transition");
        }
        status.history.push(next.state);
        status.current = next.clone();
        self.updates.send_replace(next);
        true
    }

    fn fail(&self, err: Error) -> bool {
        self.transition(SessionUpdate {
            state: SessionState::Failed,
            confirmation: None,
            error: Some(err),
        })
    }

    fn cancel(&self) {
        self.fail(Error::Cancelled);
        self.cancel.notify_one();
    }
}

/// Cancels a session from another task.
#[derive(Clone)]
pub struct CancelHandle(Arc<Shared>);

impl CancelHandle {
    /// Move the session to `Failed(Cancelled)`. Idempotent; a no-op once the
    /// session has finished.
    pub fn cancel(&self) {
        self.0.cancel();
    }
}

/// One order from signing to its confirmation (or lack of one).
///
/// Dropping a session that is still waiting cancels it.
pub struct OrderSession {
    order: NewOrder,
    options: SessionOptions,
    event: Option<Event>,
    shared: Arc<Shared>,
    waiter: Option<JoinHandle<()>>,
}

impl OrderSession {
    pub fn new(order: NewOrder, options: SessionOptions) -> Self {
        let initial = SessionUpdate::plain(SessionState::Draft);
        let (updates, _) = watch::channel(initial.clone());
        let shared = Arc::new(Shared {
            local_id: Uuid::new_v4().to_string(),
            status: Mutex::new(Status {
                current: initial,
                history: vec![SessionState::Draft],
            }),
            updates,
            cancel: Notify::new(),
        });
        Self {
            order,
            options,
            event: None,
            shared,
            waiter: None,
        }
    }

    /// Caller-side order id, published as the `d` tag.
    pub fn local_id(&self) -> &str {
        &self.shared.local_id
    }

    pub fn order(&self) -> &NewOrder {
        &self.order
    }

    /// The signed order event, once signing succeeded.
    pub fn event(&self) -> Option<&Event> {
        self.event.as_ref()
    }

    pub fn state(&self) -> SessionState {
        self.shared.status.lock().current.state
    }

    pub fn current(&self) -> SessionUpdate {
        self.shared.status.lock().current.clone()
    }

    /// Every state entered so far, in order.
    pub fn history(&self) -> Vec<SessionState> {
        self.shared.status.lock().history.clone()
    }

    /// Watch the latest state.
    ///
    /// The channel keeps only the most recent update, so an observer can miss
    /// short-lived states such as `Published`. [`OrderSession::history`] has
    /// the full trace.
    pub fn updates(&self) -> watch::Receiver<SessionUpdate> {
        self.shared.updates.subscribe()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(self.shared.clone())
    }

    pub fn cancel(&self) {
        self.shared.cancel();
    }

    /// Build and sign the order event with the current time.
    pub fn sign(&mut self, provider: &dyn KeyMaterialProvider) -> Result<&Event> {
        self.sign_at(provider, unix_now())
    }

    /// Build and sign the order event. On error the session stays `Draft`.
    pub fn sign_at(
        &mut self,
        provider: &dyn KeyMaterialProvider,
        created_at: u64,
    ) -> Result<&Event> {
        if self.state() != SessionState::Draft {
            return Err(Error::validation("only a draft session can be signed"));
        }
        if let Some(author) = &self.options.confirmation_author {
            Filter::new().author(author.clone()).validate()?;
        }
        let pubkey = provider
            .public_identifier()
            .ok_or_else(|| Error::crypto("no public identifier available"))?;
        let content = self.order.to_content(created_at)?;
        let unsigned = EventBuilder::new(self.options.kinds.order, content)
            .tag(Tag::identifier(self.local_id()))
            .created_at(created_at)
            .build(pubkey);
        let event = signer::sign_event(unsigned, provider)?;
        if !self.shared.transition(SessionUpdate::plain(SessionState::Signed)) {
            return Err(Error::Cancelled);
        }
        Ok(self.event.insert(event))
    }

    /// Publish the signed event and start waiting for its confirmation.
    ///
    /// The correlation filter is validated before anything is sent; a bad one
    /// leaves the session `Signed`. The `EVENT` and the correlation `REQ` are
    /// then both queued before anything waits on the relay. A local send
    /// failure moves the session to `Failed` and is returned.
    pub fn publish(&mut self, manager: &SubscriptionManager) -> Result<()> {
        let event = match (self.state(), &self.event) {
            (SessionState::Signed, Some(ev)) => ev.clone(),
            (SessionState::Failed, _) => return Err(Error::Cancelled),
            _ => return Err(Error::validation("session must be signed before publishing")),
        };
        let filter = self.correlation_filter(&event.id);
        filter.validate()?;
        let connection = manager.connection();
        // Listen before sending so the relay's OK cannot slip past.
        let frames = connection.listen();
        if let Err(e) = connection.send(ClientMessage::Event(event.clone())) {
            self.shared.fail(e.clone());
            return Err(e);
        }
        self.shared
            .transition(SessionUpdate::plain(SessionState::Published));

        let subscription = match manager.subscribe(filter) {
            Ok(sub) => sub,
            Err(e) => {
                self.shared.fail(e.clone());
                return Err(e);
            }
        };
        if !self
            .shared
            .transition(SessionUpdate::plain(SessionState::AwaitingConfirmation))
        {
            // Cancelled in the meantime; dropping the subscription releases it.
            return Ok(());
        }
        self.waiter = Some(tokio::spawn(await_confirmation(
            self.shared.clone(),
            subscription,
            frames,
            event.id,
            self.options.confirmation_timeout,
        )));
        Ok(())
    }

    /// Confirmations reference the order via `e`, optionally from one author.
    fn correlation_filter(&self, event_id: &str) -> Filter {
        let filter = Filter::new()
            .kind(self.options.kinds.confirmation)
            .event_ref(event_id);
        match &self.options.confirmation_author {
            Some(author) => filter.author(author.clone()),
            None => filter,
        }
    }

    /// Resolve with the terminal update.
    ///
    /// Only returns once the session finishes, so call it after `publish` (or
    /// after a failure/cancel).
    pub async fn wait(&self) -> SessionUpdate {
        let mut rx = self.shared.updates.subscribe();
        let result = rx.wait_for(|u| u.state.is_terminal()).await;
        match result {
            Ok(update) => update.clone(),
            Err(_) => self.current(),
        }
    }
}

impl Drop for OrderSession {
    fn drop(&mut self) {
        if self.waiter.is_some() && !self.state().is_terminal() {
            self.shared.cancel();
        }
    }
}

impl std::fmt::Debug for OrderSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderSession")
            .field("local_id", &self.shared.local_id)
            .field("state", &self.state())
            .field("event_id", &self.event.as_ref().map(|e| &e.id))
            .finish()
    }
}

async fn await_confirmation(
    shared: Arc<Shared>,
    mut subscription: Subscription,
    mut frames: mpsc::UnboundedReceiver<RelayNotification>,
    event_id: String,
    budget: Duration,
) {
    let deadline = tokio::time::sleep(budget);
    tokio::pin!(deadline);
    let mut frames_open = true;
    loop {
        tokio::select! {
            _ = shared.cancel.notified() => break,
            _ = &mut deadline => {
                shared.transition(SessionUpdate {
                    state: SessionState::TimedOut,
                    confirmation: None,
                    error: Some(Error::Timeout(budget)),
                });
                break;
            }
            delivery = subscription.next() => match delivery {
                Some(SubscriptionEvent::Event(ev)) => match Confirmation::from_event(&ev) {
                    Ok(confirmation) => {
                        shared.transition(SessionUpdate {
                            state: SessionState::Confirmed,
                            confirmation: Some(confirmation),
                            error: None,
                        });
                        break;
                    }
                    Err(e) => {
                        warn!(
                            order = %shared.local_id,
                            event = %ev.id,
                            error = %e,
                            "ignoring unreadable confirmation"
                        );
                    }
                },
                Some(SubscriptionEvent::EndOfStoredEvents) => {}
                Some(SubscriptionEvent::Closed(reason)) => {
                    shared.fail(Error::protocol(format!(
                        "relay closed the confirmation subscription: {reason}"
                    )));
                    break;
                }
                Some(SubscriptionEvent::Failed(e)) => {
                    shared.fail(e);
                    break;
                }
                None => {
                    shared.fail(Error::NotConnected);
                    break;
                }
            },
            notification = frames.recv(), if frames_open => match notification {
                Some(RelayNotification::Frame(RelayMessage::Ok { event_id: id, accepted, message }))
                    if id == event_id =>
                {
                    if accepted {
                        debug!(order = %shared.local_id, "relay accepted order event");
                    } else {
                        shared.fail(Error::Rejected { event_id: id, reason: message });
                        break;
                    }
                }
                Some(RelayNotification::Error(e)) => {
                    shared.fail(e);
                    break;
                }
                Some(_) => {}
                None => frames_open = false,
            },
        }
    }
    subscription.unsubscribe();
}
