//! High-level order client over a single relay connection.

use std::{sync::Arc, time::Duration};

use tracing::{debug, info, warn};

use crate::{
    error::{Error, Result},
    event::{Event, EventBuilder},
    filter::Filter,
    keys::KeyMaterialProvider,
    message::{ClientMessage, RelayMessage},
    order::{Kinds, NewOrder, OrderListing},
    relay::{ConnectOptions, RelayConnection, RelayNotification},
    session::{OrderSession, SessionOptions},
    signer,
    subscription::{ManagerOptions, SubscriptionEvent, SubscriptionManager},
};

pub struct OrderClient {
    manager: SubscriptionManager,
    keys: Arc<dyn KeyMaterialProvider>,
    options: SessionOptions,
}

impl OrderClient {
    pub fn new(
        manager: SubscriptionManager,
        keys: Arc<dyn KeyMaterialProvider>,
        options: SessionOptions,
    ) -> Self {
        Self {
            manager,
            keys,
            options,
        }
    }

    /// Open a connection to `url` and wrap it.
    pub async fn connect(
        url: &str,
        connect: ConnectOptions,
        manager: ManagerOptions,
        keys: Arc<dyn KeyMaterialProvider>,
        options: SessionOptions,
    ) -> Result<Self> {
        let connection = RelayConnection::connect(url, connect).await?;
        Ok(Self::new(
            SubscriptionManager::new(connection, manager),
            keys,
            options,
        ))
    }

    pub fn manager(&self) -> &SubscriptionManager {
        &self.manager
    }

    pub fn kinds(&self) -> Kinds {
        self.options.kinds
    }

    /// Sign and publish `order`; the returned session tracks its confirmation.
    pub fn place_order(&self, order: NewOrder) -> Result<OrderSession> {
        let mut session = OrderSession::new(order, self.options.clone());
        session.sign(self.keys.as_ref())?;
        session.publish(&self.manager)?;
        info!(order = %session.local_id(), "order published");
        Ok(session)
    }

    /// Stored orders, newest first.
    pub async fn list_orders(&self, limit: usize, wait: Duration) -> Result<Vec<OrderListing>> {
        let filter = Filter::new().kind(self.options.kinds.order).limit(limit);
        let events = self.collect(filter, wait, false).await?;
        let mut listings: Vec<OrderListing> = events.iter().map(OrderListing::from_event).collect();
        listings.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.event_id.cmp(&b.event_id))
        });
        Ok(listings)
    }

    /// Look up one order by its `d` tag.
    pub async fn fetch_order(&self, order_id: &str, wait: Duration) -> Result<Option<Event>> {
        let filter = Filter::new()
            .kind(self.options.kinds.order)
            .identifier(order_id);
        Ok(self.collect(filter, wait, true).await?.into_iter().next())
    }

    /// Sign a text note and publish it, waiting for the relay to accept it.
    pub async fn publish_note(&self, text: &str, wait: Duration) -> Result<Event> {
        let pubkey = self
            .keys
            .public_identifier()
            .ok_or_else(|| Error::crypto("no public identifier available"))?;
        let unsigned = EventBuilder::new(self.options.kinds.note, text).build(pubkey);
        let event = signer::sign_event(unsigned, self.keys.as_ref())?;
        self.publish(&event, wait).await?;
        Ok(event)
    }

    /// Send `event` and wait for the relay's `OK`.
    pub async fn publish(&self, event: &Event, wait: Duration) -> Result<()> {
        let connection = self.manager.connection();
        let mut frames = connection.listen();
        connection.send(ClientMessage::Event(event.clone()))?;
        let answer = async {
            while let Some(notification) = frames.recv().await {
                match notification {
                    RelayNotification::Frame(RelayMessage::Ok {
                        event_id,
                        accepted,
                        message,
                    }) if event_id == event.id => {
                        if accepted {
                            debug!(event = %event_id, "relay accepted event");
                            return Ok(());
                        }
                        return Err(Error::Rejected {
                            event_id,
                            reason: message,
                        });
                    }
                    RelayNotification::Error(e) => return Err(e),
                    RelayNotification::Closed => return Err(Error::NotConnected),
                    RelayNotification::Frame(_) => {}
                }
            }
            Err(Error::NotConnected)
        };
        tokio::time::timeout(wait, answer)
            .await
            .map_err(|_| Error::Timeout(wait))?
    }

    pub fn close(&self) {
        self.manager.connection().close();
    }

    /// Gather events for `filter` until EOSE or `wait` elapses.
    async fn collect(
        &self,
        filter: Filter,
        wait: Duration,
        first_only: bool,
    ) -> Result<Vec<Event>> {
        let mut sub = self.manager.subscribe(filter)?;
        let mut events = Vec::new();
        let deadline = tokio::time::sleep(wait);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => {
                    debug!(
                        sub = %sub.id(),
                        received = events.len(),
                        "stopped waiting for stored events"
                    );
                    break;
                }
                delivery = sub.next() => match delivery {
                    Some(SubscriptionEvent::Event(ev)) => {
                        events.push(ev);
                        if first_only {
                            break;
                        }
                    }
                    Some(SubscriptionEvent::EndOfStoredEvents) => break,
                    Some(SubscriptionEvent::Closed(reason)) => {
                        warn!(sub = %sub.id(), %reason, "relay closed query");
                        return Err(Error::protocol(format!("relay closed subscription: {reason}")));
                    }
                    Some(SubscriptionEvent::Failed(e)) => return Err(e),
                    None => return Err(Error::NotConnected),
                }
            }
        }
        sub.unsubscribe();
        Ok(events)
    }
}

impl std::fmt::Debug for OrderClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderClient")
            .field("relay", &self.manager.connection().url())
            .field("kinds", &self.options.kinds)
            .finish()
    }
}
