//! Client-side engine for publishing P2P orders over Nostr relays and tracking
//! their confirmation.
//!
//! Events are built and signed locally ([`event`], [`signer`]), sent over one
//! WebSocket per relay ([`relay`]), and correlated with replies through
//! filtered subscriptions ([`subscription`], [`session`]).

pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod filter;
pub mod keys;
pub mod message;
pub mod order;
pub mod relay;
pub mod session;
pub mod signer;
pub mod subscription;

#[cfg(test)]
mod testing;

pub use client::OrderClient;
pub use error::{Error, Result};
pub use event::{Event, EventBuilder, Tag, UnsignedEvent};
pub use filter::Filter;
pub use keys::{KeyMaterialProvider, Keys, NoKeys};
pub use message::{ClientMessage, RelayMessage};
pub use order::{Confirmation, Kinds, NewOrder, OrderListing, OrderSide};
pub use relay::{ConnectOptions, ConnectionState, RelayConnection, RelayNotification};
pub use session::{CancelHandle, OrderSession, SessionOptions, SessionState, SessionUpdate};
pub use subscription::{ManagerOptions, Subscription, SubscriptionEvent, SubscriptionManager};
