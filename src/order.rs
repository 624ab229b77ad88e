//! Order payloads carried in event content.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::{Error, Result},
    event::Event,
};

/// Injectable protocol kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Kinds {
    /// Order listings.
    pub order: u32,
    /// Confirmations/responses referencing an order via `e`.
    pub confirmation: u32,
    /// Plain text notes.
    pub note: u32,
}

impl Default for Kinds {
    fn default() -> Self {
        Self {
            order: 38383,
            confirmation: 38384,
            note: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        })
    }
}

impl FromStr for OrderSide {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "buy" => Ok(OrderSide::Buy),
            "sell" => Ok(OrderSide::Sell),
            other => Err(Error::validation(format!(
                "order side must be buy or sell, got {other:?}"
            ))),
        }
    }
}

/// What the user asked for.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOrder {
    pub side: OrderSide,
    /// Amount in `fiat_code` units.
    pub amount: u64,
    pub fiat_code: String,
    pub payment_method: String,
    /// Percentage over/under market price.
    pub premium: f64,
}

impl NewOrder {
    pub fn validate(&self) -> Result<()> {
        if self.amount == 0 {
            return Err(Error::validation("order amount must be positive"));
        }
        if self.fiat_code.len() != 3 || !self.fiat_code.bytes().all(|b| b.is_ascii_uppercase()) {
            return Err(Error::validation(format!(
                "fiat code must be three uppercase letters, got {:?}",
                self.fiat_code
            )));
        }
        if self.payment_method.trim().is_empty() {
            return Err(Error::validation("payment method is required"));
        }
        if !self.premium.is_finite() {
            return Err(Error::validation("premium must be a finite number"));
        }
        Ok(())
    }

    /// Serialize the content of the order listing event.
    pub fn to_content(&self, created_at: u64) -> Result<String> {
        self.validate()?;
        let envelope = vec![OrderEnvelope {
            order: OrderMessage {
                version: 1,
                action: "new-order".into(),
                trade_index: 1,
                payload: OrderPayload {
                    order: SmallOrder {
                        kind: self.side,
                        status: "pending".into(),
                        // Zero sats means the price floats with the market.
                        amount: 0,
                        fiat_code: self.fiat_code.clone(),
                        fiat_amount: self.amount,
                        payment_method: self.payment_method.clone(),
                        premium: self.premium,
                        created_at,
                    },
                },
            },
        }];
        serde_json::to_string(&envelope).map_err(|e| Error::validation(e.to_string()))
    }
}

/// One element of the content array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderEnvelope {
    pub order: OrderMessage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderMessage {
    pub version: u8,
    pub action: String,
    pub trade_index: u32,
    pub payload: OrderPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPayload {
    pub order: SmallOrder,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmallOrder {
    pub kind: OrderSide,
    pub status: String,
    /// Sats; zero for market-priced orders.
    pub amount: u64,
    pub fiat_code: String,
    pub fiat_amount: u64,
    pub payment_method: String,
    pub premium: f64,
    pub created_at: u64,
}

/// Parsed content of a confirmation event.
#[derive(Debug, Clone, PartialEq)]
pub struct Confirmation {
    /// Id of the confirmation event itself.
    pub event_id: String,
    /// Top-level `status` field when the payload is an object carrying one.
    pub status: Option<String>,
    pub payload: Value,
}

impl Confirmation {
    pub fn from_event(ev: &Event) -> Result<Self> {
        let payload: Value = serde_json::from_str(&ev.content)
            .map_err(|e| Error::validation(format!("confirmation content is not JSON: {e}")))?;
        let status = payload
            .get("status")
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(Self {
            event_id: ev.id.clone(),
            status,
            payload,
        })
    }
}

/// An order as seen in a listing subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderListing {
    /// The `d` tag, if the event carries one.
    pub order_id: Option<String>,
    pub event_id: String,
    pub author: String,
    pub created_at: u64,
    /// Decoded order when the content uses the envelope format.
    pub order: Option<SmallOrder>,
}

impl OrderListing {
    pub fn from_event(ev: &Event) -> Self {
        let order = serde_json::from_str::<Vec<OrderEnvelope>>(&ev.content)
            .ok()
            .and_then(|msgs| msgs.into_iter().next())
            .map(|env| env.order.payload.order);
        Self {
            order_id: ev.identifier().map(str::to_string),
            event_id: ev.id.clone(),
            author: ev.pubkey.clone(),
            created_at: ev.created_at,
            order,
        }
    }
}
