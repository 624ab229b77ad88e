mod common;

use std::{sync::Arc, time::Duration};

use common::{pubkey_hex, signed_event_json, start_relay};
use nostr_orders::{
    ConnectOptions, Error, Keys, ManagerOptions, NewOrder, OrderClient, OrderSide,
    SessionOptions, SessionState,
};
use serde_json::{json, Value};

const MOSTRO: [u8; 32] = [9u8; 32];
const IMPOSTOR: [u8; 32] = [8u8; 32];

/// Relay that acts as the order matcher: it accepts the order event and
/// answers the correlation REQ with confirmations from each of `signers`.
fn matcher(signers: Vec<[u8; 32]>) -> impl FnMut(&Value) -> Vec<Value> + Clone + Send + 'static {
    let mut last_order: Option<String> = None;
    move |frame: &Value| match frame[0].as_str() {
        Some("EVENT") => {
            last_order = frame[1]["id"].as_str().map(str::to_string);
            vec![json!(["OK", frame[1]["id"], true, ""])]
        }
        Some("REQ") => {
            let Some(order_id) = last_order.clone() else {
                return vec![];
            };
            let sub = frame[1].clone();
            let mut out = vec![json!(["EOSE", sub])];
            for signer in &signers {
                let confirmation = signed_event_json(
                    *signer,
                    38384,
                    vec![vec!["e".into(), order_id.clone()]],
                    r#"{"status":"confirmed"}"#,
                );
                out.push(json!(["EVENT", sub, confirmation]));
            }
            out
        }
        _ => vec![],
    }
}

async fn client(url: &str, options: SessionOptions) -> OrderClient {
    OrderClient::connect(
        url,
        ConnectOptions::default(),
        ManagerOptions::default(),
        Arc::new(Keys::from_hex(&"01".repeat(32)).unwrap()),
        options,
    )
    .await
    .unwrap()
}

fn order() -> NewOrder {
    NewOrder {
        side: OrderSide::Buy,
        amount: 100000,
        fiat_code: "ARS".into(),
        payment_method: "MercadoPago".into(),
        premium: 0.0,
    }
}

#[tokio::test]
async fn order_is_confirmed_end_to_end() {
    let url = start_relay(matcher(vec![MOSTRO])).await;
    let client = client(&url, SessionOptions::default()).await;
    let session = client.place_order(order()).unwrap();
    let update = tokio::time::timeout(Duration::from_secs(5), session.wait())
        .await
        .unwrap();
    assert_eq!(update.state, SessionState::Confirmed);
    let confirmation = update.confirmation.unwrap();
    assert_eq!(confirmation.status.as_deref(), Some("confirmed"));
    assert_eq!(
        session.history(),
        vec![
            SessionState::Draft,
            SessionState::Signed,
            SessionState::Published,
            SessionState::AwaitingConfirmation,
            SessionState::Confirmed,
        ]
    );
}

#[tokio::test]
async fn confirmations_from_other_authors_are_ignored() {
    let url = start_relay(matcher(vec![IMPOSTOR, MOSTRO])).await;
    let options = SessionOptions {
        confirmation_author: Some(pubkey_hex(MOSTRO)),
        ..SessionOptions::default()
    };
    let client = client(&url, options).await;
    let session = client.place_order(order()).unwrap();
    let update = tokio::time::timeout(Duration::from_secs(5), session.wait())
        .await
        .unwrap();
    assert_eq!(update.state, SessionState::Confirmed);

    let event = client
        .fetch_order(session.local_id(), Duration::from_millis(500))
        .await
        .unwrap();
    // The matcher relay stores nothing.
    assert!(event.is_none());
}

#[tokio::test]
async fn silent_relay_times_out() {
    let url = start_relay(matcher(vec![])).await;
    let budget = Duration::from_millis(200);
    let options = SessionOptions {
        confirmation_timeout: budget,
        ..SessionOptions::default()
    };
    let client = client(&url, options).await;
    let session = client.place_order(order()).unwrap();
    let update = tokio::time::timeout(Duration::from_secs(5), session.wait())
        .await
        .unwrap();
    assert_eq!(update.state, SessionState::TimedOut);
    assert_eq!(update.error, Some(Error::Timeout(budget)));
}

#[tokio::test]
async fn unreachable_relay_is_a_transport_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    drop(listener);
    let err = OrderClient::connect(
        &url,
        ConnectOptions::default(),
        ManagerOptions::default(),
        Arc::new(nostr_orders::NoKeys),
        SessionOptions::default(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::Transport(_)));
}
