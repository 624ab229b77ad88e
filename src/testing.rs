//! Loopback relay and fixtures for unit tests.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::{net::TcpListener, sync::mpsc, task::JoinHandle, time::timeout};
use tokio_tungstenite::{accept_async, tungstenite::Message as TMsg};

use crate::{
    event::{Event, EventBuilder, Tag},
    keys::Keys,
    message::{ClientMessage, RelayMessage},
    relay::RelayNotification,
    signer,
};

enum Script {
    Text(String),
    Drop,
}

/// Single-connection relay that records client frames and replays scripted ones.
pub(crate) struct MockRelay {
    pub url: String,
    received: mpsc::UnboundedReceiver<ClientMessage>,
    outgoing: mpsc::UnboundedSender<Script>,
    handle: JoinHandle<()>,
}

impl MockRelay {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (in_tx, received) = mpsc::unbounded_channel();
        let (outgoing, mut out_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            loop {
                tokio::select! {
                    msg = ws.next() => match msg {
                        Some(Ok(TMsg::Text(txt))) => {
                            if let Ok(m) = ClientMessage::from_json(&txt) {
                                let _ = in_tx.send(m);
                            }
                        }
                        Some(Ok(TMsg::Close(_))) | Some(Err(_)) | None => break,
                        Some(Ok(_)) => {}
                    },
                    out = out_rx.recv() => match out {
                        Some(Script::Text(t)) => {
                            if ws.send(TMsg::Text(t)).await.is_err() {
                                break;
                            }
                        }
                        Some(Script::Drop) | None => break,
                    }
                }
            }
        });
        Self {
            url,
            received,
            outgoing,
            handle,
        }
    }

    pub fn push(&self, msg: RelayMessage) {
        self.push_raw(&msg.as_json());
    }

    pub fn push_raw(&self, text: &str) {
        let _ = self.outgoing.send(Script::Text(text.to_string()));
    }

    /// Drop the socket without a close handshake.
    pub fn drop_connection(&self) {
        let _ = self.outgoing.send(Script::Drop);
    }

    /// Next frame the client sent.
    pub async fn recv(&mut self) -> ClientMessage {
        timeout(Duration::from_secs(2), self.received.recv())
            .await
            .expect("relay waited too long for a client frame")
            .expect("relay connection ended")
    }

    /// Next frame the client sent within `wait`, if any.
    pub async fn try_recv(&mut self, wait: Duration) -> Option<ClientMessage> {
        timeout(wait, self.received.recv()).await.ok().flatten()
    }

    /// Next `REQ`, returning its subscription id.
    pub async fn recv_req(&mut self) -> String {
        match self.recv().await {
            ClientMessage::Req {
                subscription_id, ..
            } => subscription_id,
            other => panic!("expected REQ, got {other:?}"),
        }
    }
}

impl Drop for MockRelay {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub(crate) async fn recv_notification(
    rx: &mut mpsc::UnboundedReceiver<RelayNotification>,
) -> Option<RelayNotification> {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("no notification within 2s")
}

pub(crate) fn test_keys() -> Keys {
    Keys::from_hex(&"01".repeat(32)).unwrap()
}

pub(crate) fn signed_event(keys: &Keys, kind: u32, tags: Vec<Tag>, content: &str) -> Event {
    let unsigned = EventBuilder::new(kind, content)
        .tags(tags)
        .created_at(1700000000)
        .build(keys.public_key_hex());
    signer::sign_event(unsigned, keys).unwrap()
}
