//! Scripted loopback relay shared by the integration tests.

#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use secp256k1::{Keypair, Message, Secp256k1};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::net::TcpListener;
use tokio_tungstenite::{accept_async, tungstenite::Message as TMsg};

/// Start a relay that answers every inbound frame with whatever `handler`
/// returns. Each accepted connection gets its own copy of the handler.
pub async fn start_relay<F>(handler: F) -> String
where
    F: FnMut(&Value) -> Vec<Value> + Clone + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let mut handler = handler.clone();
            tokio::spawn(async move {
                let Ok(mut ws) = accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(msg)) = ws.next().await {
                    let TMsg::Text(txt) = msg else { continue };
                    let Ok(frame) = serde_json::from_str::<Value>(&txt) else {
                        continue;
                    };
                    for reply in handler(&frame) {
                        if ws.send(TMsg::Text(reply.to_string())).await.is_err() {
                            return;
                        }
                    }
                }
            });
        }
    });
    url
}

/// Accept every `EVENT` and answer every `REQ` with `stored` then `EOSE`.
pub fn storing_relay(
    stored: Vec<Value>,
) -> impl FnMut(&Value) -> Vec<Value> + Clone + Send + 'static {
    move |frame: &Value| match frame[0].as_str() {
        Some("EVENT") => vec![json!(["OK", frame[1]["id"], true, ""])],
        Some("REQ") => {
            let sub = frame[1].clone();
            let mut out: Vec<Value> = stored
                .iter()
                .map(|ev| json!(["EVENT", sub, ev]))
                .collect();
            out.push(json!(["EOSE", sub]));
            out
        }
        _ => vec![],
    }
}

/// Build a signed event JSON with raw secp256k1, independent of the crate.
pub fn signed_event_json(
    secret: [u8; 32],
    kind: u32,
    tags: Vec<Vec<String>>,
    content: &str,
) -> Value {
    let secp = Secp256k1::new();
    let kp = Keypair::from_seckey_slice(&secp, &secret).unwrap();
    let pubkey = hex::encode(kp.x_only_public_key().0.serialize());
    let created_at = 1700000000u64;
    let arr = json!([0, pubkey, created_at, kind, tags, content]);
    let data = serde_json::to_vec(&arr).unwrap();
    let hash = Sha256::digest(&data);
    let id = hex::encode(hash);
    let msg = Message::from_digest_slice(&hash).unwrap();
    let sig = secp.sign_schnorr_no_aux_rand(&msg, &kp);
    json!({
        "id": id,
        "pubkey": pubkey,
        "kind": kind,
        "created_at": created_at,
        "tags": tags,
        "content": content,
        "sig": hex::encode(sig.as_ref()),
    })
}

pub fn pubkey_hex(secret: [u8; 32]) -> String {
    let secp = Secp256k1::new();
    let kp = Keypair::from_seckey_slice(&secp, &secret).unwrap();
    hex::encode(kp.x_only_public_key().0.serialize())
}
