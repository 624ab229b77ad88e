//! BIP-340 Schnorr signing and verification over event ids.
//!
//! Every signature in the system is a 64-byte BIP-340 Schnorr signature over
//! the 32-byte event id. This is the scheme NIP-01 relays verify.

use secp256k1::{schnorr::Signature, Keypair, Message, SecretKey, XOnlyPublicKey, SECP256K1};

use crate::{
    error::{Error, Result},
    event::{Event, UnsignedEvent},
    keys::KeyMaterialProvider,
};

fn decode_digest(id: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(id).map_err(|e| Error::crypto(format!("id is not hex: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| Error::crypto("id must be 32 bytes"))
}

/// Sign a hex event id, returning the hex signature.
pub fn sign(id: &str, key: &SecretKey) -> Result<String> {
    let digest = decode_digest(id)?;
    let keypair = Keypair::from_secret_key(SECP256K1, key);
    let msg = Message::from_digest(digest);
    let sig = SECP256K1.sign_schnorr_with_rng(&msg, &keypair, &mut rand::thread_rng());
    Ok(hex::encode(sig.as_ref()))
}

/// Check a hex signature against a hex id and hex x-only pubkey.
///
/// Malformed inputs verify as `false`.
pub fn verify(id: &str, sig: &str, pubkey: &str) -> bool {
    check(id, sig, pubkey).is_ok()
}

fn check(id: &str, sig: &str, pubkey: &str) -> Result<()> {
    let digest = decode_digest(id)?;
    let sig_bytes = hex::decode(sig).map_err(|e| Error::crypto(format!("sig is not hex: {e}")))?;
    let pk_bytes =
        hex::decode(pubkey).map_err(|e| Error::crypto(format!("pubkey is not hex: {e}")))?;
    let sig = Signature::from_slice(&sig_bytes)?;
    let pk = XOnlyPublicKey::from_slice(&pk_bytes)?;
    SECP256K1.verify_schnorr(&sig, &Message::from_digest(digest), &pk)?;
    Ok(())
}

/// Sign an unsigned event with the provider's key.
///
/// The provider's identifier, the key's own public key and the event's pubkey
/// must all agree, otherwise the resulting event could never verify.
pub fn sign_event(unsigned: UnsignedEvent, provider: &dyn KeyMaterialProvider) -> Result<Event> {
    let key = provider
        .signing_key()
        .ok_or_else(|| Error::crypto("no signing key available"))?;
    let derived = hex::encode(
        Keypair::from_secret_key(SECP256K1, &key)
            .x_only_public_key()
            .0
            .serialize(),
    );
    if let Some(advertised) = provider.public_identifier() {
        if advertised != derived {
            return Err(Error::crypto("public identifier does not match signing key"));
        }
    }
    if unsigned.pubkey != derived {
        return Err(Error::crypto("event pubkey does not match signing key"));
    }
    let sig = sign(&unsigned.id, &key)?;
    Ok(unsigned.into_signed(sig))
}

/// Verify an event's id and Schnorr signature.
pub fn verify_event(ev: &Event) -> Result<()> {
    ev.verify_id()?;
    check(&ev.id, &ev.sig, &ev.pubkey)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        event::{EventBuilder, Tag},
        keys::{Keys, NoKeys},
    };
    use secp256k1::Secp256k1;

    fn keys() -> Keys {
        Keys::from_hex(&"01".repeat(32)).unwrap()
    }

    fn signed(keys: &Keys) -> Event {
        let unsigned = EventBuilder::new(38383, "payload")
            .tag(Tag::identifier("d1"))
            .created_at(1700000000)
            .build(keys.public_key_hex());
        sign_event(unsigned, keys).unwrap()
    }

    fn flip_hex_bit(s: &str, byte: usize) -> String {
        let mut bytes = hex::decode(s).unwrap();
        bytes[byte] ^= 0x01;
        hex::encode(bytes)
    }

    #[test]
    fn signed_events_verify() {
        let keys = keys();
        let ev = signed(&keys);
        assert_eq!(ev.sig.len(), 128);
        assert!(verify(&ev.id, &ev.sig, &ev.pubkey));
        verify_event(&ev).unwrap();
    }

    #[test]
    fn flipped_bits_fail_verification() {
        let ev = signed(&keys());
        for byte in [0, 17, 63] {
            assert!(!verify(&ev.id, &flip_hex_bit(&ev.sig, byte), &ev.pubkey));
        }
        for byte in [0, 31] {
            assert!(!verify(&flip_hex_bit(&ev.id, byte), &ev.sig, &ev.pubkey));
        }
    }

    #[test]
    fn tampered_event_fails_on_id_first() {
        let mut ev = signed(&keys());
        ev.created_at += 1;
        assert!(matches!(verify_event(&ev), Err(Error::Crypto(m)) if m.contains("id mismatch")));
    }

    #[test]
    fn malformed_inputs_verify_false() {
        let ev = signed(&keys());
        assert!(!verify("nothex", &ev.sig, &ev.pubkey));
        assert!(!verify(&ev.id, "abcd", &ev.pubkey));
        assert!(!verify(&ev.id, &ev.sig, "00"));
    }

    #[test]
    fn missing_key_is_crypto_error() {
        let unsigned = EventBuilder::new(1, "").created_at(1).build("ab".repeat(32));
        assert!(matches!(sign_event(unsigned, &NoKeys), Err(Error::Crypto(_))));
    }

    #[test]
    fn pubkey_mismatch_is_rejected() {
        let keys = keys();
        let other = Keys::from_hex(&"02".repeat(32)).unwrap();
        let unsigned = EventBuilder::new(1, "").created_at(1).build(other.public_key_hex());
        assert!(matches!(sign_event(unsigned, &keys), Err(Error::Crypto(_))));
    }

    #[test]
    fn verifies_signatures_without_aux_rand() {
        // Signatures produced by other clients (no aux randomness) verify too.
        let secp = Secp256k1::new();
        let kp = Keypair::from_seckey_slice(&secp, &[1u8; 32]).unwrap();
        let pubkey = hex::encode(kp.x_only_public_key().0.serialize());
        let unsigned = EventBuilder::new(1, "").created_at(1).build(pubkey);
        let msg = Message::from_digest(unsigned.digest());
        let sig = secp.sign_schnorr_no_aux_rand(&msg, &kp);
        let ev = unsigned.into_signed(hex::encode(sig.as_ref()));
        verify_event(&ev).unwrap();
    }

    #[test]
    fn shared_context_serves_concurrent_callers() {
        let handles: Vec<_> = (0..8)
            .map(|i| {
                std::thread::spawn(move || {
                    let keys = Keys::from_hex(&format!("{:02x}", i + 1).repeat(32)).unwrap();
                    for _ in 0..25 {
                        let ev = signed(&keys);
                        verify_event(&ev).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }
}
