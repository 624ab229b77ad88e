//! Configuration loading from `.env` files.

use std::{env, fmt::Display, str::FromStr, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};

use crate::{
    keys::{KeyMaterialProvider, Keys, NoKeys},
    order::Kinds,
    relay::ConnectOptions,
    session::{SessionOptions, DEFAULT_CONFIRMATION_TIMEOUT},
    subscription::ManagerOptions,
};

/// Runtime settings derived from environment variables.
#[derive(Clone)]
pub struct Settings {
    /// Relay endpoint, `ws://` or `wss://`.
    pub relay_url: String,
    /// Optional Tor SOCKS proxy (host:port).
    pub tor_socks: Option<String>,
    /// Hex secret key used to sign orders and notes.
    pub privkey: Option<String>,
    /// Only trust confirmations from this pubkey.
    pub mostro_pubkey: Option<String>,
    pub kinds: Kinds,
    pub confirmation_timeout: Duration,
    /// Verify id and signature of every inbound event.
    pub verify_sig: bool,
}

impl Settings {
    /// Load settings from the specified `.env` file.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        let relay_url = env::var("RELAY_URL").context("RELAY_URL is not set")?;
        let tor_socks = non_empty("TOR_SOCKS");
        let privkey = non_empty("NOSTR_PRIVKEY");
        let mostro_pubkey = non_empty("MOSTRO_PUBKEY");
        if let Some(pk) = &mostro_pubkey {
            if pk.len() != 64 || !pk.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
                bail!("MOSTRO_PUBKEY must be 64 lowercase hex characters");
            }
        }
        let defaults = Kinds::default();
        let kinds = Kinds {
            order: parse_var("KIND_ORDER", defaults.order)?,
            confirmation: parse_var("KIND_CONFIRMATION", defaults.confirmation)?,
            note: parse_var("KIND_NOTE", defaults.note)?,
        };
        let confirmation_timeout = Duration::from_secs(parse_var(
            "CONFIRMATION_TIMEOUT_SECS",
            DEFAULT_CONFIRMATION_TIMEOUT.as_secs(),
        )?);
        let verify_sig = env::var("VERIFY_SIG").unwrap_or_else(|_| "1".into()) == "1";
        Ok(Self {
            relay_url,
            tor_socks,
            privkey,
            mostro_pubkey,
            kinds,
            confirmation_timeout,
            verify_sig,
        })
    }

    /// Signing keys from `NOSTR_PRIVKEY`, or a provider without keys.
    pub fn keys(&self) -> Result<Arc<dyn KeyMaterialProvider>> {
        Ok(match &self.privkey {
            Some(hex) => Arc::new(Keys::from_hex(hex).context("parsing NOSTR_PRIVKEY")?),
            None => Arc::new(NoKeys),
        })
    }

    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            tor_socks: self.tor_socks.clone(),
        }
    }

    pub fn manager_options(&self) -> ManagerOptions {
        ManagerOptions {
            verify_signatures: self.verify_sig,
            ..ManagerOptions::default()
        }
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            kinds: self.kinds,
            confirmation_timeout: self.confirmation_timeout,
            confirmation_author: self.mostro_pubkey.clone(),
        }
    }
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("relay_url", &self.relay_url)
            .field("tor_socks", &self.tor_socks)
            .field("privkey", &self.privkey.as_ref().map(|_| "<redacted>"))
            .field("mostro_pubkey", &self.mostro_pubkey)
            .field("kinds", &self.kinds)
            .field("confirmation_timeout", &self.confirmation_timeout)
            .field("verify_sig", &self.verify_sig)
            .finish()
    }
}

fn non_empty(name: &str) -> Option<String> {
    env::var(name).ok().filter(|s| !s.trim().is_empty())
}

/// Parse `name` if set and non-empty, otherwise return `default`.
fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match non_empty(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {name}={raw:?}: {e}")),
        None => Ok(default),
    }
}
