//! Bearer tokens for the remote channel.
//!
//! Tokens come from the keymaster service over Mercury, so fetching one
//! needs a logged-in access point connection. [`KeymasterTokenProvider`]
//! caches the token and fetches a new one shortly before it expires.

use std::{
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use serde::Deserialize;
use serde_with::{serde_as, DurationSeconds};
use veil::Redact;

use crate::{
    config::Config,
    connection::{ConnectionProvider, Connector},
    error::{Error, Result},
    mercury::Mercury,
    protocol,
};

/// Tokens this close to expiry are refreshed before use.
pub const EXPIRATION_THRESHOLD: Duration = Duration::from_secs(60);

#[derive(Clone, PartialEq, Eq, Redact)]
pub struct Token {
    #[redact]
    access_token: String,
    pub token_type: String,
    pub scopes: Vec<String>,
    pub expires_at: SystemTime,
}

#[serde_as]
#[derive(Deserialize, Redact)]
#[serde(rename_all = "camelCase")]
struct KeymasterToken {
    #[redact]
    access_token: String,
    #[serde_as(as = "DurationSeconds<u64>")]
    expires_in: Duration,
    #[serde(default = "bearer")]
    token_type: String,
    #[serde(default)]
    scope: Vec<String>,
}

fn bearer() -> String {
    "Bearer".to_owned()
}

impl Token {
    /// Parses a keymaster response received at `now`.
    pub fn from_keymaster(body: &str, now: SystemTime) -> Result<Self> {
        let token: KeymasterToken = protocol::json(body, "keymaster")?;
        if token.access_token.is_empty() {
            return Err(Error::unauthenticated("keymaster returned an empty token"));
        }

        Ok(Self {
            access_token: token.access_token,
            token_type: token.token_type,
            scopes: token.scope,
            expires_at: now + token.expires_in,
        })
    }

    /// The bearer credential. Never log it.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.access_token
    }

    #[must_use]
    pub fn time_to_live(&self) -> Duration {
        self.expires_at
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO)
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        SystemTime::now() >= self.expires_at
    }

    /// Whether the token should be replaced before use.
    #[must_use]
    pub fn needs_refresh(&self) -> bool {
        self.time_to_live() <= EXPIRATION_THRESHOLD
    }
}

#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Returns a token that is valid for at least a little while longer.
    async fn token(&self) -> Result<Token>;

    /// Forgets the cached token, so the next call fetches a new one.
    fn flush_token(&self);
}

/// Something that hands out a Mercury multiplexer on a live connection.
#[async_trait]
pub trait MercurySource: Send + Sync {
    async fn mercury(&self) -> Result<Mercury>;
}

#[async_trait]
impl MercurySource for Mercury {
    async fn mercury(&self) -> Result<Mercury> {
        Ok(self.clone())
    }
}

#[async_trait]
impl<C> MercurySource for ConnectionProvider<C>
where
    C: Connector,
{
    async fn mercury(&self) -> Result<Mercury> {
        Ok(self.connection().await?.mercury().clone())
    }
}

#[async_trait]
impl<S> MercurySource for Arc<S>
where
    S: MercurySource + ?Sized,
{
    async fn mercury(&self) -> Result<Mercury> {
        (**self).mercury().await
    }
}

/// Fetches tokens from keymaster and caches them.
pub struct KeymasterTokenProvider<S> {
    source: S,
    uri: String,
    cached: Mutex<Option<Token>>,
    fetching: tokio::sync::Mutex<()>,
}

impl<S> KeymasterTokenProvider<S>
where
    S: MercurySource,
{
    #[must_use]
    pub fn new(source: S, config: &Config) -> Self {
        let uri = format!(
            "hm://keymaster/token/authenticated?scope={}&client_id={}&device_id={}",
            config.token_scopes.join(","),
            config.client_id,
            config.device_id,
        );

        Self {
            source,
            uri,
            cached: Mutex::new(None),
            fetching: tokio::sync::Mutex::new(()),
        }
    }

    fn cached(&self) -> Result<Option<Token>> {
        Ok(self
            .cached
            .lock()?
            .as_ref()
            .filter(|token| !token.needs_refresh())
            .cloned())
    }
}

#[async_trait]
impl<S> TokenProvider for KeymasterTokenProvider<S>
where
    S: MercurySource,
{
    async fn token(&self) -> Result<Token> {
        if let Some(token) = self.cached()? {
            return Ok(token);
        }

        // One fetch at a time; latecomers pick up the fresh token.
        let _fetching = self.fetching.lock().await;
        if let Some(token) = self.cached()? {
            return Ok(token);
        }

        debug!("requesting bearer token");
        let response = self.source.mercury().await?.get(self.uri.clone()).await?;
        let body = response.body();
        let body = std::str::from_utf8(&body)
            .map_err(|e| Error::data_loss(format!("keymaster response is not utf-8: {e}")))?;
        let token = Token::from_keymaster(body, SystemTime::now())?;
        debug!(
            "bearer token valid for {}s",
            token.time_to_live().as_secs()
        );

        *self.cached.lock()? = Some(token.clone());
        Ok(token)
    }

    fn flush_token(&self) {
        if let Ok(mut cached) = self.cached.lock() {
            *cached = None;
        }
    }
}
