//! Opens and reuses the relay connection.

use std::{sync::Arc, time::Duration};

use tokio::sync::Mutex;
use url::Url;

use super::RemoteConnection;
use crate::{
    apresolve::Discovery,
    config::Config,
    error::{ErrorKind, Result},
    token::{Token, TokenProvider},
};

/// Hands out the live relay connection, opening a new one when there is
/// none or the last one died.
pub struct RemoteConnectionProvider {
    discovery: Arc<dyn Discovery>,
    tokens: Arc<dyn TokenProvider>,
    scheme: &'static str,
    ping_interval: Duration,
    connect_timeout: Duration,
    current: Mutex<Option<Arc<RemoteConnection>>>,
}

impl RemoteConnectionProvider {
    #[must_use]
    pub fn new(
        config: &Config,
        discovery: Arc<dyn Discovery>,
        tokens: Arc<dyn TokenProvider>,
    ) -> Self {
        let scheme = if config.secure { "wss" } else { "ws" };
        debug!("remote scheme: {scheme}");

        Self {
            discovery,
            tokens,
            scheme,
            ping_interval: config.ping_interval,
            connect_timeout: config.connect_timeout,
            current: Mutex::new(None),
        }
    }

    /// Relay URL for `dealer` (`host:port`) with `token` as query credential.
    pub fn url(&self, dealer: &str, token: &Token) -> Result<Url> {
        let mut url = Url::parse(&format!("{}://{dealer}/", self.scheme))?;
        url.query_pairs_mut()
            .append_pair("access_token", token.as_str());
        Ok(url)
    }

    /// Returns the live connection, opening one if needed.
    ///
    /// Callers that arrive while a connection is being opened wait for it
    /// instead of opening a second one. Call again after
    /// [`RemoteEvent::Disconnected`](super::RemoteEvent::Disconnected) to
    /// reconnect.
    pub async fn connect(&self) -> Result<Arc<RemoteConnection>> {
        let mut current = self.current.lock().await;

        if let Some(connection) = current.as_ref() {
            if connection.is_alive() {
                trace!("reusing remote {}", connection.id());
                return Ok(Arc::clone(connection));
            }
        }

        if let Some(stale) = current.take() {
            debug!("replacing dead remote {}", stale.id());
            stale.close();
        }

        let dealer = self.discovery.dealer().await?;
        let token = self.tokens.token().await?;
        let url = self.url(&dealer, &token)?;

        let connection =
            match RemoteConnection::connect(&url, self.ping_interval, self.connect_timeout).await {
                Ok(connection) => Arc::new(connection),
                Err(e) => {
                    if e.kind == ErrorKind::Unauthenticated {
                        warn!("relay refused the bearer token, flushing it");
                        self.tokens.flush_token();
                    }
                    return Err(e);
                }
            };

        *current = Some(Arc::clone(&connection));
        Ok(connection)
    }

    /// Closes the current connection, if any.
    pub async fn disconnect(&self) {
        if let Some(connection) = self.current.lock().await.take() {
            connection.close();
        }
    }
}
