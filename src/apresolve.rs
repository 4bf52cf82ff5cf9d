//! Discovery of access point, relay and API hosts.
//!
//! The resolver returns candidate `host:port` lists for each service; the
//! first entry of each list is used. When the resolver cannot be reached or
//! returns an empty list, well-known fallback hosts are used instead so that
//! a resolver outage does not prevent connecting.

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;
use url::Url;

use crate::{config::Config, error::Result, http, protocol};

pub const FALLBACK_ACCESS_POINT: &str = "ap.spotify.com:443";
pub const FALLBACK_DEALER: &str = "dealer.spotify.com:443";
pub const FALLBACK_SPCLIENT: &str = "spclient.wg.spotify.com:443";

/// Resolves service endpoints.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// `host:port` of the access point.
    async fn access_point(&self) -> Result<String>;

    /// `host:port` of the relay.
    async fn dealer(&self) -> Result<String>;

    /// `host:port` of the API client endpoint.
    async fn spclient(&self) -> Result<String>;
}

/// Resolver response.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct Endpoints {
    #[serde(default)]
    pub accesspoint: Vec<String>,
    #[serde(default)]
    pub dealer: Vec<String>,
    #[serde(default)]
    pub spclient: Vec<String>,
}

impl Endpoints {
    /// Endpoints made of the fallback hosts only.
    #[must_use]
    pub fn fallback() -> Self {
        Self::default().with_fallbacks()
    }

    /// Fills empty lists with the fallback host for that service.
    #[must_use]
    pub fn with_fallbacks(mut self) -> Self {
        for (list, fallback) in [
            (&mut self.accesspoint, FALLBACK_ACCESS_POINT),
            (&mut self.dealer, FALLBACK_DEALER),
            (&mut self.spclient, FALLBACK_SPCLIENT),
        ] {
            if list.is_empty() {
                list.push(fallback.to_owned());
            }
        }
        self
    }

    fn first(list: &[String], fallback: &str) -> String {
        list.first().map_or_else(|| fallback.to_owned(), Clone::clone)
    }
}

/// Resolver backed by the HTTP discovery service. The first successful
/// answer is cached for the lifetime of the resolver.
pub struct ApResolver {
    http_client: http::Client,
    url: Url,
    endpoints: Mutex<Option<Endpoints>>,
}

impl ApResolver {
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            http_client: http::Client::new(config)?,
            url: config.apresolve_url.clone(),
            endpoints: Mutex::new(None),
        })
    }

    /// URL of the lookup for all three services.
    #[must_use]
    pub fn lookup_url(&self) -> Url {
        let mut url = self.url.clone();
        url.query_pairs_mut()
            .append_pair("type", "accesspoint")
            .append_pair("type", "dealer")
            .append_pair("type", "spclient");
        url
    }

    async fn fetch(&self) -> Result<Endpoints> {
        let request = self.http_client.get(self.lookup_url());
        let response = self
            .http_client
            .execute(request)
            .await?
            .error_for_status()?;
        let body = response.text().await?;
        protocol::json(&body, "apresolve")
    }

    /// Returns the cached endpoints, fetching them on first use.
    pub async fn endpoints(&self) -> Endpoints {
        let mut endpoints = self.endpoints.lock().await;
        if let Some(endpoints) = endpoints.as_ref() {
            return endpoints.clone();
        }

        match self.fetch().await {
            Ok(fetched) => {
                let fetched = fetched.with_fallbacks();
                debug!(
                    "resolved access point {}, dealer {}, spclient {}",
                    Endpoints::first(&fetched.accesspoint, FALLBACK_ACCESS_POINT),
                    Endpoints::first(&fetched.dealer, FALLBACK_DEALER),
                    Endpoints::first(&fetched.spclient, FALLBACK_SPCLIENT),
                );
                *endpoints = Some(fetched.clone());
                fetched
            }
            Err(e) => {
                warn!("failed resolving endpoints, using fallbacks: {e}");
                Endpoints::fallback()
            }
        }
    }

    /// Forgets the cached endpoints so that the next lookup resolves again.
    pub async fn flush(&self) {
        self.endpoints.lock().await.take();
    }
}

#[async_trait]
impl Discovery for ApResolver {
    async fn access_point(&self) -> Result<String> {
        let endpoints = self.endpoints().await;
        Ok(Endpoints::first(&endpoints.accesspoint, FALLBACK_ACCESS_POINT))
    }

    async fn dealer(&self) -> Result<String> {
        let endpoints = self.endpoints().await;
        Ok(Endpoints::first(&endpoints.dealer, FALLBACK_DEALER))
    }

    async fn spclient(&self) -> Result<String> {
        let endpoints = self.endpoints().await;
        Ok(Endpoints::first(&endpoints.spclient, FALLBACK_SPCLIENT))
    }
}

/// Discovery that always answers with fixed endpoints.
#[derive(Clone, Debug)]
pub struct StaticDiscovery {
    pub endpoints: Endpoints,
}

impl StaticDiscovery {
    #[must_use]
    pub fn new(endpoints: Endpoints) -> Self {
        Self {
            endpoints: endpoints.with_fallbacks(),
        }
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn access_point(&self) -> Result<String> {
        Ok(Endpoints::first(&self.endpoints.accesspoint, FALLBACK_ACCESS_POINT))
    }

    async fn dealer(&self) -> Result<String> {
        Ok(Endpoints::first(&self.endpoints.dealer, FALLBACK_DEALER))
    }

    async fn spclient(&self) -> Result<String> {
        Ok(Endpoints::first(&self.endpoints.spclient, FALLBACK_SPCLIENT))
    }
}
