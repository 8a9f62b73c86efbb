use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use plugin_sdk::Credentials;
use reqwest::{Client, Url, header};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

/// Produces the instance context for one entity.
///
/// Implementations own their timeout and retry policy; the cache awaits
/// whatever they return.
#[async_trait]
pub trait ContextBuilder: Send + Sync + 'static {
    type Context: Clone + Serialize + Send + Sync + 'static;

    async fn build(&self, entity_id: &str, credentials: &Credentials) -> Result<Self::Context>;
}

/// Fetches `GET {platform}/entities/{id}` from the platform control API.
#[derive(Debug, Clone)]
pub struct PlatformContextBuilder {
    client: Client,
    base: Url,
}

impl PlatformContextBuilder {
    pub fn new(platform_url: &str, timeout: Duration) -> Result<Self> {
        let mut base = Url::parse(platform_url)
            .with_context(|| format!("invalid platform url `{platform_url}`"))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("could not build http client")?;
        Ok(Self { client, base })
    }

    pub fn entity_url(&self, entity_id: &str) -> Result<Url> {
        let mut url = self.base.join("entities/")?;
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("platform url cannot be a base"))?
            .pop_if_empty()
            .push(entity_id);
        Ok(url)
    }
}

#[async_trait]
impl ContextBuilder for PlatformContextBuilder {
    type Context = Value;

    async fn build(&self, entity_id: &str, credentials: &Credentials) -> Result<Value> {
        let url = self.entity_url(entity_id)?;
        debug!(%url, worker_id = %credentials.worker_id, "fetching instance context");
        let rsp = self
            .client
            .get(url)
            .header(header::AUTHORIZATION, format!("Bearer {}", credentials.auth_token))
            .header("X-Worker-Id", &credentials.worker_id)
            .send()
            .await
            .with_context(|| format!("request for entity `{entity_id}` failed"))?;

        let status = rsp.status();
        if !status.is_success() {
            bail!("upstream {}", status.as_u16());
        }
        rsp.json::<Value>()
            .await
            .with_context(|| format!("entity `{entity_id}` returned invalid json"))
    }
}
