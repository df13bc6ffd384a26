use anyhow::Context;
use async_trait::async_trait;
use shared::{
    domain::{Nation, TelegramParams},
    error::TransportError,
};

/// Seam for the network delivery backend.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn deliver(&self, nation: &Nation, params: &TelegramParams) -> Result<(), TransportError>;
}

/// Accepts every delivery without touching the network.
pub struct NoopTransport;

#[async_trait]
impl Transport for NoopTransport {
    async fn deliver(
        &self,
        _nation: &Nation,
        _params: &TelegramParams,
    ) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Delivers telegrams through the HTTP API. One GET per recipient; the
/// engine above this transport owns the request spacing.
pub struct HttpTransport {
    http: reqwest::Client,
    endpoint: String,
    client_key: String,
}

impl HttpTransport {
    pub fn new(base_url: &str, user_agent: &str, client_key: &str) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(user_agent)
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            http,
            endpoint: format!("{}/cgi-bin/api.cgi", base_url.trim_end_matches('/')),
            client_key: client_key.to_string(),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn deliver(&self, nation: &Nation, params: &TelegramParams) -> Result<(), TransportError> {
        let response = self
            .http
            .get(&self.endpoint)
            .query(&[
                ("a", "sendTG"),
                ("client", self.client_key.as_str()),
                ("tgid", params.telegram_id.as_str()),
                ("key", params.secret_key.as_str()),
                ("to", nation.as_str()),
            ])
            .send()
            .await
            .map_err(|err| TransportError::Request(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Rejected(format!(
                "{status}: {}",
                body.trim()
            )));
        }
        Ok(())
    }
}
