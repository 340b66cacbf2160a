//! # 📡 THE ELASTICSEARCH TRANSPORT
//!
//! 🎬 COLD OPEN: INT. SERVER ROOM, 3:47 AM
//!
//! The dashboard glows amber. A lone engineer stares into a RED cluster. The cluster stares
//! back and offers a 429. "I'll just bulk it," they whispered. "It'll be fast," they said.
//!
//! 🚀 This module POSTs finished NDJSON payloads to `/_bulk` and decodes what comes back.
//! It does not buffer, retry, or keep score; the worker upstream owns all of that.
//!
//! 🧠 Knowledge graph:
//! - URL: `{url}/{target.index}/_bulk` when the batch has a default index, else `{url}/_bulk`.
//! - Auth: API key beats basic auth. This is not a democracy.
//! - `gzip = true` compresses the body (`Content-Encoding: gzip`). Bulk bodies squish well.
//! - Error mapping: connect/timeout -> `Connection` (the worker parks and health-checks),
//!   non-2xx envelope -> `Status`, unreadable body -> `Decode`.
//!
//! 🦆 (mandatory duck, no context provided, none shall be requested)

use std::io::Write;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use flate2::Compression;
use flate2::write::GzEncoder;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use serde::Deserialize;
use tracing::{debug, trace};

use super::Transport;
use crate::accumulator::BulkTarget;
use crate::error::TransportError;
use crate::response::BulkResponse;

/// 📡 Where the cluster lives and how to knock.
#[derive(Debug, Deserialize, Clone)]
pub struct ElasticsearchTransportConfig {
    /// 📡 Scheme + host + port. Yes, all of it. No, `localhost` alone is not enough.
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// 🔒 API key: the velvet rope variant of authentication.
    #[serde(default)]
    pub api_key: Option<String>,
    /// 🫁 Gzip request bodies.
    #[serde(default)]
    pub gzip: bool,
    /// ⏱️ Per-request timeout. Bulk requests can be meaty; we are not monsters.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    30
}

/// 📡 The HTTP muscle. One `reqwest::Client`, reused by every worker.
#[derive(Debug)]
pub struct ElasticsearchTransport {
    client: reqwest::Client,
    config: ElasticsearchTransportConfig,
}

impl ElasticsearchTransport {
    /// 🚀 Build the client and ping the cluster root, so a typo'd URL fails now rather than
    /// 50,000 documents from now.
    pub async fn new(config: ElasticsearchTransportConfig) -> Result<Self> {
        let transport = Self::unpinged(config)?;
        let response = transport
            .authorized(transport.client.get(&transport.config.url))
            .send()
            .await
            .context(format!(
                "💀 Knocked on '{}' and nobody answered. Check connectivity. Check the cluster. Check your horoscope.",
                transport.config.url
            ))?;
        if !response.status().is_success() {
            anyhow::bail!(
                "💀 '{}' answered {} to a friendly hello. Credentials, maybe? We're not judging. Much.",
                transport.config.url,
                response.status()
            );
        }
        debug!("✅ cluster at '{}' is home and answering the door", transport.config.url);
        Ok(transport)
    }

    /// 🔧 Just the client. Nobody has knocked on the cluster yet.
    fn unpinged(config: ElasticsearchTransportConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("💀 The HTTP client refused to be born. The TLS stack wept. Probably a missing cert or a cursed system OpenSSL. Either way: tragic.")?;
        Ok(Self { client, config })
    }

    /// 🔒 API key wins over basic auth.
    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(ref api_key) = self.config.api_key {
            request.header("Authorization", format!("ApiKey {}", api_key))
        } else if let Some(ref username) = self.config.username {
            request.basic_auth(username, self.config.password.as_ref())
        } else {
            request
        }
    }

    fn bulk_url(&self, target: &BulkTarget) -> String {
        // 🧹 trim_end_matches('/'): one slash of difference, infinite suffering of difference.
        let base = self.config.url.trim_end_matches('/');
        match target.index {
            Some(ref index) => format!("{base}/{index}/_bulk"),
            None => format!("{base}/_bulk"),
        }
    }
}

fn gzip(payload: &[u8]) -> Result<Vec<u8>, TransportError> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(payload.len() / 4), Compression::default());
    encoder
        .write_all(payload)
        .map_err(|err| TransportError::Io(format!("gzip failed: {err}")))?;
    encoder
        .finish()
        .map_err(|err| TransportError::Io(format!("gzip failed: {err}")))
}

fn classify(err: reqwest::Error) -> TransportError {
    if err.is_connect() || err.is_timeout() {
        TransportError::Connection(err.to_string())
    } else {
        TransportError::Io(err.to_string())
    }
}

#[async_trait]
impl Transport for ElasticsearchTransport {
    async fn send(&self, payload: String, target: &BulkTarget) -> Result<BulkResponse, TransportError> {
        let bulk_url = self.bulk_url(target);
        trace!("📡 POSTing {} bytes to {}", payload.len(), bulk_url);

        // ⚠️ application/x-ndjson, not application/json. The x- prefix means "we made this up
        // but we're committing to it".
        let mut request = self
            .authorized(self.client.post(&bulk_url))
            .header(CONTENT_TYPE, "application/x-ndjson");
        request = if self.config.gzip {
            request
                .header(CONTENT_ENCODING, "gzip")
                .body(gzip(payload.as_bytes())?)
        } else {
            request.body(payload)
        };

        let response = request.send().await.map_err(classify)?;
        let status = response.status();
        let body = response.bytes().await.map_err(classify)?;
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        serde_json::from_slice::<BulkResponse>(&body)
            .map_err(|err| TransportError::Decode(err.to_string()))
    }

    /// 🩺 A GET on the cluster root. 2xx = alive. Anything else = still sulking.
    async fn health_check(&self) -> bool {
        match self.authorized(self.client.get(&self.config.url)).send().await {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                trace!("🩺 health check still failing: {err}");
                false
            }
        }
    }
}
