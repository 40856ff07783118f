use std::time::Duration;

use async_compression::tokio::write::GzipEncoder;
use async_trait::async_trait;
use reqwest::{
    header::{CONTENT_ENCODING, CONTENT_TYPE},
    Client, StatusCode, Url,
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt as _, Snafu};
use tally_core::{Metric, MetricValue, Transport};
use tally_error::GenericError;
use tokio::io::AsyncWriteExt as _;
use tracing::{debug, trace};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP transport errors.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum TransportError {
    /// The collector address could not be turned into a URL.
    #[snafu(display("Invalid collector address '{}': {}", address, reason))]
    InvalidAddress {
        /// The address as configured.
        address: String,

        /// Why the address was rejected.
        reason: String,
    },

    /// The HTTP client could not be built.
    #[snafu(display("Failed to build HTTP client: {}", source))]
    BuildClient {
        /// Error source.
        source: reqwest::Error,
    },

    /// The metric could not be encoded.
    #[snafu(display("Failed to encode metric: {}", source))]
    Encode {
        /// Error source.
        source: std::io::Error,
    },

    /// The metric could not be serialized.
    #[snafu(display("Failed to serialize metric: {}", source))]
    SerializePayload {
        /// Error source.
        source: serde_json::Error,
    },

    /// The request could not be sent, or no response was received in time.
    #[snafu(display("Request to collector failed: {}", source))]
    Request {
        /// Error source.
        source: reqwest::Error,
    },

    /// The collector responded with a non-success status.
    #[snafu(display("Collector responded with {}: {}", status, body))]
    UnexpectedStatus {
        /// Response status.
        status: StatusCode,

        /// Response body, if any.
        body: String,
    },
}

/// How metrics are encoded in update requests.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiMode {
    /// A gzip-compressed JSON body posted to `/update/`.
    #[default]
    Json,

    /// The metric encoded in the URL, as `/update/{type}/{name}/{value}`.
    Path,
}

#[derive(Serialize)]
struct MetricPayload<'a> {
    id: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    delta: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<f64>,
}

impl<'a> From<&'a Metric> for MetricPayload<'a> {
    fn from(metric: &'a Metric) -> Self {
        let (delta, value) = match metric.value() {
            MetricValue::Gauge(value) => (None, Some(value)),
            MetricValue::Counter(delta) => (Some(delta), None),
        };

        Self {
            id: metric.name(),
            kind: metric.kind().as_str(),
            delta,
            value,
        }
    }
}

/// Delivers metrics to a collector over HTTP, one request per metric.
///
/// Any response other than `2xx` is treated as a failed delivery. Requests are bounded by a timeout, 10 seconds by
/// default.
pub struct HttpTransport {
    client: Client,
    base_url: Url,
    mode: ApiMode,
}

impl HttpTransport {
    /// Creates a new `HttpTransport` for the collector at `address`.
    ///
    /// `address` is either a URL or a bare `host:port`, which is assumed to be plain HTTP.
    ///
    /// # Errors
    ///
    /// If the address is not a valid URL, or the HTTP client cannot be created, an error is returned.
    pub fn new(address: &str, mode: ApiMode) -> Result<Self, TransportError> {
        Self::with_timeout(address, mode, DEFAULT_REQUEST_TIMEOUT)
    }

    /// Creates a new `HttpTransport` for the collector at `address`, with the given request timeout.
    ///
    /// # Errors
    ///
    /// If the address is not a valid URL, or the HTTP client cannot be created, an error is returned.
    pub fn with_timeout(address: &str, mode: ApiMode, request_timeout: Duration) -> Result<Self, TransportError> {
        let base_url = parse_address(address)?;
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .context(BuildClient)?;

        debug!(%base_url, ?mode, ?request_timeout, "Created HTTP transport.");

        Ok(Self { client, base_url, mode })
    }

    /// Returns the URL that update requests for `metric` are sent to.
    pub fn update_url(&self, metric: &Metric) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push("update");

            match self.mode {
                ApiMode::Json => {
                    segments.push("");
                }
                ApiMode::Path => {
                    segments
                        .push(metric.kind().as_str())
                        .push(metric.name())
                        .push(&metric.value().to_string());
                }
            }
        }
        url
    }

    async fn send(&self, metric: &Metric) -> Result<(), TransportError> {
        let url = self.update_url(metric);
        let request = match self.mode {
            ApiMode::Json => self
                .client
                .post(url)
                .header(CONTENT_TYPE, "application/json")
                .header(CONTENT_ENCODING, "gzip")
                .body(encode_json(metric).await?),
            ApiMode::Path => self.client.post(url).header(CONTENT_TYPE, "text/plain"),
        };

        let response = request.send().await.context(Request)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|_| String::from("<no body>"));
            return UnexpectedStatus { status, body }.fail();
        }

        trace!(%status, "Collector accepted metric.");
        Ok(())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn deliver(&self, metric: Metric) -> Result<(), GenericError> {
        self.send(&metric).await.map_err(Into::into)
    }
}

fn parse_address(address: &str) -> Result<Url, TransportError> {
    let address = address.trim();
    let url = if address.contains("://") {
        Url::parse(address)
    } else {
        Url::parse(&format!("http://{}", address))
    };

    let url = url.map_err(|e| TransportError::InvalidAddress {
        address: address.to_string(),
        reason: e.to_string(),
    })?;

    if url.cannot_be_a_base() || !matches!(url.scheme(), "http" | "https") {
        return InvalidAddress {
            address,
            reason: "expected an http or https URL",
        }
        .fail();
    }

    Ok(url)
}

async fn encode_json(metric: &Metric) -> Result<Vec<u8>, TransportError> {
    let json = serde_json::to_vec(&MetricPayload::from(metric)).context(SerializePayload)?;

    let mut encoder = GzipEncoder::new(Vec::with_capacity(json.len()));
    encoder.write_all(&json).await.context(Encode)?;
    encoder.shutdown().await.context(Encode)?;
    Ok(encoder.into_inner())
}
