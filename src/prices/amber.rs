//! Client for the half-hourly spot price API. Returns raw intervals
//! mapped into domain price points; caching and fallback live in the
//! cache layer.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, USER_AGENT};
use serde::Deserialize;
use std::time::Duration;

use crate::config::AmberConfig;
use crate::domain::{PricePoint, PriceQuality, UsageRow};

/// Seam between the refresher and the wire. The production implementation
/// is [`AmberClient`]; tests substitute a canned source.
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn fetch_prices(&self) -> Result<Vec<PricePoint>>;
    async fn fetch_usage(&self) -> Result<Vec<UsageRow>>;
}

#[derive(Clone)]
pub struct AmberClient {
    base_url: String,
    client: reqwest::Client,
}

impl AmberClient {
    pub fn new(cfg: &AmberConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("power-controller/0.3"));
        if let Some(key) = &cfg.api_key {
            let value = HeaderValue::from_str(&format!("Bearer {key}"))
                .context("price API key is not a valid header value")?;
            headers.insert(AUTHORIZATION, value);
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .default_headers(headers)
            .build()
            .context("failed to build price API client")?;
        Ok(Self {
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .context("price API request failed")?;
        let status = resp.status();
        let body = resp.text().await.context("price API read failed")?;
        if !status.is_success() {
            anyhow::bail!("price API error: HTTP {status}: {body}");
        }
        serde_json::from_str(&body).context("price API JSON parse failed")
    }
}

#[async_trait]
impl PriceSource for AmberClient {
    /// Fetch the merged past/current/forward window of half-hourly
    /// intervals across all channels.
    async fn fetch_prices(&self) -> Result<Vec<PricePoint>> {
        let url = format!(
            "{}/prices/current?previous=24&next=48&resolution=30",
            self.base_url
        );
        let raw: Vec<RawInterval> = self.get_json(&url).await?;
        Ok(raw.into_iter().map(PricePoint::from).collect())
    }

    /// Fetch hourly usage/cost rows where the source provides them. A 404
    /// is treated as "nothing available", not an error.
    async fn fetch_usage(&self) -> Result<Vec<UsageRow>> {
        let url = format!("{}/usage?resolution=60", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("usage request failed")?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let status = resp.status();
        let body = resp.text().await.context("usage read failed")?;
        if !status.is_success() {
            anyhow::bail!("usage API error: HTTP {status}: {body}");
        }
        let raw: Vec<RawUsage> = serde_json::from_str(&body).context("usage JSON parse failed")?;
        Ok(raw.into_iter().map(UsageRow::from).collect())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawInterval {
    #[serde(rename = "type")]
    kind: String,
    start_time: DateTime<Utc>,
    channel_type: String,
    per_kwh: f64,
}

impl From<RawInterval> for PricePoint {
    fn from(raw: RawInterval) -> Self {
        let quality = match raw.kind.as_str() {
            "ActualInterval" => PriceQuality::Actual,
            "CurrentInterval" => PriceQuality::Current,
            _ => PriceQuality::Forecast,
        };
        PricePoint {
            start: raw.start_time,
            channel: raw.channel_type,
            per_kwh: raw.per_kwh,
            quality,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawUsage {
    start_time: DateTime<Utc>,
    channel_type: String,
    kwh: f64,
    cost: f64,
}

impl From<RawUsage> for UsageRow {
    fn from(raw: RawUsage) -> Self {
        UsageRow {
            start: raw.start_time,
            channel: raw.channel_type,
            energy_kwh: raw.kwh,
            cost: raw.cost,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(base_url: String) -> AmberConfig {
        AmberConfig {
            base_url,
            api_key: Some("test-key".into()),
            refresh_minutes: 5,
            timeout_secs: 2,
            max_concurrent_errors: 3,
            stale_after_minutes: 90,
        }
    }

    #[tokio::test]
    async fn fetches_and_maps_intervals() {
        let server = MockServer::start().await;
        let body = serde_json::json!([
            {
                "type": "ActualInterval",
                "startTime": "2025-06-01T00:00:00Z",
                "channelType": "general",
                "perKwh": 21.4
            },
            {
                "type": "CurrentInterval",
                "startTime": "2025-06-01T00:30:00Z",
                "channelType": "general",
                "perKwh": 24.9
            },
            {
                "type": "ForecastInterval",
                "startTime": "2025-06-01T01:00:00Z",
                "channelType": "general",
                "perKwh": 19.0
            }
        ]);
        Mock::given(method("GET"))
            .and(path("/prices/current"))
            .and(header("authorization", "Bearer test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;

        let client = AmberClient::new(&config(server.uri())).unwrap();
        let points = client.fetch_prices().await.unwrap();
        assert_eq!(points.len(), 3);
        assert_eq!(points[0].quality, PriceQuality::Actual);
        assert_eq!(points[1].quality, PriceQuality::Current);
        assert_eq!(points[2].quality, PriceQuality::Forecast);
        assert_eq!(points[2].per_kwh, 19.0);
    }

    #[tokio::test]
    async fn server_error_is_propagated() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/prices/current"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = AmberClient::new(&config(server.uri())).unwrap();
        assert!(client.fetch_prices().await.is_err());
    }

    #[tokio::test]
    async fn missing_usage_endpoint_yields_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/usage"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = AmberClient::new(&config(server.uri())).unwrap();
        assert!(client.fetch_usage().await.unwrap().is_empty());
    }
}
