//! HTTP geolocation provider.
//!
//! Fetches a JSON document from a configurable URL template and maps the
//! common field spellings onto [`IpInfo`]. The response body is rejected
//! up-front via `Content-Length` when the server sends one, and clamped
//! by a running total while streaming otherwise.

use std::net::IpAddr;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;

use crate::error::{IpLookupError, Result};
use crate::ip::{AsnType, IpInfo, IpProvider};

/// Default response size cap.
const DEFAULT_MAX_BYTES: usize = 1024 * 1024;

/// JSON payload with aliases covering the common provider schemas.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ProviderPayload {
    #[serde(alias = "country_code", alias = "countryCode")]
    country: Option<String>,
    #[serde(alias = "countryName")]
    country_name: Option<String>,
    #[serde(alias = "region_code", alias = "regionCode")]
    region: Option<String>,
    #[serde(alias = "regionName")]
    region_name: Option<String>,
    city: Option<String>,
    #[serde(alias = "continent_code", alias = "continentCode")]
    continent: Option<String>,
    #[serde(alias = "continentName")]
    continent_name: Option<String>,
    #[serde(alias = "lat")]
    latitude: Option<f64>,
    #[serde(alias = "lon", alias = "lng")]
    longitude: Option<f64>,
    #[serde(alias = "time_zone", alias = "timeZone")]
    timezone: Option<String>,
    #[serde(alias = "postal", alias = "zip")]
    postal_code: Option<String>,
    asn: Option<u32>,
    #[serde(alias = "org", alias = "asn_org", alias = "asnOrg")]
    asn_name: Option<String>,
    #[serde(alias = "asnDomain")]
    asn_domain: Option<String>,
    #[serde(alias = "asnType")]
    asn_type: Option<String>,
    #[serde(alias = "vpn")]
    is_vpn: Option<bool>,
    #[serde(alias = "proxy")]
    is_proxy: Option<bool>,
    #[serde(alias = "hosting", alias = "datacenter")]
    is_hosting: Option<bool>,
    #[serde(alias = "relay")]
    is_relay: Option<bool>,
    #[serde(alias = "tor")]
    is_tor: Option<bool>,
}

impl From<ProviderPayload> for IpInfo {
    fn from(p: ProviderPayload) -> Self {
        let asn_type = p.asn_type.as_deref().and_then(|t| match t {
            "isp" => Some(AsnType::Isp),
            "hosting" => Some(AsnType::Hosting),
            "business" => Some(AsnType::Business),
            "education" => Some(AsnType::Education),
            _ => None,
        });
        IpInfo {
            country: p.country,
            country_name: p.country_name,
            region: p.region,
            region_name: p.region_name,
            city: p.city,
            continent: p.continent,
            continent_name: p.continent_name,
            latitude: p.latitude,
            longitude: p.longitude,
            timezone: p.timezone,
            postal_code: p.postal_code,
            asn: p.asn,
            asn_name: p.asn_name,
            asn_domain: p.asn_domain,
            asn_type,
            is_vpn: p.is_vpn,
            is_proxy: p.is_proxy,
            is_hosting: p.is_hosting,
            is_relay: p.is_relay,
            is_tor: p.is_tor,
        }
    }
}

/// Provider that queries an HTTP JSON endpoint.
pub struct HttpIpProvider {
    name: String,
    /// URL template; `{ip}` is replaced with the address.
    url_template: String,
    client: reqwest::Client,
    max_bytes: usize,
}

impl HttpIpProvider {
    /// Create a provider. The template must contain `{ip}`.
    pub fn new(name: impl Into<String>, url_template: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url_template: url_template.into(),
            client: reqwest::Client::new(),
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }

    /// Override the response size cap.
    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    fn err(&self, message: impl Into<String>) -> IpLookupError {
        IpLookupError::Provider {
            provider: self.name.clone(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl IpProvider for HttpIpProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, ip: IpAddr) -> Result<IpInfo> {
        let url = self.url_template.replace("{ip}", &ip.to_string());
        let response = self
            .client
            .get(&url)
            .header("accept", "application/json")
            .send()
            .await
            .map_err(|e| self.err(e.to_string()))?;

        if !response.status().is_success() {
            return Err(self.err(format!("status {}", response.status())).into());
        }

        if let Some(length) = response.content_length()
            && length as usize > self.max_bytes
        {
            return Err(IpLookupError::ResponseTooLarge {
                max_bytes: self.max_bytes,
            }
            .into());
        }

        // Stream with a running total; Content-Length can lie or be absent.
        let mut body: Vec<u8> = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| self.err(e.to_string()))?;
            if body.len() + chunk.len() > self.max_bytes {
                return Err(IpLookupError::ResponseTooLarge {
                    max_bytes: self.max_bytes,
                }
                .into());
            }
            body.extend_from_slice(&chunk);
        }

        let payload: ProviderPayload =
            serde_json::from_slice(&body).map_err(|e| self.err(format!("bad payload: {e}")))?;
        Ok(payload.into())
    }
}
