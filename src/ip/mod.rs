//! IP intelligence: geolocation, network classification, and the
//! VPN/proxy classifier.
//!
//! [`IpInfo`] is the enrichment record attached to every decision. All
//! fields are optional and absence is first-class: a failed lookup
//! yields `IpInfo::default()` and the pipeline continues.

mod classifier;
#[cfg(feature = "ip-http")]
mod http_provider;
mod intel;
mod provider;

pub use classifier::{ClassifierVerdict, VpnClassifier};
#[cfg(feature = "ip-http")]
pub use http_provider::HttpIpProvider;
pub use intel::{IpIntelligence, IpIntelligenceConfig};
pub use provider::{IpProvider, ProviderHealth};

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Network type reported for an ASN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AsnType {
    /// Consumer or business internet service provider.
    Isp,
    /// Datacenter / cloud hosting.
    Hosting,
    /// Corporate network.
    Business,
    /// University or research network.
    Education,
}

/// Geolocation and network classification for a client IP.
///
/// Every field is optional; providers fill what they know and the
/// classifier merges in its own evidence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IpInfo {
    /// ISO 3166-1 alpha-2 country code.
    pub country: Option<String>,
    /// Country display name.
    pub country_name: Option<String>,
    /// Region/state code.
    pub region: Option<String>,
    /// Region display name.
    pub region_name: Option<String>,
    /// City name.
    pub city: Option<String>,
    /// Continent code.
    pub continent: Option<String>,
    /// Continent display name.
    pub continent_name: Option<String>,
    /// Latitude.
    pub latitude: Option<f64>,
    /// Longitude.
    pub longitude: Option<f64>,
    /// IANA timezone.
    pub timezone: Option<String>,
    /// Postal code.
    pub postal_code: Option<String>,
    /// Autonomous system number.
    pub asn: Option<u32>,
    /// Autonomous system name.
    pub asn_name: Option<String>,
    /// Autonomous system domain.
    pub asn_domain: Option<String>,
    /// Network type of the ASN.
    pub asn_type: Option<AsnType>,
    /// Known VPN exit.
    pub is_vpn: Option<bool>,
    /// Known open or commercial proxy.
    pub is_proxy: Option<bool>,
    /// Datacenter / hosting address space.
    pub is_hosting: Option<bool>,
    /// Privacy relay (e.g. iCloud Private Relay).
    pub is_relay: Option<bool>,
    /// Tor exit node.
    pub is_tor: Option<bool>,
}

impl IpInfo {
    /// Merge `other` into `self`, filling only absent fields.
    pub fn merge_missing(&mut self, other: IpInfo) {
        macro_rules! fill {
            ($($field:ident),* $(,)?) => {
                $(
                    if self.$field.is_none() {
                        self.$field = other.$field;
                    }
                )*
            };
        }
        fill!(
            country,
            country_name,
            region,
            region_name,
            city,
            continent,
            continent_name,
            latitude,
            longitude,
            timezone,
            postal_code,
            asn,
            asn_name,
            asn_domain,
            asn_type,
            is_vpn,
            is_proxy,
            is_hosting,
            is_relay,
            is_tor,
        );
    }

    /// Whether any flag marks this IP as anonymizing infrastructure.
    pub fn is_anonymous(&self) -> bool {
        self.is_vpn == Some(true)
            || self.is_proxy == Some(true)
            || self.is_relay == Some(true)
            || self.is_tor == Some(true)
    }
}

/// Parse and validate a client IP for outbound lookup.
///
/// Rejects anything that must never trigger network I/O: loopback,
/// private ranges, link-local, CGNAT, reserved and multicast space, and
/// their IPv6 equivalents (ULA, unicast link-local, IPv4-mapped private
/// addresses). Callers translate the rejection into an empty `IpInfo`.
pub fn validate_public_ip(raw: &str) -> Result<IpAddr, ValidationError> {
    let addr: IpAddr = raw
        .trim()
        .parse()
        .map_err(|_| ValidationError::InvalidIp(raw.to_string()))?;

    let routable = match addr {
        IpAddr::V4(v4) => is_routable_v4(&v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(mapped) => is_routable_v4(&mapped),
            None => is_routable_v6(&v6),
        },
    };

    if routable {
        Ok(addr)
    } else {
        Err(ValidationError::NonRoutableIp(addr.to_string()))
    }
}

fn is_routable_v4(addr: &Ipv4Addr) -> bool {
    let octets = addr.octets();
    !(addr.is_loopback()
        || addr.is_private()
        || addr.is_link_local()
        || addr.is_multicast()
        || addr.is_broadcast()
        || addr.is_unspecified()
        || addr.is_documentation()
        // CGNAT 100.64.0.0/10
        || (octets[0] == 100 && (octets[1] & 0xC0) == 64)
        // Reserved 240.0.0.0/4
        || octets[0] >= 240)
}

fn is_routable_v6(addr: &Ipv6Addr) -> bool {
    let segments = addr.segments();
    !(addr.is_loopback()
        || addr.is_unspecified()
        || addr.is_multicast()
        // Unique local fc00::/7
        || (segments[0] & 0xFE00) == 0xFC00
        // Unicast link-local fe80::/10
        || (segments[0] & 0xFFC0) == 0xFE80
        // Documentation 2001:db8::/32
        || (segments[0] == 0x2001 && segments[1] == 0x0DB8))
}
