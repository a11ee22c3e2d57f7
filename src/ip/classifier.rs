//! VPN/proxy/Tor/relay/hosting classification.
//!
//! Enriches provider-reported [`IpInfo`] with verdicts derived from
//! curated provider dictionaries plus weak heuristics. Evidence is
//! scored; hosting evidence alone caps at confidence 50 and never flips
//! a VPN or proxy flag on its own, since plenty of legitimate traffic
//! comes out of datacenter address space.

use crate::ip::{AsnType, IpInfo};

/// Confidence needed before a VPN/proxy verdict is recorded.
const VERDICT_THRESHOLD: u8 = 60;

/// Confidence ceiling for hosting-only evidence.
const HOSTING_CAP: u8 = 50;

/// ASN organization substrings for commercial VPN exits.
const VPN_PROVIDERS: &[&str] = &[
    "nordvpn",
    "expressvpn",
    "mullvad",
    "proton",
    "surfshark",
    "private internet access",
    "cyberghost",
    "windscribe",
    "tunnelbear",
    "ivpn",
    "hide.me",
    "vyprvpn",
    "hotspot shield",
    "torguard",
];

/// ASN organization substrings for anonymizing proxy services.
const PROXY_PROVIDERS: &[&str] = &[
    "luminati",
    "brightdata",
    "bright data",
    "oxylabs",
    "smartproxy",
    "soax",
    "proxyrack",
    "storm proxies",
];

/// ASN organization substrings for privacy relays.
const RELAY_PROVIDERS: &[&str] = &["icloud private relay", "apple relay", "cloudflare warp"];

/// ASN organization substrings for datacenter / cloud hosting.
const HOSTING_PROVIDERS: &[&str] = &[
    "amazon",
    "aws",
    "google cloud",
    "microsoft azure",
    "digitalocean",
    "ovh",
    "hetzner",
    "linode",
    "akamai connected cloud",
    "vultr",
    "contabo",
    "scaleway",
    "alibaba cloud",
    "oracle cloud",
    "tencent cloud",
];

/// Classification verdict with its supporting confidence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassifierVerdict {
    /// VPN exit.
    pub is_vpn: bool,
    /// Anonymizing proxy.
    pub is_proxy: bool,
    /// Datacenter / hosting space.
    pub is_hosting: bool,
    /// Privacy relay.
    pub is_relay: bool,
    /// Tor exit.
    pub is_tor: bool,
    /// Strength of the combined evidence, 0–100.
    pub confidence: u8,
}

/// Dictionary-driven VPN/proxy classifier.
///
/// Instance-owned dictionaries; construction is cheap and there is no
/// shared mutable state.
#[derive(Debug, Clone, Default)]
pub struct VpnClassifier;

impl VpnClassifier {
    /// Create a classifier with the curated dictionaries.
    pub fn new() -> Self {
        Self
    }

    /// Score the evidence in `info` and produce a verdict.
    pub fn classify(&self, info: &IpInfo) -> ClassifierVerdict {
        let mut verdict = ClassifierVerdict::default();
        let org = info
            .asn_name
            .as_deref()
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        let domain = info
            .asn_domain
            .as_deref()
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();

        // Provider flags are authoritative.
        if info.is_vpn == Some(true) {
            verdict.is_vpn = true;
            verdict.confidence = 100;
        }
        if info.is_proxy == Some(true) {
            verdict.is_proxy = true;
            verdict.confidence = 100;
        }
        if info.is_tor == Some(true) {
            verdict.is_tor = true;
            verdict.confidence = 100;
        }
        if info.is_relay == Some(true) {
            verdict.is_relay = true;
            verdict.confidence = verdict.confidence.max(90);
        }

        let matches = |needles: &[&str]| {
            needles
                .iter()
                .any(|needle| org.contains(needle) || domain.contains(needle))
        };

        // Curated dictionary matches.
        if matches(VPN_PROVIDERS) {
            verdict.is_vpn = true;
            verdict.confidence = verdict.confidence.max(90);
        }
        if matches(PROXY_PROVIDERS) {
            verdict.is_proxy = true;
            verdict.confidence = verdict.confidence.max(85);
        }
        if matches(RELAY_PROVIDERS) {
            verdict.is_relay = true;
            verdict.confidence = verdict.confidence.max(85);
        }

        // Weak heuristic: a bare "vpn" in the org name.
        if !verdict.is_vpn && (org.contains("vpn") || domain.contains("vpn")) {
            verdict.is_vpn = true;
            verdict.confidence = verdict.confidence.max(70);
        }

        // Hosting evidence: flag it, but alone it stays under the
        // verdict threshold.
        let hosting_evidence = info.is_hosting == Some(true)
            || info.asn_type == Some(AsnType::Hosting)
            || matches(HOSTING_PROVIDERS);
        if hosting_evidence {
            verdict.is_hosting = true;
            verdict.confidence = verdict.confidence.max(HOSTING_CAP);
        }

        // Below threshold, hosting-only evidence yields no VPN/proxy
        // verdict.
        if verdict.confidence < VERDICT_THRESHOLD {
            verdict.is_vpn = false;
            verdict.is_proxy = false;
        }

        verdict
    }

    /// Classify and merge the verdict into `info`.
    ///
    /// Provider-set flags are never cleared; verdicts only add.
    pub fn enrich(&self, info: &mut IpInfo) {
        let verdict = self.classify(info);
        if verdict.is_vpn {
            info.is_vpn = Some(true);
        }
        if verdict.is_proxy {
            info.is_proxy = Some(true);
        }
        if verdict.is_hosting {
            info.is_hosting = Some(true);
        }
        if verdict.is_relay {
            info.is_relay = Some(true);
        }
        if verdict.is_tor {
            info.is_tor = Some(true);
        }
    }
}
