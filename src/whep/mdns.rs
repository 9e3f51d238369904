//! mDNS candidate mode of the peer's setting engine
//!
//! `MEDIAMTX_WHEP_MDNS_MODE` takes one of the labels printed by
//! `mdns_mode_label`: `disabled`, `query_only` or `query_and_gather`.

use webrtc::ice::mdns::MulticastDnsMode;

const MDNS_MODE_ENV: &str = "MEDIAMTX_WHEP_MDNS_MODE";

const MODES: [MulticastDnsMode; 3] = [
    MulticastDnsMode::Disabled,
    MulticastDnsMode::QueryOnly,
    MulticastDnsMode::QueryAndGather,
];

fn parse_mdns_mode(raw: &str) -> Option<MulticastDnsMode> {
    let value = raw.trim().to_ascii_lowercase();
    MODES.into_iter().find(|mode| mdns_mode_label(*mode) == value)
}

/// Resolve `.local` candidates from the server but do not publish our own,
/// unless the environment says otherwise
pub fn mdns_mode() -> MulticastDnsMode {
    std::env::var(MDNS_MODE_ENV)
        .ok()
        .and_then(|raw| parse_mdns_mode(&raw))
        .unwrap_or(MulticastDnsMode::QueryOnly)
}

pub fn mdns_mode_label(mode: MulticastDnsMode) -> &'static str {
    match mode {
        MulticastDnsMode::Disabled => "disabled",
        MulticastDnsMode::QueryOnly => "query_only",
        MulticastDnsMode::QueryAndGather => "query_and_gather",
    }
}

/// Host name published when gathering mDNS candidates
pub fn mdns_host_name(generation: u64) -> String {
    format!("mediamtx-whep-{generation}.local")
}
