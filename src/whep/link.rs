//! ICE server discovery from the WHEP `Link` header

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::error::{AppError, Result};

/// One `rel="ice-server"` link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServerEntry {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential_type: Option<String>,
}

impl From<IceServerEntry> for RTCIceServer {
    fn from(entry: IceServerEntry) -> Self {
        RTCIceServer {
            urls: entry.urls,
            username: entry.username.unwrap_or_default(),
            credential: entry.credential.unwrap_or_default(),
            ..Default::default()
        }
    }
}

fn link_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r#"(?i)^<(.+?)>; rel="ice-server"(; username="(.*?)"; credential="(.*?)"; credential-type="password")?"#,
        )
        .expect("ice-server link pattern is valid")
    })
}

/// Decode a quoted-string credential (JSON string escapes)
fn unquote_credential(value: &str) -> Result<String> {
    serde_json::from_str(&format!("\"{}\"", value))
        .map_err(|e| AppError::MalformedLink(format!("bad credential escape: {}", e)))
}

/// Parse a `Link` header into ICE servers.
///
/// `None` yields no servers. Every entry must match the ice-server form;
/// the first one that does not fails the whole header.
pub fn link_to_ice_servers(links: Option<&str>) -> Result<Vec<IceServerEntry>> {
    let Some(links) = links else {
        return Ok(Vec::new());
    };

    links
        .split(", ")
        .map(|link| {
            let caps = link_pattern()
                .captures(link)
                .ok_or_else(|| AppError::MalformedLink(link.to_string()))?;

            let mut entry = IceServerEntry {
                urls: vec![caps[1].to_string()],
                username: None,
                credential: None,
                credential_type: None,
            };

            if let (Some(username), Some(credential)) = (caps.get(3), caps.get(4)) {
                entry.username = Some(unquote_credential(username.as_str())?);
                entry.credential = Some(unquote_credential(credential.as_str())?);
                entry.credential_type = Some("password".to_string());
            }

            Ok(entry)
        })
        .collect()
}
