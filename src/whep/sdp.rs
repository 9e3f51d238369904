//! SDP text helpers for the WHEP offer/trickle exchange
//!
//! Everything here is plain string manipulation on CRLF-delimited SDP.
//! The peer connection never sees these helpers' output except through
//! `edit_offer`, which rewrites the local offer before it is sent.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::signaling::IceCandidate;

const LINE_BREAK: &str = "\r\n";
const MEDIA_PREFIX: &str = "m=";
const ICE_UFRAG_PREFIX: &str = "a=ice-ufrag:";
const ICE_PWD_PREFIX: &str = "a=ice-pwd:";
const RTPMAP_PREFIX: &str = "a=rtpmap:";

/// ICE credentials and media lines of a local offer
///
/// Built once per offer and consumed when generating trickle fragments.
/// `medias[i]` is the remainder of the i-th `m=` line, so the index matches
/// the candidates' `sdpMLineIndex`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferDescriptor {
    pub ice_ufrag: String,
    pub ice_pwd: String,
    pub medias: Vec<String>,
}

/// Extract ICE credentials and media lines from an offer.
///
/// Only the first `a=ice-ufrag:` / `a=ice-pwd:` are kept (one bundled
/// credential set). Missing credentials leave the fields empty.
pub fn parse_offer(sdp: &str) -> OfferDescriptor {
    let mut ret = OfferDescriptor::default();

    for line in sdp.split(LINE_BREAK) {
        if let Some(media) = line.strip_prefix(MEDIA_PREFIX) {
            ret.medias.push(media.to_string());
        } else if ret.ice_ufrag.is_empty() && line.starts_with(ICE_UFRAG_PREFIX) {
            ret.ice_ufrag = line[ICE_UFRAG_PREFIX.len()..].to_string();
        } else if ret.ice_pwd.is_empty() && line.starts_with(ICE_PWD_PREFIX) {
            ret.ice_pwd = line[ICE_PWD_PREFIX.len()..].to_string();
        }
    }

    ret
}

/// Ask for stereo Opus in one media section.
///
/// Finds the Opus payload type from its `a=rtpmap` line and appends
/// `;stereo=1` / `;sprop-stereo=1` to the matching `a=fmtp` line when they
/// are not already there. Sections without Opus come back untouched.
pub fn enable_stereo_opus(section: &str) -> String {
    let mut lines: Vec<String> = section.split(LINE_BREAK).map(str::to_string).collect();

    let payload = lines.iter().find_map(|line| {
        let rest = line.strip_prefix(RTPMAP_PREFIX)?;
        if line.to_ascii_lowercase().contains("opus/") {
            rest.split(' ').next().map(str::to_string)
        } else {
            None
        }
    });

    let Some(payload) = payload else {
        return section.to_string();
    };

    let fmtp_prefix = format!("a=fmtp:{} ", payload);
    for line in lines.iter_mut().filter(|l| l.starts_with(&fmtp_prefix)) {
        // "sprop-stereo" also contains "stereo"; the plain check runs first on purpose
        if !line.contains("stereo") {
            line.push_str(";stereo=1");
        }
        if !line.contains("sprop-stereo") {
            line.push_str(";sprop-stereo=1");
        }
    }

    lines.join(LINE_BREAK)
}

/// Rewrite every audio section of an offer to request stereo Opus.
pub fn edit_offer(sdp: &mut String) {
    let sections: Vec<String> = sdp
        .split(MEDIA_PREFIX)
        .map(|section| {
            if section.starts_with("audio") {
                enable_stereo_opus(section)
            } else {
                section.to_string()
            }
        })
        .collect();

    *sdp = sections.join(MEDIA_PREFIX);
}

/// Build the `application/trickle-ice-sdpfrag` body for a batch of candidates.
///
/// Candidates are grouped by media-line index; media lines without any
/// candidate are left out. Order follows the descriptor's media order and,
/// inside a group, the order candidates were given in.
pub fn generate_sdp_fragment(offer: &OfferDescriptor, candidates: &[IceCandidate]) -> String {
    let mut by_media: HashMap<u16, Vec<&IceCandidate>> = HashMap::new();
    for candidate in candidates {
        // a candidate without an index cannot be attributed to a media line
        if let Some(index) = candidate.sdp_mline_index {
            by_media.entry(index).or_default().push(candidate);
        }
    }

    let mut frag = format!(
        "{}{}{}{}{}{}",
        ICE_UFRAG_PREFIX, offer.ice_ufrag, LINE_BREAK, ICE_PWD_PREFIX, offer.ice_pwd, LINE_BREAK
    );

    for (mid, media) in offer.medias.iter().enumerate() {
        let Some(group) = u16::try_from(mid).ok().and_then(|i| by_media.get(&i)) else {
            continue;
        };

        frag.push_str(&format!("m={}{}a=mid:{}{}", media, LINE_BREAK, mid, LINE_BREAK));
        for candidate in group {
            frag.push_str(&format!("a={}{}", candidate.candidate, LINE_BREAK));
        }
    }

    frag
}
