//
// Copyright 2019-2024 MediaHub Authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! SDP payloads and trickle-ICE candidates as the core handles them.
//!
//! No SDP rewriting happens here beyond trickle-ICE aggregation: a
//! backend that cannot take incremental candidates gets the buffered
//! lines folded into the body before the start proceeds.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Whether an SDP describes a WebRTC or a plain RTP endpoint.
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SdpKind {
    Webrtc,
    Rtp,
}

/// One side of an offer/answer exchange.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sdp {
    pub body: String,
    pub kind: SdpKind,
    /// The description advertises trickle ICE; candidates follow
    /// incrementally.
    #[serde(default)]
    pub trickle_ice: bool,
}

impl Sdp {
    pub fn new(body: impl Into<String>, kind: SdpKind) -> Self {
        Self {
            body: body.into(),
            kind,
            trickle_ice: false,
        }
    }

    pub fn with_trickle(mut self) -> Self {
        self.trickle_ice = true;
        self
    }

    pub fn to_redacted_string(&self) -> String {
        format!(
            "sdp: {}, kind: {}, trickle: {}",
            redact_sdp(&self.body),
            self.kind,
            self.trickle_ice
        )
    }
}

impl fmt::Display for Sdp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_redacted_string())
    }
}

impl fmt::Debug for Sdp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// One trickle-ICE candidate.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Candidate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    #[serde(default)]
    pub mline_index: u32,
    pub body: String,
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "candidate: mline: {}, {}",
            self.mline_index,
            redact_sdp(&self.body)
        )
    }
}

/// A candidate submission: either a candidate or the end-of-candidates
/// sentinel.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrickleCandidate {
    Candidate(Candidate),
    End,
}

impl fmt::Display for TrickleCandidate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Candidate(c) => write!(f, "{}", c),
            Self::End => write!(f, "end_of_candidates"),
        }
    }
}

/// Fold buffered candidates into an SDP body for a backend that needs
/// a complete description. Arrival order is preserved.
pub fn aggregate_candidates(sdp: &Sdp, candidates: &[Candidate]) -> Sdp {
    let mut body = sdp.body.clone();
    if !body.ends_with('\n') && !body.is_empty() {
        body.push_str("\r\n");
    }
    for candidate in candidates {
        let line = candidate.body.trim();
        if !line.starts_with("a=") {
            body.push_str("a=");
        }
        body.push_str(line);
        body.push_str("\r\n");
    }
    body.push_str("a=end-of-candidates\r\n");
    Sdp {
        body,
        kind: sdp.kind,
        trickle_ice: false,
    }
}

/// Replace address-bearing SDP content in log output. IPs and
/// candidate foundations are the interesting part to hide; the media
/// section shape is kept.
pub fn redact_sdp(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for (i, line) in text.lines().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        if line.starts_with("c=") || line.contains("candidate") {
            match line.split_once(' ') {
                Some((head, _)) => {
                    out.push_str(head);
                    out.push_str(" [redacted]");
                }
                None => out.push_str("[redacted]"),
            }
        } else {
            out.push_str(line);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer() -> Sdp {
        Sdp::new("v=0\r\nm=audio 9 RTP/AVP 0", SdpKind::Webrtc).with_trickle()
    }

    #[test]
    fn aggregation_appends_in_arrival_order() {
        let candidates = vec![
            Candidate {
                mid: None,
                mline_index: 0,
                body: "candidate:1 1 UDP 1 10.0.0.1 4000 typ host".to_string(),
            },
            Candidate {
                mid: None,
                mline_index: 0,
                body: "a=candidate:2 1 UDP 2 10.0.0.2 4002 typ host".to_string(),
            },
        ];
        let full = aggregate_candidates(&offer(), &candidates);
        let first = full.body.find("candidate:1").unwrap();
        let second = full.body.find("candidate:2").unwrap();
        assert!(first < second);
        assert!(full.body.ends_with("a=end-of-candidates\r\n"));
        assert!(!full.trickle_ice);
    }

    #[test]
    fn redaction_hides_addresses() {
        let redacted = redact_sdp("v=0\r\nc=IN IP4 192.168.1.10\r\na=sendrecv");
        assert!(!redacted.contains("192.168.1.10"));
        assert!(redacted.contains("a=sendrecv"));
    }
}
