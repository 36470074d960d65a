//
// Copyright 2019-2024 MediaHub Authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Proxy-less P2P adapter.
//!
//! No media work: both SDPs come from signaling peers and candidates
//! are relayed straight through to the other side.

use serde_json::Value;

use crate::backend::{
    BackendCx, BackendEvent, BackendKind, BackendSession, ExtOps, MediaBackend, Outcome, Reply,
};
use crate::common::{Reason, Result, SessionType, UpdateKind};
use crate::core::sdp::{Sdp, TrickleCandidate};

#[derive(Debug)]
pub struct P2pBackend;

impl MediaBackend for P2pBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::P2p
    }

    fn supports(&self, session_type: SessionType) -> bool {
        matches!(session_type, SessionType::P2p | SessionType::Call)
    }

    fn init(&self, _cx: &BackendCx) -> Result<Box<dyn BackendSession>> {
        Ok(Box::new(P2pLeg))
    }
}

struct P2pLeg;

impl BackendSession for P2pLeg {
    fn kind(&self) -> BackendKind {
        BackendKind::P2p
    }

    fn start(&mut self, cx: &BackendCx) -> Outcome {
        if cx.offer.is_none() {
            // A p2p leg cannot originate media; the offer must come
            // from a signaling peer.
            return Outcome::Error(Reason::Backend("p2p needs a peer offer".to_string()));
        }
        Outcome::Complete(Reply::with_ext(ExtOps {
            ready: true,
            ..Default::default()
        }))
    }

    fn set_offer(&mut self, _offer: &Sdp, _cx: &BackendCx) -> Outcome {
        Outcome::Complete(Reply::default())
    }

    fn set_answer(&mut self, _answer: &Sdp, _cx: &BackendCx) -> Outcome {
        Outcome::Complete(Reply::default())
    }

    fn update(&mut self, _kind: UpdateKind, _opts: &Value, _cx: &BackendCx) -> Outcome {
        Outcome::Continue
    }

    fn candidate(&mut self, candidate: &TrickleCandidate, _cx: &BackendCx) -> Outcome {
        // Relay to the signaling peer.
        let mut reply = Reply::default();
        reply.emit_candidate = Some(candidate.clone());
        Outcome::Complete(reply)
    }

    fn on_event(&mut self, _event: BackendEvent, _cx: &BackendCx) -> Outcome {
        Outcome::Complete(Reply::default())
    }

    fn stop(&mut self, _reason: &Reason, _cx: &BackendCx) {}
}
