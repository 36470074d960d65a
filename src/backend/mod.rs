//
// Copyright 2019-2024 MediaHub Authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Backend adapter interface.
//!
//! One `MediaBackend` per engine; `init` produces the per-session
//! adapter state that the session FSM owns and drives. Every mutating
//! operation returns an [`Outcome`]; `Continue` lets the next adapter
//! in the chain claim the operation, `Pending` parks the operation
//! until the engine reports back.

pub mod fs;
pub mod kms;
pub mod p2p;

use std::fmt;

use serde_json::Value;

use crate::common::{Reason, Result, ServiceId, SessionId, SessionType, TypeExt, UpdateKind};
use crate::core::sdp::{Sdp, TrickleCandidate};

#[derive(Clone, Copy, PartialEq, Eq, Debug, strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum BackendKind {
    Fs,
    Kms,
    P2p,
}

/// Read-only view of the owning session handed to every adapter call.
pub struct BackendCx<'a> {
    pub session_id: SessionId,
    pub service: &'a ServiceId,
    pub session_type: SessionType,
    pub type_ext: &'a TypeExt,
    pub offer: Option<&'a Sdp>,
    pub answer: Option<&'a Sdp>,
    /// Backend-side reference of the bridge peer leg, resolved by the
    /// session before a bridge operation.
    pub peer_ref: Option<String>,
}

/// Requested session attribute mutations, applied atomically with the
/// operation's reply and before any outbound event.
#[derive(Clone, Default, Debug)]
pub struct ExtOps {
    pub offer: Option<Sdp>,
    pub answer: Option<Sdp>,
    pub session_type: Option<SessionType>,
    pub type_ext: Option<TypeExt>,
    /// Engine-side leg/endpoint reference, visible to bridge peers.
    pub backend_ref: Option<String>,
    /// The backend can accept trickle candidates from here on.
    pub ready: bool,
}

/// Reply attached to a completed operation.
#[derive(Clone, Default, Debug)]
pub struct Reply {
    pub ext: ExtOps,
    /// Candidate to relay to the signaling peer (P2P forwarding, KMS
    /// server-side candidates).
    pub emit_candidate: Option<TrickleCandidate>,
}

impl Reply {
    pub fn with_ext(ext: ExtOps) -> Self {
        Self {
            ext,
            emit_candidate: None,
        }
    }
}

/// What a parked operation is waiting for.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum PendingOp {
    /// Await the engine's `parked` confirmation.
    Parked,
    /// Await the engine's `bridged` confirmation for a peer leg.
    Bridged { peer: SessionId },
    /// Await asynchronously generated media (offer or answer).
    Media,
}

impl fmt::Display for PendingOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Parked => write!(f, "parked"),
            Self::Bridged { peer } => write!(f, "bridged({})", peer),
            Self::Media => write!(f, "media"),
        }
    }
}

pub enum Outcome {
    Complete(Reply),
    Pending { op: PendingOp, ext: ExtOps },
    Error(Reason),
    /// Not this adapter's operation; fall through to the next one.
    Continue,
}

impl fmt::Debug for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Complete(_) => write!(f, "complete"),
            Self::Pending { op, .. } => write!(f, "pending({})", op),
            Self::Error(reason) => write!(f, "error({})", reason),
            Self::Continue => write!(f, "continue"),
        }
    }
}

/// Asynchronous notifications from a media engine, routed into the
/// owning session's FSM.
#[derive(Clone, Debug)]
pub enum BackendEvent {
    /// The leg reached the neutral parked state.
    Parked,
    /// The leg was bridged to a peer leg.
    Bridged { peer_ref: String },
    /// The engine tore the leg down.
    ChannelStop { cause: String },
    /// The engine connection is gone.
    Disconnected,
    /// Conference bookkeeping for an MCU leg.
    McuInfo(Value),
    /// The endpoint can take candidates now.
    Ready,
    /// Engine-side trickle candidate toward the client.
    RemoteCandidate(TrickleCandidate),
    /// Asynchronously generated local media.
    MediaOffer(Sdp),
    MediaAnswer(Sdp),
}

impl fmt::Display for BackendEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Parked => write!(f, "parked"),
            Self::Bridged { peer_ref } => write!(f, "bridged({})", peer_ref),
            Self::ChannelStop { cause } => write!(f, "channel_stop({})", cause),
            Self::Disconnected => write!(f, "disconnected"),
            Self::McuInfo(_) => write!(f, "mcu_info"),
            Self::Ready => write!(f, "ready"),
            Self::RemoteCandidate(c) => write!(f, "remote_{}", c),
            Self::MediaOffer(_) => write!(f, "media_offer"),
            Self::MediaAnswer(_) => write!(f, "media_answer"),
        }
    }
}

/// Engine-level plugin. One instance per engine, shared across
/// sessions.
pub trait MediaBackend: Send + Sync + fmt::Debug {
    fn kind(&self) -> BackendKind;

    fn supports(&self, session_type: SessionType) -> bool;

    /// Per-session adapter state. Owned by the session FSM.
    fn init(&self, cx: &BackendCx) -> Result<Box<dyn BackendSession>>;
}

/// Per-session adapter state machine.
pub trait BackendSession: Send {
    fn kind(&self) -> BackendKind;

    fn start(&mut self, cx: &BackendCx) -> Outcome;

    fn set_offer(&mut self, offer: &Sdp, cx: &BackendCx) -> Outcome;

    fn set_answer(&mut self, answer: &Sdp, cx: &BackendCx) -> Outcome;

    fn update(&mut self, kind: UpdateKind, opts: &Value, cx: &BackendCx) -> Outcome;

    fn candidate(&mut self, candidate: &TrickleCandidate, cx: &BackendCx) -> Outcome;

    fn on_event(&mut self, event: BackendEvent, cx: &BackendCx) -> Outcome;

    fn stop(&mut self, reason: &Reason, cx: &BackendCx);

    /// The engine cannot take incremental candidates; a trickle offer
    /// must be aggregated before start.
    fn needs_full_sdp(&self) -> bool {
        false
    }
}
