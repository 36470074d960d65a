//
// Copyright 2019-2024 MediaHub Authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! FS backend adapter.
//!
//! Every media operation is a dialplan-inline transfer ("park",
//! "echo", `conference:ROOM@TYPE`) followed by a `parked` or `bridged`
//! confirmation from the engine. Leg creation goes through the
//! engine's WebRTC profile for webrtc SDPs and through the SIP profile
//! for plain RTP; the driver hides the RPC itself.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::backend::{
    BackendCx, BackendEvent, BackendKind, BackendSession, ExtOps, MediaBackend, Outcome, PendingOp,
    Reply,
};
use crate::common::{Reason, Result, SessionId, SessionType, TypeExt, UpdateKind};
use crate::core::sdp::{Sdp, SdpKind, TrickleCandidate};

/// Conference type applied when an MCU join does not name one.
pub const DEFAULT_ROOM_TYPE: &str = "video-mcu-stereo";

/// Engine profile names; the driver picks the leg creation path from
/// the SDP kind.
pub const WEBRTC_PROFILE: &str = "verto.rtc";
pub const RTP_PROFILE: &str = "internal";

/// A freshly created engine leg and the SDP it produced.
pub struct FsStart {
    pub leg_ref: String,
    pub sdp: Sdp,
}

/// RPC surface the FS adapter drives. Implemented over the real engine
/// connection by the embedder and by a simulated engine in tests.
pub trait FsDriver: Send + Sync + fmt::Debug {
    /// Create a leg answering an externally supplied offer. Returns
    /// the leg reference and the generated answer.
    fn start_in(&self, session: SessionId, kind: SdpKind, offer: &Sdp) -> Result<FsStart>;

    /// Create an originating leg. Returns the leg reference and the
    /// generated offer.
    fn start_out(&self, session: SessionId, kind: SdpKind) -> Result<FsStart>;

    /// Complete an originating leg with the remote answer.
    fn finish_out(&self, leg: &str, answer: &Sdp) -> Result<()>;

    fn transfer(&self, leg: &str, dialplan: &str) -> Result<()>;

    fn bridge(&self, leg: &str, peer_leg: &str) -> Result<()>;

    fn set_var(&self, leg: &str, name: &str, value: &str) -> Result<()>;

    /// Online layout command against a running conference.
    fn conf_layout(&self, room: &str, layout: &str) -> Result<()>;

    fn dtmf(&self, leg: &str, digits: &str) -> Result<()>;

    fn hangup(&self, leg: &str) -> Result<()>;
}

#[derive(Debug)]
pub struct FsBackend {
    driver: Arc<dyn FsDriver>,
}

impl FsBackend {
    pub fn new(driver: Arc<dyn FsDriver>) -> Self {
        Self { driver }
    }
}

impl MediaBackend for FsBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Fs
    }

    fn supports(&self, session_type: SessionType) -> bool {
        matches!(
            session_type,
            SessionType::Park
                | SessionType::Echo
                | SessionType::Mcu
                | SessionType::Bridge
                | SessionType::Call
        )
    }

    fn init(&self, _cx: &BackendCx) -> Result<Box<dyn BackendSession>> {
        Ok(Box::new(FsLeg {
            driver: Arc::clone(&self.driver),
            leg: None,
            pending: None,
            park_after_bridge: false,
        }))
    }
}

/// Per-session FS leg state.
struct FsLeg {
    driver: Arc<dyn FsDriver>,
    leg: Option<String>,
    pending: Option<PendingOp>,
    park_after_bridge: bool,
}

impl FsLeg {
    fn leg(&self) -> std::result::Result<&str, Outcome> {
        match self.leg.as_deref() {
            Some(leg) => Ok(leg),
            None => Err(Outcome::Error(Reason::Backend("leg not started".to_string()))),
        }
    }

    /// Dialplan target for a media operation, if the type maps to one.
    fn dialplan_for(session_type: SessionType, ext: &TypeExt) -> Option<String> {
        match session_type {
            SessionType::Park | SessionType::Call => Some("park".to_string()),
            SessionType::Echo => Some("echo".to_string()),
            SessionType::Mcu => {
                let room = ext.room_id.as_deref().unwrap_or("room");
                let room_type = ext.room_type.as_deref().unwrap_or(DEFAULT_ROOM_TYPE);
                Some(format!("conference:{}@{}", room, room_type))
            }
            _ => None,
        }
    }

    /// Transfer the leg into the dialplan app for `session_type` and
    /// wait for the parked confirmation.
    fn transfer_to(&mut self, session_type: SessionType, mut ext_ops: ExtOps) -> Outcome {
        let leg = match self.leg() {
            Ok(leg) => leg.to_string(),
            Err(out) => return out,
        };
        let ext = ext_ops.type_ext.clone().unwrap_or_default();
        let dialplan = match Self::dialplan_for(session_type, &ext) {
            Some(d) => d,
            None => return Outcome::Error(Reason::Backend("no dialplan".to_string())),
        };
        if let Err(e) = self.driver.transfer(&leg, &dialplan) {
            return Outcome::Error(Reason::Backend(format!("transfer: {}", e)));
        }
        ext_ops.session_type = Some(session_type);
        self.pending = Some(PendingOp::Parked);
        Outcome::Pending {
            op: PendingOp::Parked,
            ext: ext_ops,
        }
    }

    fn mcu_ext(cx: &BackendCx) -> TypeExt {
        TypeExt {
            room_id: Some(
                cx.type_ext
                    .room_id
                    .clone()
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            ),
            room_type: Some(
                cx.type_ext
                    .room_type
                    .clone()
                    .unwrap_or_else(|| DEFAULT_ROOM_TYPE.to_string()),
            ),
            ..Default::default()
        }
    }
}

impl BackendSession for FsLeg {
    fn kind(&self) -> BackendKind {
        BackendKind::Fs
    }

    fn start(&mut self, cx: &BackendCx) -> Outcome {
        let kind = cx.offer.map(|o| o.kind).unwrap_or(SdpKind::Webrtc);
        let started = match cx.offer {
            Some(offer) => self.driver.start_in(cx.session_id, kind, offer),
            None => self.driver.start_out(cx.session_id, kind),
        };
        let started = match started {
            Ok(s) => s,
            Err(e) => return Outcome::Error(Reason::Backend(format!("start: {}", e))),
        };
        self.leg = Some(started.leg_ref.clone());

        let mut ext = ExtOps {
            backend_ref: Some(started.leg_ref),
            ready: true,
            ..Default::default()
        };
        if cx.offer.is_some() {
            ext.answer = Some(started.sdp);
        } else {
            ext.offer = Some(started.sdp);
        }
        if cx.session_type == SessionType::Mcu {
            ext.type_ext = Some(Self::mcu_ext(cx));
        }
        self.transfer_to(cx.session_type, ext)
    }

    fn set_offer(&mut self, _offer: &Sdp, _cx: &BackendCx) -> Outcome {
        // Legs are created from the offer in start(); a later offer
        // has nowhere to go.
        Outcome::Error(Reason::Backend("offer already consumed".to_string()))
    }

    fn set_answer(&mut self, answer: &Sdp, _cx: &BackendCx) -> Outcome {
        let leg = match self.leg() {
            Ok(leg) => leg.to_string(),
            Err(out) => return out,
        };
        match self.driver.finish_out(&leg, answer) {
            Ok(()) => Outcome::Complete(Reply::default()),
            Err(e) => Outcome::Error(Reason::Backend(format!("answer: {}", e))),
        }
    }

    fn update(&mut self, kind: UpdateKind, opts: &Value, cx: &BackendCx) -> Outcome {
        match kind {
            UpdateKind::SessionType => {
                let target = opts
                    .get("session_type")
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse::<SessionType>().ok());
                match target {
                    Some(SessionType::Bridge) => self.update_bridge(cx),
                    Some(SessionType::Mcu) => {
                        let mut ext = Self::mcu_ext(cx);
                        if let Some(room) = opts.get("room_id").and_then(Value::as_str) {
                            ext.room_id = Some(room.to_string());
                        }
                        if let Some(room_type) = opts.get("room_type").and_then(Value::as_str) {
                            ext.room_type = Some(room_type.to_string());
                        }
                        self.transfer_to(
                            SessionType::Mcu,
                            ExtOps {
                                type_ext: Some(ext),
                                ..Default::default()
                            },
                        )
                    }
                    Some(target @ (SessionType::Park | SessionType::Echo)) => self.transfer_to(
                        target,
                        ExtOps {
                            type_ext: Some(TypeExt::default()),
                            ..Default::default()
                        },
                    ),
                    _ => Outcome::Error(Reason::Backend("unsupported session_type".to_string())),
                }
            }
            UpdateKind::McuLayout => {
                let layout = opts.get("mcu_layout").and_then(Value::as_str);
                let room = cx.type_ext.room_id.as_deref();
                match (room, layout) {
                    (Some(room), Some(layout)) => match self.driver.conf_layout(room, layout) {
                        Ok(()) => Outcome::Complete(Reply::with_ext(ExtOps {
                            type_ext: Some(TypeExt {
                                mcu_layout: Some(layout.to_string()),
                                ..Default::default()
                            }),
                            ..Default::default()
                        })),
                        Err(e) => Outcome::Error(Reason::Backend(format!("layout: {}", e))),
                    },
                    _ => Outcome::Error(Reason::Backend("not in a conference".to_string())),
                }
            }
            UpdateKind::Info => {
                let digits = opts.get("dtmf").and_then(Value::as_str).unwrap_or_default();
                let leg = match self.leg() {
                    Ok(leg) => leg.to_string(),
                    Err(out) => return out,
                };
                match self.driver.dtmf(&leg, digits) {
                    Ok(()) => Outcome::Complete(Reply::default()),
                    Err(e) => Outcome::Error(Reason::Backend(format!("dtmf: {}", e))),
                }
            }
            UpdateKind::Media | UpdateKind::ListenSwitch => Outcome::Continue,
        }
    }

    fn candidate(&mut self, _candidate: &TrickleCandidate, _cx: &BackendCx) -> Outcome {
        // The engine negotiates ICE itself once it has a complete SDP;
        // late candidates carry nothing it needs.
        Outcome::Complete(Reply::default())
    }

    fn on_event(&mut self, event: BackendEvent, cx: &BackendCx) -> Outcome {
        match event {
            BackendEvent::Parked => match self.pending.take() {
                Some(PendingOp::Parked) => Outcome::Complete(Reply::default()),
                Some(PendingOp::Bridged { .. }) => {
                    // Parked instead of bridged: the bridge never came
                    // up.
                    Outcome::Error(Reason::Backend("parked while bridging".to_string()))
                }
                _ => {
                    if cx.session_type == SessionType::Bridge && self.park_after_bridge {
                        // Unexpected park while bridged: the peer leg
                        // went away. The session resets this leg to
                        // park.
                        Outcome::Complete(Reply::with_ext(ExtOps {
                            session_type: Some(SessionType::Park),
                            type_ext: Some(TypeExt::default()),
                            ..Default::default()
                        }))
                    } else {
                        Outcome::Complete(Reply::default())
                    }
                }
            },
            BackendEvent::Bridged { .. } => {
                self.park_after_bridge = true;
                match self.pending.take() {
                    Some(PendingOp::Bridged { peer }) => {
                        Outcome::Complete(Reply::with_ext(ExtOps {
                            session_type: Some(SessionType::Bridge),
                            type_ext: Some(TypeExt {
                                peer_id: Some(peer),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }))
                    }
                    _ => Outcome::Complete(Reply::default()),
                }
            }
            BackendEvent::ChannelStop { cause } => Outcome::Error(Reason::Backend(cause)),
            BackendEvent::Disconnected => Outcome::Error(Reason::MediaServerDown),
            BackendEvent::McuInfo(_) => Outcome::Complete(Reply::default()),
            _ => Outcome::Complete(Reply::default()),
        }
    }

    fn stop(&mut self, _reason: &Reason, _cx: &BackendCx) {
        if let Some(leg) = self.leg.take() {
            if let Err(e) = self.driver.hangup(&leg) {
                warn!("fs: hangup of leg {} failed: {}", leg, e);
            }
        }
    }

    fn needs_full_sdp(&self) -> bool {
        true
    }
}

impl FsLeg {
    fn update_bridge(&mut self, cx: &BackendCx) -> Outcome {
        let leg = match self.leg() {
            Ok(leg) => leg.to_string(),
            Err(out) => return out,
        };
        let peer_id = match cx.type_ext.peer_id {
            Some(peer) => peer,
            None => return Outcome::Error(Reason::Backend("bridge needs peer_id".to_string())),
        };
        let peer_leg = match cx.peer_ref.as_deref() {
            Some(p) => p.to_string(),
            None => return Outcome::Error(Reason::Backend("peer leg not started".to_string())),
        };

        // Both legs must survive the bridge ending; they return to
        // park instead of hanging up.
        for l in [leg.as_str(), peer_leg.as_str()] {
            if let Err(e) = self.driver.set_var(l, "park_after_bridge", "true") {
                return Outcome::Error(Reason::Backend(format!("set_var: {}", e)));
            }
        }
        self.park_after_bridge = true;

        if let Err(e) = self.driver.bridge(&leg, &peer_leg) {
            return Outcome::Error(Reason::Backend(format!("bridge: {}", e)));
        }
        self.pending = Some(PendingOp::Bridged { peer: peer_id });
        Outcome::Pending {
            op: PendingOp::Bridged { peer: peer_id },
            ext: ExtOps::default(),
        }
    }
}
