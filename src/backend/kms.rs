//
// Copyright 2019-2024 MediaHub Authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! KMS backend adapter.
//!
//! The engine is fully asynchronous: offer and answer may be generated
//! at any time and candidates stream in both directions. The session
//! core buffers client candidates until this adapter reports ready;
//! engine-side candidates arrive as backend events and are relayed to
//! the signaling peer.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::backend::{
    BackendCx, BackendEvent, BackendKind, BackendSession, ExtOps, MediaBackend, Outcome, Reply,
};
use crate::common::{
    LockGuarded, Reason, Result, ServiceId, SessionId, SessionType, TypeExt, UpdateKind,
};
use crate::core::sdp::{Candidate, Sdp, SdpKind, TrickleCandidate};

/// RPC surface the KMS adapter drives.
pub trait KmsDriver: Send + Sync + fmt::Debug {
    fn create_endpoint(&self, session: SessionId, kind: SdpKind) -> Result<String>;

    /// Process a client offer, returning the engine answer.
    fn process_offer(&self, endpoint: &str, offer: &Sdp) -> Result<Sdp>;

    fn generate_offer(&self, endpoint: &str) -> Result<Sdp>;

    fn process_answer(&self, endpoint: &str, answer: &Sdp) -> Result<()>;

    fn add_candidate(&self, endpoint: &str, candidate: &Candidate) -> Result<()>;

    fn gather_candidates(&self, endpoint: &str) -> Result<()>;

    /// Connect media from one endpoint into another.
    fn connect(&self, from: &str, to: &str) -> Result<()>;

    fn release(&self, endpoint: &str) -> Result<()>;
}

/// Publisher bookkeeping for the SFU model, shared across sessions of
/// the engine.
#[derive(Default)]
struct SfuState {
    /// (service, publisher session) -> endpoint
    publishers: HashMap<(ServiceId, SessionId), String>,
}

pub struct KmsBackend {
    driver: Arc<dyn KmsDriver>,
    sfu: Arc<Mutex<SfuState>>,
}

impl fmt::Debug for KmsBackend {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "kms_backend({:?})", self.driver)
    }
}

impl KmsBackend {
    pub fn new(driver: Arc<dyn KmsDriver>) -> Self {
        Self {
            driver,
            sfu: Arc::new(Mutex::new(SfuState::default())),
        }
    }
}

impl MediaBackend for KmsBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Kms
    }

    fn supports(&self, session_type: SessionType) -> bool {
        matches!(
            session_type,
            SessionType::Park
                | SessionType::Echo
                | SessionType::Proxy
                | SessionType::Publish
                | SessionType::Listen
                | SessionType::Bridge
                | SessionType::Call
        )
    }

    fn init(&self, _cx: &BackendCx) -> Result<Box<dyn BackendSession>> {
        Ok(Box::new(KmsEndpoint {
            driver: Arc::clone(&self.driver),
            sfu: Arc::clone(&self.sfu),
            endpoint: None,
            published: None,
        }))
    }
}

/// Per-session KMS endpoint state.
struct KmsEndpoint {
    driver: Arc<dyn KmsDriver>,
    sfu: Arc<Mutex<SfuState>>,
    endpoint: Option<String>,
    /// Set when this leg registered itself as a publisher.
    published: Option<(ServiceId, SessionId)>,
}

impl KmsEndpoint {
    fn endpoint(&self) -> std::result::Result<&str, Outcome> {
        match self.endpoint.as_deref() {
            Some(ep) => Ok(ep),
            None => Err(Outcome::Error(Reason::Backend(
                "endpoint not created".to_string(),
            ))),
        }
    }

    /// Wire the media topology for the session type.
    fn apply_topology(&mut self, cx: &BackendCx) -> std::result::Result<TypeExt, Outcome> {
        let endpoint = match self.endpoint() {
            Ok(ep) => ep.to_string(),
            Err(out) => return Err(out),
        };
        let mut ext = TypeExt::default();
        match cx.session_type {
            SessionType::Park | SessionType::Call => {}
            SessionType::Echo => {
                if let Err(e) = self.driver.connect(&endpoint, &endpoint) {
                    return Err(Outcome::Error(Reason::Backend(format!("echo: {}", e))));
                }
            }
            SessionType::Publish => {
                let key = (cx.service.clone(), cx.session_id);
                match self.sfu.guarded("kms_sfu") {
                    Ok(mut sfu) => {
                        sfu.publishers.insert(key.clone(), endpoint);
                    }
                    Err(_) => {
                        return Err(Outcome::Error(Reason::Backend("sfu state".to_string())))
                    }
                }
                self.published = Some(key);
                ext.publisher_id = Some(cx.session_id);
            }
            SessionType::Listen => {
                let publisher = match cx.type_ext.publisher_id {
                    Some(p) => p,
                    None => {
                        return Err(Outcome::Error(Reason::Backend(
                            "listen needs publisher_id".to_string(),
                        )))
                    }
                };
                let publisher_ep = match self.sfu.guarded("kms_sfu") {
                    Ok(sfu) => sfu
                        .publishers
                        .get(&(cx.service.clone(), publisher))
                        .cloned(),
                    Err(_) => None,
                };
                let publisher_ep = match publisher_ep {
                    Some(ep) => ep,
                    None => return Err(Outcome::Error(Reason::Backend(
                        "publisher not found".to_string(),
                    ))),
                };
                if let Err(e) = self.driver.connect(&publisher_ep, &endpoint) {
                    return Err(Outcome::Error(Reason::Backend(format!("listen: {}", e))));
                }
                ext.publisher_id = Some(publisher);
            }
            SessionType::Proxy | SessionType::Bridge => {
                if let Some(peer_ep) = cx.peer_ref.as_deref() {
                    for (from, to) in [(endpoint.as_str(), peer_ep), (peer_ep, endpoint.as_str())]
                    {
                        if let Err(e) = self.driver.connect(from, to) {
                            return Err(Outcome::Error(Reason::Backend(format!(
                                "connect: {}",
                                e
                            ))));
                        }
                    }
                    ext.peer_id = cx.type_ext.peer_id;
                }
            }
            SessionType::Mcu | SessionType::P2p => {
                return Err(Outcome::Continue);
            }
        }
        Ok(ext)
    }
}

impl BackendSession for KmsEndpoint {
    fn kind(&self) -> BackendKind {
        BackendKind::Kms
    }

    fn start(&mut self, cx: &BackendCx) -> Outcome {
        let kind = cx.offer.map(|o| o.kind).unwrap_or(SdpKind::Webrtc);
        let endpoint = match self.driver.create_endpoint(cx.session_id, kind) {
            Ok(ep) => ep,
            Err(e) => return Outcome::Error(Reason::Backend(format!("endpoint: {}", e))),
        };
        self.endpoint = Some(endpoint.clone());

        let ext_type = match self.apply_topology(cx) {
            Ok(ext) => ext,
            Err(out) => return out,
        };

        let mut ext = ExtOps {
            backend_ref: Some(endpoint.clone()),
            type_ext: Some(ext_type),
            ready: true,
            ..Default::default()
        };

        match cx.offer {
            Some(offer) => match self.driver.process_offer(&endpoint, offer) {
                Ok(answer) => {
                    ext.answer = Some(answer);
                }
                Err(e) => return Outcome::Error(Reason::Backend(format!("offer: {}", e))),
            },
            None => match self.driver.generate_offer(&endpoint) {
                Ok(offer) => {
                    ext.offer = Some(offer);
                }
                Err(e) => return Outcome::Error(Reason::Backend(format!("offer: {}", e))),
            },
        }
        if let Err(e) = self.driver.gather_candidates(&endpoint) {
            return Outcome::Error(Reason::Backend(format!("gather: {}", e)));
        }
        Outcome::Complete(Reply::with_ext(ext))
    }

    fn set_offer(&mut self, offer: &Sdp, _cx: &BackendCx) -> Outcome {
        let endpoint = match self.endpoint() {
            Ok(ep) => ep.to_string(),
            Err(out) => return out,
        };
        match self.driver.process_offer(&endpoint, offer) {
            Ok(answer) => Outcome::Complete(Reply::with_ext(ExtOps {
                answer: Some(answer),
                ready: true,
                ..Default::default()
            })),
            Err(e) => Outcome::Error(Reason::Backend(format!("offer: {}", e))),
        }
    }

    fn set_answer(&mut self, answer: &Sdp, _cx: &BackendCx) -> Outcome {
        let endpoint = match self.endpoint() {
            Ok(ep) => ep.to_string(),
            Err(out) => return out,
        };
        match self.driver.process_answer(&endpoint, answer) {
            Ok(()) => Outcome::Complete(Reply::default()),
            Err(e) => Outcome::Error(Reason::Backend(format!("answer: {}", e))),
        }
    }

    fn update(&mut self, kind: UpdateKind, opts: &Value, cx: &BackendCx) -> Outcome {
        match kind {
            UpdateKind::ListenSwitch => {
                let endpoint = match self.endpoint() {
                    Ok(ep) => ep.to_string(),
                    Err(out) => return out,
                };
                let publisher = opts
                    .get("publisher_id")
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse::<SessionId>().ok());
                let publisher = match publisher {
                    Some(p) => p,
                    None => {
                        return Outcome::Error(Reason::Backend(
                            "listen_switch needs publisher_id".to_string(),
                        ))
                    }
                };
                let publisher_ep = match self.sfu.guarded("kms_sfu") {
                    Ok(sfu) => sfu
                        .publishers
                        .get(&(cx.service.clone(), publisher))
                        .cloned(),
                    Err(_) => None,
                };
                match publisher_ep {
                    Some(pub_ep) => match self.driver.connect(&pub_ep, &endpoint) {
                        Ok(()) => Outcome::Complete(Reply::with_ext(ExtOps {
                            type_ext: Some(TypeExt {
                                publisher_id: Some(publisher),
                                ..Default::default()
                            }),
                            ..Default::default()
                        })),
                        Err(e) => Outcome::Error(Reason::Backend(format!("switch: {}", e))),
                    },
                    None => Outcome::Error(Reason::Backend("publisher not found".to_string())),
                }
            }
            UpdateKind::Media => Outcome::Complete(Reply::default()),
            UpdateKind::SessionType | UpdateKind::McuLayout | UpdateKind::Info => {
                Outcome::Continue
            }
        }
    }

    fn candidate(&mut self, candidate: &TrickleCandidate, _cx: &BackendCx) -> Outcome {
        let endpoint = match self.endpoint() {
            Ok(ep) => ep.to_string(),
            Err(out) => return out,
        };
        match candidate {
            TrickleCandidate::Candidate(c) => match self.driver.add_candidate(&endpoint, c) {
                Ok(()) => Outcome::Complete(Reply::default()),
                Err(e) => Outcome::Error(Reason::Backend(format!("candidate: {}", e))),
            },
            TrickleCandidate::End => Outcome::Complete(Reply::default()),
        }
    }

    fn on_event(&mut self, event: BackendEvent, _cx: &BackendCx) -> Outcome {
        match event {
            BackendEvent::Ready => Outcome::Complete(Reply::with_ext(ExtOps {
                ready: true,
                ..Default::default()
            })),
            BackendEvent::RemoteCandidate(candidate) => {
                let mut reply = Reply::default();
                reply.emit_candidate = Some(candidate);
                Outcome::Complete(reply)
            }
            BackendEvent::MediaOffer(offer) => Outcome::Complete(Reply::with_ext(ExtOps {
                offer: Some(offer),
                ready: true,
                ..Default::default()
            })),
            BackendEvent::MediaAnswer(answer) => Outcome::Complete(Reply::with_ext(ExtOps {
                answer: Some(answer),
                ready: true,
                ..Default::default()
            })),
            BackendEvent::ChannelStop { cause } => Outcome::Error(Reason::Backend(cause)),
            BackendEvent::Disconnected => Outcome::Error(Reason::MediaServerDown),
            _ => Outcome::Complete(Reply::default()),
        }
    }

    fn stop(&mut self, _reason: &Reason, _cx: &BackendCx) {
        if let Some(key) = self.published.take() {
            if let Ok(mut sfu) = self.sfu.guarded("kms_sfu") {
                sfu.publishers.remove(&key);
            }
        }
        if let Some(endpoint) = self.endpoint.take() {
            if let Err(e) = self.driver.release(&endpoint) {
                warn!("kms: release of endpoint {} failed: {}", endpoint, e);
            }
        }
    }
}

impl fmt::Debug for KmsEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "kms_endpoint({:?})", self.endpoint)
    }
}
