//
// Copyright 2019-2024 MediaHub Authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Common test utilities: simulated engine drivers and wire peers.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;

use mediahub::backend::fs::{FsDriver, FsStart};
use mediahub::backend::kms::KmsDriver;
use mediahub::backend::p2p::P2pBackend;
use mediahub::backend::BackendEvent;
use mediahub::common::{DialogHandle, RequestHandle, Result, ServiceId, SessionId};
use mediahub::config::Config;
use mediahub::core::hub::Hub;
use mediahub::core::sdp::{Candidate, Sdp, SdpKind};
use mediahub::signaling::api::ApiSocket;
use mediahub::signaling::sip::SipEndpoint;
use mediahub::signaling::verto::VertoSocket;

pub fn test_init() {
    let level = if std::env::var("DEBUG_TESTS").is_ok() {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Error
    };
    let _ = env_logger::builder()
        .filter_level(level)
        .is_test(true)
        .try_init();
}

/// Poll `predicate` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

pub fn service() -> ServiceId {
    ServiceId::new("test-svc")
}

pub fn webrtc_offer() -> Sdp {
    Sdp::new("v=0\r\no=- 1 1 IN IP4 10.0.0.1\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111", SdpKind::Webrtc)
}

pub fn rtp_offer() -> Sdp {
    Sdp::new("v=0\r\no=- 2 2 IN IP4 10.0.0.2\r\nm=audio 4000 RTP/AVP 0", SdpKind::Rtp)
}

pub fn webrtc_answer() -> Sdp {
    Sdp::new("v=0\r\no=- 3 3 IN IP4 10.0.0.3\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111", SdpKind::Webrtc)
}

////////////////////////////////////////////////////////////////////////
// Simulated FS engine
////////////////////////////////////////////////////////////////////////

#[derive(Debug, Default)]
pub struct SimFsDriver {
    hub: Mutex<Option<Hub>>,
    legs: Mutex<HashMap<String, SessionId>>,
    ops: Mutex<Vec<String>>,
    /// SDP bodies handed to start_in, for aggregation assertions.
    start_bodies: Mutex<Vec<String>>,
}

impl SimFsDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_hub(&self, hub: Hub) {
        *self.hub.lock().unwrap() = Some(hub);
    }

    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    pub fn start_bodies(&self) -> Vec<String> {
        self.start_bodies.lock().unwrap().clone()
    }

    fn record(&self, op: String) {
        self.ops.lock().unwrap().push(op);
    }

    fn event(&self, leg: &str, event: BackendEvent) {
        let session = self.legs.lock().unwrap().get(leg).copied();
        let hub = self.hub.lock().unwrap().clone();
        if let (Some(session), Some(hub)) = (session, hub) {
            let _ = hub.backend_event(&session, event);
        }
    }
}

impl FsDriver for SimFsDriver {
    fn start_in(&self, session: SessionId, kind: SdpKind, offer: &Sdp) -> Result<FsStart> {
        let leg = format!("leg-{}", session);
        self.legs.lock().unwrap().insert(leg.clone(), session);
        self.record(format!("start_in:{}", kind));
        self.start_bodies.lock().unwrap().push(offer.body.clone());
        Ok(FsStart {
            leg_ref: leg,
            sdp: Sdp::new(format!("v=0\r\nfs-answer-{}", session), kind),
        })
    }

    fn start_out(&self, session: SessionId, kind: SdpKind) -> Result<FsStart> {
        let leg = format!("leg-{}", session);
        self.legs.lock().unwrap().insert(leg.clone(), session);
        self.record(format!("start_out:{}", kind));
        Ok(FsStart {
            leg_ref: leg,
            sdp: Sdp::new(format!("v=0\r\nfs-offer-{}", session), kind),
        })
    }

    fn finish_out(&self, leg: &str, _answer: &Sdp) -> Result<()> {
        self.record(format!("finish_out:{}", leg));
        Ok(())
    }

    fn transfer(&self, leg: &str, dialplan: &str) -> Result<()> {
        self.record(format!("transfer:{}:{}", leg, dialplan));
        self.event(leg, BackendEvent::Parked);
        Ok(())
    }

    fn bridge(&self, leg: &str, peer_leg: &str) -> Result<()> {
        self.record(format!("bridge:{}:{}", leg, peer_leg));
        self.event(
            leg,
            BackendEvent::Bridged {
                peer_ref: peer_leg.to_string(),
            },
        );
        self.event(
            peer_leg,
            BackendEvent::Bridged {
                peer_ref: leg.to_string(),
            },
        );
        Ok(())
    }

    fn set_var(&self, leg: &str, name: &str, value: &str) -> Result<()> {
        self.record(format!("set_var:{}:{}={}", leg, name, value));
        Ok(())
    }

    fn conf_layout(&self, room: &str, layout: &str) -> Result<()> {
        self.record(format!("conf_layout:{}:{}", room, layout));
        Ok(())
    }

    fn dtmf(&self, leg: &str, digits: &str) -> Result<()> {
        self.record(format!("dtmf:{}:{}", leg, digits));
        Ok(())
    }

    fn hangup(&self, leg: &str) -> Result<()> {
        self.record(format!("hangup:{}", leg));
        self.legs.lock().unwrap().remove(leg);
        Ok(())
    }
}

////////////////////////////////////////////////////////////////////////
// Simulated KMS engine
////////////////////////////////////////////////////////////////////////

#[derive(Debug, Default)]
pub struct SimKmsDriver {
    ops: Mutex<Vec<String>>,
    candidates: Mutex<Vec<String>>,
    counter: AtomicU64,
}

impl SimKmsDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    pub fn candidates(&self) -> Vec<String> {
        self.candidates.lock().unwrap().clone()
    }

    fn record(&self, op: String) {
        self.ops.lock().unwrap().push(op);
    }
}

impl KmsDriver for SimKmsDriver {
    fn create_endpoint(&self, session: SessionId, kind: SdpKind) -> Result<String> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        self.record(format!("create:{}:{}", session, kind));
        Ok(format!("ep-{}", n))
    }

    fn process_offer(&self, endpoint: &str, _offer: &Sdp) -> Result<Sdp> {
        self.record(format!("process_offer:{}", endpoint));
        Ok(Sdp::new(format!("v=0\r\nkms-answer-{}", endpoint), SdpKind::Webrtc))
    }

    fn generate_offer(&self, endpoint: &str) -> Result<Sdp> {
        self.record(format!("generate_offer:{}", endpoint));
        Ok(Sdp::new(format!("v=0\r\nkms-offer-{}", endpoint), SdpKind::Webrtc))
    }

    fn process_answer(&self, endpoint: &str, _answer: &Sdp) -> Result<()> {
        self.record(format!("process_answer:{}", endpoint));
        Ok(())
    }

    fn add_candidate(&self, endpoint: &str, candidate: &Candidate) -> Result<()> {
        self.candidates
            .lock()
            .unwrap()
            .push(format!("{}:{}", endpoint, candidate.body));
        Ok(())
    }

    fn gather_candidates(&self, endpoint: &str) -> Result<()> {
        self.record(format!("gather:{}", endpoint));
        Ok(())
    }

    fn connect(&self, from: &str, to: &str) -> Result<()> {
        self.record(format!("connect:{}:{}", from, to));
        Ok(())
    }

    fn release(&self, endpoint: &str) -> Result<()> {
        self.record(format!("release:{}", endpoint));
        Ok(())
    }
}

////////////////////////////////////////////////////////////////////////
// Simulated wire peers
////////////////////////////////////////////////////////////////////////

#[derive(Debug, Default)]
pub struct SimSipEndpoint {
    counter: AtomicU64,
    pub responses: Mutex<Vec<(RequestHandle, u16, Option<Sdp>)>>,
    pub invites: Mutex<Vec<(RequestHandle, String)>>,
    pub cancels: Mutex<Vec<RequestHandle>>,
    pub byes: Mutex<Vec<DialogHandle>>,
}

impl SimSipEndpoint {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn response_codes(&self, request: &RequestHandle) -> Vec<u16> {
        self.responses
            .lock()
            .unwrap()
            .iter()
            .filter(|(r, _, _)| r == request)
            .map(|(_, code, _)| *code)
            .collect()
    }

    pub fn answer_sdp(&self, request: &RequestHandle) -> Option<Sdp> {
        self.responses
            .lock()
            .unwrap()
            .iter()
            .find(|(r, code, _)| r == request && *code == 200)
            .and_then(|(_, _, sdp)| sdp.clone())
    }
}

impl SipEndpoint for SimSipEndpoint {
    fn respond(&self, request: &RequestHandle, code: u16, sdp: Option<&Sdp>) {
        self.responses
            .lock()
            .unwrap()
            .push((request.clone(), code, sdp.cloned()));
    }

    fn send_invite(&self, dest_uri: &str, _offer: Option<&Sdp>) -> Result<RequestHandle> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let request = RequestHandle(format!("out-req-{}", n));
        self.invites
            .lock()
            .unwrap()
            .push((request.clone(), dest_uri.to_string()));
        Ok(request)
    }

    fn send_cancel(&self, request: &RequestHandle) {
        self.cancels.lock().unwrap().push(request.clone());
    }

    fn send_bye(&self, dialog: &DialogHandle) {
        self.byes.lock().unwrap().push(dialog.clone());
    }
}

#[derive(Debug, Default)]
pub struct SimVertoSocket {
    pub frames: Mutex<Vec<Value>>,
}

impl SimVertoSocket {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn frames_for(&self, method: &str) -> Vec<Value> {
        self.frames
            .lock()
            .unwrap()
            .iter()
            .filter(|frame| frame.get("method").and_then(Value::as_str) == Some(method))
            .cloned()
            .collect()
    }
}

impl VertoSocket for SimVertoSocket {
    fn send(&self, frame: Value) {
        self.frames.lock().unwrap().push(frame);
    }
}

#[derive(Debug, Default)]
pub struct SimApiSocket {
    pub frames: Mutex<Vec<Value>>,
}

impl SimApiSocket {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn frames(&self) -> Vec<Value> {
        self.frames.lock().unwrap().clone()
    }

    /// Event frames with the given lifecycle tag.
    pub fn events_of(&self, tag: &str) -> Vec<Value> {
        self.frames
            .lock()
            .unwrap()
            .iter()
            .filter(|frame| {
                frame.get("class").and_then(Value::as_str) == Some("event")
                    && frame
                        .get("data")
                        .and_then(|d| d.get("type"))
                        .and_then(Value::as_str)
                        == Some(tag)
            })
            .cloned()
            .collect()
    }

    /// Command frames pushed by the adapter (invites, cancels).
    pub fn commands_of(&self, cmd: &str) -> Vec<Value> {
        self.frames
            .lock()
            .unwrap()
            .iter()
            .filter(|frame| frame.get("cmd").and_then(Value::as_str) == Some(cmd))
            .cloned()
            .collect()
    }
}

impl ApiSocket for SimApiSocket {
    fn send(&self, frame: Value) {
        self.frames.lock().unwrap().push(frame);
    }
}

////////////////////////////////////////////////////////////////////////
// Hub assembly
////////////////////////////////////////////////////////////////////////

/// Hub with FS, KMS and P2P backends wired to simulated engines.
pub fn sim_hub() -> (Hub, Arc<SimFsDriver>, Arc<SimKmsDriver>) {
    let hub = Hub::new(Config::default()).unwrap();
    let fs = SimFsDriver::new();
    fs.set_hub(hub.clone());
    let kms = SimKmsDriver::new();
    hub.register_backend(Arc::new(mediahub::backend::fs::FsBackend::new(fs.clone())))
        .unwrap();
    hub.register_backend(Arc::new(mediahub::backend::kms::KmsBackend::new(
        kms.clone(),
    )))
    .unwrap();
    hub.register_backend(Arc::new(P2pBackend)).unwrap();
    (hub, fs, kms)
}

/// Hub with only the KMS (WebRTC engine) and P2P backends.
pub fn kms_hub() -> (Hub, Arc<SimKmsDriver>) {
    let hub = Hub::new(Config::default()).unwrap();
    let kms = SimKmsDriver::new();
    hub.register_backend(Arc::new(mediahub::backend::kms::KmsBackend::new(
        kms.clone(),
    )))
    .unwrap();
    hub.register_backend(Arc::new(P2pBackend)).unwrap();
    (hub, kms)
}
