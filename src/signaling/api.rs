//
// Copyright 2019-2024 MediaHub Authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! External API adapter.
//!
//! JSON frames of shape `{class, subclass, cmd, data, tid}` over a
//! WebSocket the embedder owns. Creating an object auto-subscribes the
//! caller to its lifecycle events (opt out with `subscribe: false`,
//! attach an opaque `events_body` to every delivered event).

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use uuid::Uuid;

use crate::common::{
    ApiClientId, CallId, LockGuarded, ObserverRole, Reason, Result, ServiceId, SessionId,
    SessionType, TypeExt, UpdateKind,
};
use crate::core::bus::TopicFilter;
use crate::core::call::{Call, CallConfig};
use crate::core::event::{Event, SubjectId};
use crate::core::hub::Hub;
use crate::core::lifetime::{Lifetime, LifetimeGuard};
use crate::core::link::Link;
use crate::core::resolver::DestDesc;
use crate::core::sdp::{Candidate, Sdp, SdpKind, TrickleCandidate};
use crate::core::session::{Registration, SessionConfig};
use crate::error::HubError;
use crate::signaling::{InviteOutcome, SignalingAdapter};

/// How long a blocking `session.update` waits for the backend.
const UPDATE_WAIT: Duration = Duration::from_secs(5);

/// How long `session.start` waits for a promptly available answer
/// before handing the caller off to events.
const START_ANSWER_WAIT: Duration = Duration::from_secs(2);

/// Outbound side of one API client connection.
pub trait ApiSocket: Send + Sync + fmt::Debug {
    fn send(&self, frame: Value);
}

struct ApiClient {
    service: ServiceId,
    socket: Arc<dyn ApiSocket>,
    lifetime: Lifetime,
    _guard: LifetimeGuard,
    /// Feed for bus subscriptions; the pump task renders frames.
    event_tx: UnboundedSender<Event>,
    /// invite id -> out-leg invite bookkeeping.
    out_invites: HashMap<String, (CallId, Link)>,
}

#[derive(Default)]
struct ApiState {
    clients: HashMap<ApiClientId, ApiClient>,
}

pub struct ApiAdapter {
    hub: Hub,
    state: Mutex<ApiState>,
}

impl fmt::Debug for ApiAdapter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "api_adapter")
    }
}

/// Wire rendition of a lifecycle event.
fn event_frame(event: &Event) -> Value {
    let mut body = event.kind.payload();
    if let Some(attached) = &event.body {
        if let Value::Object(map) = &mut body {
            map.insert("body".to_string(), attached.clone());
        }
    }
    json!({
        "class": "event",
        "data": {
            "srv_id": event.service,
            "class": "media",
            "subclass": event.subject.class().to_string(),
            "type": event.kind.tag(),
            "obj_id": event.subject.to_string(),
            "body": body,
        }
    })
}

impl ApiAdapter {
    pub fn new(hub: Hub) -> Arc<Self> {
        Arc::new(Self {
            hub,
            state: Mutex::new(ApiState::default()),
        })
    }

    pub fn connect(&self, service: ServiceId, socket: Arc<dyn ApiSocket>) -> Result<ApiClientId> {
        let client_id = ApiClientId::random();
        info!("api: connect {}", client_id);
        let (lifetime, guard) = Lifetime::create();
        let (event_tx, mut event_rx) = unbounded_channel::<Event>();

        // Pump: renders every subscribed event into a wire frame. Ends
        // when the last sender is gone, which the bus arranges when
        // the client's lifetime ends.
        let pump_socket = Arc::clone(&socket);
        self.hub.runtime().spawn(async move {
            while let Some(event) = event_rx.recv().await {
                pump_socket.send(event_frame(&event));
            }
        });

        let mut state = self.state.guarded("api_state")?;
        state.clients.insert(
            client_id,
            ApiClient {
                service,
                socket,
                lifetime,
                _guard: guard,
                event_tx,
                out_invites: HashMap::new(),
            },
        );
        Ok(client_id)
    }

    pub fn disconnect(&self, client_id: &ApiClientId) -> Result<()> {
        info!("api: disconnect {}", client_id);
        let mut state = self.state.guarded("api_state")?;
        state.clients.remove(client_id);
        // Dropping the guard ends the lifetime: observed subjects stop
        // with registered_stop and bus subscriptions vanish.
        Ok(())
    }

    /// Handle one request frame and produce the response frame.
    pub fn handle_frame(&self, client_id: &ApiClientId, frame: &Value) -> Value {
        let tid = frame.get("tid").cloned().unwrap_or(Value::Null);
        let result = self.dispatch(client_id, frame);
        match result {
            Ok(data) => json!({ "result": "ok", "data": data, "tid": tid }),
            Err(e) => {
                let (code, text) = api_error(&e);
                json!({
                    "result": "error",
                    "data": { "code": code, "error": text },
                    "tid": tid,
                })
            }
        }
    }

    fn dispatch(&self, client_id: &ApiClientId, frame: &Value) -> Result<Value> {
        let class = frame.get("class").and_then(Value::as_str).unwrap_or("");
        if class != "media" {
            return Err(HubError::UnknownCommand(format!("class {}", class)).into());
        }
        let subclass = frame.get("subclass").and_then(Value::as_str).unwrap_or("");
        let cmd = frame.get("cmd").and_then(Value::as_str).unwrap_or("");
        let empty = json!({});
        let data = frame.get("data").unwrap_or(&empty);
        match (subclass, cmd) {
            ("session", "start") => self.session_start(client_id, data),
            ("session", "stop") => self.session_stop(client_id, data),
            ("session", "set_answer") => self.session_set_answer(client_id, data),
            ("session", "set_candidate") => self.session_candidate(client_id, data, false),
            ("session", "set_candidate_end") => self.session_candidate(client_id, data, true),
            ("session", "update") => self.session_update(client_id, data),
            ("session", "info") => self.session_info(client_id, data),
            ("session", "list") => self.session_list(client_id),
            ("call", "start") => self.call_start(client_id, data),
            ("call", "ringing") => self.call_progress(client_id, data, Progress::Ringing),
            ("call", "answered") => self.call_progress(client_id, data, Progress::Answered),
            ("call", "rejected") => self.call_progress(client_id, data, Progress::Rejected),
            ("call", "hangup") => self.call_hangup(client_id, data),
            ("call", "list") => self.call_list(client_id),
            ("room", "create") => self.room_create(client_id, data),
            ("room", "destroy") => self.room_destroy(client_id, data),
            ("room", "list") => self.room_list(client_id),
            ("room", "info") => self.room_info(client_id, data),
            (subclass, cmd) => {
                Err(HubError::UnknownCommand(format!("{}.{}", subclass, cmd)).into())
            }
        }
    }

    ////////////////////////////////////////////////////////////////////////
    // session.*
    ////////////////////////////////////////////////////////////////////////

    fn session_start(&self, client_id: &ApiClientId, data: &Value) -> Result<Value> {
        let service = self.client_service(client_id)?;
        let session_type = data
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| HubError::InvalidParams("type".to_string()))?
            .parse::<SessionType>()
            .map_err(|_| HubError::InvalidParams("type".to_string()))?;

        let mut config = SessionConfig::new(session_type);
        if let Some(offer) = data.get("offer") {
            config.offer = Some(parse_sdp(offer)?);
        }
        if let Some(backend) = data.get("backend").and_then(Value::as_str) {
            config.backend = Some(
                backend
                    .parse()
                    .map_err(|_| HubError::InvalidParams("backend".to_string()))?,
            );
        }
        config.type_ext = parse_type_ext(data);
        if let Some(peer) = data.get("peer_id").and_then(Value::as_str) {
            config.peer = Some(
                peer.parse::<SessionId>()
                    .map_err(|_| HubError::InvalidParams("peer_id".to_string()))?,
            );
        }
        config.register.push(Registration {
            link: self.client_link(client_id)?,
            role: ObserverRole::Registered,
            payload: None,
        });

        let session = self.hub.start_session(service, config)?;
        self.auto_subscribe(client_id, data, SubjectId::Session(session.id()))?;

        let mut reply = json!({ "session_id": session.id() });
        let offered = data.get("offer").is_some();
        if offered {
            if let Ok(answer) = session.get_answer(START_ANSWER_WAIT) {
                reply["answer"] = json!(answer);
            }
        } else if let Ok(offer) = session.get_offer(START_ANSWER_WAIT) {
            reply["offer"] = json!(offer);
        }
        Ok(reply)
    }

    fn session_stop(&self, client_id: &ApiClientId, data: &Value) -> Result<Value> {
        let session = self.session_from(client_id, data)?;
        session.stop(Reason::ApiStop)?;
        Ok(json!({}))
    }

    fn session_set_answer(&self, client_id: &ApiClientId, data: &Value) -> Result<Value> {
        let session = self.session_from(client_id, data)?;
        let answer = parse_sdp(
            data.get("answer")
                .ok_or_else(|| HubError::InvalidParams("answer".to_string()))?,
        )?;
        session.set_answer(answer)?;
        Ok(json!({}))
    }

    fn session_candidate(
        &self,
        client_id: &ApiClientId,
        data: &Value,
        end: bool,
    ) -> Result<Value> {
        let session = self.session_from(client_id, data)?;
        let candidate = if end {
            TrickleCandidate::End
        } else {
            TrickleCandidate::Candidate(parse_candidate(data)?)
        };
        session.candidate(candidate)?;
        Ok(json!({}))
    }

    fn session_update(&self, client_id: &ApiClientId, data: &Value) -> Result<Value> {
        let session = self.session_from(client_id, data)?;
        let kind = data
            .get("update_type")
            .and_then(Value::as_str)
            .ok_or_else(|| HubError::InvalidParams("update_type".to_string()))?
            .parse::<UpdateKind>()
            .map_err(|_| HubError::InvalidParams("update_type".to_string()))?;
        session.update_blocking(kind, data.clone(), UPDATE_WAIT)?;
        Ok(json!({}))
    }

    fn session_info(&self, client_id: &ApiClientId, data: &Value) -> Result<Value> {
        let session = self.session_from(client_id, data)?;
        session.info()
    }

    fn session_list(&self, client_id: &ApiClientId) -> Result<Value> {
        let service = self.client_service(client_id)?;
        let sessions = self.hub.sessions(&service)?;
        Ok(json!(sessions
            .iter()
            .map(|s| s.id().to_string())
            .collect::<Vec<_>>()))
    }

    ////////////////////////////////////////////////////////////////////////
    // call.*
    ////////////////////////////////////////////////////////////////////////

    fn call_start(&self, client_id: &ApiClientId, data: &Value) -> Result<Value> {
        let service = self.client_service(client_id)?;
        let callee = data
            .get("callee")
            .and_then(Value::as_str)
            .ok_or_else(|| HubError::InvalidParams("callee".to_string()))?
            .to_string();
        let mut config = CallConfig {
            meta: data.get("meta").cloned().unwrap_or(Value::Null),
            ..Default::default()
        };
        if let Some(offer) = data.get("offer") {
            config.offer = Some(parse_sdp(offer)?);
        }
        if let Some(session_id) = data.get("session_id").and_then(Value::as_str) {
            config.session = Some(
                session_id
                    .parse::<SessionId>()
                    .map_err(|_| HubError::InvalidParams("session_id".to_string()))?,
            );
        }
        config.register.push(Registration {
            link: self.client_link(client_id)?,
            role: ObserverRole::Registered,
            payload: None,
        });

        let call = self.hub.start_call(service, callee, config)?;
        self.auto_subscribe(client_id, data, SubjectId::Call(call.id()))?;
        Ok(json!({ "call_id": call.id() }))
    }

    fn call_progress(
        &self,
        client_id: &ApiClientId,
        data: &Value,
        progress: Progress,
    ) -> Result<Value> {
        let invite_id = data
            .get("invite_id")
            .and_then(Value::as_str)
            .ok_or_else(|| HubError::InvalidParams("invite_id".to_string()))?;
        let (call_id, link) = {
            let state = self.state.guarded("api_state")?;
            let client = state
                .clients
                .get(client_id)
                .ok_or(HubError::ApiClientNotFound)?;
            client
                .out_invites
                .get(invite_id)
                .cloned()
                .ok_or(HubError::InviteNotFound)?
        };
        let call = self.hub.call(&call_id)?;
        match progress {
            Progress::Ringing => {
                let answer = data.get("answer").map(parse_sdp).transpose()?;
                call.ringing(link, answer)?;
            }
            Progress::Answered => {
                let answer = parse_sdp(
                    data.get("answer")
                        .ok_or_else(|| HubError::InvalidParams("answer".to_string()))?,
                )?;
                call.answered(link, answer)?;
            }
            Progress::Rejected => {
                call.rejected(link)?;
                let mut state = self.state.guarded("api_state")?;
                if let Some(client) = state.clients.get_mut(client_id) {
                    client.out_invites.remove(invite_id);
                }
            }
        }
        Ok(json!({}))
    }

    fn call_hangup(&self, client_id: &ApiClientId, data: &Value) -> Result<Value> {
        let _ = self.client_service(client_id)?;
        let call_id = data
            .get("call_id")
            .and_then(Value::as_str)
            .ok_or_else(|| HubError::InvalidParams("call_id".to_string()))?
            .parse::<CallId>()
            .map_err(|_| HubError::InvalidParams("call_id".to_string()))?;
        self.hub.call(&call_id)?.hangup(Reason::ApiHangup)?;
        Ok(json!({}))
    }

    fn call_list(&self, client_id: &ApiClientId) -> Result<Value> {
        let service = self.client_service(client_id)?;
        let calls = self.hub.calls(&service)?;
        Ok(json!(calls
            .iter()
            .map(|c| c.id().to_string())
            .collect::<Vec<_>>()))
    }

    ////////////////////////////////////////////////////////////////////////
    // room.*
    ////////////////////////////////////////////////////////////////////////

    fn room_create(&self, client_id: &ApiClientId, data: &Value) -> Result<Value> {
        let service = self.client_service(client_id)?;
        let room_id = data
            .get("room_id")
            .and_then(Value::as_str)
            .ok_or_else(|| HubError::InvalidParams("room_id".to_string()))?;
        let room_type = data
            .get("room_type")
            .and_then(Value::as_str)
            .unwrap_or(crate::backend::fs::DEFAULT_ROOM_TYPE);
        if let Some(event) = self.hub.rooms().create(&service, room_id, room_type, true)? {
            self.hub.publish(&event);
        }
        self.auto_subscribe(client_id, data, SubjectId::Room(room_id.to_string()))?;
        Ok(json!({ "room_id": room_id }))
    }

    fn room_destroy(&self, client_id: &ApiClientId, data: &Value) -> Result<Value> {
        let service = self.client_service(client_id)?;
        let room_id = data
            .get("room_id")
            .and_then(Value::as_str)
            .ok_or_else(|| HubError::InvalidParams("room_id".to_string()))?;
        let event = self.hub.rooms().destroy(&service, room_id)?;
        self.hub.publish(&event);
        Ok(json!({}))
    }

    fn room_list(&self, client_id: &ApiClientId) -> Result<Value> {
        let service = self.client_service(client_id)?;
        Ok(json!(self.hub.rooms().list(&service)?))
    }

    fn room_info(&self, client_id: &ApiClientId, data: &Value) -> Result<Value> {
        let service = self.client_service(client_id)?;
        let room_id = data
            .get("room_id")
            .and_then(Value::as_str)
            .ok_or_else(|| HubError::InvalidParams("room_id".to_string()))?;
        self.hub.rooms().info(&service, room_id)
    }

    ////////////////////////////////////////////////////////////////////////
    // Plumbing
    ////////////////////////////////////////////////////////////////////////

    fn session_from(
        &self,
        client_id: &ApiClientId,
        data: &Value,
    ) -> Result<crate::core::session::Session> {
        let _ = self.client_service(client_id)?;
        let session_id = data
            .get("session_id")
            .and_then(Value::as_str)
            .ok_or_else(|| HubError::InvalidParams("session_id".to_string()))?
            .parse::<SessionId>()
            .map_err(|_| HubError::InvalidParams("session_id".to_string()))?;
        self.hub.session(&session_id)
    }

    fn client_service(&self, client_id: &ApiClientId) -> Result<ServiceId> {
        let state = self.state.guarded("api_state")?;
        state
            .clients
            .get(client_id)
            .map(|client| client.service.clone())
            .ok_or_else(|| HubError::ApiClientNotFound.into())
    }

    fn client_link(&self, client_id: &ApiClientId) -> Result<Link> {
        let state = self.state.guarded("api_state")?;
        state
            .clients
            .get(client_id)
            .map(|client| Link::Api {
                client: *client_id,
                lifetime: client.lifetime.clone(),
            })
            .ok_or_else(|| HubError::ApiClientNotFound.into())
    }

    /// Subscribe the caller to the created object's lifecycle topic
    /// unless it opted out.
    fn auto_subscribe(
        &self,
        client_id: &ApiClientId,
        data: &Value,
        subject: SubjectId,
    ) -> Result<()> {
        if data.get("subscribe").and_then(Value::as_bool) == Some(false) {
            return Ok(());
        }
        let events_body = data.get("events_body").cloned();
        let state = self.state.guarded("api_state")?;
        let client = state
            .clients
            .get(client_id)
            .ok_or(HubError::ApiClientNotFound)?;
        self.hub.bus().subscribe(
            TopicFilter {
                service: client.service.clone(),
                class: Some(subject.class()),
                subject: Some(subject),
            },
            client.event_tx.clone(),
            events_body,
            client.lifetime.clone(),
        )
    }
}

enum Progress {
    Ringing,
    Answered,
    Rejected,
}

impl SignalingAdapter for ApiAdapter {
    fn scheme(&self) -> &'static str {
        "api"
    }

    fn invite(&self, call: &Call, desc: &DestDesc) -> InviteOutcome {
        let client_id = match desc.dest.target.parse::<ApiClientId>() {
            Ok(client_id) => client_id,
            Err(_) => return InviteOutcome::Remove,
        };
        let invite_id = Uuid::new_v4().to_string();
        let offer = call.shared_offer().ok().flatten();
        let meta = call.meta().unwrap_or(Value::Null);

        let (socket, link) = {
            let mut state = match self.state.guarded("api_state") {
                Ok(state) => state,
                Err(_) => return InviteOutcome::Remove,
            };
            let client = match state.clients.get_mut(&client_id) {
                Some(client) => client,
                None => return InviteOutcome::Remove,
            };
            let link = Link::Api {
                client: client_id,
                lifetime: client.lifetime.clone(),
            };
            client
                .out_invites
                .insert(invite_id.clone(), (call.id(), link.clone()));
            (Arc::clone(&client.socket), link)
        };
        socket.send(json!({
            "class": "media",
            "subclass": "call",
            "cmd": "invite",
            "data": {
                "call_id": call.id(),
                "invite_id": invite_id,
                "dest": desc.dest.target,
                "offer": offer,
                "meta": meta,
            }
        }));
        InviteOutcome::Ok { link }
    }

    fn cancel(&self, call_id: CallId, link: &Link) {
        let client_id = match link {
            Link::Api { client, .. } => *client,
            _ => return,
        };
        let dropped = match self.state.guarded("api_state") {
            Ok(mut state) => state.clients.get_mut(&client_id).map(|client| {
                let dropped: Vec<String> = client
                    .out_invites
                    .iter()
                    .filter(|(_, (invite_call, _))| *invite_call == call_id)
                    .map(|(invite_id, _)| invite_id.clone())
                    .collect();
                for invite_id in &dropped {
                    client.out_invites.remove(invite_id);
                }
                (Arc::clone(&client.socket), dropped)
            }),
            Err(_) => None,
        };
        if let Some((socket, dropped)) = dropped {
            for invite_id in dropped {
                socket.send(json!({
                    "class": "media",
                    "subclass": "call",
                    "cmd": "cancel",
                    "data": { "call_id": call_id, "invite_id": invite_id }
                }));
            }
        }
    }

    fn deliver_event(&self, link: &Link, event: &Event, _payload: Option<&Value>) {
        // Regular lifecycle events reach API clients through their
        // topic subscriptions; the fabric registration carries
        // liveness. The one direct delivery is teardown of a call the
        // client is a callee in, which must drop its pending invite.
        let client_id = match link {
            Link::Api { client, .. } => *client,
            _ => return,
        };
        if !matches!(
            event.kind,
            crate::core::event::EventKind::Hangup { .. }
                | crate::core::event::EventKind::Stop { .. }
        ) {
            return;
        }
        let call_id = match &event.subject {
            SubjectId::Call(call_id) => *call_id,
            _ => return,
        };
        let dropped = match self.state.guarded("api_state") {
            Ok(mut state) => state.clients.get_mut(&client_id).map(|client| {
                let dropped: Vec<String> = client
                    .out_invites
                    .iter()
                    .filter(|(_, (invite_call, _))| *invite_call == call_id)
                    .map(|(invite_id, _)| invite_id.clone())
                    .collect();
                for invite_id in &dropped {
                    client.out_invites.remove(invite_id);
                }
                (Arc::clone(&client.socket), dropped)
            }),
            Err(_) => None,
        };
        if let Some((socket, dropped)) = dropped {
            for invite_id in dropped {
                socket.send(json!({
                    "class": "media",
                    "subclass": "call",
                    "cmd": "hangup",
                    "data": { "call_id": call_id, "invite_id": invite_id }
                }));
            }
        }
    }
}

fn parse_sdp(value: &Value) -> Result<Sdp> {
    // Accept either the structured form or a bare SDP string.
    if let Some(body) = value.as_str() {
        return Ok(Sdp::new(body, SdpKind::Webrtc));
    }
    let body = value
        .get("sdp")
        .and_then(Value::as_str)
        .ok_or_else(|| HubError::InvalidParams("sdp".to_string()))?;
    let kind = match value.get("sdp_type").and_then(Value::as_str) {
        Some(kind) => kind
            .parse::<SdpKind>()
            .map_err(|_| HubError::InvalidParams("sdp_type".to_string()))?,
        None => SdpKind::Webrtc,
    };
    let mut sdp = Sdp::new(body, kind);
    if value.get("trickle_ice").and_then(Value::as_bool) == Some(true) {
        sdp = sdp.with_trickle();
    }
    Ok(sdp)
}

fn parse_candidate(data: &Value) -> Result<Candidate> {
    let candidate = data
        .get("candidate")
        .ok_or_else(|| HubError::InvalidParams("candidate".to_string()))?;
    if let Some(body) = candidate.as_str() {
        return Ok(Candidate {
            mid: data.get("sdpMid").and_then(Value::as_str).map(str::to_string),
            mline_index: data
                .get("sdpMLineIndex")
                .and_then(Value::as_u64)
                .unwrap_or(0) as u32,
            body: body.to_string(),
        });
    }
    Ok(Candidate {
        mid: candidate
            .get("sdpMid")
            .and_then(Value::as_str)
            .map(str::to_string),
        mline_index: candidate
            .get("sdpMLineIndex")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32,
        body: candidate
            .get("candidate")
            .and_then(Value::as_str)
            .ok_or_else(|| HubError::InvalidParams("candidate".to_string()))?
            .to_string(),
    })
}

fn parse_type_ext(data: &Value) -> TypeExt {
    TypeExt {
        room_id: data
            .get("room_id")
            .and_then(Value::as_str)
            .map(str::to_string),
        room_type: data
            .get("room_type")
            .and_then(Value::as_str)
            .map(str::to_string),
        mcu_layout: data
            .get("mcu_layout")
            .and_then(Value::as_str)
            .map(str::to_string),
        peer_id: data
            .get("peer_id")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok()),
        publisher_id: data
            .get("publisher_id")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok()),
    }
}

fn api_error(error: &anyhow::Error) -> (u32, String) {
    match error.downcast_ref::<HubError>() {
        Some(HubError::SessionNotFound(_)) => (2010, "session not found".to_string()),
        Some(HubError::CallNotFound(_)) => (2011, "call not found".to_string()),
        Some(HubError::InviteNotFound) => (2012, "invite not found".to_string()),
        Some(HubError::AlreadyAnswered) => (2013, "already answered".to_string()),
        Some(HubError::RoomNotFound(_)) => (2014, "room not found".to_string()),
        Some(HubError::UnknownCommand(cmd)) => (2015, format!("unknown command: {}", cmd)),
        Some(HubError::InvalidParams(p)) => (2016, format!("invalid parameters: {}", p)),
        Some(HubError::Timeout(op)) => (2017, format!("timeout: {}", op)),
        _ => (2000, error.to_string()),
    }
}
