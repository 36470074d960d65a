//
// Copyright 2019-2024 MediaHub Authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Verto signaling adapter.
//!
//! JSON-RPC 2.0 over WebSocket; the transport lives outside this
//! crate. The client chooses its call id and the adapter preserves it
//! in every frame back. Answer delivery is inherently asynchronous:
//! `verto.answer` goes out whenever the session's media is ready, so a
//! leg that is still generating media never blocks the RPC loop.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde_json::{json, Value};
use uuid::Uuid;

use crate::common::{
    CallId, LockGuarded, Reason, Result, ServiceId, SessionId, UpdateKind, VertoConnId, VERTO_IDLE,
};
use crate::core::call::Call;
use crate::core::event::{Event, EventKind};
use crate::core::hub::Hub;
use crate::core::lifetime::{Lifetime, LifetimeGuard};
use crate::core::link::Link;
use crate::core::resolver::DestDesc;
use crate::core::sdp::{Sdp, SdpKind};
use crate::directory::DEFAULT_EXPIRES;
use crate::error::HubError;
use crate::signaling::{InviteOutcome, InviteRouting, SignalingAdapter};

/// Outbound side of one Verto WebSocket connection.
pub trait VertoSocket: Send + Sync + fmt::Debug {
    fn send(&self, frame: Value);
}

/// Pluggable login hook. Returns the normalized user on success.
pub trait VertoAuth: Send + Sync + fmt::Debug {
    fn login(&self, service: &ServiceId, user: &str, password: &str) -> Option<String>;
}

/// Accepts every login verbatim.
#[derive(Debug)]
pub struct AcceptAllAuth;

impl VertoAuth for AcceptAllAuth {
    fn login(&self, _service: &ServiceId, user: &str, _password: &str) -> Option<String> {
        Some(user.to_string())
    }
}

struct VertoConn {
    service: ServiceId,
    socket: Arc<dyn VertoSocket>,
    user: Option<String>,
    lifetime: Lifetime,
    _guard: LifetimeGuard,
    last_seen: Instant,
    /// Client call id -> inbound session.
    calls: HashMap<String, SessionId>,
    /// Our call id -> out-leg invite bookkeeping.
    out_invites: HashMap<String, (CallId, Link)>,
    /// Call ids we already sent verto.answer for; the linked call and
    /// session both observe this connection.
    answered: HashSet<String>,
}

#[derive(Default)]
struct VertoState {
    conns: HashMap<VertoConnId, VertoConn>,
}

pub struct VertoAdapter {
    hub: Hub,
    auth: Arc<dyn VertoAuth>,
    state: Mutex<VertoState>,
}

impl fmt::Debug for VertoAdapter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "verto_adapter")
    }
}

impl VertoAdapter {
    pub fn new(hub: Hub, auth: Arc<dyn VertoAuth>) -> Arc<Self> {
        let adapter = Arc::new(Self {
            hub: hub.clone(),
            auth,
            state: Mutex::new(VertoState::default()),
        });

        // Idle sweep: connections quiet past the idle window are torn
        // down.
        let weak = Arc::downgrade(&adapter);
        hub.runtime().spawn(async move {
            let mut interval = tokio::time::interval(VERTO_IDLE / 60);
            loop {
                interval.tick().await;
                let adapter = match weak.upgrade() {
                    Some(adapter) => adapter,
                    None => break,
                };
                if let Err(e) = adapter.sweep_idle() {
                    warn!("verto: idle sweep failed: {}", e);
                }
            }
        });

        adapter
    }

    pub fn connect(&self, service: ServiceId, socket: Arc<dyn VertoSocket>) -> Result<VertoConnId> {
        let conn_id = VertoConnId::random();
        info!("verto: connect {}", conn_id);
        let (lifetime, guard) = Lifetime::create();
        let mut state = self.state.guarded("verto_state")?;
        state.conns.insert(
            conn_id,
            VertoConn {
                service,
                socket,
                user: None,
                lifetime,
                _guard: guard,
                last_seen: Instant::now(),
                calls: HashMap::new(),
                out_invites: HashMap::new(),
                answered: HashSet::new(),
            },
        );
        Ok(conn_id)
    }

    pub fn disconnect(&self, conn_id: &VertoConnId) -> Result<()> {
        info!("verto: disconnect {}", conn_id);
        let conn = {
            let mut state = self.state.guarded("verto_state")?;
            state.conns.remove(conn_id)
        };
        if let Some(conn) = conn {
            if let Some(user) = &conn.user {
                let _ = self
                    .hub
                    .directory()
                    .unregister(&conn.service, user, &conn_id.to_string());
            }
            // Dropping the guard ends the lifetime; dependents stop.
        }
        Ok(())
    }

    fn sweep_idle(&self) -> Result<()> {
        let idle: Vec<VertoConnId> = {
            let state = self.state.guarded("verto_state")?;
            state
                .conns
                .iter()
                .filter(|(_, conn)| conn.last_seen.elapsed() >= VERTO_IDLE)
                .map(|(conn_id, _)| *conn_id)
                .collect()
        };
        for conn_id in idle {
            info!("verto: {} idle, closing", conn_id);
            self.disconnect(&conn_id)?;
        }
        Ok(())
    }

    /// Handle one JSON-RPC request; returns the `result` member for
    /// the response frame.
    pub fn handle_request(
        &self,
        conn_id: &VertoConnId,
        method: &str,
        params: &Value,
    ) -> Result<Value> {
        debug!("verto: {} -> {}", conn_id, method);
        self.touch(conn_id)?;
        match method {
            "login" => self.rpc_login(conn_id, params),
            "verto.invite" => self.rpc_invite(conn_id, params),
            "verto.answer" => self.rpc_answer(conn_id, params),
            "verto.bye" => self.rpc_bye(conn_id, params),
            "verto.info" => self.rpc_info(conn_id, params),
            other => Err(HubError::UnknownCommand(other.to_string()).into()),
        }
    }

    fn touch(&self, conn_id: &VertoConnId) -> Result<()> {
        let mut state = self.state.guarded("verto_state")?;
        match state.conns.get_mut(conn_id) {
            Some(conn) => {
                conn.last_seen = Instant::now();
                Ok(())
            }
            None => Err(HubError::VertoConnNotFound.into()),
        }
    }

    fn rpc_login(&self, conn_id: &VertoConnId, params: &Value) -> Result<Value> {
        let user = params
            .get("login")
            .and_then(Value::as_str)
            .ok_or_else(|| HubError::InvalidParams("login".to_string()))?;
        let password = params
            .get("passwd")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let service = self.conn_service(conn_id)?;
        let normalized = self
            .auth
            .login(&service, user, password)
            .ok_or_else(|| HubError::LoginFailed(user.to_string()))?;
        {
            let mut state = self.state.guarded("verto_state")?;
            if let Some(conn) = state.conns.get_mut(conn_id) {
                conn.user = Some(normalized.clone());
            }
        }
        self.hub.directory().register(
            &service,
            &normalized,
            "verto",
            &conn_id.to_string(),
            Value::Null,
            DEFAULT_EXPIRES,
        )?;
        Ok(json!({ "message": "logged in", "sessid": conn_id }))
    }

    fn rpc_invite(&self, conn_id: &VertoConnId, params: &Value) -> Result<Value> {
        let service = self.conn_service(conn_id)?;
        self.require_login(conn_id)?;
        let dialog = params
            .get("dialogParams")
            .ok_or_else(|| HubError::InvalidParams("dialogParams".to_string()))?;
        let dest = dialog
            .get("destination_number")
            .and_then(Value::as_str)
            .ok_or_else(|| HubError::InvalidParams("destination_number".to_string()))?;
        let call_id = dialog
            .get("callID")
            .and_then(Value::as_str)
            .ok_or_else(|| HubError::InvalidParams("callID".to_string()))?
            .to_string();
        let sdp = params
            .get("sdp")
            .and_then(Value::as_str)
            .ok_or_else(|| HubError::InvalidParams("sdp".to_string()))?;

        let offer = Sdp::new(sdp, SdpKind::Webrtc);
        let lifetime = self.conn_lifetime(conn_id)?;
        let link = Link::Verto {
            conn: *conn_id,
            call_id: call_id.clone(),
            lifetime,
        };

        let routing = self
            .hub
            .invite_hook()?
            .route(&self.hub, &service, dest, offer, link)?;
        let session = match routing {
            InviteRouting::Session(session) | InviteRouting::Call { session, .. } => session,
            InviteRouting::Reject(reason) => {
                return Err(HubError::SessionError(reason.to_string()).into());
            }
        };
        {
            let mut state = self.state.guarded("verto_state")?;
            if let Some(conn) = state.conns.get_mut(conn_id) {
                conn.calls.insert(call_id.clone(), session.id());
            }
        }
        Ok(json!({ "message": "CALL CREATED", "callID": call_id }))
    }

    fn rpc_answer(&self, conn_id: &VertoConnId, params: &Value) -> Result<Value> {
        let call_id = self.param_call_id(params)?;
        let sdp = params
            .get("sdp")
            .and_then(Value::as_str)
            .ok_or_else(|| HubError::InvalidParams("sdp".to_string()))?;
        let out = {
            let state = self.state.guarded("verto_state")?;
            state
                .conns
                .get(conn_id)
                .and_then(|conn| conn.out_invites.get(&call_id).cloned())
        };
        match out {
            Some((out_call, link)) => {
                let call = self.hub.call(&out_call)?;
                call.answered(link, Sdp::new(sdp, SdpKind::Webrtc))?;
                Ok(json!({ "message": "CALL ANSWERED", "callID": call_id }))
            }
            None => Err(HubError::InviteNotFound.into()),
        }
    }

    fn rpc_bye(&self, conn_id: &VertoConnId, params: &Value) -> Result<Value> {
        let call_id = self.param_call_id(params)?;
        let (session_id, out) = {
            let mut state = self.state.guarded("verto_state")?;
            match state.conns.get_mut(conn_id) {
                Some(conn) => (
                    conn.calls.remove(&call_id),
                    conn.out_invites.remove(&call_id),
                ),
                None => (None, None),
            }
        };
        if let Some(session_id) = session_id {
            if let Ok(session) = self.hub.session(&session_id) {
                session.stop(Reason::VertoBye)?;
            }
        } else if let Some((out_call, link)) = out {
            if let Ok(call) = self.hub.call(&out_call) {
                // Bye while ringing is a decline; after answer the
                // callee-stop path runs through observer death.
                let _ = call.rejected(link);
            }
        }
        Ok(json!({ "message": "CALL ENDED", "callID": call_id }))
    }

    fn rpc_info(&self, conn_id: &VertoConnId, params: &Value) -> Result<Value> {
        let call_id = self.param_call_id(params)?;
        let dtmf = params
            .get("dtmf")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let session_id = {
            let state = self.state.guarded("verto_state")?;
            state
                .conns
                .get(conn_id)
                .and_then(|conn| conn.calls.get(&call_id).copied())
        };
        match session_id {
            Some(session_id) => {
                let session = self.hub.session(&session_id)?;
                session.update(UpdateKind::Info, json!({ "dtmf": dtmf }))?;
                Ok(json!({ "message": "SENT" }))
            }
            None => Err(HubError::InviteNotFound.into()),
        }
    }

    fn param_call_id(&self, params: &Value) -> Result<String> {
        params
            .get("dialogParams")
            .and_then(|d| d.get("callID"))
            .or_else(|| params.get("callID"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| HubError::InvalidParams("callID".to_string()).into())
    }

    fn conn_service(&self, conn_id: &VertoConnId) -> Result<ServiceId> {
        let state = self.state.guarded("verto_state")?;
        state
            .conns
            .get(conn_id)
            .map(|conn| conn.service.clone())
            .ok_or_else(|| HubError::VertoConnNotFound.into())
    }

    fn conn_lifetime(&self, conn_id: &VertoConnId) -> Result<Lifetime> {
        let state = self.state.guarded("verto_state")?;
        state
            .conns
            .get(conn_id)
            .map(|conn| conn.lifetime.clone())
            .ok_or_else(|| HubError::VertoConnNotFound.into())
    }

    fn require_login(&self, conn_id: &VertoConnId) -> Result<()> {
        let state = self.state.guarded("verto_state")?;
        match state.conns.get(conn_id) {
            Some(conn) if conn.user.is_some() => Ok(()),
            Some(_) => Err(HubError::LoginFailed("not logged in".to_string()).into()),
            None => Err(HubError::VertoConnNotFound.into()),
        }
    }

    fn send_frame(&self, conn_id: &VertoConnId, method: &str, params: Value) {
        let socket = match self.state.guarded("verto_state") {
            Ok(state) => state.conns.get(conn_id).map(|conn| Arc::clone(&conn.socket)),
            Err(_) => None,
        };
        if let Some(socket) = socket {
            socket.send(json!({
                "jsonrpc": "2.0",
                "id": Uuid::new_v4().to_string(),
                "method": method,
                "params": params,
            }));
        }
    }
}

impl SignalingAdapter for VertoAdapter {
    fn scheme(&self) -> &'static str {
        "verto"
    }

    fn invite(&self, call: &Call, desc: &DestDesc) -> InviteOutcome {
        let conn_id = match desc.dest.target.parse::<VertoConnId>() {
            Ok(conn_id) => conn_id,
            Err(_) => return InviteOutcome::Remove,
        };
        let offer = match call.shared_offer() {
            Ok(Some(offer)) => offer,
            _ => return InviteOutcome::Remove,
        };
        let call_id = Uuid::new_v4().to_string();
        let link = {
            let mut state = match self.state.guarded("verto_state") {
                Ok(state) => state,
                Err(_) => return InviteOutcome::Remove,
            };
            let conn = match state.conns.get_mut(&conn_id) {
                Some(conn) => conn,
                None => return InviteOutcome::Remove,
            };
            let link = Link::Verto {
                conn: conn_id,
                call_id: call_id.clone(),
                lifetime: conn.lifetime.clone(),
            };
            conn.out_invites
                .insert(call_id.clone(), (call.id(), link.clone()));
            link
        };
        self.send_frame(
            &conn_id,
            "verto.invite",
            json!({
                "callID": call_id,
                "sdp": offer.body,
            }),
        );
        InviteOutcome::Ok { link }
    }

    fn cancel(&self, call_id: CallId, link: &Link) {
        let (conn_id, client_call_id) = match link {
            Link::Verto { conn, call_id, .. } => (*conn, call_id.clone()),
            _ => return,
        };
        if let Ok(mut state) = self.state.guarded("verto_state") {
            if let Some(conn) = state.conns.get_mut(&conn_id) {
                conn.out_invites.remove(&client_call_id);
            }
        }
        let _ = call_id;
        self.send_frame(
            &conn_id,
            "verto.bye",
            json!({ "callID": client_call_id, "cause": "ORIGINATOR_CANCEL" }),
        );
    }

    fn deliver_event(&self, link: &Link, event: &Event, _payload: Option<&Value>) {
        let (conn_id, client_call_id) = match link {
            Link::Verto { conn, call_id, .. } => (*conn, call_id.clone()),
            _ => return,
        };
        match &event.kind {
            EventKind::Answer { sdp, .. } => {
                let first = match self.state.guarded("verto_state") {
                    Ok(mut state) => state
                        .conns
                        .get_mut(&conn_id)
                        .map(|conn| conn.answered.insert(client_call_id.clone()))
                        .unwrap_or(false),
                    Err(_) => false,
                };
                if !first {
                    return;
                }
                let body = sdp.as_ref().map(|s| s.body.clone()).unwrap_or_default();
                self.send_frame(
                    &conn_id,
                    "verto.answer",
                    json!({ "callID": client_call_id, "sdp": body }),
                );
            }
            EventKind::Hangup { reason } | EventKind::Stop { reason } => {
                // The call and its linked session both observe this
                // connection; only the first teardown notice per call
                // id produces a frame.
                let known = match self.state.guarded("verto_state") {
                    Ok(mut state) => match state.conns.get_mut(&conn_id) {
                        Some(conn) => {
                            let known = conn.calls.remove(&client_call_id).is_some()
                                | conn.out_invites.remove(&client_call_id).is_some();
                            conn.answered.remove(&client_call_id);
                            known
                        }
                        None => false,
                    },
                    Err(_) => false,
                };
                if !known {
                    return;
                }
                if matches!(reason, Reason::VertoBye) {
                    // This side initiated the teardown.
                    return;
                }
                let (code, text) = crate::error::reason_code(reason);
                self.send_frame(
                    &conn_id,
                    "verto.bye",
                    json!({
                        "callID": client_call_id,
                        "causeCode": code,
                        "cause": text,
                    }),
                );
            }
            _ => {}
        }
    }
}
