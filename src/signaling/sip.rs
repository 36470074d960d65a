//
// Copyright 2019-2024 MediaHub Authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! SIP signaling adapter.
//!
//! The SIP parser and transaction layer live outside this crate; the
//! wire side calls in with request/dialog handles and this adapter
//! translates to core operations. Inbound correlation: CANCEL uses the
//! request handle, BYE uses the dialog handle.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;

use crate::common::{
    CallId, DialogHandle, LockGuarded, Reason, RequestHandle, Result, ServiceId, SessionId,
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

/// Wire side of the adapter, implemented over the real SIP stack by
/// the embedder and by a simulated peer in tests.
pub trait SipEndpoint: Send + Sync + fmt::Debug {
    /// Send a provisional or final response on an inbound transaction.
    fn respond(&self, request: &RequestHandle, code: u16, sdp: Option<&Sdp>);

    /// Launch an outbound INVITE; returns the transaction handle.
    fn send_invite(&self, dest_uri: &str, offer: Option<&Sdp>) -> Result<RequestHandle>;

    fn send_cancel(&self, request: &RequestHandle);

    fn send_bye(&self, dialog: &DialogHandle);
}

/// Accepted REGISTER outcome; `domain` reflects any forced rewrite.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisterOk {
    pub user: String,
    pub domain: String,
    pub expires: Duration,
}

struct OutInvite {
    call_id: CallId,
    link: Link,
    dialog: Option<DialogHandle>,
    _guard: LifetimeGuard,
}

#[derive(Default)]
struct SipState {
    /// Inbound transaction -> session (CANCEL correlation).
    requests: HashMap<RequestHandle, SessionId>,
    /// Inbound dialog -> session (BYE correlation).
    dialogs: HashMap<DialogHandle, SessionId>,
    /// Inbound dialog liveness; ends when the dialog is gone.
    guards: HashMap<DialogHandle, LifetimeGuard>,
    /// Dialogs we already answered; hangup becomes BYE not a reject.
    answered: HashSet<DialogHandle>,
    /// Outbound transactions by handle.
    out_invites: HashMap<RequestHandle, OutInvite>,
}

pub struct SipAdapter {
    hub: Hub,
    endpoint: Arc<dyn SipEndpoint>,
    state: Mutex<SipState>,
}

impl fmt::Debug for SipAdapter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "sip_adapter")
    }
}

impl SipAdapter {
    pub fn new(hub: Hub, endpoint: Arc<dyn SipEndpoint>) -> Arc<Self> {
        Arc::new(Self {
            hub,
            endpoint,
            state: Mutex::new(SipState::default()),
        })
    }

    /// Wire response code for an adapter-level rejection.
    pub fn response_code(error: &HubError) -> u16 {
        match error {
            HubError::RegistrarDisabled | HubError::DomainMismatch(_) => 403,
            HubError::UserNotFound(_) => 404,
            HubError::Timeout(_) => 408,
            _ => 500,
        }
    }

    ////////////////////////////////////////////////////////////////////////
    // Inbound wire entry points
    ////////////////////////////////////////////////////////////////////////

    /// REGISTER: enforce realm policy, then store the binding.
    pub fn on_register(
        &self,
        service: &ServiceId,
        user: &str,
        domain: &str,
        contact: &str,
        expires: Option<Duration>,
    ) -> Result<RegisterOk> {
        info!("sip: REGISTER {}@{}", user, domain);
        let config = self.hub.config();
        if !config.sip_registrar {
            return Err(HubError::RegistrarDisabled.into());
        }
        let effective_domain = match config.sip_domain.as_deref() {
            Some(realm) if realm != domain => {
                if config.sip_registrar_force_domain {
                    realm.to_string()
                } else {
                    return Err(HubError::DomainMismatch(domain.to_string()).into());
                }
            }
            Some(realm) => realm.to_string(),
            None => domain.to_string(),
        };
        let expires = expires.unwrap_or(DEFAULT_EXPIRES);
        self.hub.directory().register(
            service,
            user,
            "sip",
            contact,
            Value::Null,
            expires,
        )?;
        Ok(RegisterOk {
            user: user.to_string(),
            domain: effective_domain,
            expires,
        })
    }

    /// INVITE: build the offer from the SDP body, derive the
    /// destination from the R-URI and route through the invite hook.
    pub fn on_invite(
        &self,
        service: &ServiceId,
        request: RequestHandle,
        dialog: DialogHandle,
        dest: &str,
        sdp_body: &str,
    ) -> Result<SessionId> {
        info!("sip: INVITE to {}", dest);
        let config = self.hub.config();
        let user = dest.split('@').next().unwrap_or(dest);
        if !config.sip_invite_not_registered
            && !self.hub.directory().is_registered(service, user)?
        {
            return Err(HubError::UserNotFound(user.to_string()).into());
        }

        let offer = Sdp::new(sdp_body, SdpKind::Rtp);
        let (lifetime, guard) = Lifetime::create();
        let link = Link::SipIn {
            request: request.clone(),
            dialog: dialog.clone(),
            lifetime,
        };

        let routing = self
            .hub
            .invite_hook()?
            .route(&self.hub, service, dest, offer, link)?;
        let session = match routing {
            InviteRouting::Session(session) | InviteRouting::Call { session, .. } => session,
            InviteRouting::Reject(reason) => {
                return Err(HubError::SessionError(reason.to_string()).into());
            }
        };

        let mut state = self.state.guarded("sip_state")?;
        state.requests.insert(request, session.id());
        state.dialogs.insert(dialog.clone(), session.id());
        state.guards.insert(dialog, guard);
        Ok(session.id())
    }

    /// CANCEL correlates by transaction.
    pub fn on_cancel(&self, request: &RequestHandle) -> Result<()> {
        info!("sip: CANCEL {}", request);
        let session_id = {
            let state = self.state.guarded("sip_state")?;
            state.requests.get(request).copied()
        };
        match session_id {
            Some(session_id) => self.hub.session(&session_id)?.stop(Reason::SipCancel),
            None => Err(HubError::InviteNotFound.into()),
        }
    }

    /// BYE correlates by dialog.
    pub fn on_bye(&self, dialog: &DialogHandle) -> Result<()> {
        info!("sip: BYE {}", dialog);
        let session_id = {
            let state = self.state.guarded("sip_state")?;
            state.dialogs.get(dialog).copied()
        };
        if let Some(session_id) = session_id {
            // Stop first: the session must see sip_bye before the
            // dialog's liveness ends.
            self.hub.session(&session_id)?.stop(Reason::SipBye)?;
            let mut state = self.state.guarded("sip_state")?;
            state.guards.remove(dialog);
            return Ok(());
        }
        // Out-leg dialogs report through the out-invite table.
        let out = {
            let state = self.state.guarded("sip_state")?;
            state
                .out_invites
                .iter()
                .find(|(_, out)| out.dialog.as_ref() == Some(dialog))
                .map(|(request, out)| (request.clone(), out.call_id))
        };
        if let Some((request, call_id)) = out {
            self.drop_out_invite(&request)?;
            if let Ok(call) = self.hub.call(&call_id) {
                return call.hangup(Reason::CalleeStop);
            }
        }
        Ok(())
    }

    /// reINVITE is rejected by default.
    pub fn on_reinvite(&self, _dialog: &DialogHandle) -> u16 {
        603
    }

    /// The wire layer tears a dialog down without a BYE (transport
    /// failure); end its liveness so dependents stop.
    pub fn on_dialog_gone(&self, dialog: &DialogHandle) -> Result<()> {
        let guard = {
            let mut state = self.state.guarded("sip_state")?;
            state.guards.remove(dialog)
        };
        drop(guard);
        Ok(())
    }

    ////////////////////////////////////////////////////////////////////////
    // Outbound invite progress from the wire
    ////////////////////////////////////////////////////////////////////////

    pub fn on_out_ringing(&self, request: &RequestHandle, early: Option<Sdp>) -> Result<()> {
        let (call_id, link) = self.out_invite(request)?;
        self.hub.call(&call_id)?.ringing(link, early)
    }

    pub fn on_out_answer(
        &self,
        request: &RequestHandle,
        dialog: DialogHandle,
        sdp_body: &str,
    ) -> Result<()> {
        {
            let mut state = self.state.guarded("sip_state")?;
            if let Some(out) = state.out_invites.get_mut(request) {
                out.dialog = Some(dialog);
            }
        }
        let (call_id, link) = self.out_invite(request)?;
        self.hub
            .call(&call_id)?
            .answered(link, Sdp::new(sdp_body, SdpKind::Rtp))
    }

    pub fn on_out_reject(&self, request: &RequestHandle) -> Result<()> {
        let (call_id, link) = self.out_invite(request)?;
        self.drop_out_invite(request)?;
        self.hub.call(&call_id)?.rejected(link)
    }

    fn out_invite(&self, request: &RequestHandle) -> Result<(CallId, Link)> {
        let state = self.state.guarded("sip_state")?;
        match state.out_invites.get(request) {
            Some(out) => Ok((out.call_id, out.link.clone())),
            None => Err(HubError::InviteNotFound.into()),
        }
    }

    fn drop_out_invite(&self, request: &RequestHandle) -> Result<()> {
        let mut state = self.state.guarded("sip_state")?;
        state.out_invites.remove(request);
        Ok(())
    }

    /// Session behind an inbound dialog, for wire-layer queries.
    pub fn session_for_dialog(&self, dialog: &DialogHandle) -> Result<Option<SessionId>> {
        let state = self.state.guarded("sip_state")?;
        Ok(state.dialogs.get(dialog).copied())
    }
}

impl SignalingAdapter for SipAdapter {
    fn scheme(&self) -> &'static str {
        "sip"
    }

    fn invite(&self, call: &Call, desc: &DestDesc) -> InviteOutcome {
        let offer = match call.shared_offer() {
            Ok(offer) => offer,
            Err(_) => return InviteOutcome::Remove,
        };
        match self.endpoint.send_invite(&desc.dest.target, offer.as_ref()) {
            Ok(request) => {
                let (lifetime, guard) = Lifetime::create();
                let link = Link::SipOut {
                    dest: desc.dest.target.clone(),
                    lifetime,
                };
                if let Ok(mut state) = self.state.guarded("sip_state") {
                    state.out_invites.insert(
                        request,
                        OutInvite {
                            call_id: call.id(),
                            link: link.clone(),
                            dialog: None,
                            _guard: guard,
                        },
                    );
                }
                InviteOutcome::Ok { link }
            }
            Err(e) => {
                warn!("sip: outbound invite to {} failed: {}", desc.dest.target, e);
                InviteOutcome::Remove
            }
        }
    }

    fn cancel(&self, call_id: CallId, link: &Link) {
        let entry = match self.state.guarded("sip_state") {
            Ok(mut state) => {
                let request = state
                    .out_invites
                    .iter()
                    .find(|(_, out)| out.call_id == call_id && &out.link == link)
                    .map(|(request, _)| request.clone());
                request.and_then(|request| {
                    state
                        .out_invites
                        .remove(&request)
                        .map(|out| (request, out.dialog))
                })
            }
            Err(_) => None,
        };
        if let Some((request, dialog)) = entry {
            match dialog {
                Some(dialog) => self.endpoint.send_bye(&dialog),
                None => self.endpoint.send_cancel(&request),
            }
        }
    }

    fn deliver_event(&self, link: &Link, event: &Event, _payload: Option<&Value>) {
        let (request, dialog) = match link {
            Link::SipIn {
                request, dialog, ..
            } => (request.clone(), dialog.clone()),
            Link::SipOut { .. } => {
                // Out-leg teardown rides on cancel(); nothing else to
                // surface toward a bare transaction.
                return;
            }
            _ => return,
        };
        match &event.kind {
            EventKind::Ringing { .. } => {
                self.endpoint.respond(&request, 180, None);
            }
            EventKind::Answer { sdp, .. } => {
                let first = match self.state.guarded("sip_state") {
                    Ok(mut state) => state.answered.insert(dialog),
                    Err(_) => false,
                };
                if first {
                    self.endpoint.respond(&request, 200, sdp.as_ref());
                }
            }
            EventKind::Hangup { reason } | EventKind::Stop { reason } => {
                // The call and its linked session both observe this
                // dialog; only the first teardown notice acts.
                let (known, was_answered) = match self.state.guarded("sip_state") {
                    Ok(mut state) => {
                        let known = state.dialogs.remove(&dialog).is_some();
                        state.requests.remove(&request);
                        state.guards.remove(&dialog);
                        (known, state.answered.remove(&dialog))
                    }
                    Err(_) => (false, false),
                };
                if !known {
                    return;
                }
                // The wire leg initiated this teardown itself when the
                // reason is a SIP one; no need to answer it back.
                if matches!(reason, Reason::SipBye | Reason::SipCancel) {
                    return;
                }
                if was_answered {
                    self.endpoint.send_bye(&dialog);
                } else {
                    self.endpoint.respond(&request, 487, None);
                }
            }
            _ => {}
        }
    }
}
