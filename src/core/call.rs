//
// Copyright 2019-2024 MediaHub Authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! A multi-leg invite coordinator.
//!
//! A `Call` resolves a callee to one or more destinations, fans out
//! invites with per-destination ring timers, applies
//! first-answer-wins and cancels the losers. Like sessions, the handle
//! is cheap to clone and injects events into an FSM whose mailbox
//! serializes state mutation.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

use crate::common::{
    CallId, CallState, LockGuarded, ObserverRole, Reason, Result, ServiceId, SessionId,
};
use crate::core::call_fsm::{run_call_fsm, CallFsm};
use crate::core::event::{Event, EventKind, SubjectId};
use crate::core::hub::Hub;
use crate::core::lifetime::{Lifetime, LifetimeGuard};
use crate::core::link::Link;
use crate::core::resolver::DestDesc;
use crate::core::sdp::Sdp;
use crate::core::session::Registration;
use crate::error::HubError;

/// Start-time call parameters.
#[derive(Clone, Debug, Default)]
pub struct CallConfig {
    /// Offer shared with every out-leg invite.
    pub offer: Option<Sdp>,
    pub meta: Value,
    /// Inbound session this call answers for; linked bidirectionally.
    pub session: Option<SessionId>,
    pub register: Vec<Registration>,
}

/// One fanned-out invite.
#[derive(Clone, Debug)]
pub struct Invite {
    pub pos: u32,
    pub desc: DestDesc,
    pub launched: bool,
    pub removed: bool,
    pub link: Option<Link>,
}

pub(crate) struct CallInner {
    pub callee: String,
    pub offer: Option<Sdp>,
    pub meta: Value,
    pub invites: Vec<Invite>,
    pub callee_link: Option<Link>,
    pub stop_sent: bool,
    pub launched_any: bool,
    pub session: Option<SessionId>,
    /// Registrations applied when the start flow runs.
    pub register: Vec<Registration>,
}

/// The different types of call events consumed by the FSM.
pub enum CallEvent {
    Start,
    /// Launch the invite at `pos` (wait timer elapsed or immediate).
    LaunchOut(u32),
    /// Ring timer for the invite at `pos` elapsed.
    RingTimeout(u32),
    Ringing { link: Link, answer: Option<Sdp> },
    Answered { link: Link, answer: Sdp },
    Rejected { link: Link },
    Hangup(Reason),
    /// Event from a subject this call observes.
    Observed(Box<Event>),
    ObserverDied { role: ObserverRole, link: Link },
    Terminate,
}

impl fmt::Display for CallEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let display = match self {
            Self::Start => "Start".to_string(),
            Self::LaunchOut(pos) => format!("LaunchOut({})", pos),
            Self::RingTimeout(pos) => format!("RingTimeout({})", pos),
            Self::Ringing { link, .. } => format!("Ringing({})", link),
            Self::Answered { link, .. } => format!("Answered({})", link),
            Self::Rejected { link } => format!("Rejected({})", link),
            Self::Hangup(reason) => format!("Hangup({})", reason),
            Self::Observed(event) => format!("Observed({})", event.kind),
            Self::ObserverDied { role, link } => format!("ObserverDied({}, {})", role, link),
            Self::Terminate => "Terminate".to_string(),
        };
        write!(f, "({})", display)
    }
}

impl fmt::Debug for CallEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

pub struct Call {
    call_id: CallId,
    service: ServiceId,
    callee: String,
    hub: Hub,
    state: Arc<Mutex<CallState>>,
    inner: Arc<Mutex<CallInner>>,
    fsm_sender: UnboundedSender<(Call, CallEvent)>,
    lifetime: Lifetime,
    guard: Arc<Mutex<Option<LifetimeGuard>>>,
}

impl Clone for Call {
    fn clone(&self) -> Self {
        Self {
            call_id: self.call_id,
            service: self.service.clone(),
            callee: self.callee.clone(),
            hub: self.hub.clone(),
            state: Arc::clone(&self.state),
            inner: Arc::clone(&self.inner),
            fsm_sender: self.fsm_sender.clone(),
            lifetime: self.lifetime.clone(),
            guard: Arc::clone(&self.guard),
        }
    }
}

impl fmt::Display for Call {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let state = match self.state() {
            Ok(v) => format!("{}", v),
            Err(_) => "unavailable".to_string(),
        };
        write!(
            f,
            "call_id: {}, callee: {}, state: {}",
            self.call_id, self.callee, state
        )
    }
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl Call {
    pub(crate) fn new(
        hub: Hub,
        service: ServiceId,
        callee: String,
        config: CallConfig,
    ) -> Result<Self> {
        let call_id = CallId::random();
        info!("new(): call_id: {}, callee: {}", call_id, callee);

        let (fsm_sender, fsm_receiver) = unbounded_channel();
        let (lifetime, guard) = Lifetime::create();

        let call = Self {
            call_id,
            service,
            callee: callee.clone(),
            hub: hub.clone(),
            state: Arc::new(Mutex::new(CallState::Created)),
            inner: Arc::new(Mutex::new(CallInner {
                callee,
                offer: config.offer,
                meta: config.meta,
                invites: Vec::new(),
                callee_link: None,
                stop_sent: false,
                launched_any: false,
                session: config.session,
                register: config.register,
            })),
            fsm_sender,
            lifetime,
            guard: Arc::new(Mutex::new(Some(guard))),
        };

        let fsm = CallFsm::new();
        hub.runtime().spawn(run_call_fsm(fsm_receiver, fsm));

        Ok(call)
    }

    pub fn id(&self) -> CallId {
        self.call_id
    }

    pub fn service(&self) -> &ServiceId {
        &self.service
    }

    pub fn callee(&self) -> &str {
        &self.callee
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub fn subject(&self) -> SubjectId {
        SubjectId::Call(self.call_id)
    }

    pub fn link(&self) -> Link {
        Link::Call {
            id: self.call_id,
            lifetime: self.lifetime.clone(),
        }
    }

    pub fn lifetime(&self) -> &Lifetime {
        &self.lifetime
    }

    pub fn state(&self) -> Result<CallState> {
        let state = self.state.guarded("call state")?;
        Ok(*state)
    }

    pub(crate) fn set_state(&self, new_state: CallState) -> Result<()> {
        let mut state = self.state.guarded("call state")?;
        *state = new_state;
        Ok(())
    }

    pub fn terminating(&self) -> Result<bool> {
        Ok(matches!(
            self.state()?,
            CallState::Stopping | CallState::Stopped
        ))
    }

    pub(crate) fn with_inner<R>(&self, f: impl FnOnce(&mut CallInner) -> R) -> Result<R> {
        let mut inner = self.inner.guarded("call inner")?;
        Ok(f(&mut inner))
    }

    pub(crate) fn inject(&self, event: CallEvent) -> Result<()> {
        self.fsm_sender
            .send((self.clone(), event))
            .map_err(|_| HubError::FsmStreamSend(self.call_id.to_string()).into())
    }

    pub(crate) fn start_timer(&self, delay: Duration, event: CallEvent) {
        let call = self.clone();
        self.hub.runtime().spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = call.inject(event);
        });
    }

    ////////////////////////////////////////////////////////////////////////
    // Public operations
    ////////////////////////////////////////////////////////////////////////

    pub(crate) fn start(&self) -> Result<()> {
        self.inject(CallEvent::Start)
    }

    /// A launched destination started ringing.
    pub fn ringing(&self, link: Link, answer: Option<Sdp>) -> Result<()> {
        info!("API:ringing(): call_id: {}", self.call_id);
        self.check_invite(&link)?;
        self.inject(CallEvent::Ringing { link, answer })
    }

    /// A launched destination answered; first one wins.
    pub fn answered(&self, link: Link, answer: Sdp) -> Result<()> {
        info!("API:answered(): call_id: {}", self.call_id);
        self.check_invite(&link)?;
        self.inject(CallEvent::Answered { link, answer })
    }

    /// A launched destination declined.
    pub fn rejected(&self, link: Link) -> Result<()> {
        info!("API:rejected(): call_id: {}", self.call_id);
        self.check_invite(&link)?;
        self.inject(CallEvent::Rejected { link })
    }

    /// Idempotent hangup; the `hangup` event is emitted exactly once.
    pub fn hangup(&self, reason: Reason) -> Result<()> {
        info!("API:hangup({}): call_id: {}", reason, self.call_id);
        if self.terminating()? {
            return Ok(());
        }
        self.inject(CallEvent::Hangup(reason))
    }

    pub fn register(&self, link: Link, role: ObserverRole, payload: Option<Value>) -> Result<()> {
        self.hub.watch_lifetime(link.lifetime());
        self.hub.fabric().add(self.subject(), link, role, payload)
    }

    pub fn unregister(&self, link: &Link) -> Result<()> {
        self.hub.fabric().remove(&self.subject(), link)
    }

    /// Offer shared with every out-leg invite, if any.
    pub fn shared_offer(&self) -> Result<Option<Sdp>> {
        self.with_inner(|inner| inner.offer.clone())
    }

    pub fn meta(&self) -> Result<Value> {
        self.with_inner(|inner| inner.meta.clone())
    }

    pub fn callee_link(&self) -> Result<Option<Link>> {
        self.with_inner(|inner| inner.callee_link.clone())
    }

    pub(crate) fn inject_observed(&self, event: Event) -> Result<()> {
        self.inject(CallEvent::Observed(Box::new(event)))
    }

    pub(crate) fn inject_observer_died(&self, role: ObserverRole, link: Link) -> Result<()> {
        self.inject(CallEvent::ObserverDied { role, link })
    }

    fn check_invite(&self, link: &Link) -> Result<()> {
        let found = self.with_inner(|inner| {
            inner
                .invites
                .iter()
                .any(|invite| invite.link.as_ref() == Some(link) && !invite.removed)
        })?;
        if found {
            Ok(())
        } else {
            Err(HubError::InviteNotFound.into())
        }
    }

    /// Wire-facing call description for `call.list` style reads.
    pub fn info(&self) -> Result<Value> {
        let inner = self.inner.guarded("call inner")?;
        Ok(json!({
            "call_id": self.call_id,
            "service": self.service,
            "callee": inner.callee,
            "state": self.state()?.to_string().to_lowercase(),
            "invites": inner.invites.len(),
            "answered": inner.callee_link.as_ref().map(|l| l.to_string()),
        }))
    }

    pub(crate) fn emit(&self, kind: EventKind) {
        let event = Event::new(self.subject(), self.service.clone(), kind);
        self.hub.publish(&event);
    }

    pub(crate) fn end_lifetime(&self) {
        if let Ok(mut guard) = self.guard.guarded("call guard") {
            if let Some(guard) = guard.take() {
                guard.end();
            }
        }
    }
}
