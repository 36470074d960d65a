//
// Copyright 2019-2024 MediaHub Authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! A media-leg session interface.
//!
//! A `Session` owns exactly one SDP offer/answer pair, one backend
//! operation and a set of observers it notifies on every transition.
//! The handle is cheap to clone; cheap guards run synchronously on the
//! caller's thread, everything that touches a backend or emits events
//! is injected into the session FSM, whose mailbox serializes state
//! mutation.

use std::fmt;
use std::sync::mpsc::SyncSender;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

use crate::backend::{BackendEvent, BackendKind};
use crate::common::{
    LockGuarded, ObserverRole, Reason, Result, ServiceId, SessionId, SessionState, SessionType,
    TypeExt, UpdateKind, ANSWER_WAIT, OFFER_WAIT,
};
use crate::core::event::{Event, EventKind, SubjectId};
use crate::core::hub::Hub;
use crate::core::lifetime::{Lifetime, LifetimeGuard};
use crate::core::link::Link;
use crate::core::sdp::{Sdp, TrickleCandidate};
use crate::core::session_fsm::{run_session_fsm, SessionFsm};
use crate::error::HubError;

/// An observer registration applied at session start.
#[derive(Clone, Debug)]
pub struct Registration {
    pub link: Link,
    pub role: ObserverRole,
    pub payload: Option<Value>,
}

/// Start-time session parameters.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub session_type: SessionType,
    pub type_ext: TypeExt,
    /// Preferred backend; `None` runs the adapter chain.
    pub backend: Option<BackendKind>,
    pub offer: Option<Sdp>,
    /// Session whose answer this leg supplies (call-type out-legs).
    pub master_peer: Option<SessionId>,
    /// Bridge target applied once the leg is up.
    pub peer: Option<SessionId>,
    pub register: Vec<Registration>,
    pub wait_timeout: Duration,
    pub ready_timeout: Duration,
}

impl SessionConfig {
    pub fn new(session_type: SessionType) -> Self {
        Self {
            session_type,
            type_ext: TypeExt::default(),
            backend: None,
            offer: None,
            master_peer: None,
            peer: None,
            register: Vec::new(),
            wait_timeout: OFFER_WAIT,
            ready_timeout: ANSWER_WAIT,
        }
    }

    pub fn with_offer(mut self, offer: Sdp) -> Self {
        self.offer = Some(offer);
        self
    }

    pub fn with_type_ext(mut self, type_ext: TypeExt) -> Self {
        self.type_ext = type_ext;
        self
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_register(mut self, registration: Registration) -> Self {
        self.register.push(registration);
        self
    }
}

/// The different types of session events consumed by the FSM.
pub enum SessionEvent {
    /// Run the start flow.
    Start,
    /// Offer supplied by a signaling peer.
    SetOffer(Sdp),
    /// Answer supplied by a signaling peer or a slave leg.
    SetAnswer { sdp: Sdp },
    /// In-place mutation; `reply` carries the outcome back to a
    /// blocked caller.
    Update {
        kind: UpdateKind,
        opts: Value,
        reply: Option<SyncSender<Result<()>>>,
    },
    /// Trickle candidate or end-of-candidates from the client.
    Candidate(TrickleCandidate),
    /// Asynchronous notification from the media engine.
    Backend(BackendEvent),
    /// Event from a subject this session observes.
    Observed(Box<Event>),
    /// An observer's lifetime ended.
    ObserverDied { role: ObserverRole, link: Link },
    /// Bridge peer leg went away (non-blocking cast from the peer).
    PeerBridgeStopped { peer: SessionId },
    /// Trickle-ICE hold window elapsed.
    TrickleHoldExpired,
    /// Bounded wait for a backend confirmation elapsed.
    PendingDeadline(u64),
    /// No offer arrived in time.
    WaitTimeout,
    /// No answer arrived in time.
    ReadyTimeout,
    /// Stop the session.
    Stop(Reason),
    /// Grace window after the final stop event elapsed.
    Terminate,
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let display = match self {
            Self::Start => "Start".to_string(),
            Self::SetOffer(_) => "SetOffer".to_string(),
            Self::SetAnswer { .. } => "SetAnswer".to_string(),
            Self::Update { kind, .. } => format!("Update({})", kind),
            Self::Candidate(c) => format!("Candidate({})", c),
            Self::Backend(ev) => format!("Backend({})", ev),
            Self::Observed(event) => format!("Observed({})", event.kind),
            Self::ObserverDied { role, link } => {
                format!("ObserverDied({}, {})", role, link)
            }
            Self::PeerBridgeStopped { peer } => format!("PeerBridgeStopped({})", peer),
            Self::TrickleHoldExpired => "TrickleHoldExpired".to_string(),
            Self::PendingDeadline(gen) => format!("PendingDeadline({})", gen),
            Self::WaitTimeout => "WaitTimeout".to_string(),
            Self::ReadyTimeout => "ReadyTimeout".to_string(),
            Self::Stop(reason) => format!("Stop({})", reason),
            Self::Terminate => "Terminate".to_string(),
        };
        write!(f, "({})", display)
    }
}

impl fmt::Debug for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// Mutable session attributes shared between the handle and the FSM.
pub(crate) struct SessionInner {
    pub session_type: SessionType,
    pub type_ext: TypeExt,
    pub backend_kind: Option<BackendKind>,
    /// Engine-side leg/endpoint reference, readable by bridge peers.
    pub backend_ref: Option<String>,
    pub master_peer: Option<SessionId>,
    pub slave_peer: Option<SessionId>,
    pub park_after_bridge: bool,
    pub stop_reason: Option<Reason>,
    pub config: SessionConfig,
}

/// Offer/answer storage behind the blocking getters.
pub(crate) struct MediaState {
    pub offer: Option<Sdp>,
    pub answer: Option<Sdp>,
    pub stopped: bool,
}

pub struct Session {
    session_id: SessionId,
    service: ServiceId,
    hub: Hub,
    state: Arc<Mutex<SessionState>>,
    inner: Arc<Mutex<SessionInner>>,
    media: Arc<(Mutex<MediaState>, Condvar)>,
    /// Injects events into the session FSM.
    fsm_sender: UnboundedSender<(Session, SessionEvent)>,
    lifetime: Lifetime,
    guard: Arc<Mutex<Option<LifetimeGuard>>>,
}

impl Clone for Session {
    fn clone(&self) -> Self {
        Self {
            session_id: self.session_id,
            service: self.service.clone(),
            hub: self.hub.clone(),
            state: Arc::clone(&self.state),
            inner: Arc::clone(&self.inner),
            media: Arc::clone(&self.media),
            fsm_sender: self.fsm_sender.clone(),
            lifetime: self.lifetime.clone(),
            guard: Arc::clone(&self.guard),
        }
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let state = match self.state() {
            Ok(v) => format!("{}", v),
            Err(_) => "unavailable".to_string(),
        };
        write!(f, "session_id: {}, state: {}", self.session_id, state)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl Session {
    pub(crate) fn new(hub: Hub, service: ServiceId, config: SessionConfig) -> Result<Self> {
        let session_id = SessionId::random();
        info!("new(): session_id: {}", session_id);

        let (fsm_sender, fsm_receiver) = unbounded_channel();
        let (lifetime, guard) = Lifetime::create();

        let session = Self {
            session_id,
            service,
            hub: hub.clone(),
            state: Arc::new(Mutex::new(SessionState::New)),
            inner: Arc::new(Mutex::new(SessionInner {
                session_type: config.session_type,
                type_ext: config.type_ext.clone(),
                backend_kind: config.backend,
                backend_ref: None,
                master_peer: config.master_peer,
                slave_peer: None,
                park_after_bridge: false,
                stop_reason: None,
                config,
            })),
            media: Arc::new((
                Mutex::new(MediaState {
                    offer: None,
                    answer: None,
                    stopped: false,
                }),
                Condvar::new(),
            )),
            fsm_sender,
            lifetime,
            guard: Arc::new(Mutex::new(Some(guard))),
        };

        let fsm = SessionFsm::new();
        hub.runtime().spawn(run_session_fsm(fsm_receiver, fsm));

        Ok(session)
    }

    pub fn id(&self) -> SessionId {
        self.session_id
    }

    pub fn service(&self) -> &ServiceId {
        &self.service
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub fn subject(&self) -> SubjectId {
        SubjectId::Session(self.session_id)
    }

    /// Identity link other parties use to observe this session.
    pub fn link(&self) -> Link {
        Link::Session {
            id: self.session_id,
            lifetime: self.lifetime.clone(),
        }
    }

    pub fn lifetime(&self) -> &Lifetime {
        &self.lifetime
    }

    pub fn state(&self) -> Result<SessionState> {
        let state = self.state.guarded("session state")?;
        Ok(*state)
    }

    pub(crate) fn set_state(&self, new_state: SessionState) -> Result<()> {
        let mut state = self.state.guarded("session state")?;
        *state = new_state;
        Ok(())
    }

    pub fn session_type(&self) -> Result<SessionType> {
        Ok(self.inner.guarded("session inner")?.session_type)
    }

    pub fn type_ext(&self) -> Result<TypeExt> {
        Ok(self.inner.guarded("session inner")?.type_ext.clone())
    }

    pub fn backend_ref(&self) -> Result<Option<String>> {
        Ok(self.inner.guarded("session inner")?.backend_ref.clone())
    }

    pub fn park_after_bridge(&self) -> Result<bool> {
        Ok(self.inner.guarded("session inner")?.park_after_bridge)
    }

    pub fn master_peer(&self) -> Result<Option<SessionId>> {
        Ok(self.inner.guarded("session inner")?.master_peer)
    }

    pub fn slave_peer(&self) -> Result<Option<SessionId>> {
        Ok(self.inner.guarded("session inner")?.slave_peer)
    }

    pub fn stop_reason(&self) -> Result<Option<Reason>> {
        Ok(self.inner.guarded("session inner")?.stop_reason.clone())
    }

    pub(crate) fn with_inner<R>(
        &self,
        f: impl FnOnce(&mut SessionInner) -> R,
    ) -> Result<R> {
        let mut inner = self.inner.guarded("session inner")?;
        Ok(f(&mut inner))
    }

    pub(crate) fn media(&self) -> &Arc<(Mutex<MediaState>, Condvar)> {
        &self.media
    }

    pub fn terminating(&self) -> Result<bool> {
        Ok(matches!(
            self.state()?,
            SessionState::Stopping | SessionState::Stopped
        ))
    }

    /// Inject an event into the session FSM.
    pub(crate) fn inject(&self, event: SessionEvent) -> Result<()> {
        self.fsm_sender
            .send((self.clone(), event))
            .map_err(|_| HubError::FsmStreamSend(self.session_id.to_string()).into())
    }

    /// Arm a timer that injects `event` after `delay`.
    pub(crate) fn start_timer(&self, delay: Duration, event: SessionEvent) {
        let session = self.clone();
        self.hub.runtime().spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = session.inject(event);
        });
    }

    ////////////////////////////////////////////////////////////////////////
    // Public operations
    ////////////////////////////////////////////////////////////////////////

    pub(crate) fn start(&self) -> Result<()> {
        self.inject(SessionEvent::Start)
    }

    /// Supply the offer; only valid while the session waits for one.
    pub fn set_offer(&self, offer: Sdp) -> Result<()> {
        info!("API:set_offer(): session_id: {}", self.session_id);
        match self.state()? {
            SessionState::New | SessionState::WaitOffer => {}
            state => return Err(HubError::InvalidState(state.to_string()).into()),
        }
        {
            let media = self.media.0.guarded("media")?;
            if media.offer.is_some() {
                return Err(HubError::AlreadyOffered.into());
            }
        }
        self.inject(SessionEvent::SetOffer(offer))
    }

    /// Supply the answer. Duplicate answers are rejected and do not
    /// stop the session.
    pub fn set_answer(&self, answer: Sdp) -> Result<()> {
        info!("API:set_answer(): session_id: {}", self.session_id);
        if self.terminating()? {
            return Err(HubError::InvalidState("stopped".to_string()).into());
        }
        {
            let media = self.media.0.guarded("media")?;
            if media.answer.is_some() {
                return Err(HubError::AlreadyAnswered.into());
            }
        }
        self.inject(SessionEvent::SetAnswer { sdp: answer })
    }

    /// Fire-and-forget update.
    pub fn update(&self, kind: UpdateKind, opts: Value) -> Result<()> {
        info!("API:update({}): session_id: {}", kind, self.session_id);
        self.inject(SessionEvent::Update {
            kind,
            opts,
            reply: None,
        })
    }

    /// Update and wait for the backend to confirm or reject it.
    pub fn update_blocking(&self, kind: UpdateKind, opts: Value, timeout: Duration) -> Result<()> {
        info!(
            "API:update_blocking({}): session_id: {}",
            kind, self.session_id
        );
        let (tx, rx) = std::sync::mpsc::sync_channel(1);
        self.inject(SessionEvent::Update {
            kind,
            opts,
            reply: Some(tx),
        })?;
        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(_) => Err(HubError::Timeout("update".to_string()).into()),
        }
    }

    /// Buffer or forward a trickle candidate.
    pub fn candidate(&self, candidate: TrickleCandidate) -> Result<()> {
        if self.terminating()? {
            return Err(HubError::InvalidState("stopped".to_string()).into());
        }
        self.inject(SessionEvent::Candidate(candidate))
    }

    /// Register an observer; delegates to the fabric and arranges the
    /// reaper to watch the observer's lifetime.
    pub fn register(&self, link: Link, role: ObserverRole, payload: Option<Value>) -> Result<()> {
        self.hub.watch_lifetime(link.lifetime());
        self.hub
            .fabric()
            .add(self.subject(), link, role, payload)
    }

    pub fn unregister(&self, link: &Link) -> Result<()> {
        self.hub.fabric().remove(&self.subject(), link)
    }

    /// Idempotent stop; the final `stop(reason)` event is emitted
    /// exactly once.
    pub fn stop(&self, reason: Reason) -> Result<()> {
        info!(
            "API:stop({}): session_id: {}",
            reason, self.session_id
        );
        if self.terminating()? {
            return Ok(());
        }
        self.inject(SessionEvent::Stop(reason))
    }

    pub(crate) fn inject_backend_event(&self, event: BackendEvent) -> Result<()> {
        self.inject(SessionEvent::Backend(event))
    }

    pub(crate) fn inject_observed(&self, event: Event) -> Result<()> {
        self.inject(SessionEvent::Observed(Box::new(event)))
    }

    pub(crate) fn inject_observer_died(&self, role: ObserverRole, link: Link) -> Result<()> {
        self.inject(SessionEvent::ObserverDied { role, link })
    }

    /// Non-blocking cast from a bridge peer that is going away.
    pub(crate) fn cast_bridge_stopped(&self, peer: SessionId) {
        let _ = self.inject(SessionEvent::PeerBridgeStopped { peer });
    }

    /// Blocking bridge enrollment issued by the initiating peer; sets
    /// the cross-links and emits `updated_type` on this leg.
    pub(crate) fn apply_bridge_from(&self, master: SessionId) -> Result<()> {
        let (session_type, type_ext) = self.with_inner(|inner| {
            inner.master_peer = Some(master);
            inner.park_after_bridge = true;
            inner.session_type = SessionType::Bridge;
            inner.type_ext.peer_id = Some(master);
            (inner.session_type, inner.type_ext.clone())
        })?;
        self.emit(EventKind::UpdatedType {
            session_type,
            ext: type_ext,
        });
        Ok(())
    }

    /// Blocks up to `timeout` for the offer.
    pub fn get_offer(&self, timeout: Duration) -> Result<Sdp> {
        self.wait_media(timeout, |media| media.offer.clone(), "offer")
    }

    /// Blocks up to `timeout` for the answer.
    pub fn get_answer(&self, timeout: Duration) -> Result<Sdp> {
        self.wait_media(timeout, |media| media.answer.clone(), "answer")
    }

    pub fn offer(&self) -> Result<Option<Sdp>> {
        let media = self.media.0.guarded("media")?;
        Ok(media.offer.clone())
    }

    pub fn answer(&self) -> Result<Option<Sdp>> {
        let media = self.media.0.guarded("media")?;
        Ok(media.answer.clone())
    }

    fn wait_media(
        &self,
        timeout: Duration,
        extract: impl Fn(&MediaState) -> Option<Sdp>,
        what: &str,
    ) -> Result<Sdp> {
        let (lock, cvar) = &**self.media();
        let deadline = Instant::now() + timeout;
        let mut media = lock.guarded("media")?;
        loop {
            if let Some(sdp) = extract(&media) {
                return Ok(sdp);
            }
            if media.stopped {
                return Err(HubError::InvalidState("stopped".to_string()).into());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(HubError::Timeout(what.to_string()).into());
            }
            let (guard, _timed_out) = cvar
                .wait_timeout(media, deadline - now)
                .map_err(|_| HubError::MutexPoisoned("media"))?;
            media = guard;
        }
    }

    /// Wire-facing session description for `session.info`.
    pub fn info(&self) -> Result<Value> {
        let inner = self.inner.guarded("session inner")?;
        let media = self.media.0.guarded("media")?;
        Ok(json!({
            "session_id": self.session_id,
            "service": self.service,
            "type": inner.session_type,
            "type_ext": inner.type_ext,
            "backend": inner.backend_kind.map(|b| b.to_string()),
            "state": self.state()?.to_string().to_lowercase(),
            "has_offer": media.offer.is_some(),
            "has_answer": media.answer.is_some(),
            "master_peer": inner.master_peer,
            "slave_peer": inner.slave_peer,
        }))
    }

    /// Emit a lifecycle event to observers and the topic bus.
    pub(crate) fn emit(&self, kind: EventKind) {
        let event = Event::new(self.subject(), self.service.clone(), kind);
        self.hub.publish(&event);
    }

    /// End this session's lifetime so dependents tear down.
    pub(crate) fn end_lifetime(&self) {
        if let Ok(mut guard) = self.guard.guarded("session guard") {
            if let Some(guard) = guard.take() {
                guard.end();
            }
        }
    }
}
