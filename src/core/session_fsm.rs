//
// Copyright 2019-2024 MediaHub Authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Session Finite State Machine
//!
//! The session FSM mediates between the signaling side of a media leg
//! and its backend adapter. It consumes the session's event mailbox,
//! so all state mutation for one session is serialized here.
//!
//! # Asynchronous Inputs:
//!
//! ## From signaling adapters
//!
//! - Start
//! - SetOffer / SetAnswer
//! - Update
//! - Candidate
//! - Stop
//!
//! ## From the media engine
//!
//! - Backend (parked, bridged, channel stop, candidates, media)
//!
//! ## From the observer fabric
//!
//! - Observed events, observer deaths
//!
//! ## From the internal timers
//!
//! - WaitTimeout, ReadyTimeout, TrickleHoldExpired, PendingDeadline

use std::sync::mpsc::SyncSender;

use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::backend::{
    BackendCx, BackendEvent, BackendSession, ExtOps, Outcome, PendingOp, Reply,
};
use crate::common::{
    LockGuarded, ObserverRole, Reason, Result, ServiceId, SessionId, SessionState, SessionType,
    TypeExt, UpdateKind, PARK_WAIT, STOP_GRACE, TRICKLE_HOLD,
};
use crate::core::event::{Event, EventKind};
use crate::core::link::Link;
use crate::core::sdp::{aggregate_candidates, Candidate, Sdp, TrickleCandidate};
use crate::core::session::{Session, SessionEvent};
use crate::error::HubError;

/// Which operation produced a backend outcome; failure policy differs.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum OpKind {
    /// start / set_offer / set_answer: backend errors stop the session.
    Setup,
    /// update: errors return to the caller only.
    Update,
    /// candidate forwarding: errors are logged.
    Candidate,
    /// asynchronous backend notification.
    Event,
}

struct PendingCtx {
    generation: u64,
    op: PendingOp,
    reply: Option<SyncSender<Result<()>>>,
}

/// Borrow bundle handed to backend adapter calls.
struct CxData {
    session_id: SessionId,
    service: ServiceId,
    session_type: SessionType,
    type_ext: TypeExt,
    offer: Option<Sdp>,
    answer: Option<Sdp>,
    peer_ref: Option<String>,
}

impl CxData {
    fn from(session: &Session, peer_ref: Option<String>) -> Result<CxData> {
        let (session_type, type_ext) =
            session.with_inner(|inner| (inner.session_type, inner.type_ext.clone()))?;
        Ok(CxData {
            session_id: session.id(),
            service: session.service().clone(),
            session_type,
            type_ext,
            offer: session.offer()?,
            answer: session.answer()?,
            peer_ref,
        })
    }

    fn cx(&self) -> BackendCx<'_> {
        BackendCx {
            session_id: self.session_id,
            service: &self.service,
            session_type: self.session_type,
            type_ext: &self.type_ext,
            offer: self.offer.as_ref(),
            answer: self.answer.as_ref(),
            peer_ref: self.peer_ref.clone(),
        }
    }
}

pub(crate) struct SessionFsm {
    backend: Option<Box<dyn BackendSession>>,
    /// Client candidates buffered until the backend reports ready.
    buffered: Vec<TrickleCandidate>,
    backend_ready: bool,
    end_of_candidates: bool,
    /// Start held while trickle candidates arrive.
    trickle_hold: bool,
    held_offer: Option<Sdp>,
    pending: Option<PendingCtx>,
    pending_generation: u64,
    answer_emitted: bool,
    stop_emitted: bool,
    /// Bridge issued automatically once the leg is up.
    auto_bridge: Option<SessionId>,
}

/// Pump the session's event mailbox into the FSM.
pub(crate) async fn run_session_fsm(
    mut event_stream: UnboundedReceiver<(Session, SessionEvent)>,
    mut fsm: SessionFsm,
) {
    while let Some((session, event)) = event_stream.recv().await {
        let state = match session.state() {
            Ok(state) => state,
            Err(e) => {
                error!("session fsm: state unavailable: {}", e);
                break;
            }
        };
        info!("session {}: state: {}, event: {}", session.id(), state, event);
        let terminate = matches!(event, SessionEvent::Terminate);
        if let Err(e) = fsm.handle_event(&session, state, event) {
            error!("session {}: handling event failed: {}", session.id(), e);
        }
        if terminate {
            break;
        }
    }
    debug!("session fsm: event stream closed");
}

impl SessionFsm {
    pub(crate) fn new() -> Self {
        Self {
            backend: None,
            buffered: Vec::new(),
            backend_ready: false,
            end_of_candidates: false,
            trickle_hold: false,
            held_offer: None,
            pending: None,
            pending_generation: 0,
            answer_emitted: false,
            stop_emitted: false,
            auto_bridge: None,
        }
    }

    /// Top level event dispatch.
    fn handle_event(
        &mut self,
        session: &Session,
        state: SessionState,
        event: SessionEvent,
    ) -> Result<()> {
        // Stop and terminate are handled even mid-teardown.
        match event {
            SessionEvent::Stop(reason) => return self.handle_stop(session, state, reason),
            SessionEvent::Terminate => return self.handle_terminate(session),
            _ => {}
        }

        // If in the process of terminating, drop all other events.
        if let SessionState::Stopping | SessionState::Stopped = state {
            debug!("handle_event(): dropping event while terminating");
            return Ok(());
        }

        match event {
            SessionEvent::Start => self.handle_start(session, state),
            SessionEvent::SetOffer(sdp) => self.handle_set_offer(session, state, sdp),
            SessionEvent::SetAnswer { sdp } => self.handle_set_answer(session, state, sdp),
            SessionEvent::Update { kind, opts, reply } => {
                self.handle_update(session, state, kind, opts, reply)
            }
            SessionEvent::Candidate(candidate) => self.handle_candidate(session, candidate),
            SessionEvent::Backend(ev) => self.handle_backend(session, state, ev),
            SessionEvent::Observed(event) => self.handle_observed(session, *event),
            SessionEvent::ObserverDied { role, link } => {
                self.handle_observer_died(session, role, link)
            }
            SessionEvent::PeerBridgeStopped { peer } => {
                self.handle_peer_bridge_stopped(session, state, peer)
            }
            SessionEvent::TrickleHoldExpired => self.handle_trickle_hold_expired(session),
            SessionEvent::PendingDeadline(generation) => {
                self.handle_pending_deadline(session, generation)
            }
            SessionEvent::WaitTimeout => self.handle_wait_timeout(session, state),
            SessionEvent::ReadyTimeout => self.handle_ready_timeout(session, state),
            SessionEvent::Stop(_) | SessionEvent::Terminate => Ok(()),
        }
    }

    fn unexpected_state(&self, session: &Session, state: SessionState, event: &str) {
        warn!(
            "session {}: unexpected {} in state {}",
            session.id(),
            event,
            state
        );
    }

    ////////////////////////////////////////////////////////////////////////
    // Start
    ////////////////////////////////////////////////////////////////////////

    fn handle_start(&mut self, session: &Session, state: SessionState) -> Result<()> {
        if state != SessionState::New {
            self.unexpected_state(session, state, "Start");
            return Ok(());
        }
        let config = session.with_inner(|inner| inner.config.clone())?;

        for registration in &config.register {
            session.register(
                registration.link.clone(),
                registration.role,
                registration.payload.clone(),
            )?;
        }
        if let Some(master) = config.master_peer {
            if let Ok(master_session) = session.hub().session(&master) {
                session.register(master_session.link(), ObserverRole::MasterPeer, None)?;
            }
        }
        self.auto_bridge = config.peer;

        match config.offer {
            Some(offer) => {
                if !self.init_backend(session)? {
                    return self.do_stop(
                        session,
                        Reason::Backend("no backend supports type".to_string()),
                    );
                }
                let needs_full = self
                    .backend
                    .as_ref()
                    .map(|b| b.needs_full_sdp())
                    .unwrap_or(false);
                if needs_full && offer.trickle_ice && !self.end_of_candidates {
                    // Hold the start until the client finishes
                    // trickling or the deadline elapses, then re-issue
                    // it with the aggregated SDP.
                    self.trickle_hold = true;
                    self.held_offer = Some(offer);
                    session.set_state(SessionState::WaitOffer)?;
                    session.start_timer(TRICKLE_HOLD, SessionEvent::TrickleHoldExpired);
                    return Ok(());
                }
                self.proceed_start_with_offer(session, offer)
            }
            None => {
                if !self.init_backend(session)? {
                    return self.do_stop(
                        session,
                        Reason::Backend("no backend supports type".to_string()),
                    );
                }
                if config.session_type == SessionType::P2p {
                    // The offer must come from a signaling peer; relay
                    // candidates in the meantime.
                    self.backend_ready = true;
                    session.set_state(SessionState::WaitOffer)?;
                    session.start_timer(config.wait_timeout, SessionEvent::WaitTimeout);
                    return Ok(());
                }
                self.proceed_start_generate(session)
            }
        }
    }

    /// Walk the backend chain and init the first adapter that claims
    /// this session type. Returns false when nothing does.
    fn init_backend(&mut self, session: &Session) -> Result<bool> {
        let (preference, session_type) =
            session.with_inner(|inner| (inner.backend_kind, inner.session_type))?;
        let cxd = CxData::from(session, None)?;
        for backend in session.hub().backends()? {
            if let Some(preference) = preference {
                if backend.kind() != preference {
                    continue;
                }
            }
            if !backend.supports(session_type) {
                continue;
            }
            let backend_session = backend.init(&cxd.cx())?;
            session.with_inner(|inner| inner.backend_kind = Some(backend.kind()))?;
            self.backend = Some(backend_session);
            return Ok(true);
        }
        Ok(false)
    }

    fn proceed_start_with_offer(&mut self, session: &Session, offer: Sdp) -> Result<()> {
        self.set_media_offer(session, offer)?;
        let cxd = CxData::from(session, None)?;
        let outcome = match self.backend.as_mut() {
            Some(backend) => backend.start(&cxd.cx()),
            None => Outcome::Complete(Reply::default()),
        };
        self.apply_outcome(session, OpKind::Setup, outcome, None)
    }

    fn proceed_start_generate(&mut self, session: &Session) -> Result<()> {
        let cxd = CxData::from(session, None)?;
        let outcome = match self.backend.as_mut() {
            Some(backend) => backend.start(&cxd.cx()),
            None => Outcome::Error(Reason::Backend("no backend".to_string())),
        };
        self.apply_outcome(session, OpKind::Setup, outcome, None)
    }

    ////////////////////////////////////////////////////////////////////////
    // Offer / answer
    ////////////////////////////////////////////////////////////////////////

    fn handle_set_offer(&mut self, session: &Session, state: SessionState, sdp: Sdp) -> Result<()> {
        match state {
            SessionState::New | SessionState::WaitOffer => {}
            _ => {
                self.unexpected_state(session, state, "SetOffer");
                return Ok(());
            }
        }
        if self.trickle_hold {
            self.unexpected_state(session, state, "SetOffer");
            return Ok(());
        }
        if self.backend.is_some() {
            self.set_media_offer(session, sdp.clone())?;
            let cxd = CxData::from(session, None)?;
            let outcome = match self.backend.as_mut() {
                Some(backend) => backend.set_offer(&sdp, &cxd.cx()),
                None => return Ok(()),
            };
            self.apply_outcome(session, OpKind::Setup, outcome, None)
        } else {
            self.set_media_offer(session, sdp)?;
            let ready_timeout = session.with_inner(|inner| inner.config.ready_timeout)?;
            session.set_state(SessionState::WaitAnswer)?;
            session.start_timer(ready_timeout, SessionEvent::ReadyTimeout);
            Ok(())
        }
    }

    fn handle_set_answer(
        &mut self,
        session: &Session,
        state: SessionState,
        sdp: Sdp,
    ) -> Result<()> {
        if session.answer()?.is_some() {
            // Raced double injection; the handle already rejected
            // duplicates synchronously.
            return Ok(());
        }
        match state {
            SessionState::WaitAnswer | SessionState::WaitOffer | SessionState::New => {}
            _ => {
                self.unexpected_state(session, state, "SetAnswer");
                return Ok(());
            }
        }
        if let Some(backend) = self.backend.as_mut() {
            let cxd = CxData::from(session, None)?;
            match backend.set_answer(&sdp, &cxd.cx()) {
                Outcome::Complete(reply) => {
                    self.apply_reply(session, reply, false)?;
                    self.set_media_answer(session, sdp)?;
                    self.recompute_state(session)?;
                    Ok(())
                }
                outcome => self.apply_outcome(session, OpKind::Setup, outcome, None),
            }
        } else {
            self.set_media_answer(session, sdp)?;
            self.recompute_state(session)?;
            Ok(())
        }
    }

    ////////////////////////////////////////////////////////////////////////
    // Update
    ////////////////////////////////////////////////////////////////////////

    fn handle_update(
        &mut self,
        session: &Session,
        state: SessionState,
        kind: UpdateKind,
        opts: Value,
        reply: Option<SyncSender<Result<()>>>,
    ) -> Result<()> {
        match state {
            SessionState::Ready | SessionState::WaitAnswer => {}
            _ => {
                if let Some(tx) = reply {
                    let _ = tx.send(Err(HubError::InvalidState(state.to_string()).into()));
                }
                return Ok(());
            }
        }
        if self.pending.is_some() {
            if let Some(tx) = reply {
                let _ = tx.send(Err(
                    HubError::SessionError("operation pending".to_string()).into()
                ));
            }
            return Ok(());
        }
        let backend = match self.backend.as_mut() {
            Some(backend) => backend,
            None => {
                if let Some(tx) = reply {
                    let _ = tx.send(Err(HubError::SessionError("no backend".to_string()).into()));
                }
                return Ok(());
            }
        };

        // A bridge needs the peer leg's engine reference, resolved
        // here so the adapter call stays synchronous.
        let mut peer_ref = None;
        if kind == UpdateKind::SessionType {
            let target = opts
                .get("session_type")
                .and_then(Value::as_str)
                .and_then(|s| s.parse::<SessionType>().ok());
            if target == Some(SessionType::Bridge) {
                let peer_id = opts
                    .get("peer_id")
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse::<SessionId>().ok());
                let peer_id = match peer_id {
                    Some(peer_id) => peer_id,
                    None => {
                        if let Some(tx) = reply {
                            let _ = tx.send(Err(HubError::InvalidParams(
                                "bridge needs peer_id".to_string(),
                            )
                            .into()));
                        }
                        return Ok(());
                    }
                };
                session.with_inner(|inner| inner.type_ext.peer_id = Some(peer_id))?;
                peer_ref = match session.hub().session(&peer_id) {
                    Ok(peer) => peer.backend_ref()?,
                    Err(_) => None,
                };
                if peer_ref.is_none() {
                    if let Some(tx) = reply {
                        let _ = tx.send(Err(HubError::SessionError(
                            "bridge peer has no leg".to_string(),
                        )
                        .into()));
                    }
                    return Ok(());
                }
            }
        }

        let cxd = CxData::from(session, peer_ref)?;
        let outcome = backend.update(kind, &opts, &cxd.cx());
        self.apply_outcome(session, OpKind::Update, outcome, reply)
    }

    ////////////////////////////////////////////////////////////////////////
    // Candidates
    ////////////////////////////////////////////////////////////////////////

    fn handle_candidate(&mut self, session: &Session, candidate: TrickleCandidate) -> Result<()> {
        if self.trickle_hold {
            match candidate {
                TrickleCandidate::End => {
                    self.end_of_candidates = true;
                    return self.resume_trickle(session);
                }
                c @ TrickleCandidate::Candidate(_) => {
                    self.buffered.push(c);
                    return Ok(());
                }
            }
        }
        if matches!(candidate, TrickleCandidate::End) {
            if self.end_of_candidates {
                // End-of-candidates is idempotent.
                return Ok(());
            }
            self.end_of_candidates = true;
        }
        if self.backend_ready && self.backend.is_some() {
            let cxd = CxData::from(session, None)?;
            let outcome = match self.backend.as_mut() {
                Some(backend) => backend.candidate(&candidate, &cxd.cx()),
                None => return Ok(()),
            };
            self.apply_outcome(session, OpKind::Candidate, outcome, None)
        } else {
            self.buffered.push(candidate);
            Ok(())
        }
    }

    /// Forward buffered candidates in arrival order once the backend
    /// is ready.
    fn flush_candidates(&mut self, session: &Session) -> Result<()> {
        if self.backend.is_none() {
            return Ok(());
        }
        let buffered = std::mem::take(&mut self.buffered);
        for candidate in buffered {
            let cxd = CxData::from(session, None)?;
            let outcome = match self.backend.as_mut() {
                Some(backend) => backend.candidate(&candidate, &cxd.cx()),
                None => return Ok(()),
            };
            if let Outcome::Error(reason) = outcome {
                warn!("session {}: buffered candidate rejected: {}", session.id(), reason);
            } else {
                self.apply_outcome(session, OpKind::Candidate, outcome, None)?;
            }
        }
        Ok(())
    }

    fn resume_trickle(&mut self, session: &Session) -> Result<()> {
        if !self.trickle_hold {
            return Ok(());
        }
        self.trickle_hold = false;
        let offer = match self.held_offer.take() {
            Some(offer) => offer,
            None => return Ok(()),
        };
        let candidates: Vec<Candidate> = std::mem::take(&mut self.buffered)
            .into_iter()
            .filter_map(|c| match c {
                TrickleCandidate::Candidate(c) => Some(c),
                TrickleCandidate::End => None,
            })
            .collect();
        let full = aggregate_candidates(&offer, &candidates);
        self.proceed_start_with_offer(session, full)
    }

    fn handle_trickle_hold_expired(&mut self, session: &Session) -> Result<()> {
        if self.trickle_hold {
            debug!("session {}: trickle hold expired", session.id());
            self.resume_trickle(session)?;
        }
        Ok(())
    }

    ////////////////////////////////////////////////////////////////////////
    // Backend events
    ////////////////////////////////////////////////////////////////////////

    fn handle_backend(
        &mut self,
        session: &Session,
        _state: SessionState,
        event: BackendEvent,
    ) -> Result<()> {
        match event {
            BackendEvent::ChannelStop { cause } => {
                debug!("session {}: channel stop: {}", session.id(), cause);
                self.do_stop(session, Reason::ChannelStop)
            }
            BackendEvent::Disconnected => self.do_stop(session, Reason::MediaServerDown),
            event => {
                let backend = match self.backend.as_mut() {
                    Some(backend) => backend,
                    None => return Ok(()),
                };
                let cxd = CxData::from(session, None)?;
                let outcome = backend.on_event(event, &cxd.cx());
                self.apply_outcome(session, OpKind::Event, outcome, None)
            }
        }
    }

    ////////////////////////////////////////////////////////////////////////
    // Observers
    ////////////////////////////////////////////////////////////////////////

    fn handle_observed(&mut self, session: &Session, event: Event) -> Result<()> {
        match event.kind {
            EventKind::Hangup { reason } | EventKind::Stop { reason } => {
                self.do_stop(session, reason)
            }
            EventKind::Answer { sdp: Some(sdp), .. } => {
                if session.answer()?.is_none() {
                    session.inject(SessionEvent::SetAnswer { sdp })?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn handle_observer_died(
        &mut self,
        session: &Session,
        role: ObserverRole,
        link: Link,
    ) -> Result<()> {
        debug!("session {}: observer died: {} ({})", session.id(), link, role);
        self.do_stop(session, role.death_reason())
    }

    fn handle_peer_bridge_stopped(
        &mut self,
        session: &Session,
        state: SessionState,
        peer: SessionId,
    ) -> Result<()> {
        let is_our_peer = session.with_inner(|inner| {
            inner.session_type == SessionType::Bridge && inner.type_ext.peer_id == Some(peer)
        })?;
        if !is_our_peer || state != SessionState::Ready {
            return Ok(());
        }
        info!("session {}: bridge peer {} stopped, back to park", session.id(), peer);
        session.with_inner(|inner| {
            inner.master_peer = None;
            inner.slave_peer = None;
        })?;
        // Re-park the surviving leg through the normal update path.
        self.handle_update(
            session,
            state,
            UpdateKind::SessionType,
            json!({ "session_type": "park" }),
            None,
        )
    }

    ////////////////////////////////////////////////////////////////////////
    // Timers
    ////////////////////////////////////////////////////////////////////////

    fn handle_pending_deadline(&mut self, session: &Session, generation: u64) -> Result<()> {
        match self.pending.take() {
            Some(pending) if pending.generation == generation => {
                warn!(
                    "session {}: backend confirmation timed out: {}",
                    session.id(),
                    pending.op
                );
                if let Some(tx) = pending.reply {
                    let _ = tx.send(Err(HubError::Timeout(pending.op.to_string()).into()));
                }
                self.recompute_state(session)
            }
            Some(pending) => {
                // Stale deadline from an earlier operation.
                self.pending = Some(pending);
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn handle_wait_timeout(&mut self, session: &Session, state: SessionState) -> Result<()> {
        if state == SessionState::WaitOffer && !self.trickle_hold {
            return self.do_stop(session, Reason::Timeout);
        }
        Ok(())
    }

    fn handle_ready_timeout(&mut self, session: &Session, state: SessionState) -> Result<()> {
        if state == SessionState::WaitAnswer {
            return self.do_stop(session, Reason::Timeout);
        }
        Ok(())
    }

    ////////////////////////////////////////////////////////////////////////
    // Outcome application
    ////////////////////////////////////////////////////////////////////////

    fn apply_outcome(
        &mut self,
        session: &Session,
        op: OpKind,
        outcome: Outcome,
        reply: Option<SyncSender<Result<()>>>,
    ) -> Result<()> {
        match outcome {
            Outcome::Complete(backend_reply) => {
                // Only engine confirmations resolve a parked
                // operation; candidate traffic passing through while
                // one is outstanding must not.
                let resolved = if op == OpKind::Event {
                    self.pending.take()
                } else {
                    None
                };
                self.apply_reply(session, backend_reply, op != OpKind::Setup)?;
                if let Some(pending) = resolved {
                    if let Some(tx) = pending.reply {
                        let _ = tx.send(Ok(()));
                    }
                    if let PendingOp::Bridged { peer } = pending.op {
                        self.finish_bridge(session, peer)?;
                    }
                }
                if let Some(tx) = reply {
                    let _ = tx.send(Ok(()));
                }
                self.recompute_state(session)
            }
            Outcome::Pending { op: pending_op, ext } => {
                // Park the operation before applying its attribute
                // mutations, so state recomputation holds off until
                // the engine confirms.
                self.pending_generation += 1;
                let generation = self.pending_generation;
                self.pending = Some(PendingCtx {
                    generation,
                    op: pending_op,
                    reply,
                });
                self.apply_ext(session, ext, op != OpKind::Setup)?;
                session.start_timer(PARK_WAIT, SessionEvent::PendingDeadline(generation));
                Ok(())
            }
            Outcome::Error(reason) => {
                match op {
                    OpKind::Setup => {
                        // Hard failure on the media path: the session
                        // cannot come up.
                        self.do_stop(session, reason)
                    }
                    OpKind::Update => {
                        if let Some(tx) = reply {
                            let _ = tx.send(Err(HubError::Backend(reason.to_string()).into()));
                        } else {
                            warn!("session {}: update failed: {}", session.id(), reason);
                        }
                        Ok(())
                    }
                    OpKind::Candidate => {
                        warn!("session {}: candidate rejected: {}", session.id(), reason);
                        Ok(())
                    }
                    OpKind::Event => {
                        if let Some(pending) = self.pending.take() {
                            if let Some(tx) = pending.reply {
                                let _ =
                                    tx.send(Err(HubError::Backend(reason.to_string()).into()));
                            }
                            warn!(
                                "session {}: pending {} failed: {}",
                                session.id(),
                                pending.op,
                                reason
                            );
                            self.recompute_state(session)
                        } else {
                            warn!("session {}: backend event error: {}", session.id(), reason);
                            Ok(())
                        }
                    }
                }
            }
            Outcome::Continue => {
                if let Some(tx) = reply {
                    let _ = tx.send(Err(HubError::UnknownCommand("update".to_string()).into()));
                } else if op == OpKind::Setup {
                    return self.do_stop(
                        session,
                        Reason::Backend("operation not claimed".to_string()),
                    );
                }
                Ok(())
            }
        }
    }

    fn apply_reply(&mut self, session: &Session, reply: Reply, notify: bool) -> Result<()> {
        self.apply_ext(session, reply.ext, notify)?;
        if let Some(candidate) = reply.emit_candidate {
            session.emit(EventKind::Candidate { candidate });
        }
        Ok(())
    }

    /// Apply requested session attribute mutations, atomically with
    /// respect to the FSM and before any outbound event.
    fn apply_ext(&mut self, session: &Session, ext: ExtOps, notify: bool) -> Result<()> {
        if let Some(backend_ref) = ext.backend_ref {
            session.with_inner(|inner| inner.backend_ref = Some(backend_ref))?;
        }
        if ext.ready && !self.backend_ready {
            self.backend_ready = true;
            self.flush_candidates(session)?;
        }

        if ext.session_type.is_some() || ext.type_ext.is_some() {
            let type_changed = session.with_inner(|inner| {
                let before = (inner.session_type, inner.type_ext.clone());
                if let Some(session_type) = ext.session_type {
                    inner.session_type = session_type;
                    // A type switch replaces the extension attributes;
                    // a bare extension update merges.
                    inner.type_ext = ext.type_ext.clone().unwrap_or_default();
                } else if let Some(type_ext) = &ext.type_ext {
                    inner.type_ext.merge(type_ext);
                }
                if inner.session_type == SessionType::Bridge {
                    inner.park_after_bridge = true;
                }
                before != (inner.session_type, inner.type_ext.clone())
            })?;
            if type_changed {
                session.hub().rooms().sync_session(session)?;
                if notify {
                    let (session_type, type_ext) = session
                        .with_inner(|inner| (inner.session_type, inner.type_ext.clone()))?;
                    session.emit(EventKind::UpdatedType {
                        session_type,
                        ext: type_ext,
                    });
                }
            }
        }

        if let Some(offer) = ext.offer {
            self.set_media_offer(session, offer)?;
        }
        if let Some(answer) = ext.answer {
            self.set_media_answer(session, answer)?;
        }
        self.recompute_state(session)
    }

    fn set_media_offer(&mut self, session: &Session, offer: Sdp) -> Result<()> {
        let (lock, cvar) = &**session.media();
        {
            let mut media = lock.guarded("media")?;
            if media.offer.is_some() {
                return Ok(());
            }
            media.offer = Some(offer);
        }
        cvar.notify_all();
        Ok(())
    }

    /// Store the answer (immutable once set), emit the `answer` event
    /// exactly once and propagate to the master leg.
    fn set_media_answer(&mut self, session: &Session, answer: Sdp) -> Result<()> {
        let stored = {
            let (lock, cvar) = &**session.media();
            let mut media = lock.guarded("media")?;
            if media.answer.is_some() {
                false
            } else {
                media.answer = Some(answer.clone());
                cvar.notify_all();
                true
            }
        };
        if !stored {
            return Ok(());
        }
        if !self.answer_emitted {
            self.answer_emitted = true;
            session.emit(EventKind::Answer {
                sdp: Some(answer.clone()),
                link: None,
            });
        }
        let master = session.with_inner(|inner| inner.master_peer)?;
        if let Some(master) = master {
            if let Ok(master_session) = session.hub().session(&master) {
                match master_session.set_answer(answer) {
                    Ok(()) => {}
                    Err(e) => debug!(
                        "session {}: answer propagation to {} skipped: {}",
                        session.id(),
                        master,
                        e
                    ),
                }
            }
        }
        Ok(())
    }

    /// Settle the lifecycle state from what media is in place, once no
    /// operation is pending.
    fn recompute_state(&mut self, session: &Session) -> Result<()> {
        if self.pending.is_some() {
            return Ok(());
        }
        let state = session.state()?;
        if matches!(state, SessionState::Stopping | SessionState::Stopped) {
            return Ok(());
        }
        let (has_offer, has_answer) = {
            let (lock, _) = &**session.media();
            let media = lock.guarded("media")?;
            (media.offer.is_some(), media.answer.is_some())
        };
        if has_answer {
            if state != SessionState::Ready {
                session.set_state(SessionState::Ready)?;
                self.on_ready(session)?;
            }
        } else if has_offer {
            if state != SessionState::WaitAnswer {
                session.set_state(SessionState::WaitAnswer)?;
                let ready_timeout = session.with_inner(|inner| inner.config.ready_timeout)?;
                session.start_timer(ready_timeout, SessionEvent::ReadyTimeout);
            }
        }
        Ok(())
    }

    fn on_ready(&mut self, session: &Session) -> Result<()> {
        if let Some(peer) = self.auto_bridge.take() {
            session.inject(SessionEvent::Update {
                kind: UpdateKind::SessionType,
                opts: json!({ "session_type": "bridge", "peer_id": peer.to_string() }),
                reply: None,
            })?;
        }
        Ok(())
    }

    /// Record the bridge cross-links and enroll the peer leg; blocking
    /// request toward the peer, per bridge pair coordination.
    fn finish_bridge(&mut self, session: &Session, peer: SessionId) -> Result<()> {
        session.with_inner(|inner| {
            inner.slave_peer = Some(peer);
            inner.park_after_bridge = true;
        })?;
        if let Ok(peer_session) = session.hub().session(&peer) {
            peer_session.apply_bridge_from(session.id())?;
        }
        Ok(())
    }

    ////////////////////////////////////////////////////////////////////////
    // Stop / terminate
    ////////////////////////////////////////////////////////////////////////

    fn handle_stop(
        &mut self,
        session: &Session,
        state: SessionState,
        reason: Reason,
    ) -> Result<()> {
        if let SessionState::Stopping | SessionState::Stopped = state {
            return Ok(());
        }
        self.do_stop(session, reason)
    }

    fn do_stop(&mut self, session: &Session, reason: Reason) -> Result<()> {
        if self.stop_emitted {
            return Ok(());
        }
        self.stop_emitted = true;
        info!("session {}: stopping: {}", session.id(), reason);

        if let Some(mut backend) = self.backend.take() {
            let cxd = CxData::from(session, None)?;
            backend.stop(&reason, &cxd.cx());
        }
        if let Some(pending) = self.pending.take() {
            if let Some(tx) = pending.reply {
                let _ = tx.send(Err(
                    HubError::SessionError("session stopped".to_string()).into()
                ));
            }
        }

        // Tell a surviving bridge peer to fall back to park.
        let bridge_peer = session.with_inner(|inner| {
            if inner.session_type == SessionType::Bridge {
                inner.type_ext.peer_id.or(inner.slave_peer)
            } else {
                inner.slave_peer
            }
        })?;
        if let Some(peer) = bridge_peer {
            if let Ok(peer_session) = session.hub().session(&peer) {
                peer_session.cast_bridge_stopped(session.id());
            }
        }

        session.with_inner(|inner| inner.stop_reason = Some(reason.clone()))?;
        {
            let (lock, cvar) = &**session.media();
            if let Ok(mut media) = lock.guarded("media") {
                media.stopped = true;
            }
            cvar.notify_all();
        }
        session.hub().rooms().on_session_stopped(session)?;

        session.emit(EventKind::Stop { reason });
        session.set_state(SessionState::Stopping)?;
        // Dependents learn of the death after the final event is out.
        session.end_lifetime();
        session.start_timer(STOP_GRACE, SessionEvent::Terminate);
        Ok(())
    }

    fn handle_terminate(&mut self, session: &Session) -> Result<()> {
        session.set_state(SessionState::Stopped)?;
        session.hub().remove_session(&session.id())?;
        session.hub().fabric().remove_subject(&session.subject())?;
        debug!("session {}: terminated", session.id());
        Ok(())
    }
}
