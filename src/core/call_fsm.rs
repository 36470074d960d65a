//
// Copyright 2019-2024 MediaHub Authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Call Finite State Machine
//!
//! Drives the invite fan-out: resolve the callee, launch invites
//! honoring per-destination wait and ring timers, accept the first
//! answer, cancel the losers, and collapse every failure path into
//! exactly one `hangup` event.

use tokio::sync::mpsc::UnboundedReceiver;

use crate::common::{
    CallState, ObserverRole, Reason, Result, DEF_RING, MAX_RING, STOP_GRACE,
};
use crate::core::call::{Call, CallEvent, Invite};
use crate::core::event::{Event, EventKind};
use crate::core::link::Link;
use crate::core::sdp::Sdp;
use crate::signaling::InviteOutcome;

pub(crate) struct CallFsm {
    hangup_scheduled: bool,
}

/// Pump the call's event mailbox into the FSM.
pub(crate) async fn run_call_fsm(
    mut event_stream: UnboundedReceiver<(Call, CallEvent)>,
    mut fsm: CallFsm,
) {
    while let Some((call, event)) = event_stream.recv().await {
        let state = match call.state() {
            Ok(state) => state,
            Err(e) => {
                error!("call fsm: state unavailable: {}", e);
                break;
            }
        };
        info!("call {}: state: {}, event: {}", call.id(), state, event);
        let terminate = matches!(event, CallEvent::Terminate);
        if let Err(e) = fsm.handle_event(&call, state, event) {
            error!("call {}: handling event failed: {}", call.id(), e);
        }
        if terminate {
            break;
        }
    }
    debug!("call fsm: event stream closed");
}

impl CallFsm {
    pub(crate) fn new() -> Self {
        Self {
            hangup_scheduled: false,
        }
    }

    /// Top level event dispatch.
    fn handle_event(&mut self, call: &Call, state: CallState, event: CallEvent) -> Result<()> {
        // Hangup and terminate are handled even mid-teardown.
        match event {
            CallEvent::Hangup(reason) => return self.handle_hangup(call, state, reason),
            CallEvent::Terminate => return self.handle_terminate(call),
            _ => {}
        }

        // If in the process of terminating, drop all other events.
        if let CallState::Stopping | CallState::Stopped = state {
            debug!("handle_event(): dropping event while terminating");
            return Ok(());
        }

        match event {
            CallEvent::Start => self.handle_start(call, state),
            CallEvent::LaunchOut(pos) => self.handle_launch_out(call, state, pos),
            CallEvent::RingTimeout(pos) => self.handle_ring_timeout(call, state, pos),
            CallEvent::Ringing { link, answer } => {
                self.handle_ringing(call, state, link, answer)
            }
            CallEvent::Answered { link, answer } => {
                self.handle_answered(call, state, link, answer)
            }
            CallEvent::Rejected { link } => self.handle_rejected(call, state, link),
            CallEvent::Observed(event) => self.handle_observed(call, *event),
            CallEvent::ObserverDied { role, link } => {
                self.handle_observer_died(call, role, link)
            }
            CallEvent::Hangup(_) | CallEvent::Terminate => Ok(()),
        }
    }

    fn unexpected_state(&self, call: &Call, state: CallState, event: &str) {
        warn!("call {}: unexpected {} in state {}", call.id(), event, state);
    }

    ////////////////////////////////////////////////////////////////////////
    // Start / launch
    ////////////////////////////////////////////////////////////////////////

    fn handle_start(&mut self, call: &Call, state: CallState) -> Result<()> {
        if state != CallState::Created {
            self.unexpected_state(call, state, "Start");
            return Ok(());
        }
        call.set_state(CallState::Resolving)?;

        let registrations = call.with_inner(|inner| std::mem::take(&mut inner.register))?;
        for registration in registrations {
            call.register(registration.link, registration.role, registration.payload)?;
        }

        let destinations = call
            .hub()
            .resolvers()
            .resolve(call.service(), call.callee())?;

        // Link the inbound session bidirectionally: the call observes
        // the session and the session observes the call, so either
        // side's death tears the other down.
        let session_id = call.with_inner(|inner| inner.session)?;
        if let Some(session_id) = session_id {
            if let Ok(session) = call.hub().session(&session_id) {
                call.register(session.link(), ObserverRole::Session, None)?;
                session.register(call.link(), ObserverRole::Session, None)?;
            }
        }

        if destinations.is_empty() {
            info!("call {}: no destination for {}", call.id(), call.callee());
            call.set_state(CallState::Inviting)?;
            // Give late registrants the grace window to see the event.
            self.hangup_scheduled = true;
            call.start_timer(STOP_GRACE, CallEvent::Hangup(Reason::NoDestination));
            return Ok(());
        }

        call.set_state(CallState::Inviting)?;
        let launches = call.with_inner(|inner| {
            let mut launches = Vec::new();
            for (pos, desc) in destinations.into_iter().enumerate() {
                let pos = pos as u32;
                launches.push((pos, desc.wait));
                inner.invites.push(Invite {
                    pos,
                    desc,
                    launched: false,
                    removed: false,
                    link: None,
                });
            }
            launches
        })?;
        for (pos, wait) in launches {
            match wait {
                Some(wait) if !wait.is_zero() => {
                    call.start_timer(wait, CallEvent::LaunchOut(pos));
                }
                _ => call.inject(CallEvent::LaunchOut(pos))?,
            }
        }
        Ok(())
    }

    fn handle_launch_out(&mut self, call: &Call, state: CallState, pos: u32) -> Result<()> {
        if state != CallState::Inviting {
            debug!("call {}: launch {} dropped in state {}", call.id(), pos, state);
            return Ok(());
        }
        let desc = call.with_inner(|inner| {
            inner
                .invites
                .iter()
                .find(|invite| invite.pos == pos && !invite.removed && !invite.launched)
                .map(|invite| invite.desc.clone())
        })?;
        let desc = match desc {
            Some(desc) => desc,
            None => return Ok(()),
        };

        match call.hub().dispatch_invite(call, &desc)? {
            InviteOutcome::Ok { link } => {
                call.with_inner(|inner| {
                    inner.launched_any = true;
                    if let Some(invite) =
                        inner.invites.iter_mut().find(|invite| invite.pos == pos)
                    {
                        invite.launched = true;
                        invite.link = Some(link.clone());
                    }
                })?;
                let ring = desc.ring.unwrap_or(DEF_RING).min(MAX_RING);
                call.start_timer(ring, CallEvent::RingTimeout(pos));
            }
            InviteOutcome::Retry { after } => {
                debug!("call {}: invite {} retry in {:?}", call.id(), pos, after);
                call.start_timer(after, CallEvent::LaunchOut(pos));
            }
            InviteOutcome::Remove => {
                call.with_inner(|inner| {
                    if let Some(invite) =
                        inner.invites.iter_mut().find(|invite| invite.pos == pos)
                    {
                        invite.removed = true;
                    }
                })?;
                self.check_all_done(call)?;
            }
        }
        Ok(())
    }

    fn handle_ring_timeout(&mut self, call: &Call, state: CallState, pos: u32) -> Result<()> {
        if state != CallState::Inviting {
            return Ok(());
        }
        let link = call.with_inner(|inner| {
            match inner
                .invites
                .iter_mut()
                .find(|invite| invite.pos == pos && invite.launched && !invite.removed)
            {
                Some(invite) => {
                    invite.removed = true;
                    invite.link.clone()
                }
                None => None,
            }
        })?;
        if let Some(link) = link {
            info!("call {}: invite {} rang out", call.id(), pos);
            call.hub().cancel_invite(call, &link);
            self.check_all_done(call)?;
        }
        Ok(())
    }

    ////////////////////////////////////////////////////////////////////////
    // Replies from destinations
    ////////////////////////////////////////////////////////////////////////

    fn handle_ringing(
        &mut self,
        call: &Call,
        state: CallState,
        link: Link,
        answer: Option<Sdp>,
    ) -> Result<()> {
        if state != CallState::Inviting {
            self.unexpected_state(call, state, "Ringing");
            return Ok(());
        }
        let known = call.with_inner(|inner| {
            inner
                .invites
                .iter()
                .any(|invite| invite.link.as_ref() == Some(&link) && !invite.removed)
        })?;
        if known {
            call.emit(EventKind::Ringing { answer });
        }
        Ok(())
    }

    fn handle_answered(
        &mut self,
        call: &Call,
        state: CallState,
        link: Link,
        answer: Sdp,
    ) -> Result<()> {
        if state != CallState::Inviting {
            // A hangup or an earlier answer arrived first in the
            // mailbox; that one wins.
            self.unexpected_state(call, state, "Answered");
            return Ok(());
        }
        let losers = call.with_inner(|inner| {
            let winner_known = inner
                .invites
                .iter()
                .any(|invite| invite.link.as_ref() == Some(&link) && !invite.removed);
            if !winner_known {
                return None;
            }
            inner.callee_link = Some(link.clone());
            let mut losers = Vec::new();
            for invite in inner.invites.iter_mut() {
                if invite.link.as_ref() == Some(&link) {
                    continue;
                }
                if invite.launched && !invite.removed {
                    if let Some(loser) = invite.link.clone() {
                        losers.push(loser);
                    }
                }
                invite.removed = true;
            }
            Some(losers)
        })?;
        let losers = match losers {
            Some(losers) => losers,
            None => {
                warn!("call {}: answer from unknown invite", call.id());
                return Ok(());
            }
        };

        call.set_state(CallState::Answered)?;
        // The winner becomes the `callee` observer; its death hangs
        // the call up with callee_stop.
        call.register(link.clone(), ObserverRole::Callee, None)?;
        for loser in losers {
            call.hub().cancel_invite(call, &loser);
        }
        call.emit(EventKind::Answer {
            sdp: Some(answer),
            link: Some(link),
        });
        Ok(())
    }

    fn handle_rejected(&mut self, call: &Call, state: CallState, link: Link) -> Result<()> {
        if state != CallState::Inviting {
            self.unexpected_state(call, state, "Rejected");
            return Ok(());
        }
        call.with_inner(|inner| {
            for invite in inner.invites.iter_mut() {
                if invite.link.as_ref() == Some(&link) {
                    invite.removed = true;
                }
            }
        })?;
        self.check_all_done(call)
    }

    /// Every invite gone without a winner: close the call out.
    fn check_all_done(&mut self, call: &Call) -> Result<()> {
        if self.hangup_scheduled {
            return Ok(());
        }
        let (all_done, launched_any) = call.with_inner(|inner| {
            (
                inner.invites.iter().all(|invite| invite.removed),
                inner.launched_any,
            )
        })?;
        if all_done {
            let reason = if launched_any {
                Reason::NoAnswer
            } else {
                Reason::NoDestination
            };
            self.hangup_scheduled = true;
            call.inject(CallEvent::Hangup(reason))?;
        }
        Ok(())
    }

    ////////////////////////////////////////////////////////////////////////
    // Observers
    ////////////////////////////////////////////////////////////////////////

    fn handle_observed(&mut self, call: &Call, event: Event) -> Result<()> {
        match event.kind {
            EventKind::Stop { .. } => {
                // The linked session went away.
                call.inject(CallEvent::Hangup(Reason::SessionStop))
            }
            EventKind::Hangup { reason } => call.inject(CallEvent::Hangup(reason)),
            _ => Ok(()),
        }
    }

    fn handle_observer_died(
        &mut self,
        call: &Call,
        role: ObserverRole,
        link: Link,
    ) -> Result<()> {
        debug!("call {}: observer died: {} ({})", call.id(), link, role);
        call.inject(CallEvent::Hangup(role.death_reason()))
    }

    ////////////////////////////////////////////////////////////////////////
    // Hangup / terminate
    ////////////////////////////////////////////////////////////////////////

    fn handle_hangup(&mut self, call: &Call, state: CallState, reason: Reason) -> Result<()> {
        if let CallState::Stopping | CallState::Stopped = state {
            return Ok(());
        }
        let already_sent = call.with_inner(|inner| {
            if inner.stop_sent {
                true
            } else {
                inner.stop_sent = true;
                false
            }
        })?;
        if already_sent {
            return Ok(());
        }
        info!("call {}: hangup: {}", call.id(), reason);

        // Cancel every in-flight invite that did not win.
        let outstanding = call.with_inner(|inner| {
            let winner = inner.callee_link.clone();
            let mut outstanding = Vec::new();
            for invite in inner.invites.iter_mut() {
                if invite.launched && !invite.removed && invite.link != winner {
                    if let Some(link) = invite.link.clone() {
                        outstanding.push(link);
                    }
                }
                invite.removed = true;
            }
            outstanding
        })?;
        for link in outstanding {
            call.hub().cancel_invite(call, &link);
        }

        call.emit(EventKind::Hangup { reason });
        call.set_state(CallState::Stopping)?;
        // Dependents learn of the death after the final event is out.
        call.end_lifetime();
        call.start_timer(STOP_GRACE, CallEvent::Terminate);
        Ok(())
    }

    fn handle_terminate(&mut self, call: &Call) -> Result<()> {
        call.set_state(CallState::Stopped)?;
        call.hub().remove_call(&call.id())?;
        call.hub().fabric().remove_subject(&call.subject())?;
        debug!("call {}: terminated", call.id());
        Ok(())
    }
}
