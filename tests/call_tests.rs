//
// Copyright 2019-2024 MediaHub Authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Call fan-out properties, driven through the SIP adapter against a
//! simulated wire peer.

mod common;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc::unbounded_channel;

use mediahub::common::{CallId, CallState, Reason, ServiceId};
use mediahub::core::bus::TopicFilter;
use mediahub::core::call::CallConfig;
use mediahub::core::event::{Event, EventKind, SubjectClass};
use mediahub::core::hub::Hub;
use mediahub::core::lifetime::{Lifetime, LifetimeGuard};
use mediahub::core::link::Link;
use mediahub::core::resolver::{DestDesc, Destination, FnResolver, ResolveFlow};
use mediahub::core::sdp::Sdp;
use mediahub::signaling::sip::SipAdapter;
use mediahub::signaling::{InviteOutcome, SignalingAdapter};

use common::*;

fn sip_hub(dests: Vec<DestDesc>) -> (Hub, Arc<SimSipEndpoint>, Arc<SipAdapter>) {
    let (hub, _fs, _kms) = sim_hub();
    let endpoint = SimSipEndpoint::new();
    let adapter = SipAdapter::new(hub.clone(), endpoint.clone());
    hub.register_adapter(adapter.clone()).unwrap();
    hub.add_resolver(Box::new(FnResolver(
        move |_service: &ServiceId, _callee: &str, acc: &mut Vec<DestDesc>| {
            acc.extend(dests.iter().cloned());
            ResolveFlow::Continue
        },
    )))
    .unwrap();
    (hub, endpoint, adapter)
}

fn subscribe_calls(hub: &Hub) -> (tokio::sync::mpsc::UnboundedReceiver<Event>, Lifetime) {
    let (lifetime, guard) = Lifetime::create();
    // Keep the subscription alive for the whole test.
    std::mem::forget(guard);
    let (tx, rx) = unbounded_channel();
    hub.bus()
        .subscribe(
            TopicFilter {
                service: service(),
                class: Some(SubjectClass::Call),
                subject: None,
            },
            tx,
            None,
            lifetime.clone(),
        )
        .unwrap();
    (rx, lifetime)
}

fn drain_kinds(rx: &mut tokio::sync::mpsc::UnboundedReceiver<Event>) -> Vec<String> {
    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        kinds.push(match &event.kind {
            EventKind::Hangup { reason } => format!("hangup:{}", reason),
            other => other.tag().to_string(),
        });
    }
    kinds
}

fn sip_dest(uri: &str) -> DestDesc {
    DestDesc::new(Destination::new("sip", uri))
}

#[test]
fn first_answer_wins_and_losers_are_cancelled() {
    test_init();
    let (hub, endpoint, adapter) = sip_hub(vec![
        sip_dest("sip:a@peer"),
        sip_dest("sip:b@peer"),
        sip_dest("sip:c@peer"),
    ]);
    let (mut rx, _lt) = subscribe_calls(&hub);

    let call = hub
        .start_call(service(), "multi".to_string(), CallConfig::default())
        .unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        endpoint.invites.lock().unwrap().len() == 3
    }));

    let requests: Vec<_> = endpoint
        .invites
        .lock()
        .unwrap()
        .iter()
        .map(|(request, _)| request.clone())
        .collect();

    adapter.on_out_ringing(&requests[0], None).unwrap();
    adapter
        .on_out_answer(
            &requests[1],
            mediahub::common::DialogHandle("dlg-b".to_string()),
            "v=0\r\nanswer-b",
        )
        .unwrap();

    assert!(wait_until(Duration::from_secs(2), || {
        call.state().unwrap() == CallState::Answered
    }));

    // The two losers get exactly one cancel each, promptly.
    assert!(wait_until(Duration::from_millis(500), || {
        endpoint.cancels.lock().unwrap().len() == 2
    }));
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(endpoint.cancels.lock().unwrap().len(), 2);

    let kinds = drain_kinds(&mut rx);
    assert_eq!(kinds.iter().filter(|k| *k == "ringing").count(), 1);
    assert_eq!(kinds.iter().filter(|k| *k == "answer").count(), 1);
}

#[test]
fn no_destination_hangs_up_within_the_window() {
    test_init();
    let (hub, _endpoint, _adapter) = sip_hub(Vec::new());
    let (mut rx, _lt) = subscribe_calls(&hub);

    let call = hub
        .start_call(service(), "nobody".to_string(), CallConfig::default())
        .unwrap();
    let call_id = call.id();

    assert!(wait_until(Duration::from_millis(300), || {
        call.state().unwrap() == CallState::Stopping
            || call.state().unwrap() == CallState::Stopped
    }));
    assert!(wait_until(Duration::from_millis(500), || {
        hub.call(&call_id).is_err()
    }));

    let kinds = drain_kinds(&mut rx);
    assert_eq!(
        kinds
            .iter()
            .filter(|k| *k == "hangup:no_destination")
            .count(),
        1
    );
}

#[test]
fn all_rejected_ends_with_no_answer() {
    test_init();
    let (hub, endpoint, adapter) =
        sip_hub(vec![sip_dest("sip:a@peer"), sip_dest("sip:b@peer")]);
    let (mut rx, _lt) = subscribe_calls(&hub);

    let _call = hub
        .start_call(service(), "busy".to_string(), CallConfig::default())
        .unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        endpoint.invites.lock().unwrap().len() == 2
    }));
    let requests: Vec<_> = endpoint
        .invites
        .lock()
        .unwrap()
        .iter()
        .map(|(request, _)| request.clone())
        .collect();

    adapter.on_out_reject(&requests[0]).unwrap();
    adapter.on_out_reject(&requests[1]).unwrap();

    assert!(wait_until(Duration::from_secs(1), || {
        drain_kinds(&mut rx)
            .iter()
            .any(|k| k == "hangup:no_answer")
    }));
}

#[test]
fn unanswered_invites_ring_out() {
    test_init();
    let mut a = sip_dest("sip:a@peer");
    a.ring = Some(Duration::from_millis(80));
    let mut b = sip_dest("sip:b@peer");
    b.ring = Some(Duration::from_millis(80));
    let (hub, endpoint, _adapter) = sip_hub(vec![a, b]);
    let (mut rx, _lt) = subscribe_calls(&hub);

    let _call = hub
        .start_call(service(), "slow".to_string(), CallConfig::default())
        .unwrap();

    assert!(wait_until(Duration::from_secs(2), || {
        drain_kinds(&mut rx)
            .iter()
            .any(|k| k == "hangup:no_answer")
    }));
    assert_eq!(endpoint.cancels.lock().unwrap().len(), 2);
}

#[test]
fn hangup_is_idempotent() {
    test_init();
    let (hub, endpoint, _adapter) = sip_hub(vec![sip_dest("sip:a@peer")]);
    let (mut rx, _lt) = subscribe_calls(&hub);

    let call = hub
        .start_call(service(), "target".to_string(), CallConfig::default())
        .unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        endpoint.invites.lock().unwrap().len() == 1
    }));

    call.hangup(Reason::UserHangup).unwrap();
    let _ = call.hangup(Reason::ApiHangup);
    assert!(wait_until(Duration::from_secs(1), || {
        call.state().unwrap() == CallState::Stopped
    }));

    let kinds = drain_kinds(&mut rx);
    assert_eq!(kinds.iter().filter(|k| k.starts_with("hangup")).count(), 1);
    // The in-flight invite was cancelled on the way down.
    assert_eq!(endpoint.cancels.lock().unwrap().len(), 1);
}

/// Adapter that asks for one retry before accepting the invite, and
/// lets the test kill the callee's liveness.
#[derive(Debug)]
struct FlakyAdapter {
    attempts: AtomicU64,
    links: Mutex<Vec<Link>>,
    guards: Mutex<Vec<LifetimeGuard>>,
    cancels: AtomicU64,
}

impl FlakyAdapter {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            attempts: AtomicU64::new(0),
            links: Mutex::new(Vec::new()),
            guards: Mutex::new(Vec::new()),
            cancels: AtomicU64::new(0),
        })
    }
}

impl SignalingAdapter for FlakyAdapter {
    fn scheme(&self) -> &'static str {
        "sip"
    }

    fn invite(
        &self,
        _call: &mediahub::core::call::Call,
        desc: &DestDesc,
    ) -> InviteOutcome {
        if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
            return InviteOutcome::Retry {
                after: Duration::from_millis(20),
            };
        }
        let (lifetime, guard) = Lifetime::create();
        let link = Link::SipOut {
            dest: desc.dest.target.clone(),
            lifetime,
        };
        self.links.lock().unwrap().push(link.clone());
        self.guards.lock().unwrap().push(guard);
        InviteOutcome::Ok { link }
    }

    fn cancel(&self, _call_id: CallId, _link: &Link) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
    }

    fn deliver_event(&self, _link: &Link, _event: &Event, _payload: Option<&Value>) {}
}

#[test]
fn retry_reschedules_the_launch() {
    test_init();
    let (hub, _fs, _kms) = sim_hub();
    let adapter = FlakyAdapter::new();
    hub.register_adapter(adapter.clone()).unwrap();
    hub.add_resolver(Box::new(FnResolver(
        |_service: &ServiceId, callee: &str, acc: &mut Vec<DestDesc>| {
            acc.push(DestDesc::new(Destination::new("sip", callee)));
            ResolveFlow::Continue
        },
    )))
    .unwrap();

    let call = hub
        .start_call(service(), "retry-me".to_string(), CallConfig::default())
        .unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        adapter.attempts.load(Ordering::SeqCst) == 2
    }));
    assert!(wait_until(Duration::from_secs(1), || {
        !adapter.links.lock().unwrap().is_empty()
    }));

    let link = adapter.links.lock().unwrap()[0].clone();
    call.answered(link, Sdp::new("v=0", mediahub::core::sdp::SdpKind::Rtp))
        .unwrap();
    assert!(wait_until(Duration::from_secs(1), || {
        call.state().unwrap() == CallState::Answered
    }));
}

#[test]
fn callee_death_hangs_up_the_call() {
    test_init();
    let (hub, _fs, _kms) = sim_hub();
    let adapter = FlakyAdapter::new();
    // Skip the retry round.
    adapter.attempts.store(1, Ordering::SeqCst);
    hub.register_adapter(adapter.clone()).unwrap();
    hub.add_resolver(Box::new(FnResolver(
        |_service: &ServiceId, callee: &str, acc: &mut Vec<DestDesc>| {
            acc.push(DestDesc::new(Destination::new("sip", callee)));
            ResolveFlow::Continue
        },
    )))
    .unwrap();
    let (mut rx, _lt) = subscribe_calls(&hub);

    let call = hub
        .start_call(service(), "mortal".to_string(), CallConfig::default())
        .unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        !adapter.links.lock().unwrap().is_empty()
    }));
    let link = adapter.links.lock().unwrap()[0].clone();
    call.answered(link, Sdp::new("v=0", mediahub::core::sdp::SdpKind::Rtp))
        .unwrap();
    assert!(wait_until(Duration::from_secs(1), || {
        call.state().unwrap() == CallState::Answered
    }));

    // The winner's liveness ends.
    adapter.guards.lock().unwrap().clear();

    assert!(wait_until(Duration::from_secs(2), || {
        drain_kinds(&mut rx)
            .iter()
            .any(|k| k == "hangup:callee_stop")
    }));
}
