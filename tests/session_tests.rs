//
// Copyright 2019-2024 MediaHub Authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Session lifecycle properties.

mod common;

use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc::unbounded_channel;

use mediahub::backend::BackendKind;
use mediahub::common::{Reason, SessionState, SessionType, UpdateKind};
use mediahub::core::bus::TopicFilter;
use mediahub::core::event::{EventKind, SubjectClass};
use mediahub::core::lifetime::Lifetime;
use mediahub::core::link::Link;
use mediahub::core::sdp::{Candidate, TrickleCandidate};
use mediahub::core::session::SessionConfig;
use mediahub::error::HubError;

use common::*;

#[test]
fn duplicate_answer_is_rejected_without_stopping() {
    test_init();
    let (hub, _fs, _kms) = sim_hub();

    let session = hub
        .start_session(
            service(),
            SessionConfig::new(SessionType::P2p).with_offer(webrtc_offer()),
        )
        .unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        session.state().unwrap() == SessionState::WaitAnswer
    }));

    session.set_answer(webrtc_answer()).unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        session.answer().unwrap().is_some()
    }));

    let err = session.set_answer(webrtc_answer()).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<HubError>(),
        Some(HubError::AlreadyAnswered)
    ));

    // The duplicate did not stop the session.
    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(session.state().unwrap(), SessionState::Ready);
    assert!(session.stop_reason().unwrap().is_none());
}

#[test]
fn at_most_one_answer_event_per_session() {
    test_init();
    let (hub, _fs, _kms) = sim_hub();

    let (lifetime, _guard) = Lifetime::create();
    let (tx, mut rx) = unbounded_channel();
    hub.bus()
        .subscribe(
            TopicFilter {
                service: service(),
                class: Some(SubjectClass::Session),
                subject: None,
            },
            tx,
            None,
            lifetime,
        )
        .unwrap();

    let session = hub
        .start_session(
            service(),
            SessionConfig::new(SessionType::P2p).with_offer(webrtc_offer()),
        )
        .unwrap();
    session.set_answer(webrtc_answer()).unwrap();
    let _ = session.set_answer(webrtc_answer());
    assert!(wait_until(Duration::from_secs(2), || {
        session.answer().unwrap().is_some()
    }));
    session.stop(Reason::UserHangup).unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        session.state().unwrap() == SessionState::Stopped
    }));

    let mut answers = 0;
    while let Ok(event) = rx.try_recv() {
        if let EventKind::Answer { .. } = event.kind {
            answers += 1;
        }
    }
    assert_eq!(answers, 1);
}

#[test]
fn stop_event_is_emitted_exactly_once() {
    test_init();
    let (hub, _fs, _kms) = sim_hub();

    let (lifetime, _guard) = Lifetime::create();
    let (tx, mut rx) = unbounded_channel();
    hub.bus()
        .subscribe(
            TopicFilter {
                service: service(),
                class: Some(SubjectClass::Session),
                subject: None,
            },
            tx,
            None,
            lifetime,
        )
        .unwrap();

    let session = hub
        .start_session(
            service(),
            SessionConfig::new(SessionType::P2p).with_offer(webrtc_offer()),
        )
        .unwrap();
    session.stop(Reason::UserHangup).unwrap();
    session.stop(Reason::ApiStop).unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        session.state().unwrap() == SessionState::Stopped
    }));

    let mut stops = 0;
    while let Ok(event) = rx.try_recv() {
        if let EventKind::Stop { reason } = &event.kind {
            assert_eq!(*reason, Reason::UserHangup);
            stops += 1;
        }
    }
    assert_eq!(stops, 1);
}

#[test]
fn get_answer_reports_not_yet_on_timeout() {
    test_init();
    let (hub, _fs, _kms) = sim_hub();

    let session = hub
        .start_session(
            service(),
            SessionConfig::new(SessionType::P2p).with_offer(webrtc_offer()),
        )
        .unwrap();
    let err = session.get_answer(Duration::from_millis(100)).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<HubError>(),
        Some(HubError::Timeout(_))
    ));
    session.stop(Reason::UserHangup).unwrap();
}

#[test]
fn observer_death_stops_session_with_registered_stop() {
    test_init();
    let (hub, _fs, _kms) = sim_hub();

    let session = hub
        .start_session(
            service(),
            SessionConfig::new(SessionType::P2p).with_offer(webrtc_offer()),
        )
        .unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        session.state().unwrap() == SessionState::WaitAnswer
    }));

    let (lifetime, guard) = Lifetime::create();
    session
        .register(
            Link::Api {
                client: mediahub::common::ApiClientId::random(),
                lifetime,
            },
            mediahub::common::ObserverRole::Registered,
            None,
        )
        .unwrap();

    drop(guard);
    assert!(wait_until(Duration::from_secs(2), || {
        session.stop_reason().unwrap() == Some(Reason::RegisteredStop)
    }));
}

#[test]
fn session_without_offer_times_out_waiting() {
    test_init();
    let (hub, _fs, _kms) = sim_hub();

    let mut config = SessionConfig::new(SessionType::P2p);
    config.wait_timeout = Duration::from_millis(100);
    let session = hub.start_session(service(), config).unwrap();

    assert!(wait_until(Duration::from_secs(2), || {
        session.stop_reason().unwrap() == Some(Reason::Timeout)
    }));
}

#[test]
fn trickle_offer_is_held_and_aggregated_for_fs() {
    test_init();
    let (hub, fs, _kms) = sim_hub();

    let offer = webrtc_offer().with_trickle();
    let session = hub
        .start_session(
            service(),
            SessionConfig::new(SessionType::Park)
                .with_offer(offer)
                .with_backend(BackendKind::Fs),
        )
        .unwrap();

    let c1 = Candidate {
        mid: None,
        mline_index: 0,
        body: "candidate:1 1 UDP 1 10.0.0.1 4000 typ host".to_string(),
    };
    let c2 = Candidate {
        mid: None,
        mline_index: 0,
        body: "candidate:2 1 UDP 2 10.0.0.2 4002 typ host".to_string(),
    };
    session
        .candidate(TrickleCandidate::Candidate(c1))
        .unwrap();
    session
        .candidate(TrickleCandidate::Candidate(c2))
        .unwrap();
    session.candidate(TrickleCandidate::End).unwrap();

    assert!(wait_until(Duration::from_secs(2), || {
        session.state().unwrap() == SessionState::Ready
    }));

    let bodies = fs.start_bodies();
    assert_eq!(bodies.len(), 1);
    let body = &bodies[0];
    let first = body.find("candidate:1").expect("first candidate folded in");
    let second = body.find("candidate:2").expect("second candidate folded in");
    assert!(first < second);
    assert!(body.contains("a=end-of-candidates"));
}

#[test]
fn kms_candidates_forward_in_arrival_order() {
    test_init();
    let (hub, kms) = kms_hub();

    let session = hub
        .start_session(
            service(),
            SessionConfig::new(SessionType::Echo).with_offer(webrtc_offer()),
        )
        .unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        session.state().unwrap() == SessionState::Ready
    }));

    for n in 1..=3 {
        session
            .candidate(TrickleCandidate::Candidate(Candidate {
                mid: None,
                mline_index: 0,
                body: format!("candidate:{}", n),
            }))
            .unwrap();
    }
    session.candidate(TrickleCandidate::End).unwrap();
    // End-of-candidates is idempotent.
    session.candidate(TrickleCandidate::End).unwrap();

    assert!(wait_until(Duration::from_secs(2), || {
        kms.candidates().len() == 3
    }));
    let candidates = kms.candidates();
    for (i, entry) in candidates.iter().enumerate() {
        assert!(entry.ends_with(&format!("candidate:{}", i + 1)));
    }
}

#[test]
fn mcu_layout_update_is_applied_online() {
    test_init();
    let (hub, fs, _kms) = sim_hub();

    let session = hub
        .start_session(
            service(),
            SessionConfig::new(SessionType::Mcu)
                .with_offer(rtp_offer())
                .with_type_ext(mediahub::common::TypeExt {
                    room_id: Some("room-7".to_string()),
                    ..Default::default()
                }),
        )
        .unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        session.state().unwrap() == SessionState::Ready
    }));

    session
        .update_blocking(
            UpdateKind::McuLayout,
            json!({ "mcu_layout": "2x2" }),
            Duration::from_secs(2),
        )
        .unwrap();
    assert_eq!(
        session.type_ext().unwrap().mcu_layout.as_deref(),
        Some("2x2")
    );
    assert!(fs
        .ops()
        .iter()
        .any(|op| op == "conf_layout:room-7:2x2"));
}
