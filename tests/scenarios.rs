//
// Copyright 2019-2024 MediaHub Authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! End-to-end scenarios across the adapters, the core and the
//! simulated media engines.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use mediahub::common::{
    CallId, DialogHandle, Reason, RequestHandle, SessionId, SessionState, SessionType,
};
use mediahub::core::resolver::{DestDesc, Destination, FnResolver, ResolveFlow};
use mediahub::core::sdp::SdpKind;
use mediahub::signaling::api::ApiAdapter;
use mediahub::signaling::sip::SipAdapter;
use mediahub::signaling::verto::{AcceptAllAuth, VertoAdapter};
use mediahub::common::ServiceId;

use common::*;

/// A SIP INVITE to `mcu1@nkmedia` with an RTP offer joins the MCU
/// room and answers with engine SDP; BYE stops the leg.
#[test]
fn sip_invite_to_mcu() {
    test_init();
    let (hub, fs, _kms) = sim_hub();
    let endpoint = SimSipEndpoint::new();
    let adapter = SipAdapter::new(hub.clone(), endpoint.clone());
    hub.register_adapter(adapter.clone()).unwrap();

    let request = RequestHandle("req-1".to_string());
    let dialog = DialogHandle("dlg-1".to_string());
    let session_id = adapter
        .on_invite(
            &service(),
            request.clone(),
            dialog.clone(),
            "mcu1@nkmedia",
            &rtp_offer().body,
        )
        .unwrap();
    let session = hub.session(&session_id).unwrap();

    assert!(wait_until(Duration::from_secs(2), || {
        session.state().unwrap() == SessionState::Ready
    }));
    assert_eq!(session.session_type().unwrap(), SessionType::Mcu);
    let ext = session.type_ext().unwrap();
    assert_eq!(ext.room_id.as_deref(), Some("mcu1"));
    assert_eq!(ext.room_type.as_deref(), Some("video-mcu-stereo"));

    // 200 with the engine answer went out on the transaction.
    assert!(wait_until(Duration::from_secs(1), || {
        endpoint.response_codes(&request).contains(&200)
    }));
    let answer = endpoint.answer_sdp(&request).unwrap();
    assert_eq!(answer.kind, SdpKind::Rtp);
    assert!(answer.body.contains("fs-answer"));
    assert!(fs
        .ops()
        .iter()
        .any(|op| op.contains("conference:mcu1@video-mcu-stereo")));

    // The leg joined the room registry.
    let info = hub.rooms().info(&service(), "mcu1").unwrap();
    assert_eq!(info["members"].as_array().unwrap().len(), 1);

    adapter.on_bye(&dialog).unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        session.stop_reason().unwrap() == Some(Reason::SipBye)
    }));
}

/// A Verto invite with dest "e" becomes an echo session on the
/// WebRTC engine; verto.answer carries the SDP; bye stops it.
#[test]
fn verto_invite_to_echo() {
    test_init();
    let (hub, kms) = kms_hub();
    let adapter = VertoAdapter::new(hub.clone(), Arc::new(AcceptAllAuth));
    hub.register_adapter(adapter.clone()).unwrap();

    let socket = SimVertoSocket::new();
    let conn = adapter.connect(service(), socket.clone()).unwrap();
    adapter
        .handle_request(&conn, "login", &json!({ "login": "alice", "passwd": "secret" }))
        .unwrap();
    adapter
        .handle_request(
            &conn,
            "verto.invite",
            &json!({
                "dialogParams": { "destination_number": "e", "callID": "c-1" },
                "sdp": webrtc_offer().body,
            }),
        )
        .unwrap();

    let session = wait_for_single_session(&hub);
    assert_eq!(session.session_type().unwrap(), SessionType::Echo);
    assert!(wait_until(Duration::from_secs(2), || {
        !socket.frames_for("verto.answer").is_empty()
    }));
    let frames = socket.frames_for("verto.answer");
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["params"]["callID"], "c-1");
    assert!(frames[0]["params"]["sdp"]
        .as_str()
        .unwrap()
        .contains("kms-answer"));
    // Echo loops the endpoint back onto itself.
    assert!(kms.ops().iter().any(|op| {
        op.starts_with("connect:") && {
            let parts: Vec<_> = op.split(':').collect();
            parts[1] == parts[2]
        }
    }));

    adapter
        .handle_request(
            &conn,
            "verto.bye",
            &json!({ "dialogParams": { "callID": "c-1" } }),
        )
        .unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        session.stop_reason().unwrap() == Some(Reason::VertoBye)
    }));
}

/// API-driven call fan-out; the second destination answers, the
/// other two get cancelled, the caller sees exactly one answer event.
#[test]
fn api_call_fan_out() {
    test_init();
    let (hub, _fs, _kms) = sim_hub();
    let adapter = ApiAdapter::new(hub.clone());
    hub.register_adapter(adapter.clone()).unwrap();

    let caller_socket = SimApiSocket::new();
    let caller = adapter.connect(service(), caller_socket.clone()).unwrap();
    let callee_sockets: Vec<_> = (0..3).map(|_| SimApiSocket::new()).collect();
    let callees: Vec<_> = callee_sockets
        .iter()
        .map(|socket| adapter.connect(service(), socket.clone()).unwrap())
        .collect();

    let targets: Vec<String> = callees.iter().map(|c| c.to_string()).collect();
    hub.add_resolver(Box::new(FnResolver(
        move |_service: &ServiceId, callee: &str, acc: &mut Vec<DestDesc>| {
            if callee == "alice" {
                for (i, target) in targets.iter().enumerate() {
                    let mut desc = DestDesc::new(Destination::new("api", target.clone()));
                    desc.ring = Some(Duration::from_secs(5 * (i as u64 + 1)));
                    acc.push(desc);
                }
            }
            ResolveFlow::Continue
        },
    )))
    .unwrap();

    let response = adapter.handle_frame(
        &caller,
        &json!({
            "class": "media", "subclass": "call", "cmd": "start",
            "data": { "callee": "alice", "offer": { "sdp": webrtc_offer().body } },
            "tid": 1,
        }),
    );
    assert_eq!(response["result"], "ok");

    // Every callee got its invite.
    assert!(wait_until(Duration::from_secs(2), || {
        callee_sockets
            .iter()
            .all(|socket| !socket.commands_of("invite").is_empty())
    }));

    // The second destination answers.
    let invite = &callee_sockets[1].commands_of("invite")[0];
    let invite_id = invite["data"]["invite_id"].as_str().unwrap().to_string();
    let response = adapter.handle_frame(
        &callees[1],
        &json!({
            "class": "media", "subclass": "call", "cmd": "answered",
            "data": { "invite_id": invite_id, "answer": { "sdp": webrtc_answer().body } },
            "tid": 2,
        }),
    );
    assert_eq!(response["result"], "ok");

    // The two losers get cancels.
    assert!(wait_until(Duration::from_secs(1), || {
        callee_sockets[0].commands_of("cancel").len() == 1
            && callee_sockets[2].commands_of("cancel").len() == 1
    }));
    assert!(callee_sockets[1].commands_of("cancel").is_empty());

    // The caller observes exactly one answer event frame.
    assert!(wait_until(Duration::from_secs(1), || {
        caller_socket.events_of("answer").len() == 1
    }));
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(caller_socket.events_of("answer").len(), 1);
}

/// No destination resolves; hangup(no_destination) lands within
/// the window and the call leaves the registry.
#[test]
fn api_call_no_destination() {
    test_init();
    let (hub, _fs, _kms) = sim_hub();
    let adapter = ApiAdapter::new(hub.clone());
    hub.register_adapter(adapter.clone()).unwrap();

    let socket = SimApiSocket::new();
    let client = adapter.connect(service(), socket.clone()).unwrap();
    let response = adapter.handle_frame(
        &client,
        &json!({
            "class": "media", "subclass": "call", "cmd": "start",
            "data": { "callee": "unknown" },
            "tid": 7,
        }),
    );
    assert_eq!(response["result"], "ok");
    let call_id: CallId = response["data"]["call_id"]
        .as_str()
        .unwrap()
        .parse()
        .unwrap();

    assert!(wait_until(Duration::from_millis(400), || {
        socket.events_of("hangup").len() == 1
    }));
    let event = &socket.events_of("hangup")[0];
    assert_eq!(event["data"]["body"]["reason"], "no_destination");
    assert!(wait_until(Duration::from_millis(500), || {
        hub.call(&call_id).is_err()
    }));
}

/// The API client dies; its session stops with registered_stop and
/// the final stop event still reaches the topic subscription.
#[test]
fn api_client_death_stops_session() {
    test_init();
    let (hub, _kms) = kms_hub();
    let adapter = ApiAdapter::new(hub.clone());
    hub.register_adapter(adapter.clone()).unwrap();

    let socket = SimApiSocket::new();
    let client = adapter.connect(service(), socket.clone()).unwrap();
    let response = adapter.handle_frame(
        &client,
        &json!({
            "class": "media", "subclass": "session", "cmd": "start",
            "data": { "type": "echo", "offer": { "sdp": webrtc_offer().body } },
            "tid": 3,
        }),
    );
    assert_eq!(response["result"], "ok");
    let session_id: SessionId = response["data"]["session_id"]
        .as_str()
        .unwrap()
        .parse()
        .unwrap();
    let session = hub.session(&session_id).unwrap();

    adapter.disconnect(&client).unwrap();

    assert!(wait_until(Duration::from_secs(2), || {
        session.stop_reason().unwrap() == Some(Reason::RegisteredStop)
    }));
    // The final stop event made it out before the subscription
    // vanished.
    assert!(wait_until(Duration::from_secs(1), || {
        socket
            .events_of("stop")
            .iter()
            .any(|event| event["data"]["body"]["reason"] == "registered_stop")
    }));
}

/// Two Verto legs on FS; the second bridges onto the first, both
/// report the bridge with mutual peer ids, and the survivor re-parks
/// on BYE.
#[test]
fn fs_bridge_pair() {
    test_init();
    let (hub, fs, _kms) = sim_hub();
    let adapter = VertoAdapter::new(hub.clone(), Arc::new(AcceptAllAuth));
    hub.register_adapter(adapter.clone()).unwrap();

    let socket1 = SimVertoSocket::new();
    let conn1 = adapter.connect(service(), socket1.clone()).unwrap();
    adapter
        .handle_request(&conn1, "login", &json!({ "login": "u1", "passwd": "p" }))
        .unwrap();
    adapter
        .handle_request(
            &conn1,
            "verto.invite",
            &json!({
                "dialogParams": { "destination_number": "fA", "callID": "vc-1" },
                "sdp": webrtc_offer().body,
            }),
        )
        .unwrap();

    let session1 = wait_for_single_session(&hub);
    assert_eq!(session1.session_type().unwrap(), SessionType::Park);
    assert!(wait_until(Duration::from_secs(2), || {
        !socket1.frames_for("verto.answer").is_empty()
    }));

    let socket2 = SimVertoSocket::new();
    let conn2 = adapter.connect(service(), socket2.clone()).unwrap();
    adapter
        .handle_request(&conn2, "login", &json!({ "login": "u2", "passwd": "p" }))
        .unwrap();
    adapter
        .handle_request(
            &conn2,
            "verto.invite",
            &json!({
                "dialogParams": {
                    "destination_number": format!("f{}", session1.id()),
                    "callID": "vc-2",
                },
                "sdp": webrtc_offer().body,
            }),
        )
        .unwrap();

    let session2 = wait_until_session_besides(&hub, session1.id());

    // Both legs report the bridge with mutual peer ids.
    assert!(wait_until(Duration::from_secs(2), || {
        session1.session_type().unwrap() == SessionType::Bridge
            && session2.session_type().unwrap() == SessionType::Bridge
    }));
    assert_eq!(session1.type_ext().unwrap().peer_id, Some(session2.id()));
    assert_eq!(session2.type_ext().unwrap().peer_id, Some(session1.id()));
    assert!(session1.park_after_bridge().unwrap());
    assert!(session2.park_after_bridge().unwrap());
    assert!(fs.ops().iter().any(|op| op.starts_with("bridge:")));
    assert!(fs
        .ops()
        .iter()
        .filter(|op| op.contains("park_after_bridge=true"))
        .count()
        >= 2);

    // One leg hangs up; the survivor returns to park.
    adapter
        .handle_request(
            &conn1,
            "verto.bye",
            &json!({ "dialogParams": { "callID": "vc-1" } }),
        )
        .unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        session1.stop_reason().unwrap() == Some(Reason::VertoBye)
    }));
    assert!(wait_until(Duration::from_secs(2), || {
        session2.session_type().unwrap() == SessionType::Park
    }));
    assert!(session2.stop_reason().unwrap().is_none());
}

/// Registrar policy: forced-domain rewrite on REGISTER, and the
/// unregistered-INVITE gate.
#[test]
fn sip_register_realm_policy() {
    test_init();
    let mut config = mediahub::config::Config::default();
    config.sip_domain = Some("hub.example".to_string());
    config.sip_registrar_force_domain = true;
    config.sip_invite_not_registered = false;
    let hub = mediahub::core::hub::Hub::new(config).unwrap();
    let endpoint = SimSipEndpoint::new();
    let adapter = SipAdapter::new(hub.clone(), endpoint);

    let ok = adapter
        .on_register(
            &service(),
            "alice",
            "elsewhere.example",
            "sip:alice@10.0.0.5",
            None,
        )
        .unwrap();
    assert_eq!(ok.domain, "hub.example");
    assert!(hub.directory().is_registered(&service(), "alice").unwrap());

    // INVITE to a user nobody registered is refused outright.
    let err = adapter
        .on_invite(
            &service(),
            RequestHandle("req-x".to_string()),
            DialogHandle("dlg-x".to_string()),
            "nobody@hub.example",
            &rtp_offer().body,
        )
        .unwrap_err();
    assert!(err.to_string().contains("not found"));

    // With the registrar disabled, REGISTER is rejected.
    let hub2 = mediahub::core::hub::Hub::new(mediahub::config::Config {
        sip_registrar: false,
        ..Default::default()
    })
    .unwrap();
    let adapter2 = SipAdapter::new(hub2, SimSipEndpoint::new());
    assert!(adapter2
        .on_register(&service(), "bob", "any", "sip:bob@10.0.0.6", None)
        .is_err());
}

fn wait_for_single_session(hub: &mediahub::core::hub::Hub) -> mediahub::core::session::Session {
    assert!(wait_until(Duration::from_secs(2), || {
        hub.sessions(&service()).map(|s| s.len()).unwrap_or(0) == 1
    }));
    hub.sessions(&service()).unwrap().remove(0)
}

fn wait_until_session_besides(
    hub: &mediahub::core::hub::Hub,
    existing: SessionId,
) -> mediahub::core::session::Session {
    assert!(wait_until(Duration::from_secs(2), || {
        hub.sessions(&service())
            .map(|s| s.iter().any(|session| session.id() != existing))
            .unwrap_or(false)
    }));
    hub.sessions(&service())
        .unwrap()
        .into_iter()
        .find(|session| session.id() != existing)
        .unwrap()
}
