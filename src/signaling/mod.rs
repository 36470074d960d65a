//
// Copyright 2019-2024 MediaHub Authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Signaling adapter contract.
//!
//! Adapters translate wire messages into core operations and surface
//! core events back out. The hub routes outbound invites by the
//! destination scheme and event delivery by the link variant.

pub mod api;
pub mod sip;
pub mod verto;

use std::fmt;
use std::time::Duration;

use serde_json::Value;

use crate::common::{CallId, Reason, Result, ServiceId, SessionType, TypeExt};
use crate::core::call::{Call, CallConfig};
use crate::core::event::Event;
use crate::core::hub::Hub;
use crate::core::link::Link;
use crate::core::resolver::DestDesc;
use crate::core::sdp::Sdp;
use crate::core::session::{Session, SessionConfig};

/// Adapter-side result of launching one invite.
pub enum InviteOutcome {
    Ok { link: Link },
    Retry { after: Duration },
    Remove,
}

impl fmt::Debug for InviteOutcome {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Ok { link } => write!(f, "ok({})", link),
            Self::Retry { after } => write!(f, "retry({:?})", after),
            Self::Remove => write!(f, "remove"),
        }
    }
}

pub trait SignalingAdapter: Send + Sync + fmt::Debug {
    /// Destination scheme this adapter serves ("sip", "verto", "api").
    fn scheme(&self) -> &'static str;

    /// Launch an out-leg invite toward `desc`.
    fn invite(&self, call: &Call, desc: &DestDesc) -> InviteOutcome;

    /// Cancel a previously launched invite.
    fn cancel(&self, call_id: CallId, link: &Link);

    /// Surface a core event on the wire leg behind `link`. `payload`
    /// is the opaque value stored with the observer registration.
    fn deliver_event(&self, link: &Link, event: &Event, payload: Option<&Value>);
}

/// How an inbound invite was routed into the core.
pub enum InviteRouting {
    /// A session answers the invite directly (backend media op).
    Session(Session),
    /// The invite fans out through a call linked to the inbound
    /// session.
    Call { session: Session, call: Call },
    Reject(Reason),
}

/// Maps an inbound destination string to core operations. Pluggable;
/// the default applies the conventional prefix routing.
pub trait InviteHook: Send + Sync + fmt::Debug {
    fn route(
        &self,
        hub: &Hub,
        service: &ServiceId,
        dest: &str,
        offer: Sdp,
        link: Link,
    ) -> Result<InviteRouting>;
}

/// Conventional destination routing:
///
/// - `e*` echo, `p*` park, `mcu*` joins the room named by the dest
/// - `f<session-id>` bridges to the named existing leg
/// - anything else fans out through the resolver chain as a p2p call
#[derive(Debug)]
pub struct DefaultInviteHook;

impl DefaultInviteHook {
    fn start_media_session(
        hub: &Hub,
        service: &ServiceId,
        session_type: SessionType,
        type_ext: TypeExt,
        offer: Sdp,
        link: Link,
        peer: Option<crate::common::SessionId>,
    ) -> Result<InviteRouting> {
        let mut config = SessionConfig::new(session_type)
            .with_offer(offer)
            .with_type_ext(type_ext);
        config.peer = peer;
        config.register.push(crate::core::session::Registration {
            link,
            role: crate::common::ObserverRole::Registered,
            payload: None,
        });
        let session = hub.start_session(service.clone(), config)?;
        Ok(InviteRouting::Session(session))
    }
}

impl InviteHook for DefaultInviteHook {
    fn route(
        &self,
        hub: &Hub,
        service: &ServiceId,
        dest: &str,
        offer: Sdp,
        link: Link,
    ) -> Result<InviteRouting> {
        // The user part selects the media operation; a domain suffix
        // is ignored here.
        let user = dest.split('@').next().unwrap_or(dest);

        if user == "e" || user.starts_with("echo") {
            return Self::start_media_session(
                hub,
                service,
                SessionType::Echo,
                TypeExt::default(),
                offer,
                link,
                None,
            );
        }
        if user == "p" || user.starts_with("park") {
            return Self::start_media_session(
                hub,
                service,
                SessionType::Park,
                TypeExt::default(),
                offer,
                link,
                None,
            );
        }
        if user.starts_with("mcu") {
            let type_ext = TypeExt {
                room_id: Some(user.to_string()),
                ..Default::default()
            };
            return Self::start_media_session(
                hub,
                service,
                SessionType::Mcu,
                type_ext,
                offer,
                link,
                None,
            );
        }
        if let Some(rest) = user.strip_prefix('f') {
            // `f<session-id>` joins an existing leg; a bare f-dest
            // parks a fresh FS leg for a later bridge.
            if let Ok(peer) = rest.parse::<crate::common::SessionId>() {
                if hub.session(&peer).is_ok() {
                    return Self::start_media_session(
                        hub,
                        service,
                        SessionType::Call,
                        TypeExt::default(),
                        offer,
                        link,
                        Some(peer),
                    );
                }
                return Ok(InviteRouting::Reject(Reason::SessionStop));
            }
            return Self::start_media_session(
                hub,
                service,
                SessionType::Park,
                TypeExt::default(),
                offer,
                link,
                None,
            );
        }

        // Fan out to the callee's registered contacts.
        let mut session_config = SessionConfig::new(SessionType::P2p).with_offer(offer.clone());
        session_config
            .register
            .push(crate::core::session::Registration {
                link: link.clone(),
                role: crate::common::ObserverRole::Registered,
                payload: None,
            });
        let session = hub.start_session(service.clone(), session_config)?;

        let call_config = CallConfig {
            offer: Some(offer),
            meta: Value::Null,
            session: Some(session.id()),
            register: vec![crate::core::session::Registration {
                link,
                role: crate::common::ObserverRole::Registered,
                payload: None,
            }],
        };
        let call = hub.start_call(service.clone(), dest.to_string(), call_config)?;
        Ok(InviteRouting::Call { session, call })
    }
}
