//
// Copyright 2019-2024 MediaHub Authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Lifecycle events emitted by sessions, calls and rooms.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};

use crate::common::{CallId, Reason, ServiceId, SessionId, SessionType, TypeExt};
use crate::core::link::Link;
use crate::core::sdp::{Sdp, TrickleCandidate};

/// What kind of entity emitted an event.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum SubjectClass {
    Session,
    Call,
    Room,
}

impl fmt::Display for SubjectClass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let label = match self {
            Self::Session => "session",
            Self::Call => "call",
            Self::Room => "room",
        };
        write!(f, "{}", label)
    }
}

/// Identifies an event's subject across the three entity classes.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum SubjectId {
    Session(SessionId),
    Call(CallId),
    Room(String),
}

impl SubjectId {
    pub fn class(&self) -> SubjectClass {
        match self {
            Self::Session(_) => SubjectClass::Session,
            Self::Call(_) => SubjectClass::Call,
            Self::Room(_) => SubjectClass::Room,
        }
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Session(id) => write!(f, "{}", id),
            Self::Call(id) => write!(f, "{}", id),
            Self::Room(id) => write!(f, "{}", id),
        }
    }
}

/// The event payloads the core emits.
#[derive(Clone, Debug)]
pub enum EventKind {
    /// A destination started ringing; may carry an early answer body.
    Ringing { answer: Option<Sdp> },
    /// The answer is in place. For calls, `link` names the winner.
    Answer { sdp: Option<Sdp>, link: Option<Link> },
    /// Call-level teardown.
    Hangup { reason: Reason },
    /// Session-level teardown; emitted exactly once.
    Stop { reason: Reason },
    /// The session changed media operation.
    UpdatedType {
        session_type: SessionType,
        ext: TypeExt,
    },
    /// Trickle candidate relayed toward the signaling peer.
    Candidate { candidate: TrickleCandidate },
    /// Room membership and lifecycle notifications.
    Room { tag: String, detail: Value },
}

impl EventKind {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Ringing { .. } => "ringing",
            Self::Answer { .. } => "answer",
            Self::Hangup { .. } => "hangup",
            Self::Stop { .. } => "stop",
            Self::UpdatedType { .. } => "updated_type",
            Self::Candidate { .. } => "candidate",
            Self::Room { .. } => "room",
        }
    }

    /// Wire-facing JSON rendition of the payload.
    pub fn payload(&self) -> Value {
        match self {
            Self::Ringing { answer } => match answer {
                Some(sdp) => json!({ "answer": sdp }),
                None => json!({}),
            },
            Self::Answer { sdp, link } => {
                let mut payload = serde_json::Map::new();
                if let Some(sdp) = sdp {
                    payload.insert("answer".to_string(), json!(sdp));
                }
                if let Some(link) = link {
                    payload.insert("link".to_string(), json!(link.to_string()));
                }
                Value::Object(payload)
            }
            Self::Hangup { reason } | Self::Stop { reason } => {
                json!({ "reason": reason.as_atom() })
            }
            Self::UpdatedType { session_type, ext } => {
                json!({ "type": session_type, "type_ext": ext })
            }
            Self::Candidate { candidate } => json!({ "candidate": candidate }),
            Self::Room { tag, detail } => json!({ "tag": tag, "detail": detail }),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Ringing { answer } => {
                write!(f, "ringing(early_answer: {})", answer.is_some())
            }
            Self::Answer { link, .. } => match link {
                Some(link) => write!(f, "answer({})", link),
                None => write!(f, "answer"),
            },
            Self::Hangup { reason } => write!(f, "hangup({})", reason),
            Self::Stop { reason } => write!(f, "stop({})", reason),
            Self::UpdatedType { session_type, .. } => {
                write!(f, "updated_type({})", session_type)
            }
            Self::Candidate { candidate } => write!(f, "{}", candidate),
            Self::Room { tag, .. } => write!(f, "room({})", tag),
        }
    }
}

/// One lifecycle event as delivered to observers and topic
/// subscribers.
#[derive(Clone, Debug)]
pub struct Event {
    pub subject: SubjectId,
    pub service: ServiceId,
    pub kind: EventKind,
    /// Milliseconds since the unix epoch.
    pub timestamp: u64,
    /// Opaque value a topic subscriber asked to have attached to every
    /// event it receives.
    pub body: Option<Value>,
}

impl Event {
    pub fn new(subject: SubjectId, service: ServiceId, kind: EventKind) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            subject,
            service,
            kind,
            timestamp,
            body: None,
        }
    }

    pub fn with_body(&self, body: Option<Value>) -> Self {
        let mut event = self.clone();
        event.body = body;
        event
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}:{} {}",
            self.subject.class(),
            self.subject,
            self.kind
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_payload_carries_reason_atom() {
        let event = Event::new(
            SubjectId::Session(SessionId::random()),
            ServiceId::new("svc"),
            EventKind::Stop {
                reason: Reason::SipBye,
            },
        );
        assert_eq!(event.kind.tag(), "stop");
        assert_eq!(event.kind.payload()["reason"], "sip_bye");
    }

    #[test]
    fn with_body_does_not_mutate_original() {
        let event = Event::new(
            SubjectId::Call(CallId::random()),
            ServiceId::new("svc"),
            EventKind::Hangup {
                reason: Reason::NoAnswer,
            },
        );
        let tagged = event.with_body(Some(json!({"who": "tester"})));
        assert!(event.body.is_none());
        assert_eq!(tagged.body.unwrap()["who"], "tester");
    }
}
