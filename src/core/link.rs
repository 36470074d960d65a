//
// Copyright 2019-2024 MediaHub Authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Identity tokens used as observer keys.
//!
//! A `Link` names one party of an observer relationship precisely
//! enough to route events back to it and to correlate wire-protocol
//! state (SIP transactions/dialogs, Verto client call ids). Equality
//! ignores the lifetime token: re-registering the same identity
//! replaces the old entry.

use std::fmt;

use crate::common::{ApiClientId, CallId, DialogHandle, RequestHandle, SessionId, VertoConnId};
use crate::core::lifetime::Lifetime;

#[derive(Clone, Debug)]
pub enum Link {
    Session {
        id: SessionId,
        lifetime: Lifetime,
    },
    Call {
        id: CallId,
        lifetime: Lifetime,
    },
    SipIn {
        request: RequestHandle,
        dialog: DialogHandle,
        lifetime: Lifetime,
    },
    SipOut {
        dest: String,
        lifetime: Lifetime,
    },
    Verto {
        conn: VertoConnId,
        /// Client-chosen call id; preserved for responses.
        call_id: String,
        lifetime: Lifetime,
    },
    Api {
        client: ApiClientId,
        lifetime: Lifetime,
    },
}

impl Link {
    pub fn lifetime(&self) -> &Lifetime {
        match self {
            Self::Session { lifetime, .. }
            | Self::Call { lifetime, .. }
            | Self::SipIn { lifetime, .. }
            | Self::SipOut { lifetime, .. }
            | Self::Verto { lifetime, .. }
            | Self::Api { lifetime, .. } => lifetime,
        }
    }

    /// The adapter scheme responsible for delivering events to this
    /// link, if it is a wire link.
    pub fn scheme(&self) -> Option<&'static str> {
        match self {
            Self::SipIn { .. } | Self::SipOut { .. } => Some("sip"),
            Self::Verto { .. } => Some("verto"),
            Self::Api { .. } => Some("api"),
            Self::Session { .. } | Self::Call { .. } => None,
        }
    }

    pub fn session_id(&self) -> Option<SessionId> {
        match self {
            Self::Session { id, .. } => Some(*id),
            _ => None,
        }
    }

    pub fn call_id(&self) -> Option<CallId> {
        match self {
            Self::Call { id, .. } => Some(*id),
            _ => None,
        }
    }
}

impl PartialEq for Link {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Session { id: a, .. }, Self::Session { id: b, .. }) => a == b,
            (Self::Call { id: a, .. }, Self::Call { id: b, .. }) => a == b,
            (
                Self::SipIn {
                    request: ra,
                    dialog: da,
                    ..
                },
                Self::SipIn {
                    request: rb,
                    dialog: db,
                    ..
                },
            ) => ra == rb && da == db,
            (Self::SipOut { dest: a, .. }, Self::SipOut { dest: b, .. }) => a == b,
            (
                Self::Verto {
                    conn: ca,
                    call_id: ia,
                    ..
                },
                Self::Verto {
                    conn: cb,
                    call_id: ib,
                    ..
                },
            ) => ca == cb && ia == ib,
            (Self::Api { client: a, .. }, Self::Api { client: b, .. }) => a == b,
            _ => false,
        }
    }
}

impl Eq for Link {}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Session { id, .. } => write!(f, "session:{}", id),
            Self::Call { id, .. } => write!(f, "call:{}", id),
            Self::SipIn {
                request, dialog, ..
            } => write!(f, "sip_in:{}/{}", request, dialog),
            Self::SipOut { dest, .. } => write!(f, "sip_out:{}", dest),
            Self::Verto { conn, call_id, .. } => write!(f, "verto:{}/{}", conn, call_id),
            Self::Api { client, .. } => write!(f, "api:{}", client),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_ignores_lifetime() {
        let id = SessionId::random();
        let (lt1, _g1) = Lifetime::create();
        let (lt2, _g2) = Lifetime::create();
        let a = Link::Session { id, lifetime: lt1 };
        let b = Link::Session { id, lifetime: lt2 };
        assert_eq!(a, b);
    }

    #[test]
    fn different_variants_are_unequal() {
        let (lt, _g) = Lifetime::create();
        let a = Link::SipOut {
            dest: "sip:a@b".to_string(),
            lifetime: lt.clone(),
        };
        let b = Link::Api {
            client: ApiClientId::random(),
            lifetime: lt,
        };
        assert_ne!(a, b);
    }
}
