//
// Copyright 2019-2024 MediaHub Authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Common types used throughout the library.

use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Common Result type, using `anyhow::Error` for Error.
pub type Result<T> = anyhow::Result<T>;

/// Lock acquisition that surfaces mutex poisoning as a plain error
/// instead of a panic. The label names the poisoned state.
pub trait LockGuarded<T> {
    fn guarded(&self, label: &'static str) -> Result<MutexGuard<'_, T>>;
}

impl<T> LockGuarded<T> for Mutex<T> {
    fn guarded(&self, label: &'static str) -> Result<MutexGuard<'_, T>> {
        self.lock()
            .map_err(|_| crate::error::HubError::MutexPoisoned(label).into())
    }
}

/// Default ring timeout applied to an invite when the destination
/// descriptor does not carry one.
pub const DEF_RING: Duration = Duration::from_secs(30);

/// Upper bound on any per-invite ring timeout.
pub const MAX_RING: Duration = Duration::from_secs(180);

/// Grace window between the final lifecycle event of a Session or Call
/// and its removal from the registry, so observers see the event before
/// the subject vanishes.
pub const STOP_GRACE: Duration = Duration::from_millis(100);

/// Bounded wait for the backend to signal `parked` when a leg is moved
/// to the neutral media state.
pub const PARK_WAIT: Duration = Duration::from_secs(2);

/// How long `get_offer()` blocks before reporting "not yet".
pub const OFFER_WAIT: Duration = Duration::from_secs(20);

/// How long `get_answer()` blocks before reporting "not yet".
pub const ANSWER_WAIT: Duration = Duration::from_secs(40);

/// How long an offer that advertises trickle ICE is held for candidates
/// before the start proceeds with whatever has arrived.
pub const TRICKLE_HOLD: Duration = Duration::from_secs(5);

/// Verto connections idle longer than this are torn down.
pub const VERTO_IDLE: Duration = Duration::from_secs(60 * 60);

static_assertions::const_assert!(DEF_RING.as_secs() <= MAX_RING.as_secs());

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn random() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

uuid_id!(
    /// Unique session identification number.
    SessionId
);
uuid_id!(
    /// Unique call identification number.
    CallId
);
uuid_id!(
    /// Identifies one Verto WebSocket connection.
    VertoConnId
);
uuid_id!(
    /// Identifies one External-API client session.
    ApiClientId
);
uuid_id!(
    /// Identifies a lifetime token watched by the reaper.
    LifetimeId
);

/// Logical tenant identifier; every hub operation is scoped to one.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceId(pub String);

impl ServiceId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque identifier of a specific SIP transaction awaiting a final
/// response. CANCEL correlation uses this.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct RequestHandle(pub String);

impl fmt::Display for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque identifier of a SIP dialog. BYE correlation uses this.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct DialogHandle(pub String);

impl fmt::Display for DialogHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The kind of media work a session performs on its one leg.
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    /// Proxy-less peer to peer; both SDPs come from signaling peers.
    P2p,
    /// Media passes through the backend unmodified.
    Proxy,
    /// Neutral backend state, no media processing applied.
    Park,
    /// Media is looped back to the sender.
    Echo,
    /// Leg joins a multipoint conference room.
    Mcu,
    /// Leg is bridged to a named peer leg on the backend.
    Bridge,
    /// SFU publisher leg.
    Publish,
    /// SFU listener leg consuming a named publisher.
    Listen,
    /// Out-leg of a multi-destination call; its answer propagates to
    /// the master session.
    Call,
}

/// Type-specific session attributes. Unset fields are not serialized,
/// so `type_ext` on the wire carries only what applies.
#[derive(Clone, Default, PartialEq, Debug, Serialize, Deserialize)]
pub struct TypeExt {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mcu_layout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<SessionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publisher_id: Option<SessionId>,
}

impl TypeExt {
    /// Overlay `other` onto `self`, keeping existing values where the
    /// overlay is unset.
    pub fn merge(&mut self, other: &TypeExt) {
        if other.room_id.is_some() {
            self.room_id = other.room_id.clone();
        }
        if other.room_type.is_some() {
            self.room_type = other.room_type.clone();
        }
        if other.mcu_layout.is_some() {
            self.mcu_layout = other.mcu_layout.clone();
        }
        if other.peer_id.is_some() {
            self.peer_id = other.peer_id;
        }
        if other.publisher_id.is_some() {
            self.publisher_id = other.publisher_id;
        }
    }
}

/// Tracks the state of a session leg.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Created, start not yet processed.
    New,
    /// Waiting for an offer (local generation or signaling peer).
    WaitOffer,
    /// Offer in place, waiting for the answer.
    WaitAnswer,
    /// Offer and answer both in place, media is up.
    Ready,
    /// Final `stop` event emitted, grace window running.
    Stopping,
    /// Terminal.
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Tracks the state of a multi-leg invite coordinator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallState {
    /// Created, start not yet processed.
    Created,
    /// Running the resolver chain.
    Resolving,
    /// Invites launched, waiting for the first answer.
    Inviting,
    /// One invite won; the losers have been cancelled.
    Answered,
    /// `hangup` emitted, grace window running.
    Stopping,
    /// Terminal.
    Stopped,
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Why a session stopped or a call hung up. These atoms surface in
/// lifecycle events and map to wire error codes via
/// [`crate::error::reason_code`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reason {
    UserHangup,
    SipBye,
    SipCancel,
    SipError,
    VertoBye,
    ApiHangup,
    ApiStop,
    NoDestination,
    NoAnswer,
    UserNotFound,
    OriginatorCancel,
    CalleeStop,
    SessionStop,
    CallStop,
    RegisteredStop,
    MasterPeerStop,
    PeerStop,
    Timeout,
    ChannelStop,
    Disconnected,
    MediaServerDown,
    Backend(String),
}

impl Reason {
    /// The stable wire atom for this reason.
    pub fn as_atom(&self) -> &str {
        match self {
            Self::UserHangup => "user_hangup",
            Self::SipBye => "sip_bye",
            Self::SipCancel => "sip_cancel",
            Self::SipError => "sip_error",
            Self::VertoBye => "verto_bye",
            Self::ApiHangup => "api_hangup",
            Self::ApiStop => "api_stop",
            Self::NoDestination => "no_destination",
            Self::NoAnswer => "no_answer",
            Self::UserNotFound => "user_not_found",
            Self::OriginatorCancel => "originator_cancel",
            Self::CalleeStop => "callee_stop",
            Self::SessionStop => "session_stop",
            Self::CallStop => "call_stop",
            Self::RegisteredStop => "registered_stop",
            Self::MasterPeerStop => "master_peer_stop",
            Self::PeerStop => "peer_stop",
            Self::Timeout => "timeout",
            Self::ChannelStop => "channel_stop",
            Self::Disconnected => "disconnected",
            Self::MediaServerDown => "media_server_down",
            Self::Backend(_) => "backend_error",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Backend(detail) => write!(f, "backend_error({})", detail),
            _ => write!(f, "{}", self.as_atom()),
        }
    }
}

/// The role an observer was registered under. Death of an observer
/// stops the subject with a reason naming this role.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ObserverRole {
    /// Plain registration (adapters, API clients).
    Registered,
    /// A linked session observing a call, or vice versa.
    Session,
    /// The winning destination of an answered call.
    Callee,
    /// The master leg of a call-type session pair.
    MasterPeer,
}

impl ObserverRole {
    pub fn death_reason(&self) -> Reason {
        match self {
            Self::Registered => Reason::RegisteredStop,
            Self::Session => Reason::SessionStop,
            Self::Callee => Reason::CalleeStop,
            Self::MasterPeer => Reason::MasterPeerStop,
        }
    }
}

impl fmt::Display for ObserverRole {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let label = match self {
            Self::Registered => "registered",
            Self::Session => "session",
            Self::Callee => "callee",
            Self::MasterPeer => "master_peer",
        };
        write!(f, "{}", label)
    }
}

/// Kinds of in-place session mutation accepted by `Session::update()`.
#[derive(Clone, Copy, PartialEq, Eq, Debug, strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum UpdateKind {
    SessionType,
    Media,
    McuLayout,
    ListenSwitch,
    Info,
}
