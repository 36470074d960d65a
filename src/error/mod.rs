//
// Copyright 2019-2024 MediaHub Authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Common error codes.

use std::collections::HashMap;

use lazy_static::lazy_static;
use thiserror::Error;

use crate::common::{CallId, Reason, SessionId};

/// Platform independent error conditions.
#[derive(Error, Debug)]
pub enum HubError {
    // Project wide common error codes
    #[error("Mutex poisoned: {0}")]
    MutexPoisoned(&'static str),
    #[error("Expecting non-none option value in: {0}, var: {1}")]
    OptionValueNotSet(String, String),
    #[error("FSM event stream closed for: {0}")]
    FsmStreamSend(String),

    // Registry lookups
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),
    #[error("Call not found: {0}")]
    CallNotFound(CallId),
    #[error("Invite not found for link")]
    InviteNotFound,
    #[error("Room not found: {0}")]
    RoomNotFound(String),
    #[error("User not found: {0}")]
    UserNotFound(String),
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    // Operation errors: returned to the caller, never stop the subject
    #[error("Session already has an answer")]
    AlreadyAnswered,
    #[error("Session already has an offer")]
    AlreadyOffered,
    #[error("Operation invalid in state: {0}")]
    InvalidState(String),
    #[error("No destination resolved")]
    NoDestination,
    #[error("No invite answered")]
    NoAnswer,
    #[error("Session error: {0}")]
    SessionError(String),
    #[error("Call error: {0}")]
    CallError(String),
    #[error("No backend supports session type: {0}")]
    NoBackend(String),
    #[error("Backend error: {0}")]
    Backend(String),
    #[error("Operation timed out: {0}")]
    Timeout(String),
    #[error("Unknown command: {0}")]
    UnknownCommand(String),
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    // Adapter-layer errors
    #[error("SIP registrar disabled")]
    RegistrarDisabled,
    #[error("SIP domain mismatch: {0}")]
    DomainMismatch(String),
    #[error("Verto login failed for user: {0}")]
    LoginFailed(String),
    #[error("Verto connection not found")]
    VertoConnNotFound,
    #[error("API client not found")]
    ApiClientNotFound,
}

lazy_static! {
    /// Reason atom to user-visible `{code, text}` table, consulted by
    /// the adapters when surfacing internal reasons on the wire.
    ///
    /// 2110-2115 SIP, 2130-2131 Verto, 2300-2311 FS, 2400-2412 KMS.
    static ref REASON_CODES: HashMap<&'static str, (u32, &'static str)> = {
        let mut m = HashMap::new();
        // SIP layer
        m.insert("sip_bye", (2110, "SIP bye received"));
        m.insert("sip_cancel", (2111, "SIP cancel received"));
        m.insert("sip_error", (2112, "SIP processing error"));
        m.insert("sip_registrar_disabled", (2113, "SIP registrar disabled"));
        m.insert("sip_domain_mismatch", (2114, "SIP domain not allowed"));
        m.insert("sip_not_registered", (2115, "SIP user not registered"));
        // Verto layer
        m.insert("verto_bye", (2130, "Verto bye received"));
        m.insert("verto_down", (2131, "Verto connection down"));
        // FS backend
        m.insert("fs_down", (2300, "FS engine unavailable"));
        m.insert("fs_start_error", (2301, "FS could not start leg"));
        m.insert("fs_transfer_error", (2302, "FS transfer failed"));
        m.insert("fs_bridge_error", (2303, "FS bridge failed"));
        m.insert("fs_layout_error", (2304, "FS MCU layout rejected"));
        m.insert("fs_park_timeout", (2305, "FS park confirmation timeout"));
        m.insert("channel_stop", (2306, "FS channel stopped"));
        m.insert("fs_op_error", (2311, "FS operation failed"));
        // KMS backend
        m.insert("kms_down", (2400, "KMS engine unavailable"));
        m.insert("kms_endpoint_error", (2401, "KMS could not create endpoint"));
        m.insert("kms_offer_error", (2402, "KMS offer processing failed"));
        m.insert("kms_answer_error", (2403, "KMS answer processing failed"));
        m.insert("kms_candidate_error", (2404, "KMS candidate rejected"));
        m.insert("kms_connect_error", (2405, "KMS connect failed"));
        m.insert("kms_publisher_missing", (2406, "KMS publisher not found"));
        m.insert("kms_op_error", (2412, "KMS operation failed"));
        m
    };
}

/// Look up the user-visible `{code, text}` pair for a stop/hangup
/// reason. Reasons with no table entry get the generic session error.
pub fn reason_code(reason: &Reason) -> (u32, String) {
    if let Some((code, text)) = REASON_CODES.get(reason.as_atom()) {
        return (*code, (*text).to_string());
    }
    match reason {
        Reason::Backend(detail) => (2311, format!("backend error: {}", detail)),
        other => (2000, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_reasons_resolve_to_their_range() {
        let (code, _) = reason_code(&Reason::SipBye);
        assert!((2110..=2115).contains(&code));
        let (code, _) = reason_code(&Reason::VertoBye);
        assert!((2130..=2131).contains(&code));
        let (code, _) = reason_code(&Reason::ChannelStop);
        assert!((2300..=2311).contains(&code));
    }

    #[test]
    fn backend_detail_is_preserved() {
        let (code, text) = reason_code(&Reason::Backend("conference full".to_string()));
        assert_eq!(code, 2311);
        assert!(text.contains("conference full"));
    }
}
