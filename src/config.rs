//
// Copyright 2019-2024 MediaHub Authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Hub configuration.
//!
//! Loading is the embedder's concern; the hub only consumes the parsed
//! structure.

use serde::Deserialize;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Accept SIP REGISTER at all.
    pub sip_registrar: bool,
    /// Realm / force-domain value for the SIP registrar.
    pub sip_domain: Option<String>,
    /// Rewrite the REGISTER To-domain to `sip_domain`.
    pub sip_registrar_force_domain: bool,
    /// Permit INVITE to URIs with no registrar binding.
    pub sip_invite_not_registered: bool,
    /// WebSocket bind specs for the Verto listener.
    pub verto_listen: Vec<String>,
    /// Backend engine image references, resolved by the container
    /// monitor outside this crate.
    pub fs_docker_image: Option<String>,
    pub kms_docker_image: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sip_registrar: true,
            sip_domain: None,
            sip_registrar_force_domain: false,
            sip_invite_not_registered: true,
            verto_listen: Vec::new(),
            fs_docker_image: None,
            kms_docker_image: None,
        }
    }
}
