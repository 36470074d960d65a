//
// Copyright 2019-2024 MediaHub Authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! # MediaHub
//!
//! A media-signaling orchestrator: a stateful hub that mediates between
//! human-facing signaling endpoints (SIP, the Verto WebSocket protocol,
//! an external programmatic API) and media-processing backends (the FS
//! conferencing engine and the KMS WebRTC engine).
//!
//! The hub accepts an invite from one party, negotiates an SDP
//! offer/answer with a media backend, and optionally forwards the
//! negotiated media to a second party, tracking the lifecycle of every
//! leg and failing all dependent legs atomically when any one fails.

#[macro_use]
extern crate log;

pub mod backend;
pub mod common;
pub mod config;
pub mod core;
pub mod directory;
pub mod error;
pub mod signaling;
