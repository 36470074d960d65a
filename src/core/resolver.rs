//
// Copyright 2019-2024 MediaHub Authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Resolver Chain.
//!
//! Ordered callbacks that expand a callee string into destination
//! descriptors. Plugins append to the running accumulator; an entry
//! may declare the result final to stop the chain.

use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value;

use crate::common::{LockGuarded, Result, ServiceId};
use crate::core::sdp::SdpKind;

/// Where an invite should be dispatched. The scheme selects the
/// signaling adapter; the target is adapter-specific.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Destination {
    pub scheme: String,
    pub target: String,
    pub params: Value,
}

impl Destination {
    pub fn new(scheme: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            target: target.into(),
            params: Value::Null,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.scheme, self.target)
    }
}

/// One resolved destination with its launch parameters.
#[derive(Clone, Debug)]
pub struct DestDesc {
    pub dest: Destination,
    /// Delay before this invite is launched.
    pub wait: Option<Duration>,
    /// Ring timeout; capped at MAX_RING by the call.
    pub ring: Option<Duration>,
    pub sdp_kind: Option<SdpKind>,
}

impl DestDesc {
    pub fn new(dest: Destination) -> Self {
        Self {
            dest,
            wait: None,
            ring: None,
            sdp_kind: None,
        }
    }
}

/// Whether the chain keeps running after a resolver contributed.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ResolveFlow {
    Continue,
    Final,
}

pub trait Resolver: Send + Sync {
    fn resolve(&self, service: &ServiceId, callee: &str, acc: &mut Vec<DestDesc>) -> ResolveFlow;
}

/// Adapter for closure-based resolvers.
pub struct FnResolver<F>(pub F);

impl<F> Resolver for FnResolver<F>
where
    F: Fn(&ServiceId, &str, &mut Vec<DestDesc>) -> ResolveFlow + Send + Sync,
{
    fn resolve(&self, service: &ServiceId, callee: &str, acc: &mut Vec<DestDesc>) -> ResolveFlow {
        (self.0)(service, callee, acc)
    }
}

pub struct ResolverChain {
    resolvers: Mutex<Vec<Box<dyn Resolver>>>,
}

impl Default for ResolverChain {
    fn default() -> Self {
        Self::new()
    }
}

impl ResolverChain {
    pub fn new() -> Self {
        Self {
            resolvers: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, resolver: Box<dyn Resolver>) -> Result<()> {
        let mut resolvers = self.resolvers.guarded("resolver_chain")?;
        resolvers.push(resolver);
        Ok(())
    }

    /// Run the chain in registration order, starting from an empty
    /// accumulator.
    pub fn resolve(&self, service: &ServiceId, callee: &str) -> Result<Vec<DestDesc>> {
        let resolvers = self.resolvers.guarded("resolver_chain")?;
        let mut acc = Vec::new();
        for resolver in resolvers.iter() {
            if resolver.resolve(service, callee, &mut acc) == ResolveFlow::Final {
                break;
            }
        }
        Ok(acc)
    }
}
