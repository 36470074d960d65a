//
// Copyright 2019-2024 MediaHub Authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! User directory / registrar.
//!
//! SIP REGISTER and Verto logins store contact bindings here; the
//! directory doubles as the default resolver-chain entry, expanding a
//! callee to every live contact of that user.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::common::{LockGuarded, Result, ServiceId};
use crate::core::resolver::{DestDesc, Destination, ResolveFlow, Resolver};

/// Default registration lifetime when the wire does not carry one.
pub const DEFAULT_EXPIRES: Duration = Duration::from_secs(3600);

#[derive(Clone, Debug)]
pub struct Binding {
    pub user: String,
    /// Adapter scheme able to reach this contact.
    pub scheme: String,
    /// Adapter-specific contact target.
    pub contact: String,
    pub params: Value,
    pub expires_at: Instant,
}

impl Binding {
    fn expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

pub struct Directory {
    bindings: Mutex<HashMap<(ServiceId, String), Vec<Binding>>>,
}

impl Default for Directory {
    fn default() -> Self {
        Self::new()
    }
}

impl Directory {
    pub fn new() -> Self {
        Self {
            bindings: Mutex::new(HashMap::new()),
        }
    }

    /// Store a contact binding, replacing a previous one for the same
    /// scheme+contact pair.
    pub fn register(
        &self,
        service: &ServiceId,
        user: &str,
        scheme: &str,
        contact: &str,
        params: Value,
        expires: Duration,
    ) -> Result<()> {
        info!("directory: register {}@{} via {}", user, service, scheme);
        let mut bindings = self.bindings.guarded("directory")?;
        let entry = bindings
            .entry((service.clone(), user.to_string()))
            .or_default();
        entry.retain(|b| !(b.scheme == scheme && b.contact == contact) && !b.expired());
        entry.push(Binding {
            user: user.to_string(),
            scheme: scheme.to_string(),
            contact: contact.to_string(),
            params,
            expires_at: Instant::now() + expires,
        });
        Ok(())
    }

    pub fn unregister(&self, service: &ServiceId, user: &str, contact: &str) -> Result<()> {
        let mut bindings = self.bindings.guarded("directory")?;
        if let Some(entry) = bindings.get_mut(&(service.clone(), user.to_string())) {
            entry.retain(|b| b.contact != contact);
            if entry.is_empty() {
                bindings.remove(&(service.clone(), user.to_string()));
            }
        }
        Ok(())
    }

    /// Drop every binding with the given contact target, across users;
    /// used when a connection goes away.
    pub fn unregister_contact(&self, service: &ServiceId, contact: &str) -> Result<()> {
        let mut bindings = self.bindings.guarded("directory")?;
        bindings.retain(|(svc, _), entry| {
            if svc != service {
                return true;
            }
            entry.retain(|b| b.contact != contact);
            !entry.is_empty()
        });
        Ok(())
    }

    /// Live contact bindings for a user; expired entries are pruned on
    /// the way through.
    pub fn lookup(&self, service: &ServiceId, user: &str) -> Result<Vec<Binding>> {
        let mut bindings = self.bindings.guarded("directory")?;
        match bindings.get_mut(&(service.clone(), user.to_string())) {
            Some(entry) => {
                entry.retain(|b| !b.expired());
                Ok(entry.clone())
            }
            None => Ok(Vec::new()),
        }
    }

    pub fn is_registered(&self, service: &ServiceId, user: &str) -> Result<bool> {
        Ok(!self.lookup(service, user)?.is_empty())
    }
}

/// Resolver-chain entry expanding a callee to registered contacts.
pub struct DirectoryResolver {
    directory: Arc<Directory>,
}

impl DirectoryResolver {
    pub fn new(directory: Arc<Directory>) -> Self {
        Self { directory }
    }
}

impl Resolver for DirectoryResolver {
    fn resolve(&self, service: &ServiceId, callee: &str, acc: &mut Vec<DestDesc>) -> ResolveFlow {
        let user = callee.split('@').next().unwrap_or(callee);
        if let Ok(bindings) = self.directory.lookup(service, user) {
            for binding in bindings {
                let mut dest = Destination::new(binding.scheme, binding.contact);
                dest.params = binding.params;
                acc.push(DestDesc::new(dest));
            }
        }
        ResolveFlow::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_returns_live_bindings() {
        let directory = Directory::new();
        let service = ServiceId::new("svc");
        directory
            .register(
                &service,
                "alice",
                "verto",
                "conn-1",
                Value::Null,
                DEFAULT_EXPIRES,
            )
            .unwrap();
        directory
            .register(
                &service,
                "alice",
                "sip",
                "sip:alice@10.0.0.1",
                Value::Null,
                DEFAULT_EXPIRES,
            )
            .unwrap();
        let bindings = directory.lookup(&service, "alice").unwrap();
        assert_eq!(bindings.len(), 2);
        assert!(directory.is_registered(&service, "alice").unwrap());
    }

    #[test]
    fn expired_bindings_are_pruned() {
        let directory = Directory::new();
        let service = ServiceId::new("svc");
        directory
            .register(
                &service,
                "bob",
                "sip",
                "sip:bob@10.0.0.2",
                Value::Null,
                Duration::from_secs(0),
            )
            .unwrap();
        assert!(directory.lookup(&service, "bob").unwrap().is_empty());
    }

    #[test]
    fn resolver_expands_to_contacts() {
        let directory = Arc::new(Directory::new());
        let service = ServiceId::new("svc");
        directory
            .register(
                &service,
                "carol",
                "verto",
                "conn-9",
                Value::Null,
                DEFAULT_EXPIRES,
            )
            .unwrap();
        let resolver = DirectoryResolver::new(directory);
        let mut acc = Vec::new();
        assert_eq!(
            resolver.resolve(&service, "carol@example.org", &mut acc),
            ResolveFlow::Continue
        );
        assert_eq!(acc.len(), 1);
        assert_eq!(acc[0].dest.scheme, "verto");
    }
}
