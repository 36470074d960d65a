//
// Copyright 2019-2024 MediaHub Authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Observer Fabric.
//!
//! The one globally shared registry: for each subject, the set of
//! parties that registered interest in it, each with an identity link,
//! a role, a liveness token and an optional opaque payload. Sessions
//! and calls consult it on every event emission; the reaper consults
//! it when a lifetime ends.
//!
//! Entries are sharded by subject hash so add/remove/fold on unrelated
//! subjects never contend on one lock; only the reaper's lifetime
//! sweep walks every shard.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

use serde_json::Value;

use crate::common::{LifetimeId, LockGuarded, ObserverRole, Result};
use crate::core::event::SubjectId;
use crate::core::lifetime::Lifetime;
use crate::core::link::Link;

const SHARD_COUNT: usize = 16;

type Shard = Mutex<HashMap<SubjectId, Vec<ObserverEntry>>>;

/// One registered observer of a subject.
#[derive(Clone, Debug)]
pub struct ObserverEntry {
    pub link: Link,
    pub role: ObserverRole,
    pub payload: Option<Value>,
}

impl ObserverEntry {
    pub fn lifetime(&self) -> &Lifetime {
        self.link.lifetime()
    }
}

pub struct Fabric {
    shards: [Shard; SHARD_COUNT],
}

impl Default for Fabric {
    fn default() -> Self {
        Self::new()
    }
}

impl Fabric {
    pub fn new() -> Self {
        Self {
            shards: std::array::from_fn(|_| Mutex::new(HashMap::new())),
        }
    }

    fn shard(&self, subject: &SubjectId) -> &Shard {
        let mut hasher = DefaultHasher::new();
        subject.hash(&mut hasher);
        &self.shards[hasher.finish() as usize % SHARD_COUNT]
    }

    /// Register an observer. Idempotent on the link: registering the
    /// same identity again replaces the previous entry.
    pub fn add(
        &self,
        subject: SubjectId,
        link: Link,
        role: ObserverRole,
        payload: Option<Value>,
    ) -> Result<()> {
        let mut entries = self.shard(&subject).guarded("fabric shard")?;
        let observers = entries.entry(subject).or_default();
        let entry = ObserverEntry {
            link,
            role,
            payload,
        };
        if let Some(existing) = observers.iter_mut().find(|e| e.link == entry.link) {
            *existing = entry;
        } else {
            observers.push(entry);
        }
        Ok(())
    }

    pub fn remove(&self, subject: &SubjectId, link: &Link) -> Result<()> {
        let mut entries = self.shard(subject).guarded("fabric shard")?;
        if let Some(observers) = entries.get_mut(subject) {
            observers.retain(|e| &e.link != link);
            if observers.is_empty() {
                entries.remove(subject);
            }
        }
        Ok(())
    }

    /// Drop every entry for a subject, returning what was registered.
    pub fn remove_subject(&self, subject: &SubjectId) -> Result<Vec<ObserverEntry>> {
        let mut entries = self.shard(subject).guarded("fabric shard")?;
        Ok(entries.remove(subject).unwrap_or_default())
    }

    /// Snapshot iteration: concurrent add/remove does not produce
    /// duplicate or missed entries within a single fold.
    pub fn fold<A, F>(&self, subject: &SubjectId, init: A, mut f: F) -> Result<A>
    where
        F: FnMut(A, &ObserverEntry) -> A,
    {
        let snapshot = {
            let entries = self.shard(subject).guarded("fabric shard")?;
            entries.get(subject).cloned().unwrap_or_default()
        };
        let mut acc = init;
        for entry in &snapshot {
            acc = f(acc, entry);
        }
        Ok(acc)
    }

    /// Every observer entry whose lifetime just ended, removed and
    /// returned for cleanup. Walks every shard; each is locked on its
    /// own.
    pub fn on_lifetime_end(&self, lifetime: LifetimeId) -> Result<Vec<(SubjectId, ObserverEntry)>> {
        let mut dead = Vec::new();
        for shard in &self.shards {
            let mut entries = shard.guarded("fabric shard")?;
            entries.retain(|subject, observers| {
                observers.retain(|entry| {
                    if entry.lifetime().id() == lifetime {
                        dead.push((subject.clone(), entry.clone()));
                        false
                    } else {
                        true
                    }
                });
                !observers.is_empty()
            });
        }
        Ok(dead)
    }

    pub fn observer_count(&self, subject: &SubjectId) -> Result<usize> {
        let entries = self.shard(subject).guarded("fabric shard")?;
        Ok(entries.get(subject).map(Vec::len).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::SessionId;

    fn subject() -> SubjectId {
        SubjectId::Session(SessionId::random())
    }

    fn session_link() -> (Link, crate::core::lifetime::LifetimeGuard) {
        let (lifetime, guard) = Lifetime::create();
        (
            Link::Session {
                id: SessionId::random(),
                lifetime,
            },
            guard,
        )
    }

    #[test]
    fn add_is_idempotent_on_link() {
        let fabric = Fabric::new();
        let subject = subject();
        let (link, _guard) = session_link();
        fabric
            .add(subject.clone(), link.clone(), ObserverRole::Registered, None)
            .unwrap();
        fabric
            .add(
                subject.clone(),
                link.clone(),
                ObserverRole::Callee,
                Some(serde_json::json!(1)),
            )
            .unwrap();
        assert_eq!(fabric.observer_count(&subject).unwrap(), 1);
        let roles = fabric
            .fold(&subject, Vec::new(), |mut acc, e| {
                acc.push(e.role);
                acc
            })
            .unwrap();
        assert_eq!(roles, vec![ObserverRole::Callee]);
    }

    #[test]
    fn lifetime_end_sweeps_every_shard() {
        let fabric = Fabric::new();
        let (lifetime, guard) = Lifetime::create();
        let link = Link::Session {
            id: SessionId::random(),
            lifetime,
        };
        // Enough subjects to land in several different shards.
        let subjects: Vec<SubjectId> = (0..32).map(|_| subject()).collect();
        for s in &subjects {
            fabric
                .add(s.clone(), link.clone(), ObserverRole::Registered, None)
                .unwrap();
        }

        let dead = fabric.on_lifetime_end(guard.token().id()).unwrap();
        assert_eq!(dead.len(), subjects.len());
        for s in &subjects {
            assert_eq!(fabric.observer_count(s).unwrap(), 0);
        }
    }

    #[test]
    fn remove_clears_only_the_named_link() {
        let fabric = Fabric::new();
        let subject = subject();
        let (a, _ga) = session_link();
        let (b, _gb) = session_link();
        fabric
            .add(subject.clone(), a.clone(), ObserverRole::Registered, None)
            .unwrap();
        fabric
            .add(subject.clone(), b, ObserverRole::Registered, None)
            .unwrap();
        fabric.remove(&subject, &a).unwrap();
        assert_eq!(fabric.observer_count(&subject).unwrap(), 1);
    }

    #[test]
    fn subjects_in_different_shards_are_independent() {
        let fabric = Fabric::new();
        let s1 = subject();
        let s2 = subject();
        let (a, _ga) = session_link();
        let (b, _gb) = session_link();
        fabric
            .add(s1.clone(), a, ObserverRole::Registered, None)
            .unwrap();
        fabric
            .add(s2.clone(), b, ObserverRole::Session, None)
            .unwrap();
        assert_eq!(fabric.remove_subject(&s1).unwrap().len(), 1);
        assert_eq!(fabric.observer_count(&s2).unwrap(), 1);
    }
}
