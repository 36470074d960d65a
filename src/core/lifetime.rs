//
// Copyright 2019-2024 MediaHub Authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Lifetime tokens.
//!
//! Every observer registration carries a token that lets the subject
//! detect observer liveness. The owning side keeps a [`LifetimeGuard`];
//! dropping the guard (or calling `end()`) marks the token ended and
//! notifies every watcher, which is how the hub's reaper learns that
//! dependent subjects must be torn down.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::UnboundedSender;

use crate::common::LifetimeId;

struct LifetimeInner {
    id: LifetimeId,
    ended: AtomicBool,
    watchers: Mutex<Vec<UnboundedSender<LifetimeId>>>,
}

/// Cloneable liveness token handed out with observer registrations.
#[derive(Clone)]
pub struct Lifetime {
    inner: Arc<LifetimeInner>,
}

impl Lifetime {
    /// Create a token plus the guard that owns it.
    pub fn create() -> (Lifetime, LifetimeGuard) {
        let token = Lifetime {
            inner: Arc::new(LifetimeInner {
                id: LifetimeId::random(),
                ended: AtomicBool::new(false),
                watchers: Mutex::new(Vec::new()),
            }),
        };
        let guard = LifetimeGuard {
            token: token.clone(),
        };
        (token, guard)
    }

    pub fn id(&self) -> LifetimeId {
        self.inner.id
    }

    pub fn is_ended(&self) -> bool {
        self.inner.ended.load(Ordering::Acquire)
    }

    /// Register a watcher channel. If the token already ended, the
    /// notification is delivered immediately.
    pub fn watch(&self, tx: UnboundedSender<LifetimeId>) {
        if self.is_ended() {
            let _ = tx.send(self.inner.id);
            return;
        }
        if let Ok(mut watchers) = self.inner.watchers.lock() {
            watchers.push(tx);
        }
        // Raced with end(): the flag may have flipped after the early
        // check but before the push was visible.
        if self.is_ended() {
            self.notify();
        }
    }

    fn notify(&self) {
        let watchers = match self.inner.watchers.lock() {
            Ok(mut w) => std::mem::take(&mut *w),
            Err(_) => return,
        };
        for tx in watchers {
            let _ = tx.send(self.inner.id);
        }
    }

    fn end(&self) {
        if !self.inner.ended.swap(true, Ordering::AcqRel) {
            self.notify();
        }
    }
}

impl fmt::Display for Lifetime {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "lifetime:{}", self.inner.id)
    }
}

impl fmt::Debug for Lifetime {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// Owning side of a lifetime. Ends the token on drop.
pub struct LifetimeGuard {
    token: Lifetime,
}

impl LifetimeGuard {
    pub fn token(&self) -> Lifetime {
        self.token.clone()
    }

    /// End the token explicitly, ahead of drop.
    pub fn end(&self) {
        self.token.end();
    }
}

impl Drop for LifetimeGuard {
    fn drop(&mut self) {
        self.token.end();
    }
}

impl fmt::Debug for LifetimeGuard {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "guard:{}", self.token.inner.id)
    }
}
