//
// Copyright 2019-2024 MediaHub Authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! The main Hub object definitions.
//!
//! The hub owns the process-wide state: the session and call
//! registries, the observer fabric, the event bus, the backend chain,
//! the signaling adapters, the resolver chain, the room registry and
//! the worker runtime every FSM pump and timer runs on. It is the
//! analog of a call manager: a cheap-to-clone facade over one shared
//! inner structure.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use tokio::runtime;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

use crate::backend::MediaBackend;
use crate::common::{CallId, LifetimeId, LockGuarded, Result, ServiceId, SessionId};
use crate::config::Config;
use crate::core::bus::Bus;
use crate::core::call::{Call, CallConfig};
use crate::core::event::{Event, SubjectId};
use crate::core::fabric::Fabric;
use crate::core::lifetime::Lifetime;
use crate::core::link::Link;
use crate::core::resolver::{DestDesc, Resolver, ResolverChain};
use crate::core::room::RoomRegistry;
use crate::core::session::{Session, SessionConfig};
use crate::directory::{Directory, DirectoryResolver};
use crate::error::HubError;
use crate::signaling::{DefaultInviteHook, InviteHook, InviteOutcome, SignalingAdapter};

struct HubInner {
    config: Config,
    runtime: Mutex<Option<runtime::Runtime>>,
    runtime_handle: runtime::Handle,
    sessions: Mutex<HashMap<SessionId, Session>>,
    calls: Mutex<HashMap<CallId, Call>>,
    fabric: Fabric,
    bus: Bus,
    rooms: RoomRegistry,
    directory: Arc<Directory>,
    backends: Mutex<Vec<Arc<dyn MediaBackend>>>,
    adapters: Mutex<HashMap<&'static str, Arc<dyn SignalingAdapter>>>,
    resolvers: ResolverChain,
    invite_hook: Mutex<Arc<dyn InviteHook>>,
    reaper_tx: UnboundedSender<LifetimeId>,
}

pub struct Hub {
    inner: Arc<HubInner>,
}

impl Clone for Hub {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl fmt::Display for Hub {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let sessions = self
            .inner
            .sessions
            .guarded("sessions")
            .map(|s| s.len())
            .unwrap_or_default();
        let calls = self
            .inner
            .calls
            .guarded("calls")
            .map(|c| c.len())
            .unwrap_or_default();
        write!(f, "hub: sessions: {}, calls: {}", sessions, calls)
    }
}

impl fmt::Debug for Hub {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl Hub {
    pub fn new(config: Config) -> Result<Self> {
        info!(
            "MediaHub v{}",
            option_env!("CARGO_PKG_VERSION").unwrap_or("unknown")
        );

        let rt = runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("hub-worker")
            .enable_time()
            .build()?;
        let runtime_handle = rt.handle().clone();
        let (reaper_tx, mut reaper_rx) = unbounded_channel();

        let directory = Arc::new(Directory::new());
        let hub = Self {
            inner: Arc::new(HubInner {
                config,
                runtime: Mutex::new(Some(rt)),
                runtime_handle,
                sessions: Mutex::new(HashMap::new()),
                calls: Mutex::new(HashMap::new()),
                fabric: Fabric::new(),
                bus: Bus::new(),
                rooms: RoomRegistry::new(),
                directory: Arc::clone(&directory),
                backends: Mutex::new(Vec::new()),
                adapters: Mutex::new(HashMap::new()),
                resolvers: ResolverChain::new(),
                invite_hook: Mutex::new(Arc::new(DefaultInviteHook)),
                reaper_tx,
            }),
        };

        // The registrar doubles as the default resolver entry.
        hub.inner
            .resolvers
            .push(Box::new(DirectoryResolver::new(directory)))?;

        // Reaper: lifetime deaths sweep the fabric and notify the
        // affected subjects. Holds only a weak reference so dropping
        // the last hub handle tears everything down.
        let weak = Arc::downgrade(&hub.inner);
        hub.runtime().spawn(async move {
            while let Some(lifetime) = reaper_rx.recv().await {
                let inner = match weak.upgrade() {
                    Some(inner) => inner,
                    None => break,
                };
                let hub = Hub { inner };
                if let Err(e) = hub.route_lifetime_end(lifetime) {
                    error!("reaper: routing lifetime end failed: {}", e);
                }
            }
        });

        Ok(hub)
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn runtime(&self) -> &runtime::Handle {
        &self.inner.runtime_handle
    }

    pub fn fabric(&self) -> &Fabric {
        &self.inner.fabric
    }

    pub fn bus(&self) -> &Bus {
        &self.inner.bus
    }

    pub fn rooms(&self) -> &RoomRegistry {
        &self.inner.rooms
    }

    pub fn directory(&self) -> &Directory {
        &self.inner.directory
    }

    pub fn resolvers(&self) -> &ResolverChain {
        &self.inner.resolvers
    }

    ////////////////////////////////////////////////////////////////////////
    // Plugin registration
    ////////////////////////////////////////////////////////////////////////

    pub fn register_backend(&self, backend: Arc<dyn MediaBackend>) -> Result<()> {
        info!("register_backend({})", backend.kind());
        let mut backends = self.inner.backends.guarded("backends")?;
        backends.push(backend);
        Ok(())
    }

    pub fn register_adapter(&self, adapter: Arc<dyn SignalingAdapter>) -> Result<()> {
        info!("register_adapter({})", adapter.scheme());
        let mut adapters = self.inner.adapters.guarded("adapters")?;
        adapters.insert(adapter.scheme(), adapter);
        Ok(())
    }

    pub fn add_resolver(&self, resolver: Box<dyn Resolver>) -> Result<()> {
        self.inner.resolvers.push(resolver)
    }

    pub fn set_invite_hook(&self, hook: Arc<dyn InviteHook>) -> Result<()> {
        let mut invite_hook = self.inner.invite_hook.guarded("invite_hook")?;
        *invite_hook = hook;
        Ok(())
    }

    pub fn invite_hook(&self) -> Result<Arc<dyn InviteHook>> {
        Ok(Arc::clone(&*self.inner.invite_hook.guarded("invite_hook")?))
    }

    pub(crate) fn backends(&self) -> Result<Vec<Arc<dyn MediaBackend>>> {
        Ok(self.inner.backends.guarded("backends")?.clone())
    }

    pub fn adapter(&self, scheme: &str) -> Result<Option<Arc<dyn SignalingAdapter>>> {
        Ok(self.inner.adapters.guarded("adapters")?.get(scheme).cloned())
    }

    ////////////////////////////////////////////////////////////////////////
    // Sessions
    ////////////////////////////////////////////////////////////////////////

    /// Create a session and run its start flow.
    pub fn start_session(&self, service: ServiceId, config: SessionConfig) -> Result<Session> {
        info!("API:start_session({})", config.session_type);
        let session = Session::new(self.clone(), service, config)?;
        {
            let mut sessions = self.inner.sessions.guarded("sessions")?;
            sessions.insert(session.id(), session.clone());
        }
        self.watch_lifetime(session.lifetime());
        session.start()?;
        Ok(session)
    }

    pub fn session(&self, session_id: &SessionId) -> Result<Session> {
        let sessions = self.inner.sessions.guarded("sessions")?;
        sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| HubError::SessionNotFound(*session_id).into())
    }

    pub fn sessions(&self, service: &ServiceId) -> Result<Vec<Session>> {
        let sessions = self.inner.sessions.guarded("sessions")?;
        Ok(sessions
            .values()
            .filter(|session| session.service() == service)
            .cloned()
            .collect())
    }

    pub(crate) fn remove_session(&self, session_id: &SessionId) -> Result<()> {
        let mut sessions = self.inner.sessions.guarded("sessions")?;
        sessions.remove(session_id);
        Ok(())
    }

    /// Route an engine notification to the owning session.
    pub fn backend_event(
        &self,
        session_id: &SessionId,
        event: crate::backend::BackendEvent,
    ) -> Result<()> {
        self.session(session_id)?.inject_backend_event(event)
    }

    ////////////////////////////////////////////////////////////////////////
    // Calls
    ////////////////////////////////////////////////////////////////////////

    /// Create a call and run its invite fan-out.
    pub fn start_call(
        &self,
        service: ServiceId,
        callee: String,
        config: CallConfig,
    ) -> Result<Call> {
        info!("API:start_call({})", callee);
        let call = Call::new(self.clone(), service, callee, config)?;
        {
            let mut calls = self.inner.calls.guarded("calls")?;
            calls.insert(call.id(), call.clone());
        }
        self.watch_lifetime(call.lifetime());
        call.start()?;
        Ok(call)
    }

    pub fn call(&self, call_id: &CallId) -> Result<Call> {
        let calls = self.inner.calls.guarded("calls")?;
        calls
            .get(call_id)
            .cloned()
            .ok_or_else(|| HubError::CallNotFound(*call_id).into())
    }

    pub fn calls(&self, service: &ServiceId) -> Result<Vec<Call>> {
        let calls = self.inner.calls.guarded("calls")?;
        Ok(calls
            .values()
            .filter(|call| call.service() == service)
            .cloned()
            .collect())
    }

    pub(crate) fn remove_call(&self, call_id: &CallId) -> Result<()> {
        let mut calls = self.inner.calls.guarded("calls")?;
        calls.remove(call_id);
        Ok(())
    }

    ////////////////////////////////////////////////////////////////////////
    // Invite dispatch
    ////////////////////////////////////////////////////////////////////////

    pub(crate) fn dispatch_invite(&self, call: &Call, desc: &DestDesc) -> Result<InviteOutcome> {
        match self.adapter(&desc.dest.scheme)? {
            Some(adapter) => Ok(adapter.invite(call, desc)),
            None => {
                warn!(
                    "call {}: no adapter for scheme {}",
                    call.id(),
                    desc.dest.scheme
                );
                Ok(InviteOutcome::Remove)
            }
        }
    }

    pub(crate) fn cancel_invite(&self, call: &Call, link: &Link) {
        match link.scheme() {
            Some(scheme) => {
                if let Ok(Some(adapter)) = self.adapter(scheme) {
                    adapter.cancel(call.id(), link);
                }
            }
            None => {
                // An out-leg expressed as a session: stop it.
                if let Some(session_id) = link.session_id() {
                    if let Ok(session) = self.session(&session_id) {
                        let _ = session.stop(crate::common::Reason::OriginatorCancel);
                    }
                }
            }
        }
    }

    ////////////////////////////////////////////////////////////////////////
    // Event dispatch
    ////////////////////////////////////////////////////////////////////////

    /// Deliver an event to every direct observer of its subject and to
    /// the topic bus.
    pub fn publish(&self, event: &Event) {
        let deliveries = self
            .inner
            .fabric
            .fold(&event.subject, Vec::new(), |mut acc, entry| {
                acc.push((entry.link.clone(), entry.payload.clone()));
                acc
            });
        match deliveries {
            Ok(deliveries) => {
                for (link, payload) in deliveries {
                    self.deliver(&link, event, payload.as_ref());
                }
            }
            Err(e) => error!("publish: fabric fold failed: {}", e),
        }
        if let Err(e) = self.inner.bus.publish(event) {
            error!("publish: bus dispatch failed: {}", e);
        }
    }

    fn deliver(&self, link: &Link, event: &Event, payload: Option<&serde_json::Value>) {
        match link {
            Link::Session { id, .. } => {
                if let Ok(session) = self.session(id) {
                    let _ = session.inject_observed(event.clone());
                }
            }
            Link::Call { id, .. } => {
                if let Ok(call) = self.call(id) {
                    let _ = call.inject_observed(event.clone());
                }
            }
            _ => {
                if let Some(scheme) = link.scheme() {
                    if let Ok(Some(adapter)) = self.adapter(scheme) {
                        adapter.deliver_event(link, event, payload);
                    }
                }
            }
        }
    }

    ////////////////////////////////////////////////////////////////////////
    // Lifetime reaping
    ////////////////////////////////////////////////////////////////////////

    /// Arrange for the reaper to learn when `lifetime` ends.
    pub fn watch_lifetime(&self, lifetime: &Lifetime) {
        lifetime.watch(self.inner.reaper_tx.clone());
    }

    fn route_lifetime_end(&self, lifetime: LifetimeId) -> Result<()> {
        debug!("reaper: lifetime ended: {}", lifetime);
        let dead = self.inner.fabric.on_lifetime_end(lifetime)?;
        for (subject, entry) in dead {
            match subject {
                SubjectId::Session(session_id) => {
                    if let Ok(session) = self.session(&session_id) {
                        let _ = session.inject_observer_died(entry.role, entry.link);
                    }
                }
                SubjectId::Call(call_id) => {
                    if let Ok(call) = self.call(&call_id) {
                        let _ = call.inject_observer_died(entry.role, entry.link);
                    }
                }
                SubjectId::Room(_) => {}
            }
        }
        // Topic subscriptions survive the grace window so subjects
        // stopped by this death can land their final event first.
        let hub = self.clone();
        self.runtime().spawn(async move {
            tokio::time::sleep(crate::common::STOP_GRACE * 2).await;
            if let Err(e) = hub.inner.bus.on_lifetime_end(lifetime) {
                error!("reaper: bus cleanup failed: {}", e);
            }
        });
        Ok(())
    }

    /// Shut the worker runtime down. Call from outside any hub task.
    pub fn close(&self) {
        info!("close()");
        if let Ok(mut runtime) = self.inner.runtime.guarded("runtime") {
            if let Some(rt) = runtime.take() {
                rt.shutdown_background();
            }
        }
    }
}
