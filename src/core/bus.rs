//
// Copyright 2019-2024 MediaHub Authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Event Bus.
//!
//! Topic side of event dispatch: subscribers register a filter keyed by
//! (service, subject class, instance id) and receive every matching
//! event over a non-blocking mailbox. Direct observer dispatch happens
//! in the hub against the fabric; the bus only handles the broadcast
//! form.

use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;

use crate::common::{LockGuarded, Result, ServiceId};
use crate::core::event::{Event, SubjectClass, SubjectId};
use crate::core::lifetime::Lifetime;

/// What a subscriber wants to see. `None` matches everything in that
/// position.
#[derive(Clone, Debug)]
pub struct TopicFilter {
    pub service: ServiceId,
    pub class: Option<SubjectClass>,
    pub subject: Option<SubjectId>,
}

impl TopicFilter {
    pub fn matches(&self, event: &Event) -> bool {
        if self.service != event.service {
            return false;
        }
        if let Some(class) = self.class {
            if class != event.subject.class() {
                return false;
            }
        }
        if let Some(subject) = &self.subject {
            if subject != &event.subject {
                return false;
            }
        }
        true
    }
}

struct TopicSub {
    filter: TopicFilter,
    tx: UnboundedSender<Event>,
    /// Attached to every event this subscriber receives.
    body: Option<Value>,
    lifetime: Lifetime,
}

pub struct Bus {
    subs: Mutex<Vec<TopicSub>>,
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus {
    pub fn new() -> Self {
        Self {
            subs: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(
        &self,
        filter: TopicFilter,
        tx: UnboundedSender<Event>,
        body: Option<Value>,
        lifetime: Lifetime,
    ) -> Result<()> {
        let mut subs = self.subs.guarded("bus")?;
        subs.push(TopicSub {
            filter,
            tx,
            body,
            lifetime,
        });
        Ok(())
    }

    /// Fan an event out to every matching subscriber. A subscription
    /// whose lifetime ended still receives events until the reaper's
    /// delayed cleanup runs, so a subject's final event reaches the
    /// topic before the subscription vanishes.
    pub fn publish(&self, event: &Event) -> Result<()> {
        let mut subs = self.subs.guarded("bus")?;
        subs.retain(|sub| {
            if sub.filter.matches(event) {
                // Non-blocking send; a closed mailbox drops the sub.
                return sub.tx.send(event.with_body(sub.body.clone())).is_ok();
            }
            true
        });
        Ok(())
    }

    /// Drop every subscription registered under a lifetime.
    pub fn on_lifetime_end(&self, lifetime: crate::common::LifetimeId) -> Result<()> {
        let mut subs = self.subs.guarded("bus")?;
        subs.retain(|sub| sub.lifetime.id() != lifetime);
        Ok(())
    }

    pub fn subscriber_count(&self) -> Result<usize> {
        Ok(self.subs.guarded("bus")?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Reason, SessionId};
    use crate::core::event::EventKind;
    use serde_json::json;
    use tokio::sync::mpsc::unbounded_channel;

    fn stop_event(service: &str, id: SessionId) -> Event {
        Event::new(
            SubjectId::Session(id),
            ServiceId::new(service),
            EventKind::Stop {
                reason: Reason::Timeout,
            },
        )
    }

    #[test]
    fn topic_filter_scopes_by_service_and_class() {
        let bus = Bus::new();
        let (lifetime, _guard) = Lifetime::create();
        let (tx, mut rx) = unbounded_channel();
        bus.subscribe(
            TopicFilter {
                service: ServiceId::new("svc"),
                class: Some(SubjectClass::Session),
                subject: None,
            },
            tx,
            None,
            lifetime,
        )
        .unwrap();

        bus.publish(&stop_event("svc", SessionId::random())).unwrap();
        bus.publish(&stop_event("other", SessionId::random()))
            .unwrap();

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn subscriber_body_is_attached() {
        let bus = Bus::new();
        let (lifetime, _guard) = Lifetime::create();
        let (tx, mut rx) = unbounded_channel();
        bus.subscribe(
            TopicFilter {
                service: ServiceId::new("svc"),
                class: None,
                subject: None,
            },
            tx,
            Some(json!({"marker": 7})),
            lifetime,
        )
        .unwrap();

        bus.publish(&stop_event("svc", SessionId::random())).unwrap();
        let event = rx.try_recv().unwrap();
        assert_eq!(event.body.unwrap()["marker"], 7);
    }

    #[test]
    fn final_event_still_delivered_after_lifetime_end() {
        let bus = Bus::new();
        let (lifetime, guard) = Lifetime::create();
        let (tx, mut rx) = unbounded_channel();
        bus.subscribe(
            TopicFilter {
                service: ServiceId::new("svc"),
                class: None,
                subject: None,
            },
            tx,
            None,
            lifetime.clone(),
        )
        .unwrap();
        guard.end();
        // Events published between the lifetime ending and the
        // reaper's cleanup still reach the subscriber.
        bus.publish(&stop_event("svc", SessionId::random())).unwrap();
        assert!(rx.try_recv().is_ok());

        bus.on_lifetime_end(lifetime.id()).unwrap();
        bus.publish(&stop_event("svc", SessionId::random())).unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(bus.subscriber_count().unwrap(), 0);
    }
}
