//
// Copyright 2019-2024 MediaHub Authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Room registry.
//!
//! MCU rooms come into being implicitly when the first leg joins, or
//! explicitly through the external API. Membership follows session
//! `type_ext` changes; implicit rooms evaporate with their last
//! member.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::{json, Value};

use crate::common::{LockGuarded, Result, ServiceId, SessionId, SessionType};
use crate::core::event::{Event, EventKind, SubjectId};
use crate::core::session::Session;
use crate::error::HubError;

#[derive(Clone, Debug)]
pub struct Room {
    pub room_id: String,
    pub service: ServiceId,
    pub room_type: String,
    pub members: Vec<SessionId>,
    /// Created through the API rather than by a joining leg; survives
    /// emptiness.
    pub explicit: bool,
}

impl Room {
    pub fn info(&self) -> Value {
        json!({
            "room_id": self.room_id,
            "service": self.service,
            "room_type": self.room_type,
            "members": self.members,
        })
    }
}

#[derive(Default)]
struct RoomState {
    rooms: HashMap<(ServiceId, String), Room>,
    /// session -> room key, for membership moves and stop cleanup.
    membership: HashMap<SessionId, (ServiceId, String)>,
}

pub struct RoomRegistry {
    state: Mutex<RoomState>,
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RoomState::default()),
        }
    }

    pub fn create(
        &self,
        service: &ServiceId,
        room_id: &str,
        room_type: &str,
        explicit: bool,
    ) -> Result<Option<Event>> {
        let key = (service.clone(), room_id.to_string());
        let mut state = self.state.guarded("rooms")?;
        if state.rooms.contains_key(&key) {
            if explicit {
                return Err(HubError::InvalidParams(format!("room exists: {}", room_id)).into());
            }
            return Ok(None);
        }
        state.rooms.insert(
            key,
            Room {
                room_id: room_id.to_string(),
                service: service.clone(),
                room_type: room_type.to_string(),
                members: Vec::new(),
                explicit,
            },
        );
        Ok(Some(room_event(
            service,
            room_id,
            "room_created",
            json!({ "room_type": room_type }),
        )))
    }

    pub fn destroy(&self, service: &ServiceId, room_id: &str) -> Result<Event> {
        let key = (service.clone(), room_id.to_string());
        let mut state = self.state.guarded("rooms")?;
        match state.rooms.remove(&key) {
            Some(room) => {
                for member in &room.members {
                    state.membership.remove(member);
                }
                Ok(room_event(service, room_id, "room_destroyed", Value::Null))
            }
            None => Err(HubError::RoomNotFound(room_id.to_string()).into()),
        }
    }

    pub fn list(&self, service: &ServiceId) -> Result<Vec<String>> {
        let state = self.state.guarded("rooms")?;
        Ok(state
            .rooms
            .values()
            .filter(|room| &room.service == service)
            .map(|room| room.room_id.clone())
            .collect())
    }

    pub fn info(&self, service: &ServiceId, room_id: &str) -> Result<Value> {
        let state = self.state.guarded("rooms")?;
        match state.rooms.get(&(service.clone(), room_id.to_string())) {
            Some(room) => Ok(room.info()),
            None => Err(HubError::RoomNotFound(room_id.to_string()).into()),
        }
    }

    /// Reconcile a session's room membership with its current type;
    /// called on every type change.
    pub fn sync_session(&self, session: &Session) -> Result<()> {
        let session_type = session.session_type()?;
        let type_ext = session.type_ext()?;
        let target = if session_type == SessionType::Mcu {
            type_ext.room_id.clone()
        } else {
            None
        };
        let mut events = Vec::new();
        {
            let mut state = self.state.guarded("rooms")?;
            let current = state.membership.get(&session.id()).cloned();
            let service = session.service().clone();
            let target_key = target
                .as_ref()
                .map(|room_id| (service.clone(), room_id.clone()));
            if current == target_key {
                return Ok(());
            }
            if let Some(old_key) = current {
                leave(&mut state, &session.id(), &old_key, &mut events);
            }
            if let Some(room_id) = target {
                let key = (service.clone(), room_id.clone());
                let room_type = type_ext
                    .room_type
                    .clone()
                    .unwrap_or_else(|| crate::backend::fs::DEFAULT_ROOM_TYPE.to_string());
                if !state.rooms.contains_key(&key) {
                    state.rooms.insert(
                        key.clone(),
                        Room {
                            room_id: room_id.clone(),
                            service: service.clone(),
                            room_type: room_type.clone(),
                            members: Vec::new(),
                            explicit: false,
                        },
                    );
                    events.push(room_event(
                        &service,
                        &room_id,
                        "room_created",
                        json!({ "room_type": room_type }),
                    ));
                }
                if let Some(room) = state.rooms.get_mut(&key) {
                    room.members.push(session.id());
                }
                state.membership.insert(session.id(), key);
                events.push(room_event(
                    &service,
                    &room_id,
                    "member_joined",
                    json!({ "session_id": session.id() }),
                ));
            }
        }
        for event in events {
            session.hub().publish(&event);
        }
        Ok(())
    }

    pub fn on_session_stopped(&self, session: &Session) -> Result<()> {
        let mut events = Vec::new();
        {
            let mut state = self.state.guarded("rooms")?;
            if let Some(key) = state.membership.get(&session.id()).cloned() {
                leave(&mut state, &session.id(), &key, &mut events);
            }
        }
        for event in events {
            session.hub().publish(&event);
        }
        Ok(())
    }
}

fn leave(
    state: &mut RoomState,
    session_id: &SessionId,
    key: &(ServiceId, String),
    events: &mut Vec<Event>,
) {
    state.membership.remove(session_id);
    let mut destroyed = false;
    if let Some(room) = state.rooms.get_mut(key) {
        room.members.retain(|member| member != session_id);
        events.push(room_event(
            &key.0,
            &key.1,
            "member_left",
            json!({ "session_id": session_id }),
        ));
        destroyed = room.members.is_empty() && !room.explicit;
    }
    if destroyed {
        state.rooms.remove(key);
        events.push(room_event(&key.0, &key.1, "room_destroyed", Value::Null));
    }
}

fn room_event(service: &ServiceId, room_id: &str, tag: &str, detail: Value) -> Event {
    Event::new(
        SubjectId::Room(room_id.to_string()),
        service.clone(),
        EventKind::Room {
            tag: tag.to_string(),
            detail,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_create_then_duplicate_fails() {
        let rooms = RoomRegistry::new();
        let service = ServiceId::new("svc");
        assert!(rooms
            .create(&service, "r1", "video-mcu-stereo", true)
            .unwrap()
            .is_some());
        assert!(rooms.create(&service, "r1", "video-mcu-stereo", true).is_err());
        assert_eq!(rooms.list(&service).unwrap(), vec!["r1".to_string()]);
    }

    #[test]
    fn destroy_unknown_room_errors() {
        let rooms = RoomRegistry::new();
        assert!(rooms.destroy(&ServiceId::new("svc"), "nope").is_err());
    }
}
