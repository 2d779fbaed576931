use std::time::Instant;

use serde_json::json;
use ulid::Ulid;

use crate::directory::Capability;
use crate::limits::MAX_NAME_LEN;
use crate::model::*;
use crate::settings::validate_setting;

use super::{now_ms, AuditTarget, Engine, EngineError};

fn clean_name(name: &str) -> Result<String, EngineError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(EngineError::bad_request("name is required"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(name.to_string())
}

impl Engine {
    pub async fn create_building(&self, actor: Ulid, name: String) -> Result<Ulid, EngineError> {
        let started = Instant::now();
        let result = self.try_create_building(actor, &name).await;
        let target = AuditTarget {
            actor,
            target_type: "building",
            target_id: result.as_ref().ok().copied(),
            diff: Some(json!({ "name": name })),
        };
        self.conclude("building.create", started, target, result)
    }

    async fn try_create_building(&self, actor: Ulid, name: &str) -> Result<Ulid, EngineError> {
        self.require_capability(actor, Capability::ManageCatalog)
            .await?;
        let building = BuildingInfo {
            id: Ulid::new(),
            name: clean_name(name)?,
            enabled: true,
            deleted_at: None,
        };
        let id = building.id;
        self.persist(vec![Event::BuildingCreated { building }]).await?;
        Ok(id)
    }

    pub async fn create_room(
        &self,
        actor: Ulid,
        building_id: Ulid,
        floor: i32,
        name: String,
        capacity: Option<u32>,
    ) -> Result<Ulid, EngineError> {
        let started = Instant::now();
        let result = self
            .try_create_room(actor, building_id, floor, &name, capacity)
            .await;
        let target = AuditTarget {
            actor,
            target_type: "room",
            target_id: result.as_ref().ok().copied(),
            diff: Some(json!({
                "building_id": building_id,
                "floor": floor,
                "name": name,
                "capacity": capacity,
            })),
        };
        self.conclude("room.create", started, target, result)
    }

    async fn try_create_room(
        &self,
        actor: Ulid,
        building_id: Ulid,
        floor: i32,
        name: &str,
        capacity: Option<u32>,
    ) -> Result<Ulid, EngineError> {
        self.require_capability(actor, Capability::ManageCatalog)
            .await?;
        let building = self
            .store
            .building(&building_id)
            .filter(|b| b.deleted_at.is_none())
            .ok_or(EngineError::not_found("building", building_id))?;
        if capacity == Some(0) {
            return Err(EngineError::bad_request("capacity must be positive"));
        }
        let room = RoomInfo {
            id: Ulid::new(),
            building_id: building.id,
            floor,
            name: clean_name(name)?,
            capacity,
            enabled: true,
            deleted_at: None,
        };
        let id = room.id;
        self.persist(vec![Event::RoomCreated { room }]).await?;
        Ok(id)
    }

    pub async fn set_building_enabled(
        &self,
        actor: Ulid,
        building_id: Ulid,
        enabled: bool,
    ) -> Result<(), EngineError> {
        let started = Instant::now();
        let result = async {
            self.require_capability(actor, Capability::ManageCatalog)
                .await?;
            self.live_building(building_id)?;
            self.persist(vec![Event::BuildingEnabled {
                id: building_id,
                enabled,
            }])
            .await
        }
        .await;
        let target = AuditTarget {
            actor,
            target_type: "building",
            target_id: Some(building_id),
            diff: Some(json!({ "enabled": enabled })),
        };
        self.conclude("building.set_enabled", started, target, result)
    }

    /// Soft delete. The building stays in the store with its marker set.
    pub async fn delete_building(&self, actor: Ulid, building_id: Ulid) -> Result<(), EngineError> {
        let started = Instant::now();
        let result = async {
            self.require_capability(actor, Capability::ManageCatalog)
                .await?;
            self.live_building(building_id)?;
            self.persist(vec![Event::BuildingDeleted {
                id: building_id,
                at: now_ms(),
            }])
            .await
        }
        .await;
        let target = AuditTarget {
            actor,
            target_type: "building",
            target_id: Some(building_id),
            diff: None,
        };
        self.conclude("building.delete", started, target, result)
    }

    pub async fn set_room_enabled(
        &self,
        actor: Ulid,
        room_id: Ulid,
        enabled: bool,
    ) -> Result<(), EngineError> {
        let started = Instant::now();
        let result = self
            .update_room(actor, room_id, Event::RoomEnabled { id: room_id, enabled })
            .await;
        let target = AuditTarget {
            actor,
            target_type: "room",
            target_id: Some(room_id),
            diff: Some(json!({ "enabled": enabled })),
        };
        self.conclude("room.set_enabled", started, target, result)
    }

    /// Soft delete. Existing reservations keep pointing at the room.
    pub async fn delete_room(&self, actor: Ulid, room_id: Ulid) -> Result<(), EngineError> {
        let started = Instant::now();
        let result = self
            .update_room(
                actor,
                room_id,
                Event::RoomDeleted {
                    id: room_id,
                    at: now_ms(),
                },
            )
            .await;
        let target = AuditTarget {
            actor,
            target_type: "room",
            target_id: Some(room_id),
            diff: None,
        };
        self.conclude("room.delete", started, target, result)
    }

    /// Room flag changes go through the room lock so they serialize with bookings.
    async fn update_room(&self, actor: Ulid, room_id: Ulid, event: Event) -> Result<(), EngineError> {
        self.require_capability(actor, Capability::ManageCatalog)
            .await?;
        let rs = self.store.require_room(room_id)?;
        let mut guard = rs.write().await;
        if guard.room.deleted_at.is_some() {
            return Err(EngineError::not_found("room", room_id));
        }
        self.persist_room_event(&mut guard, event).await
    }

    fn live_building(&self, building_id: Ulid) -> Result<BuildingInfo, EngineError> {
        self.store
            .building(&building_id)
            .filter(|b| b.deleted_at.is_none())
            .ok_or(EngineError::not_found("building", building_id))
    }

    /// Change a business setting. Writing the current value again is a no-op.
    pub async fn set_setting(
        &self,
        actor: Ulid,
        key: String,
        value: SettingValue,
    ) -> Result<(), EngineError> {
        let started = Instant::now();
        let result = async {
            self.require_capability(actor, Capability::ManageConfig)
                .await?;
            validate_setting(&key, &value).map_err(EngineError::BadRequest)?;
            if self.store.settings().get(&key) == Some(value) {
                return Ok(());
            }
            self.persist(vec![Event::SettingChanged {
                key: key.clone(),
                value,
            }])
            .await
        }
        .await;
        let target = AuditTarget {
            actor,
            target_type: "setting",
            target_id: None,
            diff: Some(json!({ "key": key, "value": value })),
        };
        self.conclude("setting.set", started, target, result)
    }
}
