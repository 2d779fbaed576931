use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;
use crate::settings::Settings;

use super::EngineError;

pub type SharedRoomState = Arc<RwLock<RoomState>>;

/// Durable state as of the last applied commit. Room timelines sit behind
/// their own lock; everything else is a DashMap index.
pub struct Store {
    buildings: DashMap<Ulid, BuildingInfo>,
    rooms: DashMap<Ulid, SharedRoomState>,
    /// Reverse lookup: reservation id → room id
    reservation_to_room: DashMap<Ulid, Ulid>,
    /// Bans per user in creation order.
    bans: DashMap<Ulid, Vec<Ban>>,
    ban_to_user: DashMap<Ulid, Ulid>,
    settings: Arc<Settings>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Self {
            buildings: DashMap::new(),
            rooms: DashMap::new(),
            reservation_to_room: DashMap::new(),
            bans: DashMap::new(),
            ban_to_user: DashMap::new(),
            settings: Arc::new(Settings::new()),
        }
    }

    /// Rebuild state from replayed commits. Nothing else holds the room
    /// handles yet, so each timeline is borrowed mutably without locking.
    pub fn from_commits(commits: &[Commit]) -> Self {
        let store = Self::new();
        for event in commits.iter().flatten() {
            match room_scope(event) {
                Some(room_id) => {
                    if let Some(mut entry) = store.rooms.get_mut(&room_id)
                        && let Some(lock) = Arc::get_mut(entry.value_mut())
                    {
                        store.apply_to_room(lock.get_mut(), event);
                    }
                }
                None => store.apply(event),
            }
        }
        store
    }

    // ── Lookups ──────────────────────────────────────────────

    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    pub fn building(&self, id: &Ulid) -> Option<BuildingInfo> {
        self.buildings.get(id).map(|b| b.value().clone())
    }

    pub fn buildings(&self) -> Vec<BuildingInfo> {
        self.buildings.iter().map(|b| b.value().clone()).collect()
    }

    pub fn room(&self, id: &Ulid) -> Option<SharedRoomState> {
        self.rooms.get(id).map(|e| e.value().clone())
    }

    pub fn require_room(&self, id: Ulid) -> Result<SharedRoomState, EngineError> {
        self.room(&id).ok_or(EngineError::not_found("room", id))
    }

    /// Rooms sorted by id so multi-room readers visit them in a stable order.
    pub fn rooms(&self) -> Vec<SharedRoomState> {
        let mut all: Vec<(Ulid, SharedRoomState)> = self
            .rooms
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        all.sort_by_key(|(id, _)| *id);
        all.into_iter().map(|(_, rs)| rs).collect()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn room_for_reservation(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.reservation_to_room.get(reservation_id).map(|e| *e.value())
    }

    pub fn bans_for(&self, user_id: &Ulid) -> Vec<Ban> {
        self.bans
            .get(user_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    pub fn ban(&self, ban_id: &Ulid) -> Option<Ban> {
        let user_id = *self.ban_to_user.get(ban_id)?.value();
        self.bans
            .get(&user_id)?
            .iter()
            .find(|b| b.id == *ban_id)
            .cloned()
    }

    // ── Event application ────────────────────────────────────

    /// Apply a room-scoped event. Caller holds the room's write lock.
    pub fn apply_to_room(&self, rs: &mut RoomState, event: &Event) {
        match event {
            Event::RoomEnabled { enabled, .. } => rs.room.enabled = *enabled,
            Event::RoomDeleted { at, .. } => rs.room.deleted_at = Some(*at),
            Event::ReservationCreated { reservation } => {
                self.reservation_to_room.insert(reservation.id, rs.room.id);
                rs.insert_reservation(reservation.clone());
            }
            Event::ReservationResubmitted {
                id,
                span,
                purpose,
                status,
                review,
                participants,
                by,
                at,
                ..
            } => {
                // Re-insert so the timeline stays sorted by the new start.
                if let Some(mut r) = rs.remove_reservation(*id) {
                    r.span = *span;
                    r.purpose = purpose.clone();
                    r.status = *status;
                    r.review = review.clone();
                    r.cancellation = None;
                    r.participants = participants.clone();
                    r.updated_by = *by;
                    r.updated_at = *at;
                    rs.insert_reservation(r);
                }
            }
            Event::ReservationApproved { id, review, .. } => {
                if let Some(r) = rs.reservation_mut(*id) {
                    r.status = ReservationStatus::Approved;
                    r.review = Some(review.clone());
                    r.updated_by = review.reviewer_id;
                    r.updated_at = review.reviewed_at;
                }
            }
            Event::ReservationRejected { id, review, .. } => {
                if let Some(r) = rs.reservation_mut(*id) {
                    r.status = ReservationStatus::Rejected;
                    r.review = Some(review.clone());
                    r.updated_by = review.reviewer_id;
                    r.updated_at = review.reviewed_at;
                }
            }
            Event::ReservationCancelled { id, cancellation, .. } => {
                if let Some(r) = rs.reservation_mut(*id) {
                    r.status = ReservationStatus::Cancelled;
                    r.cancellation = Some(cancellation.clone());
                    r.updated_by = cancellation.cancelled_by;
                    r.updated_at = cancellation.cancelled_at;
                }
            }
            _ => {}
        }
    }

    /// Apply an event that is not scoped to an existing room.
    pub fn apply(&self, event: &Event) {
        match event {
            Event::BuildingCreated { building } => {
                self.buildings.insert(building.id, building.clone());
            }
            Event::BuildingEnabled { id, enabled } => {
                if let Some(mut b) = self.buildings.get_mut(id) {
                    b.enabled = *enabled;
                }
            }
            Event::BuildingDeleted { id, at } => {
                if let Some(mut b) = self.buildings.get_mut(id) {
                    b.deleted_at = Some(*at);
                }
            }
            Event::RoomCreated { room } => {
                let rs = RoomState::new(room.clone());
                self.rooms.insert(room.id, Arc::new(RwLock::new(rs)));
            }
            Event::BanIssued { ban } => {
                self.ban_to_user.insert(ban.id, ban.user_id);
                self.bans.entry(ban.user_id).or_default().push(ban.clone());
            }
            Event::BanRevoked {
                id,
                user_id,
                revocation,
            } => {
                if let Some(mut bans) = self.bans.get_mut(user_id)
                    && let Some(ban) = bans.iter_mut().find(|b| b.id == *id)
                {
                    ban.revocation = Some(revocation.clone());
                }
            }
            Event::SettingChanged { key, value } => self.settings.set(key, *value),
            _ => {}
        }
    }

    /// One commit that recreates the current state. Meant for a store nobody
    /// else holds, such as one just rebuilt by [`Store::from_commits`]; a room
    /// locked elsewhere fails the snapshot instead of being skipped.
    pub fn snapshot(&self) -> Result<Commit, EngineError> {
        let mut events = Vec::new();

        for (key, value) in self.settings.snapshot() {
            events.push(Event::SettingChanged { key, value });
        }

        let mut buildings = self.buildings();
        buildings.sort_by_key(|b| b.id);
        for building in buildings {
            events.push(Event::BuildingCreated { building });
        }

        for rs in self.rooms() {
            let guard = rs
                .try_read()
                .map_err(|_| EngineError::Storage("room locked during snapshot".into()))?;
            events.push(Event::RoomCreated {
                room: guard.room.clone(),
            });
            for reservation in &guard.reservations {
                events.push(Event::ReservationCreated {
                    reservation: reservation.clone(),
                });
            }
        }

        let mut users: Vec<Ulid> = self.bans.iter().map(|e| *e.key()).collect();
        users.sort();
        for user in users {
            for ban in self.bans_for(&user) {
                events.push(Event::BanIssued { ban });
            }
        }

        Ok(events)
    }
}

/// The room an event must be applied under, for events on existing rooms.
pub(crate) fn room_scope(event: &Event) -> Option<Ulid> {
    match event {
        Event::RoomEnabled { id, .. } | Event::RoomDeleted { id, .. } => Some(*id),
        Event::ReservationCreated { reservation } => Some(reservation.room_id),
        Event::ReservationResubmitted { room_id, .. }
        | Event::ReservationApproved { room_id, .. }
        | Event::ReservationRejected { room_id, .. }
        | Event::ReservationCancelled { room_id, .. } => Some(*room_id),
        Event::BuildingCreated { .. }
        | Event::BuildingEnabled { .. }
        | Event::BuildingDeleted { .. }
        | Event::RoomCreated { .. }
        | Event::BanIssued { .. }
        | Event::BanRevoked { .. }
        | Event::SettingChanged { .. } => None,
    }
}
