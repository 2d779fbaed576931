use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::validate_timestamps;
use super::{Engine, EngineError, SharedRoomState};

/// Listing filter. Every field is optional; set fields combine with AND.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReservationFilter {
    pub room_id: Option<Ulid>,
    pub building_id: Option<Ulid>,
    pub floor: Option<i32>,
    pub status: Option<ReservationStatus>,
    pub applicant_id: Option<Ulid>,
    /// Keep reservations overlapping this range.
    pub range: Option<Span>,
}

impl ReservationFilter {
    fn matches_room(&self, room: &RoomInfo) -> bool {
        self.room_id.is_none_or(|id| id == room.id)
            && self.building_id.is_none_or(|id| id == room.building_id)
            && self.floor.is_none_or(|f| f == room.floor)
    }

    fn matches(&self, r: &Reservation) -> bool {
        self.status.is_none_or(|s| s == r.status)
            && self.applicant_id.is_none_or(|id| id == r.applicant_id)
            && self.range.is_none_or(|range| range.overlaps(&r.span))
    }
}

impl Engine {
    pub async fn get_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let room_id = self
            .store
            .room_for_reservation(&id)
            .ok_or(EngineError::not_found("reservation", id))?;
        let rs = self.store.require_room(room_id)?;
        let guard = rs.read().await;
        guard
            .reservation(id)
            .cloned()
            .ok_or(EngineError::not_found("reservation", id))
    }

    /// One page of matching reservations, newest start first. `page` is 1-based;
    /// a zero page size means the default, and oversized pages are capped.
    pub async fn list_reservations(
        &self,
        filter: &ReservationFilter,
        page: usize,
        page_size: usize,
    ) -> Result<Page<ReservationSummary>, EngineError> {
        if let Some(range) = filter.range
            && range.start >= range.end
        {
            return Err(EngineError::bad_request("range end must be after start"));
        }
        let page = page.max(1);
        let page_size = match page_size {
            0 => DEFAULT_PAGE_SIZE,
            n => n.min(MAX_PAGE_SIZE),
        };

        let rooms: Vec<SharedRoomState> = match filter.room_id {
            Some(id) => self.store.room(&id).into_iter().collect(),
            None => self.store.rooms(),
        };

        let mut items = Vec::new();
        for rs in rooms {
            let guard = rs.read().await;
            if !filter.matches_room(&guard.room) {
                continue;
            }
            items.extend(
                guard
                    .reservations
                    .iter()
                    .filter(|r| filter.matches(r))
                    .map(|r| ReservationSummary::of(&guard.room, r)),
            );
        }
        items.sort_by(|a, b| b.start.cmp(&a.start).then(a.id.cmp(&b.id)));

        let total = items.len();
        let items = items
            .into_iter()
            .skip((page - 1).saturating_mul(page_size))
            .take(page_size)
            .collect();
        Ok(Page {
            items,
            total,
            page,
            page_size,
        })
    }

    /// Usable rooms on one floor and every holding reservation on them inside
    /// `[from, from + window_days)`.
    pub async fn floor_overview(
        &self,
        building_id: Ulid,
        floor: i32,
        from: Ms,
        window_days: u32,
    ) -> Result<FloorOverview, EngineError> {
        if window_days == 0 {
            return Err(EngineError::bad_request("window must be at least one day"));
        }
        if window_days > MAX_OVERVIEW_DAYS {
            return Err(EngineError::LimitExceeded("overview window too long"));
        }
        validate_timestamps(from, from)?;
        let window = Span::new(from, from + window_days as Ms * DAY);
        self.store
            .building(&building_id)
            .filter(|b| b.is_usable())
            .ok_or(EngineError::not_found("building", building_id))?;

        let mut rooms = Vec::new();
        let mut reservations = Vec::new();
        for rs in self.store.rooms() {
            let guard = rs.read().await;
            let room = &guard.room;
            if room.building_id != building_id || room.floor != floor || !room.is_usable() {
                continue;
            }
            reservations.extend(
                guard
                    .overlapping(&window)
                    .filter(|r| r.status.holds_room())
                    .map(|r| ReservationSummary::of(room, r)),
            );
            rooms.push(room.clone());
        }
        rooms.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        reservations.sort_by(|a, b| a.start.cmp(&b.start).then(a.id.cmp(&b.id)));

        Ok(FloorOverview {
            building_id,
            floor,
            window,
            rooms,
            reservations,
        })
    }
}
