use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

pub const SECOND: Ms = 1_000;
pub const MINUTE: Ms = 60 * SECOND;
pub const HOUR: Ms = 60 * MINUTE;
pub const DAY: Ms = 24 * HOUR;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Checked constructor for untrusted input; `None` unless `start < end`.
    pub fn try_new(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Back-to-back spans (`a.end == b.start`) do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Length of the part of `self` that falls inside `window`, zero when disjoint.
    pub fn clipped_ms(&self, window: &Span) -> Ms {
        (self.end.min(window.end) - self.start.max(window.start)).max(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Pending,
    Approved,
    Rejected,
    Cancelled,
}

impl ReservationStatus {
    /// Pending and approved reservations occupy the room's timeline.
    pub fn holds_room(self) -> bool {
        matches!(self, ReservationStatus::Pending | ReservationStatus::Approved)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Approved => "approved",
            ReservationStatus::Rejected => "rejected",
            ReservationStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Review {
    pub reviewer_id: Ulid,
    pub reviewed_at: Ms,
    pub reject_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cancellation {
    pub cancelled_by: Ulid,
    pub cancelled_at: Ms,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: Ulid,
    pub is_applicant: bool,
}

/// One booking of one room for one contiguous span. Never physically deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub room_id: Ulid,
    pub applicant_id: Ulid,
    pub purpose: String,
    pub span: Span,
    pub status: ReservationStatus,
    pub review: Option<Review>,
    pub cancellation: Option<Cancellation>,
    /// Applicant first, flagged `is_applicant`; the rest in request order.
    pub participants: Vec<Participant>,
    pub created_by: Ulid,
    pub created_at: Ms,
    pub updated_by: Ulid,
    pub updated_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildingInfo {
    pub id: Ulid,
    pub name: String,
    pub enabled: bool,
    pub deleted_at: Option<Ms>,
}

impl BuildingInfo {
    pub fn is_usable(&self) -> bool {
        self.enabled && self.deleted_at.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomInfo {
    pub id: Ulid,
    pub building_id: Ulid,
    pub floor: i32,
    pub name: String,
    pub capacity: Option<u32>,
    pub enabled: bool,
    pub deleted_at: Option<Ms>,
}

impl RoomInfo {
    pub fn is_usable(&self) -> bool {
        self.enabled && self.deleted_at.is_none()
    }
}

/// A room and its reservation timeline. The room's lock guards this whole struct.
#[derive(Debug, Clone)]
pub struct RoomState {
    pub room: RoomInfo,
    /// Every reservation ever made for the room, sorted by `span.start`.
    pub reservations: Vec<Reservation>,
}

impl RoomState {
    pub fn new(room: RoomInfo) -> Self {
        Self {
            room,
            reservations: Vec::new(),
        }
    }

    /// Insert reservation maintaining sort order by span.start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .partition_point(|r| r.span.start <= reservation.span.start);
        self.reservations.insert(pos, reservation);
    }

    pub fn remove_reservation(&mut self, id: Ulid) -> Option<Reservation> {
        let pos = self.reservations.iter().position(|r| r.id == id)?;
        Some(self.reservations.remove(pos))
    }

    pub fn reservation(&self, id: Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    pub fn reservation_mut(&mut self, id: Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == id)
    }

    /// Reservations (any status) whose span overlaps the query window.
    /// Uses binary search to skip reservations starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.span.end > query.start)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanRevocation {
    pub revoked_by: Ulid,
    pub revoked_at: Ms,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ban {
    pub id: Ulid,
    pub user_id: Ulid,
    pub reason: Option<String>,
    pub expires_at: Option<Ms>,
    pub created_by: Ulid,
    pub created_at: Ms,
    pub revocation: Option<BanRevocation>,
}

impl Ban {
    pub fn is_active(&self, now: Ms) -> bool {
        self.revocation.is_none() && self.expires_at.is_none_or(|at| at > now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SettingValue {
    Bool(bool),
    Number(f64),
}

/// The event types, flat with no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    BuildingCreated {
        building: BuildingInfo,
    },
    BuildingEnabled {
        id: Ulid,
        enabled: bool,
    },
    BuildingDeleted {
        id: Ulid,
        at: Ms,
    },
    RoomCreated {
        room: RoomInfo,
    },
    RoomEnabled {
        id: Ulid,
        enabled: bool,
    },
    RoomDeleted {
        id: Ulid,
        at: Ms,
    },
    /// Carries the full record so compaction can snapshot history as-is.
    ReservationCreated {
        reservation: Reservation,
    },
    ReservationResubmitted {
        id: Ulid,
        room_id: Ulid,
        span: Span,
        purpose: String,
        status: ReservationStatus,
        review: Option<Review>,
        participants: Vec<Participant>,
        by: Ulid,
        at: Ms,
    },
    ReservationApproved {
        id: Ulid,
        room_id: Ulid,
        review: Review,
    },
    ReservationRejected {
        id: Ulid,
        room_id: Ulid,
        review: Review,
    },
    ReservationCancelled {
        id: Ulid,
        room_id: Ulid,
        cancellation: Cancellation,
    },
    BanIssued {
        ban: Ban,
    },
    BanRevoked {
        id: Ulid,
        user_id: Ulid,
        revocation: BanRevocation,
    },
    SettingChanged {
        key: String,
        value: SettingValue,
    },
}

/// Events that must become durable together. One WAL entry per commit.
pub type Commit = Vec<Event>;

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationSummary {
    pub id: Ulid,
    pub room_id: Ulid,
    pub room_name: String,
    pub building_id: Ulid,
    pub floor: i32,
    pub applicant_id: Ulid,
    pub purpose: String,
    pub start: Ms,
    pub end: Ms,
    pub status: ReservationStatus,
    pub participant_count: usize,
}

impl ReservationSummary {
    pub fn of(room: &RoomInfo, r: &Reservation) -> Self {
        Self {
            id: r.id,
            room_id: room.id,
            room_name: room.name.clone(),
            building_id: room.building_id,
            floor: room.floor,
            applicant_id: r.applicant_id,
            purpose: r.purpose.clone(),
            start: r.span.start,
            end: r.span.end,
            status: r.status,
            participant_count: r.participants.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FloorOverview {
    pub building_id: Ulid,
    pub floor: i32,
    pub window: Span,
    pub rooms: Vec<RoomInfo>,
    pub reservations: Vec<ReservationSummary>,
}

/// Total occupied seconds for one room or one user inside a usage window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageEntry {
    pub id: Ulid,
    pub total_seconds: i64,
}
