use std::collections::HashSet;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::json;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::settings::Settings;

use super::admission::{resolve_admission, Admission};
use super::conflict::{find_conflict, validate_timestamps};
use super::error::RESTRICTED;
use super::{now_ms, optional_reason, AuditTarget, ConflictKind, Engine, EngineError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewReservation {
    pub applicant_id: Ulid,
    pub room_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub purpose: String,
    /// Everyone attending besides the applicant.
    #[serde(default)]
    pub other_participant_ids: Vec<Ulid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resubmission {
    pub applicant_id: Ulid,
    pub reservation_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub purpose: String,
    #[serde(default)]
    pub other_participant_ids: Vec<Ulid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Created {
    pub id: Ulid,
    pub status: ReservationStatus,
}

/// Booking input that passed every check that does not need the room lock.
struct Validated {
    span: Span,
    purpose: String,
    participants: Vec<Participant>,
    /// Policy the request was checked against; its status is the one stored.
    admission: Admission,
}

impl Engine {
    pub async fn create_reservation(&self, req: NewReservation) -> Result<Created, EngineError> {
        let started = Instant::now();
        let result = self.try_create_reservation(&req).await;
        let target = AuditTarget {
            actor: req.applicant_id,
            target_type: "reservation",
            target_id: result.as_ref().ok().map(|c| c.id),
            diff: Some(json!({
                "room_id": req.room_id,
                "start": req.start,
                "end": req.end,
                "status": result.as_ref().ok().map(|c| c.status),
            })),
        };
        self.conclude("reservation.create", started, target, result)
    }

    async fn try_create_reservation(&self, req: &NewReservation) -> Result<Created, EngineError> {
        let now = now_ms();
        let rs = self.store.require_room(req.room_id)?;
        {
            let guard = rs.read().await;
            self.check_room_usable(&guard.room)?;
        }
        let v = self
            .validate_booking(
                req.applicant_id,
                req.start,
                req.end,
                &req.purpose,
                &req.other_participant_ids,
                now,
            )
            .await?;

        // Lock, check, write. Everything below runs with the room held exclusively.
        let mut guard = rs.write().await;
        self.check_room_usable(&guard.room)?;
        if let Some(with) = find_conflict(&guard, &v.span, None) {
            return Err(ConflictKind::SlotTaken { with }.into());
        }
        let status = v.admission.initial_status;

        let id = Ulid::new();
        let reservation = Reservation {
            id,
            room_id: req.room_id,
            applicant_id: req.applicant_id,
            purpose: v.purpose,
            span: v.span,
            status,
            review: self_review(status, req.applicant_id, now),
            cancellation: None,
            participants: v.participants,
            created_by: req.applicant_id,
            created_at: now,
            updated_by: req.applicant_id,
            updated_at: now,
        };
        self.persist_room_event(&mut guard, Event::ReservationCreated { reservation })
            .await?;
        Ok(Created { id, status })
    }

    /// Edit-and-resubmit of a rejected reservation. Returns the new status.
    pub async fn resubmit_reservation(
        &self,
        req: Resubmission,
    ) -> Result<ReservationStatus, EngineError> {
        let started = Instant::now();
        let result = self.try_resubmit_reservation(&req).await;
        let target = AuditTarget {
            actor: req.applicant_id,
            target_type: "reservation",
            target_id: Some(req.reservation_id),
            diff: Some(json!({
                "start": req.start,
                "end": req.end,
                "status": result.as_ref().ok(),
            })),
        };
        self.conclude("reservation.resubmit", started, target, result)
    }

    async fn try_resubmit_reservation(
        &self,
        req: &Resubmission,
    ) -> Result<ReservationStatus, EngineError> {
        let now = now_ms();
        let room_id = self
            .store
            .room_for_reservation(&req.reservation_id)
            .ok_or(EngineError::not_found("reservation", req.reservation_id))?;
        let rs = self.store.require_room(room_id)?;
        {
            let guard = rs.read().await;
            check_resubmittable(&guard, req.reservation_id, req.applicant_id)?;
        }
        let v = self
            .validate_booking(
                req.applicant_id,
                req.start,
                req.end,
                &req.purpose,
                &req.other_participant_ids,
                now,
            )
            .await?;

        let mut guard = rs.write().await;
        check_resubmittable(&guard, req.reservation_id, req.applicant_id)?;
        if let Some(with) = find_conflict(&guard, &v.span, Some(req.reservation_id)) {
            return Err(ConflictKind::SlotTaken { with }.into());
        }
        let status = v.admission.initial_status;

        let event = Event::ReservationResubmitted {
            id: req.reservation_id,
            room_id,
            span: v.span,
            purpose: v.purpose,
            status,
            review: self_review(status, req.applicant_id, now),
            participants: v.participants,
            by: req.applicant_id,
            at: now,
        };
        self.persist_room_event(&mut guard, event).await?;
        Ok(status)
    }

    pub async fn cancel_reservation(
        &self,
        applicant_id: Ulid,
        reservation_id: Ulid,
        reason: Option<String>,
    ) -> Result<(), EngineError> {
        let started = Instant::now();
        let result = self
            .try_cancel_reservation(applicant_id, reservation_id, reason.clone())
            .await;
        let target = AuditTarget {
            actor: applicant_id,
            target_type: "reservation",
            target_id: Some(reservation_id),
            diff: reason.map(|r| json!({ "reason": r })),
        };
        self.conclude("reservation.cancel", started, target, result)
    }

    async fn try_cancel_reservation(
        &self,
        applicant_id: Ulid,
        reservation_id: Ulid,
        reason: Option<String>,
    ) -> Result<(), EngineError> {
        let now = now_ms();
        let reason = optional_reason(reason)?;
        let room_id = self
            .store
            .room_for_reservation(&reservation_id)
            .ok_or(EngineError::not_found("reservation", reservation_id))?;
        let rs = self.store.require_room(room_id)?;

        let mut guard = rs.write().await;
        let r = guard
            .reservation(reservation_id)
            .ok_or(EngineError::not_found("reservation", reservation_id))?;
        if r.applicant_id != applicant_id || !r.status.holds_room() {
            return Err(ConflictKind::NotCancellable.into());
        }
        if r.span.start <= now {
            return Err(ConflictKind::AlreadyStarted.into());
        }

        let event = Event::ReservationCancelled {
            id: reservation_id,
            room_id,
            cancellation: Cancellation {
                cancelled_by: applicant_id,
                cancelled_at: now,
                reason,
            },
        };
        self.persist_room_event(&mut guard, event).await
    }

    /// A room is bookable when it and its building are enabled and not deleted.
    fn check_room_usable(&self, room: &RoomInfo) -> Result<(), EngineError> {
        let building_ok = self
            .store
            .building(&room.building_id)
            .is_some_and(|b| b.is_usable());
        if !room.is_usable() || !building_ok {
            return Err(EngineError::not_found("room", room.id));
        }
        Ok(())
    }

    /// Checks shared by create and resubmit, in order: ban, interval, purpose,
    /// participant set, participant accounts.
    async fn validate_booking(
        &self,
        applicant_id: Ulid,
        start: Ms,
        end: Ms,
        purpose: &str,
        others: &[Ulid],
        now: Ms,
    ) -> Result<Validated, EngineError> {
        if self.is_banned_at(applicant_id, now) {
            return Err(EngineError::Forbidden(RESTRICTED));
        }

        validate_timestamps(start, end)?;
        if start <= now {
            return Err(EngineError::bad_request("start must be in the future"));
        }
        let span = Span::try_new(start, end)
            .ok_or_else(|| EngineError::bad_request("end must be after start"))?;
        let settings: &Settings = self.store.settings();
        let admission = resolve_admission(settings);
        admission.check_duration(&span)?;

        let purpose = purpose.trim();
        if purpose.is_empty() {
            return Err(EngineError::bad_request("purpose is required"));
        }
        if purpose.len() > MAX_PURPOSE_LEN {
            return Err(EngineError::LimitExceeded("purpose too long"));
        }

        if others.contains(&applicant_id) {
            return Err(EngineError::bad_request(
                "participant list must not include the applicant",
            ));
        }
        let mut seen = HashSet::from([applicant_id]);
        let mut participants = vec![Participant {
            user_id: applicant_id,
            is_applicant: true,
        }];
        for id in others {
            if seen.insert(*id) {
                participants.push(Participant {
                    user_id: *id,
                    is_applicant: false,
                });
            }
        }
        if participants.len() < MIN_PARTICIPANTS {
            return Err(EngineError::bad_request(format!(
                "at least {MIN_PARTICIPANTS} users including applicant"
            )));
        }
        if participants.len() > MAX_PARTICIPANTS {
            return Err(EngineError::LimitExceeded("too many participants"));
        }

        let ids: Vec<Ulid> = participants.iter().map(|p| p.user_id).collect();
        let mut invalid = self.directory.active_users(&ids).await.missing;
        for id in &ids {
            if !invalid.contains(id) && self.is_banned_at(*id, now) {
                invalid.push(*id);
            }
        }
        if !invalid.is_empty() {
            let list: Vec<String> = invalid.iter().map(Ulid::to_string).collect();
            return Err(EngineError::bad_request(format!(
                "invalid participants: {}",
                list.join(", ")
            )));
        }

        Ok(Validated {
            span,
            purpose: purpose.to_string(),
            participants,
            admission,
        })
    }
}

/// Policy-approved reservations carry the applicant as reviewer, which tells
/// them apart from staff-approved ones.
fn self_review(status: ReservationStatus, applicant_id: Ulid, now: Ms) -> Option<Review> {
    (status == ReservationStatus::Approved).then(|| Review {
        reviewer_id: applicant_id,
        reviewed_at: now,
        reject_reason: None,
    })
}

fn check_resubmittable(
    rs: &RoomState,
    reservation_id: Ulid,
    applicant_id: Ulid,
) -> Result<(), EngineError> {
    let r = rs
        .reservation(reservation_id)
        .ok_or(EngineError::not_found("reservation", reservation_id))?;
    if r.applicant_id != applicant_id || r.status != ReservationStatus::Rejected {
        return Err(ConflictKind::NotResubmittable.into());
    }
    Ok(())
}
