use std::time::Instant;

use serde_json::json;
use ulid::Ulid;

use crate::directory::Capability;
use crate::model::*;

use super::{now_ms, optional_reason, AuditTarget, ConflictKind, Engine, EngineError};

enum Verdict {
    Approve,
    Reject(String),
}

impl Engine {
    /// `pending → approved`. Any other current status is a conflict.
    pub async fn approve_reservation(
        &self,
        reviewer_id: Ulid,
        reservation_id: Ulid,
    ) -> Result<(), EngineError> {
        let started = Instant::now();
        let result = self.review(reviewer_id, reservation_id, Verdict::Approve).await;
        let target = AuditTarget {
            actor: reviewer_id,
            target_type: "reservation",
            target_id: Some(reservation_id),
            diff: Some(json!({ "status": ReservationStatus::Approved })),
        };
        self.conclude("reservation.approve", started, target, result)
    }

    /// `pending → rejected`; the reason is required.
    pub async fn reject_reservation(
        &self,
        reviewer_id: Ulid,
        reservation_id: Ulid,
        reason: String,
    ) -> Result<(), EngineError> {
        let started = Instant::now();
        let result = match optional_reason(Some(reason.clone())) {
            Ok(Some(reason)) => {
                self.review(reviewer_id, reservation_id, Verdict::Reject(reason))
                    .await
            }
            Ok(None) => Err(EngineError::bad_request("reject reason is required")),
            Err(e) => Err(e),
        };
        let target = AuditTarget {
            actor: reviewer_id,
            target_type: "reservation",
            target_id: Some(reservation_id),
            diff: Some(json!({ "status": ReservationStatus::Rejected, "reason": reason })),
        };
        self.conclude("reservation.reject", started, target, result)
    }

    /// Compare-and-set on status. Never touches the span, so no conflict check.
    async fn review(
        &self,
        reviewer_id: Ulid,
        reservation_id: Ulid,
        verdict: Verdict,
    ) -> Result<(), EngineError> {
        self.require_capability(reviewer_id, Capability::ReviewReservations)
            .await?;
        let room_id = self
            .store
            .room_for_reservation(&reservation_id)
            .ok_or(EngineError::not_found("reservation", reservation_id))?;
        let rs = self.store.require_room(room_id)?;

        let mut guard = rs.write().await;
        let status = guard
            .reservation(reservation_id)
            .map(|r| r.status)
            .ok_or(EngineError::not_found("reservation", reservation_id))?;
        if status != ReservationStatus::Pending {
            return Err(ConflictKind::NotPending.into());
        }

        let now = now_ms();
        let event = match verdict {
            Verdict::Approve => Event::ReservationApproved {
                id: reservation_id,
                room_id,
                review: Review {
                    reviewer_id,
                    reviewed_at: now,
                    reject_reason: None,
                },
            },
            Verdict::Reject(reason) => Event::ReservationRejected {
                id: reservation_id,
                room_id,
                review: Review {
                    reviewer_id,
                    reviewed_at: now,
                    reject_reason: Some(reason),
                },
            },
        };
        self.persist_room_event(&mut guard, event).await
    }
}
