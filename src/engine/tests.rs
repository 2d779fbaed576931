use super::*;
use crate::audit::{AuditError, AuditEvent, MemoryAuditSink};
use crate::directory::{StaticDirectory, UserRecord};
use crate::settings::{AUDIT_REQUIRED, MAX_DURATION_HOURS};
use tokio_test::{assert_err, assert_ok};

const H: Ms = 3_600_000; // 1 hour in ms

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("roombook_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

struct BrokenAudit;

impl AuditSink for BrokenAudit {
    fn record(&self, _event: AuditEvent) -> Result<(), AuditError> {
        Err(AuditError("disk full".into()))
    }
}

struct Fixture {
    engine: Arc<Engine>,
    directory: Arc<StaticDirectory>,
    path: PathBuf,
    /// Holds every capability.
    admin: Ulid,
    applicant: Ulid,
    /// Plain members, none of them the applicant.
    others: Vec<Ulid>,
    building: Ulid,
    room: Ulid,
}

impl Fixture {
    fn booking(&self, applicant: Ulid, start: Ms, end: Ms) -> NewReservation {
        NewReservation {
            applicant_id: applicant,
            room_id: self.room,
            start,
            end,
            purpose: "group study".into(),
            other_participant_ids: self
                .others
                .iter()
                .copied()
                .filter(|id| *id != applicant)
                .take(2)
                .collect(),
        }
    }

    async fn book(&self, start: Ms, end: Ms) -> Result<Created, EngineError> {
        self.engine
            .create_reservation(self.booking(self.applicant, start, end))
            .await
    }

    async fn require_review(&self, on: bool) {
        self.engine
            .set_setting(self.admin, AUDIT_REQUIRED.into(), SettingValue::Bool(on))
            .await
            .unwrap();
    }

    async fn reopen(&self) -> Engine {
        Engine::new(
            self.path.clone(),
            self.directory.clone(),
            Arc::new(MemoryAuditSink::new()),
        )
        .unwrap()
    }
}

async fn fixture_with_audit(name: &str, audit: Arc<dyn AuditSink>) -> Fixture {
    let path = test_wal_path(name);
    let admin = Ulid::new();
    let applicant = Ulid::new();
    let others: Vec<Ulid> = (0..6).map(|_| Ulid::new()).collect();

    let directory = Arc::new(StaticDirectory::with_users(
        [
            UserRecord::staff(
                admin,
                &[
                    Capability::ReviewReservations,
                    Capability::ManageBans,
                    Capability::ManageConfig,
                    Capability::ManageCatalog,
                ],
            ),
            UserRecord::member(applicant),
        ]
        .into_iter()
        .chain(others.iter().map(|id| UserRecord::member(*id))),
    ));
    let engine = Arc::new(Engine::new(path.clone(), directory.clone(), audit).unwrap());
    let building = engine
        .create_building(admin, "Main Library".into())
        .await
        .unwrap();
    let room = engine
        .create_room(admin, building, 2, "Study 2A".into(), Some(8))
        .await
        .unwrap();

    Fixture {
        engine,
        directory,
        path,
        admin,
        applicant,
        others,
        building,
        room,
    }
}

async fn fixture(name: &str) -> (Fixture, Arc<MemoryAuditSink>) {
    let audit = Arc::new(MemoryAuditSink::new());
    let f = fixture_with_audit(name, audit.clone()).await;
    (f, audit)
}

/// Start of the day after tomorrow, so every slot is safely in the future.
fn day_base() -> Ms {
    (now_ms() / DAY + 2) * DAY
}

fn is_slot_taken(r: &Result<Created, EngineError>) -> bool {
    matches!(r, Err(EngineError::Conflict(ConflictKind::SlotTaken { .. })))
}

// ── Booking ──────────────────────────────────────────────

#[tokio::test]
async fn auto_approve_happy_path() {
    let (f, audit) = fixture("happy_path.wal").await;
    let t = day_base();

    let created = f.book(t + H, t + 3 * H).await.unwrap();
    assert_eq!(created.status, ReservationStatus::Approved);

    let r = f.engine.get_reservation(created.id).await.unwrap();
    assert_eq!(r.span, Span::new(t + H, t + 3 * H));
    assert_eq!(r.participants.len(), 3);
    assert!(r.participants[0].is_applicant);
    assert_eq!(r.participants[0].user_id, f.applicant);
    assert_eq!(r.review.as_ref().map(|rv| rv.reviewer_id), Some(f.applicant));

    let rs = f.engine.store().room(&f.room).unwrap();
    assert!(has_conflict(&*rs.read().await, &Span::new(t + 2 * H, t + 4 * H), None));
    assert_eq!(audit.actions().last(), Some(&("reservation.create", true)));
}

#[tokio::test]
async fn overlapping_second_booking_conflicts() {
    let (f, audit) = fixture("second_booking.wal").await;
    let t = day_base();
    let first = f.book(t + H, t + 3 * H).await.unwrap();

    let second = f
        .engine
        .create_reservation(f.booking(f.others[3], t + 2 * H, t + 4 * H))
        .await;
    assert!(matches!(
        second,
        Err(EngineError::Conflict(ConflictKind::SlotTaken { with })) if with == first.id
    ));
    assert_eq!(audit.actions().last(), Some(&("reservation.create", false)));

    // Back-to-back is fine.
    let third = f
        .engine
        .create_reservation(f.booking(f.others[3], t + 3 * H, t + 4 * H))
        .await
        .unwrap();
    assert_eq!(third.status, ReservationStatus::Approved);
}

#[tokio::test]
async fn booking_validation_errors() {
    let (f, _) = fixture("validation.wal").await;
    let t = day_base();

    let err = f.book(t + 2 * H, t + H).await.unwrap_err();
    assert!(matches!(err, EngineError::BadRequest(_)));

    let err = f.book(now_ms() - H, now_ms() + H).await.unwrap_err();
    assert!(matches!(err, EngineError::BadRequest(_)));

    // Default cap is 72 hours.
    let err = f.book(t, t + 73 * H).await.unwrap_err();
    assert!(matches!(err, EngineError::BadRequest(_)));

    let mut blank = f.booking(f.applicant, t, t + H);
    blank.purpose = "   ".into();
    let err = f.engine.create_reservation(blank).await.unwrap_err();
    assert!(matches!(err, EngineError::BadRequest(_)));

    let mut long = f.booking(f.applicant, t, t + H);
    long.purpose = "x".repeat(crate::limits::MAX_PURPOSE_LEN + 1);
    let err = f.engine.create_reservation(long).await.unwrap_err();
    assert!(matches!(err, EngineError::LimitExceeded(_)));

    let mut ghost_room = f.booking(f.applicant, t, t + H);
    ghost_room.room_id = Ulid::new();
    let err = f.engine.create_reservation(ghost_room).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound { entity: "room", .. }));

    let page = f
        .engine
        .list_reservations(&ReservationFilter::default(), 1, 20)
        .await
        .unwrap();
    assert_eq!(page.total, 0);
}

#[tokio::test]
async fn max_duration_follows_settings() {
    let (f, _) = fixture("max_duration.wal").await;
    let t = day_base();
    f.engine
        .set_setting(f.admin, MAX_DURATION_HOURS.into(), SettingValue::Number(1.0))
        .await
        .unwrap();

    assert!(matches!(
        f.book(t, t + 2 * H).await,
        Err(EngineError::BadRequest(_))
    ));
    f.book(t, t + H).await.unwrap();
}

#[tokio::test]
async fn participant_count_invariant() {
    let (f, _) = fixture("participants.wal").await;
    let t = day_base();

    let mut two = f.booking(f.applicant, t, t + H);
    two.other_participant_ids.truncate(1);
    let err = f.engine.create_reservation(two).await.unwrap_err();
    assert!(matches!(err, EngineError::BadRequest(ref m) if m.contains("at least 3")));

    // A repeated id is one participant.
    let mut dup = f.booking(f.applicant, t, t + H);
    dup.other_participant_ids = vec![f.others[0], f.others[0]];
    assert!(matches!(
        f.engine.create_reservation(dup).await,
        Err(EngineError::BadRequest(_))
    ));

    let mut with_self = f.booking(f.applicant, t, t + H);
    with_self.other_participant_ids.push(f.applicant);
    assert!(matches!(
        f.engine.create_reservation(with_self).await,
        Err(EngineError::BadRequest(_))
    ));

    let stranger = Ulid::new();
    let mut unknown = f.booking(f.applicant, t, t + H);
    unknown.other_participant_ids[1] = stranger;
    let err = f.engine.create_reservation(unknown).await.unwrap_err();
    assert!(matches!(err, EngineError::BadRequest(ref m) if m.contains(&stranger.to_string())));

    f.directory.deactivate(&f.others[1]);
    let mut inactive = f.booking(f.applicant, t, t + H);
    inactive.other_participant_ids = vec![f.others[0], f.others[1]];
    assert!(matches!(
        f.engine.create_reservation(inactive).await,
        Err(EngineError::BadRequest(_))
    ));

    let mut exactly_three = f.booking(f.applicant, t, t + H);
    exactly_three.other_participant_ids = vec![f.others[2], f.others[3]];
    let created = f.engine.create_reservation(exactly_three).await.unwrap();
    let r = f.engine.get_reservation(created.id).await.unwrap();
    assert_eq!(r.participants.len(), 3);
}

#[tokio::test]
async fn unusable_room_or_building_is_not_bookable() {
    let (f, _) = fixture("unusable_room.wal").await;
    let t = day_base();

    f.engine.set_room_enabled(f.admin, f.room, false).await.unwrap();
    assert!(matches!(f.book(t, t + H).await, Err(EngineError::NotFound { .. })));
    f.engine.set_room_enabled(f.admin, f.room, true).await.unwrap();

    f.engine
        .set_building_enabled(f.admin, f.building, false)
        .await
        .unwrap();
    assert!(matches!(f.book(t, t + H).await, Err(EngineError::NotFound { .. })));
    f.engine
        .set_building_enabled(f.admin, f.building, true)
        .await
        .unwrap();
    f.book(t, t + H).await.unwrap();

    f.engine.delete_room(f.admin, f.room).await.unwrap();
    assert!(matches!(f.book(t + H, t + 2 * H).await, Err(EngineError::NotFound { .. })));
    // Soft delete keeps history.
    assert_eq!(
        f.engine
            .list_reservations(&ReservationFilter::default(), 1, 20)
            .await
            .unwrap()
            .total,
        1
    );
}

// ── Admission & review ───────────────────────────────────

#[tokio::test]
async fn admission_toggle_affects_only_new_reservations() {
    let (f, _) = fixture("admission_toggle.wal").await;
    let t = day_base();

    let first = f.book(t, t + H).await.unwrap();
    assert_eq!(first.status, ReservationStatus::Approved);

    f.require_review(true).await;
    let second = f.book(t + H, t + 2 * H).await.unwrap();
    assert_eq!(second.status, ReservationStatus::Pending);

    let first_now = f.engine.get_reservation(first.id).await.unwrap();
    assert_eq!(first_now.status, ReservationStatus::Approved);

    f.require_review(false).await;
    let third = f.book(t + 2 * H, t + 3 * H).await.unwrap();
    assert_eq!(third.status, ReservationStatus::Approved);
}

#[tokio::test]
async fn review_flow_approve_then_no_reject() {
    let (f, audit) = fixture("review_flow.wal").await;
    let t = day_base();
    f.require_review(true).await;

    let created = f.book(t, t + H).await.unwrap();
    assert_eq!(created.status, ReservationStatus::Pending);
    assert!(f.engine.get_reservation(created.id).await.unwrap().review.is_none());

    f.engine.approve_reservation(f.admin, created.id).await.unwrap();
    let r = f.engine.get_reservation(created.id).await.unwrap();
    assert_eq!(r.status, ReservationStatus::Approved);
    let review = r.review.unwrap();
    assert_eq!(review.reviewer_id, f.admin);
    assert_eq!(review.reject_reason, None);

    let err = f
        .engine
        .reject_reservation(f.admin, created.id, "too late".into())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict(ConflictKind::NotPending)));
    assert_eq!(audit.actions().last(), Some(&("reservation.reject", false)));
}

#[tokio::test]
async fn review_requires_capability_and_reason() {
    let (f, _) = fixture("review_guard.wal").await;
    let t = day_base();
    f.require_review(true).await;
    let created = f.book(t, t + H).await.unwrap();

    let err = f
        .engine
        .approve_reservation(f.others[0], created.id)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Forbidden(_)));

    let err = f
        .engine
        .reject_reservation(f.admin, created.id, "  ".into())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::BadRequest(_)));

    let err = f
        .engine
        .approve_reservation(f.admin, Ulid::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound { entity: "reservation", .. }));

    assert_eq!(
        f.engine.get_reservation(created.id).await.unwrap().status,
        ReservationStatus::Pending
    );
}

#[tokio::test]
async fn lifecycle_closure() {
    let (f, _) = fixture("lifecycle.wal").await;
    let t = day_base();
    f.require_review(true).await;

    let approved = f.book(t, t + H).await.unwrap().id;
    f.engine.approve_reservation(f.admin, approved).await.unwrap();

    let rejected = f.book(t + H, t + 2 * H).await.unwrap().id;
    f.engine
        .reject_reservation(f.admin, rejected, "room is reserved for exams".into())
        .await
        .unwrap();

    let cancelled = f.book(t + 2 * H, t + 3 * H).await.unwrap().id;
    f.engine
        .cancel_reservation(f.applicant, cancelled, None)
        .await
        .unwrap();

    for id in [approved, rejected, cancelled] {
        let err = f.engine.approve_reservation(f.admin, id).await.unwrap_err();
        assert!(matches!(err, EngineError::Conflict(ConflictKind::NotPending)), "{id}");
    }

    for id in [approved, cancelled] {
        let err = f
            .engine
            .resubmit_reservation(Resubmission {
                applicant_id: f.applicant,
                reservation_id: id,
                start: t + 5 * H,
                end: t + 6 * H,
                purpose: "retry".into(),
                other_participant_ids: f.others[..2].to_vec(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Conflict(ConflictKind::NotResubmittable)));
    }

    for id in [rejected, cancelled] {
        let err = f
            .engine
            .cancel_reservation(f.applicant, id, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Conflict(ConflictKind::NotCancellable)));
    }
}

#[tokio::test]
async fn resubmit_after_rejection() {
    let (f, audit) = fixture("resubmit.wal").await;
    let t = day_base();
    f.require_review(true).await;

    let id = f.book(t, t + H).await.unwrap().id;
    f.engine
        .reject_reservation(f.admin, id, "wrong room size".into())
        .await
        .unwrap();
    let other = f
        .engine
        .create_reservation(f.booking(f.others[4], t + 2 * H, t + 3 * H))
        .await
        .unwrap();

    let resubmit = |start, end| Resubmission {
        applicant_id: f.applicant,
        reservation_id: id,
        start,
        end,
        purpose: "group study, smaller".into(),
        other_participant_ids: f.others[..2].to_vec(),
    };

    let err = f
        .engine
        .resubmit_reservation(resubmit(t + 2 * H, t + 4 * H))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Conflict(ConflictKind::SlotTaken { with }) if with == other.id
    ));

    // Its own old slot never blocks it.
    f.require_review(false).await;
    let status = f
        .engine
        .resubmit_reservation(resubmit(t, t + 90 * 60_000))
        .await
        .unwrap();
    assert_eq!(status, ReservationStatus::Approved);

    let r = f.engine.get_reservation(id).await.unwrap();
    assert_eq!(r.status, ReservationStatus::Approved);
    assert_eq!(r.span, Span::new(t, t + 90 * 60_000));
    assert_eq!(r.purpose, "group study, smaller");
    assert!(r.review.and_then(|rv| rv.reject_reason).is_none());
    assert_eq!(audit.actions().last(), Some(&("reservation.resubmit", true)));
}

#[tokio::test]
async fn resubmit_and_cancel_by_another_user_conflict() {
    let (f, _) = fixture("not_applicant.wal").await;
    let t = day_base();

    let approved = f.book(t, t + H).await.unwrap().id;
    f.require_review(true).await;
    let rejected = f.book(t + 2 * H, t + 3 * H).await.unwrap().id;
    f.engine
        .reject_reservation(f.admin, rejected, "no".into())
        .await
        .unwrap();

    let err = f
        .engine
        .cancel_reservation(f.others[0], approved, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict(ConflictKind::NotCancellable)));
    assert_eq!(err.kind(), "conflict");

    let err = f
        .engine
        .resubmit_reservation(Resubmission {
            applicant_id: f.others[0],
            reservation_id: rejected,
            start: t + 4 * H,
            end: t + 5 * H,
            purpose: "mine now".into(),
            other_participant_ids: f.others[1..3].to_vec(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict(ConflictKind::NotResubmittable)));

    // Both reservations are untouched.
    let r = f.engine.get_reservation(approved).await.unwrap();
    assert_eq!(r.status, ReservationStatus::Approved);
    let r = f.engine.get_reservation(rejected).await.unwrap();
    assert_eq!(r.status, ReservationStatus::Rejected);

    // Unknown ids are still not found.
    let err = f
        .engine
        .cancel_reservation(f.applicant, Ulid::new(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound { .. }));
}

#[tokio::test]
async fn resubmit_replaces_participants_and_can_land_pending() {
    let (f, _) = fixture("resubmit_pending.wal").await;
    let t = day_base();
    f.require_review(true).await;

    let id = f.book(t, t + H).await.unwrap().id;
    f.engine
        .reject_reservation(f.admin, id, "too many people".into())
        .await
        .unwrap();
    let before = f.engine.get_reservation(id).await.unwrap();
    assert!(before.participants.iter().any(|p| p.user_id == f.others[0]));

    let status = f
        .engine
        .resubmit_reservation(Resubmission {
            applicant_id: f.applicant,
            reservation_id: id,
            start: t + H,
            end: t + 2 * H,
            purpose: "group study".into(),
            other_participant_ids: vec![f.others[3], f.others[4]],
        })
        .await
        .unwrap();
    assert_eq!(status, ReservationStatus::Pending);

    let r = f.engine.get_reservation(id).await.unwrap();
    assert_eq!(r.status, ReservationStatus::Pending);
    assert!(r.review.is_none());
    assert_eq!(
        r.participants,
        vec![
            Participant { user_id: f.applicant, is_applicant: true },
            Participant { user_id: f.others[3], is_applicant: false },
            Participant { user_id: f.others[4], is_applicant: false },
        ]
    );

    // The replacement survives a restart.
    let reopened = f.reopen().await;
    let r = reopened.get_reservation(id).await.unwrap();
    assert_eq!(r.participants.len(), 3);
    assert!(r.participants.iter().all(|p| p.user_id != f.others[0]));
}

// ── Cancel ───────────────────────────────────────────────

#[tokio::test]
async fn cancel_frees_the_slot() {
    let (f, _) = fixture("cancel_frees.wal").await;
    let t = day_base();
    f.require_review(true).await;

    // Pending reservations may be cancelled too.
    let id = f.book(t, t + H).await.unwrap().id;
    f.engine
        .cancel_reservation(f.applicant, id, Some("plans changed".into()))
        .await
        .unwrap();
    let r = f.engine.get_reservation(id).await.unwrap();
    assert_eq!(r.status, ReservationStatus::Cancelled);
    let c = r.cancellation.unwrap();
    assert_eq!(c.cancelled_by, f.applicant);
    assert_eq!(c.reason.as_deref(), Some("plans changed"));

    f.book(t, t + H).await.unwrap();
}

#[tokio::test]
async fn cancel_after_start_is_rejected() {
    let (f, _) = fixture("cancel_started.wal").await;
    let start = now_ms() + 300;
    let id = f.book(start, start + H).await.unwrap().id;

    tokio::time::sleep(std::time::Duration::from_millis(400)).await;
    let err = f
        .engine
        .cancel_reservation(f.applicant, id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict(ConflictKind::AlreadyStarted)));
}

// ── Bans ─────────────────────────────────────────────────

#[tokio::test]
async fn ban_blocks_booking_without_writing() {
    let (f, audit) = fixture("ban_blocks.wal").await;
    let t = day_base();

    f.engine
        .create_ban(f.admin, f.applicant, Some("no-show".into()), BanExpiry::After(DAY))
        .await
        .unwrap();
    assert!(f.engine.is_banned(f.applicant));

    let err = f.book(t, t + H).await.unwrap_err();
    assert!(matches!(err, EngineError::Forbidden(_)));
    assert_eq!(err.to_string(), "forbidden: currently restricted from this module");
    assert_eq!(audit.actions().last(), Some(&("reservation.create", false)));

    let page = f
        .engine
        .list_reservations(&ReservationFilter::default(), 1, 20)
        .await
        .unwrap();
    assert_eq!(page.total, 0);
}

#[tokio::test]
async fn banned_participant_is_invalid() {
    let (f, _) = fixture("ban_participant.wal").await;
    let t = day_base();
    f.engine
        .create_ban(f.admin, f.others[0], None, BanExpiry::Never)
        .await
        .unwrap();

    let err = f.book(t, t + H).await.unwrap_err();
    assert!(matches!(err, EngineError::BadRequest(ref m) if m.contains(&f.others[0].to_string())));
}

#[tokio::test]
async fn new_ban_supersedes_and_revoke_is_idempotent() {
    let (f, audit) = fixture("ban_supersede.wal").await;
    let t = day_base();

    let first = f
        .engine
        .create_ban(f.admin, f.applicant, None, BanExpiry::Never)
        .await
        .unwrap();
    let second = f
        .engine
        .create_ban(f.admin, f.applicant, Some("repeat".into()), BanExpiry::At(t))
        .await
        .unwrap();

    let bans = f.engine.store().bans_for(&f.applicant);
    assert_eq!(bans.len(), 2);
    let revocation = bans[0].revocation.clone().unwrap();
    assert_eq!(revocation.reason.as_deref(), Some("superseded by new ban"));
    assert_eq!(f.engine.active_ban(f.applicant).map(|b| b.id), Some(second));

    assert_ok!(f.engine.revoke_ban(f.admin, second, None).await);
    assert_ok!(f.engine.revoke_ban(f.admin, second, None).await);
    assert_ok!(f.engine.revoke_ban(f.admin, first, None).await);
    assert!(!f.engine.is_banned(f.applicant));
    assert!(f.engine.active_ban(f.applicant).is_none());
    f.book(t, t + H).await.unwrap();

    let err = assert_err!(f.engine.revoke_ban(f.admin, Ulid::new(), None).await);
    assert!(matches!(err, EngineError::NotFound { entity: "ban", .. }));

    let err = f
        .engine
        .create_ban(f.others[0], f.applicant, None, BanExpiry::Never)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Forbidden(_)));
    assert!(audit.actions().contains(&("ban.revoke", true)));
}

// ── Queries & usage ──────────────────────────────────────

#[tokio::test]
async fn usage_clips_to_window_and_counts_approved_only() {
    let (f, _) = fixture("usage.wal").await;
    let t = day_base();

    f.book(t + 10 * H, t + 12 * H).await.unwrap();
    f.book(t + 20 * H, t + 21 * H).await.unwrap();
    f.require_review(true).await;
    f.book(t + 11 * H, t + 13 * H).await.unwrap_err(); // overlaps, conflict
    f.book(t + 12 * H, t + 13 * H).await.unwrap(); // pending, excluded

    let window = Span::new(t + 11 * H, t + 13 * H);
    let rooms = f.engine.room_usage(window).await.unwrap();
    assert_eq!(
        rooms,
        vec![UsageEntry {
            id: f.room,
            total_seconds: 3600
        }]
    );
    let users = f.engine.user_usage(window).await.unwrap();
    assert_eq!(users[0].id, f.applicant);
    assert_eq!(users[0].total_seconds, 3600);

    let outside = Span::new(t + 14 * H, t + 15 * H);
    assert!(f.engine.room_usage(outside).await.unwrap().is_empty());

    // Nothing in the past week yet.
    assert!(f.engine.room_usage_leaderboard(7).await.unwrap().is_empty());
    assert!(f.engine.user_usage_leaderboard(0).await.is_err());
}

#[tokio::test]
async fn list_filters_and_pages() {
    let (f, _) = fixture("listing.wal").await;
    let t = day_base();
    let second_room = f
        .engine
        .create_room(f.admin, f.building, 3, "Study 3B".into(), None)
        .await
        .unwrap();

    let a = f.book(t, t + H).await.unwrap().id;
    let b = f.book(t + H, t + 2 * H).await.unwrap().id;
    let mut other_room = f.booking(f.others[5], t, t + H);
    other_room.room_id = second_room;
    let c = f.engine.create_reservation(other_room).await.unwrap().id;
    f.engine.cancel_reservation(f.applicant, b, None).await.unwrap();

    let all = f
        .engine
        .list_reservations(&ReservationFilter::default(), 1, 20)
        .await
        .unwrap();
    assert_eq!(all.total, 3);
    assert_eq!(all.items[0].id, b); // latest start first

    let by_room = ReservationFilter {
        room_id: Some(f.room),
        ..Default::default()
    };
    assert_eq!(f.engine.list_reservations(&by_room, 1, 20).await.unwrap().total, 2);

    let by_floor = ReservationFilter {
        building_id: Some(f.building),
        floor: Some(3),
        ..Default::default()
    };
    let page = f.engine.list_reservations(&by_floor, 1, 20).await.unwrap();
    assert_eq!(page.items.iter().map(|s| s.id).collect::<Vec<_>>(), vec![c]);

    let approved_mine = ReservationFilter {
        status: Some(ReservationStatus::Approved),
        applicant_id: Some(f.applicant),
        range: Some(Span::new(t, t + 30 * 60_000)),
        ..Default::default()
    };
    let page = f.engine.list_reservations(&approved_mine, 1, 20).await.unwrap();
    assert_eq!(page.items.iter().map(|s| s.id).collect::<Vec<_>>(), vec![a]);

    let second_page = f
        .engine
        .list_reservations(&ReservationFilter::default(), 2, 2)
        .await
        .unwrap();
    assert_eq!(second_page.total, 3);
    assert_eq!(second_page.items.len(), 1);
    let capped = f
        .engine
        .list_reservations(&ReservationFilter::default(), 1, 10_000)
        .await
        .unwrap();
    assert_eq!(capped.page_size, crate::limits::MAX_PAGE_SIZE);
}

#[tokio::test]
async fn floor_overview_shows_holding_reservations() {
    let (f, _) = fixture("floor_overview.wal").await;
    let t = day_base();
    let disabled = f
        .engine
        .create_room(f.admin, f.building, 2, "Study 2B".into(), None)
        .await
        .unwrap();
    f.engine.set_room_enabled(f.admin, disabled, false).await.unwrap();

    let kept = f.book(t, t + H).await.unwrap().id;
    let dropped = f.book(t + H, t + 2 * H).await.unwrap().id;
    f.engine
        .cancel_reservation(f.applicant, dropped, None)
        .await
        .unwrap();
    f.book(t + 3 * DAY, t + 3 * DAY + H).await.unwrap(); // outside the window

    let overview = f.engine.floor_overview(f.building, 2, t, 2).await.unwrap();
    assert_eq!(overview.rooms.iter().map(|r| r.id).collect::<Vec<_>>(), vec![f.room]);
    assert_eq!(
        overview.reservations.iter().map(|r| r.id).collect::<Vec<_>>(),
        vec![kept]
    );

    assert!(f.engine.floor_overview(f.building, 2, t, 0).await.is_err());
    assert!(matches!(
        f.engine.floor_overview(Ulid::new(), 2, t, 1).await,
        Err(EngineError::NotFound { .. })
    ));
}

#[tokio::test]
async fn setting_changes_require_capability_and_known_keys() {
    let (f, audit) = fixture("settings.wal").await;

    let err = f
        .engine
        .set_setting(f.applicant, AUDIT_REQUIRED.into(), SettingValue::Bool(true))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Forbidden(_)));

    let err = f
        .engine
        .set_setting(f.admin, "theme".into(), SettingValue::Bool(true))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::BadRequest(_)));

    f.require_review(true).await;
    let appends = f.engine.wal_appends_since_compact().await;
    f.require_review(true).await; // unchanged, nothing written
    assert_eq!(f.engine.wal_appends_since_compact().await, appends);
    assert_eq!(audit.actions().last(), Some(&("setting.set", true)));
}

// ── Concurrency ──────────────────────────────────────────

/// Tiny deterministic generator so runs are reproducible without extra crates.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self, bound: Ms) -> Ms {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        ((self.0 >> 33) % bound as u64) as Ms
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_overlapping_creates_admit_exactly_one() {
    let (f, _) = fixture("concurrent_overlap.wal").await;
    let f = Arc::new(f);
    let t = day_base();
    let mut rng = Lcg(42);

    for round in 0..5 {
        let base = t + round * DAY;
        // Every span contains [base + 1h, base + 2h), so all pairs overlap.
        let spans: Vec<(Ms, Ms)> = (0..8)
            .map(|_| (base + rng.next(H), base + 2 * H + rng.next(H)))
            .collect();

        let mut handles = Vec::new();
        for (i, (start, end)) in spans.into_iter().enumerate() {
            let f = f.clone();
            handles.push(tokio::spawn(async move {
                let applicant = f.others[i % f.others.len()];
                f.engine
                    .create_reservation(f.booking(applicant, start, end))
                    .await
            }));
        }

        let mut wins = 0;
        for h in handles {
            let result = h.await.unwrap();
            match &result {
                Ok(_) => wins += 1,
                Err(_) => assert!(is_slot_taken(&result), "round {round}: {result:?}"),
            }
        }
        assert_eq!(wins, 1, "round {round}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_disjoint_creates_all_succeed() {
    let (f, _) = fixture("concurrent_disjoint.wal").await;
    let f = Arc::new(f);
    let t = day_base();

    let mut handles = Vec::new();
    for i in 0..12 {
        let f = f.clone();
        handles.push(tokio::spawn(async move {
            let start = t + i * H;
            f.engine
                .create_reservation(f.booking(f.applicant, start, start + H))
                .await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }
    let rs = f.engine.store().room(&f.room).unwrap();
    assert_eq!(rs.read().await.reservations.len(), 12);
}

// ── Durability & audit ───────────────────────────────────

#[tokio::test]
async fn wal_replay_restores_state() {
    let (f, _) = fixture("replay.wal").await;
    let t = day_base();
    f.require_review(true).await;
    let pending = f.book(t, t + H).await.unwrap().id;
    let rejected = f.book(t + H, t + 2 * H).await.unwrap().id;
    f.engine
        .reject_reservation(f.admin, rejected, "closed".into())
        .await
        .unwrap();
    f.engine
        .create_ban(f.admin, f.others[5], None, BanExpiry::Never)
        .await
        .unwrap();

    let reopened = f.reopen().await;
    assert_eq!(
        reopened.get_reservation(pending).await.unwrap().status,
        ReservationStatus::Pending
    );
    let r = reopened.get_reservation(rejected).await.unwrap();
    assert_eq!(r.review.unwrap().reject_reason.as_deref(), Some("closed"));
    assert!(reopened.is_banned(f.others[5]));
    assert_eq!(
        reopened.store().settings().get(AUDIT_REQUIRED),
        Some(SettingValue::Bool(true))
    );

    // Replayed state still enforces conflicts.
    let clash = reopened
        .create_reservation(f.booking(f.applicant, t, t + H))
        .await;
    assert!(is_slot_taken(&clash));
}

#[tokio::test]
async fn compaction_preserves_history() {
    let (f, _) = fixture("compaction.wal").await;
    let t = day_base();
    let kept = f.book(t, t + H).await.unwrap().id;
    let cancelled = f.book(t + H, t + 2 * H).await.unwrap().id;
    f.engine
        .cancel_reservation(f.applicant, cancelled, Some("moved".into()))
        .await
        .unwrap();
    let ban = f
        .engine
        .create_ban(f.admin, f.others[0], None, BanExpiry::Never)
        .await
        .unwrap();
    f.engine.revoke_ban(f.admin, ban, None).await.unwrap();

    f.engine.compact_wal().await.unwrap();
    assert_eq!(f.engine.wal_appends_since_compact().await, 0);
    f.book(t + 3 * H, t + 4 * H).await.unwrap();

    let reopened = f.reopen().await;
    let before = f
        .engine
        .list_reservations(&ReservationFilter::default(), 1, 20)
        .await
        .unwrap();
    let after = reopened
        .list_reservations(&ReservationFilter::default(), 1, 20)
        .await
        .unwrap();
    assert_eq!(before, after);
    assert_eq!(after.total, 3);
    assert_eq!(
        reopened.get_reservation(kept).await.unwrap(),
        f.engine.get_reservation(kept).await.unwrap()
    );
    let c = reopened.get_reservation(cancelled).await.unwrap();
    assert_eq!(c.cancellation.unwrap().reason.as_deref(), Some("moved"));
    assert!(reopened.store().ban(&ban).unwrap().revocation.is_some());
}

#[tokio::test]
async fn audit_failure_does_not_mask_outcome() {
    let f = fixture_with_audit("broken_audit.wal", Arc::new(BrokenAudit)).await;
    let t = day_base();

    let created = assert_ok!(f.book(t, t + H).await);
    assert_eq!(created.status, ReservationStatus::Approved);
    assert!(is_slot_taken(&f.book(t, t + H).await));
    assert_ok!(f.engine.cancel_reservation(f.applicant, created.id, None).await);
    let err = assert_err!(f.engine.approve_reservation(f.applicant, created.id).await);
    assert!(matches!(err, EngineError::Forbidden(_)));
}
