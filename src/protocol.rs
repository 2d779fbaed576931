//! JSON-lines request/response protocol.
//!
//! Each request is one line: `{"op": "create_reservation", ...}`. Each
//! response is one line: `{"ok": true, "result": ...}` or
//! `{"ok": false, "error": {"kind": "...", "message": "..."}}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

use crate::engine::{BanExpiry, Engine, EngineError, NewReservation, ReservationFilter, Resubmission};
use crate::model::{Ms, SettingValue, Span};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Ping,
    CreateReservation(NewReservation),
    ResubmitReservation(Resubmission),
    CancelReservation {
        actor: Ulid,
        reservation_id: Ulid,
        #[serde(default)]
        reason: Option<String>,
    },
    ApproveReservation {
        actor: Ulid,
        reservation_id: Ulid,
    },
    RejectReservation {
        actor: Ulid,
        reservation_id: Ulid,
        reason: String,
    },
    GetReservation {
        reservation_id: Ulid,
    },
    ListReservations {
        #[serde(default)]
        filter: ReservationFilter,
        #[serde(default)]
        page: usize,
        #[serde(default)]
        page_size: usize,
    },
    FloorOverview {
        building_id: Ulid,
        floor: i32,
        from: Ms,
        window_days: u32,
    },
    RoomUsage {
        start: Ms,
        end: Ms,
    },
    UserUsage {
        start: Ms,
        end: Ms,
    },
    RoomUsageLeaderboard {
        window_days: u32,
    },
    UserUsageLeaderboard {
        window_days: u32,
    },
    CreateBan {
        actor: Ulid,
        user_id: Ulid,
        #[serde(default)]
        reason: Option<String>,
        expiry: BanExpiry,
    },
    RevokeBan {
        actor: Ulid,
        ban_id: Ulid,
        #[serde(default)]
        reason: Option<String>,
    },
    IsBanned {
        user_id: Ulid,
    },
    ActiveBan {
        user_id: Ulid,
    },
    SetSetting {
        actor: Ulid,
        key: String,
        value: Value,
    },
    CreateBuilding {
        actor: Ulid,
        name: String,
    },
    CreateRoom {
        actor: Ulid,
        building_id: Ulid,
        floor: i32,
        name: String,
        #[serde(default)]
        capacity: Option<u32>,
    },
    SetBuildingEnabled {
        actor: Ulid,
        building_id: Ulid,
        enabled: bool,
    },
    SetRoomEnabled {
        actor: Ulid,
        room_id: Ulid,
        enabled: bool,
    },
    DeleteBuilding {
        actor: Ulid,
        building_id: Ulid,
    },
    DeleteRoom {
        actor: Ulid,
        room_id: Ulid,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    pub fn success(result: Value) -> Self {
        Self {
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(kind: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            result: None,
            error: Some(ErrorBody {
                kind: kind.to_string(),
                message: message.into(),
            }),
        }
    }

    pub fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"ok":false,"error":{{"kind":"internal","message":"encode failed: {e}"}}}}"#)
        })
    }
}

impl From<EngineError> for Response {
    fn from(e: EngineError) -> Self {
        Response::failure(e.kind(), e.to_string())
    }
}

fn respond<T: Serialize>(result: Result<T, EngineError>) -> Response {
    match result {
        Ok(value) => match serde_json::to_value(value) {
            Ok(v) => Response::success(v),
            Err(e) => Response::failure("internal", e.to_string()),
        },
        Err(e) => e.into(),
    }
}

fn setting_value(raw: &Value) -> Result<SettingValue, EngineError> {
    match raw {
        Value::Bool(b) => Ok(SettingValue::Bool(*b)),
        Value::Number(n) => n
            .as_f64()
            .map(SettingValue::Number)
            .ok_or_else(|| EngineError::bad_request("setting value out of range")),
        _ => Err(EngineError::bad_request("setting value must be a boolean or a number")),
    }
}

fn window(start: Ms, end: Ms) -> Result<Span, EngineError> {
    Span::try_new(start, end).ok_or_else(|| EngineError::bad_request("window end must be after start"))
}

/// Parse one request line and run it.
pub async fn handle_line(engine: &Engine, line: &str) -> Response {
    match serde_json::from_str::<Request>(line) {
        Ok(request) => dispatch(engine, request).await,
        Err(e) => Response::failure("bad_request", format!("malformed request: {e}")),
    }
}

pub async fn dispatch(engine: &Engine, request: Request) -> Response {
    match request {
        Request::Ping => Response::success(Value::String("pong".into())),
        Request::CreateReservation(req) => respond(engine.create_reservation(req).await),
        Request::ResubmitReservation(req) => respond(
            engine
                .resubmit_reservation(req)
                .await
                .map(|status| serde_json::json!({ "status": status })),
        ),
        Request::CancelReservation {
            actor,
            reservation_id,
            reason,
        } => respond(engine.cancel_reservation(actor, reservation_id, reason).await),
        Request::ApproveReservation {
            actor,
            reservation_id,
        } => respond(engine.approve_reservation(actor, reservation_id).await),
        Request::RejectReservation {
            actor,
            reservation_id,
            reason,
        } => respond(engine.reject_reservation(actor, reservation_id, reason).await),
        Request::GetReservation { reservation_id } => {
            respond(engine.get_reservation(reservation_id).await)
        }
        Request::ListReservations {
            filter,
            page,
            page_size,
        } => respond(engine.list_reservations(&filter, page, page_size).await),
        Request::FloorOverview {
            building_id,
            floor,
            from,
            window_days,
        } => respond(
            engine
                .floor_overview(building_id, floor, from, window_days)
                .await,
        ),
        Request::RoomUsage { start, end } => match window(start, end) {
            Ok(w) => respond(engine.room_usage(w).await),
            Err(e) => e.into(),
        },
        Request::UserUsage { start, end } => match window(start, end) {
            Ok(w) => respond(engine.user_usage(w).await),
            Err(e) => e.into(),
        },
        Request::RoomUsageLeaderboard { window_days } => {
            respond(engine.room_usage_leaderboard(window_days).await)
        }
        Request::UserUsageLeaderboard { window_days } => {
            respond(engine.user_usage_leaderboard(window_days).await)
        }
        Request::CreateBan {
            actor,
            user_id,
            reason,
            expiry,
        } => respond(engine.create_ban(actor, user_id, reason, expiry).await),
        Request::RevokeBan {
            actor,
            ban_id,
            reason,
        } => respond(engine.revoke_ban(actor, ban_id, reason).await),
        Request::IsBanned { user_id } => Response::success(Value::Bool(engine.is_banned(user_id))),
        Request::ActiveBan { user_id } => respond(Ok(engine.active_ban(user_id))),
        Request::SetSetting { actor, key, value } => match setting_value(&value) {
            Ok(value) => respond(engine.set_setting(actor, key, value).await),
            Err(e) => e.into(),
        },
        Request::CreateBuilding { actor, name } => {
            respond(engine.create_building(actor, name).await)
        }
        Request::CreateRoom {
            actor,
            building_id,
            floor,
            name,
            capacity,
        } => respond(
            engine
                .create_room(actor, building_id, floor, name, capacity)
                .await,
        ),
        Request::SetBuildingEnabled {
            actor,
            building_id,
            enabled,
        } => respond(engine.set_building_enabled(actor, building_id, enabled).await),
        Request::SetRoomEnabled {
            actor,
            room_id,
            enabled,
        } => respond(engine.set_room_enabled(actor, room_id, enabled).await),
        Request::DeleteBuilding { actor, building_id } => {
            respond(engine.delete_building(actor, building_id).await)
        }
        Request::DeleteRoom { actor, room_id } => respond(engine.delete_room(actor, room_id).await),
    }
}
