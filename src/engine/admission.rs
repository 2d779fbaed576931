use crate::model::*;
use crate::settings::{
    ConfigProvider, AUDIT_REQUIRED, DEFAULT_AUDIT_REQUIRED, DEFAULT_MAX_DURATION_HOURS,
    MAX_DURATION_HOURS,
};

use super::EngineError;

/// Outcome of the admission policy for one create or resubmit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Admission {
    pub initial_status: ReservationStatus,
    pub max_duration_hours: f64,
}

impl Admission {
    pub fn max_duration_ms(&self) -> Ms {
        (self.max_duration_hours * HOUR as f64) as Ms
    }

    pub fn check_duration(&self, span: &Span) -> Result<(), EngineError> {
        if span.duration_ms() > self.max_duration_ms() {
            return Err(EngineError::bad_request(format!(
                "reservation may last at most {} hours",
                self.max_duration_hours
            )));
        }
        Ok(())
    }
}

/// Read the policy from configuration. Called on every create and resubmit,
/// never cached, so a settings change applies to the next request.
pub fn resolve_admission(config: &dyn ConfigProvider) -> Admission {
    let audit_required = config.get_bool(AUDIT_REQUIRED, DEFAULT_AUDIT_REQUIRED);
    let max_duration_hours = config.get_number(MAX_DURATION_HOURS, DEFAULT_MAX_DURATION_HOURS);
    Admission {
        initial_status: if audit_required {
            ReservationStatus::Pending
        } else {
            ReservationStatus::Approved
        },
        max_duration_hours,
    }
}
