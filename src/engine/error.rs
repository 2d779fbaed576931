use thiserror::Error;
use ulid::Ulid;

/// Why a request lost against current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConflictKind {
    #[error("time slot taken by reservation {with}; check the room timeline and pick another slot")]
    SlotTaken { with: Ulid },
    #[error("only rejected reservations may be resubmitted")]
    NotResubmittable,
    #[error("only pending or approved reservations may be cancelled")]
    NotCancellable,
    #[error("already started, cannot cancel")]
    AlreadyStarted,
    #[error("only pending reservations may be reviewed")]
    NotPending,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: Ulid },
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("forbidden: {0}")]
    Forbidden(&'static str),
    #[error("conflict: {0}")]
    Conflict(ConflictKind),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Message for banned applicants. Deliberately says nothing about the ban itself.
pub(crate) const RESTRICTED: &str = "currently restricted from this module";
pub(crate) const MISSING_CAPABILITY: &str = "missing required capability";

impl EngineError {
    pub fn not_found(entity: &'static str, id: Ulid) -> Self {
        EngineError::NotFound { entity, id }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        EngineError::BadRequest(msg.into())
    }

    /// Stable lowercase code for wire responses and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::NotFound { .. } => "not_found",
            EngineError::BadRequest(_) | EngineError::LimitExceeded(_) => "bad_request",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::Conflict(_) => "conflict",
            EngineError::Storage(_) => "internal",
        }
    }
}

impl From<ConflictKind> for EngineError {
    fn from(kind: ConflictKind) -> Self {
        EngineError::Conflict(kind)
    }
}
