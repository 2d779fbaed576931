use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::json;
use ulid::Ulid;

use crate::directory::Capability;
use crate::limits::MAX_BAN_DURATION_MS;
use crate::model::*;

use super::{now_ms, optional_reason, AuditTarget, Engine, EngineError};

const SUPERSEDED: &str = "superseded by new ban";

/// When a new ban stops applying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BanExpiry {
    Never,
    /// Duration in milliseconds from issue time.
    After(Ms),
    /// Absolute instant.
    At(Ms),
}

impl BanExpiry {
    fn resolve(self, now: Ms) -> Result<Option<Ms>, EngineError> {
        match self {
            BanExpiry::Never => Ok(None),
            BanExpiry::After(ms) if ms <= 0 => {
                Err(EngineError::bad_request("ban duration must be positive"))
            }
            BanExpiry::After(ms) if ms > MAX_BAN_DURATION_MS => {
                Err(EngineError::LimitExceeded("ban duration too long"))
            }
            BanExpiry::After(ms) => Ok(Some(now + ms)),
            BanExpiry::At(at) if at <= now => {
                Err(EngineError::bad_request("ban expiry must be in the future"))
            }
            BanExpiry::At(at) if at - now > MAX_BAN_DURATION_MS => {
                Err(EngineError::LimitExceeded("ban duration too long"))
            }
            BanExpiry::At(at) => Ok(Some(at)),
        }
    }
}

impl Engine {
    /// The most recent non-revoked ban decides; older ones never resurface.
    pub(super) fn is_banned_at(&self, user_id: Ulid, now: Ms) -> bool {
        self.store
            .bans_for(&user_id)
            .iter()
            .rev()
            .find(|b| b.revocation.is_none())
            .is_some_and(|b| b.is_active(now))
    }

    pub fn is_banned(&self, user_id: Ulid) -> bool {
        self.is_banned_at(user_id, now_ms())
    }

    pub fn active_ban(&self, user_id: Ulid) -> Option<Ban> {
        let now = now_ms();
        self.store
            .bans_for(&user_id)
            .into_iter()
            .rev()
            .find(|b| b.revocation.is_none())
            .filter(|b| b.is_active(now))
    }

    /// Issue a ban, revoking whatever ban the user currently has in the same commit.
    pub async fn create_ban(
        &self,
        actor: Ulid,
        user_id: Ulid,
        reason: Option<String>,
        expiry: BanExpiry,
    ) -> Result<Ulid, EngineError> {
        let started = Instant::now();
        let result = self
            .try_create_ban(actor, user_id, reason.clone(), expiry)
            .await;
        let target = AuditTarget {
            actor,
            target_type: "ban",
            target_id: result.as_ref().ok().copied(),
            diff: Some(json!({ "user_id": user_id, "reason": reason, "expiry": expiry })),
        };
        self.conclude("ban.create", started, target, result)
    }

    async fn try_create_ban(
        &self,
        actor: Ulid,
        user_id: Ulid,
        reason: Option<String>,
        expiry: BanExpiry,
    ) -> Result<Ulid, EngineError> {
        self.require_capability(actor, Capability::ManageBans).await?;
        let reason = optional_reason(reason)?;
        let _ban_guard = self.ban_write.lock().await;
        let now = now_ms();
        let expires_at = expiry.resolve(now)?;

        let mut commit: Commit = self
            .store
            .bans_for(&user_id)
            .into_iter()
            .filter(|b| b.is_active(now))
            .map(|b| Event::BanRevoked {
                id: b.id,
                user_id,
                revocation: BanRevocation {
                    revoked_by: actor,
                    revoked_at: now,
                    reason: Some(SUPERSEDED.into()),
                },
            })
            .collect();

        let id = Ulid::new();
        commit.push(Event::BanIssued {
            ban: Ban {
                id,
                user_id,
                reason,
                expires_at,
                created_by: actor,
                created_at: now,
                revocation: None,
            },
        });
        self.persist(commit).await?;
        Ok(id)
    }

    /// Revoking an already revoked ban succeeds without writing anything.
    pub async fn revoke_ban(
        &self,
        actor: Ulid,
        ban_id: Ulid,
        reason: Option<String>,
    ) -> Result<(), EngineError> {
        let started = Instant::now();
        let result = self.try_revoke_ban(actor, ban_id, reason.clone()).await;
        let target = AuditTarget {
            actor,
            target_type: "ban",
            target_id: Some(ban_id),
            diff: reason.map(|r| json!({ "reason": r })),
        };
        self.conclude("ban.revoke", started, target, result)
    }

    async fn try_revoke_ban(
        &self,
        actor: Ulid,
        ban_id: Ulid,
        reason: Option<String>,
    ) -> Result<(), EngineError> {
        self.require_capability(actor, Capability::ManageBans).await?;
        let reason = optional_reason(reason)?;
        let _ban_guard = self.ban_write.lock().await;
        let ban = self
            .store
            .ban(&ban_id)
            .ok_or(EngineError::not_found("ban", ban_id))?;
        if ban.revocation.is_some() {
            return Ok(());
        }
        self.persist(vec![Event::BanRevoked {
            id: ban_id,
            user_id: ban.user_id,
            revocation: BanRevocation {
                revoked_by: actor,
                revoked_at: now_ms(),
                reason,
            },
        }])
        .await
    }
}
