use std::collections::HashMap;

use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{now_ms, Engine, EngineError};

#[derive(Clone, Copy)]
enum GroupBy {
    Room,
    Applicant,
}

impl Engine {
    /// Approved seconds per room inside `window`, largest first.
    pub async fn room_usage(&self, window: Span) -> Result<Vec<UsageEntry>, EngineError> {
        self.usage(window, GroupBy::Room).await
    }

    /// Approved seconds per applicant inside `window`, largest first.
    pub async fn user_usage(&self, window: Span) -> Result<Vec<UsageEntry>, EngineError> {
        self.usage(window, GroupBy::Applicant).await
    }

    pub async fn room_usage_leaderboard(
        &self,
        window_days: u32,
    ) -> Result<Vec<UsageEntry>, EngineError> {
        self.usage(trailing_window(window_days)?, GroupBy::Room).await
    }

    pub async fn user_usage_leaderboard(
        &self,
        window_days: u32,
    ) -> Result<Vec<UsageEntry>, EngineError> {
        self.usage(trailing_window(window_days)?, GroupBy::Applicant)
            .await
    }

    /// Each room is read under its own read lock, one at a time; the totals
    /// are not a single snapshot across rooms.
    async fn usage(&self, window: Span, group: GroupBy) -> Result<Vec<UsageEntry>, EngineError> {
        if window.start >= window.end {
            return Err(EngineError::bad_request("window end must be after start"));
        }
        let mut totals: HashMap<Ulid, Ms> = HashMap::new();
        for rs in self.store.rooms() {
            let guard = rs.read().await;
            for r in guard
                .overlapping(&window)
                .filter(|r| r.status == ReservationStatus::Approved)
            {
                let key = match group {
                    GroupBy::Room => guard.room.id,
                    GroupBy::Applicant => r.applicant_id,
                };
                *totals.entry(key).or_default() += r.span.clipped_ms(&window);
            }
        }
        Ok(rank(totals))
    }
}

fn trailing_window(window_days: u32) -> Result<Span, EngineError> {
    if window_days == 0 {
        return Err(EngineError::bad_request("window must be at least one day"));
    }
    if window_days > MAX_USAGE_WINDOW_DAYS {
        return Err(EngineError::LimitExceeded("usage window too long"));
    }
    let now = now_ms();
    Ok(Span::new(now - window_days as Ms * DAY, now))
}

fn rank(totals: HashMap<Ulid, Ms>) -> Vec<UsageEntry> {
    let mut entries: Vec<UsageEntry> = totals
        .into_iter()
        .filter(|(_, ms)| *ms > 0)
        .map(|(id, ms)| UsageEntry {
            id,
            total_seconds: ms / SECOND,
        })
        .collect();
    entries.sort_by(|a, b| b.total_seconds.cmp(&a.total_seconds).then(a.id.cmp(&b.id)));
    entries.truncate(LEADERBOARD_LIMIT);
    entries
}
