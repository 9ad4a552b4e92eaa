use chrono::{DateTime, Duration, Utc};
use gigfeed_core::{EventFilter, InteractionEvent, InteractionType};
use uuid::Uuid;

use crate::{check_limit, check_window, FeedService, RankError};

pub const DEFAULT_HISTORY_LIMIT: usize = 100;
pub const MAX_HISTORY_LIMIT: usize = 500;
pub const DEFAULT_HISTORY_DAYS: i64 = 90;
pub const MAX_HISTORY_DAYS: i64 = 365;

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryQuery {
    pub user_uid: Uuid,
    /// `None` matches every interaction type.
    pub types: Option<Vec<InteractionType>>,
    pub limit: usize,
    pub days: i64,
}

impl HistoryQuery {
    pub fn new(user_uid: Uuid) -> Self {
        Self {
            user_uid,
            types: None,
            limit: DEFAULT_HISTORY_LIMIT,
            days: DEFAULT_HISTORY_DAYS,
        }
    }
}

impl FeedService {
    /// Raw logged interactions for one user, newest first.
    pub async fn history(&self, query: &HistoryQuery, now: DateTime<Utc>) -> Result<Vec<InteractionEvent>, RankError> {
        check_limit(query.limit, MAX_HISTORY_LIMIT)?;
        check_window("days", query.days, 1, MAX_HISTORY_DAYS)?;

        let filter = EventFilter {
            user_uid: Some(query.user_uid),
            types: query.types.clone().filter(|t| !t.is_empty()),
            since: Some(now - Duration::days(query.days)),
            ..EventFilter::default()
        };
        let mut events = self.log.query(&filter).await.map_err(RankError::Upstream)?;
        events.sort_by(|a, b| b.occurred_at.cmp(&a.occurred_at));
        events.truncate(query.limit);
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::*;
    use gigfeed_core::FeedError;

    #[tokio::test]
    async fn newest_first_within_the_day_window() {
        let worker = user(&[], None);
        let other = user(&[], None);
        let gig = listing(&[1], 1, None);
        let fx = fixture(vec![gig.clone()], vec![worker.clone(), other.clone()]);
        fx.record_all([
            event(&worker, &gig, InteractionType::View, 48),
            event(&worker, &gig, InteractionType::Apply, 1),
            event(&worker, &gig, InteractionType::Click, 24 * 40),
            event(&other, &gig, InteractionType::Save, 2),
        ])
        .await;

        let query = HistoryQuery {
            days: 30,
            ..HistoryQuery::new(worker.uid)
        };
        let events = fx.service.history(&query, now()).await.expect("history");
        let kinds: Vec<InteractionType> = events.iter().map(|e| e.interaction_type).collect();
        assert_eq!(kinds, vec![InteractionType::Apply, InteractionType::View]);
    }

    #[tokio::test]
    async fn type_filter_and_limit_apply() {
        let worker = user(&[], None);
        let gig = listing(&[1], 1, None);
        let fx = fixture(vec![gig.clone()], vec![worker.clone()]);
        fx.record_all((1..=4).map(|h| event(&worker, &gig, InteractionType::View, h))).await;
        fx.record_all([event(&worker, &gig, InteractionType::Save, 5)]).await;

        let query = HistoryQuery {
            types: Some(vec![InteractionType::View]),
            limit: 2,
            ..HistoryQuery::new(worker.uid)
        };
        let events = fx.service.history(&query, now()).await.expect("history");
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.interaction_type == InteractionType::View));
        assert_eq!(events[0].occurred_at, now() - Duration::hours(1));
    }

    #[tokio::test]
    async fn out_of_range_days_and_limits_are_rejected() {
        let fx = fixture(Vec::new(), Vec::new());
        let base = HistoryQuery::new(Uuid::new_v4());
        let too_many_days = HistoryQuery { days: 366, ..base.clone() };
        let too_many_rows = HistoryQuery { limit: 501, ..base };
        assert!(matches!(
            fx.service.history(&too_many_days, now()).await,
            Err(RankError::Invalid(FeedError::InvalidWindow { name: "days", .. }))
        ));
        assert!(matches!(
            fx.service.history(&too_many_rows, now()).await,
            Err(RankError::Invalid(FeedError::InvalidLimit { .. }))
        ));
    }
}
