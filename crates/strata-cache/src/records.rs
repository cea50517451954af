//! Boundary to the persistent record store
//!
//! The caches never own review data. They sit in front of a [`RecordStore`] supplied by
//! the host application, which remains the source of truth.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One reviewable card as stored by the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardRecord {
    pub id: String,
    pub deck_id: String,
    pub interval_days: f64,
    pub ease_factor: f64,
    /// `None` for cards that have never been scheduled
    pub next_review: Option<DateTime<Utc>>,
    pub last_review: Option<DateTime<Utc>>,
    pub review_count: u32,
    pub correct_count: u32,
}

impl CardRecord {
    pub fn is_new(&self) -> bool {
        self.next_review.is_none()
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_review.map_or(true, |due| due <= now)
    }
}

/// Ordering applied to query results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordSort {
    /// Earliest due first, unscheduled cards before scheduled ones
    NextReview,
    /// Least reviewed first
    ReviewCount,
}

/// Filter understood by a [`RecordStore`]
///
/// Every set field narrows the result; unset fields do not filter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordQuery {
    pub deck_id: String,
    /// Unscheduled, or due at or before this instant
    pub due_before: Option<DateTime<Utc>>,
    /// Scheduled strictly before this instant
    pub overdue_before: Option<DateTime<Utc>>,
    pub new_only: bool,
    pub min_interval_days: Option<f64>,
    /// Reviewed at or after this instant
    pub reviewed_since: Option<DateTime<Utc>>,
    /// Never reviewed, or last reviewed before this instant
    pub not_reviewed_since: Option<DateTime<Utc>>,
    pub sort: Vec<RecordSort>,
    pub limit: Option<usize>,
}

impl RecordQuery {
    pub fn for_deck(deck_id: impl Into<String>) -> Self {
        Self {
            deck_id: deck_id.into(),
            ..Default::default()
        }
    }

    pub fn due_before(mut self, at: DateTime<Utc>) -> Self {
        self.due_before = Some(at);
        self
    }

    pub fn overdue_before(mut self, at: DateTime<Utc>) -> Self {
        self.overdue_before = Some(at);
        self
    }

    pub fn new_only(mut self) -> Self {
        self.new_only = true;
        self
    }

    pub fn min_interval_days(mut self, days: f64) -> Self {
        self.min_interval_days = Some(days);
        self
    }

    pub fn reviewed_since(mut self, at: DateTime<Utc>) -> Self {
        self.reviewed_since = Some(at);
        self
    }

    pub fn not_reviewed_since(mut self, at: DateTime<Utc>) -> Self {
        self.not_reviewed_since = Some(at);
        self
    }

    pub fn sorted_by(mut self, sort: RecordSort) -> Self {
        self.sort.push(sort);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Reference predicate for stores that filter in memory
    pub fn matches(&self, record: &CardRecord) -> bool {
        if record.deck_id != self.deck_id {
            return false;
        }
        if let Some(at) = self.due_before {
            if !record.is_due(at) {
                return false;
            }
        }
        if let Some(at) = self.overdue_before {
            if !record.next_review.is_some_and(|due| due < at) {
                return false;
            }
        }
        if self.new_only && !record.is_new() {
            return false;
        }
        if let Some(days) = self.min_interval_days {
            if record.interval_days < days {
                return false;
            }
        }
        if let Some(at) = self.reviewed_since {
            if !record.last_review.is_some_and(|reviewed| reviewed >= at) {
                return false;
            }
        }
        if let Some(at) = self.not_reviewed_since {
            if record.last_review.is_some_and(|reviewed| reviewed >= at) {
                return false;
            }
        }
        true
    }

    /// Filter, sort and limit `records` in memory
    pub fn apply<'a>(&self, records: impl IntoIterator<Item = &'a CardRecord>) -> Vec<CardRecord> {
        let mut selected: Vec<CardRecord> = records
            .into_iter()
            .filter(|record| self.matches(record))
            .cloned()
            .collect();

        selected.sort_by(|a, b| {
            self.sort
                .iter()
                .map(|sort| match sort {
                    RecordSort::NextReview => match (a.next_review, b.next_review) {
                        (None, None) => std::cmp::Ordering::Equal,
                        (None, Some(_)) => std::cmp::Ordering::Less,
                        (Some(_), None) => std::cmp::Ordering::Greater,
                        (Some(a), Some(b)) => a.cmp(&b),
                    },
                    RecordSort::ReviewCount => a.review_count.cmp(&b.review_count),
                })
                .find(|ordering| ordering.is_ne())
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        if let Some(limit) = self.limit {
            selected.truncate(limit);
        }
        selected
    }
}

/// Scheduling result for one review
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewOutcome {
    pub interval_days: f64,
    pub ease_factor: f64,
    pub next_review: DateTime<Utc>,
}

/// A review to persist
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardUpdate {
    pub card_id: String,
    pub deck_id: String,
    /// Answer quality, 0 to 5
    pub quality: u8,
    pub reviewed_at: DateTime<Utc>,
    pub outcome: ReviewOutcome,
}

/// Persistent store of card records
///
/// `save` applies a batch; if it fails the caller invokes `rollback` so a partially
/// applied batch is undone.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn fetch(&self, query: &RecordQuery) -> Result<Vec<CardRecord>>;

    async fn count(&self, query: &RecordQuery) -> Result<usize>;

    async fn save(&self, updates: &[CardUpdate]) -> Result<()>;

    async fn rollback(&self) -> Result<()>;
}
