//! Caches in front of the review-scheduling record store
//!
//! Three dependency caches, one per kind of derived data:
//!
//! - scheduling results keyed by card and answer quality, depending on the card
//! - due-card selections keyed by deck, minimum count and exclusion set, depending on the deck
//! - deck statistics, depending on the deck
//!
//! Saving a batch of reviews invalidates the selections and statistics of every deck it
//! touched, so the next read goes back to the store.

use std::{
    collections::{BTreeSet, HashSet},
    sync::Arc,
};

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info};

use crate::{
    config::{ReviewSettings, TtlPolicy},
    dependency::{dependency_set, DependencyCache},
    error::Result,
    monitor::{OperationTimer, PerformanceMonitor},
    records::{CardRecord, CardUpdate, RecordQuery, RecordSort, RecordStore, ReviewOutcome},
};

/// Shared, immutable list of selected cards
pub type CardSelection = Arc<Vec<CardRecord>>;

/// Aggregate progress of one deck
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeckStats {
    pub total_cards: usize,
    pub mastered_cards: usize,
    /// Due now and not yet reviewed today
    pub ready_count: usize,
    pub today_review_count: usize,
    /// Scheduled before the start of today
    pub overdue: usize,
    pub mastery_percentage: u32,
    pub study_streak: u32,
}

/// Entry counts of the three review caches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewCacheMetrics {
    pub results: usize,
    pub selections: usize,
    pub stats: usize,
}

impl ReviewCacheMetrics {
    pub fn total(&self) -> usize {
        self.results + self.selections + self.stats
    }
}

pub fn card_dependency(card_id: &str) -> String {
    format!("card:{}", card_id)
}

pub fn deck_dependency(deck_id: &str) -> String {
    format!("deck:{}", deck_id)
}

fn result_key(card_id: &str, quality: u8) -> String {
    format!("review_{}_{}", card_id, quality)
}

fn selection_key(deck_id: &str, min_cards: usize, exclude: &BTreeSet<String>) -> String {
    let mut hasher = Sha256::new();
    for id in exclude {
        hasher.update(id.as_bytes());
        hasher.update([0u8]);
    }
    let digest = format!("{:x}", hasher.finalize());
    format!("selection_{}_{}_{}", deck_id, min_cards, &digest[..16])
}

fn stats_key(deck_id: &str) -> String {
    format!("deck_stats_{}", deck_id)
}

/// Midnight UTC of the day containing `now`
fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|midnight| Utc.from_utc_datetime(&midnight))
        .unwrap_or(now)
}

/// Review-scheduling caches
#[derive(Debug)]
pub struct ReviewCache {
    ttl: TtlPolicy,
    mastery_interval_days: f64,
    results: DependencyCache<ReviewOutcome>,
    selections: DependencyCache<CardSelection>,
    stats: DependencyCache<DeckStats>,
    monitor: Arc<PerformanceMonitor>,
}

impl ReviewCache {
    pub fn new(ttl: TtlPolicy, settings: &ReviewSettings, monitor: Arc<PerformanceMonitor>) -> Self {
        Self {
            ttl,
            mastery_interval_days: settings.mastery_interval_days,
            results: DependencyCache::new("review_results", settings.result_cache, monitor.clone()),
            selections: DependencyCache::new(
                "card_selections",
                settings.selection_cache,
                monitor.clone(),
            ),
            stats: DependencyCache::new("deck_stats", settings.stats_cache, monitor.clone()),
            monitor,
        }
    }

    pub fn cache_result(&self, card_id: &str, quality: u8, outcome: ReviewOutcome) {
        let timer = OperationTimer::start();
        self.results.put(
            &result_key(card_id, quality),
            outcome,
            self.ttl.review_results(),
            dependency_set([card_dependency(card_id)]),
        );
        self.monitor.record_calculation(timer.elapsed());
    }

    pub fn cached_result(&self, card_id: &str, quality: u8) -> Option<ReviewOutcome> {
        self.results.get(&result_key(card_id, quality))
    }

    pub fn cache_selection(
        &self,
        deck_id: &str,
        min_cards: usize,
        exclude: &BTreeSet<String>,
        cards: CardSelection,
    ) {
        let cost = (cards.len() * std::mem::size_of::<CardRecord>()) as u64;
        self.selections.put_with_cost(
            &selection_key(deck_id, min_cards, exclude),
            cards,
            self.ttl.card_selections(),
            dependency_set([deck_dependency(deck_id)]),
            cost,
        );
    }

    pub fn cached_selection(
        &self,
        deck_id: &str,
        min_cards: usize,
        exclude: &BTreeSet<String>,
    ) -> Option<CardSelection> {
        self.selections
            .get(&selection_key(deck_id, min_cards, exclude))
    }

    pub fn cache_deck_stats(&self, deck_id: &str, stats: DeckStats) {
        self.stats.put(
            &stats_key(deck_id),
            stats,
            self.ttl.deck_stats(),
            dependency_set([deck_dependency(deck_id)]),
        );
    }

    pub fn cached_deck_stats(&self, deck_id: &str) -> Option<DeckStats> {
        self.stats.get(&stats_key(deck_id))
    }

    /// Drop every cached result for `card_id`
    pub fn invalidate_card(&self, card_id: &str) -> usize {
        self.results.invalidate(&card_dependency(card_id)).len()
    }

    /// Drop the selections and statistics of `deck_id`
    pub fn invalidate_deck(&self, deck_id: &str) -> usize {
        let dependency = deck_dependency(deck_id);
        let removed =
            self.selections.invalidate(&dependency).len() + self.stats.invalidate(&dependency).len();
        debug!(deck = %deck_id, removed, "Invalidated deck caches");
        removed
    }

    /// Due cards of `deck_id`, earliest first, from cache or the store
    pub async fn due_cards(
        &self,
        store: &dyn RecordStore,
        deck_id: &str,
        now: DateTime<Utc>,
    ) -> Result<CardSelection> {
        let timer = OperationTimer::start();
        let exclude = BTreeSet::new();
        if let Some(cached) = self.cached_selection(deck_id, 0, &exclude) {
            self.monitor.record_latency(timer.elapsed());
            return Ok(cached);
        }

        let query = RecordQuery::for_deck(deck_id)
            .due_before(now)
            .sorted_by(RecordSort::NextReview)
            .sorted_by(RecordSort::ReviewCount);
        let cards: CardSelection = Arc::new(store.fetch(&query).await?);
        self.cache_selection(deck_id, 0, &exclude, cards.clone());

        let elapsed = timer.elapsed();
        self.monitor.record_latency(elapsed);
        self.monitor.record_selection(elapsed);
        debug!(deck = %deck_id, due = cards.len(), "Loaded due cards");
        Ok(cards)
    }

    /// Statistics of `deck_id`, from cache or computed with store counts
    pub async fn deck_stats(
        &self,
        store: &dyn RecordStore,
        deck_id: &str,
        now: DateTime<Utc>,
    ) -> Result<DeckStats> {
        let timer = OperationTimer::start();
        if let Some(cached) = self.cached_deck_stats(deck_id) {
            self.monitor.record_latency(timer.elapsed());
            return Ok(cached);
        }

        let today = start_of_day(now);
        let yesterday = today - ChronoDuration::days(1);
        let deck = RecordQuery::for_deck(deck_id);

        let total_cards = store.count(&deck).await?;
        let mastered_cards = store
            .count(&deck.clone().min_interval_days(self.mastery_interval_days))
            .await?;
        let ready_count = store
            .count(&deck.clone().due_before(now).not_reviewed_since(today))
            .await?;
        let today_review_count = store.count(&deck.clone().reviewed_since(today)).await?;
        let overdue = store.count(&deck.clone().overdue_before(today)).await?;
        let recent = store.count(&deck.reviewed_since(yesterday)).await?;

        let mastery_percentage = if total_cards == 0 {
            0
        } else {
            (mastered_cards * 100 / total_cards) as u32
        };
        let stats = DeckStats {
            total_cards,
            mastered_cards,
            ready_count,
            today_review_count,
            overdue,
            mastery_percentage,
            study_streak: u32::from(recent > 0),
        };
        self.cache_deck_stats(deck_id, stats.clone());

        let elapsed = timer.elapsed();
        self.monitor.record_latency(elapsed);
        self.monitor.record_stats(elapsed);
        Ok(stats)
    }

    /// Persist a batch of reviews
    ///
    /// On failure the store is rolled back and the error returned with the caches
    /// untouched. On success each outcome is cached and the touched decks are
    /// invalidated.
    pub async fn apply_reviews(&self, store: &dyn RecordStore, updates: &[CardUpdate]) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let timer = OperationTimer::start();

        if let Err(err) = store.save(updates).await {
            error!(error = %err, batch = updates.len(), "Review batch failed, rolling back");
            if let Err(rollback_err) = store.rollback().await {
                error!(error = %rollback_err, "Rollback failed");
            }
            return Err(err);
        }

        let mut decks = HashSet::new();
        for update in updates {
            self.cache_result(&update.card_id, update.quality, update.outcome.clone());
            decks.insert(update.deck_id.as_str());
        }
        for deck_id in &decks {
            self.invalidate_deck(deck_id);
        }

        let elapsed = timer.elapsed();
        self.monitor.record_batch(elapsed);
        info!(
            batch = updates.len(),
            decks = decks.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Saved review batch"
        );
        Ok(())
    }

    /// Drop stale entries from all three caches
    pub fn purge_stale(&self) -> usize {
        self.results.purge_stale() + self.selections.purge_stale() + self.stats.purge_stale()
    }

    pub fn clear(&self) {
        self.results.clear();
        self.selections.clear();
        self.stats.clear();
    }

    pub fn metrics(&self) -> ReviewCacheMetrics {
        ReviewCacheMetrics {
            results: self.results.len(),
            selections: self.selections.len(),
            stats: self.stats.len(),
        }
    }
}
