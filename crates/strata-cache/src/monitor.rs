//! Cache performance monitoring and alerting

use std::{collections::VecDeque, fmt, time::Duration};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::config::MonitorSettings;

const MAX_RECENT_ALERTS: usize = 20;

/// Severity of a performance alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

/// What an alert is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    LowHitRate,
    HighLatency,
    HighEvictionRate,
    SlowRequest,
    SlowReviewOperation,
}

/// A threshold violation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceAlert {
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub value: f64,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

impl PerformanceAlert {
    fn new(kind: AlertKind, severity: AlertSeverity, value: f64, message: String) -> Self {
        Self {
            kind,
            severity,
            value,
            message,
            raised_at: Utc::now(),
        }
    }

    fn log(&self) {
        match self.severity {
            AlertSeverity::Warning => warn!(kind = ?self.kind, value = self.value, "{}", self.message),
            AlertSeverity::Critical => {
                error!(kind = ?self.kind, value = self.value, "{}", self.message)
            }
        }
    }
}

/// Overall cache health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Excellent,
    Good,
    Fair,
    Critical,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            HealthStatus::Excellent => "excellent",
            HealthStatus::Good => "good",
            HealthStatus::Fair => "fair",
            HealthStatus::Critical => "critical",
        };
        f.write_str(label)
    }
}

/// Timed operations of the review-scheduling caches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewOperation {
    Calculation,
    Selection,
    Stats,
    Batch,
}

impl ReviewOperation {
    fn index(self) -> usize {
        match self {
            ReviewOperation::Calculation => 0,
            ReviewOperation::Selection => 1,
            ReviewOperation::Stats => 2,
            ReviewOperation::Batch => 3,
        }
    }

    fn threshold_ms(self, settings: &MonitorSettings) -> f64 {
        match self {
            ReviewOperation::Calculation => settings.calculation_threshold_ms,
            ReviewOperation::Selection => settings.selection_threshold_ms,
            ReviewOperation::Stats => settings.stats_threshold_ms,
            ReviewOperation::Batch => settings.batch_threshold_ms,
        }
    }
}

/// Count and total time of one kind of review operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationTiming {
    pub count: u64,
    pub total_ms: f64,
    pub slow: u64,
}

impl OperationTiming {
    pub fn average_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_ms / self.count as f64
        }
    }
}

/// Point-in-time view of the monitor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub evictions: u64,
    pub disk_hits: u64,
    pub disk_misses: u64,
    pub dropped_writes: u64,
    pub latency_samples: u64,
    pub total_latency_ms: f64,
    pub peak_latency_ms: f64,
    pub calculation: OperationTiming,
    pub selection: OperationTiming,
    pub stats: OperationTiming,
    pub batch: OperationTiming,
    pub taken_at: DateTime<Utc>,
}

impl PerformanceSnapshot {
    pub fn requests(&self) -> u64 {
        self.hits + self.misses
    }

    /// Hit rate as a percentage (0.0 to 100.0)
    pub fn hit_rate(&self) -> f64 {
        percentage(self.hits, self.requests())
    }

    pub fn average_latency_ms(&self) -> f64 {
        if self.latency_samples == 0 {
            0.0
        } else {
            self.total_latency_ms / self.latency_samples as f64
        }
    }

    /// Evictions as a percentage of writes
    pub fn eviction_rate(&self) -> f64 {
        percentage(self.evictions, self.writes)
    }

    /// Disk hit rate as a percentage
    pub fn disk_hit_rate(&self) -> f64 {
        percentage(self.disk_hits, self.disk_hits + self.disk_misses)
    }
}

fn percentage(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        (part as f64 / whole as f64) * 100.0
    }
}

#[derive(Debug, Default)]
struct MonitorState {
    hits: u64,
    misses: u64,
    writes: u64,
    evictions: u64,
    disk_hits: u64,
    disk_misses: u64,
    dropped_writes: u64,
    latency_samples: u64,
    total_latency_ms: f64,
    peak_latency_ms: f64,
    latency_history: VecDeque<f64>,
    hit_rate_history: VecDeque<f64>,
    review: [OperationTiming; 4],
    recent_alerts: VecDeque<PerformanceAlert>,
}

impl MonitorState {
    fn requests(&self) -> u64 {
        self.hits + self.misses
    }

    fn push_alert(&mut self, alert: PerformanceAlert) {
        alert.log();
        if self.recent_alerts.len() == MAX_RECENT_ALERTS {
            self.recent_alerts.pop_front();
        }
        self.recent_alerts.push_back(alert);
    }
}

/// Records cache events and raises alerts when thresholds are crossed
///
/// Shared across every tier through an `Arc`. Counters are kept under one lock so a
/// [`PerformanceSnapshot`] is always internally consistent. The numbers only feed
/// reporting and never influence cache correctness.
#[derive(Debug)]
pub struct PerformanceMonitor {
    settings: MonitorSettings,
    state: Mutex<MonitorState>,
}

impl PerformanceMonitor {
    pub fn new(settings: MonitorSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(MonitorState::default()),
        }
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    pub fn record_hit(&self) {
        let mut state = self.state.lock();
        state.hits += 1;
        self.after_request(&mut state);
    }

    pub fn record_miss(&self) {
        let mut state = self.state.lock();
        state.misses += 1;
        self.after_request(&mut state);
    }

    pub fn record_write(&self) {
        self.state.lock().writes += 1;
    }

    pub fn record_evictions(&self, count: u64) {
        if count > 0 {
            self.state.lock().evictions += count;
        }
    }

    pub fn record_disk_hit(&self) {
        self.state.lock().disk_hits += 1;
    }

    pub fn record_disk_miss(&self) {
        self.state.lock().disk_misses += 1;
    }

    pub fn record_dropped_write(&self) {
        self.state.lock().dropped_writes += 1;
    }

    /// Record how long one cache request took
    pub fn record_latency(&self, latency: Duration) {
        let latency_ms = latency.as_secs_f64() * 1000.0;
        let mut state = self.state.lock();
        state.latency_samples += 1;
        state.total_latency_ms += latency_ms;
        state.peak_latency_ms = state.peak_latency_ms.max(latency_ms);
        if state.latency_history.len() >= self.settings.history_len {
            state.latency_history.pop_front();
        }
        state.latency_history.push_back(latency_ms);

        if latency_ms > self.settings.slow_request_ms {
            let alert = PerformanceAlert::new(
                AlertKind::SlowRequest,
                AlertSeverity::Warning,
                latency_ms,
                format!("Slow cache request: {:.2}ms", latency_ms),
            );
            state.push_alert(alert);
        }
    }

    /// Record the duration of a review-scheduling operation
    pub fn record_review_operation(&self, operation: ReviewOperation, elapsed: Duration) {
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        let threshold_ms = operation.threshold_ms(&self.settings);
        let mut state = self.state.lock();
        let timing = &mut state.review[operation.index()];
        timing.count += 1;
        timing.total_ms += elapsed_ms;

        if elapsed_ms > threshold_ms {
            timing.slow += 1;
            let alert = PerformanceAlert::new(
                AlertKind::SlowReviewOperation,
                AlertSeverity::Warning,
                elapsed_ms,
                format!(
                    "Slow {:?} operation: {:.2}ms (threshold {:.0}ms)",
                    operation, elapsed_ms, threshold_ms
                ),
            );
            state.push_alert(alert);
        }
    }

    pub fn record_calculation(&self, elapsed: Duration) {
        self.record_review_operation(ReviewOperation::Calculation, elapsed);
    }

    pub fn record_selection(&self, elapsed: Duration) {
        self.record_review_operation(ReviewOperation::Selection, elapsed);
    }

    pub fn record_stats(&self, elapsed: Duration) {
        self.record_review_operation(ReviewOperation::Stats, elapsed);
    }

    pub fn record_batch(&self, elapsed: Duration) {
        self.record_review_operation(ReviewOperation::Batch, elapsed);
    }

    fn after_request(&self, state: &mut MonitorState) {
        let requests = state.requests();
        if requests % self.settings.hit_rate_sample_interval != 0 {
            return;
        }

        let hit_rate = percentage(state.hits, requests);
        if state.hit_rate_history.len() >= self.settings.history_len {
            state.hit_rate_history.pop_front();
        }
        state.hit_rate_history.push_back(hit_rate);

        let severity = if hit_rate < self.settings.critical_hit_rate {
            Some(AlertSeverity::Critical)
        } else if hit_rate < self.settings.warning_hit_rate {
            Some(AlertSeverity::Warning)
        } else {
            None
        };
        if let Some(severity) = severity {
            let alert = PerformanceAlert::new(
                AlertKind::LowHitRate,
                severity,
                hit_rate,
                format!("Cache hit rate at {:.1}% after {} requests", hit_rate, requests),
            );
            state.push_alert(alert);
        }
    }

    /// Hit rate as a percentage (0.0 to 100.0)
    pub fn hit_rate(&self) -> f64 {
        let state = self.state.lock();
        percentage(state.hits, state.requests())
    }

    pub fn average_latency_ms(&self) -> f64 {
        self.snapshot().average_latency_ms()
    }

    pub fn latency_history(&self) -> Vec<f64> {
        self.state.lock().latency_history.iter().copied().collect()
    }

    pub fn hit_rate_history(&self) -> Vec<f64> {
        self.state.lock().hit_rate_history.iter().copied().collect()
    }

    pub fn recent_alerts(&self) -> Vec<PerformanceAlert> {
        self.state.lock().recent_alerts.iter().cloned().collect()
    }

    /// Evaluate the current counters against the alert thresholds
    pub fn check_alerts(&self) -> Vec<PerformanceAlert> {
        let snapshot = self.snapshot();
        let mut alerts = Vec::new();

        if snapshot.requests() > 0 && snapshot.hit_rate() < self.settings.critical_hit_rate {
            alerts.push(PerformanceAlert::new(
                AlertKind::LowHitRate,
                AlertSeverity::Critical,
                snapshot.hit_rate(),
                format!("Hit rate critically low: {:.1}%", snapshot.hit_rate()),
            ));
        }

        let average_latency = snapshot.average_latency_ms();
        if average_latency > self.settings.alert_latency_ms {
            alerts.push(PerformanceAlert::new(
                AlertKind::HighLatency,
                AlertSeverity::Warning,
                average_latency,
                format!("Average latency high: {:.2}ms", average_latency),
            ));
        }

        if snapshot.eviction_rate() > self.settings.alert_eviction_rate {
            alerts.push(PerformanceAlert::new(
                AlertKind::HighEvictionRate,
                AlertSeverity::Warning,
                snapshot.eviction_rate(),
                format!("Eviction rate high: {:.1}%", snapshot.eviction_rate()),
            ));
        }

        for alert in &alerts {
            alert.log();
        }
        alerts
    }

    /// Classify health from hit rate and average latency
    ///
    /// A monitor that has not served any request yet reports `Excellent`.
    pub fn health(&self) -> HealthStatus {
        let snapshot = self.snapshot();
        if snapshot.requests() == 0 {
            return HealthStatus::Excellent;
        }
        classify_health(snapshot.hit_rate(), snapshot.average_latency_ms())
    }

    pub fn snapshot(&self) -> PerformanceSnapshot {
        let state = self.state.lock();
        PerformanceSnapshot {
            hits: state.hits,
            misses: state.misses,
            writes: state.writes,
            evictions: state.evictions,
            disk_hits: state.disk_hits,
            disk_misses: state.disk_misses,
            dropped_writes: state.dropped_writes,
            latency_samples: state.latency_samples,
            total_latency_ms: state.total_latency_ms,
            peak_latency_ms: state.peak_latency_ms,
            calculation: state.review[ReviewOperation::Calculation.index()],
            selection: state.review[ReviewOperation::Selection.index()],
            stats: state.review[ReviewOperation::Stats.index()],
            batch: state.review[ReviewOperation::Batch.index()],
            taken_at: Utc::now(),
        }
    }

    /// Human-readable summary of the current counters
    pub fn report(&self) -> String {
        let snapshot = self.snapshot();
        let health = self.health();
        format!(
            "Cache Performance:\n  Health: {}\n  Requests: {}\n  Hit Rate: {:.2}%\n  Writes: {}\n  Evictions: {} ({:.2}%)\n  Disk Hit Rate: {:.2}%\n  Dropped Writes: {}\n  Avg Latency: {:.2}ms\n  Peak Latency: {:.2}ms\n  Review Calculations: {} (avg {:.2}ms)\n  Card Selections: {} (avg {:.2}ms)\n  Deck Stats: {} (avg {:.2}ms)\n  Batches: {} (avg {:.2}ms)",
            health,
            snapshot.requests(),
            snapshot.hit_rate(),
            snapshot.writes,
            snapshot.evictions,
            snapshot.eviction_rate(),
            snapshot.disk_hit_rate(),
            snapshot.dropped_writes,
            snapshot.average_latency_ms(),
            snapshot.peak_latency_ms,
            snapshot.calculation.count,
            snapshot.calculation.average_ms(),
            snapshot.selection.count,
            snapshot.selection.average_ms(),
            snapshot.stats.count,
            snapshot.stats.average_ms(),
            snapshot.batch.count,
            snapshot.batch.average_ms(),
        )
    }

    /// Reset all counters and histories
    pub fn reset(&self) {
        *self.state.lock() = MonitorState::default();
    }
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new(MonitorSettings::default())
    }
}

fn classify_health(hit_rate: f64, average_latency_ms: f64) -> HealthStatus {
    if hit_rate >= 85.0 && average_latency_ms <= 50.0 {
        HealthStatus::Excellent
    } else if hit_rate >= 70.0 && average_latency_ms <= 100.0 {
        HealthStatus::Good
    } else if hit_rate >= 50.0 && average_latency_ms <= 200.0 {
        HealthStatus::Fair
    } else {
        HealthStatus::Critical
    }
}

/// Operation timing helper
#[derive(Debug)]
pub struct OperationTimer {
    start_time: std::time::Instant,
}

impl OperationTimer {
    /// Start timing an operation
    pub fn start() -> Self {
        Self {
            start_time: std::time::Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Get elapsed time in milliseconds
    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed().as_secs_f64() * 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> PerformanceMonitor {
        PerformanceMonitor::default()
    }

    #[test]
    fn test_hit_rate() {
        let monitor = monitor();
        for _ in 0..3 {
            monitor.record_hit();
        }
        monitor.record_miss();

        assert_eq!(monitor.hit_rate(), 75.0);
        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.hits, 3);
        assert_eq!(snapshot.misses, 1);
    }

    #[test]
    fn test_hit_rate_sampled_every_interval() {
        let monitor = monitor();
        for _ in 0..49 {
            monitor.record_hit();
        }
        assert!(monitor.hit_rate_history().is_empty());

        monitor.record_miss();
        assert_eq!(monitor.hit_rate_history(), vec![98.0]);
    }

    #[test]
    fn test_low_hit_rate_checkpoint_alert() {
        let monitor = monitor();
        for i in 0..50 {
            if i % 5 == 0 {
                monitor.record_hit();
            } else {
                monitor.record_miss();
            }
        }

        let alerts = monitor.recent_alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::LowHitRate);
        assert_eq!(alerts[0].severity, AlertSeverity::Critical);
    }

    #[test]
    fn test_warning_hit_rate_checkpoint() {
        let monitor = monitor();
        // 30 hits, 20 misses: 60%
        for _ in 0..30 {
            monitor.record_hit();
        }
        for _ in 0..20 {
            monitor.record_miss();
        }

        let alerts = monitor.recent_alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, AlertSeverity::Warning);
    }

    #[test]
    fn test_latency_history_is_bounded() {
        let monitor = monitor();
        for ms in 0..150 {
            monitor.record_latency(Duration::from_millis(ms % 10));
        }

        assert_eq!(monitor.latency_history().len(), 100);
        assert_eq!(monitor.snapshot().latency_samples, 150);
    }

    #[test]
    fn test_slow_request_alert() {
        let monitor = monitor();
        monitor.record_latency(Duration::from_millis(5));
        assert!(monitor.recent_alerts().is_empty());

        monitor.record_latency(Duration::from_millis(150));
        let alerts = monitor.recent_alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::SlowRequest);
        assert_eq!(monitor.snapshot().peak_latency_ms, 150.0);
    }

    #[test]
    fn test_check_alerts() {
        let monitor = monitor();
        monitor.record_hit();
        monitor.record_miss();
        monitor.record_miss();
        monitor.record_latency(Duration::from_millis(300));
        for _ in 0..10 {
            monitor.record_write();
        }
        monitor.record_evictions(3);

        let kinds: Vec<AlertKind> = monitor.check_alerts().iter().map(|a| a.kind).collect();
        assert!(kinds.contains(&AlertKind::LowHitRate));
        assert!(kinds.contains(&AlertKind::HighLatency));
        assert!(kinds.contains(&AlertKind::HighEvictionRate));
    }

    #[test]
    fn test_check_alerts_quiet_when_healthy() {
        let monitor = monitor();
        for _ in 0..9 {
            monitor.record_hit();
        }
        monitor.record_miss();
        monitor.record_latency(Duration::from_millis(2));
        monitor.record_write();

        assert!(monitor.check_alerts().is_empty());
    }

    #[test]
    fn test_health_classification() {
        assert_eq!(classify_health(90.0, 10.0), HealthStatus::Excellent);
        assert_eq!(classify_health(90.0, 80.0), HealthStatus::Good);
        assert_eq!(classify_health(75.0, 20.0), HealthStatus::Good);
        assert_eq!(classify_health(60.0, 150.0), HealthStatus::Fair);
        assert_eq!(classify_health(40.0, 10.0), HealthStatus::Critical);
        assert_eq!(classify_health(95.0, 250.0), HealthStatus::Critical);
    }

    #[test]
    fn test_idle_monitor_is_excellent() {
        assert_eq!(monitor().health(), HealthStatus::Excellent);
    }

    #[test]
    fn test_review_operation_timings() {
        let monitor = monitor();
        monitor.record_review_operation(ReviewOperation::Calculation, Duration::from_millis(10));
        monitor.record_review_operation(ReviewOperation::Calculation, Duration::from_millis(70));

        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.calculation.count, 2);
        assert_eq!(snapshot.calculation.slow, 1);
        assert!((snapshot.calculation.average_ms() - 40.0).abs() < 0.5);
        assert_eq!(snapshot.batch.count, 0);
    }

    #[test]
    fn test_reset() {
        let monitor = monitor();
        monitor.record_hit();
        monitor.record_write();
        monitor.record_latency(Duration::from_millis(120));
        monitor.reset();

        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.requests(), 0);
        assert_eq!(snapshot.writes, 0);
        assert!(monitor.latency_history().is_empty());
        assert!(monitor.recent_alerts().is_empty());
    }

    #[test]
    fn test_report_mentions_health() {
        let monitor = monitor();
        monitor.record_hit();
        let report = monitor.report();
        assert!(report.contains("Health: excellent"));
        assert!(report.contains("Hit Rate: 100.00%"));
    }

    #[test]
    fn test_operation_timer() {
        let timer = OperationTimer::start();
        std::thread::sleep(Duration::from_millis(10));
        assert!(timer.elapsed_ms() >= 10.0);
    }
}
