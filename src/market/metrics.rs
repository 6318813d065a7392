// Performance Metrics for the Market Engine
//
// Tracks run counts, run durations, buyer outcomes and slow runs per cycle
// so operators can see how each batch job behaves over time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::market::orchestrator::RunReport;
use crate::market::Cycle;

const DEFAULT_SLOW_RUN_THRESHOLD: Duration = Duration::from_millis(1000);

/// Shared, cheaply cloneable engine metrics
#[derive(Debug, Clone)]
pub struct EngineMetrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    slow_run_threshold: Duration,
    restock: CycleCounters,
    fulfillment: CycleCounters,
}

#[derive(Debug, Default)]
struct CycleCounters {
    // Run outcomes
    runs: AtomicU64,
    failed_runs: AtomicU64,
    conflicts: AtomicU64,

    // Buyer outcomes
    buyers_served: AtomicU64,
    buyers_skipped: AtomicU64,
    buyers_failed: AtomicU64,
    units_sold: AtomicU64,
    capped_allocations: AtomicU64,

    // Timing (in microseconds)
    total_run_time_us: AtomicU64,
    timed_runs: AtomicU64,
    slow_runs: AtomicU64,
}

impl EngineMetrics {
    /// Create metrics that flag runs slower than `slow_run_threshold`
    pub fn new(slow_run_threshold: Duration) -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                slow_run_threshold,
                restock: CycleCounters::default(),
                fulfillment: CycleCounters::default(),
            }),
        }
    }

    fn counters(&self, cycle: Cycle) -> &CycleCounters {
        match cycle {
            Cycle::Restock => &self.inner.restock,
            Cycle::Fulfillment => &self.inner.fulfillment,
        }
    }

    /// Start timing a run; the duration is recorded when the timer drops
    pub fn start_run(&self, cycle: Cycle) -> RunTimer {
        RunTimer {
            start: Instant::now(),
            cycle,
            metrics: self.clone(),
        }
    }

    /// Record a committed run
    pub fn record_report(&self, report: &RunReport) {
        let counters = self.counters(report.cycle);
        counters.runs.fetch_add(1, Ordering::Relaxed);
        counters.buyers_served.fetch_add(report.buyers_served as u64, Ordering::Relaxed);
        counters.buyers_skipped.fetch_add(report.buyers_skipped as u64, Ordering::Relaxed);
        counters.buyers_failed.fetch_add(report.buyers_failed as u64, Ordering::Relaxed);
        counters.units_sold.fetch_add(report.units_sold, Ordering::Relaxed);
        counters
            .capped_allocations
            .fetch_add(report.capped_allocations as u64, Ordering::Relaxed);
    }

    /// Record a run rejected because another run of the cycle held the lock
    pub fn record_conflict(&self, cycle: Cycle) {
        self.counters(cycle).conflicts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a run that aborted without committing
    pub fn record_failure(&self, cycle: Cycle) {
        self.counters(cycle).failed_runs.fetch_add(1, Ordering::Relaxed);
    }

    fn record_duration(&self, cycle: Cycle, duration: Duration) {
        let counters = self.counters(cycle);
        counters.timed_runs.fetch_add(1, Ordering::Relaxed);
        counters
            .total_run_time_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);

        if duration > self.inner.slow_run_threshold {
            counters.slow_runs.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("Slow {} run: {}ms", cycle, duration.as_millis());
        }
    }

    /// Average run time in milliseconds
    pub fn avg_run_time_ms(&self, cycle: Cycle) -> f64 {
        let counters = self.counters(cycle);
        let count = counters.timed_runs.load(Ordering::Relaxed);
        let total_us = counters.total_run_time_us.load(Ordering::Relaxed);

        if count == 0 {
            0.0
        } else {
            (total_us as f64 / count as f64) / 1000.0
        }
    }

    pub fn summary(&self, cycle: Cycle) -> MetricsSummary {
        let counters = self.counters(cycle);
        MetricsSummary {
            cycle,
            runs: counters.runs.load(Ordering::Relaxed),
            failed_runs: counters.failed_runs.load(Ordering::Relaxed),
            conflicts: counters.conflicts.load(Ordering::Relaxed),
            buyers_served: counters.buyers_served.load(Ordering::Relaxed),
            buyers_skipped: counters.buyers_skipped.load(Ordering::Relaxed),
            buyers_failed: counters.buyers_failed.load(Ordering::Relaxed),
            units_sold: counters.units_sold.load(Ordering::Relaxed),
            capped_allocations: counters.capped_allocations.load(Ordering::Relaxed),
            avg_run_time_ms: self.avg_run_time_ms(cycle),
            slow_runs: counters.slow_runs.load(Ordering::Relaxed),
        }
    }

    /// Log both cycles' summaries
    pub fn log_summary(&self) {
        for cycle in [Cycle::Restock, Cycle::Fulfillment] {
            let summary = self.summary(cycle);
            tracing::info!(
                "Market engine {} metrics: {} runs ({} failed, {} conflicts), \
                 avg {:.2}ms, {} slow; buyers {} served / {} skipped / {} failed; \
                 {} units sold, {} capped allocations",
                summary.cycle,
                summary.runs,
                summary.failed_runs,
                summary.conflicts,
                summary.avg_run_time_ms,
                summary.slow_runs,
                summary.buyers_served,
                summary.buyers_skipped,
                summary.buyers_failed,
                summary.units_sold,
                summary.capped_allocations,
            );
        }
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new(DEFAULT_SLOW_RUN_THRESHOLD)
    }
}

/// Timer for one run; records its duration on drop
pub struct RunTimer {
    start: Instant,
    cycle: Cycle,
    metrics: EngineMetrics,
}

impl Drop for RunTimer {
    fn drop(&mut self) {
        self.metrics.record_duration(self.cycle, self.start.elapsed());
    }
}

/// Point-in-time view of one cycle's counters
#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub cycle: Cycle,
    pub runs: u64,
    pub failed_runs: u64,
    pub conflicts: u64,
    pub buyers_served: u64,
    pub buyers_skipped: u64,
    pub buyers_failed: u64,
    pub units_sold: u64,
    pub capped_allocations: u64,
    pub avg_run_time_ms: f64,
    pub slow_runs: u64,
}
