//! Scheduling metrics.
//!
//! In-process counters backed by atomics, with latency sums guarded by a
//! mutex, rendered into the Prometheus text exposition format on demand.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

/// Count and total seconds of an observed latency.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LatencyStats {
    pub count: u64,
    pub total_seconds: f64,
}

impl LatencyStats {
    fn observe(&mut self, duration: Duration) {
        self.count += 1;
        self.total_seconds += duration.as_secs_f64();
    }
}

/// Counters for the scheduling pipeline.
#[derive(Default)]
pub struct SchedulingMetrics {
    scheduled: AtomicU64,
    unschedulable: AtomicU64,
    errors: AtomicU64,
    /// Permit wait latency keyed by outcome ("Success", "Unschedulable", ...).
    permit_wait: Mutex<BTreeMap<String, LatencyStats>>,
    /// End-to-end latency of successful scheduling attempts.
    e2e: Mutex<LatencyStats>,
}

impl SchedulingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_scheduled(&self) {
        self.scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unschedulable(&self) {
        self.unschedulable.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_permit_wait(&self, result: &str, duration: Duration) {
        self.permit_wait
            .lock()
            .entry(result.to_string())
            .or_default()
            .observe(duration);
    }

    pub fn observe_e2e(&self, duration: Duration) {
        self.e2e.lock().observe(duration);
    }

    pub fn scheduled_count(&self) -> u64 {
        self.scheduled.load(Ordering::Relaxed)
    }

    pub fn unschedulable_count(&self) -> u64 {
        self.unschedulable.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn permit_wait_stats(&self, result: &str) -> LatencyStats {
        self.permit_wait
            .lock()
            .get(result)
            .copied()
            .unwrap_or_default()
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();

        out.push_str("# HELP berth_schedule_attempts_total Scheduling attempts by result.\n");
        out.push_str("# TYPE berth_schedule_attempts_total counter\n");
        for (result, value) in [
            ("scheduled", self.scheduled_count()),
            ("unschedulable", self.unschedulable_count()),
            ("error", self.error_count()),
        ] {
            out.push_str(&format!(
                "berth_schedule_attempts_total{{result=\"{result}\"}} {value}\n"
            ));
        }

        out.push_str("# HELP berth_permit_wait_duration_seconds Time tasks spent parked at Permit.\n");
        out.push_str("# TYPE berth_permit_wait_duration_seconds summary\n");
        for (result, stats) in self.permit_wait.lock().iter() {
            out.push_str(&format!(
                "berth_permit_wait_duration_seconds_count{{result=\"{result}\"}} {}\n",
                stats.count
            ));
            out.push_str(&format!(
                "berth_permit_wait_duration_seconds_sum{{result=\"{result}\"}} {:.6}\n",
                stats.total_seconds
            ));
        }

        let e2e = *self.e2e.lock();
        out.push_str("# HELP berth_e2e_scheduling_duration_seconds End-to-end scheduling latency.\n");
        out.push_str("# TYPE berth_e2e_scheduling_duration_seconds summary\n");
        out.push_str(&format!(
            "berth_e2e_scheduling_duration_seconds_count {}\n",
            e2e.count
        ));
        out.push_str(&format!(
            "berth_e2e_scheduling_duration_seconds_sum {:.6}\n",
            e2e.total_seconds
        ));

        out
    }
}
