// SPDX-License-Identifier: MIT
//
// PDF Sign Service: Multi-Tenant PDF Signing and Verification
// Copyright (c) 2025 PDF Sign Service Contributors
//
// https://github.com/pdfsign/pdfsign-service

//! Service counters rendered in Prometheus text format

use parking_lot::RwLock;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const LATENCY_WINDOW: usize = 10_000;

/// Shared metrics handle
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    start_time: Instant,

    jobs_created: AtomicU64,
    tasks_enqueued: AtomicU64,
    tasks_signed: AtomicU64,
    tasks_verified: AtomicU64,
    tasks_failed: AtomicU64,

    limiter_waits: AtomicU64,
    limiter_wait_millis: AtomicU64,

    checkpoints: AtomicU64,
    checkpoint_failures: AtomicU64,
    worker_restarts: AtomicU64,

    // Per-task processing time (microseconds)
    task_latencies: RwLock<Vec<u64>>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                start_time: Instant::now(),
                jobs_created: AtomicU64::new(0),
                tasks_enqueued: AtomicU64::new(0),
                tasks_signed: AtomicU64::new(0),
                tasks_verified: AtomicU64::new(0),
                tasks_failed: AtomicU64::new(0),
                limiter_waits: AtomicU64::new(0),
                limiter_wait_millis: AtomicU64::new(0),
                checkpoints: AtomicU64::new(0),
                checkpoint_failures: AtomicU64::new(0),
                worker_restarts: AtomicU64::new(0),
                task_latencies: RwLock::new(Vec::with_capacity(LATENCY_WINDOW)),
            }),
        }
    }

    pub fn record_job(&self) {
        self.inner.jobs_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_enqueue(&self) {
        self.inner.tasks_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_signed(&self, latency: Duration) {
        self.inner.tasks_signed.fetch_add(1, Ordering::Relaxed);
        self.record_latency(latency);
    }

    pub fn record_verified(&self, latency: Duration) {
        self.inner.tasks_verified.fetch_add(1, Ordering::Relaxed);
        self.record_latency(latency);
    }

    pub fn record_failed(&self, latency: Duration) {
        self.inner.tasks_failed.fetch_add(1, Ordering::Relaxed);
        self.record_latency(latency);
    }

    fn record_latency(&self, latency: Duration) {
        let mut latencies = self.inner.task_latencies.write();
        latencies.push(latency.as_micros() as u64);
        if latencies.len() > LATENCY_WINDOW {
            latencies.drain(0..LATENCY_WINDOW / 2);
        }
    }

    /// A worker was held back by the license rate limiter
    pub fn record_limiter_wait(&self, waited: Duration) {
        self.inner.limiter_waits.fetch_add(1, Ordering::Relaxed);
        self.inner
            .limiter_wait_millis
            .fetch_add(waited.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn record_checkpoint(&self) {
        self.inner.checkpoints.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_checkpoint_failure(&self) {
        self.inner.checkpoint_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_worker_restart(&self) {
        self.inner.worker_restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn jobs_created(&self) -> u64 {
        self.inner.jobs_created.load(Ordering::Relaxed)
    }

    pub fn tasks_enqueued(&self) -> u64 {
        self.inner.tasks_enqueued.load(Ordering::Relaxed)
    }

    pub fn tasks_signed(&self) -> u64 {
        self.inner.tasks_signed.load(Ordering::Relaxed)
    }

    pub fn tasks_verified(&self) -> u64 {
        self.inner.tasks_verified.load(Ordering::Relaxed)
    }

    pub fn tasks_failed(&self) -> u64 {
        self.inner.tasks_failed.load(Ordering::Relaxed)
    }

    pub fn limiter_waits(&self) -> u64 {
        self.inner.limiter_waits.load(Ordering::Relaxed)
    }

    pub fn checkpoints(&self) -> u64 {
        self.inner.checkpoints.load(Ordering::Relaxed)
    }

    pub fn checkpoint_failures(&self) -> u64 {
        self.inner.checkpoint_failures.load(Ordering::Relaxed)
    }

    pub fn worker_restarts(&self) -> u64 {
        self.inner.worker_restarts.load(Ordering::Relaxed)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.inner.start_time.elapsed().as_secs()
    }

    pub fn latency_percentile(&self, percentile: f64) -> Option<u64> {
        let latencies = self.inner.task_latencies.read();
        if latencies.is_empty() {
            return None;
        }

        let mut sorted = latencies.clone();
        sorted.sort_unstable();
        let index = ((sorted.len() as f64 * percentile).ceil() as usize).min(sorted.len() - 1);
        Some(sorted[index])
    }

    pub fn latency_p50(&self) -> Option<u64> {
        self.latency_percentile(0.50)
    }

    pub fn latency_p99(&self) -> Option<u64> {
        self.latency_percentile(0.99)
    }

    /// Generate Prometheus-compatible metrics output.
    ///
    /// `queues` lists `(unit, low, medium, high)` depths sampled by the caller.
    pub fn prometheus_format(&self, queues: &[(String, usize, usize, usize)]) -> String {
        let mut out = String::new();

        counter(&mut out, "jobs_created_total", "Jobs submitted", self.jobs_created());
        counter(&mut out, "tasks_enqueued_total", "Tasks placed on a unit queue", self.tasks_enqueued());
        counter(&mut out, "tasks_signed_total", "Tasks signed successfully", self.tasks_signed());
        counter(&mut out, "tasks_verified_total", "Tasks verified successfully", self.tasks_verified());
        counter(&mut out, "tasks_failed_total", "Tasks that ended in Failed", self.tasks_failed());
        counter(&mut out, "limiter_waits_total", "Times a worker waited on the rate limiter", self.limiter_waits());
        counter(
            &mut out,
            "limiter_wait_milliseconds_total",
            "Time workers spent waiting on the rate limiter",
            self.inner.limiter_wait_millis.load(Ordering::Relaxed),
        );
        counter(&mut out, "checkpoints_total", "Terminal job checkpoints written", self.checkpoints());
        counter(&mut out, "checkpoint_failures_total", "Checkpoints that could not be written", self.checkpoint_failures());
        counter(&mut out, "worker_restarts_total", "Workers restarted after a panic", self.worker_restarts());

        let _ = writeln!(out, "# HELP pdfsign_uptime_seconds Service uptime in seconds");
        let _ = writeln!(out, "# TYPE pdfsign_uptime_seconds gauge");
        let _ = writeln!(out, "pdfsign_uptime_seconds {}", self.uptime_seconds());

        if !queues.is_empty() {
            let _ = writeln!(out, "# HELP pdfsign_queue_depth Items waiting per unit and band");
            let _ = writeln!(out, "# TYPE pdfsign_queue_depth gauge");
            for (unit, low, medium, high) in queues {
                for (band, depth) in [("low", low), ("medium", medium), ("high", high)] {
                    let _ = writeln!(
                        out,
                        "pdfsign_queue_depth{{unit=\"{}\",band=\"{}\"}} {}",
                        unit, band, depth
                    );
                }
            }
        }

        if let Some(p50) = self.latency_p50() {
            let _ = writeln!(out, "# HELP pdfsign_task_latency_p50_microseconds Task processing time 50th percentile");
            let _ = writeln!(out, "# TYPE pdfsign_task_latency_p50_microseconds gauge");
            let _ = writeln!(out, "pdfsign_task_latency_p50_microseconds {}", p50);
        }

        if let Some(p99) = self.latency_p99() {
            let _ = writeln!(out, "# HELP pdfsign_task_latency_p99_microseconds Task processing time 99th percentile");
            let _ = writeln!(out, "# TYPE pdfsign_task_latency_p99_microseconds gauge");
            let _ = writeln!(out, "pdfsign_task_latency_p99_microseconds {}", p99);
        }

        out
    }
}

fn counter(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP pdfsign_{} {}", name, help);
    let _ = writeln!(out, "# TYPE pdfsign_{} counter", name);
    let _ = writeln!(out, "pdfsign_{} {}", name, value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_counters() {
        let metrics = Metrics::new();

        metrics.record_signed(Duration::from_micros(100));
        metrics.record_signed(Duration::from_micros(200));
        metrics.record_verified(Duration::from_micros(50));
        metrics.record_failed(Duration::from_micros(10));

        assert_eq!(metrics.tasks_signed(), 2);
        assert_eq!(metrics.tasks_verified(), 1);
        assert_eq!(metrics.tasks_failed(), 1);
    }

    #[test]
    fn test_latency_percentiles() {
        let metrics = Metrics::new();

        for i in 1..=100 {
            metrics.record_signed(Duration::from_micros(i));
        }

        let p50 = metrics.latency_p50().unwrap();
        assert!((45..=55).contains(&p50));

        let p99 = metrics.latency_p99().unwrap();
        assert!((95..=100).contains(&p99));
    }

    #[test]
    fn test_prometheus_output() {
        let metrics = Metrics::new();
        metrics.record_limiter_wait(Duration::from_millis(750));
        metrics.record_checkpoint();

        let text = metrics.prometheus_format(&[("simple".to_string(), 0, 2, 1)]);
        assert!(text.contains("pdfsign_limiter_waits_total 1"));
        assert!(text.contains("pdfsign_limiter_wait_milliseconds_total 750"));
        assert!(text.contains("pdfsign_checkpoints_total 1"));
        assert!(text.contains("pdfsign_queue_depth{unit=\"simple\",band=\"medium\"} 2"));
        assert!(!text.contains("latency"));
    }
}
