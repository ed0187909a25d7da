//! Observability and Metrics
//!
//! Atomic counters for the pipeline and the task manager. One `Metrics` instance is
//! created by the owner of the task manager and shared as `Arc<Metrics>` with every
//! pipeline it spawns.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Debug)]
pub struct Metrics {
    /// Pipelines spawned
    pub connections_total: AtomicU64,
    /// Pipelines currently running
    pub connections_active: AtomicU64,
    /// CSP and D2M logins completed
    pub handshakes_success: AtomicU64,
    /// Logins that failed
    pub handshakes_failed: AtomicU64,
    pub frames_sent: AtomicU64,
    pub frames_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub echo_requests: AtomicU64,
    pub echo_responses: AtomicU64,
    /// Last echo round trip in microseconds
    pub echo_rtt_micros: AtomicU64,
    pub tasks_scheduled: AtomicU64,
    pub tasks_completed: AtomicU64,
    pub tasks_failed: AtomicU64,
    pub tasks_retried: AtomicU64,
    pub tasks_aborted: AtomicU64,
    pub reflections_sent: AtomicU64,
    pub reflections_received: AtomicU64,
    /// Connections terminated by a fatal error
    pub protocol_errors: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            handshakes_success: AtomicU64::new(0),
            handshakes_failed: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            echo_requests: AtomicU64::new(0),
            echo_responses: AtomicU64::new(0),
            echo_rtt_micros: AtomicU64::new(0),
            tasks_scheduled: AtomicU64::new(0),
            tasks_completed: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            tasks_retried: AtomicU64::new(0),
            tasks_aborted: AtomicU64::new(0),
            reflections_sent: AtomicU64::new(0),
            reflections_received: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn connection_established(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn handshake_success(&self) {
        self.handshakes_success.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handshake_failed(&self) {
        self.handshakes_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an outbound frame with its length on the wire
    pub fn frame_sent(&self, byte_count: u64) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn frame_received(&self, byte_count: u64) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn echo_request(&self) {
        self.echo_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn echo_response(&self, rtt: Duration) {
        self.echo_responses.fetch_add(1, Ordering::Relaxed);
        self.echo_rtt_micros
            .store(u64::try_from(rtt.as_micros()).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    pub fn task_scheduled(&self) {
        self.tasks_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_completed(&self) {
        self.tasks_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_failed(&self) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_retried(&self) {
        self.tasks_retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_aborted(&self) {
        self.tasks_aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reflection_sent(&self) {
        self.reflections_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reflection_received(&self) {
        self.reflections_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            handshakes_success: self.handshakes_success.load(Ordering::Relaxed),
            handshakes_failed: self.handshakes_failed.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            echo_requests: self.echo_requests.load(Ordering::Relaxed),
            echo_responses: self.echo_responses.load(Ordering::Relaxed),
            echo_rtt_micros: self.echo_rtt_micros.load(Ordering::Relaxed),
            tasks_scheduled: self.tasks_scheduled.load(Ordering::Relaxed),
            tasks_completed: self.tasks_completed.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            tasks_retried: self.tasks_retried.load(Ordering::Relaxed),
            tasks_aborted: self.tasks_aborted.load(Ordering::Relaxed),
            reflections_sent: self.reflections_sent.load(Ordering::Relaxed),
            reflections_received: self.reflections_received.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            connections_active = snapshot.connections_active,
            handshakes_success = snapshot.handshakes_success,
            handshakes_failed = snapshot.handshakes_failed,
            frames_sent = snapshot.frames_sent,
            frames_received = snapshot.frames_received,
            echo_rtt_micros = snapshot.echo_rtt_micros,
            tasks_completed = snapshot.tasks_completed,
            tasks_failed = snapshot.tasks_failed,
            tasks_retried = snapshot.tasks_retried,
            reflections_sent = snapshot.reflections_sent,
            protocol_errors = snapshot.protocol_errors,
            uptime_seconds = snapshot.uptime_seconds,
            "Protocol metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub handshakes_success: u64,
    pub handshakes_failed: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub echo_requests: u64,
    pub echo_responses: u64,
    pub echo_rtt_micros: u64,
    pub tasks_scheduled: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_retried: u64,
    pub tasks_aborted: u64,
    pub reflections_sent: u64,
    pub reflections_received: u64,
    pub protocol_errors: u64,
    pub uptime_seconds: u64,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_counts() {
        let metrics = Metrics::new();
        metrics.connection_established();
        metrics.frame_sent(12);
        metrics.frame_sent(8);
        metrics.echo_response(Duration::from_millis(3));
        metrics.connection_closed();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connections_total, 1);
        assert_eq!(snapshot.connections_active, 0);
        assert_eq!(snapshot.frames_sent, 2);
        assert_eq!(snapshot.bytes_sent, 20);
        assert_eq!(snapshot.echo_rtt_micros, 3000);
    }
}
