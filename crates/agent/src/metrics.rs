//! Engine-level metrics.
//!
//! Counters and gauges for the connection lifecycle and the NOTIFY/ACK loop,
//! plus a histogram of handler dispatch time. All values are plain atomics;
//! recording is lock free and safe from every connection task.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Metrics for one engine instance.
#[derive(Debug, Default)]
pub struct ProtocolMetrics {
    /// Connections accepted since start.
    pub connections_total: AtomicU64,
    /// Handshakes completed successfully.
    pub handshakes_total: AtomicU64,
    /// Frames fully read from peers.
    pub frames_total: AtomicU64,
    /// NOTIFY frames dispatched.
    pub notifies_total: AtomicU64,
    /// ACK frames written.
    pub acks_total: AtomicU64,
    /// Handler invocations that returned an error.
    pub handler_errors_total: AtomicU64,
    /// Connections closed on a protocol violation.
    pub protocol_errors_total: AtomicU64,
    /// Connections closed on the idle deadline.
    pub idle_timeouts_total: AtomicU64,

    /// Currently live connections.
    pub active_connections: AtomicU64,

    /// Handler dispatch time per message.
    pub dispatch_time: HistogramMetric,
}

impl ProtocolMetrics {
    /// Create zeroed metrics.
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn inc_connections(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn dec_active(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn inc_handshakes(&self) {
        self.handshakes_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn inc_frames(&self) {
        self.frames_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn inc_notifies(&self) {
        self.notifies_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn inc_acks(&self) {
        self.acks_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn inc_handler_errors(&self) {
        self.handler_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn inc_protocol_errors(&self) {
        self.protocol_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn inc_idle_timeouts(&self) {
        self.idle_timeouts_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_dispatch_time(&self, duration: Duration) {
        self.dispatch_time.record(duration);
    }

    /// Take a consistent-enough snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            handshakes_total: self.handshakes_total.load(Ordering::Relaxed),
            frames_total: self.frames_total.load(Ordering::Relaxed),
            notifies_total: self.notifies_total.load(Ordering::Relaxed),
            acks_total: self.acks_total.load(Ordering::Relaxed),
            handler_errors_total: self.handler_errors_total.load(Ordering::Relaxed),
            protocol_errors_total: self.protocol_errors_total.load(Ordering::Relaxed),
            idle_timeouts_total: self.idle_timeouts_total.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            dispatch_time: self.dispatch_time.snapshot(),
        }
    }

    /// Export all metrics in Prometheus text format.
    pub fn to_prometheus(&self, prefix: &str) -> String {
        let snap = self.snapshot();
        let mut output = String::with_capacity(1024);

        let counters = [
            ("connections_total", "Connections accepted", snap.connections_total),
            ("handshakes_total", "Handshakes completed", snap.handshakes_total),
            ("frames_total", "Frames read from peers", snap.frames_total),
            ("notifies_total", "NOTIFY frames dispatched", snap.notifies_total),
            ("acks_total", "ACK frames written", snap.acks_total),
            ("handler_errors_total", "Handler invocations that failed", snap.handler_errors_total),
            ("protocol_errors_total", "Connections closed on protocol errors", snap.protocol_errors_total),
            ("idle_timeouts_total", "Connections closed on the idle deadline", snap.idle_timeouts_total),
        ];
        for (name, help, value) in counters {
            output.push_str(&format!(
                "# HELP {prefix}_{name} {help}\n\
                 # TYPE {prefix}_{name} counter\n\
                 {prefix}_{name} {value}\n\n"
            ));
        }

        output.push_str(&format!(
            "# HELP {prefix}_active_connections Currently live connections\n\
             # TYPE {prefix}_active_connections gauge\n\
             {prefix}_active_connections {}\n\n",
            snap.active_connections
        ));

        output.push_str(&snap.dispatch_time.to_prometheus(
            &format!("{prefix}_dispatch_seconds"),
            "Handler dispatch time in seconds",
        ));

        output
    }
}

/// Point-in-time copy of [`ProtocolMetrics`].
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    /// Connections accepted since start.
    pub connections_total: u64,
    /// Handshakes completed successfully.
    pub handshakes_total: u64,
    /// Frames fully read from peers.
    pub frames_total: u64,
    /// NOTIFY frames dispatched.
    pub notifies_total: u64,
    /// ACK frames written.
    pub acks_total: u64,
    /// Handler invocations that returned an error.
    pub handler_errors_total: u64,
    /// Connections closed on a protocol violation.
    pub protocol_errors_total: u64,
    /// Connections closed on the idle deadline.
    pub idle_timeouts_total: u64,
    /// Currently live connections.
    pub active_connections: u64,
    /// Handler dispatch time per message.
    pub dispatch_time: HistogramSnapshot,
}

/// Number of finite latency buckets.
const BUCKET_COUNT: usize = 18;

/// Upper bound of bucket `index`, in microseconds.
///
/// Buckets double from 4µs, so the finite range tops out at 2^19µs (about
/// half a second). Anything slower is visible only in the running sum and
/// the `+Inf` series of the exposition.
const fn bucket_bound(index: usize) -> u64 {
    1 << (index + 2)
}

/// Dispatch-latency histogram over fixed power-of-two buckets.
///
/// Handler dispatch is the only series recorded here, so the bucket layout
/// is baked in rather than configurable: doubling bounds cover the span from
/// a no-op handler to one blocked on a remote lookup.
#[derive(Debug)]
pub struct HistogramMetric {
    counts: [AtomicU64; BUCKET_COUNT],
    sum: AtomicU64,
    count: AtomicU64,
}

impl Default for HistogramMetric {
    fn default() -> Self {
        Self {
            counts: std::array::from_fn(|_| AtomicU64::new(0)),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }
}

impl HistogramMetric {
    /// Record one observation.
    #[inline]
    pub fn record(&self, duration: Duration) {
        let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        self.sum.fetch_add(micros, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        if let Some(index) = (0..BUCKET_COUNT).find(|&i| micros <= bucket_bound(i)) {
            self.counts[index].fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Take a snapshot of the histogram.
    pub fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            counts: std::array::from_fn(|i| self.counts[i].load(Ordering::Relaxed)),
            sum: self.sum.load(Ordering::Relaxed),
            count: self.count.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of a [`HistogramMetric`].
#[derive(Debug, Clone)]
pub struct HistogramSnapshot {
    /// Counts per finite bucket; observations past the last bound appear
    /// only in `count` and `sum`.
    pub counts: [u64; BUCKET_COUNT],
    /// Sum of all observations in microseconds.
    pub sum: u64,
    /// Total count.
    pub count: u64,
}

impl HistogramSnapshot {
    /// Export in Prometheus histogram format.
    pub fn to_prometheus(&self, name: &str, help: &str) -> String {
        use std::fmt::Write as _;

        let mut out = String::with_capacity(512);
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} histogram");

        let mut cumulative = 0u64;
        for (index, count) in self.counts.iter().enumerate() {
            cumulative += count;
            let le = bucket_bound(index) as f64 / 1_000_000.0;
            let _ = writeln!(out, "{name}_bucket{{le=\"{le}\"}} {cumulative}");
        }
        // The +Inf series is the total; no separate overflow slot is kept.
        let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {}", self.count);
        let _ = writeln!(out, "{name}_sum {}", self.sum as f64 / 1_000_000.0);
        let _ = writeln!(out, "{name}_count {}", self.count);
        out.push('\n');
        out
    }

    /// Mean observation in microseconds.
    pub fn mean_micros(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum as f64 / self.count as f64
        }
    }
}
