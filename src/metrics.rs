//! Dispatch loop metrics for monitoring and observability.
//!
//! Counters are atomics so a host thread can read a snapshot while the loop
//! runs.

use crate::dispatch::MessageClass;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Point-in-time copy of the loop counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopStats {
    /// Messages handed to the generic bus handler
    pub bus_messages: u64,
    /// Session accept requests and bind replies
    pub session_messages: u64,
    /// Messages on the application path
    pub app_messages: u64,
    /// Receive timeouts and interruptions
    pub idle_ticks: u64,
    /// Script handlers that completed
    pub handler_calls: u64,
    /// Script handlers that threw
    pub handler_failures: u64,
    /// Average script handler time in microseconds
    pub avg_handler_time_us: f64,
    /// Calls answered with a rejection because nothing handled them
    pub rejected_calls: u64,
    /// Replies with no registered callback
    pub unmatched_replies: u64,
    /// Replies sent by script code
    pub replies_sent: u64,
    /// Native calls by name
    pub native_calls: HashMap<String, u64>,
}

/// Metrics collector for the dispatch loop
pub struct LoopMetrics {
    bus_messages: AtomicU64,
    session_messages: AtomicU64,
    app_messages: AtomicU64,
    idle_ticks: AtomicU64,
    handler_calls: AtomicU64,
    handler_failures: AtomicU64,
    handler_time_us: AtomicU64,
    rejected_calls: AtomicU64,
    unmatched_replies: AtomicU64,
    replies_sent: AtomicU64,
    native_calls: parking_lot::Mutex<HashMap<String, u64>>,
}

impl LoopMetrics {
    /// Create a collector with all counters at zero
    pub fn new() -> Self {
        Self {
            bus_messages: AtomicU64::new(0),
            session_messages: AtomicU64::new(0),
            app_messages: AtomicU64::new(0),
            idle_ticks: AtomicU64::new(0),
            handler_calls: AtomicU64::new(0),
            handler_failures: AtomicU64::new(0),
            handler_time_us: AtomicU64::new(0),
            rejected_calls: AtomicU64::new(0),
            unmatched_replies: AtomicU64::new(0),
            replies_sent: AtomicU64::new(0),
            native_calls: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Record a received message
    pub fn record_message(&self, class: MessageClass) {
        let counter = match class {
            MessageClass::Bus => &self.bus_messages,
            MessageClass::AcceptSession | MessageClass::BindReply => &self.session_messages,
            MessageClass::App => &self.app_messages,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a receive timeout or interruption
    pub fn record_idle(&self) {
        self.idle_ticks.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a script handler invocation
    pub fn record_handler(&self, elapsed: Duration, success: bool) {
        self.handler_calls.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.handler_failures.fetch_add(1, Ordering::Relaxed);
        }
        self.handler_time_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    /// Record a call rejected for lack of a handler
    pub fn record_rejected_call(&self) {
        self.rejected_calls.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a reply nobody was waiting for
    pub fn record_unmatched_reply(&self) {
        self.unmatched_replies.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a reply or error reply sent by script code
    pub fn record_reply_sent(&self) {
        self.replies_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a native call
    pub fn record_native(&self, name: &str) {
        let mut calls = self.native_calls.lock();
        *calls.entry(name.to_string()).or_insert(0) += 1;
    }

    /// Average handler time in microseconds
    pub fn avg_handler_time_us(&self) -> f64 {
        let calls = self.handler_calls.load(Ordering::Relaxed);
        if calls == 0 {
            0.0
        } else {
            self.handler_time_us.load(Ordering::Relaxed) as f64 / calls as f64
        }
    }

    /// Copy all counters
    pub fn snapshot(&self) -> LoopStats {
        LoopStats {
            bus_messages: self.bus_messages.load(Ordering::Relaxed),
            session_messages: self.session_messages.load(Ordering::Relaxed),
            app_messages: self.app_messages.load(Ordering::Relaxed),
            idle_ticks: self.idle_ticks.load(Ordering::Relaxed),
            handler_calls: self.handler_calls.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            avg_handler_time_us: self.avg_handler_time_us(),
            rejected_calls: self.rejected_calls.load(Ordering::Relaxed),
            unmatched_replies: self.unmatched_replies.load(Ordering::Relaxed),
            replies_sent: self.replies_sent.load(Ordering::Relaxed),
            native_calls: self.native_calls.lock().clone(),
        }
    }

    /// Reset all counters
    pub fn reset(&self) {
        for counter in [
            &self.bus_messages,
            &self.session_messages,
            &self.app_messages,
            &self.idle_ticks,
            &self.handler_calls,
            &self.handler_failures,
            &self.handler_time_us,
            &self.rejected_calls,
            &self.unmatched_replies,
            &self.replies_sent,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.native_calls.lock().clear();
    }

    /// Export Prometheus-format metrics
    pub fn to_prometheus(&self) -> String {
        let stats = self.snapshot();
        let mut output = String::new();

        output.push_str("# HELP ajs_messages_total Messages received by class\n");
        output.push_str("# TYPE ajs_messages_total counter\n");
        for (class, count) in [
            ("bus", stats.bus_messages),
            ("session", stats.session_messages),
            ("app", stats.app_messages),
        ] {
            output.push_str(&format!(
                "ajs_messages_total{{class=\"{}\"}} {}\n",
                class, count
            ));
        }

        output.push_str("\n# HELP ajs_idle_ticks_total Receive timeouts and interruptions\n");
        output.push_str("# TYPE ajs_idle_ticks_total counter\n");
        output.push_str(&format!("ajs_idle_ticks_total {}\n", stats.idle_ticks));

        output.push_str("\n# HELP ajs_handler_calls_total Script handler invocations\n");
        output.push_str("# TYPE ajs_handler_calls_total counter\n");
        output.push_str(&format!(
            "ajs_handler_calls_total{{status=\"success\"}} {}\n",
            stats.handler_calls - stats.handler_failures
        ));
        output.push_str(&format!(
            "ajs_handler_calls_total{{status=\"error\"}} {}\n",
            stats.handler_failures
        ));

        output.push_str("\n# HELP ajs_handler_time_us Average script handler time\n");
        output.push_str("# TYPE ajs_handler_time_us gauge\n");
        output.push_str(&format!("ajs_handler_time_us {:.2}\n", stats.avg_handler_time_us));

        output.push_str("\n# HELP ajs_rejected_calls_total Calls rejected for lack of a handler\n");
        output.push_str("# TYPE ajs_rejected_calls_total counter\n");
        output.push_str(&format!("ajs_rejected_calls_total {}\n", stats.rejected_calls));

        output.push_str("\n# HELP ajs_unmatched_replies_total Replies with no registered callback\n");
        output.push_str("# TYPE ajs_unmatched_replies_total counter\n");
        output.push_str(&format!(
            "ajs_unmatched_replies_total {}\n",
            stats.unmatched_replies
        ));

        output.push_str("\n# HELP ajs_replies_sent_total Replies sent by script code\n");
        output.push_str("# TYPE ajs_replies_sent_total counter\n");
        output.push_str(&format!("ajs_replies_sent_total {}\n", stats.replies_sent));

        output.push_str("\n# HELP ajs_native_calls_total Native function calls\n");
        output.push_str("# TYPE ajs_native_calls_total counter\n");
        let mut natives: Vec<_> = stats.native_calls.into_iter().collect();
        natives.sort();
        for (name, count) in natives {
            output.push_str(&format!(
                "ajs_native_calls_total{{function=\"{}\"}} {}\n",
                name, count
            ));
        }

        output
    }
}

impl Default for LoopMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LoopMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopMetrics")
            .field("stats", &self.snapshot())
            .finish()
    }
}

/// Timer for one script handler invocation
pub struct HandlerTimer {
    start: Instant,
}

impl HandlerTimer {
    /// Start timing
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Record the elapsed time with the outcome
    pub fn finish(self, metrics: &LoopMetrics, success: bool) {
        metrics.record_handler(self.start.elapsed(), success);
    }
}
