use crate::error::ErrorKind;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

const DEFAULT_HISTORY: usize = 4096;
const SLOW_QUERY_TAIL: usize = 128;

/// One slow-query record. `payload` is pre-redacted by the caller (user
/// content truncated to the configured cap).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlowQueryRecord {
    pub kind: String,
    pub candidate_count: usize,
    pub returned_count: usize,
    pub wall_time_ms: u64,
    pub payload: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistogramSnapshot {
    pub count: usize,
    pub p50: u64,
    pub p95: u64,
    pub p99: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// requests_total keyed "method endpoint status".
    pub requests_total: HashMap<String, u64>,
    /// errors_total keyed by error kind.
    pub errors_total: HashMap<String, u64>,
    pub request_duration_ms: HistogramSnapshot,
    pub embed_latency_ms: HistogramSnapshot,
    pub queue_depth: u64,
    pub cache_bytes: u64,
    pub slow_queries: Vec<SlowQueryRecord>,
}

#[derive(Default)]
struct MetricsState {
    requests: HashMap<(String, String, u16), u64>,
    errors: HashMap<ErrorKind, u64>,
    request_durations: VecDeque<u64>,
    embed_latencies: VecDeque<u64>,
    queue_depth: u64,
    cache_bytes: u64,
    slow_queries: VecDeque<SlowQueryRecord>,
}

/// Process-wide counters, histograms, gauges, and the slow-query tail.
/// Passed in explicitly from the composition root; tests build their own.
#[derive(Clone)]
pub struct MetricsCollector {
    state: Arc<Mutex<MetricsState>>,
    max_history: usize,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY)
    }
}

impl MetricsCollector {
    pub fn new(max_history: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(MetricsState::default())),
            max_history,
        }
    }

    pub fn record_request(&self, method: &str, endpoint: &str, status: u16, duration_ms: u64) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *state
            .requests
            .entry((method.to_string(), endpoint.to_string(), status))
            .or_insert(0) += 1;
        state.request_durations.push_back(duration_ms);
        if state.request_durations.len() > self.max_history {
            state.request_durations.pop_front();
        }
    }

    pub fn record_error(&self, kind: ErrorKind) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *state.errors.entry(kind).or_insert(0) += 1;
    }

    pub fn record_embed_latency(&self, latency_ms: u64) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.embed_latencies.push_back(latency_ms);
        if state.embed_latencies.len() > self.max_history {
            state.embed_latencies.pop_front();
        }
    }

    pub fn set_queue_depth(&self, depth: u64) {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .queue_depth = depth;
    }

    pub fn set_cache_bytes(&self, bytes: u64) {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .cache_bytes = bytes;
    }

    pub fn record_slow_query(&self, record: SlowQueryRecord) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.slow_queries.push_back(record);
        if state.slow_queries.len() > SLOW_QUERY_TAIL {
            state.slow_queries.pop_front();
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        let requests_total = state
            .requests
            .iter()
            .map(|((method, endpoint, status), count)| {
                (format!("{method} {endpoint} {status}"), *count)
            })
            .collect();
        let errors_total = state
            .errors
            .iter()
            .map(|(kind, count)| (kind.to_string(), *count))
            .collect();

        MetricsSnapshot {
            requests_total,
            errors_total,
            request_duration_ms: histogram(&state.request_durations),
            embed_latency_ms: histogram(&state.embed_latencies),
            queue_depth: state.queue_depth,
            cache_bytes: state.cache_bytes,
            slow_queries: state.slow_queries.iter().cloned().collect(),
        }
    }
}

fn histogram(values: &VecDeque<u64>) -> HistogramSnapshot {
    let mut sorted: Vec<u64> = values.iter().copied().collect();
    sorted.sort_unstable();
    HistogramSnapshot {
        count: sorted.len(),
        p50: percentile(&sorted, 50.0),
        p95: percentile(&sorted, 95.0),
        p99: percentile(&sorted, 99.0),
    }
}

fn percentile(sorted: &[u64], p: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let idx = ((p / 100.0) * (sorted.len() as f64)).ceil() as usize;
    sorted[idx.saturating_sub(1).min(sorted.len() - 1)]
}
