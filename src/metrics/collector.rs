//! # Collector de Métricas
//! src/metrics/collector.rs
//!
//! Métricas del servidor en tiempo real: requests, latencias y contadores
//! del ciclo async (ciclos iniciados, completados, timeouts, errores...).

use crate::lifecycle::LifecycleEvent;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Máximo de latencias a guardar para calcular percentiles
const MAX_LATENCIES: usize = 10_000;

/// Collector de métricas thread-safe
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsData>>,
    start_time: Instant,
}

#[derive(Default)]
struct MetricsData {
    total_requests: u64,
    status_codes: HashMap<u16, u64>,

    /// Latencias en microsegundos (ventana de las últimas MAX_LATENCIES)
    latencies: VecDeque<u64>,

    requests_per_path: HashMap<String, u64>,
    active_connections: u64,
    lifecycle: LifecycleCounters,
}

/// Contadores del ciclo async
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct LifecycleCounters {
    pub cycles_started: u64,
    pub suspended: u64,
    pub dispatched: u64,
    pub completed: u64,
    pub timed_out: u64,
    pub errored: u64,
    pub listener_faults: u64,
}

/// Snapshot de métricas (para uso externo y para `/metrics`)
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub total_requests: u64,
    pub active_connections: u64,
    pub status_codes: HashMap<u16, u64>,
    pub top_paths: Vec<PathCount>,
    pub latency_us: LatencyStats,
    pub lifecycle: LifecycleCounters,
}

#[derive(Debug, Clone, Serialize)]
pub struct PathCount {
    pub path: String,
    pub count: u64,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct LatencyStats {
    pub p50: u64,
    pub p95: u64,
    pub p99: u64,
    pub avg: u64,
    pub stddev: f64,
    pub samples: usize,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsData::default())),
            start_time: Instant::now(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MetricsData> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registra una request terminada
    pub fn record_request(&self, path: &str, status_code: u16, latency: Duration) {
        let mut data = self.lock();

        data.total_requests += 1;
        *data.status_codes.entry(status_code).or_insert(0) += 1;

        if data.latencies.len() >= MAX_LATENCIES {
            data.latencies.pop_front();
        }
        data.latencies.push_back(latency.as_micros() as u64);

        *data.requests_per_path.entry(path.to_string()).or_insert(0) += 1;
    }

    /// Contabiliza un evento del ciclo async
    pub fn record_lifecycle(&self, event: LifecycleEvent) {
        let mut data = self.lock();
        let counters = &mut data.lifecycle;
        match event {
            LifecycleEvent::CycleStarted => counters.cycles_started += 1,
            LifecycleEvent::Suspended => counters.suspended += 1,
            LifecycleEvent::Dispatched => counters.dispatched += 1,
            LifecycleEvent::Completed => counters.completed += 1,
            LifecycleEvent::TimedOut => counters.timed_out += 1,
            LifecycleEvent::Errored => counters.errored += 1,
            LifecycleEvent::ListenerFault => counters.listener_faults += 1,
        }
    }

    pub fn increment_active_connections(&self) {
        self.lock().active_connections += 1;
    }

    pub fn decrement_active_connections(&self) {
        let mut data = self.lock();
        data.active_connections = data.active_connections.saturating_sub(1);
    }

    pub fn active_connections(&self) -> u64 {
        self.lock().active_connections
    }

    pub fn lifecycle(&self) -> LifecycleCounters {
        self.lock().lifecycle.clone()
    }

    /// Calcula (p50, p95, p99, avg)
    fn calculate_percentiles(latencies: &VecDeque<u64>) -> (u64, u64, u64, u64) {
        if latencies.is_empty() {
            return (0, 0, 0, 0);
        }

        let mut sorted: Vec<u64> = latencies.iter().copied().collect();
        sorted.sort_unstable();

        let len = sorted.len();
        let p50 = sorted[len * 50 / 100];
        let p95 = sorted[len * 95 / 100];
        let p99 = sorted[len * 99 / 100];
        let avg = sorted.iter().sum::<u64>() / len as u64;

        (p50, p95, p99, avg)
    }

    fn calculate_stddev(latencies: &VecDeque<u64>, avg: u64) -> f64 {
        if latencies.is_empty() {
            return 0.0;
        }

        let variance: f64 = latencies
            .iter()
            .map(|&x| {
                let diff = x as f64 - avg as f64;
                diff * diff
            })
            .sum::<f64>()
            / latencies.len() as f64;

        variance.sqrt()
    }

    pub fn get_snapshot(&self) -> MetricsSnapshot {
        let data = self.lock();
        let (p50, p95, p99, avg) = Self::calculate_percentiles(&data.latencies);

        // Top 10 rutas más accedidas
        let mut paths: Vec<PathCount> = data
            .requests_per_path
            .iter()
            .map(|(path, count)| PathCount {
                path: path.clone(),
                count: *count,
            })
            .collect();
        paths.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.path.cmp(&b.path)));
        paths.truncate(10);

        MetricsSnapshot {
            uptime_secs: self.start_time.elapsed().as_secs(),
            total_requests: data.total_requests,
            active_connections: data.active_connections,
            status_codes: data.status_codes.clone(),
            top_paths: paths,
            latency_us: LatencyStats {
                p50,
                p95,
                p99,
                avg,
                stddev: Self::calculate_stddev(&data.latencies, avg),
                samples: data.latencies.len(),
            },
            lifecycle: data.lifecycle.clone(),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self.get_snapshot()).unwrap_or(serde_json::Value::Null)
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
