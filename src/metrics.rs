use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Upper bounds (ms) of the latency histogram buckets; the last one is open.
const BUCKET_BOUNDS_MS: [f64; 8] = [1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0, f64::INFINITY];

pub struct EndpointMetrics {
    pub count: AtomicU64,
    pub total_duration_ms: AtomicU64,
    pub errors: AtomicU64,
    pub min_ms: AtomicU32,
    pub max_ms: AtomicU32,
    buckets: [AtomicU64; 8],
}

impl Default for EndpointMetrics {
    fn default() -> Self {
        Self {
            count: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            min_ms: AtomicU32::new(u32::MAX),
            max_ms: AtomicU32::new(0),
            buckets: Default::default(),
        }
    }
}

impl EndpointMetrics {
    pub fn record(&self, duration_ms: f64, is_error: bool) {
        let duration_ms_u32 = duration_ms as u32;

        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_duration_ms
            .fetch_add(duration_ms as u64, Ordering::Relaxed);
        if is_error {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }

        self.min_ms
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                (duration_ms_u32 < current).then_some(duration_ms_u32)
            })
            .ok();
        self.max_ms.fetch_max(duration_ms_u32, Ordering::Relaxed);

        let bucket = BUCKET_BOUNDS_MS
            .iter()
            .position(|bound| duration_ms <= *bound)
            .unwrap_or(BUCKET_BOUNDS_MS.len() - 1);
        self.buckets[bucket].fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> EndpointSnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let total_duration_ms = self.total_duration_ms.load(Ordering::Relaxed);
        let min_ms = self.min_ms.load(Ordering::Relaxed);
        let bucket_counts: Vec<u64> = self
            .buckets
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .collect();

        let (p50_ms, p95_ms, p99_ms) = calculate_percentiles(&bucket_counts, count);

        EndpointSnapshot {
            count,
            avg_ms: if count > 0 {
                total_duration_ms as f64 / count as f64
            } else {
                0.0
            },
            p50_ms,
            p95_ms,
            p99_ms,
            errors: self.errors.load(Ordering::Relaxed),
            min_ms: if min_ms == u32::MAX { 0 } else { min_ms },
            max_ms: self.max_ms.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
pub struct EndpointSnapshot {
    pub count: u64,
    pub avg_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub errors: u64,
    pub min_ms: u32,
    pub max_ms: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainEvent {
    ReservationCreated,
    Transition,
    PaymentApplied,
    RefundIssued,
    PricingIncident,
    RelaySessionCreated,
    RelaySessionExpired,
    RelayUpload,
}

pub struct Metrics {
    pub start_time: Instant,
    pub reservations: EndpointMetrics,
    pub payments: EndpointMetrics,
    pub substitution: EndpointMetrics,
    pub relay: EndpointMetrics,
    pub catalog: EndpointMetrics,
    pub auth: EndpointMetrics,
    pub total_requests: AtomicU64,
    pub reservations_created: AtomicU64,
    pub transitions: AtomicU64,
    pub payments_applied: AtomicU64,
    pub refunds_issued: AtomicU64,
    pub pricing_incidents: AtomicU64,
    pub relay_sessions_created: AtomicU64,
    pub relay_sessions_expired: AtomicU64,
    pub relay_uploads: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            start_time: Instant::now(),
            reservations: EndpointMetrics::default(),
            payments: EndpointMetrics::default(),
            substitution: EndpointMetrics::default(),
            relay: EndpointMetrics::default(),
            catalog: EndpointMetrics::default(),
            auth: EndpointMetrics::default(),
            total_requests: AtomicU64::new(0),
            reservations_created: AtomicU64::new(0),
            transitions: AtomicU64::new(0),
            payments_applied: AtomicU64::new(0),
            refunds_issued: AtomicU64::new(0),
            pricing_incidents: AtomicU64::new(0),
            relay_sessions_created: AtomicU64::new(0),
            relay_sessions_expired: AtomicU64::new(0),
            relay_uploads: AtomicU64::new(0),
        }
    }
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_request(&self, endpoint: &str, duration_ms: f64, is_error: bool) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        let endpoint_metrics = match endpoint {
            "reservations" => &self.reservations,
            "payments" => &self.payments,
            "substitution" => &self.substitution,
            "relay" => &self.relay,
            "catalog" => &self.catalog,
            "auth" => &self.auth,
            _ => return,
        };
        endpoint_metrics.record(duration_ms, is_error);
    }

    pub fn record(&self, event: DomainEvent) {
        self.record_n(event, 1);
    }

    pub fn record_n(&self, event: DomainEvent, n: u64) {
        let counter = match event {
            DomainEvent::ReservationCreated => &self.reservations_created,
            DomainEvent::Transition => &self.transitions,
            DomainEvent::PaymentApplied => &self.payments_applied,
            DomainEvent::RefundIssued => &self.refunds_issued,
            DomainEvent::PricingIncident => &self.pricing_incidents,
            DomainEvent::RelaySessionCreated => &self.relay_sessions_created,
            DomainEvent::RelaySessionExpired => &self.relay_sessions_expired,
            DomainEvent::RelayUpload => &self.relay_uploads,
        };
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Value {
        let uptime = self.start_time.elapsed().as_secs();
        let total_requests = self.total_requests.load(Ordering::Relaxed);
        let requests_per_second = if uptime > 0 {
            total_requests as f64 / uptime as f64
        } else {
            0.0
        };
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);

        json!({
            "uptime_seconds": uptime,
            "total_requests": total_requests,
            "requests_per_second": requests_per_second,
            "endpoints": {
                "reservations": endpoint_to_json(&self.reservations.snapshot()),
                "payments": endpoint_to_json(&self.payments.snapshot()),
                "substitution": endpoint_to_json(&self.substitution.snapshot()),
                "relay": endpoint_to_json(&self.relay.snapshot()),
                "catalog": endpoint_to_json(&self.catalog.snapshot()),
                "auth": endpoint_to_json(&self.auth.snapshot()),
            },
            "engine": {
                "reservations_created": load(&self.reservations_created),
                "transitions": load(&self.transitions),
                "payments_applied": load(&self.payments_applied),
                "refunds_issued": load(&self.refunds_issued),
                "pricing_incidents": load(&self.pricing_incidents),
            },
            "relay": {
                "sessions_created": load(&self.relay_sessions_created),
                "sessions_expired": load(&self.relay_sessions_expired),
                "uploads": load(&self.relay_uploads),
            },
            "memory_bytes": get_memory_usage(),
        })
    }
}

fn endpoint_to_json(snapshot: &EndpointSnapshot) -> Value {
    json!({
        "count": snapshot.count,
        "avg_ms": format!("{:.1}", snapshot.avg_ms),
        "p50_ms": format!("{:.1}", snapshot.p50_ms),
        "p95_ms": format!("{:.1}", snapshot.p95_ms),
        "p99_ms": format!("{:.1}", snapshot.p99_ms),
        "errors": snapshot.errors,
        "min_ms": snapshot.min_ms,
        "max_ms": snapshot.max_ms
    })
}

fn calculate_percentiles(bucket_counts: &[u64], total: u64) -> (f64, f64, f64) {
    if total == 0 {
        return (0.0, 0.0, 0.0);
    }

    let targets = [0.50, 0.95, 0.99].map(|q| ((total as f64 * q).ceil() as u64).max(1));
    let mut found = [None; 3];
    let mut cumulative = 0;

    for (i, &count) in bucket_counts.iter().enumerate() {
        cumulative += count;
        for (slot, target) in found.iter_mut().zip(targets) {
            if slot.is_none() && cumulative >= target {
                *slot = Some(BUCKET_BOUNDS_MS[i]);
            }
        }
    }

    let [p50, p95, p99] = found.map(|v| v.unwrap_or(0.0));
    (p50, p95, p99)
}

fn get_memory_usage() -> u64 {
    std::fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|content| {
            content
                .lines()
                .find(|line| line.starts_with("VmRSS:"))
                .and_then(|line| {
                    line.split_whitespace()
                        .nth(1)
                        .and_then(|kb| kb.parse::<u64>().ok())
                        .map(|kb| kb * 1024)
                })
        })
        .unwrap_or(0)
}

/// Groups a request path under the endpoint family it is reported as.
pub fn endpoint_from_path(path: &str) -> Option<&'static str> {
    if path.starts_with("/relay/") {
        Some("relay")
    } else if path.starts_with("/vehicles/") {
        Some("catalog")
    } else if path.starts_with("/auth/") {
        Some("auth")
    } else if path.starts_with("/reservations/")
        && (path.contains("/payments") || path.ends_with("/refund"))
    {
        Some("payments")
    } else if path.starts_with("/reservations/") && path.contains("/substitut") {
        Some("substitution")
    } else if path == "/reservations" || path.starts_with("/reservations/") {
        Some("reservations")
    } else {
        None
    }
}
