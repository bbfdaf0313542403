use std::fmt::Write as _;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::NotFoundScope;

#[derive(Default)]
pub struct Metrics {
    pub patches_total: AtomicU64,
    pub patch_operations_total: AtomicU64,
    pub patch_not_found_total: AtomicU64,
    pub get_not_found_total: AtomicU64,
    pub patch_failures_total: AtomicU64,
    pub patch_duration_ms_sum: AtomicU64,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::default)
}

pub(crate) fn record_patch(operations: usize) {
    let m = metrics();
    m.patches_total.fetch_add(1, Ordering::Relaxed);
    m.patch_operations_total
        .fetch_add(operations as u64, Ordering::Relaxed);
}

/// Counted for every patch attempt, failed ones included.
pub(crate) fn record_duration(elapsed: Duration) {
    metrics()
        .patch_duration_ms_sum
        .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
}

pub(crate) fn record_not_found(scope: NotFoundScope) {
    let m = metrics();
    match scope {
        NotFoundScope::Patch => m.patch_not_found_total.fetch_add(1, Ordering::Relaxed),
        NotFoundScope::Get => m.get_not_found_total.fetch_add(1, Ordering::Relaxed),
    };
}

pub(crate) fn record_failure() {
    metrics()
        .patch_failures_total
        .fetch_add(1, Ordering::Relaxed);
}

pub fn render_prometheus() -> String {
    let m = metrics();
    let mut s = String::new();
    let _ = writeln!(
        s,
        "# TYPE patches_total counter\npatches_total {}",
        m.patches_total.load(Ordering::Relaxed)
    );
    let _ = writeln!(
        s,
        "# TYPE patch_operations_total counter\npatch_operations_total {}",
        m.patch_operations_total.load(Ordering::Relaxed)
    );
    // not-found, split by phase
    let _ = writeln!(
        s,
        "# TYPE patch_not_found_total counter\npatch_not_found_total{{phase=\"patch\"}} {}\npatch_not_found_total{{phase=\"get\"}} {}",
        m.patch_not_found_total.load(Ordering::Relaxed),
        m.get_not_found_total.load(Ordering::Relaxed)
    );
    let _ = writeln!(
        s,
        "# TYPE patch_failures_total counter\npatch_failures_total {}",
        m.patch_failures_total.load(Ordering::Relaxed)
    );
    let _ = writeln!(
        s,
        "# TYPE patch_duration_ms_sum counter\npatch_duration_ms_sum {}",
        m.patch_duration_ms_sum.load(Ordering::Relaxed)
    );
    s
}
